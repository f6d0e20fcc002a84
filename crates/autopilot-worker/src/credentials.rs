use anyhow::Context;
use serde::Deserialize;

use crate::config::Settings;

/// What the user-data service returns for a `userdata` request. Only the
/// OpenAI key is in contract here; unknown fields are ignored.
#[derive(Debug, Deserialize)]
pub struct UserData {
    #[serde(default)]
    pub openai: Option<String>,
}

/// Client for the external auth/user-data backend.
pub struct AuthBackendClient {
    http: reqwest::Client,
    user_url: String,
}

impl AuthBackendClient {
    pub fn new(settings: &Settings) -> Self {
        Self {
            http: reqwest::Client::new(),
            user_url: format!(
                "{}{}",
                settings.session_api_url.trim_end_matches('/'),
                settings.session_api_user_path
            ),
        }
    }

    pub async fn get_userdata(&self, username: &str) -> anyhow::Result<UserData> {
        let resp = self
            .http
            .get(&self.user_url)
            .header("requesttype", "userdata:")
            .query(&[("user", username)])
            .send()
            .await
            .context("request userdata from auth backend")?
            .error_for_status()
            .context("auth backend rejected userdata request")?;

        resp.json::<UserData>()
            .await
            .context("decode userdata response")
    }
}

/// Resolve the API credential for one run: the configured local key when auth
/// is disabled, otherwise a lookup by username against the user-data service.
pub async fn resolve_openai_key(
    settings: &Settings,
    client: &AuthBackendClient,
    username: &str,
) -> anyhow::Result<String> {
    if settings.no_auth {
        return Ok(settings.openai_local_key.clone());
    }

    let data = client.get_userdata(username).await?;
    data.openai
        .filter(|key| !key.is_empty())
        .ok_or_else(|| anyhow::anyhow!("userdata response for {username} has no openai key"))
}
