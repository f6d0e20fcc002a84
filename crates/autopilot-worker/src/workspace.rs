use std::path::PathBuf;

use anyhow::Context;
use sea_orm::prelude::Uuid;
use serde::{Deserialize, Serialize};

use crate::config::Settings;

/// Cache subdirectory the agent maintains inside a workspace. Excluded from
/// listings and cleared independently of user files.
pub const AGENT_CACHE_DIR: &str = ".gpt_cache";

/// Free-form bot configuration the agent CLI reads from its settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AiSettings {
    pub ai_goals: Vec<String>,
    pub ai_name: String,
    pub ai_role: String,
    #[serde(default)]
    pub api_budget: f64,
}

/// Fixed prompt scaffolding written next to the AI settings before each spawn.
#[derive(Debug, Clone, Serialize)]
pub struct PromptSettings {
    pub constraints: Vec<String>,
    pub resources: Vec<String>,
    pub performance_evaluations: Vec<String>,
}

impl Default for PromptSettings {
    fn default() -> Self {
        Self {
            constraints: vec![
                "~4000 word limit for short term memory. Your short term memory is short, \
                 so immediately save important information to files."
                    .to_string(),
                "If you are unsure how you previously did something or want to recall past \
                 events, thinking about similar events will help you remember."
                    .to_string(),
                "No user assistance".to_string(),
                "Exclusively use the commands listed below e.g. command_name".to_string(),
            ],
            resources: vec![
                "Internet access for searches and information gathering.".to_string(),
                "Long Term memory management.".to_string(),
                "GPT-3.5 powered Agents for delegation of simple tasks.".to_string(),
                "File output.".to_string(),
            ],
            performance_evaluations: vec![
                "Continuously review and analyze your actions to ensure you are performing to \
                 the best of your abilities."
                    .to_string(),
                "Constructively self-criticize your big-picture behavior constantly.".to_string(),
                "Reflect on past decisions and strategies to refine your approach.".to_string(),
                "Every command has a cost, so be smart and efficient. Aim to complete tasks in \
                 the least number of steps."
                    .to_string(),
                "Write all code to a file.".to_string(),
            ],
        }
    }
}

fn user_key(user_id: Uuid) -> String {
    format!("user_{user_id}")
}

/// Per-user workspace directory the agent runs in.
pub fn workspace_dir(settings: &Settings, user_id: Uuid) -> PathBuf {
    settings.workspaces_dir.join(user_key(user_id))
}

pub fn ai_settings_path(settings: &Settings, user_id: Uuid) -> PathBuf {
    settings
        .workspaces_dir
        .join(format!("{}.yaml", user_key(user_id)))
}

pub fn prompt_settings_path(settings: &Settings, user_id: Uuid) -> PathBuf {
    settings
        .workspaces_dir
        .join(format!("{}_prompt.yaml", user_key(user_id)))
}

pub fn log_path(settings: &Settings, user_id: Uuid) -> PathBuf {
    settings
        .workspaces_dir
        .join(format!("{}.log", user_key(user_id)))
}

/// Serialize the bot's AI settings and the fixed prompt template to their
/// on-disk YAML files. Must happen before every spawn; the agent only reads
/// these at startup.
pub async fn write_settings_files(
    settings: &Settings,
    user_id: Uuid,
    ai_settings: &AiSettings,
) -> anyhow::Result<(PathBuf, PathBuf)> {
    tokio::fs::create_dir_all(workspace_dir(settings, user_id))
        .await
        .context("create workspace dir")?;

    let ai_path = ai_settings_path(settings, user_id);
    let ai_yaml = serde_yaml::to_string(ai_settings).context("serialize ai settings")?;
    tokio::fs::write(&ai_path, ai_yaml)
        .await
        .context("write ai settings file")?;

    let prompt_path = prompt_settings_path(settings, user_id);
    let prompt_yaml =
        serde_yaml::to_string(&PromptSettings::default()).context("serialize prompt settings")?;
    tokio::fs::write(&prompt_path, prompt_yaml)
        .await
        .context("write prompt settings file")?;

    Ok((ai_path, prompt_path))
}

pub async fn clear_workspace(settings: &Settings, user_id: Uuid) {
    let dir = workspace_dir(settings, user_id);
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

pub async fn clear_workspace_cache(settings: &Settings, user_id: Uuid) {
    let dir = workspace_dir(settings, user_id).join(AGENT_CACHE_DIR);
    let _ = tokio::fs::remove_dir_all(&dir).await;
}

pub async fn remove_log(settings: &Settings, user_id: Uuid) {
    let _ = tokio::fs::remove_file(log_path(settings, user_id)).await;
}
