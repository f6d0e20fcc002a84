use std::path::PathBuf;

use autopilot_run::DEFAULT_SHUTDOWN_MARKER;

const DEFAULT_MAX_CACHE_SIZE: u64 = 5 * 1024 * 1024; // 5 MiB
const DEFAULT_TAIL_LOG_COUNT: usize = 5000;
const DEFAULT_WORKER_CONCURRENCY: usize = 4;

fn env_str(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_bool(name: &str) -> bool {
    std::env::var(name).is_ok_and(|v| {
        matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_usize(name: &str) -> Option<usize> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
}

fn env_list(name: &str) -> Vec<String> {
    std::env::var(name)
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

/// Worker configuration, read once from the environment at startup.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of the per-user workspace directories.
    pub workspaces_dir: PathBuf,
    /// Interpreter that runs the wrapped agent CLI.
    pub python_binary: String,
    /// Path to the agent CLI entry point.
    pub agent_cli_path: PathBuf,
    pub max_cache_size: u64,
    pub tail_log_count: usize,

    /// When set, skip the credential service and use `openai_local_key`.
    pub no_auth: bool,
    pub openai_local_key: String,
    pub session_api_url: String,
    pub session_api_user_path: String,

    /// Execution policy for the spawned agent.
    pub allow_code_execution: bool,
    pub execute_local_commands: bool,
    pub deny_commands: Vec<String>,
    pub allow_commands: Vec<String>,

    /// Phrase the agent prints on its second-to-last line when it finished on
    /// its own. A wording change in the agent is a compatibility break.
    pub shutdown_marker: String,

    pub worker_concurrency: usize,
    pub database_url: String,
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = std::env::var("DATABASE_URL")
            .map_err(|_| anyhow::anyhow!("DATABASE_URL is required"))?;

        Ok(Self {
            workspaces_dir: PathBuf::from(env_str("AUTOPILOT_WORKSPACES_DIR", "/workspaces")),
            python_binary: env_str("AUTOPILOT_PYTHON_BINARY", "python"),
            agent_cli_path: PathBuf::from(env_str("AUTOPILOT_AGENT_CLI", "/app/auto_gpt/cli.py")),
            max_cache_size: env_u64("AUTOPILOT_MAX_CACHE_SIZE")
                .map(|v| v.clamp(1024, 1024 * 1024 * 1024))
                .unwrap_or(DEFAULT_MAX_CACHE_SIZE),
            tail_log_count: env_usize("AUTOPILOT_TAIL_LOG_COUNT")
                .map(|v| v.clamp(10, 100_000))
                .unwrap_or(DEFAULT_TAIL_LOG_COUNT),
            no_auth: env_bool("AUTOPILOT_NO_AUTH"),
            openai_local_key: env_str("AUTOPILOT_OPENAI_LOCAL_KEY", ""),
            session_api_url: env_str("AUTOPILOT_SESSION_API_URL", "http://localhost"),
            session_api_user_path: env_str("AUTOPILOT_SESSION_API_USER_PATH", "/user"),
            allow_code_execution: env_bool("AUTOPILOT_ALLOW_CODE_EXECUTION"),
            execute_local_commands: env_bool("AUTOPILOT_EXECUTE_LOCAL_COMMANDS"),
            deny_commands: env_list("AUTOPILOT_DENY_COMMANDS"),
            allow_commands: env_list("AUTOPILOT_ALLOW_COMMANDS"),
            shutdown_marker: env_str("AUTOPILOT_SHUTDOWN_MARKER", DEFAULT_SHUTDOWN_MARKER),
            worker_concurrency: env_usize("AUTOPILOT_WORKER_CONCURRENCY")
                .map(|v| v.clamp(1, 64))
                .unwrap_or(DEFAULT_WORKER_CONCURRENCY),
            database_url,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_list_splits_and_trims() {
        // SAFETY: tests in this module are the only readers of this variable.
        unsafe { std::env::set_var("AUTOPILOT_TEST_LIST", "rm, sudo ,, shutdown") };
        assert_eq!(
            env_list("AUTOPILOT_TEST_LIST"),
            vec!["rm".to_string(), "sudo".to_string(), "shutdown".to_string()]
        );
    }

    #[test]
    fn env_list_empty_when_unset() {
        assert!(env_list("AUTOPILOT_TEST_LIST_UNSET").is_empty());
    }
}
