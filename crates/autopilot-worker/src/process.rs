use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};

use anyhow::Context;
use tokio::process::Command;

use crate::config::Settings;
use crate::line_reader::LineReader;
use crate::workspace::{self, AiSettings};

/// Command categories stripped from the agent unless code execution is
/// explicitly allowed by policy.
const CODE_EXECUTION_CATEGORY: &str = "autogpt.commands.execute_code";

/// Fully-formed invocation of the wrapped agent CLI: program, argv, and an
/// explicit environment. Nothing is inherited from the worker's environment
/// except the allow-listed interpreter path variables.
#[derive(Debug, Clone)]
pub struct AgentCommand {
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Build the agent command for one run.
///
/// Side effect: materializes the AI-settings and prompt-settings YAML files
/// in the workspace first. The agent only reads them at startup, so they must
/// exist before the spawn.
pub async fn build_agent_command(
    settings: &Settings,
    bot: &autopilot_db::entities::bots::Model,
    openai_key: &str,
) -> anyhow::Result<AgentCommand> {
    let ai_settings: AiSettings =
        serde_json::from_str(&bot.ai_settings_json).context("decode bot ai settings")?;
    let (ai_path, prompt_path) =
        workspace::write_settings_files(settings, bot.user_id, &ai_settings).await?;

    let args = vec![
        settings.agent_cli_path.display().to_string(),
        "-w".to_string(),
        workspace::workspace_dir(settings, bot.user_id)
            .display()
            .to_string(),
        "-C".to_string(),
        ai_path.display().to_string(),
        "-P".to_string(),
        prompt_path.display().to_string(),
        format!("--max-cache-size={}", settings.max_cache_size),
        "--skip-news".to_string(),
        "--skip-reprompt".to_string(),
    ];

    let mut disabled_command_categories: Vec<&str> = Vec::new();
    if !settings.allow_code_execution {
        disabled_command_categories.push(CODE_EXECUTION_CATEGORY);
    }

    let mut env = BTreeMap::new();
    env.insert("OPENAI_API_KEY".to_string(), openai_key.to_string());
    env.insert("FAST_TOKEN_LIMIT".to_string(), bot.fast_tokens.to_string());
    env.insert("SMART_TOKEN_LIMIT".to_string(), bot.smart_tokens.to_string());
    env.insert("FAST_LLM_MODEL".to_string(), bot.fast_engine.clone());
    env.insert("SMART_LLM_MODEL".to_string(), bot.smart_engine.clone());
    env.insert("IMAGE_SIZE".to_string(), bot.image_size.to_string());
    env.insert("USE_WEB_BROWSER".to_string(), "firefox".to_string());
    env.insert("WDM_PROGRESS_BAR".to_string(), "0".to_string());
    env.insert(
        "EXECUTE_LOCAL_COMMANDS".to_string(),
        settings.execute_local_commands.to_string(),
    );
    env.insert(
        "DISABLED_COMMAND_CATEGORIES".to_string(),
        disabled_command_categories.join(","),
    );
    env.insert("DENY_COMMANDS".to_string(), settings.deny_commands.join(","));
    env.insert(
        "ALLOW_COMMANDS".to_string(),
        settings.allow_commands.join(","),
    );

    // Interpreter search-path passthrough, nothing else leaks through.
    for key in ["PATH", "PYTHONPATH"] {
        if let Ok(v) = std::env::var(key) {
            env.insert(key.to_string(), v);
        }
    }

    Ok(AgentCommand {
        program: settings.python_binary.clone(),
        args,
        env,
    })
}

/// A spawned agent run: a line-by-line view of its combined output and, after
/// exit, the exit status.
pub struct AgentProcess {
    child: tokio::process::Child,
    pub output: LineReader<tokio::fs::File>,
}

impl AgentCommand {
    /// Spawn with stdout and stderr sharing one pipe. The agent logs to
    /// stderr, so a split stream would drop its output from the run log;
    /// merging at the fd level keeps the interleaving a terminal would show.
    pub fn spawn(&self) -> anyhow::Result<AgentProcess> {
        let (output_rx, output_tx) = std::io::pipe().context("create agent output pipe")?;
        let stderr_tx = output_tx.try_clone().context("clone agent output pipe")?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env_clear()
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(output_tx)
            .stderr(stderr_tx)
            // The queue's cancellation mechanism tears the job task down;
            // kill_on_drop makes that take the child with it.
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .with_context(|| format!("spawn agent: {}", self.program))?;

        // `cmd` drops at return, closing the parent's write ends; the read
        // end then sees EOF exactly when the child exits.
        let output = std::fs::File::from(OwnedFd::from(output_rx));
        Ok(AgentProcess {
            child,
            output: LineReader::new(tokio::fs::File::from_std(output)),
        })
    }
}

impl AgentProcess {
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for the child to exit. Call after draining the output.
    pub async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        self.child.wait().await
    }
}
