/// Opaque identifier for a queued or running bot job.
///
/// Returned by the queue on enqueue and stored on the bot record; the only
/// thing callers may do with it later is request a best-effort abort.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct JobHandle(pub String);

impl JobHandle {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The phrase the wrapped agent prints on its second-to-last output line when
/// it shut down on its own. Overridable via config; a change in the agent's
/// wording is a compatibility break, not something to paper over silently.
pub const DEFAULT_SHUTDOWN_MARKER: &str = "Shutting down...";

/// Terminal classification of one bot run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum RunOutcome {
    /// Non-zero (or missing) exit code. Terminal, no re-enqueue.
    Failed,
    /// Clean exit and the shutdown marker was seen. Terminal.
    Finished,
    /// Clean exit without the marker: the agent paused awaiting the next
    /// authorized step, so the run budget decides whether to continue.
    Continuable,
}

/// Classify a finished run from its exit code and the second-to-last line the
/// stream reader retained.
///
/// Tie-break order is fixed: a bad exit code wins over everything, including a
/// marker that happened to be printed. A process killed without a clean exit
/// code (signal) counts as failed.
pub fn classify(exit_code: Option<i32>, second_to_last: Option<&str>, marker: &str) -> RunOutcome {
    match exit_code {
        Some(0) => {
            if second_to_last.is_some_and(|line| line.contains(marker)) {
                RunOutcome::Finished
            } else {
                RunOutcome::Continuable
            }
        }
        _ => RunOutcome::Failed,
    }
}
