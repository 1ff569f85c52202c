use thiserror::Error;

/// Errors produced inside the per-program lifecycle. The state machine
/// absorbs these and converts them into transitions + events; they are never
/// fatal to the supervisor itself.
#[derive(Debug, Error)]
pub enum ProgramError {
    /// The child could not be spawned at all (empty argv, exec failure, ...).
    #[error("spawn failed: {0}")]
    Spawn(String),

    /// The child exited inside the start window.
    #[error("exited during start window with status {status}")]
    StartupExit { status: i32 },

    /// The child exited with a status outside the configured exit codes.
    #[error("unexpected exit status {status}")]
    UnexpectedExit { status: i32 },

    /// SIGKILL did not yield termination within the kill-wait ceiling.
    #[error("process refused SIGKILL")]
    KillRefused,

    /// The configured cron expression could not be parsed.
    #[error("invalid schedule {expr:?}: {reason}")]
    Schedule { expr: String, reason: String },
}
