use chrono::{DateTime, Local};
use nix::sys::signal::Signal;
use serde::Serialize;
use std::path::PathBuf;

use crate::pw::command::CommandLine;

/// Exit codes considered expected when a program does not configure its own.
pub const DEFAULT_EXIT_CODES: &[i32] = &[0, 2];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProgramState {
    Stopped,
    Starting,
    Running,
    Backoff,
    Stopping,
    Exited,
    Fatal,
    Unknown,
}

impl ProgramState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProgramState::Stopped => "STOPPED",
            ProgramState::Starting => "STARTING",
            ProgramState::Running => "RUNNING",
            ProgramState::Backoff => "BACKOFF",
            ProgramState::Stopping => "STOPPING",
            ProgramState::Exited => "EXITED",
            ProgramState::Fatal => "FATAL",
            ProgramState::Unknown => "UNKNOWN",
        }
    }

    /// Terminal states require an external action to leave.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgramState::Stopped | ProgramState::Exited | ProgramState::Fatal
        )
    }

    /// States in which a live child process (and thus a pid) exists.
    pub fn holds_pid(&self) -> bool {
        matches!(
            self,
            ProgramState::Starting | ProgramState::Running | ProgramState::Stopping
        )
    }
}

impl std::fmt::Display for ProgramState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Symbolic stop signals and their OS mapping. Unrecognized symbols are a
/// configuration error; `KILL` is what escalation falls back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StopSignal {
    Term,
    Int,
    Hup,
    Quit,
    Usr1,
    Usr2,
    Kill,
}

impl StopSignal {
    /// Accepts the bare symbol or a `SIG`-prefixed spelling, any case.
    pub fn parse(s: &str) -> anyhow::Result<StopSignal> {
        let raw = s.trim().to_uppercase();
        let name = raw.strip_prefix("SIG").unwrap_or(&raw);
        let sig = match name {
            "TERM" => StopSignal::Term,
            "INT" => StopSignal::Int,
            "HUP" => StopSignal::Hup,
            "QUIT" => StopSignal::Quit,
            "USR1" => StopSignal::Usr1,
            "USR2" => StopSignal::Usr2,
            "KILL" => StopSignal::Kill,
            _ => anyhow::bail!("unsupported stopsignal: {s}"),
        };
        Ok(sig)
    }

    pub fn signal(&self) -> Signal {
        match self {
            StopSignal::Term => Signal::SIGTERM,
            StopSignal::Int => Signal::SIGINT,
            StopSignal::Hup => Signal::SIGHUP,
            StopSignal::Quit => Signal::SIGQUIT,
            StopSignal::Usr1 => Signal::SIGUSR1,
            StopSignal::Usr2 => Signal::SIGUSR2,
            StopSignal::Kill => Signal::SIGKILL,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StopSignal::Term => "TERM",
            StopSignal::Int => "INT",
            StopSignal::Hup => "HUP",
            StopSignal::Quit => "QUIT",
            StopSignal::Usr1 => "USR1",
            StopSignal::Usr2 => "USR2",
            StopSignal::Kill => "KILL",
        }
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal::Term
    }
}

impl std::fmt::Display for StopSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Restart policy for programs without a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoRestart {
    #[serde(rename = "false")]
    Never,
    #[serde(rename = "true")]
    Always,
    Unexpected,
}

impl AutoRestart {
    pub fn parse(s: &str) -> anyhow::Result<AutoRestart> {
        match s.trim().to_ascii_lowercase().as_str() {
            "false" | "never" => Ok(AutoRestart::Never),
            "true" | "always" => Ok(AutoRestart::Always),
            "unexpected" => Ok(AutoRestart::Unexpected),
            _ => anyhow::bail!("unknown autorestart value {s:?} (use false, true or unexpected)"),
        }
    }
}

impl Default for AutoRestart {
    fn default() -> Self {
        AutoRestart::Unexpected
    }
}

/// Declarative attributes of one supervised program. Immutable after
/// configuration load.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramDefinition {
    pub name: String,
    pub command: CommandLine,
    pub directory: Option<PathBuf>,
    /// Ordered KEY=VALUE pairs appended to the inherited environment.
    pub environment: Vec<(String, String)>,
    pub user: Option<String>,
    pub umask: Option<u32>,
    pub priority: i32,
    pub auto_start: bool,
    pub auto_restart: AutoRestart,
    pub start_seconds: u64,
    pub start_retries: u32,
    pub exit_codes: Vec<i32>,
    pub stop_signal: StopSignal,
    pub stop_wait_seconds: u64,
    pub stop_as_group: bool,
    pub kill_as_group: bool,
    pub redirect_stderr: bool,
    /// Path, or one of AUTO / NONE / STDOUT / STDERR.
    pub stdout_logfile: String,
    pub stdout_logfile_maxbytes: u64,
    pub stdout_logfile_backups: usize,
    pub stderr_logfile: String,
    pub stderr_logfile_maxbytes: u64,
    pub stderr_logfile_backups: usize,
    /// Optional cron expression; takes precedence over `auto_restart`.
    pub schedule: Option<String>,
}

pub(crate) const DEFAULT_LOGFILE_MAXBYTES: u64 = 50 * 1000 * 1000;
pub(crate) const DEFAULT_LOGFILE_BACKUPS: usize = 10;

impl ProgramDefinition {
    pub fn new(name: impl Into<String>, command: CommandLine) -> ProgramDefinition {
        ProgramDefinition {
            name: name.into(),
            command,
            directory: None,
            environment: Vec::new(),
            user: None,
            umask: None,
            priority: 999,
            auto_start: true,
            auto_restart: AutoRestart::default(),
            start_seconds: 1,
            start_retries: 3,
            exit_codes: DEFAULT_EXIT_CODES.to_vec(),
            stop_signal: StopSignal::default(),
            stop_wait_seconds: 10,
            stop_as_group: false,
            kill_as_group: false,
            redirect_stderr: false,
            stdout_logfile: "AUTO".to_string(),
            stdout_logfile_maxbytes: DEFAULT_LOGFILE_MAXBYTES,
            stdout_logfile_backups: DEFAULT_LOGFILE_BACKUPS,
            stderr_logfile: "AUTO".to_string(),
            stderr_logfile_maxbytes: DEFAULT_LOGFILE_MAXBYTES,
            stderr_logfile_backups: DEFAULT_LOGFILE_BACKUPS,
            schedule: None,
        }
    }

    /// An empty exit-code set falls back to the default {0, 2}.
    pub fn is_expected_status(&self, code: i32) -> bool {
        let codes: &[i32] = if self.exit_codes.is_empty() {
            DEFAULT_EXIT_CODES
        } else {
            &self.exit_codes
        };
        codes.contains(&code)
    }
}

/// Runtime state of one program. Written only by the owning state machine
/// task; everyone else reads a cloned view.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramStatus {
    pub state: ProgramState,
    /// 0 while no child exists.
    pub process_id: i32,
    pub last_started_at: Option<DateTime<Local>>,
    pub last_exited_at: Option<DateTime<Local>>,
    /// -1 until a first exit has been observed.
    pub last_exit_status: i32,
    pub process_retry_count: u32,
    pub has_ever_been_started: bool,
    pub next_scheduled_at: Option<DateTime<Local>>,
}

impl Default for ProgramStatus {
    fn default() -> Self {
        ProgramStatus {
            state: ProgramState::Stopped,
            process_id: 0,
            last_started_at: None,
            last_exited_at: None,
            last_exit_status: -1,
            process_retry_count: 0,
            has_ever_been_started: false,
            next_scheduled_at: None,
        }
    }
}

/// Read view of a program for queries and the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct ProgramSnapshot {
    pub name: String,
    pub state: ProgramState,
    pub process_id: i32,
    pub command: CommandLine,
    pub priority: i32,
    pub auto_start: bool,
    pub auto_restart: AutoRestart,
    pub schedule: Option<String>,
    pub last_started_at: Option<DateTime<Local>>,
    pub last_exited_at: Option<DateTime<Local>>,
    pub last_exit_status: i32,
    pub process_retry_count: u32,
    pub next_scheduled_at: Option<DateTime<Local>>,
}

impl ProgramSnapshot {
    pub fn new(def: &ProgramDefinition, status: &ProgramStatus) -> ProgramSnapshot {
        ProgramSnapshot {
            name: def.name.clone(),
            state: status.state,
            process_id: status.process_id,
            command: def.command.clone(),
            priority: def.priority,
            auto_start: def.auto_start,
            auto_restart: def.auto_restart,
            schedule: def.schedule.clone(),
            last_started_at: status.last_started_at,
            last_exited_at: status.last_exited_at,
            last_exit_status: status.last_exit_status,
            process_retry_count: status.process_retry_count,
            next_scheduled_at: status.next_scheduled_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signal_parsing_accepts_sig_prefix() {
        assert_eq!(StopSignal::parse("TERM").unwrap(), StopSignal::Term);
        assert_eq!(StopSignal::parse("sigusr1").unwrap(), StopSignal::Usr1);
        assert_eq!(StopSignal::parse(" kill ").unwrap(), StopSignal::Kill);
        assert!(StopSignal::parse("SIGSTOP").is_err());
    }

    #[test]
    fn signal_mapping() {
        assert_eq!(StopSignal::Term.signal(), Signal::SIGTERM);
        assert_eq!(StopSignal::Kill.signal(), Signal::SIGKILL);
        assert_eq!(StopSignal::Usr2.signal(), Signal::SIGUSR2);
    }

    #[test]
    fn expected_status_defaults_to_0_and_2() {
        let mut def = ProgramDefinition::new("p", CommandLine::Line("/bin/true".into()));
        assert!(def.is_expected_status(0));
        assert!(def.is_expected_status(2));
        assert!(!def.is_expected_status(1));

        def.exit_codes = vec![0, 3];
        assert!(def.is_expected_status(3));
        assert!(!def.is_expected_status(2));

        def.exit_codes = vec![];
        assert!(def.is_expected_status(2));
    }

    #[test]
    fn terminal_and_pid_state_sets() {
        assert!(ProgramState::Stopped.is_terminal());
        assert!(ProgramState::Exited.is_terminal());
        assert!(ProgramState::Fatal.is_terminal());
        assert!(!ProgramState::Backoff.is_terminal());
        assert!(ProgramState::Stopping.holds_pid());
        assert!(!ProgramState::Backoff.holds_pid());
    }
}
