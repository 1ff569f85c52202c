use chrono::Local;
use tokio::sync::mpsc;

/// Severity levels for supervisor log output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl LogLevel {
    pub fn parse(s: &str) -> anyhow::Result<LogLevel> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" | "notice" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warning),
            "error" => Ok(LogLevel::Error),
            "critical" => Ok(LogLevel::Critical),
            _ => anyhow::bail!("unknown log level {s:?} (use debug, info, warning or error)"),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARNING",
            LogLevel::Error => "ERROR",
            LogLevel::Critical => "CRITICAL",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Supervisor-side logging handle: formatted lines go to stderr and, when a
/// file writer is attached, to the rolling supervisor log. The handle is
/// passed in through constructors and cloned into tasks; there is no
/// process-wide logger state.
#[derive(Clone)]
pub struct SupervisorLogger {
    level: LogLevel,
    file_tx: Option<mpsc::UnboundedSender<String>>,
}

impl SupervisorLogger {
    pub fn new(level: LogLevel, file_tx: Option<mpsc::UnboundedSender<String>>) -> Self {
        SupervisorLogger { level, file_tx }
    }

    pub fn stderr_only(level: LogLevel) -> Self {
        SupervisorLogger {
            level,
            file_tx: None,
        }
    }

    pub fn level(&self) -> LogLevel {
        self.level
    }

    pub fn log(&self, level: LogLevel, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        if level < self.level {
            return;
        }
        let ts = Local::now().format("%Y-%m-%d_%H:%M:%S%.3f");
        let line = match program {
            Some(p) => format!("{ts} {level} [{component}] program={p} {}", msg.as_ref()),
            None => format!("{ts} {level} [{component}] {}", msg.as_ref()),
        };
        eprintln!("{line}");
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(line);
        }
    }

    pub fn debug(&self, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        self.log(LogLevel::Debug, component, program, msg);
    }

    pub fn info(&self, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        self.log(LogLevel::Info, component, program, msg);
    }

    pub fn warning(&self, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        self.log(LogLevel::Warning, component, program, msg);
    }

    pub fn error(&self, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        self.log(LogLevel::Error, component, program, msg);
    }

    pub fn critical(&self, component: &str, program: Option<&str>, msg: impl AsRef<str>) {
        self.log(LogLevel::Critical, component, program, msg);
    }
}
