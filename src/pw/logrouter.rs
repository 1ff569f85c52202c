use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use anyhow::Context as _;

use crate::pw::logger::SupervisorLogger;
use crate::pw::program::ProgramDefinition;

static GZIP_MISSING_WARNED: AtomicBool = AtomicBool::new(false);

/// Which child stream a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Where a program stream's lines end up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    File(PathBuf),
    Stdout,
    Stderr,
    Discard,
}

/// Resolve a configured logfile spec. `AUTO` derives a path under the child
/// log directory; when stderr is redirected into stdout the derived name
/// collapses to `<program>.log`.
pub fn resolve_target(
    spec: &str,
    program: &str,
    stream: StreamKind,
    redirect_stderr: bool,
    child_log_dir: &Path,
) -> LogTarget {
    match spec.trim() {
        "" | "AUTO" => {
            let file = if redirect_stderr {
                format!("{program}.log")
            } else {
                match stream {
                    StreamKind::Stdout => format!("{program}_out.log"),
                    StreamKind::Stderr => format!("{program}_err.log"),
                }
            };
            LogTarget::File(child_log_dir.join(file))
        }
        "NONE" => LogTarget::Discard,
        "STDOUT" => LogTarget::Stdout,
        "STDERR" => LogTarget::Stderr,
        path => LogTarget::File(PathBuf::from(path)),
    }
}

/// One program's pair of output sinks.
pub struct ProgramSinks {
    pub stdout: LogSink,
    pub stderr: LogSink,
}

impl ProgramSinks {
    /// Sinks that swallow everything. Used where output does not matter.
    pub fn discard() -> ProgramSinks {
        ProgramSinks {
            stdout: LogSink {
                inner: SinkInner::Discard,
            },
            stderr: LogSink {
                inner: SinkInner::Discard,
            },
        }
    }
}

#[derive(Clone)]
pub struct LogSink {
    inner: SinkInner,
}

#[derive(Clone)]
enum SinkInner {
    File(mpsc::UnboundedSender<String>),
    Stdout,
    Stderr,
    Discard,
}

impl LogSink {
    pub fn send_line(&self, line: &str) {
        match &self.inner {
            SinkInner::File(tx) => {
                let _ = tx.send(line.to_string());
            }
            SinkInner::Stdout => println!("{line}"),
            SinkInner::Stderr => eprintln!("{line}"),
            SinkInner::Discard => {}
        }
    }
}

/// Routes per-program output to rolling files or the supervisor's own
/// stdio. Each resolved file gets exactly one writer task.
pub struct LogRouter {
    child_log_dir: PathBuf,
    logger: SupervisorLogger,
}

impl LogRouter {
    pub fn new(child_log_dir: PathBuf, logger: SupervisorLogger) -> LogRouter {
        LogRouter {
            child_log_dir,
            logger,
        }
    }

    pub fn sinks_for(&self, def: &ProgramDefinition) -> ProgramSinks {
        let stdout = self.sink_for(def, StreamKind::Stdout);
        let stderr = if def.redirect_stderr {
            stdout.clone()
        } else {
            self.sink_for(def, StreamKind::Stderr)
        };
        ProgramSinks { stdout, stderr }
    }

    fn sink_for(&self, def: &ProgramDefinition, stream: StreamKind) -> LogSink {
        let (spec, max_bytes, backups) = match stream {
            StreamKind::Stdout => (
                def.stdout_logfile.as_str(),
                def.stdout_logfile_maxbytes,
                def.stdout_logfile_backups,
            ),
            StreamKind::Stderr => (
                def.stderr_logfile.as_str(),
                def.stderr_logfile_maxbytes,
                def.stderr_logfile_backups,
            ),
        };
        let inner = match resolve_target(
            spec,
            &def.name,
            stream,
            def.redirect_stderr,
            &self.child_log_dir,
        ) {
            LogTarget::File(path) => SinkInner::File(spawn_rolling_writer(
                path,
                max_bytes,
                backups,
                self.logger.clone(),
            )),
            LogTarget::Stdout => SinkInner::Stdout,
            LogTarget::Stderr => SinkInner::Stderr,
            LogTarget::Discard => SinkInner::Discard,
        };
        LogSink { inner }
    }
}

/// Spawn the single writer task for one log file. Lines are appended with a
/// trailing newline; once the file reaches `max_bytes` it is rolled into
/// numbered backups (`file.1`, `file.2`, ...) and the rotated file is
/// compressed best-effort.
pub fn spawn_rolling_writer(
    path: PathBuf,
    max_bytes: u64,
    backups: usize,
    logger: SupervisorLogger,
) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut file = match open_append(&path).await {
            Ok(f) => f,
            Err(e) => {
                logger.error("log", None, format!("open {} failed: {e}", path.display()));
                return;
            }
        };
        let mut written = file.metadata().await.map(|m| m.len()).unwrap_or(0);
        while let Some(line) = rx.recv().await {
            if file.write_all(line.as_bytes()).await.is_err() {
                break;
            }
            if file.write_all(b"\n").await.is_err() {
                break;
            }
            written = written.saturating_add(line.len() as u64 + 1);

            if max_bytes > 0 && written >= max_bytes {
                let _ = file.flush().await;
                match rotate_numbered_reopen(&path, backups).await {
                    Ok(rotated) => {
                        if let Some(moved) = rotated.rotated {
                            compress_rotated_best_effort(&logger, moved);
                        }
                        file = rotated.file;
                        written = 0;
                    }
                    Err(e) => {
                        logger.error("log", None, format!("rotate {} failed: {e}", path.display()));
                    }
                }
            }
        }
        let _ = file.flush().await;
    });
    tx
}

async fn open_append(path: &Path) -> anyhow::Result<fs::File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .await
            .with_context(|| format!("create_dir_all {}", parent.display()))?;
    }
    let f = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("open log {}", path.display()))?;
    Ok(f)
}

struct RotatedReopen {
    file: fs::File,
    rotated: Option<PathBuf>,
}

/// base -> base.1 -> base.2 ... up to `backups`; the oldest falls off.
async fn rotate_numbered_reopen(base: &Path, backups: usize) -> anyhow::Result<RotatedReopen> {
    if backups == 0 {
        if fs::metadata(base).await.is_ok() {
            let _ = fs::remove_file(base).await;
        }
        let file = open_append(base).await?;
        return Ok(RotatedReopen {
            file,
            rotated: None,
        });
    }

    for suffix in ["", ".gz"] {
        let oldest = PathBuf::from(format!("{}.{}{}", base.display(), backups, suffix));
        if fs::metadata(&oldest).await.is_ok() {
            let _ = fs::remove_file(&oldest).await;
        }
    }

    for i in (1..backups).rev() {
        for suffix in ["", ".gz"] {
            let from = PathBuf::from(format!("{}.{}{}", base.display(), i, suffix));
            let to = PathBuf::from(format!("{}.{}{}", base.display(), i + 1, suffix));
            if fs::metadata(&from).await.is_ok() {
                let _ = fs::rename(&from, &to).await;
            }
        }
    }

    let to1 = PathBuf::from(format!("{}.1", base.display()));
    let rotated = if fs::metadata(base).await.is_ok() {
        let _ = fs::rename(base, &to1).await;
        Some(to1)
    } else {
        None
    };

    let file = open_append(base).await?;
    Ok(RotatedReopen { file, rotated })
}

fn compress_rotated_best_effort(logger: &SupervisorLogger, rotated: PathBuf) {
    if rotated.extension().and_then(|s| s.to_str()) == Some("gz") {
        return;
    }
    let logger = logger.clone();
    tokio::task::spawn_blocking(move || {
        if !rotated.exists() {
            return;
        }
        match std::process::Command::new("gzip").arg("-f").arg(&rotated).status() {
            Ok(st) if !st.success() => {
                logger.warning(
                    "log",
                    None,
                    format!("gzip_failed file={} status={st}", rotated.display()),
                );
            }
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if !GZIP_MISSING_WARNED.swap(true, Ordering::Relaxed) {
                    logger.warning(
                        "log",
                        None,
                        "gzip not found; rotated logs will not be compressed",
                    );
                }
            }
            Err(e) => {
                logger.warning(
                    "log",
                    None,
                    format!("gzip_error file={} err={e}", rotated.display()),
                );
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pw::command::CommandLine;
    use crate::pw::logger::LogLevel;
    use std::time::Duration;

    #[test]
    fn target_resolution() {
        let dir = Path::new("/var/log/procwatch");
        assert_eq!(
            resolve_target("AUTO", "web", StreamKind::Stdout, false, dir),
            LogTarget::File(dir.join("web_out.log"))
        );
        assert_eq!(
            resolve_target("AUTO", "web", StreamKind::Stderr, false, dir),
            LogTarget::File(dir.join("web_err.log"))
        );
        assert_eq!(
            resolve_target("AUTO", "web", StreamKind::Stdout, true, dir),
            LogTarget::File(dir.join("web.log"))
        );
        assert_eq!(
            resolve_target("NONE", "web", StreamKind::Stdout, false, dir),
            LogTarget::Discard
        );
        assert_eq!(
            resolve_target("STDOUT", "web", StreamKind::Stdout, false, dir),
            LogTarget::Stdout
        );
        assert_eq!(
            resolve_target("STDERR", "web", StreamKind::Stderr, false, dir),
            LogTarget::Stderr
        );
        assert_eq!(
            resolve_target("/tmp/x.log", "web", StreamKind::Stdout, false, dir),
            LogTarget::File(PathBuf::from("/tmp/x.log"))
        );
    }

    #[test]
    fn redirected_stderr_shares_the_stdout_sink() {
        let tmp = tempfile::tempdir().unwrap();
        let rt = tokio::runtime::Runtime::new().unwrap();
        let _guard = rt.enter();
        let router = LogRouter::new(
            tmp.path().to_path_buf(),
            SupervisorLogger::stderr_only(LogLevel::Critical),
        );
        let mut def = ProgramDefinition::new("web", CommandLine::Line("/bin/true".into()));
        def.redirect_stderr = true;
        let sinks = router.sinks_for(&def);
        // Both sinks feed the same file channel.
        match (&sinks.stdout.inner, &sinks.stderr.inner) {
            (SinkInner::File(a), SinkInner::File(b)) => assert!(a.same_channel(b)),
            _ => panic!("expected file sinks"),
        }
    }

    #[tokio::test]
    async fn numbered_rotation_shifts_backups() {
        let tmp = tempfile::tempdir().unwrap();
        let base = tmp.path().join("prog_out.log");
        fs::write(&base, b"current\n").await.unwrap();
        fs::write(format!("{}.1", base.display()), b"one\n")
            .await
            .unwrap();
        fs::write(format!("{}.2", base.display()), b"two\n")
            .await
            .unwrap();

        let rotated = rotate_numbered_reopen(&base, 2).await.unwrap();
        assert_eq!(rotated.rotated, Some(PathBuf::from(format!("{}.1", base.display()))));

        let one = fs::read_to_string(format!("{}.1", base.display())).await.unwrap();
        let two = fs::read_to_string(format!("{}.2", base.display())).await.unwrap();
        assert_eq!(one, "current\n");
        assert_eq!(two, "one\n");
        // "two" fell off the end.
        assert_eq!(fs::read_to_string(&base).await.unwrap(), "");
    }

    #[tokio::test]
    async fn writer_appends_lines_and_creates_parents() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested/dir/out.log");
        let tx = spawn_rolling_writer(
            path.clone(),
            0,
            0,
            SupervisorLogger::stderr_only(LogLevel::Critical),
        );
        tx.send("line one".to_string()).unwrap();
        tx.send("line two".to_string()).unwrap();
        drop(tx);
        // Give the writer task a moment to drain and flush.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if let Ok(text) = fs::read_to_string(&path).await {
                if text.lines().count() == 2 {
                    assert_eq!(text, "line one\nline two\n");
                    return;
                }
            }
        }
        panic!("writer did not flush both lines");
    }
}
