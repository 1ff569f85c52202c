use nix::sys::signal::{kill, Signal};
use nix::unistd::{getpgid, Pid};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;

use crate::pw::command;
use crate::pw::error::ProgramError;
use crate::pw::logger::SupervisorLogger;
use crate::pw::logrouter::{LogSink, ProgramSinks};
use crate::pw::program::ProgramDefinition;

/// Ceiling on the time waited for termination after SIGKILL.
pub const MAX_PROCESS_KILL_WAIT: Duration = Duration::from_secs(5);

/// Exit status recorded when the real status cannot be retrieved.
pub const STATUS_UNKNOWN: i32 = 254;

/// Sent to the owning state machine when the exit monitor observes
/// termination. Notices from a superseded child carry a stale epoch and are
/// discarded by the receiver.
#[derive(Debug, Clone, Copy)]
pub struct ExitNotice {
    pub epoch: u64,
    pub status: i32,
}

struct RunningChild {
    pid: i32,
    exit_rx: watch::Receiver<Option<i32>>,
}

/// Spawns and kills one program's child process. Owned by the program's
/// state machine task, so at most one child (and exactly one exit monitor)
/// exists at a time.
pub struct ProgramRunner {
    child: Option<RunningChild>,
    logger: SupervisorLogger,
}

impl ProgramRunner {
    pub fn new(logger: SupervisorLogger) -> ProgramRunner {
        ProgramRunner {
            child: None,
            logger,
        }
    }

    pub fn pid(&self) -> i32 {
        self.child.as_ref().map(|c| c.pid).unwrap_or(0)
    }

    pub fn has_child(&self) -> bool {
        self.child.is_some()
    }

    /// Drop the handle for a finished child.
    pub fn clear(&mut self) {
        self.child = None;
    }

    /// Spawn the child in its own process group and attach the line pumps
    /// and the exit monitor. The monitor is created here and nowhere else.
    pub fn spawn(
        &mut self,
        def: &ProgramDefinition,
        sinks: &ProgramSinks,
        epoch: u64,
        exit_tx: mpsc::UnboundedSender<ExitNotice>,
    ) -> Result<i32, ProgramError> {
        let argv = def
            .command
            .to_argv()
            .map_err(|e| ProgramError::Spawn(e.to_string()))?;

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd.process_group(0);
        if let Some(dir) = &def.directory {
            cmd.current_dir(command::expand_path(dir));
        }
        for (key, value) in &def.environment {
            cmd.env(key, value);
        }
        if let Some(user) = &def.user {
            if nix::unistd::geteuid().is_root() {
                let account = users::get_user_by_name(user.as_str())
                    .ok_or_else(|| ProgramError::Spawn(format!("unknown user {user:?}")))?;
                cmd.uid(account.uid()).gid(account.primary_group_id());
            } else {
                self.logger.debug(
                    "spawn",
                    Some(&def.name),
                    format!("not running as root, ignoring user={user}"),
                );
            }
        }
        if let Some(umask) = def.umask {
            unsafe {
                cmd.pre_exec(move || {
                    libc::umask(umask as libc::mode_t);
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .map_err(|e| ProgramError::Spawn(format!("{}: {e}", argv[0])))?;
        let pid = child.id().map(|p| p as i32).unwrap_or(0);

        if let Some(out) = child.stdout.take() {
            spawn_line_pump(out, sinks.stdout.clone());
        }
        if let Some(err) = child.stderr.take() {
            spawn_line_pump(err, sinks.stderr.clone());
        }

        let (status_tx, status_rx) = watch::channel::<Option<i32>>(None);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(st) => st
                    .code()
                    .or_else(|| st.signal().map(|sig| 128 + sig))
                    .unwrap_or(STATUS_UNKNOWN),
                Err(_) => STATUS_UNKNOWN,
            };
            let _ = status_tx.send(Some(status));
            let _ = exit_tx.send(ExitNotice { epoch, status });
        });

        self.child = Some(RunningChild {
            pid,
            exit_rx: status_rx,
        });
        Ok(pid)
    }

    /// Wait for the exit monitor to observe termination, up to `limit`.
    /// `Some(status)` when the child exited in time, `None` on timeout or
    /// when no child exists.
    pub async fn wait_exit(&mut self, limit: Duration) -> Option<i32> {
        let child = self.child.as_mut()?;
        if let Some(status) = *child.exit_rx.borrow() {
            return Some(status);
        }
        match timeout(limit, child.exit_rx.changed()).await {
            Ok(Ok(())) => *child.exit_rx.borrow(),
            _ => None,
        }
    }

    /// Signal-then-wait stop ladder. Graceful sends the configured stop
    /// signal and escalates to SIGKILL when the child outlives
    /// `stop_wait_seconds`; forced sends SIGKILL outright. `Ok(None)` means
    /// there was nothing to stop.
    pub async fn stop(
        &mut self,
        def: &ProgramDefinition,
        graceful: bool,
    ) -> Result<Option<i32>, ProgramError> {
        let Some(pid) = self.child.as_ref().map(|c| c.pid) else {
            return Ok(None);
        };
        let (signal, as_group) = if graceful {
            (def.stop_signal.signal(), def.stop_as_group)
        } else {
            (Signal::SIGKILL, def.kill_as_group)
        };
        self.logger.debug(
            "stop",
            Some(&def.name),
            format!("killing pid {pid} with signal {signal:?}"),
        );
        self.send_signal(def, pid, signal, as_group);

        let wait = if graceful {
            Duration::from_secs(def.stop_wait_seconds)
        } else {
            // SIGKILL gets a real window even when stopwaitsecs is tiny.
            Duration::from_secs(def.stop_wait_seconds.max(1)).min(MAX_PROCESS_KILL_WAIT)
        };
        match self.wait_exit(wait).await {
            Some(status) => {
                self.clear();
                Ok(Some(status))
            }
            None if graceful => {
                self.logger.warning(
                    "stop",
                    Some(&def.name),
                    "signal not handled in time, sending SIGKILL",
                );
                Box::pin(self.stop(def, false)).await
            }
            None => Err(ProgramError::KillRefused),
        }
    }

    /// Group signalling wants the child's pgid; when that lookup fails the
    /// signal goes to the process directly instead of erroring out.
    fn send_signal(&self, def: &ProgramDefinition, pid: i32, signal: Signal, as_group: bool) {
        if as_group {
            match getpgid(Some(Pid::from_raw(pid))) {
                Ok(pgid) if pgid.as_raw() > 0 => {
                    if kill(Pid::from_raw(-pgid.as_raw()), signal).is_ok() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    self.logger.debug(
                        "stop",
                        Some(&def.name),
                        format!("getpgid pid={pid} failed ({e}), signalling process directly"),
                    );
                }
            }
        }
        if let Err(e) = kill(Pid::from_raw(pid), signal) {
            self.logger.debug(
                "stop",
                Some(&def.name),
                format!("kill pid={pid} signal={signal:?} failed: {e}"),
            );
        }
    }
}

fn spawn_line_pump<R>(pipe: R, sink: LogSink)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(pipe).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            sink.send_line(&line);
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pw::command::CommandLine;
    use crate::pw::logger::LogLevel;
    use crate::pw::logrouter::ProgramSinks;

    fn runner() -> ProgramRunner {
        ProgramRunner::new(SupervisorLogger::stderr_only(LogLevel::Critical))
    }

    fn def(command: &str) -> ProgramDefinition {
        ProgramDefinition::new("t", CommandLine::Line(command.to_string()))
    }

    #[tokio::test]
    async fn spawn_reports_pid_and_exit_status() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut r = runner();
        let pid = r
            .spawn(&def("/bin/sh -c 'exit 7'"), &ProgramSinks::discard(), 1, tx)
            .unwrap();
        assert!(pid > 0);
        let notice = rx.recv().await.unwrap();
        assert_eq!(notice.epoch, 1);
        assert_eq!(notice.status, 7);
    }

    #[tokio::test]
    async fn spawn_failure_is_a_spawn_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut r = runner();
        let err = r
            .spawn(
                &def("/nonexistent/binary/path"),
                &ProgramSinks::discard(),
                1,
                tx,
            )
            .unwrap_err();
        assert!(matches!(err, ProgramError::Spawn(_)));
        assert_eq!(r.pid(), 0);
    }

    #[tokio::test]
    async fn wait_exit_times_out_while_child_lives() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut r = runner();
        r.spawn(&def("/bin/sleep 5"), &ProgramSinks::discard(), 1, tx)
            .unwrap();
        assert_eq!(r.wait_exit(Duration::from_millis(100)).await, None);
        // Clean up.
        let d = def("/bin/sleep 5");
        let _ = r.stop(&d, false).await;
    }

    #[tokio::test]
    async fn graceful_stop_delivers_the_configured_signal() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut r = runner();
        let d = def("/bin/sh -c 'trap \"exit 0\" TERM; while :; do sleep 0.05; done'");
        r.spawn(&d, &ProgramSinks::discard(), 1, tx).unwrap();
        // Let the shell install its trap.
        tokio::time::sleep(Duration::from_millis(150)).await;
        let status = r.stop(&d, true).await.unwrap();
        assert_eq!(status, Some(0));
        assert!(!r.has_child());
    }

    #[tokio::test]
    async fn stubborn_child_is_escalated_to_sigkill() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut r = runner();
        let mut d = def("/bin/sh -c 'trap \"\" TERM; while :; do sleep 0.05; done'");
        d.stop_wait_seconds = 1;
        r.spawn(&d, &ProgramSinks::discard(), 1, tx).unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        let started = std::time::Instant::now();
        let status = r.stop(&d, true).await.unwrap();
        assert!(started.elapsed() >= Duration::from_secs(1));
        // SIGKILL death surfaces as 128 + 9.
        assert_eq!(status, Some(137));
    }
}
