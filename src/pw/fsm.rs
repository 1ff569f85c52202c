use chrono::Local;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use crate::pw::error::ProgramError;
use crate::pw::events::{Event, EventSink};
use crate::pw::logger::SupervisorLogger;
use crate::pw::logrouter::ProgramSinks;
use crate::pw::program::{
    AutoRestart, ProgramDefinition, ProgramSnapshot, ProgramState, ProgramStatus,
};
use crate::pw::runner::{ExitNotice, ProgramRunner};
use crate::pw::scheduler::Schedule;

/// Commands accepted by a program's state machine task. Each program has
/// exactly one such task; it owns the runtime state, so transitions are
/// totally ordered per program and races between user actions and
/// spontaneous child exits are resolved by queue order.
enum ProgramCmd {
    Start { resp: oneshot::Sender<()> },
    Stop { resp: oneshot::Sender<()> },
    ForceStop { resp: oneshot::Sender<()> },
    Restart { resp: oneshot::Sender<()> },
    Evaluate { resp: oneshot::Sender<()> },
    Shutdown,
}

/// Shareable handle to one supervised program.
#[derive(Clone)]
pub struct ProgramHandle {
    def: Arc<ProgramDefinition>,
    status: Arc<RwLock<ProgramStatus>>,
    tx: mpsc::UnboundedSender<ProgramCmd>,
}

impl ProgramHandle {
    pub fn name(&self) -> &str {
        &self.def.name
    }

    pub fn definition(&self) -> &ProgramDefinition {
        &self.def
    }

    /// Cloned read view of the runtime state.
    pub fn status(&self) -> ProgramStatus {
        self.status.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn state(&self) -> ProgramState {
        self.status().state
    }

    pub fn snapshot(&self) -> ProgramSnapshot {
        ProgramSnapshot::new(&self.def, &self.status())
    }

    pub async fn start(&self) {
        self.call(|resp| ProgramCmd::Start { resp }).await;
    }

    pub async fn stop(&self) {
        self.call(|resp| ProgramCmd::Stop { resp }).await;
    }

    pub async fn force_stop(&self) {
        self.call(|resp| ProgramCmd::ForceStop { resp }).await;
    }

    pub async fn restart(&self) {
        self.call(|resp| ProgramCmd::Restart { resp }).await;
    }

    /// One pass of the evaluation policy; completes when the pass is done,
    /// which is what the tick barrier waits on.
    pub async fn evaluate(&self) {
        self.call(|resp| ProgramCmd::Evaluate { resp }).await;
    }

    /// Fire-and-forget variants for callers that only accept the action
    /// (the HTTP control surface).
    pub fn request_start(&self) {
        let (resp, _rx) = oneshot::channel();
        let _ = self.tx.send(ProgramCmd::Start { resp });
    }

    pub fn request_stop(&self) {
        let (resp, _rx) = oneshot::channel();
        let _ = self.tx.send(ProgramCmd::Stop { resp });
    }

    pub fn request_restart(&self) {
        let (resp, _rx) = oneshot::channel();
        let _ = self.tx.send(ProgramCmd::Restart { resp });
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(ProgramCmd::Shutdown);
    }

    async fn call(&self, make: impl FnOnce(oneshot::Sender<()>) -> ProgramCmd) {
        let (resp, rx) = oneshot::channel();
        if self.tx.send(make(resp)).is_ok() {
            let _ = rx.await;
        }
    }
}

/// Build the state machine task for one program and return its handle.
pub fn spawn_program(
    def: ProgramDefinition,
    sinks: ProgramSinks,
    events: EventSink,
    logger: SupervisorLogger,
    stopping: Arc<AtomicBool>,
) -> ProgramHandle {
    let def = Arc::new(def);
    let status = Arc::new(RwLock::new(ProgramStatus::default()));
    let (tx, rx) = mpsc::unbounded_channel();
    let (exit_tx, exit_rx) = mpsc::unbounded_channel();

    let schedule = def.schedule.as_deref().and_then(|expr| match Schedule::parse(expr) {
        Ok(s) => Some(s),
        Err(e) => {
            logger.warning("schedule", Some(&def.name), format!("{e}; schedule disabled"));
            None
        }
    });

    let mut fsm = ProgramFsm {
        def: Arc::clone(&def),
        status: Arc::clone(&status),
        runner: ProgramRunner::new(logger.clone()),
        sinks,
        schedule,
        epoch: 0,
        exit_tx,
        events,
        logger,
        stopping,
    };
    tokio::spawn(async move { fsm.run(rx, exit_rx).await });

    ProgramHandle { def, status, tx }
}

struct ProgramFsm {
    def: Arc<ProgramDefinition>,
    status: Arc<RwLock<ProgramStatus>>,
    runner: ProgramRunner,
    sinks: ProgramSinks,
    schedule: Option<Schedule>,
    /// Bumped whenever the current child stops being interesting; exit
    /// notices with an older epoch are stale and ignored.
    epoch: u64,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    events: EventSink,
    logger: SupervisorLogger,
    stopping: Arc<AtomicBool>,
}

impl ProgramFsm {
    async fn run(
        &mut self,
        mut rx: mpsc::UnboundedReceiver<ProgramCmd>,
        mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>,
    ) {
        loop {
            tokio::select! {
                cmd = rx.recv() => {
                    let Some(cmd) = cmd else { break };
                    match cmd {
                        ProgramCmd::Start { resp } => {
                            self.start().await;
                            let _ = resp.send(());
                        }
                        ProgramCmd::Stop { resp } => {
                            self.stop(true).await;
                            let _ = resp.send(());
                        }
                        ProgramCmd::ForceStop { resp } => {
                            self.stop(false).await;
                            let _ = resp.send(());
                        }
                        ProgramCmd::Restart { resp } => {
                            self.stop(true).await;
                            self.start().await;
                            let _ = resp.send(());
                        }
                        ProgramCmd::Evaluate { resp } => {
                            self.evaluate().await;
                            let _ = resp.send(());
                        }
                        ProgramCmd::Shutdown => break,
                    }
                }
                notice = exit_rx.recv() => {
                    let Some(notice) = notice else { break };
                    self.on_child_exited(notice).await;
                }
            }
        }
    }

    /// One pass of the periodic policy.
    async fn evaluate(&mut self) {
        if self.stopping.load(Ordering::Relaxed) {
            return;
        }
        let (state, started, retries) = {
            let st = self.read();
            (st.state, st.has_ever_been_started, st.process_retry_count)
        };
        match state {
            ProgramState::Stopped if self.def.auto_start && !started => {
                // Seed the scheduler so the first fire time is on record
                // before the first run.
                let _ = self.should_auto_restart(state);
                self.logger.debug(
                    "manager",
                    Some(&self.def.name),
                    "starting program for the first time",
                );
                self.start().await;
            }
            ProgramState::Exited => {
                if self.should_auto_restart(state) {
                    self.logger.debug(
                        "manager",
                        Some(&self.def.name),
                        "automatically restarting cleanly-exited program",
                    );
                    self.start().await;
                }
            }
            ProgramState::Backoff => {
                if self.should_auto_restart(state) {
                    self.logger.debug(
                        "manager",
                        Some(&self.def.name),
                        format!(
                            "automatically restarting after backoff (retry {}/{})",
                            retries, self.def.start_retries
                        ),
                    );
                    self.start().await;
                } else {
                    self.logger.debug(
                        "manager",
                        Some(&self.def.name),
                        format!(
                            "marking program fatal after {}/{} retries",
                            retries, self.def.start_retries
                        ),
                    );
                    self.stop_fatal().await;
                }
            }
            _ => {}
        }
    }

    /// Restart decision. A cron schedule takes precedence over
    /// `auto_restart`: the stored fire time advances as a side effect, so
    /// each due fire is reported exactly once.
    fn should_auto_restart(&mut self, current: ProgramState) -> bool {
        if let Some(schedule) = &self.schedule {
            let next = schedule.next_after(Local::now());
            let stored = self.read().next_scheduled_at;
            if next != stored {
                self.write(|st| st.next_scheduled_at = next);
                return true;
            }
            return false;
        }

        if matches!(current, ProgramState::Fatal | ProgramState::Stopped) {
            return false;
        }

        let st = self.read();
        match self.def.auto_restart {
            AutoRestart::Never => false,
            AutoRestart::Unexpected => {
                if self.def.is_expected_status(st.last_exit_status) {
                    false
                } else {
                    st.process_retry_count < self.def.start_retries
                }
            }
            AutoRestart::Always => st.process_retry_count < self.def.start_retries,
        }
    }

    /// Whether a start-window failure re-enters the retry cycle. The retry
    /// budget is deliberately not consulted here: every failed start that
    /// the policy would retry lands in BACKOFF, and the BACKOFF evaluation
    /// is the single place where the budget turns the program FATAL.
    fn restartable_after_start_failure(&mut self) -> bool {
        if self.schedule.is_some() {
            return self.should_auto_restart(ProgramState::Starting);
        }
        match self.def.auto_restart {
            AutoRestart::Never => false,
            AutoRestart::Always => true,
            AutoRestart::Unexpected => {
                !self.def.is_expected_status(self.read().last_exit_status)
            }
        }
    }

    /// STOPPED/EXITED/FATAL/BACKOFF -> STARTING -> RUNNING, or BACKOFF/FATAL
    /// when the child does not survive the start window. Starting a program
    /// that is already STARTING, RUNNING or STOPPING is a no-op.
    async fn start(&mut self) {
        let state = self.read().state;
        if !matches!(
            state,
            ProgramState::Stopped | ProgramState::Exited | ProgramState::Fatal | ProgramState::Backoff
        ) {
            return;
        }
        self.write(|st| st.has_ever_been_started = true);
        self.transition(ProgramState::Starting, None).await;

        match self.start_process().await {
            Ok(pid) => {
                self.logger.debug(
                    "program",
                    Some(&self.def.name),
                    format!("stayed up through the start window, pid={pid}"),
                );
                self.transition(ProgramState::Running, None).await;
            }
            Err(e) => {
                self.logger
                    .warning("program", Some(&self.def.name), format!("failed to start: {e}"));
                let next = if self.restartable_after_start_failure() {
                    ProgramState::Backoff
                } else {
                    ProgramState::Fatal
                };
                self.transition(next, Some(e.to_string())).await;
            }
        }
    }

    async fn start_process(&mut self) -> Result<i32, ProgramError> {
        self.epoch = self.epoch.wrapping_add(1);
        let pid = self
            .runner
            .spawn(&self.def, &self.sinks, self.epoch, self.exit_tx.clone())?;
        self.write(|st| {
            st.process_id = pid;
            st.last_started_at = Some(Local::now());
        });

        if self.def.start_seconds == 0 {
            return Ok(pid);
        }
        match self
            .runner
            .wait_exit(Duration::from_secs(self.def.start_seconds))
            .await
        {
            // Still alive after the window: a validated start.
            None => Ok(pid),
            Some(status) => {
                // The monitor's notice for this exit is handled right here;
                // invalidate it so the select loop does not see it again.
                self.epoch = self.epoch.wrapping_add(1);
                self.runner.clear();
                self.write(|st| {
                    st.last_exit_status = status;
                    st.last_exited_at = Some(Local::now());
                });
                Err(ProgramError::StartupExit { status })
            }
        }
    }

    /// User-initiated stop. Resets the retry budget, sends the configured
    /// signal (SIGKILL when `graceful` is false) and settles in STOPPED, or
    /// in FATAL when even SIGKILL is refused. No-op outside
    /// STARTING/RUNNING.
    async fn stop(&mut self, graceful: bool) {
        let state = self.read().state;
        if !matches!(state, ProgramState::Starting | ProgramState::Running) {
            return;
        }
        self.transition(ProgramState::Stopping, None).await;
        self.write(|st| st.process_retry_count = 0);

        let result = self.runner.stop(&self.def, graceful).await;
        // The stop path consumed the exit itself; whatever notice the
        // monitor queued is stale now.
        self.epoch = self.epoch.wrapping_add(1);
        match result {
            Ok(status) => {
                if let Some(status) = status {
                    self.write(|st| {
                        st.last_exit_status = status;
                        st.last_exited_at = Some(Local::now());
                    });
                }
                self.transition(ProgramState::Stopped, None).await;
            }
            Err(e) => {
                self.logger
                    .critical("program", Some(&self.def.name), e.to_string());
                self.runner.clear();
                self.transition(ProgramState::Fatal, Some(e.to_string())).await;
            }
        }
    }

    /// Exhausted retry budget lands here: stop whatever might be running,
    /// then mark FATAL.
    async fn stop_fatal(&mut self) {
        self.stop(true).await;
        self.transition(ProgramState::Fatal, None).await;
    }

    /// Spontaneous exit observed by the monitor.
    async fn on_child_exited(&mut self, notice: ExitNotice) {
        if notice.epoch != self.epoch {
            return;
        }
        self.runner.clear();
        self.write(|st| {
            st.last_exit_status = notice.status;
            st.last_exited_at = Some(Local::now());
        });

        // Exits during STARTING are consumed by the start window and exits
        // during STOPPING by the stop wait; only a RUNNING exit is decided
        // here.
        if self.read().state != ProgramState::Running {
            return;
        }
        if self.def.is_expected_status(notice.status) {
            self.transition(ProgramState::Exited, None).await;
        } else if self.should_auto_restart(ProgramState::Running) {
            self.transition(
                ProgramState::Backoff,
                Some(ProgramError::UnexpectedExit { status: notice.status }.to_string()),
            )
            .await;
        } else {
            self.transition(
                ProgramState::Fatal,
                Some(ProgramError::UnexpectedExit { status: notice.status }.to_string()),
            )
            .await;
        }
    }

    /// Apply a state transition, keeping the bookkeeping rules, and publish
    /// the transition event. Same-state transitions do nothing and publish
    /// nothing.
    async fn transition(&mut self, next: ProgramState, error: Option<String>) {
        let prev = self.read().state;
        if prev == next {
            return;
        }
        self.write(|st| {
            if next == ProgramState::Backoff {
                st.process_retry_count += 1;
            }
            if !next.holds_pid() {
                st.process_id = 0;
            }
            st.state = next;
        });
        self.logger.debug(
            "program",
            Some(&self.def.name),
            format!("state {prev} -> {next}"),
        );
        self.events
            .publish(Event::process_state(next, &self.def.name, error))
            .await;
    }

    fn read(&self) -> ProgramStatus {
        self.status.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn write(&self, apply: impl FnOnce(&mut ProgramStatus)) {
        let mut guard = self.status.write().unwrap_or_else(|p| p.into_inner());
        apply(&mut guard);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pw::command::CommandLine;
    use crate::pw::events::EventBus;
    use crate::pw::logger::LogLevel;
    use std::sync::Mutex;

    fn quiet() -> SupervisorLogger {
        SupervisorLogger::stderr_only(LogLevel::Critical)
    }

    fn fsm_for(def: ProgramDefinition) -> (ProgramFsm, Arc<Mutex<Vec<Event>>>) {
        let seen: Arc<Mutex<Vec<Event>>> = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = Arc::clone(&seen);
        let bus = EventBus::start(
            vec![Box::new(move |ev: &Event| {
                sink_seen.lock().unwrap().push(ev.clone());
            })],
            quiet(),
        );
        let (exit_tx, _exit_rx) = mpsc::unbounded_channel();
        let schedule = def
            .schedule
            .as_deref()
            .and_then(|expr| Schedule::parse(expr).ok());
        let fsm = ProgramFsm {
            def: Arc::new(def),
            status: Arc::new(RwLock::new(ProgramStatus::default())),
            runner: ProgramRunner::new(quiet()),
            sinks: ProgramSinks::discard(),
            schedule,
            epoch: 0,
            exit_tx,
            events: bus.sink(),
            logger: quiet(),
            stopping: Arc::new(AtomicBool::new(false)),
        };
        (fsm, seen)
    }

    fn def() -> ProgramDefinition {
        ProgramDefinition::new("t", CommandLine::Line("/bin/true".into()))
    }

    #[tokio::test]
    async fn backoff_entry_bumps_retry_count_and_clears_pid() {
        let (mut fsm, _seen) = fsm_for(def());
        fsm.write(|st| {
            st.state = ProgramState::Running;
            st.process_id = 1234;
        });
        fsm.transition(ProgramState::Backoff, None).await;
        let st = fsm.read();
        assert_eq!(st.state, ProgramState::Backoff);
        assert_eq!(st.process_retry_count, 1);
        assert_eq!(st.process_id, 0);
    }

    #[tokio::test]
    async fn pid_survives_running_to_stopping() {
        let (mut fsm, _seen) = fsm_for(def());
        fsm.write(|st| {
            st.state = ProgramState::Running;
            st.process_id = 1234;
        });
        fsm.transition(ProgramState::Stopping, None).await;
        assert_eq!(fsm.read().process_id, 1234);
        fsm.transition(ProgramState::Stopped, None).await;
        assert_eq!(fsm.read().process_id, 0);
    }

    #[tokio::test]
    async fn same_state_transition_publishes_nothing() {
        let (mut fsm, seen) = fsm_for(def());
        fsm.transition(ProgramState::Starting, None).await;
        fsm.transition(ProgramState::Starting, None).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        let events = seen.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].has_name("PROCESS_STATE_STARTING"));
        assert!(events[0].has_name("PROCESS_STATE"));
    }

    #[tokio::test]
    async fn never_policy_never_restarts() {
        let mut d = def();
        d.auto_restart = AutoRestart::Never;
        let (mut fsm, _seen) = fsm_for(d);
        fsm.write(|st| st.last_exit_status = 1);
        assert!(!fsm.should_auto_restart(ProgramState::Running));
        assert!(!fsm.should_auto_restart(ProgramState::Exited));
    }

    #[tokio::test]
    async fn unexpected_policy_checks_exit_codes_and_budget() {
        let mut d = def();
        d.auto_restart = AutoRestart::Unexpected;
        d.start_retries = 2;
        let (mut fsm, _seen) = fsm_for(d);

        fsm.write(|st| st.last_exit_status = 0);
        assert!(!fsm.should_auto_restart(ProgramState::Running));

        fsm.write(|st| st.last_exit_status = 1);
        assert!(fsm.should_auto_restart(ProgramState::Running));

        fsm.write(|st| st.process_retry_count = 2);
        assert!(!fsm.should_auto_restart(ProgramState::Backoff));
    }

    #[tokio::test]
    async fn fatal_and_stopped_veto_restart() {
        let mut d = def();
        d.auto_restart = AutoRestart::Always;
        let (mut fsm, _seen) = fsm_for(d);
        fsm.write(|st| st.last_exit_status = 1);
        assert!(!fsm.should_auto_restart(ProgramState::Fatal));
        assert!(!fsm.should_auto_restart(ProgramState::Stopped));
        assert!(fsm.should_auto_restart(ProgramState::Exited));
    }

    #[tokio::test]
    async fn schedule_advance_fires_once_per_boundary() {
        let mut d = def();
        d.auto_restart = AutoRestart::Never;
        d.schedule = Some("*/1 * * * *".to_string());
        let (mut fsm, _seen) = fsm_for(d);

        // First consult seeds the stored fire time.
        assert!(fsm.should_auto_restart(ProgramState::Exited));
        let seeded = fsm.read().next_scheduled_at.unwrap();
        assert!(seeded > Local::now());

        // Until that time arrives, no further fire is reported, regardless
        // of auto_restart (the schedule takes precedence).
        assert!(!fsm.should_auto_restart(ProgramState::Exited));
        assert!(!fsm.should_auto_restart(ProgramState::Exited));
    }

    #[tokio::test]
    async fn start_failure_retry_ignores_the_budget() {
        // An exhausted budget still routes a failed start through BACKOFF;
        // the BACKOFF evaluation is what turns it FATAL.
        let mut d = def();
        d.auto_restart = AutoRestart::Always;
        d.start_retries = 0;
        let (mut fsm, _seen) = fsm_for(d);
        assert!(fsm.restartable_after_start_failure());
        assert!(!fsm.should_auto_restart(ProgramState::Backoff));

        let mut d = def();
        d.auto_restart = AutoRestart::Never;
        let (mut fsm, _seen) = fsm_for(d);
        assert!(!fsm.restartable_after_start_failure());
    }

    #[tokio::test]
    async fn stale_exit_notice_is_discarded() {
        let (mut fsm, seen) = fsm_for(def());
        fsm.epoch = 5;
        fsm.write(|st| {
            st.state = ProgramState::Running;
            st.process_id = 77;
        });
        fsm.on_child_exited(ExitNotice { epoch: 4, status: 0 }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fsm.read().state, ProgramState::Running);
        assert_eq!(fsm.read().last_exit_status, -1);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn running_exit_routes_to_exited_backoff_or_fatal() {
        // Expected status -> EXITED.
        let (mut fsm, _) = fsm_for(def());
        fsm.write(|st| st.state = ProgramState::Running);
        fsm.on_child_exited(ExitNotice { epoch: 0, status: 0 }).await;
        assert_eq!(fsm.read().state, ProgramState::Exited);

        // Unexpected with budget -> BACKOFF.
        let mut d = def();
        d.auto_restart = AutoRestart::Always;
        let (mut fsm, _) = fsm_for(d);
        fsm.write(|st| st.state = ProgramState::Running);
        fsm.on_child_exited(ExitNotice { epoch: 0, status: 9 }).await;
        assert_eq!(fsm.read().state, ProgramState::Backoff);
        assert_eq!(fsm.read().last_exit_status, 9);

        // Unexpected without restart -> FATAL.
        let mut d = def();
        d.auto_restart = AutoRestart::Never;
        let (mut fsm, _) = fsm_for(d);
        fsm.write(|st| st.state = ProgramState::Running);
        fsm.on_child_exited(ExitNotice { epoch: 0, status: 9 }).await;
        assert_eq!(fsm.read().state, ProgramState::Fatal);
    }
}
