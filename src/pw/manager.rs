use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;

use crate::pw::config::ManagerConfig;
use crate::pw::events::{Event, EventBus, EventHandler};
use crate::pw::fsm::{spawn_program, ProgramHandle};
use crate::pw::logger::SupervisorLogger;
use crate::pw::logrouter::LogRouter;
use crate::pw::program::{ProgramSnapshot, ProgramState};

/// Cadence of the evaluation loop.
pub const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// The supervisor controller: owns the program catalog, drives the periodic
/// evaluation loop and coordinates shutdown.
pub struct Manager {
    cfg: ManagerConfig,
    logger: SupervisorLogger,
    programs: Vec<ProgramHandle>,
    events: EventBus,
    stopping: Arc<AtomicBool>,
    done_tx: watch::Sender<bool>,
    done_rx: watch::Receiver<bool>,
}

impl Manager {
    /// Builds the catalog in declaration order and starts the event
    /// dispatcher, log router sinks and per-program state machine tasks.
    /// `extra_handlers` lets embedders subscribe to lifecycle events; the
    /// built-in event logger is always registered first.
    pub fn new(
        cfg: ManagerConfig,
        logger: SupervisorLogger,
        extra_handlers: Vec<EventHandler>,
    ) -> Manager {
        let stopping = Arc::new(AtomicBool::new(false));

        let mut handlers: Vec<EventHandler> = Vec::with_capacity(extra_handlers.len() + 1);
        {
            let log = logger.clone();
            handlers.push(Box::new(move |event: &Event| match &event.error {
                Some(err) => log.error(
                    "event",
                    event.program.as_deref(),
                    format!("{event} err={err}"),
                ),
                None => log.debug("event", event.program.as_deref(), event.to_string()),
            }));
        }
        handlers.extend(extra_handlers);
        let events = EventBus::start(handlers, logger.clone());

        let router = LogRouter::new(cfg.child_log_dir.clone(), logger.clone());
        let mut programs = Vec::with_capacity(cfg.programs.len());
        for def in &cfg.programs {
            let sinks = router.sinks_for(def);
            programs.push(spawn_program(
                def.clone(),
                sinks,
                events.sink(),
                logger.clone(),
                Arc::clone(&stopping),
            ));
        }

        let (done_tx, done_rx) = watch::channel(false);
        Manager {
            cfg,
            logger,
            programs,
            events,
            stopping,
            done_tx,
            done_rx,
        }
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.cfg
    }

    pub fn logger(&self) -> &SupervisorLogger {
        &self.logger
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Relaxed)
    }

    /// Events dropped by the bus because subscribers could not keep up.
    pub fn dropped_events(&self) -> u64 {
        self.events.dropped_events()
    }

    /// The periodic evaluation loop. One pass dispatches an evaluation to
    /// every program and waits for all of them (barrier) before sleeping.
    pub async fn run(&self) {
        self.logger.info(
            "manager",
            None,
            format!("supervising {} program(s)", self.programs.len()),
        );
        loop {
            let mut checks = JoinSet::new();
            for program in &self.programs {
                let program = program.clone();
                checks.spawn(async move { program.evaluate().await });
            }
            while checks.join_next().await.is_some() {}

            if self.stopping.load(Ordering::Relaxed) {
                let _ = self.done_tx.send(true);
                break;
            }
            tokio::time::sleep(TICK_INTERVAL).await;
        }
        self.logger.debug("manager", None, "mainloop exited");
    }

    /// Blocks until the tick loop has observed shutdown and exited.
    pub async fn wait(&self) {
        let mut rx = self.done_rx.clone();
        while !*rx.borrow() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    /// Stop all programs, gracefully or forcefully, and mark the manager as
    /// stopping; the tick loop exits on its next pass. Stops run
    /// concurrently and this returns when all of them have settled.
    pub async fn stop(&self, force: bool) {
        self.stopping.store(true, Ordering::Relaxed);

        let mut stops = JoinSet::new();
        for program in &self.programs {
            let program = program.clone();
            let log = self.logger.clone();
            stops.spawn(async move {
                if force {
                    log.warning("manager", Some(program.name()), "force stopping program");
                    program.force_stop().await;
                } else {
                    log.info("manager", Some(program.name()), "stopping program");
                    program.stop().await;
                }
            });
        }
        while stops.join_next().await.is_some() {}
        self.logger
            .info("manager", None, "all programs stopped, stopping manager");
    }

    pub fn programs(&self) -> Vec<ProgramSnapshot> {
        self.programs.iter().map(|p| p.snapshot()).collect()
    }

    pub fn program(&self, name: &str) -> Option<&ProgramHandle> {
        self.programs.iter().find(|p| p.name() == name)
    }

    pub fn programs_by_state(&self, states: &[ProgramState]) -> Vec<ProgramSnapshot> {
        self.programs
            .iter()
            .filter(|p| states.contains(&p.state()))
            .map(|p| p.snapshot())
            .collect()
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        ManagerSnapshot {
            version: Self::version().to_string(),
            logfile: self.cfg.logfile.clone(),
            loglevel: self.cfg.loglevel.to_string(),
            childlogdir: self.cfg.child_log_dir.clone(),
            stopping: self.is_stopping(),
            program_count: self.programs.len(),
            dropped_events: self.dropped_events(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub version: String,
    pub logfile: PathBuf,
    pub loglevel: String,
    pub childlogdir: PathBuf,
    pub stopping: bool,
    pub program_count: usize,
    pub dropped_events: u64,
}
