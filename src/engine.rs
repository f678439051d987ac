use std::{
    panic::{catch_unwind, AssertUnwindSafe},
    sync::Arc,
    thread,
    time::Duration,
};

use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::{
    alarm::AlarmSink,
    asset::NetworkAssets,
    backlog::{Backlog, BacklogOpt},
    directive::Directive,
    event::NormalizedEvent,
    log_writer::LogWriter,
    reaper,
    registry::{BacklogRegistry, RemovalMsg},
    utils::IdGenerator,
};

const REMOVAL_QUEUE_SIZE: usize = 128;

pub struct EngineOpt {
    pub test_env: bool,
    pub assets: Arc<NetworkAssets>,
    pub cancel_tx: broadcast::Sender<()>,
    pub reap_interval: Duration,
    /// Overrides the ID generator seed; with `None` every engine in the
    /// process draws from the same fixed-seed stream.
    pub id_seed: Option<u64>,
}

/// Owns all correlation state: the backlog registry, the alarm sink, the ID
/// generator, and the removal queue. `new` opens the journal files and
/// starts the writer thread; `start` (from within a tokio runtime) spawns
/// the reaper and the removal consumer; `process` is the dispatcher entry
/// point and may be called concurrently.
pub struct Engine {
    registry: Arc<BacklogRegistry>,
    alarms: Arc<AlarmSink>,
    assets: Arc<NetworkAssets>,
    ids: IdGenerator,
    cancel_tx: broadcast::Sender<()>,
    reap_interval: Duration,
    removal_tx: mpsc::Sender<RemovalMsg>,
    removal_rx: Mutex<Option<mpsc::Receiver<RemovalMsg>>>,
}

impl Engine {
    pub fn new(opt: EngineOpt) -> Result<Engine> {
        let (mut log_writer, log_tx) = LogWriter::new(opt.test_env)?;
        let _ = thread::spawn(move || log_writer.listener());

        let (removal_tx, removal_rx) = mpsc::channel::<RemovalMsg>(REMOVAL_QUEUE_SIZE);
        Ok(Engine {
            registry: Arc::new(BacklogRegistry::new()),
            alarms: Arc::new(AlarmSink::new(log_tx)),
            assets: opt.assets,
            ids: match opt.id_seed {
                Some(seed) => IdGenerator::with_seed(seed),
                None => IdGenerator::default(),
            },
            cancel_tx: opt.cancel_tx,
            reap_interval: opt.reap_interval,
            removal_tx,
            removal_rx: Mutex::new(Some(removal_rx)),
        })
    }

    /// Spawns the reaper and the removal consumer. Must be called from
    /// within a tokio runtime, and only once.
    pub fn start(&self) -> Result<()> {
        let mut removal_rx = {
            let mut w = self.removal_rx.lock();
            w.take().ok_or_else(|| anyhow::anyhow!("engine already started"))?
        };

        let registry = self.registry.clone();
        let alarms = self.alarms.clone();
        let mut cancel_rx = self.cancel_tx.subscribe();
        let span = Span::current();
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        _ = cancel_rx.recv() => {
                            // drain pending removals before exiting
                            while let Ok(msg) = removal_rx.try_recv() {
                                registry.remove(&msg.id);
                                alarms.remove(&msg.id);
                            }
                            info!("cancel signal received, exiting removal consumer");
                            break;
                        }
                        Some(msg) = removal_rx.recv() => {
                            debug!(backlog.id = msg.id, msg.conn_id, "removal request received");
                            registry.remove(&msg.id);
                            alarms.remove(&msg.id);
                        }
                    }
                }
            }
            .instrument(span),
        );

        let registry = self.registry.clone();
        let cancel_rx = self.cancel_tx.subscribe();
        let tick = self.reap_interval;
        let span = Span::current();
        tokio::spawn(reaper::run(registry, cancel_rx, tick).instrument(span));

        info!("engine started, reap interval {}s", self.reap_interval.as_secs());
        Ok(())
    }

    /// Dispatches one `(event, directive)` candidate. A panic while
    /// processing is contained here so one malformed event cannot take the
    /// process down.
    pub fn process(&self, event: &NormalizedEvent, directive: &Directive) -> Result<()> {
        let res = catch_unwind(AssertUnwindSafe(|| self.dispatch(event, directive)));
        match res {
            Ok(r) => r,
            Err(_) => {
                error!(
                    directive.id = directive.id,
                    event.id, event.conn_id, "panic while processing event, skipping it"
                );
                Ok(())
            }
        }
    }

    fn dispatch(&self, event: &NormalizedEvent, directive: &Directive) -> Result<()> {
        let mut found = false;
        for b in self.registry.snapshot() {
            // each backlog is consulted on its current stage rule only;
            // past stage 1 that rule carries resolved, chain-specific
            // identifiers
            if b.directive.id != directive.id || !b.is_running() {
                continue;
            }
            let curr_rule = match b.current_rule() {
                Ok(r) => r,
                Err(e) => {
                    warn!(backlog.id = b.id, "cannot get the current rule: {}", e);
                    continue;
                }
            };
            if !curr_rule.does_event_match(&self.assets, event) {
                continue;
            }
            debug!(
                directive.id = directive.id,
                backlog.id = b.id,
                event.id,
                event.conn_id,
                "backlog matched, not creating a new one"
            );
            found = true;
            if let Err(e) = b.process_matched_event(event) {
                warn!(backlog.id = b.id, event.id, "error processing event: {}", e);
            }
        }
        if found {
            return Ok(());
        }
        self.create_backlog(event, directive)
    }

    fn create_backlog(&self, event: &NormalizedEvent, directive: &Directive) -> Result<()> {
        let backlog = match Backlog::new(BacklogOpt {
            id: self.ids.generate(),
            directive,
            event,
            asset: self.assets.clone(),
            alarms: self.alarms.clone(),
            removal_tx: self.removal_tx.clone(),
        }) {
            Ok(b) => b,
            Err(e) => {
                warn!(
                    directive.id = directive.id,
                    event.id, event.conn_id, "cannot create new backlog, dropping event: {}", e
                );
                return Ok(());
            }
        };
        let arced = Arc::new(backlog);
        arced.process_matched_event(event)?;
        self.registry.insert(arced);
        Ok(())
    }

    pub fn registry(&self) -> &Arc<BacklogRegistry> {
        &self.registry
    }

    pub fn alarms(&self) -> &Arc<AlarmSink> {
        &self.alarms
    }

    /// Diagnostic snapshot of all live backlogs.
    pub fn snapshot_json(&self) -> Result<String> {
        self.registry.snapshot_json()
    }
}
