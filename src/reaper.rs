use std::{sync::Arc, time::Duration};

use tokio::{
    sync::broadcast,
    time::{interval, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::registry::BacklogRegistry;

pub const DEFAULT_TICK_SECONDS: u64 = 10;

/// Periodically expires backlogs whose current stage outlived its timeout.
/// Ticks never overlap; if a scan is still running when the next tick is
/// due, that tick is skipped.
pub async fn run(
    registry: Arc<BacklogRegistry>,
    mut cancel_rx: broadcast::Receiver<()>,
    tick: Duration,
) {
    let mut ticker = interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = cancel_rx.recv() => {
                info!("cancel signal received, exiting reaper");
                break;
            }
            _ = ticker.tick() => {
                let backlogs = registry.snapshot();
                debug!("reaper tick, {} backlogs to check", backlogs.len());
                for b in backlogs {
                    if !b.is_running() {
                        continue;
                    }
                    match b.is_expired() {
                        Ok((true, _)) => {
                            info!(
                                directive.id = b.directive.id,
                                backlog.id = b.id,
                                "backlog expired, setting status to timeout and deleting it"
                            );
                            if let Err(e) = b.handle_expiration() {
                                warn!(backlog.id = b.id, "error expiring backlog: {}", e);
                            }
                        }
                        Ok((false, seconds_left)) => {
                            trace!(backlog.id = b.id, "backlog will expire in {} seconds", seconds_left);
                        }
                        Err(e) => {
                            warn!(backlog.id = b.id, "cannot check expiration: {}", e);
                        }
                    }
                }
            }
        }
    }
}
