use std::{collections::HashMap, net::IpAddr};

use parking_lot::RwLock;
use serde_derive::Serialize;
use tracing::{debug, trace, warn};

use crate::{
    log_writer::{FileType, LogWriterMessage},
    rule::RuleStatus,
};

/// One line in the alarm-event journal, linking a matched event to the
/// backlog stage that consumed it.
#[derive(Serialize, Clone, Debug)]
pub struct SiemAlarmEvent {
    #[serde(rename(serialize = "alarm_id"))]
    pub id: String,
    pub stage: u8,
    pub event_id: String,
}

/// Externally visible projection of a backlog, keyed by backlog ID.
#[derive(Serialize, Clone, Debug, PartialEq)]
pub struct Alarm {
    #[serde(rename(serialize = "alarm_id"))]
    pub id: String,
    pub title: String,
    pub status: RuleStatus,
    pub kingdom: String,
    pub category: String,
    pub directive_id: u64,
    pub risk: u8,
    pub current_stage: u8,
    pub highest_stage: u8,
    pub status_time: i64,
    pub src_ips: Vec<IpAddr>,
    pub dst_ips: Vec<IpAddr>,
}

/// Derived alarm store. Upserts and removals are idempotent; every accepted
/// upsert is also appended to the alarm journal through the log writer.
#[cfg_attr(test, derive(Debug))]
pub struct AlarmSink {
    alarms: RwLock<HashMap<String, Alarm>>,
    log_tx: crossbeam_channel::Sender<LogWriterMessage>,
}

impl AlarmSink {
    pub fn new(log_tx: crossbeam_channel::Sender<LogWriterMessage>) -> Self {
        AlarmSink { alarms: RwLock::new(HashMap::new()), log_tx }
    }

    pub fn upsert(&self, alarm: Alarm) {
        // an alarm is the projection of a backlog whose risk became
        // meaningful
        if alarm.risk == 0 {
            trace!(alarm.id, "risk is zero, skip updating alarm");
            return;
        }
        let mut w = self.alarms.write();
        if let Some(existing) = w.get(&alarm.id) {
            if *existing == alarm {
                return;
            }
        }
        debug!(alarm.id, alarm.risk, "updating alarm");
        match serde_json::to_string(&alarm) {
            Ok(s) => {
                let res = self
                    .log_tx
                    .try_send(LogWriterMessage { data: s + "\n", file_type: FileType::Alarm });
                if let Err(e) = res {
                    warn!(alarm.id, "failed to append alarm journal: {}", e);
                }
            }
            Err(e) => {
                warn!(alarm.id, "failed to serialize alarm: {}", e);
            }
        }
        w.insert(alarm.id.clone(), alarm);
    }

    /// Removing an absent ID is a no-op.
    pub fn remove(&self, id: &str) {
        let mut w = self.alarms.write();
        if w.remove(id).is_some() {
            debug!(alarm.id = id, "alarm removed");
        }
    }

    pub fn append_event(&self, sae: SiemAlarmEvent) {
        trace!(
            alarm.id = sae.id,
            stage = sae.stage,
            event.id = sae.event_id,
            "appending alarm event"
        );
        match serde_json::to_string(&sae) {
            Ok(s) => {
                let res = self
                    .log_tx
                    .try_send(LogWriterMessage { data: s + "\n", file_type: FileType::AlarmEvent });
                if let Err(e) = res {
                    warn!(alarm.id = sae.id, "failed to append alarm event journal: {}", e);
                }
            }
            Err(e) => {
                warn!(alarm.id = sae.id, "failed to serialize alarm event: {}", e);
            }
        }
    }

    pub fn get(&self, id: &str) -> Option<Alarm> {
        let r = self.alarms.read();
        r.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        let r = self.alarms.read();
        r.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
