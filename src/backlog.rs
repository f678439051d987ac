use std::{net::IpAddr, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde_derive::Serialize;
use tokio::sync::mpsc::Sender;
use tracing::{debug, info, warn};

use crate::{
    alarm::{Alarm, AlarmSink, SiemAlarmEvent},
    asset::NetworkAssets,
    directive::Directive,
    event::NormalizedEvent,
    registry::RemovalMsg,
    rule::{DirectiveRule, RuleStatus},
};

#[derive(Debug, PartialEq, Default)]
pub enum BacklogState {
    #[default]
    Running,
    Stopped,
}

/// The backlog's own deep copy of its template, with `SRC_IP`/`DST_IP` name
/// tokens substituted and rule references resolved.
#[derive(Debug, Clone, Serialize)]
pub struct BacklogDirective {
    pub id: u64,
    pub name: String,
    pub priority: u8,
    pub kingdom: String,
    pub category: String,
    pub rules: Vec<DirectiveRule>,
}

// serialization produces the diagnostic snapshot entry
#[derive(Serialize)]
#[cfg_attr(test, derive(Debug))]
pub struct Backlog {
    #[serde(rename(serialize = "backlog_id"))]
    pub id: String,
    pub status_time: RwLock<i64>,
    pub risk: RwLock<u8>,
    pub current_stage: RwLock<u8>,
    pub highest_stage: u8,
    pub directive: BacklogDirective,
    pub src_ips: RwLock<Vec<IpAddr>>,
    pub dst_ips: RwLock<Vec<IpAddr>>,
    #[serde(skip)]
    pub state: RwLock<BacklogState>,
    // serializes every mutating operation on this backlog, so finding it
    // under the registry's read lock is enough
    #[serde(skip)]
    op_guard: Mutex<()>,
    #[serde(skip)]
    assets: Arc<NetworkAssets>,
    #[serde(skip)]
    alarms: Arc<AlarmSink>,
    #[serde(skip)]
    removal_tx: Sender<RemovalMsg>,
}

pub struct BacklogOpt<'a> {
    pub id: String,
    pub directive: &'a Directive,
    pub event: &'a NormalizedEvent,
    pub asset: Arc<NetworkAssets>,
    pub alarms: Arc<AlarmSink>,
    pub removal_tx: Sender<RemovalMsg>,
}

impl Backlog {
    pub fn new(o: BacklogOpt) -> Result<Self> {
        let rules = o.directive.resolved_rules(o.event)?;
        let highest_stage = rules.iter().map(|v| v.stage).max().unwrap_or_default();

        let mut title = o.directive.name.clone();
        if title.contains("SRC_IP") {
            let name = o.asset.get_name(&o.event.src_ip);
            let src = if name.is_empty() { o.event.src_ip.to_string() } else { name };
            title = title.replace("SRC_IP", &src);
        }
        if title.contains("DST_IP") {
            let name = o.asset.get_name(&o.event.dst_ip);
            let dst = if name.is_empty() { o.event.dst_ip.to_string() } else { name };
            title = title.replace("DST_IP", &dst);
        }

        let now = Utc::now().timestamp();
        rules[0].set_start_time(now);

        let backlog = Backlog {
            id: o.id,
            status_time: RwLock::new(now),
            risk: RwLock::new(0),
            current_stage: RwLock::new(1),
            highest_stage,
            directive: BacklogDirective {
                id: o.directive.id,
                name: title,
                priority: o.directive.priority,
                kingdom: o.directive.kingdom.clone(),
                category: o.directive.category.clone(),
                rules,
            },
            src_ips: RwLock::new(vec![]),
            dst_ips: RwLock::new(vec![]),
            state: RwLock::new(BacklogState::Running),
            op_guard: Mutex::new(()),
            assets: o.asset,
            alarms: o.alarms,
            removal_tx: o.removal_tx,
        };
        info!(
            directive.id = backlog.directive.id,
            backlog.id,
            event.id = o.event.id,
            "new backlog created"
        );
        Ok(backlog)
    }

    pub fn is_running(&self) -> bool {
        let r = self.state.read();
        *r == BacklogState::Running
    }

    pub fn current_stage(&self) -> u8 {
        let r = self.current_stage.read();
        *r
    }

    pub fn current_rule(&self) -> Result<&DirectiveRule> {
        self.get_rule(self.current_stage())
    }

    fn get_rule(&self, stage: u8) -> Result<&DirectiveRule> {
        self.directive
            .rules
            .iter()
            .find(|v| v.stage == stage)
            .ok_or_else(|| anyhow!("cannot locate rule for stage {}", stage))
    }

    /// Consumes an event already known to match the current stage's rule.
    pub fn process_matched_event(&self, event: &NormalizedEvent) -> Result<()> {
        let _guard = self.op_guard.lock();
        if !self.is_running() {
            debug!(self.id, event.id, "event received but backlog is no longer running");
            return Ok(());
        }

        self.append_and_write_event(event)?;

        // exit early if the newly added event hasnt caused events_count ==
        // occurrence for the current stage
        if !self.is_stage_at_max_event_count()? {
            self.ensure_active()?;
            return Ok(());
        }

        self.set_rule_status(RuleStatus::Finished)?;
        if self.update_risk()? {
            self.project_alarm();
        }

        // if it causes the last stage to reach events_count == occurrence,
        // delete it
        if self.is_last_stage() {
            info!(self.id, event.conn_id, "reached max stage and occurrence, deleting backlog");
            self.delete(event.conn_id);
            return Ok(());
        }

        // reached max occurrence, but not in last stage
        self.increase_stage();
        self.set_rule_status(RuleStatus::Active)?;

        // the new stage carries a different reliability
        if self.update_risk()? {
            self.project_alarm();
        }
        Ok(())
    }

    fn append_and_write_event(&self, event: &NormalizedEvent) -> Result<()> {
        let curr_rule = self.current_rule()?;
        let count = curr_rule.add_event_id(&event.id);
        debug!(
            self.id,
            event.id,
            stage = curr_rule.stage,
            "appended event {}/{}",
            count,
            curr_rule.occurrence
        );

        insert_unique(&self.src_ips, event.src_ip);
        insert_unique(&self.dst_ips, event.dst_ip);
        self.set_status_time();

        // journal failure doesn't roll anything back, it is an audit trail
        self.alarms.append_event(SiemAlarmEvent {
            id: self.id.clone(),
            stage: self.current_stage(),
            event_id: event.id.clone(),
        });
        Ok(())
    }

    fn ensure_active(&self) -> Result<()> {
        let curr_rule = self.current_rule()?;
        let mut updated = false;
        if curr_rule.start_time() == 0 {
            curr_rule.set_start_time(Utc::now().timestamp());
            updated = true;
        }
        if curr_rule.status() != RuleStatus::Active {
            self.set_rule_status(RuleStatus::Active)?;
            updated = true;
        }
        if updated {
            self.project_alarm();
        }
        Ok(())
    }

    /// Applies to the current stage's rule only, and always projects the
    /// alarm.
    pub fn set_rule_status(&self, status: RuleStatus) -> Result<()> {
        let curr_rule = self.current_rule()?;
        curr_rule.set_status(status);
        self.set_status_time();
        self.project_alarm();
        Ok(())
    }

    fn is_stage_at_max_event_count(&self) -> Result<bool> {
        let curr_rule = self.current_rule()?;
        Ok(curr_rule.event_count() >= curr_rule.occurrence)
    }

    fn is_last_stage(&self) -> bool {
        self.current_stage() == self.highest_stage
    }

    fn increase_stage(&self) {
        let now = Utc::now().timestamp();
        {
            let mut w = self.current_stage.write();
            if *w < self.highest_stage {
                *w += 1;
                info!(
                    directive.id = self.directive.id,
                    self.id, "stage increased to {}", *w
                );
            }
        }
        if let Ok(rule) = self.current_rule() {
            rule.set_start_time(now);
        }
        let mut w = self.status_time.write();
        *w = now;
    }

    fn update_risk(&self) -> Result<bool> {
        let src_value = {
            let r = self.src_ips.read();
            r.iter().map(|v| self.assets.get_value(v)).max().unwrap_or_default()
        };
        let dst_value = {
            let r = self.dst_ips.read();
            r.iter().map(|v| self.assets.get_value(v)).max().unwrap_or_default()
        };
        let value = std::cmp::max(src_value, dst_value);

        let prior_risk = {
            let r = self.risk.read();
            *r
        };
        let priority = self.directive.priority;
        let reliability = self.current_rule()?.reliability;
        // risk is stored and serialized as u8; results past 255 cap there
        // instead of wrapping
        let risk = (u16::from(priority) * u16::from(reliability) * u16::from(value) / 25)
            .min(u16::from(u8::MAX)) as u8;
        if risk != prior_risk {
            info!(
                directive.id = self.directive.id,
                self.id, "risk changed from {} to {}", prior_risk, risk
            );
            let mut w = self.risk.write();
            *w = risk;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    fn set_status_time(&self) {
        let mut w = self.status_time.write();
        *w = Utc::now().timestamp();
    }

    pub fn project_alarm(&self) {
        match self.to_alarm() {
            Ok(alarm) => self.alarms.upsert(alarm),
            Err(e) => warn!(self.id, "cannot project alarm: {}", e),
        }
    }

    fn to_alarm(&self) -> Result<Alarm> {
        let curr_rule = self.current_rule()?;
        Ok(Alarm {
            id: self.id.clone(),
            title: self.directive.name.clone(),
            status: curr_rule.status(),
            kingdom: self.directive.kingdom.clone(),
            category: self.directive.category.clone(),
            directive_id: self.directive.id,
            risk: *self.risk.read(),
            current_stage: self.current_stage(),
            highest_stage: self.highest_stage,
            status_time: *self.status_time.read(),
            src_ips: self.src_ips.read().clone(),
            dst_ips: self.dst_ips.read().clone(),
        })
    }

    /// (expired, seconds_left) for the current stage's deadline.
    pub fn is_expired(&self) -> Result<(bool, i64)> {
        let now = Utc::now().timestamp();
        let curr_rule = self.current_rule()?;
        let deadline = curr_rule.start_time() + i64::from(curr_rule.timeout);
        Ok((now > deadline, deadline - now))
    }

    /// Terminal transition taken by the reaper once the current stage's
    /// deadline has passed.
    pub fn handle_expiration(&self) -> Result<()> {
        let _guard = self.op_guard.lock();
        if !self.is_running() {
            return Ok(());
        }
        self.set_rule_status(RuleStatus::Timeout)?;
        self.delete(0);
        Ok(())
    }

    /// Requests removal from the registry and the alarm sink. Runs at most
    /// once; a stopped backlog is never observed again.
    pub fn delete(&self, conn_id: u64) {
        {
            let mut w = self.state.write();
            if *w == BacklogState::Stopped {
                return;
            }
            *w = BacklogState::Stopped;
        }
        if let Err(e) = self.removal_tx.try_send(RemovalMsg { id: self.id.clone(), conn_id }) {
            warn!(self.id, "cannot send removal request: {}", e);
        }
    }
}

fn insert_unique(list: &RwLock<Vec<IpAddr>>, ip: IpAddr) {
    let mut w = list.write();
    if !w.contains(&ip) {
        w.push(ip);
    }
}
