use std::{fs, sync::Arc, time::Duration};

use catena::{
    asset::NetworkAssets,
    directive::Directive,
    engine::{Engine, EngineOpt},
    event::NormalizedEvent,
    log_writer::ALARM_EVENT_LOG,
    rule::{DirectiveRule, RuleType},
    utils,
};
use tokio::{sync::broadcast, time::sleep};
use tracing_test::traced_test;

fn assets(s: &str) -> Arc<NetworkAssets> {
    Arc::new(NetworkAssets::from_string(s.to_owned()).unwrap())
}

fn engine(assets: Arc<NetworkAssets>, reap_interval: Duration, id_seed: u64) -> Engine {
    let (cancel_tx, _) = broadcast::channel::<()>(1);
    let engine = Engine::new(EngineOpt {
        test_env: true,
        assets,
        cancel_tx,
        reap_interval,
        id_seed: Some(id_seed),
    })
    .unwrap();
    engine.start().unwrap();
    engine
}

fn plugin_rule(
    stage: u8,
    sid: u64,
    occurrence: usize,
    timeout: u32,
    reliability: u8,
    from: &str,
    to: &str,
) -> DirectiveRule {
    DirectiveRule {
        name: format!("stage {}", stage),
        stage,
        occurrence,
        from: from.into(),
        to: to.into(),
        plugin_id: 1001,
        plugin_sid: vec![sid],
        rule_type: RuleType::PluginRule,
        port_from: "ANY".into(),
        port_to: "ANY".into(),
        protocol: "ANY".into(),
        reliability,
        timeout,
        ..Default::default()
    }
}

fn directive(id: u64, name: &str, priority: u8, rules: Vec<DirectiveRule>) -> Directive {
    Directive {
        id,
        name: name.to_string(),
        priority,
        disabled: false,
        kingdom: "Reconnaissance & Probing".to_string(),
        category: "Misc Activity".to_string(),
        rules,
    }
}

fn event(id: &str, sid: u64, src: &str, dst: &str) -> NormalizedEvent {
    NormalizedEvent {
        id: id.to_string(),
        plugin_id: 1001,
        plugin_sid: sid,
        src_ip: src.parse().unwrap(),
        dst_ip: dst.parse().unwrap(),
        src_port: 31337,
        dst_port: 80,
        ..Default::default()
    }
}

// single-stage directive: the first event finishes the only stage, the
// alarm is projected with risk 1 and the backlog is deleted right away
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_single_stage_occurrence_one() {
    let a = assets(r#"{ "assets": [ { "name": "lan", "cidr": "10.0.0.0/8", "value": 2 } ] }"#);
    let e = engine(a, Duration::from_secs(10), 101);
    let d = directive(10, "single stage", 3, vec![plugin_rule(1, 1, 1, 60, 5, "ANY", "ANY")]);

    e.process(&event("s1-e1", 1, "10.0.0.1", "10.0.0.2"), &d).unwrap();

    assert!(logs_contain("risk changed from 0 to 1"));
    assert!(logs_contain("reached max stage and occurrence"));
    assert!(e.registry().is_empty());
    sleep(Duration::from_millis(300)).await;
    assert!(e.alarms().is_empty());
}

// two-stage progression with reference resolution, risk recalculation on
// stage advance, and the alarm-event journal capturing the full chain
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_two_stage_progression_and_journal() {
    // this test owns the journal content assertions, so it resets the file
    // before its engine opens it
    let log_file = utils::log_dir(true).unwrap().join(ALARM_EVENT_LOG);
    fs::remove_file(&log_file).ok();

    let a = assets(r#"{ "assets": [ { "name": "gw", "cidr": "1.1.1.1/32", "value": 5 } ] }"#);
    let e = engine(a, Duration::from_secs(10), 102);
    let d = directive(
        20,
        "two stage",
        5,
        vec![
            plugin_rule(1, 10, 2, 60, 1, "ANY", "ANY"),
            plugin_rule(2, 11, 1, 60, 8, ":1", ":1"),
        ],
    );

    e.process(&event("s2-e1", 10, "1.1.1.1", "2.2.2.2"), &d).unwrap();
    assert_eq!(e.registry().len(), 1);
    let backlog_id = e.registry().snapshot()[0].id.clone();

    // second stage-1 hit accumulates into the same chain
    e.process(&event("s2-e2", 10, "1.1.1.1", "3.3.3.3"), &d).unwrap();
    assert_eq!(e.registry().len(), 1);
    {
        let b = &e.registry().snapshot()[0];
        assert_eq!(b.current_stage(), 2);
        let stage2 = b.current_rule().unwrap();
        // :1 referents were wildcards, so they resolve from the first event
        assert_eq!(stage2.from, "1.1.1.1");
        assert_eq!(stage2.to, "2.2.2.2");
        // reliability switched from 1 to 8: risk goes 1 -> 8
        assert_eq!(*b.risk.read(), 8);
    }
    assert!(logs_contain("risk changed from 0 to 1"));
    assert!(logs_contain("risk changed from 1 to 8"));
    let alarm = e.alarms().get(&backlog_id).unwrap();
    assert_eq!(alarm.risk, 8);
    assert_eq!(alarm.current_stage, 2);

    // stage-2 match completes and deletes the chain
    e.process(&event("s2-e3", 11, "1.1.1.1", "2.2.2.2"), &d).unwrap();
    assert!(logs_contain("reached max stage and occurrence"));
    sleep(Duration::from_millis(500)).await;
    assert!(e.registry().is_empty());
    assert!(e.alarms().get(&backlog_id).is_none());

    // the journal holds exactly this chain's three events, in match order
    let content = fs::read_to_string(&log_file).unwrap();
    let entries: Vec<serde_json::Value> = content
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .filter(|v: &serde_json::Value| v["alarm_id"] == backlog_id.as_str())
        .collect();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[0]["event_id"], "s2-e1");
    assert_eq!(entries[0]["stage"], 1);
    assert_eq!(entries[1]["event_id"], "s2-e2");
    assert_eq!(entries[1]["stage"], 1);
    assert_eq!(entries[2]["event_id"], "s2-e3");
    assert_eq!(entries[2]["stage"], 2);
}

// a stage that never reaches its occurrence count is expired by the reaper
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_stage_timeout() {
    let a = assets(r#"{ "assets": [ { "name": "lan", "cidr": "10.0.0.0/8", "value": 2 } ] }"#);
    let e = engine(a, Duration::from_secs(1), 103);
    let d = directive(30, "times out", 3, vec![plugin_rule(1, 1, 2, 1, 5, "ANY", "ANY")]);

    e.process(&event("s3-e1", 1, "10.0.0.1", "10.0.0.2"), &d).unwrap();
    assert_eq!(e.registry().len(), 1);
    let b = e.registry().snapshot()[0].clone();

    sleep(Duration::from_millis(3500)).await;
    assert!(logs_contain("backlog expired"));
    assert!(e.registry().is_empty());
    // only one event was ever recorded
    assert_eq!(b.current_rule().unwrap().event_count(), 1);
}

// two chains of the same directive at stage 2 with different resolved
// addresses: an event progresses only the chain it matches
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_parallel_chains() {
    let a = assets(r#"{ "assets": [ { "name": "lan", "cidr": "2.2.2.0/24", "value": 2 } ] }"#);
    let e = engine(a, Duration::from_secs(10), 104);
    let d = directive(
        40,
        "parallel chains",
        3,
        vec![
            plugin_rule(1, 10, 1, 60, 1, "ANY", "ANY"),
            plugin_rule(2, 11, 2, 60, 8, ":1", ":1"),
        ],
    );

    e.process(&event("s4-e1", 10, "1.1.1.1", "2.2.2.2"), &d).unwrap();
    e.process(&event("s4-e2", 10, "9.9.9.9", "2.2.2.2"), &d).unwrap();
    assert_eq!(e.registry().len(), 2);

    let chains = e.registry().snapshot();
    let chain_a = chains.iter().find(|b| b.current_rule().unwrap().from == "1.1.1.1").unwrap();
    let chain_b = chains.iter().find(|b| b.current_rule().unwrap().from == "9.9.9.9").unwrap();
    assert_eq!(chain_a.current_stage(), 2);
    assert_eq!(chain_b.current_stage(), 2);

    e.process(&event("s4-e3", 11, "1.1.1.1", "2.2.2.2"), &d).unwrap();
    assert_eq!(chain_a.current_rule().unwrap().event_count(), 1);
    assert_eq!(chain_b.current_rule().unwrap().event_count(), 0);
}

// directive name tokens resolve to asset names where known, addresses
// otherwise
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[traced_test]
async fn test_name_substitution_and_snapshot() {
    let a = assets(r#"{ "assets": [ { "name": "web01", "cidr": "10.0.0.1/32", "value": 5 } ] }"#);
    let e = engine(a, Duration::from_secs(10), 105);
    let d = directive(
        50,
        "Attack from SRC_IP to DST_IP",
        3,
        vec![plugin_rule(1, 1, 2, 600, 5, "ANY", "ANY")],
    );

    e.process(&event("s5-e1", 1, "10.0.0.1", "10.0.0.2"), &d).unwrap();
    let b = &e.registry().snapshot()[0];
    assert_eq!(b.directive.name, "Attack from web01 to 10.0.0.2");

    let snapshot = e.snapshot_json().unwrap();
    let v: serde_json::Value = serde_json::from_str(&snapshot).unwrap();
    assert_eq!(v["backlogs"][0]["directive"]["name"], "Attack from web01 to 10.0.0.2");
    assert_eq!(v["backlogs"][0]["current_stage"], 1);
    assert_eq!(v["backlogs"][0]["highest_stage"], 1);
}
