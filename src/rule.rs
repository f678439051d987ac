use std::{net::IpAddr, sync::Arc};

use arcstr::ArcStr;
use cidr::IpCidr;
use parking_lot::Mutex;
use serde::{Deserializer, Serializer};
use serde_derive::{Deserialize, Serialize};
use tracing::warn;

use crate::{asset::NetworkAssets, event::NormalizedEvent};

#[derive(PartialEq, Clone, Debug, Default)]
pub enum RuleType {
    #[default]
    PluginRule,
    TaxonomyRule,
}

impl serde::Serialize for RuleType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(match *self {
            RuleType::PluginRule => "PluginRule",
            RuleType::TaxonomyRule => "TaxonomyRule",
        })
    }
}

impl<'de> serde::Deserialize<'de> for RuleType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        let res = match s.as_str() {
            "PluginRule" => RuleType::PluginRule,
            "TaxonomyRule" => RuleType::TaxonomyRule,
            &_ => {
                return Err(serde::de::Error::custom("invalid rule type"));
            }
        };
        Ok(res)
    }
}

/// Stage state on a backlog's rule copy. Only the current stage may move;
/// `Finished` stages are frozen, `Timeout` is terminal for the backlog.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RuleStatus {
    #[default]
    Inactive,
    Active,
    Finished,
    Timeout,
}

impl std::fmt::Display for RuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RuleStatus::Inactive => "inactive",
            RuleStatus::Active => "active",
            RuleStatus::Finished => "finished",
            RuleStatus::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct DirectiveRule {
    pub name: String,
    pub stage: u8,
    pub occurrence: usize,
    pub from: ArcStr,
    pub to: ArcStr,
    #[serde(default)]
    pub plugin_id: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub plugin_sid: Vec<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub product: Vec<ArcStr>,
    #[serde(skip_serializing_if = "ArcStr::is_empty")]
    #[serde(default)]
    pub category: ArcStr,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    #[serde(default)]
    pub subcategory: Vec<ArcStr>,
    #[serde(rename(deserialize = "type", serialize = "type"))]
    pub rule_type: RuleType,
    pub port_from: ArcStr,
    pub port_to: ArcStr,
    pub protocol: ArcStr,
    pub reliability: u8,
    pub timeout: u32,
    #[serde(default)]
    pub status: Arc<Mutex<RuleStatus>>,
    #[serde(skip_serializing_if = "is_locked_zero_or_less")]
    #[serde(default)]
    pub start_time: Arc<Mutex<i64>>,
    #[serde(rename(serialize = "events", deserialize = "events"))]
    #[serde(skip_serializing_if = "is_locked_vec_empty")]
    #[serde(default)]
    pub event_ids: Arc<Mutex<Vec<String>>>,
}

// These are only used for serialize
fn is_locked_zero_or_less(num: &Arc<Mutex<i64>>) -> bool {
    let r = num.lock();
    *r <= 0
}
fn is_locked_vec_empty(v: &Arc<Mutex<Vec<String>>>) -> bool {
    let r = v.lock();
    r.is_empty()
}

impl DirectiveRule {
    /// Detaches the live-state fields so a backlog's rule copy never shares
    /// them with the template or with other backlogs.
    pub fn reset_state_fields(mut self) -> Self {
        self.status = Default::default();
        self.start_time = Default::default();
        self.event_ids = Default::default();
        self
    }

    pub fn status(&self) -> RuleStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: RuleStatus) {
        let mut w = self.status.lock();
        *w = status;
    }

    pub fn start_time(&self) -> i64 {
        *self.start_time.lock()
    }

    pub fn set_start_time(&self, ts: i64) {
        let mut w = self.start_time.lock();
        *w = ts;
    }

    pub fn event_count(&self) -> usize {
        let r = self.event_ids.lock();
        r.len()
    }

    /// Appends the event ID preserving arrival order, then returns the
    /// stage's event count.
    pub fn add_event_id(&self, id: &str) -> usize {
        let mut w = self.event_ids.lock();
        w.push(id.to_owned());
        w.len()
    }

    pub fn does_event_match(&self, a: &NetworkAssets, e: &NormalizedEvent) -> bool {
        if self.protocol != "ANY" && !self.protocol.is_empty() && self.protocol != e.protocol {
            return false;
        }
        let attr_match = match self.rule_type {
            RuleType::PluginRule => self.plugin_match(e),
            RuleType::TaxonomyRule => self.taxonomy_match(e),
        };
        attr_match && self.ip_port_match(a, e)
    }

    fn plugin_match(&self, e: &NormalizedEvent) -> bool {
        self.plugin_id == e.plugin_id && self.plugin_sid.iter().any(|v| *v == e.plugin_sid)
    }

    fn taxonomy_match(&self, e: &NormalizedEvent) -> bool {
        if self.category != e.category {
            return false;
        }
        if !self.product.iter().any(|v| *v == e.product) {
            return false;
        }
        // subcategory is optional and can use "ANY"
        if !self.subcategory.is_empty()
            && !self.subcategory.iter().any(|v| *v == e.subcategory || *v == "ANY")
        {
            return false;
        }
        true
    }

    fn ip_port_match(&self, a: &NetworkAssets, e: &NormalizedEvent) -> bool {
        addr_match(&self.from, a, e.src_ip)
            && addr_match(&self.to, a, e.dst_ip)
            && port_match(&self.port_from, e.src_port)
            && port_match(&self.port_to, e.dst_port)
    }
}

fn addr_match(field: &str, a: &NetworkAssets, ip: IpAddr) -> bool {
    let in_homenet = a.is_in_homenet(&ip);
    match field {
        "ANY" => true,
        "HOME_NET" => in_homenet,
        "!HOME_NET" => !in_homenet,
        // "IP", "IP1, IP2, !IP3", CIDR-netaddr, "CIDR1, CIDR2, !CIDR3"
        _ => is_ip_match_csvrule(field, ip),
    }
}

fn port_match(field: &str, port: u16) -> bool {
    field == "ANY" || is_string_match_csvrule(field, &port.to_string())
}

/*
    The correct csv-rule logic is to AND all inverse terms, then OR the
    result with all the non-inverse terms. Both matchers below implement
    that with early exits.
*/

fn is_string_match_csvrule(rules_in_csv: &str, term: &String) -> bool {
    let mut result = false;
    for entry in rules_in_csv.split(',') {
        let mut v = entry.trim().to_owned();
        let is_inverse = v.starts_with('!');
        if is_inverse {
            v = v.replace('!', "");
        }
        let term_is_equal = v == *term;

        // break early if !condition is violated
        if is_inverse && term_is_equal {
            result = false;
            break;
        }
        // break early if condition is fulfilled
        if !is_inverse && term_is_equal {
            result = true;
            break;
        }
        // if !condition is fulfilled, continue evaluation of the next term
        if is_inverse && !term_is_equal {
            result = true;
        }
    }
    result
}

fn is_ip_match_csvrule(rules_in_csv: &str, ip: IpAddr) -> bool {
    let mut result = false;
    for entry in rules_in_csv.split(',') {
        let mut v = entry.trim().to_owned();
        let is_inverse = v.starts_with('!');
        if is_inverse {
            v = v.replace('!', "");
        }
        if !v.contains('/') {
            v += match ip {
                IpAddr::V4(_) => "/32",
                IpAddr::V6(_) => "/128",
            };
        };
        let res = v.parse::<IpCidr>();
        if res.is_err() {
            warn!(
                "cannot parse CIDR {}: {:?}. make sure the directive is configured correctly",
                v,
                res.unwrap_err()
            );
            continue;
        }
        let term_is_equal = res.unwrap().contains(&ip);

        if is_inverse && term_is_equal {
            result = false;
            break;
        }
        if !is_inverse && term_is_equal {
            result = true;
            break;
        }
        if is_inverse && !term_is_equal {
            result = true;
        }
    }
    result
}

#[derive(Clone, Debug)]
pub struct SIDPair {
    pub plugin_id: u64,
    pub plugin_sid: Vec<u64>,
}
#[derive(Clone, Debug)]
pub struct TaxoPair {
    pub product: Vec<ArcStr>,
    pub category: ArcStr,
}

// returns the key matcher attributes for a set of directive rules, used to
// cheaply narrow candidate directives before dispatch
pub fn get_quick_check_pairs(rules: &[DirectiveRule]) -> (Vec<SIDPair>, Vec<TaxoPair>) {
    let mut sid_pairs = vec![];
    let mut taxo_pairs = vec![];
    for r in rules {
        if r.plugin_id != 0 && !r.plugin_sid.is_empty() {
            sid_pairs.push(SIDPair { plugin_id: r.plugin_id, plugin_sid: r.plugin_sid.clone() });
        }
        if !r.product.is_empty() && !r.category.is_empty() {
            taxo_pairs.push(TaxoPair { product: r.product.clone(), category: r.category.clone() });
        }
    }
    (sid_pairs, taxo_pairs)
}

#[inline(always)]
pub fn quick_check_plugin_rule(pairs: &[SIDPair], e: &NormalizedEvent) -> bool {
    pairs
        .iter()
        .filter(|v| v.plugin_id == e.plugin_id)
        .any(|v| v.plugin_sid.iter().any(|x| *x == e.plugin_sid))
}

#[inline(always)]
pub fn quick_check_taxo_rule(pairs: &[TaxoPair], e: &NormalizedEvent) -> bool {
    pairs
        .iter()
        .filter(|v| v.product.iter().any(|x| *x == e.product))
        .any(|v| v.category == e.category)
}

#[cfg(test)]
mod test {
    use std::str::FromStr;

    use table_test::table_test;

    use super::*;

    #[test]
    fn test_rule_status_serde() {
        let s = serde_json::to_string(&RuleStatus::Inactive).unwrap();
        assert_eq!(s, "\"inactive\"");
        let s = serde_json::to_string(&RuleStatus::Timeout).unwrap();
        assert_eq!(s, "\"timeout\"");
        let v: RuleStatus = serde_json::from_str("\"finished\"").unwrap();
        assert_eq!(v, RuleStatus::Finished);
        assert_eq!(RuleStatus::Active.to_string(), "active");
    }

    #[test]
    fn test_stage_state() {
        let r = DirectiveRule::default();
        assert_eq!(r.status(), RuleStatus::Inactive);
        r.set_status(RuleStatus::Active);
        assert_eq!(r.status(), RuleStatus::Active);
        assert_eq!(r.start_time(), 0);
        r.set_start_time(1000);
        assert_eq!(r.start_time(), 1000);
        assert_eq!(r.add_event_id("a"), 1);
        assert_eq!(r.add_event_id("b"), 2);
        assert_eq!(r.event_count(), 2);
        {
            let ids = r.event_ids.lock();
            assert_eq!(*ids, vec!["a".to_string(), "b".to_string()]);
        }

        // a detached copy must not share live state with the source
        let detached = r.clone().reset_state_fields();
        assert_eq!(detached.status(), RuleStatus::Inactive);
        assert_eq!(detached.event_count(), 0);
        detached.set_start_time(5);
        assert_eq!(r.start_time(), 1000);
    }

    #[test]
    fn test_netaddr_in_csv() {
        let table = vec![
            (("192.168.0.1", "192.168.0.0/16"), true),
            (("192.168.0.1", "192.168.0.1"), true),
            (("192.168.0.1", "192.168.0.1/32"), true),
            (("192.168.0.1", "192.168.0.1/24"), false),
            (("192.168.0.1", "!10.0.0.0/16"), true),
            (("192.168.0.1", "!10.0.0.0/16, 192.168.0.0/24"), true),
            (("192.168.0.1", "!192.168.0.0/24"), false),
            (("192.168.0.1", "10.0.0.0/16, !192.168.0.0/16"), false),
            (("192.168.0.1", "10.0.0.0/16, !192.168.0.0/16, 192.168.0.0/16"), false),
        ];

        for (validator, (input_1, input_2), expected) in table_test!(table) {
            let ip = input_1.parse::<IpAddr>().unwrap();
            let actual = is_ip_match_csvrule(input_2, ip);

            validator
                .given(&format!("rules: {}, term: {}", input_2, input_1))
                .when("is_ip_match_csvrule")
                .then(&format!("it should be {}", expected))
                .assert_eq(expected, actual);
        }
    }

    #[test]
    fn test_term_in_csv() {
        let table = vec![
            (("1231", "1000, 1001"), false),
            (("1231", "!1231, 1001"), false),
            (("1231", "1000, !1231"), false),
            (("1231", "1231, !1231"), true),
            (("1231", "!1231, 1231"), false),
            (("1231", "!1000, !1001"), true),
            (("1231", "!1000, 1001"), true),
            (("1231", "1001, !1000"), true),
            (("1231", "!1000, 1231"), true),
            (("foo", "!bar, foobar, foo"), true),
        ];

        for (validator, (input_1, input_2), expected) in table_test!(table) {
            let actual = is_string_match_csvrule(input_2, &input_1.to_owned());

            validator
                .given(&format!("rules: {}, term: {}", input_2, input_1))
                .when("is_string_match_csvrule")
                .then(&format!("it should be {}", expected))
                .assert_eq(expected, actual);
        }
    }

    #[test]
    fn test_quick_check_pairs() {
        let r1 = DirectiveRule { plugin_id: 1, plugin_sid: vec![1, 2, 3], ..Default::default() };
        let r2 = DirectiveRule {
            product: vec!["checkpoint".into()],
            category: "firewall".into(),
            ..Default::default()
        };
        let (p, q) = get_quick_check_pairs(&[r1.clone(), r2]);
        assert_eq!(p.len(), 1);
        assert_eq!(q.len(), 1);

        let mut event = NormalizedEvent { plugin_id: 1, plugin_sid: 1, ..Default::default() };
        assert!(quick_check_plugin_rule(&p, &event));
        event.plugin_sid = 4;
        assert!(!quick_check_plugin_rule(&p, &event));
        event.plugin_id = 3;
        assert!(!quick_check_plugin_rule(&p, &event));

        let mut event = NormalizedEvent {
            product: "checkpoint".into(),
            category: "firewall".into(),
            ..Default::default()
        };
        assert!(quick_check_taxo_rule(&q, &event));
        event.category = "waf".into();
        assert!(!quick_check_taxo_rule(&q, &event));

        let (_, q) = get_quick_check_pairs(&[r1]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_does_event_match() {
        let asset_string = r#"{
            "assets": [
              {
                "name": "Firewall",
                "cidr": "192.168.0.1/32",
                "value": 5
              },
              {
                "name": "192-168-Net",
                "cidr": "192.168.0.0/16",
                "value": 2
              }
            ]
          }
          "#;
        let a = NetworkAssets::from_string(asset_string.to_owned()).unwrap();

        let r1 = DirectiveRule {
            rule_type: RuleType::PluginRule,
            plugin_id: 1001,
            plugin_sid: vec![50001],
            product: vec!["IDS".into()],
            category: "Malware".into(),
            subcategory: vec!["C&C Communication".into()],
            from: "HOME_NET".into(),
            to: "ANY".into(),
            port_from: "ANY".into(),
            port_to: "ANY".into(),
            protocol: "ANY".into(),
            ..Default::default()
        };
        let e1 = NormalizedEvent {
            plugin_id: 1001,
            plugin_sid: 50001,
            product: "IDS".into(),
            category: "Malware".into(),
            subcategory: "C&C Communication".into(),
            src_ip: IpAddr::from_str("192.168.0.1").unwrap(),
            dst_ip: IpAddr::from_str("8.8.8.200").unwrap(),
            src_port: 31337,
            dst_port: 80,
            ..Default::default()
        };

        // plugin rule mismatches
        let mut r2 = r1.clone();
        r2.plugin_sid = vec![50002];
        let mut r3 = r1.clone();
        r3.plugin_id = 1002;

        // taxonomy rule
        let mut r4 = r1.clone();
        r4.rule_type = RuleType::TaxonomyRule;
        let mut r5 = r4.clone();
        r5.category = "Scanning".into();
        let mut r6 = r4.clone();
        r6.product = vec!["Firewall".into()];
        let mut r7 = r4.clone();
        r7.subcategory = vec![];
        let mut r8 = r4.clone();
        r8.subcategory = vec!["Firewall Allow".into()];
        let mut r9 = r4.clone();
        r9.subcategory = vec!["ANY".into()];

        // from and to
        let mut e2 = e1.clone();
        e2.src_ip = e1.dst_ip;
        e2.dst_ip = e1.src_ip;
        let mut r10 = r1.clone();
        r10.from = "!HOME_NET".into();
        let mut r11 = r1.clone();
        r11.from = "192.168.0.10".into();
        let mut r12 = r1.clone();
        r12.to = "HOME_NET".into();
        let mut r13 = r1.clone();
        r13.to = "!HOME_NET".into();

        // ports
        let mut r14 = r1.clone();
        r14.port_from = "1337".into();
        let mut r15 = r1.clone();
        r15.port_to = "80, !8080".into();

        // protocol
        let mut r16 = r1.clone();
        r16.protocol = "TCP".into();
        let mut e3 = e1.clone();
        e3.protocol = "TCP".into();

        let table = vec![
            ((1, r1.clone(), e1.clone()), true),
            ((2, r2, e1.clone()), false),
            ((3, r3, e1.clone()), false),
            ((4, r4, e1.clone()), true),
            ((5, r5, e1.clone()), false),
            ((6, r6, e1.clone()), false),
            ((7, r7, e1.clone()), true),
            ((8, r8, e1.clone()), false),
            ((9, r9, e1.clone()), true),
            ((10, r10.clone(), e1.clone()), false),
            ((11, r10, e2.clone()), true),
            ((12, r11, e1.clone()), false),
            ((13, r12.clone(), e1.clone()), false),
            ((14, r12, e2.clone()), true),
            ((15, r13, e1.clone()), true),
            ((16, r14, e1.clone()), false),
            ((17, r15, e1.clone()), true),
            ((18, r16.clone(), e1.clone()), false),
            ((19, r16, e3), true),
        ];

        for (validator, (case, rule, event), expected) in table_test!(table) {
            let actual = rule.does_event_match(&a, &event);
            validator
                .given(&format!("case {}", case))
                .when("does_event_match")
                .then(&format!("it should be {}", expected))
                .assert_eq(expected, actual);
        }
    }
}
