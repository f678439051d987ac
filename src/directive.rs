use std::{fs, str::FromStr};

use anyhow::{anyhow, Result};
use glob::glob;
use regex::Regex;
use serde_derive::Deserialize;
use tracing::{info, warn};

use crate::{
    event::NormalizedEvent,
    rule::{DirectiveRule, RuleStatus, RuleType},
    utils::{self, ref_to_digit},
};

const DIRECTIVES_GLOB: &str = "directives_*.json";

#[derive(Deserialize, Debug, Clone)]
pub struct Directive {
    pub id: u64,
    pub name: String,
    pub priority: u8,
    #[serde(default)]
    pub disabled: bool,
    pub kingdom: String,
    pub category: String,
    pub rules: Vec<DirectiveRule>,
}

#[derive(Deserialize)]
pub struct Directives {
    pub directives: Vec<Directive>,
}

impl Directive {
    pub fn highest_stage(&self) -> u8 {
        self.rules.iter().map(|v| v.stage).max().unwrap_or_default()
    }

    /// Clones the template rules into a backlog's own rule set, with `:N`
    /// back-references resolved against the rules already processed, and
    /// wildcard referents replaced by the first event's concrete values.
    /// The first rule is marked active and is never rewritten.
    pub fn resolved_rules(&self, e: &NormalizedEvent) -> Result<Vec<DirectiveRule>> {
        let mut resolved: Vec<DirectiveRule> = Vec::with_capacity(self.rules.len());
        for (i, rule) in self.rules.iter().enumerate() {
            let r = rule.clone().reset_state_fields();
            if i == 0 {
                r.set_status(RuleStatus::Active);
                resolved.push(r);
                continue;
            }
            let mut r = r;
            if let Ok(n) = ref_to_digit(&r.from) {
                let referent = &resolved[checked_ref(n, i)?].from;
                r.from = if is_addr_wildcard(referent) {
                    e.src_ip.to_string().into()
                } else {
                    referent.clone()
                };
            }
            if let Ok(n) = ref_to_digit(&r.to) {
                let referent = &resolved[checked_ref(n, i)?].to;
                r.to = if is_addr_wildcard(referent) {
                    e.dst_ip.to_string().into()
                } else {
                    referent.clone()
                };
            }
            if let Ok(n) = ref_to_digit(&r.port_from) {
                let referent = &resolved[checked_ref(n, i)?].port_from;
                r.port_from = if referent == "ANY" {
                    e.src_port.to_string().into()
                } else {
                    referent.clone()
                };
            }
            if let Ok(n) = ref_to_digit(&r.port_to) {
                let referent = &resolved[checked_ref(n, i)?].port_to;
                r.port_to = if referent == "ANY" {
                    e.dst_port.to_string().into()
                } else {
                    referent.clone()
                };
            }
            resolved.push(r);
        }
        resolved.shrink_to_fit();
        Ok(resolved)
    }
}

fn is_addr_wildcard(s: &str) -> bool {
    s == "ANY" || s == "HOME_NET" || s == "!HOME_NET"
}

// references must point to an earlier stage; returns the 0-based index of
// the referent
fn checked_ref(n: u8, rule_idx: usize) -> Result<usize> {
    if n < 1 || usize::from(n) > rule_idx {
        return Err(anyhow!("invalid rule reference :{} on rule {}", n, rule_idx + 1));
    }
    Ok(usize::from(n) - 1)
}

fn validate_rules(rules: &Vec<DirectiveRule>) -> Result<()> {
    let mut stages: Vec<u8> = vec![];
    for r in rules {
        if r.stage == 0 {
            return Err(anyhow!("rule stage cannot be zero"));
        }
        for s in &stages {
            if *s == r.stage {
                return Err(anyhow!("duplicate rule stage {} found", r.stage));
            }
        }
        if usize::from(r.stage) != stages.len() + 1 {
            return Err(anyhow!(
                "rule stage {} out of order, stages must start at 1 and increase sequentially",
                r.stage
            ));
        }
        if r.occurrence < 1 {
            return Err(anyhow!("rule stage {} occurrence must be >= 1", r.stage));
        }
        if r.rule_type == RuleType::PluginRule {
            if r.plugin_id < 1 {
                return Err(anyhow!("rule stage {} plugin_id must be >= 1", r.stage));
            }
            if r.plugin_sid.is_empty() {
                return Err(anyhow!("plugin_sid cannot be empty"));
            }
            for s in &r.plugin_sid {
                if *s < 1 {
                    return Err(anyhow!("rule stage {} plugin_sid must be >= 1", r.stage));
                }
            }
        }
        if r.rule_type == RuleType::TaxonomyRule {
            if r.product.is_empty() {
                return Err(anyhow!(
                    "rule stage {} is a TaxonomyRule and requires product to be defined",
                    r.stage
                ));
            }
            if r.category.is_empty() {
                return Err(anyhow!(
                    "rule stage {} is a TaxonomyRule and requires category to be defined",
                    r.stage
                ));
            }
        }
        if r.reliability > 10 {
            return Err(anyhow!("rule stage {} reliability must be between 0 to 10", r.stage));
        }

        let is_first_rule = r.stage == 1;

        validate_port(r.port_from.as_str(), is_first_rule, r.stage)
            .map_err(|e| anyhow!("rule stage {} port_from is invalid: {}", r.stage, e))?;
        validate_port(r.port_to.as_str(), is_first_rule, r.stage)
            .map_err(|e| anyhow!("rule stage {} port_to is invalid: {}", r.stage, e))?;
        validate_fromto(r.from.as_str(), is_first_rule, r.stage)
            .map_err(|e| anyhow!("rule stage {} from address is invalid: {}", r.stage, e))?;
        validate_fromto(r.to.as_str(), is_first_rule, r.stage)
            .map_err(|e| anyhow!("rule stage {} to address is invalid: {}", r.stage, e))?;

        stages.push(r.stage);
    }

    Ok(())
}

fn validate_fromto(s: &str, is_first_rule: bool, stage: u8) -> Result<(), String> {
    if s == "ANY" || s == "HOME_NET" || s == "!HOME_NET" {
        return Ok(());
    }
    if s.is_empty() {
        return Err("empty string".to_string());
    }
    if s.starts_with(':') {
        if is_first_rule {
            return Err("first rule cannot have reference".to_string());
        }
        return validate_reference(s, stage);
    }
    for term in s.split(',') {
        let v = term.replace('!', "").trim().to_string();
        cidr::AnyIpCidr::from_str(&v).map_err(|e| format!("{v}: {e}"))?;
    }

    Ok(())
}

fn validate_port(s: &str, is_first_rule: bool, stage: u8) -> Result<(), String> {
    if s == "ANY" {
        return Ok(());
    }
    if s.starts_with(':') {
        if is_first_rule {
            return Err("first rule cannot have reference".to_string());
        }
        return validate_reference(s, stage);
    }
    for term in s.split(',') {
        let n = term.replace('!', "").trim().parse::<u16>().map_err(|e| e.to_string())?;
        if n == 0 {
            return Err(format!("{} is not a valid TCP/UDP port number", n));
        }
    }
    Ok(())
}

// references are strictly backward, so no resolution cycle can arise
fn validate_reference(r: &str, stage: u8) -> Result<(), String> {
    let re = Regex::new(r"^:[1-9][0-9]?$").map_err(|e| e.to_string())?;
    if !re.is_match(r) {
        return Err(r.to_owned() + " is not a valid reference");
    }
    if let Ok(n) = ref_to_digit(r) {
        if n >= stage {
            return Err(r.to_owned() + " is not a valid reference");
        }
    }
    Ok(())
}

fn validate_directive(d: &Directive, loaded: &Vec<Directive>) -> Result<()> {
    for v in loaded {
        if d.id == v.id {
            return Err(anyhow!("directive ID {} already exist", d.id));
        }
    }
    if d.name.is_empty() {
        return Err(anyhow!("directive ID {} name is empty", d.id));
    }
    if d.kingdom.is_empty() {
        return Err(anyhow!("directive ID {} kingdom is empty", d.id));
    }
    if d.category.is_empty() {
        return Err(anyhow!("directive ID {} category is empty", d.id));
    }
    if d.priority < 1 || d.priority > 5 {
        return Err(anyhow!("directive ID {} priority must be between 1 to 5", d.id));
    }
    if d.rules.is_empty() {
        return Err(anyhow!("directive ID {} has no rule", d.id));
    }
    validate_rules(&d.rules).map_err(|e| anyhow!("directive ID {} rules has error: {}", d.id, e))?;
    Ok(())
}

pub fn load_directives(test_env: bool, sub_path: Option<Vec<String>>) -> Result<Vec<Directive>> {
    let cfg_dir = utils::config_dir(test_env, sub_path)?;
    let glob_pattern = cfg_dir.to_string_lossy().to_string() + "/" + DIRECTIVES_GLOB;
    let mut dirs = Directives { directives: vec![] };
    for file_path in glob(&glob_pattern)?.flatten() {
        info!("reading {:?}", file_path);
        let s = fs::read_to_string(file_path.clone())?;
        let loaded: Directives =
            serde_json::from_str(&s).map_err(|e| anyhow!("{:?}: {}", file_path, e.to_string()))?;
        for d in loaded.directives {
            if d.disabled {
                warn!(directive.id = d.id, "skipping disabled directive");
                continue;
            }
            validate_directive(&d, &dirs.directives)
                .map_err(|e| anyhow!("{:?}: {}", file_path, e.to_string()))?;
            dirs.directives.push(d);
        }
    }
    if dirs.directives.is_empty() {
        return Err(anyhow!("cannot load any directive"));
    }
    info!("{} directives found and loaded", dirs.directives.len());
    dirs.directives.shrink_to_fit();
    Ok(dirs.directives)
}
