//! A named rule: which events it applies to, and the crit/warn conditions
//! that decide what happens to them.
//!
//! Grounded on `alarm/policy.go`. `group_by` is carried on the compiled
//! policy and round-trips through configuration, but -- matching the
//! original's actual `grouper.genIndexName`, which just calls
//! `Event.IndexName()` -- it is not consulted when deriving a condition
//! tracker's group key. That key is always the event's own index name.

use std::collections::HashMap;

use regex::Regex;

use crate::condition::{Condition, ConditionConfig};
use crate::errors::{Error, Result};
use crate::event::{Event, Status};

/// Tag names merged into `group_by` when a policy declares fewer than
/// three entries of its own.
fn default_group_by() -> HashMap<String, String> {
    let mut m = HashMap::new();
    m.insert("host".to_string(), ".*".to_string());
    m.insert("service".to_string(), ".*".to_string());
    m.insert("sub_service".to_string(), ".*".to_string());
    m
}

/// Declarative policy document.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct PolicyConfig {
    pub name: String,
    #[serde(rename = "match", default)]
    pub match_tags: HashMap<String, String>,
    #[serde(rename = "notMatch", default)]
    pub not_match_tags: HashMap<String, String>,
    #[serde(default)]
    pub group_by: HashMap<String, String>,
    pub crit: Option<ConditionConfig>,
    pub warn: Option<ConditionConfig>,
}

/// A compiled, runnable policy.
pub struct Policy {
    pub name: String,
    match_re: HashMap<String, Regex>,
    not_match_re: HashMap<String, Regex>,
    /// Compiled for configuration validation/round-trip only -- see module
    /// docs for why these are not used to derive tracker group keys.
    #[allow(dead_code)]
    group_by: HashMap<String, Regex>,
    pub crit: Option<Condition>,
    pub warn: Option<Condition>,
}

impl Policy {
    pub fn compile(cfg: &PolicyConfig) -> Result<Policy> {
        let match_re = compile_tag_regexes(&cfg.match_tags)?;
        let not_match_re = compile_tag_regexes(&cfg.not_match_tags)?;

        let mut group_by_src = cfg.group_by.clone();
        if group_by_src.len() < 3 {
            for (k, v) in default_group_by() {
                group_by_src.entry(k).or_insert(v);
            }
        }
        let group_by = compile_tag_regexes(&group_by_src)?;

        let crit = cfg.crit.as_ref().map(Condition::compile);
        let warn = cfg.warn.as_ref().map(Condition::compile);

        Ok(Policy {
            name: cfg.name.clone(),
            match_re,
            not_match_re,
            group_by,
            crit,
            warn,
        })
    }

    /// `true` iff every `match` tag regex matches and no `notMatch` tag
    /// regex matches. An empty map is vacuously satisfied.
    pub fn matches(&self, event: &Event) -> bool {
        self.check_match(event) && self.check_not_match(event)
    }

    fn check_match(&self, event: &Event) -> bool {
        self.match_re
            .iter()
            .all(|(tag, re)| re.is_match(event.tags.get(tag)))
    }

    fn check_not_match(&self, event: &Event) -> bool {
        self.not_match_re
            .iter()
            .all(|(tag, re)| !re.is_match(event.tags.get(tag)))
    }

    /// Run crit, then warn if crit didn't escalate. Returns the escalation
    /// name to fire, if any, and leaves `event.status` set to the final
    /// verdict either way.
    pub fn evaluate(&mut self, event: &mut Event) -> Option<String> {
        let crit_escalation = self.action_crit(event);
        if crit_escalation.is_some() {
            return crit_escalation;
        }
        self.action_warn(event)
    }

    fn action_crit(&mut self, event: &mut Event) -> Option<String> {
        if let Some(cond) = self.crit.as_mut() {
            let hit = cond.track_event(event);
            event.status = if hit { Status::Critical } else { Status::Ok };
            if cond.state_changed(event) {
                return Some(cond.escalation.clone());
            }
            return None;
        }
        event.status = Status::Ok;
        None
    }

    fn action_warn(&mut self, event: &mut Event) -> Option<String> {
        if let Some(cond) = self.warn.as_mut() {
            let hit = cond.track_event(event);
            event.status = if hit { Status::Warning } else { Status::Ok };
            if cond.state_changed(event) {
                return Some(cond.escalation.clone());
            }
            return None;
        }
        event.status = Status::Ok;
        None
    }
}

fn compile_tag_regexes(src: &HashMap<String, String>) -> Result<HashMap<String, Regex>> {
    src.iter()
        .map(|(tag, pattern)| {
            Regex::new(pattern)
                .map(|re| (tag.clone(), re))
                .map_err(|e| Error::ConfigInvalid(format!("bad regex for tag {tag:?}: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::TagSet;

    fn event_with(host: &str, service: &str, metric: f64) -> Event {
        let mut tags = TagSet::new();
        tags.set("host", host);
        tags.set("service", service);
        Event::new(metric, tags)
    }

    #[test]
    fn match_filters_require_all_tags_to_match() {
        let cfg = PolicyConfig {
            name: "p".into(),
            match_tags: HashMap::from([("service".to_string(), "^cpu$".to_string())]),
            ..Default::default()
        };
        let p = Policy::compile(&cfg).unwrap();

        assert!(p.matches(&event_with("h1", "cpu", 1.0)));
        assert!(!p.matches(&event_with("h1", "disk", 1.0)));
    }

    #[test]
    fn not_match_excludes_on_any_hit() {
        let cfg = PolicyConfig {
            name: "p".into(),
            not_match_tags: HashMap::from([("host".to_string(), "^excluded$".to_string())]),
            ..Default::default()
        };
        let p = Policy::compile(&cfg).unwrap();

        assert!(p.matches(&event_with("h1", "cpu", 1.0)));
        assert!(!p.matches(&event_with("excluded", "cpu", 1.0)));
    }

    #[test]
    fn empty_filters_match_everything() {
        let p = Policy::compile(&PolicyConfig {
            name: "p".into(),
            ..Default::default()
        })
        .unwrap();
        assert!(p.matches(&event_with("anything", "anything", 1.0)));
    }

    #[test]
    fn bad_regex_is_config_invalid() {
        let cfg = PolicyConfig {
            name: "p".into(),
            match_tags: HashMap::from([("host".to_string(), "(".to_string())]),
            ..Default::default()
        };
        assert!(matches!(
            Policy::compile(&cfg),
            Err(Error::ConfigInvalid(_))
        ));
    }

    #[test]
    fn crit_escalates_once_then_falls_silent_until_resolved() {
        let cfg = PolicyConfig {
            name: "p".into(),
            crit: Some(ConditionConfig {
                greater: Some(90.0),
                escalation: "page".into(),
                occurrences: 1,
                window_size: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut p = Policy::compile(&cfg).unwrap();
        let mut e = event_with("h1", "cpu", 95.0);

        assert_eq!(p.evaluate(&mut e).as_deref(), Some("page"));
        assert_eq!(e.status, Status::Critical);

        // Still critical, but no repeat escalation on the same state.
        assert_eq!(p.evaluate(&mut e), None);
        assert_eq!(e.status, Status::Critical);
    }

    #[test]
    fn recovering_resets_status_to_ok() {
        let cfg = PolicyConfig {
            name: "p".into(),
            crit: Some(ConditionConfig {
                greater: Some(90.0),
                escalation: "page".into(),
                occurrences: 1,
                window_size: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut p = Policy::compile(&cfg).unwrap();
        let mut hot = event_with("h1", "cpu", 95.0);
        let mut cold = event_with("h1", "cpu", 1.0);

        p.evaluate(&mut hot);
        p.evaluate(&mut cold);
        assert_eq!(cold.status, Status::Ok);
    }

    #[test]
    fn recovering_emits_a_resolution_escalation() {
        let cfg = PolicyConfig {
            name: "p".into(),
            crit: Some(ConditionConfig {
                greater: Some(90.0),
                escalation: "page".into(),
                occurrences: 1,
                window_size: 2,
                ..Default::default()
            }),
            ..Default::default()
        };
        let mut p = Policy::compile(&cfg).unwrap();
        let mut hot = event_with("h1", "cpu", 95.0);
        let mut cold = event_with("h1", "cpu", 1.0);

        assert_eq!(p.evaluate(&mut hot).as_deref(), Some("page"));
        assert_eq!(p.evaluate(&mut cold).as_deref(), Some("page"));
        assert_eq!(cold.status, Status::Ok);
    }
}
