//! ---
//! ems_section: "04-configuration-orchestration"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Fleet-wide orchestration of per-runtime operations."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Maintenance policy model and the window evaluator.
//!
//! Window times use the compact `HHMMSS±hhmm` form, e.g. `020000+0000`.

use std::collections::BTreeSet;

use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveDate, NaiveTime, Offset,
    TimeZone, Utc, Weekday,
};
use fleet_store::{MaintenanceWindow, Runtime};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{OrchestrationError, Result};

/// Optional regex patterns a rule matches against. Empty fields match
/// everything.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePolicyMatch {
    /// Plan name pattern.
    #[serde(default)]
    pub plan: String,
    /// Global account pattern.
    #[serde(default, rename = "globalAccountID")]
    pub global_account_id: String,
    /// Region pattern.
    #[serde(default)]
    pub region: String,
}

/// Window settings. Unset fields keep the previous value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MaintenancePolicyEntry {
    /// Allowed weekdays (`Mon`, `Tue`, ...).
    #[serde(default)]
    pub days: Vec<String>,
    /// Daily window start, `HHMMSS±hhmm`.
    #[serde(default)]
    pub time_begin: String,
    /// Daily window end, `HHMMSS±hhmm`.
    #[serde(default)]
    pub time_end: String,
}

/// Rule applied to runtimes matching `match`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenancePolicyRule {
    /// Selector.
    #[serde(rename = "match", default)]
    pub matcher: MaintenancePolicyMatch,
    /// Window applied on match.
    #[serde(flatten)]
    pub window: MaintenancePolicyEntry,
}

/// Ordered rules plus a fallback entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenancePolicy {
    /// First matching rule wins.
    #[serde(default)]
    pub rules: Vec<MaintenancePolicyRule>,
    /// Applied when no rule matches.
    #[serde(default)]
    pub default: MaintenancePolicyEntry,
}

#[derive(Debug, Clone, Copy)]
struct WindowTime {
    time: NaiveTime,
    offset: FixedOffset,
}

impl WindowTime {
    fn midnight_utc() -> Self {
        Self {
            time: NaiveTime::MIN,
            offset: Utc.fix(),
        }
    }

    /// Compose the time of day with `date`, interpreted in the window's offset.
    fn on(&self, date: NaiveDate) -> Option<DateTime<Utc>> {
        self.offset
            .from_local_datetime(&date.and_time(self.time))
            .single()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Parse `HHMMSS±hhmm`.
fn parse_window_time(value: &str) -> Option<WindowTime> {
    if value.len() != 11 || !value.is_ascii() {
        return None;
    }
    let (clock, zone) = value.split_at(6);
    let time = NaiveTime::parse_from_str(clock, "%H%M%S").ok()?;
    let sign = match &zone[..1] {
        "+" => 1,
        "-" => -1,
        _ => return None,
    };
    let hours: i32 = zone[1..3].parse().ok()?;
    let minutes: i32 = zone[3..5].parse().ok()?;
    let offset = FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))?;
    Some(WindowTime { time, offset })
}

fn compile_pattern(rule: usize, field: &str, pattern: &str) -> Result<Option<Regex>> {
    if pattern.is_empty() {
        return Ok(None);
    }
    Regex::new(pattern).map(Some).map_err(|err| {
        OrchestrationError::Policy(format!("rule {rule}: {field} pattern {pattern}: {err}"))
    })
}

#[derive(Debug, Clone)]
struct CompiledRule {
    plan: Option<Regex>,
    global_account_id: Option<Regex>,
    region: Option<Regex>,
    window: MaintenancePolicyEntry,
}

impl CompiledRule {
    /// True when every populated pattern matches.
    fn matches(&self, runtime: &Runtime) -> bool {
        fn hit(pattern: &Option<Regex>, value: &str) -> bool {
            pattern.as_ref().map_or(true, |re| re.is_match(value))
        }
        hit(&self.plan, &runtime.plan)
            && hit(&self.global_account_id, &runtime.global_account_id)
            && hit(&self.region, &runtime.region)
    }
}

/// A [`MaintenancePolicy`] with its rule patterns compiled, ready to be
/// evaluated against many runtimes.
#[derive(Debug, Clone, Default)]
pub struct CompiledPolicy {
    rules: Vec<CompiledRule>,
    default: MaintenancePolicyEntry,
}

impl MaintenancePolicy {
    /// Compile every rule pattern. The first invalid pattern rejects the
    /// whole policy.
    pub fn compile(&self) -> Result<CompiledPolicy> {
        let rules = self
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let matcher = &rule.matcher;
                Ok(CompiledRule {
                    plan: compile_pattern(index, "plan", &matcher.plan)?,
                    global_account_id: compile_pattern(index, "globalAccountID", &matcher.global_account_id)?,
                    region: compile_pattern(index, "region", &matcher.region)?,
                    window: rule.window.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(CompiledPolicy {
            rules,
            default: self.default.clone(),
        })
    }
}

struct Resolved {
    days: Vec<String>,
    begin: WindowTime,
    end: WindowTime,
}

impl Resolved {
    fn apply(&mut self, entry: &MaintenancePolicyEntry) {
        if !entry.days.is_empty() {
            self.days = entry.days.clone();
        }
        if let Some(begin) = parse_window_time(&entry.time_begin) {
            self.begin = begin;
        }
        if let Some(end) = parse_window_time(&entry.time_end) {
            self.end = end;
        }
    }
}

fn parse_days(days: &[String]) -> BTreeSet<u32> {
    days.iter()
        .filter_map(|day| day.trim().parse::<Weekday>().ok())
        .map(|day| day.num_days_from_monday())
        .collect()
}

/// Days from `today` to the first allowed weekday, today included (0..=6).
fn first_available_day_diff(today: Weekday, allowed: &BTreeSet<u32>) -> i64 {
    let today = today.num_days_from_monday();
    (0..7)
        .find(|shift| allowed.contains(&((today + shift) % 7)))
        .map_or(0, i64::from)
}

/// Days from `today` to the next allowed weekday after today (1..=7).
fn next_available_day_diff(today: Weekday, allowed: &BTreeSet<u32>) -> i64 {
    let today = today.num_days_from_monday();
    (1..=7)
        .find(|shift| allowed.contains(&((today + shift) % 7)))
        .map_or(7, i64::from)
}

/// Next window in which a disruptive action may run for `runtime`.
///
/// The first rule whose populated patterns all match supplies the fields it
/// sets; otherwise the default entry does. The daily window is composed with
/// the later of `now` and `earliest`, moved to the first allowed weekday and,
/// if it already ended, to the next allowed weekday. `None` means no
/// constraint: no allowed days or nothing usable in the policy.
pub fn resolve_window(
    runtime: &Runtime,
    policy: &CompiledPolicy,
    earliest: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<MaintenanceWindow> {
    let mut resolved = Resolved {
        days: Vec::new(),
        begin: WindowTime::midnight_utc(),
        end: WindowTime::midnight_utc(),
    };
    match policy.rules.iter().find(|rule| rule.matches(runtime)) {
        Some(rule) => resolved.apply(&rule.window),
        None => resolved.apply(&policy.default),
    }

    let allowed = parse_days(&resolved.days);
    if allowed.is_empty() {
        return None;
    }

    let reference = match earliest {
        Some(earliest) if earliest > now => earliest,
        _ => now,
    };
    let date = reference.date_naive();
    let shift = ChronoDuration::days(first_available_day_diff(reference.weekday(), &allowed));
    let mut begin = resolved.begin.on(date)? + shift;
    let mut end = resolved.end.on(date)? + shift;

    if end <= begin {
        end += ChronoDuration::days(1);
    }

    if begin < reference && end < reference {
        let shift = ChronoDuration::days(next_available_day_diff(reference.weekday(), &allowed));
        begin += shift;
        end += shift;
    }

    Some(MaintenanceWindow {
        begin,
        end,
        days: resolved.days,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runtime(plan: &str, region: &str) -> Runtime {
        Runtime {
            instance_id: "inst-1".into(),
            runtime_id: "rt-1".into(),
            global_account_id: "ga-1".into(),
            plan: plan.into(),
            region: region.into(),
            ..Runtime::default()
        }
    }

    fn entry(days: &[&str], begin: &str, end: &str) -> MaintenancePolicyEntry {
        MaintenancePolicyEntry {
            days: days.iter().map(|d| d.to_string()).collect(),
            time_begin: begin.into(),
            time_end: end.into(),
        }
    }

    fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn default_entry_moves_to_next_allowed_day() {
        let policy = MaintenancePolicy {
            rules: Vec::new(),
            default: entry(&["Mon", "Wed"], "020000+0000", "040000+0000"),
        };
        // 2024-01-02 is a Tuesday
        let window = resolve_window(&runtime("azure", "westeurope"), &policy.compile().unwrap(), None, at(2024, 1, 2, 12, 0))
            .expect("window");
        assert_eq!(window.begin, at(2024, 1, 3, 2, 0));
        assert_eq!(window.end, at(2024, 1, 3, 4, 0));
        assert_eq!(window.days, vec!["Mon", "Wed"]);
    }

    #[test]
    fn passed_window_today_advances_to_next_allowed_day() {
        let policy = MaintenancePolicy {
            rules: Vec::new(),
            default: entry(&["Tue", "Fri"], "020000+0000", "040000+0000"),
        };
        let window = resolve_window(&runtime("azure", "eu"), &policy.compile().unwrap(), None, at(2024, 1, 2, 12, 0))
            .expect("window");
        assert_eq!(window.begin, at(2024, 1, 5, 2, 0));
    }

    #[test]
    fn window_in_progress_today_is_kept() {
        let policy = MaintenancePolicy {
            rules: Vec::new(),
            default: entry(&["Tue"], "100000+0000", "140000+0000"),
        };
        let window = resolve_window(&runtime("azure", "eu"), &policy.compile().unwrap(), None, at(2024, 1, 2, 12, 0))
            .expect("window");
        assert_eq!(window.begin, at(2024, 1, 2, 10, 0));
        assert_eq!(window.end, at(2024, 1, 2, 14, 0));
    }

    #[test]
    fn overnight_window_crosses_midnight() {
        let policy = MaintenancePolicy {
            rules: Vec::new(),
            default: entry(&["Wed"], "220000+0000", "020000+0000"),
        };
        let window = resolve_window(&runtime("azure", "eu"), &policy.compile().unwrap(), None, at(2024, 1, 2, 12, 0))
            .expect("window");
        assert_eq!(window.begin, at(2024, 1, 3, 22, 0));
        assert_eq!(window.end, at(2024, 1, 4, 2, 0));
    }

    #[test]
    fn first_matching_rule_overrides_only_what_it_sets() {
        let policy = MaintenancePolicy {
            rules: vec![
                MaintenancePolicyRule {
                    matcher: MaintenancePolicyMatch {
                        plan: "^trial$".into(),
                        ..Default::default()
                    },
                    window: entry(&["Sun"], "", ""),
                },
                MaintenancePolicyRule {
                    matcher: MaintenancePolicyMatch {
                        region: "^us-".into(),
                        ..Default::default()
                    },
                    window: entry(&["Thu"], "010000-0500", "030000-0500"),
                },
            ],
            default: entry(&["Mon"], "020000+0000", "040000+0000"),
        };
        let window = resolve_window(&runtime("azure", "us-east"), &policy.compile().unwrap(), None, at(2024, 1, 2, 12, 0))
            .expect("window");
        // Thursday 01:00 at -05:00 is 06:00 UTC
        assert_eq!(window.begin, at(2024, 1, 4, 6, 0));
        assert_eq!(window.end, at(2024, 1, 4, 8, 0));

        // the trial rule sets days only; the time of day falls back to midnight
        let trial = resolve_window(&runtime("trial", "us-east"), &policy.compile().unwrap(), None, at(2024, 1, 2, 12, 0))
            .expect("window");
        assert_eq!(trial.begin, at(2024, 1, 7, 0, 0));
        assert_eq!(trial.end, at(2024, 1, 8, 0, 0));
    }

    #[test]
    fn schedule_time_is_the_earliest_bound() {
        let policy = MaintenancePolicy {
            rules: Vec::new(),
            default: entry(&["Mon", "Wed"], "020000+0000", "040000+0000"),
        };
        let window = resolve_window(
            &runtime("azure", "eu"),
            &policy.compile().unwrap(),
            Some(at(2024, 1, 4, 0, 0)),
            at(2024, 1, 2, 12, 0),
        )
        .expect("window");
        assert_eq!(window.begin, at(2024, 1, 8, 2, 0));
    }

    #[test]
    fn no_days_means_no_constraint() {
        assert!(resolve_window(
            &runtime("azure", "eu"),
            &CompiledPolicy::default(),
            None,
            at(2024, 1, 2, 12, 0)
        )
        .is_none());
    }

    #[test]
    fn invalid_pattern_rejects_the_policy() {
        let policy = MaintenancePolicy {
            rules: vec![MaintenancePolicyRule {
                matcher: MaintenancePolicyMatch {
                    region: "([".into(),
                    ..Default::default()
                },
                window: entry(&["Sun"], "", ""),
            }],
            default: entry(&["Mon"], "020000+0000", "040000+0000"),
        };
        let err = policy.compile().unwrap_err();
        assert!(matches!(err, OrchestrationError::Policy(_)));
        assert!(err.to_string().contains("rule 0: region pattern (["));
    }

    #[test]
    fn policy_json_uses_wire_names() {
        let policy: MaintenancePolicy = serde_json::from_str(
            r#"{
                "rules": [{"match": {"globalAccountID": "^ga-"}, "days": ["Sat"], "timeBegin": "010000+0000"}],
                "default": {"days": ["Mon"], "timeBegin": "020000+0000", "timeEnd": "030000+0000"}
            }"#,
        )
        .unwrap();
        assert_eq!(policy.rules[0].matcher.global_account_id, "^ga-");
        assert_eq!(policy.rules[0].window.days, vec!["Sat"]);
        assert_eq!(policy.default.time_end, "030000+0000");
    }
}
