//! Retention enforcement.
//!
//! A policy like `latest3,days7,months6` is applied per volume name.
//! `latestN` keeps the N youngest versions; each time category buckets
//! versions on natural boundaries in the local timezone and keeps the
//! oldest version of each of the N most recent non-empty buckets — an
//! empty calendar bucket does not consume budget, which is how a younger
//! version ages into an older category.  Protected versions and versions
//! inside the minimum-age window are never removed.

use std::collections::{BTreeMap, HashSet};

use chrono::{Datelike, Local, Timelike};
use tracing::{info, instrument};

use benji_common::{Version, VersionUid};
use benji_meta::locks::LockScope;

use crate::{Engine, EngineError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Category {
    Latest,
    Hours,
    Days,
    Weeks,
    Months,
    Years,
}

impl Category {
    fn parse(text: &str) -> Option<Self> {
        match text {
            "latest" => Some(Category::Latest),
            "hours" => Some(Category::Hours),
            "days" => Some(Category::Days),
            "weeks" => Some(Category::Weeks),
            "months" => Some(Category::Months),
            "years" => Some(Category::Years),
            _ => None,
        }
    }

    /// Bucket identity of a version in the local timezone.
    fn bucket(&self, version: &Version) -> (i32, u32, u32) {
        let local = version.date.with_timezone(&Local);
        match self {
            Category::Latest => unreachable!("latest is not bucketed"),
            Category::Hours => (local.year(), local.ordinal(), local.hour()),
            Category::Days => (local.year(), local.ordinal(), 0),
            Category::Weeks => {
                let week = local.iso_week();
                (week.year(), week.week(), 0)
            }
            Category::Months => (local.year(), local.month(), 0),
            Category::Years => (local.year(), 0, 0),
        }
    }
}

/// Parse `cat1N1,cat2N2,...`; categories may appear at most once.
fn parse_policy(text: &str) -> Result<BTreeMap<Category, u32>, EngineError> {
    let mut rules = BTreeMap::new();
    for part in text.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return Err(EngineError::invalid_policy(text, "empty category"));
        }
        let digits_at = part
            .find(|c: char| c.is_ascii_digit())
            .ok_or_else(|| EngineError::invalid_policy(text, format!("no count in {part:?}")))?;
        let (name, count_text) = part.split_at(digits_at);
        let category = Category::parse(name).ok_or_else(|| {
            EngineError::invalid_policy(text, format!("unknown category {name:?}"))
        })?;
        let count: u32 = count_text
            .parse()
            .map_err(|_| EngineError::invalid_policy(text, format!("bad count {count_text:?}")))?;
        if count == 0 {
            return Err(EngineError::invalid_policy(text, "count must be >= 1"));
        }
        if rules.insert(category, count).is_some() {
            return Err(EngineError::invalid_policy(
                text,
                format!("category {name:?} given twice"),
            ));
        }
    }
    if rules.is_empty() {
        return Err(EngineError::invalid_policy(text, "empty policy"));
    }
    Ok(rules)
}

#[derive(Debug, Default, serde::Serialize)]
pub struct EnforceReport {
    pub kept: Vec<VersionUid>,
    pub removed: Vec<VersionUid>,
    pub dry_run: bool,
}

impl Engine {
    /// Apply a retention policy to every version matching the filter.
    #[instrument(skip(self, filter), fields(policy = %policy_text))]
    pub fn enforce(
        &self,
        policy_text: &str,
        filter: Option<&str>,
        dry_run: bool,
        override_lock: bool,
    ) -> Result<EnforceReport, EngineError> {
        let rules = parse_policy(policy_text)?;
        let versions = self.ls(filter)?;

        let mut by_volume: BTreeMap<String, Vec<Version>> = BTreeMap::new();
        for version in versions {
            by_volume.entry(version.volume.clone()).or_default().push(version);
        }

        let mut report = EnforceReport {
            dry_run,
            ..EnforceReport::default()
        };
        for (volume, mut versions) in by_volume {
            let _lock = self.locks().acquire_exclusive(
                LockScope::Volume(volume.clone()),
                "enforce",
                override_lock,
            )?;
            // Youngest first.
            versions.sort_by(|a, b| b.date.cmp(&a.date).then(b.uid.cmp(&a.uid)));

            let keep = kept_set(&versions, &rules);
            let minimum_age =
                chrono::Duration::days(self.config().disallow_remove_when_younger as i64);
            let now = chrono::Utc::now();

            for version in &versions {
                if keep.contains(&version.uid) {
                    report.kept.push(version.uid.clone());
                    continue;
                }
                if version.protected {
                    report.kept.push(version.uid.clone());
                    continue;
                }
                if now.signed_duration_since(version.date) < minimum_age {
                    report.kept.push(version.uid.clone());
                    continue;
                }
                if !dry_run {
                    self.remove(&version.uid, false, override_lock)?;
                }
                report.removed.push(version.uid.clone());
            }
        }

        info!(
            kept = report.kept.len(),
            removed = report.removed.len(),
            dry_run,
            "enforcement finished"
        );
        Ok(report)
    }
}

/// The kept set for one volume's versions (already youngest-first).
fn kept_set(versions: &[Version], rules: &BTreeMap<Category, u32>) -> HashSet<VersionUid> {
    let mut keep = HashSet::new();

    if let Some(count) = rules.get(&Category::Latest) {
        for version in versions.iter().take(*count as usize) {
            keep.insert(version.uid.clone());
        }
    }

    for (category, count) in rules {
        if *category == Category::Latest {
            continue;
        }
        // Walk youngest to oldest, collecting the N most recent non-empty
        // buckets; within each bucket the oldest version wins.
        let mut buckets: Vec<((i32, u32, u32), &Version)> = Vec::new();
        for version in versions {
            let bucket = category.bucket(version);
            match buckets.last_mut() {
                Some((current, oldest)) if *current == bucket => {
                    // Still the same bucket; this version is older.
                    *oldest = version;
                }
                _ => {
                    if buckets.len() == *count as usize {
                        break;
                    }
                    buckets.push((bucket, version));
                }
            }
        }
        for (_, version) in buckets {
            keep.insert(version.uid.clone());
        }
    }

    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::collections::BTreeMap as Map;

    use benji_common::VersionStatus;

    fn version(uid: &str, date: chrono::DateTime<chrono::Utc>) -> Version {
        Version {
            uid: VersionUid::new(uid),
            date,
            volume: "vm1".to_string(),
            snapshot: String::new(),
            size: 0,
            block_size: 4096,
            storage: "local".to_string(),
            status: VersionStatus::Valid,
            protected: false,
            labels: Map::new(),
            bytes_read: 0,
            bytes_written: 0,
            bytes_deduplicated: 0,
            bytes_sparse: 0,
            duration: 0,
        }
    }

    fn daily_versions(count: u32) -> Vec<Version> {
        // Youngest first, one per day at noon UTC.
        (0..count)
            .map(|i| {
                version(
                    &format!("V{:010}", count - i),
                    Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
                        + chrono::Duration::days((count - 1 - i) as i64),
                )
            })
            .collect()
    }

    #[test]
    fn policy_parsing() {
        let rules = parse_policy("latest2,days5").unwrap();
        assert_eq!(rules[&Category::Latest], 2);
        assert_eq!(rules[&Category::Days], 5);

        assert!(parse_policy("").is_err());
        assert!(parse_policy("latest0").is_err());
        assert!(parse_policy("fortnights3").is_err());
        assert!(parse_policy("days1,days2").is_err());
        assert!(parse_policy("days").is_err());
    }

    #[test]
    fn latest2_days5_keeps_exactly_five_of_ten_dailies() {
        let versions = daily_versions(10);
        let rules = parse_policy("latest2,days5").unwrap();
        let keep = kept_set(&versions, &rules);

        // The two youngest plus one per day for the five most recent days;
        // the youngest two days overlap with `latest`.
        assert_eq!(keep.len(), 5);
        for uid in ["V0000000010", "V0000000009", "V0000000008", "V0000000007", "V0000000006"] {
            assert!(keep.contains(&VersionUid::new(uid)), "missing {uid}");
        }
    }

    #[test]
    fn oldest_version_wins_within_a_bucket() {
        // Three versions on the same day: the oldest is the bucket keeper.
        let day = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let versions = vec![
            version("V0000000003", day + chrono::Duration::hours(18)),
            version("V0000000002", day + chrono::Duration::hours(12)),
            version("V0000000001", day + chrono::Duration::hours(6)),
        ];
        let rules = parse_policy("days1").unwrap();
        let keep = kept_set(&versions, &rules);
        assert_eq!(keep.len(), 1);
        assert!(keep.contains(&VersionUid::new("V0000000001")));
    }

    #[test]
    fn empty_calendar_buckets_do_not_consume_budget() {
        // Two versions a month apart, policy days2: both survive because
        // only non-empty day buckets count.
        let versions = vec![
            version("V0000000002", Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()),
            version("V0000000001", Utc.with_ymd_and_hms(2024, 2, 1, 12, 0, 0).unwrap()),
        ];
        let rules = parse_policy("days2").unwrap();
        let keep = kept_set(&versions, &rules);
        assert_eq!(keep.len(), 2);
    }

    #[test]
    fn kept_set_is_idempotent() {
        let versions = daily_versions(10);
        let rules = parse_policy("latest2,days5").unwrap();
        let keep = kept_set(&versions, &rules);

        // Enforcing again over only the survivors keeps the same set.
        let survivors: Vec<Version> = versions
            .into_iter()
            .filter(|v| keep.contains(&v.uid))
            .collect();
        let again = kept_set(&survivors, &rules);
        assert_eq!(keep, again);
    }

    #[test]
    fn weeks_bucket_on_iso_weeks() {
        // Sunday and the following Monday land in different ISO weeks.
        let versions = vec![
            version("V0000000002", Utc.with_ymd_and_hms(2024, 3, 4, 12, 0, 0).unwrap()),
            version("V0000000001", Utc.with_ymd_and_hms(2024, 3, 3, 12, 0, 0).unwrap()),
        ];
        let rules = parse_policy("weeks2").unwrap();
        let keep = kept_set(&versions, &rules);
        assert_eq!(keep.len(), 2);
    }
}
