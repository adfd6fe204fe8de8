//! Per-identity attendance percentages over a set of records.

use crate::types::{AttendanceRecord, AttendanceStatus, Identity, IdentityId};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceSummary {
    pub identity_id: IdentityId,
    pub name: String,
    pub present_days: usize,
    /// Days on which anyone in the record set was present.
    pub total_days: usize,
    pub percentage: f64,
}

/// One row per identity, ordered by name then id. Records for identities
/// that are no longer enrolled still count towards `total_days`.
pub fn summarize(records: &[AttendanceRecord], identities: &[Identity]) -> Vec<AttendanceSummary> {
    let present = records.iter().filter(|r| r.status == AttendanceStatus::Present);

    let mut all_days = BTreeSet::new();
    let mut per_identity: HashMap<&str, BTreeSet<NaiveDate>> = HashMap::new();
    for r in present {
        all_days.insert(r.date);
        per_identity.entry(r.identity_id.as_str()).or_default().insert(r.date);
    }
    let total_days = all_days.len();

    let mut rows: Vec<_> = identities
        .iter()
        .map(|identity| {
            let present_days = per_identity.get(identity.id.as_str()).map_or(0, BTreeSet::len);
            let percentage = if total_days == 0 {
                0.0
            } else {
                present_days as f64 * 100.0 / total_days as f64
            };
            AttendanceSummary {
                identity_id: identity.id.clone(),
                name: identity.name.clone(),
                present_days,
                total_days,
                percentage,
            }
        })
        .collect();
    rows.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.identity_id.cmp(&b.identity_id)));
    rows
}
