//! Event sink contract: where attendance transitions end up.

use crate::types::{AttendanceRecord, IdentityId};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SinkError {
    #[error("sink unavailable: {0}")]
    Unavailable(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("sink dispatcher closed")]
    Closed,
}

/// Inclusive calendar date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub from: NaiveDate,
    pub to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> Self {
        Self { from, to }
    }

    pub fn day(date: NaiveDate) -> Self {
        Self { from: date, to: date }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.from <= date && date <= self.to
    }
}

/// A session tracker transition that must be persisted.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// First sighting of the day.
    Record(AttendanceRecord),
    /// Close (`Some`) or re-open (`None`) the day's record.
    TimeOut {
        identity_id: IdentityId,
        date: NaiveDate,
        time_out: Option<NaiveTime>,
    },
}

impl SinkEvent {
    pub fn identity_id(&self) -> &str {
        match self {
            SinkEvent::Record(r) => &r.identity_id,
            SinkEvent::TimeOut { identity_id, .. } => identity_id,
        }
    }
}

/// Persists attendance records and answers reporting queries.
///
/// `record` must be idempotent per (identity, date): a second record for the
/// same pair keeps the first `time_in` and re-opens the record (clears
/// `time_out`), since it means the identity is present again.
pub trait EventSink: Send {
    fn record(&mut self, record: &AttendanceRecord) -> Result<(), SinkError>;

    fn update_time_out(
        &mut self,
        identity_id: &str,
        date: NaiveDate,
        time_out: Option<NaiveTime>,
    ) -> Result<(), SinkError>;

    /// Records in `range`, optionally for one identity, ordered by date then time in.
    fn query(&mut self, range: DateRange, identity_id: Option<&str>) -> Result<Vec<AttendanceRecord>, SinkError>;

    fn apply(&mut self, event: &SinkEvent) -> Result<(), SinkError> {
        match event {
            SinkEvent::Record(r) => self.record(r),
            SinkEvent::TimeOut { identity_id, date, time_out } => {
                self.update_time_out(identity_id, *date, *time_out)
            }
        }
    }
}

/// Volatile sink; clones share the same rows.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    rows: Arc<Mutex<Vec<AttendanceRecord>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<AttendanceRecord> {
        self.rows.lock().map(|rows| rows.clone()).unwrap_or_default()
    }

    fn rows(&self) -> Result<std::sync::MutexGuard<'_, Vec<AttendanceRecord>>, SinkError> {
        self.rows.lock().map_err(|_| SinkError::Storage("memory sink poisoned".into()))
    }
}

impl EventSink for MemorySink {
    fn record(&mut self, record: &AttendanceRecord) -> Result<(), SinkError> {
        let mut rows = self.rows()?;
        match rows.iter_mut().find(|r| r.identity_id == record.identity_id && r.date == record.date) {
            Some(existing) => existing.time_out = record.time_out,
            None => rows.push(record.clone()),
        }
        Ok(())
    }

    fn update_time_out(
        &mut self,
        identity_id: &str,
        date: NaiveDate,
        time_out: Option<NaiveTime>,
    ) -> Result<(), SinkError> {
        let mut rows = self.rows()?;
        match rows.iter_mut().find(|r| r.identity_id == identity_id && r.date == date) {
            Some(row) => row.time_out = time_out,
            None => tracing::debug!(identity = identity_id, %date, "time_out update for unknown record"),
        }
        Ok(())
    }

    fn query(&mut self, range: DateRange, identity_id: Option<&str>) -> Result<Vec<AttendanceRecord>, SinkError> {
        let rows = self.rows()?;
        let mut out: Vec<_> = rows
            .iter()
            .filter(|r| range.contains(r.date))
            .filter(|r| identity_id.map_or(true, |id| r.identity_id == id))
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.date, a.time_in).cmp(&(b.date, b.time_in)));
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AttendanceStatus;

    fn record(id: &str, day: u32, hour: u32) -> AttendanceRecord {
        AttendanceRecord {
            identity_id: id.into(),
            date: NaiveDate::from_ymd_opt(2024, 5, day).unwrap(),
            time_in: NaiveTime::from_hms_opt(hour, 0, 0).unwrap(),
            time_out: None,
            status: AttendanceStatus::Present,
        }
    }

    #[test]
    fn test_memory_sink_record_is_idempotent() {
        let mut sink = MemorySink::new();
        sink.record(&record("a", 1, 9)).unwrap();
        sink.record(&record("a", 1, 11)).unwrap();
        let rows = sink.records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_in, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_memory_sink_repeat_record_reopens() {
        let mut sink = MemorySink::new();
        sink.record(&record("a", 1, 9)).unwrap();
        let day = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        sink.update_time_out("a", day, NaiveTime::from_hms_opt(10, 0, 0)).unwrap();
        sink.record(&record("a", 1, 13)).unwrap();
        let rows = sink.records();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].time_out, None);
        assert_eq!(rows[0].time_in, NaiveTime::from_hms_opt(9, 0, 0).unwrap());
    }

    #[test]
    fn test_memory_sink_apply_time_out() {
        let mut sink = MemorySink::new();
        sink.apply(&SinkEvent::Record(record("a", 1, 9))).unwrap();
        let out = NaiveTime::from_hms_opt(10, 30, 0).unwrap();
        sink.apply(&SinkEvent::TimeOut {
            identity_id: "a".into(),
            date: NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            time_out: Some(out),
        })
        .unwrap();
        assert_eq!(sink.records()[0].time_out, Some(out));
    }

    #[test]
    fn test_memory_sink_query_filters_and_orders() {
        let mut sink = MemorySink::new();
        sink.record(&record("b", 2, 8)).unwrap();
        sink.record(&record("a", 2, 7)).unwrap();
        sink.record(&record("a", 1, 9)).unwrap();
        sink.record(&record("a", 5, 9)).unwrap();

        let range = DateRange::new(
            NaiveDate::from_ymd_opt(2024, 5, 1).unwrap(),
            NaiveDate::from_ymd_opt(2024, 5, 2).unwrap(),
        );
        let all = sink.query(range, None).unwrap();
        let keys: Vec<_> = all.iter().map(|r| (r.identity_id.as_str(), r.date.format("%d").to_string())).collect();
        assert_eq!(keys, vec![("a", "01".into()), ("a", "02".into()), ("b", "02".into())]);

        let only_b = sink.query(range, Some("b")).unwrap();
        assert_eq!(only_b.len(), 1);
    }
}
