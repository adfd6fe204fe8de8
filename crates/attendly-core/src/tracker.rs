//! Per-identity attendance session state machine.
//!
//! ```text
//!   Idle ──seen──▶ Active ──no sighting > session_timeout──▶ Cooldown
//!    ▲              ▲  │                                       │  │
//!    │              │  └──────────── seen (same day) ◀─────────┘  │
//!    └───────────── cooldown_period elapsed ◀─────────────────────┘
//! ```
//!
//! Any non-idle session observed on a later calendar date is forced back to
//! Idle first, so each day starts a fresh attendance cycle.

use crate::config::{ConfigError, PipelineConfig};
use crate::sink::SinkEvent;
use crate::types::{AttendanceRecord, AttendanceStatus, IdentityId, MatchResult};
use chrono::{NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Active,
    Cooldown,
}

/// Mutable per-identity state, created on first match and never removed.
#[derive(Debug, Clone, Default)]
pub struct Session {
    pub state: SessionState,
    pub last_seen_at: Option<NaiveDateTime>,
    pub active_period_start: Option<NaiveDateTime>,
    cooldown_since: Option<NaiveDateTime>,
    /// Date of the attendance record this identity already has, if any.
    recorded_on: Option<NaiveDate>,
}

impl Session {
    fn reset(&mut self) {
        self.state = SessionState::Idle;
        self.active_period_start = None;
        self.cooldown_since = None;
    }
}

/// Converts a stream of matches into at most one record per identity per day.
///
/// Not thread-safe by itself: one owner drives it (the capture loop), which
/// serialises all updates for every identity.
pub struct SessionTracker {
    session_timeout: Duration,
    cooldown_period: Duration,
    sessions: BTreeMap<IdentityId, Session>,
}

impl SessionTracker {
    pub fn new(config: &PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            session_timeout: config.session_timeout,
            cooldown_period: config.cooldown_period,
            sessions: BTreeMap::new(),
        })
    }

    /// Feed one match result. Unknown and ambiguous results are ignored.
    pub fn observe(&mut self, result: &MatchResult) -> Vec<SinkEvent> {
        match result.identity_id() {
            Some(id) => self.mark_seen(id, result.probe.captured_at),
            None => Vec::new(),
        }
    }

    /// Register a sighting of `identity_id` at `t`.
    pub fn mark_seen(&mut self, identity_id: &str, t: NaiveDateTime) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        let session = self.sessions.entry(identity_id.to_string()).or_default();
        roll_over(identity_id, session, t.date(), &mut events);
        if session.state == SessionState::Cooldown {
            let since = session.cooldown_since.unwrap_or(t);
            if elapsed(since, t) >= self.cooldown_period {
                tracing::debug!(identity = identity_id, "cooldown over");
                session.reset();
            }
        }

        match session.state {
            SessionState::Idle => {
                session.state = SessionState::Active;
                session.active_period_start = Some(t);
                session.last_seen_at = Some(t);

                if session.recorded_on == Some(t.date()) {
                    tracing::info!(identity = identity_id, at = %t, "session re-opened; record already exists today");
                    events.push(reopen(identity_id, t.date()));
                } else {
                    session.recorded_on = Some(t.date());
                    tracing::info!(identity = identity_id, at = %t, "attendance marked");
                    events.push(SinkEvent::Record(AttendanceRecord {
                        identity_id: identity_id.to_string(),
                        date: t.date(),
                        time_in: t.time(),
                        time_out: None,
                        status: AttendanceStatus::Present,
                    }));
                }
            }
            SessionState::Active => {
                session.last_seen_at = session.last_seen_at.max(Some(t));
            }
            SessionState::Cooldown => {
                session.state = SessionState::Active;
                session.cooldown_since = None;
                session.last_seen_at = session.last_seen_at.max(Some(t));
                tracing::info!(identity = identity_id, at = %t, "seen during cooldown; session re-opened");
                events.push(reopen(identity_id, t.date()));
            }
        }
        events
    }

    /// Apply timeouts, cooldown expiry and date rollover as of `now`.
    /// Call at least once per processing cycle.
    pub fn evaluate(&mut self, now: NaiveDateTime) -> Vec<SinkEvent> {
        let mut events = Vec::new();

        for (id, session) in self.sessions.iter_mut() {
            if session.state == SessionState::Idle {
                continue;
            }
            roll_over(id, session, now.date(), &mut events);

            match session.state {
                SessionState::Idle => {}
                SessionState::Active => {
                    let Some(last_seen) = session.last_seen_at else {
                        continue;
                    };
                    if elapsed(last_seen, now) > self.session_timeout {
                        session.state = SessionState::Cooldown;
                        session.cooldown_since = Some(now);
                        tracing::info!(identity = %id, last_seen = %last_seen, "session timed out");
                        events.push(SinkEvent::TimeOut {
                            identity_id: id.clone(),
                            date: last_seen.date(),
                            time_out: Some(last_seen.time()),
                        });
                    }
                }
                SessionState::Cooldown => {
                    let since = session.cooldown_since.unwrap_or(now);
                    if elapsed(since, now) >= self.cooldown_period {
                        tracing::debug!(identity = %id, "cooldown over");
                        session.reset();
                    }
                }
            }
        }
        events
    }

    /// Close every open session at its last sighting and return all
    /// sessions to Idle. Used when capture stops.
    pub fn close_all(&mut self) -> Vec<SinkEvent> {
        let mut events = Vec::new();
        for (id, session) in self.sessions.iter_mut() {
            if session.state == SessionState::Active {
                if let Some(last_seen) = session.last_seen_at {
                    tracing::info!(identity = %id, last_seen = %last_seen, "session closed");
                    events.push(SinkEvent::TimeOut {
                        identity_id: id.clone(),
                        date: last_seen.date(),
                        time_out: Some(last_seen.time()),
                    });
                }
            }
            session.reset();
        }
        events
    }

    pub fn state(&self, identity_id: &str) -> SessionState {
        self.sessions.get(identity_id).map(|s| s.state).unwrap_or_default()
    }

    pub fn session(&self, identity_id: &str) -> Option<&Session> {
        self.sessions.get(identity_id)
    }

    /// Number of sessions currently Active.
    pub fn active_count(&self) -> usize {
        self.sessions.values().filter(|s| s.state == SessionState::Active).count()
    }
}

/// Force a session left over from an earlier day back to Idle, closing its
/// record if it was still open.
fn roll_over(identity_id: &str, session: &mut Session, today: NaiveDate, events: &mut Vec<SinkEvent>) {
    if session.state == SessionState::Idle {
        return;
    }
    let Some(last_seen) = session.last_seen_at else {
        return;
    };
    if today <= last_seen.date() {
        return;
    }

    if session.state == SessionState::Active {
        events.push(SinkEvent::TimeOut {
            identity_id: identity_id.to_string(),
            date: last_seen.date(),
            time_out: Some(last_seen.time()),
        });
    }
    tracing::info!(identity = identity_id, from = %last_seen.date(), to = %today, "date rollover; session reset");
    session.reset();
}

fn reopen(identity_id: &str, date: NaiveDate) -> SinkEvent {
    SinkEvent::TimeOut {
        identity_id: identity_id.to_string(),
        date,
        time_out: None,
    }
}

/// Non-negative elapsed time; a clock step backwards counts as zero.
fn elapsed(from: NaiveDateTime, to: NaiveDateTime) -> Duration {
    (to - from).to_std().unwrap_or(Duration::ZERO)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveTime;

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 9, d).unwrap()
    }

    fn at(d: u32, secs: i64) -> NaiveDateTime {
        day(d).and_hms_opt(8, 0, 0).unwrap() + chrono::Duration::seconds(secs)
    }

    fn tracker(timeout: u64, cooldown: u64) -> SessionTracker {
        SessionTracker::new(&PipelineConfig {
            session_timeout: Duration::from_secs(timeout),
            cooldown_period: Duration::from_secs(cooldown),
            ..Default::default()
        })
        .unwrap()
    }

    fn records(events: &[SinkEvent]) -> usize {
        events.iter().filter(|e| matches!(e, SinkEvent::Record(_))).count()
    }

    #[test]
    fn test_idle_to_active_creates_record() {
        let mut t = tracker(30, 10);
        let events = t.mark_seen("A", at(1, 0));
        assert_eq!(t.state("A"), SessionState::Active);
        match &events[..] {
            [SinkEvent::Record(r)] => {
                assert_eq!(r.identity_id, "A");
                assert_eq!(r.date, day(1));
                assert_eq!(r.time_in, NaiveTime::from_hms_opt(8, 0, 0).unwrap());
                assert_eq!(r.time_out, None);
                assert_eq!(r.status, AttendanceStatus::Present);
            }
            other => panic!("unexpected events: {other:?}"),
        }
        assert_eq!(t.session("A").unwrap().active_period_start, Some(at(1, 0)));
    }

    #[test]
    fn test_repeated_sightings_are_idempotent() {
        let mut t = tracker(30, 10);
        let mut all = t.mark_seen("A", at(1, 0));
        for s in 1..200 {
            all.extend(t.mark_seen("A", at(1, s * 5)));
            all.extend(t.evaluate(at(1, s * 5)));
        }
        assert_eq!(records(&all), 1);
        assert_eq!(t.session("A").unwrap().last_seen_at, Some(at(1, 995)));
    }

    #[test]
    fn test_timeout_then_cooldown_then_idle() {
        let mut t = tracker(30, 10);
        t.mark_seen("A", at(1, 0));

        assert!(t.evaluate(at(1, 30)).is_empty());
        assert_eq!(t.state("A"), SessionState::Active);

        let events = t.evaluate(at(1, 31));
        assert_eq!(t.state("A"), SessionState::Cooldown);
        assert_eq!(
            events,
            vec![SinkEvent::TimeOut {
                identity_id: "A".into(),
                date: day(1),
                time_out: Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap()),
            }]
        );

        t.evaluate(at(1, 40));
        assert_eq!(t.state("A"), SessionState::Cooldown);
        t.evaluate(at(1, 31 + 10 + 1));
        assert_eq!(t.state("A"), SessionState::Idle);
        assert_eq!(t.session("A").unwrap().active_period_start, None);
    }

    #[test]
    fn test_cooldown_rematch_reopens_without_new_record() {
        let mut t = tracker(30, 60);
        t.mark_seen("A", at(1, 0));
        t.evaluate(at(1, 31));
        assert_eq!(t.state("A"), SessionState::Cooldown);

        let events = t.mark_seen("A", at(1, 45));
        assert_eq!(t.state("A"), SessionState::Active);
        assert_eq!(records(&events), 0);
        assert_eq!(
            events,
            vec![SinkEvent::TimeOut { identity_id: "A".into(), date: day(1), time_out: None }]
        );

        // The next timeout closes at the latest sighting.
        let events = t.evaluate(at(1, 80));
        assert_eq!(
            events,
            vec![SinkEvent::TimeOut {
                identity_id: "A".into(),
                date: day(1),
                time_out: Some(NaiveTime::from_hms_opt(8, 0, 45).unwrap()),
            }]
        );
    }

    #[test]
    fn test_same_day_after_idle_reuses_record() {
        let mut t = tracker(30, 10);
        t.mark_seen("A", at(1, 0));
        t.evaluate(at(1, 31));
        t.evaluate(at(1, 42));
        assert_eq!(t.state("A"), SessionState::Idle);

        let events = t.mark_seen("A", at(1, 3600));
        assert_eq!(t.state("A"), SessionState::Active);
        assert_eq!(records(&events), 0);
    }

    #[test]
    fn test_rollover_while_active_forces_idle_and_allows_new_record() {
        let mut t = tracker(3600 * 24 * 2, 10);
        t.mark_seen("A", at(1, 0));

        let events = t.evaluate(at(2, 0));
        assert_eq!(t.state("A"), SessionState::Idle);
        assert_eq!(t.session("A").unwrap().active_period_start, None);
        assert_eq!(
            events,
            vec![SinkEvent::TimeOut {
                identity_id: "A".into(),
                date: day(1),
                time_out: Some(NaiveTime::from_hms_opt(8, 0, 0).unwrap()),
            }]
        );

        let events = t.mark_seen("A", at(2, 5));
        assert_eq!(records(&events), 1);
        assert_eq!(t.state("A"), SessionState::Active);
    }

    #[test]
    fn test_rollover_detected_on_sighting() {
        let mut t = tracker(3600 * 24 * 2, 10);
        t.mark_seen("A", at(1, 0));
        let events = t.mark_seen("A", at(2, 0));
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], SinkEvent::TimeOut { date, .. } if *date == day(1)));
        assert!(matches!(&events[1], SinkEvent::Record(r) if r.date == day(2)));
    }

    #[test]
    fn test_rollover_from_cooldown_emits_nothing() {
        let mut t = tracker(30, 3600 * 24 * 2);
        t.mark_seen("A", at(1, 0));
        t.evaluate(at(1, 31));
        assert!(t.evaluate(at(2, 0)).is_empty());
        assert_eq!(t.state("A"), SessionState::Idle);
    }

    #[test]
    fn test_identities_are_independent() {
        let mut t = tracker(30, 10);
        t.mark_seen("A", at(1, 0));
        t.mark_seen("B", at(1, 20));
        let events = t.evaluate(at(1, 31));
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].identity_id(), "A");
        assert_eq!(t.state("B"), SessionState::Active);
        assert_eq!(t.active_count(), 1);
    }

    #[test]
    fn test_unknown_results_are_ignored() {
        use crate::types::{BoundingBox, Embedding, MatchDecision, Probe};
        let mut t = tracker(30, 10);
        let result = MatchResult {
            probe: Probe {
                embedding: Embedding::new(vec![1.0]),
                captured_at: at(1, 0),
                region: BoundingBox { x: 0.0, y: 0.0, width: 1.0, height: 1.0, confidence: 1.0 },
            },
            decision: MatchDecision::Ambiguous { candidates: vec!["A".into(), "B".into()] },
            distance: Some(0.1),
            decided_at: at(1, 0),
        };
        assert!(t.observe(&result).is_empty());
        assert_eq!(t.state("A"), SessionState::Idle);
        assert!(t.session("A").is_none());
    }

    #[test]
    fn test_sighting_after_cooldown_expired_starts_new_period() {
        let mut t = tracker(30, 10);
        t.mark_seen("A", at(1, 0));
        t.evaluate(at(1, 31));
        assert_eq!(t.state("A"), SessionState::Cooldown);

        // No evaluate between cooldown expiry and the next sighting.
        let events = t.mark_seen("A", at(1, 100));
        assert_eq!(t.state("A"), SessionState::Active);
        assert_eq!(t.session("A").unwrap().active_period_start, Some(at(1, 100)));
        assert_eq!(
            events,
            vec![SinkEvent::TimeOut { identity_id: "A".into(), date: day(1), time_out: None }]
        );
    }

    #[test]
    fn test_close_all_closes_active_sessions_at_last_sighting() {
        let mut t = tracker(30, 10);
        t.mark_seen("A", at(1, 0));
        t.mark_seen("A", at(1, 12));
        t.mark_seen("B", at(1, 0));
        t.evaluate(at(1, 31));
        t.mark_seen("A", at(1, 31));
        assert_eq!(t.state("B"), SessionState::Cooldown);

        let events = t.close_all();
        assert_eq!(
            events,
            vec![SinkEvent::TimeOut {
                identity_id: "A".into(),
                date: day(1),
                time_out: Some(NaiveTime::from_hms_opt(8, 0, 31).unwrap()),
            }]
        );
        assert_eq!(t.state("A"), SessionState::Idle);
        assert_eq!(t.state("B"), SessionState::Idle);
        assert_eq!(t.active_count(), 0);

        // Back later the same day: the existing record is re-opened.
        let events = t.mark_seen("A", at(1, 600));
        assert_eq!(records(&events), 0);
        assert_eq!(t.state("A"), SessionState::Active);
    }

    #[test]
    fn test_out_of_order_sighting_keeps_latest() {
        let mut t = tracker(30, 10);
        t.mark_seen("A", at(1, 20));
        t.mark_seen("A", at(1, 10));
        assert_eq!(t.session("A").unwrap().last_seen_at, Some(at(1, 20)));
    }
}
