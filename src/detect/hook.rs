//! Fail-open trigger hooks.
//!
//! The breaker only decides. What "failing open" means for a deployment
//! (bypassing verification, relaxing strictness, paging someone) belongs to
//! the hook the caller installs.

use std::sync::Mutex;

use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use uuid::Uuid;

use crate::detect::Severity;
use crate::store::sqlite::Pool;

/// Raised once per confirmed anomalous window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TripEvent {
    pub namespace: String,
    pub bucket_id: String,
    pub reason: String,
    pub rate_percent: f64,
    pub z_score: f64,
    pub severity: Severity,
    pub tripped_at: DateTime<Utc>,
}

/// Receives trip events. Implementations own their own failure handling.
pub trait FailOpenHook: Send + Sync {
    fn trigger(&self, event: &TripEvent);
}

impl<F> FailOpenHook for F
where
    F: Fn(&TripEvent) + Send + Sync,
{
    fn trigger(&self, event: &TripEvent) {
        self(event)
    }
}

/// Default hook: a warning log line and nothing else.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHook;

impl FailOpenHook for LogHook {
    fn trigger(&self, event: &TripEvent) {
        warn!(
            namespace = %event.namespace,
            bucket = %event.bucket_id,
            severity = ?event.severity,
            z_score = event.z_score,
            "fail-open triggered: {}",
            event.reason
        );
    }
}

/// Keeps every event in memory.
#[derive(Debug, Default)]
pub struct RecordingHook {
    events: Mutex<Vec<TripEvent>>,
}

impl RecordingHook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<TripEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl FailOpenHook for RecordingHook {
    fn trigger(&self, event: &TripEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event.clone());
    }
}

/// A trip as stored in the incident log.
#[derive(Debug, Clone, Serialize)]
pub struct Incident {
    pub id: Uuid,
    pub severity: Severity,
    pub reason: String,
    pub evidence: TripEvent,
    pub created_at: DateTime<Utc>,
}

/// Persists trips to the `incidents` table so operators can review them later.
pub struct IncidentLog {
    pool: Pool,
}

impl IncidentLog {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn record(&self, event: &TripEvent) -> Result<Uuid> {
        let conn = self.pool.get()?;
        let id = Uuid::new_v4();
        let severity_str = format!("{:?}", event.severity);
        let evidence_json = serde_json::to_string(event)?;

        conn.execute(
            "INSERT INTO incidents (id, namespace, bucket_id, severity, reason, evidence_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                id.to_string(),
                event.namespace,
                event.bucket_id,
                severity_str,
                event.reason,
                evidence_json,
                event.tripped_at.to_rfc3339()
            ],
        )?;

        Ok(id)
    }

    /// Most recent trips first. Rows that no longer parse are skipped.
    pub fn list_recent(&self, limit: usize) -> Result<Vec<Incident>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, severity, reason, evidence_json, created_at FROM incidents
             ORDER BY created_at DESC LIMIT ?1",
        )?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut incidents = Vec::new();
        for r in rows {
            let (id, severity, reason, evidence, created_at) = r?;
            let parsed = (
                Uuid::parse_str(&id),
                serde_json::from_str::<TripEvent>(&evidence),
                DateTime::parse_from_rfc3339(&created_at),
            );
            match parsed {
                (Ok(id), Ok(evidence), Ok(created_at)) => incidents.push(Incident {
                    id,
                    severity: Severity::parse(&severity),
                    reason,
                    evidence,
                    created_at: created_at.with_timezone(&Utc),
                }),
                _ => warn!(%id, "skipping unreadable incident row"),
            }
        }
        Ok(incidents)
    }
}

impl FailOpenHook for IncidentLog {
    fn trigger(&self, event: &TripEvent) {
        LogHook.trigger(event);
        if let Err(e) = self.record(event) {
            error!(bucket = %event.bucket_id, error = %e, "failed to record fail-open incident");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::sqlite::open_pool;
    use chrono::{Duration, TimeZone};

    fn event(bucket: &str, at: DateTime<Utc>) -> TripEvent {
        TripEvent {
            namespace: "captcha".to_string(),
            bucket_id: bucket.to_string(),
            reason: "success rate 50.00% is -34.16 standard deviations".to_string(),
            rate_percent: 50.0,
            z_score: -34.16,
            severity: Severity::Critical,
            tripped_at: at,
        }
    }

    #[test]
    fn test_incident_log_roundtrip_newest_first() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let log = IncidentLog::new(open_pool(&dir.path().join("incidents.db"), 1000)?);
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 4, 0, 0).unwrap();

        log.trigger(&event("2024-05-01_0", t0));
        log.trigger(&event("2024-05-01_1", t0 + Duration::hours(4)));

        let incidents = log.list_recent(10)?;
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].evidence.bucket_id, "2024-05-01_1");
        assert_eq!(incidents[0].severity, Severity::Critical);
        assert_eq!(incidents[1].created_at, t0);

        assert_eq!(log.list_recent(1)?.len(), 1);
        Ok(())
    }

    #[test]
    fn test_closure_and_recording_hooks() {
        let recorder = RecordingHook::new();
        let t0 = Utc.with_ymd_and_hms(2024, 5, 1, 4, 0, 0).unwrap();
        recorder.trigger(&event("b", t0));
        assert_eq!(recorder.events().len(), 1);

        let seen = Mutex::new(Vec::new());
        let hook = |e: &TripEvent| seen.lock().unwrap().push(e.bucket_id.clone());
        hook.trigger(&event("c", t0));
        assert_eq!(seen.into_inner().unwrap(), vec!["c".to_string()]);
    }
}
