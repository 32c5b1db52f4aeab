use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use log::{error, info};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::store::helpers::{format_datetime, parse_datetime, to_i32, to_u16, to_u32};
use crate::store::migrations::run_migrations;
use crate::store::{PersistenceError, PersistenceGateway};
use crate::types::{EventKind, OpenSession, Sample, SessionEvent, StoredSample};

/// SQLite-backed gateway. One connection, guarded by a mutex, released by `close`.
pub struct SqliteGateway {
    conn: Mutex<Option<Connection>>,
    location: String,
}

fn row_to_stored_sample(row: &Row) -> Result<StoredSample, PersistenceError> {
    let captured_at: String = row.get("captured_at")?;
    Ok(StoredSample {
        id: row.get("id")?,
        device_id: row.get("device_id")?,
        capture_time: parse_datetime(&captured_at, "captured_at")?,
        device_time: to_u32(row.get("device_time")?, "device_time")?,
        raw_gsr: to_u16(row.get("gsr_raw")?, "gsr_raw")?,
        raw_ppg: to_i32(row.get("ppg_raw")?, "ppg_raw")?,
    })
}

fn row_to_event(row: &Row) -> Result<SessionEvent, PersistenceError> {
    let kind: String = row.get("kind")?;
    let occurred_at: String = row.get("occurred_at")?;
    Ok(SessionEvent {
        device_id: row.get("device_id")?,
        subject_id: row.get("subject_id")?,
        kind: kind
            .parse::<EventKind>()
            .map_err(PersistenceError::InvalidData)?,
        label: row.get("label")?,
        timestamp: parse_datetime(&occurred_at, "occurred_at")?,
    })
}

impl SqliteGateway {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path)?;
        if let Err(err) = conn.pragma_update(None, "journal_mode", "WAL") {
            error!("Failed to enable WAL mode: {err}");
        }
        Self::from_connection(conn, path.display().to_string())
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        Self::from_connection(Connection::open_in_memory()?, ":memory:".to_string())
    }

    fn from_connection(mut conn: Connection, location: String) -> Result<Self, PersistenceError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        run_migrations(&mut conn)?;
        info!("Database initialized at {location}");
        Ok(Self {
            conn: Mutex::new(Some(conn)),
            location,
        })
    }

    fn lock(&self) -> MutexGuard<'_, Option<Connection>> {
        match self.conn.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Runs `task` against the open connection.
    pub fn execute<F, T>(&self, task: F) -> Result<T, PersistenceError>
    where
        F: FnOnce(&mut Connection) -> Result<T, PersistenceError>,
    {
        let mut guard = self.lock();
        let conn = guard.as_mut().ok_or(PersistenceError::Closed)?;
        task(conn)
    }

    /// Every stored sample of a device, in capture order.
    pub fn samples_for_device(&self, device_id: i64) -> Result<Vec<StoredSample>, PersistenceError> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, device_id, captured_at, device_time, gsr_raw, ppg_raw
                 FROM sensor_samples
                 WHERE device_id = ?1
                 ORDER BY captured_at ASC, id ASC",
            )?;

            let mut rows = stmt.query(params![device_id])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_stored_sample(row)?);
            }
            Ok(samples)
        })
    }

    pub fn session_events_for_device(
        &self,
        device_id: i64,
    ) -> Result<Vec<SessionEvent>, PersistenceError> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT device_id, subject_id, kind, label, occurred_at
                 FROM session_events
                 WHERE device_id = ?1
                 ORDER BY id ASC",
            )?;

            let mut rows = stmt.query(params![device_id])?;
            let mut events = Vec::new();
            while let Some(row) = rows.next()? {
                events.push(row_to_event(row)?);
            }
            Ok(events)
        })
    }
}

impl PersistenceGateway for SqliteGateway {
    fn upsert_device(
        &self,
        name: &str,
        port: &str,
        battery_percent: u8,
    ) -> Result<i64, PersistenceError> {
        self.execute(|conn| {
            let id = conn.query_row(
                "INSERT INTO devices (name, port, battery_percent, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE
                 SET port = excluded.port,
                     battery_percent = excluded.battery_percent,
                     updated_at = excluded.updated_at
                 RETURNING id",
                params![name, port, battery_percent, format_datetime(&Utc::now())],
                |row| row.get(0),
            )?;
            Ok(id)
        })
    }

    fn insert_sample(&self, device_id: i64, sample: &Sample) -> Result<(), PersistenceError> {
        self.execute(|conn| {
            conn.execute(
                "INSERT INTO sensor_samples (device_id, captured_at, device_time, gsr_raw, ppg_raw)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    device_id,
                    format_datetime(&sample.capture_time),
                    sample.device_time,
                    sample.raw_gsr,
                    sample.raw_ppg,
                ],
            )?;
            Ok(())
        })
    }

    fn insert_session_event(&self, event: &SessionEvent) -> Result<(), PersistenceError> {
        self.execute(|conn| {
            conn.execute(
                "INSERT INTO session_events (device_id, subject_id, kind, label, occurred_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    event.device_id,
                    event.subject_id,
                    event.kind.as_str(),
                    event.label,
                    format_datetime(&event.timestamp),
                ],
            )?;
            Ok(())
        })
    }

    fn find_open_session_start(
        &self,
        device_id: i64,
    ) -> Result<Option<OpenSession>, PersistenceError> {
        self.execute(|conn| {
            let found: Option<(Option<i64>, String, String)> = conn
                .query_row(
                    "SELECT s.subject_id, s.label, s.occurred_at
                     FROM session_events s
                     WHERE s.device_id = ?1
                       AND s.kind = ?2
                       AND NOT EXISTS (
                           SELECT 1 FROM session_events e
                           WHERE e.device_id = s.device_id
                             AND e.kind = ?3
                             AND e.id > s.id
                       )
                     ORDER BY s.id DESC
                     LIMIT 1",
                    params![
                        device_id,
                        EventKind::SessionStart.as_str(),
                        EventKind::SessionStop.as_str(),
                    ],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()?;

            match found {
                Some((subject_id, label, occurred_at)) => Ok(Some(OpenSession {
                    subject_id,
                    label,
                    started_at: parse_datetime(&occurred_at, "occurred_at")?,
                })),
                None => Ok(None),
            }
        })
    }

    fn fetch_replay_window(
        &self,
        device_id: i64,
    ) -> Result<Option<Vec<StoredSample>>, PersistenceError> {
        self.execute(|conn| {
            let start: Option<(i64, String)> = conn
                .query_row(
                    "SELECT id, occurred_at FROM session_events
                     WHERE device_id = ?1 AND kind = ?2
                     ORDER BY id DESC
                     LIMIT 1",
                    params![device_id, EventKind::ReplayStart.as_str()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((start_id, start_at)) = start else {
                return Ok(None);
            };

            let end_at: Option<String> = conn
                .query_row(
                    "SELECT occurred_at FROM session_events
                     WHERE device_id = ?1 AND kind = ?2 AND id > ?3
                     ORDER BY id ASC
                     LIMIT 1",
                    params![device_id, EventKind::ReplayEnd.as_str(), start_id],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(end_at) = end_at else {
                return Ok(None);
            };

            let mut stmt = conn.prepare(
                "SELECT id, device_id, captured_at, device_time, gsr_raw, ppg_raw
                 FROM sensor_samples
                 WHERE captured_at BETWEEN ?1 AND ?2
                 ORDER BY captured_at ASC, id ASC",
            )?;
            let mut rows = stmt.query(params![start_at, end_at])?;
            let mut samples = Vec::new();
            while let Some(row) = rows.next()? {
                samples.push(row_to_stored_sample(row)?);
            }
            Ok(Some(samples))
        })
    }

    fn close(&self) -> Result<(), PersistenceError> {
        let taken = self.lock().take();
        match taken {
            Some(conn) => {
                conn.close().map_err(|(_, err)| PersistenceError::Sqlite(err))?;
                info!("Database connection closed ({})", self.location);
                Ok(())
            }
            None => Ok(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.lock().is_none()
    }
}
