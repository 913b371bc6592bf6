#![allow(clippy::missing_errors_doc)]

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, Context, Result};
use reminder_kernel_core::{
    format_millis_rfc3339, now_millis, ActiveEvents, AlarmPurpose, EventAlertRecord, EventUpdate,
    FireCommit, ReminderError, ReminderSettings, SchedulerState,
};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

mod alarm;
mod migration;
mod schema;

pub use alarm::{AlarmOutcome, ReminderCollaborators, WAKE_LOCK_TAG};
pub use schema::SchemaVersion;

use schema::EventsTable;

/// Serializes every store operation in the process, across instances that
/// share a database file.
static STORE_LOCK: Mutex<()> = Mutex::new(());

const STATE_NOTIFICATION_LAST_FIRE: &str = "notification_last_fire_time";
const STATE_REMINDER_LAST_FIRE: &str = "reminder_last_fire_time";
const STATE_NUM_REMINDERS_FIRED: &str = "num_reminders_fired";
const STATE_LAST_TIMER_BROADCAST: &str = "last_timer_broadcast_received";

const SUPPORT_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS scheduler_state (
  state_key TEXT PRIMARY KEY CHECK (
    state_key IN (
      'notification_last_fire_time',
      'reminder_last_fire_time',
      'num_reminders_fired',
      'last_timer_broadcast_received'
    )
  ),
  state_value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS reminder_settings (
  settings_id INTEGER PRIMARY KEY CHECK (settings_id = 1),
  settings_json TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS armed_alarms (
  purpose TEXT PRIMARY KEY CHECK (purpose IN ('reminder')),
  fire_at INTEGER NOT NULL,
  armed_at INTEGER NOT NULL
);
";

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("events schema version {0} is not supported")]
    UnsupportedVersion(i64),
    #[error("events schema cannot be upgraded from version {from} to {to}")]
    UnsupportedUpgrade { from: i64, to: i64 },
    #[error("events schema upgrade {from} -> {to} left {residual} rows behind in the old table")]
    MigrationIntegrity { from: i64, to: i64, residual: usize },
}

/// Alarm the store believes is pending with the timer service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ArmedAlarm {
    pub purpose: AlarmPurpose,
    pub fire_at: i64,
    pub armed_at: i64,
}

pub struct SqliteEventStore {
    conn: Mutex<Connection>,
    schema: SchemaVersion,
}

impl SqliteEventStore {
    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with_version(path, SchemaVersion::CURRENT.number())
    }

    /// Opens the store and upgrades the events schema to `target`.
    ///
    /// An unsupported `target` is rejected before the database file is
    /// opened.
    pub fn open_with_version(path: &Path, target: i64) -> Result<Self> {
        let schema = SchemaVersion::try_from(target)?;

        let mut conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        {
            let _process = lock_process();
            conn.execute_batch(SUPPORT_SCHEMA)
                .context("failed to apply scheduler schema")?;
            migration::upgrade(&mut conn, schema)?;
        }

        debug!(path = %path.display(), version = schema.number(), "event store opened");
        Ok(Self {
            conn: Mutex::new(conn),
            schema,
        })
    }

    pub fn close(self) -> Result<()> {
        let conn = self
            .conn
            .into_inner()
            .map_err(|_| anyhow!("store connection mutex poisoned"))?;
        conn.close()
            .map_err(|(_, err)| err)
            .context("failed to close sqlite database")
    }

    #[must_use]
    pub fn schema(&self) -> SchemaVersion {
        self.schema
    }

    /// Version recorded in the database file.
    pub fn schema_version(&self) -> Result<i64> {
        self.with_conn(|conn, _| migration::read_user_version(conn))
    }

    pub fn add_event(&self, event: &EventAlertRecord) -> Result<()> {
        event
            .validate()
            .map_err(|err| anyhow!("event validation failed: {err}"))?;

        self.with_conn(|conn, table| {
            table.insert(conn, event)?;
            debug!(key = %event.key(), "event stored");
            Ok(())
        })
    }

    pub fn update_event(&self, event: &EventAlertRecord) -> Result<()> {
        self.update_events(std::slice::from_ref(event))
    }

    /// Applies `fields` on top of `event` and writes the result.
    pub fn update_event_fields(
        &self,
        event: &EventAlertRecord,
        fields: &EventUpdate,
    ) -> Result<EventAlertRecord> {
        let updated = fields.apply(event);
        self.update_event(&updated)?;
        Ok(updated)
    }

    /// Writes every record in one transaction; a missing key aborts the batch.
    pub fn update_events(&self, events: &[EventAlertRecord]) -> Result<()> {
        for event in events {
            event
                .validate()
                .map_err(|err| anyhow!("event validation failed: {err}"))?;
        }

        self.with_conn(|conn, table| {
            let tx = conn
                .transaction()
                .context("failed to start event update transaction")?;
            for event in events {
                if !table.update(&tx, event)? {
                    return Err(anyhow!("event {} not found", event.key()));
                }
            }
            tx.commit().context("failed to commit event updates")?;
            debug!(count = events.len(), "events updated");
            Ok(())
        })
    }

    pub fn update_events_fields(
        &self,
        events: &[EventAlertRecord],
        fields: &EventUpdate,
    ) -> Result<Vec<EventAlertRecord>> {
        let updated: Vec<EventAlertRecord> =
            events.iter().map(|event| fields.apply(event)).collect();
        self.update_events(&updated)?;
        Ok(updated)
    }

    /// Moves the alert keyed by `event` to a new instance window, writing the
    /// rest of `event` alongside.
    pub fn update_event_and_instance_times(
        &self,
        event: &EventAlertRecord,
        instance_start: i64,
        instance_end: i64,
    ) -> Result<EventAlertRecord> {
        let moved = EventAlertRecord {
            instance_start_time: instance_start,
            instance_end_time: instance_end,
            ..event.clone()
        };
        moved
            .validate()
            .map_err(|err| anyhow!("event validation failed: {err}"))?;

        self.with_conn(|conn, table| {
            if !table.update_instance_times(conn, event, instance_start, instance_end)? {
                return Err(anyhow!("event {} not found", event.key()));
            }
            debug!(from = %event.key(), to = %moved.key(), "event instance moved");
            Ok(())
        })?;

        Ok(moved)
    }

    pub fn get_event(&self, event_id: i64, instance_start: i64) -> Result<Option<EventAlertRecord>> {
        self.with_conn(|conn, table| table.get(conn, event_id, instance_start))
    }

    pub fn get_event_instances(&self, event_id: i64) -> Result<Vec<EventAlertRecord>> {
        self.with_conn(|conn, table| table.get_instances(conn, event_id))
    }

    pub fn delete_event(&self, event_id: i64, instance_start: i64) -> Result<()> {
        self.with_conn(|conn, table| table.delete(conn, event_id, instance_start))
    }

    pub fn delete_record(&self, event: &EventAlertRecord) -> Result<()> {
        self.delete_event(event.event_id, event.instance_start_time)
    }

    pub fn all_events(&self) -> Result<Vec<EventAlertRecord>> {
        self.with_conn(|conn, table| table.all(conn))
    }

    pub fn has_active_events(&self) -> Result<bool> {
        self.with_conn(|conn, table| table.has_active(conn))
    }

    pub fn settings(&self) -> Result<ReminderSettings> {
        self.with_conn(|conn, _| load_settings(conn))
    }

    pub fn save_settings(&self, settings: &ReminderSettings) -> Result<()> {
        settings
            .validate()
            .map_err(|err| anyhow!("invalid reminder settings: {err}"))?;
        self.with_conn(|conn, _| write_settings(conn, settings, now_millis()))
    }

    pub fn scheduler_state(&self) -> Result<SchedulerState> {
        self.with_conn(|conn, _| load_state(conn))
    }

    /// Diagnostic stamp of the latest timer wake-up.
    pub fn record_timer_broadcast(&self, now: i64) -> Result<()> {
        self.with_conn(|conn, _| write_state_value(conn, STATE_LAST_TIMER_BROADCAST, now))
    }

    /// A fresh notification was posted: its time becomes the last fire time
    /// and the reminder budget starts over.
    pub fn record_notification_posted(&self, now: i64) -> Result<SchedulerState> {
        self.with_conn(|conn, _| {
            let tx = conn
                .transaction()
                .context("failed to start notification transaction")?;
            write_state_value(&tx, STATE_NOTIFICATION_LAST_FIRE, now)?;
            write_state_value(&tx, STATE_NUM_REMINDERS_FIRED, 0)?;
            let state = load_state(&tx)?;
            tx.commit()
                .context("failed to commit notification state")?;
            info!(now, "notification posted, reminder budget reset");
            Ok(state)
        })
    }

    pub fn pending_alarms(&self) -> Result<Vec<ArmedAlarm>> {
        self.with_conn(|conn, _| {
            let mut stmt = conn.prepare(
                "SELECT purpose, fire_at, armed_at FROM armed_alarms ORDER BY fire_at ASC",
            )?;
            let rows = stmt.query_map([], |row| {
                let purpose_raw: String = row.get(0)?;
                let purpose = AlarmPurpose::parse(&purpose_raw).ok_or_else(|| {
                    conversion_error(
                        0,
                        rusqlite::types::Type::Text,
                        format!("invalid alarm purpose: {purpose_raw}"),
                    )
                })?;
                Ok(ArmedAlarm {
                    purpose,
                    fire_at: row.get(1)?,
                    armed_at: row.get(2)?,
                })
            })?;
            collect_rows(rows)
        })
    }

    /// Runs `f` holding the process-wide lock and then the connection lock.
    fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection, &'static dyn EventsTable) -> Result<T>,
    ) -> Result<T> {
        let _process = lock_process();
        let mut conn = self
            .conn
            .lock()
            .map_err(|_| anyhow!("store connection mutex poisoned"))?;
        f(&mut conn, self.schema.table())
    }

    #[cfg(test)]
    fn with_connection<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        self.with_conn(|conn, _| f(conn))
    }
}

impl ActiveEvents for SqliteEventStore {
    fn has_active_events(&self) -> Result<bool, ReminderError> {
        Self::has_active_events(self)
            .map_err(|err| ReminderError::Collaborator(format!("{err:#}")))
    }
}

fn lock_process() -> MutexGuard<'static, ()> {
    // The guarded value is `()`, so a panic elsewhere leaves nothing to repair.
    STORE_LOCK.lock().unwrap_or_else(PoisonError::into_inner)
}

fn load_state(conn: &Connection) -> Result<SchedulerState> {
    let mut stmt = conn.prepare("SELECT state_key, state_value FROM scheduler_state")?;
    let rows = stmt.query_map([], |row| {
        let key: String = row.get(0)?;
        let value: i64 = row.get(1)?;
        Ok((key, value))
    })?;

    let mut state = SchedulerState::default();
    for (key, value) in collect_rows(rows)? {
        match key.as_str() {
            STATE_NOTIFICATION_LAST_FIRE => state.notification_last_fire_time = value,
            STATE_REMINDER_LAST_FIRE => state.reminder_last_fire_time = value,
            STATE_NUM_REMINDERS_FIRED => {
                state.num_reminders_fired = u32::try_from(value)
                    .with_context(|| format!("invalid num_reminders_fired: {value}"))?;
            }
            STATE_LAST_TIMER_BROADCAST => state.last_timer_broadcast_received = value,
            _ => {}
        }
    }
    Ok(state)
}

fn write_state_value(conn: &Connection, key: &str, value: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO scheduler_state(state_key, state_value) VALUES (?1, ?2)
         ON CONFLICT(state_key) DO UPDATE SET state_value = excluded.state_value",
        params![key, value],
    )
    .with_context(|| format!("failed to write scheduler state {key}"))?;
    Ok(())
}

fn write_state(conn: &Connection, state: &SchedulerState) -> Result<()> {
    write_state_value(conn, STATE_NOTIFICATION_LAST_FIRE, state.notification_last_fire_time)?;
    write_state_value(conn, STATE_REMINDER_LAST_FIRE, state.reminder_last_fire_time)?;
    write_state_value(
        conn,
        STATE_NUM_REMINDERS_FIRED,
        i64::from(state.num_reminders_fired),
    )?;
    write_state_value(
        conn,
        STATE_LAST_TIMER_BROADCAST,
        state.last_timer_broadcast_received,
    )
}

fn load_settings(conn: &Connection) -> Result<ReminderSettings> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT settings_json FROM reminder_settings WHERE settings_id = 1",
            [],
            |row| row.get(0),
        )
        .optional()
        .context("failed to load reminder settings")?;

    let Some(raw) = raw else {
        return Ok(ReminderSettings::default());
    };

    let value: Value = serde_json::from_str(&raw).context("invalid stored settings JSON")?;
    ReminderSettings::from_json(&value).map_err(|err| anyhow!("invalid stored settings: {err}"))
}

fn write_settings(conn: &Connection, settings: &ReminderSettings, now: i64) -> Result<()> {
    let payload = serde_json::to_string(settings).context("failed to serialize settings")?;
    let updated_at = format_millis_rfc3339(now).map_err(|err| anyhow!(err.to_string()))?;

    conn.execute(
        "INSERT INTO reminder_settings(settings_id, settings_json, updated_at)
         VALUES (1, ?1, ?2)
         ON CONFLICT(settings_id) DO UPDATE SET
           settings_json = excluded.settings_json,
           updated_at = excluded.updated_at",
        params![payload, updated_at],
    )
    .context("failed to save reminder settings")?;
    Ok(())
}

/// Writes every scheduler field plus the one-shot flag clear. Callers run it
/// inside the transaction that read the state it was derived from.
fn write_fire_commit(
    conn: &Connection,
    commit: &FireCommit,
    settings: &ReminderSettings,
    now: i64,
) -> Result<()> {
    write_state(conn, &commit.state)?;
    if commit.clear_one_shot {
        let cleared = ReminderSettings {
            quiet_hours_one_time_reminder_enabled: false,
            ..settings.clone()
        };
        write_settings(conn, &cleared, now)?;
    }
    Ok(())
}

fn upsert_armed_alarm(conn: &Connection, purpose: AlarmPurpose, fire_at: i64, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO armed_alarms(purpose, fire_at, armed_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(purpose) DO UPDATE SET
           fire_at = excluded.fire_at,
           armed_at = excluded.armed_at",
        params![purpose.as_str(), fire_at, now],
    )
    .with_context(|| format!("failed to record armed {} alarm", purpose.as_str()))?;
    Ok(())
}

/// Drops alarms whose fire time has passed; they have been delivered.
fn clear_elapsed_alarms(conn: &Connection, now: i64) -> Result<()> {
    conn.execute("DELETE FROM armed_alarms WHERE fire_at <= ?1", params![now])
        .context("failed to clear elapsed alarms")?;
    Ok(())
}

pub(crate) fn conversion_error(
    column: usize,
    ty: rusqlite::types::Type,
    message: String,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        ty,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

pub(crate) fn collect_rows<T>(
    rows: rusqlite::MappedRows<'_, impl FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>>,
) -> Result<Vec<T>> {
    let mut values = Vec::new();
    for row in rows {
        values.push(row?);
    }
    Ok(values)
}
