//! Per-version layouts of the event alert table.
//!
//! Each supported on-disk version has its own [`EventsTable`] handler; the
//! store selects one handler at open time through [`SchemaVersion::table`].

use anyhow::{Context, Result};
use reminder_kernel_core::{EventAlertRecord, EventDisplayStatus};
use rusqlite::{params, Connection, OptionalExtension};

use crate::{collect_rows, conversion_error, SchemaError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SchemaVersion {
    V6,
    V7,
}

impl SchemaVersion {
    /// Oldest layout that can be carried forward; anything older is dropped.
    pub const OLDEST: Self = Self::V6;
    pub const CURRENT: Self = Self::V7;

    #[must_use]
    pub fn number(self) -> i64 {
        match self {
            Self::V6 => 6,
            Self::V7 => 7,
        }
    }

    /// Next version along the upgrade chain.
    #[must_use]
    pub fn next(self) -> Option<Self> {
        match self {
            Self::V6 => Some(Self::V7),
            Self::V7 => None,
        }
    }

    pub(crate) fn table(self) -> &'static dyn EventsTable {
        match self {
            Self::V6 => &EventsTableV6,
            Self::V7 => &EventsTableV7,
        }
    }
}

impl TryFrom<i64> for SchemaVersion {
    type Error = SchemaError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            6 => Ok(Self::V6),
            7 => Ok(Self::V7),
            other => Err(SchemaError::UnsupportedVersion(other)),
        }
    }
}

pub(crate) trait EventsTable: Sync {
    fn version(&self) -> SchemaVersion;

    fn create(&self, conn: &Connection) -> Result<()>;

    fn drop_all(&self, conn: &Connection) -> Result<()>;

    /// Inserts the record, overwriting the row with the same key.
    fn insert(&self, conn: &Connection, event: &EventAlertRecord) -> Result<()>;

    /// Returns `false` when no row matched the record key.
    fn update(&self, conn: &Connection, event: &EventAlertRecord) -> Result<bool>;

    /// Rewrites the row keyed by `event` under a new instance window.
    fn update_instance_times(
        &self,
        conn: &Connection,
        event: &EventAlertRecord,
        instance_start: i64,
        instance_end: i64,
    ) -> Result<bool>;

    fn get(
        &self,
        conn: &Connection,
        event_id: i64,
        instance_start: i64,
    ) -> Result<Option<EventAlertRecord>>;

    fn get_instances(&self, conn: &Connection, event_id: i64) -> Result<Vec<EventAlertRecord>>;

    fn delete(&self, conn: &Connection, event_id: i64, instance_start: i64) -> Result<()>;

    fn all(&self, conn: &Connection) -> Result<Vec<EventAlertRecord>>;

    fn has_active(&self, conn: &Connection) -> Result<bool>;
}

const V6_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS events (
  event_id INTEGER NOT NULL,
  instance_start INTEGER NOT NULL,
  instance_end INTEGER NOT NULL,
  alert_time INTEGER NOT NULL,
  title TEXT NOT NULL,
  snoozed_until INTEGER NOT NULL DEFAULT 0,
  start_time INTEGER NOT NULL,
  end_time INTEGER NOT NULL,
  location TEXT NOT NULL DEFAULT '',
  last_visibility INTEGER NOT NULL DEFAULT 0,
  display_status INTEGER NOT NULL DEFAULT 0,
  color INTEGER NOT NULL DEFAULT 0,
  flags INTEGER NOT NULL DEFAULT 0,
  PRIMARY KEY (event_id, instance_start)
);
";

const V6_COLUMNS: &str = "event_id, instance_start, instance_end, alert_time, title,
    snoozed_until, start_time, end_time, location, last_visibility,
    display_status, color, flags";

const V6_FLAG_REPEATING: i64 = 1;

pub(crate) struct EventsTableV6;

impl EventsTableV6 {
    fn flags(event: &EventAlertRecord) -> i64 {
        if event.is_repeating {
            V6_FLAG_REPEATING
        } else {
            0
        }
    }

    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventAlertRecord> {
        let status_code: i64 = row.get(10)?;
        let display_status = EventDisplayStatus::from_code(status_code).ok_or_else(|| {
            conversion_error(
                10,
                rusqlite::types::Type::Integer,
                format!("invalid display_status code: {status_code}"),
            )
        })?;
        let flags: i64 = row.get(12)?;

        Ok(EventAlertRecord {
            event_id: row.get(0)?,
            instance_start_time: row.get(1)?,
            instance_end_time: row.get(2)?,
            alert_time: row.get(3)?,
            title: row.get(4)?,
            snoozed_until: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            location: row.get(8)?,
            last_event_visibility: row.get(9)?,
            display_status,
            color: row.get(11)?,
            is_repeating: flags & V6_FLAG_REPEATING != 0,
        })
    }
}

impl EventsTable for EventsTableV6 {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::V6
    }

    fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(V6_SCHEMA)
            .context("failed to create v6 events table")
    }

    fn drop_all(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch("DROP TABLE IF EXISTS events;")
            .context("failed to drop v6 events table")
    }

    fn insert(&self, conn: &Connection, event: &EventAlertRecord) -> Result<()> {
        conn.execute(
            "INSERT OR REPLACE INTO events(
                event_id, instance_start, instance_end, alert_time, title,
                snoozed_until, start_time, end_time, location, last_visibility,
                display_status, color, flags
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
            params![
                event.event_id,
                event.instance_start_time,
                event.instance_end_time,
                event.alert_time,
                event.title,
                event.snoozed_until,
                event.start_time,
                event.end_time,
                event.location,
                event.last_event_visibility,
                event.display_status.code(),
                event.color,
                Self::flags(event),
            ],
        )
        .with_context(|| format!("failed to insert v6 event {}", event.key()))?;
        Ok(())
    }

    fn update(&self, conn: &Connection, event: &EventAlertRecord) -> Result<bool> {
        self.update_instance_times(
            conn,
            event,
            event.instance_start_time,
            event.instance_end_time,
        )
    }

    fn update_instance_times(
        &self,
        conn: &Connection,
        event: &EventAlertRecord,
        instance_start: i64,
        instance_end: i64,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE events SET
                    instance_start = ?3, instance_end = ?4, alert_time = ?5, title = ?6,
                    snoozed_until = ?7, start_time = ?8, end_time = ?9, location = ?10,
                    last_visibility = ?11, display_status = ?12, color = ?13, flags = ?14
                 WHERE event_id = ?1 AND instance_start = ?2",
                params![
                    event.event_id,
                    event.instance_start_time,
                    instance_start,
                    instance_end,
                    event.alert_time,
                    event.title,
                    event.snoozed_until,
                    event.start_time,
                    event.end_time,
                    event.location,
                    event.last_event_visibility,
                    event.display_status.code(),
                    event.color,
                    Self::flags(event),
                ],
            )
            .with_context(|| format!("failed to update v6 event {}", event.key()))?;
        Ok(changed > 0)
    }

    fn get(
        &self,
        conn: &Connection,
        event_id: i64,
        instance_start: i64,
    ) -> Result<Option<EventAlertRecord>> {
        conn.query_row(
            &format!(
                "SELECT {V6_COLUMNS} FROM events WHERE event_id = ?1 AND instance_start = ?2"
            ),
            params![event_id, instance_start],
            Self::parse_row,
        )
        .optional()
        .with_context(|| format!("failed to load v6 event {event_id}@{instance_start}"))
    }

    fn get_instances(&self, conn: &Connection, event_id: i64) -> Result<Vec<EventAlertRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {V6_COLUMNS} FROM events WHERE event_id = ?1 ORDER BY instance_start ASC"
        ))?;
        let rows = stmt.query_map(params![event_id], Self::parse_row)?;
        collect_rows(rows)
    }

    fn delete(&self, conn: &Connection, event_id: i64, instance_start: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM events WHERE event_id = ?1 AND instance_start = ?2",
            params![event_id, instance_start],
        )
        .with_context(|| format!("failed to delete v6 event {event_id}@{instance_start}"))?;
        Ok(())
    }

    fn all(&self, conn: &Connection) -> Result<Vec<EventAlertRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {V6_COLUMNS} FROM events ORDER BY event_id ASC, instance_start ASC"
        ))?;
        let rows = stmt.query_map([], Self::parse_row)?;
        collect_rows(rows)
    }

    fn has_active(&self, conn: &Connection) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM events WHERE snoozed_until = 0 LIMIT 1",
                [],
                |_| Ok(()),
            )
            .optional()
            .context("failed to query active v6 events")?;
        Ok(found.is_some())
    }
}

const V7_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS event_alerts (
  event_id INTEGER NOT NULL,
  instance_start_time INTEGER NOT NULL,
  instance_end_time INTEGER NOT NULL,
  alert_time INTEGER NOT NULL,
  title TEXT NOT NULL,
  snoozed_until INTEGER NOT NULL DEFAULT 0,
  start_time INTEGER NOT NULL,
  end_time INTEGER NOT NULL,
  location TEXT NOT NULL DEFAULT '',
  last_event_visibility INTEGER NOT NULL DEFAULT 0,
  display_status TEXT NOT NULL CHECK (
    display_status IN ('hidden', 'displayed_normal', 'displayed_collapsed')
  ),
  color INTEGER NOT NULL DEFAULT 0,
  is_repeating INTEGER NOT NULL DEFAULT 0 CHECK (is_repeating IN (0, 1)),
  PRIMARY KEY (event_id, instance_start_time)
);

CREATE INDEX IF NOT EXISTS idx_event_alerts_snoozed
  ON event_alerts(snoozed_until);
";

const V7_COLUMNS: &str = "event_id, instance_start_time, instance_end_time, alert_time, title,
    snoozed_until, start_time, end_time, location, last_event_visibility,
    display_status, color, is_repeating";

pub(crate) struct EventsTableV7;

impl EventsTableV7 {
    fn parse_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<EventAlertRecord> {
        let status_raw: String = row.get(10)?;
        let display_status = EventDisplayStatus::parse(&status_raw).ok_or_else(|| {
            conversion_error(
                10,
                rusqlite::types::Type::Text,
                format!("invalid display_status: {status_raw}"),
            )
        })?;

        Ok(EventAlertRecord {
            event_id: row.get(0)?,
            instance_start_time: row.get(1)?,
            instance_end_time: row.get(2)?,
            alert_time: row.get(3)?,
            title: row.get(4)?,
            snoozed_until: row.get(5)?,
            start_time: row.get(6)?,
            end_time: row.get(7)?,
            location: row.get(8)?,
            last_event_visibility: row.get(9)?,
            display_status,
            color: row.get(11)?,
            is_repeating: row.get::<_, i64>(12)? == 1,
        })
    }
}

impl EventsTable for EventsTableV7 {
    fn version(&self) -> SchemaVersion {
        SchemaVersion::V7
    }

    fn create(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(V7_SCHEMA)
            .context("failed to create v7 event_alerts table")
    }

    fn drop_all(&self, conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "DROP INDEX IF EXISTS idx_event_alerts_snoozed;
             DROP TABLE IF EXISTS event_alerts;",
        )
        .context("failed to drop v7 event_alerts table")
    }

    fn insert(&self, conn: &Connection, event: &EventAlertRecord) -> Result<()> {
        conn.execute(
            "INSERT INTO event_alerts(
                event_id, instance_start_time, instance_end_time, alert_time, title,
                snoozed_until, start_time, end_time, location, last_event_visibility,
                display_status, color, is_repeating
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(event_id, instance_start_time) DO UPDATE SET
               instance_end_time = excluded.instance_end_time,
               alert_time = excluded.alert_time,
               title = excluded.title,
               snoozed_until = excluded.snoozed_until,
               start_time = excluded.start_time,
               end_time = excluded.end_time,
               location = excluded.location,
               last_event_visibility = excluded.last_event_visibility,
               display_status = excluded.display_status,
               color = excluded.color,
               is_repeating = excluded.is_repeating",
            params![
                event.event_id,
                event.instance_start_time,
                event.instance_end_time,
                event.alert_time,
                event.title,
                event.snoozed_until,
                event.start_time,
                event.end_time,
                event.location,
                event.last_event_visibility,
                event.display_status.as_str(),
                event.color,
                i64::from(event.is_repeating),
            ],
        )
        .with_context(|| format!("failed to insert event {}", event.key()))?;
        Ok(())
    }

    fn update(&self, conn: &Connection, event: &EventAlertRecord) -> Result<bool> {
        self.update_instance_times(
            conn,
            event,
            event.instance_start_time,
            event.instance_end_time,
        )
    }

    fn update_instance_times(
        &self,
        conn: &Connection,
        event: &EventAlertRecord,
        instance_start: i64,
        instance_end: i64,
    ) -> Result<bool> {
        let changed = conn
            .execute(
                "UPDATE event_alerts SET
                    instance_start_time = ?3, instance_end_time = ?4, alert_time = ?5,
                    title = ?6, snoozed_until = ?7, start_time = ?8, end_time = ?9,
                    location = ?10, last_event_visibility = ?11, display_status = ?12,
                    color = ?13, is_repeating = ?14
                 WHERE event_id = ?1 AND instance_start_time = ?2",
                params![
                    event.event_id,
                    event.instance_start_time,
                    instance_start,
                    instance_end,
                    event.alert_time,
                    event.title,
                    event.snoozed_until,
                    event.start_time,
                    event.end_time,
                    event.location,
                    event.last_event_visibility,
                    event.display_status.as_str(),
                    event.color,
                    i64::from(event.is_repeating),
                ],
            )
            .with_context(|| format!("failed to update event {}", event.key()))?;
        Ok(changed > 0)
    }

    fn get(
        &self,
        conn: &Connection,
        event_id: i64,
        instance_start: i64,
    ) -> Result<Option<EventAlertRecord>> {
        conn.query_row(
            &format!(
                "SELECT {V7_COLUMNS} FROM event_alerts
                 WHERE event_id = ?1 AND instance_start_time = ?2"
            ),
            params![event_id, instance_start],
            Self::parse_row,
        )
        .optional()
        .with_context(|| format!("failed to load event {event_id}@{instance_start}"))
    }

    fn get_instances(&self, conn: &Connection, event_id: i64) -> Result<Vec<EventAlertRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {V7_COLUMNS} FROM event_alerts
             WHERE event_id = ?1 ORDER BY instance_start_time ASC"
        ))?;
        let rows = stmt.query_map(params![event_id], Self::parse_row)?;
        collect_rows(rows)
    }

    fn delete(&self, conn: &Connection, event_id: i64, instance_start: i64) -> Result<()> {
        conn.execute(
            "DELETE FROM event_alerts WHERE event_id = ?1 AND instance_start_time = ?2",
            params![event_id, instance_start],
        )
        .with_context(|| format!("failed to delete event {event_id}@{instance_start}"))?;
        Ok(())
    }

    fn all(&self, conn: &Connection) -> Result<Vec<EventAlertRecord>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {V7_COLUMNS} FROM event_alerts
             ORDER BY event_id ASC, instance_start_time ASC"
        ))?;
        let rows = stmt.query_map([], Self::parse_row)?;
        collect_rows(rows)
    }

    fn has_active(&self, conn: &Connection) -> Result<bool> {
        let found = conn
            .query_row(
                "SELECT 1 FROM event_alerts WHERE snoozed_until = 0 LIMIT 1",
                [],
                |_| Ok(()),
            )
            .optional()
            .context("failed to query active events")?;
        Ok(found.is_some())
    }
}
