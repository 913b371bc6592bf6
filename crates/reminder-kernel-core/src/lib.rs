use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::{OffsetDateTime, UtcOffset};

mod protocol;
mod quiet_hours;

pub use protocol::{
    commit_fire, effective_interval, AlarmDelay, DecisionReason, FireCommit, FireTrigger,
    ReminderDecision, ReminderProtocol, DEFAULT_ALARM_THRESHOLD_MILLIS,
    MIN_REMINDER_INTERVAL_MILLIS,
};
pub use quiet_hours::QuietHoursWindowOracle;

pub const MINUTES_PER_DAY: u16 = 24 * 60;
const MAX_UTC_OFFSET_MINUTES: i16 = 18 * 60;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum ReminderError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("collaborator error: {0}")]
    Collaborator(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventDisplayStatus {
    Hidden,
    DisplayedNormal,
    DisplayedCollapsed,
}

impl EventDisplayStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hidden => "hidden",
            Self::DisplayedNormal => "displayed_normal",
            Self::DisplayedCollapsed => "displayed_collapsed",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "hidden" => Some(Self::Hidden),
            "displayed_normal" => Some(Self::DisplayedNormal),
            "displayed_collapsed" => Some(Self::DisplayedCollapsed),
            _ => None,
        }
    }

    /// Numeric code used by the legacy (V6) row layout.
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::Hidden => 0,
            Self::DisplayedNormal => 1,
            Self::DisplayedCollapsed => 2,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Hidden),
            1 => Some(Self::DisplayedNormal),
            2 => Some(Self::DisplayedCollapsed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EventKey {
    pub event_id: i64,
    pub instance_start_time: i64,
}

impl Display for EventKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.event_id, self.instance_start_time)
    }
}

/// One alert instance: a calendar event occurrence that still needs attention.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventAlertRecord {
    pub event_id: i64,
    pub instance_start_time: i64,
    pub instance_end_time: i64,
    pub alert_time: i64,
    pub title: String,
    pub snoozed_until: i64,
    pub start_time: i64,
    pub end_time: i64,
    pub location: String,
    pub last_event_visibility: i64,
    pub display_status: EventDisplayStatus,
    pub color: i32,
    pub is_repeating: bool,
}

impl EventAlertRecord {
    #[must_use]
    pub fn key(&self) -> EventKey {
        EventKey {
            event_id: self.event_id,
            instance_start_time: self.instance_start_time,
        }
    }

    /// An alert keeps the reminder loop alive while it is not snoozed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.snoozed_until == 0
    }

    /// Validates a record before it is written.
    ///
    /// # Errors
    /// Returns [`ReminderError::Validation`] when the instance window is
    /// inverted or time fields are negative.
    pub fn validate(&self) -> Result<(), ReminderError> {
        if self.instance_end_time < self.instance_start_time {
            return Err(ReminderError::Validation(format!(
                "instance_end_time MUST be >= instance_start_time for {}",
                self.key()
            )));
        }

        for (name, value) in [
            ("alert_time", self.alert_time),
            ("snoozed_until", self.snoozed_until),
            ("last_event_visibility", self.last_event_visibility),
        ] {
            if value < 0 {
                return Err(ReminderError::Validation(format!(
                    "{name} MUST be >= 0 for {}",
                    self.key()
                )));
            }
        }

        Ok(())
    }
}

/// Field-sparse update; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct EventUpdate {
    pub alert_time: Option<i64>,
    pub title: Option<String>,
    pub snoozed_until: Option<i64>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub location: Option<String>,
    pub last_event_visibility: Option<i64>,
    pub display_status: Option<EventDisplayStatus>,
    pub color: Option<i32>,
    pub is_repeating: Option<bool>,
}

impl EventUpdate {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    #[must_use]
    pub fn apply(&self, event: &EventAlertRecord) -> EventAlertRecord {
        EventAlertRecord {
            event_id: event.event_id,
            instance_start_time: event.instance_start_time,
            instance_end_time: event.instance_end_time,
            alert_time: self.alert_time.unwrap_or(event.alert_time),
            title: self.title.clone().unwrap_or_else(|| event.title.clone()),
            snoozed_until: self.snoozed_until.unwrap_or(event.snoozed_until),
            start_time: self.start_time.unwrap_or(event.start_time),
            end_time: self.end_time.unwrap_or(event.end_time),
            location: self
                .location
                .clone()
                .unwrap_or_else(|| event.location.clone()),
            last_event_visibility: self
                .last_event_visibility
                .unwrap_or(event.last_event_visibility),
            display_status: self.display_status.unwrap_or(event.display_status),
            color: self.color.unwrap_or(event.color),
            is_repeating: self.is_repeating.unwrap_or(event.is_repeating),
        }
    }
}

/// Local-time window during which reminders are held back.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct QuietHoursWindow {
    pub enabled: bool,
    pub from_minute: u16,
    pub to_minute: u16,
    pub utc_offset_minutes: i16,
}

impl Default for QuietHoursWindow {
    fn default() -> Self {
        Self {
            enabled: false,
            from_minute: 22 * 60,
            to_minute: 7 * 60,
            utc_offset_minutes: 0,
        }
    }
}

impl QuietHoursWindow {
    /// # Errors
    /// Returns [`ReminderError::Configuration`] when a minute-of-day or the
    /// UTC offset is out of range.
    pub fn validate(&self) -> Result<(), ReminderError> {
        for (name, value) in [("from_minute", self.from_minute), ("to_minute", self.to_minute)] {
            if value >= MINUTES_PER_DAY {
                return Err(ReminderError::Configuration(format!(
                    "quiet_hours.{name} MUST be < {MINUTES_PER_DAY}"
                )));
            }
        }

        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(ReminderError::Configuration(format!(
                "quiet_hours.utc_offset_minutes MUST be within +/-{MAX_UTC_OFFSET_MINUTES}"
            )));
        }

        Ok(())
    }

    /// Parses `HH:MM` into a minute of the day.
    ///
    /// # Errors
    /// Returns [`ReminderError::Configuration`] for malformed or
    /// out-of-range values.
    pub fn parse_minute_of_day(raw: &str) -> Result<u16, ReminderError> {
        let invalid = || ReminderError::Configuration(format!("expected HH:MM, got {raw:?}"));
        let (hours, minutes) = raw.split_once(':').ok_or_else(invalid)?;
        let hours: u16 = hours.trim().parse().map_err(|_| invalid())?;
        let minutes: u16 = minutes.trim().parse().map_err(|_| invalid())?;
        if hours >= 24 || minutes >= 60 {
            return Err(invalid());
        }
        Ok(hours * 60 + minutes)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReminderSettings {
    pub reminders_interval_millis: i64,
    pub reminders_enabled: bool,
    /// 0 means unlimited.
    pub max_number_of_reminders: u32,
    /// Cleared by the alarm driver after the one-shot reminder fires.
    pub quiet_hours_one_time_reminder_enabled: bool,
    #[serde(default)]
    pub quiet_hours: QuietHoursWindow,
}

impl Default for ReminderSettings {
    fn default() -> Self {
        Self {
            reminders_interval_millis: 10 * 60 * 1000,
            reminders_enabled: false,
            max_number_of_reminders: 0,
            quiet_hours_one_time_reminder_enabled: false,
            quiet_hours: QuietHoursWindow::default(),
        }
    }
}

impl ReminderSettings {
    /// Validates user-configurable reminder settings.
    ///
    /// # Errors
    /// Returns [`ReminderError::Configuration`] when the interval is not
    /// positive or the quiet-hours window is malformed.
    pub fn validate(&self) -> Result<(), ReminderError> {
        if self.reminders_interval_millis <= 0 {
            return Err(ReminderError::Configuration(
                "reminders_interval_millis MUST be > 0".to_string(),
            ));
        }

        self.quiet_hours.validate()
    }

    /// Decodes and validates settings from JSON.
    ///
    /// # Errors
    /// Returns [`ReminderError::Configuration`] when decoding fails or the
    /// decoded values are out of bounds.
    pub fn from_json(value: &Value) -> Result<Self, ReminderError> {
        let settings: Self = serde_json::from_value(value.clone()).map_err(|err| {
            ReminderError::Configuration(format!("invalid settings JSON payload: {err}"))
        })?;
        settings.validate()?;
        Ok(settings)
    }
}

/// Counters and timestamps the rescheduling protocol reads on every wake-up.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchedulerState {
    pub notification_last_fire_time: i64,
    pub reminder_last_fire_time: i64,
    pub num_reminders_fired: u32,
    pub last_timer_broadcast_received: i64,
}

impl SchedulerState {
    #[must_use]
    pub fn last_fire_time(&self) -> i64 {
        self.notification_last_fire_time
            .max(self.reminder_last_fire_time)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlarmPurpose {
    Reminder,
}

impl AlarmPurpose {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Reminder => "reminder",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "reminder" => Some(Self::Reminder),
            _ => None,
        }
    }
}

pub trait ActiveEvents {
    #[allow(clippy::missing_errors_doc)]
    fn has_active_events(&self) -> Result<bool, ReminderError>;
}

pub trait QuietHoursOracle {
    /// Returns the end of the current quiet period, or `None` when
    /// reminders are not suppressed at `now`.
    #[allow(clippy::missing_errors_doc)]
    fn silent_until(
        &self,
        settings: &ReminderSettings,
        now: i64,
    ) -> Result<Option<i64>, ReminderError>;
}

pub trait TimerService {
    /// Arms a one-shot wake-up, replacing any pending one for `purpose`.
    #[allow(clippy::missing_errors_doc)]
    fn arm_exact_wake(&self, at: i64, purpose: AlarmPurpose) -> Result<(), ReminderError>;
}

pub trait NotificationEmitter {
    fn fire_reminder(&self);
}

pub trait DiagnosticsSink {
    fn report_anomaly(&self, delay: &AlarmDelay);
}

pub trait WakeLock {
    fn acquire(&self, tag: &str);
    fn release(&self, tag: &str);
}

/// Holds a wake lock until dropped.
pub struct WakeLockGuard<'a> {
    lock: &'a dyn WakeLock,
    tag: String,
}

impl Drop for WakeLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(&self.tag);
    }
}

#[must_use = "the wake lock is released as soon as the guard is dropped"]
pub fn hold_wake_lock<'a>(lock: &'a dyn WakeLock, tag: &str) -> WakeLockGuard<'a> {
    lock.acquire(tag);
    WakeLockGuard {
        lock,
        tag: tag.to_string(),
    }
}

#[must_use]
pub fn now_millis() -> i64 {
    let nanos = OffsetDateTime::now_utc().unix_timestamp_nanos();
    i64::try_from(nanos / 1_000_000).unwrap_or(i64::MAX)
}

/// # Errors
/// Returns [`ReminderError::Validation`] when `millis` is outside the
/// representable calendar range.
pub fn millis_to_datetime(millis: i64) -> Result<OffsetDateTime, ReminderError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|err| ReminderError::Validation(format!("timestamp {millis} out of range: {err}")))
}

/// # Errors
/// Returns [`ReminderError::Validation`] when the instant does not fit in
/// epoch milliseconds.
pub fn datetime_to_millis(value: OffsetDateTime) -> Result<i64, ReminderError> {
    i64::try_from(value.unix_timestamp_nanos() / 1_000_000)
        .map_err(|err| ReminderError::Validation(format!("timestamp out of range: {err}")))
}

/// Formats epoch millis as RFC3339 in UTC.
///
/// # Errors
/// Returns [`ReminderError::Validation`] when the value is out of range or
/// formatting fails.
pub fn format_millis_rfc3339(millis: i64) -> Result<String, ReminderError> {
    millis_to_datetime(millis)?
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| {
            ReminderError::Validation(format!("failed to format RFC3339 timestamp: {err}"))
        })
}

/// Parses an RFC3339 timestamp into epoch millis.
///
/// # Errors
/// Returns [`ReminderError::Validation`] when parsing fails.
pub fn parse_rfc3339_millis(value: &str) -> Result<i64, ReminderError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| ReminderError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    datetime_to_millis(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn must_ok<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn fixture_event() -> EventAlertRecord {
        EventAlertRecord {
            event_id: 42,
            instance_start_time: 1_700_000_000_000,
            instance_end_time: 1_700_003_600_000,
            alert_time: 1_699_999_100_000,
            title: "Standup".to_string(),
            snoozed_until: 0,
            start_time: 1_700_000_000_000,
            end_time: 1_700_003_600_000,
            location: "Room 4".to_string(),
            last_event_visibility: 1_699_999_200_000,
            display_status: EventDisplayStatus::DisplayedNormal,
            color: 0x00ff_8800,
            is_repeating: true,
        }
    }

    #[test]
    fn partial_update_preserves_unsupplied_fields() {
        let event = fixture_event();
        let update = EventUpdate {
            snoozed_until: Some(1_700_000_600_000),
            display_status: Some(EventDisplayStatus::Hidden),
            ..EventUpdate::default()
        };

        let updated = update.apply(&event);

        assert_eq!(updated.snoozed_until, 1_700_000_600_000);
        assert_eq!(updated.display_status, EventDisplayStatus::Hidden);
        assert_eq!(updated.title, event.title);
        assert_eq!(updated.location, event.location);
        assert_eq!(updated.color, event.color);
        assert_eq!(updated.key(), event.key());
        assert!(!updated.is_active());
    }

    #[test]
    fn empty_update_is_identity() {
        let event = fixture_event();
        let update = EventUpdate::default();
        assert!(update.is_empty());
        assert_eq!(update.apply(&event), event);
    }

    #[test]
    fn record_validation_rejects_inverted_instance_window() {
        let mut event = fixture_event();
        event.instance_end_time = event.instance_start_time - 1;
        assert!(matches!(
            event.validate(),
            Err(ReminderError::Validation(_))
        ));
    }

    #[test]
    fn display_status_codes_are_stable() {
        for status in [
            EventDisplayStatus::Hidden,
            EventDisplayStatus::DisplayedNormal,
            EventDisplayStatus::DisplayedCollapsed,
        ] {
            assert_eq!(EventDisplayStatus::from_code(status.code()), Some(status));
            assert_eq!(EventDisplayStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(EventDisplayStatus::from_code(9), None);
    }

    #[test]
    fn settings_reject_non_positive_interval() {
        let settings = ReminderSettings {
            reminders_interval_millis: 0,
            ..ReminderSettings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ReminderError::Configuration(_))
        ));
    }

    #[test]
    fn settings_from_json_defaults_quiet_hours() {
        let settings = must_ok(ReminderSettings::from_json(&json!({
            "reminders_interval_millis": 300_000,
            "reminders_enabled": true,
            "max_number_of_reminders": 3,
            "quiet_hours_one_time_reminder_enabled": false
        })));

        assert_eq!(settings.quiet_hours, QuietHoursWindow::default());
        assert_eq!(settings.max_number_of_reminders, 3);
    }

    #[test]
    fn settings_from_json_rejects_bad_window() {
        let result = ReminderSettings::from_json(&json!({
            "reminders_interval_millis": 300_000,
            "reminders_enabled": true,
            "max_number_of_reminders": 0,
            "quiet_hours_one_time_reminder_enabled": false,
            "quiet_hours": {
                "enabled": true,
                "from_minute": 1440,
                "to_minute": 60,
                "utc_offset_minutes": 0
            }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn minute_of_day_parsing() {
        assert_eq!(must_ok(QuietHoursWindow::parse_minute_of_day("22:30")), 1350);
        assert_eq!(must_ok(QuietHoursWindow::parse_minute_of_day("00:00")), 0);
        assert!(QuietHoursWindow::parse_minute_of_day("24:00").is_err());
        assert!(QuietHoursWindow::parse_minute_of_day("7").is_err());
    }

    #[test]
    fn last_fire_time_takes_latest_source() {
        let state = SchedulerState {
            notification_last_fire_time: 5_000,
            reminder_last_fire_time: 9_000,
            num_reminders_fired: 1,
            last_timer_broadcast_received: 0,
        };
        assert_eq!(state.last_fire_time(), 9_000);
    }

    #[test]
    fn rfc3339_round_trip_for_epoch_millis() {
        let formatted = must_ok(format_millis_rfc3339(1_000));
        assert_eq!(formatted, "1970-01-01T00:00:01Z");
        assert_eq!(must_ok(parse_rfc3339_millis(&formatted)), 1_000);
    }

    struct CountingWakeLock {
        held: std::cell::Cell<i32>,
    }

    impl WakeLock for CountingWakeLock {
        fn acquire(&self, _tag: &str) {
            self.held.set(self.held.get() + 1);
        }

        fn release(&self, _tag: &str) {
            self.held.set(self.held.get() - 1);
        }
    }

    #[test]
    fn wake_lock_guard_releases_on_drop() {
        let lock = CountingWakeLock {
            held: std::cell::Cell::new(0),
        };
        {
            let _guard = hold_wake_lock(&lock, "reminder");
            assert_eq!(lock.held.get(), 1);
        }
        assert_eq!(lock.held.get(), 0);
    }
}
