use time::{Duration, Time, UtcOffset};

use crate::{
    datetime_to_millis, millis_to_datetime, QuietHoursOracle, QuietHoursWindow, ReminderError,
    ReminderSettings,
};

/// Oracle backed by the fixed-offset window stored in the settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct QuietHoursWindowOracle;

impl QuietHoursOracle for QuietHoursWindowOracle {
    fn silent_until(
        &self,
        settings: &ReminderSettings,
        now: i64,
    ) -> Result<Option<i64>, ReminderError> {
        settings.quiet_hours.silent_until(now)
    }
}

impl QuietHoursWindow {
    #[must_use]
    pub fn contains_minute(&self, minute_of_day: u16) -> bool {
        if self.from_minute < self.to_minute {
            (self.from_minute..self.to_minute).contains(&minute_of_day)
        } else {
            minute_of_day >= self.from_minute || minute_of_day < self.to_minute
        }
    }

    /// End of the quiet period containing `now`, if any.
    ///
    /// The window is evaluated at a fixed UTC offset; daylight-saving
    /// transitions are not applied.
    ///
    /// # Errors
    /// Returns [`ReminderError`] when the window is misconfigured or `now`
    /// cannot be represented as a calendar date.
    pub fn silent_until(&self, now: i64) -> Result<Option<i64>, ReminderError> {
        if !self.enabled || self.from_minute == self.to_minute {
            return Ok(None);
        }
        self.validate()?;

        let offset = UtcOffset::from_whole_seconds(i32::from(self.utc_offset_minutes) * 60)
            .map_err(|err| {
                ReminderError::Configuration(format!("invalid quiet hours offset: {err}"))
            })?;
        let local = millis_to_datetime(now)?.to_offset(offset);
        let minute_of_day = u16::from(local.hour()) * 60 + u16::from(local.minute());

        if !self.contains_minute(minute_of_day) {
            return Ok(None);
        }

        let end_hour = u8::try_from(self.to_minute / 60).map_err(|err| {
            ReminderError::Configuration(format!("invalid quiet hours end: {err}"))
        })?;
        let end_minute = u8::try_from(self.to_minute % 60).map_err(|err| {
            ReminderError::Configuration(format!("invalid quiet hours end: {err}"))
        })?;
        let end_time = Time::from_hms(end_hour, end_minute, 0).map_err(|err| {
            ReminderError::Configuration(format!("invalid quiet hours end: {err}"))
        })?;

        let mut end = local.replace_time(end_time);
        if end <= local {
            end = end.checked_add(Duration::DAY).ok_or_else(|| {
                ReminderError::Validation(format!("quiet hours end after {now} out of range"))
            })?;
        }

        Ok(Some(datetime_to_millis(end)?))
    }
}
