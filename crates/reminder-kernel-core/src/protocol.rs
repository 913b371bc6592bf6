//! Reminder rescheduling decision procedure.
//!
//! [`ReminderProtocol::decide`] is a pure function of the wake-up time, the
//! settings, the quiet-hours result and the scheduler state. Firing is
//! finalised by [`commit_fire`], whose output the host persists in a single
//! atomic write.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::{ReminderError, ReminderSettings, SchedulerState};

/// Slack that separates early, on-time and late wake-ups.
pub const DEFAULT_ALARM_THRESHOLD_MILLIS: i64 = 15_000;

/// Interval substituted for a non-positive configured interval.
pub const MIN_REMINDER_INTERVAL_MILLIS: i64 = 60_000;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FireTrigger {
    OneShot,
    Regular,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DecisionReason {
    NoActiveEvents,
    OneShotFire,
    OneShotDeferred,
    BudgetExhausted,
    QuietHoursDeferred,
    EarlyWakeup,
    Fire,
    RemindersDisabled,
}

/// Wake-up that arrived later than the interval plus threshold allows.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct AlarmDelay {
    pub observed_delay_millis: i64,
    pub expected_interval_millis: i64,
    pub last_fire_time: i64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ReminderDecision {
    pub reschedule_at: Option<i64>,
    pub fire: Option<FireTrigger>,
    pub anomaly: Option<AlarmDelay>,
    pub reason: DecisionReason,
}

impl ReminderDecision {
    #[must_use]
    pub fn no_active_events() -> Self {
        Self::idle(DecisionReason::NoActiveEvents)
    }

    #[must_use]
    pub fn fire_now(&self) -> bool {
        self.fire.is_some()
    }

    fn idle(reason: DecisionReason) -> Self {
        Self {
            reschedule_at: None,
            fire: None,
            anomaly: None,
            reason,
        }
    }

    fn deferred(reason: DecisionReason, at: i64) -> Self {
        Self {
            reschedule_at: Some(at),
            fire: None,
            anomaly: None,
            reason,
        }
    }
}

/// Scheduler state after a fire, plus whether the one-shot flag must be
/// cleared in the same write.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct FireCommit {
    pub state: SchedulerState,
    pub clear_one_shot: bool,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct ReminderProtocol {
    alarm_threshold_millis: i64,
}

impl Default for ReminderProtocol {
    fn default() -> Self {
        Self {
            alarm_threshold_millis: DEFAULT_ALARM_THRESHOLD_MILLIS,
        }
    }
}

impl ReminderProtocol {
    /// # Errors
    /// Returns [`ReminderError::Configuration`] for a negative threshold.
    pub fn new(alarm_threshold_millis: i64) -> Result<Self, ReminderError> {
        if alarm_threshold_millis < 0 {
            return Err(ReminderError::Configuration(
                "alarm_threshold_millis MUST be >= 0".to_string(),
            ));
        }
        Ok(Self {
            alarm_threshold_millis,
        })
    }

    #[must_use]
    pub fn alarm_threshold_millis(&self) -> i64 {
        self.alarm_threshold_millis
    }

    /// Derives the action for one wake-up. The caller has already checked
    /// that at least one alert is active.
    #[must_use]
    pub fn decide(
        &self,
        now: i64,
        settings: &ReminderSettings,
        silent_until: Option<i64>,
        state: &SchedulerState,
    ) -> ReminderDecision {
        let interval = effective_interval(settings);

        if settings.quiet_hours_one_time_reminder_enabled {
            return match silent_until {
                None => {
                    let reschedule_at = settings
                        .reminders_enabled
                        .then_some(now.saturating_add(interval));
                    info!(
                        ?reschedule_at,
                        "one-shot reminder enabled outside quiet hours, firing"
                    );
                    ReminderDecision {
                        reschedule_at,
                        fire: Some(FireTrigger::OneShot),
                        anomaly: None,
                        reason: DecisionReason::OneShotFire,
                    }
                }
                Some(until) => {
                    info!(silent_until = until, "one-shot reminder held by quiet hours");
                    ReminderDecision::deferred(DecisionReason::OneShotDeferred, until)
                }
            };
        }

        if !settings.reminders_enabled {
            info!("reminders are disabled");
            return ReminderDecision::idle(DecisionReason::RemindersDisabled);
        }

        let last_fire_time = state.last_fire_time();
        let since_last_fire = now.saturating_sub(last_fire_time);
        let max_fires = settings.max_number_of_reminders;

        info!(
            last_fire_time,
            since_last_fire,
            num_fired = state.num_reminders_fired,
            max_fires,
            "reminders are enabled"
        );

        if max_fires != 0 && state.num_reminders_fired > max_fires {
            info!(
                num_fired = state.num_reminders_fired,
                max_fires, "reminder budget exhausted"
            );
            return ReminderDecision::idle(DecisionReason::BudgetExhausted);
        }

        if let Some(until) = silent_until {
            info!(silent_until = until, "reminder postponed by quiet hours");
            return ReminderDecision::deferred(DecisionReason::QuietHoursDeferred, until);
        }

        let threshold = self.alarm_threshold_millis;
        // Zero means nothing has fired yet, so the first wake-up is never early.
        if last_fire_time > 0 && since_last_fire < interval.saturating_sub(threshold) {
            // A last fire time ahead of `now` (clock moved back) waits one interval at most.
            let left = interval.saturating_sub(since_last_fire).min(interval);
            let next_fire_at = now.saturating_add(left);
            info!(
                since_last_fire,
                interval, threshold, left, next_fire_at, "early wake-up, moving alarm"
            );
            return ReminderDecision::deferred(DecisionReason::EarlyWakeup, next_fire_at);
        }

        let next_fire_at = now.saturating_add(interval);
        let anomaly = (since_last_fire > interval.saturating_add(threshold)
            && last_fire_time > 0)
            .then_some(AlarmDelay {
                observed_delay_millis: since_last_fire,
                expected_interval_millis: interval,
                last_fire_time,
            });

        if let Some(delay) = &anomaly {
            warn!(
                expected_interval = delay.expected_interval_millis,
                observed_delay = delay.observed_delay_millis,
                last_fire_time,
                reminder_last_fire_time = state.reminder_last_fire_time,
                notification_last_fire_time = state.notification_last_fire_time,
                "timer delay detected"
            );
        }

        info!(since_last_fire, next_fire_at, "good to fire");
        ReminderDecision {
            reschedule_at: Some(next_fire_at),
            fire: Some(FireTrigger::Regular),
            anomaly,
            reason: DecisionReason::Fire,
        }
    }
}

/// Interval used for scheduling. Any positive configured value is used as
/// is; a malformed (non-positive) one becomes [`MIN_REMINDER_INTERVAL_MILLIS`].
#[must_use]
pub fn effective_interval(settings: &ReminderSettings) -> i64 {
    let configured = settings.reminders_interval_millis;
    if configured <= 0 {
        warn!(
            configured,
            clamped = MIN_REMINDER_INTERVAL_MILLIS,
            "reminder interval is not positive, clamping"
        );
        return MIN_REMINDER_INTERVAL_MILLIS;
    }
    configured
}

/// Computes the scheduler state that results from firing at `now`.
#[must_use]
pub fn commit_fire(
    trigger: FireTrigger,
    now: i64,
    state: &SchedulerState,
    settings: &ReminderSettings,
) -> FireCommit {
    let mut next = *state;
    let mut clear_one_shot = false;

    match trigger {
        FireTrigger::OneShot => {
            clear_one_shot = settings.quiet_hours_one_time_reminder_enabled;
        }
        FireTrigger::Regular => {
            next.num_reminders_fired = next.num_reminders_fired.saturating_add(1);
        }
    }

    next.reminder_last_fire_time = now;

    FireCommit {
        state: next,
        clear_one_shot,
    }
}
