//! Terminal implementations of the reminder collaborators.

use std::io::Write;

use reminder_kernel_core::{
    format_millis_rfc3339, AlarmDelay, AlarmPurpose, DiagnosticsSink, NotificationEmitter,
    ReminderError, TimerService, WakeLock,
};
use tracing::{debug, info, warn};

/// Writes the reminder to stderr, ringing the terminal bell.
pub struct TerminalNotifier {
    titles: Vec<String>,
}

impl TerminalNotifier {
    #[must_use]
    pub fn new(titles: Vec<String>) -> Self {
        Self { titles }
    }

    #[must_use]
    pub fn message(&self) -> String {
        match self.titles.as_slice() {
            [] => "reminder: calendar alerts need attention".to_string(),
            [title] => format!("reminder: {title}"),
            titles => format!("reminder: {} alerts: {}", titles.len(), titles.join(", ")),
        }
    }
}

impl NotificationEmitter for TerminalNotifier {
    fn fire_reminder(&self) {
        let mut stderr = std::io::stderr().lock();
        if let Err(err) = writeln!(stderr, "\u{7}{}", self.message()) {
            warn!(error = %err, "failed to write reminder to terminal");
        }
    }
}

/// The process exits after each invocation, so arming only records intent;
/// the store keeps the pending alarm for the scheduler that runs `rk`.
pub struct LoggedTimer;

impl TimerService for LoggedTimer {
    fn arm_exact_wake(&self, at: i64, purpose: AlarmPurpose) -> Result<(), ReminderError> {
        let fire_at = format_millis_rfc3339(at)?;
        info!(purpose = purpose.as_str(), at, %fire_at, "alarm armed");
        Ok(())
    }
}

pub struct LoggedDiagnostics;

impl DiagnosticsSink for LoggedDiagnostics {
    fn report_anomaly(&self, delay: &AlarmDelay) {
        warn!(
            observed_delay = delay.observed_delay_millis,
            expected_interval = delay.expected_interval_millis,
            last_fire_time = delay.last_fire_time,
            "reminder alarm was delivered late"
        );
    }
}

pub struct ProcessWakeLock;

impl WakeLock for ProcessWakeLock {
    fn acquire(&self, tag: &str) {
        debug!(tag, "wake lock acquired");
    }

    fn release(&self, tag: &str) {
        debug!(tag, "wake lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifier_message_lists_titles() {
        assert_eq!(
            TerminalNotifier::new(Vec::new()).message(),
            "reminder: calendar alerts need attention"
        );
        assert_eq!(
            TerminalNotifier::new(vec!["Standup".to_string()]).message(),
            "reminder: Standup"
        );
        assert_eq!(
            TerminalNotifier::new(vec!["Standup".to_string(), "Lunch".to_string()]).message(),
            "reminder: 2 alerts: Standup, Lunch"
        );
    }

    #[test]
    fn timer_rejects_unrepresentable_instant() {
        assert!(LoggedTimer
            .arm_exact_wake(i64::MAX, AlarmPurpose::Reminder)
            .is_err());
        assert!(LoggedTimer
            .arm_exact_wake(60_000, AlarmPurpose::Reminder)
            .is_ok());
    }
}
