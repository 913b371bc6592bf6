//! Reminder alarm driver: one invocation per timer wake-up.

use anyhow::{Context, Result};
use reminder_kernel_core::{
    commit_fire, hold_wake_lock, AlarmPurpose, DiagnosticsSink, NotificationEmitter,
    QuietHoursOracle, ReminderDecision, ReminderProtocol, SchedulerState, TimerService, WakeLock,
};
use rusqlite::{Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tracing::{info, info_span};
use ulid::Ulid;

use crate::schema::EventsTable;
use crate::{
    clear_elapsed_alarms, load_settings, load_state, upsert_armed_alarm, write_fire_commit,
    SqliteEventStore,
};

pub const WAKE_LOCK_TAG: &str = "reminder-kernel:reminder-alarm";

/// Host services the driver calls out to during one wake-up.
#[derive(Clone, Copy)]
pub struct ReminderCollaborators<'a> {
    pub quiet_hours: &'a dyn QuietHoursOracle,
    pub timer: &'a dyn TimerService,
    pub notifier: &'a dyn NotificationEmitter,
    pub diagnostics: &'a dyn DiagnosticsSink,
    pub wake_lock: &'a dyn WakeLock,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct AlarmOutcome {
    pub invocation_id: Ulid,
    pub decision: ReminderDecision,
    /// Scheduler state as persisted when the invocation finished.
    pub state: SchedulerState,
}

impl SqliteEventStore {
    /// Handles one reminder timer wake-up at `now`.
    ///
    /// The wake lock is held for the whole invocation. State is read, decided
    /// on and written inside one `BEGIN IMMEDIATE` transaction, so overlapping
    /// wake-ups in other processes wait for the write lock and see the
    /// committed result. Nothing is committed when a collaborator fails.
    pub fn on_reminder_alarm(
        &self,
        now: i64,
        protocol: &ReminderProtocol,
        collaborators: &ReminderCollaborators<'_>,
    ) -> Result<AlarmOutcome> {
        let invocation_id = Ulid::new();
        let span = info_span!("reminder_alarm", %invocation_id, now);
        let _entered = span.enter();

        self.record_timer_broadcast(now)?;
        let _wake = hold_wake_lock(collaborators.wake_lock, WAKE_LOCK_TAG);

        self.with_conn(|conn, table| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .context("failed to start reminder alarm transaction")?;
            let invocation = Invocation {
                id: invocation_id,
                now,
                protocol,
                collaborators,
            };
            let outcome = invocation.run(&tx, table)?;
            tx.commit().context("failed to commit reminder alarm")?;
            Ok(outcome)
        })
    }
}

struct Invocation<'a, 'c> {
    id: Ulid,
    now: i64,
    protocol: &'a ReminderProtocol,
    collaborators: &'a ReminderCollaborators<'c>,
}

impl Invocation<'_, '_> {
    fn run(&self, conn: &Connection, table: &dyn EventsTable) -> Result<AlarmOutcome> {
        let now = self.now;
        clear_elapsed_alarms(conn, now)?;

        if !table.has_active(conn)? {
            info!("no active events, reminders stop here");
            return Ok(AlarmOutcome {
                invocation_id: self.id,
                decision: ReminderDecision::no_active_events(),
                state: load_state(conn)?,
            });
        }

        let settings = load_settings(conn)?;
        let state = load_state(conn)?;
        let silent_until = self
            .collaborators
            .quiet_hours
            .silent_until(&settings, now)
            .context("quiet hours lookup failed")?;

        let decision = self.protocol.decide(now, &settings, silent_until, &state);

        if let Some(delay) = &decision.anomaly {
            self.collaborators.diagnostics.report_anomaly(delay);
        }

        if let Some(at) = decision.reschedule_at {
            self.collaborators
                .timer
                .arm_exact_wake(at, AlarmPurpose::Reminder)
                .context("failed to arm reminder alarm")?;
            upsert_armed_alarm(conn, AlarmPurpose::Reminder, at, now)?;
        }

        let Some(trigger) = decision.fire else {
            info!(reason = ?decision.reason, "reminder not fired");
            return Ok(AlarmOutcome {
                invocation_id: self.id,
                decision,
                state,
            });
        };

        self.collaborators.notifier.fire_reminder();
        let commit = commit_fire(trigger, now, &state, &settings);
        write_fire_commit(conn, &commit, &settings, now)?;
        info!(
            ?trigger,
            num_fired = commit.state.num_reminders_fired,
            one_shot_cleared = commit.clear_one_shot,
            "reminder fired"
        );

        Ok(AlarmOutcome {
            invocation_id: self.id,
            decision,
            state: commit.state,
        })
    }
}
