//! `rk` command surface over the reminder store.
//!
//! [`run_cli`] executes a parsed [`Cli`]; [`run_command`] executes a
//! [`Command`] against an already open [`SqliteEventStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use reminder_kernel_core::{
    now_millis, parse_rfc3339_millis, EventAlertRecord, EventDisplayStatus, EventUpdate,
    QuietHoursWindow, QuietHoursWindowOracle, ReminderProtocol, ReminderSettings,
    DEFAULT_ALARM_THRESHOLD_MILLIS,
};
use reminder_kernel_store_sqlite::{ReminderCollaborators, SchemaVersion, SqliteEventStore};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

mod host;

pub use host::{LoggedDiagnostics, LoggedTimer, ProcessWakeLock, TerminalNotifier};

#[derive(Debug, Parser)]
#[command(name = "rk")]
#[command(about = "Reminder Kernel CLI")]
pub struct Cli {
    #[arg(long, env = "RK_DB", default_value = "./reminder_kernel.sqlite3")]
    db: PathBuf,

    /// Events schema version to open the database at; defaults to the newest.
    #[arg(long)]
    schema_version: Option<i64>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Events {
        #[command(subcommand)]
        command: Box<EventsCommand>,
    },
    Settings {
        #[command(subcommand)]
        command: Box<SettingsCommand>,
    },
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
    Alarm {
        #[command(subcommand)]
        command: AlarmCommand,
    },
    Schema {
        #[command(subcommand)]
        command: SchemaCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum EventsCommand {
    Add(EventAddArgs),
    List(EventListArgs),
    Show(EventKeyArgs),
    Update(EventUpdateArgs),
    MoveInstance(MoveInstanceArgs),
    Delete(EventKeyArgs),
}

/// Timestamps accept epoch milliseconds or RFC3339.
#[derive(Debug, Args)]
pub struct EventAddArgs {
    #[arg(long)]
    event_id: i64,
    #[arg(long, value_parser = parse_timestamp)]
    instance_start: i64,
    #[arg(long, value_parser = parse_timestamp)]
    instance_end: i64,
    #[arg(long)]
    title: String,
    #[arg(long, value_parser = parse_timestamp)]
    alert_time: Option<i64>,
    #[arg(long, value_parser = parse_timestamp)]
    start: Option<i64>,
    #[arg(long, value_parser = parse_timestamp)]
    end: Option<i64>,
    #[arg(long, default_value = "")]
    location: String,
    #[arg(long, value_parser = parse_timestamp, default_value_t = 0)]
    snoozed_until: i64,
    #[arg(long, value_parser = parse_timestamp, default_value_t = 0)]
    last_visibility: i64,
    #[arg(long, value_enum, default_value_t = DisplayStatusArg::DisplayedNormal)]
    display_status: DisplayStatusArg,
    #[arg(long, default_value_t = 0)]
    color: i32,
    #[arg(long)]
    repeating: bool,
}

#[derive(Debug, Args)]
pub struct EventListArgs {
    #[arg(long)]
    event_id: Option<i64>,
    /// Only alerts that keep reminders going.
    #[arg(long)]
    active: bool,
}

#[derive(Debug, Args)]
pub struct EventKeyArgs {
    #[arg(long)]
    event_id: i64,
    #[arg(long, value_parser = parse_timestamp)]
    instance_start: i64,
}

#[derive(Debug, Args)]
pub struct EventUpdateArgs {
    #[command(flatten)]
    key: EventKeyArgs,
    #[arg(long, value_parser = parse_timestamp)]
    alert_time: Option<i64>,
    #[arg(long)]
    title: Option<String>,
    #[arg(long, value_parser = parse_timestamp)]
    snoozed_until: Option<i64>,
    #[arg(long, value_parser = parse_timestamp)]
    start: Option<i64>,
    #[arg(long, value_parser = parse_timestamp)]
    end: Option<i64>,
    #[arg(long)]
    location: Option<String>,
    #[arg(long, value_parser = parse_timestamp)]
    last_visibility: Option<i64>,
    #[arg(long, value_enum)]
    display_status: Option<DisplayStatusArg>,
    #[arg(long)]
    color: Option<i32>,
    #[arg(long)]
    repeating: Option<bool>,
}

#[derive(Debug, Args)]
pub struct MoveInstanceArgs {
    #[command(flatten)]
    key: EventKeyArgs,
    #[arg(long, value_parser = parse_timestamp)]
    new_start: i64,
    #[arg(long, value_parser = parse_timestamp)]
    new_end: i64,
}

#[derive(Debug, Subcommand)]
pub enum SettingsCommand {
    Show,
    Set(SettingsSetArgs),
}

#[derive(Debug, Args)]
pub struct SettingsSetArgs {
    /// Replaces the stored settings with this JSON document.
    #[arg(long, conflicts_with_all = [
        "interval_millis", "enabled", "max_reminders", "one_shot",
        "quiet_hours", "quiet_from", "quiet_to", "utc_offset_minutes",
    ])]
    json: Option<String>,
    #[arg(long)]
    interval_millis: Option<i64>,
    #[arg(long)]
    enabled: Option<bool>,
    /// 0 means unlimited.
    #[arg(long)]
    max_reminders: Option<u32>,
    #[arg(long)]
    one_shot: Option<bool>,
    #[arg(long)]
    quiet_hours: Option<bool>,
    /// Local `HH:MM`.
    #[arg(long)]
    quiet_from: Option<String>,
    /// Local `HH:MM`.
    #[arg(long)]
    quiet_to: Option<String>,
    #[arg(long, allow_hyphen_values = true)]
    utc_offset_minutes: Option<i16>,
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    Show,
    /// Records a freshly posted notification and restarts the reminder budget.
    NotificationPosted {
        #[arg(long, value_parser = parse_timestamp)]
        at: Option<i64>,
    },
}

#[derive(Debug, Subcommand)]
pub enum AlarmCommand {
    /// Runs one reminder wake-up.
    Fire {
        #[arg(long, value_parser = parse_timestamp)]
        now: Option<i64>,
        #[arg(long, default_value_t = DEFAULT_ALARM_THRESHOLD_MILLIS)]
        threshold_millis: i64,
    },
    Pending,
}

#[derive(Debug, Subcommand)]
pub enum SchemaCommand {
    Version,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DisplayStatusArg {
    Hidden,
    DisplayedNormal,
    DisplayedCollapsed,
}

impl From<DisplayStatusArg> for EventDisplayStatus {
    fn from(value: DisplayStatusArg) -> Self {
        match value {
            DisplayStatusArg::Hidden => Self::Hidden,
            DisplayStatusArg::DisplayedNormal => Self::DisplayedNormal,
            DisplayStatusArg::DisplayedCollapsed => Self::DisplayedCollapsed,
        }
    }
}

#[derive(Debug, Serialize)]
struct SchemaReport {
    schema_version: i64,
    current: i64,
    oldest_upgradable: i64,
}

/// Installs the stderr log subscriber; `RUST_LOG` overrides the `info` default.
///
/// # Errors
/// Returns an error when a global subscriber is already installed.
pub fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow!("failed to install log subscriber: {err}"))
}

/// Opens the store named by the CLI flags and executes the command.
///
/// # Errors
/// Returns an error when the store cannot be opened or upgraded, or the
/// command fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let target = cli
        .schema_version
        .unwrap_or_else(|| SchemaVersion::CURRENT.number());
    let store = SqliteEventStore::open_with_version(&cli.db, target)?;
    run_command(cli.command, &store)?;
    store.close()
}

/// Executes a parsed command against an open store, printing JSON to stdout.
///
/// # Errors
/// Returns an error when argument validation or a store operation fails.
pub fn run_command(command: Command, store: &SqliteEventStore) -> Result<()> {
    match command {
        Command::Events { command } => run_events(*command, store),
        Command::Settings { command } => match *command {
            SettingsCommand::Show => print_json(&store.settings()?),
            SettingsCommand::Set(args) => {
                let settings = merge_settings(store.settings()?, &args)?;
                store.save_settings(&settings)?;
                print_json(&settings)
            }
        },
        Command::State { command } => match command {
            StateCommand::Show => print_json(&store.scheduler_state()?),
            StateCommand::NotificationPosted { at } => {
                print_json(&store.record_notification_posted(at.unwrap_or_else(now_millis))?)
            }
        },
        Command::Alarm { command } => match command {
            AlarmCommand::Fire {
                now,
                threshold_millis,
            } => {
                let protocol = ReminderProtocol::new(threshold_millis)
                    .map_err(|err| anyhow!("invalid alarm threshold: {err}"))?;
                let titles = store
                    .all_events()?
                    .into_iter()
                    .filter(EventAlertRecord::is_active)
                    .map(|event| event.title)
                    .collect();
                let notifier = TerminalNotifier::new(titles);
                let collaborators = ReminderCollaborators {
                    quiet_hours: &QuietHoursWindowOracle,
                    timer: &LoggedTimer,
                    notifier: &notifier,
                    diagnostics: &LoggedDiagnostics,
                    wake_lock: &ProcessWakeLock,
                };
                let outcome = store.on_reminder_alarm(
                    now.unwrap_or_else(now_millis),
                    &protocol,
                    &collaborators,
                )?;
                print_json(&outcome)
            }
            AlarmCommand::Pending => print_json(&store.pending_alarms()?),
        },
        Command::Schema {
            command: SchemaCommand::Version,
        } => print_json(&SchemaReport {
            schema_version: store.schema_version()?,
            current: SchemaVersion::CURRENT.number(),
            oldest_upgradable: SchemaVersion::OLDEST.number(),
        }),
    }
}

fn run_events(command: EventsCommand, store: &SqliteEventStore) -> Result<()> {
    match command {
        EventsCommand::Add(args) => {
            let event = EventAlertRecord {
                event_id: args.event_id,
                instance_start_time: args.instance_start,
                instance_end_time: args.instance_end,
                alert_time: args.alert_time.unwrap_or(args.instance_start),
                title: args.title,
                snoozed_until: args.snoozed_until,
                start_time: args.start.unwrap_or(args.instance_start),
                end_time: args.end.unwrap_or(args.instance_end),
                location: args.location,
                last_event_visibility: args.last_visibility,
                display_status: args.display_status.into(),
                color: args.color,
                is_repeating: args.repeating,
            };
            store.add_event(&event)?;
            print_json(&event)
        }
        EventsCommand::List(args) => {
            let mut events = match args.event_id {
                Some(event_id) => store.get_event_instances(event_id)?,
                None => store.all_events()?,
            };
            if args.active {
                events.retain(EventAlertRecord::is_active);
            }
            print_json(&events)
        }
        EventsCommand::Show(args) => print_json(&require_event(store, &args)?),
        EventsCommand::Update(args) => {
            let fields = EventUpdate {
                alert_time: args.alert_time,
                title: args.title,
                snoozed_until: args.snoozed_until,
                start_time: args.start,
                end_time: args.end,
                location: args.location,
                last_event_visibility: args.last_visibility,
                display_status: args.display_status.map(Into::into),
                color: args.color,
                is_repeating: args.repeating,
            };
            if fields.is_empty() {
                return Err(anyhow!("events update requires at least one field to change"));
            }
            let current = require_event(store, &args.key)?;
            print_json(&store.update_event_fields(&current, &fields)?)
        }
        EventsCommand::MoveInstance(args) => {
            let current = require_event(store, &args.key)?;
            print_json(&store.update_event_and_instance_times(
                &current,
                args.new_start,
                args.new_end,
            )?)
        }
        EventsCommand::Delete(args) => {
            let current = require_event(store, &args)?;
            store.delete_record(&current)?;
            print_json(&current.key())
        }
    }
}

fn require_event(store: &SqliteEventStore, key: &EventKeyArgs) -> Result<EventAlertRecord> {
    store
        .get_event(key.event_id, key.instance_start)?
        .ok_or_else(|| anyhow!("event {}@{} not found", key.event_id, key.instance_start))
}

fn merge_settings(current: ReminderSettings, args: &SettingsSetArgs) -> Result<ReminderSettings> {
    if let Some(raw) = &args.json {
        let value: serde_json::Value = serde_json::from_str(raw)
            .with_context(|| format!("settings JSON must be valid JSON: {raw}"))?;
        return ReminderSettings::from_json(&value)
            .map_err(|err| anyhow!("invalid reminder settings: {err}"));
    }

    let mut settings = current;
    if let Some(interval) = args.interval_millis {
        settings.reminders_interval_millis = interval;
    }
    if let Some(enabled) = args.enabled {
        settings.reminders_enabled = enabled;
    }
    if let Some(max) = args.max_reminders {
        settings.max_number_of_reminders = max;
    }
    if let Some(one_shot) = args.one_shot {
        settings.quiet_hours_one_time_reminder_enabled = one_shot;
    }

    let quiet = &mut settings.quiet_hours;
    if let Some(enabled) = args.quiet_hours {
        quiet.enabled = enabled;
    }
    if let Some(raw) = &args.quiet_from {
        quiet.from_minute = parse_minute(raw)?;
    }
    if let Some(raw) = &args.quiet_to {
        quiet.to_minute = parse_minute(raw)?;
    }
    if let Some(offset) = args.utc_offset_minutes {
        quiet.utc_offset_minutes = offset;
    }

    settings
        .validate()
        .map_err(|err| anyhow!("invalid reminder settings: {err}"))?;
    Ok(settings)
}

fn parse_minute(raw: &str) -> Result<u16> {
    QuietHoursWindow::parse_minute_of_day(raw).map_err(|err| anyhow!("invalid quiet hours: {err}"))
}

fn parse_timestamp(raw: &str) -> Result<i64, String> {
    if let Ok(millis) = raw.parse::<i64>() {
        return Ok(millis);
    }
    parse_rfc3339_millis(raw).map_err(|err| err.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use ulid::Ulid;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err:#}"),
        }
    }

    fn temp_db_path() -> PathBuf {
        std::env::temp_dir().join(format!("rk-lib-{}.sqlite3", Ulid::new()))
    }

    fn execute_cli(db: &Path, args: &[&str]) -> Result<()> {
        let mut argv = vec!["rk".to_string(), "--db".to_string(), db.display().to_string()];
        argv.extend(args.iter().map(ToString::to_string));
        let cli = Cli::try_parse_from(argv)?;
        run_cli(cli)
    }

    fn no_flags() -> SettingsSetArgs {
        SettingsSetArgs {
            json: None,
            interval_millis: None,
            enabled: None,
            max_reminders: None,
            one_shot: None,
            quiet_hours: None,
            quiet_from: None,
            quiet_to: None,
            utc_offset_minutes: None,
        }
    }

    #[test]
    fn timestamps_accept_millis_and_rfc3339() {
        assert_eq!(parse_timestamp("1000"), Ok(1_000));
        assert_eq!(parse_timestamp("1970-01-01T00:00:01Z"), Ok(1_000));
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn settings_flags_merge_onto_current() {
        let args = SettingsSetArgs {
            enabled: Some(true),
            quiet_hours: Some(true),
            quiet_from: Some("23:30".to_string()),
            utc_offset_minutes: Some(-300),
            ..no_flags()
        };

        let merged = must(merge_settings(ReminderSettings::default(), &args));

        assert!(merged.reminders_enabled);
        assert_eq!(merged.reminders_interval_millis, 600_000);
        assert!(merged.quiet_hours.enabled);
        assert_eq!(merged.quiet_hours.from_minute, 23 * 60 + 30);
        assert_eq!(merged.quiet_hours.to_minute, 7 * 60);
        assert_eq!(merged.quiet_hours.utc_offset_minutes, -300);
    }

    #[test]
    fn settings_merge_rejects_invalid_values() {
        let bad_interval = SettingsSetArgs {
            interval_millis: Some(0),
            ..no_flags()
        };
        assert!(merge_settings(ReminderSettings::default(), &bad_interval).is_err());

        let bad_time = SettingsSetArgs {
            quiet_to: Some("25:00".to_string()),
            ..no_flags()
        };
        assert!(merge_settings(ReminderSettings::default(), &bad_time).is_err());
    }

    #[test]
    fn settings_json_replaces_everything() {
        let args = SettingsSetArgs {
            json: Some(
                r#"{"reminders_interval_millis":120000,"reminders_enabled":true,
                    "max_number_of_reminders":2,"quiet_hours_one_time_reminder_enabled":true}"#
                    .to_string(),
            ),
            ..no_flags()
        };
        let current = ReminderSettings {
            max_number_of_reminders: 9,
            ..ReminderSettings::default()
        };

        let merged = must(merge_settings(current, &args));
        assert_eq!(merged.max_number_of_reminders, 2);
        assert!(merged.quiet_hours_one_time_reminder_enabled);
    }

    #[test]
    fn cli_add_then_update_persists_changes() {
        let db = temp_db_path();
        must(execute_cli(
            &db,
            &[
                "events",
                "add",
                "--event-id",
                "5",
                "--instance-start",
                "2026-02-07T09:00:00Z",
                "--instance-end",
                "2026-02-07T10:00:00Z",
                "--title",
                "Review",
            ],
        ));
        must(execute_cli(
            &db,
            &[
                "events",
                "update",
                "--event-id",
                "5",
                "--instance-start",
                "2026-02-07T09:00:00Z",
                "--snoozed-until",
                "2026-02-07T09:30:00Z",
            ],
        ));

        let store = must(SqliteEventStore::open(&db));
        let start = must(
            parse_rfc3339_millis("2026-02-07T09:00:00Z").map_err(|err| anyhow!(err.to_string())),
        );
        let event = must(store.get_event(5, start));
        let Some(event) = event else {
            panic!("event 5 missing after update");
        };
        assert_eq!(event.title, "Review");
        assert!(!event.is_active());
        must(store.close());
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn cli_update_without_fields_fails() {
        let db = temp_db_path();
        let result = execute_cli(
            &db,
            &["events", "update", "--event-id", "1", "--instance-start", "1000"],
        );
        assert!(result.is_err());
        let _ = std::fs::remove_file(&db);
    }

    #[test]
    fn second_tracing_install_is_reported() {
        let _ = init_tracing();
        let err = match init_tracing() {
            Ok(()) => panic!("second subscriber install should fail"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("failed to install log subscriber"));
    }
}
