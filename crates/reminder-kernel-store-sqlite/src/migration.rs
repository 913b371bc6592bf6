use anyhow::{Context, Result};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use tracing::{debug, error, info, warn};

use crate::schema::{EventsTable, SchemaVersion};
use crate::SchemaError;

/// Brings the events schema to `target` inside one transaction.
///
/// A failed step rolls back every step before it, leaving the file at its
/// prior version. The write lock is taken up front so processes opening the
/// same file concurrently upgrade it one at a time.
pub(crate) fn upgrade(conn: &mut Connection, target: SchemaVersion) -> Result<()> {
    let tx = conn
        .transaction_with_behavior(TransactionBehavior::Immediate)
        .context("failed to start schema upgrade transaction")?;
    let on_disk = read_user_version(&tx)?;
    let to = target.number();

    if on_disk == to {
        target.table().create(&tx)?;
        tx.commit().context("failed to commit schema check")?;
        return Ok(());
    }

    if on_disk > to {
        return Err(SchemaError::UnsupportedUpgrade { from: on_disk, to }.into());
    }

    if on_disk == 0 {
        info!(version = to, "creating events schema");
        target.table().create(&tx)?;
    } else if on_disk < SchemaVersion::OLDEST.number() {
        warn!(
            from = on_disk,
            to, "events schema too old to upgrade, recreating without data"
        );
        drop_every_layout(&tx)?;
        target.table().create(&tx)?;
    } else {
        let mut current = SchemaVersion::try_from(on_disk)
            .map_err(|_| SchemaError::UnsupportedUpgrade { from: on_disk, to })?;
        while current < target {
            let next = current
                .next()
                .ok_or(SchemaError::UnsupportedUpgrade { from: on_disk, to })?;
            migrate_step(&tx, current.table(), next.table())?;
            current = next;
        }
    }

    tx.pragma_update(None, "user_version", to)
        .context("failed to record events schema version")?;
    tx.commit().context("failed to commit schema upgrade")?;
    Ok(())
}

pub(crate) fn read_user_version(conn: &Connection) -> Result<i64> {
    conn.pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read sqlite user_version")
}

fn drop_every_layout(tx: &Transaction<'_>) -> Result<()> {
    for version in [SchemaVersion::V6, SchemaVersion::V7] {
        version.table().drop_all(tx)?;
    }
    Ok(())
}

fn migrate_step(tx: &Transaction<'_>, old: &dyn EventsTable, new: &dyn EventsTable) -> Result<()> {
    let from = old.version().number();
    let to = new.version().number();
    info!(from, to, "upgrading events schema");

    new.create(tx)?;

    let events = old.all(tx)?;
    debug!(from, to, count = events.len(), "converting events");
    for event in &events {
        new.insert(tx, event)?;
        old.delete(tx, event.event_id, event.instance_start_time)?;
        debug!(key = %event.key(), "event converted");
    }

    let residual = old.all(tx)?.len();
    if residual != 0 {
        error!(from, to, residual, "old events table not empty after conversion");
        return Err(SchemaError::MigrationIntegrity { from, to, residual }.into());
    }

    old.drop_all(tx)?;
    info!(from, to, converted = events.len(), "events schema upgraded");
    Ok(())
}
