//! Schema upgrades, tracked through `PRAGMA user_version`.

pub mod v001_initial;

use rusqlite::Connection;

use crate::error::{Result, StoreError};

type Upgrade = fn(&Connection) -> std::result::Result<(), rusqlite::Error>;

/// Ordered upgrades; entry `i` moves the schema from version `i` to `i + 1`.
const UPGRADES: &[(&str, Upgrade)] = &[("v001_initial", v001_initial::up)];

/// Apply every upgrade above the stored schema version, each in its own
/// transaction.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let stored: usize = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;

    if stored > UPGRADES.len() {
        return Err(StoreError::Migration(format!(
            "database schema v{stored} is newer than this build (v{})",
            UPGRADES.len()
        )));
    }

    for (index, (name, upgrade)) in UPGRADES.iter().enumerate().skip(stored) {
        tracing::info!(migration = name, "upgrading document schema");
        let tx = conn.transaction()?;
        upgrade(&tx).map_err(|e| StoreError::Migration(format!("{name}: {e}")))?;
        tx.pragma_update(None, "user_version", index + 1)?;
        tx.commit()?;
    }

    Ok(())
}
