use std::cmp::Ordering;

use anyhow::{bail, Context, Result};
use log::info;
use rusqlite::Connection;

const SCHEMA_VERSION: i32 = 2;

fn schema_script(version: i32) -> Option<&'static str> {
    match version {
        1 => Some(include_str!("schemas/schema_v1.sql")),
        2 => Some(include_str!("schemas/schema_v2.sql")),
        _ => None,
    }
}

/// Brings the store up to `SCHEMA_VERSION` in one transaction, tracked
/// through SQLite's `user_version`.
pub fn run_migrations(conn: &mut Connection) -> Result<()> {
    let found: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .context("failed to read schema version")?;

    match found.cmp(&SCHEMA_VERSION) {
        Ordering::Equal => return Ok(()),
        Ordering::Greater => bail!(
            "store was written by a newer build (schema {found}, this build knows {SCHEMA_VERSION})"
        ),
        Ordering::Less => {}
    }

    let tx = conn.transaction().context("failed to begin migration")?;
    for target in (found + 1)..=SCHEMA_VERSION {
        let Some(script) = schema_script(target) else {
            bail!("no schema script for version {target}");
        };
        tx.execute_batch(script)
            .with_context(|| format!("schema_v{target}.sql failed"))?;
        info!("Applied schema version {target}");
    }
    tx.pragma_update(None, "user_version", SCHEMA_VERSION)
        .context("failed to record schema version")?;
    tx.commit().context("failed to commit migration")
}
