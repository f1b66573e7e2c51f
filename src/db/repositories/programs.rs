use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use crate::{
    db::{
        connection::Database,
        helpers::{decode_body, encode_body, format_datetime, parse_datetime},
    },
    models::TrainingProgram,
    sync::merge::{deletion_applies, merge_program, MergeSummary},
};

fn find_program(conn: &Connection, id: &str) -> Result<Option<TrainingProgram>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM programs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up program")?;
    body.map(|body| decode_body(&body, "program")).transpose()
}

fn find_tombstone(conn: &Connection, id: &str) -> Result<Option<DateTime<Utc>>> {
    let deleted_at: Option<String> = conn
        .query_row(
            "SELECT deleted_at FROM program_tombstones WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()
        .context("failed to look up program tombstone")?;
    deleted_at
        .map(|value| parse_datetime(&value, "deleted_at"))
        .transpose()
}

/// Inserts or overwrites in place; an existing row keeps its catalog position.
fn write_program(conn: &Connection, program: &TrainingProgram) -> Result<()> {
    conn.execute(
        "INSERT INTO programs (id, created_at, modified_at, body)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(id) DO UPDATE SET
             created_at = excluded.created_at,
             modified_at = excluded.modified_at,
             body = excluded.body",
        params![
            program.id.to_string(),
            format_datetime(&program.created_at),
            format_datetime(&program.modified_at),
            encode_body(program, "program")?,
        ],
    )
    .with_context(|| format!("failed to write program {}", program.id))?;
    Ok(())
}

impl Database {
    /// Custom programs in catalog order.
    pub async fn load_programs(&self) -> Result<Vec<TrainingProgram>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare("SELECT body FROM programs ORDER BY seq ASC")?;
            let bodies = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read programs")?;
            bodies
                .iter()
                .map(|body| decode_body(body, "program"))
                .collect()
        })
        .await
    }

    pub async fn get_program(&self, id: Uuid) -> Result<Option<TrainingProgram>> {
        self.execute(move |conn| find_program(conn, &id.to_string()))
            .await
    }

    /// Stores a local edit. Returns true when the program is new. A local save
    /// clears any tombstone for the id.
    pub async fn save_program(&self, program: &TrainingProgram) -> Result<bool> {
        let program = program.clone();
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let id = program.id.to_string();
            let existed = find_program(&tx, &id)?.is_some();
            write_program(&tx, &program)?;
            tx.execute("DELETE FROM program_tombstones WHERE id = ?1", params![id])?;
            tx.commit().context("failed to commit program save")?;
            Ok(!existed)
        })
        .await
    }

    /// Records a deletion and removes the local copy unless it was edited
    /// after `deleted_at`. Returns true when a row was removed.
    pub async fn apply_deletion(&self, id: Uuid, deleted_at: DateTime<Utc>) -> Result<bool> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let key = id.to_string();

            let removed = match find_program(&tx, &key)? {
                Some(local) if deletion_applies(&local, deleted_at) => {
                    tx.execute("DELETE FROM programs WHERE id = ?1", params![key])?;
                    true
                }
                _ => false,
            };

            let newest = match find_tombstone(&tx, &key)? {
                Some(existing) => existing.max(deleted_at),
                None => deleted_at,
            };
            tx.execute(
                "INSERT INTO program_tombstones (id, deleted_at) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET deleted_at = excluded.deleted_at",
                params![key, format_datetime(&newest)],
            )?;

            tx.commit().context("failed to commit program deletion")?;
            Ok(removed)
        })
        .await
    }

    pub async fn program_tombstone(&self, id: Uuid) -> Result<Option<DateTime<Utc>>> {
        self.execute(move |conn| find_tombstone(conn, &id.to_string()))
            .await
    }

    /// Applies received copies in one transaction, so a batch lands entirely
    /// or not at all.
    pub async fn merge_programs(&self, incoming: Vec<TrainingProgram>) -> Result<MergeSummary> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut summary = MergeSummary::default();

            for program in &incoming {
                let id = program.id.to_string();
                let local = find_program(&tx, &id)?;
                let tombstone = find_tombstone(&tx, &id)?;
                let decision = merge_program(local.as_ref(), tombstone, program);
                if decision.writes() {
                    write_program(&tx, program)?;
                }
                summary.record(decision);
            }

            tx.commit().context("failed to commit program merge")?;
            Ok(summary)
        })
        .await
    }
}
