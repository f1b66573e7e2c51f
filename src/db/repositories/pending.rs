use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use crate::{
    db::{
        connection::Database,
        helpers::{decode_body, encode_body, format_datetime, to_i64, to_u32},
    },
    sync::retry::PendingRecord,
};

fn upsert(conn: &Connection, record: &PendingRecord) -> Result<()> {
    // One pending operation per item: a newer one evicts the older.
    conn.execute(
        "DELETE FROM pending_operations WHERE item_key = ?1 AND operation_id != ?2",
        params![record.item_key, record.operation_id.to_string()],
    )?;
    conn.execute(
        "INSERT INTO pending_operations (operation_id, item_key, envelope, attempts, exhausted, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(operation_id) DO UPDATE SET
             envelope = excluded.envelope,
             attempts = excluded.attempts,
             exhausted = excluded.exhausted,
             updated_at = excluded.updated_at",
        params![
            record.operation_id.to_string(),
            record.item_key,
            encode_body(&record.envelope, "pending envelope")?,
            to_i64(u64::from(record.attempts))?,
            record.exhausted,
            format_datetime(&Utc::now()),
        ],
    )
    .with_context(|| format!("failed to persist pending operation {}", record.operation_id))?;
    Ok(())
}

impl Database {
    pub async fn save_pending(&self, records: Vec<PendingRecord>) -> Result<()> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            for record in &records {
                upsert(&tx, record)?;
            }
            tx.commit().context("failed to commit pending operations")?;
            Ok(())
        })
        .await
    }

    pub async fn delete_pending(&self, operation_id: Uuid) -> Result<()> {
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM pending_operations WHERE operation_id = ?1",
                params![operation_id.to_string()],
            )
            .context("failed to delete pending operation")?;
            Ok(())
        })
        .await
    }

    pub async fn delete_pending_for_item(&self, item_key: &str) -> Result<()> {
        let item_key = item_key.to_string();
        self.execute(move |conn| {
            conn.execute(
                "DELETE FROM pending_operations WHERE item_key = ?1",
                params![item_key],
            )
            .context("failed to delete pending operation")?;
            Ok(())
        })
        .await
    }

    pub async fn load_pending(&self) -> Result<Vec<PendingRecord>> {
        self.execute(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation_id, item_key, envelope, attempts, exhausted
                 FROM pending_operations
                 ORDER BY updated_at ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>("operation_id")?,
                        row.get::<_, String>("item_key")?,
                        row.get::<_, String>("envelope")?,
                        row.get::<_, i64>("attempts")?,
                        row.get::<_, bool>("exhausted")?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read pending operations")?;

            rows.into_iter()
                .map(|(operation_id, item_key, envelope, attempts, exhausted)| {
                    Ok::<_, anyhow::Error>(PendingRecord {
                        operation_id: Uuid::parse_str(&operation_id)
                            .context("pending operation id is not a UUID")?,
                        item_key,
                        envelope: decode_body(&envelope, "pending envelope")?,
                        attempts: to_u32(attempts, "attempts")?,
                        exhausted,
                    })
                })
                .collect()
        })
        .await
    }
}
