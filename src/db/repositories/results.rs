use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, params_from_iter, Connection};

use crate::{
    db::{
        connection::Database,
        helpers::{decode_body, encode_body, format_datetime, to_i64},
    },
    models::SessionResult,
};

/// Write-once insert keyed by session id. Returns false for a replay.
fn insert_if_absent(conn: &Connection, result: &SessionResult) -> Result<bool> {
    let inserted = conn
        .execute(
            "INSERT INTO session_results (id, started_at, body, received_at)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO NOTHING",
            params![
                result.session_id.to_string(),
                format_datetime(&result.started_at),
                encode_body(result, "session result")?,
                format_datetime(&Utc::now()),
            ],
        )
        .with_context(|| format!("failed to insert result {}", result.session_id))?;
    Ok(inserted == 1)
}

fn read_bodies(conn: &Connection, sql: &str, limit: Option<i64>) -> Result<Vec<SessionResult>> {
    let mut stmt = conn.prepare(sql)?;
    let bodies = stmt
        .query_map(params_from_iter(limit), |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()
        .context("failed to read session results")?;
    bodies
        .iter()
        .map(|body| decode_body(body, "session result"))
        .collect()
}

impl Database {
    pub async fn insert_result(&self, result: &SessionResult) -> Result<bool> {
        let result = result.clone();
        self.execute(move |conn| insert_if_absent(conn, &result))
            .await
    }

    /// Inserts every unseen result in one transaction; returns how many were new.
    pub async fn merge_results(&self, incoming: Vec<SessionResult>) -> Result<usize> {
        self.execute(move |conn| {
            let tx = conn.transaction()?;
            let mut inserted = 0;
            for result in &incoming {
                if insert_if_absent(&tx, result)? {
                    inserted += 1;
                }
            }
            tx.commit().context("failed to commit result merge")?;
            Ok(inserted)
        })
        .await
    }

    /// All results in arrival order.
    pub async fn load_results(&self) -> Result<Vec<SessionResult>> {
        self.execute(|conn| {
            read_bodies(conn, "SELECT body FROM session_results ORDER BY seq ASC", None)
        })
        .await
    }

    /// The newest `limit` results, oldest first.
    pub async fn recent_results(&self, limit: usize) -> Result<Vec<SessionResult>> {
        let limit = to_i64(limit as u64)?;
        self.execute(move |conn| {
            read_bodies(
                conn,
                "SELECT body FROM (
                     SELECT seq, body FROM session_results ORDER BY seq DESC LIMIT ?1
                 ) ORDER BY seq ASC",
                Some(limit),
            )
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::EndReason;
    use uuid::Uuid;

    fn result(name: &str) -> SessionResult {
        let ended_at = Utc::now();
        SessionResult {
            session_id: Uuid::new_v4(),
            program_id: None,
            program_name: name.into(),
            started_at: ended_at - chrono::Duration::minutes(30),
            ended_at,
            total_duration_secs: 1800,
            active_energy_kcal: 220.0,
            average_heart_rate: Some(128.0),
            max_heart_rate: Some(171.0),
            distance_m: 4100.0,
            completed_segments: 12,
            end_reason: EndReason::SegmentsExhausted,
        }
    }

    #[tokio::test]
    async fn replayed_result_is_stored_once() {
        let db = Database::open_in_memory().unwrap();
        let first = result("Morning");

        assert!(db.insert_result(&first).await.unwrap());
        assert!(!db.insert_result(&first).await.unwrap());
        assert_eq!(db.merge_results(vec![first.clone(), first.clone()]).await.unwrap(), 0);

        let stored = db.load_results().await.unwrap();
        assert_eq!(stored, vec![first.clone()]);
    }

    #[tokio::test]
    async fn recent_results_keeps_the_newest_in_order() {
        let db = Database::open_in_memory().unwrap();
        let all: Vec<_> = (0..5).map(|i| result(&format!("Run {i}"))).collect();
        assert_eq!(db.merge_results(all.clone()).await.unwrap(), 5);

        let recent = db.recent_results(2).await.unwrap();
        assert_eq!(recent, all[3..].to_vec());
    }
}
