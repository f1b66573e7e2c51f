use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{de::DeserializeOwned, Serialize};

use crate::db::{
    connection::Database,
    helpers::{decode_body, encode_body, format_datetime},
};

const LAST_SYNC_KEY: &str = "last_sync_at";

impl Database {
    pub async fn get_meta<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send + 'static,
    {
        let key = key.to_string();
        self.execute(move |conn| {
            let value: Option<String> = conn
                .query_row(
                    "SELECT value FROM sync_meta WHERE key = ?1",
                    params![key],
                    |row| row.get(0),
                )
                .optional()
                .with_context(|| format!("failed to read sync meta {key}"))?;
            value.map(|value| decode_body(&value, &key)).transpose()
        })
        .await
    }

    pub async fn set_meta<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let key = key.to_string();
        let value = encode_body(value, &key)?;
        self.execute(move |conn| {
            conn.execute(
                "INSERT INTO sync_meta (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at",
                params![key, value, format_datetime(&Utc::now())],
            )
            .with_context(|| format!("failed to write sync meta {key}"))?;
            Ok(())
        })
        .await
    }

    pub async fn last_sync_at(&self) -> Result<Option<DateTime<Utc>>> {
        self.get_meta(LAST_SYNC_KEY).await
    }

    pub async fn set_last_sync_at(&self, at: DateTime<Utc>) -> Result<()> {
        self.set_meta(LAST_SYNC_KEY, &at).await
    }
}
