//! Key/value settings stored as JSON

use coinalert_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;

/// Read and decode a setting, `None` if it was never written
pub async fn get_setting<T: DeserializeOwned>(pool: &SqlitePool, key: &str) -> Result<Option<T>> {
    let row: Option<(String,)> = sqlx::query_as("SELECT value FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    match row {
        Some((value,)) => Ok(Some(serde_json::from_str(&value)?)),
        None => Ok(None),
    }
}

/// Encode and store a setting, replacing any previous value
pub async fn set_setting<T: Serialize>(pool: &SqlitePool, key: &str, value: &T) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO settings (key, value) VALUES (?, ?)
        ON CONFLICT(key) DO UPDATE SET value = excluded.value
        "#,
    )
    .bind(key)
    .bind(serde_json::to_string(value)?)
    .execute(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Poll {
        interval_secs: u64,
    }

    #[tokio::test]
    async fn test_setting_roundtrip_and_overwrite() {
        let db = Database::connect_in_memory().await.unwrap();

        assert_eq!(get_setting::<Poll>(db.pool(), "poll").await.unwrap(), None);

        set_setting(db.pool(), "poll", &Poll { interval_secs: 30 }).await.unwrap();
        set_setting(db.pool(), "poll", &Poll { interval_secs: 5 }).await.unwrap();

        assert_eq!(
            get_setting::<Poll>(db.pool(), "poll").await.unwrap(),
            Some(Poll { interval_secs: 5 })
        );
    }
}
