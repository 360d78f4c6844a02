use async_trait::async_trait;
use rusqlite::params;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio_rusqlite::Connection;

/// Named option records: credentials, folder paths and all run-progress
/// counters live here. Read at the start of every operation.
#[async_trait]
pub trait OptionStore: Send + Sync {
    async fn get(&self, name: &str) -> Result<Option<String>, anyhow::Error>;
    async fn set(&self, name: &str, value: String) -> Result<(), anyhow::Error>;
    async fn delete(&self, name: &str) -> Result<(), anyhow::Error>;
}

pub struct SqliteOptionStore {
    conn: Connection,
}

impl SqliteOptionStore {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS options (
                    name TEXT PRIMARY KEY,
                    value TEXT NOT NULL
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl OptionStore for SqliteOptionStore {
    async fn get(&self, name: &str) -> Result<Option<String>, anyhow::Error> {
        let name = name.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare("SELECT value FROM options WHERE name = ?1")?;
                let v = stmt
                    .query_map([name], |row| row.get(0))?
                    .next()
                    .transpose()?;
                Ok(v)
            })
            .await?)
    }

    async fn set(&self, name: &str, value: String) -> Result<(), anyhow::Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO options (name, value) VALUES (?1, ?2)
                     ON CONFLICT(name) DO UPDATE SET value = ?2",
                    params![name, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn delete(&self, name: &str) -> Result<(), anyhow::Error> {
        let name = name.to_string();
        self.conn
            .call(move |conn| {
                conn.execute("DELETE FROM options WHERE name = ?1", params![name])?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

pub async fn get_json<T: DeserializeOwned>(
    store: &dyn OptionStore,
    name: &str,
) -> Result<Option<T>, anyhow::Error> {
    match store.get(name).await? {
        Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
        None => Ok(None),
    }
}

pub async fn set_json<T: Serialize>(
    store: &dyn OptionStore,
    name: &str,
    value: &T,
) -> Result<(), anyhow::Error> {
    store.set(name, serde_json::to_string(value)?).await
}
