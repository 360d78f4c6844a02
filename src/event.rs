use crate::reconcile::StatusSweep;
use crate::EntityStatus;
use async_trait::async_trait;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_rusqlite::Connection;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct EventFields {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub start_date: String,
    #[serde(default)]
    pub end_date: String,
    #[serde(default)]
    pub start_time: String,
    #[serde(default)]
    pub end_time: String,
    #[serde(default)]
    pub times: String,
    #[serde(default)]
    pub event_dates: Vec<String>,
    #[serde(default)]
    pub recurrence: String,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub admission: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub zip: String,
    #[serde(default)]
    pub map_coordinates: String,
    /// Local ID of the listing hosting this event, when that listing is
    /// mirrored here too.
    #[serde(default)]
    pub host_listing: Option<i64>,
    #[serde(default)]
    pub never_expire: bool,
    #[serde(default)]
    pub featured: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Event {
    pub id: i64,
    pub event_id: u64,
    pub title: String,
    pub status: EntityStatus,
    pub fields: EventFields,
}

#[async_trait]
pub trait EventRepository: StatusSweep {
    async fn get(&self, id: i64) -> Result<Option<Event>, anyhow::Error>;
    async fn existing_ids(&self) -> Result<HashMap<u64, i64>, anyhow::Error>;
    async fn insert(&self, event: Event) -> Result<i64, anyhow::Error>;
    async fn update(&self, event: &Event) -> Result<(), anyhow::Error>;
}

pub struct SqliteEventRepository {
    conn: Connection,
}

impl SqliteEventRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS event (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    event_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL,
                    fields TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_event_external ON event (event_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> Result<Event, rusqlite::Error> {
    let status: String = row.get(3)?;
    let fields: String = row.get(4)?;
    let fields = serde_json::from_str(&fields).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(Event {
        id: row.get(0)?,
        event_id: row.get::<_, i64>(1)? as u64,
        title: row.get(2)?,
        status: EntityStatus::parse(&status).unwrap_or_default(),
        fields,
    })
}

#[async_trait]
impl EventRepository for SqliteEventRepository {
    async fn get(&self, id: i64) -> Result<Option<Event>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, event_id, title, status, fields FROM event WHERE id = ?1",
                )?;
                let e = stmt.query_map([id], row_to_event)?.next().transpose()?;
                Ok(e)
            })
            .await?)
    }

    async fn existing_ids(&self) -> Result<HashMap<u64, i64>, anyhow::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT event_id, id FROM event")?;
                let pairs = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok(pairs)
            })
            .await?)
    }

    async fn insert(&self, event: Event) -> Result<i64, anyhow::Error> {
        let fields = serde_json::to_string(&event.fields)?;
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO event (event_id, title, status, fields) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        event.event_id as i64,
                        event.title,
                        event.status.as_str(),
                        fields
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    async fn update(&self, event: &Event) -> Result<(), anyhow::Error> {
        let fields = serde_json::to_string(&event.fields)?;
        let event = event.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE event SET event_id = ?2, title = ?3, status = ?4, fields = ?5
                     WHERE id = ?1",
                    params![
                        event.id,
                        event.event_id as i64,
                        event.title,
                        event.status.as_str(),
                        fields
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusSweep for SqliteEventRepository {
    async fn sweep_universe(&self) -> Result<Vec<i64>, anyhow::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM event WHERE status != 'trash' ORDER BY id")?;
                let ids = stmt
                    .query_map([], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await?)
    }

    async fn set_status_bulk(
        &self,
        ids: &[i64],
        status: EntityStatus,
    ) -> Result<(), anyhow::Error> {
        let ids = ids.to_vec();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare("UPDATE event SET status = ?1 WHERE id = ?2")?;
                    for id in &ids {
                        stmt.execute(params![status.as_str(), id])?;
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {

    use super::*;

    #[tokio::test]
    async fn insert_then_update_keeps_one_row() {
        let conn = Connection::open_in_memory().await.expect("conn");
        let repo = SqliteEventRepository::init(conn).await.expect("table");
        let id = repo
            .insert(Event {
                id: 0,
                event_id: 9001,
                title: "Harvest Festival".to_string(),
                status: EntityStatus::Publish,
                fields: EventFields::default(),
            })
            .await
            .expect("insert");
        let mut event = repo.get(id).await.expect("get").expect("row");
        event.title = "Harvest Festival 2026".to_string();
        repo.update(&event).await.expect("update");
        let ids = repo.existing_ids().await.expect("ids");
        assert_eq!(1, ids.len());
        assert_eq!(
            "Harvest Festival 2026",
            repo.get(id).await.expect("get").expect("row").title
        );
    }
}
