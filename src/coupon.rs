use crate::reconcile::StatusSweep;
use crate::EntityStatus;
use async_trait::async_trait;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_rusqlite::Connection;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CouponFields {
    #[serde(default)]
    pub offer_text: String,
    #[serde(default)]
    pub offer_link: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub zip: String,
    /// YYYYMMDD, reshaped from the vendor's MM-DD-YYYY.
    #[serde(default)]
    pub redeem_start: String,
    #[serde(default)]
    pub redeem_end: String,
    /// Local ID of the listing this coupon belongs to, when known.
    #[serde(default)]
    pub related_listing: Option<i64>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Coupon {
    pub id: i64,
    pub coupon_id: u64,
    pub title: String,
    pub status: EntityStatus,
    pub fields: CouponFields,
}

#[async_trait]
pub trait CouponRepository: StatusSweep {
    async fn get(&self, id: i64) -> Result<Option<Coupon>, anyhow::Error>;
    async fn existing_ids(&self) -> Result<HashMap<u64, i64>, anyhow::Error>;
    async fn insert(&self, coupon: Coupon) -> Result<i64, anyhow::Error>;
    async fn update(&self, coupon: &Coupon) -> Result<(), anyhow::Error>;
    async fn trash(&self, id: i64) -> Result<(), anyhow::Error>;
}

pub struct SqliteCouponRepository {
    conn: Connection,
}

impl SqliteCouponRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS coupon (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    coupon_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL,
                    fields TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_coupon_external ON coupon (coupon_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_coupon(row: &rusqlite::Row<'_>) -> Result<Coupon, rusqlite::Error> {
    let status: String = row.get(3)?;
    let fields: String = row.get(4)?;
    let fields = serde_json::from_str(&fields).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(Coupon {
        id: row.get(0)?,
        coupon_id: row.get::<_, i64>(1)? as u64,
        title: row.get(2)?,
        status: EntityStatus::parse(&status).unwrap_or_default(),
        fields,
    })
}

#[async_trait]
impl CouponRepository for SqliteCouponRepository {
    async fn get(&self, id: i64) -> Result<Option<Coupon>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, coupon_id, title, status, fields FROM coupon WHERE id = ?1",
                )?;
                let c = stmt.query_map([id], row_to_coupon)?.next().transpose()?;
                Ok(c)
            })
            .await?)
    }

    async fn existing_ids(&self) -> Result<HashMap<u64, i64>, anyhow::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT coupon_id, id FROM coupon")?;
                let pairs = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok(pairs)
            })
            .await?)
    }

    async fn insert(&self, coupon: Coupon) -> Result<i64, anyhow::Error> {
        let fields = serde_json::to_string(&coupon.fields)?;
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO coupon (coupon_id, title, status, fields) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        coupon.coupon_id as i64,
                        coupon.title,
                        coupon.status.as_str(),
                        fields
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    async fn update(&self, coupon: &Coupon) -> Result<(), anyhow::Error> {
        let fields = serde_json::to_string(&coupon.fields)?;
        let coupon = coupon.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE coupon SET coupon_id = ?2, title = ?3, status = ?4, fields = ?5
                     WHERE id = ?1",
                    params![
                        coupon.id,
                        coupon.coupon_id as i64,
                        coupon.title,
                        coupon.status.as_str(),
                        fields
                    ],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn trash(&self, id: i64) -> Result<(), anyhow::Error> {
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE coupon SET status = 'trash' WHERE id = ?1",
                    params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StatusSweep for SqliteCouponRepository {
    async fn sweep_universe(&self) -> Result<Vec<i64>, anyhow::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM coupon WHERE status != 'trash' ORDER BY id")?;
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
                    let mut stmt = tx.prepare("UPDATE coupon SET status = ?1 WHERE id = ?2")?;
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
