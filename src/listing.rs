use crate::reconcile::StatusSweep;
use crate::EntityStatus;
use async_trait::async_trait;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use tokio_rusqlite::Connection;

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PremiumFields {
    #[serde(default)]
    pub hours_text: String,
    #[serde(default)]
    pub ticket_information: String,
    #[serde(default)]
    pub tickets_link: String,
    #[serde(default)]
    pub admissions_block: String,
    #[serde(default)]
    pub whats_it_like_block: String,
    #[serde(default)]
    pub dont_miss_block: String,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ListingFields {
    #[serde(default)]
    pub sort_company: String,
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub map_coordinates: String,
    #[serde(default)]
    pub phone: String,
    #[serde(default)]
    pub alternate_phone: String,
    #[serde(default)]
    pub toll_free: String,
    #[serde(default)]
    pub fax: String,
    #[serde(default)]
    pub contact: String,
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub hours: String,
    #[serde(default)]
    pub rank: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub search_keywords: String,
    #[serde(default)]
    pub ticket_link: String,
    #[serde(default)]
    pub type_of_member: String,
    #[serde(default)]
    pub wct_id: String,
    #[serde(default)]
    pub website: String,
    #[serde(default)]
    pub description: String,
    /// (service, url) pairs as the vendor sends them.
    #[serde(default)]
    pub social_media: Vec<(String, String)>,
    #[serde(default)]
    pub premium: Option<PremiumFields>,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Listing {
    pub id: i64,
    pub listing_id: u64,
    pub title: String,
    pub status: EntityStatus,
    pub fields: ListingFields,
}

#[async_trait]
pub trait ListingRepository: StatusSweep {
    async fn get(&self, id: i64) -> Result<Option<Listing>, anyhow::Error>;
    async fn find_by_listing_id(&self, listing_id: u64)
        -> Result<Option<Listing>, anyhow::Error>;
    /// External ID → local ID for every listing, trash included: a trashed
    /// row still blocks re-creation under the same external ID.
    async fn existing_ids(&self) -> Result<HashMap<u64, i64>, anyhow::Error>;
    async fn existing_companies(&self) -> Result<HashSet<String>, anyhow::Error>;
    async fn insert(&self, listing: Listing) -> Result<i64, anyhow::Error>;
    async fn update(&self, listing: &Listing) -> Result<(), anyhow::Error>;
}

pub struct SqliteListingRepository {
    conn: Connection,
}

impl SqliteListingRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS listing (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    listing_id INTEGER NOT NULL,
                    title TEXT NOT NULL,
                    status TEXT NOT NULL,
                    fields TEXT NOT NULL
                )",
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_listing_external ON listing (listing_id)",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_listing(row: &rusqlite::Row<'_>) -> Result<Listing, rusqlite::Error> {
    let status: String = row.get(3)?;
    let fields: String = row.get(4)?;
    let fields = serde_json::from_str(&fields).map_err(|err| {
        rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, err.into())
    })?;
    Ok(Listing {
        id: row.get(0)?,
        listing_id: row.get::<_, i64>(1)? as u64,
        title: row.get(2)?,
        status: EntityStatus::parse(&status).unwrap_or_default(),
        fields,
    })
}

#[async_trait]
impl ListingRepository for SqliteListingRepository {
    async fn get(&self, id: i64) -> Result<Option<Listing>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, listing_id, title, status, fields FROM listing WHERE id = ?1",
                )?;
                let l = stmt.query_map([id], row_to_listing)?.next().transpose()?;
                Ok(l)
            })
            .await?)
    }

    async fn find_by_listing_id(
        &self,
        listing_id: u64,
    ) -> Result<Option<Listing>, anyhow::Error> {
        let listing_id = listing_id as i64;
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, listing_id, title, status, fields FROM listing
                     WHERE listing_id = ?1 ORDER BY id LIMIT 1",
                )?;
                let l = stmt
                    .query_map([listing_id], row_to_listing)?
                    .next()
                    .transpose()?;
                Ok(l)
            })
            .await?)
    }

    async fn existing_ids(&self) -> Result<HashMap<u64, i64>, anyhow::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT listing_id, id FROM listing")?;
                let pairs = stmt
                    .query_map([], |row| {
                        Ok((row.get::<_, i64>(0)? as u64, row.get::<_, i64>(1)?))
                    })?
                    .collect::<Result<HashMap<_, _>, _>>()?;
                Ok(pairs)
            })
            .await?)
    }

    async fn existing_companies(&self) -> Result<HashSet<String>, anyhow::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT title FROM listing")?;
                let titles = stmt
                    .query_map([], |row| row.get::<_, String>(0))?
                    .collect::<Result<HashSet<_>, _>>()?;
                Ok(titles)
            })
            .await?)
    }

    async fn insert(&self, listing: Listing) -> Result<i64, anyhow::Error> {
        let fields = serde_json::to_string(&listing.fields)?;
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO listing (listing_id, title, status, fields)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![
                        listing.listing_id as i64,
                        listing.title,
                        listing.status.as_str(),
                        fields
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    async fn update(&self, listing: &Listing) -> Result<(), anyhow::Error> {
        let fields = serde_json::to_string(&listing.fields)?;
        let listing = listing.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE listing SET listing_id = ?2, title = ?3, status = ?4, fields = ?5
                     WHERE id = ?1",
                    params![
                        listing.id,
                        listing.listing_id as i64,
                        listing.title,
                        listing.status.as_str(),
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
impl StatusSweep for SqliteListingRepository {
    async fn sweep_universe(&self) -> Result<Vec<i64>, anyhow::Error> {
        Ok(self
            .conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT id FROM listing WHERE status != 'trash' ORDER BY id")?;
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
                    let mut stmt = tx.prepare("UPDATE listing SET status = ?1 WHERE id = ?2")?;
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
    use crate::reconcile;

    async fn repo() -> SqliteListingRepository {
        let conn = Connection::open_in_memory().await.expect("conn");
        SqliteListingRepository::init(conn).await.expect("table")
    }

    fn listing(external: u64, title: &str) -> Listing {
        Listing {
            id: 0,
            listing_id: external,
            title: title.to_string(),
            status: EntityStatus::Publish,
            fields: ListingFields::default(),
        }
    }

    #[tokio::test]
    async fn insert_and_lookup_by_external_id() {
        let repo = repo().await;
        let id = repo
            .insert(listing(101, "Blue Heron Tours"))
            .await
            .expect("insert");
        let found = repo
            .find_by_listing_id(101)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(id, found.id);
        assert_eq!("Blue Heron Tours", found.title);
        assert!(repo.find_by_listing_id(999).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn existing_sets_cover_all_rows() {
        let repo = repo().await;
        repo.insert(listing(101, "Blue Heron Tours")).await.expect("insert");
        repo.insert(listing(102, "Harbor Grill")).await.expect("insert");
        let ids = repo.existing_ids().await.expect("ids");
        assert_eq!(2, ids.len());
        assert!(ids.contains_key(&101));
        let companies = repo.existing_companies().await.expect("companies");
        assert!(companies.contains("Harbor Grill"));
    }

    #[tokio::test]
    async fn sweep_flips_unseen_rows_to_draft() {
        let repo = repo().await;
        let a = repo.insert(listing(1, "A")).await.expect("insert");
        let b = repo.insert(listing(2, "B")).await.expect("insert");
        let c = repo.insert(listing(3, "C")).await.expect("insert");
        reconcile::sweep(&repo, &[a, c]).await.expect("sweep");
        let seen = repo.get(a).await.expect("get").expect("row");
        let unseen = repo.get(b).await.expect("get").expect("row");
        assert_eq!(EntityStatus::Publish, seen.status);
        assert_eq!(EntityStatus::Draft, unseen.status);
        assert_eq!(
            EntityStatus::Publish,
            repo.get(c).await.expect("get").expect("row").status
        );
    }
}
