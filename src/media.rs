use crate::EntityKind;
use async_trait::async_trait;
use derive_more::{Display, Error};
use lazy_regex::regex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio_rusqlite::Connection;

/// One sideloaded image. `source_key` is the vendor media ID (or the bare
/// file name for the events feed, which has none); it is the dedupe key.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct MediaItem {
    pub id: i64,
    pub entity_kind: EntityKind,
    pub entity_id: i64,
    pub source_key: String,
    pub file_path: String,
    pub high_res_path: Option<String>,
    pub title: String,
    pub description: String,
    pub is_thumbnail: bool,
}

#[async_trait]
pub trait MediaRepository: Send + Sync {
    async fn find(
        &self,
        kind: EntityKind,
        entity_id: i64,
        source_key: &str,
    ) -> Result<Option<MediaItem>, anyhow::Error>;
    async fn insert(&self, item: MediaItem) -> Result<i64, anyhow::Error>;
    async fn list_for_entity(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Vec<MediaItem>, anyhow::Error>;
}

pub struct SqliteMediaRepository {
    conn: Connection,
}

impl SqliteMediaRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS media (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    entity_kind TEXT NOT NULL,
                    entity_id INTEGER NOT NULL,
                    source_key TEXT NOT NULL,
                    file_path TEXT NOT NULL,
                    high_res_path TEXT,
                    title TEXT NOT NULL DEFAULT '',
                    description TEXT NOT NULL DEFAULT '',
                    is_thumbnail INTEGER NOT NULL DEFAULT 0,
                    UNIQUE (entity_kind, entity_id, source_key)
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_media(row: &rusqlite::Row<'_>) -> Result<MediaItem, rusqlite::Error> {
    let kind: String = row.get(1)?;
    let kind = match kind.as_str() {
        "events" => EntityKind::Events,
        "coupons" => EntityKind::Coupons,
        _ => EntityKind::Listings,
    };
    Ok(MediaItem {
        id: row.get(0)?,
        entity_kind: kind,
        entity_id: row.get(2)?,
        source_key: row.get(3)?,
        file_path: row.get(4)?,
        high_res_path: row.get(5)?,
        title: row.get(6)?,
        description: row.get(7)?,
        is_thumbnail: row.get(8)?,
    })
}

#[async_trait]
impl MediaRepository for SqliteMediaRepository {
    async fn find(
        &self,
        kind: EntityKind,
        entity_id: i64,
        source_key: &str,
    ) -> Result<Option<MediaItem>, anyhow::Error> {
        let source_key = source_key.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, entity_kind, entity_id, source_key, file_path, high_res_path,
                            title, description, is_thumbnail
                     FROM media WHERE entity_kind = ?1 AND entity_id = ?2 AND source_key = ?3",
                )?;
                let m = stmt
                    .query_map(params![kind.as_str(), entity_id, source_key], row_to_media)?
                    .next()
                    .transpose()?;
                Ok(m)
            })
            .await?)
    }

    async fn insert(&self, item: MediaItem) -> Result<i64, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT OR IGNORE INTO media
                     (entity_kind, entity_id, source_key, file_path, high_res_path,
                      title, description, is_thumbnail)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        item.entity_kind.as_str(),
                        item.entity_id,
                        item.source_key,
                        item.file_path,
                        item.high_res_path,
                        item.title,
                        item.description,
                        item.is_thumbnail
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    async fn list_for_entity(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Vec<MediaItem>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, entity_kind, entity_id, source_key, file_path, high_res_path,
                            title, description, is_thumbnail
                     FROM media WHERE entity_kind = ?1 AND entity_id = ?2 ORDER BY id",
                )?;
                let items = stmt
                    .query_map(params![kind.as_str(), entity_id], row_to_media)?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(items)
            })
            .await?)
    }
}

#[derive(Debug, Display, Error)]
pub enum SideloadError {
    #[display("HTTP {_0} while downloading image")]
    #[error(ignore)]
    Http(u16),
    #[display("No usable image file name in {_0}")]
    #[error(ignore)]
    BadFileName(String),
    Network(reqwest::Error),
    Io(std::io::Error),
}

impl From<reqwest::Error> for SideloadError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err)
    }
}

impl From<std::io::Error> for SideloadError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Image file name from a vendor URL. CDN links carry resize parameters
/// after a query string, so the match stops at the extension.
pub fn image_file_name(url: &str) -> Option<String> {
    let re = regex!(r"(?i)([^/?&=]+\.(?:jpe?g|gif|png|webp))");
    re.captures(url)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

/// Distinct vendor images can share a URL basename (resized CDN paths
/// often end in the same file name), so the stored name carries the
/// dedupe key as a prefix unless the key already is the file name.
fn stored_file_name(source_key: &str, file_name: &str) -> String {
    if source_key.is_empty() || source_key.eq_ignore_ascii_case(file_name) {
        file_name.to_string()
    } else {
        format!("{source_key}_{file_name}")
    }
}

pub async fn sideload_image(
    client: &reqwest::Client,
    media_dir: &Path,
    url: &str,
    source_key: &str,
) -> Result<PathBuf, SideloadError> {
    let file_name =
        image_file_name(url).ok_or_else(|| SideloadError::BadFileName(url.to_string()))?;
    tokio::fs::create_dir_all(media_dir).await?;
    let target = media_dir.join(stored_file_name(source_key, &file_name));
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(SideloadError::Http(status.as_u16()));
    }
    let bytes = resp.bytes().await?;
    tokio::fs::write(&target, &bytes).await?;
    Ok(target)
}

#[cfg(test)]
mod tests {

    use super::*;

    #[test]
    fn extracts_file_names_from_cdn_urls() {
        assert_eq!(
            Some("heron.jpg".to_string()),
            image_file_name("https://img.example.com/500/heron.jpg")
        );
        assert_eq!(
            Some("heron.jpg".to_string()),
            image_file_name("https://cdn.example.com/resize?src=heron.jpg&w=500")
        );
        assert_eq!(
            Some("photo.png".to_string()),
            image_file_name("https://img.example.com/PHOTO.PNG?v=3")
        );
        assert_eq!(None, image_file_name("https://img.example.com/document.pdf"));
    }

    #[test]
    fn shared_basenames_land_on_distinct_files() {
        // Two vendor images whose CDN paths end in the same file name must
        // not clobber each other in the shared media directory.
        let a = stored_file_name("5001", "heron.jpg");
        let b = stored_file_name("6002", "heron.jpg");
        assert_ne!(a, b);
        assert_eq!("5001_heron.jpg", a);
        // The events feed keys by file name; no double prefix there.
        assert_eq!("heron.jpg", stored_file_name("heron.jpg", "heron.jpg"));
        assert_eq!("heron.jpg", stored_file_name("", "heron.jpg"));
    }

    #[tokio::test]
    async fn dedupe_key_is_per_entity() {
        let conn = Connection::open_in_memory().await.expect("conn");
        let repo = SqliteMediaRepository::init(conn).await.expect("table");
        repo.insert(MediaItem {
            entity_kind: EntityKind::Listings,
            entity_id: 10,
            source_key: "5001".to_string(),
            file_path: "storage/media/heron.jpg".to_string(),
            ..MediaItem::default()
        })
        .await
        .expect("insert");
        assert!(repo
            .find(EntityKind::Listings, 10, "5001")
            .await
            .expect("find")
            .is_some());
        // Same vendor media ID on another listing is not a duplicate.
        assert!(repo
            .find(EntityKind::Listings, 11, "5001")
            .await
            .expect("find")
            .is_none());
    }
}
