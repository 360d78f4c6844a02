use crate::EntityKind;
use async_trait::async_trait;
use lazy_regex::regex;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use tokio_rusqlite::Connection;

pub const LISTINGS_TAXONOMY: &str = "listings-category";
pub const EVENTS_TAXONOMY: &str = "events-category";
pub const COUPON_TAXONOMY: &str = "coupon-tags";

/// Hierarchical classification node. `external_id` carries the vendor's
/// category ID when the vendor supplied one.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Category {
    pub id: i64,
    pub taxonomy: String,
    pub name: String,
    pub slug: String,
    pub external_id: Option<u64>,
    pub parent_id: Option<i64>,
}

#[async_trait]
pub trait CategoryRepository: Send + Sync {
    async fn find_by_slug(
        &self,
        taxonomy: &str,
        slug: &str,
    ) -> Result<Option<Category>, anyhow::Error>;
    async fn insert(&self, category: Category) -> Result<i64, anyhow::Error>;
    /// Attach terms to an entity without detaching what is already there.
    async fn assign(
        &self,
        kind: EntityKind,
        entity_id: i64,
        category_ids: &[i64],
    ) -> Result<(), anyhow::Error>;
    async fn assigned(&self, kind: EntityKind, entity_id: i64)
        -> Result<Vec<i64>, anyhow::Error>;
}

pub struct SqliteCategoryRepository {
    conn: Connection,
}

impl SqliteCategoryRepository {
    pub async fn init(conn: Connection) -> Result<Self, tokio_rusqlite::Error> {
        conn.call(|conn| {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS category (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    taxonomy TEXT NOT NULL,
                    name TEXT NOT NULL,
                    slug TEXT NOT NULL,
                    external_id INTEGER,
                    parent_id INTEGER,
                    UNIQUE (taxonomy, slug)
                )",
                [],
            )?;
            conn.execute(
                "CREATE TABLE IF NOT EXISTS entity_category (
                    entity_kind TEXT NOT NULL,
                    entity_id INTEGER NOT NULL,
                    category_id INTEGER NOT NULL,
                    UNIQUE (entity_kind, entity_id, category_id)
                )",
                [],
            )?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }
}

fn row_to_category(row: &rusqlite::Row<'_>) -> Result<Category, rusqlite::Error> {
    Ok(Category {
        id: row.get(0)?,
        taxonomy: row.get(1)?,
        name: row.get(2)?,
        slug: row.get(3)?,
        external_id: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        parent_id: row.get(5)?,
    })
}

#[async_trait]
impl CategoryRepository for SqliteCategoryRepository {
    async fn find_by_slug(
        &self,
        taxonomy: &str,
        slug: &str,
    ) -> Result<Option<Category>, anyhow::Error> {
        let taxonomy = taxonomy.to_string();
        let slug = slug.to_string();
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, taxonomy, name, slug, external_id, parent_id FROM category
                     WHERE taxonomy = ?1 AND slug = ?2",
                )?;
                let c = stmt
                    .query_map([taxonomy, slug], row_to_category)?
                    .next()
                    .transpose()?;
                Ok(c)
            })
            .await?)
    }

    async fn insert(&self, category: Category) -> Result<i64, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO category (taxonomy, name, slug, external_id, parent_id)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        category.taxonomy,
                        category.name,
                        category.slug,
                        category.external_id.map(|v| v as i64),
                        category.parent_id
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await?)
    }

    async fn assign(
        &self,
        kind: EntityKind,
        entity_id: i64,
        category_ids: &[i64],
    ) -> Result<(), anyhow::Error> {
        let category_ids = category_ids.to_vec();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "INSERT OR IGNORE INTO entity_category (entity_kind, entity_id, category_id)
                     VALUES (?1, ?2, ?3)",
                )?;
                for category_id in &category_ids {
                    stmt.execute(params![kind.as_str(), entity_id, category_id])?;
                }
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn assigned(
        &self,
        kind: EntityKind,
        entity_id: i64,
    ) -> Result<Vec<i64>, anyhow::Error> {
        Ok(self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT category_id FROM entity_category
                     WHERE entity_kind = ?1 AND entity_id = ?2 ORDER BY category_id",
                )?;
                let ids = stmt
                    .query_map(params![kind.as_str(), entity_id], |row| row.get(0))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(ids)
            })
            .await?)
    }
}

pub fn reform_category_slug(name: &str) -> String {
    let re = regex!(r"[^a-z0-9]+");
    re.replace_all(&name.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// Look up by slug, create on first sight. Mirrors term upsertion keyed by
/// the vendor category ID.
pub async fn ensure_category(
    repo: &dyn CategoryRepository,
    taxonomy: &str,
    name: &str,
    external_id: Option<u64>,
    parent_id: Option<i64>,
) -> Result<i64, anyhow::Error> {
    let slug = reform_category_slug(name);
    if let Some(existing) = repo.find_by_slug(taxonomy, &slug).await? {
        return Ok(existing.id);
    }
    repo.insert(Category {
        id: 0,
        taxonomy: taxonomy.to_string(),
        name: name.trim().to_string(),
        slug,
        external_id,
        parent_id,
    })
    .await
}

/// Upsert a parent/child pair. A child whose name matches its intended
/// parent is a known vendor data quirk and is skipped.
pub async fn ensure_pair(
    repo: &dyn CategoryRepository,
    taxonomy: &str,
    cat_name: &str,
    subcat_name: &str,
    subcat_external_id: Option<u64>,
) -> Result<Vec<i64>, anyhow::Error> {
    let mut ids = Vec::new();
    let cat_name = cat_name.trim();
    let subcat_name = subcat_name.trim();
    if cat_name.is_empty() {
        return Ok(ids);
    }
    let parent = ensure_category(repo, taxonomy, cat_name, None, None).await?;
    ids.push(parent);
    if !subcat_name.is_empty() && !subcat_name.eq_ignore_ascii_case(cat_name) {
        let child =
            ensure_category(repo, taxonomy, subcat_name, subcat_external_id, Some(parent)).await?;
        ids.push(child);
    }
    Ok(ids)
}
