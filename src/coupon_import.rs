use crate::category::{self, CategoryRepository, COUPON_TAXONOMY};
use crate::coupon::{Coupon, CouponFields, CouponRepository};
use crate::import_run::{self, PageOutcome, RunMethod};
use crate::listing::ListingRepository;
use crate::media::{self, MediaItem, MediaRepository};
use crate::options::OptionStore;
use crate::reconcile;
use crate::run_log::{self, RunLog};
use crate::settings;
use crate::sv_api::{CouponRecord, SvApi};
use crate::{EntityKind, EntityStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use time::macros::format_description;
use time::OffsetDateTime;

pub const COUPONS_PAGE_SIZE: usize = 50;

/// The coupons endpoint reports no total, so the walk stops on the first
/// empty page. The page cap bounds it if the API keeps echoing the last
/// page instead of an empty one.
const MAX_PAGES: usize = 10;

const FALLBACK_TAG: &str = "Other";

#[derive(Debug, Serialize)]
pub struct CouponRunReport {
    pub pages: usize,
    pub processed: usize,
    #[serde(rename = "added_count")]
    pub added: usize,
    pub updated: usize,
    pub errors: usize,
    pub trashed: usize,
    pub failed: bool,
    #[serde(rename = "logData")]
    pub log_data: String,
}

pub struct CouponImporter {
    api: Arc<dyn SvApi>,
    coupons: Arc<dyn CouponRepository>,
    listings: Arc<dyn ListingRepository>,
    categories: Arc<dyn CategoryRepository>,
    media: Arc<dyn MediaRepository>,
    options: Arc<dyn OptionStore>,
    client: reqwest::Client,
}

impl CouponImporter {
    pub fn new(
        api: Arc<dyn SvApi>,
        coupons: Arc<dyn CouponRepository>,
        listings: Arc<dyn ListingRepository>,
        categories: Arc<dyn CategoryRepository>,
        media: Arc<dyn MediaRepository>,
        options: Arc<dyn OptionStore>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api,
            coupons,
            listings,
            categories,
            media,
            options,
            client,
        }
    }

    /// Coupons are few enough to walk in one invocation rather than
    /// step-by-step.
    pub async fn run(&self, method: RunMethod) -> anyhow::Result<CouponRunReport> {
        let cfg = settings::load(&*self.options).await?;
        anyhow::ensure!(
            cfg.check_listings_settings(),
            "Listings API credentials are not configured"
        );
        let log = RunLog::open(Path::new(&cfg.log_dir), EntityKind::Coupons)?;
        let mut state = import_run::load(&*self.options, EntityKind::Coupons).await?;
        state.reset(method);
        state.last_run = Some(import_run::now_timestamp());
        log.add_line(&format!("Coupon import started ({method})"))?;

        let today = today_stamp();
        let mut pages = 0;
        let mut trashed = 0;
        let mut lines = Vec::new();
        let mut page = 1;
        loop {
            let batch = match self.api.get_coupons(COUPONS_PAGE_SIZE, page).await {
                Ok(batch) => batch,
                Err(err) => {
                    state.mark_failed(err.to_string());
                    log.add_page_failure(page, &err.to_string())?;
                    lines.push(format!("Page {page} failed -- {err}"));
                    break;
                }
            };
            if batch.is_empty() {
                break;
            }
            pages += 1;
            let known = self.coupons.existing_ids().await?;
            let (outcome, page_trashed) = self
                .process_coupons(&batch, &known, &cfg, &today)
                .await;
            trashed += page_trashed;
            log.add_statuses(state.processed, &outcome.statuses)?;
            for s in &outcome.statuses {
                lines.push(format!(
                    "{} {} -- {}",
                    s.key,
                    s.label.to_uppercase(),
                    s.message
                ));
            }
            state.absorb(&outcome);
            if page >= MAX_PAGES {
                log::warn!("Coupon walk stopped at the {MAX_PAGES}-page cap");
                break;
            }
            page += 1;
        }

        state.results_count = state.processed;
        state.num_calls = pages;
        if !state.failed {
            reconcile::sweep(&*self.coupons, &state.processed_ids).await?;
        }
        import_run::save(&*self.options, EntityKind::Coupons, &state).await?;
        run_log::clear_old_logs(Path::new(&cfg.log_dir))?;
        Ok(CouponRunReport {
            pages,
            processed: state.processed,
            added: state.added,
            updated: state.updated,
            errors: state.errors,
            trashed,
            failed: state.failed,
            log_data: lines.join("\n"),
        })
    }

    pub async fn run_cron(&self) -> anyhow::Result<()> {
        self.run(RunMethod::Cron).await?;
        Ok(())
    }

    /// Returns the page outcome plus how many known coupons were trashed
    /// for having expired.
    async fn process_coupons(
        &self,
        records: &[CouponRecord],
        known: &HashMap<u64, i64>,
        cfg: &settings::ApiSettings,
        today: &str,
    ) -> (PageOutcome, usize) {
        let mut outcome = PageOutcome::default();
        let mut trashed = 0;
        for record in records {
            outcome.processed += 1;
            let expired = is_expired(&record.redeem_end, today);
            if let Some(&local_id) = known.get(&record.coupon_id) {
                if expired {
                    match self.coupons.trash(local_id).await {
                        Ok(()) => {
                            trashed += 1;
                            outcome.push_updated(
                                local_id,
                                format!("{} coupon expired, trashed", record.offer_title.trim()),
                            );
                        }
                        Err(err) => outcome.push_failed(local_id.to_string(), err.to_string()),
                    }
                    continue;
                }
                match self.update_coupon(record, local_id, cfg).await {
                    Ok(message) => outcome.push_updated(local_id, message),
                    Err(message) => outcome.push_failed(local_id.to_string(), message),
                }
            } else {
                if expired || record.offer_title.trim().is_empty() {
                    continue;
                }
                match self.create_coupon(record, cfg).await {
                    Ok((local_id, message)) => outcome.push_created(local_id, message),
                    Err(message) => {
                        outcome.push_failed(record.coupon_id.to_string(), message)
                    }
                }
            }
        }
        (outcome, trashed)
    }

    async fn create_coupon(
        &self,
        record: &CouponRecord,
        cfg: &settings::ApiSettings,
    ) -> Result<(i64, String), String> {
        let title = record.offer_title.trim().to_string();
        let fields = self.grab_coupon_fields(record).await;
        let local_id = self
            .coupons
            .insert(Coupon {
                id: 0,
                coupon_id: record.coupon_id,
                title: title.clone(),
                status: EntityStatus::Publish,
                fields,
            })
            .await
            .map_err(|err| err.to_string())?;
        self.apply_tag(local_id, record)
            .await
            .map_err(|err| err.to_string())?;
        self.apply_image(local_id, record, Path::new(&cfg.media_dir))
            .await;
        Ok((local_id, format!("{title} coupon created")))
    }

    async fn update_coupon(
        &self,
        record: &CouponRecord,
        local_id: i64,
        cfg: &settings::ApiSettings,
    ) -> Result<String, String> {
        let mut current = self
            .coupons
            .get(local_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("No local coupon with ID {local_id}"))?;
        if current.coupon_id != record.coupon_id {
            return Err(
                "Post ID and SVID do not match. There may be duplicate coupons.".to_string(),
            );
        }
        let fresh = self.grab_coupon_fields(record).await;
        let title = record.offer_title.trim();
        if cfg.overwrite_title && !title.is_empty() {
            current.title = title.to_string();
        }
        if cfg.overwrite_text {
            current.fields.offer_text = fresh.offer_text;
        }
        if cfg.overwrite_link {
            current.fields.offer_link = fresh.offer_link;
        }
        current.fields.address = fresh.address;
        current.fields.city = fresh.city;
        current.fields.zip = fresh.zip;
        current.fields.redeem_start = fresh.redeem_start;
        current.fields.redeem_end = fresh.redeem_end;
        current.fields.related_listing = fresh.related_listing;
        current.status = EntityStatus::Publish;
        self.coupons
            .update(&current)
            .await
            .map_err(|err| err.to_string())?;
        if cfg.overwrite_categories {
            self.apply_tag(local_id, record)
                .await
                .map_err(|err| err.to_string())?;
        }
        if cfg.overwrite_images {
            self.apply_image(local_id, record, Path::new(&cfg.media_dir))
                .await;
        }
        Ok(format!("{} coupon updated", current.title))
    }

    async fn grab_coupon_fields(&self, record: &CouponRecord) -> CouponFields {
        let related_listing = if record.listing_id == 0 {
            None
        } else {
            match self.listings.find_by_listing_id(record.listing_id).await {
                Ok(found) => found.map(|l| l.id),
                Err(err) => {
                    log::warn!(
                        "Related listing lookup for coupon {} failed: {err}",
                        record.coupon_id
                    );
                    None
                }
            }
        };
        CouponFields {
            offer_text: record.offer_text.trim().to_string(),
            offer_link: pick_link(&record.offer_link, &record.web_url),
            address: record.addr1.trim().to_string(),
            city: record.city.trim().to_string(),
            zip: record.zip.trim().to_string(),
            redeem_start: reform_redeem_date(&record.redeem_start),
            redeem_end: reform_redeem_date(&record.redeem_end),
            related_listing,
        }
    }

    async fn apply_tag(&self, local_id: i64, record: &CouponRecord) -> anyhow::Result<()> {
        let name = record.cat_name.trim();
        let name = if name.is_empty() { FALLBACK_TAG } else { name };
        let tag = category::ensure_category(&*self.categories, COUPON_TAXONOMY, name, None, None)
            .await?;
        self.categories
            .assign(EntityKind::Coupons, local_id, &[tag])
            .await
    }

    async fn apply_image(&self, local_id: i64, record: &CouponRecord, media_dir: &Path) {
        let Some(url) = record.image_url() else {
            return;
        };
        let key = record.media_id.to_string();
        match self.media.find(EntityKind::Coupons, local_id, &key).await {
            Ok(Some(_)) => return,
            Ok(None) => {}
            Err(err) => {
                log::warn!("Media lookup failed for coupon {local_id}: {err}");
                return;
            }
        }
        match media::sideload_image(&self.client, media_dir, &url, &key).await {
            Ok(path) => {
                if let Err(err) = self
                    .media
                    .insert(MediaItem {
                        id: 0,
                        entity_kind: EntityKind::Coupons,
                        entity_id: local_id,
                        source_key: key.clone(),
                        file_path: path.display().to_string(),
                        high_res_path: None,
                        title: record.offer_title.trim().to_string(),
                        description: String::new(),
                        is_thumbnail: true,
                    })
                    .await
                {
                    log::warn!("Unable to record image {key} for coupon {local_id}: {err}");
                }
            }
            Err(err) => log::warn!("Image {key} for coupon {local_id} failed: {err}"),
        }
    }
}

fn pick_link(offer_link: &str, web_url: &str) -> String {
    let offer_link = offer_link.trim();
    if offer_link.is_empty() {
        web_url.trim().to_string()
    } else {
        offer_link.to_string()
    }
}

/// MM-DD-YYYY (or MM/DD/YYYY) → YYYYMMDD; anything unparseable passes
/// through stripped of separators so it still sorts roughly right.
pub fn reform_redeem_date(raw: &str) -> String {
    let raw = raw.trim();
    if raw.is_empty() {
        return String::new();
    }
    let parts: Vec<&str> = raw.split(['-', '/']).collect();
    if parts.len() == 3 && parts[2].len() == 4 {
        format!("{}{:0>2}{:0>2}", parts[2], parts[0], parts[1])
    } else {
        raw.chars().filter(|c| c.is_ascii_digit()).collect()
    }
}

/// A coupon with no end date never expires.
fn is_expired(redeem_end: &str, today: &str) -> bool {
    let end = reform_redeem_date(redeem_end);
    !end.is_empty() && end.as_str() < today
}

fn today_stamp() -> String {
    let fmt = format_description!("[year][month][day]");
    let today = OffsetDateTime::now_utc().date();
    today.format(&fmt).unwrap_or_else(|_| today.to_string())
}
