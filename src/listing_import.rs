use crate::category::{self, CategoryRepository, LISTINGS_TAXONOMY};
use crate::import_run::{self, PageOutcome, PageReport, RunMethod};
use crate::listing::{Listing, ListingFields, ListingRepository, PremiumFields};
use crate::media::{self, MediaItem, MediaRepository};
use crate::options::OptionStore;
use crate::reconcile;
use crate::run_log::{self, RunLog};
use crate::settings;
use crate::sv_api::{AmenityInfo, ImageItem, ListingRecord, ListingSummary, SvApi};
use crate::{EntityKind, EntityStatus};
use itertools::Itertools;
use lazy_regex::regex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

pub const PAGE_SIZE: usize = 10;

const MISMATCH_MESSAGE: &str =
    "Post ID and SVID do not match. There may be duplicate listings.";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdType {
    Sv,
    Wp,
}

#[derive(Debug, Serialize)]
pub struct SingleImportReport {
    #[serde(rename = "postFound")]
    pub post_found: bool,
    pub pid: i64,
    pub svid: u64,
    pub link: String,
    pub status: String,
    #[serde(rename = "returnMessage")]
    pub return_message: String,
    #[serde(rename = "createNew")]
    pub create_new: bool,
}

pub struct ListingImporter {
    api: Arc<dyn SvApi>,
    listings: Arc<dyn ListingRepository>,
    categories: Arc<dyn CategoryRepository>,
    media: Arc<dyn MediaRepository>,
    options: Arc<dyn OptionStore>,
    client: reqwest::Client,
}

impl ListingImporter {
    pub fn new(
        api: Arc<dyn SvApi>,
        listings: Arc<dyn ListingRepository>,
        categories: Arc<dyn CategoryRepository>,
        media: Arc<dyn MediaRepository>,
        options: Arc<dyn OptionStore>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api,
            listings,
            categories,
            media,
            options,
            client,
        }
    }

    /// One step of the resumable import. Page 0 resets the run and asks the
    /// API for a fresh total; pages 1..=num_calls each fetch and process one
    /// batch. All cross-call state lives in the option store.
    pub async fn run_page(&self, page: usize, method: RunMethod) -> anyhow::Result<PageReport> {
        let cfg = settings::load(&*self.options).await?;
        anyhow::ensure!(
            cfg.check_listings_settings(),
            "Listings API credentials are not configured"
        );
        let log = RunLog::open(Path::new(&cfg.log_dir), EntityKind::Listings)?;
        let mut state = import_run::load(&*self.options, EntityKind::Listings).await?;

        if page == 0 {
            state.reset(method);
            state.last_run = Some(import_run::now_timestamp());
            match self.api.get_listings(1, 1).await {
                Ok(count) => {
                    state.results_count = count.results_count;
                    state.num_calls = import_run::num_calls(count.results_count, PAGE_SIZE);
                    log.add_line(&format!(
                        "Import started ({method}): {} records over {} pages",
                        state.results_count, state.num_calls
                    ))?;
                }
                Err(err) => {
                    state.mark_failed(err.to_string());
                    log.add_page_failure(0, &err.to_string())?;
                }
            }
            import_run::save(&*self.options, EntityKind::Listings, &state).await?;
            return Ok(PageReport {
                page: 0,
                num_calls: state.num_calls,
                api_pagesize: PAGE_SIZE,
                has_more: !state.failed && state.num_calls > 0,
                log_data: String::new(),
                results_count: state.results_count,
                added_count: 0,
                failed: state.failed,
                percent: import_run::progress_percent(0, state.num_calls),
            });
        }

        let log_data = match self.api.get_listings(PAGE_SIZE, page).await {
            Err(err) => {
                state.mark_failed(err.to_string());
                log.add_page_failure(page, &err.to_string())?;
                format!("Page {page} failed -- {err}")
            }
            Ok(batch) => {
                let known = self.listings.existing_ids().await?;
                let companies = self.listings.existing_companies().await?;
                let outcome = self
                    .process_listings(
                        &batch.listings,
                        &known,
                        &companies,
                        Path::new(&cfg.media_dir),
                    )
                    .await;
                log.add_statuses(state.processed, &outcome.statuses)?;
                let lines = outcome
                    .statuses
                    .iter()
                    .map(|s| format!("{} {} -- {}", s.key, s.label.to_uppercase(), s.message))
                    .join("\n");
                state.absorb(&outcome);
                lines
            }
        };

        let has_more = page < state.num_calls;
        if !has_more {
            reconcile::sweep(&*self.listings, &state.processed_ids).await?;
            run_log::clear_old_logs(Path::new(&cfg.log_dir))?;
        }
        import_run::save(&*self.options, EntityKind::Listings, &state).await?;
        Ok(PageReport {
            page,
            num_calls: state.num_calls,
            api_pagesize: PAGE_SIZE,
            has_more,
            log_data,
            results_count: state.results_count,
            added_count: state.added,
            failed: state.failed,
            percent: import_run::progress_percent(page, state.num_calls),
        })
    }

    /// Synchronous embodiment for the scheduler: loops over every page in
    /// one invocation. The guard rail bounds the loop if the declared total
    /// changes underneath a running import.
    pub async fn run_cron(&self) -> anyhow::Result<()> {
        let report = self.run_page(0, RunMethod::Cron).await?;
        if report.failed || report.num_calls == 0 {
            return Ok(());
        }
        let guard_rail = ((report.num_calls as f64) * 1.1).ceil() as usize;
        let mut page = 1;
        loop {
            let state = import_run::load(&*self.options, EntityKind::Listings).await?;
            if page > state.num_calls || page > guard_rail {
                break;
            }
            let report = self.run_page(page, RunMethod::Cron).await?;
            if !report.has_more {
                break;
            }
            page += 1;
        }
        Ok(())
    }

    /// One page's worth of records. Creation needs an unseen external ID,
    /// the literal "Website" type and an unseen, non-empty company name;
    /// updates only need a known ID. Everything else is skipped silently.
    pub async fn process_listings(
        &self,
        records: &[ListingSummary],
        known: &HashMap<u64, i64>,
        companies: &HashSet<String>,
        media_dir: &Path,
    ) -> PageOutcome {
        let mut outcome = PageOutcome::default();
        if records.is_empty() {
            return outcome;
        }
        let amenity_tabs = self.amenity_tabs().await;
        let mut companies = companies.clone();
        for record in records {
            outcome.processed += 1;
            let company = record.company.trim();
            if let Some(&local_id) = known.get(&record.listing_id) {
                // The create gate's type check is not repeated here; the
                // update routine applies its own.
                match self
                    .update_listing(record.listing_id, local_id, &amenity_tabs, media_dir)
                    .await
                {
                    Ok(message) => outcome.push_updated(local_id, message),
                    Err(message) => outcome.push_failed(local_id.to_string(), message),
                }
            } else if record.type_name == "Website"
                && !company.is_empty()
                && !companies.contains(company)
            {
                match self
                    .create_new_listing(record.listing_id, &amenity_tabs, media_dir)
                    .await
                {
                    Ok((local_id, message)) => {
                        companies.insert(company.to_string());
                        outcome.push_created(local_id, message);
                    }
                    Err(message) => {
                        outcome.push_failed(record.listing_id.to_string(), message)
                    }
                }
            }
        }
        outcome
    }

    async fn amenity_tabs(&self) -> HashMap<String, String> {
        match self.api.get_listing_amenities().await {
            Ok(list) => amenity_tab_map(&list),
            Err(err) => {
                log::warn!("Amenity reference unavailable: {err}");
                HashMap::new()
            }
        }
    }

    async fn create_new_listing(
        &self,
        listing_id: u64,
        amenity_tabs: &HashMap<String, String>,
        media_dir: &Path,
    ) -> Result<(i64, String), String> {
        let record = self
            .api
            .get_listing(listing_id)
            .await
            .map_err(|err| err.to_string())?;
        let company = record.company.trim().to_string();
        if company.is_empty() {
            return Err("Company Name Missing. Cannot create listing.".to_string());
        }
        let (title, fields) = grab_fields(&record);
        let local_id = self
            .listings
            .insert(Listing {
                id: 0,
                listing_id,
                title,
                status: EntityStatus::Publish,
                fields,
            })
            .await
            .map_err(|err| err.to_string())?;
        self.apply_taxonomies(local_id, &record, amenity_tabs)
            .await
            .map_err(|err| err.to_string())?;
        self.apply_images(local_id, &record, media_dir).await;
        Ok((local_id, format!("{company} listing created")))
    }

    async fn update_listing(
        &self,
        listing_id: u64,
        local_id: i64,
        amenity_tabs: &HashMap<String, String>,
        media_dir: &Path,
    ) -> Result<String, String> {
        let record = self
            .api
            .get_listing(listing_id)
            .await
            .map_err(|err| err.to_string())?;
        if record.type_name != "Website" {
            return Err(format!(
                "Listing {listing_id} is not a Website listing; not updated"
            ));
        }
        let mut current = self
            .listings
            .get(local_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("No local listing with ID {local_id}"))?;
        if current.listing_id != listing_id {
            return Err(MISMATCH_MESSAGE.to_string());
        }
        let company = record.company.trim().to_string();
        if company.is_empty() {
            return Err("Company Name Missing. Cannot update listing.".to_string());
        }
        let (title, fields) = grab_fields(&record);
        current.title = title;
        current.fields = fields;
        self.listings
            .update(&current)
            .await
            .map_err(|err| err.to_string())?;
        self.apply_taxonomies(local_id, &record, amenity_tabs)
            .await
            .map_err(|err| err.to_string())?;
        self.apply_images(local_id, &record, media_dir).await;
        Ok(format!("{company} listing updated"))
    }

    async fn apply_taxonomies(
        &self,
        local_id: i64,
        record: &ListingRecord,
        amenity_tabs: &HashMap<String, String>,
    ) -> anyhow::Result<()> {
        let mut ids = category::ensure_pair(
            &*self.categories,
            LISTINGS_TAXONOMY,
            &record.cat_name,
            &record.subcat_name,
            None,
        )
        .await?;
        if let Some(extra) = &record.additional_subcats {
            for item in &extra.items {
                ids.extend(
                    category::ensure_pair(
                        &*self.categories,
                        LISTINGS_TAXONOMY,
                        &item.cat_name,
                        &item.subcat_name,
                        Some(item.subcat_id),
                    )
                    .await?,
                );
            }
        }
        if let Some(amenities) = &record.amenities {
            for amenity in &amenities.items {
                if let Some(tab) = amenity_tabs.get(&amenity.name.trim().to_lowercase()) {
                    ids.extend(
                        category::ensure_pair(
                            &*self.categories,
                            LISTINGS_TAXONOMY,
                            tab,
                            &amenity.name,
                            Some(amenity.amenity_id),
                        )
                        .await?,
                    );
                }
            }
        }
        if !ids.is_empty() {
            self.categories
                .assign(EntityKind::Listings, local_id, &ids)
                .await?;
        }
        Ok(())
    }

    /// Standard images (type 1/2), paired with the high-res variant (type 4)
    /// sharing the same vendor media ID. A media ID already recorded for
    /// this listing is skipped entirely. Image failures never fail the
    /// record.
    async fn apply_images(&self, local_id: i64, record: &ListingRecord, media_dir: &Path) {
        let Some(images) = &record.images else {
            return;
        };
        let high_res: HashMap<u64, &ImageItem> = images
            .items
            .iter()
            .filter(|i| i.type_id == 4)
            .map(|i| (i.media_id, i))
            .collect();
        for image in images.items.iter().filter(|i| i.type_id == 1 || i.type_id == 2) {
            let key = image.media_id.to_string();
            match self.media.find(EntityKind::Listings, local_id, &key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Media lookup failed for listing {local_id}: {err}");
                    continue;
                }
            }
            match media::sideload_image(&self.client, media_dir, &image.url(), &key).await {
                Ok(path) => {
                    let high_res_path = match high_res.get(&image.media_id) {
                        Some(high) => media::sideload_image(
                            &self.client,
                            media_dir,
                            &high.url(),
                            &format!("{key}_high"),
                        )
                        .await
                        .map(|p| p.display().to_string())
                        .map_err(|err| {
                            log::warn!("High-res image {key} failed: {err}");
                            err
                        })
                        .ok(),
                        None => None,
                    };
                    if let Err(err) = self
                        .media
                        .insert(MediaItem {
                            id: 0,
                            entity_kind: EntityKind::Listings,
                            entity_id: local_id,
                            source_key: key.clone(),
                            file_path: path.display().to_string(),
                            high_res_path,
                            title: image.media_name.clone(),
                            description: image.media_desc.clone(),
                            is_thumbnail: image.sort_order <= 1,
                        })
                        .await
                    {
                        log::warn!("Unable to record image {key} for listing {local_id}: {err}");
                    }
                }
                Err(err) => log::warn!("Image {key} for listing {local_id} failed: {err}"),
            }
        }
    }

    /// Single-record import, keyed either by the vendor's ID or by the
    /// local one.
    pub async fn run_single(
        &self,
        raw_id: &str,
        id_type: IdType,
    ) -> anyhow::Result<SingleImportReport> {
        let cfg = settings::load(&*self.options).await?;
        anyhow::ensure!(
            cfg.check_listings_settings(),
            "Listings API credentials are not configured"
        );
        let media_dir = cfg.media_dir.clone();
        let not_found = |svid: u64, message: String, create_new: bool| SingleImportReport {
            post_found: false,
            pid: 0,
            svid,
            link: String::new(),
            status: "error".to_string(),
            return_message: message,
            create_new,
        };
        let (svid, local_id) = match id_type {
            IdType::Wp => {
                let Ok(local_id) = raw_id.trim().parse::<i64>() else {
                    return Ok(not_found(0, format!("{raw_id} is not a valid ID"), false));
                };
                match self.listings.get(local_id).await? {
                    Some(listing) => (listing.listing_id, local_id),
                    None => {
                        return Ok(not_found(
                            0,
                            format!("No local listing with ID {local_id}"),
                            false,
                        ))
                    }
                }
            }
            IdType::Sv => {
                let Ok(svid) = raw_id.trim().parse::<u64>() else {
                    return Ok(not_found(0, format!("{raw_id} is not a valid ID"), false));
                };
                match self.listings.find_by_listing_id(svid).await? {
                    Some(listing) => (svid, listing.id),
                    None => {
                        return Ok(not_found(
                            svid,
                            format!("No local listing references SVID {svid}"),
                            true,
                        ))
                    }
                }
            }
        };
        let amenity_tabs = self.amenity_tabs().await;
        match self
            .update_listing(svid, local_id, &amenity_tabs, Path::new(&media_dir))
            .await
        {
            Ok(message) => Ok(SingleImportReport {
                post_found: true,
                pid: local_id,
                svid,
                link: format!("/listings/{local_id}"),
                status: "updated".to_string(),
                return_message: message,
                create_new: false,
            }),
            Err(message) => Ok(SingleImportReport {
                post_found: true,
                pid: local_id,
                svid,
                link: format!("/listings/{local_id}"),
                status: "failed".to_string(),
                return_message: message,
                create_new: false,
            }),
        }
    }

    pub async fn create_from_svid(&self, svid: u64) -> anyhow::Result<SingleImportReport> {
        let cfg = settings::load(&*self.options).await?;
        anyhow::ensure!(
            cfg.check_listings_settings(),
            "Listings API credentials are not configured"
        );
        if let Some(existing) = self.listings.find_by_listing_id(svid).await? {
            return Ok(SingleImportReport {
                post_found: true,
                pid: existing.id,
                svid,
                link: format!("/listings/{}", existing.id),
                status: "error".to_string(),
                return_message: format!("SVID {svid} already has a local listing"),
                create_new: false,
            });
        }
        let amenity_tabs = self.amenity_tabs().await;
        match self
            .create_new_listing(svid, &amenity_tabs, Path::new(&cfg.media_dir))
            .await
        {
            Ok((local_id, message)) => Ok(SingleImportReport {
                post_found: true,
                pid: local_id,
                svid,
                link: format!("/listings/{local_id}"),
                status: "created".to_string(),
                return_message: message,
                create_new: false,
            }),
            Err(message) => Ok(SingleImportReport {
                post_found: false,
                pid: 0,
                svid,
                link: String::new(),
                status: "failed".to_string(),
                return_message: message,
                create_new: false,
            }),
        }
    }

}

fn amenity_tab_map(list: &[AmenityInfo]) -> HashMap<String, String> {
    list.iter()
        .filter(|a| !a.name.trim().is_empty() && !a.tab_name.trim().is_empty())
        .map(|a| (a.name.trim().to_lowercase(), a.tab_name.trim().to_string()))
        .collect()
}

/// Vendor record → local title + field set, 1:1 by name table.
pub fn grab_fields(record: &ListingRecord) -> (String, ListingFields) {
    let title = record.company.trim().to_string();
    let sort_company = if record.sort_company.trim().is_empty() {
        format!("{} Company Name Missing", record.listing_id)
    } else {
        record.sort_company.trim().to_string()
    };
    let mut address_parts: Vec<&str> = [&record.addr1, &record.addr2, &record.addr3]
        .iter()
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    let city = record.city.trim();
    if !city.is_empty() {
        address_parts.push(city);
    }
    let state_zip = format!("{} {}", record.state.trim(), record.zip.trim());
    let state_zip = state_zip.trim().to_string();
    let mut address = address_parts.join(", ");
    if !state_zip.is_empty() {
        if address.is_empty() {
            address = state_zip;
        } else {
            address = format!("{address}, {state_zip}");
        }
    }
    let map_coordinates =
        if record.latitude.trim().is_empty() || record.longitude.trim().is_empty() {
            String::new()
        } else {
            format!("{},{}", record.latitude.trim(), record.longitude.trim())
        };
    let contact = format!(
        "{} {}",
        record.contact_first_name.trim(),
        record.contact_last_name.trim()
    )
    .trim()
    .to_string();
    let social_media = record
        .social_media
        .as_ref()
        .map(|list| {
            list.items
                .iter()
                .filter(|i| !i.value.trim().is_empty())
                .map(|i| (i.service.trim().to_string(), i.value.trim().to_string()))
                .collect()
        })
        .unwrap_or_default();
    let premium = if record.rank.trim().eq_ignore_ascii_case("premium") {
        Some(PremiumFields {
            hours_text: record.hours.trim().to_string(),
            ticket_information: record.ticket_information.trim().to_string(),
            tickets_link: record.tickets_link.trim().to_string(),
            admissions_block: record.admissions_block.trim().to_string(),
            whats_it_like_block: record.whats_it_like_block.trim().to_string(),
            dont_miss_block: record.dont_miss_block.trim().to_string(),
        })
    } else {
        None
    };
    let fields = ListingFields {
        sort_company,
        address,
        map_coordinates,
        phone: record.phone.trim().to_string(),
        alternate_phone: record.alt_phone.trim().to_string(),
        toll_free: record.toll_free.trim().to_string(),
        fax: record.fax.trim().to_string(),
        contact,
        email: record.email.trim().to_string(),
        hours: reform_hours(&record.hours),
        rank: record.rank.trim().to_string(),
        region: record.region.trim().to_string(),
        search_keywords: record.keywords.trim().to_string(),
        ticket_link: record.tickets_link.trim().to_string(),
        type_of_member: record.type_of_member.trim().to_string(),
        wct_id: record.wct_id.trim().to_string(),
        website: record.web_url.trim().to_string(),
        description: record.description.trim().to_string(),
        social_media,
        premium,
    };
    (title, fields)
}

/// The vendor abbreviates weekdays as the digits 1-7 (Sunday first).
pub fn reform_hours(hours: &str) -> String {
    const DAYS: [&str; 7] = [
        "Sunday",
        "Monday",
        "Tuesday",
        "Wednesday",
        "Thursday",
        "Friday",
        "Saturday",
    ];
    let re = regex!(r"\b([1-7])\b");
    re.replace_all(hours.trim(), |caps: &regex::Captures<'_>| {
        let idx: usize = caps[1].parse().unwrap_or(1);
        DAYS[idx - 1].to_string()
    })
    .to_string()
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::category::SqliteCategoryRepository;
    use crate::import_run::ImportRunState;
    use crate::listing::SqliteListingRepository;
    use crate::media::SqliteMediaRepository;
    use crate::options::SqliteOptionStore;
    use crate::settings::ApiSettings;
    use crate::sv_api::{CouponRecord, EventRecord, ListingsPage, SvApiError};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tokio_rusqlite::Connection;

    struct StubApi {
        listings: Vec<ListingSummary>,
        records: HashMap<u64, ListingRecord>,
        page_requests: Mutex<Vec<(usize, usize)>>,
        fail_on_page: Option<usize>,
    }

    impl StubApi {
        fn new(listings: Vec<ListingSummary>, records: Vec<ListingRecord>) -> Self {
            Self {
                listings,
                records: records.into_iter().map(|r| (r.listing_id, r)).collect(),
                page_requests: Mutex::new(Vec::new()),
                fail_on_page: None,
            }
        }

        fn failing_on_page(mut self, page: usize) -> Self {
            self.fail_on_page = Some(page);
            self
        }
    }

    #[async_trait]
    impl SvApi for StubApi {
        async fn get_listings(
            &self,
            page_size: usize,
            page_num: usize,
        ) -> Result<ListingsPage, SvApiError> {
            self.page_requests
                .lock()
                .expect("lock")
                .push((page_size, page_num));
            // The count probe (page size 1) is never the failing call.
            if page_size == PAGE_SIZE && self.fail_on_page == Some(page_num) {
                return Err(SvApiError::Vendor {
                    message: format!("Server overload on page {page_num}"),
                    detail: String::new(),
                });
            }
            let start = (page_num - 1) * page_size;
            let end = (start + page_size).min(self.listings.len());
            let listings = if start >= self.listings.len() {
                Vec::new()
            } else {
                self.listings[start..end].to_vec()
            };
            Ok(ListingsPage {
                results_count: self.listings.len(),
                listings,
            })
        }

        async fn get_listing(&self, listing_id: u64) -> Result<ListingRecord, SvApiError> {
            self.records
                .get(&listing_id)
                .cloned()
                .ok_or_else(|| SvApiError::Vendor {
                    message: format!("Listing {listing_id} missing from API response"),
                    detail: String::new(),
                })
        }

        async fn get_coupons(
            &self,
            _page_size: usize,
            _page_num: usize,
        ) -> Result<Vec<CouponRecord>, SvApiError> {
            Ok(Vec::new())
        }

        async fn get_listing_amenities(&self) -> Result<Vec<AmenityInfo>, SvApiError> {
            Ok(Vec::new())
        }

        async fn get_events(&self) -> Result<Vec<EventRecord>, SvApiError> {
            Ok(Vec::new())
        }
    }

    fn summary(id: u64, company: &str, type_name: &str) -> ListingSummary {
        ListingSummary {
            listing_id: id,
            company: company.to_string(),
            sort_company: company.to_string(),
            type_name: type_name.to_string(),
            last_updated: String::new(),
        }
    }

    fn record(id: u64, company: &str, type_name: &str) -> ListingRecord {
        ListingRecord {
            listing_id: id,
            company: company.to_string(),
            type_name: type_name.to_string(),
            ..ListingRecord::default()
        }
    }

    async fn importer(
        api: Arc<StubApi>,
    ) -> (ListingImporter, Arc<SqliteListingRepository>) {
        let options = Arc::new(
            SqliteOptionStore::init(Connection::open_in_memory().await.expect("conn"))
                .await
                .expect("options"),
        );
        importer_with_options(api, options).await
    }

    async fn importer_with_options(
        api: Arc<StubApi>,
        options: Arc<dyn OptionStore>,
    ) -> (ListingImporter, Arc<SqliteListingRepository>) {
        settings::save(
            &*options,
            &ApiSettings {
                api_url: "https://crm.example.com".to_string(),
                api_username: "user".to_string(),
                api_password: "secret".to_string(),
                log_dir: std::env::temp_dir()
                    .join(format!("sv-sync-test-{}", uuid::Uuid::new_v4()))
                    .display()
                    .to_string(),
                ..ApiSettings::default()
            },
        )
        .await
        .expect("settings");
        let listings = Arc::new(
            SqliteListingRepository::init(Connection::open_in_memory().await.expect("conn"))
                .await
                .expect("listings"),
        );
        let categories = Arc::new(
            SqliteCategoryRepository::init(Connection::open_in_memory().await.expect("conn"))
                .await
                .expect("categories"),
        );
        let media = Arc::new(
            SqliteMediaRepository::init(Connection::open_in_memory().await.expect("conn"))
                .await
                .expect("media"),
        );
        (
            ListingImporter::new(
                api,
                listings.clone(),
                categories,
                media,
                options,
                reqwest::Client::new(),
            ),
            listings,
        )
    }

    #[test]
    fn hours_digits_become_day_names() {
        assert_eq!(
            "Monday-Friday: 9am-5pm, Saturday: 10am-2pm",
            reform_hours("2-6: 9am-5pm, 7: 10am-2pm")
        );
        assert_eq!("", reform_hours(""));
    }

    #[test]
    fn grab_fields_builds_address_and_fallback_title() {
        let mut r = record(101, "Blue Heron Tours", "Website");
        r.sort_company = String::new();
        r.addr1 = "1 Dock St".to_string();
        r.city = "Bayview".to_string();
        r.state = "MI".to_string();
        r.zip = "49000".to_string();
        r.latitude = "44.1".to_string();
        r.longitude = "-85.6".to_string();
        let (title, fields) = grab_fields(&r);
        assert_eq!("Blue Heron Tours", title);
        assert_eq!("101 Company Name Missing", fields.sort_company);
        assert_eq!("1 Dock St, Bayview, MI 49000", fields.address);
        assert_eq!("44.1,-85.6", fields.map_coordinates);
        assert!(fields.premium.is_none());
    }

    #[test]
    fn premium_rank_is_case_insensitive() {
        let mut r = record(101, "Blue Heron Tours", "Website");
        r.rank = "PREMIUM".to_string();
        r.ticket_information = "At the gate".to_string();
        let (_, fields) = grab_fields(&r);
        assert_eq!(
            "At the gate",
            fields.premium.expect("premium").ticket_information
        );
    }

    #[tokio::test]
    async fn creates_only_new_website_listings_with_company() {
        let api = Arc::new(StubApi::new(
            vec![
                summary(101, "Blue Heron Tours", "Website"),
                summary(102, "Harbor Grill", "Member"),
                summary(103, "", "Website"),
            ],
            vec![
                record(101, "Blue Heron Tours", "Website"),
                record(102, "Harbor Grill", "Member"),
                record(103, "", "Website"),
            ],
        ));
        let (importer, listings) = importer(api).await;
        let known = HashMap::new();
        let companies = HashSet::new();
        let outcome = importer
            .process_listings(
                &importer_page(&importer).await,
                &known,
                &companies,
                Path::new("storage/media"),
            )
            .await;
        assert_eq!(3, outcome.processed);
        assert_eq!(1, outcome.added);
        assert_eq!(0, outcome.updated);
        assert_eq!(0, outcome.errors);
        assert!(listings.find_by_listing_id(101).await.expect("find").is_some());
        assert!(listings.find_by_listing_id(102).await.expect("find").is_none());
    }

    async fn importer_page(importer: &ListingImporter) -> Vec<ListingSummary> {
        importer
            .api
            .get_listings(PAGE_SIZE, 1)
            .await
            .expect("page")
            .listings
    }

    #[tokio::test]
    async fn known_company_name_blocks_creation() {
        let api = Arc::new(StubApi::new(
            vec![summary(104, "Harbor Grill", "Website")],
            vec![record(104, "Harbor Grill", "Website")],
        ));
        let (importer, _) = importer(api).await;
        let companies: HashSet<String> = ["Harbor Grill".to_string()].into();
        let outcome = importer
            .process_listings(
                &[summary(104, "Harbor Grill", "Website")],
                &HashMap::new(),
                &companies,
                Path::new("storage/media"),
            )
            .await;
        assert_eq!(1, outcome.processed);
        assert_eq!(0, outcome.added);
        assert_eq!(0, outcome.errors);
    }

    #[tokio::test]
    async fn mismatched_local_row_fails_without_mutation() {
        let api = Arc::new(StubApi::new(
            vec![summary(101, "Blue Heron Tours", "Website")],
            vec![record(101, "Blue Heron Tours UPDATED", "Website")],
        ));
        let (importer, listings) = importer(api).await;
        // Local row claims a different external ID than the map says.
        let local_id = listings
            .insert(Listing {
                id: 0,
                listing_id: 555,
                title: "Blue Heron Tours".to_string(),
                status: EntityStatus::Publish,
                fields: ListingFields::default(),
            })
            .await
            .expect("insert");
        let known: HashMap<u64, i64> = [(101, local_id)].into();
        let outcome = importer
            .process_listings(
                &[summary(101, "Blue Heron Tours", "Website")],
                &known,
                &HashSet::new(),
                Path::new("storage/media"),
            )
            .await;
        assert_eq!(1, outcome.errors);
        assert_eq!(0, outcome.updated);
        assert_eq!(MISMATCH_MESSAGE, outcome.statuses[0].message);
        let row = listings.get(local_id).await.expect("get").expect("row");
        assert_eq!("Blue Heron Tours", row.title);
    }

    #[tokio::test]
    async fn non_website_update_is_rejected_by_the_mapper() {
        let api = Arc::new(StubApi::new(
            vec![summary(102, "Harbor Grill", "Member")],
            vec![record(102, "Harbor Grill", "Member")],
        ));
        let (importer, listings) = importer(api).await;
        let local_id = listings
            .insert(Listing {
                id: 0,
                listing_id: 102,
                title: "Harbor Grill".to_string(),
                status: EntityStatus::Publish,
                fields: ListingFields::default(),
            })
            .await
            .expect("insert");
        let known: HashMap<u64, i64> = [(102, local_id)].into();
        let outcome = importer
            .process_listings(
                &[summary(102, "Harbor Grill", "Member")],
                &known,
                &HashSet::new(),
                Path::new("storage/media"),
            )
            .await;
        // The page processor sent it to the update path; the mapper's own
        // type gate turned it into a per-record failure.
        assert_eq!(1, outcome.errors);
        assert_eq!(0, outcome.updated);
    }

    #[tokio::test]
    async fn full_run_counts_pages_and_sweeps() {
        let mut summaries = Vec::new();
        let mut records = Vec::new();
        for id in 1..=23u64 {
            summaries.push(summary(id, &format!("Company {id}"), "Website"));
            records.push(record(id, &format!("Company {id}"), "Website"));
        }
        let (importer, listings) = importer(Arc::new(StubApi::new(summaries, records))).await;
        // A listing the feed no longer returns: the sweep should draft it.
        let stale = listings
            .insert(Listing {
                id: 0,
                listing_id: 999,
                title: "Closed Venue".to_string(),
                status: EntityStatus::Publish,
                fields: ListingFields::default(),
            })
            .await
            .expect("insert");

        let reset = importer.run_page(0, RunMethod::Manual).await.expect("reset");
        assert_eq!(3, reset.num_calls);
        assert_eq!(23, reset.results_count);
        assert!(reset.has_more);
        assert_eq!(0.0, reset.percent);

        let mut pages = 0;
        let mut page = 1;
        let mut prev_percent = 0.0;
        loop {
            let report = importer
                .run_page(page, RunMethod::Manual)
                .await
                .expect("page");
            pages += 1;
            assert!(report.percent >= prev_percent);
            prev_percent = report.percent;
            if !report.has_more {
                assert_eq!(100.0, report.percent);
                break;
            }
            page += 1;
        }
        assert_eq!(3, pages);

        let state = import_run::load(importer.options.as_ref(), EntityKind::Listings)
            .await
            .expect("state");
        assert_eq!(23, state.processed);
        assert_eq!(23, state.added);
        assert_eq!(0, state.errors);
        assert_eq!(23, state.processed_ids.len());
        // One stale + 23 fresh rows; only the stale one goes draft.
        let stale_row = listings.get(stale).await.expect("get").expect("row");
        assert_eq!(EntityStatus::Draft, stale_row.status);
        let fresh = listings
            .find_by_listing_id(1)
            .await
            .expect("find")
            .expect("row");
        assert_eq!(EntityStatus::Publish, fresh.status);
    }

    #[tokio::test]
    async fn page_zero_resets_previous_counters() {
        let (importer, _) = importer(Arc::new(StubApi::new(Vec::new(), Vec::new()))).await;
        let mut stale = ImportRunState::default();
        stale.processed = 99;
        stale.added = 9;
        stale.processed_ids = vec![1, 2];
        import_run::save(importer.options.as_ref(), EntityKind::Listings, &stale)
            .await
            .expect("save");
        let report = importer.run_page(0, RunMethod::Manual).await.expect("reset");
        assert!(!report.has_more);
        assert_eq!(100.0, report.percent);
        let state = import_run::load(importer.options.as_ref(), EntityKind::Listings)
            .await
            .expect("state");
        assert_eq!(0, state.processed);
        assert!(state.processed_ids.is_empty());
        assert_eq!(Some(RunMethod::Manual), state.method);
    }

    #[tokio::test]
    async fn cron_run_issues_exactly_num_calls_page_requests() {
        let mut summaries = Vec::new();
        let mut records = Vec::new();
        for id in 1..=11u64 {
            summaries.push(summary(id, &format!("Company {id}"), "Website"));
            records.push(record(id, &format!("Company {id}"), "Website"));
        }
        let api = Arc::new(StubApi::new(summaries, records));
        let (importer, _) = importer(api.clone()).await;
        importer.run_cron().await.expect("cron");
        let requests = api.page_requests.lock().expect("lock").clone();
        // One count probe, then ceil(11 / 10) = 2 full pages.
        assert_eq!(vec![(1, 1), (PAGE_SIZE, 1), (PAGE_SIZE, 2)], requests);
        let state = import_run::load(importer.options.as_ref(), EntityKind::Listings)
            .await
            .expect("state");
        assert_eq!(11, state.processed);
        assert_eq!(Some(RunMethod::Cron), state.method);
    }

    #[tokio::test]
    async fn failed_page_is_recorded_and_later_pages_still_import() {
        let mut summaries = Vec::new();
        let mut records = Vec::new();
        for id in 1..=23u64 {
            summaries.push(summary(id, &format!("Company {id}"), "Website"));
            records.push(record(id, &format!("Company {id}"), "Website"));
        }
        let api = Arc::new(StubApi::new(summaries, records).failing_on_page(2));
        let (importer, listings) = importer(api.clone()).await;
        importer.run_cron().await.expect("cron");
        // The failing page does not stop the walk; pages 1 and 3 land.
        let requests = api.page_requests.lock().expect("lock").clone();
        assert_eq!(
            vec![(1, 1), (PAGE_SIZE, 1), (PAGE_SIZE, 2), (PAGE_SIZE, 3)],
            requests
        );
        let state = import_run::load(importer.options.as_ref(), EntityKind::Listings)
            .await
            .expect("state");
        assert!(state.failed);
        assert!(state.failure_message.contains("overload"));
        assert_eq!(13, state.processed);
        assert_eq!(13, state.added);
        assert!(listings.find_by_listing_id(1).await.expect("find").is_some());
        assert!(listings.find_by_listing_id(15).await.expect("find").is_none());
        assert!(listings.find_by_listing_id(23).await.expect("find").is_some());
    }

    /// Feeds back an ever-larger page total on every read, the way an
    /// overlapping run's unlocked counter writes can.
    struct RunawayTotalStore {
        inner: SqliteOptionStore,
    }

    #[async_trait]
    impl OptionStore for RunawayTotalStore {
        async fn get(&self, name: &str) -> Result<Option<String>, anyhow::Error> {
            let value = self.inner.get(name).await?;
            if name != "sv_api_listings_run_state" {
                return Ok(value);
            }
            Ok(match value {
                Some(raw) => {
                    let mut state: ImportRunState = serde_json::from_str(&raw)?;
                    state.num_calls = 100;
                    Some(serde_json::to_string(&state)?)
                }
                None => None,
            })
        }

        async fn set(&self, name: &str, value: String) -> Result<(), anyhow::Error> {
            self.inner.set(name, value).await
        }

        async fn delete(&self, name: &str) -> Result<(), anyhow::Error> {
            self.inner.delete(name).await
        }
    }

    #[tokio::test]
    async fn runaway_page_total_stops_at_the_guard_rail() {
        let mut summaries = Vec::new();
        let mut records = Vec::new();
        for id in 1..=23u64 {
            summaries.push(summary(id, &format!("Company {id}"), "Website"));
            records.push(record(id, &format!("Company {id}"), "Website"));
        }
        let api = Arc::new(StubApi::new(summaries, records));
        let options = Arc::new(RunawayTotalStore {
            inner: SqliteOptionStore::init(Connection::open_in_memory().await.expect("conn"))
                .await
                .expect("options"),
        });
        let (importer, _) = importer_with_options(api.clone(), options).await;
        importer.run_cron().await.expect("cron");
        // 23 records declare 3 pages, so the rail sits at ceil(3 * 1.1) = 4;
        // without it the inflated total would keep the loop going forever.
        let requests = api.page_requests.lock().expect("lock").clone();
        assert_eq!(5, requests.len());
        assert_eq!((1, 1), requests[0]);
        assert_eq!((PAGE_SIZE, 4), requests[4]);
    }

    #[tokio::test]
    async fn create_from_svid_rejects_known_external_ids() {
        let api = Arc::new(StubApi::new(
            vec![],
            vec![record(101, "Blue Heron Tours", "Website")],
        ));
        let (importer, listings) = importer(api).await;
        let report = importer.create_from_svid(101).await.expect("create");
        assert_eq!("created", report.status);
        assert!(listings.find_by_listing_id(101).await.expect("find").is_some());
        let again = importer.create_from_svid(101).await.expect("create");
        assert_eq!("error", again.status);
    }

    #[tokio::test]
    async fn single_import_by_svid_reports_missing_rows() {
        let (importer, _) = importer(Arc::new(StubApi::new(Vec::new(), Vec::new()))).await;
        let report = importer
            .run_single("404", IdType::Sv)
            .await
            .expect("single");
        assert!(!report.post_found);
        assert!(report.create_new);
    }
}
