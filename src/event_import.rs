use crate::category::{self, CategoryRepository, EVENTS_TAXONOMY};
use crate::event::{Event, EventFields, EventRepository};
use crate::import_run::{self, PageOutcome, PageReport, RunMethod};
use crate::listing::ListingRepository;
use crate::media::{self, MediaItem, MediaRepository};
use crate::options::OptionStore;
use crate::reconcile;
use crate::run_log::{self, RunLog};
use crate::settings;
use crate::sv_api::{EventRecord, SvApi};
use crate::{EntityKind, EntityStatus};
use itertools::Itertools;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Events arrive as one whole feed, so "pages" are slices of it. The feed
/// is fetched again on every step; a record that moved between slices
/// mid-run is either processed twice (harmless, it becomes an update) or
/// skipped until the next run.
pub const EVENTS_SLICE: usize = 5;

pub struct EventImporter {
    api: Arc<dyn SvApi>,
    events: Arc<dyn EventRepository>,
    listings: Arc<dyn ListingRepository>,
    categories: Arc<dyn CategoryRepository>,
    media: Arc<dyn MediaRepository>,
    options: Arc<dyn OptionStore>,
    client: reqwest::Client,
}

impl EventImporter {
    pub fn new(
        api: Arc<dyn SvApi>,
        events: Arc<dyn EventRepository>,
        listings: Arc<dyn ListingRepository>,
        categories: Arc<dyn CategoryRepository>,
        media: Arc<dyn MediaRepository>,
        options: Arc<dyn OptionStore>,
        client: reqwest::Client,
    ) -> Self {
        Self {
            api,
            events,
            listings,
            categories,
            media,
            options,
            client,
        }
    }

    pub async fn run_page(&self, page: usize, method: RunMethod) -> anyhow::Result<PageReport> {
        let cfg = settings::load(&*self.options).await?;
        anyhow::ensure!(
            cfg.check_events_settings(),
            "Events feed URL and API key are not configured"
        );
        let log = RunLog::open(Path::new(&cfg.log_dir), EntityKind::Events)?;
        let mut state = import_run::load(&*self.options, EntityKind::Events).await?;

        if page == 0 {
            state.reset(method);
            state.last_run = Some(import_run::now_timestamp());
            match self.api.get_events().await {
                Ok(feed) => {
                    state.results_count = feed.len();
                    state.num_calls = import_run::num_calls(feed.len(), EVENTS_SLICE);
                    log.add_line(&format!(
                        "Import started ({method}): {} events over {} slices",
                        state.results_count, state.num_calls
                    ))?;
                }
                Err(err) => {
                    state.mark_failed(err.to_string());
                    log.add_page_failure(0, &err.to_string())?;
                }
            }
            import_run::save(&*self.options, EntityKind::Events, &state).await?;
            return Ok(PageReport {
                page: 0,
                num_calls: state.num_calls,
                api_pagesize: EVENTS_SLICE,
                has_more: !state.failed && state.num_calls > 0,
                log_data: String::new(),
                results_count: state.results_count,
                added_count: 0,
                failed: state.failed,
                percent: import_run::progress_percent(0, state.num_calls),
            });
        }

        let log_data = match self.api.get_events().await {
            Err(err) => {
                state.mark_failed(err.to_string());
                log.add_page_failure(page, &err.to_string())?;
                format!("Page {page} failed -- {err}")
            }
            Ok(feed) => {
                let start = (page - 1) * EVENTS_SLICE;
                let end = (start + EVENTS_SLICE).min(feed.len());
                let slice = if start >= feed.len() {
                    &[][..]
                } else {
                    &feed[start..end]
                };
                let known = self.events.existing_ids().await?;
                let outcome = self
                    .process_events(slice, &known, Path::new(&cfg.media_dir))
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
            reconcile::sweep(&*self.events, &state.processed_ids).await?;
            run_log::clear_old_logs(Path::new(&cfg.log_dir))?;
        }
        import_run::save(&*self.options, EntityKind::Events, &state).await?;
        Ok(PageReport {
            page,
            num_calls: state.num_calls,
            api_pagesize: EVENTS_SLICE,
            has_more,
            log_data,
            results_count: state.results_count,
            added_count: state.added,
            failed: state.failed,
            percent: import_run::progress_percent(page, state.num_calls),
        })
    }

    /// Scheduler entry point: one fetch of the whole feed, then the sweep.
    pub async fn run_cron(&self) -> anyhow::Result<()> {
        let cfg = settings::load(&*self.options).await?;
        anyhow::ensure!(
            cfg.check_events_settings(),
            "Events feed URL and API key are not configured"
        );
        let log = RunLog::open(Path::new(&cfg.log_dir), EntityKind::Events)?;
        let mut state = import_run::load(&*self.options, EntityKind::Events).await?;
        state.reset(RunMethod::Cron);
        state.last_run = Some(import_run::now_timestamp());
        match self.api.get_events().await {
            Err(err) => {
                state.mark_failed(err.to_string());
                log.add_page_failure(0, &err.to_string())?;
            }
            Ok(feed) => {
                state.results_count = feed.len();
                state.num_calls = import_run::num_calls(feed.len(), EVENTS_SLICE);
                let known = self.events.existing_ids().await?;
                let outcome = self
                    .process_events(&feed, &known, Path::new(&cfg.media_dir))
                    .await;
                log.add_statuses(0, &outcome.statuses)?;
                state.absorb(&outcome);
                reconcile::sweep(&*self.events, &state.processed_ids).await?;
            }
        }
        import_run::save(&*self.options, EntityKind::Events, &state).await?;
        run_log::clear_old_logs(Path::new(&cfg.log_dir))?;
        Ok(())
    }

    /// Creation needs a fresh external ID and a non-empty title; updates
    /// only need a known ID.
    pub async fn process_events(
        &self,
        records: &[EventRecord],
        known: &HashMap<u64, i64>,
        media_dir: &Path,
    ) -> PageOutcome {
        let mut outcome = PageOutcome::default();
        for record in records {
            outcome.processed += 1;
            let title = record.title.trim();
            if let Some(&local_id) = known.get(&record.event_id) {
                match self.update_event(record, local_id, media_dir).await {
                    Ok(message) => outcome.push_updated(local_id, message),
                    Err(message) => outcome.push_failed(local_id.to_string(), message),
                }
            } else if !title.is_empty() {
                match self.create_event(record, media_dir).await {
                    Ok((local_id, message)) => outcome.push_created(local_id, message),
                    Err(message) => {
                        outcome.push_failed(record.event_id.to_string(), message)
                    }
                }
            }
        }
        outcome
    }

    async fn create_event(
        &self,
        record: &EventRecord,
        media_dir: &Path,
    ) -> Result<(i64, String), String> {
        let title = record.title.trim().to_string();
        let fields = self.grab_event_fields(record).await;
        let local_id = self
            .events
            .insert(Event {
                id: 0,
                event_id: record.event_id,
                title: title.clone(),
                status: EntityStatus::Publish,
                fields,
            })
            .await
            .map_err(|err| err.to_string())?;
        self.apply_categories(local_id, record)
            .await
            .map_err(|err| err.to_string())?;
        self.apply_images(local_id, record, media_dir).await;
        Ok((local_id, format!("{title} event created")))
    }

    async fn update_event(
        &self,
        record: &EventRecord,
        local_id: i64,
        media_dir: &Path,
    ) -> Result<String, String> {
        let mut current = self
            .events
            .get(local_id)
            .await
            .map_err(|err| err.to_string())?
            .ok_or_else(|| format!("No local event with ID {local_id}"))?;
        if current.event_id != record.event_id {
            return Err(
                "Post ID and SVID do not match. There may be duplicate events.".to_string(),
            );
        }
        let title = record.title.trim();
        if !title.is_empty() {
            current.title = title.to_string();
        }
        current.fields = self.grab_event_fields(record).await;
        self.events
            .update(&current)
            .await
            .map_err(|err| err.to_string())?;
        self.apply_categories(local_id, record)
            .await
            .map_err(|err| err.to_string())?;
        self.apply_images(local_id, record, media_dir).await;
        Ok(format!("{} event updated", current.title))
    }

    async fn grab_event_fields(&self, record: &EventRecord) -> EventFields {
        let host_id = if record.listing_id != 0 {
            record.listing_id
        } else {
            record.host_listing_id
        };
        let host_listing = if host_id == 0 {
            None
        } else {
            match self.listings.find_by_listing_id(host_id).await {
                Ok(found) => found.map(|l| l.id),
                Err(err) => {
                    log::warn!("Host listing lookup for event {} failed: {err}", record.event_id);
                    None
                }
            }
        };
        let map_coordinates =
            if record.latitude.trim().is_empty() || record.longitude.trim().is_empty() {
                String::new()
            } else {
                format!("{},{}", record.latitude.trim(), record.longitude.trim())
            };
        EventFields {
            description: record.description.trim().to_string(),
            start_date: record.start_date.trim().to_string(),
            end_date: record.end_date.trim().to_string(),
            start_time: record.start_time.trim().to_string(),
            end_time: record.end_time.trim().to_string(),
            times: record.times.trim().to_string(),
            event_dates: record
                .dates
                .as_ref()
                .map(|d| {
                    d.dates
                        .iter()
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
            recurrence: record.recurrence.trim().to_string(),
            location: record.location.trim().to_string(),
            admission: record.admission.trim().to_string(),
            contact: record.contact.trim().to_string(),
            email: record.email.trim().to_string(),
            website: record.website.trim().to_string(),
            address: record.address.trim().to_string(),
            city: record.city.trim().to_string(),
            state: record.state.trim().to_string(),
            zip: record.zip.trim().to_string(),
            map_coordinates,
            host_listing,
            never_expire: is_yes(&record.never_expire),
            featured: is_yes(&record.featured),
        }
    }

    async fn apply_categories(
        &self,
        local_id: i64,
        record: &EventRecord,
    ) -> anyhow::Result<()> {
        let Some(list) = &record.categories else {
            return Ok(());
        };
        let mut ids = Vec::new();
        for cat in &list.categories {
            if cat.name.trim().is_empty() {
                continue;
            }
            ids.push(
                category::ensure_category(
                    &*self.categories,
                    EVENTS_TAXONOMY,
                    &cat.name,
                    None,
                    None,
                )
                .await?,
            );
        }
        if !ids.is_empty() {
            self.categories
                .assign(EntityKind::Events, local_id, &ids)
                .await?;
        }
        Ok(())
    }

    /// The events feed carries no vendor media IDs, so the file name is
    /// the dedupe key. The first image of the gallery becomes the
    /// thumbnail.
    async fn apply_images(&self, local_id: i64, record: &EventRecord, media_dir: &Path) {
        let Some(gallery) = &record.images else {
            return;
        };
        for (index, image) in gallery.images.iter().enumerate() {
            let url = image.media_file.trim();
            if url.is_empty() {
                continue;
            }
            let Some(key) = media::image_file_name(url) else {
                log::warn!("Event {local_id} image has no usable file name: {url}");
                continue;
            };
            match self.media.find(EntityKind::Events, local_id, &key).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(err) => {
                    log::warn!("Media lookup failed for event {local_id}: {err}");
                    continue;
                }
            }
            match media::sideload_image(&self.client, media_dir, url, &key).await {
                Ok(path) => {
                    if let Err(err) = self
                        .media
                        .insert(MediaItem {
                            id: 0,
                            entity_kind: EntityKind::Events,
                            entity_id: local_id,
                            source_key: key.clone(),
                            file_path: path.display().to_string(),
                            high_res_path: None,
                            title: image.title.clone(),
                            description: String::new(),
                            is_thumbnail: index == 0,
                        })
                        .await
                    {
                        log::warn!("Unable to record image {key} for event {local_id}: {err}");
                    }
                }
                Err(err) => log::warn!("Image {key} for event {local_id} failed: {err}"),
            }
        }
    }
}

fn is_yes(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "yes" | "true" | "1"
    )
}
