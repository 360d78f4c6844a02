use crate::options::{self, OptionStore};
use serde::{Deserialize, Serialize};

pub const SETTINGS_OPTION: &str = "sv_api_setting_options";

fn default_true() -> bool {
    true
}

fn default_log_dir() -> String {
    "storage/logs".to_string()
}

fn default_media_dir() -> String {
    "storage/media".to_string()
}

/// Operational settings kept in the option store, not in the environment:
/// the admin surface edits these at runtime.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ApiSettings {
    #[serde(default)]
    pub api_url: String,
    #[serde(default)]
    pub api_username: String,
    #[serde(default)]
    pub api_password: String,
    #[serde(default)]
    pub events_api_url: String,
    #[serde(default)]
    pub events_api_key: String,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_media_dir")]
    pub media_dir: String,
    #[serde(default = "default_true")]
    pub overwrite_title: bool,
    #[serde(default = "default_true")]
    pub overwrite_text: bool,
    #[serde(default = "default_true")]
    pub overwrite_link: bool,
    #[serde(default = "default_true")]
    pub overwrite_images: bool,
    #[serde(default = "default_true")]
    pub overwrite_categories: bool,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            api_url: String::new(),
            api_username: String::new(),
            api_password: String::new(),
            events_api_url: String::new(),
            events_api_key: String::new(),
            log_dir: default_log_dir(),
            media_dir: default_media_dir(),
            overwrite_title: true,
            overwrite_text: true,
            overwrite_link: true,
            overwrite_images: true,
            overwrite_categories: true,
        }
    }
}

impl ApiSettings {
    /// Listings, coupons and amenities all go through the same endpoint.
    pub fn listings_endpoint(&self) -> String {
        let base = self.api_url.trim_end_matches('/');
        format!("{base}/webapi/listings/xml/listings.cfm")
    }

    pub fn check_listings_settings(&self) -> bool {
        !self.api_url.trim().is_empty()
            && !self.api_username.trim().is_empty()
            && !self.api_password.trim().is_empty()
    }

    pub fn check_events_settings(&self) -> bool {
        !self.events_api_url.trim().is_empty() && !self.events_api_key.trim().is_empty()
    }
}

pub async fn load(store: &dyn OptionStore) -> Result<ApiSettings, anyhow::Error> {
    Ok(options::get_json(store, SETTINGS_OPTION)
        .await?
        .unwrap_or_default())
}

pub async fn save(store: &dyn OptionStore, settings: &ApiSettings) -> Result<(), anyhow::Error> {
    options::set_json(store, SETTINGS_OPTION, settings).await
}
