use crate::options::OptionStore;
use crate::settings::{self, ApiSettings};
use async_trait::async_trait;
use derive_more::{Display, Error};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use std::sync::Arc;

pub const FAILURE_OPTION: &str = "sv_api_failure";
pub const FAILURE_MESSAGE_OPTION: &str = "sv_api_failure_message";
pub const FAILURE_DETAIL_OPTION: &str = "sv_api_failure_detail";

#[derive(Debug, Display, Error)]
pub enum SvApiError {
    #[display("Connection to API failed -- HTTP status {_0}")]
    #[error(ignore)]
    Http(u16),
    #[display("{message}")]
    #[error(ignore)]
    Vendor { message: String, detail: String },
    #[display("Unable to decode API response: {_0}")]
    #[error(ignore)]
    Decode(String),
    #[display("API request failed: {_0}")]
    Network(reqwest::Error),
    #[display("API credentials are not configured")]
    NotConfigured,
}

impl From<reqwest::Error> for SvApiError {
    fn from(err: reqwest::Error) -> Self {
        Self::Network(err)
    }
}

fn de_u64_or_zero<'de, D>(de: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(serde::de::Error::custom)
}

fn de_usize_or_zero<'de, D>(de: D) -> Result<usize, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(serde::de::Error::custom)
}

fn de_u32_or_zero<'de, D>(de: D) -> Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(de)?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(0);
    }
    trimmed.parse().map_err(serde::de::Error::custom)
}

#[derive(Debug, Default, Deserialize)]
pub struct RequestStatus {
    #[serde(rename = "HASERRORS", default)]
    pub has_errors: String,
    #[serde(rename = "RESULTS", default, deserialize_with = "de_usize_or_zero")]
    pub results: usize,
    #[serde(rename = "ERRORS", default)]
    pub errors: Option<ErrorList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorList {
    #[serde(rename = "ITEM", default)]
    pub items: Vec<ErrorItem>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ErrorItem {
    #[serde(rename = "MESSAGE", default)]
    pub message: String,
    #[serde(rename = "DETAIL", default)]
    pub detail: String,
}

fn is_error_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "true" | "yes" | "1"
    )
}

#[derive(Debug, Deserialize)]
pub struct ListingsResponse {
    #[serde(rename = "REQUESTSTATUS", default)]
    pub status: RequestStatus,
    #[serde(rename = "LISTINGS", default)]
    pub listings: Option<ListingList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListingList {
    #[serde(rename = "LISTING", default)]
    pub listings: Vec<ListingSummary>,
}

/// One row of a paged `getListings` response. The full record comes from a
/// separate `getListing` call.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListingSummary {
    #[serde(rename = "LISTINGID", default, deserialize_with = "de_u64_or_zero")]
    pub listing_id: u64,
    #[serde(rename = "COMPANY", default)]
    pub company: String,
    #[serde(rename = "SORTCOMPANY", default)]
    pub sort_company: String,
    #[serde(rename = "TYPENAME", default)]
    pub type_name: String,
    #[serde(rename = "LASTUPDATED", default)]
    pub last_updated: String,
}

#[derive(Debug, Deserialize)]
pub struct SingleListingResponse {
    #[serde(rename = "REQUESTSTATUS", default)]
    pub status: RequestStatus,
    #[serde(rename = "LISTING", default)]
    pub listing: Option<ListingRecord>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SocialMediaList {
    #[serde(rename = "ITEM", default)]
    pub items: Vec<SocialMediaItem>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SocialMediaItem {
    #[serde(rename = "SERVICE", default)]
    pub service: String,
    #[serde(rename = "VALUE", default)]
    pub value: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubcatList {
    #[serde(rename = "ITEM", default)]
    pub items: Vec<SubcatItem>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct SubcatItem {
    #[serde(rename = "CATNAME", default)]
    pub cat_name: String,
    #[serde(rename = "SUBCATNAME", default)]
    pub subcat_name: String,
    #[serde(rename = "SUBCATID", default, deserialize_with = "de_u64_or_zero")]
    pub subcat_id: u64,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageList {
    #[serde(rename = "ITEM", default)]
    pub items: Vec<ImageItem>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ImageItem {
    #[serde(rename = "MEDIAID", default, deserialize_with = "de_u64_or_zero")]
    pub media_id: u64,
    #[serde(rename = "TYPEID", default, deserialize_with = "de_u32_or_zero")]
    pub type_id: u32,
    #[serde(rename = "IMGPATH", default)]
    pub img_path: String,
    #[serde(rename = "MEDIAFILE", default)]
    pub media_file: String,
    #[serde(rename = "MEDIANAME", default)]
    pub media_name: String,
    #[serde(rename = "MEDIADESC", default)]
    pub media_desc: String,
    #[serde(rename = "SORTORDER", default, deserialize_with = "de_u32_or_zero")]
    pub sort_order: u32,
}

impl ImageItem {
    pub fn url(&self) -> String {
        let base = self.img_path.trim_end_matches('/');
        if base.is_empty() {
            self.media_file.clone()
        } else {
            format!("{base}/{}", self.media_file)
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListingAmenityList {
    #[serde(rename = "ITEM", default)]
    pub items: Vec<ListingAmenity>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListingAmenity {
    #[serde(rename = "AMENITYID", default, deserialize_with = "de_u64_or_zero")]
    pub amenity_id: u64,
    #[serde(rename = "AMENITYNAME", default)]
    pub name: String,
    #[serde(rename = "VALUE", default)]
    pub value: String,
}

/// Full listing record from `getListing`.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct ListingRecord {
    #[serde(rename = "LISTINGID", default, deserialize_with = "de_u64_or_zero")]
    pub listing_id: u64,
    #[serde(rename = "COMPANY", default)]
    pub company: String,
    #[serde(rename = "SORTCOMPANY", default)]
    pub sort_company: String,
    #[serde(rename = "TYPENAME", default)]
    pub type_name: String,
    #[serde(rename = "ADDR1", default)]
    pub addr1: String,
    #[serde(rename = "ADDR2", default)]
    pub addr2: String,
    #[serde(rename = "ADDR3", default)]
    pub addr3: String,
    #[serde(rename = "CITY", default)]
    pub city: String,
    #[serde(rename = "STATE", default)]
    pub state: String,
    #[serde(rename = "ZIP", default)]
    pub zip: String,
    #[serde(rename = "LATITUDE", default)]
    pub latitude: String,
    #[serde(rename = "LONGITUDE", default)]
    pub longitude: String,
    #[serde(rename = "PHONE", default)]
    pub phone: String,
    #[serde(rename = "ALTPHONE", default)]
    pub alt_phone: String,
    #[serde(rename = "TOLLFREE", default)]
    pub toll_free: String,
    #[serde(rename = "FAX", default)]
    pub fax: String,
    #[serde(rename = "CONTACTFIRSTNAME", default)]
    pub contact_first_name: String,
    #[serde(rename = "CONTACTLASTNAME", default)]
    pub contact_last_name: String,
    #[serde(rename = "EMAIL", default)]
    pub email: String,
    #[serde(rename = "HOURS", default)]
    pub hours: String,
    #[serde(rename = "RANKNAME", default)]
    pub rank: String,
    #[serde(rename = "REGION", default)]
    pub region: String,
    #[serde(rename = "KEYWORDS", default)]
    pub keywords: String,
    #[serde(rename = "TICKETSLINK", default)]
    pub tickets_link: String,
    #[serde(rename = "TICKETINFORMATION", default)]
    pub ticket_information: String,
    #[serde(rename = "ADMISSIONSINFORMATIONBLOCK", default)]
    pub admissions_block: String,
    #[serde(rename = "WHATSITLIKEINFORMATIONBLOCK", default)]
    pub whats_it_like_block: String,
    #[serde(rename = "DONTMISSINFORMATIONBLOCK", default)]
    pub dont_miss_block: String,
    #[serde(rename = "TYPEOFMEMBER", default)]
    pub type_of_member: String,
    #[serde(rename = "WCTID", default)]
    pub wct_id: String,
    #[serde(rename = "WEBURL", default)]
    pub web_url: String,
    #[serde(rename = "DESCRIPTION", default)]
    pub description: String,
    #[serde(rename = "CATNAME", default)]
    pub cat_name: String,
    #[serde(rename = "SUBCATNAME", default)]
    pub subcat_name: String,
    #[serde(rename = "SOCIALMEDIA", default)]
    pub social_media: Option<SocialMediaList>,
    #[serde(rename = "ADDITIONALSUBCATS", default)]
    pub additional_subcats: Option<SubcatList>,
    #[serde(rename = "IMAGES", default)]
    pub images: Option<ImageList>,
    #[serde(rename = "AMENITIES", default)]
    pub amenities: Option<ListingAmenityList>,
}

#[derive(Debug, Deserialize)]
pub struct CouponsResponse {
    #[serde(rename = "REQUESTSTATUS", default)]
    pub status: RequestStatus,
    #[serde(rename = "COUPONS", default)]
    pub coupons: Option<CouponList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CouponList {
    #[serde(rename = "COUPON", default)]
    pub coupons: Vec<CouponRecord>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct CouponRecord {
    #[serde(rename = "COUPONID", default, deserialize_with = "de_u64_or_zero")]
    pub coupon_id: u64,
    #[serde(rename = "LISTINGID", default, deserialize_with = "de_u64_or_zero")]
    pub listing_id: u64,
    #[serde(rename = "CATNAME", default)]
    pub cat_name: String,
    #[serde(rename = "OFFERTITLE", default)]
    pub offer_title: String,
    #[serde(rename = "SORTCOMPANY", default)]
    pub sort_company: String,
    #[serde(rename = "ADDR1", default)]
    pub addr1: String,
    #[serde(rename = "CITY", default)]
    pub city: String,
    #[serde(rename = "ZIP", default)]
    pub zip: String,
    #[serde(rename = "OFFERLINK", default)]
    pub offer_link: String,
    #[serde(rename = "WEBURL", default)]
    pub web_url: String,
    #[serde(rename = "OFFERTEXT", default)]
    pub offer_text: String,
    #[serde(rename = "REDEEMSTART", default)]
    pub redeem_start: String,
    #[serde(rename = "REDEEMEND", default)]
    pub redeem_end: String,
    #[serde(rename = "MEDIAID", default, deserialize_with = "de_u64_or_zero")]
    pub media_id: u64,
    #[serde(rename = "IMGPATH", default)]
    pub img_path: String,
    #[serde(rename = "MEDIAFILE", default)]
    pub media_file: String,
}

impl CouponRecord {
    pub fn image_url(&self) -> Option<String> {
        if self.media_file.trim().is_empty() {
            return None;
        }
        let base = self.img_path.trim_end_matches('/');
        if base.is_empty() {
            Some(self.media_file.clone())
        } else {
            Some(format!("{base}/{}", self.media_file))
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AmenitiesResponse {
    #[serde(rename = "REQUESTSTATUS", default)]
    pub status: RequestStatus,
    #[serde(rename = "AMENITIES", default)]
    pub amenities: Option<AmenityInfoList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct AmenityInfoList {
    #[serde(rename = "AMENITY", default)]
    pub amenities: Vec<AmenityInfo>,
}

/// Reference row from `getListingAmenities`: which tab (parent grouping)
/// each amenity belongs to.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AmenityInfo {
    #[serde(rename = "AMENITYID", default, deserialize_with = "de_u64_or_zero")]
    pub amenity_id: u64,
    #[serde(rename = "AMENITYNAME", default)]
    pub name: String,
    #[serde(rename = "AMENITYTABID", default, deserialize_with = "de_u64_or_zero")]
    pub tab_id: u64,
    #[serde(rename = "AMENITYTABNAME", default)]
    pub tab_name: String,
}

// The events feed is a different endpoint with lowercase tags and an
// apikey query parameter instead of credentials in the body.
#[derive(Debug, Default, Deserialize)]
pub struct EventsFeed {
    #[serde(default)]
    pub success: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub events: Option<EventList>,
}

#[derive(Debug, Default, Deserialize)]
pub struct EventList {
    #[serde(rename = "event", default)]
    pub events: Vec<EventRecord>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "eventid", default, deserialize_with = "de_u64_or_zero")]
    pub event_id: u64,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "startdate", default)]
    pub start_date: String,
    #[serde(rename = "enddate", default)]
    pub end_date: String,
    #[serde(rename = "starttime", default)]
    pub start_time: String,
    #[serde(rename = "endtime", default)]
    pub end_time: String,
    #[serde(default)]
    pub times: String,
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
    pub latitude: String,
    #[serde(default)]
    pub longitude: String,
    #[serde(rename = "hostlistingid", default, deserialize_with = "de_u64_or_zero")]
    pub host_listing_id: u64,
    #[serde(rename = "listingid", default, deserialize_with = "de_u64_or_zero")]
    pub listing_id: u64,
    #[serde(rename = "neverexpire", default)]
    pub never_expire: String,
    #[serde(default)]
    pub featured: String,
    #[serde(default)]
    pub recurrence: String,
    #[serde(rename = "eventcategories", default)]
    pub categories: Option<EventCategoryList>,
    #[serde(rename = "eventdates", default)]
    pub dates: Option<EventDateList>,
    #[serde(default)]
    pub images: Option<EventImageList>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventCategoryList {
    #[serde(rename = "eventcategory", default)]
    pub categories: Vec<EventCategory>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventCategory {
    #[serde(rename = "categoryname", default)]
    pub name: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventDateList {
    #[serde(rename = "eventdate", default)]
    pub dates: Vec<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventImageList {
    #[serde(rename = "image", default)]
    pub images: Vec<EventImage>,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct EventImage {
    #[serde(rename = "mediafile", default)]
    pub media_file: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Default)]
pub struct ListingsPage {
    pub results_count: usize,
    pub listings: Vec<ListingSummary>,
}

/// The outbound boundary. Import drivers only see this trait.
#[async_trait]
pub trait SvApi: Send + Sync {
    async fn get_listings(
        &self,
        page_size: usize,
        page_num: usize,
    ) -> Result<ListingsPage, SvApiError>;
    async fn get_listing(&self, listing_id: u64) -> Result<ListingRecord, SvApiError>;
    async fn get_coupons(
        &self,
        page_size: usize,
        page_num: usize,
    ) -> Result<Vec<CouponRecord>, SvApiError>;
    async fn get_listing_amenities(&self) -> Result<Vec<AmenityInfo>, SvApiError>;
    async fn get_events(&self) -> Result<Vec<EventRecord>, SvApiError>;
}

pub struct HttpSvApi {
    client: reqwest::Client,
    options: Arc<dyn OptionStore>,
}

impl HttpSvApi {
    pub fn new(client: reqwest::Client, options: Arc<dyn OptionStore>) -> Self {
        Self { client, options }
    }

    async fn load_settings(&self) -> Result<ApiSettings, SvApiError> {
        settings::load(&*self.options)
            .await
            .map_err(|err| SvApiError::Decode(err.to_string()))
    }

    /// Latest failure is kept in the option store so the status page can
    /// surface it; the typed error still propagates to the caller.
    async fn record_failure(&self, message: &str, detail: &str) {
        for (name, value) in [
            (FAILURE_OPTION, "yes"),
            (FAILURE_MESSAGE_OPTION, message),
            (FAILURE_DETAIL_OPTION, detail),
        ] {
            if let Err(err) = self.options.set(name, value.to_string()).await {
                log::warn!("Unable to persist API failure option {name}: {err}");
            }
        }
    }

    async fn post_xml(
        &self,
        settings: &ApiSettings,
        action: &str,
        extra: Vec<(&'static str, String)>,
    ) -> Result<String, SvApiError> {
        let mut params = vec![
            ("Username", settings.api_username.clone()),
            ("Password", settings.api_password.clone()),
            ("Action", action.to_string()),
        ];
        params.extend(extra);
        let resp = self
            .client
            .post(settings.listings_endpoint())
            .form(&params)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let err = SvApiError::Http(status.as_u16());
            self.record_failure(&err.to_string(), &truncate_body(&text)).await;
            return Err(err);
        }
        Ok(text)
    }

    async fn decode<T: DeserializeOwned>(&self, text: &str) -> Result<T, SvApiError> {
        match quick_xml::de::from_str::<T>(text) {
            Ok(v) => Ok(v),
            Err(err) => {
                let err = SvApiError::Decode(format!("{err}. Body: {}", truncate_body(text)));
                self.record_failure(&err.to_string(), "").await;
                Err(err)
            }
        }
    }

    async fn check_status(&self, status: &RequestStatus) -> Result<(), SvApiError> {
        if !is_error_flag(&status.has_errors) {
            return Ok(());
        }
        let (message, detail) = status
            .errors
            .as_ref()
            .and_then(|e| e.items.first())
            .map(|item| (item.message.clone(), item.detail.clone()))
            .unwrap_or_else(|| ("The API returned errors.".to_string(), String::new()));
        self.record_failure(&message, &detail).await;
        Err(SvApiError::Vendor { message, detail })
    }
}

#[async_trait]
impl SvApi for HttpSvApi {
    async fn get_listings(
        &self,
        page_size: usize,
        page_num: usize,
    ) -> Result<ListingsPage, SvApiError> {
        let settings = self.load_settings().await?;
        if !settings.check_listings_settings() {
            return Err(SvApiError::NotConfigured);
        }
        let text = self
            .post_xml(
                &settings,
                "getListings",
                vec![
                    ("Pagesize", page_size.to_string()),
                    ("Pagenum", page_num.to_string()),
                ],
            )
            .await?;
        let decoded: ListingsResponse = self.decode(&text).await?;
        self.check_status(&decoded.status).await?;
        Ok(ListingsPage {
            results_count: decoded.status.results,
            listings: decoded.listings.map(|l| l.listings).unwrap_or_default(),
        })
    }

    async fn get_listing(&self, listing_id: u64) -> Result<ListingRecord, SvApiError> {
        let settings = self.load_settings().await?;
        if !settings.check_listings_settings() {
            return Err(SvApiError::NotConfigured);
        }
        let text = self
            .post_xml(
                &settings,
                "getListing",
                vec![
                    ("ListingID", listing_id.to_string()),
                    ("updateHits", "0".to_string()),
                ],
            )
            .await?;
        let decoded: SingleListingResponse = self.decode(&text).await?;
        self.check_status(&decoded.status).await?;
        decoded.listing.ok_or_else(|| SvApiError::Vendor {
            message: format!("Listing {listing_id} missing from API response"),
            detail: String::new(),
        })
    }

    async fn get_coupons(
        &self,
        page_size: usize,
        page_num: usize,
    ) -> Result<Vec<CouponRecord>, SvApiError> {
        let settings = self.load_settings().await?;
        if !settings.check_listings_settings() {
            return Err(SvApiError::NotConfigured);
        }
        let text = self
            .post_xml(
                &settings,
                "getCoupons",
                vec![
                    ("Pagesize", page_size.to_string()),
                    ("Pagenum", page_num.to_string()),
                ],
            )
            .await?;
        let decoded: CouponsResponse = self.decode(&text).await?;
        self.check_status(&decoded.status).await?;
        Ok(decoded.coupons.map(|c| c.coupons).unwrap_or_default())
    }

    async fn get_listing_amenities(&self) -> Result<Vec<AmenityInfo>, SvApiError> {
        let settings = self.load_settings().await?;
        if !settings.check_listings_settings() {
            return Err(SvApiError::NotConfigured);
        }
        let text = self
            .post_xml(
                &settings,
                "getListingAmenities",
                vec![("Displayamenities", "1".to_string())],
            )
            .await?;
        let decoded: AmenitiesResponse = self.decode(&text).await?;
        self.check_status(&decoded.status).await?;
        Ok(decoded.amenities.map(|a| a.amenities).unwrap_or_default())
    }

    async fn get_events(&self) -> Result<Vec<EventRecord>, SvApiError> {
        let settings = self.load_settings().await?;
        if !settings.check_events_settings() {
            return Err(SvApiError::NotConfigured);
        }
        let url = format!(
            "{}?apikey={}",
            settings.events_api_url.trim_end_matches('/'),
            settings.events_api_key
        );
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            let err = SvApiError::Http(status.as_u16());
            self.record_failure(&err.to_string(), &truncate_body(&text)).await;
            return Err(err);
        }
        let feed: EventsFeed = self.decode(&text).await?;
        if !feed.success.trim().eq_ignore_ascii_case("yes") {
            let message = if feed.message.trim().is_empty() {
                "Events feed reported failure".to_string()
            } else {
                feed.message.clone()
            };
            self.record_failure(&message, "").await;
            return Err(SvApiError::Vendor {
                message,
                detail: String::new(),
            });
        }
        Ok(feed.events.map(|e| e.events).unwrap_or_default())
    }
}

fn truncate_body(text: &str) -> String {
    const LIMIT: usize = 200;
    let trimmed = text.trim();
    if trimmed.len() <= LIMIT {
        trimmed.to_string()
    } else {
        let cut = trimmed
            .char_indices()
            .take_while(|(i, _)| *i < LIMIT)
            .last()
            .map(|(i, c)| i + c.len_utf8())
            .unwrap_or(LIMIT);
        format!("{}…", &trimmed[..cut])
    }
}
