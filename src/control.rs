use crate::coupon_import::CouponImporter;
use crate::event_import::EventImporter;
use crate::import_run::{self, ImportRunState, RunMethod};
use crate::listing_import::{IdType, ListingImporter};
use crate::options::OptionStore;
use crate::scheduler;
use crate::settings::{self, ApiSettings};
use crate::EntityKind;
use actix_web::{
    get, post,
    web::{Data, Form, Json},
    Either, HttpResponse,
};
use derive_more::{Display, Error};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub type Response = Result<HttpResponse, ControllerError>;
pub type InputData<T> = Either<Form<T>, Json<T>>;

#[derive(Debug, Display, Error)]
pub enum ControllerError {
    #[error(ignore)]
    InternalServerError(anyhow::Error),
    #[error(ignore)]
    #[display("Invalid field {field}")]
    InvalidInput { field: String, msg: String },
}

impl From<anyhow::Error> for ControllerError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalServerError(err)
    }
}

impl actix_web::error::ResponseError for ControllerError {
    fn error_response(&self) -> HttpResponse {
        log::warn!("{self:?}");
        match self {
            Self::InternalServerError(err) => HttpResponse::InternalServerError()
                .json(serde_json::json!({ "error": err.to_string() })),
            Self::InvalidInput { field, msg } => HttpResponse::BadRequest()
                .json(serde_json::json!({ "error": msg, "field": field })),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ImportStepForm {
    #[serde(default)]
    pub page: usize,
    #[serde(default)]
    pub is_triggered: bool,
}

impl ImportStepForm {
    fn method(&self) -> RunMethod {
        if self.is_triggered {
            RunMethod::Manual
        } else {
            RunMethod::Cron
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SingleImportForm {
    pub pid: String,
    pub id_type: IdType,
}

#[derive(Debug, Deserialize)]
pub struct CreateForm {
    pub svid: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusReport {
    pub listings: ImportRunState,
    pub events: ImportRunState,
    pub coupons: ImportRunState,
}

#[post("/import/listings")]
async fn import_listings(
    form: InputData<ImportStepForm>,
    importer: Data<ListingImporter>,
) -> Response {
    let form = form.into_inner();
    let report = importer.run_page(form.page, form.method()).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[post("/import/events")]
async fn import_events(
    form: InputData<ImportStepForm>,
    importer: Data<EventImporter>,
) -> Response {
    let form = form.into_inner();
    let report = importer.run_page(form.page, form.method()).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[post("/import/coupons")]
async fn import_coupons(
    form: InputData<ImportStepForm>,
    importer: Data<CouponImporter>,
) -> Response {
    let form = form.into_inner();
    let report = importer.run(form.method()).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[post("/import/single")]
async fn import_single(
    form: InputData<SingleImportForm>,
    importer: Data<ListingImporter>,
) -> Response {
    let form = form.into_inner();
    let report = importer.run_single(&form.pid, form.id_type).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[post("/import/create")]
async fn import_create(
    form: InputData<CreateForm>,
    importer: Data<ListingImporter>,
) -> Response {
    let form = form.into_inner();
    let report = importer.create_from_svid(form.svid).await?;
    Ok(HttpResponse::Ok().json(report))
}

#[post("/import/kill")]
async fn import_kill() -> Response {
    let killed = scheduler::kill_running().await;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "cronKilled": killed })))
}

#[get("/import/status")]
async fn import_status(options: Data<Arc<dyn OptionStore>>) -> Response {
    let store: &dyn OptionStore = &***options;
    let report = StatusReport {
        listings: import_run::load(store, EntityKind::Listings).await?,
        events: import_run::load(store, EntityKind::Events).await?,
        coupons: import_run::load(store, EntityKind::Coupons).await?,
    };
    Ok(HttpResponse::Ok().json(report))
}

#[get("/settings")]
async fn get_settings(options: Data<Arc<dyn OptionStore>>) -> Response {
    let cfg = settings::load(&***options).await?;
    Ok(HttpResponse::Ok().json(cfg))
}

#[post("/settings")]
async fn save_settings(
    form: InputData<ApiSettings>,
    options: Data<Arc<dyn OptionStore>>,
) -> Response {
    let cfg = form.into_inner();
    if !cfg.api_url.trim().is_empty() && !cfg.api_url.trim().starts_with("http") {
        return Err(ControllerError::InvalidInput {
            field: "api_url".to_string(),
            msg: "API URL must be an http(s) URL".to_string(),
        });
    }
    settings::save(&***options, &cfg).await?;
    Ok(HttpResponse::Ok().json(cfg))
}

/// Everything the HTTP surface exposes, in one place so `main` and the
/// tests configure the app identically.
pub fn configure(cfg: &mut actix_web::web::ServiceConfig) {
    cfg.service(import_listings)
        .service(import_events)
        .service(import_coupons)
        .service(import_single)
        .service(import_create)
        .service(import_kill)
        .service(import_status)
        .service(get_settings)
        .service(save_settings);
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::options::SqliteOptionStore;
    use actix_web::{test, App};
    use tokio_rusqlite::Connection;

    async fn option_store() -> Arc<dyn OptionStore> {
        Arc::new(
            SqliteOptionStore::init(Connection::open_in_memory().await.expect("conn"))
                .await
                .expect("options"),
        )
    }

    #[actix_web::test]
    async fn settings_roundtrip_over_http() {
        let options = option_store().await;
        let app = test::init_service(
            App::new()
                .app_data(Data::new(options.clone()))
                .service(get_settings)
                .service(save_settings),
        )
        .await;

        let mut cfg = ApiSettings::default();
        cfg.api_url = "https://crm.example.com".to_string();
        cfg.api_username = "user".to_string();
        let req = test::TestRequest::post()
            .uri("/settings")
            .set_json(&cfg)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());

        let req = test::TestRequest::get().uri("/settings").to_request();
        let loaded: ApiSettings = test::call_and_read_body_json(&app, req).await;
        assert_eq!("https://crm.example.com", loaded.api_url);
        assert_eq!("user", loaded.api_username);
        assert!(loaded.overwrite_title);
    }

    #[actix_web::test]
    async fn bad_api_url_is_rejected() {
        let options = option_store().await;
        let app = test::init_service(
            App::new()
                .app_data(Data::new(options))
                .service(save_settings),
        )
        .await;
        let mut cfg = ApiSettings::default();
        cfg.api_url = "not a url".to_string();
        let req = test::TestRequest::post()
            .uri("/settings")
            .set_json(&cfg)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(actix_web::http::StatusCode::BAD_REQUEST, resp.status());
    }

    #[actix_web::test]
    async fn status_starts_empty() {
        let options = option_store().await;
        let app = test::init_service(
            App::new()
                .app_data(Data::new(options))
                .service(import_status),
        )
        .await;
        let req = test::TestRequest::get().uri("/import/status").to_request();
        let report: StatusReport = test::call_and_read_body_json(&app, req).await;
        assert_eq!(0, report.listings.processed);
        assert_eq!(0, report.events.num_calls);
        assert!(report.coupons.processed_ids.is_empty());
    }

    #[actix_web::test]
    async fn kill_always_answers_with_the_flag() {
        let app = test::init_service(App::new().service(import_kill)).await;
        let req = test::TestRequest::post().uri("/import/kill").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert!(body["cronKilled"].is_boolean());
    }
}
