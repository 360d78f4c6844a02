use actix_web::{middleware::DefaultHeaders, web::Data, web::FormConfig, App, HttpServer};
use anyhow::Context as AnyhowContext;
use reqwest::header::{HeaderMap, HeaderValue};
use std::env;
use std::sync::Arc;
use std::time::Duration;
use sv_sync::category::{CategoryRepository, SqliteCategoryRepository};
use sv_sync::control;
use sv_sync::coupon::{CouponRepository, SqliteCouponRepository};
use sv_sync::coupon_import::CouponImporter;
use sv_sync::event::{EventRepository, SqliteEventRepository};
use sv_sync::event_import::EventImporter;
use sv_sync::listing::{ListingRepository, SqliteListingRepository};
use sv_sync::listing_import::ListingImporter;
use sv_sync::media::{MediaRepository, SqliteMediaRepository};
use sv_sync::options::{OptionStore, SqliteOptionStore};
use sv_sync::scheduler::{self, Importers};
use sv_sync::sv_api::{HttpSvApi, SvApi};
use tokio::signal;
use tokio_rusqlite::Connection;
use tokio_util::sync::CancellationToken;

static DEFAULT_ACCEPT_ENCODING: &str = "br;q=1.0, gzip;q=0.6, deflate;q=0.4, *;q=0.2";

const DB_PATH: &str = "storage/sv_sync.db";

fn bind_addr() -> String {
    env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string())
}

#[actix_web::main]
async fn main() -> Result<(), anyhow::Error> {
    if let Err(env::VarError::NotPresent) = env::var("RUST_LOG") {
        env::set_var("RUST_LOG", "INFO");
    }
    pretty_env_logger::formatted_timed_builder()
        .parse_default_env()
        .init();

    match std::fs::File::open(".env") {
        Ok(_) => envmnt::load_file(".env")?,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            std::fs::File::create(".env")?;
            envmnt::load_file(".env")?;
        }
        Err(err) => {
            return Err(anyhow::anyhow!("Unable to open .env file: {err}"));
        }
    }

    std::fs::create_dir_all("storage")?;

    // Each repository needs its own Connection due to ownership requirements.
    // SQLite with WAL mode supports multiple connections to the same database
    // file safely.
    let options: Arc<dyn OptionStore> =
        Arc::new(SqliteOptionStore::init(Connection::open(DB_PATH).await?).await?);
    let listings: Arc<dyn ListingRepository> =
        Arc::new(SqliteListingRepository::init(Connection::open(DB_PATH).await?).await?);
    let events: Arc<dyn EventRepository> =
        Arc::new(SqliteEventRepository::init(Connection::open(DB_PATH).await?).await?);
    let coupons: Arc<dyn CouponRepository> =
        Arc::new(SqliteCouponRepository::init(Connection::open(DB_PATH).await?).await?);
    let categories: Arc<dyn CategoryRepository> =
        Arc::new(SqliteCategoryRepository::init(Connection::open(DB_PATH).await?).await?);
    let media: Arc<dyn MediaRepository> =
        Arc::new(SqliteMediaRepository::init(Connection::open(DB_PATH).await?).await?);

    let mut map = HeaderMap::new();
    map.append(
        reqwest::header::ACCEPT_ENCODING,
        HeaderValue::from_str(DEFAULT_ACCEPT_ENCODING)?,
    );
    let client = reqwest::ClientBuilder::new()
        .connect_timeout(Duration::from_secs(10))
        .timeout(Duration::from_secs(60))
        .use_rustls_tls()
        .default_headers(map)
        .build()?;

    let api: Arc<dyn SvApi> = Arc::new(HttpSvApi::new(client.clone(), options.clone()));

    let listing_importer = Arc::new(ListingImporter::new(
        api.clone(),
        listings.clone(),
        categories.clone(),
        media.clone(),
        options.clone(),
        client.clone(),
    ));
    let event_importer = Arc::new(EventImporter::new(
        api.clone(),
        events.clone(),
        listings.clone(),
        categories.clone(),
        media.clone(),
        options.clone(),
        client.clone(),
    ));
    let coupon_importer = Arc::new(CouponImporter::new(
        api.clone(),
        coupons.clone(),
        listings.clone(),
        categories.clone(),
        media.clone(),
        options.clone(),
        client.clone(),
    ));

    let token = CancellationToken::new();
    let t = token.clone();
    tokio::spawn(async {
        let token = t;
        match signal::ctrl_c().await {
            Ok(_) => token.cancel(),
            Err(err) => log::error!("Unable to listen to shutdown: {err}"),
        }
    });

    let cron = scheduler::spawn_daily(
        Importers {
            listings: listing_importer.clone(),
            events: event_importer.clone(),
            coupons: coupon_importer.clone(),
        },
        token.clone(),
    );

    let addr = bind_addr();
    let options_data = Data::new(options.clone());
    let listings_data = Data::from(listing_importer);
    let events_data = Data::from(event_importer);
    let coupons_data = Data::from(coupon_importer);
    HttpServer::new(move || {
        App::new()
            .app_data(FormConfig::default().limit(256 * 1024))
            .app_data(options_data.clone())
            .app_data(listings_data.clone())
            .app_data(events_data.clone())
            .app_data(coupons_data.clone())
            .wrap(
                DefaultHeaders::new()
                    .add(("Access-Control-Allow-Origin", "*"))
                    .add(("Access-Control-Allow-Methods", "GET, POST, OPTIONS"))
                    .add(("Access-Control-Allow-Headers", "*")),
            )
            .configure(control::configure)
    })
    .bind(&addr)
    .with_context(|| format!("Failed to bind server to {addr}. Is the port already in use?"))?
    .run()
    .await?;

    token.cancel();
    cron.abort();
    Ok(())
}
