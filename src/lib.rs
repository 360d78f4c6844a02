#![deny(clippy::unwrap_used)]
#![allow(clippy::from_over_into)]

use serde::{Deserialize, Serialize};
use tokio::time::Duration;

pub mod category;
pub mod control;
pub mod coupon;
pub mod coupon_import;
pub mod event;
pub mod event_import;
pub mod import_run;
pub mod listing;
pub mod listing_import;
pub mod media;
pub mod options;
pub mod reconcile;
pub mod run_log;
pub mod scheduler;
pub mod settings;
pub mod sv_api;

/// The three content types mirrored from the CRM.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    #[default]
    Listings,
    Events,
    Coupons,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Listings => "listings",
            Self::Events => "events",
            Self::Coupons => "coupons",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    #[default]
    Publish,
    Draft,
    Trash,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Draft => "draft",
            Self::Trash => "trash",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "publish" => Some(Self::Publish),
            "draft" => Some(Self::Draft),
            "trash" => Some(Self::Trash),
            _ => None,
        }
    }
}

impl std::fmt::Display for EntityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Time until the next nightly slot at 01:00 UTC. The run logs are
/// date-stamped, so the slot sits an hour past the rollover to keep a
/// whole run inside one day's file.
pub fn duration_until_nightly_run() -> Duration {
    let now = time::OffsetDateTime::now_utc();
    let mut next_slot = time::OffsetDateTime::now_utc()
        .replace_time(time::Time::MIDNIGHT + time::Duration::hours(1));
    if now > next_slot {
        next_slot += time::Duration::DAY;
    }
    Duration::from_millis((next_slot - now).whole_milliseconds() as u64)
}

#[cfg(test)]
pub mod test {

    use super::*;

    #[test]
    fn parses_entity_status() {
        assert_eq!(Some(EntityStatus::Publish), EntityStatus::parse("publish"));
        assert_eq!(Some(EntityStatus::Draft), EntityStatus::parse("draft"));
        assert_eq!(None, EntityStatus::parse("pending"));
    }

    #[test]
    fn nightly_slot_is_always_within_a_day() {
        let pause = duration_until_nightly_run();
        assert!(pause <= Duration::from_secs(24 * 60 * 60));
    }

    #[test]
    fn entity_kind_names_are_stable() {
        assert_eq!("listings", EntityKind::Listings.as_str());
        assert_eq!("coupons", EntityKind::Coupons.to_string());
    }
}
