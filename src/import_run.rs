use crate::options::{self, OptionStore};
use crate::EntityKind;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMethod {
    Manual,
    Cron,
}

impl std::fmt::Display for RunMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Manual => write!(f, "manually triggered"),
            Self::Cron => write!(f, "cron"),
        }
    }
}

/// One record's outcome, shaped as the run log wants it: a label
/// ("created" / "updated" / "failed") and a human-readable message, keyed by
/// the local entity ID or, when no local row exists yet, the external ID.
#[derive(Clone, Debug)]
pub struct RecordStatus {
    pub key: String,
    pub label: &'static str,
    pub message: String,
}

pub const CREATED: &str = "created";
pub const UPDATED: &str = "updated";
pub const FAILED: &str = "failed";

/// What one page of the import produced. Counters are absorbed additively
/// into the persisted run state.
#[derive(Debug, Default)]
pub struct PageOutcome {
    pub processed: usize,
    pub updated: usize,
    pub errors: usize,
    pub added: usize,
    pub statuses: Vec<RecordStatus>,
    pub processed_ids: Vec<i64>,
}

impl PageOutcome {
    pub fn push_created(&mut self, local_id: i64, message: String) {
        self.added += 1;
        self.processed_ids.push(local_id);
        self.statuses.push(RecordStatus {
            key: local_id.to_string(),
            label: CREATED,
            message,
        });
    }

    pub fn push_updated(&mut self, local_id: i64, message: String) {
        self.updated += 1;
        self.processed_ids.push(local_id);
        self.statuses.push(RecordStatus {
            key: local_id.to_string(),
            label: UPDATED,
            message,
        });
    }

    pub fn push_failed(&mut self, key: String, message: String) {
        self.errors += 1;
        self.statuses.push(RecordStatus {
            key,
            label: FAILED,
            message,
        });
    }
}

/// All cross-call state of one run. Persisted as one JSON option per entity
/// type; no in-process copy survives between calls.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ImportRunState {
    #[serde(default)]
    pub processed: usize,
    #[serde(default)]
    pub updated: usize,
    #[serde(default)]
    pub errors: usize,
    #[serde(default)]
    pub added: usize,
    #[serde(default)]
    pub results_count: usize,
    #[serde(default)]
    pub num_calls: usize,
    #[serde(default)]
    pub failed: bool,
    #[serde(default)]
    pub failure_message: String,
    #[serde(default)]
    pub method: Option<RunMethod>,
    #[serde(default)]
    pub last_run: Option<String>,
    #[serde(default)]
    pub processed_ids: Vec<i64>,
}

impl ImportRunState {
    /// Page 0 / cron start: everything goes back to zero, whatever the
    /// previous run left behind.
    pub fn reset(&mut self, method: RunMethod) {
        *self = Self {
            method: Some(method),
            ..Self::default()
        };
    }

    pub fn absorb(&mut self, outcome: &PageOutcome) {
        self.processed += outcome.processed;
        self.updated += outcome.updated;
        self.errors += outcome.errors;
        self.added += outcome.added;
        self.processed_ids.extend(&outcome.processed_ids);
    }

    pub fn mark_failed(&mut self, message: impl Into<String>) {
        self.failed = true;
        self.failure_message = message.into();
    }
}

/// Step-driven response payload. Field names are part of the control
/// surface contract.
#[derive(Debug, Serialize)]
pub struct PageReport {
    pub page: usize,
    pub num_calls: usize,
    pub api_pagesize: usize,
    #[serde(rename = "hasMore")]
    pub has_more: bool,
    #[serde(rename = "logData")]
    pub log_data: String,
    pub results_count: usize,
    pub added_count: usize,
    pub failed: bool,
    pub percent: f64,
}

fn state_option(kind: EntityKind) -> String {
    format!("sv_api_{}_run_state", kind.as_str())
}

pub async fn load(
    store: &dyn OptionStore,
    kind: EntityKind,
) -> Result<ImportRunState, anyhow::Error> {
    Ok(options::get_json(store, &state_option(kind))
        .await?
        .unwrap_or_default())
}

pub async fn save(
    store: &dyn OptionStore,
    kind: EntityKind,
    state: &ImportRunState,
) -> Result<(), anyhow::Error> {
    options::set_json(store, &state_option(kind), state).await
}

pub fn num_calls(total: usize, page_size: usize) -> usize {
    if page_size == 0 {
        return 0;
    }
    (total + page_size - 1) / page_size
}

/// Rounded to two decimals; an empty run reads as done rather than
/// dividing by zero.
pub fn progress_percent(page: usize, num_calls: usize) -> f64 {
    if num_calls == 0 {
        return 100.0;
    }
    ((page as f64 / num_calls as f64) * 100.0 * 100.0).round() / 100.0
}

pub fn now_timestamp() -> String {
    let fmt = format_description!(
        "[month repr:long] [day padding:none], [year], [hour repr:12 padding:none]:[minute] [period case:lower]"
    );
    OffsetDateTime::now_utc()
        .format(&fmt)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().to_string())
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::options::SqliteOptionStore;
    use tokio_rusqlite::Connection;

    #[test]
    fn num_calls_is_ceiling_division() {
        assert_eq!(0, num_calls(0, 10));
        assert_eq!(1, num_calls(1, 10));
        assert_eq!(1, num_calls(10, 10));
        assert_eq!(2, num_calls(11, 10));
        assert_eq!(3, num_calls(23, 10));
        assert_eq!(1, num_calls(49, 50));
    }

    #[test]
    fn percent_is_monotonic_and_ends_at_100() {
        let calls = num_calls(23, 10);
        let mut prev = 0.0;
        for page in 1..=calls {
            let p = progress_percent(page, calls);
            assert!(p >= prev);
            prev = p;
        }
        assert_eq!(100.0, progress_percent(calls, calls));
    }

    #[test]
    fn percent_tolerates_zero_calls() {
        assert_eq!(100.0, progress_percent(0, 0));
    }

    #[test]
    fn reset_zeroes_counters_and_ids() {
        let mut state = ImportRunState {
            processed: 40,
            updated: 12,
            errors: 3,
            added: 5,
            results_count: 40,
            num_calls: 4,
            failed: true,
            failure_message: "boom".to_string(),
            processed_ids: vec![1, 2, 3],
            ..ImportRunState::default()
        };
        state.reset(RunMethod::Manual);
        assert_eq!(0, state.processed);
        assert_eq!(0, state.updated);
        assert_eq!(0, state.errors);
        assert_eq!(0, state.added);
        assert!(state.processed_ids.is_empty());
        assert!(!state.failed);
        assert_eq!(Some(RunMethod::Manual), state.method);
    }

    #[test]
    fn absorb_is_additive() {
        let mut state = ImportRunState::default();
        let mut first = PageOutcome::default();
        first.processed = 10;
        first.push_created(11, "a".to_string());
        first.push_updated(12, "b".to_string());
        let mut second = PageOutcome::default();
        second.processed = 10;
        second.push_failed("913".to_string(), "c".to_string());
        state.absorb(&first);
        state.absorb(&second);
        assert_eq!(20, state.processed);
        assert_eq!(1, state.added);
        assert_eq!(1, state.updated);
        assert_eq!(1, state.errors);
        assert_eq!(vec![11, 12], state.processed_ids);
    }

    #[tokio::test]
    async fn state_roundtrips_through_the_option_store() {
        let conn = Connection::open_in_memory().await.expect("conn");
        let store = SqliteOptionStore::init(conn).await.expect("store");
        let mut state = ImportRunState::default();
        state.reset(RunMethod::Cron);
        state.processed = 7;
        state.processed_ids = vec![3, 4];
        save(&store, EntityKind::Listings, &state).await.expect("save");
        let back = load(&store, EntityKind::Listings).await.expect("load");
        assert_eq!(7, back.processed);
        assert_eq!(vec![3, 4], back.processed_ids);
        assert_eq!(Some(RunMethod::Cron), back.method);
        // Other entity types read their own slot.
        let events = load(&store, EntityKind::Events).await.expect("load");
        assert_eq!(0, events.processed);
    }
}
