use crate::EntityStatus;
use async_trait::async_trait;
use std::collections::HashSet;

/// The slice of a repository the end-of-run sweep needs.
#[async_trait]
pub trait StatusSweep: Send + Sync {
    /// IDs of every non-trashed entity of the type.
    async fn sweep_universe(&self) -> Result<Vec<i64>, anyhow::Error>;
    async fn set_status_bulk(
        &self,
        ids: &[i64],
        status: EntityStatus,
    ) -> Result<(), anyhow::Error>;
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct Partition {
    pub seen: Vec<i64>,
    pub unseen: Vec<i64>,
}

pub fn partition_seen(universe: &[i64], processed: &[i64]) -> Partition {
    let processed: HashSet<i64> = processed.iter().copied().collect();
    let mut partition = Partition::default();
    for id in universe {
        if processed.contains(id) {
            partition.seen.push(*id);
        } else {
            partition.unseen.push(*id);
        }
    }
    partition
}

/// Mark-and-sweep after a completed run: everything the run touched goes
/// active, everything it did not goes draft. An empty processed list means
/// the run saw nothing trustworthy, so nothing is touched.
pub async fn sweep(store: &dyn StatusSweep, processed: &[i64]) -> Result<(), anyhow::Error> {
    if processed.is_empty() {
        log::info!("Sweep skipped: no processed IDs recorded for this run");
        return Ok(());
    }
    let universe = store.sweep_universe().await?;
    let partition = partition_seen(&universe, processed);
    if !partition.seen.is_empty() {
        store
            .set_status_bulk(&partition.seen, EntityStatus::Publish)
            .await?;
    }
    if !partition.unseen.is_empty() {
        store
            .set_status_bulk(&partition.unseen, EntityStatus::Draft)
            .await?;
    }
    log::info!(
        "Sweep complete: {} kept active, {} drafted",
        partition.seen.len(),
        partition.unseen.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {

    use super::*;
    use std::sync::Mutex;

    struct FakeStore {
        universe: Vec<i64>,
        changes: Mutex<Vec<(Vec<i64>, EntityStatus)>>,
    }

    #[async_trait]
    impl StatusSweep for FakeStore {
        async fn sweep_universe(&self) -> Result<Vec<i64>, anyhow::Error> {
            Ok(self.universe.clone())
        }
        async fn set_status_bulk(
            &self,
            ids: &[i64],
            status: EntityStatus,
        ) -> Result<(), anyhow::Error> {
            self.changes
                .lock()
                .expect("lock")
                .push((ids.to_vec(), status));
            Ok(())
        }
    }

    #[test]
    fn partitions_by_membership() {
        let p = partition_seen(&[1, 2, 3], &[1, 3]);
        assert_eq!(vec![1, 3], p.seen);
        assert_eq!(vec![2], p.unseen);
    }

    #[tokio::test]
    async fn seen_entities_publish_and_unseen_draft() {
        let store = FakeStore {
            universe: vec![10, 20, 30],
            changes: Mutex::new(Vec::new()),
        };
        sweep(&store, &[10, 30]).await.expect("sweep");
        let changes = store.changes.lock().expect("lock");
        assert_eq!(
            vec![
                (vec![10, 30], EntityStatus::Publish),
                (vec![20], EntityStatus::Draft)
            ],
            *changes
        );
    }

    #[tokio::test]
    async fn empty_processed_list_is_a_no_op() {
        let store = FakeStore {
            universe: vec![10, 20],
            changes: Mutex::new(Vec::new()),
        };
        sweep(&store, &[]).await.expect("sweep");
        assert!(store.changes.lock().expect("lock").is_empty());
    }
}
