//! In-memory state machine for tests.

use std::collections::{BTreeMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{ApplyError, SnapshotError};
use crate::message::{LogEntry, LogPayload};
use crate::traits::{Applier, ApplyResult, SnapshotResult};
use crate::types::Slot;

/// Injected outcome of the next `apply` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyFailure {
    Duplicate,
    Rejected,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedFile {
    pub storage_group: String,
    pub partition_id: u64,
    pub is_seq: bool,
}

/// Keeps applied physical plans per slot; the first byte of a plan names its slot.
#[derive(Default)]
pub struct MemoryApplier {
    slots: Mutex<BTreeMap<Slot, Vec<Vec<u8>>>>,
    applied: Mutex<Vec<u64>>,
    closed_files: Mutex<Vec<ClosedFile>>,
    failures: Mutex<VecDeque<ApplyFailure>>,
}

impl MemoryApplier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, failure: ApplyFailure) {
        self.failures.lock().push_back(failure);
    }

    pub fn plans(&self, slot: Slot) -> Vec<Vec<u8>> {
        self.slots.lock().get(&slot).cloned().unwrap_or_default()
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.slots.lock().keys().copied().collect()
    }

    /// Indexes of the entries applied so far, in apply order.
    pub fn applied(&self) -> Vec<u64> {
        self.applied.lock().clone()
    }

    pub fn closed_files(&self) -> Vec<ClosedFile> {
        self.closed_files.lock().clone()
    }
}

#[async_trait]
impl Applier for MemoryApplier {
    async fn apply(&self, entry: &LogEntry) -> ApplyResult<()> {
        let index = entry.curr_log_index;
        if let Some(failure) = self.failures.lock().pop_front() {
            return Err(match failure {
                ApplyFailure::Duplicate => ApplyError::Duplicate(format!("entry {}", index)),
                ApplyFailure::Rejected => ApplyError::Rejected(format!("entry {}", index)),
                ApplyFailure::Internal => ApplyError::Internal(format!("entry {}", index)),
            });
        }

        match &entry.payload {
            LogPayload::PhysicalPlan(plan) => {
                let slot = *plan
                    .first()
                    .ok_or_else(|| ApplyError::Rejected(format!("empty plan at {}", index)))?;
                self.slots
                    .lock()
                    .entry(Slot::from(slot))
                    .or_default()
                    .push(plan.clone());
            }
            LogPayload::CloseFile {
                storage_group,
                partition_id,
                is_seq,
            } => self.closed_files.lock().push(ClosedFile {
                storage_group: storage_group.clone(),
                partition_id: *partition_id,
                is_seq: *is_seq,
            }),
            LogPayload::Empty => {}
        }
        self.applied.lock().push(index);
        Ok(())
    }

    async fn take_snapshot(&self, slots: Option<&[Slot]>) -> SnapshotResult<BTreeMap<Slot, Vec<u8>>> {
        let held = self.slots.lock().clone();
        let mut snapshots = BTreeMap::new();
        for (slot, plans) in held {
            if slots.is_some_and(|wanted| !wanted.contains(&slot)) {
                continue;
            }
            let data = bincode::encode_to_vec(&plans, bincode::config::standard())
                .map_err(|e| SnapshotError::Install(e.to_string()))?;
            snapshots.insert(slot, data);
        }
        Ok(snapshots)
    }

    async fn install_snapshot(&self, slot: Slot, data: Vec<u8>) -> SnapshotResult<()> {
        let (plans, _): (Vec<Vec<u8>>, usize) =
            bincode::decode_from_slice(&data, bincode::config::standard())
                .map_err(|e| SnapshotError::DataCorrupted(e.into()))?;
        self.slots.lock().insert(slot, plans);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LogPosition;

    fn plan_entry(index: u64, slot: u8) -> LogEntry {
        LogEntry::new(
            index,
            1,
            LogPosition::new(index - 1, 1),
            LogPayload::PhysicalPlan(vec![slot, index as u8]),
        )
    }

    #[tokio::test]
    async fn test_snapshot_moves_slots() {
        let source = MemoryApplier::new();
        source.apply(&plan_entry(1, 3)).await.unwrap();
        source.apply(&plan_entry(2, 4)).await.unwrap();
        source.apply(&plan_entry(3, 3)).await.unwrap();

        let snapshots = source.take_snapshot(Some(&[3, 9])).await.unwrap();
        assert_eq!(snapshots.keys().copied().collect::<Vec<_>>(), vec![3]);

        let target = MemoryApplier::new();
        for (slot, data) in snapshots {
            target.install_snapshot(slot, data).await.unwrap();
        }
        assert_eq!(target.plans(3), vec![vec![3, 1], vec![3, 3]]);
        assert!(target.plans(4).is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let applier = MemoryApplier::new();
        applier.fail_next(ApplyFailure::Duplicate);
        assert!(matches!(
            applier.apply(&plan_entry(1, 0)).await,
            Err(ApplyError::Duplicate(_))
        ));
        applier.apply(&plan_entry(1, 0)).await.unwrap();
        assert_eq!(applier.applied(), vec![1]);
    }
}
