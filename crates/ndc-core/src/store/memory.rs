use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use tracing::debug;

use super::{
    BranchInfo, HistoryStore, ReadHistoryBranchRequest, ReadRawHistoryBranchResponse, checksum,
    page_token, truncate_batch,
};
use crate::error::{HistoryError, Result};
use crate::event::{DataBlob, HistoryEvent, encode_batch};
use crate::version_history::{BranchToken, FIRST_EVENT_ID};

#[derive(Debug, Clone)]
struct StoredNode {
    node_id: i64,
    last_event_id: i64,
    blob: DataBlob,
    checksum: String,
}

impl StoredNode {
    fn new(blob: DataBlob, node_id: i64, last_event_id: i64) -> Self {
        let checksum = checksum(&blob.data);
        Self {
            node_id,
            last_event_id,
            blob,
            checksum,
        }
    }
}

/// Process-local [`HistoryStore`].
#[derive(Debug, Default)]
pub struct MemoryHistoryStore {
    branches: RwLock<HashMap<BranchToken, Vec<StoredNode>>>,
}

impl MemoryHistoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of branches across all trees.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::StorageUnavailable`] if the store lock is poisoned.
    pub fn branch_count(&self) -> Result<usize> {
        Ok(self.read()?.len())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<BranchToken, Vec<StoredNode>>>> {
        self.branches
            .read()
            .map_err(|_| HistoryError::StorageUnavailable("history store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<BranchToken, Vec<StoredNode>>>> {
        self.branches
            .write()
            .map_err(|_| HistoryError::StorageUnavailable("history store lock poisoned".into()))
    }

    #[cfg(test)]
    fn corrupt_node(&self, branch_token: &BranchToken, node_id: i64) {
        let mut branches = self.write().unwrap();
        let node = branches
            .get_mut(branch_token)
            .and_then(|nodes| nodes.iter_mut().find(|node| node.node_id == node_id))
            .unwrap();
        node.blob.data.push(b' ');
    }
}

fn next_event_id(nodes: &[StoredNode]) -> i64 {
    nodes
        .last()
        .map_or(FIRST_EVENT_ID, |node| node.last_event_id + 1)
}

impl HistoryStore for MemoryHistoryStore {
    fn new_branch(&self) -> Result<BranchToken> {
        let token = BranchInfo::new_tree().to_token()?;
        self.write()?.insert(token.clone(), Vec::new());
        Ok(token)
    }

    fn append_history_nodes(&self, branch_token: &BranchToken, events: &[HistoryEvent]) -> Result<usize> {
        let blob = encode_batch(events)?;
        let mut branches = self.write()?;
        let nodes = branches
            .get_mut(branch_token)
            .ok_or_else(|| HistoryError::BranchNotFound(branch_token.to_string()))?;

        let expected = next_event_id(nodes);
        let (Some(first), Some(last)) = (events.first(), events.last()) else {
            return Err(HistoryError::invalid("event batch is empty"));
        };
        if first.event_id != expected {
            return Err(HistoryError::BranchDiscontinuity {
                branch: branch_token.to_string(),
                next_event_id: expected,
                first_event_id: first.event_id,
            });
        }

        let size = blob.len();
        nodes.push(StoredNode::new(blob, first.event_id, last.event_id));
        Ok(size)
    }

    fn delete_history_nodes(&self, branch_token: &BranchToken, from_node_id: i64) -> Result<usize> {
        let mut branches = self.write()?;
        let nodes = branches
            .get_mut(branch_token)
            .ok_or_else(|| HistoryError::BranchNotFound(branch_token.to_string()))?;
        let before = nodes.len();
        nodes.retain(|node| node.node_id < from_node_id);
        Ok(before - nodes.len())
    }

    fn delete_history_branch(&self, branch_token: &BranchToken) -> Result<()> {
        self.write()?.remove(branch_token);
        Ok(())
    }

    fn read_raw_history_branch(
        &self,
        request: &ReadHistoryBranchRequest,
    ) -> Result<ReadRawHistoryBranchResponse> {
        let resume_at = request.validate()?;
        let branches = self.read()?;
        let nodes = branches
            .get(&request.branch_token)
            .ok_or_else(|| HistoryError::BranchNotFound(request.branch_token.to_string()))?;

        let mut response = ReadRawHistoryBranchResponse::default();
        let in_range = nodes.iter().filter(|node| {
            node.node_id >= resume_at
                && node.last_event_id >= request.min_event_id
                && node.node_id < request.max_event_id
        });
        for node in in_range {
            if response.blobs.len() == request.page_size {
                response.next_page_token = page_token(node.node_id);
                break;
            }
            if checksum(&node.blob.data) != node.checksum {
                return Err(HistoryError::CorruptedBlob {
                    branch: request.branch_token.to_string(),
                    node_id: node.node_id,
                });
            }
            response.size += node.blob.len();
            response.blobs.push(node.blob.clone());
        }
        Ok(response)
    }

    fn fork_history_branch(&self, base: &BranchToken, fork_event_id: i64) -> Result<BranchToken> {
        let token = BranchInfo::from_token(base)?.fork().to_token()?;
        let mut branches = self.write()?;
        let base_nodes = branches
            .get(base)
            .ok_or_else(|| HistoryError::BranchNotFound(base.to_string()))?;

        let base_next = next_event_id(base_nodes);
        if fork_event_id <= FIRST_EVENT_ID || fork_event_id > base_next {
            return Err(HistoryError::invalid(format!(
                "cannot fork branch {base} at event {fork_event_id}: next event id is {base_next}"
            )));
        }

        let mut forked = Vec::new();
        for node in base_nodes {
            if node.last_event_id < fork_event_id {
                forked.push(node.clone());
            } else if node.node_id < fork_event_id {
                let kept = truncate_batch(&node.blob, fork_event_id)?;
                let last_event_id = kept.last().map_or(node.node_id, |event| event.event_id);
                forked.push(StoredNode::new(encode_batch(&kept)?, node.node_id, last_event_id));
            }
        }

        debug!(base = %base, fork_event_id, nodes = forked.len(), "forked history branch");
        branches.insert(token.clone(), forked);
        Ok(token)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;
    use chrono::{TimeZone, Utc};

    fn event(event_id: i64, version: i64) -> HistoryEvent {
        let kind = if event_id == FIRST_EVENT_ID {
            EventKind::WorkflowExecutionStarted {
                workflow_type: "order".into(),
                input: None,
            }
        } else {
            EventKind::WorkflowExecutionSignaled {
                signal_name: format!("s{event_id}"),
                input: None,
            }
        };
        HistoryEvent::new(
            event_id,
            version,
            Utc.with_ymd_and_hms(2024, 2, 15, 16, 30, 0).unwrap(),
            kind,
        )
    }

    fn batch(range: std::ops::RangeInclusive<i64>, version: i64) -> Vec<HistoryEvent> {
        range.map(|id| event(id, version)).collect()
    }

    fn seeded() -> (MemoryHistoryStore, BranchToken) {
        let store = MemoryHistoryStore::new();
        let token = store.new_branch().unwrap();
        store.append_history_nodes(&token, &batch(1..=3, 10)).unwrap();
        store.append_history_nodes(&token, &batch(4..=5, 10)).unwrap();
        store.append_history_nodes(&token, &batch(6..=9, 12)).unwrap();
        (store, token)
    }

    // ===================================================================
    // append / read
    // ===================================================================

    #[test]
    fn read_all_events() {
        let (store, token) = seeded();
        let events = store.read_history_events(&token, 1, i64::MAX).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, (1..=9).collect::<Vec<_>>());
    }

    #[test]
    fn read_range_filters_events() {
        let (store, token) = seeded();
        let events = store.read_history_events(&token, 5, 7).unwrap();
        let ids: Vec<i64> = events.iter().map(|e| e.event_id).collect();
        assert_eq!(ids, vec![5, 6]);
    }

    #[test]
    fn pagination_walks_every_node() {
        let (store, token) = seeded();
        let mut request = ReadHistoryBranchRequest::new(token, 1, i64::MAX, 2);

        let first = store.read_raw_history_branch(&request).unwrap();
        assert_eq!(first.blobs.len(), 2);
        assert!(!first.next_page_token.is_empty());
        assert_eq!(first.size, first.blobs.iter().map(DataBlob::len).sum::<usize>());

        request.next_page_token = first.next_page_token;
        let second = store.read_raw_history_branch(&request).unwrap();
        assert_eq!(second.blobs.len(), 1);
        assert!(second.next_page_token.is_empty());
    }

    #[test]
    fn append_must_continue_branch() {
        let (store, token) = seeded();
        let err = store
            .append_history_nodes(&token, &batch(11..=12, 12))
            .unwrap_err();
        assert!(matches!(
            err,
            HistoryError::BranchDiscontinuity {
                next_event_id: 10,
                first_event_id: 11,
                ..
            }
        ));
        let err = store
            .append_history_nodes(&token, &batch(9..=9, 12))
            .unwrap_err();
        assert!(matches!(err, HistoryError::BranchDiscontinuity { .. }));
    }

    #[test]
    fn deleted_nodes_free_the_tip() {
        let (store, token) = seeded();
        assert_eq!(store.delete_history_nodes(&token, 6).unwrap(), 1);
        assert_eq!(store.read_history_events(&token, 1, i64::MAX).unwrap().len(), 5);
        store.append_history_nodes(&token, &batch(6..=7, 14)).unwrap();
        assert_eq!(store.delete_history_nodes(&token, 20).unwrap(), 0);
    }

    #[test]
    fn deleted_branch_is_gone() {
        let (store, token) = seeded();
        let forked = store.fork_history_branch(&token, 4).unwrap();
        store.delete_history_branch(&forked).unwrap();
        assert_eq!(store.branch_count().unwrap(), 1);
        assert!(matches!(
            store.delete_history_nodes(&forked, 1).unwrap_err(),
            HistoryError::BranchNotFound(_)
        ));
        store.delete_history_branch(&forked).unwrap();
        assert_eq!(store.read_history_events(&token, 1, i64::MAX).unwrap().len(), 9);
    }

    #[test]
    fn unknown_branch_not_found() {
        let store = MemoryHistoryStore::new();
        let token = BranchInfo::new_tree().to_token().unwrap();
        let request = ReadHistoryBranchRequest::new(token, 1, 10, 10);
        let err = store.read_raw_history_branch(&request).unwrap_err();
        assert!(matches!(err, HistoryError::BranchNotFound(_)));
    }

    #[test]
    fn corrupted_node_detected() {
        let (store, token) = seeded();
        store.corrupt_node(&token, 4);
        let err = store.read_history_events(&token, 1, i64::MAX).unwrap_err();
        assert!(matches!(
            err,
            HistoryError::CorruptedBlob { node_id: 4, .. }
        ));
    }

    // ===================================================================
    // fork
    // ===================================================================

    #[test]
    fn fork_at_node_boundary_shares_prefix() {
        let (store, token) = seeded();
        let forked = store.fork_history_branch(&token, 6).unwrap();
        assert_ne!(forked, token);
        assert_eq!(
            BranchInfo::from_token(&forked).unwrap().tree_id,
            BranchInfo::from_token(&token).unwrap().tree_id
        );

        let events = store.read_history_events(&forked, 1, i64::MAX).unwrap();
        assert_eq!(events.len(), 5);

        store.append_history_nodes(&forked, &batch(6..=6, 20)).unwrap();
        let base = store.read_history_events(&token, 6, 7).unwrap();
        assert_eq!(base[0].version, 12);
        let branch = store.read_history_events(&forked, 6, 7).unwrap();
        assert_eq!(branch[0].version, 20);
        assert_eq!(store.branch_count().unwrap(), 2);
    }

    #[test]
    fn fork_inside_node_splits_batch() {
        let (store, token) = seeded();
        let forked = store.fork_history_branch(&token, 8).unwrap();
        let ids: Vec<i64> = store
            .read_history_events(&forked, 1, i64::MAX)
            .unwrap()
            .iter()
            .map(|e| e.event_id)
            .collect();
        assert_eq!(ids, (1..=7).collect::<Vec<_>>());
        store.append_history_nodes(&forked, &batch(8..=8, 13)).unwrap();
    }

    #[test]
    fn fork_point_must_be_inside_branch() {
        let (store, token) = seeded();
        assert!(store.fork_history_branch(&token, 1).is_err());
        assert!(store.fork_history_branch(&token, 11).is_err());
        assert!(store.fork_history_branch(&token, 10).is_ok());
    }
}
