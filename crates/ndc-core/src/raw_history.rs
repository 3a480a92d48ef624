//! Raw history reads by version history item range.
//!
//! A caller (typically a remote cluster asking for events it missed) names
//! the range by two version history items, both exclusive:
//!
//! ```text
//! (start_event_id, start_version) .. (end_event_id, end_version)
//! ```
//!
//! Unset bounds default to the whole current branch. The end item picks the
//! branch to read; a start item living on another branch is replaced by that
//! branch's common ancestor with the target branch.
//!
//! Pagination tokens carry the resolved range plus the version histories
//! seen on the first page, so later pages read the same branch even if the
//! execution has moved on.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{HistoryError, Result};
use crate::event::DataBlob;
use crate::identifier::WorkflowIdentifier;
use crate::store::{HistoryStore, ReadHistoryBranchRequest};
use crate::version_history::{
    EMPTY_EVENT_ID, EMPTY_VERSION, FIRST_EVENT_ID, VersionHistories, VersionHistory,
    VersionHistoryItem,
};

/// Request for the raw batches between two exclusive items.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHistoryRequest {
    pub workflow: WorkflowIdentifier,
    /// Exclusive. [`EMPTY_EVENT_ID`] together with [`EMPTY_VERSION`] means "from the start".
    pub start_event_id: i64,
    pub start_event_version: i64,
    /// Exclusive. [`EMPTY_EVENT_ID`] together with [`EMPTY_VERSION`] means "to the end".
    pub end_event_id: i64,
    pub end_event_version: i64,
    pub page_size: usize,
    /// Empty for the first page.
    pub next_page_token: Vec<u8>,
}

impl RawHistoryRequest {
    /// Request covering the whole current branch.
    #[must_use]
    pub const fn new(workflow: WorkflowIdentifier, page_size: usize) -> Self {
        Self {
            workflow,
            start_event_id: EMPTY_EVENT_ID,
            start_event_version: EMPTY_VERSION,
            end_event_id: EMPTY_EVENT_ID,
            end_event_version: EMPTY_VERSION,
            page_size,
            next_page_token: Vec::new(),
        }
    }

    /// Events strictly after `item`.
    #[must_use]
    pub const fn with_start(mut self, item: VersionHistoryItem) -> Self {
        self.start_event_id = item.event_id;
        self.start_event_version = item.version;
        self
    }

    /// Events strictly before `item`.
    #[must_use]
    pub const fn with_end(mut self, item: VersionHistoryItem) -> Self {
        self.end_event_id = item.event_id;
        self.end_event_version = item.version;
        self
    }

    /// Reject malformed requests before touching any state.
    ///
    /// # Errors
    ///
    /// Returns [`HistoryError::InvalidArgument`].
    pub fn validate(&self) -> Result<()> {
        self.workflow.validate()?;
        if self.page_size == 0 {
            return Err(HistoryError::invalid("Invalid PageSize."));
        }
        let start_set = (self.start_event_id != EMPTY_EVENT_ID, self.start_event_version != EMPTY_VERSION);
        let end_set = (self.end_event_id != EMPTY_EVENT_ID, self.end_event_version != EMPTY_VERSION);
        if start_set == (false, false) && end_set == (false, false) {
            return Err(HistoryError::invalid("Invalid event query range."));
        }
        if start_set.0 != start_set.1 {
            return Err(HistoryError::invalid(
                "Invalid start event id and start event version combination.",
            ));
        }
        if end_set.0 != end_set.1 {
            return Err(HistoryError::invalid(
                "Invalid end event id and end event version combination.",
            ));
        }
        Ok(())
    }
}

/// One page of raw batches plus the branch they were read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawHistoryResponse {
    pub blobs: Vec<DataBlob>,
    /// Empty when there is nothing more to read.
    pub next_page_token: Vec<u8>,
    pub version_history: VersionHistory,
}

impl RawHistoryResponse {
    const fn finished(blobs: Vec<DataBlob>, version_history: VersionHistory) -> Self {
        Self {
            blobs,
            next_page_token: Vec::new(),
            version_history,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct RawHistoryToken {
    workflow: WorkflowIdentifier,
    start_event_id: i64,
    start_event_version: i64,
    end_event_id: i64,
    end_event_version: i64,
    #[serde(default)]
    persistence_token: Vec<u8>,
    version_histories: VersionHistories,
}

impl RawHistoryToken {
    fn matches(&self, request: &RawHistoryRequest) -> bool {
        self.workflow == request.workflow
            && self.start_event_id == request.start_event_id
            && self.start_event_version == request.start_event_version
            && self.end_event_id == request.end_event_id
            && self.end_event_version == request.end_event_version
    }
}

/// Read one page of raw history.
///
/// `load_version_histories` is only called for the first page; later pages
/// reuse the histories recorded in the token.
///
/// # Errors
///
/// - [`HistoryError::InvalidArgument`] for a malformed request or a token
///   issued for a different request.
/// - [`HistoryError::ItemNotFound`] if a bound names an item no branch contains.
/// - Errors from `load_version_histories` and the store, except an unknown
///   branch which reads as empty.
pub fn read_raw_history(
    store: &dyn HistoryStore,
    request: &RawHistoryRequest,
    load_version_histories: impl FnOnce(&WorkflowIdentifier) -> Result<VersionHistories>,
) -> Result<RawHistoryResponse> {
    request.validate()?;
    let mut resolved = request.clone();

    let (mut token, target) = if request.next_page_token.is_empty() {
        let version_histories = load_version_histories(&request.workflow)?;
        let target = resolve_range(&mut resolved, &version_histories)?;
        let token = RawHistoryToken {
            workflow: resolved.workflow.clone(),
            start_event_id: resolved.start_event_id,
            start_event_version: resolved.start_event_version,
            end_event_id: resolved.end_event_id,
            end_event_version: resolved.end_event_version,
            persistence_token: Vec::new(),
            version_histories,
        };
        (token, target)
    } else {
        let token: RawHistoryToken = serde_json::from_slice(&request.next_page_token)
            .map_err(|_| HistoryError::invalid("Invalid pagination token."))?;
        let target = resolve_range(&mut resolved, &token.version_histories)?;
        (token, target)
    };

    if !token.matches(&resolved) {
        return Err(HistoryError::invalid("Invalid pagination token."));
    }

    if token.start_event_id + 1 == token.end_event_id {
        return Ok(RawHistoryResponse::finished(Vec::new(), target));
    }

    let mut read = ReadHistoryBranchRequest::new(
        target.branch_token().clone(),
        token.start_event_id + 1,
        token.end_event_id,
        request.page_size,
    );
    read.next_page_token = std::mem::take(&mut token.persistence_token);
    let response = match store.read_raw_history_branch(&read) {
        Ok(response) => response,
        Err(HistoryError::BranchNotFound(branch)) => {
            debug!(execution = %request.workflow, branch, "no history for raw read");
            return Ok(RawHistoryResponse::finished(Vec::new(), target));
        }
        Err(err) => return Err(err),
    };
    debug!(
        execution = %request.workflow,
        min_event_id = read.min_event_id,
        max_event_id = read.max_event_id,
        blobs = response.blobs.len(),
        size = response.size,
        "raw history page read"
    );

    if response.next_page_token.is_empty() {
        return Ok(RawHistoryResponse::finished(response.blobs, target));
    }
    token.persistence_token = response.next_page_token;
    Ok(RawHistoryResponse {
        blobs: response.blobs,
        next_page_token: serde_json::to_vec(&token)?,
        version_history: target,
    })
}

/// Fill in default bounds and pick the branch to read.
fn resolve_range(
    request: &mut RawHistoryRequest,
    version_histories: &VersionHistories,
) -> Result<VersionHistory> {
    let mut target = version_histories.current_version_history()?;
    let first_item = target.first_item()?;
    let last_item = target.last_item()?;

    if request.start_event_id == EMPTY_EVENT_ID || request.start_event_version == EMPTY_VERSION {
        request.start_event_id = FIRST_EVENT_ID - 1;
        request.start_event_version = first_item.version;
    }
    if request.end_event_id == EMPTY_EVENT_ID || request.end_event_version == EMPTY_VERSION {
        request.end_event_id = last_item.event_id + 1;
        request.end_event_version = last_item.version;
    }
    if request.start_event_id < 0 {
        return Err(HistoryError::invalid(
            "Invalid FirstEventID && NextEventID combination.",
        ));
    }

    let end_is_current_tip =
        request.end_event_id == last_item.event_id + 1 && request.end_event_version == last_item.version;
    if !end_is_current_tip {
        let end_item = VersionHistoryItem::new(request.end_event_id, request.end_event_version);
        let index = version_histories.find_first_version_history_index_by_item(&end_item)?;
        target = version_histories.version_history(index)?;
    }

    let start_is_first =
        request.start_event_id == FIRST_EVENT_ID - 1 && request.start_event_version == first_item.version;
    let start_item = VersionHistoryItem::new(request.start_event_id, request.start_event_version);
    if !start_is_first && !target.contains_item(&start_item) {
        let index = version_histories.find_first_version_history_index_by_item(&start_item)?;
        let lca = target.find_lca_item(version_histories.version_history(index)?)?;
        request.start_event_id = lca.event_id;
        request.start_event_version = lca.version;
    }

    Ok(target.clone())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{EventKind, HistoryEvent, decode_batch};
    use crate::store::MemoryHistoryStore;
    use crate::version_history::BranchToken;
    use chrono::Utc;

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
        HistoryEvent::new(event_id, version, Utc::now(), kind)
    }

    fn id() -> WorkflowIdentifier {
        WorkflowIdentifier::new("d", "wf", "r")
    }

    fn item(event_id: i64, version: i64) -> VersionHistoryItem {
        VersionHistoryItem::new(event_id, version)
    }

    fn append(store: &MemoryHistoryStore, token: &BranchToken, range: std::ops::RangeInclusive<i64>, version: i64) {
        let batch: Vec<_> = range.map(|event_id| event(event_id, version)).collect();
        store.append_history_nodes(token, &batch).unwrap();
    }

    /// Branch 0 (current): 1..=3 @ 10, 4..=6 @ 20.
    /// Branch 1: forked after 3, 4..=5 @ 30.
    fn fixture() -> (MemoryHistoryStore, VersionHistories) {
        let store = MemoryHistoryStore::new();
        let main = store.new_branch().unwrap();
        append(&store, &main, 1..=3, 10);
        append(&store, &main, 4..=6, 20);
        let fork = store.fork_history_branch(&main, 4).unwrap();
        append(&store, &fork, 4..=5, 30);

        let mut histories =
            VersionHistories::new(VersionHistory::new(main, vec![item(3, 10), item(6, 20)]).unwrap());
        histories
            .add_version_history(VersionHistory::new(fork, vec![item(3, 10), item(5, 30)]).unwrap())
            .unwrap();
        (store, histories)
    }

    fn event_ids(blobs: &[DataBlob]) -> Vec<i64> {
        blobs
            .iter()
            .flat_map(|blob| decode_batch(blob).unwrap())
            .map(|event| event.event_id)
            .collect()
    }

    #[test]
    fn unbounded_request_is_rejected() {
        let (store, histories) = fixture();
        let err = read_raw_history(&store, &RawHistoryRequest::new(id(), 10), |_| Ok(histories))
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid argument: Invalid event query range.");
    }

    #[test]
    fn half_set_bound_is_rejected() {
        let (store, histories) = fixture();
        let mut request = RawHistoryRequest::new(id(), 10).with_end(item(6, 20));
        request.start_event_id = 2;
        let err = read_raw_history(&store, &request, |_| Ok(histories)).unwrap_err();
        assert!(err.to_string().contains("start event id and start event version"));
    }

    #[test]
    fn zero_page_size_is_rejected() {
        let (store, histories) = fixture();
        let request = RawHistoryRequest::new(id(), 0).with_start(item(1, 10));
        assert!(read_raw_history(&store, &request, |_| Ok(histories)).is_err());
    }

    #[test]
    fn start_bound_reads_rest_of_current_branch() {
        let (store, histories) = fixture();
        let request = RawHistoryRequest::new(id(), 10).with_start(item(3, 10));
        let response = read_raw_history(&store, &request, |_| Ok(histories.clone())).unwrap();
        assert_eq!(event_ids(&response.blobs), vec![4, 5, 6]);
        assert!(response.next_page_token.is_empty());
        assert_eq!(&response.version_history, histories.version_history(0).unwrap());
    }

    #[test]
    fn end_item_selects_non_current_branch() {
        let (store, histories) = fixture();
        let request = RawHistoryRequest::new(id(), 10).with_end(item(5, 30));
        let response = read_raw_history(&store, &request, |_| Ok(histories.clone())).unwrap();
        assert_eq!(&response.version_history, histories.version_history(1).unwrap());
        // Whole batches overlapping the range.
        assert_eq!(event_ids(&response.blobs), vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn start_on_other_branch_falls_back_to_common_ancestor() {
        let (store, histories) = fixture();
        // (5, 20) only exists on branch 0; reading branch 1 restarts after the fork point.
        let request = RawHistoryRequest::new(id(), 10)
            .with_start(item(5, 20))
            .with_end(item(5, 30));
        let response = read_raw_history(&store, &request, |_| Ok(histories)).unwrap();
        assert_eq!(event_ids(&response.blobs), vec![4, 5]);
    }

    #[test]
    fn adjacent_bounds_are_empty() {
        let (store, histories) = fixture();
        let request = RawHistoryRequest::new(id(), 10)
            .with_start(item(3, 10))
            .with_end(item(4, 20));
        let response = read_raw_history(&store, &request, |_| Ok(histories)).unwrap();
        assert!(response.blobs.is_empty());
        assert!(response.next_page_token.is_empty());
    }

    #[test]
    fn unknown_end_item_is_not_found() {
        let (store, histories) = fixture();
        let request = RawHistoryRequest::new(id(), 10).with_end(item(9, 99));
        let err = read_raw_history(&store, &request, |_| Ok(histories)).unwrap_err();
        assert!(matches!(err, HistoryError::ItemNotFound(_)));
    }

    #[test]
    fn pages_reuse_token_histories() {
        let (store, histories) = fixture();
        let request = RawHistoryRequest::new(id(), 1).with_end(item(7, 20));
        let mut loads = 0;
        let first = read_raw_history(&store, &request, |_| {
            loads += 1;
            Ok(histories.clone())
        })
        .unwrap();
        assert_eq!(event_ids(&first.blobs), vec![1, 2, 3]);
        assert!(!first.next_page_token.is_empty());

        let mut next = request.clone();
        next.next_page_token = first.next_page_token;
        let second = read_raw_history(&store, &next, |_| {
            loads += 1;
            Ok(histories.clone())
        })
        .unwrap();
        assert_eq!(event_ids(&second.blobs), vec![4, 5, 6]);
        assert!(second.next_page_token.is_empty());
        assert_eq!(loads, 1);
    }

    #[test]
    fn token_for_another_request_is_rejected() {
        let (store, histories) = fixture();
        let request = RawHistoryRequest::new(id(), 1).with_end(item(7, 20));
        let first = read_raw_history(&store, &request, |_| Ok(histories.clone())).unwrap();

        let mut other = RawHistoryRequest::new(id(), 1).with_start(item(2, 10));
        other.next_page_token = first.next_page_token;
        let err = read_raw_history(&store, &other, |_| Ok(histories)).unwrap_err();
        assert!(err.to_string().contains("Invalid pagination token."));
    }

    #[test]
    fn garbage_token_is_rejected() {
        let (store, histories) = fixture();
        let mut request = RawHistoryRequest::new(id(), 1).with_end(item(7, 20));
        request.next_page_token = b"not json".to_vec();
        let err = read_raw_history(&store, &request, |_| Ok(histories)).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidArgument);
    }

    #[test]
    fn missing_branch_reads_as_empty() {
        let (_, histories) = fixture();
        let empty_store = MemoryHistoryStore::new();
        let request = RawHistoryRequest::new(id(), 10).with_start(item(3, 10));
        let response = read_raw_history(&empty_store, &request, |_| Ok(histories)).unwrap();
        assert!(response.blobs.is_empty());
    }
}
