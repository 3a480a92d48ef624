//! Event batch encoding.
//!
//! A batch is the unit of persistence: the events appended together by one
//! transaction, stored as one opaque [`DataBlob`]. Batches are JSON arrays of
//! [`HistoryEvent`]s. Decoding checks that the batch is non-empty and that
//! its event ids are contiguous.

use serde::{Deserialize, Serialize};

use super::HistoryEvent;
use crate::error::{HistoryError, Result};

/// Serialization format of a [`DataBlob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Encoding {
    Json,
}

impl Encoding {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Json => "json",
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = HistoryError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(Self::Json),
            other => Err(HistoryError::invalid(format!("unknown blob encoding '{other}'"))),
        }
    }
}

/// One encoded event batch as stored by a history store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataBlob {
    pub encoding: Encoding,
    pub data: Vec<u8>,
}

impl DataBlob {
    #[must_use]
    pub const fn new(encoding: Encoding, data: Vec<u8>) -> Self {
        Self { encoding, data }
    }

    /// Encoded size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Encode a batch of events.
///
/// # Errors
///
/// Returns [`HistoryError::InvalidArgument`] for an empty or non-contiguous
/// batch and [`HistoryError::Codec`] if serialization fails.
pub fn encode_batch(events: &[HistoryEvent]) -> Result<DataBlob> {
    check_contiguous(events)?;
    let data = serde_json::to_vec(events)?;
    Ok(DataBlob::new(Encoding::Json, data))
}

/// Decode a batch written by [`encode_batch`].
///
/// # Errors
///
/// Returns [`HistoryError::Codec`] for malformed data and
/// [`HistoryError::InvalidArgument`] for an empty or non-contiguous batch.
pub fn decode_batch(blob: &DataBlob) -> Result<Vec<HistoryEvent>> {
    let events: Vec<HistoryEvent> = match blob.encoding {
        Encoding::Json => serde_json::from_slice(&blob.data)?,
    };
    check_contiguous(&events)?;
    Ok(events)
}

fn check_contiguous(events: &[HistoryEvent]) -> Result<()> {
    let Some(first) = events.first() else {
        return Err(HistoryError::invalid("event batch is empty"));
    };
    for (offset, event) in events.iter().enumerate() {
        let expected = first.event_id + i64::try_from(offset).unwrap_or(i64::MAX);
        if event.event_id != expected {
            return Err(HistoryError::invalid(format!(
                "event batch is not contiguous: expected event {expected}, found {}",
                event.event_id
            )));
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
