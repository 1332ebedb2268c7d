//! Batch Envelopes
//!
//! One flush-worth of buffered mutations. `PushBatch` is the two-collection
//! shape used by push sources; `StreamBatch` adds partial updates for
//! stream sources. The serialized batch IS the upload payload: named arrays
//! `addOrUpdate`, `delete`, and (stream only) `partialUpdate`.
//!
//! The two shapes are distinct types on purpose. Code holding a stream
//! batch cannot hand it to anything expecting the push shape, so the
//! mismatch is caught at compile time rather than at upload time.

use crate::mutation::{Document, DocumentDelete, PartialUpdate};
use serde::{Deserialize, Serialize};

/// Batch shape for push sources: upserts and deletes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBatch {
    pub add_or_update: Vec<Document>,
    pub delete: Vec<DocumentDelete>,
}

impl PushBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff every collection is empty
    pub fn is_empty(&self) -> bool {
        self.add_or_update.is_empty() && self.delete.is_empty()
    }

    /// Number of buffered records across all collections
    pub fn record_count(&self) -> usize {
        self.add_or_update.len() + self.delete.len()
    }

    /// Drop all buffered records
    pub fn clear(&mut self) {
        self.add_or_update.clear();
        self.delete.clear();
    }

    /// Serialize the envelope the upload step sends
    pub fn to_envelope(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Batch shape for stream sources: upserts, deletes, and partial updates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamBatch {
    pub add_or_update: Vec<Document>,
    pub delete: Vec<DocumentDelete>,
    pub partial_update: Vec<PartialUpdate>,
}

impl StreamBatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff every collection is empty
    pub fn is_empty(&self) -> bool {
        self.add_or_update.is_empty() && self.delete.is_empty() && self.partial_update.is_empty()
    }

    /// Number of buffered records across all collections
    pub fn record_count(&self) -> usize {
        self.add_or_update.len() + self.delete.len() + self.partial_update.len()
    }

    /// Drop all buffered records
    pub fn clear(&mut self) {
        self.add_or_update.clear();
        self.delete.clear();
        self.partial_update.clear();
    }

    /// Serialize the envelope the upload step sends
    pub fn to_envelope(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
