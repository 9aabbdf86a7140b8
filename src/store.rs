//! Versioned document store contract and an in-memory reference
//! implementation.
//!
//! The coordinator assumes nothing of the store beyond optimistic
//! concurrency per document: every read returns a version token, every write
//! must present the token from the read it is based on, and a write against
//! a stale token fails with a conflict instead of clobbering. No transactions
//! across job ids.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use thiserror::Error;

use crate::document::JobStateDoc;

/// Opaque version pair returned by every store read and required by every
/// write. The coordinator compares tokens only for equality; the components
/// carry no meaning outside the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct VersionToken {
    term: i64,
    seq: i64,
}

impl VersionToken {
    pub fn new(term: i64, seq: i64) -> Self {
        Self { term, seq }
    }
}

impl std::fmt::Display for VersionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.term, self.seq)
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("read failure: {0}")]
    ReadFailure(String),
    #[error("write failure: {0}")]
    WriteFailure(String),
    #[error("version conflict")]
    VersionConflict,
    #[error("job not found: {0}")]
    NotFound(String),
}

impl StoreError {
    /// Conflicts get dedicated handling everywhere; everything else is a
    /// transient infrastructure problem.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict)
    }
}

/// Get/compare-and-swap interface against the durable document store, keyed
/// by job id.
#[async_trait]
pub trait VersionedStore: Send + Sync {
    /// Read the current document and its version token.
    async fn get(&self, job_id: &str) -> Result<(JobStateDoc, VersionToken), StoreError>;

    /// Replace the document if `expected` still matches the stored token.
    /// Returns the token of the new version on success.
    async fn update(
        &self,
        job_id: &str,
        doc: &JobStateDoc,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError>;
}

/// HashMap-backed store used by tests and the simulator. Documents are held
/// in their wire encoding so every round trip exercises the codec.
pub struct MemoryStore {
    term: i64,
    seq: AtomicI64,
    docs: Mutex<HashMap<String, (Vec<u8>, VersionToken)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            term: 1,
            seq: AtomicI64::new(0),
            docs: Mutex::new(HashMap::new()),
        }
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn next_token(&self) -> VersionToken {
        VersionToken::new(self.term, self.seq.fetch_add(1, Ordering::SeqCst))
    }

    /// Submission path: create the document for a new job id.
    pub fn insert(&self, job_id: &str, doc: &JobStateDoc) -> Result<VersionToken, StoreError> {
        let raw = doc
            .to_bytes()
            .map_err(|e| StoreError::WriteFailure(e.to_string()))?;
        let mut docs = self.docs.lock().unwrap();
        if docs.contains_key(job_id) {
            return Err(StoreError::WriteFailure(format!(
                "job already exists: {job_id}"
            )));
        }
        let token = self.next_token();
        docs.insert(job_id.to_string(), (raw, token));
        Ok(token)
    }

    /// Current document without a token, for assertions and status polling.
    pub fn snapshot(&self, job_id: &str) -> Option<JobStateDoc> {
        let docs = self.docs.lock().unwrap();
        let (raw, _) = docs.get(job_id)?;
        JobStateDoc::from_bytes(raw).ok()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VersionedStore for MemoryStore {
    async fn get(&self, job_id: &str) -> Result<(JobStateDoc, VersionToken), StoreError> {
        let docs = self.docs.lock().unwrap();
        let (raw, token) = docs
            .get(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        let doc =
            JobStateDoc::from_bytes(raw).map_err(|e| StoreError::ReadFailure(e.to_string()))?;
        Ok((doc, *token))
    }

    async fn update(
        &self,
        job_id: &str,
        doc: &JobStateDoc,
        expected: VersionToken,
    ) -> Result<VersionToken, StoreError> {
        let raw = doc
            .to_bytes()
            .map_err(|e| StoreError::WriteFailure(e.to_string()))?;
        let mut docs = self.docs.lock().unwrap();
        let entry = docs
            .get_mut(job_id)
            .ok_or_else(|| StoreError::NotFound(job_id.to_string()))?;
        if entry.1 != expected {
            return Err(StoreError::VersionConflict);
        }
        let token = self.next_token();
        *entry = (raw, token);
        Ok(token)
    }
}
