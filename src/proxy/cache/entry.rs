use std::sync::atomic::{AtomicBool, Ordering};
use std::time::SystemTime;

use bytes::Bytes;
use http::StatusCode;

use super::CacheKey;
use crate::proxy::headers::HeaderList;

#[derive(Debug)]
pub struct CacheEntry {
    key: CacheKey,
    stored_at: SystemTime,
    expires_at: Option<SystemTime>,
    status: StatusCode,
    reason: String,
    headers: HeaderList,
    body: Option<Bytes>,
    tombstoned: AtomicBool,
}

impl CacheEntry {
    pub fn new(
        key: CacheKey,
        expires_at: Option<SystemTime>,
        status: StatusCode,
        reason: impl Into<String>,
        headers: HeaderList,
        body: Option<Bytes>,
    ) -> Self {
        Self {
            key,
            stored_at: SystemTime::now(),
            expires_at,
            status,
            reason: reason.into(),
            headers,
            body,
            tombstoned: AtomicBool::new(false),
        }
    }

    /// Fresh until tombstoned or past `expires_at`. Entries without an
    /// expiry stay fresh until something tombstones them.
    pub fn is_fresh_at(&self, now: SystemTime) -> bool {
        if self.is_tombstoned() {
            return false;
        }
        match self.expires_at {
            Some(expires_at) => expires_at > now,
            None => true,
        }
    }

    pub fn tombstone(&self) {
        self.tombstoned.store(true, Ordering::Release);
    }

    pub fn is_tombstoned(&self) -> bool {
        self.tombstoned.load(Ordering::Acquire)
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn stored_at(&self) -> SystemTime {
        self.stored_at
    }

    pub fn expires_at(&self) -> Option<SystemTime> {
        self.expires_at
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    pub fn body(&self) -> Option<&Bytes> {
        self.body.as_ref()
    }
}

/// A response being captured while its body streams to the client.
#[derive(Debug)]
pub struct PendingEntry {
    key: CacheKey,
    expires_at: Option<SystemTime>,
    status: StatusCode,
    reason: String,
    headers: HeaderList,
    declared_len: Option<u64>,
    max_size: u64,
    body: Vec<u8>,
}

impl PendingEntry {
    /// Returns `None` when the declared length already exceeds `max_size`.
    pub fn new(
        key: CacheKey,
        expires_at: Option<SystemTime>,
        status: StatusCode,
        reason: impl Into<String>,
        headers: HeaderList,
        declared_len: Option<u64>,
        max_size: u64,
    ) -> Option<Self> {
        if declared_len.is_some_and(|len| len > max_size) {
            return None;
        }
        let capacity = declared_len
            .and_then(|len| usize::try_from(len).ok())
            .unwrap_or_default();
        Some(Self {
            key,
            expires_at,
            status,
            reason: reason.into(),
            headers,
            declared_len,
            max_size,
            body: Vec::with_capacity(capacity),
        })
    }

    /// Appends a body chunk. Returns false once the body outgrows the size
    /// limit; the entry must then be abandoned.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        let new_len = self.body.len() as u64 + chunk.len() as u64;
        if new_len > self.max_size {
            return false;
        }
        self.body.extend_from_slice(chunk);
        true
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    /// Yields the finished entry, or `None` when fewer bytes arrived than
    /// the upstream declared.
    pub fn finish(self) -> Option<CacheEntry> {
        if let Some(declared) = self.declared_len
            && declared != self.body.len() as u64
        {
            return None;
        }
        let body = if self.body.is_empty() && self.declared_len.is_none() {
            None
        } else {
            Some(Bytes::from(self.body))
        };
        Some(CacheEntry::new(
            self.key,
            self.expires_at,
            self.status,
            self.reason,
            self.headers,
            body,
        ))
    }
}
