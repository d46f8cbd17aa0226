//! In-process version allocator for the in-memory backend.
//!
//! Postgres uses a native sequence per table; this is the equivalent for a
//! single process. Values start at 1 and are never handed out twice.

#[derive(Debug, Default)]
pub struct VersionSequence {
    last: i64,
}

impl VersionSequence {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_value(&mut self) -> i64 {
        self.last += 1;
        self.last
    }

    /// Last value handed out, or 0 before the first call.
    pub fn last_value(&self) -> i64 {
        self.last
    }
}
