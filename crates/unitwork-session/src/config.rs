//! Session configuration.

use serde::{Deserialize, Serialize};

/// When the session synchronizes in-memory changes with the database.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlushMode {
    /// Flush before queries whose tables have pending changes, and on commit.
    #[default]
    Auto,
    /// Flush only on commit.
    Commit,
    /// Flush before every query, and on commit.
    Always,
    /// Flush only when `flush` is called.
    Manual,
}

impl FlushMode {
    /// Whether commit flushes first.
    pub const fn flushes_on_commit(self) -> bool {
        !matches!(self, FlushMode::Manual)
    }
}

/// Configuration for Session behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    pub flush_mode: FlushMode,
    /// Whether to auto-begin a transaction on the first flush or query.
    pub auto_begin: bool,
    /// Maximum rows per multi-row INSERT or `IN`-list DELETE; 1 disables batching.
    pub batch_size: usize,
    /// Group inserts of the same entity together when dependencies allow.
    pub order_inserts: bool,
    /// Sort updates by table and primary key.
    pub order_updates: bool,
    /// Entities loaded by this session start out read-only.
    pub default_read_only: bool,
    /// Fail when an UPDATE or DELETE touches an unexpected number of rows.
    pub check_row_counts: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            flush_mode: FlushMode::Auto,
            auto_begin: true,
            batch_size: 50,
            order_inserts: true,
            order_updates: true,
            default_read_only: false,
            check_row_counts: true,
        }
    }
}

impl SessionConfig {
    /// Create a configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_mode(mut self, mode: FlushMode) -> Self {
        self.flush_mode = mode;
        self
    }

    pub fn with_auto_begin(mut self, value: bool) -> Self {
        self.auto_begin = value;
        self
    }

    /// Set the batch size. Zero is treated as 1.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_order_inserts(mut self, value: bool) -> Self {
        self.order_inserts = value;
        self
    }

    pub fn with_order_updates(mut self, value: bool) -> Self {
        self.order_updates = value;
        self
    }

    pub fn with_default_read_only(mut self, value: bool) -> Self {
        self.default_read_only = value;
        self
    }

    pub fn with_check_row_counts(mut self, value: bool) -> Self {
        self.check_row_counts = value;
        self
    }

    /// Effective batch size (never zero).
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.max(1)
    }
}
