//! Engine configuration.
//!
//! Values the application provides; nothing here is read from the
//! environment by the engine itself.

/// Tunables shared by the mutation shell and the notification pipeline.
#[derive(Debug, Clone, Copy)]
pub struct EngineConfig {
    /// Merge window for rapid repeated project field updates, in seconds.
    ///
    /// Default: 5 seconds
    pub merge_window_seconds: i64,

    /// Retention window for events and notifications, in days.
    ///
    /// Default: 60 days
    pub retention_days: i64,

    /// Savepoint retries for shared-space identifier allocation before
    /// the conflict is surfaced.
    ///
    /// Default: 3
    pub allocation_retries: u32,
}

impl EngineConfig {
    /// Create a configuration with the default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            merge_window_seconds: 5,
            retention_days: 60,
            allocation_retries: 3,
        }
    }

    /// Set the merge window.
    #[must_use]
    pub const fn with_merge_window_seconds(mut self, seconds: i64) -> Self {
        self.merge_window_seconds = seconds;
        self
    }

    /// Set the retention window.
    #[must_use]
    pub const fn with_retention_days(mut self, days: i64) -> Self {
        self.retention_days = days;
        self
    }

    /// Set the allocation retry bound.
    #[must_use]
    pub const fn with_allocation_retries(mut self, retries: u32) -> Self {
        self.allocation_retries = retries;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}
