//! Unified error handling for forgemem
//!
//! Every fallible operation in the crate returns [`MemResult`]. The error enum is
//! split into categories so callers can decide between retrying (capacity,
//! after the garbage collector caught up), fixing their input (user), or
//! treating the failure as fatal (timeout, internal).
//!
//! Programmer errors such as double frees are *not* represented here. They are
//! asserted at the point of detection because continuing would corrupt
//! allocator state.

use std::fmt;
use std::time::Duration;

// Re-export thiserror for convenience
pub use thiserror;

/// Unified error type for forgemem
#[derive(Debug, thiserror::Error)]
pub enum ForgeMemError {
    // ========== Capacity Errors ==========
    /// A pool could not obtain memory for a request
    #[error("Out of GPU memory in pool '{pool}': cannot provide {requested} bytes ({reason})")]
    OutOfMemory {
        pool: String,
        requested: u64,
        reason: String,
    },

    /// The request does not fit any configured size class (a caller bug)
    #[error("Request too large: size={size} alignment={alignment} exceeds the largest size class ({largest} bytes)")]
    RequestTooLarge {
        size: u64,
        alignment: u64,
        largest: u64,
    },

    /// The device refused to create a buffer because its memory is exhausted
    #[error("Device out of memory: requested {requested} bytes, {available} available")]
    DeviceOutOfMemory { requested: u64, available: u64 },

    /// All backing buffers are in use and the configured maximum was reached
    #[error("Backing buffer limit reached: {max_buffers} buffers")]
    BufferLimitReached { max_buffers: usize },

    // ========== Backend Errors ==========
    /// Graphics API failure
    #[error("Device error: {0}")]
    Device(String),

    /// Mapping a buffer into CPU address space failed
    #[error("Buffer mapping failed: {0}")]
    MapFailed(String),

    // ========== Timeout Errors ==========
    /// A fence did not signal within its bound
    #[error("Fence wait timed out after {waited:?}")]
    FenceTimeout { waited: Duration },

    // ========== User Errors ==========
    /// Malformed allocation request (zero size, bad alignment, overflow)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Invalid pool, size class or allocator configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// CPU access requested for memory that is not host-visible
    #[error("Memory is not host-visible: {0}")]
    NotMappable(String),

    // ========== Internal Errors ==========
    /// Internal error (indicates a bug)
    #[error("Internal error: {0}")]
    InternalError(String),

    /// Lock poisoned (a thread panicked while holding allocator state)
    #[error("Internal lock poisoned: {0}")]
    LockPoisoned(String),
}

impl ForgeMemError {
    /// Categorize the error for handling decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            ForgeMemError::InvalidRequest(_)
            | ForgeMemError::RequestTooLarge { .. }
            | ForgeMemError::InvalidConfiguration(_)
            | ForgeMemError::NotMappable(_) => ErrorCategory::User,

            ForgeMemError::OutOfMemory { .. }
            | ForgeMemError::DeviceOutOfMemory { .. }
            | ForgeMemError::BufferLimitReached { .. } => ErrorCategory::Capacity,

            ForgeMemError::Device(_) | ForgeMemError::MapFailed(_) => ErrorCategory::Backend,

            ForgeMemError::FenceTimeout { .. } => ErrorCategory::Timeout,

            ForgeMemError::InternalError(_) | ForgeMemError::LockPoisoned(_) => {
                ErrorCategory::Internal
            }
        }
    }

    /// Check if this error is recoverable
    ///
    /// Capacity errors may succeed once deferred frees are reclaimed; backend
    /// errors may be transient driver conditions. Timeouts are not: the
    /// caller cannot make forward progress without the memory it waited for.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.category(),
            ErrorCategory::Capacity | ErrorCategory::Backend
        )
    }

    /// Check if this is an out-of-memory style failure
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self.category(), ErrorCategory::Capacity)
    }

    /// Check if this is a user-facing error (invalid input or configuration)
    pub fn is_user_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::User)
    }

    /// Check if this is an internal error (indicates a bug)
    pub fn is_internal_error(&self) -> bool {
        matches!(self.category(), ErrorCategory::Internal)
    }
}

/// Error category for handling decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid input or configuration
    User,
    /// Memory exhausted
    Capacity,
    /// Graphics API failure
    Backend,
    /// Bounded wait expired
    Timeout,
    /// Bug or poisoned state
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::User => write!(f, "User"),
            ErrorCategory::Capacity => write!(f, "Capacity"),
            ErrorCategory::Backend => write!(f, "Backend"),
            ErrorCategory::Timeout => write!(f, "Timeout"),
            ErrorCategory::Internal => write!(f, "Internal"),
        }
    }
}

impl<T> From<std::sync::PoisonError<T>> for ForgeMemError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        ForgeMemError::LockPoisoned(err.to_string())
    }
}

/// Result alias used across the crate
pub type MemResult<T> = std::result::Result<T, ForgeMemError>;

/// Create an internal error with context
///
/// # Examples
/// ```ignore
/// return Err(internal_error!("chunk {} has no free slot", index));
/// ```
#[macro_export]
macro_rules! internal_error {
    ($msg:expr) => {
        $crate::error::ForgeMemError::InternalError($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeMemError::InternalError(format!($fmt, $($arg)*))
    };
}

/// Create a backend (device) error with context
///
/// # Examples
/// ```ignore
/// return Err(backend_error!("hipMalloc failed with code {}", code));
/// ```
#[macro_export]
macro_rules! backend_error {
    ($msg:expr) => {
        $crate::error::ForgeMemError::Device($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeMemError::Device(format!($fmt, $($arg)*))
    };
}

/// Create an invalid-request error with context
#[macro_export]
macro_rules! invalid_request {
    ($msg:expr) => {
        $crate::error::ForgeMemError::InvalidRequest($msg.to_string())
    };
    ($fmt:expr, $($arg:tt)*) => {
        $crate::error::ForgeMemError::InvalidRequest(format!($fmt, $($arg)*))
    };
}
