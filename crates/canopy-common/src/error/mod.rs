//! Error handling for canopy.
//!
//! Every crate in the workspace keeps its own error enum; this module holds
//! the shared [`ErrorCode`] taxonomy those enums classify into, plus the
//! error type used by configuration and other crate-agnostic helpers.

mod canopy;

pub use canopy::{CanopyError, ErrorCode};

/// Result type alias for canopy common operations.
pub type CanopyResult<T> = std::result::Result<T, CanopyError>;
