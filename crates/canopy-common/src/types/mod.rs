//! Type definitions for canopy.
//!
//! This module contains the core identifier and byte wrapper types shared
//! across the workspace.

mod ids;
mod value;

pub use ids::{IndexId, TableId};
pub use value::Value;
