//! Configuration management for canopy.

mod store;

pub use store::StoreConfig;
