//! Infrastructure layer: process-boundary adapters for the bus, Docker,
//! the store, the vault, configuration, and logging.

pub mod bus;
pub mod config;
pub mod docker;
pub mod logging;
pub mod store;
pub mod vault;
