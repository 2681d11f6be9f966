//! Configuration, observability, retry, health and shutdown utilities for twincdc

pub mod config;
pub mod health;
pub mod observability;
pub mod retry;
pub mod shutdown;

pub use config::*;
pub use health::*;
pub use observability::*;
pub use retry::*;
pub use shutdown::*;
