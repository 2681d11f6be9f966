//! Core event model, event factory, routing and dispatch for twincdc

pub mod consumer;
pub mod error;
pub mod event;
pub mod factory;
pub mod patch;
pub mod queue;
pub mod routing;
pub mod sink;

pub use consumer::*;
pub use error::*;
pub use event::*;
pub use factory::*;
pub use patch::{PatchOpKind, PatchOperation};
pub use queue::*;
pub use routing::*;
pub use sink::*;
