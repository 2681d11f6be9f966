//! twincdc process: pipeline wiring and the health endpoint.

pub mod app;
pub mod health_server;
