//! The valet control plane: client registry, WebSocket gateway, session
//! service, and daemon/CLI plumbing.

pub mod cli;
pub mod daemon;
pub mod gateway;
pub mod service;
