//! Application services: use-case implementations.
//!
//! Every service is a set of free functions over a [`session::Session`], which
//! is generic over the [`Transport`](crate::ports::Transport) port, so this
//! layer stays decoupled from concrete radios.

pub mod auth;
pub mod cipher;
pub mod configure;
pub mod discovery;
pub mod session;
pub mod telemetry;
