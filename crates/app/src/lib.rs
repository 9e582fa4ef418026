//! # bandlink-app
//!
//! Application layer: use-cases, **port definitions** (traits) and the
//! tracker protocol itself.
//!
//! ## Responsibilities
//! - Define the **transport port** a radio adapter must implement
//!   (`Transport`: scan, connect, read, write, notifications)
//! - Describe the tracker protocol declaratively (`protocol::table`) and
//!   encode/decode its payloads (`protocol::codec`)
//! - Implement the use-cases on top of a `Session`:
//!   - `discovery`: finite, name-filtered scans
//!   - `auth`: pairing and challenge-response
//!   - `configure`: the ordered settings push
//!   - `telemetry`: live heart rate, stored history, device info
//! - Expose everything through the `Band` facade
//!
//! ## Dependency rule
//! Depends on `bandlink-domain` only (plus `tokio` for timers, locks and tasks).
//! Never imports adapter crates. Adapters depend on *this* crate, not the reverse.

pub mod band;
pub mod ports;
pub mod protocol;
pub mod services;

pub use band::Band;
