//! # bandlink-domain
//!
//! Pure domain model for talking to a Mi Band 3 class fitness tracker.
//!
//! ## Responsibilities
//! - Foundational types: device addresses, authentication keys, timestamps, error conventions
//! - Define **Devices** (discovered trackers and the handle that carries their key)
//! - Define the **Session State** that gates every device operation
//! - Define **Profiles** and **Preferences** pushed during configuration
//! - Define **Telemetry Samples** returned by live and historical reads
//! - Contain all invariant enforcement (quiet hours, screen layouts, profile ranges)
//!
//! ## Dependency rule
//! This crate has **no internal dependencies**.
//! It must never import anything from `app`, adapters, or external IO crates.
//! All IO boundaries are expressed as traits in the `app` crate (ports).

pub mod address;
pub mod error;
pub mod key;
pub mod time;

pub mod configuration;
pub mod device;
pub mod preferences;
pub mod profile;
pub mod session;
pub mod telemetry;
