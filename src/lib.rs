//! Redreach — the rate-limited Reddit integration core of an outreach product.
//!
//! Discovers candidate contacts for an opportunity and delivers direct
//! messages on a user's behalf, while a persistent quota layer keeps both the
//! user's Reddit account and the app's API allowance clear of ban territory.
//! Dashboards, billing, and message composition live elsewhere and drive this
//! crate through plain request/response calls.
//!
//! See `DESIGN.md` for full architecture documentation.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod backoff;
pub mod config;
pub mod credentials;
pub mod logging;
pub mod quota;
pub mod store;

pub mod reddit;

pub mod delivery;
pub mod discovery;
