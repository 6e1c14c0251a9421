//! Session lifecycle core for the PumpGuard operations dashboard.
//!
//! The dashboard itself (forms, views, CSV export) lives elsewhere; this
//! crate owns the one stateful piece it depends on: establishing, caching,
//! refreshing, and tearing down the authenticated session against the
//! remote identity provider and profile store.

pub mod cli;
pub mod provider;
pub mod session;
pub mod storage;
