//! Monkey - embeddable HTTP request core with the Duda web services layer
//!
//! This crate turns raw socket bytes into parsed requests, resolves the
//! virtual host and the Duda web service that owns the path, dispatches to
//! the bound service method and drives multi-step response writes from a
//! per-worker event queue.

pub mod config;
pub mod duda;
pub mod http;
