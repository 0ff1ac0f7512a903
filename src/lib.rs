//! Deferred payment capture for editable orders.
//!
//! Orders stay editable for an hour after checkout. The payment
//! authorization is captured when that window closes, or immediately when the
//! order is fulfilled first. Capture and order edits exclude each other
//! through a lock stored on the order.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod capture;
pub mod commands;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod metrics;
pub mod services;

pub use handlers::{app_router, AppState};
