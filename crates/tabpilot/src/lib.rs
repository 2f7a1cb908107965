//! Tabpilot: parallel browser-test orchestration.
//!
//! This crate turns the text output of browser-driving test agents into typed
//! progress events and coordinates many concurrent test runs, each backed by
//! its own agent process and browser tab.
//!
//! The pieces, leaf to root:
//!
//! - [`parser`] decodes raw stdout/stderr chunks into [`parser::LogEvent`]s
//! - [`execution`] tracks one run's lifecycle as a state machine
//! - [`coordinator`] launches batches, multiplexes process I/O, and routes
//!   derived [`model::SinkEvent`]s to an [`sink::EventSink`]
//!
//! Processes, browser tabs, frame capture, and test definitions are reached
//! through the capability traits in [`process`], [`browser`], and [`store`].

#![forbid(unsafe_code)]
// Library documentation is in progress. Public API types have docs;
// internal types will be documented in future releases.
#![allow(missing_docs)]

pub mod browser;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod execution;
pub mod model;
pub mod parser;
pub mod process;
pub mod sink;
pub mod store;

pub use crate::error::{Error, ErrorCode, Result};
pub use crate::model::*;
