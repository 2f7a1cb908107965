//! Test utilities and fixtures for tabpilot integration tests.
//!
//! This crate provides fluent builders and helper functions to reduce
//! boilerplate when writing tests for tabpilot. It includes:
//!
//! - [`TestDefinitionBuilder`] - Fluent API for constructing test definitions
//! - [`AgentScript`] - Script replayed by the `tabpilot-fake-agent` binary
//! - [`temp_dir`] - Create unique temporary directories
//! - [`workspace`] / [`write_test`] / [`write_config`] - Lay out a workspace on disk
//!
//! # Example
//!
//! ```ignore
//! use tabpilot_fixtures::{temp_dir, workspace, write_test, AgentScript, TestDefinitionBuilder};
//!
//! let dir = temp_dir("login");
//! let tests = workspace(&dir);
//!
//! let test = TestDefinitionBuilder::new("login")
//!     .with_url("https://example.test")
//!     .add_action("click login", "form opens")
//!     .build();
//! write_test(&tests, "login.json", &test);
//!
//! AgentScript::new()
//!     .stdout("STEP_1: click login")
//!     .stdout("STEP_1_PASSED")
//!     .exit(0)
//!     .write(&dir.join("scripts").join("login.json"));
//! ```

// Test fixtures crate - relaxed lints for test utilities
#![allow(clippy::expect_used)]
#![allow(clippy::unwrap_used)]
#![allow(clippy::missing_panics_doc)]
#![allow(missing_docs)]

pub mod builders;
pub mod helpers;

// Re-export commonly used items at crate root
pub use builders::{AgentScript, ScriptStep, TestDefinitionBuilder};
pub use helpers::{
    temp_dir, workspace, write_config, write_environment, write_fixture, write_test,
};
