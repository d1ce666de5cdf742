//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Running the gateway server
//! - Listing and checking the configured models

pub mod commands;
pub mod handlers;

pub use handlers::{handle_models, handle_server};
