// Copyright 2025 Integrated Modelling Partnership
// SPDX-License-Identifier: Apache-2.0

//! # klab-observability
//!
//! Logging setup shared by every runtime crate, with per-crate debug flags.
//!
//! ## Features
//! - `file-logging`: JSON log files under a per-run directory

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub mod cli;
pub mod init;

pub use cli::*;
pub use init::*;

/// Log targets used by the runtime crates
pub const KNOWN_CRATES: &[&str] = &[
    "klab-config",
    "klab-geometry",
    "klab-storage",
    "klab-computation",
    "klab-dataflow",
];
