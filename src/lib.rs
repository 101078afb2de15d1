//! Spectrec - spectator endpoint recorder and replay server
//!
//! Records live spectator sessions into self-contained append-only files
//! and replays them to spectator clients by impersonating the upstream
//! endpoint's HTTP API.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, clippy::all, clippy::pedantic, clippy::cargo)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::cast_possible_truncation,
    clippy::cast_possible_wrap,
    clippy::cast_sign_loss,
    clippy::missing_errors_doc,
    clippy::multiple_crate_versions
)]

pub mod config;
pub mod error;
pub mod monitor;
pub mod record;
pub mod registry;
pub mod replay;
pub mod server;
pub mod storage;

pub use error::{Result, SpectrecError};
