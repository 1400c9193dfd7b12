//! ADB bridge and streaming patch pipeline for downgrading an installed
//! Quest application.
//!
//! - [`adb`]: wire protocol, USB/TCP connections, key authentication and
//!   the multiplexed transport
//! - [`bridge`]: the session manager that acquires those resources lazily
//! - [`services`]: remote shell and file sync on top of a session
//! - [`manifest`] and [`resolver`]: which downgrade applies to what is
//!   installed
//! - [`patch`]: worker, output sink and the pipeline tying it together

pub mod adb;
pub mod bridge;
pub mod config;
pub mod error;
pub mod manifest;
pub mod patch;
pub mod resolver;
pub mod services;

pub use bridge::{SessionManager, SessionStage};
pub use config::Config;
pub use error::{BridgeError, Result};
