//! Devgate - A development proxy that starts applications on demand
//!
//! This library maps request hosts to applications living under a host root
//! directory and hands out connections to them:
//! - Directories are served by worker processes spawned on first use, each
//!   listening on a private Unix socket
//! - Files holding a port number are forwarded to `localhost:<port>`
//! - Workers restart when `tmp/restart.txt` is touched or while
//!   `tmp/always_restart.txt` exists
//! - Idle applications have their workers killed after a configurable timeout

pub mod app;
pub mod config;
pub mod error;
pub mod monitor;
pub mod proxy;
pub mod registry;
pub mod resolver;
pub mod worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");
