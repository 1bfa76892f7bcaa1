//! sysgate - authorized systemd unit control
//!
//! A small tool server that lists systemd units and changes their state on
//! behalf of a client, with every call gated by one of three authorization
//! backends.
//!
//! ## Authorization Modes
//!
//! - **Local** (default): polkit decides, prompting for consent when needed
//! - **Remote** (`--listen`): requests carry a bearer token from an OpenID provider
//! - **Disabled** (`--noauth`): everything is allowed
//!
//! ## Transports
//!
//! - stdin/stdout: one JSON request per line, one JSON response per line
//! - TCP (`--listen`): the same protocol, one thread per connection

pub mod auth;
pub mod cli;
pub mod config;
pub mod context;
pub mod dbus;
pub mod error;
pub mod logging;
pub mod output;
pub mod server;
pub mod tools;
pub mod units;

pub use cli::Cli;
pub use error::{BackendError, UnitError};
