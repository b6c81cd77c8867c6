//! Local HTTP and SOCKS5 relay in front of an authenticated upstream proxy.
//!
//! Clients talk to two loopback listeners without credentials; every
//! connection is forwarded to the configured upstream with its
//! username/password injected (Basic auth for HTTP, RFC 1929 for SOCKS5).

pub mod config;
pub mod controller;
pub mod error;
pub mod http;
mod listener;
pub mod registry;
pub mod selftest;
pub mod socks;
pub mod tunnel;
pub mod upstream;

pub use config::{ProxyConfig, RelayOptions, Settings};
pub use controller::{RelayController, RelayStatus, StatusObserver};
pub use error::RelayError;
