//! Core library for postguard. This module wires together the policy
//! session engine, the plugin chain, the worker pools and the server
//! lifecycle. The daemon speaks the Postfix policy delegation protocol:
//! `key=value` attribute blocks in, a single `action=<verdict>` line out.

pub mod addrcheck;
pub mod config;
pub mod controller;
pub mod plugins;
pub mod procpool;
pub mod server;
pub mod session;
pub mod stats;
pub mod suspect;
pub mod threadpool;

pub use config::{Config, ConfigError, ConfigVar};
pub use controller::{parse_incoming_ports, ActivePool, MainController, PoolBackend, PortBinding};
pub use plugins::Plugin;
pub use session::{SessionHandler, SessionOutcome};
pub use suspect::{Action, Decision, Suspect, Verdict};
