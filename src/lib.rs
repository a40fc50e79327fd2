//! Hands the MTA's `local_scan` decision to a rhai script.
//!
//! The host builds a [`LocalScanner`] once with its [`HostServices`] and
//! calls [`LocalScanner::scan`] for every message. The script sees the
//! message's headers, recipients and metadata through `this`, calls back
//! into the host through the `exim` module, and returns a decision code.

pub mod api;
pub mod child;
pub mod config;
pub mod constants;
pub mod decision;
pub mod engine;
pub mod error;
pub mod format;
pub mod host;
pub mod message;
pub mod recipients;
pub mod scanner;
pub mod session;
pub mod snapshot;
pub mod standalone;

pub use config::{BridgeConfig, FailurePolicy};
pub use decision::Verdict;
pub use error::BridgeError;
pub use host::HostServices;
pub use message::{HeaderLine, Message, MessageInfo, Recipient};
pub use scanner::LocalScanner;
