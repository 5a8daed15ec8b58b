//! Conversion Studio - Core Library
//!
//! Process supervision and streaming engine: keeps the external agent
//! authenticated, runs one conversion job at a time with auth-aware retry,
//! and fans job output and directory changes out to any number of
//! subscribers.

pub mod auth;
pub mod classify;
pub mod config;
pub mod credentials;
pub mod error;
pub mod hub;
pub mod process;
pub mod router;
pub mod supervisor;
pub mod types;
pub mod watcher;

pub use auth::AuthRefreshDaemon;
pub use classify::{FailureClassifier, FailureKind};
pub use config::*;
pub use error::*;
pub use hub::{EventHub, HubEvent, Subscription};
pub use router::OutputStreamRouter;
pub use supervisor::{ProcessSupervisor, SessionHandle};
pub use types::*;
pub use watcher::DirectoryWatcher;
