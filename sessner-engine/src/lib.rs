//! Session isolation engine: partitions one browser profile into
//! independent virtual sessions, each with its own cookie jar, web
//! storage key space and tab affinity.
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

pub use anyhow;
pub use async_trait::async_trait;
pub use chrono;
pub use tokio;
pub use tracing;

pub mod capture;
pub mod config;
pub mod cookie;
pub mod engine;
mod error;
pub mod export;
pub mod host;
pub mod intercept;
pub mod license;
pub mod logger;
pub mod partition;
pub mod persist;
pub mod router;
pub mod scheduler;
pub mod sessions;
pub mod shim;
pub mod store;
pub mod tabs;
pub mod utils;

pub use engine::{Engine, EngineHosts, EnginePhase};
pub use error::{Error, Result};
pub use router::{MessageRouter, Request};
