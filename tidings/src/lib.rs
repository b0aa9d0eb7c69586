#![forbid(unsafe_code)]

mod broker;
mod cache;
mod command;
mod consumer;
mod context;
mod engine;
mod error;
mod event_bus;
mod projection;
mod registry;
mod relay;
mod restore;
mod transaction;

pub mod config;

pub use broker::*;
pub use cache::*;
pub use command::*;
pub use config::{Config, ConfigBuilder};
pub use consumer::*;
pub use context::*;
pub use engine::*;
pub use error::*;
pub use event_bus::*;
pub use projection::*;
pub use registry::*;
pub use relay::*;
pub use restore::*;
pub use transaction::*;

pub use tidings_store as store;
