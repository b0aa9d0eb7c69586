#![forbid(unsafe_code)]

mod engine;
mod error;
mod message;
mod outbox;
mod snapshot;
mod store;

pub use engine::*;
pub use error::*;
pub use message::*;
pub use outbox::*;
pub use snapshot::*;
pub use store::*;
