pub mod client;
pub mod server;
pub mod service;

pub use client::{PollReply, SyncClient};
pub use server::SyncListener;
pub use service::SyncService;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("remote error: {0}")]
    Remote(String),
    #[error("malformed message: {0}")]
    Malformed(String),
}
