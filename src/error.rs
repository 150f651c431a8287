// Copyright 2020 Joyent, Inc.

use std::io;

use thiserror::Error;

use crate::codec::CodecError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    #[error("peer sent bytes that do not start a frame")]
    InvalidFrame,
    #[error("peer closed the connection before a whole response arrived")]
    PeerClosed,
    #[error("timed out waiting for the peer")]
    Timeout,
    #[error("gave up after {0} reconnects")]
    ReconnectLimit(u32),
    #[error("gave up after {0} consecutive encode failures")]
    EncodeLimit(u32),
}
