// Copyright 2020 Joyent, Inc.

//! The boundary between the transport and a wire codec.
//!
//! The connection never interprets frame contents itself. It asks a
//! `FrameDetector` whether the bytes buffered so far could be a frame and
//! whether a whole frame is present, and only then hands the receive buffer
//! to `Codec::decode_response`, which consumes exactly one frame.

use std::io;

use thiserror::Error;

use crate::buffer::{Buffer, RangeError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// At least `needed` more bytes must arrive before the frame is whole.
    Incomplete { needed: usize },
    /// The first `len` buffered bytes are one whole frame.
    Complete { len: usize },
}

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode request: {0}")]
    Encode(String),
    #[error("failed to decode response: {0}")]
    Decode(String),
    #[error("not a valid frame: {0}")]
    InvalidFrame(String),
    #[error("frame incomplete, {needed} more bytes needed")]
    Incomplete { needed: usize },
    #[error(transparent)]
    Range(#[from] RangeError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Frame boundary detection. Neither method consumes bytes.
pub trait FrameDetector {
    /// Cheap structural check of whatever prefix is buffered.
    fn looks_like_frame(&self, buf: &[u8]) -> bool;

    /// Whether a whole frame is at the front of `buf`.
    fn frame_status(&self, buf: &[u8]) -> FrameStatus;
}

/// What the transport needs to know about a decoded response.
pub trait Reply {
    fn is_ok(&self) -> bool;

    /// Heartbeats and other frames not produced by a request.
    fn is_event(&self) -> bool;
}

pub trait Codec: FrameDetector {
    type Request;
    type Response: Reply;

    /// Encode one request into a fresh buffer.
    fn encode_request(&mut self, req: &Self::Request) -> Result<Buffer, CodecError>;

    /// Decode the frame at the front of `buf`, retrieving exactly its bytes on
    /// success.
    fn decode_response(&mut self, buf: &mut Buffer) -> Result<Self::Response, CodecError>;
}
