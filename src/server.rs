// Copyright 2020 Joyent, Inc.

//! A minimal Dubbo provider on tokio, for exercising the client.
//!
//! Each accepted socket is served by `make_task`: requests are decoded off
//! the stream, handed to a user function, and answered in the order they
//! arrived. Heartbeat requests are answered without consulting the handler.

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use slog::{debug, error, o, warn, Drain, Logger};
use tokio::net::TcpStream;
use tokio_util::codec::Decoder;

use crate::codec::CodecError;
use crate::protocol::{Frame, FrameCodec, Invocation};

/// Serve one connection until the peer goes away.
pub async fn make_task<F>(socket: TcpStream, handler: F, log: Option<&Logger>)
where
    F: Fn(&Invocation, &Logger) -> Result<Value, String>,
{
    let log = log
        .cloned()
        .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
    if let Ok(peer) = socket.peer_addr() {
        debug!(log, "accepted connection"; "peer" => %peer);
    }

    let (mut tx, mut rx) = FrameCodec.framed(socket).split();
    while let Some(next) = rx.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                error!(log, "failed to read request"; "err" => %e);
                break;
            }
        };
        match respond(frame, &handler, &log) {
            Ok(Some(reply)) => {
                if let Err(e) = tx.send(reply).await {
                    error!(log, "failed to send response"; "err" => %e);
                    break;
                }
            }
            Ok(None) => (),
            Err(e) => {
                error!(log, "failed to encode response"; "err" => %e);
                break;
            }
        }
    }
    debug!(log, "connection closed");
}

/// Produce the reply to one incoming frame, if it wants one.
pub fn respond<F>(frame: Frame, handler: &F, log: &Logger) -> Result<Option<Frame>, CodecError>
where
    F: Fn(&Invocation, &Logger) -> Result<Value, String>,
{
    let header = &frame.header;
    if !header.is_request() {
        warn!(log, "ignoring frame that is not a request"; "id" => header.id);
        return Ok(None);
    }
    if header.is_event() {
        debug!(log, "heartbeat"; "id" => header.id);
        if header.is_two_way() {
            return Ok(Some(Frame::heartbeat_response(header.id)));
        }
        return Ok(None);
    }

    let result = match frame.invocation() {
        Ok(inv) => {
            debug!(log, "handling request";
                "id" => header.id,
                "service" => &inv.service,
                "method" => &inv.method);
            handler(&inv, log)
        }
        Err(e) => {
            warn!(log, "bad request"; "id" => header.id, "err" => %e);
            Err(format!("bad request: {}", e))
        }
    };

    if !header.is_two_way() {
        return Ok(None);
    }
    Frame::response(header.id, result).map(Some)
}
