// Copyright 2020 Joyent, Inc.

//! dubbo-bench: a pipelined load generator for Dubbo RPC providers
//!
//! A benchmark run drives one TCP connection from a single-threaded
//! readiness loop. Up to `pipeline_depth` requests are kept in flight; every
//! complete response frame returns one unit of credit and the next request
//! goes out, until `total_requests` responses have arrived. A connection
//! that fails mid-run is replaced and the run carries on with the requests
//! that are still owed. A blocking path (`client::invoke_sync`) makes single
//! calls without the event loop.
//!
//! Protocol definition
//!
//! Dubbo frames have the following structure:
//!
//! ```text
//!  0      2      3        4                  12          16
//!  +------+------+--------+------------------+-----------+---------...
//!  | 0xda | 0xbb |  FLAG  | STATUS |   ID    |  DATALEN  |  DATA
//!  +------+------+--------+------------------+-----------+---------...
//! ```
//!
//! * MAGIC      2 bytes, always `0xdabb`.
//!
//! * FLAG       1 byte. The high bits mark the frame:
//!
//!     * 0x80  request (clear in responses)
//!
//!     * 0x40  two-way: the sender expects a response
//!
//!     * 0x20  event, e.g. a heartbeat
//!
//!   The low 5 bits carry the serialization id. The only supported value is
//!   6, fastjson.
//!
//! * STATUS     1 byte, meaningful in responses only. 20 means OK.
//!
//! * ID         8-byte big-endian request id, scoped to the connection and
//!              echoed in the response.
//!
//! * DATALEN    4-byte big-endian length of the data payload, at most 8 MiB.
//!
//! * DATA       fastjson body: one JSON value per line. A request carries the
//!              dubbo version, service path, service version, method name,
//!              parameter type descriptor, each argument, and an attachments
//!              object. A successful response carries a response flag
//!              followed by the value or exception and optionally
//!              attachments; a failed one carries an error message.
//!
//! Responses are matched to requests by arrival order, not by id.

#![allow(missing_docs)]

pub mod buffer;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod event_loop;
pub mod pipeline;
pub mod protocol;
pub mod report;
pub mod server;
