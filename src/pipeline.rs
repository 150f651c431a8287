// Copyright 2020 Joyent, Inc.

//! Credit-based request pipelining on top of a `Connection`.
//!
//! Responses carry no correlation with the request that produced them on
//! this path: every complete frame returns one unit of credit and completes
//! the oldest outstanding request, which relies on the peer answering in
//! order on a single stream.
//!
//! Requests in flight when a connection drops are not replayed. The
//! replacement connection starts with full credit and keeps sending until
//! the remaining total has been answered.

use slog::{debug, error, info, warn, Logger};

use crate::codec::{Codec, Reply};
use crate::connection::{Connection, Connector, Fill, State};
use crate::error::Error;
use crate::event_loop::{Poller, Ready};
use crate::report::RunStats;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Budget {
    depth: usize,
    credit: usize,
    total: usize,
    remaining: usize,
}

impl Budget {
    pub fn new(depth: usize, total: usize) -> Budget {
        Budget {
            depth,
            credit: depth,
            total,
            remaining: total,
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn credit(&self) -> usize {
        self.credit
    }

    /// Requests still to be answered.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    pub fn in_flight(&self) -> usize {
        self.depth - self.credit
    }

    /// Take one unit of credit if another request may go out now. Never
    /// puts more requests in flight than are still needed.
    pub fn take(&mut self) -> bool {
        if self.credit > 0 && self.in_flight() < self.remaining {
            self.credit -= 1;
            true
        } else {
            false
        }
    }

    /// Account for one complete response. Returns true once every request
    /// has been answered.
    pub fn complete(&mut self) -> bool {
        self.remaining = self.remaining.saturating_sub(1);
        if self.credit < self.depth {
            self.credit += 1;
        }
        self.remaining == 0
    }

    pub fn reset_credit(&mut self) {
        self.credit = self.depth;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub max_reconnects: Option<u32>,
    pub max_encode_failures: u32,
}

/// What the owner of the event loop has to do next.
#[derive(Debug)]
pub enum Flow {
    /// Wait for the next readiness notification.
    Idle,
    /// A fresh connection is up and the pipe should be filled.
    Connected,
    /// Every request has been answered.
    Finished,
    Aborted(Error),
}

pub struct Pipeline<K: Codec, H> {
    codec: K,
    request: K::Request,
    budget: Budget,
    limits: Limits,
    stats: RunStats,
    encode_failures: u32,
    handler: H,
    log: Logger,
}

impl<K, H> Pipeline<K, H>
where
    K: Codec,
    H: FnMut(&K::Response),
{
    pub fn new(
        codec: K,
        request: K::Request,
        budget: Budget,
        limits: Limits,
        handler: H,
        log: Logger,
    ) -> Pipeline<K, H> {
        Pipeline {
            codec,
            request,
            budget,
            limits,
            stats: RunStats::default(),
            encode_failures: 0,
            handler,
            log,
        }
    }

    pub fn budget(&self) -> &Budget {
        &self.budget
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn start<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        info!(self.log, "connecting"; "address" => %conn.addr());
        let flow = match conn.start(poller) {
            Ok(State::Connected) => Flow::Connected,
            Ok(_) => Flow::Idle,
            Err(e) => {
                error!(self.log, "failed to connect"; "address" => %conn.addr(), "error" => %e);
                Flow::Aborted(Error::Io(e))
            }
        };
        self.settle(flow, conn, poller)
    }

    /// Route one readiness notification for `conn`.
    pub fn on_ready<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P, ready: Ready) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        let flow = match conn.state() {
            State::Disconnected => Flow::Idle,
            State::Connecting if ready.writable || ready.error => self.on_connect_ready(conn, poller),
            State::Connecting => Flow::Idle,
            State::Connected => {
                let mut flow = Flow::Idle;
                if ready.writable {
                    flow = self.on_writable(conn, poller);
                }
                let still_here = matches!(flow, Flow::Idle) && conn.state() == State::Connected;
                if still_here && (ready.readable || ready.error) {
                    flow = self.on_readable(conn, poller);
                }
                flow
            }
        };
        self.settle(flow, conn, poller)
    }

    fn settle<C, P>(&mut self, mut flow: Flow, conn: &mut Connection<C>, poller: &mut P) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        while let Flow::Connected = flow {
            flow = self.on_connected(conn, poller);
        }
        flow
    }

    fn on_connected<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        info!(self.log, "connected";
            "address" => %conn.addr(),
            "remaining" => self.budget.remaining());
        self.top_up(conn, poller).unwrap_or(Flow::Idle)
    }

    fn on_connect_ready<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        match conn.connect_ready(poller) {
            Ok(true) => Flow::Connected,
            Ok(false) => Flow::Idle,
            Err(e) => {
                warn!(self.log, "connect failed"; "address" => %conn.addr(), "error" => %e);
                self.reconnect(conn, poller)
            }
        }
    }

    fn on_writable<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        match conn.write_ready(poller) {
            Ok(()) => Flow::Idle,
            Err(e) => {
                warn!(self.log, "failed to send requests"; "error" => %e);
                self.reconnect(conn, poller)
            }
        }
    }

    fn on_readable<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        let fill = match conn.read_ready() {
            Ok(fill) => fill,
            Err(e) => {
                warn!(self.log, "failed to read responses"; "error" => %e);
                return self.reconnect(conn, poller);
            }
        };

        loop {
            match conn.poll_frame(&self.codec) {
                Ok(Some(_)) => (),
                Ok(None) => break,
                Err(e) => {
                    error!(self.log, "received data that is not a frame"; "error" => %e);
                    return self.reconnect(conn, poller);
                }
            }

            self.stats.responses += 1;
            let finished = self.budget.complete();
            let decoded = match self.codec.decode_response(conn.recv_buf_mut()) {
                Ok(response) => {
                    if response.is_event() {
                        self.stats.events += 1;
                        info!(self.log, "received event frame");
                    } else if !response.is_ok() {
                        self.stats.errors += 1;
                    }
                    (self.handler)(&response);
                    true
                }
                Err(e) => {
                    self.stats.decode_failures += 1;
                    warn!(self.log, "failed to decode response"; "error" => %e);
                    false
                }
            };

            if finished {
                return Flow::Finished;
            }
            if !decoded {
                return self.reconnect(conn, poller);
            }
            if let Some(flow) = self.top_up(conn, poller) {
                return flow;
            }
        }

        conn.compact();
        match fill {
            Fill::Drained => Flow::Idle,
            Fill::PeerClosed => {
                warn!(self.log, "peer closed the connection"; "address" => %conn.addr());
                self.reconnect(conn, poller)
            }
        }
    }

    /// Send requests while credit allows. `Some` means the connection was
    /// replaced or the run ended, and sending has to stop.
    fn top_up<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Option<Flow>
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        while self.budget.take() {
            if let Some(flow) = self.send_one(conn, poller) {
                return Some(flow);
            }
        }
        None
    }

    fn send_one<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Option<Flow>
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        let encoded = match self.codec.encode_request(&self.request) {
            Ok(encoded) => {
                self.encode_failures = 0;
                encoded
            }
            Err(e) => {
                self.encode_failures += 1;
                self.stats.encode_failures += 1;
                error!(self.log, "failed to encode request";
                    "error" => %e,
                    "consecutive" => self.encode_failures);
                if self.encode_failures >= self.limits.max_encode_failures {
                    conn.close(poller);
                    return Some(Flow::Aborted(Error::EncodeLimit(self.encode_failures)));
                }
                return Some(self.reconnect(conn, poller));
            }
        };

        self.stats.requests_sent += 1;
        debug!(self.log, "sending request";
            "bytes" => encoded.readable_bytes(),
            "in_flight" => self.budget.in_flight());
        match conn.send(encoded.peek(), poller) {
            Ok(()) => None,
            Err(e) => {
                warn!(self.log, "failed to send request"; "error" => %e);
                Some(self.reconnect(conn, poller))
            }
        }
    }

    fn reconnect<C, P>(&mut self, conn: &mut Connection<C>, poller: &mut P) -> Flow
    where
        C: Connector,
        P: Poller<C::Socket>,
    {
        self.stats.reconnects += 1;
        if let Some(max) = self.limits.max_reconnects {
            if self.stats.reconnects > max {
                conn.close(poller);
                return Flow::Aborted(Error::ReconnectLimit(max));
            }
        }

        warn!(self.log, "reconnecting";
            "address" => %conn.addr(),
            "reconnects" => self.stats.reconnects,
            "remaining" => self.budget.remaining());
        self.budget.reset_credit();
        match conn.reconnect(poller) {
            Ok(State::Connected) => Flow::Connected,
            Ok(_) => Flow::Idle,
            Err(e) => {
                error!(self.log, "reconnect failed"; "address" => %conn.addr(), "error" => %e);
                Flow::Aborted(Error::Io(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::RefCell;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::rc::Rc;

    use bytes::BytesMut;
    use serde_json::json;
    use slog::{o, Discard};
    use tokio_util::codec::{Decoder, Encoder};

    use crate::connection::mock::*;
    use crate::connection::ConnectProgress;
    use crate::event_loop::Token;
    use crate::protocol::{DubboCodec, Frame, FrameCodec, Invocation, Response, DP_MAX_PAYLOAD};

    /// The far end of one mock wire: decodes what the client wrote and
    /// answers in order when told to.
    struct Peer {
        wire: SharedWire,
        consumed: usize,
        pending: VecDeque<u64>,
        received: usize,
    }

    impl Peer {
        fn new(wire: SharedWire) -> Peer {
            Peer {
                wire,
                consumed: 0,
                pending: VecDeque::new(),
                received: 0,
            }
        }

        fn collect(&mut self) {
            let mut raw = BytesMut::from(&self.wire.borrow().outbound[self.consumed..]);
            while let Some(frame) = FrameCodec.decode(&mut raw).unwrap() {
                self.consumed += frame.encoded_len();
                self.received += 1;
                self.pending.push_back(frame.header.id);
            }
        }

        fn outstanding(&mut self) -> usize {
            self.collect();
            self.pending.len()
        }

        fn answer(&mut self, n: usize) {
            self.collect();
            for _ in 0..n {
                let id = match self.pending.pop_front() {
                    Some(id) => id,
                    None => return,
                };
                let mut out = BytesMut::new();
                FrameCodec
                    .encode(Frame::response(id, Ok(json!(id))).unwrap(), &mut out)
                    .unwrap();
                self.wire.borrow_mut().push(&out);
            }
        }
    }

    type Seen = Rc<RefCell<Vec<u64>>>;

    fn pipeline(
        depth: usize,
        total: usize,
        inv: Invocation,
        limits: Limits,
    ) -> (Pipeline<DubboCodec, impl FnMut(&Response)>, Seen) {
        let seen: Seen = Rc::new(RefCell::new(vec![]));
        let sink = Rc::clone(&seen);
        let handler = move |r: &Response| sink.borrow_mut().push(r.id);
        let log = Logger::root(Discard, o!());
        let p = Pipeline::new(
            DubboCodec::new(),
            inv,
            Budget::new(depth, total),
            limits,
            handler,
            log,
        );
        (p, seen)
    }

    fn echo() -> Invocation {
        Invocation::new("com.example.Echo", "echo", vec![json!("hi")])
    }

    fn unlimited() -> Limits {
        Limits {
            max_reconnects: None,
            max_encode_failures: 3,
        }
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:20880".parse().unwrap()
    }

    #[test]
    fn budget_accounting() {
        let mut b = Budget::new(3, 4);
        assert!(b.take() && b.take() && b.take());
        assert!(!b.take());
        assert_eq!(b.in_flight(), 3);

        assert!(!b.complete());
        assert!(b.take());
        assert!(!b.complete());
        assert!(!b.complete());
        // three answered, one in flight, one still needed: nothing to send
        assert_eq!(b.remaining(), 1);
        assert!(!b.take());
        assert!(b.complete());

        let mut b = Budget::new(2, 10);
        b.take();
        b.reset_credit();
        assert_eq!(b.credit(), 2);
        b.complete();
        assert_eq!(b.credit(), 2);
    }

    #[test]
    fn fills_the_pipe_and_never_exceeds_depth() {
        let mut connector = MockConnector::default();
        let wire = connector.wire(ConnectProgress::Connected);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let mut peer = Peer::new(wire);
        let (mut p, seen) = pipeline(3, 10, echo(), unlimited());

        assert!(matches!(p.start(&mut conn, &mut poller), Flow::Idle));
        assert_eq!(peer.outstanding(), 3);

        let mut rounds = 0;
        loop {
            assert!(peer.outstanding() <= 3);
            peer.answer(1);
            rounds += 1;
            match p.on_ready(&mut conn, &mut poller, Ready::READABLE) {
                Flow::Idle => (),
                Flow::Finished => break,
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(rounds, 10);
        assert_eq!(peer.received, 10);
        assert_eq!(*seen.borrow(), (0..10).collect::<Vec<u64>>());
        assert_eq!(p.stats().responses, 10);
        assert_eq!(p.stats().requests_sent, 10);
        assert_eq!(p.stats().reconnects, 0);
    }

    #[test]
    fn connect_in_progress_defers_sending() {
        let mut connector = MockConnector::default();
        let wire = connector.wire(ConnectProgress::InProgress);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let mut peer = Peer::new(Rc::clone(&wire));
        let (mut p, _seen) = pipeline(2, 2, echo(), unlimited());

        assert!(matches!(p.start(&mut conn, &mut poller), Flow::Idle));
        assert_eq!(peer.outstanding(), 0);

        wire.borrow_mut().connected = true;
        assert!(matches!(
            p.on_ready(&mut conn, &mut poller, Ready::WRITABLE),
            Flow::Idle
        ));
        assert_eq!(peer.outstanding(), 2);

        peer.answer(2);
        assert!(matches!(
            p.on_ready(&mut conn, &mut poller, Ready::READABLE),
            Flow::Finished
        ));
    }

    #[test]
    fn peer_close_reconnects_once_and_completes() {
        let mut connector = MockConnector::default();
        let first = connector.wire(ConnectProgress::Connected);
        let second = connector.wire(ConnectProgress::Connected);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let mut peer = Peer::new(Rc::clone(&first));
        let (mut p, seen) = pipeline(3, 10, echo(), unlimited());

        p.start(&mut conn, &mut poller);
        for _ in 0..4 {
            peer.answer(1);
            assert!(matches!(
                p.on_ready(&mut conn, &mut poller, Ready::READABLE),
                Flow::Idle
            ));
        }
        assert_eq!(seen.borrow().len(), 4);
        assert_eq!(peer.outstanding(), 3);

        first.borrow_mut().inbound.push_back(Chunk::Eof);
        assert!(matches!(
            p.on_ready(&mut conn, &mut poller, Ready::READABLE),
            Flow::Idle
        ));
        assert_eq!(p.stats().reconnects, 1);
        assert_eq!(p.budget().remaining(), 6);

        let mut peer = Peer::new(second);
        assert_eq!(peer.outstanding(), 3);
        loop {
            peer.answer(1);
            match p.on_ready(&mut conn, &mut poller, Ready::READABLE) {
                Flow::Idle => (),
                Flow::Finished => break,
                other => panic!("unexpected {:?}", other),
            }
        }

        assert_eq!(seen.borrow().len(), 10);
        assert_eq!(peer.received, 6);
        assert_eq!(p.stats().reconnects, 1);
        assert_eq!(p.stats().responses, 10);
        assert_eq!(p.stats().requests_sent, 13);
    }

    #[test]
    fn frames_and_close_in_one_notification() {
        let mut connector = MockConnector::default();
        let first = connector.wire(ConnectProgress::Connected);
        let _second = connector.wire(ConnectProgress::Connected);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let mut peer = Peer::new(Rc::clone(&first));
        let (mut p, seen) = pipeline(2, 5, echo(), unlimited());

        p.start(&mut conn, &mut poller);
        peer.answer(2);
        first.borrow_mut().inbound.push_back(Chunk::Eof);
        p.on_ready(&mut conn, &mut poller, Ready::READABLE);

        assert_eq!(seen.borrow().len(), 2);
        assert_eq!(p.stats().reconnects, 1);
    }

    #[test]
    fn invalid_frame_triggers_reconnect() {
        let mut connector = MockConnector::default();
        let first = connector.wire(ConnectProgress::Connected);
        let second = connector.wire(ConnectProgress::Connected);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let (mut p, seen) = pipeline(1, 1, echo(), unlimited());

        p.start(&mut conn, &mut poller);
        first.borrow_mut().push(b"-ERR unknown command\r\n");
        assert!(matches!(
            p.on_ready(&mut conn, &mut poller, Ready::READABLE),
            Flow::Idle
        ));
        assert_eq!(p.stats().reconnects, 1);
        assert!(seen.borrow().is_empty());

        let mut peer = Peer::new(second);
        assert_eq!(peer.outstanding(), 1);
        peer.answer(1);
        assert!(matches!(
            p.on_ready(&mut conn, &mut poller, Ready::READABLE),
            Flow::Finished
        ));
    }

    #[test]
    fn decode_failure_counts_and_reconnects() {
        let mut connector = MockConnector::default();
        let first = connector.wire(ConnectProgress::Connected);
        let _second = connector.wire(ConnectProgress::Connected);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let (mut p, _seen) = pipeline(1, 3, echo(), unlimited());

        p.start(&mut conn, &mut poller);
        let mut bad = BytesMut::new();
        let mut frame = Frame::response(0, Ok(json!(1))).unwrap();
        frame.body = bytes::Bytes::from_static(b"{not json\n");
        frame.header.data_len = frame.body.len();
        FrameCodec.encode(frame, &mut bad).unwrap();
        first.borrow_mut().push(&bad);

        assert!(matches!(
            p.on_ready(&mut conn, &mut poller, Ready::READABLE),
            Flow::Idle
        ));
        assert_eq!(p.stats().decode_failures, 1);
        assert_eq!(p.stats().responses, 1);
        assert_eq!(p.stats().reconnects, 1);
        assert_eq!(p.budget().remaining(), 2);
    }

    #[test]
    fn encode_failures_abort_after_limit() {
        let mut connector = MockConnector::default();
        for _ in 0..3 {
            connector.wire(ConnectProgress::Connected);
        }
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let huge = Invocation::new("svc", "m", vec![json!("x".repeat(DP_MAX_PAYLOAD))]);
        let (mut p, _seen) = pipeline(1, 1, huge, unlimited());

        match p.start(&mut conn, &mut poller) {
            Flow::Aborted(Error::EncodeLimit(3)) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.stats().encode_failures, 3);
        assert_eq!(p.stats().reconnects, 2);
        assert_eq!(conn.state(), State::Disconnected);
    }

    #[test]
    fn reconnect_limit_and_refused_reconnect_abort() {
        let mut connector = MockConnector::default();
        let first = connector.wire(ConnectProgress::Connected);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let mut poller = MockPoller::default();
        let limits = Limits {
            max_reconnects: Some(0),
            max_encode_failures: 3,
        };
        let (mut p, _seen) = pipeline(1, 1, echo(), limits);

        p.start(&mut conn, &mut poller);
        first.borrow_mut().inbound.push_back(Chunk::Eof);
        match p.on_ready(&mut conn, &mut poller, Ready::READABLE) {
            Flow::Aborted(Error::ReconnectLimit(0)) => (),
            other => panic!("unexpected {:?}", other),
        }

        let mut connector = MockConnector::default();
        let first = connector.wire(ConnectProgress::Connected);
        let mut conn = Connection::new(connector, addr(), Token(0));
        let (mut p, _seen) = pipeline(1, 1, echo(), unlimited());
        p.start(&mut conn, &mut poller);
        first.borrow_mut().inbound.push_back(Chunk::Eof);
        match p.on_ready(&mut conn, &mut poller, Ready::READABLE) {
            Flow::Aborted(Error::Io(_)) => (),
            other => panic!("unexpected {:?}", other),
        }
    }
}
