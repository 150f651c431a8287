// Copyright 2020 Joyent, Inc.

//! Client entry points.
//!
//! `run_async` sets up one pipelined benchmark run on a caller-owned
//! `EventLoop` and returns as soon as the connect has been issued; the loop
//! then drives the run to completion and stops itself. Several runs can
//! share one loop through a `Fleet`, each on its own token. `invoke_sync` is an
//! independent blocking path for one-shot calls that never touches the
//! event loop.

use std::io::{self, ErrorKind, Read, Write};

use slog::{debug, info, o, Drain, Logger};
use socket2::{Domain, Protocol, SockAddr, Socket, Type};

use crate::buffer::Buffer;
use crate::codec::{Codec, FrameStatus, Reply};
use crate::config::ClientConfig;
use crate::connection::{Connection, Connector, TcpConnector};
use crate::error::Error;
use crate::event_loop::{EventLoop, Handler, Poller, Ready, Shared, Token};
use crate::pipeline::{Budget, Flow, Limits, Pipeline};
use crate::protocol::{DubboCodec, Response};
use crate::report::{RunReport, RunStats, Timing};

fn fallback_logger() -> Logger {
    Logger::root(slog_stdlog::StdLog.fuse(), o!())
}

/// One benchmark run: a connection, the controller feeding it, and the
/// outcome once the run is over.
pub struct BenchClient<C: Connector, K: Codec, H> {
    conn: Connection<C>,
    pipeline: Pipeline<K, H>,
    timing: Timing,
    outcome: Option<Result<RunReport, Error>>,
    log: Logger,
}

impl<C, K, H> BenchClient<C, K, H>
where
    C: Connector,
    K: Codec,
    H: FnMut(&K::Response),
{
    /// Record the start time and issue the connect. Fails only if the run
    /// could not get started at all.
    pub fn launch<P>(
        mut conn: Connection<C>,
        mut pipeline: Pipeline<K, H>,
        poller: &mut P,
        log: Logger,
    ) -> Result<BenchClient<C, K, H>, Error>
    where
        P: Poller<C::Socket>,
    {
        let timing = Timing::start();
        info!(log, "starting run";
            "address" => %conn.addr(),
            "pipeline_depth" => pipeline.budget().depth(),
            "total_requests" => pipeline.budget().total());

        let flow = pipeline.start(&mut conn, poller);
        let mut client = BenchClient {
            conn,
            pipeline,
            timing,
            outcome: None,
            log,
        };
        client.conclude(flow, poller);
        match client.outcome.take() {
            Some(Err(e)) => Err(e),
            outcome => {
                client.outcome = outcome;
                Ok(client)
            }
        }
    }

    pub fn is_done(&self) -> bool {
        self.outcome.is_some()
    }

    /// The token the connection is registered under.
    pub fn token(&self) -> Token {
        self.conn.token()
    }

    pub fn stats(&self) -> &RunStats {
        self.pipeline.stats()
    }

    /// The outcome of a finished run. `None` while it is still going.
    pub fn take_outcome(&mut self) -> Option<Result<RunReport, Error>> {
        self.outcome.take()
    }

    fn conclude<P>(&mut self, flow: Flow, poller: &mut P)
    where
        P: Poller<C::Socket>,
    {
        let outcome = match flow {
            Flow::Idle | Flow::Connected => return,
            Flow::Finished => {
                let budget = self.pipeline.budget();
                let report =
                    self.timing
                        .finish(budget.depth(), budget.total(), self.pipeline.stats().clone());
                info!(self.log, "run finished";
                    "responses" => report.stats.responses,
                    "reconnects" => report.stats.reconnects,
                    "elapsed_ms" => report.elapsed.as_millis() as u64,
                    "throughput" => report.throughput());
                Ok(report)
            }
            Flow::Aborted(e) => {
                info!(self.log, "run aborted"; "error" => %e);
                Err(e)
            }
        };
        self.conn.close(poller);
        poller.stop();
        self.outcome = Some(outcome);
    }
}

impl<C, K, H, P> Handler<P> for BenchClient<C, K, H>
where
    C: Connector,
    K: Codec,
    H: FnMut(&K::Response),
    P: Poller<C::Socket>,
{
    fn on_ready(&mut self, poller: &mut P, token: Token, ready: Ready) {
        if token != self.conn.token() || self.is_done() {
            return;
        }
        let flow = self.pipeline.on_ready(&mut self.conn, poller, ready);
        self.conclude(flow, poller);
    }
}

/// Several benchmark runs sharing one event loop. Readiness is routed to
/// the run owning the token, and the loop stops once every run is over.
pub struct Fleet<C: Connector, K: Codec, H> {
    clients: Vec<BenchClient<C, K, H>>,
}

impl<C, K, H> Fleet<C, K, H>
where
    C: Connector,
    K: Codec,
    H: FnMut(&K::Response),
{
    pub fn new() -> Fleet<C, K, H> {
        Fleet { clients: vec![] }
    }

    pub fn push(&mut self, client: BenchClient<C, K, H>) {
        self.clients.push(client);
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn is_done(&self) -> bool {
        self.clients.iter().all(BenchClient::is_done)
    }

    /// Outcomes in the order the runs were added.
    pub fn take_outcomes(&mut self) -> Vec<Option<Result<RunReport, Error>>> {
        self.clients.iter_mut().map(BenchClient::take_outcome).collect()
    }
}

impl<C, K, H> Default for Fleet<C, K, H>
where
    C: Connector,
    K: Codec,
    H: FnMut(&K::Response),
{
    fn default() -> Self {
        Fleet::new()
    }
}

impl<C, K, H, P> Handler<P> for Fleet<C, K, H>
where
    C: Connector,
    K: Codec,
    H: FnMut(&K::Response),
    P: Poller<C::Socket>,
{
    fn on_ready(&mut self, poller: &mut P, token: Token, ready: Ready) {
        {
            let mut shared = Shared::new(&mut *poller);
            if let Some(client) = self.clients.iter_mut().find(|c| c.token() == token) {
                client.on_ready(&mut shared, token, ready);
            }
        }
        if self.is_done() {
            poller.stop();
        }
    }
}

/// Start a pipelined benchmark run of `config` on `event_loop`.
///
/// Returns once the connect has been issued. Run the loop with the returned
/// client as its handler; it stops the loop when every request has been
/// answered or the run is abandoned. `handler` sees every decoded response.
/// The connection gets a fresh token from the loop, so runs started on the
/// same loop never share one.
pub fn run_async<H>(
    event_loop: &mut EventLoop,
    config: &ClientConfig,
    handler: H,
    log: Option<&Logger>,
) -> Result<BenchClient<TcpConnector, DubboCodec, H>, Error>
where
    H: FnMut(&Response),
{
    let log = log.cloned().unwrap_or_else(fallback_logger);
    config.validate()?;
    let addr = config.resolve()?;

    let conn = Connection::new(TcpConnector, addr, event_loop.next_token());
    let pipeline = Pipeline::new(
        DubboCodec::new(),
        config.invocation.clone(),
        Budget::new(config.pipeline_depth, config.total_requests),
        Limits {
            max_reconnects: config.max_reconnects,
            max_encode_failures: config.max_encode_failures,
        },
        handler,
        log.new(o!("method" => config.invocation.method.clone())),
    );
    BenchClient::launch(conn, pipeline, event_loop, log)
}

/// Run a whole benchmark on a private event loop and return its report.
pub fn bench<H>(config: &ClientConfig, handler: H, log: Option<&Logger>) -> Result<RunReport, Error>
where
    H: FnMut(&Response),
{
    let mut event_loop = EventLoop::new()?;
    let mut client = run_async(&mut event_loop, config, handler, log)?;
    event_loop.run(&mut client)?;
    client.take_outcome().unwrap_or_else(|| {
        let msg = "event loop stopped before the run finished";
        Err(Error::Io(io::Error::new(ErrorKind::Other, msg)))
    })
}

fn classify(e: io::Error) -> Error {
    match e.kind() {
        ErrorKind::WouldBlock | ErrorKind::TimedOut => Error::Timeout,
        _ => Error::Io(e),
    }
}

/// Make one call over a fresh blocking connection and wait for its response.
pub fn invoke_sync(config: &ClientConfig, log: Option<&Logger>) -> Result<Response, Error> {
    let log = log.cloned().unwrap_or_else(fallback_logger);
    config.validate()?;
    let addr = config.resolve()?;
    let timeout = config.timeout();

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket
        .connect_timeout(&SockAddr::from(addr), timeout)
        .map_err(classify)?;
    socket.set_read_timeout(Some(timeout))?;
    socket.set_write_timeout(Some(timeout))?;
    socket.set_nodelay(true)?;
    debug!(log, "connected"; "address" => %addr);

    let stream: std::net::TcpStream = socket.into();
    let response = exchange(stream, DubboCodec::new(), &config.invocation)?;
    debug!(log, "received response"; "id" => response.id, "ok" => response.ok);
    Ok(response)
}

/// Write one request to `stream` and read until its response is whole.
/// Event frames arriving first are skipped. The stream is dropped before
/// returning.
pub fn exchange<S, K>(mut stream: S, mut codec: K, request: &K::Request) -> Result<K::Response, Error>
where
    S: Read + Write,
    K: Codec,
{
    let encoded = codec.encode_request(request)?;
    stream.write_all(encoded.peek()).map_err(classify)?;
    stream.flush().map_err(classify)?;

    let mut buf = Buffer::new();
    loop {
        if !codec.looks_like_frame(buf.peek()) {
            return Err(Error::InvalidFrame);
        }
        if let FrameStatus::Complete { .. } = codec.frame_status(buf.peek()) {
            let response = codec.decode_response(&mut buf)?;
            if response.is_event() {
                continue;
            }
            return Ok(response);
        }
        match buf.read_from(&mut stream) {
            Ok(0) => return Err(Error::PeerClosed),
            Ok(_) => (),
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(classify(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::cell::Cell;
    use std::collections::VecDeque;
    use std::net::SocketAddr;
    use std::rc::Rc;

    use bytes::BytesMut;
    use serde_json::json;
    use slog::Discard;
    use tokio_util::codec::{Decoder, Encoder};

    use crate::connection::mock::*;
    use crate::connection::{ConnectProgress, State};
    use crate::event_loop::Interest;
    use crate::protocol::{Frame, FrameCodec, Invocation};

    enum Step {
        Data(Vec<u8>),
        Fail(ErrorKind),
    }

    struct ScriptedStream {
        reads: VecDeque<Step>,
        written: Vec<u8>,
        drops: Rc<Cell<usize>>,
    }

    impl ScriptedStream {
        fn new(reads: Vec<Step>, drops: &Rc<Cell<usize>>) -> ScriptedStream {
            ScriptedStream {
                reads: reads.into_iter().collect(),
                written: vec![],
                drops: Rc::clone(drops),
            }
        }
    }

    impl Read for ScriptedStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.reads.pop_front() {
                None => Ok(0),
                Some(Step::Fail(kind)) => Err(io::Error::from(kind)),
                Some(Step::Data(data)) => {
                    let n = data.len().min(buf.len());
                    buf[..n].copy_from_slice(&data[..n]);
                    Ok(n)
                }
            }
        }
    }

    impl Write for ScriptedStream {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(data);
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Drop for ScriptedStream {
        fn drop(&mut self) {
            self.drops.set(self.drops.get() + 1);
        }
    }

    fn encoded(frame: Frame) -> Vec<u8> {
        let mut out = BytesMut::new();
        FrameCodec.encode(frame, &mut out).unwrap();
        out.to_vec()
    }

    fn echo() -> Invocation {
        Invocation::new("com.example.Echo", "echo", vec![json!("hi")])
    }

    #[test]
    fn exchange_reassembles_split_response() {
        let raw = encoded(Frame::response(0, Ok(json!({"echo": "hi"}))).unwrap());
        let (a, rest) = raw.split_at(5);
        let (b, c) = rest.split_at(14);
        let drops = Rc::new(Cell::new(0));
        let stream = ScriptedStream::new(
            vec![
                Step::Data(a.to_vec()),
                Step::Fail(ErrorKind::Interrupted),
                Step::Data(b.to_vec()),
                Step::Data(c.to_vec()),
            ],
            &drops,
        );

        let response = exchange(stream, DubboCodec::new(), &echo()).unwrap();
        assert_eq!(response.result(), Ok(&json!({"echo": "hi"})));
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn exchange_skips_heartbeats() {
        let mut raw = encoded(Frame::heartbeat_response(99));
        raw.extend(encoded(Frame::response(0, Ok(json!(1))).unwrap()));
        let drops = Rc::new(Cell::new(0));
        let stream = ScriptedStream::new(vec![Step::Data(raw)], &drops);

        let response = exchange(stream, DubboCodec::new(), &echo()).unwrap();
        assert_eq!(response.id, 0);
    }

    #[test]
    fn exchange_failures() {
        let drops = Rc::new(Cell::new(0));

        let stream = ScriptedStream::new(vec![Step::Data(b"HTTP/1.1".to_vec())], &drops);
        assert!(matches!(
            exchange(stream, DubboCodec::new(), &echo()),
            Err(Error::InvalidFrame)
        ));

        let stream = ScriptedStream::new(vec![Step::Data(vec![0xda, 0xbb])], &drops);
        assert!(matches!(
            exchange(stream, DubboCodec::new(), &echo()),
            Err(Error::PeerClosed)
        ));

        let stream = ScriptedStream::new(vec![Step::Fail(ErrorKind::WouldBlock)], &drops);
        assert!(matches!(
            exchange(stream, DubboCodec::new(), &echo()),
            Err(Error::Timeout)
        ));

        assert_eq!(drops.get(), 3);
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:20880".parse().unwrap()
    }

    fn launch(
        connector: MockConnector,
        poller: &mut MockPoller,
        token: Token,
        total: usize,
    ) -> Result<BenchClient<MockConnector, DubboCodec, impl FnMut(&Response)>, Error> {
        let log = Logger::root(Discard, o!());
        let conn = Connection::new(connector, addr(), token);
        let pipeline = Pipeline::new(
            DubboCodec::new(),
            echo(),
            Budget::new(1, total),
            Limits {
                max_reconnects: None,
                max_encode_failures: 3,
            },
            |_: &Response| (),
            log.clone(),
        );
        BenchClient::launch(conn, pipeline, poller, log)
    }

    fn answer_all(wire: &SharedWire) {
        let mut raw = BytesMut::from(&wire.borrow().outbound[..]);
        wire.borrow_mut().outbound.clear();
        while let Some(frame) = FrameCodec.decode(&mut raw).unwrap() {
            let reply = encoded(Frame::response(frame.header.id, Ok(json!("hi"))).unwrap());
            wire.borrow_mut().push(&reply);
        }
    }

    #[test]
    fn finished_run_stops_loop_and_releases_connection() {
        let mut connector = MockConnector::default();
        let wire = connector.wire(ConnectProgress::Connected);
        let mut poller = MockPoller::default();
        let mut client = launch(connector, &mut poller, Token(0), 2).unwrap();
        assert!(!client.is_done());

        // notifications for other sources are ignored
        client.on_ready(&mut poller, Token(5), Ready::READABLE);
        assert!(!client.is_done());

        for _ in 0..2 {
            answer_all(&wire);
            client.on_ready(&mut poller, Token(0), Ready::READABLE);
        }

        assert!(client.is_done());
        assert!(poller.stopped);
        assert_eq!(poller.interest, Interest::NONE);
        assert_eq!(client.conn.state(), State::Disconnected);

        let report = client.take_outcome().unwrap().unwrap();
        assert_eq!(report.stats.responses, 2);
        assert_eq!(report.total_requests, 2);
        assert_eq!(report.pipeline_depth, 1);
        assert!(report.finished_at >= report.started_at);
    }

    #[test]
    fn fleet_routes_by_token_and_stops_when_all_are_done() {
        let mut poller = MockPoller::default();
        let mut first = MockConnector::default();
        let first_wire = first.wire(ConnectProgress::Connected);
        let mut second = MockConnector::default();
        let second_wire = second.wire(ConnectProgress::Connected);

        let mut fleet = Fleet::new();
        fleet.push(launch(first, &mut poller, Token(0), 1).unwrap());
        fleet.push(launch(second, &mut poller, Token(1), 2).unwrap());
        assert_eq!(fleet.len(), 2);

        answer_all(&first_wire);
        fleet.on_ready(&mut poller, Token(0), Ready::READABLE);
        assert!(fleet.clients[0].is_done());
        assert!(!fleet.is_done());
        assert!(!poller.stopped);

        // the second run has no answer yet, and a notification for the
        // finished run changes nothing
        fleet.on_ready(&mut poller, Token(0), Ready::READABLE);
        assert!(!fleet.clients[1].is_done());

        for _ in 0..2 {
            answer_all(&second_wire);
            fleet.on_ready(&mut poller, Token(1), Ready::READABLE);
        }
        assert!(fleet.is_done());
        assert!(poller.stopped);

        let outcomes = fleet.take_outcomes();
        let responses: Vec<u64> = outcomes
            .into_iter()
            .map(|o| o.unwrap().unwrap().stats.responses)
            .collect();
        assert_eq!(responses, vec![1, 2]);
    }

    #[test]
    fn exchange_handles_two_frames_over_three_reads() {
        let mut raw = encoded(Frame::heartbeat_response(7));
        raw.extend(encoded(Frame::response(0, Ok(json!({"echo": "hi"}))).unwrap()));
        let (a, rest) = raw.split_at(10);
        let (b, c) = rest.split_at(15);
        let drops = Rc::new(Cell::new(0));
        let stream = ScriptedStream::new(
            vec![
                Step::Data(a.to_vec()),
                Step::Data(b.to_vec()),
                Step::Data(c.to_vec()),
            ],
            &drops,
        );

        let response = exchange(stream, DubboCodec::new(), &echo()).unwrap();
        assert_eq!(response.id, 0);
        assert!(!response.is_event());
        assert_eq!(response.result(), Ok(&json!({"echo": "hi"})));
        assert_eq!(drops.get(), 1);
    }

    #[test]
    fn launch_fails_when_connect_fails() {
        let mut poller = MockPoller::default();
        assert!(matches!(
            launch(MockConnector::default(), &mut poller, Token(0), 1),
            Err(Error::Io(_))
        ));
        assert!(poller.stopped);
    }
}
