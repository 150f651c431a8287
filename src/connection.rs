// Copyright 2020 Joyent, Inc.

//! One outbound connection, driven by readiness notifications.
//!
//! ```text
//!   Disconnected --start--> Connecting --writable, connect ok--> Connected
//!        ^    \                  |                                  |
//!        |     `--immediate------+------------------------------>   |
//!        |                       |                                  |
//!        `-------close-----------+---------------close--------------'
//! ```
//!
//! Everything a suspended connection needs in order to resume sits in its
//! two buffers. Write interest is only armed while the send buffer holds
//! bytes the socket would not take.

use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;

use mio::net::TcpStream;
use socket2::{Domain, Protocol, SockAddr, Socket as RawSocket, Type};

use crate::buffer::{Buffer, INITIAL_SIZE};
use crate::codec::{CodecError, FrameDetector, FrameStatus};
use crate::event_loop::{Interest, Poller, Token};

/// Receive buffers that grew past this are shrunk back once drained.
const RECV_HIGH_WATER: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Disconnected,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Connected,
    InProgress,
}

/// Result of draining the socket into the receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fill {
    /// The socket has no more data for now.
    Drained,
    /// The peer shut down its side. Bytes read before that are buffered.
    PeerClosed,
}

pub trait Socket: Read + Write {
    /// Check a non-blocking connect after a write-ready notification.
    /// `Ok(false)` means the connect is still in progress.
    fn finish_connect(&mut self) -> io::Result<bool>;
}

/// Creates non-blocking sockets and issues connects on them.
pub trait Connector {
    type Socket: Socket;

    fn connect(&mut self, addr: SocketAddr) -> io::Result<(Self::Socket, ConnectProgress)>;
}

fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == ErrorKind::WouldBlock
}

impl Socket for TcpStream {
    fn finish_connect(&mut self) -> io::Result<bool> {
        if let Some(e) = self.take_error()? {
            return Err(e);
        }
        match self.peer_addr() {
            Ok(_) => Ok(true),
            Err(ref e) if e.kind() == ErrorKind::NotConnected => Ok(false),
            Err(ref e) if connect_in_progress(e) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    type Socket = TcpStream;

    fn connect(&mut self, addr: SocketAddr) -> io::Result<(TcpStream, ConnectProgress)> {
        let socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_nonblocking(true)?;
        let progress = match socket.connect(&SockAddr::from(addr)) {
            Ok(()) => ConnectProgress::Connected,
            Err(ref e) if connect_in_progress(e) => ConnectProgress::InProgress,
            Err(e) => return Err(e),
        };
        let stream = TcpStream::from_std(socket.into());
        stream.set_nodelay(true)?;
        Ok((stream, progress))
    }
}

fn range_to_io(e: crate::buffer::RangeError) -> io::Error {
    io::Error::new(ErrorKind::Other, e)
}

pub struct Connection<C: Connector> {
    connector: C,
    addr: SocketAddr,
    token: Token,
    socket: Option<C::Socket>,
    state: State,
    recv_buf: Buffer,
    send_buf: Buffer,
}

impl<C: Connector> Connection<C> {
    pub fn new(connector: C, addr: SocketAddr, token: Token) -> Connection<C> {
        Connection {
            connector,
            addr,
            token,
            socket: None,
            state: State::Disconnected,
            recv_buf: Buffer::with_capacity(INITIAL_SIZE),
            send_buf: Buffer::with_capacity(INITIAL_SIZE),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn token(&self) -> Token {
        self.token
    }

    /// Bytes queued but not yet taken by the socket.
    pub fn send_pending(&self) -> usize {
        self.send_buf.readable_bytes()
    }

    pub fn recv_buf(&self) -> &Buffer {
        &self.recv_buf
    }

    pub fn recv_buf_mut(&mut self) -> &mut Buffer {
        &mut self.recv_buf
    }

    /// Create a socket and issue a non-blocking connect.
    ///
    /// A connect that completes immediately leaves the connection
    /// `Connected` with read interest armed. One still in progress waits for
    /// writability in `Connecting`. Any other failure is returned and leaves
    /// the connection `Disconnected`.
    pub fn start<P>(&mut self, poller: &mut P) -> io::Result<State>
    where
        P: Poller<C::Socket>,
    {
        if self.state != State::Disconnected {
            self.close(poller);
        }

        let (mut socket, progress) = self.connector.connect(self.addr)?;
        let (interest, state) = match progress {
            ConnectProgress::Connected => (Interest::READABLE, State::Connected),
            ConnectProgress::InProgress => (Interest::WRITABLE, State::Connecting),
        };
        poller.register(&mut socket, self.token, interest)?;
        self.socket = Some(socket);
        self.state = state;
        Ok(state)
    }

    /// Handle writability while `Connecting`. Returns `Ok(true)` once the
    /// connection is established; anything queued meanwhile is flushed.
    pub fn connect_ready<P>(&mut self, poller: &mut P) -> io::Result<bool>
    where
        P: Poller<C::Socket>,
    {
        let established = match self.socket.as_mut() {
            Some(socket) if self.state == State::Connecting => socket.finish_connect()?,
            _ => return Err(io::Error::from(ErrorKind::NotConnected)),
        };
        if !established {
            return Ok(false);
        }

        self.unregister(poller, Interest::WRITABLE);
        self.register(poller, Interest::READABLE)?;
        self.state = State::Connected;
        self.write_ready(poller)?;
        Ok(true)
    }

    /// Queue `data` and try to write it right away.
    pub fn send<P>(&mut self, data: &[u8], poller: &mut P) -> io::Result<()>
    where
        P: Poller<C::Socket>,
    {
        self.send_buf.append(data);
        self.write_ready(poller)
    }

    /// Drain the send buffer into the socket.
    ///
    /// Stops on a short write by arming write interest, and disarms it once
    /// the buffer is empty. Bytes queued before the connection is established
    /// wait in the buffer.
    pub fn write_ready<P>(&mut self, poller: &mut P) -> io::Result<()>
    where
        P: Poller<C::Socket>,
    {
        if self.state != State::Connected {
            return Ok(());
        }
        let drained = match self.socket.as_mut() {
            Some(socket) => drain_into(socket, &mut self.send_buf)?,
            None => return Err(io::Error::from(ErrorKind::NotConnected)),
        };
        if drained {
            self.unregister(poller, Interest::WRITABLE);
        } else {
            self.register(poller, Interest::WRITABLE)?;
        }
        Ok(())
    }

    /// Read everything the socket has into the receive buffer.
    pub fn read_ready(&mut self) -> io::Result<Fill> {
        let socket = match self.socket.as_mut() {
            Some(socket) if self.state == State::Connected => socket,
            _ => return Err(io::Error::from(ErrorKind::NotConnected)),
        };
        loop {
            match self.recv_buf.read_from(socket) {
                Ok(0) => return Ok(Fill::PeerClosed),
                Ok(_) => continue,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(Fill::Drained),
                Err(e) => return Err(e),
            }
        }
    }

    /// Length of the whole frame at the front of the receive buffer, if one
    /// has arrived. Nothing is consumed.
    pub fn poll_frame<D: FrameDetector>(&self, detector: &D) -> Result<Option<usize>, CodecError> {
        let data = self.recv_buf.peek();
        if !detector.looks_like_frame(data) {
            let msg = format!("{} buffered bytes do not start a frame", data.len());
            return Err(CodecError::InvalidFrame(msg));
        }
        match detector.frame_status(data) {
            FrameStatus::Complete { len } => Ok(Some(len)),
            FrameStatus::Incomplete { .. } => Ok(None),
        }
    }

    /// Give memory back after an unusually large response has been consumed.
    pub fn compact(&mut self) {
        if self.recv_buf.is_empty() && self.recv_buf.capacity() > RECV_HIGH_WATER {
            self.recv_buf.shrink(INITIAL_SIZE);
        }
    }

    /// Drop the socket and reset both buffers. Safe to call repeatedly.
    pub fn close<P>(&mut self, poller: &mut P)
    where
        P: Poller<C::Socket>,
    {
        if let Some(mut socket) = self.socket.take() {
            poller.unregister(&mut socket, self.token, Interest::BOTH);
        }
        self.state = State::Disconnected;
        self.recv_buf.retrieve_all();
        self.send_buf.retrieve_all();
    }

    pub fn reconnect<P>(&mut self, poller: &mut P) -> io::Result<State>
    where
        P: Poller<C::Socket>,
    {
        self.close(poller);
        self.start(poller)
    }

    fn register<P>(&mut self, poller: &mut P, interest: Interest) -> io::Result<()>
    where
        P: Poller<C::Socket>,
    {
        match self.socket.as_mut() {
            Some(socket) => poller.register(socket, self.token, interest),
            None => Ok(()),
        }
    }

    fn unregister<P>(&mut self, poller: &mut P, interest: Interest)
    where
        P: Poller<C::Socket>,
    {
        if let Some(socket) = self.socket.as_mut() {
            poller.unregister(socket, self.token, interest);
        }
    }
}

/// Write until the buffer is empty (`Ok(true)`) or the socket would block
/// (`Ok(false)`).
fn drain_into<S: Write>(socket: &mut S, buf: &mut Buffer) -> io::Result<bool> {
    while !buf.is_empty() {
        match socket.write(buf.peek()) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => buf.retrieve(n).map_err(range_to_io)?,
            Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == ErrorKind::WouldBlock => return Ok(false),
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}
