// Copyright 2020 Joyent, Inc.

//! Single-threaded readiness loop.
//!
//! Components never own the loop. They see it through `Poller`, which only
//! lets them add or remove interest for a source and ask the loop to stop,
//! and the loop calls back into a `Handler` for every readiness event.

use std::collections::HashMap;
use std::io::{self, ErrorKind};
use std::ops::BitOr;
use std::os::unix::io::{AsRawFd, RawFd};

use mio::event::{Event, Source};
use mio::{Events, Poll};
use slog::{o, warn, Drain, Logger};

pub use mio::Token;

const EVENTS_CAPACITY: usize = 1024;

/// Readiness a source is registered for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);
    pub const BOTH: Interest = Interest(0b11);

    pub fn is_readable(self) -> bool {
        self.0 & Interest::READABLE.0 != 0
    }

    pub fn is_writable(self) -> bool {
        self.0 & Interest::WRITABLE.0 != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    fn to_mio(self) -> Option<mio::Interest> {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => Some(mio::Interest::READABLE | mio::Interest::WRITABLE),
            (true, false) => Some(mio::Interest::READABLE),
            (false, true) => Some(mio::Interest::WRITABLE),
            (false, false) => None,
        }
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

/// What a readiness notification reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ready {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Ready {
    pub const READABLE: Ready = Ready {
        readable: true,
        writable: false,
        error: false,
    };

    pub const WRITABLE: Ready = Ready {
        readable: false,
        writable: true,
        error: false,
    };

    fn from_event(ev: &Event) -> Ready {
        Ready {
            readable: ev.is_readable() || ev.is_read_closed(),
            writable: ev.is_writable() || ev.is_write_closed(),
            error: ev.is_error(),
        }
    }
}

/// The registration side of an event loop.
pub trait Poller<S: ?Sized> {
    /// Add `interest` to whatever `source` is already registered for.
    fn register(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()>;

    /// Drop `interest`. Unregistering something that is not registered is a
    /// no-op.
    fn unregister(&mut self, source: &mut S, token: Token, interest: Interest);

    /// Make the loop return once the current callback finishes.
    fn stop(&mut self);

    fn register_readable(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.register(source, token, Interest::READABLE)
    }

    fn register_writable(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.register(source, token, Interest::WRITABLE)
    }
}

pub trait Handler<P> {
    fn on_ready(&mut self, poller: &mut P, token: Token, ready: Ready);
}

/// Hands a poller to one of several handlers sharing a loop. Registration
/// passes straight through; a stop request is only recorded, and the owner
/// decides whether the loop really stops.
pub struct Shared<'a, P> {
    inner: &'a mut P,
    stop_requested: bool,
}

impl<'a, P> Shared<'a, P> {
    pub fn new(inner: &'a mut P) -> Shared<'a, P> {
        Shared {
            inner,
            stop_requested: false,
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }
}

impl<'a, S: ?Sized, P: Poller<S>> Poller<S> for Shared<'a, P> {
    fn register(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        self.inner.register(source, token, interest)
    }

    fn unregister(&mut self, source: &mut S, token: Token, interest: Interest) {
        self.inner.unregister(source, token, interest)
    }

    fn stop(&mut self) {
        self.stop_requested = true;
    }
}

/// A source's registration: which descriptor owns the token and what it is
/// registered for.
#[derive(Debug, Clone, Copy)]
struct Registration {
    fd: RawFd,
    interest: Interest,
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    registrations: HashMap<Token, Registration>,
    next_token: usize,
    stopped: bool,
    log: Logger,
}

impl EventLoop {
    pub fn new() -> io::Result<EventLoop> {
        EventLoop::with_logger(None)
    }

    pub fn with_logger(log: Option<&Logger>) -> io::Result<EventLoop> {
        let log = log
            .cloned()
            .unwrap_or_else(|| Logger::root(slog_stdlog::StdLog.fuse(), o!()));
        Ok(EventLoop {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENTS_CAPACITY),
            registrations: HashMap::new(),
            next_token: 0,
            stopped: false,
            log,
        })
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    pub fn interest(&self, token: Token) -> Interest {
        self.registrations
            .get(&token)
            .map(|reg| reg.interest)
            .unwrap_or_default()
    }

    /// Hand out a token no source on this loop is using.
    pub fn next_token(&mut self) -> Token {
        loop {
            let token = Token(self.next_token);
            self.next_token = self.next_token.wrapping_add(1);
            if !self.registrations.contains_key(&token) {
                return token;
            }
        }
    }

    /// Dispatch readiness events to `handler` until something calls `stop`.
    pub fn run<H: Handler<EventLoop>>(&mut self, handler: &mut H) -> io::Result<()> {
        self.stopped = false;
        while !self.stopped {
            if self.registrations.is_empty() {
                let msg = "event loop has no registered sources";
                return Err(io::Error::new(ErrorKind::Other, msg));
            }

            match self.poll.poll(&mut self.events, None) {
                Ok(()) => (),
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }

            let ready: Vec<(Token, Ready)> = self
                .events
                .iter()
                .map(|ev| (ev.token(), Ready::from_event(ev)))
                .collect();

            for (token, ready) in ready {
                if self.stopped {
                    break;
                }
                handler.on_ready(self, token, ready);
            }
        }
        Ok(())
    }
}

impl<S: Source + AsRawFd + ?Sized> Poller<S> for EventLoop {
    fn register(&mut self, source: &mut S, token: Token, interest: Interest) -> io::Result<()> {
        let fd = source.as_raw_fd();
        let current = match self.registrations.get(&token) {
            Some(reg) if reg.fd != fd => {
                let msg = format!("token {} is registered to another source", token.0);
                return Err(io::Error::new(ErrorKind::AlreadyExists, msg));
            }
            Some(reg) => reg.interest,
            None => Interest::NONE,
        };
        let next = current | interest;
        if next == current {
            return Ok(());
        }

        let registry = self.poll.registry();
        match (current.to_mio(), next.to_mio()) {
            (None, Some(mask)) => registry.register(source, token, mask)?,
            (Some(_), Some(mask)) => registry.reregister(source, token, mask)?,
            _ => (),
        }
        self.registrations.insert(token, Registration { fd, interest: next });
        Ok(())
    }

    fn unregister(&mut self, source: &mut S, token: Token, interest: Interest) {
        let fd = source.as_raw_fd();
        let current = match self.registrations.get(&token) {
            Some(reg) if reg.fd == fd => reg.interest,
            _ => return,
        };
        let next = current.remove(interest);
        if next == current {
            return;
        }

        let registry = self.poll.registry();
        let result = match next.to_mio() {
            Some(mask) => registry.reregister(source, token, mask),
            None => registry.deregister(source),
        };
        match result {
            Ok(()) if next.is_empty() => {
                self.registrations.remove(&token);
            }
            Ok(()) => {
                self.registrations.insert(token, Registration { fd, interest: next });
            }
            Err(e) => warn!(self.log, "failed to drop interest";
                "token" => token.0,
                "error" => %e),
        }
    }

    fn stop(&mut self) {
        EventLoop::stop(self);
    }
}
