//! Cooperative event loop (§5): a `WaitSet` tracks file descriptors and a
//! repeating timer; the main loop polls once, dispatches whatever is
//! readable, and returns. No handler may block.
//!
//! `examples/original_source/discover/device-handler.c` and
//! `discover-server.c` both register against a single process-wide
//! `struct waitset` (`lib/waiter/waiter.c`, not itself part of this
//! retrieval pack); this is that abstraction's Rust shape, built on `mio`'s
//! `Poll`/`Token` plumbing the way the teacher pack has no equivalent of its
//! own — `mio` is the pinned crate for it. Every source here is a plain
//! `std` socket wrapped in `mio::unix::SourceFd` (the `os-ext` feature),
//! since the daemon's sockets (netlink, udev, Unix stream/datagram) are
//! already raw fds rather than `mio::net` types.

use std::io;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub usize);

pub struct WaitSet {
    poll: Poll,
    events: Events,
    next_token: usize,
    tick_interval: Duration,
    last_tick: Instant,
}

/// What woke the loop up: a specific registered source becoming readable,
/// or the repeating tick timer firing.
pub enum Wake {
    Readable(SourceId),
    Tick,
}

impl WaitSet {
    pub fn new(tick_interval: Duration) -> io::Result<Self> {
        Ok(WaitSet {
            poll: Poll::new()?,
            events: Events::with_capacity(64),
            next_token: 0,
            tick_interval,
            last_tick: Instant::now(),
        })
    }

    /// Register a raw fd for readability. The caller keeps ownership of the
    /// underlying socket; `WaitSet` only borrows its fd for `poll(2)`.
    pub fn register(&mut self, fd: RawFd) -> io::Result<SourceId> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll.registry().register(&mut SourceFd(&fd), token, Interest::READABLE)?;
        Ok(SourceId(token.0))
    }

    pub fn deregister(&mut self, fd: RawFd) -> io::Result<()> {
        self.poll.registry().deregister(&mut SourceFd(&fd))
    }

    /// Block until either a registered fd is readable or the tick interval
    /// elapses, whichever comes first. Returns every wake reason observed
    /// this call — possibly both a tick and one or more readable sources.
    pub fn wait(&mut self) -> io::Result<Vec<Wake>> {
        let elapsed = self.last_tick.elapsed();
        let timeout = self.tick_interval.checked_sub(elapsed).unwrap_or(Duration::ZERO);

        self.events.clear();
        self.poll.poll(&mut self.events, Some(timeout))?;

        let mut out: Vec<Wake> = self.events.iter().map(|e| Wake::Readable(SourceId(e.token().0))).collect();

        if self.last_tick.elapsed() >= self.tick_interval {
            self.last_tick = Instant::now();
            out.push(Wake::Tick);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tick_fires_after_interval_with_no_sources() {
        let mut ws = WaitSet::new(Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(15));
        let wakes = ws.wait().unwrap();
        assert!(wakes.iter().any(|w| matches!(w, Wake::Tick)));
    }
}
