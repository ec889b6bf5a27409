//! Bidirectional reliable byte-stream transports.
//!
//! A transport is the byte pipe between the harness and an adapter process.
//! Four operations: `send`, `recv` with a finite timeout, `close`, and a
//! monotonic timestamp source. Partial reads are legal and callers must
//! tolerate them; `recv` never blocks indefinitely.
//!
//! Variants and their URIs:
//! * `local://` — paired FDs; the harness spawns the adapter with a
//!   socketpair as its stdin/stdout, so only the adapter side can open it.
//! * `tcp://HOST:PORT` — harness connects as a client (forbidden on the
//!   adapter side).
//! * `tcp://:PORT[?accept_timeout_ms=N]` — adapter listens and accepts one
//!   client (forbidden on the harness side).
//! * `serial:///dev/PATH[?baud=N]` — raw 8N1 serial, default 115200 baud.
//! * `shm://NAME[?capacity=N]` — shared-memory ring pair on one host.
//!
//! The client/server asymmetry is enforced at `open` time so a
//! misconfigured deployment fails before any handshake bytes move.

mod fd;
mod serial;
mod shm;
mod tcp;

pub use fd::{socketpair as fd_socketpair, FdTransport};
pub use serial::SerialTransport;
pub use shm::ShmTransport;
pub use tcp::TcpTransport;

use crate::clock;
use crate::error::TransportError;
use anyhow::{bail, Context, Result};

/// Which endpoint of the protocol this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Spawns/connects to adapters, sends CONFIG and windows.
    Harness,
    /// Hosts the kernel, sends HELLO and results.
    Adapter,
}

/// A bidirectional reliable byte stream with timeout-bounded receives.
pub trait Transport: Send {
    /// Send as many bytes as the stream accepts; returns the count written.
    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError>;

    /// Receive up to `buf.len()` bytes, waiting at most `timeout_ms`.
    /// Returns the (non-zero) count read, `Timeout`, or `ConnReset` once the
    /// peer has closed.
    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, TransportError>;

    /// Release OS resources. Idempotent.
    fn close(&mut self);

    /// Device-clock timestamp in nanoseconds. Only comparable with other
    /// stamps from the same transport's host.
    fn monotonic_ns(&self) -> u64 {
        clock::now_ns()
    }

    /// Send the whole buffer, looping over short writes.
    fn send_all(&mut self, mut buf: &[u8]) -> Result<(), TransportError> {
        while !buf.is_empty() {
            let n = self.send(buf)?;
            if n == 0 {
                return Err(TransportError::ConnReset);
            }
            buf = &buf[n..];
        }
        Ok(())
    }
}

/// Open a transport from a URI, enforcing the side asymmetry.
pub fn open(uri: &str, side: Side) -> Result<Box<dyn Transport>> {
    let (scheme, rest) = uri
        .split_once("://")
        .with_context(|| format!("transport URI {:?} has no scheme", uri))?;
    let (target, query) = match rest.split_once('?') {
        Some((t, q)) => (t, Some(q)),
        None => (rest, None),
    };

    match scheme {
        "local" => match side {
            // The harness end of local:// exists only as the spawn path in
            // device-comm, where the socketpair is created explicitly.
            Side::Harness => bail!("local:// is opened by spawning an adapter, not by URI"),
            Side::Adapter => Ok(Box::new(FdTransport::from_stdio())),
        },
        "tcp" => {
            if let Some(port) = target.strip_prefix(':') {
                if side == Side::Harness {
                    bail!("harness must not listen; use tcp://HOST:PORT to connect");
                }
                let port: u16 = port.parse().context("bad tcp listen port")?;
                let accept_timeout_ms = query_param(query, "accept_timeout_ms")
                    .map(|v| v.parse::<u64>())
                    .transpose()
                    .context("bad accept_timeout_ms")?
                    .unwrap_or(30_000);
                Ok(Box::new(TcpTransport::listen(port, accept_timeout_ms)?))
            } else {
                if side == Side::Adapter {
                    bail!("adapter must not connect out; use tcp://:PORT to listen");
                }
                Ok(Box::new(TcpTransport::connect(target, 5_000)?))
            }
        }
        "serial" => {
            let baud = query_param(query, "baud")
                .map(|v| v.parse::<u32>())
                .transpose()
                .context("bad baud rate")?
                .unwrap_or(115_200);
            // serial:///dev/ttyUSB0 → target is "/dev/ttyUSB0".
            Ok(Box::new(SerialTransport::open(target, baud)?))
        }
        "shm" => {
            let capacity = query_param(query, "capacity")
                .map(|v| v.parse::<usize>())
                .transpose()
                .context("bad shm capacity")?
                .unwrap_or(shm::DEFAULT_RING_CAPACITY);
            match side {
                Side::Harness => Ok(Box::new(ShmTransport::create(target, capacity)?)),
                Side::Adapter => Ok(Box::new(ShmTransport::attach(target, 10_000)?)),
            }
        }
        other => bail!("unknown transport scheme {:?}", other),
    }
}

fn query_param<'a>(query: Option<&'a str>, key: &str) -> Option<&'a str> {
    query?
        .split('&')
        .filter_map(|kv| kv.split_once('='))
        .find(|(k, _)| *k == key)
        .map(|(_, v)| v)
}

/// Poll a raw FD for readability, returning the millisecond-bounded verdict.
///
/// Shared by the FD, TCP, and serial transports. `timeout_ms` is clamped to
/// `i32::MAX`; EINTR retries with the remaining budget.
#[cfg(unix)]
pub(crate) fn wait_readable(fd: std::os::unix::io::RawFd, timeout_ms: u64) -> Result<(), TransportError> {
    let deadline = clock::now_ns() + timeout_ms.saturating_mul(1_000_000);
    loop {
        let remaining_ns = deadline.saturating_sub(clock::now_ns());
        let remaining_ms = (remaining_ns / 1_000_000).min(i32::MAX as u64) as i32;
        let mut pfd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, remaining_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(TransportError::Io(err));
        }
        if rc == 0 {
            return Err(TransportError::Timeout);
        }
        // POLLHUP/POLLERR still allow a final read that observes EOF, so any
        // wakeup is treated as readable.
        return Ok(());
    }
}
