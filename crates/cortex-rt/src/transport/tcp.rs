//! TCP transport: harness connects, adapter listens.
//!
//! Handshake frames are small, so Nagle buffering is disabled on both ends;
//! keep-alive is enabled so a silently dead peer eventually surfaces as
//! `ConnReset` rather than an endless run of timeouts. Writes use
//! `MSG_NOSIGNAL` — a broken connection must come back as an error, never as
//! a SIGPIPE.

use crate::error::TransportError;
use crate::transport::{wait_readable, Transport};
use anyhow::{Context, Result};
use socket2::{SockRef, TcpKeepalive};
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

pub struct TcpTransport {
    stream: TcpStream,
    closed: bool,
}

impl TcpTransport {
    /// Harness side: connect to `host:port` within `connect_timeout_ms`.
    pub fn connect(target: &str, connect_timeout_ms: u64) -> Result<Self> {
        let addr = target
            .to_socket_addrs()
            .with_context(|| format!("cannot resolve {:?}", target))?
            .next()
            .with_context(|| format!("{:?} resolved to no addresses", target))?;
        let stream = TcpStream::connect_timeout(&addr, Duration::from_millis(connect_timeout_ms))
            .with_context(|| format!("tcp connect to {} failed", addr))?;
        Self::configure(stream)
    }

    /// Adapter side: listen on `port` and accept exactly one client.
    pub fn listen(port: u16, accept_timeout_ms: u64) -> Result<Self> {
        let listener =
            TcpListener::bind(("0.0.0.0", port)).with_context(|| format!("tcp bind :{port}"))?;
        tracing::info!("adapter listening on tcp://:{port}");
        wait_readable(listener.as_raw_fd(), accept_timeout_ms)
            .map_err(|_| anyhow::anyhow!("no client connected within {accept_timeout_ms} ms"))?;
        let (stream, peer) = listener.accept().context("tcp accept")?;
        tracing::info!("accepted harness connection from {peer}");
        Self::configure(stream)
    }

    fn configure(stream: TcpStream) -> Result<Self> {
        stream.set_nodelay(true).context("set TCP_NODELAY")?;
        let sock = SockRef::from(&stream);
        sock.set_tcp_keepalive(&TcpKeepalive::new().with_time(Duration::from_secs(30)))
            .context("set SO_KEEPALIVE")?;
        Ok(Self {
            stream,
            closed: false,
        })
    }

    fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Transport for TcpTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::ConnReset);
        }
        loop {
            let n = unsafe {
                libc::send(
                    self.fd(),
                    buf.as_ptr() as *const libc::c_void,
                    buf.len(),
                    libc::MSG_NOSIGNAL,
                )
            };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::EPIPE) | Some(libc::ECONNRESET) => {
                    return Err(TransportError::ConnReset)
                }
                _ => return Err(TransportError::Io(err)),
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::ConnReset);
        }
        wait_readable(self.fd(), timeout_ms)?;
        loop {
            let n = unsafe {
                libc::recv(
                    self.fd(),
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    0,
                )
            };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                return Err(TransportError::ConnReset);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                Some(libc::ECONNRESET) => return Err(TransportError::ConnReset),
                _ => return Err(TransportError::Io(err)),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = self.stream.shutdown(std::net::Shutdown::Both);
        // The FD itself is released when `stream` drops.
    }
}
