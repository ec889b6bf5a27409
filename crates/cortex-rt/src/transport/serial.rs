//! Serial-port transport: POSIX termios, raw mode, 8N1.
//!
//! The port is opened non-blocking (so a modem-control line can't hang the
//! open), switched to raw mode with `VMIN=0`/`VTIME=0`, and all waiting is
//! done through `poll(2)` so the caller's timeout is honored exactly.

use crate::error::TransportError;
use crate::transport::{wait_readable, Transport};
use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::os::unix::io::RawFd;

pub struct SerialTransport {
    fd: RawFd,
    closed: bool,
}

impl SerialTransport {
    pub fn open(path: &str, baud: u32) -> Result<Self> {
        let speed = baud_constant(baud)
            .with_context(|| format!("unsupported baud rate {baud}"))?;
        let cpath = CString::new(path).context("serial path contains NUL")?;
        let fd = unsafe {
            libc::open(
                cpath.as_ptr(),
                libc::O_RDWR | libc::O_NOCTTY | libc::O_NONBLOCK,
            )
        };
        if fd < 0 {
            bail!(
                "open {:?} failed: {}",
                path,
                std::io::Error::last_os_error()
            );
        }

        unsafe {
            let mut tio: libc::termios = std::mem::zeroed();
            if libc::tcgetattr(fd, &mut tio) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                bail!("tcgetattr {:?}: {}", path, err);
            }
            libc::cfmakeraw(&mut tio);
            // 8N1: cfmakeraw already selects CS8 and clears parity; make the
            // single stop bit and receiver flags explicit.
            tio.c_cflag &= !libc::CSTOPB;
            tio.c_cflag |= libc::CLOCAL | libc::CREAD;
            tio.c_cc[libc::VMIN] = 0;
            tio.c_cc[libc::VTIME] = 0;
            libc::cfsetispeed(&mut tio, speed);
            libc::cfsetospeed(&mut tio, speed);
            if libc::tcsetattr(fd, libc::TCSANOW, &tio) != 0 {
                let err = std::io::Error::last_os_error();
                libc::close(fd);
                bail!("tcsetattr {:?}: {}", path, err);
            }
            libc::tcflush(fd, libc::TCIOFLUSH);
        }

        tracing::info!("serial port {} open at {} baud", path, baud);
        Ok(Self { fd, closed: false })
    }
}

impl Transport for SerialTransport {
    fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::ConnReset);
        }
        loop {
            let n =
                unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return Ok(n as usize);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                Some(libc::EIO) => return Err(TransportError::ConnReset),
                _ => return Err(TransportError::Io(err)),
            }
        }
    }

    fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, TransportError> {
        if self.closed {
            return Err(TransportError::ConnReset);
        }
        loop {
            wait_readable(self.fd, timeout_ms)?;
            let n = unsafe {
                libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                // Raw mode with VMIN=0 after a poll wakeup: the line dropped.
                return Err(TransportError::ConnReset);
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                // Spurious wakeup — poll again with the caller's budget.
                Some(libc::EINTR) | Some(libc::EAGAIN) => continue,
                Some(libc::EIO) => return Err(TransportError::ConnReset),
                _ => return Err(TransportError::Io(err)),
            }
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.fd > 2 {
            unsafe { libc::close(self.fd) };
        }
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        self.close();
    }
}

fn baud_constant(baud: u32) -> Option<libc::speed_t> {
    Some(match baud {
        9_600 => libc::B9600,
        19_200 => libc::B19200,
        38_400 => libc::B38400,
        57_600 => libc::B57600,
        115_200 => libc::B115200,
        230_400 => libc::B230400,
        #[cfg(target_os = "linux")]
        460_800 => libc::B460800,
        #[cfg(target_os = "linux")]
        921_600 => libc::B921600,
        #[cfg(target_os = "linux")]
        1_000_000 => libc::B1000000,
        #[cfg(target_os = "linux")]
        2_000_000 => libc::B2000000,
        _ => return None,
    })
}
