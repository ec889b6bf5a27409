//! Shared-memory ring-pair transport (Linux).
//!
//! Two SPSC byte rings in one `shm_open` region: ring 0 carries
//! harness→adapter traffic, ring 1 the reverse. Each ring has free-running
//! 32-bit head/tail counters (`avail = head - tail`, wrapping) and a pair of
//! process-shared semaphores used purely as wakeups — the counters, not the
//! semaphore values, are the source of truth for occupancy.
//!
//! Intended for latency-baseline measurements on a single machine, where the
//! kernel socket stack would otherwise dominate the numbers.
//!
//! The harness creates the region and writes the ready magic last; the
//! adapter polls `shm_open` until the magic appears. Either side marks a
//! `closed` flag and posts all semaphores on close, so the peer observes
//! `ConnReset` instead of hanging.

#[cfg(not(target_os = "linux"))]
use crate::error::TransportError;
#[cfg(not(target_os = "linux"))]
use crate::transport::Transport;
#[cfg(not(target_os = "linux"))]
use anyhow::Result;

pub const DEFAULT_RING_CAPACITY: usize = 256 * 1024;

#[cfg(target_os = "linux")]
pub use linux::ShmTransport;

#[cfg(not(target_os = "linux"))]
pub struct ShmTransport;

#[cfg(not(target_os = "linux"))]
impl ShmTransport {
    pub fn create(_name: &str, _capacity: usize) -> Result<Self> {
        anyhow::bail!("shm:// transport requires linux")
    }
    pub fn attach(_name: &str, _timeout_ms: u64) -> Result<Self> {
        anyhow::bail!("shm:// transport requires linux")
    }
}

#[cfg(not(target_os = "linux"))]
impl Transport for ShmTransport {
    fn send(&mut self, _buf: &[u8]) -> Result<usize, TransportError> {
        Err(TransportError::ConnReset)
    }
    fn recv(&mut self, _buf: &mut [u8], _timeout_ms: u64) -> Result<usize, TransportError> {
        Err(TransportError::ConnReset)
    }
    fn close(&mut self) {}
}

#[cfg(target_os = "linux")]
mod linux {
    use crate::clock;
    use crate::error::TransportError;
    use crate::transport::Transport;
    use anyhow::{bail, Context, Result};
    use std::ffi::CString;
    use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

    /// "CORTRING" — written last by the creator, with release ordering.
    const REGION_MAGIC: u64 = 0x434F_5254_5249_4E47;

    /// How long a full ring blocks the sender before giving up. A peer that
    /// drains nothing for this long is effectively gone.
    const SEND_STALL_MS: u64 = 5_000;

    #[repr(C, align(64))]
    struct RegionHeader {
        magic: AtomicU64,
        ring_capacity: u32,
        _pad: u32,
        harness_closed: AtomicU32,
        adapter_closed: AtomicU32,
    }

    #[repr(C, align(64))]
    struct RingHeader {
        /// Total bytes ever written (wrapping).
        head: AtomicU32,
        /// Total bytes ever read (wrapping).
        tail: AtomicU32,
        /// Posted by the producer after publishing bytes.
        data_sem: libc::sem_t,
        /// Posted by the consumer after freeing space.
        space_sem: libc::sem_t,
    }

    #[derive(Clone, Copy, PartialEq)]
    enum Role {
        Creator,
        Attacher,
    }

    pub struct ShmTransport {
        base: *mut u8,
        map_len: usize,
        name: CString,
        role: Role,
        closed: bool,
    }

    // The raw pointers reference a process-shared mapping; the transport is
    // used from a single thread per side.
    unsafe impl Send for ShmTransport {}

    impl ShmTransport {
        /// Harness side: create and initialize the region.
        pub fn create(name: &str, capacity: usize) -> Result<Self> {
            let capacity = capacity.max(4 * 1024);
            let name = shm_name(name)?;
            let map_len = region_len(capacity);
            unsafe {
                // A stale region from a crashed run would carry dead
                // semaphores; always start fresh.
                libc::shm_unlink(name.as_ptr());
                let fd = libc::shm_open(
                    name.as_ptr(),
                    libc::O_CREAT | libc::O_EXCL | libc::O_RDWR,
                    0o600,
                );
                if fd < 0 {
                    bail!("shm_open failed: {}", std::io::Error::last_os_error());
                }
                if libc::ftruncate(fd, map_len as libc::off_t) != 0 {
                    let err = std::io::Error::last_os_error();
                    libc::close(fd);
                    libc::shm_unlink(name.as_ptr());
                    bail!("ftruncate shm region: {err}");
                }
                let base = map_region(fd, map_len)?;
                libc::close(fd);

                let region_mut = base as *mut RegionHeader;
                (*region_mut).ring_capacity = capacity as u32;
                (*region_mut)._pad = 0;
                for ring in [ring_ptr(base, capacity, 0), ring_ptr(base, capacity, 1)] {
                    (*ring).head = AtomicU32::new(0);
                    (*ring).tail = AtomicU32::new(0);
                    if libc::sem_init(&mut (*ring).data_sem, 1, 0) != 0
                        || libc::sem_init(&mut (*ring).space_sem, 1, 0) != 0
                    {
                        let err = std::io::Error::last_os_error();
                        libc::munmap(base as *mut libc::c_void, map_len);
                        libc::shm_unlink(name.as_ptr());
                        bail!("sem_init: {err}");
                    }
                }
                let region = &*(base as *const RegionHeader);
                region.harness_closed.store(0, Ordering::Relaxed);
                region.adapter_closed.store(0, Ordering::Relaxed);
                // Publish: attachers spin until they observe the magic.
                region.magic.store(REGION_MAGIC, Ordering::Release);

                Ok(Self {
                    base,
                    map_len,
                    name,
                    role: Role::Creator,
                    closed: false,
                })
            }
        }

        /// Adapter side: wait for the region to appear, then map it.
        pub fn attach(name: &str, timeout_ms: u64) -> Result<Self> {
            let name = shm_name(name)?;
            let deadline = clock::now_ns() + timeout_ms * 1_000_000;
            loop {
                unsafe {
                    let fd = libc::shm_open(name.as_ptr(), libc::O_RDWR, 0);
                    if fd >= 0 {
                        let mut st: libc::stat = std::mem::zeroed();
                        let have_len = libc::fstat(fd, &mut st) == 0 && st.st_size > 0;
                        if have_len {
                            let map_len = st.st_size as usize;
                            let base = map_region(fd, map_len)?;
                            libc::close(fd);
                            let region = &*(base as *const RegionHeader);
                            if region.magic.load(Ordering::Acquire) == REGION_MAGIC {
                                return Ok(Self {
                                    base,
                                    map_len,
                                    name,
                                    role: Role::Attacher,
                                    closed: false,
                                });
                            }
                            // Creator still initializing.
                            libc::munmap(base as *mut libc::c_void, map_len);
                        } else {
                            libc::close(fd);
                        }
                    }
                }
                if clock::now_ns() >= deadline {
                    bail!("shm region {:?} did not appear in time", name);
                }
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }

        fn region(&self) -> &RegionHeader {
            unsafe { &*(self.base as *const RegionHeader) }
        }

        fn capacity(&self) -> usize {
            self.region().ring_capacity as usize
        }

        /// Ring this side transmits on: 0 for the creator (harness), 1 for
        /// the attacher (adapter).
        fn tx_ring(&self) -> *mut RingHeader {
            let idx = if self.role == Role::Creator { 0 } else { 1 };
            unsafe { ring_ptr(self.base, self.capacity(), idx) }
        }

        fn rx_ring(&self) -> *mut RingHeader {
            let idx = if self.role == Role::Creator { 1 } else { 0 };
            unsafe { ring_ptr(self.base, self.capacity(), idx) }
        }

        fn peer_closed(&self) -> bool {
            let region = self.region();
            let flag = match self.role {
                Role::Creator => &region.adapter_closed,
                Role::Attacher => &region.harness_closed,
            };
            flag.load(Ordering::Acquire) != 0
        }

        fn my_closed_flag(&self) -> &AtomicU32 {
            let region = self.region();
            match self.role {
                Role::Creator => &region.harness_closed,
                Role::Attacher => &region.adapter_closed,
            }
        }
    }

    impl Transport for ShmTransport {
        fn send(&mut self, buf: &[u8]) -> Result<usize, TransportError> {
            if self.closed {
                return Err(TransportError::ConnReset);
            }
            let ring = self.tx_ring();
            let cap = self.capacity();
            let deadline = clock::now_ns() + SEND_STALL_MS * 1_000_000;
            loop {
                let (head, tail) = unsafe {
                    (
                        (*ring).head.load(Ordering::Relaxed),
                        (*ring).tail.load(Ordering::Acquire),
                    )
                };
                let used = head.wrapping_sub(tail) as usize;
                let free = cap - used;
                if free > 0 {
                    let n = free.min(buf.len());
                    unsafe {
                        copy_in(ring, cap, head, &buf[..n]);
                        (*ring).head.store(head.wrapping_add(n as u32), Ordering::Release);
                        libc::sem_post(&mut (*ring).data_sem);
                    }
                    return Ok(n);
                }
                if self.peer_closed() {
                    return Err(TransportError::ConnReset);
                }
                let remaining = deadline.saturating_sub(clock::now_ns());
                if remaining == 0 {
                    return Err(TransportError::Timeout);
                }
                unsafe { sem_wait_ms(&mut (*ring).space_sem, remaining / 1_000_000 + 1)? };
            }
        }

        fn recv(&mut self, buf: &mut [u8], timeout_ms: u64) -> Result<usize, TransportError> {
            if self.closed {
                return Err(TransportError::ConnReset);
            }
            let ring = self.rx_ring();
            let cap = self.capacity();
            let deadline = clock::now_ns() + timeout_ms.saturating_mul(1_000_000);
            loop {
                let (head, tail) = unsafe {
                    (
                        (*ring).head.load(Ordering::Acquire),
                        (*ring).tail.load(Ordering::Relaxed),
                    )
                };
                let avail = head.wrapping_sub(tail) as usize;
                if avail > 0 {
                    let n = avail.min(buf.len());
                    unsafe {
                        copy_out(ring, cap, tail, &mut buf[..n]);
                        (*ring).tail.store(tail.wrapping_add(n as u32), Ordering::Release);
                        libc::sem_post(&mut (*ring).space_sem);
                    }
                    return Ok(n);
                }
                // Drain before reporting the close: bytes published before
                // the peer closed are still deliverable.
                if self.peer_closed() {
                    return Err(TransportError::ConnReset);
                }
                let remaining = deadline.saturating_sub(clock::now_ns());
                if remaining == 0 {
                    return Err(TransportError::Timeout);
                }
                unsafe { sem_wait_ms(&mut (*ring).data_sem, remaining / 1_000_000 + 1)? };
            }
        }

        fn close(&mut self) {
            if self.closed {
                return;
            }
            self.closed = true;
            self.my_closed_flag().store(1, Ordering::Release);
            unsafe {
                // Wake the peer out of any semaphore wait.
                for ring in [self.tx_ring(), self.rx_ring()] {
                    libc::sem_post(&mut (*ring).data_sem);
                    libc::sem_post(&mut (*ring).space_sem);
                }
                libc::munmap(self.base as *mut libc::c_void, self.map_len);
                if self.role == Role::Creator {
                    libc::shm_unlink(self.name.as_ptr());
                }
            }
        }
    }

    impl Drop for ShmTransport {
        fn drop(&mut self) {
            self.close();
        }
    }

    // -- layout helpers ----------------------------------------------------

    fn region_len(capacity: usize) -> usize {
        std::mem::size_of::<RegionHeader>()
            + 2 * (std::mem::size_of::<RingHeader>() + capacity)
    }

    unsafe fn ring_ptr(base: *mut u8, capacity: usize, idx: usize) -> *mut RingHeader {
        let stride = std::mem::size_of::<RingHeader>() + capacity;
        base.add(std::mem::size_of::<RegionHeader>() + idx * stride) as *mut RingHeader
    }

    unsafe fn ring_data(ring: *mut RingHeader) -> *mut u8 {
        (ring as *mut u8).add(std::mem::size_of::<RingHeader>())
    }

    unsafe fn copy_in(ring: *mut RingHeader, cap: usize, head: u32, src: &[u8]) {
        let data = ring_data(ring);
        let pos = head as usize % cap;
        let first = src.len().min(cap - pos);
        std::ptr::copy_nonoverlapping(src.as_ptr(), data.add(pos), first);
        if first < src.len() {
            std::ptr::copy_nonoverlapping(src[first..].as_ptr(), data, src.len() - first);
        }
    }

    unsafe fn copy_out(ring: *mut RingHeader, cap: usize, tail: u32, dst: &mut [u8]) {
        let data = ring_data(ring);
        let pos = tail as usize % cap;
        let first = dst.len().min(cap - pos);
        std::ptr::copy_nonoverlapping(data.add(pos), dst.as_mut_ptr(), first);
        if first < dst.len() {
            std::ptr::copy_nonoverlapping(data, dst[first..].as_mut_ptr(), dst.len() - first);
        }
    }

    unsafe fn map_region(fd: libc::c_int, len: usize) -> Result<*mut u8> {
        let base = libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_SHARED,
            fd,
            0,
        );
        if base == libc::MAP_FAILED {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            bail!("mmap shm region: {err}");
        }
        Ok(base as *mut u8)
    }

    /// Wait on a process-shared semaphore for at most `ms` milliseconds.
    unsafe fn sem_wait_ms(sem: *mut libc::sem_t, ms: u64) -> Result<(), TransportError> {
        let mut now: libc::timespec = std::mem::zeroed();
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut now);
        let ns = now.tv_nsec as u64 + (ms % 1_000) * 1_000_000;
        let abs = libc::timespec {
            tv_sec: now.tv_sec + (ms / 1_000) as libc::time_t + (ns / 1_000_000_000) as libc::time_t,
            tv_nsec: (ns % 1_000_000_000) as libc::c_long,
        };
        loop {
            if libc::sem_timedwait(sem, &abs) == 0 {
                return Ok(());
            }
            let err = std::io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EINTR) => continue,
                // Caller re-checks the counters and its own deadline.
                Some(libc::ETIMEDOUT) => return Ok(()),
                _ => return Err(TransportError::Io(err)),
            }
        }
    }

    fn shm_name(name: &str) -> Result<CString> {
        if name.is_empty() || name.contains('/') {
            bail!("shm name must be a non-empty single path component");
        }
        CString::new(format!("/{name}")).context("shm name contains NUL")
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        fn unique_name(tag: &str) -> String {
            format!("cortex-test-{}-{}", tag, std::process::id())
        }

        #[test]
        fn test_shm_roundtrip_both_directions() {
            let name = unique_name("rt");
            let mut harness = ShmTransport::create(&name, 4096).unwrap();
            let mut adapter = ShmTransport::attach(&name, 2_000).unwrap();

            harness.send_all(b"window bytes").unwrap();
            let mut buf = [0u8; 64];
            let n = adapter.recv(&mut buf, 1_000).unwrap();
            assert_eq!(&buf[..n], b"window bytes");

            adapter.send_all(b"result bytes").unwrap();
            let n = harness.recv(&mut buf, 1_000).unwrap();
            assert_eq!(&buf[..n], b"result bytes");
        }

        #[test]
        fn test_shm_wraparound() {
            let name = unique_name("wrap");
            let mut harness = ShmTransport::create(&name, 4096).unwrap();
            let mut adapter = ShmTransport::attach(&name, 2_000).unwrap();

            // Push several capacities' worth of patterned data through.
            let chunk: Vec<u8> = (0..1500u32).map(|i| (i % 251) as u8).collect();
            for round in 0..10 {
                harness.send_all(&chunk).unwrap();
                let mut got = vec![0u8; chunk.len()];
                let mut filled = 0;
                while filled < got.len() {
                    filled += adapter.recv(&mut got[filled..], 1_000).unwrap();
                }
                assert_eq!(got, chunk, "round {round}");
            }
        }

        #[test]
        fn test_shm_recv_timeout_and_close() {
            let name = unique_name("to");
            let mut harness = ShmTransport::create(&name, 4096).unwrap();
            let mut adapter = ShmTransport::attach(&name, 2_000).unwrap();

            let mut buf = [0u8; 8];
            assert!(adapter.recv(&mut buf, 50).unwrap_err().is_timeout());

            harness.close();
            match adapter.recv(&mut buf, 1_000) {
                Err(TransportError::ConnReset) => {}
                other => panic!("expected ConnReset, got {:?}", other),
            }
        }
    }
}
