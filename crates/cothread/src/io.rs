//! # Cooperative fd I/O
//!
//! Thin wrappers that give coroutine code a blocking programming model
//! over non-blocking file descriptors:
//!
//! ```ignore
//! let listener = CoListener::bind("127.0.0.1:8080")?;
//! loop {
//!     let (mut stream, _) = listener.accept()?;
//!     cothread::spawn(move || {
//!         let mut buf = [0u8; 4096];
//!         while let Ok(n) = stream.read(&mut buf) {
//!             if n == 0 { break; }
//!             stream.write_all(&buf[..n]).ok();
//!         }
//!     })?;
//! }
//! ```
//!
//! Every call issues the syscall directly. On `EAGAIN` it waits in
//! `io_block_wait` for readiness and retries; there is no scheduling
//! logic here. Outside a coroutine the wait is a plain poll(2), so the same
//! code works on an ordinary thread.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::time::{Duration, Instant};

use cothread_runtime::{io_block_switch, io_block_wait, yield_now, FdInterest, IoWaitStatus};

const READABLE: u32 = libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32;
const WRITABLE: u32 = libc::EPOLLOUT as u32;

/// Wait until `fd` reports any of `events`; returns the reported mask
///
/// Fails with `TimedOut` only when `timeout` was given and passed first.
/// If the wait cannot be registered (another task already waits on `fd`)
/// the call yields once and returns an empty mask, and the caller retries
/// its syscall.
pub fn wait_fd(fd: RawFd, events: u32, timeout: Option<Duration>) -> io::Result<u32> {
    let mut fds = [FdInterest::new(fd, events)];
    match io_block_wait(&mut fds, timeout) {
        IoWaitStatus::Ready(_) => Ok(fds[0].revents),
        IoWaitStatus::TimedOut => Err(io::Error::from(io::ErrorKind::TimedOut)),
        IoWaitStatus::NotRegistered => {
            yield_now();
            Ok(0)
        }
    }
}

pub fn wait_readable(fd: RawFd, timeout: Option<Duration>) -> io::Result<u32> {
    wait_fd(fd, READABLE, timeout)
}

pub fn wait_writable(fd: RawFd, timeout: Option<Duration>) -> io::Result<u32> {
    wait_fd(fd, WRITABLE, timeout)
}

/// poll(2) with coroutine semantics; returns how many entries fired
pub fn poll(fds: &mut [FdInterest], timeout: Option<Duration>) -> usize {
    io_block_switch(fds, timeout)
}

/// Put `fd` into non-blocking mode
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Time left until `deadline`, `TimedOut` once it passed
fn remaining(deadline: Option<Instant>) -> io::Result<Option<Duration>> {
    match deadline {
        None => Ok(None),
        Some(d) => {
            let left = d.saturating_duration_since(Instant::now());
            if left.is_zero() {
                Err(io::Error::from(io::ErrorKind::TimedOut))
            } else {
                Ok(Some(left))
            }
        }
    }
}

/// Retry `op` until it stops returning `WouldBlock`, waiting for `events`
/// on `fd` in between
fn retry<T>(
    fd: RawFd,
    events: u32,
    timeout: Option<Duration>,
    mut op: impl FnMut() -> io::Result<T>,
) -> io::Result<T> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                wait_fd(fd, events, remaining(deadline)?)?;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            other => return other,
        }
    }
}

fn cvt(ret: libc::ssize_t) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

/// read(2) on a non-blocking fd
pub fn read(fd: RawFd, buf: &mut [u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry(fd, READABLE, timeout, || {
        cvt(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) })
    })
}

/// write(2) on a non-blocking fd
pub fn write(fd: RawFd, buf: &[u8], timeout: Option<Duration>) -> io::Result<usize> {
    retry(fd, WRITABLE, timeout, || {
        cvt(unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) })
    })
}

/// Write the whole buffer; `timeout` applies to each wait
pub fn write_all(fd: RawFd, mut buf: &[u8], timeout: Option<Duration>) -> io::Result<()> {
    while !buf.is_empty() {
        match write(fd, buf, timeout)? {
            0 => return Err(io::Error::from(io::ErrorKind::WriteZero)),
            n => buf = &buf[n..],
        }
    }
    Ok(())
}

/// Listening TCP socket whose `accept` parks the calling task
pub struct CoListener {
    inner: TcpListener,
}

impl CoListener {
    pub fn bind(addr: impl ToSocketAddrs) -> io::Result<Self> {
        let inner = TcpListener::bind(addr)?;
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    /// Wrap an already-bound listener
    pub fn from_std(inner: TcpListener) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self { inner })
    }

    /// Accept a connection; blocks the calling task until a client connects
    pub fn accept(&self) -> io::Result<(CoStream, SocketAddr)> {
        let (stream, addr) = retry(self.inner.as_raw_fd(), READABLE, None, || self.inner.accept())?;
        stream.set_nodelay(true)?;
        Ok((CoStream::from_std(stream)?, addr))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }
}

impl AsRawFd for CoListener {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

/// TCP connection whose reads and writes park the calling task
pub struct CoStream {
    inner: TcpStream,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl CoStream {
    pub fn from_std(inner: TcpStream) -> io::Result<Self> {
        inner.set_nonblocking(true)?;
        Ok(Self {
            inner,
            read_timeout: None,
            write_timeout: None,
        })
    }

    /// Connect without blocking the worker thread
    pub fn connect(addr: SocketAddr, timeout: Option<Duration>) -> io::Result<Self> {
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe {
            libc::socket(
                family,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // Safety: fd is a fresh socket we own; closed on every error path
        let stream = unsafe { TcpStream::from_raw_fd(fd) };

        let (storage, len) = sockaddr_of(&addr);
        let ret = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(err);
            }
            wait_fd(fd, WRITABLE, timeout)?;
            if let Some(err) = stream.take_error()? {
                return Err(err);
            }
        }

        stream.set_nodelay(true)?;
        Self::from_std(stream)
    }

    pub fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    pub fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        self.inner.peer_addr()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        self.inner.shutdown(how)
    }
}

impl Read for CoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        let inner = &mut self.inner;
        retry(fd, READABLE, self.read_timeout, || inner.read(buf))
    }
}

impl Write for CoStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fd = self.inner.as_raw_fd();
        let inner = &mut self.inner;
        retry(fd, WRITABLE, self.write_timeout, || inner.write(buf))
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for CoStream {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

fn sockaddr_of(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    // Safety: all-zero is a valid sockaddr_storage
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(a) => {
            let sin = libc::sockaddr_in {
                sin_family: libc::AF_INET as libc::sa_family_t,
                sin_port: a.port().to_be(),
                sin_addr: libc::in_addr {
                    s_addr: u32::from_ne_bytes(a.ip().octets()),
                },
                sin_zero: [0; 8],
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in, sin) };
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(a) => {
            let sin6 = libc::sockaddr_in6 {
                sin6_family: libc::AF_INET6 as libc::sa_family_t,
                sin6_port: a.port().to_be(),
                sin6_flowinfo: a.flowinfo(),
                sin6_addr: libc::in6_addr {
                    s6_addr: a.ip().octets(),
                },
                sin6_scope_id: a.scope_id(),
            };
            unsafe { std::ptr::write(&mut storage as *mut _ as *mut libc::sockaddr_in6, sin6) };
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Scheduler, SchedulerConfig};
    use std::sync::{Arc, Mutex};

    fn pipe() -> (RawFd, RawFd) {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) }, 0);
        (fds[0], fds[1])
    }

    fn sched() -> Arc<Scheduler> {
        Scheduler::new(SchedulerConfig::new().stack_size(64 * 1024)).unwrap()
    }

    #[test]
    fn test_pipe_read_write_tasks() {
        let s = sched();
        let (r, w) = pipe();
        let got = Arc::new(Mutex::new(Vec::new()));

        let g = got.clone();
        s.spawn(move || {
            let mut buf = [0u8; 16];
            let n = read(r, &mut buf, Some(Duration::from_secs(5))).unwrap();
            g.lock().unwrap().extend_from_slice(&buf[..n]);
        })
        .unwrap();
        s.spawn(move || {
            crate::sleep_ms(10);
            write_all(w, b"hello", None).unwrap();
        })
        .unwrap();

        s.run_until_no_task().unwrap();
        assert_eq!(&got.lock().unwrap()[..], b"hello");
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_two_readers_share_fd() {
        let s = sched();
        let (r, w) = pipe();
        let results = Arc::new(Mutex::new(Vec::new()));

        for _ in 0..2 {
            let res = results.clone();
            s.spawn(move || {
                let mut buf = [0u8; 1];
                let got = read(r, &mut buf, None).map_err(|e| e.kind());
                res.lock().unwrap().push(got);
            })
            .unwrap();
        }
        s.spawn(move || {
            crate::sleep_ms(20);
            write_all(w, b"ab", None).unwrap();
        })
        .unwrap();

        s.run_until_no_task().unwrap();
        assert_eq!(*results.lock().unwrap(), vec![Ok(1), Ok(1)]);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_second_waiter_times_out_only_with_timeout() {
        let s = sched();
        let (r, w) = pipe();
        let outcome = Arc::new(Mutex::new(Vec::new()));

        for timeout in [None, Some(Duration::from_millis(30))] {
            let out = outcome.clone();
            s.spawn(move || {
                let mut buf = [0u8; 1];
                let got = read(r, &mut buf, timeout).map_err(|e| e.kind());
                out.lock().unwrap().push((timeout.is_some(), got));
            })
            .unwrap();
        }
        s.spawn(move || {
            crate::sleep_ms(100);
            write_all(w, b"z", None).unwrap();
        })
        .unwrap();

        s.run_until_no_task().unwrap();
        let mut got = outcome.lock().unwrap().clone();
        got.sort();
        assert_eq!(got, vec![(false, Ok(1)), (true, Err(io::ErrorKind::TimedOut))]);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_read_timeout_outside_coroutine() {
        let (r, w) = pipe();
        let mut buf = [0u8; 4];
        let err = read(r, &mut buf, Some(Duration::from_millis(20))).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn test_set_nonblocking_idempotent() {
        let mut fds = [0; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        set_nonblocking(fds[0]).unwrap();
        set_nonblocking(fds[0]).unwrap();
        let flags = unsafe { libc::fcntl(fds[0], libc::F_GETFL) };
        assert!(flags & libc::O_NONBLOCK != 0);
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
    }

    #[test]
    fn test_tcp_echo_round_trip() {
        let s = sched();
        let listener = CoListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let reply = Arc::new(Mutex::new(Vec::new()));

        s.spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 64];
            let n = stream.read(&mut buf).unwrap();
            stream.write_all(&buf[..n]).unwrap();
        })
        .unwrap();

        let rep = reply.clone();
        s.spawn(move || {
            let mut stream = CoStream::connect(addr, Some(Duration::from_secs(5))).unwrap();
            stream.set_read_timeout(Some(Duration::from_secs(5)));
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            rep.lock().unwrap().extend_from_slice(&buf);
        })
        .unwrap();

        s.run_until_no_task().unwrap();
        assert_eq!(&reply.lock().unwrap()[..], b"ping");
    }
}
