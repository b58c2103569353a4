//! Stop-pipe cancellation primitive
//!
//! Combines "wait until this socket is ready" with "wait until someone asks
//! us to stop" in a single `poll` call. Workers never sleep-poll: every
//! blocking wait goes through one of the `select_*` methods, and `stop()`
//! wakes all of them immediately.

use std::io::{self, Read, Write};
use std::net::{Ipv4Addr, UdpSocket};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Outcome of waiting on a single descriptor
#[derive(Debug)]
pub enum SelectResult {
    Ready,
    Canceled,
    Timeout,
    Error(io::Error),
}

/// Outcome of waiting on two descriptors
#[derive(Debug)]
pub enum EitherResult {
    A,
    B,
    Both,
    Canceled,
    Timeout,
    Error(io::Error),
}

enum Channel {
    /// Connected socket pair; `stop()` writes one byte into `tx`
    Pair { tx: UnixStream, rx: UnixStream },
    /// Loopback UDP socket connected to itself
    Loopback(UdpSocket),
}

/// Waitable cancellation signal
pub struct StopPipe {
    channel: Channel,
    stopped: AtomicBool,
}

impl StopPipe {
    /// Create a stop-pipe backed by a unix socket pair
    pub fn new() -> io::Result<Self> {
        let (tx, rx) = UnixStream::pair()?;
        tx.set_nonblocking(true)?;
        rx.set_nonblocking(true)?;
        Ok(Self {
            channel: Channel::Pair { tx, rx },
            stopped: AtomicBool::new(false),
        })
    }

    /// Create a stop-pipe backed by a loopback UDP socket bound to an
    /// ephemeral port, for systems without socket pairs
    pub fn loopback() -> io::Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))?;
        socket.connect(socket.local_addr()?)?;
        socket.set_nonblocking(true)?;
        Ok(Self {
            channel: Channel::Loopback(socket),
            stopped: AtomicBool::new(false),
        })
    }

    fn wake_fd(&self) -> RawFd {
        match &self.channel {
            Channel::Pair { rx, .. } => rx.as_raw_fd(),
            Channel::Loopback(socket) => socket.as_raw_fd(),
        }
    }

    /// Signal cancellation to every current and future waiter
    pub fn stop(&self) -> io::Result<()> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let result = match &self.channel {
            Channel::Pair { tx, .. } => (&*tx).write(&[0u8]).map(|_| ()),
            Channel::Loopback(socket) => socket.send(&[0u8]).map(|_| ()),
        };
        match result {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(()),
            other => other,
        }
    }

    /// Drain the pending signal so the pipe can be reused
    pub fn reset(&self) {
        let mut scratch = [0u8; 16];
        loop {
            let n = match &self.channel {
                Channel::Pair { rx, .. } => (&*rx).read(&mut scratch),
                Channel::Loopback(socket) => socket.recv(&mut scratch),
            };
            match n {
                Ok(0) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        self.stopped.store(false, Ordering::SeqCst);
    }

    /// Whether `stop()` has been called since the last reset
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Wait until `fd` is readable (or writable) or the pipe is stopped
    pub fn select_single(&self, fd: RawFd, for_write: bool, timeout: Option<Duration>) -> SelectResult {
        if self.is_stopped() {
            return SelectResult::Canceled;
        }
        let interest = if for_write { libc::POLLOUT } else { libc::POLLIN };
        let mut fds = [pollfd(fd, interest), pollfd(self.wake_fd(), libc::POLLIN)];

        match poll(&mut fds, timeout) {
            Err(e) => SelectResult::Error(e),
            Ok(0) => SelectResult::Timeout,
            Ok(_) if fds[1].revents != 0 => SelectResult::Canceled,
            Ok(_) if fds[0].revents & libc::POLLNVAL != 0 => {
                SelectResult::Error(io::Error::from_raw_os_error(libc::EBADF))
            }
            Ok(_) if fds[0].revents != 0 => SelectResult::Ready,
            Ok(_) => SelectResult::Timeout,
        }
    }

    /// Wait until either descriptor is readable or the pipe is stopped
    pub fn select_either(&self, fd_a: RawFd, fd_b: RawFd, timeout: Option<Duration>) -> EitherResult {
        if self.is_stopped() {
            return EitherResult::Canceled;
        }
        let mut fds = [
            pollfd(fd_a, libc::POLLIN),
            pollfd(fd_b, libc::POLLIN),
            pollfd(self.wake_fd(), libc::POLLIN),
        ];

        match poll(&mut fds, timeout) {
            Err(e) => EitherResult::Error(e),
            Ok(0) => EitherResult::Timeout,
            Ok(_) if fds[2].revents != 0 => EitherResult::Canceled,
            Ok(_) => match (fds[0].revents != 0, fds[1].revents != 0) {
                (true, true) => EitherResult::Both,
                (true, false) => EitherResult::A,
                (false, true) => EitherResult::B,
                (false, false) => EitherResult::Timeout,
            },
        }
    }

    /// Sleep for `duration` unless stopped first.
    ///
    /// Returns `false` if the sleep was cut short by `stop()`.
    pub fn sleep(&self, duration: Duration) -> bool {
        if self.is_stopped() {
            return false;
        }
        let mut fds = [pollfd(self.wake_fd(), libc::POLLIN)];
        match poll(&mut fds, Some(duration)) {
            Ok(0) => true,
            Ok(_) => false,
            Err(_) => !self.is_stopped(),
        }
    }
}

fn pollfd(fd: RawFd, events: libc::c_short) -> libc::pollfd {
    libc::pollfd { fd, events, revents: 0 }
}

fn poll(fds: &mut [libc::pollfd], timeout: Option<Duration>) -> io::Result<usize> {
    let timeout_ms = match timeout {
        None => -1,
        Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
    };
    loop {
        // SAFETY: `fds` is a valid, exclusively borrowed slice of pollfd structs
        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms) };
        if rc >= 0 {
            return Ok(rc as usize);
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}
