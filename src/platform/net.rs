//! Cancelable connect helper

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::AsRawFd;
use std::time::Duration;

use crate::error::{Error, NetworkError};
use crate::platform::stop_pipe::{SelectResult, StopPipe};

/// Closed set of connect failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectErrorKind {
    Refused,
    HostDown,
    HostUnreach,
    Timeout,
    Canceled,
    Unknown,
}

impl ConnectErrorKind {
    /// Map a platform error into the closed set
    pub fn from_io(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::ECONNREFUSED) => return ConnectErrorKind::Refused,
            Some(libc::EHOSTDOWN) => return ConnectErrorKind::HostDown,
            Some(libc::EHOSTUNREACH) | Some(libc::ENETUNREACH) => return ConnectErrorKind::HostUnreach,
            Some(libc::ETIMEDOUT) => return ConnectErrorKind::Timeout,
            _ => {}
        }
        match err.kind() {
            io::ErrorKind::ConnectionRefused => ConnectErrorKind::Refused,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => ConnectErrorKind::Timeout,
            _ => ConnectErrorKind::Unknown,
        }
    }

    /// Lift into the crate error for a connect to `addr`
    pub fn into_error(self, addr: SocketAddr) -> Error {
        match self {
            ConnectErrorKind::Refused => NetworkError::Refused(addr.to_string()).into(),
            ConnectErrorKind::HostDown => NetworkError::HostDown(addr.to_string()).into(),
            ConnectErrorKind::HostUnreach => NetworkError::HostUnreachable(addr.to_string()).into(),
            ConnectErrorKind::Timeout => Error::Timeout(format!("connect to {addr}")),
            ConnectErrorKind::Canceled => NetworkError::Canceled.into(),
            ConnectErrorKind::Unknown => NetworkError::ConnectionFailed(addr.to_string()).into(),
        }
    }
}

impl std::fmt::Display for ConnectErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ConnectErrorKind::Refused => "connection refused",
            ConnectErrorKind::HostDown => "host down",
            ConnectErrorKind::HostUnreach => "host unreachable",
            ConnectErrorKind::Timeout => "timed out",
            ConnectErrorKind::Canceled => "canceled",
            ConnectErrorKind::Unknown => "unknown error",
        };
        f.write_str(text)
    }
}

/// Connect a TCP stream, waiting through the stop-pipe.
///
/// `timeout = None` waits until the connect resolves or the pipe is stopped.
pub fn connect_tcp(
    addr: SocketAddr,
    timeout: Option<Duration>,
    stop: &StopPipe,
) -> Result<TcpStream, ConnectErrorKind> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ConnectErrorKind::from_io(&e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ConnectErrorKind::from_io(&e))?;

    match socket.connect(&SockAddr::from(addr)) {
        Ok(()) => {}
        Err(e) if e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock => {
            match stop.select_single(socket.as_raw_fd(), true, timeout) {
                SelectResult::Ready => {}
                SelectResult::Canceled => return Err(ConnectErrorKind::Canceled),
                SelectResult::Timeout => return Err(ConnectErrorKind::Timeout),
                SelectResult::Error(e) => return Err(ConnectErrorKind::from_io(&e)),
            }
            if let Some(e) = socket.take_error().map_err(|e| ConnectErrorKind::from_io(&e))? {
                return Err(ConnectErrorKind::from_io(&e));
            }
        }
        Err(e) => return Err(ConnectErrorKind::from_io(&e)),
    }

    socket
        .set_nonblocking(false)
        .map_err(|e| ConnectErrorKind::from_io(&e))?;
    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn test_connect_succeeds() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stop = StopPipe::new().unwrap();
        let stream = connect_tcp(listener.local_addr().unwrap(), Some(Duration::from_secs(2)), &stop);
        assert!(stream.is_ok());
    }

    #[test]
    fn test_connect_refused() {
        // Bind then drop to find a port with nothing listening
        let port = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port();
        let stop = StopPipe::new().unwrap();
        let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
        let result = connect_tcp(addr, Some(Duration::from_secs(2)), &stop);
        assert_eq!(result.err(), Some(ConnectErrorKind::Refused));
    }

    #[test]
    fn test_classify_raw_codes() {
        let err = io::Error::from_raw_os_error(libc::EHOSTUNREACH);
        assert_eq!(ConnectErrorKind::from_io(&err), ConnectErrorKind::HostUnreach);
        let err = io::Error::from_raw_os_error(libc::EHOSTDOWN);
        assert_eq!(ConnectErrorKind::from_io(&err), ConnectErrorKind::HostDown);
    }
}
