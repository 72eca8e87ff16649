//! Reactor bridge: the event multiplexer for application-facing sockets.
//!
//! The reactor itself lives outside this crate. The shim only needs to push
//! bytes into a local socket, close it, and wake the reactor; the reactor in
//! turn reports readiness and close events through [`ReactorEvent`].

use std::fmt;
use std::io;
use std::net::SocketAddr;

use crate::connection::ConnectionId;

/// Handle of an application-facing local socket owned by the reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalSocket(pub u64);

impl fmt::Display for LocalSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.0)
    }
}

/// Operations the shim performs on the reactor.
pub trait ReactorBridge: Send + Sync {
    /// Write bytes to the application side of `sock`.
    ///
    /// Returns how many bytes the socket accepted; the rest stays staged
    /// in the connection until the next writable event.
    fn write_local(&self, sock: LocalSocket, data: &[u8]) -> io::Result<usize>;

    /// Close the local socket.
    fn close_local(&self, sock: LocalSocket);

    /// Stop (`true`) or resume (`false`) reading application data from
    /// `sock`. The shim pauses a socket while its outbound staging buffer
    /// is full, so the reactor keeps unread bytes in the socket itself.
    fn set_read_paused(&self, _sock: LocalSocket, _paused: bool) {}

    /// Wake the reactor out of a blocking wait.
    fn wake(&self) {}
}

/// Bridge used when no reactor is attached: swallows everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullBridge;

impl ReactorBridge for NullBridge {
    fn write_local(&self, _sock: LocalSocket, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }

    fn close_local(&self, _sock: LocalSocket) {}
}

/// Events delivered by the reactor for a local socket.
///
/// `conn` is the connection associated with the socket, if any. Only the
/// `Local*` events carry behaviour; the remaining variants exist so a
/// reactor can forward everything it sees.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactorEvent {
    /// The application closed its end.
    LocalClose {
        sock: LocalSocket,
        conn: Option<ConnectionId>,
    },
    /// The application wrote data.
    LocalData {
        sock: LocalSocket,
        conn: Option<ConnectionId>,
        data: Vec<u8>,
    },
    /// The local socket can take more inbound bytes.
    LocalWritable {
        sock: LocalSocket,
        conn: Option<ConnectionId>,
    },
    Datagram {
        sock: LocalSocket,
        from: SocketAddr,
        data: Vec<u8>,
    },
    TcpConnect {
        sock: LocalSocket,
        success: bool,
    },
    TcpAccept {
        listener: LocalSocket,
        sock: LocalSocket,
        from: SocketAddr,
    },
    TcpClose {
        sock: LocalSocket,
    },
    TcpData {
        sock: LocalSocket,
        data: Vec<u8>,
    },
    TcpWritable {
        sock: LocalSocket,
    },
}

impl ReactorEvent {
    pub fn socket(&self) -> LocalSocket {
        match self {
            ReactorEvent::LocalClose { sock, .. }
            | ReactorEvent::LocalData { sock, .. }
            | ReactorEvent::LocalWritable { sock, .. }
            | ReactorEvent::Datagram { sock, .. }
            | ReactorEvent::TcpConnect { sock, .. }
            | ReactorEvent::TcpAccept { sock, .. }
            | ReactorEvent::TcpClose { sock }
            | ReactorEvent::TcpData { sock, .. }
            | ReactorEvent::TcpWritable { sock } => *sock,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_bridge_accepts_everything() {
        let bridge = NullBridge;
        assert_eq!(bridge.write_local(LocalSocket(1), b"hello").unwrap(), 5);
        bridge.close_local(LocalSocket(1));
        bridge.set_read_paused(LocalSocket(1), true);
        bridge.wake();
    }

    #[test]
    fn test_event_socket() {
        let ev = ReactorEvent::TcpAccept {
            listener: LocalSocket(1),
            sock: LocalSocket(2),
            from: "10.0.0.1:80".parse().unwrap(),
        };
        assert_eq!(ev.socket(), LocalSocket(2));
        assert_eq!(LocalSocket(9).to_string(), "local#9");
    }
}
