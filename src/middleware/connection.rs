// Per-connection identity and liveness for keep-alive safety
// HTTP keep-alive reuses one TCP connection for many requests; a waiter
// that outlives its client must be able to tell both that the connection
// under it has closed and that it still belongs to the same exchange. Each
// accepted connection gets a fresh UUID and a closed flag: the instance
// minted at accept time owns the flag's guard, request copies only observe
// it, so the flag flips exactly when the connection task tears down.

use axum::extract::connect_info::Connected;
use axum::serve::IncomingStream;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use uuid::Uuid;

/// Read side of the connection-closed flag; cheap to clone into waiters.
#[derive(Debug, Clone)]
pub struct ConnLiveness {
    rx: watch::Receiver<bool>,
}

impl ConnLiveness {
    pub fn is_closed(&self) -> bool {
        *self.rx.borrow()
    }
}

/// Owned by the connection-scoped [`ClientConn`]; dropping it marks the
/// connection closed for every observer.
#[derive(Debug)]
struct ConnClosedGuard {
    tx: watch::Sender<bool>,
}

impl Drop for ConnClosedGuard {
    fn drop(&mut self) {
        self.tx.send_replace(true);
    }
}

/// Identity of the TCP connection a request arrived on.
#[derive(Debug)]
pub struct ClientConn {
    pub conn_id: Uuid,
    pub remote_addr: SocketAddr,
    liveness: ConnLiveness,
    guard: Option<Arc<ConnClosedGuard>>,
}

impl ClientConn {
    /// Connection-owned identity. Dropping the returned value (the accept
    /// task tearing the connection down) flips the closed flag for every
    /// clone handed to requests.
    pub fn new(remote_addr: SocketAddr) -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            conn_id: Uuid::new_v4(),
            remote_addr,
            liveness: ConnLiveness { rx },
            guard: Some(Arc::new(ConnClosedGuard { tx })),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.liveness.is_closed()
    }

    pub fn liveness(&self) -> ConnLiveness {
        self.liveness.clone()
    }
}

impl Clone for ClientConn {
    // Request copies never hold the guard: the flag must flip when the
    // connection task drops its original, not when the last request
    // referencing it finishes.
    fn clone(&self) -> Self {
        Self {
            conn_id: self.conn_id,
            remote_addr: self.remote_addr,
            liveness: self.liveness.clone(),
            guard: None,
        }
    }
}

impl Connected<IncomingStream<'_, TcpListener>> for ClientConn {
    fn connect_info(stream: IncomingStream<'_, TcpListener>) -> Self {
        Self::new(*stream.remote_addr())
    }
}

/// Socket identity recorded at queue entry: the joint (token, connection)
/// pair must survive the wait unchanged before a slot may be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueIdentity {
    pub queue_token: Uuid,
    pub conn_id: Option<Uuid>,
}

/// Verify the socket-identity pair after a queue wait.
///
/// Both halves must hold: the token stored on the request equals the one
/// recorded at entry, and the connection the request currently rides is
/// the one it entered on. Either half diverging means the slot belongs to
/// a foreign exchange and must be given back.
pub fn socket_identity_intact(
    entry: QueueIdentity,
    stored: Option<QueueIdentity>,
    current_conn_id: Option<Uuid>,
) -> bool {
    match stored {
        Some(stored) => {
            stored.queue_token == entry.queue_token && current_conn_id == entry.conn_id
        },
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:4100".parse().unwrap()
    }

    #[test]
    fn test_closed_flag_flips_when_primary_drops() {
        let conn = ClientConn::new(addr());
        let request_copy = conn.clone();
        let liveness = request_copy.liveness();

        assert!(!request_copy.is_closed());
        assert!(!liveness.is_closed());

        drop(conn);
        assert!(request_copy.is_closed());
        assert!(liveness.is_closed());
    }

    #[test]
    fn test_request_copies_do_not_hold_the_connection_open() {
        let conn = ClientConn::new(addr());
        let copy_a = conn.clone();
        let copy_b = copy_a.clone();

        // Dropping request copies changes nothing
        drop(copy_a);
        assert!(!copy_b.is_closed());

        drop(conn);
        assert!(copy_b.is_closed());
    }

    #[test]
    fn test_identity_intact_when_both_halves_match() {
        let entry = QueueIdentity {
            queue_token: Uuid::new_v4(),
            conn_id: Some(Uuid::new_v4()),
        };
        assert!(socket_identity_intact(entry, Some(entry), entry.conn_id));
    }

    #[test]
    fn test_identity_fails_on_token_mismatch() {
        let entry = QueueIdentity {
            queue_token: Uuid::new_v4(),
            conn_id: Some(Uuid::new_v4()),
        };
        let stored = QueueIdentity {
            queue_token: Uuid::new_v4(),
            conn_id: entry.conn_id,
        };
        assert!(!socket_identity_intact(entry, Some(stored), entry.conn_id));
    }

    #[test]
    fn test_identity_fails_on_connection_mismatch() {
        let entry = QueueIdentity {
            queue_token: Uuid::new_v4(),
            conn_id: Some(Uuid::new_v4()),
        };
        // Token survived but the request now rides a different connection
        assert!(!socket_identity_intact(
            entry,
            Some(entry),
            Some(Uuid::new_v4())
        ));
        // Or lost its connection info entirely
        assert!(!socket_identity_intact(entry, Some(entry), None));
    }

    #[test]
    fn test_identity_fails_when_entry_record_is_gone() {
        let entry = QueueIdentity {
            queue_token: Uuid::new_v4(),
            conn_id: None,
        };
        assert!(!socket_identity_intact(entry, None, None));
    }

    #[test]
    fn test_identity_without_transport_info_matches() {
        // No connect info on either side (e.g. in-process callers)
        let entry = QueueIdentity {
            queue_token: Uuid::new_v4(),
            conn_id: None,
        };
        assert!(socket_identity_intact(entry, Some(entry), None));
    }
}
