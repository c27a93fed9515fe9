//! Reactor Binding
//!
//! Registers the listening socket with the tokio reactor for read
//! readiness and yields one notification at a time to the proxy. A
//! notification says only "the socket is readable now"; the proxy drains it
//! with non-blocking reads.
//!
//! Shutdown is a `watch` flag rather than a broadcast so that a stop issued
//! before the loop starts is still observed.

use std::io;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, trace};

/// Outcome of one reactor wait
#[derive(Debug)]
pub enum Readiness {
    /// The socket has at least one datagram pending (or spuriously woke)
    Readable,
    /// Stop was requested; the socket is no longer registered
    Shutdown,
    /// The reactor reported an error for the socket
    Failed(io::Error),
}

/// Cloneable handle that stops a running proxy
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Request shutdown. Idempotent.
    pub fn stop(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once shutdown has been requested
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-readiness registration of the listening socket
pub struct Reactor {
    socket: Option<Arc<UdpSocket>>,
    shutdown_rx: watch::Receiver<bool>,
    notifications: u64,
}

impl Reactor {
    /// Register `socket` for read readiness
    pub fn register(socket: Arc<UdpSocket>, shutdown: &ShutdownHandle) -> Self {
        debug!(
            "Reactor: watching {:?} for read readiness",
            socket.local_addr().ok()
        );
        Self {
            socket: Some(socket),
            shutdown_rx: shutdown.subscribe(),
            notifications: 0,
        }
    }

    pub fn is_registered(&self) -> bool {
        self.socket.is_some()
    }

    /// Readiness notifications delivered so far
    pub fn notifications(&self) -> u64 {
        self.notifications
    }

    /// Wait for the next readiness notification or a stop request
    pub async fn wait(&mut self) -> Readiness {
        let socket = match &self.socket {
            Some(s) => s.clone(),
            None => return Readiness::Shutdown,
        };

        if *self.shutdown_rx.borrow() {
            self.deregister();
            return Readiness::Shutdown;
        }

        let shutdown_rx = &mut self.shutdown_rx;
        let woke = tokio::select! {
            biased;
            _ = shutdown_rx.wait_for(|stopped| *stopped) => None,
            result = socket.readable() => Some(result),
        };

        match woke {
            None => {
                self.deregister();
                Readiness::Shutdown
            }
            Some(Ok(())) => {
                self.notifications += 1;
                trace!("Reactor: readable (notification #{})", self.notifications);
                Readiness::Readable
            }
            Some(Err(e)) => Readiness::Failed(e),
        }
    }

    /// Stop watching the socket
    pub fn deregister(&mut self) {
        if self.socket.take().is_some() {
            debug!(
                "Reactor: deregistered after {} notification(s)",
                self.notifications
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_readable_after_datagram() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let shutdown = ShutdownHandle::new();
        let mut reactor = Reactor::register(socket.clone(), &shutdown);

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"x", socket.local_addr().unwrap()).await.unwrap();

        let readiness = tokio::time::timeout(Duration::from_secs(5), reactor.wait())
            .await
            .unwrap();
        assert!(matches!(readiness, Readiness::Readable));
        assert_eq!(reactor.notifications(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_wait_is_observed() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let shutdown = ShutdownHandle::new();
        let mut reactor = Reactor::register(socket, &shutdown);

        shutdown.stop();
        assert!(matches!(reactor.wait().await, Readiness::Shutdown));
        assert!(!reactor.is_registered());
        assert!(matches!(reactor.wait().await, Readiness::Shutdown));
    }

    #[tokio::test]
    async fn test_stop_wakes_waiter() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let shutdown = ShutdownHandle::new();
        let mut reactor = Reactor::register(socket, &shutdown);

        let stopper = shutdown.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            stopper.stop();
        });

        let readiness = tokio::time::timeout(Duration::from_secs(5), reactor.wait())
            .await
            .unwrap();
        assert!(matches!(readiness, Readiness::Shutdown));
        assert!(shutdown.is_stopped());
    }
}
