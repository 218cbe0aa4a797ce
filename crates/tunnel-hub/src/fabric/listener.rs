//! Virtual listener (C2, §4.2): an in-memory `Listener`-shaped object whose
//! `accept` pulls from an internal handoff queue and whose `dial` enqueues a
//! bidirectional in-memory pipe.
//!
//! Grounded on the accept/cancel rendezvous shape of
//! `gateway/listener.rs`'s `ReverseListenerManager`, simplified to the
//! synchronous hand-off `dial`/`accept` pair this module specifies: `dial`
//! does not return until some `accept` has taken delivery of the paired
//! connection, approximated here with a bounded mpsc channel plus a oneshot
//! acknowledgement rather than a literally zero-capacity channel (tokio has
//! no such primitive).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};

use tunnel_core::error::{TunnelError, TunnelResult};

const DUPLEX_BUF: usize = 64 * 1024;
const HANDOFF_CAPACITY: usize = 32;

struct Handoff {
    remote: DuplexStream,
    ack: oneshot::Sender<()>,
}

/// In-memory listener/dial pair. Cloning shares the same underlying queue
/// and close latch (it is reference-counted internally).
#[derive(Clone)]
pub struct VirtualListener {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    closed: AtomicBool,
    notify: Notify,
    tx: mpsc::Sender<Handoff>,
    rx: Mutex<mpsc::Receiver<Handoff>>,
}

impl VirtualListener {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                closed: AtomicBool::new(false),
                notify: Notify::new(),
                tx,
                rx: Mutex::new(rx),
            }),
        }
    }

    /// Synthetic `virtual:<name>` address (§4.2).
    pub fn addr(&self) -> String {
        format!("virtual:{}", self.inner.name)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Idempotent. After close, pending and future `accept`/`dial` return
    /// `TransportClosed` (VL1).
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Blocks until a peer `dial`s this listener, or it is closed.
    pub async fn accept(&self) -> TunnelResult<DuplexStream> {
        loop {
            if self.is_closed() {
                return Err(TunnelError::TransportClosed);
            }
            let mut rx = self.inner.rx.lock().await;
            tokio::select! {
                biased;
                _ = self.inner.notify.notified() => {
                    return Err(TunnelError::TransportClosed);
                }
                handoff = rx.recv() => {
                    drop(rx);
                    match handoff {
                        Some(Handoff { remote, ack }) => {
                            let _ = ack.send(());
                            return Ok(remote);
                        }
                        None => return Err(TunnelError::TransportClosed),
                    }
                }
            }
        }
    }

    /// Constructs a pipe pair, hands the remote half to the next `accept`,
    /// and returns the local half once that `accept` has taken delivery
    /// (VL2).
    pub async fn dial(&self) -> TunnelResult<DuplexStream> {
        if self.is_closed() {
            return Err(TunnelError::TransportClosed);
        }
        let (local, remote) = tokio::io::duplex(DUPLEX_BUF);
        let (ack_tx, ack_rx) = oneshot::channel();

        tokio::select! {
            biased;
            _ = self.inner.notify.notified() => return Err(TunnelError::TransportClosed),
            res = self.inner.tx.send(Handoff { remote, ack: ack_tx }) => {
                res.map_err(|_| TunnelError::TransportClosed)?;
            }
        }

        tokio::select! {
            biased;
            _ = self.inner.notify.notified() => Err(TunnelError::TransportClosed),
            res = ack_rx => {
                res.map_err(|_| TunnelError::TransportClosed)?;
                Ok(local)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn dial_and_accept_exchange_bytes_both_ways() {
        let l = VirtualListener::new("svc");
        let l2 = l.clone();

        let accepted = tokio::spawn(async move { l2.accept().await.unwrap() });
        let mut local = l.dial().await.unwrap();
        let mut remote = accepted.await.unwrap();

        local.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        remote.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        remote.write_all(b"pong").await.unwrap();
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn close_causes_future_accept_and_dial_to_fail() {
        let l = VirtualListener::new("svc");
        l.close();
        assert!(matches!(l.accept().await, Err(TunnelError::TransportClosed)));
        assert!(matches!(l.dial().await, Err(TunnelError::TransportClosed)));
    }

    #[tokio::test]
    async fn pending_accept_is_woken_by_close() {
        let l = VirtualListener::new("svc");
        let l2 = l.clone();
        let accept = tokio::spawn(async move { l2.accept().await });
        tokio::task::yield_now().await;
        l.close();
        let result = accept.await.unwrap();
        assert!(matches!(result, Err(TunnelError::TransportClosed)));
    }

    #[tokio::test]
    async fn addr_is_virtual_prefixed() {
        let l = VirtualListener::new("ssh");
        assert_eq!(l.addr(), "virtual:ssh");
    }
}
