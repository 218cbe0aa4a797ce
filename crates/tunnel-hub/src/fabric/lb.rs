//! LB node (C4, §4.4): aggregates N virtual-listener endpoints for one
//! `(ap, service)` behind one or more public front listeners, dispatching
//! by least-active-connections.
//!
//! `NodeArena` resolves the cyclic LB/endpoint ownership design note (§9):
//! nodes live in an arena keyed by `(ap, service)`; endpoints hold an index
//! into the node's endpoint map, never a pointer back to the node.
//! Grounded on `original_source/server/register_lb.go`'s `Nodes` arena with
//! explicit `Count`/`Add`/`Remove`, adapted to the accept/cancel task shape
//! of `gateway/forwarder.rs`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, UnixListener};
use tokio::sync::RwLock;

use tunnel_core::error::{TunnelError, TunnelResult};

use super::listener::VirtualListener;

struct EndpointState {
    listener: VirtualListener,
    active: Arc<AtomicUsize>,
}

/// One aggregation point for endpoints of a declared `(ap, service)`.
pub struct LbNode {
    ap: String,
    service: String,
    max_count: u32,
    endpoints: RwLock<HashMap<String, EndpointState>>,
    /// In-memory front used by HTTP/WS callers.
    pub default_front: VirtualListener,
    sockets_dir: Option<PathBuf>,
    public_addr: Option<String>,
    unix_socket: bool,
    cancel: tokio_util::sync::CancellationToken,
    fronts_started: AtomicBool,
    front_tasks: StdMutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl LbNode {
    fn new(
        ap: &str,
        service: &str,
        max_count: u32,
        sockets_dir: Option<PathBuf>,
        public_addr: Option<String>,
        unix_socket: bool,
    ) -> Arc<Self> {
        Arc::new(Self {
            ap: ap.to_string(),
            service: service.to_string(),
            max_count,
            endpoints: RwLock::new(HashMap::new()),
            default_front: VirtualListener::new(format!("lb:{ap}:{service}")),
            sockets_dir,
            public_addr,
            unix_socket,
            cancel: tokio_util::sync::CancellationToken::new(),
            fronts_started: AtomicBool::new(false),
            front_tasks: StdMutex::new(Vec::new()),
        })
    }

    fn unix_socket_path(&self) -> Option<PathBuf> {
        self.sockets_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}-{}.sock", self.ap, self.service)))
    }

    /// Bind this node's public TCP/UNIX front listeners, once (§4.4: a
    /// declared `public_addr`/`unix_socket` must actually be reachable from
    /// outside the tunnel, not just tracked in memory). Idempotent — later
    /// endpoints joining an already-fronted node are no-ops here.
    pub fn start_fronts(self: &Arc<Self>) {
        if self.fronts_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = self.front_tasks.lock().unwrap();
        if let Some(addr) = self.public_addr.clone() {
            let node = self.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = run_tcp_front(node, addr).await {
                    tracing::warn!(error = %e, "lb tcp front exited");
                }
            }));
        }
        if self.unix_socket {
            if let Some(path) = self.unix_socket_path() {
                let node = self.clone();
                tasks.push(tokio::spawn(async move {
                    if let Err(e) = run_unix_front(node, path).await {
                        tracing::warn!(error = %e, "lb unix front exited");
                    }
                }));
            }
        }
    }

    pub fn endpoint_count_blocking(&self) -> usize {
        self.endpoints.blocking_read().len()
    }

    pub async fn endpoint_count(&self) -> usize {
        self.endpoints.read().await.len()
    }

    /// Append an endpoint. Fails with `RegistrationOverflow` at `max_count`
    /// (LB1 invariant upper bound).
    async fn add_endpoint(&self, addr: &str, listener: VirtualListener) -> TunnelResult<()> {
        let mut endpoints = self.endpoints.write().await;
        if endpoints.len() as u32 >= self.max_count {
            return Err(TunnelError::RegistrationOverflow(format!(
                "{}/{} at max_count {}",
                self.ap, self.service, self.max_count
            )));
        }
        endpoints.insert(
            addr.to_string(),
            EndpointState {
                listener,
                active: Arc::new(AtomicUsize::new(0)),
            },
        );
        Ok(())
    }

    /// Remove an endpoint. Returns `true` if this was the last one (caller
    /// should destroy the node).
    async fn remove_endpoint(&self, addr: &str) -> bool {
        let mut endpoints = self.endpoints.write().await;
        endpoints.remove(addr);
        endpoints.is_empty()
    }

    /// Dispatch to the endpoint with the smallest `active` count (LB2),
    /// incrementing it for the duration of the dialled connection (LB3).
    pub async fn next_dial(&self) -> TunnelResult<(tokio::io::DuplexStream, ActiveRelease)> {
        let endpoints = self.endpoints.read().await;
        let chosen = endpoints
            .values()
            .min_by_key(|e| e.active.load(Ordering::SeqCst))
            .ok_or_else(|| {
                TunnelError::ResolveNoSuchService(format!("{}/{}: no endpoints", self.ap, self.service))
            })?;
        let active = chosen.active.clone();
        let conn = chosen.listener.dial().await?;
        active.fetch_add(1, Ordering::SeqCst);
        Ok((conn, ActiveRelease { active }))
    }

    pub fn shut_down_fronts(&self) {
        self.cancel.cancel();
        self.default_front.close();
    }
}

/// RAII decrement paired with `LbNode::next_dial` (LB3).
pub struct ActiveRelease {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveRelease {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Arena of LB nodes keyed by `(ap, service)`. Lazily creates a node on the
/// first endpoint, destroys it on the last (LB1).
#[derive(Default)]
pub struct NodeArena {
    nodes: RwLock<HashMap<(String, String), Arc<LbNode>>>,
}

impl NodeArena {
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, ap: &str, service: &str) -> Option<Arc<LbNode>> {
        self.nodes
            .read()
            .await
            .get(&(ap.to_string(), service.to_string()))
            .cloned()
    }

    /// Add an endpoint, creating the node (and binding its public fronts, if
    /// any are declared) on first use.
    #[allow(clippy::too_many_arguments)]
    pub async fn add_endpoint(
        &self,
        ap: &str,
        service: &str,
        max_count: u32,
        sockets_dir: Option<PathBuf>,
        public_addr: Option<String>,
        unix_socket: bool,
        endpoint_addr: &str,
        listener: VirtualListener,
    ) -> TunnelResult<Arc<LbNode>> {
        let key = (ap.to_string(), service.to_string());
        let mut nodes = self.nodes.write().await;
        let node = nodes
            .entry(key)
            .or_insert_with(|| LbNode::new(ap, service, max_count, sockets_dir, public_addr, unix_socket))
            .clone();
        node.add_endpoint(endpoint_addr, listener).await?;
        node.start_fronts();
        Ok(node)
    }

    /// Remove an endpoint; destroys the node (and its front listeners) when
    /// it was the last one.
    pub async fn remove_endpoint(&self, ap: &str, service: &str, endpoint_addr: &str) {
        let key = (ap.to_string(), service.to_string());
        let mut nodes = self.nodes.write().await;
        let Some(node) = nodes.get(&key).cloned() else {
            return;
        };
        if node.remove_endpoint(endpoint_addr).await {
            node.shut_down_fronts();
            nodes.remove(&key);
        }
    }

    pub async fn node_count(&self) -> usize {
        self.nodes.read().await.len()
    }
}

/// Splice bytes between an accepted front connection and a dialled endpoint
/// connection until either side signals EOF (§4.4 accept-loop behaviour,
/// §7's silent `IO.EOF` handling).
pub async fn splice<A, B>(mut front: A, mut endpoint: B)
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let _ = tokio::io::copy_bidirectional(&mut front, &mut endpoint).await;
}

/// Accept loop for a node's public TCP front listener.
pub async fn run_tcp_front(node: Arc<LbNode>, bind_addr: String) -> TunnelResult<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => return Ok(()),
            accepted = listener.accept() => {
                let (front, _peer) = accepted?;
                let node = node.clone();
                tokio::spawn(async move {
                    match node.next_dial().await {
                        Ok((endpoint, _release)) => splice(front, endpoint).await,
                        Err(e) => tracing::debug!(error = %e, "lb dispatch failed"),
                    }
                });
            }
        }
    }
}

/// Accept loop for a node's UNIX-socket front listener.
pub async fn run_unix_front(node: Arc<LbNode>, path: PathBuf) -> TunnelResult<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let _ = tokio::fs::remove_file(&path).await;
    let listener = UnixListener::bind(&path)?;
    loop {
        tokio::select! {
            _ = node.cancel.cancelled() => {
                let _ = tokio::fs::remove_file(&path).await;
                return Ok(());
            }
            accepted = listener.accept() => {
                let (front, _peer) = accepted?;
                let node = node.clone();
                tokio::spawn(async move {
                    match node.next_dial().await {
                        Ok((endpoint, _release)) => splice(front, endpoint).await,
                        Err(e) => tracing::debug!(error = %e, "lb dispatch failed"),
                    }
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_created_on_first_endpoint_and_destroyed_on_last() {
        let arena = NodeArena::new();
        arena
            .add_endpoint("a1", "web", 2, None, None, false, "ep1", VirtualListener::new("web"))
            .await
            .unwrap();
        assert_eq!(arena.node_count().await, 1);

        arena.remove_endpoint("a1", "web", "ep1").await;
        assert_eq!(arena.node_count().await, 0);
    }

    #[tokio::test]
    async fn add_endpoint_fails_past_max_count() {
        let arena = NodeArena::new();
        arena
            .add_endpoint("a1", "web", 1, None, None, false, "ep1", VirtualListener::new("w1"))
            .await
            .unwrap();
        let err = arena
            .add_endpoint("a1", "web", 1, None, None, false, "ep2", VirtualListener::new("w2"))
            .await
            .unwrap_err();
        assert!(matches!(err, TunnelError::RegistrationOverflow(_)));
    }

    #[tokio::test]
    async fn next_dial_picks_least_active_endpoint() {
        let arena = NodeArena::new();
        let l1 = VirtualListener::new("w1");
        let l2 = VirtualListener::new("w2");
        arena
            .add_endpoint("a1", "web", 5, None, None, false, "ep1", l1.clone())
            .await
            .unwrap();
        arena
            .add_endpoint("a1", "web", 5, None, None, false, "ep2", l2.clone())
            .await
            .unwrap();
        let node = arena.get("a1", "web").await.unwrap();

        // Accept on ep1 so next_dial against it can complete.
        let l1c = l1.clone();
        let accepted = tokio::spawn(async move { l1c.accept().await });
        let (_conn, release) = node.next_dial().await.unwrap();
        accepted.await.unwrap().unwrap();
        drop(release);
    }
}
