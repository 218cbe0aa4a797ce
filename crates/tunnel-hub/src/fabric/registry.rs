//! Service registry (C3, §4.3): per-AP-session table of active virtual
//! listeners, indexed by name and by address, with session-scoped teardown.
//!
//! Two-level map `ap_name -> remote_client_addr -> Bucket`, exactly as
//! specified. Grounded structurally on `relay/registry.rs`'s
//! `Arc<RwLock<HashMap<...>>>` shape, replacing its PTY-peer content with
//! AP-session endpoint bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use tunnel_core::error::{TunnelError, TunnelResult};

use super::listener::VirtualListener;

/// One registered virtual listener: the service name it was registered
/// under (star stripped) and whether the `*` prefix marked it for LB
/// participation.
#[derive(Clone)]
pub struct Endpoint {
    pub listener: VirtualListener,
    pub is_lb: bool,
    pub name: String,
}

/// Parsed form of a `unix:<name>` / `virtual:<name>` address, star stripped.
pub struct ParsedAddr {
    pub scheme: String,
    pub name: String,
    pub is_lb: bool,
}

pub fn parse_addr(raw: &str) -> TunnelResult<ParsedAddr> {
    let (scheme, rest) = raw
        .split_once(':')
        .ok_or_else(|| TunnelError::InvalidMessage(format!("malformed address: {raw}")))?;
    if scheme != "unix" && scheme != "virtual" {
        return Err(TunnelError::InvalidMessage(format!(
            "unsupported address scheme: {scheme}"
        )));
    }
    let (is_lb, name) = match rest.strip_prefix('*') {
        Some(stripped) => (true, stripped.to_string()),
        None => (false, rest.to_string()),
    };
    Ok(ParsedAddr {
        scheme: scheme.to_string(),
        name,
        is_lb,
    })
}

#[derive(Default)]
struct Bucket {
    by_name: HashMap<String, Endpoint>,
    by_addr: HashMap<String, Endpoint>,
    active_count: Arc<AtomicUsize>,
}

/// How `get_listener` resolved a lookup (§4.3 three-step resolution).
pub enum Resolution {
    /// Exact AP-session match, or the unique non-LB registrant.
    Direct {
        listener: VirtualListener,
        /// Guard decrementing the owning bucket's `active_count`; drop when
        /// the outbound stream closes.
        _release: ActiveGuard,
    },
    /// A registered entry for this service has an LB node attached —
    /// dispatch should go through the node instead (§4.3 step 2).
    LoadBalanced,
}

/// RAII decrement for `Bucket::active_count`, handed back by least-in-flight
/// resolution (§4.3 step 3, invariant LB3-equivalent for non-LB services).
pub struct ActiveGuard {
    counter: Arc<AtomicUsize>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

pub struct ServiceRegistry {
    // ap_name -> remote_addr -> bucket
    buckets: RwLock<HashMap<String, HashMap<String, Bucket>>>,
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
        }
    }

    /// Register a virtual listener for `(ap_name, remote_addr)` under the
    /// parsed service name in `raw_addr`.
    pub async fn register(
        &self,
        ap_name: &str,
        remote_addr: &str,
        raw_addr: &str,
        listener: VirtualListener,
    ) -> TunnelResult<ParsedAddr> {
        let parsed = parse_addr(raw_addr)?;
        let endpoint = Endpoint {
            listener,
            is_lb: parsed.is_lb,
            name: parsed.name.clone(),
        };
        let mut buckets = self.buckets.write().await;
        let bucket = buckets
            .entry(ap_name.to_string())
            .or_default()
            .entry(remote_addr.to_string())
            .or_default();
        bucket.by_name.insert(parsed.name.clone(), endpoint.clone());
        bucket.by_addr.insert(raw_addr.to_string(), endpoint);
        Ok(parsed)
    }

    /// Remove a single registration (does not close the listener — the
    /// caller owns that decision, since an LB-attached endpoint needs node
    /// teardown first).
    pub async fn unregister(
        &self,
        ap_name: &str,
        remote_addr: &str,
        raw_addr: &str,
    ) -> Option<Endpoint> {
        let mut buckets = self.buckets.write().await;
        let bucket = buckets.get_mut(ap_name)?.get_mut(remote_addr)?;
        let endpoint = bucket.by_addr.remove(raw_addr)?;
        if let Ok(parsed) = parse_addr(raw_addr) {
            bucket.by_name.remove(&parsed.name);
        }
        Some(endpoint)
    }

    /// Tear down an entire AP session bucket (REG1): returns every endpoint
    /// it owned so the caller can close listeners and cascade LB removal.
    pub async fn unregister_session(&self, ap_name: &str, remote_addr: &str) -> Vec<Endpoint> {
        let mut buckets = self.buckets.write().await;
        let Some(per_addr) = buckets.get_mut(ap_name) else {
            return Vec::new();
        };
        let Some(bucket) = per_addr.remove(remote_addr) else {
            return Vec::new();
        };
        if per_addr.is_empty() {
            buckets.remove(ap_name);
        }
        bucket.by_addr.into_values().collect()
    }

    /// Three-step resolution from §4.3. `has_lb_node` is supplied by the
    /// caller (backed by the LB node arena) since the registry itself does
    /// not know about LB declarations.
    pub async fn get_listener(
        &self,
        ap_name: &str,
        service_name: &str,
        remote_addr: Option<&str>,
        has_lb_node: impl Fn() -> bool,
    ) -> TunnelResult<Resolution> {
        let buckets = self.buckets.read().await;
        let Some(per_addr) = buckets.get(ap_name) else {
            return Err(TunnelError::ResolveNoSuchService(service_name.to_string()));
        };

        if let Some(addr) = remote_addr {
            let bucket = per_addr
                .get(addr)
                .ok_or_else(|| TunnelError::ResolveNoSuchService(service_name.to_string()))?;
            let endpoint = bucket
                .by_name
                .get(service_name)
                .ok_or_else(|| TunnelError::ResolveNoSuchService(service_name.to_string()))?;
            let guard = ActiveGuard {
                counter: bucket.active_count.clone(),
            };
            bucket.active_count.fetch_add(1, Ordering::SeqCst);
            return Ok(Resolution::Direct {
                listener: endpoint.listener.clone(),
                _release: guard,
            });
        }

        if has_lb_node() {
            return Ok(Resolution::LoadBalanced);
        }

        // Least in-flight among all AP sessions registering this service.
        let mut best: Option<(&Bucket, &Endpoint)> = None;
        for bucket in per_addr.values() {
            if let Some(endpoint) = bucket.by_name.get(service_name) {
                let count = bucket.active_count.load(Ordering::SeqCst);
                if best
                    .as_ref()
                    .map(|(b, _)| count < b.active_count.load(Ordering::SeqCst))
                    .unwrap_or(true)
                {
                    best = Some((bucket, endpoint));
                }
            }
        }

        let (bucket, endpoint) = best
            .ok_or_else(|| TunnelError::ResolveNoSuchService(service_name.to_string()))?;
        bucket.active_count.fetch_add(1, Ordering::SeqCst);
        Ok(Resolution::Direct {
            listener: endpoint.listener.clone(),
            _release: ActiveGuard {
                counter: bucket.active_count.clone(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_addr_strips_star_and_scheme() {
        let p = parse_addr("unix:*web").unwrap();
        assert_eq!(p.scheme, "unix");
        assert_eq!(p.name, "web");
        assert!(p.is_lb);

        let p = parse_addr("virtual:ssh").unwrap();
        assert!(!p.is_lb);
        assert_eq!(p.name, "ssh");
    }

    #[test]
    fn parse_addr_rejects_unknown_scheme() {
        assert!(parse_addr("tcp:web").is_err());
    }

    #[tokio::test]
    async fn register_then_get_listener_exact_addr() {
        let reg = ServiceRegistry::new();
        let l = VirtualListener::new("ssh");
        reg.register("a1", "10.0.0.1:1", "unix:ssh", l.clone())
            .await
            .unwrap();

        let res = reg
            .get_listener("a1", "ssh", Some("10.0.0.1:1"), || false)
            .await
            .unwrap();
        assert!(matches!(res, Resolution::Direct { .. }));
    }

    #[tokio::test]
    async fn get_listener_prefers_lb_node_when_present() {
        let reg = ServiceRegistry::new();
        let l = VirtualListener::new("web");
        reg.register("a1", "10.0.0.1:1", "unix:*web", l).await.unwrap();

        let res = reg
            .get_listener("a1", "web", None, || true)
            .await
            .unwrap();
        assert!(matches!(res, Resolution::LoadBalanced));
    }

    #[tokio::test]
    async fn get_listener_picks_least_in_flight_among_sessions() {
        let reg = ServiceRegistry::new();
        reg.register("a1", "r1", "unix:ssh", VirtualListener::new("ssh"))
            .await
            .unwrap();
        reg.register("a1", "r2", "unix:ssh", VirtualListener::new("ssh"))
            .await
            .unwrap();

        // Bump r1's active_count so r2 is picked next.
        let _first = reg
            .get_listener("a1", "ssh", Some("r1"), || false)
            .await
            .unwrap();

        let second = reg.get_listener("a1", "ssh", None, || false).await.unwrap();
        assert!(matches!(second, Resolution::Direct { .. }));
    }

    #[tokio::test]
    async fn unregister_session_returns_all_owned_endpoints() {
        let reg = ServiceRegistry::new();
        reg.register("a1", "r1", "unix:ssh", VirtualListener::new("ssh"))
            .await
            .unwrap();
        reg.register("a1", "r1", "unix:*web", VirtualListener::new("web"))
            .await
            .unwrap();

        let endpoints = reg.unregister_session("a1", "r1").await;
        assert_eq!(endpoints.len(), 2);

        let res = reg
            .get_listener("a1", "ssh", Some("r1"), || false)
            .await;
        assert!(res.is_err());
    }
}
