//! Host/path registry for the HTTP front's longest-prefix-match proxy.
//!
//! Grounded on `examples/original_source/server/http.go`'s `HostPaths`
//! (per-host map of path → declaration, kept with a cached reverse-
//! lexicographic path list so the longest matching prefix sorts first) and
//! `HttpHosts` (per-host registry of `HostPaths`). The Go source stops at
//! the sorted-list scaffolding; the actual prefix-match walk below is new,
//! built the way the cached sort obviously wants to be used.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use tunnel_store::LoadBalancerDecl;

fn clean_path(path: &str) -> String {
    let mut p = if path.is_empty() { "/".to_string() } else { path.to_string() };
    if !p.starts_with('/') {
        p.insert(0, '/');
    }
    if !p.ends_with('/') {
        p.push('/');
    }
    p
}

/// Paths mounted under one `Host` header value.
#[derive(Default)]
pub struct HostPaths {
    paths: RwLock<HashMap<String, LoadBalancerDecl>>,
    sorted: RwLock<Vec<String>>,
}

impl HostPaths {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set(&self, decl: LoadBalancerDecl) {
        let path = clean_path(decl.http_path.as_deref().unwrap_or("/"));
        let mut paths = self.paths.write().await;
        let is_new = !paths.contains_key(&path);
        paths.insert(path, decl);
        if is_new {
            drop(paths);
            self.resort().await;
        }
    }

    pub async fn remove(&self, path: &str) {
        let cleaned = clean_path(path);
        let mut paths = self.paths.write().await;
        paths.remove(&cleaned);
        drop(paths);
        self.resort().await;
    }

    pub async fn is_empty(&self) -> bool {
        self.paths.read().await.is_empty()
    }

    async fn resort(&self) {
        let paths = self.paths.read().await;
        let mut sorted: Vec<String> = paths.keys().cloned().collect();
        sorted.sort_by(|a, b| b.cmp(a));
        *self.sorted.write().await = sorted;
    }

    /// Longest registered path prefix that matches `request_path`.
    pub async fn match_longest_prefix(&self, request_path: &str) -> Option<LoadBalancerDecl> {
        let sorted = self.sorted.read().await;
        let paths = self.paths.read().await;
        for candidate in sorted.iter() {
            if request_path.starts_with(candidate.as_str()) {
                return paths.get(candidate).cloned();
            }
        }
        None
    }
}

/// Registry of [`HostPaths`] keyed by `Host` header value (port stripped).
#[derive(Default)]
pub struct HttpHosts {
    hosts: RwLock<HashMap<String, Arc<HostPaths>>>,
}

impl HttpHosts {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, host: &str) -> Option<Arc<HostPaths>> {
        self.hosts.read().await.get(host).cloned()
    }

    pub async fn get_or_register(&self, host: &str) -> Arc<HostPaths> {
        let mut hosts = self.hosts.write().await;
        hosts.entry(host.to_string()).or_insert_with(|| Arc::new(HostPaths::new())).clone()
    }

    pub async fn remove_host_if_empty(&self, host: &str) {
        let hosts_read = self.hosts.read().await;
        let Some(hp) = hosts_read.get(host).cloned() else {
            return;
        };
        drop(hosts_read);
        if hp.is_empty().await {
            self.hosts.write().await.remove(host);
        }
    }

    /// Rebuild the registry from every LB declaration that has an HTTP
    /// host configured. Called once at startup and safe to re-run.
    pub async fn reload_from_store(&self, store: &tunnel_store::LoadBalancerStore) -> anyhow::Result<()> {
        let decls = store.list(None).await?;
        for decl in decls {
            let Some(host) = decl.http_host.clone() else {
                continue;
            };
            self.get_or_register(&host).await.set(decl).await;
        }
        Ok(())
    }
}

/// Split a `Host` header on `:`, discarding any port.
pub fn host_without_port(host_header: &str) -> &str {
    host_header.split(':').next().unwrap_or(host_header)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decl(path: &str) -> LoadBalancerDecl {
        LoadBalancerDecl {
            ap: "a1".into(),
            service: "web".into(),
            max_count: 1,
            public_addr: None,
            unix_socket: false,
            http_host: Some("demo.example".into()),
            http_path: Some(path.into()),
            http_auth_enabled: false,
            http_users: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn longest_prefix_wins() {
        let hp = HostPaths::new();
        hp.set(decl("/")).await;
        hp.set(decl("/api/v1")).await;

        let matched = hp.match_longest_prefix("/api/v1/users").await.unwrap();
        assert_eq!(matched.http_path.as_deref(), Some("/api/v1"));
    }

    #[tokio::test]
    async fn falls_back_to_root() {
        let hp = HostPaths::new();
        hp.set(decl("/")).await;
        let matched = hp.match_longest_prefix("/anything").await.unwrap();
        assert_eq!(matched.http_path.as_deref(), Some("/"));
    }

    #[test]
    fn strips_port_from_host() {
        assert_eq!(host_without_port("example.com:8080"), "example.com");
        assert_eq!(host_without_port("example.com"), "example.com");
    }
}
