//! Tunnel server (C5, §4.5): the authenticated control-plane endpoint APs
//! dial into and clients connect through.
//!
//! Owns the session-facing pieces — handshake, reverse-forward/forward-dial
//! authorisation, exec channels, global requests — and wires them to the
//! fabric (virtual-listener registry + LB node arena) and the on-disk
//! principal/LB store. Structurally this follows the donor `WshServer`'s
//! `run()` accept-loop-plus-background-task shape, replacing its
//! WebTransport/WebSocket/PTY surface with the tunnel protocol.

pub mod auth;
pub mod exec;
pub mod mux;
pub mod proxy;
pub mod token;

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use tunnel_core::error::TunnelResult;
use tunnel_core::messages::{
    Auth, ControlMessage, ExecOpen, ForwardDialFail, ForwardDialOk, ForwardDialRequest,
    GlobalRequest, GlobalRequestFail, GlobalRequestOk, Hello, ReverseForwardCancel,
    ReverseForwardChannelOpen, ReverseForwardFail, ReverseForwardOk, ReverseForwardRequest,
};
use tunnel_core::version::Version;
use tunnel_store::{LoadBalancerStore, PrincipalStore};

use crate::config::HubConfig;
use crate::fabric::lb::NodeArena;
use crate::fabric::listener::VirtualListener;
use crate::fabric::registry::{Resolution, ServiceRegistry};

use self::mux::Mux;
use self::token::TokenManager;

pub use self::auth::SessionContext;

/// The tunnel server's shared state, cloned as `Arc<TunnelServer>` per task.
pub struct TunnelServer {
    config: HubConfig,
    secret: Vec<u8>,
    principals: PrincipalStore,
    load_balancers: LoadBalancerStore,
    registry: ServiceRegistry,
    lb_arena: NodeArena,
    token_manager: TokenManager,
    version: Version,
    shutdown: CancellationToken,
}

impl TunnelServer {
    pub fn new(
        config: HubConfig,
        principals: PrincipalStore,
        load_balancers: LoadBalancerStore,
        version: Version,
    ) -> Self {
        let token_path = config.db_path.with_file_name("xssh.token");
        let token_manager = TokenManager::new(token_path, config.token_renew_cron.clone());
        Self {
            secret: tunnel_core::generate_secret(),
            token_manager,
            config,
            principals,
            load_balancers,
            registry: ServiceRegistry::new(),
            lb_arena: NodeArena::new(),
            version,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.registry
    }

    pub fn lb_arena(&self) -> &NodeArena {
        &self.lb_arena
    }

    pub fn token_manager(&self) -> &TokenManager {
        &self.token_manager
    }

    pub fn load_balancers(&self) -> &LoadBalancerStore {
        &self.load_balancers
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept tunnel connections until the shutdown token fires.
    pub async fn run(self: Arc<Self>) -> TunnelResult<()> {
        self.token_manager.ensure_initial().await?;
        let token_task = {
            let server = self.clone();
            let cancel = self.shutdown.clone();
            tokio::spawn(async move { server.token_manager.run_schedule(cancel).await })
        };

        let listener = TcpListener::bind(&self.config.tunnel_addr).await?;
        info!(addr = %self.config.tunnel_addr, "tunnel server listening");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream).await {
                            debug!(%peer, error = %e, "tunnel connection ended");
                        }
                    });
                }
            }
        }

        token_task.abort();
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) -> TunnelResult<()> {
        let peer_addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());

        let hello: Hello = mux::read_frame(&mut stream).await?;
        let hello_result = auth::handle_hello(&hello)?;
        mux::write_frame(&mut stream, &hello_result.server_hello).await?;

        let auth_msg: Auth = mux::read_frame(&mut stream).await?;
        let auth_result = match auth::verify_auth(
            &auth_msg,
            &hello_result.nonce,
            &hello_result.session_id,
            &self.principals,
            &self.secret,
            self.config.session_ttl,
        )
        .await
        {
            Ok(r) => r,
            Err(e) => {
                let _ = mux::write_frame(&mut stream, &auth::build_auth_fail(&e.to_string())).await;
                return Err(e);
            }
        };
        mux::write_frame(&mut stream, &auth::build_auth_ok(auth_result.context.is_ap)).await?;

        let context = auth_result.context;
        info!(principal = %context.principal, is_ap = context.is_ap, %peer_addr, "session authenticated");

        if context.is_proxy() {
            let ap_name = context.ap_name.clone().unwrap_or_default();
            let proxy_user = context.proxy_user.clone().unwrap_or_default();
            return proxy::run_proxy_session(&self.registry, &ap_name, &proxy_user, stream).await;
        }

        let (read_half, write_half) = stream.into_split();
        let (mux, mut top_rx) = Mux::spawn(read_half, write_half);

        while let Some(msg) = top_rx.recv().await {
            match msg {
                ControlMessage::ReverseForwardRequest(req) if context.is_ap => {
                    self.handle_reverse_forward(&mux, &context.principal, &peer_addr, req)
                        .await;
                }
                ControlMessage::ReverseForwardCancel(cancel) if context.is_ap => {
                    self.handle_reverse_forward_cancel(&context.principal, &peer_addr, cancel)
                        .await;
                }
                ControlMessage::ForwardDialRequest(req) if !context.is_ap => {
                    let Some(ap_name) = context.ap_name.clone() else {
                        continue;
                    };
                    self.handle_forward_dial(&mux, &ap_name, req).await;
                }
                ControlMessage::GlobalRequest(req) => {
                    self.handle_global_request(&mux, &context, req).await;
                }
                ControlMessage::ExecOpen(open) => {
                    self.handle_exec_open(&mux, &context, &peer_addr, open).await;
                }
                ControlMessage::Ping => {
                    let _ = mux.send(ControlMessage::Pong);
                }
                other => {
                    debug!(?other, is_ap = context.is_ap, "message not permitted for this session kind");
                }
            }
        }

        if context.is_ap {
            let endpoints = self.registry.unregister_session(&context.principal, &peer_addr).await;
            for endpoint in endpoints {
                if endpoint.is_lb {
                    self.lb_arena
                        .remove_endpoint(&context.principal, &endpoint.name, &peer_addr)
                        .await;
                }
                endpoint.listener.close();
            }
        }

        Ok(())
    }

    async fn handle_reverse_forward(
        &self,
        mux: &Mux,
        ap_name: &str,
        remote_addr: &str,
        req: ReverseForwardRequest,
    ) {
        let listener = VirtualListener::new(req.addr.clone());
        let parsed = match self.registry.register(ap_name, remote_addr, &req.addr, listener.clone()).await {
            Ok(p) => p,
            Err(e) => {
                let _ = mux.send(ControlMessage::ReverseForwardFail(ReverseForwardFail {
                    request_id: req.request_id,
                    reason: e.to_string(),
                }));
                return;
            }
        };

        if parsed.is_lb {
            let decl = match self.load_balancers.get(ap_name, &parsed.name).await {
                Ok(Some(decl)) => decl,
                Ok(None) => {
                    let _ = self.registry.unregister(ap_name, remote_addr, &req.addr).await;
                    let _ = mux.send(ControlMessage::ReverseForwardFail(ReverseForwardFail {
                        request_id: req.request_id,
                        reason: "no load-balancer declared for this service".into(),
                    }));
                    return;
                }
                Err(e) => {
                    let _ = mux.send(ControlMessage::ReverseForwardFail(ReverseForwardFail {
                        request_id: req.request_id,
                        reason: e.to_string(),
                    }));
                    return;
                }
            };
            if let Err(e) = self
                .lb_arena
                .add_endpoint(
                    ap_name,
                    &parsed.name,
                    decl.max_count,
                    Some(self.config.sockets_dir.clone()),
                    decl.public_addr.clone(),
                    decl.unix_socket,
                    remote_addr,
                    listener.clone(),
                )
                .await
            {
                let _ = self.registry.unregister(ap_name, remote_addr, &req.addr).await;
                let _ = mux.send(ControlMessage::ReverseForwardFail(ReverseForwardFail {
                    request_id: req.request_id,
                    reason: e.to_string(),
                }));
                return;
            }
        }

        let _ = mux.send(ControlMessage::ReverseForwardOk(ReverseForwardOk {
            request_id: req.request_id,
            bound_addr: listener.addr(),
        }));

        spawn_accept_pump(mux.clone(), listener, req.addr);
    }

    async fn handle_reverse_forward_cancel(&self, ap_name: &str, remote_addr: &str, cancel: ReverseForwardCancel) {
        let Some(endpoint) = self.registry.unregister(ap_name, remote_addr, &cancel.addr).await else {
            return;
        };
        if endpoint.is_lb {
            self.lb_arena.remove_endpoint(ap_name, &endpoint.name, remote_addr).await;
        }
        endpoint.listener.close();
    }

    async fn handle_forward_dial(&self, mux: &Mux, ap_name: &str, req: ForwardDialRequest) {
        let service = req.addr.clone();
        let has_lb = self.lb_arena.get(ap_name, &service).await.is_some();
        let resolution = self.registry.get_listener(ap_name, &service, None, || has_lb).await;

        match resolution {
            Ok(Resolution::Direct { listener, _release }) => match listener.dial().await {
                Ok(stream) => {
                    let channel_id = mux.alloc_channel_id();
                    let _ = mux.send(ControlMessage::ForwardDialOk(ForwardDialOk {
                        request_id: req.request_id,
                        channel_id,
                    }));
                    let mux = mux.clone();
                    tokio::spawn(async move {
                        let _release = _release;
                        mux.pump(channel_id, stream).await;
                    });
                }
                Err(e) => {
                    let _ = mux.send(ControlMessage::ForwardDialFail(ForwardDialFail {
                        request_id: req.request_id,
                        reason: e.to_string(),
                    }));
                }
            },
            Ok(Resolution::LoadBalanced) => {
                let Some(node) = self.lb_arena.get(ap_name, &service).await else {
                    let _ = mux.send(ControlMessage::ForwardDialFail(ForwardDialFail {
                        request_id: req.request_id,
                        reason: "no endpoints registered".into(),
                    }));
                    return;
                };
                match node.next_dial().await {
                    Ok((stream, release)) => {
                        let channel_id = mux.alloc_channel_id();
                        let _ = mux.send(ControlMessage::ForwardDialOk(ForwardDialOk {
                            request_id: req.request_id,
                            channel_id,
                        }));
                        let mux = mux.clone();
                        tokio::spawn(async move {
                            let _release = release;
                            mux.pump(channel_id, stream).await;
                        });
                    }
                    Err(e) => {
                        let _ = mux.send(ControlMessage::ForwardDialFail(ForwardDialFail {
                            request_id: req.request_id,
                            reason: e.to_string(),
                        }));
                    }
                }
            }
            Err(e) => {
                let _ = mux.send(ControlMessage::ForwardDialFail(ForwardDialFail {
                    request_id: req.request_id,
                    reason: e.to_string(),
                }));
            }
        }
    }

    async fn handle_global_request(&self, mux: &Mux, context: &SessionContext, req: GlobalRequest) {
        match req.kind.as_str() {
            "ap-version" | "cl-version" => {
                let reported = Version::from_wire_str(&String::from_utf8_lossy(&req.payload));
                info!(
                    kind = %req.kind,
                    principal = %context.principal,
                    version = %reported.to_wire_string(),
                    "version reported"
                );
                let _ = mux.send(ControlMessage::GlobalRequestOk(GlobalRequestOk {
                    request_id: req.request_id,
                }));
            }
            other => {
                warn!(kind = %other, "unknown global request kind");
                let _ = mux.send(ControlMessage::GlobalRequestFail(GlobalRequestFail {
                    request_id: req.request_id,
                    reason: format!("unknown request kind: {other}"),
                }));
            }
        }
    }

    async fn handle_exec_open(&self, mux: &Mux, context: &SessionContext, peer_addr: &str, open: ExecOpen) {
        let ap_name = context.ap_name.as_deref().unwrap_or(&context.principal);
        let outcome = exec::dispatch(&open.args, ap_name, peer_addr, &self.version).await;
        for frame in outcome.into_exec_data(open.channel_id) {
            let _ = mux.send(ControlMessage::ExecData(frame));
        }
        let _ = mux.send(ControlMessage::ExecClose(tunnel_core::messages::ExecClose {
            channel_id: open.channel_id,
        }));
    }
}

fn spawn_accept_pump(mux: Mux, listener: VirtualListener, addr: String) {
    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok(stream) => {
                    let channel_id = mux.alloc_channel_id();
                    if mux
                        .send(ControlMessage::ReverseForwardChannelOpen(ReverseForwardChannelOpen {
                            addr: addr.clone(),
                            channel_id,
                        }))
                        .is_err()
                    {
                        return;
                    }
                    let mux = mux.clone();
                    tokio::spawn(async move { mux.pump(channel_id, stream).await });
                }
                Err(_) => return,
            }
        }
    });
}
