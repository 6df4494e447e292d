pub mod catalog;
pub mod config;
pub mod diff;
pub mod dispatcher;
pub mod error;
pub mod game;
pub mod group_query;
pub mod logging;
pub mod mailbox;
pub mod messaging;
pub mod orchestrator;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;
pub mod wait;

#[cfg(test)]
mod sim;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use crate::catalog::GroupCatalog;
pub use crate::config::{FormationOptions, NodeConfig};
pub use crate::error::CoordError;
pub use crate::logging::init_logging;
pub use crate::orchestrator::{FormationOutcome, FormationResult, GroupFormer};

use crate::dispatcher::CommandDispatcher;
use crate::game::GameClient;
use crate::group_query::GroupQuery;
use crate::mailbox::{Inbound, Mailbox};
use crate::messaging::report_from_status;
use crate::protocol::Message;
use crate::registry::PeerRegistry;
use crate::transport::TcpTransport;
use crate::types::{PeerId, PeerStatus, Target};

/// One coordinating process: a character's game client, its mailbox, and
/// the handler and poller tasks bound to them. The master additionally
/// keeps the peer status registry and drives group formation.
pub struct Node {
    mailbox: Arc<dyn Mailbox>,
    tcp: Option<Arc<TcpTransport>>,
    registry: Arc<PeerRegistry>,
    query: Arc<GroupQuery>,
    dispatcher: Arc<CommandDispatcher>,
    game: Arc<dyn GameClient>,
    shutdown_token: CancellationToken,
    local_peer_id: PeerId,
    config: NodeConfig,
}

impl Node {
    /// Start a node over an already registered mailbox (e.g. a
    /// `LocalBus` endpoint). Must be called inside a tokio runtime.
    pub fn with_mailbox(
        mailbox: Arc<dyn Mailbox>,
        inbound_rx: mpsc::Receiver<Inbound>,
        game: Arc<dyn GameClient>,
        config: NodeConfig,
    ) -> Result<Self, CoordError> {
        config.validate()?;
        Ok(Self::start(
            mailbox,
            None,
            inbound_rx,
            game,
            config,
            CancellationToken::new(),
        ))
    }

    /// Start a node that listens for peers on `bind_addr`.
    pub async fn with_tcp(
        name: &str,
        bind_addr: SocketAddr,
        config: NodeConfig,
        game: Arc<dyn GameClient>,
    ) -> Result<Self, CoordError> {
        config.validate()?;
        if name.trim().is_empty() {
            return Err(CoordError::TransportUnavailable(
                "peer name must not be empty".into(),
            ));
        }
        let shutdown_token = CancellationToken::new();
        let (transport, inbound_rx) = TcpTransport::new(
            PeerId::new(name.trim()),
            bind_addr,
            config,
            shutdown_token.clone(),
        )
        .await?;
        let mailbox: Arc<dyn Mailbox> = transport.clone();
        Ok(Self::start(
            mailbox,
            Some(transport),
            inbound_rx,
            game,
            config,
            shutdown_token,
        ))
    }

    fn start(
        mailbox: Arc<dyn Mailbox>,
        tcp: Option<Arc<TcpTransport>>,
        inbound_rx: mpsc::Receiver<Inbound>,
        game: Arc<dyn GameClient>,
        config: NodeConfig,
        shutdown_token: CancellationToken,
    ) -> Self {
        let local_peer_id = mailbox.local_peer_id().clone();
        let registry = Arc::new(PeerRegistry::new(local_peer_id.clone()));
        let query = Arc::new(GroupQuery::new(
            Arc::clone(&mailbox),
            Arc::clone(&game),
            config.query_poll_interval(),
            shutdown_token.clone(),
        ));
        let dispatcher = Arc::new(CommandDispatcher::new(
            Arc::clone(&mailbox),
            Arc::clone(&game),
        ));

        if config.is_master {
            refresh_local_status(&registry, &local_peer_id, game.as_ref());
        }

        spawn_message_handler(
            inbound_rx,
            HandlerCtx {
                mailbox: Arc::clone(&mailbox),
                registry: Arc::clone(&registry),
                query: Arc::clone(&query),
                game: Arc::clone(&game),
                local_peer_id: local_peer_id.clone(),
                is_master: config.is_master,
                shutdown_token: shutdown_token.clone(),
            },
            shutdown_token.clone(),
        );

        if config.is_master {
            spawn_status_poller(
                Arc::clone(&mailbox),
                Arc::clone(&registry),
                Arc::clone(&game),
                config,
                shutdown_token.clone(),
            );
        }

        tracing::info!(
            peer = %local_peer_id,
            master = config.is_master,
            "node started"
        );

        Self {
            mailbox,
            tcp,
            registry,
            query,
            dispatcher,
            game,
            shutdown_token,
            local_peer_id,
            config,
        }
    }

    pub fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    pub fn is_master(&self) -> bool {
        self.config.is_master
    }

    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    pub fn mailbox(&self) -> &Arc<dyn Mailbox> {
        &self.mailbox
    }

    /// The TCP listener address, if this node runs over TCP.
    pub fn listener_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(|t| t.listener_addr())
    }

    /// Dial another TCP node. Fails with `TransportUnavailable` on a node
    /// that is not running over TCP.
    pub async fn connect_to(&self, addr: SocketAddr) -> Result<PeerId, CoordError> {
        let tcp = self.tcp.as_ref().ok_or_else(|| {
            CoordError::TransportUnavailable("node is not running over TCP".into())
        })?;
        tcp.connect_to(addr).await
    }

    /// A formation driver bound to this node. Options that leave the query
    /// timeout unset use the node's `query_timeout_ms`.
    pub fn former(&self, options: FormationOptions) -> GroupFormer {
        GroupFormer::new(
            Arc::clone(&self.query),
            Arc::clone(&self.dispatcher),
            options.or_query_timeout(self.config.query_timeout_ms),
            self.shutdown_token.clone(),
        )
    }

    pub async fn form_named_group(
        &self,
        catalog: &GroupCatalog,
        name: &str,
        options: FormationOptions,
    ) -> Result<FormationResult, CoordError> {
        options.validate()?;
        let group = catalog.group(name)?;
        Ok(self.former(options).form_group(group).await)
    }

    pub async fn form_named_group_set(
        &self,
        catalog: &GroupCatalog,
        name: &str,
        options: FormationOptions,
    ) -> Result<Vec<FormationResult>, CoordError> {
        options.validate()?;
        let groups = catalog.resolve_set(name)?;
        Ok(self.former(options).form_group_set(&groups).await)
    }

    /// Poll every peer for its status now instead of waiting for the
    /// next poller tick.
    pub fn request_status_refresh(&self) -> Result<(), CoordError> {
        if self.config.is_master {
            refresh_local_status(&self.registry, &self.local_peer_id, self.game.as_ref());
        }
        self.mailbox.send(
            &Target::Broadcast,
            Message::RequestData {
                from: self.local_peer_id.as_str().to_owned(),
            },
        )
    }

    /// Tell every other process to stop. This node keeps running.
    pub fn broadcast_shutdown(&self) -> Result<(), CoordError> {
        tracing::info!(peer = %self.local_peer_id, "broadcasting shutdown");
        self.mailbox.send(&Target::Broadcast, Message::Shutdown)
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown_token.is_cancelled()
    }

    /// Resolves once a peer has told this node to stop, or `shutdown` ran.
    pub async fn run_until_stopped(&self) {
        self.shutdown_token.cancelled().await;
    }

    pub async fn shutdown(self) {
        self.mailbox.shutdown();
        self.shutdown_token.cancel();
        tracing::info!(peer = %self.local_peer_id, "node shutdown complete");
    }
}

fn refresh_local_status(registry: &PeerRegistry, local_peer_id: &PeerId, game: &dyn GameClient) {
    match game.character_status() {
        Some(status) if status.class.is_some() => {
            registry.insert_local(PeerStatus::from_report(local_peer_id.clone(), status));
        }
        _ => {
            registry.ensure_stub(local_peer_id);
        }
    }
}

struct HandlerCtx {
    mailbox: Arc<dyn Mailbox>,
    registry: Arc<PeerRegistry>,
    query: Arc<GroupQuery>,
    game: Arc<dyn GameClient>,
    local_peer_id: PeerId,
    is_master: bool,
    shutdown_token: CancellationToken,
}

fn spawn_message_handler(
    mut inbound_rx: mpsc::Receiver<Inbound>,
    ctx: HandlerCtx,
    shutdown_token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                event = inbound_rx.recv() => {
                    let Some(event) = event else { break };
                    handle_inbound(event, &ctx);
                }
            }
        }
        tracing::debug!(peer = %ctx.local_peer_id, "message handler stopped");
    });
}

fn handle_inbound(event: Inbound, ctx: &HandlerCtx) {
    let HandlerCtx {
        registry,
        game,
        is_master,
        ..
    } = ctx;

    match event {
        Inbound::Mail { from, message } => {
            tracing::debug!(peer = %from, kind = message.kind(), "mail received");
            handle_mail(from, message, ctx);
        }
        Inbound::Command { from, command } => {
            tracing::info!(peer = %from, command = %command, "executing relayed command");
            game.execute(&command);
        }
        Inbound::PeerJoined(pid) => {
            tracing::info!(peer = %pid, "peer joined");
            if *is_master {
                registry.ensure_stub(&pid);
            }
        }
        Inbound::PeerLeft(pid) => {
            tracing::info!(peer = %pid, "peer left");
        }
    }
}

fn handle_mail(from: PeerId, message: Message, ctx: &HandlerCtx) {
    let HandlerCtx {
        mailbox,
        registry,
        query,
        game,
        local_peer_id,
        is_master,
        shutdown_token,
    } = ctx;

    match message {
        Message::RequestData { .. } => {
            if from == *local_peer_id || *is_master {
                return;
            }
            let status = game.character_status();
            let report = report_from_status(local_peer_id, status.as_ref());
            if let Err(e) = mailbox.send(&Target::ToPeer(from.clone()), Message::PeerData(report)) {
                tracing::warn!(peer = %from, error = %e, "failed to send status reply");
            }
        }
        Message::PeerData(report) => {
            if *is_master {
                registry.apply_report(&from, &report);
            } else {
                tracing::debug!(peer = %from, "ignoring status report on non-master");
            }
        }
        Message::QueryGroup { target, query_id } => {
            query.answer_query(&from, &target, query_id);
        }
        Message::GroupData {
            character,
            members,
            query_id,
        } => {
            query.handle_group_data(&character, members, query_id);
        }
        Message::Shutdown => {
            if from == *local_peer_id {
                return;
            }
            tracing::info!(peer = %from, "shutdown requested by peer");
            shutdown_token.cancel();
        }
    }
}

fn spawn_status_poller(
    mailbox: Arc<dyn Mailbox>,
    registry: Arc<PeerRegistry>,
    game: Arc<dyn GameClient>,
    config: NodeConfig,
    shutdown_token: CancellationToken,
) {
    let poll_interval = Duration::from_millis(config.status_poll_interval_ms);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        loop {
            tokio::select! {
                _ = shutdown_token.cancelled() => break,
                _ = interval.tick() => {
                    let local = mailbox.local_peer_id().clone();
                    refresh_local_status(&registry, &local, game.as_ref());
                    let request = Message::RequestData {
                        from: local.as_str().to_owned(),
                    };
                    if let Err(e) = mailbox.send(&Target::Broadcast, request) {
                        tracing::warn!(error = %e, "status poll broadcast failed");
                    }
                }
            }
        }
    });
}
