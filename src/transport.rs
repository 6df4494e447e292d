use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};
use tokio_util::sync::CancellationToken;

use crate::config::{MAX_CONNECTIONS, MAX_MESSAGE_SIZE, NodeConfig, PROTOCOL_VERSION};
use crate::error::CoordError;
use crate::mailbox::{Inbound, Mailbox};
use crate::messaging::{RawPacket, decode_frame, encode_frame};
use crate::protocol::{Frame, Message};
use crate::types::{PeerId, Target};

const HEADER_LEN: usize = 7;

pub struct PacketCodec {
    max_message_size: u32,
}

impl PacketCodec {
    pub fn new() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for PacketCodec {
    type Item = RawPacket;
    type Error = CoordError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]);
        if length > self.max_message_size {
            return Err(CoordError::MessageTooLarge(length));
        }

        let total = HEADER_LEN + length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        let header = src.split_to(HEADER_LEN);
        let payload = src.split_to(length as usize);

        Ok(Some(RawPacket {
            msg_type: u16::from_be_bytes([header[4], header[5]]),
            flags: header[6],
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<RawPacket> for PacketCodec {
    type Error = CoordError;

    fn encode(&mut self, item: RawPacket, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = item.payload.len() as u32;
        if length > self.max_message_size {
            return Err(CoordError::MessageTooLarge(length));
        }
        dst.reserve(HEADER_LEN + item.payload.len());
        dst.put_u32(length);
        dst.put_u16(item.msg_type);
        dst.put_u8(item.flags);
        dst.put_slice(&item.payload);
        Ok(())
    }
}

struct PeerConnection {
    send_tx: mpsc::Sender<RawPacket>,
    cancel_token: CancellationToken,
    // set for connections we dialed; only those are re-dialed
    dial_addr: Option<SocketAddr>,
    should_reconnect: bool,
}

/// `Mailbox` over TCP. Every process listens; peers dial the master (or
/// any other process) and exchange a name handshake before mail flows.
pub struct TcpTransport {
    local_peer_id: PeerId,
    config: NodeConfig,
    connections: Arc<RwLock<HashMap<PeerId, PeerConnection>>>,
    listener_addr: SocketAddr,
    incoming_tx: mpsc::Sender<Inbound>,
    shutdown_token: CancellationToken,
}

impl TcpTransport {
    pub async fn new(
        local_peer_id: PeerId,
        bind_addr: SocketAddr,
        config: NodeConfig,
        shutdown_token: CancellationToken,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Inbound>), CoordError> {
        let listener = TcpListener::bind(bind_addr).await.map_err(|e| {
            CoordError::TransportUnavailable(format!("failed to bind {bind_addr}: {e}"))
        })?;
        let listener_addr = listener.local_addr()?;
        tracing::info!(addr = %listener_addr, peer = %local_peer_id, "TCP listener started");

        let (incoming_tx, incoming_rx) = mpsc::channel(config.inbound_capacity);

        let transport = Arc::new(Self {
            local_peer_id,
            config,
            connections: Arc::new(RwLock::new(HashMap::new())),
            listener_addr,
            incoming_tx,
            shutdown_token,
        });

        let t = Arc::clone(&transport);
        tokio::spawn(async move {
            t.accept_loop(listener).await;
        });

        Ok((transport, incoming_rx))
    }

    pub fn listener_addr(&self) -> SocketAddr {
        self.listener_addr
    }

    pub fn connection_count(&self) -> usize {
        self.connections.read().len()
    }

    async fn accept_loop(self: &Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                _ = self.shutdown_token.cancelled() => break,
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            if self.connections.read().len() >= MAX_CONNECTIONS {
                                tracing::warn!(%addr, "max connections reached, rejecting");
                                continue;
                            }
                            let t = Arc::clone(self);
                            tokio::spawn(async move {
                                if let Err(e) = t.handle_incoming_connection(stream).await {
                                    tracing::warn!(%addr, error = %e, "incoming connection failed");
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "accept error");
                        }
                    }
                }
            }
        }
    }

    fn configure_keepalive(stream: &TcpStream) -> Result<(), CoordError> {
        use socket2::SockRef;

        let sock = SockRef::from(stream);
        let keepalive = socket2::TcpKeepalive::new()
            .with_time(Duration::from_secs(60))
            .with_interval(Duration::from_secs(10));

        #[cfg(not(target_os = "windows"))]
        let keepalive = keepalive.with_retries(3);

        sock.set_tcp_keepalive(&keepalive)?;
        stream.set_nodelay(true)?;

        Ok(())
    }

    fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.config.handshake_timeout_ms)
    }

    fn name_taken(&self, name: &str) -> bool {
        self.local_peer_id.matches(name) || self.connections.read().keys().any(|p| p.matches(name))
    }

    async fn handle_incoming_connection(self: &Arc<Self>, stream: TcpStream) -> Result<(), CoordError> {
        Self::configure_keepalive(&stream)?;

        let mut framed = Framed::new(stream, PacketCodec::new());

        let peer_id = tokio::time::timeout(self.handshake_timeout(), self.receive_handshake(&mut framed))
            .await
            .map_err(|_| CoordError::HandshakeTimeout)??;

        self.register_connection(peer_id, None, framed)
    }

    async fn reject(&self, framed: &mut Framed<TcpStream, PacketCodec>, reason: String) {
        let ack = encode_frame(&Frame::HandshakeAck {
            name: self.local_peer_id.as_str().to_owned(),
            success: false,
            error_reason: Some(reason),
        });
        if let Ok(ack) = ack {
            let _ = framed.send(ack).await;
        }
    }

    async fn receive_handshake(
        &self,
        framed: &mut Framed<TcpStream, PacketCodec>,
    ) -> Result<PeerId, CoordError> {
        let packet = framed
            .next()
            .await
            .ok_or_else(|| CoordError::HandshakeFailed("connection closed".into()))??;

        match decode_frame(&packet)? {
            Frame::Handshake {
                name,
                protocol_version,
            } => {
                if protocol_version != PROTOCOL_VERSION {
                    self.reject(
                        framed,
                        format!("version_mismatch: expected {PROTOCOL_VERSION}, got {protocol_version}"),
                    )
                    .await;
                    return Err(CoordError::VersionMismatch {
                        expected: PROTOCOL_VERSION,
                        got: protocol_version,
                    });
                }

                let name = name.trim().to_owned();
                if name.is_empty() || self.name_taken(&name) {
                    self.reject(framed, "duplicate_peer_name".into()).await;
                    return Err(CoordError::DuplicatePeerName(name));
                }

                let ack = encode_frame(&Frame::HandshakeAck {
                    name: self.local_peer_id.as_str().to_owned(),
                    success: true,
                    error_reason: None,
                })?;
                framed.send(ack).await.map_err(|e| {
                    CoordError::ConnectionFailed(format!("failed to send handshake ack: {e}"))
                })?;

                Ok(PeerId::new(name))
            }
            _ => Err(CoordError::HandshakeFailed("expected Handshake frame".into())),
        }
    }

    pub async fn connect_to(self: &Arc<Self>, addr: SocketAddr) -> Result<PeerId, CoordError> {
        if self.connections.read().len() >= MAX_CONNECTIONS {
            return Err(CoordError::ConnectionFailed("max connections reached".into()));
        }

        let stream = tokio::time::timeout(self.handshake_timeout(), TcpStream::connect(addr))
            .await
            .map_err(|_| CoordError::HandshakeTimeout)?
            .map_err(|e| CoordError::ConnectionFailed(format!("TCP connect failed: {e}")))?;

        Self::configure_keepalive(&stream)?;

        let mut framed = Framed::new(stream, PacketCodec::new());

        let handshake = encode_frame(&Frame::Handshake {
            name: self.local_peer_id.as_str().to_owned(),
            protocol_version: PROTOCOL_VERSION,
        })?;
        framed.send(handshake).await.map_err(|e| {
            CoordError::ConnectionFailed(format!("failed to send handshake: {e}"))
        })?;

        let peer_id = tokio::time::timeout(
            self.handshake_timeout(),
            Self::receive_handshake_ack(&mut framed),
        )
        .await
        .map_err(|_| CoordError::HandshakeTimeout)??;

        if self.name_taken(peer_id.as_str()) {
            return Err(CoordError::DuplicatePeerName(peer_id.to_string()));
        }

        self.register_connection(peer_id.clone(), Some(addr), framed)?;
        Ok(peer_id)
    }

    async fn receive_handshake_ack(
        framed: &mut Framed<TcpStream, PacketCodec>,
    ) -> Result<PeerId, CoordError> {
        let packet = framed
            .next()
            .await
            .ok_or_else(|| CoordError::HandshakeFailed("connection closed".into()))??;

        match decode_frame(&packet)? {
            Frame::HandshakeAck {
                name,
                success,
                error_reason,
            } => {
                if !success {
                    let reason = error_reason.unwrap_or_else(|| "unknown".into());
                    return Err(CoordError::HandshakeFailed(reason));
                }
                Ok(PeerId::new(name))
            }
            _ => Err(CoordError::HandshakeFailed(
                "expected HandshakeAck frame".into(),
            )),
        }
    }

    fn register_connection(
        self: &Arc<Self>,
        peer_id: PeerId,
        dial_addr: Option<SocketAddr>,
        framed: Framed<TcpStream, PacketCodec>,
    ) -> Result<(), CoordError> {
        let (mut sink, mut stream) = framed.split();
        let (send_tx, mut send_rx) = mpsc::channel::<RawPacket>(self.config.send_queue_capacity);
        let cancel_token = self.shutdown_token.child_token();

        {
            let mut conns = self.connections.write();
            if conns.keys().any(|p| p.matches(peer_id.as_str())) {
                return Err(CoordError::DuplicatePeerName(peer_id.to_string()));
            }
            conns.insert(
                peer_id.clone(),
                PeerConnection {
                    send_tx,
                    cancel_token: cancel_token.clone(),
                    dial_addr,
                    should_reconnect: dial_addr.is_some(),
                },
            );
        }

        tracing::info!(peer = %peer_id, outbound = dial_addr.is_some(), "peer connected");
        if self
            .incoming_tx
            .try_send(Inbound::PeerJoined(peer_id.clone()))
            .is_err()
        {
            tracing::warn!(peer = %peer_id, "inbound queue full, join event dropped");
        }

        let write_cancel = cancel_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    msg = send_rx.recv() => {
                        match msg {
                            Some(packet) => {
                                if let Err(e) = sink.send(packet).await {
                                    tracing::warn!(error = %e, "write task send error");
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = write_cancel.cancelled() => {
                        // flush whatever was queued before the cancel, e.g. Leave
                        while let Ok(packet) = send_rx.try_recv() {
                            if sink.send(packet).await.is_err() {
                                break;
                            }
                        }
                        break;
                    }
                }
            }
        });

        let read_cancel = cancel_token;
        let read_peer_id = peer_id;
        let t = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = read_cancel.cancelled() => break,
                    frame = stream.next() => {
                        match frame {
                            Some(Ok(packet)) => {
                                if !t.dispatch_packet(&read_peer_id, &packet).await {
                                    break;
                                }
                            }
                            Some(Err(e)) => {
                                tracing::warn!(peer = %read_peer_id, error = %e, "read error");
                                break;
                            }
                            None => {
                                tracing::info!(peer = %read_peer_id, "connection closed by remote");
                                break;
                            }
                        }
                    }
                }
            }

            let reconnect_addr = {
                let mut conns = t.connections.write();
                match conns.remove(&read_peer_id) {
                    Some(conn) => {
                        conn.cancel_token.cancel();
                        if conn.should_reconnect && !t.shutdown_token.is_cancelled() {
                            conn.dial_addr
                        } else {
                            None
                        }
                    }
                    None => None,
                }
            };

            let _ = t
                .incoming_tx
                .send(Inbound::PeerLeft(read_peer_id.clone()))
                .await;

            if let Some(addr) = reconnect_addr {
                t.spawn_reconnect(read_peer_id, addr);
            }
        });

        Ok(())
    }

    /// Turn one packet into an inbound event. Returns false when the
    /// handler side has gone away.
    async fn dispatch_packet(&self, from: &PeerId, packet: &RawPacket) -> bool {
        let frame = match decode_frame(packet) {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(peer = %from, error = %e, "failed to decode frame");
                return true;
            }
        };

        let event = match frame {
            Frame::Mail(message) => Inbound::Mail {
                from: from.clone(),
                message,
            },
            Frame::RelayCommand { command } => Inbound::Command {
                from: from.clone(),
                command,
            },
            Frame::Leave { .. } => {
                if let Some(conn) = self.connections.write().get_mut(from) {
                    conn.should_reconnect = false;
                }
                return true;
            }
            Frame::Handshake { .. } | Frame::HandshakeAck { .. } => {
                tracing::debug!(peer = %from, "ignoring handshake frame on established link");
                return true;
            }
        };

        self.incoming_tx.send(event).await.is_ok()
    }

    fn spawn_reconnect(self: &Arc<Self>, peer_id: PeerId, addr: SocketAddr) {
        let t = Arc::clone(self);
        let initial_ms = self.config.reconnect_initial_ms;
        let max_ms = self.config.reconnect_max_ms;
        let shutdown = self.shutdown_token.clone();

        tokio::spawn(async move {
            let mut delay_ms = initial_ms;
            loop {
                let jitter = rand::rng().random_range(0..=delay_ms / 4);
                tracing::info!(peer = %peer_id, delay_ms, "scheduling reconnect");

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms + jitter)) => {}
                }

                let result = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    r = t.connect_to(addr) => r,
                };

                match result {
                    Ok(_) => {
                        tracing::info!(peer = %peer_id, "reconnected successfully");
                        break;
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer_id, error = %e, "reconnect failed");
                        delay_ms = (delay_ms * 2).min(max_ms);
                    }
                }
            }
        });
    }

    fn find_sender(&self, name: &str) -> Option<mpsc::Sender<RawPacket>> {
        self.connections
            .read()
            .iter()
            .find(|(pid, _)| pid.matches(name))
            .map(|(_, conn)| conn.send_tx.clone())
    }

    fn queue(tx: &mpsc::Sender<RawPacket>, packet: RawPacket) -> Result<(), CoordError> {
        tx.try_send(packet).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => CoordError::SendQueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                CoordError::ConnectionFailed("send channel closed".into())
            }
        })
    }

    fn loopback(&self, event: Inbound) -> Result<(), CoordError> {
        self.incoming_tx
            .try_send(event)
            .map_err(|_| CoordError::SendQueueFull)
    }

    pub fn disconnect_peer(&self, peer_id: &PeerId) -> Result<(), CoordError> {
        let leave = encode_frame(&Frame::Leave {
            name: self.local_peer_id.as_str().to_owned(),
        })?;

        let mut conns = self.connections.write();
        let conn = conns
            .get_mut(peer_id)
            .ok_or_else(|| CoordError::PeerNotFound(peer_id.to_string()))?;
        if let Err(e) = Self::queue(&conn.send_tx, leave) {
            tracing::debug!(peer = %peer_id, error = %e, "failed to queue Leave during disconnect");
        }
        conn.should_reconnect = false;
        conn.cancel_token.cancel();

        tracing::info!(peer = %peer_id, "peer disconnected (manual)");
        Ok(())
    }
}

impl Mailbox for TcpTransport {
    fn local_peer_id(&self) -> &PeerId {
        &self.local_peer_id
    }

    fn send(&self, target: &Target, message: Message) -> Result<(), CoordError> {
        match target {
            Target::Broadcast => {
                let packet = encode_frame(&Frame::Mail(message.clone()))?;
                let targets: Vec<(PeerId, mpsc::Sender<RawPacket>)> = self
                    .connections
                    .read()
                    .iter()
                    .map(|(pid, conn)| (pid.clone(), conn.send_tx.clone()))
                    .collect();
                for (pid, tx) in &targets {
                    if let Err(e) = Self::queue(tx, packet.clone()) {
                        tracing::warn!(peer = %pid, error = %e, "broadcast delivery failed");
                    }
                }
                self.loopback(Inbound::Mail {
                    from: self.local_peer_id.clone(),
                    message,
                })
            }
            Target::ToPeer(peer) if self.local_peer_id.matches(peer.as_str()) => {
                self.loopback(Inbound::Mail {
                    from: self.local_peer_id.clone(),
                    message,
                })
            }
            Target::ToPeer(peer) => {
                let tx = self
                    .find_sender(peer.as_str())
                    .ok_or_else(|| CoordError::PeerNotFound(peer.to_string()))?;
                Self::queue(&tx, encode_frame(&Frame::Mail(message))?)
            }
        }
    }

    fn relay_command(&self, name: &str, command: &str) -> Result<(), CoordError> {
        if self.local_peer_id.matches(name) {
            return self.loopback(Inbound::Command {
                from: self.local_peer_id.clone(),
                command: command.to_owned(),
            });
        }
        let tx = self
            .find_sender(name)
            .ok_or_else(|| CoordError::PeerNotFound(name.to_owned()))?;
        Self::queue(
            &tx,
            encode_frame(&Frame::RelayCommand {
                command: command.to_owned(),
            })?,
        )
    }

    fn reachable_peers(&self) -> Vec<PeerId> {
        self.connections.read().keys().cloned().collect()
    }

    fn shutdown(&self) {
        let leave = encode_frame(&Frame::Leave {
            name: self.local_peer_id.as_str().to_owned(),
        });
        let mut conns = self.connections.write();
        for conn in conns.values_mut() {
            if let Ok(packet) = &leave {
                let _ = Self::queue(&conn.send_tx, packet.clone());
            }
            conn.should_reconnect = false;
            conn.cancel_token.cancel();
        }
        conns.clear();
        tracing::info!("transport shutdown complete");
    }
}
