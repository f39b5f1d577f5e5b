use std::io;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, RecvError, SendError, Sender};
use tokio::select;
use tokio::time::{self, error::Elapsed, Instant, MissedTickBehavior};
use tracing::{trace, Span};

use crate::link::network::{self, Network};
use crate::link::state::{self, State};
use crate::protocol::{ConnAck, ConnectReturnCode, Login, Packet};
use crate::router::{Connection, Event, Notification};
use crate::{ConnectionId, MqttSettings};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O = {0}")]
    Io(#[from] io::Error),
    #[error("Network = {0}")]
    Network(#[from] network::Error),
    #[error("Timeout waiting for connect packet")]
    ConnectTimeout(#[from] Elapsed),
    #[error("First packet is not connect = {0:?}")]
    NotConnectPacket(Packet),
    #[error("Unsupported protocol level = {0}")]
    InvalidProtocolLevel(u8),
    #[error("Persistent session requires a client id")]
    InvalidClientId,
    #[error("Authentication error")]
    InvalidAuth,
    #[error("Keep alive timeout")]
    KeepAlive,
    #[error("State = {0}")]
    State(#[from] state::Error),
    #[error("Unexpected packet = {0:?}")]
    UnexpectedPacket(Packet),
    #[error("Client requested disconnection")]
    Disconnect,
    #[error("Channel send error")]
    Send(#[from] SendError<(ConnectionId, Event)>),
    #[error("Channel recv error")]
    Recv(#[from] RecvError),
    #[error("Unexpected router message")]
    NotConnAck,
}

/// Drives one network client through the protocol state machine,
/// orchestrating between the router and the socket
pub struct RemoteLink {
    pub(crate) client_id: String,
    connection_id: ConnectionId,
    network: Network,
    router_tx: Sender<(ConnectionId, Event)>,
    link_rx: Receiver<Notification>,
    state: State,
    /// 1.5 x negotiated keep alive, zero when disabled
    keepalive: Duration,
    last_incoming: Instant,
}

impl RemoteLink {
    /// Waits for CONNECT, validates it and registers the session with
    /// the router. Every rejection answers with the matching CONNACK
    /// return code before erroring out.
    pub async fn new(
        config: Arc<MqttSettings>,
        router_tx: Sender<(ConnectionId, Event)>,
        connection_id: ConnectionId,
        mut network: Network,
    ) -> Result<RemoteLink, Error> {
        // A new network connection gets a grace period for its CONNECT.
        // Idle open sockets otherwise pile up towards the connection
        // limit (rogue clients, port scanners).
        let connection_timeout =
            Duration::from_millis(config.connections.connection_timeout_ms);
        let packet = time::timeout(connection_timeout, network.read()).await??;

        let (connect, login) = match packet {
            Packet::Connect(connect, _lastwill, login) => (connect, login),
            packet => return Err(Error::NotConnectPacket(packet)),
        };
        Span::current().record("client_id", connect.client_id.as_str());

        if connect.protocol_level != 4 {
            reject(&mut network, ConnectReturnCode::RefusedProtocolVersion).await?;
            return Err(Error::InvalidProtocolLevel(connect.protocol_level));
        }

        let client_id = match connect.client_id.as_str() {
            // A client without an id can't outlive its connection, so it
            // must ask for a clean session
            "" if !connect.clean_session => {
                reject(&mut network, ConnectReturnCode::BadClientId).await?;
                return Err(Error::InvalidClientId);
            }
            "" => format!("naspanel-{:08x}", rand::random::<u32>()),
            id => id.to_owned(),
        };

        if let Some(credentials) = &config.auth {
            if !authenticate(credentials, &login) {
                let code = match login {
                    Some(_) => ConnectReturnCode::BadUserNamePassword,
                    None => ConnectReturnCode::NotAuthorized,
                };
                reject(&mut network, code).await?;
                return Err(Error::InvalidAuth);
            }
        }

        // Register with the router. The connack flows back through the
        // session's ordered outgoing queue; any prior session with this
        // client id is closed before the router sends it.
        let (outgoing_tx, link_rx) = flume::bounded(config.connections.outgoing_queue_size);
        let connection = Connection::new(&client_id, connect.clean_session, outgoing_tx);
        router_tx
            .send_async((connection_id, Event::Connect { connection }))
            .await?;

        match link_rx.recv_async().await? {
            Notification::ConnAck(ack) => network.write(Packet::ConnAck(ack)).await?,
            _ => return Err(Error::NotConnAck),
        }

        let keepalive = match connect.keep_alive {
            0 => Duration::ZERO,
            secs => {
                let keepalive = Duration::from_secs(secs as u64);
                keepalive + keepalive.mul_f32(0.5)
            }
        };

        Ok(RemoteLink {
            client_id,
            connection_id,
            network,
            router_tx,
            link_rx,
            state: State::new(&config.connections),
            keepalive,
            last_incoming: Instant::now(),
        })
    }

    /// Session main loop. Returns Ok on a broker initiated close,
    /// `Error::Disconnect` on a clean client DISCONNECT and any other
    /// error on protocol or transport failure.
    pub async fn start(&mut self) -> Result<(), Error> {
        let mut ticker = time::interval(Duration::from_millis(500));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            select! {
                o = self.network.read() => {
                    let packet = o?;
                    self.last_incoming = Instant::now();
                    self.handle_network(packet).await?;
                }
                o = self.link_rx.recv_async() => {
                    let notification = match o {
                        Ok(notification) => notification,
                        // router dropped us, e.g. as a slow consumer
                        Err(_) => return Ok(()),
                    };

                    if !self.handle_notification(notification).await? {
                        return Ok(());
                    }
                }
                now = ticker.tick() => {
                    if !self.keepalive.is_zero()
                        && now.duration_since(self.last_incoming) > self.keepalive
                    {
                        return Err(Error::KeepAlive);
                    }

                    for publish in self.state.retransmissions(now)? {
                        trace!("retransmitting pkid = {}", publish.pkid);
                        self.network.write(Packet::Publish(publish)).await?;
                    }
                }
            }
        }
    }

    async fn handle_network(&mut self, packet: Packet) -> Result<(), Error> {
        match packet {
            Packet::Publish(publish) => {
                // Routed by the router, which also emits the PUBACK for
                // QoS 1 strictly after the forwards
                self.router_tx
                    .send_async((self.connection_id, Event::Publish { publish }))
                    .await?;
            }
            Packet::PubAck(puback) => {
                if let Some(next) = self.state.handle_puback(puback)? {
                    self.network.write(Packet::Publish(next)).await?;
                }
            }
            Packet::Subscribe(subscribe) => {
                self.router_tx
                    .send_async((self.connection_id, Event::Subscribe { subscribe }))
                    .await?;
            }
            Packet::Unsubscribe(unsubscribe) => {
                self.router_tx
                    .send_async((self.connection_id, Event::Unsubscribe { unsubscribe }))
                    .await?;
            }
            Packet::PingReq => self.network.write(Packet::PingResp).await?,
            Packet::Disconnect => return Err(Error::Disconnect),
            // a second CONNECT and every server-to-client packet type
            // are protocol violations on a live session
            packet => return Err(Error::UnexpectedPacket(packet)),
        }

        Ok(())
    }

    /// Writes one router notification to the wire. Returns false when
    /// the session should wind down.
    async fn handle_notification(&mut self, notification: Notification) -> Result<bool, Error> {
        match notification {
            Notification::Forward(forward) => {
                if let Some(publish) = self.state.outgoing_publish(forward.publish) {
                    self.network.write(Packet::Publish(publish)).await?;
                }
            }
            Notification::PubAck(puback) => self.network.write(Packet::PubAck(puback)).await?,
            Notification::SubAck(suback) => self.network.write(Packet::SubAck(suback)).await?,
            Notification::UnsubAck(unsuback) => {
                self.network.write(Packet::UnsubAck(unsuback)).await?
            }
            // handshake already consumed the connack
            Notification::ConnAck(_) => return Err(Error::NotConnAck),
            Notification::Disconnect => return Ok(false),
        }

        Ok(true)
    }
}

async fn reject(network: &mut Network, code: ConnectReturnCode) -> Result<(), Error> {
    let ack = ConnAck {
        session_present: false,
        code,
    };

    network.write(Packet::ConnAck(ack)).await?;
    Ok(())
}

fn authenticate(credentials: &[crate::LoginCredentials], login: &Option<Login>) -> bool {
    match login {
        Some(login) => credentials
            .iter()
            .any(|c| c.username == login.username && c.password == login.password),
        None => false,
    }
}
