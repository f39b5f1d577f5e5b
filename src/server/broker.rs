use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use flume::Sender;
use tokio::net::TcpListener;
use tokio::select;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time;
use tracing::{error, field, info, warn, Instrument};

use crate::link::local::{self, Link, LinkRx, LinkTx};
use crate::link::network::{self, Network};
use crate::link::remote::{self, RemoteLink};
use crate::router::{Event, Router};
use crate::{Config, ConnectionId, MqttSettings};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("I/O = {0}")]
    Io(#[from] io::Error),
    #[error("Unable to bind {addr}, error = {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("Link error = {0}")]
    Link(#[from] local::LinkError),
}

/// The embedded broker: owns the router thread, the TCP acceptor and
/// the connection id counter shared by network sessions and local links
pub struct Broker {
    config: Arc<Config>,
    router_tx: Sender<(ConnectionId, Event)>,
    router: Option<Router>,
    next_connection_id: Arc<AtomicUsize>,
    shutdown_tx: Option<watch::Sender<bool>>,
    accept_handle: Option<JoinHandle<()>>,
}

/// Connection id 0 is reserved for broker internal events (shutdown)
const FIRST_CONNECTION_ID: usize = 1;

impl Broker {
    pub fn new(config: Config) -> Broker {
        let config = Arc::new(config);
        let (router, router_tx) = Router::new(Arc::new(config.mqtt.connections.clone()));

        Broker {
            config,
            router_tx,
            router: Some(router),
            next_connection_id: Arc::new(AtomicUsize::new(FIRST_CONNECTION_ID)),
            shutdown_tx: None,
            accept_handle: None,
        }
    }

    /// In-process link for local publishers like the collector
    pub fn link(&self, client_id: &str) -> Result<(LinkTx, LinkRx), local::LinkError> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        Link::new(
            connection_id,
            client_id,
            self.router_tx.clone(),
            self.config.mqtt.connections.outgoing_queue_size,
        )
    }

    /// Spawns the router on its own thread, binds the listener and
    /// spawns the accept loop. Returns once the broker accepts
    /// connections; bind failures are fatal to the caller.
    pub async fn start(&mut self) -> Result<(), Error> {
        let mut router = self.router.take().expect("broker started twice");
        thread::Builder::new()
            .name("naspaneld-router".to_owned())
            .spawn(move || router.start())?;

        let addr = format!("{}:{}", self.config.mqtt.host, self.config.mqtt.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| Error::Bind {
                addr: addr.clone(),
                source,
            })?;
        info!("waiting for mqtt connections on {addr}");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        self.shutdown_tx = Some(shutdown_tx);

        let mqtt = Arc::new(self.config.mqtt.clone());
        let router_tx = self.router_tx.clone();
        let next_connection_id = self.next_connection_id.clone();
        self.accept_handle = Some(tokio::spawn(accept_loop(
            listener,
            mqtt,
            router_tx,
            next_connection_id,
            shutdown_rx,
        )));

        Ok(())
    }

    /// Graceful stop: close the listener, signal every session to wind
    /// down and wait for the shutdown deadline before force closing
    /// stragglers
    pub async fn stop(&mut self) {
        info!("stopping broker");
        if let Some(shutdown) = self.shutdown_tx.take() {
            let _ = shutdown.send(true);
        }

        let _ = self.router_tx.send_async((0, Event::Shutdown)).await;

        if let Some(handle) = self.accept_handle.take() {
            let _ = handle.await;
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<MqttSettings>,
    router_tx: Sender<(ConnectionId, Event)>,
    next_connection_id: Arc<AtomicUsize>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();

    loop {
        select! {
            _ = shutdown_rx.changed() => break,
            o = listener.accept() => {
                let (stream, addr) = match o {
                    Ok(v) => v,
                    Err(e) => {
                        error!("unable to accept socket, error = {e}");
                        continue;
                    }
                };

                let connection_id = next_connection_id.fetch_add(1, Ordering::SeqCst);
                info!("accepting connection {connection_id} from {addr}");

                let network = Network::new(Box::new(stream), config.connections.max_payload_size);
                let config = config.clone();
                let router_tx = router_tx.clone();
                let span =
                    tracing::info_span!("connection", connection_id, client_id = field::Empty);
                connections.spawn(
                    handle_connection(config, router_tx, connection_id, network).instrument(span),
                );
            }
        }
    }

    // Listener closes here; sessions were told to disconnect through the
    // router. Whoever misses the deadline gets aborted.
    drop(listener);
    let deadline = Duration::from_millis(config.connections.graceful_shutdown_timeout_ms);
    let drained = time::timeout(deadline, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!("forcing {} connections closed", connections.len());
        connections.abort_all();
    }
}

async fn handle_connection(
    config: Arc<MqttSettings>,
    router_tx: Sender<(ConnectionId, Event)>,
    connection_id: ConnectionId,
    network: Network,
) {
    let mut link = match RemoteLink::new(config, router_tx.clone(), connection_id, network).await {
        Ok(link) => link,
        Err(e) => {
            warn!("connection rejected, error = {e}");
            return;
        }
    };

    match link.start().await {
        // router closed this session: take-over, slow consumer or
        // shutdown
        Ok(()) => info!("connection closed by broker"),
        Err(remote::Error::Disconnect) => info!("client disconnected"),
        Err(remote::Error::Io(e)) => info!("connection lost, error = {e}"),
        Err(remote::Error::Network(network::Error::Io(e))) => {
            info!("connection lost, error = {e}")
        }
        Err(e) => warn!("connection error = {e}"),
    }

    let _ = router_tx
        .send_async((connection_id, Event::Disconnect))
        .await;
}
