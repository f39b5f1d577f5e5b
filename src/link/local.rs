use bytes::Bytes;
use flume::{Receiver, Sender};

use crate::protocol::{Publish, QoS, Subscribe, SubscribeFilter};
use crate::router::{Connection, Event, Notification};
use crate::ConnectionId;

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("Channel send error")]
    Send(#[from] flume::SendError<(ConnectionId, Event)>),
    #[error("Channel recv error")]
    Recv(#[from] flume::RecvError),
}

/// In-process link into the router. The collector publishes its
/// telemetry through one of these; integration tests use the receiving
/// half as an embedded subscriber.
pub struct Link;

impl Link {
    /// Registers a local connection with the router. The first
    /// notification on the returned [`LinkRx`] is the connack.
    pub fn new(
        connection_id: ConnectionId,
        client_id: &str,
        router_tx: Sender<(ConnectionId, Event)>,
        queue_size: usize,
    ) -> Result<(LinkTx, LinkRx), LinkError> {
        let (outgoing_tx, outgoing_rx) = flume::bounded(queue_size);
        let connection = Connection::new(client_id, true, outgoing_tx);
        router_tx.send((connection_id, Event::Connect { connection }))?;

        let tx = LinkTx {
            connection_id,
            router_tx,
        };

        let rx = LinkRx {
            connection_id,
            outgoing_rx,
        };

        Ok((tx, rx))
    }
}

#[derive(Debug, Clone)]
pub struct LinkTx {
    connection_id: ConnectionId,
    router_tx: Sender<(ConnectionId, Event)>,
}

impl LinkTx {
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        qos: QoS,
        retain: bool,
        payload: impl Into<Bytes>,
    ) -> Result<(), LinkError> {
        let publish = Publish {
            dup: false,
            qos,
            // local publishes are fire and forget, the router still acks
            // them for uniformity and the ack is dropped by the drain
            pkid: if qos == QoS::AtMostOnce { 0 } else { 1 },
            retain,
            topic: topic.into(),
            payload: payload.into(),
        };

        self.router_tx
            .send_async((self.connection_id, Event::Publish { publish }))
            .await?;
        Ok(())
    }

    pub async fn subscribe(&self, filter: impl Into<String>, qos: u8) -> Result<(), LinkError> {
        let subscribe = Subscribe {
            pkid: 0,
            filters: vec![SubscribeFilter {
                path: filter.into(),
                qos,
            }],
        };

        self.router_tx
            .send_async((self.connection_id, Event::Subscribe { subscribe }))
            .await?;
        Ok(())
    }
}

pub struct LinkRx {
    connection_id: ConnectionId,
    outgoing_rx: Receiver<Notification>,
}

impl LinkRx {
    pub fn id(&self) -> ConnectionId {
        self.connection_id
    }

    pub async fn recv(&self) -> Result<Notification, LinkError> {
        Ok(self.outgoing_rx.recv_async().await?)
    }
}
