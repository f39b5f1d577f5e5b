use std::collections::HashSet;
use std::fmt;

use crate::protocol::{ConnAck, PubAck, Publish, SubAck, Subscribe, UnsubAck, Unsubscribe};
use crate::ConnectionId;

mod retained;
mod routing;
mod subscriptions;

pub use routing::Router;

/// Everything a connection tells the router, always paired with the
/// connection id on the router channel
#[derive(Debug)]
pub enum Event {
    /// A connected (and authenticated) client registering itself
    Connect { connection: Connection },
    /// Publish received on a connection, or produced by a local link
    Publish { publish: Publish },
    /// Subscription request
    Subscribe { subscribe: Subscribe },
    /// Unsubscription request
    Unsubscribe { unsubscribe: Unsubscribe },
    /// Connection is gone, clean or otherwise
    Disconnect,
    /// Broker is shutting down
    Shutdown,
}

/// Router to connection messages, delivered over the connection's
/// bounded outgoing queue in strict order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    ConnAck(ConnAck),
    /// Application message for a subscriber. QoS is already the
    /// effective QoS, pkid is assigned by the receiving session
    Forward(Forward),
    /// Ack for a QoS 1 publish this connection sent, emitted after the
    /// publish was routed
    PubAck(PubAck),
    SubAck(SubAck),
    UnsubAck(UnsubAck),
    /// Broker initiated close: session take-over or shutdown
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Forward {
    pub publish: Publish,
}

/// Router side state of one connection
pub struct Connection {
    /// Client id of the connection, unique among connected sessions
    pub client_id: String,
    pub clean_session: bool,
    /// Handle to the connection's bounded outgoing queue
    pub outgoing: flume::Sender<Notification>,
    /// Filters this connection subscribed to, used to clean the
    /// subscription index on removal
    pub(crate) subscriptions: HashSet<String>,
}

impl Connection {
    pub fn new(
        client_id: impl Into<String>,
        clean_session: bool,
        outgoing: flume::Sender<Notification>,
    ) -> Connection {
        Connection {
            client_id: client_id.into(),
            clean_session,
            outgoing,
            subscriptions: HashSet::new(),
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("client_id", &self.client_id)
            .field("clean_session", &self.clean_session)
            .field("subscriptions", &self.subscriptions)
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    #[error("Channel recv error")]
    Recv(#[from] flume::RecvError),
    #[error("Channel send error")]
    Send(#[from] flume::SendError<(ConnectionId, Event)>),
}
