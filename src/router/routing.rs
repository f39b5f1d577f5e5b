use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flume::{Receiver, Sender, TrySendError};
use tracing::{debug, info, trace, warn};

use crate::protocol::{
    topic, ConnAck, ConnectReturnCode, PubAck, Publish, QoS, SubAck, Subscribe,
    SubscribeReasonCode, UnsubAck, Unsubscribe,
};
use crate::router::retained::RetainedStore;
use crate::router::subscriptions::SubscriptionIndex;
use crate::router::{Connection, Event, Forward, Notification};
use crate::{ConnectionId, ConnectionSettings};

/// Capacity of the channel all connections share towards the router
pub const MAX_CHANNEL_CAPACITY: usize = 200;

/// Owns every piece of routing state: connections, the subscription
/// index and the retained store. Runs as a single event loop on a
/// dedicated thread, which is what makes concurrent subscribe/publish
/// well ordered; a matcher can never observe a half applied
/// subscription.
pub struct Router {
    config: Arc<ConnectionSettings>,
    router_rx: Receiver<(ConnectionId, Event)>,
    connections: HashMap<ConnectionId, Connection>,
    /// client id -> connection id of the live session with that id
    ids: HashMap<String, ConnectionId>,
    subscriptions: SubscriptionIndex,
    retained: RetainedStore,
}

impl Router {
    pub fn new(config: Arc<ConnectionSettings>) -> (Router, Sender<(ConnectionId, Event)>) {
        let (router_tx, router_rx) = flume::bounded(MAX_CHANNEL_CAPACITY);
        let router = Router {
            config,
            router_rx,
            connections: HashMap::new(),
            ids: HashMap::new(),
            subscriptions: SubscriptionIndex::new(),
            retained: RetainedStore::new(),
        };

        (router, router_tx)
    }

    /// Blocking event loop. Returns when a shutdown event arrives or
    /// every sender is gone.
    pub fn start(&mut self) {
        info!("router up");
        while let Ok((id, event)) = self.router_rx.recv() {
            if !self.handle_event(id, event) {
                break;
            }
        }

        info!("router down");
    }

    fn handle_event(&mut self, id: ConnectionId, event: Event) -> bool {
        trace!("event from {id}: {event:?}");
        match event {
            Event::Connect { connection } => self.handle_connect(id, connection),
            Event::Publish { publish } => self.handle_publish(id, publish),
            Event::Subscribe { subscribe } => self.handle_subscribe(id, subscribe),
            Event::Unsubscribe { unsubscribe } => self.handle_unsubscribe(id, unsubscribe),
            Event::Disconnect => self.remove_connection(id),
            Event::Shutdown => {
                self.handle_shutdown();
                return false;
            }
        }

        true
    }

    fn handle_connect(&mut self, id: ConnectionId, connection: Connection) {
        let client_id = connection.client_id.clone();

        // Session take-over: a second CONNECT with a live client id
        // closes the previous session before the new one is acked
        if let Some(previous) = self.ids.insert(client_id.clone(), id) {
            warn!("client_id = {client_id} taken over, closing connection {previous}");
            if let Some(old) = self.connections.get(&previous) {
                let _ = old.outgoing.try_send(Notification::Disconnect);
            }

            self.remove_connection(previous);
        }

        let outgoing = connection.outgoing.clone();
        self.connections.insert(id, connection);
        info!("client_id = {client_id} connected as {id}");

        // Sessions are always effectively clean, session_present is
        // never set
        let ack = Notification::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        });

        if outgoing.send_timeout(ack, self.slow_consumer_deadline()).is_err() {
            self.remove_connection(id);
        }
    }

    fn handle_publish(&mut self, id: ConnectionId, publish: Publish) {
        if !topic::valid_topic(&publish.topic) {
            warn!("invalid publish topic {:?} from {id}", publish.topic);
            self.disconnect(id);
            return;
        }

        if publish.retain {
            self.retained
                .store(&publish.topic, publish.payload.clone(), publish.qos);
        }

        self.route(&publish);

        // The ack crosses the publisher's ordered queue after the
        // forwards were enqueued, routing strictly precedes PUBACK
        if publish.qos == QoS::AtLeastOnce {
            if let Some(conn) = self.connections.get(&id) {
                let ack = Notification::PubAck(PubAck { pkid: publish.pkid });
                if !send(&self.config, conn, ack) {
                    self.remove_connection(id);
                }
            }
        }
    }

    /// Fans a publish out to every matching subscriber, one delivery per
    /// connection at the maximum granted QoS of its matching filters
    fn route(&mut self, publish: &Publish) {
        let matches = self.subscriptions.matches(&publish.topic);
        trace!("{} subscribers for {}", matches.len(), publish.topic);

        let mut dead = Vec::new();
        for (subscriber, granted) in matches {
            let Some(conn) = self.connections.get(&subscriber) else {
                continue;
            };

            let forward = Notification::Forward(Forward {
                publish: Publish {
                    dup: false,
                    qos: publish.qos.min(granted),
                    pkid: 0,
                    retain: false,
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
            });

            if !send(&self.config, conn, forward) {
                dead.push(subscriber);
            }
        }

        for subscriber in dead {
            warn!("dropping slow or dead subscriber {subscriber}");
            self.remove_connection(subscriber);
        }
    }

    fn handle_subscribe(&mut self, id: ConnectionId, subscribe: Subscribe) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        let mut return_codes = Vec::with_capacity(subscribe.filters.len());
        let mut accepted = Vec::new();
        for filter in subscribe.filters {
            if !topic::valid_filter(&filter.path) {
                debug!("rejecting filter {:?} from {id}", filter.path);
                return_codes.push(SubscribeReasonCode::Failure);
                continue;
            }

            // QoS 2 requests are granted QoS 1
            let granted = match filter.qos {
                0 => QoS::AtMostOnce,
                _ => QoS::AtLeastOnce,
            };

            self.subscriptions.subscribe(id, &filter.path, granted);
            conn.subscriptions.insert(filter.path.clone());
            return_codes.push(SubscribeReasonCode::Success(granted));
            accepted.push((filter.path, granted));
        }

        let suback = Notification::SubAck(SubAck {
            pkid: subscribe.pkid,
            return_codes,
        });

        let conn = &self.connections[&id];
        if !send(&self.config, conn, suback) {
            self.remove_connection(id);
            return;
        }

        // Retained messages follow the SUBACK, flagged retain=1. They
        // may interleave with live publishes from other connections but
        // never overtake the ack.
        let mut alive = true;
        for (filter, granted) in accepted {
            for retained in self.retained.matching(&filter) {
                let forward = Notification::Forward(Forward {
                    publish: Publish {
                        dup: false,
                        qos: retained.qos.min(granted),
                        pkid: 0,
                        retain: true,
                        topic: retained.topic,
                        payload: retained.payload,
                    },
                });

                if !send(&self.config, conn, forward) {
                    alive = false;
                    break;
                }
            }

            if !alive {
                break;
            }
        }

        if !alive {
            self.remove_connection(id);
        }
    }

    fn handle_unsubscribe(&mut self, id: ConnectionId, unsubscribe: Unsubscribe) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };

        for topic in &unsubscribe.topics {
            self.subscriptions.unsubscribe(id, topic);
            conn.subscriptions.remove(topic);
        }

        let unsuback = Notification::UnsubAck(UnsubAck {
            pkid: unsubscribe.pkid,
        });

        let conn = &self.connections[&id];
        if !send(&self.config, conn, unsuback) {
            self.remove_connection(id);
        }
    }

    /// Broker initiated close of one connection, e.g. on a protocol
    /// violation detected during routing
    fn disconnect(&mut self, id: ConnectionId) {
        if let Some(conn) = self.connections.get(&id) {
            let _ = conn.outgoing.try_send(Notification::Disconnect);
        }

        self.remove_connection(id);
    }

    fn remove_connection(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };

        for filter in &conn.subscriptions {
            self.subscriptions.unsubscribe(id, filter);
        }

        // A take-over re-points the client id before removing the old
        // connection, only clear the mapping when it is still ours
        if self.ids.get(&conn.client_id) == Some(&id) {
            self.ids.remove(&conn.client_id);
        }

        info!("client_id = {} removed ({id})", conn.client_id);
    }

    fn handle_shutdown(&mut self) {
        info!("shutting down {} connections", self.connections.len());
        for (_, conn) in self.connections.drain() {
            let _ = conn.outgoing.try_send(Notification::Disconnect);
        }

        self.ids.clear();
        self.subscriptions = SubscriptionIndex::new();
        self.retained.clear();
    }

    fn slow_consumer_deadline(&self) -> Duration {
        Duration::from_millis(self.config.slow_consumer_timeout_ms)
    }
}

/// Hands a notification to a connection's bounded queue. QoS 0 forwards
/// are never worth blocking the router for; everything else may block up
/// to the slow consumer deadline. Returns false when the connection
/// should be dropped.
fn send(config: &ConnectionSettings, conn: &Connection, notification: Notification) -> bool {
    let qos0_forward = matches!(
        &notification,
        Notification::Forward(f) if f.publish.qos == QoS::AtMostOnce
    );

    if qos0_forward {
        match conn.outgoing.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    } else {
        let deadline = Duration::from_millis(config.slow_consumer_timeout_ms);
        conn.outgoing.send_timeout(notification, deadline).is_ok()
    }
}
