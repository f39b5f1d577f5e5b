use std::collections::HashMap;

use crate::protocol::QoS;
use crate::ConnectionId;

/// Subscription index: a trie over `/`-delimited filter levels. `+` and
/// `#` children live next to literal children and are walked during
/// match. Concurrency is by construction, the router thread is the only
/// toucher.
#[derive(Debug, Default)]
pub struct SubscriptionIndex {
    root: Node,
}

#[derive(Debug, Default)]
struct Node {
    children: HashMap<String, Node>,
    /// Granted QoS per subscriber whose filter ends at this node
    subscribers: HashMap<ConnectionId, QoS>,
}

impl Node {
    fn is_empty(&self) -> bool {
        self.children.is_empty() && self.subscribers.is_empty()
    }
}

impl SubscriptionIndex {
    pub fn new() -> SubscriptionIndex {
        SubscriptionIndex::default()
    }

    /// Inserts or updates a subscription. Re-subscribing with a new QoS
    /// just replaces the granted QoS.
    pub fn subscribe(&mut self, id: ConnectionId, filter: &str, qos: QoS) {
        let mut node = &mut self.root;
        for level in filter.split('/') {
            node = node.children.entry(level.to_owned()).or_default();
        }

        node.subscribers.insert(id, qos);
    }

    /// Removes a subscription, pruning nodes that are left empty. No-op
    /// when the subscription doesn't exist.
    pub fn unsubscribe(&mut self, id: ConnectionId, filter: &str) {
        let levels = filter.split('/').collect::<Vec<&str>>();
        remove(&mut self.root, &levels, id);
    }

    /// All subscribers whose filter matches `topic`, at the maximum
    /// granted QoS across their matching filters. One entry per
    /// connection keeps the delivery single per application message.
    pub fn matches(&self, topic: &str) -> HashMap<ConnectionId, QoS> {
        let levels = topic.split('/').collect::<Vec<&str>>();
        let mut out = HashMap::new();

        // topics starting with '$' are never matched by a leading
        // wildcard level
        let guard_first_level = topic.starts_with('$');
        collect(&self.root, &levels, guard_first_level, &mut out);
        out
    }
}

fn remove(node: &mut Node, levels: &[&str], id: ConnectionId) {
    match levels.split_first() {
        Some((first, rest)) => {
            if let Some(child) = node.children.get_mut(*first) {
                remove(child, rest, id);
                if child.is_empty() {
                    node.children.remove(*first);
                }
            }
        }
        None => {
            node.subscribers.remove(&id);
        }
    }
}

fn collect(
    node: &Node,
    levels: &[&str],
    guard_wildcards: bool,
    out: &mut HashMap<ConnectionId, QoS>,
) {
    let Some((first, rest)) = levels.split_first() else {
        merge(out, &node.subscribers);
        // "a/#" also matches "a", the parent of the last level
        if let Some(hash) = node.children.get("#") {
            merge(out, &hash.subscribers);
        }
        return;
    };

    if let Some(child) = node.children.get(*first) {
        collect(child, rest, false, out);
    }

    if !guard_wildcards {
        if let Some(plus) = node.children.get("+") {
            collect(plus, rest, false, out);
        }

        if let Some(hash) = node.children.get("#") {
            merge(out, &hash.subscribers);
        }
    }
}

fn merge(out: &mut HashMap<ConnectionId, QoS>, subscribers: &HashMap<ConnectionId, QoS>) {
    for (id, qos) in subscribers {
        out.entry(*id)
            .and_modify(|q| *q = (*q).max(*qos))
            .or_insert(*qos);
    }
}
