use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use tokio::time::Instant;

use crate::protocol::{PubAck, Publish, QoS};
use crate::ConnectionSettings;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Received unsolicited ack pkid = {0}")]
    UnsolicitedAck(u16),
    #[error("No ack for pkid = {0} after retransmissions")]
    MaxRetransmits(u16),
}

#[derive(Debug)]
struct Inflight {
    publish: Publish,
    deadline: Instant,
    attempts: u8,
}

/// Protocol state for outgoing QoS 1 publishes of one session. Assigns
/// packet identifiers, keeps the pending-ack map and decides
/// retransmissions. Touched only by the session's own task.
#[derive(Debug)]
pub struct State {
    /// Last allocated packet identifier, wraps within 1..=65535
    last_pkid: u16,
    /// In flight publishes by pkid, pairwise distinct by construction
    pending: HashMap<u16, Inflight>,
    /// Overflow once max_inflight is reached, drained on acks
    waiting: VecDeque<Publish>,
    max_inflight: usize,
    retransmit_timeout: Duration,
    max_attempts: u8,
}

impl State {
    pub fn new(config: &ConnectionSettings) -> State {
        State {
            last_pkid: 0,
            pending: HashMap::new(),
            waiting: VecDeque::new(),
            max_inflight: config.max_inflight_count as usize,
            retransmit_timeout: Duration::from_millis(config.retransmit_timeout_ms),
            max_attempts: config.max_retransmit_attempts,
        }
    }

    /// Prepares a forward for the wire. QoS 0 passes through untouched.
    /// QoS 1 gets a fresh pkid and lands in the pending map, or queues
    /// up when the inflight window is full.
    pub fn outgoing_publish(&mut self, publish: Publish) -> Option<Publish> {
        if publish.qos == QoS::AtMostOnce {
            return Some(publish);
        }

        if self.pending.len() >= self.max_inflight {
            self.waiting.push_back(publish);
            return None;
        }

        Some(self.register(publish))
    }

    fn register(&mut self, mut publish: Publish) -> Publish {
        publish.pkid = self.next_pkid();
        self.pending.insert(
            publish.pkid,
            Inflight {
                publish: publish.clone(),
                deadline: Instant::now() + self.retransmit_timeout,
                attempts: 0,
            },
        );

        publish
    }

    /// Settles an inflight publish. Returns the next waiting publish to
    /// put on the wire, if any.
    pub fn handle_puback(&mut self, puback: PubAck) -> Result<Option<Publish>, Error> {
        if self.pending.remove(&puback.pkid).is_none() {
            return Err(Error::UnsolicitedAck(puback.pkid));
        }

        match self.waiting.pop_front() {
            Some(publish) => Ok(Some(self.register(publish))),
            None => Ok(None),
        }
    }

    /// Publishes whose ack deadline expired, re-armed and flagged DUP.
    /// Errors once any publish exhausts its retransmission budget.
    pub fn retransmissions(&mut self, now: Instant) -> Result<Vec<Publish>, Error> {
        let mut expired = Vec::new();
        for inflight in self.pending.values_mut() {
            if inflight.deadline > now {
                continue;
            }

            if inflight.attempts >= self.max_attempts {
                return Err(Error::MaxRetransmits(inflight.publish.pkid));
            }

            inflight.attempts += 1;
            inflight.deadline = now + self.retransmit_timeout;
            inflight.publish.dup = true;
            expired.push(inflight.publish.clone());
        }

        Ok(expired)
    }

    pub fn inflight(&self) -> usize {
        self.pending.len()
    }

    /// Next pkid, skipping 0 and identifiers still awaiting an ack
    fn next_pkid(&mut self) -> u16 {
        loop {
            self.last_pkid = self.last_pkid.wrapping_add(1);
            if self.last_pkid == 0 {
                continue;
            }

            if !self.pending.contains_key(&self.last_pkid) {
                return self.last_pkid;
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use bytes::Bytes;

    fn settings() -> ConnectionSettings {
        ConnectionSettings {
            max_inflight_count: 3,
            max_retransmit_attempts: 2,
            ..ConnectionSettings::default()
        }
    }

    fn publish(qos: QoS) -> Publish {
        Publish {
            dup: false,
            qos,
            pkid: 0,
            retain: false,
            topic: "nas/panel/data".into(),
            payload: Bytes::from_static(b"x"),
        }
    }

    #[test]
    fn qos0_is_not_tracked() {
        let mut state = State::new(&settings());
        let out = state.outgoing_publish(publish(QoS::AtMostOnce)).unwrap();
        assert_eq!(out.pkid, 0);
        assert_eq!(state.inflight(), 0);
    }

    #[test]
    fn pkids_are_pairwise_distinct() {
        let mut state = State::new(&settings());
        let a = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();
        let b = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();
        let c = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();

        assert_eq!(state.inflight(), 3);
        assert_ne!(a.pkid, b.pkid);
        assert_ne!(b.pkid, c.pkid);
        assert_ne!(a.pkid, c.pkid);
    }

    #[test]
    fn window_overflow_waits_for_acks() {
        let mut state = State::new(&settings());
        let first = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();
        state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();
        state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();

        // window full, fourth publish parks
        assert!(state.outgoing_publish(publish(QoS::AtLeastOnce)).is_none());

        let next = state
            .handle_puback(PubAck { pkid: first.pkid })
            .unwrap()
            .expect("waiting publish should be released");
        assert_ne!(next.pkid, 0);
        assert_eq!(state.inflight(), 3);
    }

    #[test]
    fn unsolicited_ack_is_an_error() {
        let mut state = State::new(&settings());
        assert!(matches!(
            state.handle_puback(PubAck { pkid: 10 }),
            Err(Error::UnsolicitedAck(10))
        ));
    }

    #[test]
    fn expired_publishes_are_retransmitted_with_dup() {
        let mut state = State::new(&settings());
        let sent = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();

        let now = Instant::now() + Duration::from_secs(60);
        let retransmits = state.retransmissions(now).unwrap();
        assert_eq!(retransmits.len(), 1);
        assert_eq!(retransmits[0].pkid, sent.pkid);
        assert!(retransmits[0].dup);

        // nothing due before the re-armed deadline
        assert!(state.retransmissions(now).unwrap().is_empty());
    }

    #[test]
    fn retransmission_budget_is_bounded() {
        let mut state = State::new(&settings());
        state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();

        let mut now = Instant::now();
        for _ in 0..2 {
            now += Duration::from_secs(60);
            assert_eq!(state.retransmissions(now).unwrap().len(), 1);
        }

        now += Duration::from_secs(60);
        assert!(matches!(
            state.retransmissions(now),
            Err(Error::MaxRetransmits(_))
        ));
    }

    #[test]
    fn pkid_wraps_around_skipping_inflight_ids() {
        let mut state = State::new(&settings());
        state.last_pkid = u16::MAX - 1;

        let a = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();
        let b = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();
        assert_eq!(a.pkid, u16::MAX);
        assert_eq!(b.pkid, 1);

        // wrap again with 1 and 65535 still inflight
        state.last_pkid = u16::MAX - 1;
        let c = state.outgoing_publish(publish(QoS::AtLeastOnce)).unwrap();
        assert_eq!(c.pkid, 2);
    }
}
