use std::time::Duration;

use serde_json::Map;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collector::custom::Probe;
use crate::collector::{SystemSampler, Telemetry};
use crate::link::local::{LinkError, LinkTx};
use crate::protocol::QoS;
use crate::{Config, ConfigError};

/// Where a tick's payload goes: the embedded router, or an external
/// broker through rumqttc
pub enum Target {
    Broker(LinkTx),
    External(rumqttc::AsyncClient),
}

impl Target {
    async fn publish(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), PublishError> {
        match self {
            Target::Broker(link) => link.publish(topic, qos, false, payload).await?,
            Target::External(client) => {
                let qos = match qos {
                    QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
                    QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
                };

                client.publish(topic, qos, false, payload).await?;
            }
        }

        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("Link error = {0}")]
    Link(#[from] LinkError),
    #[error("Client error = {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// Periodic collection engine: samples the built-in probes and every
/// declared custom probe on a fixed cadence, assembles the JSON payload
/// and hands it off for publishing
pub struct Collector {
    sampler: Box<dyn SystemSampler>,
    probes: Vec<Probe>,
    interval: Duration,
    topic: String,
    qos: QoS,
}

impl Collector {
    pub fn new(config: &Config, sampler: Box<dyn SystemSampler>) -> Result<Collector, ConfigError> {
        let probes = config
            .custom_collectors
            .iter()
            .map(Probe::new)
            .collect::<Result<Vec<Probe>, ConfigError>>()?;

        Ok(Collector {
            sampler,
            probes,
            interval: Duration::from_secs(config.collection.interval),
            topic: config.mqtt.topic.clone(),
            qos: config.mqtt.publish_qos(),
        })
    }

    /// One tick: snapshot the built-ins, then every custom probe. A
    /// failing probe never aborts the tick.
    pub async fn collect_once(&mut self) -> Telemetry {
        let mut telemetry = self.sampler.sample();

        if !self.probes.is_empty() {
            let mut custom = Map::new();
            for probe in &self.probes {
                custom.insert(probe.name.clone(), probe.collect().await);
            }

            telemetry.custom = Some(custom);
        }

        telemetry
    }

    /// Fixed cadence loop. The first publish happens one full interval
    /// after start; delivery failures only log, the next tick runs
    /// regardless.
    pub async fn start(mut self, target: Target) {
        info!(
            "collecting every {:?}, publishing to {} at qos {}",
            self.interval, self.topic, self.qos as u8
        );

        let mut ticker = time::interval_at(time::Instant::now() + self.interval, self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            let telemetry = self.collect_once().await;
            let payload = match serde_json::to_vec(&telemetry) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("payload serialization failed, error = {e}");
                    continue;
                }
            };

            let bytes = payload.len();
            match target.publish(&self.topic, self.qos, payload).await {
                Ok(()) => debug!("published {bytes} bytes to {}", self.topic),
                Err(e) => warn!("publish failed, error = {e}"),
            }
        }
    }
}
