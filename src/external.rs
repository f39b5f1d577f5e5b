use std::time::Duration;

use rand::Rng;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet};
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, info, warn};

use crate::MqttSettings;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAXIMUM_BACKOFF: Duration = Duration::from_secs(30);

/// External broker mode: connect out as a plain client and keep the
/// event loop polling. Reconnects use truncated exponential backoff with
/// up to a second of jitter so a fleet of panels doesn't thunder back in
/// lockstep after a broker restart.
pub fn start(config: &MqttSettings) -> (AsyncClient, JoinHandle<()>) {
    let client_id = config
        .client_id
        .clone()
        .unwrap_or_else(|| "naspaneld".to_owned());

    let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
    options.set_keep_alive(Duration::from_secs(config.keep_alive.unwrap_or(60)));
    if let (Some(username), Some(password)) = (&config.username, &config.password) {
        options.set_credentials(username.clone(), password.clone());
    }

    info!(
        "connecting to external broker {}:{}",
        config.host, config.port
    );
    let (client, mut eventloop) = AsyncClient::new(options, 10);

    let handle = tokio::spawn(async move {
        let mut backoff = INITIAL_BACKOFF;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("connected to external broker");
                    backoff = INITIAL_BACKOFF;
                }
                Ok(event) => debug!("external broker event = {event:?}"),
                Err(e) => {
                    let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..1000));
                    let delay = backoff + jitter;
                    warn!("external broker connection error = {e}, retrying in {delay:?}");
                    time::sleep(delay).await;
                    backoff = (backoff * 2).min(MAXIMUM_BACKOFF);
                }
            }
        }
    });

    (client, handle)
}
