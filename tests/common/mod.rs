#![allow(dead_code)]

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use naspaneld::protocol::{
    self, ConnAck, Connect, Login, Packet, Publish, QoS, Subscribe, SubscribeFilter,
    SubscribeReasonCode,
};
use naspaneld::{Broker, Config};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(port: u16) -> Config {
    let mut config = Config::default();
    config.mqtt.host = "127.0.0.1".to_owned();
    config.mqtt.port = port;
    config
}

pub async fn start_broker(port: u16) -> Broker {
    start_broker_with(test_config(port)).await
}

pub async fn start_broker_with(config: Config) -> Broker {
    let mut broker = Broker::new(config);
    broker.start().await.expect("broker should bind");
    broker
}

/// Raw MQTT client over the crate's own codec, just enough to drive the
/// broker through the protocol scenarios
pub struct TestClient {
    stream: TcpStream,
    read: BytesMut,
}

impl TestClient {
    /// TCP connection without the MQTT handshake
    pub async fn connect_socket(port: u16) -> TestClient {
        for _ in 0..50 {
            match TcpStream::connect(("127.0.0.1", port)).await {
                Ok(stream) => {
                    return TestClient {
                        stream,
                        read: BytesMut::new(),
                    }
                }
                Err(_) => time::sleep(Duration::from_millis(20)).await,
            }
        }

        panic!("unable to connect to broker on port {port}");
    }

    /// Connected and CONNACKed client with sane defaults
    pub async fn connect(port: u16, client_id: &str) -> TestClient {
        let mut client = TestClient::connect_socket(port).await;
        let ack = client.handshake(client_id, true, 60, None).await;
        assert!(!ack.session_present);
        assert_eq!(ack.code, protocol::ConnectReturnCode::Success);
        client
    }

    pub async fn handshake(
        &mut self,
        client_id: &str,
        clean_session: bool,
        keep_alive: u16,
        login: Option<Login>,
    ) -> ConnAck {
        self.send(Packet::Connect(
            Connect {
                protocol_level: 4,
                keep_alive,
                client_id: client_id.to_owned(),
                clean_session,
            },
            None,
            login,
        ))
        .await;

        match self.recv().await {
            Packet::ConnAck(ack) => ack,
            packet => panic!("expected connack, got {packet:?}"),
        }
    }

    pub async fn send(&mut self, packet: Packet) {
        let mut buffer = BytesMut::new();
        protocol::write(&packet, &mut buffer).expect("packet should encode");
        self.stream
            .write_all(&buffer)
            .await
            .expect("write should succeed");
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream
            .write_all(bytes)
            .await
            .expect("write should succeed");
    }

    pub async fn recv(&mut self) -> Packet {
        time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for a packet")
            .expect("connection closed while waiting for a packet")
    }

    /// None once the server closes the connection
    pub async fn recv_or_eof(&mut self) -> Option<Packet> {
        time::timeout(RECV_TIMEOUT, self.recv_inner())
            .await
            .expect("timed out waiting for packet or eof")
    }

    async fn recv_inner(&mut self) -> Option<Packet> {
        loop {
            match protocol::read(&mut self.read, 1024 * 1024) {
                Ok(packet) => return Some(packet),
                Err(protocol::Error::InsufficientBytes(_)) => {
                    let n = self
                        .stream
                        .read_buf(&mut self.read)
                        .await
                        .expect("read should succeed");
                    if n == 0 {
                        return None;
                    }
                }
                Err(e) => panic!("protocol error = {e:?}"),
            }
        }
    }

    /// Asserts nothing arrives within the window
    pub async fn expect_silence(&mut self, window: Duration) {
        match time::timeout(window, self.recv_inner()).await {
            Err(_) => (),
            Ok(packet) => panic!("expected silence, got {packet:?}"),
        }
    }

    pub async fn subscribe(
        &mut self,
        pkid: u16,
        filter: &str,
        qos: u8,
    ) -> Vec<SubscribeReasonCode> {
        self.send(Packet::Subscribe(Subscribe {
            pkid,
            filters: vec![SubscribeFilter {
                path: filter.to_owned(),
                qos,
            }],
        }))
        .await;

        match self.recv().await {
            Packet::SubAck(suback) => {
                assert_eq!(suback.pkid, pkid);
                suback.return_codes
            }
            packet => panic!("expected suback, got {packet:?}"),
        }
    }

    /// Publishes and, at QoS 1, waits out the broker's PUBACK
    pub async fn publish(&mut self, topic: &str, qos: QoS, retain: bool, pkid: u16, payload: &[u8]) {
        self.send(Packet::Publish(Publish {
            dup: false,
            qos,
            pkid,
            retain,
            topic: topic.to_owned(),
            payload: Bytes::copy_from_slice(payload),
        }))
        .await;

        if qos == QoS::AtLeastOnce {
            match self.recv().await {
                Packet::PubAck(ack) => assert_eq!(ack.pkid, pkid),
                packet => panic!("expected puback, got {packet:?}"),
            }
        }
    }

    /// Next inbound application message
    pub async fn recv_publish(&mut self) -> Publish {
        match self.recv().await {
            Packet::Publish(publish) => publish,
            packet => panic!("expected publish, got {packet:?}"),
        }
    }
}
