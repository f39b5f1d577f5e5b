use bytes::{BufMut, Bytes, BytesMut};

pub mod topic;

mod connack;
mod connect;
mod disconnect;
mod ping;
mod puback;
mod publish;
mod suback;
mod subscribe;
mod unsuback;
mod unsubscribe;

/// MQTT 3.1.1 control packets supported by the broker. A decoded packet
/// carries structural validity only; sequencing rules (CONNECT first,
/// nothing after DISCONNECT) are the session's concern.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Packet {
    Connect(Connect, Option<LastWill>, Option<Login>),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    PingReq,
    PingResp,
    Disconnect,
}

/// Quality of service. QoS 2 is not supported by this broker; the wire
/// value 2 is rejected during decode.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum QoS {
    #[default]
    AtMostOnce = 0,
    AtLeastOnce = 1,
}

/// Maps a number to QoS
pub fn qos(num: u8) -> Option<QoS> {
    match num {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        _ => None,
    }
}

/// Connection packet initiated by the client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connect {
    /// Protocol level from the variable header. 4 is MQTT 3.1.1; the
    /// session answers anything else with CONNACK code 1.
    pub protocol_level: u8,
    /// Mqtt keep alive interval in seconds
    pub keep_alive: u16,
    /// Client Id
    pub client_id: String,
    /// Clean session. Asks the broker to clear previous state
    pub clean_session: bool,
}

/// Will message carried by CONNECT. Parsed for framing correctness and
/// otherwise ignored; this broker does not deliver Will messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: Bytes,
    pub message: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Login {
    pub username: String,
    pub password: String,
}

/// Return code in connack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReturnCode {
    Success,
    RefusedProtocolVersion,
    BadClientId,
    ServiceUnavailable,
    BadUserNamePassword,
    NotAuthorized,
}

/// Acknowledgement to connect packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnAck {
    pub session_present: bool,
    pub code: ConnectReturnCode,
}

/// Publish packet
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    pub dup: bool,
    pub qos: QoS,
    pub pkid: u16,
    pub retain: bool,
    pub topic: String,
    pub payload: Bytes,
}

impl Publish {
    pub fn new<T: Into<String>, P: Into<Bytes>>(topic: T, qos: QoS, payload: P) -> Publish {
        Publish {
            dup: false,
            qos,
            pkid: 0,
            retain: false,
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Acknowledgement to QoS 1 publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PubAck {
    pub pkid: u16,
}

/// Subscription packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscribe {
    pub pkid: u16,
    pub filters: Vec<SubscribeFilter>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeFilter {
    pub path: String,
    /// Requested maximum QoS, 0..=2 on the wire. The router grants at
    /// most QoS 1.
    pub qos: u8,
}

/// Acknowledgement to subscribe
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub pkid: u16,
    pub return_codes: Vec<SubscribeReasonCode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReasonCode {
    Success(QoS),
    Failure,
}

/// Unsubscribe packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unsubscribe {
    pub pkid: u16,
    pub topics: Vec<String>,
}

/// Acknowledgement to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnsubAck {
    pub pkid: u16,
}

/// Errors during serialization and deserialization
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("Invalid protocol name")]
    InvalidProtocol,
    #[error("Invalid packet type = {0}")]
    InvalidPacketType(u8),
    #[error("Invalid QoS = {0}")]
    InvalidQoS(u8),
    #[error("Packet id can't be 0 at QoS > 0")]
    PacketIdZero,
    #[error("Payload size limit exceeded = {0}")]
    PayloadSizeLimitExceeded(usize),
    #[error("Payload too long")]
    PayloadTooLong,
    #[error("Payload required")]
    PayloadRequired,
    #[error("Topic not utf-8")]
    TopicNotUtf8,
    #[error("Malformed packet")]
    MalformedPacket,
    #[error("Malformed remaining length")]
    MalformedRemainingLength,
    #[error("Promised boundary crossed = {0}")]
    BoundaryCrossed(usize),
    #[error("Incorrect packet format")]
    IncorrectPacketFormat,
    #[error("At least {0} more bytes required to frame packet")]
    InsufficientBytes(usize),
    #[error("Empty subscription")]
    EmptySubscription,
}

/// MQTT packet type
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Connect = 1,
    ConnAck,
    Publish,
    PubAck,
    PubRec,
    PubRel,
    PubComp,
    Subscribe,
    SubAck,
    Unsubscribe,
    UnsubAck,
    PingReq,
    PingResp,
    Disconnect,
}

/// Packet type and remaining length from the first bytes of the stream
///
/// ```ignore
///          7                          3                          0
///          +--------------------------+--------------------------+
/// byte 1   | MQTT Control Packet Type | Flags for each type      |
///          +--------------------------+--------------------------+
///          |         Remaining Bytes Len  (1/2/3/4 bytes)        |
///          +-----------------------------------------------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedHeader {
    /// First byte of the stream. Used to identify packet types and
    /// several flags
    pub byte1: u8,
    /// Byte 1 + (1..4) variable length encoded remaining length bytes
    pub fixed_header_len: usize,
    /// Remaining length of the packet. Doesn't include fixed header bytes
    pub remaining_len: usize,
}

impl FixedHeader {
    pub fn new(byte1: u8, remaining_len_len: usize, remaining_len: usize) -> FixedHeader {
        FixedHeader {
            byte1,
            fixed_header_len: remaining_len_len + 1,
            remaining_len,
        }
    }

    pub fn packet_type(&self) -> Result<PacketType, Error> {
        let num = self.byte1 >> 4;
        match num {
            1 => Ok(PacketType::Connect),
            2 => Ok(PacketType::ConnAck),
            3 => Ok(PacketType::Publish),
            4 => Ok(PacketType::PubAck),
            5 => Ok(PacketType::PubRec),
            6 => Ok(PacketType::PubRel),
            7 => Ok(PacketType::PubComp),
            8 => Ok(PacketType::Subscribe),
            9 => Ok(PacketType::SubAck),
            10 => Ok(PacketType::Unsubscribe),
            11 => Ok(PacketType::UnsubAck),
            12 => Ok(PacketType::PingReq),
            13 => Ok(PacketType::PingResp),
            14 => Ok(PacketType::Disconnect),
            _ => Err(Error::InvalidPacketType(num)),
        }
    }

    /// Returns the size of the full packet (fixed header + variable
    /// header + payload). Fixed header is enough to get the size of a
    /// frame in the stream
    pub fn frame_length(&self) -> usize {
        self.fixed_header_len + self.remaining_len
    }
}

/// Largest value a four byte variable length integer can carry
const VARINT_MAX: usize = 268_435_455;

/// A decoded variable byte integer together with the number of bytes it
/// occupied on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct VarInt {
    value: usize,
    size: usize,
}

/// Decodes the variable byte integer at the start of `bytes`: seven
/// payload bits per byte, least significant group first, high bit flags
/// a continuation. The encoding is capped at four bytes.
fn decode_varint(bytes: &[u8]) -> Result<VarInt, Error> {
    let mut value = 0;
    for (i, &byte) in bytes.iter().take(4).enumerate() {
        value |= usize::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(VarInt { value, size: i + 1 });
        }
    }

    // four continuation bytes exhaust the encoding; fewer only means
    // the rest of it hasn't arrived yet
    match bytes.len() {
        0..=3 => Err(Error::InsufficientBytes(1)),
        _ => Err(Error::MalformedRemainingLength),
    }
}

/// Appends `value` as a variable byte integer and returns the number of
/// bytes written
fn encode_varint(buffer: &mut BytesMut, mut value: usize) -> Result<usize, Error> {
    if value > VARINT_MAX {
        return Err(Error::PayloadTooLong);
    }

    let mut size = 0;
    loop {
        size += 1;
        let septet = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buffer.put_u8(septet);
            return Ok(size);
        }

        buffer.put_u8(septet | 0x80);
    }
}

/// Inspects the start of the read buffer and decides whether one whole
/// frame is buffered, without consuming anything.
/// `Err(InsufficientBytes)` reports how much more the caller has to
/// fetch before asking again.
fn peek_frame(buffer: &[u8], max_packet_size: usize) -> Result<FixedHeader, Error> {
    let Some((&byte1, rest)) = buffer.split_first() else {
        return Err(Error::InsufficientBytes(2));
    };

    let remaining = decode_varint(rest)?;
    let header = FixedHeader::new(byte1, remaining.size, remaining.value);

    // reject huge length claims before any buffering happens, rogue
    // clients don't get to balloon the read buffer
    if header.remaining_len > max_packet_size {
        return Err(Error::PayloadSizeLimitExceeded(header.remaining_len));
    }

    match header.frame_length().saturating_sub(buffer.len()) {
        0 => Ok(header),
        missing => Err(Error::InsufficientBytes(missing)),
    }
}

/// Splits `count` bytes off the stream after checking they are actually
/// there. The variable header parsers lean on this so a lying remaining
/// length can't make the `bytes` crate panic.
fn take(stream: &mut Bytes, count: usize) -> Result<Bytes, Error> {
    match stream.len() < count {
        true => Err(Error::MalformedPacket),
        false => Ok(stream.split_to(count)),
    }
}

fn read_u16(stream: &mut Bytes) -> Result<u16, Error> {
    let bytes = take(stream, 2)?;
    Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
}

fn read_u8(stream: &mut Bytes) -> Result<u8, Error> {
    Ok(take(stream, 1)?[0])
}

/// Length prefixed bytes, big endian u16 prefix. The prefix is trusted
/// only as far as the frame actually reaches; one pointing past it
/// would let a bad remaining length walk into the next packet.
fn read_length_prefixed(stream: &mut Bytes) -> Result<Bytes, Error> {
    let count = read_u16(stream)? as usize;
    match count > stream.len() {
        true => Err(Error::BoundaryCrossed(count)),
        false => Ok(stream.split_to(count)),
    }
}

/// Length prefixed utf-8 string
fn read_utf8_string(stream: &mut Bytes) -> Result<String, Error> {
    let bytes = read_length_prefixed(stream)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::TopicNotUtf8)
}

fn write_length_prefixed(buffer: &mut BytesMut, bytes: &[u8]) {
    buffer.put_u16(bytes.len() as u16);
    buffer.put_slice(bytes);
}

fn write_utf8_string(buffer: &mut BytesMut, string: &str) {
    write_length_prefixed(buffer, string.as_bytes());
}

/// Reads a stream of bytes and extracts the next MQTT packet out of it.
/// Returns `Error::InsufficientBytes` when the stream doesn't hold a full
/// frame yet
pub fn read(stream: &mut BytesMut, max_size: usize) -> Result<Packet, Error> {
    let fixed_header = peek_frame(&stream[..], max_size)?;

    let packet = stream.split_to(fixed_header.frame_length());
    let packet_type = fixed_header.packet_type()?;

    if fixed_header.remaining_len == 0 {
        // no payload packets
        return match packet_type {
            PacketType::PingReq => expect_flags(fixed_header, 0b0000, Packet::PingReq),
            PacketType::PingResp => expect_flags(fixed_header, 0b0000, Packet::PingResp),
            PacketType::Disconnect => expect_flags(fixed_header, 0b0000, Packet::Disconnect),
            _ => Err(Error::PayloadRequired),
        };
    }

    let packet = packet.freeze();
    let packet = match packet_type {
        PacketType::Connect => {
            let (connect, login, lastwill) = connect::read(fixed_header, packet)?;
            Packet::Connect(connect, lastwill, login)
        }
        PacketType::ConnAck => Packet::ConnAck(connack::read(fixed_header, packet)?),
        PacketType::Publish => Packet::Publish(publish::read(fixed_header, packet)?),
        PacketType::PubAck => Packet::PubAck(puback::read(fixed_header, packet)?),
        PacketType::Subscribe => Packet::Subscribe(subscribe::read(fixed_header, packet)?),
        PacketType::SubAck => Packet::SubAck(suback::read(fixed_header, packet)?),
        PacketType::Unsubscribe => Packet::Unsubscribe(unsubscribe::read(fixed_header, packet)?),
        PacketType::UnsubAck => Packet::UnsubAck(unsuback::read(fixed_header, packet)?),
        // these carry no payload in 3.1.1, handled in the zero length
        // branch above
        PacketType::PingReq | PacketType::PingResp | PacketType::Disconnect => {
            return Err(Error::MalformedPacket)
        }
        // QoS 2 is out of scope for this broker
        PacketType::PubRec | PacketType::PubRel | PacketType::PubComp => {
            return Err(Error::InvalidPacketType(fixed_header.byte1 >> 4))
        }
    };

    Ok(packet)
}

fn expect_flags(fixed_header: FixedHeader, flags: u8, packet: Packet) -> Result<Packet, Error> {
    match fixed_header.byte1 & 0b0000_1111 {
        f if f == flags => Ok(packet),
        _ => Err(Error::IncorrectPacketFormat),
    }
}

/// Serializes a packet into the provided buffer and returns the number of
/// bytes written
pub fn write(packet: &Packet, buffer: &mut BytesMut) -> Result<usize, Error> {
    let size = match packet {
        Packet::Connect(connect, last_will, login) => {
            connect::write(connect, login, last_will, buffer)?
        }
        Packet::ConnAck(connack) => connack::write(connack, buffer)?,
        Packet::Publish(publish) => publish::write(publish, buffer)?,
        Packet::PubAck(puback) => puback::write(puback, buffer)?,
        Packet::Subscribe(subscribe) => subscribe::write(subscribe, buffer)?,
        Packet::SubAck(suback) => suback::write(suback, buffer)?,
        Packet::Unsubscribe(unsubscribe) => unsubscribe::write(unsubscribe, buffer)?,
        Packet::UnsubAck(unsuback) => unsuback::write(unsuback, buffer)?,
        Packet::PingReq => ping::pingreq::write(buffer)?,
        Packet::PingResp => ping::pingresp::write(buffer)?,
        Packet::Disconnect => disconnect::write(buffer)?,
    };

    Ok(size)
}

#[cfg(test)]
mod test {
    use super::*;

    fn codec_roundtrip(value: usize, expected_size: usize) {
        let mut stream = BytesMut::new();
        let size = encode_varint(&mut stream, value).unwrap();
        assert_eq!(size, expected_size);

        let varint = decode_varint(&stream).unwrap();
        assert_eq!(varint.size, size);
        assert_eq!(varint.value, value);
    }

    #[test]
    fn remaining_length_boundaries_roundtrip() {
        codec_roundtrip(0, 1);
        codec_roundtrip(127, 1);
        codec_roundtrip(128, 2);
        codec_roundtrip(16383, 2);
        codec_roundtrip(16384, 3);
        codec_roundtrip(2097151, 3);
        codec_roundtrip(2097152, 4);
        codec_roundtrip(268435455, 4);
    }

    #[test]
    fn remaining_length_above_max_is_rejected() {
        let mut stream = BytesMut::new();
        assert!(matches!(
            encode_varint(&mut stream, 268435456),
            Err(Error::PayloadTooLong)
        ));
    }

    #[test]
    fn fifth_continuation_byte_is_rejected() {
        assert!(matches!(
            decode_varint(&[0xFF, 0xFF, 0xFF, 0xFF, 0x01]),
            Err(Error::MalformedRemainingLength)
        ));

        // the fourth byte alone asking for a fifth is already malformed
        assert!(matches!(
            decode_varint(&[0x80, 0x80, 0x80, 0x80]),
            Err(Error::MalformedRemainingLength)
        ));
    }

    #[test]
    fn incomplete_remaining_length_asks_for_more() {
        assert!(matches!(
            decode_varint(&[0xFF, 0xFF]),
            Err(Error::InsufficientBytes(1))
        ));
    }

    #[test]
    fn partial_frame_reports_missing_bytes() {
        // publish header promising 10 remaining bytes, only 4 present
        let mut stream = BytesMut::from(&[0x30, 0x0A, 0x00, 0x03, b'a', b'b'][..]);
        match read(&mut stream, 1024) {
            Err(Error::InsufficientBytes(n)) => assert_eq!(n, 6),
            v => panic!("unexpected {v:?}"),
        }
    }

    #[test]
    fn oversized_frame_is_rejected_before_buffering() {
        let mut stream = BytesMut::from(&[0x30, 0xFF, 0x7F][..]);
        assert!(matches!(
            read(&mut stream, 1024),
            Err(Error::PayloadSizeLimitExceeded(16383))
        ));
    }

    #[test]
    fn packets_roundtrip_through_the_codec() {
        let packets = [
            Packet::Connect(
                Connect {
                    protocol_level: 4,
                    keep_alive: 60,
                    client_id: "c1".into(),
                    clean_session: true,
                },
                None,
                Some(Login {
                    username: "panel".into(),
                    password: "secret".into(),
                }),
            ),
            Packet::ConnAck(ConnAck {
                session_present: false,
                code: ConnectReturnCode::Success,
            }),
            Packet::Publish(Publish {
                dup: false,
                qos: QoS::AtLeastOnce,
                pkid: 7,
                retain: true,
                topic: "nas/panel/data".into(),
                payload: Bytes::from_static(b"{\"cpu\":1}"),
            }),
            Packet::PubAck(PubAck { pkid: 7 }),
            Packet::Subscribe(Subscribe {
                pkid: 1,
                filters: vec![
                    SubscribeFilter {
                        path: "sensors/+/temp".into(),
                        qos: 1,
                    },
                    SubscribeFilter {
                        path: "nas/#".into(),
                        qos: 0,
                    },
                ],
            }),
            Packet::SubAck(SubAck {
                pkid: 1,
                return_codes: vec![
                    SubscribeReasonCode::Success(QoS::AtLeastOnce),
                    SubscribeReasonCode::Failure,
                ],
            }),
            Packet::Unsubscribe(Unsubscribe {
                pkid: 2,
                topics: vec!["sensors/+/temp".into()],
            }),
            Packet::UnsubAck(UnsubAck { pkid: 2 }),
            Packet::PingReq,
            Packet::PingResp,
            Packet::Disconnect,
        ];

        let mut stream = BytesMut::new();
        for packet in &packets {
            write(packet, &mut stream).unwrap();
        }

        for expected in &packets {
            let decoded = read(&mut stream, 1024 * 1024).unwrap();
            assert_eq!(&decoded, expected);
        }
        assert!(stream.is_empty());
    }
}
