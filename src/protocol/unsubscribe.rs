use super::*;
use bytes::{Buf, Bytes};

fn len(unsubscribe: &Unsubscribe) -> usize {
    // len of pkid + vec![unsubscribe topic len]
    2 + unsubscribe.topics.iter().fold(0, |s, t| s + 2 + t.len())
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Unsubscribe, Error> {
    // Bits 3..0 of the unsubscribe fixed header are reserved as 0b0010
    if (fixed_header.byte1 & 0b0000_1111) != 0b0010 {
        return Err(Error::IncorrectPacketFormat);
    }

    let variable_header_index = fixed_header.fixed_header_len;
    bytes.advance(variable_header_index);

    let pkid = read_u16(&mut bytes)?;
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    let mut topics = Vec::new();
    while bytes.has_remaining() {
        topics.push(read_utf8_string(&mut bytes)?);
    }

    match topics.len() {
        0 => Err(Error::EmptySubscription),
        _ => Ok(Unsubscribe { pkid, topics }),
    }
}

pub fn write(unsubscribe: &Unsubscribe, buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.put_u8(0xA2);

    let remaining_len = len(unsubscribe);
    let remaining_len_bytes = encode_varint(buffer, remaining_len)?;

    buffer.put_u16(unsubscribe.pkid);
    for topic in unsubscribe.topics.iter() {
        write_utf8_string(buffer, topic);
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
