use super::*;
use bytes::{Buf, Bytes};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<SubAck, Error> {
    let variable_header_index = fixed_header.fixed_header_len;
    bytes.advance(variable_header_index);

    let pkid = read_u16(&mut bytes)?;

    if !bytes.has_remaining() {
        return Err(Error::MalformedPacket);
    }

    let mut return_codes = Vec::new();
    while bytes.has_remaining() {
        let code = read_u8(&mut bytes)?;
        let code = match code {
            0x80 => SubscribeReasonCode::Failure,
            num => SubscribeReasonCode::Success(qos(num).ok_or(Error::InvalidQoS(num))?),
        };

        return_codes.push(code);
    }

    Ok(SubAck { pkid, return_codes })
}

pub fn write(suback: &SubAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.put_u8(0x90);

    let remaining_len = 2 + suback.return_codes.len();
    let remaining_len_bytes = encode_varint(buffer, remaining_len)?;

    buffer.put_u16(suback.pkid);
    for code in suback.return_codes.iter() {
        let code = match code {
            SubscribeReasonCode::Success(qos) => *qos as u8,
            SubscribeReasonCode::Failure => 0x80,
        };

        buffer.put_u8(code);
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}
