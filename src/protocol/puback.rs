use super::*;
use bytes::{Buf, Bytes};

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<PubAck, Error> {
    if (fixed_header.byte1 & 0b0000_1111) != 0 {
        return Err(Error::IncorrectPacketFormat);
    }

    let variable_header_index = fixed_header.fixed_header_len;
    bytes.advance(variable_header_index);
    let pkid = read_u16(&mut bytes)?;

    if fixed_header.remaining_len != 2 {
        return Err(Error::MalformedPacket);
    }

    Ok(PubAck { pkid })
}

pub fn write(puback: &PubAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.put_u8(0x40);
    buffer.put_u8(0x02);
    buffer.put_u16(puback.pkid);
    Ok(4)
}
