use super::*;
use bytes::{Buf, Bytes};

fn len(subscribe: &Subscribe) -> usize {
    // len of pkid + vec![subscribe filter len]
    2 + subscribe.filters.iter().fold(0, |s, t| s + filter::len(t))
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<Subscribe, Error> {
    // Bits 3..0 of the subscribe fixed header are reserved as 0b0010
    if (fixed_header.byte1 & 0b0000_1111) != 0b0010 {
        return Err(Error::IncorrectPacketFormat);
    }

    let variable_header_index = fixed_header.fixed_header_len;
    bytes.advance(variable_header_index);

    let pkid = read_u16(&mut bytes)?;
    if pkid == 0 {
        return Err(Error::PacketIdZero);
    }

    let filters = filter::read(&mut bytes)?;

    match filters.len() {
        0 => Err(Error::EmptySubscription),
        _ => Ok(Subscribe { pkid, filters }),
    }
}

pub fn write(subscribe: &Subscribe, buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.put_u8(0x82);

    let remaining_len = len(subscribe);
    let remaining_len_bytes = encode_varint(buffer, remaining_len)?;

    buffer.put_u16(subscribe.pkid);
    for f in subscribe.filters.iter() {
        filter::write(f, buffer)?;
    }

    Ok(1 + remaining_len_bytes + remaining_len)
}

mod filter {
    use super::*;

    pub fn len(filter: &SubscribeFilter) -> usize {
        // filter len + filter + requested qos
        2 + filter.path.len() + 1
    }

    pub fn read(bytes: &mut Bytes) -> Result<Vec<SubscribeFilter>, Error> {
        let mut filters = Vec::new();

        while bytes.has_remaining() {
            let path = read_utf8_string(bytes)?;
            let options = read_u8(bytes)?;
            if (options & 0b1111_1100) != 0 {
                return Err(Error::IncorrectPacketFormat);
            }

            // Requested QoS stays raw here. 2 is a legal request in
            // MQTT 3.1.1 even though this broker grants at most 1
            let requested_qos = options & 0b0000_0011;
            if requested_qos > 2 {
                return Err(Error::InvalidQoS(requested_qos));
            }

            filters.push(SubscribeFilter {
                path,
                qos: requested_qos,
            });
        }

        Ok(filters)
    }

    pub fn write(filter: &SubscribeFilter, buffer: &mut BytesMut) -> Result<(), Error> {
        if filter.qos > 2 {
            return Err(Error::InvalidQoS(filter.qos));
        }

        write_utf8_string(buffer, filter.path.as_str());
        buffer.put_u8(filter.qos);
        Ok(())
    }
}
