use super::*;
use bytes::{Buf, Bytes};

fn connect_return(num: u8) -> Result<ConnectReturnCode, Error> {
    match num {
        0 => Ok(ConnectReturnCode::Success),
        1 => Ok(ConnectReturnCode::RefusedProtocolVersion),
        2 => Ok(ConnectReturnCode::BadClientId),
        3 => Ok(ConnectReturnCode::ServiceUnavailable),
        4 => Ok(ConnectReturnCode::BadUserNamePassword),
        5 => Ok(ConnectReturnCode::NotAuthorized),
        num => Err(Error::InvalidPacketType(num)),
    }
}

pub fn read(fixed_header: FixedHeader, mut bytes: Bytes) -> Result<ConnAck, Error> {
    let variable_header_index = fixed_header.fixed_header_len;
    bytes.advance(variable_header_index);

    let flags = read_u8(&mut bytes)?;
    if (flags & 0b1111_1110) != 0 {
        return Err(Error::IncorrectPacketFormat);
    }

    let return_code = read_u8(&mut bytes)?;

    Ok(ConnAck {
        session_present: (flags & 0b1) == 1,
        code: connect_return(return_code)?,
    })
}

pub fn write(connack: &ConnAck, buffer: &mut BytesMut) -> Result<usize, Error> {
    let code = match connack.code {
        ConnectReturnCode::Success => 0,
        ConnectReturnCode::RefusedProtocolVersion => 1,
        ConnectReturnCode::BadClientId => 2,
        ConnectReturnCode::ServiceUnavailable => 3,
        ConnectReturnCode::BadUserNamePassword => 4,
        ConnectReturnCode::NotAuthorized => 5,
    };

    buffer.put_u8(0x20);
    buffer.put_u8(0x02);
    buffer.put_u8(connack.session_present as u8);
    buffer.put_u8(code);
    Ok(4)
}
