use super::*;

pub fn write(buffer: &mut BytesMut) -> Result<usize, Error> {
    buffer.extend_from_slice(&[0xE0, 0x00]);
    Ok(2)
}
