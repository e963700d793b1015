//! Big-endian packing helpers and the LZ4 block wrappers.

/// Append a `u16` big-endian.
pub fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Append a `u32` big-endian.
pub fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// Read a big-endian `u16` from the start of `data`.
///
/// Callers are expected to have length-checked `data` already.
pub fn read_u16(data: &[u8]) -> u16 {
    u16::from_be_bytes([data[0], data[1]])
}

/// Read a big-endian `u32` from the start of `data`.
pub fn read_u32(data: &[u8]) -> u32 {
    u32::from_be_bytes([data[0], data[1], data[2], data[3]])
}

/// LZ4-compress `data` as a raw block (no length prefix on the wire; the
/// uncompressed length travels in the PDU next to the compressed bytes).
pub fn lz4_compress(data: &[u8]) -> Vec<u8> {
    lz4_flex::block::compress(data)
}

/// Decompress a raw LZ4 block whose uncompressed size is known exactly.
pub fn lz4_decompress(data: &[u8], uncompressed_len: usize) -> Option<Vec<u8>> {
    lz4_flex::block::decompress(data, uncompressed_len).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_roundtrip() {
        let mut buf = Vec::new();
        put_u16(&mut buf, 0xA1B2);
        put_u32(&mut buf, 0x0007_A120);
        assert_eq!(buf, [0xA1, 0xB2, 0x00, 0x07, 0xA1, 0x20]);
        assert_eq!(read_u16(&buf), 0xA1B2);
        assert_eq!(read_u32(&buf[2..]), 500_000);
    }

    #[test]
    fn lz4_roundtrip() {
        for len in [0usize, 1, 7, 64, 4095] {
            let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
            let packed = lz4_compress(&data);
            assert_eq!(lz4_decompress(&packed, len).unwrap(), data);
        }
    }
}
