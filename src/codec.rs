use heapless::Vec;

/* Encoding */

pub fn to_hex_digit(value: u32) -> u8 {
    const HEX_LUT: &[u8] = "0123456789ABCDEF".as_bytes();

    HEX_LUT[(value & 0xF) as usize]
}

pub fn push_hex_u8<const N: usize>(out: &mut Vec<u8, N>, value: u8) {
    let _ = out.push(to_hex_digit((value >> 4) as u32));
    let _ = out.push(to_hex_digit(value as u32));
}

pub fn push_hex_u16<const N: usize>(out: &mut Vec<u8, N>, value: u16) {
    push_hex_u8(out, (value >> 8) as u8);
    push_hex_u8(out, value as u8);
}

pub fn push_hex_u32<const N: usize>(out: &mut Vec<u8, N>, value: u32) {
    push_hex_u16(out, (value >> 16) as u16);
    push_hex_u16(out, value as u16);
}

pub fn push_hex_bytes<const N: usize>(out: &mut Vec<u8, N>, data: &[u8]) {
    for byte in data {
        push_hex_u8(out, *byte);
    }
}

/* Decoding */

pub fn hex_digit_to_u8(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Accumulates pre-decoded nibbles, most significant first.
pub fn nibbles_to_u32(nibbles: &[u8]) -> u32 {
    nibbles.iter().fold(0u32, |acc, n| (acc << 4) | *n as u32)
}
