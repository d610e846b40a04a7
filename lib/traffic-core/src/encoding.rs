//! Percent-encoding for endpoint parameters and store node names

use crate::{CoreError, Result};

const HEX: &[u8; 16] = b"0123456789ABCDEF";

fn is_unreserved(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_' | b'.' | b'~' | b'*')
}

/// Percent-encode everything outside the unreserved set
pub fn encode_component(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for &byte in input.as_bytes() {
        if is_unreserved(byte) {
            out.push(byte as char);
        } else {
            out.push('%');
            out.push(HEX[(byte >> 4) as usize] as char);
            out.push(HEX[(byte & 0x0F) as usize] as char);
        }
    }
    out
}

/// Decode a percent-encoded component; `+` is accepted as a space
pub fn decode_component(input: &str) -> Result<String> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                if i + 2 >= bytes.len() {
                    return Err(CoreError::invalid_endpoint(input, "truncated percent escape"));
                }
                let hi = hex_value(bytes[i + 1]);
                let lo = hex_value(bytes[i + 2]);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => out.push((hi << 4) | lo),
                    _ => {
                        return Err(CoreError::invalid_endpoint(input, "malformed percent escape"))
                    }
                }
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8(out).map_err(|_| CoreError::invalid_endpoint(input, "decoded bytes are not UTF-8"))
}

fn hex_value(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_reserved_characters() {
        assert_eq!(encode_component("host = 10.0.0.1 => "), "host%20%3D%2010.0.0.1%20%3D%3E%20");
        assert_eq!(encode_component("a,b*c"), "a%2Cb*c");
    }

    #[test]
    fn test_decode_round_trip() {
        let raw = "tri://10.0.0.1:50051/svc?k=v&x=1";
        assert_eq!(decode_component(&encode_component(raw)).unwrap(), raw);
    }

    #[test]
    fn test_decode_plus_as_space() {
        assert_eq!(decode_component("a+b").unwrap(), "a b");
    }

    #[test]
    fn test_decode_rejects_bad_escape() {
        assert!(decode_component("abc%2").is_err());
        assert!(decode_component("abc%zz").is_err());
    }
}
