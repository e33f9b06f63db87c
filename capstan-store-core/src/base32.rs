//! Nix base32 encoding/decoding.
//!
//! Lowercase, unpadded, least-significant-bits first, and printed in
//! reverse order relative to a conventional base32 stream.

use data_encoding::{BitOrder, DecodePartial, Encoding, Specification};
use std::sync::LazyLock;

/// The 32-character alphabet used by the nix-base32 encoding.
pub const ALPHABET: &str = "0123456789abcdfghijklmnpqrsvwxyz";

static NIX_BASE32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(ALPHABET);
    spec.bit_order = BitOrder::LeastSignificantFirst;
    spec.encoding().unwrap()
});

/// Encoded string length for a decoded byte count.
pub const fn encode_len(len: usize) -> usize {
    (8 * len).div_ceil(5)
}

/// Decoded byte count for an encoded string length.
pub const fn decode_len(len: usize) -> usize {
    5 * len / 8
}

pub fn encode_string(input: &[u8]) -> String {
    let mut output = NIX_BASE32.encode(input).into_bytes();
    output.reverse();
    // The alphabet is ASCII, so reversing bytes keeps the string valid.
    String::from_utf8(output).unwrap()
}

pub fn decode_string(input: &[u8]) -> Result<Vec<u8>, DecodePartial> {
    let olen = decode_len(input.len());
    if encode_len(olen) != input.len() {
        return Err(DecodePartial {
            read: 0,
            written: 0,
            error: data_encoding::DecodeError {
                position: input.len(),
                kind: data_encoding::DecodeKind::Length,
            },
        });
    }
    let mut reversed = input.to_vec();
    reversed.reverse();
    let mut output = vec![0u8; olen];
    NIX_BASE32.decode_mut(&reversed, &mut output)?;
    Ok(output)
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::{prop_assert_eq, proptest};

    proptest! {
        #[test]
        fn roundtrip(data: Vec<u8>) {
            let encoded = encode_string(&data);
            let decoded = decode_string(encoded.as_bytes()).unwrap();
            prop_assert_eq!(data, decoded);
        }
    }
}
