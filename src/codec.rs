//! Wire codecs for the Fluxmon characteristic payloads.
//!
//! Every endpoint on the meter carries one of four fixed formats: a raw
//! UTF-8 string, a `_`-delimited UTF-8 pair, a 4-byte little-endian
//! IEEE-754 float, or a single command byte. The functions here are pure
//! and never touch connection state.

use bytes::Buf;

use crate::error::{Error, Result};

/// Number of bytes a float characteristic must carry at minimum.
pub const FLOAT32_WIRE_LEN: usize = 4;

/// Separator between the lot code and the expiry date in the combined
/// lot characteristic.
pub const LOT_EXPIRY_DELIMITER: char = '_';

/// Value written to a reset endpoint to zero its volume totalizer.
pub const RESET_COMMAND: u8 = 1;

/// Decode a little-endian IEEE-754 single-precision float.
///
/// Reads the low 4 bytes of the payload; any trailing bytes are ignored,
/// since some firmware revisions pad float characteristics.
///
/// # Errors
///
/// Returns [`Error::DecodeTruncated`] if fewer than 4 bytes are present.
///
/// # Example
///
/// ```
/// use fluxmon_ble::codec::decode_float32_le;
///
/// let value = decode_float32_le(&3.75f32.to_le_bytes()).unwrap();
/// assert_eq!(value, 3.75);
/// ```
pub fn decode_float32_le(data: &[u8]) -> Result<f32> {
    if data.len() < FLOAT32_WIRE_LEN {
        return Err(Error::DecodeTruncated {
            expected: FLOAT32_WIRE_LEN,
            actual: data.len(),
        });
    }

    let mut buf = data;
    Ok(buf.get_f32_le())
}

/// Decode a UTF-8 payload split once on the first `_`.
///
/// The lot characteristic packs the lot code and the expiry date into one
/// string (`"B7_2027-05-01"`). A payload without the delimiter yields the
/// whole string as the first component and an empty second component.
///
/// # Example
///
/// ```
/// use fluxmon_ble::codec::decode_delimited_text;
///
/// assert_eq!(
///     decode_delimited_text(b"LOT42_2026-01-01"),
///     ("LOT42".to_string(), "2026-01-01".to_string())
/// );
/// ```
pub fn decode_delimited_text(data: &[u8]) -> (String, String) {
    let text = decode_utf8(data);
    match text.split_once(LOT_EXPIRY_DELIMITER) {
        Some((first, second)) => (first.to_string(), second.to_string()),
        None => (text, String::new()),
    }
}

/// Decode a UTF-8 payload.
///
/// Invalid sequences are replaced with U+FFFD rather than rejected, so the
/// function is total over arbitrary bytes. Peripheral identification fields
/// are display-only; a mangled glyph beats a dropped serial number.
pub fn decode_utf8(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

/// Encode a single-byte command payload for a write endpoint.
///
/// The reset endpoints accept [`RESET_COMMAND`] (`1`) to zero their
/// totalizer.
pub fn encode_command_byte(value: u8) -> [u8; 1] {
    [value]
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    #[test]
    fn test_decode_float32_le_known_value() {
        // 3.75 = 0x40700000 as an IEEE-754 single.
        let data = [0x00, 0x00, 0x70, 0x40];
        assert_eq!(decode_float32_le(&data).unwrap(), 3.75);
        assert_eq!(decode_float32_le(&3.75f32.to_le_bytes()).unwrap(), 3.75);
    }

    #[test]
    fn test_decode_float32_le_ignores_trailing_bytes() {
        let mut data = 12.34f32.to_le_bytes().to_vec();
        data.extend_from_slice(&[0xAA, 0xBB, 0xCC]);
        assert_eq!(decode_float32_le(&data).unwrap(), 12.34);
    }

    #[test]
    fn test_decode_float32_le_truncated() {
        for len in 0..FLOAT32_WIRE_LEN {
            let data = vec![0u8; len];
            match decode_float32_le(&data) {
                Err(Error::DecodeTruncated { expected, actual }) => {
                    assert_eq!(expected, FLOAT32_WIRE_LEN);
                    assert_eq!(actual, len);
                }
                other => panic!("expected truncation error for {} bytes, got {:?}", len, other),
            }
        }
    }

    #[test]
    fn test_decode_delimited_text_with_delimiter() {
        assert_eq!(
            decode_delimited_text(b"LOT42_2026-01-01"),
            ("LOT42".to_string(), "2026-01-01".to_string())
        );
    }

    #[test]
    fn test_decode_delimited_text_without_delimiter() {
        assert_eq!(
            decode_delimited_text(b"NODELIM"),
            ("NODELIM".to_string(), String::new())
        );
    }

    #[test]
    fn test_decode_delimited_text_splits_on_first_delimiter_only() {
        assert_eq!(
            decode_delimited_text(b"B7_2027-05-01_extra"),
            ("B7".to_string(), "2027-05-01_extra".to_string())
        );
    }

    #[test]
    fn test_decode_delimited_text_empty() {
        assert_eq!(decode_delimited_text(b""), (String::new(), String::new()));
    }

    #[test]
    fn test_decode_utf8_replaces_invalid_sequences() {
        let decoded = decode_utf8(&[b'S', b'N', 0xFF, b'1']);
        assert_eq!(decoded, "SN\u{FFFD}1");
    }

    #[test]
    fn test_encode_command_byte() {
        assert_eq!(encode_command_byte(RESET_COMMAND), [1]);
        assert_eq!(encode_command_byte(0), [0]);
        assert_eq!(encode_command_byte(0xFF), [0xFF]);
    }

    proptest! {
        #[test]
        fn prop_float_decode_is_bit_exact(value in any::<f32>()) {
            let decoded = decode_float32_le(&value.to_le_bytes()).unwrap();
            // Bit comparison: NaN payloads must survive untouched too.
            prop_assert_eq!(decoded.to_bits(), value.to_bits());
        }

        #[test]
        fn prop_float_decode_ignores_suffix(value in any::<f32>(), suffix in proptest::collection::vec(any::<u8>(), 0..16)) {
            let mut data = value.to_le_bytes().to_vec();
            data.extend_from_slice(&suffix);
            let decoded = decode_float32_le(&data).unwrap();
            prop_assert_eq!(decoded.to_bits(), value.to_bits());
        }

        #[test]
        fn prop_short_payloads_are_truncation_errors(data in proptest::collection::vec(any::<u8>(), 0..FLOAT32_WIRE_LEN)) {
            let is_truncation_error = matches!(
                decode_float32_le(&data),
                Err(Error::DecodeTruncated { .. })
            );
            prop_assert!(is_truncation_error);
        }

        #[test]
        fn prop_delimited_text_reassembles(first in "[A-Za-z0-9-]{0,12}", second in "[A-Za-z0-9-]{0,12}") {
            let wire = format!("{}_{}", first, second);
            let (lot, expiry) = decode_delimited_text(wire.as_bytes());
            prop_assert_eq!(lot, first);
            prop_assert_eq!(expiry, second);
        }
    }
}
