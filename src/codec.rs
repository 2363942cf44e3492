//! Byte/text conversion for the line-framed serial channel.
//!
//! The wire carries UTF-8 text. Serial reads arrive in arbitrary chunks, so a multi-byte
//! character can be split across two reads; [`decode_partial`] decodes the longest
//! prefix it can and reports how many bytes it consumed, leaving an incomplete trailing
//! sequence for the caller to retry once more bytes arrive.

/// Encode text for transmission.
pub fn encode(text: &str) -> Vec<u8> {
    text.as_bytes().to_vec()
}

/// Decode a complete buffer, replacing invalid sequences with U+FFFD.
pub fn decode(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Decode as much of `bytes` as possible.
///
/// Returns the decoded text and the number of input bytes consumed. Invalid sequences
/// are replaced with U+FFFD and consumed. An incomplete sequence at the very end of the
/// input (at most three bytes) is left unconsumed.
pub fn decode_partial(bytes: &[u8]) -> (String, usize) {
    let mut text = String::with_capacity(bytes.len());
    let mut rest = bytes;

    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                text.push_str(valid);
                return (text, bytes.len());
            }
            Err(err) => {
                let valid_up_to = err.valid_up_to();
                text.push_str(&String::from_utf8_lossy(&rest[..valid_up_to]));

                match err.error_len() {
                    Some(invalid_len) => {
                        text.push(char::REPLACEMENT_CHARACTER);
                        rest = &rest[valid_up_to + invalid_len..];
                    }
                    None => {
                        let unconsumed = rest.len() - valid_up_to;
                        return (text, bytes.len() - unconsumed);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_is_utf8() {
        assert_eq!(encode("%07\n"), b"%07\n".to_vec());
        assert_eq!(encode("µm"), vec![0xC2, 0xB5, b'm']);
    }

    #[test]
    fn decode_replaces_invalid_bytes() {
        assert_eq!(decode(b"12\xFF3"), "12\u{FFFD}3");
    }

    #[test]
    fn decode_partial_holds_back_split_character() {
        // "µ" is C2 B5; only the lead byte has arrived
        let (text, consumed) = decode_partial(&[b'4', b'2', 0xC2]);
        assert_eq!(text, "42");
        assert_eq!(consumed, 2);
    }

    #[test]
    fn decode_partial_consumes_invalid_sequences() {
        let (text, consumed) = decode_partial(&[b'a', 0xFF, b'b', b'\n']);
        assert_eq!(text, "a\u{FFFD}b\n");
        assert_eq!(consumed, 4);
    }

    #[test]
    fn decode_partial_empty_input() {
        let (text, consumed) = decode_partial(&[]);
        assert!(text.is_empty());
        assert_eq!(consumed, 0);
    }
}
