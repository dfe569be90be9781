//! Utility functions for the ble-chat-session crate.

use std::borrow::Cow;

/// Text decoded from a characteristic value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedText {
    /// The decoded text. Invalid sequences are replaced with U+FFFD.
    pub text: String,
    /// Whether any replacement happened.
    pub lossy: bool,
}

/// Decode a characteristic value as UTF-8 text.
///
/// Never fails: malformed input is decoded permissively so a misbehaving
/// peripheral cannot break the session.
///
/// # Example
///
/// ```
/// use ble_chat_session::decode_message;
///
/// let decoded = decode_message(&[0x68, 0x69]);
/// assert_eq!(decoded.text, "hi");
/// assert!(!decoded.lossy);
/// ```
pub fn decode_message(bytes: &[u8]) -> DecodedText {
    match String::from_utf8_lossy(bytes) {
        Cow::Borrowed(text) => DecodedText {
            text: text.to_owned(),
            lossy: false,
        },
        Cow::Owned(text) => DecodedText { text, lossy: true },
    }
}

/// Encode text as a characteristic value: raw UTF-8, no framing.
#[inline]
pub fn encode_message(text: &str) -> bytes::Bytes {
    bytes::Bytes::copy_from_slice(text.as_bytes())
}
