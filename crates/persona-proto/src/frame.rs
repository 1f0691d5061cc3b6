//! Binary screencast frame codec.
//!
//! A data frame is `[36-byte ASCII session id, NUL-padded][image bytes]`.
//! The image payload is an already-encoded still image and is forwarded to
//! handlers untouched; only the prefix is interpreted here.

use bytes::Bytes;

/// Fixed length of the session-id prefix on every binary frame.
pub const SESSION_ID_LEN: usize = 36;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too short: {0} bytes (need more than {SESSION_ID_LEN})")]
    Truncated(usize),
    #[error("session id prefix is not ASCII")]
    NonAsciiSessionId,
}

/// One demultiplexed screencast frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionFrame {
    pub session_id: String,
    pub payload: Bytes,
}

/// Decode a raw binary frame into its session id and image payload.
///
/// The id is read up to the first NUL byte or byte 36, whichever comes
/// first. Frames no longer than the prefix carry no image and are rejected.
pub fn decode_session_frame(bytes: &[u8]) -> Result<SessionFrame, FrameError> {
    if bytes.len() <= SESSION_ID_LEN {
        return Err(FrameError::Truncated(bytes.len()));
    }
    let prefix = &bytes[..SESSION_ID_LEN];
    let id_end = prefix.iter().position(|&b| b == 0).unwrap_or(SESSION_ID_LEN);
    let id_bytes = &prefix[..id_end];
    if !id_bytes.is_ascii() {
        return Err(FrameError::NonAsciiSessionId);
    }
    let session_id = std::str::from_utf8(id_bytes)
        .map_err(|_| FrameError::NonAsciiSessionId)?
        .to_owned();
    Ok(SessionFrame {
        session_id,
        payload: Bytes::copy_from_slice(&bytes[SESSION_ID_LEN..]),
    })
}

/// Encode a frame back to the wire shape. Ids longer than 36 bytes are
/// rejected by debug assertion; the orchestrator never issues them.
pub fn encode_session_frame(session_id: &str, payload: &[u8]) -> Vec<u8> {
    debug_assert!(session_id.len() <= SESSION_ID_LEN);
    let mut buf = Vec::with_capacity(SESSION_ID_LEN + payload.len());
    buf.extend_from_slice(session_id.as_bytes());
    buf.resize(SESSION_ID_LEN, 0);
    buf.extend_from_slice(payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_padded_prefix_and_payload() {
        let encoded = encode_session_frame("p1", b"imagebytes");
        assert_eq!(encoded.len(), SESSION_ID_LEN + 10);
        let frame = decode_session_frame(&encoded).unwrap();
        assert_eq!(frame.session_id, "p1");
        assert_eq!(&frame.payload[..], b"imagebytes");
    }

    #[test]
    fn full_width_id_with_empty_payload_is_rejected_only_at_prefix_length() {
        // 72 'a' bytes: a 36-char id followed by 36 payload bytes of 'a'.
        let bytes = vec![b'a'; 72];
        let frame = decode_session_frame(&bytes).unwrap();
        assert_eq!(frame.session_id.len(), SESSION_ID_LEN);
        assert_eq!(frame.session_id, "a".repeat(36));
        assert_eq!(frame.payload.len(), 36);

        // Exactly the prefix (or less) carries no image and is malformed.
        assert_eq!(
            decode_session_frame(&vec![b'a'; 36]),
            Err(FrameError::Truncated(36))
        );
        assert_eq!(
            decode_session_frame(&[0u8; 10]),
            Err(FrameError::Truncated(10))
        );
    }

    #[test]
    fn id_stops_at_first_nul() {
        let mut bytes = encode_session_frame("abc", b"x");
        // Garbage after the NUL terminator must not leak into the id.
        bytes[10] = b'z';
        let frame = decode_session_frame(&bytes).unwrap();
        assert_eq!(frame.session_id, "abc");
    }
}
