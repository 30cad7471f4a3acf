//! TTS egress chunking.
//!
//! Synthesized audio streams to the widget as base64 text frames. Each
//! frame's payload stays under 32 KiB; raw chunks are cut at a multiple of
//! three bytes so every frame decodes independently (no mid-frame padding).

use base64::Engine;

/// Maximum base64 payload length per audio frame.
pub const MAX_B64_PAYLOAD: usize = 32 * 1024;

/// Raw bytes per chunk: encodes to exactly `MAX_B64_PAYLOAD` characters.
const RAW_CHUNK: usize = MAX_B64_PAYLOAD / 4 * 3;

/// Split `bytes` into base64 payloads of at most [`MAX_B64_PAYLOAD`] chars.
///
/// Always yields at least one frame (empty input produces one empty
/// payload so the receiver still gets an `isLast` marker).
pub fn chunk_base64(bytes: &[u8]) -> Vec<String> {
    let engine = &base64::engine::general_purpose::STANDARD;
    if bytes.is_empty() {
        return vec![String::new()];
    }
    bytes.chunks(RAW_CHUNK).map(|c| engine.encode(c)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;

    #[test]
    fn payloads_stay_under_limit_and_reassemble() {
        let bytes: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
        let frames = chunk_base64(&bytes);
        assert!(frames.len() > 1);

        let mut reassembled = Vec::new();
        for frame in &frames {
            assert!(frame.len() <= MAX_B64_PAYLOAD, "frame too large: {}", frame.len());
            reassembled.extend(
                base64::engine::general_purpose::STANDARD
                    .decode(frame)
                    .unwrap(),
            );
        }
        assert_eq!(reassembled, bytes);
    }

    #[test]
    fn small_input_is_one_frame() {
        assert_eq!(chunk_base64(&[1, 2, 3]).len(), 1);
    }

    #[test]
    fn empty_input_still_yields_a_frame() {
        let frames = chunk_base64(&[]);
        assert_eq!(frames, vec![String::new()]);
    }
}
