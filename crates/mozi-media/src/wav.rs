//! WAV framing for STT ingestion.
//!
//! Inbound desktop audio arrives as raw little-endian 16-bit PCM chunks.
//! Before handing the utterance to the STT engine it is wrapped in a
//! standard 44-byte RIFF/WAVE header (PCM, 16-bit).

use std::io::Cursor;

use crate::{MediaError, Result};

/// Wrap raw PCM s16le bytes in a WAV container.
///
/// `pcm` must hold complete samples (an even byte count, and a multiple of
/// `channels * 2`).
pub fn pcm_s16le_to_wav(pcm: &[u8], sample_rate: u32, channels: u16) -> Result<Vec<u8>> {
    if channels == 0 {
        return Err(MediaError::Decode("channel count must be non-zero".into()));
    }
    if pcm.is_empty() {
        return Err(MediaError::Decode("empty PCM buffer".into()));
    }
    let block_align = channels as usize * 2;
    if pcm.len() % block_align != 0 {
        return Err(MediaError::Decode(format!(
            "PCM byte length {} is not a multiple of the {}-byte frame",
            pcm.len(),
            block_align
        )));
    }

    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };

    let mut buffer = Cursor::new(Vec::with_capacity(44 + pcm.len()));
    let mut writer = hound::WavWriter::new(&mut buffer, spec)
        .map_err(|e| MediaError::Decode(format!("WAV header: {e}")))?;
    for sample in pcm.chunks_exact(2) {
        writer
            .write_sample(i16::from_le_bytes([sample[0], sample[1]]))
            .map_err(|e| MediaError::Decode(format!("WAV write: {e}")))?;
    }
    writer
        .finalize()
        .map_err(|e| MediaError::Decode(format!("WAV finalize: {e}")))?;

    Ok(buffer.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_is_44_bytes_of_riff_wave() {
        let pcm: Vec<u8> = (0..32u8).collect();
        let wav = pcm_s16le_to_wav(&pcm, 16_000, 1).unwrap();

        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(&wav[8..12], b"WAVE");
        assert_eq!(&wav[12..16], b"fmt ");
        // fmt chunk size 16, PCM format tag 1.
        assert_eq!(u32::from_le_bytes(wav[16..20].try_into().unwrap()), 16);
        assert_eq!(u16::from_le_bytes(wav[20..22].try_into().unwrap()), 1);
        // channels, sample rate, byte rate, block align, bits per sample.
        assert_eq!(u16::from_le_bytes(wav[22..24].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 16_000);
        assert_eq!(u32::from_le_bytes(wav[28..32].try_into().unwrap()), 32_000);
        assert_eq!(u16::from_le_bytes(wav[32..34].try_into().unwrap()), 2);
        assert_eq!(u16::from_le_bytes(wav[34..36].try_into().unwrap()), 16);
        assert_eq!(&wav[36..40], b"data");
        assert_eq!(
            u32::from_le_bytes(wav[40..44].try_into().unwrap()) as usize,
            pcm.len()
        );
        assert_eq!(wav.len(), 44 + pcm.len());
        // riff size = total - 8
        assert_eq!(
            u32::from_le_bytes(wav[4..8].try_into().unwrap()) as usize,
            wav.len() - 8
        );
    }

    #[test]
    fn stereo_byte_rate_and_block_align() {
        let pcm = vec![0u8; 64];
        let wav = pcm_s16le_to_wav(&pcm, 48_000, 2).unwrap();
        assert_eq!(u16::from_le_bytes(wav[22..24].try_into().unwrap()), 2);
        assert_eq!(u32::from_le_bytes(wav[28..32].try_into().unwrap()), 192_000);
        assert_eq!(u16::from_le_bytes(wav[32..34].try_into().unwrap()), 4);
    }

    #[test]
    fn payload_bytes_survive_verbatim() {
        let pcm: Vec<u8> = vec![0x01, 0x02, 0x03, 0x04, 0xff, 0x7f];
        let wav = pcm_s16le_to_wav(&pcm, 8_000, 1).unwrap();
        assert_eq!(&wav[44..], pcm.as_slice());
    }

    #[test]
    fn rejects_empty_and_ragged_buffers() {
        assert!(pcm_s16le_to_wav(&[], 16_000, 1).is_err());
        assert!(pcm_s16le_to_wav(&[1, 2, 3], 16_000, 1).is_err());
        assert!(pcm_s16le_to_wav(&[1, 2], 16_000, 2).is_err());
        assert!(pcm_s16le_to_wav(&[1, 2], 16_000, 0).is_err());
    }
}
