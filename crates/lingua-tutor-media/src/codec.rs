//! Transport encoding and PCM decoding.
//!
//! The backend moves audio as base64 text. Inbound audio is 16-bit signed
//! little-endian PCM; outbound microphone audio is produced from float frames.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use lingua_tutor_core::error::{Result, TutorError};

/// Encode bytes for transport.
pub fn encode(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode transport text back into bytes.
pub fn decode(text: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(text.trim())
        .map_err(|e| TutorError::Decode(e.to_string()))
}

/// Decoded, playable audio: one float plane per channel, samples in `[-1, 1]`.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    pub sample_rate: u32,
    pub channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Build a mono buffer from float samples.
    pub fn mono(sample_rate: u32, samples: Vec<f32>) -> Self {
        Self {
            sample_rate,
            channels: vec![samples],
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Sample frames per channel.
    pub fn frames(&self) -> usize {
        self.channels.first().map(Vec::len).unwrap_or(0)
    }

    /// Length in seconds.
    pub fn duration(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }

    /// The first channel, which is all there is for the mono streams we handle.
    pub fn mono_samples(&self) -> &[f32] {
        self.channels.first().map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Interpret raw bytes as interleaved PCM16LE and build an [`AudioBuffer`].
pub fn decode_audio_data(bytes: &[u8], sample_rate: u32, channels: usize) -> Result<AudioBuffer> {
    if channels == 0 || sample_rate == 0 {
        return Err(TutorError::AudioDecode(format!(
            "invalid format: {sample_rate} Hz, {channels} channel(s)"
        )));
    }
    let frame_size = 2 * channels;
    if bytes.len() % frame_size != 0 {
        return Err(TutorError::AudioDecode(format!(
            "{} bytes is not a whole number of {frame_size}-byte frames",
            bytes.len()
        )));
    }

    let frames = bytes.len() / frame_size;
    let mut planes = vec![Vec::with_capacity(frames); channels];
    for (i, chunk) in bytes.chunks_exact(2).enumerate() {
        let sample = i16::from_le_bytes([chunk[0], chunk[1]]);
        planes[i % channels].push(sample as f32 / 32768.0);
    }

    Ok(AudioBuffer {
        sample_rate,
        channels: planes,
    })
}

/// Convert float samples to PCM16LE bytes, saturating out-of-range input.
pub fn float_to_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| {
            let scaled = (s * 32768.0).clamp(i16::MIN as f32, i16::MAX as f32);
            (scaled as i16).to_le_bytes()
        })
        .collect()
}

/// MIME type for raw PCM16 at `sample_rate`.
pub fn pcm16_mime(sample_rate: u32) -> String {
    format!("audio/pcm;rate={sample_rate}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_bytes() {
        let bytes = vec![0u8, 1, 2, 250, 255];
        let text = encode(&bytes);
        assert_eq!(text, "AAEC+v8=");
        assert_eq!(decode(&text).unwrap(), bytes);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let err = decode("not*base64!").unwrap_err();
        assert!(matches!(err, TutorError::Decode(_)));
    }

    #[test]
    fn test_decode_audio_normalizes() {
        let bytes: Vec<u8> = [i16::MIN, 0, 16384, i16::MAX]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let buffer = decode_audio_data(&bytes, 24_000, 1).unwrap();
        assert_eq!(buffer.frames(), 4);
        assert_eq!(buffer.mono_samples()[0], -1.0);
        assert_eq!(buffer.mono_samples()[1], 0.0);
        assert_eq!(buffer.mono_samples()[2], 0.5);
        assert!(buffer.mono_samples()[3] < 1.0 && buffer.mono_samples()[3] > 0.999);
    }

    #[test]
    fn test_decode_audio_deinterleaves_stereo() {
        let bytes: Vec<u8> = [100i16, -100, 200, -200]
            .iter()
            .flat_map(|s| s.to_le_bytes())
            .collect();
        let buffer = decode_audio_data(&bytes, 16_000, 2).unwrap();
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.frames(), 2);
        assert!(buffer.channels[0].iter().all(|&s| s > 0.0));
        assert!(buffer.channels[1].iter().all(|&s| s < 0.0));
    }

    #[test]
    fn test_decode_audio_rejects_partial_frame() {
        let err = decode_audio_data(&[0u8; 3], 24_000, 1).unwrap_err();
        assert!(matches!(err, TutorError::AudioDecode(_)));
        let err = decode_audio_data(&[0u8; 6], 24_000, 2).unwrap_err();
        assert!(matches!(err, TutorError::AudioDecode(_)));
    }

    #[test]
    fn test_duration() {
        let buffer = decode_audio_data(&vec![0u8; 48_000], 24_000, 1).unwrap();
        assert!((buffer.duration() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_float_to_pcm16_saturates() {
        let bytes = float_to_pcm16(&[0.0, 0.5, 1.0, -1.0, 2.0]);
        let samples: Vec<i16> = bytes
            .chunks_exact(2)
            .map(|c| i16::from_le_bytes([c[0], c[1]]))
            .collect();
        assert_eq!(samples, vec![0, 16384, i16::MAX, i16::MIN, i16::MAX]);
    }

    #[test]
    fn test_pcm16_mime() {
        assert_eq!(pcm16_mime(16_000), "audio/pcm;rate=16000");
    }
}
