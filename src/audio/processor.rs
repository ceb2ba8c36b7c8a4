//! # Audio Conversion
//!
//! Conversions applied to the raw audio a client streams during a call.
//!
//! ## Key Functions:
//! - **bytes_from_values**: `audio_chunk` payloads arrive as JSON number arrays
//! - **duration_seconds**: How much speech a buffer holds
//! - **pcm_to_wav**: Wrap raw PCM in a WAV container for backends that need one

use crate::config::AudioConfig;
use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Cursor;

/// Convert the numeric array of an `audio_chunk` into bytes.
///
/// Clients send either unsigned (0..=255) or signed (-128..=127) byte values;
/// both are accepted and wrapped to a byte. Anything else means the payload
/// isn't audio bytes at all.
///
/// ## Returns:
/// - **Ok(Vec<u8>)**: One byte per value
/// - **Err(String)**: Index and value of the first out-of-range entry
pub fn bytes_from_values(values: &[i64]) -> Result<Vec<u8>, String> {
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            if (-128..=255).contains(&value) {
                Ok(value as u8)
            } else {
                Err(format!("audio_data[{}] = {} is not a byte value", index, value))
            }
        })
        .collect()
}

/// Seconds of audio held in `byte_len` bytes of PCM.
pub fn duration_seconds(byte_len: usize, format: &AudioConfig) -> f32 {
    let bytes_per_second =
        format.sample_rate as usize * usize::from(format.channels) * usize::from(format.bit_depth / 8);
    if bytes_per_second == 0 {
        return 0.0;
    }
    byte_len as f32 / bytes_per_second as f32
}

/// Wrap 16-bit little-endian PCM in a WAV container.
///
/// A trailing odd byte (half a sample) is dropped.
pub fn pcm_to_wav(pcm: &[u8], format: &AudioConfig) -> std::io::Result<Vec<u8>> {
    let mut cursor = Cursor::new(pcm);
    let mut samples = Vec::with_capacity(pcm.len() / 2);
    while let Ok(sample) = cursor.read_i16::<LittleEndian>() {
        samples.push(sample);
    }

    let header = wav::Header::new(
        wav::header::WAV_FORMAT_PCM,
        format.channels,
        format.sample_rate,
        format.bit_depth,
    );
    let mut out = Cursor::new(Vec::with_capacity(pcm.len() + 44));
    wav::write(header, &wav::BitDepth::Sixteen(samples), &mut out)?;
    Ok(out.into_inner())
}
