//! Sample-format helpers shared by capture, gating and playback.

use base64::Engine as _;

use crate::MediaError;

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Result<Vec<i16>, MediaError> {
    if bytes.len() % 2 != 0 {
        return Err(MediaError::Decode(format!(
            "odd pcm16 byte length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|c| i16::from_le_bytes([c[0], c[1]]))
        .collect())
}

/// Decode a base64 voice chunk into 16-bit samples.
pub fn decode_base64_pcm16(encoded: &str) -> Result<Vec<i16>, MediaError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|e| MediaError::Decode(format!("base64: {e}")))?;
    pcm16_from_le_bytes(&bytes)
}

pub fn encode_base64_pcm16(samples: &[i16]) -> String {
    base64::engine::general_purpose::STANDARD.encode(pcm16_to_le_bytes(samples))
}

/// Root-mean-square level normalized to 0.0..=1.0.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|s| {
            let v = *s as f64 / i16::MAX as f64;
            v * v
        })
        .sum();
    ((sum / samples.len() as f64).sqrt() as f32).min(1.0)
}

pub fn i16_to_f32(samples: &[i16]) -> Vec<f32> {
    samples.iter().map(|s| *s as f32 / 32_768.0).collect()
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16
}

/// Linear-interpolation resampler. Good enough for speech.
pub fn resample_linear(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 / ratio;
        let idx0 = src_idx as usize;
        let frac = src_idx - idx0 as f64;
        let s0 = samples.get(idx0).copied().unwrap_or(0) as f64;
        let s1 = samples.get(idx0 + 1).copied().unwrap_or(s0 as i16) as f64;
        out.push((s0 + frac * (s1 - s0)) as i16);
    }
    out
}

pub fn resample_linear_f32(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = to_rate as f64 / from_rate as f64;
    let out_len = (samples.len() as u64 * to_rate as u64 / from_rate as u64) as usize;
    let mut out = Vec::with_capacity(out_len);
    for i in 0..out_len {
        let src_idx = i as f64 / ratio;
        let idx0 = src_idx as usize;
        let frac = (src_idx - idx0 as f64) as f32;
        let s0 = samples.get(idx0).copied().unwrap_or(0.0);
        let s1 = samples.get(idx0 + 1).copied().unwrap_or(s0);
        out.push(s0 + frac * (s1 - s0));
    }
    out
}

/// Keep the first channel of each interleaved frame.
pub fn first_channel<T: Copy>(data: &[T], channels: usize) -> impl Iterator<Item = T> + '_ {
    data.chunks(channels.max(1)).filter_map(|frame| frame.first().copied())
}

pub fn duration_ms(samples: usize, sample_rate: u32) -> f64 {
    if sample_rate == 0 {
        return 0.0;
    }
    samples as f64 * 1000.0 / sample_rate as f64
}

/// Parse a 16-bit integer PCM WAV file, down-mixing to the first channel.
pub fn read_wav_pcm16(data: &[u8]) -> Result<(u32, Vec<i16>), MediaError> {
    let reader = hound::WavReader::new(std::io::Cursor::new(data))
        .map_err(|e| MediaError::Decode(format!("invalid wav: {e}")))?;
    let spec = reader.spec();
    if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(MediaError::Decode(format!(
            "unsupported wav format: {:?} {} bit",
            spec.sample_format, spec.bits_per_sample
        )));
    }
    let interleaved = reader
        .into_samples::<i16>()
        .collect::<Result<Vec<i16>, _>>()
        .map_err(|e| MediaError::Decode(format!("invalid wav samples: {e}")))?;
    let channels = usize::from(spec.channels.max(1));
    Ok((spec.sample_rate, first_channel(&interleaved, channels).collect()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn le_bytes_round_trip_preserves_sign() {
        let samples = [0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = pcm16_to_le_bytes(&samples);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(pcm16_from_le_bytes(&bytes).expect("decode"), samples);
    }

    #[test]
    fn odd_length_payload_is_rejected() {
        let err = pcm16_from_le_bytes(&[1, 2, 3]).expect_err("odd length");
        assert!(matches!(err, MediaError::Decode(_)));
    }

    #[test]
    fn base64_chunk_decodes() {
        let encoded = encode_base64_pcm16(&[100, -100]);
        assert_eq!(decode_base64_pcm16(&encoded).expect("decode"), vec![100, -100]);
        assert!(decode_base64_pcm16("%%%").is_err());
    }

    #[test]
    fn rms_is_normalized() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0; 64]), 0.0);
        let full = rms(&[i16::MAX; 64]);
        assert!((full - 1.0).abs() < 1e-4, "full scale rms was {full}");
        let half = rms(&[i16::MAX / 2; 64]);
        assert!((half - 0.5).abs() < 1e-3, "half scale rms was {half}");
    }

    #[test]
    fn resample_changes_length_by_ratio() {
        let input = vec![1000i16; 480];
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 160);
        assert!(out.iter().all(|s| *s == 1000));
        assert_eq!(resample_linear(&input, 16_000, 16_000).len(), 480);
    }

    #[test]
    fn first_channel_downmixes_interleaved_frames() {
        let stereo = [1i16, 9, 2, 9, 3, 9];
        let mono: Vec<i16> = first_channel(&stereo, 2).collect();
        assert_eq!(mono, vec![1, 2, 3]);
    }

    type MemWriter<'a> = hound::WavWriter<&'a mut std::io::Cursor<Vec<u8>>>;

    fn wav_bytes(spec: hound::WavSpec, write: impl FnOnce(&mut MemWriter<'_>)) -> Vec<u8> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = hound::WavWriter::new(&mut cursor, spec).expect("wav writer");
            write(&mut writer);
            writer.finalize().expect("finalize wav");
        }
        cursor.into_inner()
    }

    fn pcm16_spec(channels: u16) -> hound::WavSpec {
        hound::WavSpec {
            channels,
            sample_rate: 16_000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        }
    }

    #[test]
    fn reads_mono_wav() {
        let wav = wav_bytes(pcm16_spec(1), |w| {
            for s in [5i16, -5, 7] {
                w.write_sample(s).expect("sample");
            }
        });
        let (rate, decoded) = read_wav_pcm16(&wav).expect("wav");
        assert_eq!(rate, 16_000);
        assert_eq!(decoded, vec![5, -5, 7]);
    }

    #[test]
    fn stereo_wav_keeps_first_channel() {
        let wav = wav_bytes(pcm16_spec(2), |w| {
            for s in [1i16, 100, 2, 200, 3, 300] {
                w.write_sample(s).expect("sample");
            }
        });
        let (_, decoded) = read_wav_pcm16(&wav).expect("wav");
        assert_eq!(decoded, vec![1, 2, 3]);
    }

    #[test]
    fn chunk_text_mentioning_data_is_skipped() {
        let body = pcm16_to_le_bytes(&[11, -11]);
        let list = b"INFOICMT\x08\x00\x00\x00metadata";
        let mut wav = Vec::new();
        wav.extend_from_slice(b"RIFF");
        let riff_len = 4 + (8 + 16) + (8 + list.len()) + (8 + body.len());
        wav.extend_from_slice(&(riff_len as u32).to_le_bytes());
        wav.extend_from_slice(b"WAVEfmt ");
        wav.extend_from_slice(&16u32.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&1u16.to_le_bytes());
        wav.extend_from_slice(&16_000u32.to_le_bytes());
        wav.extend_from_slice(&32_000u32.to_le_bytes());
        wav.extend_from_slice(&2u16.to_le_bytes());
        wav.extend_from_slice(&16u16.to_le_bytes());
        wav.extend_from_slice(b"LIST");
        wav.extend_from_slice(&(list.len() as u32).to_le_bytes());
        wav.extend_from_slice(list);
        wav.extend_from_slice(b"data");
        wav.extend_from_slice(&(body.len() as u32).to_le_bytes());
        wav.extend_from_slice(&body);

        let (_, decoded) = read_wav_pcm16(&wav).expect("wav");
        assert_eq!(decoded, vec![11, -11]);
    }

    #[test]
    fn non_pcm16_wav_is_rejected() {
        let float_spec = hound::WavSpec {
            bits_per_sample: 32,
            sample_format: hound::SampleFormat::Float,
            ..pcm16_spec(1)
        };
        let wav = wav_bytes(float_spec, |w| w.write_sample(0.5f32).expect("sample"));
        assert!(matches!(read_wav_pcm16(&wav), Err(MediaError::Decode(_))));

        let byte_spec = hound::WavSpec {
            bits_per_sample: 8,
            ..pcm16_spec(1)
        };
        let wav = wav_bytes(byte_spec, |w| w.write_sample(3i8).expect("sample"));
        assert!(matches!(read_wav_pcm16(&wav), Err(MediaError::Decode(_))));

        assert!(read_wav_pcm16(b"RIFF....WAVEjunk").is_err());
    }
}
