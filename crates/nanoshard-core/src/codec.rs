use crate::error::NanoshardError;
use crate::types::{PcmAudio, Result, TokenLayers, NUM_CODEC_LAYERS};

/// Token id range of the stand-in tokenizer, mirroring a small codebook.
const CODEBOOK_SIZE: u32 = 4096;

/// The neural codec seen from the pipeline: an opaque batch encoder.
///
/// One instance per encoder worker; implementations may hold device state and
/// are only required to be `Send` (they never cross worker boundaries after
/// construction). A per-sample failure comes back as an `Err` in the result
/// vector so the rest of the batch survives.
pub trait AudioCodec: Send {
    fn encode_batch(&mut self, batch: &[PcmAudio]) -> Vec<Result<TokenLayers>>;
}

/// Opens codec instances, one per accelerator device.
///
/// `device_count() == 0` means no accelerator is visible; the pipeline then
/// runs a single host-bound worker on device 0.
pub trait CodecFactory: Send + Sync {
    fn device_count(&self) -> usize;
    fn open(&self, device: usize) -> Result<Box<dyn AudioCodec>>;
}

/// Deterministic stand-in for the external codec model.
///
/// Hashes fixed-size PCM frames into four parallel token streams. This is a
/// test double with the real model's shape (4 equal-length layers, one token
/// set per frame), not an audio codec: it exists so the pipeline can run end
/// to end without model weights or devices.
#[derive(Debug, Clone)]
pub struct FrameHashCodec {
    device: usize,
    frame_samples: usize,
}

impl FrameHashCodec {
    pub fn new(device: usize, frame_samples: usize) -> Self {
        Self {
            device,
            frame_samples: frame_samples.max(1),
        }
    }

    pub fn device(&self) -> usize {
        self.device
    }

    fn encode_one(&self, audio: &PcmAudio) -> Result<TokenLayers> {
        if audio.is_empty() {
            return Err(NanoshardError::CodecError(
                "empty audio buffer".to_string(),
            ));
        }
        if audio.samples.iter().any(|sample| !sample.is_finite()) {
            return Err(NanoshardError::CodecError(
                "unsupported audio buffer: non-finite sample".to_string(),
            ));
        }

        let frames = audio.samples.len().div_ceil(self.frame_samples);
        let mut layers: [Vec<u32>; NUM_CODEC_LAYERS] =
            std::array::from_fn(|_| Vec::with_capacity(frames));

        for frame in 0..frames {
            let start = frame * self.frame_samples;
            let end = (start + self.frame_samples).min(audio.samples.len());
            let mut acc = 0x811c_9dc5u32;
            for sample in &audio.samples[start..end] {
                acc ^= sample.to_bits();
                acc = acc.wrapping_mul(0x0100_0193);
            }
            for (layer_index, layer) in layers.iter_mut().enumerate() {
                let salted = acc
                    .wrapping_add(layer_index as u32)
                    .wrapping_mul(0x9e37_79b1);
                layer.push(salted % CODEBOOK_SIZE);
            }
        }

        TokenLayers::new(layers)
    }
}

impl AudioCodec for FrameHashCodec {
    fn encode_batch(&mut self, batch: &[PcmAudio]) -> Vec<Result<TokenLayers>> {
        batch.iter().map(|audio| self.encode_one(audio)).collect()
    }
}

/// Factory for the stand-in codec.
#[derive(Debug, Clone)]
pub struct FrameHashCodecFactory {
    devices: usize,
    frame_samples: usize,
}

impl FrameHashCodecFactory {
    pub fn new(devices: usize) -> Self {
        Self {
            devices,
            frame_samples: 512,
        }
    }

    pub fn with_frame_samples(mut self, frame_samples: usize) -> Self {
        self.frame_samples = frame_samples.max(1);
        self
    }

    /// Device count from the environment: `NANOSHARD_DEVICES` wins, else the
    /// `CUDA_VISIBLE_DEVICES` list length, else zero.
    pub fn from_env() -> Self {
        let devices = std::env::var("NANOSHARD_DEVICES")
            .ok()
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .or_else(|| {
                std::env::var("CUDA_VISIBLE_DEVICES").ok().map(|raw| {
                    raw.split(',')
                        .filter(|entry| !entry.trim().is_empty())
                        .count()
                })
            })
            .unwrap_or(0);
        Self::new(devices)
    }
}

impl CodecFactory for FrameHashCodecFactory {
    fn device_count(&self) -> usize {
        self.devices
    }

    fn open(&self, device: usize) -> Result<Box<dyn AudioCodec>> {
        Ok(Box::new(FrameHashCodec::new(device, self.frame_samples)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(samples: Vec<f32>) -> PcmAudio {
        PcmAudio::new(samples, 22_050)
    }

    #[test]
    fn encoding_is_deterministic_across_instances() {
        let mut a = FrameHashCodec::new(0, 4);
        let mut b = FrameHashCodec::new(1, 4);
        let input = [audio(vec![0.25, -0.5, 0.75, 0.0, 1.0])];
        let first = a.encode_batch(&input);
        let second = b.encode_batch(&input);
        assert_eq!(
            first[0].as_ref().expect("encodes"),
            second[0].as_ref().expect("encodes")
        );
    }

    #[test]
    fn layers_are_equal_length_and_frame_counted() {
        let mut codec = FrameHashCodec::new(0, 4);
        let result = codec.encode_batch(&[audio(vec![0.1; 10])]);
        let tokens = result[0].as_ref().expect("encodes");
        // 10 samples at 4 per frame round up to 3 frames.
        assert_eq!(tokens.encoded_len(), 3);
        for layer in 0..NUM_CODEC_LAYERS {
            assert_eq!(tokens.layer(layer).len(), 3);
        }
    }

    #[test]
    fn non_finite_samples_fail_without_poisoning_the_batch() {
        let mut codec = FrameHashCodec::new(0, 4);
        let results = codec.encode_batch(&[
            audio(vec![0.1; 8]),
            audio(vec![f32::NAN; 8]),
            audio(vec![0.2; 8]),
        ]);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(NanoshardError::CodecError(_))));
        assert!(results[2].is_ok());
    }

    #[test]
    fn empty_audio_is_rejected() {
        let mut codec = FrameHashCodec::new(0, 4);
        let results = codec.encode_batch(&[audio(Vec::new())]);
        assert!(matches!(results[0], Err(NanoshardError::CodecError(_))));
    }
}
