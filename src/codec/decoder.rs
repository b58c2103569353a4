//! Opus decoder with packet loss concealment

use opus::{Channels, Decoder};

use crate::error::{AudioError, Result};
use crate::media::audio::{AudioDecoder, AudioFormat};

/// Opus decoder producing interleaved i16 PCM
pub struct OpusAudioDecoder {
    decoder: Decoder,
    sample_rate: u32,
    channels: u16,
    frames_decoded: u64,
    /// Frames synthesized by PLC
    frames_lost: u64,
    samples_produced: u64,
}

impl OpusAudioDecoder {
    pub fn new(sample_rate: u32, channels: u16) -> Result<Self> {
        let opus_channels = match channels {
            1 => Channels::Mono,
            2 => Channels::Stereo,
            _ => {
                return Err(AudioError::DecoderInit(format!("Unsupported channel count: {}", channels)).into());
            }
        };
        let decoder = Decoder::new(sample_rate, opus_channels).map_err(|e| AudioError::DecoderInit(e.to_string()))?;

        Ok(Self {
            decoder,
            sample_rate,
            channels,
            frames_decoded: 0,
            frames_lost: 0,
            samples_produced: 0,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Clear decoder history, e.g. after a stream restart
    pub fn reset(&mut self) -> Result<()> {
        self.decoder
            .reset_state()
            .map_err(|e| AudioError::DecoderInit(e.to_string()).into())
    }

    pub fn stats(&self) -> DecoderStats {
        let total = self.frames_decoded + self.frames_lost;
        DecoderStats {
            frames_decoded: self.frames_decoded,
            frames_lost: self.frames_lost,
            samples_produced: self.samples_produced,
            loss_rate: if total > 0 {
                self.frames_lost as f32 / total as f32
            } else {
                0.0
            },
        }
    }

    fn output<'a>(&self, pcm: &'a mut [i16], frame_size: usize) -> &'a mut [i16] {
        let len = (frame_size * self.channels as usize).min(pcm.len());
        &mut pcm[..len]
    }
}

impl AudioDecoder for OpusAudioDecoder {
    fn decode(&mut self, packet: &[u8], pcm: &mut [i16], frame_size: usize) -> Result<usize> {
        let channels = self.channels as usize;
        let out = self.output(pcm, frame_size);
        let samples = self
            .decoder
            .decode(packet, out, false)
            .map_err(|e| AudioError::DecodingFailed(e.to_string()))?;
        self.frames_decoded += 1;
        self.samples_produced += (samples * channels) as u64;
        Ok(samples)
    }

    fn conceal(&mut self, pcm: &mut [i16], frame_size: usize) -> Result<usize> {
        let channels = self.channels as usize;
        let out = self.output(pcm, frame_size);
        let samples = self
            .decoder
            .decode(&[], out, false)
            .map_err(|e| AudioError::DecodingFailed(e.to_string()))?;
        self.frames_lost += 1;
        self.samples_produced += (samples * channels) as u64;
        Ok(samples)
    }

    fn format(&self) -> AudioFormat {
        AudioFormat::Opus
    }
}

/// Decoder statistics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecoderStats {
    pub frames_decoded: u64,
    pub frames_lost: u64,
    pub samples_produced: u64,
    pub loss_rate: f32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use opus::{Application, Encoder};

    const FRAME: usize = 960;

    #[test]
    fn test_rejects_surround() {
        assert!(OpusAudioDecoder::new(48000, 6).is_err());
    }

    #[test]
    fn test_decode_encoded_tone() {
        let mut encoder = Encoder::new(48000, Channels::Stereo, Application::Audio).unwrap();
        let mut decoder = OpusAudioDecoder::new(48000, 2).unwrap();

        let mut tone = Vec::with_capacity(FRAME * 2);
        for i in 0..FRAME {
            let t = i as f32 / 48000.0;
            let v = ((t * 440.0 * 2.0 * std::f32::consts::PI).sin() * 8000.0) as i16;
            tone.push(v);
            tone.push(v);
        }
        let mut packet = vec![0u8; 4000];
        let len = encoder.encode(&tone, &mut packet).unwrap();

        let mut pcm = vec![0i16; FRAME * 2];
        assert_eq!(decoder.decode(&packet[..len], &mut pcm, FRAME).unwrap(), FRAME);
        assert_eq!(decoder.stats().frames_decoded, 1);
    }

    #[test]
    fn test_conceal_counts_loss() {
        let mut decoder = OpusAudioDecoder::new(48000, 2).unwrap();
        let mut pcm = vec![0i16; FRAME * 2];
        assert!(decoder.conceal(&mut pcm, FRAME).is_ok());

        let stats = decoder.stats();
        assert_eq!(stats.frames_lost, 1);
        assert_eq!(stats.loss_rate, 1.0);
    }
}
