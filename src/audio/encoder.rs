use audiopus::{Application, Bitrate, Channels, SampleRate, coder::Encoder as OpusEncoder};

use crate::{
    audio::constants::{FRAME_SIZE_SAMPLES, MAX_OPUS_PACKET},
    common::errors::NodeError,
};

/// 48 kHz stereo Opus encoder for one voice session.
pub struct Encoder {
    encoder: OpusEncoder,
    output: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Result<Self, NodeError> {
        let mut encoder =
            OpusEncoder::new(SampleRate::Hz48000, Channels::Stereo, Application::Audio)
                .map_err(|e| NodeError::Transport(format!("opus encoder: {}", e)))?;
        encoder
            .set_bitrate(Bitrate::Auto)
            .map_err(|e| NodeError::Transport(format!("opus bitrate: {}", e)))?;
        Ok(Self {
            encoder,
            output: vec![0u8; MAX_OPUS_PACKET],
        })
    }

    /// Encode one 20 ms interleaved stereo frame. Short input is padded with
    /// silence.
    pub fn encode(&mut self, pcm: &[i16]) -> Result<&[u8], NodeError> {
        let size = if pcm.len() == FRAME_SIZE_SAMPLES {
            self.encoder.encode(pcm, &mut self.output)
        } else {
            let mut frame = [0i16; FRAME_SIZE_SAMPLES];
            let n = pcm.len().min(FRAME_SIZE_SAMPLES);
            frame[..n].copy_from_slice(&pcm[..n]);
            self.encoder.encode(&frame, &mut self.output)
        }
        .map_err(|e| NodeError::Transport(format!("opus encode: {}", e)))?;
        Ok(&self.output[..size])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_silence_and_short_frames() {
        let mut encoder = Encoder::new().unwrap();
        assert!(!encoder.encode(&[0; FRAME_SIZE_SAMPLES]).unwrap().is_empty());
        assert!(!encoder.encode(&[100; 10]).unwrap().is_empty());
    }
}
