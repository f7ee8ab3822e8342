//! AAC bitstream handling: parsing an `AudioSpecificConfig` (the FLV/RTMP
//! audio sequence header) and wrapping raw AAC payloads in ADTS headers
//! for TS/PES framing.

use std::io::{self, Write};

use derive_more::{Display, From};

const ADTS_HEADER_LEN: usize = 7;

/// ISO/IEC 13818-7 Table 35: sampling_frequency_index -> Hz.
const SAMPLE_RATES: [u32; 13] = [
    96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
];

#[derive(Debug, Display, From)]
pub enum AacError {
    #[display(fmt = "aac: AudioSpecificConfig is too short")]
    ConfigTooShort,
    #[display(fmt = "aac: sampling frequency index {_0} is reserved")]
    BadSampleRateIndex(u8),
    #[display(fmt = "aac: io error")]
    Io(io::Error),
}

impl std::error::Error for AacError {}

/// Decoded `AudioSpecificConfig` fields needed to build ADTS headers.
#[derive(Debug, Clone, Copy, Default)]
pub struct AudioSpecificConfig {
    pub object_type: u8,
    pub sample_rate_index: u8,
    pub sample_rate: u32,
    pub channel_config: u8,
}

/// Parses `AudioSpecificConfig` (ISO/IEC 14496-3 §1.6.2.1) and frames raw
/// AAC payloads (ADTS-less "raw" blocks, as FLV carries them) into ADTS.
pub struct Parser {
    config: AudioSpecificConfig,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            config: AudioSpecificConfig::default(),
        }
    }

    pub fn config(&self) -> AudioSpecificConfig {
        self.config
    }

    /// Parses a 2-byte `AudioSpecificConfig` (the seq-header payload).
    pub fn parse_sequence_header(&mut self, src: &[u8]) -> Result<(), AacError> {
        if src.len() < 2 {
            return Err(AacError::ConfigTooShort);
        }

        let object_type = src[0] >> 3;
        let sample_rate_index = ((src[0] & 0x07) << 1) | (src[1] >> 7);
        let channel_config = (src[1] >> 3) & 0x0f;

        let sample_rate = *SAMPLE_RATES
            .get(sample_rate_index as usize)
            .ok_or(AacError::BadSampleRateIndex(sample_rate_index))?;

        self.config = AudioSpecificConfig {
            object_type,
            sample_rate_index,
            sample_rate,
            channel_config,
        };

        Ok(())
    }

    /// Writes a 7-byte ADTS header (no CRC) followed by `raw` into `w`.
    ///
    /// The channel configuration is 3 bits wide and spans the byte
    /// boundary between ADTS bytes 3 and 4: its high 2 bits sit in the
    /// low 2 bits of byte 3, its low bit sits in the top bit of byte 4.
    pub fn write_adts<W: Write>(&self, raw: &[u8], w: &mut W) -> Result<(), AacError> {
        let frame_len = (ADTS_HEADER_LEN + raw.len()) as u16;
        let profile = self.config.object_type.saturating_sub(1) & 0x03;
        let freq_idx = self.config.sample_rate_index & 0x0f;
        let channels = self.config.channel_config & 0x07;

        let mut header = [0u8; ADTS_HEADER_LEN];
        header[0] = 0xff;
        header[1] = 0xf1; // MPEG-4, no CRC
        header[2] = (profile << 6) | (freq_idx << 2) | (channels >> 2);
        header[3] = (channels << 6) | ((frame_len >> 11) as u8 & 0x03);
        header[4] = (frame_len >> 3) as u8;
        header[5] = (((frame_len & 0x07) << 5) as u8) | 0x1f;
        header[6] = 0xfc;

        w.write_all(&header)?;
        w.write_all(raw)?;
        Ok(())
    }
}
