//! H.264 bitstream handling: parsing an `AVCDecoderConfigurationRecord`
//! (the FLV/RTMP video sequence header) into an Annex-B SPS/PPS prelude,
//! and converting AVCC samples (4-byte length-prefixed NALUs) to Annex-B
//! (`00 00 00 01`-delimited) for TS/PES framing.

use std::io::{self, Write};

use bytes::{Bytes, BytesMut};
use derive_more::{Display, From};

const NALU_TYPE_SLICE: u8 = 1;
const NALU_TYPE_IDR: u8 = 5;
const NALU_TYPE_SEI: u8 = 6;
const NALU_TYPE_SPS: u8 = 7;
const NALU_TYPE_PPS: u8 = 8;
const NALU_TYPE_AUD: u8 = 9;

const NALU_LENGTH_FIELD: usize = 4;
const MAX_SPS_PPS_LEN: usize = 2 * 1024;

const START_CODE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];
const AUD_NALU: [u8; 6] = [0x00, 0x00, 0x00, 0x01, 0x09, 0xf0];

#[derive(Debug, Display, From)]
pub enum AvcError {
    #[display(fmt = "avc: decoder configuration record is too short")]
    DecoderConfigTooShort,
    #[display(fmt = "avc: sps data error")]
    SpsData,
    #[display(fmt = "avc: pps header error")]
    PpsHeader,
    #[display(fmt = "avc: pps data error")]
    PpsData,
    #[display(fmt = "avc: sample too short to contain a NALU length")]
    VideoDataInvalid,
    #[display(fmt = "avc: NALU length does not match remaining sample bytes")]
    NaluBodyLen,
    #[display(fmt = "avc: io error")]
    Io(io::Error),
}

impl std::error::Error for AvcError {}

fn is_annex_b_start(src: &[u8]) -> bool {
    src.len() >= 4 && src[0] == 0 && src[1] == 0 && src[2] == 0 && src[3] == 1
}

fn nalu_size(src: &[u8]) -> Result<usize, AvcError> {
    if src.len() < NALU_LENGTH_FIELD {
        return Err(AvcError::VideoDataInvalid);
    }
    Ok(((src[0] as usize) << 24) | ((src[1] as usize) << 16) | ((src[2] as usize) << 8) | (src[3] as usize))
}

/// Parses the AVCC sample stream (length-prefixed NALUs) into Annex-B,
/// and holds the SPS/PPS prelude recovered from the sequence header.
pub struct Parser {
    /// Annex-B encoded `start_code + sps, start_code + pps` pulled from
    /// the most recently seen AVCDecoderConfigurationRecord.
    specific_info: BytesMut,
    /// Scratch buffer for in-sample SPS/PPS (emitted ahead of an IDR when
    /// the sample itself carries fresh parameter sets).
    in_sample_sps_pps: BytesMut,
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            specific_info: BytesMut::new(),
            in_sample_sps_pps: BytesMut::with_capacity(MAX_SPS_PPS_LEN),
        }
    }

    /// Annex-B SPS/PPS prelude recovered from the last sequence header, if any.
    pub fn specific_info(&self) -> Bytes {
        self.specific_info.clone().freeze()
    }

    fn parse_sequence_header(&mut self, src: &[u8]) -> Result<(), AvcError> {
        if src.len() < 9 {
            return Err(AvcError::DecoderConfigTooShort);
        }

        let sps_len = ((src[6] as usize) << 8) | (src[7] as usize);
        if sps_len == 0 || src.len() < 8 + sps_len {
            return Err(AvcError::SpsData);
        }
        let sps = &src[8..8 + sps_len];

        let rest = &src[8 + sps_len..];
        if rest.len() < 4 {
            return Err(AvcError::PpsHeader);
        }
        let pps_len = ((rest[1] as usize) << 8) | (rest[2] as usize);
        if pps_len == 0 || rest.len() < 3 + pps_len {
            return Err(AvcError::PpsData);
        }
        let pps = &rest[3..3 + pps_len];

        self.specific_info.clear();
        self.specific_info.extend_from_slice(&START_CODE);
        self.specific_info.extend_from_slice(sps);
        self.specific_info.extend_from_slice(&START_CODE);
        self.specific_info.extend_from_slice(pps);

        Ok(())
    }

    fn avcc_to_annex_b<W: Write>(&mut self, src: &[u8], w: &mut W) -> Result<(), AvcError> {
        if src.len() < NALU_LENGTH_FIELD {
            return Err(AvcError::VideoDataInvalid);
        }

        self.in_sample_sps_pps.clear();
        w.write_all(&AUD_NALU)?;

        let mut index = 0usize;
        let mut has_sps_pps = false;
        let mut has_written_sps_pps = false;

        while index < src.len() {
            let nal_len = nalu_size(&src[index..])?;
            index += NALU_LENGTH_FIELD;

            if index + nal_len > src.len() || nal_len == 0 {
                return Err(AvcError::NaluBodyLen);
            }

            let nalu = &src[index..index + nal_len];
            let nal_type = nalu[0] & 0x1f;

            match nal_type {
                t if t == NALU_TYPE_AUD => {}
                t if t == NALU_TYPE_IDR => {
                    if !has_written_sps_pps {
                        has_written_sps_pps = true;
                        if has_sps_pps {
                            w.write_all(&self.in_sample_sps_pps)?;
                        } else {
                            w.write_all(&self.specific_info)?;
                        }
                    }
                    w.write_all(&START_CODE)?;
                    w.write_all(nalu)?;
                }
                t if t == NALU_TYPE_SLICE || t == NALU_TYPE_SEI => {
                    w.write_all(&START_CODE)?;
                    w.write_all(nalu)?;
                }
                t if t == NALU_TYPE_SPS || t == NALU_TYPE_PPS => {
                    has_sps_pps = true;
                    self.in_sample_sps_pps.extend_from_slice(&START_CODE);
                    self.in_sample_sps_pps.extend_from_slice(nalu);
                }
                _ => {}
            }

            index += nal_len;
        }

        Ok(())
    }

    /// Parses one video payload. `is_seq` selects between the
    /// AVCDecoderConfigurationRecord path and the per-sample AVCC path.
    pub fn parse<W: Write>(&mut self, data: &[u8], is_seq: bool, w: &mut W) -> Result<(), AvcError> {
        if is_seq {
            self.parse_sequence_header(data)
        } else if is_annex_b_start(data) {
            w.write_all(data)?;
            Ok(())
        } else {
            self.avcc_to_annex_b(data, w)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sequence_header(sps: &[u8], pps: &[u8]) -> Vec<u8> {
        let mut rec = vec![1, 0x64, 0, 0x1f, 0xff, 0xe1];
        rec.push((sps.len() >> 8) as u8);
        rec.push((sps.len() & 0xff) as u8);
        rec.extend_from_slice(sps);
        rec.push(1);
        rec.push((pps.len() >> 8) as u8);
        rec.push((pps.len() & 0xff) as u8);
        rec.extend_from_slice(pps);
        rec
    }

    fn avcc_nalu(nal_type: u8, body: &[u8]) -> Vec<u8> {
        let mut nalu = vec![nal_type];
        nalu.extend_from_slice(body);
        let mut out = ((nalu.len() as u32).to_be_bytes()).to_vec();
        out.extend_from_slice(&nalu);
        out
    }

    #[test]
    fn sequence_header_produces_annex_b_prelude() {
        let sps = [0x67, 0x01, 0x02, 0x03];
        let pps = [0x68, 0x01];
        let mut parser = Parser::new();
        let mut sink = Vec::new();
        parser.parse(&sequence_header(&sps, &pps), true, &mut sink).unwrap();

        let mut expected = Vec::new();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&sps);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&pps);
        assert_eq!(parser.specific_info(), Bytes::from(expected));
    }

    #[test]
    fn idr_sample_with_stored_sps_pps_emits_aud_then_stored_prelude() {
        let sps = [0x67, 0xaa];
        let pps = [0x68, 0xbb];
        let mut parser = Parser::new();
        let mut sink = Vec::new();
        parser.parse(&sequence_header(&sps, &pps), true, &mut sink).unwrap();

        let idr = avcc_nalu(NALU_TYPE_IDR, &[0xde, 0xad, 0xbe, 0xef]);
        let mut out = Vec::new();
        parser.parse(&idr, false, &mut out).unwrap();

        let mut expected = AUD_NALU.to_vec();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&sps);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&pps);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&idr[4..]);
        assert_eq!(out, expected);
    }

    #[test]
    fn idr_sample_with_in_sample_sps_pps_prefers_those_over_stored() {
        let mut parser = Parser::new();
        parser
            .parse(&sequence_header(&[0x67, 0x01], &[0x68, 0x01]), true, &mut Vec::new())
            .unwrap();

        let fresh_sps = avcc_nalu(NALU_TYPE_SPS, &[0x67, 0x99]);
        let fresh_pps = avcc_nalu(NALU_TYPE_PPS, &[0x68, 0x99]);
        let idr = avcc_nalu(NALU_TYPE_IDR, &[0x11, 0x22]);

        let mut sample = Vec::new();
        sample.extend_from_slice(&fresh_sps);
        sample.extend_from_slice(&fresh_pps);
        sample.extend_from_slice(&idr);

        let mut out = Vec::new();
        parser.parse(&sample, false, &mut out).unwrap();

        let mut expected = AUD_NALU.to_vec();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&fresh_sps[4..]);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&fresh_pps[4..]);
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&idr[4..]);
        assert_eq!(out, expected);
    }

    #[test]
    fn non_idr_slice_passes_through_with_start_code() {
        let mut parser = Parser::new();
        let slice = avcc_nalu(NALU_TYPE_SLICE, &[0x01, 0x02]);
        let mut out = Vec::new();
        parser.parse(&slice, false, &mut out).unwrap();

        let mut expected = AUD_NALU.to_vec();
        expected.extend_from_slice(&START_CODE);
        expected.extend_from_slice(&slice[4..]);
        assert_eq!(out, expected);
    }

    #[test]
    fn already_annex_b_passes_through_unchanged() {
        let mut parser = Parser::new();
        let mut data = START_CODE.to_vec();
        data.extend_from_slice(&[0x65, 0x01, 0x02]);
        let mut out = Vec::new();
        parser.parse(&data, false, &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn too_short_sequence_header_is_an_error() {
        let mut parser = Parser::new();
        let mut sink = Vec::new();
        assert!(parser.parse(&[0u8; 4], true, &mut sink).is_err());
    }
}
