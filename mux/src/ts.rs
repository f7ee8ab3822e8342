//! MPEG-TS multiplexing: PAT/PMT generation and PES packetization of
//! Annex-B H.264 video and ADTS-framed AAC audio into 188-byte transport
//! packets, with PCR carried on the video PID.

use bytes::{BufMut, Bytes, BytesMut};

use crate::crc::crc32_mpeg2;

pub const PACKET_SIZE: usize = 188;
const SYNC_BYTE: u8 = 0x47;

pub const PAT_PID: u16 = 0x0000;
pub const PMT_PID: u16 = 0x1000;
pub const VIDEO_PID: u16 = 0x0100;
pub const AUDIO_PID: u16 = 0x0101;

const STREAM_TYPE_H264: u8 = 0x1b;
const STREAM_TYPE_AAC: u8 = 0x0f;
const STREAM_TYPE_MP3: u8 = 0x04;

const PES_STREAM_ID_VIDEO: u8 = 0xe0;
const PES_STREAM_ID_AUDIO: u8 = 0xc0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

/// The audio elementary stream type carried in the PMT. Selected by the
/// FLV `SoundFormat` of the publisher's audio track; the muxer never
/// transcodes, it only labels the PID with the right `stream_type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioCodec {
    Aac,
    Mp3,
}

impl AudioCodec {
    fn stream_type(self) -> u8 {
        match self {
            AudioCodec::Aac => STREAM_TYPE_AAC,
            AudioCodec::Mp3 => STREAM_TYPE_MP3,
        }
    }
}

impl StreamKind {
    fn pid(self) -> u16 {
        match self {
            StreamKind::Video => VIDEO_PID,
            StreamKind::Audio => AUDIO_PID,
        }
    }

    fn pes_stream_id(self) -> u8 {
        match self {
            StreamKind::Video => PES_STREAM_ID_VIDEO,
            StreamKind::Audio => PES_STREAM_ID_AUDIO,
        }
    }
}

/// Stateful MPEG-TS muxer for one program carrying one video and one audio
/// elementary stream. Holds per-PID continuity counters across calls, so
/// one `TsMuxer` must live for the lifetime of one segment (or one
/// continuous output stream, if continuity counters are meant to span
/// segment boundaries).
pub struct TsMuxer {
    pat_cc: u8,
    pmt_cc: u8,
    video_cc: u8,
    audio_cc: u8,
    has_video: bool,
    audio_codec: Option<AudioCodec>,
}

impl Default for TsMuxer {
    fn default() -> Self {
        Self::new()
    }
}

impl TsMuxer {
    /// A muxer for the common case: one H.264 video track plus one AAC
    /// audio track.
    pub fn new() -> Self {
        TsMuxer::with_program(true, Some(AudioCodec::Aac))
    }

    /// A muxer for a program whose track set is known up front (e.g. an
    /// audio-only stream, or one carrying MP3 instead of AAC).
    pub fn with_program(has_video: bool, audio_codec: Option<AudioCodec>) -> Self {
        TsMuxer {
            pat_cc: 0,
            pmt_cc: 0,
            video_cc: 0,
            audio_cc: 0,
            has_video,
            audio_codec,
        }
    }

    fn cc_slot(&mut self, pid: u16) -> &mut u8 {
        match pid {
            PAT_PID => &mut self.pat_cc,
            PMT_PID => &mut self.pmt_cc,
            VIDEO_PID => &mut self.video_cc,
            _ => &mut self.audio_cc,
        }
    }

    fn next_cc(&mut self, pid: u16) -> u8 {
        let slot = self.cc_slot(pid);
        let cc = *slot;
        *slot = (cc + 1) & 0x0f;
        cc
    }

    /// Builds the PAT + PMT packets that must prefix every segment.
    pub fn program_tables(&mut self) -> Bytes {
        let pmt = pmt_section(self.has_video, self.audio_codec);
        let mut pkts = BytesMut::with_capacity(PACKET_SIZE * 2);
        pkts.extend_from_slice(&self.psi_packet(PAT_PID, &pat_section()));
        pkts.extend_from_slice(&self.psi_packet(PMT_PID, &pmt));
        pkts.freeze()
    }

    fn psi_packet(&mut self, pid: u16, section: &[u8]) -> [u8; PACKET_SIZE] {
        let mut pkt = [0u8; PACKET_SIZE];
        pkt[0] = SYNC_BYTE;
        pkt[1] = 0x40 | ((pid >> 8) as u8 & 0x1f); // payload_unit_start_indicator
        pkt[2] = (pid & 0xff) as u8;
        let cc = self.next_cc(pid);
        pkt[3] = 0x10 | cc; // adaptation_field_control = payload only

        // pointer_field precedes the section when payload_unit_start is set.
        pkt[4] = 0x00;
        let payload = &mut pkt[5..];
        let n = section.len().min(payload.len());
        payload[..n].copy_from_slice(&section[..n]);
        for b in &mut payload[n..] {
            *b = 0xff;
        }
        pkt
    }

    /// Packetizes one access unit (a complete Annex-B video frame or one
    /// ADTS-framed audio frame) into a sequence of 188-byte TS packets.
    ///
    /// `pcr_base` is supplied (in 90kHz ticks) whenever this access unit
    /// should carry a PCR — conventionally every video keyframe and,
    /// failing that, periodically enough to keep players' clocks locked
    /// (segment cut boundaries always attach one).
    pub fn write_pes(
        &mut self,
        kind: StreamKind,
        pts_90k: u64,
        dts_90k: Option<u64>,
        pcr_90k: Option<u64>,
        payload: &[u8],
    ) -> Bytes {
        let pes = build_pes_packet(kind, pts_90k, dts_90k, payload);
        self.packetize(kind.pid(), pcr_90k, &pes)
    }

    fn packetize(&mut self, pid: u16, pcr_90k: Option<u64>, pes: &[u8]) -> Bytes {
        let mut out = BytesMut::with_capacity(pes.len() + pes.len() / 184 * 8 + PACKET_SIZE);
        let mut offset = 0usize;
        let mut first = true;

        while offset < pes.len() {
            let cc = self.next_cc(pid);
            let mut pkt = [0u8; PACKET_SIZE];
            pkt[0] = SYNC_BYTE;
            pkt[1] = (if first { 0x40 } else { 0x00 }) | ((pid >> 8) as u8 & 0x1f);
            pkt[2] = (pid & 0xff) as u8;

            let remaining = pes.len() - offset;
            let pcr_here = if first { pcr_90k } else { None };

            if pcr_here.is_some() || remaining < 184 {
                let (adaptation, af_len) = build_adaptation_field(pcr_here, remaining, first);
                pkt[3] = 0x30 | cc; // adaptation + payload
                pkt[4] = af_len as u8;
                pkt[5..5 + adaptation.len()].copy_from_slice(&adaptation);

                let payload_space = PACKET_SIZE - 5 - adaptation.len();
                let n = remaining.min(payload_space);
                pkt[5 + adaptation.len()..5 + adaptation.len() + n]
                    .copy_from_slice(&pes[offset..offset + n]);
                offset += n;
            } else {
                pkt[3] = 0x10 | cc; // payload only
                let n = remaining.min(184);
                pkt[4..4 + n].copy_from_slice(&pes[offset..offset + n]);
                offset += n;
            }

            out.extend_from_slice(&pkt);
            first = false;
        }

        out.freeze()
    }
}

fn pts_dts_bytes(marker: u8, value_90k: u64) -> [u8; 5] {
    let v = value_90k & 0x1_ffff_ffff;
    [
        (marker << 4) | (((v >> 30) as u8 & 0x07) << 1) | 0x01,
        ((v >> 22) & 0xff) as u8,
        ((((v >> 15) & 0x7f) as u8) << 1) | 0x01,
        ((v >> 7) & 0xff) as u8,
        (((v & 0x7f) as u8) << 1) | 0x01,
    ]
}

fn build_pes_packet(kind: StreamKind, pts_90k: u64, dts_90k: Option<u64>, payload: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(payload.len() + 19);
    out.put_u8(0x00);
    out.put_u8(0x00);
    out.put_u8(0x01);
    out.put_u8(kind.pes_stream_id());

    let has_dts = matches!(dts_90k, Some(d) if d != pts_90k);
    let pts_dts_flags = if has_dts { 0b11 } else { 0b10 };
    let header_data_len = if has_dts { 10 } else { 5 };
    let pes_packet_len = payload.len() + 3 + header_data_len;

    out.put_u16(if pes_packet_len > 0xffff { 0 } else { pes_packet_len as u16 });
    out.put_u8(0x80); // marker bits '10', scrambling=0, priority=0, alignment=0, copyright=0, original=0
    out.put_u8((pts_dts_flags << 6) | 0x00); // PTS_DTS_flags, ESCR/ES_rate/DSM/additional copy/CRC/extension all 0
    out.put_u8(header_data_len as u8);

    if has_dts {
        out.extend_from_slice(&pts_dts_bytes(0b0011, pts_90k));
        out.extend_from_slice(&pts_dts_bytes(0b0001, dts_90k.unwrap()));
    } else {
        out.extend_from_slice(&pts_dts_bytes(0b0010, pts_90k));
    }

    out.extend_from_slice(payload);
    out.freeze()
}

/// Returns the adaptation field bytes (excluding the length byte itself)
/// and the value to place in that length byte.
fn build_adaptation_field(pcr_90k: Option<u64>, remaining_payload: usize, first_packet: bool) -> (Vec<u8>, usize) {
    let header_room = if pcr_90k.is_some() { 1 + 6 } else { 1 };
    let payload_budget = PACKET_SIZE - 4 - header_room;

    let stuffing = if remaining_payload >= payload_budget {
        0
    } else {
        payload_budget - remaining_payload
    };

    let mut field = Vec::with_capacity(header_room - 1 + stuffing);
    let mut flags = 0u8;
    if pcr_90k.is_some() {
        flags |= 0x10;
    }
    if first_packet {
        flags |= 0x40; // random_access_indicator
    }
    field.push(flags);

    if let Some(pcr) = pcr_90k {
        // program_clock_reference_extension is fixed at 0: the 90kHz PTS/DTS
        // clock we derive PCR from has no finer-grained 27MHz component.
        let base = pcr & 0x1_ffff_ffff;
        field.push(((base >> 25) & 0xff) as u8);
        field.push(((base >> 17) & 0xff) as u8);
        field.push(((base >> 9) & 0xff) as u8);
        field.push(((base >> 1) & 0xff) as u8);
        field.push((((base & 0x01) as u8) << 7) | 0x7e);
        field.push(0x00);
    }

    for _ in 0..stuffing {
        field.push(0xff);
    }

    let af_len = field.len();
    (field, af_len)
}

fn pat_section() -> Vec<u8> {
    let mut body = Vec::new();
    body.push(0x00); // table_id
    // length patched below
    body.extend_from_slice(&[0, 0]);
    body.extend_from_slice(&1u16.to_be_bytes()); // transport_stream_id
    body.push(0xc1); // reserved | version | current_next_indicator
    body.push(0x00); // section_number
    body.push(0x00); // last_section_number
    body.extend_from_slice(&1u16.to_be_bytes()); // program_number
    body.extend_from_slice(&(0xe000 | PMT_PID).to_be_bytes());

    let section_length = (body.len() - 3 + 4) as u16; // bytes after length field + crc
    let len_bytes = (0xb000 | section_length).to_be_bytes();
    body[1] = len_bytes[0];
    body[2] = len_bytes[1];

    let crc = crc32_mpeg2(&body);
    body.extend_from_slice(&crc.to_be_bytes());
    body
}

fn pmt_section(has_video: bool, audio_codec: Option<AudioCodec>) -> Vec<u8> {
    let pcr_pid = if has_video { VIDEO_PID } else { AUDIO_PID };

    let mut body = Vec::new();
    body.push(0x02); // table_id
    body.extend_from_slice(&[0, 0]); // length patched below
    body.extend_from_slice(&1u16.to_be_bytes()); // program_number
    body.push(0xc1);
    body.push(0x00);
    body.push(0x00);
    body.extend_from_slice(&(0xe000 | pcr_pid).to_be_bytes()); // PCR_PID
    body.extend_from_slice(&0xf000u16.to_be_bytes()); // program_info_length = 0

    if has_video {
        body.push(STREAM_TYPE_H264);
        body.extend_from_slice(&(0xe000 | VIDEO_PID).to_be_bytes());
        body.extend_from_slice(&0xf000u16.to_be_bytes()); // ES_info_length = 0
    }

    if let Some(codec) = audio_codec {
        body.push(codec.stream_type());
        body.extend_from_slice(&(0xe000 | AUDIO_PID).to_be_bytes());
        body.extend_from_slice(&0xf000u16.to_be_bytes());
    }

    let section_length = (body.len() - 3 + 4) as u16;
    let len_bytes = (0xb000 | section_length).to_be_bytes();
    body[1] = len_bytes[0];
    body[2] = len_bytes[1];

    let crc = crc32_mpeg2(&body);
    body.extend_from_slice(&crc.to_be_bytes());
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_tables_produce_two_synced_188_byte_packets() {
        let mut mux = TsMuxer::new();
        let tables = mux.program_tables();
        assert_eq!(tables.len(), PACKET_SIZE * 2);
        assert_eq!(tables[0], SYNC_BYTE);
        assert_eq!(tables[PACKET_SIZE], SYNC_BYTE);
    }

    #[test]
    fn continuity_counters_increment_mod_16_per_pid() {
        let mut mux = TsMuxer::new();
        let first = mux.psi_packet(PAT_PID, &[1, 2, 3]);
        let second = mux.psi_packet(PAT_PID, &[1, 2, 3]);
        assert_eq!(first[3] & 0x0f, 0);
        assert_eq!(second[3] & 0x0f, 1);
    }

    #[test]
    fn small_pes_payload_is_padded_with_an_adaptation_field() {
        let mut mux = TsMuxer::new();
        let packets = mux.write_pes(StreamKind::Video, 9000, None, Some(9000), &[0xaa; 10]);
        assert_eq!(packets.len() % PACKET_SIZE, 0);
        assert_eq!(packets[0], SYNC_BYTE);
        assert_eq!(packets[3] & 0x30, 0x30); // adaptation + payload present
    }

    #[test]
    fn large_pes_payload_spans_multiple_packets() {
        let mut mux = TsMuxer::new();
        let payload = vec![0x11u8; 1000];
        let packets = mux.write_pes(StreamKind::Audio, 1000, None, None, &payload);
        assert!(packets.len() > PACKET_SIZE);
        assert_eq!(packets.len() % PACKET_SIZE, 0);
    }

    #[test]
    fn audio_only_program_uses_the_audio_pid_for_pcr() {
        let mut mux = TsMuxer::with_program(false, Some(AudioCodec::Mp3));
        let tables = mux.program_tables();
        assert_eq!(tables.len(), PACKET_SIZE * 2);
        // Spot-check: the PMT section encodes stream_type 0x04 (MP3) somewhere
        // in its payload rather than 0x1b (H.264) or 0x0f (AAC).
        let pmt_payload = &tables[PACKET_SIZE + 5..];
        assert!(pmt_payload.contains(&STREAM_TYPE_MP3));
        assert!(!pmt_payload.contains(&STREAM_TYPE_H264));
    }

    #[test]
    fn pcr_is_carried_only_on_the_first_packet_of_a_keyframe() {
        let mut mux = TsMuxer::new();
        let payload = vec![0x22u8; 500];
        let packets = mux.write_pes(StreamKind::Video, 5000, Some(4900), Some(5000), &payload);
        let first_has_adaptation = packets[3] & 0x20 != 0;
        assert!(first_has_adaptation);
    }
}
