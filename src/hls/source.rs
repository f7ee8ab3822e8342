//! Orchestrates one stream's FLV-to-TS repackaging: demux → parse →
//! mux → cut. One `Source` is attached to a publisher's fan-out as just
//! another writer; its worker task owns all mutable state and never
//! shares it, so the only cross-task surface is the bounded queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ripplecast_codec::{AacParser, AvcParser};
use ripplecast_mux::{AudioCodec, StreamKind, TsMuxer};
use ripplecast_protocol::{Packet, PacketHeader, AudioHeader, VideoHeader, SOUND_AAC, SOUND_MP3, VIDEO_H264};

use crate::byteio::BufferPool;
use crate::config::HlsConfig;
use crate::rtmp::vir::{self, VirReader, VirWriter, HLS_QUEUE_CAPACITY};

use super::align::Aligner;
use super::audio::AudioAggregator;
use super::error::HlsError;
use super::segment::{Item, SegmentCache};

/// Tracks the in-progress segment's span, used to decide when a
/// key-frame is eligible to start a cut.
#[derive(Debug, Default)]
struct SegmentStatus {
    video_seen: bool,
    first_ts: Option<u32>,
    last_ts: u32,
}

impl SegmentStatus {
    fn update(&mut self, ts: u32, is_video: bool) {
        if self.first_ts.is_none() {
            self.first_ts = Some(ts);
        }
        self.last_ts = ts;
        self.video_seen |= is_video;
    }

    fn duration(&self) -> Duration {
        match self.first_ts {
            Some(first) => Duration::from_millis(self.last_ts.saturating_sub(first) as u64),
            None => Duration::ZERO,
        }
    }
}

/// The publisher's track set as observed so far, carried across segment
/// cuts so every `TsMuxer` built for this stream declares the same PMT
/// regardless of which segment happens to be first to see a given track.
/// Defaults to the common video+AAC case until proven otherwise, since
/// the very first segment may be cut before either track has appeared.
#[derive(Debug, Clone, Copy)]
struct Composition {
    has_video: bool,
    audio_codec: Option<AudioCodec>,
}

impl Default for Composition {
    fn default() -> Self {
        Composition { has_video: true, audio_codec: Some(AudioCodec::Aac) }
    }
}

impl Composition {
    fn new_muxer(&self) -> TsMuxer {
        TsMuxer::with_program(self.has_video, self.audio_codec)
    }
}

/// One stream's repackaging pipeline. `write` is the only entry point
/// reachable from another task (the publisher's fan-out); everything
/// else runs on the worker task spawned by `spawn`.
pub struct Source {
    queue: VirWriter,
    closed: Arc<AtomicBool>,
}

impl Source {
    /// Obtains a fresh segment from `cache`, seeds it with PAT+PMT, and
    /// spawns the worker task that will drain the packet queue.
    pub fn spawn(label: impl Into<Arc<str>>, cache: Arc<SegmentCache>, config: HlsConfig) -> Source {
        let (queue_tx, queue_rx) = vir::channel(label, HLS_QUEUE_CAPACITY);
        let closed = Arc::new(AtomicBool::new(false));

        let worker = Worker::new(cache, config.min_segment_duration, queue_rx);
        tokio::spawn(worker.run());

        Source { queue: queue_tx, closed }
    }

    /// Non-blocking: queues `packet` for the worker, dropping it (with a
    /// log, handled by the queue itself) if the queue is full.
    pub fn write(&self, packet: Packet) -> Result<(), HlsError> {
        if !self.queue.alive() {
            return Err(HlsError::SourceClosed);
        }
        self.queue.write(packet);
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && self.queue.alive()
    }

    /// Idempotent. Closes the queue; the worker flushes and cuts the
    /// current segment once it drains what remains, then exits.
    pub fn close(&self) {
        self.queue.close();
        self.closed.store(true, Ordering::Release);
    }
}

struct Worker {
    cache: Arc<SegmentCache>,
    min_segment_duration: Duration,
    queue: VirReader,
    mux: TsMuxer,
    item: Arc<Item>,
    status: SegmentStatus,
    avc: AvcParser,
    aac: AacParser,
    aligner: Aligner,
    audio_agg: AudioAggregator,
    /// Scratch buffers for the per-frame Annex-B/ADTS conversion below;
    /// avoids a fresh allocation for every video and audio packet.
    scratch: BufferPool,
    composition: Composition,
}

impl Worker {
    fn new(cache: Arc<SegmentCache>, min_segment_duration: Duration, queue: VirReader) -> Self {
        let composition = Composition::default();
        let item = cache.new_item();
        let mut mux = composition.new_muxer();
        item.write(mux.program_tables());

        Worker {
            cache,
            min_segment_duration,
            queue,
            mux,
            item,
            status: SegmentStatus::default(),
            avc: AvcParser::new(),
            aac: AacParser::new(),
            aligner: Aligner::new(),
            audio_agg: AudioAggregator::new(),
            scratch: BufferPool::new(),
            composition,
        }
    }

    async fn run(mut self) {
        while let Some(packet) = self.queue.read().await {
            if let Err(err) = self.handle_packet(packet) {
                log::warn!("hls: dropping packet: {err}");
            }
        }
        self.finish();
    }

    fn handle_packet(&mut self, packet: Packet) -> Result<(), HlsError> {
        match packet.header {
            PacketHeader::Metadata => Ok(()),
            PacketHeader::Video(header) => self.handle_video(packet, header),
            PacketHeader::Audio(header) => self.handle_audio(packet, header),
        }
    }

    fn handle_video(&mut self, packet: Packet, header: VideoHeader) -> Result<(), HlsError> {
        if header.codec_id != VIDEO_H264 {
            return Err(HlsError::UnsupportedVideoCodec(header.codec_id));
        }

        self.composition.has_video = true;

        if header.is_seq {
            let mut sink = self.scratch.acquire(packet.data.len());
            let result = self.avc.parse(&packet.data, true, &mut sink);
            self.scratch.release(sink);
            result?;
            return Ok(());
        }

        // AVCPacketType==2 ("end of sequence"): a bare marker with no
        // sample body, nothing to mux.
        if packet.data.is_empty() {
            return Ok(());
        }

        self.status.update(packet.timestamp, true);

        let dts = packet.timestamp as u64 * 90;
        let pts = (dts as i64 + header.composition_time as i64 * 90).max(0) as u64;

        let mut annex_b = self.scratch.acquire(packet.data.len() + 32);
        let parsed = self.avc.parse(&packet.data, false, &mut annex_b);

        let pcr = header.is_key_frame.then_some(dts);
        if parsed.is_ok() {
            let ts_packets = self.mux.write_pes(StreamKind::Video, pts, Some(dts), pcr, &annex_b);
            self.item.write(ts_packets);
        }
        self.scratch.release(annex_b);
        parsed?;

        if header.is_key_frame && self.status.duration() >= self.min_segment_duration {
            self.cut_segment();
        }

        Ok(())
    }

    fn handle_audio(&mut self, packet: Packet, header: AudioHeader) -> Result<(), HlsError> {
        match header.sound_format {
            SOUND_AAC => self.handle_aac(packet, header),
            SOUND_MP3 => self.handle_mp3(packet),
            other => Err(HlsError::UnsupportedAudioFormat(other)),
        }
    }

    fn handle_aac(&mut self, packet: Packet, header: AudioHeader) -> Result<(), HlsError> {
        self.composition.audio_codec = Some(AudioCodec::Aac);

        if header.aac_packet_type == ripplecast_protocol::AAC_SEQUENCE_HEADER {
            self.aac.parse_sequence_header(&packet.data)?;
            return Ok(());
        }

        self.status.update(packet.timestamp, false);

        let sample_rate = self.aac.config().sample_rate.max(1);
        let inc = 90_000 * 1024 / sample_rate as u64;
        let dts = self.aligner.align(packet.timestamp as u64 * 90, inc);

        let mut adts = self.scratch.acquire(packet.data.len() + 7);
        let written = self.aac.write_adts(&packet.data, &mut adts);

        if written.is_ok() {
            if let Some((pts, frame)) = self.audio_agg.push(dts, &adts) {
                let ts_packets = self.mux.write_pes(StreamKind::Audio, pts, None, None, &frame);
                self.item.write(ts_packets);
            }
        }
        self.scratch.release(adts);
        written?;

        Ok(())
    }

    /// MP3 passthrough: one frame per PES, no ADTS wrapping and no
    /// aggregation (MP3 frames already stand alone).
    fn handle_mp3(&mut self, packet: Packet) -> Result<(), HlsError> {
        self.composition.audio_codec = Some(AudioCodec::Mp3);
        self.status.update(packet.timestamp, false);
        let dts = packet.timestamp as u64 * 90;
        let ts_packets = self.mux.write_pes(StreamKind::Audio, dts, None, None, &packet.data);
        self.item.write(ts_packets);
        Ok(())
    }

    fn flush_audio(&mut self) {
        if let Some((pts, frame)) = self.audio_agg.flush() {
            let ts_packets = self.mux.write_pes(StreamKind::Audio, pts, None, None, &frame);
            self.item.write(ts_packets);
        }
    }

    fn cut_segment(&mut self) {
        self.flush_audio();
        self.item.close(self.status.duration());

        self.status = SegmentStatus::default();
        self.mux = self.composition.new_muxer();
        self.item = self.cache.new_item();
        self.item.write(self.mux.program_tables());
    }

    fn finish(&mut self) {
        self.flush_audio();
        self.item.close(self.status.duration());
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use ripplecast_protocol::{PacketHeader, VideoHeader};

    use super::*;

    fn video_packet(ts: u32, is_key: bool, is_seq: bool, data: &[u8]) -> Packet {
        Packet {
            is_video: true,
            is_audio: false,
            is_metadata: false,
            timestamp: ts,
            stream_id: 1,
            header: PacketHeader::Video(VideoHeader {
                codec_id: VIDEO_H264,
                is_seq,
                is_key_frame: is_key,
                composition_time: 0,
            }),
            data: Bytes::copy_from_slice(data),
        }
    }

    fn sequence_header() -> Vec<u8> {
        let sps = [0x67, 0x01];
        let pps = [0x68, 0x01];
        let mut rec = vec![1, 0x64, 0, 0x1f, 0xff, 0xe1, 0, sps.len() as u8];
        rec.extend_from_slice(&sps);
        rec.push(1);
        rec.extend_from_slice(&[0, pps.len() as u8]);
        rec.extend_from_slice(&pps);
        rec
    }

    fn avcc_nalu(nal_type: u8, body: &[u8]) -> Vec<u8> {
        let mut nalu = vec![nal_type];
        nalu.extend_from_slice(body);
        let mut out = (nalu.len() as u32).to_be_bytes().to_vec();
        out.extend_from_slice(&nalu);
        out
    }

    fn new_worker() -> Worker {
        let cache = Arc::new(SegmentCache::new(10));
        let (_tx, rx) = vir::channel("test", 4);
        Worker::new(cache, Duration::from_secs(1), rx)
    }

    #[test]
    fn first_segment_begins_with_pat_and_pmt() {
        let worker = new_worker();
        let bytes = worker.item.bytes();
        assert_eq!(bytes.len(), ripplecast_mux::PACKET_SIZE * 2);
    }

    #[test]
    fn key_frame_before_min_duration_does_not_cut() {
        let mut worker = new_worker();
        worker.handle_packet(video_packet(0, true, true, &sequence_header())).unwrap();
        let idr = avcc_nalu(5, &[1, 2, 3]);
        worker.handle_packet(video_packet(0, true, false, &idr)).unwrap();
        let first_seq = worker.item.seq_num;
        worker.handle_packet(video_packet(800, true, false, &idr)).unwrap();
        assert_eq!(worker.item.seq_num, first_seq);
    }

    #[test]
    fn key_frame_past_min_duration_cuts_a_new_segment() {
        let mut worker = new_worker();
        worker.handle_packet(video_packet(0, true, true, &sequence_header())).unwrap();
        let idr = avcc_nalu(5, &[1, 2, 3]);
        worker.handle_packet(video_packet(0, true, false, &idr)).unwrap();
        let first_seq = worker.item.seq_num;
        worker.handle_packet(video_packet(1200, true, false, &idr)).unwrap();
        assert_ne!(worker.item.seq_num, first_seq);
    }

    #[test]
    fn non_h264_video_is_rejected() {
        let mut worker = new_worker();
        let packet = Packet {
            is_video: true,
            is_audio: false,
            is_metadata: false,
            timestamp: 0,
            stream_id: 1,
            header: PacketHeader::Video(VideoHeader {
                codec_id: 2,
                is_seq: false,
                is_key_frame: true,
                composition_time: 0,
            }),
            data: Bytes::from_static(&[0u8]),
        };
        assert!(matches!(worker.handle_packet(packet), Err(HlsError::UnsupportedVideoCodec(2))));
    }

    #[test]
    fn avc_end_of_sequence_marker_is_a_silent_no_op() {
        let mut worker = new_worker();
        let marker = video_packet(0, false, false, &[]);
        assert!(worker.handle_packet(marker).is_ok());
    }
}
