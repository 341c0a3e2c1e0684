use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, warn};
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use crate::codecs::CodecId;
use crate::depayload::{depayloader_for, Depayloaded};
use crate::error::TranscodeError;
use crate::graph::MediaGraph;
use crate::jitter::JitterBuffer;
use crate::media::CodedFrame;
use crate::metrics::{
    TRANSCODER_KEYFRAME_REQUESTS_TOTAL, TRANSCODER_PACKETS_DROPPED_TOTAL,
    TRANSCODER_PACKETS_TOTAL,
};
use crate::packetizer::{Packetizer, DEFAULT_MTU};
use crate::payload::payloader_for;
use crate::timestamp::TimestampMapper;
use crate::{caps, jitter};

/// Bounded depth of the inter-stage queues.
const STAGE_QUEUE_DEPTH: usize = 16;
const OUT_QUEUE_DEPTH: usize = 64;

/// Upper bound on the close-time drain wait, per stage task.
const DRAIN_WAIT: Duration = Duration::from_secs(5);

/// Pipeline lifecycle. `Provisioning` until the graph accepts its first
/// frame, `Negotiating` until the first encoded frame fixes the output
/// parameters, then `Running`; close moves through `Draining` to
/// `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PipelineState {
    Provisioning = 0,
    Negotiating = 1,
    Running = 2,
    Draining = 3,
    Closed = 4,
}

impl PipelineState {
    fn from_u8(value: u8) -> PipelineState {
        match value {
            0 => PipelineState::Provisioning,
            1 => PipelineState::Negotiating,
            2 => PipelineState::Running,
            3 => PipelineState::Draining,
            _ => PipelineState::Closed,
        }
    }
}

/// Fully determined output parameters, available once the first encoded
/// frame exists.
#[derive(Debug, Clone)]
pub struct NegotiatedOutput {
    pub params: RTCRtpCodecParameters,
    pub ssrc: u32,
}

type ForceKeyUnitFn = Box<dyn Fn() + Send + Sync>;

struct Shared {
    jitter: Mutex<JitterBuffer>,
    notify: Notify,
    closed: AtomicBool,
    state: AtomicU8,
    force_key: Mutex<Option<ForceKeyUnitFn>>,
    dropped: AtomicU64,
}

impl Shared {
    fn set_state(&self, state: PipelineState) {
        self.state.store(state as u8, Ordering::SeqCst);
    }

    fn transition(&self, from: PipelineState, to: PipelineState) {
        let _ = self.state.compare_exchange(
            from as u8,
            to as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    fn request_key_unit(&self) {
        TRANSCODER_KEYFRAME_REQUESTS_TOTAL.inc();
        let cb = self.force_key.lock().expect("force-key lock poisoned");
        if let Some(cb) = cb.as_ref() {
            cb();
        }
    }
}

/// A live transcoding pipeline for one track:
/// jitter buffer → depayloader → media graph → packetizer.
///
/// Three tasks cooperate over bounded queues: an ingest task draining
/// the jitter buffer into the depayloader, a blocking media-graph task,
/// and an egress task feeding the packetizer. `write_rtp` never blocks;
/// `read_rtp` waits for output or end of stream.
pub struct Transcoder {
    codec_in: CodecId,
    codec_out: CodecId,
    shared: Arc<Shared>,
    out_rx: tokio::sync::Mutex<mpsc::Receiver<Packet>>,
    negotiated_rx: watch::Receiver<Option<NegotiatedOutput>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Transcoder {
    /// Builds the pipeline and starts its stage tasks. The media graph
    /// itself initializes lazily once the first frame arrives.
    pub fn new(
        input: RTCRtpCodecParameters,
        codec_out: CodecId,
        recipe: Option<String>,
    ) -> Result<Arc<Transcoder>, TranscodeError> {
        let codec_in = CodecId::from_mime_type(&input.capability.mime_type)?;
        if !codec_out.is_transcode_target() {
            return Err(TranscodeError::UnsupportedCodec(
                codec_out.mime_type().to_string(),
            ));
        }

        let shared = Arc::new(Shared {
            jitter: Mutex::new(JitterBuffer::new(jitter::DEFAULT_CAPACITY)),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            state: AtomicU8::new(PipelineState::Provisioning as u8),
            force_key: Mutex::new(None),
            dropped: AtomicU64::new(0),
        });

        let (graph_tx, graph_rx) = mpsc::channel::<CodedFrame>(STAGE_QUEUE_DEPTH);
        let (enc_tx, enc_rx) = mpsc::channel::<CodedFrame>(STAGE_QUEUE_DEPTH);
        let (out_tx, out_rx) = mpsc::channel::<Packet>(OUT_QUEUE_DEPTH);
        let (negotiated_tx, negotiated_rx) = watch::channel(None);

        let graph = MediaGraph::new(input.clone(), codec_in, codec_out, recipe);

        let ingest = tokio::spawn(run_ingest(shared.clone(), codec_in, graph_tx));
        let media = tokio::task::spawn_blocking({
            let shared = shared.clone();
            move || run_graph(shared, graph, graph_rx, enc_tx)
        });
        let egress = tokio::spawn(run_egress(
            shared.clone(),
            codec_out,
            enc_rx,
            negotiated_tx,
            out_tx,
        ));

        Ok(Arc::new(Transcoder {
            codec_in,
            codec_out,
            shared,
            out_rx: tokio::sync::Mutex::new(out_rx),
            negotiated_rx,
            tasks: Mutex::new(vec![ingest, media, egress]),
        }))
    }

    pub fn input_codec(&self) -> CodecId {
        self.codec_in
    }

    pub fn output_codec(&self) -> CodecId {
        self.codec_out
    }

    pub fn state(&self) -> PipelineState {
        PipelineState::from_u8(self.shared.state.load(Ordering::SeqCst))
    }

    /// Packets dropped by the ingress side (eviction, corrupt payloads).
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Non-blocking ingress. When the jitter buffer is full the oldest
    /// packet is evicted and accounted as back-pressure loss.
    pub fn write_rtp(&self, packet: &Packet) -> Result<(), TranscodeError> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(TranscodeError::Closed);
        }
        let evicted = {
            let mut jitter = self.shared.jitter.lock().expect("jitter lock poisoned");
            jitter.push(packet.clone())
        };
        if evicted {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
            TRANSCODER_PACKETS_DROPPED_TOTAL
                .with_label_values(&["backpressure"])
                .inc();
            warn!(codec = ?self.codec_in, "jitter buffer full, oldest packet dropped");
        }
        self.shared.notify.notify_one();
        Ok(())
    }

    /// Waits for the next transcoded RTP packet; `None` is end of
    /// stream.
    pub async fn read_rtp(&self) -> Option<Packet> {
        self.out_rx.lock().await.recv().await
    }

    /// Negotiated output parameters. Blocks until the first encoded
    /// frame has been produced: codec-private fmtp (H.26x parameter
    /// sets) does not exist before that.
    pub async fn codec(&self) -> Result<RTCRtpCodecParameters, TranscodeError> {
        Ok(self.negotiated().await?.params)
    }

    /// The output track's SSRC, available with the same latch as
    /// [`codec`](Self::codec).
    pub async fn ssrc(&self) -> Result<u32, TranscodeError> {
        Ok(self.negotiated().await?.ssrc)
    }

    async fn negotiated(&self) -> Result<NegotiatedOutput, TranscodeError> {
        let mut rx = self.negotiated_rx.clone();
        loop {
            if let Some(out) = rx.borrow().as_ref() {
                return Ok(out.clone());
            }
            rx.changed().await.map_err(|_| TranscodeError::Closed)?;
        }
    }

    /// Registers the callback invoked whenever the pipeline needs a
    /// fresh keyframe from upstream (gap, discontinuity, corrupt input).
    pub fn on_upstream_force_key_unit(&self, callback: impl Fn() + Send + Sync + 'static) {
        let mut slot = self.shared.force_key.lock().expect("force-key lock poisoned");
        *slot = Some(Box::new(callback));
    }

    /// Stops ingress, drains the graph, and waits (bounded) for the
    /// remaining packets to be emitted. Subsequent `read_rtp` calls
    /// observe end of stream.
    pub async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.set_state(PipelineState::Draining);
        self.shared.notify.notify_one();

        let handles: Vec<_> = {
            let mut tasks = self.tasks.lock().expect("task lock poisoned");
            tasks.drain(..).collect()
        };
        for handle in handles {
            if tokio::time::timeout(DRAIN_WAIT, handle).await.is_err() {
                warn!(codec = ?self.codec_out, "pipeline drain timed out");
            }
        }
        self.shared.set_state(PipelineState::Closed);
    }
}

impl Drop for Transcoder {
    fn drop(&mut self) {
        // Unblock the ingest task so the stage chain can wind down.
        self.shared.closed.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

/// Ingest stage: jitter buffer → timestamp mapping → depayloader →
/// graph queue.
async fn run_ingest(shared: Arc<Shared>, codec_in: CodecId, graph_tx: mpsc::Sender<CodedFrame>) {
    let mut depayloader = depayloader_for(codec_in);
    let mut mapper = TimestampMapper::new();

    'outer: loop {
        loop {
            let emitted = {
                let mut jitter = shared.jitter.lock().expect("jitter lock poisoned");
                jitter.pop()
            };
            let Some(emitted) = emitted else { break };

            if emitted.gap {
                // Lost packets are never filled; restart frame assembly
                // and ask upstream for a fresh keyframe.
                depayloader.reset();
                shared.request_key_unit();
            }

            let ts = emitted.packet.header.timestamp;
            let pts = match mapper.map(ts) {
                Ok(pts) => pts,
                Err(_) => {
                    debug!("timestamp discontinuity, rebasing");
                    mapper.rebase(ts);
                    shared.request_key_unit();
                    match mapper.map(ts) {
                        Ok(pts) => pts,
                        Err(_) => continue,
                    }
                }
            };

            match depayloader.push(&emitted.packet) {
                Depayloaded::Frames(frames) => {
                    for data in frames {
                        if graph_tx.send(CodedFrame::new(data, pts)).await.is_err() {
                            break 'outer;
                        }
                    }
                }
                Depayloaded::NeedMore => {}
                Depayloaded::Corrupt => {
                    shared.dropped.fetch_add(1, Ordering::Relaxed);
                    TRANSCODER_PACKETS_DROPPED_TOTAL
                        .with_label_values(&["corrupt"])
                        .inc();
                }
            }
        }

        if shared.closed.load(Ordering::SeqCst) {
            // Close drops whatever is still queued at the ingress.
            shared.jitter.lock().expect("jitter lock poisoned").clear();
            break;
        }
        shared.notify.notified().await;
    }
}

/// Media-graph stage, on the blocking pool: decode, convert, encode.
fn run_graph(
    shared: Arc<Shared>,
    mut graph: MediaGraph,
    mut graph_rx: mpsc::Receiver<CodedFrame>,
    enc_tx: mpsc::Sender<CodedFrame>,
) {
    while let Some(frame) = graph_rx.blocking_recv() {
        shared.transition(PipelineState::Provisioning, PipelineState::Negotiating);
        if let Err(e) = graph.push(frame) {
            error!(error = %e, "media graph failed");
            return;
        }
        if !pump_graph(&mut graph, &enc_tx) {
            return;
        }
    }

    if let Err(e) = graph.drain() {
        warn!(error = %e, "media graph drain failed");
    }
    pump_graph(&mut graph, &enc_tx);
}

fn pump_graph(graph: &mut MediaGraph, enc_tx: &mpsc::Sender<CodedFrame>) -> bool {
    loop {
        match graph.pull() {
            Ok(frame) => {
                if enc_tx.blocking_send(frame).is_err() {
                    return false;
                }
            }
            Err(crate::media::MediaError::Again) | Err(crate::media::MediaError::Eof) => {
                return true
            }
            Err(e) => {
                error!(error = %e, "media graph output failed");
                return false;
            }
        }
    }
}

/// Egress stage: packetize encoded frames, resolve the negotiation
/// latch on the first one.
async fn run_egress(
    shared: Arc<Shared>,
    codec_out: CodecId,
    mut enc_rx: mpsc::Receiver<CodedFrame>,
    negotiated_tx: watch::Sender<Option<NegotiatedOutput>>,
    out_tx: mpsc::Sender<Packet>,
) {
    let media_type = match codec_out.kind() {
        webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video => "video",
        _ => "audio",
    };
    let mut packetizer: Option<Packetizer> = None;

    while let Some(frame) = enc_rx.recv().await {
        if packetizer.is_none() {
            let params = caps::negotiated_parameters(codec_out, &frame);
            let p = Packetizer::new(DEFAULT_MTU, params.payload_type, payloader_for(codec_out));
            let _ = negotiated_tx.send(Some(NegotiatedOutput {
                params,
                ssrc: p.ssrc(),
            }));
            shared.transition(PipelineState::Negotiating, PipelineState::Running);
            packetizer = Some(p);
        }
        let Some(packetizer) = packetizer.as_mut() else {
            continue;
        };

        match packetizer.packetize(&frame) {
            Ok(packets) => {
                for packet in packets {
                    TRANSCODER_PACKETS_TOTAL.with_label_values(&[media_type]).inc();
                    if out_tx.send(packet).await.is_err() {
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(error = %e, "packetization failed, frame dropped");
                TRANSCODER_PACKETS_DROPPED_TOTAL
                    .with_label_values(&["packetize"])
                    .inc();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pcmu_input() -> RTCRtpCodecParameters {
        CodecId::Pcmu.output_parameters()
    }

    fn pcmu_packet(seq: u16, ts: u32) -> Packet {
        let mut p = Packet::default();
        p.header.payload_type = 0;
        p.header.sequence_number = seq;
        p.header.timestamp = ts;
        p.header.ssrc = 0x1234;
        p.payload = Bytes::from(vec![0x55u8; 160]);
        p
    }

    async fn collect_output(t: &Arc<Transcoder>) -> Vec<Packet> {
        let mut out = vec![];
        while let Some(p) = t.read_rtp().await {
            out.push(p);
        }
        out
    }

    #[tokio::test]
    async fn test_pcmu_to_pcma_stream_properties() {
        let t = Transcoder::new(pcmu_input(), CodecId::Pcma, None).unwrap();
        assert_eq!(t.state(), PipelineState::Provisioning);

        for i in 0..50u32 {
            t.write_rtp(&pcmu_packet(i as u16, i * 160)).unwrap();
            // Give the ingest task room to keep the jitter window small.
            tokio::task::yield_now().await;
        }

        let params = t.codec().await.unwrap();
        assert_eq!(params.capability.mime_type, "audio/PCMA");
        assert_eq!(params.payload_type, 8);
        let ssrc = t.ssrc().await.unwrap();

        // Let the ingest task finish the tail before closing.
        tokio::time::sleep(Duration::from_millis(200)).await;
        t.close().await;
        assert_eq!(t.state(), PipelineState::Closed);
        let packets = collect_output(&t).await;

        assert_eq!(packets.len(), 50);
        let mut expected_seq = packets[0].header.sequence_number;
        for (i, p) in packets.iter().enumerate() {
            assert_eq!(p.header.sequence_number, expected_seq);
            expected_seq = expected_seq.wrapping_add(1);
            assert_eq!(p.header.payload_type, 8);
            assert_eq!(p.header.ssrc, ssrc);
            assert!(p.header.marker, "packet {} missing marker", i);
            assert!(p.payload.len() + 12 <= DEFAULT_MTU);
        }
        // Timestamps advance by the packetization interval.
        for pair in packets.windows(2) {
            assert_eq!(
                pair[1].header.timestamp.wrapping_sub(pair[0].header.timestamp),
                160
            );
        }
    }

    #[tokio::test]
    async fn test_reordered_input_matches_ordered_run() {
        let ordered = Transcoder::new(pcmu_input(), CodecId::Pcma, None).unwrap();
        for i in 0..50u32 {
            ordered.write_rtp(&pcmu_packet(i as u16, i * 160)).unwrap();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        ordered.close().await;
        let reference = collect_output(&ordered).await;

        let shuffled = Transcoder::new(pcmu_input(), CodecId::Pcma, None).unwrap();
        // Permute within a window of 5.
        let mut seqs: Vec<u32> = (0..50).collect();
        for chunk in seqs.chunks_mut(5) {
            chunk.reverse();
        }
        for &i in &seqs {
            shuffled.write_rtp(&pcmu_packet(i as u16, i * 160)).unwrap();
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
        shuffled.close().await;
        let permuted = collect_output(&shuffled).await;

        assert_eq!(reference.len(), permuted.len());
        for (a, b) in reference.iter().zip(permuted.iter()) {
            assert_eq!(a.payload, b.payload);
        }
    }

    #[tokio::test]
    async fn test_write_after_close_rejected() {
        let t = Transcoder::new(pcmu_input(), CodecId::Pcma, None).unwrap();
        t.write_rtp(&pcmu_packet(0, 0)).unwrap();
        t.close().await;
        assert!(matches!(
            t.write_rtp(&pcmu_packet(1, 160)),
            Err(TranscodeError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_force_key_unit_fired_once_per_gap() {
        let t = Transcoder::new(pcmu_input(), CodecId::Pcma, None).unwrap();
        let fired = Arc::new(AtomicU64::new(0));
        let fired_cb = fired.clone();
        t.on_upstream_force_key_unit(move || {
            fired_cb.fetch_add(1, Ordering::SeqCst);
        });

        // Establish flow first, then lose 13..=15; the window must fill,
        // force-emit, and request exactly one keyframe for the gap.
        for i in 0..13u32 {
            t.write_rtp(&pcmu_packet(i as u16, i * 160)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for i in 16..26u32 {
            t.write_rtp(&pcmu_packet(i as u16, i * 160)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        t.close().await;
    }

    #[tokio::test]
    async fn test_unsupported_input_codec_rejected() {
        let mut input = pcmu_input();
        input.capability.mime_type = "audio/FLAC".to_string();
        assert!(matches!(
            Transcoder::new(input, CodecId::Opus, None),
            Err(TranscodeError::UnsupportedCodec(_))
        ));
    }

    #[tokio::test]
    async fn test_av1_not_a_transcode_target() {
        let input = CodecId::Vp8.output_parameters();
        assert!(matches!(
            Transcoder::new(input, CodecId::Av1, None),
            Err(TranscodeError::UnsupportedCodec(_))
        ));
    }
}
