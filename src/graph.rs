use std::collections::{BTreeMap, VecDeque};

use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

use crate::audio_codec::AudioConverter;
use crate::caps;
use crate::codecs::CodecId;
use crate::media::{self, CodedFrame, Decoder, Encoder, MediaError, RawFrame};

/// Decoded frames held back to re-impose pts order under B-frame
/// reordering.
const VIDEO_REORDER_WINDOW: usize = 8;

/// Upper bound on consecutive `Again` results tolerated while draining a
/// backend that signals end-of-stream asynchronously.
const DRAIN_RETRY_LIMIT: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphState {
    Idle,
    DecoderInit,
    Converting,
    EncoderInit,
    Steady,
    Draining,
    Done,
}

/// The decode → convert → encode stage of a pipeline.
///
/// Decoder and encoder are built lazily: the decoder once the first
/// coded frame arrives (inline parameter sets may be needed), the
/// encoder once the first converted frame fixes the stream parameters.
/// Input timestamps are in the input clock; output timestamps are in the
/// output codec's clock.
pub struct MediaGraph {
    state: GraphState,
    codec_in: CodecId,
    codec_out: CodecId,
    input: RTCRtpCodecParameters,
    target: RTCRtpCodecCapability,
    recipe: Option<String>,

    decoder: Option<Box<dyn Decoder>>,
    encoder: Option<Box<dyn Encoder>>,
    converter: Option<AudioConverter>,
    converter_decided: bool,

    /// pts-ordered holdback buffer between decode and encode.
    reorder: BTreeMap<(i64, u64), RawFrame>,
    reorder_window: usize,
    reorder_seq: u64,

    ready: VecDeque<CodedFrame>,
    /// Out-of-band parameter sets prepended to the first coded frame.
    prepend: Option<Vec<u8>>,
    dropped: u64,
}

impl MediaGraph {
    pub fn new(
        input: RTCRtpCodecParameters,
        codec_in: CodecId,
        codec_out: CodecId,
        recipe: Option<String>,
    ) -> Self {
        let reorder_window = match codec_in.kind() {
            RTPCodecType::Video => VIDEO_REORDER_WINDOW,
            _ => 0,
        };
        let mut target = codec_out.capability();
        if target.channels == 0 && codec_out.kind() == RTPCodecType::Audio {
            target.channels = 1;
        }
        MediaGraph {
            state: GraphState::Idle,
            codec_in,
            codec_out,
            input,
            target,
            recipe,
            decoder: None,
            encoder: None,
            converter: None,
            converter_decided: false,
            reorder: BTreeMap::new(),
            reorder_window,
            reorder_seq: 0,
            ready: VecDeque::new(),
            prepend: None,
            dropped: 0,
        }
    }

    pub fn state(&self) -> GraphState {
        self.state
    }

    /// Frames dropped as undecodable or unencodable.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Submits one coded input frame and advances the graph.
    pub fn push(&mut self, frame: CodedFrame) -> Result<(), MediaError> {
        if matches!(self.state, GraphState::Draining | GraphState::Done) {
            return Err(MediaError::Eof);
        }

        if self.decoder.is_none() {
            self.state = GraphState::DecoderInit;
            self.prepend =
                caps::out_of_band_parameter_sets(self.codec_in, &self.input.capability.sdp_fmtp_line);
            self.decoder = Some(media::new_decoder(self.codec_in, &self.input)?);
            self.state = GraphState::Converting;
        }

        let frame = match self.prepend.take() {
            Some(mut head) => {
                head.extend_from_slice(&frame.data);
                CodedFrame {
                    data: head.into(),
                    ..frame
                }
            }
            None => frame,
        };

        let decoder = self.decoder.as_mut().expect("decoder initialized above");
        match decoder.send(Some(&frame)) {
            Ok(()) => {}
            Err(MediaError::InvalidData) => {
                self.dropped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.collect_decoded(false)
    }

    /// Pulls the next encoded output frame. `Again` means more input is
    /// required; `Eof` follows a completed drain.
    pub fn pull(&mut self) -> Result<CodedFrame, MediaError> {
        match self.ready.pop_front() {
            Some(frame) => Ok(frame),
            None if self.state == GraphState::Done => Err(MediaError::Eof),
            None => Err(MediaError::Again),
        }
    }

    /// Flushes the whole graph: decoder, reorder buffer, converter, then
    /// encoder. After this, `pull` yields the remaining frames and `Eof`.
    pub fn drain(&mut self) -> Result<(), MediaError> {
        if matches!(self.state, GraphState::Done) {
            return Ok(());
        }
        self.state = GraphState::Draining;

        if let Some(decoder) = self.decoder.as_mut() {
            decoder.send(None)?;
            self.collect_decoded(true)?;
        }

        // Spill the reorder holdback in pts order.
        while let Some((_, frame)) = self.reorder.pop_first() {
            self.encode_one(frame)?;
        }

        if let Some(converter) = self.converter.as_mut() {
            if let Some(frame) = converter.flush() {
                self.encode_converted(RawFrame::Audio(frame))?;
            }
        }

        if let Some(encoder) = self.encoder.as_mut() {
            encoder.send(None)?;
            self.collect_encoded(true)?;
        }

        self.state = GraphState::Done;
        Ok(())
    }

    fn collect_decoded(&mut self, draining: bool) -> Result<(), MediaError> {
        let mut retries = 0;
        loop {
            let result = match self.decoder.as_mut() {
                Some(decoder) => decoder.receive(),
                None => return Ok(()),
            };
            match result {
                Ok(raw) => {
                    retries = 0;
                    self.reorder
                        .insert((raw.pts(), self.reorder_seq), raw);
                    self.reorder_seq += 1;
                    while self.reorder.len() > self.reorder_window {
                        let Some((_, frame)) = self.reorder.pop_first() else {
                            break;
                        };
                        self.encode_one(frame)?;
                    }
                }
                Err(MediaError::Again) => {
                    if !draining {
                        return Ok(());
                    }
                    retries += 1;
                    if retries > DRAIN_RETRY_LIMIT {
                        return Ok(());
                    }
                }
                Err(MediaError::Eof) => return Ok(()),
                Err(MediaError::InvalidData) => {
                    self.dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn encode_one(&mut self, raw: RawFrame) -> Result<(), MediaError> {
        let converted = match raw {
            RawFrame::Video(mut frame) => {
                // Pixel format conversion is part of the encoder chain;
                // here only the clock changes.
                frame.pts = rescale(
                    frame.pts,
                    self.target.clock_rate,
                    self.input.capability.clock_rate,
                );
                RawFrame::Video(frame)
            }
            RawFrame::Audio(frame) => {
                if !self.converter_decided {
                    self.converter_decided = true;
                    let enc_rate = self.codec_out.encoder_sample_rate();
                    let enc_channels = self.target.channels.max(1);
                    let in_clock = self.input.capability.clock_rate;
                    if frame.rate != enc_rate
                        || frame.channels != enc_channels
                        || in_clock != frame.rate
                    {
                        self.converter = Some(AudioConverter::new(in_clock, enc_rate, enc_channels));
                    }
                }
                match self.converter.as_mut() {
                    Some(converter) => match converter.push(&frame) {
                        Some(converted) => RawFrame::Audio(converted),
                        None => return Ok(()),
                    },
                    None => RawFrame::Audio(frame),
                }
            }
        };
        self.encode_converted(converted)
    }

    fn encode_converted(&mut self, raw: RawFrame) -> Result<(), MediaError> {
        if self.encoder.is_none() {
            self.state = GraphState::EncoderInit;
            self.encoder = Some(media::new_encoder(
                self.codec_out,
                &self.target,
                self.recipe.as_deref(),
                &raw,
            )?);
            self.state = GraphState::Steady;
        }
        let encoder = self.encoder.as_mut().expect("encoder initialized above");
        match encoder.send(Some(&raw)) {
            Ok(()) => {}
            Err(MediaError::InvalidData) => {
                self.dropped += 1;
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.collect_encoded(false)
    }

    fn collect_encoded(&mut self, draining: bool) -> Result<(), MediaError> {
        let mut retries = 0;
        loop {
            let result = match self.encoder.as_mut() {
                Some(encoder) => encoder.receive(),
                None => return Ok(()),
            };
            match result {
                Ok(mut frame) => {
                    retries = 0;
                    if self.codec_out.kind() == RTPCodecType::Audio {
                        // Sample units to wire clock; differs for G.722.
                        let enc_rate = self.codec_out.encoder_sample_rate();
                        let out_clock = self.target.clock_rate;
                        if enc_rate != out_clock {
                            frame.pts = rescale(frame.pts, out_clock, enc_rate);
                            frame.duration =
                                frame.duration.map(|d| rescale(d, out_clock, enc_rate));
                        }
                    }
                    self.ready.push_back(frame);
                }
                Err(MediaError::Again) => {
                    if !draining {
                        return Ok(());
                    }
                    retries += 1;
                    if retries > DRAIN_RETRY_LIMIT {
                        return Ok(());
                    }
                }
                Err(MediaError::Eof) => return Ok(()),
                Err(MediaError::InvalidData) => {
                    self.dropped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn rescale(value: i64, num: u32, den: u32) -> i64 {
    if den == 0 {
        return value;
    }
    (value as i128 * num as i128 / den as i128) as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn pcmu_params() -> RTCRtpCodecParameters {
        CodecId::Pcmu.output_parameters()
    }

    fn pcmu_frame(pts: i64, len: usize) -> CodedFrame {
        CodedFrame::new(Bytes::from(vec![0x55u8; len]), pts)
    }

    #[test]
    fn test_g711_transcode_counts_match() {
        let mut graph = MediaGraph::new(pcmu_params(), CodecId::Pcmu, CodecId::Pcma, None);
        assert_eq!(graph.state(), GraphState::Idle);

        for i in 0..50 {
            graph.push(pcmu_frame(i * 160, 160)).unwrap();
        }
        assert_eq!(graph.state(), GraphState::Steady);

        let mut frames = vec![];
        while let Ok(frame) = graph.pull() {
            frames.push(frame);
        }
        graph.drain().unwrap();
        loop {
            match graph.pull() {
                Ok(frame) => frames.push(frame),
                Err(MediaError::Eof) => break,
                Err(e) => panic!("unexpected {:?}", e),
            }
        }

        // Drain completeness: one output frame per input frame.
        assert_eq!(frames.len(), 50);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.pts, i as i64 * 160);
            assert_eq!(frame.data.len(), 160);
        }
    }

    #[test]
    fn test_pts_monotonic_after_reorder_window() {
        let mut graph = MediaGraph::new(pcmu_params(), CodecId::Pcmu, CodecId::Pcma, None);
        // Audio uses a zero-length window, so order is preserved as-is.
        graph.push(pcmu_frame(0, 160)).unwrap();
        graph.push(pcmu_frame(160, 160)).unwrap();
        let a = graph.pull().unwrap();
        let b = graph.pull().unwrap();
        assert!(a.pts < b.pts);
    }

    #[test]
    fn test_push_after_drain_rejected() {
        let mut graph = MediaGraph::new(pcmu_params(), CodecId::Pcmu, CodecId::Pcma, None);
        graph.push(pcmu_frame(0, 160)).unwrap();
        graph.drain().unwrap();
        assert!(matches!(
            graph.push(pcmu_frame(160, 160)),
            Err(MediaError::Eof)
        ));
        assert_eq!(graph.state(), GraphState::Done);
    }

    #[test]
    fn test_pcmu_to_opus_resamples() {
        let mut graph = MediaGraph::new(pcmu_params(), CodecId::Pcmu, CodecId::Opus, None);
        // 100 frames of 20 ms each: two seconds of audio.
        for i in 0..100 {
            graph.push(pcmu_frame(i * 160, 160)).unwrap();
        }
        graph.drain().unwrap();

        let mut frames = vec![];
        loop {
            match graph.pull() {
                Ok(frame) => frames.push(frame),
                Err(MediaError::Eof) => break,
                Err(e) => panic!("unexpected {:?}", e),
            }
        }
        // 2 s of 20 ms Opus frames, allowing one frame of padding slack.
        assert!(frames.len() >= 99 && frames.len() <= 101, "{}", frames.len());
        // Output pts are in the 48 kHz clock, 960 units apart.
        assert_eq!(frames[1].pts - frames[0].pts, 960);
        for frame in &frames {
            assert!(!frame.data.is_empty());
        }
    }
}
