use std::collections::VecDeque;

use audiopus::{Application, Channels, SampleRate};
use bytes::Bytes;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};

use crate::media::{AudioFrame, CodedFrame, Decoder, Encoder, MediaError, RawFrame};

/// Opus frame length the encoder emits: 20 ms at 48 kHz.
const OPUS_FRAME_SAMPLES: usize = 960;
/// Upper bound for one decoded Opus frame: 120 ms at 48 kHz, stereo.
const OPUS_MAX_FRAME_SAMPLES: usize = 5760 * 2;
const OPUS_MAX_PACKET: usize = 4000;

fn opus_channels(channels: u16) -> Result<Channels, String> {
    match channels {
        1 => Ok(Channels::Mono),
        2 => Ok(Channels::Stereo),
        other => Err(format!("unsupported opus channel count {}", other)),
    }
}

/// Native Opus decoder. Produces 48 kHz interleaved S16 frames with
/// passthrough timestamps.
pub struct OpusDecoder {
    decoder: audiopus::coder::Decoder,
    channels: u16,
    ready: VecDeque<RawFrame>,
    draining: bool,
}

impl OpusDecoder {
    pub fn new(params: &RTCRtpCodecParameters) -> Result<Self, MediaError> {
        let channels = if params.capability.channels == 0 {
            2
        } else {
            params.capability.channels
        };
        let decoder = audiopus::coder::Decoder::new(
            SampleRate::Hz48000,
            opus_channels(channels).map_err(MediaError::DecoderInit)?,
        )
        .map_err(|e| MediaError::DecoderInit(format!("opus: {:?}", e)))?;
        Ok(OpusDecoder {
            decoder,
            channels,
            ready: VecDeque::new(),
            draining: false,
        })
    }
}

impl Decoder for OpusDecoder {
    fn send(&mut self, frame: Option<&CodedFrame>) -> Result<(), MediaError> {
        let Some(frame) = frame else {
            self.draining = true;
            return Ok(());
        };
        let mut pcm = vec![0i16; OPUS_MAX_FRAME_SAMPLES];
        let per_channel = self
            .decoder
            .decode(Some(&frame.data[..]), &mut pcm[..], false)
            .map_err(|_| MediaError::InvalidData)?;
        pcm.truncate(per_channel * self.channels as usize);
        self.ready.push_back(RawFrame::Audio(AudioFrame {
            pts: frame.pts,
            rate: 48_000,
            channels: self.channels,
            samples: pcm,
        }));
        Ok(())
    }

    fn receive(&mut self) -> Result<RawFrame, MediaError> {
        match self.ready.pop_front() {
            Some(frame) => Ok(frame),
            None if self.draining => Err(MediaError::Eof),
            None => Err(MediaError::Again),
        }
    }
}

/// Native Opus encoder. Buffers converted input into 20 ms frames;
/// timestamps advance by exactly one frame of samples.
pub struct OpusEncoder {
    encoder: audiopus::coder::Encoder,
    channels: u16,
    fifo: Vec<i16>,
    next_pts: Option<i64>,
    ready: VecDeque<CodedFrame>,
    draining: bool,
}

impl OpusEncoder {
    pub fn new(target: &RTCRtpCodecCapability, model: &RawFrame) -> Result<Self, MediaError> {
        let RawFrame::Audio(model) = model else {
            return Err(MediaError::EncoderInit(
                "opus encoder requires audio input".to_string(),
            ));
        };
        if model.rate != 48_000 {
            return Err(MediaError::EncoderInit(format!(
                "opus encoder requires 48 kHz input, got {}",
                model.rate
            )));
        }
        let channels = if target.channels == 0 { 2 } else { target.channels };
        let mut encoder = audiopus::coder::Encoder::new(
            SampleRate::Hz48000,
            opus_channels(channels).map_err(MediaError::EncoderInit)?,
            Application::Audio,
        )
        .map_err(|e| MediaError::EncoderInit(format!("opus: {:?}", e)))?;
        encoder
            .set_inband_fec(true)
            .map_err(|e| MediaError::EncoderInit(format!("opus fec: {:?}", e)))?;
        Ok(OpusEncoder {
            encoder,
            channels,
            fifo: Vec::new(),
            next_pts: None,
            ready: VecDeque::new(),
            draining: false,
        })
    }

    fn encode_buffered(&mut self, pad_tail: bool) -> Result<(), MediaError> {
        let frame_len = OPUS_FRAME_SAMPLES * self.channels as usize;
        if pad_tail && !self.fifo.is_empty() {
            self.fifo.resize(self.fifo.len().div_ceil(frame_len) * frame_len, 0);
        }
        while self.fifo.len() >= frame_len {
            let chunk: Vec<i16> = self.fifo.drain(..frame_len).collect();
            let mut out = vec![0u8; OPUS_MAX_PACKET];
            let len = self
                .encoder
                .encode(&chunk, &mut out)
                .map_err(|e| MediaError::Backend(format!("opus encode: {:?}", e)))?;
            out.truncate(len);
            let pts = self.next_pts.unwrap_or(0);
            self.next_pts = Some(pts + OPUS_FRAME_SAMPLES as i64);
            self.ready.push_back(CodedFrame {
                data: Bytes::from(out),
                pts,
                dts: None,
                duration: Some(OPUS_FRAME_SAMPLES as i64),
                keyframe: true,
            });
        }
        Ok(())
    }
}

impl Encoder for OpusEncoder {
    fn send(&mut self, frame: Option<&RawFrame>) -> Result<(), MediaError> {
        let Some(frame) = frame else {
            self.encode_buffered(true)?;
            self.draining = true;
            return Ok(());
        };
        let RawFrame::Audio(frame) = frame else {
            return Err(MediaError::InvalidData);
        };
        if self.next_pts.is_none() {
            self.next_pts = Some(frame.pts);
        }
        self.fifo.extend_from_slice(&frame.samples);
        self.encode_buffered(false)
    }

    fn receive(&mut self) -> Result<CodedFrame, MediaError> {
        match self.ready.pop_front() {
            Some(frame) => Ok(frame),
            None if self.draining => Err(MediaError::Eof),
            None => Err(MediaError::Again),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum G711Law {
    Mulaw,
    Alaw,
}

/// G.711 decoder: one byte per sample, 8 kHz mono.
pub struct G711Decoder {
    law: G711Law,
    ready: VecDeque<RawFrame>,
    draining: bool,
}

impl G711Decoder {
    pub fn mulaw() -> Self {
        Self::new(G711Law::Mulaw)
    }

    pub fn alaw() -> Self {
        Self::new(G711Law::Alaw)
    }

    fn new(law: G711Law) -> Self {
        G711Decoder {
            law,
            ready: VecDeque::new(),
            draining: false,
        }
    }
}

impl Decoder for G711Decoder {
    fn send(&mut self, frame: Option<&CodedFrame>) -> Result<(), MediaError> {
        let Some(frame) = frame else {
            self.draining = true;
            return Ok(());
        };
        let samples: Vec<i16> = match self.law {
            G711Law::Mulaw => frame.data.iter().map(|&b| ulaw_to_linear(b)).collect(),
            G711Law::Alaw => frame.data.iter().map(|&b| alaw_to_linear(b)).collect(),
        };
        self.ready.push_back(RawFrame::Audio(AudioFrame {
            pts: frame.pts,
            rate: 8_000,
            channels: 1,
            samples,
        }));
        Ok(())
    }

    fn receive(&mut self) -> Result<RawFrame, MediaError> {
        match self.ready.pop_front() {
            Some(frame) => Ok(frame),
            None if self.draining => Err(MediaError::Eof),
            None => Err(MediaError::Again),
        }
    }
}

/// G.711 encoder: emits one coded frame per input frame.
pub struct G711Encoder {
    law: G711Law,
    ready: VecDeque<CodedFrame>,
    draining: bool,
}

impl G711Encoder {
    pub fn mulaw(model: &RawFrame) -> Result<Self, MediaError> {
        Self::new(G711Law::Mulaw, model)
    }

    pub fn alaw(model: &RawFrame) -> Result<Self, MediaError> {
        Self::new(G711Law::Alaw, model)
    }

    fn new(law: G711Law, model: &RawFrame) -> Result<Self, MediaError> {
        let RawFrame::Audio(model) = model else {
            return Err(MediaError::EncoderInit(
                "g711 encoder requires audio input".to_string(),
            ));
        };
        if model.rate != 8_000 || model.channels != 1 {
            return Err(MediaError::EncoderInit(format!(
                "g711 encoder requires 8 kHz mono input, got {} Hz / {} ch",
                model.rate, model.channels
            )));
        }
        Ok(G711Encoder {
            law,
            ready: VecDeque::new(),
            draining: false,
        })
    }
}

impl Encoder for G711Encoder {
    fn send(&mut self, frame: Option<&RawFrame>) -> Result<(), MediaError> {
        let Some(frame) = frame else {
            self.draining = true;
            return Ok(());
        };
        let RawFrame::Audio(frame) = frame else {
            return Err(MediaError::InvalidData);
        };
        let data: Vec<u8> = match self.law {
            G711Law::Mulaw => frame.samples.iter().map(|&s| linear_to_ulaw(s)).collect(),
            G711Law::Alaw => frame.samples.iter().map(|&s| linear_to_alaw(s)).collect(),
        };
        let duration = frame.samples.len() as i64;
        self.ready.push_back(CodedFrame {
            data: Bytes::from(data),
            pts: frame.pts,
            dts: None,
            duration: Some(duration),
            keyframe: true,
        });
        Ok(())
    }

    fn receive(&mut self) -> Result<CodedFrame, MediaError> {
        match self.ready.pop_front() {
            Some(frame) => Ok(frame),
            None if self.draining => Err(MediaError::Eof),
            None => Err(MediaError::Again),
        }
    }
}

const ULAW_BIAS: i16 = 0x84;
const ULAW_CLIP: i16 = 8159;

fn linear_to_ulaw(sample: i16) -> u8 {
    let mut pcm = sample >> 2;
    let mask: u8 = if pcm < 0 {
        pcm = pcm.saturating_neg();
        0x7F
    } else {
        0xFF
    };
    if pcm > ULAW_CLIP {
        pcm = ULAW_CLIP;
    }
    pcm += ULAW_BIAS >> 2;

    let mut seg = 0i16;
    let mut bound = 0x3F;
    while seg < 8 && pcm > bound {
        seg += 1;
        bound = (bound << 1) | 1;
    }
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let uval = ((seg << 4) | ((pcm >> (seg + 1)) & 0x0F)) as u8;
    uval ^ mask
}

fn ulaw_to_linear(value: u8) -> i16 {
    let u = !value;
    let mut t = (((u & 0x0F) as i16) << 3) + ULAW_BIAS;
    t <<= (u & 0x70) >> 4;
    if u & 0x80 != 0 {
        ULAW_BIAS - t
    } else {
        t - ULAW_BIAS
    }
}

fn linear_to_alaw(sample: i16) -> u8 {
    let mut pcm = sample >> 3;
    let mask: u8 = if pcm >= 0 { 0xD5 } else { 0x55 };
    if pcm < 0 {
        pcm = -pcm - 1;
    }

    let mut seg = 0i16;
    let mut bound = 0x1F;
    while seg < 8 && pcm > bound {
        seg += 1;
        bound = (bound << 1) | 1;
    }
    if seg >= 8 {
        return 0x7F ^ mask;
    }
    let shift = if seg < 2 { 1 } else { seg };
    let aval = ((seg << 4) | ((pcm >> shift) & 0x0F)) as u8;
    aval ^ mask
}

fn alaw_to_linear(value: u8) -> i16 {
    let a = value ^ 0x55;
    let mut t = (((a & 0x0F) as i16) << 4) + 8;
    let seg = (a & 0x70) >> 4;
    if seg >= 1 {
        t += 0x100;
    }
    if seg > 1 {
        t <<= seg - 1;
    }
    if a & 0x80 != 0 {
        t
    } else {
        -t
    }
}

/// Sample-accurate audio format converter: channel up/down-mix plus
/// linear-interpolating rate conversion with exact rational position
/// tracking, so there is no drift over the stream lifetime.
///
/// Input frames carry pts in the input stream's clock units; output
/// frames carry pts in output sample units (one unit per sample).
pub struct AudioConverter {
    in_clock: u32,
    out_rate: u32,
    out_channels: u16,
    in_rate: Option<u32>,
    /// Interleaved at `out_channels`, still at the input sample rate.
    fifo: Vec<i16>,
    /// Absolute input sample index of `fifo[0]`.
    consumed: u64,
    /// Output samples produced so far.
    produced: u64,
    start_out_pts: Option<i64>,
}

impl AudioConverter {
    pub fn new(in_clock: u32, out_rate: u32, out_channels: u16) -> Self {
        AudioConverter {
            in_clock,
            out_rate,
            out_channels: out_channels.max(1),
            in_rate: None,
            fifo: Vec::new(),
            consumed: 0,
            produced: 0,
            start_out_pts: None,
        }
    }

    /// Feeds one decoded frame; returns a converted frame when enough
    /// input has accumulated.
    pub fn push(&mut self, frame: &AudioFrame) -> Option<AudioFrame> {
        if self.in_rate.is_none() {
            self.in_rate = Some(frame.rate.max(1));
            self.start_out_pts = Some(rescale(frame.pts, self.out_rate, self.in_clock));
        }
        self.mix_into_fifo(frame);
        self.produce(false)
    }

    /// Emits whatever remains buffered at end of stream.
    pub fn flush(&mut self) -> Option<AudioFrame> {
        self.produce(true)
    }

    fn mix_into_fifo(&mut self, frame: &AudioFrame) {
        let in_ch = frame.channels.max(1) as usize;
        let out_ch = self.out_channels as usize;
        for chunk in frame.samples.chunks_exact(in_ch) {
            if in_ch == out_ch {
                self.fifo.extend_from_slice(chunk);
            } else {
                // Average to mono, then replicate.
                let sum: i32 = chunk.iter().map(|&s| s as i32).sum();
                let mono = (sum / in_ch as i32) as i16;
                self.fifo.extend(std::iter::repeat(mono).take(out_ch));
            }
        }
    }

    fn produce(&mut self, flush: bool) -> Option<AudioFrame> {
        let in_rate = self.in_rate?;
        let out_ch = self.out_channels as usize;
        let available = self.consumed + (self.fifo.len() / out_ch) as u64;

        let mut out = Vec::new();
        let first_out = self.produced;
        loop {
            // Exact rational input position of the next output sample.
            let num = self.produced as u128 * in_rate as u128;
            let ip = (num / self.out_rate as u128) as u64;
            let frac = (num % self.out_rate as u128) as u64;

            let needs_next = frac != 0;
            if ip >= available || (needs_next && ip + 1 >= available && !flush) {
                break;
            }

            let base = ((ip - self.consumed) as usize) * out_ch;
            for c in 0..out_ch {
                let s0 = self.fifo[base + c] as i64;
                let s1 = if base + out_ch + c < self.fifo.len() {
                    self.fifo[base + out_ch + c] as i64
                } else {
                    s0
                };
                let v = s0 + (s1 - s0) * frac as i64 / self.out_rate as i64;
                out.push(v as i16);
            }
            self.produced += 1;
        }

        // Release input the resampler has moved past.
        let num = self.produced as u128 * in_rate as u128;
        let low = (num / self.out_rate as u128) as u64;
        if low > self.consumed {
            let drop = ((low - self.consumed) as usize * out_ch).min(self.fifo.len());
            self.fifo.drain(..drop);
            self.consumed += (drop / out_ch) as u64;
        }

        if out.is_empty() {
            return None;
        }
        Some(AudioFrame {
            pts: self.start_out_pts.unwrap_or(0) + first_out as i64,
            rate: self.out_rate,
            channels: self.out_channels,
            samples: out,
        })
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

    #[test]
    fn test_g711_mulaw_round_trip() {
        for &sample in &[0i16, 100, -100, 8000, -8000, 30000, -30000] {
            let coded = linear_to_ulaw(sample);
            let decoded = ulaw_to_linear(coded);
            let err = (sample as i32 - decoded as i32).abs();
            // Logarithmic companding: tolerance scales with magnitude.
            assert!(
                err <= (sample as i32).abs() / 16 + 64,
                "sample {} decoded as {}",
                sample,
                decoded
            );
        }
    }

    #[test]
    fn test_g711_alaw_round_trip() {
        for &sample in &[0i16, 100, -100, 8000, -8000, 30000, -30000] {
            let coded = linear_to_alaw(sample);
            let decoded = alaw_to_linear(coded);
            let err = (sample as i32 - decoded as i32).abs();
            assert!(
                err <= (sample as i32).abs() / 16 + 64,
                "sample {} decoded as {}",
                sample,
                decoded
            );
        }
    }

    #[test]
    fn test_g711_decoder_encoder_frame_flow() {
        let mut dec = G711Decoder::mulaw();
        let coded = CodedFrame::new(Bytes::from(vec![0x7Fu8; 160]), 1600);
        dec.send(Some(&coded)).unwrap();
        let raw = dec.receive().unwrap();
        let RawFrame::Audio(ref audio) = raw else {
            panic!("expected audio");
        };
        assert_eq!(audio.samples.len(), 160);
        assert_eq!(audio.pts, 1600);
        assert!(matches!(dec.receive(), Err(MediaError::Again)));

        let mut enc = G711Encoder::alaw(&raw).unwrap();
        enc.send(Some(&raw)).unwrap();
        let out = enc.receive().unwrap();
        assert_eq!(out.data.len(), 160);
        assert_eq!(out.pts, 1600);
        assert_eq!(out.duration, Some(160));

        enc.send(None).unwrap();
        assert!(matches!(enc.receive(), Err(MediaError::Eof)));
    }

    #[test]
    fn test_g711_encoder_rejects_wrong_rate() {
        let model = RawFrame::Audio(AudioFrame {
            pts: 0,
            rate: 48_000,
            channels: 2,
            samples: vec![],
        });
        assert!(matches!(
            G711Encoder::mulaw(&model),
            Err(MediaError::EncoderInit(_))
        ));
    }

    #[test]
    fn test_converter_passthrough() {
        let mut conv = AudioConverter::new(8000, 8000, 1);
        let frame = AudioFrame {
            pts: 320,
            rate: 8000,
            channels: 1,
            samples: (0..160).map(|i| i as i16).collect(),
        };
        let out = conv.push(&frame).unwrap();
        assert_eq!(out.rate, 8000);
        assert_eq!(out.channels, 1);
        assert_eq!(out.pts, 320);
        assert_eq!(out.samples.len(), 160);
        assert_eq!(out.samples[5], 5);
        assert!(conv.flush().is_none());
    }

    #[test]
    fn test_converter_downmix_and_downsample() {
        let mut conv = AudioConverter::new(48_000, 8_000, 1);
        // 960 stereo samples at 48 kHz = 20 ms, which is 160 at 8 kHz.
        let frame = AudioFrame {
            pts: 0,
            rate: 48_000,
            channels: 2,
            samples: vec![1000i16; 960 * 2],
        };
        let mut total = 0;
        if let Some(out) = conv.push(&frame) {
            assert_eq!(out.channels, 1);
            assert!(out.samples.iter().all(|&s| s == 1000));
            total += out.samples.len();
        }
        if let Some(out) = conv.flush() {
            total += out.samples.len();
        }
        assert_eq!(total, 160);
    }

    #[test]
    fn test_converter_no_drift_over_many_frames() {
        let mut conv = AudioConverter::new(48_000, 8_000, 1);
        let mut total_out = 0usize;
        for i in 0..100 {
            let frame = AudioFrame {
                pts: i * 960,
                rate: 48_000,
                channels: 1,
                samples: vec![0i16; 960],
            };
            if let Some(out) = conv.push(&frame) {
                total_out += out.samples.len();
            }
        }
        if let Some(out) = conv.flush() {
            total_out += out.samples.len();
        }
        // 100 frames of 20 ms at 8 kHz output: exactly 16000 samples.
        assert_eq!(total_out, 16_000);
    }

    #[test]
    fn test_converter_upsample_pts_scaling() {
        let mut conv = AudioConverter::new(8_000, 48_000, 2);
        let frame = AudioFrame {
            pts: 800,
            rate: 8_000,
            channels: 1,
            samples: vec![0i16; 160],
        };
        let out = conv.push(&frame).unwrap();
        // 800 input clock units becomes 4800 output units.
        assert_eq!(out.pts, 4800);
        assert_eq!(out.channels, 2);
    }
}
