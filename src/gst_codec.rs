use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app::{AppSink, AppSrc};
use gstreamer_video::VideoInfo;

use bytes::Bytes;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};

use crate::codecs::CodecId;
use crate::media::{
    AudioFrame, CodedFrame, Decoder, Encoder, MediaError, RawFrame, VideoFrame, RC_BUFFER_SIZE,
    RC_MAX_RATE,
};

static GST_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_gst() -> Result<(), MediaError> {
    let mut result = Ok(());
    GST_INIT.call_once(|| {
        if let Err(e) = gst::init() {
            result = Err(MediaError::Backend(format!("gstreamer init: {}", e)));
        }
    });
    result
}

fn units_to_nseconds(pts: i64, rate: u32) -> u64 {
    let pts = pts.max(0) as u128;
    (pts * 1_000_000_000 / rate.max(1) as u128) as u64
}

fn nseconds_to_units(ns: u64, rate: u32) -> i64 {
    (ns as u128 * rate as u128 / 1_000_000_000) as i64
}

/// Caps describing the coded bitstream handed to a decoder chain.
fn coded_caps(codec: CodecId) -> gst::Caps {
    match codec {
        CodecId::H264 => gst::Caps::builder("video/x-h264")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build(),
        CodecId::H265 => gst::Caps::builder("video/x-h265")
            .field("stream-format", "byte-stream")
            .field("alignment", "au")
            .build(),
        CodecId::Vp8 => gst::Caps::builder("video/x-vp8").build(),
        CodecId::Vp9 => gst::Caps::builder("video/x-vp9").build(),
        CodecId::Av1 => gst::Caps::builder("video/x-av1").build(),
        CodecId::G722 => gst::Caps::builder("audio/G722")
            .field("rate", 8000i32)
            .field("channels", 1i32)
            .build(),
        CodecId::Ac3 => gst::Caps::builder("audio/x-ac3").build(),
        CodecId::Aac => gst::Caps::builder("audio/mpeg")
            .field("mpegversion", 4i32)
            .build(),
        CodecId::Speex => gst::Caps::builder("audio/x-speex").build(),
        CodecId::Vorbis => gst::Caps::builder("audio/x-vorbis").build(),
        // Handled by the native backends.
        CodecId::Opus | CodecId::Pcmu | CodecId::Pcma => gst::Caps::new_empty_simple("audio/x-raw"),
    }
}

fn make_appsrc(caps: &gst::Caps) -> Result<AppSrc, MediaError> {
    let element = gst::ElementFactory::make("appsrc")
        .name("source")
        .build()
        .map_err(|e| MediaError::Backend(format!("appsrc: {}", e)))?;
    let appsrc = element
        .dynamic_cast::<AppSrc>()
        .map_err(|_| MediaError::Backend("appsrc cast".to_string()))?;
    appsrc.set_caps(Some(caps));
    appsrc.set_format(gst::Format::Time);
    Ok(appsrc)
}

fn make_appsink(caps: Option<&gst::Caps>) -> Result<AppSink, MediaError> {
    let element = gst::ElementFactory::make("appsink")
        .name("sink")
        .build()
        .map_err(|e| MediaError::Backend(format!("appsink: {}", e)))?;
    let appsink = element
        .dynamic_cast::<AppSink>()
        .map_err(|_| MediaError::Backend("appsink cast".to_string()))?;
    appsink.set_caps(caps);
    Ok(appsink)
}

/// Builds `appsrc ! convert ! <chain> ! appsink` and brings it to
/// `Playing`.
fn build_pipeline(
    src_caps: &gst::Caps,
    convert: Option<&str>,
    chain: &str,
    sink_caps: Option<&gst::Caps>,
) -> Result<(gst::Pipeline, AppSrc, AppSink, gst::Bin), MediaError> {
    ensure_gst()?;

    let pipeline = gst::Pipeline::new();
    let appsrc = make_appsrc(src_caps)?;
    let appsink = make_appsink(sink_caps)?;

    let bin = gst::parse::bin_from_description(chain, true)
        .map_err(|e| MediaError::Backend(format!("parse '{}': {}", chain, e)))?;

    let mut elements: Vec<gst::Element> = vec![appsrc.clone().upcast()];
    if let Some(convert) = convert {
        let conv = gst::ElementFactory::make(convert)
            .build()
            .map_err(|e| MediaError::Backend(format!("{}: {}", convert, e)))?;
        elements.push(conv);
    }
    elements.push(bin.clone().upcast());
    elements.push(appsink.clone().upcast());

    pipeline
        .add_many(&elements)
        .map_err(|e| MediaError::Backend(format!("pipeline add: {}", e)))?;
    gst::Element::link_many(&elements)
        .map_err(|e| MediaError::Backend(format!("pipeline link: {}", e)))?;

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| MediaError::Backend(format!("pipeline start: {}", e)))?;

    Ok((pipeline, appsrc, appsink, bin))
}

fn push_timed(appsrc: &AppSrc, data: &[u8], pts_ns: u64) -> Result<(), MediaError> {
    let mut buffer = gst::Buffer::from_mut_slice(data.to_vec());
    {
        let buffer = buffer.get_mut().expect("freshly created buffer is unique");
        buffer.set_pts(Some(gst::ClockTime::from_nseconds(pts_ns)));
    }
    appsrc
        .push_buffer(buffer)
        .map_err(|e| MediaError::Backend(format!("push buffer: {:?}", e)))?;
    Ok(())
}

/// GStreamer-backed decoder: coded frames in, raw I420 video or S16
/// interleaved audio out. Timestamps stay in the input clock units.
pub struct GstDecoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    clock_rate: u32,
    kind: RTPCodecType,
    draining: bool,
}

impl GstDecoder {
    pub fn new(codec: CodecId, params: &RTCRtpCodecParameters) -> Result<Self, MediaError> {
        let recipe = codec.decoder_recipe();
        if recipe.is_empty() {
            return Err(MediaError::DecoderInit(format!(
                "no decode chain for {}",
                codec.mime_type()
            )));
        }

        let kind = codec.kind();
        let (convert, sink_caps) = match kind {
            RTPCodecType::Video => (
                "videoconvert",
                gst::Caps::builder("video/x-raw").field("format", "I420").build(),
            ),
            _ => (
                "audioconvert",
                gst::Caps::builder("audio/x-raw")
                    .field("format", "S16LE")
                    .field("layout", "interleaved")
                    .build(),
            ),
        };

        let (pipeline, appsrc, appsink, _) =
            build_pipeline(&coded_caps(codec), Some(convert), recipe, Some(&sink_caps))
                .map_err(|e| MediaError::DecoderInit(e.to_string()))?;

        Ok(GstDecoder {
            pipeline,
            appsrc,
            appsink,
            clock_rate: params.capability.clock_rate.max(1),
            kind,
            draining: false,
        })
    }

    fn sample_to_frame(&self, sample: gst::Sample) -> Result<RawFrame, MediaError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| MediaError::Backend("sample without buffer".to_string()))?;
        let pts_ns = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
        let pts = nseconds_to_units(pts_ns, self.clock_rate);
        let map = buffer
            .map_readable()
            .map_err(|_| MediaError::Backend("buffer map".to_string()))?;

        match self.kind {
            RTPCodecType::Video => {
                let caps = sample
                    .caps()
                    .ok_or_else(|| MediaError::Backend("sample without caps".to_string()))?;
                let info = VideoInfo::from_caps(caps)
                    .map_err(|_| MediaError::Backend("video caps".to_string()))?;
                Ok(RawFrame::Video(VideoFrame {
                    pts,
                    width: info.width(),
                    height: info.height(),
                    data: map.as_slice().to_vec(),
                }))
            }
            _ => {
                let caps = sample
                    .caps()
                    .ok_or_else(|| MediaError::Backend("sample without caps".to_string()))?;
                let structure = caps
                    .structure(0)
                    .ok_or_else(|| MediaError::Backend("audio caps".to_string()))?;
                let rate = structure.get::<i32>("rate").unwrap_or(48_000) as u32;
                let channels = structure.get::<i32>("channels").unwrap_or(1) as u16;
                let samples: Vec<i16> = map
                    .as_slice()
                    .chunks_exact(2)
                    .map(|b| i16::from_le_bytes([b[0], b[1]]))
                    .collect();
                Ok(RawFrame::Audio(AudioFrame {
                    pts,
                    rate,
                    channels,
                    samples,
                }))
            }
        }
    }
}

impl Decoder for GstDecoder {
    fn send(&mut self, frame: Option<&CodedFrame>) -> Result<(), MediaError> {
        match frame {
            Some(frame) => push_timed(
                &self.appsrc,
                &frame.data,
                units_to_nseconds(frame.pts, self.clock_rate),
            ),
            None => {
                self.draining = true;
                let _ = self.appsrc.end_of_stream();
                Ok(())
            }
        }
    }

    fn receive(&mut self) -> Result<RawFrame, MediaError> {
        let timeout = if self.draining {
            gst::ClockTime::from_mseconds(200)
        } else {
            gst::ClockTime::ZERO
        };
        if let Some(sample) = self.appsink.try_pull_sample(timeout) {
            return self.sample_to_frame(sample);
        }
        if self.draining && self.appsink.is_eos() {
            return Err(MediaError::Eof);
        }
        Err(MediaError::Again)
    }
}

impl Drop for GstDecoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// GStreamer-backed encoder: raw frames in, coded frames out, with the
/// rate-control defaults applied to recognized encoder elements.
pub struct GstEncoder {
    pipeline: gst::Pipeline,
    appsrc: AppSrc,
    appsink: AppSink,
    /// pts units per second on both sides of this encoder.
    unit_rate: u32,
    draining: bool,
}

impl GstEncoder {
    pub fn new(
        codec: CodecId,
        target: &RTCRtpCodecCapability,
        recipe: Option<&str>,
        model: &RawFrame,
    ) -> Result<Self, MediaError> {
        let chain = match recipe {
            Some(r) if !r.is_empty() => r.to_string(),
            _ => codec.encoder_recipe().to_string(),
        };
        if chain.is_empty() {
            return Err(MediaError::EncoderInit(format!(
                "no encode chain for {}",
                codec.mime_type()
            )));
        }

        let (src_caps, convert, unit_rate) = match model {
            RawFrame::Video(frame) => (
                gst::Caps::builder("video/x-raw")
                    .field("format", "I420")
                    .field("width", frame.width as i32)
                    .field("height", frame.height as i32)
                    .field("framerate", gst::Fraction::new(0, 1))
                    .build(),
                "videoconvert",
                target.clock_rate.max(1),
            ),
            RawFrame::Audio(frame) => (
                gst::Caps::builder("audio/x-raw")
                    .field("format", "S16LE")
                    .field("layout", "interleaved")
                    .field("rate", frame.rate as i32)
                    .field("channels", frame.channels as i32)
                    .build(),
                "audioconvert",
                codec.encoder_sample_rate().max(1),
            ),
        };

        let (pipeline, appsrc, appsink, bin) =
            build_pipeline(&src_caps, Some(convert), &chain, None)
                .map_err(|e| MediaError::EncoderInit(e.to_string()))?;

        apply_rate_control(&bin);

        Ok(GstEncoder {
            pipeline,
            appsrc,
            appsink,
            unit_rate,
            draining: false,
        })
    }

    fn sample_to_frame(&self, sample: gst::Sample) -> Result<CodedFrame, MediaError> {
        let buffer = sample
            .buffer()
            .ok_or_else(|| MediaError::Backend("sample without buffer".to_string()))?;
        let pts_ns = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
        let duration = buffer
            .duration()
            .map(|d| nseconds_to_units(d.nseconds(), self.unit_rate));
        let keyframe = !buffer.flags().contains(gst::BufferFlags::DELTA_UNIT);
        let map = buffer
            .map_readable()
            .map_err(|_| MediaError::Backend("buffer map".to_string()))?;
        Ok(CodedFrame {
            data: Bytes::from(map.as_slice().to_vec()),
            pts: nseconds_to_units(pts_ns, self.unit_rate),
            dts: buffer
                .dts()
                .map(|t| nseconds_to_units(t.nseconds(), self.unit_rate)),
            duration,
            keyframe,
        })
    }
}

impl Encoder for GstEncoder {
    fn send(&mut self, frame: Option<&RawFrame>) -> Result<(), MediaError> {
        match frame {
            Some(RawFrame::Video(frame)) => push_timed(
                &self.appsrc,
                &frame.data,
                units_to_nseconds(frame.pts, self.unit_rate),
            ),
            Some(RawFrame::Audio(frame)) => {
                let mut bytes = Vec::with_capacity(frame.samples.len() * 2);
                for s in &frame.samples {
                    bytes.extend_from_slice(&s.to_le_bytes());
                }
                push_timed(
                    &self.appsrc,
                    &bytes,
                    units_to_nseconds(frame.pts, self.unit_rate),
                )
            }
            None => {
                self.draining = true;
                let _ = self.appsrc.end_of_stream();
                Ok(())
            }
        }
    }

    fn receive(&mut self) -> Result<CodedFrame, MediaError> {
        let timeout = if self.draining {
            gst::ClockTime::from_mseconds(200)
        } else {
            gst::ClockTime::ZERO
        };
        if let Some(sample) = self.appsink.try_pull_sample(timeout) {
            return self.sample_to_frame(sample);
        }
        if self.draining && self.appsink.is_eos() {
            return Err(MediaError::Eof);
        }
        Err(MediaError::Again)
    }
}

impl Drop for GstEncoder {
    fn drop(&mut self) {
        let _ = self.pipeline.set_state(gst::State::Null);
    }
}

/// Applies the rate-control defaults to encoder elements that expose
/// the matching properties (x264enc and x265enc take kbit and ms).
fn apply_rate_control(bin: &gst::Bin) {
    for element in bin.iterate_elements().into_iter().flatten() {
        if element.find_property("bitrate").is_some()
            && element.find_property("vbv-buf-capacity").is_some()
        {
            element.set_property("bitrate", RC_MAX_RATE / 1000);
            element.set_property(
                "vbv-buf-capacity",
                (RC_BUFFER_SIZE as u64 * 1000 / RC_MAX_RATE as u64) as u32,
            );
        }
    }
}
