use bytes::Bytes;
use thiserror::Error;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters};

use crate::codecs::CodecId;

/// Rate control defaults applied to every encoder backend that supports
/// them: 4 Mbit buffer, 20 Mbit ceiling, 1 Mbit floor.
pub const RC_BUFFER_SIZE: u32 = 4_000_000;
pub const RC_MAX_RATE: u32 = 20_000_000;
pub const RC_MIN_RATE: u32 = 1_000_000;

/// A compressed media unit: an H.26x access unit, a VP8/VP9 frame, an
/// AV1 temporal unit, or one audio packet. Timestamps are in the clock
/// units of whichever side of the graph the frame sits on.
#[derive(Debug, Clone)]
pub struct CodedFrame {
    pub data: Bytes,
    pub pts: i64,
    pub dts: Option<i64>,
    pub duration: Option<i64>,
    pub keyframe: bool,
}

impl CodedFrame {
    pub fn new(data: Bytes, pts: i64) -> Self {
        CodedFrame {
            data,
            pts,
            dts: None,
            duration: None,
            keyframe: false,
        }
    }
}

/// One uncompressed video frame, packed I420.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub pts: i64,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// One run of uncompressed audio, interleaved signed 16-bit samples.
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub pts: i64,
    pub rate: u32,
    pub channels: u16,
    pub samples: Vec<i16>,
}

#[derive(Debug, Clone)]
pub enum RawFrame {
    Video(VideoFrame),
    Audio(AudioFrame),
}

impl RawFrame {
    pub fn pts(&self) -> i64 {
        match self {
            RawFrame::Video(f) => f.pts,
            RawFrame::Audio(f) => f.pts,
        }
    }
}

/// Errors reported by the opaque frame processors.
#[derive(Debug, Error)]
pub enum MediaError {
    /// The processor needs more input before it can produce output.
    #[error("need more input")]
    Again,

    /// The processor has been drained and will produce nothing further.
    #[error("end of stream")]
    Eof,

    /// The current frame is undecodable. Drop it and continue.
    #[error("invalid data")]
    InvalidData,

    /// Fatal: the decoder could not be constructed or died.
    #[error("decoder init: {0}")]
    DecoderInit(String),

    /// Fatal: the encoder could not be constructed or died.
    #[error("encoder init: {0}")]
    EncoderInit(String),

    /// Fatal backend failure mid-stream.
    #[error("media backend: {0}")]
    Backend(String),
}

/// Opaque decoder contract: `send(None)` is the drain sentinel, after
/// which `receive` yields remaining frames and then `Eof`. `receive`
/// returning `Again` means more input is required.
pub trait Decoder: Send {
    fn send(&mut self, frame: Option<&CodedFrame>) -> Result<(), MediaError>;
    fn receive(&mut self) -> Result<RawFrame, MediaError>;
}

/// Opaque encoder contract, symmetric to [`Decoder`].
pub trait Encoder: Send {
    fn send(&mut self, frame: Option<&RawFrame>) -> Result<(), MediaError>;
    fn receive(&mut self) -> Result<CodedFrame, MediaError>;
}

/// Instantiates a decoder for the inbound stream. Opus and G.711 decode
/// natively; everything else goes through the GStreamer backend.
pub fn new_decoder(
    codec: CodecId,
    params: &RTCRtpCodecParameters,
) -> Result<Box<dyn Decoder>, MediaError> {
    match codec {
        CodecId::Opus => Ok(Box::new(crate::audio_codec::OpusDecoder::new(params)?)),
        CodecId::Pcmu => Ok(Box::new(crate::audio_codec::G711Decoder::mulaw())),
        CodecId::Pcma => Ok(Box::new(crate::audio_codec::G711Decoder::alaw())),
        _ => Ok(Box::new(crate::gst_codec::GstDecoder::new(codec, params)?)),
    }
}

/// Instantiates an encoder for the target codec, copying stream
/// parameters (resolution, channel count) from the first converted
/// frame. The clock rate always comes from the target capability.
pub fn new_encoder(
    codec: CodecId,
    target: &RTCRtpCodecCapability,
    recipe: Option<&str>,
    model: &RawFrame,
) -> Result<Box<dyn Encoder>, MediaError> {
    if let Some(recipe) = recipe {
        if !recipe.is_empty() && matches!(codec, CodecId::Opus | CodecId::Pcmu | CodecId::Pcma) {
            tracing::warn!(codec = ?codec, "encoder recipe ignored by native backend");
        }
    }
    match codec {
        CodecId::Opus => Ok(Box::new(crate::audio_codec::OpusEncoder::new(target, model)?)),
        CodecId::Pcmu => Ok(Box::new(crate::audio_codec::G711Encoder::mulaw(model)?)),
        CodecId::Pcma => Ok(Box::new(crate::audio_codec::G711Encoder::alaw(model)?)),
        _ => Ok(Box::new(crate::gst_codec::GstEncoder::new(
            codec, target, recipe, model,
        )?)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coded_frame_defaults() {
        let f = CodedFrame::new(Bytes::from_static(&[1, 2, 3]), 42);
        assert_eq!(f.pts, 42);
        assert!(f.dts.is_none());
        assert!(!f.keyframe);
    }

    #[test]
    fn test_raw_frame_pts() {
        let f = RawFrame::Audio(AudioFrame {
            pts: 7,
            rate: 8000,
            channels: 1,
            samples: vec![],
        });
        assert_eq!(f.pts(), 7);
    }
}
