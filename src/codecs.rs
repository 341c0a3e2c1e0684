use crate::error::TranscodeError;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTCRtpCodecParameters, RTPCodecType};
use webrtc::rtp_transceiver::RTCPFeedback;

pub const MIME_TYPE_H264: &str = "video/H264";
pub const MIME_TYPE_H265: &str = "video/H265";
pub const MIME_TYPE_VP8: &str = "video/VP8";
pub const MIME_TYPE_VP9: &str = "video/VP9";
pub const MIME_TYPE_AV1: &str = "video/AV1";
pub const MIME_TYPE_OPUS: &str = "audio/opus";
pub const MIME_TYPE_G722: &str = "audio/G722";
pub const MIME_TYPE_PCMU: &str = "audio/PCMU";
pub const MIME_TYPE_PCMA: &str = "audio/PCMA";
pub const MIME_TYPE_AC3: &str = "audio/AC3";
pub const MIME_TYPE_AAC: &str = "audio/AAC";
pub const MIME_TYPE_SPEEX: &str = "audio/SPEEX";
pub const MIME_TYPE_VORBIS: &str = "audio/VORBIS";

/// Closed set of codecs the transcoder understands. The registry maps MIME
/// types onto this sum; everything downstream (depayloaders, payloaders,
/// media backends) dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
    H264,
    H265,
    Vp8,
    Vp9,
    Av1,
    Opus,
    G722,
    Pcmu,
    Pcma,
    Ac3,
    Aac,
    Speex,
    Vorbis,
}

impl CodecId {
    /// Looks up a MIME type (case-insensitive) in the registry.
    pub fn from_mime_type(mime: &str) -> Result<CodecId, TranscodeError> {
        let id = match mime.to_ascii_lowercase().as_str() {
            "video/h264" => CodecId::H264,
            "video/h265" => CodecId::H265,
            "video/vp8" => CodecId::Vp8,
            "video/vp9" => CodecId::Vp9,
            "video/av1" => CodecId::Av1,
            "audio/opus" => CodecId::Opus,
            "audio/g722" => CodecId::G722,
            "audio/pcmu" => CodecId::Pcmu,
            "audio/pcma" => CodecId::Pcma,
            "audio/ac3" => CodecId::Ac3,
            "audio/aac" => CodecId::Aac,
            "audio/speex" => CodecId::Speex,
            "audio/vorbis" => CodecId::Vorbis,
            _ => return Err(TranscodeError::UnsupportedCodec(mime.to_string())),
        };
        Ok(id)
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            CodecId::H264 => MIME_TYPE_H264,
            CodecId::H265 => MIME_TYPE_H265,
            CodecId::Vp8 => MIME_TYPE_VP8,
            CodecId::Vp9 => MIME_TYPE_VP9,
            CodecId::Av1 => MIME_TYPE_AV1,
            CodecId::Opus => MIME_TYPE_OPUS,
            CodecId::G722 => MIME_TYPE_G722,
            CodecId::Pcmu => MIME_TYPE_PCMU,
            CodecId::Pcma => MIME_TYPE_PCMA,
            CodecId::Ac3 => MIME_TYPE_AC3,
            CodecId::Aac => MIME_TYPE_AAC,
            CodecId::Speex => MIME_TYPE_SPEEX,
            CodecId::Vorbis => MIME_TYPE_VORBIS,
        }
    }

    pub fn kind(&self) -> RTPCodecType {
        match self {
            CodecId::H264 | CodecId::H265 | CodecId::Vp8 | CodecId::Vp9 | CodecId::Av1 => {
                RTPCodecType::Video
            }
            _ => RTPCodecType::Audio,
        }
    }

    /// RTP clock rate of the codec. Note that for G.722 this is the
    /// historical 8 kHz wire clock, not the 16 kHz sample rate.
    pub fn clock_rate(&self) -> u32 {
        match self {
            CodecId::H264 | CodecId::H265 | CodecId::Vp8 | CodecId::Vp9 | CodecId::Av1 => 90_000,
            CodecId::Opus | CodecId::Ac3 | CodecId::Aac | CodecId::Speex => 48_000,
            CodecId::G722 | CodecId::Pcmu | CodecId::Pcma => 8_000,
            CodecId::Vorbis => 90_000,
        }
    }

    pub fn channels(&self) -> u16 {
        match self {
            CodecId::Opus | CodecId::Aac => 2,
            CodecId::G722 | CodecId::Pcmu | CodecId::Pcma => 1,
            CodecId::Ac3 | CodecId::Speex | CodecId::Vorbis => 1,
            _ => 0,
        }
    }

    /// The session-scoped payload type used when this codec is the output,
    /// mirroring the WebRTC payload type mapping.
    pub fn default_payload_type(&self) -> u8 {
        match self {
            CodecId::Pcmu => 0,
            CodecId::Pcma => 8,
            CodecId::G722 => 9,
            CodecId::Vp8 => 100,
            CodecId::Vp9 => 101,
            CodecId::H264 => 102,
            CodecId::H265 => 103,
            CodecId::Av1 => 104,
            CodecId::Opus => 111,
            CodecId::Ac3 => 112,
            CodecId::Vorbis => 113,
            CodecId::Aac => 114,
            CodecId::Speex => 115,
        }
    }

    pub fn rtcp_feedback(&self) -> Vec<RTCPFeedback> {
        match self.kind() {
            RTPCodecType::Video => video_rtcp_feedback(),
            _ => vec![],
        }
    }

    pub fn capability(&self) -> RTCRtpCodecCapability {
        RTCRtpCodecCapability {
            mime_type: self.mime_type().to_owned(),
            clock_rate: self.clock_rate(),
            channels: self.channels(),
            sdp_fmtp_line: "".to_owned(),
            rtcp_feedback: self.rtcp_feedback(),
        }
    }

    pub fn output_parameters(&self) -> RTCRtpCodecParameters {
        RTCRtpCodecParameters {
            capability: self.capability(),
            payload_type: self.default_payload_type(),
            ..Default::default()
        }
    }

    /// Default output codec for a media kind when the client does not
    /// request a MIME type.
    pub fn default_output(kind: RTPCodecType) -> Option<CodecId> {
        match kind {
            RTPCodecType::Video => Some(CodecId::H264),
            RTPCodecType::Audio => Some(CodecId::Opus),
            _ => None,
        }
    }

    /// Whether the service can produce this codec as transcode output.
    pub fn is_transcode_target(&self) -> bool {
        !matches!(self, CodecId::Av1 | CodecId::Vorbis)
    }

    /// GStreamer decode chain for the coded input, up to raw frames.
    pub(crate) fn decoder_recipe(&self) -> &'static str {
        match self {
            CodecId::H264 => "h264parse ! avdec_h264",
            CodecId::H265 => "h265parse ! avdec_h265",
            CodecId::Vp8 => "vp8dec",
            CodecId::Vp9 => "vp9dec",
            CodecId::Av1 => "av1dec",
            CodecId::G722 => "avdec_g722",
            CodecId::Ac3 => "ac3parse ! avdec_ac3",
            CodecId::Aac => "aacparse ! avdec_aac",
            CodecId::Speex => "speexdec",
            CodecId::Vorbis => "vorbisparse ! vorbisdec",
            // Opus and G.711 decode natively, not through GStreamer.
            CodecId::Opus | CodecId::Pcmu | CodecId::Pcma => "",
        }
    }

    /// Default GStreamer encode chain from raw frames to the coded output.
    /// `Transcode` requests may override this with their own recipe.
    pub fn encoder_recipe(&self) -> &'static str {
        match self {
            CodecId::H264 => {
                "video/x-raw,format=I420 ! x264enc speed-preset=ultrafast tune=zerolatency key-int-max=20 bframes=0 ! video/x-h264,stream-format=byte-stream,alignment=au"
            }
            CodecId::H265 => {
                "video/x-raw,format=I420 ! x265enc speed-preset=veryfast tune=zerolatency key-int-max=20 ! video/x-h265,stream-format=byte-stream,alignment=au"
            }
            CodecId::Vp8 => {
                "vp8enc end-usage=cq error-resilient=partitions keyframe-max-dist=10 auto-alt-ref=true cpu-used=5 deadline=1"
            }
            CodecId::Vp9 => {
                "vp9enc end-usage=cq error-resilient=partitions keyframe-max-dist=10 auto-alt-ref=true cpu-used=5 deadline=1"
            }
            CodecId::G722 => "avenc_g722",
            CodecId::Ac3 => "avenc_ac3",
            CodecId::Aac => "avenc_aac",
            CodecId::Speex => "speexenc",
            // Natively encoded; recipes do not apply.
            CodecId::Opus => "",
            CodecId::Pcmu => "",
            CodecId::Pcma => "",
            CodecId::Av1 | CodecId::Vorbis => "",
        }
    }

    /// Sample rate the encoder consumes. Equal to the RTP clock rate for
    /// everything except G.722, which samples at 16 kHz against an 8 kHz
    /// wire clock.
    pub fn encoder_sample_rate(&self) -> u32 {
        match self {
            CodecId::G722 => 16_000,
            _ => self.clock_rate(),
        }
    }
}

fn video_rtcp_feedback() -> Vec<RTCPFeedback> {
    vec![
        RTCPFeedback {
            typ: "goog-remb".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "ccm".to_owned(),
            parameter: "fir".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "".to_owned(),
        },
        RTCPFeedback {
            typ: "nack".to_owned(),
            parameter: "pli".to_owned(),
        },
    ]
}

fn audio(mime: &str, clock_rate: u32, channels: u16, payload_type: u8) -> RTCRtpCodecParameters {
    RTCRtpCodecParameters {
        capability: RTCRtpCodecCapability {
            mime_type: mime.to_owned(),
            clock_rate,
            channels,
            sdp_fmtp_line: "".to_owned(),
            rtcp_feedback: vec![],
        },
        payload_type,
        ..Default::default()
    }
}

/// The full set of codecs registered with the media engine, mirroring the
/// WebRTC payload type mapping: the legacy static audio payload types plus
/// the dynamic-range video and audio codecs served by the transcoder.
pub fn default_output_codecs() -> Vec<RTCRtpCodecParameters> {
    let mut codecs = vec![
        audio(MIME_TYPE_PCMU, 8000, 1, 0),
        audio("audio/GSM", 8000, 1, 3),
        audio("audio/G723", 8000, 1, 4),
        audio("audio/LPC", 8000, 1, 7),
        audio(MIME_TYPE_PCMA, 8000, 1, 8),
        audio(MIME_TYPE_G722, 8000, 1, 9),
        audio("audio/L16", 44100, 2, 10),
        audio("audio/QCELP", 8000, 1, 12),
        audio("audio/CN", 8000, 1, 13),
        audio("audio/MPA", 90000, 1, 14),
        audio("audio/G728", 8000, 1, 15),
        audio("audio/DVI4", 22050, 1, 17),
        audio("audio/G729", 8000, 1, 18),
    ];

    for id in [
        CodecId::Vp8,
        CodecId::Vp9,
        CodecId::H264,
        CodecId::H265,
        CodecId::Av1,
        CodecId::Opus,
        CodecId::Ac3,
        CodecId::Vorbis,
        CodecId::Aac,
        CodecId::Speex,
    ] {
        codecs.push(id.output_parameters());
    }

    codecs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mime_lookup_case_insensitive() {
        assert_eq!(CodecId::from_mime_type("video/h264").unwrap(), CodecId::H264);
        assert_eq!(CodecId::from_mime_type("Video/H264").unwrap(), CodecId::H264);
        assert_eq!(CodecId::from_mime_type("audio/OPUS").unwrap(), CodecId::Opus);
    }

    #[test]
    fn test_unknown_mime_rejected() {
        let err = CodecId::from_mime_type("video/MJPEG").unwrap_err();
        assert!(matches!(err, TranscodeError::UnsupportedCodec(_)));
    }

    #[test]
    fn test_payload_type_mapping() {
        assert_eq!(CodecId::Pcmu.default_payload_type(), 0);
        assert_eq!(CodecId::Pcma.default_payload_type(), 8);
        assert_eq!(CodecId::G722.default_payload_type(), 9);
        assert_eq!(CodecId::Vp8.default_payload_type(), 100);
        assert_eq!(CodecId::Vp9.default_payload_type(), 101);
        assert_eq!(CodecId::H264.default_payload_type(), 102);
        assert_eq!(CodecId::H265.default_payload_type(), 103);
        assert_eq!(CodecId::Av1.default_payload_type(), 104);
        assert_eq!(CodecId::Opus.default_payload_type(), 111);
    }

    #[test]
    fn test_video_feedback_set() {
        let fb = CodecId::H264.rtcp_feedback();
        assert!(fb.iter().any(|f| f.typ == "goog-remb"));
        assert!(fb.iter().any(|f| f.typ == "ccm" && f.parameter == "fir"));
        assert!(fb.iter().any(|f| f.typ == "nack" && f.parameter.is_empty()));
        assert!(fb.iter().any(|f| f.typ == "nack" && f.parameter == "pli"));
        assert!(CodecId::Opus.rtcp_feedback().is_empty());
    }

    #[test]
    fn test_default_outputs() {
        assert_eq!(
            CodecId::default_output(RTPCodecType::Video),
            Some(CodecId::H264)
        );
        assert_eq!(
            CodecId::default_output(RTPCodecType::Audio),
            Some(CodecId::Opus)
        );
    }

    #[test]
    fn test_clock_rates() {
        assert_eq!(CodecId::H265.clock_rate(), 90_000);
        assert_eq!(CodecId::Opus.clock_rate(), 48_000);
        assert_eq!(CodecId::G722.clock_rate(), 8_000);
        assert_eq!(CodecId::G722.encoder_sample_rate(), 16_000);
    }

    #[test]
    fn test_registry_covers_media_engine() {
        let all = default_output_codecs();
        // Legacy static types plus the ten dynamic entries.
        assert_eq!(all.len(), 23);
        assert!(all
            .iter()
            .any(|c| c.capability.mime_type == MIME_TYPE_H264 && c.payload_type == 102));
    }
}
