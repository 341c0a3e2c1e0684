use base64::prelude::{Engine as _, BASE64_STANDARD};
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecParameters;

use crate::codecs::CodecId;
use crate::media::CodedFrame;
use crate::payload::split_nal_units;

// H.264 NAL unit types.
const H264_NALU_SPS: u8 = 7;
const H264_NALU_PPS: u8 = 8;

// H.265 NAL unit types.
const H265_NALU_VPS: u8 = 32;
const H265_NALU_SPS: u8 = 33;
const H265_NALU_PPS: u8 = 34;

/// Builds the fully negotiated output parameters once the encoder has
/// produced its first frame.
///
/// The fmtp line depends on in-band parameter sets (H.264 SPS/PPS, H.265
/// VPS/SPS/PPS), which only exist after encoding begins; this is why the
/// pipeline's `codec()` blocks until the first encoded frame.
pub fn negotiated_parameters(codec: CodecId, first: &CodedFrame) -> RTCRtpCodecParameters {
    let mut params = codec.output_parameters();
    params.capability.sdp_fmtp_line = match codec {
        CodecId::H264 => h264_fmtp(&first.data),
        CodecId::H265 => h265_fmtp(&first.data),
        CodecId::Opus => "minptime=10;useinbandfec=1".to_owned(),
        _ => String::new(),
    };
    params
}

fn h264_fmtp(annex_b: &[u8]) -> String {
    let mut sps = None;
    let mut pps = None;
    for nal in split_nal_units(annex_b) {
        match nal.first().map(|b| b & 0x1F) {
            Some(H264_NALU_SPS) if sps.is_none() => sps = Some(nal),
            Some(H264_NALU_PPS) if pps.is_none() => pps = Some(nal),
            _ => {}
        }
    }

    // profile_idc, constraint flags, level_idc follow the NAL header.
    let profile_level_id = match sps {
        Some(sps) if sps.len() >= 4 => format!("{:02x}{:02x}{:02x}", sps[1], sps[2], sps[3]),
        _ => "42e01f".to_owned(),
    };

    let mut fmtp = format!(
        "level-asymmetry-allowed=1;packetization-mode=1;profile-level-id={}",
        profile_level_id
    );
    if let (Some(sps), Some(pps)) = (sps, pps) {
        fmtp.push_str(&format!(
            ";sprop-parameter-sets={},{}",
            BASE64_STANDARD.encode(sps),
            BASE64_STANDARD.encode(pps)
        ));
    }
    fmtp
}

fn h265_fmtp(annex_b: &[u8]) -> String {
    let mut vps = None;
    let mut sps = None;
    let mut pps = None;
    for nal in split_nal_units(annex_b) {
        match nal.first().map(|b| (b >> 1) & 0x3F) {
            Some(H265_NALU_VPS) if vps.is_none() => vps = Some(nal),
            Some(H265_NALU_SPS) if sps.is_none() => sps = Some(nal),
            Some(H265_NALU_PPS) if pps.is_none() => pps = Some(nal),
            _ => {}
        }
    }

    let mut parts = vec![];
    if let Some(vps) = vps {
        parts.push(format!("sprop-vps={}", BASE64_STANDARD.encode(vps)));
    }
    if let Some(sps) = sps {
        parts.push(format!("sprop-sps={}", BASE64_STANDARD.encode(sps)));
    }
    if let Some(pps) = pps {
        parts.push(format!("sprop-pps={}", BASE64_STANDARD.encode(pps)));
    }
    parts.join(";")
}

/// Synthesizes out-of-band parameter sets from the input's fmtp line so
/// they can be prepended to the first frame handed to the decoder.
/// Supports H.264 `sprop-parameter-sets` and H.265 `sprop-vps/sps/pps`.
pub fn out_of_band_parameter_sets(codec: CodecId, fmtp: &str) -> Option<Vec<u8>> {
    let keys: &[&str] = match codec {
        CodecId::H264 => &["sprop-parameter-sets"],
        CodecId::H265 => &["sprop-vps", "sprop-sps", "sprop-pps"],
        _ => return None,
    };

    let mut out = vec![];
    for pair in fmtp.split(';') {
        let mut kv = pair.splitn(2, '=');
        let key = kv.next().unwrap_or_default().trim();
        let value = kv.next().unwrap_or_default();
        if !keys.contains(&key) {
            continue;
        }
        // sprop values may hold several comma-separated NALs.
        for encoded in value.split(',') {
            if let Ok(nal) = BASE64_STANDARD.decode(encoded) {
                if !nal.is_empty() {
                    out.extend_from_slice(&[0, 0, 0, 1]);
                    out.extend_from_slice(&nal);
                }
            }
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn coded(data: Vec<u8>) -> CodedFrame {
        CodedFrame::new(Bytes::from(data), 0)
    }

    #[test]
    fn test_h264_fmtp_from_parameter_sets() {
        // SPS with profile 0x42 0xe0 0x1f, then a PPS.
        let frame = coded(vec![
            0, 0, 0, 1, 0x67, 0x42, 0xE0, 0x1F, 0xAA, //
            0, 0, 0, 1, 0x68, 0xCE, //
            0, 0, 0, 1, 0x65, 0x88,
        ]);
        let params = negotiated_parameters(CodecId::H264, &frame);
        let fmtp = params.capability.sdp_fmtp_line;
        assert!(fmtp.contains("profile-level-id=42e01f"));
        assert!(fmtp.contains("packetization-mode=1"));
        assert!(fmtp.contains("sprop-parameter-sets="));
        assert_eq!(params.payload_type, 102);
        assert_eq!(params.capability.clock_rate, 90_000);
    }

    #[test]
    fn test_h264_fmtp_without_sps_uses_default_profile() {
        let frame = coded(vec![0, 0, 0, 1, 0x65, 0x88]);
        let params = negotiated_parameters(CodecId::H264, &frame);
        assert!(params
            .capability
            .sdp_fmtp_line
            .contains("profile-level-id=42e01f"));
        assert!(!params.capability.sdp_fmtp_line.contains("sprop"));
    }

    #[test]
    fn test_h265_fmtp_sprop_sets() {
        let frame = coded(vec![
            0, 0, 0, 1, H265_NALU_VPS << 1, 0x01, 0x11, //
            0, 0, 0, 1, H265_NALU_SPS << 1, 0x01, 0x22, //
            0, 0, 0, 1, H265_NALU_PPS << 1, 0x01, 0x33, //
            0, 0, 0, 1, 19 << 1, 0x01, 0x44,
        ]);
        let params = negotiated_parameters(CodecId::H265, &frame);
        let fmtp = params.capability.sdp_fmtp_line;
        assert!(fmtp.contains("sprop-vps="));
        assert!(fmtp.contains("sprop-sps="));
        assert!(fmtp.contains("sprop-pps="));
        assert_eq!(params.payload_type, 103);
        assert_eq!(params.capability.clock_rate, 90_000);
    }

    #[test]
    fn test_opus_fmtp() {
        let params = negotiated_parameters(CodecId::Opus, &coded(vec![1]));
        assert_eq!(params.capability.sdp_fmtp_line, "minptime=10;useinbandfec=1");
        assert_eq!(params.payload_type, 111);
    }

    #[test]
    fn test_out_of_band_parameter_sets_h264() {
        let sps = BASE64_STANDARD.encode([0x67u8, 0x42, 0xE0, 0x1F]);
        let pps = BASE64_STANDARD.encode([0x68u8, 0xCE]);
        let fmtp = format!(
            "packetization-mode=1;sprop-parameter-sets={},{}",
            sps, pps
        );
        let out = out_of_band_parameter_sets(CodecId::H264, &fmtp).unwrap();
        assert_eq!(
            out,
            vec![0, 0, 0, 1, 0x67, 0x42, 0xE0, 0x1F, 0, 0, 0, 1, 0x68, 0xCE]
        );
    }

    #[test]
    fn test_out_of_band_parameter_sets_absent() {
        assert!(out_of_band_parameter_sets(CodecId::H264, "packetization-mode=1").is_none());
        assert!(out_of_band_parameter_sets(CodecId::Vp8, "anything=1").is_none());
    }
}
