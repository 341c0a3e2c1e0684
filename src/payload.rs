use bytes::{BufMut, Bytes, BytesMut};

use crate::codecs::CodecId;

/// Fragments coded frames into RTP payloads.
///
/// `max_payload` is the byte budget for a single payload so that the
/// packet stays under the MTU once the 12-byte RTP header is added.
/// Marker placement is the packetizer's job.
pub trait Payloader: Send {
    fn payload(&mut self, max_payload: usize, frame: &Bytes) -> Vec<Bytes>;
}

pub fn payloader_for(codec: CodecId) -> Box<dyn Payloader> {
    match codec {
        CodecId::H264 => Box::new(H264Payloader),
        CodecId::H265 => Box::new(H265Payloader),
        CodecId::Vp8 => Box::new(Vp8Payloader),
        CodecId::Vp9 => Box::new(Vp9Payloader::default()),
        CodecId::Av1 => Box::new(Av1Payloader),
        _ => Box::new(RawPayloader),
    }
}

/// Splits an Annex B bitstream into NAL units, accepting both 3- and
/// 4-byte start codes.
pub(crate) fn split_nal_units(data: &[u8]) -> Vec<&[u8]> {
    let mut nals = vec![];
    let mut start = None;
    let mut i = 0;
    while i + 2 < data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            let code_start = if i > 0 && data[i - 1] == 0 { i - 1 } else { i };
            if let Some(s) = start {
                if s < code_start {
                    nals.push(&data[s..code_start]);
                }
            }
            start = Some(i + 3);
            i += 3;
        } else {
            i += 1;
        }
    }
    if let Some(s) = start {
        if s < data.len() {
            nals.push(&data[s..]);
        }
    }
    nals
}

/// H.264 payloader (RFC 6184): single NAL unit packets with FU-A
/// fragmentation for NALs that exceed the budget.
pub struct H264Payloader;

impl Payloader for H264Payloader {
    fn payload(&mut self, max_payload: usize, frame: &Bytes) -> Vec<Bytes> {
        let mut payloads = vec![];
        if max_payload < 3 {
            return payloads;
        }
        for nal in split_nal_units(frame) {
            if nal.is_empty() {
                continue;
            }
            // Access unit delimiters carry nothing over RTP.
            if nal[0] & 0x1F == 9 {
                continue;
            }
            if nal.len() <= max_payload {
                payloads.push(Bytes::copy_from_slice(nal));
                continue;
            }

            // FU-A: 2 bytes of FU headers per fragment.
            let indicator = (nal[0] & 0xE0) | 28;
            let nal_type = nal[0] & 0x1F;
            let chunk = max_payload - 2;
            let body = &nal[1..];
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + chunk).min(body.len());
                let fu = fu_header(nal_type, offset == 0, end == body.len());
                let mut out = BytesMut::with_capacity(2 + end - offset);
                out.put_u8(indicator);
                out.put_u8(fu);
                out.extend_from_slice(&body[offset..end]);
                payloads.push(out.freeze());
                offset = end;
            }
        }
        payloads
    }
}

fn fu_header(nal_type: u8, start: bool, end: bool) -> u8 {
    let mut fu = nal_type;
    if start {
        fu |= 0x80;
    }
    if end {
        fu |= 0x40;
    }
    fu
}

/// H.265 payloader (RFC 7798): single NAL unit packets with FU
/// fragmentation. FU fragments carry the 2-byte payload header plus one
/// FU header byte.
pub struct H265Payloader;

impl Payloader for H265Payloader {
    fn payload(&mut self, max_payload: usize, frame: &Bytes) -> Vec<Bytes> {
        let mut payloads = vec![];
        if max_payload < 4 {
            return payloads;
        }
        for nal in split_nal_units(frame) {
            if nal.len() < 2 {
                continue;
            }
            if nal.len() <= max_payload {
                payloads.push(Bytes::copy_from_slice(nal));
                continue;
            }

            let nal_type = (nal[0] >> 1) & 0x3F;
            let header0 = (nal[0] & 0x81) | (49 << 1);
            let header1 = nal[1];
            let chunk = max_payload - 3;
            let body = &nal[2..];
            let mut offset = 0;
            while offset < body.len() {
                let end = (offset + chunk).min(body.len());
                let fu = fu_header(nal_type, offset == 0, end == body.len());
                let mut out = BytesMut::with_capacity(3 + end - offset);
                out.put_u8(header0);
                out.put_u8(header1);
                out.put_u8(fu);
                out.extend_from_slice(&body[offset..end]);
                payloads.push(out.freeze());
                offset = end;
            }
        }
        payloads
    }
}

/// VP8 payloader (RFC 7741) with the minimal one-byte payload
/// descriptor; the S bit marks the first fragment of the frame.
pub struct Vp8Payloader;

impl Payloader for Vp8Payloader {
    fn payload(&mut self, max_payload: usize, frame: &Bytes) -> Vec<Bytes> {
        let mut payloads = vec![];
        if max_payload < 2 || frame.is_empty() {
            return payloads;
        }
        let chunk = max_payload - 1;
        let mut offset = 0;
        while offset < frame.len() {
            let end = (offset + chunk).min(frame.len());
            let mut out = BytesMut::with_capacity(1 + end - offset);
            out.put_u8(if offset == 0 { 0x10 } else { 0x00 });
            out.extend_from_slice(&frame[offset..end]);
            payloads.push(out.freeze());
            offset = end;
        }
        payloads
    }
}

/// VP9 payloader (flexible mode) with a 15-bit picture ID that advances
/// per frame.
#[derive(Default)]
pub struct Vp9Payloader {
    picture_id: u16,
}

impl Payloader for Vp9Payloader {
    fn payload(&mut self, max_payload: usize, frame: &Bytes) -> Vec<Bytes> {
        let mut payloads = vec![];
        if max_payload < 4 || frame.is_empty() {
            return payloads;
        }
        let chunk = max_payload - 3;
        let mut offset = 0;
        while offset < frame.len() {
            let end = (offset + chunk).min(frame.len());
            // I bit always; B on the first fragment, E on the last.
            let mut flags = 0x80u8;
            if offset == 0 {
                flags |= 0x08;
            }
            if end == frame.len() {
                flags |= 0x04;
            }
            let mut out = BytesMut::with_capacity(3 + end - offset);
            out.put_u8(flags);
            out.put_u16(0x8000 | self.picture_id);
            out.extend_from_slice(&frame[offset..end]);
            payloads.push(out.freeze());
            offset = end;
        }
        self.picture_id = (self.picture_id + 1) & 0x7FFF;
        payloads
    }
}

/// AV1 payloader: fragments the temporal unit's OBU stream as a single
/// aggregation element per packet (W=1), with Z marking continuations
/// and Y marking fragments that continue into the next packet.
pub struct Av1Payloader;

impl Payloader for Av1Payloader {
    fn payload(&mut self, max_payload: usize, frame: &Bytes) -> Vec<Bytes> {
        let mut payloads = vec![];
        if max_payload < 2 || frame.is_empty() {
            return payloads;
        }
        let chunk = max_payload - 1;
        let mut offset = 0;
        while offset < frame.len() {
            let end = (offset + chunk).min(frame.len());
            let mut header = 0x10u8; // W=1
            if offset > 0 {
                header |= 0x80; // Z: continuation of the previous element
            }
            if end < frame.len() {
                header |= 0x40; // Y: element continues in the next packet
            }
            let mut out = BytesMut::with_capacity(1 + end - offset);
            out.put_u8(header);
            out.extend_from_slice(&frame[offset..end]);
            payloads.push(out.freeze());
            offset = end;
        }
        payloads
    }
}

/// Audio payloader: Opus packets and G.711/G.722 sample runs pass
/// through, split only if they somehow exceed the budget.
pub struct RawPayloader;

impl Payloader for RawPayloader {
    fn payload(&mut self, max_payload: usize, frame: &Bytes) -> Vec<Bytes> {
        if max_payload == 0 || frame.is_empty() {
            return vec![];
        }
        frame
            .chunks(max_payload)
            .map(Bytes::copy_from_slice)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::depayload::{Depayloaded, Depayloader, H264Depayloader, H265Depayloader};
    use webrtc::rtp::packet::Packet;

    #[test]
    fn test_split_nal_units_mixed_start_codes() {
        let data = [0, 0, 0, 1, 0x67, 0x42, 0, 0, 1, 0x68, 0, 0, 0, 1, 0x65, 0xFF];
        let nals = split_nal_units(&data);
        assert_eq!(nals.len(), 3);
        assert_eq!(nals[0], &[0x67, 0x42]);
        assert_eq!(nals[1], &[0x68]);
        assert_eq!(nals[2], &[0x65, 0xFF]);
    }

    #[test]
    fn test_h264_single_nal_fits() {
        let mut p = H264Payloader;
        let frame = Bytes::from_static(&[0, 0, 0, 1, 0x65, 1, 2, 3]);
        let payloads = p.payload(1188, &frame);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].as_ref(), &[0x65, 1, 2, 3]);
    }

    #[test]
    fn test_h264_fragments_large_nal() {
        let mut p = H264Payloader;
        let mut data = vec![0, 0, 0, 1, 0x65];
        data.extend(std::iter::repeat(0xAB).take(3000));
        let payloads = p.payload(1188, &Bytes::from(data));
        assert!(payloads.len() >= 3);
        for pl in &payloads {
            assert!(pl.len() <= 1188);
            assert_eq!(pl[0] & 0x1F, 28);
        }
        assert_eq!(payloads[0][1] & 0x80, 0x80);
        assert_eq!(payloads.last().unwrap()[1] & 0x40, 0x40);
    }

    #[test]
    fn test_h264_round_trip_through_depayloader() {
        let mut p = H264Payloader;
        let mut frame = vec![0, 0, 0, 1, 0x65];
        frame.extend((0..2500u32).map(|i| (i % 251) as u8));
        let payloads = p.payload(1188, &Bytes::from(frame.clone()));

        let mut d = H264Depayloader::default();
        let mut out = None;
        let last = payloads.len() - 1;
        for (i, pl) in payloads.into_iter().enumerate() {
            let mut pkt = Packet::default();
            pkt.payload = pl;
            pkt.header.marker = i == last;
            match d.push(&pkt) {
                Depayloaded::Frames(mut f) => out = Some(f.remove(0)),
                Depayloaded::NeedMore => {}
                Depayloaded::Corrupt => panic!("corrupt"),
            }
        }
        assert_eq!(out.unwrap().as_ref(), frame.as_slice());
    }

    #[test]
    fn test_h265_round_trip_through_depayloader() {
        let mut p = H265Payloader;
        let mut frame = vec![0, 0, 0, 1, 19 << 1, 0x01];
        frame.extend((0..2500u32).map(|i| (i % 249) as u8));
        let payloads = p.payload(1188, &Bytes::from(frame.clone()));
        assert!(payloads.len() > 1);

        let mut d = H265Depayloader::default();
        let mut out = None;
        let last = payloads.len() - 1;
        for (i, pl) in payloads.into_iter().enumerate() {
            let mut pkt = Packet::default();
            pkt.payload = pl;
            pkt.header.marker = i == last;
            match d.push(&pkt) {
                Depayloaded::Frames(mut f) => out = Some(f.remove(0)),
                Depayloaded::NeedMore => {}
                Depayloaded::Corrupt => panic!("corrupt"),
            }
        }
        assert_eq!(out.unwrap().as_ref(), frame.as_slice());
    }

    #[test]
    fn test_vp8_budget_respected() {
        let mut p = Vp8Payloader;
        let frame = Bytes::from(vec![0x42u8; 4000]);
        let payloads = p.payload(1188, &frame);
        let total: usize = payloads.iter().map(|p| p.len() - 1).sum();
        assert_eq!(total, 4000);
        for pl in &payloads {
            assert!(pl.len() <= 1188);
        }
        assert_eq!(payloads[0][0], 0x10);
        assert_eq!(payloads[1][0], 0x00);
    }

    #[test]
    fn test_vp9_picture_id_advances() {
        let mut p = Vp9Payloader::default();
        let frame = Bytes::from(vec![1u8; 10]);
        let a = p.payload(1188, &frame);
        let b = p.payload(1188, &frame);
        let pid_a = u16::from_be_bytes([a[0][1], a[0][2]]) & 0x7FFF;
        let pid_b = u16::from_be_bytes([b[0][1], b[0][2]]) & 0x7FFF;
        assert_eq!(pid_b, pid_a + 1);
    }

    #[test]
    fn test_av1_continuation_flags() {
        let mut p = Av1Payloader;
        let frame = Bytes::from(vec![7u8; 2500]);
        let payloads = p.payload(1188, &frame);
        assert_eq!(payloads.len(), 3);
        assert_eq!(payloads[0][0] & 0x80, 0);
        assert_eq!(payloads[0][0] & 0x40, 0x40);
        assert_eq!(payloads[1][0] & 0x80, 0x80);
        assert_eq!(payloads[2][0] & 0x40, 0);
    }

    #[test]
    fn test_raw_passthrough() {
        let mut p = RawPayloader;
        let frame = Bytes::from(vec![9u8; 160]);
        let payloads = p.payload(1188, &frame);
        assert_eq!(payloads.len(), 1);
        assert_eq!(payloads[0].len(), 160);
    }
}
