use bytes::{BufMut, Bytes, BytesMut};
use webrtc::rtp::packet::Packet;

use crate::codecs::CodecId;

const ANNEX_B_START: [u8; 4] = [0, 0, 0, 1];

// H.264 NAL unit types (RFC 6184).
const H264_NALU_TYPE_MASK: u8 = 0x1F;
const H264_STAP_A: u8 = 24;
const H264_FU_A: u8 = 28;

// H.265 NAL unit types (RFC 7798).
const H265_AP: u8 = 48;
const H265_FU: u8 = 49;

// AV1 aggregation header bits.
const AV1_Z_MASK: u8 = 0b1000_0000;
const AV1_W_MASK: u8 = 0b0011_0000;
const AV1_N_MASK: u8 = 0b0000_1000;

/// Result of feeding one RTP packet to a depayloader.
#[derive(Debug)]
pub enum Depayloaded {
    /// One or more complete codec frames were reassembled.
    Frames(Vec<Bytes>),
    /// The packet was consumed; the frame is still incomplete.
    NeedMore,
    /// The payload could not be parsed. The packet is dropped; the
    /// depayloader keeps running.
    Corrupt,
}

/// Reassembles codec frames from RTP payloads.
///
/// Implementations tolerate joining a stream mid-frame by discarding
/// input until the first recoverable frame boundary.
pub trait Depayloader: Send {
    fn push(&mut self, packet: &Packet) -> Depayloaded;

    /// Drops any partially assembled frame. Called after a sequence gap.
    fn reset(&mut self);
}

pub fn depayloader_for(codec: CodecId) -> Box<dyn Depayloader> {
    match codec {
        CodecId::H264 => Box::new(H264Depayloader::default()),
        CodecId::H265 => Box::new(H265Depayloader::default()),
        CodecId::Vp8 => Box::new(Vp8Depayloader::default()),
        CodecId::Vp9 => Box::new(Vp9Depayloader::default()),
        CodecId::Av1 => Box::new(Av1Depayloader::default()),
        // One coded frame per packet for all supported audio codecs.
        _ => Box::new(AudioDepayloader::default()),
    }
}

/// H.264 depayloader (RFC 6184): single NAL, STAP-A, and FU-A.
/// Emits Annex B access units on the RTP marker bit.
#[derive(Default)]
pub struct H264Depayloader {
    frame: BytesMut,
    /// A FU-A fragment sequence is in progress.
    fragment_active: bool,
    /// At least one complete NAL has landed in `frame`.
    have_nal: bool,
}

impl H264Depayloader {
    fn append_nal(&mut self, nal: &[u8]) {
        if nal.is_empty() {
            return;
        }
        self.frame.extend_from_slice(&ANNEX_B_START);
        self.frame.extend_from_slice(nal);
        self.have_nal = true;
    }

    fn parse(&mut self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }
        match payload[0] & H264_NALU_TYPE_MASK {
            1..=23 => {
                self.append_nal(payload);
                true
            }
            H264_STAP_A => {
                let mut offset = 1;
                while offset + 2 <= payload.len() {
                    let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if size == 0 || offset + size > payload.len() {
                        return false;
                    }
                    self.append_nal(&payload[offset..offset + size]);
                    offset += size;
                }
                offset == payload.len()
            }
            H264_FU_A => {
                if payload.len() < 2 {
                    return false;
                }
                let fu = payload[1];
                let start = fu & 0x80 != 0;
                let end = fu & 0x40 != 0;
                if start {
                    let header = (payload[0] & 0xE0) | (fu & H264_NALU_TYPE_MASK);
                    self.frame.extend_from_slice(&ANNEX_B_START);
                    self.frame.put_u8(header);
                    self.frame.extend_from_slice(&payload[2..]);
                    self.fragment_active = true;
                } else if self.fragment_active {
                    self.frame.extend_from_slice(&payload[2..]);
                } else {
                    // Joined mid-fragment; wait for the next start.
                    return true;
                }
                if end {
                    self.fragment_active = false;
                    self.have_nal = true;
                }
                true
            }
            _ => false,
        }
    }
}

impl Depayloader for H264Depayloader {
    fn push(&mut self, packet: &Packet) -> Depayloaded {
        if !self.parse(&packet.payload) {
            return Depayloaded::Corrupt;
        }
        if packet.header.marker && self.have_nal && !self.fragment_active {
            let frame = self.frame.split().freeze();
            self.have_nal = false;
            return Depayloaded::Frames(vec![frame]);
        }
        if packet.header.marker {
            self.reset();
        }
        Depayloaded::NeedMore
    }

    fn reset(&mut self) {
        self.frame.clear();
        self.fragment_active = false;
        self.have_nal = false;
    }
}

/// H.265 depayloader (RFC 7798): single NAL, aggregation packets, and
/// fragmentation units. Emits Annex B access units on the marker bit.
#[derive(Default)]
pub struct H265Depayloader {
    frame: BytesMut,
    fragment_active: bool,
    have_nal: bool,
}

impl H265Depayloader {
    fn append_nal(&mut self, nal: &[u8]) {
        if nal.len() < 2 {
            return;
        }
        self.frame.extend_from_slice(&ANNEX_B_START);
        self.frame.extend_from_slice(nal);
        self.have_nal = true;
    }

    fn parse(&mut self, payload: &[u8]) -> bool {
        if payload.len() < 2 {
            return false;
        }
        let nal_type = (payload[0] >> 1) & 0x3F;
        match nal_type {
            H265_AP => {
                let mut offset = 2;
                while offset + 2 <= payload.len() {
                    let size = u16::from_be_bytes([payload[offset], payload[offset + 1]]) as usize;
                    offset += 2;
                    if size == 0 || offset + size > payload.len() {
                        return false;
                    }
                    self.append_nal(&payload[offset..offset + size]);
                    offset += size;
                }
                offset == payload.len()
            }
            H265_FU => {
                if payload.len() < 3 {
                    return false;
                }
                let fu = payload[2];
                let start = fu & 0x80 != 0;
                let end = fu & 0x40 != 0;
                if start {
                    let fu_type = fu & 0x3F;
                    self.frame.extend_from_slice(&ANNEX_B_START);
                    self.frame.put_u8((payload[0] & 0x81) | (fu_type << 1));
                    self.frame.put_u8(payload[1]);
                    self.frame.extend_from_slice(&payload[3..]);
                    self.fragment_active = true;
                } else if self.fragment_active {
                    self.frame.extend_from_slice(&payload[3..]);
                } else {
                    return true;
                }
                if end {
                    self.fragment_active = false;
                    self.have_nal = true;
                }
                true
            }
            _ => {
                self.append_nal(payload);
                true
            }
        }
    }
}

impl Depayloader for H265Depayloader {
    fn push(&mut self, packet: &Packet) -> Depayloaded {
        if !self.parse(&packet.payload) {
            return Depayloaded::Corrupt;
        }
        if packet.header.marker && self.have_nal && !self.fragment_active {
            let frame = self.frame.split().freeze();
            self.have_nal = false;
            return Depayloaded::Frames(vec![frame]);
        }
        if packet.header.marker {
            self.reset();
        }
        Depayloaded::NeedMore
    }

    fn reset(&mut self) {
        self.frame.clear();
        self.fragment_active = false;
        self.have_nal = false;
    }
}

/// VP8 depayloader (RFC 7741). Strips the payload descriptor and
/// reassembles one VP8 frame per marker run.
#[derive(Default)]
pub struct Vp8Depayloader {
    frame: BytesMut,
    started: bool,
}

impl Vp8Depayloader {
    /// Returns the descriptor length, or `None` on malformed input.
    fn descriptor_len(payload: &[u8]) -> Option<usize> {
        if payload.is_empty() {
            return None;
        }
        let mut idx = 1;
        if payload[0] & 0x80 != 0 {
            // X bit: extended control bits present.
            let ext = *payload.get(idx)?;
            idx += 1;
            if ext & 0x80 != 0 {
                // I bit: picture ID, one or two bytes.
                let pid = *payload.get(idx)?;
                idx += if pid & 0x80 != 0 { 2 } else { 1 };
            }
            if ext & 0x40 != 0 {
                // L bit: TL0PICIDX.
                idx += 1;
            }
            if ext & 0x30 != 0 {
                // T/K bits: TID/KEYIDX byte.
                idx += 1;
            }
        }
        if idx > payload.len() {
            return None;
        }
        Some(idx)
    }
}

impl Depayloader for Vp8Depayloader {
    fn push(&mut self, packet: &Packet) -> Depayloaded {
        let payload = &packet.payload;
        let Some(offset) = Self::descriptor_len(payload) else {
            return Depayloaded::Corrupt;
        };
        let start = payload[0] & 0x10 != 0 && payload[0] & 0x07 == 0;
        if start {
            self.frame.clear();
            self.started = true;
        }
        if !self.started {
            // Mid-stream join: wait for a frame boundary.
            return Depayloaded::NeedMore;
        }
        self.frame.extend_from_slice(&payload[offset..]);
        if packet.header.marker {
            self.started = false;
            return Depayloaded::Frames(vec![self.frame.split().freeze()]);
        }
        Depayloaded::NeedMore
    }

    fn reset(&mut self) {
        self.frame.clear();
        self.started = false;
    }
}

/// VP9 depayloader (flexible mode payload descriptor).
#[derive(Default)]
pub struct Vp9Depayloader {
    frame: BytesMut,
    started: bool,
}

impl Vp9Depayloader {
    fn descriptor_len(payload: &[u8]) -> Option<usize> {
        if payload.is_empty() {
            return None;
        }
        let b = payload[0];
        let (i, l, f, v) = (b & 0x80 != 0, b & 0x20 != 0, b & 0x10 != 0, b & 0x02 != 0);
        let mut idx = 1;
        if i {
            let pid = *payload.get(idx)?;
            idx += if pid & 0x80 != 0 { 2 } else { 1 };
        }
        if l {
            idx += 1;
            if !f {
                // Non-flexible mode carries TL0PICIDX.
                idx += 1;
            }
        }
        if v {
            // Scalability structure.
            let ss = *payload.get(idx)?;
            idx += 1;
            let n_s = ((ss >> 5) & 0x07) as usize + 1;
            if ss & 0x10 != 0 {
                idx += n_s * 4;
            }
            if ss & 0x08 != 0 {
                let n_g = *payload.get(idx)? as usize;
                idx += 1;
                for _ in 0..n_g {
                    let g = *payload.get(idx)?;
                    idx += 1;
                    idx += ((g >> 2) & 0x03) as usize;
                }
            }
        }
        if idx > payload.len() {
            return None;
        }
        Some(idx)
    }
}

impl Depayloader for Vp9Depayloader {
    fn push(&mut self, packet: &Packet) -> Depayloaded {
        let payload = &packet.payload;
        let Some(offset) = Self::descriptor_len(payload) else {
            return Depayloaded::Corrupt;
        };
        if payload[0] & 0x08 != 0 {
            // B bit: beginning of a frame.
            self.frame.clear();
            self.started = true;
        }
        if !self.started {
            return Depayloaded::NeedMore;
        }
        self.frame.extend_from_slice(&payload[offset..]);
        if packet.header.marker || payload[0] & 0x04 != 0 {
            self.started = false;
            return Depayloaded::Frames(vec![self.frame.split().freeze()]);
        }
        Depayloaded::NeedMore
    }

    fn reset(&mut self) {
        self.frame.clear();
        self.started = false;
    }
}

/// AV1 depayloader. Reassembles aggregation elements back into the
/// temporal unit's OBU stream; emits on the marker bit.
#[derive(Default)]
pub struct Av1Depayloader {
    frame: BytesMut,
    started: bool,
}

impl Av1Depayloader {
    fn read_leb128(data: &[u8]) -> Option<(usize, usize)> {
        let mut value: usize = 0;
        for (i, &b) in data.iter().enumerate().take(8) {
            value |= ((b & 0x7F) as usize) << (i * 7);
            if b & 0x80 == 0 {
                return Some((value, i + 1));
            }
        }
        None
    }
}

impl Depayloader for Av1Depayloader {
    fn push(&mut self, packet: &Packet) -> Depayloaded {
        let payload = &packet.payload;
        if payload.len() <= 1 {
            return Depayloaded::Corrupt;
        }
        let continuation = payload[0] & AV1_Z_MASK != 0;
        let count = (payload[0] & AV1_W_MASK) >> 4;
        if payload[0] & AV1_N_MASK != 0 {
            self.frame.clear();
            self.started = true;
        }
        if !continuation {
            self.started = true;
        }
        if !self.started {
            return Depayloaded::NeedMore;
        }

        let mut offset = 1;
        let mut element = 0u8;
        while offset < payload.len() {
            let last = count != 0 && element == count - 1;
            let len = if last {
                payload.len() - offset
            } else {
                let Some((len, n)) = Self::read_leb128(&payload[offset..]) else {
                    return Depayloaded::Corrupt;
                };
                offset += n;
                len
            };
            if offset + len > payload.len() {
                return Depayloaded::Corrupt;
            }
            self.frame.extend_from_slice(&payload[offset..offset + len]);
            offset += len;
            element += 1;
        }

        if packet.header.marker {
            self.started = false;
            return Depayloaded::Frames(vec![self.frame.split().freeze()]);
        }
        Depayloaded::NeedMore
    }

    fn reset(&mut self) {
        self.frame.clear();
        self.started = false;
    }
}

/// Audio depayloader: every RTP packet carries exactly one coded frame
/// (Opus packet, G.711/G.722 sample run).
#[derive(Default)]
pub struct AudioDepayloader;

impl Depayloader for AudioDepayloader {
    fn push(&mut self, packet: &Packet) -> Depayloaded {
        if packet.payload.is_empty() {
            return Depayloaded::Corrupt;
        }
        Depayloaded::Frames(vec![packet.payload.clone()])
    }

    fn reset(&mut self) {}
}
