use std::time::SystemTime;

use bytes::Bytes;
use rand::Rng;
use webrtc::rtp::extension::abs_send_time_extension::AbsSendTimeExtension;
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Marshal;

use crate::error::TranscodeError;
use crate::media::CodedFrame;
use crate::payload::Payloader;

/// MTU cap for emitted packets, including the 12-byte RTP header.
pub const DEFAULT_MTU: usize = 1200;

const RTP_HEADER_SIZE: usize = 12;

/// Wraps encoder output in RTP with a fresh SSRC, a random initial
/// sequence number, and a per-track-random timestamp offset. All packets
/// of one coded frame share a timestamp derived from the frame's pts;
/// the marker bit is set only on the last packet of each frame.
pub struct Packetizer {
    mtu: usize,
    payload_type: u8,
    ssrc: u32,
    payloader: Box<dyn Payloader>,
    sequence: u16,
    timestamp_offset: u32,
    abs_send_time_id: Option<u8>,
}

impl Packetizer {
    pub fn new(mtu: usize, payload_type: u8, payloader: Box<dyn Payloader>) -> Self {
        let mut rng = rand::thread_rng();
        Packetizer {
            mtu,
            payload_type,
            ssrc: rng.gen::<u32>(),
            payloader,
            sequence: rng.gen::<u16>(),
            timestamp_offset: rng.gen::<u32>(),
            abs_send_time_id: None,
        }
    }

    pub fn ssrc(&self) -> u32 {
        self.ssrc
    }

    /// Enables the abs-send-time header extension under the given
    /// extension id; it is stamped on the last packet of each frame.
    pub fn enable_abs_send_time(&mut self, id: u8) {
        self.abs_send_time_id = Some(id);
    }

    /// Timestamps derive from pts, not from sample counting, so skipped
    /// samples need no compensation.
    pub fn skip_samples(&mut self, _skipped: u32) {}

    /// Produces 1..N RTP packets for one coded frame.
    pub fn packetize(&mut self, frame: &CodedFrame) -> Result<Vec<Packet>, TranscodeError> {
        if frame.data.is_empty() {
            return Ok(vec![]);
        }

        let payloads = self
            .payloader
            .payload(self.mtu - RTP_HEADER_SIZE, &frame.data);
        let timestamp = self.timestamp_offset.wrapping_add(frame.pts as u32);
        let count = payloads.len();

        let mut packets = Vec::with_capacity(count);
        for (i, payload) in payloads.into_iter().enumerate() {
            let header = Header {
                version: 2,
                padding: false,
                extension: false,
                marker: i == count - 1,
                payload_type: self.payload_type,
                sequence_number: self.sequence,
                timestamp,
                ssrc: self.ssrc,
                ..Default::default()
            };
            self.sequence = self.sequence.wrapping_add(1);
            packets.push(Packet { header, payload });
        }

        if let (Some(id), Some(last)) = (self.abs_send_time_id, packets.last_mut()) {
            let ext = AbsSendTimeExtension::new(SystemTime::now());
            let raw: Bytes = ext
                .marshal()
                .map_err(|_| TranscodeError::Malformed("abs-send-time extension"))?;
            last.header
                .set_extension(id, raw)
                .map_err(|_| TranscodeError::Malformed("rtp header extension"))?;
        }

        Ok(packets)
    }
}
