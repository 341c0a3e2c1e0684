use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::TrackLocal;

use crate::codecs;

/// The slice of peer-connection behavior pipelines are allowed to touch.
///
/// Pipelines never hold the connection itself; the session controller
/// owns it and hands out this capability object, which keeps the
/// ownership graph acyclic.
#[async_trait]
pub trait PeerLink: Send + Sync {
    async fn add_media_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>>;

    async fn write_rtcp(
        &self,
        packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>],
    ) -> Result<()>;

    /// Sends a PLI towards the media source identified by `media_ssrc`.
    async fn request_key_frame(&self, media_ssrc: u32) -> Result<()> {
        let pli = PictureLossIndication {
            sender_ssrc: 0,
            media_ssrc,
        };
        self.write_rtcp(&[Box::new(pli)]).await
    }
}

#[async_trait]
impl PeerLink for RTCPeerConnection {
    async fn add_media_track(
        &self,
        track: Arc<dyn TrackLocal + Send + Sync>,
    ) -> Result<Arc<RTCRtpSender>> {
        Ok(self.add_track(track).await?)
    }

    async fn write_rtcp(
        &self,
        packets: &[Box<dyn webrtc::rtcp::packet::Packet + Send + Sync>],
    ) -> Result<()> {
        RTCPeerConnection::write_rtcp(self, packets).await?;
        Ok(())
    }
}

/// Builds a WebRTC API with the full output codec table and the default
/// interceptor chain registered.
pub fn create_transcoder_api() -> Result<API> {
    let mut media_engine = MediaEngine::default();

    for codec in codecs::default_output_codecs() {
        let kind = if codec.capability.mime_type.starts_with("video/") {
            RTPCodecType::Video
        } else {
            RTPCodecType::Audio
        };
        media_engine.register_codec(codec, kind)?;
    }

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine)?;

    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

pub fn rtc_config(stun_url: &str) -> RTCConfiguration {
    RTCConfiguration {
        ice_servers: vec![RTCIceServer {
            urls: vec![stun_url.to_string()],
            ..Default::default()
        }],
        ..Default::default()
    }
}

pub async fn new_transcoder_peer_connection(
    config: RTCConfiguration,
) -> Result<RTCPeerConnection> {
    let api = create_transcoder_api()?;
    Ok(api.new_peer_connection(config).await?)
}
