use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info, warn};
use uuid::Uuid;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};

use crate::codecs::CodecId;
use crate::metrics::{TRANSCODER_ACTIVE_PIPELINES, TRANSCODER_ACTIVE_SESSIONS};
use crate::pb::transcoder::transcoder_server::Transcoder as TranscoderRpc;
use crate::pb::transcoder::{SignalMessage, TranscodeRequest, TranscodeResponse};
use crate::peer::PeerLink;
use crate::pipeline::{PipelineState, Transcoder};
use crate::rendezvous::Rendezvous;
use crate::session::{Session, Source};
use crate::types::{track_key, TrackKey};

/// How long a `Transcode` request waits for its track to arrive and for
/// output negotiation to settle.
pub const TRANSCODE_TIMEOUT: Duration = Duration::from_secs(30);

/// The gRPC surface: a bidirectional `Signal` stream per peer session
/// and a unary `Transcode` that pairs with an arrived remote track.
pub struct TranscoderService {
    config: RTCConfiguration,
    sessions: Arc<DashMap<Uuid, Arc<Session>>>,
    rendezvous: Arc<Rendezvous<Source>>,
}

impl TranscoderService {
    pub fn new(config: RTCConfiguration) -> Self {
        TranscoderService {
            config,
            sessions: Arc::new(DashMap::new()),
            rendezvous: Rendezvous::new(),
        }
    }

    /// Gracefully closes every active session.
    pub async fn shutdown(&self) {
        info!("closing {} active sessions", self.sessions.len());
        let ids: Vec<_> = self.sessions.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, session)) = self.sessions.remove(&id) {
                session.close().await;
            }
        }
    }

    async fn provision_pipeline(
        &self,
        req: &TranscodeRequest,
        key: TrackKey,
        source: Source,
    ) -> Result<TranscodeResponse, Status> {
        let track = source.track.clone();
        let input = track.codec();
        let requested = if req.mime_type.is_empty() {
            None
        } else {
            Some(CodecId::from_mime_type(&req.mime_type).map_err(Status::from)?)
        };
        let out_codec = match requested {
            Some(codec) => codec,
            None => CodecId::default_output(track.kind())
                .ok_or_else(|| Status::invalid_argument("track has no media kind"))?,
        };
        if !out_codec.is_transcode_target() {
            return Err(Status::invalid_argument(format!(
                "{} is not available as transcode output",
                out_codec.mime_type()
            )));
        }
        let recipe = if req.encoder_recipe.is_empty() {
            None
        } else {
            Some(req.encoder_recipe.clone())
        };

        info!(
            ?key,
            input = %input.capability.mime_type,
            output = %out_codec.mime_type(),
            "provisioning pipeline"
        );

        let transcoder = Transcoder::new(input, out_codec, recipe).map_err(Status::from)?;

        // Upstream keyframe requests become PLI towards the source.
        let media_ssrc = track.ssrc();
        let pli_peer = source.session.peer.clone();
        transcoder.on_upstream_force_key_unit(move || {
            let peer = pli_peer.clone();
            tokio::spawn(async move {
                if let Err(e) = peer.request_key_frame(media_ssrc).await {
                    debug!(error = %e, "failed to send PLI");
                }
            });
        });

        // Ingress: remote track into the pipeline.
        let feed_track = track.clone();
        let feed = transcoder.clone();
        tokio::spawn(async move {
            while let Ok((packet, _)) = feed_track.read_rtp().await {
                if feed.write_rtp(&packet).is_err() {
                    break;
                }
            }
        });

        // Video decode cannot start before an IDR; nudge the source
        // until negotiation settles.
        if track.kind() == webrtc::rtp_transceiver::rtp_codec::RTPCodecType::Video {
            let nudge_peer = source.session.peer.clone();
            let nudge = transcoder.clone();
            tokio::spawn(async move {
                for _ in 0..10 {
                    if !matches!(
                        nudge.state(),
                        PipelineState::Provisioning | PipelineState::Negotiating
                    ) {
                        break;
                    }
                    let _ = nudge_peer.request_key_frame(media_ssrc).await;
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            });
        }

        // Output parameters only exist once encoding has begun.
        let params = tokio::time::timeout(TRANSCODE_TIMEOUT, transcoder.codec())
            .await
            .map_err(|_| Status::deadline_exceeded("output negotiation timed out"))?
            .map_err(Status::from)?;

        let local_track = Arc::new(TrackLocalStaticRTP::new(
            params.capability.clone(),
            track.id(),
            track.stream_id(),
        ));

        let sender = {
            // add_track on one connection must never run concurrently.
            let _guard = source.session.add_track_lock.lock().await;
            source
                .session
                .peer
                .add_media_track(Arc::clone(&local_track) as Arc<dyn TrackLocal + Send + Sync>)
                .await
                .map_err(|e| Status::internal(format!("failed to add track: {}", e)))?
        };
        spawn_pli_monitor(sender, source.session.peer.clone(), media_ssrc);

        source.session.pipelines.insert(key.clone(), transcoder.clone());
        TRANSCODER_ACTIVE_PIPELINES.inc();

        // Egress: transcoded packets onto the local track.
        let session = source.session.clone();
        tokio::spawn(async move {
            while let Some(packet) = transcoder.read_rtp().await {
                if let Err(e) = local_track.write_rtp(&packet).await {
                    warn!(error = %e, "failed to write transcoded packet");
                    break;
                }
            }
            if session.pipelines.remove(&key).is_some() {
                TRANSCODER_ACTIVE_PIPELINES.dec();
            }
        });

        Ok(TranscodeResponse {
            stream_id: track.stream_id(),
            track_id: track.id(),
            rtp_stream_id: track.rid().to_string(),
        })
    }
}

/// Forwards PLI feedback arriving on a local sender back to the media
/// source as a fresh keyframe request.
fn spawn_pli_monitor(sender: Arc<RTCRtpSender>, peer: Arc<dyn PeerLink>, media_ssrc: u32) {
    tokio::spawn(async move {
        let mut rtcp_buf = vec![0u8; 1500];
        while let Ok((packets, _)) = sender.read(&mut rtcp_buf).await {
            for packet in packets {
                if packet.as_any().is::<PictureLossIndication>() {
                    if let Err(e) = peer.request_key_frame(media_ssrc).await {
                        debug!(error = %e, "failed to forward PLI");
                    }
                }
            }
        }
    });
}

#[tonic::async_trait]
impl TranscoderRpc for TranscoderService {
    type SignalStream = ReceiverStream<Result<SignalMessage, Status>>;

    async fn signal(
        &self,
        request: Request<Streaming<SignalMessage>>,
    ) -> Result<Response<Self::SignalStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(100);

        let session = Session::new(self.config.clone(), self.rendezvous.clone(), tx)
            .await
            .map_err(|e| Status::internal(format!("failed to create session: {}", e)))?;
        let id = session.shared.id;
        self.sessions.insert(id, session.clone());
        TRANSCODER_ACTIVE_SESSIONS.inc();

        let sessions = self.sessions.clone();
        let rendezvous = self.rendezvous.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.next().await {
                match message {
                    Ok(message) => {
                        let Some(payload) = message.payload else { continue };
                        if let Err(e) = session.handle_signal(payload).await {
                            // Surfaced per-message; the session survives.
                            warn!(session = %id, error = %e, "signalling error");
                        }
                    }
                    Err(e) => {
                        debug!(session = %id, error = %e, "signal stream ended");
                        break;
                    }
                }
            }

            sessions.remove(&id);
            TRANSCODER_ACTIVE_SESSIONS.dec();
            rendezvous.remove_parked(|source: &Source| source.session.id == id);
            session.close().await;
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn transcode(
        &self,
        request: Request<TranscodeRequest>,
    ) -> Result<Response<TranscodeResponse>, Status> {
        let req = request.into_inner();
        if req.stream_id.is_empty() || req.track_id.is_empty() {
            return Err(Status::invalid_argument(
                "stream_id and track_id must not be empty",
            ));
        }
        // Reject unknown codecs before waiting on the rendezvous.
        if !req.mime_type.is_empty() {
            CodecId::from_mime_type(&req.mime_type).map_err(Status::from)?;
        }

        let key = track_key(&req.stream_id, &req.track_id, &req.rtp_stream_id);
        info!(?key, "transcode requested");

        let source = tokio::time::timeout(
            TRANSCODE_TIMEOUT,
            self.rendezvous.watch(key.clone()).wait(),
        )
        .await
        .map_err(|_| Status::deadline_exceeded("no matching track arrived"))?
        .map_err(Status::from)?;

        let response = self.provision_pipeline(&req, key, source).await?;
        Ok(Response::new(response))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_service() -> TranscoderService {
        TranscoderService::new(RTCConfiguration::default())
    }

    #[tokio::test]
    async fn test_transcode_missing_args() {
        let service = create_test_service();
        let req = Request::new(TranscodeRequest {
            stream_id: "".to_string(),
            track_id: "t".to_string(),
            rtp_stream_id: "".to_string(),
            mime_type: "".to_string(),
            encoder_recipe: "".to_string(),
        });
        let res = service.transcode(req).await;
        assert!(res.is_err());
        assert_eq!(res.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_transcode_unknown_mime() {
        let service = create_test_service();
        let req = Request::new(TranscodeRequest {
            stream_id: "s".to_string(),
            track_id: "t".to_string(),
            rtp_stream_id: "".to_string(),
            mime_type: "video/MJPEG".to_string(),
            encoder_recipe: "".to_string(),
        });
        let res = service.transcode(req).await;
        assert!(res.is_err());
        assert_eq!(res.unwrap_err().code(), tonic::Code::InvalidArgument);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_sessions() {
        let service = create_test_service();
        service.shutdown().await;
        assert_eq!(service.sessions.len(), 0);
    }
}
