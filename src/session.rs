use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_remote::TrackRemote;

use crate::error::TranscodeError;
use crate::pb::transcoder::{signal_message, SignalMessage};
use crate::peer::{new_transcoder_peer_connection, PeerLink};
use crate::rendezvous::Rendezvous;
use crate::types::{track_key, PipelineMap, SignalSender};

/// Session state shared with transcode handlers: the peer capability,
/// the per-session pipeline registry, and the add-track serialization
/// lock (concurrent `add_track` calls on one connection are unsafe).
pub struct SessionShared {
    pub id: Uuid,
    pub peer: Arc<dyn PeerLink>,
    pub pipelines: PipelineMap,
    pub add_track_lock: Mutex<()>,
}

/// A remote track that arrived on some session, waiting to be claimed
/// by a `Transcode` request.
#[derive(Clone)]
pub struct Source {
    pub track: Arc<TrackRemote>,
    pub session: Arc<SessionShared>,
}

/// Per-client controller: owns the peer connection for one `Signal`
/// stream, fans inbound tracks into the rendezvous, and tears down all
/// pipelines before the connection on close.
pub struct Session {
    pub shared: Arc<SessionShared>,
    pc: Arc<RTCPeerConnection>,
    outbound: SignalSender,
}

impl Session {
    pub async fn new(
        config: webrtc::peer_connection::configuration::RTCConfiguration,
        rendezvous: Arc<Rendezvous<Source>>,
        outbound: SignalSender,
    ) -> anyhow::Result<Arc<Session>> {
        let pc = Arc::new(new_transcoder_peer_connection(config).await?);
        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            peer: pc.clone() as Arc<dyn PeerLink>,
            pipelines: DashMap::new(),
            add_track_lock: Mutex::new(()),
        });

        let session = Arc::new(Session {
            shared,
            pc,
            outbound,
        });
        session.attach_handlers(rendezvous);

        info!(session = %session.shared.id, "session created");
        Ok(session)
    }

    fn attach_handlers(self: &Arc<Self>, rendezvous: Arc<Rendezvous<Source>>) {
        let session_id = self.shared.id;

        // Offer whenever local media changes.
        let pc_negotiate = self.pc.clone();
        let tx_negotiate = self.outbound.clone();
        self.pc.on_negotiation_needed(Box::new(move || {
            let pc = pc_negotiate.clone();
            let tx = tx_negotiate.clone();
            Box::pin(async move {
                let offer = match pc.create_offer(None).await {
                    Ok(offer) => offer,
                    Err(e) => {
                        error!(session = %session_id, error = %e, "failed to create offer");
                        return;
                    }
                };
                let sdp = offer.sdp.clone();
                if let Err(e) = pc.set_local_description(offer).await {
                    error!(session = %session_id, error = %e, "failed to set local description");
                    return;
                }
                let _ = tx
                    .send(Ok(SignalMessage {
                        payload: Some(signal_message::Payload::OfferSdp(sdp)),
                    }))
                    .await;
            })
        }));

        // Trickle ICE out as candidates gather.
        let tx_candidate = self.outbound.clone();
        self.pc.on_ice_candidate(Box::new(
            move |candidate: Option<webrtc::ice_transport::ice_candidate::RTCIceCandidate>| {
                let tx = tx_candidate.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else { return };
                    let init = match candidate.to_json() {
                        Ok(init) => init,
                        Err(e) => {
                            error!(session = %session_id, error = %e, "failed to marshal candidate");
                            return;
                        }
                    };
                    let json = match serde_json::to_string(&init) {
                        Ok(json) => json,
                        Err(e) => {
                            error!(session = %session_id, error = %e, "failed to encode candidate");
                            return;
                        }
                    };
                    let _ = tx
                        .send(Ok(SignalMessage {
                            payload: Some(signal_message::Payload::Trickle(json)),
                        }))
                        .await;
                })
            },
        ));

        // Inbound tracks rendezvous with Transcode requests.
        let shared = self.shared.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>, _receiver, _transceiver| {
                let rendezvous = rendezvous.clone();
                let shared = shared.clone();
                Box::pin(async move {
                    let key = track_key(&track.stream_id(), &track.id(), track.rid());
                    info!(
                        session = %shared.id,
                        ?key,
                        mime = %track.codec().capability.mime_type,
                        ssrc = %track.ssrc(),
                        "remote track arrived"
                    );
                    rendezvous.register_arrival(
                        key,
                        Source {
                            track,
                            session: shared,
                        },
                    );
                })
            },
        ));

        // Peer loss cascades into pipeline teardown.
        let session_close = Arc::downgrade(self);
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let session = session_close.clone();
                Box::pin(async move {
                    info!(session_state = %state, "peer connection state changed");
                    if matches!(
                        state,
                        RTCPeerConnectionState::Failed | RTCPeerConnectionState::Closed
                    ) {
                        if let Some(session) = session.upgrade() {
                            session.close_pipelines().await;
                        }
                    }
                })
            }));
    }

    /// Applies one inbound signalling message. Failures are surfaced to
    /// the caller but never tear down the session.
    pub async fn handle_signal(&self, payload: signal_message::Payload) -> Result<(), TranscodeError> {
        match payload {
            signal_message::Payload::OfferSdp(sdp) => {
                debug!(session = %self.shared.id, "applying remote offer");
                let offer = RTCSessionDescription::offer(sdp)
                    .map_err(|e| TranscodeError::Signalling(format!("invalid offer: {}", e)))?;
                self.pc
                    .set_remote_description(offer)
                    .await
                    .map_err(|e| TranscodeError::Signalling(format!("apply offer: {}", e)))?;

                let answer = self
                    .pc
                    .create_answer(None)
                    .await
                    .map_err(|e| TranscodeError::Signalling(format!("create answer: {}", e)))?;
                let sdp = answer.sdp.clone();
                self.pc
                    .set_local_description(answer)
                    .await
                    .map_err(|e| TranscodeError::Signalling(format!("set local answer: {}", e)))?;

                let _ = self
                    .outbound
                    .send(Ok(SignalMessage {
                        payload: Some(signal_message::Payload::AnswerSdp(sdp)),
                    }))
                    .await;
                Ok(())
            }
            signal_message::Payload::AnswerSdp(sdp) => {
                debug!(session = %self.shared.id, "applying remote answer");
                let answer = RTCSessionDescription::answer(sdp)
                    .map_err(|e| TranscodeError::Signalling(format!("invalid answer: {}", e)))?;
                self.pc
                    .set_remote_description(answer)
                    .await
                    .map_err(|e| TranscodeError::Signalling(format!("apply answer: {}", e)))
            }
            signal_message::Payload::Trickle(json) => {
                let candidate: RTCIceCandidateInit = serde_json::from_str(&json)
                    .map_err(|e| TranscodeError::Signalling(format!("invalid candidate: {}", e)))?;
                self.pc
                    .add_ice_candidate(candidate)
                    .await
                    .map_err(|e| TranscodeError::Signalling(format!("add candidate: {}", e)))
            }
        }
    }

    /// Moves every pipeline through draining concurrently.
    async fn close_pipelines(&self) {
        let pipelines: Vec<_> = self
            .shared
            .pipelines
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.shared.pipelines.clear();

        let mut tasks = tokio::task::JoinSet::new();
        for pipeline in pipelines {
            tasks.spawn(async move { pipeline.close().await });
        }
        while tasks.join_next().await.is_some() {}
    }

    /// Drains all pipelines, then tears the peer connection down.
    pub async fn close(&self) {
        info!(session = %self.shared.id, "closing session");
        self.close_pipelines().await;
        if let Err(e) = self.pc.close().await {
            warn!(session = %self.shared.id, error = %e, "error closing peer connection");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    async fn test_session() -> (Arc<Session>, mpsc::Receiver<Result<SignalMessage, tonic::Status>>)
    {
        let (tx, rx) = mpsc::channel(16);
        let rendezvous = Rendezvous::new();
        let session = Session::new(Default::default(), rendezvous, tx).await.unwrap();
        (session, rx)
    }

    #[tokio::test]
    async fn test_invalid_offer_keeps_session_open() {
        let (session, _rx) = test_session().await;
        let result = session
            .handle_signal(signal_message::Payload::OfferSdp("not sdp".to_string()))
            .await;
        assert!(matches!(result, Err(TranscodeError::Signalling(_))));

        // The session is still usable afterwards.
        let result = session
            .handle_signal(signal_message::Payload::Trickle("{}".to_string()))
            .await;
        // Empty candidate JSON parses to a default candidate; either
        // outcome must be a signalling-scoped error at worst.
        if let Err(e) = result {
            assert!(matches!(e, TranscodeError::Signalling(_)));
        }
    }

    #[tokio::test]
    async fn test_invalid_trickle_rejected() {
        let (session, _rx) = test_session().await;
        let result = session
            .handle_signal(signal_message::Payload::Trickle("][".to_string()))
            .await;
        assert!(matches!(result, Err(TranscodeError::Signalling(_))));
    }

    #[tokio::test]
    async fn test_close_is_idempotent_enough() {
        let (session, _rx) = test_session().await;
        session.close().await;
        session.close().await;
    }
}
