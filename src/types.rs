use crate::id_types::{RtpStreamId, StreamId, TrackId};
use crate::pb::transcoder::SignalMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use tonic::Status;

/// Unique identifier for a track as addressed by `Transcode` requests:
/// `(StreamId, TrackId, RtpStreamId)`.
pub type TrackKey = (StreamId, TrackId, RtpStreamId);

/// Channel type for sending `SignalMessage`s back to the client over the
/// gRPC stream. The `Status` error type indicates gRPC stream errors.
pub type SignalSender = mpsc::Sender<Result<SignalMessage, Status>>;

/// A thread-safe, concurrent map storing a session's active pipelines,
/// keyed by `TrackKey`.
pub type PipelineMap = dashmap::DashMap<TrackKey, Arc<crate::pipeline::Transcoder>>;

/// Builds a `TrackKey` from the plain string fields carried on the wire.
pub fn track_key(stream_id: &str, track_id: &str, rtp_stream_id: &str) -> TrackKey {
    (
        StreamId::from(stream_id),
        TrackId::from(track_id),
        RtpStreamId::from(rtp_stream_id),
    )
}
