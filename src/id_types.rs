use std::fmt;
use std::sync::Arc;

/// A strongly typed identifier for a media stream (MSID).
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StreamId(pub Arc<String>);

/// A strongly typed identifier for a track within a stream.
/// Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TrackId(pub Arc<String>);

/// A strongly typed RTP stream identifier (RID), empty for non-simulcast
/// tracks. Wraps an `Arc<String>` for cheap cloning.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RtpStreamId(pub Arc<String>);

// Implement Display for easy logging
impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RtpStreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Implement conversion from String/&str
impl From<String> for StreamId {
    fn from(s: String) -> Self {
        StreamId(Arc::new(s))
    }
}

impl From<&str> for StreamId {
    fn from(s: &str) -> Self {
        StreamId(Arc::new(s.to_string()))
    }
}

impl From<String> for TrackId {
    fn from(s: String) -> Self {
        TrackId(Arc::new(s))
    }
}

impl From<&str> for TrackId {
    fn from(s: &str) -> Self {
        TrackId(Arc::new(s.to_string()))
    }
}

impl From<String> for RtpStreamId {
    fn from(s: String) -> Self {
        RtpStreamId(Arc::new(s))
    }
}

impl From<&str> for RtpStreamId {
    fn from(s: &str) -> Self {
        RtpStreamId(Arc::new(s.to_string()))
    }
}

// Helper for referencing the inner string
impl AsRef<str> for StreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for TrackId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for RtpStreamId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_id_conversion() {
        let id_str = "stream-123";
        let id: StreamId = StreamId::from(id_str);
        assert_eq!(id.as_ref(), id_str);

        let id_string = String::from("stream-456");
        let id2: StreamId = StreamId::from(id_string.clone());
        assert_eq!(id2.as_ref(), "stream-456");
    }

    #[test]
    fn test_track_id_conversion() {
        let id = TrackId::from("track-1");
        assert_eq!(id.to_string(), "track-1");
    }

    #[test]
    fn test_rtp_stream_id_conversion() {
        let id = RtpStreamId::from("q");
        assert_eq!(id.as_ref(), "q");
    }

    #[test]
    fn test_display_trait() {
        let id = StreamId::from("stream-string");
        assert_eq!(format!("{}", id), "stream-string");
    }
}
