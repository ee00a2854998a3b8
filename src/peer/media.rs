//! Local and remote media stream types
//!
//! Media capture and rendering stay outside this crate; callers hand the
//! coordinator a [`MediaSource`] that yields the local tracks to negotiate,
//! and receive a [`RemoteStream`] handle when remote media arrives.

use crate::signaling::protocol::SessionId;
use crate::Result;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Local media offered into a session. Audio and video are both optional;
/// an empty stream negotiates a receive-only session.
#[derive(Clone, Default)]
pub struct LocalStream {
    pub audio: Option<Arc<TrackLocalStaticSample>>,
    pub video: Option<Arc<TrackLocalStaticSample>>,
}

impl LocalStream {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_audio(mut self, track: Arc<TrackLocalStaticSample>) -> Self {
        self.audio = Some(track);
        self
    }

    pub fn with_video(mut self, track: Arc<TrackLocalStaticSample>) -> Self {
        self.video = Some(track);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.audio.is_none() && self.video.is_none()
    }

    /// Tracks in the stream, audio first
    pub fn tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        let mut tracks: Vec<Arc<dyn TrackLocal + Send + Sync>> = Vec::new();
        if let Some(audio) = &self.audio {
            tracks.push(Arc::clone(audio) as Arc<dyn TrackLocal + Send + Sync>);
        }
        if let Some(video) = &self.video {
            tracks.push(Arc::clone(video) as Arc<dyn TrackLocal + Send + Sync>);
        }
        tracks
    }
}

impl fmt::Debug for LocalStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalStream")
            .field("audio", &self.audio.is_some())
            .field("video", &self.video.is_some())
            .finish()
    }
}

/// Handle to media received from the remote peer
#[derive(Clone)]
pub struct RemoteStream {
    pub session_id: SessionId,
    /// Stream id announced by the remote peer (msid)
    pub stream_id: String,
    pub tracks: Vec<Arc<TrackRemote>>,
}

impl fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteStream")
            .field("session_id", &self.session_id)
            .field("stream_id", &self.stream_id)
            .field("tracks", &self.tracks.len())
            .finish()
    }
}

/// Produces the local media stream for new sessions.
///
/// Implementations that capture from real devices should return
/// [`Error::MediaAccess`](crate::Error::MediaAccess) when permission is
/// denied; that error fails the session with a "media permission denied"
/// reason.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self) -> Result<LocalStream>;
}

/// Media source that hands out a prebuilt stream
pub struct StaticMediaSource {
    stream: LocalStream,
}

impl StaticMediaSource {
    pub fn new(stream: LocalStream) -> Self {
        Self { stream }
    }
}

#[async_trait]
impl MediaSource for StaticMediaSource {
    async fn acquire(&self) -> Result<LocalStream> {
        Ok(self.stream.clone())
    }
}

/// Media source producing sample-fed Opus audio and VP9 video tracks.
///
/// The application writes encoded samples into the tracks; this source only
/// declares them so they appear in negotiation.
pub struct SampleMediaSource {
    stream_id: String,
}

impl SampleMediaSource {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            stream_id: stream_id.into(),
        }
    }
}

#[async_trait]
impl MediaSource for SampleMediaSource {
    async fn acquire(&self) -> Result<LocalStream> {
        let audio = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "audio/opus".to_string(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("audio-{}", self.stream_id),
            format!("stream-{}", self.stream_id),
        ));

        let video = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: "video/VP9".to_string(),
                clock_rate: 90000,
                channels: 0,
                sdp_fmtp_line: String::new(),
                rtcp_feedback: vec![],
            },
            format!("video-{}", self.stream_id),
            format!("stream-{}", self.stream_id),
        ));

        Ok(LocalStream::new().with_audio(audio).with_video(video))
    }
}
