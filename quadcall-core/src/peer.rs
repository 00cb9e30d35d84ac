//! Peer connection management
//!
//! [`PeerBackend`] is the seam to the WebRTC implementation; [`RtcPeerFactory`]
//! builds backends on webrtc-rs. Backend callbacks arrive as [`PeerEvent`]s on
//! a channel and are pumped by [`PeerSession`], which also owns the remote
//! candidate queue.

use crate::config::IceServer;
use crate::identity::UserId;
use crate::media::LocalTrack;
use crate::signaling::SignalingError;
use crate::types::{CallId, CandidateInit, SdpType, SessionDescription, TrackKind};
use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// Peer connection errors
#[derive(Error, Debug)]
pub enum PeerError {
    /// Connection could not be created
    #[error("Peer connection setup failed: {0}")]
    Setup(String),

    /// Offer/answer step rejected
    #[error("Negotiation failed: {0}")]
    Negotiation(String),

    /// Track could not be attached or replaced
    #[error("Track error: {0}")]
    Track(String),

    /// ICE gave up
    #[error("Peer connection failed")]
    ConnectionFailed,

    /// Connection already closed
    #[error("Peer connection closed")]
    Closed,
}

/// Connection state reported by the backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    /// Created
    New,
    /// ICE/DTLS in progress
    Connecting,
    /// Media can flow
    Connected,
    /// Temporarily lost
    Disconnected,
    /// Gave up
    Failed,
    /// Closed locally
    Closed,
}

/// Track announced by the remote peer
#[derive(Clone)]
pub struct RemoteTrack {
    /// Track id
    pub id: String,
    /// Remote stream id
    pub stream_id: String,
    /// Audio or video
    pub kind: TrackKind,
    /// RTP source, absent for scripted backends
    pub rtp: Option<Arc<TrackRemote>>,
}

impl std::fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

impl PartialEq for RemoteTrack {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.stream_id == other.stream_id && self.kind == other.kind
    }
}

/// Remote media of a call
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteStream {
    /// Announced tracks, in arrival order
    pub tracks: Vec<RemoteTrack>,
}

impl RemoteStream {
    /// Add a track unless one with the same id is present; returns whether it was added
    pub fn add(&mut self, track: RemoteTrack) -> bool {
        if self.tracks.iter().any(|t| t.id == track.id) {
            return false;
        }
        self.tracks.push(track);
        true
    }

    /// Whether a track of `kind` is present
    #[must_use]
    pub fn has(&self, kind: TrackKind) -> bool {
        self.tracks.iter().any(|t| t.kind == kind)
    }
}

/// Backend callback, delivered as a message
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
    /// Local ICE candidate discovered
    LocalCandidate(CandidateInit),
    /// Remote track announced
    RemoteTrack(RemoteTrack),
    /// Connection state changed
    StateChanged(PeerState),
}

/// One WebRTC peer connection
#[async_trait]
pub trait PeerBackend: Send + Sync {
    /// Attach a local track
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Swap the outgoing track of the same kind without renegotiating
    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError>;

    /// Create an offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, PeerError>;

    /// Create an answer and set it as the local description
    async fn create_answer(&self) -> Result<SessionDescription, PeerError>;

    /// Set the remote description
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError>;

    /// Apply a remote candidate
    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError>;

    /// Close the connection
    async fn close(&self) -> Result<(), PeerError>;
}

/// Creates peer connections
#[async_trait]
pub trait PeerConnectionFactory: Send + Sync {
    /// Create a connection reporting its callbacks on `events`
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, PeerError>;
}

/// Destination for local candidates
#[async_trait]
pub trait CandidateSink: Send + Sync {
    /// Publish one candidate for `call_id` as `sender`
    async fn publish_candidate(
        &self,
        call_id: &CallId,
        sender: &UserId,
        candidate: CandidateInit,
    ) -> Result<(), SignalingError>;
}

/// What happened to a remote candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateDisposition {
    /// Handed to the backend
    Applied,
    /// Held until the remote description is set
    Queued,
    /// Backend refused it; logged and skipped
    Rejected,
}

#[derive(Default)]
struct CandidateQueue {
    remote_set: bool,
    pending: VecDeque<CandidateInit>,
}

/// A peer connection bound to one call
pub struct PeerSession {
    call_id: CallId,
    backend: Arc<dyn PeerBackend>,
    queue: Mutex<CandidateQueue>,
    pump: JoinHandle<()>,
    closed: AtomicBool,
}

impl PeerSession {
    /// Create a connection and start pumping its events
    ///
    /// Local candidates go to `sink` one by one as they are discovered. Remote
    /// tracks (once per id) and state changes go to `notify`.
    ///
    /// # Errors
    ///
    /// Returns error if the backend cannot be created
    #[tracing::instrument(skip(factory, ice_servers, sink, notify), fields(call_id = %call_id))]
    pub async fn open<F>(
        factory: &dyn PeerConnectionFactory,
        ice_servers: &[IceServer],
        call_id: CallId,
        local_user: UserId,
        sink: Arc<dyn CandidateSink>,
        notify: F,
    ) -> Result<Self, PeerError>
    where
        F: Fn(PeerEvent) + Send + Sync + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let backend = factory.create(ice_servers, tx).await?;

        let pump_call = call_id.clone();
        let pump = tokio::spawn(async move {
            let mut seen = HashSet::new();
            while let Some(event) = rx.recv().await {
                match event {
                    PeerEvent::LocalCandidate(candidate) => {
                        if let Err(e) = sink
                            .publish_candidate(&pump_call, &local_user, candidate)
                            .await
                        {
                            tracing::warn!(call_id = %pump_call, error = %e, "Failed to publish local candidate");
                        }
                    }
                    PeerEvent::RemoteTrack(track) => {
                        if seen.insert(track.id.clone()) {
                            tracing::debug!(call_id = %pump_call, track_id = %track.id, kind = ?track.kind, "Remote track");
                            notify(PeerEvent::RemoteTrack(track));
                        }
                    }
                    PeerEvent::StateChanged(state) => {
                        tracing::debug!(call_id = %pump_call, state = ?state, "Peer state changed");
                        notify(PeerEvent::StateChanged(state));
                    }
                }
            }
        });

        tracing::debug!("Peer connection created");
        Ok(Self {
            call_id,
            backend,
            queue: Mutex::new(CandidateQueue::default()),
            pump,
            closed: AtomicBool::new(false),
        })
    }

    /// Call this connection belongs to
    #[must_use]
    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    fn ensure_open(&self) -> Result<(), PeerError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(PeerError::Closed)
        } else {
            Ok(())
        }
    }

    /// Attach local tracks in order
    ///
    /// # Errors
    ///
    /// Returns error on the first track the backend refuses
    pub async fn add_local_tracks(&self, tracks: &[LocalTrack]) -> Result<(), PeerError> {
        self.ensure_open()?;
        for track in tracks {
            self.backend.add_track(track).await?;
        }
        Ok(())
    }

    /// Create and set the local offer
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.backend.create_offer().await
    }

    /// Create and set the local answer
    ///
    /// # Errors
    ///
    /// Returns error if the backend fails
    pub async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        self.ensure_open()?;
        self.backend.create_answer().await
    }

    /// Set the remote description, then apply every queued candidate in order
    ///
    /// Returns how many queued candidates were drained.
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the description
    pub async fn set_remote_description(&self, desc: SessionDescription) -> Result<usize, PeerError> {
        self.ensure_open()?;
        let mut queue = self.queue.lock().await;
        if queue.remote_set {
            return Err(PeerError::Negotiation(
                "remote description already set".to_string(),
            ));
        }
        self.backend.set_remote_description(desc).await?;
        queue.remote_set = true;

        let drained = queue.pending.len();
        while let Some(candidate) = queue.pending.pop_front() {
            self.apply_candidate(candidate).await;
        }
        tracing::debug!(call_id = %self.call_id, drained, "Remote description set");
        Ok(drained)
    }

    /// Apply a remote candidate, or queue it until the remote description is set
    pub async fn add_remote_candidate(&self, candidate: CandidateInit) -> CandidateDisposition {
        if self.closed.load(Ordering::SeqCst) {
            return CandidateDisposition::Rejected;
        }
        let mut queue = self.queue.lock().await;
        if queue.remote_set {
            self.apply_candidate(candidate).await
        } else {
            queue.pending.push_back(candidate);
            CandidateDisposition::Queued
        }
    }

    async fn apply_candidate(&self, candidate: CandidateInit) -> CandidateDisposition {
        match self.backend.add_ice_candidate(candidate).await {
            Ok(()) => CandidateDisposition::Applied,
            Err(e) => {
                tracing::warn!(call_id = %self.call_id, error = %e, "Remote candidate rejected");
                CandidateDisposition::Rejected
            }
        }
    }

    /// Whether the remote description has been set
    pub async fn has_remote_description(&self) -> bool {
        self.queue.lock().await.remote_set
    }

    /// Candidates waiting for the remote description
    pub async fn queued_candidates(&self) -> usize {
        self.queue.lock().await.pending.len()
    }

    /// Swap the outgoing video track on the existing connection
    ///
    /// # Errors
    ///
    /// Returns error if `track` is not video or the backend fails
    pub async fn replace_video_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.ensure_open()?;
        if track.kind() != TrackKind::Video {
            return Err(PeerError::Track(format!("{} is not a video track", track.id())));
        }
        self.backend.replace_track(track).await
    }

    /// Close the connection and drop queued candidates; idempotent
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.pump.abort();
        self.queue.lock().await.pending.clear();
        if let Err(e) = self.backend.close().await {
            tracing::warn!(call_id = %self.call_id, error = %e, "Error closing peer connection");
        }
        tracing::debug!(call_id = %self.call_id, "Peer connection closed");
    }

    /// Whether [`PeerSession::close`] has run
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// [`PeerConnectionFactory`] on webrtc-rs
#[derive(Debug, Clone, Copy, Default)]
pub struct RtcPeerFactory;

impl RtcPeerFactory {
    /// Create a factory
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn setup_err(e: impl std::fmt::Display) -> PeerError {
    PeerError::Setup(e.to_string())
}

fn negotiation_err(e: impl std::fmt::Display) -> PeerError {
    PeerError::Negotiation(e.to_string())
}

fn peer_state(state: RTCPeerConnectionState) -> Option<PeerState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerState::New),
        RTCPeerConnectionState::Connecting => Some(PeerState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerState::Closed),
        _ => None,
    }
}

fn track_kind(kind: RTPCodecType) -> TrackKind {
    match kind {
        RTPCodecType::Video => TrackKind::Video,
        _ => TrackKind::Audio,
    }
}

#[async_trait]
impl PeerConnectionFactory for RtcPeerFactory {
    async fn create(
        &self,
        ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, PeerError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(setup_err)?;
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(setup_err)?;
        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: ice_servers
                .iter()
                .map(|s| RTCIceServer {
                    urls: s.urls.clone(),
                    username: s.username.clone(),
                    credential: s.credential.clone(),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };
        let pc = Arc::new(api.new_peer_connection(config).await.map_err(setup_err)?);

        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = tx.send(PeerEvent::LocalCandidate(CandidateInit {
                            candidate: init.candidate,
                            sdp_mid: init.sdp_mid,
                            sdp_mline_index: init.sdp_mline_index,
                        }));
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            let _ = tx.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: track.id(),
                stream_id: track.stream_id(),
                kind: track_kind(track.kind()),
                rtp: Some(track),
            }));
            Box::pin(async {})
        }));

        let tx = events;
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            if let Some(state) = peer_state(state) {
                let _ = tx.send(PeerEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        Ok(Arc::new(RtcPeer { pc }))
    }
}

struct RtcPeer {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl PeerBackend for RtcPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self
            .pc
            .add_track(rtc)
            .await
            .map_err(|e| PeerError::Track(e.to_string()))?;

        // RTCP has to be read for the interceptors to run
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let wanted = match track.kind() {
            TrackKind::Audio => RTPCodecType::Audio,
            TrackKind::Video => RTPCodecType::Video,
        };
        for sender in self.pc.get_senders().await {
            let Some(current) = sender.track().await else {
                continue;
            };
            if current.kind() != wanted {
                continue;
            }
            let rtc: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
            return sender
                .replace_track(Some(rtc))
                .await
                .map_err(|e| PeerError::Track(e.to_string()));
        }
        Err(PeerError::Track(format!("no {:?} sender to replace", track.kind())))
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        let offer = self.pc.create_offer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(negotiation_err)?;
        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        let answer = self.pc.create_answer(None).await.map_err(negotiation_err)?;
        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(negotiation_err)?;
        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        let desc = match desc.sdp_type {
            SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
            SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
        }
        .map_err(negotiation_err)?;
        self.pc
            .set_remote_description(desc)
            .await
            .map_err(negotiation_err)
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                ..Default::default()
            })
            .await
            .map_err(negotiation_err)
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.pc.close().await.map_err(|e| PeerError::Setup(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use parking_lot::Mutex as SyncMutex;
    use proptest::prelude::*;

    #[derive(Default)]
    struct RecordingBackend {
        remote: SyncMutex<Option<SessionDescription>>,
        applied: SyncMutex<Vec<String>>,
        reject: SyncMutex<HashSet<String>>,
    }

    #[async_trait]
    impl PeerBackend for RecordingBackend {
        async fn add_track(&self, _track: &LocalTrack) -> Result<(), PeerError> {
            Ok(())
        }
        async fn replace_track(&self, _track: &LocalTrack) -> Result<(), PeerError> {
            Ok(())
        }
        async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::offer("o"))
        }
        async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
            Ok(SessionDescription::answer("a"))
        }
        async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
            *self.remote.lock() = Some(desc);
            Ok(())
        }
        async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
            if self.remote.lock().is_none() {
                return Err(PeerError::Negotiation("no remote description".into()));
            }
            if self.reject.lock().contains(&candidate.candidate) {
                return Err(PeerError::Negotiation("malformed".into()));
            }
            self.applied.lock().push(candidate.candidate);
            Ok(())
        }
        async fn close(&self) -> Result<(), PeerError> {
            Ok(())
        }
    }

    struct Factory(Arc<RecordingBackend>, SyncMutex<Option<mpsc::UnboundedSender<PeerEvent>>>);

    #[async_trait]
    impl PeerConnectionFactory for Factory {
        async fn create(
            &self,
            _ice_servers: &[IceServer],
            events: mpsc::UnboundedSender<PeerEvent>,
        ) -> Result<Arc<dyn PeerBackend>, PeerError> {
            *self.1.lock() = Some(events);
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct Published(SyncMutex<Vec<String>>);

    #[async_trait]
    impl CandidateSink for Published {
        async fn publish_candidate(
            &self,
            _call_id: &CallId,
            _sender: &UserId,
            candidate: CandidateInit,
        ) -> Result<(), SignalingError> {
            self.0.lock().push(candidate.candidate);
            Ok(())
        }
    }

    async fn session(
        backend: Arc<RecordingBackend>,
    ) -> (PeerSession, Arc<Factory>, Arc<Published>, mpsc::UnboundedReceiver<PeerEvent>) {
        let factory = Arc::new(Factory(backend, SyncMutex::new(None)));
        let published = Arc::new(Published::default());
        let (tx, rx) = mpsc::unbounded_channel();
        let session = PeerSession::open(
            factory.as_ref(),
            &[],
            CallId::new("c1"),
            UserId::new("me"),
            published.clone(),
            move |e| {
                let _ = tx.send(e);
            },
        )
        .await
        .unwrap();
        (session, factory, published, rx)
    }

    #[tokio::test]
    async fn test_early_candidates_drain_in_order() {
        let backend = Arc::new(RecordingBackend::default());
        let (session, _f, _p, _rx) = session(backend.clone()).await;

        for c in ["c1", "c2", "c3"] {
            assert_eq!(
                session.add_remote_candidate(CandidateInit::new(c)).await,
                CandidateDisposition::Queued
            );
        }
        assert_eq!(session.queued_candidates().await, 3);
        assert!(backend.applied.lock().is_empty());

        let drained = session
            .set_remote_description(SessionDescription::offer("remote"))
            .await
            .unwrap();
        assert_eq!(drained, 3);
        assert_eq!(
            session.add_remote_candidate(CandidateInit::new("c4")).await,
            CandidateDisposition::Applied
        );
        assert_eq!(*backend.applied.lock(), vec!["c1", "c2", "c3", "c4"]);
    }

    #[tokio::test]
    async fn test_rejected_candidate_is_skipped() {
        let backend = Arc::new(RecordingBackend::default());
        backend.reject.lock().insert("bad".to_string());
        let (session, _f, _p, _rx) = session(backend.clone()).await;

        session.add_remote_candidate(CandidateInit::new("bad")).await;
        session.add_remote_candidate(CandidateInit::new("good")).await;
        session
            .set_remote_description(SessionDescription::answer("remote"))
            .await
            .unwrap();
        assert_eq!(*backend.applied.lock(), vec!["good"]);
    }

    #[tokio::test]
    async fn test_remote_description_only_once() {
        let (session, _f, _p, _rx) = session(Arc::new(RecordingBackend::default())).await;
        session
            .set_remote_description(SessionDescription::offer("r1"))
            .await
            .unwrap();
        assert!(session
            .set_remote_description(SessionDescription::offer("r2"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_pump_publishes_candidates_and_dedupes_tracks() {
        let (session, factory, published, mut rx) =
            session(Arc::new(RecordingBackend::default())).await;
        let events = factory.1.lock().clone().unwrap();

        events
            .send(PeerEvent::LocalCandidate(CandidateInit::new("l1")))
            .unwrap();
        let track = RemoteTrack {
            id: "t1".into(),
            stream_id: "s".into(),
            kind: TrackKind::Audio,
            rtp: None,
        };
        events.send(PeerEvent::RemoteTrack(track.clone())).unwrap();
        events.send(PeerEvent::RemoteTrack(track.clone())).unwrap();
        events
            .send(PeerEvent::StateChanged(PeerState::Connected))
            .unwrap();

        assert_eq!(rx.recv().await.unwrap(), PeerEvent::RemoteTrack(track));
        assert_eq!(
            rx.recv().await.unwrap(),
            PeerEvent::StateChanged(PeerState::Connected)
        );
        assert_eq!(*published.0.lock(), vec!["l1"]);
        session.close().await;
    }

    #[tokio::test]
    async fn test_closed_session_refuses_work() {
        let (session, _f, _p, _rx) = session(Arc::new(RecordingBackend::default())).await;
        session.add_remote_candidate(CandidateInit::new("c1")).await;
        session.close().await;
        session.close().await;
        assert!(session.is_closed());
        assert_eq!(session.queued_candidates().await, 0);
        assert!(matches!(session.create_offer().await, Err(PeerError::Closed)));
        assert_eq!(
            session.add_remote_candidate(CandidateInit::new("c2")).await,
            CandidateDisposition::Rejected
        );
    }

    #[tokio::test]
    async fn test_replace_requires_video_track() {
        let (session, _f, _p, _rx) = session(Arc::new(RecordingBackend::default())).await;
        let audio = LocalTrack::audio("a", "mic");
        assert!(matches!(
            session.replace_video_track(&audio).await,
            Err(PeerError::Track(_))
        ));
    }

    #[test]
    fn test_remote_stream_dedupes() {
        let mut stream = RemoteStream::default();
        let t = RemoteTrack {
            id: "v".into(),
            stream_id: "s".into(),
            kind: TrackKind::Video,
            rtp: None,
        };
        assert!(stream.add(t.clone()));
        assert!(!stream.add(t));
        assert!(stream.has(TrackKind::Video));
        assert!(!stream.has(TrackKind::Audio));
    }

    proptest! {
        #[test]
        fn prop_candidates_applied_in_arrival_order(early in 0usize..12, late in 0usize..12) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let applied = rt.block_on(async {
                let backend = Arc::new(RecordingBackend::default());
                let (session, _f, _p, _rx) = session(backend.clone()).await;
                for i in 0..early {
                    session.add_remote_candidate(CandidateInit::new(format!("c{i}"))).await;
                }
                session
                    .set_remote_description(SessionDescription::offer("remote"))
                    .await
                    .unwrap();
                for i in early..early + late {
                    session.add_remote_candidate(CandidateInit::new(format!("c{i}"))).await;
                }
                let applied = backend.applied.lock().clone();
                applied
            });
            let expected: Vec<String> = (0..early + late).map(|i| format!("c{i}")).collect();
            prop_assert_eq!(applied, expected);
        }
    }
}
