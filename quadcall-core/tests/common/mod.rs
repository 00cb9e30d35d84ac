//! Shared fixtures for the call flow tests
//!
//! `ScriptedPeerFactory` replaces webrtc-rs with a deterministic backend. Its
//! SDP is a plain `tracks=audio,video` line; setting a remote description
//! announces one remote track per listed kind and reports `Connected`.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use quadcall_core::{
    CallConfig, CallEvent, CallId, CallManager, CallStatus, CandidateInit, IceServer, LocalTrack, MemoryTransport,
    PeerBackend, PeerConnectionFactory, PeerError, PeerEvent, PeerState, RemoteTrack, SdpType,
    SessionDescription, SignalingHandler, SyntheticDevices, TrackKind, UserId,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const WAIT: Duration = Duration::from_secs(5);

fn kind_name(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => "audio",
        TrackKind::Video => "video",
    }
}

fn parse_tracks(sdp: &str) -> Vec<TrackKind> {
    sdp.strip_prefix("tracks=")
        .unwrap_or_default()
        .split(',')
        .filter_map(|k| match k {
            "audio" => Some(TrackKind::Audio),
            "video" => Some(TrackKind::Video),
            _ => None,
        })
        .collect()
}

pub struct ScriptedPeer {
    index: usize,
    events: mpsc::UnboundedSender<PeerEvent>,
    reject_remote: bool,
    local_tracks: Mutex<Vec<LocalTrack>>,
    remote: Mutex<Option<SessionDescription>>,
    applied: Mutex<Vec<String>>,
    replaced: Mutex<Vec<String>>,
    offers: AtomicUsize,
    closed: AtomicBool,
}

impl ScriptedPeer {
    fn local_sdp(&self) -> String {
        let kinds: Vec<&str> = self
            .local_tracks
            .lock()
            .iter()
            .map(|t| kind_name(t.kind()))
            .collect();
        format!("tracks={}", kinds.join(","))
    }

    fn emit_candidates(&self, label: &str) {
        for i in 0..2 {
            let mut candidate =
                CandidateInit::new(format!("candidate:{}-{}-{} 1 udp 1 10.0.0.1 9 typ host", self.index, label, i));
            candidate.sdp_mid = Some("0".to_string());
            candidate.sdp_mline_index = Some(0);
            let _ = self.events.send(PeerEvent::LocalCandidate(candidate));
        }
    }

    /// Remote candidates applied, in order
    pub fn applied(&self) -> Vec<String> {
        self.applied.lock().clone()
    }

    /// Ids of tracks swapped in through `replace_track`
    pub fn replaced(&self) -> Vec<String> {
        self.replaced.lock().clone()
    }

    /// Ids of tracks attached through `add_track`
    pub fn local_track_ids(&self) -> Vec<String> {
        self.local_tracks
            .lock()
            .iter()
            .map(|t| t.id().to_string())
            .collect()
    }

    pub fn offers(&self) -> usize {
        self.offers.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Simulate ICE giving up
    pub fn fail_connection(&self) {
        let _ = self
            .events
            .send(PeerEvent::StateChanged(PeerState::Failed));
    }
}

#[async_trait]
impl PeerBackend for ScriptedPeer {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        self.local_tracks.lock().push(track.clone());
        Ok(())
    }

    async fn replace_track(&self, track: &LocalTrack) -> Result<(), PeerError> {
        let mut tracks = self.local_tracks.lock();
        let slot = tracks
            .iter_mut()
            .find(|t| t.kind() == track.kind())
            .ok_or_else(|| PeerError::Track("no sender of that kind".to_string()))?;
        *slot = track.clone();
        self.replaced.lock().push(track.id().to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, PeerError> {
        self.offers.fetch_add(1, Ordering::SeqCst);
        let _ = self
            .events
            .send(PeerEvent::StateChanged(PeerState::Connecting));
        self.emit_candidates("offer");
        Ok(SessionDescription::offer(self.local_sdp()))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PeerError> {
        if self.remote.lock().is_none() {
            return Err(PeerError::Negotiation("no remote offer".to_string()));
        }
        self.emit_candidates("answer");
        Ok(SessionDescription::answer(self.local_sdp()))
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<(), PeerError> {
        if self.reject_remote {
            return Err(PeerError::Negotiation("malformed remote description".to_string()));
        }
        let kinds = parse_tracks(&desc.sdp);
        let is_answer = desc.sdp_type == SdpType::Answer;
        *self.remote.lock() = Some(desc);
        for kind in kinds {
            let _ = self.events.send(PeerEvent::RemoteTrack(RemoteTrack {
                id: format!("remote-{}-{}", self.index, kind_name(kind)),
                stream_id: format!("remote-{}", self.index),
                kind,
                rtp: None,
            }));
        }
        if is_answer {
            let _ = self
                .events
                .send(PeerEvent::StateChanged(PeerState::Connected));
        }
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: CandidateInit) -> Result<(), PeerError> {
        if self.remote.lock().is_none() {
            return Err(PeerError::Negotiation(
                "candidate before remote description".to_string(),
            ));
        }
        self.applied.lock().push(candidate.candidate);
        Ok(())
    }

    async fn close(&self) -> Result<(), PeerError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct ScriptedPeerFactory {
    peers: Mutex<Vec<Arc<ScriptedPeer>>>,
    reject_remote: AtomicBool,
}

impl ScriptedPeerFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Every connection created so far
    pub fn peers(&self) -> Vec<Arc<ScriptedPeer>> {
        self.peers.lock().clone()
    }

    pub fn last(&self) -> Option<Arc<ScriptedPeer>> {
        self.peers.lock().last().cloned()
    }

    /// Make connections created from now on refuse remote descriptions
    pub fn reject_remote(&self, reject: bool) {
        self.reject_remote.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl PeerConnectionFactory for ScriptedPeerFactory {
    async fn create(
        &self,
        _ice_servers: &[IceServer],
        events: mpsc::UnboundedSender<PeerEvent>,
    ) -> Result<Arc<dyn PeerBackend>, PeerError> {
        let mut peers = self.peers.lock();
        let peer = Arc::new(ScriptedPeer {
            index: peers.len(),
            events,
            reject_remote: self.reject_remote.load(Ordering::SeqCst),
            local_tracks: Mutex::new(Vec::new()),
            remote: Mutex::new(None),
            applied: Mutex::new(Vec::new()),
            replaced: Mutex::new(Vec::new()),
            offers: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        peers.push(peer.clone());
        Ok(peer as Arc<dyn PeerBackend>)
    }
}

pub fn test_config() -> CallConfig {
    CallConfig {
        ended_display_ms: 50,
        ring_timeout_secs: 0,
        ..CallConfig::default()
    }
}

/// One side of a call
pub struct Party {
    pub manager: CallManager,
    pub devices: Arc<SyntheticDevices>,
    pub peers: Arc<ScriptedPeerFactory>,
}

impl Party {
    pub fn user(&self) -> UserId {
        self.manager.user().clone()
    }

    /// Peer connection of the current (latest) call
    pub fn peer(&self) -> Arc<ScriptedPeer> {
        self.peers.last().unwrap()
    }
}

pub async fn party_with(
    transport: &Arc<MemoryTransport>,
    user: &str,
    devices: SyntheticDevices,
    config: CallConfig,
) -> Party {
    let devices = Arc::new(devices);
    let peers = ScriptedPeerFactory::new();
    let manager = CallManager::builder(
        UserId::new(user),
        Arc::new(SignalingHandler::new(transport.clone())),
    )
    .with_config(config)
    .with_devices(devices.clone())
    .with_peer_factory(peers.clone())
    .build()
    .await
    .unwrap();
    Party {
        manager,
        devices,
        peers,
    }
}

pub async fn party(transport: &Arc<MemoryTransport>, user: &str) -> Party {
    party_with(transport, user, SyntheticDevices::new(), test_config()).await
}

/// Alice and Bob on one backend
pub async fn pair() -> (Arc<MemoryTransport>, Party, Party) {
    let transport = Arc::new(MemoryTransport::new());
    let alice = party(&transport, "alice").await;
    let bob = party(&transport, "bob").await;
    (transport, alice, bob)
}

/// Wait for the first event matching `pred`
pub async fn next_event<F>(rx: &mut broadcast::Receiver<CallEvent>, mut pred: F) -> CallEvent
where
    F: FnMut(&CallEvent) -> bool,
{
    tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Ok(event) if pred(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event stream closed"),
            }
        }
    })
    .await
    .unwrap()
}

/// Wait until the manager reaches `state`
pub async fn reach(party: &Party, state: quadcall_core::CallState) -> quadcall_core::CallSnapshot {
    party.manager.wait_for_state(state, WAIT).await.unwrap()
}

/// Wait until no issued track is live
pub async fn all_tracks_released(devices: &SyntheticDevices) -> bool {
    for _ in 0..100 {
        if devices.live_tracks().is_empty() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Alice calls Bob, Bob answers; both end up connected
pub async fn connect(alice: &Party, bob: &Party, kind: quadcall_core::MediaKind) {
    alice.manager.start_call(bob.user(), kind).await.unwrap();
    reach(bob, quadcall_core::CallState::Incoming).await;
    bob.manager.answer_call().await.unwrap();
    reach(alice, quadcall_core::CallState::Connected).await;
    reach(bob, quadcall_core::CallState::Connected).await;
}

/// Wait until `peer` has applied `count` remote candidates
pub async fn applied_eventually(peer: &ScriptedPeer, count: usize) -> Vec<String> {
    for _ in 0..100 {
        let applied = peer.applied();
        if applied.len() >= count {
            return applied;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    peer.applied()
}

/// Wait until the stored record for `call_id` reaches `status`
pub async fn status_eventually(
    transport: &MemoryTransport,
    call_id: &CallId,
    status: CallStatus,
) -> bool {
    for _ in 0..100 {
        if transport.call(call_id).is_some_and(|r| r.status == status) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
