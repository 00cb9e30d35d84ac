//! Call management
//!
//! [`CallManager`] is a cheap, cloneable handle onto a single engine task that
//! owns the call session. Operations are sent to the engine as messages and
//! answered over a oneshot channel, so no two state transitions ever
//! interleave. Observers either watch the latest [`CallSnapshot`] or subscribe
//! to the [`CallEvent`] stream.
//!
//! ```text
//!                 start_call                     remote answered
//!     Idle ──────────────────────► Outgoing ─────────────────────┐
//!      ▲  │                                                      ▼
//!      │  │ incoming offer                    answer_call    Connected
//!      │  └───────────────────────► Incoming ─────────────────►  │
//!      │                               │                         │
//!      │        ended_display          ▼   end / remote end      │
//!      └─────────────────────────── Ended ◄──────────────────────┘
//! ```
//!
//! Setup failures skip `Ended` and go straight back to `Idle`.

use crate::config::{CallConfig, ConfigError};
use crate::engine::{Command, Engine, Input};
use crate::identity::UserId;
use crate::media::{LocalStream, MediaDevices, MediaError, SyntheticDevices};
use crate::peer::{PeerConnectionFactory, PeerError, RemoteStream, RtcPeerFactory};
use crate::signaling::{SignalingError, SignalingHandler, SignalingTransport};
use crate::types::{CallEvent, CallId, CallRole, CallState, FacingMode, MediaKind};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

/// Call management errors
#[derive(Error, Debug)]
pub enum CallError {
    /// Operation not valid in the current state
    #[error("Invalid call state: {0:?}")]
    InvalidState(CallState),

    /// Another call is in progress
    #[error("Another call is in progress")]
    Busy,

    /// Caller and receiver are the same user
    #[error("Cannot call yourself")]
    SelfCall,

    /// Answer already being processed
    #[error("Call setup already in progress")]
    SetupInProgress,

    /// Capture failed
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    /// Backend failed
    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    /// Offer/answer or connectivity failed
    #[error("Negotiation error: {0}")]
    Negotiation(#[from] PeerError),

    /// Local hangup while the operation was pending
    #[error("Call cancelled")]
    Cancelled,

    /// Remote hangup while the operation was pending
    #[error("Call ended by the other party")]
    RemoteEnded,

    /// Nobody answered in time
    #[error("No answer within the ring timeout")]
    Timeout,

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Engine task is gone
    #[error("Call manager stopped")]
    ManagerStopped,
}

/// Where remote audio ended up after a speaker toggle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputRoute {
    /// Output device actually changed
    Routed,
    /// Only the on-screen flag changed
    UiOnly,
}

/// Result of [`CallManager::toggle_speaker`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpeakerToggle {
    /// New speaker flag
    pub on: bool,
    /// Whether routing took effect
    pub route: OutputRoute,
}

/// Result of [`CallManager::switch_camera`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraSwitch {
    /// Now sending from this camera
    Switched(FacingMode),
    /// Fewer than two cameras; nothing changed
    SingleCamera,
}

/// Observable call state
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallSnapshot {
    /// State machine state
    pub state: CallState,
    /// Current (or just ended) call
    pub call_id: Option<CallId>,
    /// Our side of the call
    pub role: Option<CallRole>,
    /// The other participant
    pub remote_user: Option<UserId>,
    /// Audio or video
    pub kind: Option<MediaKind>,
    /// Microphone muted
    pub muted: bool,
    /// Camera sending
    pub video_enabled: bool,
    /// Camera in use
    pub facing: FacingMode,
    /// Speaker flag
    pub speaker_on: bool,
    /// Local tracks, while a session holds media
    pub local_stream: Option<LocalStream>,
    /// Tracks announced by the remote peer
    pub remote_stream: RemoteStream,
    /// A start or answer pipeline is running
    pub setup_pending: bool,
    /// Last setup failure
    pub last_error: Option<String>,
}

/// Handle onto the call engine
#[derive(Clone)]
pub struct CallManager {
    user: UserId,
    inbox: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
}

impl CallManager {
    /// Builder with synthetic devices and webrtc-rs peers by default
    pub fn builder<T: SignalingTransport + 'static>(
        user: UserId,
        signaling: Arc<SignalingHandler<T>>,
    ) -> CallManagerBuilder<T> {
        CallManagerBuilder {
            user,
            signaling,
            devices: None,
            peers: None,
            config: CallConfig::default(),
        }
    }

    /// Validate `config`, subscribe to the user's call feeds and spawn the engine
    ///
    /// # Errors
    ///
    /// Returns error if the config is invalid or the subscription fails
    #[tracing::instrument(skip(signaling, devices, peers, config), fields(user = %user))]
    pub async fn start<T: SignalingTransport + 'static>(
        user: UserId,
        signaling: Arc<SignalingHandler<T>>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        config: CallConfig,
    ) -> Result<Self, CallError> {
        config.validate()?;

        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(CallSnapshot::default());
        let (events_tx, _) = broadcast::channel(config.event_capacity);

        let user_feed = signaling.subscribe_user(&user, signals_tx.clone()).await?;

        let engine = Engine::new(
            user.clone(),
            config,
            signaling,
            devices,
            peers,
            inbox_tx.downgrade(),
            signals_tx,
            state_tx,
            events_tx.clone(),
            user_feed,
        );
        tokio::spawn(engine.run(inbox_rx, signals_rx));

        tracing::info!("Call manager started");
        Ok(Self {
            user,
            inbox: inbox_tx,
            state: state_rx,
            events: events_tx,
        })
    }

    /// Signed-in user this manager acts for
    #[must_use]
    pub fn user(&self) -> &UserId {
        &self.user
    }

    async fn request<R>(
        &self,
        make: impl FnOnce(oneshot::Sender<Result<R, CallError>>) -> Command,
    ) -> Result<R, CallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Input::Command(make(tx)))
            .map_err(|_| CallError::ManagerStopped)?;
        rx.await.map_err(|_| CallError::ManagerStopped)?
    }

    /// Call `receiver`; resolves once the offer is published
    ///
    /// # Errors
    ///
    /// Returns error if not idle, or if capture, signaling or negotiation fails
    pub async fn start_call(&self, receiver: UserId, kind: MediaKind) -> Result<CallId, CallError> {
        self.request(|reply| Command::Start {
            receiver,
            kind,
            reply,
        })
        .await
    }

    /// Answer the incoming call; resolves once the answer is published
    ///
    /// # Errors
    ///
    /// Returns error if no call is ringing, or if setup fails
    pub async fn answer_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::Answer { reply }).await
    }

    /// Decline the incoming call
    ///
    /// # Errors
    ///
    /// Returns error only if the manager has stopped
    pub async fn decline_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Hang up; a no-op when there is no call
    ///
    /// # Errors
    ///
    /// Returns error only if the manager has stopped
    pub async fn end_call(&self) -> Result<(), CallError> {
        self.request(|reply| Command::End { reply }).await
    }

    /// Flip the microphone; returns the new muted flag
    ///
    /// # Errors
    ///
    /// Returns error outside `Outgoing`/`Connected`
    pub async fn toggle_mute(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleMute { reply }).await
    }

    /// Flip the camera; returns the new enabled flag
    ///
    /// # Errors
    ///
    /// Returns error outside `Outgoing`/`Connected` or on audio calls
    pub async fn toggle_video(&self) -> Result<bool, CallError> {
        self.request(|reply| Command::ToggleVideo { reply }).await
    }

    /// Flip speaker output
    ///
    /// # Errors
    ///
    /// Returns error when there is no call
    pub async fn toggle_speaker(&self) -> Result<SpeakerToggle, CallError> {
        self.request(|reply| Command::ToggleSpeaker { reply }).await
    }

    /// Switch between front and back camera
    ///
    /// # Errors
    ///
    /// Returns error outside a connected video call or if capture fails
    pub async fn switch_camera(&self) -> Result<CameraSwitch, CallError> {
        self.request(|reply| Command::SwitchCamera { reply }).await
    }

    /// Latest state
    #[must_use]
    pub fn snapshot(&self) -> CallSnapshot {
        self.state.borrow().clone()
    }

    /// Receiver that is updated on every change
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<CallSnapshot> {
        self.state.clone()
    }

    /// Subscribe to call events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<CallEvent> {
        self.events.subscribe()
    }

    /// Wait until `predicate` holds for the current snapshot
    ///
    /// # Errors
    ///
    /// Returns error if the engine stops first
    pub async fn wait_for<F>(&self, mut predicate: F) -> Result<CallSnapshot, CallError>
    where
        F: FnMut(&CallSnapshot) -> bool,
    {
        let mut rx = self.state.clone();
        loop {
            {
                let snapshot = rx.borrow_and_update();
                if predicate(&snapshot) {
                    return Ok(snapshot.clone());
                }
            }
            rx.changed().await.map_err(|_| CallError::ManagerStopped)?;
        }
    }

    /// [`CallManager::wait_for`] with a deadline
    ///
    /// # Errors
    ///
    /// Returns [`CallError::Timeout`] if the deadline passes first
    pub async fn wait_for_state(
        &self,
        state: CallState,
        deadline: Duration,
    ) -> Result<CallSnapshot, CallError> {
        tokio::time::timeout(deadline, self.wait_for(|s| s.state == state))
            .await
            .map_err(|_| CallError::Timeout)?
    }

    /// End any call, drop subscriptions and stop the engine
    ///
    /// # Errors
    ///
    /// Returns error if the engine had already stopped
    pub async fn shutdown(&self) -> Result<(), CallError> {
        let (tx, rx) = oneshot::channel();
        self.inbox
            .send(Input::Shutdown { reply: tx })
            .map_err(|_| CallError::ManagerStopped)?;
        rx.await.map_err(|_| CallError::ManagerStopped)
    }
}

/// Builder for [`CallManager`]
pub struct CallManagerBuilder<T: SignalingTransport + 'static> {
    user: UserId,
    signaling: Arc<SignalingHandler<T>>,
    devices: Option<Arc<dyn MediaDevices>>,
    peers: Option<Arc<dyn PeerConnectionFactory>>,
    config: CallConfig,
}

impl<T: SignalingTransport + 'static> CallManagerBuilder<T> {
    /// Set configuration
    #[must_use]
    pub fn with_config(mut self, config: CallConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the platform media API
    #[must_use]
    pub fn with_devices(mut self, devices: Arc<dyn MediaDevices>) -> Self {
        self.devices = Some(devices);
        self
    }

    /// Set the peer connection factory
    #[must_use]
    pub fn with_peer_factory(mut self, peers: Arc<dyn PeerConnectionFactory>) -> Self {
        self.peers = Some(peers);
        self
    }

    /// Start the manager
    ///
    /// # Errors
    ///
    /// See [`CallManager::start`]
    pub async fn build(self) -> Result<CallManager, CallError> {
        let devices = self
            .devices
            .unwrap_or_else(|| Arc::new(SyntheticDevices::new()));
        let peers = self.peers.unwrap_or_else(|| Arc::new(RtcPeerFactory::new()));
        CallManager::start(self.user, self.signaling, devices, peers, self.config).await
    }
}
