//! Call engine task
//!
//! The engine owns the one call session and consumes a single queue of
//! commands, setup progress, peer events and timers, plus the realtime
//! signaling feed. Start and answer pipelines run as separate tasks; they
//! hand each acquired resource back tagged with the session epoch and check a
//! cancellation flag before every new side effect. Anything arriving for an
//! epoch that is no longer current is disposed of here; once the engine has
//! stopped, a pipeline disposes of its own steps. Best-effort `ended`
//! publishes and candidate feed subscriptions run off the engine task.

use crate::call::{CallError, CallSnapshot, CameraSwitch, OutputRoute, SpeakerToggle};
use crate::config::{CallConfig, IceServer};
use crate::identity::UserId;
use crate::media::{DeviceKind, MediaDevices, MediaError, MediaSession};
use crate::peer::{
    CandidateSink, PeerConnectionFactory, PeerError, PeerEvent, PeerSession, PeerState,
    RemoteStream,
};
use crate::signaling::{
    SignalEvent, SignalingError, SignalingHandler, SignalingTransport, SubscriptionGuard,
};
use crate::types::{
    CallEvent, CallId, CallRecord, CallRole, CallState, CallStatus, CandidateInit, EndReason,
    IceCandidateRecord, MediaKind, Notice, SdpType, SessionDescription,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

/// Upper bound on a best-effort `ended` publish
const PUBLISH_END_TIMEOUT: Duration = Duration::from_secs(5);

/// The receiver may see the record before the caller stored its offer
const OFFER_FETCH_ATTEMPTS: u32 = 10;
const OFFER_FETCH_BACKOFF: Duration = Duration::from_millis(200);

pub(crate) type Reply<T> = oneshot::Sender<Result<T, CallError>>;

pub(crate) enum Command {
    Start {
        receiver: UserId,
        kind: MediaKind,
        reply: Reply<CallId>,
    },
    Answer {
        reply: Reply<()>,
    },
    End {
        reply: Reply<()>,
    },
    ToggleMute {
        reply: Reply<bool>,
    },
    ToggleVideo {
        reply: Reply<bool>,
    },
    ToggleSpeaker {
        reply: Reply<SpeakerToggle>,
    },
    SwitchCamera {
        reply: Reply<CameraSwitch>,
    },
}

pub(crate) enum SetupStep {
    RecordCreated {
        record: CallRecord,
        media: MediaSession,
    },
    MediaReady {
        media: MediaSession,
    },
    FeedReady {
        feed: SubscriptionGuard,
    },
    PeerReady {
        peer: Arc<PeerSession>,
    },
    OfferPublished,
    AnswerPublished,
    Failed(CallError),
}

pub(crate) enum Input {
    Command(Command),
    Setup { epoch: u64, step: SetupStep },
    Peer { epoch: u64, event: PeerEvent },
    RingTimeout { epoch: u64 },
    ResetIdle { epoch: u64 },
    Shutdown { reply: oneshot::Sender<()> },
}

struct Session {
    epoch: u64,
    role: CallRole,
    remote: UserId,
    kind: MediaKind,
    call_id: Option<CallId>,
    media: Option<MediaSession>,
    peer: Option<Arc<PeerSession>>,
    early_candidates: VecDeque<CandidateInit>,
    pending_answer: Option<SessionDescription>,
    remote_stream: RemoteStream,
    candidate_feed: Option<SubscriptionGuard>,
    cancel: Arc<AtomicBool>,
    start_reply: Option<Reply<CallId>>,
    answer_reply: Option<Reply<()>>,
    setup_running: bool,
    speaker_on: bool,
}

impl Session {
    fn new(epoch: u64, role: CallRole, remote: UserId, kind: MediaKind) -> Self {
        Self {
            epoch,
            role,
            remote,
            kind,
            call_id: None,
            media: None,
            peer: None,
            early_candidates: VecDeque::new(),
            pending_answer: None,
            remote_stream: RemoteStream::default(),
            candidate_feed: None,
            cancel: Arc::new(AtomicBool::new(false)),
            start_reply: None,
            answer_reply: None,
            setup_running: false,
            speaker_on: false,
        }
    }
}

fn interrupted(reason: &EndReason) -> CallError {
    match reason {
        EndReason::RemoteHangup => CallError::RemoteEnded,
        EndReason::Timeout => CallError::Timeout,
        EndReason::LocalHangup | EndReason::Failed(_) => CallError::Cancelled,
    }
}

pub(crate) struct Engine<T: SignalingTransport + 'static> {
    user: UserId,
    config: CallConfig,
    signaling: Arc<SignalingHandler<T>>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    inbox: mpsc::WeakUnboundedSender<Input>,
    signals: mpsc::UnboundedSender<SignalEvent>,
    snapshot: watch::Sender<CallSnapshot>,
    events: broadcast::Sender<CallEvent>,
    state: CallState,
    next_epoch: u64,
    session: Option<Session>,
    ended: Option<(u64, Option<CallId>)>,
    last_error: Option<String>,
    user_feed: Option<SubscriptionGuard>,
    end_publishes: Vec<JoinHandle<()>>,
}

impl<T: SignalingTransport + 'static> Engine<T> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        user: UserId,
        config: CallConfig,
        signaling: Arc<SignalingHandler<T>>,
        devices: Arc<dyn MediaDevices>,
        peers: Arc<dyn PeerConnectionFactory>,
        inbox: mpsc::WeakUnboundedSender<Input>,
        signals: mpsc::UnboundedSender<SignalEvent>,
        snapshot: watch::Sender<CallSnapshot>,
        events: broadcast::Sender<CallEvent>,
        user_feed: SubscriptionGuard,
    ) -> Self {
        Self {
            user,
            config,
            signaling,
            devices,
            peers,
            inbox,
            signals,
            snapshot,
            events,
            state: CallState::Idle,
            next_epoch: 0,
            session: None,
            ended: None,
            last_error: None,
            user_feed: Some(user_feed),
            end_publishes: Vec::new(),
        }
    }

    pub(crate) async fn run(
        mut self,
        mut inbox: mpsc::UnboundedReceiver<Input>,
        mut signals: mpsc::UnboundedReceiver<SignalEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                input = inbox.recv() => match input {
                    Some(input) => {
                        if let Some(reply) = self.handle_input(input).await {
                            self.stop(&mut inbox).await;
                            let _ = reply.send(());
                            break;
                        }
                    }
                    None => {
                        self.stop(&mut inbox).await;
                        break;
                    }
                },
                Some(signal) = signals.recv() => self.handle_signal(signal).await,
            }
        }
        tracing::debug!(user = %self.user, "Call engine exited");
    }

    /// Returns the reply handle once a shutdown was requested
    async fn handle_input(&mut self, input: Input) -> Option<oneshot::Sender<()>> {
        match input {
            Input::Command(command) => self.handle_command(command).await,
            Input::Setup { epoch, step } => self.handle_setup(epoch, step).await,
            Input::Peer { epoch, event } => self.handle_peer_event(epoch, event).await,
            Input::RingTimeout { epoch } => self.handle_ring_timeout(epoch).await,
            Input::ResetIdle { epoch } => self.handle_reset(epoch),
            Input::Shutdown { reply } => return Some(reply),
        }
        None
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start {
                receiver,
                kind,
                reply,
            } => self.start_call(receiver, kind, reply),
            Command::Answer { reply } => self.answer_call(reply),
            Command::End { reply } => {
                self.end_call().await;
                let _ = reply.send(Ok(()));
            }
            Command::ToggleMute { reply } => {
                let _ = reply.send(self.toggle_mute());
            }
            Command::ToggleVideo { reply } => {
                let _ = reply.send(self.toggle_video());
            }
            Command::ToggleSpeaker { reply } => {
                let result = self.toggle_speaker().await;
                let _ = reply.send(result);
            }
            Command::SwitchCamera { reply } => {
                let result = self.switch_camera().await;
                let _ = reply.send(result);
            }
        }
    }

    async fn handle_signal(&mut self, signal: SignalEvent) {
        match signal {
            SignalEvent::Incoming(record) => self.on_incoming(record).await,
            SignalEvent::Updated(record) => self.on_record_updated(record).await,
            SignalEvent::Candidate(record) => self.on_remote_candidate(record).await,
        }
    }

    // ---- session bookkeeping ----

    fn is_current(&self, epoch: u64) -> bool {
        self.session.as_ref().is_some_and(|s| s.epoch == epoch)
    }

    fn bump_epoch(&mut self) -> u64 {
        self.next_epoch += 1;
        self.next_epoch
    }

    fn emit(&self, event: CallEvent) {
        let _ = self.events.send(event);
    }

    fn build_snapshot(&self) -> CallSnapshot {
        let mut snapshot = CallSnapshot {
            state: self.state,
            last_error: self.last_error.clone(),
            ..CallSnapshot::default()
        };
        match &self.session {
            Some(s) => {
                snapshot.call_id = s.call_id.clone();
                snapshot.role = Some(s.role);
                snapshot.remote_user = Some(s.remote.clone());
                snapshot.kind = Some(s.kind);
                snapshot.speaker_on = s.speaker_on;
                snapshot.setup_pending = s.setup_running;
                snapshot.remote_stream = s.remote_stream.clone();
                if let Some(media) = &s.media {
                    snapshot.muted = media.is_muted();
                    snapshot.video_enabled = media.is_video_enabled();
                    snapshot.facing = media.facing();
                    snapshot.local_stream = Some(media.stream());
                }
            }
            None => {
                if let Some((_, call_id)) = &self.ended {
                    snapshot.call_id = call_id.clone();
                }
            }
        }
        snapshot
    }

    fn publish_snapshot(&self) {
        self.snapshot.send_replace(self.build_snapshot());
    }

    fn transition(&mut self, to: CallState) {
        let from = self.state;
        if from != to {
            self.state = to;
            tracing::info!(user = %self.user, from = ?from, to = ?to, "Call state changed");
            self.emit(CallEvent::StateChanged { from, to });
        }
        self.publish_snapshot();
    }

    fn context(&self, epoch: u64, cancel: Arc<AtomicBool>) -> Option<SetupContext<T>> {
        Some(SetupContext {
            user: self.user.clone(),
            signaling: Arc::clone(&self.signaling),
            devices: Arc::clone(&self.devices),
            peers: Arc::clone(&self.peers),
            ice_servers: self.config.ice_servers.clone(),
            inbox: self.inbox.upgrade()?,
            epoch,
            cancel,
        })
    }

    fn schedule(&self, delay: Duration, input: Input) {
        if let Some(inbox) = self.inbox.upgrade() {
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = inbox.send(input);
            });
        }
    }

    fn arm_ring_timeout(&self, epoch: u64) {
        if let Some(timeout) = self.config.ring_timeout() {
            self.schedule(timeout, Input::RingTimeout { epoch });
        }
    }

    /// Publish `ended` off the engine task
    fn publish_ended_later(&mut self, call_id: CallId) {
        let signaling = Arc::clone(&self.signaling);
        self.end_publishes.retain(|task| !task.is_finished());
        self.end_publishes.push(tokio::spawn(async move {
            publish_ended(&signaling, &call_id).await;
        }));
    }

    /// Subscribe to the call's candidate feed off the engine task
    fn follow_call(&self, epoch: u64, call_id: CallId) {
        let Some(inbox) = self.inbox.upgrade() else {
            return;
        };
        let signaling = Arc::clone(&self.signaling);
        let user = self.user.clone();
        let signals = self.signals.clone();
        tokio::spawn(async move {
            let step = match signaling.subscribe_call(&call_id, &user, signals).await {
                Ok(feed) => SetupStep::FeedReady { feed },
                Err(e) => SetupStep::Failed(e.into()),
            };
            let _ = inbox.send(Input::Setup { epoch, step });
        });
    }

    /// Release everything the session holds
    async fn teardown(&mut self, session: &mut Session, publish_end: bool) {
        session.cancel.store(true, Ordering::SeqCst);
        session.candidate_feed = None;
        session.early_candidates.clear();
        session.pending_answer = None;
        if let Some(media) = session.media.take() {
            media.stop_all();
        }
        if let Some(peer) = session.peer.take() {
            peer.close().await;
        }
        if publish_end {
            if let Some(call_id) = session.call_id.clone() {
                self.publish_ended_later(call_id);
            }
        }
    }

    /// Tear down after a hangup or timeout and show `Ended`
    async fn finish(&mut self, reason: EndReason, publish_end: bool) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        self.teardown(&mut session, publish_end).await;
        if let Some(reply) = session.start_reply.take() {
            let _ = reply.send(Err(interrupted(&reason)));
        }
        if let Some(reply) = session.answer_reply.take() {
            let _ = reply.send(Err(interrupted(&reason)));
        }

        tracing::info!(user = %self.user, call_id = ?session.call_id, reason = ?reason, "Call ended");
        let call_id = session.call_id.clone();
        self.emit(CallEvent::CallEnded {
            call_id: call_id.clone(),
            reason,
        });

        if self.state == CallState::Idle {
            self.publish_snapshot();
            return;
        }
        self.ended = Some((session.epoch, call_id));
        self.transition(CallState::Ended);
        self.schedule(
            self.config.ended_display(),
            Input::ResetIdle {
                epoch: session.epoch,
            },
        );
    }

    /// Tear down after a setup or negotiation failure and go straight to `Idle`
    async fn fail(&mut self, error: CallError) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let message = error.to_string();
        tracing::warn!(user = %self.user, call_id = ?session.call_id, error = %message, "Call failed");

        self.teardown(&mut session, true).await;
        match (session.start_reply.take(), session.answer_reply.take()) {
            (Some(reply), _) => {
                let _ = reply.send(Err(error));
            }
            (None, Some(reply)) => {
                let _ = reply.send(Err(error));
            }
            (None, None) => {}
        }

        self.last_error = Some(message.clone());
        self.emit(CallEvent::CallFailed {
            call_id: session.call_id.clone(),
            error: message,
        });
        self.ended = None;
        self.transition(CallState::Idle);
    }

    /// End the call, stop accepting input and dispose of whatever the
    /// pipelines handed over but the loop never consumed
    async fn stop(&mut self, inbox: &mut mpsc::UnboundedReceiver<Input>) {
        self.finish(EndReason::LocalHangup, true).await;
        self.ended = None;
        self.user_feed = None;
        self.transition(CallState::Idle);

        inbox.close();
        while let Ok(input) = inbox.try_recv() {
            match input {
                Input::Setup { step, .. } => dispose_step(&self.signaling, step).await,
                Input::Shutdown { reply } => {
                    let _ = reply.send(());
                }
                _ => {}
            }
        }
        for task in self.end_publishes.drain(..) {
            let _ = task.await;
        }
        tracing::info!(user = %self.user, "Call manager stopped");
    }

    fn handle_reset(&mut self, epoch: u64) {
        if self.state == CallState::Ended && self.ended.as_ref().is_some_and(|(e, _)| *e == epoch) {
            self.ended = None;
            self.transition(CallState::Idle);
        }
    }

    // ---- commands ----

    fn start_call(&mut self, receiver: UserId, kind: MediaKind, reply: Reply<CallId>) {
        if self.session.is_some() {
            let _ = reply.send(Err(CallError::Busy));
            return;
        }
        if self.state != CallState::Idle {
            let _ = reply.send(Err(CallError::InvalidState(self.state)));
            return;
        }
        if receiver == self.user {
            let _ = reply.send(Err(CallError::SelfCall));
            return;
        }

        let epoch = self.bump_epoch();
        let mut session = Session::new(epoch, CallRole::Caller, receiver.clone(), kind);
        let Some(ctx) = self.context(epoch, Arc::clone(&session.cancel)) else {
            let _ = reply.send(Err(CallError::ManagerStopped));
            return;
        };
        session.start_reply = Some(reply);
        session.setup_running = true;
        self.session = Some(session);
        self.last_error = None;

        tracing::info!(user = %self.user, receiver = %receiver, kind = ?kind, "Starting call");
        self.publish_snapshot();
        tokio::spawn(run_caller_setup(ctx, receiver, kind));
    }

    fn answer_call(&mut self, reply: Reply<()>) {
        if self.state != CallState::Incoming {
            let _ = reply.send(Err(CallError::InvalidState(self.state)));
            return;
        }
        let Some((epoch, cancel, call_id, kind, running)) = self.session.as_ref().and_then(|s| {
            s.call_id
                .clone()
                .map(|id| (s.epoch, Arc::clone(&s.cancel), id, s.kind, s.setup_running))
        }) else {
            let _ = reply.send(Err(CallError::InvalidState(self.state)));
            return;
        };
        if running {
            let _ = reply.send(Err(CallError::SetupInProgress));
            return;
        }
        let Some(ctx) = self.context(epoch, cancel) else {
            let _ = reply.send(Err(CallError::ManagerStopped));
            return;
        };
        if let Some(session) = self.session.as_mut() {
            session.setup_running = true;
            session.answer_reply = Some(reply);
        }

        tracing::info!(user = %self.user, call_id = %call_id, "Answering call");
        self.publish_snapshot();
        tokio::spawn(run_receiver_setup(ctx, call_id, kind));
    }

    async fn end_call(&mut self) {
        if self.session.is_none() {
            tracing::debug!(user = %self.user, state = ?self.state, "No call to end");
            return;
        }
        self.finish(EndReason::LocalHangup, true).await;
    }

    fn active_media(&self) -> Result<&MediaSession, CallError> {
        if !matches!(self.state, CallState::Outgoing | CallState::Connected) {
            return Err(CallError::InvalidState(self.state));
        }
        self.session
            .as_ref()
            .and_then(|s| s.media.as_ref())
            .ok_or(CallError::InvalidState(self.state))
    }

    fn toggle_mute(&mut self) -> Result<bool, CallError> {
        let muted = self.active_media()?.toggle_mute();
        tracing::debug!(muted, "Microphone toggled");
        self.publish_snapshot();
        Ok(muted)
    }

    fn toggle_video(&mut self) -> Result<bool, CallError> {
        let enabled = self.active_media()?.toggle_video()?;
        tracing::debug!(enabled, "Camera toggled");
        self.publish_snapshot();
        Ok(enabled)
    }

    async fn route_audio(&self, speaker: bool) -> Result<(), MediaError> {
        let target = if speaker {
            let device = self
                .devices
                .enumerate_devices()
                .await?
                .into_iter()
                .find(|d| {
                    d.kind == DeviceKind::AudioOutput && d.label.to_lowercase().contains("speaker")
                })
                .ok_or_else(|| MediaError::DeviceNotFound("speaker output".to_string()))?;
            Some(device.id)
        } else {
            None
        };
        self.devices.set_audio_output(target.as_deref()).await
    }

    async fn toggle_speaker(&mut self) -> Result<SpeakerToggle, CallError> {
        let Some(current) = self.session.as_ref().map(|s| s.speaker_on) else {
            return Err(CallError::InvalidState(self.state));
        };
        let on = !current;

        let route = if self.devices.supports_output_selection() {
            match self.route_audio(on).await {
                Ok(()) => OutputRoute::Routed,
                Err(e) => {
                    tracing::warn!(error = %e, "Speaker routing failed");
                    OutputRoute::UiOnly
                }
            }
        } else {
            OutputRoute::UiOnly
        };
        if route == OutputRoute::UiOnly {
            self.emit(CallEvent::Notice(Notice::SpeakerRoutingUnsupported));
        }

        if let Some(session) = self.session.as_mut() {
            session.speaker_on = on;
        }
        self.publish_snapshot();
        Ok(SpeakerToggle { on, route })
    }

    async fn switch_camera(&mut self) -> Result<CameraSwitch, CallError> {
        if self.state != CallState::Connected {
            return Err(CallError::InvalidState(self.state));
        }
        let devices = Arc::clone(&self.devices);
        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            return Err(CallError::InvalidState(state));
        };
        if !session.kind.has_video() {
            return Err(CallError::Media(MediaError::NoVideoTrack));
        }
        let (Some(media), Some(peer)) = (session.media.as_mut(), session.peer.clone()) else {
            return Err(CallError::InvalidState(state));
        };

        let Some(track) = media.capture_opposite_camera(devices.as_ref()).await? else {
            tracing::info!("Only one camera available");
            let _ = self.events.send(CallEvent::Notice(Notice::SingleCamera));
            return Ok(CameraSwitch::SingleCamera);
        };
        if let Err(e) = peer.replace_video_track(&track).await {
            track.stop();
            return Err(e.into());
        }
        let facing = media.install_video(track);

        tracing::info!(facing = ?facing, "Camera switched");
        self.publish_snapshot();
        Ok(CameraSwitch::Switched(facing))
    }

    // ---- pipeline progress ----

    async fn handle_setup(&mut self, epoch: u64, step: SetupStep) {
        if !self.is_current(epoch) {
            let signaling = Arc::clone(&self.signaling);
            tokio::spawn(async move { dispose_step(&signaling, step).await });
            return;
        }

        match step {
            SetupStep::RecordCreated { record, media } => {
                let call_id = record.id;
                if let Some(session) = self.session.as_mut() {
                    session.call_id = Some(call_id.clone());
                    session.media = Some(media);
                }
                tracing::info!(user = %self.user, call_id = %call_id, "Call record created");
                self.follow_call(epoch, call_id);
                self.transition(CallState::Outgoing);
                self.arm_ring_timeout(epoch);
            }
            SetupStep::FeedReady { feed } => {
                if let Some(session) = self.session.as_mut() {
                    session.candidate_feed = Some(feed);
                }
            }
            SetupStep::MediaReady { media } => {
                if let Some(session) = self.session.as_mut() {
                    session.media = Some(media);
                }
                self.publish_snapshot();
            }
            SetupStep::PeerReady { peer } => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.peer = Some(Arc::clone(&peer));
                let early: Vec<CandidateInit> = session.early_candidates.drain(..).collect();
                let answer = session.pending_answer.take();
                if !early.is_empty() {
                    tracing::debug!(count = early.len(), "Handing early candidates to peer");
                }
                for candidate in early {
                    peer.add_remote_candidate(candidate).await;
                }
                if let Some(answer) = answer {
                    self.apply_answer(answer).await;
                }
            }
            SetupStep::OfferPublished => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.setup_running = false;
                if let (Some(reply), Some(call_id)) =
                    (session.start_reply.take(), session.call_id.clone())
                {
                    let _ = reply.send(Ok(call_id));
                }
                tracing::debug!(user = %self.user, "Offer published");
                self.publish_snapshot();
            }
            SetupStep::AnswerPublished => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                session.setup_running = false;
                if let Some(reply) = session.answer_reply.take() {
                    let _ = reply.send(Ok(()));
                }
                let call_id = session.call_id.clone();
                self.transition(CallState::Connected);
                if let Some(call_id) = call_id {
                    self.emit(CallEvent::Connected { call_id });
                }
            }
            SetupStep::Failed(error) => self.fail(error).await,
        }
    }

    async fn apply_answer(&mut self, answer: SessionDescription) {
        if self.state != CallState::Outgoing {
            return;
        }
        let Some(peer) = self.session.as_ref().and_then(|s| s.peer.clone()) else {
            return;
        };
        if answer.sdp_type != SdpType::Answer {
            self.fail(CallError::Negotiation(PeerError::Negotiation(
                "remote description is not an answer".to_string(),
            )))
            .await;
            return;
        }
        match peer.set_remote_description(answer).await {
            Ok(drained) => {
                tracing::info!(user = %self.user, call_id = %peer.call_id(), drained, "Answer applied");
                self.transition(CallState::Connected);
                self.emit(CallEvent::Connected {
                    call_id: peer.call_id().clone(),
                });
            }
            Err(e) => self.fail(e.into()).await,
        }
    }

    async fn handle_peer_event(&mut self, epoch: u64, event: PeerEvent) {
        if !self.is_current(epoch) {
            return;
        }
        match event {
            PeerEvent::RemoteTrack(track) => {
                let Some(session) = self.session.as_mut() else {
                    return;
                };
                let (track_id, kind) = (track.id.clone(), track.kind);
                if !session.remote_stream.add(track) {
                    return;
                }
                if let Some(call_id) = session.call_id.clone() {
                    self.emit(CallEvent::RemoteTrackAdded {
                        call_id,
                        track_id,
                        kind,
                    });
                }
                self.publish_snapshot();
            }
            PeerEvent::StateChanged(PeerState::Failed) => {
                self.fail(CallError::Negotiation(PeerError::ConnectionFailed))
                    .await;
            }
            PeerEvent::StateChanged(state) => {
                tracing::debug!(user = %self.user, state = ?state, "Peer connection state");
            }
            PeerEvent::LocalCandidate(_) => {}
        }
    }

    async fn handle_ring_timeout(&mut self, epoch: u64) {
        if !self.is_current(epoch) {
            return;
        }
        let answering = self.session.as_ref().is_some_and(|s| s.setup_running);
        let expired = match self.state {
            CallState::Outgoing => true,
            CallState::Incoming => !answering,
            _ => false,
        };
        if expired {
            tracing::info!(user = %self.user, state = ?self.state, "Ring timeout");
            self.finish(EndReason::Timeout, true).await;
        }
    }

    // ---- realtime feed ----

    async fn on_incoming(&mut self, record: CallRecord) {
        if record.receiver_id != self.user || record.status != CallStatus::Offering {
            return;
        }
        let duplicate = self
            .session
            .as_ref()
            .is_some_and(|s| s.call_id.as_ref() == Some(&record.id));
        if duplicate {
            return;
        }
        if self.session.is_some() || self.state != CallState::Idle {
            tracing::info!(user = %self.user, call_id = %record.id, caller = %record.caller_id, "Busy, declining incoming call");
            self.emit(CallEvent::BusyDeclined {
                call_id: record.id.clone(),
                caller: record.caller_id.clone(),
            });
            if self.config.decline_when_busy {
                self.publish_ended_later(record.id);
            }
            return;
        }

        let epoch = self.bump_epoch();
        let mut session = Session::new(
            epoch,
            CallRole::Receiver,
            record.caller_id.clone(),
            record.kind,
        );
        session.call_id = Some(record.id.clone());
        self.session = Some(session);
        self.last_error = None;

        tracing::info!(user = %self.user, call_id = %record.id, caller = %record.caller_id, kind = ?record.kind, "Incoming call");
        self.follow_call(epoch, record.id.clone());
        self.transition(CallState::Incoming);
        self.emit(CallEvent::IncomingCall {
            call_id: record.id,
            caller: record.caller_id,
            kind: record.kind,
        });
        self.arm_ring_timeout(epoch);
    }

    async fn on_record_updated(&mut self, record: CallRecord) {
        let state = self.state;
        let Some(session) = self.session.as_mut() else {
            tracing::trace!(call_id = %record.id, "Update with no active call");
            return;
        };
        if session.call_id.as_ref() != Some(&record.id) {
            tracing::trace!(call_id = %record.id, "Stale call update discarded");
            return;
        }

        match record.status {
            CallStatus::Ended => self.finish(EndReason::RemoteHangup, false).await,
            CallStatus::Answered => {
                if session.role != CallRole::Caller || state != CallState::Outgoing {
                    return;
                }
                let Some(answer) = record.answer else {
                    tracing::warn!(call_id = %record.id, "Answered record carries no answer");
                    return;
                };
                if session.peer.is_none() {
                    session.pending_answer = Some(answer);
                    return;
                }
                self.apply_answer(answer).await;
            }
            CallStatus::Offering => {}
        }
    }

    async fn on_remote_candidate(&mut self, record: IceCandidateRecord) {
        if record.sender_id == self.user {
            return;
        }
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if session.call_id.as_ref() != Some(&record.call_id) {
            tracing::trace!(call_id = %record.call_id, "Stale candidate discarded");
            return;
        }
        match session.peer.clone() {
            Some(peer) => {
                let disposition = peer.add_remote_candidate(record.candidate).await;
                tracing::trace!(disposition = ?disposition, "Remote candidate");
            }
            None => session.early_candidates.push_back(record.candidate),
        }
    }
}

async fn publish_ended<T: SignalingTransport>(signaling: &SignalingHandler<T>, call_id: &CallId) {
    match tokio::time::timeout(PUBLISH_END_TIMEOUT, signaling.publish_ended(call_id)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(call_id = %call_id, error = %e, "Failed to publish call end"),
        Err(_) => tracing::warn!(call_id = %call_id, "Timed out publishing call end"),
    }
}

/// Release a step's resources when no current session will take them
async fn dispose_step<T: SignalingTransport>(signaling: &SignalingHandler<T>, step: SetupStep) {
    match step {
        SetupStep::RecordCreated { record, media } => {
            tracing::debug!(call_id = %record.id, "Disposing superseded call record");
            media.stop_all();
            publish_ended(signaling, &record.id).await;
        }
        SetupStep::MediaReady { media } => media.stop_all(),
        SetupStep::PeerReady { peer } => peer.close().await,
        SetupStep::FeedReady { .. }
        | SetupStep::OfferPublished
        | SetupStep::AnswerPublished
        | SetupStep::Failed(_) => {}
    }
}

// ---- setup pipelines ----

struct SetupContext<T: SignalingTransport + 'static> {
    user: UserId,
    signaling: Arc<SignalingHandler<T>>,
    devices: Arc<dyn MediaDevices>,
    peers: Arc<dyn PeerConnectionFactory>,
    ice_servers: Vec<IceServer>,
    inbox: mpsc::UnboundedSender<Input>,
    epoch: u64,
    cancel: Arc<AtomicBool>,
}

impl<T: SignalingTransport + 'static> SetupContext<T> {
    /// Hand a step to the engine, or dispose of it here once the engine is gone
    async fn step(&self, step: SetupStep) {
        let input = Input::Setup {
            epoch: self.epoch,
            step,
        };
        if let Err(mpsc::error::SendError(Input::Setup { step, .. })) = self.inbox.send(input) {
            dispose_step(&self.signaling, step).await;
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    async fn open_peer(&self, call_id: &CallId) -> Result<Arc<PeerSession>, PeerError> {
        // The engine stores the session, so this must not keep the inbox open.
        let inbox = self.inbox.downgrade();
        let epoch = self.epoch;
        let sink: Arc<dyn CandidateSink> = self.signaling.clone();
        let peer = PeerSession::open(
            self.peers.as_ref(),
            &self.ice_servers,
            call_id.clone(),
            self.user.clone(),
            sink,
            move |event| {
                if let Some(inbox) = inbox.upgrade() {
                    let _ = inbox.send(Input::Peer { epoch, event });
                }
            },
        )
        .await?;
        Ok(Arc::new(peer))
    }

    async fn fetch_offer(&self, call_id: &CallId) -> Result<SessionDescription, CallError> {
        let mut attempt = 1;
        loop {
            match self.signaling.fetch_offer(call_id).await {
                Err(SignalingError::MissingOffer(_))
                    if attempt < OFFER_FETCH_ATTEMPTS && !self.cancelled() =>
                {
                    tracing::debug!(call_id = %call_id, attempt, "Offer not stored yet");
                    attempt += 1;
                    tokio::time::sleep(OFFER_FETCH_BACKOFF).await;
                }
                result => return result.map_err(Into::into),
            }
        }
    }
}

async fn run_caller_setup<T: SignalingTransport + 'static>(
    ctx: SetupContext<T>,
    receiver: UserId,
    kind: MediaKind,
) {
    let media = match MediaSession::acquire(ctx.devices.as_ref(), kind).await {
        Ok(media) => media,
        Err(e) => return ctx.step(SetupStep::Failed(e.into())).await,
    };
    if ctx.cancelled() {
        media.stop_all();
        return;
    }

    let record = match ctx
        .signaling
        .create_offering(&ctx.user, &receiver, kind)
        .await
    {
        Ok(record) => record,
        Err(e) => {
            media.stop_all();
            return ctx.step(SetupStep::Failed(e.into())).await;
        }
    };
    if ctx.cancelled() {
        return dispose_step(&ctx.signaling, SetupStep::RecordCreated { record, media }).await;
    }
    let call_id = record.id.clone();
    let tracks = media.tracks();
    ctx.step(SetupStep::RecordCreated { record, media }).await;
    if ctx.cancelled() {
        return;
    }

    let peer = match ctx.open_peer(&call_id).await {
        Ok(peer) => peer,
        Err(e) => return ctx.step(SetupStep::Failed(e.into())).await,
    };
    ctx.step(SetupStep::PeerReady {
        peer: Arc::clone(&peer),
    })
    .await;
    if ctx.cancelled() {
        return;
    }
    if let Err(e) = peer.add_local_tracks(&tracks).await {
        return ctx.step(SetupStep::Failed(e.into())).await;
    }
    let offer = match peer.create_offer().await {
        Ok(offer) => offer,
        Err(e) => return ctx.step(SetupStep::Failed(e.into())).await,
    };
    if ctx.cancelled() {
        return;
    }

    match ctx.signaling.publish_offer(&call_id, offer).await {
        Ok(()) => ctx.step(SetupStep::OfferPublished).await,
        Err(e) => ctx.step(SetupStep::Failed(e.into())).await,
    }
}

async fn run_receiver_setup<T: SignalingTransport + 'static>(
    ctx: SetupContext<T>,
    call_id: CallId,
    kind: MediaKind,
) {
    let media = match MediaSession::acquire(ctx.devices.as_ref(), kind).await {
        Ok(media) => media,
        Err(e) => return ctx.step(SetupStep::Failed(e.into())).await,
    };
    if ctx.cancelled() {
        media.stop_all();
        return;
    }
    let tracks = media.tracks();
    ctx.step(SetupStep::MediaReady { media }).await;

    let peer = match ctx.open_peer(&call_id).await {
        Ok(peer) => peer,
        Err(e) => return ctx.step(SetupStep::Failed(e.into())).await,
    };
    ctx.step(SetupStep::PeerReady {
        peer: Arc::clone(&peer),
    })
    .await;
    if ctx.cancelled() {
        return;
    }
    if let Err(e) = peer.add_local_tracks(&tracks).await {
        return ctx.step(SetupStep::Failed(e.into())).await;
    }

    let offer = match ctx.fetch_offer(&call_id).await {
        Ok(offer) => offer,
        Err(e) => return ctx.step(SetupStep::Failed(e)).await,
    };
    if ctx.cancelled() {
        return;
    }
    if let Err(e) = peer.set_remote_description(offer).await {
        return ctx.step(SetupStep::Failed(e.into())).await;
    }
    let answer = match peer.create_answer().await {
        Ok(answer) => answer,
        Err(e) => return ctx.step(SetupStep::Failed(e.into())).await,
    };
    if ctx.cancelled() {
        return;
    }

    match ctx.signaling.publish_answer(&call_id, answer).await {
        Ok(()) => ctx.step(SetupStep::AnswerPublished).await,
        Err(e) => ctx.step(SetupStep::Failed(e.into())).await,
    }
}
