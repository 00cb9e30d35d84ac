//! Local media for a call
//!
//! Capture goes through the [`MediaDevices`] trait, the seam to the platform
//! media API. Every captured track is a [`LocalTrack`] wrapping a webrtc
//! `TrackLocalStaticSample`, so it can be attached to a peer connection as is.
//! [`MediaSession`] owns the tracks of one call and implements the mute, video
//! and camera-switch operations on them.

use crate::types::{FacingMode, MediaKind, TrackKind};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

/// Stream id shared by the tracks of one local capture
const LOCAL_STREAM_ID: &str = "quadcall-local";

/// Media-related errors
#[derive(Error, Debug)]
pub enum MediaError {
    /// User or platform refused capture
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// Device not found
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Stream error
    #[error("Stream error: {0}")]
    StreamError(String),

    /// Track was stopped and can no longer carry media
    #[error("Track stopped: {0}")]
    TrackStopped(String),

    /// Session has no video track
    #[error("No video track in this session")]
    NoVideoTrack,

    /// Platform cannot choose the audio output device
    #[error("Audio output selection not supported")]
    OutputSelectionUnsupported,
}

/// Kind of media device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Microphone
    AudioInput,
    /// Camera
    VideoInput,
    /// Speaker, earpiece or headset
    AudioOutput,
}

/// Device as reported by enumeration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    /// Device identifier
    pub id: String,
    /// Device kind
    pub kind: DeviceKind,
    /// Human readable label
    pub label: String,
    /// Facing mode for cameras
    pub facing: Option<FacingMode>,
}

/// Capture request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureConstraints {
    /// Capture the microphone
    pub audio: bool,
    /// Capture a camera with this facing mode
    pub video: Option<FacingMode>,
}

impl CaptureConstraints {
    /// Constraints for the start of a call
    #[must_use]
    pub fn for_call(kind: MediaKind, facing: FacingMode) -> Self {
        Self {
            audio: true,
            video: kind.has_video().then_some(facing),
        }
    }

    /// Camera only, used when switching cameras mid-call
    #[must_use]
    pub fn camera(facing: FacingMode) -> Self {
        Self {
            audio: false,
            video: Some(facing),
        }
    }
}

struct TrackInner {
    id: String,
    kind: TrackKind,
    device_id: String,
    facing: Option<FacingMode>,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    stopped: AtomicBool,
}

/// Captured local track
///
/// Clones share state: disabling or stopping one clone affects all of them.
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<TrackInner>,
}

impl std::fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.inner.id)
            .field("kind", &self.inner.kind)
            .field("facing", &self.inner.facing)
            .field("enabled", &self.is_enabled())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl PartialEq for LocalTrack {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl LocalTrack {
    /// Opus 48 kHz stereo microphone track
    pub fn audio(id: impl Into<String>, device_id: impl Into<String>) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: "audio/opus".to_string(),
            clock_rate: 48000,
            channels: 2,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };
        Self::with_codec(id.into(), TrackKind::Audio, device_id.into(), None, codec)
    }

    /// VP8 90 kHz camera track
    pub fn video(id: impl Into<String>, device_id: impl Into<String>, facing: FacingMode) -> Self {
        let codec = RTCRtpCodecCapability {
            mime_type: "video/VP8".to_string(),
            clock_rate: 90000,
            channels: 0,
            sdp_fmtp_line: String::new(),
            rtcp_feedback: vec![],
        };
        Self::with_codec(
            id.into(),
            TrackKind::Video,
            device_id.into(),
            Some(facing),
            codec,
        )
    }

    fn with_codec(
        id: String,
        kind: TrackKind,
        device_id: String,
        facing: Option<FacingMode>,
        codec: RTCRtpCodecCapability,
    ) -> Self {
        tracing::debug!(track_id = %id, codec = %codec.mime_type, clock_rate = codec.clock_rate, "Creating local track");
        let rtc = Arc::new(TrackLocalStaticSample::new(
            codec,
            id.clone(),
            LOCAL_STREAM_ID.to_string(),
        ));
        Self {
            inner: Arc::new(TrackInner {
                id,
                kind,
                device_id,
                facing,
                rtc,
                enabled: AtomicBool::new(true),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Track id
    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    /// Capturing device
    #[must_use]
    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Camera facing mode, `None` for audio
    #[must_use]
    pub fn facing(&self) -> Option<FacingMode> {
        self.inner.facing
    }

    /// Whether samples are forwarded
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    /// Enable or disable the track without releasing the device
    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Whether the device has been released
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Release the device; idempotent
    pub fn stop(&self) {
        if !self.inner.stopped.swap(true, Ordering::SeqCst) {
            tracing::debug!(track_id = %self.inner.id, kind = ?self.inner.kind, "Local track stopped");
        }
    }

    /// The webrtc track to attach to a peer connection
    #[must_use]
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        Arc::clone(&self.inner.rtc)
    }

    /// Push one encoded sample
    ///
    /// Returns `false` if the track is disabled and the sample was dropped.
    ///
    /// # Errors
    ///
    /// Returns error if the track is stopped or the write fails
    pub async fn write_sample(&self, data: bytes::Bytes, duration: Duration) -> Result<bool, MediaError> {
        if self.is_stopped() {
            return Err(MediaError::TrackStopped(self.inner.id.clone()));
        }
        if !self.is_enabled() {
            return Ok(false);
        }
        let sample = Sample {
            data,
            duration,
            ..Default::default()
        };
        self.inner
            .rtc
            .write_sample(&sample)
            .await
            .map_err(|e| MediaError::StreamError(e.to_string()))?;
        Ok(true)
    }
}

/// Platform media API
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// List available devices
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError>;

    /// Capture tracks matching `constraints`
    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError>;

    /// Whether [`MediaDevices::set_audio_output`] is available
    fn supports_output_selection(&self) -> bool {
        false
    }

    /// Route remote audio to a device, or back to the default with `None`
    async fn set_audio_output(&self, _device_id: Option<&str>) -> Result<(), MediaError> {
        Err(MediaError::OutputSelectionUnsupported)
    }
}

/// Tracks of the local stream, as shown to the UI
#[derive(Debug, Clone, PartialEq)]
pub struct LocalStream {
    /// Microphone track
    pub audio: LocalTrack,
    /// Camera track, video calls only
    pub video: Option<LocalTrack>,
}

/// Local media owned by one call
#[derive(Debug)]
pub struct MediaSession {
    kind: MediaKind,
    audio: LocalTrack,
    video: Option<LocalTrack>,
    facing: FacingMode,
}

impl MediaSession {
    /// Capture microphone and, for video calls, the front camera
    ///
    /// Tracks captured before a failure are stopped before returning.
    ///
    /// # Errors
    ///
    /// Returns error if capture fails or a required track is missing
    #[tracing::instrument(skip(devices))]
    pub async fn acquire(devices: &dyn MediaDevices, kind: MediaKind) -> Result<Self, MediaError> {
        let facing = FacingMode::default();
        let tracks = devices
            .get_user_media(&CaptureConstraints::for_call(kind, facing))
            .await?;

        let mut audio = None;
        let mut video = None;
        for track in tracks {
            match track.kind() {
                TrackKind::Audio if audio.is_none() => audio = Some(track),
                TrackKind::Video if video.is_none() && kind.has_video() => video = Some(track),
                _ => track.stop(),
            }
        }

        let Some(audio) = audio else {
            if let Some(v) = &video {
                v.stop();
            }
            return Err(MediaError::DeviceNotFound("microphone".to_string()));
        };
        if kind.has_video() && video.is_none() {
            audio.stop();
            return Err(MediaError::DeviceNotFound("camera".to_string()));
        }

        tracing::info!(audio = %audio.id(), video = ?video.as_ref().map(LocalTrack::id), "Local media acquired");
        Ok(Self {
            kind,
            audio,
            video,
            facing,
        })
    }

    /// Audio or video
    #[must_use]
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    /// Microphone track
    #[must_use]
    pub fn audio(&self) -> &LocalTrack {
        &self.audio
    }

    /// Camera track
    #[must_use]
    pub fn video(&self) -> Option<&LocalTrack> {
        self.video.as_ref()
    }

    /// All tracks, audio first
    #[must_use]
    pub fn tracks(&self) -> Vec<LocalTrack> {
        std::iter::once(self.audio.clone())
            .chain(self.video.clone())
            .collect()
    }

    /// Stream handed to the UI
    #[must_use]
    pub fn stream(&self) -> LocalStream {
        LocalStream {
            audio: self.audio.clone(),
            video: self.video.clone(),
        }
    }

    /// Current camera
    #[must_use]
    pub fn facing(&self) -> FacingMode {
        self.facing
    }

    /// Whether the microphone is muted
    #[must_use]
    pub fn is_muted(&self) -> bool {
        !self.audio.is_enabled()
    }

    /// Whether the camera is sending
    #[must_use]
    pub fn is_video_enabled(&self) -> bool {
        self.video.as_ref().is_some_and(LocalTrack::is_enabled)
    }

    /// Flip the microphone; returns the new muted flag
    pub fn toggle_mute(&self) -> bool {
        let muted = self.audio.is_enabled();
        self.audio.set_enabled(!muted);
        muted
    }

    /// Flip the camera; returns the new enabled flag
    ///
    /// # Errors
    ///
    /// Returns error for audio-only sessions
    pub fn toggle_video(&self) -> Result<bool, MediaError> {
        let video = self.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        let enabled = !video.is_enabled();
        video.set_enabled(enabled);
        Ok(enabled)
    }

    /// Capture the opposite camera
    ///
    /// Returns `None` when fewer than two cameras exist. The new track inherits
    /// the current enabled flag; the session is not modified until
    /// [`MediaSession::install_video`].
    ///
    /// # Errors
    ///
    /// Returns error for audio-only sessions or if capture fails
    pub async fn capture_opposite_camera(
        &self,
        devices: &dyn MediaDevices,
    ) -> Result<Option<LocalTrack>, MediaError> {
        let current = self.video.as_ref().ok_or(MediaError::NoVideoTrack)?;
        let cameras = devices
            .enumerate_devices()
            .await?
            .into_iter()
            .filter(|d| d.kind == DeviceKind::VideoInput)
            .count();
        if cameras < 2 {
            tracing::debug!(cameras, "Camera switch unavailable");
            return Ok(None);
        }

        let mut captured = devices
            .get_user_media(&CaptureConstraints::camera(self.facing.opposite()))
            .await?;
        let pos = captured.iter().position(|t| t.kind() == TrackKind::Video);
        let Some(pos) = pos else {
            captured.iter().for_each(LocalTrack::stop);
            return Err(MediaError::DeviceNotFound("camera".to_string()));
        };
        let track = captured.swap_remove(pos);
        captured.iter().for_each(LocalTrack::stop);

        track.set_enabled(current.is_enabled());
        Ok(Some(track))
    }

    /// Make `track` the session's camera, stopping the previous one
    ///
    /// Returns the new facing mode.
    pub fn install_video(&mut self, track: LocalTrack) -> FacingMode {
        if let Some(old) = self.video.replace(track.clone()) {
            old.stop();
        }
        self.facing = track.facing().unwrap_or_else(|| self.facing.opposite());
        self.facing
    }

    /// Stop every track
    pub fn stop_all(&self) {
        self.audio.stop();
        if let Some(video) = &self.video {
            video.stop();
        }
    }

    /// Tracks not yet stopped
    #[must_use]
    pub fn live_track_count(&self) -> usize {
        self.tracks().iter().filter(|t| !t.is_stopped()).count()
    }
}

/// Headless [`MediaDevices`] producing real webrtc tracks
///
/// Stands in for the platform media API in tests and the CLI. Every issued
/// track is remembered so leaks can be checked with
/// [`SyntheticDevices::live_tracks`].
pub struct SyntheticDevices {
    devices: Vec<MediaDeviceInfo>,
    deny: AtomicBool,
    output_selection: bool,
    capture_delay: Duration,
    next_id: AtomicU64,
    issued: Mutex<Vec<LocalTrack>>,
    output: Mutex<Option<String>>,
}

impl Default for SyntheticDevices {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticDevices {
    /// Microphone, front and back camera, speaker and earpiece outputs
    #[must_use]
    pub fn new() -> Self {
        Self::with_cameras(2)
    }

    /// Same as [`SyntheticDevices::new`] with `cameras` cameras (front first)
    #[must_use]
    pub fn with_cameras(cameras: usize) -> Self {
        let mut devices = vec![MediaDeviceInfo {
            id: "mic-0".to_string(),
            kind: DeviceKind::AudioInput,
            label: "Built-in Microphone".to_string(),
            facing: None,
        }];
        for i in 0..cameras {
            let facing = if i % 2 == 0 {
                FacingMode::Front
            } else {
                FacingMode::Back
            };
            devices.push(MediaDeviceInfo {
                id: format!("cam-{}", i),
                kind: DeviceKind::VideoInput,
                label: format!("{:?} Camera", facing),
                facing: Some(facing),
            });
        }
        devices.push(MediaDeviceInfo {
            id: "out-earpiece".to_string(),
            kind: DeviceKind::AudioOutput,
            label: "Earpiece".to_string(),
            facing: None,
        });
        devices.push(MediaDeviceInfo {
            id: "out-speaker".to_string(),
            kind: DeviceKind::AudioOutput,
            label: "Loud Speaker".to_string(),
            facing: None,
        });

        Self {
            devices,
            deny: AtomicBool::new(false),
            output_selection: false,
            capture_delay: Duration::ZERO,
            next_id: AtomicU64::new(0),
            issued: Mutex::new(Vec::new()),
            output: Mutex::new(None),
        }
    }

    /// Allow audio output routing
    #[must_use]
    pub fn with_output_selection(mut self, supported: bool) -> Self {
        self.output_selection = supported;
        self
    }

    /// Delay every capture
    #[must_use]
    pub fn with_capture_delay(mut self, delay: Duration) -> Self {
        self.capture_delay = delay;
        self
    }

    /// Refuse (or allow again) all capture requests
    pub fn deny_permission(&self, deny: bool) {
        self.deny.store(deny, Ordering::SeqCst);
    }

    /// Issued tracks that have not been stopped
    #[must_use]
    pub fn live_tracks(&self) -> Vec<LocalTrack> {
        self.issued
            .lock()
            .iter()
            .filter(|t| !t.is_stopped())
            .cloned()
            .collect()
    }

    /// Number of tracks ever issued
    #[must_use]
    pub fn issued_count(&self) -> usize {
        self.issued.lock().len()
    }

    /// Currently selected audio output
    #[must_use]
    pub fn selected_output(&self) -> Option<String> {
        self.output.lock().clone()
    }

    fn next_track_id(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.next_id.fetch_add(1, Ordering::SeqCst))
    }
}

#[async_trait]
impl MediaDevices for SyntheticDevices {
    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(self.devices.clone())
    }

    async fn get_user_media(
        &self,
        constraints: &CaptureConstraints,
    ) -> Result<Vec<LocalTrack>, MediaError> {
        if !self.capture_delay.is_zero() {
            tokio::time::sleep(self.capture_delay).await;
        }
        if self.deny.load(Ordering::SeqCst) {
            return Err(MediaError::PermissionDenied(
                "capture refused by user".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if constraints.audio {
            let mic = self
                .devices
                .iter()
                .find(|d| d.kind == DeviceKind::AudioInput)
                .ok_or_else(|| MediaError::DeviceNotFound("microphone".to_string()))?;
            tracks.push(LocalTrack::audio(self.next_track_id("audio"), &mic.id));
        }
        if let Some(facing) = constraints.video {
            let cameras: Vec<&MediaDeviceInfo> = self
                .devices
                .iter()
                .filter(|d| d.kind == DeviceKind::VideoInput)
                .collect();
            let camera = cameras
                .iter()
                .find(|d| d.facing == Some(facing))
                .or_else(|| cameras.first())
                .ok_or_else(|| MediaError::DeviceNotFound("camera".to_string()))?;
            let actual = camera.facing.unwrap_or(facing);
            tracks.push(LocalTrack::video(
                self.next_track_id("video"),
                &camera.id,
                actual,
            ));
        }

        self.issued.lock().extend(tracks.iter().cloned());
        Ok(tracks)
    }

    fn supports_output_selection(&self) -> bool {
        self.output_selection
    }

    async fn set_audio_output(&self, device_id: Option<&str>) -> Result<(), MediaError> {
        if !self.output_selection {
            return Err(MediaError::OutputSelectionUnsupported);
        }
        if let Some(id) = device_id {
            if !self
                .devices
                .iter()
                .any(|d| d.kind == DeviceKind::AudioOutput && d.id == id)
            {
                return Err(MediaError::DeviceNotFound(id.to_string()));
            }
        }
        *self.output.lock() = device_id.map(str::to_string);
        Ok(())
    }
}
