//! Quadcall - one-to-one voice and video calls over WebRTC
//!
//! Calls are negotiated through a realtime record backend: the caller inserts
//! a call record, both sides exchange SDP through it and trickle ICE
//! candidates through a per-call candidate feed. Media flows peer to peer. It
//! features:
//!
//! - **Single-session state machine**: one engine task owns the call, so
//!   hangups, remote updates and setup progress never race
//! - **Pluggable signaling**: any backend implementing [`SignalingTransport`]
//! - **Early candidate buffering**: remote candidates are held until the
//!   remote description is set, in arrival order
//! - **Camera switching** without renegotiation
//!
//! # Examples
//!
//! ```rust,no_run
//! use quadcall_core::{CallManager, MediaKind, MemoryTransport, SignalingHandler, UserId};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let transport = Arc::new(MemoryTransport::new());
//! let signaling = Arc::new(SignalingHandler::new(transport));
//!
//! let manager = CallManager::builder(UserId::new("alice"), signaling)
//!     .build()
//!     .await?;
//!
//! let call_id = manager.start_call(UserId::new("bob"), MediaKind::Video).await?;
//! println!("ringing: {call_id}");
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::panic)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::all)]
#![allow(clippy::pedantic)]
#![allow(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

/// Core call types and records
pub mod types;

/// User identity
pub mod identity;

/// Configuration
pub mod config;

/// Signaling protocol and handlers
pub mod signaling;

/// In-memory signaling backend
pub mod transport;

/// Local capture and devices
pub mod media;

/// Peer connection wrapper
pub mod peer;

/// Call management and state
pub mod call;

mod engine;

pub use call::{
    CallError, CallManager, CallManagerBuilder, CallSnapshot, CameraSwitch, OutputRoute,
    SpeakerToggle,
};
pub use config::{CallConfig, ConfigError, IceServer};
pub use identity::UserId;
pub use media::{
    CaptureConstraints, DeviceKind, LocalStream, LocalTrack, MediaDeviceInfo, MediaDevices,
    MediaError, MediaSession, SyntheticDevices,
};
pub use peer::{
    CandidateDisposition, CandidateSink, PeerBackend, PeerConnectionFactory, PeerError,
    PeerEvent, PeerSession, PeerState, RemoteStream, RemoteTrack, RtcPeerFactory,
};
pub use signaling::{
    SignalEvent, SignalingError, SignalingHandler, SignalingTransport, SubscriptionGuard,
};
pub use transport::{MemoryTransport, Operation};
pub use types::{
    CallEvent, CallId, CallRecord, CallRole, CallState, CallStatus, CallUpdate, CandidateInit,
    EndReason, FacingMode, IceCandidateRecord, MediaKind, NewCallRecord, Notice, RecordError,
    SdpType, SessionDescription, TrackKind,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{
        CallConfig, CallError, CallEvent, CallId, CallManager, CallSnapshot, CallState,
        MediaKind, SignalingHandler, SignalingTransport, UserId,
    };
}
