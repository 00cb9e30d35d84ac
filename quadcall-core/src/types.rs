//! Call types and data structures

use crate::identity::UserId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a call, assigned by the signaling backend
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    /// Wrap a backend-issued identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for CallId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of call, fixed when the session is created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Voice only
    Audio,
    /// Voice and camera
    Video,
}

impl MediaKind {
    /// Whether this kind of call captures a camera
    #[must_use]
    pub fn has_video(self) -> bool {
        matches!(self, Self::Video)
    }
}

/// Kind of a single media track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    /// Microphone / remote audio
    Audio,
    /// Camera / remote video
    Video,
}

/// Camera facing mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FacingMode {
    /// Front ("user") camera
    #[default]
    Front,
    /// Back ("environment") camera
    Back,
}

impl FacingMode {
    /// The other camera
    #[must_use]
    pub fn opposite(self) -> Self {
        match self {
            Self::Front => Self::Back,
            Self::Back => Self::Front,
        }
    }
}

/// Status persisted on the call record, observed by both peers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallStatus {
    /// Caller created the record and is publishing its offer
    Offering,
    /// Receiver published its answer
    Answered,
    /// Either party hung up
    Ended,
}

/// Session description type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Offer
    Offer,
    /// Answer
    Answer,
}

/// Session description payload, opaque to the call subsystem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    /// Offer or answer
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    /// SDP body
    pub sdp: String,
}

impl SessionDescription {
    /// Build an offer description
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    /// Build an answer description
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// ICE candidate payload in the browser's JSON shape
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateInit {
    /// Candidate line
    pub candidate: String,
    /// Media stream identification tag
    #[serde(default, rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// Media line index
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

impl CandidateInit {
    /// Candidate without mid/mline hints
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

/// Call record row, as stored by the signaling backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallRecord {
    /// Backend-assigned id
    pub id: CallId,
    /// Who started the call
    pub caller_id: UserId,
    /// Who is being called
    pub receiver_id: UserId,
    /// Current status
    pub status: CallStatus,
    /// Caller's offer, set once
    pub offer: Option<SessionDescription>,
    /// Receiver's answer, set once and only after the offer
    pub answer: Option<SessionDescription>,
    /// Audio or video
    #[serde(rename = "type")]
    pub kind: MediaKind,
    /// Creation timestamp
    pub created_at: DateTime<Utc>,
}

/// Values for a call record about to be created
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCallRecord {
    /// Caller
    pub caller_id: UserId,
    /// Receiver
    pub receiver_id: UserId,
    /// Audio or video
    #[serde(rename = "type")]
    pub kind: MediaKind,
}

/// Partial update of a call record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallUpdate {
    /// New status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<CallStatus>,
    /// Offer to store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offer: Option<SessionDescription>,
    /// Answer to store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer: Option<SessionDescription>,
}

impl CallUpdate {
    /// Store the caller's offer
    #[must_use]
    pub fn offer(offer: SessionDescription) -> Self {
        Self {
            offer: Some(offer),
            ..Self::default()
        }
    }

    /// Mark answered and store the answer
    #[must_use]
    pub fn answered(answer: SessionDescription) -> Self {
        Self {
            status: Some(CallStatus::Answered),
            answer: Some(answer),
            ..Self::default()
        }
    }

    /// Mark ended
    #[must_use]
    pub fn ended() -> Self {
        Self {
            status: Some(CallStatus::Ended),
            ..Self::default()
        }
    }
}

/// Violations of the call record rules
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecordError {
    /// Offer may only be written once
    #[error("offer already set")]
    OfferAlreadySet,

    /// Answer may only be written once
    #[error("answer already set")]
    AnswerAlreadySet,

    /// Answer requires an offer
    #[error("answer before offer")]
    AnswerBeforeOffer,

    /// Nothing but `ended` may be written to an ended call
    #[error("call already ended")]
    AlreadyEnded,
}

impl CallRecord {
    /// Create a fresh `offering` record
    pub fn offering(id: CallId, new: NewCallRecord) -> Self {
        Self {
            id,
            caller_id: new.caller_id,
            receiver_id: new.receiver_id,
            status: CallStatus::Offering,
            offer: None,
            answer: None,
            kind: new.kind,
            created_at: Utc::now(),
        }
    }

    /// Whether `user` is one of the two participants
    #[must_use]
    pub fn involves(&self, user: &UserId) -> bool {
        &self.caller_id == user || &self.receiver_id == user
    }

    /// The participant that is not `me`
    #[must_use]
    pub fn other_party(&self, me: &UserId) -> &UserId {
        if &self.caller_id == me {
            &self.receiver_id
        } else {
            &self.caller_id
        }
    }

    /// Apply a partial update, enforcing the offer/answer ordering rules
    ///
    /// # Errors
    ///
    /// Returns the violated rule; the record is left untouched in that case.
    pub fn apply(&mut self, update: CallUpdate) -> Result<(), RecordError> {
        if self.status == CallStatus::Ended {
            let only_end = update.offer.is_none()
                && update.answer.is_none()
                && matches!(update.status, None | Some(CallStatus::Ended));
            return if only_end {
                Ok(())
            } else {
                Err(RecordError::AlreadyEnded)
            };
        }
        if update.offer.is_some() && self.offer.is_some() {
            return Err(RecordError::OfferAlreadySet);
        }
        if update.answer.is_some() {
            if self.answer.is_some() {
                return Err(RecordError::AnswerAlreadySet);
            }
            if self.offer.is_none() && update.offer.is_none() {
                return Err(RecordError::AnswerBeforeOffer);
            }
        }

        if let Some(offer) = update.offer {
            self.offer = Some(offer);
        }
        if let Some(answer) = update.answer {
            self.answer = Some(answer);
        }
        if let Some(status) = update.status {
            self.status = status;
        }
        Ok(())
    }
}

/// ICE candidate row; append-only, consumed once by the other peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidateRecord {
    /// Owning call
    pub call_id: CallId,
    /// Peer that discovered the candidate
    pub sender_id: UserId,
    /// Candidate payload
    pub candidate: CandidateInit,
}

/// Call state machine state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CallState {
    /// No active call
    #[default]
    Idle,
    /// We called, waiting for the answer
    Outgoing,
    /// Someone is calling us
    Incoming,
    /// Offer and answer exchanged
    Connected,
    /// Call just ended; resets to idle after the display delay
    Ended,
}

impl CallState {
    /// Whether a session exists in this state
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(self, Self::Outgoing | Self::Incoming | Self::Connected)
    }
}

/// Which side of the call we are on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallRole {
    /// We created the record
    Caller,
    /// We received the record
    Receiver,
}

/// Why a call ended
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EndReason {
    /// Local user hung up or declined
    LocalHangup,
    /// The other party ended the call
    RemoteHangup,
    /// Nobody answered within the ring timeout
    Timeout,
    /// Setup or negotiation failed
    Failed(String),
}

/// User-visible notices that are not errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Notice {
    /// Camera switch requested but only one camera exists
    SingleCamera,
    /// Speaker toggle only changed the on-screen flag
    SpeakerRoutingUnsupported,
}

/// Call event for notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CallEvent {
    /// State machine moved
    StateChanged {
        /// Previous state
        from: CallState,
        /// New state
        to: CallState,
    },
    /// Incoming call received
    IncomingCall {
        /// Call identifier
        call_id: CallId,
        /// Who is calling
        caller: UserId,
        /// Audio or video
        kind: MediaKind,
    },
    /// Incoming call declined because another call is active
    BusyDeclined {
        /// The declined call
        call_id: CallId,
        /// Who was calling
        caller: UserId,
    },
    /// Offer and answer exchanged
    Connected {
        /// Call identifier
        call_id: CallId,
    },
    /// Remote track became available
    RemoteTrackAdded {
        /// Call identifier
        call_id: CallId,
        /// Remote track id
        track_id: String,
        /// Audio or video
        kind: TrackKind,
    },
    /// Call ended
    CallEnded {
        /// Call identifier, if one had been assigned
        call_id: Option<CallId>,
        /// Why
        reason: EndReason,
    },
    /// Call setup or negotiation failed
    CallFailed {
        /// Call identifier, if one had been assigned
        call_id: Option<CallId>,
        /// Error description
        error: String,
    },
    /// Informational notice for the user
    Notice(Notice),
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record() -> CallRecord {
        CallRecord::offering(
            CallId::new("c1"),
            NewCallRecord {
                caller_id: UserId::new("alice"),
                receiver_id: UserId::new("bob"),
                kind: MediaKind::Video,
            },
        )
    }

    #[test]
    fn test_answer_requires_offer() {
        let mut rec = record();
        let err = rec
            .apply(CallUpdate::answered(SessionDescription::answer("a")))
            .unwrap_err();
        assert_eq!(err, RecordError::AnswerBeforeOffer);
        assert_eq!(rec.status, CallStatus::Offering);
        assert!(rec.answer.is_none());

        rec.apply(CallUpdate::offer(SessionDescription::offer("o")))
            .unwrap();
        rec.apply(CallUpdate::answered(SessionDescription::answer("a")))
            .unwrap();
        assert_eq!(rec.status, CallStatus::Answered);
    }

    #[test]
    fn test_offer_and_answer_set_once() {
        let mut rec = record();
        rec.apply(CallUpdate::offer(SessionDescription::offer("o1")))
            .unwrap();
        assert_eq!(
            rec.apply(CallUpdate::offer(SessionDescription::offer("o2"))),
            Err(RecordError::OfferAlreadySet)
        );
        rec.apply(CallUpdate::answered(SessionDescription::answer("a1")))
            .unwrap();
        assert_eq!(
            rec.apply(CallUpdate::answered(SessionDescription::answer("a2"))),
            Err(RecordError::AnswerAlreadySet)
        );
        assert_eq!(rec.offer.unwrap().sdp, "o1");
    }

    #[test]
    fn test_ended_is_terminal_and_idempotent() {
        let mut rec = record();
        rec.apply(CallUpdate::ended()).unwrap();
        rec.apply(CallUpdate::ended()).unwrap();
        assert_eq!(
            rec.apply(CallUpdate::offer(SessionDescription::offer("late"))),
            Err(RecordError::AlreadyEnded)
        );
        assert_eq!(rec.status, CallStatus::Ended);
    }

    #[test]
    fn test_record_wire_shape() {
        let mut rec = record();
        rec.apply(CallUpdate::offer(SessionDescription::offer("v=0")))
            .unwrap();
        let json = serde_json::to_value(&rec).unwrap();
        assert_eq!(json["type"], "video");
        assert_eq!(json["status"], "offering");
        assert_eq!(json["caller_id"], "alice");
        assert_eq!(json["offer"]["type"], "offer");
        assert!(json["answer"].is_null());
    }

    #[test]
    fn test_candidate_browser_shape() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 54321 typ host","sdpMid":"0","sdpMLineIndex":0}"#;
        let c: CandidateInit = serde_json::from_str(json).unwrap();
        assert_eq!(c.sdp_mid.as_deref(), Some("0"));
        assert_eq!(c.sdp_mline_index, Some(0));
    }

    #[test]
    fn test_other_party() {
        let rec = record();
        assert_eq!(rec.other_party(&UserId::new("alice")).as_str(), "bob");
        assert_eq!(rec.other_party(&UserId::new("bob")).as_str(), "alice");
        assert!(rec.involves(&UserId::new("bob")));
        assert!(!rec.involves(&UserId::new("carol")));
    }
}
