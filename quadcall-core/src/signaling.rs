//! Call signaling over the backend's record store and realtime feed
//!
//! The hosted backend is modelled at its boundary by [`SignalingTransport`]:
//! call records and ICE candidate rows are written through it, and three
//! realtime feeds are read from it. [`SignalingHandler`] wraps a transport with
//! the typed operations the call state machine needs and forwards the feeds
//! into the state machine's queue as [`SignalEvent`]s.

use crate::identity::UserId;
use crate::peer::CandidateSink;
use crate::types::{
    CallId, CallRecord, CallUpdate, CandidateInit, IceCandidateRecord, MediaKind, NewCallRecord,
    RecordError, SdpType, SessionDescription,
};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Signaling errors
#[derive(Error, Debug)]
pub enum SignalingError {
    /// No record with that id
    #[error("Call not found: {0}")]
    CallNotFound(String),

    /// Backend refused the write
    #[error("Record rejected: {0}")]
    Rejected(#[from] RecordError),

    /// Record exists but has no usable offer
    #[error("No offer stored on call {0}")]
    MissingOffer(String),

    /// Transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Signaling transport trait
///
/// Implement this for the hosted backend in use. Subscriptions deliver only
/// rows written after the subscription was opened; dropping the receiver ends
/// the subscription.
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    /// Transport error type
    type Error: std::error::Error + Into<SignalingError> + Send + Sync + 'static;

    /// Insert a new `offering` record; the backend assigns the id
    async fn create_call(&self, record: NewCallRecord) -> Result<CallRecord, Self::Error>;

    /// Apply a partial update and return the updated record
    async fn update_call(
        &self,
        call_id: &CallId,
        update: CallUpdate,
    ) -> Result<CallRecord, Self::Error>;

    /// Read a record
    async fn fetch_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, Self::Error>;

    /// Append a candidate row
    async fn insert_candidate(&self, record: IceCandidateRecord) -> Result<(), Self::Error>;

    /// Read the candidate rows already stored for a call
    async fn fetch_candidates(
        &self,
        call_id: &CallId,
    ) -> Result<Vec<IceCandidateRecord>, Self::Error>;

    /// New records whose `receiver_id` is `user`
    async fn subscribe_incoming(
        &self,
        user: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<CallRecord>, Self::Error>;

    /// Updates to records `user` participates in
    async fn subscribe_updates(
        &self,
        user: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<CallRecord>, Self::Error>;

    /// New candidate rows for `call_id` not sent by `exclude_sender`
    async fn subscribe_candidates(
        &self,
        call_id: &CallId,
        exclude_sender: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<IceCandidateRecord>, Self::Error>;
}

/// Realtime notification delivered to the call state machine
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    /// A call record naming us as receiver was created
    Incoming(CallRecord),
    /// A call record we participate in was updated
    Updated(CallRecord),
    /// The other peer published a candidate
    Candidate(IceCandidateRecord),
}

/// Keeps realtime forwarding alive; dropping it tears the forwarding down
#[derive(Debug, Default)]
pub struct SubscriptionGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl SubscriptionGuard {
    fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Whether any forwarding task is still running
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.tasks.iter().any(|t| !t.is_finished())
    }
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

fn forward<T, F>(
    mut rx: mpsc::UnboundedReceiver<T>,
    sink: mpsc::UnboundedSender<SignalEvent>,
    wrap: F,
) -> JoinHandle<()>
where
    T: Send + 'static,
    F: Fn(T) -> SignalEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if sink.send(wrap(item)).is_err() {
                break;
            }
        }
    })
}

/// Typed signaling operations over a transport
pub struct SignalingHandler<T: SignalingTransport> {
    transport: Arc<T>,
}

impl<T: SignalingTransport> SignalingHandler<T> {
    /// Create new signaling handler
    #[must_use]
    pub fn new(transport: Arc<T>) -> Self {
        Self { transport }
    }

    /// Underlying transport
    #[must_use]
    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    /// Create the `offering` record for a new call
    ///
    /// # Errors
    ///
    /// Returns error if the backend rejects the insert
    #[tracing::instrument(skip(self), fields(caller = %caller, receiver = %receiver))]
    pub async fn create_offering(
        &self,
        caller: &UserId,
        receiver: &UserId,
        kind: MediaKind,
    ) -> Result<CallRecord, SignalingError> {
        let record = self
            .transport
            .create_call(NewCallRecord {
                caller_id: caller.clone(),
                receiver_id: receiver.clone(),
                kind,
            })
            .await
            .map_err(Into::into)?;
        tracing::debug!(call_id = %record.id, "Call record created");
        Ok(record)
    }

    /// Store the caller's offer on the record
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    #[tracing::instrument(skip(self, offer), fields(call_id = %call_id))]
    pub async fn publish_offer(
        &self,
        call_id: &CallId,
        offer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.transport
            .update_call(call_id, CallUpdate::offer(offer))
            .await
            .map_err(Into::into)?;
        tracing::debug!("Offer published");
        Ok(())
    }

    /// Mark the record answered and store the answer
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    #[tracing::instrument(skip(self, answer), fields(call_id = %call_id))]
    pub async fn publish_answer(
        &self,
        call_id: &CallId,
        answer: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.transport
            .update_call(call_id, CallUpdate::answered(answer))
            .await
            .map_err(Into::into)?;
        tracing::debug!("Answer published");
        Ok(())
    }

    /// Mark the record ended
    ///
    /// # Errors
    ///
    /// Returns error if the update fails
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn publish_ended(&self, call_id: &CallId) -> Result<(), SignalingError> {
        self.transport
            .update_call(call_id, CallUpdate::ended())
            .await
            .map_err(Into::into)?;
        tracing::debug!("End published");
        Ok(())
    }

    /// Read the offer stored on a record
    ///
    /// # Errors
    ///
    /// Returns error if the record is missing or carries no offer
    #[tracing::instrument(skip(self), fields(call_id = %call_id))]
    pub async fn fetch_offer(&self, call_id: &CallId) -> Result<SessionDescription, SignalingError> {
        let record = self
            .transport
            .fetch_call(call_id)
            .await
            .map_err(Into::into)?
            .ok_or_else(|| SignalingError::CallNotFound(call_id.to_string()))?;
        match record.offer {
            Some(offer) if offer.sdp_type == SdpType::Offer && !offer.sdp.trim().is_empty() => {
                Ok(offer)
            }
            _ => Err(SignalingError::MissingOffer(call_id.to_string())),
        }
    }

    /// Open the per-user feeds: incoming calls and record updates
    ///
    /// # Errors
    ///
    /// Returns error if either subscription cannot be opened
    #[tracing::instrument(skip(self, sink), fields(user = %user))]
    pub async fn subscribe_user(
        &self,
        user: &UserId,
        sink: mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<SubscriptionGuard, SignalingError> {
        let incoming = self
            .transport
            .subscribe_incoming(user)
            .await
            .map_err(Into::into)?;
        let updates = self
            .transport
            .subscribe_updates(user)
            .await
            .map_err(Into::into)?;

        tracing::info!("Subscribed to call feeds");
        Ok(SubscriptionGuard::new(vec![
            forward(incoming, sink.clone(), SignalEvent::Incoming),
            forward(updates, sink, SignalEvent::Updated),
        ]))
    }

    /// Open the per-call candidate feed, excluding our own rows
    ///
    /// Rows stored before the subscription opened are replayed first so a
    /// candidate published while we were still subscribing is not lost.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription or the backlog read fails
    #[tracing::instrument(skip(self, sink), fields(call_id = %call_id, me = %me))]
    pub async fn subscribe_call(
        &self,
        call_id: &CallId,
        me: &UserId,
        sink: mpsc::UnboundedSender<SignalEvent>,
    ) -> Result<SubscriptionGuard, SignalingError> {
        let mut live = self
            .transport
            .subscribe_candidates(call_id, me)
            .await
            .map_err(Into::into)?;
        let backlog: Vec<IceCandidateRecord> = self
            .transport
            .fetch_candidates(call_id)
            .await
            .map_err(Into::into)?
            .into_iter()
            .filter(|c| &c.sender_id != me)
            .collect();

        tracing::debug!(backlog = backlog.len(), "Subscribed to candidate feed");

        let task = tokio::spawn(async move {
            for record in backlog.iter().cloned() {
                if sink.send(SignalEvent::Candidate(record)).is_err() {
                    return;
                }
            }
            while let Some(record) = live.recv().await {
                if backlog.contains(&record) {
                    continue;
                }
                if sink.send(SignalEvent::Candidate(record)).is_err() {
                    break;
                }
            }
        });
        Ok(SubscriptionGuard::new(vec![task]))
    }
}

#[async_trait]
impl<T: SignalingTransport> CandidateSink for SignalingHandler<T> {
    async fn publish_candidate(
        &self,
        call_id: &CallId,
        sender: &UserId,
        candidate: CandidateInit,
    ) -> Result<(), SignalingError> {
        tracing::trace!(call_id = %call_id, "Publishing local candidate");
        self.transport
            .insert_candidate(IceCandidateRecord {
                call_id: call_id.clone(),
                sender_id: sender.clone(),
                candidate,
            })
            .await
            .map_err(Into::into)
    }
}
