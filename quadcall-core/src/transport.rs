//! Transport layer implementations
//!
//! [`MemoryTransport`] is an in-process stand-in for the hosted backend: the
//! `calls` and `call_candidates` tables plus their realtime feeds. It enforces
//! the same record rules and subscription filters, so two clients sharing one
//! instance behave like two devices talking through the real service.

use crate::identity::UserId;
use crate::signaling::{SignalingError, SignalingTransport};
use crate::types::{CallId, CallRecord, CallUpdate, IceCandidateRecord, NewCallRecord};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Maximum SDP string length accepted on a record
const MAX_SDP_LENGTH: usize = 32 * 1024;

/// Maximum candidate line length
const MAX_CANDIDATE_LENGTH: usize = 1024;

/// Backend operation, used to target fault injection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_call`
    CreateCall,
    /// `update_call`
    UpdateCall,
    /// `fetch_call` and `fetch_candidates`
    Fetch,
    /// `insert_candidate`
    InsertCandidate,
    /// Any of the `subscribe_*` calls
    Subscribe,
}

#[derive(Default)]
struct Store {
    calls: HashMap<CallId, CallRecord>,
    candidates: Vec<IceCandidateRecord>,
    incoming: Vec<(UserId, mpsc::UnboundedSender<CallRecord>)>,
    updates: Vec<(UserId, mpsc::UnboundedSender<CallRecord>)>,
    candidate_feeds: Vec<(CallId, UserId, mpsc::UnboundedSender<IceCandidateRecord>)>,
    faults: HashMap<Operation, usize>,
}

impl Store {
    fn take_fault(&mut self, op: Operation) -> Result<(), SignalingError> {
        match self.faults.get_mut(&op) {
            Some(n) if *n > 0 => {
                *n -= 1;
                Err(SignalingError::TransportError(format!(
                    "injected failure on {:?}",
                    op
                )))
            }
            _ => Ok(()),
        }
    }
}

/// In-memory signaling backend
#[derive(Clone, Default)]
pub struct MemoryTransport {
    store: Arc<Mutex<Store>>,
    latency: Arc<Mutex<Duration>>,
}

impl MemoryTransport {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`
    #[must_use]
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    /// Change the delay applied to operations from now on
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = latency;
    }

    /// Make the next call of `op` fail with a transport error
    pub fn fail_next(&self, op: Operation) {
        self.fail_times(op, 1);
    }

    /// Make the next `times` calls of `op` fail
    pub fn fail_times(&self, op: Operation, times: usize) {
        *self.store.lock().faults.entry(op).or_insert(0) += times;
    }

    /// Snapshot of a stored record
    #[must_use]
    pub fn call(&self, call_id: &CallId) -> Option<CallRecord> {
        self.store.lock().calls.get(call_id).cloned()
    }

    /// All stored records
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.store.lock().calls.values().cloned().collect()
    }

    /// Candidate rows stored for a call, in insertion order
    #[must_use]
    pub fn candidates(&self, call_id: &CallId) -> Vec<IceCandidateRecord> {
        self.store
            .lock()
            .candidates
            .iter()
            .filter(|c| &c.call_id == call_id)
            .cloned()
            .collect()
    }

    /// Number of open realtime subscriptions
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        let mut store = self.store.lock();
        store.incoming.retain(|(_, tx)| !tx.is_closed());
        store.updates.retain(|(_, tx)| !tx.is_closed());
        store.candidate_feeds.retain(|(_, _, tx)| !tx.is_closed());
        store.incoming.len() + store.updates.len() + store.candidate_feeds.len()
    }

    async fn delay(&self) {
        let latency = *self.latency.lock();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
    }
}

fn validate_update(update: &CallUpdate) -> Result<(), SignalingError> {
    for desc in update.offer.iter().chain(update.answer.iter()) {
        if desc.sdp.len() > MAX_SDP_LENGTH {
            return Err(SignalingError::TransportError(format!(
                "SDP length {} exceeds maximum of {}",
                desc.sdp.len(),
                MAX_SDP_LENGTH
            )));
        }
    }
    Ok(())
}

#[async_trait]
impl SignalingTransport for MemoryTransport {
    type Error = SignalingError;

    async fn create_call(&self, record: NewCallRecord) -> Result<CallRecord, SignalingError> {
        self.delay().await;
        let mut store = self.store.lock();
        store.take_fault(Operation::CreateCall)?;

        let id = CallId::new(uuid::Uuid::new_v4().to_string());
        let record = CallRecord::offering(id.clone(), record);
        store.calls.insert(id, record.clone());

        let receiver = record.receiver_id.clone();
        store
            .incoming
            .retain(|(user, tx)| user != &receiver || tx.send(record.clone()).is_ok());
        tracing::trace!(call_id = %record.id, "Record inserted");
        Ok(record)
    }

    async fn update_call(
        &self,
        call_id: &CallId,
        update: CallUpdate,
    ) -> Result<CallRecord, SignalingError> {
        self.delay().await;
        validate_update(&update)?;
        let mut store = self.store.lock();
        store.take_fault(Operation::UpdateCall)?;

        let record = store
            .calls
            .get_mut(call_id)
            .ok_or_else(|| SignalingError::CallNotFound(call_id.to_string()))?;
        record.apply(update)?;
        let record = record.clone();

        store
            .updates
            .retain(|(user, tx)| !record.involves(user) || tx.send(record.clone()).is_ok());
        tracing::trace!(call_id = %call_id, status = ?record.status, "Record updated");
        Ok(record)
    }

    async fn fetch_call(&self, call_id: &CallId) -> Result<Option<CallRecord>, SignalingError> {
        self.delay().await;
        let mut store = self.store.lock();
        store.take_fault(Operation::Fetch)?;
        Ok(store.calls.get(call_id).cloned())
    }

    async fn insert_candidate(&self, record: IceCandidateRecord) -> Result<(), SignalingError> {
        self.delay().await;
        if record.candidate.candidate.len() > MAX_CANDIDATE_LENGTH {
            return Err(SignalingError::TransportError(format!(
                "Candidate length {} exceeds maximum of {}",
                record.candidate.candidate.len(),
                MAX_CANDIDATE_LENGTH
            )));
        }
        let mut store = self.store.lock();
        store.take_fault(Operation::InsertCandidate)?;
        if !store.calls.contains_key(&record.call_id) {
            return Err(SignalingError::CallNotFound(record.call_id.to_string()));
        }

        store.candidates.push(record.clone());
        store.candidate_feeds.retain(|(call_id, exclude, tx)| {
            call_id != &record.call_id
                || exclude == &record.sender_id
                || tx.send(record.clone()).is_ok()
        });
        Ok(())
    }

    async fn fetch_candidates(
        &self,
        call_id: &CallId,
    ) -> Result<Vec<IceCandidateRecord>, SignalingError> {
        self.delay().await;
        self.store.lock().take_fault(Operation::Fetch)?;
        Ok(self.candidates(call_id))
    }

    async fn subscribe_incoming(
        &self,
        user: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<CallRecord>, SignalingError> {
        let mut store = self.store.lock();
        store.take_fault(Operation::Subscribe)?;
        let (tx, rx) = mpsc::unbounded_channel();
        store.incoming.push((user.clone(), tx));
        Ok(rx)
    }

    async fn subscribe_updates(
        &self,
        user: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<CallRecord>, SignalingError> {
        let mut store = self.store.lock();
        store.take_fault(Operation::Subscribe)?;
        let (tx, rx) = mpsc::unbounded_channel();
        store.updates.push((user.clone(), tx));
        Ok(rx)
    }

    async fn subscribe_candidates(
        &self,
        call_id: &CallId,
        exclude_sender: &UserId,
    ) -> Result<mpsc::UnboundedReceiver<IceCandidateRecord>, SignalingError> {
        let mut store = self.store.lock();
        store.take_fault(Operation::Subscribe)?;
        let (tx, rx) = mpsc::unbounded_channel();
        store
            .candidate_feeds
            .push((call_id.clone(), exclude_sender.clone(), tx));
        Ok(rx)
    }
}
