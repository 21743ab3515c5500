use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio_util::sync::CancellationToken;

use crate::error::{ItemError, PipeError};

pub type EnvelopeSender<T> = tokio::sync::mpsc::Sender<Envelope<T>>;
pub type EnvelopeReceiver<T> = tokio::sync::mpsc::Receiver<Envelope<T>>;

/// Bounded hop between two stages. Closed by dropping every sender.
pub fn channel<T>(capacity: usize) -> (EnvelopeSender<T>, EnvelopeReceiver<T>) {
    tokio::sync::mpsc::channel(capacity)
}

/// Counter of items admitted but not yet turned into a result.
#[derive(Clone, Debug, Default)]
pub struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    fn admit(&self) -> InFlightGuard {
        self.0.fetch_add(1, Ordering::AcqRel);
        InFlightGuard(Arc::clone(&self.0))
    }
}

/// Held by the envelope for as long as its item is in flight. Dropping it,
/// either on result emission or when a cancelled task drops the envelope,
/// decrements the counter exactly once.
#[derive(Debug)]
pub struct InFlightGuard(Arc<AtomicUsize>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// An item travelling between stages, tagged with its arrival position.
#[derive(Debug)]
pub struct Envelope<T> {
    id: u64,
    payload: Result<T, ItemError>,
    guard: Option<InFlightGuard>,
}

impl<T> Envelope<T> {
    /// Untracked envelope, for driving stages outside a pipeline.
    pub fn new(id: u64, value: T) -> Self {
        Self {
            id,
            payload: Ok(value),
            guard: None,
        }
    }

    pub(crate) fn tracked(id: u64, value: T, in_flight: &InFlight) -> Self {
        Self {
            id,
            payload: Ok(value),
            guard: Some(in_flight.admit()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn payload(&self) -> &Result<T, ItemError> {
        &self.payload
    }

    pub fn is_ok(&self) -> bool {
        self.payload.is_ok()
    }

    pub(crate) fn into_parts(self) -> (u64, Result<T, ItemError>, Option<InFlightGuard>) {
        (self.id, self.payload, self.guard)
    }

    pub(crate) fn from_parts(
        id: u64,
        payload: Result<T, ItemError>,
        guard: Option<InFlightGuard>,
    ) -> Self {
        Self { id, payload, guard }
    }

    /// Final form handed to the caller. Releases the in-flight slot.
    pub fn into_result(self) -> ItemResult<T> {
        let (item_id, payload, _guard) = self.into_parts();
        match payload {
            Ok(value) => ItemResult {
                item_id,
                value: Some(value),
                error: None,
            },
            Err(error) => ItemResult {
                item_id,
                value: None,
                error: Some(error),
            },
        }
    }
}

/// One result per consumed item.
#[derive(Debug)]
pub struct ItemResult<T> {
    pub item_id: u64,
    pub value: Option<T>,
    pub error: Option<ItemError>,
}

impl<T> ItemResult<T> {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

/// Receive from `rx` unless `cancel` fires first.
///
/// `Ok(None)` means the producer side closed.
pub async fn recv_cancellable<M>(
    rx: &mut tokio::sync::mpsc::Receiver<M>,
    cancel: &CancellationToken,
) -> Result<Option<M>, PipeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipeError::Cancelled),
        next = rx.recv() => Ok(next),
    }
}

/// Send into `tx`, waiting for capacity unless `cancel` fires first.
///
/// On cancellation the message is dropped.
pub async fn send_cancellable<M>(
    tx: &tokio::sync::mpsc::Sender<M>,
    message: M,
    cancel: &CancellationToken,
) -> Result<(), PipeError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(PipeError::Cancelled),
        sent = tx.send(message) => sent.map_err(|_| PipeError::Closed),
    }
}

#[cfg(test)]
#[path = "item_test.rs"]
mod item_test;
