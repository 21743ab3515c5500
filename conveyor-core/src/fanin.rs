use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::item::{EnvelopeReceiver, EnvelopeSender, channel, recv_cancellable, send_cancellable};

/// Merged view over the outputs of one fan-out.
pub struct FanIn<T> {
    output: EnvelopeReceiver<T>,
    remaining: Arc<AtomicUsize>,
    handles: Vec<JoinHandle<()>>,
}

impl<T> FanIn<T> {
    /// Sources that have not closed yet.
    pub fn remaining_sources(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub async fn recv(&mut self) -> Option<crate::item::Envelope<T>> {
        self.output.recv().await
    }

    pub fn into_parts(self) -> (EnvelopeReceiver<T>, Vec<JoinHandle<()>>) {
        (self.output, self.handles)
    }
}

/// Forward every envelope of every source into one channel, in whatever
/// order they become available.
///
/// The merged channel closes only after all sources have closed. On
/// cancellation forwarding stops at once, leaving buffered items behind.
pub fn fan_in<T: Send + 'static>(
    sources: Vec<EnvelopeReceiver<T>>,
    capacity: usize,
    cancel: CancellationToken,
) -> FanIn<T> {
    let (tx, output) = channel(capacity);
    let remaining = Arc::new(AtomicUsize::new(sources.len()));

    let handles = sources
        .into_iter()
        .enumerate()
        .map(|(index, source)| {
            let tx = tx.clone();
            let remaining = Arc::clone(&remaining);
            let cancel = cancel.clone();
            tokio::spawn(async move { forward(index, source, tx, remaining, cancel).await })
        })
        .collect();

    // only the forwarders hold senders from here on
    drop(tx);
    FanIn {
        output,
        remaining,
        handles,
    }
}

async fn forward<T>(
    index: usize,
    mut source: EnvelopeReceiver<T>,
    tx: EnvelopeSender<T>,
    remaining: Arc<AtomicUsize>,
    cancel: CancellationToken,
) {
    let mut forwarded = 0u64;
    while let Ok(Some(envelope)) = recv_cancellable(&mut source, &cancel).await {
        if send_cancellable(&tx, envelope, &cancel).await.is_err() {
            break;
        }
        forwarded += 1;
    }

    let left = remaining.fetch_sub(1, Ordering::AcqRel) - 1;
    log::trace!(
        "fan-in source {} closed after {} items, {} left",
        index,
        forwarded,
        left
    );
    if left == 0 {
        log::debug!("fan-in: all sources closed");
    }
    // releasing the last sender closes the merged output
    drop(tx);
}

#[cfg(test)]
#[path = "fanin_test.rs"]
mod fanin_test;
