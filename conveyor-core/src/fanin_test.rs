use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::fan_in;
use crate::item::{Envelope, channel};

#[tokio::test]
async fn test_merges_all_sources() {
    let cancel = CancellationToken::new();
    let mut sources = Vec::new();
    for s in 0..3u64 {
        let (tx, rx) = channel(4);
        for i in 0..4u64 {
            tx.try_send(Envelope::new(s * 10 + i, s * 10 + i)).unwrap();
        }
        sources.push(rx);
    }

    let mut merged = fan_in(sources, 2, cancel);
    let mut ids = Vec::new();
    while let Some(envelope) = merged.recv().await {
        ids.push(envelope.id());
    }
    ids.sort_unstable();
    assert_eq!(ids, vec![0, 1, 2, 3, 10, 11, 12, 13, 20, 21, 22, 23]);
    assert_eq!(merged.remaining_sources(), 0);
}

#[tokio::test]
async fn test_closes_only_after_last_source() {
    let cancel = CancellationToken::new();
    let (tx_a, rx_a) = channel::<u32>(1);
    let (tx_b, rx_b) = channel::<u32>(1);
    let (tx_c, rx_c) = channel::<u32>(1);
    let mut merged = fan_in(vec![rx_a, rx_b, rx_c], 1, cancel);

    drop(tx_a);
    drop(tx_b);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(merged.remaining_sources(), 1);
    let pending = tokio::time::timeout(Duration::from_millis(50), merged.recv()).await;
    assert!(pending.is_err(), "merged output closed while a source was open");

    tx_c.send(Envelope::new(0, 5)).await.unwrap();
    drop(tx_c);
    let last = merged.recv().await.unwrap();
    assert_eq!(last.id(), 0);
    assert!(merged.recv().await.is_none());
    assert_eq!(merged.remaining_sources(), 0);
}

#[tokio::test]
async fn test_no_sources_closes_immediately() {
    let cancel = CancellationToken::new();
    let mut merged = fan_in::<u32>(Vec::new(), 1, cancel);
    assert!(merged.recv().await.is_none());
    assert_eq!(merged.remaining_sources(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_forwarding_buffered_items() {
    let cancel = CancellationToken::new();
    let (tx, rx) = channel::<u32>(16);
    for i in 0..16 {
        tx.try_send(Envelope::new(i, i as u32)).unwrap();
    }

    // merged capacity 1 and nobody reading yet: the forwarder parks on send
    let merged = fan_in(vec![rx], 1, cancel.clone());
    tokio::time::sleep(Duration::from_millis(20)).await;
    cancel.cancel();

    let (mut output, handles) = merged.into_parts();
    for handle in handles {
        tokio::time::timeout(Duration::from_millis(100), handle)
            .await
            .expect("forwarder must stop within 100ms of cancel")
            .unwrap();
    }

    let mut received = 0;
    while output.recv().await.is_some() {
        received += 1;
    }
    assert!(received <= 1, "forwarded {} items after cancel", received);
    drop(tx);
}
