//! Event channel integration tests
//!
//! Exercises the delivery-context side of the channel the way host
//! backends use it: many producer threads, one draining consumer.
//!
//! Run with: `cargo test -p common --test event_channel_tests`

use common::test_utils::{DEFAULT_TEST_TIMEOUT, create_mock_device, with_timeout};
use common::{HostEvent, create_event_channel};
use std::thread;

#[test]
fn test_concurrent_producers_deliver_everything() {
    let (tx, rx) = create_event_channel();

    let handles: Vec<_> = (1..=4u8)
        .map(|i| {
            let tx = tx.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    tx.attached(create_mock_device(i, 0x1000, 0x2000)).unwrap();
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().expect("producer panicked");
    }

    let mut count = 0;
    while rx.try_recv().is_some() {
        count += 1;
    }
    assert_eq!(count, 100);
}

#[test]
fn test_per_producer_order_is_preserved() {
    let (tx, rx) = create_event_channel();
    let device = create_mock_device(3, 0x1234, 0x5678);

    let producer = {
        let device = device.clone();
        thread::spawn(move || {
            tx.permission_result(device.clone(), false).unwrap();
            tx.permission_result(device.clone(), true).unwrap();
            tx.detached(device).unwrap();
        })
    };
    producer.join().unwrap();

    assert_eq!(
        rx.try_recv(),
        Some(HostEvent::PermissionResult {
            device: device.clone(),
            granted: false
        })
    );
    assert_eq!(
        rx.try_recv(),
        Some(HostEvent::PermissionResult {
            device: device.clone(),
            granted: true
        })
    );
    assert_eq!(rx.try_recv(), Some(HostEvent::Detached(device)));
}

#[tokio::test]
async fn test_async_receiver_wakes_on_send() {
    let (tx, rx) = create_event_channel();

    let waiter = tokio::spawn(async move { rx.recv().await });
    tx.attached(create_mock_device(9, 0xabcd, 0x0001)).unwrap();

    let event = with_timeout(DEFAULT_TEST_TIMEOUT, waiter)
        .await
        .expect("timed out")
        .expect("task panicked")
        .expect("channel closed");
    assert!(matches!(event, HostEvent::Attached(d) if d.vendor_id == 0xabcd));
}
