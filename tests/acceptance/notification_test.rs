//! Notification reduction acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - A burst of samples inside one window reduces to its mean
//! - Only fields whose reduced value changed are reported
//! - A window without changes reports nothing
//! - Subscriptions over the wire feed the same reduction end to end

use super::common::TestBed;
use catio_ads::notification::{NotificationSample, NotificationStamp, NotificationStream};
use catio_ads::{FieldSpec, FieldValue, NotificationMonitor, NotificationReducer, TransmissionMode};
use catio_common::ads_types::AdsDataType;
use catio_common::config::Direction;
use catio_common::time::FileTime;
use std::time::Duration;
use tokio::sync::mpsc;

const AI_2: &str = "Device 1 (EtherCAT).EL3104.AI 2";

fn burst(handle: u32, tick: u64, values: &[i16]) -> NotificationStream {
    NotificationStream {
        stamps: values
            .iter()
            .zip(tick..)
            .map(|(value, t)| NotificationStamp {
                timestamp: FileTime(t),
                samples: vec![NotificationSample {
                    handle,
                    data: value.to_le_bytes().to_vec(),
                }],
            })
            .collect(),
    }
}

fn level_reducer() -> NotificationReducer {
    NotificationReducer::new(vec![FieldSpec::scalar("level", 7, 0, AdsDataType::Int)])
}

#[test]
fn test_repeated_bursts_report_each_change_once() {
    let mut reducer = level_reducer();
    let mut emitted = Vec::new();

    for (window, values) in [[10i16, 10], [12, 12], [12, 12]].iter().enumerate() {
        reducer.accumulate(&burst(7, window as u64 * 10, values));
        emitted.push(
            reducer
                .flush()
                .map(|set| set.changes.get("level").cloned()),
        );
    }

    assert_eq!(
        emitted,
        vec![
            Some(Some(FieldValue::Scalar(10.0))),
            Some(Some(FieldValue::Scalar(12.0))),
            None,
        ]
    );
}

#[test]
fn test_burst_reduced_to_mean() {
    let mut reducer = level_reducer();
    reducer.accumulate(&burst(7, 100, &[10, 14, 9, 15]));

    let set = reducer.flush().unwrap();
    assert_eq!(set.changes["level"], FieldValue::Scalar(12.0));
    assert_eq!(set.timestamp, FileTime(103));
}

#[test]
fn test_array_fields_reduced_per_element() {
    let spec = FieldSpec {
        name: "axes".into(),
        handle: 3,
        offset: 0,
        kind: AdsDataType::Int,
        count: 2,
    };
    let mut reducer = NotificationReducer::new(vec![spec]);
    let sample = |a: i16, b: i16| NotificationSample {
        handle: 3,
        data: [a.to_le_bytes(), b.to_le_bytes()].concat(),
    };
    reducer.accumulate(&NotificationStream {
        stamps: vec![NotificationStamp {
            timestamp: FileTime(1),
            samples: vec![sample(1, 3), sample(3, 5)],
        }],
    });

    let set = reducer.flush().unwrap();
    assert_eq!(set.changes["axes"], FieldValue::Array(vec![2.0, 4.0]));
}

#[test]
fn test_foreign_handles_and_empty_windows_ignored() {
    let mut reducer = level_reducer();
    assert!(reducer.flush().is_none());

    assert_eq!(reducer.accumulate(&burst(99, 0, &[1, 2, 3])), 0);
    assert!(reducer.flush().is_none());
    assert!(reducer.snapshot().is_none());
}

#[test]
fn test_reset_reports_everything_again() {
    let mut reducer = level_reducer();
    reducer.accumulate(&burst(7, 0, &[5]));
    assert!(reducer.flush().is_some());
    reducer.accumulate(&burst(7, 1, &[5]));
    assert!(reducer.flush().is_none());

    reducer.reset();
    reducer.accumulate(&burst(7, 2, &[5]));
    let set = reducer.flush().unwrap();
    assert_eq!(set.changes["level"], FieldValue::Scalar(5.0));
}

#[tokio::test]
async fn test_changes_over_the_wire() {
    let bed = TestBed::default_topology().await;
    bed.client.upload_symbols().await.unwrap();
    let streams = bed.client.take_notifications().unwrap();
    let offset = bed.client.symbol_entry(AI_2).unwrap().index_offset as usize;

    let (_, spec) = bed
        .client
        .subscribe_symbol(
            AI_2,
            TransmissionMode::ServerCycle,
            Duration::from_millis(10),
            Duration::from_millis(5),
        )
        .await
        .unwrap();

    let (tx, mut changes) = mpsc::channel(64);
    let monitor = NotificationMonitor::spawn(
        streams,
        NotificationReducer::new(vec![spec]),
        Duration::from_millis(50),
        tx,
    );

    let mut seen = Vec::new();
    for target in [10i16, 12] {
        bed.set_process_data(Direction::Input, offset, &target.to_le_bytes());
        loop {
            let set = tokio::time::timeout(Duration::from_secs(2), changes.recv())
                .await
                .expect("change set within 2s")
                .expect("monitor running");
            let value = set.changes[AI_2].clone();
            seen.push(value.clone());
            if value == FieldValue::Scalar(f64::from(target)) {
                break;
            }
        }
    }
    assert_eq!(seen.last(), Some(&FieldValue::Scalar(12.0)));
    assert_eq!(bed.process_data(Direction::Input, offset, 2), 12i16.to_le_bytes());

    // Cyclic samples keep arriving, but nothing changed.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(changes.try_recv().is_err());

    bed.stop().await;
    let reducer = monitor.await.unwrap();
    assert_eq!(
        reducer.snapshot().and_then(|s| s.get(AI_2)),
        Some(&FieldValue::Scalar(12.0))
    );
}
