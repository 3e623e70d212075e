//! Symbol access acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Uploaded symbols cover every configured channel with packed offsets
//! - Values written by handle land in the server's process image
//! - Released handles are rejected by the server
//! - Handles do not survive a reconnect

use super::common::{load_toml, TestBed, TWO_MASTER_TOML};
use catio_ads::index;
use catio_common::config::Direction;
use catio_common::error::{AdsError, AdsErrorCode};

const OUTPUT_2: &str = "Device 1 (EtherCAT).EL2008.Output 2";
const AI_2: &str = "Device 1 (EtherCAT).EL3602.AI 2";
const TEMPERATURE: &str = "Device 2 (EtherCAT).EL3202.Temperature";

#[tokio::test]
async fn test_upload_covers_all_devices() {
    let bed = TestBed::start(load_toml(TWO_MASTER_TOML)).await;

    assert_eq!(bed.client.upload_symbols().await.unwrap(), 5);

    let output = bed.client.symbol_entry(OUTPUT_2).unwrap();
    assert_eq!(output.index_group, index::IO_RW_Q);
    assert_eq!(output.index_offset, 1);
    assert_eq!(output.type_name, "BOOL");

    let ai = bed.client.symbol_entry(AI_2).unwrap();
    assert_eq!(ai.index_group, index::IO_RW_I);
    assert_eq!(ai.index_offset, 4);

    // Input offsets continue across devices.
    let temperature = bed.client.symbol_entry(TEMPERATURE).unwrap();
    assert_eq!(temperature.index_offset, 8);
    assert_eq!(temperature.size, 4);

    bed.stop().await;
}

#[tokio::test]
async fn test_write_and_read_by_handle() {
    let bed = TestBed::start(load_toml(TWO_MASTER_TOML)).await;
    bed.client.upload_symbols().await.unwrap();

    bed.client.write_symbol(OUTPUT_2, &[1]).await.unwrap();
    assert_eq!(bed.process_data(Direction::Output, 0, 2), vec![0, 1]);
    assert_eq!(bed.client.read_symbol(OUTPUT_2).await.unwrap(), vec![1]);

    bed.set_process_data(Direction::Input, 8, &21.5f32.to_le_bytes());
    let raw = bed.client.read_symbol(TEMPERATURE).await.unwrap();
    assert_eq!(f32::from_le_bytes(raw.try_into().unwrap()), 21.5);

    let err = bed.client.write_symbol(OUTPUT_2, &[1, 0]).await.unwrap_err();
    assert_eq!(err, AdsError::Protocol(AdsErrorCode::InvalidSize));

    bed.stop().await;
}

#[tokio::test]
async fn test_released_handle_rejected() {
    let bed = TestBed::start(load_toml(TWO_MASTER_TOML)).await;
    let target = bed.client.target();

    let handle = bed.client.get_handle(AI_2).await.unwrap();
    bed.client
        .read(target, index::SYM_VALBYHND, handle, 4)
        .await
        .unwrap();

    bed.client.release_handle(AI_2).await.unwrap();
    let err = bed
        .client
        .read(target, index::SYM_VALBYHND, handle, 4)
        .await
        .unwrap_err();
    assert_eq!(err, AdsError::Protocol(AdsErrorCode::NotFound));

    bed.stop().await;
}

#[tokio::test]
async fn test_unknown_symbol_and_read_only_groups() {
    let bed = TestBed::start(load_toml(TWO_MASTER_TOML)).await;
    let target = bed.client.target();

    let err = bed.client.get_handle("MAIN.nothing").await.unwrap_err();
    assert_eq!(err, AdsError::Protocol(AdsErrorCode::SymbolNotFound));

    let err = bed
        .client
        .write(target, index::SYM_UPLOADINFO, 0, &[0; 8])
        .await
        .unwrap_err();
    assert_eq!(err, AdsError::Protocol(AdsErrorCode::InvalidAccess));

    bed.stop().await;
}

#[tokio::test]
async fn test_handles_dropped_on_reconnect() {
    let bed = TestBed::default_topology().await;
    bed.client.upload_symbols().await.unwrap();
    let name = "Device 1 (EtherCAT).EL3104.AI 3";

    bed.set_process_data(Direction::Input, 8, &300i16.to_le_bytes());
    assert_eq!(bed.client.read_symbol(name).await.unwrap(), 300i16.to_le_bytes());

    let stale = bed.client.get_handle(name).await.unwrap();
    bed.client.close().await.unwrap();
    bed.client.reopen().await.unwrap();

    // The old handle belonged to the previous connection.
    let target = bed.client.target();
    let err = bed
        .client
        .read(target, index::SYM_VALBYHND, stale, 2)
        .await
        .unwrap_err();
    assert_eq!(err, AdsError::Protocol(AdsErrorCode::NotFound));

    // Symbol reads resolve a fresh handle on the new connection.
    assert_eq!(bed.client.read_symbol(name).await.unwrap(), 300i16.to_le_bytes());

    bed.stop().await;
}
