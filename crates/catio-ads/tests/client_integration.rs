//! Client integration tests using `MockAdsServer`.
//!
//! These tests run `AdsClient` over a real TCP connection against a mock
//! server with controllable fault injection.
//!
//! # Test Categories
//!
//! - **Happy path tests**: Requests, responses and invoke id sequencing
//! - **Error tests**: Header error codes surface as protocol errors
//! - **Fault tests**: Unmatched responses, framing errors, dropped sockets
//! - **Handle cache tests**: Symbol handles are resolved once per session


use catio_ads::command::{Payload, ReadRequest};
use catio_ads::index;
use catio_ads::{AdsClient, AdsState, ClientOptions, CommandId};
use catio_common::error::{AdsError, AdsErrorCode};
use catio_common::net_id::AmsAddr;
use catio_common::state::ConnectionState;
use mock_ads_server::{MockAdsServer, MockBehavior};
use std::time::Duration;

// ============================================================================
// Test Helpers
// ============================================================================

fn options_for(server: &MockAdsServer) -> ClientOptions {
    ClientOptions {
        address: server.local_addr().to_string(),
        connect_timeout: Duration::from_secs(2),
        request_timeout: Duration::from_millis(300),
        ..ClientOptions::default()
    }
}

async fn connected(server: &MockAdsServer) -> AdsClient {
    AdsClient::connect(options_for(server))
        .await
        .expect("client should connect to mock server")
}

fn target(client: &AdsClient) -> AmsAddr {
    client.target()
}

async fn wait_for_state(client: &AdsClient, state: ConnectionState) {
    for _ in 0..50 {
        if client.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("client stayed {} instead of {state}", client.state());
}

fn read_offsets(server: &MockAdsServer) -> Vec<u32> {
    server
        .requests()
        .iter()
        .filter(|f| f.header.command() == Some(CommandId::Read))
        .map(|f| ReadRequest::decode(&f.payload).unwrap().index_offset)
        .collect()
}

// ============================================================================
// Happy Path Tests
// ============================================================================

#[tokio::test]
async fn test_read_returns_payload() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let client = connected(&server).await;

    let data = client
        .read(target(&client), index::IO_RW_I, 3, 4)
        .await
        .unwrap();
    assert_eq!(data, vec![3, 4, 5, 6]);
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_read_state() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let client = connected(&server).await;

    let (state, device_state) = client.read_state(target(&client)).await.unwrap();
    assert_eq!(state, AdsState::Run);
    assert_eq!(device_state, 0);
}

#[tokio::test]
async fn test_invoke_ids_strictly_increase() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let client = connected(&server).await;

    for offset in 0..5 {
        client
            .read(target(&client), index::IO_RW_I, offset, 1)
            .await
            .unwrap();
    }

    let ids: Vec<u32> = server.requests().iter().map(|f| f.header.invoke_id).collect();
    assert_eq!(ids.len(), 5);
    assert!(ids.windows(2).all(|w| w[1] > w[0]), "ids: {ids:?}");
    assert!(ids.iter().all(|&id| id != 0));
}

#[tokio::test]
async fn test_request_headers_carry_endpoints() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let client = connected(&server).await;
    client.read_state(target(&client)).await.unwrap();

    let frame = &server.requests()[0];
    assert_eq!(frame.header.target, client.options().target);
    assert_eq!(frame.header.source, client.options().source);
    assert!(!frame.header.is_response());
}

// ============================================================================
// Error Tests
// ============================================================================

#[tokio::test]
async fn test_header_error_is_protocol_error() {
    let server = MockAdsServer::start(MockBehavior::ErrorCode(0x702))
        .await
        .unwrap();
    let client = connected(&server).await;

    let err = client
        .read(target(&client), 0x1234, 0, 4)
        .await
        .unwrap_err();
    assert_eq!(err, AdsError::Protocol(AdsErrorCode::InvalidGroup));

    // The connection survives an error response.
    server.set_behavior(MockBehavior::Normal);
    assert_eq!(
        client.read(target(&client), index::IO_RW_I, 0, 2).await.unwrap(),
        vec![0, 1]
    );
}

// ============================================================================
// Fault Tests
// ============================================================================

#[tokio::test]
async fn test_unmatched_response_is_never_delivered() {
    let server = MockAdsServer::start(MockBehavior::WrongInvokeId)
        .await
        .unwrap();
    let client = connected(&server).await;

    let err = client
        .read(target(&client), index::IO_RW_I, 0, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, AdsError::Timeout(_)), "got {err:?}");
    assert_eq!(client.state(), ConnectionState::Open);
}

#[tokio::test]
async fn test_stray_response_skipped() {
    let server = MockAdsServer::start(MockBehavior::StrayThenCorrect)
        .await
        .unwrap();
    let client = connected(&server).await;

    let data = client
        .read(target(&client), index::IO_RW_I, 7, 2)
        .await
        .unwrap();
    assert_eq!(data, vec![7, 8]);
}

#[tokio::test]
async fn test_late_response_not_delivered_to_next_request() {
    let server = MockAdsServer::start(MockBehavior::DelayMs(400))
        .await
        .unwrap();
    let client = connected(&server).await;

    let err = client
        .read(target(&client), index::IO_RW_I, 1, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, AdsError::Timeout(_)));

    // The late answer to offset 1 arrives while offset 9 is pending.
    server.set_behavior(MockBehavior::Normal);
    let data = client
        .read(target(&client), index::IO_RW_I, 9, 1)
        .await
        .unwrap();
    assert_eq!(data, vec![9]);
    assert_eq!(read_offsets(&server), vec![1, 9]);
}

#[tokio::test]
async fn test_framing_error_closes_connection() {
    let server = MockAdsServer::start(MockBehavior::CorruptEnvelope)
        .await
        .unwrap();
    let client = connected(&server).await;

    let err = client
        .read(target(&client), index::IO_RW_I, 0, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, AdsError::Transport(_)), "got {err:?}");

    wait_for_state(&client, ConnectionState::Disconnected).await;
    let err = client
        .read(target(&client), index::IO_RW_I, 0, 4)
        .await
        .unwrap_err();
    assert!(matches!(err, AdsError::NotReady(_)));
}

#[tokio::test]
async fn test_dropped_connection_fails_pending_request() {
    let server = MockAdsServer::start(MockBehavior::DropConnection)
        .await
        .unwrap();
    let client = connected(&server).await;

    let err = client.read_state(target(&client)).await.unwrap_err();
    assert!(matches!(err, AdsError::Transport(_)), "got {err:?}");
    wait_for_state(&client, ConnectionState::Disconnected).await;
}

#[tokio::test]
async fn test_reopen_keeps_invoke_ids_increasing() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let client = connected(&server).await;
    client.read_state(target(&client)).await.unwrap();

    server.set_behavior(MockBehavior::DropConnection);
    assert!(client.read_state(target(&client)).await.is_err());
    wait_for_state(&client, ConnectionState::Disconnected).await;

    server.set_behavior(MockBehavior::Normal);
    client.reopen().await.unwrap();
    client.read_state(target(&client)).await.unwrap();

    let ids: Vec<u32> = server.requests().iter().map(|f| f.header.invoke_id).collect();
    assert_eq!(ids.len(), 3);
    assert!(ids.windows(2).all(|w| w[1] > w[0]), "ids: {ids:?}");
}

#[tokio::test]
async fn test_connect_refused() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let options = options_for(&server);
    drop(server);
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = AdsClient::connect(options).await.unwrap_err();
    assert!(matches!(err, AdsError::Transport(_)), "got {err:?}");
}

// ============================================================================
// Handle Cache Tests
// ============================================================================

#[tokio::test]
async fn test_handle_resolved_once() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let client = connected(&server).await;

    let first = client.get_handle("MAIN.counter").await.unwrap();
    let second = client.get_handle("MAIN.counter").await.unwrap();
    assert_eq!(first, second);
    assert_eq!(server.count(CommandId::ReadWrite), 1);

    let name_request = &server.requests()[0];
    assert!(name_request.payload.ends_with(b"MAIN.counter"));

    client.release_handle("MAIN.counter").await.unwrap();
    assert_eq!(server.count(CommandId::Write), 1);

    let third = client.get_handle("MAIN.counter").await.unwrap();
    assert_ne!(third, first);
    assert_eq!(server.count(CommandId::ReadWrite), 2);
}

#[tokio::test]
async fn test_close_releases_handles() {
    let server = MockAdsServer::start(MockBehavior::Normal).await.unwrap();
    let client = connected(&server).await;
    client.get_handle("A").await.unwrap();
    client.get_handle("B").await.unwrap();

    client.close().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(server.count(CommandId::Write), 2);

    // A second close does nothing.
    client.close().await.unwrap();
    assert_eq!(server.requests().len(), 4);
}
