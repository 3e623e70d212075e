//! Device discovery acceptance tests.
//!
//! # Acceptance Criteria
//!
//! - Every master device reported by the server is discovered
//! - Slave addresses start at 1001 on each device, in bus order
//! - Slave names and identities come back from their CoE objects
//! - Diagnostics polling sees counters change on the server

use super::common::{load_toml, TestBed, TWO_MASTER_TOML};
use catio_ads::{discover, poll, EcatState};
use catio_common::net_id::NetId;
use std::time::Duration;

#[tokio::test]
async fn test_two_masters_discovered() {
    let bed = TestBed::start(load_toml(TWO_MASTER_TOML)).await;

    let tree = discover(&bed.client).await.unwrap();
    assert_eq!(tree.device_ids(), vec![1, 2]);
    assert_eq!(tree.slave_count(), 5);

    let first = tree.device(1).unwrap();
    assert_eq!(first.name, "Device 1 (EtherCAT)");
    assert_eq!(first.net_id, NetId::new(192, 168, 10, 5, 2, 1));
    let names: Vec<&str> = first.slaves.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["EK1100", "EL2008", "EL3602"]);
    assert_eq!(first.slave(1003).unwrap().identity.product_code, 0x0E12_3052);

    let second = tree.device(2).unwrap();
    let addresses: Vec<u16> = second.slaves.iter().map(|s| s.address).collect();
    assert_eq!(addresses, vec![1001, 1002]);
    assert_eq!(second.slave(1002).unwrap().name, "EL3202");

    for device in &tree.devices {
        assert_eq!(device.identity.vendor_id, 2);
        assert_eq!(device.identity.serial, u32::from(device.id));
        assert!(device
            .slaves
            .iter()
            .all(|s| s.ecat_state() == Some(EcatState::Op)));
    }

    bed.stop().await;
}

#[tokio::test]
async fn test_slave_fault_visible_after_poll() {
    let bed = TestBed::start(load_toml(TWO_MASTER_TOML)).await;
    let mut tree = discover(&bed.client).await.unwrap();
    assert!(tree.devices.iter().flat_map(|d| &d.slaves).all(|s| !s.has_error()));

    {
        let state = bed.server.state();
        let mut guard = state.write().unwrap();
        let device = guard.topology.tree.device_mut(2).unwrap();
        let slave = device.slave_mut(1002).unwrap();
        slave.state = EcatState::SafeOp as u8 | catio_ads::device::AL_STATUS_ERROR;
        slave.crc.ports[1] = 3;
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    poll(&bed.client, &mut tree).await.unwrap();
    let slave = tree.device(2).unwrap().slave(1002).unwrap();
    assert!(slave.has_error());
    assert_eq!(slave.ecat_state(), Some(EcatState::SafeOp));
    assert_eq!(slave.crc.total(), 3);

    // The other master is untouched.
    assert!(tree.device(1).unwrap().slaves.iter().all(|s| !s.has_error()));
    assert!(tree.device(1).unwrap().frame_counters.cyclic_sent > 0);

    bed.stop().await;
}

#[tokio::test]
async fn test_rediscovery_after_reconnect() {
    let bed = TestBed::default_topology().await;
    let before = discover(&bed.client).await.unwrap();

    bed.client.close().await.unwrap();
    bed.client.reopen().await.unwrap();

    let after = discover(&bed.client).await.unwrap();
    assert_eq!(before.device_ids(), after.device_ids());
    assert_eq!(before.devices[0].slaves, after.devices[0].slaves);
    assert_eq!(before.devices[0].identity, after.devices[0].identity);

    bed.stop().await;
}
