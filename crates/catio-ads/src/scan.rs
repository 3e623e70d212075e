//! Device tree discovery and periodic diagnostics polling.

use crate::client::AdsClient;
use crate::codec::ByteReader;
use crate::command::{ReadRequest, SumReadRequest};
use crate::device::{CrcCounters, Device, DeviceTree, FrameCounters, Identity, Slave};
use crate::index;
use catio_common::error::{AdsError, AdsResult};
use catio_common::net_id::{AmsAddr, NetId, PORT_ETHERCAT_MASTER};
use tracing::{debug, info, warn};

/// Upper bound on devices read from the id list.
pub const MAX_DEVICES: u32 = 64;

/// Bytes reserved for a device or terminal name.
pub const NAME_READ_LEN: u32 = 64;

fn device_group(id: u16) -> u32 {
    index::IO_DEVICE_STATE_BASE + u32::from(id)
}

/// Text up to the first null byte.
fn c_string(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

fn parse_u16_list(bytes: &[u8], count: usize) -> AdsResult<Vec<u16>> {
    let mut r = ByteReader::new(bytes);
    (0..count).map(|_| r.u16()).collect()
}

/// Discover every EtherCAT device and its slaves.
///
/// Builds a fresh tree; nothing from an earlier run is reused.
pub async fn discover(client: &AdsClient) -> AdsResult<DeviceTree> {
    let server = client.target();
    let raw = client
        .read(
            server,
            index::IO_DEVICE_STATE_BASE,
            index::IO_DEVICE_IDS,
            2 + 2 * MAX_DEVICES,
        )
        .await?;
    let mut r = ByteReader::new(&raw);
    let count = usize::from(r.u16()?);
    let ids = parse_u16_list(r.rest(), count)?;
    debug!(count, ?ids, "I/O devices listed");

    let mut tree = DeviceTree::new();
    for id in ids {
        let device_type = client
            .read_value::<u16>(server, device_group(id), index::IO_DEVICE_TYPE)
            .await?;
        if device_type != index::DEVICE_TYPE_ETHERCAT {
            debug!(id, device_type, "Skipping non-EtherCAT device");
            continue;
        }
        tree.devices.push(discover_device(client, server, id, device_type).await?);
    }

    info!(
        devices = tree.devices.len(),
        slaves = tree.slave_count(),
        "Device tree discovered"
    );
    Ok(tree)
}

async fn discover_device(
    client: &AdsClient,
    server: AmsAddr,
    id: u16,
    type_code: u16,
) -> AdsResult<Device> {
    let name = c_string(
        &client
            .read(server, device_group(id), index::IO_DEVICE_NAME, NAME_READ_LEN)
            .await?,
    );
    let net_id = NetId::from_bytes(
        &client
            .read(
                server,
                device_group(id),
                index::IO_DEVICE_NETID,
                NetId::SIZE as u32,
            )
            .await?,
    )?;
    let master = AmsAddr::new(net_id, PORT_ETHERCAT_MASTER);

    let slave_count = client.read_value::<u32>(master, index::SLAVE_COUNT, 0).await?;
    let slave_count = slave_count as usize;
    #[allow(clippy::cast_possible_truncation)]
    let addresses = parse_u16_list(
        &client
            .read(master, index::SLAVE_ADDRESSES, 0, 2 * slave_count as u32)
            .await?,
        slave_count,
    )?;

    let mut slaves = Vec::with_capacity(slave_count);
    for address in addresses {
        let identity = Identity::from_bytes(
            &client
                .read(
                    master,
                    index::SLAVE_IDENTITY,
                    u32::from(address),
                    Identity::SIZE as u32,
                )
                .await?,
        )?;
        let name = read_slave_name(client, net_id, address).await;
        slaves.push(Slave {
            address,
            name,
            identity,
            state: 0,
            link_status: 0,
            crc: CrcCounters::default(),
        });
    }

    let mut device = Device {
        id,
        name,
        type_code,
        net_id,
        identity: read_master_identity(client, master).await,
        slaves,
        frame_counters: FrameCounters::default(),
        master_state: 0,
    };
    poll_device(client, &mut device).await?;

    info!(
        id,
        name = %device.name,
        %net_id,
        slaves = device.slaves.len(),
        "EtherCAT device discovered"
    );
    Ok(device)
}

/// Terminal name from CoE object 0x1008, or `Term <address>`.
async fn read_slave_name(client: &AdsClient, net_id: NetId, address: u16) -> String {
    let target = AmsAddr::new(net_id, address);
    match client
        .read(
            target,
            index::COE_SDO,
            index::coe_offset(0x1008, 0),
            NAME_READ_LEN,
        )
        .await
    {
        Ok(bytes) if !c_string(&bytes).is_empty() => c_string(&bytes),
        Ok(_) => format!("Term {address}"),
        Err(e) => {
            debug!(address, error = %e, "No CoE name, using fallback");
            format!("Term {address}")
        }
    }
}

/// Master identity from CoE object 0x1018; zeroed when unavailable.
async fn read_master_identity(client: &AdsClient, master: AmsAddr) -> Identity {
    let mut fields = [0u32; 4];
    for (subindex, field) in (1u8..).zip(fields.iter_mut()) {
        match client
            .read_value::<u32>(master, index::COE_SDO, index::coe_offset(0x1018, subindex))
            .await
        {
            Ok(value) => *field = value,
            Err(e) => {
                debug!(%master, error = %e, "Master identity unavailable");
                return Identity::default();
            }
        }
    }
    let [vendor_id, product_code, revision, serial] = fields;
    Identity::new(vendor_id, product_code, revision, serial)
}

/// Refresh slave states, CRC counters, frame counters and master state of
/// every device in place.
pub async fn poll(client: &AdsClient, tree: &mut DeviceTree) -> AdsResult<()> {
    for device in &mut tree.devices {
        poll_device(client, device).await?;
    }
    Ok(())
}

#[allow(clippy::cast_possible_truncation)]
async fn poll_device(client: &AdsClient, device: &mut Device) -> AdsResult<()> {
    let count = device.slaves.len() as u32;
    let request = SumReadRequest {
        items: vec![
            ReadRequest {
                index_group: index::SLAVE_STATES,
                index_offset: 0,
                length: 2 * count,
            },
            ReadRequest {
                index_group: index::SLAVE_CRC,
                index_offset: 0,
                length: CrcCounters::SIZE as u32 * count,
            },
            ReadRequest {
                index_group: index::FRAME_COUNTERS,
                index_offset: 0,
                length: FrameCounters::SIZE as u32,
            },
            ReadRequest {
                index_group: index::MASTER_STATE,
                index_offset: 0,
                length: 2,
            },
        ],
    };
    let results = client.sum_read(device.master_addr(), &request).await?;
    let [states, crc, frames, master_state]: [AdsResult<Vec<u8>>; 4] =
        results.try_into().map_err(|r: Vec<_>| {
            AdsError::InvalidPayload(format!("sum-read returned {} results", r.len()))
        })?;

    device.apply_states(&states?)?;
    match crc {
        Ok(data) => device.apply_crc(&data)?,
        Err(e) => warn!(device = device.id, error = %e, "CRC counters unavailable"),
    }
    device.apply_frame_counters(&frames?)?;
    device.master_state = u16::from_le_bytes(
        master_state?
            .get(..2)
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| AdsError::InvalidPayload("master state".into()))?,
    );
    Ok(())
}
