//! `SystemInfo` gathering (§4.4 supplement 3, `discover/sysinfo.c`'s
//! incrementally-populated-vs-snapshot distinction).
//!
//! `model::SystemInfo` holds the shape; this module holds the
//! OS-querying and the conversions from `DiscoverDevice`/network state
//! used to keep it updated as devices and interfaces come and go.

use crate::model::{BlockDeviceInfo, DeviceType, DiscoverDevice, InterfaceInfo, SystemInfo};

const DMI_ID_DIR: &str = "/sys/class/dmi/id";

fn read_trimmed(path: &str) -> Option<String> {
    std::fs::read_to_string(path).ok().map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Populate the static identity fields once at start-up.
pub fn gather_identity(info: &mut SystemInfo) {
    info.system_type = read_trimmed(&format!("{DMI_ID_DIR}/product_name"));
    info.system_id = read_trimmed(&format!("{DMI_ID_DIR}/product_uuid"));
    info.firmware_version = read_trimmed(&format!("{DMI_ID_DIR}/bios_version"));
}

/// Convert a block `DiscoverDevice` into its `SystemInfo` projection.
pub fn block_device_info(device: &DiscoverDevice) -> BlockDeviceInfo {
    BlockDeviceInfo {
        name: device.id.clone(),
        uuid: device.uuid.clone(),
        mountpoint: device.mount.mount_path.as_ref().map(|p| p.to_string()),
    }
}

/// Convert a network `DiscoverDevice` (identified by its id, the MAC) into
/// its `SystemInfo` projection.
pub fn interface_info(device: &DiscoverDevice, link_up: bool, address: Option<String>) -> InterfaceInfo {
    InterfaceInfo {
        mac: device.id.clone(),
        name: device.label.clone().unwrap_or_else(|| device.id.clone()),
        link_up,
        address,
    }
}

/// Register or refresh a device in the inventory, routing to the
/// interface or block-device list by type.
pub fn on_device_add(info: &mut SystemInfo, device: &DiscoverDevice, link_up: bool, address: Option<String>) {
    if device.device_type == DeviceType::Network {
        info.upsert_interface(interface_info(device, link_up, address));
    } else {
        info.upsert_block_device(block_device_info(device));
    }
}

pub fn on_device_remove(info: &mut SystemInfo, device: &DiscoverDevice) {
    if device.device_type == DeviceType::Network {
        info.remove_interface(&device.id);
    } else {
        info.remove_block_device(&device.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MountState;

    #[test]
    fn block_device_add_then_remove_round_trips() {
        let mut info = SystemInfo::default();
        let mut dev = DiscoverDevice::new("sda1", DeviceType::Disk);
        dev.uuid = Some("AAA".into());
        dev.mount = MountState {
            mounted: true,
            mount_path: Some("/mnt/sda1".into()),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        on_device_add(&mut info, &dev, false, None);
        assert_eq!(info.block_devices.len(), 1);
        on_device_remove(&mut info, &dev);
        assert!(info.block_devices.is_empty());
    }
}
