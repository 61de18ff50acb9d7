//! Normalizes udev block-device hotplug, network-link, and user-event-socket
//! sources into the single `model::Event`/`DiscoverDevice` shapes
//! `device_handler.rs` consumes (§2 supplement 1).
//!
//! Grounded on `examples/original_source/discover/event-parser.c` for the
//! `name=value\0` user-event wire grammar (parsing itself lives in
//! `parser::user_event`; this module only frames the bytes into an `Event`)
//! and on SPEC_FULL.md's description of udev as the block hotplug source —
//! no teacher equivalent exists (bootupd never discovers removable media),
//! so the `udev` crate (already pinned in Cargo.toml) is used directly,
//! mirroring how `loader.rs` reaches for `coreos-installer`'s external-tool
//! idiom where the teacher has nothing to generalize from.

use std::collections::BTreeMap;
use std::os::unix::net::UnixDatagram;

use crate::model::{DeviceType, DiscoverDevice, Event, EventAction, EventType, MountState};

/// Wraps a `udev::MonitorSocket`, translating `add`/`remove` actions on the
/// `block` subsystem into `DiscoverDevice`s.
///
/// The exact `udev` 0.8 API surface (`MonitorBuilder::new()?.match_subsystem
/// ("block")?.listen()?`, iterating `Event`s with `.event_type()`/
/// `.device()`/`.property_value()`) is written from the crate's documented
/// public API and could not be checked against source without running the
/// toolchain, which this exercise forbids.
pub struct UdevSource {
    monitor: udev::MonitorSocket,
}

impl UdevSource {
    pub fn new() -> std::io::Result<Self> {
        let monitor = udev::MonitorBuilder::new()?.match_subsystem("block")?.listen()?;
        Ok(UdevSource { monitor })
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.monitor.as_raw_fd()
    }

    /// Drains whatever udev events are currently queued, never blocking.
    pub fn poll(&mut self) -> Vec<HotplugEvent> {
        let mut out = Vec::new();
        for event in self.monitor.iter() {
            if let Some(hotplug) = hotplug_from_udev(&event) {
                out.push(hotplug);
            }
        }
        out
    }
}

pub enum HotplugEvent {
    Add(DiscoverDevice),
    Remove(String),
}

fn device_type_for(device: &udev::Device) -> DeviceType {
    if device.property_value("ID_BUS").map(|v| v == "usb").unwrap_or(false) {
        DeviceType::Usb
    } else if device.property_value("ID_CDROM").is_some() {
        DeviceType::Optical
    } else {
        DeviceType::Disk
    }
}

fn hotplug_from_udev(event: &udev::Event) -> Option<HotplugEvent> {
    let device = event.device();
    let devnode = device.devnode()?.to_string_lossy().into_owned();

    match event.event_type() {
        udev::EventType::Remove => Some(HotplugEvent::Remove(devnode)),
        udev::EventType::Add | udev::EventType::Change => {
            let device_type = device_type_for(&device);
            let mut dev = DiscoverDevice::new(devnode.clone(), device_type);
            dev.device_path = Some(devnode);
            dev.uuid = prop(&device, "ID_FS_UUID");
            dev.label = prop(&device, "ID_FS_LABEL");
            if let Some(fstype) = prop(&device, "ID_FS_TYPE") {
                dev.params.insert("ID_FS_TYPE".into(), fstype);
            }
            dev.mount = MountState::default();
            Some(HotplugEvent::Add(dev))
        }
        _ => None,
    }
}

fn prop(device: &udev::Device, key: &str) -> Option<String> {
    device.property_value(key).and_then(|v| v.to_str()).map(|s| s.to_string())
}

/// The user-event Unix datagram socket (§4.5 `user_event` parser's source):
/// each datagram is `action@device-id\0k=v\0k=v\0...`.
pub struct UserEventSource {
    socket: UnixDatagram,
}

impl UserEventSource {
    pub fn bind(path: &camino::Utf8Path) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let socket = UnixDatagram::bind(path)?;
        socket.set_nonblocking(true)?;
        Ok(UserEventSource { socket })
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.socket.as_raw_fd()
    }

    /// Drains whatever datagrams are queued, discarding any that fail to
    /// parse (§4.5: malformed input is logged and ignored, never fatal).
    pub fn poll(&self) -> Vec<Event> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(n) => {
                    if let Some(event) = parse_user_event_datagram(&buf[..n]) {
                        out.push(event);
                    }
                }
                Err(_) => break,
            }
        }
        out
    }
}

/// `action@device-id\0k=v\0k=v\0...` framing (`event-parser.c`'s wire
/// grammar; field-level parsing of the boot option itself is
/// `parser::user_event`'s job).
pub fn parse_user_event_datagram(buf: &[u8]) -> Option<Event> {
    let mut fields = buf.split(|&b| b == 0).filter(|f| !f.is_empty());
    let header = std::str::from_utf8(fields.next()?).ok()?;
    let (action_str, device_id) = header.split_once('@')?;

    let action = match action_str {
        "add" => EventAction::Add,
        "remove" => EventAction::Remove,
        "conf" => EventAction::Conf,
        "dhcp" => EventAction::Dhcp,
        "boot" => EventAction::Boot,
        "sync" => EventAction::Sync,
        "plugin" => EventAction::Plugin,
        "url" => EventAction::Url,
        _ => return None,
    };

    let mut params = BTreeMap::new();
    for field in fields {
        let field = std::str::from_utf8(field).ok()?;
        if let Some((k, v)) = field.split_once('=') {
            params.insert(k.to_string(), v.to_string());
        }
    }

    Some(Event {
        event_type: EventType::User,
        action,
        device_id: device_id.to_string(),
        params,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_add_event_with_params() {
        let mut datagram = b"add@sda1\0name=My Linux\0image=/boot/vmlinuz\0".to_vec();
        datagram.push(0);
        let event = parse_user_event_datagram(&datagram).unwrap();
        assert_eq!(event.action, EventAction::Add);
        assert_eq!(event.device_id, "sda1");
        assert_eq!(event.params.get("name").unwrap(), "My Linux");
        assert_eq!(event.params.get("image").unwrap(), "/boot/vmlinuz");
    }

    #[test]
    fn rejects_malformed_header() {
        let datagram = b"not-a-valid-header\0k=v\0".to_vec();
        assert!(parse_user_event_datagram(&datagram).is_none());
    }

    #[test]
    fn rejects_unknown_action() {
        let datagram = b"frobnicate@dev0\0".to_vec();
        assert!(parse_user_event_datagram(&datagram).is_none());
    }
}
