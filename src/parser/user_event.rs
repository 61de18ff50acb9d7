//! user-event (§4.5, §6): the Unix-datagram grammar
//! `action@device-id\0key1=value1\0key2=value2\0...`, and a format backend
//! that turns a `conf` event's params into a boot option the same way
//! kboot does.
//!
//! Grounded on `examples/original_source/discover/user-event.c`'s
//! `user_event_parse_message` for the `@`/NUL-delimited grammar.

use std::collections::BTreeMap;

use crate::model::{DeviceType, DiscoverDevice, Event, EventAction, EventType, Resource};
use crate::parser::{kboot, GlobalOptions};

/// Parse one datagram into a normalized `Event`. Returns `None` for a
/// malformed payload (no `@`, or an unrecognized action name).
pub fn parse_payload(buf: &[u8]) -> Option<Event> {
    let text = String::from_utf8_lossy(buf);
    let mut fields = text.split('\0');
    let header = fields.next()?;
    let (action_str, device_id) = header.split_once('@')?;
    let action = match action_str {
        "add" => EventAction::Add,
        "remove" => EventAction::Remove,
        "boot" => EventAction::Boot,
        "dhcp" => EventAction::Dhcp,
        "url" => EventAction::Url,
        "sync" => EventAction::Sync,
        "plugin" => EventAction::Plugin,
        "conf" => EventAction::Conf,
        _ => return None,
    };
    let mut params = BTreeMap::new();
    for field in fields {
        if field.is_empty() {
            continue;
        }
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

pub struct UserEventParser;

impl super::Parser for UserEventParser {
    fn name(&self) -> &'static str {
        "user-event"
    }

    fn parse(&self, ctx: &mut super::DiscoverContext<'_>, _buf: &[u8]) {
        let Some(event) = ctx.event else { return };
        if event.action != EventAction::Conf {
            return;
        }
        let Some(label) = event.params.get("label").cloned() else {
            return;
        };
        let Some(image) = event.params.get("image").cloned() else {
            return;
        };
        let mut globals = GlobalOptions::new(kboot::GLOBAL_NAMES);
        for (k, v) in &event.params {
            if k != "label" && k != "image" {
                globals.set(k, v);
            }
        }
        let mut opt = kboot::build_option(ctx.device, &label, &image, &globals);
        opt.parser_name = "user-event";
        ctx.add_boot_option(opt);
    }

    fn resolve_resource(&self, device: &DiscoverDevice, resource: &Resource) -> Option<Resource> {
        crate::resolver::resolve_generic(device, resource)
    }
}

/// A bare `/dev/`-less device id is the convention for network devices
/// created purely from user events (e.g. an interface name like `eth0`).
pub fn synthesize_network_device(device_id: &str) -> DiscoverDevice {
    DiscoverDevice::new(device_id, DeviceType::Network)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_remove_with_no_params() {
        let e = parse_payload(b"remove@eth0\0").unwrap();
        assert_eq!(e.action, EventAction::Remove);
        assert_eq!(e.device_id, "eth0");
        assert!(e.params.is_empty());
    }

    #[test]
    fn parses_dhcp_with_params() {
        let e = parse_payload(b"dhcp@eth0\0pxeconffile=default\0siaddr=192.168.1.1\0").unwrap();
        assert_eq!(e.action, EventAction::Dhcp);
        assert_eq!(e.params.get("pxeconffile").map(String::as_str), Some("default"));
        assert_eq!(e.params.get("siaddr").map(String::as_str), Some("192.168.1.1"));
    }

    #[test]
    fn rejects_unknown_action() {
        assert!(parse_payload(b"bogus@eth0\0").is_none());
    }
}
