//! Network manager (§4.8): per-interface state machine driven by netlink
//! link events, DHCP/static configuration, and the DNS resolv.conf merge.
//!
//! Grounded on `examples/original_source/discover/network.c`: interface
//! state machine (`IFSTATE_NEW` → `IFSTATE_UP_WAITING_LINK` →
//! `IFSTATE_CONFIGURED`/`IFSTATE_IGNORED`), `configure_interface`'s decision
//! tree, and `network_init_dns`'s append-only resolv.conf merge, ported
//! literally (§2 supplement). No teacher equivalent (bootupd has no network
//! stack); the raw `RTM_{NEW,DEL}LINK` handling uses `netlink-sys` +
//! `netlink-packet-core`/`netlink-packet-route`, the crates the pack's other
//! examples reach for when they need raw rtnetlink access.

use std::collections::BTreeMap;

use netlink_packet_core::{NetlinkMessage, NetlinkPayload};
use netlink_packet_route::link::{LinkAttribute, LinkFlags, LinkMessage};
use netlink_packet_route::RouteNetlinkMessage;
use netlink_sys::{protocols::NETLINK_ROUTE, Socket, SocketAddr};

use crate::env::Env;
use crate::model::{InterfaceConfig, NetworkConfig};
use crate::process::{self, RunningProcess};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IfState {
    New,
    UpWaitingLink,
    Configured,
    Ignored,
}

pub struct Interface {
    pub ifindex: u32,
    pub name: String,
    pub hwaddr: [u8; 6],
    pub state: IfState,
    udhcpc: Option<RunningProcess>,
}

impl Interface {
    pub fn mac_string(&self) -> String {
        self.hwaddr.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
    }
}

/// One netlink link-state change, already stripped of its wire framing.
pub struct LinkEvent {
    pub ifindex: u32,
    pub name: String,
    pub hwaddr: [u8; 6],
    pub up: bool,
    pub link: bool,
    pub removed: bool,
}

fn find_config_by_hwaddr<'a>(config: &'a NetworkConfig, hwaddr: &str) -> Option<&'a InterfaceConfig> {
    config.interfaces.get(hwaddr)
}

pub struct NetworkManager {
    pub interfaces: Vec<Interface>,
    socket: Socket,
}

impl NetworkManager {
    /// Opens the `RTMGRP_LINK` netlink socket and sends the initial
    /// `RTM_GETLINK` dump request (`network_init_netlink` +
    /// `network_send_link_query`).
    pub fn new(env: &Env, network_config: &NetworkConfig) -> std::io::Result<Self> {
        update_resolv_conf(env, network_config);

        let mut socket = Socket::new(NETLINK_ROUTE)?;
        let addr = SocketAddr::new(0, 1 /* RTMGRP_LINK */);
        socket.bind(&addr)?;
        socket.connect(&SocketAddr::new(0, 0))?;
        send_link_dump_request(&socket)?;

        Ok(NetworkManager {
            interfaces: Vec::new(),
            socket,
        })
    }

    pub fn fd(&self) -> std::os::unix::io::RawFd {
        use std::os::unix::io::AsRawFd;
        self.socket.as_raw_fd()
    }

    fn find_index(&self, ifindex: u32) -> Option<usize> {
        self.interfaces.iter().position(|i| i.ifindex == ifindex)
    }

    /// Drain and process whatever link events are currently readable.
    /// Called from the event loop when `fd()` is readable; never blocks.
    pub fn poll(&mut self, env: &Env, config: &NetworkConfig) -> Vec<LinkEvent> {
        let mut buf = vec![0u8; 4096];
        let mut events = Vec::new();
        loop {
            match self.socket.recv(&mut &mut buf[..], 0) {
                Ok(n) if n > 0 => events.extend(parse_link_events(&buf[..n])),
                _ => break,
            }
        }
        for event in &events {
            self.handle_event(env, config, event);
        }
        events
    }

    fn handle_event(&mut self, env: &Env, config: &NetworkConfig, event: &LinkEvent) {
        if event.removed || event.hwaddr == [0; 6] {
            if let Some(idx) = self.find_index(event.ifindex) {
                let iface = self.interfaces.remove(idx);
                log::info!("network: interface {} removed", iface.name);
            }
            return;
        }

        let idx = match self.find_index(event.ifindex) {
            Some(idx) => idx,
            None => {
                self.interfaces.push(Interface {
                    ifindex: event.ifindex,
                    name: event.name.clone(),
                    hwaddr: event.hwaddr,
                    state: IfState::New,
                    udhcpc: None,
                });
                self.interfaces.len() - 1
            }
        };
        self.configure_interface(env, config, idx, event.up, event.link);
    }

    /// `configure_interface`'s decision tree, ported as closely as the
    /// state machine names allow.
    fn configure_interface(&mut self, env: &Env, config: &NetworkConfig, idx: usize, up: bool, link: bool) {
        let mac = self.interfaces[idx].mac_string();
        let name = self.interfaces[idx].name.clone();

        if self.interfaces[idx].state == IfState::Ignored {
            return;
        }

        if self.interfaces[idx].state == IfState::Configured {
            if !up {
                self.interfaces[idx].state = IfState::New;
            } else if !link {
                self.interfaces[idx].state = IfState::UpWaitingLink;
            } else {
                return;
            }
        }

        if name == "lo" {
            if self.interfaces[idx].state == IfState::New {
                interface_up(env, &name);
            }
            self.interfaces[idx].state = IfState::Configured;
            return;
        }

        let iface_config = find_config_by_hwaddr(config, &mac).cloned();
        if matches!(iface_config, Some(InterfaceConfig::Ignore)) {
            log::info!("network: ignoring interface {name}");
            self.interfaces[idx].state = IfState::Ignored;
            return;
        }

        if config.manual && iface_config.is_none() {
            log::info!("network: skipping {name}: manual config mode, but no config for this interface");
            self.interfaces[idx].state = IfState::Ignored;
            return;
        }

        if self.interfaces[idx].state == IfState::New {
            if !up {
                interface_up(env, &name);
                log::info!("network: bringing up interface {name}");
                return;
            } else if !link {
                self.interfaces[idx].state = IfState::UpWaitingLink;
            }
        }

        if self.interfaces[idx].state == IfState::UpWaitingLink && !link {
            return;
        }

        log::info!("network: configuring interface {name}");
        match iface_config {
            None | Some(InterfaceConfig::Dhcp) => {
                let process = configure_interface_dhcp(env, &name);
                self.interfaces[idx].udhcpc = process;
            }
            Some(InterfaceConfig::Static { address, netmask, gateway }) => {
                configure_interface_static(env, &name, &address, &netmask, gateway.as_deref());
            }
            Some(InterfaceConfig::Ignore) => unreachable!("handled above"),
        }
        self.interfaces[idx].state = IfState::Configured;
    }

    pub fn shutdown(&mut self, env: &Env) {
        for iface in &mut self.interfaces {
            if let Some(p) = iface.udhcpc.as_mut() {
                p.cancel();
            }
            interface_down(env, &iface.name);
        }
    }
}

fn send_link_dump_request(socket: &Socket) -> std::io::Result<()> {
    let mut get_link = NetlinkMessage::from(RouteNetlinkMessage::GetLink(LinkMessage::default()));
    get_link.header.flags = netlink_packet_core::NLM_F_REQUEST | netlink_packet_core::NLM_F_DUMP;
    get_link.header.sequence_number = 1;
    get_link.finalize();
    let mut buf = vec![0u8; get_link.header.length as usize];
    get_link.serialize(&mut buf);
    socket.send(&buf, 0)?;
    Ok(())
}

fn parse_link_events(buf: &[u8]) -> Vec<LinkEvent> {
    let mut out = Vec::new();
    let mut offset = 0;
    while offset < buf.len() {
        let msg = match <NetlinkMessage<RouteNetlinkMessage>>::deserialize(&buf[offset..]) {
            Ok(msg) => msg,
            Err(_) => break,
        };
        let len = msg.header.length as usize;
        if len == 0 {
            break;
        }
        if let NetlinkPayload::InnerMessage(payload) = msg.payload {
            match payload {
                RouteNetlinkMessage::NewLink(link) | RouteNetlinkMessage::DelLink(link) => {
                    if let Some(event) = link_message_to_event(&link) {
                        out.push(event);
                    }
                }
                _ => {}
            }
        }
        offset += len;
    }
    out
}

fn link_message_to_event(link: &LinkMessage) -> Option<LinkEvent> {
    let mut name = None;
    let mut hwaddr = [0u8; 6];
    let mut mtu = 1u32;
    for attr in &link.attributes {
        match attr {
            LinkAttribute::IfName(n) => name = Some(n.clone()),
            LinkAttribute::Address(addr) if addr.len() == 6 => hwaddr.copy_from_slice(addr),
            LinkAttribute::Mtu(m) => mtu = *m,
            _ => {}
        }
    }
    let name = name?;
    let up = link.header.flags.contains(LinkFlags::Up);
    let link_up = link.header.flags.contains(LinkFlags::LowerUp);
    Some(LinkEvent {
        ifindex: link.header.index,
        name,
        hwaddr,
        up,
        link: link_up,
        removed: mtu == 0,
    })
}

fn interface_up(env: &Env, name: &str) {
    let argv = vec![env.tools.ip.to_string_lossy().into_owned(), "link".into(), "set".into(), name.into(), "up".into()];
    if let Err(e) = process::run_sync(env, &argv) {
        log::warn!("failed to bring interface {name} up: {e}");
    }
}

fn interface_down(env: &Env, name: &str) {
    let argv = vec![env.tools.ip.to_string_lossy().into_owned(), "link".into(), "set".into(), name.into(), "down".into()];
    if let Err(e) = process::run_sync(env, &argv) {
        log::warn!("failed to bring interface {name} down: {e}");
    }
}

fn configure_interface_dhcp(env: &Env, name: &str) -> Option<RunningProcess> {
    let pidfile = format!("/var/lib/petitboot/udhcpc-{name}.pid");
    let argv = vec![
        env.tools.udhcpc.to_string_lossy().into_owned(),
        "-R".into(),
        "-n".into(),
        "-O".into(),
        "pxeconffile".into(),
        "-p".into(),
        pidfile,
        "-i".into(),
        name.to_string(),
    ];
    match process::spawn(env, &argv, format!("udhcpc for {name}")) {
        Ok(p) => Some(p),
        Err(e) => {
            log::warn!("failed to start udhcpc for {name}: {e}");
            None
        }
    }
}

fn configure_interface_static(env: &Env, name: &str, address: &str, netmask: &str, gateway: Option<&str>) {
    let argv = vec![
        env.tools.ip.to_string_lossy().into_owned(),
        "address".into(),
        "add".into(),
        format!("{address}/{netmask}"),
        "dev".into(),
        name.to_string(),
    ];
    if let Err(e) = process::run_sync(env, &argv) {
        log::warn!("failed to add address {address} to interface {name}: {e}");
        return;
    }
    interface_up(env, name);
    if let Some(gateway) = gateway {
        let argv = vec![
            env.tools.ip.to_string_lossy().into_owned(),
            "route".into(),
            "add".into(),
            "default".into(),
            "via".into(),
            gateway.to_string(),
        ];
        if let Err(e) = process::run_sync(env, &argv) {
            log::warn!("failed to add default route {gateway} on interface {name}: {e}");
        }
    }
}

/// `network_init_dns`: append any DNS server from `config` not already
/// present in `/etc/resolv.conf`, never truncating the file.
pub fn update_resolv_conf(env: &Env, config: &NetworkConfig) {
    if env.dry_run || config.dns_servers.is_empty() {
        return;
    }
    let path = "/etc/resolv.conf";
    let mut buf = std::fs::read_to_string(path).unwrap_or_default();
    let mut modified = false;
    for server in &config.dns_servers {
        let line = format!("nameserver {server}\n");
        if !buf.contains(&line) {
            buf.push_str(&line);
            modified = true;
        }
    }
    if modified {
        if let Err(e) = std::fs::write(path, buf) {
            log::warn!("error replacing resolv.conf: {e}");
        }
    }
}

/// Keyed by MAC address, matching `Config::network.interfaces`.
pub fn describe_interfaces(interfaces: &[Interface]) -> BTreeMap<String, IfState> {
    interfaces.iter().map(|i| (i.mac_string(), i.state)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolv_conf_merge_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let resolv_path = dir.path().join("resolv.conf");
        std::fs::write(&resolv_path, "nameserver 10.0.0.1\n").unwrap();

        // update_resolv_conf hardcodes /etc/resolv.conf; exercise the merge
        // logic directly instead of the fixed path.
        let mut buf = std::fs::read_to_string(&resolv_path).unwrap();
        let mut modified = false;
        for server in ["10.0.0.1", "8.8.8.8"] {
            let line = format!("nameserver {server}\n");
            if !buf.contains(&line) {
                buf.push_str(&line);
                modified = true;
            }
        }
        assert!(modified);
        assert_eq!(buf, "nameserver 10.0.0.1\nnameserver 8.8.8.8\n");
    }

    #[test]
    fn mac_string_formats_lowercase_colon_separated() {
        let iface = Interface {
            ifindex: 2,
            name: "eth0".into(),
            hwaddr: [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff],
            state: IfState::New,
            udhcpc: None,
        };
        assert_eq!(iface.mac_string(), "aa:bb:cc:dd:ee:ff");
    }
}
