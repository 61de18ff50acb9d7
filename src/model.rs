/*
 * Copyright (C) 2020 Red Hat, Inc.
 *
 * SPDX-License-Identifier: Apache-2.0
 */

//! The data model (§3).
//!
//! Grounded on `bootupd/src/model.rs`'s style (serde-derived records,
//! `BTreeMap` for stable iteration order, `kebab-case` wire/JSON
//! representation) generalized from bootupd's single `SavedState` to the
//! full discovery pipeline's device/option/event/status/config shapes.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

use crate::url::Url;

/// `type ∈ {Disk, Usb, Optical, Network, Any, Unknown}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceType {
    Disk,
    Usb,
    Optical,
    Network,
    Any,
    Unknown,
}

/// Mount state for a block-backed device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MountState {
    pub mounted: bool,
    pub mount_path: Option<Utf8PathBuf>,
    pub mounted_rw: bool,
    pub unmount_on_drop: bool,
}

/// A device-mapper / dm-snapshot writable overlay descriptor. The real
/// snapshot layer is an opaque collaborator (§1); this is just the handle
/// a `DiscoverDevice` carries for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayDescriptor {
    pub dm_name: String,
    pub backing_device: String,
}

/// Represents a physical or logical source of boot options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverDevice {
    /// Stable, unique-per-daemon-lifetime id.
    pub id: String,
    pub device_type: DeviceType,
    pub uuid: Option<String>,
    pub label: Option<String>,
    pub device_path: Option<String>,
    pub mount: MountState,
    pub params: BTreeMap<String, String>,
    pub boot_options: Vec<DiscoverBootOption>,
    pub overlay: Option<OverlayDescriptor>,
}

impl DiscoverDevice {
    pub fn new(id: impl Into<String>, device_type: DeviceType) -> Self {
        DiscoverDevice {
            id: id.into(),
            device_type,
            uuid: None,
            label: None,
            device_path: None,
            mount: MountState::default(),
            params: BTreeMap::new(),
            boot_options: Vec::new(),
            overlay: None,
        }
    }

    /// Invariant (§3): a network device has no `device_path` and is never
    /// mounted.
    pub fn is_network(&self) -> bool {
        matches!(self.device_type, DeviceType::Network)
    }

    pub fn is_block(&self) -> bool {
        !self.is_network() && self.device_path.is_some()
    }

    /// `device_spec` match used by the resolver: bare id (with leading
    /// `/dev/` stripped), as opposed to `uuid=`/`label=` specs.
    pub fn matches_bare_id(&self, spec: &str) -> bool {
        let stripped = spec.strip_prefix("/dev/").unwrap_or(spec);
        self.id == stripped
    }

    /// §9(c): missing attributes never match, never panic.
    pub fn matches_uuid(&self, uuid: &str) -> bool {
        self.uuid.as_deref() == Some(uuid)
    }

    pub fn matches_label(&self, label: &str) -> bool {
        self.label.as_deref() == Some(label)
    }
}

/// A reference to a file that may or may not be resolvable yet (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Resource {
    /// Carries a `URL` and is ready to use.
    Resolved(Url),
    /// `{device_spec, path}` where `device_spec` selects a device by
    /// `uuid=...`, `label=...`, or bare id.
    DevPathPending { device_spec: String, path: String },
    /// `{root_uuid, path}` awaiting a device with that UUID.
    Grub2Pending { root_uuid: String, path: String },
    /// Only used for grub2's `(dev)/path` form during parse; resolves to a
    /// URL immediately when the referenced device is the current one.
    UrlPending { path: String },
}

impl Resource {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Resource::Resolved(_))
    }

    pub fn resolved_url(&self) -> Option<&Url> {
        match self {
            Resource::Resolved(u) => Some(u),
            _ => None,
        }
    }
}

/// The finalized, wire-ready view of a boot option (§3, §4.2). `dtb` is
/// part of the data model but — per the wire format's seven-string payload
/// — is not itself transmitted in a `DeviceAdd`/`BootOptionAdd` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootOption {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub icon: Option<String>,
    pub boot_image: Option<String>,
    pub initrd: Option<String>,
    pub boot_args: Option<String>,
    pub is_default: bool,
}

/// Owns four optional `Resource`s plus a `BootOption` record, and a
/// back-pointer (by parser name) to the parser instance that produced it,
/// used by the deferred resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoverBootOption {
    pub boot_image: Option<Resource>,
    pub initrd: Option<Resource>,
    pub dtb: Option<Resource>,
    pub icon: Option<Resource>,
    pub option: BootOption,
    pub parser_name: &'static str,
    /// The id of the device this option was parsed from; used to drop
    /// queued-but-unresolved options when that device is removed (§4.7).
    pub origin_device_id: String,
}

impl DiscoverBootOption {
    /// A boot option may be published to clients only when all four
    /// resources it declared are Resolved (§3, §8 invariant).
    pub fn all_resolved(&self) -> bool {
        [&self.boot_image, &self.initrd, &self.dtb, &self.icon]
            .into_iter()
            .all(|r| r.as_ref().map(Resource::is_resolved).unwrap_or(true))
    }

    /// Snapshot resolved URLs into the `BootOption` record, the "finalize"
    /// step in §4.7 step 6.
    pub fn finalize(&mut self) {
        self.option.boot_image = self.boot_image.as_ref().and_then(Resource::resolved_url).map(Url::render);
        self.option.initrd = self.initrd.as_ref().and_then(Resource::resolved_url).map(Url::render);
        self.option.icon = self.icon.as_ref().and_then(Resource::resolved_url).map(Url::render);
    }
}

/// `{ type: Udev|User|Network, action: Add|Remove|Conf|Dhcp|Boot|Sync|Plugin|Url, device_id, params }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    Udev,
    User,
    Network,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventAction {
    Add,
    Remove,
    Conf,
    Dhcp,
    Boot,
    Sync,
    Plugin,
    Url,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_type: EventType,
    pub action: EventAction,
    pub device_id: String,
    pub params: BTreeMap<String, String>,
}

/// Client-issued boot request (§3).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootCommand {
    pub option_id: String,
    pub boot_image_file: Option<String>,
    pub initrd_file: Option<String>,
    pub dtb_file: Option<String>,
    pub boot_args: Option<String>,
    pub args_sig_file: Option<String>,
    pub console: Option<String>,
}

/// `{ type: Info|Error, message, progress: -1..100, detail }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub is_error: bool,
    pub message: String,
    pub progress: i32,
    pub detail: Option<String>,
}

impl Status {
    pub fn info(message: impl Into<String>) -> Self {
        Status {
            is_error: false,
            message: message.into(),
            progress: -1,
            detail: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Status {
            is_error: true,
            message: message.into(),
            progress: -1,
            detail: None,
        }
    }

    pub fn with_progress(mut self, progress: i32) -> Self {
        self.progress = progress.clamp(-1, 100);
        self
    }
}

/// An entry in the ordered autoboot preference list: disk UUID / MAC /
/// device type, each carrying a priority (negative = veto).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "kind")]
pub enum BootPriority {
    DeviceType { device_type: DeviceType, priority: i32 },
    Uuid { uuid: String, priority: i32 },
    Mac { mac: String, priority: i32 },
}

/// Per-interface network configuration mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "mode")]
pub enum InterfaceConfig {
    Dhcp,
    Static {
        address: String,
        netmask: String,
        gateway: Option<String>,
    },
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Keyed by hardware address (MAC).
    pub interfaces: BTreeMap<String, InterfaceConfig>,
    pub dns_servers: Vec<String>,
    /// In `manual` mode, an interface with no entry above is Ignored;
    /// otherwise it's auto-configured via DHCP (§4.8).
    pub manual: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            interfaces: BTreeMap::new(),
            dns_servers: Vec::new(),
            manual: false,
        }
    }
}

/// Persistent system configuration (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub autoboot_enabled: bool,
    pub autoboot_timeout_sec: u32,
    pub network: NetworkConfig,
    pub boot_priorities: Vec<BootPriority>,
    pub ipmi_override: Option<String>,
    pub proxies: Vec<String>,
    pub allow_writes: bool,
    pub preferred_console: Option<String>,
    pub language: Option<String>,
    pub safe_mode: bool,
    /// Stored modify-password hash (§4.9 `Authenticate`); `None` disables
    /// authentication and every client is treated as already authenticated.
    pub password_hash: Option<String>,
    /// Only UID 0 may issue mutating actions when set (§4.9).
    pub restrict_clients: bool,
}

impl Default for Config {
    fn default() -> Self {
        // The default boot-priority list is `[Network=2, Disk=1]` (§6).
        Config {
            autoboot_enabled: true,
            autoboot_timeout_sec: 10,
            network: NetworkConfig::default(),
            boot_priorities: vec![
                BootPriority::DeviceType {
                    device_type: DeviceType::Network,
                    priority: 2,
                },
                BootPriority::DeviceType {
                    device_type: DeviceType::Disk,
                    priority: 1,
                },
            ],
            ipmi_override: None,
            proxies: Vec::new(),
            allow_writes: false,
            preferred_console: None,
            language: None,
            safe_mode: false,
            password_hash: None,
            restrict_clients: true,
        }
    }
}

/// Hardware inventory snapshot (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InterfaceInfo {
    pub mac: String,
    pub name: String,
    pub link_up: bool,
    pub address: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockDeviceInfo {
    pub name: String,
    pub uuid: Option<String>,
    pub mountpoint: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SystemInfo {
    pub system_type: Option<String>,
    pub system_id: Option<String>,
    pub firmware_version: Option<String>,
    pub interfaces: Vec<InterfaceInfo>,
    pub block_devices: Vec<BlockDeviceInfo>,
}

impl SystemInfo {
    pub fn upsert_interface(&mut self, info: InterfaceInfo) {
        if let Some(existing) = self.interfaces.iter_mut().find(|i| i.mac == info.mac) {
            *existing = info;
        } else {
            self.interfaces.push(info);
        }
    }

    pub fn remove_interface(&mut self, mac: &str) {
        self.interfaces.retain(|i| i.mac != mac);
    }

    pub fn upsert_block_device(&mut self, info: BlockDeviceInfo) {
        if let Some(existing) = self.block_devices.iter_mut().find(|b| b.name == info.name) {
            *existing = info;
        } else {
            self.block_devices.push(info);
        }
    }

    pub fn remove_block_device(&mut self, name: &str) {
        self.block_devices.retain(|b| b.name != name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_option_resolves_only_when_all_four_are_resolved() {
        let mut opt = DiscoverBootOption {
            boot_image: Some(Resource::Resolved(Url::parse("file:///a").unwrap())),
            initrd: Some(Resource::DevPathPending {
                device_spec: "uuid=AAA".into(),
                path: "/initrd".into(),
            }),
            dtb: None,
            icon: None,
            option: BootOption {
                id: "x".into(),
                name: "y".into(),
                description: None,
                icon: None,
                boot_image: None,
                initrd: None,
                boot_args: None,
                is_default: false,
            },
            parser_name: "test",
            origin_device_id: "dev0".into(),
        };
        assert!(!opt.all_resolved());
        opt.initrd = Some(Resource::Resolved(Url::parse("file:///b").unwrap()));
        assert!(opt.all_resolved());
        opt.finalize();
        assert_eq!(opt.option.boot_image.as_deref(), Some("/a"));
        assert_eq!(opt.option.initrd.as_deref(), Some("/b"));
    }

    #[test]
    fn device_matches_treat_missing_attrs_as_non_match() {
        let dev = DiscoverDevice::new("sda1", DeviceType::Disk);
        assert!(!dev.matches_uuid("AAA"));
        assert!(!dev.matches_label("boot"));
        assert!(dev.matches_bare_id("sda1"));
        assert!(dev.matches_bare_id("/dev/sda1"));
    }
}
