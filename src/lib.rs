//! petitboot's discovery daemon: watches for bootable devices and network
//! interfaces, parses whatever bootloader configuration they carry, and
//! drives the kexec handoff when a user (or the autoboot countdown) picks
//! an option.
//!
//! Laid out the way `bootupd` (our nearest architectural relative) lays out
//! its daemon: `lib.rs` is the real crate, `main.rs` is a thin entry point
//! that parses arguments and calls into it.

#![deny(unused_must_use)]
#![allow(clippy::style)]

mod boot_executor;
mod config;
mod device_handler;
mod env;
mod error;
mod events;
mod loader;
mod model;
mod network;
mod parser;
mod process;
mod resolver;
mod server;
mod sysinfo;
mod url;
mod waitset;
mod wire;

use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use clap::Parser;

use crate::boot_executor::RealBootExecutor;
use crate::config::{ConfigStore, JsonFileConfigStore};
use crate::device_handler::{DeviceHandler, Notifier};
use crate::env::{Cli, Env};
use crate::events::{HotplugEvent, UdevSource, UserEventSource};
use crate::model::{DeviceType, SystemInfo};
use crate::network::NetworkManager;
use crate::server::DiscoverServer;
use crate::waitset::{Wake, WaitSet};

pub const DAEMON_NAME: &str = "petitboot-discover";

/// Binary entrypoint, used by `main.rs`.
pub fn run<T>(args: impl IntoIterator<Item = T>) -> anyhow::Result<()>
where
    T: Into<std::ffi::OsString> + Clone,
{
    let cli = Cli::parse_from(args);
    env::init_logging(&cli)?;
    let env = Env::from_cli(&cli);
    run_daemon(env)
}

/// Assemble every source, bind the discover server, and run the
/// cooperative event loop (§5) until a fatal I/O error takes the daemon
/// down. Never returns `Ok` in normal operation; like the source daemon,
/// the process is meant to be restarted by the service manager.
fn run_daemon(env: Env) -> anyhow::Result<()> {
    let config_store: Box<dyn ConfigStore> = Box::new(JsonFileConfigStore::new(env.config_path.as_std_path().to_path_buf()));
    let config = config_store.load()?;
    let tftp_flavor = loader::probe_tftp_flavor(&env);
    let executor = RealBootExecutor;

    let mut handler = DeviceHandler::new(config.clone(), env.autoboot_enabled_at_start);
    let mut network = NetworkManager::new(&env, &config.network)?;
    let mut udev = UdevSource::new()?;
    let user_events = UserEventSource::bind(&env.user_event_socket_path)?;
    let mut server = DiscoverServer::bind(&env.client_socket_path, config_store)?;

    let mut sysinfo = SystemInfo::default();
    sysinfo::gather_identity(&mut sysinfo);

    let mut waitset = WaitSet::new(Duration::from_secs(1))?;
    waitset.register(network.fd())?;
    waitset.register(udev.fd())?;
    waitset.register(user_events.fd())?;
    waitset.register(server.fd())?;

    let mut client_tokens: HashMap<RawFd, waitset::SourceId> = HashMap::new();

    log::info!("{DAEMON_NAME} started, autoboot {}", if handler.autoboot_enabled { "enabled" } else { "disabled" });

    loop {
        sync_client_tokens(&mut waitset, &mut client_tokens, &server.client_fds())?;

        let wakes = waitset.wait()?;
        if wakes.is_empty() {
            continue;
        }

        drain_udev(&env, &mut udev, &mut handler, &mut server, &mut sysinfo);
        drain_network(&env, &mut network, &config.network, &mut sysinfo, &mut server);
        drain_user_events(&env, tftp_flavor, &user_events, &mut handler, &mut server);

        server.accept_all(handler.config(), &sysinfo, &handler.devices);
        server.poll_clients(&env, tftp_flavor, &mut handler);

        if wakes.iter().any(|w| matches!(w, Wake::Tick)) {
            for status in handler.tick(&env, tftp_flavor) {
                server.status(status);
            }
            if let Some(status) = handler.poll_pending_boot(&env, tftp_flavor, &executor) {
                server.status(status);
            }
        }
    }
}

/// Keep `WaitSet`'s registered fds in sync with however many clients are
/// currently connected: a new connection is registered, a closed one is
/// deregistered. The discover socket itself has no fixed cardinality, so
/// unlike the network/udev/user-event sources it can't be registered once
/// up front.
fn sync_client_tokens(waitset: &mut WaitSet, tokens: &mut HashMap<RawFd, waitset::SourceId>, current: &[RawFd]) -> std::io::Result<()> {
    for &fd in current {
        if !tokens.contains_key(&fd) {
            let id = waitset.register(fd)?;
            tokens.insert(fd, id);
        }
    }
    let stale: Vec<RawFd> = tokens.keys().copied().filter(|fd| !current.contains(fd)).collect();
    for fd in stale {
        let _ = waitset.deregister(fd);
        tokens.remove(&fd);
    }
    Ok(())
}

fn drain_udev(env: &Env, udev: &mut UdevSource, handler: &mut DeviceHandler, server: &mut DiscoverServer, sysinfo: &mut SystemInfo) {
    for event in udev.poll() {
        match event {
            HotplugEvent::Add(device) => {
                sysinfo::on_device_add(sysinfo, &device, false, None);
                handler.on_device_add(env, server, device);
            }
            HotplugEvent::Remove(device_id) => {
                if let Some(device) = handler.devices.iter().find(|d| d.id == device_id).cloned() {
                    sysinfo::on_device_remove(sysinfo, &device);
                }
                handler.on_device_remove(server, &device_id);
            }
        }
    }
    server.broadcast_system_info(sysinfo);
}

fn drain_network(env: &Env, network: &mut NetworkManager, config: &model::NetworkConfig, sysinfo: &mut SystemInfo, server: &mut DiscoverServer) {
    let events = network.poll(env, config);
    if events.is_empty() {
        return;
    }
    for iface in &network.interfaces {
        let link_up = iface.state == network::IfState::Configured;
        let mut dev = model::DiscoverDevice::new(iface.mac_string(), DeviceType::Network);
        dev.label = Some(iface.name.clone());
        sysinfo::on_device_add(sysinfo, &dev, link_up, None);
    }
    server.broadcast_system_info(sysinfo);
}

fn drain_user_events(env: &Env, flavor: loader::TftpFlavor, user_events: &UserEventSource, handler: &mut DeviceHandler, server: &mut DiscoverServer) {
    for event in user_events.poll() {
        handler.on_event(env, flavor, server, event);
    }
}
