//! Discover server (§4.9): a Unix-domain stream socket, persistent
//! multi-client fan-out, `SO_PEERCRED`-based privilege gating, and password
//! authentication with a 5-minute `can_modify` expiry.
//!
//! Grounded on `examples/original_source/discover/discover-server.c` for
//! the connection bookkeeping (accept → auth-check → snapshot → live
//! stream), the non-privileged action allow-list, and the auth state
//! machine (`Request`/`Set`/`Decrypt`, 5 min timeout). Generalized from the
//! teacher's `examples/containers-bootc/src/daemon/mod.rs`/`src/ipc.rs`
//! accept-one-client-then-exit shape to a persistent server that holds a
//! `Vec<Client>` and fans every state change out to all of them, since
//! spec.md §4.9/§5 explicitly calls for multiple simultaneous clients.
//! `SO_PEERCRED` credential lookup uses `nix::sys::socket::getsockopt` with
//! `PeerCredentials`, the pinned crate's equivalent of the original's raw
//! `getsockopt(SOL_SOCKET, SO_PEERCRED, ...)` call.

use std::collections::VecDeque;
use std::ffi::{CStr, CString};
use std::io::{ErrorKind, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::time::{Duration, Instant};

use camino::Utf8Path;

use crate::config::ConfigStore;
use crate::device_handler::{BootTaskHandle, DeviceHandler, Notifier};
use crate::env::Env;
use crate::error::{AuthError, ProtocolError};
use crate::loader::TftpFlavor;
use crate::model::{BootOption, Config, DiscoverDevice, Status, SystemInfo};
use crate::wire::{self, Action, AuthMessage, Message};

const AUTH_EXPIRY: Duration = Duration::from_secs(5 * 60);
/// Status backlog replayed to newly connected clients; bounded so a
/// long-running daemon's memory use doesn't grow without limit (§4.9).
const STATUS_BACKLOG_CAP: usize = 10_000;

/// Actions a non-privileged (non-UID-0, unauthenticated) client may still
/// issue when `restrict_clients` is set (§4.9).
fn is_unprivileged_allowed(action: Action) -> bool {
    matches!(action, Action::Boot | Action::CancelDefault | Action::Authenticate)
}

struct Client {
    stream: UnixStream,
    can_modify: bool,
    auth_deadline: Option<Instant>,
    remote_closed: bool,
    read_buf: Vec<u8>,
}

impl Client {
    fn write_message(&mut self, msg: &Message) {
        if self.remote_closed {
            return;
        }
        if wire::write_message(&mut self.stream, msg).is_err() {
            self.remote_closed = true;
        }
    }
}

pub struct DiscoverServer {
    listener: UnixListener,
    clients: Vec<Client>,
    status_backlog: VecDeque<Status>,
    config_store: Box<dyn ConfigStore>,
}

impl DiscoverServer {
    /// Bind the socket at `path`, group `petitgroup` mode `0660` when that
    /// group exists (`discover_server_init`); non-fatal if it doesn't, same
    /// as the original.
    pub fn bind(path: &Utf8Path, config_store: Box<dyn ConfigStore>) -> std::io::Result<Self> {
        let _ = std::fs::remove_file(path);
        let listener = UnixListener::bind(path.as_std_path())?;
        listener.set_nonblocking(true)?;
        set_group_and_mode(path);
        Ok(DiscoverServer {
            listener,
            clients: Vec::new(),
            status_backlog: VecDeque::new(),
            config_store,
        })
    }

    pub fn fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }

    pub fn client_fds(&self) -> Vec<RawFd> {
        self.clients.iter().map(|c| c.stream.as_raw_fd()).collect()
    }

    /// Accept as many pending connections as are queued, never blocking.
    pub fn accept_all(&mut self, config: &Config, sysinfo: &SystemInfo, devices: &[DiscoverDevice]) {
        loop {
            match self.listener.accept() {
                Ok((stream, _addr)) => self.accept_one(stream, config, sysinfo, devices),
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::warn!("discover server accept failed: {e}");
                    break;
                }
            }
        }
    }

    fn accept_one(&mut self, stream: UnixStream, config: &Config, sysinfo: &SystemInfo, devices: &[DiscoverDevice]) {
        let _ = stream.set_nonblocking(true);
        let can_modify = if config.restrict_clients {
            peer_is_root(&stream).unwrap_or_else(|e| {
                log::warn!("failed to get peer credentials, restricting client: {e}");
                false
            })
        } else {
            true
        };

        let mut client = Client {
            stream,
            can_modify,
            auth_deadline: None,
            remote_closed: false,
            read_buf: Vec::new(),
        };

        client.write_message(&wire::encode_authenticate(&AuthMessage::Response { authenticated: can_modify }));
        client.write_message(&wire::encode_system_info(sysinfo));
        client.write_message(&wire::encode_config(config));
        for device in devices {
            client.write_message(&wire::encode_device_add(device));
            for opt in &device.boot_options {
                client.write_message(&boot_option_add_message(&device.id, &opt.option));
            }
        }
        for status in &self.status_backlog {
            client.write_message(&wire::encode_status(status));
        }

        self.clients.push(client);
    }

    /// Read and dispatch whatever whole messages are available from each
    /// client, closing any that disconnected or misbehaved. Returns the
    /// boot task handles started this round, if any.
    pub fn poll_clients(&mut self, env: &Env, flavor: TftpFlavor, handler: &mut DeviceHandler) -> Vec<BootTaskHandle> {
        let mut started = Vec::new();
        self.expire_auth();

        for idx in 0..self.clients.len() {
            loop {
                match read_one_message(&mut self.clients[idx]) {
                    Ok(Some(msg)) => {
                        if let Some(handle) = self.dispatch(idx, env, flavor, handler, msg) {
                            started.push(handle);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        log::debug!("client protocol error, closing connection: {e}");
                        self.clients[idx].remote_closed = true;
                        break;
                    }
                }
            }
        }

        self.clients.retain(|c| !c.remote_closed);
        started
    }

    fn expire_auth(&mut self) {
        let now = Instant::now();
        for client in &mut self.clients {
            if let Some(deadline) = client.auth_deadline {
                if now >= deadline {
                    client.auth_deadline = None;
                    client.can_modify = false;
                    client.write_message(&wire::encode_authenticate(&AuthMessage::Response { authenticated: false }));
                }
            }
        }
    }

    fn dispatch(
        &mut self,
        idx: usize,
        env: &Env,
        flavor: TftpFlavor,
        handler: &mut DeviceHandler,
        msg: Message,
    ) -> Option<BootTaskHandle> {
        let can_modify = self.clients[idx].can_modify;
        if !can_modify && !is_unprivileged_allowed(msg.action) {
            self.clients[idx].write_message(&wire::encode_status(&Status::error(
                "client must authenticate to make changes",
            )));
            return None;
        }

        match msg.action {
            Action::Boot => match wire::decode_boot_command(&msg.payload) {
                Ok(cmd) => return handler.on_boot_command(env, flavor, cmd),
                Err(e) => log::warn!("malformed boot command: {e}"),
            },
            Action::CancelDefault => handler.cancel_default(),
            Action::Config => match wire::decode_config(&msg.payload) {
                Ok(config) => {
                    if let Err(e) = self.config_store.save(&config) {
                        log::warn!("failed to persist config: {e}");
                    }
                    let config_for_clients = config.clone();
                    handler.update_config(config);
                    self.broadcast(&wire::encode_config(&config_for_clients));
                }
                Err(e) => log::warn!("malformed config update: {e}"),
            },
            Action::Reinit => handler.reinit(&mut ServerNotifier { server: self }),
            Action::AddUrl => match wire::decode_string_action(&msg.payload) {
                Ok(url) => handler.on_url(env, flavor, &mut ServerNotifier { server: self }, &url),
                Err(e) => log::warn!("malformed AddUrl: {e}"),
            },
            Action::TempAutoboot => match wire::decode_temp_autoboot(&msg.payload) {
                Ok(option_id) => {
                    if !handler.apply_temp_autoboot(&option_id) {
                        self.clients[idx]
                            .write_message(&wire::encode_status(&Status::error(format!("no such option: {option_id}"))));
                    }
                }
                Err(e) => log::warn!("malformed TempAutoboot: {e}"),
            },
            Action::PluginInstall => {
                self.clients[idx].write_message(&wire::encode_status(&Status::error(
                    "plugin installation is not supported",
                )));
            }
            Action::Authenticate => match wire::decode_authenticate(&msg.payload) {
                Ok(auth_msg) => self.handle_auth(idx, auth_msg),
                Err(e) => log::warn!("malformed authenticate message: {e}"),
            },
            other => log::warn!("unhandled client action {other:?}"),
        }
        None
    }

    fn handle_auth(&mut self, idx: usize, msg: AuthMessage) {
        let stored_hash = self.config_store.load().ok().and_then(|c| c.password_hash);
        match msg {
            AuthMessage::Request { password } => {
                let ok = match &stored_hash {
                    None => true,
                    Some(hash) => check_password(&password, hash),
                };
                let client = &mut self.clients[idx];
                client.can_modify = ok;
                client.auth_deadline = if ok { Some(Instant::now() + AUTH_EXPIRY) } else { None };
                client.write_message(&wire::encode_authenticate(&AuthMessage::Response { authenticated: ok }));
                if !ok {
                    client.write_message(&wire::encode_status(&Status::error(AuthError::WrongPassword.to_string())));
                }
            }
            AuthMessage::Set { old, new } => {
                let authorized = match &stored_hash {
                    None => true,
                    Some(hash) => old.as_deref().map(|p| check_password(p, hash)).unwrap_or(false),
                };
                if !authorized {
                    self.clients[idx]
                        .write_message(&wire::encode_status(&Status::error(AuthError::WrongPassword.to_string())));
                    return;
                }
                let mut config = self.config_store.load().unwrap_or_default();
                config.password_hash = new.filter(|p| !p.is_empty()).map(|p| hash_password(&p));
                if let Err(e) = self.config_store.save(&config) {
                    log::warn!("failed to persist new password: {e}");
                }
                self.broadcast(&wire::encode_config(&config));
            }
            AuthMessage::Decrypt { device_id, password: _ } => {
                if !self.clients[idx].can_modify {
                    self.clients[idx].write_message(&wire::encode_status(&Status::error(
                        AuthError::NotAuthorized.to_string(),
                    )));
                    return;
                }
                log::info!("LUKS unlock requested for {device_id}, but no encrypted-volume backend is wired up");
            }
            AuthMessage::Response { .. } => {}
        }
    }

    /// Push a fresh `SystemInfo` snapshot to every connected client (§4.8
    /// interface state changes, §4.7 device mount/unmount).
    pub fn broadcast_system_info(&mut self, sysinfo: &SystemInfo) {
        self.broadcast(&wire::encode_system_info(sysinfo));
    }

    fn broadcast(&mut self, msg: &Message) {
        for client in &mut self.clients {
            client.write_message(msg);
        }
    }
}

fn boot_option_add_message(_device_id: &str, opt: &BootOption) -> Message {
    let mut buf = Vec::new();
    wire::encode_boot_option(&mut buf, opt);
    Message {
        action: Action::BootOptionAdd,
        payload: buf,
    }
}

fn read_one_message(client: &mut Client) -> Result<Option<Message>, ProtocolError> {
    let mut chunk = [0u8; 4096];
    loop {
        match client.stream.read(&mut chunk) {
            Ok(0) => {
                client.remote_closed = true;
                return Ok(None);
            }
            Ok(n) => client.read_buf.extend_from_slice(&chunk[..n]),
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) => return Err(e.into()),
        }
    }

    if client.read_buf.len() < 8 {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes(client.read_buf[4..8].try_into().unwrap()) as usize;
    if client.read_buf.len() < 8 + payload_len {
        return Ok(None);
    }
    let frame: Vec<u8> = client.read_buf.drain(..8 + payload_len).collect();
    let mut cursor = std::io::Cursor::new(frame);
    wire::read_message(&mut cursor).map(Some)
}

fn set_group_and_mode(path: &Utf8Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(group) = nix::unistd::Group::from_name("petitgroup") {
        if let Some(group) = group {
            let _ = nix::unistd::chown(path.as_std_path(), None, Some(group.gid));
            let _ = std::fs::set_permissions(path.as_std_path(), std::fs::Permissions::from_mode(0o660));
        }
    }
}

fn peer_is_root(stream: &UnixStream) -> std::io::Result<bool> {
    use nix::sys::socket::{getsockopt, sockopt::PeerCredentials};
    let creds = getsockopt(stream, PeerCredentials).map_err(std::io::Error::from)?;
    Ok(creds.uid() == 0)
}

/// crypt(3) is the same primitive the original's `crypt/crypt.c` wraps;
/// `libc::crypt` is the direct FFI binding already available via the
/// pinned `libc` dependency.
fn hash_password(password: &str) -> String {
    crypt(password, "$6$petitboot$")
}

fn check_password(password: &str, stored_hash: &str) -> bool {
    crypt(password, stored_hash) == stored_hash
}

fn crypt(password: &str, salt: &str) -> String {
    let Ok(key) = CString::new(password) else { return String::new() };
    let Ok(salt) = CString::new(salt) else { return String::new() };
    unsafe {
        let result = libc::crypt(key.as_ptr(), salt.as_ptr());
        if result.is_null() {
            String::new()
        } else {
            CStr::from_ptr(result).to_string_lossy().into_owned()
        }
    }
}

/// Adapts `&mut DiscoverServer` to `Notifier` for calls (like `reinit`)
/// that need to broadcast through the device handler's generic sink.
struct ServerNotifier<'a> {
    server: &'a mut DiscoverServer,
}

impl Notifier for ServerNotifier<'_> {
    fn device_added(&mut self, device: &DiscoverDevice) {
        self.server.broadcast(&wire::encode_device_add(device));
    }
    fn device_removed(&mut self, device_id: &str) {
        self.server.broadcast(&wire::encode_device_remove(device_id));
    }
    fn boot_option_added(&mut self, device_id: &str, option: &BootOption) {
        self.server.broadcast(&boot_option_add_message(device_id, option));
    }
    fn boot_option_removed(&mut self, _option_id: &str) {}
    fn status(&mut self, status: Status) {
        self.server.push_status(status);
    }
}

impl DiscoverServer {
    fn push_status(&mut self, status: Status) {
        self.broadcast(&wire::encode_status(&status));
        self.status_backlog.push_back(status);
        if self.status_backlog.len() > STATUS_BACKLOG_CAP {
            self.status_backlog.pop_front();
        }
    }
}

impl Notifier for DiscoverServer {
    fn device_added(&mut self, device: &DiscoverDevice) {
        self.broadcast(&wire::encode_device_add(device));
    }
    fn device_removed(&mut self, device_id: &str) {
        self.broadcast(&wire::encode_device_remove(device_id));
    }
    fn boot_option_added(&mut self, device_id: &str, option: &BootOption) {
        self.broadcast(&boot_option_add_message(device_id, option));
    }
    fn boot_option_removed(&mut self, _option_id: &str) {}
    fn status(&mut self, status: Status) {
        self.push_status(status);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn password_round_trips() {
        let hash = hash_password("hunter2");
        assert!(check_password("hunter2", &hash));
        assert!(!check_password("wrong", &hash));
    }

    #[test]
    fn status_backlog_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let sock_path = camino::Utf8PathBuf::from_path_buf(dir.path().join("sock")).unwrap();
        let store = crate::config::JsonFileConfigStore::new(dir.path().join("cfg.json"));
        let mut server = DiscoverServer::bind(&sock_path, Box::new(store)).unwrap();
        for i in 0..(STATUS_BACKLOG_CAP + 10) {
            server.push_status(Status::info(format!("tick {i}")));
        }
        assert_eq!(server.status_backlog.len(), STATUS_BACKLOG_CAP);
        assert_eq!(server.status_backlog.front().unwrap().message, "tick 10");
    }

    #[test]
    fn unprivileged_clients_may_boot_and_cancel_but_nothing_else() {
        assert!(is_unprivileged_allowed(Action::Boot));
        assert!(is_unprivileged_allowed(Action::CancelDefault));
        assert!(!is_unprivileged_allowed(Action::Config));
        assert!(!is_unprivileged_allowed(Action::Reinit));
    }
}
