//! Device handler (§4.7): the pipeline hub. Owns every known device, the
//! queue of boot options still waiting on a cross-device resource, the
//! autoboot countdown, and the in-flight boot task.
//!
//! Grounded on `examples/original_source/discover/device-handler.c`'s
//! `device_handler_add_device`/`discover_context`/default-selection shape,
//! reimplemented against the `Parser`/`Resource` model the parser and
//! resolver modules already define.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use camino::Utf8PathBuf;

use crate::boot_executor::{BootExecutor, KexecImage};
use crate::env::Env;
use crate::error::{FetchError, MountError};
use crate::loader::{self, LoadHandle, LoadResult, LoadStatus, TftpFlavor};
use crate::model::{
    BootCommand, BootOption, BootPriority, Config, DeviceType, DiscoverBootOption, DiscoverDevice, Event, EventAction, Resource, Status,
};
use crate::parser::{self, DiscoverContext, Parser, PARSERS};

/// Broadcast sink the handler reports to; `server.rs` implements this to
/// fan results out to connected clients.
pub trait Notifier {
    fn device_added(&mut self, device: &DiscoverDevice);
    fn device_removed(&mut self, device_id: &str);
    fn boot_option_added(&mut self, device_id: &str, option: &BootOption);
    fn boot_option_removed(&mut self, option_id: &str);
    fn status(&mut self, status: Status);
}

/// No-op sink for tests and for running headless.
pub struct NullNotifier;
impl Notifier for NullNotifier {
    fn device_added(&mut self, _: &DiscoverDevice) {}
    fn device_removed(&mut self, _: &str) {}
    fn boot_option_added(&mut self, _: &str, _: &BootOption) {}
    fn boot_option_removed(&mut self, _: &str) {}
    fn status(&mut self, _: Status) {}
}

fn find_parser(name: &str) -> Option<&'static dyn parser::Parser> {
    PARSERS.iter().copied().find(|p| p.name() == name)
}

/// §4.7's opaque `BootTaskHandle(u64)` (open question 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootTaskHandle(pub u64);

static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

fn next_handle() -> BootTaskHandle {
    BootTaskHandle(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
}

enum Phase {
    Kernel(LoadHandle),
    Initrd(LoadHandle),
    Dtb(LoadHandle),
    Exec,
    Done,
}

struct Loaded {
    path: Option<Utf8PathBuf>,
    cleanup: bool,
}

impl Loaded {
    fn from_result(r: LoadResult) -> Self {
        Loaded {
            path: r.local_path,
            cleanup: r.cleanup_local,
        }
    }
}

/// Everything a boot task needs that isn't already a transfer tool
/// argument: resolved resource URLs (kernel mandatory, initrd/dtb
/// optional) plus the append line and a name for status messages. Built
/// from a `DiscoverBootOption` (which still carries its `dtb` resource —
/// the wire-shape `BootOption` doesn't, see `model.rs`) or overridden by
/// an explicit `BootCommand` from a client.
pub struct BootSpec {
    pub id: String,
    pub name: String,
    pub boot_image: String,
    pub initrd: Option<String>,
    pub dtb: Option<String>,
    pub boot_args: Option<String>,
}

impl BootSpec {
    fn from_option(opt: &DiscoverBootOption, cmd: Option<&BootCommand>) -> Option<Self> {
        let boot_image = cmd
            .and_then(|c| c.boot_image_file.clone())
            .or_else(|| opt.boot_image.as_ref().and_then(Resource::resolved_url).map(crate::url::Url::render))?;
        let initrd = cmd
            .and_then(|c| c.initrd_file.clone())
            .or_else(|| opt.initrd.as_ref().and_then(Resource::resolved_url).map(crate::url::Url::render));
        let dtb = cmd
            .and_then(|c| c.dtb_file.clone())
            .or_else(|| opt.dtb.as_ref().and_then(Resource::resolved_url).map(crate::url::Url::render));
        let boot_args = cmd.and_then(|c| c.boot_args.clone()).or_else(|| opt.option.boot_args.clone());
        Some(BootSpec {
            id: opt.option.id.clone(),
            name: opt.option.name.clone(),
            boot_image,
            initrd,
            dtb,
            boot_args,
        })
    }
}

/// The 3-phase boot task of §4.7: load kernel, load initrd, load dtb, kexec
/// -l, then hand off execution.
pub struct BootTask {
    pub handle: BootTaskHandle,
    pub spec: BootSpec,
    pub is_default_initiated: bool,
    phase: Phase,
    kernel: Option<Loaded>,
    initrd: Option<Loaded>,
    dtb: Option<Loaded>,
    cancelled: bool,
}

impl BootTask {
    fn start(env: &Env, flavor: TftpFlavor, spec: BootSpec, is_default_initiated: bool) -> Result<Self, FetchError> {
        let url = crate::url::Url::parse(&spec.boot_image).map_err(|_| FetchError::NoTool(crate::url::Scheme::File))?;
        let handle = loader::load_async(env, flavor, &url, format!("loading kernel for {}", spec.id))?;
        Ok(BootTask {
            handle: next_handle(),
            spec,
            is_default_initiated,
            phase: Phase::Kernel(handle),
            kernel: None,
            initrd: None,
            dtb: None,
            cancelled: false,
        })
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
        match &mut self.phase {
            Phase::Kernel(h) | Phase::Initrd(h) | Phase::Dtb(h) => h.cancel(),
            Phase::Exec | Phase::Done => {}
        }
    }

    fn cleanup_all(&mut self) {
        for loaded in [self.kernel.take(), self.initrd.take(), self.dtb.take()].into_iter().flatten() {
            if loaded.cleanup {
                if let Some(path) = loaded.path {
                    let _ = std::fs::remove_file(path);
                }
            }
        }
    }

    /// Advance the state machine by one tick. Returns `Some(status)` on
    /// every phase transition (including the terminal one); the caller
    /// broadcasts it. Never blocks — each phase's `LoadHandle` is polled,
    /// not waited on.
    pub fn poll(&mut self, env: &Env, flavor: TftpFlavor, executor: &dyn BootExecutor) -> Option<Status> {
        match &mut self.phase {
            Phase::Kernel(handle) => {
                let Some(result) = handle.poll() else {
                    return handle.progress().map(|p| progress_status("kernel", p));
                };
                if result.status != LoadStatus::Ok {
                    self.cleanup_all();
                    self.phase = Phase::Done;
                    return Some(terminal_status(result.status, "kernel"));
                }
                self.kernel = Some(Loaded::from_result(result));
                self.begin_initrd(env, flavor)
            }
            Phase::Initrd(handle) => {
                let Some(result) = handle.poll() else {
                    return handle.progress().map(|p| progress_status("initrd", p));
                };
                if result.status != LoadStatus::Ok {
                    self.cleanup_all();
                    self.phase = Phase::Done;
                    return Some(terminal_status(result.status, "initrd"));
                }
                self.initrd = Some(Loaded::from_result(result));
                self.begin_dtb(env, flavor)
            }
            Phase::Dtb(handle) => {
                let Some(result) = handle.poll() else {
                    return handle.progress().map(|p| progress_status("dtb", p));
                };
                if result.status != LoadStatus::Ok {
                    self.cleanup_all();
                    self.phase = Phase::Done;
                    return Some(terminal_status(result.status, "dtb"));
                }
                self.dtb = Some(Loaded::from_result(result));
                Some(self.run_kexec(env, executor))
            }
            Phase::Exec => Some(self.run_kexec(env, executor)),
            Phase::Done => None,
        }
    }

    fn begin_initrd(&mut self, env: &Env, flavor: TftpFlavor) -> Option<Status> {
        if self.cancelled {
            self.cleanup_all();
            self.phase = Phase::Done;
            return Some(Status::error("boot cancelled"));
        }
        if let Some(url) = self.spec.initrd.clone() {
            match crate::url::Url::parse(&url).ok().and_then(|u| loader::load_async(env, flavor, &u, "loading initrd").ok()) {
                Some(handle) => {
                    self.phase = Phase::Initrd(handle);
                    Some(Status::info("loading initrd").with_progress(0))
                }
                None => {
                    self.cleanup_all();
                    self.phase = Phase::Done;
                    Some(Status::error("failed to start initrd fetch"))
                }
            }
        } else {
            self.begin_dtb(env, flavor)
        }
    }

    fn begin_dtb(&mut self, env: &Env, flavor: TftpFlavor) -> Option<Status> {
        if self.cancelled {
            self.cleanup_all();
            self.phase = Phase::Done;
            return Some(Status::error("boot cancelled"));
        }
        if let Some(url) = self.spec.dtb.clone() {
            match crate::url::Url::parse(&url).ok().and_then(|u| loader::load_async(env, flavor, &u, "loading device tree").ok()) {
                Some(handle) => {
                    self.phase = Phase::Dtb(handle);
                    Some(Status::info("loading device tree").with_progress(0))
                }
                None => {
                    self.cleanup_all();
                    self.phase = Phase::Done;
                    Some(Status::error("failed to start dtb fetch"))
                }
            }
        } else {
            self.phase = Phase::Exec;
            Some(Status::info("loading device tree").with_progress(100))
        }
    }

    fn run_kexec(&mut self, env: &Env, executor: &dyn BootExecutor) -> Status {
        if self.cancelled {
            self.cleanup_all();
            self.phase = Phase::Done;
            return Status::error("boot cancelled");
        }
        let kernel = self.kernel.as_ref().and_then(|k| k.path.as_ref());
        let Some(kernel) = kernel else {
            self.phase = Phase::Done;
            return Status::error("no kernel image loaded");
        };
        let initrd = self.initrd.as_ref().and_then(|k| k.path.as_ref()).map(|p| p.as_str());
        let dtb = self.dtb.as_ref().and_then(|k| k.path.as_ref()).map(|p| p.as_str());
        let image = KexecImage {
            kernel: kernel.as_str(),
            initrd,
            dtb,
            append: self.spec.boot_args.as_deref(),
        };
        let result = executor.kexec_load(env, &image).map_err(|e| e.to_string()).and_then(|_| executor.reboot(env).map_err(|e| e.to_string()));
        self.cleanup_all();
        self.phase = Phase::Done;
        match result {
            Ok(()) => Status::info(format!("booting {}", self.spec.name)).with_progress(100),
            Err(e) => Status::error(format!("boot failed: {e}")),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.phase, Phase::Done)
    }
}

fn terminal_status(status: LoadStatus, what: &str) -> Status {
    match status {
        LoadStatus::Cancelled => Status::error(format!("{what} fetch cancelled")),
        _ => Status::error(format!("failed to fetch {what}")),
    }
}

fn progress_status(what: &str, p: crate::loader::Progress) -> Status {
    Status::info(format!("loading {what}: {}% ({:.0}{})", p.percent, p.size, p.unit)).with_progress(p.percent as i32)
}

struct DefaultCandidate {
    device_id: String,
    option_id: String,
    priority: i32,
}

/// Read-write token (§4.7 `request_write`): dropping it remounts the
/// device read-only.
pub struct WriteToken {
    env: Env,
    device_path: String,
    mount_point: Utf8PathBuf,
}

impl Drop for WriteToken {
    fn drop(&mut self) {
        let argv = vec![
            self.env.tools.mount.to_string_lossy().into_owned(),
            "-o".into(),
            "remount,ro".into(),
            self.device_path.clone(),
            self.mount_point.to_string(),
        ];
        if let Err(e) = crate::process::run_sync(&self.env, &argv) {
            log::warn!("failed to remount {} read-only: {e}", self.mount_point);
        }
    }
}

/// Evaluate a device against the ordered boot-priority list. `None` means
/// vetoed (a matching entry had a negative priority).
fn evaluate_priority(config: &Config, device: &DiscoverDevice) -> Option<i32> {
    let mut total = 0;
    let mut matched = false;
    for pref in &config.boot_priorities {
        let (is_match, priority) = match pref {
            BootPriority::DeviceType { device_type, priority } => (device.device_type == *device_type, *priority),
            BootPriority::Uuid { uuid, priority } => (device.uuid.as_deref() == Some(uuid.as_str()), *priority),
            BootPriority::Mac { mac, priority } => (device.is_network() && device.id == *mac, *priority),
        };
        if is_match {
            if priority < 0 {
                return None;
            }
            matched = true;
            total += priority;
        }
    }
    Some(if matched { total } else { 0 })
}

/// Parse `/proc/self/mounts` for an existing mountpoint of `device_path`.
fn already_mounted(mounts: &str, device_path: &str) -> Option<Utf8PathBuf> {
    for line in mounts.lines() {
        let mut cols = line.split_whitespace();
        let dev = cols.next()?;
        let mountpoint = cols.next()?;
        if dev == device_path {
            return Some(Utf8PathBuf::from(mountpoint));
        }
    }
    None
}

fn mount_device(env: &Env, device: &mut DiscoverDevice) -> Result<(), MountError> {
    let Some(device_path) = device.device_path.clone() else {
        return Err(MountError::NoFsType);
    };
    let mounts = std::fs::read_to_string("/proc/self/mounts").unwrap_or_default();
    if let Some(existing) = already_mounted(&mounts, &device_path) {
        device.mount.mounted = true;
        device.mount.mount_path = Some(existing);
        device.mount.mounted_rw = false;
        device.mount.unmount_on_drop = false;
        return Ok(());
    }

    let fstype = device.params.get("ID_FS_TYPE").cloned();
    let leaf = device_path.rsplit('/').next().unwrap_or(&device_path).to_string();
    let mount_point = env.mount_point_for(&leaf);
    std::fs::create_dir_all(&mount_point).map_err(MountError::Io)?;

    let mut argv = vec![env.tools.mount.to_string_lossy().into_owned()];
    if let Some(fstype) = &fstype {
        argv.push("-t".into());
        argv.push(fstype.clone());
    }
    argv.push("-o".into());
    argv.push("ro,silent".into());
    argv.push(device_path.clone());
    argv.push(mount_point.to_string());

    let (status, _) = crate::process::run_sync(env, &argv).map_err(|e| MountError::Failed {
        device_path: device_path.clone(),
        fstype,
        reason: e.to_string(),
    })?;
    if !status.success() {
        return Err(MountError::Failed {
            device_path,
            fstype,
            reason: format!("mount exited with {status}"),
        });
    }
    device.mount.mounted = true;
    device.mount.mount_path = Some(mount_point);
    device.mount.mounted_rw = false;
    device.mount.unmount_on_drop = true;
    Ok(())
}

/// The pipeline hub (§4.7).
pub struct DeviceHandler {
    pub devices: Vec<DiscoverDevice>,
    unresolved: VecDeque<DiscoverBootOption>,
    default_candidate: Option<DefaultCandidate>,
    pub sec_to_boot: u32,
    pub autoboot_enabled: bool,
    pub pending_boot: Option<BootTask>,
    pub pending_is_default: bool,
    config: Config,
}

impl DeviceHandler {
    pub fn new(config: Config, autoboot_enabled_at_start: bool) -> Self {
        DeviceHandler {
            devices: Vec::new(),
            unresolved: VecDeque::new(),
            default_candidate: None,
            sec_to_boot: 0,
            autoboot_enabled: autoboot_enabled_at_start && config.autoboot_enabled,
            pending_boot: None,
            pending_is_default: false,
            config,
        }
    }

    fn commit_option(&mut self, notifier: &mut dyn Notifier, mut opt: DiscoverBootOption) {
        if opt.all_resolved() {
            opt.finalize();
            let device_id = opt.origin_device_id.clone();
            let option = opt.option.clone();
            if let Some(device) = self.devices.iter_mut().find(|d| d.id == device_id) {
                device.boot_options.push(opt);
            }
            notifier.boot_option_added(&device_id, &option);
            if option.is_default {
                self.consider_default(&device_id, &option.id);
            }
        } else if find_parser(opt.parser_name).is_some() {
            self.unresolved.push_back(opt);
        }
    }

    fn consider_default(&mut self, device_id: &str, option_id: &str) {
        if !self.autoboot_enabled {
            return;
        }
        let Some(device) = self.devices.iter().find(|d| d.id == device_id) else {
            return;
        };
        let Some(priority) = evaluate_priority(&self.config, device) else {
            return;
        };
        match &self.default_candidate {
            None => {
                self.default_candidate = Some(DefaultCandidate {
                    device_id: device_id.to_string(),
                    option_id: option_id.to_string(),
                    priority,
                });
                self.sec_to_boot = self.config.autoboot_timeout_sec;
            }
            Some(cur) if priority > cur.priority => {
                self.default_candidate = Some(DefaultCandidate {
                    device_id: device_id.to_string(),
                    option_id: option_id.to_string(),
                    priority,
                });
                self.sec_to_boot += 2;
            }
            Some(_) => {}
        }
    }

    /// Re-attempt every parser's `resolve_resource` for each unresolved
    /// option against the newly-arrived device (§4.6). Idempotent: a
    /// device that matches nothing leaves the queue unchanged.
    fn sweep_unresolved(&mut self, notifier: &mut dyn Notifier, device: &DiscoverDevice) {
        let pending: Vec<DiscoverBootOption> = self.unresolved.drain(..).collect();
        for mut opt in pending {
            if let Some(parser) = find_parser(opt.parser_name) {
                for slot in [&mut opt.boot_image, &mut opt.initrd, &mut opt.dtb, &mut opt.icon] {
                    if let Some(resource) = slot {
                        if !resource.is_resolved() {
                            if let Some(resolved) = parser.resolve_resource(device, resource) {
                                *resource = resolved;
                            }
                        }
                    }
                }
            }
            self.commit_option(notifier, opt);
        }
    }

    pub fn on_device_add(&mut self, env: &Env, notifier: &mut dyn Notifier, mut device: DiscoverDevice) {
        if device.is_block() {
            if let Err(e) = mount_device(env, &mut device) {
                log::warn!("mount failed for {}: {e}", device.id);
                return;
            }
        }
        self.devices.push(device);
        let device = self.devices.last().unwrap().clone();

        self.sweep_unresolved(notifier, &device);

        let mut ctx = DiscoverContext::new(&device);
        if let Some(mount_path) = device.mount.mount_path.clone() {
            for p in PARSERS {
                if let Some((_, buf)) = parser::discover_file(mount_path.as_path(), p.conf_filenames()) {
                    p.parse(&mut ctx, &buf);
                }
            }
        }
        let options = std::mem::take(&mut ctx.options);
        notifier.device_added(&device);
        for opt in options {
            self.commit_option(notifier, opt);
        }
    }

    pub fn on_device_remove(&mut self, notifier: &mut dyn Notifier, device_id: &str) {
        self.unresolved.retain(|opt| opt.origin_device_id != device_id);
        self.devices.retain(|d| d.id != device_id);
        notifier.device_removed(device_id);
    }

    pub fn on_boot_command(&mut self, env: &Env, flavor: TftpFlavor, cmd: BootCommand) -> Option<BootTaskHandle> {
        let opt = self.devices.iter().flat_map(|d| &d.boot_options).find(|o| o.option.id == cmd.option_id)?;
        let spec = BootSpec::from_option(opt, Some(&cmd))?;
        if let Some(mut task) = self.pending_boot.take() {
            task.cancel();
        }
        match BootTask::start(env, flavor, spec, false) {
            Ok(task) => {
                let handle = task.handle;
                self.pending_is_default = false;
                self.pending_boot = Some(task);
                Some(handle)
            }
            Err(e) => {
                log::warn!("failed to start boot task: {e}");
                None
            }
        }
    }

    /// Called once per second by the event loop (§4.7's 1 s repeating
    /// timer). Returns the status lines to broadcast.
    pub fn tick(&mut self, env: &Env, flavor: TftpFlavor) -> Vec<Status> {
        let mut out = Vec::new();
        if self.pending_boot.is_none() {
            if let Some(cur) = &self.default_candidate {
                if self.sec_to_boot > 0 {
                    let option_name = self
                        .devices
                        .iter()
                        .flat_map(|d| &d.boot_options)
                        .find(|o| o.option.id == cur.option_id)
                        .map(|o| o.option.name.clone())
                        .unwrap_or_else(|| cur.option_id.clone());
                    out.push(Status::info(format!("Booting in {} sec: {option_name}", self.sec_to_boot)));
                    self.sec_to_boot -= 1;
                } else {
                    let spec = self
                        .devices
                        .iter()
                        .flat_map(|d| &d.boot_options)
                        .find(|o| o.option.id == cur.option_id)
                        .and_then(|o| BootSpec::from_option(o, None));
                    if let Some(spec) = spec {
                        match BootTask::start(env, flavor, spec, true) {
                            Ok(task) => {
                                self.pending_is_default = true;
                                self.pending_boot = Some(task);
                            }
                            Err(e) => out.push(Status::error(format!("failed to start default boot: {e}"))),
                        }
                    }
                }
            }
        }
        out
    }

    /// Advance the in-flight boot task, if any, by one step, clearing it
    /// once it reaches its terminal phase.
    pub fn poll_pending_boot(&mut self, env: &Env, flavor: TftpFlavor, executor: &dyn BootExecutor) -> Option<Status> {
        let task = self.pending_boot.as_mut()?;
        let status = task.poll(env, flavor, executor);
        if task.is_done() {
            self.pending_boot = None;
            self.pending_is_default = false;
        }
        status
    }

    /// Stop the countdown and disable autoboot (§4.7 `cancel_default`).
    pub fn cancel_default(&mut self) {
        self.default_candidate = None;
        self.autoboot_enabled = false;
        if self.pending_is_default {
            if let Some(task) = self.pending_boot.as_mut() {
                task.cancel();
            }
        }
    }

    pub fn request_write(&self, env: &Env, device_id: &str) -> Option<WriteToken> {
        let device = self.devices.iter().find(|d| d.id == device_id)?;
        let device_path = device.device_path.clone()?;
        let mount_point = device.mount.mount_path.clone()?;
        let argv = vec![
            env.tools.mount.to_string_lossy().into_owned(),
            "-o".into(),
            "remount,rw".into(),
            device_path.clone(),
            mount_point.to_string(),
        ];
        match crate::process::run_sync(env, &argv) {
            Ok((status, _)) if status.success() => Some(WriteToken {
                env: env.clone(),
                device_path,
                mount_point,
            }),
            _ => None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// `Action::Config`: replace the running configuration (§4.9). Boot
    /// priorities and the autoboot timeout take effect on the next
    /// countdown decision; already-armed countdowns are left alone.
    pub fn update_config(&mut self, config: Config) {
        self.config = config;
    }

    /// `device_handler_reinit` (`device-handler.c`): cancel any countdown,
    /// drop every device and unresolved option, and notify clients of the
    /// removals. Source rescanning (re-enumerating udev/network) is the
    /// caller's responsibility once this returns.
    pub fn reinit(&mut self, notifier: &mut dyn Notifier) {
        self.cancel_default();
        self.unresolved.clear();
        let ids: Vec<String> = self.devices.iter().map(|d| d.id.clone()).collect();
        self.devices.clear();
        for id in ids {
            notifier.device_removed(&id);
        }
    }

    /// `TempAutoboot(option_id)`: treat `option_id` as if it had just won
    /// the default-selection race, regardless of its configured priority.
    /// Used for a client-directed one-shot autoboot override (§4.9).
    pub fn apply_temp_autoboot(&mut self, option_id: &str) -> bool {
        let Some(device_id) = self
            .devices
            .iter()
            .find(|d| d.boot_options.iter().any(|o| o.option.id == option_id))
            .map(|d| d.id.clone())
        else {
            return false;
        };
        self.autoboot_enabled = true;
        self.default_candidate = Some(DefaultCandidate {
            device_id,
            option_id: option_id.to_string(),
            priority: i32::MAX,
        });
        self.sec_to_boot = self.config.autoboot_timeout_sec;
        true
    }

    /// Route a normalized event from the udev/network/user-event sources
    /// into the same device/boot-option pipeline a mounted device's config
    /// file feeds. Mirrors `event-parser.c`'s action dispatch.
    pub fn on_event(&mut self, env: &Env, flavor: TftpFlavor, notifier: &mut dyn Notifier, event: Event) {
        match event.action {
            EventAction::Add => {
                if !self.devices.iter().any(|d| d.id == event.device_id) {
                    let device = parser::user_event::synthesize_network_device(&event.device_id);
                    self.on_device_add(env, notifier, device);
                }
            }
            EventAction::Remove => self.on_device_remove(notifier, &event.device_id),
            EventAction::Conf => {
                let Some(device) = self.devices.iter().find(|d| d.id == event.device_id).cloned() else {
                    return;
                };
                let mut ctx = DiscoverContext::new(&device);
                ctx.event = Some(&event);
                parser::user_event::UserEventParser.parse(&mut ctx, &[]);
                let options = std::mem::take(&mut ctx.options);
                drop(ctx);
                for opt in options {
                    self.commit_option(notifier, opt);
                }
            }
            EventAction::Dhcp => self.on_dhcp_event(env, flavor, notifier, &event),
            EventAction::Boot => {
                if let Some(option_id) = event.params.get("option_id") {
                    let cmd = BootCommand {
                        option_id: option_id.clone(),
                        boot_image_file: None,
                        initrd_file: None,
                        dtb_file: None,
                        boot_args: None,
                        args_sig_file: None,
                        console: None,
                    };
                    self.on_boot_command(env, flavor, cmd);
                }
            }
            EventAction::Url => {
                if let Some(url) = event.params.get("url") {
                    self.on_url(env, flavor, notifier, url);
                }
            }
            EventAction::Sync | EventAction::Plugin => {
                log::info!("user event action {:?} for {} has no backing handler", event.action, event.device_id);
            }
        }
    }

    /// `pxe-parser.c`'s DHCP-driven config fetch: build the tftp config URL
    /// from `siaddr`/`pxeconffile`, fetch it synchronously (it is always a
    /// small text file), and parse it the same way a mounted config file
    /// would be parsed.
    fn on_dhcp_event(&mut self, env: &Env, flavor: TftpFlavor, notifier: &mut dyn Notifier, event: &Event) {
        let (Some(siaddr), Some(pxeconffile)) = (event.params.get("siaddr"), event.params.get("pxeconffile")) else {
            return;
        };
        let Ok(conf_url) = crate::url::Url::parse(&format!("tftp://{siaddr}/{pxeconffile}")) else {
            return;
        };

        let device = match self.devices.iter().find(|d| d.id == event.device_id) {
            Some(d) => d.clone(),
            None => {
                let d = parser::user_event::synthesize_network_device(&event.device_id);
                self.devices.push(d.clone());
                notifier.device_added(&d);
                d
            }
        };

        match loader::load(env, flavor, &conf_url) {
            Ok(result) if result.status == LoadStatus::Ok => {
                let Some(local_path) = result.local_path.as_ref() else { return };
                let Ok(buf) = std::fs::read(local_path.as_std_path()) else { return };
                let mut ctx = DiscoverContext::new(&device);
                ctx.conf_url = Some(conf_url);
                parser::pxe::PxeParser.parse(&mut ctx, &buf);
                let options = std::mem::take(&mut ctx.options);
                drop(ctx);
                for opt in options {
                    self.commit_option(notifier, opt);
                }
            }
            Ok(_) => log::warn!("pxe config fetch for {} did not complete", event.device_id),
            Err(e) => log::warn!("pxe config fetch failed for {}: {e}", event.device_id),
        }
    }

    /// `device_handler_process_url` (§4.7 `AddUrl`/user-event `url`): route
    /// a manually-supplied config URL to an interface via `ip route show to
    /// match <host>`, synthesizing a device for it if none is known yet,
    /// then fetch and parse the config the same way a DHCP-delivered pxe
    /// config is.
    pub fn on_url(&mut self, env: &Env, flavor: TftpFlavor, notifier: &mut dyn Notifier, url: &str) {
        let Ok(conf_url) = crate::url::Url::parse(url) else {
            notifier.status(Status::error("invalid config URL!"));
            return;
        };
        let Some(host) = conf_url.host.clone() else {
            notifier.status(Status::error("invalid config URL!"));
            return;
        };
        let Some(device_id) = route_device_for_host(env, &host) else {
            notifier.status(Status::error(format!("unable to route to host {host}")));
            return;
        };

        let device = match self.devices.iter().find(|d| d.id == device_id) {
            Some(d) => d.clone(),
            None => {
                let d = parser::user_event::synthesize_network_device(&device_id);
                self.devices.push(d.clone());
                notifier.device_added(&d);
                d
            }
        };

        match loader::load(env, flavor, &conf_url) {
            Ok(result) if result.status == LoadStatus::Ok => {
                let Some(local_path) = result.local_path.as_ref() else {
                    notifier.status(Status::error(format!("config file {url} has no content")));
                    return;
                };
                let Ok(buf) = std::fs::read(local_path.as_std_path()) else {
                    notifier.status(Status::error(format!("failed to read fetched config {url}")));
                    return;
                };
                let mut ctx = DiscoverContext::new(&device);
                ctx.conf_url = Some(conf_url);
                parser::pxe::PxeParser.parse(&mut ctx, &buf);
                let options = std::mem::take(&mut ctx.options);
                drop(ctx);
                for opt in options {
                    self.commit_option(notifier, opt);
                }
                notifier.status(Status::info(format!("config file {url} parsed")));
            }
            Ok(_) => notifier.status(Status::error(format!("unable to fetch config {url}"))),
            Err(e) => notifier.status(Status::error(format!("unable to fetch config {url}: {e}"))),
        }
    }
}

/// `device_from_addr`'s `ip route show to match <ip>` lookup: the outgoing
/// interface name for a host, parsed from `ip route`'s `... dev DEVNAME ...`
/// output. `None` if there's no route (the tool complains and exits
/// non-zero) or the output doesn't mention a device.
fn route_device_for_host(env: &Env, host: &str) -> Option<String> {
    let argv = vec![
        env.tools.ip.to_string_lossy().into_owned(),
        "route".into(),
        "show".into(),
        "to".into(),
        "match".into(),
        host.to_string(),
    ];
    let (status, out) = crate::process::run_sync(env, &argv).ok()?;
    if !status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&out);
    let mut tokens = text.split_whitespace();
    while let Some(tok) = tokens.next() {
        if tok == "dev" {
            return tokens.next().map(|s| s.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BootOption, DeviceType, DiscoverBootOption, MountState, Resource};
    use crate::url::Url;

    fn resolved_option(device_id: &str, id: &str, is_default: bool) -> DiscoverBootOption {
        DiscoverBootOption {
            boot_image: Some(Resource::Resolved(Url::parse("file:///vmlinuz").unwrap())),
            initrd: None,
            dtb: None,
            icon: None,
            option: BootOption {
                id: id.into(),
                name: id.into(),
                description: None,
                icon: None,
                boot_image: None,
                initrd: None,
                boot_args: None,
                is_default,
            },
            parser_name: "kboot",
            origin_device_id: device_id.into(),
        }
    }

    #[test]
    fn autoboot_race_replaces_default_and_extends_countdown() {
        let mut config = Config::default();
        config.autoboot_timeout_sec = 5;
        config.boot_priorities = vec![
            BootPriority::DeviceType {
                device_type: DeviceType::Network,
                priority: 2,
            },
            BootPriority::DeviceType {
                device_type: DeviceType::Disk,
                priority: 1,
            },
        ];
        let mut handler = DeviceHandler::new(config, true);
        let mut notifier = NullNotifier;

        let mut disk = DiscoverDevice::new("sda1", DeviceType::Disk);
        disk.mount = MountState {
            mounted: true,
            mount_path: Some("/mnt/sda1".into()),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        handler.devices.push(disk);
        handler.commit_option(&mut notifier, resolved_option("sda1", "sda1#linux", true));
        assert_eq!(handler.sec_to_boot, 5);

        let mut net = DiscoverDevice::new("eth0", DeviceType::Network);
        handler.devices.push(net);
        handler.commit_option(&mut notifier, resolved_option("eth0", "eth0#net", true));
        assert_eq!(handler.sec_to_boot, 7);
        assert_eq!(handler.default_candidate.as_ref().unwrap().option_id, "eth0#net");
    }

    #[test]
    fn veto_priority_is_never_adopted_as_default() {
        let mut config = Config::default();
        config.boot_priorities = vec![BootPriority::DeviceType {
            device_type: DeviceType::Usb,
            priority: -1,
        }];
        let mut handler = DeviceHandler::new(config, true);
        let mut notifier = NullNotifier;
        handler.devices.push(DiscoverDevice::new("sdb1", DeviceType::Usb));
        handler.commit_option(&mut notifier, resolved_option("sdb1", "sdb1#linux", true));
        assert!(handler.default_candidate.is_none());
    }

    #[test]
    fn autoboot_race_accounts_for_elapsed_time_before_replacement() {
        let mut config = Config::default();
        config.autoboot_timeout_sec = 5;
        config.boot_priorities = vec![
            BootPriority::DeviceType {
                device_type: DeviceType::Network,
                priority: 2,
            },
            BootPriority::DeviceType {
                device_type: DeviceType::Disk,
                priority: 1,
            },
        ];
        let mut handler = DeviceHandler::new(config, true);
        let mut notifier = NullNotifier;
        let env = Env::default();

        let mut disk = DiscoverDevice::new("sda1", DeviceType::Disk);
        disk.mount = MountState {
            mounted: true,
            mount_path: Some("/mnt/sda1".into()),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        handler.devices.push(disk);
        handler.commit_option(&mut notifier, resolved_option("sda1", "sda1#linux", true));
        assert_eq!(handler.sec_to_boot, 5);

        for status in handler.tick(&env, TftpFlavor::Hpa) {
            drop(status);
        }
        assert_eq!(handler.sec_to_boot, 4);

        let net = DiscoverDevice::new("eth0", DeviceType::Network);
        handler.devices.push(net);
        handler.commit_option(&mut notifier, resolved_option("eth0", "eth0#net", true));
        assert_eq!(handler.sec_to_boot, 6);
        assert_eq!(handler.default_candidate.as_ref().unwrap().option_id, "eth0#net");
    }

    #[test]
    fn user_event_remove_drops_device_and_its_options() {
        let handler_config = Config::default();
        let mut handler = DeviceHandler::new(handler_config, true);
        let mut notifier = NullNotifier;
        let env = Env::default();

        let add = Event {
            event_type: crate::model::EventType::User,
            action: EventAction::Add,
            device_id: "eth0".into(),
            params: Default::default(),
        };
        handler.on_event(&env, TftpFlavor::Hpa, &mut notifier, add);
        assert!(handler.devices.iter().any(|d| d.id == "eth0"));

        handler.commit_option(&mut notifier, resolved_option("eth0", "eth0#net", false));
        assert!(handler.devices.iter().find(|d| d.id == "eth0").unwrap().boot_options.iter().any(|o| o.option.id == "eth0#net"));

        let remove = Event {
            event_type: crate::model::EventType::User,
            action: EventAction::Remove,
            device_id: "eth0".into(),
            params: Default::default(),
        };
        handler.on_event(&env, TftpFlavor::Hpa, &mut notifier, remove);

        assert!(!handler.devices.iter().any(|d| d.id == "eth0"));
    }

    #[test]
    fn already_mounted_parses_proc_self_mounts() {
        let mounts = "/dev/sda1 /mnt/sda1 ext4 ro,relatime 0 0\n/dev/sdb1 /mnt/sdb1 ext4 rw 0 0\n";
        assert_eq!(already_mounted(mounts, "/dev/sdb1"), Some(Utf8PathBuf::from("/mnt/sdb1")));
        assert_eq!(already_mounted(mounts, "/dev/sdc1"), None);
    }
}
