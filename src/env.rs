//! Process-wide configuration that used to be a collection of globals and a
//! "default apps" table in the source implementation. Constructed once at
//! start-up in `main` and threaded through explicitly, the way
//! `bootupd::run` builds its CLI options once and dispatches from them
//! rather than reaching for statics.

use std::path::{Path, PathBuf};

use camino::Utf8PathBuf;
use clap::Parser;

/// Absolute paths to the external tools the daemon shells out to (§6).
/// Each has a configured absolute path; a dry-run flag converts execution
/// into a log line instead of a real `exec`.
#[derive(Debug, Clone)]
pub struct ToolPaths {
    pub kexec: PathBuf,
    pub shutdown: PathBuf,
    pub mount: PathBuf,
    pub umount: PathBuf,
    pub ip: PathBuf,
    pub udhcpc: PathBuf,
    pub wget: PathBuf,
    pub tftp: PathBuf,
    pub sftp: PathBuf,
    pub cp: PathBuf,
}

impl Default for ToolPaths {
    fn default() -> Self {
        ToolPaths {
            kexec: "/sbin/kexec".into(),
            shutdown: "/sbin/shutdown".into(),
            mount: "/bin/mount".into(),
            umount: "/bin/umount".into(),
            ip: "/sbin/ip".into(),
            udhcpc: "/sbin/udhcpc".into(),
            wget: "/usr/bin/wget".into(),
            tftp: "/usr/bin/tftp".into(),
            sftp: "/usr/bin/sftp".into(),
            cp: "/bin/cp".into(),
        }
    }
}

/// The daemon's command-line, matching §6 "CLI of the daemon":
/// `--dry-run` (never exec), `--no-autoboot`, `--log PATH`.
#[derive(Debug, Parser)]
#[clap(name = "petitboot-discover", about = "petitboot discovery daemon", version)]
pub struct Cli {
    /// Never actually invoke external tools; log the command line instead.
    #[clap(long)]
    pub dry_run: bool,

    /// Disable the autoboot countdown on start-up.
    #[clap(long)]
    pub no_autoboot: bool,

    /// Additionally write logs to this file.
    #[clap(long, value_name = "PATH")]
    pub log: Option<PathBuf>,

    /// Verbosity level (higher is more verbose).
    #[clap(short = 'v', action = clap::ArgAction::Count)]
    pub verbosity: u8,
}

impl Cli {
    pub fn loglevel(&self) -> log::LevelFilter {
        match self.verbosity {
            0 => log::LevelFilter::Info,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }
}

/// The explicit environment threaded through the pipeline in place of the
/// source's process-wide logger handle and default-apps table.
#[derive(Debug, Clone)]
pub struct Env {
    pub tools: ToolPaths,
    pub dry_run: bool,
    pub autoboot_enabled_at_start: bool,
    /// `{LOCAL_STATE_DIR}/petitboot/mnt` — see SPEC_FULL §4 open question 5.
    pub mount_base: Utf8PathBuf,
    pub client_socket_path: Utf8PathBuf,
    pub user_event_socket_path: Utf8PathBuf,
    pub config_path: Utf8PathBuf,
}

impl Default for Env {
    fn default() -> Self {
        Env {
            tools: ToolPaths::default(),
            dry_run: false,
            autoboot_enabled_at_start: true,
            mount_base: Utf8PathBuf::from("/var/lib/petitboot/mnt"),
            client_socket_path: Utf8PathBuf::from("/tmp/petitboot.ui"),
            user_event_socket_path: Utf8PathBuf::from("/tmp/petitboot.ev"),
            config_path: Utf8PathBuf::from("/var/lib/petitboot/config.json"),
        }
    }
}

impl Env {
    pub fn from_cli(cli: &Cli) -> Self {
        let mut env = Env {
            dry_run: cli.dry_run,
            autoboot_enabled_at_start: !cli.no_autoboot,
            ..Env::default()
        };
        if cli.dry_run {
            log::info!("dry-run mode: external tools will be logged, not executed");
        }
        env.tools = ToolPaths::default();
        env
    }

    pub fn mount_point_for(&self, device_path_leaf: &str) -> Utf8PathBuf {
        self.mount_base.join(device_path_leaf)
    }
}

/// Set up logging the way `bootupd::main::run_cli` does: a stable,
/// timestamp-free, module-free formatter driven by `-v` repeats, optionally
/// teed to a file via `--log`.
pub fn init_logging(cli: &Cli) -> anyhow::Result<()> {
    let mut builder = env_logger::Builder::new();
    builder
        .format_timestamp(None)
        .format_module_path(false)
        .filter(Some("petitboot_discover"), cli.loglevel())
        .filter(Some("petitboot-discover"), cli.loglevel());

    if let Some(path) = cli.log.as_ref() {
        let target = open_log_target(path)?;
        builder.target(env_logger::Target::Pipe(target));
    }
    builder.init();
    Ok(())
}

fn open_log_target(path: &Path) -> anyhow::Result<Box<dyn std::io::Write + Send + 'static>> {
    let f = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    Ok(Box::new(f))
}
