//! Domain error kinds.
//!
//! These map directly to the error kinds named in the core design: each
//! pipeline stage degrades independently rather than aborting the daemon.
//! `anyhow::Result` is still used at call boundaries (CLI, event-loop
//! dispatch) the way the teacher uses it; these enums exist so that callers
//! who need to distinguish "skip this device" from "close this client" from
//! "the daemon is dead" can match on something more precise than a string.

use thiserror::Error;

/// A bootloader config file was malformed. The offending file is skipped;
/// other parsers still run over the same device.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{parser}: malformed line {line}: {reason}")]
    Malformed {
        parser: &'static str,
        line: usize,
        reason: String,
    },
    #[error("{parser}: include depth exceeded ({depth})")]
    IncludeDepthExceeded { parser: &'static str, depth: usize },
    #[error("{parser}: {0}", parser = "parser")]
    Other(String),
}

/// A single resource failed to transfer. The owning boot option is
/// discarded; other options on the same device survive.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("no transfer tool available for scheme {0:?}")]
    NoTool(crate::url::Scheme),
    #[error("child process {0:?} exited with {1}")]
    ChildFailed(String, std::process::ExitStatus),
    #[error("failed to spawn {0:?}: {1}")]
    SpawnFailed(String, std::io::Error),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("mount failed: {0}")]
    Mount(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A device could not be mounted. No parsers run over it.
#[derive(Debug, Error)]
pub enum MountError {
    #[error("mount({device_path:?}, fstype={fstype:?}) failed: {reason}")]
    Failed {
        device_path: String,
        fstype: Option<String>,
        reason: String,
    },
    #[error("device has no filesystem type hint (ID_FS_TYPE)")]
    NoFsType,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A client sent a malformed or oversized message; only that client's
/// connection is closed.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload length {0} exceeds maximum of {max}", max = crate::wire::MAX_PAYLOAD_LEN)]
    PayloadTooLarge(u32),
    #[error("truncated message")]
    Truncated,
    #[error("unknown action code {0}")]
    UnknownAction(u32),
    #[error("string field exceeds remaining buffer")]
    StringOverrun,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Authentication failed; reported only to the originating client.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("incorrect password")]
    WrongPassword,
    #[error("not authorized to perform this action")]
    NotAuthorized,
    #[error("client is not privileged (uid != 0)")]
    NotPrivileged,
}

/// Failed to load the kernel/initrd/dtb and run kexec -l.
#[derive(Debug, Error)]
pub enum KexecLoadError {
    #[error("fetching {what}: {source}")]
    Fetch {
        what: &'static str,
        #[source]
        source: FetchError,
    },
    #[error("kexec -l failed: {0}")]
    ExecFailed(String),
}

/// Failed to hand off execution after a successful kexec -l.
#[derive(Debug, Error)]
pub enum RebootError {
    #[error("shutdown -r now failed: {0}")]
    ShutdownFailed(String),
    #[error("kexec -e failed: {0}")]
    KexecEFailed(String),
    #[error("kexec -e -f failed: {0}")]
    KexecEForceFailed(String),
}
