//! The kexec invocation itself is an opaque "boot executor" (§1 Out of
//! scope): given three file paths and a command line, load a kernel and
//! hand off execution. Real implementation shells out to `kexec`/
//! `shutdown` the way `process.rs` runs every other external tool.

use crate::env::Env;
use crate::error::{KexecLoadError, RebootError};
use crate::process;

/// Three local file paths plus a command line — the handoff contract
/// named in §1.
pub struct KexecImage<'a> {
    pub kernel: &'a str,
    pub initrd: Option<&'a str>,
    pub dtb: Option<&'a str>,
    pub append: Option<&'a str>,
}

pub trait BootExecutor: Send + Sync {
    fn kexec_load(&self, env: &Env, image: &KexecImage<'_>) -> Result<(), KexecLoadError>;
    fn reboot(&self, env: &Env) -> Result<(), RebootError>;
}

pub struct RealBootExecutor;

impl BootExecutor for RealBootExecutor {
    fn kexec_load(&self, env: &Env, image: &KexecImage<'_>) -> Result<(), KexecLoadError> {
        let mut argv = vec![env.tools.kexec.to_string_lossy().into_owned(), "-l".into()];
        if let Some(initrd) = image.initrd {
            argv.push(format!("--initrd={initrd}"));
        }
        if let Some(dtb) = image.dtb {
            argv.push(format!("--dtb={dtb}"));
        }
        if let Some(append) = image.append {
            argv.push(format!("--append={append}"));
        }
        argv.push(image.kernel.to_string());

        let (status, _) = process::run_sync(env, &argv).map_err(|e| KexecLoadError::ExecFailed(e.to_string()))?;
        if !status.success() {
            return Err(KexecLoadError::ExecFailed(format!("kexec -l exited with {status}")));
        }
        Ok(())
    }

    /// Fallback chain (§4.7): `shutdown -r now` → `kexec -e` → `kexec -e -f`.
    fn reboot(&self, env: &Env) -> Result<(), RebootError> {
        let shutdown = vec![env.tools.shutdown.to_string_lossy().into_owned(), "-r".into(), "now".into()];
        match process::run_sync(env, &shutdown) {
            Ok((status, _)) if status.success() => return Ok(()),
            Ok((status, _)) => log::warn!("shutdown -r now exited with {status}; falling back to kexec -e"),
            Err(e) => log::warn!("shutdown -r now failed to spawn: {e}; falling back to kexec -e"),
        }

        let kexec_e = vec![env.tools.kexec.to_string_lossy().into_owned(), "-e".into()];
        match process::run_sync(env, &kexec_e) {
            Ok((status, _)) if status.success() => return Ok(()),
            Ok((status, _)) => log::warn!("kexec -e exited with {status}; falling back to kexec -e -f"),
            Err(e) => log::warn!("kexec -e failed to spawn: {e}; falling back to kexec -e -f"),
        }

        let kexec_ef = vec![env.tools.kexec.to_string_lossy().into_owned(), "-e".into(), "-f".into()];
        let (status, _) = process::run_sync(env, &kexec_ef).map_err(|e| RebootError::KexecEForceFailed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(RebootError::KexecEForceFailed(format!("kexec -e -f exited with {status}")))
        }
    }
}
