//! Process runtime (§2 "Process runtime").
//!
//! Grounded on `filesystem.rs`'s `Command::new(..).output()` style for
//! synchronous probes, generalized to a non-blocking spawn/poll/cancel model
//! for the cooperative event loop (§5): handlers must never block, so a
//! spawned child is polled via `try_wait()` from the main loop rather than
//! waited on.

use std::io::Read;
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};

use fn_error_context::context;

use crate::env::Env;

/// A process the event loop owns until it exits or is cancelled.
pub struct RunningProcess {
    child: Child,
    pub description: String,
    cancelled: bool,
}

impl RunningProcess {
    /// Non-blocking exit check; `Ok(None)` means still running.
    pub fn try_wait(&mut self) -> std::io::Result<Option<ExitStatus>> {
        self.child.try_wait()
    }

    /// Drain whatever stdout is currently buffered, line-wise, feeding each
    /// complete line to `on_line`. Used by the loader's progress parser.
    pub fn poll_stdout_lines(&mut self, mut on_line: impl FnMut(&str)) -> std::io::Result<()> {
        if let Some(stdout) = self.child.stdout.as_mut() {
            let mut buf = [0u8; 4096];
            // A single non-blocking-ish read; the fd is expected to be set
            // O_NONBLOCK by the caller via the event loop's registration.
            match stdout.read(&mut buf) {
                Ok(0) => {}
                Ok(n) => {
                    for line in String::from_utf8_lossy(&buf[..n]).split(['\n', '\r']) {
                        if !line.is_empty() {
                            on_line(line);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn cancel(&mut self) {
        self.cancelled = true;
        let _ = self.child.kill();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

/// Spawn `argv[0]` with the remaining args, capturing stdout for progress
/// parsing. In dry-run mode, logs the command line and spawns `/bin/true`
/// instead of the real tool — still a real (trivial) child so the polling
/// code path stays uniform.
#[context("spawning {}", argv.first().map(|s| s.as_str()).unwrap_or("?"))]
pub fn spawn(env: &Env, argv: &[String], description: impl Into<String>) -> anyhow::Result<RunningProcess> {
    let description = description.into();
    log::debug!("spawn: {description}: {}", argv.join(" "));
    if env.dry_run {
        log::info!("dry-run: would run: {}", argv.join(" "));
        let child = Command::new("/bin/true")
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;
        return Ok(RunningProcess {
            child,
            description,
            cancelled: false,
        });
    }
    let (prog, rest) = argv.split_first().ok_or_else(|| anyhow::anyhow!("empty argv"))?;
    let child = Command::new(prog)
        .args(rest)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    Ok(RunningProcess {
        child,
        description,
        cancelled: false,
    })
}

/// Run a short command to completion and return its captured stdout.
/// Permitted as a suspension point only at startup and for probes (§5),
/// e.g. `tftp -V` classification and `ip route show to match`.
#[context("running {}", argv.first().map(|s| s.as_str()).unwrap_or("?"))]
pub fn run_sync(env: &Env, argv: &[String]) -> anyhow::Result<(ExitStatus, Vec<u8>)> {
    log::debug!("run_sync: {}", argv.join(" "));
    if env.dry_run {
        log::info!("dry-run: would run: {}", argv.join(" "));
        let status = Command::new("/bin/true").status()?;
        return Ok((status, Vec::new()));
    }
    let (prog, rest) = argv.split_first().ok_or_else(|| anyhow::anyhow!("empty argv"))?;
    let out = Command::new(prog).args(rest).output()?;
    Ok((out.status, out.stdout))
}

/// True if `path` names an existing, executable regular file.
pub fn tool_exists(path: &Path) -> bool {
    path.is_file()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spawn_dry_run_does_not_invoke_real_tool() {
        let mut env = Env::default();
        env.dry_run = true;
        let mut p = spawn(&env, &["/sbin/kexec".into(), "-l".into()], "kexec load").unwrap();
        for _ in 0..100 {
            if p.try_wait().unwrap().is_some() {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("dry-run child never exited");
    }
}
