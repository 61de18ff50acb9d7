//! Fetch a URL to a guaranteed-local path (§4.3).
//!
//! Grounded on `coreos-installer/src/download.rs`'s external-fetch-tool
//! orchestration (child process + progress scraping), generalized from
//! coreos-installer's single `reqwest`-backed HTTP path to the five
//! external-tool schemes the original daemon shells out to.

use camino::Utf8PathBuf;

use crate::env::Env;
use crate::error::FetchError;
use crate::process::{self, RunningProcess};
use crate::url::{Scheme, Url};

/// Terminal status of a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStatus {
    Ok,
    Error,
    Cancelled,
    /// Only meaningful as the immediate return of `load_async`; the real
    /// terminal status arrives via the completion callback.
    Async,
}

#[derive(Debug, Clone)]
pub struct LoadResult {
    pub local_path: Option<Utf8PathBuf>,
    pub cleanup_local: bool,
    pub status: LoadStatus,
}

impl LoadResult {
    fn ok(path: Utf8PathBuf, cleanup_local: bool) -> Self {
        LoadResult {
            local_path: Some(path),
            cleanup_local,
            status: LoadStatus::Ok,
        }
    }

    fn error() -> Self {
        LoadResult {
            local_path: None,
            cleanup_local: false,
            status: LoadStatus::Error,
        }
    }

    fn cancelled() -> Self {
        LoadResult {
            local_path: None,
            cleanup_local: false,
            status: LoadStatus::Cancelled,
        }
    }
}

/// Installed tftp client flavor, probed once at start-up (§4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TftpFlavor {
    Hpa,
    Busybox,
    Broken,
}

pub fn probe_tftp_flavor(env: &Env) -> TftpFlavor {
    match process::run_sync(env, &[env.tools.tftp.to_string_lossy().into_owned(), "-V".into()]) {
        Ok((status, out)) if status.success() || !out.is_empty() => {
            let text = String::from_utf8_lossy(&out);
            if text.contains("tftp-hpa") {
                TftpFlavor::Hpa
            } else if text.contains("BusyBox") {
                TftpFlavor::Busybox
            } else {
                TftpFlavor::Broken
            }
        }
        _ => TftpFlavor::Broken,
    }
}

fn mktemp_local() -> Utf8PathBuf {
    let pid = std::process::id();
    static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
    let n = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    Utf8PathBuf::from(format!("/tmp/pb-{pid:x}-{n:x}"))
}

fn argv_for(env: &Env, flavor: TftpFlavor, url: &Url, dest: &Utf8PathBuf) -> Result<Vec<String>, FetchError> {
    let prog = |p: &std::path::Path| p.to_string_lossy().into_owned();
    match url.scheme {
        Scheme::Http | Scheme::Https | Scheme::Ftp => {
            let mut argv = vec![prog(&env.tools.wget), "-q".to_string(), "-O".to_string(), dest.to_string()];
            if url.scheme == Scheme::Https {
                argv.push("--no-check-certificate".to_string());
            }
            argv.push(url.render());
            Ok(argv)
        }
        Scheme::Tftp => {
            let host = url.host.clone().unwrap_or_default();
            Ok(match flavor {
                TftpFlavor::Hpa => vec![
                    prog(&env.tools.tftp),
                    "-m".into(),
                    "binary".into(),
                    host,
                    "-c".into(),
                    "get".into(),
                    url.path.clone(),
                    dest.to_string(),
                ],
                TftpFlavor::Busybox | TftpFlavor::Broken => {
                    vec![prog(&env.tools.tftp), "-g".into(), "-l".into(), dest.to_string(), "-r".into(), url.path.clone(), host]
                }
            })
        }
        Scheme::Sftp => {
            let host = url.host.clone().unwrap_or_default();
            Ok(vec![prog(&env.tools.sftp), format!("{host}:{}", url.path), dest.to_string()])
        }
        Scheme::File | Scheme::Nfs => Err(FetchError::NoTool(url.scheme)),
    }
}

/// Blocking fetch: runs the transfer tool to completion.
pub fn load(env: &Env, flavor: TftpFlavor, url: &Url) -> Result<LoadResult, FetchError> {
    match url.scheme {
        Scheme::File => {
            let path = std::path::Path::new(&url.path);
            if !path.exists() {
                return Ok(LoadResult::error());
            }
            Ok(LoadResult::ok(Utf8PathBuf::from(&url.path), false))
        }
        Scheme::Nfs => {
            let host = url.host.clone().unwrap_or_default();
            let mountpoint = mktemp_local();
            std::fs::create_dir_all(&mountpoint).map_err(FetchError::Io)?;
            let mut opts = "ro,nolock,nodiratime".to_string();
            if let Some(port) = &url.port {
                opts.push_str(&format!(",port={port}"));
            }
            let argv = vec![
                env.tools.mount.to_string_lossy().into_owned(),
                "-t".into(),
                "nfs".into(),
                "-o".into(),
                opts,
                format!("{host}:{}", url.dir.clone().unwrap_or_else(|| "/".to_string())),
                mountpoint.to_string(),
            ];
            let (status, _) = process::run_sync(env, &argv).map_err(|e| FetchError::Mount(e.to_string()))?;
            if !status.success() {
                let _ = std::fs::remove_dir(&mountpoint);
                return Ok(LoadResult::error());
            }
            let local_path = Utf8PathBuf::from(crate::url::join_paths(mountpoint.as_str(), &url.file));
            Ok(LoadResult::ok(local_path, true))
        }
        _ => {
            let dest = mktemp_local();
            let argv = argv_for(env, flavor, url, &dest)?;
            let (status, _) = process::run_sync(env, &argv)?;
            if !status.success() {
                let _ = std::fs::remove_file(&dest);
                return Ok(LoadResult::error());
            }
            Ok(LoadResult::ok(dest, true))
        }
    }
}

/// Busybox-style progress line: `"... NN% <size><unit> H:MM:SS ETA"`.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub percent: u8,
    pub size: f64,
    pub unit: String,
}

pub fn parse_progress_line(line: &str) -> Option<Progress> {
    let pct_idx = line.find('%')?;
    let pct_start = line[..pct_idx].rfind(|c: char| !c.is_ascii_digit())? + 1;
    let percent: u8 = line[pct_start..pct_idx].parse().ok()?;
    let rest = line[pct_idx + 1..].trim_start();
    let mut parts = rest.split_whitespace();
    let size_tok = parts.next()?;
    let split = size_tok.find(|c: char| c.is_ascii_alphabetic())?;
    let size: f64 = size_tok[..split].parse().ok()?;
    let unit = size_tok[split..].to_string();
    Some(Progress { percent, size, unit })
}

/// A handle to an in-flight asynchronous load (§4.3, §5 cancellation).
pub struct LoadHandle {
    pub(crate) process: Option<RunningProcess>,
    pub(crate) result: Option<LoadResult>,
    pub(crate) dest: Option<Utf8PathBuf>,
}

impl LoadHandle {
    pub fn cancel(&mut self) {
        if let Some(p) = self.process.as_mut() {
            p.cancel();
        }
    }

    /// Scrape whatever stdout has arrived since the last call for a
    /// busybox/tftp-hpa progress line (§4.3). Returns the most recent one
    /// parsed, if any; always `None` once the transfer has finished (no
    /// child left to read from) or for the `file://` fast path (no child
    /// ever spawned).
    pub fn progress(&mut self) -> Option<Progress> {
        let process = self.process.as_mut()?;
        let mut latest = None;
        let _ = process.poll_stdout_lines(|line| {
            if let Some(p) = parse_progress_line(line) {
                latest = Some(p);
            }
        });
        latest
    }

    /// Poll for completion; the event loop calls this each tick on a
    /// registered handle and dispatches callbacks once `Some` is returned.
    pub fn poll(&mut self) -> Option<LoadResult> {
        if self.process.is_none() {
            // Either finished on a prior call, or the `file://` fast path
            // never spawned a child and stashed its result up front.
            return self.result.take();
        }
        let process = self.process.as_mut()?;
        if process.is_cancelled() {
            if let Some(dest) = self.dest.take() {
                let _ = std::fs::remove_file(&dest);
            }
            self.process = None;
            return Some(LoadResult::cancelled());
        }
        match process.try_wait().ok()? {
            None => None,
            Some(status) => {
                self.process = None;
                if status.success() {
                    Some(LoadResult::ok(self.dest.clone().unwrap(), true))
                } else {
                    if let Some(dest) = self.dest.take() {
                        let _ = std::fs::remove_file(&dest);
                    }
                    Some(LoadResult::error())
                }
            }
        }
    }
}

/// Returns immediately with a handle; the event loop polls it to
/// completion and invokes the caller's callbacks.
pub fn load_async(env: &Env, flavor: TftpFlavor, url: &Url, description: impl Into<String>) -> Result<LoadHandle, FetchError> {
    if matches!(url.scheme, Scheme::File) {
        let result = load(env, flavor, url)?;
        return Ok(LoadHandle {
            process: None,
            result: Some(result),
            dest: None,
        });
    }
    let dest = mktemp_local();
    let argv = argv_for(env, flavor, url, &dest)?;
    let process = process::spawn(env, &argv, description).map_err(|e| FetchError::SpawnFailed(argv.join(" "), std::io::Error::other(e.to_string())))?;
    Ok(LoadHandle {
        process: Some(process),
        result: None,
        dest: Some(dest),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_busybox_progress_line() {
        let p = parse_progress_line("big.img       45% |***       | 1234k  0:00:12 ETA").unwrap();
        assert_eq!(p.percent, 45);
        assert_eq!(p.unit, "k");
    }

    #[test]
    fn file_scheme_has_no_transfer() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let url = Url::parse(&format!("file://{}", tmp.path().display())).unwrap();
        let env = Env::default();
        let result = load(&env, TftpFlavor::Hpa, &url).unwrap();
        assert_eq!(result.status, LoadStatus::Ok);
        assert!(!result.cleanup_local);
    }

    #[test]
    fn missing_file_is_error() {
        let url = Url::parse("file:///does/not/exist").unwrap();
        let env = Env::default();
        let result = load(&env, TftpFlavor::Hpa, &url).unwrap();
        assert_eq!(result.status, LoadStatus::Error);
    }

    #[test]
    fn load_async_file_scheme_fast_path_completes_and_fires_once() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let url = Url::parse(&format!("file://{}", tmp.path().display())).unwrap();
        let env = Env::default();
        let mut handle = load_async(&env, TftpFlavor::Hpa, &url, "test").unwrap();

        let result = handle.poll().expect("file:// fast path resolves on the first poll");
        assert_eq!(result.status, LoadStatus::Ok);
        assert!(handle.poll().is_none(), "the callback must not fire twice");
    }

    #[test]
    fn progress_is_scraped_from_child_stdout() {
        let env = Env::default();
        let process = process::spawn(&env, &["/bin/echo".into(), "big.img       45% |***       | 1234k  0:00:12 ETA".into()], "test transfer").unwrap();
        let mut handle = LoadHandle {
            process: Some(process),
            result: None,
            dest: None,
        };
        for _ in 0..100 {
            if let Some(p) = handle.progress() {
                assert_eq!(p.percent, 45);
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        panic!("progress line never observed");
    }

    #[test]
    fn cancel_mid_fetch_yields_cancelled_and_removes_temp_file() {
        let env = Env::default();
        let dest = mktemp_local();
        std::fs::write(&dest, b"partial").unwrap();
        let process = process::spawn(&env, &["/bin/sleep".into(), "30".into()], "test transfer").unwrap();
        let mut handle = LoadHandle {
            process: Some(process),
            result: None,
            dest: Some(dest.clone()),
        };

        assert!(handle.poll().is_none());
        handle.cancel();
        let result = handle.poll().expect("cancellation is reported on the next poll");
        assert_eq!(result.status, LoadStatus::Cancelled);
        assert!(!dest.exists());

        assert!(handle.poll().is_none(), "the callback must not fire twice");
    }
}
