//! URL parsing and joining (§4.1).
//!
//! Grounded on `examples/original_source/lib/url/url.c`: a scheme table
//! matched case-insensitively against `<name>://`, with `file` as the
//! fallback for anything that doesn't match. Unlike the C version (which
//! computes the post-scheme offset unconditionally and would read past a
//! short `file`-less path), the fallback case here takes the whole input as
//! `path` directly, per spec.md §4.1.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UrlParseError {
    #[error("empty URL")]
    Empty,
    #[error("{scheme}:// URL has no path")]
    NoPath { scheme: &'static str },
}

/// The seven schemes the daemon understands. Order matches the source's
/// scheme table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scheme {
    File,
    Ftp,
    Http,
    Https,
    Nfs,
    Sftp,
    Tftp,
}

const SCHEMES: &[(Scheme, &str)] = &[
    (Scheme::File, "file"),
    (Scheme::Ftp, "ftp"),
    (Scheme::Http, "http"),
    (Scheme::Https, "https"),
    (Scheme::Nfs, "nfs"),
    (Scheme::Sftp, "sftp"),
    (Scheme::Tftp, "tftp"),
];

impl Scheme {
    pub fn name(self) -> &'static str {
        SCHEMES
            .iter()
            .find(|(s, _)| *s == self)
            .map(|(_, n)| *n)
            .expect("exhaustive scheme table")
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A parsed URL: `{ scheme, full, host, port, path, dir, file }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Url {
    pub scheme: Scheme,
    pub full: String,
    pub host: Option<String>,
    pub port: Option<String>,
    pub path: String,
    pub dir: Option<String>,
    pub file: String,
    /// Whether `full` actually carried a `scheme://` prefix, as opposed to
    /// falling back to `file` because none was present. Only matters for
    /// `Scheme::File`: a bare path renders back bare, but `file:///x` must
    /// round-trip to `file:///x`, not silently lose its prefix.
    explicit_scheme: bool,
}

fn find_scheme(s: &str) -> Option<(Scheme, usize)> {
    for &(scheme, name) in SCHEMES {
        let prefix_len = name.len() + 3; // "://"
        if s.len() < prefix_len {
            continue;
        }
        if s[..name.len()].eq_ignore_ascii_case(name) && &s[name.len()..name.len() + 3] == "://" {
            return Some((scheme, name.len() + 3));
        }
    }
    None
}

/// Collapse consecutive leading slashes in `path` down to one.
fn collapse_leading_slashes(path: &str) -> String {
    let trimmed = path.trim_start_matches('/');
    if trimmed.len() == path.len() {
        path.to_string()
    } else {
        format!("/{trimmed}")
    }
}

fn split_dir_file(path: &str) -> (Option<String>, String) {
    match path.rfind('/') {
        Some(idx) => (
            Some(path[..=idx].to_string()),
            path[idx + 1..].to_string(),
        ),
        None => (None, path.to_string()),
    }
}

impl Url {
    pub fn parse(s: &str) -> Result<Url, UrlParseError> {
        if s.is_empty() {
            return Err(UrlParseError::Empty);
        }

        let full = s.to_string();

        if let Some((scheme, skip)) = find_scheme(s) {
            let rest = &s[skip..];
            let path_start = rest.find('/').ok_or(UrlParseError::NoPath {
                scheme: scheme.name(),
            })?;
            let authority = &rest[..path_start];
            let raw_path = &rest[path_start..];

            let (host, port) = match authority.find(':') {
                Some(idx) => {
                    let host = &authority[..idx];
                    let port = &authority[idx + 1..];
                    (
                        (!host.is_empty()).then(|| host.to_string()),
                        (!port.is_empty()).then(|| port.to_string()),
                    )
                }
                None => (
                    (!authority.is_empty()).then(|| authority.to_string()),
                    None,
                ),
            };

            let path = collapse_leading_slashes(raw_path);
            let (dir, file) = split_dir_file(&path);
            Ok(Url {
                scheme,
                full,
                host,
                port,
                path,
                dir,
                file,
                explicit_scheme: true,
            })
        } else {
            let path = s.to_string();
            let (dir, file) = split_dir_file(&path);
            Ok(Url {
                scheme: Scheme::File,
                full,
                host: None,
                port: None,
                path,
                dir,
                file,
                explicit_scheme: false,
            })
        }
    }

    /// Resolve a relative reference against this URL, per standard
    /// hierarchical rules: an absolute path replaces the base path; a
    /// relative path appends to the base's `dir`.
    pub fn join(&self, reference: &str) -> Result<Url, UrlParseError> {
        if let Some((_, _)) = find_scheme(reference) {
            return Url::parse(reference);
        }
        if reference.starts_with('/') {
            let mut u = self.clone();
            u.path = collapse_leading_slashes(reference);
            let (dir, file) = split_dir_file(&u.path);
            u.dir = dir;
            u.file = file;
            u.full = u.render();
            return Ok(u);
        }
        let base_dir = self.dir.clone().unwrap_or_default();
        let joined_path = join_paths(&base_dir, reference);
        let mut u = self.clone();
        u.path = collapse_leading_slashes(&joined_path);
        let (dir, file) = split_dir_file(&u.path);
        u.dir = dir;
        u.file = file;
        u.full = u.render();
        Ok(u)
    }

    /// Render back to a canonical `full` string. For well-formed inputs,
    /// `Url::parse(x).render() == x` up to leading-slash collapse.
    pub fn render(&self) -> String {
        match self.scheme {
            Scheme::File if self.explicit_scheme => format!("file://{}", self.path),
            Scheme::File => self.path.clone(),
            _ => {
                let mut authority = String::new();
                if let Some(h) = &self.host {
                    authority.push_str(h);
                }
                if let Some(p) = &self.port {
                    authority.push(':');
                    authority.push_str(p);
                }
                format!("{}://{}{}", self.scheme, authority, self.path)
            }
        }
    }
}

impl FromStr for Url {
    type Err = UrlParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Url::parse(s)
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Plain concatenation with a single separating `/`, matching
/// `discover/paths.c`'s `join_paths`.
pub fn join_paths(a: &str, b: &str) -> String {
    if a.is_empty() {
        return b.to_string();
    }
    let needs_sep = !b.starts_with('/') && !a.ends_with('/');
    if needs_sep {
        format!("{a}/{b}")
    } else {
        format!("{a}{b}")
    }
}

/// Build a `file://` URL for a path beneath a device's mount point, the
/// form every resolved devpath/grub2 resource takes (§4.6, §6). Renders as
/// a bare path, matching the original resolver's output and the wire
/// format finalized `BootOption`s use: this is not the same as parsing a
/// user-supplied `file://` URL, which must round-trip with its prefix
/// intact.
pub fn file_url(mount_path: &str, relative: &str) -> Url {
    let path = collapse_leading_slashes(&join_paths(mount_path, relative));
    let (dir, file) = split_dir_file(&path);
    Url {
        scheme: Scheme::File,
        full: path.clone(),
        host: None,
        port: None,
        path,
        dir,
        file,
        explicit_scheme: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_scheme_as_whole_path() {
        let u = Url::parse("/boot/vmlinux").unwrap();
        assert_eq!(u.scheme, Scheme::File);
        assert_eq!(u.path, "/boot/vmlinux");
        assert_eq!(u.host, None);
        assert_eq!(u.dir.as_deref(), Some("/boot/"));
        assert_eq!(u.file, "vmlinux");
    }

    #[test]
    fn parses_http_with_host_and_port() {
        let u = Url::parse("http://example.com:8080/a/b.cfg").unwrap();
        assert_eq!(u.scheme, Scheme::Http);
        assert_eq!(u.host.as_deref(), Some("example.com"));
        assert_eq!(u.port.as_deref(), Some("8080"));
        assert_eq!(u.path, "/a/b.cfg");
        assert_eq!(u.dir.as_deref(), Some("/a/"));
        assert_eq!(u.file, "b.cfg");
    }

    #[test]
    fn parses_host_without_port() {
        let u = Url::parse("tftp://192.168.1.1/pxelinux.cfg/default").unwrap();
        assert_eq!(u.host.as_deref(), Some("192.168.1.1"));
        assert_eq!(u.port, None);
    }

    #[test]
    fn collapses_leading_slashes() {
        let u = Url::parse("file:////a/b").unwrap();
        assert_eq!(u.path, "/a/b");
    }

    #[test]
    fn scheme_is_case_insensitive() {
        let u = Url::parse("HTTP://h/p").unwrap();
        assert_eq!(u.scheme, Scheme::Http);
    }

    #[test]
    fn round_trip_render() {
        for raw in [
            "http://host:80/a/b",
            "nfs://server/export/path",
            "/local/path",
        ] {
            let u = Url::parse(raw).unwrap();
            assert_eq!(u.render(), raw);
        }
    }

    #[test]
    fn join_relative_appends_to_base_dir() {
        let base = Url::parse("http://h/a/b/base.cfg").unwrap();
        let joined = base.join("other.cfg").unwrap();
        assert_eq!(joined.path, "/a/b/other.cfg");
    }

    #[test]
    fn join_absolute_replaces_path() {
        let base = Url::parse("http://h/a/b/base.cfg").unwrap();
        let joined = base.join("/z.cfg").unwrap();
        assert_eq!(joined.path, "/z.cfg");
    }

    #[test]
    fn explicit_file_scheme_round_trips_with_prefix() {
        let u = Url::parse("file:///a").unwrap();
        assert_eq!(u.render(), "file:///a");
    }

    #[test]
    fn resolved_resource_urls_still_render_as_bare_paths() {
        let u = file_url("/mnt/sda1", "vmlinux");
        assert_eq!(u.render(), "/mnt/sda1/vmlinux");
    }
}
