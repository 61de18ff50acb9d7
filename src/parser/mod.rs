//! Parser framework (§4.4): tokenizer, global-option table, file discovery,
//! the `Parser` trait, and the static registry that replaces the source's
//! linker-section self-registration (§9).
//!
//! Grounded on `examples/original_source/discover/parser-conf.c`'s
//! `conf_get_param_pair`/`conf_strip_str` for the tokenizer, and on
//! `bootupd/src/component.rs`'s `Component` trait + `new_from_name` registry
//! for the trait-object dispatch shape.

pub mod grub2;
pub mod kboot;
pub mod pxe;
pub mod syslinux;
pub mod user_event;
pub mod yaboot;

use std::collections::BTreeMap;

use crate::model::{DiscoverBootOption, DiscoverDevice, Event, Resource};

/// A line-oriented `name=value` (or bare value) pair, as produced by the
/// tokenizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pair {
    pub name: Option<String>,
    pub value: Option<String>,
}

/// Strip surrounding quotes/whitespace, matching `conf_strip_str`. Returns
/// `None` for an all-quote/whitespace (i.e. empty) result.
pub fn strip_str(s: &str) -> Option<String> {
    let trimmed = s.trim_matches(|c: char| c == '"' || c == '\'' || c.is_whitespace());
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Tokenize a buffer into `(name, value)` pairs, one per non-comment line.
/// `#`-prefixed lines (and values) are dropped. Mirrors
/// `conf_get_param_pair`: a line without `=` yields `name: None`.
pub fn tokenize(buf: &str) -> Vec<Pair> {
    let mut out = Vec::new();
    for raw_line in buf.lines() {
        let line = raw_line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.find('=') {
            Some(idx) => {
                let name = strip_str(&line[..idx]);
                let value = strip_str(&line[idx + 1..]);
                if value.as_deref().map(|v| v.starts_with('#')).unwrap_or(false) {
                    continue;
                }
                out.push(Pair { name, value });
            }
            None => {
                let value = strip_str(line);
                if value.as_deref().map(|v| v.starts_with('#')).unwrap_or(false) {
                    continue;
                }
                out.push(Pair { name: None, value });
            }
        }
    }
    out
}

/// A per-parser enumeration of recognized global options (`root`, `initrd`,
/// `default`, `partition`, `video`, ...), holding the most recently seen
/// value for each.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    names: Vec<&'static str>,
    values: BTreeMap<&'static str, String>,
}

impl GlobalOptions {
    pub fn new(names: &[&'static str]) -> Self {
        GlobalOptions {
            names: names.to_vec(),
            values: BTreeMap::new(),
        }
    }

    /// If `name` is a recognized global option, record `value` and return
    /// true; otherwise return false so the caller treats it as per-option.
    pub fn set(&mut self, name: &str, value: &str) -> bool {
        if let Some(&known) = self.names.iter().find(|n| **n == name) {
            self.values.insert(known, value.to_string());
            true
        } else {
            false
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(|s| s.as_str())
    }
}

/// What the parser framework hands each format backend (§4.4). Parsers
/// never mount; the device handler has already done that.
pub struct DiscoverContext<'a> {
    pub device: &'a DiscoverDevice,
    pub conf_url: Option<crate::url::Url>,
    pub event: Option<&'a Event>,
    pub options: Vec<DiscoverBootOption>,
}

impl<'a> DiscoverContext<'a> {
    pub fn new(device: &'a DiscoverDevice) -> Self {
        DiscoverContext {
            device,
            conf_url: None,
            event: None,
            options: Vec::new(),
        }
    }

    pub fn add_boot_option(&mut self, opt: DiscoverBootOption) {
        self.options.push(opt);
    }
}

/// A named parsing strategy (§4.4).
pub trait Parser: Send + Sync {
    fn name(&self) -> &'static str;

    /// Candidate filenames tried, in order, against the device's mount
    /// root. Empty for network-event-driven parsers (pxe, user-event).
    fn conf_filenames(&self) -> &'static [&'static str] {
        &[]
    }

    /// Parse `buf` (the contents of the discovered config file, or an
    /// event payload for network parsers) in the context of `ctx`.
    fn parse(&self, ctx: &mut DiscoverContext<'_>, buf: &[u8]);

    /// Attempt to resolve one of this parser's own deferred resource
    /// variants against a newly-arrived device. Returns the resolved
    /// resource, or `None` if `device` doesn't satisfy it.
    fn resolve_resource(&self, _device: &DiscoverDevice, _resource: &Resource) -> Option<Resource> {
        None
    }
}

/// Ordering defines priority (§9): earlier parsers' candidate files are
/// tried first during file discovery.
pub static PARSERS: &[&dyn Parser] = &[
    &kboot::KbootParser,
    &yaboot::YabootParser,
    &grub2::Grub2Parser,
    &syslinux::SyslinuxParser,
    &pxe::PxeParser,
    &user_event::UserEventParser,
];

/// File discovery (§4.4): try each candidate filename against the device's
/// mount root, de-duplicating by `(dev, ino)` so case-insensitive
/// filesystems don't double-process the same inode under two names.
pub fn discover_file(mount_root: &camino::Utf8Path, candidates: &[&str]) -> Option<(String, Vec<u8>)> {
    use std::os::unix::fs::MetadataExt;
    let mut seen: Vec<(u64, u64)> = Vec::new();
    for &name in candidates {
        let path = mount_root.join(name);
        let meta = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(_) => continue,
        };
        if !meta.is_file() || meta.len() == 0 {
            continue;
        }
        let key = (meta.dev(), meta.ino());
        if seen.contains(&key) {
            continue;
        }
        seen.push(key);
        if let Ok(buf) = std::fs::read(&path) {
            return Some((name.to_string(), buf));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizes_key_value_and_bare_lines() {
        let pairs = tokenize("root=/dev/sda2\n# comment\nimage\nlabel = 'linux'\n");
        assert_eq!(
            pairs,
            vec![
                Pair {
                    name: Some("root".into()),
                    value: Some("/dev/sda2".into())
                },
                Pair {
                    name: None,
                    value: Some("image".into())
                },
                Pair {
                    name: Some("label".into()),
                    value: Some("linux".into())
                },
            ]
        );
    }

    #[test]
    fn global_options_track_most_recent_value() {
        let mut g = GlobalOptions::new(&["root", "initrd"]);
        assert!(g.set("root", "/dev/sda1"));
        assert!(!g.set("unknown", "x"));
        assert_eq!(g.get("root"), Some("/dev/sda1"));
        assert_eq!(g.get("initrd"), None);
    }
}
