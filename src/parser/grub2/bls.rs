//! BLS (Boot Loader Specification) extension: `blscfg` scans
//! `/loader/entries/*.conf` (§4.5).
//!
//! Grounded on `coreos-installer`'s use of the `glob` crate for filesystem
//! pattern matching, applied here to BLS's `*.conf` entry directory.

use std::collections::BTreeMap;

use crate::model::{BootOption, DiscoverBootOption, DiscoverDevice, Resource};

/// RPM-style version comparison: alternating runs of digits and
/// non-digits compared numerically / lexically in turn.
fn strverscmp(a: &str, b: &str) -> std::cmp::Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let na: String = std::iter::from_fn(|| ai.next_if(|c| c.is_ascii_digit())).collect();
                    let nb: String = std::iter::from_fn(|| bi.next_if(|c| c.is_ascii_digit())).collect();
                    let va: u64 = na.parse().unwrap_or(0);
                    let vb: u64 = nb.parse().unwrap_or(0);
                    match va.cmp(&vb) {
                        std::cmp::Ordering::Equal => continue,
                        other => return other,
                    }
                } else {
                    let ca = ai.next().unwrap();
                    let cb = bi.next().unwrap();
                    match ca.cmp(&cb) {
                        std::cmp::Ordering::Equal => continue,
                        other => return other,
                    }
                }
            }
        }
    }
}

fn parse_entry(text: &str) -> BTreeMap<String, String> {
    let mut fields = BTreeMap::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once(char::is_whitespace) {
            fields.insert(key.to_string(), value.trim().to_string());
        }
    }
    fields
}

/// Scan `/loader/entries/*.conf` on the device's mount, sorted by reverse
/// `strverscmp` of the filename stem, and build one option per file.
pub fn scan(device: &DiscoverDevice, env: &BTreeMap<String, String>) -> Vec<DiscoverBootOption> {
    let Some(mount) = device.mount.mount_path.clone() else {
        return Vec::new();
    };
    let pattern = mount.join("loader").join("entries").join("*.conf");
    let mut paths: Vec<_> = match glob::glob(pattern.as_str()) {
        Ok(paths) => paths.filter_map(Result::ok).collect(),
        Err(_) => return Vec::new(),
    };
    paths.sort_by(|a, b| {
        let stem_a = a.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        let stem_b = b.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
        strverscmp(stem_b, stem_a)
    });

    let mut options = Vec::new();
    for path in paths {
        let Ok(text) = std::fs::read_to_string(&path) else { continue };
        let fields = parse_entry(&text);
        let Some(linux) = fields.get("linux").cloned() else { continue };
        let title = fields.get("title").cloned().unwrap_or_else(|| "BLS entry".to_string());
        let mut options_str = fields.get("options").cloned();
        if let Some(opt) = &options_str {
            if let Some(var) = opt.strip_prefix('$') {
                options_str = env.get(var).cloned();
            }
        }
        let id = fields
            .get("machine-id")
            .zip(fields.get("version"))
            .map(|(m, v)| format!("{}#{m}-{v}", device.id))
            .unwrap_or_else(|| format!("{}#{title}", device.id));

        options.push(DiscoverBootOption {
            boot_image: Some(Resource::DevPathPending {
                device_spec: device.id.clone(),
                path: linux,
            }),
            initrd: fields.get("initrd").cloned().map(|path| Resource::DevPathPending {
                device_spec: device.id.clone(),
                path,
            }),
            dtb: fields.get("devicetree").cloned().map(|path| Resource::DevPathPending {
                device_spec: device.id.clone(),
                path,
            }),
            icon: None,
            option: BootOption {
                id,
                name: title,
                description: None,
                icon: None,
                boot_image: None,
                initrd: None,
                boot_args: options_str,
                is_default: false,
            },
            parser_name: "grub2",
            origin_device_id: device.id.clone(),
        });
    }
    options
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strverscmp_orders_numeric_runs_numerically() {
        assert_eq!(strverscmp("10", "9"), std::cmp::Ordering::Greater);
        assert_eq!(strverscmp("1.2.3", "1.2.10"), std::cmp::Ordering::Less);
    }

    #[test]
    fn parses_entry_fields() {
        let fields = parse_entry("title Fedora\nlinux /vmlinuz\noptions root=/dev/sda1\n");
        assert_eq!(fields.get("title").map(String::as_str), Some("Fedora"));
        assert_eq!(fields.get("linux").map(String::as_str), Some("/vmlinuz"));
    }
}
