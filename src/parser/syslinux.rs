//! syslinux (§4.5).
//!
//! Grounded on `examples/original_source/discover/syslinux-parser.c`'s
//! directive set (`LABEL`/`KERNEL`/`LINUX`/`APPEND`/`INITRD`/`INCLUDE`),
//! reimplemented over the line tokenizer rather than the source's own
//! hand-rolled directive scanner.

use camino::Utf8Path;

use crate::error::ParseError;
use crate::model::{BootOption, DiscoverBootOption, DiscoverDevice, Resource};
use crate::resolver;

const MAX_INCLUDE_DEPTH: usize = 16;

struct Entry {
    label: Option<String>,
    kernel: Option<String>,
    initrd: Option<String>,
    append: Option<String>,
}

impl Entry {
    fn new() -> Self {
        Entry {
            label: None,
            kernel: None,
            initrd: None,
            append: None,
        }
    }
}

struct State {
    global_append: Option<String>,
    implicit_enabled: bool,
    current: Entry,
    has_current: bool,
}

fn flush(ctx: &mut super::DiscoverContext<'_>, state: &mut State) {
    if !state.has_current {
        return;
    }
    let entry = std::mem::replace(&mut state.current, Entry::new());
    state.has_current = false;

    if entry.label.is_none() && !state.implicit_enabled {
        return;
    }
    let Some(kernel) = entry.kernel else {
        return;
    };
    let label = entry.label.clone().unwrap_or_else(|| "default".to_string());
    let boot_args = entry.append.or_else(|| state.global_append.clone());

    ctx.add_boot_option(DiscoverBootOption {
        boot_image: Some(Resource::DevPathPending {
            device_spec: ctx.device.id.clone(),
            path: kernel,
        }),
        initrd: entry.initrd.map(|path| Resource::DevPathPending {
            device_spec: ctx.device.id.clone(),
            path,
        }),
        dtb: None,
        icon: None,
        option: BootOption {
            id: format!("{}#{label}", ctx.device.id),
            name: label,
            description: None,
            icon: None,
            boot_image: None,
            initrd: None,
            boot_args,
            is_default: false,
        },
        parser_name: "syslinux",
        origin_device_id: ctx.device.id.clone(),
    });
}

fn split_directive(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let idx = line.find(char::is_whitespace).unwrap_or(line.len());
    let keyword = line[..idx].to_ascii_uppercase();
    let value = line[idx..].trim().to_string();
    Some((keyword, value))
}

fn parse_buf(ctx: &mut super::DiscoverContext<'_>, buf: &[u8], root_dir: &Utf8Path, depth: usize, state: &mut State) {
    let text = String::from_utf8_lossy(buf);
    for line in text.lines() {
        let Some((keyword, value)) = split_directive(line) else {
            continue;
        };
        match keyword.as_str() {
            "LABEL" => {
                flush(ctx, state);
                state.current.label = Some(value);
                state.has_current = true;
            }
            "LINUX" | "KERNEL" => {
                if value.ends_with(".c32") || value.ends_with(".com") {
                    continue;
                }
                state.has_current = true;
                state.current.kernel = Some(value);
            }
            "INITRD" => {
                state.has_current = true;
                state.current.initrd = Some(value);
            }
            "APPEND" => {
                state.has_current = true;
                if value == "-" {
                    state.current.append = Some(String::new());
                } else {
                    state.current.append = Some(value);
                }
            }
            "IMPLICIT" => {
                state.implicit_enabled = value.trim() != "0";
            }
            "INCLUDE" => {
                if depth >= MAX_INCLUDE_DEPTH {
                    log::warn!("{}", ParseError::IncludeDepthExceeded { parser: "syslinux", depth });
                    continue;
                }
                let path = root_dir.join(value.trim_start_matches('/'));
                match std::fs::read(&path) {
                    Ok(included) => parse_buf(ctx, &included, root_dir, depth + 1, state),
                    Err(e) => log::warn!("syslinux: INCLUDE {path}: {e}"),
                }
            }
            _ => {}
        }
    }
}

pub struct SyslinuxParser;

impl super::Parser for SyslinuxParser {
    fn name(&self) -> &'static str {
        "syslinux"
    }

    fn conf_filenames(&self) -> &'static [&'static str] {
        &[
            "/extlinux.conf",
            "/syslinux/extlinux.conf",
            "/boot/syslinux/extlinux.conf",
            "/syslinux.cfg",
            "/syslinux/syslinux.cfg",
            "/isolinux/isolinux.cfg",
        ]
    }

    fn parse(&self, ctx: &mut super::DiscoverContext<'_>, buf: &[u8]) {
        let root_dir = match ctx.device.mount.mount_path.clone() {
            Some(p) => p,
            None => return,
        };
        let mut state = State {
            global_append: None,
            implicit_enabled: true,
            current: Entry::new(),
            has_current: false,
        };
        // The global APPEND (before any LABEL) is distinguished from a
        // per-entry APPEND by whether a LABEL has been seen yet.
        let text = String::from_utf8_lossy(buf);
        let mut seen_label = false;
        for line in text.lines() {
            if let Some((kw, value)) = split_directive(line) {
                if kw == "APPEND" && !seen_label {
                    state.global_append = Some(value);
                }
                if kw == "LABEL" {
                    seen_label = true;
                }
            }
        }
        parse_buf(ctx, buf, &root_dir, 0, &mut state);
        flush(ctx, &mut state);
    }

    fn resolve_resource(&self, device: &DiscoverDevice, resource: &Resource) -> Option<Resource> {
        resolver::resolve_generic(device, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceType, MountState};
    use crate::parser::{DiscoverContext, Parser};
    use camino::Utf8PathBuf;

    fn device() -> DiscoverDevice {
        let mut d = DiscoverDevice::new("sda1", DeviceType::Disk);
        d.mount = MountState {
            mounted: true,
            mount_path: Some(Utf8PathBuf::from("/mnt/sda1")),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        d
    }

    #[test]
    fn label_kernel_append_builds_option() {
        let device = device();
        let conf = "APPEND ro quiet\nLABEL linux\n  LINUX /vmlinuz\n  INITRD /initrd.img\n  APPEND root=/dev/sda1\n";
        let mut ctx = DiscoverContext::new(&device);
        SyslinuxParser.parse(&mut ctx, conf.as_bytes());
        assert_eq!(ctx.options.len(), 1);
        let opt = &ctx.options[0];
        assert_eq!(opt.option.name, "linux");
        assert_eq!(opt.option.boot_args.as_deref(), Some("root=/dev/sda1"));
    }

    #[test]
    fn implicit_zero_drops_labelless_entry() {
        let device = device();
        let conf = "IMPLICIT 0\nLINUX /vmlinuz\nLABEL real\nLINUX /vmlinuz2\n";
        let mut ctx = DiscoverContext::new(&device);
        SyslinuxParser.parse(&mut ctx, conf.as_bytes());
        assert_eq!(ctx.options.len(), 1);
        assert_eq!(ctx.options[0].option.name, "real");
    }
}
