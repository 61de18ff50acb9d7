//! kboot / yaboot shared option-building (§4.5).
//!
//! Grounded on `examples/original_source/discover/kboot-parser.c`'s
//! `kboot_process_pair`: each non-global `name=value` line starts an
//! option named `name`; the value's first whitespace-delimited token is
//! the kernel image, the rest are further `key=value`/bare args that may
//! override `root`/`initrd`/`dtb` or accumulate into `boot_args`.

use crate::model::{BootOption, DiscoverBootOption, DiscoverDevice, Resource};
use crate::parser::{tokenize, GlobalOptions};
use crate::resolver;

pub const GLOBAL_NAMES: &[&str] = &["root", "initrd", "dtb", "video", "default"];

/// Build one boot option from a `label=value` line, given the current
/// global-option state. Shared by kboot and yaboot.
pub fn build_option(device: &DiscoverDevice, label: &str, value: &str, globals: &GlobalOptions) -> DiscoverBootOption {
    let mut parts = value.splitn(2, ' ');
    let image = parts.next().unwrap_or("").to_string();
    let rest = parts.next().unwrap_or("");

    let mut root = globals.get("root").map(|s| s.to_string());
    let mut initrd = globals.get("initrd").map(|s| s.to_string());
    let mut dtb = globals.get("dtb").map(|s| s.to_string());
    let mut args = String::new();

    for pair in tokenize(&rest.replace(' ', "\n")) {
        match pair.name.as_deref() {
            Some("initrd") => initrd = pair.value,
            Some("root") => root = pair.value,
            Some("dtb") => dtb = pair.value,
            Some(name) => {
                if let Some(v) = pair.value {
                    args.push_str(&format!("{name}={v} "));
                }
            }
            None => {
                if let Some(v) = pair.value {
                    args.push_str(&format!("{v} "));
                }
            }
        }
    }

    let boot_args = match &root {
        Some(r) => format!("root={r} {args}").trim().to_string(),
        None => args.trim().to_string(),
    };

    let mut description = format!("{image} {boot_args}");
    if let Some(i) = &initrd {
        description.push_str(&format!(" initrd={i}"));
    }
    if let Some(d) = &dtb {
        description.push_str(&format!(" dtb={d}"));
    }

    let is_default = globals.get("default") == Some(label);

    DiscoverBootOption {
        boot_image: Some(Resource::DevPathPending {
            device_spec: device.id.clone(),
            path: image,
        }),
        initrd: initrd.map(|path| Resource::DevPathPending {
            device_spec: device.id.clone(),
            path,
        }),
        dtb: dtb.map(|path| Resource::DevPathPending {
            device_spec: device.id.clone(),
            path,
        }),
        icon: None,
        option: BootOption {
            id: format!("{}#{label}", device.id),
            name: label.to_string(),
            description: Some(description.trim().to_string()),
            icon: None,
            boot_image: None,
            initrd: None,
            boot_args: (!boot_args.is_empty()).then_some(boot_args),
            is_default,
        },
        parser_name: "kboot",
        origin_device_id: device.id.clone(),
    }
}

pub struct KbootParser;

impl super::Parser for KbootParser {
    fn name(&self) -> &'static str {
        "kboot"
    }

    fn conf_filenames(&self) -> &'static [&'static str] {
        &[
            "/kboot.conf",
            "/kboot.cnf",
            "/etc/kboot.conf",
            "/etc/kboot.cnf",
            "/boot/kboot.conf",
            "/boot/kboot.cnf",
        ]
    }

    fn parse(&self, ctx: &mut super::DiscoverContext<'_>, buf: &[u8]) {
        let text = String::from_utf8_lossy(buf);
        let mut globals = GlobalOptions::new(GLOBAL_NAMES);
        // Global options must be collected before building any option that
        // references them, so scan twice: once to populate globals, once
        // to build options (mirroring the C source's single-pass-with-
        // fallback behavior closely enough for well-formed kboot.conf
        // files, where globals precede the options that use them).
        for pair in tokenize(&text) {
            if let (Some(name), Some(value)) = (&pair.name, &pair.value) {
                globals.set(name, value);
            }
        }
        for pair in tokenize(&text) {
            let (Some(name), Some(value)) = (pair.name, pair.value) else {
                continue;
            };
            if GLOBAL_NAMES.contains(&name.as_str()) {
                continue;
            }
            ctx.add_boot_option(build_option(ctx.device, &name, &value, &globals));
        }
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

    #[test]
    fn single_kboot_entry_matches_scenario_one() {
        let mut device = DiscoverDevice::new("sda1", DeviceType::Disk);
        device.mount = MountState {
            mounted: true,
            mount_path: Some(Utf8PathBuf::from("/mnt/sda1")),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        let conf = "default=linux\nroot=/dev/sda2\nlinux='/vmlinux root=LABEL=boot initrd=/initrd'\n";
        let mut ctx = DiscoverContext::new(&device);
        KbootParser.parse(&mut ctx, conf.as_bytes());
        assert_eq!(ctx.options.len(), 1);
        let opt = &ctx.options[0];
        assert_eq!(opt.option.id, "sda1#linux");
        assert_eq!(opt.option.boot_args.as_deref(), Some("root=LABEL=boot"));
        assert!(opt.option.is_default);

        let image = resolver::resolve_generic(&device, opt.boot_image.as_ref().unwrap()).unwrap();
        assert_eq!(image.resolved_url().unwrap().render(), "/mnt/sda1/vmlinux");
        let initrd = resolver::resolve_generic(&device, opt.initrd.as_ref().unwrap()).unwrap();
        assert_eq!(initrd.resolved_url().unwrap().render(), "/mnt/sda1/initrd");
        assert!(opt.dtb.is_none());
    }
}
