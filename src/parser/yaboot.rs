//! yaboot (§4.5): shares kboot's option-building helpers. Recognizes a
//! wider global-option set (`device`, `partition`, `literal`, `ramdisk`)
//! but builds options the same way: a non-global key starts an option.

use crate::model::{DiscoverDevice, Resource};
use crate::parser::kboot::build_option;
use crate::parser::{tokenize, GlobalOptions};
use crate::resolver;

pub const GLOBAL_NAMES: &[&str] = &[
    "root", "initrd", "dtb", "video", "default", "device", "partition", "literal", "ramdisk",
];

pub struct YabootParser;

impl super::Parser for YabootParser {
    fn name(&self) -> &'static str {
        "yaboot"
    }

    fn conf_filenames(&self) -> &'static [&'static str] {
        &["/yaboot.conf", "/etc/yaboot.conf", "/boot/etc/yaboot.conf"]
    }

    fn parse(&self, ctx: &mut super::DiscoverContext<'_>, buf: &[u8]) {
        let text = String::from_utf8_lossy(buf);
        let mut globals = GlobalOptions::new(GLOBAL_NAMES);
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
            let mut opt = build_option(ctx.device, &name, &value, &globals);
            opt.parser_name = "yaboot";
            ctx.add_boot_option(opt);
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
    fn yaboot_entry_builds_one_option() {
        let mut device = DiscoverDevice::new("sdb2", DeviceType::Disk);
        device.mount = MountState {
            mounted: true,
            mount_path: Some(Utf8PathBuf::from("/mnt/sdb2")),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        let conf = "default=linux\ninitrd=/initrd.img\nlinux='/vmlinuz root=/dev/sdb2'\n";
        let mut ctx = DiscoverContext::new(&device);
        YabootParser.parse(&mut ctx, conf.as_bytes());
        assert_eq!(ctx.options.len(), 1);
        assert_eq!(ctx.options[0].parser_name, "yaboot");
        assert!(ctx.options[0].option.is_default);
    }
}
