//! pxe (§4.5): network-delivered, `LABEL`/`KERNEL`/`APPEND` against the
//! DHCP-provided config URL as base.
//!
//! Grounded on `examples/original_source/discover/pxe-parser.c`'s
//! `pxe_process_pair`: `LABEL` starts a new option, `KERNEL` joins against
//! `ctx->conf_url`, `APPEND` sets `boot_args` directly.

use crate::model::{BootOption, DiscoverBootOption, DiscoverDevice, Resource};

fn split_directive(line: &str) -> Option<(String, String)> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let idx = line.find(char::is_whitespace).unwrap_or(line.len());
    Some((line[..idx].to_ascii_uppercase(), line[idx..].trim().to_string()))
}

pub struct PxeParser;

impl super::Parser for PxeParser {
    fn name(&self) -> &'static str {
        "pxe"
    }

    fn parse(&self, ctx: &mut super::DiscoverContext<'_>, buf: &[u8]) {
        let text = String::from_utf8_lossy(buf);
        let mut current: Option<DiscoverBootOption> = None;

        macro_rules! flush {
            () => {
                if let Some(opt) = current.take() {
                    ctx.add_boot_option(opt);
                }
            };
        }

        for line in text.lines() {
            let Some((keyword, value)) = split_directive(line) else {
                continue;
            };
            match keyword.as_str() {
                "LABEL" => {
                    flush!();
                    current = Some(DiscoverBootOption {
                        boot_image: None,
                        initrd: None,
                        dtb: None,
                        icon: None,
                        option: BootOption {
                            id: format!("{}#{value}", ctx.device.id),
                            name: value,
                            description: None,
                            icon: None,
                            boot_image: None,
                            initrd: None,
                            boot_args: None,
                            is_default: false,
                        },
                        parser_name: "pxe",
                        origin_device_id: ctx.device.id.clone(),
                    });
                }
                "KERNEL" => {
                    if let Some(opt) = current.as_mut() {
                        let resolved = ctx
                            .conf_url
                            .as_ref()
                            .and_then(|base| base.join(&value).ok())
                            .unwrap_or_else(|| crate::url::Url::parse(&value).unwrap_or_else(|_| crate::url::file_url("", &value)));
                        opt.boot_image = Some(Resource::Resolved(resolved));
                    }
                }
                "APPEND" => {
                    if let Some(opt) = current.as_mut() {
                        opt.option.boot_args = Some(value);
                    }
                }
                _ => {}
            }
        }
        flush!();
    }

    fn resolve_resource(&self, device: &DiscoverDevice, resource: &Resource) -> Option<Resource> {
        crate::resolver::resolve_generic(device, resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DeviceType;
    use crate::parser::{DiscoverContext, Parser};
    use crate::url::Url;

    #[test]
    fn label_kernel_append_builds_one_option() {
        let device = DiscoverDevice::new("eth0", DeviceType::Network);
        let mut ctx = DiscoverContext::new(&device);
        ctx.conf_url = Some(Url::parse("tftp://10.0.0.1/pxelinux.cfg/default").unwrap());
        let conf = "LABEL linux\nKERNEL vmlinuz\nAPPEND ro quiet\n";
        PxeParser.parse(&mut ctx, conf.as_bytes());
        assert_eq!(ctx.options.len(), 1);
        let opt = &ctx.options[0];
        assert_eq!(opt.option.boot_args.as_deref(), Some("ro quiet"));
        assert_eq!(opt.boot_image.as_ref().unwrap().resolved_url().unwrap().render(), "tftp://10.0.0.1/pxelinux.cfg/vmlinuz");
    }
}
