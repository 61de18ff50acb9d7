//! grub2 (§4.5): full script evaluator (scanner → ast → exec) plus the BLS
//! extension.

pub mod ast;
pub mod bls;
pub mod exec;
pub mod scanner;

use crate::model::{DiscoverDevice, Resource};
use crate::resolver;

pub struct Grub2Parser;

impl super::Parser for Grub2Parser {
    fn name(&self) -> &'static str {
        "grub2"
    }

    fn conf_filenames(&self) -> &'static [&'static str] {
        &[
            "/boot/grub2/grub.cfg",
            "/boot/grub/grub.cfg",
            "/grub2/grub.cfg",
            "/grub/grub.cfg",
            "/EFI/BOOT/grub.cfg",
        ]
    }

    fn parse(&self, ctx: &mut super::DiscoverContext<'_>, buf: &[u8]) {
        let text = String::from_utf8_lossy(buf);
        let stmts = ast::parse(&text);
        exec::run(ctx, &stmts);
    }

    fn resolve_resource(&self, device: &DiscoverDevice, resource: &Resource) -> Option<Resource> {
        resolver::resolve_generic(device, resource)
    }
}
