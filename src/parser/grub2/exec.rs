//! grub2 script evaluator (§4.5, §9).
//!
//! Carries an environment, a function table, a small built-in command
//! table, and the output list of discovered options. `menuentry` captures
//! the current device context and appends to the output list; `--id=...`
//! in its argv overrides the option id.

use std::collections::BTreeMap;

use crate::model::{BootOption, DiscoverBootOption, Resource};
use crate::parser::DiscoverContext;

use super::ast::Statement;
use super::bls;
use super::scanner::{Word, WordPart};

pub struct ExecState {
    pub env: BTreeMap<String, String>,
    functions: BTreeMap<String, Vec<Statement>>,
    positional: Vec<Vec<String>>,
    current_option: Option<DiscoverBootOption>,
}

impl ExecState {
    pub fn new() -> Self {
        ExecState {
            env: BTreeMap::new(),
            functions: BTreeMap::new(),
            positional: Vec::new(),
            current_option: None,
        }
    }

    fn lookup(&self, name: &str) -> Option<String> {
        if let Ok(n) = name.parse::<usize>() {
            return self.positional.last().and_then(|p| p.get(n.wrapping_sub(1)).cloned());
        }
        self.env.get(name).cloned()
    }

    fn expand_word(&self, word: &Word) -> String {
        word.iter()
            .map(|part| match part {
                WordPart::Literal(s) => s.clone(),
                WordPart::Var { name, .. } => self.lookup(name).unwrap_or_default(),
            })
            .collect()
    }

    /// Expand one scanned word, splitting on whitespace when the word is a
    /// single bare (unquoted) `$var` reference.
    fn expand_word_split(&self, word: &Word) -> Vec<String> {
        if let [WordPart::Var { name, split: true }] = word.as_slice() {
            let value = self.lookup(name).unwrap_or_default();
            let split: Vec<String> = value.split_whitespace().map(|s| s.to_string()).collect();
            if split.is_empty() { vec![String::new()] } else { split }
        } else {
            vec![self.expand_word(word)]
        }
    }

    fn expand_argv(&self, words: &[Word]) -> Vec<String> {
        words.iter().flat_map(|w| self.expand_word_split(w)).collect()
    }
}

/// `(uuid=X)/path` or `(device)/path` → the device group and the path
/// remainder, if the string starts with a parenthesized group.
fn split_device_group(s: &str) -> Option<(String, String)> {
    let s = s.strip_prefix('(')?;
    let idx = s.find(')')?;
    Some((s[..idx].to_string(), s[idx + 1..].to_string()))
}

fn resolve_path_arg(path: &str, root: Option<&str>, device_id: &str) -> Resource {
    let (group, rest) = split_device_group(path)
        .or_else(|| root.and_then(split_device_group).map(|(g, _)| (g, path.to_string())))
        .unwrap_or_else(|| (device_id.to_string(), path.to_string()));

    if let Some(uuid) = group.strip_prefix("uuid=") {
        Resource::Grub2Pending {
            root_uuid: uuid.to_string(),
            path: rest,
        }
    } else {
        Resource::DevPathPending {
            device_spec: group,
            path: rest,
        }
    }
}

fn execute_statements(state: &mut ExecState, ctx: &mut DiscoverContext<'_>, stmts: &[Statement]) {
    for stmt in stmts {
        execute(state, ctx, stmt);
    }
}

fn execute(state: &mut ExecState, ctx: &mut DiscoverContext<'_>, stmt: &Statement) {
    match stmt {
        Statement::Simple(words) => execute_simple(state, ctx, &state.expand_argv(words)),
        Statement::Block(body) => execute_statements(state, ctx, body),
        Statement::If(_cond, then_body, else_body) => {
            // Condition evaluation (`[ ]`/`test` builtins) is not
            // implemented; the then-branch always runs, matching the
            // common case of grub.cfg's unconditional top-level menuentries.
            if !then_body.is_empty() {
                execute_statements(state, ctx, then_body);
            } else {
                execute_statements(state, ctx, else_body);
            }
        }
        Statement::For(var, list_words, body) => {
            for item in state.expand_argv(list_words) {
                state.env.insert(var.clone(), item);
                execute_statements(state, ctx, body);
            }
        }
        Statement::Function(name, body) => {
            state.functions.insert(name.clone(), body.clone());
        }
        Statement::Menuentry(argv_words, body) => {
            let argv = state.expand_argv(argv_words);
            let title = argv.first().cloned().unwrap_or_default();
            let id_override = argv.iter().find_map(|a| a.strip_prefix("--id=").map(str::to_string));
            let id = id_override.unwrap_or_else(|| format!("{}#{}", ctx.device.id, title));
            state.current_option = Some(DiscoverBootOption {
                boot_image: None,
                initrd: None,
                dtb: None,
                icon: None,
                option: BootOption {
                    id,
                    name: title,
                    description: None,
                    icon: None,
                    boot_image: None,
                    initrd: None,
                    boot_args: None,
                    is_default: false,
                },
                parser_name: "grub2",
                origin_device_id: ctx.device.id.clone(),
            });
            execute_statements(state, ctx, body);
            if let Some(opt) = state.current_option.take() {
                ctx.add_boot_option(opt);
            }
        }
    }
}

fn execute_simple(state: &mut ExecState, ctx: &mut DiscoverContext<'_>, argv: &[String]) {
    let Some(cmd) = argv.first() else { return };
    match cmd.as_str() {
        "set" => {
            if let Some(assignment) = argv.get(1) {
                if let Some((name, value)) = assignment.split_once('=') {
                    state.env.insert(name.to_string(), value.to_string());
                } else if let Some(value) = argv.get(2) {
                    state.env.insert(assignment.clone(), value.clone());
                }
            }
        }
        "load_env" => {
            if let Some(mount) = ctx.device.mount.mount_path.clone() {
                let path = mount.join("grub2").join("grubenv");
                if let Ok(text) = std::fs::read_to_string(&path) {
                    for line in text.lines() {
                        if let Some((k, v)) = line.split_once('=') {
                            state.env.insert(k.to_string(), v.to_string());
                        }
                    }
                }
            }
        }
        "save_env" => {
            log::debug!("grub2: save_env is a no-op during discovery");
        }
        "blscfg" => {
            for opt in bls::scan(ctx.device, &state.env) {
                ctx.add_boot_option(opt);
            }
        }
        "linux" | "linux16" => set_resource(state, ctx, argv, ResourceSlot::BootImage),
        "initrd" | "initrd16" => set_resource(state, ctx, argv, ResourceSlot::Initrd),
        "devicetree" => set_resource(state, ctx, argv, ResourceSlot::Dtb),
        _ => {
            if let Some(body) = state.functions.get(cmd).cloned() {
                state.positional.push(argv[1..].to_vec());
                execute_statements(state, ctx, &body);
                state.positional.pop();
            }
        }
    }
}

enum ResourceSlot {
    BootImage,
    Initrd,
    Dtb,
}

fn set_resource(state: &mut ExecState, ctx: &mut DiscoverContext<'_>, argv: &[String], slot: ResourceSlot) {
    let Some(path) = argv.get(1) else { return };
    let resource = resolve_path_arg(path, state.env.get("root").map(String::as_str), &ctx.device.id);
    let rest = argv.get(2..).unwrap_or(&[]).join(" ");
    let Some(opt) = state.current_option.as_mut() else { return };
    match slot {
        ResourceSlot::BootImage => {
            opt.boot_image = Some(resource);
            if !rest.is_empty() {
                opt.option.boot_args = Some(rest);
            }
        }
        ResourceSlot::Initrd => opt.initrd = Some(resource),
        ResourceSlot::Dtb => opt.dtb = Some(resource),
    }
}

/// Execute a fully-parsed script, then apply grub2's own `default`
/// selection (env var matched against id, then name, then numeric index).
pub fn run(ctx: &mut DiscoverContext<'_>, stmts: &[Statement]) {
    let mut state = ExecState::new();
    let before = ctx.options.len();
    execute_statements(&mut state, ctx, stmts);

    let Some(default) = state.env.get("default").cloned() else {
        return;
    };
    let produced = &mut ctx.options[before..];
    if let Some(opt) = produced.iter_mut().find(|o| o.option.id == default) {
        opt.option.is_default = true;
        return;
    }
    if let Some(opt) = produced.iter_mut().find(|o| o.option.name == default) {
        opt.option.is_default = true;
        return;
    }
    if let Ok(idx) = default.parse::<usize>() {
        if let Some(opt) = produced.get_mut(idx) {
            opt.option.is_default = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceType, DiscoverDevice, MountState};
    use camino::Utf8PathBuf;

    fn device(id: &str, uuid: Option<&str>) -> DiscoverDevice {
        let mut d = DiscoverDevice::new(id, DeviceType::Disk);
        d.uuid = uuid.map(str::to_string);
        d.mount = MountState {
            mounted: true,
            mount_path: Some(Utf8PathBuf::from(format!("/mnt/{id}"))),
            mounted_rw: false,
            unmount_on_drop: true,
        };
        d
    }

    #[test]
    fn cross_device_menuentry_produces_grub2_pending_resources() {
        let device_a = device("sda1", Some("AAA"));
        let stmts = super::super::ast::parse("menuentry 'X' { set root=(uuid=BBB); linux /vm ; initrd /ird }");
        let mut ctx = DiscoverContext::new(&device_a);
        run(&mut ctx, &stmts);
        assert_eq!(ctx.options.len(), 1);
        let opt = &ctx.options[0];
        match opt.boot_image.as_ref().unwrap() {
            Resource::Grub2Pending { root_uuid, path } => {
                assert_eq!(root_uuid, "BBB");
                assert_eq!(path, "/vm");
            }
            other => panic!("expected Grub2Pending, got {other:?}"),
        }
    }

    #[test]
    fn default_env_var_selects_by_id() {
        let device_a = device("sda1", None);
        let stmts = super::super::ast::parse("set default=sda1#two; menuentry 'one' { linux /a }; menuentry 'two' { linux /b }");
        let mut ctx = DiscoverContext::new(&device_a);
        run(&mut ctx, &stmts);
        assert!(!ctx.options[0].option.is_default);
        assert!(ctx.options[1].option.is_default);
    }
}
