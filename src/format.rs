//! Template formatter: expands `@@PLACEHOLDER@@` markers in the command
//! template sets into concrete QMP command lines or process arguments.

use std::path::Path;

use serde_json::{Map, Value};

use crate::{ColodError, Result};

const DECL_FMTS: [&str; 4] = [
    "@@DECL_COMP_PROP@@",
    "@@DECL_MIG_PROP@@",
    "@@DECL_THROTTLE_PROP@@",
    "@@DECL_BLK_MIRROR_PROP@@",
];

const PROP_FMTS: [&str; 4] = [
    "@@COMP_PROP@@",
    "@@MIG_PROP@@",
    "@@THROTTLE_PROP@@",
    "@@BLK_MIRROR_PROP@@",
];

/// Bindings for one formatting pass. Unset strings substitute as empty,
/// unset properties as `{}` / `[]`, which is what template validation with
/// null bindings relies on.
#[derive(Default)]
pub struct FormatterParams<'a> {
    pub instance_name: &'a str,
    pub base_dir: &'a str,
    pub active_hidden_dir: &'a str,
    pub address: &'a str,
    pub listen_address: &'a str,
    pub qemu_binary: &'a str,
    pub qemu_img_binary: &'a str,
    pub disk_size: &'a str,
    pub filter_rewriter: bool,
    pub newline: bool,
    pub comp_prop: Option<&'a Value>,
    pub mig_cap: Option<&'a Value>,
    pub mig_prop: Option<&'a Value>,
    pub throttle_prop: Option<&'a Value>,
    pub blk_mirror_prop: Option<&'a Value>,
    pub qemu_options: Option<&'a Value>,
    pub base_port: u16,
}

pub struct Formatter {
    address: String,
    listen_address: String,
    qemu_binary: String,
    qemu_img_binary: String,
    disk_size: String,
    filter_rewriter: bool,
    newline: bool,
    props: [Value; 4],
    mig_cap: String,
    qemu_options: Value,
    decl: [Option<String>; 4],

    active_image: String,
    hidden_image: String,
    qmp_sock: String,
    qmp_yank_sock: String,
    comp_pri_sock: String,
    comp_out_sock: String,
    nbd_port: String,
    migrate_port: String,
    mirror_port: String,
    compare_in_port: String,
}

pub fn qmp_sock_path(base_dir: &Path) -> std::path::PathBuf {
    base_dir.join("qmp.sock")
}

pub fn qmp_yank_sock_path(base_dir: &Path) -> std::path::PathBuf {
    base_dir.join("qmp-yank.sock")
}

fn join_path(dir: &str, file: &str) -> String {
    Path::new(dir).join(file).to_string_lossy().into_owned()
}

fn prop_or_empty(prop: Option<&Value>) -> Value {
    prop.cloned().unwrap_or_else(|| Value::Object(Map::new()))
}

impl Formatter {
    pub fn new(params: &FormatterParams) -> Self {
        let mig_cap = params
            .mig_cap
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()))
            .to_string();
        let qemu_options = params
            .qemu_options
            .cloned()
            .unwrap_or_else(|| Value::Array(Vec::new()));

        Self {
            address: params.address.to_string(),
            listen_address: params.listen_address.to_string(),
            qemu_binary: params.qemu_binary.to_string(),
            qemu_img_binary: params.qemu_img_binary.to_string(),
            disk_size: params.disk_size.to_string(),
            filter_rewriter: params.filter_rewriter,
            newline: params.newline,
            props: [
                prop_or_empty(params.comp_prop),
                prop_or_empty(params.mig_prop),
                prop_or_empty(params.throttle_prop),
                prop_or_empty(params.blk_mirror_prop),
            ],
            mig_cap,
            qemu_options,
            decl: [None, None, None, None],

            active_image: join_path(
                params.active_hidden_dir,
                &format!("{}-active.qcow2", params.instance_name),
            ),
            hidden_image: join_path(
                params.active_hidden_dir,
                &format!("{}-hidden.qcow2", params.instance_name),
            ),
            qmp_sock: join_path(params.base_dir, "qmp.sock"),
            qmp_yank_sock: join_path(params.base_dir, "qmp-yank.sock"),
            comp_pri_sock: join_path(params.base_dir, "comp-pri-in0.sock"),
            comp_out_sock: join_path(params.base_dir, "comp-out0.sock"),
            nbd_port: params.base_port.to_string(),
            migrate_port: (u32::from(params.base_port) + 1).to_string(),
            mirror_port: (u32::from(params.base_port) + 2).to_string(),
            compare_in_port: (u32::from(params.base_port) + 3).to_string(),
        }
    }

    /// Expand a whole template sequence. Any unresolved `@@` marker, malformed
    /// DECL line or duplicate DECL is an error.
    pub fn format(mut self, entry: &[String]) -> Result<Vec<String>> {
        let mut out = Vec::with_capacity(entry.len());
        for template in entry {
            self.format_one(&mut out, template)?;
        }
        Ok(out)
    }

    fn format_one(&mut self, out: &mut Vec<String>, template: &str) -> Result<()> {
        if template.contains("@@QEMU_OPTIONS@@") {
            return self.splice_qemu_options(out);
        }

        if DECL_FMTS.iter().any(|decl| template.contains(decl)) {
            return self.handle_decl(template);
        }

        let if_rewriter = template.contains("@@IF_REWRITER@@");
        let if_not_rewriter = template.contains("@@IF_NOT_REWRITER@@");
        if self.filter_rewriter {
            if if_not_rewriter {
                return Ok(());
            }
        } else if if_rewriter {
            return Ok(());
        }

        let mut command = template.to_string();
        command = command.replace("@@IF_NOT_REWRITER@@", "");
        command = command.replace("@@IF_REWRITER@@", "");

        command = command.replace("@@ADDRESS@@", &self.address);
        command = command.replace("@@LISTEN_ADDRESS@@", &self.listen_address);
        command = command.replace("@@QEMU_BINARY@@", &self.qemu_binary);
        command = command.replace("@@QEMU_IMG_BINARY@@", &self.qemu_img_binary);
        command = command.replace("@@DISK_SIZE@@", &self.disk_size);

        command = command.replace("@@ACTIVE_IMAGE@@", &self.active_image);
        command = command.replace("@@HIDDEN_IMAGE@@", &self.hidden_image);
        command = command.replace("@@QMP_SOCK@@", &self.qmp_sock);
        command = command.replace("@@QMP_YANK_SOCK@@", &self.qmp_yank_sock);
        command = command.replace("@@COMP_PRI_SOCK@@", &self.comp_pri_sock);
        command = command.replace("@@COMP_OUT_SOCK@@", &self.comp_out_sock);

        command = command.replace("@@NBD_PORT@@", &self.nbd_port);
        command = command.replace("@@MIGRATE_PORT@@", &self.migrate_port);
        command = command.replace("@@MIRROR_PORT@@", &self.mirror_port);
        command = command.replace("@@COMPARE_IN_PORT@@", &self.compare_in_port);

        command = command.replace("@@MIG_CAP@@", &self.mig_cap);

        for (i, prop_fmt) in PROP_FMTS.iter().enumerate() {
            if !command.contains(prop_fmt) {
                continue;
            }
            let Some(rendered) = &self.decl[i] else {
                return Err(ColodError::Fatal(format!(
                    "{} used without a preceding declaration",
                    prop_fmt
                )));
            };
            command = command.replace(prop_fmt, rendered);
        }

        if command.contains("@@") {
            return Err(ColodError::Fatal(format!(
                "Unresolved placeholder in template: {}",
                command
            )));
        }

        if self.newline {
            command.push('\n');
        }
        out.push(command);
        Ok(())
    }

    /// A `@@DECL_X@@ {defaults}` line merges operator-supplied properties over
    /// the template defaults and emits nothing.
    fn handle_decl(&mut self, template: &str) -> Result<()> {
        for (i, decl_fmt) in DECL_FMTS.iter().enumerate() {
            if !template.contains(decl_fmt) {
                continue;
            }

            if self.decl[i].is_some() {
                return Err(ColodError::Fatal(format!(
                    "Duplicate declaration: {}",
                    decl_fmt
                )));
            }

            let stripped = template.replace(decl_fmt, "");
            if stripped.contains("@@") {
                return Err(ColodError::Fatal(format!(
                    "Unresolved placeholder in declaration: {}",
                    template
                )));
            }

            let defaults: Value = serde_json::from_str(stripped.trim()).map_err(|_| {
                ColodError::Fatal(format!("Declaration is not valid json: {}", template))
            })?;
            let Value::Object(mut merged) = defaults else {
                return Err(ColodError::Fatal(format!(
                    "Declaration must be a json object: {}",
                    template
                )));
            };

            if let Value::Object(overrides) = &self.props[i] {
                for (key, value) in overrides {
                    merged.insert(key.clone(), value.clone());
                }
            }

            self.decl[i] = Some(Value::Object(merged).to_string());
            return Ok(());
        }

        Ok(())
    }

    fn splice_qemu_options(&self, out: &mut Vec<String>) -> Result<()> {
        if let Some(options) = self.qemu_options.as_array() {
            for option in options {
                if let Some(word) = option.as_str() {
                    out.push(word.to_string());
                }
            }
        }
        Ok(())
    }
}
