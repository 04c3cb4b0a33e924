//! The command template sets: named sequences of template strings that the
//! coordinator formats and replays against QEMU at the migration, switchover
//! and failover boundaries, plus the argument templates used to assemble
//! QEMU command lines.
//!
//! Operators replace individual sets over the control socket; every new set
//! is validated by running it through the formatter with null bindings.

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::format::{Formatter, FormatterParams};
use crate::{ColodError, Result};

pub struct QmpCommands {
    instance_name: String,
    base_dir: String,
    active_hidden_dir: String,
    listen_address: String,
    qemu_binary: String,
    qemu_img_binary: String,
    base_port: u16,
    filter_rewriter: bool,
    comp_prop: Option<Value>,
    mig_cap: Option<Value>,
    mig_prop: Option<Value>,
    throttle_prop: Option<Value>,
    blk_mirror_prop: Option<Value>,
    qemu_options: Option<Value>,
    yank_instances: Value,

    qemu_primary: Vec<String>,
    qemu_secondary: Vec<String>,
    prepare_primary: Vec<String>,
    prepare_secondary: Vec<String>,
    migration_start: Vec<String>,
    migration_switchover: Vec<String>,
    failover_primary: Vec<String>,
    failover_secondary: Vec<String>,
}

fn static_set(entries: &[&str]) -> Vec<String> {
    let set: Vec<String> = entries.iter().map(|entry| entry.to_string()).collect();
    // built-in templates must survive the null-binding check
    format_check(&set).expect("built-in template set is invalid");
    set
}

/// Validate a template set by formatting it with null bindings.
fn format_check(set: &[String]) -> Result<()> {
    let params = FormatterParams {
        newline: true,
        base_port: 9000,
        ..Default::default()
    };
    Formatter::new(&params).format(set)?;
    Ok(())
}

fn commands_from_json(commands: &Value) -> Result<Vec<String>> {
    let Some(array) = commands.as_array() else {
        return Err(ColodError::Qmp("Expected array of strings".to_string()));
    };

    let mut set = Vec::with_capacity(array.len());
    for entry in array {
        let Some(entry) = entry.as_str() else {
            return Err(ColodError::Qmp("Expected array of strings".to_string()));
        };
        set.push(entry.to_string());
    }

    format_check(&set).map_err(|_| ColodError::Qmp("Invalid format".to_string()))?;
    Ok(set)
}

impl QmpCommands {
    pub fn new(
        instance_name: &str,
        base_dir: &str,
        active_hidden_dir: &str,
        listen_address: &str,
        qemu_binary: &str,
        qemu_img_binary: &str,
        base_port: u16,
    ) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            base_dir: base_dir.to_string(),
            active_hidden_dir: active_hidden_dir.to_string(),
            listen_address: listen_address.to_string(),
            qemu_binary: qemu_binary.to_string(),
            qemu_img_binary: qemu_img_binary.to_string(),
            base_port,
            filter_rewriter: false,
            comp_prop: None,
            mig_cap: None,
            mig_prop: None,
            throttle_prop: None,
            blk_mirror_prop: None,
            qemu_options: None,
            yank_instances: json!([
                {"type": "block-node", "node-name": "nbd0"},
                {"type": "chardev", "id": "mirror0"},
                {"type": "chardev", "id": "comp_sec_in0"},
                {"type": "migration"}
            ]),

            qemu_primary: static_set(&[
                "@@QEMU_BINARY@@",
                "@@QEMU_OPTIONS@@",
                "-drive", "if=none,node-name=quorum0,driver=quorum,read-pattern=fifo,vote-threshold=1,children.0=parent0",
                "-drive", "if=none,node-name=colo-disk0,driver=throttle,throttle-group=throttle0,file.driver=raw,file.file=quorum0",
                "-no-shutdown",
                "-no-reboot",
                "-qmp", "unix:@@QMP_SOCK@@,server=on,wait=off",
                "-qmp", "unix:@@QMP_YANK_SOCK@@,server=on,wait=off",
                "-object", "throttle-group,id=throttle0",
            ]),

            qemu_secondary: static_set(&[
                "@@QEMU_BINARY@@",
                "@@QEMU_OPTIONS@@",
                "-chardev", "socket,id=mirror0,host=@@LISTEN_ADDRESS@@,port=@@MIRROR_PORT@@,server=on,wait=off,nodelay=on",
                "-chardev", "socket,id=comp_sec_in0,host=@@LISTEN_ADDRESS@@,port=@@COMPARE_IN_PORT@@,server=on,wait=off,nodelay=on",
                "-object", "filter-redirector,id=mirror0,netdev=hn0,queue=tx,indev=mirror0",
                "-object", "filter-drop,id=drop0,netdev=hn0,queue=rx",
                "-object", "filter-redirector,id=comp_sec_in0,netdev=hn0,queue=rx,outdev=comp_sec_in0",
                "@@IF_REWRITER@@-object", "@@IF_REWRITER@@filter-rewriter,id=rew0,netdev=hn0,queue=all",
                "-drive", "if=none,node-name=childs0,top-id=colo-disk0,driver=replication,mode=secondary,file.driver=qcow2,file.file.filename=@@ACTIVE_IMAGE@@,file.backing.driver=qcow2,file.backing.file.filename=@@HIDDEN_IMAGE@@,file.backing.backing=parent0",
                "-drive", "if=none,node-name=quorum0,driver=quorum,read-pattern=fifo,vote-threshold=1,children.0=childs0",
                "-drive", "if=none,node-name=colo-disk0,driver=throttle,throttle-group=throttle0,file.driver=raw,file.file=quorum0",
                "-incoming", "defer",
                "-no-shutdown",
                "-no-reboot",
                "-qmp", "unix:@@QMP_SOCK@@,server=on,wait=off",
                "-qmp", "unix:@@QMP_YANK_SOCK@@,server=on,wait=off",
                "-object", "throttle-group,id=throttle0",
            ]),

            prepare_primary: static_set(&[
                "@@DECL_THROTTLE_PROP@@ {}",
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/throttle0\", \"property\": \"limits\", \"value\": @@THROTTLE_PROP@@}}",
            ]),

            prepare_secondary: static_set(&[
                "@@DECL_THROTTLE_PROP@@ {}",
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/throttle0\", \"property\": \"limits\", \"value\": @@THROTTLE_PROP@@}}",
                "{\"execute\": \"migrate-set-capabilities\", \"arguments\": {\"capabilities\": [{\"capability\": \"x-colo\", \"state\": true}]}}",
                "{\"execute\": \"migrate-set-capabilities\", \"arguments\": {\"capabilities\": @@MIG_CAP@@}}",
                "@@DECL_MIG_PROP@@ {}",
                "{\"execute\": \"migrate-set-parameters\", \"arguments\": @@MIG_PROP@@}",
                "{\"execute\": \"nbd-server-start\", \"arguments\": {\"addr\": {\"type\": \"inet\", \"data\": {\"host\": \"@@LISTEN_ADDRESS@@\", \"port\": \"@@NBD_PORT@@\"}}}}",
                "{\"execute\": \"nbd-server-add\", \"arguments\": {\"device\": \"parent0\", \"writable\": true}}",
                "{\"execute\": \"migrate-incoming\", \"arguments\": {\"uri\": \"tcp:@@LISTEN_ADDRESS@@:@@MIGRATE_PORT@@\"}}",
            ]),

            migration_start: static_set(&[
                "{\"execute\": \"migrate-set-capabilities\", \"arguments\": {\"capabilities\": [{\"capability\": \"x-colo\", \"state\": true}]}}",
                "{\"execute\": \"chardev-add\", \"arguments\": {\"id\": \"comp_pri_in0..\", \"backend\": {\"type\": \"socket\", \"data\": {\"addr\": {\"type\": \"unix\", \"data\": {\"path\": \"@@COMP_PRI_SOCK@@\"}}, \"server\": true}}}}",
                "{\"execute\": \"chardev-add\", \"arguments\": {\"id\": \"comp_pri_in0\", \"backend\": {\"type\": \"socket\", \"data\": {\"addr\": {\"type\": \"unix\", \"data\": {\"path\": \"@@COMP_PRI_SOCK@@\"}}, \"server\": false}}}}",
                "{\"execute\": \"chardev-add\", \"arguments\": {\"id\": \"comp_out0..\", \"backend\": {\"type\": \"socket\", \"data\": {\"addr\": {\"type\": \"unix\", \"data\": {\"path\": \"@@COMP_OUT_SOCK@@\"}}, \"server\": true}}}}",
                "{\"execute\": \"chardev-add\", \"arguments\": {\"id\": \"comp_out0\", \"backend\": {\"type\": \"socket\", \"data\": {\"addr\": {\"type\": \"unix\", \"data\": {\"path\": \"@@COMP_OUT_SOCK@@\"}}, \"server\": false}}}}",
                "{\"execute\": \"chardev-add\", \"arguments\": {\"id\": \"mirror0\", \"backend\": {\"type\": \"socket\", \"data\": {\"addr\": {\"type\": \"inet\", \"data\": {\"host\": \"@@ADDRESS@@\", \"port\": \"@@MIRROR_PORT@@\"}}, \"server\": false, \"nodelay\": true}}}}",
                "{\"execute\": \"chardev-add\", \"arguments\": {\"id\": \"comp_sec_in0\", \"backend\": {\"type\": \"socket\", \"data\": {\"addr\": {\"type\": \"inet\", \"data\": {\"host\": \"@@ADDRESS@@\", \"port\": \"@@COMPARE_IN_PORT@@\"}}, \"server\": false, \"nodelay\": true}}}}",
                "@@IF_REWRITER@@ {\"execute\": \"object-add\", \"arguments\": {\"qom-type\": \"filter-mirror\", \"id\": \"mirror0\", \"status\": \"off\", \"insert\": \"before\", \"position\": \"id=rew0\", \"netdev\": \"hn0\", \"queue\": \"tx\", \"outdev\": \"mirror0\"}}",
                "@@IF_REWRITER@@ {\"execute\": \"object-add\", \"arguments\": {\"qom-type\": \"filter-redirector\", \"id\": \"comp_out0\", \"insert\": \"before\", \"position\": \"id=rew0\", \"netdev\": \"hn0\", \"queue\": \"rx\", \"indev\": \"comp_out0..\"}}",
                "@@IF_REWRITER@@ {\"execute\": \"object-add\", \"arguments\": {\"qom-type\": \"filter-redirector\", \"id\": \"comp_pri_in0\", \"status\": \"off\", \"insert\": \"before\", \"position\": \"id=rew0\", \"netdev\": \"hn0\", \"queue\": \"rx\", \"outdev\": \"comp_pri_in0..\"}}",
                "@@IF_NOT_REWRITER@@ {\"execute\": \"object-add\", \"arguments\": {\"qom-type\": \"filter-mirror\", \"id\": \"mirror0\", \"status\": \"off\", \"netdev\": \"hn0\", \"queue\": \"tx\", \"outdev\": \"mirror0\"}}",
                "@@IF_NOT_REWRITER@@ {\"execute\": \"object-add\", \"arguments\": {\"qom-type\": \"filter-redirector\", \"id\": \"comp_out0\", \"netdev\": \"hn0\", \"queue\": \"rx\", \"indev\": \"comp_out0..\"}}",
                "@@IF_NOT_REWRITER@@ {\"execute\": \"object-add\", \"arguments\": {\"qom-type\": \"filter-redirector\", \"id\": \"comp_pri_in0\", \"status\": \"off\", \"netdev\": \"hn0\", \"queue\": \"rx\", \"outdev\": \"comp_pri_in0..\"}}",
                "{\"execute\": \"object-add\", \"arguments\": {\"qom-type\": \"iothread\", \"id\": \"iothread1\"}}",
                "@@DECL_COMP_PROP@@ {\"qom-type\": \"colo-compare\", \"id\": \"comp0\", \"primary_in\": \"comp_pri_in0\", \"secondary_in\": \"comp_sec_in0\", \"outdev\": \"comp_out0\", \"iothread\": \"iothread1\"}",
                "{\"execute\": \"object-add\", \"arguments\": @@COMP_PROP@@}",
                "{\"execute\": \"migrate\", \"arguments\": {\"uri\": \"tcp:@@ADDRESS@@:@@MIGRATE_PORT@@\"}}",
            ]),

            migration_switchover: static_set(&[
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/mirror0\", \"property\": \"status\", \"value\": \"on\"}}",
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/comp_pri_in0\", \"property\": \"status\", \"value\": \"on\"}}",
            ]),

            failover_primary: static_set(&[
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/mirror0\", \"property\": \"status\", \"value\": \"off\"}}",
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/comp_pri_in0\", \"property\": \"status\", \"value\": \"off\"}}",
                "{\"execute\": \"x-blockdev-change\", \"arguments\": {\"parent\": \"quorum0\", \"child\": \"children.1\"}}",
                "{\"execute\": \"x-colo-lost-heartbeat\"}",
                "{\"execute\": \"blockdev-del\", \"arguments\": {\"node-name\": \"nbd0\"}}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"mirror0\"}}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"comp_pri_in0\"}}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"comp_out0\"}}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"comp0\"}}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"iothread1\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"mirror0\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"comp_sec_in0\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"comp_pri_in0..\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"comp_pri_in0\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"comp_out0..\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"comp_out0\"}}",
            ]),

            failover_secondary: static_set(&[
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/drop0\", \"property\": \"status\", \"value\": \"off\"}}",
                "{\"execute\": \"qom-set\", \"arguments\": {\"path\": \"/objects/comp_sec_in0\", \"property\": \"status\", \"value\": \"off\"}}",
                "{\"execute\": \"nbd-server-stop\"}",
                "{\"execute\": \"x-colo-lost-heartbeat\"}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"mirror0\"}}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"drop0\"}}",
                "{\"execute\": \"object-del\", \"arguments\": {\"id\": \"comp_sec_in0\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"mirror0\"}}",
                "{\"execute\": \"chardev-remove\", \"arguments\": {\"id\": \"comp_sec_in0\"}}",
            ]),
        }
    }

    fn params<'a>(&'a self, address: &'a str, disk_size: &'a str, newline: bool) -> FormatterParams<'a> {
        FormatterParams {
            instance_name: &self.instance_name,
            base_dir: &self.base_dir,
            active_hidden_dir: &self.active_hidden_dir,
            address,
            listen_address: &self.listen_address,
            qemu_binary: &self.qemu_binary,
            qemu_img_binary: &self.qemu_img_binary,
            disk_size,
            filter_rewriter: self.filter_rewriter,
            newline,
            comp_prop: self.comp_prop.as_ref(),
            mig_cap: self.mig_cap.as_ref(),
            mig_prop: self.mig_prop.as_ref(),
            throttle_prop: self.throttle_prop.as_ref(),
            blk_mirror_prop: self.blk_mirror_prop.as_ref(),
            qemu_options: self.qemu_options.as_ref(),
            base_port: self.base_port,
        }
    }

    fn format(&self, entry: &[String], address: &str) -> Result<Vec<String>> {
        Formatter::new(&self.params(address, "", false)).format(entry)
    }

    fn format_cmdline(&self, entry: &[String]) -> Result<Vec<String>> {
        Formatter::new(&self.params("", "", false)).format(entry)
    }

    pub fn get_qemu_primary(&self) -> Result<Vec<String>> {
        self.format_cmdline(&self.qemu_primary)
    }

    pub fn get_qemu_secondary(&self) -> Result<Vec<String>> {
        self.format_cmdline(&self.qemu_secondary)
    }

    pub fn get_prepare_primary(&self) -> Result<Vec<String>> {
        self.format(&self.prepare_primary, "")
    }

    pub fn get_prepare_secondary(&self) -> Result<Vec<String>> {
        self.format(&self.prepare_secondary, "")
    }

    pub fn get_migration_start(&self, address: &str) -> Result<Vec<String>> {
        self.format(&self.migration_start, address)
    }

    pub fn get_migration_switchover(&self) -> Result<Vec<String>> {
        self.format(&self.migration_switchover, "")
    }

    pub fn get_failover_primary(&self) -> Result<Vec<String>> {
        self.format(&self.failover_primary, "")
    }

    pub fn get_failover_secondary(&self) -> Result<Vec<String>> {
        self.format(&self.failover_secondary, "")
    }

    pub fn set_prepare_secondary(&mut self, commands: &Value) -> Result<()> {
        self.prepare_secondary = commands_from_json(commands)?;
        Ok(())
    }

    pub fn set_migration_start(&mut self, commands: &Value) -> Result<()> {
        self.migration_start = commands_from_json(commands)?;
        Ok(())
    }

    pub fn set_migration_switchover(&mut self, commands: &Value) -> Result<()> {
        self.migration_switchover = commands_from_json(commands)?;
        Ok(())
    }

    pub fn set_failover_primary(&mut self, commands: &Value) -> Result<()> {
        self.failover_primary = commands_from_json(commands)?;
        Ok(())
    }

    pub fn set_failover_secondary(&mut self, commands: &Value) -> Result<()> {
        self.failover_secondary = commands_from_json(commands)?;
        Ok(())
    }

    pub fn set_filter_rewriter(&mut self, filter_rewriter: bool) {
        self.filter_rewriter = filter_rewriter;
    }

    pub fn yank_instances(&self) -> Value {
        self.yank_instances.clone()
    }

    pub fn set_yank_instances(&mut self, instances: Value) {
        debug_assert!(instances.is_array());
        self.yank_instances = instances;
    }

    /// Split a qemu options string into words.
    pub fn set_qemu_options_str(&mut self, options: &str) {
        let words: Vec<Value> = options
            .split_whitespace()
            .map(|word| Value::String(word.to_string()))
            .collect();
        self.qemu_options = Some(Value::Array(words));
    }

    /// Load the advanced configuration: a JSON object merged over built-in
    /// defaults, with recursive `include` resolution.
    pub fn read_config(&mut self, config_str: &str, qemu_options: &str) -> Result<()> {
        let config = parse_config(config_str, qemu_options)?;
        check_config(&config)?;

        let object = config.as_object().unwrap();

        self.filter_rewriter = object["filter-rewriter"].as_bool().unwrap();
        self.set_qemu_options_str(object["qemu-options-str"].as_str().unwrap());
        self.comp_prop = Some(object["colo-compare-options"].clone());
        self.mig_cap = Some(object["migration-capabilities"].clone());
        self.mig_prop = Some(object["migration-parameters"].clone());
        self.throttle_prop = Some(object["throttle-limits"].clone());
        self.blk_mirror_prop = Some(object["blockdev-mirror-arguments"].clone());

        Ok(())
    }
}

fn object_update(to: &mut Map<String, Value>, from: &Map<String, Value>) {
    for (key, value) in from {
        to.insert(key.clone(), value.clone());
    }
}

fn parse_config_node(config_str: &str) -> Result<Value> {
    let node: Value = serde_json::from_str(config_str)?;
    let Some(object) = node.as_object() else {
        return Err(ColodError::Fatal("config must be an object".to_string()));
    };

    let Some(include_node) = object.get("include") else {
        return Ok(node);
    };
    let Some(include_path) = include_node.as_str() else {
        return Err(ColodError::Fatal("invalid include member".to_string()));
    };

    let include_str = std::fs::read_to_string(Path::new(include_path))?;
    let included = parse_config_node(&include_str)?;

    let mut merged = included.as_object().unwrap().clone();
    object_update(&mut merged, object);
    merged.remove("include");

    Ok(Value::Object(merged))
}

fn parse_config(config_str: &str, qemu_options: &str) -> Result<Value> {
    let mut config = Map::new();
    config.insert(
        "qemu-options-str".to_string(),
        Value::String(qemu_options.to_string()),
    );
    config.insert("vnet-hdr".to_string(), Value::Bool(false));
    config.insert("filter-rewriter".to_string(), Value::Bool(true));
    config.insert("colo-compare-options".to_string(), json!({}));
    config.insert("migration-parameters".to_string(), json!({}));
    config.insert("migration-capabilities".to_string(), json!([]));
    config.insert("throttle-limits".to_string(), json!({}));
    config.insert("blockdev-mirror-arguments".to_string(), json!({}));

    let parsed = parse_config_node(config_str)?;
    object_update(&mut config, parsed.as_object().unwrap());

    // a list-valued qemu-options-str is joined into one string
    if let Some(Value::Array(words)) = config.get("qemu-options-str") {
        let joined: String = words
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(" ");
        config.insert("qemu-options-str".to_string(), Value::String(joined));
    }

    Ok(Value::Object(config))
}

fn check_config(config: &Value) -> Result<()> {
    let Some(object) = config.as_object() else {
        return Err(ColodError::Fatal("config must be an object".to_string()));
    };

    let checks: [(&str, fn(&Value) -> bool, &str); 7] = [
        ("qemu-options-str", Value::is_string, "qemu-options-str must be a string"),
        ("filter-rewriter", Value::is_boolean, "filter-rewriter must be a boolean"),
        ("colo-compare-options", Value::is_object, "colo-compare-options must be an object"),
        ("migration-parameters", Value::is_object, "migration-parameters must be an object"),
        ("migration-capabilities", Value::is_array, "migration-capabilities must be a list"),
        ("throttle-limits", Value::is_object, "throttle-limits must be an object"),
        ("blockdev-mirror-arguments", Value::is_object, "blockdev-mirror-arguments must be an object"),
    ];

    for (member, check, message) in checks {
        let ok = object.get(member).map(check).unwrap_or(false);
        if !ok {
            return Err(ColodError::Fatal(message.to_string()));
        }
    }

    Ok(())
}
