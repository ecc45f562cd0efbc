//! Dynamic Ansible inventory backed by a deploy context file.
//!
//! The CLI writes one context per target server; `dockflow inventory` turns it
//! into the JSON Ansible expects from `--list` / `--host`.

use crate::ops::shell::{normalize_private_key, ConnectionInfo};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fs;
use std::path::Path;

pub const CONTEXT_FILE: &str = "/tmp/dockflow_context.json";
pub const KEY_FILE: &str = "/tmp/dockflow_key";

const SSH_COMMON_ARGS: &str = "-o StrictHostKeyChecking=no -o UserKnownHostsFile=/dev/null";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConnection {
    #[serde(default)]
    pub host: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployContext {
    #[serde(default = "default_env")]
    pub env: String,
    #[serde(default = "default_server_name")]
    pub server_name: String,
    /// `connection` is the older name for the same block.
    #[serde(default, alias = "connection")]
    pub ssh_connection: SshConnection,
}

fn default_env() -> String {
    "unknown".to_string()
}

fn default_server_name() -> String {
    "server".to_string()
}

impl DeployContext {
    pub fn from_connection(environment: &str, server_name: &str, info: &ConnectionInfo) -> Self {
        let (private_key, password) = match info {
            ConnectionInfo::Key {
                private_key,
                sudo_password,
                ..
            } => (Some(private_key.clone()), sudo_password.clone()),
            ConnectionInfo::Password { password, .. } => (None, Some(password.clone())),
        };
        Self {
            env: environment.to_string(),
            server_name: server_name.to_string(),
            ssh_connection: SshConnection {
                host: info.host().to_string(),
                port: Some(info.port()),
                user: Some(info.user().to_string()),
                private_key,
                password,
            },
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read context {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse context {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        write_private(path, &content)
    }

    /// `production-main`
    pub fn host_name(&self) -> String {
        format!("{}-{}", self.env, self.server_name)
    }
}

pub fn empty_inventory() -> Value {
    json!({"_meta": {"hostvars": {}}})
}

/// Inventory for one context. `key_file` is referenced, not written.
pub fn build_inventory(ctx: &DeployContext, key_file: &Path) -> Value {
    let connection = &ctx.ssh_connection;
    let mut hostvars = Map::new();
    hostvars.insert("ansible_host".into(), json!(connection.host));
    hostvars.insert("ansible_port".into(), json!(connection.port.unwrap_or(22)));
    hostvars.insert(
        "ansible_user".into(),
        json!(connection.user.as_deref().unwrap_or("root")),
    );
    hostvars.insert(
        "ansible_ssh_private_key_file".into(),
        json!(key_file.to_string_lossy()),
    );
    hostvars.insert("ansible_ssh_common_args".into(), json!(SSH_COMMON_ARGS));
    if let Some(password) = connection.password.as_deref().filter(|p| !p.is_empty()) {
        hostvars.insert("ansible_become_password".into(), json!(password));
    }

    let host = ctx.host_name();
    json!({
        "all": {"hosts": [host], "vars": {}},
        "_meta": {"hostvars": {host: hostvars}},
    })
}

/// Read the context, write its key, build the inventory. Any failure yields
/// the empty inventory.
pub fn load_inventory(context_file: &Path, key_file: &Path) -> Value {
    if !context_file.exists() {
        return empty_inventory();
    }
    let ctx = match DeployContext::load(context_file) {
        Ok(ctx) => ctx,
        Err(e) => {
            tracing::warn!("Error reading context file: {:#}", e);
            return empty_inventory();
        }
    };
    if let Some(key) = ctx
        .ssh_connection
        .private_key
        .as_deref()
        .filter(|k| !k.is_empty())
    {
        if let Err(e) = write_key_file(key_file, key) {
            tracing::warn!("Failed to write SSH key: {:#}", e);
        }
    }
    build_inventory(&ctx, key_file)
}

/// `--host` output: that host's vars, or `{}`.
pub fn host_vars(inventory: &Value, host: &str) -> Value {
    inventory
        .pointer("/_meta/hostvars")
        .and_then(|vars| vars.get(host))
        .cloned()
        .unwrap_or_else(|| json!({}))
}

pub fn write_key_file(path: &Path, private_key: &str) -> Result<()> {
    write_private(path, &normalize_private_key(private_key))
}

fn write_private(path: &Path, content: &str) -> Result<()> {
    fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn context() -> DeployContext {
        DeployContext {
            env: "production".into(),
            server_name: "main".into(),
            ssh_connection: SshConnection {
                host: "10.0.0.5".into(),
                port: None,
                user: None,
                private_key: Some("-----BEGIN KEY-----\\nabc\\n-----END KEY-----".into()),
                password: Some("hunter2".into()),
            },
        }
    }

    #[test]
    fn test_inventory_shape_and_defaults() {
        let inventory = build_inventory(&context(), Path::new("/tmp/k"));
        assert_eq!(inventory["all"]["hosts"], json!(["production-main"]));
        let vars = &inventory["_meta"]["hostvars"]["production-main"];
        assert_eq!(vars["ansible_host"], "10.0.0.5");
        assert_eq!(vars["ansible_port"], 22);
        assert_eq!(vars["ansible_user"], "root");
        assert_eq!(vars["ansible_ssh_private_key_file"], "/tmp/k");
        assert_eq!(vars["ansible_become_password"], "hunter2");
        assert_eq!(host_vars(&inventory, "production-main"), *vars);
        assert_eq!(host_vars(&inventory, "other"), json!({}));
    }

    #[test]
    fn test_no_become_password_without_password() {
        let mut ctx = context();
        ctx.ssh_connection.password = None;
        let inventory = build_inventory(&ctx, Path::new("/tmp/k"));
        assert!(inventory["_meta"]["hostvars"]["production-main"]
            .get("ansible_become_password")
            .is_none());
    }

    #[test]
    fn test_legacy_connection_key() {
        let ctx: DeployContext = serde_json::from_str(
            r#"{"env":"staging","server_name":"web","connection":{"host":"h","port":2222,"user":"ops"}}"#,
        )
        .unwrap();
        assert_eq!(ctx.ssh_connection.port, Some(2222));
        assert_eq!(ctx.host_name(), "staging-web");
    }

    #[test]
    fn test_missing_or_broken_context_is_empty_inventory() {
        let dir = TempDir::new().unwrap();
        let key = dir.path().join("key");
        assert_eq!(
            load_inventory(&dir.path().join("missing.json"), &key),
            empty_inventory()
        );
        let broken = dir.path().join("broken.json");
        fs::write(&broken, "{not json").unwrap();
        assert_eq!(load_inventory(&broken, &key), empty_inventory());
    }

    #[test]
    fn test_load_writes_normalized_key() {
        let dir = TempDir::new().unwrap();
        let context_file = dir.path().join("ctx.json");
        let key = dir.path().join("key");
        context().save(&context_file).unwrap();

        let inventory = load_inventory(&context_file, &key);
        assert_eq!(inventory["all"]["hosts"][0], "production-main");
        assert_eq!(
            fs::read_to_string(&key).unwrap(),
            "-----BEGIN KEY-----\nabc\n-----END KEY-----\n"
        );
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(&key).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }
}
