use anyhow::{Context, Result};
use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub mod env;

pub const DEPLOYMENT_DIR: &str = ".deployment";
pub const SERVERS_FILE: &str = "servers.yml";
pub const PROJECT_FILE: &str = "config.yml";

/// Env bucket applied to every server regardless of tags.
pub const ALL_TAG: &str = "all";

pub type EnvMap = BTreeMap<String, String>;
pub type EnvByTag = HashMap<String, EnvMap>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerRole {
    #[default]
    Manager,
    Worker,
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerRole::Manager => f.write_str("manager"),
            ServerRole::Worker => f.write_str("worker"),
        }
    }
}

/// A raw `servers.yml` entry. The name is the map key.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub role: ServerRole,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default, deserialize_with = "deserialize_env_map")]
    pub env: EnvMap,
    #[serde(default)]
    pub key_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerDefaults {
    #[serde(default = "default_user")]
    pub user: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerDefaults {
    fn default() -> Self {
        Self {
            user: default_user(),
            port: default_port(),
        }
    }
}

fn default_user() -> String {
    "root".to_string()
}
fn default_port() -> u16 {
    22
}

/// `servers.yml`: servers in declaration order, defaults and tag-scoped env.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServersFile {
    #[serde(default)]
    pub defaults: ServerDefaults,
    #[serde(default, deserialize_with = "ordered_servers")]
    pub servers: Vec<(String, ServerConfig)>,
    #[serde(default, deserialize_with = "deserialize_env_by_tag")]
    pub env: EnvByTag,
}

impl ServersFile {
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Invalid servers.yml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read servers file: {:?}", path))?;
        Self::from_yaml(&content)
    }

    pub fn find_server(&self, name: &str) -> Option<&ServerConfig> {
        self.servers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, config)| config)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImageConfig {
    pub name: String,
    #[serde(default = "default_build_context")]
    pub context: String,
    #[serde(default)]
    pub dockerfile: Option<String>,
    /// Replaces the generated `docker build` command entirely.
    #[serde(default)]
    pub command: Option<String>,
}

fn default_build_context() -> String {
    ".".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct FailoverConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            probe_timeout_secs: default_probe_timeout_secs(),
        }
    }
}

fn default_max_attempts() -> usize {
    3
}
fn default_backoff_ms() -> u64 {
    2000
}
fn default_probe_timeout_secs() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BuildConfig {
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub fail_fast: bool,
}

/// `config.yml`: everything optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectConfig {
    #[serde(default)]
    pub project_name: Option<String>,
    #[serde(default)]
    pub stack: Option<String>,
    #[serde(default)]
    pub compose_file: Option<PathBuf>,
    #[serde(default)]
    pub images: Vec<ImageConfig>,
    #[serde(default)]
    pub artifact_dir: Option<PathBuf>,
    #[serde(default)]
    pub failover: FailoverConfig,
    #[serde(default)]
    pub build: BuildConfig,
    #[serde(default)]
    pub prune: bool,
}

impl ProjectConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read project config: {:?}", path))?;
        serde_yaml::from_str(&content).context("Invalid config.yml")
    }
}

/// Everything loaded from one deployment root.
#[derive(Debug, Clone)]
pub struct ConfigManager {
    pub root: PathBuf,
    pub servers: ServersFile,
    pub project: ProjectConfig,
    pub overlay: env::Overlay,
}

impl ConfigManager {
    /// Load from the first ancestor of the current directory holding `.deployment/`.
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir().context("Cannot read current directory")?;
        let root = find_deployment_root(&cwd)
            .with_context(|| format!("No {} directory above {:?}", DEPLOYMENT_DIR, cwd))?;
        Self::load(&root)
    }

    pub fn load(root: &Path) -> Result<Self> {
        let deployment = root.join(DEPLOYMENT_DIR);
        let servers = ServersFile::load(&deployment.join(SERVERS_FILE))?;
        let project = ProjectConfig::load(&deployment.join(PROJECT_FILE))?;
        let overlay = env::Overlay::load(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            servers,
            project,
            overlay,
        })
    }

    pub fn project_name(&self) -> String {
        self.project.project_name.clone().unwrap_or_else(|| {
            self.root
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| "app".to_string())
        })
    }

    pub fn stack_name(&self) -> String {
        self.project
            .stack
            .clone()
            .unwrap_or_else(|| self.project_name())
    }

    pub fn compose_path(&self) -> PathBuf {
        match &self.project.compose_file {
            Some(path) => self.root.join(path),
            None => self
                .root
                .join(DEPLOYMENT_DIR)
                .join("docker")
                .join("docker-compose.yml"),
        }
    }

    pub fn artifact_dir(&self) -> PathBuf {
        match &self.project.artifact_dir {
            Some(path) => self.root.join(path),
            None => self.root.join(DEPLOYMENT_DIR).join("cache").join("images"),
        }
    }
}

pub fn find_deployment_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(DEPLOYMENT_DIR).is_dir())
        .map(Path::to_path_buf)
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Scalar {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Scalar {
    fn into_string(self) -> String {
        match self {
            Scalar::Str(s) => s,
            Scalar::Int(i) => i.to_string(),
            Scalar::Float(f) => f.to_string(),
            Scalar::Bool(b) => b.to_string(),
        }
    }
}

fn stringify(raw: BTreeMap<String, Option<Scalar>>) -> EnvMap {
    raw.into_iter()
        .map(|(k, v)| (k, v.map(Scalar::into_string).unwrap_or_default()))
        .collect()
}

fn deserialize_env_map<'de, D>(deserializer: D) -> std::result::Result<EnvMap, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<BTreeMap<String, Option<Scalar>>> = Option::deserialize(deserializer)?;
    Ok(raw.map(stringify).unwrap_or_default())
}

fn deserialize_env_by_tag<'de, D>(deserializer: D) -> std::result::Result<EnvByTag, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<HashMap<String, Option<BTreeMap<String, Option<Scalar>>>>> =
        Option::deserialize(deserializer)?;
    Ok(raw
        .unwrap_or_default()
        .into_iter()
        .map(|(tag, vars)| (tag, vars.map(stringify).unwrap_or_default()))
        .collect())
}

// Server order is significant (manager selection), so the map is read as a list.
fn ordered_servers<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<(String, ServerConfig)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedServers;

    impl<'de> Visitor<'de> for OrderedServers {
        type Value = Vec<(String, ServerConfig)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a map of server name to server definition")
        }

        fn visit_unit<E: de::Error>(self) -> std::result::Result<Self::Value, E> {
            Ok(Vec::new())
        }

        fn visit_map<A>(self, mut map: A) -> std::result::Result<Self::Value, A::Error>
        where
            A: MapAccess<'de>,
        {
            let mut servers: Vec<(String, ServerConfig)> = Vec::new();
            while let Some((name, config)) = map.next_entry::<String, Option<ServerConfig>>()? {
                if servers.iter().any(|(existing, _)| *existing == name) {
                    return Err(de::Error::custom(format!("duplicate server '{}'", name)));
                }
                servers.push((name, config.unwrap_or_default()));
            }
            Ok(servers)
        }
    }

    deserializer.deserialize_map(OrderedServers)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_servers_keep_declaration_order() {
        let yaml = r#"
servers:
  zeta:
    host: 10.0.0.3
    tags: [production]
  alpha:
    host: 10.0.0.1
    role: worker
    tags: [production]
  mid:
    tags: [staging]
"#;
        let file = ServersFile::from_yaml(yaml).unwrap();
        let names: Vec<&str> = file.servers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
        assert_eq!(file.servers[0].1.role, ServerRole::Manager);
        assert_eq!(file.servers[1].1.role, ServerRole::Worker);
        assert!(file.servers[2].1.host.is_none());
        assert_eq!(file.defaults, ServerDefaults::default());
    }

    #[test]
    fn test_env_scalars_are_stringified() {
        let yaml = r#"
servers:
  m1:
    host: m1.internal
    env:
      PORT: 8080
      DEBUG: true
      RATIO: 0.5
      EMPTY:
env:
  all:
    LOG_LEVEL: info
  staging:
"#;
        let file = ServersFile::from_yaml(yaml).unwrap();
        let env = &file.servers[0].1.env;
        assert_eq!(env["PORT"], "8080");
        assert_eq!(env["DEBUG"], "true");
        assert_eq!(env["RATIO"], "0.5");
        assert_eq!(env["EMPTY"], "");
        assert_eq!(file.env[ALL_TAG]["LOG_LEVEL"], "info");
        assert!(file.env["staging"].is_empty());
    }

    #[test]
    fn test_project_config_defaults() {
        let project: ProjectConfig = serde_yaml::from_str("project_name: shop\n").unwrap();
        assert_eq!(project.failover.max_attempts, 3);
        assert_eq!(project.failover.probe_timeout_secs, 5);
        assert!(project.images.is_empty());
        assert!(!project.build.fail_fast);
    }

    #[test]
    fn test_find_deployment_root_walks_up() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(DEPLOYMENT_DIR)).unwrap();
        let nested = dir.path().join("services").join("api");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_deployment_root(&nested).unwrap(), dir.path());
    }
}
