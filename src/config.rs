use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::error::ExitError;

/// Town config file name.
pub const CONFIG_FILE: &str = "town.toml";

/// Environment variable naming the town root explicitly.
pub const TOWN_ROOT_ENV: &str = "SLING_TOWN_ROOT";

/// Walk up from `start` looking for a directory containing `town.toml`.
pub fn find_town_root(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(CONFIG_FILE).is_file())
        .map(Path::to_path_buf)
}

/// Resolve the town root: explicit path first, then discovery from the cwd.
pub fn resolve_town_root(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    if let Some(root) = explicit {
        if !root.join(CONFIG_FILE).is_file() {
            return Err(ExitError::Config(format!(
                "no {CONFIG_FILE} in {}",
                root.display()
            ))
            .into());
        }
        return Ok(root.to_path_buf());
    }
    let cwd = std::env::current_dir().context("could not determine current directory")?;
    find_town_root(&cwd).ok_or_else(|| {
        ExitError::Config(format!(
            "not in a town: no {CONFIG_FILE} in {} or any parent (set --town-root or {TOWN_ROOT_ENV})",
            cwd.display()
        ))
        .into()
    })
}

/// Top-level `town.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TownConfig {
    #[serde(default)]
    pub town: TownSection,
    /// Rigs keyed by name.
    #[serde(default)]
    pub rigs: BTreeMap<String, RigConfig>,
    #[serde(default)]
    pub accounts: AccountsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub names: NamesConfig,
    #[serde(default)]
    pub notify: NotifyConfig,
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct TownSection {
    /// Town name. Defaults to the town root's directory name.
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RigConfig {
    /// Repository path, relative to the town root or absolute.
    pub path: PathBuf,
    #[serde(default = "default_branch")]
    pub default_branch: String,
    /// Issue-store prefix used to build worker agent ids.
    #[serde(default = "default_prefix")]
    pub prefix: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct AccountsConfig {
    /// Handle used when dispatch names no account.
    #[serde(default)]
    pub default: Option<String>,
    #[serde(default)]
    pub handles: BTreeMap<String, AccountConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AccountConfig {
    /// Agent config directory for this account. `~` expands to the home directory.
    pub config_dir: PathBuf,
    /// Environment variable holding an API token, if the account uses one.
    #[serde(default)]
    pub auth_token_env: Option<String>,
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct AgentsConfig {
    #[serde(default = "default_agent")]
    pub default: String,
    /// Startup command per agent name.
    #[serde(default = "default_agent_commands")]
    pub commands: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SessionConfig {
    /// Session names are `<prefix>-<rig>-<worker>`.
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NamesConfig {
    #[serde(default = "default_name_pool")]
    pub pool: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct NotifyConfig {
    /// Program and leading args used to reach an operator, e.g. `["gt", "mail", "send"]`.
    #[serde(default)]
    pub command: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct McpConfig {
    #[serde(default)]
    pub servers: BTreeMap<String, McpServer>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct McpServer {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

fn default_branch() -> String { "main".into() }
fn default_prefix() -> String { "gt".into() }
fn default_agent() -> String { "claude".into() }
fn default_start_timeout() -> u64 { 60 }

fn default_agent_commands() -> BTreeMap<String, String> {
    BTreeMap::from([(
        "claude".to_string(),
        "claude --dangerously-skip-permissions".to_string(),
    )])
}

fn default_name_pool() -> Vec<String> {
    [
        "furiosa", "nux", "rictus", "slit", "toast", "valkyrie", "capable", "dag", "cheedo",
        "angharad", "morsov", "ace",
    ]
    .iter()
    .map(ToString::to_string)
    .collect()
}

impl Default for AgentsConfig {
    fn default() -> Self {
        Self {
            default: default_agent(),
            commands: default_agent_commands(),
        }
    }
}

impl AgentsConfig {
    /// Resolve an agent name (explicit or default) to `(name, startup command)`.
    pub fn command(&self, agent: Option<&str>) -> anyhow::Result<(String, String)> {
        let name = agent.unwrap_or(&self.default);
        self.commands
            .get(name)
            .map(|cmd| (name.to_string(), cmd.clone()))
            .ok_or_else(|| {
                ExitError::Config(format!(
                    "unknown agent {name:?} (configured: {})",
                    self.commands.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
                .into()
            })
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            start_timeout_secs: default_start_timeout(),
        }
    }
}

impl Default for NamesConfig {
    fn default() -> Self {
        Self {
            pool: default_name_pool(),
        }
    }
}

impl TownConfig {
    /// Load config from a `town.toml` file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse_toml(&contents)
    }

    pub fn parse_toml(toml_str: &str) -> anyhow::Result<Self> {
        toml::from_str(toml_str)
            .map_err(|e| ExitError::Config(format!("invalid {CONFIG_FILE}: {e}")).into())
    }
}

/// A loaded town: its root directory plus parsed config.
#[derive(Debug, Clone)]
pub struct Town {
    pub root: PathBuf,
    pub config: TownConfig,
}

impl Town {
    pub fn load(root: &Path) -> anyhow::Result<Self> {
        let config = TownConfig::load(&root.join(CONFIG_FILE))?;
        Ok(Self {
            root: root.to_path_buf(),
            config,
        })
    }

    /// Resolve the root (explicit or discovered) and load it.
    pub fn discover(explicit: Option<&Path>) -> anyhow::Result<Self> {
        let root = resolve_town_root(explicit)?;
        Self::load(&root)
    }

    pub fn name(&self) -> String {
        self.config.town.name.clone().unwrap_or_else(|| {
            self.root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "town".to_string())
        })
    }

    /// Absolute path of a rig's repository, if the rig is configured.
    pub fn rig_path(&self, rig: &str) -> Option<PathBuf> {
        self.config.rigs.get(rig).map(|r| self.resolve(&r.path))
    }

    /// Pick a rig: the named one, or the only configured rig.
    pub fn select_rig(&self, rig: Option<&str>) -> anyhow::Result<String> {
        if let Some(name) = rig {
            if !self.config.rigs.contains_key(name) {
                return Err(ExitError::Config(format!("rig {name:?} not found")).into());
            }
            return Ok(name.to_string());
        }
        let mut names = self.config.rigs.keys();
        match (names.next(), names.next()) {
            (Some(only), None) => Ok(only.clone()),
            (None, _) => Err(ExitError::Config(format!("no rigs configured in {CONFIG_FILE}")).into()),
            (Some(_), Some(_)) => Err(ExitError::Config(
                "multiple rigs configured; pass --rig".to_string(),
            )
            .into()),
        }
    }

    /// Town-relative paths resolve against the root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &Path) -> PathBuf {
    match path.strip_prefix("~") {
        Ok(rest) => dirs::home_dir().map_or_else(|| path.to_path_buf(), |home| home.join(rest)),
        Err(_) => path.to_path_buf(),
    }
}
