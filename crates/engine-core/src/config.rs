//! Configuration for siptty
//!
//! The configuration is a TOML file with a `[general]` table, one
//! `[[accounts]]` entry per SIP identity and an optional `[audio]` table.
//! Loading applies defaults and validates; the engine trusts what it gets.
//!
//! ```rust
//! use siptty_engine_core::config::{Config, Transport};
//!
//! let config = Config::from_toml_str(r#"
//!     [[accounts]]
//!     name = "work"
//!     sip_uri = "sip:alice@pbx.example.com"
//!     auth_password = "secret"
//!     registrar = "sip:pbx.example.com"
//! "#).unwrap();
//!
//! let work = &config.accounts[0];
//! assert!(work.enabled && work.register);
//! assert_eq!(work.auth_user, "alice");
//! assert_eq!(work.transport, Transport::Udp);
//! assert_eq!(work.reg_expiry, 300);
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Local config file name searched in the working directory
pub const LOCAL_CONFIG_FILE: &str = "siptty.toml";

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while locating, reading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("reading config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid TOML or has the wrong shape
    #[error("parsing config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration parsed but is not usable
    #[error("validating config: {message}")]
    Invalid { message: String },

    /// No config file in any of the searched locations
    #[error("no config file found (searched {})", display_paths(.searched))]
    NotFound { searched: Vec<PathBuf> },
}

impl ConfigError {
    fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(" and ")
}

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Global settings
    #[serde(default)]
    pub general: GeneralConfig,

    /// Configured SIP identities, in file order
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,

    /// Audio/media settings
    #[serde(default)]
    pub audio: AudioConfig,
}

/// Global application settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// 1=error, 2=warn, 3=info, 4 and above=debug
    pub log_level: u8,

    /// Log file; the terminal belongs to the UI so logs never go there
    pub log_file: Option<PathBuf>,

    /// User-Agent header value
    pub user_agent: String,

    /// Local address the signaling agent binds to
    pub bind_host: String,

    /// Local port, 0 picks an ephemeral one
    pub bind_port: u16,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: 3,
            log_file: None,
            user_agent: format!("siptty/{}", env!("CARGO_PKG_VERSION")),
            bind_host: "0.0.0.0".to_string(),
            bind_port: 0,
        }
    }
}

/// Signaling transport
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    #[default]
    Udp,
    Tcp,
    Tls,
}

impl Transport {
    /// Lowercase transport token as used on the wire
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "udp",
            Transport::Tcp => "tcp",
            Transport::Tls => "tls",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single SIP account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountConfig {
    /// Unique account identity
    pub name: String,

    /// Disabled accounts are never instantiated
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Address of record, e.g. `sip:alice@pbx.example.com`
    pub sip_uri: String,

    /// Digest username; derived from the user part of `sip_uri` when empty
    #[serde(default)]
    pub auth_user: String,

    #[serde(default)]
    pub auth_password: String,

    /// Registrar URI, e.g. `sip:pbx.example.com`
    pub registrar: String,

    #[serde(default)]
    pub transport: Transport,

    /// Whether the engine registers this account on start
    #[serde(default = "default_true")]
    pub register: bool,

    /// Registration expiry in seconds
    #[serde(default = "default_reg_expiry")]
    pub reg_expiry: u32,

    /// Extra headers handed to the provider
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl AccountConfig {
    /// Minimal enabled, registering account; mostly useful in tests
    pub fn new(
        name: impl Into<String>,
        sip_uri: impl Into<String>,
        registrar: impl Into<String>,
    ) -> Self {
        let sip_uri = sip_uri.into();
        Self {
            name: name.into(),
            enabled: true,
            auth_user: user_part(&sip_uri).to_string(),
            sip_uri,
            auth_password: String::new(),
            registrar: registrar.into(),
            transport: Transport::default(),
            register: true,
            reg_expiry: default_reg_expiry(),
            headers: BTreeMap::new(),
        }
    }

    /// Set the digest credentials
    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth_user = user.into();
        self.auth_password = password.into();
        self
    }

    /// Enable or disable the account
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Set whether the account registers on start
    pub fn with_register(mut self, register: bool) -> Self {
        self.register = register;
        self
    }

    /// Add an extra header sent with REGISTER and INVITE
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Audio source mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioMode {
    /// No audio device, silence
    #[default]
    Null,
    /// Play from / record to files
    File,
}

/// Audio/media settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub mode: AudioMode,
    pub play_file: Option<PathBuf>,
    pub record_dir: Option<PathBuf>,
}

fn default_true() -> bool {
    true
}

fn default_reg_expiry() -> u32 {
    300
}

impl Config {
    /// Read, parse, default and validate a config file
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&data)
    }

    /// Parse, default and validate TOML text
    pub fn from_toml_str(data: &str) -> ConfigResult<Self> {
        let mut config: Config = toml::from_str(data)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Accounts the engine will instantiate
    pub fn enabled_accounts(&self) -> impl Iterator<Item = &AccountConfig> {
        self.accounts.iter().filter(|a| a.enabled)
    }

    fn apply_defaults(&mut self) {
        if self.general.log_level == 0 {
            self.general.log_level = GeneralConfig::default().log_level;
        }
        if self.general.user_agent.is_empty() {
            self.general.user_agent = GeneralConfig::default().user_agent;
        }
        for account in &mut self.accounts {
            if account.auth_user.is_empty() {
                account.auth_user = user_part(&account.sip_uri).to_string();
            }
            if account.reg_expiry == 0 {
                account.reg_expiry = default_reg_expiry();
            }
        }
    }

    /// Check the invariants the engine relies on
    pub fn validate(&self) -> ConfigResult<()> {
        if self.accounts.is_empty() {
            return Err(ConfigError::invalid("at least one account is required"));
        }

        let mut names = HashSet::new();
        for (i, account) in self.accounts.iter().enumerate() {
            if account.name.is_empty() {
                return Err(ConfigError::invalid(format!("account {i}: name is required")));
            }
            if !names.insert(account.name.as_str()) {
                return Err(ConfigError::invalid(format!(
                    "account {i}: duplicate name {:?}",
                    account.name
                )));
            }
            if account.sip_uri.is_empty() {
                return Err(ConfigError::invalid(format!("account {i}: sip_uri is required")));
            }
            if account.registrar.is_empty() {
                return Err(ConfigError::invalid(format!("account {i}: registrar is required")));
            }
        }
        Ok(())
    }
}

/// User part of a SIP URI: `sip:alice@host` -> `alice`.
///
/// Returns an empty string when the URI carries no user part.
pub fn user_part(uri: &str) -> &str {
    let rest = uri
        .strip_prefix("sips:")
        .or_else(|| uri.strip_prefix("sip:"))
        .unwrap_or(uri);
    match rest.find('@') {
        Some(idx) => &rest[..idx],
        None => "",
    }
}

/// Locate a config file: `./siptty.toml`, then `<config dir>/siptty/config.toml`
pub fn find_config_file() -> ConfigResult<PathBuf> {
    let mut searched = vec![PathBuf::from(LOCAL_CONFIG_FILE)];
    if let Some(dir) = dirs::config_dir() {
        searched.push(dir.join("siptty").join("config.toml"));
    }

    let found = searched.iter().find(|p| p.is_file()).cloned();
    found.ok_or(ConfigError::NotFound { searched })
}
