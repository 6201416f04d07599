//! Configuration options.
//!
//! Applications that embed the conversation table are free to define their own command line
//! arguments, but runtime options for conversation tracking are read from a TOML configuration
//! file. The path to the configuration file itself will typically be a command line argument
//! passed to the application.

use crate::conversation::DeinterlaceKey;

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Loads a configuration file from `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: RuntimeConfig = toml::from_str(&config_str)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    log::debug!("Loaded config: {:#?}", config);
    Ok(config)
}

/// Returns the default configuration.
///
/// Deinterlacing is disabled:
/// ```toml
/// [conversation]
///     deinterlacing_key = []
///     initial_capacity = 1024
///     strict_remove = false
/// ```
pub fn default_config() -> RuntimeConfig {
    RuntimeConfig::default()
}

/* --------------------------------------------------------------------------------- */

/// Runtime configuration options.
#[derive(Deserialize, Serialize, Debug, Clone, Default)]
pub struct RuntimeConfig {
    /// Conversation tracking settings.
    #[serde(default)]
    pub conversation: ConversationConfig,
}

/* --------------------------------------------------------------------------------- */

/// Link field usable for deinterlacing.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeinterlaceField {
    /// Capture interface identifier.
    Interface,
    /// 802.1Q VLAN identifier.
    Vlan,
}

/// Conversation tracking options.
///
/// ## Example
/// ```toml
/// [conversation]
///     deinterlacing_key = ["interface", "vlan"]
///     initial_capacity = 65536
///     strict_remove = false
/// ```
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ConversationConfig {
    /// Link fields that partition IP-layer conversations. Conversations observed on links that
    /// differ in any listed field are kept apart even if their addresses and ports coincide.
    /// Defaults to `[]` (deinterlacing disabled).
    #[serde(default)]
    pub deinterlacing_key: Vec<DeinterlaceField>,

    /// Number of conversations to pre-allocate room for at the start of a session. Defaults to
    /// `1024`.
    #[serde(default = "default_initial_capacity")]
    pub initial_capacity: usize,

    /// Panic, instead of logging a warning, when a conversation being moved between tables is
    /// missing from its chain. Defaults to `false`.
    #[serde(default)]
    pub strict_remove: bool,
}

impl ConversationConfig {
    /// Returns the deinterlacing key as a bitmask.
    pub fn deinterlacing_key(&self) -> DeinterlaceKey {
        self.deinterlacing_key
            .iter()
            .fold(DeinterlaceKey::none(), |key, field| match field {
                DeinterlaceField::Interface => key | DeinterlaceKey::Interface,
                DeinterlaceField::Vlan => key | DeinterlaceKey::Vlan,
            })
    }
}

fn default_initial_capacity() -> usize {
    1024
}

impl Default for ConversationConfig {
    fn default() -> Self {
        ConversationConfig {
            deinterlacing_key: vec![],
            initial_capacity: default_initial_capacity(),
            strict_remove: false,
        }
    }
}
