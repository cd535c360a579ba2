use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::android::align::{DEFAULT_PAGE_ALIGNMENT, DEFAULT_WORD_ALIGNMENT};
use crate::types::{is_valid_library_name, InjectionSpec, InjectionTarget};

pub const DEFAULT_ABIS: [&str; 4] = ["arm64-v8a", "armeabi-v7a", "x86_64", "x86"];

#[derive(Debug)]
pub enum ConfigError {
    Io(io::Error),
    Parse(serde_json::Error),
    Invalid(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(err) => write!(f, "cannot read configuration: {err}"),
            ConfigError::Parse(err) => write!(f, "cannot parse configuration: {err}"),
            ConfigError::Invalid(msg) => write!(f, "invalid configuration: {msg}"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
            ConfigError::Invalid(_) => None,
        }
    }
}

impl From<io::Error> for ConfigError {
    fn from(value: io::Error) -> Self {
        ConfigError::Io(value)
    }
}

impl From<serde_json::Error> for ConfigError {
    fn from(value: serde_json::Error) -> Self {
        ConfigError::Parse(value)
    }
}

/// Everything a patch run needs besides the input APK.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatcherConfig {
    /// Parent directory of the per-run workspaces.
    pub work_root: PathBuf,
    /// Holds `<abi>/*.so` payloads copied into `lib/<abi>/`.
    pub native_assets: PathBuf,
    pub abis: Vec<String>,
    pub library_name: String,
    pub target: InjectionTarget,
    pub word_alignment: u32,
    pub page_alignment: u32,
    pub api_level: Option<u32>,
    pub keep_workspace: bool,
    pub tools: ToolConfig,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        PatcherConfig {
            work_root: std::env::temp_dir().join("apk_workspace"),
            native_assets: PathBuf::from("native"),
            abis: DEFAULT_ABIS.iter().map(|abi| abi.to_string()).collect(),
            library_name: "payload".to_string(),
            target: InjectionTarget::default(),
            word_alignment: DEFAULT_WORD_ALIGNMENT,
            page_alignment: DEFAULT_PAGE_ALIGNMENT,
            api_level: None,
            keep_workspace: true,
            tools: ToolConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    pub disassembler: Vec<String>,
    pub assembler: Vec<String>,
    pub signer: SignerConfig,
}

impl Default for ToolConfig {
    fn default() -> Self {
        ToolConfig {
            disassembler: vec!["baksmali".to_string()],
            assembler: vec!["smali".to_string()],
            signer: SignerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignerConfig {
    pub command: Vec<String>,
    pub keystore: PathBuf,
    pub key_alias: String,
    pub key_password: String,
}

impl Default for SignerConfig {
    fn default() -> Self {
        SignerConfig {
            command: vec!["apksigner".to_string()],
            keystore: PathBuf::from("debug.keystore"),
            key_alias: "androiddebugkey".to_string(),
            key_password: "android".to_string(),
        }
    }
}

impl PatcherConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: PatcherConfig = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_library_name(&self.library_name) {
            return Err(ConfigError::Invalid(format!(
                "library name `{}` must be non-empty and use only [A-Za-z0-9_.-]",
                self.library_name
            )));
        }
        for (what, size) in [("word", self.word_alignment), ("page", self.page_alignment)] {
            if size == 0 || !size.is_power_of_two() {
                return Err(ConfigError::Invalid(format!(
                    "{what} alignment {size} is not a power of two"
                )));
            }
        }
        for (what, command) in [
            ("disassembler", &self.tools.disassembler),
            ("assembler", &self.tools.assembler),
            ("signer", &self.tools.signer.command),
        ] {
            if command.is_empty() {
                return Err(ConfigError::Invalid(format!("{what} command is empty")));
            }
        }
        if let InjectionTarget::Method(fragment) = &self.target {
            if fragment.trim().is_empty() {
                return Err(ConfigError::Invalid("method selector is empty".to_string()));
            }
        }
        Ok(())
    }

    pub fn injection_spec(&self) -> InjectionSpec {
        InjectionSpec::new(self.target.clone(), self.library_name.clone())
    }
}
