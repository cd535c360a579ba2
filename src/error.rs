use std::fmt;
use std::io;

use crate::android::align::AlignError;
use crate::android::binary_xml::BinaryXmlError;
use crate::android::manifest::ManifestError;
use crate::android::zip::ApkZipError;
use crate::config::ConfigError;
use crate::smali_inject::InjectionError;
use crate::tools::ToolError;
use crate::units::DexUnit;

/// Result alias for the patch pipeline.
pub type PatchResult<T> = Result<T, PatchError>;

#[derive(Debug)]
pub enum PatchError {
    /// The input archive could not be opened.
    Extraction(ApkZipError),
    ManifestMissing,
    /// A manifest or dex entry failed to extract.
    CorruptEntry { name: String, reason: String },
    ManifestDecode(BinaryXmlError),
    EntryPointNotFound,
    Disassembly { unit: DexUnit, source: ToolError },
    LocatorNotFound { class_name: String },
    Injection(InjectionError),
    Assembly { unit: DexUnit, source: ToolError },
    Archive(ApkZipError),
    Alignment(AlignError),
    Signing(ToolError),
    Workspace(io::Error),
    Config(ConfigError),
    Cancelled,
    Io { context: String, source: io::Error },
}

impl PatchError {
    pub fn io(context: impl Into<String>) -> impl FnOnce(io::Error) -> PatchError {
        let context = context.into();
        move |source| PatchError::Io { context, source }
    }
}

impl fmt::Display for PatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PatchError::Extraction(err) => write!(f, "cannot extract archive: {err}"),
            PatchError::ManifestMissing => write!(f, "archive has no AndroidManifest.xml"),
            PatchError::CorruptEntry { name, reason } => {
                write!(f, "cannot extract {name}: {reason}")
            }
            PatchError::ManifestDecode(err) => write!(f, "cannot decode manifest: {err}"),
            PatchError::EntryPointNotFound => {
                write!(f, "no launcher activity declared in the manifest")
            }
            PatchError::Disassembly { unit, source } => {
                write!(f, "cannot disassemble {unit}: {source}")
            }
            PatchError::LocatorNotFound { class_name } => {
                write!(f, "no smali file for {class_name}")
            }
            PatchError::Injection(err) => write!(f, "injection failed: {err}"),
            PatchError::Assembly { unit, source } => write!(f, "cannot assemble {unit}: {source}"),
            PatchError::Archive(err) => write!(f, "cannot build archive: {err}"),
            PatchError::Alignment(err) => write!(f, "alignment failed: {err}"),
            PatchError::Signing(err) => write!(f, "signing failed: {err}"),
            PatchError::Workspace(err) => write!(f, "workspace error: {err}"),
            PatchError::Config(err) => write!(f, "{err}"),
            PatchError::Cancelled => write!(f, "cancelled"),
            PatchError::Io { context, source } => write!(f, "{context}: {source}"),
        }
    }
}

impl std::error::Error for PatchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PatchError::Extraction(err) | PatchError::Archive(err) => Some(err),
            PatchError::ManifestDecode(err) => Some(err),
            PatchError::Disassembly { source, .. } | PatchError::Assembly { source, .. } => {
                Some(source)
            }
            PatchError::Injection(err) => Some(err),
            PatchError::Alignment(err) => Some(err),
            PatchError::Signing(err) => Some(err),
            PatchError::Workspace(err) => Some(err),
            PatchError::Config(err) => Some(err),
            PatchError::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<ManifestError> for PatchError {
    fn from(value: ManifestError) -> Self {
        match value {
            ManifestError::Decode(err) => PatchError::ManifestDecode(err),
            ManifestError::NoLauncherActivity => PatchError::EntryPointNotFound,
        }
    }
}

impl From<InjectionError> for PatchError {
    fn from(value: InjectionError) -> Self {
        PatchError::Injection(value)
    }
}

impl From<AlignError> for PatchError {
    fn from(value: AlignError) -> Self {
        PatchError::Alignment(value)
    }
}

impl From<ConfigError> for PatchError {
    fn from(value: ConfigError) -> Self {
        PatchError::Config(value)
    }
}
