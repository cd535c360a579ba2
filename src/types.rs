use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Fully qualified Java class name of the launcher activity, e.g. `com.example.MainActivity`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryPoint(String);

impl EntryPoint {
    pub fn new(class_name: impl Into<String>) -> Self {
        EntryPoint(class_name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `com/example/MainActivity.smali`, relative to a smali directory.
    pub fn smali_relative_path(&self) -> PathBuf {
        let mut path: PathBuf = self.0.split('.').collect();
        path.set_extension("smali");
        path
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which method of the entry point receives the load call.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InjectionTarget {
    /// The first `<init>` in the file.
    Constructor,
    /// `onCreate(Landroid/os/Bundle;)V`.
    #[default]
    EntryMethod,
    /// Any method whose name plus descriptor contains this fragment.
    Method(String),
}

impl InjectionTarget {
    pub fn marker(&self) -> &str {
        match self {
            InjectionTarget::Constructor => "<init>",
            InjectionTarget::EntryMethod => "onCreate(Landroid/os/Bundle;)V",
            InjectionTarget::Method(fragment) => fragment,
        }
    }
}

impl fmt::Display for InjectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectionTarget::Constructor => f.write_str("constructor"),
            InjectionTarget::EntryMethod => f.write_str("entry method"),
            InjectionTarget::Method(fragment) => write!(f, "method matching `{fragment}`"),
        }
    }
}

/// What to inject and where.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InjectionSpec {
    pub target: InjectionTarget,
    /// Library name as passed to `System.loadLibrary`: `payload` for `libpayload.so`.
    pub library_name: String,
}

pub const INJECTION_COMMENT: &str = "# load native library";

impl InjectionSpec {
    pub fn new(target: InjectionTarget, library_name: impl Into<String>) -> Self {
        InjectionSpec {
            target,
            library_name: library_name.into(),
        }
    }

    /// The lines spliced in after the register directive.
    pub fn instruction_block(&self) -> Vec<String> {
        vec![
            String::new(),
            format!("    {INJECTION_COMMENT}"),
            format!("    const-string v0, \"{}\"", self.library_name),
            String::new(),
            format!(
                "    invoke-static {{v0}}, {}",
                crate::smali_parse::LOAD_LIBRARY_METHOD
            ),
            String::new(),
        ]
    }
}

/// `[A-Za-z0-9_.-]+`: safe inside a smali string literal and a `lib<name>.so` file name.
pub fn is_valid_library_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'_' | b'.' | b'-'))
}

/// The archive a rebuild produced, and how much of the pipeline it went through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Artifact {
    /// Signed by the configured signer. `aligned` is false when alignment fell back to a copy.
    Signed { path: PathBuf, aligned: bool },
    /// Alignment worked but signing did not.
    AlignedUnsigned { path: PathBuf },
    /// Neither alignment nor signing worked.
    Unaligned { path: PathBuf },
}

impl Artifact {
    pub fn path(&self) -> &Path {
        match self {
            Artifact::Signed { path, .. }
            | Artifact::AlignedUnsigned { path }
            | Artifact::Unaligned { path } => path,
        }
    }

    pub fn is_signed(&self) -> bool {
        matches!(self, Artifact::Signed { .. })
    }

    pub fn with_path(self, path: PathBuf) -> Artifact {
        match self {
            Artifact::Signed { aligned, .. } => Artifact::Signed { path, aligned },
            Artifact::AlignedUnsigned { .. } => Artifact::AlignedUnsigned { path },
            Artifact::Unaligned { .. } => Artifact::Unaligned { path },
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Artifact::Signed { path, aligned: true } => write!(f, "signed: {}", path.display()),
            Artifact::Signed { path, aligned: false } => {
                write!(f, "signed (unaligned): {}", path.display())
            }
            Artifact::AlignedUnsigned { path } => write!(f, "unsigned: {}", path.display()),
            Artifact::Unaligned { path } => write!(f, "unsigned, unaligned: {}", path.display()),
        }
    }
}
