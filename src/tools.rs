//! External collaborators: dex disassembly, smali assembly and APK signing.
//!
//! The pipeline only sees the traits; the `Command*` adapters shell out to baksmali, smali
//! and apksigner (or anything with the same command line).
use std::ffi::OsString;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::config::{SignerConfig, ToolConfig};

#[derive(Debug)]
pub enum ToolError {
    EmptyCommand,
    Spawn { program: String, source: io::Error },
    Failed { program: String, status: Option<i32>, stderr: String },
    MissingOutput(PathBuf),
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolError::EmptyCommand => write!(f, "tool command is empty"),
            ToolError::Spawn { program, source } => write!(f, "cannot run {program}: {source}"),
            ToolError::Failed {
                program,
                status,
                stderr,
            } => {
                match status {
                    Some(code) => write!(f, "{program} exited with status {code}")?,
                    None => write!(f, "{program} was terminated by a signal")?,
                }
                if !stderr.trim().is_empty() {
                    write!(f, ": {}", stderr.trim())?;
                }
                Ok(())
            }
            ToolError::MissingOutput(path) => {
                write!(f, "tool did not produce {}", path.display())
            }
        }
    }
}

impl std::error::Error for ToolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ToolError::Spawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Turns one dex unit into a directory of `.smali` files.
pub trait Disassembler: Send + Sync {
    fn disassemble(&self, dex: &Path, out_dir: &Path) -> Result<(), ToolError>;
}

/// Turns a directory of `.smali` files back into one dex unit.
pub trait Assembler: Send + Sync {
    fn assemble(&self, smali_dir: &Path, out_dex: &Path) -> Result<(), ToolError>;
}

/// Signs `input` into `output`.
pub trait Signer: Send + Sync {
    fn sign(&self, input: &Path, output: &Path) -> Result<(), ToolError>;
}

/// The three collaborators the pipeline needs.
pub struct Toolchain {
    pub disassembler: Box<dyn Disassembler>,
    pub assembler: Box<dyn Assembler>,
    pub signer: Box<dyn Signer>,
}

impl Toolchain {
    pub fn new(
        disassembler: impl Disassembler + 'static,
        assembler: impl Assembler + 'static,
        signer: impl Signer + 'static,
    ) -> Self {
        Toolchain {
            disassembler: Box::new(disassembler),
            assembler: Box::new(assembler),
            signer: Box::new(signer),
        }
    }

    /// Command adapters built from configuration.
    pub fn from_config(tools: &ToolConfig, api_level: Option<u32>) -> Self {
        Toolchain::new(
            CommandDisassembler {
                command: tools.disassembler.clone(),
                api_level,
            },
            CommandAssembler {
                command: tools.assembler.clone(),
                api_level,
            },
            CommandSigner::from_config(&tools.signer),
        )
    }
}

/// `<command…> d <dex> -o <dir> [--api N]`
pub struct CommandDisassembler {
    pub command: Vec<String>,
    pub api_level: Option<u32>,
}

impl Disassembler for CommandDisassembler {
    fn disassemble(&self, dex: &Path, out_dir: &Path) -> Result<(), ToolError> {
        let mut args: Vec<OsString> = vec!["d".into(), dex.into(), "-o".into(), out_dir.into()];
        push_api_level(&mut args, self.api_level);
        run_command(&self.command, args)?;
        if !out_dir.is_dir() {
            return Err(ToolError::MissingOutput(out_dir.to_path_buf()));
        }
        Ok(())
    }
}

/// `<command…> a <dir> -o <dex> [--api N]`
pub struct CommandAssembler {
    pub command: Vec<String>,
    pub api_level: Option<u32>,
}

impl Assembler for CommandAssembler {
    fn assemble(&self, smali_dir: &Path, out_dex: &Path) -> Result<(), ToolError> {
        let mut args: Vec<OsString> = vec!["a".into(), smali_dir.into(), "-o".into(), out_dex.into()];
        push_api_level(&mut args, self.api_level);
        run_command(&self.command, args)?;
        require_output(out_dex)
    }
}

/// `<command…> sign --ks <ks> --ks-key-alias <alias> --ks-pass pass:<pw> --out <out> <in>`
pub struct CommandSigner {
    pub command: Vec<String>,
    pub keystore: PathBuf,
    pub key_alias: String,
    pub key_password: String,
}

impl CommandSigner {
    pub fn from_config(config: &SignerConfig) -> Self {
        CommandSigner {
            command: config.command.clone(),
            keystore: config.keystore.clone(),
            key_alias: config.key_alias.clone(),
            key_password: config.key_password.clone(),
        }
    }
}

impl Signer for CommandSigner {
    fn sign(&self, input: &Path, output: &Path) -> Result<(), ToolError> {
        let args: Vec<OsString> = vec![
            "sign".into(),
            "--ks".into(),
            self.keystore.clone().into(),
            "--ks-key-alias".into(),
            self.key_alias.clone().into(),
            "--ks-pass".into(),
            format!("pass:{}", self.key_password).into(),
            "--out".into(),
            output.into(),
            input.into(),
        ];
        run_command(&self.command, args)?;
        require_output(output)
    }
}

fn push_api_level(args: &mut Vec<OsString>, api_level: Option<u32>) {
    if let Some(api) = api_level {
        args.push("--api".into());
        args.push(api.to_string().into());
    }
}

/// A file that exists but is empty counts as missing.
pub fn require_output(path: &Path) -> Result<(), ToolError> {
    match path.metadata() {
        Ok(meta) if meta.is_file() && meta.len() > 0 => Ok(()),
        _ => Err(ToolError::MissingOutput(path.to_path_buf())),
    }
}

fn run_command(command: &[String], args: Vec<OsString>) -> Result<(), ToolError> {
    let (program, prefix) = command.split_first().ok_or(ToolError::EmptyCommand)?;
    log::debug!("running {} {:?}", command.join(" "), args);
    let output = Command::new(program)
        .args(prefix)
        .args(&args)
        .output()
        .map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(ToolError::Failed {
            program: program.clone(),
            status: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(())
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into(), "tool".into()]
    }

    #[test]
    fn assembler_passes_arguments_and_checks_output() {
        let dir = tempfile::tempdir().unwrap();
        let smali = dir.path().join("smali");
        fs::create_dir_all(&smali).unwrap();
        let dex = dir.path().join("classes.dex");

        // $1=a $2=<dir> $3=-o $4=<dex> $5=--api $6=N
        let assembler = CommandAssembler {
            command: sh("[ \"$1\" = a ] && [ \"$5\" = --api ] && echo \"$6\" > \"$4\""),
            api_level: Some(21),
        };
        assembler.assemble(&smali, &dex).unwrap();
        assert_eq!(fs::read_to_string(&dex).unwrap().trim(), "21");

        let silent = CommandAssembler {
            command: sh("true"),
            api_level: None,
        };
        let other = dir.path().join("classes2.dex");
        assert!(matches!(
            silent.assemble(&smali, &other),
            Err(ToolError::MissingOutput(_))
        ));
    }

    #[test]
    fn failures_carry_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let disassembler = CommandDisassembler {
            command: sh("echo broken dex >&2; exit 3"),
            api_level: None,
        };
        let err = disassembler
            .disassemble(&dir.path().join("classes.dex"), &dir.path().join("smali"))
            .unwrap_err();
        match err {
            ToolError::Failed { status, stderr, .. } => {
                assert_eq!(status, Some(3));
                assert!(stderr.contains("broken dex"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn signer_uses_apksigner_flags() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.apk");
        fs::write(&input, b"apk").unwrap();
        let output = dir.path().join("out.apk");
        // $1=sign ... $7=pass:<pw> $8=--out $9=<out> $10=<in>
        let signer = CommandSigner {
            command: sh("[ \"$1\" = sign ] && [ \"$7\" = pass:secret ] && cp \"${10}\" \"$9\""),
            keystore: dir.path().join("debug.keystore"),
            key_alias: "key0".into(),
            key_password: "secret".into(),
        };
        signer.sign(&input, &output).unwrap();
        assert_eq!(fs::read(&output).unwrap(), b"apk");
    }

    #[test]
    fn empty_and_missing_commands() {
        assert!(matches!(run_command(&[], vec![]), Err(ToolError::EmptyCommand)));
        assert!(matches!(
            run_command(&["/nonexistent/tool".to_string()], vec![]),
            Err(ToolError::Spawn { .. })
        ));
    }
}
