//! Splices a `System.loadLibrary` call into a method of a smali file.
//!
//! The edit is textual and line based: the file is split on `\n` (so `\r` and a trailing
//! newline survive), the first method whose `name + descriptor` contains the target marker is
//! selected, and the block goes right after that method's `.locals` directive. Nothing is
//! written unless the whole edit succeeds.
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use crate::smali_parse::{const_string, is_method_end, load_library_call, locals_directive, method_header};
use crate::types::InjectionSpec;

#[derive(Debug)]
pub enum InjectionError {
    MethodNotFound { marker: String },
    RegisterDirectiveNotFound { method: String },
    AlreadyInjected { method: String },
    Io(io::Error),
}

impl fmt::Display for InjectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InjectionError::MethodNotFound { marker } => {
                write!(f, "no method matching `{marker}`")
            }
            InjectionError::RegisterDirectiveNotFound { method } => {
                write!(f, "method {method} has no .locals directive")
            }
            InjectionError::AlreadyInjected { method } => {
                write!(f, "method {method} already loads the library")
            }
            InjectionError::Io(err) => write!(f, "I/O error: {err}"),
        }
    }
}

impl std::error::Error for InjectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            InjectionError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for InjectionError {
    fn from(value: io::Error) -> Self {
        InjectionError::Io(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectionReport {
    /// `name + descriptor` of the edited method.
    pub method: String,
    /// Zero-based index of the first inserted line.
    pub inserted_at: usize,
    /// Whether `.locals 0` had to become `.locals 1`.
    pub locals_bumped: bool,
}

/// Edits `path` in place.
pub fn inject(path: &Path, spec: &InjectionSpec) -> Result<InjectionReport, InjectionError> {
    let source = fs::read_to_string(path)?;
    let (patched, report) = inject_source(&source, spec)?;
    fs::write(path, patched)?;
    log::info!(
        "injected loadLibrary(\"{}\") into {} of {}",
        spec.library_name,
        report.method,
        path.display()
    );
    Ok(report)
}

/// Pure form of [`inject`].
pub fn inject_source(
    source: &str,
    spec: &InjectionSpec,
) -> Result<(String, InjectionReport), InjectionError> {
    let mut lines: Vec<String> = source.split('\n').map(str::to_string).collect();
    let marker = spec.target.marker();

    let (method_idx, method) = lines
        .iter()
        .enumerate()
        .find_map(|(idx, line)| {
            let (_, header) = method_header(line.trim()).ok()?;
            let signature = header.signature();
            signature.contains(marker).then_some((idx, signature))
        })
        .ok_or_else(|| InjectionError::MethodNotFound {
            marker: marker.to_string(),
        })?;

    let body_end = lines[method_idx + 1..]
        .iter()
        .position(|line| is_method_end(line.trim()))
        .map_or(lines.len(), |offset| method_idx + 1 + offset);
    let body = &lines[method_idx + 1..body_end];

    if already_loads(body, &spec.library_name) {
        return Err(InjectionError::AlreadyInjected { method });
    }

    let (locals_idx, locals) = body
        .iter()
        .enumerate()
        .find_map(|(offset, line)| {
            let (_, count) = locals_directive(line.trim()).ok()?;
            Some((method_idx + 1 + offset, count))
        })
        .ok_or_else(|| InjectionError::RegisterDirectiveNotFound {
            method: method.clone(),
        })?;

    let carriage_return = if lines[locals_idx].ends_with('\r') { "\r" } else { "" };
    let locals_bumped = locals == 0;
    if locals_bumped {
        let line = &lines[locals_idx];
        let indent = &line[..line.len() - line.trim_start().len()];
        lines[locals_idx] = format!("{indent}.locals 1{carriage_return}");
    }

    let block = spec
        .instruction_block()
        .into_iter()
        .map(|line| format!("{line}{carriage_return}"));
    let inserted_at = locals_idx + 1;
    let tail = lines.split_off(inserted_at);
    lines.extend(block);
    lines.extend(tail);

    Ok((
        lines.join("\n"),
        InjectionReport {
            method,
            inserted_at,
            locals_bumped,
        },
    ))
}

/// A `const-string` of `library` followed by a `loadLibrary` on the same register, with only
/// blank lines or comments in between.
fn already_loads(body: &[String], library: &str) -> bool {
    body.iter().enumerate().any(|(idx, line)| {
        let Ok((_, (register, literal))) = const_string(line.trim()) else {
            return false;
        };
        if literal != library {
            return false;
        }
        body[idx + 1..]
            .iter()
            .map(|line| line.trim())
            .find(|line| !line.is_empty() && !line.starts_with('#'))
            .and_then(|line| load_library_call(line).ok())
            .is_some_and(|(_, called)| called == register)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::InjectionTarget;

    const ACTIVITY: &str = "\
.class public Lcom/example/Main;
.super Landroid/app/Activity;
.source \"Main.java\"


# direct methods
.method public constructor <init>()V
    .locals 0

    invoke-direct {p0}, Landroid/app/Activity;-><init>()V

    return-void
.end method


# virtual methods
.method protected onCreate(Landroid/os/Bundle;)V
    .locals 2
    .param p1, \"savedInstanceState\"

    invoke-super {p0, p1}, Landroid/app/Activity;->onCreate(Landroid/os/Bundle;)V

    return-void
.end method
";

    fn spec(target: InjectionTarget) -> InjectionSpec {
        InjectionSpec::new(target, "payload")
    }

    #[test]
    fn injects_after_locals_of_entry_method() {
        let (patched, report) = inject_source(ACTIVITY, &spec(InjectionTarget::EntryMethod)).unwrap();
        assert_eq!(report.method, "onCreate(Landroid/os/Bundle;)V");
        assert!(!report.locals_bumped);

        let lines: Vec<&str> = patched.split('\n').collect();
        let locals = lines.iter().position(|l| *l == "    .locals 2").unwrap();
        assert_eq!(report.inserted_at, locals + 1);
        assert_eq!(
            &lines[locals + 1..locals + 7],
            &[
                "",
                "    # load native library",
                "    const-string v0, \"payload\"",
                "",
                "    invoke-static {v0}, Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V",
                "",
            ]
        );
        assert_eq!(lines[locals + 7], "    .param p1, \"savedInstanceState\"");
        assert!(patched.ends_with(".end method\n"));
        assert_eq!(patched.split('\n').count(), ACTIVITY.split('\n').count() + 6);
    }

    #[test]
    fn constructor_with_no_locals_gets_a_register() {
        let (patched, report) = inject_source(ACTIVITY, &spec(InjectionTarget::Constructor)).unwrap();
        assert_eq!(report.method, "<init>()V");
        assert!(report.locals_bumped);
        assert!(patched.contains(".method public constructor <init>()V\n    .locals 1\n\n    # load"));
        assert!(patched.contains("    .locals 2\n    .param p1"));
    }

    #[test]
    fn second_run_is_rejected_without_touching_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Main.smali");
        fs::write(&path, ACTIVITY).unwrap();

        inject(&path, &spec(InjectionTarget::EntryMethod)).unwrap();
        let once = fs::read_to_string(&path).unwrap();
        let err = inject(&path, &spec(InjectionTarget::EntryMethod)).unwrap_err();
        assert!(matches!(err, InjectionError::AlreadyInjected { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), once);
        assert_eq!(once.matches("loadLibrary").count(), 1);

        // A different library is a different block.
        let other = InjectionSpec::new(InjectionTarget::EntryMethod, "other");
        inject(&path, &other).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap().matches("loadLibrary").count(), 2);
    }

    #[test]
    fn missing_method_or_directive_leaves_file_alone() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Main.smali");
        fs::write(&path, ACTIVITY).unwrap();
        let err = inject(&path, &spec(InjectionTarget::Method("onResume()V".into()))).unwrap_err();
        assert!(matches!(err, InjectionError::MethodNotFound { marker } if marker == "onResume()V"));
        assert_eq!(fs::read_to_string(&path).unwrap(), ACTIVITY);

        let registers = ACTIVITY.replace(".locals 2", ".registers 4");
        fs::write(&path, &registers).unwrap();
        let err = inject(&path, &spec(InjectionTarget::EntryMethod)).unwrap_err();
        assert!(matches!(err, InjectionError::RegisterDirectiveNotFound { .. }));
        assert_eq!(fs::read_to_string(&path).unwrap(), registers);
    }

    #[test]
    fn directive_search_stops_at_end_of_method() {
        let source = "\
.method public a()V
    return-void
.end method
.method public b()V
    .locals 1
    return-void
.end method";
        let err = inject_source(source, &spec(InjectionTarget::Method("a()V".into()))).unwrap_err();
        assert!(matches!(err, InjectionError::RegisterDirectiveNotFound { method } if method == "a()V"));
    }

    #[test]
    fn first_matching_overload_wins_and_crlf_survives() {
        let source = ".method public onCreate(Landroid/os/Bundle;)V\r\n    .locals 3\r\n.end method\r\n\
.method public onCreate(Landroid/os/Bundle;)V\r\n    .locals 5\r\n.end method\r\n";
        let (patched, report) = inject_source(source, &spec(InjectionTarget::EntryMethod)).unwrap();
        assert_eq!(report.inserted_at, 2);
        let lines: Vec<&str> = patched.split('\n').collect();
        assert_eq!(lines[1], "    .locals 3\r");
        assert_eq!(lines[3], "    # load native library\r");
        assert!(patched.contains("    .locals 5\r\n.end method\r\n"));
        assert_eq!(patched.matches("loadLibrary").count(), 1);
    }
}
