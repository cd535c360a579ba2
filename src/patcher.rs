//! The patch pipeline: extract → disassemble → resolve entry point → inject → rebuild →
//! align → sign.
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::android::align;
use crate::android::binary_xml::AndroidManifest;
use crate::android::manifest::{alias_target, resolve_entry_point};
use crate::android::zip::{self, is_dex_name, SIGNATURE_DIR};
use crate::config::PatcherConfig;
use crate::error::{PatchError, PatchResult};
use crate::events::{EventSink, PatchEvent, PatchState, StateMachine};
use crate::smali_inject::{self, InjectionReport};
use crate::smali_locate::{self, LocateError};
use crate::tools::{require_output, Toolchain};
use crate::types::{Artifact, EntryPoint};
use crate::units::{UnitRecord, UnitTable};
use crate::workspace::Workspace;

const MANIFEST_NAME: &str = "AndroidManifest.xml";
const SMALI_PREFIX: &str = "smali";

/// Cooperative cancellation shared between a [`Patcher`] and whoever may want to stop it.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What [`Patcher::patch`] leaves behind for [`Patcher::rebuild`].
#[derive(Debug)]
pub struct PatchedWorkspace {
    pub workspace: Workspace,
    /// The class that was edited. For a launcher alias this is its target activity.
    pub entry_point: EntryPoint,
    pub instruction_file: PathBuf,
    pub injection: InjectionReport,
    pub units: UnitTable,
    pub native_libs: Vec<PathBuf>,
}

pub struct Patcher {
    config: PatcherConfig,
    toolchain: Toolchain,
    events: EventSink,
    cancel: CancelToken,
}

impl Patcher {
    pub fn new(config: PatcherConfig, toolchain: Toolchain) -> PatchResult<Self> {
        config.validate()?;
        Ok(Patcher {
            config,
            toolchain,
            events: EventSink::none(),
            cancel: CancelToken::new(),
        })
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &PatcherConfig {
        &self.config
    }

    fn check_cancelled(&self) -> PatchResult<()> {
        if self.cancel.is_cancelled() {
            self.events.warn("run cancelled");
            return Err(PatchError::Cancelled);
        }
        Ok(())
    }

    /// Unpacks `apk` into a fresh workspace and injects the load call into its launcher
    /// activity. Native libraries are copied into `lib/` as well.
    pub fn patch(&self, apk: &Path) -> PatchResult<PatchedWorkspace> {
        let workspace = Workspace::create(&self.config.work_root).map_err(PatchError::Workspace)?;
        self.patch_in(workspace, apk)
    }

    fn patch_in(&self, workspace: Workspace, apk: &Path) -> PatchResult<PatchedWorkspace> {
        let input = workspace.input_apk();
        fs::copy(apk, &input).map_err(PatchError::io(format!("cannot copy {}", apk.display())))?;

        let extracted = workspace.extracted_dir();
        self.events.info(format!("extracting {}", apk.display()));
        let report = zip::extract(&input, &extracted).map_err(PatchError::Extraction)?;
        for (name, reason) in &report.failed {
            if name == MANIFEST_NAME || is_dex_name(name) {
                return Err(PatchError::CorruptEntry {
                    name: name.clone(),
                    reason: reason.clone(),
                });
            }
            self.events.warn(format!("skipped entry {name}: {reason}"));
        }

        let manifest_path = extracted.join(MANIFEST_NAME);
        if !manifest_path.is_file() {
            return Err(PatchError::ManifestMissing);
        }
        let manifest = fs::read(&manifest_path).map_err(PatchError::io("cannot read manifest"))?;
        let manifest = AndroidManifest::from_bytes(&manifest).map_err(PatchError::ManifestDecode)?;
        let launcher = resolve_entry_point(&manifest)?;
        self.events.info(format!("launcher activity: {launcher}"));

        let units = self.disassemble_units(&extracted)?;
        units
            .save(&workspace.units_file())
            .map_err(PatchError::io("cannot write unit table"))?;

        let (entry_point, instruction_file) =
            match smali_locate::locate(&extracted, launcher.as_str()) {
                Ok(path) => (launcher, path),
                Err(LocateError::NotFound { class_name }) => {
                    let target = alias_target(&manifest, &launcher)
                        .ok_or(PatchError::LocatorNotFound { class_name })?;
                    self.events
                        .info(format!("{launcher} is an alias, editing {target} instead"));
                    let path = smali_locate::locate(&extracted, target.as_str())
                        .map_err(locate_error)?;
                    (target, path)
                }
                Err(err) => return Err(locate_error(err)),
            };

        let spec = self.config.injection_spec();
        let injection = smali_inject::inject(&instruction_file, &spec)?;
        self.events.info(format!(
            "injected {} into {} ({})",
            spec.library_name, entry_point, injection.method
        ));

        let native_libs = self.copy_native_libs(&extracted)?;

        Ok(PatchedWorkspace {
            workspace,
            entry_point,
            instruction_file,
            injection,
            units,
            native_libs,
        })
    }

    fn disassemble_units(&self, extracted: &Path) -> PatchResult<UnitTable> {
        let mut table = UnitTable::new();
        let units = UnitTable::scan_dex_units(extracted)
            .map_err(PatchError::io("cannot list dex units"))?;
        for unit in units {
            self.check_cancelled()?;
            let dex = extracted.join(unit.dex_name());
            let out_dir = extracted.join(unit.smali_dir_name());
            self.events.info(format!("disassembling {unit}"));
            match self.toolchain.disassembler.disassemble(&dex, &out_dir) {
                Ok(()) => table.insert(UnitRecord::new(unit, true)),
                Err(source) => {
                    let err = PatchError::Disassembly { unit, source };
                    self.events.emit(PatchEvent::UnitSkipped {
                        unit,
                        reason: err.to_string(),
                    });
                    if out_dir.exists() {
                        if let Err(cleanup) = fs::remove_dir_all(&out_dir) {
                            log::warn!("cannot remove {}: {cleanup}", out_dir.display());
                        }
                    }
                    table.insert(UnitRecord::new(unit, false));
                }
            }
        }
        Ok(table)
    }

    /// Copies `<native_assets>/<abi>/*.so` into `lib/<abi>/`. When the package already ships
    /// `lib/`, ABIs it lacks are left out.
    fn copy_native_libs(&self, extracted: &Path) -> PatchResult<Vec<PathBuf>> {
        let lib_dir = extracted.join("lib");
        let shipped: Option<BTreeSet<String>> = if lib_dir.is_dir() {
            let mut abis = BTreeSet::new();
            for entry in fs::read_dir(&lib_dir).map_err(PatchError::io("cannot list lib/"))? {
                let entry = entry.map_err(PatchError::io("cannot list lib/"))?;
                if entry.path().is_dir() {
                    abis.insert(entry.file_name().to_string_lossy().into_owned());
                }
            }
            Some(abis)
        } else {
            None
        };

        let mut copied = Vec::new();
        for abi in &self.config.abis {
            let source = self.config.native_assets.join(abi);
            if !source.is_dir() {
                log::debug!("no payload for {abi}");
                continue;
            }
            if let Some(shipped) = &shipped {
                if !shipped.contains(abi) {
                    self.events.info(format!("package ships no {abi} libraries, skipping"));
                    continue;
                }
            }
            let target = lib_dir.join(abi);
            fs::create_dir_all(&target).map_err(PatchError::io(format!("cannot create lib/{abi}")))?;

            let mut libs: Vec<PathBuf> = fs::read_dir(&source)
                .map_err(PatchError::io(format!("cannot list {}", source.display())))?
                .filter_map(Result::ok)
                .map(|entry| entry.path())
                .filter(|path| path.is_file() && path.extension().is_some_and(|ext| ext == "so"))
                .collect();
            libs.sort();
            for lib in libs {
                let Some(file_name) = lib.file_name() else {
                    continue;
                };
                let dest = target.join(file_name);
                fs::copy(&lib, &dest)
                    .map_err(PatchError::io(format!("cannot copy {}", lib.display())))?;
                copied.push(dest);
            }
        }

        if copied.is_empty() {
            self.events.warn("no native libraries copied");
        } else {
            self.events.info(format!("copied {} native libraries", copied.len()));
        }
        Ok(copied)
    }

    /// Reassembles a patched workspace into `output/` and returns the best artifact reached.
    pub fn rebuild(&self, workspace_dir: &Path) -> PatchResult<Artifact> {
        let workspace = Workspace::open(workspace_dir).map_err(PatchError::Workspace)?;
        let extracted = workspace.extracted_dir();
        let units_file = workspace.units_file();
        let units = if units_file.is_file() {
            UnitTable::load(&units_file).map_err(PatchError::io("cannot read unit table"))?
        } else {
            log::warn!("no {} in workspace, inferring units", units_file.display());
            UnitTable::infer(&extracted).map_err(PatchError::io("cannot infer units"))?
        };

        let build = workspace.build_dir();
        if build.exists() {
            fs::remove_dir_all(&build).map_err(PatchError::io("cannot clear build/"))?;
        }
        fs::create_dir_all(&build).map_err(PatchError::io("cannot create build/"))?;
        copy_tree(&extracted, &build, true).map_err(PatchError::io("cannot stage build/"))?;

        for record in units.disassembled() {
            self.check_cancelled()?;
            let smali_dir = extracted.join(&record.smali_dir);
            if !smali_dir.is_dir() {
                self.events
                    .warn(format!("{} is gone, keeping original {}", record.smali_dir, record.dex_name));
                continue;
            }
            self.events.info(format!("assembling {}", record.dex_name));
            self.toolchain
                .assembler
                .assemble(&smali_dir, &build.join(&record.dex_name))
                .map_err(|source| PatchError::Assembly {
                    unit: record.unit,
                    source,
                })?;
        }

        let signature_dir = build.join(SIGNATURE_DIR);
        if signature_dir.exists() {
            fs::remove_dir_all(&signature_dir).map_err(PatchError::io("cannot drop META-INF"))?;
        }

        let output = workspace.output_dir();
        fs::create_dir_all(&output).map_err(PatchError::io("cannot create output/"))?;
        let unsigned = output.join("unsigned.apk");
        let report = zip::assemble(&build, &[], &unsigned).map_err(PatchError::Archive)?;
        self.events
            .info(format!("assembled {} entries", report.entry_count()));

        let aligned = output.join("aligned.apk");
        let aligned_ok = match align::align(
            &unsigned,
            &aligned,
            self.config.word_alignment,
            self.config.page_alignment,
        ) {
            Ok(_) => true,
            Err(err) => {
                self.events
                    .warn(PatchError::Alignment(err).to_string() + ", using unaligned archive");
                fs::copy(&unsigned, &aligned).map_err(PatchError::io("cannot copy archive"))?;
                false
            }
        };

        self.check_cancelled()?;
        let signed = output.join("signed.apk");
        let artifact = match self
            .toolchain
            .signer
            .sign(&aligned, &signed)
            .and_then(|()| require_output(&signed))
        {
            Ok(()) => Artifact::Signed {
                path: signed,
                aligned: aligned_ok,
            },
            Err(err) => {
                self.events
                    .warn(PatchError::Signing(err).to_string() + ", leaving archive unsigned");
                if signed.exists() {
                    if let Err(cleanup) = fs::remove_file(&signed) {
                        log::warn!("cannot remove {}: {cleanup}", signed.display());
                    }
                }
                if aligned_ok {
                    Artifact::AlignedUnsigned { path: aligned }
                } else {
                    Artifact::Unaligned { path: unsigned }
                }
            }
        };

        if let Err(err) = fs::remove_dir_all(&build) {
            log::warn!("cannot remove {}: {err}", build.display());
        }
        self.events.info(format!("rebuild finished, {artifact}"));
        Ok(artifact)
    }

    /// Patches and rebuilds `apk`, copying the artifact to `destination`.
    ///
    /// Drives [`PatchState`] through the sink. A failure while patching resets to `Empty`;
    /// a failure while rebuilding ends in `Error`. Unless `keep_workspace` is set, the
    /// workspace is removed however the run ends.
    pub fn run(&self, apk: &Path, destination: &Path) -> PatchResult<Artifact> {
        let mut machine = StateMachine::default();
        machine.advance(PatchState::Decompiling, &self.events);
        let workspace = match Workspace::create(&self.config.work_root) {
            Ok(workspace) => workspace,
            Err(err) => return Err(self.abort(&mut machine, PatchError::Workspace(err))),
        };

        let result = self.drive(&mut machine, workspace.clone(), apk, destination);
        if self.config.keep_workspace {
            return result;
        }
        match (workspace.remove(), result) {
            (Err(err), Ok(_)) => Err(PatchError::io("cannot remove workspace")(err)),
            (Err(err), Err(failure)) => {
                log::warn!("cannot remove workspace: {err}");
                Err(failure)
            }
            (Ok(()), result) => result,
        }
    }

    fn drive(
        &self,
        machine: &mut StateMachine,
        workspace: Workspace,
        apk: &Path,
        destination: &Path,
    ) -> PatchResult<Artifact> {
        let patched = match self.patch_in(workspace, apk) {
            Ok(patched) => patched,
            Err(err) => return Err(self.abort(machine, err)),
        };

        machine.advance(PatchState::Configuration, &self.events);
        machine.advance(PatchState::Patching, &self.events);
        match self.finish(&patched, destination) {
            Ok(artifact) => {
                machine.advance(PatchState::Finished, &self.events);
                Ok(artifact)
            }
            Err(err) => {
                self.events.emit(PatchEvent::Failed {
                    message: err.to_string(),
                });
                machine.advance(PatchState::Error, &self.events);
                Err(err)
            }
        }
    }

    /// Reports a failure before patching finished and resets the run.
    fn abort(&self, machine: &mut StateMachine, err: PatchError) -> PatchError {
        self.events.emit(PatchEvent::Failed {
            message: err.to_string(),
        });
        machine.reset(&self.events);
        err
    }

    fn finish(&self, patched: &PatchedWorkspace, destination: &Path) -> PatchResult<Artifact> {
        let artifact = self.rebuild(patched.workspace.root())?;
        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .map_err(PatchError::io(format!("cannot create {}", parent.display())))?;
            }
        }
        fs::copy(artifact.path(), destination)
            .map_err(PatchError::io(format!("cannot write {}", destination.display())))?;
        Ok(artifact.with_path(destination.to_path_buf()))
    }
}

fn locate_error(err: LocateError) -> PatchError {
    match err {
        LocateError::NotFound { class_name } => PatchError::LocatorNotFound { class_name },
        LocateError::Io(source) => PatchError::Io {
            context: "cannot search smali directories".to_string(),
            source,
        },
    }
}

/// Recursively copies `from` into `to`. With `skip_smali`, top-level `smali*` directories
/// stay behind.
fn copy_tree(from: &Path, to: &Path, skip_smali: bool) -> std::io::Result<()> {
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let path = entry.path();
        let target = to.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if skip_smali && entry.file_name().to_string_lossy().starts_with(SMALI_PREFIX) {
                continue;
            }
            fs::create_dir_all(&target)?;
            copy_tree(&path, &target, false)?;
        } else if file_type.is_file() {
            fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::fixtures::{failing_toolchain, toolchain, Fixture};

    #[test]
    fn alignment_failure_falls_back_to_unaligned_copy() {
        let fixture = Fixture::sample();
        let mut patcher = Patcher::new(fixture.config(), toolchain(false)).unwrap();
        let patched = patcher.patch(&fixture.apk).unwrap();
        let output = patched.workspace.output_dir();

        // The aligner rejects a boundary that is not a power of two.
        patcher.config.word_alignment = 3;
        let artifact = patcher.rebuild(patched.workspace.root()).unwrap();
        assert_eq!(
            artifact,
            Artifact::Signed {
                path: output.join("signed.apk"),
                aligned: false
            }
        );
        assert_eq!(
            fs::read(output.join("aligned.apk")).unwrap(),
            fs::read(output.join("unsigned.apk")).unwrap()
        );

        let mut unsigned = Patcher::new(fixture.config(), failing_toolchain(false, true)).unwrap();
        unsigned.config.word_alignment = 3;
        let artifact = unsigned.rebuild(patched.workspace.root()).unwrap();
        assert_eq!(
            artifact,
            Artifact::Unaligned {
                path: output.join("unsigned.apk")
            }
        );
        assert!(!output.join("signed.apk").exists());
    }
}
