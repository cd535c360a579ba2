use std::collections::BTreeMap;
use std::fs;
use std::sync::mpsc;

use super::fixtures::*;
use crate::android::align::verify_alignment;
use crate::android::zip::{list_entries, read_entry, ApkCompression};
use crate::events::{EventSink, PatchEvent, PatchState};
use crate::patcher::{CancelToken, Patcher};
use crate::types::{Artifact, InjectionTarget};
use crate::units::{DexUnit, UnitTable};
use crate::PatchError;

fn states(events: &[PatchEvent]) -> Vec<PatchState> {
    events
        .iter()
        .filter_map(|event| match event {
            PatchEvent::StateChanged(state) => Some(*state),
            _ => None,
        })
        .collect()
}

#[test]
fn patch_injects_into_launcher_found_in_secondary_unit() {
    let fixture = Fixture::sample();
    let patcher = Patcher::new(fixture.config(), toolchain(false)).unwrap();
    let patched = patcher.patch(&fixture.apk).unwrap();

    assert_eq!(patched.entry_point.as_str(), "com.example.app.MainActivity");
    assert!(patched
        .instruction_file
        .ends_with("smali_classes2/com/example/app/MainActivity.smali"));
    assert_eq!(patched.injection.method, "onCreate(Landroid/os/Bundle;)V");
    assert!(!patched.injection.locals_bumped);

    let source = fs::read_to_string(&patched.instruction_file).unwrap();
    let lines: Vec<&str> = source.lines().collect();
    let header = lines
        .iter()
        .position(|line| line.starts_with(".method protected onCreate"))
        .unwrap();
    assert_eq!(lines[header + 1].trim(), ".locals 1");
    let block = patcher.config().injection_spec().instruction_block();
    for (offset, expected) in block.iter().enumerate() {
        assert_eq!(lines[header + 2 + offset], expected.as_str());
    }
    let next = lines[header + 2 + block.len()..]
        .iter()
        .find(|line| !line.trim().is_empty())
        .unwrap();
    assert_eq!(
        next.trim(),
        "invoke-super {p0, p1}, Landroid/app/Activity;->onCreate(Landroid/os/Bundle;)V"
    );

    // Settings has no launcher filter and must be untouched.
    let settings = patched
        .workspace
        .extracted_dir()
        .join("smali/com/example/app/SettingsActivity.smali");
    assert_eq!(fs::read_to_string(settings).unwrap(), SETTINGS_ACTIVITY);

    // lib/ already ships arm64-v8a only, so the x86 payload stays out.
    let lib = patched.workspace.extracted_dir().join("lib");
    assert_eq!(patched.native_libs, vec![lib.join("arm64-v8a/libpayload.so")]);
    assert!(!lib.join("x86").exists());

    let units = UnitTable::load(&patched.workspace.units_file()).unwrap();
    assert_eq!(units.len(), 2);
    assert_eq!(units.disassembled().count(), 2);
}

#[test]
fn run_produces_signed_aligned_archive() {
    let fixture = Fixture::sample();
    let (tx, rx) = mpsc::channel();
    let patcher = Patcher::new(fixture.config(), toolchain(false))
        .unwrap()
        .with_events(EventSink::channel(tx));
    let destination = fixture.destination();
    let artifact = patcher.run(&fixture.apk, &destination).unwrap();

    assert_eq!(
        artifact,
        Artifact::Signed {
            path: destination.clone(),
            aligned: true
        }
    );
    assert!(fs::metadata(&destination).unwrap().len() > 0);
    assert!(verify_alignment(&destination, 4, 4096).unwrap().is_empty());

    let entries: BTreeMap<String, ApkCompression> =
        list_entries(&destination).unwrap().into_iter().collect();
    assert!(!entries.keys().any(|name| name.starts_with("META-INF/")));
    assert_eq!(entries["classes.dex"], ApkCompression::Stored);
    assert_eq!(entries["lib/arm64-v8a/libpayload.so"], ApkCompression::Stored);
    assert_eq!(entries["AndroidManifest.xml"], ApkCompression::Deflated);
    assert!(entries.contains_key("lib/arm64-v8a/libapp.so"));
    assert!(entries.contains_key("res/layout/main.xml"));
    assert!(!entries.keys().any(|name| name.starts_with("smali")));

    let dex = read_entry(&destination, "classes2.dex").unwrap();
    let classes: BTreeMap<String, String> = serde_json::from_slice(&dex).unwrap();
    let main = &classes["com/example/app/MainActivity.smali"];
    assert!(main.contains("const-string v0, \"payload\""));
    assert!(main.contains("Ljava/lang/System;->loadLibrary(Ljava/lang/String;)V"));

    let events: Vec<PatchEvent> = rx.try_iter().collect();
    assert_eq!(
        states(&events),
        vec![
            PatchState::Decompiling,
            PatchState::Configuration,
            PatchState::Patching,
            PatchState::Finished
        ]
    );
    assert!(!events
        .iter()
        .any(|event| matches!(event, PatchEvent::Failed { .. })));
}

#[test]
fn failed_signing_leaves_aligned_unsigned_archive() {
    let fixture = Fixture::sample();
    let patcher = Patcher::new(fixture.config(), toolchain(true)).unwrap();
    let patched = patcher.patch(&fixture.apk).unwrap();
    let artifact = patcher.rebuild(patched.workspace.root()).unwrap();

    let output = patched.workspace.output_dir();
    assert_eq!(
        artifact,
        Artifact::AlignedUnsigned {
            path: output.join("aligned.apk")
        }
    );
    assert!(!artifact.is_signed());
    assert!(output.join("unsigned.apk").is_file());
    assert!(!output.join("signed.apk").exists());
    assert!(!patched.workspace.build_dir().exists());
}

#[test]
fn unit_that_fails_to_disassemble_is_carried_over() {
    let mut entries = sample_entries();
    let broken = b"dex\n035\0not a fake dex".to_vec();
    entries.push(("classes3.dex", broken.clone()));
    let fixture = Fixture::new(&entries);

    let (tx, rx) = mpsc::channel();
    let patcher = Patcher::new(fixture.config(), toolchain(false))
        .unwrap()
        .with_events(EventSink::channel(tx));
    let patched = patcher.patch(&fixture.apk).unwrap();

    let skipped: Vec<DexUnit> = rx
        .try_iter()
        .filter_map(|event| match event {
            PatchEvent::UnitSkipped { unit, .. } => Some(unit),
            _ => None,
        })
        .collect();
    assert_eq!(skipped, vec![DexUnit::new(3).unwrap()]);
    assert!(!patched.workspace.extracted_dir().join("smali_classes3").exists());
    let record = patched.units.by_smali_dir("smali_classes3").unwrap();
    assert!(!record.disassembled);

    let artifact = patcher.rebuild(patched.workspace.root()).unwrap();
    assert_eq!(read_entry(artifact.path(), "classes3.dex").unwrap(), broken);
}

#[test]
fn constructor_target_bumps_empty_register_frame() {
    let fixture = Fixture::sample();
    let mut config = fixture.config();
    config.target = InjectionTarget::Constructor;
    let patcher = Patcher::new(config, toolchain(false)).unwrap();
    let patched = patcher.patch(&fixture.apk).unwrap();

    assert_eq!(patched.injection.method, "<init>()V");
    assert!(patched.injection.locals_bumped);
    let source = fs::read_to_string(&patched.instruction_file).unwrap();
    let init = source.find(".method public constructor <init>()V").unwrap();
    assert!(source[init..].contains(".locals 1\n\n    # load native library"));
}

#[test]
fn missing_launcher_class_is_reported() {
    let mut entries = sample_entries();
    entries[0] = ("AndroidManifest.xml", manifest("com.example.app.Gone"));
    let fixture = Fixture::new(&entries);
    let patcher = Patcher::new(fixture.config(), toolchain(false)).unwrap();
    match patcher.patch(&fixture.apk) {
        Err(PatchError::LocatorNotFound { class_name }) => {
            assert_eq!(class_name, "com.example.app.Gone")
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn package_without_manifest_is_rejected_and_state_resets() {
    let entries: Vec<_> = sample_entries()
        .into_iter()
        .filter(|(name, _)| *name != "AndroidManifest.xml")
        .collect();
    let fixture = Fixture::new(&entries);
    let (tx, rx) = mpsc::channel();
    let patcher = Patcher::new(fixture.config(), toolchain(false))
        .unwrap()
        .with_events(EventSink::channel(tx));

    let err = patcher.run(&fixture.apk, &fixture.destination()).unwrap_err();
    assert!(matches!(err, PatchError::ManifestMissing));
    assert!(!fixture.destination().exists());

    let events: Vec<PatchEvent> = rx.try_iter().collect();
    assert_eq!(
        states(&events),
        vec![PatchState::Decompiling, PatchState::Empty]
    );
    assert!(events
        .iter()
        .any(|event| matches!(event, PatchEvent::Failed { .. })));
}

#[test]
fn cancelled_run_stops_before_disassembly() {
    let fixture = Fixture::sample();
    let cancel = CancelToken::new();
    let patcher = Patcher::new(fixture.config(), toolchain(false))
        .unwrap()
        .with_cancel_token(cancel.clone());
    cancel.cancel();
    assert!(patcher.cancel_token().is_cancelled());
    assert!(matches!(
        patcher.patch(&fixture.apk),
        Err(PatchError::Cancelled)
    ));
}

#[test]
fn workspace_is_removed_unless_kept() {
    let fixture = Fixture::sample();
    let mut config = fixture.config();
    config.keep_workspace = false;
    let work_root = config.work_root.clone();
    let patcher = Patcher::new(config, toolchain(false)).unwrap();
    patcher.run(&fixture.apk, &fixture.destination()).unwrap();

    assert!(fixture.destination().is_file());
    assert_eq!(fs::read_dir(work_root).unwrap().count(), 0);
}

#[test]
fn failed_runs_remove_their_workspace_too() {
    let mut entries = sample_entries();
    entries[0] = ("AndroidManifest.xml", manifest("com.example.app.Gone"));
    let fixture = Fixture::new(&entries);
    let mut config = fixture.config();
    config.keep_workspace = false;
    let work_root = config.work_root.clone();

    let patcher = Patcher::new(config.clone(), toolchain(false)).unwrap();
    assert!(matches!(
        patcher.run(&fixture.apk, &fixture.destination()),
        Err(PatchError::LocatorNotFound { .. })
    ));
    assert_eq!(fs::read_dir(&work_root).unwrap().count(), 0);

    let sample = Fixture::sample();
    let patcher = Patcher::new(config, failing_toolchain(true, false)).unwrap();
    assert!(matches!(
        patcher.run(&sample.apk, &sample.destination()),
        Err(PatchError::Assembly { .. })
    ));
    assert_eq!(fs::read_dir(&work_root).unwrap().count(), 0);
}

#[test]
fn assembly_failure_aborts_rebuild_in_error_state() {
    let fixture = Fixture::sample();
    let (tx, rx) = mpsc::channel();
    let patcher = Patcher::new(fixture.config(), failing_toolchain(true, false))
        .unwrap()
        .with_events(EventSink::channel(tx));

    match patcher.run(&fixture.apk, &fixture.destination()) {
        Err(PatchError::Assembly { unit, .. }) => assert_eq!(unit, DexUnit::PRIMARY),
        other => panic!("unexpected {other:?}"),
    }
    assert!(!fixture.destination().exists());
    let events: Vec<PatchEvent> = rx.try_iter().collect();
    assert_eq!(states(&events).last(), Some(&PatchState::Error));
}

#[test]
fn launcher_alias_edits_its_target_activity() {
    let mut entries = sample_entries();
    entries[0] = ("AndroidManifest.xml", alias_manifest());
    let fixture = Fixture::new(&entries);
    let patcher = Patcher::new(fixture.config(), toolchain(false)).unwrap();
    let patched = patcher.patch(&fixture.apk).unwrap();

    assert_eq!(patched.entry_point.as_str(), "com.example.app.MainActivity");
    assert!(patched
        .instruction_file
        .ends_with("smali_classes2/com/example/app/MainActivity.smali"));
}

#[test]
fn second_patch_of_patched_output_is_refused() {
    let fixture = Fixture::sample();
    let patcher = Patcher::new(fixture.config(), toolchain(false)).unwrap();
    let destination = fixture.destination();
    patcher.run(&fixture.apk, &destination).unwrap();

    assert!(matches!(
        patcher.patch(&destination),
        Err(PatchError::Injection(
            crate::smali_inject::InjectionError::AlreadyInjected { .. }
        ))
    ));
}
