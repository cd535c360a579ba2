//! Launcher activity resolution on top of the binary XML codec.
use std::fmt;

use crate::android::binary_xml::{AndroidManifest, BinaryXmlError, ManifestElement};
use crate::types::EntryPoint;

pub const ACTION_MAIN: &str = "android.intent.action.MAIN";
pub const CATEGORY_LAUNCHER: &str = "android.intent.category.LAUNCHER";

#[derive(Debug)]
pub enum ManifestError {
    Decode(BinaryXmlError),
    NoLauncherActivity,
}

impl fmt::Display for ManifestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManifestError::Decode(err) => write!(f, "cannot decode manifest: {err}"),
            ManifestError::NoLauncherActivity => {
                write!(f, "manifest declares no MAIN/LAUNCHER activity")
            }
        }
    }
}

impl std::error::Error for ManifestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ManifestError::Decode(err) => Some(err),
            ManifestError::NoLauncherActivity => None,
        }
    }
}

impl From<BinaryXmlError> for ManifestError {
    fn from(value: BinaryXmlError) -> Self {
        ManifestError::Decode(value)
    }
}

/// Decodes `manifest_bytes` and returns the fully qualified launcher activity.
pub fn resolve_launcher_entry_point(manifest_bytes: &[u8]) -> Result<EntryPoint, ManifestError> {
    let manifest = AndroidManifest::from_bytes(manifest_bytes)?;
    resolve_entry_point(&manifest)
}

/// Same as [`resolve_launcher_entry_point`] for an already decoded document.
pub fn resolve_entry_point(manifest: &AndroidManifest) -> Result<EntryPoint, ManifestError> {
    let activity = launcher_activity(manifest).ok_or(ManifestError::NoLauncherActivity)?;
    let class_name = resolve_class_name(manifest.package_name(), &activity)
        .ok_or(ManifestError::NoLauncherActivity)?;
    Ok(EntryPoint::new(class_name))
}

/// The raw `name` of the last activity or activity-alias carrying a MAIN+LAUNCHER intent
/// filter.
pub fn launcher_activity(manifest: &AndroidManifest) -> Option<String> {
    let mut candidate = None;
    walk(manifest.root(), &mut candidate);
    candidate
}

fn walk(element: &ManifestElement, candidate: &mut Option<String>) {
    match element.tag.as_str() {
        "activity" | "activity-alias" => {
            if is_launcher(element) {
                if let Some(name) = element.lookup_str("name") {
                    log::debug!("launcher candidate: {name}");
                    *candidate = Some(name.to_string());
                }
            }
        }
        _ => {
            for child in &element.children {
                walk(child, candidate);
            }
        }
    }
}

/// When `entry` names an `activity-alias`, the fully qualified `targetActivity` behind it.
pub fn alias_target(manifest: &AndroidManifest, entry: &EntryPoint) -> Option<EntryPoint> {
    let package = manifest.package_name();
    let application = manifest.application()?;
    application
        .children_named("activity-alias")
        .filter(|alias| {
            alias
                .lookup_str("name")
                .and_then(|name| resolve_class_name(package, name))
                .is_some_and(|name| name == entry.as_str())
        })
        .find_map(|alias| alias.lookup_str("targetActivity"))
        .and_then(|target| resolve_class_name(package, target))
        .map(EntryPoint::new)
}

fn is_launcher(activity: &ManifestElement) -> bool {
    activity.children_named("intent-filter").any(|filter| {
        let has_main = filter
            .children_named("action")
            .any(|action| action.lookup_str("name") == Some(ACTION_MAIN));
        let has_launcher = filter
            .children_named("category")
            .any(|category| category.lookup_str("name") == Some(CATEGORY_LAUNCHER));
        has_main && has_launcher
    })
}

/// Qualifies a manifest class name against the package.
///
/// `.Main` and `Main` both become `<package>.Main`; dotted names pass through. Returns
/// `None` when a relative name needs a package that is not declared.
pub fn resolve_class_name(package: Option<&str>, name: &str) -> Option<String> {
    if name.starts_with('.') {
        package.map(|package| format!("{package}{name}"))
    } else if !name.contains('.') {
        package.map(|package| format!("{package}.{name}"))
    } else {
        Some(name.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::android::binary_xml::ManifestAttribute;

    fn activity(name: &str, filters: Vec<ManifestElement>) -> ManifestElement {
        filters.into_iter().fold(
            ManifestElement::new("activity").with_attribute(ManifestAttribute::android("name", name)),
            ManifestElement::with_child,
        )
    }

    fn filter(action: &str, category: Option<&str>) -> ManifestElement {
        let mut filter = ManifestElement::new("intent-filter").with_child(
            ManifestElement::new("action").with_attribute(ManifestAttribute::android("name", action)),
        );
        if let Some(category) = category {
            filter = filter.with_child(
                ManifestElement::new("category")
                    .with_attribute(ManifestAttribute::android("name", category)),
            );
        }
        filter
    }

    fn launcher_filter() -> ManifestElement {
        filter(ACTION_MAIN, Some(CATEGORY_LAUNCHER))
    }

    fn manifest_bytes(package: Option<&str>, children: Vec<ManifestElement>) -> Vec<u8> {
        let mut root = ManifestElement::new("manifest");
        if let Some(package) = package {
            root = root.with_attribute(ManifestAttribute::new("package", package));
        }
        let application = children
            .into_iter()
            .fold(ManifestElement::new("application"), ManifestElement::with_child);
        AndroidManifest::from_root(root.with_child(application))
            .to_bytes()
            .expect("encode manifest")
    }

    #[test]
    fn resolves_relative_short_and_qualified_names() {
        for (name, expected) in [
            (".Main", "com.example.Main"),
            ("Main", "com.example.Main"),
            ("com.other.Main", "com.other.Main"),
        ] {
            let bytes = manifest_bytes(
                Some("com.example"),
                vec![activity(name, vec![launcher_filter()])],
            );
            let entry = resolve_launcher_entry_point(&bytes).unwrap();
            assert_eq!(entry.as_str(), expected);
        }
    }

    #[test]
    fn picks_the_launcher_among_plain_activities() {
        let bytes = manifest_bytes(
            Some("com.example"),
            vec![
                activity(".Settings", vec![filter("android.intent.action.VIEW", None)]),
                activity(".Main", vec![launcher_filter()]),
                activity(".About", vec![]),
            ],
        );
        assert_eq!(
            resolve_launcher_entry_point(&bytes).unwrap().as_str(),
            "com.example.Main"
        );
    }

    #[test]
    fn last_qualifying_activity_wins() {
        let bytes = manifest_bytes(
            Some("com.example"),
            vec![
                activity(".First", vec![launcher_filter()]),
                activity(".Second", vec![launcher_filter()]),
            ],
        );
        assert_eq!(
            resolve_launcher_entry_point(&bytes).unwrap().as_str(),
            "com.example.Second"
        );
    }

    #[test]
    fn main_and_launcher_must_share_a_filter() {
        let split = activity(
            ".Split",
            vec![
                filter(ACTION_MAIN, None),
                filter("android.intent.action.VIEW", Some(CATEGORY_LAUNCHER)),
            ],
        );
        let bytes = manifest_bytes(Some("com.example"), vec![split]);
        assert!(matches!(
            resolve_launcher_entry_point(&bytes),
            Err(ManifestError::NoLauncherActivity)
        ));
    }

    #[test]
    fn alias_reports_its_own_name_and_knows_its_target() {
        let alias = ManifestElement::new("activity-alias")
            .with_attribute(ManifestAttribute::android("name", ".Alias"))
            .with_attribute(ManifestAttribute::android("targetActivity", ".RealMain"))
            .with_child(launcher_filter());
        let bytes = manifest_bytes(
            Some("com.example"),
            vec![activity(".RealMain", vec![]), alias],
        );
        let entry = resolve_launcher_entry_point(&bytes).unwrap();
        assert_eq!(entry.as_str(), "com.example.Alias");

        let manifest = AndroidManifest::from_bytes(&bytes).unwrap();
        assert_eq!(
            alias_target(&manifest, &entry).unwrap().as_str(),
            "com.example.RealMain"
        );
        assert!(alias_target(&manifest, &EntryPoint::new("com.example.RealMain")).is_none());
    }

    #[test]
    fn reports_missing_launcher_and_bad_bytes() {
        let bytes = manifest_bytes(Some("com.example"), vec![activity(".Main", vec![])]);
        assert!(matches!(
            resolve_launcher_entry_point(&bytes),
            Err(ManifestError::NoLauncherActivity)
        ));
        assert!(matches!(
            resolve_launcher_entry_point(b"not a manifest"),
            Err(ManifestError::Decode(_))
        ));
    }

    #[test]
    fn relative_name_without_package_fails() {
        let bytes = manifest_bytes(None, vec![activity(".Main", vec![launcher_filter()])]);
        assert!(matches!(
            resolve_launcher_entry_point(&bytes),
            Err(ManifestError::NoLauncherActivity)
        ));
        assert_eq!(resolve_class_name(None, "a.b.Main").as_deref(), Some("a.b.Main"));
    }

    #[test]
    fn plain_name_attribute_is_accepted() {
        let plain = ManifestElement::new("activity")
            .with_attribute(ManifestAttribute::new("name", ".Plain"))
            .with_child(launcher_filter());
        let bytes = manifest_bytes(Some("com.example"), vec![plain]);
        assert_eq!(
            resolve_launcher_entry_point(&bytes).unwrap().as_str(),
            "com.example.Plain"
        );
    }
}
