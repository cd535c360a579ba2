//! Bytecode units: which `classesN.dex` was disassembled into which smali directory.
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

pub const UNITS_FILE: &str = "units.json";

/// A dex unit, numbered the way the platform numbers them: 1 is `classes.dex`, N ≥ 2 is
/// `classesN.dex`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DexUnit(u32);

impl DexUnit {
    pub const PRIMARY: DexUnit = DexUnit(1);

    pub fn new(index: u32) -> Option<DexUnit> {
        (index >= 1).then_some(DexUnit(index))
    }

    pub fn index(self) -> u32 {
        self.0
    }

    /// `classes.dex` → 1, `classes7.dex` → 7. `classes1.dex` is not a unit name.
    pub fn from_dex_name(name: &str) -> Option<DexUnit> {
        let digits = name.strip_prefix("classes")?.strip_suffix(".dex")?;
        parse_suffix(digits)
    }

    /// `smali` → 1, `smali_classes7` → 7.
    pub fn from_smali_dir(name: &str) -> Option<DexUnit> {
        if name == "smali" {
            return Some(DexUnit::PRIMARY);
        }
        parse_suffix(name.strip_prefix("smali_classes")?).filter(|unit| unit.0 >= 2)
    }

    pub fn dex_name(self) -> String {
        match self.0 {
            1 => "classes.dex".to_string(),
            n => format!("classes{n}.dex"),
        }
    }

    pub fn smali_dir_name(self) -> String {
        match self.0 {
            1 => "smali".to_string(),
            n => format!("smali_classes{n}"),
        }
    }
}

fn parse_suffix(digits: &str) -> Option<DexUnit> {
    if digits.is_empty() {
        return Some(DexUnit::PRIMARY);
    }
    if !digits.bytes().all(|b| b.is_ascii_digit()) || digits.starts_with('0') {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    (index >= 2).then_some(DexUnit(index))
}

impl fmt::Display for DexUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dex_name())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub unit: DexUnit,
    pub dex_name: String,
    pub smali_dir: String,
    /// False when disassembly failed and the unit's dex was left untouched.
    pub disassembled: bool,
}

impl UnitRecord {
    pub fn new(unit: DexUnit, disassembled: bool) -> Self {
        UnitRecord {
            unit,
            dex_name: unit.dex_name(),
            smali_dir: unit.smali_dir_name(),
            disassembled,
        }
    }
}

/// Ordered unit table persisted as `units.json` inside a workspace.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTable {
    units: Vec<UnitRecord>,
}

impl UnitTable {
    pub fn new() -> Self {
        UnitTable::default()
    }

    pub fn insert(&mut self, record: UnitRecord) {
        match self.units.binary_search_by(|existing| existing.unit.cmp(&record.unit)) {
            Ok(pos) => self.units[pos] = record,
            Err(pos) => self.units.insert(pos, record),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter()
    }

    pub fn disassembled(&self) -> impl Iterator<Item = &UnitRecord> {
        self.units.iter().filter(|record| record.disassembled)
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn by_smali_dir(&self, dir: &str) -> Option<&UnitRecord> {
        self.units.iter().find(|record| record.smali_dir == dir)
    }

    /// Dex units found at the top level of an extracted archive, in unit order.
    pub fn scan_dex_units(extracted: &Path) -> io::Result<Vec<DexUnit>> {
        let mut units = Vec::new();
        for entry in fs::read_dir(extracted)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(unit) = DexUnit::from_dex_name(&entry.file_name().to_string_lossy()) {
                units.push(unit);
            }
        }
        units.sort();
        Ok(units)
    }

    /// Rebuilds a table from the smali directories present under `dir`, for workspaces
    /// that predate `units.json`.
    pub fn infer(dir: &Path) -> io::Result<UnitTable> {
        let mut table = UnitTable::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(unit) = DexUnit::from_smali_dir(&entry.file_name().to_string_lossy()) {
                table.insert(UnitRecord::new(unit, true));
            }
        }
        Ok(table)
    }

    pub fn save(&self, path: &Path) -> io::Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(path, json)
    }

    pub fn load(path: &Path) -> io::Result<UnitTable> {
        let json = fs::read_to_string(path)?;
        let mut table: UnitTable = serde_json::from_str(&json)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
        table.units.sort_by(|a, b| a.unit.cmp(&b.unit));
        Ok(table)
    }
}

/// Orders smali directory names: unit directories by unit number first, then anything else
/// lexicographically.
pub fn smali_dir_order(a: &str, b: &str) -> Ordering {
    match (DexUnit::from_smali_dir(a), DexUnit::from_smali_dir(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_map_both_ways() {
        assert_eq!(DexUnit::from_dex_name("classes.dex"), Some(DexUnit::PRIMARY));
        assert_eq!(DexUnit::from_dex_name("classes12.dex").map(DexUnit::index), Some(12));
        assert_eq!(DexUnit::from_dex_name("classes1.dex"), None);
        assert_eq!(DexUnit::from_dex_name("classes02.dex"), None);
        assert_eq!(DexUnit::from_dex_name("classesX.dex"), None);
        assert_eq!(DexUnit::from_dex_name("other.dex"), None);

        assert_eq!(DexUnit::from_smali_dir("smali"), Some(DexUnit::PRIMARY));
        assert_eq!(DexUnit::from_smali_dir("smali_classes10").map(DexUnit::index), Some(10));
        assert_eq!(DexUnit::from_smali_dir("smali_classes"), None);
        assert_eq!(DexUnit::from_smali_dir("smali_assets"), None);

        let unit = DexUnit::new(3).unwrap();
        assert_eq!(unit.dex_name(), "classes3.dex");
        assert_eq!(unit.smali_dir_name(), "smali_classes3");
        assert_eq!(DexUnit::new(0), None);
    }

    #[test]
    fn directory_order_is_numeric() {
        let mut dirs = vec!["smali_classes10", "smali_extra", "smali_classes2", "smali", "smali_a"];
        dirs.sort_by(|a, b| smali_dir_order(a, b));
        assert_eq!(
            dirs,
            vec!["smali", "smali_classes2", "smali_classes10", "smali_a", "smali_extra"]
        );
    }

    #[test]
    fn table_survives_json() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = UnitTable::new();
        table.insert(UnitRecord::new(DexUnit::new(11).unwrap(), true));
        table.insert(UnitRecord::new(DexUnit::PRIMARY, true));
        table.insert(UnitRecord::new(DexUnit::new(2).unwrap(), false));

        let path = dir.path().join(UNITS_FILE);
        table.save(&path).unwrap();
        let loaded = UnitTable::load(&path).unwrap();
        assert_eq!(loaded, table);
        let order: Vec<u32> = loaded.iter().map(|r| r.unit.index()).collect();
        assert_eq!(order, vec![1, 2, 11]);
        assert_eq!(loaded.disassembled().count(), 2);
        assert_eq!(loaded.by_smali_dir("smali_classes11").unwrap().dex_name, "classes11.dex");
    }

    #[test]
    fn infer_and_scan_read_the_tree() {
        let dir = tempfile::tempdir().unwrap();
        for sub in ["smali", "smali_classes3", "smali_other", "res"] {
            fs::create_dir_all(dir.path().join(sub)).unwrap();
        }
        for dex in ["classes.dex", "classes3.dex", "classes10.dex", "notes.dex"] {
            fs::write(dir.path().join(dex), b"dex").unwrap();
        }
        let inferred = UnitTable::infer(dir.path()).unwrap();
        let dirs: Vec<&str> = inferred.iter().map(|r| r.smali_dir.as_str()).collect();
        assert_eq!(dirs, vec!["smali", "smali_classes3"]);

        let scanned = UnitTable::scan_dex_units(dir.path()).unwrap();
        let indices: Vec<u32> = scanned.into_iter().map(DexUnit::index).collect();
        assert_eq!(indices, vec![1, 3, 10]);
    }
}
