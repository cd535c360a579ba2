use crc32fast::Hasher as Crc32;
use flate2::write::DeflateEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Write};
use std::path::{Component, Path};
use zip::read::ZipArchive;

pub(crate) const LOCAL_HEADER_SIGNATURE: u32 = 0x0403_4b50;
pub(crate) const CENTRAL_HEADER_SIGNATURE: u32 = 0x0201_4b50;
pub(crate) const END_OF_CENTRAL_DIRECTORY_SIGNATURE: u32 = 0x0605_4b50;
pub(crate) const LOCAL_HEADER_LEN: usize = 30;
pub(crate) const CENTRAL_HEADER_LEN: usize = 46;
pub(crate) const END_OF_CENTRAL_DIRECTORY_LEN: usize = 22;

/// Folder holding the v1 signature; never carried into a rebuilt archive.
pub const SIGNATURE_DIR: &str = "META-INF";

/// Result alias for APK (ZIP) operations.
pub type ApkZipResult<T> = Result<T, ApkZipError>;

/// Errors surfaced by the APK packing/unpacking helpers.
#[derive(Debug)]
pub enum ApkZipError {
    Io(io::Error),
    Zip(zip::result::ZipError),
    InvalidInput(String),
}

impl std::fmt::Display for ApkZipError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ApkZipError::Io(err) => write!(f, "I/O error: {err}"),
            ApkZipError::Zip(err) => write!(f, "ZIP error: {err}"),
            ApkZipError::InvalidInput(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for ApkZipError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ApkZipError::Io(err) => Some(err),
            ApkZipError::Zip(err) => Some(err),
            ApkZipError::InvalidInput(_) => None,
        }
    }
}

impl From<io::Error> for ApkZipError {
    fn from(value: io::Error) -> Self {
        ApkZipError::Io(value)
    }
}

impl From<zip::result::ZipError> for ApkZipError {
    fn from(value: zip::result::ZipError) -> Self {
        ApkZipError::Zip(value)
    }
}

/// Compression method of an APK entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ApkCompression {
    Stored,
    Deflated,
}

impl ApkCompression {
    fn method(self) -> u16 {
        match self {
            ApkCompression::Stored => 0,
            ApkCompression::Deflated => 8,
        }
    }
}

/// Entries the installer maps straight from the archive are stored; everything else deflates.
pub fn compression_for(name: &str) -> ApkCompression {
    let top_level = name.split_once('/').map(|(top, _)| top);
    let file_name = name.rsplit('/').next().unwrap_or(name);
    let stored = matches!(top_level, Some("assets" | "lib" | "res"))
        || file_name == "resources.arsc"
        || is_dex_name(file_name);
    if stored {
        ApkCompression::Stored
    } else {
        ApkCompression::Deflated
    }
}

/// `classes.dex`, `classes2.dex`, ...
pub fn is_dex_name(file_name: &str) -> bool {
    file_name.starts_with("classes") && file_name.ends_with(".dex")
}

/// Outcome of [`extract`]: which entries landed on disk and which were skipped.
#[derive(Debug, Default)]
pub struct ExtractReport {
    pub extracted: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ExtractReport {
    pub fn failed_entry(&self, name: &str) -> Option<&str> {
        self.failed
            .iter()
            .find(|(failed, _)| failed == name)
            .map(|(_, reason)| reason.as_str())
    }
}

/// Unpacks every file entry of `archive` below `dest`.
///
/// Only failing to open the archive is an error. Unsafe names and unreadable entries are
/// recorded in the report and skipped.
pub fn extract(archive: impl AsRef<Path>, dest: impl AsRef<Path>) -> ApkZipResult<ExtractReport> {
    let dest = dest.as_ref();
    let file = File::open(archive.as_ref())?;
    let mut archive = ZipArchive::new(file)?;
    fs::create_dir_all(dest)?;

    let mut report = ExtractReport::default();
    for idx in 0..archive.len() {
        let mut entry = match archive.by_index(idx) {
            Ok(entry) => entry,
            Err(err) => {
                log::warn!("cannot open archive entry #{idx}: {err}");
                report.failed.push((format!("#{idx}"), err.to_string()));
                continue;
            }
        };
        let name = entry.name().to_string();
        let relative = match entry.enclosed_name() {
            Some(path) => path.to_path_buf(),
            None => {
                log::warn!("skipping unsafe entry name {name}");
                report.failed.push((name, "unsafe entry name".to_string()));
                continue;
            }
        };
        let target = dest.join(&relative);
        if entry.is_dir() {
            if let Err(err) = fs::create_dir_all(&target) {
                log::warn!("failed to create {name}: {err}");
                report.failed.push((name, err.to_string()));
            }
            continue;
        }

        let mode = entry.unix_mode();
        let written = write_extracted(&mut entry, &target, mode);
        match written {
            Ok(()) => report.extracted.push(name),
            Err(err) => {
                log::warn!("failed to extract {name}: {err}");
                report.failed.push((name, err.to_string()));
            }
        }
    }
    Ok(report)
}

fn write_extracted(entry: &mut impl Read, target: &Path, mode: Option<u32>) -> io::Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    fs::write(target, &data)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(target, fs::Permissions::from_mode(mode & 0o777 | 0o600))?;
    }
    #[cfg(not(unix))]
    let _ = mode;
    Ok(())
}

/// Name and compression of every entry, in central directory order.
pub fn list_entries(archive: impl AsRef<Path>) -> ApkZipResult<Vec<(String, ApkCompression)>> {
    let mut archive = ZipArchive::new(File::open(archive.as_ref())?)?;
    let mut entries = Vec::with_capacity(archive.len());
    for idx in 0..archive.len() {
        let entry = archive.by_index_raw(idx)?;
        let compression = match entry.compression() {
            zip::CompressionMethod::Stored => ApkCompression::Stored,
            zip::CompressionMethod::Deflated => ApkCompression::Deflated,
            other => {
                return Err(ApkZipError::InvalidInput(format!(
                    "{} uses unsupported compression {other:?}",
                    entry.name()
                )))
            }
        };
        entries.push((entry.name().to_string(), compression));
    }
    Ok(entries)
}

/// Reads a single entry (e.g. `AndroidManifest.xml`) without unpacking the archive.
pub fn read_entry(archive: impl AsRef<Path>, name: &str) -> ApkZipResult<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(archive.as_ref())?)?;
    let mut entry = archive.by_name(name)?;
    let mut data = Vec::new();
    entry.read_to_end(&mut data)?;
    Ok(data)
}

/// Outcome of [`assemble`].
#[derive(Debug, Default)]
pub struct AssembleReport {
    pub stored: usize,
    pub deflated: usize,
}

impl AssembleReport {
    pub fn entry_count(&self) -> usize {
        self.stored + self.deflated
    }
}

/// Packs `source` into a fresh archive at `output`.
///
/// Top-level directories whose name starts with one of `exclude_prefixes` are left out, and
/// so is `META-INF/`. Entries are written in sorted order, compressed per
/// [`compression_for`], without directory records.
pub fn assemble(
    source: impl AsRef<Path>,
    exclude_prefixes: &[&str],
    output: impl AsRef<Path>,
) -> ApkZipResult<AssembleReport> {
    let source = source.as_ref();
    let output = output.as_ref();
    if !source.is_dir() {
        return Err(ApkZipError::InvalidInput(format!(
            "{} is not a directory",
            source.display()
        )));
    }

    let mut names = Vec::new();
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let top = entry.file_name().to_string_lossy().into_owned();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            if top == SIGNATURE_DIR || exclude_prefixes.iter().any(|p| top.starts_with(p)) {
                log::debug!("leaving {top}/ out of the archive");
                continue;
            }
            gather_file_names(source, &entry.path(), &mut names)?;
        } else if file_type.is_file() {
            names.push(top);
        }
    }
    names.sort();
    if names.len() > u16::MAX as usize {
        return Err(ApkZipError::InvalidInput(format!(
            "{} entries exceed the non-ZIP64 limit",
            names.len()
        )));
    }

    if let Some(parent) = output.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut writer = EntryWriter::new(BufWriter::new(File::create(output)?));
    let mut report = AssembleReport::default();
    for name in &names {
        let data = fs::read(source.join(name))?;
        let compression = compression_for(name);
        writer.write_entry(name, &data, compression)?;
        match compression {
            ApkCompression::Stored => report.stored += 1,
            ApkCompression::Deflated => report.deflated += 1,
        }
    }
    writer.finish()?;
    Ok(report)
}

/// General-purpose flag bit 11: the entry name is UTF-8.
const UTF8_NAME_FLAG: u16 = 0x0800;

fn name_flags(name: &str) -> u16 {
    if name.is_ascii() {
        0
    } else {
        UTF8_NAME_FLAG
    }
}

struct CentralDirectoryRecord {
    file_name: Vec<u8>,
    flags: u16,
    compression: ApkCompression,
    crc32: u32,
    compressed_size: u32,
    uncompressed_size: u32,
    local_header_offset: u32,
}

struct EntryWriter<W: Write> {
    inner: W,
    offset: u64,
    records: Vec<CentralDirectoryRecord>,
}

impl<W: Write> EntryWriter<W> {
    fn new(inner: W) -> Self {
        EntryWriter {
            inner,
            offset: 0,
            records: Vec::new(),
        }
    }

    fn emit(&mut self, bytes: &[u8]) -> ApkZipResult<()> {
        self.inner.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    fn checked_offset(&self) -> ApkZipResult<u32> {
        u32::try_from(self.offset)
            .map_err(|_| ApkZipError::InvalidInput("archive exceeds 4 GiB".to_string()))
    }

    fn write_entry(&mut self, name: &str, data: &[u8], compression: ApkCompression) -> ApkZipResult<()> {
        let offset = self.checked_offset()?;
        let uncompressed_size = u32::try_from(data.len())
            .map_err(|_| ApkZipError::InvalidInput(format!("{name} exceeds 4 GiB")))?;
        let deflated;
        let payload = match compression {
            ApkCompression::Stored => data,
            ApkCompression::Deflated => {
                deflated = deflate_bytes(data)?;
                &deflated[..]
            }
        };

        let mut crc = Crc32::new();
        crc.update(data);
        let crc32 = crc.finalize();

        let mut header = Vec::with_capacity(LOCAL_HEADER_LEN + name.len());
        write_u32(&mut header, LOCAL_HEADER_SIGNATURE);
        let flags = name_flags(name);
        write_u16(&mut header, 20);
        write_u16(&mut header, flags);
        write_u16(&mut header, compression.method());
        write_u16(&mut header, 0);
        write_u16(&mut header, 0x21);
        write_u32(&mut header, crc32);
        write_u32(&mut header, payload.len() as u32);
        write_u32(&mut header, uncompressed_size);
        write_u16(&mut header, name.len() as u16);
        write_u16(&mut header, 0);
        header.extend_from_slice(name.as_bytes());
        self.emit(&header)?;
        self.emit(payload)?;

        self.records.push(CentralDirectoryRecord {
            file_name: name.as_bytes().to_vec(),
            flags,
            compression,
            crc32,
            compressed_size: payload.len() as u32,
            uncompressed_size,
            local_header_offset: offset,
        });
        Ok(())
    }

    fn finish(mut self) -> ApkZipResult<()> {
        let central_start = self.checked_offset()?;
        let records = std::mem::take(&mut self.records);
        let mut central = Vec::new();
        for record in &records {
            write_central_directory_entry(&mut central, record);
        }
        self.emit(&central)?;
        self.checked_offset()?;

        let mut end = Vec::with_capacity(END_OF_CENTRAL_DIRECTORY_LEN);
        write_end_of_central_directory(&mut end, records.len(), central.len() as u32, central_start);
        self.emit(&end)?;
        self.inner.flush()?;
        Ok(())
    }
}

fn write_central_directory_entry(buf: &mut Vec<u8>, record: &CentralDirectoryRecord) {
    write_u32(buf, CENTRAL_HEADER_SIGNATURE);
    write_u16(buf, 0x031E);
    write_u16(buf, 20);
    write_u16(buf, record.flags);
    write_u16(buf, record.compression.method());
    write_u16(buf, 0);
    write_u16(buf, 0x21);
    write_u32(buf, record.crc32);
    write_u32(buf, record.compressed_size);
    write_u32(buf, record.uncompressed_size);
    write_u16(buf, record.file_name.len() as u16);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u32(buf, 0o100644 << 16);
    write_u32(buf, record.local_header_offset);
    buf.extend_from_slice(&record.file_name);
}

fn write_end_of_central_directory(
    buf: &mut Vec<u8>,
    entry_count: usize,
    central_size: u32,
    central_offset: u32,
) {
    write_u32(buf, END_OF_CENTRAL_DIRECTORY_SIGNATURE);
    write_u16(buf, 0);
    write_u16(buf, 0);
    write_u16(buf, entry_count as u16);
    write_u16(buf, entry_count as u16);
    write_u32(buf, central_size);
    write_u32(buf, central_offset);
    write_u16(buf, 0);
}

fn deflate_bytes(data: &[u8]) -> ApkZipResult<Vec<u8>> {
    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn gather_file_names(root: &Path, current: &Path, names: &mut Vec<String>) -> ApkZipResult<()> {
    for entry in fs::read_dir(current)? {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            gather_file_names(root, &path, names)?;
        } else if file_type.is_file() {
            names.push(relative_entry_path(root, &path)?);
        }
    }
    Ok(())
}

fn relative_entry_path(root: &Path, file: &Path) -> ApkZipResult<String> {
    let rel = file.strip_prefix(root).map_err(|_| {
        ApkZipError::InvalidInput(format!(
            "{} is not under {}",
            file.display(),
            root.display()
        ))
    })?;
    let mut components = Vec::new();
    for comp in rel.components() {
        match comp {
            Component::Normal(part) => components.push(part.to_string_lossy().replace('\\', "/")),
            Component::CurDir => {}
            _ => {
                return Err(ApkZipError::InvalidInput(format!(
                    "invalid entry path component in {}",
                    rel.display()
                )))
            }
        }
    }
    if components.is_empty() {
        return Err(ApkZipError::InvalidInput(
            "entry name must not be empty".to_string(),
        ));
    }
    Ok(components.join("/"))
}

pub(crate) fn write_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::io::Cursor;
    use zip::write::FileOptions;

    fn sample_archive(path: &Path) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        let deflate = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);
        for (name, body) in [
            ("AndroidManifest.xml", &b"manifest"[..]),
            ("classes.dex", b"dex one"),
            ("classes2.dex", b"dex two"),
            ("resources.arsc", b"table"),
            ("res/layout/main.xml", b"layout"),
            ("assets/data.bin", b"asset"),
            ("assets/café.txt", b"accented"),
            ("lib/arm64-v8a/libfoo.so", b"\x7fELF"),
            ("kotlin/kotlin.kotlin_builtins", b"builtins"),
            ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0"),
            ("META-INF/CERT.RSA", b"sig"),
        ] {
            writer.start_file(name, deflate).unwrap();
            writer.write_all(body).unwrap();
        }
        writer.add_directory("res/raw/", FileOptions::default()).unwrap();
        writer.finish().unwrap();
    }

    #[test]
    fn compression_policy() {
        for stored in [
            "assets/a/b.bin",
            "lib/x86/libz.so",
            "res/drawable/icon.png",
            "resources.arsc",
            "classes.dex",
            "classes12.dex",
            "nested/classes3.dex",
        ] {
            assert_eq!(compression_for(stored), ApkCompression::Stored, "{stored}");
        }
        for deflated in [
            "AndroidManifest.xml",
            "kotlin/kotlin.kotlin_builtins",
            "assets.txt",
            "library/readme.txt",
            "foo.dex",
        ] {
            assert_eq!(compression_for(deflated), ApkCompression::Deflated, "{deflated}");
        }
    }

    #[test]
    fn extract_then_assemble_keeps_names_without_meta_inf() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.apk");
        sample_archive(&input);

        let tree = dir.path().join("tree");
        let report = extract(&input, &tree).unwrap();
        assert!(report.failed.is_empty());
        assert!(tree.join("res/raw").is_dir());
        assert_eq!(fs::read(tree.join("classes2.dex")).unwrap(), b"dex two");

        let output = dir.path().join("out.apk");
        let assembled = assemble(&tree, &[], &output).unwrap();
        assert_eq!(assembled.entry_count(), 9);

        let before: BTreeSet<String> = list_entries(&input)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !name.starts_with("META-INF/") && !name.ends_with('/'))
            .collect();
        let after = list_entries(&output).unwrap();
        let after_names: BTreeSet<String> = after.iter().map(|(name, _)| name.clone()).collect();
        assert_eq!(before, after_names);

        for (name, compression) in after {
            assert_eq!(compression, compression_for(&name), "{name}");
        }
        assert_eq!(read_entry(&output, "lib/arm64-v8a/libfoo.so").unwrap(), b"\x7fELF");

        let again = dir.path().join("again");
        let report = extract(&output, &again).unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(fs::read(again.join("assets/café.txt")).unwrap(), b"accented");
    }

    #[test]
    fn unusable_directory_entry_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.apk");
        let mut writer = zip::ZipWriter::new(File::create(&input).unwrap());
        writer.start_file("blocker", FileOptions::default()).unwrap();
        writer.write_all(b"plain file").unwrap();
        writer.add_directory("blocker/sub/", FileOptions::default()).unwrap();
        writer.start_file("classes.dex", FileOptions::default()).unwrap();
        writer.write_all(b"dex").unwrap();
        writer.finish().unwrap();

        let tree = dir.path().join("tree");
        let report = extract(&input, &tree).unwrap();
        assert_eq!(report.failed.len(), 1);
        assert!(report.failed_entry("blocker/sub/").is_some());
        assert_eq!(fs::read(tree.join("classes.dex")).unwrap(), b"dex");
    }

    #[test]
    fn assemble_honours_excluded_prefixes() {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree");
        fs::create_dir_all(tree.join("smali/com/example")).unwrap();
        fs::create_dir_all(tree.join("smali_classes2")).unwrap();
        fs::create_dir_all(tree.join("res")).unwrap();
        fs::write(tree.join("smali/com/example/Main.smali"), ".class").unwrap();
        fs::write(tree.join("smali_classes2/A.smali"), ".class").unwrap();
        fs::write(tree.join("res/a.xml"), "<a/>").unwrap();
        fs::write(tree.join("classes.dex"), "dex").unwrap();

        let output = dir.path().join("out.apk");
        assemble(&tree, &["smali"], &output).unwrap();
        let names: Vec<String> = list_entries(&output)
            .unwrap()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["classes.dex".to_string(), "res/a.xml".to_string()]);

        let bytes = fs::read(&output).unwrap();
        let mut archive = ZipArchive::new(Cursor::new(bytes)).unwrap();
        let mut body = String::new();
        archive.by_name("res/a.xml").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "<a/>");
    }

    #[test]
    fn extract_fails_only_on_unreadable_archive() {
        let dir = tempfile::tempdir().unwrap();
        let bogus = dir.path().join("bogus.apk");
        fs::write(&bogus, b"definitely not a zip").unwrap();
        assert!(extract(&bogus, dir.path().join("out")).is_err());
        assert!(extract(dir.path().join("missing.apk"), dir.path().join("out")).is_err());
    }
}
