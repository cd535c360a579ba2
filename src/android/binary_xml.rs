//! Android binary XML (`AndroidManifest.xml` inside an APK).
//!
//! [`AndroidManifest::from_bytes`] decodes the chunked resource format into a small DOM of
//! [`ManifestElement`] nodes, [`AndroidManifest::to_bytes`] writes it back out, and the
//! `*_xml_str` helpers bridge to plain text XML via quick-xml.
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use std::collections::BTreeMap;
use std::fmt;

const RES_STRING_POOL_TYPE: u16 = 0x0001;
const RES_XML_TYPE: u16 = 0x0003;
const RES_XML_START_NAMESPACE_TYPE: u16 = 0x0100;
const RES_XML_END_NAMESPACE_TYPE: u16 = 0x0101;
const RES_XML_START_ELEMENT_TYPE: u16 = 0x0102;
const RES_XML_END_ELEMENT_TYPE: u16 = 0x0103;
const RES_XML_CDATA_TYPE: u16 = 0x0104;
const RES_XML_RESOURCE_MAP_TYPE: u16 = 0x0180;

const NO_INDEX: u32 = 0xFFFF_FFFF;
const STRING_POOL_UTF8_FLAG: u32 = 0x0000_0100;

const TYPE_NULL: u8 = 0x00;
const TYPE_REFERENCE: u8 = 0x01;
const TYPE_STRING: u8 = 0x03;
const TYPE_FLOAT: u8 = 0x04;
const TYPE_INT_DEC: u8 = 0x10;
const TYPE_INT_HEX: u8 = 0x11;
const TYPE_INT_BOOLEAN: u8 = 0x12;

pub const ANDROID_NAMESPACE_URI: &str = "http://schemas.android.com/apk/res/android";

/// Result alias for binary XML operations.
pub type BinaryXmlResult<T> = Result<T, BinaryXmlError>;

/// Errors surfaced by the binary XML codec.
#[derive(Debug)]
pub enum BinaryXmlError {
    /// The document is missing the expected structure.
    MalformedDocument(String),
    /// Text XML parsing/generation failure.
    Xml(String),
}

impl fmt::Display for BinaryXmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BinaryXmlError::MalformedDocument(msg) => write!(f, "Malformed manifest: {msg}"),
            BinaryXmlError::Xml(msg) => write!(f, "XML error: {msg}"),
        }
    }
}

impl std::error::Error for BinaryXmlError {}

impl From<quick_xml::Error> for BinaryXmlError {
    fn from(value: quick_xml::Error) -> Self {
        BinaryXmlError::Xml(value.to_string())
    }
}

impl From<quick_xml::events::attributes::AttrError> for BinaryXmlError {
    fn from(value: quick_xml::events::attributes::AttrError) -> Self {
        BinaryXmlError::Xml(value.to_string())
    }
}

fn xml_err(err: impl fmt::Display) -> BinaryXmlError {
    BinaryXmlError::Xml(err.to_string())
}

fn malformed<T>(msg: impl Into<String>) -> BinaryXmlResult<T> {
    Err(BinaryXmlError::MalformedDocument(msg.into()))
}

/// Typed attribute values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ManifestValue {
    String(String),
    Boolean(bool),
    Integer(i64),
    Hex(u32),
    Reference(u32),
}

impl ManifestValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ManifestValue::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ManifestValue::Boolean(flag) => Some(*flag),
            ManifestValue::String(text) => match text.as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            ManifestValue::Integer(num) => Some(*num),
            ManifestValue::Hex(num) => Some(i64::from(*num)),
            ManifestValue::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    /// Text form, as it would appear in a decoded manifest.
    pub fn to_text(&self) -> String {
        match self {
            ManifestValue::String(text) => text.clone(),
            ManifestValue::Boolean(flag) => flag.to_string(),
            ManifestValue::Integer(num) => num.to_string(),
            ManifestValue::Hex(value) => format!("0x{value:x}"),
            ManifestValue::Reference(id) => format!("@0x{id:08x}"),
        }
    }

    /// Inverse of [`ManifestValue::to_text`]; anything unrecognised stays a string.
    pub fn from_text(text: &str) -> ManifestValue {
        let trimmed = text.trim();
        if trimmed == "true" {
            return ManifestValue::Boolean(true);
        }
        if trimmed == "false" {
            return ManifestValue::Boolean(false);
        }
        if let Some(hex) = trimmed.strip_prefix("@0x") {
            if let Ok(id) = u32::from_str_radix(hex, 16) {
                return ManifestValue::Reference(id);
            }
        }
        if let Some(hex) = trimmed.strip_prefix("0x") {
            if let Ok(value) = u32::from_str_radix(hex, 16) {
                return ManifestValue::Hex(value);
            }
        }
        if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit() || b == b'-') {
            if let Ok(num) = trimmed.parse::<i64>() {
                return ManifestValue::Integer(num);
            }
        }
        ManifestValue::String(text.to_string())
    }
}

impl From<&str> for ManifestValue {
    fn from(value: &str) -> Self {
        ManifestValue::String(value.to_owned())
    }
}

impl From<String> for ManifestValue {
    fn from(value: String) -> Self {
        ManifestValue::String(value)
    }
}

impl From<bool> for ManifestValue {
    fn from(value: bool) -> Self {
        ManifestValue::Boolean(value)
    }
}

/// A single attribute attached to a manifest element.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestAttribute {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub resource_id: Option<u32>,
    pub name: String,
    pub value: ManifestValue,
}

impl ManifestAttribute {
    pub fn new(name: impl Into<String>, value: impl Into<ManifestValue>) -> Self {
        ManifestAttribute {
            namespace_prefix: None,
            namespace_uri: None,
            resource_id: None,
            name: name.into(),
            value: value.into(),
        }
    }

    /// An `android:`-namespaced attribute.
    pub fn android(name: impl Into<String>, value: impl Into<ManifestValue>) -> Self {
        ManifestAttribute {
            namespace_prefix: Some("android".to_string()),
            namespace_uri: Some(ANDROID_NAMESPACE_URI.to_string()),
            ..ManifestAttribute::new(name, value)
        }
    }

    fn qualified_name(&self) -> String {
        match &self.namespace_prefix {
            Some(prefix) => format!("{prefix}:{}", self.name),
            None => self.name.clone(),
        }
    }
}

/// DOM-style element node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ManifestElement {
    pub namespace_prefix: Option<String>,
    pub namespace_uri: Option<String>,
    pub tag: String,
    pub attributes: Vec<ManifestAttribute>,
    pub children: Vec<ManifestElement>,
    pub text: Option<String>,
}

impl ManifestElement {
    pub fn new(tag: impl Into<String>) -> Self {
        ManifestElement {
            namespace_prefix: None,
            namespace_uri: None,
            tag: tag.into(),
            attributes: Vec::new(),
            children: Vec::new(),
            text: None,
        }
    }

    pub fn with_attribute(mut self, attribute: ManifestAttribute) -> Self {
        self.attributes.push(attribute);
        self
    }

    pub fn with_child(mut self, child: ManifestElement) -> Self {
        self.children.push(child);
        self
    }

    /// Looks an attribute up by exact name: `package` matches only an un-namespaced attribute,
    /// `android:name` only one carrying the `android` prefix.
    pub fn attribute_value(&self, name: &str) -> Option<&ManifestValue> {
        let (prefix, local) = match name.split_once(':') {
            Some((prefix, local)) => (Some(prefix), local),
            None => (None, name),
        };
        self.attributes
            .iter()
            .find(|attr| attr.name == local && attr.namespace_prefix.as_deref() == prefix)
            .map(|attr| &attr.value)
    }

    /// Looks an attribute up by local name the way a non-namespace-aware pull parser would:
    /// un-namespaced first, then the android namespace, then any other prefix.
    pub fn lookup_attribute(&self, local: &str) -> Option<&ManifestValue> {
        let by_local = |pred: &dyn Fn(&ManifestAttribute) -> bool| {
            self.attributes
                .iter()
                .find(|attr| attr.name == local && pred(attr))
                .map(|attr| &attr.value)
        };
        by_local(&|attr| attr.namespace_uri.is_none() && attr.namespace_prefix.is_none())
            .or_else(|| by_local(&|attr| attr.namespace_uri.as_deref() == Some(ANDROID_NAMESPACE_URI)))
            .or_else(|| by_local(&|_| true))
    }

    /// Shorthand for a string-valued [`ManifestElement::lookup_attribute`].
    pub fn lookup_str(&self, local: &str) -> Option<&str> {
        self.lookup_attribute(local).and_then(ManifestValue::as_str)
    }

    pub fn find_child(&self, tag: &str) -> Option<&ManifestElement> {
        self.children.iter().find(|child| child.tag == tag)
    }

    pub fn children_named<'a>(&'a self, tag: &'a str) -> impl Iterator<Item = &'a ManifestElement> {
        self.children.iter().filter(move |child| child.tag == tag)
    }
}

/// A decoded `AndroidManifest.xml`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AndroidManifest {
    root: ManifestElement,
}

/// Encoding used for the string pool written by [`AndroidManifest::to_bytes_with`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum StringEncoding {
    Utf8,
    #[default]
    Utf16,
}

impl AndroidManifest {
    pub fn from_root(root: ManifestElement) -> Self {
        AndroidManifest { root }
    }

    pub fn root(&self) -> &ManifestElement {
        &self.root
    }

    pub fn package_name(&self) -> Option<&str> {
        self.root.lookup_str("package")
    }

    pub fn version_name(&self) -> Option<&str> {
        self.root.lookup_str("versionName")
    }

    pub fn version_code(&self) -> Option<i64> {
        self.root
            .lookup_attribute("versionCode")
            .and_then(ManifestValue::as_integer)
    }

    pub fn application(&self) -> Option<&ManifestElement> {
        self.root.find_child("application")
    }

    /// `android:debuggable` on `<application>`, if declared.
    pub fn is_debuggable(&self) -> Option<bool> {
        self.application()
            .and_then(|app| app.lookup_attribute("debuggable"))
            .and_then(ManifestValue::as_bool)
    }

    /// Decodes a binary XML document.
    pub fn from_bytes(bytes: &[u8]) -> BinaryXmlResult<Self> {
        let mut cursor = ByteCursor::new(bytes);
        let document = read_chunk_header(&mut cursor)?;
        if document.chunk_type != RES_XML_TYPE {
            return malformed("document does not start with a RES_XML_TYPE chunk");
        }
        cursor.seek(document.body_start())?;

        let mut pool: Option<StringPool> = None;
        let mut resource_ids: Vec<u32> = Vec::new();
        let mut namespaces: Vec<(Option<String>, Option<String>)> = Vec::new();
        let mut open: Vec<ManifestElement> = Vec::new();
        let mut root: Option<ManifestElement> = None;

        while cursor.position() < document.end() {
            let chunk = read_chunk_header(&mut cursor)?;
            cursor.seek(chunk.body_start())?;
            match chunk.chunk_type {
                RES_STRING_POOL_TYPE => {
                    pool = Some(StringPool::parse(bytes, &chunk)?);
                }
                RES_XML_RESOURCE_MAP_TYPE => {
                    resource_ids.clear();
                    while cursor.position() + 4 <= chunk.end() {
                        resource_ids.push(cursor.u32()?);
                    }
                }
                RES_XML_START_NAMESPACE_TYPE => {
                    let pool = require_pool(&pool)?;
                    let prefix = pool.get(cursor.u32()?).map(str::to_string);
                    let uri = pool.get(cursor.u32()?).map(str::to_string);
                    namespaces.push((prefix, uri));
                }
                RES_XML_END_NAMESPACE_TYPE => {
                    namespaces.pop();
                }
                RES_XML_START_ELEMENT_TYPE => {
                    let pool = require_pool(&pool)?;
                    let element = read_start_element(
                        &mut cursor,
                        &chunk,
                        pool,
                        &resource_ids,
                        &namespaces,
                    )?;
                    open.push(element);
                }
                RES_XML_END_ELEMENT_TYPE => {
                    let element = match open.pop() {
                        Some(element) => element,
                        None => return malformed("end element without matching start"),
                    };
                    match open.last_mut() {
                        Some(parent) => parent.children.push(element),
                        None if root.is_none() => root = Some(element),
                        None => return malformed("multiple root elements"),
                    }
                }
                RES_XML_CDATA_TYPE => {
                    let pool = require_pool(&pool)?;
                    if let Some(text) = pool.get(cursor.u32()?) {
                        if let Some(current) = open.last_mut() {
                            current.text = Some(text.to_string());
                        }
                    }
                }
                other => {
                    log::debug!("skipping unknown binary XML chunk 0x{other:04x}");
                }
            }
            cursor.seek(chunk.end())?;
        }

        if !open.is_empty() {
            return malformed("unclosed elements at end of document");
        }
        match root {
            Some(root) => Ok(AndroidManifest { root }),
            None => malformed("document has no root element"),
        }
    }

    /// Encodes the document with a UTF-16 string pool, like aapt does.
    pub fn to_bytes(&self) -> BinaryXmlResult<Vec<u8>> {
        self.to_bytes_with(StringEncoding::Utf16)
    }

    pub fn to_bytes_with(&self, encoding: StringEncoding) -> BinaryXmlResult<Vec<u8>> {
        let mut pool = PoolBuilder::default();

        // Attribute names that carry resource ids must occupy the first pool slots so the
        // resource map lines up with them.
        let mut resource_names: Vec<(String, u32)> = Vec::new();
        collect_resource_names(&self.root, &mut resource_names);
        for (name, _) in &resource_names {
            pool.intern(name);
        }

        let mut namespace_decls: BTreeMap<String, String> = BTreeMap::new();
        collect_namespaces(&self.root, &mut namespace_decls);
        for (prefix, uri) in &namespace_decls {
            pool.intern(prefix);
            pool.intern(uri);
        }
        intern_element(&self.root, &mut pool);

        let mut body = Vec::new();
        for (prefix, uri) in &namespace_decls {
            write_namespace(&mut body, RES_XML_START_NAMESPACE_TYPE, &pool, prefix, uri)?;
        }
        write_element(&mut body, &self.root, &pool)?;
        for (prefix, uri) in namespace_decls.iter().rev() {
            write_namespace(&mut body, RES_XML_END_NAMESPACE_TYPE, &pool, prefix, uri)?;
        }

        let mut document = Vec::new();
        let start = begin_chunk(&mut document, RES_XML_TYPE, 8);
        document.extend_from_slice(&pool.to_chunk(encoding));
        if !resource_names.is_empty() {
            let map_start = begin_chunk(&mut document, RES_XML_RESOURCE_MAP_TYPE, 8);
            for (_, id) in &resource_names {
                put_u32(&mut document, *id);
            }
            end_chunk(&mut document, map_start);
        }
        document.extend_from_slice(&body);
        end_chunk(&mut document, start);
        Ok(document)
    }

    /// Parses a plain text manifest.
    pub fn from_xml_str(xml: &str) -> BinaryXmlResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut buffer = Vec::new();
        let mut scopes: Vec<BTreeMap<String, String>> = Vec::new();
        let mut open: Vec<ManifestElement> = Vec::new();
        let mut root: Option<ManifestElement> = None;

        loop {
            let event = reader.read_event_into(&mut buffer)?;
            match event {
                Event::Start(start) => {
                    let element = element_from_text(&start, &mut scopes)?;
                    open.push(element);
                }
                Event::Empty(start) => {
                    let element = element_from_text(&start, &mut scopes)?;
                    scopes.pop();
                    attach(&mut open, &mut root, element)?;
                }
                Event::End(_) => {
                    let element = match open.pop() {
                        Some(element) => element,
                        None => return malformed("unbalanced end tag"),
                    };
                    scopes.pop();
                    attach(&mut open, &mut root, element)?;
                }
                Event::Text(text) => {
                    let content = text.unescape()?;
                    if let Some(current) = open.last_mut() {
                        if !content.trim().is_empty() {
                            current.text = Some(content.trim().to_string());
                        }
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buffer.clear();
        }

        if !open.is_empty() {
            return malformed("unclosed elements in text manifest");
        }
        match root {
            Some(root) => Ok(AndroidManifest { root }),
            None => malformed("text manifest has no root element"),
        }
    }

    /// Renders the document as indented text XML.
    pub fn to_xml_string(&self) -> BinaryXmlResult<String> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
        writer
            .write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))
            .map_err(xml_err)?;
        let mut namespace_decls = BTreeMap::new();
        collect_namespaces(&self.root, &mut namespace_decls);
        write_text_element(&mut writer, &self.root, Some(&namespace_decls))?;
        String::from_utf8(writer.into_inner())
            .map_err(|err| BinaryXmlError::Xml(err.to_string()))
    }
}

struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        ByteCursor { data, pos: 0 }
    }

    fn position(&self) -> usize {
        self.pos
    }

    fn seek(&mut self, offset: usize) -> BinaryXmlResult<()> {
        if offset > self.data.len() {
            return malformed("seek past end of document");
        }
        self.pos = offset;
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> BinaryXmlResult<[u8; N]> {
        let end = self.pos + N;
        if end > self.data.len() {
            return malformed("unexpected end of binary XML");
        }
        let mut out = [0u8; N];
        out.copy_from_slice(&self.data[self.pos..end]);
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> BinaryXmlResult<u8> {
        Ok(self.take::<1>()?[0])
    }

    fn u16(&mut self) -> BinaryXmlResult<u16> {
        Ok(u16::from_le_bytes(self.take()?))
    }

    fn u32(&mut self) -> BinaryXmlResult<u32> {
        Ok(u32::from_le_bytes(self.take()?))
    }
}

struct ChunkHeader {
    chunk_type: u16,
    header_size: u16,
    size: u32,
    start: usize,
}

impl ChunkHeader {
    fn body_start(&self) -> usize {
        self.start + self.header_size as usize
    }

    fn end(&self) -> usize {
        self.start + self.size as usize
    }
}

fn read_chunk_header(cursor: &mut ByteCursor<'_>) -> BinaryXmlResult<ChunkHeader> {
    let start = cursor.position();
    let chunk_type = cursor.u16()?;
    let header_size = cursor.u16()?;
    let size = cursor.u32()?;
    if header_size < 8 || size < u32::from(header_size) {
        return malformed(format!("invalid chunk sizing at offset {start}"));
    }
    if start + size as usize > cursor.data.len() {
        return malformed(format!("chunk at offset {start} extends past end of document"));
    }
    Ok(ChunkHeader {
        chunk_type,
        header_size,
        size,
        start,
    })
}

fn require_pool(pool: &Option<StringPool>) -> BinaryXmlResult<&StringPool> {
    match pool {
        Some(pool) => Ok(pool),
        None => malformed("node chunk encountered before the string pool"),
    }
}

struct StringPool {
    strings: Vec<String>,
}

impl StringPool {
    fn parse(data: &[u8], chunk: &ChunkHeader) -> BinaryXmlResult<Self> {
        let mut cursor = ByteCursor::new(data);
        cursor.seek(chunk.start + 8)?;
        let count = cursor.u32()? as usize;
        let _style_count = cursor.u32()?;
        let flags = cursor.u32()?;
        let strings_start = cursor.u32()? as usize;
        let _styles_start = cursor.u32()?;

        let offsets_end = count
            .checked_mul(4)
            .and_then(|len| len.checked_add(chunk.body_start()));
        if offsets_end.map_or(true, |end| end > chunk.end()) {
            return malformed(format!("string pool claims {count} strings, more than it holds"));
        }
        cursor.seek(chunk.body_start())?;
        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(cursor.u32()? as usize);
        }

        let base = chunk.start + strings_start;
        let limit = chunk.end();
        let utf8 = flags & STRING_POOL_UTF8_FLAG != 0;
        let mut strings = Vec::with_capacity(count);
        for offset in offsets {
            let at = base + offset;
            let text = if utf8 {
                decode_utf8_entry(data, at, limit)?
            } else {
                decode_utf16_entry(data, at, limit)?
            };
            strings.push(text);
        }
        Ok(StringPool { strings })
    }

    fn get(&self, idx: u32) -> Option<&str> {
        if idx == NO_INDEX {
            return None;
        }
        self.strings.get(idx as usize).map(String::as_str)
    }
}

fn decode_utf8_entry(data: &[u8], at: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = ByteCursor::new(&data[..limit]);
    cursor.seek(at)?;
    let _chars = utf8_length(&mut cursor)?;
    let byte_len = utf8_length(&mut cursor)?;
    let start = cursor.position();
    if start + byte_len > limit {
        return malformed("UTF-8 string exceeds its pool");
    }
    std::str::from_utf8(&data[start..start + byte_len])
        .map(str::to_string)
        .map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))
}

fn utf8_length(cursor: &mut ByteCursor<'_>) -> BinaryXmlResult<usize> {
    let first = cursor.u8()? as usize;
    if first & 0x80 == 0 {
        return Ok(first);
    }
    let second = cursor.u8()? as usize;
    Ok(((first & 0x7F) << 8) | second)
}

fn decode_utf16_entry(data: &[u8], at: usize, limit: usize) -> BinaryXmlResult<String> {
    let mut cursor = ByteCursor::new(&data[..limit]);
    cursor.seek(at)?;
    let first = cursor.u16()? as usize;
    let units = if first & 0x8000 == 0 {
        first
    } else {
        ((first & 0x7FFF) << 16) | cursor.u16()? as usize
    };
    if units > (limit - cursor.position()) / 2 {
        return malformed("UTF-16 string exceeds its pool");
    }
    let mut text = Vec::with_capacity(units);
    for _ in 0..units {
        text.push(cursor.u16()?);
    }
    String::from_utf16(&text).map_err(|err| BinaryXmlError::MalformedDocument(err.to_string()))
}

fn read_start_element(
    cursor: &mut ByteCursor<'_>,
    chunk: &ChunkHeader,
    pool: &StringPool,
    resource_ids: &[u32],
    namespaces: &[(Option<String>, Option<String>)],
) -> BinaryXmlResult<ManifestElement> {
    let ext_start = cursor.position();
    let ns_idx = cursor.u32()?;
    let name_idx = cursor.u32()?;
    let attribute_start = cursor.u16()? as usize;
    let attribute_size = cursor.u16()? as usize;
    let attribute_count = cursor.u16()? as usize;

    let tag = match pool.get(name_idx) {
        Some(tag) => tag.to_string(),
        None => return malformed("element name references an invalid string"),
    };
    let mut element = ManifestElement::new(tag);
    element.namespace_uri = pool.get(ns_idx).map(str::to_string);
    element.namespace_prefix = prefix_for(namespaces, element.namespace_uri.as_deref());

    if attribute_size < 20 {
        return malformed("attribute records must be at least 20 bytes");
    }
    for idx in 0..attribute_count {
        let record = ext_start + attribute_start + idx * attribute_size;
        if record + 20 > chunk.end() {
            return malformed("attribute record runs past its element chunk");
        }
        cursor.seek(record)?;
        let attr_ns = cursor.u32()?;
        let attr_name = cursor.u32()?;
        let raw_value = cursor.u32()?;
        let _value_size = cursor.u16()?;
        let _res0 = cursor.u8()?;
        let data_type = cursor.u8()?;
        let data = cursor.u32()?;

        let name = match pool.get(attr_name) {
            Some(name) => name.to_string(),
            None => return malformed("attribute name references an invalid string"),
        };
        let namespace_uri = pool.get(attr_ns).map(str::to_string);
        element.attributes.push(ManifestAttribute {
            namespace_prefix: prefix_for(namespaces, namespace_uri.as_deref()),
            namespace_uri,
            resource_id: resource_ids
                .get(attr_name as usize)
                .copied()
                .filter(|id| *id != 0),
            name,
            value: decode_typed_value(pool, raw_value, data_type, data)?,
        });
    }
    Ok(element)
}

fn prefix_for(namespaces: &[(Option<String>, Option<String>)], uri: Option<&str>) -> Option<String> {
    let uri = uri?;
    namespaces
        .iter()
        .rev()
        .find(|(_, ns_uri)| ns_uri.as_deref() == Some(uri))
        .and_then(|(prefix, _)| prefix.clone())
}

fn decode_typed_value(
    pool: &StringPool,
    raw_idx: u32,
    data_type: u8,
    data: u32,
) -> BinaryXmlResult<ManifestValue> {
    if let Some(raw) = pool.get(raw_idx) {
        return Ok(ManifestValue::String(raw.to_string()));
    }
    Ok(match data_type {
        TYPE_NULL => ManifestValue::String(String::new()),
        TYPE_STRING => match pool.get(data) {
            Some(text) => ManifestValue::String(text.to_string()),
            None => return malformed("string value references a missing pool entry"),
        },
        TYPE_REFERENCE => ManifestValue::Reference(data),
        TYPE_INT_BOOLEAN => ManifestValue::Boolean(data != 0),
        TYPE_INT_DEC => ManifestValue::Integer(i64::from(data as i32)),
        TYPE_INT_HEX => ManifestValue::Hex(data),
        TYPE_FLOAT => ManifestValue::String(f32::from_bits(data).to_string()),
        _ => ManifestValue::Hex(data),
    })
}

#[derive(Default)]
struct PoolBuilder {
    strings: Vec<String>,
    indices: BTreeMap<String, u32>,
}

impl PoolBuilder {
    fn intern(&mut self, value: &str) -> u32 {
        if let Some(&idx) = self.indices.get(value) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(value.to_string());
        self.indices.insert(value.to_string(), idx);
        idx
    }

    fn index(&self, value: &str) -> BinaryXmlResult<u32> {
        match self.indices.get(value) {
            Some(idx) => Ok(*idx),
            None => malformed(format!("string '{value}' missing from the pool")),
        }
    }

    fn to_chunk(&self, encoding: StringEncoding) -> Vec<u8> {
        let mut data = Vec::new();
        let mut offsets = Vec::with_capacity(self.strings.len());
        for text in &self.strings {
            offsets.push(data.len() as u32);
            match encoding {
                StringEncoding::Utf8 => encode_utf8_entry(&mut data, text),
                StringEncoding::Utf16 => encode_utf16_entry(&mut data, text),
            }
        }
        pad_to_four(&mut data);

        let header_size = 28u16;
        let mut chunk = Vec::new();
        let start = begin_chunk(&mut chunk, RES_STRING_POOL_TYPE, header_size);
        put_u32(&mut chunk, self.strings.len() as u32);
        put_u32(&mut chunk, 0);
        put_u32(
            &mut chunk,
            match encoding {
                StringEncoding::Utf8 => STRING_POOL_UTF8_FLAG,
                StringEncoding::Utf16 => 0,
            },
        );
        put_u32(&mut chunk, header_size as u32 + 4 * self.strings.len() as u32);
        put_u32(&mut chunk, 0);
        for offset in offsets {
            put_u32(&mut chunk, offset);
        }
        chunk.extend_from_slice(&data);
        end_chunk(&mut chunk, start);
        chunk
    }
}

fn encode_utf8_entry(buf: &mut Vec<u8>, text: &str) {
    let put_len = |buf: &mut Vec<u8>, len: usize| {
        if len > 0x7F {
            buf.push(0x80 | ((len >> 8) as u8 & 0x7F));
        }
        buf.push((len & 0xFF) as u8);
    };
    put_len(buf, text.encode_utf16().count());
    put_len(buf, text.len());
    buf.extend_from_slice(text.as_bytes());
    buf.push(0);
}

fn encode_utf16_entry(buf: &mut Vec<u8>, text: &str) {
    let units: Vec<u16> = text.encode_utf16().collect();
    if units.len() > 0x7FFF {
        put_u16(buf, 0x8000 | ((units.len() >> 16) as u16 & 0x7FFF));
    }
    put_u16(buf, (units.len() & 0xFFFF) as u16);
    for unit in units {
        put_u16(buf, unit);
    }
    put_u16(buf, 0);
}

fn collect_resource_names(element: &ManifestElement, out: &mut Vec<(String, u32)>) {
    for attr in &element.attributes {
        if let Some(id) = attr.resource_id {
            if !out.iter().any(|(name, _)| *name == attr.name) {
                out.push((attr.name.clone(), id));
            }
        }
    }
    for child in &element.children {
        collect_resource_names(child, out);
    }
}

fn collect_namespaces(element: &ManifestElement, out: &mut BTreeMap<String, String>) {
    if let (Some(prefix), Some(uri)) = (&element.namespace_prefix, &element.namespace_uri) {
        out.entry(prefix.clone()).or_insert_with(|| uri.clone());
    }
    for attr in &element.attributes {
        if let (Some(prefix), Some(uri)) = (&attr.namespace_prefix, &attr.namespace_uri) {
            out.entry(prefix.clone()).or_insert_with(|| uri.clone());
        }
    }
    for child in &element.children {
        collect_namespaces(child, out);
    }
}

fn intern_element(element: &ManifestElement, pool: &mut PoolBuilder) {
    pool.intern(&element.tag);
    if let Some(uri) = &element.namespace_uri {
        pool.intern(uri);
    }
    if let Some(text) = &element.text {
        pool.intern(text);
    }
    for attr in &element.attributes {
        pool.intern(&attr.name);
        if let Some(uri) = &attr.namespace_uri {
            pool.intern(uri);
        }
        if let ManifestValue::String(text) = &attr.value {
            pool.intern(text);
        }
    }
    for child in &element.children {
        intern_element(child, pool);
    }
}

fn optional_index(pool: &PoolBuilder, value: Option<&str>) -> BinaryXmlResult<u32> {
    match value {
        Some(value) => pool.index(value),
        None => Ok(NO_INDEX),
    }
}

fn write_namespace(
    buf: &mut Vec<u8>,
    chunk_type: u16,
    pool: &PoolBuilder,
    prefix: &str,
    uri: &str,
) -> BinaryXmlResult<()> {
    let start = begin_chunk(buf, chunk_type, 16);
    put_u32(buf, 1);
    put_u32(buf, NO_INDEX);
    put_u32(buf, pool.index(prefix)?);
    put_u32(buf, pool.index(uri)?);
    end_chunk(buf, start);
    Ok(())
}

fn write_element(
    buf: &mut Vec<u8>,
    element: &ManifestElement,
    pool: &PoolBuilder,
) -> BinaryXmlResult<()> {
    let ns_idx = optional_index(pool, element.namespace_uri.as_deref())?;
    let name_idx = pool.index(&element.tag)?;

    let start = begin_chunk(buf, RES_XML_START_ELEMENT_TYPE, 16);
    put_u32(buf, 1);
    put_u32(buf, NO_INDEX);
    put_u32(buf, ns_idx);
    put_u32(buf, name_idx);
    put_u16(buf, 20);
    put_u16(buf, 20);
    put_u16(buf, element.attributes.len() as u16);
    put_u16(buf, 0);
    put_u16(buf, 0);
    put_u16(buf, 0);
    for attr in &element.attributes {
        let (data_type, data) = encode_typed_value(&attr.value, pool)?;
        put_u32(buf, optional_index(pool, attr.namespace_uri.as_deref())?);
        put_u32(buf, pool.index(&attr.name)?);
        put_u32(buf, if data_type == TYPE_STRING { data } else { NO_INDEX });
        put_u16(buf, 8);
        buf.push(0);
        buf.push(data_type);
        put_u32(buf, data);
    }
    end_chunk(buf, start);

    if let Some(text) = &element.text {
        let cdata = begin_chunk(buf, RES_XML_CDATA_TYPE, 16);
        put_u32(buf, 1);
        put_u32(buf, NO_INDEX);
        let idx = pool.index(text)?;
        put_u32(buf, idx);
        put_u16(buf, 8);
        buf.push(0);
        buf.push(TYPE_STRING);
        put_u32(buf, idx);
        end_chunk(buf, cdata);
    }

    for child in &element.children {
        write_element(buf, child, pool)?;
    }

    let end = begin_chunk(buf, RES_XML_END_ELEMENT_TYPE, 16);
    put_u32(buf, 1);
    put_u32(buf, NO_INDEX);
    put_u32(buf, ns_idx);
    put_u32(buf, name_idx);
    end_chunk(buf, end);
    Ok(())
}

fn encode_typed_value(value: &ManifestValue, pool: &PoolBuilder) -> BinaryXmlResult<(u8, u32)> {
    Ok(match value {
        ManifestValue::String(text) => (TYPE_STRING, pool.index(text)?),
        ManifestValue::Boolean(flag) => (TYPE_INT_BOOLEAN, if *flag { 0xFFFF_FFFF } else { 0 }),
        ManifestValue::Integer(num) => (TYPE_INT_DEC, *num as i32 as u32),
        ManifestValue::Hex(value) => (TYPE_INT_HEX, *value),
        ManifestValue::Reference(id) => (TYPE_REFERENCE, *id),
    })
}

fn element_from_text(
    start: &BytesStart<'_>,
    scopes: &mut Vec<BTreeMap<String, String>>,
) -> BinaryXmlResult<ManifestElement> {
    let mut declared = BTreeMap::new();
    let mut pending = Vec::new();
    for attr in start.attributes().with_checks(false) {
        let attr = attr?;
        let key = std::str::from_utf8(attr.key.as_ref())
            .map_err(|err| BinaryXmlError::Xml(err.to_string()))?
            .to_string();
        let value = attr.unescape_value()?.into_owned();
        if key == "xmlns" {
            declared.insert(String::new(), value);
        } else if let Some(prefix) = key.strip_prefix("xmlns:") {
            declared.insert(prefix.to_string(), value);
        } else {
            pending.push((key, value));
        }
    }
    scopes.push(declared);

    let lookup = |prefix: &str| -> Option<String> {
        scopes.iter().rev().find_map(|scope| scope.get(prefix).cloned())
    };

    let raw_name = std::str::from_utf8(start.name().as_ref())
        .map_err(|err| BinaryXmlError::Xml(err.to_string()))?
        .to_string();
    let mut element = match raw_name.split_once(':') {
        Some((prefix, local)) => {
            let mut element = ManifestElement::new(local);
            element.namespace_uri = lookup(prefix);
            element.namespace_prefix = Some(prefix.to_string());
            element
        }
        None => ManifestElement::new(raw_name),
    };

    for (key, value) in pending {
        let (prefix, local) = match key.split_once(':') {
            Some((prefix, local)) => (Some(prefix.to_string()), local.to_string()),
            None => (None, key),
        };
        element.attributes.push(ManifestAttribute {
            namespace_uri: prefix.as_deref().and_then(|p| lookup(p)),
            namespace_prefix: prefix,
            resource_id: None,
            name: local,
            value: ManifestValue::from_text(&value),
        });
    }
    Ok(element)
}

fn attach(
    open: &mut [ManifestElement],
    root: &mut Option<ManifestElement>,
    element: ManifestElement,
) -> BinaryXmlResult<()> {
    if let Some(parent) = open.last_mut() {
        parent.children.push(element);
    } else if root.is_none() {
        *root = Some(element);
    } else {
        return malformed("multiple root elements");
    }
    Ok(())
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    element: &ManifestElement,
    namespace_decls: Option<&BTreeMap<String, String>>,
) -> BinaryXmlResult<()> {
    let name = match &element.namespace_prefix {
        Some(prefix) => format!("{prefix}:{}", element.tag),
        None => element.tag.clone(),
    };
    let mut start = BytesStart::new(name.as_str());
    if let Some(decls) = namespace_decls {
        for (prefix, uri) in decls {
            let key = if prefix.is_empty() {
                "xmlns".to_string()
            } else {
                format!("xmlns:{prefix}")
            };
            start.push_attribute((key.as_str(), uri.as_str()));
        }
    }
    for attr in &element.attributes {
        let key = attr.qualified_name();
        let value = attr.value.to_text();
        start.push_attribute((key.as_str(), value.as_str()));
    }

    if element.children.is_empty() && element.text.is_none() {
        writer.write_event(Event::Empty(start)).map_err(xml_err)?;
        return Ok(());
    }
    writer.write_event(Event::Start(start)).map_err(xml_err)?;
    if let Some(text) = &element.text {
        writer
            .write_event(Event::Text(BytesText::new(text)))
            .map_err(xml_err)?;
    }
    for child in &element.children {
        write_text_element(writer, child, None)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(name.as_str())))
        .map_err(xml_err)?;
    Ok(())
}

fn begin_chunk(buf: &mut Vec<u8>, chunk_type: u16, header_size: u16) -> usize {
    let start = buf.len();
    put_u16(buf, chunk_type);
    put_u16(buf, header_size);
    put_u32(buf, 0);
    start
}

fn end_chunk(buf: &mut Vec<u8>, start: usize) {
    pad_to_four(buf);
    let size = (buf.len() - start) as u32;
    buf[start + 4..start + 8].copy_from_slice(&size.to_le_bytes());
}

fn pad_to_four(buf: &mut Vec<u8>) {
    while buf.len() % 4 != 0 {
        buf.push(0);
    }
}

fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}
