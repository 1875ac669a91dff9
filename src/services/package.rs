//! Parsing of EPUB container metadata: `META-INF/container.xml`, the OPF
//! package document and the NCX navigation map.

use crate::error::{EbookError, Result};
use percent_encoding::percent_decode_str;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::io::{Read, Seek};
use tracing::debug;
use zip::ZipArchive;

pub const CONTAINER_PATH: &str = "META-INF/container.xml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestItem {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
}

impl ManifestItem {
    fn has_property(&self, property: &str) -> bool {
        self.properties
            .as_deref()
            .is_some_and(|p| p.split_ascii_whitespace().any(|token| token == property))
    }
}

/// A `<meta name="..." content="..."/>` pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaEntry {
    pub name: String,
    pub content: String,
}

#[derive(Debug, Clone, Default)]
pub struct Package {
    pub version: String,
    pub meta: Vec<MetaEntry>,
    /// Dublin Core elements as (local name, text) in document order.
    pub dublin_core: Vec<(String, String)>,
    pub manifest: Vec<ManifestItem>,
    pub spine: Vec<String>,
    /// Manifest id of the NCX named by `<spine toc="...">`.
    pub toc_id: Option<String>,
}

impl Package {
    pub fn item(&self, id: &str) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.id == id)
    }

    pub fn ncx_item(&self) -> Option<&ManifestItem> {
        self.toc_id.as_deref().and_then(|id| self.item(id))
    }

    pub fn nav_item(&self) -> Option<&ManifestItem> {
        self.manifest.iter().find(|item| item.has_property("nav"))
    }

    /// Spine items resolved through the manifest; dangling idrefs are skipped.
    pub fn spine_items(&self) -> impl Iterator<Item = &ManifestItem> {
        self.spine.iter().filter_map(|id| self.item(id))
    }

    pub fn dublin_core_values(&self, name: &str) -> Vec<&str> {
        self.dublin_core
            .iter()
            .filter(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
            .filter(|value| !value.is_empty())
            .collect()
    }

    /// Href of the cover image, trying in order: the `cover` meta entry,
    /// the `cover-image` property, then any image whose href or id
    /// mentions "cover".
    pub fn cover_href(&self) -> Option<&str> {
        let by_meta = self
            .meta
            .iter()
            .find(|meta| meta.name == "cover")
            .and_then(|meta| self.item(&meta.content));
        if let Some(item) = by_meta {
            return Some(&item.href);
        }

        if let Some(item) = self.manifest.iter().find(|item| item.has_property("cover-image")) {
            return Some(&item.href);
        }

        self.manifest
            .iter()
            .find(|item| {
                item.media_type.starts_with("image/")
                    && (item.href.to_lowercase().contains("cover")
                        || item.id.to_lowercase().contains("cover"))
            })
            .map(|item| item.href.as_str())
    }
}

/// One flattened NCX navPoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NavPoint {
    pub title: String,
    pub href: String,
    pub level: usize,
}

/// Full paths of the root files named by `META-INF/container.xml`.
pub fn parse_container(bytes: &[u8]) -> Result<Vec<String>> {
    let content = decode_utf8(bytes)?;
    let mut reader = Reader::from_str(&content);
    reader.config_mut().trim_text(true);

    let mut root_files = Vec::new();

    loop {
        match reader.read_event()? {
            Event::Empty(e) | Event::Start(e) if local_name(e.name().as_ref()) == b"rootfile" => {
                if let Some(full_path) = attribute(&e, b"full-path")? {
                    root_files.push(full_path);
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(root_files)
}

pub fn parse_package(bytes: &[u8]) -> Result<Package> {
    let content = decode_utf8(bytes)?;
    // Untrimmed: text around entity references arrives as separate events.
    let mut reader = Reader::from_str(&content);

    let mut package = Package::default();
    let mut saw_package = false;
    let mut in_metadata = false;
    let mut current_element: Option<String> = None;
    let mut buf_text = String::new();

    loop {
        let event = reader.read_event()?;
        match &event {
            Event::Start(e) | Event::Empty(e) => {
                let is_empty = matches!(event, Event::Empty(_));
                let name = e.name();
                let local = local_name(name.as_ref());

                match local {
                    b"package" => {
                        saw_package = true;
                        package.version = attribute(e, b"version")?.unwrap_or_default();
                    }
                    b"metadata" if !is_empty => in_metadata = true,
                    b"meta" => {
                        if let (Some(name), Some(content)) =
                            (attribute(e, b"name")?, attribute(e, b"content")?)
                        {
                            package.meta.push(MetaEntry { name, content });
                        }
                    }
                    b"item" => {
                        let id = attribute(e, b"id")?.unwrap_or_default();
                        if !id.is_empty() {
                            package.manifest.push(ManifestItem {
                                id,
                                href: attribute(e, b"href")?.unwrap_or_default(),
                                media_type: attribute(e, b"media-type")?.unwrap_or_default(),
                                properties: attribute(e, b"properties")?,
                            });
                        }
                    }
                    b"itemref" => {
                        if let Some(idref) = attribute(e, b"idref")? {
                            package.spine.push(idref);
                        }
                    }
                    b"spine" => package.toc_id = attribute(e, b"toc")?,
                    _ if in_metadata && !is_empty && name.as_ref().starts_with(b"dc:") => {
                        current_element = Some(String::from_utf8_lossy(local).into_owned());
                        buf_text.clear();
                    }
                    _ => {}
                }
            }
            Event::Text(e) => {
                if current_element.is_some() {
                    buf_text.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Event::GeneralRef(e) => {
                if current_element.is_some() {
                    if let Some(resolved) = resolve_entity(&String::from_utf8_lossy(e.as_ref())) {
                        buf_text.push_str(&resolved);
                    }
                }
            }
            Event::End(e) => {
                let name = e.name();
                if local_name(name.as_ref()) == b"metadata" {
                    in_metadata = false;
                }
                if let Some(element) = current_element.take() {
                    package.dublin_core.push((element, collapse_whitespace(&buf_text)));
                    buf_text.clear();
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !saw_package {
        return Err(EbookError::InvalidContainer {
            reason: "package document has no <package> element".to_string(),
        });
    }

    Ok(package)
}

pub fn parse_ncx(bytes: &[u8]) -> Result<Vec<NavPoint>> {
    let content = decode_utf8(bytes)?;
    let mut reader = Reader::from_str(&content);

    let mut points: Vec<NavPoint> = Vec::new();
    // Indices into `points` of the currently open navPoints.
    let mut open: Vec<usize> = Vec::new();
    let mut in_text = false;

    loop {
        match reader.read_event()? {
            Event::Start(e) => match local_name(e.name().as_ref()) {
                b"navPoint" => {
                    points.push(NavPoint {
                        title: String::new(),
                        href: String::new(),
                        level: open.len(),
                    });
                    open.push(points.len() - 1);
                }
                b"text" => in_text = true,
                b"content" => set_nav_src(&e, &open, &mut points)?,
                _ => {}
            },
            Event::Empty(e) => {
                if local_name(e.name().as_ref()) == b"content" {
                    set_nav_src(&e, &open, &mut points)?;
                }
            }
            Event::Text(e) => {
                if let (true, Some(&idx)) = (in_text, open.last()) {
                    points[idx].title.push_str(&String::from_utf8_lossy(e.as_ref()));
                }
            }
            Event::GeneralRef(e) => {
                if let (true, Some(&idx)) = (in_text, open.last()) {
                    if let Some(resolved) = resolve_entity(&String::from_utf8_lossy(e.as_ref())) {
                        points[idx].title.push_str(&resolved);
                    }
                }
            }
            Event::End(e) => match local_name(e.name().as_ref()) {
                b"text" => in_text = false,
                b"navPoint" => {
                    open.pop();
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(points
        .into_iter()
        .map(|p| NavPoint {
            title: collapse_whitespace(&p.title),
            ..p
        })
        .filter(|p| !p.title.is_empty())
        .collect())
}

fn set_nav_src(e: &BytesStart<'_>, open: &[usize], points: &mut [NavPoint]) -> Result<()> {
    if let (Some(&idx), Some(src)) = (open.last(), attribute(e, b"src")?) {
        if points[idx].href.is_empty() {
            points[idx].href = src;
        }
    }
    Ok(())
}

/// Reads an archive entry by exact path, falling back to the
/// percent-decoded path for hrefs written as URIs (`front%20cover.jpg`).
pub fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, path: &str) -> Result<Vec<u8>> {
    if let Some(contents) = read_exact_entry(archive, path)? {
        return Ok(contents);
    }

    let missing = || EbookError::MissingEntry {
        path: path.to_string(),
    };
    let decoded = percent_decode_str(path)
        .decode_utf8()
        .map_err(|_| missing())?;
    if decoded == path {
        return Err(missing());
    }

    debug!("Retrying archive entry {} as {}", path, decoded);
    read_exact_entry(archive, &decoded)?.ok_or_else(missing)
}

fn read_exact_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    path: &str,
) -> Result<Option<Vec<u8>>> {
    let mut file = match archive.by_name(path) {
        Ok(file) => file,
        Err(zip::result::ZipError::FileNotFound) => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;
    Ok(Some(contents))
}

/// Locates and parses the first root file named by the container.
/// Returns the root file's archive path with its package.
pub fn open_package<R: Read + Seek>(archive: &mut ZipArchive<R>) -> Result<(String, Package)> {
    let container = read_entry(archive, CONTAINER_PATH)?;
    let root_files = parse_container(&container)?;
    let root = root_files
        .into_iter()
        .next()
        .ok_or_else(|| EbookError::InvalidContainer {
            reason: "no root file found in container.xml".to_string(),
        })?;

    let package = parse_package(&read_entry(archive, &root)?)?;
    Ok((root, package))
}

/// Directory part of an archive path ("" for top-level entries).
pub fn parent_dir(path: &str) -> &str {
    path.rfind('/').map(|idx| &path[..idx]).unwrap_or("")
}

/// Resolves `href` against `base_dir`, dropping any fragment and
/// normalizing `.` and `..` segments.
pub fn resolve_href(base_dir: &str, href: &str) -> String {
    let href = href.split_once('#').map_or(href, |(path, _)| path);
    let mut segments: Vec<&str> = Vec::new();

    let joined = if href.starts_with('/') {
        href.to_string()
    } else if base_dir.is_empty() {
        href.to_string()
    } else {
        format!("{}/{}", base_dir, href)
    };

    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            _ => segments.push(segment),
        }
    }

    segments.join("/")
}

fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn decode_utf8(bytes: &[u8]) -> Result<String> {
    let bytes = bytes.strip_prefix(&[0xEF, 0xBB, 0xBF]).unwrap_or(bytes);
    String::from_utf8(bytes.to_vec()).map_err(|e| EbookError::InvalidContainer {
        reason: format!("XML document is not valid UTF-8: {}", e),
    })
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Result<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        if attr.key.as_ref() == key {
            let raw = String::from_utf8_lossy(&attr.value).into_owned();
            let value = quick_xml::escape::unescape(&raw)
                .map(|v| v.into_owned())
                .unwrap_or(raw);
            return Ok(Some(value));
        }
    }
    Ok(None)
}

/// Extract local name from namespaced XML name (e.g., "dc:title" -> "title").
fn local_name(name: &[u8]) -> &[u8] {
    name.iter()
        .rposition(|&b| b == b':')
        .map(|i| &name[i + 1..])
        .unwrap_or(name)
}

fn resolve_entity(entity: &str) -> Option<String> {
    match entity {
        "apos" => Some("'".to_string()),
        "quot" => Some("\"".to_string()),
        "lt" => Some("<".to_string()),
        "gt" => Some(">".to_string()),
        "amp" => Some("&".to_string()),
        _ => {
            let code = if let Some(hex) = entity.strip_prefix("#x") {
                u32::from_str_radix(hex, 16).ok()
            } else if let Some(dec) = entity.strip_prefix('#') {
                dec.parse().ok()
            } else {
                None
            };
            code.and_then(char::from_u32).map(String::from)
        }
    }
}
