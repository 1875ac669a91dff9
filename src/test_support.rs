//! Shared fixtures: in-memory EPUB containers and a scripted document.

use crate::error::{EbookError, Result};
use crate::services::document::{DocumentBackend, RenderableDocument};
use crate::types::TocEntry;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use percent_encoding::percent_decode_str;
use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::path::{Path, PathBuf};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub struct FixtureImage {
    pub id: String,
    pub href: String,
    pub media_type: String,
    pub properties: Option<String>,
    pub bytes: Vec<u8>,
}

pub struct EpubFixture {
    pub opf_dir: String,
    pub title: String,
    pub author: String,
    /// (href relative to the OPF, nav title, xhtml body)
    pub chapters: Vec<(String, String, String)>,
    pub images: Vec<FixtureImage>,
    pub cover_meta: Option<String>,
    pub use_nav: bool,
    pub include_container: bool,
}

impl EpubFixture {
    pub fn sample() -> Self {
        Self {
            opf_dir: "OEBPS".to_string(),
            title: "A Sample Book".to_string(),
            author: "Jane Doe".to_string(),
            chapters: vec![
                chapter("text/ch1.xhtml", "Chapter 1", "<h1>Chapter 1</h1><p>First line.</p><p>Second line.</p>"),
                chapter("text/ch2.xhtml", "Chapter 2", "<h1>Chapter 2</h1><ul><li>alpha</li><li>beta</li></ul>"),
                chapter("text/ch3.xhtml", "Chapter 3", "<blockquote>Fin.</blockquote>"),
            ],
            images: Vec::new(),
            cover_meta: None,
            use_nav: false,
            include_container: true,
        }
    }

    pub fn with_image(mut self, id: &str, href: &str, properties: Option<&str>, bytes: Vec<u8>) -> Self {
        let media_type = match href.rsplit('.').next() {
            Some("png") => "image/png",
            Some("gif") => "image/gif",
            _ => "image/jpeg",
        };
        self.images.push(FixtureImage {
            id: id.to_string(),
            href: href.to_string(),
            media_type: media_type.to_string(),
            properties: properties.map(str::to_string),
            bytes,
        });
        self
    }

    pub fn with_cover_meta(mut self, id: &str) -> Self {
        self.cover_meta = Some(id.to_string());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        let mut zip = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();
        let prefix = if self.opf_dir.is_empty() {
            String::new()
        } else {
            format!("{}/", self.opf_dir)
        };

        add(&mut zip, options, "mimetype", b"application/epub+zip");
        if self.include_container {
            let container = format!(
                r#"<?xml version="1.0"?>
<container version="1.0" xmlns="urn:oasis:names:tc:opendocument:xmlns:container">
  <rootfiles><rootfile full-path="{}content.opf" media-type="application/oebps-package+xml"/></rootfiles>
</container>"#,
                prefix
            );
            add(&mut zip, options, "META-INF/container.xml", container.as_bytes());
        }

        add(&mut zip, options, &format!("{}content.opf", prefix), self.opf().as_bytes());

        for (href, title, body) in &self.chapters {
            let page = format!(
                r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml"><head><title>{}</title></head><body>{}</body></html>"#,
                title, body
            );
            add(&mut zip, options, &entry_name(&prefix, href), page.as_bytes());
        }

        if self.use_nav {
            add(&mut zip, options, &format!("{}nav.xhtml", prefix), self.nav().as_bytes());
        } else {
            add(&mut zip, options, &format!("{}toc.ncx", prefix), self.ncx().as_bytes());
        }

        for image in &self.images {
            add(&mut zip, options, &entry_name(&prefix, &image.href), &image.bytes);
        }

        zip.finish().unwrap().into_inner()
    }

    fn opf(&self) -> String {
        let mut manifest = String::new();
        let mut spine = String::new();

        for (idx, (href, _, _)) in self.chapters.iter().enumerate() {
            manifest.push_str(&format!(
                r#"<item id="ch{}" href="{}" media-type="application/xhtml+xml"/>"#,
                idx + 1,
                href
            ));
            spine.push_str(&format!(r#"<itemref idref="ch{}"/>"#, idx + 1));
        }
        for image in &self.images {
            let properties = image
                .properties
                .as_ref()
                .map(|p| format!(r#" properties="{}""#, p))
                .unwrap_or_default();
            manifest.push_str(&format!(
                r#"<item id="{}" href="{}" media-type="{}"{}/>"#,
                image.id, image.href, image.media_type, properties
            ));
        }
        let spine_open = if self.use_nav {
            manifest.push_str(r#"<item id="nav" href="nav.xhtml" media-type="application/xhtml+xml" properties="nav"/>"#);
            "<spine>".to_string()
        } else {
            manifest.push_str(r#"<item id="ncx" href="toc.ncx" media-type="application/x-dtbncx+xml"/>"#);
            r#"<spine toc="ncx">"#.to_string()
        };
        let cover_meta = self
            .cover_meta
            .as_ref()
            .map(|id| format!(r#"<meta name="cover" content="{}"/>"#, id))
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<package xmlns="http://www.idpf.org/2007/opf" version="{}">
  <metadata xmlns:dc="http://purl.org/dc/elements/1.1/">
    <dc:title>{}</dc:title><dc:creator>{}</dc:creator><dc:language>en</dc:language>{}
  </metadata>
  <manifest>{}</manifest>
  {}{}</spine>
</package>"#,
            if self.use_nav { "3.0" } else { "2.0" },
            self.title,
            self.author,
            cover_meta,
            manifest,
            spine_open,
            spine
        )
    }

    fn ncx(&self) -> String {
        let points: String = self
            .chapters
            .iter()
            .enumerate()
            .map(|(idx, (href, title, _))| {
                format!(
                    r#"<navPoint id="n{0}" playOrder="{0}"><navLabel><text>{1}</text></navLabel><content src="{2}"/></navPoint>"#,
                    idx + 1,
                    title,
                    href
                )
            })
            .collect();

        format!(
            r#"<?xml version="1.0"?><ncx xmlns="http://www.daisy.org/z3986/2005/ncx/" version="2005-1"><navMap>{}</navMap></ncx>"#,
            points
        )
    }

    fn nav(&self) -> String {
        let items: String = self
            .chapters
            .iter()
            .map(|(href, title, _)| format!(r#"<li><a href="{}">{}</a></li>"#, href, title))
            .collect();

        format!(
            r#"<?xml version="1.0" encoding="utf-8"?>
<html xmlns="http://www.w3.org/1999/xhtml" xmlns:epub="http://www.idpf.org/2007/ops"><body>
<nav epub:type="toc"><ol>{}</ol></nav></body></html>"#,
            items
        )
    }
}

/// Archive entries are stored under the decoded form of their manifest href.
fn entry_name(prefix: &str, href: &str) -> String {
    format!("{}{}", prefix, percent_decode_str(href).decode_utf8_lossy())
}

pub fn chapter(href: &str, title: &str, body: &str) -> (String, String, String) {
    (href.to_string(), title.to_string(), body.to_string())
}

fn add(zip: &mut ZipWriter<Cursor<Vec<u8>>>, options: SimpleFileOptions, name: &str, bytes: &[u8]) {
    zip.start_file(name, options).unwrap();
    zip.write_all(bytes).unwrap();
}

pub fn write_fixture(dir: &Path, name: &str, fixture: &EpubFixture) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, fixture.build()).unwrap();
    path
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb([200, 30, 30]));
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(img)
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// In-memory Mobipocket database: record 0 with MOBI and EXTH headers,
/// 4096-byte text records, then image records.
pub struct MobiFixture {
    pub full_name: String,
    pub exth: Vec<(u32, Vec<u8>)>,
    /// (ToC title, page body)
    pub chapters: Vec<(String, String)>,
    pub images: Vec<Vec<u8>>,
    pub guide: bool,
    /// Puts `<img recindex="1">` on the first page.
    pub front_image: bool,
    /// 1 stores text as-is; 2 declares PalmDOC, which ASCII text already is.
    pub compression: u16,
    pub encoding: u32,
    pub encryption: u16,
}

impl MobiFixture {
    pub fn sample() -> Self {
        Self {
            full_name: "Sample Full Name".to_string(),
            exth: vec![
                (100, b"Ann Author".to_vec()),
                (100, b"Bo Writer".to_vec()),
                (503, b"A Sample Mobi".to_vec()),
                (524, b"en".to_vec()),
            ],
            chapters: vec![
                (
                    "Chapter 1 Beginnings".to_string(),
                    "<h2>Chapter 1 Beginnings</h2><p>It begins.</p>".to_string(),
                ),
                ("Epilogue".to_string(), "<p>Fish &amp; chips.</p>".to_string()),
            ],
            images: Vec::new(),
            guide: true,
            front_image: false,
            compression: 1,
            encoding: 65001,
            encryption: 0,
        }
    }

    fn encode(&self, text: &str) -> Vec<u8> {
        if self.encoding == 1252 {
            encoding_rs::WINDOWS_1252.encode(text).0.into_owned()
        } else {
            text.as_bytes().to_vec()
        }
    }

    /// Text stream with fixed-width `filepos` values, so a second pass with
    /// the measured offsets keeps every offset in place.
    fn assemble(&self, toc_pos: usize, chapter_pos: &[usize]) -> (Vec<u8>, usize, Vec<usize>) {
        let mut out = self.encode("<html><head>");
        if self.guide {
            out.extend(self.encode(&format!(
                r#"<guide><reference type="toc" title="Table of Contents" filepos={:010} /></guide>"#,
                toc_pos
            )));
        }
        out.extend(self.encode("</head><body>"));
        if self.front_image {
            out.extend(self.encode(r#"<p><img recindex="00001" alt="front" /></p>"#));
        }

        let toc_start = out.len();
        out.extend(self.encode("<mbp:pagebreak/><p>Contents</p>"));
        for (idx, (title, _)) in self.chapters.iter().enumerate() {
            out.extend(self.encode(&format!(
                "<p><a filepos={:010}>{}</a></p>",
                chapter_pos.get(idx).copied().unwrap_or(0),
                title
            )));
        }

        let mut starts = Vec::new();
        for (_, body) in &self.chapters {
            starts.push(out.len());
            out.extend(self.encode(&format!("<mbp:pagebreak/>{}", body)));
        }
        out.extend(self.encode("</body></html>"));

        (out, toc_start, starts)
    }

    pub fn text(&self) -> Vec<u8> {
        let (_, toc_start, starts) = self.assemble(0, &[]);
        self.assemble(toc_start, &starts).0
    }

    fn exth_block(&self) -> Vec<u8> {
        let mut body = Vec::new();
        for (kind, value) in &self.exth {
            body.extend(kind.to_be_bytes());
            body.extend((value.len() as u32 + 8).to_be_bytes());
            body.extend(value);
        }

        let mut block = b"EXTH".to_vec();
        block.extend((body.len() as u32 + 12).to_be_bytes());
        block.extend((self.exth.len() as u32).to_be_bytes());
        block.extend(body);
        while block.len() % 4 != 0 {
            block.push(0);
        }
        block
    }

    fn record0(&self, text_len: usize, text_records: usize, first_image: Option<usize>) -> Vec<u8> {
        let mut record = vec![0u8; 16 + 0xE8];
        put_u16(&mut record, 0, self.compression);
        put_u32(&mut record, 4, text_len as u32);
        put_u16(&mut record, 8, text_records as u16);
        put_u16(&mut record, 10, 4096);
        put_u16(&mut record, 12, self.encryption);
        record[16..20].copy_from_slice(b"MOBI");
        put_u32(&mut record, 20, 0xE8);
        put_u32(&mut record, 24, 2);
        put_u32(&mut record, 28, self.encoding);
        put_u32(&mut record, 36, 6);
        put_u32(&mut record, 0x6C, first_image.map_or(u32::MAX, |index| index as u32));
        put_u32(&mut record, 0x70, u32::MAX);

        if !self.exth.is_empty() {
            put_u32(&mut record, 0x80, 0x40);
            record.extend(self.exth_block());
        }

        let name_offset = record.len();
        record.extend(self.full_name.as_bytes());
        record.extend([0, 0]);
        put_u32(&mut record, 0x54, name_offset as u32);
        put_u32(&mut record, 0x58, self.full_name.len() as u32);
        record
    }

    pub fn build(&self) -> Vec<u8> {
        let text = self.text();
        let chunks: Vec<&[u8]> = text.chunks(4096).collect();
        let first_image = (!self.images.is_empty()).then_some(1 + chunks.len());

        let mut records = vec![self.record0(text.len(), chunks.len(), first_image)];
        records.extend(chunks.iter().map(|chunk| chunk.to_vec()));
        records.extend(self.images.iter().cloned());

        let table_end = 78 + records.len() * 8 + 2;
        let mut out = vec![0u8; table_end];
        let name: Vec<u8> = self
            .full_name
            .bytes()
            .take(31)
            .map(|b| if b == b' ' { b'_' } else { b })
            .collect();
        out[..name.len()].copy_from_slice(&name);
        out[60..68].copy_from_slice(b"BOOKMOBI");
        put_u16(&mut out, 76, records.len() as u16);

        let mut offset = table_end;
        for (idx, record) in records.iter().enumerate() {
            put_u32(&mut out, 78 + idx * 8, offset as u32);
            put_u32(&mut out, 78 + idx * 8 + 4, idx as u32);
            offset += record.len();
        }
        for record in records {
            out.extend(record);
        }
        out
    }
}

fn put_u16(buf: &mut [u8], at: usize, value: u16) {
    buf[at..at + 2].copy_from_slice(&value.to_be_bytes());
}

fn put_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_be_bytes());
}

pub fn write_mobi_fixture(dir: &Path, name: &str, fixture: &MobiFixture) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, fixture.build()).unwrap();
    path
}

/// Scripted document: fixed page texts, some of which may fail.
#[derive(Clone, Default)]
pub struct StaticDocument {
    pub pages: Vec<Option<String>>,
    pub toc: Vec<TocEntry>,
    pub metadata: HashMap<String, String>,
    pub cover: Option<DynamicImage>,
}

impl StaticDocument {
    pub fn with_pages(pages: &[&str]) -> Self {
        Self {
            pages: pages.iter().map(|p| Some(p.to_string())).collect(),
            ..Self::default()
        }
    }
}

impl RenderableDocument for StaticDocument {
    fn page_count(&self) -> usize {
        self.pages.len()
    }

    fn text(&mut self, page: usize) -> Result<String> {
        match self.pages.get(page) {
            Some(Some(text)) => Ok(text.clone()),
            Some(None) => Err(EbookError::Render {
                page,
                reason: "scripted failure".to_string(),
            }),
            None => Err(EbookError::PageOutOfRange {
                page,
                page_count: self.pages.len(),
            }),
        }
    }

    fn table_of_contents(&mut self) -> Result<Vec<TocEntry>> {
        Ok(self.toc.clone())
    }

    fn image(&mut self, page: usize) -> Result<DynamicImage> {
        match (page, &self.cover) {
            (0, Some(img)) => Ok(img.clone()),
            _ => Err(EbookError::Render {
                page,
                reason: "no raster available".to_string(),
            }),
        }
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.metadata.clone()
    }
}

/// Backend that hands out clones of one scripted document.
pub struct StaticBackend(pub StaticDocument);

impl DocumentBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    fn supports(&self, _path: &Path) -> bool {
        true
    }

    fn open(&self, _path: &Path) -> Result<Box<dyn RenderableDocument>> {
        Ok(Box::new(self.0.clone()))
    }
}
