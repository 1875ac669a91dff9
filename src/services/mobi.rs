//! Mobipocket (MOBI / PRC) backend.
//!
//! The PalmDB record table is read once; text records are decompressed
//! into one HTML stream which `<mbp:pagebreak>` markers cut into pages.
//! `filepos` offsets from the ToC and guide index into that raw stream.

use crate::error::{EbookError, Result};
use crate::services::compression::{palmdoc_decompress, HuffCdic};
use crate::services::document::{has_extension, DocumentBackend, RenderableDocument};
use crate::services::reflow;
use crate::types::TocEntry;
use encoding_rs::WINDOWS_1252;
use image::DynamicImage;
use memchr::memmem;
use regex::bytes::Regex;
use scraper::{Html, Selector};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fs;
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info};

const PDB_HEADER_LEN: usize = 78;
const NULL_INDEX: u32 = 0xFFFF_FFFF;
const PAGE_BREAK: &[u8] = b"<mbp:pagebreak";

const EXTH_AUTHOR: u32 = 100;
const EXTH_PUBLISHER: u32 = 101;
const EXTH_DESCRIPTION: u32 = 103;
const EXTH_ISBN: u32 = 104;
const EXTH_SUBJECT: u32 = 105;
const EXTH_DATE: u32 = 106;
const EXTH_RIGHTS: u32 = 109;
const EXTH_ASIN: u32 = 113;
const EXTH_COVER_OFFSET: u32 = 201;
const EXTH_TITLE: u32 = 503;
const EXTH_LANGUAGE: u32 = 524;

/// Opens `.mobi` and `.prc` files.
pub struct MobiBackend;

impl MobiBackend {
    pub fn accepts(path: &Path) -> bool {
        has_extension(path, "mobi") || has_extension(path, "prc")
    }
}

impl DocumentBackend for MobiBackend {
    fn name(&self) -> &'static str {
        "mobi"
    }

    fn supports(&self, path: &Path) -> bool {
        Self::accepts(path)
    }

    fn open(&self, path: &Path) -> Result<Box<dyn RenderableDocument>> {
        let document = MobiDocument::from_bytes(fs::read(path)?)?;
        info!(
            "Opened MOBI {} ({} pages)",
            path.display(),
            document.page_count()
        );
        Ok(Box::new(document))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Compression {
    None,
    PalmDoc,
    Huffman,
    Unknown(u16),
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum TextEncoding {
    Cp1252,
    Utf8,
}

#[derive(Debug)]
struct MobiHeader {
    compression: Compression,
    text_record_count: usize,
    encryption: u16,
    encoding: TextEncoding,
    /// 0 for plain PalmDOC files without a MOBI header.
    version: u32,
    full_name: Option<Vec<u8>>,
    first_image: Option<usize>,
    huff_records: Option<(usize, usize)>,
    extra_data_flags: u16,
    exth_offset: Option<usize>,
}

impl MobiHeader {
    fn parse(record0: &[u8]) -> Result<Self> {
        if record0.len() < 16 {
            return Err(invalid("record 0 is shorter than the PalmDOC header"));
        }

        let compression = match be_u16(record0, 0).unwrap_or(0) {
            1 => Compression::None,
            2 => Compression::PalmDoc,
            0x4448 => Compression::Huffman,
            other => Compression::Unknown(other),
        };

        let mut header = Self {
            compression,
            text_record_count: usize::from(be_u16(record0, 8).unwrap_or(0)),
            encryption: be_u16(record0, 12).unwrap_or(0),
            encoding: TextEncoding::Cp1252,
            version: 0,
            full_name: None,
            first_image: None,
            huff_records: None,
            extra_data_flags: 0,
            exth_offset: None,
        };

        if record0.get(16..20) != Some(b"MOBI".as_slice()) {
            return Ok(header);
        }

        let header_length = be_u32(record0, 20).unwrap_or(0) as usize;
        if be_u32(record0, 28) == Some(65001) {
            header.encoding = TextEncoding::Utf8;
        }
        header.version = be_u32(record0, 36).unwrap_or(0);

        if let (Some(offset), Some(length)) = (be_u32(record0, 0x54), be_u32(record0, 0x58)) {
            let (offset, length) = (offset as usize, length as usize);
            header.full_name = record0
                .get(offset..offset.saturating_add(length))
                .filter(|name| !name.is_empty())
                .map(<[u8]>::to_vec);
        }

        header.first_image = be_u32(record0, 0x6C)
            .filter(|&index| index != NULL_INDEX && index > 0)
            .map(|index| index as usize);

        if header.compression == Compression::Huffman {
            if let (Some(index), Some(count)) = (be_u32(record0, 0x70), be_u32(record0, 0x74)) {
                if index != NULL_INDEX && count > 0 {
                    header.huff_records = Some((index as usize, count as usize));
                }
            }
        }

        if be_u32(record0, 0x80).is_some_and(|flags| flags & 0x40 != 0) {
            header.exth_offset = Some(16 + header_length);
        }

        if header_length >= 0xE4 {
            header.extra_data_flags = be_u16(record0, 0xF2).unwrap_or(0);
        }

        Ok(header)
    }
}

/// EXTH metadata records as (type, payload) pairs, in file order.
#[derive(Debug, Default)]
struct Exth {
    records: Vec<(u32, Vec<u8>)>,
}

impl Exth {
    /// Unreadable or truncated EXTH blocks yield whatever records preceded
    /// the damage.
    fn parse(data: &[u8]) -> Self {
        let mut exth = Self::default();
        if data.get(0..4) != Some(b"EXTH".as_slice()) {
            return exth;
        }

        let count = be_u32(data, 8).unwrap_or(0);
        let mut pos = 12;
        for _ in 0..count {
            let (Some(kind), Some(length)) = (be_u32(data, pos), be_u32(data, pos + 4)) else {
                break;
            };
            let length = length as usize;
            if length < 8 || pos + length > data.len() {
                break;
            }
            exth.records.push((kind, data[pos + 8..pos + length].to_vec()));
            pos += length;
        }
        exth
    }

    fn values(&self, kind: u32) -> impl Iterator<Item = &[u8]> {
        self.records
            .iter()
            .filter(move |(k, _)| *k == kind)
            .map(|(_, value)| value.as_slice())
    }

    fn number(&self, kind: u32) -> Option<u32> {
        self.values(kind)
            .find_map(|value| be_u32(value, 0))
            .filter(|&n| n != NULL_INDEX)
    }
}

/// Record table and headers of a MOBI file, without the decompressed text.
pub struct MobiBook {
    data: Vec<u8>,
    database_name: String,
    records: Vec<Range<usize>>,
    header: MobiHeader,
    exth: Exth,
}

impl MobiBook {
    pub fn parse(data: Vec<u8>) -> Result<Self> {
        if data.len() < PDB_HEADER_LEN {
            return Err(invalid("file is shorter than a PalmDB header"));
        }

        let kind = &data[60..68];
        if kind != b"BOOKMOBI" && kind != b"TEXtREAd" {
            return Err(invalid(&format!(
                "not a Mobipocket database (type {:?})",
                String::from_utf8_lossy(kind)
            )));
        }

        let name_end = data[..32].iter().position(|&b| b == 0).unwrap_or(32);
        let database_name = String::from_utf8_lossy(&data[..name_end]).into_owned();

        let count = usize::from(be_u16(&data, 76).unwrap_or(0));
        if data.len() < PDB_HEADER_LEN + count * 8 {
            return Err(invalid("truncated PalmDB record table"));
        }

        let offsets: Vec<usize> = (0..count)
            .filter_map(|idx| be_u32(&data, PDB_HEADER_LEN + idx * 8))
            .map(|offset| offset as usize)
            .collect();

        let mut records = Vec::with_capacity(count);
        for (idx, &start) in offsets.iter().enumerate() {
            let end = offsets.get(idx + 1).copied().unwrap_or(data.len());
            if start > end || end > data.len() {
                return Err(invalid(&format!("record {} lies outside the file", idx)));
            }
            records.push(start..end);
        }

        let record0 = records
            .first()
            .map(|range| &data[range.clone()])
            .ok_or_else(|| invalid("database has no records"))?;
        let header = MobiHeader::parse(record0)?;
        let exth = header
            .exth_offset
            .and_then(|offset| record0.get(offset..))
            .map(Exth::parse)
            .unwrap_or_default();

        debug!(
            "MOBI '{}': {} records, {:?} compression, {} text records, {} EXTH entries",
            database_name,
            records.len(),
            header.compression,
            header.text_record_count,
            exth.records.len()
        );

        Ok(Self {
            data,
            database_name,
            records,
            header,
            exth,
        })
    }

    fn record(&self, index: usize) -> Option<&[u8]> {
        self.records.get(index).map(|range| &self.data[range.clone()])
    }

    fn image_record(&self, relative: usize) -> Option<&[u8]> {
        let first = self.header.first_image?;
        self.record(first + relative)
    }

    /// Image bytes of the cover named by the EXTH cover offset.
    pub fn declared_cover(&self) -> Option<&[u8]> {
        let offset = self.exth.number(EXTH_COVER_OFFSET)?;
        self.image_record(offset as usize)
    }

    fn decode<'a>(&self, bytes: &'a [u8]) -> Cow<'a, str> {
        match self.header.encoding {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes),
            TextEncoding::Cp1252 => WINDOWS_1252.decode_without_bom_handling(bytes).0,
        }
    }

    /// Concatenated, decompressed text records.
    fn text_stream(&self) -> Result<Vec<u8>> {
        if self.header.encryption != 0 {
            return Err(invalid("encrypted MOBI files are not supported"));
        }

        let mut huffman = match self.header.compression {
            Compression::Huffman => Some(self.huffman_decoder()?),
            Compression::Unknown(kind) => {
                return Err(invalid(&format!("unknown compression type {:#x}", kind)))
            }
            _ => None,
        };

        let mut text = Vec::new();
        for index in 1..=self.header.text_record_count {
            let Some(record) = self.record(index) else {
                debug!("Text record {} is missing; stopping", index);
                break;
            };
            let record = strip_trailing_entries(record, self.header.extra_data_flags);

            match (&mut huffman, self.header.compression) {
                (Some(decoder), _) => text.extend(decoder.decompress(record)?),
                (None, Compression::PalmDoc) => text.extend(palmdoc_decompress(record)),
                (None, _) => text.extend_from_slice(record),
            }
        }

        if text.last() == Some(&b'#') {
            text.pop();
        }
        Ok(text)
    }

    fn huffman_decoder(&self) -> Result<HuffCdic> {
        let (first, count) = self
            .header
            .huff_records
            .ok_or_else(|| invalid("Huffman compression without HUFF records"))?;

        let huff = self
            .record(first)
            .ok_or_else(|| invalid("HUFF record is missing"))?;
        let cdics: Vec<&[u8]> = (first + 1..first + count)
            .filter_map(|index| self.record(index))
            .collect();

        HuffCdic::new(huff, &cdics)
    }

    fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();

        let format = if self.header.version > 0 {
            format!("MOBI {}", self.header.version)
        } else {
            "PalmDOC".to_string()
        };
        metadata.insert("format".to_string(), format);

        let title = self
            .exth
            .values(EXTH_TITLE)
            .next()
            .or(self.header.full_name.as_deref())
            .map(|bytes| self.decode(bytes).into_owned())
            .unwrap_or_else(|| self.database_name.clone());
        metadata.insert("title".to_string(), title);

        let fields = [
            (EXTH_AUTHOR, "author"),
            (EXTH_PUBLISHER, "publisher"),
            (EXTH_DESCRIPTION, "description"),
            (EXTH_SUBJECT, "subject"),
            (EXTH_DATE, "date"),
            (EXTH_RIGHTS, "rights"),
            (EXTH_LANGUAGE, "language"),
        ];
        for (kind, key) in fields {
            if let Some(value) = self.joined(kind) {
                metadata.insert(key.to_string(), value);
            }
        }

        if let Some(identifier) = self.joined(EXTH_ISBN).or_else(|| self.joined(EXTH_ASIN)) {
            metadata.insert("identifier".to_string(), identifier);
        }

        metadata
    }

    fn joined(&self, kind: u32) -> Option<String> {
        let values: Vec<String> = self
            .exth
            .values(kind)
            .map(|bytes| self.decode(bytes).trim().to_string())
            .filter(|value| !value.is_empty())
            .collect();
        (!values.is_empty()).then(|| values.join(", "))
    }
}

/// A MOBI book with its text decompressed and cut into pages.
pub struct MobiDocument {
    book: MobiBook,
    text: Vec<u8>,
    /// Byte offsets into `text` where each page begins; always starts at 0.
    page_starts: Vec<usize>,
}

impl MobiDocument {
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        let book = MobiBook::parse(data)?;
        let text = book.text_stream()?;

        let mut page_starts = vec![0];
        page_starts.extend(memmem::find_iter(&text, PAGE_BREAK).filter(|&offset| offset > 0));

        debug!(
            "MOBI text is {} bytes in {} pages",
            text.len(),
            page_starts.len()
        );

        Ok(Self {
            book,
            text,
            page_starts,
        })
    }

    fn page_range(&self, page: usize) -> Result<Range<usize>> {
        let start = *self
            .page_starts
            .get(page)
            .ok_or(EbookError::PageOutOfRange {
                page,
                page_count: self.page_starts.len(),
            })?;
        let end = self
            .page_starts
            .get(page + 1)
            .copied()
            .unwrap_or(self.text.len());
        Ok(start..end)
    }

    fn page_html(&self, page: usize) -> Result<String> {
        let range = self.page_range(page)?;
        Ok(self.book.decode(&self.text[range]).replace('\0', ""))
    }

    /// 0-based page holding the byte at `offset`.
    fn page_of_offset(&self, offset: usize) -> usize {
        self.page_starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1)
    }

    /// `filepos` of the guide reference with `type="toc"`.
    fn guide_toc_offset(&self) -> Result<Option<usize>> {
        let reference = Regex::new(r"(?i-u)<reference\b[^>]*>")?;
        let toc_type = Regex::new(r#"(?i-u)\btype\s*=\s*["']?toc\b"#)?;
        let filepos = Regex::new(r#"(?i-u)\bfilepos\s*=\s*["']?(\d+)"#)?;

        let offset = reference
            .find_iter(&self.text)
            .map(|m| m.as_bytes())
            .filter(|tag| toc_type.is_match(tag))
            .find_map(|tag| filepos.captures(tag))
            .and_then(|caps| parse_offset(&caps[1]));
        Ok(offset)
    }
}

impl RenderableDocument for MobiDocument {
    fn page_count(&self) -> usize {
        self.page_starts.len()
    }

    fn text(&mut self, page: usize) -> Result<String> {
        Ok(reflow::page_text(&self.page_html(page)?))
    }

    /// Entries are the `filepos` links of the page the guide's `toc`
    /// reference points at. Books without such a reference have none.
    fn table_of_contents(&mut self) -> Result<Vec<TocEntry>> {
        let Some(toc_offset) = self.guide_toc_offset()? else {
            debug!("No guide reference to a table of contents");
            return Ok(Vec::new());
        };
        if toc_offset >= self.text.len() {
            debug!("ToC filepos {} is past the end of the text", toc_offset);
            return Ok(Vec::new());
        }

        let toc_page = self.page_of_offset(toc_offset);
        let end = self.page_range(toc_page)?.end;
        let segment = self.book.decode(&self.text[toc_offset..end]).replace('\0', "");

        let document = Html::parse_document(&segment);
        let Ok(selector) = Selector::parse("a[filepos]") else {
            return Ok(Vec::new());
        };

        let mut entries = Vec::new();
        for link in document.select(&selector) {
            let Some(offset) = link
                .value()
                .attr("filepos")
                .and_then(|value| parse_offset(value.as_bytes()))
            else {
                continue;
            };
            let title = clean_mobi_title(&link.text().collect::<Vec<_>>().join(" "));
            if title.is_empty() {
                continue;
            }

            entries.push(TocEntry {
                title,
                level: 0,
                page: self.page_of_offset(offset) + 1,
                location: Some(format!("filepos={}", offset)),
            });
        }

        Ok(entries)
    }

    fn image(&mut self, page: usize) -> Result<DynamicImage> {
        let html = self.page_html(page)?;
        let render_error = |reason: &str| EbookError::Render {
            page,
            reason: reason.to_string(),
        };

        let index = first_recindex(&html).ok_or_else(|| render_error("page references no image"))?;
        let bytes = self
            .book
            .image_record(index.saturating_sub(1))
            .ok_or_else(|| render_error("image record is missing"))?;
        Ok(image::load_from_memory(bytes)?)
    }

    fn metadata(&self) -> HashMap<String, String> {
        self.book.metadata()
    }
}

/// Trims a ToC title; `Chapter <n> ...` titles become `第<n>章`.
pub fn clean_mobi_title(title: &str) -> String {
    let title = title.split_whitespace().collect::<Vec<_>>().join(" ");
    if title.to_lowercase().starts_with("chapter") {
        if let Some(number) = title.split_whitespace().nth(1) {
            return format!("第{}章", number);
        }
    }
    title
}

/// File extension for image record bytes, from their magic number.
pub fn image_extension(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        Some("jpg")
    } else if bytes.starts_with(b"\x89PNG") {
        Some("png")
    } else if bytes.starts_with(b"GIF87a") || bytes.starts_with(b"GIF89a") {
        Some("gif")
    } else if bytes.starts_with(b"BM") {
        Some("bmp")
    } else {
        None
    }
}

/// 1-based `recindex` of the first image on a page.
fn first_recindex(html: &str) -> Option<usize> {
    let document = Html::parse_document(html);
    let selector = Selector::parse("img[recindex]").ok()?;
    document
        .select(&selector)
        .find_map(|img| img.value().attr("recindex")?.trim().parse().ok())
}

/// Removes the trailing entries a record carries after its text.
///
/// Every set flag bit above bit 0 adds one entry whose size is a backward
/// varint at the end of the record; bit 0 marks multibyte overlap bytes,
/// stripped last.
fn strip_trailing_entries(record: &[u8], flags: u16) -> &[u8] {
    let mut end = record.len();
    for bit in 1..16 {
        if flags & (1 << bit) != 0 {
            end = end.saturating_sub(trailing_entry_size(&record[..end]));
        }
    }
    if flags & 1 != 0 && end > 0 {
        let overlap = usize::from(record[end - 1] & 0x3) + 1;
        end = end.saturating_sub(overlap);
    }
    &record[..end]
}

fn trailing_entry_size(data: &[u8]) -> usize {
    data[data.len().saturating_sub(4)..]
        .iter()
        .fold(0, |size, &byte| {
            let size = if byte & 0x80 != 0 { 0 } else { size };
            (size << 7) | usize::from(byte & 0x7F)
        })
}

fn parse_offset(digits: &[u8]) -> Option<usize> {
    std::str::from_utf8(digits).ok()?.trim().parse().ok()
}

fn invalid(reason: &str) -> EbookError {
    EbookError::InvalidContainer {
        reason: reason.to_string(),
    }
}

fn be_u16(data: &[u8], at: usize) -> Option<u16> {
    data.get(at..at + 2)?.try_into().ok().map(u16::from_be_bytes)
}

fn be_u32(data: &[u8], at: usize) -> Option<u32> {
    data.get(at..at + 4)?.try_into().ok().map(u32::from_be_bytes)
}
