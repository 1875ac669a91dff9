use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// One table-of-contents entry as reported by a document backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TocEntry {
    pub title: String,
    /// Nesting depth, 0 for top-level entries.
    pub level: usize,
    /// 1-based page the entry starts on.
    pub page: usize,
    pub location: Option<String>,
}

impl TocEntry {
    pub fn new(title: impl Into<String>, level: usize, page: usize) -> Self {
        Self {
            title: title.into(),
            level,
            page,
            location: None,
        }
    }
}

/// Half-open page range `[start_page, end_page)`, 0-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterRange {
    pub start_page: usize,
    pub end_page: usize,
}

impl ChapterRange {
    pub fn len(&self) -> usize {
        self.end_page.saturating_sub(self.start_page)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Text,
    Heading,
    Image,
    Table,
    List,
    Quote,
    Code,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentBlock {
    #[serde(rename = "type")]
    pub content_type: ContentType,
    /// Heading depth or list nesting depth.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<usize>,
    pub content: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ContentBlock>,
}

impl ContentBlock {
    pub fn new(content_type: ContentType, content: impl Into<String>) -> Self {
        Self {
            content_type,
            level: None,
            content: content.into(),
            metadata: BTreeMap::new(),
            children: Vec::new(),
        }
    }

    pub fn with_level(mut self, level: usize) -> Self {
        self.level = Some(level);
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<String>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chapter {
    pub title: String,
    pub raw_content: Vec<String>,
    pub structured_content: Vec<ContentBlock>,
    pub level: usize,
}

impl fmt::Display for Chapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "== {} ==", self.title)?;

        for block in &self.structured_content {
            match block.content_type {
                ContentType::Heading => {
                    let level = block.level.unwrap_or(1);
                    write!(f, "{} {}", "#".repeat(level), block.content)?;
                }
                ContentType::Text | ContentType::Table => write!(f, "{}", block.content)?,
                ContentType::List => {
                    let depth = block.level.unwrap_or(1).saturating_sub(1);
                    write!(f, "{}- {}", "  ".repeat(depth), block.content)?;
                }
                ContentType::Quote => write!(f, "> {}", block.content)?,
                ContentType::Code => {
                    let language = block.metadata.get("language").map(String::as_str);
                    write!(f, "```{}\n{}\n```", language.unwrap_or(""), block.content)?;
                }
                ContentType::Image => {
                    let url = block.metadata.get("url").map(String::as_str);
                    write!(f, "![{}]({})", block.content, url.unwrap_or(""))?;
                }
            }
            writeln!(f)?;
        }

        Ok(())
    }
}

/// Lightweight chapter preview: no content payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChapterStructure {
    pub title: String,
    pub level: usize,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoverOutcome {
    Extracted(PathBuf),
    /// The book declares no cover image. Not a failure.
    NoCover,
}

#[derive(Debug, Clone)]
pub struct ExtractConfig {
    pub output_dir: PathBuf,
    pub jpeg_quality: u8,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./output"),
            jpeg_quality: 95,
        }
    }
}

/// Report written next to extracted chapters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChapterReport {
    pub source: String,
    pub extracted_at: String,
    pub total_chapters: usize,
    pub chapters: Vec<Chapter>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_block_json_shape() {
        let heading = ContentBlock::new(ContentType::Heading, "Title").with_level(1);
        let json = serde_json::to_value(&heading).unwrap();

        assert_eq!(json["type"], "heading");
        assert_eq!(json["level"], 1);
        assert!(json.get("metadata").is_none());
        assert!(json.get("children").is_none());

        let text = ContentBlock::new(ContentType::Text, "plain");
        let json = serde_json::to_value(&text).unwrap();
        assert!(json.get("level").is_none());
    }

    #[test]
    fn test_chapter_display() {
        let chapter = Chapter {
            title: "One".to_string(),
            raw_content: Vec::new(),
            structured_content: vec![
                ContentBlock::new(ContentType::Heading, "Start").with_level(2),
                ContentBlock::new(ContentType::List, "nested").with_level(2),
                ContentBlock::new(ContentType::Code, "let x = 1;").with_metadata("language", "rust"),
                ContentBlock::new(ContentType::Quote, "said"),
            ],
            level: 1,
        };

        assert_eq!(
            chapter.to_string(),
            "== One ==\n## Start\n  - nested\n```rust\nlet x = 1;\n```\n> said\n"
        );
    }

    #[test]
    fn test_chapter_range_len() {
        let range = ChapterRange { start_page: 3, end_page: 3 };
        assert!(range.is_empty());
        assert_eq!(ChapterRange { start_page: 1, end_page: 4 }.len(), 3);

        let inverted = ChapterRange { start_page: 5, end_page: 2 };
        assert_eq!(inverted.len(), 0);
        assert!(inverted.is_empty());
    }
}
