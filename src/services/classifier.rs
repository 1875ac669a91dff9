use crate::error::Result;
use crate::types::{ContentBlock, ContentType};
use regex::Regex;
use tracing::debug;

const FENCE: &str = "```";

/// Turns chapter text into typed content blocks.
///
/// The classifier only holds compiled patterns; all per-call state lives in
/// [`ClassifyState`], created fresh by every [`ContentClassifier::classify`]
/// call, so one instance can serve any number of calls and threads.
pub struct ContentClassifier {
    image_pattern: Regex,
    image_alt_pattern: Regex,
    image_url_pattern: Regex,
    ordered_list_pattern: Regex,
}

#[derive(Default)]
struct ClassifyState {
    blocks: Vec<ContentBlock>,
    /// Open fenced code block being filled.
    code: Option<ContentBlock>,
    /// Indentation of the first item in the current run of list items.
    list_base_indent: Option<usize>,
}

impl ClassifyState {
    fn close_code(&mut self) {
        if let Some(mut code) = self.code.take() {
            let trimmed = code.content.trim_end().len();
            code.content.truncate(trimmed);
            self.blocks.push(code);
        }
    }
}

impl ContentClassifier {
    pub fn new() -> Result<Self> {
        Ok(Self {
            image_pattern: Regex::new(r"!\[.*?\]\(.*?\)")?,
            image_alt_pattern: Regex::new(r"!\[(.*?)\]")?,
            image_url_pattern: Regex::new(r"\((.*?)\)")?,
            ordered_list_pattern: Regex::new(r"^\d+\.\s")?,
        })
    }

    pub fn classify(&self, text: &str) -> Vec<ContentBlock> {
        let mut state = ClassifyState::default();

        for raw_line in text.lines() {
            if state.code.is_some() {
                if raw_line.trim() == FENCE {
                    state.close_code();
                } else if let Some(code) = state.code.as_mut() {
                    let line = raw_line.trim_end();
                    // Leading blank lines inside the fence are dropped.
                    if !code.content.is_empty() {
                        code.content.push('\n');
                        code.content.push_str(line);
                    } else if !line.is_empty() {
                        code.content.push_str(line);
                    }
                }
                continue;
            }

            let line = raw_line.trim();
            if line.is_empty() {
                continue;
            }

            let block = self.classify_line(raw_line, line, &mut state);
            if block.content_type != ContentType::List {
                state.list_base_indent = None;
            }

            if block.content_type == ContentType::Code {
                state.code = Some(block);
            } else {
                state.blocks.push(block);
            }
        }

        // Unterminated fence runs to the end of the text.
        state.close_code();

        let merged = merge_text_blocks(state.blocks);
        debug!("Classified text into {} blocks", merged.len());
        merged
    }

    /// Classifies one non-blank line. `raw_line` keeps the original
    /// indentation, `line` is trimmed.
    fn classify_line(&self, raw_line: &str, line: &str, state: &mut ClassifyState) -> ContentBlock {
        if let Some(language) = line.strip_prefix(FENCE) {
            let language = language.split_whitespace().next().unwrap_or_default();
            return ContentBlock::new(ContentType::Code, "").with_metadata("language", language);
        }

        if self.image_pattern.is_match(line) {
            return self.image_block(line);
        }

        if let Some(level) = heading_level(line) {
            return ContentBlock::new(ContentType::Heading, strip_heading_markers(line))
                .with_level(level);
        }

        if let Some(content) = self.strip_list_marker(line) {
            let indent = raw_line.chars().take_while(|c| c.is_whitespace()).count();
            let base = *state.list_base_indent.get_or_insert(indent);
            let level = indent.saturating_sub(base) / 2 + 1;
            return ContentBlock::new(ContentType::List, content).with_level(level);
        }

        if let Some(quoted) = line.strip_prefix('>') {
            return ContentBlock::new(ContentType::Quote, quoted.trim());
        }

        if line.contains('|') && (line.starts_with('|') || line.ends_with('|')) {
            return ContentBlock::new(ContentType::Table, line);
        }

        ContentBlock::new(ContentType::Text, line)
    }

    fn image_block(&self, line: &str) -> ContentBlock {
        let alt = self
            .image_alt_pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());
        let url = self
            .image_url_pattern
            .captures(line)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string());

        let mut block = ContentBlock::new(ContentType::Image, alt.clone().unwrap_or_default());
        if let Some(alt) = alt {
            block = block.with_metadata("alt", alt);
        }
        if let Some(url) = url {
            block = block.with_metadata("url", url);
        }
        block
    }

    fn strip_list_marker<'a>(&self, line: &'a str) -> Option<&'a str> {
        if let Some(rest) = line.strip_prefix("- ").or_else(|| line.strip_prefix("* ")) {
            return Some(rest.trim());
        }

        self.ordered_list_pattern
            .find(line)
            .map(|marker| line[marker.end()..].trim())
    }
}

fn heading_level(line: &str) -> Option<usize> {
    let hashes = line.chars().take_while(|&c| c == '#').count();
    if hashes > 0 {
        Some(hashes)
    } else if line.ends_with("===") {
        Some(1)
    } else if line.ends_with("---") {
        Some(2)
    } else {
        None
    }
}

fn strip_heading_markers(line: &str) -> &str {
    if line.starts_with('#') {
        line.trim_start_matches(|c: char| c == '#' || c.is_whitespace())
            .trim()
    } else {
        line.trim_end_matches(['=', '-']).trim()
    }
}

/// Joins each run of consecutive Text blocks into one block.
fn merge_text_blocks(blocks: Vec<ContentBlock>) -> Vec<ContentBlock> {
    let mut merged: Vec<ContentBlock> = Vec::with_capacity(blocks.len());

    for block in blocks {
        match merged.last_mut() {
            Some(previous)
                if previous.content_type == ContentType::Text
                    && block.content_type == ContentType::Text =>
            {
                previous.content.push('\n');
                previous.content.push_str(&block.content);
            }
            _ => merged.push(block),
        }
    }

    merged
}
