//! Reflows an XHTML content document into plain text lines.
//!
//! Block structure survives as light markdown markers (`#` headings, `-`
//! list items, `>` quotes, fenced `pre`, `|` table rows, `![alt](src)`
//! images) so the content classifier can recover it.

use scraper::{ElementRef, Html, Node};

const BLOCK_TAGS: &[&str] = &[
    "address", "article", "aside", "body", "dd", "div", "dl", "dt", "figcaption", "figure",
    "footer", "header", "html", "main", "nav", "p", "section", "table", "tbody", "td", "tfoot",
    "th", "thead",
];

pub fn page_lines(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    let mut reflow = Reflow::default();
    reflow.element(document.root_element());
    reflow.flush();
    reflow.lines
}

pub fn page_text(html: &str) -> String {
    page_lines(html).join("\n")
}

#[derive(Default)]
struct Reflow {
    lines: Vec<String>,
    inline: String,
}

impl Reflow {
    fn element(&mut self, el: ElementRef<'_>) {
        let name = el.value().name();

        match name {
            "head" | "script" | "style" | "title" => {}
            "h1" | "h2" | "h3" | "h4" | "h5" | "h6" => {
                self.flush();
                let level = usize::from(name.as_bytes()[1] - b'0');
                let text = collapse(&gather_text(el, false));
                if !text.is_empty() {
                    self.lines.push(format!("{} {}", "#".repeat(level), text));
                }
            }
            "pre" => {
                self.flush();
                self.lines.push(format!("```{}", code_language(el).unwrap_or_default()));
                let code: String = el.text().collect();
                for line in code.trim_matches('\n').lines() {
                    self.lines.push(line.trim_end().to_string());
                }
                self.lines.push("```".to_string());
            }
            "blockquote" => {
                self.flush();
                let text = collapse(&gather_text(el, false));
                if !text.is_empty() {
                    self.lines.push(format!("> {}", text));
                }
            }
            "ul" | "ol" => {
                self.flush();
                self.list(el, 0);
            }
            "li" => {
                self.flush();
                self.list_item(el, 0, None);
            }
            "tr" => {
                self.flush();
                let cells: Vec<String> = el
                    .children()
                    .filter_map(ElementRef::wrap)
                    .filter(|c| matches!(c.value().name(), "td" | "th"))
                    .map(|c| collapse(&gather_text(c, false)))
                    .collect();
                if !cells.is_empty() {
                    self.lines.push(format!("| {} |", cells.join(" | ")));
                }
            }
            "img" => {
                self.flush();
                if let Some(src) = el.value().attr("src") {
                    let alt = el.value().attr("alt").unwrap_or_default();
                    self.lines.push(format!("![{}]({})", alt.trim(), src));
                }
            }
            "br" | "hr" => self.flush(),
            _ if BLOCK_TAGS.contains(&name) => {
                self.flush();
                self.children(el);
                self.flush();
            }
            _ => self.children(el),
        }
    }

    fn children(&mut self, el: ElementRef<'_>) {
        for child in el.children() {
            if let Some(child_el) = ElementRef::wrap(child) {
                self.element(child_el);
            } else if let Node::Text(text) = child.value() {
                self.inline.push_str(text);
            }
        }
    }

    fn list(&mut self, list: ElementRef<'_>, depth: usize) {
        let ordered = list.value().name() == "ol";
        let items = list
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| c.value().name() == "li");

        for (idx, item) in items.enumerate() {
            self.list_item(item, depth, ordered.then_some(idx + 1));
        }
    }

    fn list_item(&mut self, item: ElementRef<'_>, depth: usize, ordinal: Option<usize>) {
        let marker = match ordinal {
            Some(n) => format!("{}. ", n),
            None => "- ".to_string(),
        };

        let text = collapse(&gather_text(item, true));
        if !text.is_empty() {
            self.lines
                .push(format!("{}{}{}", "  ".repeat(depth), marker, text));
        }

        for nested in item
            .children()
            .filter_map(ElementRef::wrap)
            .filter(|c| matches!(c.value().name(), "ul" | "ol"))
        {
            self.list(nested, depth + 1);
        }
    }

    fn flush(&mut self) {
        let text = collapse(&self.inline);
        if !text.is_empty() {
            self.lines.push(text);
        }
        self.inline.clear();
    }
}

fn gather_text(el: ElementRef<'_>, skip_lists: bool) -> String {
    let mut out = String::new();
    gather_into(el, skip_lists, &mut out);
    out
}

fn gather_into(el: ElementRef<'_>, skip_lists: bool, out: &mut String) {
    for child in el.children() {
        if let Some(child_el) = ElementRef::wrap(child) {
            let name = child_el.value().name();
            if matches!(name, "script" | "style") || (skip_lists && matches!(name, "ul" | "ol")) {
                continue;
            }
            gather_into(child_el, skip_lists, out);
            if name == "br" || BLOCK_TAGS.contains(&name) {
                out.push(' ');
            }
        } else if let Node::Text(text) = child.value() {
            out.push_str(text);
        }
    }
}

fn collapse(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Language from a `language-*` / `lang-*` class on the `pre` or its `code` child.
fn code_language(pre: ElementRef<'_>) -> Option<String> {
    let code_children = pre
        .children()
        .filter_map(ElementRef::wrap)
        .filter(|c| c.value().name() == "code");

    std::iter::once(pre)
        .chain(code_children)
        .flat_map(|el| el.value().classes())
        .find_map(|class| {
            class
                .strip_prefix("language-")
                .or_else(|| class.strip_prefix("lang-"))
                .map(str::to_string)
        })
}
