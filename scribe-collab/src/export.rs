//! Export of document content to Markdown, HTML and PDF.
//!
//! Content arrives as the block tree the edit surface emits:
//!
//! ```text
//! { "type": "doc", "content": [
//!     { "type": "heading", "attrs": { "level": 1 }, "content": [ { "type": "text", "text": "Plan" } ] },
//!     { "type": "paragraph", "content": [
//!         { "type": "text", "text": "ship ", "marks": [ { "type": "bold" } ] } ] } ] }
//! ```
//!
//! Markdown and HTML are produced here. PDF production is delegated to an
//! injected [`PdfRenderer`] fed with the HTML document.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt::Write as _;
use std::sync::Arc;

use crate::protocol::{Document, Snapshot};

/// Export failures.
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("content is not a valid block tree: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("no PDF renderer installed")]
    PdfUnavailable,
    #[error("PDF rendering failed: {0}")]
    Render(String),
}

/// Output formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExportFormat {
    Markdown,
    Html,
    Pdf,
}

impl ExportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Markdown => "md",
            ExportFormat::Html => "html",
            ExportFormat::Pdf => "pdf",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            ExportFormat::Markdown => "text/markdown",
            ExportFormat::Html => "text/html",
            ExportFormat::Pdf => "application/pdf",
        }
    }
}

/// Inline formatting attached to a text node.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Mark {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

/// One node of the content tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ContentNode {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ContentNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub marks: Vec<Mark>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub attrs: Map<String, Value>,
}

impl ContentNode {
    pub fn from_json(json: &str) -> Result<Self, ExportError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Parse a snapshot holding a JSON block tree.
    pub fn from_snapshot(snapshot: &Snapshot) -> Result<Self, ExportError> {
        Ok(serde_json::from_slice(snapshot.as_bytes())?)
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).and_then(Value::as_str)
    }

    pub fn attr_u64(&self, key: &str) -> Option<u64> {
        self.attrs.get(key).and_then(Value::as_u64)
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attrs.get(key).and_then(Value::as_bool)
    }

    /// Concatenated text of all descendants.
    pub fn plain_text(&self) -> String {
        let mut out = String::new();
        self.collect_text(&mut out);
        out
    }

    fn collect_text(&self, out: &mut String) {
        if let Some(text) = &self.text {
            out.push_str(text);
        }
        for child in &self.content {
            child.collect_text(out);
        }
    }
}

/// Produces PDF bytes from a standalone HTML document.
pub trait PdfRenderer: Send + Sync {
    fn render(&self, title: &str, html: &str) -> Result<Vec<u8>, ExportError>;
}

/// Stateless Markdown / HTML serializer.
pub struct Exporter;

impl Exporter {
    pub fn to_markdown(root: &ContentNode) -> String {
        let mut out = markdown_block(root);
        while out.ends_with('\n') {
            out.pop();
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out
    }

    /// HTML fragment for the content tree.
    pub fn to_html(root: &ContentNode) -> String {
        let mut out = String::new();
        html_node(root, &mut out);
        out
    }

    /// Standalone HTML page with `title` as its title.
    pub fn to_html_document(title: &str, root: &ContentNode) -> String {
        format!(
            "<!DOCTYPE html>\n<html>\n<head>\n<meta charset=\"utf-8\">\n<title>{}</title>\n</head>\n<body>\n{}\n</body>\n</html>\n",
            escape_html(title),
            Self::to_html(root)
        )
    }
}

// ─── Markdown ──────────────────────────────────────────────────────────

fn markdown_children(node: &ContentNode, separator: &str) -> String {
    node.content
        .iter()
        .map(markdown_block)
        .filter(|block| !block.is_empty())
        .collect::<Vec<_>>()
        .join(separator)
}

fn markdown_block(node: &ContentNode) -> String {
    match node.kind.as_str() {
        "doc" => markdown_children(node, "\n\n"),
        "paragraph" => markdown_inline(&node.content),
        "heading" => {
            let level = node.attr_u64("level").unwrap_or(1).clamp(1, 6) as usize;
            format!("{} {}", "#".repeat(level), markdown_inline(&node.content))
        }
        "blockquote" => markdown_children(node, "\n\n")
            .lines()
            .map(|line| if line.is_empty() { ">".to_string() } else { format!("> {line}") })
            .collect::<Vec<_>>()
            .join("\n"),
        "codeBlock" => format!(
            "```{}\n{}\n```",
            node.attr_str("language").unwrap_or_default(),
            node.plain_text()
        ),
        "horizontalRule" => "---".to_string(),
        "image" => format!(
            "![{}]({})",
            node.attr_str("alt").unwrap_or_default(),
            node.attr_str("src").unwrap_or_default()
        ),
        "bulletList" => markdown_list(node, |_| "- ".to_string()),
        "orderedList" => {
            let start = node.attr_u64("start").unwrap_or(1);
            markdown_list(node, |i| format!("{}. ", start.saturating_add(i as u64)))
        }
        "taskList" => markdown_list(node, |_| "- ".to_string()),
        "text" | "hardBreak" => markdown_inline(std::slice::from_ref(node)),
        _ => markdown_children(node, "\n\n"),
    }
}

fn markdown_list(node: &ContentNode, marker: impl Fn(usize) -> String) -> String {
    node.content
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let mut prefix = marker(i);
            if item.kind == "taskItem" {
                let checked = item.attr_bool("checked").unwrap_or(false);
                prefix.push_str(if checked { "[x] " } else { "[ ] " });
            }
            let indent = " ".repeat(marker(i).len());
            let body = markdown_children(item, "\n");
            let mut lines = body.lines();
            let mut out = format!("{prefix}{}", lines.next().unwrap_or_default());
            for line in lines {
                out.push('\n');
                if !line.is_empty() {
                    out.push_str(&indent);
                    out.push_str(line);
                }
            }
            out
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn markdown_inline(nodes: &[ContentNode]) -> String {
    let mut out = String::new();
    for node in nodes {
        match node.kind.as_str() {
            "text" => {
                let text = node.text.as_deref().unwrap_or_default();
                out.push_str(&markdown_marked(text, &node.marks));
            }
            "hardBreak" => out.push_str("  \n"),
            "image" => out.push_str(&markdown_block(node)),
            _ => out.push_str(&markdown_inline(&node.content)),
        }
    }
    out
}

fn markdown_marked(text: &str, marks: &[Mark]) -> String {
    if marks.iter().any(|m| m.kind == "code") {
        return format!("`{text}`");
    }
    let mut out = escape_markdown(text);
    for mark in marks {
        out = match mark.kind.as_str() {
            "bold" => format!("**{out}**"),
            "italic" => format!("*{out}*"),
            "strike" => format!("~~{out}~~"),
            "link" => {
                let href = mark.attrs.get("href").and_then(Value::as_str).unwrap_or_default();
                format!("[{out}]({href})")
            }
            _ => out,
        };
    }
    out
}

fn escape_markdown(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '\\' | '*' | '_' | '`' | '[' | ']') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ─── HTML ──────────────────────────────────────────────────────────────

fn html_children(node: &ContentNode, out: &mut String) {
    for child in &node.content {
        html_node(child, out);
    }
}

fn html_wrapped(tag: &str, node: &ContentNode, out: &mut String) {
    let _ = write!(out, "<{tag}>");
    html_children(node, out);
    let _ = write!(out, "</{tag}>");
}

fn html_node(node: &ContentNode, out: &mut String) {
    match node.kind.as_str() {
        "doc" => html_children(node, out),
        "paragraph" => html_wrapped("p", node, out),
        "heading" => {
            let level = node.attr_u64("level").unwrap_or(1).clamp(1, 6);
            html_wrapped(&format!("h{level}"), node, out);
        }
        "blockquote" => html_wrapped("blockquote", node, out),
        "bulletList" => html_wrapped("ul", node, out),
        "orderedList" => match node.attr_u64("start") {
            Some(start) if start != 1 => {
                let _ = write!(out, "<ol start=\"{start}\">");
                html_children(node, out);
                out.push_str("</ol>");
            }
            _ => html_wrapped("ol", node, out),
        },
        "listItem" => html_wrapped("li", node, out),
        "taskList" => {
            out.push_str("<ul data-type=\"taskList\">");
            html_children(node, out);
            out.push_str("</ul>");
        }
        "taskItem" => {
            let checked = node.attr_bool("checked").unwrap_or(false);
            let _ = write!(out, "<li data-checked=\"{checked}\">");
            html_children(node, out);
            out.push_str("</li>");
        }
        "codeBlock" => {
            match node.attr_str("language") {
                Some(lang) if !lang.is_empty() => {
                    let _ = write!(out, "<pre><code class=\"language-{}\">", escape_html(lang));
                }
                _ => out.push_str("<pre><code>"),
            }
            out.push_str(&escape_html(&node.plain_text()));
            out.push_str("</code></pre>");
        }
        "horizontalRule" => out.push_str("<hr>"),
        "hardBreak" => out.push_str("<br>"),
        "image" => {
            let _ = write!(
                out,
                "<img src=\"{}\" alt=\"{}\">",
                escape_html(node.attr_str("src").unwrap_or_default()),
                escape_html(node.attr_str("alt").unwrap_or_default())
            );
        }
        "text" => {
            let text = node.text.as_deref().unwrap_or_default();
            out.push_str(&html_marked(text, &node.marks));
        }
        _ => html_children(node, out),
    }
}

fn html_marked(text: &str, marks: &[Mark]) -> String {
    let mut out = escape_html(text);
    for mark in marks {
        out = match mark.kind.as_str() {
            "bold" => format!("<strong>{out}</strong>"),
            "italic" => format!("<em>{out}</em>"),
            "strike" => format!("<s>{out}</s>"),
            "underline" => format!("<u>{out}</u>"),
            "code" => format!("<code>{out}</code>"),
            "link" => {
                let href = mark.attrs.get("href").and_then(Value::as_str).unwrap_or_default();
                format!("<a href=\"{}\">{out}</a>", escape_html(href))
            }
            _ => out,
        };
    }
    out
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

// ─── Pipeline ──────────────────────────────────────────────────────────

/// Export entry point. Runs only on explicit request.
#[derive(Clone, Default)]
pub struct ExportPipeline {
    pdf: Option<Arc<dyn PdfRenderer>>,
}

impl ExportPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pdf_renderer(renderer: Arc<dyn PdfRenderer>) -> Self {
        Self { pdf: Some(renderer) }
    }

    pub fn supports(&self, format: ExportFormat) -> bool {
        format != ExportFormat::Pdf || self.pdf.is_some()
    }

    pub fn to_pdf(&self, title: &str, root: &ContentNode) -> Result<Vec<u8>, ExportError> {
        let renderer = self.pdf.as_ref().ok_or(ExportError::PdfUnavailable)?;
        renderer.render(title, &Exporter::to_html_document(title, root))
    }

    /// Serialize `root` in `format`.
    pub fn export(
        &self,
        title: &str,
        root: &ContentNode,
        format: ExportFormat,
    ) -> Result<Vec<u8>, ExportError> {
        log::debug!("Exporting '{title}' as {format:?}");
        match format {
            ExportFormat::Markdown => Ok(Exporter::to_markdown(root).into_bytes()),
            ExportFormat::Html => Ok(Exporter::to_html_document(title, root).into_bytes()),
            ExportFormat::Pdf => self.to_pdf(title, root),
        }
    }

    /// Export a stored document whose content is a JSON block tree. An
    /// absent content exports as an empty document.
    pub fn export_document(
        &self,
        document: &Document,
        format: ExportFormat,
    ) -> Result<Vec<u8>, ExportError> {
        let root = match &document.content {
            Some(snapshot) => ContentNode::from_snapshot(snapshot)?,
            None => ContentNode { kind: "doc".into(), ..ContentNode::default() },
        };
        self.export(&document.title, &root, format)
    }

    /// Download name: the title with path-hostile characters replaced.
    pub fn file_name(title: &str, format: ExportFormat) -> String {
        let stem: String = title
            .trim()
            .chars()
            .map(|c| if matches!(c, '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|') { '_' } else { c })
            .collect();
        let stem = if stem.is_empty() { Document::DEFAULT_TITLE.to_string() } else { stem };
        format!("{stem}.{}", format.extension())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const SAMPLE: &str = r#"{
        "type": "doc",
        "content": [
            { "type": "heading", "attrs": { "level": 2 }, "content": [ { "type": "text", "text": "Plan" } ] },
            { "type": "paragraph", "content": [
                { "type": "text", "text": "Ship " },
                { "type": "text", "text": "today", "marks": [ { "type": "bold" } ] },
                { "type": "text", "text": " via " },
                { "type": "text", "text": "docs", "marks": [ { "type": "link", "attrs": { "href": "https://example.com" } } ] }
            ] },
            { "type": "bulletList", "content": [
                { "type": "listItem", "content": [ { "type": "paragraph", "content": [ { "type": "text", "text": "one" } ] } ] },
                { "type": "listItem", "content": [ { "type": "paragraph", "content": [ { "type": "text", "text": "two" } ] } ] }
            ] },
            { "type": "codeBlock", "attrs": { "language": "rust" }, "content": [ { "type": "text", "text": "let x = 1 < 2;" } ] }
        ]
    }"#;

    struct FakePdf;

    impl PdfRenderer for FakePdf {
        fn render(&self, title: &str, html: &str) -> Result<Vec<u8>, ExportError> {
            assert!(html.contains("<title>"));
            Ok(format!("%PDF {title}").into_bytes())
        }
    }

    #[test]
    fn test_markdown() {
        let root = ContentNode::from_json(SAMPLE).unwrap();
        let md = Exporter::to_markdown(&root);
        assert_eq!(
            md,
            "## Plan\n\nShip **today** via [docs](https://example.com)\n\n- one\n- two\n\n```rust\nlet x = 1 < 2;\n```\n"
        );
    }

    #[test]
    fn test_html_escapes_text() {
        let root = ContentNode::from_json(SAMPLE).unwrap();
        let html = Exporter::to_html(&root);
        assert!(html.starts_with("<h2>Plan</h2><p>Ship <strong>today</strong>"));
        assert!(html.contains("<a href=\"https://example.com\">docs</a>"));
        assert!(html.contains("<ul><li><p>one</p></li><li><p>two</p></li></ul>"));
        assert!(html.contains("<pre><code class=\"language-rust\">let x = 1 &lt; 2;</code></pre>"));
    }

    #[test]
    fn test_ordered_and_task_lists() {
        let root = ContentNode::from_json(
            r#"{ "type": "doc", "content": [
                { "type": "orderedList", "attrs": { "start": 3 }, "content": [
                    { "type": "listItem", "content": [ { "type": "paragraph", "content": [ { "type": "text", "text": "c" } ] } ] },
                    { "type": "listItem", "content": [ { "type": "paragraph", "content": [ { "type": "text", "text": "d" } ] } ] }
                ] },
                { "type": "taskList", "content": [
                    { "type": "taskItem", "attrs": { "checked": true }, "content": [ { "type": "paragraph", "content": [ { "type": "text", "text": "done" } ] } ] }
                ] }
            ] }"#,
        )
        .unwrap();
        assert_eq!(Exporter::to_markdown(&root), "3. c\n4. d\n\n- [x] done\n");
        assert!(Exporter::to_html(&root).starts_with("<ol start=\"3\">"));
    }

    #[test]
    fn test_ordered_list_start_at_max_does_not_overflow() {
        let root = ContentNode::from_json(&format!(
            r#"{{ "type": "orderedList", "attrs": {{ "start": {} }}, "content": [
                {{ "type": "listItem", "content": [ {{ "type": "paragraph", "content": [ {{ "type": "text", "text": "a" }} ] }} ] }},
                {{ "type": "listItem", "content": [ {{ "type": "paragraph", "content": [ {{ "type": "text", "text": "b" }} ] }} ] }}
            ] }}"#,
            u64::MAX
        ))
        .unwrap();
        let markdown = Exporter::to_markdown(&root);
        assert_eq!(markdown.matches(&format!("{}. ", u64::MAX)).count(), 2);
        assert!(!markdown.contains("0. "));
    }

    #[test]
    fn test_markdown_escapes_specials() {
        let root = ContentNode::from_json(
            r#"{ "type": "paragraph", "content": [ { "type": "text", "text": "snake_case *x*" } ] }"#,
        )
        .unwrap();
        assert_eq!(Exporter::to_markdown(&root), "snake\\_case \\*x\\*\n");
    }

    #[test]
    fn test_pdf_requires_renderer() {
        let root = ContentNode::from_json(SAMPLE).unwrap();
        let pipeline = ExportPipeline::new();
        assert!(!pipeline.supports(ExportFormat::Pdf));
        assert!(matches!(pipeline.to_pdf("Plan", &root), Err(ExportError::PdfUnavailable)));

        let pipeline = ExportPipeline::with_pdf_renderer(Arc::new(FakePdf));
        assert_eq!(pipeline.export("Plan", &root, ExportFormat::Pdf).unwrap(), b"%PDF Plan");
    }

    #[test]
    fn test_export_document() {
        let mut document = Document::new(Uuid::new_v4());
        document.title = "Notes <draft>".into();
        let pipeline = ExportPipeline::new();

        let empty = pipeline.export_document(&document, ExportFormat::Markdown).unwrap();
        assert!(empty.is_empty());

        document.content = Some(Snapshot::from(SAMPLE));
        let html = String::from_utf8(pipeline.export_document(&document, ExportFormat::Html).unwrap()).unwrap();
        assert!(html.contains("<title>Notes &lt;draft&gt;</title>"));

        document.content = Some(Snapshot::from("not json"));
        assert!(matches!(
            pipeline.export_document(&document, ExportFormat::Markdown),
            Err(ExportError::Parse(_))
        ));
    }

    #[test]
    fn test_file_name() {
        assert_eq!(ExportPipeline::file_name("Q3: plan/draft", ExportFormat::Markdown), "Q3_ plan_draft.md");
        assert_eq!(ExportPipeline::file_name("   ", ExportFormat::Pdf), "Untitled.pdf");
    }
}
