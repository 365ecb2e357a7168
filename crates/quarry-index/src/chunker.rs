//! Symbol-aligned chunking via tree-sitter with a line-window fallback.
//!
//! [`CodeChunker::parse`] never fails: malformed, binary-looking or
//! unsupported input is split into fixed line windows instead, and every
//! file yields at least one chunk.

use tree_sitter::{Node, Parser};

use crate::error::{IndexError, Result};
use crate::languages::{Lang, XrefRole};

/// Lines per window when structural chunking is not possible.
pub const FALLBACK_WINDOW_LINES: usize = 50;
/// Content above this size is never handed to the parser.
pub const MAX_PARSE_BYTES: usize = 1024 * 1024;
/// `|count('{') - count('}')|` above this marks content as garbage.
pub const MAX_BRACE_DELTA: usize = 100;
/// Symbol name of the single chunk produced for empty content.
pub const EMPTY_SENTINEL: &str = "<empty>";

const MIN_CHUNK_LINES: usize = 10;
const MIN_CHUNK_CHARS: usize = 100;
const ANONYMOUS: &str = "<anonymous>";

/// One contiguous slice of a file. Lines are 1-based and inclusive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub content: String,
    pub start_line: usize,
    pub end_line: usize,
    pub token_estimate: usize,
    pub symbol_name: Option<String>,
    pub symbol_type: Option<String>,
    pub index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Symbol {
    pub name: String,
    /// Grammar node kind, e.g. `function_item`.
    pub kind: String,
    pub start_line: usize,
    pub end_line: usize,
    pub lang: Lang,
    pub source: String,
    pub doc: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XrefKind {
    Import,
    Export,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Xref {
    pub kind: XrefKind,
    pub target: String,
    pub line: usize,
}

/// Why structural chunking was skipped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackReason {
    Empty,
    WhitespaceOnly,
    NotUtf8,
    NullBytes,
    ControlCharacters,
    TooLarge { bytes: usize },
    UnbalancedBraces { delta: usize },
    NoGrammar,
    ParseFailed(String),
}

impl std::fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => f.write_str("empty content"),
            Self::WhitespaceOnly => f.write_str("whitespace-only content"),
            Self::NotUtf8 => f.write_str("content is not valid UTF-8"),
            Self::NullBytes => f.write_str("content contains null bytes"),
            Self::ControlCharacters => f.write_str("content contains control characters"),
            Self::TooLarge { bytes } => write!(f, "content too large ({bytes} bytes)"),
            Self::UnbalancedBraces { delta } => write!(f, "brace balance off by {delta}"),
            Self::NoGrammar => f.write_str("no grammar for language"),
            Self::ParseFailed(msg) => write!(f, "parse failed: {msg}"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub chunks: Vec<Chunk>,
    pub symbols: Vec<Symbol>,
    pub xrefs: Vec<Xref>,
    /// Set when line windows were used instead of the syntax tree.
    pub fallback: Option<FallbackReason>,
}

/// `ceil(chars / 4)`.
#[must_use]
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// A chunking strategy.
pub trait Chunker: Send + Sync {
    fn is_available(&self, lang: Lang) -> bool;

    /// # Errors
    ///
    /// Returns [`IndexError::Parse`] or [`IndexError::UnsupportedLanguage`]
    /// when this strategy cannot handle the content.
    fn chunk(&self, content: &str, lang: Lang) -> Result<ParseOutcome>;
}

/// Tree-sitter chunker. Grammar availability is probed once at construction.
#[derive(Debug, Clone)]
pub struct StructuralChunker {
    available: Vec<Lang>,
}

impl StructuralChunker {
    #[must_use]
    pub fn new() -> Self {
        let available = [
            Lang::Rust,
            Lang::Python,
            Lang::JavaScript,
            Lang::TypeScript,
            Lang::Go,
            Lang::Java,
        ]
        .into_iter()
        .filter(|lang| {
            lang.grammar()
                .is_some_and(|g| Parser::new().set_language(&g).is_ok())
        })
        .collect();
        Self { available }
    }
}

impl Default for StructuralChunker {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared context passed through the recursive traversal.
struct Walk<'a> {
    source: &'a str,
    lang: Lang,
    kinds: &'static [&'static str],
    line_count: usize,
    symbols: Vec<Symbol>,
    regions: Vec<Region>,
}

struct Region {
    start: usize,
    end: usize,
    name: String,
    kind: String,
}

impl Chunker for StructuralChunker {
    fn is_available(&self, lang: Lang) -> bool {
        self.available.contains(&lang)
    }

    fn chunk(&self, content: &str, lang: Lang) -> Result<ParseOutcome> {
        let grammar = lang
            .grammar()
            .ok_or_else(|| IndexError::UnsupportedLanguage(lang.id().to_owned()))?;

        let mut parser = Parser::new();
        parser
            .set_language(&grammar)
            .map_err(|e| IndexError::Parse(format!("set_language failed: {e}")))?;

        let tree = parser
            .parse(content, None)
            .ok_or_else(|| IndexError::Parse("parser returned no tree".into()))?;

        let root = tree.root_node();
        if root.is_error() {
            return Err(IndexError::Parse("syntax tree root is an error node".into()));
        }

        let lines: Vec<&str> = content.lines().collect();
        let mut walk = Walk {
            source: content,
            lang,
            kinds: lang.chunkable_kinds(),
            line_count: lines.len().max(1),
            symbols: Vec::new(),
            regions: Vec::new(),
        };
        collect(&mut walk, root, false);

        let xrefs = extract_xrefs(root, content, lang);
        let Walk {
            symbols,
            mut regions,
            line_count,
            ..
        } = walk;
        regions.sort_by_key(|r| r.start);
        let chunks = render(&lines, &plan_spans(&lines, &regions, line_count));

        Ok(ParseOutcome {
            chunks,
            symbols,
            xrefs,
            fallback: None,
        })
    }
}

/// Fixed-size line windows; always available.
#[derive(Debug, Clone)]
pub struct LineChunker {
    window: usize,
}

impl LineChunker {
    #[must_use]
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
        }
    }

    #[must_use]
    pub fn chunk_lines(&self, content: &str) -> Vec<Chunk> {
        let lines: Vec<&str> = content.lines().collect();
        if lines.iter().all(|l| l.trim().is_empty()) {
            return vec![empty_chunk()];
        }
        lines
            .chunks(self.window)
            .enumerate()
            .map(|(index, window)| {
                let start_line = index * self.window + 1;
                let content = window.join("\n");
                Chunk {
                    token_estimate: estimate_tokens(&content),
                    content,
                    start_line,
                    end_line: start_line + window.len() - 1,
                    symbol_name: None,
                    symbol_type: None,
                    index,
                }
            })
            .collect()
    }
}

impl Default for LineChunker {
    fn default() -> Self {
        Self::new(FALLBACK_WINDOW_LINES)
    }
}

impl Chunker for LineChunker {
    fn is_available(&self, _lang: Lang) -> bool {
        true
    }

    fn chunk(&self, content: &str, _lang: Lang) -> Result<ParseOutcome> {
        Ok(ParseOutcome {
            chunks: self.chunk_lines(content),
            ..ParseOutcome::default()
        })
    }
}

/// Guarded entry point combining [`StructuralChunker`] and [`LineChunker`].
#[derive(Debug, Clone, Default)]
pub struct CodeChunker {
    structural: StructuralChunker,
    fallback: LineChunker,
}

impl CodeChunker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Chunk raw file bytes, falling back to line windows over a lossy
    /// decoding when they are not UTF-8.
    #[must_use]
    pub fn parse_bytes(&self, bytes: &[u8], lang: Lang, path: &str) -> ParseOutcome {
        match std::str::from_utf8(bytes) {
            Ok(text) => self.parse(text, lang, path),
            Err(_) => {
                let text = String::from_utf8_lossy(bytes);
                self.fall_back(&text, path, FallbackReason::NotUtf8)
            }
        }
    }

    #[must_use]
    pub fn parse(&self, content: &str, lang: Lang, path: &str) -> ParseOutcome {
        if content.is_empty() {
            return sentinel(FallbackReason::Empty);
        }
        if content.trim().is_empty() {
            return sentinel(FallbackReason::WhitespaceOnly);
        }
        if let Some(reason) = guard(content) {
            return self.fall_back(content, path, reason);
        }
        if !self.structural.is_available(lang) {
            return self.fall_back(content, path, FallbackReason::NoGrammar);
        }

        match self.structural.chunk(content, lang) {
            Ok(outcome) if !outcome.chunks.is_empty() => outcome,
            Ok(_) => self.fall_back(
                content,
                path,
                FallbackReason::ParseFailed("no chunks produced".into()),
            ),
            Err(e) => self.fall_back(content, path, FallbackReason::ParseFailed(e.to_string())),
        }
    }

    fn fall_back(&self, content: &str, path: &str, reason: FallbackReason) -> ParseOutcome {
        if reason == FallbackReason::NoGrammar {
            tracing::debug!(path, %reason, "using line windows");
        } else {
            tracing::warn!(path, %reason, "structural chunking skipped, using line windows");
        }
        ParseOutcome {
            chunks: self.fallback.chunk_lines(content),
            symbols: Vec::new(),
            xrefs: Vec::new(),
            fallback: Some(reason),
        }
    }
}

fn guard(content: &str) -> Option<FallbackReason> {
    if content.contains('\0') {
        return Some(FallbackReason::NullBytes);
    }
    if content
        .chars()
        .any(|c| c.is_ascii_control() && c != '\x7f' && !matches!(c, '\t' | '\n' | '\r' | '\x0c'))
    {
        return Some(FallbackReason::ControlCharacters);
    }
    if content.len() > MAX_PARSE_BYTES {
        return Some(FallbackReason::TooLarge {
            bytes: content.len(),
        });
    }
    let opens = content.matches('{').count();
    let closes = content.matches('}').count();
    let delta = opens.abs_diff(closes);
    if delta > MAX_BRACE_DELTA {
        return Some(FallbackReason::UnbalancedBraces { delta });
    }
    None
}

fn empty_chunk() -> Chunk {
    Chunk {
        content: String::new(),
        start_line: 1,
        end_line: 1,
        token_estimate: 0,
        symbol_name: Some(EMPTY_SENTINEL.to_owned()),
        symbol_type: None,
        index: 0,
    }
}

fn sentinel(reason: FallbackReason) -> ParseOutcome {
    ParseOutcome {
        chunks: vec![empty_chunk()],
        symbols: Vec::new(),
        xrefs: Vec::new(),
        fallback: Some(reason),
    }
}

fn node_text<'a>(node: Node<'_>, source: &'a str) -> &'a str {
    &source[node.byte_range()]
}

/// 1-based inclusive line range of a node, ignoring a trailing newline.
fn node_lines(node: Node<'_>, line_count: usize) -> (usize, usize) {
    let start = node.start_position().row;
    let end_pos = node.end_position();
    let mut end = end_pos.row;
    if end_pos.column == 0 && end > start {
        end -= 1;
    }
    ((start + 1).min(line_count), (end + 1).min(line_count))
}

fn collect(walk: &mut Walk<'_>, node: Node<'_>, inside_chunk: bool) {
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
    for child in children {
        if !walk.kinds.contains(&child.kind()) {
            collect(walk, child, inside_chunk);
            continue;
        }

        let (start, end) = node_lines(child, walk.line_count);
        let text = node_text(child, walk.source);
        let name = symbol_name(child, walk.source).unwrap_or_else(|| ANONYMOUS.to_owned());
        let doc = leading_doc(child, walk.source, walk.lang);

        // The wrapped definition records the symbol; the wrapper only bounds the chunk.
        if child.kind() != "decorated_definition" {
            walk.symbols.push(Symbol {
                name: name.clone(),
                kind: child.kind().to_owned(),
                start_line: start,
                end_line: end,
                lang: walk.lang,
                source: text.to_owned(),
                doc: doc.as_ref().map(|d| d.text.clone()),
            });
        }

        let big = end - start + 1 > MIN_CHUNK_LINES || text.chars().count() > MIN_CHUNK_CHARS;
        let becomes_chunk = !inside_chunk && big;
        if becomes_chunk {
            let kind = child
                .child_by_field_name("definition")
                .map_or_else(|| child.kind().to_owned(), |d| d.kind().to_owned());
            walk.regions.push(Region {
                start: doc.as_ref().map_or(start, |d| d.start_line.min(start)),
                end,
                name,
                kind,
            });
        }
        collect(walk, child, inside_chunk || becomes_chunk);
    }
}

fn is_identifier_like(kind: &str) -> bool {
    kind.ends_with("identifier") || kind == "name" || kind == "constant"
}

fn first_identifier_descendant(node: Node<'_>, source: &str) -> Option<String> {
    let mut cursor = node.walk();
    let children: Vec<Node<'_>> = node.named_children(&mut cursor).collect();
    for child in &children {
        if is_identifier_like(child.kind()) {
            return Some(node_text(*child, source).to_owned());
        }
    }
    children
        .into_iter()
        .find_map(|c| first_identifier_descendant(c, source))
}

/// Resolve a declaration's name: grammar fields first, then the first
/// identifier-like child, then the first identifier anywhere below.
fn symbol_name(node: Node<'_>, source: &str) -> Option<String> {
    // tree-sitter-rust: impl_item uses "type" field, most others use "name"
    if let Some(n) = node
        .child_by_field_name("name")
        .or_else(|| node.child_by_field_name("type"))
    {
        return Some(node_text(n, source).to_owned());
    }
    if let Some(def) = node.child_by_field_name("definition") {
        return symbol_name(def, source);
    }
    first_identifier_descendant(node, source)
}

struct Doc {
    text: String,
    start_line: usize,
}

fn leading_doc(node: Node<'_>, source: &str, lang: Lang) -> Option<Doc> {
    if lang == Lang::Python {
        let def = node.child_by_field_name("definition").unwrap_or(node);
        let body = def.child_by_field_name("body")?;
        let first = body.named_child(0)?;
        if first.kind() != "expression_statement" {
            return None;
        }
        let string = first.named_child(0)?;
        if string.kind() != "string" {
            return None;
        }
        let text = node_text(string, source)
            .trim_matches(|c| c == '"' || c == '\'')
            .trim()
            .to_owned();
        return (!text.is_empty()).then(|| Doc {
            text,
            start_line: node.start_position().row + 1,
        });
    }

    // Comments attach to the export wrapper in JS/TS.
    let anchor = match node.parent() {
        Some(p) if p.kind() == "export_statement" && node.prev_sibling().is_none() => p,
        _ => node,
    };

    let mut comments: Vec<Node<'_>> = Vec::new();
    let mut expected_row = anchor.start_position().row;
    let mut prev = anchor.prev_sibling();
    while let Some(p) = prev {
        let end_row = p.end_position().row;
        let adjacent = end_row <= expected_row && end_row + 1 >= expected_row;
        if !adjacent {
            break;
        }
        if p.kind().contains("comment") {
            comments.push(p);
        } else if p.kind() != "attribute_item" {
            break;
        }
        expected_row = p.start_position().row;
        prev = p.prev_sibling();
    }
    if comments.is_empty() {
        return None;
    }
    comments.reverse();

    let is_doc_style = |n: &Node<'_>| {
        let t = node_text(*n, source);
        t.starts_with("///") || t.starts_with("/**") || t.starts_with("//!")
    };
    let keep_all = !comments.iter().any(is_doc_style);

    let start_line = comments.first()?.start_position().row + 1;
    comments.retain(|c| keep_all || is_doc_style(c));
    let text = comments
        .iter()
        .flat_map(|c| node_text(*c, source).lines())
        .map(clean_comment_line)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    (!text.is_empty()).then_some(Doc { text, start_line })
}

fn clean_comment_line(line: &str) -> &str {
    let mut l = line.trim();
    for prefix in ["///", "//!", "//", "/**", "/*", "#"] {
        if let Some(rest) = l.strip_prefix(prefix) {
            l = rest;
            break;
        }
    }
    l = l.strip_suffix("*/").unwrap_or(l);
    l.trim().trim_start_matches('*').trim()
}

fn strip_quotes(s: &str) -> String {
    s.trim_matches(|c| c == '"' || c == '\'' || c == '`').to_owned()
}

fn descendants_of_kind<'t>(node: Node<'t>, kind: &str, out: &mut Vec<Node<'t>>) {
    let mut cursor = node.walk();
    let children: Vec<Node<'t>> = node.named_children(&mut cursor).collect();
    for child in children {
        if child.kind() == kind {
            out.push(child);
        } else {
            descendants_of_kind(child, kind, out);
        }
    }
}

fn xref_targets(node: Node<'_>, source: &str, lang: Lang) -> Vec<String> {
    match (node.kind(), lang) {
        ("use_declaration", _) => node
            .child_by_field_name("argument")
            .map(|a| vec![node_text(a, source).to_owned()])
            .unwrap_or_default(),
        ("import_from_statement", _) => node
            .child_by_field_name("module_name")
            .map(|m| vec![node_text(m, source).to_owned()])
            .unwrap_or_default(),
        ("import_statement", Lang::Python) => {
            let mut cursor = node.walk();
            node.children_by_field_name("name", &mut cursor)
                .map(|n| {
                    let target = n.child_by_field_name("name").unwrap_or(n);
                    node_text(target, source).to_owned()
                })
                .collect()
        }
        ("import_statement", _) => node
            .child_by_field_name("source")
            .map(|s| vec![strip_quotes(node_text(s, source))])
            .unwrap_or_default(),
        ("export_statement", _) => {
            if let Some(decl) = node.child_by_field_name("declaration") {
                return symbol_name(decl, source).into_iter().collect();
            }
            if let Some(src) = node.child_by_field_name("source") {
                return vec![strip_quotes(node_text(src, source))];
            }
            let mut specs = Vec::new();
            descendants_of_kind(node, "export_specifier", &mut specs);
            if specs.is_empty() {
                return vec!["default".to_owned()];
            }
            specs
                .into_iter()
                .filter_map(|s| s.child_by_field_name("name"))
                .map(|n| node_text(n, source).to_owned())
                .collect()
        }
        ("import_declaration", Lang::Go) => {
            let mut specs = Vec::new();
            descendants_of_kind(node, "import_spec", &mut specs);
            specs
                .into_iter()
                .filter_map(|s| s.child_by_field_name("path"))
                .map(|p| strip_quotes(node_text(p, source)))
                .collect()
        }
        ("import_declaration", _) => {
            let text = node_text(node, source).trim();
            let text = text.strip_prefix("import").unwrap_or(text).trim();
            let text = text.strip_prefix("static").unwrap_or(text).trim();
            vec![text.trim_end_matches(';').trim().to_owned()]
        }
        _ => Vec::new(),
    }
}

fn extract_xrefs(root: Node<'_>, source: &str, lang: Lang) -> Vec<Xref> {
    let kinds = lang.xref_kinds();
    let mut xrefs = Vec::new();
    let mut cursor = root.walk();
    for child in root.named_children(&mut cursor) {
        let Some((_, role)) = kinds.iter().find(|(k, _)| *k == child.kind()) else {
            continue;
        };
        let kind = match role {
            XrefRole::Export => XrefKind::Export,
            XrefRole::Import if node_text(child, source).starts_with("pub ") => XrefKind::Export,
            XrefRole::Import => XrefKind::Import,
        };
        let line = child.start_position().row + 1;
        xrefs.extend(
            xref_targets(child, source, lang)
                .into_iter()
                .filter(|t| !t.is_empty())
                .map(|target| Xref { kind, target, line }),
        );
    }
    xrefs
}

struct Span {
    start: usize,
    end: usize,
    name: Option<String>,
    kind: Option<String>,
}

fn is_blank(lines: &[&str], start: usize, end: usize) -> bool {
    lines
        .get(start - 1..end.min(lines.len()))
        .is_none_or(|ls| ls.iter().all(|l| l.trim().is_empty()))
}

/// Lay symbol regions over the file and fill the gaps between them so that
/// the spans cover `1..=line_count` without holes or overlap. Blank gaps are
/// absorbed by a neighbouring span.
fn plan_spans(lines: &[&str], regions: &[Region], line_count: usize) -> Vec<Span> {
    let mut spans: Vec<Span> = Vec::new();
    let mut next_line = 1;
    let mut pending_blank: Option<usize> = None;

    for region in regions {
        let start = region.start.max(next_line);
        if start > region.end {
            if let Some(last) = spans.last_mut() {
                last.end = last.end.max(region.end);
            }
            next_line = next_line.max(region.end + 1);
            continue;
        }
        fill_gap(lines, &mut spans, &mut pending_blank, next_line, start - 1);
        push_span(
            &mut spans,
            &mut pending_blank,
            Span {
                start,
                end: region.end,
                name: Some(region.name.clone()),
                kind: Some(region.kind.clone()),
            },
        );
        next_line = region.end + 1;
    }
    fill_gap(lines, &mut spans, &mut pending_blank, next_line, line_count);

    if let Some(start) = pending_blank {
        spans.push(Span {
            start,
            end: line_count,
            name: None,
            kind: None,
        });
    }
    spans
}

fn push_span(spans: &mut Vec<Span>, pending_blank: &mut Option<usize>, mut span: Span) {
    if let Some(start) = pending_blank.take() {
        span.start = start;
    }
    spans.push(span);
}

fn fill_gap(
    lines: &[&str],
    spans: &mut Vec<Span>,
    pending_blank: &mut Option<usize>,
    start: usize,
    end: usize,
) {
    if start > end {
        return;
    }
    if is_blank(lines, start, end) {
        if let Some(last) = spans.last_mut() {
            last.end = end;
        } else if pending_blank.is_none() {
            *pending_blank = Some(start);
        }
        return;
    }
    push_span(
        spans,
        pending_blank,
        Span {
            start,
            end,
            name: None,
            kind: None,
        },
    );
}

fn render(lines: &[&str], spans: &[Span]) -> Vec<Chunk> {
    spans
        .iter()
        .enumerate()
        .map(|(index, span)| {
            let content = lines
                .get(span.start - 1..span.end.min(lines.len()))
                .map(|ls| ls.join("\n"))
                .unwrap_or_default();
            Chunk {
                token_estimate: estimate_tokens(&content),
                content,
                start_line: span.start,
                end_line: span.end,
                symbol_name: span.name.clone(),
                symbol_type: span.kind.clone(),
                index,
            }
        })
        .collect()
}
