//! Owned XML element tree for form instance documents.
//!
//! Instance documents are data-only XML: elements, attributes and leaf text.
//! The parser accepts the XML declaration, comments, processing
//! instructions, a DOCTYPE line and CDATA sections, and rejects anything
//! unbalanced. Leaf text is kept byte-for-byte; whitespace-only text inside
//! container elements is dropped.
//!
//! Nodes are addressed with instance-name-stripped absolute paths:
//! `/member[2]/name` walks from the document root to its second `member`
//! child and then that member's first `name` child. `/` is the root itself.

use crate::core::error::FormlinkError;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn with_attribute(mut self, name: &str, value: &str) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn with_child(mut self, child: Element) -> Self {
        self.children.push(child);
        self
    }

    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attribute(&mut self, name: &str, value: &str) {
        match self.attributes.iter_mut().find(|(k, _)| k == name) {
            Some(slot) => slot.1 = value.to_string(),
            None => self.attributes.push((name.to_string(), value.to_string())),
        }
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<String> {
        let idx = self.attributes.iter().position(|(k, _)| k == name)?;
        Some(self.attributes.remove(idx).1)
    }

    /// First child element with the given name.
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn select(&self, path: &str) -> Option<&Element> {
        let steps = parse_path(path)?;
        let mut current = self;
        for (name, position) in steps {
            current = current
                .children
                .iter()
                .filter(|c| c.name == name)
                .nth(position - 1)?;
        }
        Some(current)
    }

    pub fn select_mut(&mut self, path: &str) -> Option<&mut Element> {
        let steps = parse_path(path)?;
        let mut current = self;
        for (name, position) in steps {
            current = current
                .children
                .iter_mut()
                .filter(|c| c.name == name)
                .nth(position - 1)?;
        }
        Some(current)
    }
}

/// Splits `/a/b[2]/c` into `[("a", 1), ("b", 2), ("c", 1)]`.
/// Returns `None` for anything that is not a plain positional path.
fn parse_path(path: &str) -> Option<Vec<(&str, usize)>> {
    let path = path.trim();
    if path.is_empty() || path == "/" {
        return Some(Vec::new());
    }
    let rest = path.strip_prefix('/')?;
    let mut steps = Vec::new();
    for segment in rest.split('/') {
        let (name, position) = match segment.find('[') {
            Some(open) => {
                let selector = segment[open + 1..].strip_suffix(']')?;
                let position: usize = selector.parse().ok()?;
                (&segment[..open], position)
            }
            None => (segment, 1),
        };
        if name.is_empty() || position == 0 || name.contains(['[', ']', '@']) {
            return None;
        }
        steps.push((name, position));
    }
    Some(steps)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

pub fn parse(input: &str) -> Result<Element, FormlinkError> {
    let mut parser = Parser { src: input, pos: 0 };
    parser.skip_misc()?;
    if !parser.starts_with("<") {
        return Err(parser.error("expected root element"));
    }
    let root = parser.parse_element()?;
    parser.skip_misc()?;
    if parser.pos < parser.src.len() {
        return Err(parser.error("content after root element"));
    }
    Ok(root)
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn starts_with(&self, prefix: &str) -> bool {
        self.rest().starts_with(prefix)
    }

    fn error(&self, msg: &str) -> FormlinkError {
        FormlinkError::XmlError(format!("{} at byte {}", msg, self.pos))
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    /// Advance past the next occurrence of `terminator`.
    fn skip_past(&mut self, terminator: &str) -> Result<&'a str, FormlinkError> {
        match self.rest().find(terminator) {
            Some(idx) => {
                let skipped = &self.rest()[..idx];
                self.pos += idx + terminator.len();
                Ok(skipped)
            }
            None => Err(self.error(&format!("unterminated construct, expected '{}'", terminator))),
        }
    }

    /// Whitespace, comments, processing instructions and DOCTYPE outside the root.
    fn skip_misc(&mut self) -> Result<(), FormlinkError> {
        loop {
            self.skip_ws();
            if self.starts_with("<?") {
                self.skip_past("?>")?;
            } else if self.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if self.starts_with("<!DOCTYPE") {
                self.skip_past(">")?;
            } else {
                return Ok(());
            }
        }
    }

    fn read_name(&mut self) -> Result<&'a str, FormlinkError> {
        let rest = self.rest();
        let end = rest
            .find(|c: char| c.is_whitespace() || matches!(c, '/' | '>' | '=' | '<'))
            .unwrap_or(rest.len());
        if end == 0 {
            return Err(self.error("expected name"));
        }
        self.pos += end;
        Ok(&rest[..end])
    }

    fn expect(&mut self, token: &str) -> Result<(), FormlinkError> {
        if !self.starts_with(token) {
            return Err(self.error(&format!("expected '{}'", token)));
        }
        self.pos += token.len();
        Ok(())
    }

    fn parse_element(&mut self) -> Result<Element, FormlinkError> {
        self.expect("<")?;
        let mut element = Element::new(self.read_name()?);

        loop {
            self.skip_ws();
            if self.starts_with("/>") {
                self.pos += 2;
                return Ok(element);
            }
            if self.starts_with(">") {
                self.pos += 1;
                break;
            }
            let name = self.read_name()?;
            self.skip_ws();
            self.expect("=")?;
            self.skip_ws();
            let quote = if self.starts_with("\"") {
                "\""
            } else if self.starts_with("'") {
                "'"
            } else {
                return Err(self.error("expected quoted attribute value"));
            };
            self.pos += 1;
            let raw = self.skip_past(quote)?;
            let value = decode_entities(raw)?;
            element.attributes.push((name.to_string(), value));
        }

        loop {
            if self.pos >= self.src.len() {
                return Err(self.error(&format!("unclosed element <{}>", element.name)));
            }
            if self.starts_with("</") {
                self.pos += 2;
                let name = self.read_name()?;
                if name != element.name {
                    return Err(self.error(&format!(
                        "mismatched closing tag </{}> for <{}>",
                        name, element.name
                    )));
                }
                self.skip_ws();
                self.expect(">")?;
                break;
            } else if self.starts_with("<!--") {
                self.skip_past("-->")?;
            } else if self.starts_with("<![CDATA[") {
                self.pos += "<![CDATA[".len();
                let data = self.skip_past("]]>")?;
                element.text.push_str(data);
            } else if self.starts_with("<?") {
                self.skip_past("?>")?;
            } else if self.starts_with("<") {
                let child = self.parse_element()?;
                element.children.push(child);
            } else {
                let rest = self.rest();
                let end = rest.find('<').unwrap_or(rest.len());
                element.text.push_str(&decode_entities(&rest[..end])?);
                self.pos += end;
            }
        }

        if !element.children.is_empty() {
            let trimmed = element.text.trim();
            if trimmed.len() != element.text.len() {
                element.text = trimmed.to_string();
            }
        }
        Ok(element)
    }
}

fn decode_entities(raw: &str) -> Result<String, FormlinkError> {
    if !raw.contains('&') {
        return Ok(raw.to_string());
    }
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(amp) = rest.find('&') {
        out.push_str(&rest[..amp]);
        let after = &rest[amp + 1..];
        let semi = after
            .find(';')
            .ok_or_else(|| FormlinkError::XmlError(format!("unterminated entity in '{}'", raw)))?;
        let entity = &after[..semi];
        let decoded = match entity {
            "lt" => '<',
            "gt" => '>',
            "amp" => '&',
            "quot" => '"',
            "apos" => '\'',
            _ => {
                let code = if let Some(hex) = entity.strip_prefix("#x") {
                    u32::from_str_radix(hex, 16).ok()
                } else if let Some(dec) = entity.strip_prefix('#') {
                    dec.parse::<u32>().ok()
                } else {
                    None
                };
                code.and_then(char::from_u32).ok_or_else(|| {
                    FormlinkError::XmlError(format!("unknown entity '&{};'", entity))
                })?
            }
        };
        out.push(decoded);
        rest = &after[semi + 1..];
    }
    out.push_str(rest);
    Ok(out)
}

// ---------------------------------------------------------------------------
// Serialization
// ---------------------------------------------------------------------------

pub fn to_xml_string(root: &Element) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    write_element(&mut out, root, 0);
    out
}

fn write_element(out: &mut String, element: &Element, depth: usize) {
    let indent = "  ".repeat(depth);
    out.push_str(&indent);
    out.push('<');
    out.push_str(&element.name);
    for (name, value) in &element.attributes {
        out.push(' ');
        out.push_str(name);
        out.push_str("=\"");
        out.push_str(&escape(value, true));
        out.push('"');
    }
    if element.children.is_empty() {
        if element.text.is_empty() {
            out.push_str("/>\n");
        } else {
            out.push('>');
            out.push_str(&escape(&element.text, false));
            out.push_str("</");
            out.push_str(&element.name);
            out.push_str(">\n");
        }
        return;
    }
    out.push('>');
    if !element.text.trim().is_empty() {
        out.push_str(&escape(element.text.trim(), false));
    }
    out.push('\n');
    for child in &element.children {
        write_element(out, child, depth + 1);
    }
    out.push_str(&indent);
    out.push_str("</");
    out.push_str(&element.name);
    out.push_str(">\n");
}

fn escape(value: &str, attribute: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' if attribute => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

// ---------------------------------------------------------------------------
// File I/O
// ---------------------------------------------------------------------------

pub fn read_document(path: &Path) -> Result<Element, FormlinkError> {
    let content = fs::read_to_string(path)?;
    parse(&content).map_err(|e| FormlinkError::XmlError(format!("{}: {}", path.display(), e)))
}

/// Serialize to a sibling temp file, then rename over the target.
pub fn write_document(path: &Path, root: &Element) -> Result<(), FormlinkError> {
    let tmp = path.with_extension("xml.tmp");
    fs::write(&tmp, to_xml_string(root))?;
    fs::rename(&tmp, path)?;
    Ok(())
}
