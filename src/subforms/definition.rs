//! Form templates: parsing, caching and the live tree of a saved instance.
//!
//! A template file wraps the primary instance skeleton:
//!
//! ```xml
//! <form id="household" title="Household" version="3">
//!   <household>
//!     <hh_id saveInstance="/hh_id"/>
//!     <member repeat="true" saveForm="member">
//!       <name saveInstance="/name"/>
//!       <consent/>
//!       <photo saveInstance="/photo" relevant="consent = 'yes'"/>
//!     </member>
//!     <dissolve deleteForm="" relevant="/status = 'dissolved'"/>
//!     <status/>
//!   </household>
//! </form>
//! ```
//!
//! `repeat` and `relevant` stand in for the form engine's repeat and
//! relevance bindings. `relevant` understands `<path> = '<literal>'` and
//! `<path> != '<literal>'`; a relative path starts at the node's parent, an
//! absolute one at the instance root (instance name stripped).

use crate::core::error::FormlinkError;
use crate::core::xml::{self, Element};
use crate::subforms::directive::{DirectiveKind, TreeNode};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

pub const REPEAT_ATTR: &str = "repeat";
pub const RELEVANT_ATTR: &str = "relevant";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormDefinition {
    pub form_id: String,
    pub title: String,
    pub version: Option<String>,
    pub skeleton: Element,
}

impl FormDefinition {
    pub fn parse(text: &str) -> Result<Self, FormlinkError> {
        let root = xml::parse(text)?;
        if root.name != "form" {
            return Err(FormlinkError::ValidationError(format!(
                "form template root must be <form>, found <{}>",
                root.name
            )));
        }
        let form_id = root
            .attribute("id")
            .filter(|id| !id.is_empty())
            .ok_or_else(|| FormlinkError::ValidationError("form template has no id".to_string()))?
            .to_string();
        let mut children = root.children.into_iter();
        let (Some(skeleton), None) = (children.next(), children.next()) else {
            return Err(FormlinkError::ValidationError(format!(
                "form template '{}' must wrap exactly one instance element",
                form_id
            )));
        };
        let title = root
            .attributes
            .iter()
            .find(|(k, _)| k == "title")
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| form_id.clone());
        let version = root
            .attributes
            .iter()
            .find(|(k, _)| k == "version")
            .map(|(_, v)| v.clone());
        Ok(Self {
            form_id,
            title,
            version,
            skeleton,
        })
    }

    pub fn load(path: &Path) -> Result<Self, FormlinkError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
            .map_err(|e| FormlinkError::ValidationError(format!("{}: {}", path.display(), e)))
    }

    /// The minimal valid instance document: the skeleton without engine or
    /// directive markers, stamped with the form id and version.
    pub fn fresh_instance(&self) -> Element {
        let mut document = strip_markers(&self.skeleton);
        document.set_attribute("id", &self.form_id);
        if let Some(version) = &self.version {
            document.set_attribute("version", version);
        }
        document
    }

    /// The form engine's tree for a saved instance document.
    pub fn live_tree(&self, instance: &Element) -> TreeNode {
        build_node(&self.skeleton, instance, None, None, instance, true)
    }
}

fn is_marker(name: &str) -> bool {
    name == REPEAT_ATTR || name == RELEVANT_ATTR || DirectiveKind::from_attribute(name).is_some()
}

fn strip_markers(node: &Element) -> Element {
    Element {
        name: node.name.clone(),
        attributes: node
            .attributes
            .iter()
            .filter(|(k, _)| !is_marker(k))
            .cloned()
            .collect(),
        text: node.text.clone(),
        children: node.children.iter().map(strip_markers).collect(),
    }
}

fn directive_attributes(def: &Element) -> Vec<(String, String)> {
    def.attributes
        .iter()
        .filter(|(k, _)| DirectiveKind::from_attribute(k).is_some())
        .cloned()
        .collect()
}

fn is_repeat(def: &Element) -> bool {
    def.attribute(REPEAT_ATTR) == Some("true")
}

fn build_node(
    def: &Element,
    inst: &Element,
    position: Option<usize>,
    parent_inst: Option<&Element>,
    root: &Element,
    parent_relevant: bool,
) -> TreeNode {
    let relevant = parent_relevant
        && match (def.attribute(RELEVANT_ATTR), parent_inst) {
            (Some(expr), Some(context)) => match RelevanceRule::parse(expr) {
                Some(rule) => rule.evaluate(context, root),
                None => {
                    tracing::warn!(node = %def.name, expr, "unparseable relevance expression; treating node as relevant");
                    true
                }
            },
            _ => true,
        };

    let mut node = match position {
        Some(p) => TreeNode::repeat(&inst.name, p),
        None => TreeNode::new(&inst.name),
    }
    .value(&inst.text)
    .relevant(relevant);
    node.attributes = directive_attributes(def);

    let empty = Element::default();
    let mut seen: HashMap<&str, usize> = HashMap::new();
    for child in &inst.children {
        let child_def = def.child(&child.name).unwrap_or(&empty);
        let child_position = if is_repeat(child_def) {
            let count = seen.entry(child.name.as_str()).or_insert(0);
            *count += 1;
            Some(*count)
        } else {
            None
        };
        node = node.child(build_node(
            child_def,
            child,
            child_position,
            Some(inst),
            root,
            relevant,
        ));
    }

    for child_def in def.children.iter().filter(|c| is_repeat(c)) {
        node = node.child(template_node(child_def));
    }
    node
}

/// Placeholder subtree the engine keeps for adding new repeat occurrences.
fn template_node(def: &Element) -> TreeNode {
    let mut node = TreeNode::template(&def.name).relevant(false);
    node.attributes = directive_attributes(def);
    for child_def in &def.children {
        node = node.child(skeleton_node(child_def));
    }
    node
}

fn skeleton_node(def: &Element) -> TreeNode {
    let mut node = if is_repeat(def) {
        TreeNode::repeat(&def.name, 1)
    } else {
        TreeNode::new(&def.name)
    }
    .relevant(false);
    node.attributes = directive_attributes(def);
    for child_def in &def.children {
        node = node.child(skeleton_node(child_def));
    }
    node
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelevanceRule {
    pub path: String,
    pub negate: bool,
    pub literal: String,
}

impl RelevanceRule {
    pub fn parse(expr: &str) -> Option<Self> {
        let (start, end, negate) = find_operator(expr)?;
        let path = expr[..start].trim();
        let rhs = expr[end..].trim();
        let literal = rhs
            .strip_prefix('\'')
            .and_then(|r| r.strip_suffix('\''))
            .or_else(|| rhs.strip_prefix('"').and_then(|r| r.strip_suffix('"')))?;
        if path.is_empty() {
            return None;
        }
        Some(Self {
            path: path.to_string(),
            negate,
            literal: literal.to_string(),
        })
    }

    /// Missing nodes compare as the empty string.
    pub fn evaluate(&self, context: &Element, root: &Element) -> bool {
        let target = if self.path.starts_with('/') {
            root.select(&self.path)
        } else {
            context.select(&format!("/{}", self.path))
        };
        let value = target.map(|e| e.text.as_str()).unwrap_or("");
        (value == self.literal) != self.negate
    }
}

/// Byte range of the first `=` or `!=` outside a quoted literal.
fn find_operator(expr: &str) -> Option<(usize, usize, bool)> {
    let mut quote: Option<char> = None;
    for (i, c) in expr.char_indices() {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some(_), _) => {}
            (None, '\'' | '"') => quote = Some(c),
            (None, '=') if expr[..i].ends_with('!') => return Some((i - 1, i + 1, true)),
            (None, '=') => return Some((i, i + 1, false)),
            _ => {}
        }
    }
    None
}

/// Parsed templates keyed by file path; reparsed when the file changes.
#[derive(Debug, Default)]
pub struct DefinitionCache {
    entries: Mutex<HashMap<PathBuf, (Option<SystemTime>, Arc<FormDefinition>)>>,
}

impl DefinitionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_load(&self, path: &Path) -> Result<Arc<FormDefinition>, FormlinkError> {
        let modified = std::fs::metadata(path)?.modified().ok();
        let mut entries = self.entries.lock().map_err(|_| {
            FormlinkError::ValidationError("definition cache lock poisoned".to_string())
        })?;
        if let Some((cached_at, definition)) = entries.get(path) {
            if *cached_at == modified {
                return Ok(Arc::clone(definition));
            }
        }
        tracing::debug!(path = %path.display(), "parsing form template");
        let definition = Arc::new(FormDefinition::load(path)?);
        entries.insert(path.to_path_buf(), (modified, Arc::clone(&definition)));
        Ok(definition)
    }

    pub fn len(&self) -> usize {
        self.entries.lock().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
