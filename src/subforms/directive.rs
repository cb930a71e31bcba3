//! Directive discovery over the form engine's instance tree.
//!
//! A directive is one of three attributes on an instance node:
//! `saveInstance` (copy this node's value into the child at the given path),
//! `saveForm` (link a child instance of the given form id here) and
//! `deleteForm` (delete this instance when the node is relevant).

use crate::subforms::paths;
use serde::Serialize;

pub const SAVE_INSTANCE_ATTR: &str = "saveInstance";
pub const SAVE_FORM_ATTR: &str = "saveForm";
pub const DELETE_FORM_ATTR: &str = "deleteForm";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum DirectiveKind {
    SaveInstance,
    SaveForm,
    DeleteForm,
}

impl DirectiveKind {
    pub fn from_attribute(name: &str) -> Option<Self> {
        match name {
            SAVE_INSTANCE_ATTR => Some(Self::SaveInstance),
            SAVE_FORM_ATTR => Some(Self::SaveForm),
            DELETE_FORM_ATTR => Some(Self::DeleteForm),
            _ => None,
        }
    }

    pub fn attribute_name(&self) -> &'static str {
        match self {
            Self::SaveInstance => SAVE_INSTANCE_ATTR,
            Self::SaveForm => SAVE_FORM_ATTR,
            Self::DeleteForm => DELETE_FORM_ATTR,
        }
    }
}

/// One discovered directive. Immutable; recomputed on every traversal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubformDirective {
    pub kind: DirectiveKind,
    /// Child XPath for `SaveInstance`, form id for `SaveForm`, unused for `DeleteForm`.
    pub attribute_value: String,
    /// Stripped absolute path of the node carrying the attribute.
    pub node_xpath: String,
    /// Current text of that node (child title for `SaveForm`).
    pub node_value: String,
    pub is_relevant: bool,
    /// Stripped path of the nearest repeatable ancestor-or-self.
    pub enclosing_repeat_path: Option<String>,
}

impl SubformDirective {
    pub fn is_template(&self) -> bool {
        paths::is_template(&self.node_xpath)
    }

    /// Largest bracket selector in the node path when inside a repeat, else -1.
    ///
    /// A repeat path without any selector is its only occurrence, so it maps to 1.
    pub fn repeat_index(&self) -> i64 {
        match self.enclosing_repeat_path {
            Some(_) => paths::max_bracket_index(&self.node_xpath).unwrap_or(1),
            None => -1,
        }
    }
}

/// The form engine's view of one instance node.
pub trait FormNode {
    /// Absolute path including the instance name, e.g. `/household/member[2]/name`.
    fn path(&self) -> String;
    fn value(&self) -> String;
    /// Attributes in document order.
    fn attributes(&self) -> Vec<(String, String)>;
    fn attribute(&self, name: &str) -> Option<String> {
        self.attributes()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }
    fn is_relevant(&self) -> bool;
    fn is_repeatable(&self) -> bool;
    fn children(&self) -> Vec<&dyn FormNode>;
}

/// Depth-first, pre-order collection of every directive in the tree,
/// template placeholders included. Attributes of a node are visited before
/// its children.
pub fn discover(root: &dyn FormNode) -> Vec<SubformDirective> {
    collect(root, None)
}

/// `discover` without template placeholders: the input for live management.
pub fn discover_live(root: &dyn FormNode) -> Vec<SubformDirective> {
    discover(root)
        .into_iter()
        .filter(|d| !d.is_template())
        .collect()
}

fn collect(node: &dyn FormNode, enclosing_repeat: Option<&str>) -> Vec<SubformDirective> {
    let node_xpath = paths::strip_instance_name(&node.path());
    let own_repeat = if node.is_repeatable() {
        Some(node_xpath.clone())
    } else {
        enclosing_repeat.map(str::to_string)
    };

    let mut found: Vec<SubformDirective> = node
        .attributes()
        .into_iter()
        .filter_map(|(name, value)| {
            DirectiveKind::from_attribute(&name).map(|kind| SubformDirective {
                kind,
                attribute_value: value,
                node_xpath: node_xpath.clone(),
                node_value: node.value(),
                is_relevant: node.is_relevant(),
                enclosing_repeat_path: own_repeat.clone(),
            })
        })
        .collect();

    for child in node.children() {
        found.extend(collect(child, own_repeat.as_deref()));
    }
    found
}

/// Plain in-memory form-engine node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub name: String,
    /// 1-based occurrence among same-named siblings; rendered when `Some`.
    pub position: Option<usize>,
    pub template: bool,
    pub value: String,
    pub attributes: Vec<(String, String)>,
    pub relevant: bool,
    pub repeatable: bool,
    pub children: Vec<TreeNode>,
    parent_path: String,
}

impl TreeNode {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            position: None,
            template: false,
            value: String::new(),
            attributes: Vec::new(),
            relevant: true,
            repeatable: false,
            children: Vec::new(),
            parent_path: String::new(),
        }
    }

    /// A repeat occurrence rendered as `name[position]`.
    pub fn repeat(name: &str, position: usize) -> Self {
        Self {
            position: Some(position),
            repeatable: true,
            ..Self::new(name)
        }
    }

    /// A repeat template placeholder rendered as `name[@template]`.
    pub fn template(name: &str) -> Self {
        Self {
            template: true,
            repeatable: true,
            ..Self::new(name)
        }
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = value.to_string();
        self
    }

    pub fn attr(mut self, name: &str, value: &str) -> Self {
        self.attributes.push((name.to_string(), value.to_string()));
        self
    }

    pub fn relevant(mut self, relevant: bool) -> Self {
        self.relevant = relevant;
        self
    }

    pub fn child(mut self, mut child: TreeNode) -> Self {
        child.rebase(&self.own_path());
        self.children.push(child);
        self
    }

    fn segment(&self) -> String {
        if self.template {
            format!("{}{}", self.name, paths::TEMPLATE_MARKER)
        } else {
            match self.position {
                Some(p) => format!("{}[{}]", self.name, p),
                None => self.name.clone(),
            }
        }
    }

    fn own_path(&self) -> String {
        format!("{}/{}", self.parent_path, self.segment())
    }

    fn rebase(&mut self, parent_path: &str) {
        self.parent_path = parent_path.to_string();
        let own = self.own_path();
        for child in &mut self.children {
            child.rebase(&own);
        }
    }
}

impl FormNode for TreeNode {
    fn path(&self) -> String {
        self.own_path()
    }

    fn value(&self) -> String {
        self.value.clone()
    }

    fn attributes(&self) -> Vec<(String, String)> {
        self.attributes.clone()
    }

    fn is_relevant(&self) -> bool {
        self.relevant
    }

    fn is_repeatable(&self) -> bool {
        self.repeatable
    }

    fn children(&self) -> Vec<&dyn FormNode> {
        self.children.iter().map(|c| c as &dyn FormNode).collect()
    }
}
