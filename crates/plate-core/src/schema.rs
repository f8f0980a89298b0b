use std::collections::{BTreeSet, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{ElementNode, Node};

/// Context item standing for the document root.
pub const ROOT: &str = "$root";
/// Context item standing for any text leaf.
pub const TEXT: &str = "$text";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRole {
    Block,
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChildConstraint {
    None,
    BlockOnly,
    InlineOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSpec {
    pub kind: String,
    pub role: NodeRole,
    pub is_void: bool,
    pub children: ChildConstraint,
}

impl NodeSpec {
    /// A block holding text and inline objects, like a paragraph.
    pub fn text_block(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            role: NodeRole::Block,
            is_void: false,
            children: ChildConstraint::InlineOnly,
        }
    }

    /// A block holding other blocks, like a blockquote.
    pub fn container(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            role: NodeRole::Block,
            is_void: false,
            children: ChildConstraint::BlockOnly,
        }
    }

    /// An object living among text, like an inline image.
    pub fn inline_object(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            role: NodeRole::Inline,
            is_void: true,
            children: ChildConstraint::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SchemaContext {
    items: Vec<String>,
}

impl SchemaContext {
    pub fn new<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    pub fn last(&self) -> Option<&str> {
        self.items.last().map(String::as_str)
    }

    /// Matches a space separated suffix, e.g. `"blockquote paragraph $text"`.
    pub fn ends_with(&self, query: &str) -> bool {
        let wanted: Vec<&str> = query.split_whitespace().collect();
        if wanted.len() > self.items.len() {
            return false;
        }
        self.items[self.items.len() - wanted.len()..]
            .iter()
            .zip(&wanted)
            .all(|(item, wanted)| item == wanted)
    }
}

impl fmt::Display for SchemaContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.items.join(" "))
    }
}

/// A host supplied permission rule. `Some` decides, `None` defers to the
/// next rule and finally to the declared allowances.
pub trait AttributeCheck: Send + Sync {
    fn check(&self, ctx: &SchemaContext, key: &str) -> Option<bool>;
}

impl<F> AttributeCheck for F
where
    F: Fn(&SchemaContext, &str) -> Option<bool> + Send + Sync,
{
    fn check(&self, ctx: &SchemaContext, key: &str) -> Option<bool> {
        self(ctx, key)
    }
}

/// Answers whether an attribute may live at a context.
pub trait AttributeValidator {
    fn is_attribute_allowed(&self, ctx: &SchemaContext, key: &str) -> bool;
}

/// Declares that `keys` may be set on `item` (a node kind or [`TEXT`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeRule {
    pub item: String,
    pub keys: Vec<String>,
}

impl AttributeRule {
    pub fn new<I, S>(item: impl Into<String>, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            item: item.into(),
            keys: keys.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SchemaError {
    #[error("duplicate node spec kind: {0}")]
    DuplicateNodeSpec(String),
}

#[derive(Default)]
pub struct Schema {
    node_specs: HashMap<String, NodeSpec>,
    allowed_attributes: HashMap<String, BTreeSet<String>>,
    attribute_checks: Vec<Box<dyn AttributeCheck>>,
}

impl Schema {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, spec: NodeSpec) -> Result<(), SchemaError> {
        if self.node_specs.contains_key(&spec.kind) {
            return Err(SchemaError::DuplicateNodeSpec(spec.kind));
        }
        self.node_specs.insert(spec.kind.clone(), spec);
        Ok(())
    }

    pub fn node_spec(&self, kind: &str) -> Option<&NodeSpec> {
        self.node_specs.get(kind)
    }

    pub fn is_void(&self, kind: &str) -> bool {
        self.node_specs.get(kind).is_some_and(|spec| spec.is_void)
    }

    pub fn allow_attributes<I, S>(&mut self, item: &str, keys: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_attributes
            .entry(item.to_string())
            .or_default()
            .extend(keys.into_iter().map(Into::into));
    }

    pub fn add_attribute_rule(&mut self, rule: AttributeRule) {
        let AttributeRule { item, keys } = rule;
        self.allow_attributes(&item, keys);
    }

    /// Registers a permission predicate. Later predicates take precedence.
    pub fn add_attribute_check<F>(&mut self, check: F)
    where
        F: Fn(&SchemaContext, &str) -> Option<bool> + Send + Sync + 'static,
    {
        self.attribute_checks.push(Box::new(check));
    }

    pub fn add_boxed_attribute_check(&mut self, check: Box<dyn AttributeCheck>) {
        self.attribute_checks.push(check);
    }

    pub fn check_attribute(&self, ctx: &SchemaContext, key: &str) -> bool {
        for check in self.attribute_checks.iter().rev() {
            if let Some(decision) = check.check(ctx, key) {
                return decision;
            }
        }
        ctx.last()
            .and_then(|item| self.allowed_attributes.get(item))
            .is_some_and(|keys| keys.contains(key))
    }

    pub fn is_text_block(&self, el: &ElementNode) -> bool {
        match self.node_specs.get(&el.kind).map(|s| &s.children) {
            Some(ChildConstraint::InlineOnly) => true,
            Some(_) => false,
            None => el
                .children
                .iter()
                .any(|n| matches!(n, Node::Text(_) | Node::Void(_))),
        }
    }
}

impl AttributeValidator for Schema {
    fn is_attribute_allowed(&self, ctx: &SchemaContext, key: &str) -> bool {
        self.check_attribute(ctx, key)
    }
}
