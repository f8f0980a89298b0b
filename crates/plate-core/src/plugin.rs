use std::collections::HashMap;

use serde_json::Value;
use thiserror::Error;

use crate::core::{Attrs, Document, Editor, Node, Point, Range, Selection, selection_attrs};
use crate::ops::{Op, Transaction};
use crate::schema::{AttributeCheck, AttributeRule, NodeSpec, Schema, SchemaError};

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CommandError {
    message: String,
}

impl CommandError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct QueryError {
    message: String,
}

impl QueryError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

pub type CommandHandler =
    dyn Fn(&mut Editor, Option<Value>) -> Result<(), CommandError> + Send + Sync;
pub type QueryHandler = dyn Fn(&Editor, Option<Value>) -> Result<Value, QueryError> + Send + Sync;

#[derive(Clone)]
pub struct CommandSpec {
    pub id: String,
    pub label: String,
    pub description: Option<String>,
    pub keywords: Vec<String>,
    pub args_example: Option<Value>,
    pub handler: std::sync::Arc<CommandHandler>,
}

impl CommandSpec {
    pub fn new(
        id: impl Into<String>,
        label: impl Into<String>,
        handler: impl Fn(&mut Editor, Option<Value>) -> Result<(), CommandError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            label: label.into(),
            description: None,
            keywords: Vec::new(),
            args_example: None,
            handler: std::sync::Arc::new(handler),
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn keywords<I, S>(mut self, keywords: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.keywords = keywords.into_iter().map(Into::into).collect();
        self
    }

    pub fn args_example(mut self, args_example: Value) -> Self {
        self.args_example = Some(args_example);
        self
    }
}

#[derive(Clone)]
pub struct QuerySpec {
    pub id: String,
    pub handler: std::sync::Arc<QueryHandler>,
}

impl QuerySpec {
    pub fn new(
        id: impl Into<String>,
        handler: impl Fn(&Editor, Option<Value>) -> Result<Value, QueryError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            handler: std::sync::Arc::new(handler),
        }
    }
}

pub trait NormalizePass: Send + Sync {
    fn id(&self) -> &'static str;
    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op>;
}

pub trait PlatePlugin: Send + Sync {
    fn id(&self) -> &'static str;
    fn node_specs(&self) -> Vec<NodeSpec> {
        Vec::new()
    }
    fn attribute_rules(&self) -> Vec<AttributeRule> {
        Vec::new()
    }
    fn attribute_checks(&self) -> Vec<Box<dyn AttributeCheck>> {
        Vec::new()
    }
    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        Vec::new()
    }
    fn commands(&self) -> Vec<CommandSpec> {
        Vec::new()
    }
    fn queries(&self) -> Vec<QuerySpec> {
        Vec::new()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error(transparent)]
    Schema(#[from] SchemaError),
    #[error("duplicate command id: {0}")]
    DuplicateCommand(String),
    #[error("duplicate query id: {0}")]
    DuplicateQuery(String),
}

#[derive(Default)]
pub struct PluginRegistry {
    schema: Schema,
    normalize_passes: Vec<Box<dyn NormalizePass>>,
    commands: HashMap<String, CommandSpec>,
    queries: HashMap<String, QuerySpec>,
}

impl PluginRegistry {
    pub fn new(
        plugins: impl IntoIterator<Item = Box<dyn PlatePlugin>>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::default();
        for plugin in plugins {
            registry.register_plugin(plugin)?;
        }
        Ok(registry)
    }

    pub fn core_plugins() -> Vec<Box<dyn PlatePlugin>> {
        vec![
            Box::new(CoreParagraphPlugin),
            Box::new(CoreImagePlugin),
            Box::new(CoreNormalizePlugin),
            Box::new(CoreCommandsPlugin),
        ]
    }

    pub fn core() -> Self {
        Self::new(Self::core_plugins()).expect("core registry must be valid")
    }

    pub fn register_plugin(&mut self, plugin: Box<dyn PlatePlugin>) -> Result<(), RegistryError> {
        for spec in plugin.node_specs() {
            self.schema.register(spec)?;
        }

        for rule in plugin.attribute_rules() {
            self.schema.add_attribute_rule(rule);
        }
        for check in plugin.attribute_checks() {
            self.schema.add_boxed_attribute_check(check);
        }

        self.normalize_passes.extend(plugin.normalize_passes());

        for cmd in plugin.commands() {
            if self.commands.contains_key(&cmd.id) {
                return Err(RegistryError::DuplicateCommand(cmd.id));
            }
            self.commands.insert(cmd.id.clone(), cmd);
        }

        for query in plugin.queries() {
            if self.queries.contains_key(&query.id) {
                return Err(RegistryError::DuplicateQuery(query.id));
            }
            self.queries.insert(query.id.clone(), query);
        }

        tracing::trace!(plugin = plugin.id(), "registered plugin");
        Ok(())
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut Schema {
        &mut self.schema
    }

    pub fn command(&self, id: &str) -> Option<CommandSpec> {
        self.commands.get(id).cloned()
    }

    pub fn query(&self, id: &str) -> Option<QuerySpec> {
        self.queries.get(id).cloned()
    }

    /// Ops of the first pass with something to fix. Passes see the document
    /// as it was, so only one pass may contribute per round.
    pub fn normalize(&self, doc: &Document) -> Vec<Op> {
        for pass in &self.normalize_passes {
            let ops = pass.run(doc, self);
            if !ops.is_empty() {
                tracing::trace!(pass = pass.id(), ops = ops.len(), "normalize");
                return ops;
            }
        }
        Vec::new()
    }

    /// Snaps every point onto an existing text block and keeps ranges ordered.
    pub fn normalize_selection(&self, doc: &Document, selection: &Selection) -> Selection {
        let blocks = doc.text_blocks(&self.schema);
        let fallback = blocks
            .first()
            .map(|b| Point::new(b.path.clone(), 0))
            .unwrap_or_else(|| Point::new(vec![0], 0));

        let snap = |point: &Point| -> Point {
            if let Some(block) = blocks.iter().find(|b| b.path == point.path) {
                return Point::new(block.path.clone(), block.floor_char_boundary(point.offset));
            }
            blocks
                .iter()
                .find(|b| b.path >= point.path)
                .or(blocks.last())
                .map(|b| Point::new(b.path.clone(), 0))
                .unwrap_or_else(|| fallback.clone())
        };

        let mut ranges: Vec<Range> = selection
            .ranges
            .iter()
            .map(|range| {
                let start = snap(&range.start);
                let end = snap(&range.end);
                if start <= end {
                    Range::new(start, end)
                } else {
                    Range::new(end, start)
                }
            })
            .collect();
        if ranges.is_empty() {
            ranges.push(Range::collapsed(fallback.clone()));
        }

        Selection {
            ranges,
            backward: selection.backward,
            attr_overrides: selection.attr_overrides.clone(),
        }
    }
}

struct CoreParagraphPlugin;

impl PlatePlugin for CoreParagraphPlugin {
    fn id(&self) -> &'static str {
        "core.paragraph"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec::text_block("paragraph")]
    }
}

struct CoreImagePlugin;

impl PlatePlugin for CoreImagePlugin {
    fn id(&self) -> &'static str {
        "core.image"
    }

    fn node_specs(&self) -> Vec<NodeSpec> {
        vec![NodeSpec::inline_object("image")]
    }
}

struct CoreNormalizePlugin;

impl PlatePlugin for CoreNormalizePlugin {
    fn id(&self) -> &'static str {
        "core.normalize"
    }

    fn normalize_passes(&self) -> Vec<Box<dyn NormalizePass>> {
        vec![
            Box::new(EnsureNonEmptyDocument),
            Box::new(EnsureTextBlockHasTextLeaf),
            Box::new(MergeAdjacentTextLeaves),
        ]
    }
}

struct EnsureNonEmptyDocument;

impl NormalizePass for EnsureNonEmptyDocument {
    fn id(&self) -> &'static str {
        "core.ensure_non_empty_document"
    }

    fn run(&self, doc: &Document, _registry: &PluginRegistry) -> Vec<Op> {
        if doc.children.is_empty() {
            return vec![Op::InsertNode {
                path: vec![0],
                node: Node::paragraph(""),
            }];
        }
        Vec::new()
    }
}

struct EnsureTextBlockHasTextLeaf;

impl NormalizePass for EnsureTextBlockHasTextLeaf {
    fn id(&self) -> &'static str {
        "core.ensure_text_block_has_text_leaf"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        doc.text_blocks(registry.schema())
            .into_iter()
            .filter(|block| block.element.children.is_empty())
            .map(|block| {
                let mut path = block.path;
                path.push(0);
                Op::InsertNode {
                    path,
                    node: Node::text(""),
                }
            })
            .collect()
    }
}

/// Joins neighbouring text leaves with equal attributes and drops empty
/// leaves that sit next to another text leaf.
struct MergeAdjacentTextLeaves;

impl NormalizePass for MergeAdjacentTextLeaves {
    fn id(&self) -> &'static str {
        "core.merge_adjacent_text_leaves"
    }

    fn run(&self, doc: &Document, registry: &PluginRegistry) -> Vec<Op> {
        let mut ops = Vec::new();

        for block in doc.text_blocks(registry.schema()) {
            let children = &block.element.children;
            // Right to left so earlier paths stay valid while ops apply.
            let mut ix = children.len().saturating_sub(1);
            while ix > 0 {
                ix -= 1;
                let (Node::Text(left), Node::Text(right)) = (&children[ix], &children[ix + 1])
                else {
                    continue;
                };

                let mut path = block.path.clone();
                if left.attrs == right.attrs {
                    path.push(ix);
                    ops.push(Op::MergeText { path });
                } else if right.text.is_empty() {
                    path.push(ix + 1);
                    ops.push(Op::RemoveNode { path });
                } else if left.text.is_empty() {
                    path.push(ix);
                    ops.push(Op::RemoveNode { path });
                } else {
                    continue;
                }
                // The leaf at `ix` changed; its left pair waits for the next round.
                ix = ix.saturating_sub(1);
            }
        }

        ops
    }
}

struct CoreCommandsPlugin;

impl PlatePlugin for CoreCommandsPlugin {
    fn id(&self) -> &'static str {
        "core.commands"
    }

    fn commands(&self) -> Vec<CommandSpec> {
        vec![
            CommandSpec::new("core.insert_text", "Insert text", |editor, args| {
                let text = args
                    .as_ref()
                    .and_then(|v| v.get("text"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| CommandError::new("Missing args.text"))?
                    .to_string();
                let tx = insert_text(editor, text).map_err(CommandError::new)?;
                editor
                    .apply(tx)
                    .map_err(|e| CommandError::new(format!("Failed to insert text: {e}")))
            })
            .description("Insert text at the caret using the selection attributes.")
            .keywords(["insert", "type", "text"])
            .args_example(serde_json::json!({ "text": "foo" })),
        ]
    }
}

/// Builds the transaction typing `text` at a collapsed caret produces. The
/// new text carries the selection attributes.
pub fn insert_text(editor: &Editor, text: String) -> Result<Transaction, String> {
    let selection = editor.selection();
    if !selection.is_collapsed() {
        return Err("Insert text expects a collapsed selection".to_string());
    }
    let Some(caret) = selection.first_range().map(|r| r.start.clone()) else {
        return Err("Selection has no ranges".to_string());
    };

    let schema = editor.schema();
    let Some(block) = editor.doc().text_block(&caret.path, schema) else {
        return Err(format!("No text block at {:?}", caret.path));
    };
    let attrs = selection_attrs(editor.doc(), schema, selection);
    let len = text.len();
    let g = caret.offset;

    let leaf_path = |ix: usize| {
        let mut path = block.path.clone();
        path.push(ix);
        path
    };
    let fits = |node: &Node, attrs: &Attrs| matches!(node, Node::Text(t) if t.attrs == *attrs);
    let items = block.inline_items();

    let mut ops = Vec::new();
    if let Some(item) = items
        .iter()
        .find(|item| item.start < g && g <= item.end && fits(item.node, &attrs))
        .or_else(|| {
            items
                .iter()
                .find(|item| item.start == g && fits(item.node, &attrs))
        })
    {
        ops.push(Op::InsertText {
            path: leaf_path(item.index),
            offset: g - item.start,
            text,
        });
    } else if let Some(item) = items
        .iter()
        .find(|item| item.start == g && item.end == g && item.text().is_some())
    {
        let current = item.node.attrs();
        let mut patch = crate::core::AttrPatch::default();
        for (key, value) in &attrs {
            patch = patch.with_set(key.clone(), value.clone());
        }
        for key in current.keys().filter(|k| !attrs.contains_key(*k)) {
            patch = patch.with_removed(key.clone());
        }
        ops.push(Op::SetNodeAttrs {
            path: leaf_path(item.index),
            patch,
        });
        ops.push(Op::InsertText {
            path: leaf_path(item.index),
            offset: 0,
            text,
        });
    } else {
        let node = Node::text_with_attrs(text, attrs);
        let insert_at = match items.iter().find(|item| item.start < g && g < item.end) {
            Some(item) => {
                ops.push(Op::SplitText {
                    path: leaf_path(item.index),
                    offset: g - item.start,
                });
                item.index + 1
            }
            None => items
                .iter()
                .find(|item| item.start >= g)
                .map(|item| item.index)
                .unwrap_or(items.len()),
        };
        ops.push(Op::InsertNode {
            path: leaf_path(insert_at),
            node,
        });
    }

    let selection_after = Selection::collapsed(Point::new(block.path.clone(), g + len));
    Ok(Transaction::new(ops)
        .selection_after(selection_after)
        .source("command:core.insert_text"))
}
