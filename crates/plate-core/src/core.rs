use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::ops::{Op, Path, Transaction};
use crate::plugin::{CommandError, PluginRegistry, QueryError};
use crate::schema::{ROOT, Schema, SchemaContext, TEXT};

pub type Attrs = BTreeMap<String, serde_json::Value>;
pub type ElementKind = String;

/// An attribute counts as present unless it is missing, `null` or `false`.
pub fn attr_is_set(attrs: &Attrs, key: &str) -> bool {
    !matches!(
        attrs.get(key),
        None | Some(Value::Null) | Some(Value::Bool(false))
    )
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Document {
    #[serde(default)]
    pub children: Vec<Node>,
}

impl Document {
    pub fn node(&self, path: &[usize]) -> Option<&Node> {
        node_ref(self, path)
    }

    /// Every text block in document order.
    pub fn text_blocks<'a>(&'a self, schema: &Schema) -> Vec<TextBlock<'a>> {
        fn walk<'a>(
            nodes: &'a [Node],
            path: &mut Vec<usize>,
            kinds: &mut Vec<&'a str>,
            schema: &Schema,
            out: &mut Vec<TextBlock<'a>>,
        ) {
            for (ix, node) in nodes.iter().enumerate() {
                let Node::Element(el) = node else {
                    continue;
                };

                path.push(ix);
                kinds.push(el.kind.as_str());

                if schema.is_text_block(el) {
                    out.push(TextBlock {
                        path: path.clone(),
                        kinds: kinds.clone(),
                        element: el,
                    });
                } else {
                    walk(&el.children, path, kinds, schema, out);
                }

                kinds.pop();
                path.pop();
            }
        }

        let mut out = Vec::new();
        walk(
            &self.children,
            &mut Vec::new(),
            &mut Vec::new(),
            schema,
            &mut out,
        );
        out
    }

    pub fn text_block<'a>(&'a self, path: &[usize], schema: &Schema) -> Option<TextBlock<'a>> {
        let (&first, rest) = path.split_first()?;
        let mut node = self.children.get(first)?;
        let mut kinds: Vec<&'a str> = Vec::with_capacity(path.len());
        for &ix in rest {
            let Node::Element(el) = node else {
                return None;
            };
            kinds.push(el.kind.as_str());
            node = el.children.get(ix)?;
        }
        let Node::Element(element) = node else {
            return None;
        };
        if !schema.is_text_block(element) {
            return None;
        }
        kinds.push(element.kind.as_str());
        Some(TextBlock {
            path: path.to_vec(),
            kinds,
            element,
        })
    }

    /// Fails when a range is inverted or a point does not address a text block
    /// on a character boundary.
    pub fn check_selection(
        &self,
        schema: &Schema,
        selection: &Selection,
    ) -> Result<(), SelectionError> {
        selection.check()?;
        for range in &selection.ranges {
            for point in [&range.start, &range.end] {
                let Some(block) = self.text_block(&point.path, schema) else {
                    return Err(SelectionError::NotInTextBlock {
                        path: point.path.clone(),
                        offset: point.offset,
                    });
                };
                if point.offset > block.inline_len() {
                    return Err(SelectionError::OffsetOutOfBounds {
                        path: point.path.clone(),
                        offset: point.offset,
                        len: block.inline_len(),
                    });
                }
                if !block.is_char_boundary(point.offset) {
                    return Err(SelectionError::NotCharBoundary {
                        path: point.path.clone(),
                        offset: point.offset,
                    });
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "node", rename_all = "snake_case")]
pub enum Node {
    Element(ElementNode),
    Text(TextNode),
    Void(VoidNode),
}

impl Node {
    pub fn paragraph(text: impl Into<String>) -> Self {
        Self::element("paragraph", vec![Node::text(text)])
    }

    pub fn element(kind: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element(ElementNode {
            kind: kind.into(),
            attrs: Attrs::default(),
            children,
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            attrs: Attrs::default(),
        })
    }

    pub fn text_with_attrs(text: impl Into<String>, attrs: Attrs) -> Self {
        Node::Text(TextNode {
            text: text.into(),
            attrs,
        })
    }

    pub fn void(kind: impl Into<String>) -> Self {
        Node::Void(VoidNode {
            kind: kind.into(),
            attrs: Attrs::default(),
        })
    }

    pub fn attrs(&self) -> &Attrs {
        match self {
            Node::Element(el) => &el.attrs,
            Node::Text(t) => &t.attrs,
            Node::Void(v) => &v.attrs,
        }
    }

    fn attrs_mut(&mut self) -> &mut Attrs {
        match self {
            Node::Element(el) => &mut el.attrs,
            Node::Text(t) => &mut t.attrs,
            Node::Void(v) => &mut v.attrs,
        }
    }

    /// Width of the node in its text block's offset space.
    pub fn inline_len(&self) -> usize {
        match self {
            Node::Text(t) => t.text.len(),
            Node::Void(_) => 1,
            Node::Element(_) => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElementNode {
    pub kind: ElementKind,
    #[serde(default)]
    pub attrs: Attrs,
    #[serde(default)]
    pub children: Vec<Node>,
}

impl ElementNode {
    pub fn inline_len(&self) -> usize {
        self.children.iter().map(Node::inline_len).sum()
    }

    pub fn inline_items(&self) -> Vec<InlineItem<'_>> {
        let mut cursor = 0usize;
        self.children
            .iter()
            .enumerate()
            .map(|(index, node)| {
                let start = cursor;
                cursor += node.inline_len();
                InlineItem {
                    index,
                    start,
                    end: cursor,
                    node,
                }
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoidNode {
    pub kind: ElementKind,
    #[serde(default)]
    pub attrs: Attrs,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextNode {
    pub text: String,
    #[serde(default)]
    pub attrs: Attrs,
}

/// A child of a text block with its offsets in the block.
#[derive(Debug, Clone, Copy)]
pub struct InlineItem<'a> {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub node: &'a Node,
}

impl<'a> InlineItem<'a> {
    pub fn text(&self) -> Option<&'a TextNode> {
        match self.node {
            Node::Text(t) => Some(t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TextBlock<'a> {
    pub path: Path,
    /// Element kinds from the top level block down to this one.
    pub kinds: Vec<&'a str>,
    pub element: &'a ElementNode,
}

impl<'a> TextBlock<'a> {
    pub fn inline_len(&self) -> usize {
        self.element.inline_len()
    }

    pub fn inline_items(&self) -> Vec<InlineItem<'a>> {
        self.element.inline_items()
    }

    /// Schema context of `item` placed inside this block.
    pub fn context(&self, item: &str) -> SchemaContext {
        SchemaContext::new(
            std::iter::once(ROOT)
                .chain(self.kinds.iter().copied())
                .chain(std::iter::once(item)),
        )
    }

    pub fn text_context(&self) -> SchemaContext {
        self.context(TEXT)
    }

    /// False when `offset` falls inside a multi-byte character of a text leaf.
    pub fn is_char_boundary(&self, offset: usize) -> bool {
        self.inline_items().iter().all(|item| match item.text() {
            Some(text) if item.start < offset && offset < item.end => {
                text.text.is_char_boundary(offset - item.start)
            }
            _ => true,
        })
    }

    /// The nearest offset at or before `offset` that is a character boundary.
    pub fn floor_char_boundary(&self, offset: usize) -> usize {
        let offset = offset.min(self.inline_len());
        self.inline_items()
            .iter()
            .find(|item| item.start < offset && offset < item.end)
            .and_then(|item| item.text().map(|text| (item.start, text)))
            .map(|(start, text)| start + clamp_to_char_boundary(&text.text, offset - start))
            .unwrap_or(offset)
    }

    pub fn item_context(&self, item: &InlineItem<'_>) -> Option<SchemaContext> {
        match item.node {
            Node::Text(_) => Some(self.text_context()),
            Node::Void(v) => Some(self.context(&v.kind)),
            Node::Element(_) => None,
        }
    }
}

/// A position inside a text block: `path` addresses the block, `offset`
/// counts bytes of its inline content (each void counts one).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Point {
    #[serde(default)]
    pub path: Path,
    pub offset: usize,
}

impl Point {
    pub fn new(path: Path, offset: usize) -> Self {
        Self { path, offset }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Range {
    pub start: Point,
    pub end: Point,
}

impl Range {
    pub fn new(start: Point, end: Point) -> Self {
        Self { start, end }
    }

    pub fn collapsed(point: Point) -> Self {
        Self {
            start: point.clone(),
            end: point,
        }
    }

    pub fn is_collapsed(&self) -> bool {
        self.start == self.end
    }

    pub fn is_well_formed(&self) -> bool {
        self.start <= self.end
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub ranges: Vec<Range>,
    #[serde(default)]
    pub backward: bool,
    /// Explicit changes to the attributes inherited from the caret.
    #[serde(default, skip_serializing_if = "AttrPatch::is_empty")]
    pub attr_overrides: AttrPatch,
}

impl Selection {
    pub fn collapsed(point: Point) -> Self {
        Self::from_range(Range::collapsed(point))
    }

    pub fn from_range(range: Range) -> Self {
        Self::from_ranges(vec![range])
    }

    pub fn from_ranges(ranges: Vec<Range>) -> Self {
        Self {
            ranges,
            backward: false,
            attr_overrides: AttrPatch::default(),
        }
    }

    pub fn is_collapsed(&self) -> bool {
        matches!(self.ranges.as_slice(), [range] if range.is_collapsed())
    }

    pub fn first_range(&self) -> Option<&Range> {
        self.ranges.first()
    }

    pub fn anchor(&self) -> Option<&Point> {
        if self.backward {
            self.ranges.last().map(|r| &r.end)
        } else {
            self.ranges.first().map(|r| &r.start)
        }
    }

    pub fn focus(&self) -> Option<&Point> {
        if self.backward {
            self.ranges.first().map(|r| &r.start)
        } else {
            self.ranges.last().map(|r| &r.end)
        }
    }

    /// Structural well-formedness, independent of any document.
    pub fn check(&self) -> Result<(), SelectionError> {
        if self.ranges.is_empty() {
            return Err(SelectionError::Empty);
        }
        for range in &self.ranges {
            if !range.is_well_formed() {
                return Err(SelectionError::Malformed {
                    start: range.start.clone(),
                    end: range.end.clone(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SelectionError {
    #[error("selection has no ranges")]
    Empty,
    #[error("malformed range: start {start:?} is after end {end:?}")]
    Malformed { start: Point, end: Point },
    #[error("point {path:?}:{offset} does not address a text block")]
    NotInTextBlock { path: Path, offset: usize },
    #[error("point {path:?}:{offset} is past the end of its block (length {len})")]
    OffsetOutOfBounds {
        path: Path,
        offset: usize,
        len: usize,
    },
    #[error("point {path:?}:{offset} is inside a character")]
    NotCharBoundary { path: Path, offset: usize },
}

/// Attributes of the text a caret at `point` inherits: the leaf before the
/// caret, or the leaf after it when nothing but an object or the block start
/// precedes it.
pub fn caret_attrs(doc: &Document, schema: &Schema, point: &Point) -> Attrs {
    let Some(block) = doc.text_block(&point.path, schema) else {
        return Attrs::default();
    };
    let items = block.inline_items();
    let g = point.offset;

    let before = items
        .iter()
        .rev()
        .find(|item| item.start < g && g <= item.end);
    if let Some(text) = before.and_then(InlineItem::text) {
        return text.attrs.clone();
    }

    items
        .iter()
        .filter(|item| item.start == g && item.end > g)
        .find_map(InlineItem::text)
        .map(|text| text.attrs.clone())
        .unwrap_or_default()
}

/// Effective selection attributes: inherited from the caret (or from the
/// start of the first range) and patched by the selection's overrides.
pub fn selection_attrs(doc: &Document, schema: &Schema, selection: &Selection) -> Attrs {
    let inherited = match selection.first_range() {
        Some(range) if range.is_collapsed() => caret_attrs(doc, schema, &range.start),
        Some(range) => first_selected_text_attrs(doc, schema, range).unwrap_or_default(),
        None => Attrs::default(),
    };
    selection.attr_overrides.applied_to(inherited)
}

fn first_selected_text_attrs(doc: &Document, schema: &Schema, range: &Range) -> Option<Attrs> {
    let blocks = doc.text_blocks(schema);
    let start_ix = blocks.iter().position(|b| b.path == range.start.path)?;
    for block in blocks.iter().skip(start_ix) {
        let from = if block.path == range.start.path {
            range.start.offset
        } else {
            0
        };
        for item in block.inline_items() {
            if item.end <= from || item.start == item.end {
                continue;
            }
            if block.path == range.end.path && item.start >= range.end.offset {
                return None;
            }
            if let Some(text) = item.text() {
                return Some(text.attrs.clone());
            }
        }
        if block.path == range.end.path {
            break;
        }
    }
    None
}

#[derive(Debug, Clone)]
pub struct UndoRecord {
    pub inverse_ops: Vec<Op>,
    pub selection_before: Selection,
    pub selection_after: Selection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    pub max_undo: usize,
    pub max_normalize_iterations: usize,
}

impl EditorConfig {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }

    fn with_defaults(mut self) -> Self {
        if self.max_undo == 0 {
            self.max_undo = 200;
        }
        if self.max_normalize_iterations == 0 {
            self.max_normalize_iterations = 100;
        }
        self
    }
}

/// What a committed change touched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeEvent {
    pub document_changed: bool,
    pub selection_changed: bool,
    pub schema_changed: bool,
    pub source: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

pub type ChangeListener = Box<dyn Fn(&Editor, &ChangeEvent) + Send + Sync>;

pub struct Editor {
    doc: Document,
    selection: Selection,
    registry: PluginRegistry,
    config: EditorConfig,
    undo_stack: Vec<UndoRecord>,
    redo_stack: Vec<UndoRecord>,
    listeners: Vec<(ListenerId, ChangeListener)>,
    next_listener_id: u64,
}

impl Editor {
    pub fn new(doc: Document, selection: Selection, registry: PluginRegistry) -> Self {
        Self::with_config(doc, selection, registry, EditorConfig::default())
    }

    pub fn with_config(
        doc: Document,
        selection: Selection,
        registry: PluginRegistry,
        config: EditorConfig,
    ) -> Self {
        let mut editor = Self {
            doc,
            selection,
            registry,
            config: config.with_defaults(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
            listeners: Vec::new(),
            next_listener_id: 0,
        };
        editor.normalize_in_place();
        editor
    }

    pub fn doc(&self) -> &Document {
        &self.doc
    }

    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    /// Replaces the selection. Inverted ranges are rejected before anything
    /// changes; dangling points are snapped to the nearest text.
    pub fn set_selection(&mut self, selection: Selection) -> Result<(), SelectionError> {
        selection.check()?;
        let schema = self.registry.schema();
        for point in selection.ranges.iter().flat_map(|r| [&r.start, &r.end]) {
            let inside_char = self
                .doc
                .text_block(&point.path, schema)
                .is_some_and(|block| !block.is_char_boundary(point.offset));
            if inside_char {
                return Err(SelectionError::NotCharBoundary {
                    path: point.path.clone(),
                    offset: point.offset,
                });
            }
        }
        let before = std::mem::replace(&mut self.selection, selection);
        self.normalize_selection_in_place();
        if self.selection != before {
            self.emit(&ChangeEvent {
                selection_changed: true,
                ..ChangeEvent::default()
            });
        }
        Ok(())
    }

    /// Effective attributes of the selection, what typed text would get.
    pub fn selection_attrs(&self) -> Attrs {
        selection_attrs(&self.doc, self.registry.schema(), &self.selection)
    }

    pub fn set_selection_attribute(
        &mut self,
        key: impl Into<String>,
        value: Value,
    ) -> Result<(), ApplyError> {
        let overrides = self.selection.attr_overrides.clone().with_set(key, value);
        self.apply(
            Transaction::new(vec![Op::SetSelectionOverrides { overrides }])
                .source("selection:set_attribute"),
        )
    }

    pub fn remove_selection_attribute(&mut self, key: impl Into<String>) -> Result<(), ApplyError> {
        let overrides = self.selection.attr_overrides.clone().with_removed(key);
        self.apply(
            Transaction::new(vec![Op::SetSelectionOverrides { overrides }])
                .source("selection:remove_attribute"),
        )
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    pub fn schema(&self) -> &Schema {
        self.registry.schema()
    }

    /// Runs `f` against the schema and tells listeners it changed.
    pub fn update_schema<R>(&mut self, f: impl FnOnce(&mut Schema) -> R) -> R {
        let out = f(self.registry.schema_mut());
        self.emit(&ChangeEvent {
            schema_changed: true,
            ..ChangeEvent::default()
        });
        out
    }

    pub fn add_attribute_check<F>(&mut self, check: F)
    where
        F: Fn(&SchemaContext, &str) -> Option<bool> + Send + Sync + 'static,
    {
        self.update_schema(|schema| schema.add_attribute_check(check));
    }

    /// Subscribes to committed changes. Listeners run after the change is
    /// fully applied, never in the middle of a transaction.
    pub fn on_change(
        &mut self,
        listener: impl Fn(&Editor, &ChangeEvent) + Send + Sync + 'static,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener_id);
        self.next_listener_id += 1;
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn off_change(&mut self, id: ListenerId) -> bool {
        let before = self.listeners.len();
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
        self.listeners.len() != before
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    fn emit(&self, event: &ChangeEvent) {
        tracing::trace!(?event, listeners = self.listeners.len(), "emit change");
        for (_, listener) in &self.listeners {
            listener(self, event);
        }
    }

    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    pub fn undo(&mut self) -> bool {
        let Some(record) = self.undo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let doc_before = self.doc.clone();
        let mut redo_ops: Vec<Op> = Vec::new();
        for op in inverse_ops.iter().cloned() {
            if let Ok(inv) = self.apply_op(op) {
                redo_ops.push(inv);
            } else {
                // If we can't apply inverse ops, bail out and stop mutating further.
                break;
            }
        }
        redo_ops.reverse();

        self.selection = selection_before.clone();
        self.normalize_in_place();

        self.redo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: redo_ops,
        });
        self.emit(&ChangeEvent {
            document_changed: self.doc != doc_before,
            selection_changed: true,
            schema_changed: false,
            source: Some("undo".to_string()),
        });
        true
    }

    pub fn redo(&mut self) -> bool {
        let Some(record) = self.redo_stack.pop() else {
            return false;
        };

        let UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        } = record;

        let doc_before = self.doc.clone();
        let mut undo_ops: Vec<Op> = Vec::new();
        for op in inverse_ops.iter().cloned() {
            if let Ok(inv) = self.apply_op(op) {
                undo_ops.push(inv);
            } else {
                break;
            }
        }
        undo_ops.reverse();

        self.selection = selection_after.clone();
        self.normalize_in_place();

        self.undo_stack.push(UndoRecord {
            selection_before,
            selection_after,
            inverse_ops: undo_ops,
        });
        self.emit(&ChangeEvent {
            document_changed: self.doc != doc_before,
            selection_changed: true,
            schema_changed: false,
            source: Some("redo".to_string()),
        });
        true
    }

    /// Applies `tx` as one atomic change block. On error the document and
    /// selection are restored and no listener is notified.
    pub fn apply(&mut self, tx: Transaction) -> Result<(), ApplyError> {
        if let Some(sel) = &tx.selection_after {
            sel.check()?;
        }

        let doc_before = self.doc.clone();
        let selection_before = self.selection.clone();

        let inverse_ops = match self.apply_unchecked(&tx) {
            Ok(inverse_ops) => inverse_ops,
            Err(err) => {
                tracing::debug!(source = ?tx.meta.source, %err, "transaction rolled back");
                self.doc = doc_before;
                self.selection = selection_before;
                return Err(err);
            }
        };

        let selection_after = self.selection.clone();
        let event = ChangeEvent {
            document_changed: self.doc != doc_before,
            selection_changed: selection_after != selection_before,
            schema_changed: false,
            source: tx.meta.source.clone(),
        };
        tracing::debug!(source = ?tx.meta.source, ops = tx.ops.len(), "applied transaction");

        self.undo_stack.push(UndoRecord {
            inverse_ops,
            selection_before,
            selection_after,
        });
        self.redo_stack.clear();
        if self.undo_stack.len() > self.config.max_undo {
            self.undo_stack.remove(0);
        }

        if event.document_changed || event.selection_changed {
            self.emit(&event);
        }
        Ok(())
    }

    fn apply_unchecked(&mut self, tx: &Transaction) -> Result<Vec<Op>, ApplyError> {
        let mut inverse_ops: Vec<Op> = Vec::new();
        for op in tx.ops.iter().cloned() {
            let inv = self.apply_op(op)?;
            inverse_ops.push(inv);
        }

        if let Some(sel) = &tx.selection_after {
            self.selection = sel.clone();
        }

        let mut inverse_normalize = self.normalize_with_inverse_ops()?;
        inverse_ops.append(&mut inverse_normalize);
        inverse_ops.reverse();

        self.normalize_selection_in_place();
        Ok(inverse_ops)
    }

    pub fn run_command(
        &mut self,
        id: &str,
        args: Option<serde_json::Value>,
    ) -> Result<(), CommandError> {
        let Some(command) = self.registry.command(id) else {
            return Err(CommandError::new(format!("Unknown command: {id}")));
        };
        (command.handler)(self, args)
    }

    pub fn run_query_json(&self, id: &str, args: Option<Value>) -> Result<Value, QueryError> {
        let Some(query) = self.registry.query(id) else {
            return Err(QueryError::new(format!("Unknown query: {id}")));
        };
        (query.handler)(self, args)
    }

    pub fn run_query<T>(&self, id: &str, args: Option<Value>) -> Result<T, QueryError>
    where
        T: DeserializeOwned,
    {
        let value = self.run_query_json(id, args)?;
        serde_json::from_value(value)
            .map_err(|err| QueryError::new(format!("Failed to decode query result: {err}")))
    }

    fn normalize_in_place(&mut self) {
        if let Err(err) = self.normalize_with_inverse_ops() {
            tracing::warn!(%err, "document normalization failed");
        }
        self.normalize_selection_in_place();
    }

    fn normalize_selection_in_place(&mut self) {
        self.selection = self
            .registry
            .normalize_selection(&self.doc, &self.selection);
    }

    fn normalize_with_inverse_ops(&mut self) -> Result<Vec<Op>, ApplyError> {
        let mut inverse_ops: Vec<Op> = Vec::new();
        for _ in 0..self.config.max_normalize_iterations {
            let ops = self.registry.normalize(&self.doc);
            if ops.is_empty() {
                return Ok(inverse_ops);
            }
            for op in ops {
                let inv = self.apply_op(op)?;
                inverse_ops.push(inv);
            }
        }
        Err(ApplyError::NormalizeDidNotConverge)
    }

    fn apply_op(&mut self, op: Op) -> Result<Op, ApplyError> {
        apply_op_to(&mut self.doc, &mut self.selection, op)
    }
}

fn apply_op_to(doc: &mut Document, selection: &mut Selection, op: Op) -> Result<Op, ApplyError> {
    match op {
        Op::InsertText { path, offset, text } => {
            let leaf_start = leaf_start(doc, &path)?;
            let text_node = node_text_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&text_node.text, offset);
            text_node.text.insert_str(offset, &text);
            let at = leaf_start + offset;
            transform_selection_insert(selection, parent_of(&path), at, text.len());
            Ok(Op::RemoveText {
                path,
                range: offset..offset + text.len(),
            })
        }
        Op::RemoveText { path, range } => {
            let leaf_start = leaf_start(doc, &path)?;
            let text_node = node_text_mut(doc, &path)?;
            let start =
                clamp_to_char_boundary(&text_node.text, range.start.min(text_node.text.len()));
            let end = clamp_to_char_boundary(&text_node.text, range.end.min(text_node.text.len()));
            if start >= end {
                return Ok(Op::InsertText {
                    path,
                    offset: start,
                    text: String::new(),
                });
            }
            let removed = text_node.text[start..end].to_string();
            text_node.text.replace_range(start..end, "");
            transform_selection_remove(
                selection,
                parent_of(&path),
                leaf_start + start..leaf_start + end,
            );
            Ok(Op::InsertText {
                path,
                offset: start,
                text: removed,
            })
        }
        Op::InsertNode { path, node } => {
            let len = node.inline_len();
            insert_node(doc, &path, node)?;
            let offset = leaf_start(doc, &path)?;
            transform_selection_insert(selection, parent_of(&path), offset, len);
            transform_selection_insert_node(selection, &path);
            Ok(Op::RemoveNode { path })
        }
        Op::RemoveNode { path } => {
            let offset = leaf_start(doc, &path)?;
            let removed = remove_node(doc, &path)?;
            transform_selection_remove(
                selection,
                parent_of(&path),
                offset..offset + removed.inline_len(),
            );
            transform_selection_remove_node(selection, &path);
            Ok(Op::InsertNode {
                path,
                node: removed,
            })
        }
        Op::SetNodeAttrs { path, patch } => {
            let node = node_mut(doc, &path)?;
            let old = patch_apply(node.attrs_mut(), &patch);
            Ok(Op::SetNodeAttrs { path, patch: old })
        }
        Op::SplitText { path, offset } => {
            let (parent_path, index) = split_index(&path)?;
            let text_node = node_text_mut(doc, &path)?;
            let offset = clamp_to_char_boundary(&text_node.text, offset);
            let right = TextNode {
                text: text_node.text.split_off(offset),
                attrs: text_node.attrs.clone(),
            };
            let children = children_mut(doc, parent_path)?;
            children.insert(index + 1, Node::Text(right));
            Ok(Op::MergeText { path })
        }
        Op::MergeText { path } => {
            let (parent_path, index) = split_index(&path)?;
            let children = children_mut(doc, parent_path)?;
            let mergeable = matches!(
                (children.get(index), children.get(index + 1)),
                (Some(Node::Text(left)), Some(Node::Text(right))) if left.attrs == right.attrs
            );
            if !mergeable {
                return Err(ApplyError::IncompatibleMerge { path });
            }
            let Node::Text(right) = children.remove(index + 1) else {
                return Err(ApplyError::IncompatibleMerge { path });
            };
            let Some(Node::Text(left)) = children.get_mut(index) else {
                return Err(ApplyError::IncompatibleMerge { path });
            };
            let offset = left.text.len();
            left.text.push_str(&right.text);
            Ok(Op::SplitText { path, offset })
        }
        Op::SetSelectionOverrides { overrides } => {
            let old = std::mem::replace(&mut selection.attr_overrides, overrides);
            Ok(Op::SetSelectionOverrides { overrides: old })
        }
    }
}

#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("invalid path: {0}")]
    InvalidPath(String),
    #[error("text leaf at {path:?} cannot merge with its next sibling")]
    IncompatibleMerge { path: Path },
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error("normalization did not converge")]
    NormalizeDidNotConverge,
}

impl From<PathError> for ApplyError {
    fn from(value: PathError) -> Self {
        ApplyError::InvalidPath(value.0)
    }
}

#[derive(Debug, Error)]
#[error("{0}")]
pub struct PathError(pub String);

fn clamp_to_char_boundary(s: &str, mut ix: usize) -> usize {
    ix = ix.min(s.len());
    while ix > 0 && !s.is_char_boundary(ix) {
        ix -= 1;
    }
    ix
}

fn parent_of(path: &[usize]) -> &[usize] {
    path.split_last().map(|(_, parent)| parent).unwrap_or(&[])
}

fn split_index(path: &[usize]) -> Result<(&[usize], usize), PathError> {
    let (index, parent) = path
        .split_last()
        .ok_or_else(|| PathError("Empty path".into()))?;
    Ok((parent, *index))
}

/// Offset of the child at `path` in its parent's inline content.
fn leaf_start(doc: &Document, path: &[usize]) -> Result<usize, PathError> {
    let (parent, index) = split_index(path)?;
    let children = if parent.is_empty() {
        &doc.children
    } else {
        match node_ref(doc, parent) {
            Some(Node::Element(el)) => &el.children,
            _ => return Err(PathError(format!("No container at {parent:?}"))),
        }
    };
    Ok(children.iter().take(index).map(Node::inline_len).sum())
}

fn points_mut(selection: &mut Selection) -> impl Iterator<Item = &mut Point> {
    selection
        .ranges
        .iter_mut()
        .flat_map(|range| [&mut range.start, &mut range.end])
}

fn transform_selection_insert(selection: &mut Selection, block: &[usize], at: usize, len: usize) {
    if len == 0 {
        return;
    }
    for point in points_mut(selection) {
        if point.path == block && point.offset >= at {
            point.offset = point.offset.saturating_add(len);
        }
    }
}

fn transform_selection_remove(
    selection: &mut Selection,
    block: &[usize],
    range: std::ops::Range<usize>,
) {
    let removed_len = range.end.saturating_sub(range.start);
    if removed_len == 0 {
        return;
    }
    for point in points_mut(selection) {
        if point.path != block || point.offset <= range.start {
            continue;
        }
        if point.offset >= range.end {
            point.offset = point.offset.saturating_sub(removed_len);
        } else {
            point.offset = range.start;
        }
    }
}

fn transform_selection_insert_node(selection: &mut Selection, path: &[usize]) {
    let Ok((parent_path, index)) = split_index(path) else {
        return;
    };

    for point in points_mut(selection) {
        if point.path.len() <= parent_path.len() {
            continue;
        }
        if !point.path.starts_with(parent_path) {
            continue;
        }
        let depth = parent_path.len();
        if point.path[depth] >= index {
            point.path[depth] += 1;
        }
    }
}

fn transform_selection_remove_node(selection: &mut Selection, path: &[usize]) {
    let Ok((parent_path, index)) = split_index(path) else {
        return;
    };

    for point in points_mut(selection) {
        if point.path.len() <= parent_path.len() {
            continue;
        }
        if !point.path.starts_with(parent_path) {
            continue;
        }
        let depth = parent_path.len();
        let ix = point.path[depth];
        if ix > index {
            point.path[depth] = ix - 1;
            continue;
        }
        if ix < index {
            continue;
        }

        // Point was inside the removed subtree; selection normalization
        // snaps it to the nearest surviving text block.
        point.path.truncate(depth + 1);
        point.path[depth] = index.saturating_sub(1);
        point.offset = 0;
    }
}

fn node_ref<'a>(doc: &'a Document, path: &[usize]) -> Option<&'a Node> {
    let (&first, rest) = path.split_first()?;
    let mut node = doc.children.get(first)?;
    for &ix in rest {
        node = match node {
            Node::Element(el) => el.children.get(ix)?,
            Node::Void(_) | Node::Text(_) => return None,
        };
    }
    Some(node)
}

fn node_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut Node, PathError> {
    let (&first, rest) = path
        .split_first()
        .ok_or_else(|| PathError("Empty path".into()))?;

    let len = doc.children.len();
    let mut node = doc.children.get_mut(first).ok_or_else(|| {
        PathError(format!("Path out of bounds at depth 0: {first} >= {len}"))
    })?;

    for (depth, &ix) in rest.iter().enumerate() {
        node = match node {
            Node::Element(el) => {
                let len = el.children.len();
                el.children.get_mut(ix).ok_or_else(|| {
                    PathError(format!(
                        "Path out of bounds at depth {}: {ix} >= {len}",
                        depth + 1
                    ))
                })?
            }
            Node::Void(_) | Node::Text(_) => {
                return Err(PathError(format!("Non-container node at depth {depth}")));
            }
        };
    }
    Ok(node)
}

fn node_text_mut<'a>(doc: &'a mut Document, path: &[usize]) -> Result<&'a mut TextNode, PathError> {
    match node_mut(doc, path)? {
        Node::Text(t) => Ok(t),
        _ => Err(PathError("Expected Text node".into())),
    }
}

fn children_mut<'a>(
    doc: &'a mut Document,
    parent_path: &[usize],
) -> Result<&'a mut Vec<Node>, PathError> {
    if parent_path.is_empty() {
        return Ok(&mut doc.children);
    }
    match node_mut(doc, parent_path)? {
        Node::Element(el) => Ok(&mut el.children),
        Node::Void(_) | Node::Text(_) => Err(PathError("Parent is not a container".into())),
    }
}

fn insert_node(doc: &mut Document, path: &[usize], node: Node) -> Result<(), PathError> {
    let (parent_path, index) = split_index(path)?;
    let children = children_mut(doc, parent_path)?;
    if index > children.len() {
        return Err(PathError(format!(
            "Insert index out of bounds: {index} > {}",
            children.len()
        )));
    }
    children.insert(index, node);
    Ok(())
}

fn remove_node(doc: &mut Document, path: &[usize]) -> Result<Node, PathError> {
    let (parent_path, index) = split_index(path)?;
    let children = children_mut(doc, parent_path)?;
    if index >= children.len() {
        return Err(PathError(format!(
            "Remove index out of bounds: {index} >= {}",
            children.len()
        )));
    }
    Ok(children.remove(index))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttrPatch {
    #[serde(default)]
    pub set: Attrs,
    #[serde(default)]
    pub remove: Vec<String>,
}

impl AttrPatch {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }

    pub fn with_set(mut self, key: impl Into<String>, value: Value) -> Self {
        let key = key.into();
        self.remove.retain(|k| *k != key);
        self.set.insert(key, value);
        self
    }

    pub fn with_removed(mut self, key: impl Into<String>) -> Self {
        let key = key.into();
        self.set.remove(&key);
        if !self.remove.contains(&key) {
            self.remove.push(key);
        }
        self
    }

    pub fn applied_to(&self, mut attrs: Attrs) -> Attrs {
        for (k, v) in &self.set {
            attrs.insert(k.clone(), v.clone());
        }
        for key in &self.remove {
            attrs.remove(key);
        }
        attrs
    }
}

fn patch_apply(attrs: &mut Attrs, patch: &AttrPatch) -> AttrPatch {
    let mut old_set: Attrs = Attrs::new();
    let mut old_remove: Vec<String> = Vec::new();

    for (k, v) in &patch.set {
        if let Some(prev) = attrs.insert(k.clone(), v.clone()) {
            old_set.insert(k.clone(), prev);
        } else {
            old_remove.push(k.clone());
        }
    }

    for key in &patch.remove {
        if let Some(prev) = attrs.remove(key) {
            old_set.insert(key.clone(), prev);
        }
    }

    AttrPatch {
        set: old_set,
        remove: old_remove,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(key: &str) -> Attrs {
        Attrs::from([(key.to_string(), json!(true))])
    }

    fn block() -> Document {
        Document {
            children: vec![Node::element(
                "paragraph",
                vec![
                    Node::text("foo"),
                    Node::text_with_attrs("bar", attrs("k")),
                    Node::void("image"),
                    Node::text("baz"),
                ],
            )],
        }
    }

    #[test]
    fn split_and_merge_keep_points_in_place() {
        let mut doc = block();
        let mut selection = Selection::from_range(Range::new(
            Point::new(vec![0], 4),
            Point::new(vec![0], 8),
        ));

        let inverse = apply_op_to(
            &mut doc,
            &mut selection,
            Op::SplitText {
                path: vec![0, 1],
                offset: 1,
            },
        )
        .unwrap();
        assert_eq!(inverse, Op::MergeText { path: vec![0, 1] });
        let Node::Element(el) = &doc.children[0] else {
            panic!("expected element");
        };
        assert_eq!(el.children.len(), 5);
        assert_eq!(el.children[2], Node::text_with_attrs("ar", attrs("k")));
        assert_eq!(selection.ranges[0].start.offset, 4);

        apply_op_to(&mut doc, &mut selection, inverse).unwrap();
        assert_eq!(doc, block());
    }

    #[test]
    fn merge_refuses_differing_attrs() {
        let mut doc = block();
        let mut selection = Selection::collapsed(Point::new(vec![0], 0));
        let err = apply_op_to(&mut doc, &mut selection, Op::MergeText { path: vec![0, 0] })
            .unwrap_err();
        assert!(matches!(err, ApplyError::IncompatibleMerge { .. }));
        assert_eq!(doc, block());
    }

    #[test]
    fn text_edits_shift_block_offsets() {
        let mut doc = block();
        let mut selection = Selection::from_range(Range::new(
            Point::new(vec![0], 3),
            Point::new(vec![0], 9),
        ));
        apply_op_to(
            &mut doc,
            &mut selection,
            Op::InsertText {
                path: vec![0, 1],
                offset: 0,
                text: "xx".into(),
            },
        )
        .unwrap();
        assert_eq!(selection.ranges[0].start.offset, 5);
        assert_eq!(selection.ranges[0].end.offset, 11);

        apply_op_to(&mut doc, &mut selection, Op::RemoveNode { path: vec![0, 2] }).unwrap();
        assert_eq!(selection.ranges[0].end.offset, 10);
    }

    #[test]
    fn caret_prefers_text_before_it() {
        let doc = block();
        let mut schema = Schema::new();
        schema
            .register(crate::schema::NodeSpec::text_block("paragraph"))
            .unwrap();
        schema
            .register(crate::schema::NodeSpec::inline_object("image"))
            .unwrap();

        assert!(attr_is_set(&caret_attrs(&doc, &schema, &Point::new(vec![0], 6)), "k"));
        assert!(!attr_is_set(&caret_attrs(&doc, &schema, &Point::new(vec![0], 3)), "k"));
        // After the image nothing precedes as text, so the next leaf wins.
        assert!(!attr_is_set(&caret_attrs(&doc, &schema, &Point::new(vec![0], 7)), "k"));
        assert!(caret_attrs(&doc, &schema, &Point::new(vec![0], 0)).is_empty());
    }

    #[test]
    fn selection_check_rejects_inverted_ranges() {
        let selection = Selection::from_range(Range::new(
            Point::new(vec![0], 5),
            Point::new(vec![0], 2),
        ));
        assert!(matches!(
            selection.check(),
            Err(SelectionError::Malformed { .. })
        ));
        assert_eq!(
            Selection::from_ranges(Vec::new()).check(),
            Err(SelectionError::Empty)
        );
    }

    #[test]
    fn anchor_and_focus_follow_direction() {
        let first = Range::new(Point::new(vec![0], 1), Point::new(vec![0], 2));
        let second = Range::new(Point::new(vec![1], 0), Point::new(vec![1], 3));
        let mut selection = Selection::from_ranges(vec![first, second]);

        assert_eq!(selection.anchor(), Some(&Point::new(vec![0], 1)));
        assert_eq!(selection.focus(), Some(&Point::new(vec![1], 3)));

        selection.backward = true;
        assert_eq!(selection.anchor(), Some(&Point::new(vec![1], 3)));
        assert_eq!(selection.focus(), Some(&Point::new(vec![0], 1)));
    }

    #[test]
    fn char_boundaries_inside_text_leaves() {
        let doc = Document {
            children: vec![Node::element(
                "paragraph",
                vec![Node::text("aé"), Node::void("image"), Node::text("b")],
            )],
        };
        let schema = Schema::new();
        let Some(block) = doc.text_block(&[0], &schema) else {
            panic!("paragraph is a text block");
        };

        assert!(block.is_char_boundary(1));
        assert!(!block.is_char_boundary(2));
        assert!(block.is_char_boundary(3));
        assert_eq!(block.floor_char_boundary(2), 1);
        assert_eq!(block.floor_char_boundary(4), 4);
        assert_eq!(block.floor_char_boundary(99), 5);
    }

    #[test]
    fn config_zero_means_default() {
        let config = EditorConfig::from_json_str(r#"{ "max_undo": 5 }"#)
            .unwrap()
            .with_defaults();
        assert_eq!(config.max_undo, 5);
        assert_eq!(config.max_normalize_iterations, 100);
    }
}
