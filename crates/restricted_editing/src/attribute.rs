//! Reading and toggling a boolean text attribute over a selection.
//!
//! Everything here is a pure function of the document, the selection and the
//! schema. Mutation happens only when a [`TogglePlan`] is turned into a
//! [`Transaction`] and applied by the editor.

use plate_core::{
    AttrPatch, AttributeValidator, Document, InlineItem, Node, Op, Path, Point, Range, Schema,
    Selection, SelectionError, TextBlock, Transaction, attr_is_set, selection_attrs,
};
use serde_json::Value;

/// What a slice of the selection is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SliceKind {
    /// Part of a text leaf, and whether the leaf carries the attribute.
    Text { has_attribute: bool },
    /// An inline object.
    Object,
}

/// The part of one inline item covered by a selection range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Slice {
    pub block: Path,
    pub item: usize,
    pub span: std::ops::Range<usize>,
    pub kind: SliceKind,
    pub allowed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttributeChange {
    Set,
    Remove,
}

/// A span of one text block whose text must gain or lose the attribute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeMutation {
    pub block: Path,
    pub span: std::ops::Range<usize>,
    pub change: AttributeChange,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TogglePlan {
    /// Collapsed selection: only the selection attributes change.
    Selection { overrides: AttrPatch },
    /// Mutations in document order, at most one per touching span.
    Document { mutations: Vec<AttributeMutation> },
}

impl TogglePlan {
    pub fn is_empty(&self) -> bool {
        match self {
            TogglePlan::Selection { .. } => false,
            TogglePlan::Document { mutations } => mutations.is_empty(),
        }
    }

    pub fn mutation_count(&self) -> usize {
        match self {
            TogglePlan::Selection { .. } => 1,
            TogglePlan::Document { mutations } => mutations.len(),
        }
    }

    /// Lowers the plan into split and attribute ops, right to left within
    /// each block so leaf paths computed on `doc` stay valid.
    pub fn into_transaction(self, doc: &Document, schema: &Schema, key: &str) -> Transaction {
        let mutations = match self {
            TogglePlan::Selection { overrides } => {
                return Transaction::new(vec![Op::SetSelectionOverrides { overrides }]);
            }
            TogglePlan::Document { mutations } => mutations,
        };

        let mut ops = Vec::new();
        for mutation in mutations.iter().rev() {
            let Some(block) = doc.text_block(&mutation.block, schema) else {
                continue;
            };
            let patch = match mutation.change {
                AttributeChange::Set => AttrPatch::default().with_set(key, Value::Bool(true)),
                AttributeChange::Remove => AttrPatch::default().with_removed(key),
            };
            let wants = mutation.change == AttributeChange::Set;

            for item in block.inline_items().iter().rev() {
                let Some(text) = item.text() else {
                    continue;
                };
                let lo = mutation.span.start.max(item.start);
                let hi = mutation.span.end.min(item.end);
                if lo >= hi || attr_is_set(&text.attrs, key) == wants {
                    continue;
                }

                let mut leaf = block.path.clone();
                leaf.push(item.index);
                if hi < item.end {
                    ops.push(Op::SplitText {
                        path: leaf.clone(),
                        offset: hi - item.start,
                    });
                }
                if lo > item.start {
                    ops.push(Op::SplitText {
                        path: leaf.clone(),
                        offset: lo - item.start,
                    });
                    if let Some(last) = leaf.last_mut() {
                        *last += 1;
                    }
                }
                ops.push(Op::SetNodeAttrs {
                    path: leaf,
                    patch: patch.clone(),
                });
            }
        }
        Transaction::new(ops)
    }
}

/// Reads and plans changes of one attribute key.
pub struct ToggleContext<'a> {
    doc: &'a Document,
    schema: &'a Schema,
    validator: &'a dyn AttributeValidator,
    key: &'a str,
}

impl<'a> ToggleContext<'a> {
    /// Uses `schema` both for document structure and for permissions.
    pub fn new(doc: &'a Document, schema: &'a Schema, key: &'a str) -> Self {
        Self::with_validator(doc, schema, schema, key)
    }

    pub fn with_validator(
        doc: &'a Document,
        schema: &'a Schema,
        validator: &'a dyn AttributeValidator,
        key: &'a str,
    ) -> Self {
        Self {
            doc,
            schema,
            validator,
            key,
        }
    }

    pub fn check(&self, selection: &Selection) -> Result<(), SelectionError> {
        self.doc.check_selection(self.schema, selection)
    }

    /// Whether the selection counts as carrying the attribute.
    ///
    /// A caret answers from the selection attributes. A range answers true
    /// only if every permitted text position in it carries the attribute.
    pub fn compute_value(&self, selection: &Selection) -> bool {
        if selection.is_collapsed() {
            let attrs = selection_attrs(self.doc, self.schema, selection);
            return attr_is_set(&attrs, self.key);
        }

        let slices = match self.selection_slices(selection) {
            Ok(slices) => slices,
            Err(err) => {
                tracing::warn!(%err, key = self.key, "cannot read attribute value");
                return false;
            }
        };

        let mut permitted = slices.iter().filter(|slice| slice.allowed).filter_map(|slice| {
            match slice.kind {
                SliceKind::Text { has_attribute } => Some(has_attribute),
                SliceKind::Object => None,
            }
        });
        match permitted.next() {
            Some(first) => first && permitted.all(|has| has),
            None => false,
        }
    }

    /// Whether the attribute may be applied anywhere in the selection.
    pub fn compute_enabled(&self, selection: &Selection) -> bool {
        if selection.is_collapsed() {
            let Some(caret) = selection.first_range().map(|r| &r.start) else {
                return false;
            };
            return self
                .doc
                .text_block(&caret.path, self.schema)
                .is_some_and(|block| {
                    self.validator
                        .is_attribute_allowed(&block.text_context(), self.key)
                });
        }

        match self.selection_slices(selection) {
            Ok(slices) => slices.iter().any(|slice| slice.allowed),
            Err(err) => {
                tracing::warn!(%err, key = self.key, "cannot read attribute enablement");
                false
            }
        }
    }

    /// Plans setting (`target == true`) or removing the attribute. Fails
    /// before planning anything if the selection is malformed.
    pub fn plan(&self, selection: &Selection, target: bool) -> Result<TogglePlan, SelectionError> {
        self.check(selection)?;

        if selection.is_collapsed() {
            let overrides = selection.attr_overrides.clone();
            let overrides = if target {
                overrides.with_set(self.key, Value::Bool(true))
            } else {
                overrides.with_removed(self.key)
            };
            return Ok(TogglePlan::Selection { overrides });
        }

        let change = if target {
            AttributeChange::Set
        } else {
            AttributeChange::Remove
        };
        let mut mutations: Vec<AttributeMutation> = self
            .selection_slices(selection)?
            .into_iter()
            .filter(|slice| slice.allowed)
            .filter(|slice| {
                matches!(slice.kind, SliceKind::Text { has_attribute } if has_attribute != target)
            })
            .map(|slice| AttributeMutation {
                block: slice.block,
                span: slice.span,
                change,
            })
            .collect();
        mutations.sort_by(|a, b| (&a.block, a.span.start).cmp(&(&b.block, b.span.start)));

        Ok(TogglePlan::Document {
            mutations: merge_touching(mutations),
        })
    }

    /// Slices of every range, in document order per range.
    pub fn selection_slices(&self, selection: &Selection) -> Result<Vec<Slice>, SelectionError> {
        selection.check()?;
        let blocks = self.doc.text_blocks(self.schema);
        let mut out = Vec::new();
        for range in &selection.ranges {
            self.range_slices(&blocks, range, &mut out)?;
        }
        Ok(out)
    }

    fn range_slices(
        &self,
        blocks: &[TextBlock<'_>],
        range: &Range,
        out: &mut Vec<Slice>,
    ) -> Result<(), SelectionError> {
        for point in [&range.start, &range.end] {
            if !blocks.iter().any(|b| b.path == point.path) {
                return Err(SelectionError::NotInTextBlock {
                    path: point.path.clone(),
                    offset: point.offset,
                });
            }
        }

        let in_range = blocks
            .iter()
            .filter(|b| b.path >= range.start.path && b.path <= range.end.path);
        for block in in_range {
            let lo = if block.path == range.start.path {
                range.start.offset
            } else {
                0
            };
            let hi = if block.path == range.end.path {
                range.end.offset
            } else {
                block.inline_len()
            };

            for item in block.inline_items() {
                let start = lo.max(item.start);
                let end = hi.min(item.end);
                if start >= end {
                    continue;
                }
                if let Some(slice) = self.slice(block, &item, start..end) {
                    out.push(slice);
                }
            }
        }
        Ok(())
    }

    fn slice(
        &self,
        block: &TextBlock<'_>,
        item: &InlineItem<'_>,
        span: std::ops::Range<usize>,
    ) -> Option<Slice> {
        let ctx = block.item_context(item)?;
        let kind = match item.node {
            Node::Text(text) => SliceKind::Text {
                has_attribute: attr_is_set(&text.attrs, self.key),
            },
            Node::Void(_) => SliceKind::Object,
            Node::Element(_) => return None,
        };
        Some(Slice {
            block: block.path.clone(),
            item: item.index,
            span,
            kind,
            allowed: self.validator.is_attribute_allowed(&ctx, self.key),
        })
    }
}

fn merge_touching(mutations: Vec<AttributeMutation>) -> Vec<AttributeMutation> {
    let mut merged: Vec<AttributeMutation> = Vec::with_capacity(mutations.len());
    for mutation in mutations {
        if let Some(last) = merged.last_mut() {
            if last.block == mutation.block
                && last.change == mutation.change
                && last.span.end >= mutation.span.start
            {
                last.span.end = last.span.end.max(mutation.span.end);
                continue;
            }
        }
        merged.push(mutation);
    }
    merged
}

/// Maximal runs of text carrying `key`, as ranges. Objects end a run.
pub fn exception_ranges(doc: &Document, schema: &Schema, key: &str) -> Vec<Range> {
    let mut ranges = Vec::new();
    for block in doc.text_blocks(schema) {
        let mut run: Option<std::ops::Range<usize>> = None;
        for item in block.inline_items() {
            let marked = item.text().is_some_and(|t| attr_is_set(&t.attrs, key));
            run = match (run, marked) {
                (Some(open), true) => Some(open.start..item.end),
                (None, true) => Some(item.start..item.end),
                (Some(open), false) if item.start == item.end => Some(open),
                (Some(open), false) => {
                    ranges.push(block_range(&block.path, open));
                    None
                }
                (None, false) => None,
            };
        }
        if let Some(open) = run {
            ranges.push(block_range(&block.path, open));
        }
    }
    ranges
}

fn block_range(path: &Path, span: std::ops::Range<usize>) -> Range {
    Range::new(
        Point::new(path.clone(), span.start),
        Point::new(path.clone(), span.end),
    )
}
