use serde::{Deserialize, Serialize};

use crate::core::{AttrPatch, Node};

pub type Path = Vec<usize>;

/// A single reversible document mutation.
///
/// Text and node paths address leaves and elements in the tree; applying an
/// op yields its inverse, which is what the undo stack records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Op {
    InsertText {
        #[serde(default)]
        path: Path,
        offset: usize,
        text: String,
    },
    RemoveText {
        #[serde(default)]
        path: Path,
        range: std::ops::Range<usize>,
    },
    InsertNode {
        #[serde(default)]
        path: Path,
        node: Node,
    },
    RemoveNode {
        #[serde(default)]
        path: Path,
    },
    SetNodeAttrs {
        #[serde(default)]
        path: Path,
        patch: AttrPatch,
    },
    /// Splits the text leaf at `path` in two; both halves keep its attributes.
    SplitText {
        #[serde(default)]
        path: Path,
        offset: usize,
    },
    /// Joins the text leaf at `path` with its next sibling. Both leaves must
    /// carry identical attributes.
    MergeText {
        #[serde(default)]
        path: Path,
    },
    /// Replaces the selection's attribute overrides.
    SetSelectionOverrides { overrides: AttrPatch },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// One atomic change block: every op applies or none does.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    #[serde(default)]
    pub ops: Vec<Op>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_after: Option<crate::core::Selection>,
    #[serde(default)]
    pub meta: TransactionMeta,
}

impl Transaction {
    pub fn new(ops: Vec<Op>) -> Self {
        Self {
            ops,
            selection_after: None,
            meta: TransactionMeta::default(),
        }
    }

    pub fn selection_after(mut self, selection_after: crate::core::Selection) -> Self {
        self.selection_after = Some(selection_after);
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.meta.source = Some(source.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty() && self.selection_after.is_none()
    }
}
