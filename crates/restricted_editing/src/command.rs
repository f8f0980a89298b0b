use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use plate_core::{ApplyError, Editor, ListenerId, SelectionError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::attribute::ToggleContext;
use crate::config::RestrictedEditingConfig;

pub const COMMAND_ID: &str = "restricted_editing.exception";

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command has been destroyed")]
    Destroyed,
    #[error(transparent)]
    Selection(#[from] SelectionError),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error("invalid command arguments: {0}")]
    InvalidArgs(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteOptions {
    /// Sets (`true`) or removes (`false`) the attribute instead of toggling.
    #[serde(default)]
    pub force_value: Option<bool>,
}

impl ExecuteOptions {
    pub fn force(value: bool) -> Self {
        Self {
            force_value: Some(value),
        }
    }

    /// Reads command arguments; no arguments means a plain toggle.
    pub fn from_args(args: Option<serde_json::Value>) -> Result<Self, CommandError> {
        Ok(args
            .map(serde_json::from_value)
            .transpose()?
            .unwrap_or_default())
    }
}

/// Last observed value and enablement.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandState {
    pub value: bool,
    pub is_enabled: bool,
}

#[derive(Debug, Default)]
struct Shared {
    state: CommandState,
    disabled_by: BTreeSet<String>,
}

/// Toggles the restricted editing exception attribute on the selection.
///
/// `value` and `is_enabled` are computed from the editor on every call. The
/// [`CommandState`] returned by [`state`](Self::state) is refreshed by a
/// change listener after every committed change.
pub struct RestrictedEditingExceptionCommand {
    attribute: String,
    shared: Arc<RwLock<Shared>>,
    listeners: Vec<ListenerId>,
    destroyed: bool,
}

impl RestrictedEditingExceptionCommand {
    pub fn new(editor: &mut Editor) -> Self {
        Self::with_config(editor, RestrictedEditingConfig::default())
    }

    pub fn with_config(editor: &mut Editor, config: RestrictedEditingConfig) -> Self {
        let attribute = config.attribute;
        let shared = Arc::new(RwLock::new(Shared::default()));

        let listener = {
            let shared = shared.clone();
            let attribute = attribute.clone();
            editor.on_change(move |editor, event| {
                let mut shared = shared.write();
                let state = compute_state(editor, &attribute, &shared.disabled_by);
                shared.state = state;
                tracing::trace!(source = ?event.source, ?state, "refreshed command state");
            })
        };

        let command = Self {
            attribute,
            shared,
            listeners: vec![listener],
            destroyed: false,
        };
        command.refresh(editor);
        command
    }

    pub fn attribute(&self) -> &str {
        &self.attribute
    }

    pub fn value(&self, editor: &Editor) -> bool {
        self.context(editor).compute_value(editor.selection())
    }

    pub fn is_enabled(&self, editor: &Editor) -> bool {
        self.shared.read().disabled_by.is_empty()
            && self.context(editor).compute_enabled(editor.selection())
    }

    pub fn state(&self) -> CommandState {
        self.shared.read().state
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Recomputes the state snapshot from `editor`.
    pub fn refresh(&self, editor: &Editor) {
        let mut shared = self.shared.write();
        let state = compute_state(editor, &self.attribute, &shared.disabled_by);
        shared.state = state;
    }

    /// Disables the command until every `id` that disabled it clears.
    pub fn force_disabled(&self, editor: &Editor, id: impl Into<String>) {
        self.shared.write().disabled_by.insert(id.into());
        self.refresh(editor);
    }

    pub fn clear_force_disabled(&self, editor: &Editor, id: &str) {
        self.shared.write().disabled_by.remove(id);
        self.refresh(editor);
    }

    /// Toggles the attribute, or forces it with [`ExecuteOptions::force_value`].
    /// A disabled command does nothing.
    pub fn execute(
        &self,
        editor: &mut Editor,
        options: ExecuteOptions,
    ) -> Result<(), CommandError> {
        if self.destroyed {
            return Err(CommandError::Destroyed);
        }
        self.context(editor).check(editor.selection())?;
        if !self.shared.read().disabled_by.is_empty() {
            tracing::debug!(attribute = %self.attribute, "command is force disabled");
            return Ok(());
        }
        toggle(editor, &self.attribute, options)
    }

    /// Detaches the change listener. Calling it again does nothing.
    pub fn destroy(&mut self, editor: &mut Editor) {
        for id in self.listeners.drain(..) {
            editor.off_change(id);
        }
        self.destroyed = true;
    }

    fn context<'a>(&'a self, editor: &'a Editor) -> ToggleContext<'a> {
        ToggleContext::new(editor.doc(), editor.schema(), &self.attribute)
    }
}

fn compute_state(editor: &Editor, attribute: &str, disabled_by: &BTreeSet<String>) -> CommandState {
    let ctx = ToggleContext::new(editor.doc(), editor.schema(), attribute);
    let selection = editor.selection();
    CommandState {
        value: ctx.compute_value(selection),
        is_enabled: disabled_by.is_empty() && ctx.compute_enabled(selection),
    }
}

/// Sets, removes or toggles `attribute` on the editor's selection in one
/// transaction. Does nothing when the schema allows the attribute nowhere in
/// the selection.
pub fn toggle(
    editor: &mut Editor,
    attribute: &str,
    options: ExecuteOptions,
) -> Result<(), CommandError> {
    let tx = {
        let ctx = ToggleContext::new(editor.doc(), editor.schema(), attribute);
        let selection = editor.selection();
        ctx.check(selection)?;

        if !ctx.compute_enabled(selection) {
            tracing::debug!(attribute, "attribute not allowed in selection");
            return Ok(());
        }

        let target = options
            .force_value
            .unwrap_or_else(|| !ctx.compute_value(selection));
        let plan = ctx.plan(selection, target)?;
        if plan.is_empty() {
            tracing::debug!(attribute, target, "nothing to change");
            return Ok(());
        }
        tracing::debug!(
            attribute,
            target,
            mutations = plan.mutation_count(),
            "toggling attribute"
        );
        plan.into_transaction(editor.doc(), editor.schema(), attribute)
    };

    editor.apply(tx.source(format!("command:{COMMAND_ID}")))?;
    Ok(())
}
