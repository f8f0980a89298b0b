use plate_core::{
    AttributeRule, CommandError, CommandSpec, PlatePlugin, PluginRegistry, QueryError, QuerySpec,
    RegistryError, TEXT,
};
use serde_json::Value;

use crate::attribute::{ToggleContext, exception_ranges};
use crate::command::{COMMAND_ID, ExecuteOptions, toggle};
use crate::config::RestrictedEditingConfig;

pub const VALUE_QUERY_ID: &str = "restricted_editing.exception_value";
pub const ENABLED_QUERY_ID: &str = "restricted_editing.exception_enabled";
pub const RANGES_QUERY_ID: &str = "restricted_editing.exception_ranges";

/// Allows the exception attribute on text and exposes the toggle by id.
#[derive(Debug, Clone, Default)]
pub struct RestrictedEditingPlugin {
    config: RestrictedEditingConfig,
}

impl RestrictedEditingPlugin {
    pub fn new(config: RestrictedEditingConfig) -> Self {
        Self { config }
    }
}

impl PlatePlugin for RestrictedEditingPlugin {
    fn id(&self) -> &'static str {
        "restricted_editing"
    }

    fn attribute_rules(&self) -> Vec<AttributeRule> {
        vec![AttributeRule::new(TEXT, [self.config.attribute.clone()])]
    }

    fn commands(&self) -> Vec<CommandSpec> {
        let attribute = self.config.attribute.clone();
        vec![
            CommandSpec::new(COMMAND_ID, "Restricted editing exception", move |editor, args| {
                let options =
                    ExecuteOptions::from_args(args).map_err(|e| CommandError::new(e.to_string()))?;
                toggle(editor, &attribute, options).map_err(|e| {
                    CommandError::new(format!("Failed to toggle restricted editing exception: {e}"))
                })
            })
            .description("Toggle the editable exception on the selection.")
            .keywords(["restricted", "editing", "exception", "editable"])
            .args_example(serde_json::json!({ "force_value": true })),
        ]
    }

    fn queries(&self) -> Vec<QuerySpec> {
        let value_key = self.config.attribute.clone();
        let enabled_key = self.config.attribute.clone();
        let ranges_key = self.config.attribute.clone();
        vec![
            QuerySpec::new(VALUE_QUERY_ID, move |editor, _args| {
                let ctx = ToggleContext::new(editor.doc(), editor.schema(), &value_key);
                Ok(Value::Bool(ctx.compute_value(editor.selection())))
            }),
            QuerySpec::new(ENABLED_QUERY_ID, move |editor, _args| {
                let ctx = ToggleContext::new(editor.doc(), editor.schema(), &enabled_key);
                Ok(Value::Bool(ctx.compute_enabled(editor.selection())))
            }),
            QuerySpec::new(RANGES_QUERY_ID, move |editor, _args| {
                let ranges = exception_ranges(editor.doc(), editor.schema(), &ranges_key);
                serde_json::to_value(ranges)
                    .map_err(|err| QueryError::new(format!("Failed to encode ranges: {err}")))
            }),
        ]
    }
}

/// The core registry with restricted editing on top.
pub fn registry(config: RestrictedEditingConfig) -> Result<PluginRegistry, RegistryError> {
    let mut plugins = PluginRegistry::core_plugins();
    plugins.push(Box::new(RestrictedEditingPlugin::new(config)));
    PluginRegistry::new(plugins)
}
