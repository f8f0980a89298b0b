use serde::{Deserialize, Serialize};

pub const DEFAULT_ATTRIBUTE: &str = "restrictedEditingException";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestrictedEditingConfig {
    /// Text attribute marking the editable exceptions.
    pub attribute: String,
}

impl Default for RestrictedEditingConfig {
    fn default() -> Self {
        Self {
            attribute: DEFAULT_ATTRIBUTE.to_string(),
        }
    }
}

impl RestrictedEditingConfig {
    pub fn from_json_str(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s)
    }
}
