//! Identity middle node

use crate::runtime::Stage;

/// Forwards every meta unchanged
#[derive(Debug, Default)]
pub struct Passthrough {
    label: Option<String>,
}

impl Passthrough {
    pub fn new() -> Self {
        Self::default()
    }

    /// Passthrough that describes itself as `label` instead of its node name
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }
}

impl Stage for Passthrough {
    fn describe(&self, node_name: &str) -> String {
        match &self.label {
            Some(label) => format!("{} ({})", node_name, label),
            None => node_name.to_string(),
        }
    }
}
