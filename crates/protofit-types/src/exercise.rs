use std::fmt;

use serde::{Deserialize, Serialize};

/// Labels understood by the stock analysis service.
pub const DEFAULT_EXERCISES: [&str; 3] = ["squat", "pushup", "bicep_curl"];

/// Exercise label as sent in the `exercise` field of an analysis request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Exercise(String);

impl Exercise {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn defaults() -> Vec<Exercise> {
        DEFAULT_EXERCISES.iter().map(|label| Exercise::new(*label)).collect()
    }

    /// Human readable name, e.g. `bicep_curl` -> `Bicep Curl`.
    pub fn display_name(&self) -> String {
        self.0
            .split('_')
            .filter(|part| !part.is_empty())
            .map(|part| {
                let mut chars = part.chars();
                match chars.next() {
                    Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                    None => String::new(),
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl fmt::Display for Exercise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Exercise {
    fn from(value: &str) -> Self {
        Exercise::new(value)
    }
}
