use serde::{Deserialize, Serialize};

/// Structured decision returned by the query classifier: either an accepted
/// image request with an extracted description, or a rejection with a reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryClassification {
    pub is_image_request: bool,
    pub confidence: f64,
    #[serde(default)]
    pub image_description: Option<String>,
    #[serde(default)]
    pub rejection_reason: Option<String>,
}

impl QueryClassification {
    /// The extracted image description, falling back to the raw query when
    /// the classifier did not produce one.
    pub fn description_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.image_description
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(fallback)
    }
}
