use once_cell::sync::Lazy;
use serde::Serialize;

/// A Copilot-served model the proxy can resolve requests against.
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub display_name: String,
    pub created_at: String,
    /// Whether the session library accepts a reasoning-effort setting for it.
    pub supports_reasoning_effort: bool,
}

impl ModelInfo {
    fn new(id: &str, display_name: &str, supports_reasoning_effort: bool) -> Self {
        Self {
            id: id.to_string(),
            display_name: display_name.to_string(),
            created_at: "2025-06-01T00:00:00Z".to_string(),
            supports_reasoning_effort,
        }
    }
}

/// The fixed set of models exposed on `/v1/models`.
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    models: Vec<ModelInfo>,
}

static DEFAULT_MODELS: Lazy<Vec<ModelInfo>> = Lazy::new(|| {
    vec![
        ModelInfo::new("claude-sonnet-4.5", "Claude Sonnet 4.5", false),
        ModelInfo::new("claude-sonnet-4", "Claude Sonnet 4", false),
        ModelInfo::new("claude-haiku-4.5", "Claude Haiku 4.5", false),
        ModelInfo::new("gpt-5", "GPT-5", true),
        ModelInfo::new("gpt-5-mini", "GPT-5 mini", true),
        ModelInfo::new("gpt-4.1", "GPT-4.1", false),
        ModelInfo::new("gemini-2.5-pro", "Gemini 2.5 Pro", false),
    ]
});

impl ModelCatalog {
    pub fn with_defaults() -> Self {
        Self {
            models: DEFAULT_MODELS.clone(),
        }
    }

    pub fn new(models: Vec<ModelInfo>) -> Self {
        Self { models }
    }

    /// Looks a requested id up; `None` means the request must be rejected.
    pub fn resolve(&self, id: &str) -> Option<&ModelInfo> {
        self.models.iter().find(|m| m.id == id)
    }

    pub fn list(&self) -> &[ModelInfo] {
        &self.models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_known_model() {
        let catalog = ModelCatalog::with_defaults();
        let model = catalog.resolve("claude-sonnet-4.5").unwrap();
        assert_eq!(model.display_name, "Claude Sonnet 4.5");
        assert!(!model.supports_reasoning_effort);
        assert!(catalog.resolve("gpt-5").unwrap().supports_reasoning_effort);
    }

    #[test]
    fn test_resolve_unknown_model() {
        let catalog = ModelCatalog::with_defaults();
        assert!(catalog.resolve("claude-1.0-instant").is_none());
    }
}
