//! Model registry: the flattened view of `models.*` used for `/models`,
//! `/switch` typo correction, modality-driven model picks, and fallback
//! chains.

use mozi_core::config::schema::ModelConfig;
use mozi_core::config::EffectiveConfig;

/// Maximum edit distance `/switch` tolerates when correcting a ref.
const MAX_TYPO_DISTANCE: usize = 2;
/// Fallback chain length handed to the kernel after the primary.
const MAX_FALLBACKS: usize = 3;

/// One registered model: its canonical `provider/id` ref, the config it
/// came from, and the config path it lives at (for degradation notices).
#[derive(Debug, Clone)]
pub struct RegisteredModel {
    pub reference: String,
    pub config: ModelConfig,
    pub config_path: String,
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    models: Vec<RegisteredModel>,
}

impl ModelRegistry {
    pub fn from_config(config: &EffectiveConfig) -> Self {
        let mut models = Vec::new();
        for (provider_id, provider) in &config.models {
            for (i, model) in provider.models.iter().enumerate() {
                models.push(RegisteredModel {
                    reference: format!("{provider_id}/{}", model.id),
                    config: model.clone(),
                    config_path: format!("models.{provider_id}.models[{i}]"),
                });
            }
        }
        Self { models }
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    pub fn refs(&self) -> Vec<String> {
        self.models.iter().map(|m| m.reference.clone()).collect()
    }

    pub fn get(&self, reference: &str) -> Option<&RegisteredModel> {
        self.models.iter().find(|m| m.reference == reference)
    }

    /// Resolve user input to a registered ref: exact match, bare model id,
    /// then closest ref within the typo budget.
    pub fn resolve(&self, input: &str) -> Option<String> {
        let input = input.trim();
        if input.is_empty() {
            return None;
        }
        if let Some(m) = self.get(input) {
            return Some(m.reference.clone());
        }
        if let Some(m) = self.models.iter().find(|m| m.config.id == input) {
            return Some(m.reference.clone());
        }

        let mut best: Option<(usize, &RegisteredModel)> = None;
        for model in &self.models {
            let d = strsim::levenshtein(&input.to_lowercase(), &model.reference.to_lowercase())
                .min(strsim::levenshtein(
                    &input.to_lowercase(),
                    &model.config.id.to_lowercase(),
                ));
            if d <= MAX_TYPO_DISTANCE && best.map(|(bd, _)| d < bd).unwrap_or(true) {
                best = Some((d, model));
            }
        }
        best.map(|(_, m)| m.reference.clone())
    }

    /// Models whose declared `input` set covers `modality`.
    pub fn by_modality(&self, modality: &str) -> Vec<&RegisteredModel> {
        self.models
            .iter()
            .filter(|m| m.config.input.iter().any(|i| i == modality))
            .collect()
    }

    /// Pick the first modality-capable model.
    pub fn pick_by_modality(&self, modality: &str) -> Option<String> {
        self.by_modality(modality).first().map(|m| m.reference.clone())
    }

    /// Fallback chain for a primary: the other registered refs in listing
    /// order, capped.
    pub fn fallbacks_for(&self, primary: &str) -> Vec<String> {
        self.models
            .iter()
            .map(|m| m.reference.clone())
            .filter(|r| r != primary)
            .take(MAX_FALLBACKS)
            .collect()
    }

    /// The primary model for an agent: session override > agent config >
    /// agents.defaults > first registered.
    pub fn primary_for(
        &self,
        config: &EffectiveConfig,
        agent_id: &str,
        session_override: Option<&str>,
    ) -> Option<String> {
        if let Some(over) = session_override {
            if let Some(resolved) = self.resolve(over) {
                return Some(resolved);
            }
        }
        let configured = config
            .agent(agent_id)
            .and_then(|a| a.model.clone())
            .or_else(|| config.agents.defaults.model.clone());
        if let Some(model) = configured {
            if let Some(resolved) = self.resolve(&model) {
                return Some(resolved);
            }
            // Configured but unregistered: pass through verbatim and let
            // the driver report it.
            return Some(model);
        }
        self.models.first().map(|m| m.reference.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> ModelRegistry {
        let config = EffectiveConfig::from_value(&json!({
            "models": {
                "anthropic": {
                    "apiKey": "sk-x",
                    "models": [
                        { "id": "claude-sonnet-4-5", "input": ["text", "image"] },
                        { "id": "claude-haiku-4-5", "input": ["text"] }
                    ]
                },
                "openai": {
                    "models": [
                        { "id": "gpt-4o-audio", "input": ["text", "audio"] }
                    ]
                }
            }
        }))
        .unwrap();
        ModelRegistry::from_config(&config)
    }

    #[test]
    fn refs_are_provider_qualified() {
        let refs = registry().refs();
        assert!(refs.contains(&"anthropic/claude-sonnet-4-5".to_string()));
        assert!(refs.contains(&"openai/gpt-4o-audio".to_string()));
    }

    #[test]
    fn resolve_exact_and_bare_id() {
        let r = registry();
        assert_eq!(
            r.resolve("anthropic/claude-haiku-4-5").as_deref(),
            Some("anthropic/claude-haiku-4-5")
        );
        assert_eq!(
            r.resolve("gpt-4o-audio").as_deref(),
            Some("openai/gpt-4o-audio")
        );
    }

    #[test]
    fn resolve_corrects_small_typos() {
        let r = registry();
        assert_eq!(
            r.resolve("claude-haiku-4-6").as_deref(),
            Some("anthropic/claude-haiku-4-5")
        );
        assert_eq!(
            r.resolve("gpt-4o-audoi").as_deref(),
            Some("openai/gpt-4o-audio")
        );
        assert_eq!(r.resolve("totally-unrelated"), None);
    }

    #[test]
    fn modality_pick_finds_audio_model() {
        let r = registry();
        assert_eq!(
            r.pick_by_modality("audio").as_deref(),
            Some("openai/gpt-4o-audio")
        );
        assert_eq!(
            r.pick_by_modality("image").as_deref(),
            Some("anthropic/claude-sonnet-4-5")
        );
        assert!(r.pick_by_modality("video").is_none());
    }

    #[test]
    fn fallbacks_exclude_primary() {
        let r = registry();
        let fallbacks = r.fallbacks_for("anthropic/claude-sonnet-4-5");
        assert!(!fallbacks.contains(&"anthropic/claude-sonnet-4-5".to_string()));
        assert_eq!(fallbacks.len(), 2);
    }

    #[test]
    fn config_paths_point_into_the_document() {
        let r = registry();
        let m = r.get("openai/gpt-4o-audio").unwrap();
        assert_eq!(m.config_path, "models.openai.models[0]");
    }
}
