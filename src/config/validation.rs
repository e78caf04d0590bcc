//! Configuration validation logic.

use crate::config::schema::ProxyConfig;
use std::collections::HashSet;

/// Error type for configuration validation failures.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationError(pub String);

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Validation error: {}", self.0)
    }
}

/// Validate a ProxyConfig for semantic correctness.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    // 1. Model names must be globally unique
    let mut model_names = HashSet::new();
    for model in &config.models {
        if !model_names.insert(model.model.as_str()) {
            errors.push(ValidationError(format!(
                "Duplicate model name '{}'",
                model.model
            )));
        }
    }

    for model in &config.models {
        // 2. Backend ids unique within the model
        let mut backend_ids = HashSet::new();
        for backend in &model.backends {
            if !backend_ids.insert(backend.id.as_str()) {
                errors.push(ValidationError(format!(
                    "Model '{}' has duplicate backend id '{}'",
                    model.model, backend.id
                )));
            }

            // 3. Backend provider must equal the owning model's provider
            if backend.provider != model.provider {
                errors.push(ValidationError(format!(
                    "Backend '{}' of model '{}' uses provider '{}', model requires '{}'",
                    backend.id, model.model, backend.provider, model.provider
                )));
            }

            // 4. Provider config payload must match the declared provider
            if backend.provider_config.provider() != backend.provider {
                errors.push(ValidationError(format!(
                    "Backend '{}' of model '{}' declares provider '{}' but carries a '{}' config",
                    backend.id,
                    model.model,
                    backend.provider,
                    backend.provider_config.provider()
                )));
            }

            // 5. OpenAI base URLs must parse
            if let crate::config::schema::ProviderConfig::Openai { url, .. } =
                &backend.provider_config
            {
                if url::Url::parse(url).is_err() {
                    errors.push(ValidationError(format!(
                        "Backend '{}' of model '{}' has malformed url '{}'",
                        backend.id, model.model, url
                    )));
                }
            }
        }

        // 6. Min-error-rate options must be sane
        let opts = &model.min_error_rate_options;
        if !(0.0..=1.0).contains(&opts.circuit_breaker_threshold) {
            errors.push(ValidationError(format!(
                "Model '{}': circuit_breaker_threshold must be within [0, 1]",
                model.model
            )));
        }
        if opts.epsilon <= 0.0 {
            errors.push(ValidationError(format!(
                "Model '{}': epsilon must be > 0",
                model.model
            )));
        }
        if opts.time_window_minutes < 1 {
            errors.push(ValidationError(format!(
                "Model '{}': time_window_minutes must be >= 1",
                model.model
            )));
        }
    }

    // 7. API keys unique, with non-empty model sets referencing known models
    let mut keys = HashSet::new();
    for api_key in &config.api_keys {
        if !keys.insert(api_key.key.as_str()) {
            let prefix: String = api_key.key.chars().take(8).collect();
            errors.push(ValidationError(format!("Duplicate api key '{prefix}...'")));
        }
        if api_key.models.is_empty() {
            errors.push(ValidationError(format!(
                "Api key '{}' has an empty model list",
                api_key.description
            )));
        }
        for name in &api_key.models {
            if !model_names.contains(name.as_str()) {
                errors.push(ValidationError(format!(
                    "Api key '{}' references unknown model '{}'",
                    api_key.description, name
                )));
            }
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
