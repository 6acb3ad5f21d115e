//! Prompt templates and response schemas for oracle calls.
//!
//! Templates are handlebars files embedded at compile time; response schemas
//! are JSON Schema documents attached to calls that require structured output.

use handlebars::{Context, Handlebars, Helper, HelperResult, Output, RenderContext};
use serde_json::Value;

use errata_shared::{ErrataError, Result};

/// Embedded prompt templates, keyed by the name stages use to request them.
const TEMPLATES: &[(&str, &str)] = &[
    (
        "single_error_analysis",
        include_str!("../prompts/single_error_analysis.hbs"),
    ),
    (
        "taxonomy_generation",
        include_str!("../prompts/taxonomy_generation.hbs"),
    ),
    (
        "taxonomy_update",
        include_str!("../prompts/taxonomy_update.hbs"),
    ),
    (
        "taxonomy_review",
        include_str!("../prompts/taxonomy_review.hbs"),
    ),
    (
        "classify_errors",
        include_str!("../prompts/classify_errors.hbs"),
    ),
];

/// Embedded response schemas, keyed by schema name.
const SCHEMAS: &[(&str, &str)] = &[
    ("single_error", include_str!("../schemas/single_error.json")),
    (
        "generate_taxonomy",
        include_str!("../schemas/generate_taxonomy.json"),
    ),
    (
        "update_taxonomy",
        include_str!("../schemas/update_taxonomy.json"),
    ),
    (
        "review_taxonomy",
        include_str!("../schemas/review_taxonomy.json"),
    ),
    (
        "classify_errors",
        include_str!("../schemas/classify_errors.json"),
    ),
];

/// Registry of prompt templates and response schemas.
pub struct PromptLibrary {
    registry: Handlebars<'static>,
}

impl PromptLibrary {
    /// Build the library with all embedded templates registered.
    pub fn new() -> Self {
        let mut registry = Handlebars::new();
        registry.register_helper("json", Box::new(json_helper));

        for (name, source) in TEMPLATES {
            registry
                .register_template_string(name, source)
                .unwrap_or_else(|e| panic!("embedded template '{name}' is invalid: {e}"));
        }

        Self { registry }
    }

    /// Render a prompt template with the given variables.
    pub fn render(&self, template_name: &str, vars: &Value) -> Result<String> {
        self.registry
            .render(template_name, vars)
            .map_err(|e| ErrataError::Oracle(format!("template '{template_name}': {e}")))
    }

    /// Look up a response schema by name.
    pub fn schema(&self, schema_name: &str) -> Option<Value> {
        SCHEMAS
            .iter()
            .find(|(name, _)| *name == schema_name)
            .and_then(|(_, source)| serde_json::from_str(source).ok())
    }

    /// Whether a template with this name is registered.
    pub fn has_template(&self, template_name: &str) -> bool {
        self.registry.has_template(template_name)
    }
}

impl Default for PromptLibrary {
    fn default() -> Self {
        Self::new()
    }
}

/// `{{json value}}` — render a value as pretty-printed JSON.
fn json_helper(
    h: &Helper,
    _: &Handlebars,
    _: &Context,
    _: &mut RenderContext,
    out: &mut dyn Output,
) -> HelperResult {
    if let Some(param) = h.param(0) {
        out.write(&serde_json::to_string_pretty(param.value()).unwrap_or_default())?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn all_templates_registered() {
        let lib = PromptLibrary::new();
        for (name, _) in TEMPLATES {
            assert!(lib.has_template(name), "missing template {name}");
        }
    }

    #[test]
    fn all_schemas_parse() {
        let lib = PromptLibrary::new();
        for (name, _) in SCHEMAS {
            let schema = lib.schema(name).unwrap_or_else(|| panic!("schema {name}"));
            assert!(schema.is_object());
        }
        assert!(lib.schema("nonexistent").is_none());
    }

    #[test]
    fn generation_prompt_includes_data_and_limits() {
        let lib = PromptLibrary::new();
        let vars = json!({
            "data_type": "error_title",
            "data": [["Dropped a constraint", 4], ["Arithmetic slip", 2]],
            "max_num_clusters": 5,
            "cluster_name_length": 5,
            "cluster_description_length": 30,
            "suggestion_length": 30,
            "explanation_length": 20,
        });
        let prompt = lib.render("taxonomy_generation", &vars).expect("render");
        assert!(prompt.contains("Dropped a constraint"));
        assert!(prompt.contains('4'));
        assert!(prompt.contains("at most 5 clusters"));
    }

    #[test]
    fn generation_prompt_mentions_parent_category() {
        let lib = PromptLibrary::new();
        let vars = json!({
            "data_type": "error_title",
            "data": [["Minor slip", 1]],
            "max_num_clusters": 3,
            "cluster_name_length": 5,
            "cluster_description_length": 30,
            "parent_category": "Reasoning Errors",
        });
        let prompt = lib.render("taxonomy_generation", &vars).expect("render");
        assert!(prompt.contains("Reasoning Errors"));
    }

    #[test]
    fn classify_prompt_embeds_taxonomy_json() {
        let lib = PromptLibrary::new();
        let vars = json!({
            "data_type": "error_title",
            "data": ["Arithmetic slip"],
            "taxonomy": {"clusters": [{"name": "Math", "description": "Calculation mistakes"}]},
        });
        let prompt = lib.render("classify_errors", &vars).expect("render");
        assert!(prompt.contains("Arithmetic slip"));
        assert!(prompt.contains("Calculation mistakes"));
    }
}
