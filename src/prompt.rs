//! Prompt construction.
//!
//! [`PromptBuilder`] turns sampled parents into the text sent to a
//! generator. [`TemplatePromptBuilder`] fills `{placeholder}` slots in the
//! configured template:
//!
//! | Placeholder | Value |
//! |-------------|-------|
//! | `{system}` | `prompt.system_message` |
//! | `{parent}` | source of the first parent (or the seed text) |
//! | `{parent_metrics}` | one `name: value` line per parent metric |
//! | `{top_programs}` | the best programs across islands, fenced |
//! | `{artifacts}` | parent artifacts, when enabled |
//! | `{island}` | island index |
//!
//! Unknown placeholders are left as written.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use crate::candidate::Candidate;
use crate::config::PromptConfig;

/// Default system message.
pub fn default_system_message() -> String {
    "You are an expert programmer. Improve the given program so that it \
     scores higher on the evaluation metrics while keeping it correct."
        .to_string()
}

/// Default prompt template.
pub fn default_template() -> String {
    "{system}\n\n\
     # Current program (island {island})\n\
     ```\n{parent}\n```\n\n\
     ## Metrics\n{parent_metrics}\n\n\
     ## Top programs\n{top_programs}\n\
     {artifacts}\n\
     Rewrite the program to improve its score. Reply with the complete new \
     program in a single fenced code block.\n"
        .to_string()
}

/// Context about where the new candidate will live.
#[derive(Debug, Clone, Default)]
pub struct FeatureContext {
    /// Island the child is generated for.
    pub island: usize,
    /// Iteration index.
    pub iteration: u64,
    /// Best programs across all islands, best first.
    pub top_programs: Vec<Arc<Candidate>>,
    /// Parent text to use when the island has no occupants yet.
    pub fallback_source: Option<String>,
}

/// Builds the generator prompt for one iteration.
pub trait PromptBuilder: Send + Sync {
    /// Render a prompt from parents (best first) and context.
    fn build_prompt(
        &self,
        parents: &[Arc<Candidate>],
        context: &FeatureContext,
        config: &PromptConfig,
    ) -> String;
}

/// Placeholder-substituting [`PromptBuilder`].
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplatePromptBuilder;

impl PromptBuilder for TemplatePromptBuilder {
    fn build_prompt(
        &self,
        parents: &[Arc<Candidate>],
        context: &FeatureContext,
        config: &PromptConfig,
    ) -> String {
        let parent = parents.first();
        let parent_source = parent
            .map(|p| p.source.clone())
            .or_else(|| context.fallback_source.clone())
            .unwrap_or_default();

        let parent_metrics = parent.map_or_else(
            || "(not yet evaluated)".to_string(),
            |p| {
                p.metrics
                    .iter()
                    .map(|(k, v)| format!("- {k}: {v:.4}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            },
        );

        let mut top = String::new();
        for (rank, program) in context.top_programs.iter().enumerate() {
            let _ = write!(
                top,
                "### Program {} (score {:.4})\n```\n{}\n```\n",
                rank + 1,
                program.score(),
                program.source
            );
        }
        if top.is_empty() {
            top.push_str("(none yet)\n");
        }

        let artifacts = match parent {
            Some(p) if config.include_artifacts && !p.artifacts.is_empty() => {
                render_artifacts(&p.artifacts, config.max_artifact_bytes)
            }
            _ => String::new(),
        };

        let values = BTreeMap::from([
            ("system", config.system_message.clone()),
            ("parent", parent_source),
            ("parent_metrics", parent_metrics),
            ("top_programs", top),
            ("artifacts", artifacts),
            ("island", context.island.to_string()),
        ]);
        render(&config.template, &values)
    }
}

fn render_artifacts(artifacts: &BTreeMap<String, Vec<u8>>, max_bytes: usize) -> String {
    let mut out = String::from("## Artifacts from the last evaluation\n");
    for (name, bytes) in artifacts {
        let text = String::from_utf8_lossy(bytes);
        let _ = write!(out, "### {name}\n```\n{}\n```\n", truncate(&text, max_bytes));
    }
    out
}

/// Cut `text` to at most `max` bytes on a char boundary.
fn truncate(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Single-pass substitution so inserted text is never re-scanned.
fn render(template: &str, values: &BTreeMap<&str, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let tail = &rest[open..];
        let replaced = tail[1..].find('}').and_then(|close| {
            let name = &tail[1..=close];
            values.get(name).map(|v| (v, close + 2))
        });
        match replaced {
            Some((value, consumed)) => {
                out.push_str(value);
                rest = &tail[consumed..];
            }
            None => {
                out.push('{');
                rest = &tail[1..];
            }
        }
    }
    out.push_str(rest);
    out
}
