use std::path::Path;

use serde::Deserialize;
use tracing::warn;

const PRO_SLOT: &str = "{pro_taxonomy_block}";
const CON_SLOT: &str = "{con_taxonomy_block}";

const DEFAULT_TEMPLATE: &str = r#"You analyse visitor reviews of a single overnight parking spot.
The user message starts with ANALYZE: followed by a JSON object with
"places_count", "parking_cost" and "all_reviews" (each review is "[YYYY-MM-DD]: text").

Return one JSON object with exactly these keys:
- num_places: integer number of places, or null when neither places_count nor the reviews state it
- parking_min, parking_max: lowest and highest nightly parking price in EUR seen in parking_cost or recent reviews, or null; 0 means free
- electricity_eur: price of electricity in EUR if mentioned, else null
- top_languages: [{"label": language, "count": reviews written in it}], most frequent first, at most 3
- pros, cons: [{"label": topic, "count": reviews mentioning it}], most frequent first, at most 5 each

Aggregation rules:
- Count a topic once per review.
- Prefer recent reviews when prices conflict.
- Only use topic labels from the lists below; drop anything that does not fit.

Pro topics:
{pro_taxonomy_block}

Con topics:
{con_taxonomy_block}
"#;

const FALLBACK_TOPICS: &str = "- (no fixed list: use short lowercase topic labels)";

#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    #[error("failed to read prompt template {path}: {source}")]
    Template {
        path: String,
        source: std::io::Error,
    },
    #[error("invalid taxonomy file {path}: {message}")]
    Taxonomy { path: String, message: String },
}

#[derive(Debug, Default, Deserialize)]
pub struct Taxonomy {
    #[serde(default)]
    pub pros: Vec<serde_json::Value>,
    #[serde(default)]
    pub cons: Vec<serde_json::Value>,
}

impl Taxonomy {
    pub fn parse(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub fn pro_block(&self) -> String {
        topic_block(&self.pros)
    }

    pub fn con_block(&self) -> String {
        topic_block(&self.cons)
    }
}

/// `- topic: description` per entry; entries that are not objects with a
/// `topic` are ignored.
fn topic_block(entries: &[serde_json::Value]) -> String {
    let lines: Vec<String> = entries
        .iter()
        .filter_map(|e| {
            let topic = e.get("topic")?.as_str()?.trim();
            if topic.is_empty() {
                return None;
            }
            let description = e.get("description").and_then(|d| d.as_str()).unwrap_or("").trim();
            Some(if description.is_empty() {
                format!("- {}", topic)
            } else {
                format!("- {}: {}", topic, description)
            })
        })
        .collect();
    if lines.is_empty() {
        FALLBACK_TOPICS.to_string()
    } else {
        lines.join("\n")
    }
}

pub fn render(template: &str, taxonomy: &Taxonomy) -> String {
    template
        .replace(PRO_SLOT, &taxonomy.pro_block())
        .replace(CON_SLOT, &taxonomy.con_block())
}

/// Build the system instruction once per run. A configured template that
/// cannot be read, or a taxonomy file that does not parse, is fatal; a
/// missing taxonomy file only loses the topic lists.
pub fn load_instruction(template_path: Option<&Path>, taxonomy_path: &Path) -> Result<String, PromptError> {
    let template = match template_path {
        Some(path) => std::fs::read_to_string(path).map_err(|source| PromptError::Template {
            path: path.display().to_string(),
            source,
        })?,
        None => DEFAULT_TEMPLATE.to_string(),
    };

    let taxonomy = match std::fs::read_to_string(taxonomy_path) {
        Ok(text) => Taxonomy::parse(&text).map_err(|e| PromptError::Taxonomy {
            path: taxonomy_path.display().to_string(),
            message: e.to_string(),
        })?,
        Err(e) => {
            warn!("Taxonomy {} not loaded ({}), using open topic labels", taxonomy_path.display(), e);
            Taxonomy::default()
        }
    };

    Ok(render(&template, &taxonomy))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_blocks() {
        let tax = Taxonomy::parse(
            r#"{"pros": [{"topic": "quiet", "description": "calm at night"}, "stray", {"topic": "view"}],
                "cons": []}"#,
        )
        .unwrap();
        assert_eq!(tax.pro_block(), "- quiet: calm at night\n- view");
        assert_eq!(tax.con_block(), FALLBACK_TOPICS);
    }

    #[test]
    fn default_template_fills_both_slots() {
        let tax = Taxonomy::parse(r#"{"pros": [{"topic": "quiet", "description": "calm"}], "cons": [{"topic": "noise", "description": "road"}]}"#).unwrap();
        let text = render(DEFAULT_TEMPLATE, &tax);
        assert!(text.contains("- quiet: calm"));
        assert!(text.contains("- noise: road"));
        assert!(!text.contains(PRO_SLOT));
        assert!(!text.contains(CON_SLOT));
    }

    #[test]
    fn missing_files() {
        let dir = tempfile::tempdir().unwrap();
        let missing_tax = dir.path().join("taxonomy.json");
        let text = load_instruction(None, &missing_tax).unwrap();
        assert!(text.contains(FALLBACK_TOPICS));

        let missing_template = dir.path().join("prompt.txt");
        assert!(matches!(
            load_instruction(Some(&missing_template), &missing_tax),
            Err(PromptError::Template { .. })
        ));

        std::fs::write(&missing_tax, "{ nope").unwrap();
        assert!(matches!(load_instruction(None, &missing_tax), Err(PromptError::Taxonomy { .. })));
    }
}
