use schemars::{schema_for, JsonSchema};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One aggregated theme or language with the number of reviews behind it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LabelCount {
    pub label: String,
    pub count: u32,
}

/// What the model extracts from the reviews of one listing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct EnrichmentResult {
    pub num_places: Option<u32>,
    pub parking_min: Option<f64>,
    pub parking_max: Option<f64>,
    pub electricity_eur: Option<f64>,
    #[serde(default)]
    pub top_languages: Vec<LabelCount>,
    #[serde(default)]
    pub pros: Vec<LabelCount>,
    #[serde(default)]
    pub cons: Vec<LabelCount>,
}

impl EnrichmentResult {
    pub fn is_empty(&self) -> bool {
        *self == EnrichmentResult::default()
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("parking_min", self.parking_min),
            ("parking_max", self.parking_max),
            ("electricity_eur", self.electricity_eur),
        ] {
            if let Some(v) = value {
                if !v.is_finite() || v < 0.0 {
                    return Err(format!("{} out of range: {}", name, v));
                }
            }
        }
        if let (Some(min), Some(max)) = (self.parking_min, self.parking_max) {
            if min > max {
                return Err(format!("parking_min {} exceeds parking_max {}", min, max));
            }
        }
        for (name, list) in [
            ("top_languages", &self.top_languages),
            ("pros", &self.pros),
            ("cons", &self.cons),
        ] {
            if list.iter().any(|lc| lc.label.trim().is_empty()) {
                return Err(format!("empty label in {}", name));
            }
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("malformed response: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("response failed validation: {0}")]
    Invalid(String),
}

/// Strip code fences, then deserialize strictly and validate.
pub fn parse_response(text: &str) -> Result<EnrichmentResult, ResponseError> {
    let result: EnrichmentResult = serde_json::from_str(strip_code_blocks(text))?;
    result.validate().map_err(ResponseError::Invalid)?;
    Ok(result)
}

pub fn strip_code_blocks(response: &str) -> &str {
    response
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim()
}

/// `label (count); label (count)`, in model order.
pub fn format_label_counts(items: &[LabelCount]) -> String {
    items
        .iter()
        .map(|lc| format!("{} ({})", lc.label.trim(), lc.count))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Fully inlined JSON schema with closed objects, suitable as a response
/// schema for structured output.
pub fn response_schema() -> Value {
    let schema = schema_for!(EnrichmentResult);
    let mut value = serde_json::to_value(schema).unwrap_or_default();

    close_objects(&mut value);
    inline_refs(&mut value);

    if let Value::Object(map) = &mut value {
        map.remove("definitions");
        map.remove("$schema");
        map.remove("title");
    }
    value
}

fn close_objects(value: &mut Value) {
    match value {
        Value::Object(map) => {
            if map.get("type") == Some(&Value::String("object".into())) {
                map.insert("additionalProperties".into(), Value::Bool(false));
            }
            for (_, v) in map.iter_mut() {
                close_objects(v);
            }
        }
        Value::Array(arr) => arr.iter_mut().for_each(close_objects),
        _ => {}
    }
}

fn inline_refs(value: &mut Value) {
    let definitions = match value {
        Value::Object(map) => map.get("definitions").cloned(),
        _ => None,
    };
    if let Some(defs) = definitions {
        inline_refs_recursive(value, &defs);
    }
}

fn inline_refs_recursive(value: &mut Value, definitions: &Value) {
    match value {
        Value::Object(map) => {
            if let Some(Value::String(ref_path)) = map.get("$ref").cloned() {
                let name = ref_path.trim_start_matches("#/definitions/");
                if let Some(def) = definitions.get(name) {
                    *value = def.clone();
                    inline_refs_recursive(value, definitions);
                    return;
                }
            }
            for (_, v) in map.iter_mut() {
                inline_refs_recursive(v, definitions);
            }
        }
        Value::Array(arr) => {
            for item in arr.iter_mut() {
                inline_refs_recursive(item, definitions);
            }
        }
        _ => {}
    }
}
