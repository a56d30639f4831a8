//! JSON-schema cleaner: the upstream rejects a subset of standard
//! JSON-schema fields that OpenAI/Anthropic-style tool declarations carry.
//! Also wraps OpenAI-style tool declarations into the upstream's
//! `functionDeclarations` shape.

use serde_json::{Map, Value};

use gravgate_protocol::gemini::{FunctionDeclaration, Tool};
use gravgate_protocol::openai::ChatCompletionTool;

/// Cleans every tool's `parameters` schema and wraps the result into a
/// single upstream `Tool` carrying one `functionDeclarations` list, or
/// `None` when `tools` is empty.
pub fn map_openai_tools(tools: &[ChatCompletionTool]) -> Option<Tool> {
    if tools.is_empty() {
        return None;
    }
    let declarations = tools
        .iter()
        .map(|tool| {
            let mut parameters = tool.function.parameters.clone();
            if let Some(schema) = parameters.as_mut() {
                clean_schema(schema);
            }
            FunctionDeclaration {
                name: tool.function.name.clone(),
                description: tool.function.description.clone(),
                parameters,
            }
        })
        .collect();
    Some(Tool {
        function_declarations: Some(declarations),
    })
}

const DROP_FIELDS: &[&str] = &[
    "$schema",
    "additionalProperties",
    "uniqueItems",
    "exclusiveMinimum",
    "exclusiveMaximum",
];

const SURFACE_FIELDS: &[&str] = &[
    "minLength",
    "maxLength",
    "minimum",
    "maximum",
    "minItems",
    "maxItems",
    "minProperties",
    "maxProperties",
    "pattern",
    "format",
    "multipleOf",
];

/// Recursively cleans a tool `parameters` schema in place: drops fields the
/// upstream rejects outright, and surfaces validation-only fields found
/// anywhere in the schema (including nested under `properties`/`items`) as
/// a comma-joined suffix on the top-level `description`.
pub fn clean_schema(schema: &mut Value) {
    let mut surfaced = Vec::new();
    let mut additional_props_markers = Vec::new();
    clean_value(schema, &mut surfaced, &mut additional_props_markers);
    surfaced.append(&mut additional_props_markers);
    if !surfaced.is_empty()
        && let Value::Object(obj) = schema
    {
        let suffix = surfaced.join(", ");
        let description = obj
            .get("description")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let combined = if description.is_empty() {
            format!("({suffix})")
        } else {
            format!("{description} ({suffix})")
        };
        obj.insert("description".to_string(), Value::String(combined));
    }
}

fn clean_value(value: &mut Value, surfaced: &mut Vec<String>, additional_props_markers: &mut Vec<String>) {
    match value {
        Value::Object(obj) => clean_object(obj, surfaced, additional_props_markers),
        Value::Array(items) => {
            for item in items {
                clean_value(item, surfaced, additional_props_markers);
            }
        }
        _ => {}
    }
}

fn clean_object(obj: &mut Map<String, Value>, surfaced: &mut Vec<String>, additional_props_markers: &mut Vec<String>) {
    for field in SURFACE_FIELDS {
        if let Some(found) = obj.remove(*field) {
            let rendered = match &found {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            surfaced.push(format!("{field}: {rendered}"));
        }
    }

    for field in DROP_FIELDS {
        if *field == "additionalProperties" && obj.get("additionalProperties") == Some(&Value::Bool(false)) {
            additional_props_markers.push("no additional properties".to_string());
        }
        obj.remove(*field);
    }

    if let Some(Value::Array(items)) = obj.get("required")
        && items.is_empty()
    {
        obj.remove("required");
    }

    let child_keys: Vec<String> = obj
        .iter()
        .filter(|(_, v)| matches!(v, Value::Object(_) | Value::Array(_)))
        .map(|(k, _)| k.clone())
        .collect();
    for key in child_keys {
        if let Some(child) = obj.get_mut(&key) {
            clean_value(child, surfaced, additional_props_markers);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn map_openai_tools_returns_none_for_an_empty_list() {
        assert!(map_openai_tools(&[]).is_none());
    }

    #[test]
    fn map_openai_tools_wraps_and_cleans_each_declaration() {
        let tool = ChatCompletionTool {
            kind: "function".into(),
            function: gravgate_protocol::openai::FunctionDeclaration {
                name: "get_weather".into(),
                description: Some("fetch weather".into()),
                parameters: Some(json!({
                    "type": "object",
                    "properties": {"city": {"type": "string", "minLength": 1}},
                    "additionalProperties": false
                })),
            },
        };
        let wrapped = map_openai_tools(&[tool]).unwrap();
        let declarations = wrapped.function_declarations.unwrap();
        assert_eq!(declarations.len(), 1);
        assert_eq!(declarations[0].name, "get_weather");
        let params = declarations[0].parameters.as_ref().unwrap();
        assert!(!params.as_object().unwrap().contains_key("additionalProperties"));
        assert!(params["description"].as_str().unwrap().contains("no additional properties"));
    }

    #[test]
    fn drops_unsupported_fields_and_surfaces_constraints() {
        let mut schema = json!({
            "type": "object",
            "$schema": "http://json-schema.org/draft-07/schema#",
            "additionalProperties": false,
            "description": "a name",
            "properties": {
                "name": {
                    "type": "string",
                    "minLength": 1,
                    "maxLength": 50,
                    "pattern": "^[a-z]+$"
                }
            },
            "required": []
        });
        clean_schema(&mut schema);
        let obj = schema.as_object().unwrap();
        assert!(!obj.contains_key("$schema"));
        assert!(!obj.contains_key("additionalProperties"));
        assert!(!obj.contains_key("required"));
        let description = obj["description"].as_str().unwrap();
        assert!(description.contains("no additional properties"));

        let name_field = &obj["properties"]["name"];
        assert!(!name_field.as_object().unwrap().contains_key("minLength"));
        assert!(!name_field.as_object().unwrap().contains_key("pattern"));
    }

    #[test]
    fn surfaces_constraints_nested_under_properties_onto_the_top_level_description() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "x": {"type": "string", "minLength": 3, "pattern": "^a"}
            },
            "additionalProperties": false,
            "required": ["x"]
        });
        clean_schema(&mut schema);
        let obj = schema.as_object().unwrap();
        assert_eq!(obj["required"], json!(["x"]));
        assert_eq!(obj["properties"]["x"]["type"], "string");
        assert!(!obj["properties"]["x"].as_object().unwrap().contains_key("minLength"));
        assert!(!obj["properties"]["x"].as_object().unwrap().contains_key("pattern"));
        // Matches spec.md §8 scenario 3 verbatim: surfaced constraints first,
        // in declaration order, "no additional properties" appended last,
        // wrapped in parens even though there was no base description.
        assert_eq!(
            obj["description"].as_str().unwrap(),
            "(minLength: 3, pattern: ^a, no additional properties)"
        );
    }

    #[test]
    fn preserves_fields_outside_the_drop_and_surface_lists() {
        let mut schema = json!({
            "type": "object",
            "properties": {
                "count": {"type": "integer", "description": "how many"}
            }
        });
        clean_schema(&mut schema);
        assert_eq!(schema["properties"]["count"]["type"], "integer");
        assert_eq!(schema["properties"]["count"]["description"], "how many");
    }
}
