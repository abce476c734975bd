//! Markdown rendering of the configuration schema for `--help-config`.

use schemars::schema::{InstanceType, RootSchema, Schema, SchemaObject, SingleOrVec};

/// Render the configuration schema as markdown.
pub fn render_markdown(schema: &RootSchema) -> String {
    let mut out = String::new();
    out.push_str("# Configuration reference\n\n");
    let required: Vec<String> = schema.schema.object.as_ref().map_or_else(Vec::new, |o| {
        o.required.iter().cloned().collect()
    });
    if let Some(object) = &schema.schema.object {
        for (name, property) in &object.properties {
            render_property(&mut out, name, property, required.contains(name));
        }
    }
    out
}

fn render_property(out: &mut String, name: &str, schema: &Schema, required: bool) {
    out.push_str(&format!("## `{name}`\n\n"));
    let object = match schema {
        Schema::Object(object) => object,
        Schema::Bool(_) => {
            out.push('\n');
            return;
        }
    };
    let mut notes: Vec<String> = Vec::new();
    if let Some(type_name) = type_name(object) {
        notes.push(format!("type: {type_name}"));
    }
    if required {
        notes.push("required".to_string());
    }
    if let Some(metadata) = &object.metadata {
        if let Some(default) = &metadata.default {
            notes.push(format!("default: `{default}`"));
        }
    }
    if !notes.is_empty() {
        out.push_str(&format!("*{}*\n\n", notes.join(", ")));
    }
    if let Some(description) = description(object) {
        out.push_str(&description);
        out.push_str("\n\n");
    }
}

fn description(object: &SchemaObject) -> Option<String> {
    object
        .metadata
        .as_ref()
        .and_then(|m| m.description.clone())
}

fn type_name(object: &SchemaObject) -> Option<String> {
    match &object.instance_type {
        Some(SingleOrVec::Single(t)) => Some(instance_type_name(t).to_string()),
        Some(SingleOrVec::Vec(ts)) => Some(
            ts.iter()
                .map(|t| instance_type_name(t).to_string())
                .collect::<Vec<_>>()
                .join(" | "),
        ),
        None => {
            if object.reference.is_some() {
                Some("object".to_string())
            } else {
                None
            }
        }
    }
}

fn instance_type_name(t: &InstanceType) -> &'static str {
    match t {
        InstanceType::Null => "null",
        InstanceType::Boolean => "boolean",
        InstanceType::Object => "object",
        InstanceType::Array => "array",
        InstanceType::Number => "number",
        InstanceType::String => "string",
        InstanceType::Integer => "integer",
    }
}
