//! Catalog view of the stored specs.
//!
//! Each plan's parameter descriptors are published as a JSON Schema so the
//! platform can render and validate provision requests.

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::warn;

use broker_core::{AsyncSupport, ParameterDescriptor, Plan, Spec};

const SCHEMA_URL: &str = "http://json-schema.org/draft-04/schema#";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Service {
    pub id: String,
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    pub bindable: bool,
    #[serde(rename = "async")]
    pub async_support: AsyncSupport,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub plans: Vec<ServicePlan>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServicePlan {
    pub id: String,
    pub name: String,
    pub description: String,
    pub free: bool,
    pub bindable: bool,
    #[serde(skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
    pub schemas: Value,
}

impl From<&Spec> for Service {
    fn from(spec: &Spec) -> Self {
        Service {
            id: spec.id.clone(),
            name: spec.fq_name.clone(),
            description: spec.description.clone(),
            tags: spec.tags.clone(),
            bindable: spec.bindable,
            async_support: spec.async_support,
            metadata: spec.metadata.clone(),
            plans: spec
                .plans
                .iter()
                .map(|plan| ServicePlan::from_plan(plan, spec.bindable))
                .collect(),
        }
    }
}

impl ServicePlan {
    fn from_plan(plan: &Plan, service_bindable: bool) -> Self {
        ServicePlan {
            id: plan.id.clone(),
            name: plan.name.clone(),
            description: plan.description.clone(),
            free: plan.free,
            bindable: plan.bindable || service_bindable,
            metadata: plan.metadata.clone(),
            schemas: parameters_to_schema(&plan.parameters),
        }
    }
}

/// JSON Schema type for a descriptor type, `None` when unknown.
fn schema_type(kind: &str) -> Option<&'static str> {
    match kind {
        "string" | "enum" => Some("string"),
        "int" | "integer" => Some("integer"),
        "object" => Some("object"),
        "array" => Some("array"),
        "bool" | "boolean" => Some("boolean"),
        "number" => Some("number"),
        "nil" | "null" => Some("null"),
        _ => None,
    }
}

fn property(param: &ParameterDescriptor) -> Value {
    let mut prop = Map::new();
    if !param.title.is_empty() {
        prop.insert("title".into(), json!(param.title));
    }
    if let Some(description) = &param.description {
        prop.insert("description".into(), json!(description));
    }
    if let Some(default) = &param.default {
        prop.insert("default".into(), default.clone());
    }
    if let Some(kind) = schema_type(&param.kind) {
        prop.insert("type".into(), json!(kind));
    }
    if let Some(max) = param.maxlength.filter(|m| *m > 0) {
        prop.insert("maxLength".into(), json!(max));
    }
    if let Some(pattern) = &param.pattern {
        match regex::Regex::new(pattern) {
            Ok(_) => {
                prop.insert("pattern".into(), json!(pattern));
            }
            Err(e) => warn!(parameter = %param.name, error = %e, "dropping invalid pattern"),
        }
    }
    if !param.allowed.is_empty() {
        prop.insert("enum".into(), json!(param.allowed));
    }
    Value::Object(prop)
}

/// Build the provision and bind schemas for a plan's parameters.
pub fn parameters_to_schema(params: &[ParameterDescriptor]) -> Value {
    let properties: Map<String, Value> = params
        .iter()
        .map(|p| (p.name.clone(), property(p)))
        .collect();
    let required: Vec<&str> = params
        .iter()
        .filter(|p| p.required)
        .map(|p| p.name.as_str())
        .collect();

    json!({
        "service_instance": {
            "create": {
                "parameters": {
                    "$schema": SCHEMA_URL,
                    "type": "object",
                    "properties": properties,
                    "required": required,
                }
            },
            "update": {}
        },
        "service_binding": {
            "create": {
                "parameters": {
                    "$schema": SCHEMA_URL,
                    "type": "object",
                    "properties": {},
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> Spec {
        let mut spec: Spec = serde_json::from_value(json!({
            "image": "org/db",
            "description": "a database",
            "tags": ["db"],
            "bindable": true,
            "plans": [{
                "name": "small",
                "free": true,
                "parameters": [
                    {"name": "size", "type": "int", "default": 1, "required": true},
                    {"name": "name", "type": "string", "pattern": "^[a-z]+$", "maxlength": 8},
                    {"name": "tier", "type": "enum", "enum": ["a", "b"]},
                    {"name": "bad", "type": "whatever", "pattern": "("}
                ]
            }]
        }))
        .unwrap();
        spec.assign_identity("local");
        spec
    }

    #[test]
    fn service_mirrors_spec() {
        let spec = spec();
        let service = Service::from(&spec);
        assert_eq!(service.id, spec.id);
        assert_eq!(service.name, "local-org-db");
        assert_eq!(service.plans.len(), 1);
        assert_eq!(service.plans[0].id, spec.plans[0].id);
        assert!(service.plans[0].bindable);
        assert!(service.plans[0].free);
        assert_eq!(serde_json::to_value(&service).unwrap()["async"], "optional");
    }

    #[test]
    fn schema_maps_descriptor_fields() {
        let spec = spec();
        let schema = parameters_to_schema(&spec.plans[0].parameters);
        let params = &schema["service_instance"]["create"]["parameters"];
        assert_eq!(params["required"], json!(["size"]));

        let props = &params["properties"];
        assert_eq!(props["size"]["type"], "integer");
        assert_eq!(props["size"]["default"], 1);
        assert_eq!(props["name"]["pattern"], "^[a-z]+$");
        assert_eq!(props["name"]["maxLength"], 8);
        assert_eq!(props["tier"]["enum"], json!(["a", "b"]));
        assert!(props["bad"].get("type").is_none());
        assert!(props["bad"].get("pattern").is_none());
    }
}
