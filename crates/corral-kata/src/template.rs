//! Operator-supplied pod templates.
//!
//! A template is a YAML pod manifest with `{{NAME}}` placeholders. It is
//! rendered once per spawn, parsed, and checked for the fields the provider
//! relies on before the provider overlays its own name, labels, env and
//! volumes.

use corral_runtime::RuntimeError;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

pub type TemplateVars = BTreeMap<&'static str, String>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodTemplate {
    source: String,
}

impl PodTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    pub fn load(path: &Path) -> Result<Self, RuntimeError> {
        let source = std::fs::read_to_string(path).map_err(|e| {
            RuntimeError::configuration(format!("cannot read pod template: {e}"))
                .with_context("path", path.display())
        })?;
        Ok(Self::new(source))
    }

    /// Substitute every `{{NAME}}` placeholder. A placeholder with no value
    /// fails the whole render.
    pub fn render(&self, vars: &TemplateVars) -> Result<String, RuntimeError> {
        let mut out = String::with_capacity(self.source.len());
        let mut rest = self.source.as_str();
        let mut missing = Vec::new();

        while let Some(start) = rest.find("{{") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let Some(end) = after.find("}}") else {
                out.push_str(&rest[start..]);
                rest = "";
                break;
            };
            let name = &after[..end];
            if is_identifier(name) {
                match vars.get(name) {
                    Some(value) => out.push_str(value),
                    None => missing.push(name.to_owned()),
                }
            } else {
                out.push_str(&rest[start..start + 2 + end + 2]);
            }
            rest = &after[end + 2..];
        }
        out.push_str(rest);

        if !missing.is_empty() {
            missing.sort();
            missing.dedup();
            return Err(RuntimeError::configuration(format!(
                "pod template references undefined variables: {}",
                missing.join(", ")
            )));
        }
        Ok(out)
    }

    /// Render, parse and validate in one step.
    pub fn build(&self, vars: &TemplateVars, runtime_class: &str) -> Result<Value, RuntimeError> {
        let rendered = self.render(vars)?;
        let doc: Value = serde_yaml::from_str(&rendered).map_err(|e| {
            RuntimeError::configuration(format!("pod template is not valid YAML: {e}"))
        })?;
        validate(&doc, runtime_class)?;
        Ok(doc)
    }
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty() && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Check a parsed manifest is a pod bound to the expected runtime class.
pub fn validate(doc: &Value, runtime_class: &str) -> Result<(), RuntimeError> {
    let Some(map) = doc.as_object() else {
        return Err(RuntimeError::configuration(
            "pod template must be a mapping",
        ));
    };
    for field in ["apiVersion", "kind", "metadata", "spec"] {
        if !map.contains_key(field) {
            return Err(RuntimeError::configuration(format!(
                "pod template is missing required field: {field}"
            )));
        }
    }
    let kind = map.get("kind").and_then(Value::as_str).unwrap_or_default();
    if kind != "Pod" {
        return Err(RuntimeError::configuration(format!(
            "pod template must have kind Pod, got '{kind}'"
        )));
    }
    let class = doc
        .pointer("/spec/runtimeClassName")
        .and_then(Value::as_str);
    if class != Some(runtime_class) {
        return Err(RuntimeError::configuration(format!(
            "pod template runtimeClassName must be '{runtime_class}'"
        ))
        .with_context("found", class.unwrap_or("<unset>")));
    }
    Ok(())
}
