//! Manifest rendering
//!
//! Chart rendering is an external concern; the controller only depends on
//! the [`ManifestRenderer`] trait. [`TemplateRenderer`] is the built-in
//! implementation: it substitutes `{{ .Values.x.y }}` and
//! `{{ .Release.Name }}` / `{{ .Release.Namespace }}` placeholders in YAML
//! and JSON manifests, then parses every document into a descriptor.

use regex::{Captures, Regex};
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::CoreError;
use crate::types::application::Application;
use crate::types::resource::ResourceDescriptor;
use crate::types::snapshot::SourceTree;

/// Values file picked up when the application does not name one
pub const DEFAULT_VALUES_FILE: &str = "values.yaml";

/// Turns a fetched source tree into concrete resource descriptors
pub trait ManifestRenderer: Send + Sync {
    fn render(&self, app: &Application, tree: &SourceTree) -> Result<Vec<ResourceDescriptor>, CoreError>;
}

/// Placeholder-substituting renderer for plain YAML/JSON manifests
pub struct TemplateRenderer {
    placeholder: Regex,
}

impl Default for TemplateRenderer {
    fn default() -> Self {
        Self::new()
    }
}

impl TemplateRenderer {
    pub fn new() -> Self {
        let placeholder = Regex::new(
            r"\{\{\s*\.(Values|Release)\.([A-Za-z0-9_\-]+(?:\.[A-Za-z0-9_\-]+)*)\s*\}\}",
        )
        .expect("placeholder pattern is valid");
        Self { placeholder }
    }

    /// Values file (if any) with the inline overlay merged on top
    pub fn merged_values(&self, app: &Application, tree: &SourceTree) -> Result<Value, CoreError> {
        let values_path = values_file_name(app);
        let mut values = match tree.files.get(values_path) {
            Some(bytes) => {
                let text = utf8(values_path, bytes)?;
                let parsed: Value = serde_yaml::from_str(text)
                    .map_err(|e| CoreError::Render(format!("{}: {}", values_path, e)))?;
                match parsed {
                    Value::Null => Value::Object(Map::new()),
                    Value::Object(_) => parsed,
                    _ => {
                        return Err(CoreError::Render(format!(
                            "{}: values must be a mapping",
                            values_path
                        )))
                    }
                }
            }
            None if app.source.values_file.is_some() => {
                return Err(CoreError::Render(format!(
                    "values file '{}' not found",
                    values_path
                )))
            }
            None => Value::Object(Map::new()),
        };
        merge_values(&mut values, &Value::Object(app.source.values.clone()));
        Ok(values)
    }

    /// Substitute every placeholder in `template`; unknown keys are errors
    pub fn render_text(&self, template: &str, app: &Application, values: &Value) -> Result<String, CoreError> {
        let mut missing: Option<String> = None;
        let rendered = self.placeholder.replace_all(template, |caps: &Captures| {
            let scope = &caps[1];
            let key = &caps[2];
            let found = match scope {
                "Release" => match key {
                    "Name" => Some(Value::String(app.name.clone())),
                    "Namespace" => Some(Value::String(app.destination.namespace.clone())),
                    _ => None,
                },
                _ => lookup(values, key).cloned(),
            };
            match found {
                Some(value) => value_to_text(&value),
                None => {
                    missing.get_or_insert_with(|| format!(".{}.{}", scope, key));
                    String::new()
                }
            }
        });
        match missing {
            Some(key) => Err(CoreError::Render(format!("undefined value {}", key))),
            None => Ok(rendered.into_owned()),
        }
    }
}

impl ManifestRenderer for TemplateRenderer {
    fn render(&self, app: &Application, tree: &SourceTree) -> Result<Vec<ResourceDescriptor>, CoreError> {
        let values = self.merged_values(app, tree)?;
        let values_path = values_file_name(app);
        let include = match &app.source.include {
            Some(pattern) => Some(
                glob::Pattern::new(pattern)
                    .map_err(|e| CoreError::Render(format!("invalid include pattern: {}", e)))?,
            ),
            None => None,
        };

        let mut resources = Vec::new();
        for (path, bytes) in &tree.files {
            if path == values_path {
                continue;
            }
            let selected = match &include {
                Some(pattern) => pattern.matches(path),
                None => is_manifest_file(path),
            };
            if !selected {
                continue;
            }

            let text = self.render_text(utf8(path, bytes)?, app, &values)
                .map_err(|e| CoreError::Render(format!("{}: {}", path, e)))?;
            let namespace = Some(app.destination.namespace.as_str());

            if path.ends_with(".json") {
                let value: Value = serde_json::from_str(&text)
                    .map_err(|e| CoreError::Render(format!("{}: {}", path, e)))?;
                collect_manifests(value, namespace, &mut resources)
                    .map_err(|e| CoreError::Render(format!("{}: {}", path, e)))?;
            } else {
                for document in serde_yaml::Deserializer::from_str(&text) {
                    let value = Value::deserialize(document)
                        .map_err(|e| CoreError::Render(format!("{}: {}", path, e)))?;
                    collect_manifests(value, namespace, &mut resources)
                        .map_err(|e| CoreError::Render(format!("{}: {}", path, e)))?;
                }
            }
        }
        Ok(resources)
    }
}

fn values_file_name(app: &Application) -> &str {
    app.source.values_file.as_deref().unwrap_or(DEFAULT_VALUES_FILE)
}

fn is_manifest_file(path: &str) -> bool {
    path.ends_with(".yaml") || path.ends_with(".yml") || path.ends_with(".json")
}

fn utf8<'a>(path: &str, bytes: &'a [u8]) -> Result<&'a str, CoreError> {
    std::str::from_utf8(bytes).map_err(|_| CoreError::Render(format!("{}: not valid UTF-8", path)))
}

/// Expand documents, arrays and `kind: List` into descriptors
fn collect_manifests(
    value: Value,
    namespace: Option<&str>,
    out: &mut Vec<ResourceDescriptor>,
) -> Result<(), CoreError> {
    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            for item in items {
                collect_manifests(item, namespace, out)?;
            }
            Ok(())
        }
        Value::Object(mut map) => {
            if map.get("kind").and_then(Value::as_str) == Some("List") {
                if let Some(Value::Array(items)) = map.remove("items") {
                    for item in items {
                        collect_manifests(item, namespace, out)?;
                    }
                }
                return Ok(());
            }
            out.push(ResourceDescriptor::from_manifest(Value::Object(map), namespace)?);
            Ok(())
        }
        other => Err(CoreError::InvalidManifest(format!(
            "expected a mapping, got {}",
            other
        ))),
    }
}

fn lookup<'a>(values: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .try_fold(values, |current, segment| current.get(segment))
}

fn value_to_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(_) | Value::Number(_) => value.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// Deep-merge `overlay` into `base`: mappings merge, everything else replaces
pub fn merge_values(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::application::{ApplicationSource, Destination, SyncPolicy};
    use crate::types::resource::ResourceKind;
    use serde_json::json;

    fn app(values: Value) -> Application {
        let values = match values {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Application {
            name: "guestbook".to_string(),
            source: ApplicationSource {
                repo_url: "https://example.com/deploy.git".to_string(),
                target_revision: "main".to_string(),
                path: "guestbook".to_string(),
                include: None,
                values_file: None,
                values,
            },
            destination: Destination {
                server: "local".to_string(),
                namespace: "web".to_string(),
            },
            sync_policy: SyncPolicy::default(),
        }
    }

    const DEPLOYMENT: &str = r#"
apiVersion: apps/v1
kind: Deployment
metadata:
  name: {{ .Release.Name }}
spec:
  replicas: {{ .Values.replicas }}
  template:
    spec:
      containers:
        - name: web
          image: "{{ .Values.image.repository }}:{{ .Values.image.tag }}"
"#;

    #[test]
    fn test_render_substitutes_values_and_overlay() {
        let tree = SourceTree::new("abc")
            .with_file("deployment.yaml", DEPLOYMENT)
            .with_file(
                "values.yaml",
                "replicas: 1\nimage:\n  repository: nginx\n  tag: \"1.25\"\n",
            );
        let app = app(json!({ "image": { "tag": "1.27" } }));

        let resources = TemplateRenderer::new().render(&app, &tree).unwrap();
        assert_eq!(resources.len(), 1);
        let deployment = &resources[0];
        assert_eq!(deployment.kind, ResourceKind::Deployment);
        assert_eq!(deployment.name, "guestbook");
        assert_eq!(deployment.namespace.as_deref(), Some("web"));
        assert_eq!(deployment.spec["spec"]["replicas"], json!(1));
        assert_eq!(
            deployment.spec["spec"]["template"]["spec"]["containers"][0]["image"],
            json!("nginx:1.27")
        );
    }

    #[test]
    fn test_render_multi_document_and_list() {
        let yaml = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: a\n---\napiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: b\n";
        let json = r#"{"kind": "List", "items": [{"kind": "Service", "metadata": {"name": "svc", "namespace": "edge"}}]}"#;
        let tree = SourceTree::new("abc")
            .with_file("config.yaml", yaml)
            .with_file("svc.json", json)
            .with_file("README.md", "# not a manifest");

        let resources = TemplateRenderer::new().render(&app(json!({})), &tree).unwrap();
        let ids: Vec<String> = resources.iter().map(|r| r.id().to_string()).collect();
        assert_eq!(
            ids,
            vec!["ConfigMap/web/a", "ConfigMap/web/b", "Service/edge/svc"]
        );
    }

    #[test]
    fn test_render_undefined_value_fails() {
        let tree = SourceTree::new("abc").with_file("deployment.yaml", DEPLOYMENT);
        let err = TemplateRenderer::new()
            .render(&app(json!({})), &tree)
            .unwrap_err();
        assert!(err.is_render_error());
        assert!(err.to_string().contains(".Values.replicas"));
    }

    #[test]
    fn test_render_include_pattern() {
        let tree = SourceTree::new("abc")
            .with_file("base/cm.yaml", "kind: ConfigMap\nmetadata:\n  name: base\n")
            .with_file("extra/cm.yaml", "kind: ConfigMap\nmetadata:\n  name: extra\n");
        let mut app = app(json!({}));
        app.source.include = Some("base/*.yaml".to_string());

        let resources = TemplateRenderer::new().render(&app, &tree).unwrap();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "base");
    }

    #[test]
    fn test_missing_named_values_file_fails() {
        let tree = SourceTree::new("abc");
        let mut app = app(json!({}));
        app.source.values_file = Some("prod-values.yaml".to_string());
        assert!(TemplateRenderer::new().merged_values(&app, &tree).is_err());
    }

    #[test]
    fn test_merge_values_deep() {
        let mut base = json!({ "a": { "b": 1, "c": 2 }, "d": [1] });
        merge_values(&mut base, &json!({ "a": { "c": 3 }, "d": [2, 3] }));
        assert_eq!(base, json!({ "a": { "b": 1, "c": 3 }, "d": [2, 3] }));
    }
}
