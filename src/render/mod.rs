//! Manifest Renderer
//!
//! Expands a fetched source into the ordered list of desired resources:
//! 1. Plain trees are parsed file by file (multi-document YAML, JSON objects
//!    or arrays, `List` kinds flattened).
//! 2. Charts are rendered with their effective values first, then parsed the
//!    same way.
//! 3. Every resource is post-processed: default namespace, tracking label,
//!    annotation validation, duplicate detection.
//!
//! Rendering is pure: the same source and parameters always give the same
//! output, and the fetched source is never modified.

pub mod template;
pub mod values;

use std::collections::HashSet;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::{Value, json};

use crate::error::RenderError;
use crate::models::{
    Application, HOOK_ANNOTATION, HOOK_DELETE_POLICY_ANNOTATION, HookDeletePolicy, HookType,
    Manifest, ResourceKey, SYNC_WAVE_ANNOTATION, TRACKING_LABEL,
};
use crate::registry::KindRegistry;
use crate::source::{ChartSource, FetchedSource, ManifestTree};

pub use template::Template;

/// One resource of the desired state.
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredResource {
    pub key: ResourceKey,
    pub manifest: Manifest,
    pub sync_wave: i32,
    pub hook: Option<HookType>,
    pub delete_policies: Vec<HookDeletePolicy>,
    pub prune_allowed: bool,
    /// File the resource was rendered from.
    pub source_file: String,
}

impl DesiredResource {
    pub fn is_hook(&self) -> bool {
        self.hook.is_some()
    }

    /// Drop the namespace once the kind is known to be cluster-scoped.
    pub fn make_cluster_scoped(&mut self) {
        self.manifest.clear_namespace();
        self.key = self.manifest.key();
    }
}

/// Chart metadata read from `Chart.yaml`.
#[derive(Debug, Clone, Deserialize)]
struct ChartMetadata {
    name: String,
    version: String,
}

#[derive(Debug, Clone)]
pub struct Renderer {
    registry: Arc<KindRegistry>,
}

impl Renderer {
    pub fn new(registry: Arc<KindRegistry>) -> Self {
        Self { registry }
    }

    /// Render the desired state of `app` from `source`.
    pub fn render(
        &self,
        app: &Application,
        source: &FetchedSource,
    ) -> Result<Vec<DesiredResource>, RenderError> {
        let documents = match source {
            FetchedSource::Directory(tree) => parse_tree(tree)?,
            FetchedSource::Chart(chart) => self.render_chart(app, chart)?,
        };

        let mut seen = HashSet::new();
        let mut resources = Vec::with_capacity(documents.len());
        for (file, value) in documents {
            let resource = self.post_process(app, &file, value)?;
            if !seen.insert(resource.key.clone()) {
                return Err(RenderError::DuplicateResource(resource.key.to_string()));
            }
            resources.push(resource);
        }

        tracing::debug!(
            app = %app.name,
            revision = %source.revision(),
            resources = resources.len(),
            "rendered desired state"
        );
        Ok(resources)
    }

    fn render_chart(
        &self,
        app: &Application,
        chart: &ChartSource,
    ) -> Result<Vec<(String, Value)>, RenderError> {
        let chart_yaml = chart.chart_yaml().ok_or_else(|| RenderError::InvalidManifest {
            file: crate::source::CHART_FILE.to_string(),
            message: "missing".to_string(),
        })?;
        let metadata: ChartMetadata =
            serde_yaml::from_str(chart_yaml).map_err(|e| RenderError::InvalidManifest {
                file: crate::source::CHART_FILE.to_string(),
                message: e.to_string(),
            })?;

        let parameters = app.source.chart.as_ref();
        let values = values::effective_values(chart, parameters)?;
        let release_name = parameters
            .and_then(|p| p.release_name.clone())
            .unwrap_or_else(|| app.name.clone());

        let context = json!({
            "Values": values,
            "Release": {
                "Name": release_name,
                "Namespace": app.destination.namespace,
            },
            "Chart": {
                "Name": metadata.name,
                "Version": metadata.version,
            },
        });

        let mut documents = Vec::new();
        for (path, content) in chart.templates() {
            let rendered = Template::parse(path, content)?.render(&context)?;
            documents.extend(parse_documents(path, &rendered)?.into_iter().map(|v| (path.clone(), v)));
        }
        Ok(documents)
    }

    fn post_process(
        &self,
        app: &Application,
        file: &str,
        value: Value,
    ) -> Result<DesiredResource, RenderError> {
        let mut manifest = Manifest::new(value).map_err(|message| RenderError::InvalidManifest {
            file: file.to_string(),
            message,
        })?;

        if self.registry.is_namespaced(manifest.group(), manifest.kind()) {
            if manifest.namespace().is_none() {
                manifest.set_namespace(&app.destination.namespace);
            }
        } else {
            manifest.clear_namespace();
        }
        manifest.set_label(TRACKING_LABEL, &app.name);

        let key = manifest.key();
        let invalid = |annotation: &str, value: String| RenderError::InvalidAnnotation {
            resource: key.to_string(),
            annotation: annotation.to_string(),
            value,
        };
        let sync_wave = manifest
            .sync_wave()
            .map_err(|v| invalid(SYNC_WAVE_ANNOTATION, v))?;
        let hook = manifest.hook().map_err(|v| invalid(HOOK_ANNOTATION, v))?;
        let delete_policies = manifest
            .hook_delete_policies()
            .map_err(|v| invalid(HOOK_DELETE_POLICY_ANNOTATION, v))?;
        let prune_allowed = manifest.prune_allowed();

        Ok(DesiredResource {
            key,
            manifest,
            sync_wave,
            hook,
            delete_policies,
            prune_allowed,
            source_file: file.to_string(),
        })
    }
}

fn parse_tree(tree: &ManifestTree) -> Result<Vec<(String, Value)>, RenderError> {
    let mut documents = Vec::new();
    for (path, content) in &tree.files {
        documents.extend(parse_documents(path, content)?.into_iter().map(|v| (path.clone(), v)));
    }
    Ok(documents)
}

/// Parse one file into objects. Empty documents are skipped and `List`
/// kinds are flattened into their items.
pub fn parse_documents(file: &str, content: &str) -> Result<Vec<Value>, RenderError> {
    let invalid = |message: String| RenderError::InvalidManifest {
        file: file.to_string(),
        message,
    };

    let mut raw = Vec::new();
    if file.to_lowercase().ends_with(".json") {
        if content.trim().is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(content).map_err(|e| invalid(e.to_string()))? {
            Value::Array(items) => raw.extend(items),
            other => raw.push(other),
        }
    } else {
        for document in serde_yaml::Deserializer::from_str(content) {
            let value = Value::deserialize(document).map_err(|e| invalid(e.to_string()))?;
            raw.push(value);
        }
    }

    let mut out = Vec::new();
    for value in raw {
        flatten(file, value, &mut out)?;
    }
    Ok(out)
}

fn flatten(file: &str, value: Value, out: &mut Vec<Value>) -> Result<(), RenderError> {
    match value {
        Value::Null => Ok(()),
        Value::Object(_) if is_list(&value) => {
            if let Value::Object(mut map) = value {
                if let Some(Value::Array(items)) = map.remove("items") {
                    for item in items {
                        flatten(file, item, out)?;
                    }
                }
            }
            Ok(())
        }
        Value::Object(_) => {
            out.push(value);
            Ok(())
        }
        other => Err(RenderError::InvalidManifest {
            file: file.to_string(),
            message: format!("expected an object, found {}", type_name(&other)),
        }),
    }
}

fn is_list(value: &Value) -> bool {
    value
        .get("kind")
        .and_then(|k| k.as_str())
        .is_some_and(|k| k.ends_with("List"))
        && value.get("items").is_some_and(|i| i.is_array())
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
