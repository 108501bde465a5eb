//! Tool descriptor and job document model, and the builder that turns them
//! into provisioning entries.
//!
//! Inputs are built before the run: every job field bound to a declared
//! `File`/`Directory` input becomes one or more entries with a deterministic
//! staging path under `inputs/<field>/`. Outputs are built after the run from
//! the declared outputs, their destinations in the job document, and the
//! paths the run reported.

use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::ManifestError;
use crate::registry::PluginRegistry;

/// Job document: field name to literal value or data reference
pub type JobDocument = BTreeMap<String, Value>;

/// Output object reported by the run: output id to produced file(s)
pub type RunOutputs = BTreeMap<String, Value>;

/// Resolved tool descriptor. Only the parts the launcher needs are modeled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,

    #[serde(default, deserialize_with = "parameters")]
    pub inputs: Vec<Parameter>,

    #[serde(default, deserialize_with = "parameters")]
    pub outputs: Vec<Parameter>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Parameter {
    pub id: String,

    #[serde(rename = "type", default)]
    pub param_type: Value,
}

impl Parameter {
    /// Field name with any `#` or `#tool/` prefix removed
    pub fn name(&self) -> &str {
        let id = self.id.trim_start_matches('#');
        id.rsplit('/').next().unwrap_or(id)
    }

    /// `File` or `Directory` (optional and array forms included); None for primitives
    pub fn data_kind(&self) -> Option<EntryKind> {
        type_kind(&self.param_type)
    }
}

fn type_kind(value: &Value) -> Option<EntryKind> {
    match value {
        Value::String(s) => match s.trim_end_matches('?').trim_end_matches("[]") {
            "File" => Some(EntryKind::File),
            "Directory" => Some(EntryKind::Directory),
            _ => None,
        },
        // ["null", "File"]
        Value::Array(options) => options.iter().find_map(type_kind),
        // { type: array, items: File }
        Value::Object(obj) => obj.get("items").and_then(type_kind),
        _ => None,
    }
}

/// Parameters may be written as a list of `{id, type}` or as a map `id: type`
fn parameters<'de, D>(deserializer: D) -> Result<Vec<Parameter>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Form {
        List(Vec<Parameter>),
        Map(BTreeMap<String, Value>),
    }

    Ok(match Form::deserialize(deserializer)? {
        Form::List(list) => list,
        Form::Map(map) => map
            .into_iter()
            .map(|(id, spec)| {
                let param_type = match spec {
                    Value::Object(mut obj) => obj.remove("type").unwrap_or(Value::Null),
                    other => other,
                };
                Parameter { id, param_type }
            })
            .collect(),
    })
}

/// Read a descriptor or job document. YAML is accepted, JSON being a subset.
pub async fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    serde_yaml_bw::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Input,
    Output,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
}

/// One unit of provisioning work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Job field the entry came from
    pub field: String,
    pub identifier: String,
    pub local_path: PathBuf,
    pub direction: Direction,
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<String>,
}

#[derive(Debug, Clone)]
pub struct InputManifest {
    pub entries: Vec<ManifestEntry>,
    /// The job document with every staged reference pointing at its local path
    pub job: JobDocument,
}

/// A declared output that could not be turned into an entry
#[derive(Debug, Clone)]
pub struct MissingOutput {
    pub field: String,
    pub identifier: String,
    pub expected: Option<PathBuf>,
    pub error: ManifestError,
}

#[derive(Debug, Clone, Default)]
pub struct OutputManifest {
    pub entries: Vec<ManifestEntry>,
    pub missing: Vec<MissingOutput>,
}

pub struct ManifestBuilder<'a> {
    registry: &'a PluginRegistry,
}

impl<'a> ManifestBuilder<'a> {
    pub fn new(registry: &'a PluginRegistry) -> Self {
        Self { registry }
    }

    /// Unresolvable identifiers count as capable so the engine reports them
    fn directory_capable(&self, identifier: &str) -> bool {
        self.registry
            .resolve(identifier)
            .map(|backend| backend.supports_directories())
            .unwrap_or(true)
    }

    pub fn build_inputs(
        &self,
        descriptor: &ToolDescriptor,
        job: &JobDocument,
        inputs_dir: &Path,
    ) -> Result<InputManifest, ManifestError> {
        let mut staging = InputStaging {
            builder: self,
            entries: Vec::new(),
            claimed: HashSet::new(),
            prefixes: HashSet::new(),
        };
        let mut rewritten = job.clone();

        for param in &descriptor.inputs {
            let name = param.name();
            let Some(value) = rewritten.get_mut(name) else {
                continue;
            };
            let declared = param.data_kind();
            let field_dir = inputs_dir.join(name);

            match value {
                Value::Array(items) => {
                    for (index, item) in items.iter_mut().enumerate() {
                        promote_string(item, declared);
                        if is_data_reference(item) {
                            staging.stage(name, item, &field_dir.join(index.to_string()))?;
                        }
                    }
                }
                other => {
                    promote_string(other, declared);
                    if is_data_reference(other) {
                        staging.stage(name, other, &field_dir)?;
                    }
                }
            }
        }

        Ok(InputManifest {
            entries: staging.entries,
            job: rewritten,
        })
    }

    /// Outputs with no usable destination in the job go to `default_dir`
    pub fn build_outputs(
        &self,
        descriptor: &ToolDescriptor,
        job: &JobDocument,
        produced: &RunOutputs,
        default_dir: &Path,
    ) -> OutputManifest {
        let mut manifest = OutputManifest::default();

        for param in &descriptor.outputs {
            let name = param.name();
            if param.data_kind().is_none() && !param.param_type.is_null() {
                continue;
            }

            let value = produced.get(name);
            let items = value.map(produced_files).unwrap_or_default();

            if let Some(Value::Array(bindings)) = job.get(name) {
                if !bindings.is_empty() {
                    let destinations: Vec<_> = bindings.iter().filter_map(destination_of).collect();
                    self.pair_outputs(name, &destinations, items, &mut manifest);
                    continue;
                }
            }

            let destination = match job.get(name).and_then(destination_of) {
                Some(destination) => Destination {
                    container: matches!(value, Some(Value::Array(_))),
                    ..destination
                },
                None => {
                    tracing::warn!(
                        "No destination for output {}, provisioning to {}",
                        name,
                        default_dir.display()
                    );
                    Destination {
                        location: default_dir.display().to_string(),
                        container: true,
                        metadata: None,
                    }
                }
            };

            if items.is_empty() {
                manifest.missing.push(MissingOutput {
                    field: name.to_string(),
                    identifier: destination.location,
                    expected: None,
                    error: ManifestError::MissingOutput(name.to_string()),
                });
                continue;
            }

            for item in items {
                self.add_output(name, &destination, item, &mut manifest);
            }
        }

        manifest
    }

    /// A list of destinations takes the produced files in order
    fn pair_outputs(
        &self,
        field: &str,
        destinations: &[Destination],
        items: Vec<ProducedFile>,
        manifest: &mut OutputManifest,
    ) {
        if destinations.len() == items.len() {
            for (destination, item) in destinations.iter().zip(items) {
                self.add_output(field, destination, item, manifest);
            }
            return;
        }

        let error = if items.is_empty() {
            ManifestError::MissingOutput(field.to_string())
        } else {
            ManifestError::DestinationMismatch {
                field: field.to_string(),
                destinations: destinations.len(),
                produced: items.len(),
            }
        };
        manifest.missing.push(MissingOutput {
            field: field.to_string(),
            identifier: destinations.first().map(|d| d.location.clone()).unwrap_or_default(),
            expected: None,
            error,
        });
    }

    /// One produced file and, next to it, its secondary files
    fn add_output(
        &self,
        field: &str,
        destination: &Destination,
        item: ProducedFile,
        manifest: &mut OutputManifest,
    ) {
        let identifier = if destination.container {
            join_identifier(&destination.location, &item.basename)
        } else {
            destination.location.clone()
        };

        self.add_entry(field, &identifier, item.path, destination.metadata.as_deref(), manifest);

        for secondary in item.secondary {
            let sibling = Destination {
                location: sibling_identifier(&identifier, &secondary.basename),
                container: false,
                metadata: None,
            };
            self.add_output(field, &sibling, secondary, manifest);
        }
    }

    fn add_entry(
        &self,
        field: &str,
        identifier: &str,
        path: PathBuf,
        metadata: Option<&str>,
        manifest: &mut OutputManifest,
    ) {
        if !path.exists() {
            manifest.missing.push(MissingOutput {
                field: field.to_string(),
                identifier: identifier.to_string(),
                expected: Some(path),
                error: ManifestError::MissingOutput(field.to_string()),
            });
            return;
        }

        if path.is_dir() && !self.directory_capable(identifier) {
            self.expand_output_dir(field, identifier, &path, metadata, manifest);
            return;
        }

        manifest.entries.push(ManifestEntry {
            field: field.to_string(),
            kind: if path.is_dir() { EntryKind::Directory } else { EntryKind::File },
            identifier: identifier.to_string(),
            local_path: path,
            direction: Direction::Output,
            metadata: metadata.map(str::to_string),
        });
    }

    /// One upload per file for backends that cannot take a directory
    fn expand_output_dir(
        &self,
        field: &str,
        identifier: &str,
        dir: &Path,
        metadata: Option<&str>,
        manifest: &mut OutputManifest,
    ) {
        match walk_files(dir) {
            Ok(files) => {
                for file in files {
                    let relative = file
                        .strip_prefix(dir)
                        .unwrap_or(&file)
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    manifest.entries.push(ManifestEntry {
                        field: field.to_string(),
                        identifier: join_identifier(identifier, &relative),
                        local_path: file,
                        direction: Direction::Output,
                        kind: EntryKind::File,
                        metadata: metadata.map(str::to_string),
                    });
                }
            }
            Err(e) => manifest.missing.push(MissingOutput {
                field: field.to_string(),
                identifier: identifier.to_string(),
                expected: Some(dir.to_path_buf()),
                error: ManifestError::UnreadableOutput {
                    field: field.to_string(),
                    reason: e.to_string(),
                },
            }),
        }
    }
}

struct InputStaging<'b, 'a> {
    builder: &'b ManifestBuilder<'a>,
    entries: Vec<ManifestEntry>,
    /// Paths holding a staged file or directory
    claimed: HashSet<PathBuf>,
    /// Directories some claimed path lives under
    prefixes: HashSet<PathBuf>,
}

impl InputStaging<'_, '_> {
    fn is_free(&self, candidate: &Path) -> bool {
        !self.claimed.contains(candidate)
            && !self.prefixes.contains(candidate)
            && !candidate.ancestors().skip(1).any(|a| self.claimed.contains(a))
    }

    /// Unique path for `name` in `dir`; repeats go to numbered subdirectories
    fn claim_path(&mut self, dir: &Path, name: &str) -> PathBuf {
        let mut candidate = dir.join(name);
        let mut n = 1;
        while !self.is_free(&candidate) {
            candidate = dir.join(n.to_string()).join(name);
            n += 1;
        }

        for ancestor in candidate.ancestors().skip(1) {
            if !self.prefixes.insert(ancestor.to_path_buf()) {
                break;
            }
        }
        self.claimed.insert(candidate.clone());
        candidate
    }

    /// Turn a claimed path into a directory that later claims may live under
    fn open_dir(&mut self, path: &Path) {
        self.claimed.remove(path);
        self.prefixes.insert(path.to_path_buf());
    }

    fn stage(&mut self, field: &str, value: &mut Value, dir: &Path) -> Result<(), ManifestError> {
        let Some(obj) = value.as_object_mut() else {
            return Ok(());
        };

        let kind = class_of(obj).unwrap_or(EntryKind::File);
        let location = obj
            .get("path")
            .or_else(|| obj.get("location"))
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ManifestError::InvalidReference {
                field: field.to_string(),
                reason: "no `path` or `location`".to_string(),
            })?;
        let metadata = metadata_of(&Value::Object(obj.clone()));
        let local = self.claim_path(dir, &basename(&location, field));

        let has_listing = obj.get("listing").map_or(false, Value::is_array);
        let expand = kind == EntryKind::Directory && !self.builder.directory_capable(&location);
        if expand && !has_listing {
            return Err(ManifestError::DirectoryUnsupported {
                field: field.to_string(),
                identifier: location,
            });
        }

        if expand {
            tracing::debug!("Expanding directory {} into its listing", location);
            self.open_dir(&local);
            if let Some(Value::Array(listing)) = obj.get_mut("listing") {
                for item in listing.iter_mut() {
                    if is_data_reference(item) {
                        self.stage(field, item, &local)?;
                    }
                }
            }
        } else {
            self.entries.push(ManifestEntry {
                field: field.to_string(),
                identifier: location,
                local_path: local.clone(),
                direction: Direction::Input,
                kind,
                metadata,
            });
        }

        obj.remove("location");
        obj.insert("path".to_string(), Value::String(local.display().to_string()));

        if let Some(Value::Array(secondary)) = obj.get_mut("secondaryFiles") {
            for item in secondary.iter_mut() {
                if is_data_reference(item) {
                    self.stage(field, item, dir)?;
                }
            }
        }

        Ok(())
    }
}

/// A bare string bound to a File/Directory input is a reference
fn promote_string(value: &mut Value, declared: Option<EntryKind>) {
    let Some(kind) = declared else {
        return;
    };
    let Value::String(location) = value else {
        return;
    };

    let class = match kind {
        EntryKind::File => "File",
        EntryKind::Directory => "Directory",
    };
    let mut obj = Map::new();
    obj.insert("class".to_string(), Value::String(class.to_string()));
    obj.insert("path".to_string(), Value::String(std::mem::take(location)));
    *value = Value::Object(obj);
}

fn class_of(obj: &Map<String, Value>) -> Option<EntryKind> {
    match obj.get("class").and_then(Value::as_str) {
        Some("File") => Some(EntryKind::File),
        Some("Directory") => Some(EntryKind::Directory),
        _ => None,
    }
}

fn is_data_reference(value: &Value) -> bool {
    value.as_object().and_then(class_of).is_some()
}

/// Destination of an output binding: a string or a `{path|location}` object
fn location_of(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj
            .get("path")
            .or_else(|| obj.get("location"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

/// Where one produced output is uploaded
struct Destination {
    location: String,
    /// Produced files are placed inside `location` under their own names
    container: bool,
    metadata: Option<String>,
}

fn destination_of(value: &Value) -> Option<Destination> {
    Some(Destination {
        location: location_of(value)?,
        container: false,
        metadata: metadata_of(value),
    })
}

/// Job metadata is base64 encoded; values that do not decode to UTF-8 are kept as written
fn metadata_of(value: &Value) -> Option<String> {
    match value.as_object()?.get("metadata")? {
        Value::String(s) => Some(
            BASE64
                .decode(s.trim())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .unwrap_or_else(|| s.clone()),
        ),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// A file the run reported, with the secondary files it carries
struct ProducedFile {
    path: PathBuf,
    basename: String,
    secondary: Vec<ProducedFile>,
}

impl ProducedFile {
    fn at(path: PathBuf) -> Self {
        Self {
            basename: file_name(&path),
            path,
            secondary: Vec::new(),
        }
    }
}

/// Whatever the run reported for one output, flattened in order
fn produced_files(value: &Value) -> Vec<ProducedFile> {
    match value {
        Value::Array(items) => items.iter().flat_map(produced_files).collect(),
        Value::Object(obj) => {
            let path = obj
                .get("path")
                .and_then(Value::as_str)
                .map(PathBuf::from)
                .or_else(|| obj.get("location").and_then(Value::as_str).and_then(local_path_of));
            let Some(path) = path else {
                return Vec::new();
            };

            let mut file = ProducedFile::at(path);
            if let Some(basename) = obj.get("basename").and_then(Value::as_str) {
                file.basename = basename.to_string();
            }
            if let Some(secondary) = obj.get("secondaryFiles") {
                file.secondary = produced_files(secondary);
            }
            vec![file]
        }
        Value::String(s) => local_path_of(s).map(ProducedFile::at).into_iter().collect(),
        _ => Vec::new(),
    }
}

fn local_path_of(location: &str) -> Option<PathBuf> {
    if location.starts_with("file://") {
        return url::Url::parse(location).ok()?.to_file_path().ok();
    }
    Some(PathBuf::from(location))
}

/// Last meaningful segment of an identifier, used as the staged file name
fn basename(location: &str, fallback: &str) -> String {
    let trimmed = location
        .split(['?', '#'])
        .next()
        .unwrap_or(location)
        .trim_end_matches('/');
    let tail = trimmed.rsplit('/').next().unwrap_or(trimmed);
    let tail = tail.rsplit(':').next().unwrap_or(tail);

    if tail.is_empty() || tail == "." || tail == ".." {
        fallback.to_string()
    } else {
        tail.to_string()
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn join_identifier(base: &str, relative: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), relative)
}

/// `name` in the same directory as `identifier`
fn sibling_identifier(identifier: &str, name: &str) -> String {
    match identifier.trim_end_matches('/').rsplit_once('/') {
        Some((parent, _)) => format!("{}/{}", parent, name),
        None => name.to_string(),
    }
}

/// Every regular file under `dir`, in a stable order
fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            if entry.file_type()?.is_dir() {
                pending.push(entry.path());
            } else {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PluginDeclaration;
    use serde_json::json;
    use tempfile::TempDir;

    fn registry() -> PluginRegistry {
        PluginRegistry::load_all(
            &[PluginDeclaration::for_kind("http"), PluginDeclaration::for_kind("local")],
            &BTreeMap::new(),
        )
    }

    fn descriptor(value: Value) -> ToolDescriptor {
        serde_json::from_value(value).unwrap()
    }

    fn job(value: Value) -> JobDocument {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_parameter_names_and_kinds() {
        let d = descriptor(json!({
            "inputs": [
                {"id": "#reads", "type": "File"},
                {"id": "#main/reference", "type": "File?"},
                {"id": "samples", "type": "File[]"},
                {"id": "index", "type": ["null", "Directory"]},
                {"id": "threads", "type": "int"}
            ]
        }));

        let names: Vec<_> = d.inputs.iter().map(Parameter::name).collect();
        assert_eq!(names, vec!["reads", "reference", "samples", "index", "threads"]);
        assert_eq!(d.inputs[0].data_kind(), Some(EntryKind::File));
        assert_eq!(d.inputs[1].data_kind(), Some(EntryKind::File));
        assert_eq!(d.inputs[2].data_kind(), Some(EntryKind::File));
        assert_eq!(d.inputs[3].data_kind(), Some(EntryKind::Directory));
        assert_eq!(d.inputs[4].data_kind(), None);
    }

    #[test]
    fn test_map_form_parameters() {
        let d = descriptor(json!({
            "inputs": {"a": "File", "b": {"type": "string"}},
            "outputs": {"out": {"type": "File"}}
        }));
        assert_eq!(d.inputs.len(), 2);
        assert_eq!(d.inputs[0].data_kind(), Some(EntryKind::File));
        assert_eq!(d.inputs[1].data_kind(), None);
        assert_eq!(d.outputs[0].name(), "out");
    }

    #[test]
    fn test_inputs_get_deterministic_unique_paths() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [
            {"id": "a", "type": "File"},
            {"id": "b", "type": "File"},
            {"id": "n", "type": "int"}
        ]}));
        let j = job(json!({
            "a": {"class": "File", "path": "/local/x/data.txt"},
            "b": {"class": "File", "location": "https://example.org/other/data.txt"},
            "n": 4
        }));

        let first = builder.build_inputs(&d, &j, Path::new("/stage/inputs")).unwrap();
        let second = builder.build_inputs(&d, &j, Path::new("/stage/inputs")).unwrap();
        assert_eq!(first.entries, second.entries);

        assert_eq!(first.entries.len(), 2);
        assert_eq!(first.entries[0].local_path, PathBuf::from("/stage/inputs/a/data.txt"));
        assert_eq!(first.entries[1].local_path, PathBuf::from("/stage/inputs/b/data.txt"));
        assert_eq!(first.entries[1].identifier, "https://example.org/other/data.txt");

        // rewritten job points at the staged copies and keeps literals
        assert_eq!(first.job["a"]["path"], json!("/stage/inputs/a/data.txt"));
        assert!(first.job["b"].get("location").is_none());
        assert_eq!(first.job["n"], json!(4));
    }

    #[test]
    fn test_bare_string_bound_to_file_input() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [{"id": "ref", "type": "File"}, {"id": "label", "type": "string"}]}));
        let j = job(json!({"ref": "s3://bucket/key", "label": "s3://not/a/file"}));

        let manifest = builder.build_inputs(&d, &j, Path::new("/s")).unwrap();

        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].identifier, "s3://bucket/key");
        assert_eq!(manifest.entries[0].local_path, PathBuf::from("/s/ref/key"));
        assert_eq!(manifest.job["ref"]["class"], json!("File"));
        assert_eq!(manifest.job["label"], json!("s3://not/a/file"));
    }

    #[test]
    fn test_arrays_and_secondary_files() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [{"id": "bams", "type": "File[]"}]}));
        let j = job(json!({"bams": [
            {"class": "File", "path": "/d/a.bam", "secondaryFiles": [{"class": "File", "path": "/d/a.bam.bai"}]},
            {"class": "File", "path": "/e/a.bam"}
        ]}));

        let manifest = builder.build_inputs(&d, &j, Path::new("/s")).unwrap();
        let paths: Vec<_> = manifest.entries.iter().map(|e| e.local_path.clone()).collect();

        assert_eq!(
            paths,
            vec![
                PathBuf::from("/s/bams/0/a.bam"),
                PathBuf::from("/s/bams/0/a.bam.bai"),
                PathBuf::from("/s/bams/1/a.bam"),
            ]
        );
        assert_eq!(
            manifest.job["bams"][0]["secondaryFiles"][0]["path"],
            json!("/s/bams/0/a.bam.bai")
        );
    }

    #[test]
    fn test_colliding_names_in_one_field_are_separated() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [{"id": "f", "type": "File"}]}));
        let j = job(json!({"f": {
            "class": "File", "path": "/a/data",
            "secondaryFiles": [{"class": "File", "path": "/b/data"}]
        }}));

        let manifest = builder.build_inputs(&d, &j, Path::new("/s")).unwrap();
        assert_eq!(manifest.entries[0].local_path, PathBuf::from("/s/f/data"));
        assert_eq!(manifest.entries[1].local_path, PathBuf::from("/s/f/1/data"));
    }

    #[test]
    fn test_directory_listing_expanded_for_file_only_backend() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [{"id": "refs", "type": "Directory"}, {"id": "local", "type": "Directory"}]}));
        let j = job(json!({
            "refs": {"class": "Directory", "location": "https://example.org/refs/", "listing": [
                {"class": "File", "location": "https://example.org/refs/chr1.fa"},
                {"class": "File", "location": "https://example.org/refs/chr2.fa"}
            ]},
            "local": {"class": "Directory", "path": "/data/index", "listing": [
                {"class": "File", "path": "/data/index/a.idx"}
            ]}
        }));

        let manifest = builder.build_inputs(&d, &j, Path::new("/s")).unwrap();
        let entries: Vec<_> = manifest
            .entries
            .iter()
            .map(|e| (e.identifier.as_str(), e.local_path.clone(), e.kind))
            .collect();

        assert_eq!(
            entries,
            vec![
                ("https://example.org/refs/chr1.fa", PathBuf::from("/s/refs/refs/chr1.fa"), EntryKind::File),
                ("https://example.org/refs/chr2.fa", PathBuf::from("/s/refs/refs/chr2.fa"), EntryKind::File),
                ("/data/index", PathBuf::from("/s/local/index"), EntryKind::Directory),
            ]
        );
    }

    #[test]
    fn test_directory_without_listing_on_file_only_backend_is_rejected() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [{"id": "refs", "type": "Directory"}]}));
        let j = job(json!({"refs": {"class": "Directory", "location": "https://example.org/refs/"}}));

        let err = builder.build_inputs(&d, &j, Path::new("/s")).unwrap_err();
        assert_eq!(
            err,
            ManifestError::DirectoryUnsupported {
                field: "refs".into(),
                identifier: "https://example.org/refs/".into()
            }
        );
    }

    #[test]
    fn test_staged_paths_never_nest_inside_each_other() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [{"id": "f", "type": "File"}, {"id": "g", "type": "File"}]}));
        let j = job(json!({
            "f": {"class": "File", "path": "/a/data", "secondaryFiles": [
                {"class": "File", "path": "/b/data"},
                {"class": "File", "path": "/c/1"}
            ]},
            "g": {"class": "File", "path": "/a/data", "secondaryFiles": [
                {"class": "File", "path": "/c/1"},
                {"class": "File", "path": "/b/data"}
            ]}
        }));

        let manifest = builder.build_inputs(&d, &j, Path::new("/s")).unwrap();
        let paths: Vec<_> = manifest.entries.iter().map(|e| e.local_path.clone()).collect();

        assert_eq!(
            paths,
            vec![
                PathBuf::from("/s/f/data"),
                PathBuf::from("/s/f/1/data"),
                PathBuf::from("/s/f/1/1"),
                PathBuf::from("/s/g/data"),
                PathBuf::from("/s/g/1"),
                PathBuf::from("/s/g/2/data"),
            ]
        );
        for (i, a) in paths.iter().enumerate() {
            for b in &paths[i + 1..] {
                assert!(!a.starts_with(b) && !b.starts_with(a), "{:?} and {:?} overlap", a, b);
            }
        }
    }

    #[test]
    fn test_reference_without_location_is_rejected() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"inputs": [{"id": "f", "type": "File"}]}));
        let j = job(json!({"f": {"class": "File"}}));

        let err = builder.build_inputs(&d, &j, Path::new("/s")).unwrap_err();
        assert!(matches!(err, ManifestError::InvalidReference { ref field, .. } if field == "f"));
    }

    #[test]
    fn test_basename() {
        assert_eq!(basename("s3://bucket/dir/file.bam", "f"), "file.bam");
        assert_eq!(basename("https://h/x.txt?sig=abc", "f"), "x.txt");
        assert_eq!(basename("icgc:eef47481", "f"), "eef47481");
        assert_eq!(basename("https://h/dir/", "f"), "dir");
        assert_eq!(basename("", "field"), "field");
    }

    #[test]
    fn test_outputs_from_run_result() {
        let temp = TempDir::new().unwrap();
        let produced_file = temp.path().join("out.txt");
        std::fs::write(&produced_file, b"result").unwrap();

        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [
            {"id": "out", "type": "File"},
            {"id": "log", "type": "File"},
            {"id": "unbound", "type": "File"}
        ]}));
        let j = job(json!({
            "out": {"class": "File", "path": "/published/out.txt", "metadata": {"sample": "s1"}},
            "log": {"class": "File", "path": "/published/run.log"}
        }));
        let produced: RunOutputs = serde_json::from_value(json!({
            "out": {"class": "File", "location": url::Url::from_file_path(&produced_file).unwrap().to_string()},
            "log": {"class": "File", "path": temp.path().join("missing.log")}
        }))
        .unwrap();

        let manifest = builder.build_outputs(&d, &j, &produced, Path::new("/work"));

        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].identifier, "/published/out.txt");
        assert_eq!(manifest.entries[0].local_path, produced_file);
        assert_eq!(manifest.entries[0].metadata.as_deref(), Some("{\"sample\":\"s1\"}"));

        let missing: Vec<_> = manifest
            .missing
            .iter()
            .map(|m| (m.field.as_str(), m.identifier.as_str()))
            .collect();
        assert_eq!(missing, vec![("log", "/published/run.log"), ("unbound", "/work")]);
        assert_eq!(manifest.missing[0].error, ManifestError::MissingOutput("log".into()));
    }

    #[test]
    fn test_unbound_output_defaults_to_working_directory() {
        let temp = TempDir::new().unwrap();
        let produced_file = temp.path().join("report.html");
        std::fs::write(&produced_file, b"<html/>").unwrap();

        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [
            {"id": "report", "type": "File"},
            {"id": "count", "type": "int"}
        ]}));
        let produced: RunOutputs =
            serde_json::from_value(json!({"report": {"class": "File", "path": produced_file}, "count": 3})).unwrap();

        let manifest = builder.build_outputs(&d, &JobDocument::new(), &produced, Path::new("/work"));

        assert!(manifest.missing.is_empty());
        assert_eq!(manifest.entries.len(), 1);
        assert_eq!(manifest.entries[0].identifier, "/work/report.html");
    }

    #[test]
    fn test_list_of_destinations_pairs_in_order() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.vcf");
        let b = temp.path().join("b.vcf");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [{"id": "calls", "type": "File[]"}]}));
        let j = job(json!({"calls": [
            {"class": "File", "path": "/published/first.vcf"},
            {"class": "File", "path": "/published/second.vcf"}
        ]}));
        let produced: RunOutputs = serde_json::from_value(json!({"calls": [
            {"class": "File", "path": a},
            {"class": "File", "path": b}
        ]}))
        .unwrap();

        let manifest = builder.build_outputs(&d, &j, &produced, Path::new("/work"));
        let pairs: Vec<_> = manifest
            .entries
            .iter()
            .map(|e| (e.identifier.as_str(), e.local_path.clone()))
            .collect();

        assert_eq!(
            pairs,
            vec![("/published/first.vcf", a), ("/published/second.vcf", b)]
        );
        assert!(manifest.missing.is_empty());
    }

    #[test]
    fn test_list_of_destinations_with_wrong_count_fails() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.vcf");
        std::fs::write(&a, b"a").unwrap();

        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [{"id": "calls", "type": "File[]"}]}));
        let j = job(json!({"calls": ["/published/first.vcf", "/published/second.vcf"]}));
        let produced: RunOutputs =
            serde_json::from_value(json!({"calls": [{"class": "File", "path": a}]})).unwrap();

        let manifest = builder.build_outputs(&d, &j, &produced, Path::new("/work"));

        assert!(manifest.entries.is_empty());
        assert_eq!(manifest.missing.len(), 1);
        assert_eq!(
            manifest.missing[0].error,
            ManifestError::DestinationMismatch {
                field: "calls".into(),
                destinations: 2,
                produced: 1
            }
        );
    }

    #[test]
    fn test_output_secondary_files_land_beside_primary() {
        let temp = TempDir::new().unwrap();
        let bam = temp.path().join("sorted.bam");
        let bai = temp.path().join("sorted.bam.bai");
        std::fs::write(&bam, b"bam").unwrap();
        std::fs::write(&bai, b"bai").unwrap();

        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [{"id": "aligned", "type": "File"}]}));
        let j = job(json!({"aligned": {"class": "File", "path": "https://example.org/results/sample.bam"}}));
        let produced: RunOutputs = serde_json::from_value(json!({"aligned": {
            "class": "File", "path": bam,
            "secondaryFiles": [{"class": "File", "path": bai, "basename": "sample.bam.bai"}]
        }}))
        .unwrap();

        let manifest = builder.build_outputs(&d, &j, &produced, Path::new("/work"));
        let pairs: Vec<_> = manifest
            .entries
            .iter()
            .map(|e| (e.identifier.as_str(), e.local_path.clone()))
            .collect();

        assert_eq!(
            pairs,
            vec![
                ("https://example.org/results/sample.bam", bam),
                ("https://example.org/results/sample.bam.bai", bai),
            ]
        );
    }

    #[test]
    fn test_metadata_is_base64_decoded() {
        let encoded = json!({"metadata": "eyJzYW1wbGUiOiJzMSJ9"});
        assert_eq!(metadata_of(&encoded).as_deref(), Some("{\"sample\":\"s1\"}"));

        let plain = json!({"metadata": "not base64!"});
        assert_eq!(metadata_of(&plain).as_deref(), Some("not base64!"));
        assert_eq!(metadata_of(&json!({"metadata": null})), None);
    }

    #[test]
    fn test_output_absent_from_run_result() {
        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [{"id": "out.txt", "type": "File"}]}));
        let j = job(json!({"out.txt": "/published/out.txt"}));

        let manifest = builder.build_outputs(&d, &j, &RunOutputs::new(), Path::new("/work"));

        assert!(manifest.entries.is_empty());
        assert_eq!(manifest.missing.len(), 1);
        assert_eq!(manifest.missing[0].identifier, "/published/out.txt");
    }

    #[test]
    fn test_output_directory_expanded_for_http_destination() {
        let temp = TempDir::new().unwrap();
        let dir = temp.path().join("results");
        std::fs::create_dir_all(dir.join("nested")).unwrap();
        std::fs::write(dir.join("a.txt"), b"a").unwrap();
        std::fs::write(dir.join("nested").join("b.txt"), b"b").unwrap();

        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [{"id": "results", "type": "Directory"}]}));
        let j = job(json!({"results": {"class": "Directory", "path": "https://example.org/upload/"}}));
        let produced: RunOutputs =
            serde_json::from_value(json!({"results": {"class": "Directory", "path": dir}})).unwrap();

        let manifest = builder.build_outputs(&d, &j, &produced, Path::new("/work"));
        let identifiers: Vec<_> = manifest.entries.iter().map(|e| e.identifier.as_str()).collect();

        assert_eq!(
            identifiers,
            vec!["https://example.org/upload/a.txt", "https://example.org/upload/nested/b.txt"]
        );
        assert!(manifest.entries.iter().all(|e| e.kind == EntryKind::File));
    }

    #[test]
    fn test_array_output_uploads_each_file_under_destination() {
        let temp = TempDir::new().unwrap();
        let a = temp.path().join("a.vcf");
        let b = temp.path().join("b.vcf");
        std::fs::write(&a, b"a").unwrap();
        std::fs::write(&b, b"b").unwrap();

        let registry = registry();
        let builder = ManifestBuilder::new(&registry);
        let d = descriptor(json!({"outputs": [{"id": "calls", "type": "File[]"}]}));
        let j = job(json!({"calls": {"class": "Directory", "path": "/published/calls"}}));
        let produced: RunOutputs = serde_json::from_value(json!({"calls": [
            {"class": "File", "path": a},
            {"class": "File", "path": b}
        ]}))
        .unwrap();

        let manifest = builder.build_outputs(&d, &j, &produced, Path::new("/work"));
        let identifiers: Vec<_> = manifest.entries.iter().map(|e| e.identifier.as_str()).collect();
        assert_eq!(identifiers, vec!["/published/calls/a.vcf", "/published/calls/b.vcf"]);
    }

    #[tokio::test]
    async fn test_load_yaml_and_json_documents() {
        let temp = TempDir::new().unwrap();
        let yaml = temp.path().join("tool.cwl");
        tokio::fs::write(
            &yaml,
            "class: CommandLineTool\ninputs:\n  - id: reads\n    type: File\noutputs: []\n",
        )
        .await
        .unwrap();
        let json_path = temp.path().join("job.json");
        tokio::fs::write(&json_path, r#"{"reads": {"class": "File", "path": "/x"}}"#)
            .await
            .unwrap();

        let d: ToolDescriptor = load_document(&yaml).await.unwrap();
        assert_eq!(d.class.as_deref(), Some("CommandLineTool"));
        assert_eq!(d.inputs[0].name(), "reads");

        let j: JobDocument = load_document(&json_path).await.unwrap();
        assert_eq!(j["reads"]["path"], json!("/x"));
    }
}
