// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! FTW rule files.
//!
//! A rule file holds one or more YAML documents:
//!
//! ```yaml
//! meta:
//!   author: crs
//!   enabled: true
//! tests:
//!   - test_title: 920100-1
//!     stages:
//!       - stage:
//!           input:
//!             dest_addr: 127.0.0.1
//!             method: GET
//!             uri: /
//!             headers:
//!               Host: localhost
//!           output:
//!             status: 403
//! ```
//!
//! Rules convert top-down into tests, stages and finally wire-ready packets
//! with [`get`].

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Deserializer, Serialize};
use serde_yaml_ng::{Mapping, Value as YamlValue};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid FTW YAML: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),
    #[error("{0} is not YAML file with .yaml")]
    NotYaml(PathBuf),
    #[error("No such file or path: '{0}'")]
    NotFound(PathBuf),
    #[error("cannot convert a {from:?} into a {to:?}")]
    Upward { from: Kind, to: Kind },
    #[error("cannot encode test data: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Levels of the FTW hierarchy, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Kind {
    Rule,
    Test,
    Stage,
    Packet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    #[serde(default)]
    pub meta: YamlValue,
    #[serde(default)]
    pub tests: Vec<Test>,
    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Test {
    #[serde(deserialize_with = "deserialize_title")]
    pub test_title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub desc: Option<String>,
    #[serde(default)]
    pub stages: Vec<StageEntry>,
    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageEntry {
    pub stage: Stage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stage {
    #[serde(default)]
    pub input: Input,
    /// Expected outcome, e.g. `status`, `log_contains`.
    #[serde(default)]
    pub output: YamlValue,
    #[serde(skip)]
    pub origin: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Input {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest_addr: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub headers: Mapping,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub raw_request: Option<String>,
    pub stop_magic: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Data {
    Text(String),
    Lines(Vec<String>),
}

impl Data {
    fn joined(&self) -> String {
        match self {
            Data::Text(text) => text.clone(),
            Data::Lines(lines) => lines.join("\r\n"),
        }
    }
}

impl Input {
    /// Renders the request the way FTW's HTTP user agent puts it on the wire.
    #[must_use]
    pub fn render(&self) -> Vec<u8> {
        if let Some(raw) = &self.raw_request {
            return raw.clone().into_bytes();
        }
        let method = self.method.as_deref().unwrap_or("GET");
        let uri = self.uri.as_deref().unwrap_or("/");
        let version = self.version.as_deref().unwrap_or("HTTP/1.1");
        let data = self.data.as_ref().map(Data::joined).unwrap_or_default();

        let mut request = format!("{method} {uri} {version}\r\n");
        let mut has_length = false;
        for (name, value) in &self.headers {
            let name = scalar(name);
            has_length |= name.eq_ignore_ascii_case("content-length");
            request.push_str(&format!("{name}: {}\r\n", scalar(value)));
        }
        if !data.is_empty() && !has_length && !self.stop_magic {
            request.push_str(&format!("Content-Length: {}\r\n", data.len()));
        }
        request.push_str("\r\n");
        request.push_str(&data);
        request.into_bytes()
    }
}

/// A wire-ready request.
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub bytes: Vec<u8>,
    pub origin: Option<PathBuf>,
}

/// One element of the hierarchy at any level.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Rule(Rule),
    Test(Test),
    Stage(Stage),
    Packet(Packet),
}

impl Node {
    #[must_use]
    pub fn kind(&self) -> Kind {
        match self {
            Node::Rule(_) => Kind::Rule,
            Node::Test(_) => Kind::Test,
            Node::Stage(_) => Kind::Stage,
            Node::Packet(_) => Kind::Packet,
        }
    }

    fn children(&self) -> Vec<Node> {
        match self {
            Node::Rule(rule) => rule
                .tests
                .iter()
                .map(|test| {
                    let mut test = test.clone();
                    test.origin.clone_from(&rule.origin);
                    Node::Test(test)
                })
                .collect(),
            Node::Test(test) => test
                .stages
                .iter()
                .map(|entry| {
                    let mut stage = entry.stage.clone();
                    stage.origin.clone_from(&test.origin);
                    Node::Stage(stage)
                })
                .collect(),
            Node::Stage(stage) => vec![Node::Packet(Packet {
                bytes: stage.input.render(),
                origin: stage.origin.clone(),
            })],
            Node::Packet(_) => Vec::new(),
        }
    }
}

/// Depth-first walk yielding the nodes of one level.
pub struct Descend {
    stack: Vec<std::vec::IntoIter<Node>>,
    target: Kind,
}

impl Iterator for Descend {
    type Item = Node;

    fn next(&mut self) -> Option<Node> {
        while let Some(level) = self.stack.last_mut() {
            let Some(node) = level.next() else {
                self.stack.pop();
                continue;
            };
            if node.kind() >= self.target {
                return Some(node);
            }
            self.stack.push(node.children().into_iter());
        }
        None
    }
}

/// Lazily converts `node` down to `target` level items.
///
/// # Errors
///
/// Returns [`LoadError::Upward`] when `target` is above the node's level.
pub fn get(node: Node, target: Kind) -> Result<Descend, LoadError> {
    if node.kind() > target {
        return Err(LoadError::Upward {
            from: node.kind(),
            to: target,
        });
    }
    Ok(Descend {
        stack: vec![vec![node].into_iter()],
        target,
    })
}

/// Parses every YAML document in `text`. Empty documents are skipped.
///
/// # Errors
///
/// Fails on the first document that is not a valid FTW rule.
pub fn parse_rules(text: &str, origin: Option<&Path>) -> Result<Vec<Rule>, LoadError> {
    let mut rules = Vec::new();
    for document in serde_yaml_ng::Deserializer::from_str(text) {
        let value = YamlValue::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        let mut rule: Rule = serde_yaml_ng::from_value(value)?;
        rule.origin = origin.map(Path::to_path_buf);
        rules.push(rule);
    }
    Ok(rules)
}

/// Loads the rule files found at `path`: a single `.yaml` file, or every
/// `.yaml` file below a directory.
///
/// # Errors
///
/// Fails when the path does not exist, names a non-YAML file, or any file
/// cannot be read or parsed.
pub fn load_rules(path: &Path) -> Result<Vec<Rule>, LoadError> {
    if path.is_dir() {
        let mut files = Vec::new();
        collect_yaml_files(path, &mut files)?;
        files.sort();
        let mut rules = Vec::new();
        for file in files {
            rules.extend(load_file(&file)?);
        }
        Ok(rules)
    } else if path.is_file() {
        if !is_yaml(path) {
            return Err(LoadError::NotYaml(path.to_path_buf()));
        }
        load_file(path)
    } else {
        Err(LoadError::NotFound(path.to_path_buf()))
    }
}

fn load_file(path: &Path) -> Result<Vec<Rule>, LoadError> {
    let text = fs::read_to_string(path).map_err(|source| LoadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let rules = parse_rules(&text, Some(path))?;
    debug!("Loaded {} rules from {}", rules.len(), path.display());
    Ok(rules)
}

fn collect_yaml_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<(), LoadError> {
    let io_error = |source: std::io::Error| LoadError::Io {
        path: dir.to_path_buf(),
        source,
    };
    for entry in fs::read_dir(dir).map_err(io_error)? {
        let path = entry.map_err(io_error)?.path();
        if path.is_dir() {
            collect_yaml_files(&path, files)?;
        } else if is_yaml(&path) {
            files.push(path);
        }
    }
    Ok(())
}

fn is_yaml(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("yaml"))
}

fn scalar(value: &YamlValue) -> String {
    match value {
        YamlValue::String(s) => s.clone(),
        YamlValue::Number(n) => n.to_string(),
        YamlValue::Bool(b) => b.to_string(),
        YamlValue::Null => String::new(),
        other => serde_yaml_ng::to_string(other)
            .map(|s| s.trim_end().to_string())
            .unwrap_or_default(),
    }
}

fn deserialize_title<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match YamlValue::deserialize(deserializer)? {
        YamlValue::String(s) => Ok(s),
        YamlValue::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "test_title must be a string or a number, got {other:?}"
        ))),
    }
}
