//! Pipe definitions.
//!
//! A pipe is a declarative YAML recipe binding an input query to a shell
//! command to an output transform. Pipes are loaded once at startup and
//! are immutable at runtime; they travel with each job through the queue
//! so workers never reload YAML.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::warn;

use crate::data::{map_input, Data};
use crate::template::{self, TemplateError};

pub const INTERVAL_DEFAULT: &str = "24h";
pub const TIMEOUT_DEFAULT: &str = "1h";

const INTERVAL_FALLBACK: Duration = Duration::from_secs(24 * 60 * 60);
const TIMEOUT_FALLBACK: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum PipeError {
    #[error("reading {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {path} failed: {source}")]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invalid duration `{0}`")]
    InvalidDuration(String),
    #[error("pipe `{pipe}`: {reason}")]
    Invalid { pipe: String, reason: String },
}

/// A pipe definition, one YAML file per pipe.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Pipe {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub input: Input,
    #[serde(rename = "cmd", default)]
    pub command: String,
    /// Named Lua predicates; a predicate evaluating truthy excludes the line.
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
    #[serde(default)]
    pub output: Output,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
    #[serde(default)]
    pub alert_msg: Option<String>,
    /// When set, templated output is logged and never persisted.
    #[serde(default)]
    pub debug: bool,
    /// Worker pool size for this pipe's queue.
    #[serde(default)]
    pub worker: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Input {
    #[serde(default)]
    pub table: String,
    /// Exact JSON-field equality over the `data` column.
    #[serde(default)]
    pub filter: BTreeMap<String, String>,
    /// Numeric JSON-field >= checks over the `data` column.
    #[serde(default)]
    pub threshold: BTreeMap<String, f64>,
    /// When set, all assets of one target are collapsed into a temp file,
    /// one rendered line per row.
    #[serde(default)]
    pub as_file: Option<String>,
    /// When set, input lines come from this file instead of a table.
    #[serde(default)]
    pub file: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Output {
    #[serde(default)]
    pub table: String,
    /// Template producing the record key.
    #[serde(default)]
    pub ident: String,
    /// Template producing the record's asset; overrides the input asset.
    #[serde(default)]
    pub asset: String,
    /// Field name -> template for the persisted JSON payload.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Pipe {
    /// Minimum wait between two runs of this pipe for one ident. Parse
    /// errors are caught by `validate` at load time; afterwards this
    /// falls back to the default rather than failing.
    pub fn interval(&self) -> Duration {
        parse_duration(self.interval.as_deref().unwrap_or(INTERVAL_DEFAULT))
            .unwrap_or(INTERVAL_FALLBACK)
    }

    /// Subprocess wall-clock limit.
    pub fn timeout(&self) -> Duration {
        parse_duration(self.timeout.as_deref().unwrap_or(TIMEOUT_DEFAULT))
            .unwrap_or(TIMEOUT_FALLBACK)
    }

    pub fn workers(&self) -> usize {
        self.worker.max(1)
    }

    pub fn is_as_file(&self) -> bool {
        self.input.as_file.as_deref().is_some_and(|t| !t.is_empty())
    }

    /// Renders the shell command for one input record.
    pub fn render_command(&self, data: &Data) -> Result<String, TemplateError> {
        template::render(&self.command, &input_context(data))
    }

    /// Renders the record key for one output line.
    pub fn ident(&self, ctx: &Value) -> Result<String, TemplateError> {
        template::render(&self.output.ident, ctx)
    }

    /// Renders the user-visible alert text; falls back to the ident when
    /// no `alert_msg` template is configured.
    pub fn alert_msg(&self, ctx: &Value) -> Result<String, TemplateError> {
        match self.alert_msg.as_deref() {
            Some(tpl) if !tpl.is_empty() => template::render(tpl, ctx),
            _ => self.ident(ctx),
        }
    }

    /// Renders every `output.data` template plus `output.asset` for one
    /// line. Per-field template errors are logged and the field skipped;
    /// a bad template never fails the whole line. Dotted field names nest
    /// into the persisted JSON.
    pub fn output_map(&self, ctx: &Value) -> Map<String, Value> {
        let mut out = Map::new();

        for (name, tpl) in &self.output.data {
            match template::render(tpl, ctx) {
                Ok(value) => {
                    out.insert(name.clone(), Value::String(value));
                }
                Err(err) => warn!(template = %tpl, %err, "rendering output field failed"),
            }
        }

        match template::render(&self.output.asset, ctx) {
            Ok(value) => {
                out.insert("asset".to_string(), Value::String(value));
            }
            Err(err) => warn!(template = %self.output.asset, %err, "rendering output asset failed"),
        }

        unflatten(out)
    }

    pub fn validate(&self) -> Result<(), PipeError> {
        let invalid = |reason: String| PipeError::Invalid {
            pipe: self.name.clone(),
            reason,
        };

        if self.name.is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.command.is_empty() {
            return Err(invalid("cmd must not be empty".to_string()));
        }
        if let Some(raw) = self.interval.as_deref() {
            parse_duration(raw).map_err(|err| invalid(format!("interval: {err}")))?;
        }
        if let Some(raw) = self.timeout.as_deref() {
            parse_duration(raw).map_err(|err| invalid(format!("timeout: {err}")))?;
        }
        if !self.debug {
            if self.output.table.is_empty() {
                return Err(invalid("output.table must not be empty".to_string()));
            }
            if self.output.ident.is_empty() {
                return Err(invalid("output.ident must not be empty".to_string()));
            }
        }

        Ok(())
    }

    pub fn load(path: &Path) -> Result<Pipe, PipeError> {
        let raw = fs::read_to_string(path).map_err(|source| PipeError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let pipe: Pipe = serde_yaml::from_str(&raw).map_err(|source| PipeError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
        pipe.validate()?;
        Ok(pipe)
    }

    /// Loads every `*.yml`/`*.yaml` file in a directory. Files that fail
    /// to parse or validate are skipped with a warning so one broken
    /// recipe does not take the whole process down.
    pub fn load_dir(dir: &Path) -> Result<Vec<Pipe>, PipeError> {
        let entries = fs::read_dir(dir).map_err(|source| PipeError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| {
                path.extension()
                    .is_some_and(|ext| ext == "yml" || ext == "yaml")
            })
            .collect();
        paths.sort();

        let mut pipes = Vec::new();
        for path in paths {
            match Pipe::load(&path) {
                Ok(pipe) => pipes.push(pipe),
                Err(err) => warn!(path = %path.display(), %err, "skipping pipe file"),
            }
        }

        Ok(pipes)
    }

    /// Distinct table names referenced by a set of pipes.
    pub fn tables(pipes: &[Pipe]) -> Vec<String> {
        let mut tables = BTreeSet::new();
        for pipe in pipes {
            if !pipe.input.table.is_empty() {
                tables.insert(pipe.input.table.clone());
            }
            if !pipe.output.table.is_empty() {
                tables.insert(pipe.output.table.clone());
            }
        }
        tables.into_iter().collect()
    }
}

/// Template context for rendering `cmd` and `as_file` lines.
pub fn input_context(data: &Data) -> Value {
    json!({ "input": map_input(data) })
}

/// Template context for rendering output fields of one stdout line. The
/// line is exposed raw as `output` and, when it parses, as `outputJson`.
pub fn line_context(data: &Data, line: &str) -> Value {
    let parsed: Value = serde_json::from_str(line).unwrap_or(Value::Null);
    json!({
        "input": map_input(data),
        "output": line,
        "outputJson": parsed,
    })
}

/// Expands dotted keys into nested objects: `{"tls.issuer": v}` becomes
/// `{"tls": {"issuer": v}}`.
pub fn unflatten(map: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::new();
    for (key, value) in map {
        insert_nested(&mut out, &key, value);
    }
    out
}

fn insert_nested(out: &mut Map<String, Value>, key: &str, value: Value) {
    match key.split_once('.') {
        None => {
            out.insert(key.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = out
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(inner) = entry {
                insert_nested(inner, rest, value);
            }
        }
    }
}

/// Parses durations like `100ms`, `90s`, `15m`, `24h`, `7d` and compounds
/// such as `1h30m`.
pub fn parse_duration(raw: &str) -> Result<Duration, PipeError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(PipeError::InvalidDuration(raw.to_string()));
    }

    let mut total = Duration::ZERO;
    let mut number = String::new();
    let mut chars = raw.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_ascii_digit() || c == '.' {
            number.push(c);
            chars.next();
            continue;
        }

        let mut unit = String::new();
        while let Some(&c) = chars.peek() {
            if !c.is_ascii_alphabetic() {
                break;
            }
            unit.push(c);
            chars.next();
        }

        let value: f64 = number
            .parse()
            .map_err(|_| PipeError::InvalidDuration(raw.to_string()))?;
        number.clear();

        let seconds = match unit.as_str() {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            "d" => value * 86400.0,
            _ => return Err(PipeError::InvalidDuration(raw.to_string())),
        };
        total += Duration::from_secs_f64(seconds);
    }

    if !number.is_empty() {
        // trailing number without a unit
        return Err(PipeError::InvalidDuration(raw.to_string()));
    }

    Ok(total)
}
