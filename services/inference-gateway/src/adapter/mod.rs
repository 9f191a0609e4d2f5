//! Inference adapters: one variant per logical model behind a single `predict` capability.
//!
//! An adapter owns an immutable deserialized model, so a loaded adapter can be
//! shared across threads and invoked concurrently.

mod forest;

pub use forest::{average_path_length, ForestState, IsolationForest, Node};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use thiserror::Error;

use crate::artifact::{Artifact, ArtifactCheck};
use crate::config::GatewayConfig;
use crate::error::ErrorKind;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("inference failed: {0}")]
    Inference(String),
    #[error("cannot load artifact: {0}")]
    Load(String),
}

impl AdapterError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AdapterError::InvalidInput(_) => ErrorKind::InvalidInput,
            AdapterError::Inference(_) => ErrorKind::InferenceError,
            AdapterError::Load(_) => ErrorKind::LoadError,
        }
    }
}

/// Prefix of the per-feature impact columns returned by [`Predict::explain`].
pub const IMPACT_PREFIX: &str = "model_impact_score_";

pub trait Predict: Send + Sync {
    fn predict(&self, input: &Value) -> Result<Value, AdapterError>;

    /// One `model_impact_score_<feature>` column per model feature, one value per input row.
    fn explain(&self, input: &Value) -> Result<Value, AdapterError>;

    fn predict_explained(&self, input: &Value, explain: bool) -> Result<Value, AdapterError> {
        let mut out = self.predict(input)?;
        if explain {
            if let (Value::Object(out), Value::Object(impacts)) = (&mut out, self.explain(input)?) {
                out.extend(impacts);
            }
        }
        Ok(out)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterKind {
    /// Per-event anomaly scoring.
    Event,
    /// Person-of-interest level scoring, reported as a confidence rank.
    Custom,
}

impl AdapterKind {
    pub fn code_ref(&self) -> &'static str {
        match self {
            AdapterKind::Event => "event_inference",
            AdapterKind::Custom => "custom_inference",
        }
    }

    pub fn from_model_name(name: &str) -> Option<Self> {
        match name {
            "event" => Some(AdapterKind::Event),
            "custom" => Some(AdapterKind::Custom),
            _ => None,
        }
    }

    /// Accepts `event_inference`, `event_inference.py` and similar forms.
    pub fn from_code_ref(code_ref: &str) -> Option<Self> {
        let stem = code_ref.rsplit('/').next().unwrap_or(code_ref);
        let stem = stem.strip_suffix(".py").unwrap_or(stem);
        [AdapterKind::Event, AdapterKind::Custom].into_iter().find(|k| k.code_ref() == stem)
    }

    pub fn load(&self, artifact: &Artifact) -> Result<Adapter, AdapterError> {
        match AdapterKind::from_code_ref(&artifact.code_ref) {
            Some(k) if k == *self => {}
            _ => return Err(AdapterError::Load(format!("artifact code {} cannot be served by the {} adapter", artifact.code_ref, self.code_ref()))),
        }
        let forest = IsolationForest::from_bytes(&artifact.bytes).map_err(AdapterError::Load)?;
        Ok(match self {
            AdapterKind::Event => Adapter::Event(EventAdapter { forest }),
            AdapterKind::Custom => Adapter::Custom(CustomAdapter { forest }),
        })
    }
}

/// Self-check used by the artifact store before publishing: the code reference must
/// name the adapter the model is served by, and the state must decode.
#[derive(Debug, Clone, Default)]
pub struct AdapterCatalog {
    models: BTreeMap<String, AdapterKind>,
}

impl AdapterCatalog {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let models = config.models.iter()
            .filter_map(|(name, settings)| settings.adapter_for(name).map(|k| (name.clone(), k)))
            .collect();
        Self { models }
    }

    /// Adapter serving `model_name`; unconfigured names fall back to the built-in mapping.
    pub fn adapter_for(&self, model_name: &str) -> Option<AdapterKind> {
        self.models.get(model_name).copied().or_else(|| AdapterKind::from_model_name(model_name))
    }
}

impl ArtifactCheck for AdapterCatalog {
    fn check(&self, model_name: &str, code_ref: &str, bytes: &[u8]) -> Result<(), String> {
        let kind = AdapterKind::from_code_ref(code_ref).ok_or_else(|| format!("unknown adapter code reference {code_ref}"))?;
        if let Some(expected) = self.adapter_for(model_name) {
            if expected != kind {
                return Err(format!("model {model_name} is served by {}, not {code_ref}", expected.code_ref()));
            }
        }
        IsolationForest::from_bytes(bytes).map(|_| ())
    }
}

#[derive(Debug)]
pub enum Adapter {
    Event(EventAdapter),
    Custom(CustomAdapter),
}

impl Adapter {
    pub fn kind(&self) -> AdapterKind {
        match self {
            Adapter::Event(_) => AdapterKind::Event,
            Adapter::Custom(_) => AdapterKind::Custom,
        }
    }
}

impl Predict for Adapter {
    fn predict(&self, input: &Value) -> Result<Value, AdapterError> {
        match self {
            Adapter::Event(a) => a.predict(input),
            Adapter::Custom(a) => a.predict(input),
        }
    }

    fn explain(&self, input: &Value) -> Result<Value, AdapterError> {
        match self {
            Adapter::Event(a) => a.explain(input),
            Adapter::Custom(a) => a.explain(input),
        }
    }
}

#[derive(Debug)]
pub struct EventAdapter { forest: IsolationForest }

impl Predict for EventAdapter {
    fn predict(&self, input: &Value) -> Result<Value, AdapterError> {
        let rows = parse_rows(self.forest.features(), input)?;
        let scores = score_rows(&self.forest, &rows)?;
        let percentiles: Vec<f64> = scores.iter().map(|s| self.forest.percentile_of(*s)).collect();
        Ok(json!({ "predicted_decision_scores": scores, "score_percentile": percentiles }))
    }

    fn explain(&self, input: &Value) -> Result<Value, AdapterError> { impact_columns(&self.forest, input) }
}

#[derive(Debug)]
pub struct CustomAdapter { forest: IsolationForest }

impl Predict for CustomAdapter {
    fn predict(&self, input: &Value) -> Result<Value, AdapterError> {
        let rows = parse_rows(self.forest.features(), input)?;
        let scores = score_rows(&self.forest, &rows)?;
        let ranks: Vec<f64> = scores.iter().map(|s| 100.0 - self.forest.percentile_of(*s)).collect();
        Ok(json!({ "predicted_decision_scores": scores, "confidence_rank": ranks }))
    }

    fn explain(&self, input: &Value) -> Result<Value, AdapterError> { impact_columns(&self.forest, input) }
}

fn impact_columns(forest: &IsolationForest, input: &Value) -> Result<Value, AdapterError> {
    let rows = parse_rows(forest.features(), input)?;
    let mut columns = vec![Vec::with_capacity(rows.len()); forest.features().len()];
    for (i, row) in rows.iter().enumerate() {
        for (column, impact) in columns.iter_mut().zip(forest.attribution(row)) {
            if !impact.is_finite() { return Err(AdapterError::Inference(format!("row {i}: non-finite impact"))); }
            column.push(impact);
        }
    }
    let out: Map<String, Value> = forest.features().iter().zip(columns)
        .map(|(f, c)| (format!("{IMPACT_PREFIX}{f}"), json!(c)))
        .collect();
    Ok(Value::Object(out))
}

fn score_rows(forest: &IsolationForest, rows: &[Vec<f64>]) -> Result<Vec<f64>, AdapterError> {
    rows.iter().enumerate().map(|(i, row)| {
        let s = forest.decision_score(row);
        if s.is_finite() { Ok(s) } else { Err(AdapterError::Inference(format!("row {i}: non-finite score"))) }
    }).collect()
}

/// Accepts one `{feature: number}` object, an array of them, or an array of numeric rows.
fn parse_rows(features: &[String], input: &Value) -> Result<Vec<Vec<f64>>, AdapterError> {
    match input {
        Value::Object(_) => Ok(vec![object_row(features, input, 0)?]),
        Value::Array(items) if items.is_empty() => Err(AdapterError::InvalidInput("no rows supplied".into())),
        Value::Array(items) => items.iter().enumerate().map(|(i, item)| match item {
            Value::Object(_) => object_row(features, item, i),
            Value::Array(cells) => {
                if cells.len() != features.len() {
                    return Err(AdapterError::InvalidInput(format!("row {i}: expected {} values, got {}", features.len(), cells.len())));
                }
                cells.iter().enumerate().map(|(j, c)| number(c).ok_or_else(|| AdapterError::InvalidInput(format!("row {i} column {j}: not a number")))).collect()
            }
            _ => Err(AdapterError::InvalidInput(format!("row {i}: expected an object or an array"))),
        }).collect(),
        _ => Err(AdapterError::InvalidInput("expected an object or an array of rows".into())),
    }
}

fn object_row(features: &[String], obj: &Value, i: usize) -> Result<Vec<f64>, AdapterError> {
    features.iter().map(|f| {
        let v = obj.get(f).ok_or_else(|| AdapterError::InvalidInput(format!("row {i}: missing feature {f}")))?;
        number(v).ok_or_else(|| AdapterError::InvalidInput(format!("row {i}: feature {f} is not a number")))
    }).collect()
}

fn number(v: &Value) -> Option<f64> { v.as_f64().filter(|x| x.is_finite()) }
