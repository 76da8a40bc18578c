//! Trace provider collecting `trace()` output for the lab response

use crate::server::models::{TraceOutput, TracePart};
use octofhir_fhirpath::core::TraceProvider;
use serde_json::Value as JsonValue;
use std::sync::Mutex;

#[derive(Debug, Clone)]
struct TraceEntry {
    name: String,
    index: Option<usize>,
    message: String,
}

/// Collects traces emitted while evaluating one context item so they can be
/// nested under `trace` parameters in the response.
#[derive(Debug, Default)]
pub struct LabTraceProvider {
    entries: Mutex<Vec<TraceEntry>>,
}

impl LabTraceProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, entry: TraceEntry) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry);
        }
    }

    /// Render the captured entries as response-ready trace outputs.
    ///
    /// Consecutive entries sharing a name collapse into one output. Messages
    /// that parse as JSON keep their decoded shape; everything else stays a
    /// plain string. Each value is tagged with a datatype derived from its
    /// JSON shape.
    pub fn outputs(&self) -> Vec<TraceOutput> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(_) => return Vec::new(),
        };

        let mut outputs: Vec<TraceOutput> = Vec::new();
        for entry in entries {
            let value = serde_json::from_str(&entry.message)
                .unwrap_or_else(|_| JsonValue::String(entry.message.clone()));
            let part = TracePart {
                datatype: trace_value_type(&value),
                value,
            };

            match outputs.last_mut() {
                Some(last) if last.name == entry.name => last.parts.push(part),
                _ => outputs.push(TraceOutput {
                    name: entry.name,
                    parts: vec![part],
                }),
            }
        }
        outputs
    }
}

fn trace_value_type(value: &JsonValue) -> String {
    match value {
        JsonValue::Null => "null".to_string(),
        JsonValue::Bool(_) => "boolean".to_string(),
        JsonValue::Number(n) if n.is_i64() => "integer".to_string(),
        JsonValue::Number(_) => "decimal".to_string(),
        JsonValue::String(_) => "string".to_string(),
        JsonValue::Array(_) => "Collection".to_string(),
        JsonValue::Object(map) => map
            .get("resourceType")
            .and_then(|v| v.as_str())
            .unwrap_or("Element")
            .to_string(),
    }
}

impl TraceProvider for LabTraceProvider {
    fn trace(&self, name: &str, index: usize, message: &str) {
        self.push(TraceEntry {
            name: name.to_string(),
            index: Some(index),
            message: message.to_string(),
        });
    }

    fn trace_simple(&self, name: &str, message: &str) {
        self.push(TraceEntry {
            name: name.to_string(),
            index: None,
            message: message.to_string(),
        });
    }

    fn collect_traces(&self) -> Vec<String> {
        let entries = match self.entries.lock() {
            Ok(entries) => entries.clone(),
            Err(_) => return Vec::new(),
        };

        entries
            .iter()
            .map(|entry| match entry.index {
                Some(index) => format!("TRACE[{}][{}]: {}", entry.name, index, entry.message),
                None => format!("TRACE[{}]: {}", entry.name, entry.message),
            })
            .collect()
    }

    fn clear_traces(&self) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.clear();
        }
    }
}
