//! Flow documents: an optional header document followed by a step list.

use serde::Deserialize;
use serde_yaml::Value;

use super::FlowError;
use super::step::Operation;

/// One decoded step
#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    pub op: Operation,
    /// Compact rendering of the step as written, used as action intent
    pub raw: String,
}

/// A parsed flow
#[derive(Debug, Clone, PartialEq)]
pub struct Flow {
    pub app_id: Option<String>,
    pub name: Option<String>,
    pub steps: Vec<Step>,
}

impl Flow {
    /// Test name: header `name`, else the file stem, else a placeholder
    pub fn test_name(&self, file_stem: Option<&str>) -> String {
        self.name
            .clone()
            .or_else(|| file_stem.map(str::to_string))
            .unwrap_or_else(|| "Unnamed Test".to_string())
    }
}

/// Parse a flow. Unknown commands are rejected with their 1-based step number.
pub fn parse_flow(source: &str) -> Result<Flow, FlowError> {
    let mut docs = Vec::new();
    for document in serde_yaml::Deserializer::from_str(source) {
        docs.push(Value::deserialize(document)?);
    }
    docs.retain(|d| !d.is_null());

    let (header, body) = match docs.as_slice() {
        [] => return Err(FlowError::Empty),
        [only] => (None, only),
        [header, body, ..] => (Some(header), body),
    };

    let app_id = header.and_then(|h| h.get("appId")).and_then(Value::as_str).map(str::to_string);
    let name = header.and_then(|h| h.get("name")).and_then(Value::as_str).map(str::to_string);

    let Value::Sequence(entries) = body else {
        return Err(FlowError::NotAList);
    };
    if entries.is_empty() {
        return Err(FlowError::Empty);
    }

    let steps = entries
        .iter()
        .enumerate()
        .map(|(i, entry)| parse_step(i + 1, entry))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Flow {
        app_id,
        name,
        steps,
    })
}

fn parse_step(index: usize, entry: &Value) -> Result<Step, FlowError> {
    let (name, params) = match entry {
        Value::String(name) => (name.as_str(), None),
        Value::Mapping(map) if map.len() == 1 => {
            let Some((key, params)) = map.iter().next() else {
                return Err(FlowError::InvalidParams {
                    op: format!("step {}", index),
                    message: "empty step".to_string(),
                });
            };
            let name = key.as_str().ok_or_else(|| FlowError::InvalidParams {
                op: format!("step {}", index),
                message: "command name must be a string".to_string(),
            })?;
            (name, Some(params))
        }
        _ => {
            return Err(FlowError::InvalidParams {
                op: format!("step {}", index),
                message: "expected a command name or a single-key map".to_string(),
            });
        }
    };

    let op = Operation::from_yaml(name, params).map_err(|e| match e {
        FlowError::UnknownCommand { name, .. } => FlowError::UnknownCommand { index, name },
        other => other,
    })?;
    let raw = serde_json::to_string(entry).unwrap_or_else(|_| name.to_string());
    Ok(Step { op, raw })
}
