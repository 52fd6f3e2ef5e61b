use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::coord::types::{OperatorId, Payload};
use crate::core::errors::{DagwireError, Result};

/// Serializable workflow as handed over by the graph provider
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    #[serde(default)]
    pub name: Option<String>,
    pub operators: Vec<OperatorSpec>,
    #[serde(default)]
    pub links: Vec<LinkSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperatorSpec {
    pub id: OperatorId,
    /// Opaque descriptor handed to the operator function
    #[serde(default)]
    pub payload: Payload,
}

/// Directed edge `source -> target`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub source: OperatorId,
    pub target: OperatorId,
}

impl WorkflowDefinition {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DagwireError::io(format!("read workflow {}", path.display()), e))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    pub fn operator(mut self, id: impl Into<OperatorId>, payload: Payload) -> Self {
        self.operators.push(OperatorSpec {
            id: id.into(),
            payload,
        });
        self
    }

    pub fn link(mut self, source: impl Into<OperatorId>, target: impl Into<OperatorId>) -> Self {
        self.links.push(LinkSpec {
            source: source.into(),
            target: target.into(),
        });
        self
    }
}
