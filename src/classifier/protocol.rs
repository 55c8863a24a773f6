//! Request/response payloads exchanged with the classification service.
//!
//! Every message is one line of JSON. Requests are tagged by `action`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ClassifierError;
use crate::db::{LocationPrediction, SensorReading};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClassifierRequest {
    Calibrate { family: String },
    Classify { family: String, reading: SensorReading },
}

impl ClassifierRequest {
    pub fn encode(&self) -> Result<String, ClassifierError> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierResponse {
    pub success: bool,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

impl ClassifierResponse {
    pub fn decode(line: &str) -> Result<Self, ClassifierError> {
        serde_json::from_str(line).map_err(|err| {
            ClassifierError::Protocol(format!("unparseable classifier response: {err}"))
        })
    }

    /// The payload of a successful response; `Rejected` otherwise.
    pub fn into_data(self) -> Result<Option<Value>, ClassifierError> {
        if self.success {
            Ok(self.data)
        } else {
            Err(ClassifierError::Rejected(self.message))
        }
    }
}

/// `data` of a successful classify response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LocationAnalysis {
    #[serde(default)]
    pub guesses: Vec<LocationPrediction>,
}
