use serde::{Deserialize, Serialize};

/// One classifier guess: a location label and its probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationPrediction {
    pub location: String,
    pub probability: f64,
}

impl LocationPrediction {
    pub fn new(location: impl Into<String>, probability: f64) -> Self {
        Self {
            location: location.into(),
            probability,
        }
    }
}
