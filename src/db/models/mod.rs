pub mod gps;
pub mod prediction;
pub mod reading;

pub use gps::{gps_key, GpsTag};
pub use prediction::LocationPrediction;
pub use reading::{Gps, SensorMap, SensorReading};
