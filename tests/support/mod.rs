use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex},
    time::Duration,
};

use roomsense_lib::{
    config::Settings,
    db::SensorReading,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};

/// Line-protocol classifier that answers every request successfully and
/// records what it was asked.
pub struct FakeClassifier {
    pub address: String,
    requests: Arc<Mutex<Vec<Value>>>,
}

impl FakeClassifier {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&requests);

        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let seen = Arc::clone(&seen);
                tokio::spawn(async move {
                    let (reader, mut writer) = stream.into_split();
                    let mut lines = BufReader::new(reader).lines();
                    while let Ok(Some(line)) = lines.next_line().await {
                        let request: Value = match serde_json::from_str(line.trim_end()) {
                            Ok(request) => request,
                            Err(_) => break,
                        };
                        let response = answer(&request);
                        seen.lock().unwrap().push(request);
                        let line = format!("{response}\n");
                        if writer.write_all(line.as_bytes()).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        Self { address, requests }
    }

    pub fn requests(&self, action: &str) -> Vec<Value> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request["action"] == action)
            .cloned()
            .collect()
    }
}

fn answer(request: &Value) -> Value {
    match request["action"].as_str() {
        Some("calibrate") => json!({"success": true, "message": "calibrated"}),
        Some("classify") => json!({
            "success": true,
            "message": "ok",
            "data": {"guesses": [
                {"location": "roomA", "probability": 0.876},
                {"location": "roomB", "probability": 0.124},
            ]},
        }),
        _ => json!({"success": false, "message": "unknown action"}),
    }
}

pub fn settings(data: &TempDir, classifier: &FakeClassifier) -> Settings {
    let mut settings = Settings::default();
    settings.store.data_dir = data.path().join("data");
    settings.store.queue_capacity = 16;
    settings.classifier.address = classifier.address.clone();
    settings.classifier.min_idle = 1;
    settings.classifier.max_open = 2;
    settings.classifier.backoff_unit_ms = 1;
    settings.calibration.interval_secs = 3600;
    settings.calibration.threshold_secs = 0;
    settings
}

pub fn reading(family: &str, timestamp: i64, device: &str, location: &str) -> SensorReading {
    let mut wifi = BTreeMap::new();
    wifi.insert("aa:bb".to_string(), -50.0);
    SensorReading {
        timestamp,
        family: family.to_string(),
        device: device.to_string(),
        location: location.to_string(),
        sensors: BTreeMap::from([("wifi".to_string(), wifi)]),
        gps: None,
    }
}

pub async fn wait_for(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
