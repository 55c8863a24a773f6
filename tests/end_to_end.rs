mod support;

use roomsense_lib::{
    db::{
        helpers::{decode_family, encode_family},
        LocationPrediction, StoreError, LAST_CALIBRATION_KEY,
    },
    dump_family, list_families, Service,
};
use support::{reading, settings, wait_for, FakeClassifier};
use tempfile::TempDir;

#[tokio::test]
async fn reading_and_predictions_round_trip() -> anyhow::Result<()> {
    let data = TempDir::new()?;
    let classifier = FakeClassifier::start().await;
    let service = Service::start(&settings(&data, &classifier)).await?;

    let scan = reading("home", 1000, "d1", "roomA");
    service.ingestor().save_reading(scan.clone()).await?;
    service
        .ingestor()
        .save_predictions("home", 1000, vec![LocationPrediction::new("roomA", 0.999)])
        .await?;

    let store = service.registry().get("home")?;
    store.flush().await?;
    assert_eq!(store.latest_reading("d1")?, scan);
    assert_eq!(
        store.predictions_at(1000)?,
        vec![LocationPrediction::new("roomA", 1.0)]
    );
    assert_eq!(store.labeled_reading_count()?, 1);

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn new_family_is_calibrated_once() -> anyhow::Result<()> {
    let data = TempDir::new()?;
    let classifier = FakeClassifier::start().await;
    let service = Service::start(&settings(&data, &classifier)).await?;

    for ts in 1..=20 {
        service
            .ingestor()
            .save_reading(reading("office", ts, "d1", "desk"))
            .await?;
    }
    wait_for(|| service.scheduler().completed_runs("office") == 1).await;

    let store = service.registry().get("office")?;
    let marker: chrono::DateTime<chrono::Utc> = store.get_value(LAST_CALIBRATION_KEY)?;
    assert!(marker <= chrono::Utc::now());

    for _ in 0..10 {
        assert!(!service.scheduler().evaluate(&store).await?);
    }
    assert_eq!(classifier.requests("calibrate").len(), 1);
    assert_eq!(classifier.requests("calibrate")[0]["family"], "office");

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn classify_stores_guesses() -> anyhow::Result<()> {
    let data = TempDir::new()?;
    let classifier = FakeClassifier::start().await;
    let service = Service::start(&settings(&data, &classifier)).await?;

    let guesses = service
        .ingestor()
        .classify(&reading("home", 5000, "d2", ""))
        .await?;
    assert_eq!(guesses.len(), 2);

    let store = service.registry().get("home")?;
    store.flush().await?;
    assert_eq!(
        store.predictions_at(5000)?,
        vec![
            LocationPrediction::new("roomA", 0.88),
            LocationPrediction::new("roomB", 0.12),
        ]
    );
    assert_eq!(store.list_locations()?, vec!["roomA".to_string(), "roomB".to_string()]);
    assert_eq!(classifier.requests("classify")[0]["reading"]["device"], "d2");

    service.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn data_survives_restart() -> anyhow::Result<()> {
    let data = TempDir::new()?;
    let classifier = FakeClassifier::start().await;
    let settings = settings(&data, &classifier);

    let service = Service::start(&settings).await?;
    for ts in 1..=5 {
        service
            .ingestor()
            .save_reading(reading("Lab #3", ts * 1000, "d1", "bench"))
            .await?;
    }
    service.shutdown().await;

    assert_eq!(list_families(&settings.store.data_dir)?, vec!["Lab #3".to_string()]);
    let dump = dump_family(&settings.store.data_dir, "Lab #3")?;
    assert!(dump.contains("INSERT INTO \"sensors\""));
    assert!(dump_family(&settings.store.data_dir, "missing").is_err());

    let service = Service::start(&settings).await?;
    assert!(service.registry().is_open("Lab #3"));
    let store = service.registry().get("Lab #3")?;
    assert_eq!(store.latest_reading("d1")?.timestamp, 5000);
    assert_eq!(store.labeled_reading_count()?, 5);

    service.registry().delete("Lab #3").await?;
    assert!(matches!(
        service.registry().open_existing("Lab #3"),
        Err(StoreError::NotFound(_))
    ));
    service.shutdown().await;
    Ok(())
}

#[test]
fn family_encoding_is_a_bijection() {
    let families = [
        "home",
        "Building 7/Floor 2",
        "../escape",
        "ünïcode ✓",
        "a.sqlite3.db",
        "UPPER lower",
    ];
    for family in families {
        let encoded = encode_family(family);
        assert!(encoded
            .trim_end_matches(".sqlite3.db")
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
        let decoded = decode_family(&encoded).expect("decodable");
        assert_eq!(decoded, family);
        assert_eq!(encode_family(&decoded), encoded);
    }
}
