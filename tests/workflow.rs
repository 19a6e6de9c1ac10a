use delta1_mlstore::common::{log, time};
use delta1_mlstore::features::{EntityRow, FeatureRow, FeatureStore, FeatureView};
use delta1_mlstore::registry::{LogModel, LogRequest, ModelRegistry, Signature};
use delta1_mlstore::{AppCfg, DeltaError, LinearModel, Predictor, Value, ValueType};

const MODEL: &str = "driver-ranking";

fn driver_view() -> FeatureView {
    FeatureView::new("driver_hourly_stats", "driver_id")
        .with_feature("conv_rate", ValueType::Float)
        .with_feature("acc_rate", ValueType::Float)
}

fn stats(driver: i64, at: &str, conv: f64, acc: f64) -> FeatureRow {
    FeatureRow::new(driver, time::parse(at).unwrap())
        .with_value("conv_rate", conv)
        .with_value("acc_rate", acc)
}

#[test]
fn features_train_register_and_serve() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = AppCfg::with_root(dir.path());
    log::init(&cfg).unwrap();
    log::init(&cfg).unwrap();
    let store = FeatureStore::open(&cfg, vec![driver_view()]).unwrap();
    let registry = ModelRegistry::open(&cfg);

    store
        .ingest(
            "driver_hourly_stats",
            vec![
                stats(1001, "2021-04-12 10:00:00", 0.5, 0.9),
                stats(1001, "2021-04-12 12:00:00", 0.8, 0.7),
                stats(1002, "2021-04-12 11:00:00", 0.3, 0.6),
            ],
        )
        .unwrap();

    let refs = ["driver_hourly_stats.conv_rate", "driver_hourly_stats.acc_rate"];
    let training = store
        .get_historical_features(
            &[
                (EntityRow::single("driver_id", 1001), time::parse("2021-04-12 11:00:00").unwrap()),
                (EntityRow::single("driver_id", 1002), time::parse("2021-04-12 12:00:00").unwrap()),
            ],
            &refs,
        )
        .unwrap();
    let inputs = training.to_inputs().unwrap();
    assert_eq!(inputs[0], vec![Value::Float(0.5), Value::Float(0.9)]);

    let model = LinearModel::new(vec![1.0, 1.0], 0.0);
    let expected = model.predict(&inputs).unwrap();
    assert_eq!(expected.len(), 2);
    let run = registry.begin_run().unwrap();
    let request = LogRequest::new(
        LogModel::new("model", model.to_artifact().unwrap())
            .with_signature(Signature::infer(&inputs, &expected).unwrap())
            .registered_as(MODEL),
    )
    .param("features", refs.len() as i64)
    .metric("rmse", 0.12);
    let version = registry.log(&run.id, request).unwrap().unwrap();
    assert_eq!(version.version, 1);
    assert!(registry.get_run(&run.id).unwrap().is_sealed());

    let loaded = registry.resolve(&format!("models:/{MODEL}/latest")).unwrap();
    assert_eq!(loaded.predict(&inputs).unwrap(), expected);
    let err = loaded.predict(&[vec![Value::from("fast"), Value::Float(0.1)]]).unwrap_err();
    assert!(matches!(err, DeltaError::SignatureMismatch(_)));

    let watermark = store
        .materialize_incremental(time::parse("2021-04-12 13:00:00").unwrap())
        .unwrap();
    assert_eq!(watermark, time::parse("2021-04-12 13:00:00").unwrap());

    let online = store
        .get_online_features(
            &refs,
            &[EntityRow::single("driver_id", 1001), EntityRow::single("driver_id", 1002)],
        )
        .unwrap();
    assert_eq!(online.get(0, "driver_hourly_stats.conv_rate"), Some(&Value::Float(0.8)));
    let served = loaded.predict(&online.to_inputs().unwrap()).unwrap();
    assert_eq!(served.len(), 2);
}
