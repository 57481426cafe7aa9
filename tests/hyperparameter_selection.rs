use brainage::hyperparams::{
    self, SOURCE_COLUMN, SearchConfig, SelectionError, search_hyperparameters,
};
use std::fs;
use std::path::{Path, PathBuf};

fn write_config_fold(root: &Path, folder: &str, val_mae: &[f64], ids: &[&str]) {
    let dir = root.join(folder);
    fs::create_dir_all(&dir).expect("create fold directory");

    let mut log = String::from("epoch,mae,val_mae\n");
    for (epoch, value) in val_mae.iter().enumerate() {
        log.push_str(&format!("{epoch},{},{value}\n", 6.0 - epoch as f64));
    }
    fs::write(dir.join(hyperparams::LOG_FILE), log).expect("write log");

    let mut predictions = String::from("id,age,prediction\n");
    for (i, id) in ids.iter().enumerate() {
        predictions.push_str(&format!("{id},{},{}\n", 60 + i, 61.5 + i as f64));
    }
    fs::write(dir.join(hyperparams::DEFAULT_PREDICTION_FILE), predictions)
        .expect("write predictions");
}

fn three_configs(root: &Path) -> Vec<PathBuf> {
    let configs: Vec<PathBuf> = ["lr1e-3", "lr1e-4", "lr1e-5"]
        .iter()
        .map(|name| root.join(name))
        .collect();
    write_config_fold(&configs[0], "fold_0", &[0.9, 0.5, 0.6], &["a", "b"]);
    write_config_fold(&configs[1], "fold_0", &[0.8, 0.3, 0.4], &["a", "b"]);
    write_config_fold(&configs[2], "fold_0", &[0.3, 0.7, 0.8], &["a", "b"]);
    write_config_fold(&configs[0], "fold_1", &[0.2, 0.4], &["c", "d", "e"]);
    write_config_fold(&configs[1], "fold_1", &[0.6, 0.5], &["c", "d", "e"]);
    write_config_fold(&configs[2], "fold_1", &[0.7, 0.9], &["c", "d", "e"]);
    configs
}

#[test]
fn first_configuration_reaching_the_minimum_wins() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let configs = three_configs(dir.path());
    let config = SearchConfig::new(configs.clone(), vec!["fold_0".into(), "fold_1".into()]);

    let outcome = search_hyperparameters(&config).expect("selection");
    assert_eq!(outcome.selections.len(), 2);

    let fold_0 = &outcome.selections[0];
    assert_eq!(fold_0.source, configs[1].join("fold_0"));
    assert_eq!(fold_0.min_metric, 0.3);
    assert_eq!(fold_0.best_epoch, 1);

    let fold_1 = &outcome.selections[1];
    assert_eq!(fold_1.source, configs[0].join("fold_1"));
    assert_eq!(fold_1.best_epoch, 0);
}

#[test]
fn winning_predictions_are_stacked_with_their_source() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let configs = three_configs(dir.path());
    let config = SearchConfig::new(configs.clone(), vec!["fold_0".into(), "fold_1".into()]);
    let mut outcome = search_hyperparameters(&config).expect("selection");

    assert_eq!(outcome.predictions.height(), 5);
    let sources: Vec<String> = outcome
        .predictions
        .column(SOURCE_COLUMN)
        .expect("source column")
        .str()
        .expect("text column")
        .into_no_null_iter()
        .map(str::to_string)
        .collect();
    let fold_0 = configs[1].join("fold_0").display().to_string();
    let fold_1 = configs[0].join("fold_1").display().to_string();
    assert_eq!(sources[..2], [fold_0.clone(), fold_0]);
    assert_eq!(sources[2..], [fold_1.clone(), fold_1.clone(), fold_1]);

    let destination = dir.path().join("selected").join("test_pred.csv");
    hyperparams::write_predictions(&destination, &mut outcome).expect("write predictions");
    let text = fs::read_to_string(destination).expect("read predictions");
    assert_eq!(text.lines().next(), Some("id,age,prediction,src_path"));
    assert_eq!(text.lines().count(), 6);
}

#[test]
fn missing_prediction_file_aborts_before_selection() {
    let dir = tempfile::tempdir().expect("temporary directory");
    let configs = three_configs(dir.path());
    let missing = configs[2]
        .join("fold_1")
        .join(hyperparams::DEFAULT_PREDICTION_FILE);
    fs::remove_file(&missing).expect("remove prediction file");

    let config = SearchConfig::new(configs, vec!["fold_0".into(), "fold_1".into()]);
    match search_hyperparameters(&config) {
        Err(SelectionError::MissingFile(path)) => assert_eq!(path, missing),
        other => panic!("expected a missing file error, got {other:?}"),
    }
}
