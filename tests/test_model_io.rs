use std::io::Write;

use chaincrf::{Attribute, Model, Regularizer, TrainOptions, Trainer};

fn weather_data() -> (Vec<Vec<Vec<Attribute>>>, Vec<Vec<&'static str>>) {
    let xs = vec![
        vec![
            vec![Attribute::new("walk", 1.0), Attribute::new("shop", 0.5)],
            vec![Attribute::new("walk", 1.0)],
            vec![Attribute::new("clean", 1.0)],
        ],
        vec![
            vec![Attribute::new("clean", 1.0), Attribute::new("shop", 0.2)],
            vec![Attribute::new("clean", 0.8)],
        ],
    ];
    let ys = vec![vec!["sunny", "sunny", "rainy"], vec!["rainy", "rainy"]];
    (xs, ys)
}

fn trained_model() -> Model {
    let mut trainer = Trainer::with_options(TrainOptions {
        max_iterations: 30,
        regularizer: Regularizer::L2,
        sigma: 10.0,
        ..TrainOptions::default()
    });
    let (xs, ys) = weather_data();
    for (xseq, yseq) in xs.iter().zip(ys.iter()) {
        trainer.append(xseq, yseq).unwrap();
    }
    trainer.train().unwrap();
    trainer.into_model().unwrap()
}

#[test]
fn test_save_load_round_trip() {
    let model = trained_model();
    let file = tempfile::NamedTempFile::new().unwrap();
    model.save(file.path()).unwrap();

    let loaded = Model::load(file.path()).unwrap();
    let a = model.params();
    let b = loaded.params();

    assert_eq!(a.num_labels(), b.num_labels());
    assert_eq!(a.num_obs(), b.num_obs());
    assert_eq!(a.num_features(), b.num_features());
    // Weights are written with 20 significant digits: exact round-trip
    assert_eq!(a.weights(), b.weights());
    for (name, id) in a.labels().iter() {
        assert_eq!(b.labels().get(name), Some(id));
    }
    for (name, id) in a.observations().iter() {
        assert_eq!(b.observations().get(name), Some(id));
    }
    assert_eq!(a.state_index().len(), b.state_index().len());
}

#[test]
fn test_reloaded_model_predicts_identically() {
    let model = trained_model();
    let file = tempfile::NamedTempFile::new().unwrap();
    model.save(file.path()).unwrap();
    let loaded = Model::load(file.path()).unwrap();

    let (xs, _) = weather_data();
    let mut tagger = model.tagger();
    let mut reloaded_tagger = loaded.tagger();
    for xseq in &xs {
        let before = tagger.tag(xseq).unwrap();
        let after = reloaded_tagger.tag(xseq).unwrap();
        assert_eq!(before, after);
    }
}

#[test]
fn test_load_rejects_bad_header() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# some other file").unwrap();
    writeln!(file, "# MAXENT model file").unwrap();
    writeln!(file, ":").unwrap();
    writeln!(file, "1").unwrap();
    file.flush().unwrap();

    assert!(Model::load(file.path()).is_err());
}

#[test]
fn test_load_rejects_missing_sentinel() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# chaincrf").unwrap();
    writeln!(file, "# CRF model file (text format)").unwrap();
    writeln!(file, "not-a-sentinel").unwrap();
    file.flush().unwrap();

    assert!(Model::load(file.path()).is_err());
}

#[test]
fn test_load_rejects_truncated_body() {
    let model = trained_model();
    let file = tempfile::NamedTempFile::new().unwrap();
    model.save(file.path()).unwrap();

    let text = std::fs::read_to_string(file.path()).unwrap();
    let keep: Vec<&str> = text.lines().take(text.lines().count() / 2).collect();
    let truncated = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(truncated.path(), keep.join("\n")).unwrap();

    assert!(Model::load(truncated.path()).is_err());
}

#[test]
fn test_unknown_attributes_are_ignored() {
    let model = trained_model();
    let mut tagger = model.tagger();
    let xseq = vec![vec![
        Attribute::new("walk", 1.0),
        Attribute::new("never-seen", 1.0),
    ]];
    let labels = tagger.tag(&xseq).unwrap();
    assert_eq!(labels.len(), 1);
    assert!(labels[0] == "sunny" || labels[0] == "rainy");
}
