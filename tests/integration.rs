//! Integration tests for haystack-rs
//!
//! Note: Tests marked with #[ignore] require a model download.
//! Run them explicitly with: cargo test --ignored

use candle_core::{Device, Tensor};
use haystack_rs::checkpoints::{checkpoint_revision, pythia_steps};
use haystack_rs::corpus::{chunk_tokens, load_token_batches, rows_to_tensor, save_token_batches};
use haystack_rs::feature_formation::{LanguageLossRecord, LayerAblationRecord};
use haystack_rs::{
    AndConditionsConfig, AutoEncoder, AutoEncoderConfig, FeatureFormationConfig, FeatureFormationProgress,
    LanguageData, SaeTrainingConfig,
};
use std::io::Write;
use tempfile::{tempdir, NamedTempFile};

fn write_file(path: &std::path::Path, content: &str) {
    let mut file = std::fs::File::create(path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
}

/// English JSON plus per-language europarl text files
#[test]
fn test_language_data_loading() {
    let dir = tempdir().unwrap();
    write_file(
        &dir.path().join("english_europarl.json"),
        r#"["The house is big.", "The session is open."]"#,
    );
    std::fs::create_dir(dir.path().join("europarl")).unwrap();
    write_file(
        &dir.path().join("europarl").join("de_samples.txt"),
        "Das Haus ist groß.\nDie Sitzung ist eröffnet.\n",
    );
    write_file(
        &dir.path().join("europarl").join("fr_samples.txt"),
        "La séance est ouverte.\n",
    );
    write_file(&dir.path().join("europarl").join("README.md"), "ignored");

    let data = LanguageData::load(dir.path()).unwrap();
    assert_eq!(data.len(), 3);
    assert_eq!(data.german().unwrap().len(), 2);
    assert_eq!(data.get("en").unwrap()[1], "The session is open.");
    assert_eq!(data.get("fr").unwrap().len(), 1);

    let non_german = data.non_german(10, 42);
    assert_eq!(non_german.len(), 3);
    assert!(non_german.iter().all(|p| !p.starts_with("D")));
}

#[test]
fn test_language_data_missing_english() {
    let dir = tempdir().unwrap();
    assert!(LanguageData::load(dir.path()).is_err());
}

/// Token rows survive a safetensors round trip
#[test]
fn test_token_batches_on_disk() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("tokens.safetensors");

    let streams = vec![(1..=9).collect::<Vec<u32>>(), (10..=13).collect()];
    let rows = chunk_tokens(&streams, 4, 0, 7);
    assert_eq!(rows.len(), 3);
    assert!(rows.iter().all(|r| r.len() == 5 && r[0] == 0));

    let tokens = rows_to_tensor(&rows, &Device::Cpu).unwrap();
    save_token_batches(&tokens, &path).unwrap();
    let loaded = load_token_batches(&path, &Device::Cpu).unwrap();
    assert_eq!(loaded.dims(), &[3, 5]);
    assert_eq!(loaded.to_vec2::<u32>().unwrap(), tokens.to_vec2::<u32>().unwrap());
}

/// Saved autoencoders carry weights and a config with `d_in` filled in
#[test]
fn test_autoencoder_save() {
    let dir = tempdir().unwrap();
    let encoder = AutoEncoder::new(8, 32, 1e-3, 0, &Device::Cpu).unwrap();
    let config = AutoEncoderConfig {
        layer: 3,
        act_name: "mlp.hook_post".to_string(),
        expansion_factor: 4,
        l1_coeff: 1e-3,
        d_in: None,
        run_name: None,
        reg: "l1".to_string(),
    };

    let weights = encoder.save(dir.path(), "25", &config).unwrap();
    assert!(weights.exists());

    let text = std::fs::read_to_string(dir.path().join("25.json")).unwrap();
    let saved: AutoEncoderConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(saved.d_in, Some(8));
    assert_eq!(saved.d_hidden().unwrap(), 32);
    assert_eq!(saved.encoder_hook_point().to_string(), "blocks.3.mlp.hook_post");

    let tensors = candle_core::safetensors::load(&weights, &Device::Cpu).unwrap();
    assert_eq!(tensors["W_enc"].dims(), &[8, 32]);
    assert_eq!(tensors["W_dec"].dims(), &[32, 8]);

    let x = Tensor::ones((2, 8), candle_core::DType::F32, &Device::Cpu).unwrap();
    let out = encoder.forward(&x).unwrap();
    assert_eq!(out.reconstruction.dims(), &[2, 8]);
}

/// Training configs accept partial JSON
#[test]
fn test_sae_config_from_file() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"layer": 5, "l1_coeff": 0.001}}"#).unwrap();

    let cfg = SaeTrainingConfig::from_file(file.path()).unwrap();
    assert_eq!(cfg.layer, 5);
    assert!((cfg.l1_coeff - 0.001).abs() < 1e-12);
    assert_eq!(cfg.model, "EleutherAI/pythia-70m");
    assert_eq!(cfg.expansion_factor, 4);
}

/// Progress written mid-run is picked up again
#[test]
fn test_feature_formation_resume() {
    let dir = tempdir().unwrap();
    let config = FeatureFormationConfig {
        model: "pythia-70m".to_string(),
        output_dir: dir.path().join("out"),
        ..Default::default()
    };
    let path = config.progress_path();
    assert!(path.ends_with("pythia-70m_checkpoint_features.json"));

    let fresh = FeatureFormationProgress::load(&path).unwrap();
    assert_eq!(fresh, FeatureFormationProgress::default());

    let mut progress = fresh;
    progress.layer_ablation.push(LayerAblationRecord {
        checkpoint: 2,
        layer: 1,
        loss_difference: 0.5,
        original_loss: 3.0,
        ablated_loss: 3.5,
    });
    progress.lang_loss.push(LanguageLossRecord {
        checkpoint: 2,
        language: "de".to_string(),
        loss: 4.25,
    });
    progress.completed.insert((2, 1));
    progress.save(&path).unwrap();

    let resumed = FeatureFormationProgress::load(&path).unwrap();
    assert_eq!(resumed.completed, progress.completed);
    assert!(resumed.probe.is_empty());

    assert_eq!(resumed.layer_ablation.len(), 1);
    let ablation = &resumed.layer_ablation[0];
    assert_eq!((ablation.checkpoint, ablation.layer), (2, 1));
    assert!((ablation.loss_difference - 0.5).abs() < 1e-6);
    assert!((ablation.original_loss - 3.0).abs() < 1e-6);
    assert!((ablation.ablated_loss - 3.5).abs() < 1e-6);

    assert_eq!(resumed.lang_loss.len(), 1);
    assert_eq!(resumed.lang_loss[0].language, "de");
    assert!((resumed.lang_loss[0].loss - 4.25).abs() < 1e-6);

    assert!(resumed.is_done(2, 1));
    assert!(!resumed.is_done(2, 2));
    assert!(resumed.has_language_losses(2));
    assert!(!resumed.has_language_losses(3));

    let json = std::fs::read_to_string(&path).unwrap();
    assert!(json.contains("\"LossDifference\""));
}

#[test]
fn test_checkpoint_schedule() {
    let steps = pythia_steps();
    assert_eq!(steps.len(), 154);
    assert_eq!(checkpoint_revision("EleutherAI/pythia-70m", 0).unwrap().as_deref(), Some("step0"));
    assert_eq!(checkpoint_revision("EleutherAI/pythia-70m", 153).unwrap().as_deref(), Some("step143000"));
    assert_eq!(checkpoint_revision("EleutherAI/pythia-70m", 154).unwrap(), None);
}

#[test]
fn test_and_conditions_config_defaults() {
    let cfg = AndConditionsConfig::default();
    assert_eq!(cfg.mlp_layer, 5);
    assert_eq!(cfg.context_neuron.label(), "L3N669");
    assert_eq!(cfg.options.len(), 3);
}

/// Model-dependent test: Pythia dimensions
#[test]
#[ignore = "requires model download"]
fn test_model_loading() {
    use haystack_rs::HaystackModel;

    let model = HaystackModel::from_pretrained("EleutherAI/pythia-70m").unwrap();
    assert_eq!(model.n_layers(), 6);
    assert_eq!(model.d_model(), 512);
    assert_eq!(model.d_mlp(), 2048);
}

/// Model-dependent test: context neuron activations
#[test]
#[ignore = "requires model download"]
fn test_context_neuron_activations() {
    use haystack_rs::{ContextHooks, ContextNeuron, HaystackModel};

    let model = HaystackModel::from_pretrained("EleutherAI/pythia-70m").unwrap();
    let german = vec![
        "Die Kommission hat heute einen Vorschlag vorgelegt, der die Zusammenarbeit der Mitgliedstaaten im Bereich der Energiepolitik deutlich verbessern soll und von allen Fraktionen begrüßt wurde.".to_string(),
    ];
    let english = vec![
        "The Commission presented a proposal today that should significantly improve cooperation between the Member States in the field of energy policy and was welcomed by all groups.".to_string(),
    ];

    let hooks = ContextHooks::from_data(&model, ContextNeuron::default(), &german, &english).unwrap();
    assert!(hooks.active_values[0] > hooks.inactive_values[0]);
}
