//! Loading a decoder from weight files on disk.

use std::sync::Arc;

use candle_core::Device;
use tandem_core::config::ModelConfig;
use tandem_core::distributed::ParallelCoordinates;
use tandem_core::engine::{Decoder, DecoderError, ExecutionContext, ExecutionStrategy, StepDims};
use tandem_core::loader::{
    export_weights, model_tensors, names, DirWeightSource, SyntheticWeights, WeightDataType,
    WeightError, WeightSource,
};
use tandem_core::testing::{tiny_config, NullLink, RecordingChannel, TEST_SEED};

fn decoder_from(source: &dyn WeightSource) -> Result<Decoder, DecoderError> {
    let ctx = ExecutionContext::new(
        tiny_config(),
        ParallelCoordinates::single(),
        ExecutionStrategy::default(),
        Device::Cpu,
    )?;
    Decoder::new(
        ctx,
        source,
        Arc::new(RecordingChannel::default()),
        Arc::new(NullLink),
    )
}

fn first_logits(decoder: &mut Decoder) -> Vec<f32> {
    decoder
        .forward(&[5, 6, 7], StepDims::new(1, 1, 3), 0, false)
        .unwrap()
        .logits()
        .unwrap()
        .data
        .to_vec()
}

#[test]
fn test_exported_weights_reproduce_synthetic_logits() {
    let dir = tempfile::tempdir().unwrap();
    let synthetic = SyntheticWeights::new(TEST_SEED, Device::Cpu);
    export_weights(
        &synthetic,
        &model_tensors(&tiny_config(), true),
        dir.path(),
        WeightDataType::F32,
    )
    .unwrap();
    std::fs::write(
        dir.path().join("config.json"),
        serde_json::to_string(&tiny_config()).unwrap(),
    )
    .unwrap();
    let config = ModelConfig::from_file(dir.path().join("config.json")).unwrap();
    assert_eq!(config.num_hidden_layers, tiny_config().num_hidden_layers);

    let on_disk = DirWeightSource::new(dir.path(), WeightDataType::F32, Device::Cpu);
    let expected = first_logits(&mut decoder_from(&synthetic).unwrap());
    let actual = first_logits(&mut decoder_from(&on_disk).unwrap());
    assert_eq!(actual, expected);
}

#[test]
fn test_missing_required_weight_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let synthetic = SyntheticWeights::new(TEST_SEED, Device::Cpu);
    export_weights(
        &synthetic,
        &model_tensors(&tiny_config(), true),
        dir.path(),
        WeightDataType::F16,
    )
    .unwrap();
    let victim = names::layer(2, names::DOWN_WEIGHT);
    std::fs::remove_file(dir.path().join(format!("{victim}.bin"))).unwrap();

    let on_disk = DirWeightSource::new(dir.path(), WeightDataType::F16, Device::Cpu);
    match decoder_from(&on_disk) {
        Err(DecoderError::Weight(WeightError::Missing { path })) => {
            assert!(path.to_string_lossy().contains(&victim));
        }
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("decoder loaded without {victim}"),
    }
}
