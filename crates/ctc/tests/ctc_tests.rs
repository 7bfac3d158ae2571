use std::sync::Arc;

use anyhow::Result;
use attention::masks::mask_from_lengths;
use attention::{CombinationConfig, CombinationStrategy, EncodedSequence, Encoder, EncoderWrapper};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use ctc::{CtcConfig, CtcDecoder, CtcError};
use vocabulary::{Vocabulary, END_TOKEN_INDEX};

fn vocabulary() -> Arc<Vocabulary> {
    Arc::new(Vocabulary::from_sentences(&[vec!["a", "b", "c"]], 1, None))
}

fn encoder(lengths: &[usize], time: usize) -> Result<EncodedSequence> {
    let device = Device::Cpu;
    let batch = lengths.len();
    Ok(EncodedSequence::new(
        "src",
        Tensor::randn(0f32, 1.0, (batch, time, 6), &device)?,
        mask_from_lengths(lengths, time, &device)?,
        Tensor::randn(0f32, 1.0, (batch, 6), &device)?,
    )?)
}

fn head(config: CtcConfig, encoder: &dyn Encoder, varmap: &VarMap) -> Result<CtcDecoder> {
    let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
    Ok(CtcDecoder::new(config, vocabulary(), encoder, vb)?)
}

/// Makes every step predict `class` regardless of the encoder states.
fn force_class(varmap: &mut VarMap, class: u32) -> Result<()> {
    let classes = vocabulary().len() + 1;
    let mut bias = vec![0f32; classes];
    bias[class as usize] = 50.0;
    varmap.set_one(
        "ctc.output_projection.weight",
        Tensor::zeros((classes, 6), DType::F32, &Device::Cpu)?,
    )?;
    varmap.set_one(
        "ctc.output_projection.bias",
        Tensor::from_vec(bias, classes, &Device::Cpu)?,
    )?;
    Ok(())
}

#[test]
fn logits_are_time_major_with_a_blank_class() -> Result<()> {
    let varmap = VarMap::new();
    let encoder = encoder(&[4, 2, 3], 4)?;
    let head = head(CtcConfig::new("ctc"), &encoder, &varmap)?;
    assert_eq!(head.logits()?.dims(), &[4, 3, vocabulary().len() + 1]);
    assert_eq!(head.blank() as usize, vocabulary().len());
    assert_eq!(head.input_lengths(), &[4, 2, 3]);
    Ok(())
}

#[test]
fn encoders_without_states_are_rejected() -> Result<()> {
    let varmap = VarMap::new();
    let wrapper = EncoderWrapper::new(
        "multi",
        vec![Arc::new(encoder(&[2], 2)?) as Arc<dyn Encoder>],
        CombinationConfig::new(CombinationStrategy::Flat, 4),
    )?;
    let err = head(CtcConfig::new("ctc"), &wrapper, &varmap).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<CtcError>(),
        Some(CtcError::MissingEncoderTensor { .. })
    ));
    Ok(())
}

#[test]
fn targets_are_unpadded_ids_without_end_symbol() -> Result<()> {
    let varmap = VarMap::new();
    let encoder = encoder(&[4, 4], 4)?;
    let head = head(CtcConfig::new("ctc"), &encoder, &varmap)?;
    let vocabulary = vocabulary();
    let targets = head.targets(&[vec!["a", "b"], vec!["c"]])?;
    assert_eq!(
        targets,
        vec![
            vec![vocabulary.get_word_index("a"), vocabulary.get_word_index("b")],
            vec![vocabulary.get_word_index("c")],
        ]
    );
    Ok(())
}

#[test]
fn loss_is_summed_and_differentiable() -> Result<()> {
    let varmap = VarMap::new();
    let encoder = encoder(&[5, 3], 5)?;
    let head = head(CtcConfig::new("ctc"), &encoder, &varmap)?;
    let references = vec![vec!["a", "b"], vec!["c"]];
    let loss = head.cost(Some(references.as_slice()))?;
    let value = loss.to_scalar::<f32>()?;
    assert!(value.is_finite() && value > 0.0);

    let grads = loss.backward()?;
    for var in varmap.all_vars() {
        assert!(grads.get(var.as_tensor()).is_some());
    }
    Ok(())
}

#[test]
fn merging_targets_relaxes_the_length_requirement() -> Result<()> {
    let varmap = VarMap::new();
    let encoder = encoder(&[2], 2)?;
    let references = vec![vec!["a", "a"]];

    let strict = head(CtcConfig::new("ctc"), &encoder, &varmap)?;
    let err = strict.cost(Some(references.as_slice())).unwrap_err();
    assert!(matches!(err, CtcError::LabelOverflow { required: 3, .. }));

    let mut config = CtcConfig::new("ctc");
    config.merge_repeated_targets = true;
    let merged = head(config, &encoder, &varmap)?;
    assert!(merged.cost(Some(references.as_slice()))?.to_scalar::<f32>()?.is_finite());

    let mut config = CtcConfig::new("ctc");
    config.merge_repeated_outputs = false;
    let unmerged = head(config, &encoder, &varmap)?;
    assert!(unmerged.cost(Some(references.as_slice()))?.to_scalar::<f32>()?.is_finite());
    Ok(())
}

#[test]
fn cost_requires_references() -> Result<()> {
    let varmap = VarMap::new();
    let encoder = encoder(&[2], 2)?;
    let head = head(CtcConfig::new("ctc"), &encoder, &varmap)?;
    assert!(matches!(head.cost::<&str>(None), Err(CtcError::MissingTargets)));
    Ok(())
}

#[test]
fn greedy_output_merges_and_pads_with_end() -> Result<()> {
    let mut varmap = VarMap::new();
    let encoder = encoder(&[3, 1], 3)?;
    let a = vocabulary().get_word_index("a");

    let mut config = CtcConfig::new("ctc");
    config.merge_repeated_outputs = false;
    let unmerged = head(config, &encoder, &varmap)?;
    force_class(&mut varmap, a)?;
    let decoded = unmerged.decode()?;
    assert_eq!(decoded.hypotheses[0].labels, vec![a; 3]);
    assert_eq!(
        decoded.dense.to_vec2::<u32>()?,
        vec![vec![a, a, a], vec![a, END_TOKEN_INDEX, END_TOKEN_INDEX]]
    );

    let merged = head(CtcConfig::new("ctc"), &encoder, &varmap)?;
    let decoded = merged.decode()?;
    assert_eq!(merged.decoded_sentences(&decoded), vec![vec!["a"], vec!["a"]]);
    Ok(())
}

#[test]
fn beam_search_agrees_with_greedy_on_confident_outputs() -> Result<()> {
    let mut varmap = VarMap::new();
    let encoder = encoder(&[4, 2], 4)?;
    let mut config = CtcConfig::new("ctc");
    config.beam_width = 4;
    let beam = head(config, &encoder, &varmap)?;
    force_class(&mut varmap, beam.blank())?;

    let greedy = head(CtcConfig::new("ctc"), &encoder, &varmap)?;
    let from_beam = beam.decode()?;
    let from_greedy = greedy.decode()?;
    assert!(from_beam.hypotheses.iter().all(|h| h.labels.is_empty()));
    assert_eq!(from_greedy.dense.dims(), &[2, 0]);
    assert_eq!(from_beam.dense.dims(), from_greedy.dense.dims());
    Ok(())
}
