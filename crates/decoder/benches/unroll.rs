use std::sync::Arc;

use attention::masks::mask_from_lengths;
use attention::{CombinationConfig, CombinationStrategy, EncodedSequence, Encoder, EncoderWrapper};
use candle_core::{DType, Device, Tensor};
use candle_nn::{VarBuilder, VarMap};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use decoder::{Decoder, DecoderConfig};
use vocabulary::Vocabulary;

fn encoder(name: &str, batch: usize, time: usize, size: usize, device: &Device) -> Arc<dyn Encoder> {
    let states = Tensor::randn(0f32, 1.0, (batch, time, size), device).expect("states");
    let mask = mask_from_lengths(&vec![time; batch], time, device).expect("mask");
    let encoded = Tensor::randn(0f32, 1.0, (batch, size), device).expect("encoded");
    Arc::new(EncodedSequence::new(name, states, mask, encoded).expect("encoder"))
}

fn bench_runtime_unroll(c: &mut Criterion) {
    let device = Device::Cpu;
    let words: Vec<String> = (0..500).map(|i| format!("w{i}")).collect();
    let vocabulary = Arc::new(Vocabulary::from_sentences(&[words], 1, None));
    let batch = 16usize;
    let max_output_len = 20usize;
    let strategies = [
        ("none", None),
        ("flat", Some(CombinationStrategy::Flat)),
        ("hierarchical", Some(CombinationStrategy::Hierarchical)),
    ];

    let mut group = c.benchmark_group("decoder/runtime_unroll");
    group.throughput(Throughput::Elements((batch * max_output_len) as u64));
    for (label, strategy) in strategies {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mut config = DecoderConfig::new("decoder", max_output_len);
        config.rnn_size = Some(128);
        config.embedding_size = Some(64);

        let encoders: Vec<Arc<dyn Encoder>> = match strategy {
            Some(strategy) => {
                config.use_attention = true;
                let wrapper = EncoderWrapper::new(
                    "multi",
                    vec![
                        encoder("a", batch, 30, 96, &device),
                        encoder("b", batch, 12, 64, &device),
                    ],
                    CombinationConfig::new(strategy, 96),
                )
                .expect("wrapper");
                vec![Arc::new(wrapper)]
            }
            None => vec![encoder("src", batch, 30, 96, &device)],
        };

        let decoder =
            Decoder::new(config, vocabulary.clone(), &encoders, None, vb).expect("decoder init");
        let feed = decoder.feed::<&str>(batch, None, false).expect("feed");
        group.bench_with_input(BenchmarkId::from_parameter(label), &feed, |b, feed| {
            b.iter(|| {
                let output = decoder.runtime(black_box(feed)).expect("unroll");
                black_box(output);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_runtime_unroll);
criterion_main!(benches);
