use candle_core::{DType, Device, Tensor};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use layers::{
    base::{build_layer, LayerDef},
    linear::Linear,
    mlp::FeedForward,
    quantization::QuantizedLinear,
    weights::WeightInit,
};

fn bench_init(c: &mut Criterion) {
    let shapes = &[(256usize, 256usize), (1024, 1024), (1024, 4096)];
    let inits = &[
        ("xavier", WeightInit::default()),
        ("gaussian_sqrt_fan_in", WeightInit::gaussian_sqrt_fan_in(1.0)),
        ("truncated_gaussian", WeightInit::truncated_gaussian(0.02)),
    ];

    for (label, init) in inits {
        let mut group = c.benchmark_group(format!("init/{label}"));
        for &(input_dims, output_dims) in shapes {
            let config = Linear::config()
                .and_then(|c| Ok(c.with("input_dims", input_dims)?))
                .and_then(|c| Ok(c.with("output_dims", output_dims)?))
                .and_then(|c| Ok(c.with("params_init", init.to_value())?))
                .expect("linear config");
            let layer = build_layer(&config).expect("linear layer");
            group.throughput(Throughput::Elements((input_dims * output_dims) as u64));
            group.bench_with_input(
                BenchmarkId::from_parameter(format!("{input_dims}x{output_dims}")),
                &layer,
                |b, layer| {
                    b.iter(|| black_box(layer.init(black_box(7)).expect("init")));
                },
            );
        }
        group.finish();
    }
}

fn bench_forward(c: &mut Criterion) {
    let device = Device::Cpu;
    let batch = 4usize;
    let seq = 16usize;
    let mut group = c.benchmark_group("forward");
    for &dims in &[256usize, 1024] {
        let input = Tensor::randn(0f32, 1.0, (batch, seq, dims), &device)
            .expect("input")
            .to_dtype(DType::F32)
            .expect("cast input");
        group.throughput(Throughput::Elements((batch * seq * dims * dims) as u64));

        let ffn = FeedForward::config()
            .and_then(|c| Ok(c.with("input_dims", dims)?))
            .and_then(|c| Ok(c.with("output_dims", dims)?))
            .and_then(|c| Ok(c.with("activation", "gelu")?))
            .and_then(|c| build_layer(&c))
            .expect("ffn layer");
        let ffn_vars = ffn.init(0).expect("ffn init");
        group.bench_with_input(BenchmarkId::new("ffn", dims), &input, |b, input| {
            b.iter(|| {
                let (out, _) = ffn
                    .apply(&ffn_vars, &[], |l| FeedForward::forward(l, black_box(input)))
                    .expect("forward");
                black_box(out);
            });
        });

        let quantized = QuantizedLinear::config()
            .and_then(|c| Ok(c.with("input_dims", dims)?))
            .and_then(|c| Ok(c.with("output_dims", dims)?))
            .and_then(|c| build_layer(&c))
            .expect("quantized layer");
        let quantized_vars = quantized.init(0).expect("quantized init");
        group.bench_with_input(BenchmarkId::new("quantized_linear", dims), &input, |b, input| {
            b.iter(|| {
                let (out, _) = quantized
                    .apply(&quantized_vars, &[], |l| {
                        QuantizedLinear::forward(l, black_box(input))
                    })
                    .expect("forward");
                black_box(out);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_init, bench_forward);
criterion_main!(benches);
