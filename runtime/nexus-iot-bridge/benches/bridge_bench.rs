use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nexus_iot_bridge::callback::{invoke_callback, next_tick};
use nexus_iot_bridge::{buffer, JsFunction, JsValue, PollMode, Runtime, RuntimeConfig};

fn callback_benchmark(c: &mut Criterion) {
    let rt = Runtime::new(RuntimeConfig::default().with_thread_pool_size(1)).unwrap();
    let mut group = c.benchmark_group("callback");

    let noop = JsFunction::new("noop", |_, _, _| Ok(JsValue::Undefined));
    group.bench_function("invoke", |b| {
        b.iter(|| invoke_callback(&rt, &noop, &JsValue::Undefined, &[]))
    });

    for ticks in [1usize, 16, 256] {
        group.bench_with_input(BenchmarkId::new("next_tick_drain", ticks), &ticks, |b, &ticks| {
            let scheduler = JsFunction::new("schedule", move |rt, _, _| {
                for _ in 0..ticks {
                    next_tick(rt, JsFunction::new("tick", |_, _, _| Ok(JsValue::Undefined)));
                }
                Ok(JsValue::Undefined)
            });
            b.iter(|| invoke_callback(&rt, &scheduler, &JsValue::Undefined, &[]))
        });
    }
    group.finish();

    c.bench_function("run_once_idle", |b| b.iter(|| rt.run_once(PollMode::NoWait)));
}

fn buffer_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_copy");

    for size in [64usize, 4096, 65536] {
        let src = vec![0xabu8; size];
        let mut dst = vec![0u8; size];
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| buffer::copy(black_box(&mut dst), black_box(&src), 0, size, 0))
        });
    }
    group.finish();
}

criterion_group!(benches, callback_benchmark, buffer_benchmark);
criterion_main!(benches);
