// packages/engine/benches/recording_bench.rs
use calltrace_engine::index::InMemoryIndex;
use calltrace_engine::model::TypeTrait;
use calltrace_engine::objects::Value;
use calltrace_engine::reader::MemoryPayloadStore;
use calltrace_engine::recording::{CallOutcome, MemorySink, Recorder, RecorderConfig};
use calltrace_engine::tree::TreeAssembler;
use calltrace_engine::wire::frames;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

fn recorder() -> (Arc<Recorder>, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let config = RecorderConfig {
        capture_stack_traces: false,
        ..Default::default()
    };
    let recorder = Recorder::new(config, sink.clone()).unwrap();
    (recorder, sink)
}

/// One root with `calls` leaf children
fn record(recorder: &Arc<Recorder>, calls: u64) {
    let ty = recorder.register_type("bench.Worker", [TypeTrait::ConcreteClass], []);
    let root = recorder.register_method("run", &ty, false, false, false);
    let leaf = recorder.register_method("step", &ty, false, false, true);
    let session = recorder.attach_thread("bench");

    let root_call = session.on_method_enter(root.id, None, &[]).call_id().unwrap();
    for i in 0..calls {
        let args = [Value::Int(i as i64), Value::from("arg")];
        if let Some(call) = session.on_method_enter(leaf.id, None, &args).call_id() {
            session.on_method_exit(call, CallOutcome::Returned(&Value::Int(1)));
        }
    }
    session.on_method_exit(root_call, CallOutcome::Returned(&Value::Null));
}

fn bench_record_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("record_calls");
    for calls in [100u64, 10_000] {
        group.throughput(Throughput::Elements(calls));
        group.bench_with_input(BenchmarkId::from_parameter(calls), &calls, |b, &calls| {
            b.iter(|| {
                let (recorder, sink) = recorder();
                record(&recorder, black_box(calls));
                black_box(sink.len())
            });
        });
    }
    group.finish();
}

fn bench_assemble_tree(c: &mut Criterion) {
    let (recorder, sink) = recorder();
    record(&recorder, 10_000);
    let bytes = sink.contents();

    c.bench_function("assemble_10k_calls", |b| {
        b.iter(|| {
            let store = Arc::new(MemoryPayloadStore::new());
            store.append(&bytes);
            let assembler = TreeAssembler::new(Arc::new(InMemoryIndex::new()), store);
            for frame in frames(&bytes) {
                assembler.apply_frame(&frame.unwrap()).unwrap();
            }
            black_box(assembler.recordings().len())
        });
    });
}

criterion_group!(benches, bench_record_calls, bench_assemble_tree);
criterion_main!(benches);
