#![allow(unused)]
extern crate nomad;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use nomad::{
    analysis::{ModuleSet, ReferenceDiscoverer},
    ir::{CodeModule, ExecutionMode, FieldDef, MethodBuilder, TypeDef, TypeRef, Value, INT32},
    rewrite::ModuleProcessor,
};
use std::hint::black_box;

/// A type whose `Step0` calls `Step1`, ..., `Step{depth-1}`, each step reading and
/// writing its own field. Every `nomadic`-th step is marked nomadic.
fn chain_module(depth: usize, nomadic: usize) -> CodeModule {
    let owner = TypeRef::local("Bench.Chain");
    let mut type_def = TypeDef::new("Bench", "Chain").with_default_constructor();

    for step in 0..depth {
        let field = format!("f{step}");
        type_def = type_def.with_field(FieldDef::new(&field, INT32).with_initial(Value::I32(0)));

        let owner = owner.clone();
        let next = (step + 1 < depth).then(|| format!("Step{}", step + 1));
        let mut builder = MethodBuilder::new(&format!("Step{step}")).implementation(move |asm| {
            asm.ldthis()
                .ldthis()
                .ldfld(&owner, &field)
                .constant(Value::I32(1))
                .add()
                .stfld(&owner, &field);
            if let Some(next) = &next {
                asm.ldthis().call(&owner, next, &[]);
            }
            asm.ret();
        });
        if step % nomadic == 0 {
            builder = builder.nomadic(ExecutionMode::Normal);
        }
        type_def = type_def.with_method(builder.build().expect("bench method assembles"));
    }

    CodeModule::new("Bench.nmod").with_type(type_def)
}

/// Closure computation over call chains of growing depth.
fn bench_discovery(c: &mut Criterion) {
    let mut group = c.benchmark_group("discovery");
    for depth in [16usize, 128, 512] {
        let module = chain_module(depth, depth);
        let method = module
            .type_def("Bench.Chain")
            .and_then(|t| t.method("Step0", &[]))
            .expect("entry method exists")
            .clone();

        group.throughput(Throughput::Elements(depth as u64));
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            let discoverer = ReferenceDiscoverer::new(ModuleSet::new(&module));
            b.iter(|| {
                let members = discoverer.discover("Bench.Chain", black_box(&method)).unwrap();
                black_box(members)
            });
        });
    }
    group.finish();
}

/// Full module processing: parallel discovery, rewriting and the server copy.
fn bench_process(c: &mut Criterion) {
    let module = chain_module(256, 8);
    let processor = ModuleProcessor::new();

    c.bench_function("process_chain_256", |b| {
        b.iter(|| {
            let processed = processor.process(black_box(&module), &[]).unwrap();
            black_box(processed)
        });
    });
}

criterion_group!(benches, bench_discovery, bench_process);
criterion_main!(benches);
