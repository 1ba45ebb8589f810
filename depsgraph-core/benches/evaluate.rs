//! Benchmarks for graph construction and evaluation.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use depsgraph_core::{
    build_graph, operation, BuildMode, Depsgraph, DepsgraphConfig, Entity, Link, NoopBinder,
    OperationCode, OperationFn, OperationKey, PropertyScope, Scene,
};

/// Parent chains of `depth` objects, each with a modifier reading its parent.
fn rig_scene(chains: usize, depth: usize) -> Scene {
    let mut scene = Scene::new();
    for chain in 0..chains {
        let mut parent = None;
        for level in 0..depth {
            let mut entity = Entity::object(format!("Bone.{chain}.{level}")).with_property("offset", 1.0);
            if let Some(parent) = parent {
                entity = entity
                    .with_parent(parent)
                    .with_modifier("Deform", vec![Link::transform(parent)]);
            }
            parent = Some(scene.add(entity));
        }
    }
    scene
}

fn transform_binder(key: &OperationKey) -> Option<OperationFn> {
    (key.code == OperationCode::TransformFinal).then(|| {
        operation(|ctx| {
            let offset = ctx.read_float(ctx.entity(), "offset")?;
            ctx.set("world", offset);
            Ok(())
        })
    })
}

fn bench_build(c: &mut Criterion) {
    let scene = rig_scene(20, 25);
    let config = DepsgraphConfig::default();

    c.bench_function("build_500_objects", |b| {
        b.iter(|| black_box(build_graph(&scene, &BuildMode::AllObjects, &NoopBinder, &config)))
    });
}

fn bench_full_evaluation(c: &mut Criterion) {
    let graph = Depsgraph::build(rig_scene(20, 25).into_shared(), BuildMode::AllObjects, transform_binder);

    c.bench_function("evaluate_500_objects", |b| {
        b.iter(|| {
            graph.tag_full_rebuild();
            black_box(graph.evaluate(1))
        })
    });
}

fn bench_single_edit(c: &mut Criterion) {
    let scene = rig_scene(20, 25);
    let root = scene.find("Bone.0.0");
    let graph = Depsgraph::build(scene.into_shared(), BuildMode::AllObjects, transform_binder);
    graph.evaluate(1);

    c.bench_function("evaluate_after_root_edit", |b| {
        b.iter(|| {
            if let Some(root) = root {
                graph.tag(root, PropertyScope::Transform);
            }
            black_box(graph.evaluate(1))
        })
    });
}

criterion_group!(benches, bench_build, bench_full_evaluation, bench_single_edit);
criterion_main!(benches);
