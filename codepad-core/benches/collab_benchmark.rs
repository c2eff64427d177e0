use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use codepad_core::editor::{EditorModel, Position, TextEdit, TextModel};
use codepad_core::TextHandle;

fn bench_local_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("Text Handle");
    group.throughput(Throughput::Elements(1));

    group.bench_function("insert_at_end", |b| {
        // Grows for the whole run; measures typing at the end of a document.
        let handle = TextHandle::new();
        b.iter(|| {
            let len = handle.len();
            handle.insert(black_box(len), black_box("x"));
        })
    });

    group.finish();
}

fn bench_apply_remote(c: &mut Criterion) {
    let mut group = c.benchmark_group("Text Handle");
    group.throughput(Throughput::Elements(1));

    let source = TextHandle::new();
    source.insert(0, &"fn main() {}\n".repeat(200));
    let update = source.encode_state();

    group.bench_function("apply_full_state", |b| {
        b.iter(|| {
            let dest = TextHandle::new();
            dest.apply_update(black_box(&update)).unwrap();
            black_box(dest.len());
        })
    });

    group.finish();
}

fn bench_surface_edits(c: &mut Criterion) {
    let mut group = c.benchmark_group("Editor Model");
    group.throughput(Throughput::Elements(1));

    group.bench_function("apply_edit_line_50", |b| {
        let mut model = TextModel::with_value("let x = 1;\n".repeat(100));
        b.iter(|| {
            model.apply_edits(&[TextEdit::insert(black_box(Position::new(50, 1)), "y")]);
        })
    });

    group.finish();
}

criterion_group!(benches, bench_local_insert, bench_apply_remote, bench_surface_edits);
criterion_main!(benches);
