use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dlffi::{BindOptions, CType, NativeFunction, Value};

extern "C" fn add3(a: i32, b: i32, c: i32) -> i32 {
    a.wrapping_add(b).wrapping_add(c)
}

fn bench_invoke(c: &mut Criterion) {
    let add = NativeFunction::from_address(
        add3 as usize,
        CType::i32(),
        vec![CType::i32(), CType::i32(), CType::i32()],
    )
    .expect("bind add3");
    let args = [Value::Integer(1), Value::Integer(2), Value::Integer(3)];
    c.bench_function("invoke_add3", |b| {
        b.iter(|| black_box(add.invoke(black_box(&args)).expect("invoke")))
    });

    let strlen = NativeFunction::load(
        "",
        "strlen",
        CType::size_t(),
        vec![CType::pointer()],
        BindOptions::default(),
    )
    .expect("load strlen");
    let text = [Value::from("the quick brown fox")];
    c.bench_function("invoke_strlen_with_text_copy", |b| {
        b.iter(|| black_box(strlen.invoke(black_box(&text)).expect("invoke")))
    });

    let point = CType::make_struct([CType::u8(), CType::f64(), CType::i16()])
        .expect("struct");
    c.bench_function("struct_member_offsets", |b| {
        b.iter(|| {
            (1..=point.member_count())
                .map(|i| black_box(&point).member_offset(i))
                .sum::<usize>()
        })
    });
}

criterion_group!(benches, bench_invoke);
criterion_main!(benches);
