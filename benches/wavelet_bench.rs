use criterion::{black_box, criterion_group, criterion_main, Criterion};

use focus_stack::image::Image;
use focus_stack::tasks::wavelet::{forward, inverse};

fn checkerboard(width: u32, height: u32) -> focus_stack::image::GrayF32Image {
    let mut img: focus_stack::image::GrayF32Image = Image::new_filled(width, height, 0.0, 0);
    for y in 0..height {
        for x in 0..width {
            *img.at_mut(x, y) = ((x ^ y) & 0xff) as f32;
        }
    }
    img
}

fn wavelet_roundtrip(c: &mut Criterion) {
    let mut group = c.benchmark_group("wavelet");
    for &(dim, levels) in &[(256u32, 5u32), (1024u32, 7u32)] {
        let gray = checkerboard(dim, dim);
        group.bench_function(format!("forward_{dim}x{dim}_L{levels}"), |b| {
            b.iter(|| forward(black_box(&gray), levels))
        });

        let wav = forward(&gray, levels);
        group.bench_function(format!("inverse_{dim}x{dim}_L{levels}"), |b| {
            b.iter(|| inverse(black_box(&wav), levels))
        });
    }
    group.finish();
}

criterion_group!(benches, wavelet_roundtrip);
criterion_main!(benches);
