//! Throughput benchmarks for the fixed-point DSP kernels.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use awl_dsp::adpcm::{self, AdpcmState};
use awl_dsp::fir::{FirDecimator, FirInterpolator, FirSampleFormat};

static FLAT_TAPS_24: [i32; 24] = [89_478_485; 24];

fn bench_adpcm(c: &mut Criterion) {
    let samples: Vec<i32> = (0..480).map(|i| ((i * 257) % 32_768) - 16_384).collect();

    c.bench_function("adpcm_encode_480", |b| {
        b.iter(|| {
            let mut state = AdpcmState::new();
            for &s in &samples {
                black_box(adpcm::encode(&mut state, black_box(s)));
            }
        })
    });

    c.bench_function("adpcm_decode_480", |b| {
        let mut enc = AdpcmState::new();
        let codes: Vec<u8> = samples.iter().map(|&s| adpcm::encode(&mut enc, s)).collect();
        b.iter(|| {
            let mut state = AdpcmState::new();
            for &code in &codes {
                black_box(adpcm::decode(&mut state, black_box(code)));
            }
        })
    });
}

fn bench_fir(c: &mut Criterion) {
    let fmt = FirSampleFormat::bits16(2);
    let src: Vec<u8> = (0..240i16).flat_map(|v| (v * 17).to_le_bytes()).collect();

    c.bench_function("fir_decimate_240_by_2", |b| {
        let state = vec![0i32; 24 + 240].into_boxed_slice();
        let mut dec = FirDecimator::new(24, 2, &FLAT_TAPS_24, state, 240, fmt, fmt).unwrap();
        let mut dst = vec![0u8; 240];
        b.iter(|| dec.process(black_box(&src), &mut dst, 240, 0, 1))
    });

    c.bench_function("fir_interpolate_240_by_3", |b| {
        let state = vec![0i32; 240 + 8].into_boxed_slice();
        let mut interp = FirInterpolator::new(3, 24, &FLAT_TAPS_24, state, 240, fmt, fmt).unwrap();
        let mut dst = vec![0u8; 240 * 3 * 2];
        b.iter(|| interp.process(black_box(&src), &mut dst, 240, 0, 1))
    });
}

criterion_group!(benches, bench_adpcm, bench_fir);
criterion_main!(benches);
