//! Indexing benchmarks over a synthetic recording.
//! Run: cargo bench

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use screentape::concat_script::{self, DEFAULT_LAST_FRAME_DURATION};
use screentape::frame_log::FrameLog;
use screentape::indexer::{scan_path, TruncatedTailPolicy};

const FRAME_COUNT: usize = 1_800;
const FRAME_BYTES: usize = 48 * 1024;

fn bench_scan(c: &mut Criterion) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("bench.framelog");
    let mut log = FrameLog::create(&path).expect("create log");
    let payload = vec![0x5a_u8; FRAME_BYTES];
    for index in 0..FRAME_COUNT {
        log.append(index as f64 / 30.0, &payload).expect("append frame");
    }
    drop(log);

    let mut group = c.benchmark_group("frame_log");
    group.sample_size(30);

    group.bench_function("scan_1800_frames", |b| {
        b.iter(|| black_box(scan_path(&path, TruncatedTailPolicy::Fail).expect("scan")));
    });

    let entries = scan_path(&path, TruncatedTailPolicy::Fail).expect("scan");
    group.bench_function("concat_script_1800_frames", |b| {
        b.iter(|| {
            let script = concat_script::generate(&entries, &path, DEFAULT_LAST_FRAME_DURATION)
                .expect("generate");
            black_box(script.render())
        });
    });

    group.finish();
}

criterion_group!(benches, bench_scan);
criterion_main!(benches);
