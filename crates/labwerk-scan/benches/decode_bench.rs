// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Criterion benchmarks for keyboard-wedge decoding in the labwerk-scan crate.

use criterion::{Criterion, black_box, criterion_group, criterion_main};

use labwerk_scan::{HidKeyboardDecoder, LineBuffer, ScancodeDecoder};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Press/release report pairs typing a 20-character code and Enter.
fn scan_reports() -> Vec<[u8; 8]> {
    let keys: &[(u8, u8)] = &[
        (0x02, 0x0f), (0x02, 0x04), (0x02, 0x05), (0, 0x2d), (0, 0x1e),
        (0, 0x1f), (0, 0x20), (0, 0x21), (0, 0x22), (0, 0x23),
        (0, 0x2d), (0x02, 0x1b), (0, 0x24), (0, 0x25), (0, 0x26),
        (0, 0x27), (0, 0x1e), (0, 0x1f), (0, 0x20), (0, 0x21),
        (0, 0x28),
    ];
    keys.iter()
        .flat_map(|&(modifiers, key)| [[modifiers, 0, key, 0, 0, 0, 0, 0], [0u8; 8]])
        .collect()
}

// ---------------------------------------------------------------------------
// Benchmarks
// ---------------------------------------------------------------------------

fn bench_decode_scan(c: &mut Criterion) {
    let reports = scan_reports();
    c.bench_function("decode one scan", |b| {
        b.iter(|| {
            let mut decoder = HidKeyboardDecoder::new();
            let mut lines = LineBuffer::new();
            let mut events = Vec::new();
            for report in &reports {
                let typed = decoder.decode(black_box(report));
                events.extend(lines.extend(&typed));
            }
            black_box(events);
        });
    });
}

criterion_group!(benches, bench_decode_scan);
criterion_main!(benches);
