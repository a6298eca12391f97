#![no_main]

use libfuzzer_sys::fuzz_target;
use watchboard::{DataPoint, lttb};

fuzz_target!(|data: &[u8]| {
    let Some((&first, rest)) = data.split_first() else {
        return;
    };
    let threshold = first as usize;
    let points: Vec<DataPoint> = rest
        .chunks_exact(2)
        .enumerate()
        .map(|(i, pair)| DataPoint::new(i as f64, f64::from(pair[0]) - f64::from(pair[1])))
        .collect();

    let out = lttb(&points, threshold);
    if !points.is_empty() {
        assert_eq!(out.first(), points.first());
        assert_eq!(out.last(), points.last());
    }
    if threshold >= 3 {
        assert_eq!(out.len(), points.len().min(threshold));
    }
});
