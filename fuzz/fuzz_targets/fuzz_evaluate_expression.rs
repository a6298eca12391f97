#![no_main]

use libfuzzer_sys::fuzz_target;
use watchboard::{ExprCache, FixedClock, HistoryPoint, TransformContext};

fuzz_target!(|data: &[u8]| {
    let Ok(source) = std::str::from_utf8(data) else {
        return;
    };
    let ctx = TransformContext::new(
        1.5,
        vec![HistoryPoint::new(0, 1.0), HistoryPoint::new(1_000, 2.0)],
    )
    .with_named_value("memory_used", 50.0)
    .with_named_history("cpu", vec![HistoryPoint::new(500, 3.0)]);

    let out = ExprCache::new().evaluate(source, &ctx, &FixedClock(2_000));
    assert!(out.is_finite(), "{source:?} produced {out}");
});
