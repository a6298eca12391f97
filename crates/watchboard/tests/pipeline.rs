//! End-to-end flow: raw samples → evaluated scalars → aligned series →
//! decimated chart data.

use watchboard::{FixedClock, HistoryPoint, TransformContext, TransformPipeline};

fn counter_history(n: usize) -> Vec<HistoryPoint> {
    (0..n)
        .map(|i| HistoryPoint::new(i as i64 * 1_000, i as f64))
        .collect()
}

#[test]
fn memory_ratio_expression_evaluates_to_percent() {
    let mut pipeline = TransformPipeline::with_clock(Box::new(FixedClock(0)));
    let ctx = TransformContext::default()
        .with_named_value("memory_used", 50.0)
        .with_named_value("memory_total", 200.0);

    assert_eq!(
        pipeline.evaluate("(memory_used / memory_total) * 100", &ctx),
        25.0
    );
}

#[test]
fn per_sample_evaluation_feeds_decimation() {
    let history = counter_history(300);
    let mut pipeline = TransformPipeline::with_clock(Box::new(FixedClock(299_000)));

    // One evaluation per sample, the way a refresh tick walks a series:
    // the context grows with the history seen so far.
    let mut times = Vec::with_capacity(history.len());
    let mut rates = Vec::with_capacity(history.len());
    for i in 0..history.len() {
        let point = history[i];
        let ctx = TransformContext::new(point.value, history[..=i].to_vec());
        times.push(point.timestamp as f64 / 1_000.0);
        rates.push(Some(pipeline.evaluate("rate(cpu) * 60", &ctx)));
    }
    // A steadily incrementing counter rates at 1/s once two samples exist.
    assert_eq!(rates[299], Some(60.0));

    let out = pipeline.decimate(&times, &[rates], 50);
    assert_eq!(out.times.len(), 100);
    assert_eq!(out.series.len(), 1);
    assert_eq!(out.times.first(), Some(&0.0));
    assert_eq!(out.times.last(), Some(&299.0));
    // Exact projection: every retained instant keeps its evaluated value.
    assert!(out.series[0].iter().all(Option::is_some));
}

#[test]
fn expression_cache_grows_only_per_distinct_source() {
    let mut pipeline = TransformPipeline::with_clock(Box::new(FixedClock(60_000)));
    let ctx = TransformContext::new(4.0, counter_history(10));

    for _ in 0..100 {
        pipeline.evaluate("avg(cpu) + $value", &ctx);
        pipeline.evaluate("max(cpu, '5m')", &ctx);
    }
    assert_eq!(pipeline.cached_expressions(), 2);
}

#[test]
fn hostile_expressions_degrade_to_finite_values() {
    let mut pipeline = TransformPipeline::with_clock(Box::new(FixedClock(0)));
    let ctx = TransformContext::new(3.25, counter_history(5));

    for source in ["", "))))", "rate(", "a b c d", "1/0 + 2%0", "pow(9,999)"] {
        let out = pipeline.evaluate(source, &ctx);
        assert!(out.is_finite(), "{source:?} produced {out}");
    }
}
