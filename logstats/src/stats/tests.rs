//! End-to-end tests for the stats pipe: literal scenarios, shard
//! invariance, budget and cancellation behavior.

use std::collections::HashMap;
use std::sync::Arc;

use crate::data::{Block, Column};
use crate::pipe::{CancelToken, CollectorPipe, PipeProcessor};
use crate::stats::StatsPipe;
use crate::StatsError;

type Row = HashMap<String, String>;

fn run_query(
    query: &str,
    blocks: &[Block],
    workers: usize,
    memory: usize,
    step_seconds: Option<f64>,
) -> (crate::Result<()>, Arc<CollectorPipe>, Arc<CancelToken>) {
    let mut pipe = StatsPipe::parse(query).unwrap();
    if let Some(s) = step_seconds {
        pipe.set_step_seconds(s);
    }
    let pipe = Arc::new(pipe);
    let sink = Arc::new(CollectorPipe::new());
    let cancel = Arc::new(CancelToken::new());
    let psp = pipe.new_pipe_processor(workers, memory, cancel.clone(), sink.clone());
    for (i, br) in blocks.iter().enumerate() {
        psp.write_block(i % workers.max(1), br);
    }
    (psp.flush(), sink, cancel)
}

fn run(query: &str, blocks: &[Block], workers: usize) -> Vec<Row> {
    let (res, sink, _) = run_query(query, blocks, workers, 1 << 30, None);
    res.unwrap();
    sink.rows()
}

fn find_row<'a>(rows: &'a [Row], key: &str, value: &str) -> &'a Row {
    rows.iter()
        .find(|r| r.get(key).map(String::as_str) == Some(value))
        .unwrap_or_else(|| panic!("no row with {key}={value} in {rows:?}"))
}

fn str_col(name: &str, values: &[&str]) -> Column {
    Column::new_str(name, values.iter().map(|s| s.to_string()).collect())
}

#[test]
fn test_scenario_sum_and_count_by_metric() {
    let br = Block::new(
        3,
        vec![
            str_col("metric", &["a", "a", "b"]),
            str_col("v", &["1", "2", "3"]),
        ],
    );
    let rows = run("stats by (metric) sum(v) as s, count() as c", &[br], 1);
    assert_eq!(rows.len(), 2);
    let a = find_row(&rows, "metric", "a");
    assert_eq!(a["s"], "3");
    assert_eq!(a["c"], "2");
    let b = find_row(&rows, "metric", "b");
    assert_eq!(b["s"], "3");
    assert_eq!(b["c"], "1");
}

#[test]
fn test_scenario_uniform_statuses() {
    let statuses = [200u64, 404, 500];
    let blocks: Vec<Block> = (0..10)
        .map(|chunk| {
            let vals: Vec<u64> = (0..100).map(|i| statuses[(chunk * 100 + i) % 3]).collect();
            Block::new(100, vec![Column::new_u64("status", vals)])
        })
        .collect();
    let rows = run("stats by (status) count() as n", &blocks, 3);
    assert_eq!(rows.len(), 3);
    let total: u64 = rows.iter().map(|r| r["n"].parse::<u64>().unwrap()).sum();
    assert_eq!(total, 1000);
}

#[test]
fn test_scenario_time_buckets() {
    let nsecs: Vec<i64> = (0..100).map(|i| i * 1_000_000_000).collect();
    let br = Block::new(100, vec![Column::new_timestamp("t", nsecs)]);
    let rows = run("stats by (t:10s) count() as n", &[br], 1);
    assert_eq!(rows.len(), 10);
    for r in &rows {
        assert_eq!(r["n"], "10");
    }
}

#[test]
fn test_scenario_empty_input() {
    let rows = run("stats count() as n", &[], 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["n"], "0");

    let rows = run("stats by (x) count() as n", &[], 1);
    assert_eq!(rows.len(), 0);
}

#[test]
fn test_scenario_signed_keys() {
    let br = Block::new(5, vec![Column::new_i64("v", vec![-3, -1, 0, 1, 3])]);
    let rows = run("stats by (v) count() as n", &[br], 1);
    assert_eq!(rows.len(), 5);
    let mut keys: Vec<String> = rows.iter().map(|r| r["v"].clone()).collect();
    keys.sort();
    let mut want = vec!["-3", "-1", "0", "1", "3"];
    want.sort_unstable();
    assert_eq!(keys, want);
    for r in &rows {
        assert_eq!(r["n"], "1");
    }
}

#[test]
fn test_scenario_filtered_averages() {
    let br = Block::new(
        3,
        vec![
            str_col("status", &["200", "500", "200"]),
            str_col("x", &["10", "4", "20"]),
        ],
    );
    let rows = run(
        "stats avg(x) if (status:=200) as a, avg(x) if (status:=500) as b",
        &[br],
        1,
    );
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["a"], "15");
    assert_eq!(rows[0]["b"], "4");
}

#[test]
fn test_shard_invariance() {
    let blocks: Vec<Block> = (0..6)
        .map(|chunk| {
            let metrics: Vec<&str> = (0..50)
                .map(|i| match (chunk + i) % 4 {
                    0 => "a",
                    1 => "b",
                    2 => "c",
                    _ => "d",
                })
                .collect();
            let vals: Vec<u64> = (0..50).map(|i| (chunk * 50 + i) as u64).collect();
            Block::new(
                50,
                vec![
                    str_col("metric", &metrics),
                    Column::new_u64("v", vals),
                ],
            )
        })
        .collect();

    let canonical = normalize(run(
        "stats by (metric) sum(v) as s, count() as c, count_uniq(v) as u, max(v) as mx",
        &blocks,
        1,
    ));
    for workers in [2, 3, 8] {
        let got = normalize(run(
            "stats by (metric) sum(v) as s, count() as c, count_uniq(v) as u, max(v) as mx",
            &blocks,
            workers,
        ));
        assert_eq!(canonical, got, "workers={workers}");
    }
}

fn normalize(mut rows: Vec<Row>) -> Vec<Vec<(String, String)>> {
    let mut out: Vec<Vec<(String, String)>> = rows
        .drain(..)
        .map(|r| {
            let mut kv: Vec<(String, String)> = r.into_iter().collect();
            kv.sort();
            kv
        })
        .collect();
    out.sort();
    out
}

#[test]
fn test_concurrent_writers() {
    let pipe = Arc::new(StatsPipe::parse("stats by (w) count() as n, sum(v) as s").unwrap());
    let sink = Arc::new(CollectorPipe::new());
    let cancel = Arc::new(CancelToken::new());
    let psp = Arc::new(pipe.new_pipe_processor(4, 1 << 30, cancel, sink.clone()));

    std::thread::scope(|scope| {
        for w in 0..4 {
            let psp = Arc::clone(&psp);
            scope.spawn(move || {
                for _ in 0..20 {
                    let br = Block::new(
                        10,
                        vec![
                            Column::new_const("w", format!("worker-{w}")),
                            Column::new_u64("v", (0..10).collect()),
                        ],
                    );
                    psp.write_block(w, &br);
                }
            });
        }
    });
    psp.flush().unwrap();

    let rows = sink.rows();
    assert_eq!(rows.len(), 4);
    for w in 0..4 {
        let r = find_row(&rows, "w", &format!("worker-{w}"));
        assert_eq!(r["n"], "200");
        assert_eq!(r["s"], "900");
    }
}

#[test]
fn test_output_column_order() {
    let br = Block::new(
        2,
        vec![
            str_col("b", &["x", "y"]),
            str_col("a", &["1", "2"]),
        ],
    );
    let (res, sink, _) = run_query(
        "stats by (b, a) count() as n, sum(a) as s",
        &[br],
        1,
        1 << 30,
        None,
    );
    res.unwrap();
    let blocks = sink.blocks();
    assert!(!blocks.is_empty());
    for br in &blocks {
        let names: Vec<&str> = br.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "n", "s"]);
    }
}

#[test]
fn test_multi_by_fields_grouping() {
    let br = Block::new(
        4,
        vec![
            str_col("a", &["x", "x", "y", "x"]),
            str_col("b", &["1", "2", "1", "1"]),
        ],
    );
    let rows = run("stats by (a, b) count() as n", &[br], 1);
    assert_eq!(rows.len(), 3);
    let mut seen: Vec<(String, String, String)> = rows
        .iter()
        .map(|r| (r["a"].clone(), r["b"].clone(), r["n"].clone()))
        .collect();
    seen.sort();
    assert_eq!(
        seen,
        vec![
            ("x".into(), "1".into(), "2".into()),
            ("x".into(), "2".into(), "1".into()),
            ("y".into(), "1".into(), "1".into()),
        ]
    );
}

#[test]
fn test_multi_by_fields_with_empty_values() {
    let br = Block::new(
        2,
        vec![str_col("a", &["", "x"]), str_col("b", &["p", ""])],
    );
    let rows = run("stats by (a, b) count() as n", &[br], 1);
    assert_eq!(rows.len(), 2);
    let r = find_row(&rows, "a", "");
    assert_eq!(r["b"], "p");
}

#[test]
fn test_by_const_column() {
    let br = Block::new(
        5,
        vec![
            Column::new_const("env", "prod"),
            Column::new_u64("v", vec![1, 2, 3, 4, 5]),
        ],
    );
    let rows = run("stats by (env) sum(v) as s", &[br], 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["env"], "prod");
    assert_eq!(rows[0]["s"], "15");
}

#[test]
fn test_by_dict_column() {
    let br = Block::new(
        4,
        vec![Column::new_dict(
            "level",
            vec!["info".into(), "error".into()],
            vec![0, 1, 1, 0],
        )],
    );
    let rows = run("stats by (level) count() as n", &[br], 1);
    assert_eq!(rows.len(), 2);
    assert_eq!(find_row(&rows, "level", "info")["n"], "2");
    assert_eq!(find_row(&rows, "level", "error")["n"], "2");
}

#[test]
fn test_numeric_bucket_grouping() {
    let vals: Vec<u64> = (0..40).collect();
    let br = Block::new(40, vec![Column::new_u64("v", vals)]);
    let rows = run("stats by (v:10) count() as n", &[br], 1);
    assert_eq!(rows.len(), 4);
    for key in ["0", "10", "20", "30"] {
        assert_eq!(find_row(&rows, "v", key)["n"], "10");
    }
}

#[test]
fn test_bucket_offset_grouping() {
    let br = Block::new(4, vec![Column::new_u64("v", vec![4, 5, 14, 15])]);
    let rows = run("stats by (v:10 offset 5) count() as n", &[br], 1);
    assert_eq!(rows.len(), 3);
    assert_eq!(find_row(&rows, "v", "-5")["n"], "1");
    assert_eq!(find_row(&rows, "v", "5")["n"], "2");
    assert_eq!(find_row(&rows, "v", "15")["n"], "1");
}

#[test]
fn test_ipv4_mask_grouping() {
    let br = Block::new(
        3,
        vec![str_col("ip", &["10.0.0.5", "10.0.0.200", "10.0.1.5"])],
    );
    let rows = run("stats by (ip:/24) count() as n", &[br], 1);
    assert_eq!(rows.len(), 2);
    assert_eq!(find_row(&rows, "ip", "10.0.0.0")["n"], "2");
    assert_eq!(find_row(&rows, "ip", "10.0.1.0")["n"], "1");
}

#[test]
fn test_uniq_and_values_functions() {
    let br = Block::new(
        4,
        vec![str_col("x", &["b", "a", "b", ""])],
    );
    let rows = run(
        "stats uniq_values(x) as u, values(x) as v, count_uniq(x) as cu, count_uniq_hash(x) as ch",
        &[br],
        1,
    );
    assert_eq!(rows[0]["u"], r#"["a","b"]"#);
    assert_eq!(rows[0]["v"], r#"["b","a","b",""]"#);
    assert_eq!(rows[0]["cu"], "2");
    assert_eq!(rows[0]["ch"], "2");
}

#[test]
fn test_quantile_and_median_functions() {
    let br = Block::new(5, vec![Column::new_u64("x", vec![1, 2, 3, 4, 5])]);
    let rows = run(
        "stats median(x) as med, quantile(0, x) as q0, quantile(1, x) as q1",
        &[br],
        1,
    );
    assert_eq!(rows[0]["med"], "3");
    assert_eq!(rows[0]["q0"], "1");
    assert_eq!(rows[0]["q1"], "5");
}

#[test]
fn test_row_min_max_functions() {
    let br = Block::new(
        3,
        vec![
            str_col("host", &["a", "b", "c"]),
            Column::new_u64("lat", vec![30, 10, 20]),
        ],
    );
    let rows = run("stats row_min(lat) as lo, row_max(lat) as hi", &[br], 1);
    assert_eq!(rows[0]["lo"], r#"{"host":"b","lat":"10"}"#);
    assert_eq!(rows[0]["hi"], r#"{"host":"a","lat":"30"}"#);
}

#[test]
fn test_rate_with_step() {
    let br = Block::new(
        30,
        vec![
            Column::new_const("m", "x"),
            Column::new_u64("v", vec![10; 30]),
        ],
    );
    let (res, sink, _) = run_query(
        "stats rate() as r, rate_sum(v) as rs",
        &[br],
        1,
        1 << 30,
        Some(10.0),
    );
    res.unwrap();
    let rows = sink.rows();
    assert_eq!(rows[0]["r"], "3");
    assert_eq!(rows[0]["rs"], "30");
}

#[test]
fn test_count_empty_function() {
    let br = Block::new(
        3,
        vec![str_col("x", &["", "a", ""])],
    );
    let rows = run("stats count_empty(x) as n", &[br], 1);
    assert_eq!(rows[0]["n"], "2");
}

#[test]
fn test_default_result_names() {
    let br = Block::new(1, vec![Column::new_u64("v", vec![1])]);
    let (res, sink, _) = run_query("stats count(*)", &[br], 1, 1 << 30, None);
    res.unwrap();
    let blocks = sink.blocks();
    assert_eq!(blocks[0].columns()[0].name, "count(*)");
}

#[test]
fn test_iff_with_grouping() {
    let br = Block::new(
        4,
        vec![
            str_col("m", &["a", "a", "b", "b"]),
            str_col("ok", &["1", "0", "1", "1"]),
        ],
    );
    let rows = run(
        "stats by (m) count() as n, count() if (ok:=1) as good",
        &[br],
        1,
    );
    let a = find_row(&rows, "m", "a");
    assert_eq!(a["n"], "2");
    assert_eq!(a["good"], "1");
    let b = find_row(&rows, "m", "b");
    assert_eq!(b["n"], "2");
    assert_eq!(b["good"], "2");
}

#[test]
fn test_budget_error_and_no_partial_output() {
    // Enough unique groups to blow through a ~0.2MB global budget in
    // 1MB chunks, spread over many blocks so the shard re-checks its
    // local budget between blocks.
    let blocks: Vec<Block> = (0..40)
        .map(|chunk| {
            let vals: Vec<String> = (0..2000)
                .map(|i| format!("group-{}-{}", chunk, i))
                .collect();
            Block::new(2000, vec![Column::new_str("g", vals)])
        })
        .collect();
    let (res, sink, cancel) = run_query(
        "stats by (g) count() as n",
        &blocks,
        1,
        4 << 20,
        None,
    );
    match res {
        Err(StatsError::StateSizeBudgetExceeded { pipe, limit_mb }) => {
            assert_eq!(pipe, "stats by (g) count(*) as n");
            assert!(limit_mb <= 1);
        }
        other => panic!("want budget error, got {other:?}"),
    }
    assert!(cancel.is_cancelled());
    assert!(sink.rows().is_empty());
}

#[test]
fn test_cancellation_before_flush() {
    let br = Block::new(2, vec![Column::new_u64("v", vec![1, 2])]);
    let pipe = Arc::new(StatsPipe::parse("stats by (v) count() as n").unwrap());
    let sink = Arc::new(CollectorPipe::new());
    let cancel = Arc::new(CancelToken::new());
    let psp = pipe.new_pipe_processor(1, 1 << 30, cancel.clone(), sink.clone());
    psp.write_block(0, &br);
    cancel.cancel();
    psp.flush().unwrap();
    assert!(sink.rows().is_empty());
}

#[test]
fn test_cancellation_stops_ingestion() {
    let br = Block::new(2, vec![Column::new_u64("v", vec![1, 2])]);
    let pipe = Arc::new(StatsPipe::parse("stats count() as n").unwrap());
    let sink = Arc::new(CollectorPipe::new());
    let cancel = Arc::new(CancelToken::new());
    let psp = pipe.new_pipe_processor(1, 1 << 30, cancel.clone(), sink.clone());
    psp.write_block(0, &br);
    cancel.cancel();
    psp.write_block(0, &br);
    // Cancelled flush emits nothing at all.
    psp.flush().unwrap();
    assert!(sink.rows().is_empty());
}

#[test]
fn test_merge_associativity_split_stream() {
    // Any split of the row stream across shards must finalize to the
    // same values as the unsplit stream.
    let a = Block::new(3, vec![Column::new_u64("v", vec![1, 5, 9])]);
    let b = Block::new(2, vec![Column::new_u64("v", vec![3, 7])]);
    let q = "stats avg(v) as a, min(v) as mn, max(v) as mx, count_uniq(v) as u";

    let merged = run(q, &[a.clone(), b.clone()], 2);
    let single = {
        let all = Block::new(5, vec![Column::new_u64("v", vec![1, 5, 9, 3, 7])]);
        run(q, &[all], 1)
    };
    assert_eq!(normalize(merged), normalize(single));
}

#[test]
fn test_msg_field_canonicalization() {
    let br = Block::new(2, vec![str_col("_msg", &["x", "x"])]);
    let pipe = StatsPipe::parse(r#"stats by ("") count() as n"#).unwrap();
    assert_eq!(pipe.by_fields[0].name, "_msg");
    let rows = run(r#"stats by ("") count() as n"#, &[br], 1);
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0]["_msg"], "x");
}

#[test]
fn test_parse_errors() {
    for q in [
        "count() as n",
        "stats",
        "stats bogus_func() as n",
        "stats by (x:bogus) count() as n",
        "stats count() as n, sum(v) as n",
        "stats by (x) count() as x",
        "stats count() as n extra",
        "stats quantile(1.5, x) as q",
        "stats row_min() as r",
        "stats rate(x) as r",
        "stats count() as n | sort",
    ] {
        assert!(StatsPipe::parse(q).is_err(), "expected parse error: {q}");
    }
}

#[test]
fn test_display_roundtrip() {
    let q = r#"stats by (a:10 offset 5, b:1h, ip:/24) count(*) as n, avg(x) if (s:=1) as a, quantile(0.95, lat) as p95"#;
    let pipe = StatsPipe::parse(q).unwrap();
    let shown = pipe.to_string();
    let reparsed = StatsPipe::parse(&shown).unwrap();
    assert_eq!(pipe, reparsed);
}

#[test]
fn test_needed_fields() {
    let pipe =
        StatsPipe::parse("stats by (m) sum(v) as s, count() if (ok:=1) as n, rate() as r").unwrap();
    let fields = pipe.needed_fields();
    assert_eq!(fields, vec!["m".to_string(), "ok".to_string(), "v".to_string()]);

    let pipe = StatsPipe::parse("stats row_min(lat) as lo").unwrap();
    let fields = pipe.needed_fields();
    assert_eq!(fields, vec!["*".to_string(), "lat".to_string()]);
}

#[test]
fn test_large_output_chunking() {
    // Values big enough to cross the 64 000-byte writer threshold, so the
    // output arrives as several blocks on the same worker id.
    let vals: Vec<String> = (0..2000).map(|i| format!("group-{i:04}-{}", "x".repeat(64))).collect();
    let br = Block::new(2000, vec![Column::new_str("g", vals)]);
    let (res, sink, _) = run_query("stats by (g) count() as n", &[br], 1, 1 << 30, None);
    res.unwrap();
    let rows = sink.rows();
    assert_eq!(rows.len(), 2000);
    assert!(sink.blocks().len() > 1);
    for br in sink.blocks() {
        assert!(br.row_count() > 0);
    }
}
