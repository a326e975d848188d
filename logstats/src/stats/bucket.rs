//! Bucketing of `by (field:bucket offset off)` values
//!
//! A bucket spec quantizes a field value before it becomes part of the
//! grouping key: `floor((v - offset) / size) * size + offset`. Sizes can
//! be plain numbers, durations, byte sizes, IPv4 masks or calendar words;
//! the calendar sizes `year` and `month` are non-numeric and truncate
//! timestamps instead.
//!
//! Integer inputs are bucketed with exact modular arithmetic, so applying
//! a bucket to its own output is a no-op.

use chrono::{DateTime, Datelike, TimeZone, Utc};

use crate::data::values::{
    format_f64, format_i64, format_ipv4, format_timestamp, try_parse_bytes, try_parse_duration,
    try_parse_f64, try_parse_ipv4, try_parse_ipv4_mask, try_parse_timestamp,
    NSECS_PER_DAY, NSECS_PER_HOUR, NSECS_PER_MICROSECOND, NSECS_PER_MILLISECOND,
    NSECS_PER_MINUTE, NSECS_PER_SECOND, NSECS_PER_WEEK,
};
use crate::data::{Column, ColumnData};

use super::ByField;

/// Parse a bucket size token: number, duration, byte size, IPv4 mask or a
/// numeric calendar word. `year` and `month` are handled by the caller.
pub fn try_parse_bucket_size(s: &str) -> Option<f64> {
    match s {
        "nanosecond" => return Some(1.0),
        "microsecond" => return Some(NSECS_PER_MICROSECOND as f64),
        "millisecond" => return Some(NSECS_PER_MILLISECOND as f64),
        "second" => return Some(NSECS_PER_SECOND as f64),
        "minute" => return Some(NSECS_PER_MINUTE as f64),
        "hour" => return Some(NSECS_PER_HOUR as f64),
        "day" => return Some(NSECS_PER_DAY as f64),
        "week" => return Some(NSECS_PER_WEEK as f64),
        _ => {}
    }
    if let Some(f) = try_parse_f64(s) {
        return Some(f);
    }
    if let Some(nsecs) = try_parse_duration(s) {
        return Some(nsecs as f64);
    }
    if let Some(n) = try_parse_bytes(s) {
        return Some(n as f64);
    }
    if let Some(n) = try_parse_ipv4_mask(s) {
        return Some(n as f64);
    }
    None
}

/// Parse a bucket offset token: number, duration or byte size, with an
/// optional leading `-`. Masks and calendar words are not offsets.
pub fn try_parse_bucket_offset(s: &str) -> Option<f64> {
    let (neg, s) = match s.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, s),
    };
    let v = if let Some(f) = try_parse_f64(s) {
        f
    } else if let Some(nsecs) = try_parse_duration(s) {
        nsecs as f64
    } else if let Some(n) = try_parse_bytes(s) {
        n as f64
    } else {
        return None;
    };
    Some(if neg { -v } else { v })
}

#[inline]
fn bucket_i64(v: i64, size: i64, offset: i64) -> i64 {
    let size = size.max(1);
    v.wrapping_sub(v.wrapping_sub(offset).rem_euclid(size))
}

#[inline]
fn bucket_f64(v: f64, size: f64, offset: f64) -> f64 {
    let size = if size > 0.0 { size } else { 1.0 };
    ((v - offset) / size).floor() * size + offset
}

fn int_bucket_params(bf: &ByField) -> Option<(i64, i64)> {
    let size = if bf.bucket_size > 0.0 { bf.bucket_size } else { 1.0 };
    let offset = bf.bucket_offset;
    if size.fract() != 0.0 || offset.fract() != 0.0 {
        return None;
    }
    if size > i64::MAX as f64 || offset.abs() > i64::MAX as f64 {
        return None;
    }
    Some((size as i64, offset as i64))
}

fn is_calendar_bucket(bf: &ByField) -> bool {
    bf.bucket_size_str == "year" || bf.bucket_size_str == "month"
}

fn truncate_calendar(nsecs: i64, bf: &ByField) -> i64 {
    let offset = bf.bucket_offset as i64;
    let dt = DateTime::<Utc>::from_timestamp_nanos(nsecs - offset);
    let (y, m) = (dt.year(), dt.month());
    let truncated = if bf.bucket_size_str == "year" {
        Utc.with_ymd_and_hms(y, 1, 1, 0, 0, 0).single()
    } else {
        Utc.with_ymd_and_hms(y, m, 1, 0, 0, 0).single()
    };
    match truncated.and_then(|t| t.timestamp_nanos_opt()) {
        Some(n) => n + offset,
        None => nsecs,
    }
}

/// Bucket a single string value. Values that parse as integers, floats,
/// durations, IPv4 addresses or RFC 3339 timestamps are quantized; other
/// values pass through unchanged.
pub fn bucket_value(v: &str, bf: &ByField) -> String {
    if !bf.has_bucket_config() {
        return v.to_string();
    }
    if is_calendar_bucket(bf) {
        if let Some(nsecs) = try_parse_timestamp(v) {
            return format_timestamp(truncate_calendar(nsecs, bf));
        }
        return v.to_string();
    }

    if let Ok(n) = v.parse::<i64>() {
        if let Some((size, offset)) = int_bucket_params(bf) {
            return format_i64(bucket_i64(n, size, offset));
        }
        return format_f64(bucket_f64(n as f64, bf.bucket_size, bf.bucket_offset));
    }
    if let Some(f) = try_parse_f64(v) {
        return format_f64(bucket_f64(f, bf.bucket_size, bf.bucket_offset));
    }
    if let Some(nsecs) = try_parse_duration(v) {
        if let Some((size, offset)) = int_bucket_params(bf) {
            return format_i64(bucket_i64(nsecs, size, offset));
        }
        return format_f64(bucket_f64(nsecs as f64, bf.bucket_size, bf.bucket_offset));
    }
    if let Some(ip) = try_parse_ipv4(v) {
        if let Some((size, offset)) = int_bucket_params(bf) {
            let b = bucket_i64(i64::from(ip), size, offset).clamp(0, i64::from(u32::MAX));
            return format_ipv4(b as u32);
        }
        return v.to_string();
    }
    if let Some(nsecs) = try_parse_timestamp(v) {
        if let Some((size, offset)) = int_bucket_params(bf) {
            return format_timestamp(bucket_i64(nsecs, size, offset));
        }
        return format_timestamp(bucket_f64(nsecs as f64, bf.bucket_size, bf.bucket_offset) as i64);
    }
    v.to_string()
}

/// Materialize the bucketed string form of every row of a column. Typed
/// encodings take native fast paths; strings go through [`bucket_value`]
/// with a consecutive-run cache.
pub fn bucketed_values(c: &Column, rows: usize, bf: &ByField) -> Vec<String> {
    if !bf.has_bucket_config() {
        return c.values(rows);
    }

    if is_calendar_bucket(bf) {
        if let ColumnData::Timestamp(vs) = &c.data {
            return map_runs_i64(vs, |n| format_timestamp(truncate_calendar(n, bf)));
        }
        return map_runs_str(c, rows, bf);
    }

    match &c.data {
        ColumnData::Const(v) => vec![bucket_value(v, bf); rows],
        ColumnData::Timestamp(vs) => match int_bucket_params(bf) {
            Some((size, offset)) => {
                map_runs_i64(vs, |n| format_timestamp(bucket_i64(n, size, offset)))
            }
            None => map_runs_i64(vs, |n| {
                format_timestamp(bucket_f64(n as f64, bf.bucket_size, bf.bucket_offset) as i64)
            }),
        },
        ColumnData::Uint8(vs) => bucket_ints(vs.iter().map(|&v| i64::from(v)), bf),
        ColumnData::Uint16(vs) => bucket_ints(vs.iter().map(|&v| i64::from(v)), bf),
        ColumnData::Uint32(vs) => bucket_ints(vs.iter().map(|&v| i64::from(v)), bf),
        ColumnData::Uint64(vs) => {
            if vs.iter().all(|&v| v <= i64::MAX as u64) {
                bucket_ints(vs.iter().map(|&v| v as i64), bf)
            } else {
                let mut out = Vec::with_capacity(vs.len());
                for &v in vs {
                    out.push(format_f64(bucket_f64(
                        v as f64,
                        bf.bucket_size,
                        bf.bucket_offset,
                    )));
                }
                out
            }
        }
        ColumnData::Int64(vs) => bucket_ints(vs.iter().copied(), bf),
        ColumnData::Float64(vs) => {
            let mut out = Vec::with_capacity(vs.len());
            for &v in vs {
                out.push(format_f64(bucket_f64(v, bf.bucket_size, bf.bucket_offset)));
            }
            out
        }
        ColumnData::Ipv4(vs) => match int_bucket_params(bf) {
            Some((size, offset)) => map_runs_i64(
                &vs.iter().map(|&v| i64::from(v)).collect::<Vec<_>>(),
                |n| format_ipv4(bucket_i64(n, size, offset).clamp(0, i64::from(u32::MAX)) as u32),
            ),
            None => c.values(rows),
        },
        ColumnData::Str(_) | ColumnData::Dict { .. } => map_runs_str(c, rows, bf),
    }
}

fn bucket_ints(vs: impl Iterator<Item = i64>, bf: &ByField) -> Vec<String> {
    match int_bucket_params(bf) {
        Some((size, offset)) => {
            let mut out = Vec::new();
            let mut last: Option<(i64, i64)> = None;
            for v in vs {
                let b = match last {
                    Some((lv, lb)) if lv == v => lb,
                    _ => bucket_i64(v, size, offset),
                };
                last = Some((v, b));
                out.push(format_i64(b));
            }
            out
        }
        None => vs
            .map(|v| format_f64(bucket_f64(v as f64, bf.bucket_size, bf.bucket_offset)))
            .collect(),
    }
}

fn map_runs_i64(vs: &[i64], mut f: impl FnMut(i64) -> String) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(vs.len());
    for (i, &v) in vs.iter().enumerate() {
        if i > 0 && vs[i - 1] == v {
            let prev = out[i - 1].clone();
            out.push(prev);
        } else {
            out.push(f(v));
        }
    }
    out
}

fn map_runs_str(c: &Column, rows: usize, bf: &ByField) -> Vec<String> {
    let values = c.values(rows);
    let mut out: Vec<String> = Vec::with_capacity(rows);
    for (i, v) in values.iter().enumerate() {
        if i > 0 && values[i - 1] == *v {
            let prev = out[i - 1].clone();
            out.push(prev);
        } else {
            out.push(bucket_value(v, bf));
        }
    }
    out
}
