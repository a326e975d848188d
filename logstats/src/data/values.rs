//! Value parsing and canonical formatting helpers
//!
//! Group keys and stats inputs travel as strings; these helpers decide
//! which typed sub-map a key belongs to and render typed column values
//! back into their canonical string form.

use chrono::{DateTime, SecondsFormat, Utc};

pub const NSECS_PER_MICROSECOND: i64 = 1_000;
pub const NSECS_PER_MILLISECOND: i64 = 1_000_000;
pub const NSECS_PER_SECOND: i64 = 1_000_000_000;
pub const NSECS_PER_MINUTE: i64 = 60 * NSECS_PER_SECOND;
pub const NSECS_PER_HOUR: i64 = 60 * NSECS_PER_MINUTE;
pub const NSECS_PER_DAY: i64 = 24 * NSECS_PER_HOUR;
pub const NSECS_PER_WEEK: i64 = 7 * NSECS_PER_DAY;

/// Parse `s` as a canonically formatted non-negative decimal integer.
///
/// Only the exact output of [`format_u64`] is accepted ("7" yes, "007" no),
/// so routing a value through the u64 group sub-map and formatting it back
/// is lossless.
pub fn parse_canonical_u64(s: &str) -> Option<u64> {
    let b = s.as_bytes();
    if b.is_empty() || b.len() > 20 {
        return None;
    }
    if b.len() > 1 && b[0] == b'0' {
        return None;
    }
    if !b.iter().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse::<u64>().ok()
}

/// Parse `s` as a canonically formatted negative decimal integer.
pub fn parse_canonical_neg_i64(s: &str) -> Option<i64> {
    let b = s.as_bytes();
    if b.len() < 2 || b[0] != b'-' {
        return None;
    }
    let digits = &b[1..];
    // "-0" and "-07" are not canonical renderings of any i64.
    if digits[0] == b'0' || !digits.iter().all(|c| c.is_ascii_digit()) {
        return None;
    }
    s.parse::<i64>().ok().filter(|v| *v < 0)
}

pub fn try_parse_f64(s: &str) -> Option<f64> {
    if s.is_empty() {
        return None;
    }
    s.parse::<f64>().ok().filter(|f| f.is_finite())
}

/// Parse a duration such as `1.5s`, `300ms` or `1h30m` into nanoseconds.
///
/// Units: `w`, `d`, `h`, `m`, `s`, `ms`, `us`, `µs`, `ns`. Segments may be
/// concatenated; at least one unit suffix is required, so plain numbers are
/// rejected here and handled by the numeric parse paths.
pub fn try_parse_duration(s: &str) -> Option<i64> {
    let mut rest = s;
    let mut total = 0f64;
    let mut segments = 0;
    while !rest.is_empty() {
        let num_len = rest
            .find(|c: char| !c.is_ascii_digit() && c != '.')
            .unwrap_or(rest.len());
        if num_len == 0 {
            return None;
        }
        let num: f64 = rest[..num_len].parse().ok()?;
        rest = &rest[num_len..];
        let (unit_nsecs, unit_len) = match_duration_unit(rest)?;
        rest = &rest[unit_len..];
        total += num * unit_nsecs as f64;
        segments += 1;
    }
    if segments == 0 || !total.is_finite() {
        return None;
    }
    Some(total as i64)
}

fn match_duration_unit(s: &str) -> Option<(i64, usize)> {
    // Longest-match first so "ms" does not lex as "m" + garbage.
    for (unit, nsecs) in [
        ("ms", NSECS_PER_MILLISECOND),
        ("us", NSECS_PER_MICROSECOND),
        ("µs", NSECS_PER_MICROSECOND),
        ("ns", 1),
        ("w", NSECS_PER_WEEK),
        ("d", NSECS_PER_DAY),
        ("h", NSECS_PER_HOUR),
        ("m", NSECS_PER_MINUTE),
        ("s", NSECS_PER_SECOND),
    ] {
        if s.starts_with(unit) {
            return Some((nsecs, unit.len()));
        }
    }
    None
}

/// Parse a byte size such as `1.5KiB` or `2MB` into bytes.
pub fn try_parse_bytes(s: &str) -> Option<i64> {
    let num_len = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    if num_len == 0 || num_len == s.len() {
        return None;
    }
    let num: f64 = s[..num_len].parse().ok()?;
    let mult = match s[num_len..].to_ascii_lowercase().as_str() {
        "b" => 1i64,
        "kb" => 1_000,
        "mb" => 1_000_000,
        "gb" => 1_000_000_000,
        "tb" => 1_000_000_000_000,
        "kib" => 1 << 10,
        "mib" => 1 << 20,
        "gib" => 1 << 30,
        "tib" => 1i64 << 40,
        _ => return None,
    };
    let v = num * mult as f64;
    v.is_finite().then_some(v as i64)
}

pub fn try_parse_ipv4(s: &str) -> Option<u32> {
    let mut octets = [0u32; 4];
    let mut n = 0;
    for part in s.split('.') {
        if n == 4 || part.is_empty() || part.len() > 3 {
            return None;
        }
        if !part.bytes().all(|c| c.is_ascii_digit()) {
            return None;
        }
        let v: u32 = part.parse().ok()?;
        if v > 255 {
            return None;
        }
        octets[n] = v;
        n += 1;
    }
    if n != 4 {
        return None;
    }
    Some((octets[0] << 24) | (octets[1] << 16) | (octets[2] << 8) | octets[3])
}

/// Parse an IPv4 mask such as `/24` into the number of addresses it spans.
pub fn try_parse_ipv4_mask(s: &str) -> Option<u64> {
    let bits: u32 = s.strip_prefix('/')?.parse().ok()?;
    if bits > 32 {
        return None;
    }
    Some(1u64 << (32 - bits))
}

pub fn format_ipv4(ip: u32) -> String {
    format!(
        "{}.{}.{}.{}",
        (ip >> 24) & 0xff,
        (ip >> 16) & 0xff,
        (ip >> 8) & 0xff,
        ip & 0xff
    )
}

/// Canonical float rendering; integral values print without a fraction.
pub fn format_f64(v: f64) -> String {
    format!("{v}")
}

pub fn format_u64(v: u64) -> String {
    format!("{v}")
}

pub fn format_i64(v: i64) -> String {
    format!("{v}")
}

pub fn format_timestamp(nsecs: i64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(nsecs).to_rfc3339_opts(SecondsFormat::AutoSi, true)
}

pub fn try_parse_timestamp(s: &str) -> Option<i64> {
    let dt = DateTime::parse_from_rfc3339(s).ok()?;
    dt.timestamp_nanos_opt()
}

/// Append `b` to `dst` prefixed with its varint-encoded length.
pub fn marshal_bytes(dst: &mut Vec<u8>, b: &[u8]) {
    marshal_varint(dst, b.len() as u64);
    dst.extend_from_slice(b);
}

/// Decode one length-prefixed chunk from `src`; returns the chunk and the
/// total number of bytes consumed.
pub fn unmarshal_bytes(src: &[u8]) -> Option<(&[u8], usize)> {
    let (len, n) = unmarshal_varint(src)?;
    let len = len as usize;
    if src.len() < n + len {
        return None;
    }
    Some((&src[n..n + len], n + len))
}

fn marshal_varint(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

fn unmarshal_varint(src: &[u8]) -> Option<(u64, usize)> {
    let mut v = 0u64;
    for (i, &b) in src.iter().enumerate() {
        if i == 10 {
            return None;
        }
        v |= u64::from(b & 0x7f) << (7 * i);
        if b < 0x80 {
            return Some((v, i + 1));
        }
    }
    None
}
