// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

use crate::error::{Result, SweepError};
use lazy_static::lazy_static;
use rand::Rng;
use regex_lite::Regex;
use serde_yaml::{Mapping, Value};
use std::time::{SystemTime, UNIX_EPOCH};

lazy_static! {
    static ref RE_SANITIZE: Regex = Regex::new(r"[^A-Za-z0-9]+").unwrap();
}

/// Convert a time spec to seconds. Accepts plain numbers (already seconds)
/// or strings with an `s`/`m`/`h` suffix: `"5s"`, `"2m"`, `"1.5h"`.
pub fn time2sec(value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => Ok(n.as_f64().unwrap_or(0.0)),
        Value::String(s) => timestr2sec(s),
        other => Err(SweepError::spec(format!(
            "Invalid time spec: {}",
            value_to_string(other)
        ))),
    }
}

pub fn timestr2sec(timestr: &str) -> Result<f64> {
    let bad = || SweepError::spec(format!("Invalid time spec: '{}'", timestr));
    let (num, mult) = match timestr.as_bytes().last().copied() {
        Some(b's') => (&timestr[..timestr.len() - 1], 1.0),
        Some(b'm') => (&timestr[..timestr.len() - 1], 60.0),
        Some(b'h') => (&timestr[..timestr.len() - 1], 3600.0),
        _ => (timestr, 1.0),
    };
    let num: f64 = num.trim().parse().map_err(|_| bad())?;
    Ok(num * mult)
}

/// Seconds rendered without a trailing `.0` for whole values, so interrupt
/// reasons read "after 2 seconds" rather than "after 2.0 seconds".
pub fn fmt_secs(secs: f64) -> String {
    if secs.fract() == 0.0 {
        format!("{}", secs as i64)
    } else {
        format!("{}", secs)
    }
}

/// Seconds since the epoch as a float, the timestamp unit of the metric
/// timeseries.
pub fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Replace every non-alphanumeric run with `-`, for log file names derived
/// from test-case values.
pub fn sanitize_fname(value: &str) -> String {
    RE_SANITIZE.replace_all(value, "-").into_owned()
}

const UPPER_ALNUM: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const LOWER_ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_chars(charset: &[u8], len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| charset[rng.gen_range(0..charset.len())] as char)
        .collect()
}

/// Heredoc end-of-file marker suffix: 16 uppercase alphanumerics.
pub fn random_marker() -> String {
    random_chars(UPPER_ALNUM, 16)
}

/// Temporary file name suffix: 24 lowercase alphanumerics.
pub fn random_suffix() -> String {
    random_chars(LOWER_ALNUM, 24)
}

/// Render a YAML scalar the way it would appear after macro substitution.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                fmt_float(n.as_f64().unwrap_or(0.0))
            }
        }
        Value::String(s) => s.clone(),
        other => serde_yaml::to_string(other)
            .map(|s| s.trim_start_matches("---").trim().to_string())
            .unwrap_or_default(),
    }
}

/// Float rendering that drops the `.0` on whole values, matching how the
/// macro engine stringifies arithmetic results.
pub fn fmt_float(v: f64) -> String {
    if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e15 {
        format!("{}", v as i64)
    } else {
        format!("{}", v)
    }
}

/// Forgiving numeric coercion for metric values: anything that does not
/// parse is `0.0`.
pub fn forgiving_f64(value: &Value) -> f64 {
    match value {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::Bool(b) => {
            if *b {
                1.0
            } else {
                0.0
            }
        }
        Value::String(s) => s.trim().parse().unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Boolean coercion used by `stream.active`: booleans pass through, strings
/// accept `1`/`yes`/`true`/`on` (case-insensitive).
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => {
            matches!(s.to_lowercase().as_str(), "1" | "yes" | "true" | "on")
        }
        _ => false,
    }
}

/// Look up a string key in a YAML mapping.
pub fn mget<'a>(map: &'a Mapping, key: &str) -> Option<&'a Value> {
    map.get(&Value::String(key.to_string()))
}

pub fn mget_str<'a>(map: &'a Mapping, key: &str) -> Option<&'a str> {
    mget(map, key).and_then(|v| v.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_specs() {
        assert_eq!(timestr2sec("5s").unwrap(), 5.0);
        assert_eq!(timestr2sec("2m").unwrap(), 120.0);
        assert_eq!(timestr2sec("1h").unwrap(), 3600.0);
        assert_eq!(timestr2sec("3").unwrap(), 3.0);
        assert_eq!(time2sec(&Value::from(3)).unwrap(), 3.0);
        assert_eq!(time2sec(&Value::from(0.5)).unwrap(), 0.5);
        assert!(timestr2sec("abc").is_err());
    }

    #[test]
    fn sanitizes_filenames() {
        assert_eq!(sanitize_fname("a b/c:d"), "a-b-c-d");
        assert_eq!(sanitize_fname("plain"), "plain");
    }

    #[test]
    fn random_markers_have_shape() {
        let m = random_marker();
        assert_eq!(m.len(), 16);
        assert!(m.bytes().all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        let s = random_suffix();
        assert_eq!(s.len(), 24);
        assert!(s.bytes().all(|b| b.is_ascii_lowercase() || b.is_ascii_digit()));
    }

    #[test]
    fn forgiving_numbers() {
        assert_eq!(forgiving_f64(&Value::from("3.14")), 3.14);
        assert_eq!(forgiving_f64(&Value::from("n/a")), 0.0);
        assert_eq!(forgiving_f64(&Value::from(7)), 7.0);
    }

    #[test]
    fn scalar_rendering() {
        assert_eq!(value_to_string(&Value::from(3)), "3");
        assert_eq!(value_to_string(&Value::from(3.5)), "3.5");
        assert_eq!(value_to_string(&Value::from("x")), "x");
        assert_eq!(fmt_float(4.0), "4");
        assert_eq!(fmt_secs(2.0), "2");
        assert_eq!(fmt_secs(2.5), "2.5");
    }
}
