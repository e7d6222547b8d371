// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Aggregators reduce a metric timeseries to one or more summary columns.

use crate::error::{Result, SweepError};
use crate::metrics::Sample;
use crate::util::{forgiving_f64, mget, mget_str};
use serde_yaml::{Mapping, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BandwidthMode {
    /// The metric is a cumulative counter (10, 20, 50, 100, ...): rates
    /// come from consecutive deltas.
    Incrementing,
    /// The metric is a per-sample byte count (10, 10, 30, 50, ...).
    Partial,
    /// The metric counts operations per sample; multiplied by `opsize`.
    Operations,
}

#[derive(Debug, Clone)]
pub enum Aggregate {
    Avg(String),
    Min(String),
    Max(String),
    Sum(String),
    Count(String),
    Bandwidth { mode: BandwidthMode, opsize: f64 },
}

impl Aggregate {
    pub fn default_avg() -> Aggregate {
        Aggregate::Avg("(Avg)".to_string())
    }

    /// An `aggregate:` value is a class name, a mapping, or a list of
    /// either.
    pub fn parse_list(value: &Value) -> Result<Vec<Aggregate>> {
        match value {
            Value::String(class) => Ok(vec![Self::from_class(class, None)?]),
            Value::Mapping(map) => Ok(vec![Self::from_mapping(map)?]),
            Value::Sequence(seq) => seq
                .iter()
                .map(|v| match v {
                    Value::String(class) => Self::from_class(class, None),
                    Value::Mapping(map) => Self::from_mapping(map),
                    _ => Err(SweepError::spec("Invalid aggregate entry")),
                })
                .collect(),
            _ => Err(SweepError::spec(
                "'aggregate' must be a class name, a mapping or a list",
            )),
        }
    }

    fn from_mapping(map: &Mapping) -> Result<Aggregate> {
        let class = mget_str(map, "class")
            .ok_or_else(|| SweepError::spec("Aggregate is missing a 'class'"))?;
        Self::from_class(class, Some(map))
    }

    fn from_class(class: &str, config: Option<&Mapping>) -> Result<Aggregate> {
        let title = |default: &str| {
            config
                .and_then(|m| mget_str(m, "title"))
                .unwrap_or(default)
                .to_string()
        };
        match class {
            "avg" => Ok(Aggregate::Avg(title("(Avg)"))),
            "min" => Ok(Aggregate::Min(title("(Min)"))),
            "max" => Ok(Aggregate::Max(title("(Max)"))),
            "sum" => Ok(Aggregate::Sum(title("(Sum)"))),
            "count" => Ok(Aggregate::Count(title("(Count)"))),
            "bandwidth" => {
                let mode = match config.and_then(|m| mget_str(m, "mode")) {
                    None => BandwidthMode::Incrementing,
                    Some(m) => match m.to_lowercase().as_str() {
                        "incrementing" | "0" => BandwidthMode::Incrementing,
                        "partial" | "1" => BandwidthMode::Partial,
                        "operations" | "2" => BandwidthMode::Operations,
                        other => {
                            return Err(SweepError::spec(format!(
                                "Unknown bandwidth mode '{}'",
                                other
                            )))
                        }
                    },
                };
                let opsize = config
                    .and_then(|m| mget(m, "opsize"))
                    .map(forgiving_f64)
                    .unwrap_or(1.0);
                Ok(Aggregate::Bandwidth { mode, opsize })
            }
            other => Err(SweepError::spec(format!("Unknown aggregator '{}'", other))),
        }
    }

    pub fn titles(&self) -> Vec<String> {
        match self {
            Aggregate::Avg(t)
            | Aggregate::Min(t)
            | Aggregate::Max(t)
            | Aggregate::Sum(t)
            | Aggregate::Count(t) => vec![t.clone()],
            Aggregate::Bandwidth { .. } => vec![
                "(Average B/w)".to_string(),
                "(Min B/w)".to_string(),
                "(Max B/w)".to_string(),
            ],
        }
    }

    /// Reduce the series. `initial` and `reset_time` seed the first window
    /// of the partial bandwidth mode.
    pub fn collect(&self, series: &[Sample], initial: f64, reset_time: f64) -> Vec<Option<f64>> {
        match self {
            Aggregate::Avg(_) => {
                if series.is_empty() {
                    vec![Some(0.0)]
                } else {
                    let sum: f64 = series.iter().map(|s| s.v).sum();
                    vec![Some(sum / series.len() as f64)]
                }
            }
            Aggregate::Min(_) => vec![series
                .iter()
                .map(|s| s.v)
                .fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.min(v)))
                })],
            Aggregate::Max(_) => vec![series
                .iter()
                .map(|s| s.v)
                .fold(None, |acc: Option<f64>, v| {
                    Some(acc.map_or(v, |a| a.max(v)))
                })],
            Aggregate::Sum(_) => vec![Some(series.iter().map(|s| s.v).sum())],
            Aggregate::Count(_) => vec![Some(series.len() as f64)],
            Aggregate::Bandwidth { mode, opsize } => {
                Self::collect_bandwidth(series, *mode, *opsize, initial, reset_time)
            }
        }
    }

    fn collect_bandwidth(
        series: &[Sample],
        mode: BandwidthMode,
        opsize: f64,
        initial: f64,
        reset_time: f64,
    ) -> Vec<Option<f64>> {
        // Partial mode has a meaningful zero point; the other modes need a
        // first sample before a window exists.
        let mut last: Option<(f64, f64)> = match mode {
            BandwidthMode::Partial => Some((initial, reset_time)),
            _ => None,
        };
        let mut rates = Vec::new();
        for sample in series {
            if let Some((last_v, last_t)) = last {
                let dt = sample.t - last_t;
                if dt > 0.0 {
                    let dv = match mode {
                        BandwidthMode::Incrementing => sample.v - last_v,
                        BandwidthMode::Partial => sample.v,
                        BandwidthMode::Operations => sample.v * opsize,
                    };
                    rates.push(dv / dt);
                }
            }
            last = Some((sample.v, sample.t));
        }
        if rates.is_empty() {
            return vec![None, None, None];
        }
        let avg = rates.iter().sum::<f64>() / rates.len() as f64;
        let min = rates.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = rates.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        vec![Some(avg), Some(min), Some(max)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn series(values: &[(f64, f64)]) -> Vec<Sample> {
        values.iter().map(|&(t, v)| Sample { t, v }).collect()
    }

    fn parse(yaml: &str) -> Result<Vec<Aggregate>> {
        let value: Value = serde_yaml::from_str(yaml).unwrap();
        Aggregate::parse_list(&value)
    }

    #[test]
    fn avg_over_series() {
        let agg = Aggregate::default_avg();
        let s = series(&[(0.0, 1.0), (1.0, 2.0), (2.0, 6.0)]);
        assert_eq!(agg.collect(&s, 0.0, 0.0), vec![Some(3.0)]);
        assert_eq!(agg.collect(&[], 0.0, 0.0), vec![Some(0.0)]);
    }

    #[test]
    fn min_max_empty_is_null() {
        let s = series(&[(0.0, 5.0), (1.0, 2.0), (2.0, 9.0)]);
        assert_eq!(Aggregate::Min("(Min)".into()).collect(&s, 0.0, 0.0), vec![Some(2.0)]);
        assert_eq!(Aggregate::Max("(Max)".into()).collect(&s, 0.0, 0.0), vec![Some(9.0)]);
        assert_eq!(Aggregate::Min("(Min)".into()).collect(&[], 0.0, 0.0), vec![None]);
        assert_eq!(Aggregate::Max("(Max)".into()).collect(&[], 0.0, 0.0), vec![None]);
    }

    #[test]
    fn sum_and_count() {
        let s = series(&[(0.0, 1.0), (1.0, 2.0)]);
        assert_eq!(Aggregate::Sum("(Sum)".into()).collect(&s, 0.0, 0.0), vec![Some(3.0)]);
        assert_eq!(Aggregate::Count("(Count)".into()).collect(&s, 0.0, 0.0), vec![Some(2.0)]);
    }

    #[test]
    fn incrementing_bandwidth_is_non_negative_for_growing_counters() {
        let agg = Aggregate::Bandwidth {
            mode: BandwidthMode::Incrementing,
            opsize: 1.0,
        };
        let s = series(&[(0.0, 100.0), (1.0, 300.0), (2.0, 350.0), (4.0, 750.0)]);
        let out = agg.collect(&s, 0.0, 0.0);
        // windows: 200/1, 50/1, 400/2
        assert_eq!(out, vec![Some(150.0), Some(50.0), Some(200.0)]);
        for v in out {
            assert!(v.unwrap() >= 0.0);
        }
    }

    #[test]
    fn partial_bandwidth_seeds_from_reset_time() {
        let agg = Aggregate::Bandwidth {
            mode: BandwidthMode::Partial,
            opsize: 1.0,
        };
        let s = series(&[(2.0, 100.0), (4.0, 100.0)]);
        // windows: 100 bytes over (0..2], 100 bytes over (2..4]
        assert_eq!(agg.collect(&s, 0.0, 0.0), vec![Some(50.0), Some(50.0), Some(50.0)]);
    }

    #[test]
    fn operations_bandwidth_scales_by_opsize() {
        let agg = Aggregate::Bandwidth {
            mode: BandwidthMode::Operations,
            opsize: 512.0,
        };
        let s = series(&[(0.0, 0.0), (1.0, 4.0)]);
        assert_eq!(agg.collect(&s, 0.0, 0.0), vec![Some(2048.0), Some(2048.0), Some(2048.0)]);
    }

    #[test]
    fn bandwidth_without_windows_is_null() {
        let agg = Aggregate::Bandwidth {
            mode: BandwidthMode::Incrementing,
            opsize: 1.0,
        };
        assert_eq!(agg.collect(&[], 0.0, 0.0), vec![None, None, None]);
        let one = series(&[(1.0, 5.0)]);
        assert_eq!(agg.collect(&one, 0.0, 0.0), vec![None, None, None]);
    }

    #[test]
    fn config_shorthand_forms() {
        assert_eq!(parse("avg").unwrap().len(), 1);
        assert_eq!(parse("{class: bandwidth, mode: partial}").unwrap().len(), 1);
        assert_eq!(parse("[min, max, {class: count}]").unwrap().len(), 3);
        assert!(parse("median").is_err());
        assert!(parse("{class: bandwidth, mode: sideways}").is_err());
    }
}
