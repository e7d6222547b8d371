// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Metric timeseries and their aggregation into report columns.
//!
//! Every stream of an iteration feeds the same [`Metrics`] object through
//! its parsers, so the per-metric series sit behind one mutex. Values carry
//! the timestamp of their insertion; bandwidth-style aggregators depend on
//! it.

use crate::aggregate::Aggregate;
use crate::error::{Result, SweepError};
use crate::util::{forgiving_f64, mget, mget_str, now_secs, truthy};
use indexmap::IndexMap;
use serde_yaml::{Mapping, Value};
use std::sync::Mutex;

/// One timestamped sample of a metric timeseries.
#[derive(Debug, Clone, Copy)]
pub struct Sample {
    pub t: f64,
    pub v: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrefixMode {
    #[default]
    None,
    Si,
    Iec,
}

const LARGE_PREFIXES: &[&str] = &["k", "M", "G", "T", "P", "E"];
const SMALL_PREFIXES: &[&str] = &["m", "u", "n", "p", "f", "a"];

/// Scale `value` by successive powers of `base`, returning the scaled value
/// and the strongest prefix that keeps it at or above one unit.
fn apply_prefix(value: f64, base: f64, prefixes: &[&'static str]) -> (f64, &'static str) {
    let mut nv = value;
    let mut np = "";
    for (i, p) in prefixes.iter().enumerate() {
        let step = base.powi(i as i32 + 1);
        if base >= 1.0 {
            if step > value {
                break;
            }
        } else if step < value {
            break;
        }
        nv = value / step;
        np = p;
    }
    (nv, np)
}

/// Format with a number of significant digits, trimming trailing zeros.
fn format_sig(value: f64, sig: usize) -> String {
    if value == 0.0 {
        return "0".to_string();
    }
    if !value.is_finite() {
        return value.to_string();
    }
    let sig = sig.max(1) as i32;
    let exponent = value.abs().log10().floor() as i32;
    // Round away digits beyond the significant ones
    let factor = 10f64.powi(exponent - (sig - 1));
    let rounded = (value / factor).round() * factor;
    let decimals = (sig - 1 - exponent).max(0) as usize;
    let s = format!("{:.*}", decimals, rounded);
    if s.contains('.') {
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        s
    }
}

/// Everything needed to render one column of a metric: kept apart from the
/// series so results can outlive the (locked) series storage.
#[derive(Debug, Clone)]
pub struct MetricStyle {
    pub title: String,
    pub units: String,
    pub scale: f64,
    pub decimals: usize,
    pub prefix: PrefixMode,
    pub show_units: bool,
}

impl MetricStyle {
    /// Human-readable rendering. The SI/IEC prefix is part of the unit, so
    /// prefix scaling only applies when the unit is shown; plain renders
    /// stay numerically exact for the CSV.
    pub fn format(&self, value: f64, with_units: bool) -> String {
        let v = value * self.scale;
        if !(with_units || self.show_units) {
            return format_sig(v, self.decimals);
        }
        let sign = if v < 0.0 { -1.0 } else { 1.0 };
        let magnitude = v.abs();
        let (magnitude, prefix) = match self.prefix {
            PrefixMode::Si if magnitude >= 1.0 => {
                apply_prefix(magnitude, 1000.0, LARGE_PREFIXES)
            }
            PrefixMode::Si if magnitude > 0.0 => apply_prefix(magnitude, 0.001, SMALL_PREFIXES),
            PrefixMode::Iec => apply_prefix(magnitude, 1024.0, LARGE_PREFIXES),
            _ => (magnitude, ""),
        };
        format!(
            "{} {}{}",
            format_sig(sign * magnitude, self.decimals),
            prefix,
            self.units
        )
    }
}

/// A named timeseries plus its aggregation and formatting configuration.
#[derive(Debug)]
pub struct Metric {
    pub name: String,
    style: MetricStyle,
    initial: f64,
    aggregators: Vec<Aggregate>,
    series: Vec<Sample>,
    reset_time: f64,
}

impl Metric {
    pub fn configure(config: &Mapping) -> Result<Metric> {
        let name = mget_str(config, "name")
            .ok_or_else(|| SweepError::spec("Metric is missing a 'name'"))?
            .to_string();
        let title = mget_str(config, "title").unwrap_or(&name).to_string();
        let units = mget_str(config, "units").unwrap_or("").to_string();
        let scale = mget(config, "scale").map(forgiving_f64).unwrap_or(1.0);
        let decimals = mget(config, "dec")
            .map(|v| forgiving_f64(v) as usize)
            .unwrap_or(2);
        let initial = mget(config, "initial").map(forgiving_f64).unwrap_or(0.0);
        let show_units = mget(config, "showunits").map(truthy).unwrap_or(false);
        let prefix = match mget_str(config, "prefix") {
            None => PrefixMode::None,
            Some(p) => match p.to_lowercase().as_str() {
                "si" => PrefixMode::Si,
                "iec" => PrefixMode::Iec,
                "none" | "" => PrefixMode::None,
                other => {
                    return Err(SweepError::spec(format!(
                        "Unknown metric prefix '{}'. Expecting 'si' or 'iec'",
                        other
                    )))
                }
            },
        };
        let aggregators = match mget(config, "aggregate") {
            Some(v) => Aggregate::parse_list(v)?,
            None => vec![Aggregate::default_avg()],
        };

        Ok(Metric {
            name,
            style: MetricStyle {
                title,
                units,
                scale,
                decimals,
                prefix,
                show_units,
            },
            initial,
            aggregators,
            series: Vec::new(),
            reset_time: now_secs(),
        })
    }

    pub fn update(&mut self, value: f64) {
        self.series.push(Sample {
            t: now_secs(),
            v: value,
        });
    }

    pub fn reset(&mut self) {
        self.series.clear();
        self.reset_time = now_secs();
    }

    pub fn style(&self) -> &MetricStyle {
        &self.style
    }

    /// Column titles. A metric with a single aggregator column keeps its
    /// bare title; multi-column metrics append the aggregator suffix. The
    /// `[unit]` tag is only added when values do not embed the unit
    /// themselves.
    pub fn titles(&self) -> Vec<String> {
        let agg_titles: Vec<String> = self
            .aggregators
            .iter()
            .flat_map(|a| a.titles())
            .collect();
        let unit_tag = if self.style.units.is_empty() || self.style.show_units {
            String::new()
        } else {
            format!(" [{}]", self.style.units)
        };
        if agg_titles.len() == 1 {
            vec![format!("{}{}", self.style.title, unit_tag)]
        } else {
            agg_titles
                .into_iter()
                .map(|t| format!("{} {}{}", self.style.title, t, unit_tag))
                .collect()
        }
    }

    /// Flat concatenation of every aggregator's columns over the series.
    pub fn values(&self) -> Vec<Option<f64>> {
        self.aggregators
            .iter()
            .flat_map(|a| a.collect(&self.series, self.initial, self.reset_time))
            .collect()
    }
}

/// The shared metric registry of one test: updated concurrently by every
/// stream of an iteration, reset between iterations.
#[derive(Debug, Default)]
pub struct Metrics {
    inner: Mutex<IndexMap<String, Metric>>,
}

impl Metrics {
    pub fn new() -> Metrics {
        Metrics::default()
    }

    pub fn configure(&self, configs: &[Value]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for config in configs {
            let map = config
                .as_mapping()
                .ok_or_else(|| SweepError::spec("Each metric must be a mapping"))?;
            let metric = Metric::configure(map)?;
            inner.insert(metric.name.clone(), metric);
        }
        Ok(())
    }

    pub fn reset(&self) {
        for metric in self.inner.lock().unwrap().values_mut() {
            metric.reset();
        }
    }

    pub fn update(&self, name: &str, value: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        match inner.get_mut(name) {
            Some(metric) => {
                metric.update(value);
                Ok(())
            }
            None => Err(SweepError::UnknownMetric(name.to_string())),
        }
    }

    pub fn titles(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .flat_map(|m| m.titles())
            .collect()
    }

    /// Snapshot the aggregated columns of every metric.
    pub fn results(&self) -> MetricsResults {
        let inner = self.inner.lock().unwrap();
        let mut results = MetricsResults::default();
        for metric in inner.values() {
            for value in metric.values() {
                results.values.push(value);
                results.styles.push(metric.style().clone());
            }
        }
        results
    }
}

/// Parallel columns of aggregated values and the style used to render each.
#[derive(Debug, Clone, Default)]
pub struct MetricsResults {
    pub values: Vec<Option<f64>>,
    styles: Vec<MetricStyle>,
}

impl MetricsResults {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn render(&self, with_units: bool) -> Vec<String> {
        self.values
            .iter()
            .zip(&self.styles)
            .map(|(v, style)| match v {
                Some(v) => style.format(*v, with_units),
                None => String::new(),
            })
            .collect()
    }
}

/// Column-wise average across iteration results. Null cells are dropped
/// from their column's average; a column null everywhere stays null.
pub fn summarize(results: &[MetricsResults]) -> MetricsResults {
    let first = match results.first() {
        Some(first) => first,
        None => return MetricsResults::default(),
    };
    let mut summary = MetricsResults {
        values: Vec::with_capacity(first.values.len()),
        styles: first.styles.clone(),
    };
    for col in 0..first.values.len() {
        let cells: Vec<f64> = results
            .iter()
            .filter_map(|r| r.values.get(col).copied().flatten())
            .collect();
        summary.values.push(if cells.is_empty() {
            None
        } else {
            Some(cells.iter().sum::<f64>() / cells.len() as f64)
        });
    }
    summary
}
