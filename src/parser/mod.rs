// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Line-oriented output parsers. A parser listens on a pipe, extracts
//! values and pushes them into the shared metrics through a [`MetricSink`]
//! that applies the stream's alias mapping and metric filter first.

pub mod mpstat;
pub mod regex;
pub mod split;

pub use self::mpstat::MpstatParser;
pub use self::regex::RegexParser;
pub use self::split::SplitParser;

use crate::error::{Result, SweepError};
use crate::metrics::Metrics;
use crate::pipe::PipeListener;
use crate::util::mget_str;
use serde_yaml::{Mapping, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Routes parser updates into the metrics: filter first, then alias, then
/// the shared registry. Updates against undeclared metrics are warned once
/// and dropped.
pub struct MetricSink {
    metrics: Arc<Metrics>,
    alias: HashMap<String, String>,
    filter: Option<HashSet<String>>,
    warned: HashSet<String>,
}

impl MetricSink {
    pub fn new(metrics: Arc<Metrics>) -> MetricSink {
        MetricSink {
            metrics,
            alias: HashMap::new(),
            filter: None,
            warned: HashSet::new(),
        }
    }

    /// Merge an alias mapping; later additions win on conflict.
    pub fn add_alias(&mut self, map: &Mapping) {
        for (k, v) in map {
            if let (Some(k), Some(v)) = (k.as_str(), v.as_str()) {
                self.alias.insert(k.to_string(), v.to_string());
            }
        }
    }

    /// Extend the metric filter; a name or a list of names.
    pub fn add_filter(&mut self, value: &Value) {
        let filter = self.filter.get_or_insert_with(HashSet::new);
        match value {
            Value::String(name) => {
                filter.insert(name.clone());
            }
            Value::Sequence(seq) => {
                for v in seq {
                    if let Some(name) = v.as_str() {
                        filter.insert(name.to_string());
                    }
                }
            }
            _ => {}
        }
    }

    pub fn update(&mut self, name: &str, value: f64) {
        if let Some(filter) = &self.filter {
            if !filter.contains(name) {
                return;
            }
        }
        let name = self.alias.get(name).map(String::as_str).unwrap_or(name);
        if let Err(e) = self.metrics.update(name, value) {
            if self.warned.insert(name.to_string()) {
                warn!("{}", e);
            }
        }
    }

    /// Forgiving update for parsers that extract text columns: anything
    /// non-numeric counts as zero.
    pub fn update_text(&mut self, name: &str, value: &str) {
        self.update(name, value.trim().parse().unwrap_or(0.0));
    }
}

enum ParserKind {
    Regex(RegexParser),
    Split(SplitParser),
    Mpstat(MpstatParser),
}

/// A configured parser bound to its metric sink; attached to pipes as a
/// listener.
pub struct Parser {
    kind: ParserKind,
    sink: MetricSink,
}

impl Parser {
    pub fn set_alias(&mut self, map: &Mapping) {
        self.sink.add_alias(map);
    }

    pub fn set_filter(&mut self, value: &Value) {
        self.sink.add_filter(value);
    }
}

impl PipeListener for Parser {
    fn on_stdout(&mut self, line: &str) -> anyhow::Result<()> {
        match &mut self.kind {
            ParserKind::Regex(p) => p.on_stdout(line, &mut self.sink),
            ParserKind::Split(p) => p.on_stdout(line, &mut self.sink),
            ParserKind::Mpstat(p) => p.on_stdout(line, &mut self.sink),
        }?;
        Ok(())
    }

    fn on_eof(&mut self) -> anyhow::Result<()> {
        if let ParserKind::Mpstat(p) = &mut self.kind {
            p.on_eof(&mut self.sink)?;
        }
        Ok(())
    }
}

/// Instantiate a parser by class name.
pub fn parser_factory(config: &Mapping, metrics: Arc<Metrics>) -> Result<Parser> {
    let class = mget_str(config, "class")
        .ok_or_else(|| SweepError::spec("Parser specs are missing a 'class'"))?;
    let kind = match class {
        "regex" => ParserKind::Regex(RegexParser::configure(config)?),
        "split" => ParserKind::Split(SplitParser::configure(config)?),
        "mpstat" | "mpstat-grid" => ParserKind::Mpstat(MpstatParser::configure(config)?),
        other => {
            return Err(SweepError::spec(format!("Unknown parser class '{}'", other)));
        }
    };
    Ok(Parser {
        kind,
        sink: MetricSink::new(metrics),
    })
}

#[cfg(test)]
pub(crate) mod testutil {
    use super::*;

    /// A metrics registry with plain `count`-free metrics for observing
    /// parser updates in tests.
    pub fn metrics_with(names: &[&str]) -> Arc<Metrics> {
        let metrics = Arc::new(Metrics::new());
        let configs: Vec<Value> = names
            .iter()
            .map(|n| serde_yaml::from_str(&format!("{{name: {}}}", n)).unwrap())
            .collect();
        metrics.configure(&configs).unwrap();
        metrics
    }

    pub fn recorded(metrics: &Metrics) -> Vec<Option<f64>> {
        metrics.results().values
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::*;
    use super::*;

    #[test]
    fn filter_applies_before_alias() {
        let metrics = metrics_with(&["renamed"]);
        let mut sink = MetricSink::new(metrics.clone());
        let alias: Mapping = serde_yaml::from_str("{raw: renamed}").unwrap();
        sink.add_alias(&alias);
        sink.add_filter(&Value::String("raw".to_string()));
        // "raw" passes the filter under its original name, lands aliased
        sink.update("raw", 4.0);
        // "renamed" itself is not in the filter and is dropped
        sink.update("renamed", 9.0);
        assert_eq!(recorded(&metrics), vec![Some(4.0)]);
    }

    #[test]
    fn unknown_metrics_are_dropped_not_fatal() {
        let metrics = metrics_with(&["known"]);
        let mut sink = MetricSink::new(metrics.clone());
        sink.update("unknown", 1.0);
        sink.update("known", 2.0);
        assert_eq!(recorded(&metrics), vec![Some(2.0)]);
    }

    #[test]
    fn factory_rejects_unknown_classes() {
        let config: Mapping = serde_yaml::from_str("{class: csv}").unwrap();
        assert!(parser_factory(&config, metrics_with(&[])).is_err());
    }
}
