// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

use crate::error::{Result, SweepError};
use crate::parser::MetricSink;
use crate::util::mget;
use lazy_static::lazy_static;
use regex_lite::Regex;
use serde_yaml::Mapping;
use std::collections::HashMap;

lazy_static! {
    static ref RE_CPULINE: Regex = Regex::new(r"^[0-9]+:[0-9]+:[0-9]+").unwrap();
}

/// Parses the periodic grid printed by mpstat(1): learns the column layout
/// from the `%usr` header, indexes the sample rows by CPU id and, at the
/// end of each block (first non-matching line or end of stream), resolves
/// the configured `metric: "<cpu>.<field>"` queries against the grid.
///
/// ```yaml
/// class: mpstat
/// match:
///   cpu_total: "all.usr"
///   cpu_io: "all.iowait"
/// ```
pub struct MpstatParser {
    queries: Vec<(String, String, String)>,
    in_block: bool,
    cpu_col: usize,
    fields: Vec<String>,
    matrix: HashMap<String, HashMap<String, f64>>,
}

impl MpstatParser {
    pub fn configure(config: &Mapping) -> Result<MpstatParser> {
        let mut queries = Vec::new();
        if let Some(matches) = mget(config, "match").and_then(|v| v.as_mapping()) {
            for (metric, query) in matches {
                let metric = metric
                    .as_str()
                    .ok_or_else(|| SweepError::spec("mpstat metric names must be strings"))?;
                let query = query
                    .as_str()
                    .ok_or_else(|| SweepError::spec("mpstat queries must be strings"))?;
                let (cpu, field) = query.split_once('.').ok_or_else(|| {
                    SweepError::spec("Expecting 'cpu.metric' format for the metrics to track")
                })?;
                queries.push((metric.to_string(), cpu.to_string(), field.to_string()));
            }
        }
        Ok(MpstatParser {
            queries,
            in_block: false,
            cpu_col: 0,
            fields: Vec::new(),
            matrix: HashMap::new(),
        })
    }

    pub fn on_stdout(&mut self, line: &str, sink: &mut MetricSink) -> Result<()> {
        if line.contains("%usr") {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let cpu_col = tokens.iter().position(|t| *t == "CPU").ok_or_else(|| {
                SweepError::Parse("This does not look like mpstat output".to_string())
            })?;
            self.cpu_col = cpu_col;
            self.fields = tokens[cpu_col + 1..]
                .iter()
                .map(|t| t.replace('%', ""))
                .collect();
            self.in_block = true;
            self.matrix.clear();
            return Ok(());
        }

        if !self.in_block {
            return Ok(());
        }

        if RE_CPULINE.is_match(line) {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            if tokens.len() <= self.cpu_col {
                return Ok(());
            }
            let cpu = tokens[self.cpu_col].to_string();
            let mut row = HashMap::new();
            for (field, value) in self.fields.iter().zip(&tokens[self.cpu_col + 1..]) {
                let value: f64 = value.parse().map_err(|_| {
                    SweepError::Parse(format!("mpstat value '{}' is not a number", value))
                })?;
                row.insert(field.clone(), value);
            }
            self.matrix.insert(cpu, row);
        } else {
            self.in_block = false;
            self.commit(sink);
        }
        Ok(())
    }

    pub fn on_eof(&mut self, sink: &mut MetricSink) -> Result<()> {
        self.commit(sink);
        Ok(())
    }

    /// Emit one update per resolvable query, then drop the grid so a
    /// trailing end-of-stream commit cannot double-count the block.
    fn commit(&mut self, sink: &mut MetricSink) {
        for (metric, cpu, field) in &self.queries {
            if let Some(value) = self.matrix.get(cpu).and_then(|row| row.get(field)) {
                sink.update(metric, *value);
            }
        }
        self.matrix.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::testutil::*;
    use crate::parser::MetricSink;

    const HEADER: &str =
        "12:10:01 CPU %usr %nice %sys %iowait %irq %soft %steal %guest %gnice %idle";

    fn parser(yaml: &str) -> MpstatParser {
        let config: Mapping = serde_yaml::from_str(yaml).unwrap();
        MpstatParser::configure(&config).unwrap()
    }

    #[test]
    fn resolves_queries_against_the_grid() {
        let metrics = metrics_with(&["usr_all", "idle_cpu1"]);
        let mut sink = MetricSink::new(metrics.clone());
        let mut p = parser("{class: mpstat, match: {usr_all: all.usr, idle_cpu1: 1.idle}}");
        p.on_stdout(HEADER, &mut sink).unwrap();
        p.on_stdout(
            "12:10:02 all 12.5 0.0 3.1 0.4 0.0 0.2 0.0 0.0 0.0 83.8",
            &mut sink,
        )
        .unwrap();
        p.on_stdout(
            "12:10:02 1 25.0 0.0 6.0 0.8 0.0 0.4 0.0 0.0 0.0 67.8",
            &mut sink,
        )
        .unwrap();
        p.on_eof(&mut sink).unwrap();
        assert_eq!(recorded(&metrics), vec![Some(12.5), Some(67.8)]);
    }

    #[test]
    fn block_commits_on_first_non_matching_line() {
        let metrics = metrics_with(&["usr"]);
        let mut sink = MetricSink::new(metrics.clone());
        let mut p = parser("{class: mpstat, match: {usr: all.usr}}");
        p.on_stdout(HEADER, &mut sink).unwrap();
        p.on_stdout(
            "12:10:02 all 10.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 90.0",
            &mut sink,
        )
        .unwrap();
        p.on_stdout("", &mut sink).unwrap();
        // end of stream must not double-count the committed block
        p.on_eof(&mut sink).unwrap();
        assert_eq!(recorded(&metrics), vec![Some(10.0)]);
    }

    #[test]
    fn twelve_hour_headers_shift_the_cpu_column() {
        let metrics = metrics_with(&["usr"]);
        let mut sink = MetricSink::new(metrics.clone());
        let mut p = parser("{class: mpstat, match: {usr: all.usr}}");
        p.on_stdout(
            "12:10:01 PM CPU %usr %nice %sys %iowait %irq %soft %steal %guest %gnice %idle",
            &mut sink,
        )
        .unwrap();
        p.on_stdout(
            "12:10:02 PM all 7.5 0.0 0.0 0.0 0.0 0.0 0.0 0.0 0.0 92.5",
            &mut sink,
        )
        .unwrap();
        p.on_eof(&mut sink).unwrap();
        assert_eq!(recorded(&metrics), vec![Some(7.5)]);
    }

    #[test]
    fn header_without_cpu_is_a_parse_error() {
        let metrics = metrics_with(&[]);
        let mut sink = MetricSink::new(metrics);
        let mut p = parser("{class: mpstat, match: {usr: all.usr}}");
        assert!(p.on_stdout("%usr but not mpstat", &mut sink).is_err());
    }
}
