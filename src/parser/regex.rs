// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

use crate::error::{Result, SweepError};
use crate::parser::MetricSink;
use crate::util::mget;
use regex_lite::Regex;
use serde_yaml::{Mapping, Value};

/// Matches lines against a set of patterns; every named capture group
/// becomes a metric update.
///
/// ```yaml
/// class: regex
/// match:
///   - "^Got (?P<completions>[0-9]+) CQ"
/// ```
pub struct RegexParser {
    patterns: Vec<Regex>,
}

impl RegexParser {
    pub fn configure(config: &Mapping) -> Result<RegexParser> {
        let matches = mget(config, "match")
            .ok_or_else(|| SweepError::spec("regex parser is missing 'match'"))?;
        let sources: Vec<&str> = match matches {
            Value::String(s) => vec![s.as_str()],
            Value::Sequence(seq) => seq.iter().filter_map(|v| v.as_str()).collect(),
            _ => {
                return Err(SweepError::spec(
                    "regex parser 'match' must be a pattern or a list of patterns",
                ))
            }
        };
        let patterns = sources
            .into_iter()
            .map(|p| {
                Regex::new(p)
                    .map_err(|e| SweepError::spec(format!("Bad regex pattern '{}': {}", p, e)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(RegexParser { patterns })
    }

    pub fn on_stdout(&mut self, line: &str, sink: &mut MetricSink) -> Result<()> {
        for pattern in &self.patterns {
            let caps = match pattern.captures(line) {
                Some(caps) => caps,
                None => continue,
            };
            for name in pattern.capture_names().flatten() {
                if let Some(value) = caps.name(name) {
                    // Coercion is forgiving so count-style metrics can
                    // track non-numeric captures
                    sink.update_text(name, value.as_str());
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::testutil::*;

    fn parser(yaml: &str) -> RegexParser {
        let config: Mapping = serde_yaml::from_str(yaml).unwrap();
        RegexParser::configure(&config).unwrap()
    }

    #[test]
    fn named_groups_become_updates() {
        let metrics = metrics_with(&["m"]);
        let mut sink = MetricSink::new(metrics.clone());
        let mut p = parser("{class: regex, match: ['^val=(?P<m>[0-9.]+)$']}");
        p.on_stdout("val=3.14", &mut sink).unwrap();
        p.on_stdout("other line", &mut sink).unwrap();
        assert_eq!(recorded(&metrics), vec![Some(3.14)]);
    }

    #[test]
    fn multiple_groups_in_one_line() {
        let metrics = metrics_with(&["rx", "tx"]);
        let mut sink = MetricSink::new(metrics.clone());
        let mut p = parser("{class: regex, match: ['rx=(?P<rx>[0-9]+) tx=(?P<tx>[0-9]+)']}");
        p.on_stdout("iface0 rx=120 tx=80 drops=0", &mut sink).unwrap();
        assert_eq!(recorded(&metrics), vec![Some(120.0), Some(80.0)]);
    }

    #[test]
    fn non_numeric_captures_coerce_to_zero() {
        let metrics = metrics_with(&["m"]);
        let mut sink = MetricSink::new(metrics.clone());
        let mut p = parser("{class: regex, match: ['val=(?P<m>\\S+)']}");
        p.on_stdout("val=oops", &mut sink).unwrap();
        assert_eq!(recorded(&metrics), vec![Some(0.0)]);
    }
}
