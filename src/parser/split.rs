// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

use crate::error::{Result, SweepError};
use crate::parser::MetricSink;
use crate::util::{mget, mget_str};
use regex_lite::Regex;
use serde_yaml::{Mapping, Value};

/// Extracts columns out of lines split on a separator regex. A match entry
/// addresses a column on an absolute line number, on every line that
/// matches an anchor, or on every line. A parser-level `anchor` resets the
/// line counter whenever it matches.
///
/// ```yaml
/// class: split
/// separator: '\s+'
/// match:
///   - {name: total, line: 1, col: 1}
///   - {name: free, anchor: 'Free:', col: 2}
///   - {name: every, col: 0}
/// ```
pub struct SplitParser {
    line: usize,
    anchor: Option<Regex>,
    col_any: Vec<ColumnSpec>,
    col_line: Vec<(usize, ColumnSpec)>,
    col_anchor: Vec<(Regex, ColumnSpec)>,
}

struct ColumnSpec {
    separator: Regex,
    col: usize,
    name: String,
}

fn compile(pattern: &str) -> Result<Regex> {
    Regex::new(pattern)
        .map_err(|e| SweepError::spec(format!("Bad split pattern '{}': {}", pattern, e)))
}

impl SplitParser {
    pub fn configure(config: &Mapping) -> Result<SplitParser> {
        let default_sep = mget_str(config, "separator").unwrap_or(r"\s+");
        let anchor = match mget_str(config, "anchor") {
            Some(a) => Some(compile(a)?),
            None => None,
        };

        let mut parser = SplitParser {
            line: 0,
            anchor,
            col_any: Vec::new(),
            col_line: Vec::new(),
            col_anchor: Vec::new(),
        };

        let matches = mget(config, "match")
            .and_then(Value::as_sequence)
            .ok_or_else(|| SweepError::spec("split parser is missing a 'match' list"))?;
        for entry in matches {
            let entry = entry
                .as_mapping()
                .ok_or_else(|| SweepError::spec("split 'match' entries must be mappings"))?;
            let name = mget_str(entry, "name")
                .ok_or_else(|| SweepError::spec("split match entry is missing a 'name'"))?
                .to_string();
            let col = mget(entry, "col")
                .and_then(Value::as_u64)
                .ok_or_else(|| SweepError::spec("split match entry is missing a 'col'"))?
                as usize;
            let separator = compile(mget_str(entry, "separator").unwrap_or(default_sep))?;
            let spec = ColumnSpec {
                separator,
                col,
                name,
            };
            if let Some(line) = mget(entry, "line").and_then(Value::as_u64) {
                parser.col_line.push((line as usize, spec));
            } else if let Some(anchor) = mget_str(entry, "anchor") {
                parser.col_anchor.push((compile(anchor)?, spec));
            } else {
                parser.col_any.push(spec);
            }
        }
        Ok(parser)
    }

    fn emit(spec: &ColumnSpec, line: &str, sink: &mut MetricSink) {
        let parts: Vec<&str> = spec.separator.split(line).collect();
        if spec.col < parts.len() {
            sink.update_text(&spec.name, parts[spec.col]);
        }
    }

    pub fn on_stdout(&mut self, line: &str, sink: &mut MetricSink) -> Result<()> {
        if let Some(anchor) = &self.anchor {
            if anchor.is_match(line) {
                self.line = 0;
            }
        }

        for spec in &self.col_any {
            Self::emit(spec, line, sink);
        }

        let current = self.line;
        self.line += 1;
        for (wanted, spec) in &self.col_line {
            if *wanted == current {
                Self::emit(spec, line, sink);
            }
        }

        for (anchor, spec) in &self.col_anchor {
            if anchor.is_match(line) {
                Self::emit(spec, line, sink);
            }
        }
        Ok(())
    }
}
