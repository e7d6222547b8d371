// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Spec file loading. A spec file may pull other files in through `load:`;
//! everything is deep-merged (scalars replaced, mappings merged
//! recursively, lists concatenated) with includers taking priority over
//! what they include. The merged tree seeds the global context.

use crate::context::Context;
use crate::error::{Result, SweepError};
use crate::metrics::Metrics;
use crate::reporter::Reporter;
use crate::stream::Stream;
use crate::util::{mget, value_to_string};
use crate::RuntimeEnv;
use serde_yaml::{Mapping, Value};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

pub struct Specs {
    pub filename: PathBuf,
    specs: Mapping,
    pub context: Context,
}

/// Recursive merge: `overlay` wins on scalars, mappings merge key-wise,
/// sequences concatenate (base first).
pub fn deep_merge(base: &mut Mapping, overlay: &Mapping) {
    for (key, value) in overlay {
        match (base.get_mut(key), value) {
            (Some(Value::Mapping(base_map)), Value::Mapping(overlay_map)) => {
                deep_merge(base_map, overlay_map);
            }
            (Some(Value::Sequence(base_seq)), Value::Sequence(overlay_seq)) => {
                base_seq.extend(overlay_seq.iter().cloned());
            }
            _ => {
                base.insert(key.clone(), value.clone());
            }
        }
    }
}

impl Specs {
    /// Load a spec file and everything it includes.
    pub fn load(filename: &Path) -> Result<Specs> {
        let mut queue: VecDeque<PathBuf> = VecDeque::new();
        queue.push_back(filename.to_path_buf());
        let mut stack: Vec<Mapping> = Vec::new();

        while let Some(fname) = queue.pop_front() {
            info!("Loading {}", fname.display());
            let text = std::fs::read_to_string(&fname).map_err(|e| {
                SweepError::spec(format!("Cannot read {}: {}", fname.display(), e))
            })?;
            let mut specs: Mapping = serde_yaml::from_str(&text).map_err(|e| {
                SweepError::spec(format!("Cannot parse {}: {}", fname.display(), e))
            })?;

            if let Some(load) = specs.remove(&Value::from("load")) {
                let entries: Vec<String> = match &load {
                    Value::String(s) => vec![s.clone()],
                    Value::Sequence(seq) => seq.iter().map(value_to_string).collect(),
                    _ => {
                        return Err(SweepError::spec(
                            "'load' must be a path or a list of paths",
                        ))
                    }
                };
                let base_dir = fname.parent().unwrap_or_else(|| Path::new("."));
                for entry in entries {
                    let path = PathBuf::from(&entry);
                    if path.is_absolute() {
                        queue.push_back(path);
                    } else {
                        queue.push_back(base_dir.join(path));
                    }
                }
            }
            stack.push(specs);
        }

        // Merge in reverse load order: loaded files have lower priority
        // than the ones that loaded them
        let mut merged = Mapping::new();
        for specs in stack.iter().rev() {
            deep_merge(&mut merged, specs);
        }

        let mut specs = Specs {
            filename: filename.to_path_buf(),
            specs: merged,
            context: Context::new(),
        };
        specs.seed_context();
        Ok(specs)
    }

    fn seed_context(&mut self) {
        if let Some(globals) = mget(&self.specs, "globals").and_then(Value::as_mapping) {
            self.context.update(globals);
        }
        if let Some(test) = mget(&self.specs, "test") {
            self.context.set("test", test.clone());
        }
        if let Some(environments) = mget(&self.specs, "environments") {
            self.context.set("env", environments.clone());
        }
        if let Some(metrics) = mget(&self.specs, "metrics") {
            self.context.set("metric", metrics.clone());
        }
        if let Some(nodes) = mget(&self.specs, "nodes") {
            self.context.set("node", nodes.clone());
        }
        if let Some(parsers) = mget(&self.specs, "parsers") {
            self.context.set("parser", parsers.clone());
        }
        if let Some(apps) = mget(&self.specs, "apps") {
            self.context.set("app", apps.clone());
        }
        if let Some(streamlets) = mget(&self.specs, "streamlets") {
            self.context.set("streamlet", streamlets.clone());
        }
        if let Some(notes) = mget(&self.specs, "notes") {
            self.context.set("notes", notes.clone());
        }

        // The report block gets its computed name and timestamp so streams
        // can derive output log paths from the context alone
        let mut report = mget(&self.specs, "report")
            .and_then(Value::as_mapping)
            .cloned()
            .unwrap_or_default();
        if mget(&report, "name").is_none() {
            let name = mget(&self.specs, "name")
                .map(value_to_string)
                .unwrap_or_else(|| "test".to_string());
            report.insert(Value::from("name"), Value::from(name));
        }
        let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S").to_string();
        report.insert(Value::from("timestamp"), Value::from(timestamp));
        self.context.set("report", Value::Mapping(report));
    }

    pub fn specs(&self) -> &Mapping {
        &self.specs
    }

    /// The sweep variable names, in spec-file order.
    pub fn test_variables(&self) -> Vec<String> {
        mget(&self.specs, "test-cases")
            .and_then(Value::as_mapping)
            .map(|cases| {
                cases
                    .iter()
                    .filter_map(|(k, _)| k.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn metric_configs(&self) -> Vec<Value> {
        mget(&self.specs, "metrics")
            .and_then(Value::as_sequence)
            .cloned()
            .unwrap_or_default()
    }

    /// Metric column titles; the metrics code already knows how to build
    /// them, so it is reused here.
    pub fn metric_titles(&self) -> Result<Vec<String>> {
        let metrics = Metrics::new();
        metrics.configure(&self.metric_configs())?;
        Ok(metrics.titles())
    }

    /// One context per test case: the Cartesian product over `test-cases`
    /// in key order, the last variable cycling fastest.
    pub fn create_test_contexts(&self) -> Result<Vec<Context>> {
        let cases = match mget(&self.specs, "test-cases").and_then(Value::as_mapping) {
            Some(cases) if !cases.is_empty() => cases,
            _ => return Ok(vec![self.context.fork()]),
        };

        let mut keys: Vec<String> = Vec::new();
        let mut values: Vec<Vec<Value>> = Vec::new();
        for (key, value) in cases {
            let key = key
                .as_str()
                .ok_or_else(|| SweepError::spec("test-case variable names must be strings"))?;
            let entry = match value {
                Value::Sequence(seq) => seq.clone(),
                other => vec![other.clone()],
            };
            keys.push(key.to_string());
            values.push(entry);
        }

        let count: usize = values.iter().map(Vec::len).product();
        let mut contexts = Vec::with_capacity(count);
        for index in 0..count {
            let mut remainder = index;
            let mut picks: Vec<Value> = vec![Value::Null; keys.len()];
            for (slot, options) in values.iter().enumerate().rev() {
                picks[slot] = options[remainder % options.len()].clone();
                remainder /= options.len();
            }

            let mut ctx = self.context.fork();
            let mut curr = Mapping::new();
            for (key, value) in keys.iter().zip(&picks) {
                ctx.set(key, value.clone());
                curr.insert(Value::from(key.as_str()), value.clone());
            }
            ctx.set("curr", Value::Mapping(curr));
            contexts.push(ctx);
        }
        Ok(contexts)
    }

    /// Materialize the stream set of one iteration.
    pub fn create_streams(
        &self,
        test: &Context,
        metrics: &Arc<Metrics>,
        runtime: &Arc<RuntimeEnv>,
        iteration: usize,
    ) -> Result<Vec<Stream>> {
        let stream_specs = mget(&self.specs, "streams")
            .and_then(Value::as_sequence)
            .ok_or_else(|| SweepError::spec("No 'streams' defined in the specs"))?;
        let mut streams = Vec::with_capacity(stream_specs.len());
        for entry in stream_specs {
            let entry = entry
                .as_mapping()
                .ok_or_else(|| SweepError::spec("'streams' entries must be mappings"))?;
            streams.push(Stream::configure(test, entry, metrics, runtime, iteration)?);
        }
        Ok(streams)
    }

    /// Where the CSV report goes: `report.path`, or `./reports` when that
    /// directory exists, or the working directory.
    pub fn create_reporter(&self) -> Result<Reporter> {
        let name = self
            .context
            .get_string("report.name")
            .unwrap_or_else(|| "test".to_string());
        let timestamp = self.context.get_string("report.timestamp").unwrap_or_default();
        let base_dir = match self.context.get_string("report.path") {
            Some(path) if !path.is_empty() => PathBuf::from(path),
            _ => {
                if Path::new("./reports").is_dir() {
                    PathBuf::from("./reports")
                } else {
                    PathBuf::from(".")
                }
            }
        };
        let filename = base_dir.join(format!("{}-{}.csv", name, timestamp));
        Reporter::create(filename, self)
    }

    /// `test.iterations` for a test context, defaulting to one.
    pub fn iterations(test: &Context) -> usize {
        test.get_string("test.iterations")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1)
            .max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::atomic::{AtomicUsize, Ordering};

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn write_spec(name: &str, contents: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "benchsweep-specs-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::SeqCst)
        ));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn deep_merge_semantics() {
        let mut base: Mapping =
            serde_yaml::from_str("{a: 1, m: {x: 1, y: 2}, l: [1, 2]}").unwrap();
        let overlay: Mapping = serde_yaml::from_str("{a: 9, m: {y: 3}, l: [3]}").unwrap();
        deep_merge(&mut base, &overlay);
        assert_eq!(mget(&base, "a"), Some(&Value::from(9)));
        let m = mget(&base, "m").and_then(Value::as_mapping).unwrap();
        assert_eq!(mget(m, "x"), Some(&Value::from(1)));
        assert_eq!(mget(m, "y"), Some(&Value::from(3)));
        assert_eq!(
            mget(&base, "l"),
            Some(&serde_yaml::from_str::<Value>("[1, 2, 3]").unwrap())
        );
    }

    #[test]
    fn includes_merge_with_includer_priority() {
        let included = write_spec(
            "common.yaml",
            "globals: {size: 1024, mode: base}\nmetrics:\n  - {name: a}\n",
        );
        let main = write_spec(
            "main.yaml",
            &format!(
                "load: {}\nglobals: {{mode: override}}\nmetrics:\n  - {{name: b}}\n",
                included.display()
            ),
        );
        let specs = Specs::load(&main).unwrap();
        assert_eq!(specs.context.get_string("mode").as_deref(), Some("override"));
        assert_eq!(specs.context.get_string("size").as_deref(), Some("1024"));
        // lists concatenate, included first
        let names: Vec<String> = specs
            .metric_configs()
            .iter()
            .filter_map(|m| m.as_mapping().and_then(|m| mget(m, "name")).map(value_to_string))
            .collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn test_case_product_order() {
        let path = write_spec(
            "sweep.yaml",
            "test-cases:\n  n: [1, 2]\n  m: [a, b]\n",
        );
        let specs = Specs::load(&path).unwrap();
        assert_eq!(specs.test_variables(), vec!["n", "m"]);
        let contexts = specs.create_test_contexts().unwrap();
        let combos: Vec<(String, String)> = contexts
            .iter()
            .map(|c| {
                (
                    c.get_string("n").unwrap(),
                    c.get_string("m").unwrap(),
                )
            })
            .collect();
        assert_eq!(
            combos,
            vec![
                ("1".to_string(), "a".to_string()),
                ("1".to_string(), "b".to_string()),
                ("2".to_string(), "a".to_string()),
                ("2".to_string(), "b".to_string()),
            ]
        );
        // every context carries its assignment under curr.* as well
        assert_eq!(contexts[2].get_string("curr.n").as_deref(), Some("2"));
        assert_eq!(contexts[2].get_string("curr.m").as_deref(), Some("a"));
    }

    #[test]
    fn no_test_cases_is_a_single_context() {
        let path = write_spec("single.yaml", "globals: {x: 1}\n");
        let specs = Specs::load(&path).unwrap();
        assert_eq!(specs.create_test_contexts().unwrap().len(), 1);
    }

    #[test]
    fn report_context_carries_name_and_timestamp() {
        let path = write_spec("named.yaml", "name: throughput\nreport: {keep_output: /tmp/out}\n");
        let specs = Specs::load(&path).unwrap();
        assert_eq!(
            specs.context.get_string("report.name").as_deref(),
            Some("throughput")
        );
        assert!(!specs
            .context
            .get_string("report.timestamp")
            .unwrap()
            .is_empty());
        assert_eq!(
            specs.context.get_string("report.keep_output").as_deref(),
            Some("/tmp/out")
        );
    }

    #[test]
    fn missing_file_is_a_spec_error() {
        assert!(Specs::load(Path::new("/nonexistent/benchsweep.yaml")).is_err());
    }
}
