// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! The CSV report: a metadata header, one row per iteration under `Test
//! numbers`, and per-test summaries under `Summarized numbers`. Iteration
//! values are echoed to the log with units so the console stays readable
//! while the CSV keeps plain numbers.
//!
//! Rows are serialized through the csv writer (for quoting); the section
//! structure of the file (blank separators, section titles) is plain
//! lines, which csv itself has no notion of.

use crate::context::Context;
use crate::metrics::MetricsResults;
use crate::specs::Specs;
use crate::util::{mget, value_to_string};
use anyhow::{Context as _, Result};
use serde_yaml::Value;
use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use tracing::info;

fn now_stamp() -> String {
    chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Serialize one record with CSV quoting rules.
fn csv_row<S: AsRef<[u8]>>(fields: impl IntoIterator<Item = S>) -> String {
    let mut writer = csv::WriterBuilder::new()
        .flexible(true)
        .from_writer(Vec::new());
    let _ = writer.write_record(fields);
    let bytes = writer.into_inner().unwrap_or_default();
    String::from_utf8_lossy(&bytes).trim_end().to_string()
}

pub struct Reporter {
    path: PathBuf,
    file: Option<File>,
    notes: Vec<(String, String)>,
    test_variables: Vec<String>,
    test_titles: Vec<String>,
    title_width: usize,

    test_id: usize,
    iterations: usize,
    cur_iterations: usize,
    ok_iterations: usize,
    active_test: Vec<String>,
    summary_rows: Vec<String>,
    pending_iteration: Option<(String, String)>,
    pending_test: Option<String>,
}

impl Reporter {
    pub fn create(path: PathBuf, specs: &Specs) -> crate::error::Result<Reporter> {
        let mut notes = Vec::new();
        if let Some(title) = mget(specs.specs(), "title") {
            notes.push(("Title".to_string(), value_to_string(title)));
        }
        if let Some(desc) = mget(specs.specs(), "desc") {
            notes.push(("Description".to_string(), value_to_string(desc)));
        }
        if let Some(Value::Mapping(extra)) = specs.context.get("notes") {
            for (k, v) in extra {
                if let Some(k) = k.as_str() {
                    notes.push((k.to_string(), value_to_string(v)));
                }
            }
        }

        let test_titles = specs.metric_titles()?;
        let title_width = test_titles.iter().map(String::len).max().unwrap_or(1);

        Ok(Reporter {
            path,
            file: None,
            notes,
            test_variables: specs.test_variables(),
            test_titles,
            title_width,
            test_id: 0,
            iterations: 1,
            cur_iterations: 0,
            ok_iterations: 0,
            active_test: Vec::new(),
            summary_rows: Vec::new(),
            pending_iteration: None,
            pending_test: None,
        })
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        let file = self.file.as_mut().context("The report file is not open")?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn iteration_header(&self) -> String {
        let mut header = vec![
            "Num".to_string(),
            "Iteration".to_string(),
            "Started".to_string(),
            "Ended".to_string(),
            "Status".to_string(),
        ];
        header.extend(self.test_variables.clone());
        header.extend(self.test_titles.clone());
        header.push("Comment".to_string());
        csv_row(header)
    }

    fn summary_header(&self) -> String {
        let mut header = vec![
            "Num".to_string(),
            "Started".to_string(),
            "Ended".to_string(),
            "Iterations".to_string(),
            "Successful".to_string(),
        ];
        header.extend(self.test_variables.clone());
        header.extend(self.test_titles.clone());
        header.push("Comment".to_string());
        csv_row(header)
    }

    /// Open the file and write the metadata block and the iteration table
    /// header.
    pub fn start(&mut self) -> Result<()> {
        info!("Writing report to {}", self.path.display());
        let file = File::create(&self.path)
            .with_context(|| format!("Cannot create {}", self.path.display()))?;
        self.file = Some(file);
        self.test_id = 0;

        for (key, value) in self.notes.clone() {
            let row = csv_row([key, value]);
            self.write_line(&row)?;
        }
        let started = csv_row(["Started on".to_string(), now_stamp()]);
        self.write_line(&started)?;
        self.write_line("")?;
        self.write_line("Test numbers")?;
        self.write_line("")?;
        let header = self.iteration_header();
        self.write_line(&header)?;
        self.flush()
    }

    /// A new test case begins: remember its variable values and reset the
    /// iteration counters.
    pub fn test_start(&mut self, test: &Context) {
        self.test_id += 1;
        self.iterations = Specs::iterations(test);
        self.cur_iterations = 0;
        self.ok_iterations = 0;
        self.active_test = self
            .test_variables
            .iter()
            .map(|var| test.get_string(var).unwrap_or_default())
            .collect();
        self.pending_test = Some(now_stamp());
    }

    pub fn iteration_start(&mut self, iteration: usize) {
        self.pending_iteration = Some((
            format!("{} of {}", iteration, self.iterations),
            now_stamp(),
        ));
        self.cur_iterations += 1;
    }

    /// Complete the pending iteration row and echo the rendered values.
    pub fn iteration_end(
        &mut self,
        results: &MetricsResults,
        status: &str,
        comment: &str,
    ) -> Result<()> {
        let (iteration, started) = self
            .pending_iteration
            .take()
            .unwrap_or_else(|| ("?".to_string(), now_stamp()));

        let mut row = vec![
            self.test_id.to_string(),
            iteration,
            started,
            now_stamp(),
            status.to_string(),
        ];
        row.extend(self.active_test.clone());
        row.extend(results.render(false));
        row.push(comment.to_string());
        let row = csv_row(row);
        self.write_line(&row)?;
        self.flush()?;

        if status == crate::driver::STATUS_COMPLETED {
            self.ok_iterations += 1;
        }

        let rendered = results.render(true);
        info!("{}", "-".repeat(self.title_width + 20));
        for (title, value) in self.test_titles.iter().zip(&rendered) {
            info!("{:>width$} : {}", title, value, width = self.title_width);
        }
        info!("{}", "-".repeat(self.title_width + 20));
        Ok(())
    }

    /// Close out a test case; its summary row is buffered until
    /// `finalize`.
    pub fn test_end(&mut self, results: &MetricsResults, comment: &str) {
        let started = self.pending_test.take().unwrap_or_else(now_stamp);
        let mut row = vec![
            self.test_id.to_string(),
            started,
            now_stamp(),
            self.cur_iterations.to_string(),
            self.ok_iterations.to_string(),
        ];
        row.extend(self.active_test.clone());
        row.extend(results.render(false));
        row.push(comment.to_string());
        self.summary_rows.push(csv_row(row));
    }

    /// The user broke the run: complete whatever rows are pending and
    /// write the summary section.
    pub fn interrupt(&mut self, results: Option<&MetricsResults>, reason: &str) -> Result<()> {
        if let Some((iteration, started)) = self.pending_iteration.take() {
            let mut row = vec![
                self.test_id.to_string(),
                iteration,
                started,
                now_stamp(),
                crate::driver::STATUS_INTERRUPTED.to_string(),
            ];
            row.extend(self.active_test.clone());
            row.extend(vec![String::new(); self.test_titles.len()]);
            row.push(reason.to_string());
            let row = csv_row(row);
            self.write_line(&row)?;
        }
        if self.pending_test.is_some() {
            let empty = MetricsResults::default();
            self.test_end(results.unwrap_or(&empty), reason);
        }
        self.finalize()
    }

    /// Write the `Summarized numbers` section.
    pub fn finalize(&mut self) -> Result<()> {
        info!("Finalizing report");
        self.write_line("")?;
        self.write_line("Summarized numbers")?;
        self.write_line("")?;
        let header = self.summary_header();
        self.write_line(&header)?;
        for row in self.summary_rows.clone() {
            self.write_line(&row)?;
        }
        self.flush()
    }

    fn flush(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }

    pub fn close(&mut self) {
        if let Some(mut file) = self.file.take() {
            let _ = file.flush();
        }
    }
}
