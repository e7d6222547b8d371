// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! The test driver runs the iterations of one test case: build the stream
//! set, launch one supervisor task per active stream, watch them with
//! fail-fast cross-cancellation, collect the metric results and summarize
//! them across iterations.

use crate::context::Context;
use crate::error::SweepError;
use crate::metrics::{summarize, Metrics, MetricsResults};
use crate::runner::{StreamRunner, StreamState};
use crate::specs::Specs;
use crate::RuntimeEnv;
use anyhow::Result;
use async_std::task::sleep;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const TICK: Duration = Duration::from_millis(100);

pub const STATUS_COMPLETED: &str = "Completed";
pub const STATUS_ERROR: &str = "Error";
pub const STATUS_INTERRUPTED: &str = "Interrupted";

pub struct TestDriver {
    pub test: Context,
    metrics: Arc<Metrics>,
    pub results: Vec<MetricsResults>,
    pub last_results: MetricsResults,
    pub last_status: String,
    pub last_comment: String,
}

impl TestDriver {
    pub fn new(specs: &Specs, test: Context) -> Result<TestDriver> {
        let metrics = Arc::new(Metrics::new());
        metrics.configure(&specs.metric_configs())?;
        Ok(TestDriver {
            test,
            metrics,
            results: Vec::new(),
            last_results: MetricsResults::default(),
            last_status: STATUS_COMPLETED.to_string(),
            last_comment: String::new(),
        })
    }

    /// Run one iteration, retrying failed attempts when `test.retries`
    /// asks for it. Only the final attempt's results stick.
    pub async fn run_iteration(
        &mut self,
        specs: &Specs,
        runtime: &Arc<RuntimeEnv>,
        iteration: usize,
    ) -> Result<()> {
        let retries = self
            .test
            .get_string("test.retries")
            .and_then(|r| r.parse::<usize>().ok())
            .unwrap_or(0);
        let cooldown = self.test.time_value("test.cooldown", 0.0)?;

        for attempt in 0..=retries {
            self.run_once(specs, runtime, iteration).await?;
            if self.last_status == STATUS_COMPLETED {
                break;
            }
            if attempt < retries {
                warn!(
                    "Iteration {} failed ({}), retrying ({}/{})",
                    iteration + 1,
                    self.last_status,
                    attempt + 1,
                    retries
                );
                self.pause(runtime, cooldown).await;
            }
        }
        // Only the final attempt contributes to the summary
        self.results.push(self.last_results.clone());
        Ok(())
    }

    async fn run_once(
        &mut self,
        specs: &Specs,
        runtime: &Arc<RuntimeEnv>,
        iteration: usize,
    ) -> Result<()> {
        let streams = specs.create_streams(&self.test, &self.metrics, runtime, iteration)?;

        // Reset happens-before any stream task's first read
        self.metrics.reset();

        let mut states: Vec<Arc<StreamState>> = Vec::new();
        let mut handles = Vec::new();
        let active = streams.iter().filter(|s| s.active).count();
        debug!("Starting {} streams", active);
        for stream in streams {
            if !stream.active {
                continue;
            }
            let (state, handle) = StreamRunner::spawn(stream);
            states.push(state);
            handles.push(handle);
        }

        let mut status = STATUS_COMPLETED.to_string();
        let mut failed = false;
        loop {
            if runtime.cancelled() {
                for state in &states {
                    state.trigger(SweepError::Interrupted.to_string());
                }
                for handle in handles {
                    handle.await;
                }
                self.last_status = STATUS_INTERRUPTED.to_string();
                return Err(SweepError::Interrupted.into());
            }

            if !failed {
                // A stream that interrupted itself carries the reason; a
                // plain non-zero exit fails the iteration without one
                let reason = states
                    .iter()
                    .filter(|s| s.interrupted())
                    .find_map(|s| s.reason());
                if let Some(reason) = reason {
                    status = reason;
                    failed = true;
                } else if states
                    .iter()
                    .any(|s| !s.alive() && s.returncode().map_or(false, |c| c != 0))
                {
                    failed = true;
                }
                if failed {
                    debug!("Stream failure detected, stopping the iteration");
                    for state in &states {
                        state.trigger("Stopped by a failure in a parallel stream");
                    }
                }
            }

            if states.iter().all(|s| !s.alive()) {
                break;
            }
            sleep(TICK).await;
        }

        debug!("Waiting for stream tasks to exit");
        for handle in handles {
            handle.await;
        }

        let mut comments = Vec::new();
        for state in &states {
            if let Some(code) = state.returncode() {
                if code != 0 {
                    comments.push(format!("{} returned={}", state.name, code));
                }
            }
        }
        if status == STATUS_COMPLETED && !comments.is_empty() {
            status = STATUS_ERROR.to_string();
        }

        debug!("Stream tasks exited, collecting results");
        self.last_results = self.metrics.results();
        self.last_status = status;
        self.last_comment = comments.join(", ");
        Ok(())
    }

    /// Interruptible cooldown sleep.
    pub async fn pause(&self, runtime: &Arc<RuntimeEnv>, seconds: f64) {
        if seconds <= 0.0 {
            return;
        }
        let until = std::time::Instant::now() + Duration::from_secs_f64(seconds);
        while std::time::Instant::now() < until && !runtime.cancelled() {
            sleep(TICK).await;
        }
    }

    /// Column-wise average of the iteration results collected so far.
    pub fn summarize(&self) -> MetricsResults {
        summarize(&self.results)
    }
}
