// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

use anyhow::{anyhow, Result};
use benchsweep::driver::TestDriver;
use benchsweep::error::SweepError;
use benchsweep::specs::Specs;
use benchsweep::util::fmt_secs;
use benchsweep::{logger, RuntimeEnv};
use clap::Parser;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use tracing::{error, info, warn};
use which::which;

/// Run parameterized benchmark sweeps over local and SSH hosts and collect
/// the measurements into a CSV report.
#[derive(Parser)]
#[command(name = "benchsweep", version)]
struct Cli {
    /// Path to the benchmark spec file
    spec: PathBuf,
}

/// The generated shell programs assume these exist on every host,
/// including this one.
fn preflight() -> Result<()> {
    for binary in ["bash", "stdbuf", "awk"] {
        which(binary).map_err(|_| anyhow!("Required binary '{}' was not found in PATH", binary))?;
    }
    if which("ssh").is_err() {
        warn!("'ssh' was not found in PATH; ssh access will not work");
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<i32> {
    if !cli.spec.is_file() {
        error!("The specified file '{}' was not found!", cli.spec.display());
        return Ok(1);
    }
    preflight()?;

    let specs = Specs::load(&cli.spec)?;
    let tests = specs.create_test_contexts()?;
    let mut reporter = specs.create_reporter()?;
    reporter.start()?;

    let runtime = Arc::new(RuntimeEnv::new());
    runtime.install_sigint_handler();

    let total_tests = tests.len();
    for (test_id, test) in tests.into_iter().enumerate() {
        let iterations = Specs::iterations(&test);
        let cooldown = test.time_value("test.cooldown", 0.0)?;

        let mut driver = TestDriver::new(&specs, test)?;
        reporter.test_start(&driver.test);

        for i in 0..iterations {
            let p_total = total_tests * iterations;
            let p_curr = test_id * iterations + i;
            let values = driver
                .test
                .curr_values()
                .iter()
                .map(|(k, v)| format!("{}=\"{}\"", k, v))
                .collect::<Vec<_>>()
                .join(", ");
            info!(
                "Running {}/{} (test: {}/{}, iteration: {}/{}, values: {{{}}})",
                p_curr + 1,
                p_total,
                test_id + 1,
                total_tests,
                i + 1,
                iterations,
                values
            );

            reporter.iteration_start(i + 1);
            if let Err(e) = driver.run_iteration(&specs, &runtime, i).await {
                if matches!(
                    e.downcast_ref::<SweepError>(),
                    Some(SweepError::Interrupted)
                ) {
                    warn!("Received break signal from the user");
                    let summary = driver.summarize();
                    let _ = reporter.interrupt(Some(&summary), "Interrupted by the user");
                    reporter.close();
                    return Ok(1);
                }
                reporter.close();
                return Err(e);
            }
            reporter.iteration_end(
                &driver.last_results,
                &driver.last_status,
                &driver.last_comment,
            )?;

            if cooldown > 0.0 && i + 1 < iterations {
                info!("Waiting for {} sec before next test", fmt_secs(cooldown));
                driver.pause(&runtime, cooldown).await;
            }
        }

        reporter.test_end(&driver.summarize(), "");
    }

    reporter.finalize()?;
    reporter.close();
    Ok(0)
}

#[async_std::main]
async fn main() {
    logger::init();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => exit(code),
        Err(e) => {
            error!("{:#}", e);
            exit(1);
        }
    }
}
