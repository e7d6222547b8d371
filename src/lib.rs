// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! `benchsweep` automates parameterized benchmark sweeps: it runs the
//! applications named in a YAML spec file on one or more hosts (locally or
//! tunneled through `ssh`), captures their textual output through a
//! pseudo-terminal, extracts numeric measurements with declarative parsers,
//! aggregates the measurements across repeated iterations and writes a CSV
//! report.
//!
//! A spec file names *apps* (what to run), *nodes* (where to run it),
//! *parsers* (how to read the output), *metrics* (what to track) and
//! *streams* (which app runs on which node). `test-cases` sweeps input
//! variables as a Cartesian product; every value in the file may use
//! `${variable}` macros, including arithmetic such as `${size * 1024}`.
//!
//! ```yaml
//! nodes:
//!   - name: local
//!     host: localhost
//!     access: [{class: local}]
//! parsers:
//!   ping:
//!     class: regex
//!     match: ['time=(?P<rtt>[0-9.]+) ms']
//! apps:
//!   ping:
//!     binary: /bin/ping
//!     args: "-c ${count} 127.0.0.1"
//!     parser: ping
//! metrics:
//!   - {name: rtt, title: Round-trip, units: s, scale: 0.001, aggregate: [avg, min, max]}
//! streams:
//!   - {node: local, app: ping}
//! test-cases:
//!   count: [3, 10]
//! ```
//!
//! Running `benchsweep ./ping.yaml` executes one test per test-case
//! combination, `test.iterations` times each, and leaves a timestamped
//! `.csv` next to the spec (or under `report.path`).

pub mod aggregate;
pub mod context;
pub mod driver;
pub mod error;
pub mod expr;
pub mod logger;
pub mod metrics;
pub mod parser;
pub mod pipe;
pub mod pty;
pub mod reporter;
pub mod runner;
pub mod specs;
pub mod stream;
pub mod util;

pub use error::{Result, SweepError};

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Process-wide interrupt flag, set from the SIGINT handler. Everything else
/// reaches it through [`RuntimeEnv::cancelled`].
static SIGINT_RECEIVED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: nix::libc::c_int) {
    SIGINT_RECEIVED.store(true, Ordering::SeqCst);
}

/// Process-scoped state handed explicitly to the driver and the stream
/// factory: the monotonic stream-id counter and the root cancellation flag.
#[derive(Default)]
pub struct RuntimeEnv {
    stream_ids: AtomicUsize,
    cancel: AtomicBool,
}

impl RuntimeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the SIGINT handler that trips the root cancellation flag.
    pub fn install_sigint_handler(&self) {
        use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
        let action = SigAction::new(
            SigHandler::Handler(on_sigint),
            SaFlags::empty(),
            SigSet::empty(),
        );
        unsafe {
            let _ = sigaction(Signal::SIGINT, &action);
        }
    }

    pub fn next_stream_id(&self) -> usize {
        self.stream_ids.fetch_add(1, Ordering::SeqCst)
    }

    /// Request cancellation programmatically (tests use this in place of a
    /// real SIGINT).
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    pub fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst) || SIGINT_RECEIVED.load(Ordering::SeqCst)
    }
}
