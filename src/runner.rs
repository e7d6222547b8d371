// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! The per-stream supervisor task: spawn the composed pipe program under a
//! pty, run the expect protocol, extract lines, dispatch them into the
//! pipe tree, enforce timeouts and execute the interrupt protocol.

use crate::error::SweepError;
use crate::pipe::{ExpectRule, PipeNode};
use crate::pty::{PtyProcess, PtyRead};
use crate::stream::Stream;
use crate::util::fmt_secs;
use anyhow::{anyhow, Result};
use async_std::task::{self, sleep, JoinHandle};
use nix::sys::signal::Signal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Poll cadence of every wait loop in the supervisor.
const TICK: Duration = Duration::from_millis(100);
/// How long a SIGINT gets before escalating to SIGTERM.
const SIGINT_GRACE: Duration = Duration::from_secs(5);
const READ_CHUNK: usize = 4096;
/// End-of-transmission, terminates the stdin payload on the tty.
const EOT: &[u8] = b"\x04";

/// Shared view of one running stream, polled by the driver.
pub struct StreamState {
    pub name: String,
    alive: AtomicBool,
    interrupted: AtomicBool,
    reason: Mutex<Option<String>>,
    returncode: Mutex<Option<i32>>,
}

impl StreamState {
    fn new(name: String) -> StreamState {
        StreamState {
            name,
            alive: AtomicBool::new(true),
            interrupted: AtomicBool::new(false),
            reason: Mutex::new(None),
            returncode: Mutex::new(None),
        }
    }

    pub fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    pub fn interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    pub fn reason(&self) -> Option<String> {
        self.reason.lock().unwrap().clone()
    }

    pub fn returncode(&self) -> Option<i32> {
        *self.returncode.lock().unwrap()
    }

    /// Raise the interrupt flag. Set-once: the first reason sticks, later
    /// calls are no-ops.
    pub fn trigger(&self, reason: impl Into<String>) {
        if !self.interrupted.swap(true, Ordering::SeqCst) {
            *self.reason.lock().unwrap() = Some(reason.into());
        }
    }

    fn set_returncode(&self, code: i32) {
        *self.returncode.lock().unwrap() = Some(code);
    }
}

pub struct StreamRunner {
    stream: Stream,
    state: Arc<StreamState>,
}

impl StreamRunner {
    /// Start the supervisor task for a configured stream.
    pub fn spawn(stream: Stream) -> (Arc<StreamState>, JoinHandle<()>) {
        let state = Arc::new(StreamState::new(stream.name.clone()));
        let runner = StreamRunner {
            stream,
            state: state.clone(),
        };
        let handle = task::spawn(runner.run());
        (state, handle)
    }

    async fn run(mut self) {
        if let Err(e) = self.supervise().await {
            error!(stream = %self.state.name, "{}", e);
            self.state.trigger(e.to_string());
            self.state.set_returncode(-1);
        }
        self.state.alive.store(false, Ordering::SeqCst);
    }

    async fn supervise(&mut self) -> Result<()> {
        let name = self.state.name.clone();

        if self.stream.delay > 0.0 {
            info!(stream = %name, "Delaying for {} seconds", fmt_secs(self.stream.delay));
            let until = Instant::now() + Duration::from_secs_f64(self.stream.delay);
            while Instant::now() < until {
                if self.state.interrupted() {
                    return Ok(());
                }
                sleep(TICK).await;
            }
        }
        if self.state.interrupted() {
            return Ok(());
        }

        let mut pipe = self
            .stream
            .pipe
            .take()
            .ok_or_else(|| anyhow!("Stream '{}' has no pipe", name))?;

        let cmdline = pipe.cmdline();
        debug!(stream = %name, "Process starting {:?}", cmdline);
        let mut proc = PtyProcess::spawn(&cmdline)?;

        let mut expect_out = pipe.expect_stdout()?;
        let mut expect_err = pipe.expect_stderr()?;
        let mut stdin_sent = false;
        if expect_out.is_empty() && expect_err.is_empty() {
            debug!(stream = %name, "Sending stdin payload");
            if let Err(e) = send_stdin(&mut proc, &pipe) {
                self.interrupt(e.to_string(), &mut proc, &mut pipe).await;
                return Ok(());
            }
            stdin_sent = true;
        }

        let start = Instant::now();
        let mut last_activity = Instant::now();
        let mut last_read = Instant::now();
        let mut buffer: Vec<u8> = Vec::new();
        let exit_code;

        debug!(stream = %name, "Processing output");
        loop {
            if self.state.interrupted() {
                self.shutdown(&mut proc, &mut pipe).await;
                return Ok(());
            }

            // Drain whatever the child produced since the last tick
            let mut chunk = [0u8; READ_CHUNK];
            loop {
                match proc.read(&mut chunk) {
                    Ok(PtyRead::Data(n)) => {
                        last_read = Instant::now();
                        buffer.extend_from_slice(&chunk[..n]);
                        if let Err(e) = self.drain_lines(
                            &mut buffer,
                            &mut proc,
                            &mut pipe,
                            &mut expect_out,
                            &mut expect_err,
                            &mut stdin_sent,
                            &mut last_activity,
                        ) {
                            error!(stream = %name, "{}", e);
                            self.interrupt(e.to_string(), &mut proc, &mut pipe).await;
                            return Ok(());
                        }
                        if n < READ_CHUNK {
                            break;
                        }
                    }
                    Ok(PtyRead::WouldBlock) | Ok(PtyRead::Eof) => break,
                    Err(e) => {
                        self.interrupt(e.to_string(), &mut proc, &mut pipe).await;
                        return Ok(());
                    }
                }
            }

            // A partial line that sat for a whole tick is flushed as if it
            // were complete, so prompts without a newline still match
            if !buffer.is_empty() && last_read.elapsed() >= TICK {
                let text = String::from_utf8_lossy(&buffer).into_owned();
                buffer.clear();
                if let Err(e) = self.handle_line(
                    &text,
                    &mut proc,
                    &mut pipe,
                    &mut expect_out,
                    &mut expect_err,
                    &mut stdin_sent,
                    &mut last_activity,
                ) {
                    error!(stream = %name, "{}", e);
                    self.interrupt(e.to_string(), &mut proc, &mut pipe).await;
                    return Ok(());
                }
            }

            if let Some(code) = proc.poll() {
                debug!(stream = %name, "Process exited with code {}", code);
                exit_code = code;
                break;
            }

            if let Some(timeout) = self.stream.timeout {
                if start.elapsed() >= Duration::from_secs_f64(timeout) {
                    self.interrupt(
                        SweepError::Timeout(timeout).to_string(),
                        &mut proc,
                        &mut pipe,
                    )
                    .await;
                    return Ok(());
                }
            }
            if let Some(idle) = self.stream.idle {
                if last_activity.elapsed() >= Duration::from_secs_f64(idle) {
                    self.interrupt(SweepError::Idle(idle).to_string(), &mut proc, &mut pipe)
                        .await;
                    return Ok(());
                }
            }

            sleep(TICK).await;
        }

        // Whatever is left in the buffer counts as a final line
        if !buffer.is_empty() {
            let text = String::from_utf8_lossy(&buffer).into_owned();
            buffer.clear();
            let _ = self.handle_line(
                &text,
                &mut proc,
                &mut pipe,
                &mut expect_out,
                &mut expect_err,
                &mut stdin_sent,
                &mut last_activity,
            );
        }

        if let Err(e) = pipe.on_close() {
            debug!(stream = %name, "Error while closing the pipe tree: {}", e);
        }
        proc.close();
        self.state.set_returncode(exit_code);
        if exit_code > 0 {
            warn!(stream = %name, "Stream exited with code={}", exit_code);
        } else {
            debug!(stream = %name, "Stream exited");
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn drain_lines(
        &self,
        buffer: &mut Vec<u8>,
        proc: &mut PtyProcess,
        pipe: &mut PipeNode,
        expect_out: &mut Vec<ExpectRule>,
        expect_err: &mut Vec<ExpectRule>,
        stdin_sent: &mut bool,
        last_activity: &mut Instant,
    ) -> Result<()> {
        while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
            let line_bytes: Vec<u8> = buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();
            self.handle_line(
                &line,
                proc,
                pipe,
                expect_out,
                expect_err,
                stdin_sent,
                last_activity,
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn handle_line(
        &self,
        raw: &str,
        proc: &mut PtyProcess,
        pipe: &mut PipeNode,
        expect_out: &mut Vec<ExpectRule>,
        expect_err: &mut Vec<ExpectRule>,
        stdin_sent: &mut bool,
        last_activity: &mut Instant,
    ) -> Result<()> {
        *last_activity = Instant::now();
        let line = raw.replace('\r', "");
        if line.trim().is_empty() {
            return Ok(());
        }
        debug!(stream = %self.state.name, "OUT: {}", line);

        let handled = scan_expect(expect_out, &line, &mut |reply| {
            proc.write_all(reply.as_bytes())
        })?;
        if !handled {
            pipe.on_stdout(&line)?;
        }

        // Once every expect rule is consumed the child gets its stdin
        if !*stdin_sent && expect_out.is_empty() && expect_err.is_empty() {
            debug!(stream = %self.state.name, "No more expects left, sending stdin payload");
            send_stdin(proc, pipe)?;
            *stdin_sent = true;
        }
        Ok(())
    }

    /// The interrupt protocol: record the reason, then collapse the child.
    async fn interrupt(&self, reason: String, proc: &mut PtyProcess, pipe: &mut PipeNode) {
        self.state.trigger(reason);
        self.shutdown(proc, pipe).await;
    }

    /// SIGINT, up to five seconds of grace, then SIGTERM. Closes the fd
    /// and records the forced exit code.
    async fn shutdown(&self, proc: &mut PtyProcess, pipe: &mut PipeNode) {
        let name = &self.state.name;
        proc.send_signal(Signal::SIGINT);
        let deadline = Instant::now() + SIGINT_GRACE;
        loop {
            if proc.poll().is_some() {
                warn!(stream = %name, "Stream interrupted");
                break;
            }
            if Instant::now() >= deadline {
                proc.terminate();
                warn!(stream = %name, "Stream terminated");
                break;
            }
            sleep(TICK).await;
        }
        if let Err(e) = pipe.on_close() {
            debug!(stream = %name, "Error while closing the pipe tree: {}", e);
        }
        proc.close();
        self.state.set_returncode(-1);
    }
}

fn send_stdin(proc: &mut PtyProcess, pipe: &PipeNode) -> Result<()> {
    proc.write_all(pipe.stdin().as_bytes())?;
    proc.write_all(EOT)?;
    Ok(())
}

/// Apply the expect rules to one line, in order, first match wins. Replies
/// go through `write`. Returns whether the line was consumed; unconsumed
/// lines belong to the pipe tree.
fn scan_expect(
    rules: &mut Vec<ExpectRule>,
    line: &str,
    write: &mut dyn FnMut(&str) -> Result<()>,
) -> Result<bool> {
    let mut i = 0;
    while i < rules.len() {
        match rules[i].feed(line) {
            Some(outcome) => {
                if let Some(err) = outcome.error {
                    return Err(err.into());
                }
                if let Some(reply) = outcome.reply {
                    debug!("Expect matched /{}/ on stdout", rules[i].pattern());
                    write(&reply)?;
                }
                let consumed = outcome.handled;
                if outcome.remove {
                    rules.remove(i);
                } else {
                    i += 1;
                }
                if consumed {
                    return Ok(true);
                }
            }
            None => i += 1,
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::access::password_rule;
    use crate::pipe::ExpectRule;

    fn collect_writes(
        rules: &mut Vec<ExpectRule>,
        lines: &[&str],
    ) -> Result<(Vec<String>, Vec<bool>)> {
        let mut written = Vec::new();
        let mut consumed = Vec::new();
        for line in lines {
            let handled = scan_expect(rules, line, &mut |reply| {
                written.push(reply.to_string());
                Ok(())
            })?;
            consumed.push(handled);
        }
        Ok((written, consumed))
    }

    #[test]
    fn password_prompt_is_answered_then_rule_retires() {
        let mut rules = vec![password_rule("farm01".into(), "secret".into()).unwrap()];
        let (written, consumed) = collect_writes(
            &mut rules,
            &["Password:", "Linux farm01 6.1.0", "val=1", "Password: imposter"],
        )
        .unwrap();
        // exactly one authentication reply
        assert_eq!(written, vec!["secret\r\n\r\n"]);
        // the prompt is consumed, everything after flows to the parsers
        assert_eq!(consumed, vec![true, false, false, false]);
        assert!(rules.is_empty());
    }

    #[test]
    fn wrong_password_aborts_the_stream() {
        let mut rules = vec![password_rule("farm01".into(), "wrong".into()).unwrap()];
        let result = collect_writes(&mut rules, &["Password:", "Password:"]);
        assert!(result.is_err());
    }

    #[test]
    fn first_matching_rule_wins() {
        let mut rules = vec![
            ExpectRule::send("continue", "yes\n").unwrap(),
            ExpectRule::send("continue anyway", "no\n").unwrap(),
        ];
        let (written, _) = collect_writes(&mut rules, &["continue anyway?"]).unwrap();
        assert_eq!(written, vec!["yes\n"]);
        // the losing rule is still armed
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].pattern(), "continue anyway");
    }

    #[test]
    fn chained_gateway_prompt_falls_through_to_the_next_rule() {
        let mut rules = vec![
            password_rule("gateway".into(), "outer".into()).unwrap(),
            password_rule("inner".into(), "inner-pw".into()).unwrap(),
        ];
        let (written, _) = collect_writes(
            &mut rules,
            &["gateway password:", "inner password:", "motd"],
        )
        .unwrap();
        // the gateway answers its prompt; the inner hop's different prompt
        // retires the gateway rule and is answered by the inner rule
        assert_eq!(written, vec!["outer\r\n\r\n", "inner-pw\r\n\r\n"]);
    }

    #[test]
    fn stream_state_trigger_is_set_once() {
        let state = StreamState::new("s".into());
        state.trigger("first");
        state.trigger("second");
        assert!(state.interrupted());
        assert_eq!(state.reason().as_deref(), Some("first"));
    }
}
