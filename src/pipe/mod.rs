// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! The declarative pipe composition tree.
//!
//! A pipe node contributes up to four things to the program a stream
//! eventually runs: a command-line fragment, stdin text, and expect rules
//! for stdout/stderr. In the other direction it receives the demultiplexed
//! output lines that belong to it. Nodes own their children; listeners
//! (parsers, output logs) observe a node's lines without consuming them.

pub mod access;
pub mod app;
pub mod script;
pub mod shellwrap;

pub use access::SshAccess;
pub use app::AppPipe;
pub use script::{FileDelPipe, FileGenPipe, ScriptPipe};
pub use shellwrap::ShellWrap;

use crate::context::Context;
use crate::error::{Result, SweepError};
use crate::util::mget_str;
use regex_lite::Regex;
use serde_yaml::Mapping;

/// Observer of a pipe's demultiplexed output. Errors abort the stream
/// through the read loop's interrupt path.
pub trait PipeListener: Send + Sync {
    fn on_stdout(&mut self, _line: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_stderr(&mut self, _line: &str) -> anyhow::Result<()> {
        Ok(())
    }
    fn on_eof(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What an expect rule decided about a line.
#[derive(Default)]
pub struct ExpectOutcome {
    /// Bytes to write back into the tty.
    pub reply: Option<String>,
    /// Drop the rule from the active set.
    pub remove: bool,
    /// The line was consumed; stop scanning rules and skip parser delivery.
    pub handled: bool,
    /// Abort the stream.
    pub error: Option<SweepError>,
}

impl ExpectOutcome {
    pub fn ignored() -> ExpectOutcome {
        ExpectOutcome::default()
    }
}

type ExpectCallback = Box<dyn FnMut(&str, bool) -> ExpectOutcome + Send>;

enum ExpectAction {
    Send(String),
    Call(ExpectCallback),
}

/// A regex-plus-action automaton watching the tty output. Rules with
/// `call_always` run their callback on every line, matched or not.
pub struct ExpectRule {
    pattern: Regex,
    repr: String,
    call_always: bool,
    repeat: bool,
    action: ExpectAction,
}

impl ExpectRule {
    pub fn send(pattern: &str, reply: impl Into<String>) -> Result<ExpectRule> {
        Self::build(pattern, false, false, ExpectAction::Send(reply.into()))
    }

    pub fn send_repeating(pattern: &str, reply: impl Into<String>) -> Result<ExpectRule> {
        Self::build(pattern, false, true, ExpectAction::Send(reply.into()))
    }

    pub fn call(
        pattern: &str,
        call_always: bool,
        callback: impl FnMut(&str, bool) -> ExpectOutcome + Send + 'static,
    ) -> Result<ExpectRule> {
        Self::build(pattern, call_always, false, ExpectAction::Call(Box::new(callback)))
    }

    fn build(
        pattern: &str,
        call_always: bool,
        repeat: bool,
        action: ExpectAction,
    ) -> Result<ExpectRule> {
        Ok(ExpectRule {
            pattern: Regex::new(pattern)
                .map_err(|e| SweepError::spec(format!("Bad expect pattern '{}': {}", pattern, e)))?,
            repr: pattern.to_string(),
            call_always,
            repeat,
            action,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.repr
    }

    /// Apply the rule to a line. `None` means the rule did not engage at
    /// all; an outcome may still be inert for `call_always` rules.
    pub fn feed(&mut self, line: &str) -> Option<ExpectOutcome> {
        let matched = self.pattern.is_match(line);
        if !matched && !self.call_always {
            return None;
        }
        match &mut self.action {
            ExpectAction::Send(reply) => {
                if matched {
                    Some(ExpectOutcome {
                        reply: Some(reply.clone()),
                        remove: !self.repeat,
                        handled: true,
                        error: None,
                    })
                } else {
                    Some(ExpectOutcome::ignored())
                }
            }
            ExpectAction::Call(callback) => Some(callback(line, matched)),
        }
    }
}

/// The node variants of the composition tree.
pub enum PipeKind {
    /// Pass-through to a local shell.
    LocalAccess,
    /// Tunnel through the system ssh client.
    SshAccess(SshAccess),
    /// The bash multiplexer running its children in parallel.
    ShellWrap(ShellWrap),
    /// The benchmarked application.
    App(AppPipe),
    /// An opaque shell fragment.
    Script(ScriptPipe),
    /// Writes a file through a heredoc before the run.
    FileGen(FileGenPipe),
    /// Deletes a file after the run.
    FileDel(FileDelPipe),
}

pub struct PipeNode {
    kind: PipeKind,
    children: Vec<PipeNode>,
    listeners: Vec<Box<dyn PipeListener>>,
}

impl PipeNode {
    pub fn new(kind: PipeKind) -> PipeNode {
        PipeNode {
            kind,
            children: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Plug a child pipe; the node takes ownership.
    pub fn plug(&mut self, child: PipeNode) {
        self.children.push(child);
    }

    /// Attach an output observer.
    pub fn listen(&mut self, listener: Box<dyn PipeListener>) {
        self.listeners.push(listener);
    }

    /// Plug a pre-hook fragment; only meaningful on the shell wrapper.
    pub fn plug_pre(&mut self, child: PipeNode) {
        match &mut self.kind {
            PipeKind::ShellWrap(wrap) => wrap.pre.push(child),
            _ => debug_assert!(false, "plug_pre on a non-wrapper pipe"),
        }
    }

    /// Plug a post-hook fragment; only meaningful on the shell wrapper.
    pub fn plug_post(&mut self, child: PipeNode) {
        match &mut self.kind {
            PipeKind::ShellWrap(wrap) => wrap.post.push(child),
            _ => debug_assert!(false, "plug_post on a non-wrapper pipe"),
        }
    }

    pub fn children(&self) -> &[PipeNode] {
        &self.children
    }

    fn children_cmdline(&self) -> Vec<String> {
        self.children.iter().flat_map(|c| c.cmdline()).collect()
    }

    /// The argv this node contributes, children appended in order.
    pub fn cmdline(&self) -> Vec<String> {
        match &self.kind {
            PipeKind::LocalAccess => {
                let mut args = vec!["/bin/bash".to_string(), "/dev/stdin".to_string()];
                args.extend(self.children_cmdline());
                args
            }
            PipeKind::SshAccess(ssh) => {
                let mut args = ssh.base_cmdline();
                args.extend(self.children_cmdline());
                args
            }
            PipeKind::ShellWrap(_) => shellwrap::wrapper_cmdline(),
            PipeKind::App(app) => {
                let mut args = app.cmdline();
                args.extend(self.children_cmdline());
                args
            }
            PipeKind::Script(script) => script.cmdline(),
            PipeKind::FileGen(gen) => gen.cmdline(),
            PipeKind::FileDel(del) => del.cmdline(),
        }
    }

    /// The stdin payload this node contributes, children appended in order.
    pub fn stdin(&self) -> String {
        match &self.kind {
            PipeKind::ShellWrap(wrap) => shellwrap::compose_program(wrap, &self.children),
            PipeKind::App(app) => {
                let mut text = app.stdin_payload().to_string();
                for child in &self.children {
                    text.push_str(&child.stdin());
                }
                text
            }
            _ => self.children.iter().map(|c| c.stdin()).collect(),
        }
    }

    /// Expect rules to install on stdout, in tree order.
    pub fn expect_stdout(&self) -> Result<Vec<ExpectRule>> {
        let mut rules = match &self.kind {
            PipeKind::SshAccess(ssh) => ssh.expect_rules()?,
            _ => Vec::new(),
        };
        for child in &self.children {
            rules.extend(child.expect_stdout()?);
        }
        Ok(rules)
    }

    pub fn expect_stderr(&self) -> Result<Vec<ExpectRule>> {
        let mut rules = Vec::new();
        for child in &self.children {
            rules.extend(child.expect_stderr()?);
        }
        Ok(rules)
    }

    /// Deliver one stdout line: listeners first, then dispatch. The shell
    /// wrapper routes by protocol tag instead of broadcasting.
    pub fn on_stdout(&mut self, line: &str) -> anyhow::Result<()> {
        for listener in &mut self.listeners {
            listener.on_stdout(line)?;
        }
        if matches!(self.kind, PipeKind::ShellWrap(_)) {
            return shellwrap::demux(&mut self.children, line);
        }
        for child in &mut self.children {
            child.on_stdout(line)?;
        }
        Ok(())
    }

    pub fn on_stderr(&mut self, line: &str) -> anyhow::Result<()> {
        for listener in &mut self.listeners {
            listener.on_stderr(line)?;
        }
        for child in &mut self.children {
            child.on_stderr(line)?;
        }
        Ok(())
    }

    /// End of stream: notify listeners and children.
    pub fn on_close(&mut self) -> anyhow::Result<()> {
        for listener in &mut self.listeners {
            listener.on_eof()?;
        }
        for child in &mut self.children {
            child.on_close()?;
        }
        Ok(())
    }
}

/// Instantiate a pipe node by class name.
pub fn pipe_factory(specs: &Mapping, context: &Context) -> Result<PipeNode> {
    let class = mget_str(specs, "class")
        .ok_or_else(|| SweepError::spec("Pipe specs are missing a 'class'"))?;
    let kind = match class {
        "local" | "access/local" => PipeKind::LocalAccess,
        "ssh" | "access/ssh" => PipeKind::SshAccess(SshAccess::configure(specs, context)?),
        "shell-wrapper" => PipeKind::ShellWrap(ShellWrap::default()),
        "app" => PipeKind::App(AppPipe::configure(specs, context)?),
        "script" => PipeKind::Script(ScriptPipe::configure(specs)?),
        "file-gen" => PipeKind::FileGen(FileGenPipe::configure(specs)?),
        "file-del" => PipeKind::FileDel(FileDelPipe::configure(specs)?),
        other => {
            return Err(SweepError::spec(format!("Unknown pipe class '{}'", other)));
        }
    };
    Ok(PipeNode::new(kind))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_rule_fires_once() {
        let mut rule = ExpectRule::send("[Pp]assword:", "hunter2\r\n").unwrap();
        assert!(rule.feed("no prompt here").is_none());
        let out = rule.feed("Password:").unwrap();
        assert_eq!(out.reply.as_deref(), Some("hunter2\r\n"));
        assert!(out.remove);
        assert!(out.handled);
    }

    #[test]
    fn repeating_rule_stays_alive() {
        let mut rule = ExpectRule::send_repeating("again", "y\n").unwrap();
        let out = rule.feed("again and again").unwrap();
        assert!(!out.remove);
    }

    #[test]
    fn call_always_fires_on_mismatch() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let mut rule = ExpectRule::call("prompt", true, move |_line, matched| {
            counter.fetch_add(1, Ordering::SeqCst);
            if matched {
                ExpectOutcome {
                    handled: true,
                    ..ExpectOutcome::default()
                }
            } else {
                ExpectOutcome::ignored()
            }
        })
        .unwrap();
        assert!(!rule.feed("anything").unwrap().handled);
        assert!(rule.feed("prompt").unwrap().handled);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn local_access_prefixes_bash() {
        let mut access = PipeNode::new(PipeKind::LocalAccess);
        let mut wrap = PipeNode::new(PipeKind::ShellWrap(ShellWrap::default()));
        wrap.plug(PipeNode::new(PipeKind::Script(
            ScriptPipe::from_script("true"),
        )));
        access.plug(wrap);
        let cmdline = access.cmdline();
        assert_eq!(cmdline[0], "/bin/bash");
        assert_eq!(cmdline[1], "/dev/stdin");
        assert_eq!(cmdline[2], "/usr/bin/stdbuf");
    }

    #[test]
    fn factory_rejects_unknown_classes() {
        let specs: Mapping = serde_yaml::from_str("{class: carrier-pigeon}").unwrap();
        assert!(pipe_factory(&specs, &Context::new()).is_err());
    }
}
