// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Stream construction: fork the test context for one `streams:` entry,
//! resolve its node/app/env references, synthesize temporary file paths,
//! render the macros and wire the full pipe tree (access chain → shell
//! wrapper → app + streamlets, parsers listening).

use crate::context::Context;
use crate::error::{Result, SweepError};
use crate::metrics::Metrics;
use crate::parser::parser_factory;
use crate::pipe::{
    pipe_factory, AppPipe, FileDelPipe, FileGenPipe, PipeKind, PipeListener, PipeNode, ShellWrap,
};
use crate::util::{mget, mget_str, random_suffix, sanitize_fname, time2sec, truthy};
use crate::RuntimeEnv;
use serde_yaml::{Mapping, Value};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// One runnable unit of an iteration.
pub struct Stream {
    pub name: String,
    pub delay: f64,
    pub timeout: Option<f64>,
    pub idle: Option<f64>,
    pub active: bool,
    pub iteration: usize,
    pub context: Context,
    pub pipe: Option<PipeNode>,
}

/// Fork and prepare the context a stream renders its macros in.
pub fn stream_context(context: &Context, specs: &Mapping, iteration: usize) -> Result<Context> {
    let mut context = context.fork();

    // One-based, so ${iteration} reads naturally in file names and args
    context.set("iteration", Value::from(iteration as u64 + 1));

    let node_name = mget_str(specs, "node")
        .ok_or_else(|| SweepError::spec("Stream is missing a 'node'"))?;
    let node = context
        .mapping(&format!("node.{}", node_name))
        .ok_or_else(|| {
            SweepError::spec(format!("Node '{}' was not defined in the specs", node_name))
        })?
        .clone();

    let app_name = mget_str(specs, "app")
        .ok_or_else(|| SweepError::spec("Stream is missing an 'app'"))?;
    let app = context
        .mapping(&format!("app.{}", app_name))
        .ok_or_else(|| {
            SweepError::spec(format!("App '{}' was not defined in the specs", app_name))
        })?
        .clone();

    let env = match mget_str(&app, "env") {
        Some(env_name) => Some(
            context
                .mapping(&format!("env.{}", env_name))
                .ok_or_else(|| {
                    SweepError::spec(format!("env '{}' was not defined in the specs", env_name))
                })?
                .clone(),
        ),
        None => None,
    };

    context.set("stream", Value::Mapping(specs.clone()));
    context.set("node", Value::Mapping(node.clone()));
    context.set("app", Value::Mapping(app.clone()));
    if let Some(env) = env {
        context.set("env", Value::Mapping(env.clone()));
        context.update(&env);
    }

    // Custom variable definitions, least specific first
    for source in [&node, &app, specs] {
        if let Some(defines) = mget(source, "define").and_then(Value::as_mapping) {
            context.update_defines(defines);
        }
    }

    // Files without an explicit path become temporaries
    if let Some(files) = context.sequence("app.files").cloned() {
        let mut updated = Vec::with_capacity(files.len());
        for file in files {
            let mut file_map = file
                .as_mapping()
                .ok_or_else(|| SweepError::spec("app 'files' entries must be mappings"))?
                .clone();
            let name = mget_str(&file_map, "name")
                .ok_or_else(|| SweepError::spec("file entry is missing a 'name'"))?
                .to_string();
            let temp = mget(&file_map, "path").is_none();
            if temp {
                let suffix = mget_str(&file_map, "suffix").unwrap_or(".tmp");
                let path = format!("/tmp/benchsweep.{}-{}{}", name, random_suffix(), suffix);
                file_map.insert(Value::from("path"), Value::from(path));
            }
            file_map.insert(Value::from("temp"), Value::from(temp));
            updated.push(Value::Mapping(file_map));
        }
        context.set("app.files", Value::Sequence(updated));
    }

    Ok(context.render())
}

impl Stream {
    /// Build a fully wired stream for one iteration. Inactive streams come
    /// back without a pipe and are skipped by the driver.
    pub fn configure(
        context: &Context,
        specs: &Mapping,
        metrics: &Arc<Metrics>,
        runtime: &RuntimeEnv,
        iteration: usize,
    ) -> Result<Stream> {
        let name = match mget_str(specs, "name") {
            Some(name) => name.to_string(),
            None => format!("stream_{}", runtime.next_stream_id()),
        };

        let delay = match mget(specs, "delay") {
            Some(v) => time2sec(v)?,
            None => 0.0,
        };
        let timeout = mget(specs, "timeout").map(time2sec).transpose()?;
        let idle = mget(specs, "idle").map(time2sec).transpose()?;

        let context = stream_context(context, specs, iteration)?;

        let active = context
            .get("stream.active")
            .map(truthy)
            .unwrap_or(true);
        let mut stream = Stream {
            name,
            delay,
            timeout,
            idle,
            active,
            iteration,
            context,
            pipe: None,
        };
        if !stream.active {
            debug!(stream = %stream.name, "Stream is inactive, skipping");
            return Ok(stream);
        }

        stream.build_pipes(specs, metrics)?;
        Ok(stream)
    }

    fn build_pipes(&mut self, specs: &Mapping, metrics: &Arc<Metrics>) -> Result<()> {
        let ctx = &self.context;

        let app_config = ctx
            .mapping("app")
            .ok_or_else(|| SweepError::spec("Stream context lost its 'app'"))?
            .clone();
        let mut app_pipe = PipeNode::new(PipeKind::App(AppPipe::configure(&app_config, ctx)?));

        if let Some(log) = self.open_log_pipe()? {
            app_pipe.listen(Box::new(log));
        }

        // App parsers
        let parser_names = parser_names(ctx, "app")?;
        if parser_names.is_empty() {
            return Err(SweepError::spec(format!(
                "It's required to define at least one parser on app '{}'",
                ctx.get_string("app.name").unwrap_or_default()
            )));
        }
        for parser_name in &parser_names {
            let parser = self.build_parser(ctx, parser_name, metrics)?;
            debug!(stream = %self.name, "Adding parser {} to app listeners", parser_name);
            app_pipe.listen(Box::new(parser));
        }

        let mut wrap = PipeNode::new(PipeKind::ShellWrap(ShellWrap::default()));
        wrap.plug(app_pipe);

        // Generated files run as pre-hooks, temporaries are deleted after
        if let Some(files) = ctx.sequence("app.files") {
            for file in files {
                let file_map = file
                    .as_mapping()
                    .ok_or_else(|| SweepError::spec("app 'files' entries must be mappings"))?;
                let gen = FileGenPipe::configure(file_map)?;
                let temp = mget(file_map, "temp").map(truthy).unwrap_or(false);
                let path = gen.path.clone();
                wrap.plug_pre(PipeNode::new(PipeKind::FileGen(gen)));
                if temp {
                    wrap.plug_post(PipeNode::new(PipeKind::FileDel(FileDelPipe::from_path(
                        path,
                    ))));
                }
            }
        }

        // Streamlets run as sibling fragments of the application
        if let Some(streamlets) = mget(specs, "streamlets").and_then(Value::as_sequence) {
            for entry in streamlets {
                self.plug_streamlet(entry, &mut wrap, metrics)?;
            }
        }

        // Access chain; later entries wrap earlier ones
        let node = ctx
            .mapping("node")
            .ok_or_else(|| SweepError::spec("Stream context lost its 'node'"))?;
        let access_list = mget(node, "access")
            .and_then(Value::as_sequence)
            .ok_or_else(|| {
                SweepError::spec("Required at least one access component on node specs")
            })?;
        let mut pipe = wrap;
        for access in access_list {
            let access_map = access
                .as_mapping()
                .ok_or_else(|| SweepError::spec("node 'access' entries must be mappings"))?;
            let mut merged = node.clone();
            for (k, v) in access_map {
                merged.insert(k.clone(), v.clone());
            }
            let mut access_pipe = pipe_factory(&merged, ctx)?;
            access_pipe.plug(pipe);
            pipe = access_pipe;
        }

        self.pipe = Some(pipe);
        Ok(())
    }

    fn plug_streamlet(
        &self,
        entry: &Value,
        wrap: &mut PipeNode,
        metrics: &Arc<Metrics>,
    ) -> Result<()> {
        // A bare string is shorthand for {streamlet: <name>}
        let entry_map: Mapping = match entry {
            Value::String(name) => {
                let mut map = Mapping::new();
                map.insert(Value::from("streamlet"), Value::from(name.as_str()));
                map
            }
            Value::Mapping(map) => map.clone(),
            _ => {
                return Err(SweepError::spec(format!(
                    "Missing 'streamlet' keyword in specs of stream '{}'",
                    self.name
                )))
            }
        };
        let streamlet_name = mget_str(&entry_map, "streamlet")
            .ok_or_else(|| {
                SweepError::spec(format!(
                    "Missing 'streamlet' keyword in specs of stream '{}'",
                    self.name
                ))
            })?
            .to_string();

        let definition = self
            .context
            .mapping(&format!("streamlet.{}", streamlet_name))
            .ok_or_else(|| {
                SweepError::spec(format!(
                    "Streamlet '{}' was not defined in specs",
                    streamlet_name
                ))
            })?;

        // Merge the definition with the per-stream overrides and re-render
        // in a forked context, so ${streamlet.*} reaches the merged view
        let mut merged = definition.clone();
        for (k, v) in &entry_map {
            merged.insert(k.clone(), v.clone());
        }
        if mget(&merged, "class").is_none() {
            merged.insert(Value::from("class"), Value::from("script"));
        }
        let mut streamlet_ctx = self.context.fork();
        streamlet_ctx.set("streamlet", Value::Mapping(merged));
        let streamlet_ctx = streamlet_ctx.render();
        let config = streamlet_ctx
            .mapping("streamlet")
            .ok_or_else(|| SweepError::spec("Streamlet context lost its definition"))?
            .clone();

        let mut pipe = pipe_factory(&config, &streamlet_ctx)?;
        debug!(stream = %self.name, "Adding streamlet {}", streamlet_name);

        for parser_name in parser_names(&streamlet_ctx, "streamlet")? {
            let mut parser = self.build_parser(&streamlet_ctx, &parser_name, metrics)?;
            // Streamlet-level alias/filter stack on top of the stream's
            if let Some(alias) = streamlet_ctx.mapping("streamlet.alias") {
                parser.set_alias(alias);
            }
            if let Some(filter) = streamlet_ctx.get("streamlet.filter") {
                parser.set_filter(filter);
            }
            debug!(stream = %self.name, "Adding parser {} to streamlet listeners", parser_name);
            pipe.listen(Box::new(parser));
        }

        wrap.plug(pipe);
        Ok(())
    }

    fn build_parser(
        &self,
        ctx: &Context,
        parser_name: &str,
        metrics: &Arc<Metrics>,
    ) -> Result<crate::parser::Parser> {
        let config = ctx
            .mapping(&format!("parser.{}", parser_name))
            .ok_or_else(|| {
                SweepError::spec(format!(
                    "Parser '{}' was not defined in the specs",
                    parser_name
                ))
            })?;
        let mut parser = parser_factory(config, metrics.clone())?;
        if let Some(alias) = ctx.mapping("stream.alias") {
            debug!(stream = %self.name, "Adding alias mapping to {}", parser_name);
            parser.set_alias(alias);
        }
        if let Some(filter) = ctx.get("stream.filter") {
            debug!(stream = %self.name, "Adding metrics filter to {}", parser_name);
            parser.set_filter(filter);
        }
        Ok(parser)
    }

    /// Capture the stream's demuxed stdout to a log file when
    /// `report.keep_output` asks for it.
    fn open_log_pipe(&self) -> Result<Option<LogPipe>> {
        let keep = match self.context.get_string("report.keep_output") {
            Some(keep) if !keep.is_empty() => keep,
            _ => return Ok(None),
        };

        let testval = self
            .context
            .curr_values()
            .iter()
            .map(|(k, v)| format!("{}-{}", k, sanitize_fname(v)))
            .collect::<Vec<_>>()
            .join("+");
        let filename = format!("out-{}-{}-{}.log", self.name, testval, self.iteration + 1);

        let mut basedir = PathBuf::from(keep);
        basedir.push(format!(
            "{}-{}",
            self.context.get_string("report.name").unwrap_or_else(|| "test".to_string()),
            self.context.get_string("report.timestamp").unwrap_or_default()
        ));
        std::fs::create_dir_all(&basedir)
            .map_err(|e| SweepError::spec(format!("Cannot create {}: {}", basedir.display(), e)))?;

        let path = basedir.join(filename);
        info!(stream = %self.name, "Logging stdout to {}", path.display());
        let file = std::fs::File::create(&path)
            .map_err(|e| SweepError::spec(format!("Cannot create {}: {}", path.display(), e)))?;
        Ok(Some(LogPipe { file }))
    }
}

fn parser_names(ctx: &Context, owner: &str) -> Result<Vec<String>> {
    if let Some(name) = ctx.get_string(&format!("{}.parser", owner)) {
        return Ok(vec![name]);
    }
    if let Some(names) = ctx.sequence(&format!("{}.parsers", owner)) {
        return Ok(names
            .iter()
            .filter_map(|v| v.as_str().map(str::to_string))
            .collect());
    }
    Ok(Vec::new())
}

/// Mirrors a pipe's stdout lines into a file.
pub struct LogPipe {
    file: std::fs::File,
}

impl PipeListener for LogPipe {
    fn on_stdout(&mut self, line: &str) -> anyhow::Result<()> {
        writeln!(self.file, "{}", line)?;
        Ok(())
    }

    fn on_eof(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_context() -> Context {
        let mut ctx = Context::new();
        ctx.set(
            "node",
            serde_yaml::from_str("[{name: local, host: localhost, access: [{class: local}]}]")
                .unwrap(),
        );
        ctx.set(
            "app",
            serde_yaml::from_str(
                "{echo: {name: echo, binary: /bin/echo, args: ['hello ${curr.n|world}'], parser: greet}}",
            )
            .unwrap(),
        );
        ctx.set(
            "parser",
            serde_yaml::from_str("{greet: {class: regex, match: ['(?P<greeting>\\w+)']}}").unwrap(),
        );
        ctx
    }

    fn specs(yaml: &str) -> Mapping {
        serde_yaml::from_str(yaml).unwrap()
    }

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::new())
    }

    #[test]
    fn builds_the_access_chain_around_the_wrapper() {
        let runtime = RuntimeEnv::new();
        let stream = Stream::configure(
            &base_context(),
            &specs("{node: local, app: echo}"),
            &metrics(),
            &runtime,
            0,
        )
        .unwrap();
        assert!(stream.active);
        let cmdline = stream.pipe.as_ref().unwrap().cmdline();
        assert_eq!(cmdline[0], "/bin/bash");
        assert_eq!(cmdline[2], "/usr/bin/stdbuf");
        let program = stream.pipe.as_ref().unwrap().stdin();
        assert!(program.contains("/bin/echo"));
    }

    #[test]
    fn stream_names_are_unique_by_default() {
        let runtime = RuntimeEnv::new();
        let s1 = Stream::configure(
            &base_context(),
            &specs("{node: local, app: echo}"),
            &metrics(),
            &runtime,
            0,
        )
        .unwrap();
        let s2 = Stream::configure(
            &base_context(),
            &specs("{node: local, app: echo}"),
            &metrics(),
            &runtime,
            0,
        )
        .unwrap();
        assert_ne!(s1.name, s2.name);
    }

    #[test]
    fn inactive_streams_have_no_pipe() {
        let runtime = RuntimeEnv::new();
        let stream = Stream::configure(
            &base_context(),
            &specs("{node: local, app: echo, active: false}"),
            &metrics(),
            &runtime,
            0,
        )
        .unwrap();
        assert!(!stream.active);
        assert!(stream.pipe.is_none());
        let stream = Stream::configure(
            &base_context(),
            &specs("{node: local, app: echo, active: 'no'}"),
            &metrics(),
            &runtime,
            0,
        )
        .unwrap();
        assert!(!stream.active);
    }

    #[test]
    fn undefined_references_are_spec_errors() {
        let runtime = RuntimeEnv::new();
        assert!(Stream::configure(
            &base_context(),
            &specs("{node: mars, app: echo}"),
            &metrics(),
            &runtime,
            0
        )
        .is_err());
        assert!(Stream::configure(
            &base_context(),
            &specs("{node: local, app: missing}"),
            &metrics(),
            &runtime,
            0
        )
        .is_err());
    }

    #[test]
    fn time_specs_are_parsed() {
        let runtime = RuntimeEnv::new();
        let stream = Stream::configure(
            &base_context(),
            &specs("{node: local, app: echo, delay: 1s, timeout: 2m, idle: 30}"),
            &metrics(),
            &runtime,
            0,
        )
        .unwrap();
        assert_eq!(stream.delay, 1.0);
        assert_eq!(stream.timeout, Some(120.0));
        assert_eq!(stream.idle, Some(30.0));
    }

    #[test]
    fn files_without_paths_become_temporaries() {
        let mut ctx = base_context();
        ctx.set(
            "app",
            serde_yaml::from_str(
                "{gen: {name: gen, binary: /bin/cat, parser: greet, files: [{name: cfg, contents: 'x=1', suffix: .cfg}, {name: fixed, path: /etc/motd, contents: ''}]}}",
            )
            .unwrap(),
        );
        let rendered = stream_context(&ctx, &specs("{node: local, app: gen}"), 0).unwrap();
        let path = rendered.get_string("app.files.cfg.path").unwrap();
        assert!(path.starts_with("/tmp/benchsweep.cfg-"));
        assert!(path.ends_with(".cfg"));
        assert_eq!(rendered.get("app.files.cfg.temp"), Some(&Value::from(true)));
        assert_eq!(
            rendered.get_string("app.files.fixed.path").as_deref(),
            Some("/etc/motd")
        );
        assert_eq!(
            rendered.get("app.files.fixed.temp"),
            Some(&Value::from(false))
        );
    }

    #[test]
    fn test_case_variables_reach_the_cmdline() {
        let mut ctx = base_context();
        ctx.set("curr", serde_yaml::from_str("{n: mars}").unwrap());
        let stream = Stream::configure(
            &ctx,
            &specs("{node: local, app: echo}"),
            &metrics(),
            &RuntimeEnv::new(),
            0,
        )
        .unwrap();
        let program = stream.pipe.as_ref().unwrap().stdin();
        assert!(program.contains("hello mars"));
    }
}
