// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! The shell wrapper compiles every child pipe into one bash program that
//! runs them in parallel, each with its stdout and stderr piped through
//! `awk` so every line carries a `::<i>::` routing prefix. The combined,
//! interleaved pty stream stays demultiplexable that way.
//!
//! The program waits on the *first* child specifically; when it exits the
//! rest are collapsed through the interrupt trap and its status becomes the
//! program's status.

use crate::pipe::PipeNode;
use anyhow::Result;
use crate::util::random_marker;
use tracing::{debug, error, info, warn};

/// Line-buffered stdio is required for prompt demultiplexing.
pub fn wrapper_cmdline() -> Vec<String> {
    ["/usr/bin/stdbuf", "-oL", "-eL", "/bin/bash", "/dev/stdin"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// The bash wrapper node state: hook fragments that run serially before
/// (after) the parallel children.
#[derive(Default)]
pub struct ShellWrap {
    pub(crate) pre: Vec<PipeNode>,
    pub(crate) post: Vec<PipeNode>,
}

/// Render a child's cmdline to a shell fragment. An `eval` cmdline is
/// already shell text; anything else gets quoted argv-style.
fn render_fragment(node: &PipeNode) -> String {
    let cmdline = node.cmdline();
    let mut script = if cmdline.first().map(String::as_str) == Some("eval") {
        cmdline[1..].join(" ")
    } else {
        shlex::try_join(cmdline.iter().map(String::as_str))
            .unwrap_or_else(|_| cmdline.join(" "))
    };
    if !script.ends_with('\n') && !script.ends_with(';') {
        script.push(';');
    }
    script
}

fn render_hook(node: &PipeNode, tag: &str) -> String {
    let mut text = format!("{{ {} }} >/dev/null 2>/dev/null\n", render_fragment(node));
    text.push_str(&format!(
        "[ $? -ne 0 ] && echo \"::W::A {}-condition failed\"\n",
        tag
    ));
    text
}

/// Compile the wrapper's stdin: the complete bash program.
pub fn compose_program(wrap: &ShellWrap, children: &[PipeNode]) -> String {
    let mut defs = String::new();
    let mut run = String::new();
    let mut killtrap = String::from("function killer_@@ {\n");

    let pre: String = wrap.pre.iter().map(|p| render_hook(p, "pre")).collect();
    let post: String = wrap.post.iter().map(|p| render_hook(p, "post")).collect();

    for (i, node) in children.iter().enumerate() {
        let prefix = format!("::{}::", i);
        let frag = render_fragment(node);

        // The sub-shell plumbing swaps stderr through fd 3 so both streams
        // pass through awk while ${PIPESTATUS[0]} keeps the fragment's own
        // exit status.
        defs.push_str(&format!("function frag_{} {{\n", i));
        defs.push_str(&format!(
            "{{ {{ {} }} 2>&3 | awk >&2 '$0=\"{}\"$0'; exit ${{PIPESTATUS[0]}}; }} 3>&1 1>&2 | awk '$0=\"{}\"$0';\n",
            frag, prefix, prefix
        ));
        defs.push_str("return ${PIPESTATUS[0]}\n");
        defs.push_str("}\n");

        defs.push_str(&format!("function run_{} {{\n", i));
        let inbuf = node.stdin();
        if !inbuf.is_empty() {
            let eof = format!("STDIN{}_{}", i, random_marker());
            defs.push_str(&format!("cat <<'{}' | frag_{}\n", eof, i));
            defs.push_str(&inbuf);
            defs.push_str(&format!("\n{}", eof));
        } else {
            defs.push_str(&format!("frag_{};", i));
        }
        defs.push_str("\n}\n");

        run.push_str(&format!("run_{}&\nFRAG_PID_{}=$!\n", i, i));
        killtrap.push_str(&format!("kill -@@ $FRAG_PID_{} 2>/dev/null\n", i));
    }

    killtrap.push_str("trap - @@\n");
    killtrap.push_str("}\ntrap killer_@@ @@\n");

    let mut script = String::from("# Definitions\n");
    script.push_str(&defs);
    script.push_str("# Signal hooks\n");
    script.push_str(&killtrap.replace("@@", "SIGINT"));
    script.push_str(&killtrap.replace("@@", "SIGHUP"));
    script.push_str(&killtrap.replace("@@", "SIGKILL"));
    if !pre.is_empty() {
        script.push_str("# Pre-conditions\n");
        script.push_str("echo ::D::Satisfying pre-conditions\n");
        script.push_str(&pre);
    }
    if !post.is_empty() {
        script.push_str("# Post-conditions\n");
        script.push_str("function exit_handler {\n");
        script.push_str("echo ::D::Satisfying post-conditions\n");
        script.push_str(&post);
        script.push_str("}\n");
        script.push_str("trap exit_handler EXIT\n");
    }
    script.push_str("# Run script\n");
    script.push_str("echo ::I::Starting application\n");
    script.push_str(&run);
    script.push_str("# Wait for first fragment complete\n");
    script.push_str("wait $FRAG_PID_0\n");
    script.push_str("RET=$?\n");
    script.push_str("echo ::I::Application exited with code=$RET\n");
    script.push_str("# Interrupt the rest\n");
    script.push_str("killer_SIGINT\n");
    script.push_str("exit $RET\n");
    script
}

/// Route one combined-output line to the fragment that produced it. Tags
/// `I`/`W`/`E`/`D` are wrapper diagnostics and surface on the log instead.
pub(crate) fn demux(children: &mut [PipeNode], line: &str) -> Result<()> {
    if !line.starts_with("::") {
        debug!("Ignoring line (missing prefix): {}", line);
        return Ok(());
    }
    let rest = &line[2..];
    let end = match rest.find("::") {
        Some(end) => end,
        None => {
            debug!("Ignoring line (missing suffix): {}", line);
            return Ok(());
        }
    };
    let tag = &rest[..end];
    let payload = &rest[end + 2..];
    match tag {
        "D" => debug!("{}", payload),
        "I" => info!("{}", payload),
        "W" => warn!("{}", payload),
        "E" => error!("{}", payload),
        _ => match tag.parse::<usize>() {
            Ok(id) if id < children.len() => return children[id].on_stdout(payload),
            Ok(_) => debug!("Ignoring line (invalid pipe id): {}", line),
            Err(_) => debug!("Ignoring line (invalid tag): {}", line),
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipe::{PipeKind, PipeListener, ScriptPipe};
    use std::sync::{Arc, Mutex};

    struct Recorder(Arc<Mutex<Vec<String>>>);

    impl PipeListener for Recorder {
        fn on_stdout(&mut self, line: &str) -> Result<()> {
            self.0.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    fn script_node(script: &str) -> PipeNode {
        PipeNode::new(PipeKind::Script(ScriptPipe::from_script(script)))
    }

    fn wrap_with(children: Vec<PipeNode>) -> PipeNode {
        let mut wrap = PipeNode::new(PipeKind::ShellWrap(ShellWrap::default()));
        for c in children {
            wrap.plug(c);
        }
        wrap
    }

    #[test]
    fn program_structure() {
        let wrap = wrap_with(vec![script_node("sleep 1"), script_node("true")]);
        let program = wrap.stdin();
        assert!(program.contains("function frag_0"));
        assert!(program.contains("function frag_1"));
        assert!(program.contains("awk '$0=\"::0::\"$0'"));
        assert!(program.contains("awk '$0=\"::1::\"$0'"));
        assert!(program.contains("trap killer_SIGINT SIGINT"));
        assert!(program.contains("trap killer_SIGHUP SIGHUP"));
        assert!(program.contains("wait $FRAG_PID_0"));
        assert!(program.trim_end().ends_with("exit $RET"));
    }

    #[test]
    fn quoted_fragments_for_plain_cmdlines() {
        use crate::pipe::AppPipe;
        let map: serde_yaml::Mapping =
            serde_yaml::from_str("{binary: /bin/echo, args: ['hello world']}").unwrap();
        let app = AppPipe::configure(&map, &crate::context::Context::new()).unwrap();
        let wrap = wrap_with(vec![PipeNode::new(PipeKind::App(app))]);
        let program = wrap.stdin();
        assert!(program.contains("/bin/echo 'hello world';"));
    }

    #[test]
    fn fragment_stdin_travels_in_a_heredoc() {
        let mut wrap = wrap_with(vec![]);
        let map: serde_yaml::Mapping =
            serde_yaml::from_str("{binary: /usr/bin/bc, stdin: '1+2'}").unwrap();
        let app = crate::pipe::AppPipe::configure(&map, &crate::context::Context::new()).unwrap();
        wrap.plug(PipeNode::new(PipeKind::App(app)));
        let program = wrap.stdin();
        assert!(program.contains("cat <<'STDIN0_"));
        assert!(program.contains("| frag_0"));
        assert!(program.contains("1+2"));
    }

    #[test]
    fn pre_and_post_hooks_are_emitted() {
        let mut wrap = wrap_with(vec![script_node("true")]);
        wrap.plug_pre(script_node("echo pre > /tmp/f"));
        wrap.plug_post(script_node("rm /tmp/f"));
        let program = wrap.stdin();
        assert!(program.contains("::D::Satisfying pre-conditions"));
        assert!(program.contains("::W::A pre-condition failed"));
        assert!(program.contains("trap exit_handler EXIT"));
        assert!(program.contains("::W::A post-condition failed"));
    }

    #[test]
    fn demux_routes_each_line_to_exactly_one_child() {
        let first = Arc::new(Mutex::new(Vec::new()));
        let second = Arc::new(Mutex::new(Vec::new()));
        let mut a = script_node("true");
        a.listen(Box::new(Recorder(first.clone())));
        let mut b = script_node("true");
        b.listen(Box::new(Recorder(second.clone())));
        let mut wrap = wrap_with(vec![a, b]);

        for line in [
            "::0::alpha",
            "::1::bravo",
            "::0::charlie",
            "::I::Starting application",
            "plain noise",
            "::7::lost",
            "::x::lost",
            "::0:alpha",
        ] {
            wrap.on_stdout(line).unwrap();
        }

        assert_eq!(*first.lock().unwrap(), vec!["alpha", "charlie"]);
        assert_eq!(*second.lock().unwrap(), vec!["bravo"]);
    }

    #[test]
    fn wrapper_cmdline_is_line_buffered() {
        assert_eq!(
            wrapper_cmdline(),
            vec!["/usr/bin/stdbuf", "-oL", "-eL", "/bin/bash", "/dev/stdin"]
        );
    }
}
