// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Fragment pipes that contribute raw shell text: opaque scripts, file
//! generation through heredocs, and file cleanup. Their cmdline starts with
//! the `eval` marker the shell wrapper recognizes as "already shell".

use crate::error::{Result, SweepError};
use crate::util::{mget_str, random_marker};
use serde_yaml::Mapping;

pub struct ScriptPipe {
    script: String,
}

impl ScriptPipe {
    pub fn configure(config: &Mapping) -> Result<ScriptPipe> {
        let script = mget_str(config, "script")
            .ok_or_else(|| SweepError::spec("script pipe is missing a 'script'"))?
            .to_string();
        Ok(ScriptPipe { script })
    }

    pub fn from_script(script: impl Into<String>) -> ScriptPipe {
        ScriptPipe {
            script: script.into(),
        }
    }

    pub fn cmdline(&self) -> Vec<String> {
        vec!["eval".to_string(), self.script.clone()]
    }
}

/// Writes a file on the target host before the run, through a heredoc with
/// a randomized end marker so the contents cannot terminate it early.
pub struct FileGenPipe {
    pub name: String,
    pub path: String,
    contents: String,
}

impl FileGenPipe {
    pub fn configure(config: &Mapping) -> Result<FileGenPipe> {
        let name = mget_str(config, "name")
            .ok_or_else(|| SweepError::spec("file entry is missing a 'name'"))?
            .to_string();
        let path = mget_str(config, "path")
            .ok_or_else(|| SweepError::spec(format!("file '{}' is missing a 'path'", name)))?
            .to_string();
        let contents = mget_str(config, "contents").unwrap_or("").to_string();
        Ok(FileGenPipe {
            name,
            path,
            contents,
        })
    }

    pub fn cmdline(&self) -> Vec<String> {
        let eof = format!("CONTENTS_{}", random_marker());
        let mut script = format!("WFILE=\"{}\"\n", self.path);
        script.push_str(&format!("cat <<'{}' > $WFILE\n", eof));
        script.push_str(&self.contents);
        script.push_str(&format!("\n{}\n", eof));
        vec!["eval".to_string(), script]
    }
}

/// Removes a generated file after the run, if it still exists.
pub struct FileDelPipe {
    path: String,
}

impl FileDelPipe {
    pub fn configure(config: &Mapping) -> Result<FileDelPipe> {
        let path = mget_str(config, "path")
            .ok_or_else(|| SweepError::spec("file-del pipe is missing a 'path'"))?
            .to_string();
        Ok(FileDelPipe { path })
    }

    pub fn from_path(path: impl Into<String>) -> FileDelPipe {
        FileDelPipe { path: path.into() }
    }

    pub fn cmdline(&self) -> Vec<String> {
        vec![
            "eval".to_string(),
            format!("[ -f \"{}\" ] && rm \"{}\"", self.path, self.path),
        ]
    }
}
