// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

use crate::context::Context;
use crate::error::{Result, SweepError};
use crate::util::{mget, mget_str, value_to_string};
use serde_yaml::{Mapping, Value};

/// The benchmarked application: a binary, its arguments, an optional
/// environment (rendered as an `env K=V ...` wrapper) and an optional
/// stdin payload.
pub struct AppPipe {
    binary: String,
    args: Vec<String>,
    env: Vec<(String, String)>,
    stdin: String,
}

impl AppPipe {
    pub fn configure(config: &Mapping, context: &Context) -> Result<AppPipe> {
        let binary = mget_str(config, "binary")
            .ok_or_else(|| SweepError::spec("App is missing a 'binary'"))?
            .to_string();

        let args = match mget(config, "args") {
            None => Vec::new(),
            Some(Value::String(s)) => shlex::split(s).ok_or_else(|| {
                SweepError::spec(format!("App arguments are not a valid shell string: {}", s))
            })?,
            Some(Value::Sequence(seq)) => seq.iter().map(value_to_string).collect(),
            Some(_) => {
                return Err(SweepError::spec(
                    "Application's arguments must be a string or list",
                ))
            }
        };

        // An `env` reference was resolved into the context by the stream
        // factory; flatten it into env(1) assignments here.
        let mut env = Vec::new();
        if mget(config, "env").is_some() {
            if let Some(map) = context.mapping("env") {
                for (k, v) in map {
                    if let Some(k) = k.as_str() {
                        env.push((k.to_string(), value_to_string(v)));
                    }
                }
            }
        }

        let stdin = mget(config, "stdin").map(value_to_string).unwrap_or_default();

        Ok(AppPipe {
            binary,
            args,
            env,
            stdin,
        })
    }

    pub fn cmdline(&self) -> Vec<String> {
        let mut args = Vec::new();
        if !self.env.is_empty() {
            args.push("env".to_string());
            for (k, v) in &self.env {
                args.push(format!("{}={}", k, v));
            }
        }
        args.push(self.binary.clone());
        args.extend(self.args.iter().cloned());
        args
    }

    pub fn stdin_payload(&self) -> &str {
        &self.stdin
    }
}
