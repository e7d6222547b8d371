// Unless explicitly stated otherwise all files in this repository are licensed
// under the MIT/Apache-2.0 License, at your convenience

//! Access pipes: how a node is reached. Local access is a bash
//! pass-through (handled directly in the pipe dispatch); this module holds
//! the ssh tunnel and its password automaton.

use crate::context::Context;
use crate::error::{Result, SweepError};
use crate::pipe::{ExpectOutcome, ExpectRule};
use crate::util::mget_str;
use serde_yaml::Mapping;
use tracing::debug;

const SSH_BINARY: &str = "/usr/bin/ssh";
const PASSWORD_PROMPT: &str = "[Pp]assword:";

/// Tunnel the wrapped command through the system ssh client. `-t` keeps a
/// tty on the far side so line buffering and prompts survive the hop.
pub struct SshAccess {
    username: String,
    host: String,
    key: Option<String>,
    password: Option<String>,
}

impl SshAccess {
    pub fn configure(config: &Mapping, context: &Context) -> Result<SshAccess> {
        let username = mget_str(config, "username")
            .ok_or_else(|| SweepError::spec("ssh access requires a 'username'"))?
            .to_string();
        let host = match mget_str(config, "host") {
            Some(host) => host.to_string(),
            None => context
                .get_str("node.host")
                .ok_or_else(|| SweepError::spec("ssh access requires a 'host'"))?
                .to_string(),
        };
        Ok(SshAccess {
            username,
            host,
            key: mget_str(config, "key").map(str::to_string),
            password: mget_str(config, "password").map(str::to_string),
        })
    }

    pub fn base_cmdline(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            SSH_BINARY,
            "-t",
            "-q",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "StrictHostKeyChecking=no",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        if self.password.is_some() {
            args.push("-o".to_string());
            args.push("PreferredAuthentications=password".to_string());
        }
        if let Some(key) = &self.key {
            args.push("-i".to_string());
            args.push(key.clone());
        }
        args.push(format!("{}@{}", self.username, self.host));
        args.push("--".to_string());
        args
    }

    /// The password automaton, when a password is configured. Installed
    /// with `call_always` so the disappearance of the prompt can be
    /// observed too.
    pub fn expect_rules(&self) -> Result<Vec<ExpectRule>> {
        let password = match &self.password {
            Some(password) => password.clone(),
            None => return Ok(Vec::new()),
        };
        Ok(vec![password_rule(self.host.clone(), password)?])
    }
}

/// State machine over the tty lines:
///
/// * first prompt: remember the line, type the password
/// * the same prompt again: the password was wrong
/// * a different prompt: a chained gateway's downstream hop is asking;
///   we are through, leave the line to the next rule in scan order
/// * any other line after we typed: authenticated, retire silently
pub(crate) fn password_rule(host: String, password: String) -> Result<ExpectRule> {
    let mut sent_line = String::new();
    ExpectRule::call(PASSWORD_PROMPT, true, move |line, matched| {
        if matched {
            if sent_line.is_empty() {
                sent_line = line.to_string();
                debug!(host = %host, "Password prompt detected, authenticating");
                return ExpectOutcome {
                    reply: Some(format!("{}\r\n\r\n", password)),
                    remove: false,
                    handled: true,
                    error: None,
                };
            }
            if sent_line == line {
                return ExpectOutcome {
                    reply: None,
                    remove: true,
                    handled: true,
                    error: Some(SweepError::InvalidCredentials(host.clone())),
                };
            }
            // Downstream hop prompting; pass the line along
            return ExpectOutcome {
                reply: None,
                remove: true,
                handled: false,
                error: None,
            };
        }
        if !sent_line.is_empty() {
            debug!(host = %host, "Password prompt gone, authenticated");
            return ExpectOutcome {
                reply: None,
                remove: true,
                handled: false,
                error: None,
            };
        }
        ExpectOutcome::ignored()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ssh(config: &str, ctx: &Context) -> SshAccess {
        let map: Mapping = serde_yaml::from_str(config).unwrap();
        SshAccess::configure(&map, ctx).unwrap()
    }

    #[test]
    fn cmdline_shape() {
        let access = ssh("{username: bench, host: farm01}", &Context::new());
        let args = access.base_cmdline();
        assert_eq!(args[0], "/usr/bin/ssh");
        assert!(args.contains(&"bench@farm01".to_string()));
        assert!(!args.contains(&"PreferredAuthentications=password".to_string()));
        assert_eq!(args.last().unwrap(), "--");
    }

    #[test]
    fn password_forces_password_auth() {
        let access = ssh("{username: bench, host: farm01, password: s3cret}", &Context::new());
        let args = access.base_cmdline();
        assert!(args.contains(&"PreferredAuthentications=password".to_string()));
        assert_eq!(access.expect_rules().unwrap().len(), 1);
    }

    #[test]
    fn host_falls_back_to_node() {
        let mut ctx = Context::new();
        ctx.set("node", serde_yaml::from_str("{host: fallback.example}").unwrap());
        let access = ssh("{username: bench}", &ctx);
        assert!(access
            .base_cmdline()
            .contains(&"bench@fallback.example".to_string()));
    }

    #[test]
    fn keyfile_is_passed_before_the_destination() {
        let access = ssh("{username: bench, host: h, key: /home/bench/.ssh/id_bench}", &Context::new());
        let args = access.base_cmdline();
        let key_pos = args.iter().position(|a| a == "-i").unwrap();
        let dest_pos = args.iter().position(|a| a == "bench@h").unwrap();
        assert!(key_pos < dest_pos);
        assert_eq!(args[key_pos + 1], "/home/bench/.ssh/id_bench");
    }

    #[test]
    fn auth_succeeds_when_prompt_disappears() {
        let mut rule = password_rule("farm01".into(), "s3cret".into()).unwrap();
        let out = rule.feed("Password:").unwrap();
        assert_eq!(out.reply.as_deref(), Some("s3cret\r\n\r\n"));
        assert!(!out.remove);
        assert!(out.handled);
        // Next line is ordinary output: authenticated, rule retires
        let out = rule.feed("Linux farm01 6.1.0").unwrap();
        assert!(out.remove);
        assert!(!out.handled);
        assert!(out.error.is_none());
    }

    #[test]
    fn repeated_prompt_is_invalid_credentials() {
        let mut rule = password_rule("farm01".into(), "wrong".into()).unwrap();
        rule.feed("Password:").unwrap();
        let out = rule.feed("Password:").unwrap();
        assert!(matches!(out.error, Some(SweepError::InvalidCredentials(_))));
    }

    #[test]
    fn different_prompt_means_downstream_hop() {
        let mut rule = password_rule("gw".into(), "s3cret".into()).unwrap();
        rule.feed("gw password:").unwrap();
        let out = rule.feed("inner password:").unwrap();
        assert!(out.remove);
        assert!(!out.handled);
        assert!(out.error.is_none());
    }
}
