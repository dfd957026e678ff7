//! Command preparer (spec §4.3): turn a (already template-substituted)
//! script body into either a single-line shell invocation or a remote
//! script file plus the command that invokes it.

use regex::Regex;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::OnceLock;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PrepareError {
    #[error("failed to create temp file: {0}")]
    Io(#[from] std::io::Error),
}

/// A command ready to hand to an `Executor`.
#[derive(Debug, Clone)]
pub enum PreparedBody {
    /// `<shell> -c '<body>'`
    Inline { invocation: String },
    /// A script materialized to a local temp file (and, for remote hosts,
    /// a destination path it still needs to be uploaded to).
    Script {
        local_path: PathBuf,
        /// Set when the command targets a remote host; `None` for local
        /// execution, which just runs the local temp file directly.
        remote_dir: Option<String>,
        remote_path: Option<String>,
        invocation: String,
    },
}

fn export_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*export\s+([A-Za-z_][A-Za-z0-9_]*)=").unwrap())
}

/// Comments after `#` are stripped in the single-line path only when `#` is
/// not the first character -- deliberately naive, with no string-literal
/// awareness (spec §9 "Script comment stripping").
fn strip_comment(line: &str) -> String {
    if let Some(idx) = line.find('#') {
        if idx > 0 {
            return line[..idx].trim_end().to_string();
        }
    }
    line.to_string()
}

fn sorted_env_exports(env: &HashMap<String, String>) -> Vec<String> {
    let mut keys: Vec<&String> = env.keys().collect();
    keys.sort();
    keys.into_iter()
        .map(|k| format!("export {}=\"{}\"", k, env[k]))
        .collect()
}

fn ordered_secret_exports(secrets: &HashMap<String, String>, order: &[String]) -> Vec<String> {
    order
        .iter()
        .filter_map(|k| secrets.get(k).map(|v| format!("export {}=\"{}\"", k, v)))
        .collect()
}

/// A script is eligible for the single-line path when it has at most one
/// non-trivial (non-blank) line (spec §4.3 "Single-line path").
pub fn is_single_line(source: &str) -> bool {
    source.lines().map(str::trim).filter(|l| !l.is_empty()).count() <= 1
}

fn build_single_line_body(
    env: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
    secret_order: &[String],
    script: &str,
) -> String {
    let mut parts = sorted_env_exports(env);
    parts.extend(ordered_secret_exports(secrets, secret_order));
    for line in script.lines() {
        let stripped = strip_comment(line);
        let trimmed = stripped.trim();
        if !trimmed.is_empty() {
            parts.push(trimmed.to_string());
        }
    }
    parts.join("; ")
}

fn build_multiline_script(
    source: &str,
    shell: &str,
    env: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
    secret_order: &[String],
    register: &[String],
) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut body_lines: Vec<&str> = source.lines().collect();
    match body_lines.first() {
        Some(first) if first.trim_start().starts_with("#!") => {
            lines.push((*first).to_string());
            body_lines.remove(0);
        }
        _ => lines.push(format!("#!{shell}")),
    }
    lines.push("set -e".to_string());
    lines.extend(sorted_env_exports(env));
    lines.extend(ordered_secret_exports(secrets, secret_order));

    for line in body_lines {
        lines.push(line.to_string());
        if let Some(cap) = export_regex().captures(line) {
            let name = &cap[1];
            lines.push(format!("echo \"setvar {name}:SQ=${{{name}}}\""));
        }
    }
    for name in register {
        lines.push(format!("echo setvar {name}=${{{name}}}"));
    }
    lines.join("\n")
}

/// CSPRNG-first, PRNG-fallback random suffix for remote temp directories
/// (spec §4.3 step 7).
fn random_suffix() -> String {
    use rand::RngCore;
    let mut buf = [0u8; 10];
    if rand::rngs::OsRng.try_fill_bytes(&mut buf).is_ok() {
        buf.iter().map(|b| format!("{b:02x}")).collect()
    } else {
        (0..20).map(|_| fastrand::alphanumeric()).collect()
    }
}

/// Prepare one script body. `shell` is the already-resolved shell for the
/// destination (remote `ssh_shell`/`/bin/sh`, local `$SHELL`/`/bin/sh`).
pub fn prepare_script(
    source: &str,
    shell: &str,
    environment: &HashMap<String, String>,
    secrets: &HashMap<String, String>,
    secret_order: &[String],
    register: &[String],
    sudo: bool,
    is_remote: bool,
) -> Result<PreparedBody, PrepareError> {
    if is_single_line(source) {
        let body = build_single_line_body(environment, secrets, secret_order, source);
        let quoted = shell_escape::escape(std::borrow::Cow::from(body)).into_owned();
        let mut invocation = format!("{shell} -c {quoted}");
        if sudo {
            invocation = format!("sudo {invocation}");
        }
        return Ok(PreparedBody::Inline { invocation });
    }

    let script = build_multiline_script(source, shell, environment, secrets, secret_order, register);

    let mut file = tempfile::Builder::new().prefix("spot-script-").tempfile()?;
    file.write_all(script.as_bytes())?;
    file.flush()?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.as_file().set_permissions(std::fs::Permissions::from_mode(0o700))?;
    }
    let (_file, local_path) = file.keep().map_err(|e| PrepareError::Io(e.error))?;

    if !is_remote {
        let invocation = if sudo {
            format!("sudo {shell} -c {}", local_path.display())
        } else {
            format!("{shell} -c {}", local_path.display())
        };
        return Ok(PreparedBody::Script {
            local_path,
            remote_dir: None,
            remote_path: None,
            invocation,
        });
    }

    let remote_dir = format!("/tmp/.spot-{}", random_suffix());
    let filename = local_path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "script.sh".to_string());
    let remote_path = format!("{remote_dir}/{filename}");
    let invocation = if sudo {
        format!("sudo {shell} -c {remote_path}")
    } else {
        format!("{shell} -c {remote_path}")
    };

    Ok(PreparedBody::Script {
        local_path,
        remote_dir: Some(remote_dir),
        remote_path: Some(remote_path),
        invocation,
    })
}

/// Remove the local temp file (and, implicitly, the caller's own remote
/// directory cleanup happens via `Executor::delete`). Safe to call more
/// than once.
pub fn cleanup_local(body: &PreparedBody) {
    if let PreparedBody::Script { local_path, .. } = body {
        let _ = std::fs::remove_file(local_path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_line_detection() {
        assert!(is_single_line("echo hi"));
        assert!(is_single_line("\n  echo hi  \n\n"));
        assert!(!is_single_line("echo hi\necho bye"));
    }

    #[test]
    fn single_line_strips_trailing_comment_even_in_quotes() {
        let env = HashMap::new();
        let secrets = HashMap::new();
        let body = build_single_line_body(&env, &secrets, &[], "echo 'hash#inside' # real comment");
        // the buggy, preserved behavior: the first '#' wins, even the one
        // inside the quoted string.
        assert_eq!(body, "echo 'hash");
    }

    #[test]
    fn single_line_exports_env_sorted_then_secrets_in_declared_order() {
        let env = HashMap::from([("B".to_string(), "2".to_string()), ("A".to_string(), "1".to_string())]);
        let secrets = HashMap::from([("S2".to_string(), "x".to_string()), ("S1".to_string(), "y".to_string())]);
        let order = vec!["S2".to_string(), "S1".to_string()];
        let body = build_single_line_body(&env, &secrets, &order, "echo done");
        assert_eq!(
            body,
            "export A=\"1\"; export B=\"2\"; export S2=\"x\"; export S1=\"y\"; echo done"
        );
    }

    #[test]
    fn multiline_preserves_comments_and_emits_setvar_sentinels() {
        let env = HashMap::new();
        let secrets = HashMap::new();
        let script = build_multiline_script(
            "echo one\nexport FOO=bar\n# a real comment\necho two",
            "/bin/sh",
            &env,
            &secrets,
            &[],
            &["FOO".to_string()],
        );
        assert!(script.starts_with("#!/bin/sh\nset -e\n"));
        assert!(script.contains("# a real comment"));
        assert!(script.contains("export FOO=bar\necho \"setvar FOO:SQ=${FOO}\""));
        assert!(script.ends_with("echo setvar FOO=${FOO}"));
    }

    #[test]
    fn multiline_keeps_source_shebang() {
        let env = HashMap::new();
        let secrets = HashMap::new();
        let script = build_multiline_script("#!/usr/bin/env python3\nprint('hi')", "/bin/sh", &env, &secrets, &[], &[]);
        assert!(script.starts_with("#!/usr/bin/env python3\nset -e\n"));
    }

    #[test]
    fn local_script_has_no_remote_dir() {
        let env = HashMap::new();
        let secrets = HashMap::new();
        let prepared = prepare_script("echo one\necho two", "/bin/sh", &env, &secrets, &[], &[], false, false).unwrap();
        match prepared {
            PreparedBody::Script { remote_dir, remote_path, .. } => {
                assert!(remote_dir.is_none());
                assert!(remote_path.is_none());
            }
            _ => panic!("expected script path"),
        }
    }

    #[test]
    fn remote_script_gets_temp_dir() {
        let env = HashMap::new();
        let secrets = HashMap::new();
        let prepared = prepare_script("echo one\necho two", "/bin/sh", &env, &secrets, &[], &[], false, true).unwrap();
        match prepared {
            PreparedBody::Script { remote_dir, remote_path, .. } => {
                let dir = remote_dir.unwrap();
                assert!(dir.starts_with("/tmp/.spot-"));
                assert!(remote_path.unwrap().starts_with(&dir));
            }
            _ => panic!("expected script path"),
        }
    }

    #[test]
    fn sudo_wraps_invocation() {
        let env = HashMap::new();
        let secrets = HashMap::new();
        let prepared = prepare_script("echo hi", "/bin/sh", &env, &secrets, &[], &[], true, false).unwrap();
        match prepared {
            PreparedBody::Inline { invocation } => assert!(invocation.starts_with("sudo /bin/sh -c")),
            _ => panic!("expected inline"),
        }
    }
}
