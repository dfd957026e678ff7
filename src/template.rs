//! Placeholder substitution for built-ins and environment variables (spec
//! §4.3 "Template substitution", §9 "Template engine").
//!
//! Three syntaxes are accepted per name: `${NAME}`, `$NAME`, `{NAME}`. The
//! only observable behaviors that matter are: all three syntaxes resolve
//! the same name, substitution runs over every textual field before shell
//! construction, and unknown names are left literal (`SPOT_ERROR` is the
//! one exception -- it resolves to the empty string when absent).

use spot_ast::Destination;
use std::collections::HashMap;

/// Context available while rendering one command against one host.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext<'a> {
    pub host: Option<&'a Destination>,
    pub task_user: Option<&'a str>,
    pub command_name: Option<&'a str>,
    pub task_name: Option<&'a str>,
    pub error: Option<&'a str>,
    pub environment: Option<&'a HashMap<String, String>>,
}

impl<'a> TemplateContext<'a> {
    fn lookup(&self, name: &str) -> Option<String> {
        match name {
            "SPOT_REMOTE_HOST" => self.host.map(|h| format!("{}:{}", h.host, h.effective_port())),
            "SPOT_REMOTE_ADDR" => self.host.map(|h| h.host.clone()),
            "SPOT_REMOTE_PORT" => Some(
                self.host
                    .map(|h| h.effective_port().to_string())
                    .unwrap_or_else(|| "22".to_string()),
            ),
            "SPOT_REMOTE_NAME" => self.host.map(|h| h.display_name().to_string()),
            "SPOT_REMOTE_USER" => self.task_user.map(|u| u.to_string()),
            "SPOT_COMMAND" => self.command_name.map(|s| s.to_string()),
            "SPOT_TASK" => self.task_name.map(|s| s.to_string()),
            "SPOT_ERROR" => Some(self.error.unwrap_or("").to_string()),
            other => self.environment.and_then(|env| env.get(other).cloned()),
        }
    }
}

/// Render every `${NAME}` / `$NAME` / `{NAME}` placeholder in `input`.
/// Unknown names (outside the fixed table and `environment`) are left as
/// literal text.
pub fn render(input: &str, ctx: &TemplateContext) -> String {
    let mut out = String::with_capacity(input.len());
    let bytes = input.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'$' && i + 1 < bytes.len() && bytes[i + 1] == b'{' {
            if let Some((name, end)) = scan_braced(input, i + 2) {
                if let Some(val) = ctx.lookup(&name) {
                    out.push_str(&val);
                    i = end;
                    continue;
                }
            }
            out.push(b as char);
            i += 1;
        } else if b == b'$' && i + 1 < bytes.len() && is_ident_start(bytes[i + 1]) {
            let (name, end) = scan_bare_ident(input, i + 1);
            if let Some(val) = ctx.lookup(&name) {
                out.push_str(&val);
                i = end;
                continue;
            }
            out.push(b as char);
            i += 1;
        } else if b == b'{' {
            if let Some((name, end)) = scan_braced(input, i + 1) {
                if let Some(val) = ctx.lookup(&name) {
                    out.push_str(&val);
                    i = end;
                    continue;
                }
            }
            out.push(b as char);
            i += 1;
        } else {
            // copy one utf8 char worth of bytes
            let ch_len = utf8_len(b);
            out.push_str(&input[i..i + ch_len]);
            i += ch_len;
        }
    }
    out
}

fn utf8_len(first_byte: u8) -> usize {
    if first_byte & 0x80 == 0 {
        1
    } else if first_byte & 0xE0 == 0xC0 {
        2
    } else if first_byte & 0xF0 == 0xE0 {
        3
    } else {
        4
    }
}

fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_ident_cont(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Scan a `{NAME}` body starting right after the opening brace. Returns the
/// name and the index right after the closing brace.
fn scan_braced(input: &str, start: usize) -> Option<(String, usize)> {
    let bytes = input.as_bytes();
    let mut j = start;
    while j < bytes.len() && is_ident_cont(bytes[j]) {
        j += 1;
    }
    if j == start || j >= bytes.len() || bytes[j] != b'}' {
        return None;
    }
    Some((input[start..j].to_string(), j + 1))
}

/// Scan a bare `$NAME` identifier starting at `start` (the first identifier
/// byte). Returns the name and the index right after it.
fn scan_bare_ident(input: &str, start: usize) -> (String, usize) {
    let bytes = input.as_bytes();
    let mut j = start;
    while j < bytes.len() && is_ident_cont(bytes[j]) {
        j += 1;
    }
    (input[start..j].to_string(), j)
}
