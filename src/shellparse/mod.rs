//! Shell command extraction: given a script, enumerate the commands it
//! executes.
//!
//! Used to gate permissions before the agent invokes shell: the flat list
//! this returns is what gets checked against approvals, so it must cover
//! everything the script would actually run. The walk emits each
//! `command` node (with redirections and a trailing `&` when present),
//! descends into substitutions, subshells, brace groups and redirected
//! statements without emitting those wrappers, and then unwraps known
//! wrapper commands (`sudo`, `bash -c`, `xargs`, `find -exec`, …) to emit
//! the wrapped command recursively.

mod wrappers;

use anyhow::Context;
use tree_sitter::{Node, Parser};

use wrappers::{EXEC_SPAN_FLAGS, WrapperMode, lookup};

/// Enumerate the commands executed by `script`, in source order.
/// Wrapped commands follow their wrapper.
pub fn extract_commands(script: &str) -> anyhow::Result<Vec<String>> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_bash::LANGUAGE.into())
        .context("loading bash grammar")?;
    let tree = parser.parse(script, None).context("parsing shell script")?;

    let mut out = Vec::new();
    walk(tree.root_node(), script, &mut out);
    Ok(out)
}

fn walk(node: Node, src: &str, out: &mut Vec<String>) {
    match node.kind() {
        "command" => {
            emit_command(node, node, src, out);
        }
        "redirected_statement" => {
            let body = node.child_by_field_name("body");
            match body {
                // A redirected simple command is emitted whole; the
                // redirections are part of what executes.
                Some(body) if body.kind() == "command" => {
                    emit_command(node, body, src, out);
                    // Redirect targets can hide substitutions.
                    let mut cursor = node.walk();
                    for child in node.children(&mut cursor) {
                        if child.id() != body.id() {
                            walk_children(child, src, out);
                        }
                    }
                }
                _ => walk_children(node, src, out),
            }
        }
        // Wrappers we descend through without emitting.
        "command_substitution" | "subshell" | "compound_statement" => {
            walk_children(node, src, out);
        }
        _ => walk_children(node, src, out),
    }
}

fn walk_children(node: Node, src: &str, out: &mut Vec<String>) {
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        walk(child, src, out);
    }
}

/// Emit one command: `text_node` supplies the emitted text (the whole
/// redirected statement when redirections are present), `cmd_node` the
/// command whose arguments get substitution-walked and wrapper-unwrapped.
fn emit_command(text_node: Node, cmd_node: Node, src: &str, out: &mut Vec<String>) {
    let mut text = node_text(text_node, src).trim().to_string();
    if runs_in_background(text_node) {
        text.push_str(" &");
    }
    out.push(text);

    // Argument-embedded substitutions execute too.
    let mut cursor = cmd_node.walk();
    for child in cmd_node.children(&mut cursor) {
        walk_children(child, src, out);
    }

    let tokens = command_tokens(cmd_node, src);
    unwrap_tokens(&tokens, out, 0);
}

fn runs_in_background(node: Node) -> bool {
    node.next_sibling().is_some_and(|s| s.kind() == "&")
}

fn node_text<'a>(node: Node, src: &'a str) -> &'a str {
    &src[node.byte_range()]
}

/// The command's tokens (name + arguments) with outer quoting stripped.
/// Leading `VAR=value` assignments are not tokens of the executed
/// command.
fn command_tokens(cmd_node: Node, src: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut cursor = cmd_node.walk();
    for child in cmd_node.named_children(&mut cursor) {
        if child.kind() == "variable_assignment" {
            continue;
        }
        tokens.push(unquote(node_text(child, src)));
    }
    tokens
}

/// Strip matched outer quotes; process backslash escapes in unquoted and
/// double-quoted words (single quotes are literal).
fn unquote(token: &str) -> String {
    let bytes = token.as_bytes();
    if bytes.len() >= 2 {
        if bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\'' {
            return token[1..token.len() - 1].to_string();
        }
        if bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"' {
            return unescape(&token[1..token.len() - 1]);
        }
    }
    unescape(token)
}

fn unescape(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(next) = chars.next() {
                result.push(next);
            }
        } else {
            result.push(c);
        }
    }
    result
}

/// `NAME=value` with a valid shell identifier on the left.
fn is_env_assignment(token: &str) -> bool {
    match token.split_once('=') {
        Some((name, _)) => {
            !name.is_empty()
                && name
                    .chars()
                    .next()
                    .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
                && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

/// Wrapper-unwrap recursion bound. Scripts nest wrappers a handful deep
/// in practice; the bound only guards against pathological input.
const MAX_UNWRAP_DEPTH: usize = 16;

fn unwrap_tokens(tokens: &[String], out: &mut Vec<String>, depth: usize) {
    if depth >= MAX_UNWRAP_DEPTH {
        return;
    }
    let Some(first) = tokens.first() else { return };
    let Some(rule) = lookup(first) else { return };
    let rest = &tokens[1..];

    if rule.mode == WrapperMode::ExecSpan {
        unwrap_exec_spans(rest, out, depth);
        return;
    }

    // Scan off the wrapper's own flags and operands to find the payload.
    let mut i = 0;
    let mut positionals = rule.skip_positionals;
    let mut script: Option<&String> = None;
    while i < rest.len() {
        let token = &rest[i];
        if token == "--" {
            i += 1;
            break;
        }
        if token.starts_with('-') && token.len() > 1 {
            if rule.mode == WrapperMode::ShellScript && token == "-c" {
                script = rest.get(i + 1);
                break;
            }
            // `--flag=value` is self-contained.
            if rule.flags_with_arg.contains(&token.as_str()) && !token.contains('=') {
                i += 2;
            } else {
                i += 1;
            }
            continue;
        }
        if rule.skips_env_assignments && is_env_assignment(token) {
            i += 1;
            continue;
        }
        if positionals > 0 {
            positionals -= 1;
            i += 1;
            continue;
        }
        break;
    }

    if let Some(script) = script {
        if let Ok(inner) = extract_commands(script) {
            out.extend(inner);
        }
        return;
    }

    let payload = &rest[i.min(rest.len())..];
    if payload.is_empty() {
        return;
    }

    match rule.mode {
        WrapperMode::Concat => {
            // The payload is a script once the shell re-joins it (eval,
            // watch, ssh's remote command).
            if let Ok(inner) = extract_commands(&payload.join(" ")) {
                out.extend(inner);
            }
        }
        WrapperMode::Argv | WrapperMode::ShellScript => {
            out.push(payload.join(" "));
            unwrap_tokens(payload, out, depth + 1);
        }
        WrapperMode::ExecSpan => unreachable!("handled above"),
    }
}

/// `find -exec CMD … ;` (and friends): each span between an exec flag
/// and its `;`/`+` terminator is a command.
fn unwrap_exec_spans(rest: &[String], out: &mut Vec<String>, depth: usize) {
    let mut i = 0;
    while i < rest.len() {
        if EXEC_SPAN_FLAGS.contains(&rest[i].as_str()) {
            let start = i + 1;
            let mut end = start;
            while end < rest.len() && rest[end] != ";" && rest[end] != "+" {
                end += 1;
            }
            let payload = &rest[start..end];
            if !payload.is_empty() {
                out.push(payload.join(" "));
                unwrap_tokens(payload, out, depth + 1);
            }
            i = end + 1;
        } else {
            i += 1;
        }
    }
}
