//! Lightweight module analysis.
//!
//! Extracts what the module graph needs from transformed code: import
//! specifiers (with the bindings they pull in) and `import.meta.hot`
//! acceptance calls. Line-based for imports, a small state machine for the
//! arguments of `hot.accept(...)`.
//!
//! Transformers that already have an AST should fill [`TransformOutput`]
//! themselves; this is for those that only produce code.
//!
//! [`TransformOutput`]: crate::transform::TransformOutput

use std::collections::{BTreeSet, HashSet};
use thiserror::Error;

/// One import found in a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportRecord {
    pub specifier: String,
    pub dynamic: bool,
    /// Imported binding names. `None` means "everything" (namespace import,
    /// `export *`, dynamic import).
    pub bindings: Option<BTreeSet<String>>,
}

/// Acceptance metadata and imports of a module.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModuleAnalysis {
    pub imports: Vec<ImportRecord>,
    /// Specifiers passed to `hot.accept('dep', cb)` / `hot.accept(['a', 'b'], cb)`.
    pub accepted_deps: Vec<String>,
    /// Names passed to `hot.acceptExports(...)`.
    pub accepted_exports: Option<Vec<String>>,
    pub self_accepting: bool,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{message} at offset {pos}")]
pub struct LexError {
    pub message: String,
    pub pos: usize,
}

impl LexError {
    fn new(message: impl Into<String>, pos: usize) -> Self {
        Self {
            message: message.into(),
            pos,
        }
    }
}

const ACCEPT_PATTERNS: &[&str] = &[".hot.accept(", ".hot?.accept("];
const ACCEPT_EXPORTS_PATTERNS: &[&str] = &[".hot.acceptExports(", ".hot?.acceptExports("];

/// Analyze a module's code.
///
/// # Errors
/// Returns an error if an accept call has arguments that cannot be read
/// statically (e.g. a template string with `${}`).
pub fn analyze_module(code: &str) -> Result<ModuleAnalysis, LexError> {
    let mut analysis = ModuleAnalysis {
        imports: extract_imports(code),
        ..ModuleAnalysis::default()
    };

    for (offset, pattern) in find_calls(code, ACCEPT_PATTERNS) {
        let mut deps = Vec::new();
        if lex_accepted_hmr_deps(code, offset + pattern.len(), &mut deps)? {
            analysis.self_accepting = true;
        }
        for dep in deps {
            if !analysis.accepted_deps.contains(&dep) {
                analysis.accepted_deps.push(dep);
            }
        }
    }

    for (offset, pattern) in find_calls(code, ACCEPT_EXPORTS_PATTERNS) {
        let mut names = Vec::new();
        lex_accepted_hmr_exports(code, offset + pattern.len(), &mut names)?;
        analysis
            .accepted_exports
            .get_or_insert_with(Vec::new)
            .extend(names);
    }

    Ok(analysis)
}

/// Find call sites of any of `patterns`, skipping obvious comment lines.
fn find_calls<'a>(code: &str, patterns: &[&'a str]) -> Vec<(usize, &'a str)> {
    let mut found = Vec::new();
    let mut line_start = 0;
    for line in code.split_inclusive('\n') {
        let trimmed = line.trim_start();
        let is_comment =
            trimmed.starts_with("//") || trimmed.starts_with("/*") || trimmed.starts_with('*');
        if !is_comment {
            for pattern in patterns {
                let mut from = 0;
                while let Some(idx) = line[from..].find(pattern) {
                    found.push((line_start + from + idx, *pattern));
                    from += idx + pattern.len();
                }
            }
        }
        line_start += line.len();
    }
    found.sort_unstable_by_key(|(offset, _)| *offset);
    found
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LexerState {
    InCall,
    InSingleQuoteString,
    InDoubleQuoteString,
    InTemplateString,
    InArray,
}

/// Read the arguments of a `hot.accept(` call starting right after `(`.
///
/// String deps are pushed to `deps`. Returns `true` when the call is a
/// self-accept (first argument is not a string or array).
///
/// # Errors
/// Returns an error on a template string with `${}` or an unexpected
/// character inside the deps array.
pub fn lex_accepted_hmr_deps(
    code: &str,
    start: usize,
    deps: &mut Vec<String>,
) -> Result<bool, LexError> {
    let mut state = LexerState::InCall;
    let mut prev_state = LexerState::InCall;
    let mut current = String::new();

    let Some(rest) = code.get(start..) else {
        return Ok(false);
    };
    let mut chars = rest.char_indices().peekable();

    while let Some((i, c)) = chars.next() {
        let pos = start + i;
        match state {
            LexerState::InCall | LexerState::InArray => match c {
                '\'' | '"' | '`' => {
                    prev_state = state;
                    state = match c {
                        '\'' => LexerState::InSingleQuoteString,
                        '"' => LexerState::InDoubleQuoteString,
                        _ => LexerState::InTemplateString,
                    };
                }
                c if c.is_whitespace() => {}
                '[' if state == LexerState::InCall => state = LexerState::InArray,
                _ if state == LexerState::InCall => return Ok(true),
                ']' => return Ok(false),
                ',' => {}
                other => {
                    return Err(LexError::new(
                        format!("unexpected character '{other}' in hot.accept() deps array"),
                        pos,
                    ));
                }
            },
            LexerState::InSingleQuoteString
            | LexerState::InDoubleQuoteString
            | LexerState::InTemplateString => {
                let closing = match state {
                    LexerState::InSingleQuoteString => '\'',
                    LexerState::InDoubleQuoteString => '"',
                    _ => '`',
                };
                if c == closing {
                    deps.push(std::mem::take(&mut current));
                    if prev_state == LexerState::InCall {
                        return Ok(false);
                    }
                    state = prev_state;
                } else if state == LexerState::InTemplateString
                    && c == '$'
                    && chars.peek().map(|(_, n)| *n) == Some('{')
                {
                    return Err(LexError::new(
                        "hot.accept() deps must be string literals, not templates with ${}",
                        pos,
                    ));
                } else {
                    current.push(c);
                }
            }
        }
    }

    Ok(false)
}

/// Read the export names of a `hot.acceptExports(` call.
///
/// # Errors
/// Same as [`lex_accepted_hmr_deps`], plus an error if the first argument
/// is not a string or array.
pub fn lex_accepted_hmr_exports(
    code: &str,
    start: usize,
    names: &mut Vec<String>,
) -> Result<(), LexError> {
    if lex_accepted_hmr_deps(code, start, names)? {
        return Err(LexError::new(
            "hot.acceptExports() expects a string or an array of strings",
            start,
        ));
    }
    Ok(())
}

/// Extract all imports: static, side-effect, re-exports and dynamic.
/// Deduplicated by (specifier, dynamic).
#[must_use]
pub fn extract_imports(code: &str) -> Vec<ImportRecord> {
    let mut records = Vec::new();
    let mut seen = HashSet::new();
    let mut push = |record: ImportRecord, records: &mut Vec<ImportRecord>| {
        if seen.insert((record.specifier.clone(), record.dynamic)) {
            records.push(record);
        }
    };

    for statement in statements(code) {
        let trimmed = statement.as_str();
        if trimmed.starts_with("//") {
            continue;
        }

        if is_import_line(trimmed) {
            if let Some((clause, specifier)) = split_from_clause(trimmed) {
                let clause = clause.trim_start_matches("import").trim();
                let clause = clause.strip_prefix("type ").unwrap_or(clause);
                push(
                    ImportRecord {
                        specifier,
                        dynamic: false,
                        bindings: import_bindings(clause),
                    },
                    &mut records,
                );
            } else if let Some(specifier) = extract_side_effect_import(trimmed) {
                push(
                    ImportRecord {
                        specifier,
                        dynamic: false,
                        bindings: Some(BTreeSet::new()),
                    },
                    &mut records,
                );
            }
        } else if is_export_from_line(trimmed) {
            if let Some((clause, specifier)) = split_from_clause(trimmed) {
                let clause = clause.trim_start_matches("export").trim();
                push(
                    ImportRecord {
                        specifier,
                        dynamic: false,
                        bindings: export_bindings(clause),
                    },
                    &mut records,
                );
            }
        }

        let mut remaining = trimmed;
        while let Some(idx) = remaining.find("import(") {
            let after = &remaining[idx + 7..];
            match extract_string_from_start(after) {
                Some((specifier, rest)) => {
                    push(
                        ImportRecord {
                            specifier,
                            dynamic: true,
                            bindings: None,
                        },
                        &mut records,
                    );
                    remaining = rest;
                }
                None => remaining = after,
            }
        }
    }

    records
}

/// Trimmed source lines, with a brace clause of an `import`/`export`
/// statement that spans several lines joined back into one.
fn statements(code: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut lines = code.lines().map(str::trim).peekable();
    while let Some(line) = lines.next() {
        if !opens_clause(line) {
            out.push(line.to_string());
            continue;
        }
        let mut joined = line.to_string();
        let mut depth = brace_depth(line);
        while depth > 0 {
            let Some(next) = lines.next() else { break };
            if next.starts_with("//") {
                continue;
            }
            joined.push(' ');
            joined.push_str(next);
            depth += brace_depth(next);
        }
        if let Some(from) = lines.next_if(|next| next.starts_with("from ") || next.starts_with("from'") || next.starts_with("from\"")) {
            joined.push(' ');
            joined.push_str(from);
        }
        out.push(joined);
    }
    out
}

fn opens_clause(line: &str) -> bool {
    let clause = line.starts_with("import ")
        || line.starts_with("export {")
        || line.starts_with("export type {");
    clause && brace_depth(line) > 0
}

fn brace_depth(line: &str) -> i32 {
    line.chars().fold(0, |depth, c| match c {
        '{' => depth + 1,
        '}' => depth - 1,
        _ => depth,
    })
}

fn is_import_line(trimmed: &str) -> bool {
    trimmed.starts_with("import ")
        && (trimmed.contains(" from ") || trimmed.contains('\'') || trimmed.contains('"'))
}

fn is_export_from_line(trimmed: &str) -> bool {
    trimmed.starts_with("export ") && trimmed.contains(" from ")
}

/// Split `<clause> from '<specifier>'` at the last ` from `.
fn split_from_clause(line: &str) -> Option<(&str, String)> {
    let from_idx = line.rfind(" from ")?;
    let (specifier, _) = extract_string_from_start(&line[from_idx + 6..])?;
    Some((&line[..from_idx], specifier))
}

fn extract_side_effect_import(trimmed: &str) -> Option<String> {
    let after = trimmed.strip_prefix("import ")?;
    extract_string_from_start(after).map(|(specifier, _)| specifier)
}

/// Extract a quoted string at the start of `s`. Returns (contents, rest).
fn extract_string_from_start(s: &str) -> Option<(String, &str)> {
    let trimmed = s.trim_start();
    let quote = trimmed.chars().next()?;
    if quote != '\'' && quote != '"' {
        return None;
    }
    let inner = &trimmed[1..];
    let end = inner.find(quote)?;
    Some((inner[..end].to_string(), &inner[end + 1..]))
}

/// Bindings of an import clause: `d`, `{ a, b as c }`, `* as ns`, `d, { a }`.
fn import_bindings(clause: &str) -> Option<BTreeSet<String>> {
    if clause.contains('*') {
        return None;
    }
    let mut names = BTreeSet::new();
    let (default_part, named_part) = match clause.find('{') {
        Some(i) => (&clause[..i], Some(&clause[i..])),
        None => (clause, None),
    };
    if !default_part.trim().trim_end_matches(',').trim().is_empty() {
        names.insert("default".to_string());
    }
    if let Some(named) = named_part {
        names.extend(named_list(named));
    }
    Some(names)
}

/// Bindings of a re-export clause: `{ a, b as c }` or `*`.
fn export_bindings(clause: &str) -> Option<BTreeSet<String>> {
    if clause.starts_with('*') {
        return None;
    }
    Some(named_list(clause).collect())
}

/// Source-side names of `{ a, b as c, type T }`.
fn named_list(braced: &str) -> impl Iterator<Item = String> + '_ {
    braced
        .trim()
        .trim_start_matches('{')
        .trim_end_matches('}')
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let part = part.strip_prefix("type ").unwrap_or(part);
            let name = part.split_whitespace().next()?;
            Some(name.to_string())
        })
}
