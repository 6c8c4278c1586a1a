//! Scans a token list for calls to known allocator functions and determines,
//! per site, whether the failure case is checked before the result is used.

use crate::token::{Punctuator, Token, TokenKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocShape {
    ReturnsPointer,
    WritesThroughArgument,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckStyle {
    PointerNull,
    IntNegative,
    IntNonzero,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocatorSpec {
    pub name: &'static str,
    pub shape: AllocShape,
    pub check_style: CheckStyle,
    pub arg_index: usize,
}

/// The allocator registry. A hard-coded constant: adding a new allocator means
/// extending this table and recompiling, by design (no runtime plugin surface).
pub static ALLOCATOR_SPECS: &[AllocatorSpec] = &[
    AllocatorSpec { name: "malloc", shape: AllocShape::ReturnsPointer, check_style: CheckStyle::PointerNull, arg_index: 0 },
    AllocatorSpec { name: "calloc", shape: AllocShape::ReturnsPointer, check_style: CheckStyle::PointerNull, arg_index: 0 },
    AllocatorSpec { name: "realloc", shape: AllocShape::ReturnsPointer, check_style: CheckStyle::PointerNull, arg_index: 0 },
    AllocatorSpec { name: "strdup", shape: AllocShape::ReturnsPointer, check_style: CheckStyle::PointerNull, arg_index: 0 },
    AllocatorSpec { name: "strndup", shape: AllocShape::ReturnsPointer, check_style: CheckStyle::PointerNull, arg_index: 0 },
    AllocatorSpec { name: "realpath", shape: AllocShape::ReturnsPointer, check_style: CheckStyle::PointerNull, arg_index: 0 },
    AllocatorSpec { name: "get_current_dir_name", shape: AllocShape::ReturnsPointer, check_style: CheckStyle::PointerNull, arg_index: 0 },
    AllocatorSpec { name: "asprintf", shape: AllocShape::WritesThroughArgument, check_style: CheckStyle::IntNegative, arg_index: 0 },
    AllocatorSpec { name: "vasprintf", shape: AllocShape::WritesThroughArgument, check_style: CheckStyle::IntNegative, arg_index: 0 },
    AllocatorSpec { name: "getline", shape: AllocShape::WritesThroughArgument, check_style: CheckStyle::IntNegative, arg_index: 0 },
    AllocatorSpec { name: "getdelim", shape: AllocShape::WritesThroughArgument, check_style: CheckStyle::IntNegative, arg_index: 0 },
    AllocatorSpec { name: "scandir", shape: AllocShape::WritesThroughArgument, check_style: CheckStyle::IntNegative, arg_index: 0 },
    AllocatorSpec { name: "glob", shape: AllocShape::WritesThroughArgument, check_style: CheckStyle::IntNonzero, arg_index: 2 },
];

pub fn find_spec(name: &[u8]) -> Option<&'static AllocatorSpec> {
    ALLOCATOR_SPECS.iter().find(|s| s.name.as_bytes() == name)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationSite {
    pub token_index: usize,
    pub var_name: Option<String>,
    pub is_checked: bool,
    pub used_before_check: bool,
    pub is_return_statement: bool,
    pub spec: AllocatorSpec,
}

fn text_eq(tokens: &[Token], code: &[u8], i: usize, s: &str) -> bool {
    tokens.get(i).map_or(false, |t| t.text(code) == s.as_bytes())
}

fn ident_text(tokens: &[Token], code: &[u8], i: usize) -> Option<String> {
    if tokens[i].kind == TokenKind::Identifier {
        Some(String::from_utf8_lossy(tokens[i].text(code)).into_owned())
    } else {
        None
    }
}

fn prev_non_trivia(tokens: &[Token], i: usize) -> Option<usize> {
    if i == 0 {
        return None;
    }
    (0..i).rev().find(|&k| !tokens[k].is_trivia())
}

fn next_non_trivia(tokens: &[Token], mut i: usize) -> Option<usize> {
    i += 1;
    while i < tokens.len() {
        if !tokens[i].is_trivia() {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn find_call_paren(tokens: &[Token], call_idx: usize) -> Option<usize> {
    let idx = next_non_trivia(tokens, call_idx)?;
    if tokens[idx].kind == TokenKind::Punct(Punctuator::OpenParen) {
        Some(idx)
    } else {
        None
    }
}

fn matching_close_paren(tokens: &[Token], open: usize) -> Option<usize> {
    let mut depth = 1usize;
    let mut i = open + 1;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Punct(Punctuator::OpenParen) => depth += 1,
            TokenKind::Punct(Punctuator::CloseParen) => {
                depth -= 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
        i += 1;
    }
    None
}

/// Split a top-level (depth-0 within the parens) comma-separated argument list
/// into `(start, end)` token ranges.
fn split_args(tokens: &[Token], open: usize, close: usize) -> Vec<(usize, usize)> {
    let mut args = Vec::new();
    let mut depth = 0usize;
    let mut arg_start = open + 1;
    let mut i = open + 1;
    while i < close {
        match tokens[i].kind {
            TokenKind::Punct(Punctuator::OpenParen) | TokenKind::Punct(Punctuator::OpenBracket) => {
                depth += 1
            }
            TokenKind::Punct(Punctuator::CloseParen) | TokenKind::Punct(Punctuator::CloseBracket) => {
                depth -= 1
            }
            TokenKind::Punct(Punctuator::Comma) if depth == 0 => {
                args.push((arg_start, i));
                arg_start = i + 1;
            }
            _ => {}
        }
        i += 1;
    }
    if close > arg_start {
        args.push((arg_start, close));
    }
    args
}

fn captured_variable_returns_pointer(
    tokens: &[Token],
    code: &[u8],
    call_idx: usize,
) -> (Option<String>, bool) {
    // Walk backward from the call, skipping whitespace, for the first `=` not
    // part of a multi-char operator, stopping at a statement boundary.
    let mut i = call_idx;
    loop {
        let prev = match prev_non_trivia(tokens, i) {
            Some(p) => p,
            None => return (None, false),
        };
        match tokens[prev].kind {
            TokenKind::Punct(Punctuator::Semicolon) | TokenKind::Punct(Punctuator::OpenBrace) | TokenKind::Punct(Punctuator::CloseBrace) => {
                return (None, false)
            }
            TokenKind::Keyword(crate::token::Keyword::Return) => return (None, true),
            TokenKind::Punct(Punctuator::Assign) => {
                let var = prev_non_trivia(tokens, prev).and_then(|v| ident_text(tokens, code, v));
                return (var, false);
            }
            _ => {
                i = prev;
            }
        }
    }
}

fn captured_variable_argument_style(
    tokens: &[Token],
    code: &[u8],
    open: usize,
    close: usize,
    arg_index: usize,
) -> Option<String> {
    let args = split_args(tokens, open, close);
    let (arg_start, arg_end) = *args.get(arg_index)?;
    let first = (arg_start..arg_end).find(|&k| !tokens[k].is_trivia())?;
    let ident_idx = if tokens[first].kind == TokenKind::Punct(Punctuator::Amp) {
        next_non_trivia(tokens, first)?
    } else {
        first
    };
    if ident_idx < arg_end {
        ident_text(tokens, code, ident_idx)
    } else {
        None
    }
}

fn scope_end(tokens: &[Token], from: usize) -> usize {
    let mut depth = 0usize;
    let mut i = from;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Punct(Punctuator::OpenBrace) => depth += 1,
            TokenKind::Punct(Punctuator::CloseBrace) => {
                if depth == 0 {
                    return i;
                }
                depth -= 1;
            }
            _ => {}
        }
        i += 1;
    }
    tokens.len()
}

fn is_inside_condition(tokens: &[Token], call_idx: usize) -> bool {
    // Walk backward, paren-balanced, looking for an unbalanced '(' whose
    // preceding non-trivia token is `if` or `while`.
    let mut depth = 0i32;
    let mut i = call_idx;
    loop {
        let prev = match prev_non_trivia(tokens, i) {
            Some(p) => p,
            None => return false,
        };
        match tokens[prev].kind {
            TokenKind::Punct(Punctuator::Semicolon) | TokenKind::Punct(Punctuator::OpenBrace) | TokenKind::Punct(Punctuator::CloseBrace) => {
                return false
            }
            TokenKind::Punct(Punctuator::CloseParen) => depth += 1,
            TokenKind::Punct(Punctuator::OpenParen) => {
                if depth == 0 {
                    if let Some(before) = prev_non_trivia(tokens, prev) {
                        return matches!(
                            tokens[before].kind,
                            TokenKind::Keyword(crate::token::Keyword::If)
                                | TokenKind::Keyword(crate::token::Keyword::While)
                        );
                    }
                    return false;
                }
                depth -= 1;
            }
            _ => {}
        }
        i = prev;
    }
}

fn forward_scan_is_checked(
    tokens: &[Token],
    code: &[u8],
    semicolon: usize,
    var: &str,
) -> (bool, bool) {
    let end = scope_end(tokens, semicolon);
    let mut i = semicolon + 1;
    let mut used_before_check = false;
    while i < end {
        if tokens[i].is_trivia() {
            i += 1;
            continue;
        }
        match tokens[i].kind {
            TokenKind::Keyword(crate::token::Keyword::If) | TokenKind::Keyword(crate::token::Keyword::While) => {
                // Does the controlling expression reference `var`?
                if let Some(open) = next_non_trivia(tokens, i) {
                    if tokens[open].kind == TokenKind::Punct(Punctuator::OpenParen) {
                        if let Some(close) = matching_close_paren(tokens, open) {
                            let references = (open + 1..close).any(|k| {
                                tokens[k].kind == TokenKind::Identifier && tokens[k].text(code) == var.as_bytes()
                            });
                            if references {
                                return (true, used_before_check);
                            }
                            i = close + 1;
                            continue;
                        }
                    }
                }
            }
            TokenKind::Identifier if tokens[i].text(code) == var.as_bytes() => {
                let deref_write = prev_non_trivia(tokens, i)
                    .map_or(false, |prev| tokens[prev].kind == TokenKind::Punct(Punctuator::Star));
                if deref_write {
                    used_before_check = true;
                }
                if let Some(next) = next_non_trivia(tokens, i) {
                    match tokens[next].kind {
                        TokenKind::Punct(Punctuator::Arrow) | TokenKind::Punct(Punctuator::OpenBracket) => {
                            used_before_check = true;
                        }
                        TokenKind::Punct(Punctuator::Assign) if !deref_write => {
                            return (false, used_before_check)
                        }
                        _ => {}
                    }
                }
            }
            _ => {}
        }
        i += 1;
    }
    (false, used_before_check)
}

fn statement_terminator(tokens: &[Token], from: usize) -> usize {
    let mut depth = 0usize;
    let mut i = from;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Punct(Punctuator::OpenParen) | TokenKind::Punct(Punctuator::OpenBracket) => depth += 1,
            TokenKind::Punct(Punctuator::CloseParen) | TokenKind::Punct(Punctuator::CloseBracket) => depth -= 1,
            TokenKind::Punct(Punctuator::Semicolon) if depth == 0 => return i,
            _ => {}
        }
        i += 1;
    }
    tokens.len()
}

/// Scan `tokens` for allocator calls and report, per site, whether the failure
/// case is checked. This never mutates its input and reports facts only. It
/// does not decide what, if anything, should be injected.
pub fn analyse(tokens: &[Token], code: &[u8]) -> Vec<AllocationSite> {
    let mut sites = Vec::new();
    for i in 0..tokens.len() {
        if tokens[i].kind != TokenKind::Identifier {
            continue;
        }
        let spec = match find_spec(tokens[i].text(code)) {
            Some(s) => *s,
            None => continue,
        };
        let open = match find_call_paren(tokens, i) {
            Some(idx) => idx,
            None => continue,
        };
        let close = match matching_close_paren(tokens, open) {
            Some(c) => c,
            None => continue,
        };

        let (var_name, is_return_statement) = match spec.shape {
            AllocShape::ReturnsPointer => captured_variable_returns_pointer(tokens, code, i),
            AllocShape::WritesThroughArgument => (
                captured_variable_argument_style(tokens, code, open, close, spec.arg_index),
                false,
            ),
        };

        let (mut is_checked, mut used_before_check) = (false, false);
        if let Some(var) = &var_name {
            if is_inside_condition(tokens, i) {
                is_checked = true;
            } else {
                let semi = statement_terminator(tokens, close);
                let (checked, used) = forward_scan_is_checked(tokens, code, semi, var);
                is_checked = checked;
                used_before_check = used;
            }
        }

        sites.push(AllocationSite {
            token_index: i,
            var_name,
            is_checked,
            used_before_check,
            is_return_statement,
            spec,
        });
    }
    sites
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn analyse_src(src: &str) -> Vec<AllocationSite> {
        let code = src.as_bytes();
        let tokens = tokenize(code);
        analyse(&tokens, code)
    }

    #[test]
    fn unchecked_malloc_assignment() {
        let sites = analyse_src("void f() { char *p = malloc(10); *p = 5; }");
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].var_name.as_deref(), Some("p"));
        assert!(!sites[0].is_checked);
        assert!(sites[0].used_before_check);
    }

    #[test]
    fn checked_via_following_if() {
        let sites = analyse_src("void f() { char *p = malloc(10); if (!p) return; }");
        assert_eq!(sites.len(), 1);
        assert!(sites[0].is_checked);
    }

    #[test]
    fn asprintf_captures_buffer_argument() {
        let sites = analyse_src("void f() { char *p; asprintf(&p, \"x\"); }");
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].var_name.as_deref(), Some("p"));
        assert_eq!(sites[0].spec.check_style, CheckStyle::IntNegative);
    }
}
