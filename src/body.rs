//! Given a function body's tokens, the allocator analyser's findings for that body,
//! and the set of already-refactored callees, queues every required rewrite as a
//! patch and hands the list to the patch engine in one pass.

use crate::alloc::{AllocShape, AllocationSite, CheckStyle};
use crate::patch::PatchList;
use crate::token::{Keyword, Punctuator, Token, TokenKind};
use crate::util::{Code, Log};
use once_cell::unsync::OnceCell;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalleeKind {
    WasVoid,
    WasPointer,
}

/// A function whose signature has already been rewritten, as seen by callers.
#[derive(Debug, Clone)]
pub struct RefactoredFunction {
    pub name: String,
    pub kind: CalleeKind,
    /// The callee's original return-type text; populated for `WasPointer`, used
    /// to type a hoisted temporary when the call is not the sole statement.
    pub return_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformKind {
    WasVoid,
    WasPointer,
}

/// How this body's own `return` statements must be rewritten, because the
/// enclosing function's own signature changed.
#[derive(Debug, Clone)]
pub struct SignatureTransform {
    pub kind: TransformKind,
    pub out_arg_name: String,
    pub success_code: String,
    pub error_code: String,
    /// Original return-type text; required when `kind` is `WasPointer`.
    pub return_type: Option<String>,
}

fn next_non_trivia(tokens: &[Token], mut i: usize, end: usize) -> Option<usize> {
    while i < end {
        if !tokens[i].is_trivia() {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn prev_non_trivia(tokens: &[Token], start: usize, mut i: usize) -> Option<usize> {
    while i > start {
        i -= 1;
        if !tokens[i].is_trivia() {
            return Some(i);
        }
    }
    None
}

fn ident_text(tokens: &[Token], code: &[u8], i: usize) -> Option<String> {
    if tokens[i].kind == TokenKind::Identifier {
        Some(String::from_utf8_lossy(tokens[i].text(code)).into_owned())
    } else {
        None
    }
}

fn join_range(tokens: &[Token], code: &[u8], start: usize, end: usize) -> String {
    let mut s = String::new();
    for i in start..end {
        s.push_str(&String::from_utf8_lossy(tokens[i].text(code)));
    }
    s
}

fn trimmed_range(tokens: &[Token], code: &[u8], mut start: usize, mut end: usize) -> String {
    while start < end && tokens[start].is_trivia() {
        start += 1;
    }
    while end > start && tokens[end - 1].is_trivia() {
        end -= 1;
    }
    join_range(tokens, code, start, end)
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

fn statement_terminator(tokens: &[Token], from: usize) -> usize {
    let mut depth = 0usize;
    let mut i = from;
    while i < tokens.len() {
        match tokens[i].kind {
            TokenKind::Punct(Punctuator::OpenParen) | TokenKind::Punct(Punctuator::OpenBracket) => {
                depth += 1
            }
            TokenKind::Punct(Punctuator::CloseParen) | TokenKind::Punct(Punctuator::CloseBracket) => {
                depth -= 1
            }
            TokenKind::Punct(Punctuator::Semicolon) if depth == 0 => return i,
            _ => {}
        }
        i += 1;
    }
    tokens.len()
}

/// Index just past the nearest `;`/`{`/`}` at or before `from` (0 if none).
fn statement_start(tokens: &[Token], from: usize) -> usize {
    let mut i = from;
    while i > 0 {
        i -= 1;
        if matches!(
            tokens[i].kind,
            TokenKind::Punct(Punctuator::Semicolon)
                | TokenKind::Punct(Punctuator::OpenBrace)
                | TokenKind::Punct(Punctuator::CloseBrace)
        ) {
            return i + 1;
        }
    }
    0
}

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

/// Build `name(args, out_expr)`, omitting the separating comma when `args_text`
/// is empty so a zero-argument call doesn't grow a leading `(, &x)`.
fn call_with_out(name: &str, args_text: &str, out_expr: &str) -> String {
    if args_text.trim().is_empty() {
        format!("{}({})", name, out_expr)
    } else {
        format!("{}({}, {})", name, args_text, out_expr)
    }
}

fn first_arg_identifier(tokens: &[Token], code: &[u8], open: usize, close: usize) -> Option<String> {
    let args = split_args(tokens, open, close);
    let (start, end) = *args.first()?;
    let idx = (start..end).find(|&k| !tokens[k].is_trivia())?;
    ident_text(tokens, code, idx)
}

struct Rewriter<'t, 'c> {
    tokens: &'t [Token],
    code: &'c [u8],
    patches: PatchList,
    hoist_preludes: Vec<(usize, String)>,
    hoist_counter: usize,
    status_needed: bool,
    /// Unset by default; tracing only fires for a caller that has opted in via
    /// [`Rewriter::set_log`].
    log: OnceCell<Log<&'static str>>,
}

impl<'t, 'c> Rewriter<'t, 'c> {
    #[allow(dead_code)]
    fn set_log(&self, log: Log<&'static str>) -> Result<(), Log<&'static str>> {
        self.log.set(log)
    }

    fn trace_patch(&self, label: &'static str, token_offset: usize) {
        #[cfg(debug_assertions)]
        if let Some(level) = self.log.get() {
            if level.order() >= Log::Success(()).order() {
                let code = Code::new(self.code);
                println!(
                    "[{}] body rewrite `{}` at {}",
                    level,
                    label,
                    code.obtain_position(token_offset)
                );
            }
        }
        #[cfg(not(debug_assertions))]
        {
            let _ = (label, token_offset);
        }
    }

    fn push_hoist_prelude(&mut self, at: usize, text: String) {
        if let Some(entry) = self.hoist_preludes.iter_mut().find(|(pos, _)| *pos == at) {
            entry.1.push_str(&text);
        } else {
            self.hoist_preludes.push((at, text));
        }
    }

    /// Like [`Self::push_hoist_prelude`], but for text that must precede
    /// whatever is already queued at `at`, used for the status-variable
    /// declaration, which has to appear before any hoisted-call prelude that
    /// happens to share its insertion point (the hoisted call is the body's
    /// first statement). Both land as insertion patches at the same token
    /// index, and the patch engine emits same-start insertions in queue
    /// order rather than choosing between them, so merging them into one
    /// ordered string here is what keeps `rc` declared before it is read.
    fn push_hoist_prelude_front(&mut self, at: usize, text: String) {
        if let Some(entry) = self.hoist_preludes.iter_mut().find(|(pos, _)| *pos == at) {
            entry.1 = format!("{}{}", text, entry.1);
        } else {
            self.hoist_preludes.push((at, text));
        }
    }

    fn finish(mut self) -> PatchList {
        if self.status_needed {
            let has_rc = self
                .tokens
                .iter()
                .any(|t| t.kind == TokenKind::Identifier && t.text(self.code) == b"rc");
            if !has_rc {
                if let Some(open_brace) = self.tokens.iter().position(|t| {
                    t.kind == TokenKind::Punct(Punctuator::OpenBrace)
                }) {
                    self.push_hoist_prelude_front(open_brace + 1, " int rc = 0;".to_string());
                }
            }
        }
        for (at, text) in self.hoist_preludes {
            self.patches.add(at, at, text);
        }
        self.patches
    }

    fn injections(&mut self, sites: &[AllocationSite], error_code: &str) {
        for site in sites {
            if site.is_checked {
                continue;
            }
            let var = match &site.var_name {
                Some(v) => v.clone(),
                None => continue,
            };
            let call_idx = site.token_index;
            let open = match next_non_trivia(self.tokens, call_idx + 1, self.tokens.len()) {
                Some(o) if self.tokens[o].kind == TokenKind::Punct(Punctuator::OpenParen) => o,
                _ => continue,
            };
            let close = match matching_close_paren(self.tokens, open) {
                Some(c) => c,
                None => continue,
            };

            if site.spec.shape == AllocShape::ReturnsPointer
                && site.spec.name == "realloc"
                && first_arg_identifier(self.tokens, self.code, open, close).as_deref() == Some(var.as_str())
            {
                self.self_assigning_realloc(call_idx, open, close, &var, error_code);
                continue;
            }

            let semi = statement_terminator(self.tokens, close);
            match site.spec.shape {
                AllocShape::ReturnsPointer => {
                    let cond = format!("!{}", var);
                    self.patches.add(
                        semi + 1,
                        semi + 1,
                        format!(" if ({}) {{ return {}; }}", cond, error_code),
                    );
                    self.trace_patch("allocation-safety-injection", self.tokens[call_idx].offset);
                }
                AllocShape::WritesThroughArgument => {
                    let tmp = format!("_safe_rc_{}", call_idx);
                    self.patches.add(call_idx, call_idx, format!("int {} = ", tmp));
                    let cmp = match site.spec.check_style {
                        CheckStyle::IntNegative => format!("{} < 0", tmp),
                        CheckStyle::IntNonzero => format!("{} != 0", tmp),
                        CheckStyle::PointerNull => format!("!{}", tmp),
                    };
                    self.patches.add(
                        semi + 1,
                        semi + 1,
                        format!(" if ({}) {{ return {}; }}", cmp, error_code),
                    );
                    self.trace_patch("argument-style-injection", self.tokens[call_idx].offset);
                }
            }
        }
    }

    fn self_assigning_realloc(
        &mut self,
        call_idx: usize,
        open: usize,
        close: usize,
        var: &str,
        error_code: &str,
    ) {
        // Walk backward from the call to the '=' and the assignment's LHS identifier.
        let eq_idx = match prev_non_trivia(self.tokens, 0, call_idx) {
            Some(p) if self.tokens[p].kind == TokenKind::Punct(Punctuator::Assign) => p,
            _ => return,
        };
        let lhs_idx = match prev_non_trivia(self.tokens, 0, eq_idx) {
            Some(l) => l,
            None => return,
        };
        let semi = statement_terminator(self.tokens, close);
        let call_text = join_range(self.tokens, self.code, call_idx, close + 1);
        let replacement = format!(
            "{{ void *_safe_tmp = {}; if (!_safe_tmp) return {}; {} = _safe_tmp; }}",
            call_text, error_code, var
        );
        self.patches.add(lhs_idx, semi + 1, replacement);
        self.trace_patch("self-assigning-realloc", self.tokens[call_idx].offset);
    }

    fn return_rewrites(&mut self, transform: &SignatureTransform) {
        let mut i = 0usize;
        while i < self.tokens.len() {
            if self.tokens[i].kind != TokenKind::Keyword(Keyword::Return) {
                i += 1;
                continue;
            }
            let return_idx = i;
            let after = next_non_trivia(self.tokens, return_idx + 1, self.tokens.len());
            let semi = statement_terminator(self.tokens, return_idx + 1);
            let expr_text = match after {
                Some(a) if a < semi => trimmed_range(self.tokens, self.code, a, semi),
                _ => String::new(),
            };

            match transform.kind {
                TransformKind::WasVoid => {
                    self.patches.add(
                        return_idx,
                        (semi + 1).min(self.tokens.len()),
                        format!("return {};", transform.success_code),
                    );
                }
                TransformKind::WasPointer => {
                    let is_null_like = expr_text.is_empty() || expr_text == "NULL" || expr_text == "0";
                    let text = if is_null_like {
                        format!("return {};", transform.error_code)
                    } else {
                        let ret_type = transform.return_type.clone().unwrap_or_else(|| "void*".into());
                        format!(
                            "{{ {} _val = {}; if (!_val) return {}; *{} = _val; return {}; }}",
                            ret_type,
                            expr_text,
                            transform.error_code,
                            transform.out_arg_name,
                            transform.success_code
                        )
                    };
                    self.patches.add(return_idx, (semi + 1).min(self.tokens.len()), text);
                }
            }
            self.trace_patch("return-rewrite", self.tokens[return_idx].offset);
            i = semi + 1;
        }

        if transform.kind == TransformKind::WasVoid {
            if let Some(last) = self.tokens.iter().rposition(|t| {
                t.kind == TokenKind::Punct(Punctuator::CloseBrace)
            }) {
                self.patches
                    .add(last, last, format!(" return {};", transform.success_code));
            }
        }
    }

    fn call_site_propagation(&mut self, refactored: &[RefactoredFunction]) {
        let by_name: HashMap<&str, &RefactoredFunction> =
            refactored.iter().map(|r| (r.name.as_str(), r)).collect();

        let mut i = 0usize;
        while i < self.tokens.len() {
            if self.tokens[i].kind != TokenKind::Identifier {
                i += 1;
                continue;
            }
            let name = String::from_utf8_lossy(self.tokens[i].text(self.code)).into_owned();
            let callee = match by_name.get(name.as_str()) {
                Some(c) => *c,
                None => {
                    i += 1;
                    continue;
                }
            };
            let open = match next_non_trivia(self.tokens, i + 1, self.tokens.len()) {
                Some(o) if self.tokens[o].kind == TokenKind::Punct(Punctuator::OpenParen) => o,
                _ => {
                    i += 1;
                    continue;
                }
            };
            let close = match matching_close_paren(self.tokens, open) {
                Some(c) => c,
                None => {
                    i += 1;
                    continue;
                }
            };
            let call_idx = i;

            // Skip calls nested inside a `return` expression: the return rewriter
            // owns that range and the two rewrites would otherwise overlap.
            let stmt_start = statement_start(self.tokens, call_idx);
            if let Some(first_sig) = next_non_trivia(self.tokens, stmt_start, self.tokens.len()) {
                if self.tokens[first_sig].kind == TokenKind::Keyword(Keyword::Return) {
                    i = close + 1;
                    continue;
                }
            }

            let args_text = join_range(self.tokens, self.code, open + 1, close);
            let prev = prev_non_trivia(self.tokens, 0, call_idx);
            let next_after_close = next_non_trivia(self.tokens, close + 1, self.tokens.len());
            let call_is_whole_statement = matches!(
                next_after_close.map(|n| self.tokens[n].kind),
                Some(TokenKind::Punct(Punctuator::Semicolon))
            );

            let prev_is_assign = matches!(
                prev.map(|p| self.tokens[p].kind),
                Some(TokenKind::Punct(Punctuator::Assign))
            );
            let prev_is_stmt_boundary = matches!(
                prev.map(|p| self.tokens[p].kind),
                None | Some(
                    TokenKind::Punct(Punctuator::Semicolon)
                        | TokenKind::Punct(Punctuator::OpenBrace)
                        | TokenKind::Punct(Punctuator::CloseBrace)
                )
            );

            if prev_is_assign && call_is_whole_statement {
                let eq_idx = prev.unwrap();
                let var_idx = prev_non_trivia(self.tokens, 0, eq_idx).unwrap_or(eq_idx);
                let var_name = ident_text(self.tokens, self.code, var_idx).unwrap_or_default();
                let stmt_start = statement_start(self.tokens, eq_idx);
                let is_decl = var_idx > stmt_start
                    && next_non_trivia(self.tokens, stmt_start, var_idx).map_or(false, |n| n != var_idx);
                let semi = statement_terminator(self.tokens, close);

                if let CalleeKind::WasPointer = callee.kind {
                    let call_text = call_with_out(&name, &args_text, &format!("&{}", var_name));
                    let replacement = if is_decl {
                        let type_text = trimmed_range(self.tokens, self.code, stmt_start, var_idx);
                        format!(
                            "{} {}; rc = {}; if (rc != 0) return rc;",
                            type_text, var_name, call_text
                        )
                    } else {
                        format!("rc = {}; if (rc != 0) return rc;", call_text)
                    };
                    self.patches.add(stmt_start, semi + 1, replacement);
                    self.status_needed = true;
                    self.trace_patch("call-site-propagation: assignment/declaration split", self.tokens[call_idx].offset);
                }
                i = semi + 1;
                continue;
            }

            if prev_is_stmt_boundary && call_is_whole_statement {
                match callee.kind {
                    CalleeKind::WasVoid => {
                        self.patches.add(call_idx, call_idx, "rc = ".to_string());
                        let semi = statement_terminator(self.tokens, close);
                        self.patches.add(
                            semi + 1,
                            semi + 1,
                            " if (rc != 0) return rc;".to_string(),
                        );
                        self.status_needed = true;
                        self.trace_patch("call-site-propagation: was-void statement", self.tokens[call_idx].offset);
                    }
                    CalleeKind::WasPointer => {
                        self.hoist_counter += 1;
                        let tmp = format!("_tmp_{}", self.hoist_counter);
                        let ret_type = callee.return_type.clone().unwrap_or_else(|| "void*".into());
                        let stmt_start = statement_start(self.tokens, call_idx);
                        let call_text = call_with_out(&name, &args_text, &format!("&{}", tmp));
                        self.push_hoist_prelude(
                            stmt_start,
                            format!(
                                "{} {}; rc = {}; if (rc != 0) return rc; ",
                                ret_type, tmp, call_text
                            ),
                        );
                        self.patches.add(call_idx, close + 1, tmp);
                        self.status_needed = true;
                        self.trace_patch("call-site-propagation: was-pointer statement hoist", self.tokens[call_idx].offset);
                    }
                }
                i = close + 1;
                continue;
            }

            // Nested inside a larger expression: hoist unconditionally.
            if let CalleeKind::WasPointer = callee.kind {
                self.hoist_counter += 1;
                let tmp = format!("_tmp_{}", self.hoist_counter);
                let ret_type = callee.return_type.clone().unwrap_or_else(|| "void*".into());
                let stmt_start = statement_start(self.tokens, call_idx);
                let call_text = call_with_out(&name, &args_text, &format!("&{}", tmp));
                self.push_hoist_prelude(
                    stmt_start,
                    format!(
                        "{} {}; rc = {}; if (rc != 0) return rc; ",
                        ret_type, tmp, call_text
                    ),
                );
                self.patches.add(call_idx, close + 1, tmp);
                self.status_needed = true;
                self.trace_patch("call-site-propagation: nested expression hoist", self.tokens[call_idx].offset);
            }
            i = close + 1;
        }
    }
}

/// Rewrite one function body (token range local to the body, index 0 is `{`).
pub fn rewrite_body(
    tokens: &[Token],
    code: &[u8],
    sites: &[AllocationSite],
    refactored: &[RefactoredFunction],
    transform: Option<&SignatureTransform>,
) -> PatchList {
    let error_code = transform
        .map(|t| t.error_code.as_str())
        .unwrap_or("ENOMEM");

    let mut rewriter = Rewriter {
        tokens,
        code,
        patches: PatchList::new(),
        hoist_preludes: Vec::new(),
        hoist_counter: 0,
        status_needed: false,
        log: OnceCell::new(),
    };

    rewriter.injections(sites, error_code);
    if let Some(t) = transform {
        rewriter.return_rewrites(t);
    }
    rewriter.call_site_propagation(refactored);
    rewriter.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::analyse;
    use crate::token::tokenize;

    fn run(src: &str, transform: Option<SignatureTransform>, refactored: &[RefactoredFunction]) -> String {
        let code = src.as_bytes();
        let tokens = tokenize(code);
        let sites = analyse(&tokens, code);
        let patches = rewrite_body(&tokens, code, &sites, refactored, transform.as_ref());
        String::from_utf8(patches.apply(&tokens, code)).unwrap()
    }

    #[test]
    fn injects_pointer_null_check() {
        let out = run("{ char *p = malloc(10); *p = 5; }", None, &[]);
        assert!(out.contains("if (!p) { return ENOMEM; }"));
    }

    #[test]
    fn leaves_already_checked_site_alone() {
        let out = run("{ char *p = malloc(10); if (!p) return; }", None, &[]);
        assert_eq!(out.matches("if").count(), 1);
    }

    #[test]
    fn self_assigning_realloc_gets_pattern_rewrite() {
        let out = run("{ char *p; p = realloc(p, 100); }", None, &[]);
        assert!(out.contains("void *_safe_tmp = realloc(p, 100);"));
        assert!(out.contains("if (!_safe_tmp) return ENOMEM;"));
        assert!(out.contains("p = _safe_tmp;"));
    }

    #[test]
    fn was_void_statement_call_gets_status_check() {
        let refactored = vec![RefactoredFunction {
            name: "A".into(),
            kind: CalleeKind::WasVoid,
            return_type: None,
        }];
        let out = run("{ A(); }", None, &refactored);
        assert!(out.contains("rc = A(); if (rc != 0) return rc;"));
    }

    #[test]
    fn was_pointer_declaration_split() {
        let refactored = vec![RefactoredFunction {
            name: "A".into(),
            kind: CalleeKind::WasPointer,
            return_type: Some("char*".into()),
        }];
        let out = run("{ char *x = A(); return x; }", None, &refactored);
        assert!(out.contains("rc = A(&x);"));
    }

    #[test]
    fn was_void_transform_appends_return_before_final_brace() {
        let transform = SignatureTransform {
            kind: TransformKind::WasVoid,
            out_arg_name: "out".into(),
            success_code: "0".into(),
            error_code: "ENOMEM".into(),
            return_type: None,
        };
        let out = run("{}", Some(transform), &[]);
        assert!(out.trim_start().starts_with('{'));
        assert!(out.contains("return 0;"));
    }

    #[test]
    fn was_pointer_transform_null_return_becomes_error_code() {
        let transform = SignatureTransform {
            kind: TransformKind::WasPointer,
            out_arg_name: "out".into(),
            success_code: "0".into(),
            error_code: "ENOMEM".into(),
            return_type: Some("char*".into()),
        };
        let out = run("{ return NULL; }", Some(transform), &[]);
        assert!(out.contains("return ENOMEM;"));
        assert!(!out.contains("_val"));
    }
}
