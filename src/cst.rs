//! Groups a flat token stream into a flat, ordered sequence of top-level constructs.

use crate::token::{Keyword, Punctuator, Token, TokenKind};
use ptree::TreeItem;
use std::borrow::Cow;
use std::io::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CstKind {
    Function,
    Struct,
    Enum,
    Union,
    Comment,
    Macro,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CstNode {
    pub kind: CstKind,
    /// Inclusive start, exclusive end token index.
    pub start: usize,
    pub end: usize,
    pub byte_start: usize,
    pub byte_end: usize,
}

fn is_non_trivia(tokens: &[Token], i: usize) -> bool {
    !tokens[i].is_trivia()
}

fn next_non_trivia(tokens: &[Token], mut i: usize) -> Option<usize> {
    while i < tokens.len() {
        if is_non_trivia(tokens, i) {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn is_keyword(tokens: &[Token], i: usize, kw: Keyword) -> bool {
    tokens.get(i).map_or(false, |t| t.kind == TokenKind::Keyword(kw))
}

fn is_punct(tokens: &[Token], i: usize, p: Punctuator) -> bool {
    tokens.get(i).map_or(false, |t| t.kind == TokenKind::Punct(p))
}

fn is_identifier(tokens: &[Token], i: usize) -> bool {
    tokens.get(i).map_or(false, |t| t.kind == TokenKind::Identifier)
}

fn node(kind: CstKind, tokens: &[Token], start: usize, end: usize) -> CstNode {
    CstNode {
        kind,
        start,
        end,
        byte_start: tokens[start].offset,
        byte_end: tokens[end - 1].end(),
    }
}

/// Scan forward from `struct`/`union`/`enum` at `start` to the matching aggregate
/// close, returning the exclusive end index and, when a body was present, the
/// token range `(open_brace, close_brace)` of that body so the caller can
/// recurse into it for nested aggregates.
fn scan_aggregate(tokens: &[Token], start: usize) -> (usize, Option<(usize, usize)>) {
    let mut i = start + 1;
    loop {
        match next_non_trivia(tokens, i) {
            None => return (tokens.len(), None),
            Some(idx) => {
                if is_punct(tokens, idx, Punctuator::Semicolon) {
                    return (idx + 1, None);
                }
                if is_punct(tokens, idx, Punctuator::OpenBrace) {
                    let open_brace = idx;
                    let mut depth = 1usize;
                    let mut j = idx + 1;
                    let mut close_brace = idx;
                    while depth > 0 {
                        match next_non_trivia(tokens, j) {
                            None => return (tokens.len(), Some((open_brace, tokens.len()))),
                            Some(k) => {
                                if is_punct(tokens, k, Punctuator::OpenBrace) {
                                    depth += 1;
                                } else if is_punct(tokens, k, Punctuator::CloseBrace) {
                                    depth -= 1;
                                    if depth == 0 {
                                        close_brace = k;
                                    }
                                }
                                j = k + 1;
                            }
                        }
                    }
                    // Optionally absorb a single trailing ';' at depth 0.
                    let end = if let Some(semi) = next_non_trivia(tokens, j) {
                        if is_punct(tokens, semi, Punctuator::Semicolon) {
                            semi + 1
                        } else {
                            j
                        }
                    } else {
                        j
                    };
                    return (end, Some((open_brace, close_brace)));
                }
                i = idx + 1;
            }
        }
    }
}

/// Recurse into an aggregate's body `(open_brace, close_brace)` looking for
/// nested `struct`/`union`/`enum` declarations, emitting each as its own node
/// (appearing, in list order, right after the aggregate that encloses it) and
/// recursing further into each one found.
fn collect_nested_aggregates(tokens: &[Token], open_brace: usize, close_brace: usize, nodes: &mut Vec<CstNode>) {
    let mut i = open_brace + 1;
    while i < close_brace {
        let idx = match next_non_trivia(tokens, i) {
            Some(idx) if idx < close_brace => idx,
            _ => break,
        };
        if let TokenKind::Keyword(kw @ (Keyword::Struct | Keyword::Union | Keyword::Enum)) = tokens[idx].kind {
            let (end, body) = scan_aggregate(tokens, idx);
            let end = end.min(close_brace);
            let kind = match kw {
                Keyword::Struct => CstKind::Struct,
                Keyword::Union => CstKind::Union,
                Keyword::Enum => CstKind::Enum,
                _ => unreachable!(),
            };
            nodes.push(node(kind, tokens, idx, end));
            if let Some((ob, cb)) = body {
                collect_nested_aggregates(tokens, ob, cb, nodes);
            }
            i = end;
            continue;
        }
        i = idx + 1;
    }
}

/// Attempt to recognise a function definition starting at `start`. Returns the
/// exclusive end index on success.
fn try_function_definition(tokens: &[Token], start: usize) -> Option<usize> {
    let stop_keywords = [
        Keyword::If,
        Keyword::While,
        Keyword::For,
        Keyword::Switch,
        Keyword::Return,
    ];
    let mut i = start;
    let mut last_ident: Option<usize> = None;
    let open_paren;
    loop {
        let idx = next_non_trivia(tokens, i)?;
        let tok = &tokens[idx];
        match tok.kind {
            TokenKind::Punct(Punctuator::Semicolon) | TokenKind::Punct(Punctuator::OpenBrace) => {
                return None;
            }
            TokenKind::Keyword(kw) if stop_keywords.contains(&kw) => return None,
            TokenKind::Punct(Punctuator::OpenParen) => {
                open_paren = idx;
                break;
            }
            TokenKind::Identifier | TokenKind::Keyword(_) => {
                last_ident = Some(idx);
            }
            _ => {}
        }
        i = idx + 1;
    }
    last_ident?;
    // The identifier immediately before '(' (modulo whitespace) must be the name.
    let before_paren = (0..open_paren).rev().find(|&k| is_non_trivia(tokens, k))?;
    if !is_identifier(tokens, before_paren) {
        return None;
    }

    let mut depth = 1usize;
    let mut j = open_paren + 1;
    loop {
        let idx = next_non_trivia(tokens, j)?;
        if is_punct(tokens, idx, Punctuator::OpenParen) {
            depth += 1;
        } else if is_punct(tokens, idx, Punctuator::CloseParen) {
            depth -= 1;
            if depth == 0 {
                j = idx + 1;
                break;
            }
        }
        j = idx + 1;
    }
    let close_paren_next = next_non_trivia(tokens, j)?;
    if !is_punct(tokens, close_paren_next, Punctuator::OpenBrace) {
        return None;
    }
    let mut brace_depth = 1usize;
    let mut k = close_paren_next + 1;
    loop {
        let idx = next_non_trivia(tokens, k)?;
        if is_punct(tokens, idx, Punctuator::OpenBrace) {
            brace_depth += 1;
        } else if is_punct(tokens, idx, Punctuator::CloseBrace) {
            brace_depth -= 1;
            if brace_depth == 0 {
                return Some(idx + 1);
            }
        }
        k = idx + 1;
    }
}

fn scan_other(tokens: &[Token], start: usize) -> usize {
    let mut i = start;
    loop {
        match next_non_trivia(tokens, i) {
            None => return tokens.len(),
            Some(idx) => {
                if is_punct(tokens, idx, Punctuator::Semicolon) {
                    return idx + 1;
                }
                if is_punct(tokens, idx, Punctuator::OpenBrace)
                    || is_punct(tokens, idx, Punctuator::CloseBrace)
                {
                    return idx.max(start + 1);
                }
                i = idx + 1;
            }
        }
    }
}

/// Build the flat, ordered sequence of top-level constructs from a token list.
pub fn build_cst(tokens: &[Token]) -> Vec<CstNode> {
    let mut nodes = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        if tokens[i].is_trivia() {
            i += 1;
            continue;
        }
        match tokens[i].kind {
            TokenKind::Comment => {
                nodes.push(node(CstKind::Comment, tokens, i, i + 1));
                i += 1;
                continue;
            }
            TokenKind::Macro => {
                nodes.push(node(CstKind::Macro, tokens, i, i + 1));
                i += 1;
                continue;
            }
            TokenKind::Keyword(kw @ (Keyword::Struct | Keyword::Union | Keyword::Enum)) => {
                let (end, body) = scan_aggregate(tokens, i);
                let kind = match kw {
                    Keyword::Struct => CstKind::Struct,
                    Keyword::Union => CstKind::Union,
                    Keyword::Enum => CstKind::Enum,
                    _ => unreachable!(),
                };
                nodes.push(node(kind, tokens, i, end));
                if let Some((open_brace, close_brace)) = body {
                    collect_nested_aggregates(tokens, open_brace, close_brace, &mut nodes);
                }
                i = end;
                continue;
            }
            _ => {}
        }
        if let Some(end) = try_function_definition(tokens, i) {
            nodes.push(node(CstKind::Function, tokens, i, end));
            i = end;
            continue;
        }
        let end = scan_other(tokens, i);
        nodes.push(node(CstKind::Other, tokens, i, end));
        i = end;
    }
    nodes
}

/// Adapter for printing a CST with `ptree`, mainly useful while debugging the
/// orchestrator's function selection.
pub struct CstTree<'a> {
    pub nodes: &'a [CstNode],
    pub index: usize,
}

impl<'a> TreeItem for CstTree<'a> {
    type Child = Self;

    fn write_self<W: Write>(&self, f: &mut W, _style: &ptree::Style) -> io::Result<()> {
        let n = &self.nodes[self.index];
        write!(f, "{:?} [{}, {})", n.kind, n.start, n.end)
    }

    fn children(&self) -> Cow<[Self::Child]> {
        Cow::Borrowed(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn kinds(src: &[u8]) -> Vec<CstKind> {
        let tokens = tokenize(src);
        build_cst(&tokens).into_iter().map(|n| n.kind).collect()
    }

    #[test]
    fn recognises_a_function_definition() {
        assert_eq!(kinds(b"int main(void) { return 0; }"), vec![CstKind::Function]);
    }

    #[test]
    fn rejects_declarations_with_control_flow_bodies() {
        // A lone prototype followed by a call is not a function definition.
        let k = kinds(b"int f(int x);");
        assert_eq!(k, vec![CstKind::Other]);
    }

    #[test]
    fn struct_with_inner_aggregate_emits_two_nodes() {
        let src = b"struct Outer { struct Inner { int x; } inner; };";
        let k = kinds(src);
        assert_eq!(k, vec![CstKind::Struct, CstKind::Struct]);
    }

    #[test]
    fn forward_declaration_stops_at_semicolon() {
        assert_eq!(kinds(b"struct S;"), vec![CstKind::Struct]);
    }
}
