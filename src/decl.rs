//! The spiral rule: read a C declarator by alternating right (for `[]`/`()`) and
//! left (for `*`), crossing grouping parens when both sides are exhausted.

use crate::error::TransformError;
use crate::token::{Punctuator, Token, TokenKind};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeclType {
    Base(String),
    Pointer {
        qualifiers: Vec<String>,
        inner: Box<DeclType>,
    },
    Array {
        size: Option<String>,
        inner: Box<DeclType>,
    },
    Function {
        args: String,
        inner: Box<DeclType>,
    },
}

impl DeclType {
    /// Replace the innermost `Base` leaf, wherever it is in the chain.
    fn graft_base(self, base: DeclType) -> DeclType {
        match self {
            DeclType::Base(_) => base,
            DeclType::Pointer { qualifiers, inner } => DeclType::Pointer {
                qualifiers,
                inner: Box::new(inner.graft_base(base)),
            },
            DeclType::Array { size, inner } => DeclType::Array {
                size,
                inner: Box::new(inner.graft_base(base)),
            },
            DeclType::Function { args, inner } => DeclType::Function {
                args,
                inner: Box::new(inner.graft_base(base)),
            },
        }
    }

    fn set_base_text(self, text: String) -> DeclType {
        self.graft_base(DeclType::Base(text))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclInfo {
    pub identifier: Option<String>,
    pub decl_type: DeclType,
}

fn text(tokens: &[Token], code: &[u8], i: usize) -> String {
    String::from_utf8_lossy(tokens[i].text(code)).into_owned()
}

fn join_range(tokens: &[Token], code: &[u8], start: usize, end: usize) -> String {
    let mut s = String::new();
    for i in start..end {
        s.push_str(&String::from_utf8_lossy(tokens[i].text(code)));
    }
    s.trim().to_string()
}

fn skip_ws(tokens: &[Token], mut i: usize, end: usize) -> usize {
    while i < end && tokens[i].is_trivia() {
        i += 1;
    }
    i
}

fn skip_ws_back(tokens: &[Token], start: usize, mut i: usize) -> usize {
    while i > start && tokens[i - 1].is_trivia() {
        i -= 1;
    }
    i
}

/// Skip a balanced `()`/`[]`/`{}` group; `open` indexes the opening token. Returns
/// the index just past the matching close (or `end` if unterminated).
fn skip_group(tokens: &[Token], open: usize, end: usize) -> usize {
    let (opener, closer) = match tokens[open].kind {
        TokenKind::Punct(Punctuator::OpenParen) => (Punctuator::OpenParen, Punctuator::CloseParen),
        TokenKind::Punct(Punctuator::OpenBracket) => {
            (Punctuator::OpenBracket, Punctuator::CloseBracket)
        }
        TokenKind::Punct(Punctuator::OpenBrace) => (Punctuator::OpenBrace, Punctuator::CloseBrace),
        _ => return open + 1,
    };
    let mut depth = 1usize;
    let mut i = open + 1;
    while i < end {
        match tokens[i].kind {
            TokenKind::Punct(p) if p == opener => depth += 1,
            TokenKind::Punct(p) if p == closer => {
                depth -= 1;
                if depth == 0 {
                    return i + 1;
                }
            }
            _ => {}
        }
        i += 1;
    }
    end
}

/// A `(` is a grouping paren (wraps a nested declarator) rather than a specifier's
/// or function's parameter list when the next significant token is `*`, `^`, `[`
/// or `(`.
fn is_grouping_paren(tokens: &[Token], open: usize, end: usize) -> bool {
    let next = skip_ws(tokens, open + 1, end);
    next < end
        && matches!(
            tokens[next].kind,
            TokenKind::Punct(Punctuator::Star)
                | TokenKind::Punct(Punctuator::Caret)
                | TokenKind::Punct(Punctuator::OpenBracket)
                | TokenKind::Punct(Punctuator::OpenParen)
        )
}

fn is_qualifier_text(s: &str) -> bool {
    matches!(s, "const" | "volatile" | "restrict" | "_Atomic")
}

enum Pivot {
    Ident(usize),
    Group(usize, usize),
    Operator(usize),
}

/// Scan `[start, end)` at this nesting level only (never descending into a group)
/// for the rightmost identifier, or failing that the rightmost grouping paren.
fn find_pivot(tokens: &[Token], start: usize, end: usize) -> Option<Pivot> {
    let mut i = start;
    let mut last_ident = None;
    let mut last_group = None;
    while i < end {
        match tokens[i].kind {
            TokenKind::Punct(Punctuator::OpenParen) => {
                if is_grouping_paren(tokens, i, end) {
                    let close = skip_group(tokens, i, end);
                    last_group = Some((i, close - 1));
                    i = close;
                    continue;
                }
                i = skip_group(tokens, i, end);
            }
            TokenKind::Punct(Punctuator::OpenBracket) => {
                i = skip_group(tokens, i, end);
            }
            TokenKind::Punct(Punctuator::OpenBrace) => {
                i = skip_group(tokens, i, end);
            }
            TokenKind::Identifier => {
                last_ident = Some(i);
                i += 1;
            }
            _ => i += 1,
        }
    }
    if let Some(idx) = last_ident {
        Some(Pivot::Ident(idx))
    } else if let Some((open, close)) = last_group {
        Some(Pivot::Group(open, close))
    } else {
        None
    }
}

/// Abstract-declarator fallback: the deepest grouping paren, else where operators
/// start.
fn find_abstract_pivot(tokens: &[Token], start: usize, end: usize) -> Option<Pivot> {
    let mut i = start;
    while i < end {
        if let TokenKind::Punct(Punctuator::OpenParen) = tokens[i].kind {
            if is_grouping_paren(tokens, i, end) {
                let close = skip_group(tokens, i, end);
                return Some(Pivot::Group(i, close - 1));
            }
            i = skip_group(tokens, i, end);
            continue;
        }
        if matches!(
            tokens[i].kind,
            TokenKind::Punct(Punctuator::Star)
                | TokenKind::Punct(Punctuator::OpenBracket)
                | TokenKind::Punct(Punctuator::OpenParen)
        ) {
            return Some(Pivot::Operator(i));
        }
        i += 1;
    }
    None
}

/// Consume suffix `[]`/`()` operators starting at `right`, then prefix `*`
/// operators ending at `left`, returning the grafted chain (with a placeholder
/// `Base("")` leaf) and the updated, narrowed `[left, right)` bounds.
fn spiral_walk(tokens: &[Token], code: &[u8], start: usize, end: usize, mut left: usize, mut right: usize) -> (DeclType, usize, usize) {
    right = skip_ws(tokens, right, end);
    // Suffixes are collected in encounter order (closest to the identifier
    // first) then folded back-to-front, so the first one encountered ends up
    // as the outermost wrapper: `a[3][4]` is an array of 3 arrays of 4, not
    // the reverse.
    enum Suffix {
        Array(Option<String>),
        Function(String),
    }
    let mut suffixes = Vec::new();
    loop {
        if right < end {
            match tokens[right].kind {
                TokenKind::Punct(Punctuator::OpenBracket) => {
                    let close = skip_group(tokens, right, end);
                    let inner_start = skip_ws(tokens, right + 1, close.saturating_sub(1));
                    let inner_end = skip_ws_back(tokens, inner_start, close.saturating_sub(1));
                    let size = if inner_end > inner_start {
                        Some(join_range(tokens, code, inner_start, inner_end))
                    } else {
                        None
                    };
                    suffixes.push(Suffix::Array(size));
                    right = skip_ws(tokens, close, end);
                    continue;
                }
                TokenKind::Punct(Punctuator::OpenParen) => {
                    let close = skip_group(tokens, right, end);
                    let args = join_range(tokens, code, right + 1, close.saturating_sub(1));
                    suffixes.push(Suffix::Function(args));
                    right = skip_ws(tokens, close, end);
                    continue;
                }
                _ => {}
            }
        }
        break;
    }
    let mut node: Option<DeclType> = None;
    for suffix in suffixes.into_iter().rev() {
        node = Some(match suffix {
            Suffix::Array(size) => DeclType::Array {
                size,
                inner: Box::new(node.take().unwrap_or(DeclType::Base(String::new()))),
            },
            Suffix::Function(args) => DeclType::Function {
                args,
                inner: Box::new(node.take().unwrap_or(DeclType::Base(String::new()))),
            },
        });
    }

    left = skip_ws_back(tokens, start, left);
    loop {
        if left > start {
            if let TokenKind::Punct(Punctuator::Star) = tokens[left - 1].kind {
                let mut quals = Vec::new();
                let mut j = left - 1;
                loop {
                    let before = skip_ws_back(tokens, start, j);
                    if before == start {
                        j = before;
                        break;
                    }
                    let candidate_text = text(tokens, code, before - 1);
                    let is_qual = matches!(tokens[before - 1].kind, TokenKind::Identifier | TokenKind::Keyword(_))
                        && is_qualifier_text(&candidate_text);
                    if is_qual {
                        quals.push(candidate_text);
                        j = before - 1;
                        continue;
                    }
                    j = before;
                    break;
                }
                quals.reverse();
                node = Some(DeclType::Pointer {
                    qualifiers: quals,
                    inner: Box::new(node.take().unwrap_or(DeclType::Base(String::new()))),
                });
                left = skip_ws_back(tokens, start, j);
                continue;
            }
        }
        break;
    }

    (node.unwrap_or(DeclType::Base(String::new())), left, right)
}

fn parse_range(tokens: &[Token], code: &[u8], start: usize, end: usize) -> Result<DeclInfo, TransformError> {
    let pivot = find_pivot(tokens, start, end).or_else(|| find_abstract_pivot(tokens, start, end));
    let pivot = pivot.ok_or_else(|| {
        TransformError::malformed_declarator(
            tokens.get(start).map(|t| t.offset).unwrap_or(0),
            "no pivot candidate found in declaration",
        )
    })?;

    match pivot {
        Pivot::Ident(idx) => {
            let identifier = Some(text(tokens, code, idx));
            let (chain, left, right) = spiral_walk(tokens, code, start, end, idx, idx + 1);
            let base_text = {
                let t = join_range(tokens, code, left, right);
                if t.is_empty() { "int".to_string() } else { t }
            };
            Ok(DeclInfo {
                identifier,
                decl_type: chain.set_base_text(base_text),
            })
        }
        Pivot::Operator(idx) => {
            let (chain, left, right) = spiral_walk(tokens, code, start, end, idx, idx);
            let base_text = {
                let t = join_range(tokens, code, left, right);
                if t.is_empty() { "int".to_string() } else { t }
            };
            Ok(DeclInfo {
                identifier: None,
                decl_type: chain.set_base_text(base_text),
            })
        }
        Pivot::Group(open, close_minus_one) => {
            let close = close_minus_one + 1;
            let inner = parse_range(tokens, code, open + 1, close_minus_one)?;
            let (outer_chain, left, right) = spiral_walk(tokens, code, start, end, open, close);
            let combined = outer_chain.graft_base(inner.decl_type);
            let base_text = {
                let t = join_range(tokens, code, left, right);
                if t.is_empty() { "int".to_string() } else { t }
            };
            Ok(DeclInfo {
                identifier: inner.identifier,
                decl_type: combined.set_base_text(base_text),
            })
        }
    }
}

/// Parse a declaration token range `[start, end)` into its `DeclInfo`.
pub fn parse_declaration(
    tokens: &[Token],
    code: &[u8],
    start: usize,
    end: usize,
) -> Result<DeclInfo, TransformError> {
    parse_range(tokens, code, start, end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn parse(src: &str) -> DeclInfo {
        let code = src.as_bytes();
        let tokens = tokenize(code);
        parse_declaration(&tokens, code, 0, tokens.len()).unwrap()
    }

    #[test]
    fn array_of_pointers_to_int() {
        let d = parse("int *a[]");
        assert_eq!(d.identifier.as_deref(), Some("a"));
        match d.decl_type {
            DeclType::Array { inner, .. } => match *inner {
                DeclType::Pointer { inner, .. } => {
                    assert_eq!(*inner, DeclType::Base("int".into()))
                }
                other => panic!("expected pointer, got {:?}", other),
            },
            other => panic!("expected array, got {:?}", other),
        }
    }

    #[test]
    fn plain_identifier_defaults_to_implicit_int() {
        let d = parse("x");
        assert_eq!(d.identifier.as_deref(), Some("x"));
        assert_eq!(d.decl_type, DeclType::Base("int".into()));
    }

    #[test]
    fn function_pointer_declarator() {
        let d = parse("int (*fp)(int)");
        assert_eq!(d.identifier.as_deref(), Some("fp"));
        match &d.decl_type {
            DeclType::Function { inner, .. } => match &**inner {
                DeclType::Pointer { inner, .. } => assert_eq!(**inner, DeclType::Base("int".into())),
                other => panic!("expected pointer, got {:?}", other),
            },
            other => panic!("expected function, got {:?}", other),
        }
    }
}
