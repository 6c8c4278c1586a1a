//! Transforms a single function header (storage/attributes, return type, name
//! and parameter list) into its new signature form. Never touches the body.

use crate::error::TransformError;
use crate::token::{Punctuator, Token, TokenKind};

const STORAGE_WORDS: &[&str] = &["static", "extern", "typedef", "inline", "__inline"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderTransform {
    /// Return type already `int` (modulo `signed`): header copied through verbatim.
    Unchanged,
    /// `void` replaced with `int`; argument list untouched.
    VoidToInt,
    /// Any other return type: becomes `int name(args, <return-type> *out)`.
    PointerToOut { return_type: String },
}

#[derive(Debug, Clone)]
pub struct RewrittenHeader {
    pub text: String,
    pub name: String,
    pub transform: HeaderTransform,
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

fn tok_text(tokens: &[Token], code: &[u8], i: usize) -> String {
    String::from_utf8_lossy(tokens[i].text(code)).into_owned()
}

fn join_range(tokens: &[Token], code: &[u8], start: usize, end: usize) -> String {
    let mut s = String::new();
    for i in start..end {
        s.push_str(&String::from_utf8_lossy(tokens[i].text(code)));
    }
    s
}

/// Significant (non-whitespace, non-comment) token texts in `[start, end)`.
fn significant_words(tokens: &[Token], code: &[u8], start: usize, end: usize) -> Vec<String> {
    (start..end)
        .filter(|&i| !tokens[i].is_trivia())
        .map(|i| tok_text(tokens, code, i))
        .collect()
}

/// Consume a leading run of storage-class keywords and `[[...]]` attribute spans
/// starting at `start`, returning the index just past the consumed prefix.
fn skip_storage_prefix(tokens: &[Token], code: &[u8], start: usize, end: usize) -> usize {
    let mut i = start;
    loop {
        let cur = match next_non_trivia(tokens, i, end) {
            Some(c) => c,
            None => return i,
        };
        if tokens[cur].kind == TokenKind::Punct(Punctuator::OpenBracket) {
            if let Some(second) = next_non_trivia(tokens, cur + 1, end) {
                if tokens[second].kind == TokenKind::Punct(Punctuator::OpenBracket) {
                    // Balanced scan for the closing `]]`.
                    let mut depth = 2i32;
                    let mut j = second + 1;
                    while j < end && depth > 0 {
                        match tokens[j].kind {
                            TokenKind::Punct(Punctuator::OpenBracket) => depth += 1,
                            TokenKind::Punct(Punctuator::CloseBracket) => depth -= 1,
                            _ => {}
                        }
                        j += 1;
                    }
                    i = j;
                    continue;
                }
            }
        }
        if matches!(
            tokens[cur].kind,
            TokenKind::Identifier | TokenKind::Keyword(_)
        ) && STORAGE_WORDS.contains(&tok_text(tokens, code, cur).as_str())
        {
            i = cur + 1;
            continue;
        }
        return i;
    }
}

/// Rewrite the header token range `[start, end)`, from the start of the function
/// declaration through (and including) the parameter list's closing paren.
pub fn rewrite_header(
    tokens: &[Token],
    code: &[u8],
    start: usize,
    end: usize,
) -> Result<RewrittenHeader, TransformError> {
    let open_paren = (start..end)
        .find(|&i| tokens[i].kind == TokenKind::Punct(Punctuator::OpenParen))
        .ok_or_else(|| {
            TransformError::malformed_declarator(
                tokens.get(start).map(|t| t.offset).unwrap_or(0),
                "no parameter list in function header",
            )
        })?;
    let close_paren = {
        let mut depth = 1usize;
        let mut i = open_paren + 1;
        let mut found = None;
        while i < end {
            match tokens[i].kind {
                TokenKind::Punct(Punctuator::OpenParen) => depth += 1,
                TokenKind::Punct(Punctuator::CloseParen) => {
                    depth -= 1;
                    if depth == 0 {
                        found = Some(i);
                        break;
                    }
                }
                _ => {}
            }
            i += 1;
        }
        found.ok_or_else(|| {
            TransformError::malformed_declarator(tokens[open_paren].offset, "unterminated parameter list")
        })?
    };

    let name_idx = prev_non_trivia(tokens, start, open_paren).ok_or_else(|| {
        TransformError::malformed_declarator(tokens[open_paren].offset, "no identifier before parameter list")
    })?;
    if tokens[name_idx].kind != TokenKind::Identifier {
        return Err(TransformError::malformed_declarator(
            tokens[name_idx].offset,
            "function-pointer-shaped declarator, not a plain function name",
        ));
    }
    let name = tok_text(tokens, code, name_idx);

    let storage_end = skip_storage_prefix(tokens, code, start, name_idx);
    let storage_text = join_range(tokens, code, start, storage_end);
    let return_type_text = join_range(tokens, code, storage_end, name_idx);
    let args_text = join_range(tokens, code, open_paren + 1, close_paren);
    let args_trimmed = args_text.trim();
    let args_empty_or_void = args_trimmed.is_empty() || args_trimmed == "void";

    let return_words = significant_words(tokens, code, storage_end, name_idx);
    let is_plain_int = match return_words.as_slice() {
        [w] if w == "int" => true,
        [a, b] if a == "signed" && b == "int" => true,
        _ => false,
    };
    let is_void = matches!(return_words.as_slice(), [w] if w == "void");

    if is_plain_int {
        return Ok(RewrittenHeader {
            text: join_range(tokens, code, start, close_paren + 1),
            name,
            transform: HeaderTransform::Unchanged,
        });
    }

    let storage_prefix = storage_text.trim();
    let storage_out = if storage_prefix.is_empty() {
        String::new()
    } else {
        format!("{} ", storage_prefix)
    };

    if is_void {
        let text = format!("{}int {}({})", storage_out, name, args_text);
        return Ok(RewrittenHeader {
            text,
            name,
            transform: HeaderTransform::VoidToInt,
        });
    }

    let return_type_trimmed = return_type_text.trim_end().to_string();
    let sep = if args_empty_or_void { "" } else { ", " };
    let text = format!(
        "{}int {}({}{}{} *out)",
        storage_out, name, args_text, sep, return_type_trimmed
    );

    Ok(RewrittenHeader {
        text,
        name,
        transform: HeaderTransform::PointerToOut {
            return_type: return_type_trimmed,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    fn header_range(src: &str) -> (Vec<Token>, usize, usize) {
        let code = src.as_bytes();
        let tokens = tokenize(code);
        let close_brace_or_paren = tokens
            .iter()
            .position(|t| t.kind == TokenKind::Punct(Punctuator::CloseParen))
            .unwrap();
        (tokens.clone(), 0, close_brace_or_paren + 1)
    }

    #[test]
    fn void_becomes_int() {
        let (tokens, s, e) = header_range("void f(int x)");
        let code = b"void f(int x)";
        let h = rewrite_header(&tokens, code, s, e).unwrap();
        assert_eq!(h.text, "int f(int x)");
        assert_eq!(h.transform, HeaderTransform::VoidToInt);
    }

    #[test]
    fn plain_int_is_unchanged() {
        let (tokens, s, e) = header_range("int f(int x)");
        let code = b"int f(int x)";
        let h = rewrite_header(&tokens, code, s, e).unwrap();
        assert_eq!(h.text, "int f(int x)");
        assert_eq!(h.transform, HeaderTransform::Unchanged);
    }

    #[test]
    fn pointer_return_gains_out_param() {
        let (tokens, s, e) = header_range("char* A()");
        let code = b"char* A()";
        let h = rewrite_header(&tokens, code, s, e).unwrap();
        assert_eq!(h.text, "int A(char* *out)");
    }

    #[test]
    fn pointer_return_with_existing_args_gets_comma() {
        let (tokens, s, e) = header_range("char *dup(const char *s)");
        let code = b"char *dup(const char *s)";
        let h = rewrite_header(&tokens, code, s, e).unwrap();
        assert_eq!(h.text, "int dup(const char *s, char * *out)");
    }

    #[test]
    fn static_storage_prefix_preserved() {
        let (tokens, s, e) = header_range("static void f(void)");
        let code = b"static void f(void)";
        let h = rewrite_header(&tokens, code, s, e).unwrap();
        assert_eq!(h.text, "static int f(void)");
    }

    #[test]
    fn idempotent_on_its_own_output() {
        let code = b"int f(int x, char* *out)";
        let tokens = tokenize(code);
        let close = tokens
            .iter()
            .position(|t| t.kind == TokenKind::Punct(Punctuator::CloseParen))
            .unwrap();
        let h1 = rewrite_header(&tokens, code, 0, close + 1).unwrap();
        let tokens2 = tokenize(h1.text.as_bytes());
        let close2 = tokens2
            .iter()
            .position(|t| t.kind == TokenKind::Punct(Punctuator::CloseParen))
            .unwrap();
        let h2 = rewrite_header(&tokens2, h1.text.as_bytes(), 0, close2 + 1).unwrap();
        assert_eq!(h2.text, h1.text);
        assert_eq!(h2.transform, HeaderTransform::Unchanged);
    }
}
