//! Translation phases 1-3: trigraph substitution, line splicing, and tokenisation,
//! all folded into a single forward scan through [`peek_logical`].

use crate::field_tree::FieldTree;
use once_cell::sync::Lazy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Keyword {
    Auto, Break, Case, Char, Const, Continue, Default, Do, Double, Else, Enum, Extern,
    Float, For, Goto, If, Int, Long, Register, Return, Short, Signed, Sizeof, Static,
    Struct, Switch, Typedef, Union, Unsigned, Void, Volatile, While,
    // C99
    Inline, Restrict, Bool, Complex, Imaginary,
    // C11
    Alignas, Alignof, Atomic, Generic, Noreturn, StaticAssert, ThreadLocal,
    // C23
    Typeof, TypeofUnqual, True, False, Nullptr, Constexpr, BitInt, Decimal128,
    Decimal32, Decimal64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Punctuator {
    OpenBrace, CloseBrace, OpenBracket, CloseBracket, OpenParen, CloseParen,
    Semicolon, Comma, Colon, QuestionMark, Ellipsis,
    Dot, Arrow,
    Plus, Minus, Star, Slash, Percent,
    PlusPlus, MinusMinus,
    Amp, Pipe, Caret, Tilde, Bang,
    AmpAmp, PipePipe,
    Shl, Shr,
    Lt, Gt, Le, Ge, EqEq, NotEq,
    Assign, PlusEq, MinusEq, StarEq, SlashEq, PercentEq,
    AmpEq, PipeEq, CaretEq, ShlEq, ShrEq,
    Hash, HashHash,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Whitespace,
    Comment,
    Macro,
    Identifier,
    Keyword(Keyword),
    Number,
    StringLiteral,
    CharLiteral,
    Punct(Punctuator),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub offset: usize,
    pub length: usize,
    pub kind: TokenKind,
}

impl Token {
    pub fn end(&self) -> usize {
        self.offset + self.length
    }

    pub fn text<'c>(&self, code: &'c [u8]) -> &'c [u8] {
        &code[self.offset..self.end()]
    }

    pub fn is_trivia(&self) -> bool {
        matches!(self.kind, TokenKind::Whitespace | TokenKind::Comment)
    }
}

fn trigraph_char(c: u8) -> Option<u8> {
    match c {
        b'=' => Some(b'#'),
        b'(' => Some(b'['),
        b'/' => Some(b'\\'),
        b')' => Some(b']'),
        b'\'' => Some(b'^'),
        b'<' => Some(b'{'),
        b'!' => Some(b'|'),
        b'>' => Some(b'}'),
        b'-' => Some(b'~'),
        _ => None,
    }
}

/// Return the next logical character starting at physical offset `start`, along with
/// the number of physical bytes it consumed (trigraphs count as 3, spliced lines fold
/// away entirely into the count).
pub fn peek_logical(src: &[u8], start: usize) -> Option<(u8, usize)> {
    let mut cur = start;
    loop {
        if cur >= src.len() {
            return None;
        }
        let (ch, step) = if cur + 2 < src.len() && src[cur] == b'?' && src[cur + 1] == b'?' {
            match trigraph_char(src[cur + 2]) {
                Some(mapped) => (mapped, 3),
                None => (src[cur], 1),
            }
        } else {
            (src[cur], 1)
        };
        if ch == b'\\' {
            let after = cur + step;
            if after < src.len() && src[after] == b'\n' {
                cur = after + 1;
                continue;
            }
            if after + 1 < src.len() && src[after] == b'\r' && src[after + 1] == b'\n' {
                cur = after + 2;
                continue;
            }
        }
        return Some((ch, (cur + step) - start));
    }
}

/// Materialise up to `max_chars` logical characters starting at `pos`, returning the
/// logical bytes and the physical length each one consumed. Used for table lookups
/// (keywords, punctuators) that must see through splices but operate on short windows.
fn materialize_logical(src: &[u8], pos: usize, max_chars: usize) -> (Vec<u8>, Vec<usize>) {
    let mut chars = Vec::with_capacity(max_chars);
    let mut steps = Vec::with_capacity(max_chars);
    let mut cur = pos;
    for _ in 0..max_chars {
        match peek_logical(src, cur) {
            Some((ch, step)) => {
                chars.push(ch);
                steps.push(step);
                cur += step;
            }
            None => break,
        }
    }
    (chars, steps)
}

fn is_ident_start(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphabetic()
}

fn is_ident_continue(c: u8) -> bool {
    c == b'_' || c.is_ascii_alphanumeric()
}

fn is_ucn_start(src: &[u8], pos: usize) -> Option<usize> {
    if pos + 1 >= src.len() || src[pos] != b'\\' {
        return None;
    }
    let (hex_len, marker) = match src[pos + 1] {
        b'u' => (4, 2),
        b'U' => (8, 2),
        _ => return None,
    };
    if pos + marker + hex_len > src.len() {
        return None;
    }
    if src[pos + marker..pos + marker + hex_len]
        .iter()
        .all(u8::is_ascii_hexdigit)
    {
        Some(marker + hex_len)
    } else {
        None
    }
}

static KEYWORDS: Lazy<FieldTree<Keyword>> = Lazy::new(|| {
    use Keyword::*;
    let mut tree = FieldTree::new();
    let entries: &[(&str, Keyword)] = &[
        ("auto", Auto), ("break", Break), ("case", Case), ("char", Char),
        ("const", Const), ("continue", Continue), ("default", Default), ("do", Do),
        ("double", Double), ("else", Else), ("enum", Enum), ("extern", Extern),
        ("float", Float), ("for", For), ("goto", Goto), ("if", If), ("int", Int),
        ("long", Long), ("register", Register), ("return", Return), ("short", Short),
        ("signed", Signed), ("sizeof", Sizeof), ("static", Static), ("struct", Struct),
        ("switch", Switch), ("typedef", Typedef), ("union", Union), ("unsigned", Unsigned),
        ("void", Void), ("volatile", Volatile), ("while", While),
        ("inline", Inline), ("restrict", Restrict), ("_Bool", Bool),
        ("_Complex", Complex), ("_Imaginary", Imaginary),
        ("_Alignas", Alignas), ("_Alignof", Alignof), ("_Atomic", Atomic),
        ("_Generic", Generic), ("_Noreturn", Noreturn), ("_Static_assert", StaticAssert),
        ("_Thread_local", ThreadLocal),
        ("typeof", Typeof), ("typeof_unqual", TypeofUnqual), ("true", True),
        ("false", False), ("nullptr", Nullptr), ("constexpr", Constexpr),
        ("_BitInt", BitInt), ("_Decimal128", Decimal128), ("_Decimal32", Decimal32),
        ("_Decimal64", Decimal64),
    ];
    for (text, kw) in entries {
        tree.insert(text.as_bytes(), *kw).ok();
    }
    tree
});

static PUNCTUATORS: Lazy<FieldTree<Punctuator>> = Lazy::new(|| {
    use Punctuator::*;
    let mut tree = FieldTree::new();
    let entries: &[(&str, Punctuator)] = &[
        ("{", OpenBrace), ("}", CloseBrace), ("[", OpenBracket), ("]", CloseBracket),
        ("(", OpenParen), (")", CloseParen), (";", Semicolon), (",", Comma),
        (":", Colon), ("?", QuestionMark), ("...", Ellipsis),
        (".", Dot), ("->", Arrow),
        ("+", Plus), ("-", Minus), ("*", Star), ("/", Slash), ("%", Percent),
        ("++", PlusPlus), ("--", MinusMinus),
        ("&", Amp), ("|", Pipe), ("^", Caret), ("~", Tilde), ("!", Bang),
        ("&&", AmpAmp), ("||", PipePipe),
        ("<<", Shl), (">>", Shr),
        ("<", Lt), (">", Gt), ("<=", Le), (">=", Ge), ("==", EqEq), ("!=", NotEq),
        ("=", Assign), ("+=", PlusEq), ("-=", MinusEq), ("*=", StarEq),
        ("/=", SlashEq), ("%=", PercentEq),
        ("&=", AmpEq), ("|=", PipeEq), ("^=", CaretEq), ("<<=", ShlEq), (">>=", ShrEq),
        ("#", Hash), ("##", HashHash),
        // digraphs
        ("<%", OpenBrace), ("%>", CloseBrace), ("<:", OpenBracket), (":>", CloseBracket),
        ("%:", Hash), ("%:%:", HashHash),
    ];
    for (text, p) in entries {
        // Several spellings (e.g. digraphs) map to the same canonical punctuator;
        // only the first insertion per distinct byte sequence is expected to win.
        let _ = tree.insert(text.as_bytes(), *p);
    }
    tree
});

struct Scanner<'s> {
    src: &'s [u8],
    pos: usize,
    at_line_start: bool,
}

impl<'s> Scanner<'s> {
    fn new(src: &'s [u8]) -> Self {
        Self {
            src,
            pos: 0,
            at_line_start: true,
        }
    }

    fn advance_whitespace(&mut self) -> usize {
        let start = self.pos;
        let mut saw_newline = false;
        while let Some((ch, step)) = peek_logical(self.src, self.pos) {
            if ch == b' ' || ch == b'\t' || ch == 0x0b || ch == 0x0c || ch == b'\r' {
                self.pos += step;
            } else if ch == b'\n' {
                saw_newline = true;
                self.pos += step;
            } else {
                break;
            }
        }
        if saw_newline {
            self.at_line_start = true;
        }
        self.pos - start
    }

    fn scan_line_comment(&mut self) {
        while let Some((ch, step)) = peek_logical(self.src, self.pos) {
            if ch == b'\n' {
                break;
            }
            self.pos += step;
        }
    }

    fn scan_block_comment(&mut self) {
        loop {
            match peek_logical(self.src, self.pos) {
                None => break,
                Some((b'*', step1)) => {
                    let after_star = self.pos + step1;
                    match peek_logical(self.src, after_star) {
                        Some((b'/', step2)) => {
                            self.pos = after_star + step2;
                            break;
                        }
                        _ => self.pos += step1,
                    }
                }
                Some((_, step)) => self.pos += step,
            }
        }
    }

    fn scan_macro_line(&mut self) {
        while let Some((ch, step)) = peek_logical(self.src, self.pos) {
            if ch == b'\n' {
                break;
            }
            self.pos += step;
        }
    }

    fn scan_identifier(&mut self) {
        loop {
            if let Some(ucn_len) = is_ucn_start(self.src, self.pos) {
                self.pos += ucn_len;
                continue;
            }
            match peek_logical(self.src, self.pos) {
                Some((ch, step)) if is_ident_continue(ch) => self.pos += step,
                _ => break,
            }
        }
    }

    fn scan_number(&mut self) {
        loop {
            match peek_logical(self.src, self.pos) {
                Some((ch, step)) if ch.is_ascii_alphanumeric() || ch == b'.' => {
                    self.pos += step
                }
                Some((b'\'', step)) => {
                    let after = self.pos + step;
                    match peek_logical(self.src, after) {
                        Some((next, _)) if next.is_ascii_alphanumeric() => self.pos = after,
                        _ => break,
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_quoted(&mut self, quote: u8) {
        loop {
            match peek_logical(self.src, self.pos) {
                None => break,
                Some((b'\\', step)) => {
                    self.pos += step;
                    if let Some((_, step2)) = peek_logical(self.src, self.pos) {
                        self.pos += step2;
                    }
                }
                Some((ch, step)) if ch == quote => {
                    self.pos += step;
                    break;
                }
                Some((_, step)) => self.pos += step,
            }
        }
    }
}

/// Lex a C translation unit. Never fails: ill-formed input is returned as tokens that
/// still reconstruct the original bytes exactly.
pub fn tokenize(src: &[u8]) -> Vec<Token> {
    let mut scanner = Scanner::new(src);
    let mut tokens = Vec::new();
    let len = src.len();

    while scanner.pos < len {
        let start = scanner.pos;
        let (ch0, step0) = match peek_logical(src, scanner.pos) {
            Some(v) => v,
            None => break,
        };

        if ch0 == b' ' || ch0 == b'\t' || ch0 == b'\n' || ch0 == b'\r' || ch0 == 0x0b || ch0 == 0x0c
        {
            scanner.advance_whitespace();
            tokens.push(Token {
                offset: start,
                length: scanner.pos - start,
                kind: TokenKind::Whitespace,
            });
            continue;
        }

        if ch0 == b'/' {
            if let Some((next, step1)) = peek_logical(src, scanner.pos + step0) {
                if next == b'/' {
                    scanner.pos += step0 + step1;
                    scanner.scan_line_comment();
                    tokens.push(Token {
                        offset: start,
                        length: scanner.pos - start,
                        kind: TokenKind::Comment,
                    });
                    scanner.at_line_start = false;
                    continue;
                } else if next == b'*' {
                    scanner.pos += step0 + step1;
                    scanner.scan_block_comment();
                    tokens.push(Token {
                        offset: start,
                        length: scanner.pos - start,
                        kind: TokenKind::Comment,
                    });
                    scanner.at_line_start = false;
                    continue;
                }
            }
        }

        if ch0 == b'#' && scanner.at_line_start {
            scanner.pos += step0;
            scanner.scan_macro_line();
            tokens.push(Token {
                offset: start,
                length: scanner.pos - start,
                kind: TokenKind::Macro,
            });
            scanner.at_line_start = false;
            continue;
        }

        if is_ident_start(ch0) || is_ucn_start(src, scanner.pos).is_some() {
            if is_ucn_start(src, scanner.pos).is_some() {
                scanner.pos += is_ucn_start(src, scanner.pos).unwrap();
            } else {
                scanner.pos += step0;
            }
            scanner.scan_identifier();
            let raw = &src[start..scanner.pos];

            // A bare L/u8/u/U immediately followed by a quote is a literal prefix, not
            // an identifier.
            if matches!(raw, b"L" | b"u8" | b"u" | b"U") {
                if let Some((q, _)) = peek_logical(src, scanner.pos) {
                    if q == b'"' || q == b'\'' {
                        continue_as_literal(src, &mut scanner, start, &mut tokens);
                        scanner.at_line_start = false;
                        continue;
                    }
                }
            }

            let kind = match KEYWORDS.find(raw) {
                Some((kw, n)) if n == raw.len() => TokenKind::Keyword(kw),
                _ => {
                    let logical = {
                        let (chars, _) = materialize_logical(src, start, raw.len().max(1) * 4);
                        chars
                    };
                    match KEYWORDS.find(&logical) {
                        Some((kw, n)) if n == logical.len() => TokenKind::Keyword(kw),
                        _ => TokenKind::Identifier,
                    }
                }
            };
            tokens.push(Token {
                offset: start,
                length: scanner.pos - start,
                kind,
            });
            scanner.at_line_start = false;
            continue;
        }

        if ch0.is_ascii_digit() || (ch0 == b'.' && {
            peek_logical(src, scanner.pos + step0)
                .map(|(n, _)| n.is_ascii_digit())
                .unwrap_or(false)
        }) {
            scanner.pos += step0;
            scanner.scan_number();
            tokens.push(Token {
                offset: start,
                length: scanner.pos - start,
                kind: TokenKind::Number,
            });
            scanner.at_line_start = false;
            continue;
        }

        if ch0 == b'"' || ch0 == b'\'' {
            continue_as_literal(src, &mut scanner, start, &mut tokens);
            scanner.at_line_start = false;
            continue;
        }

        let (window, steps) = materialize_logical(src, scanner.pos, 4);
        match PUNCTUATORS.find(&window) {
            Some((p, n)) if n > 0 => {
                let physical: usize = steps[..n].iter().sum();
                scanner.pos += physical;
                tokens.push(Token {
                    offset: start,
                    length: scanner.pos - start,
                    kind: TokenKind::Punct(p),
                });
            }
            _ => {
                scanner.pos += step0;
                tokens.push(Token {
                    offset: start,
                    length: scanner.pos - start,
                    kind: TokenKind::Punct(Punctuator::Unknown),
                });
            }
        }
        scanner.at_line_start = false;
    }

    tokens
}

fn continue_as_literal(src: &[u8], scanner: &mut Scanner, start: usize, tokens: &mut Vec<Token>) {
    let (quote, step) = peek_logical(src, scanner.pos).unwrap();
    scanner.pos += step;
    scanner.scan_quoted(quote);
    let kind = if quote == b'"' {
        TokenKind::StringLiteral
    } else {
        TokenKind::CharLiteral
    };
    tokens.push(Token {
        offset: start,
        length: scanner.pos - start,
        kind,
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reassembled(src: &[u8], tokens: &[Token]) -> Vec<u8> {
        tokens.iter().flat_map(|t| t.text(src).to_vec()).collect()
    }

    #[test]
    fn round_trips_arbitrary_source() {
        let src = b"int main(void) {\n  return 0;\n}\n";
        let tokens = tokenize(src);
        assert_eq!(reassembled(src, &tokens), src.to_vec());
    }

    #[test]
    fn splices_inside_keyword() {
        let src = b"i\\\nnt x;";
        let tokens = tokenize(src);
        assert_eq!(tokens[0].kind, TokenKind::Keyword(Keyword::Int));
        assert_eq!(reassembled(src, &tokens), src.to_vec());
    }

    #[test]
    fn trigraphs_resolve_to_punctuators() {
        let src = b"??( x ??)";
        let tokens = tokenize(src);
        assert_eq!(tokens[0].kind, TokenKind::Punct(Punctuator::OpenBracket));
    }

    #[test]
    fn unterminated_block_comment_runs_to_eof() {
        let src = b"/* never closes";
        let tokens = tokenize(src);
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].kind, TokenKind::Comment);
        assert_eq!(tokens[0].length, src.len());
    }

    #[test]
    fn digit_separator_only_before_alnum() {
        let src = b"123'4 123'";
        let tokens = tokenize(src);
        assert_eq!(tokens[0].kind, TokenKind::Number);
        assert_eq!(tokens[0].text(src), b"123'4");
        // "123'" splits into a number and a stray punctuator.
        let kinds: Vec<_> = tokens.iter().map(|t| t.kind).collect();
        assert!(kinds.contains(&TokenKind::Punct(Punctuator::Unknown))
            || tokens.iter().any(|t| t.text(src) == b"'"));
    }

    #[test]
    fn macro_directive_is_a_single_token() {
        let src = b"#include <stdio.h>\nint x;";
        let tokens = tokenize(src);
        assert_eq!(tokens[0].kind, TokenKind::Macro);
        assert_eq!(tokens[0].text(src), b"#include <stdio.h>");
    }

    #[test]
    fn digraphs_map_to_canonical_punctuator() {
        let src = b"<% %>";
        let tokens = tokenize(src);
        assert_eq!(tokens[0].kind, TokenKind::Punct(Punctuator::OpenBrace));
        assert_eq!(tokens[2].kind, TokenKind::Punct(Punctuator::CloseBrace));
    }
}
