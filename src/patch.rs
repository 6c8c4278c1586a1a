//! Applies a sorted list of token-range replacements to a token stream, producing
//! a new byte buffer. The only place original bytes and rewritten text are spliced
//! together.

use crate::token::Token;

#[derive(Debug, Clone)]
pub struct Patch {
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// A sorted collection of non-overlapping (beyond first-wins) patches.
///
/// Insertion patches have `start == end` and do not consume any token; when
/// more than one insertion targets the same point, `apply` emits all of them
/// in queue order rather than choosing among them, so callers that need a
/// single merged result at one point (see `body.rs`) combine their text
/// before calling `add`. Range-consuming patches that overlap are resolved by
/// queue order instead: whichever was added first wins and the later one is
/// dropped during `apply` rather than rely on an unspecified sort tie-break.
#[derive(Debug, Clone, Default)]
pub struct PatchList {
    patches: Vec<Patch>,
}

impl PatchList {
    pub fn new() -> Self {
        Self { patches: Vec::new() }
    }

    pub fn add(&mut self, start: usize, end: usize, text: impl Into<String>) {
        self.patches.push(Patch {
            start,
            end,
            text: text.into(),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Consume another patch list, shifting every patch's token indices by
    /// `offset`. Used to fold a body-local rewrite (indices relative to one
    /// function's body slice) back into the file-absolute patch list.
    pub fn merge_offset(&mut self, other: PatchList, offset: usize) {
        for patch in other.patches {
            self.patches.push(Patch {
                start: patch.start + offset,
                end: patch.end + offset,
                text: patch.text,
            });
        }
    }

    fn sort(&mut self) {
        self.patches.sort_by_key(|p| p.start);
    }

    /// Apply the patches against `tokens`, reading original bytes from `code`.
    pub fn apply(mut self, tokens: &[Token], code: &[u8]) -> Vec<u8> {
        self.sort();
        let mut out = Vec::new();
        let mut patch_idx = 0usize;
        let mut i = 0usize;
        let n = tokens.len();

        while i < n {
            if patch_idx < self.patches.len() && self.patches[patch_idx].start == i {
                let patch = &self.patches[patch_idx];
                out.extend_from_slice(patch.text.as_bytes());
                i = patch.end;
                patch_idx += 1;
                while patch_idx < self.patches.len() && self.patches[patch_idx].start < i {
                    patch_idx += 1;
                }
                continue;
            }
            out.extend_from_slice(tokens[i].text(code));
            i += 1;
        }

        while patch_idx < self.patches.len() {
            if self.patches[patch_idx].start >= n {
                out.extend_from_slice(self.patches[patch_idx].text.as_bytes());
            }
            patch_idx += 1;
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::token::tokenize;

    #[test]
    fn insertion_patch_does_not_consume_a_token() {
        let src = b"int x;";
        let tokens = tokenize(src);
        let mut patches = PatchList::new();
        // Insert right before the final ';'.
        let semi = tokens.iter().position(|t| t.text(src) == b";").unwrap();
        patches.add(semi, semi, " /* hi */");
        let out = patches.apply(&tokens, src);
        assert_eq!(out, b"int x /* hi */;".to_vec());
    }

    #[test]
    fn replacement_patch_replaces_the_covered_range() {
        let src = b"void f();";
        let tokens = tokenize(src);
        let void_idx = tokens.iter().position(|t| t.text(src) == b"void").unwrap();
        let mut patches = PatchList::new();
        patches.add(void_idx, void_idx + 1, "int");
        let out = patches.apply(&tokens, src);
        assert_eq!(out, b"int f();".to_vec());
    }

    #[test]
    fn overlapping_patches_first_wins() {
        let src = b"abc";
        let tokens = tokenize(src);
        let mut patches = PatchList::new();
        patches.add(0, 1, "X");
        patches.add(0, 1, "Y");
        let out = patches.apply(&tokens, src);
        assert_eq!(out, b"X".to_vec());
    }

    #[test]
    fn end_of_stream_append() {
        let src = b"x";
        let tokens = tokenize(src);
        let n = tokens.len();
        let mut patches = PatchList::new();
        patches.add(n, n, "!");
        let out = patches.apply(&tokens, src);
        assert_eq!(out, b"x!".to_vec());
    }
}
