//! `c-refactor` is a source-to-source transformation tool for C translation units.
//!
//! # Overview
//!
//! Given one translation unit's bytes, [`transform_source`] lexes it (translation
//! phases 1-3: trigraphs, line splicing, tokenisation), groups the token stream into
//! a flat concrete-syntax tree of top-level constructs, scans for calls to known
//! allocator functions whose failure case is not checked, and emits a rewritten
//! program that:
//!
//! - injects a `NULL`/error-code check immediately after every unchecked allocation
//!   site,
//! - converts every function that returns `void` or a pointer (except `main`) into
//!   one that returns an `int` status code and writes its original result through an
//!   output parameter,
//! - propagates that new calling convention through every call site of a rewritten
//!   function, including call sites nested inside other expressions or already
//!   refactored callers.
//!
//! Constructs the pipeline cannot deeply analyse (most declarations, all control
//! flow, macro bodies) are copied through unchanged rather than rejected, see
//! [`cst`] for the boundary between "recognised" and "copied verbatim".
//!
//! # Example
//!
//! ```
//! let input = b"void f() { char *p = malloc(10); *p = 5; }";
//! let output = c_refactor::transform_source(input).unwrap();
//! let output = String::from_utf8(output).unwrap();
//! assert!(output.contains("if (!p) { return ENOMEM; }"));
//! assert!(output.starts_with("int f()"));
//! ```
//!
//! # License
//! `c-refactor` is provided under the MIT OR Apache-2.0 license.

mod alloc;
mod body;
mod cst;
mod decl;
mod error;
mod field_tree;
mod orchestrator;
mod patch;
mod sigrewrite;
mod token;
mod util;

pub use error::TransformError;
pub use orchestrator::{transform_source, FunctionMeta};

pub use alloc::{AllocShape, AllocationSite, AllocatorSpec, CheckStyle};
pub use body::{CalleeKind, RefactoredFunction, SignatureTransform, TransformKind};
pub use cst::{CstKind, CstNode, CstTree};
pub use decl::{DeclInfo, DeclType};
pub use patch::{Patch, PatchList};
pub use sigrewrite::{rewrite_header, HeaderTransform, RewrittenHeader};
pub use token::{tokenize, Keyword, Punctuator, Token, TokenKind};
pub use util::{Code, Log, Position};
