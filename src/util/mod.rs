mod code;
mod log;
mod position;

use once_cell::unsync::OnceCell;

#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
/// The line and column at a byte offset into a [Code] buffer.
pub struct Position {
    pub line: usize,
    pub column: usize,
}

/// Owning wrapper around the input source bytes.
///
/// Line-break offsets are computed lazily and cached, mirroring the way a single
/// source file is walked many times over the course of lexing, analysis, and
/// rewriting but its line table is only ever needed for diagnostics.
pub struct Code<'c> {
    pub value: &'c [u8],
    line_breaks: OnceCell<Vec<usize>>,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
/// Multiple levels of debugging that can be assigned to a pipeline stage.
pub enum Log<T> {
    None,
    Default(T),
    Success(T),
    Result(T),
    Verbose(T),
}
