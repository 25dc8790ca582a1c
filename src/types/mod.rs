//! Shared data-model types: source spans, spanned values, and the index
//! newtypes used by the pools on [`Compiler`](crate::Compiler).

pub mod ast;
pub mod entity;
pub mod ty;
pub mod ir;
pub mod nu;

use std::fmt;
use crate::symbol::{Symbol, intern};

/// A location in some source file: interned file name plus 1-based line.
/// Every AST node carries one so that any pass can point an error at
/// source; nodes created by rewrite passes inherit the span of the node
/// they replace (see [`ast::AstPool::report_as`]).
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct SrcSpan {
  pub file: Symbol,
  pub line: u32,
}

impl SrcSpan {
  /// The "no source" span, used for synthesised nodes that have no
  /// natural origin (builtin declarations, internal constants).
  #[must_use] pub fn none() -> SrcSpan { SrcSpan { file: intern(""), line: 0 } }

  #[must_use] pub fn is_none(self) -> bool { self.line == 0 }
}

impl fmt::Display for SrcSpan {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.is_none() { write!(f, "<no source>") }
    else { write!(f, "{}:{}", self.file, self.line) }
  }
}

/// A value together with the span it came from.
#[derive(Copy, Clone, Debug)]
pub struct Spanned<T> {
  pub span: SrcSpan,
  pub k: T,
}

impl<T> Spanned<T> {
  pub fn new(span: SrcSpan, k: T) -> Self { Spanned { span, k } }
}

macro_rules! mk_id {
  ($($(#[$doc:meta])* $name:ident),* $(,)?) => {$(
    $(#[$doc])*
    #[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Debug)]
    pub struct $name(pub u32);
    impl $name {
      #[must_use] pub fn idx(self) -> usize { self.0 as usize }
      #[must_use] pub fn from_usize(n: usize) -> Self {
        Self(u32::try_from(n).expect("id overflow"))
      }
    }
  )*}
}

mk_id! {
  /// Handle to a node in the [`ast::AstPool`].
  AstId,
  /// Handle to a module in the compiler session.
  ModuleId,
  /// Handle to a function in the compiler session.
  FuncId,
  /// Handle to a Nu IR label.
  NuLabelId,
}
