//! Diagnostics. Errors are reported immediately to stderr with source
//! location and (optionally) colour, then counted; passes keep going so
//! the user sees multiple problems per run. A session aborts once the
//! error count reaches the configured maximum.

use std::fmt;
use std::io::Write;
use crate::types::SrcSpan;

/// The error taxonomy. Warnings reuse the kind of the check that fired.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DiagKind {
  /// Duplicate, not-found, wrong-kind, aliasing failure.
  Symbol,
  /// Incompatible assignment/return, bad cast, bad interface conversion,
  /// argument count/type mismatch, const discarded.
  Type,
  /// Bad operand, out-of-range immediate or branch, illegal relocatable
  /// math, missing `##`, misplaced wc/wz.
  Asm,
  /// Initializer too large, union mismatch, alignment impossible,
  /// missing DAT file.
  Layout,
  /// Image too large, compression grew the image, MAX_BRK exceeded.
  Resource,
  /// Invariant violated inside the compiler; reported with the offending
  /// AST kind.
  Internal,
}

impl fmt::Display for DiagKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      DiagKind::Symbol => "symbol error",
      DiagKind::Type => "type error",
      DiagKind::Asm => "assembler error",
      DiagKind::Layout => "layout error",
      DiagKind::Resource => "resource error",
      DiagKind::Internal => "internal error",
    })
  }
}

/// The accumulating diagnostics sink.
pub struct Diagnostics {
  errors: u32,
  warnings: u32,
  max_errors: u32,
  pub colorize: bool,
  pub warnings_as_errors: bool,
  /// When set, reports are collected here instead of stderr (tests).
  capture: Option<Vec<String>>,
}

impl Diagnostics {
  #[must_use] pub fn new(max_errors: u32) -> Self {
    Diagnostics {
      errors: 0, warnings: 0, max_errors,
      colorize: false, warnings_as_errors: false, capture: None,
    }
  }

  #[must_use] pub fn errors(&self) -> u32 { self.errors }
  #[must_use] pub fn warnings(&self) -> u32 { self.warnings }

  /// True once the maximum error count is reached; every pass checks
  /// this on entry and short-circuits.
  #[must_use] pub fn too_many(&self) -> bool {
    self.max_errors != 0 && self.errors >= self.max_errors
  }

  fn emit(&mut self, span: SrcSpan, severity: &str, color: &str,
          kind: DiagKind, msg: &str) {
    let mut line = String::new();
    if !span.is_none() {
      line.push_str(&format!("{span}: "));
    }
    if self.colorize {
      line.push_str(&format!("\x1b[{color}m{severity}\x1b[0m"));
    } else {
      line.push_str(severity);
    }
    line.push_str(&format!(": {kind}: {msg}"));
    match &mut self.capture {
      Some(buf) => buf.push(line),
      None => { let _ = writeln!(std::io::stderr(), "{line}"); }
    }
  }

  /// Report an error and keep going.
  pub fn error(&mut self, span: SrcSpan, kind: DiagKind, msg: impl AsRef<str>) {
    self.emit(span, "error", "31;1", kind, msg.as_ref());
    self.errors += 1;
  }

  /// Report a warning. Counts as an error under `warnings_as_errors`.
  pub fn warning(&mut self, span: SrcSpan, kind: DiagKind, msg: impl AsRef<str>) {
    self.emit(span, "warning", "33;1", kind, msg.as_ref());
    self.warnings += 1;
    if self.warnings_as_errors { self.errors += 1 }
  }

  /// Add a "previous definition here" style note to the last report.
  pub fn note(&mut self, span: SrcSpan, msg: impl AsRef<str>) {
    self.emit(span, "note", "36", DiagKind::Symbol, msg.as_ref());
  }

  /// Route reports into a buffer, for tests.
  pub fn capture(&mut self) { self.capture = Some(Vec::new()) }

  #[must_use] pub fn captured(&self) -> &[String] {
    self.capture.as_deref().unwrap_or(&[])
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::symbol::intern;

  #[test]
  fn counts_and_cutoff() {
    let mut d = Diagnostics::new(2);
    d.capture();
    let sp = SrcSpan { file: intern("x.spin"), line: 7 };
    assert!(!d.too_many());
    d.error(sp, DiagKind::Type, "mismatch");
    assert!(!d.too_many());
    d.error(sp, DiagKind::Symbol, "duplicate");
    assert!(d.too_many());
    assert_eq!(d.errors(), 2);
    assert!(d.captured()[0].starts_with("x.spin:7: error: type error"));
  }

  #[test]
  fn warnings_as_errors() {
    let mut d = Diagnostics::new(0);
    d.capture();
    d.warning(SrcSpan::none(), DiagKind::Resource, "image grew");
    assert_eq!(d.errors(), 0);
    d.warnings_as_errors = true;
    d.warning(SrcSpan::none(), DiagKind::Resource, "image grew");
    assert_eq!(d.errors(), 1);
  }
}
