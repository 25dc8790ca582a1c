//! The global string interner. Identifiers, labels and mnemonics are
//! interned once per process and referred to by [`Symbol`] everywhere else.

use std::fmt;
use std::sync::{LazyLock, Mutex};
use hashbrown::HashMap;

/// An interned string. Cheap to copy and compare; the text is recovered
/// through [`Symbol::as_str`] for diagnostics and output.
#[derive(Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(u32);

#[derive(Default)]
struct Interner {
  names: Vec<&'static str>,
  map: HashMap<&'static str, u32>,
}

impl Interner {
  fn intern(&mut self, s: &str) -> Symbol {
    if let Some(&n) = self.map.get(s) { return Symbol(n) }
    let n = u32::try_from(self.names.len()).expect("interner overflow");
    // strings live for the whole compilation, same as the AST
    let s: &'static str = Box::leak(s.to_owned().into_boxed_str());
    self.names.push(s);
    self.map.insert(s, n);
    Symbol(n)
  }
}

static INTERNER: LazyLock<Mutex<Interner>> =
  LazyLock::new(|| Mutex::new(Interner::default()));

/// Intern a string, returning its [`Symbol`].
pub fn intern(s: &str) -> Symbol {
  INTERNER.lock().expect("interner poisoned").intern(s)
}

impl Symbol {
  /// Get the text of this symbol.
  #[must_use] pub fn as_str(self) -> &'static str {
    INTERNER.lock().expect("interner poisoned").names[self.0 as usize]
  }

  /// Get the index of this symbol in the interner.
  #[must_use] pub fn into_usize(self) -> usize { self.0 as usize }

  /// Intern the case-folded version of this symbol. Case-insensitive
  /// symbol tables fold on insert and probe; the interner itself is
  /// case-preserving so user-visible names survive for diagnostics.
  #[must_use] pub fn fold_case(self) -> Symbol {
    let s = self.as_str();
    if s.chars().all(|c| !c.is_ascii_uppercase()) { return self }
    intern(&s.to_ascii_lowercase())
  }
}

impl fmt::Debug for Symbol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}", self.as_str())
  }
}

impl fmt::Display for Symbol {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn intern_is_stable() {
    let a = intern("clkfreq");
    let b = intern("clkfreq");
    assert_eq!(a, b);
    assert_eq!(a.as_str(), "clkfreq");
    assert_ne!(a, intern("clkmode"));
  }

  #[test]
  fn case_fold() {
    assert_eq!(intern("_CLKMODE").fold_case(), intern("_clkmode"));
    assert_eq!(intern("already_lower").fold_case(), intern("already_lower"));
  }
}
