//! Symbol tables. Scoped tables form a chain (local → class/module →
//! enclosing → global) which is walked by [`lookup`]; each binding is an
//! [`Entity`] describing what the name means and where it was declared.
//!
//! Spin is historically case-insensitive while BASIC and C are sensitive,
//! so the fold is a per-table flag. "Weak" aliases map a name to another
//! name and may be overridden silently; full aliases map a name to an
//! arbitrary expression and are how anonymous-struct field lookup is
//! unified with ordinary member access.

use bitflags::bitflags;
use hashbrown::HashMap;
use crate::symbol::Symbol;
use crate::types::{AstId, FuncId, ModuleId, SrcSpan};

/// What kind of thing a name is bound to.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SymKind {
  Constant,
  FloatConstant,
  Variable,
  LocalVar,
  TempVar,
  Parameter,
  Result,
  Label,
  Function,
  Typedef,
  /// Alias to an arbitrary expression; lookup follows it transparently.
  Alias,
  /// Alias to another name; overridable by a later declaration.
  WeakAlias,
  HwReg,
  Reserved,
  Closure,
  /// A local re-declaration shadowing an outer binding after
  /// alpha-renaming.
  Redef,
}

/// Kind-dependent payload of a binding.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum SymVal {
  #[default]
  None,
  /// Constant/variable/typedef/alias: the defining AST (value or type or
  /// aliased expression).
  Ast(AstId),
  Func(FuncId),
  Module(ModuleId),
  /// Index into the module's DAT label list.
  Label(u32),
  HwReg(u32),
}

bitflags! {
  #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
  pub struct SymFlags: u8 {
    const PRIVATE  = 0x1;
    const INTERNAL = 0x2;
    const GLOBAL   = 0x4;
    const NOALLOC  = 0x8;
  }
}

/// One symbol-table binding.
#[derive(Copy, Clone, Debug)]
pub struct Entity {
  /// Internal (possibly renamed) name.
  pub name: Symbol,
  /// Name as the user wrote it, for diagnostics. Weak aliases keep their
  /// referent here instead.
  pub user_name: Symbol,
  pub kind: SymKind,
  pub val: SymVal,
  /// Variable/parameter offset within its frame or object.
  pub offset: i32,
  pub flags: SymFlags,
  /// Where the binding was declared, for "previous definition here".
  pub def_span: SrcSpan,
}

/// Why an [`SymTab::add`] failed.
#[derive(Copy, Clone, Debug)]
pub struct Duplicate {
  pub prev_span: SrcSpan,
  pub prev_kind: SymKind,
}

/// Result of a lookup, before alias resolution is applied by the caller
/// that owns the expression pool.
#[derive(Copy, Clone, Debug)]
pub enum Lookup {
  Direct(Entity),
  /// The name is an alias for this expression; re-evaluate against it.
  FollowsAlias(AstId),
  Absent,
}

/// One scope's bindings.
pub struct SymTab {
  map: HashMap<Symbol, Entity>,
  pub case_sensitive: bool,
}

impl SymTab {
  #[must_use] pub fn new(case_sensitive: bool) -> Self {
    SymTab { map: HashMap::new(), case_sensitive }
  }

  fn key(&self, name: Symbol) -> Symbol {
    if self.case_sensitive { name } else { name.fold_case() }
  }

  /// Add a binding. Fails with [`Duplicate`] when the name is already
  /// bound, unless the existing binding is a weak alias (which is
  /// silently replaced) or the new binding is itself a weak alias
  /// (which never conflicts).
  pub fn add(&mut self, name: Symbol, kind: SymKind, val: SymVal) -> Result<&mut Entity, Duplicate> {
    self.add_placed(name, kind, val, SrcSpan::none(), name)
  }

  /// Like [`SymTab::add`] but records the declaration site and the
  /// user-visible spelling.
  pub fn add_placed(&mut self, name: Symbol, kind: SymKind, val: SymVal,
                    def_span: SrcSpan, user_name: Symbol) -> Result<&mut Entity, Duplicate> {
    let key = self.key(name);
    if let Some(old) = self.map.get(&key) {
      if kind == SymKind::WeakAlias {
        // weak aliases never replace an existing binding
        return Ok(self.map.get_mut(&key).expect("just probed"));
      }
      if old.kind != SymKind::WeakAlias {
        return Err(Duplicate { prev_span: old.def_span, prev_kind: old.kind });
      }
    }
    let ent = Entity {
      name, user_name, kind, val,
      offset: 0, flags: SymFlags::empty(), def_span,
    };
    Ok(self.map.entry(key).insert(ent).into_mut())
  }

  /// Insert an alias from `new` to the expression `expr` (typically an
  /// identifier, possibly wrapped in a cast).
  pub fn declare_alias(&mut self, new: Symbol, expr: AstId) {
    let key = self.key(new);
    let ent = Entity {
      name: new, user_name: new, kind: SymKind::Alias,
      val: SymVal::Ast(expr), offset: 0, flags: SymFlags::empty(),
      def_span: SrcSpan::none(),
    };
    self.map.insert(key, ent);
  }

  /// Insert a weak (overridable) alias from `new` to the name `old`.
  pub fn declare_weak_alias(&mut self, new: Symbol, old: Symbol) {
    let key = self.key(new);
    if self.map.contains_key(&key) { return }
    let mut ent = Entity {
      name: new, user_name: new, kind: SymKind::WeakAlias,
      val: SymVal::None, offset: 0, flags: SymFlags::empty(),
      def_span: SrcSpan::none(),
    };
    ent.user_name = old;
    self.map.insert(key, ent);
  }

  /// Look up in this scope only, without walking the chain but following
  /// weak aliases within the table.
  #[must_use] pub fn lookup_in_scope(&self, name: Symbol) -> Lookup {
    let mut key = self.key(name);
    for _ in 0..8 {
      match self.map.get(&key) {
        None => return Lookup::Absent,
        Some(e) if e.kind == SymKind::WeakAlias => { key = self.key(e.user_name); }
        Some(e) if e.kind == SymKind::Alias => {
          if let SymVal::Ast(expr) = e.val { return Lookup::FollowsAlias(expr) }
          return Lookup::Absent;
        }
        Some(e) => return Lookup::Direct(*e),
      }
    }
    Lookup::Absent // alias cycle
  }

  /// Fetch a binding for mutation (no alias following).
  pub fn get_mut(&mut self, name: Symbol) -> Option<&mut Entity> {
    let key = self.key(name);
    self.map.get_mut(&key)
  }

  #[must_use] pub fn contains(&self, name: Symbol) -> bool {
    let key = self.key(name);
    self.map.contains_key(&key)
  }

  /// Iterate all bindings (unspecified order).
  pub fn for_each(&self, mut f: impl FnMut(&Entity)) {
    for e in self.map.values() { f(e) }
  }

  #[must_use] pub fn len(&self) -> usize { self.map.len() }
  #[must_use] pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

/// Walk a scope chain (innermost first), following weak aliases per
/// table. The first table that knows the name wins.
#[must_use] pub fn lookup<'a>(chain: impl IntoIterator<Item = &'a SymTab>, name: Symbol) -> Lookup {
  for tab in chain {
    match tab.lookup_in_scope(name) {
      Lookup::Absent => continue,
      hit => return hit,
    }
  }
  Lookup::Absent
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::symbol::intern;
  use crate::types::AstId;

  #[test]
  fn case_insensitive_lookup() {
    let mut t = SymTab::new(false);
    t.add(intern("_ClkMode"), SymKind::Constant, SymVal::Ast(AstId(0))).unwrap();
    assert!(matches!(t.lookup_in_scope(intern("_CLKMODE")), Lookup::Direct(_)));
    let mut s = SymTab::new(true);
    s.add(intern("name"), SymKind::Variable, SymVal::None).unwrap();
    assert!(matches!(s.lookup_in_scope(intern("NAME")), Lookup::Absent));
  }

  #[test]
  fn duplicates_and_weak_aliases() {
    let mut t = SymTab::new(true);
    t.add(intern("x"), SymKind::Constant, SymVal::None).unwrap();
    assert!(t.add(intern("x"), SymKind::Variable, SymVal::None).is_err());
    // weak alias does not clash, and a real declaration overrides it
    t.declare_weak_alias(intern("y"), intern("x"));
    t.add(intern("y"), SymKind::Variable, SymVal::None).unwrap();
    assert!(matches!(t.lookup_in_scope(intern("y")),
                     Lookup::Direct(Entity { kind: SymKind::Variable, .. })));
  }

  #[test]
  fn weak_alias_follows() {
    let mut t = SymTab::new(false);
    t.add(intern("result"), SymKind::Result, SymVal::None).unwrap();
    t.declare_weak_alias(intern("res"), intern("result"));
    assert!(matches!(t.lookup_in_scope(intern("RES")),
                     Lookup::Direct(Entity { kind: SymKind::Result, .. })));
  }

  #[test]
  fn alias_to_expression() {
    let mut t = SymTab::new(true);
    t.declare_alias(intern("field"), AstId(42));
    match t.lookup_in_scope(intern("field")) {
      Lookup::FollowsAlias(e) => assert_eq!(e, AstId(42)),
      other => panic!("expected alias, got {other:?}"),
    }
  }

  #[test]
  fn chain_walk() {
    let mut inner = SymTab::new(true);
    let mut outer = SymTab::new(true);
    outer.add(intern("g"), SymKind::Constant, SymVal::None).unwrap();
    inner.add(intern("l"), SymKind::LocalVar, SymVal::None).unwrap();
    let hit = lookup([&inner, &outer], intern("g"));
    assert!(matches!(hit, Lookup::Direct(Entity { kind: SymKind::Constant, .. })));
    assert!(matches!(lookup([&inner, &outer], intern("nope")), Lookup::Absent));
  }
}
