//! The type model. Types are themselves AST nodes (`IntType`,
//! `PtrType`, `ArrayType`, `Object`, ...) so that surface parsers can
//! build them with the same machinery as expressions; size, alignment,
//! compatibility and dereference rules are functions over those trees.
//!
//! Booleans are integer type nodes tagged in the (otherwise unused)
//! payload slot, so `bool` and `long` share all integer machinery while
//! remaining distinguishable for diagnostics and comparison lowering.

use crate::{Compiler, LONG_SIZE};
use crate::diag::DiagKind;
use crate::symbol::intern;
use crate::types::{AstId, ModuleId};
use crate::types::ast::{AstKind, Payload};
use crate::types::entity::{Lookup, SymKind, SymVal};

/// Any type wider than this is passed by hidden reference rather than by
/// value.
pub const STACK_SIZE_THRESHOLD: i32 = 12;

impl Compiler {
  // ---- constructors ------------------------------------------------------

  fn sized_type(&mut self, kind: AstKind, size: i32, boolean: bool) -> AstId {
    let sz = self.ast.integer(size.into());
    let d = if boolean { Payload::Int(1) } else { Payload::None };
    self.ast.new_with(kind, d, Some(sz), None)
  }

  pub fn byte_type(&mut self, unsigned: bool) -> AstId {
    let k = if unsigned { AstKind::UnsignedType } else { AstKind::IntType };
    self.sized_type(k, 1, false)
  }

  pub fn word_type(&mut self, unsigned: bool) -> AstId {
    let k = if unsigned { AstKind::UnsignedType } else { AstKind::IntType };
    self.sized_type(k, 2, false)
  }

  pub fn long_type(&mut self, unsigned: bool) -> AstId {
    let k = if unsigned { AstKind::UnsignedType } else { AstKind::IntType };
    self.sized_type(k, 4, false)
  }

  pub fn long64_type(&mut self, unsigned: bool) -> AstId {
    let k = if unsigned { AstKind::UnsignedType } else { AstKind::IntType };
    self.sized_type(k, 8, false)
  }

  pub fn float_type(&mut self) -> AstId { self.sized_type(AstKind::FloatType, 4, false) }
  pub fn double_type(&mut self) -> AstId { self.sized_type(AstKind::FloatType, 8, false) }

  /// Boolean: signed (Spin/BASIC, true == -1) or unsigned (C, true == 1).
  pub fn bool_type(&mut self, signed: bool, size: i32) -> AstId {
    let k = if signed { AstKind::IntType } else { AstKind::UnsignedType };
    self.sized_type(k, size, true)
  }

  pub fn generic_type(&mut self) -> AstId { self.ast.new_node(AstKind::GenericType, None, None) }
  pub fn void_type(&mut self) -> AstId { self.ast.new_node(AstKind::VoidType, None, None) }

  pub fn ptr_type(&mut self, base: AstId) -> AstId {
    self.ast.new_node(AstKind::PtrType, Some(base), None)
  }

  pub fn ref_type(&mut self, base: AstId) -> AstId {
    self.ast.new_node(AstKind::RefType, Some(base), None)
  }

  pub fn copyref_type(&mut self, base: AstId) -> AstId {
    self.ast.new_node(AstKind::CopyRefType, Some(base), None)
  }

  pub fn array_type(&mut self, base: AstId, len: i64) -> AstId {
    let n = self.ast.integer(len);
    self.ast.new_node(AstKind::ArrayType, Some(base), Some(n))
  }

  pub fn func_type(&mut self, ret: Option<AstId>, params: Option<AstId>) -> AstId {
    self.ast.new_node(AstKind::FuncType, ret, params)
  }

  pub fn object_type(&mut self, module: ModuleId) -> AstId {
    self.ast.new_with(AstKind::Object, Payload::Module(module), None, None)
  }

  // ---- predicates --------------------------------------------------------

  /// Strip `const`/`volatile` wrappers.
  #[must_use] pub fn remove_type_modifiers(&self, mut ty: AstId) -> AstId {
    loop {
      match self.ast.kind(ty) {
        AstKind::ModifierConst | AstKind::ModifierVolatile
        | AstKind::ModifierSendArgs => {
          match self.ast.left(ty) {
            Some(inner) => ty = inner,
            None => return ty,
          }
        }
        _ => return ty,
      }
    }
  }

  /// Element type of an array, pointed-to type of a pointer/reference.
  #[must_use] pub fn base_type(&self, ty: AstId) -> Option<AstId> {
    let ty = self.remove_type_modifiers(ty);
    match self.ast.kind(ty) {
      AstKind::ArrayType | AstKind::PtrType | AstKind::RefType
      | AstKind::CopyRefType => self.ast.left(ty),
      _ => None,
    }
  }

  #[must_use] pub fn is_int_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    matches!(self.ast.kind(ty), AstKind::IntType | AstKind::UnsignedType)
  }

  #[must_use] pub fn is_unsigned_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    self.ast.kind(ty) == AstKind::UnsignedType
  }

  #[must_use] pub fn is_bool_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    matches!(self.ast.kind(ty), AstKind::IntType | AstKind::UnsignedType)
      && self.ast.get(ty).d == Payload::Int(1)
  }

  #[must_use] pub fn is_float_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    self.ast.kind(ty) == AstKind::FloatType
  }

  #[must_use] pub fn is_float64_type(&self, ty: AstId) -> bool {
    self.is_float_type(ty) && self.type_size_imm(ty) == 8
  }

  #[must_use] pub fn is_generic_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    self.ast.kind(ty) == AstKind::GenericType
  }

  #[must_use] pub fn is_pointer_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    matches!(self.ast.kind(ty),
             AstKind::PtrType | AstKind::RefType | AstKind::CopyRefType)
  }

  #[must_use] pub fn is_ref_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    matches!(self.ast.kind(ty), AstKind::RefType | AstKind::CopyRefType)
  }

  #[must_use] pub fn is_array_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    self.ast.kind(ty) == AstKind::ArrayType
  }

  #[must_use] pub fn is_class_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    self.ast.kind(ty) == AstKind::Object
  }

  #[must_use] pub fn is_func_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    self.ast.kind(ty) == AstKind::FuncType
  }

  #[must_use] pub fn is_void_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    self.ast.kind(ty) == AstKind::VoidType
  }

  #[must_use] pub fn is_64bit_type(&self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    matches!(self.ast.kind(ty),
             AstKind::IntType | AstKind::UnsignedType | AstKind::FloatType)
      && self.type_size_imm(ty) == 8
  }

  /// The module a class/object type refers to.
  #[must_use] pub fn class_ptr(&self, ty: AstId) -> Option<ModuleId> {
    let ty = self.remove_type_modifiers(ty);
    match self.ast.get(ty).d {
      Payload::Module(m) if self.ast.kind(ty) == AstKind::Object => Some(m),
      _ => None,
    }
  }

  // ---- size and alignment -----------------------------------------------

  /// Size without triggering object finalisation; used internally where
  /// only scalar types can occur.
  fn type_size_imm(&self, ty: AstId) -> i32 {
    let ty = self.remove_type_modifiers(ty);
    match self.ast.kind(ty) {
      AstKind::IntType | AstKind::UnsignedType | AstKind::FloatType => {
        self.ast.left(ty)
          .and_then(|l| self.try_const_val(l))
          .map_or(LONG_SIZE, |v| v as i32)
      }
      _ => LONG_SIZE,
    }
  }

  /// Size in bytes of a type. `Object` sizes come from the module's
  /// finalised var layout and trigger finalisation if still pending.
  pub fn type_size(&mut self, ty: AstId) -> i32 {
    let ty = self.remove_type_modifiers(ty);
    match self.ast.kind(ty) {
      AstKind::IntType | AstKind::UnsignedType | AstKind::FloatType =>
        self.type_size_imm(ty),
      AstKind::GenericType => LONG_SIZE,
      AstKind::VoidType => 0,
      AstKind::PtrType | AstKind::RefType | AstKind::CopyRefType
      | AstKind::FuncType => LONG_SIZE,
      AstKind::ArrayType => {
        let base = self.ast.left(ty).map_or(0, |b| self.type_size(b));
        let len = self.ast.right(ty)
          .and_then(|n| self.try_const_val(n)).unwrap_or(0) as i32;
        base * len
      }
      AstKind::Object => {
        match self.class_ptr(ty) {
          Some(m) => {
            if self.module(m).layout_pending { self.finalize_layout(m) }
            self.module(m).varsize
          }
          None => 0,
        }
      }
      AstKind::TupleType => {
        let items: Vec<AstId> = self.ast.list_iter(self.ast.left(ty)).collect();
        items.into_iter().map(|t| self.type_size(t)).sum()
      }
      AstKind::Bitfield => {
        self.ast.left(ty).map_or(LONG_SIZE, |b| self.type_size(b))
      }
      _ => LONG_SIZE,
    }
  }

  /// Alignment of a type; always divides the size.
  pub fn type_align(&mut self, ty: AstId) -> i32 {
    let ty = self.remove_type_modifiers(ty);
    match self.ast.kind(ty) {
      AstKind::IntType | AstKind::UnsignedType | AstKind::FloatType => {
        match self.type_size_imm(ty) {
          1 => 1,
          2 => 2,
          _ => LONG_SIZE,
        }
      }
      AstKind::ArrayType | AstKind::Bitfield => {
        self.ast.left(ty).map_or(LONG_SIZE, |b| self.type_align(b))
      }
      AstKind::VoidType => 1,
      _ => LONG_SIZE,
    }
  }

  /// True for any type that is passed on the stack by hidden reference
  /// rather than in registers: anything bigger than the threshold, and
  /// arrays/objects that are not pure longs.
  pub fn goes_on_stack(&mut self, ty: AstId) -> bool {
    let ty = self.remove_type_modifiers(ty);
    let size = self.type_size(ty);
    if size > STACK_SIZE_THRESHOLD { return true }
    match self.ast.kind(ty) {
      AstKind::ArrayType | AstKind::Object => {
        // all-long aggregates up to the threshold may live in registers
        size % LONG_SIZE != 0 || self.type_align(ty) != LONG_SIZE
          || size > STACK_SIZE_THRESHOLD
      }
      _ => false,
    }
  }

  // ---- compatibility ----------------------------------------------------

  /// Structural compatibility. Generic accepts any 32-bit value; two
  /// class types are compatible only if one is nested within (a subclass
  /// of) the other, except that an interface type is compatible with any
  /// class implementing it.
  pub fn compatible_types(&mut self, a: Option<AstId>, b: Option<AstId>) -> bool {
    let (Some(a), Some(b)) = (a, b) else { return true };
    let a = self.remove_type_modifiers(a);
    let b = self.remove_type_modifiers(b);
    if a == b { return true }
    let (ka, kb) = (self.ast.kind(a), self.ast.kind(b));
    if ka == AstKind::VoidType || kb == AstKind::VoidType {
      return ka == kb;
    }
    if ka == AstKind::GenericType || kb == AstKind::GenericType {
      return true;
    }
    match (ka, kb) {
      (AstKind::IntType | AstKind::UnsignedType, AstKind::IntType | AstKind::UnsignedType) => {
        self.type_size_imm(a) == self.type_size_imm(b)
      }
      (AstKind::FloatType, AstKind::FloatType) => {
        self.type_size_imm(a) == self.type_size_imm(b)
      }
      (AstKind::PtrType | AstKind::RefType | AstKind::CopyRefType,
       AstKind::PtrType | AstKind::RefType | AstKind::CopyRefType) => {
        let ba = self.ast.left(a);
        let bb = self.ast.left(b);
        // void* is compatible with any pointer
        if ba.is_some_and(|t| self.is_void_type(t)) { return true }
        if bb.is_some_and(|t| self.is_void_type(t)) { return true }
        self.compatible_types(ba, bb)
      }
      (AstKind::ArrayType, AstKind::ArrayType) => {
        self.compatible_types(self.ast.left(a), self.ast.left(b))
          && self.type_size(a) == self.type_size(b)
      }
      (AstKind::FuncType, AstKind::FuncType) => {
        if !self.compatible_types(self.ast.left(a), self.ast.left(b)) {
          return false;
        }
        self.ast.list_len(self.ast.right(a)) == self.ast.list_len(self.ast.right(b))
      }
      (AstKind::Object, AstKind::Object) => {
        let (Some(ma), Some(mb)) = (self.class_ptr(a), self.class_ptr(b)) else {
          return false;
        };
        if self.is_subclass_of(ma, mb) || self.is_subclass_of(mb, ma) {
          return true;
        }
        if self.module(ma).is_interface {
          return self.class_implements_interface(mb, ma);
        }
        if self.module(mb).is_interface {
          return self.class_implements_interface(ma, mb);
        }
        false
      }
      _ => false,
    }
  }

  #[must_use] pub fn is_subclass_of(&self, sub: ModuleId, sup: ModuleId) -> bool {
    let mut cur = Some(sub);
    while let Some(m) = cur {
      if m == sup { return true }
      cur = self.module(m).parent;
    }
    false
  }

  /// Does `class` provide (or inherit a default for) every public method
  /// of `iface`?
  pub fn class_implements_interface(&mut self, class: ModuleId, iface: ModuleId) -> bool {
    let funcs: Vec<_> = self.module(iface).functions.clone();
    for f in funcs {
      if !self.func(f).is_public { continue }
      let name = self.func(f).name;
      match self.module(class).objsyms.lookup_in_scope(name) {
        Lookup::Direct(e) if e.kind == SymKind::Function => {
          let SymVal::Func(cf) = e.val else { return false };
          let it = self.func(f).overall_type;
          let ct = self.func(cf).overall_type;
          if !self.compatible_types(it, ct) { return false }
        }
        _ => {
          // no implementation in the class: the interface must carry a
          // default body
          if self.func(f).body == crate::FuncBody::None { return false }
        }
      }
    }
    true
  }

  // ---- interface conversion ---------------------------------------------

  /// Materialise (once per `(class, interface)`) a constant array of
  /// method pointers in the class's DAT section, one entry per interface
  /// method: the class's own implementation, or the interface's default
  /// with the default-method flag set. Returns the skeleton's name symbol
  /// and the method count.
  pub fn interface_skeleton(&mut self, class: ModuleId, iface: ModuleId,
                            line: AstId) -> Option<(crate::symbol::Symbol, i32)> {
    let iface_name = self.module(iface).classname;
    let skel_name = intern(&format!("_skel_{iface_name}"));
    let n = self.module(iface).functions.iter()
      .filter(|&&f| self.func(f).is_public).count() as i32;
    if self.module(class).objsyms.contains(skel_name) {
      return Some((skel_name, n));
    }

    let span = self.ast.span(line);
    let funcs: Vec<_> = self.module(iface).functions.clone();
    let mut initlist: Option<AstId> = None;
    for pf in funcs {
      if !self.func(pf).is_public { continue }
      let fname = self.func(pf).name;
      let mut use_default = false;
      let target = match self.module(class).objsyms.lookup_in_scope(fname) {
        Lookup::Direct(e) if e.kind == SymKind::Function => {
          let SymVal::Func(cf) = e.val else { return None };
          let it = self.func(pf).overall_type;
          let ct = self.func(cf).overall_type;
          if !self.compatible_types(it, ct) {
            self.diag.error(span, DiagKind::Type,
              format!("incompatible types for function {fname}: interface {iface_name} \
                       does not match class {}", self.module(class).classname));
          }
          cf
        }
        Lookup::Direct(_) => {
          self.diag.error(span, DiagKind::Type,
            format!("symbol {fname} in class {} is not a function but is needed \
                     by interface {iface_name}", self.module(class).classname));
          return None;
        }
        _ => {
          if self.func(pf).body == crate::FuncBody::None {
            self.diag.error(span, DiagKind::Type,
              format!("class {} does not implement interface function {fname}",
                      self.module(class).classname));
            return None;
          }
          use_default = true;
          pf
        }
      };
      self.func_mut(target).method_ptr_uses += 1;
      let fnode = self.ast.new_with(AstKind::SymbolRef, Payload::Func(target), None, None);
      let flag = if use_default { Some(self.ast.integer(1)) } else { None };
      let elem = self.ast.new_node(AstKind::SimpleFuncPtr, Some(fnode), flag);
      let cell = self.ast.expr_item(elem);
      initlist = Some(self.ast.list_append(initlist, cell));
    }

    let skel_ident = self.ast.identifier_sym(skel_name);
    let init = initlist.unwrap_or_else(|| {
      let zero = self.ast.integer(0);
      self.ast.expr_item(zero)
    });
    let assign = self.ast.assign(skel_ident, init);
    let generic = self.generic_type();
    let fptr = self.ptr_type(generic);
    let arr = self.array_type(fptr, n.into());
    self.declare_one_global_var(class, assign, arr, true);
    Some((skel_name, n))
  }

  /// Convert a class pointer expression to an interface fat pointer: a
  /// runtime `make_interfaceptrs(instance, @skeleton, n)` call.
  pub fn convert_interface(&mut self, iface_type: AstId, class_type: AstId,
                           expr: AstId) -> Option<AstId> {
    let class = self.class_ptr(class_type)?;
    let iface = self.class_ptr(iface_type)?;
    if !self.module(iface).is_interface {
      let span = self.ast.span(expr);
      self.diag.error(span, DiagKind::Internal, "expected interface type");
      return None;
    }
    let (skel_name, n) = self.interface_skeleton(class, iface, expr)?;
    let save = self.ast.report_as(expr);
    let instance = if self.is_pointer_type(class_type) {
      expr
    } else {
      self.ast.new_node(AstKind::AbsAddrOf, Some(expr), None)
    };
    let skel_ident = self.ast.identifier_sym(skel_name);
    let skel_addr = self.ast.new_node(AstKind::AbsAddrOf, Some(skel_ident), None);
    let func = self.ast.identifier("make_interfaceptrs");
    let count = self.ast.integer(n.into());
    let a1 = self.ast.expr_item(instance);
    let a2 = self.ast.expr_item(skel_addr);
    let a3 = self.ast.expr_item(count);
    let args = self.ast.list_append(Some(a1), a2);
    let args = self.ast.list_append(Some(args), a3);
    let call = self.ast.new_node(AstKind::FuncCall, Some(func), Some(args));
    self.ast.report_done(save);
    Some(call)
  }
}

#[cfg(test)]
mod test {
  use crate::{Compiler, Options, Language, FuncBody};
  use crate::types::ast::AstKind;

  #[test]
  fn sizes_and_alignment() {
    let mut c = Compiler::new(Options::default());
    let b = c.byte_type(true);
    let w = c.word_type(false);
    let l = c.long_type(false);
    let q = c.long64_type(false);
    let f = c.float_type();
    assert_eq!(c.type_size(b), 1);
    assert_eq!(c.type_size(w), 2);
    assert_eq!(c.type_size(l), 4);
    assert_eq!(c.type_size(q), 8);
    assert_eq!(c.type_size(f), 4);
    let p = c.ptr_type(q);
    assert_eq!(c.type_size(p), 4);
    let arr = c.array_type(w, 5);
    assert_eq!(c.type_size(arr), 10);
    assert_eq!(c.type_align(arr), 2);
    // alignment divides size for all scalars
    for t in [b, w, l, q, f] {
      assert_eq!(c.type_size(t) % c.type_align(t), 0);
    }
  }

  #[test]
  fn modifiers_strip() {
    let mut c = Compiler::new(Options::default());
    let l = c.long_type(false);
    let cl = c.ast.new_node(AstKind::ModifierConst, Some(l), None);
    let vcl = c.ast.new_node(AstKind::ModifierVolatile, Some(cl), None);
    assert_eq!(c.remove_type_modifiers(vcl), l);
    assert!(c.is_int_type(vcl));
  }

  #[test]
  fn compat_rules() {
    let mut c = Compiler::new(Options::default());
    let l = c.long_type(false);
    let ul = c.long_type(true);
    let w = c.word_type(false);
    let g = c.generic_type();
    assert!(c.compatible_types(Some(l), Some(ul)));
    assert!(!c.compatible_types(Some(l), Some(w)));
    assert!(c.compatible_types(Some(g), Some(w)));
    let v = c.void_type();
    let pv = c.ptr_type(v);
    let pl = c.ptr_type(l);
    assert!(c.compatible_types(Some(pv), Some(pl)));
    let f = c.float_type();
    assert!(!c.compatible_types(Some(f), Some(l)));
  }

  #[test]
  fn goes_on_stack_threshold() {
    let mut c = Compiler::new(Options::default());
    let l = c.long_type(false);
    let small = c.array_type(l, 3); // 12 bytes: fits
    let big = c.array_type(l, 4);   // 16 bytes: stack
    assert!(!c.goes_on_stack(small));
    assert!(c.goes_on_stack(big));
    let b = c.byte_type(true);
    let bytes = c.array_type(b, 4); // not long-only
    assert!(c.goes_on_stack(bytes));
  }

  #[test]
  fn interface_skeleton_dedupes() {
    let mut c = Compiler::new(Options::default());
    let animal = c.new_module("animal.spin2", Language::Spin2);
    c.module_mut(animal).is_interface = true;
    let dog = c.new_module("dog.spin2", Language::Spin2);

    // interface: pub speak()  (no default body)
    let mk_fn = |c: &mut Compiler, m, name: &str, has_body: bool| {
      let ident = c.ast.identifier(name);
      let decl = c.ast.new_node(AstKind::FuncDecl, Some(ident), None);
      let fdef = c.ast.new_node(AstKind::FuncDef, Some(decl), None);
      let body = if has_body {
        Some(c.ast.new_node(AstKind::StmtList, None, None))
      } else { None };
      c.declare_function(m, None, true, fdef, body, None, None)
    };
    mk_fn(&mut c, animal, "speak", false);
    let dog_speak = mk_fn(&mut c, dog, "speak", true);

    let line = c.ast.integer(0);
    let (name1, n1) = c.interface_skeleton(dog, animal, line).unwrap();
    let (name2, n2) = c.interface_skeleton(dog, animal, line).unwrap();
    assert_eq!(name1, name2);
    assert_eq!((n1, n2), (1, 1));
    assert_eq!(c.func(dog_speak).method_ptr_uses, 1, "deduped: counted once");
    assert_eq!(c.diag.errors(), 0);
    assert_eq!(c.func(dog_speak).body != FuncBody::None, true);
  }
}
