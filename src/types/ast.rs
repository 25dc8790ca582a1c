//! The shared AST. A single tagged node type covers every construct in
//! every supported surface language; lists are right-linear chains of
//! `ListHolder` nodes so traversal is iterative.
//!
//! Nodes live in an [`AstPool`] owned by the compiler session and are
//! addressed by [`AstId`]. The tree is a *tree*, not a DAG: sharing
//! happens only through interned strings and small integers, and
//! duplication is always explicit ([`AstPool::dup`]).

use hashbrown::HashMap;
use crate::symbol::{Symbol, intern};
use crate::types::{AstId, ModuleId, FuncId, SrcSpan};

/// Binary/unary operator tokens carried by `AstKind::Operator` nodes.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub enum Op {
  Add, Sub, Mul, Div, Mods,
  UnsDiv, UnsMod,
  Shl, Shr, Sar, Rotl, Rotr,
  BitAnd, BitOr, BitXor, BitNot,
  Eq, Ne, Lt, Gt, Le, Ge,
  Ltu, Gtu, Leu, Geu,
  BoolAnd, BoolOr, BoolNot, BoolXor,
  LogicAnd, LogicOr, LogicXor,
  Negate, Abs, Sqrt, Rev,
  Decode, Encode, Encode2,
  SignExtend, ZeroExtend,
  LimitMin, LimitMax, LimitMinUns, LimitMaxUns,
  Increment, Decrement,
  Isqrt, Double,
}

impl Op {
  /// Commutative operators may swap their operands freely.
  #[must_use] pub fn commutes(self) -> bool {
    matches!(self, Op::Add | Op::Mul | Op::BitAnd | Op::BitOr | Op::BitXor
             | Op::Eq | Op::Ne)
  }

  /// True for the boolean connectives (`x != 0` flattening applies inside
  /// these).
  #[must_use] pub fn is_bool(self) -> bool {
    matches!(self, Op::BoolAnd | Op::BoolOr | Op::BoolNot | Op::BoolXor
             | Op::LogicAnd | Op::LogicOr | Op::LogicXor)
  }
}

/// The payload of an AST node.
#[derive(Copy, Clone, PartialEq, Debug, Default)]
pub enum Payload {
  #[default]
  None,
  /// Integer literal, alignment size, ORG address, and similar.
  Int(i64),
  /// Float literal (IEEE bits in the low 32, or 16.16 in fixed-real mode).
  FloatBits(u32),
  /// Identifier, string literal, annotation text.
  Str(Symbol),
  /// Operator token for `Operator`/`OpAssign` nodes.
  Oper(Op),
  /// Sub-object reference for `Object` nodes.
  Module(ModuleId),
  /// Function reference (method pointers, funcdecl back-links).
  Func(FuncId),
  /// Index into the PASM instruction table for `Instr` nodes.
  Instr(u32),
  /// Index into the PASM modifier table for `InstrModifier` nodes.
  Modifier(u32),
  /// Hardware register address for `HwReg` nodes.
  HwReg(u32),
}

macro_rules! ast_kinds {
  ($($(#[$doc:meta])* $name:ident,)*) => {
    /// Every AST node kind, across all front-ends.
    #[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
    pub enum AstKind { $($(#[$doc])* $name,)* }
  }
}

ast_kinds! {
  Unknown,
  /// One cell of a right-linear statement/declaration list.
  ListHolder,
  Integer,
  String,
  Identifier,
  Operator,
  Float,
  Assign,
  EnumSet,
  ArrayDecl,
  ByteList,
  WordList,
  LongList,
  IntType,
  UnsignedType,
  ArrayType,
  FuncDecl,
  FuncDef,
  FuncVars,
  StmtList,
  Instr,
  HwReg,
  Return,
  If,
  ThenElse,
  Range,
  RangeRef,
  FuncCall,
  /// One cell of a right-linear expression list (arguments, tuples,
  /// initializer lists).
  ExprList,
  InstrHolder,
  InstrModifier,
  Org,
  Here,
  PostSet,
  While,
  DoWhile,
  For,
  MemRef,
  ArrayRef,
  CountRepeat,
  Case,
  CaseItem,
  Other,
  Res,
  From,
  To,
  Step,
  Fit,
  AddrOf,
  Lookup,
  Lookdown,
  Object,
  MethodRef,
  ConstRef,
  ObjDecl,
  StringPtr,
  Yield,
  Constant,
  QuitLoop,
  Continue,
  Result,
  Round,
  Trunc,
  ToFloat,
  File,
  Throw,
  Catch,
  LookExpr,
  /// `@@@x`: absolute hub address, resolved by the loader via relocation.
  DatAddrOf,
  Annotation,
  TempArrayDecl,
  TempArrayUse,
  PubFunc,
  PriFunc,
  FuncHolder,
  EnumSkip,
  LineBreak,
  Comment,
  CommentedNode,
  CogInit,
  SprRef,
  AbsAddrOf,
  FloatType,
  PtrType,
  GenericType,
  VoidType,
  Sequence,
  CondResult,
  ForAtLeastOnce,
  IsBetween,
  InlineAsm,
  Operand,
  OrgH,
  MaskMove,
  ModifierConst,
  ModifierVolatile,
  /// `#x` short immediate in PASM source.
  ImmHolder,
  /// `##x` AUG-prefixed large immediate in PASM source.
  BigImmHolder,
  Align,
  OrgF,
  TupleType,
  SrcComment,
  DeclareVar,
  DeclareVarWeak,
  Label,
  Goto,
  Print,
  Char,
  RegPair,
  FuncType,
  SelfRef,
  BitValue,
  New,
  Delete,
  Using,
  GlobalVars,
  Lambda,
  SetJmp,
  TryEnv,
  CatchResult,
  SizeOf,
  Cast,
  VarArgs,
  Alloca,
  Scope,
  Extern,
  Static,
  Typedef,
  SymbolRef,
  VaStart,
  VaArg,
  DeclareAlias,
  Struct,
  Union,
  /// A bare function pointer (one word, no object context).
  SimpleFuncPtr,
  Read,
  Gosub,
  Super,
  LocalIdentifier,
  /// Marks an instruction for the 16-bit rotated encoding.
  CompressInstr,
  Bitfield,
  CaseTable,
  JumpTable,
  FuncTemplate,
  ClassTemplate,
  EndCase,
  RefType,
  /// Value copied to a hidden temp, then a reference passed; used for
  /// large struct parameters.
  CopyRefType,
  Empty,
  ModifierSendArgs,
  FvarList,
  FvarsList,
  InitModifier,
  DeclareBitfield,
  GetLow,
  GetHigh,
  FuncName,
  CaseExpr,
  Bytecode,
  SameTypes,
  HasMethod,
  BrkDebug,
  ByteFitList,
  WordFitList,
  Register,
  RegisterVars,
  TypeOf,
}

/// One AST node. `left`/`right` are the conventional child slots; for
/// `ListHolder`/`ExprList` chains `left` is the element and `right` the
/// rest of the list.
#[derive(Copy, Clone, Debug)]
pub struct Ast {
  pub kind: AstKind,
  pub d: Payload,
  pub left: Option<AstId>,
  pub right: Option<AstId>,
  pub span: SrcSpan,
}

/// Saved state for a scoped "report-as" context; see [`AstPool::report_as`].
#[derive(Copy, Clone, Debug)]
pub struct ReportInfo {
  prev: SrcSpan,
}

/// The node pool for one compilation. Nodes are never freed during a run;
/// compilation is a one-shot batch with whole-program lifetime.
pub struct AstPool {
  nodes: Vec<Ast>,
  /// Span given to newly constructed nodes; rewrite passes temporarily
  /// redirect this at the node being replaced.
  cur_span: SrcSpan,
  temp_counter: u32,
}

impl AstPool {
  #[must_use] pub fn new() -> Self {
    AstPool { nodes: Vec::with_capacity(1024), cur_span: SrcSpan::none(), temp_counter: 0 }
  }

  #[must_use] pub fn get(&self, id: AstId) -> &Ast { &self.nodes[id.idx()] }
  pub fn get_mut(&mut self, id: AstId) -> &mut Ast { &mut self.nodes[id.idx()] }

  #[must_use] pub fn kind(&self, id: AstId) -> AstKind { self.get(id).kind }
  #[must_use] pub fn left(&self, id: AstId) -> Option<AstId> { self.get(id).left }
  #[must_use] pub fn right(&self, id: AstId) -> Option<AstId> { self.get(id).right }
  #[must_use] pub fn span(&self, id: AstId) -> SrcSpan { self.get(id).span }

  /// Set the span used for subsequently constructed nodes (the lexer sets
  /// this as it parses).
  pub fn set_source(&mut self, span: SrcSpan) { self.cur_span = span }

  /// Mark new nodes to report errors at `old`'s location. Used while
  /// transforming ASTs so synthesized nodes point at the source that
  /// caused them. Restore with [`AstPool::report_done`].
  pub fn report_as(&mut self, old: AstId) -> ReportInfo {
    let save = ReportInfo { prev: self.cur_span };
    self.cur_span = self.get(old).span;
    save
  }

  pub fn report_done(&mut self, save: ReportInfo) { self.cur_span = save.prev }

  fn alloc(&mut self, node: Ast) -> AstId {
    let id = AstId::from_usize(self.nodes.len());
    self.nodes.push(node);
    id
  }

  pub fn new_node(&mut self, kind: AstKind, left: Option<AstId>, right: Option<AstId>) -> AstId {
    let span = self.cur_span;
    self.alloc(Ast { kind, d: Payload::None, left, right, span })
  }

  pub fn new_with(&mut self, kind: AstKind, d: Payload,
                  left: Option<AstId>, right: Option<AstId>) -> AstId {
    let span = self.cur_span;
    self.alloc(Ast { kind, d, left, right, span })
  }

  pub fn integer(&mut self, val: i64) -> AstId {
    self.new_with(AstKind::Integer, Payload::Int(val), None, None)
  }

  pub fn float(&mut self, f: f32) -> AstId {
    self.new_with(AstKind::Float, Payload::FloatBits(f.to_bits()), None, None)
  }

  pub fn bitvalue(&mut self, val: i64) -> AstId {
    self.new_with(AstKind::BitValue, Payload::Int(val), None, None)
  }

  pub fn identifier(&mut self, name: &str) -> AstId {
    let sym = intern(name);
    self.new_with(AstKind::Identifier, Payload::Str(sym), None, None)
  }

  pub fn identifier_sym(&mut self, sym: Symbol) -> AstId {
    self.new_with(AstKind::Identifier, Payload::Str(sym), None, None)
  }

  /// A compiler-generated identifier guaranteed not to collide with user
  /// names.
  pub fn temp_identifier(&mut self, prefix: &str) -> AstId {
    self.temp_counter += 1;
    let name = format!("{}{:04}_", prefix, self.temp_counter);
    self.identifier(&name)
  }

  pub fn string(&mut self, s: &str) -> AstId {
    let sym = intern(s);
    self.new_with(AstKind::String, Payload::Str(sym), None, None)
  }

  pub fn string_ptr(&mut self, s: &str) -> AstId {
    let str_node = self.string(s);
    let list = self.new_node(AstKind::ExprList, Some(str_node), None);
    self.new_node(AstKind::StringPtr, Some(list), None)
  }

  pub fn operator(&mut self, op: Op, left: Option<AstId>, right: Option<AstId>) -> AstId {
    self.new_with(AstKind::Operator, Payload::Oper(op), left, right)
  }

  pub fn assign(&mut self, left: AstId, right: AstId) -> AstId {
    self.new_node(AstKind::Assign, Some(left), Some(right))
  }

  pub fn expr_item(&mut self, item: AstId) -> AstId {
    self.new_node(AstKind::ExprList, Some(item), None)
  }

  // ---- list manipulation -------------------------------------------------

  /// Append `elem` to a `ListHolder`/`ExprList` chain, returning the
  /// (possibly new) list head. `elem` must itself be a list cell.
  pub fn list_append(&mut self, list: Option<AstId>, elem: AstId) -> AstId {
    let Some(head) = list else { return elem };
    let mut cur = head;
    while let Some(next) = self.get(cur).right { cur = next }
    self.get_mut(cur).right = Some(elem);
    head
  }

  /// Prepend `elem` (a list cell) to the chain.
  pub fn list_prepend(&mut self, list: Option<AstId>, elem: AstId) -> AstId {
    self.get_mut(elem).right = list;
    elem
  }

  /// Insert list cell `elem` before `member` in the chain, returning the
  /// new head.
  pub fn list_insert_before(&mut self, list: AstId, member: AstId, elem: AstId) -> AstId {
    if list == member {
      self.get_mut(elem).right = Some(list);
      return elem;
    }
    let mut cur = list;
    while let Some(next) = self.get(cur).right {
      if next == member {
        self.get_mut(elem).right = Some(member);
        self.get_mut(cur).right = Some(elem);
        return list;
      }
      cur = next;
    }
    // member not found; append
    self.get_mut(elem).right = None;
    self.list_append(Some(list), elem)
  }

  /// Remove the cell whose `left` is `elem` from the chain.
  pub fn list_remove(&mut self, list: AstId, elem: AstId) -> Option<AstId> {
    let mut head = Some(list);
    let mut prev: Option<AstId> = None;
    let mut cur = head;
    while let Some(c) = cur {
      if self.get(c).left == Some(elem) {
        let rest = self.get(c).right;
        match prev {
          Some(p) => { self.get_mut(p).right = rest; }
          None => { head = rest; }
        }
        return head;
      }
      prev = cur;
      cur = self.get(c).right;
    }
    head
  }

  /// Number of cells in a list chain.
  #[must_use] pub fn list_len(&self, mut list: Option<AstId>) -> usize {
    let mut n = 0;
    while let Some(id) = list {
      n += 1;
      list = self.get(id).right;
    }
    n
  }

  /// Checks for a list with exactly one element and returns that element.
  #[must_use] pub fn expect_one_elem(&self, list: AstId) -> Option<AstId> {
    let node = self.get(list);
    if node.kind != AstKind::ExprList && node.kind != AstKind::ListHolder {
      return Some(list);
    }
    if node.right.is_some() { return None }
    node.left
  }

  /// Iterate a list chain, yielding the `left` of each cell.
  pub fn list_iter(&self, list: Option<AstId>) -> ListIter<'_> {
    ListIter { pool: self, cur: list }
  }

  // ---- string lists ------------------------------------------------------

  /// Byte length of a `StringPtr` expression list: strings contribute
  /// their encoded bytes, integers one byte each.
  #[must_use] pub fn stringptr_byte_len(&self, mut list: Option<AstId>) -> usize {
    let mut n = 0;
    while let Some(id) = list {
      let cell = self.get(id);
      if let Some(item) = cell.left {
        match self.get(item).kind {
          AstKind::String => {
            if let Payload::Str(s) = self.get(item).d { n += s.as_str().len() }
          }
          AstKind::ExprList => { n += self.stringptr_byte_len(Some(item)) }
          _ => { n += 1 }
        }
      }
      list = cell.right;
    }
    n
  }

  // ---- copying and matching ---------------------------------------------

  /// Deep copy of a subtree. The copy carries the original spans.
  pub fn dup(&mut self, id: AstId) -> AstId {
    let node = *self.get(id);
    let left = node.left.map(|l| self.dup(l));
    let right = node.right.map(|r| self.dup(r));
    self.alloc(Ast { left, right, ..node })
  }

  /// Deep copy with substitution: every subtree matching `orig` is
  /// replaced by a fresh copy of `replace`.
  pub fn dup_with_replace(&mut self, id: AstId, orig: AstId, replace: AstId) -> AstId {
    if self.match_ast(id, orig) { return self.dup(replace) }
    let node = *self.get(id);
    let left = node.left.map(|l| self.dup_with_replace(l, orig, replace));
    let right = node.right.map(|r| self.dup_with_replace(r, orig, replace));
    self.alloc(Ast { left, right, ..node })
  }

  /// Structural equality of two trees (spans ignored).
  #[must_use] pub fn match_ast(&self, a: AstId, b: AstId) -> bool {
    if a == b { return true }
    let (na, nb) = (self.get(a), self.get(b));
    if na.kind != nb.kind || na.d != nb.d { return false }
    self.match_opt(na.left, nb.left) && self.match_opt(na.right, nb.right)
  }

  fn match_opt(&self, a: Option<AstId>, b: Option<AstId>) -> bool {
    match (a, b) {
      (None, None) => true,
      (Some(a), Some(b)) => self.match_ast(a, b),
      _ => false,
    }
  }

  /// Equality of two function bodies up to consistent renaming of local
  /// identifiers.
  #[must_use] pub fn match_body(&self, a: AstId, b: AstId) -> bool {
    let mut map = HashMap::new();
    self.match_body_rec(Some(a), Some(b), &mut map)
  }

  fn match_body_rec(&self, a: Option<AstId>, b: Option<AstId>,
                    map: &mut HashMap<Symbol, Symbol>) -> bool {
    let (a, b) = match (a, b) {
      (None, None) => return true,
      (Some(a), Some(b)) => (a, b),
      _ => return false,
    };
    let (na, nb) = (self.get(a), self.get(b));
    if na.kind != nb.kind { return false }
    if na.kind == AstKind::LocalIdentifier || na.kind == AstKind::Identifier {
      if let (Payload::Str(sa), Payload::Str(sb)) = (na.d, nb.d) {
        if sa == sb { return true }
        // locals may rename, but consistently
        return *map.entry(sa).or_insert(sb) == sb;
      }
    }
    if na.d != nb.d { return false }
    self.match_body_rec(na.left, nb.left, map)
      && self.match_body_rec(na.right, nb.right, map)
  }

  /// Does `big` contain a subtree structurally equal to `sub`?
  #[must_use] pub fn uses(&self, big: AstId, sub: AstId) -> bool {
    if self.match_ast(big, sub) { return true }
    let node = self.get(big);
    node.left.is_some_and(|l| self.uses(l, sub))
      || node.right.is_some_and(|r| self.uses(r, sub))
  }

  /// Is the identifier `id` assigned or address-taken anywhere in `body`?
  #[must_use] pub fn modifies_identifier(&self, body: AstId, id: AstId) -> bool {
    let node = self.get(body);
    match node.kind {
      AstKind::Assign | AstKind::PostSet => {
        if let Some(l) = node.left {
          if self.uses(l, id) { return true }
        }
      }
      AstKind::AddrOf | AstKind::AbsAddrOf => {
        if let Some(l) = node.left {
          if self.uses(l, id) { return true }
        }
      }
      AstKind::Operator => {
        if let Payload::Oper(Op::Increment | Op::Decrement) = node.d {
          return node.left.is_some_and(|l| self.uses(l, id))
            || node.right.is_some_and(|r| self.uses(r, id));
        }
      }
      _ => {}
    }
    node.left.is_some_and(|l| self.modifies_identifier(l, id))
      || node.right.is_some_and(|r| self.modifies_identifier(r, id))
  }

  /// Replace every occurrence of `old` inside `body` with a copy of `new`.
  pub fn replace_ast(&mut self, body: AstId, old: AstId, new: AstId) {
    if self.match_ast(body, old) {
      let repl = *self.get(new);
      let span = self.get(body).span;
      *self.get_mut(body) = Ast { span, ..repl };
      return;
    }
    let (l, r) = { let n = self.get(body); (n.left, n.right) };
    if let Some(l) = l { self.replace_ast(l, old, new) }
    if let Some(r) = r { self.replace_ast(r, old, new) }
  }

  /// Turn a node into a no-op expression (integer 0).
  pub fn nullify(&mut self, id: AstId) {
    let node = self.get_mut(id);
    node.kind = AstKind::Integer;
    node.d = Payload::Int(0);
    node.left = None;
    node.right = None;
  }

  /// Is this node an identifier (plain or alpha-renamed local)?
  #[must_use] pub fn is_identifier(&self, id: AstId) -> bool {
    matches!(self.kind(id), AstKind::Identifier | AstKind::LocalIdentifier)
  }

  /// The interned name of an identifier node, following the internal slot
  /// of a `LocalIdentifier`.
  #[must_use] pub fn ident_name(&self, id: AstId) -> Option<Symbol> {
    match self.get(id).kind {
      AstKind::Identifier => match self.get(id).d {
        Payload::Str(s) => Some(s),
        _ => None,
      },
      AstKind::LocalIdentifier => self.get(id).left.and_then(|l| self.ident_name(l)),
      _ => None,
    }
  }

  /// The user-visible name of an identifier (the right slot of a
  /// `LocalIdentifier` keeps the pre-rename spelling).
  #[must_use] pub fn user_name(&self, id: AstId) -> Option<Symbol> {
    match self.get(id).kind {
      AstKind::Identifier => match self.get(id).d {
        Payload::Str(s) => Some(s),
        _ => None,
      },
      AstKind::LocalIdentifier => {
        let r = self.get(id).right;
        r.and_then(|r| self.ident_name(r)).or_else(|| {
          self.get(id).left.and_then(|l| self.ident_name(l))
        })
      }
      _ => None,
    }
  }

  /// Skip `CommentedNode` wrappers.
  #[must_use] pub fn uncomment(&self, mut id: AstId) -> AstId {
    while self.kind(id) == AstKind::CommentedNode {
      match self.get(id).left {
        Some(l) => id = l,
        None => break,
      }
    }
    id
  }
}

impl Default for AstPool {
  fn default() -> Self { Self::new() }
}

pub struct ListIter<'a> {
  pool: &'a AstPool,
  cur: Option<AstId>,
}

impl Iterator for ListIter<'_> {
  type Item = AstId;
  fn next(&mut self) -> Option<AstId> {
    while let Some(cell) = self.cur {
      self.cur = self.pool.get(cell).right;
      if let Some(item) = self.pool.get(cell).left { return Some(item) }
    }
    None
  }
}

#[cfg(test)]
mod test {
  use super::*;

  fn pool() -> AstPool { AstPool::new() }

  #[test]
  fn list_ops() {
    let mut p = pool();
    let a = p.integer(1);
    let b = p.integer(2);
    let c = p.integer(3);
    let ea = p.expr_item(a);
    let eb = p.expr_item(b);
    let ec = p.expr_item(c);
    let list = p.list_append(None, ea);
    let list = p.list_append(Some(list), eb);
    let list = p.list_append(Some(list), ec);
    assert_eq!(p.list_len(Some(list)), 3);
    let items: Vec<_> = p.list_iter(Some(list)).collect();
    assert_eq!(items, vec![a, b, c]);
    let list2 = p.list_remove(list, b).unwrap();
    let items: Vec<_> = p.list_iter(Some(list2)).collect();
    assert_eq!(items, vec![a, c]);
  }

  #[test]
  fn dup_and_match() {
    let mut p = pool();
    let x = p.identifier("x");
    let two = p.integer(2);
    let sum = p.operator(Op::Add, Some(x), Some(two));
    let copy = p.dup(sum);
    assert_ne!(sum, copy);
    assert!(p.match_ast(sum, copy));
    let y = p.identifier("y");
    let subst = p.dup_with_replace(sum, x, y);
    assert!(!p.match_ast(sum, subst));
    assert_eq!(p.ident_name(p.left(subst).unwrap()), Some(intern("y")));
  }

  #[test]
  fn body_match_renames() {
    let mut p = pool();
    // x := x + 1  vs  y := y + 1, consistent rename
    let mk = |p: &mut AstPool, name: &str| {
      let v = p.identifier(name);
      let one = p.integer(1);
      let add = p.operator(Op::Add, Some(v), Some(one));
      let v2 = p.identifier(name);
      p.assign(v2, add)
    };
    let a = mk(&mut p, "x");
    let b = mk(&mut p, "y");
    assert!(p.match_body(a, b));
    // inconsistent rename fails
    let v = p.identifier("x");
    let one = p.integer(1);
    let add = p.operator(Op::Add, Some(v), Some(one));
    let other = p.identifier("z");
    let c = p.assign(other, add);
    assert!(!p.match_body(a, c));
  }

  #[test]
  fn modifies() {
    let mut p = pool();
    let x = p.identifier("x");
    let x2 = p.identifier("x");
    let one = p.integer(1);
    let body = p.assign(x2, one);
    assert!(p.modifies_identifier(body, x));
    let y = p.identifier("y");
    assert!(!p.modifies_identifier(body, y));
  }

  #[test]
  fn report_as_inherits_span() {
    let mut p = pool();
    p.set_source(SrcSpan { file: intern("a.spin"), line: 10 });
    let orig = p.integer(5);
    p.set_source(SrcSpan { file: intern("a.spin"), line: 99 });
    let save = p.report_as(orig);
    let synth = p.integer(6);
    p.report_done(save);
    assert_eq!(p.span(synth).line, 10);
    let after = p.integer(7);
    assert_eq!(p.span(after).line, 99);
  }

  #[test]
  fn stringptr_len() {
    let mut p = pool();
    let s = p.string("hi");
    let n = p.integer(13);
    let es = p.expr_item(s);
    let en = p.expr_item(n);
    let list = p.list_append(Some(es), en);
    assert_eq!(p.stringptr_byte_len(Some(list)), 3);
  }
}
