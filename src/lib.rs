//! Core of a multi-frontend compiler for the Parallax Propeller 1 and 2.
//!
//! The crate accepts source modules lowered by an external parser into the
//! shared AST ([`types::ast`]), runs the type-check/coercion rewrite
//! ([`typecheck`]), and emits one of several low-level artifacts: encoded
//! PASM ([`asm`]), a stack bytecode for the P1 ROM interpreter
//! ([`build_bc`]), a register-oriented bytecode for a P2 resident
//! interpreter ([`build_nu`] + [`packer`]), or a raw DAT image with
//! relocations ([`dat`]). Post-processing (checksum, padding, debugger
//! prepend, LZ4 wrapping) lives in [`codegen`].
//!
//! The whole core is single-threaded and pass-based: the [`Compiler`]
//! session owns every pool, and each pass either rewrites the AST in
//! place, fills symbol-table side tables, or produces an IR list for the
//! next pass.

pub mod symbol;
pub mod diag;
pub mod types;
pub mod clock;
pub mod typecheck;
pub mod instr;
pub mod asm;
pub mod dat;
pub mod build_bc;
pub mod build_nu;
pub mod nu_opt;
pub mod packer;
pub mod brkdebug;
pub mod compress;
pub mod codegen;

use bitflags::bitflags;
use crate::diag::Diagnostics;
use crate::symbol::{Symbol, intern};
use crate::types::{AstId, FuncId, ModuleId, SrcSpan};
use crate::types::ast::{AstKind, AstPool, Payload};
use crate::types::entity::{SymKind, SymTab, SymVal};

pub const LONG_SIZE: i32 = 4;
pub const NUM_COGS: u32 = 8;
pub const P2_HUB_BASE: u32 = 0x400;

/// Compilation target.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Target {
  P1,
  /// Original P2 silicon (narrow pointer indexes, LUT quirks).
  P2RevA,
  P2RevB,
}

impl Target {
  #[must_use] pub fn is_p2(self) -> bool { !matches!(self, Target::P1) }
}

/// What artifact the session produces.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Output {
  Dat,
  Asm,
  CogSpin,
  Bytecode,
}

/// Which interpreter the bytecode output targets.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum InterpKind {
  /// The P1 ROM stack interpreter.
  P1Rom,
  /// The P2 "Nu" register interpreter.
  NuCode,
}

/// Surface language a module or function was written in.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Language {
  Spin1,
  Spin2,
  Basic,
  C,
}

impl Language {
  /// Spin is historically case-insensitive.
  #[must_use] pub fn case_sensitive(self) -> bool {
    !matches!(self, Language::Spin1 | Language::Spin2)
  }
}

bitflags! {
  /// Optimisation switches (`-O` bits).
  #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
  pub struct OptimizeFlags: u32 {
    const REMOVE_UNUSED_FUNCS = 0x01;
    const PERFORM_CSE         = 0x02;
    const REMOVE_HUB_BSS      = 0x04;
    const BASIC_ASM           = 0x08;
    const INLINE_SMALLFUNCS   = 0x10;
    const INLINE_SINGLEUSE    = 0x20;
    const PEEPHOLE            = 0x40;
    const DEADCODE            = 0x80;
    const MAKE_MACROS         = 0x100;
  }
}

bitflags! {
  #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
  pub struct WarnFlags: u32 {
    const ASM_USAGE  = 0x01;
    const HIDE_MEMBERS = 0x02;
    const INIT_VARS  = 0x04;
    const ALL        = 0xff;
  }
}

/// Behavioural switches read by the core; the CLI shell fills this in.
#[derive(Clone, Debug)]
pub struct Options {
  pub target: Target,
  pub output: Output,
  pub interp_kind: InterpKind,
  pub optimize: OptimizeFlags,
  pub warn: WarnFlags,
  pub debug: bool,
  pub brkdebug: bool,
  pub compress_output: bool,
  pub dat_offset: i32,
  pub hub_base: u32,
  pub no_coginit: bool,
  pub fixedreal: bool,
  pub default_baud: u32,
  pub default_xtlfreq: u32,
  pub default_xinfreq: u32,
  pub case_sensitive: bool,
  pub colorize_output: bool,
  pub max_errors: u32,
  pub listing: bool,
  pub expand_constants: bool,
  pub nostdlib: bool,
  /// Set when only a DAT section is output (no Spin methods); affects
  /// branch-mode selection in the assembler.
  pub no_spin: bool,
  pub src_comments: bool,
}

impl Default for Options {
  fn default() -> Self {
    Options {
      target: Target::P2RevB,
      output: Output::Dat,
      interp_kind: InterpKind::NuCode,
      optimize: OptimizeFlags::REMOVE_UNUSED_FUNCS | OptimizeFlags::BASIC_ASM
        | OptimizeFlags::INLINE_SMALLFUNCS | OptimizeFlags::PEEPHOLE
        | OptimizeFlags::DEADCODE,
      warn: WarnFlags::empty(),
      debug: false,
      brkdebug: false,
      compress_output: false,
      dat_offset: 0,
      hub_base: P2_HUB_BASE,
      no_coginit: false,
      fixedreal: false,
      default_baud: 0,
      default_xtlfreq: 0,
      default_xinfreq: 0,
      case_sensitive: false,
      colorize_output: false,
      max_errors: 10,
      listing: false,
      expand_constants: false,
      nostdlib: false,
      no_spin: false,
      src_comments: false,
    }
  }
}

bitflags! {
  /// Per-function boolean attributes.
  #[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
  pub struct FuncFlags: u16 {
    const RESULT_USED    = 0x001;
    const IS_STATIC      = 0x002;
    const IS_RECURSIVE   = 0x004;
    const FORCE_STATIC   = 0x008;
    const COG_CODE       = 0x010;
    const COG_TASK       = 0x020;
    const USED_AS_PTR    = 0x040;
    const LOCAL_ADDRESS_TAKEN = 0x080;
    const NO_INLINE      = 0x100;
    const IS_LEAF        = 0x200;
  }
}

/// A function body: statements, or a single interpreter opcode for the
/// tiny wrappers in the system library.
#[derive(Copy, Clone, Debug, Default, PartialEq)]
pub enum FuncBody {
  #[default]
  None,
  Stmts(AstId),
  /// "This function is really a single bytecode opcode."
  RawBytecode(u8),
}

/// Back-end scratch attached to a function by whichever backend runs.
#[derive(Default)]
pub enum FuncBackend {
  #[default]
  None,
  Bc(build_bc::BcFuncData),
  Nu(build_nu::NuFuncData),
}

/// An object method (or standalone function).
pub struct Function {
  pub name: Symbol,
  pub user_name: Symbol,
  pub is_public: bool,
  pub decl_span: SrcSpan,
  /// The function's overall type: return + parameter list.
  pub overall_type: Option<AstId>,
  pub annotations: Option<AstId>,
  pub doc_comment: Option<AstId>,
  pub numparams: i32,
  pub params: Option<AstId>,
  pub default_params: Option<AstId>,
  pub numlocals: i32,
  pub locals: Option<AstId>,
  pub numresults: i32,
  pub result_expr: Option<AstId>,
  pub body: FuncBody,
  pub localsyms: SymTab,
  pub module: ModuleId,
  pub flags: FuncFlags,
  /// 0 == unused function, 1 == ripe for inlining.
  pub call_sites: u32,
  /// Times the function's address was taken as a method pointer. A
  /// function with a nonzero count survives dead-code elimination even
  /// with no call sites.
  pub method_ptr_uses: u32,
  pub visit_flag: u32,
  pub language: Language,
  pub closure: Option<ModuleId>,
  pub caller: Option<Symbol>,
  pub be: FuncBackend,
}

/// Back-end scratch attached to a module.
#[derive(Default)]
pub enum ModBackend {
  #[default]
  None,
  Bc(build_bc::BcModData),
  Nu(build_nu::NuModData),
}

/// A compiled surface-language file, or a synthetic container (anonymous
/// struct, closure environment, debug stub).
pub struct Module {
  pub fullname: Symbol,
  pub classname: Symbol,
  pub datname: Symbol,
  pub language: Language,
  pub conblock: Option<AstId>,
  pub datblock: Option<AstId>,
  pub varblock: Option<AstId>,
  /// Member list after layout finalisation, in declaration order.
  pub final_varblock: Option<AstId>,
  pub objblock: Option<AstId>,
  pub funcblock: Option<AstId>,
  /// Statements outside any function (BASIC/C main bodies).
  pub body: Option<AstId>,
  pub functions: Vec<FuncId>,
  pub objsyms: SymTab,
  /// Total size of member variables; valid once `layout_pending` clears.
  pub varsize: i32,
  pub layout_pending: bool,
  pub datsize: i32,
  pub is_union: bool,
  pub is_interface: bool,
  pub parent: Option<ModuleId>,
  pub subclasses: Vec<ModuleId>,
  pub visit_flag: u32,
  pub pasm_labels: bool,
  pub code_cog: bool,
  pub dat_has_code: bool,
  pub volatile_variables: bool,
  /// DAT labels, addressed by `SymVal::Label` indexes.
  pub labels: Vec<dat::DatLabel>,
  pub be: ModBackend,
}

impl Module {
  fn new(fullname: Symbol, classname: Symbol, language: Language, case_sensitive: bool) -> Self {
    Module {
      fullname, classname, language,
      datname: intern("dat"),
      conblock: None, datblock: None, varblock: None, final_varblock: None,
      objblock: None, funcblock: None, body: None,
      functions: Vec::new(),
      objsyms: SymTab::new(case_sensitive),
      varsize: 0, layout_pending: true, datsize: 0,
      is_union: false, is_interface: false,
      parent: None, subclasses: Vec::new(),
      visit_flag: 0,
      pasm_labels: false, code_cog: false, dat_has_code: false,
      volatile_variables: false,
      labels: Vec::new(),
      be: ModBackend::None,
    }
  }
}

/// Visitor phases; the flag keeps a pass from revisiting a module.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u32)]
pub enum VisitPhase {
  Init = 0x0124_0001,
  FuncNames,
  CompileFuncs,
  ExpandInline,
  EmitDat,
  BcOptimize,
  CompileIrCog,
  CompileIrHub,
  CompileIrLut,
}

/// The compiler session: owns every pool and all pass state. One
/// top-level module is compiled at a time.
pub struct Compiler {
  pub options: Options,
  pub diag: Diagnostics,
  pub ast: AstPool,
  pub modules: Vec<Module>,
  pub funcs: Vec<Function>,
  /// Global functions and variables (the system library).
  pub system_module: ModuleId,
  pub top_module: Option<ModuleId>,
  pub current_module: Option<ModuleId>,
  pub current_function: Option<FuncId>,
  pub brk: brkdebug::BrkState,
  /// Set once any pass records that the generated program needs the heap
  /// allocator (varargs, copyref boxing).
  pub need_heap: bool,
}

impl Compiler {
  #[must_use] pub fn new(options: Options) -> Self {
    let mut diag = Diagnostics::new(options.max_errors);
    diag.colorize = options.colorize_output;
    let mut c = Compiler {
      diag,
      ast: AstPool::new(),
      modules: Vec::new(),
      funcs: Vec::new(),
      system_module: ModuleId(0),
      top_module: None,
      current_module: None,
      current_function: None,
      brk: brkdebug::BrkState::new(),
      need_heap: false,
      options,
    };
    let sys = c.new_module("_system_", Language::Spin2);
    c.system_module = sys;
    c
  }

  #[must_use] pub fn module(&self, m: ModuleId) -> &Module { &self.modules[m.idx()] }
  pub fn module_mut(&mut self, m: ModuleId) -> &mut Module { &mut self.modules[m.idx()] }
  #[must_use] pub fn func(&self, f: FuncId) -> &Function { &self.funcs[f.idx()] }
  pub fn func_mut(&mut self, f: FuncId) -> &mut Function { &mut self.funcs[f.idx()] }

  /// The module whose constants resolve clock frequency and baud rate.
  #[must_use] pub fn top_level_module(&self) -> ModuleId {
    self.top_module.unwrap_or(self.system_module)
  }

  // ---- upstream API (called by the parser glue) --------------------------

  /// Create a new module for a source file (or synthetic container).
  pub fn new_module(&mut self, fullname: &str, language: Language) -> ModuleId {
    let case = self.options.case_sensitive || language.case_sensitive();
    let full = intern(fullname);
    let base = fullname.rsplit('/').next().unwrap_or(fullname);
    let class = intern(base.split('.').next().unwrap_or(base));
    let id = ModuleId::from_usize(self.modules.len());
    self.modules.push(Module::new(full, class, language, case));
    if self.top_module.is_none() && !self.modules.is_empty() && self.modules.len() > 1 {
      self.top_module = Some(id);
    }
    id
  }

  /// Declare a function in `module`. `funcdef` is a `FuncDef` AST
  /// (declaration + vars); `body` is the statement list.
  pub fn declare_function(&mut self, module: ModuleId, rettype: Option<AstId>,
                          is_public: bool, funcdef: AstId, body: Option<AstId>,
                          annotations: Option<AstId>, comment: Option<AstId>) -> FuncId {
    let span = self.ast.span(funcdef);
    let decl = self.ast.left(funcdef);
    let vars = self.ast.right(funcdef);
    let name_node = decl.and_then(|d| self.ast.left(d));
    let name = name_node.and_then(|n| self.ast.ident_name(n))
      .unwrap_or_else(|| intern("_anon_"));
    let (params, locals) = match vars {
      Some(v) => (self.ast.left(v), self.ast.right(v)),
      None => (None, None),
    };
    let numparams = self.ast.list_len(params) as i32;
    let numlocals = self.ast.list_len(locals) as i32;
    let result_expr = decl.and_then(|d| self.ast.right(d));
    let case = self.module(module).objsyms.case_sensitive;
    let language = self.module(module).language;
    let id = FuncId::from_usize(self.funcs.len());
    self.funcs.push(Function {
      name, user_name: name, is_public,
      decl_span: span,
      overall_type: rettype.map(|rt| {
        self.ast.new_node(AstKind::FuncType, Some(rt), params)
      }),
      annotations, doc_comment: comment,
      numparams, params, default_params: None,
      numlocals, locals,
      numresults: if result_expr.is_some() { 1 } else { 0 },
      result_expr,
      body: match body {
        Some(b) => FuncBody::Stmts(b),
        None => FuncBody::None,
      },
      localsyms: SymTab::new(case),
      module,
      flags: FuncFlags::empty(),
      call_sites: 0,
      method_ptr_uses: 0,
      visit_flag: 0,
      language,
      closure: None,
      caller: None,
      be: FuncBackend::None,
    });
    self.module_mut(module).functions.push(id);
    let kind = SymKind::Function;
    if let Err(dup) = self.modules[module.idx()].objsyms
      .add_placed(name, kind, SymVal::Func(id), span, name)
    {
      self.diag.error(span, diag::DiagKind::Symbol,
                      format!("redefinition of function {name}"));
      self.diag.note(dup.prev_span, "previous definition is here");
    }
    id
  }

  /// Enter a CON block's constants into the module symbol table.
  /// `conblock` is a list of `Assign`/`EnumSet`/`EnumSkip` items.
  pub fn declare_constants(&mut self, module: ModuleId, conblock: AstId) {
    let mut enum_val: i64 = 0;
    let items: Vec<AstId> = self.ast.list_iter(Some(conblock)).collect();
    for item in items {
      let item = self.ast.uncomment(item);
      match self.ast.kind(item) {
        AstKind::EnumSet => {
          if let Some(l) = self.ast.left(item) {
            enum_val = self.const_val_or(l, 0);
          }
        }
        AstKind::EnumSkip => {
          if let Some(l) = self.ast.left(item) {
            let ident = l;
            let val_node = self.ast.integer(enum_val);
            self.bind_constant(module, ident, val_node);
          }
          if let Some(r) = self.ast.right(item) {
            enum_val += self.const_val_or(r, 1);
          } else {
            enum_val += 1;
          }
        }
        AstKind::Assign => {
          let Some(ident) = self.ast.left(item) else { continue };
          let Some(val) = self.ast.right(item) else { continue };
          self.bind_constant(module, ident, val);
        }
        AstKind::Identifier | AstKind::LocalIdentifier => {
          let val_node = self.ast.integer(enum_val);
          self.bind_constant(module, item, val_node);
          enum_val += 1;
        }
        _ => {}
      }
    }
  }

  fn bind_constant(&mut self, module: ModuleId, ident: AstId, val: AstId) {
    let Some(name) = self.ast.ident_name(ident) else {
      let span = self.ast.span(ident);
      self.diag.error(span, diag::DiagKind::Internal,
                      format!("expected identifier in constant declaration, got {:?}",
                              self.ast.kind(ident)));
      return;
    };
    let span = self.ast.span(ident);
    let kind = if self.ast.kind(val) == AstKind::Float {
      SymKind::FloatConstant
    } else {
      SymKind::Constant
    };
    if let Err(dup) = self.modules[module.idx()].objsyms
      .add_placed(name, kind, SymVal::Ast(val), span, name)
    {
      self.diag.error(span, diag::DiagKind::Symbol,
                      format!("symbol {name} redefined"));
      self.diag.note(dup.prev_span, "previous definition is here");
    }
  }

  /// Add one internal (compiler-synthesised) constant.
  pub fn add_internal_symbol(&mut self, module: ModuleId, name: &str, val: i64) {
    let sym = intern(name);
    let node = self.ast.integer(val);
    let ent = self.modules[module.idx()].objsyms
      .add_placed(sym, SymKind::Constant, SymVal::Ast(node), SrcSpan::none(), sym);
    if let Ok(e) = ent { e.flags |= types::entity::SymFlags::INTERNAL }
  }

  /// Declare a single global variable of `module` (optionally placed in
  /// the DAT section with an initializer).
  pub fn declare_one_global_var(&mut self, module: ModuleId, ident: AstId,
                                typ: AstId, in_dat: bool) {
    let (name_node, init) = if self.ast.kind(ident) == AstKind::Assign {
      (self.ast.left(ident).expect("assign lhs"), self.ast.right(ident))
    } else {
      (ident, None)
    };
    let Some(name) = self.ast.ident_name(name_node) else {
      let span = self.ast.span(ident);
      self.diag.error(span, diag::DiagKind::Symbol, "bad global variable declaration");
      return;
    };
    let span = self.ast.span(name_node);
    if in_dat {
      // lives in DAT: append a DeclareVar directive the serialiser will lower
      let decl = self.ast.new_node(AstKind::DeclareVar, Some(typ), Some(ident));
      let holder = self.ast.new_node(AstKind::ListHolder, Some(decl), None);
      let old = self.module(module).datblock;
      let newblock = self.ast.list_append(old, holder);
      self.module_mut(module).datblock = Some(newblock);
      let labelid = self.module(module).labels.len() as u32;
      self.module_mut(module).labels.push(dat::DatLabel {
        hubval: 0, cogval: 0, ty: Some(typ), org: None,
        flags: dat::LabelFlags::IN_HUB,
      });
      let _ = self.modules[module.idx()].objsyms
        .add_placed(name, SymKind::Label, SymVal::Label(labelid), span, name);
    } else {
      let _ = init;
      let offset = self.layout_member(module, typ);
      match self.modules[module.idx()].objsyms
        .add_placed(name, SymKind::Variable, SymVal::Ast(typ), span, name)
      {
        Ok(e) => e.offset = offset,
        Err(dup) => {
          self.diag.error(span, diag::DiagKind::Symbol,
                          format!("symbol {name} redefined"));
          self.diag.note(dup.prev_span, "previous definition is here");
        }
      }
    }
  }

  /// Declare a single member variable of `module`.
  pub fn declare_one_member_var(&mut self, module: ModuleId, ident: AstId, typ: AstId) {
    let Some(name) = self.ast.ident_name(ident) else {
      let span = self.ast.span(ident);
      self.diag.error(span, diag::DiagKind::Symbol, "bad member variable declaration");
      return;
    };
    let span = self.ast.span(ident);
    let offset = self.layout_member(module, typ);
    let decl = self.ast.new_node(AstKind::DeclareVar, Some(typ), Some(ident));
    let holder = self.ast.new_node(AstKind::ListHolder, Some(decl), None);
    let old = self.module(module).varblock;
    let newblock = self.ast.list_append(old, holder);
    self.module_mut(module).varblock = Some(newblock);
    match self.modules[module.idx()].objsyms
      .add_placed(name, SymKind::Variable, SymVal::Ast(typ), span, name)
    {
      Ok(e) => e.offset = offset,
      Err(dup) => {
        self.diag.error(span, diag::DiagKind::Symbol,
                        format!("member {name} redefined"));
        self.diag.note(dup.prev_span, "previous definition is here");
      }
    }
  }

  /// Member declared only if not already present.
  pub fn maybe_declare_member_var(&mut self, module: ModuleId, ident: AstId, typ: AstId) {
    if let Some(name) = self.ast.ident_name(ident) {
      if self.module(module).objsyms.contains(name) { return }
    }
    self.declare_one_member_var(module, ident, typ);
  }

  fn layout_member(&mut self, module: ModuleId, typ: AstId) -> i32 {
    let size = self.type_size(typ);
    let align = self.type_align(typ);
    let m = self.module_mut(module);
    if m.is_union {
      if size > m.varsize { m.varsize = size }
      0
    } else {
      let offset = (m.varsize + align - 1) & !(align - 1);
      m.varsize = offset + size;
      offset
    }
  }

  /// Finalise member layout: `varsize` rounds up to a long boundary
  /// (union: round up the max member size).
  pub fn finalize_layout(&mut self, module: ModuleId) {
    let m = self.module_mut(module);
    if !m.layout_pending { return }
    m.layout_pending = false;
    m.varsize = (m.varsize + LONG_SIZE - 1) & !(LONG_SIZE - 1);
    m.final_varblock = m.varblock;
  }

  /// Instantiate a sub-object declaration: `identifier : "file"`.
  pub fn new_object(&mut self, module: ModuleId, ident: AstId, filename: &str,
                    language: Language) -> ModuleId {
    let sub = self.new_object_common(module, ident, filename, language, false);
    sub
  }

  /// Like [`Compiler::new_object`] but without instantiating data
  /// (abstract/interface references).
  pub fn new_abstract_object(&mut self, module: ModuleId, ident: AstId,
                             filename: &str, language: Language) -> ModuleId {
    self.new_object_common(module, ident, filename, language, true)
  }

  /// Sub-object with a CON-override parameter list.
  pub fn new_object_with_params(&mut self, module: ModuleId, ident: AstId,
                                filename: &str, language: Language,
                                params: AstId) -> ModuleId {
    let sub = self.new_object_common(module, ident, filename, language, false);
    // overrides land in the sub-object's CON table
    self.declare_constants(sub, params);
    sub
  }

  /// Abstract sub-object with a CON-override parameter list.
  pub fn new_abstract_object_with_params(&mut self, module: ModuleId, ident: AstId,
                                         filename: &str, language: Language,
                                         params: AstId) -> ModuleId {
    let sub = self.new_object_common(module, ident, filename, language, true);
    self.declare_constants(sub, params);
    sub
  }

  fn new_object_common(&mut self, module: ModuleId, ident: AstId, filename: &str,
                       language: Language, abstract_only: bool) -> ModuleId {
    let sub = self.new_module(filename, language);
    self.module_mut(sub).parent = Some(module);
    let objnode = self.ast.new_with(AstKind::Object, Payload::Module(sub), None, None);
    if !abstract_only {
      let holder = self.ast.new_node(AstKind::ListHolder, Some(objnode), None);
      let old = self.module(module).objblock;
      let newblock = self.ast.list_append(old, holder);
      self.module_mut(module).objblock = Some(newblock);
    }
    if let Some(name) = self.ast.ident_name(ident) {
      let span = self.ast.span(ident);
      let objtype = self.ast.new_with(AstKind::Object, Payload::Module(sub), None, None);
      match self.modules[module.idx()].objsyms
        .add_placed(name, SymKind::Variable, SymVal::Ast(objtype), span, name)
      {
        Ok(e) => {
          if abstract_only { e.flags |= types::entity::SymFlags::NOALLOC }
        }
        Err(dup) => {
          self.diag.error(span, diag::DiagKind::Symbol,
                          format!("object {name} redefined"));
          self.diag.note(dup.prev_span, "previous definition is here");
        }
      }
    }
    sub
  }

  /// Declare a list of `type name [= init]` globals (C front ends).
  pub fn declare_typed_global_variables(&mut self, module: ModuleId,
                                        decl_list: AstId, in_dat: bool) {
    let items: Vec<AstId> = self.ast.list_iter(Some(decl_list)).collect();
    for item in items {
      let item = self.ast.uncomment(item);
      if self.ast.kind(item) == AstKind::DeclareVar {
        if let (Some(typ), Some(ident)) = (self.ast.left(item), self.ast.right(item)) {
          self.declare_one_global_var(module, ident, typ, in_dat);
        }
      }
    }
  }

  /// Like [`Compiler::declare_typed_global_variables`] but the names
  /// bind to fixed hardware/software registers rather than hub storage.
  pub fn declare_typed_register_variables(&mut self, module: ModuleId, decl_list: AstId) {
    let items: Vec<AstId> = self.ast.list_iter(Some(decl_list)).collect();
    for item in items {
      let item = self.ast.uncomment(item);
      if self.ast.kind(item) != AstKind::DeclareVar { continue }
      let (Some(typ), Some(ident)) = (self.ast.left(item), self.ast.right(item)) else {
        continue;
      };
      let Some(name) = self.ast.ident_name(ident) else { continue };
      let span = self.ast.span(ident);
      match self.modules[module.idx()].objsyms
        .add_placed(name, SymKind::Variable, SymVal::Ast(typ), span, name)
      {
        Ok(e) => e.flags |= types::entity::SymFlags::NOALLOC,
        Err(dup) => {
          self.diag.error(span, diag::DiagKind::Symbol,
                          format!("register {name} redefined"));
          self.diag.note(dup.prev_span, "previous definition is here");
        }
      }
    }
  }

  /// Turn a declaration AST into symbol bindings (typedefs register in
  /// the module table so the parser can disambiguate type names).
  pub fn make_declaration(&mut self, module: ModuleId, decl: AstId) {
    let decl = self.ast.uncomment(decl);
    match self.ast.kind(decl) {
      AstKind::Typedef => {
        if let (Some(typ), Some(ident)) = (self.ast.left(decl), self.ast.right(decl)) {
          if let Some(name) = self.ast.ident_name(ident) {
            let span = self.ast.span(ident);
            let _ = self.modules[module.idx()].objsyms
              .add_placed(name, SymKind::Typedef, SymVal::Ast(typ), span, name);
          }
        }
      }
      AstKind::DeclareVar => {
        if let (Some(typ), Some(ident)) = (self.ast.left(decl), self.ast.right(decl)) {
          self.declare_one_global_var(module, ident, typ, false);
        }
      }
      AstKind::DeclareVarWeak => {
        if let (Some(typ), Some(ident)) = (self.ast.left(decl), self.ast.right(decl)) {
          if let Some(name) = self.ast.ident_name(ident) {
            if self.module(module).objsyms.contains(name) { return }
          }
          self.declare_one_global_var(module, ident, typ, false);
        }
      }
      AstKind::DeclareAlias => {
        if let (Some(newid), Some(expr)) = (self.ast.left(decl), self.ast.right(decl)) {
          if let Some(name) = self.ast.ident_name(newid) {
            self.module_mut(module).objsyms.declare_alias(name, expr);
          }
        }
      }
      _ => {
        let span = self.ast.span(decl);
        self.diag.error(span, diag::DiagKind::Internal,
                        format!("unexpected declaration kind {:?}", self.ast.kind(decl)));
      }
    }
  }

  // ---- constant evaluation ----------------------------------------------

  /// Evaluate a constant expression; reports an error on failure.
  pub fn const_val(&mut self, e: AstId) -> i64 {
    match self.try_const_val(e) {
      Some(v) => v,
      None => {
        let span = self.ast.span(e);
        self.diag.error(span, diag::DiagKind::Type, "expected a constant expression");
        0
      }
    }
  }

  #[must_use] pub fn const_val_or(&mut self, e: AstId, default: i64) -> i64 {
    self.try_const_val(e).unwrap_or(default)
  }

  /// Constant folding over the expression AST; `None` when not constant.
  #[must_use] pub fn try_const_val(&self, e: AstId) -> Option<i64> {
    use crate::types::ast::Op;
    let node = self.ast.get(e);
    match node.kind {
      AstKind::Integer | AstKind::BitValue => match node.d {
        Payload::Int(v) => Some(v),
        _ => None,
      },
      AstKind::Float => match node.d {
        Payload::FloatBits(b) => Some(i64::from(b)),
        _ => None,
      },
      AstKind::Constant | AstKind::CommentedNode => {
        self.try_const_val(node.left?)
      }
      AstKind::Identifier | AstKind::LocalIdentifier => {
        let name = self.ast.ident_name(e)?;
        let ent = self.lookup_symbol(name)?;
        match (ent.kind, ent.val) {
          (SymKind::Constant | SymKind::FloatConstant, SymVal::Ast(v)) => {
            self.try_const_val(v)
          }
          _ => None,
        }
      }
      AstKind::Operator => {
        let op = match node.d { Payload::Oper(op) => op, _ => return None };
        let l = node.left.map(|l| self.try_const_val(l));
        let r = node.right.map(|r| self.try_const_val(r));
        let lv = match l { Some(v) => v?, None => 0 };
        let rv = match r { Some(v) => v?, None => 0 };
        Some(match op {
          Op::Add => lv.wrapping_add(rv),
          Op::Sub => lv.wrapping_sub(rv),
          Op::Mul => lv.wrapping_mul(rv),
          Op::Div => if rv == 0 { return None } else { lv.wrapping_div(rv) },
          Op::Mods => if rv == 0 { return None } else { lv.wrapping_rem(rv) },
          Op::UnsDiv => if rv == 0 { return None } else {
            ((lv as u32) / (rv as u32)).into()
          },
          Op::UnsMod => if rv == 0 { return None } else {
            ((lv as u32) % (rv as u32)).into()
          },
          Op::Shl => ((lv as u32) << (rv as u32 & 31)) as i32 as i64,
          Op::Shr => ((lv as u32) >> (rv as u32 & 31)).into(),
          Op::Sar => ((lv as i32) >> (rv as u32 & 31)).into(),
          Op::Rotl => ((lv as u32).rotate_left(rv as u32 & 31)).into(),
          Op::Rotr => ((lv as u32).rotate_right(rv as u32 & 31)).into(),
          Op::BitAnd => lv & rv,
          Op::BitOr => lv | rv,
          Op::BitXor => lv ^ rv,
          Op::BitNot => !rv,
          Op::Negate => rv.wrapping_neg(),
          Op::Abs => rv.wrapping_abs(),
          Op::Eq => if lv == rv { -1 } else { 0 },
          Op::Ne => if lv != rv { -1 } else { 0 },
          Op::Lt => if lv < rv { -1 } else { 0 },
          Op::Gt => if lv > rv { -1 } else { 0 },
          Op::Le => if lv <= rv { -1 } else { 0 },
          Op::Ge => if lv >= rv { -1 } else { 0 },
          Op::Ltu => if (lv as u32) < (rv as u32) { -1 } else { 0 },
          Op::Gtu => if (lv as u32) > (rv as u32) { -1 } else { 0 },
          Op::Leu => if (lv as u32) <= (rv as u32) { -1 } else { 0 },
          Op::Geu => if (lv as u32) >= (rv as u32) { -1 } else { 0 },
          Op::LimitMin => lv.max(rv),
          Op::LimitMax => lv.min(rv),
          Op::Decode => 1i64 << (rv as u32 & 31),
          Op::Encode => (32 - (rv as u32).leading_zeros()).into(),
          Op::Rev => ((rv as u32).reverse_bits()).into(),
          _ => return None,
        })
      }
      _ => None,
    }
  }

  #[must_use] pub fn is_const_expr(&self, e: AstId) -> bool {
    self.try_const_val(e).is_some()
  }

  /// Look up a symbol through the current scope chain: current function
  /// locals → current module → system module.
  #[must_use] pub fn lookup_symbol(&self, name: Symbol) -> Option<types::entity::Entity> {
    let mut chain: Vec<&SymTab> = Vec::with_capacity(3);
    if let Some(f) = self.current_function {
      chain.push(&self.func(f).localsyms);
    }
    if let Some(m) = self.current_module {
      chain.push(&self.module(m).objsyms);
    }
    chain.push(&self.module(self.system_module).objsyms);
    match types::entity::lookup(chain, name) {
      types::entity::Lookup::Direct(e) => Some(e),
      _ => None,
    }
  }

  /// Look up a constant in a module's table and evaluate it, with a
  /// fallback default (used all over post-processing).
  #[must_use] pub fn const_or_default(&self, module: ModuleId, name: &str, default: i64) -> i64 {
    let sym = intern(name);
    match self.module(module).objsyms.lookup_in_scope(sym) {
      types::entity::Lookup::Direct(e) if matches!(e.kind, SymKind::Constant) => {
        match e.val {
          SymVal::Ast(v) => self.try_const_val(v).unwrap_or(default),
          _ => default,
        }
      }
      _ => default,
    }
  }

  // ---- module visitor ----------------------------------------------------

  /// Recursively visit `module` and all its sub-objects and subclasses,
  /// calling `f` once per module (guarded by the per-phase visit flag).
  /// The current module/function pair is saved and restored around each
  /// callback.
  pub fn visit_recursive(&mut self, module: ModuleId, phase: VisitPhase,
                         f: &mut dyn FnMut(&mut Compiler, ModuleId)) {
    let visitval = phase as u32;
    if self.module(module).visit_flag == visitval { return }
    let save_mod = self.current_module;
    let save_func = self.current_function;
    self.current_module = Some(module);
    self.module_mut(module).visit_flag = visitval;
    f(self, module);

    let mut subs: Vec<ModuleId> = Vec::new();
    let objblock = self.module(module).objblock;
    for obj in self.ast.list_iter(objblock) {
      if self.ast.kind(obj) != AstKind::Object {
        let span = self.ast.span(obj);
        self.diag.error(span, diag::DiagKind::Internal, "expecting object AST");
        break;
      }
      if let Payload::Module(q) = self.ast.get(obj).d { subs.push(q) }
    }
    subs.extend(self.module(module).subclasses.iter().copied());
    for q in subs {
      self.visit_recursive(q, phase, f);
    }
    self.current_module = save_mod;
    self.current_function = save_func;
  }
}

// ---- string utilities ----------------------------------------------------

/// Create a new path by replacing the extension of `base` with `ext`
/// (which includes the dot). Idempotent:
/// `replace_extension(replace_extension(p, ".a"), ".a") ==
/// replace_extension(p, ".a")`.
#[must_use] pub fn replace_extension(base: &str, ext: &str) -> String {
  let dir_end = base.rfind(['/', '\\']).map_or(0, |i| i + 1);
  match base[dir_end..].rfind('.') {
    Some(dot) => format!("{}{}", &base[..dir_end + dot], ext),
    None => format!("{base}{ext}"),
  }
}

/// Add `basename`'s file part to the directory part of `directory`.
#[must_use] pub fn replace_directory(basename: &str, directory: &str) -> String {
  let base = basename.rsplit(['/', '\\']).next().unwrap_or(basename);
  match directory.rfind(['/', '\\']) {
    Some(i) => format!("{}{}", &directory[..=i], base),
    None => base.to_owned(),
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn replace_extension_idempotent() {
    assert_eq!(replace_extension("foo.spin2", ".binary"), "foo.binary");
    assert_eq!(replace_extension("dir.x/foo", ".lst"), "dir.x/foo.lst");
    let once = replace_extension("a/b.spin", ".a");
    assert_eq!(replace_extension(&once, ".a"), once);
  }

  #[test]
  fn const_folding() {
    let mut c = Compiler::new(Options::default());
    let two = c.ast.integer(2);
    let three = c.ast.integer(3);
    let sum = c.ast.operator(types::ast::Op::Add, Some(two), Some(three));
    assert_eq!(c.try_const_val(sum), Some(5));
    let x = c.ast.identifier("x");
    let bad = c.ast.operator(types::ast::Op::Add, Some(x), Some(three));
    assert_eq!(c.try_const_val(bad), None);
  }

  #[test]
  fn member_layout_and_union() {
    let mut c = Compiler::new(Options::default());
    let m = c.new_module("obj.spin2", Language::Spin2);
    let byte_t = c.byte_type(false);
    let long_t = c.long_type(false);
    let a = c.ast.identifier("a");
    let b = c.ast.identifier("b");
    c.declare_one_member_var(m, a, byte_t);
    c.declare_one_member_var(m, b, long_t);
    c.finalize_layout(m);
    // byte at 0, long aligned to 4, total rounded to 8
    assert_eq!(c.module(m).varsize, 8);
  }

  #[test]
  fn visitor_visits_once() {
    let mut c = Compiler::new(Options::default());
    let top = c.new_module("top.spin2", Language::Spin2);
    let ident = c.ast.identifier("child");
    let sub = c.new_object(top, ident, "child.spin2", Language::Spin2);
    let mut seen = Vec::new();
    c.visit_recursive(top, VisitPhase::Init, &mut |_, m| seen.push(m));
    assert_eq!(seen, vec![top, sub]);
    // second call with the same phase is a no-op
    let mut seen2 = Vec::new();
    c.visit_recursive(top, VisitPhase::Init, &mut |_, m| seen2.push(m));
    assert!(seen2.is_empty());
  }
}
