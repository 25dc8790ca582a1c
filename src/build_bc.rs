//! Stack bytecode backend for the P1 ROM interpreter. A deliberately
//! thin backend: immediates get the compact ROM encodings, locals use
//! the fast-access opcodes, and anything it cannot express reports
//! "cannot compile for bytecode yet" so the function can be routed to
//! the PASM or Nu backend instead.

use byteorder::{ByteOrder, LE};
use crate::{Compiler, FuncBody, FuncId, ModuleId, VisitPhase};
use crate::dat::DatOut;
use crate::diag::DiagKind;
use crate::types::AstId;
use crate::types::ast::{AstKind, Payload};
use crate::types::entity::{Lookup, SymKind};

// dedicated one-byte immediates
const BC_PUSH_M1: u8 = 0x34;
const BC_PUSH_0: u8 = 0x35;
const BC_PUSH_1: u8 = 0x36;
const BC_PUSH_POT: u8 = 0x37;
const BC_PUSH_BYTE: u8 = 0x38;
const BC_PUSH_WORD: u8 = 0x39;
const BC_PUSH_3BYTES: u8 = 0x3a;
const BC_PUSH_LONG: u8 = 0x3b;
const BC_RETURN_PLAIN: u8 = 0x32;
const BC_RETURN_VALUE: u8 = 0x33;
const BC_BIT_NOT: u8 = 0xe7;

/// Per-function backend data.
#[derive(Default)]
pub struct BcFuncData {
  pub code: Vec<u8>,
}

/// Per-module backend data.
#[derive(Default)]
pub struct BcModData {
  /// Object header: link long plus per-method address/stack words.
  pub mem: Vec<u8>,
  pub data: Vec<u8>,
  pub relocs: Vec<crate::dat::Reloc>,
}

/// `±2^k` and `±(2^k − 1)` encode as `PUSH_POT k|tag`. `k` counts from
/// `2 == 2^1` at zero, matching the ROM's decode.
#[must_use] pub fn pow_of_two_encoding(ival: i32) -> Option<u8> {
  let mut m: i64 = 2;
  let v = i64::from(ival);
  for b in 0u8..31 {
    if v == m { return Some(b) }
    if v == m - 1 { return Some(b | 0x20) }
    if v == !m { return Some(b | 0x40) }
    if v == -m { return Some(b | 0x60) }
    m <<= 1;
  }
  None
}

/// Pick the shortest immediate encoding.
pub fn compile_immediate(code: &mut Vec<u8>, i: i32) {
  if i == -1 {
    code.push(BC_PUSH_M1);
  } else if i == 0 {
    code.push(BC_PUSH_0);
  } else if i == 1 {
    code.push(BC_PUSH_1);
  } else if i as u32 & 0xffff_ff00 == 0 {
    code.push(BC_PUSH_BYTE);
    code.push(i as u8);
  } else if let Some(bval) = pow_of_two_encoding(i) {
    code.push(BC_PUSH_POT);
    code.push(bval);
  } else if !i as u32 & 0xffff_ff00 == 0 {
    code.push(BC_PUSH_BYTE);
    code.push(!i as u8);
    code.push(BC_BIT_NOT);
  } else if i as u32 & 0xffff_0000 == 0 {
    code.push(BC_PUSH_WORD);
    code.push((i >> 8) as u8);
    code.push(i as u8);
  } else if i as u32 & 0xff00_0000 == 0 {
    code.push(BC_PUSH_3BYTES);
    code.push((i >> 16) as u8);
    code.push((i >> 8) as u8);
    code.push(i as u8);
  } else {
    code.push(BC_PUSH_LONG);
    code.push((i >> 24) as u8);
    code.push((i >> 16) as u8);
    code.push((i >> 8) as u8);
    code.push(i as u8);
  }
}

impl Compiler {
  fn bc_setup(&mut self, m: ModuleId) {
    let funcs: Vec<FuncId> = self.module(m).functions.clone();
    for f in funcs {
      self.func_mut(f).be = crate::FuncBackend::Bc(BcFuncData::default());
    }
    self.module_mut(m).be = crate::ModBackend::Bc(BcModData::default());
  }

  /// Reserve the object header: a link long, then one placeholder word
  /// for each method's eventual hub address plus its stack-growth word
  /// `4 * (1 + nparams + nlocals)`.
  fn bc_func_decl(&mut self, m: ModuleId) {
    let funcs: Vec<FuncId> = self.module(m).functions.clone();
    let mut mem = Vec::new();
    let mut longbuf = [0u8; 4];
    LE::write_u32(&mut longbuf, 0);
    mem.extend_from_slice(&longbuf);
    for f in funcs {
      let func = self.func(f);
      let stack_growth = 4 * (1 + func.numparams + func.numlocals) as u16;
      let mut wordbuf = [0u8; 2];
      LE::write_u16(&mut wordbuf, 0); // address, still to be determined
      mem.extend_from_slice(&wordbuf);
      LE::write_u16(&mut wordbuf, stack_growth);
      mem.extend_from_slice(&wordbuf);
    }
    if let crate::ModBackend::Bc(data) = &mut self.module_mut(m).be {
      data.mem = mem;
    }
  }

  fn bc_local_slot(&self, f: FuncId, e: AstId) -> Option<u8> {
    let name = self.ast.ident_name(e)?;
    match self.func(f).localsyms.lookup_in_scope(name) {
      Lookup::Direct(ent) if matches!(ent.kind,
        SymKind::LocalVar | SymKind::Parameter | SymKind::Result
        | SymKind::TempVar) =>
      {
        let slot = ent.offset / 4;
        if (0..8).contains(&slot) { Some(slot as u8) } else { None }
      }
      _ => None,
    }
  }

  fn bc_compile_expression(&mut self, f: FuncId, code: &mut Vec<u8>, ast: AstId) {
    let e = self.ast.uncomment(ast);
    if let Some(v) = self.try_const_val(e) {
      compile_immediate(code, v as i32);
      return;
    }
    match self.ast.kind(e) {
      AstKind::Integer | AstKind::Float => {
        let v = match self.ast.get(e).d {
          Payload::Int(v) => v as i32,
          Payload::FloatBits(b) => b as i32,
          _ => 0,
        };
        compile_immediate(code, v);
      }
      AstKind::Identifier | AstKind::LocalIdentifier => {
        match self.bc_local_slot(f, e) {
          // fast-access local: 0b011_nnn_ss with ss=0 for push
          Some(slot) => code.push(0x60 | (slot << 2)),
          None => {
            let span = self.ast.span(e);
            self.diag.error(span, DiagKind::Internal,
                            "cannot compile expression for bytecode yet");
          }
        }
      }
      _ => {
        let span = self.ast.span(e);
        self.diag.error(span, DiagKind::Internal,
                        "cannot compile expression for bytecode yet");
      }
    }
  }

  fn bc_compile_statement(&mut self, f: FuncId, code: &mut Vec<u8>, ast: AstId) {
    let stmt = self.ast.uncomment(ast);
    match self.ast.kind(stmt) {
      AstKind::StmtList => self.bc_compile_stmt_list(f, code, Some(stmt)),
      AstKind::Return => {
        match self.ast.left(stmt) {
          None => code.push(BC_RETURN_PLAIN),
          Some(val) => {
            self.bc_compile_expression(f, code, val);
            code.push(BC_RETURN_VALUE);
          }
        }
      }
      AstKind::Assign => {
        let Some(lhs) = self.ast.left(stmt) else { return };
        let Some(rhs) = self.ast.right(stmt) else { return };
        self.bc_compile_expression(f, code, rhs);
        match self.bc_local_slot(f, lhs) {
          // ss=1 is the pop-into-local form
          Some(slot) => code.push(0x61 | (slot << 2)),
          None => {
            let span = self.ast.span(stmt);
            self.diag.error(span, DiagKind::Internal,
                            "cannot compile statement for bytecode yet");
          }
        }
      }
      AstKind::LineBreak | AstKind::Comment => {}
      _ => {
        let span = self.ast.span(stmt);
        self.diag.error(span, DiagKind::Internal,
                        "cannot compile statement for bytecode yet");
      }
    }
  }

  fn bc_compile_stmt_list(&mut self, f: FuncId, code: &mut Vec<u8>, mut list: Option<AstId>) {
    while let Some(cell) = list {
      if self.ast.kind(cell) != AstKind::StmtList {
        let span = self.ast.span(cell);
        self.diag.error(span, DiagKind::Internal,
          format!("expected statement list, got {:?}", self.ast.kind(cell)));
        return;
      }
      if let Some(stmt) = self.ast.left(cell) {
        self.bc_compile_statement(f, code, stmt);
      }
      list = self.ast.right(cell);
    }
  }

  fn bc_compile_functions(&mut self, m: ModuleId) {
    let funcs: Vec<FuncId> = self.module(m).functions.clone();
    for f in funcs {
      let save = self.current_function;
      self.current_function = Some(f);
      let mut code = Vec::with_capacity(64);
      if let FuncBody::Stmts(body) = self.func(f).body {
        self.bc_compile_stmt_list(f, &mut code, Some(body));
      }
      if let crate::FuncBackend::Bc(data) = &mut self.func_mut(f).be {
        data.code = code;
      }
      self.current_function = save;
    }
  }

  fn bc_emit_dat(&mut self, m: ModuleId) {
    let mut out = DatOut::new(true);
    self.print_data_block(m, &mut out);
    if let crate::ModBackend::Bc(data) = &mut self.module_mut(m).be {
      data.data = out.data;
      data.relocs = out.relocs;
    }
  }

  /// Compile `top` and all sub-objects to P1 stack bytecode and write
  /// the image to `path`.
  pub fn output_bytecode(&mut self, path: &str, top: ModuleId) -> std::io::Result<()> {
    self.visit_recursive(top, VisitPhase::Init, &mut |c, m| c.bc_setup(m));
    self.visit_recursive(top, VisitPhase::FuncNames, &mut |c, m| c.bc_func_decl(m));
    self.visit_recursive(top, VisitPhase::CompileFuncs, &mut |c, m| c.bc_compile_functions(m));
    self.visit_recursive(top, VisitPhase::EmitDat, &mut |c, m| c.bc_emit_dat(m));
    if self.diag.errors() > 0 {
      return Ok(()); // no output past a failed phase
    }
    let mut image = Vec::new();
    self.visit_recursive(top, VisitPhase::BcOptimize, &mut |c, m| {
      if let crate::ModBackend::Bc(data) = &c.module(m).be {
        image.extend_from_slice(&data.mem);
        image.extend_from_slice(&data.data);
      }
      for &f in &c.module(m).functions {
        if let crate::FuncBackend::Bc(data) = &c.func(f).be {
          image.extend_from_slice(&data.code);
        }
      }
    });
    std::fs::write(path, image)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options, Language, Target};
  use crate::types::entity::SymVal;

  #[test]
  fn dedicated_one_byte_immediates() {
    for (v, want) in [(0, vec![0x35u8]), (1, vec![0x36]), (-1, vec![0x34])] {
      let mut code = Vec::new();
      compile_immediate(&mut code, v);
      assert_eq!(code, want, "immediate {v} gets the one-byte form");
    }
  }

  #[test]
  fn byte_pot_and_raw_forms() {
    let mut code = Vec::new();
    compile_immediate(&mut code, 0x47);
    assert_eq!(code, vec![BC_PUSH_BYTE, 0x47]);

    code.clear();
    compile_immediate(&mut code, 0x1_0000); // 2^16 = 2<<15
    assert_eq!(code, vec![BC_PUSH_POT, 15]);

    code.clear();
    compile_immediate(&mut code, -72); // !0x47
    assert_eq!(code, vec![BC_PUSH_BYTE, 0x47, BC_BIT_NOT]);

    code.clear();
    compile_immediate(&mut code, 0x1234);
    assert_eq!(code, vec![BC_PUSH_WORD, 0x12, 0x34]);

    code.clear();
    compile_immediate(&mut code, 0x123456);
    assert_eq!(code, vec![BC_PUSH_3BYTES, 0x12, 0x34, 0x56]);

    code.clear();
    compile_immediate(&mut code, 0x1234_5678);
    assert_eq!(code, vec![BC_PUSH_LONG, 0x12, 0x34, 0x56, 0x78]);
  }

  #[test]
  fn pot_tags() {
    assert_eq!(pow_of_two_encoding(2), Some(0));
    assert_eq!(pow_of_two_encoding(256), Some(7));
    assert_eq!(pow_of_two_encoding(255), Some(7 | 0x20));
    assert_eq!(pow_of_two_encoding(-256), Some(7 | 0x60));
    assert_eq!(pow_of_two_encoding(100), None);
  }

  #[test]
  fn stack_growth_words() {
    let mut opts = Options::default();
    opts.target = Target::P1;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("t.spin", Language::Spin1);
    // a function with 2 params and 1 local
    let name = c.ast.identifier("go");
    let decl = c.ast.new_node(crate::types::ast::AstKind::FuncDecl, Some(name), None);
    let mk_list = |c: &mut Compiler, names: &[&str]| {
      let mut list = None;
      for n in names {
        let id = c.ast.identifier(n);
        let cell = c.ast.new_node(crate::types::ast::AstKind::ListHolder, Some(id), None);
        list = Some(c.ast.list_append(list, cell));
      }
      list
    };
    let params = mk_list(&mut c, &["a", "b"]);
    let locals = mk_list(&mut c, &["x"]);
    let vars = c.ast.new_node(crate::types::ast::AstKind::FuncVars, params, locals);
    let fdef = c.ast.new_node(crate::types::ast::AstKind::FuncDef, Some(decl), Some(vars));
    let body = c.ast.new_node(crate::types::ast::AstKind::StmtList, None, None);
    c.declare_function(m, None, true, fdef, Some(body), None, None);
    c.bc_setup(m);
    c.bc_func_decl(m);
    let crate::ModBackend::Bc(data) = &c.module(m).be else { panic!("bc data") };
    // link long + addr word + stack word
    assert_eq!(data.mem.len(), 8);
    let stack = u16::from_le_bytes(data.mem[6..8].try_into().unwrap());
    assert_eq!(stack, 4 * (1 + 2 + 1));
  }

  #[test]
  fn return_expression_compiles() {
    let mut opts = Options::default();
    opts.target = Target::P1;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("t.spin", Language::Spin1);
    let name = c.ast.identifier("f");
    let decl = c.ast.new_node(crate::types::ast::AstKind::FuncDecl, Some(name), None);
    let fdef = c.ast.new_node(crate::types::ast::AstKind::FuncDef, Some(decl), None);
    let five = c.ast.integer(5);
    let ret = c.ast.new_node(crate::types::ast::AstKind::Return, Some(five), None);
    let body = c.ast.new_node(crate::types::ast::AstKind::StmtList, Some(ret), None);
    let f = c.declare_function(m, None, true, fdef, Some(body), None, None);
    c.bc_setup(m);
    c.bc_compile_functions(m);
    let crate::FuncBackend::Bc(data) = &c.func(f).be else { panic!("bc data") };
    assert_eq!(data.code, vec![BC_PUSH_BYTE, 5, BC_RETURN_VALUE]);
    assert_eq!(c.diag.errors(), 0);
  }

  #[test]
  fn local_assignment_uses_fast_ops() {
    let mut opts = Options::default();
    opts.target = Target::P1;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("t.spin", Language::Spin1);
    let name = c.ast.identifier("f");
    let decl = c.ast.new_node(crate::types::ast::AstKind::FuncDecl, Some(name), None);
    let fdef = c.ast.new_node(crate::types::ast::AstKind::FuncDef, Some(decl), None);
    let x = c.ast.identifier("x");
    let two = c.ast.integer(2);
    let assign = c.ast.assign(x, two);
    let body0 = c.ast.new_node(crate::types::ast::AstKind::StmtList, Some(assign), None);
    let f = c.declare_function(m, None, true, fdef, Some(body0), None, None);
    // register the local by hand (normally the front end does this)
    let xs = crate::symbol::intern("x");
    let t = c.long_type(false);
    let e = c.funcs[f.idx()].localsyms
      .add(xs, SymKind::LocalVar, SymVal::Ast(t)).unwrap();
    e.offset = 4; // slot 1
    c.bc_setup(m);
    c.bc_compile_functions(m);
    let crate::FuncBackend::Bc(data) = &c.func(f).be else { panic!("bc data") };
    assert_eq!(data.code, vec![BC_PUSH_BYTE, 2, 0x61 | (1 << 2)]);
  }

  #[test]
  fn unsupported_statement_reports() {
    let mut opts = Options::default();
    opts.target = Target::P1;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("t.spin", Language::Spin1);
    let name = c.ast.identifier("f");
    let decl = c.ast.new_node(crate::types::ast::AstKind::FuncDecl, Some(name), None);
    let fdef = c.ast.new_node(crate::types::ast::AstKind::FuncDef, Some(decl), None);
    let w = c.ast.new_node(crate::types::ast::AstKind::While, None, None);
    let body = c.ast.new_node(crate::types::ast::AstKind::StmtList, Some(w), None);
    c.declare_function(m, None, true, fdef, Some(body), None, None);
    c.bc_setup(m);
    c.bc_compile_functions(m);
    assert_eq!(c.diag.errors(), 1);
  }
}
