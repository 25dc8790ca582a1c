//! End-to-end pipeline scenarios: parser-shaped ASTs in, artifacts out.

use flexcore::{Compiler, Language, Options, Output, Target};
use flexcore::types::AstId;
use flexcore::types::ast::{AstKind, Op};
use flexcore::types::ModuleId;

fn dat_cell(c: &mut Compiler, node: AstId) -> AstId {
  c.ast.new_node(AstKind::ListHolder, Some(node), None)
}

fn append_dat(c: &mut Compiler, m: ModuleId, node: AstId) {
  let cell = dat_cell(c, node);
  let old = c.module(m).datblock;
  let list = c.ast.list_append(old, cell);
  c.module_mut(m).datblock = Some(list);
}

fn p2_session() -> Compiler {
  let mut c = Compiler::new(Options::default());
  c.diag.capture();
  c
}

#[test]
fn dat_with_reloc_and_binary_round_trip() {
  // DAT  foo long 1   bar long @@@foo
  // the @@@ operand needs a load-time fixup against the DAT base
  let mut c = p2_session();
  let m = c.new_module("reloc.spin2", Language::Spin2);
  c.current_module = Some(m);
  let foo = c.ast.identifier("foo");
  append_dat(&mut c, m, foo);
  let one = c.ast.integer(1);
  let e1 = c.ast.expr_item(one);
  let l1 = c.ast.new_node(AstKind::LongList, Some(e1), None);
  append_dat(&mut c, m, l1);
  let bar = c.ast.identifier("bar");
  append_dat(&mut c, m, bar);
  let fooref = c.ast.identifier("foo");
  let aaa = c.ast.new_node(AstKind::DatAddrOf, Some(fooref), None);
  let e2 = c.ast.expr_item(aaa);
  let l2 = c.ast.new_node(AstKind::LongList, Some(e2), None);
  append_dat(&mut c, m, l2);

  c.declare_labels(m);
  let mut out = flexcore::dat::DatOut::new(true);
  c.print_data_block(m, &mut out);
  assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
  assert_eq!(out.data.len(), 8);
  assert_eq!(out.relocs.len(), 1);
  assert_eq!(out.relocs[0].addr, 4);
  assert_eq!(out.relocs[0].kind, flexcore::dat::RelocKind::I32);
  // every relocation falls inside the block, sorted by address
  assert!(out.relocs.iter().all(|r| (r.addr as usize) < out.data.len()));
  assert!(out.relocs.windows(2).all(|w| w[0].addr <= w[1].addr));
}

#[test]
fn p2_overlong_branch_promotes_to_indirect() {
  // jmp #target with a displacement far beyond the 20-bit relative
  // range: the encoder falls back to the absolute form, no error
  let mut c = p2_session();
  let m = c.new_module("far.spin2", Language::Spin2);
  c.current_module = Some(m);
  let ix = flexcore::instr::find_instruction(Target::P2RevB, "jmp").unwrap();
  let inode = c.ast.new_with(AstKind::Instr,
    flexcore::types::ast::Payload::Instr(ix), None, None);
  let target = c.ast.integer(0x80000);
  let imm = c.ast.new_node(AstKind::ImmHolder, Some(target), None);
  let opcell = c.ast.new_node(AstKind::ExprList, Some(imm), None);
  c.ast.get_mut(inode).right = Some(opcell);
  // hub instruction at pc 0
  let holder = c.ast.new_with(AstKind::InstrHolder,
    flexcore::types::ast::Payload::Int(0), Some(inode), None);
  let mut out = flexcore::dat::DatOut::new(true);
  c.assemble_instruction(&mut out, holder);
  assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
  assert_eq!(out.data.len(), 4);
  let word = u32::from_le_bytes(out.data[..4].try_into().unwrap());
  // absolute: the R bit stays clear and the 20-bit field holds the target
  assert_eq!(word & (1 << 20), 0);
  assert_eq!(word & 0xfffff, 0x80000);
}

#[test]
fn nu_pipeline_packs_single_function() {
  // a small method carried all the way through packing: main() : r | x
  let mut c = p2_session();
  let m = c.new_module("main.spin2", Language::Spin2);
  c.top_module = Some(m);
  c.current_module = Some(m);

  let name = c.ast.identifier("main");
  let r = c.ast.identifier("r");
  let decl = c.ast.new_node(AstKind::FuncDecl, Some(name), Some(r));
  let x = c.ast.identifier("x");
  let lcell = c.ast.new_node(AstKind::ListHolder, Some(x), None);
  let vars = c.ast.new_node(AstKind::FuncVars, None, Some(lcell));
  let fdef = c.ast.new_node(AstKind::FuncDef, Some(decl), Some(vars));

  let x1 = c.ast.identifier("x");
  let two = c.ast.integer(2);
  let three = c.ast.integer(3);
  let sum = c.ast.operator(Op::Add, Some(two), Some(three));
  let a1 = c.ast.assign(x1, sum);
  let x2 = c.ast.identifier("x");
  let x3 = c.ast.identifier("x");
  let prod = c.ast.operator(Op::Mul, Some(x2), Some(x3));
  let r2 = c.ast.identifier("r");
  let a2 = c.ast.assign(r2, prod);
  let s2 = c.ast.new_node(AstKind::StmtList, Some(a2), None);
  let s1 = c.ast.new_node(AstKind::StmtList, Some(a1), Some(s2));

  let f = c.declare_function(m, None, true, fdef, Some(s1), None, None);
  c.nu_assign_frame_offsets(f);
  c.current_function = Some(f);
  c.check_types(s1);
  c.current_function = None;
  assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());

  let mut labels = c.nu_compile_program(m);
  // optimise, then pack and emit
  if let flexcore::FuncBackend::Nu(data) = &mut c.funcs[f.idx()].be {
    let mut irl = std::mem::take(&mut data.irl);
    c.nu_optimize(&mut irl, &mut labels);
    if let flexcore::FuncBackend::Nu(data) = &mut c.funcs[f.idx()].be {
      data.irl = irl;
    }
  }
  let text = c.pack_and_emit(m, &mut labels);
  assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
  assert!(text.contains("OPC_TABLE"), "dispatch table emitted");
  assert!(text.contains("' function main"));
  assert!(text.contains("NU_OP_MULS"), "multiply survives to the bytecode");
}

#[test]
fn output_nu_code_writes_file() {
  let mut c = p2_session();
  let m = c.new_module("app.spin2", Language::Spin2);
  c.top_module = Some(m);
  c.current_module = Some(m);
  let ident = c.ast.identifier("_clkfreq");
  let freq = c.ast.integer(160_000_000);
  let assign = c.ast.assign(ident, freq);
  let cell = c.ast.new_node(AstKind::ListHolder, Some(assign), None);
  c.declare_constants(m, cell);

  let name = c.ast.identifier("main");
  let decl = c.ast.new_node(AstKind::FuncDecl, Some(name), None);
  let fdef = c.ast.new_node(AstKind::FuncDef, Some(decl), None);
  let body = c.ast.new_node(AstKind::StmtList, None, None);
  c.declare_function(m, None, true, fdef, Some(body), None, None);

  let tmp = tempfile::NamedTempFile::new().unwrap();
  let path = tmp.path().to_str().unwrap().to_owned();
  c.output_nu_code(&path, m).unwrap();
  let text = std::fs::read_to_string(&path).unwrap();
  assert!(text.contains("_clkfreq = 160000000"));
  assert!(text.contains("OPC_TABLE_END"));
}

#[test]
fn bytecode_output_respects_error_gate() {
  // a function the stack backend cannot compile: the output file stays
  // untouched past the failed phase
  let mut opts = Options::default();
  opts.target = Target::P1;
  opts.output = Output::Bytecode;
  let mut c = Compiler::new(opts);
  c.diag.capture();
  let m = c.new_module("bad.spin", Language::Spin1);
  let name = c.ast.identifier("f");
  let decl = c.ast.new_node(AstKind::FuncDecl, Some(name), None);
  let fdef = c.ast.new_node(AstKind::FuncDef, Some(decl), None);
  let w = c.ast.new_node(AstKind::While, None, None);
  let body = c.ast.new_node(AstKind::StmtList, Some(w), None);
  c.declare_function(m, None, true, fdef, Some(body), None, None);

  let tmp = tempfile::NamedTempFile::new().unwrap();
  std::fs::write(tmp.path(), b"sentinel").unwrap();
  let path = tmp.path().to_str().unwrap().to_owned();
  c.output_bytecode(&path, m).unwrap();
  assert!(c.diag.errors() > 0);
  assert_eq!(std::fs::read(&path).unwrap(), b"sentinel",
             "no output files written past the phase that failed");
}

#[test]
fn interface_conversion_materialises_skeleton() {
  // converting Dog to the Animal interface synthesises a
  // per-(class, interface) skeleton in Dog's DAT section
  let mut c = p2_session();
  let animal = c.new_module("animal.spin2", Language::Spin2);
  c.module_mut(animal).is_interface = true;
  let dog = c.new_module("dog.spin2", Language::Spin2);

  let mk_fn = |c: &mut Compiler, m: ModuleId, name: &str, has_body: bool| {
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

  c.current_module = Some(dog);
  let iface_ty = c.object_type(animal);
  let class_ty = c.object_type(dog);
  let mydog = c.ast.identifier("mydog");
  let inst = c.ast.new_node(AstKind::AbsAddrOf, Some(mydog), None);
  let call = c.convert_interface(iface_ty, class_ty, inst).unwrap();
  assert_eq!(c.diag.errors(), 0, "{:?}", c.diag.captured());
  assert_eq!(c.ast.kind(call), AstKind::FuncCall);
  let callee = c.ast.left(call).unwrap();
  assert_eq!(c.ast.ident_name(callee),
             Some(flexcore::symbol::intern("make_interfaceptrs")));
  let args: Vec<_> = c.ast.list_iter(c.ast.right(call)).collect();
  assert_eq!(args.len(), 3);
  assert_eq!(c.try_const_val(args[2]), Some(1), "one interface method");
  // the skeleton landed in Dog's DAT block and counts as a method
  // pointer use, so DCE must keep the implementation
  assert!(c.module(dog).datblock.is_some());
  assert!(c.func(dog_speak).method_ptr_uses > 0);
}
