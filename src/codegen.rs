//! Final image assembly and the post-process pipeline: the P1 Spin
//! header/launcher pair, padding, size checks against the target's
//! memory, the debugger prepend, optional compression, the P1 checksum
//! byte, and EEPROM padding with the end-of-program sentinel.

use std::io::{self, Read, Seek, SeekFrom, Write};
use byteorder::{ByteOrder, LE};
use crate::{Compiler, ModuleId, LONG_SIZE};
use crate::dat::DatOut;
use crate::diag::DiagKind;
use crate::symbol::intern;
use crate::types::SrcSpan;
use crate::types::entity::{Lookup, SymKind, SymVal};

/// P1 binary images balance their byte sum to this value.
const P1_CHECKSUM_TARGET: u8 = 0x14;
/// The 8-byte Spin launcher: `coginit(0, @dat, 0)` then return.
const P1_LAUNCHER: [u8; 8] = [0x35, 0xc7, 0x08, 0x35, 0x2c, 0x32, 0x00, 0x00];
/// End-of-program sentinel injected before EEPROM padding on P1.
const P1_EEPROM_SENTINEL: [u8; 8] = [0xff, 0xff, 0xf9, 0xff, 0xff, 0xff, 0xf9, 0xff];

impl Compiler {
  /// The 20-byte P1 Spin binary header. The base pointers are fixed up
  /// by [`Compiler::spin_dummy_footer`] once the image length is known.
  fn spin_dummy_header(&mut self, out: &mut DatOut, module: ModuleId) {
    let (clkfreq, clkmode) = self.get_clk_freq(module)
      .unwrap_or((80_000_000, 0x6f));
    out.put_long(clkfreq);        // offset 0
    out.put_byte(clkmode as u8);  // offset 4
    out.put_byte(0);              // offset 5: checksum, patched later
    out.put_word(0x0010);         // PBASE
    out.put_word(0x7fe8);         // VBASE, fixed up
    out.put_word(0x7ff0);         // DBASE, fixed up
    out.put_word(0x0018);         // PCURR, fixed up
    out.put_word(0x7ff8);         // DCURR, fixed up
    out.put_word(0x0008);         // object length, fixed up
    out.put_byte(0x02);
    out.put_byte(0x00);
  }

  fn placeword(&mut self, image: &mut [u8], off: usize, value: u32, warned: &mut bool) {
    if value > 0xffff && !*warned {
      self.diag.warning(SrcSpan::none(), DiagKind::Resource,
                        "Program size exceeds legal Spin values");
      *warned = true;
    }
    LE::write_u16(&mut image[off..off + 2], value as u16);
  }

  /// Append the launcher program and fix up the header now that the
  /// code length is known.
  fn spin_dummy_footer(&mut self, out: &mut DatOut) {
    while out.data.len() % 4 != 0 { out.put_byte(0) }
    let curlen = out.data.len() as u32;
    for b in P1_LAUNCHER { out.put_byte(b) }
    let mut warned = false;
    let mut image = std::mem::take(&mut out.data);
    self.placeword(&mut image, 8, curlen + 8, &mut warned);   // VBASE: end of program
    self.placeword(&mut image, 10, curlen + 16, &mut warned); // DBASE: after stack
    self.placeword(&mut image, 12, curlen, &mut warned);      // PCURR: entry point
    self.placeword(&mut image, 14, curlen + 20, &mut warned); // DCURR
    self.placeword(&mut image, 16, curlen - 8, &mut warned);
    out.data = image;
  }

  /// Write the DAT image for `module`; on P1 with `prefix_bin` the Spin
  /// header and launcher wrap it into a runnable binary.
  pub fn output_dat_file(&mut self, path: &str, module: ModuleId,
                         prefix_bin: bool) -> io::Result<()> {
    let save = self.options.no_spin;
    self.options.no_spin = true; // only the DAT section is emitted
    let mut out = DatOut::new(false);
    if prefix_bin && !self.options.target.is_p2() {
      self.spin_dummy_header(&mut out, module);
    }
    self.declare_labels(module);
    self.print_data_block(module, &mut out);
    if prefix_bin && !self.options.target.is_p2() {
      self.spin_dummy_footer(&mut out);
    }
    self.options.no_spin = save;
    if self.diag.errors() > 0 {
      return Ok(()); // no output files past a failed phase
    }
    let mut data = out.data;
    if !self.options.target.is_p2() {
      // P1 rounds to a long boundary; P2 does not round (current PNut
      // behaviour; the historical 32-byte round-up is gone)
      while data.len() % 4 != 0 { data.push(0) }
    }
    std::fs::write(path, data)
  }

  /// Reserved footprint from the top module's `_STACK`/`_FREE`
  /// constants, always looked up case-insensitively.
  fn stack_free_reserve(&self) -> u32 {
    let Some(top) = self.top_module else { return 0 };
    let mut reserve = 0i64;
    for name in ["_stack", "_free"] {
      // fold by hand so a case-sensitive module still matches _STACK
      for probe in [name.to_owned(), name.to_ascii_uppercase()] {
        if let Lookup::Direct(e) = self.module(top).objsyms.lookup_in_scope(intern(&probe)) {
          if e.kind == SymKind::Constant {
            if let SymVal::Ast(v) = e.val {
              reserve += i64::from(LONG_SIZE) * self.try_const_val(v).unwrap_or(0);
              break;
            }
          }
        }
      }
    }
    reserve as u32
  }

  /// Post-process an on-disk image: pad, check size limits, prepend the
  /// debugger, compress, balance the P1 checksum, and pad out to an
  /// EEPROM with the end sentinel.
  pub fn do_propeller_postprocess(&mut self, path: &str,
                                  eeprom_size: usize) -> io::Result<()> {
    let mut f = std::fs::OpenOptions::new().read(true).write(true).open(path)?;
    let mut image = Vec::new();
    f.read_to_end(&mut image)?;
    let mut len = image.len();

    // pad to a long boundary (P1 only)
    if !self.options.target.is_p2() {
      while len % 4 != 0 {
        image.push(0);
        len += 1;
      }
    }

    let reserve = self.stack_free_reserve() as usize;
    let maxlen = if eeprom_size != 0 {
      eeprom_size
    } else if self.options.target.is_p2() {
      let mut m = 512 * 1024;
      if self.options.brkdebug { m -= 16 * 1024 }
      m
    } else {
      32 * 1024
    };
    if len + reserve > maxlen {
      let msg = if reserve != 0 {
        format!("final output size of {len} bytes + {reserve} reserved bytes \
                 exceeds maximum of {maxlen} by {} bytes", len + reserve - maxlen)
      } else {
        format!("final output size of {len} bytes exceeds maximum of {maxlen} \
                 by {} bytes", len - maxlen)
      };
      self.diag.warning(SrcSpan::none(), DiagKind::Resource, msg);
    }

    if self.options.brkdebug {
      let blob = self.compile_brk_debugger(len);
      let extra = blob.len();
      let mut with_debugger = blob;
      with_debugger.extend_from_slice(&image);
      image = with_debugger;
      if len + extra > maxlen {
        self.diag.warning(SrcSpan::none(), DiagKind::Resource,
          format!("output size with debugger ({len} + {extra} = {}) exceeds \
                   maximum of {maxlen} by {} bytes",
                  len + extra, len + extra - maxlen));
      }
      len += extra;
    }

    if self.options.compress_output {
      image = self.compress_executable(&image);
      len = image.len();
    }

    // P1 carries a checksum at byte 5; P2 has none
    if !self.options.target.is_p2() && image.len() > 5 {
      image[5] = 0;
      let sum: u8 = image.iter().fold(0u8, |a, &b| a.wrapping_add(b));
      image[5] = P1_CHECKSUM_TARGET.wrapping_sub(sum);
    }

    if eeprom_size != 0 && eeprom_size >= len + 8 {
      if !self.options.target.is_p2() {
        image.extend_from_slice(&P1_EEPROM_SENTINEL);
        len += 8;
      }
      while len < eeprom_size {
        image.push(0);
        len += 1;
      }
    }

    f.seek(SeekFrom::Start(0))?;
    f.set_len(0)?;
    f.write_all(&image)?;
    Ok(())
  }

  /// Write the module's DAT section as PASM source text (the optimised
  /// assembly output path).
  pub fn output_asm_code(&mut self, path: &str, module: ModuleId,
                         print_main: bool) -> io::Result<()> {
    use std::fmt::Write as _;
    let mut out = String::new();
    if print_main {
      let _ = writeln!(out, "' generated main entry for {}",
                       self.module(module).classname);
    }
    let _ = writeln!(out, "DAT");
    self.declare_labels(module);
    let mut body = DatOut::new(true);
    self.print_data_block(module, &mut body);
    if self.diag.errors() > 0 { return Ok(()) }
    // data plus interleaved source markers from the debug entries
    let mut reloc_ix = 0;
    for (i, chunk) in body.data.chunks(4).enumerate() {
      let addr = (i * 4) as u32;
      while reloc_ix < body.relocs.len() && body.relocs[reloc_ix].addr <= addr {
        if let Some(span) = body.relocs[reloc_ix].span {
          let _ = writeln!(out, "' {span}");
        }
        reloc_ix += 1;
      }
      let _ = write!(out, "\tbyte\t");
      let bytes: Vec<String> = chunk.iter().map(|b| format!("${b:02x}")).collect();
      let _ = writeln!(out, "{}", bytes.join(", "));
    }
    std::fs::write(path, out)
  }
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options, Language, Target};
  use tempfile::NamedTempFile;

  fn p1_session() -> Compiler {
    let mut opts = Options::default();
    opts.target = Target::P1;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    c
  }

  #[test]
  fn empty_p1_binary_is_28_bytes() {
    let mut c = p1_session();
    let m = c.new_module("top.spin", Language::Spin1);
    c.top_module = Some(m);
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_str().unwrap().to_owned();
    c.output_dat_file(&path, m, true).unwrap();
    let image = std::fs::read(&path).unwrap();
    assert_eq!(image.len(), 28, "20-byte header + 8-byte launcher");
    // defaults when no clock constants are given
    assert_eq!(&image[0..4], &80_000_000u32.to_le_bytes());
    assert_eq!(image[4], 0x6f);
    // PCURR points at the launcher
    assert_eq!(u16::from_le_bytes(image[12..14].try_into().unwrap()), 20);
    assert_eq!(&image[20..28], &super::P1_LAUNCHER);

    // post-process balances the checksum
    c.do_propeller_postprocess(&path, 0).unwrap();
    let image = std::fs::read(&path).unwrap();
    let sum: u8 = image.iter().fold(0u8, |a, &b| a.wrapping_add(b));
    assert_eq!(sum, super::P1_CHECKSUM_TARGET);
  }

  #[test]
  fn empty_p2_image_is_empty() {
    let mut opts = Options::default();
    opts.target = Target::P2RevB;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("top.spin2", Language::Spin2);
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_str().unwrap().to_owned();
    c.output_dat_file(&path, m, true).unwrap();
    assert_eq!(std::fs::read(&path).unwrap().len(), 0);
  }

  #[test]
  fn size_limit_warning_and_stack_reserve() {
    let mut c = p1_session();
    let m = c.new_module("top.spin", Language::Spin1);
    c.top_module = Some(m);
    // reserve enough longs that a small image overflows 32K
    let ident = c.ast.identifier("_STACK");
    let val = c.ast.integer(9000);
    let assign = c.ast.assign(ident, val);
    let holder = c.ast.new_node(crate::types::ast::AstKind::ListHolder, Some(assign), None);
    c.declare_constants(m, holder);

    let tmp = NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), vec![0u8; 8]).unwrap();
    let path = tmp.path().to_str().unwrap().to_owned();
    c.do_propeller_postprocess(&path, 0).unwrap();
    assert_eq!(c.diag.warnings(), 1, "8 + 36000 reserved > 32768");
  }

  #[test]
  fn exactly_32k_is_fine() {
    let mut c = p1_session();
    let m = c.new_module("top.spin", Language::Spin1);
    c.top_module = Some(m);
    let tmp = NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), vec![0u8; 32 * 1024]).unwrap();
    let path = tmp.path().to_str().unwrap().to_owned();
    c.do_propeller_postprocess(&path, 0).unwrap();
    assert_eq!(c.diag.warnings(), 0);
    // one more byte warns
    std::fs::write(tmp.path(), vec![0u8; 32 * 1024 + 1]).unwrap();
    c.do_propeller_postprocess(&path, 0).unwrap();
    assert!(c.diag.warnings() >= 1);
  }

  #[test]
  fn eeprom_tail_has_sentinel() {
    let mut c = p1_session();
    let m = c.new_module("top.spin", Language::Spin1);
    c.top_module = Some(m);
    let tmp = NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), vec![0x11u8; 16]).unwrap();
    let path = tmp.path().to_str().unwrap().to_owned();
    c.do_propeller_postprocess(&path, 1024).unwrap();
    let image = std::fs::read(&path).unwrap();
    assert_eq!(image.len(), 1024);
    assert_eq!(&image[16..24], &super::P1_EEPROM_SENTINEL);
    assert!(image[24..].iter().all(|&b| b == 0));
  }

  #[test]
  fn debugger_prepend_grows_image() {
    let mut opts = Options::default();
    opts.target = Target::P2RevB;
    opts.brkdebug = true;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let m = c.new_module("top.spin2", Language::Spin2);
    c.top_module = Some(m);
    let tmp = NamedTempFile::new().unwrap();
    std::fs::write(tmp.path(), vec![0x22u8; 64]).unwrap();
    let path = tmp.path().to_str().unwrap().to_owned();
    c.do_propeller_postprocess(&path, 0).unwrap();
    let image = std::fs::read(&path).unwrap();
    let stub_len = include_bytes!("sys/p2_brkdebug.dat").len();
    assert!(image.len() > 64 + stub_len);
    // the application size is patched into the stub
    assert_eq!(&image[0x0e4..0x0e8], &64u32.to_le_bytes());
    // the original image follows the blob
    assert_eq!(&image[image.len() - 64..], &vec![0x22u8; 64][..]);
  }
}
