//! Clock and boot configuration. The top-level module's `_CLKMODE`,
//! `_CLKFREQ`, `_XTLFREQ`, `_XINFREQ` and `_ERRFREQ` constants are
//! resolved into the internal `__clkfreq_con` / `__clkmode_con` /
//! `__clkreg_con` constants, injected into both the top module and the
//! system module so downstream code can refer to them.

use log::debug;
use crate::{Compiler, ModuleId, Target};
use crate::diag::DiagKind;
use crate::types::SrcSpan;
use crate::types::entity::{Lookup, SymKind, SymVal};
use crate::symbol::intern;

// standard Spin P1 clock-mode flag constants
pub const RCFAST: i64 = 0x0001;
pub const RCSLOW: i64 = 0x0002;
pub const XINPUT: i64 = 0x0004;
pub const XTAL1: i64 = 0x0008;
pub const XTAL2: i64 = 0x0010;
pub const XTAL3: i64 = 0x0020;
pub const PLL1X: i64 = 0x0040;
pub const PLL2X: i64 = 0x0080;
pub const PLL4X: i64 = 0x0100;
pub const PLL8X: i64 = 0x0200;
pub const PLL16X: i64 = 0x0400;

impl Compiler {
  fn module_const(&self, m: ModuleId, name: &str) -> Option<i64> {
    match self.module(m).objsyms.lookup_in_scope(intern(name)) {
      Lookup::Direct(e) if e.kind == SymKind::Constant => match e.val {
        SymVal::Ast(v) => self.try_const_val(v),
        _ => None,
      },
      _ => None,
    }
  }

  fn set_clock_symbols(&mut self, m: ModuleId, freq: i64, mode: i64, reg: i64) {
    self.add_internal_symbol(m, "__clkfreq_con", freq);
    self.add_internal_symbol(m, "__clkmode_con", mode);
    self.add_internal_symbol(m, "__clkreg_con", reg);
    let q = self.system_module;
    if !self.module(q).objsyms.contains(intern("__clkfreq_con")) {
      self.add_internal_symbol(q, "__clkfreq_con", freq);
      self.add_internal_symbol(q, "__clkmode_con", mode);
      self.add_internal_symbol(q, "__clkreg_con", reg);
    }
  }

  /// Resolve clock settings for module `m`. Returns false when the
  /// module carries no (or inconsistent) clock constants.
  pub fn calc_clk_freq(&mut self, m: ModuleId) -> bool {
    if self.options.target.is_p2() {
      self.calc_clk_freq_p2(m)
    } else {
      self.calc_clk_freq_p1(m)
    }
  }

  fn calc_clk_freq_p1(&mut self, m: ModuleId) -> bool {
    let Some(clkmode) = self.module_const(m, "_clkmode") else { return false };
    let mut clkfreq = self.module_const(m, "_clkfreq").unwrap_or(0);
    let xinfreq = self.module_const(m, "_xinfreq").unwrap_or(0);

    let mut clkreg: i64 = 0;
    let mut multiplier: i64 = 1;
    if clkmode & RCFAST != 0 {
      // power-on default, register stays 0
    } else if clkmode & RCSLOW != 0 {
      clkreg |= 0x01; // CLKSELx
    } else if clkmode & XINPUT != 0 {
      clkreg |= 1 << 5; // OSCENA
      clkreg |= 0x02;   // CLKSELx
    } else {
      clkreg |= 1 << 5; // OSCENA
      clkreg |= 1 << 6; // PLLENA
      if clkmode & XTAL1 != 0 {
        clkreg |= 1 << 3;
      } else if clkmode & XTAL2 != 0 {
        clkreg |= 2 << 3;
      } else {
        clkreg |= 3 << 3;
      }
      if clkmode & PLL1X != 0 {
        multiplier = 1; clkreg |= 0x3;
      } else if clkmode & PLL2X != 0 {
        multiplier = 2; clkreg |= 0x4;
      } else if clkmode & PLL4X != 0 {
        multiplier = 4; clkreg |= 0x5;
      } else if clkmode & PLL8X != 0 {
        multiplier = 8; clkreg |= 0x6;
      } else if clkmode & PLL16X != 0 {
        multiplier = 16; clkreg |= 0x7;
      }
    }

    if xinfreq == 0 {
      if clkfreq == 0 {
        self.diag.error(SrcSpan::none(), DiagKind::Layout,
                        "Must set at least one of _XINFREQ or _CLKFREQ");
        return false;
      }
    } else {
      let calcfreq = xinfreq * multiplier;
      if clkfreq != 0 && calcfreq != clkfreq {
        self.diag.error(SrcSpan::none(), DiagKind::Layout,
                        "Inconsistent values for _XINFREQ and _CLKFREQ");
        return false;
      }
      clkfreq = calcfreq;
    }

    self.set_clock_symbols(m, clkfreq, clkmode, clkreg);
    true
  }

  fn calc_clk_freq_p2(&mut self, m: ModuleId) -> bool {
    let clkmodesym = self.module_const(m, "_clkmode");
    let clkfreqsym = self.module_const(m, "_clkfreq");
    let xtlfreqsym = self.module_const(m, "_xtlfreq");
    let xinfreqsym = self.module_const(m, "_xinfreq");
    let errfreqsym = self.module_const(m, "_errfreq");

    let mut clkfreq: f64 = if matches!(self.module(m).language,
                                       crate::Language::Spin1 | crate::Language::Spin2) {
      20_000_000.0 // RCFAST
    } else {
      160_000_000.0
    };
    let mut xinfreq: f64 = 20_000_000.0; // default crystal frequency
    let mut zzzz: i64 = 11; // 0b10_11

    if xinfreqsym.is_some() || self.options.default_xinfreq != 0 {
      if xtlfreqsym.is_some() || self.options.default_xtlfreq != 0 {
        self.diag.error(SrcSpan::none(), DiagKind::Layout,
                        "Only one of _xtlfreq or _xinfreq may be specified");
        return false;
      }
      xinfreq = if self.options.default_xinfreq != 0 {
        f64::from(self.options.default_xinfreq)
      } else {
        xinfreqsym.unwrap_or(0) as f64
      };
      clkfreq = xinfreq;
      zzzz = 7; // 0b01_11
    } else if xtlfreqsym.is_some() || self.options.default_xtlfreq != 0 {
      xinfreq = if self.options.default_xtlfreq != 0 {
        f64::from(self.options.default_xtlfreq)
      } else {
        xtlfreqsym.unwrap_or(0) as f64
      };
      clkfreq = xinfreq;
      zzzz = if xinfreq >= 16_000_000.0 { 11 } else { 15 };
    }

    if let Some(mode) = clkmodesym {
      let Some(freq) = clkfreqsym else {
        self.diag.error(SrcSpan::none(), DiagKind::Layout,
                        "_clkmode definition requires _clkfreq as well");
        return false;
      };
      self.set_clock_symbols(m, freq, mode, mode);
      return true;
    }
    if let Some(freq) = clkfreqsym {
      clkfreq = freq as f64;
    }
    let errtolerance = errfreqsym.map_or(100_000.0, |e| e as f64);

    // search (PPPP, divd, mult) triples; the scan order is the
    // tie-break, so regenerated binaries stay bit-identical
    let mut error = 1e9;
    let mut result_mult = 0.0;
    let mut result_fout = 0.0;
    let mut result_pppp: i64 = 0;
    let mut result_divd: i64 = 0;
    for pppp in 0..=15i64 {
      let post = if pppp == 0 { 1.0 } else { pppp as f64 * 2.0 };
      for divd in (1..=64i64).rev() {
        let fpfd = (xinfreq / divd as f64).round();
        let mult = (clkfreq * (post * divd as f64) / xinfreq).round();
        let fvco = (xinfreq * mult / divd as f64).round();
        let fout = (fvco / post).round();
        let e = (fout - clkfreq).abs();
        if e <= error && fpfd >= 250_000.0 && mult <= 1024.0
          && fvco > 99e6 && (fvco <= 201e6 || fvco <= clkfreq + 1e6)
        {
          result_divd = divd;
          result_mult = mult;
          result_pppp = (pppp - 1) & 15;
          result_fout = fout;
          error = e;
        }
      }
    }
    if error > errtolerance {
      self.diag.error(SrcSpan::none(), DiagKind::Layout,
        format!("Unable to find clock settings for freq {clkfreq} Hz with input freq {xinfreq} Hz"));
      return false;
    }
    let d = result_divd - 1;
    let mval = result_mult as i64 - 1;
    let clkmode = zzzz | (result_pppp << 4) | (mval << 8) | (d << 18) | (1 << 24);
    let finalfreq = result_fout.round() as i64;
    debug!("P2 clock: freq {finalfreq} mode {clkmode:#x} (divd {result_divd} mult {result_mult} pppp {result_pppp})");
    self.set_clock_symbols(m, finalfreq, clkmode, clkmode);
    true
  }

  /// Fetch previously calculated clock settings: `(clkfreq, clkreg)`.
  #[must_use] pub fn get_clk_freq(&self, m: ModuleId) -> Option<(u32, u32)> {
    let freq = self.module_const(m, "__clkfreq_con")?;
    let mode = self.module_const(m, "__clkreg_con")?;
    Some((freq as u32, mode as u32))
  }

  /// Declare the `__default_baud__` constant from `debug_baud`, the
  /// session default, or the platform default.
  pub fn declare_baud(&mut self, m: ModuleId) {
    let mut baud: i64 = 0;
    if self.options.debug {
      baud = self.module_const(m, "debug_baud").unwrap_or(0);
    }
    if baud == 0 {
      baud = i64::from(self.options.default_baud);
      if baud == 0 {
        baud = if self.options.target.is_p2() { 230_400 } else { 115_200 };
      }
    }
    self.add_internal_symbol(m, "__default_baud__", baud);
    let q = self.system_module;
    if !self.module(q).objsyms.contains(intern("__default_baud__")) {
      self.add_internal_symbol(q, "__default_baud__", baud);
    }
  }
}

/// Recover the legacy `_CLKMODE` flag constant from a P1 clock register
/// value (listings and debuggers want the user-level spelling back).
#[must_use] pub fn calc_orig_clock_mode(target: Target, clkreg: u32) -> u32 {
  if target.is_p2() { return clkreg }
  if clkreg == 0 { return RCFAST as u32 }
  if clkreg == 1 || clkreg == 2 { return RCSLOW as u32 }
  if clkreg & 0x3 == 3 && clkreg & 0x18 == 0 { return XINPUT as u32 }
  if clkreg & 0x20 != 0 && clkreg & 0x40 == 0 { return XINPUT as u32 }
  let mut mode = match (clkreg >> 3) & 3 {
    1 => XTAL1,
    2 => XTAL2,
    _ => XTAL3,
  };
  mode |= match clkreg & 0x7 {
    0x3 => PLL1X,
    0x4 => PLL2X,
    0x5 => PLL4X,
    0x6 => PLL8X,
    _ => PLL16X,
  };
  mode as u32
}

#[cfg(test)]
mod test {
  use super::*;
  use crate::{Compiler, Options, Language};

  fn session(target: Target) -> Compiler {
    let mut opts = Options::default();
    opts.target = target;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    c
  }

  fn declare_const(c: &mut Compiler, m: ModuleId, name: &str, val: i64) {
    let ident = c.ast.identifier(name);
    let v = c.ast.integer(val);
    let a = c.ast.assign(ident, v);
    let holder = c.ast.new_node(crate::types::ast::AstKind::ListHolder, Some(a), None);
    c.declare_constants(m, holder);
  }

  #[test]
  fn p1_xtal_pll16() {
    let mut c = session(Target::P1);
    let m = c.new_module("top.spin", Language::Spin1);
    declare_const(&mut c, m, "_clkmode", XTAL1 | PLL16X);
    declare_const(&mut c, m, "_xinfreq", 5_000_000);
    assert!(c.calc_clk_freq(m));
    let (freq, reg) = c.get_clk_freq(m).unwrap();
    assert_eq!(freq, 80_000_000);
    // OSCENA | PLLENA | XTAL1<<3 | CLKSEL 7
    assert_eq!(reg, 0x6f);
  }

  #[test]
  fn p1_inconsistent_freqs() {
    let mut c = session(Target::P1);
    let m = c.new_module("top.spin", Language::Spin1);
    declare_const(&mut c, m, "_clkmode", XTAL1 | PLL8X);
    declare_const(&mut c, m, "_xinfreq", 5_000_000);
    declare_const(&mut c, m, "_clkfreq", 80_000_000); // 8x5 = 40, mismatch
    assert!(!c.calc_clk_freq(m));
    assert_eq!(c.diag.errors(), 1);
  }

  #[test]
  fn p2_search_hits_target() {
    let mut c = session(Target::P2RevB);
    let m = c.new_module("top.spin2", Language::Spin2);
    declare_const(&mut c, m, "_clkfreq", 180_000_000);
    assert!(c.calc_clk_freq(m));
    let (freq, reg) = c.get_clk_freq(m).unwrap();
    assert_eq!(freq, 180_000_000);
    assert_ne!(reg & (1 << 24), 0, "PLL enabled");
    // deterministic: running again after clearing gives the same mode
    let m2 = c.new_module("again.spin2", Language::Spin2);
    declare_const(&mut c, m2, "_clkfreq", 180_000_000);
    assert!(c.calc_clk_freq(m2));
    assert_eq!(c.get_clk_freq(m2).unwrap(), (freq, reg));
  }

  #[test]
  fn p2_explicit_mode_needs_freq() {
    let mut c = session(Target::P2RevB);
    let m = c.new_module("top.spin2", Language::Spin2);
    declare_const(&mut c, m, "_clkmode", 0x010c_3f04);
    assert!(!c.calc_clk_freq(m));
  }

  #[test]
  fn orig_clock_mode_roundtrip() {
    assert_eq!(calc_orig_clock_mode(Target::P1, 0), RCFAST as u32);
    assert_eq!(calc_orig_clock_mode(Target::P1, 0x6f), (XTAL1 | PLL16X) as u32);
    assert_eq!(calc_orig_clock_mode(Target::P2RevB, 0x12345), 0x12345);
  }

  #[test]
  fn baud_defaults() {
    let mut c = session(Target::P2RevB);
    let m = c.new_module("top.spin2", Language::Spin2);
    c.declare_baud(m);
    assert_eq!(c.const_or_default(m, "__default_baud__", 0), 230_400);
  }
}
