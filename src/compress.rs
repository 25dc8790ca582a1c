//! Executable compression: the image is LZ4-compressed and prefixed
//! with a self-extracting stub plus a little-endian length word. When
//! compression does not actually shrink the image, the original is kept
//! and a warning issued.

use log::info;
use crate::Compiler;
use crate::diag::DiagKind;
use crate::types::SrcSpan;

/// The P2 self-extract stub, run before the decompressed payload.
const LZ4_STUB: &[u8] = include_bytes!("sys/p2_lz4stub.dat");

impl Compiler {
  /// Wrap `input` in the LZ4 self-extractor. Falls back to the
  /// uncompressed image when that would be larger.
  pub fn compress_executable(&mut self, input: &[u8]) -> Vec<u8> {
    if !self.options.target.is_p2() {
      self.diag.warning(SrcSpan::none(), DiagKind::Resource,
        "Executable compression is not supported for P1");
      return input.to_vec();
    }
    let compressed = lz4_flex::block::compress(input);
    let total = LZ4_STUB.len() + 4 + compressed.len();
    info!("executable compressed from {} to {} bytes ({:.2}%, {} stub bytes)",
          input.len(), total,
          total as f64 / input.len().max(1) as f64 * 100.0,
          LZ4_STUB.len() + 4);
    if total >= input.len() {
      self.diag.warning(SrcSpan::none(), DiagKind::Resource,
        "Compressed executable larger than original, falling back");
      return input.to_vec();
    }
    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(LZ4_STUB);
    out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    out
  }
}

#[cfg(test)]
mod test {
  use crate::{Compiler, Options, Target};

  #[test]
  fn compressible_image_shrinks() {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    let image = vec![0u8; 64 * 1024];
    let out = c.compress_executable(&image);
    assert!(out.len() < image.len());
    // stub, then the 32-bit compressed length, then the stream
    let stub_len = super::LZ4_STUB.len();
    let clen = u32::from_le_bytes(out[stub_len..stub_len + 4].try_into().unwrap());
    assert_eq!(out.len(), stub_len + 4 + clen as usize);
    let back = lz4_flex::block::decompress(&out[stub_len + 4..], image.len()).unwrap();
    assert_eq!(back, image);
  }

  #[test]
  fn incompressible_image_falls_back() {
    let mut c = Compiler::new(Options::default());
    c.diag.capture();
    // tiny image: the stub alone outweighs any savings
    let image: Vec<u8> = (0..64u8).collect();
    let out = c.compress_executable(&image);
    assert_eq!(out, image);
    assert_eq!(c.diag.warnings(), 1);
  }

  #[test]
  fn p1_is_not_supported() {
    let mut opts = Options::default();
    opts.target = Target::P1;
    let mut c = Compiler::new(opts);
    c.diag.capture();
    let image = vec![0u8; 4096];
    let out = c.compress_executable(&image);
    assert_eq!(out, image);
    assert_eq!(c.diag.warnings(), 1);
  }
}
