// Copyright 2022 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![cfg_attr(not(test), no_std)]

// Data structures shared by the NPU coordinator, the hardware backends and
// the validation protocol. Nothing here touches hardware.

extern crate alloc;

mod counters;
mod epoch;

pub use counters::*;
pub use epoch::*;

use core::fmt;
use core::ops::Range;
use serde::{Deserialize, Serialize};

/// Number of accelerator data lanes ("strands") that can be monitored.
pub const STRAND_COUNT: usize = 10;
pub const STRAND_MASK: u32 = (1 << STRAND_COUNT) - 1;

/// Element encoding of a tensor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum ElementFormat {
    Float { bits: u8 },
    FixedPoint { signed: bool, bits: u8, frac: u8 },
    Bool,
    Integer { signed: bool, bits: u8 },
}
impl ElementFormat {
    pub const F32: ElementFormat = ElementFormat::Float { bits: 32 };

    pub fn bits(&self) -> u8 {
        match *self {
            ElementFormat::Float { bits } => bits,
            ElementFormat::FixedPoint { bits, .. } => bits,
            ElementFormat::Integer { bits, .. } => bits,
            // Bools are stored one per byte.
            ElementFormat::Bool => 8,
        }
    }

    /// Storage width of one element in bytes; sub-byte formats round up.
    pub fn byte_width(&self) -> usize { (self.bits() as usize + 7) / 8 }
}

/// Per-tensor affine quantization.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Quant {
    pub scale: f32,
    pub zero_point: i32,
}

/// Returned when a descriptor's declared size does not match its shape.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SizeMismatch {
    pub declared: usize,
    pub computed: usize,
}

/// Description of one accelerator-visible buffer. Descriptors come from the
/// compiled network and live for the life of the program; everything else
/// holds references to them.
#[derive(Clone, Copy, Debug)]
pub struct TensorDesc {
    pub name: &'static str,
    pub shape: &'static [u32],
    pub format: ElementFormat,
    pub quant: Option<Quant>,
    pub addr: usize,
    pub size: usize,    // Declared size in bytes.
    pub is_param: bool, // Weights/constants, never streamed.
    pub epoch: i16,     // Execution unit that produces this buffer.
}
impl TensorDesc {
    pub fn rank(&self) -> usize { self.shape.len() }

    pub fn element_count(&self) -> usize { self.shape.iter().map(|&d| d as usize).product() }

    pub fn element_byte_width(&self) -> usize { self.format.byte_width() }

    pub fn byte_size(&self) -> usize { self.size }

    /// Checks the declared byte size against shape x element width.
    pub fn validate(&self) -> Result<(), SizeMismatch> {
        let computed = self.element_count() * self.element_byte_width();
        if computed == self.size {
            Ok(())
        } else {
            Err(SizeMismatch {
                declared: self.size,
                computed,
            })
        }
    }

    /// Address range covered by the buffer.
    pub fn range(&self) -> Range<usize> { self.addr..self.addr + self.size }
}
impl fmt::Display for TensorDesc {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}@{:#x}[{}]", self.name, self.addr, self.size)
    }
}

/// A physical memory window known to the board.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct MemRegion {
    pub name: &'static str,
    pub base: usize,
    pub size: usize,
    pub cacheable: bool,
}
impl MemRegion {
    pub fn end(&self) -> usize { self.base + self.size }

    pub fn contains(&self, range: &Range<usize>) -> bool {
        range.start >= self.base && range.end <= self.end()
    }

    /// An empty |range| overlaps nothing.
    pub fn overlaps(&self, range: &Range<usize>) -> bool {
        !range.is_empty() && range.start < self.end() && range.end > self.base
    }

    /// Returns the span of |self| covered by |buffers|: from the lowest
    /// buffer start to the highest buffer end, clipped to the region. A
    /// buffer that covers the whole region short-circuits to its size.
    pub fn used_by(&self, buffers: &[TensorDesc]) -> usize {
        if self.size == 0 {
            return 0;
        }
        let last = self.end() - 1;
        let mut lo = last;
        let mut hi = self.base;
        let mut used = 0;
        for buf in buffers.iter().filter(|b| b.size > 0) {
            let start = buf.addr;
            let end = buf.addr + buf.size - 1;
            if start <= self.base && end >= last {
                return self.size;
            }
            let (in_start, in_end) = (
                start >= self.base && start <= last,
                end >= self.base && end <= last,
            );
            match (in_start, in_end) {
                (true, true) => {
                    lo = lo.min(start);
                    hi = hi.max(end);
                }
                (true, false) => {
                    lo = lo.min(start);
                    hi = last;
                }
                (false, true) => {
                    lo = self.base;
                    hi = hi.max(end);
                }
                (false, false) => continue,
            }
            used = hi - lo + 1;
        }
        used
    }
}

/// Sums the used span of every region. This is the activation-memory
/// estimate reported for a network when it does not supply its own.
pub fn activation_footprint(regions: &[MemRegion], buffers: &[TensorDesc]) -> usize {
    regions.iter().map(|r| r.used_by(buffers)).sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHAPE: [u32; 2] = [1, 146];

    fn desc(addr: usize, size: usize) -> TensorDesc {
        TensorDesc {
            name: "t",
            shape: &SHAPE,
            format: ElementFormat::F32,
            quant: None,
            addr,
            size,
            is_param: false,
            epoch: 1,
        }
    }

    /// Size equals element count times element width.
    #[test]
    fn validate_ok() {
        let d = desc(0x1000, 584);
        assert_eq!(d.element_count(), 146);
        assert_eq!(d.element_byte_width(), 4);
        assert_eq!(d.byte_size(), 584);
        assert!(d.validate().is_ok());
    }

    /// A descriptor whose declared size disagrees with its shape is rejected.
    #[test]
    fn validate_mismatch() {
        let d = desc(0x1000, 500);
        assert_eq!(
            d.validate(),
            Err(SizeMismatch {
                declared: 500,
                computed: 584
            })
        );
    }

    #[test]
    fn format_widths() {
        assert_eq!(ElementFormat::Bool.byte_width(), 1);
        assert_eq!(
            ElementFormat::FixedPoint {
                signed: true,
                bits: 8,
                frac: 7
            }
            .byte_width(),
            1
        );
        assert_eq!(
            ElementFormat::Integer {
                signed: false,
                bits: 4
            }
            .byte_width(),
            1
        );
        assert_eq!(ElementFormat::Float { bits: 16 }.byte_width(), 2);
    }

    #[test]
    fn region_overlap() {
        let region = MemRegion {
            name: "ram",
            base: 0x1000,
            size: 0x1000,
            cacheable: true,
        };
        assert!(region.overlaps(&(0x0800..0x1001)));
        assert!(region.overlaps(&(0x1fff..0x3000)));
        assert!(!region.overlaps(&(0x2000..0x3000)));
        assert!(!region.overlaps(&(0x0800..0x1000)));
        assert!(!region.overlaps(&(0x1800..0x1800)));
    }

    /// The used span runs from the lowest start to the highest end.
    #[test]
    fn region_span() {
        let region = MemRegion {
            name: "ram",
            base: 0x1000,
            size: 0x1000,
            cacheable: true,
        };
        let bufs = [desc(0x1100, 0x100), desc(0x1400, 0x40)];
        assert_eq!(region.used_by(&bufs), 0x1440 - 0x1100);

        // Straddling the top clips to the region end.
        let bufs = [desc(0x1f00, 0x200)];
        assert_eq!(region.used_by(&bufs), 0x100);

        // Covering the whole region returns its size.
        let bufs = [desc(0x0800, 0x2000)];
        assert_eq!(region.used_by(&bufs), 0x1000);

        // Outside entirely.
        let bufs = [desc(0x4000, 0x10)];
        assert_eq!(region.used_by(&bufs), 0);
    }

    #[test]
    fn footprint_sums_regions() {
        let regions = [
            MemRegion {
                name: "a",
                base: 0x1000,
                size: 0x1000,
                cacheable: true,
            },
            MemRegion {
                name: "b",
                base: 0x8000,
                size: 0x1000,
                cacheable: false,
            },
        ];
        let bufs = [desc(0x1000, 0x20), desc(0x8010, 0x10)];
        assert_eq!(activation_footprint(&regions, &bufs), 0x30);
    }
}
