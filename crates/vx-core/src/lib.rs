#![forbid(unsafe_code)]

//! Shared data model for the Vexel JIT: variable types, literal bit
//! packing, and the AD-tagged 64-bit handle that the dispatcher, IR
//! engine, and AD engine exchange.

use serde::{Deserialize, Serialize};

// ── Backend tag ────────────────────────────────────────────────────

/// Where a variable's storage lives. The reference engine is
/// host-resident; the device tag exists so handles can carry placement
/// without the data model changing when a device backend lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BackendKind {
    Host,
    Device,
}

impl BackendKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Device => "device",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Variable types ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VarType {
    Bool,
    U32,
    I32,
    F32,
    F64,
}

impl VarType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::F64 => "f64",
        }
    }

    /// Width of one element when packed into a flat buffer.
    #[must_use]
    pub fn byte_size(self) -> usize {
        match self {
            Self::Bool => 1,
            Self::U32 | Self::I32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    #[must_use]
    pub fn is_float(self) -> bool {
        matches!(self, Self::F32 | Self::F64)
    }
}

impl std::fmt::Display for VarType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of an IR variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VarState {
    /// A uniform value known at trace time.
    Literal,
    /// Defined by an instruction that has not run yet.
    Unevaluated,
    /// Materialized data.
    Evaluated,
    /// Target of a pending side effect; must be evaluated before reads.
    Dirty,
}

// ── Literal bit packing ────────────────────────────────────────────
//
// All element data is stored as raw `u64` bit patterns interpreted
// through a `VarType`. This is the same representation the aggregation
// table uses for literal immediates, so no conversion happens at the
// getter boundary.

#[must_use]
pub fn pack_f64(value: f64) -> u64 {
    value.to_bits()
}

#[must_use]
pub fn unpack_f64(bits: u64) -> f64 {
    f64::from_bits(bits)
}

#[must_use]
pub fn pack_f32(value: f32) -> u64 {
    u64::from(value.to_bits())
}

#[must_use]
pub fn unpack_f32(bits: u64) -> f32 {
    f32::from_bits(bits as u32)
}

#[must_use]
pub fn pack_i32(value: i32) -> u64 {
    u64::from(value as u32)
}

#[must_use]
pub fn unpack_i32(bits: u64) -> i32 {
    bits as u32 as i32
}

#[must_use]
pub fn pack_u32(value: u32) -> u64 {
    u64::from(value)
}

#[must_use]
pub fn unpack_u32(bits: u64) -> u32 {
    bits as u32
}

#[must_use]
pub fn pack_bool(value: bool) -> u64 {
    u64::from(value)
}

#[must_use]
pub fn unpack_bool(bits: u64) -> bool {
    bits != 0
}

// ── AD-tagged handle ───────────────────────────────────────────────

/// A composite handle: the upper 32 bits name a node in the AD graph
/// (0 = not differentiable), the lower 32 bits name an IR variable
/// (0 = uninitialized). The two halves are reference-counted
/// independently by their respective engines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Index64(pub u64);

impl Index64 {
    pub const ZERO: Self = Self(0);

    #[must_use]
    pub fn new(ad_id: u32, ir_id: u32) -> Self {
        Self((u64::from(ad_id) << 32) | u64::from(ir_id))
    }

    #[must_use]
    pub fn from_ir(ir_id: u32) -> Self {
        Self(u64::from(ir_id))
    }

    #[must_use]
    pub fn ad_id(self) -> u32 {
        (self.0 >> 32) as u32
    }

    #[must_use]
    pub fn ir_id(self) -> u32 {
        self.0 as u32
    }

    #[must_use]
    pub fn is_empty(self) -> bool {
        self.ir_id() == 0
    }

    #[must_use]
    pub fn is_tracked(self) -> bool {
        self.ad_id() != 0
    }

    /// The same handle with the AD half cleared.
    #[must_use]
    pub fn detached(self) -> Self {
        Self::from_ir(self.ir_id())
    }
}

impl std::fmt::Display for Index64 {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_tracked() {
            write!(f, "a{}/r{}", self.ad_id(), self.ir_id())
        } else {
            write!(f, "r{}", self.ir_id())
        }
    }
}

// ── Broadcast rules ────────────────────────────────────────────────

/// Combine two logical sizes under broadcast semantics: size 1
/// broadcasts against anything, equal sizes pass through, and anything
/// else is incompatible.
#[must_use]
pub fn broadcast_size(a: usize, b: usize) -> Option<usize> {
    if a == b || b == 1 {
        Some(a)
    } else if a == 1 {
        Some(b)
    } else {
        None
    }
}

/// Scatter reduction applied when multiple lanes target one slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReduceOp {
    None,
    Add,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn index64_packs_both_halves() {
        let h = Index64::new(7, 42);
        assert_eq!(h.ad_id(), 7);
        assert_eq!(h.ir_id(), 42);
        assert!(h.is_tracked());
        assert!(!h.is_empty());
        assert_eq!(h.detached(), Index64::from_ir(42));
    }

    #[test]
    fn index64_zero_halves_are_sentinels() {
        assert!(Index64::ZERO.is_empty());
        assert!(!Index64::ZERO.is_tracked());
        assert!(!Index64::from_ir(3).is_tracked());
        assert!(Index64::new(3, 0).is_empty());
    }

    #[test]
    fn literal_bits_round_trip() {
        assert_eq!(unpack_f64(pack_f64(-1.25)), -1.25);
        assert_eq!(unpack_f32(pack_f32(3.5)), 3.5);
        assert_eq!(unpack_i32(pack_i32(-17)), -17);
        assert_eq!(unpack_u32(pack_u32(9)), 9);
        assert!(unpack_bool(pack_bool(true)));
        assert!(!unpack_bool(pack_bool(false)));
    }

    #[test]
    fn broadcast_size_rules() {
        assert_eq!(broadcast_size(1, 5), Some(5));
        assert_eq!(broadcast_size(5, 1), Some(5));
        assert_eq!(broadcast_size(5, 5), Some(5));
        assert_eq!(broadcast_size(4, 5), None);
    }

    #[test]
    fn display_forms() {
        assert_eq!(Index64::new(2, 9).to_string(), "a2/r9");
        assert_eq!(Index64::from_ir(9).to_string(), "r9");
        assert_eq!(VarType::F64.to_string(), "f64");
        assert_eq!(BackendKind::Host.to_string(), "host");
    }
}
