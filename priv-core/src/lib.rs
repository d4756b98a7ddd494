//! Privileged-state core of a RISC-V instruction-set simulator.
//!
//! This crate models the parts of a hart that are shared by every extension combination and that
//! every instruction-decode/execute pipeline must consult before it can do anything privileged:
//!
//! - [`csr`]: the Control and Status Register file, its accessibility rules, and the
//!   delegation/aliasing propagator that keeps `MIP`/`HIP`/`HVIP`/`VSIP`/`SIP` (and their `IE`
//!   siblings) consistent, plus the AIA `topi` priority resolver.
//! - [`vector`]: the vector register file, including `vtype`/`vl`/`vstart` configuration
//!   legality and tail/mask-agnostic destination policies.
//! - [`pma`]: the Physical Memory Attribute manager and its memory-mapped register windows.
//! - [`fp16`]: compact 16-bit floating-point value types (`Fp16`, `BFloat16`).
//!
//! Instruction decode/execute, the load/store path, the soft-float math library, disassembly,
//! and the IMSIC device itself are all out of scope: this crate only defines the narrow
//! capability traits ([`csr::Imsic`], [`csr::TriggerModule`], [`csr::PmpView`]) that the CSR
//! engine needs from those collaborators.

#[macro_use]
extern crate static_assertions;

use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

pub mod csr;
pub mod fp16;
pub mod pma;
pub mod vector;

// Re-export Allocator trait so dependants don't need to include space-time as a dependency.
pub use space_time::allocator::{Allocator, ArrayAccessor, ArrayAccessorMut};

/// The configured integer width of a simulated hart.
///
/// Unlike the teaching material this crate started from (which only ever modeled RV32I), the
/// CSR engine, delegation propagator, and AIA resolver are all parameterized over [`Xlen`] so the
/// same core can model RV32 or RV64 harts.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Xlen {
    Rv32,
    Rv64,
}

impl Xlen {
    /// Number of value bits, 32 or 64.
    pub fn bits(self) -> u32 {
        match self {
            Xlen::Rv32 => 32,
            Xlen::Rv64 => 64,
        }
    }

    /// A mask with exactly [`Self::bits`] low bits set; all CSR storage is kept truncated to
    /// this mask so that widening/narrowing between RV32 and RV64 views never exposes stale high
    /// bits.
    pub fn mask(self) -> u64 {
        match self {
            Xlen::Rv32 => 0xFFFF_FFFF,
            Xlen::Rv64 => u64::MAX,
        }
    }
}

/// List of all possible privilege levels for RISC-V.
///
/// Same as [`PrivilegeLevel`] except that it allows specifying the reserved privilege level `2`.
/// This can be useful in case a minimum required privilege level is specified as a 2-bit value,
/// since that value itself may be a reserved privilege level.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum RawPrivilegeLevel {
    User = 0,
    Supervisor = 1,
    /// Privilege level `0b10` is reserved in the base ISA. The CSR address-space convention
    /// nonetheless uses it to tag hypervisor/VS-mode CSRs; such a CSR is gated exactly like a
    /// Supervisor-mode one (see [`crate::csr::CsrEntry::privilege`]).
    Reserved = 2,
    Machine = 3,
}

impl RawPrivilegeLevel {
    /// Convert a 2-bit value into a [`RawPrivilegeLevel`].
    /// Panics if the value doesn't fit in 2 bits (`0..=3`).
    pub fn from_u2(value_u2: u8) -> Self {
        match value_u2 {
            0 => Self::User,
            1 => Self::Supervisor,
            2 => Self::Reserved,
            3 => Self::Machine,
            _ => panic!("out of range u2 used"),
        }
    }

    pub fn is_reserved(self) -> bool {
        matches!(self, Self::Reserved)
    }
}

impl fmt::Display for RawPrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            RawPrivilegeLevel::User => "U",
            RawPrivilegeLevel::Supervisor => "S",
            RawPrivilegeLevel::Reserved => "2",
            RawPrivilegeLevel::Machine => "M",
        })
    }
}

/// List of defined privilege levels for RISC-V.
///
/// A privilege level is always referenced by two bits, so only `0`, `1`, `2`, and `3` are valid
/// privilege levels. However, only levels `0`, `1`, and `3` are defined as actual execution
/// modes; level `2` is only ever used as a CSR-accessibility tag (see [`RawPrivilegeLevel`]).
///
/// > The machine level has the highest privileges and is the only mandatory privilege level for a
/// > RISC-V hardware platform. Code run in machine-mode (M-mode) is usually inherently trusted, as
/// > it has low-level access to the machine implementation.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum PrivilegeLevel {
    /// User/application (abbreviated `U`) is the lower privilege level.
    User = 0,
    /// Supervisor (abbreviated `S`) is an intermediate privilege level, used both for HS-mode
    /// (the hypervisor extension's host supervisor) and, when [`VirtualizationMode::On`], for
    /// VS-mode.
    Supervisor = 1,
    // Level 2 is reserved.
    /// Machine (abbreviated `M`) is the highest privilege level.
    /// It is the only mandatory privilege level for a RISC-V hardware platform.
    Machine = 3,
}

impl PartialEq<PrivilegeLevel> for RawPrivilegeLevel {
    fn eq(&self, other: &PrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialEq<RawPrivilegeLevel> for PrivilegeLevel {
    fn eq(&self, other: &RawPrivilegeLevel) -> bool {
        *self as usize == *other as usize
    }
}

impl PartialOrd<PrivilegeLevel> for RawPrivilegeLevel {
    fn partial_cmp(&self, other: &PrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl PartialOrd<RawPrivilegeLevel> for PrivilegeLevel {
    fn partial_cmp(&self, other: &RawPrivilegeLevel) -> Option<Ordering> {
        (*self as usize).partial_cmp(&(*other as usize))
    }
}

impl fmt::Display for PrivilegeLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match *self {
            PrivilegeLevel::User => "U",
            PrivilegeLevel::Supervisor => "S",
            PrivilegeLevel::Machine => "M",
        })
    }
}

impl From<PrivilegeLevel> for RawPrivilegeLevel {
    fn from(value: PrivilegeLevel) -> Self {
        match value {
            PrivilegeLevel::User => Self::User,
            PrivilegeLevel::Supervisor => Self::Supervisor,
            PrivilegeLevel::Machine => Self::Machine,
        }
    }
}

impl TryFrom<RawPrivilegeLevel> for PrivilegeLevel {
    type Error = ReservedPrivilegeLevelError;
    fn try_from(value: RawPrivilegeLevel) -> Result<Self, Self::Error> {
        match value {
            RawPrivilegeLevel::User => Ok(Self::User),
            RawPrivilegeLevel::Supervisor => Ok(Self::Supervisor),
            RawPrivilegeLevel::Reserved => Err(ReservedPrivilegeLevelError(value)),
            RawPrivilegeLevel::Machine => Ok(Self::Machine),
        }
    }
}

#[derive(Error, Debug)]
#[error("privilege level {0} is reserved")]
pub struct ReservedPrivilegeLevelError(RawPrivilegeLevel);

/// Whether the current hart is currently executing a virtual hart (`V=1`, i.e. VS-mode or
/// VU-mode) or not (`V=0`, i.e. HS-mode, U-mode, or M-mode).
///
/// Tracked independently from [`PrivilegeLevel`]/[`RawPrivilegeLevel`] because the hypervisor
/// extension reuses the `Supervisor` privilege level for both HS-mode and VS-mode; the two are
/// only distinguished by this flag.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, Default)]
pub enum VirtualizationMode {
    #[default]
    Off,
    On,
}

impl VirtualizationMode {
    pub fn is_on(self) -> bool {
        matches!(self, VirtualizationMode::On)
    }
}

impl From<bool> for VirtualizationMode {
    fn from(value: bool) -> Self {
        if value {
            VirtualizationMode::On
        } else {
            VirtualizationMode::Off
        }
    }
}

/// Wrapper around [`Allocator`] for single objects of type `T` that are never deallocated during
/// the lifetime of this wrapper.
///
/// The primary goal of this wrapper is to provide a more convenient interface around
/// [`Allocator::get`] and [`Allocator::get_mut`], which returns a (mutable) reference directly
/// rather than a `Result`.
#[derive(Debug)]
pub struct Allocated<A: Allocator, T: 'static + Clone>(A::Id<T>);

impl<A: Allocator, T: 'static + Clone> Allocated<A, T> {
    /// Inserts `object` into `allocator`. See also [`Allocator::insert`].
    pub fn new(allocator: &mut A, object: T) -> Self {
        Self(allocator.insert(object))
    }

    /// Pops the inner object from `allocator`, returning it while consuming `self`.
    /// See also [`Allocator::pop`].
    ///
    /// # Panics
    ///
    /// Panics if the inner object was already removed from `allocator`.
    pub fn into_inner(self, allocator: &mut A) -> T {
        allocator.pop(self.0).unwrap()
    }

    /// Removes the inner object from `allocator`, consuming `self`. See also [`Allocator::remove`].
    ///
    /// If you need an owned version of the inner object, use [`into_inner`](Self::into_inner).
    ///
    /// # Panics
    ///
    /// Panics if the inner object was already removed from `allocator`.
    pub fn drop(self, allocator: &mut A) {
        allocator.remove(self.0).unwrap()
    }

    /// Returns a reference to the stored object. See also [`Allocator::get`].
    ///
    /// # Panics
    ///
    /// Panics if the inner object has been removed from `allocator`.
    pub fn get<'a>(&self, allocator: &'a A) -> &'a T {
        allocator.get(self.0).unwrap()
    }

    /// Returns a mutable reference to the stored object. See also [`Allocator::get_mut`].
    ///
    /// # Panics
    ///
    /// Panics if the inner object has been removed from `allocator`.
    pub fn get_mut<'a>(&self, allocator: &'a mut A) -> &'a mut T {
        allocator.get_mut(self.0).unwrap()
    }
}
