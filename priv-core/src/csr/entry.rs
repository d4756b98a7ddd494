//! A single [`CsrEntry`]: the storage, masks, and tying relationship backing one CSR number.

use crate::csr::specifiers::CsrSpecifier;
use crate::RawPrivilegeLevel;

/// How a CSR's storage relates to another CSR's.
///
/// Most CSRs own their bits outright ([`Tie::None`]). A handful alias another CSR's storage
/// word, e.g. `sstatus` shadows `mstatus` and the unprivileged performance counters shadow the
/// machine ones: reads return the master's bits (filtered by this entry's `read_mask`), writes
/// apply this entry's `write_mask` but mutate the master word.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Tie {
    None,
    /// Tied to the entry at the given specifier.
    Master(CsrSpecifier),
    /// The low half of a 64-bit value whose high half lives at the given specifier (RV32 only).
    LowHalfOf(CsrSpecifier),
    /// The high half of a 64-bit value whose low half lives at the given specifier (RV32 only).
    HighHalfOf(CsrSpecifier),
}

/// One named field of a CSR, used by disassembly/debug front ends to pretty-print a value.
#[derive(Debug, Clone)]
pub struct Field {
    pub name: &'static str,
    pub width: u32,
}

/// A fully-described CSR slot: identity, accessibility, storage, and masks.
///
/// See the module-level invariants in the data model: `write` applies `write_mask`, `read`
/// applies `read_mask`, `poke` applies `poke_mask` and ignores `write_mask`.
#[derive(Debug, Clone)]
pub struct CsrEntry {
    pub name: &'static str,
    pub number: CsrSpecifier,
    pub defined: bool,
    pub implemented: bool,
    pub mandatory: bool,
    pub shared: bool,
    pub user_disabled: bool,
    pub privilege: RawPrivilegeLevel,
    pub tie: Tie,
    pub value: u64,
    pub reset_value: u64,
    pub write_mask: u64,
    pub read_mask: u64,
    pub poke_mask: u64,
    pub fields: Vec<Field>,
}

impl CsrEntry {
    /// A fresh, fully read/write entry with the given reset value; `write_mask`/`read_mask`/
    /// `poke_mask` all default to all-ones (narrowed to XLEN by the owning engine).
    pub fn new(name: &'static str, number: CsrSpecifier, reset_value: u64) -> Self {
        Self {
            name,
            number,
            defined: true,
            implemented: true,
            mandatory: false,
            shared: false,
            user_disabled: false,
            privilege: crate::csr::specifiers::required_privilege_level(number),
            tie: Tie::None,
            value: reset_value,
            reset_value,
            write_mask: u64::MAX,
            read_mask: u64::MAX,
            poke_mask: u64::MAX,
            fields: Vec::new(),
        }
    }

    pub fn read_only(mut self) -> Self {
        self.write_mask = 0;
        self
    }

    pub fn masked(mut self, write_mask: u64) -> Self {
        self.write_mask = write_mask;
        self.read_mask = write_mask;
        self.poke_mask = write_mask;
        self
    }

    pub fn with_write_mask(mut self, write_mask: u64) -> Self {
        self.write_mask = write_mask;
        self
    }

    pub fn with_read_mask(mut self, read_mask: u64) -> Self {
        self.read_mask = read_mask;
        self
    }

    pub fn with_poke_mask(mut self, poke_mask: u64) -> Self {
        self.poke_mask = poke_mask;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn shared(mut self) -> Self {
        self.shared = true;
        self
    }

    pub fn tied_to(mut self, master: CsrSpecifier) -> Self {
        self.tie = Tie::Master(master);
        self
    }

    pub fn with_fields(mut self, fields: Vec<Field>) -> Self {
        self.fields = fields;
        self
    }

    /// `new = (old & !write_mask) | (value & write_mask)`.
    pub fn write_raw(&mut self, value: u64) {
        self.value = (self.value & !self.write_mask) | (value & self.write_mask);
    }

    /// Ignores `write_mask`; applies `poke_mask` only.
    pub fn poke_raw(&mut self, value: u64) {
        self.value = (self.value & !self.poke_mask) | (value & self.poke_mask);
    }

    pub fn read_raw(&self) -> u64 {
        self.value & self.read_mask
    }

    pub fn reset(&mut self) {
        self.value = self.reset_value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_defaults_to_fully_open_masks_and_reset_value() {
        let e = CsrEntry::new("mscratch", 0x340, 0xdead);
        assert_eq!(e.value, 0xdead);
        assert_eq!(e.reset_value, 0xdead);
        assert_eq!(e.write_mask, u64::MAX);
        assert_eq!(e.read_mask, u64::MAX);
        assert_eq!(e.poke_mask, u64::MAX);
        assert_eq!(e.tie, Tie::None);
        assert!(!e.mandatory);
        assert!(!e.shared);
    }

    #[test]
    fn read_only_clears_write_mask_but_not_read_or_poke() {
        let e = CsrEntry::new("x", 0, 0).read_only();
        assert_eq!(e.write_mask, 0);
        assert_eq!(e.read_mask, u64::MAX);
        assert_eq!(e.poke_mask, u64::MAX);
    }

    #[test]
    fn masked_sets_all_three_masks_identically() {
        let e = CsrEntry::new("x", 0, 0).masked(0xff);
        assert_eq!(e.write_mask, 0xff);
        assert_eq!(e.read_mask, 0xff);
        assert_eq!(e.poke_mask, 0xff);
    }

    #[test]
    fn write_raw_applies_write_mask_and_preserves_masked_out_bits() {
        let mut e = CsrEntry::new("x", 0, 0xff00).with_write_mask(0x00ff);
        e.write_raw(0x1234);
        // Low byte taken from the write (0x34), high byte retained from reset value (0xff00).
        assert_eq!(e.value, 0xff34);
    }

    #[test]
    fn poke_raw_ignores_write_mask_and_applies_poke_mask() {
        let mut e = CsrEntry::new("x", 0, 0)
            .with_write_mask(0)
            .with_poke_mask(0xff);
        e.poke_raw(0x1234);
        assert_eq!(e.value, 0x34);
    }

    #[test]
    fn read_raw_applies_read_mask() {
        let e = CsrEntry::new("x", 0, 0x1234).with_read_mask(0x00ff);
        assert_eq!(e.read_raw(), 0x34);
    }

    #[test]
    fn reset_restores_reset_value_even_after_writes() {
        let mut e = CsrEntry::new("x", 0, 0xabcd);
        e.write_raw(0);
        assert_eq!(e.value, 0);
        e.reset();
        assert_eq!(e.value, 0xabcd);
    }

    #[test]
    fn tied_to_sets_master_tie() {
        let e = CsrEntry::new("sip", 0x144, 0).tied_to(0x344);
        assert_eq!(e.tie, Tie::Master(0x344));
    }
}
