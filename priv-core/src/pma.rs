//! Physical Memory Attribute (PMA) manager.
//!
//! A [`PmaManager`] holds an ordered list of address regions, each tagged with a [`Pma`]
//! attribute set, plus a separate table of memory-mapped register (MMR) windows. Both the
//! instruction-fetch and load/store paths (out of scope for this crate) consult
//! [`PmaManager::get_pma`] before touching memory; the `PMACFG*` CSRs populate the region list
//! through [`PmaManager::define_region`] after their value has been legalised by
//! [`legalize_pmacfg`].

/// A bit-set of physical memory attributes, associated with a word-aligned section of the
/// address space.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Default)]
pub struct Pma(u32);

impl Pma {
    pub const NONE: Pma = Pma(0);
    pub const READ: Pma = Pma(1 << 0);
    pub const WRITE: Pma = Pma(1 << 1);
    pub const EXEC: Pma = Pma(1 << 2);
    pub const IDEMPOTENT: Pma = Pma(1 << 3);
    pub const AMO_OTHER: Pma = Pma(1 << 4);
    pub const AMO_SWAP: Pma = Pma(1 << 5);
    pub const AMO_LOGICAL: Pma = Pma(1 << 6);
    pub const MEM_MAPPED: Pma = Pma(1 << 9);
    pub const RSRV: Pma = Pma(1 << 10);
    pub const IO: Pma = Pma(1 << 11);
    pub const CACHEABLE: Pma = Pma(1 << 12);
    pub const MISAL_OK: Pma = Pma(1 << 13);
    pub const MISAL_ACC_FAULT: Pma = Pma(1 << 14);

    pub const MAPPED: Pma = Pma(Self::READ.0 | Self::WRITE.0 | Self::EXEC.0);
    pub const AMO_ARITH: Pma = Pma(Self::AMO_SWAP.0 | Self::AMO_OTHER.0 | Self::AMO_LOGICAL.0);
    pub const DEFAULT: Pma = Pma(
        Self::READ.0
            | Self::WRITE.0
            | Self::EXEC.0
            | Self::IDEMPOTENT.0
            | Self::AMO_ARITH.0
            | Self::RSRV.0
            | Self::MISAL_OK.0,
    );

    pub const fn union(self, other: Pma) -> Pma {
        Pma(self.0 | other.0)
    }

    pub const fn intersect(self, other: Pma) -> Pma {
        Pma(self.0 & other.0)
    }

    pub fn enable(&mut self, a: Pma) {
        self.0 |= a.0;
    }

    pub fn disable(&mut self, a: Pma) {
        self.0 &= !a.0;
    }

    /// Returns true if every attribute in `a` is present.
    pub const fn has(self, a: Pma) -> bool {
        self.0 & a.0 == a.0
    }

    pub const fn is_mapped(self) -> bool {
        self.0 & Self::MAPPED.0 != 0
    }

    pub const fn has_mem_mapped_reg(self) -> bool {
        self.has(Self::MEM_MAPPED)
    }

    pub const fn is_idempotent(self) -> bool {
        self.has(Self::IDEMPOTENT)
    }

    pub const fn is_cacheable(self) -> bool {
        self.has(Self::CACHEABLE)
    }

    pub const fn is_read(self) -> bool {
        self.has(Self::READ)
    }

    pub const fn is_write(self) -> bool {
        self.has(Self::WRITE)
    }

    pub const fn is_exec(self) -> bool {
        self.has(Self::EXEC)
    }

    pub const fn is_amo(self) -> bool {
        self.0 & Self::AMO_ARITH.0 != 0
    }

    pub const fn is_rsrv(self) -> bool {
        self.has(Self::RSRV)
    }

    pub const fn is_io(self) -> bool {
        self.has(Self::IO)
    }

    pub const fn is_misaligned_ok(self) -> bool {
        self.has(Self::MISAL_OK)
    }

    pub const fn access_fault_on_misaligned(self) -> bool {
        self.has(Self::MISAL_ACC_FAULT)
    }
}

impl std::ops::BitOr for Pma {
    type Output = Pma;
    fn bitor(self, rhs: Pma) -> Pma {
        self.union(rhs)
    }
}

/// An ordered region of word-aligned addresses `[first_addr, last_addr]` tagged with a [`Pma`].
#[derive(Debug, Clone)]
struct Region {
    first_addr: u64,
    last_addr: u64,
    pma: Pma,
    valid: bool,
}

impl Region {
    fn overlaps(&self, addr: u64) -> bool {
        addr >= self.first_addr && addr <= self.last_addr
    }

    fn overlaps_range(&self, lo: u64, hi: u64) -> bool {
        hi >= self.first_addr && lo <= self.last_addr
    }
}

/// A memory-mapped register window: reads/writes at `addr` go through `value` instead of
/// backing memory, gated by `mask` (bits with mask 0 are read-only).
#[derive(Debug, Clone)]
struct MemMappedReg {
    value: u64,
    mask: u64,
    size: u32,
    pma: Pma,
}

/// Ordered list of [`Pma`] regions, a default/no-access fallback, and the memory-mapped register
/// table. One instance is shared by every hart in a memory; there is no synchronization because
/// the top-level simulator steps one hart to completion before moving to the next.
#[derive(Debug, Clone)]
pub struct PmaManager {
    mem_size: u64,
    regions: Vec<Region>,
    mem_mapped_regs: std::collections::BTreeMap<u64, MemMappedReg>,
    default_pma: Pma,
    no_access_pma: Pma,
}

/// Region index is out of the architectural limit, or an MMR address/size is malformed.
#[derive(Debug, thiserror::Error)]
pub enum PmaConfigError {
    #[error("region index {0} exceeds the maximum of 128 regions")]
    IndexOutOfRange(usize),
    #[error("memory-mapped register size must be 4 or 8 bytes, got {0}")]
    InvalidSize(u32),
    #[error("memory-mapped register address {0:#x} is not aligned to its size")]
    Misaligned(u64),
}

const MAX_REGIONS: usize = 128;

impl PmaManager {
    pub fn new(mem_size: u64) -> Self {
        Self {
            mem_size,
            regions: Vec::new(),
            mem_mapped_regs: std::collections::BTreeMap::new(),
            default_pma: Pma::DEFAULT,
            no_access_pma: Pma::MISAL_OK,
        }
    }

    /// Returns the attribute set covering the word-aligned address containing `addr`.
    ///
    /// Regions are scanned in definition order; the first valid, overlapping region wins. If
    /// that region has [`Pma::MEM_MAPPED`], the result is intersected with the attributes of the
    /// memory-mapped register at the containing word/doubleword, if any is defined there.
    pub fn get_pma(&self, addr: u64) -> Pma {
        let word_addr = addr & !0x3;
        for region in &self.regions {
            if region.valid && region.overlaps(word_addr) {
                if !region.pma.has_mem_mapped_reg() {
                    return region.pma;
                }
                return self.mem_mapped_pma(region.pma, word_addr);
            }
        }
        if word_addr < self.mem_size {
            self.default_pma
        } else {
            self.no_access_pma
        }
    }

    fn mem_mapped_pma(&self, region_pma: Pma, word_addr: u64) -> Pma {
        let doubleword_addr = word_addr & !0x7;
        if let Some(mmr) = self.mem_mapped_regs.get(&word_addr).or_else(|| self.mem_mapped_regs.get(&doubleword_addr)) {
            region_pma.intersect(mmr.pma)
        } else {
            region_pma
        }
    }

    /// Defines (or redefines) region `ix`. Regions are checked in definition order: if an
    /// address is covered by multiple regions, the lowest index wins.
    pub fn define_region(&mut self, ix: usize, first_addr: u64, last_addr: u64, pma: Pma) -> Result<(), PmaConfigError> {
        if ix >= MAX_REGIONS {
            return Err(PmaConfigError::IndexOutOfRange(ix));
        }
        if ix >= self.regions.len() {
            self.regions.resize(
                ix + 1,
                Region { first_addr: 0, last_addr: 0, pma: Pma::NONE, valid: false },
            );
        }
        self.regions[ix] = Region { first_addr, last_addr, pma, valid: true };
        Ok(())
    }

    /// Marks region `ix` as invalid; it is skipped by [`Self::get_pma`] without being removed
    /// from the list.
    pub fn invalidate_entry(&mut self, ix: usize) -> Result<(), PmaConfigError> {
        if ix >= MAX_REGIONS {
            return Err(PmaConfigError::IndexOutOfRange(ix));
        }
        if let Some(region) = self.regions.get_mut(ix) {
            region.valid = false;
        }
        Ok(())
    }

    /// Defines a memory-mapped register window at `addr`. `size` must be 4 or 8, and `addr` must
    /// be aligned to `size`.
    pub fn define_mem_mapped_reg(&mut self, addr: u64, mask: u64, size: u32, pma: Pma) -> Result<(), PmaConfigError> {
        if size != 4 && size != 8 {
            return Err(PmaConfigError::InvalidSize(size));
        }
        if addr & (size as u64 - 1) != 0 {
            return Err(PmaConfigError::Misaligned(addr));
        }
        self.mem_mapped_regs.insert(addr, MemMappedReg { value: 0, mask, size, pma });
        Ok(())
    }

    fn find_mmr_containing(&self, addr: u64, width: u32) -> Option<(&u64, &MemMappedReg)> {
        self.mem_mapped_regs
            .range(..=addr)
            .next_back()
            .filter(|(&base, mmr)| addr + width as u64 <= base + mmr.size as u64)
    }

    /// Reads `WIDTH` bytes from the memory-mapped register containing `addr`, returning `None`
    /// if `addr` does not fall within a defined MMR. Unaligned reads that span two adjacent
    /// 4-byte MMRs are served by concatenating them into an 8-byte read.
    pub fn read_register<const WIDTH: usize>(&self, addr: u64) -> Option<[u8; WIDTH]> {
        if WIDTH == 8 {
            if let Some((&base, mmr)) = self.find_mmr_containing(addr, 8) {
                let bytes = mmr.value.to_le_bytes();
                let offset = (addr - base) as usize;
                let mut out = [0u8; WIDTH];
                out.copy_from_slice(&bytes[offset..offset + WIDTH]);
                return Some(out);
            }
            // Unaligned 8-byte read spanning two adjacent 4-byte MMRs.
            let low_base = addr & !0x3;
            let high_base = low_base + 4;
            if let (Some(low), Some(high)) = (self.mem_mapped_regs.get(&low_base), self.mem_mapped_regs.get(&high_base)) {
                let combined = (low.value as u64 & 0xFFFF_FFFF) | ((high.value as u64 & 0xFFFF_FFFF) << 32);
                let offset = (addr - low_base) as usize;
                let bytes = combined.to_le_bytes();
                let mut out = [0u8; WIDTH];
                out.copy_from_slice(&bytes[offset..offset + WIDTH]);
                return Some(out);
            }
            return None;
        }
        let (&base, mmr) = self.find_mmr_containing(addr, WIDTH as u32)?;
        let bytes = mmr.value.to_le_bytes();
        let offset = (addr - base) as usize;
        let mut out = [0u8; WIDTH];
        out.copy_from_slice(&bytes[offset..offset + WIDTH]);
        Some(out)
    }

    /// Writes `value` into the memory-mapped register containing `addr`, honoring the
    /// register's mask (bits with mask 0 keep their prior value). Returns `false` if `addr`
    /// does not fall within a defined MMR.
    pub fn write_register(&mut self, addr: u64, value: u64, width: u32) -> bool {
        let base = addr & !(width as u64 - 1);
        let Some(mmr) = self.mem_mapped_regs.get_mut(&base) else { return false };
        let shift = ((addr - base) * 8) as u32;
        let byte_mask: u64 = if width >= 8 { u64::MAX } else { (1u64 << (width * 8)) - 1 };
        let mask = (mmr.mask & byte_mask) << shift;
        let shifted_value = (value & byte_mask) << shift;
        mmr.value = (mmr.value & !mask) | (shifted_value & mask);
        true
    }

    /// Returns true if `[lo, hi]` overlaps any defined memory-mapped register.
    pub fn overlaps_mem_mapped_regs(&self, lo: u64, hi: u64) -> bool {
        self.mem_mapped_regs.iter().any(|(&base, mmr)| {
            let last = base + mmr.size as u64 - 1;
            hi >= base && lo <= last
        })
    }

    pub fn enable_misaligned_data(&mut self, enable: bool) {
        if enable {
            self.default_pma.enable(Pma::MISAL_OK);
            self.no_access_pma.enable(Pma::MISAL_OK);
        } else {
            self.default_pma.disable(Pma::MISAL_OK);
            self.no_access_pma.disable(Pma::MISAL_OK);
        }
    }
}

/// Result of unpacking a `PMACFG` CSR value: the attribute set and the inclusive address range
/// it applies to.
#[derive(Debug, Copy, Clone)]
pub struct UnpackedPmacfg {
    pub low: u64,
    pub high: u64,
    pub pma: Pma,
}

/// Unpacks a `PMACFG` encoding (see CSR numbering §6.2), returning `None` if bits `63:58` encode
/// a disabled entry (`n == 0`).
pub fn unpack_pmacfg(value: u64) -> Option<UnpackedPmacfg> {
    let n = value >> 58;
    if n == 0 {
        return None;
    }
    let n = n.max(12);

    let mut pma = Pma::MISAL_OK;
    if value & 1 != 0 {
        pma.enable(Pma::READ);
    }
    if value & 2 != 0 {
        pma.enable(Pma::WRITE);
    }
    if value & 4 != 0 {
        pma.enable(Pma::EXEC);
    }

    let mem_type = (value >> 3) & 0x3;
    if mem_type != 0 {
        pma.enable(Pma::IO);
        pma.disable(Pma::MISAL_OK);
        pma.enable(Pma::MISAL_ACC_FAULT);
    } else {
        let cacheable = value & 0x80 != 0;
        if cacheable {
            pma.enable(Pma::CACHEABLE);
            pma.enable(Pma::RSRV);
            let amo_type = (value >> 5) & 0x3;
            match amo_type {
                1 => pma.enable(Pma::AMO_SWAP),
                2 => pma.enable(Pma::AMO_LOGICAL),
                3 => pma.enable(Pma::AMO_ARITH),
                _ => {}
            }
        }
    }

    // Clear the most-significant 8 bits, then clear the least significant n bits.
    let addr = (value << 8) >> 8;
    let low = (addr >> n) << n;
    let high = if n < 56 { low | ((1u64 << n) - 1) } else { u64::MAX };

    Some(UnpackedPmacfg { low, high, pma })
}

/// Legalises a write to a `PMACFG` CSR: returns `next` if every field is architecturally legal,
/// else `prev` unchanged.
pub fn legalize_pmacfg(prev: u64, next: u64) -> u64 {
    let n = next >> 58;
    if n > 0 && n < 12 {
        return prev;
    }

    let read = next & 1 != 0;
    let write = next & 2 != 0;
    let exec = next & 4 != 0;
    let cacheable = next & 0x80 != 0;
    let coherent = next & 0x100 != 0;
    let mem_type = (next >> 3) & 0x3;
    let io = mem_type != 0;
    let amo = (next >> 5) & 0x3;

    if io {
        if amo != 0 {
            return prev;
        }
        if write && !read {
            return prev;
        }
        if coherent {
            return prev;
        }
    } else {
        let count = read as u32 + write as u32 + exec as u32;
        if count != 0 && count != 3 {
            return prev;
        }
        if cacheable && amo != 3 {
            return prev;
        }
        if !cacheable && amo != 0 {
            return prev;
        }
    }

    next
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_matching_region_wins() {
        let mut mgr = PmaManager::new(0x1_0000);
        mgr.define_region(0, 0x0, 0xFFF, Pma::READ).unwrap();
        mgr.define_region(1, 0x0, 0xFFFF, Pma::READ | Pma::WRITE).unwrap();
        assert_eq!(mgr.get_pma(0x100), Pma::READ);
    }

    #[test]
    fn default_pma_within_memory_else_no_access() {
        let mgr = PmaManager::new(0x1000);
        assert_eq!(mgr.get_pma(0x10), Pma::DEFAULT);
        assert!(!mgr.get_pma(0x2000).is_mapped());
    }

    #[test]
    fn invalidated_region_is_skipped() {
        let mut mgr = PmaManager::new(0x1000);
        mgr.define_region(0, 0x0, 0xFFF, Pma::READ).unwrap();
        mgr.invalidate_entry(0).unwrap();
        assert_eq!(mgr.get_pma(0x10), Pma::DEFAULT);
    }

    #[test]
    fn region_index_limit() {
        let mut mgr = PmaManager::new(0x1000);
        assert!(mgr.define_region(128, 0, 0xFF, Pma::READ).is_err());
    }

    #[test]
    fn mem_mapped_register_read_write_roundtrip() {
        let mut mgr = PmaManager::new(0x1000);
        mgr.define_mem_mapped_reg(0x100, 0xFFFF_FFFF, 4, Pma::READ | Pma::WRITE).unwrap();
        assert!(mgr.write_register(0x100, 0xDEAD_BEEF, 4));
        let bytes: [u8; 4] = mgr.read_register(0x100).unwrap();
        assert_eq!(u32::from_le_bytes(bytes), 0xDEAD_BEEF);
    }

    #[test]
    fn mem_mapped_register_respects_mask() {
        let mut mgr = PmaManager::new(0x1000);
        mgr.define_mem_mapped_reg(0x100, 0x0000_00FF, 4, Pma::READ | Pma::WRITE).unwrap();
        mgr.write_register(0x100, 0xFFFF_FFFF, 4);
        let bytes: [u8; 4] = mgr.read_register(0x100).unwrap();
        assert_eq!(u32::from_le_bytes(bytes), 0x0000_00FF);
    }

    #[test]
    fn overlaps_mem_mapped_regs_detects_intersection() {
        let mut mgr = PmaManager::new(0x1000);
        mgr.define_mem_mapped_reg(0x100, 0xFFFF_FFFF, 4, Pma::READ).unwrap();
        assert!(mgr.overlaps_mem_mapped_regs(0x0FE, 0x102));
        assert!(!mgr.overlaps_mem_mapped_regs(0x200, 0x300));
    }

    #[test]
    fn legalize_pmacfg_rejects_reserved_size() {
        let prev = 0;
        let next = (5u64 << 58) | 0b111;
        assert_eq!(legalize_pmacfg(prev, next), prev);
    }

    #[test]
    fn legalize_pmacfg_rejects_partial_rwx() {
        let prev = 0;
        let next = (12u64 << 58) | 0b011; // read+write, no exec: illegal in memory region.
        assert_eq!(legalize_pmacfg(prev, next), prev);
    }

    #[test]
    fn legalize_pmacfg_accepts_full_rwx() {
        let next = (12u64 << 58) | 0b111;
        assert_eq!(legalize_pmacfg(0, next), next);
    }

    #[test]
    fn legalize_pmacfg_cacheable_requires_amo_arith() {
        let next = (12u64 << 58) | 0b111 | 0x80; // cacheable but amo=0
        assert_eq!(legalize_pmacfg(0, next), 0);
    }

    #[test]
    fn unpack_pmacfg_recovers_base_and_range() {
        let n = 12u64;
        let value = (n << 58) | (0x1234_0000u64 << 12 >> 12) | 0b111;
        let unpacked = unpack_pmacfg(value).unwrap();
        assert!(unpacked.pma.is_mapped());
        assert!(unpacked.high > unpacked.low);
    }

    #[test]
    fn unpack_pmacfg_disabled_when_n_zero() {
        assert!(unpack_pmacfg(0).is_none());
    }
}
