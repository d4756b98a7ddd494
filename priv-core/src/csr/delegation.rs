//! The interrupt delegation / aliasing propagator (§4.3).
//!
//! `MIP`, `HIP`, `HVIP`, `VSIP`, `SIP` (and their `IE` siblings) form a cycle of mirrored bits.
//! Rather than letting each write re-trigger the others recursively, [`propagate`] is a single
//! function keyed on the CSR that was just written; each arm applies its mirrors as passive
//! writes directly to the target's raw storage, never calling back into `propagate` itself. This
//! is the "function table keyed on the primary CSR number" alternative the design notes call for.

use super::specifiers::*;
use super::traits::{Imsic, PmpView, TriggerModule};
use super::CsrFile;

/// Local Counter Overflow Interrupt cause bit (Sscofpmf).
const LCOF_MASK: u64 = 1 << 13;
/// Bits 0..=12 of a delegation register: the S/VS-shifted-by-one interrupt family.
const LOW13: u64 = 0x1fff;
/// `sip`/`hip` bit for `VSSIP`.
const VSSIP_BIT: u64 = 1 << 2;
/// Mask applied when mirroring `HIP`'s low bits back into `MIP` (bits `VSSIP`, `VSTIP`, `VSEIP`,
/// `SGEIP`).
const HIP_TO_MIP_MASK: u64 = 0x1444;

/// Shifts S-level interrupt bits (`SSIP`=1, `STIP`=5, `SEIP`=9) up by one to the corresponding
/// VS bits; all other bits are dropped.
pub fn s_interrupt_to_vs(v: u64) -> u64 {
    let mut out = 0;
    for s_bit in [1u32, 5, 9] {
        if v & (1 << s_bit) != 0 {
            out |= 1 << (s_bit + 1);
        }
    }
    out
}

/// Inverse of [`s_interrupt_to_vs`]: shifts VS bits (2, 6, 10) down by one to S bits.
pub fn vs_interrupt_to_s(v: u64) -> u64 {
    let mut out = 0;
    for vs_bit in [2u32, 6, 10] {
        if v & (1 << vs_bit) != 0 {
            out |= 1 << (vs_bit - 1);
        }
    }
    out
}

/// §4.3.A: recompute `VSIE`/`VSIP`'s shared read/write mask from `HIDELEG`/`HVIEN`.
pub fn update_vsie_vsip_masks<I: Imsic, T: TriggerModule, P: PmpView>(file: &mut CsrFile<I, T, P>) {
    let hideleg = file.raw(HIDELEG);
    let hvien = file.raw(HVIEN);

    let mut mask = ((hideleg & LOW13) >> 1) | (hideleg & !LOW13);
    mask |= hvien & !LOW13;
    if file.sscofpmf_enabled && (hvien & LCOF_MASK) != 0 {
        mask |= LCOF_MASK;
    } else {
        mask &= !LCOF_MASK;
    }

    for num in [VSIE, VSIP] {
        if let Some(entry) = file.entries.get_mut(&num) {
            entry.write_mask = mask;
            entry.read_mask = mask;
        }
    }
}

/// §4.3.B: the VSIP write path, run with the just-written raw value of `VSIP`.
pub fn vsip_write_path<I: Imsic, T: TriggerModule, P: PmpView>(file: &mut CsrFile<I, T, P>, value: u64) {
    let hideleg = file.raw(HIDELEG);
    let hvien = file.raw(HVIEN);
    let vsip_write_mask = file.entries.get(&VSIP).map(|e| e.write_mask).unwrap_or(0);

    let hip_mask = VSSIP_BIT & hideleg;
    let hip = file.raw(HIP);
    file.set_raw(HIP, (hip & !hip_mask) | (s_interrupt_to_vs(value) & hip_mask));

    let mvip_mask = !LOW13 & hideleg & vsip_write_mask;
    let sip_read = file.raw(SIP);
    file.set_raw(SIP, (value & mvip_mask) | (sip_read & !mvip_mask));

    let hvip_mask = !LOW13 & vsip_write_mask & !hideleg & hvien;
    let hvip = file.raw(HVIP);
    file.set_raw(HVIP, (hvip & !hvip_mask) | (value & hvip_mask));
}

/// §4.3.C, first bullet: the `MVIP` write path. `bug4248_quirk` reproduces a known RTL
/// divergence where bit 1 of `MVIP` is always written regardless of `MVIEN` aliasing; see
/// [`CsrFile::set_legalize_mvip_bug4248`].
pub fn write_mvip<I: Imsic, T: TriggerModule, P: PmpView>(
    file: &mut CsrFile<I, T, P>,
    value: u64,
    bug4248_quirk: bool,
) {
    let mvien = file.raw(MVIEN);
    let mip_write_mask = file.entries.get(&MIP).map(|e| e.write_mask).unwrap_or(0);

    let mut shadow_mask = 0u64;
    for bit in [1u32, 5] {
        let b = 1u64 << bit;
        if mvien & b == 0 && mip_write_mask & b != 0 {
            shadow_mask |= b;
        }
    }
    // Bit 9 always writable in MVIP; its MIP.SEIP aliasing takes effect on MIP's own read.
    shadow_mask |= 1 << 9;

    let mvip = file.raw(MVIP);
    let mut new_mvip = (mvip & !shadow_mask) | (value & shadow_mask);
    if bug4248_quirk {
        // Matches RTL: bit 1 is written unconditionally, even when MVIEN would otherwise gate it.
        new_mvip = (new_mvip & !2) | (value & 2);
    }
    file.set_raw(MVIP, new_mvip);

    // Bits {1,5} of MIP shadow MVIP when MVIEN enables the alias and the bit isn't directly
    // writeable in MIP.
    let mut mip_shadow_mask = 0u64;
    for bit in [1u32, 5] {
        let b = 1u64 << bit;
        if mvien & b != 0 && mip_write_mask & b == 0 {
            mip_shadow_mask |= b;
        }
    }
    if mip_shadow_mask != 0 {
        let mip = file.raw(MIP);
        file.set_raw(MIP, (mip & !mip_shadow_mask) | (new_mvip & mip_shadow_mask));
    }
}

/// §4.3.C, second bullet: writing `SIP` when `MIDELEG=0 ∧ MVIEN=1` redirects the affected bit
/// to `MVIP` instead of `MIP`. Bits 5 and 9 are always read-only in `SIP`.
pub fn write_sip<I: Imsic, T: TriggerModule, P: PmpView>(file: &mut CsrFile<I, T, P>, value: u64) {
    let mideleg = file.raw(MIDELEG);
    let mvien = file.raw(MVIEN);
    let sip_write_mask = file.entries.get(&SIP).map(|e| e.write_mask).unwrap_or(0) & !(1 << 5) & !(1 << 9);

    let mut mvip_redirect_mask = 0u64;
    let mut direct_mask = 0u64;
    for bit in 0..13u32 {
        let b = 1u64 << bit;
        if sip_write_mask & b == 0 {
            continue;
        }
        if mideleg & b == 0 && mvien & b != 0 {
            mvip_redirect_mask |= b;
        } else {
            direct_mask |= b;
        }
    }

    if mvip_redirect_mask != 0 {
        let mvip = file.raw(MVIP);
        file.set_raw(MVIP, (mvip & !mvip_redirect_mask) | (value & mvip_redirect_mask));
    }
    if direct_mask != 0 {
        let mip = file.raw(MIP);
        file.set_raw(MIP, (mip & !direct_mask) | (value & direct_mask));
    }
}

/// §4.3.D: `writeSie` updates the private shadow word in addition to the tied `SIE`/`MIE` word.
/// Shadow bits are those enabled in `MVIEN` but not delegated by `MIDELEG` — they decouple from
/// `MIE` entirely.
pub fn write_sie<I: Imsic, T: TriggerModule, P: PmpView>(file: &mut CsrFile<I, T, P>, value: u64) {
    let mideleg = file.raw(MIDELEG);
    let mvien = file.raw(MVIEN);
    let shadow_mask = mvien & !mideleg;

    file.shadow_sie = (file.shadow_sie & !shadow_mask) | (value & shadow_mask);

    let mie = file.raw(MIE);
    let direct_mask = mideleg & !shadow_mask;
    file.set_raw(MIE, (mie & !direct_mask) | (value & direct_mask));
}

/// The effective (readable) value of `SIE`: the tied `MIE` bits delegated by `MIDELEG`, plus the
/// private shadow bits gated by `MVIEN`.
pub fn effective_sie<I: Imsic, T: TriggerModule, P: PmpView>(file: &CsrFile<I, T, P>) -> u64 {
    let mideleg = file.raw(MIDELEG);
    let mvien = file.raw(MVIEN);
    (file.raw(MIE) & mideleg) | (file.shadow_sie & mvien & !mideleg)
}

/// The effective (readable) value of `SIP`: `MIP` bits delegated by `MIDELEG`. `MVIP`'s shadow
/// bits surface through `MIP` itself (see [`write_mvip`]), so no separate shadow term is needed
/// here.
pub fn effective_sip<I: Imsic, T: TriggerModule, P: PmpView>(file: &CsrFile<I, T, P>) -> u64 {
    file.raw(MIP) & file.raw(MIDELEG)
}

/// Mirror rules triggered by a write to `primary`. Every arm writes dependent registers directly
/// and does not recurse back into [`propagate`].
pub fn propagate<I: Imsic, T: TriggerModule, P: PmpView>(file: &mut CsrFile<I, T, P>, primary: CsrSpecifier) {
    match primary {
        HIDELEG | HVIEN => update_vsie_vsip_masks(file),
        MIP => {
            let bit = file.raw(MIP) & VSSIP_BIT;
            let hip = file.raw(HIP);
            file.set_raw(HIP, (hip & !VSSIP_BIT) | bit);
        }
        HIP => {
            let hip = file.raw(HIP);
            let mip = file.raw(MIP);
            file.set_raw(MIP, (mip & !HIP_TO_MIP_MASK) | (hip & HIP_TO_MIP_MASK));
        }
        HVIP => {
            let bit = file.raw(HVIP) & VSSIP_BIT;
            let hip = file.raw(HIP);
            file.set_raw(HIP, (hip & !VSSIP_BIT) | bit);
        }
        HGEIP | HGEIE | HSTATUS => recompute_hip_guest_bits(file),
        VSIP => {
            let value = file.raw(VSIP);
            vsip_write_path(file, value);
        }
        HIE => {
            mirror_all(file, HIE, &[MIE, VSIE]);
        }
        MIE => {
            mirror_all(file, MIE, &[HIE, VSIE]);
        }
        VSIE => {
            mirror_all(file, VSIE, &[MIE, HIE]);
            // Bits >= 13 (e.g. LCOF) also surface in SIE.
            let vsie = file.raw(VSIE);
            let sie = file.raw(SIE);
            file.set_raw(SIE, (sie & LOW13) | (vsie & !LOW13));
        }
        _ => {}
    }
}

fn mirror_all<I: Imsic, T: TriggerModule, P: PmpView>(
    file: &mut CsrFile<I, T, P>,
    source: CsrSpecifier,
    targets: &[CsrSpecifier],
) {
    let value = file.raw(source);
    for &target in targets {
        file.set_raw(target, value);
    }
}

/// Recomputes `HIP.SGEIP` (bit 12, `HGEIP & HGEIE != 0`) and `HIP.VSEIP` (bit 10,
/// `HVIP.VSEIP | HGEIP[VGEIN]`), both of which depend on `HSTATUS.VGEIN`.
fn recompute_hip_guest_bits<I: Imsic, T: TriggerModule, P: PmpView>(file: &mut CsrFile<I, T, P>) {
    let hgeip = file.raw(HGEIP);
    let hgeie = file.raw(HGEIE);
    let vgein = ((file.raw(HSTATUS) >> 12) & 0x3f) as u32;

    let sgeip_bit = if hgeip & hgeie != 0 { 1u64 << 12 } else { 0 };
    let guest_pending = if vgein != 0 && hgeip & (1 << vgein) != 0 {
        1u64 << 10
    } else {
        0
    };
    let hvip_vseip = file.raw(HVIP) & (1 << 10);

    let hip = file.raw(HIP);
    let new_hip = (hip & !((1 << 12) | (1 << 10)))
        | sgeip_bit
        | guest_pending
        | hvip_vseip;
    file.set_raw(HIP, new_hip);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::traits::mock::{MockImsic, MockPmpView, MockTriggerModule};
    use crate::Xlen;

    fn file() -> CsrFile<MockImsic, MockTriggerModule, MockPmpView> {
        CsrFile::new(
            Xlen::Rv64,
            MockImsic::default(),
            MockTriggerModule::default(),
            MockPmpView::default(),
        )
    }

    #[test]
    fn update_vsie_vsip_masks_follows_hideleg_and_hvien() {
        let mut f = file();
        // HIDELEG bit 1 (SSIP) -> mask bit 0 (VSSIP shifted down); HVIEN bit 13 (LCOF) passes
        // through unshifted once Sscofpmf is enabled.
        f.set_raw(HIDELEG, 1 << 1);
        f.set_raw(HVIEN, 1 << 13);
        f.sscofpmf_enabled = true;
        update_vsie_vsip_masks(&mut f);

        let mask = f.entries.get(&VSIP).unwrap().write_mask;
        assert_eq!(mask, 1 | (1 << 13));
        assert_eq!(f.entries.get(&VSIE).unwrap().read_mask, mask);
    }

    #[test]
    fn update_vsie_vsip_masks_clears_lcof_when_sscofpmf_disabled() {
        let mut f = file();
        f.set_raw(HVIEN, 1 << 13);
        f.sscofpmf_enabled = false;
        update_vsie_vsip_masks(&mut f);
        assert_eq!(f.entries.get(&VSIP).unwrap().write_mask & LCOF_MASK, 0);
    }

    #[test]
    fn vsip_write_path_sets_hip_vssip_when_delegated() {
        let mut f = file();
        f.set_raw(HIDELEG, VSSIP_BIT);
        update_vsie_vsip_masks(&mut f);
        vsip_write_path(&mut f, VSSIP_BIT >> 1); // SSIP bit, shifts up to VSSIP in HIP.
        assert_eq!(f.raw(HIP) & VSSIP_BIT, VSSIP_BIT);
    }

    #[test]
    fn vsip_write_path_redirects_to_hvip_when_not_delegated_but_hvien() {
        let mut f = file();
        // Bit 13 (LCOF) enabled via HVIEN but not delegated via HIDELEG: above LOW13, so it
        // routes to HVIP rather than SIP (which only mirrors HIDELEG-delegated bits).
        let lcof = 1u64 << 13;
        f.set_raw(HVIEN, lcof);
        f.sscofpmf_enabled = true;
        update_vsie_vsip_masks(&mut f);
        vsip_write_path(&mut f, lcof);
        assert_eq!(f.raw(HVIP) & lcof, lcof);
        assert_eq!(f.raw(SIP) & lcof, 0);
    }

    #[test]
    fn write_mvip_bug4248_quirk_forces_bit1_regardless_of_mvien() {
        let mut f = file();
        // MVIEN bit 1 set -> MIP (not MVIP) normally owns bit 1 here, so a plain MVIP write
        // would leave MVIP's own bit 1 untouched; the quirk writes it unconditionally anyway.
        f.set_raw(MVIEN, 1 << 1);
        write_mvip(&mut f, 1 << 1, true);
        assert_eq!(f.raw(MVIP) & (1 << 1), 1 << 1);
    }

    #[test]
    fn write_mvip_without_quirk_respects_mvien_gating() {
        let mut f = file();
        f.set_raw(MVIEN, 1 << 1);
        write_mvip(&mut f, 1 << 1, false);
        assert_eq!(f.raw(MVIP) & (1 << 1), 0);
    }

    #[test]
    fn write_sie_splits_shadow_and_direct_bits() {
        let mut f = file();
        // Bit 1 delegated via MIDELEG -> direct MIE write. Bit 13 only enabled via MVIEN (not
        // delegated) -> shadow-only, must not touch MIE.
        f.set_raw(MIDELEG, 1 << 1);
        f.set_raw(MVIEN, 1 << 13);
        write_sie(&mut f, (1 << 1) | (1 << 13));

        assert_eq!(f.raw(MIE) & (1 << 1), 1 << 1);
        assert_eq!(f.raw(MIE) & (1 << 13), 0);
        assert_eq!(f.shadow_sie & (1 << 13), 1 << 13);
    }

    #[test]
    fn effective_sie_combines_mie_and_shadow() {
        let mut f = file();
        f.set_raw(MIDELEG, 1 << 1);
        f.set_raw(MVIEN, 1 << 13);
        write_sie(&mut f, (1 << 1) | (1 << 13));
        assert_eq!(effective_sie(&f), (1 << 1) | (1 << 13));
    }

    #[test]
    fn effective_sip_masks_mip_by_mideleg() {
        let mut f = file();
        f.set_raw(MIDELEG, 1 << 1);
        f.set_raw(MIP, (1 << 1) | (1 << 3));
        assert_eq!(effective_sip(&f), 1 << 1);
    }
}
