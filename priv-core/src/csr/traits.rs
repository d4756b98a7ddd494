//! Narrow capability traits the CSR engine needs from its collaborators.
//!
//! The engine must not depend on the internal representation of the IMSIC device, the debug
//! trigger module, or the PMP manager; it only calls through these interfaces. Mock
//! implementations live in [`mock`] for use by tests.

use crate::csr::specifiers::CsrSpecifier;

/// What the CSR engine needs from the Incoming MSI Controller.
pub trait Imsic {
    /// Number of guest interrupt files configured for this hart (`HSTATUS.VGEIN` must be
    /// `1..=guest_count()` to be valid).
    fn guest_count(&self) -> u32;

    /// The highest-priority pending/enabled interrupt id for guest file `vgein`, or `0`.
    fn guest_top_id(&self, vgein: u32) -> u32;

    /// The highest-priority pending/enabled interrupt id for the machine or supervisor file
    /// selected by `miselect`/`siselect`, or `0`.
    fn top_id(&self, privilege: crate::RawPrivilegeLevel) -> u32;

    /// Read an indirectly-addressed IMSIC register through `*ISELECT`.
    fn read_indirect(&self, privilege: crate::RawPrivilegeLevel, select: u64) -> u64;

    /// Write an indirectly-addressed IMSIC register through `*ISELECT`.
    fn write_indirect(&mut self, privilege: crate::RawPrivilegeLevel, select: u64, value: u64);
}

/// What the CSR engine needs from the debug trigger module (`TDATA1..TINFO`).
pub trait TriggerModule {
    fn read_data1(&self, trigger: u64) -> Option<u64>;
    fn read_data2(&self, trigger: u64) -> Option<u64>;
    fn read_data3(&self, trigger: u64) -> Option<u64>;
    fn read_info(&self, trigger: u64) -> Option<u64>;

    fn write_data1(&mut self, trigger: u64, value: u64) -> bool;
    fn write_data2(&mut self, trigger: u64, value: u64) -> bool;
    fn write_data3(&mut self, trigger: u64, value: u64) -> bool;

    fn has_active_trigger(&self) -> bool;
}

/// What the CSR engine needs from the PMP manager in order to legalize `PMPADDR*` reads (NAPOT
/// expansion masks a PMPADDR to the implementation's physical-address-bit count).
pub trait PmpView {
    /// Number of implemented physical address bits.
    fn address_bits(&self) -> u32;

    /// `true` if the given `PMPCFG` entry's L bit is locked, and (for a TOR-mode neighbour) the
    /// address below it must also be treated as locked.
    fn is_locked(&self, pmp_entry: usize) -> bool;

    /// Specifier offset (`0..64`) of the PMPCFG covering `pmp_entry`'s config byte.
    fn pmpcfg_byte(&self, pmp_entry: usize) -> u8;
}

/// Mock collaborator implementations for unit tests.
pub mod mock {
    use super::*;

    #[derive(Debug, Default)]
    pub struct MockImsic {
        pub guest_count: u32,
        pub guest_top_ids: std::collections::HashMap<u32, u32>,
        pub machine_top_id: u32,
        pub supervisor_top_id: u32,
    }

    impl Imsic for MockImsic {
        fn guest_count(&self) -> u32 {
            self.guest_count
        }

        fn guest_top_id(&self, vgein: u32) -> u32 {
            self.guest_top_ids.get(&vgein).copied().unwrap_or(0)
        }

        fn top_id(&self, privilege: crate::RawPrivilegeLevel) -> u32 {
            match privilege {
                crate::RawPrivilegeLevel::Machine => self.machine_top_id,
                _ => self.supervisor_top_id,
            }
        }

        fn read_indirect(&self, _privilege: crate::RawPrivilegeLevel, _select: u64) -> u64 {
            0
        }

        fn write_indirect(
            &mut self,
            _privilege: crate::RawPrivilegeLevel,
            _select: u64,
            _value: u64,
        ) {
        }
    }

    #[derive(Debug, Default)]
    pub struct MockTriggerModule {
        pub data: std::collections::HashMap<(u64, CsrSpecifier), u64>,
        pub active: bool,
    }

    impl TriggerModule for MockTriggerModule {
        fn read_data1(&self, trigger: u64) -> Option<u64> {
            self.data.get(&(trigger, crate::csr::specifiers::TDATA1)).copied()
        }

        fn read_data2(&self, trigger: u64) -> Option<u64> {
            self.data.get(&(trigger, crate::csr::specifiers::TDATA2)).copied()
        }

        fn read_data3(&self, trigger: u64) -> Option<u64> {
            self.data.get(&(trigger, crate::csr::specifiers::TDATA3)).copied()
        }

        fn read_info(&self, _trigger: u64) -> Option<u64> {
            Some(0)
        }

        fn write_data1(&mut self, trigger: u64, value: u64) -> bool {
            self.data.insert((trigger, crate::csr::specifiers::TDATA1), value);
            true
        }

        fn write_data2(&mut self, trigger: u64, value: u64) -> bool {
            self.data.insert((trigger, crate::csr::specifiers::TDATA2), value);
            true
        }

        fn write_data3(&mut self, trigger: u64, value: u64) -> bool {
            self.data.insert((trigger, crate::csr::specifiers::TDATA3), value);
            true
        }

        fn has_active_trigger(&self) -> bool {
            self.active
        }
    }

    #[derive(Debug, Clone, Copy)]
    pub struct MockPmpView {
        pub address_bits: u32,
    }

    impl Default for MockPmpView {
        fn default() -> Self {
            Self { address_bits: 34 }
        }
    }

    impl PmpView for MockPmpView {
        fn address_bits(&self) -> u32 {
            self.address_bits
        }

        fn is_locked(&self, _pmp_entry: usize) -> bool {
            false
        }

        fn pmpcfg_byte(&self, pmp_entry: usize) -> u8 {
            (pmp_entry % 4) as u8
        }
    }
}
