//! Specifiers for all supported CSRs.

use crate::RawPrivilegeLevel;

/// General 12-bit value representing a CSR specifier. Note that this can hold any 12-bit value,
/// even if the value represents an unsupported or non-existent CSR.
pub type CsrSpecifier = u16;

//
// Unprivileged floating-point CSRs (`0x001..=0x003`).
//
/// Floating-point accrued exceptions.
pub const FFLAGS: CsrSpecifier = 0x001;
/// Floating-point dynamic rounding mode.
pub const FRM: CsrSpecifier = 0x002;
/// Floating-point CSR ([`FRM`] + [`FFLAGS`]).
pub const FCSR: CsrSpecifier = 0x003;

//
// Unprivileged counters/timers (`0xC00..=0xC1F`, `0xC80..=0xC9F`).
//
/// Cycle counter for RDCYCLE instruction.
pub const CYCLE: CsrSpecifier = 0xC00;
/// Timer for RDTIME instruction.
pub const TIME: CsrSpecifier = 0xC01;
/// Instructions-retired counter for RDINSTRET instruction.
pub const INSTRET: CsrSpecifier = 0xC02;
/// Performance-monitoring counter.
pub const HPMCOUNTER3: CsrSpecifier = 0xC03;
/// Performance-monitoring counter.
pub const HPMCOUNTER4: CsrSpecifier = 0xC04;
/// Performance-monitoring counter.
pub const HPMCOUNTER5: CsrSpecifier = 0xC05;
/// Performance-monitoring counter.
pub const HPMCOUNTER6: CsrSpecifier = 0xC06;
/// Performance-monitoring counter.
pub const HPMCOUNTER7: CsrSpecifier = 0xC07;
/// Performance-monitoring counter.
pub const HPMCOUNTER8: CsrSpecifier = 0xC08;
/// Performance-monitoring counter.
pub const HPMCOUNTER9: CsrSpecifier = 0xC09;
/// Performance-monitoring counter.
pub const HPMCOUNTER10: CsrSpecifier = 0xC0A;
/// Performance-monitoring counter.
pub const HPMCOUNTER11: CsrSpecifier = 0xC0B;
/// Performance-monitoring counter.
pub const HPMCOUNTER12: CsrSpecifier = 0xC0C;
/// Performance-monitoring counter.
pub const HPMCOUNTER13: CsrSpecifier = 0xC0D;
/// Performance-monitoring counter.
pub const HPMCOUNTER14: CsrSpecifier = 0xC0E;
/// Performance-monitoring counter.
pub const HPMCOUNTER15: CsrSpecifier = 0xC0F;
/// Performance-monitoring counter.
pub const HPMCOUNTER16: CsrSpecifier = 0xC10;
/// Performance-monitoring counter.
pub const HPMCOUNTER17: CsrSpecifier = 0xC11;
/// Performance-monitoring counter.
pub const HPMCOUNTER18: CsrSpecifier = 0xC12;
/// Performance-monitoring counter.
pub const HPMCOUNTER19: CsrSpecifier = 0xC13;
/// Performance-monitoring counter.
pub const HPMCOUNTER20: CsrSpecifier = 0xC14;
/// Performance-monitoring counter.
pub const HPMCOUNTER21: CsrSpecifier = 0xC15;
/// Performance-monitoring counter.
pub const HPMCOUNTER22: CsrSpecifier = 0xC16;
/// Performance-monitoring counter.
pub const HPMCOUNTER23: CsrSpecifier = 0xC17;
/// Performance-monitoring counter.
pub const HPMCOUNTER24: CsrSpecifier = 0xC18;
/// Performance-monitoring counter.
pub const HPMCOUNTER25: CsrSpecifier = 0xC19;
/// Performance-monitoring counter.
pub const HPMCOUNTER26: CsrSpecifier = 0xC1A;
/// Performance-monitoring counter.
pub const HPMCOUNTER27: CsrSpecifier = 0xC1B;
/// Performance-monitoring counter.
pub const HPMCOUNTER28: CsrSpecifier = 0xC1C;
/// Performance-monitoring counter.
pub const HPMCOUNTER29: CsrSpecifier = 0xC1D;
/// Performance-monitoring counter.
pub const HPMCOUNTER30: CsrSpecifier = 0xC1E;
/// Performance-monitoring counter.
pub const HPMCOUNTER31: CsrSpecifier = 0xC1F;
// RV32-only registers for the upper 32 bits of all counter registers.
/// Upper 32 bits of [`CYCLE`], RV32 only.
pub const CYCLEH: CsrSpecifier = 0xC80;
/// Upper 32 bits of [`TIME`], RV32 only.
pub const TIMEH: CsrSpecifier = 0xC81;
/// Upper 32 bits of [`INSTRET`], RV32 only.
pub const INSTRETH: CsrSpecifier = 0xC82;
/// Upper 32 bits of [`HPMCOUNTER3`], RV32 only.
pub const HPMCOUNTER3H: CsrSpecifier = 0xC83;
/// Upper 32 bits of [`HPMCOUNTER4`], RV32 only.
pub const HPMCOUNTER4H: CsrSpecifier = 0xC84;
/// Upper 32 bits of [`HPMCOUNTER5`], RV32 only.
pub const HPMCOUNTER5H: CsrSpecifier = 0xC85;
/// Upper 32 bits of [`HPMCOUNTER6`], RV32 only.
pub const HPMCOUNTER6H: CsrSpecifier = 0xC86;
/// Upper 32 bits of [`HPMCOUNTER7`], RV32 only.
pub const HPMCOUNTER7H: CsrSpecifier = 0xC87;
/// Upper 32 bits of [`HPMCOUNTER8`], RV32 only.
pub const HPMCOUNTER8H: CsrSpecifier = 0xC88;
/// Upper 32 bits of [`HPMCOUNTER9`], RV32 only.
pub const HPMCOUNTER9H: CsrSpecifier = 0xC89;
/// Upper 32 bits of [`HPMCOUNTER10`], RV32 only.
pub const HPMCOUNTER10H: CsrSpecifier = 0xC8A;
/// Upper 32 bits of [`HPMCOUNTER11`], RV32 only.
pub const HPMCOUNTER11H: CsrSpecifier = 0xC8B;
/// Upper 32 bits of [`HPMCOUNTER12`], RV32 only.
pub const HPMCOUNTER12H: CsrSpecifier = 0xC8C;
/// Upper 32 bits of [`HPMCOUNTER13`], RV32 only.
pub const HPMCOUNTER13H: CsrSpecifier = 0xC8D;
/// Upper 32 bits of [`HPMCOUNTER14`], RV32 only.
pub const HPMCOUNTER14H: CsrSpecifier = 0xC8E;
/// Upper 32 bits of [`HPMCOUNTER15`], RV32 only.
pub const HPMCOUNTER15H: CsrSpecifier = 0xC8F;
/// Upper 32 bits of [`HPMCOUNTER16`], RV32 only.
pub const HPMCOUNTER16H: CsrSpecifier = 0xC90;
/// Upper 32 bits of [`HPMCOUNTER17`], RV32 only.
pub const HPMCOUNTER17H: CsrSpecifier = 0xC91;
/// Upper 32 bits of [`HPMCOUNTER18`], RV32 only.
pub const HPMCOUNTER18H: CsrSpecifier = 0xC92;
/// Upper 32 bits of [`HPMCOUNTER19`], RV32 only.
pub const HPMCOUNTER19H: CsrSpecifier = 0xC93;
/// Upper 32 bits of [`HPMCOUNTER20`], RV32 only.
pub const HPMCOUNTER20H: CsrSpecifier = 0xC94;
/// Upper 32 bits of [`HPMCOUNTER21`], RV32 only.
pub const HPMCOUNTER21H: CsrSpecifier = 0xC95;
/// Upper 32 bits of [`HPMCOUNTER22`], RV32 only.
pub const HPMCOUNTER22H: CsrSpecifier = 0xC96;
/// Upper 32 bits of [`HPMCOUNTER23`], RV32 only.
pub const HPMCOUNTER23H: CsrSpecifier = 0xC97;
/// Upper 32 bits of [`HPMCOUNTER24`], RV32 only.
pub const HPMCOUNTER24H: CsrSpecifier = 0xC98;
/// Upper 32 bits of [`HPMCOUNTER25`], RV32 only.
pub const HPMCOUNTER25H: CsrSpecifier = 0xC99;
/// Upper 32 bits of [`HPMCOUNTER26`], RV32 only.
pub const HPMCOUNTER26H: CsrSpecifier = 0xC9A;
/// Upper 32 bits of [`HPMCOUNTER27`], RV32 only.
pub const HPMCOUNTER27H: CsrSpecifier = 0xC9B;
/// Upper 32 bits of [`HPMCOUNTER28`], RV32 only.
pub const HPMCOUNTER28H: CsrSpecifier = 0xC9C;
/// Upper 32 bits of [`HPMCOUNTER29`], RV32 only.
pub const HPMCOUNTER29H: CsrSpecifier = 0xC9D;
/// Upper 32 bits of [`HPMCOUNTER30`], RV32 only.
pub const HPMCOUNTER30H: CsrSpecifier = 0xC9E;
/// Upper 32 bits of [`HPMCOUNTER31`], RV32 only.
pub const HPMCOUNTER31H: CsrSpecifier = 0xC9F;

//
// Supervisor trap setup (`0x100`, `0x104..=0x106`).
//
/// Supervisor status register.
pub const SSTATUS: CsrSpecifier = 0x100;
/// Supervisor interrupt-enable register.
pub const SIE: CsrSpecifier = 0x104;
/// Supervisor trap handler base address.
pub const STVEC: CsrSpecifier = 0x105;
/// Supervisor counter enable.
pub const SCOUNTEREN: CsrSpecifier = 0x106;

//
// Supervisor configuration (`0x10A`).
//
/// Supervisor environment configuration register.
pub const SENVCFG: CsrSpecifier = 0x10A;

//
// Supervisor trap handling (`0x140..=0x144`).
//
/// Scratch register for supervisor trap handling.
pub const SSCRATCH: CsrSpecifier = 0x140;
/// Supervisor exception program counter.
pub const SEPC: CsrSpecifier = 0x141;
/// Supervisor trap cause.
pub const SCAUSE: CsrSpecifier = 0x142;
/// Supervisor bad address or instruction.
pub const STVAL: CsrSpecifier = 0x143;
/// Supervisor interrupt pending.
pub const SIP: CsrSpecifier = 0x144;

//
// Supervisor protection and translation (`0x180`).
//
/// Supervisor address translation and protection.
pub const SATP: CsrSpecifier = 0x180;

//
// Debug/trace registers (`0x5A8`).
//
/// Supervisor-mode context register.
pub const SCONTEXT: CsrSpecifier = 0x5A8;

//
// Machine information registers (`0xF11..=0xF15`).
//
/// Vendor ID.
pub const MVENDORID: CsrSpecifier = 0xF11;
/// Architecture ID.
pub const MARCHID: CsrSpecifier = 0xF12;
/// Implementation ID.
pub const MIMPID: CsrSpecifier = 0xF13;
/// Hardware thead ID.
pub const MHARTID: CsrSpecifier = 0xF14;
/// Pointer to configuration data structure.
pub const MCONFIGPTR: CsrSpecifier = 0xF15;

//
// Machine trap setup (`0x300..=0x306`, `0x310`).
//
/// Machine status register.
pub const MSTATUS: CsrSpecifier = 0x300;
/// ISA and extensions.
pub const MISA: CsrSpecifier = 0x301;
/// Machine exception delegation register.
pub const MEDELEG: CsrSpecifier = 0x302;
/// Machine interrupt delegation register.
pub const MIDELEG: CsrSpecifier = 0x303;
/// Machine interrupt-enable register.
pub const MIE: CsrSpecifier = 0x304;
/// Machine trap-handle base address.
pub const MTVEC: CsrSpecifier = 0x305;
/// Machine counter enable.
pub const MCOUNTEREN: CsrSpecifier = 0x306;
/// Additional machine status register, RV32 only.
pub const MSTATUSH: CsrSpecifier = 0x310;

//
// Machine trap handling (`0x340..=0x344`, `0x34A..=0x34B`).
//
/// Scratch register for machine trap handlers.
pub const MSCRATCH: CsrSpecifier = 0x340;
/// Machine exception program counter.
pub const MEPC: CsrSpecifier = 0x341;
/// Machine trap cause.
pub const MCAUSE: CsrSpecifier = 0x342;
/// Machine bad address or instruction.
pub const MTVAL: CsrSpecifier = 0x343;
/// Machine interrupt pending.
pub const MIP: CsrSpecifier = 0x344;
/// Machine trap instruction (transformed).
pub const MTINST: CsrSpecifier = 0x34A;
/// Machine bad guest physical address.
pub const MTVAL2: CsrSpecifier = 0x34B;

//
// Machine configuration (`0x30A`, `0x31A`, `0x747`, `0x757`).
//
/// Machine environment configuration register.
pub const MENVCFG: CsrSpecifier = 0x30A;
/// Additional machine environment configuration register, RV32 only.
pub const MENVCFGH: CsrSpecifier = 0x31A;
/// Machine security configuration register.
pub const MSECCFG: CsrSpecifier = 0x747;
/// Additional machine security configuration register, RV32 only.
pub const MSECCFGH: CsrSpecifier = 0x757;

//
// Machine memory protection (`0x3A0..=0x3EF`).
//
/// Physical memory protection configuration.
pub const PMPCFG0: CsrSpecifier = 0x3A0;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG1: CsrSpecifier = 0x3A1;
/// Physical memory protection configuration.
pub const PMPCFG2: CsrSpecifier = 0x3A2;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG3: CsrSpecifier = 0x3A3;
/// Physical memory protection configuration.
pub const PMPCFG4: CsrSpecifier = 0x3A4;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG5: CsrSpecifier = 0x3A5;
/// Physical memory protection configuration.
pub const PMPCFG6: CsrSpecifier = 0x3A6;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG7: CsrSpecifier = 0x3A7;
/// Physical memory protection configuration.
pub const PMPCFG8: CsrSpecifier = 0x3A8;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG9: CsrSpecifier = 0x3A9;
/// Physical memory protection configuration.
pub const PMPCFG10: CsrSpecifier = 0x3AA;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG11: CsrSpecifier = 0x3AB;
/// Physical memory protection configuration.
pub const PMPCFG12: CsrSpecifier = 0x3AC;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG13: CsrSpecifier = 0x3AD;
/// Physical memory protection configuration.
pub const PMPCFG14: CsrSpecifier = 0x3AE;
/// Physical memory protection configuration, RV32 only.
pub const PMPCFG15: CsrSpecifier = 0x3AF;
/// Physical memory protection address register.
pub const PMPADDR0: CsrSpecifier = 0x3B0;
/// Physical memory protection address register.
pub const PMPADDR1: CsrSpecifier = 0x3B1;
/// Physical memory protection address register.
pub const PMPADDR2: CsrSpecifier = 0x3B2;
/// Physical memory protection address register.
pub const PMPADDR3: CsrSpecifier = 0x3B3;
/// Physical memory protection address register.
pub const PMPADDR4: CsrSpecifier = 0x3B4;
/// Physical memory protection address register.
pub const PMPADDR5: CsrSpecifier = 0x3B5;
/// Physical memory protection address register.
pub const PMPADDR6: CsrSpecifier = 0x3B6;
/// Physical memory protection address register.
pub const PMPADDR7: CsrSpecifier = 0x3B7;
/// Physical memory protection address register.
pub const PMPADDR8: CsrSpecifier = 0x3B8;
/// Physical memory protection address register.
pub const PMPADDR9: CsrSpecifier = 0x3B9;
/// Physical memory protection address register.
pub const PMPADDR10: CsrSpecifier = 0x3BA;
/// Physical memory protection address register.
pub const PMPADDR11: CsrSpecifier = 0x3BB;
/// Physical memory protection address register.
pub const PMPADDR12: CsrSpecifier = 0x3BC;
/// Physical memory protection address register.
pub const PMPADDR13: CsrSpecifier = 0x3BD;
/// Physical memory protection address register.
pub const PMPADDR14: CsrSpecifier = 0x3BE;
/// Physical memory protection address register.
pub const PMPADDR15: CsrSpecifier = 0x3BF;
/// Physical memory protection address register.
pub const PMPADDR16: CsrSpecifier = 0x3C0;
/// Physical memory protection address register.
pub const PMPADDR17: CsrSpecifier = 0x3C1;
/// Physical memory protection address register.
pub const PMPADDR18: CsrSpecifier = 0x3C2;
/// Physical memory protection address register.
pub const PMPADDR19: CsrSpecifier = 0x3C3;
/// Physical memory protection address register.
pub const PMPADDR20: CsrSpecifier = 0x3C4;
/// Physical memory protection address register.
pub const PMPADDR21: CsrSpecifier = 0x3C5;
/// Physical memory protection address register.
pub const PMPADDR22: CsrSpecifier = 0x3C6;
/// Physical memory protection address register.
pub const PMPADDR23: CsrSpecifier = 0x3C7;
/// Physical memory protection address register.
pub const PMPADDR24: CsrSpecifier = 0x3C8;
/// Physical memory protection address register.
pub const PMPADDR25: CsrSpecifier = 0x3C9;
/// Physical memory protection address register.
pub const PMPADDR26: CsrSpecifier = 0x3CA;
/// Physical memory protection address register.
pub const PMPADDR27: CsrSpecifier = 0x3CB;
/// Physical memory protection address register.
pub const PMPADDR28: CsrSpecifier = 0x3CC;
/// Physical memory protection address register.
pub const PMPADDR29: CsrSpecifier = 0x3CD;
/// Physical memory protection address register.
pub const PMPADDR30: CsrSpecifier = 0x3CE;
/// Physical memory protection address register.
pub const PMPADDR31: CsrSpecifier = 0x3CF;
/// Physical memory protection address register.
pub const PMPADDR32: CsrSpecifier = 0x3D0;
/// Physical memory protection address register.
pub const PMPADDR33: CsrSpecifier = 0x3D1;
/// Physical memory protection address register.
pub const PMPADDR34: CsrSpecifier = 0x3D2;
/// Physical memory protection address register.
pub const PMPADDR35: CsrSpecifier = 0x3D3;
/// Physical memory protection address register.
pub const PMPADDR36: CsrSpecifier = 0x3D4;
/// Physical memory protection address register.
pub const PMPADDR37: CsrSpecifier = 0x3D5;
/// Physical memory protection address register.
pub const PMPADDR38: CsrSpecifier = 0x3D6;
/// Physical memory protection address register.
pub const PMPADDR39: CsrSpecifier = 0x3D7;
/// Physical memory protection address register.
pub const PMPADDR40: CsrSpecifier = 0x3D8;
/// Physical memory protection address register.
pub const PMPADDR41: CsrSpecifier = 0x3D9;
/// Physical memory protection address register.
pub const PMPADDR42: CsrSpecifier = 0x3DA;
/// Physical memory protection address register.
pub const PMPADDR43: CsrSpecifier = 0x3DB;
/// Physical memory protection address register.
pub const PMPADDR44: CsrSpecifier = 0x3DC;
/// Physical memory protection address register.
pub const PMPADDR45: CsrSpecifier = 0x3DD;
/// Physical memory protection address register.
pub const PMPADDR46: CsrSpecifier = 0x3DE;
/// Physical memory protection address register.
pub const PMPADDR47: CsrSpecifier = 0x3DF;
/// Physical memory protection address register.
pub const PMPADDR48: CsrSpecifier = 0x3E0;
/// Physical memory protection address register.
pub const PMPADDR49: CsrSpecifier = 0x3E1;
/// Physical memory protection address register.
pub const PMPADDR50: CsrSpecifier = 0x3E2;
/// Physical memory protection address register.
pub const PMPADDR51: CsrSpecifier = 0x3E3;
/// Physical memory protection address register.
pub const PMPADDR52: CsrSpecifier = 0x3E4;
/// Physical memory protection address register.
pub const PMPADDR53: CsrSpecifier = 0x3E5;
/// Physical memory protection address register.
pub const PMPADDR54: CsrSpecifier = 0x3E6;
/// Physical memory protection address register.
pub const PMPADDR55: CsrSpecifier = 0x3E7;
/// Physical memory protection address register.
pub const PMPADDR56: CsrSpecifier = 0x3E8;
/// Physical memory protection address register.
pub const PMPADDR57: CsrSpecifier = 0x3E9;
/// Physical memory protection address register.
pub const PMPADDR58: CsrSpecifier = 0x3EA;
/// Physical memory protection address register.
pub const PMPADDR59: CsrSpecifier = 0x3EB;
/// Physical memory protection address register.
pub const PMPADDR60: CsrSpecifier = 0x3EC;
/// Physical memory protection address register.
pub const PMPADDR61: CsrSpecifier = 0x3ED;
/// Physical memory protection address register.
pub const PMPADDR62: CsrSpecifier = 0x3EE;
/// Physical memory protection address register.
pub const PMPADDR63: CsrSpecifier = 0x3EF;

//
// Machine counters/timers (`0xB00`, `0xB02..=0xB1F`, `0xB80..=0xB9F`).
//
/// Machine cycle counter.
pub const MCYCLE: CsrSpecifier = 0xB00;
/// Machine instructions-retired counter.
pub const MINSTRET: CsrSpecifier = 0xB02;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER3: CsrSpecifier = 0xB03;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER4: CsrSpecifier = 0xB04;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER5: CsrSpecifier = 0xB05;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER6: CsrSpecifier = 0xB06;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER7: CsrSpecifier = 0xB07;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER8: CsrSpecifier = 0xB08;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER9: CsrSpecifier = 0xB09;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER10: CsrSpecifier = 0xB0A;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER11: CsrSpecifier = 0xB0B;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER12: CsrSpecifier = 0xB0C;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER13: CsrSpecifier = 0xB0D;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER14: CsrSpecifier = 0xB0E;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER15: CsrSpecifier = 0xB0F;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER16: CsrSpecifier = 0xB10;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER17: CsrSpecifier = 0xB11;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER18: CsrSpecifier = 0xB12;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER19: CsrSpecifier = 0xB13;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER20: CsrSpecifier = 0xB14;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER21: CsrSpecifier = 0xB15;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER22: CsrSpecifier = 0xB16;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER23: CsrSpecifier = 0xB17;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER24: CsrSpecifier = 0xB18;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER25: CsrSpecifier = 0xB19;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER26: CsrSpecifier = 0xB1A;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER27: CsrSpecifier = 0xB1B;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER28: CsrSpecifier = 0xB1C;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER29: CsrSpecifier = 0xB1D;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER30: CsrSpecifier = 0xB1E;
/// Machine performance-monitoring counter.
pub const MHPMCOUNTER31: CsrSpecifier = 0xB1F;
// RV32-only registers for the upper 32 bits of all machine counter registers
/// Upper 32 bits of [`MCYCLE`], RV32 only.
pub const MCYCLEH: CsrSpecifier = 0xB80;
/// Upper 32 bits of [`MINSTRET`], RV32 only.
pub const MINSTRETH: CsrSpecifier = 0xB82;
/// Upper 32 bits of [`MHPMCOUNTER3`], RV32 only.
pub const MHPMCOUNTER3H: CsrSpecifier = 0xB83;
/// Upper 32 bits of [`MHPMCOUNTER4`], RV32 only.
pub const MHPMCOUNTER4H: CsrSpecifier = 0xB84;
/// Upper 32 bits of [`MHPMCOUNTER5`], RV32 only.
pub const MHPMCOUNTER5H: CsrSpecifier = 0xB85;
/// Upper 32 bits of [`MHPMCOUNTER6`], RV32 only.
pub const MHPMCOUNTER6H: CsrSpecifier = 0xB86;
/// Upper 32 bits of [`MHPMCOUNTER7`], RV32 only.
pub const MHPMCOUNTER7H: CsrSpecifier = 0xB87;
/// Upper 32 bits of [`MHPMCOUNTER8`], RV32 only.
pub const MHPMCOUNTER8H: CsrSpecifier = 0xB88;
/// Upper 32 bits of [`MHPMCOUNTER9`], RV32 only.
pub const MHPMCOUNTER9H: CsrSpecifier = 0xB89;
/// Upper 32 bits of [`MHPMCOUNTER10`], RV32 only.
pub const MHPMCOUNTER10H: CsrSpecifier = 0xB8A;
/// Upper 32 bits of [`MHPMCOUNTER11`], RV32 only.
pub const MHPMCOUNTER11H: CsrSpecifier = 0xB8B;
/// Upper 32 bits of [`MHPMCOUNTER12`], RV32 only.
pub const MHPMCOUNTER12H: CsrSpecifier = 0xB8C;
/// Upper 32 bits of [`MHPMCOUNTER13`], RV32 only.
pub const MHPMCOUNTER13H: CsrSpecifier = 0xB8D;
/// Upper 32 bits of [`MHPMCOUNTER14`], RV32 only.
pub const MHPMCOUNTER14H: CsrSpecifier = 0xB8E;
/// Upper 32 bits of [`MHPMCOUNTER15`], RV32 only.
pub const MHPMCOUNTER15H: CsrSpecifier = 0xB8F;
/// Upper 32 bits of [`MHPMCOUNTER16`], RV32 only.
pub const MHPMCOUNTER16H: CsrSpecifier = 0xB90;
/// Upper 32 bits of [`MHPMCOUNTER17`], RV32 only.
pub const MHPMCOUNTER17H: CsrSpecifier = 0xB91;
/// Upper 32 bits of [`MHPMCOUNTER18`], RV32 only.
pub const MHPMCOUNTER18H: CsrSpecifier = 0xB92;
/// Upper 32 bits of [`MHPMCOUNTER19`], RV32 only.
pub const MHPMCOUNTER19H: CsrSpecifier = 0xB93;
/// Upper 32 bits of [`MHPMCOUNTER20`], RV32 only.
pub const MHPMCOUNTER20H: CsrSpecifier = 0xB94;
/// Upper 32 bits of [`MHPMCOUNTER21`], RV32 only.
pub const MHPMCOUNTER21H: CsrSpecifier = 0xB95;
/// Upper 32 bits of [`MHPMCOUNTER22`], RV32 only.
pub const MHPMCOUNTER22H: CsrSpecifier = 0xB96;
/// Upper 32 bits of [`MHPMCOUNTER23`], RV32 only.
pub const MHPMCOUNTER23H: CsrSpecifier = 0xB97;
/// Upper 32 bits of [`MHPMCOUNTER24`], RV32 only.
pub const MHPMCOUNTER24H: CsrSpecifier = 0xB98;
/// Upper 32 bits of [`MHPMCOUNTER25`], RV32 only.
pub const MHPMCOUNTER25H: CsrSpecifier = 0xB99;
/// Upper 32 bits of [`MHPMCOUNTER26`], RV32 only.
pub const MHPMCOUNTER26H: CsrSpecifier = 0xB9A;
/// Upper 32 bits of [`MHPMCOUNTER27`], RV32 only.
pub const MHPMCOUNTER27H: CsrSpecifier = 0xB9B;
/// Upper 32 bits of [`MHPMCOUNTER28`], RV32 only.
pub const MHPMCOUNTER28H: CsrSpecifier = 0xB9C;
/// Upper 32 bits of [`MHPMCOUNTER29`], RV32 only.
pub const MHPMCOUNTER29H: CsrSpecifier = 0xB9D;
/// Upper 32 bits of [`MHPMCOUNTER30`], RV32 only.
pub const MHPMCOUNTER30H: CsrSpecifier = 0xB9E;
/// Upper 32 bits of [`MHPMCOUNTER31`], RV32 only.
pub const MHPMCOUNTER31H: CsrSpecifier = 0xB9F;

//
// Machine counter setup (`0x320`, `0x323..=0x33F`)
//
/// Machine counter-inhibit register.
pub const MCOUNTINHIBIT: CsrSpecifier = 0x320;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT3: CsrSpecifier = 0x323;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT4: CsrSpecifier = 0x324;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT5: CsrSpecifier = 0x325;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT6: CsrSpecifier = 0x326;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT7: CsrSpecifier = 0x327;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT8: CsrSpecifier = 0x328;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT9: CsrSpecifier = 0x329;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT10: CsrSpecifier = 0x32A;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT11: CsrSpecifier = 0x32B;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT12: CsrSpecifier = 0x32C;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT13: CsrSpecifier = 0x32D;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT14: CsrSpecifier = 0x32E;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT15: CsrSpecifier = 0x32F;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT16: CsrSpecifier = 0x330;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT17: CsrSpecifier = 0x331;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT18: CsrSpecifier = 0x332;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT19: CsrSpecifier = 0x333;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT20: CsrSpecifier = 0x334;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT21: CsrSpecifier = 0x335;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT22: CsrSpecifier = 0x336;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT23: CsrSpecifier = 0x337;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT24: CsrSpecifier = 0x338;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT25: CsrSpecifier = 0x339;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT26: CsrSpecifier = 0x33A;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT27: CsrSpecifier = 0x33B;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT28: CsrSpecifier = 0x33C;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT29: CsrSpecifier = 0x33D;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT30: CsrSpecifier = 0x33E;
/// Machine performance-monitoring event selector.
pub const MHPMEVENT31: CsrSpecifier = 0x33F;

//
// Debug/trace registers (`0x7A0..=0x7A3`, `0x7A8`)
//
/// Debug/trace trigger register select.
pub const TSELECT: CsrSpecifier = 0x7A0;
/// First debug/trace trigger data register.
pub const TDATA1: CsrSpecifier = 0x7A1;
/// Second debug/trace trigger data register.
pub const TDATA2: CsrSpecifier = 0x7A2;
/// Third debug/trace trigger data register.
pub const TDATA3: CsrSpecifier = 0x7A3;
/// Trigger type/info register.
pub const TINFO: CsrSpecifier = 0x7A4;
/// Machine-mode context register.
pub const MCONTEXT: CsrSpecifier = 0x7A8;

//
// Hypervisor trap setup (`0x600..=0x60B`).
//
/// Hypervisor status register.
pub const HSTATUS: CsrSpecifier = 0x600;
/// Hypervisor exception delegation register.
pub const HEDELEG: CsrSpecifier = 0x602;
/// Hypervisor interrupt delegation register.
pub const HIDELEG: CsrSpecifier = 0x603;
/// Hypervisor interrupt-enable register.
pub const HIE: CsrSpecifier = 0x604;
/// Hypervisor counter enable.
pub const HCOUNTEREN: CsrSpecifier = 0x606;
/// Hypervisor guest external interrupt-enable register.
pub const HGEIE: CsrSpecifier = 0x607;
/// Additional hypervisor exception delegation register, RV32 only.
pub const HEDELEGH: CsrSpecifier = 0x612;
/// Hypervisor virtual-interrupt control register.
pub const HVICTL: CsrSpecifier = 0x609;
/// Hypervisor virtual-interrupt pending register.
pub const HVIP: CsrSpecifier = 0x645;
/// Hypervisor interrupt pending register.
pub const HIP: CsrSpecifier = 0x644;
/// Additional hypervisor virtual-interrupt-enable register, RV32 only.
pub const HIDELEGH: CsrSpecifier = 0x613;
/// Hypervisor virtual-interrupt-enable co-processor register.
pub const HVIEN: CsrSpecifier = 0x608;
/// Additional hypervisor virtual-interrupt-enable register, RV32 only.
pub const HVIENH: CsrSpecifier = 0x618;
/// Hypervisor virtual-interrupt priorities register 1.
pub const HVIPRIO1: CsrSpecifier = 0x646;
/// Hypervisor virtual-interrupt priorities register 2.
pub const HVIPRIO2: CsrSpecifier = 0x647;
/// Additional hypervisor virtual-interrupt priorities register 1, RV32 only.
pub const HVIPRIO1H: CsrSpecifier = 0x656;
/// Additional hypervisor virtual-interrupt priorities register 2, RV32 only.
pub const HVIPRIO2H: CsrSpecifier = 0x657;
/// Hypervisor guest external interrupt pending.
pub const HGEIP: CsrSpecifier = 0xE12;
/// Hypervisor environment configuration register.
pub const HENVCFG: CsrSpecifier = 0x60A;
/// Additional hypervisor environment configuration register, RV32 only.
pub const HENVCFGH: CsrSpecifier = 0x61A;
/// Hypervisor guest address translation and protection.
pub const HGATP: CsrSpecifier = 0x680;
/// Hypervisor trap instruction (transformed).
pub const HTINST: CsrSpecifier = 0x64A;
/// Hypervisor bad guest physical address.
pub const HTVAL: CsrSpecifier = 0x643;
/// Delta for VS/VU-mode timer.
pub const HTIMEDELTA: CsrSpecifier = 0x605;
/// Additional delta for VS/VU-mode timer, RV32 only.
pub const HTIMEDELTAH: CsrSpecifier = 0x615;

//
// Virtual supervisor registers (`0x200..=0x24A`).
//
/// Virtual supervisor status register.
pub const VSSTATUS: CsrSpecifier = 0x200;
/// Virtual supervisor interrupt-enable register.
pub const VSIE: CsrSpecifier = 0x204;
/// Virtual supervisor trap handler base address.
pub const VSTVEC: CsrSpecifier = 0x205;
/// Virtual supervisor scratch register.
pub const VSSCRATCH: CsrSpecifier = 0x240;
/// Virtual supervisor exception program counter.
pub const VSEPC: CsrSpecifier = 0x241;
/// Virtual supervisor trap cause.
pub const VSCAUSE: CsrSpecifier = 0x242;
/// Virtual supervisor bad address or instruction.
pub const VSTVAL: CsrSpecifier = 0x243;
/// Virtual supervisor interrupt pending.
pub const VSIP: CsrSpecifier = 0x244;
/// Virtual supervisor address translation and protection.
pub const VSATP: CsrSpecifier = 0x280;
/// Virtual supervisor timer compare (Sstc).
pub const VSTIMECMP: CsrSpecifier = 0x24D;
/// Additional virtual supervisor timer compare, RV32 only.
pub const VSTIMECMPH: CsrSpecifier = 0x25D;

//
// Sstc extension (`0x14D`, `0x15D`).
//
/// Supervisor timer compare.
pub const STIMECMP: CsrSpecifier = 0x14D;
/// Additional supervisor timer compare, RV32 only.
pub const STIMECMPH: CsrSpecifier = 0x15D;

//
// AIA (`0x15{0,1,2}`, `0x25{0,1,2}`, `0x35{0,1,2}`, MVIEN/MVIP already listed above).
//
/// Supervisor indirect register select.
pub const SISELECT: CsrSpecifier = 0x150;
/// Supervisor indirect register alias.
pub const SIREG: CsrSpecifier = 0x151;
/// Supervisor top external interrupt (AIA).
pub const STOPEI: CsrSpecifier = 0x15C;
/// Supervisor top interrupt.
pub const STOPI: CsrSpecifier = 0xDB0;
/// Virtual supervisor indirect register select.
pub const VSISELECT: CsrSpecifier = 0x250;
/// Virtual supervisor indirect register alias.
pub const VSIREG: CsrSpecifier = 0x251;
/// Virtual supervisor top external interrupt (AIA).
pub const VSTOPEI: CsrSpecifier = 0x25C;
/// Virtual supervisor top interrupt.
pub const VSTOPI: CsrSpecifier = 0xEB0;
/// Machine indirect register select.
pub const MISELECT: CsrSpecifier = 0x350;
/// Machine indirect register alias.
pub const MIREG: CsrSpecifier = 0x351;
/// Machine top external interrupt (AIA).
pub const MTOPEI: CsrSpecifier = 0x35C;
/// Machine top interrupt.
pub const MTOPI: CsrSpecifier = 0xFB0;
/// Machine interrupt-enable co-processor register (AIA).
pub const MVIEN: CsrSpecifier = 0x308;
/// Machine virtual-interrupt-pending register (AIA).
pub const MVIP: CsrSpecifier = 0x309;
/// Additional machine interrupt-enable co-processor register, RV32 only.
pub const MVIENH: CsrSpecifier = 0x318;
/// Additional machine virtual-interrupt-pending register, RV32 only.
pub const MVIPH: CsrSpecifier = 0x319;

//
// Counter overflow (Sscofpmf, `0xDA0`).
//
/// Supervisor count overflow.
pub const SCOUNTOVF: CsrSpecifier = 0xDA0;

//
// State-enable extension (Smstateen/Sstateen, `0x10{C..F}`, `0x30{C..F}`, `0x31{0xC..0xF}`,
// `0x60{C..F}`, `0x61{C..F}`).
//
/// Supervisor state-enable register 0.
pub const SSTATEEN0: CsrSpecifier = 0x10C;
/// Supervisor state-enable register 1.
pub const SSTATEEN1: CsrSpecifier = 0x10D;
/// Supervisor state-enable register 2.
pub const SSTATEEN2: CsrSpecifier = 0x10E;
/// Supervisor state-enable register 3.
pub const SSTATEEN3: CsrSpecifier = 0x10F;
/// Machine state-enable register 0.
pub const MSTATEEN0: CsrSpecifier = 0x30C;
/// Machine state-enable register 1.
pub const MSTATEEN1: CsrSpecifier = 0x30D;
/// Machine state-enable register 2.
pub const MSTATEEN2: CsrSpecifier = 0x30E;
/// Machine state-enable register 3.
pub const MSTATEEN3: CsrSpecifier = 0x30F;
/// Additional machine state-enable register 0, RV32 only.
pub const MSTATEEN0H: CsrSpecifier = 0x31C;
/// Additional machine state-enable register 1, RV32 only.
pub const MSTATEEN1H: CsrSpecifier = 0x31D;
/// Additional machine state-enable register 2, RV32 only.
pub const MSTATEEN2H: CsrSpecifier = 0x31E;
/// Additional machine state-enable register 3, RV32 only.
pub const MSTATEEN3H: CsrSpecifier = 0x31F;
/// Hypervisor state-enable register 0.
pub const HSTATEEN0: CsrSpecifier = 0x60C;
/// Hypervisor state-enable register 1.
pub const HSTATEEN1: CsrSpecifier = 0x60D;
/// Hypervisor state-enable register 2.
pub const HSTATEEN2: CsrSpecifier = 0x60E;
/// Hypervisor state-enable register 3.
pub const HSTATEEN3: CsrSpecifier = 0x60F;
/// Additional hypervisor state-enable register 0, RV32 only.
pub const HSTATEEN0H: CsrSpecifier = 0x61C;
/// Additional hypervisor state-enable register 1, RV32 only.
pub const HSTATEEN1H: CsrSpecifier = 0x61D;
/// Additional hypervisor state-enable register 2, RV32 only.
pub const HSTATEEN2H: CsrSpecifier = 0x61E;
/// Additional hypervisor state-enable register 3, RV32 only.
pub const HSTATEEN3H: CsrSpecifier = 0x61F;

//
// Machine security configuration (RLB/MML/MMWP, extends the `MSECCFG`/`MSECCFGH` pair above).
//

//
// Vector extension (`0x008..=0x00F`).
//
/// Vector start.
pub const VSTART: CsrSpecifier = 0x008;
/// Vector fixed-point saturate flag.
pub const VXSAT: CsrSpecifier = 0x009;
/// Vector fixed-point rounding mode.
pub const VXRM: CsrSpecifier = 0x00A;
/// Vector CSR (VXRM + VXSAT).
pub const VCSR: CsrSpecifier = 0x00F;
/// Vector length.
pub const VL: CsrSpecifier = 0xC20;
/// Vector data type.
pub const VTYPE: CsrSpecifier = 0xC21;
/// Vector register length in bytes.
pub const VLENB: CsrSpecifier = 0xC22;

//
// Entropy source (Zkr, `0x015`).
//
/// Entropy source register.
pub const SEED: CsrSpecifier = 0x015;

//
// PMACFG (machine physical memory attributes, `0xBC0..=0xBDF`).
//
/// Physical memory attribute configuration.
pub const PMACFG0: CsrSpecifier = 0xBC0;
/// Physical memory attribute configuration.
pub const PMACFG1: CsrSpecifier = 0xBC1;
/// Physical memory attribute configuration.
pub const PMACFG2: CsrSpecifier = 0xBC2;
/// Physical memory attribute configuration.
pub const PMACFG3: CsrSpecifier = 0xBC3;
/// Physical memory attribute configuration.
pub const PMACFG4: CsrSpecifier = 0xBC4;
/// Physical memory attribute configuration.
pub const PMACFG5: CsrSpecifier = 0xBC5;
/// Physical memory attribute configuration.
pub const PMACFG6: CsrSpecifier = 0xBC6;
/// Physical memory attribute configuration.
pub const PMACFG7: CsrSpecifier = 0xBC7;
/// Physical memory attribute configuration.
pub const PMACFG8: CsrSpecifier = 0xBC8;
/// Physical memory attribute configuration.
pub const PMACFG9: CsrSpecifier = 0xBC9;
/// Physical memory attribute configuration.
pub const PMACFG10: CsrSpecifier = 0xBCA;
/// Physical memory attribute configuration.
pub const PMACFG11: CsrSpecifier = 0xBCB;
/// Physical memory attribute configuration.
pub const PMACFG12: CsrSpecifier = 0xBCC;
/// Physical memory attribute configuration.
pub const PMACFG13: CsrSpecifier = 0xBCD;
/// Physical memory attribute configuration.
pub const PMACFG14: CsrSpecifier = 0xBCE;
/// Physical memory attribute configuration.
pub const PMACFG15: CsrSpecifier = 0xBCF;

//
// System register-move/context configuration (Smrnmi/Ssqosid, `0x350..=0x352` collide with AIA
// on purpose per the architecture; `SRMCFG` lives at `0x181`).
//
/// System register-move context configuration register.
pub const SRMCFG: CsrSpecifier = 0x181;

//
// Resumable non-maskable interrupts (Smrnmi, `0x740..=0x742`).
//
/// Resumable NMI scratch register.
pub const MNSCRATCH: CsrSpecifier = 0x740;
/// Resumable NMI exception program counter.
pub const MNEPC: CsrSpecifier = 0x741;
/// Resumable NMI cause.
pub const MNCAUSE: CsrSpecifier = 0x742;
/// Resumable NMI status.
pub const MNSTATUS: CsrSpecifier = 0x744;

/// Returns `true` if `specifier` is valid, which is the case if it fits in 12 bits.
pub fn is_valid(specifier: CsrSpecifier) -> bool {
    specifier < 1 << 12
}

/// Returns `true` if this CSR only supports read access.
///
/// Requires [`is_valid(specifier)`](is_valid), otherwise the return value is undefined.
pub fn is_read_only(specifier: CsrSpecifier) -> bool {
    // The top two bits of a CSR specifier indicate whether the CSR is read-only (0b11) or
    // read/write (0b00, 0b01, 0b10)
    specifier >> 10 == 0b11
}

/// Returns the minimum required privilege level to access this CSR.
///
/// Requires [`is_valid(specifier)`](is_valid), otherwise the return value is undefined.
///
/// Note that this returns a [`RawPrivilegeLevel`], meaning the minimum required privilege level
/// may be a reserved level. This still has a defined meaning: only higher privilege levels are
/// allowed to access the CSR.
pub fn required_privilege_level(specifier: CsrSpecifier) -> RawPrivilegeLevel {
    // Bits `9:8` indicate the minimum required privilege level; `Reserved` (0b10) tags a
    // hypervisor/VS-mode CSR, gated exactly like a `Supervisor` one.
    RawPrivilegeLevel::from_u2(((specifier >> 8) & 0b11) as u8)
}

/// True if `specifier` falls in the debug-CSR range (`0x7A0..=0x7AF`, `0x7B0..=0x7BF`).
pub fn is_debug(specifier: CsrSpecifier) -> bool {
    matches!(specifier, 0x7A0..=0x7AF | 0x7B0..=0x7BF)
}

/// True if `specifier` is one of the AIA indirect-access registers (`*ISELECT`/`*IREG`) or the
/// `*TOPEI`/`*TOPI` family, which take additional adjuster passes in the CSR engine.
pub fn is_aia(specifier: CsrSpecifier) -> bool {
    matches!(
        specifier,
        MISELECT
            | MIREG
            | MTOPEI
            | MTOPI
            | SISELECT
            | SIREG
            | STOPEI
            | STOPI
            | VSISELECT
            | VSIREG
            | VSTOPEI
            | VSTOPI
            | HVICTL
            | HVIPRIO1
            | HVIPRIO2
            | HVIPRIO1H
            | HVIPRIO2H
            | MVIEN
            | MVIP
            | MVIENH
            | MVIPH
    )
}

/// An S-mode CSR whose virtual (VS-mode) alias lives at `number + 0x100`.
pub fn maps_to_virtual(specifier: CsrSpecifier) -> bool {
    matches!(
        specifier,
        SSTATUS
            | SIE
            | STVEC
            | SCOUNTEREN
            | SENVCFG
            | SSCRATCH
            | SEPC
            | SCAUSE
            | STVAL
            | SIP
            | SATP
            | STIMECMP
            | STIMECMPH
            | SISELECT
            | SIREG
            | STOPEI
            | STOPI
    )
}
