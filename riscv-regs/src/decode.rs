// SPDX-FileCopyrightText: 2023 Rivos Inc.
//
// SPDX-License-Identifier: Apache-2.0

//! Instruction decoding for the traps the monitor inspects.
use riscv_decode::{decode, instruction_length};

// Use the types from the riscv_decode crate.
pub use riscv_decode::{DecodingError, Instruction};

use crate::GprIndex;

/// Encoding of `sret`.
pub const SRET_INSTRUCTION: u32 = 0x1020_0073;

/// Selects the opcode and funct3 bits of a SYSTEM instruction.
pub const CSR_INSN_MASK: u32 = 0x707f;

/// A RISC-V instruction that has been decoded. Only supports 2 or 4 bytes instructions for now.
#[derive(Clone, Copy, Debug)]
pub struct DecodedInstruction {
    instruction: Instruction,
    len: usize,
    raw: u32,
}

impl DecodedInstruction {
    /// Creates a new `DecodedInstruction` from raw instruction bytes.
    pub fn from_raw(raw: u32) -> Result<Self, DecodingError> {
        let len = instruction_length(raw as u16);
        let instruction = decode(raw)?;
        Ok(Self {
            instruction,
            len,
            raw,
        })
    }

    /// Decodes a transformed instruction as reported in `htinst`/`mtinst`. Returns `None` when the
    /// value is zero or a pseudo-instruction, in which case the caller has to fetch the
    /// instruction from guest memory.
    pub fn from_transformed(tinst: u64) -> Option<Self> {
        if tinst & 0x1 == 0 {
            return None;
        }
        // Bit 1 clear marks a compressed original; the transformed form is still a 32-bit
        // encoding once bit 1 is set.
        let len = if tinst & 0x2 != 0 { 4 } else { 2 };
        let raw = (tinst | 0x2) as u32;
        let instruction = decode(raw).ok()?;
        Some(Self {
            instruction,
            len,
            raw,
        })
    }

    /// Returns the raw instruction bytes.
    pub fn raw(&self) -> u32 {
        self.raw
    }

    /// Returns the decoded instruction.
    pub fn instruction(&self) -> Instruction {
        self.instruction
    }

    /// Returns the length of the raw instruction in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        self.len
    }
}

/// The read-modify-write operation of a Zicsr instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrOp {
    ReadWrite,
    ReadSet,
    ReadClear,
}

/// Operand of a Zicsr instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrSource {
    Register(GprIndex),
    Immediate(u64),
}

/// A decoded `csrr{w,s,c}[i]` instruction.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CsrInstruction {
    pub op: CsrOp,
    pub csr: u16,
    pub rd: GprIndex,
    pub source: CsrSource,
}

impl CsrInstruction {
    /// Returns the CSR access performed by `instruction`, if it is one.
    pub fn from_instruction(instruction: &DecodedInstruction) -> Option<Self> {
        use Instruction::*;
        let (op, csr, rd, source) = match instruction.instruction() {
            Csrrw(c) => (
                CsrOp::ReadWrite,
                c.csr(),
                c.rd(),
                CsrSource::Register(GprIndex::from_raw(c.rs1())?),
            ),
            Csrrs(c) => (
                CsrOp::ReadSet,
                c.csr(),
                c.rd(),
                CsrSource::Register(GprIndex::from_raw(c.rs1())?),
            ),
            Csrrc(c) => (
                CsrOp::ReadClear,
                c.csr(),
                c.rd(),
                CsrSource::Register(GprIndex::from_raw(c.rs1())?),
            ),
            Csrrwi(c) => (
                CsrOp::ReadWrite,
                c.csr(),
                c.rd(),
                CsrSource::Immediate(c.zimm() as u64),
            ),
            Csrrsi(c) => (
                CsrOp::ReadSet,
                c.csr(),
                c.rd(),
                CsrSource::Immediate(c.zimm() as u64),
            ),
            Csrrci(c) => (
                CsrOp::ReadClear,
                c.csr(),
                c.rd(),
                CsrSource::Immediate(c.zimm() as u64),
            ),
            _ => return None,
        };
        Some(Self {
            op,
            csr: csr as u16,
            rd: GprIndex::from_raw(rd)?,
            source,
        })
    }

    /// Decodes the raw bits of a trapping instruction as a CSR access.
    pub fn from_raw(raw: u32) -> Option<Self> {
        DecodedInstruction::from_raw(raw)
            .ok()
            .and_then(|i| Self::from_instruction(&i))
    }

    /// Returns the source register, if the operand is not an immediate.
    pub fn rs1(&self) -> Option<GprIndex> {
        match self.source {
            CsrSource::Register(r) => Some(r),
            CsrSource::Immediate(_) => None,
        }
    }

    /// Returns true if the instruction writes the CSR. `csrrs`/`csrrc` with a zero operand field
    /// only read it.
    pub fn writes_csr(&self) -> bool {
        match (self.op, self.source) {
            (CsrOp::ReadWrite, _) => true,
            (_, CsrSource::Register(r)) => r != GprIndex::Zero,
            (_, CsrSource::Immediate(imm)) => imm != 0,
        }
    }

    /// Computes the new CSR value from the old one and the operand value.
    pub fn apply(&self, old: u64, operand: u64) -> u64 {
        match self.op {
            CsrOp::ReadWrite => operand,
            CsrOp::ReadSet => old | operand,
            CsrOp::ReadClear => old & !operand,
        }
    }
}

/// Describes the type of load or store of an MMIO access.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmioOpcode {
    Load64,
    Load32,
    Load32U,
    Load16,
    Load16U,
    Load8,
    Load8U,
    Store64,
    Store32,
    Store16,
    Store8,
}

impl MmioOpcode {
    /// Returns if the MMIO operation is a load.
    pub fn is_load(&self) -> bool {
        use MmioOpcode::*;
        matches!(
            self,
            Load8 | Load8U | Load16 | Load16U | Load32 | Load32U | Load64
        )
    }

    /// Truncates `val` to the access width and extends it the way the load instruction does.
    pub fn extend(&self, val: u64) -> u64 {
        use MmioOpcode::*;
        match self {
            Load8 => val as u8 as i8 as i64 as u64,
            Load16 => val as u16 as i16 as i64 as u64,
            Load32 => val as u32 as i32 as i64 as u64,
            Load8U => val as u8 as u64,
            Load16U => val as u16 as u64,
            Load32U => val as u32 as u64,
            _ => val,
        }
    }
}

/// A decoded MMIO operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MmioOperation {
    opcode: MmioOpcode,
    register: GprIndex,
    raw: u32,
}

impl MmioOperation {
    /// Creates an `MmioOperation` from `instruction` if the MMIO is supported using that instruction.
    pub fn from_instruction(instruction: &DecodedInstruction) -> Option<Self> {
        use Instruction::*;
        let (opcode, reg_index) = match instruction.instruction() {
            Lb(i) => (MmioOpcode::Load8, i.rd()),
            Lh(i) => (MmioOpcode::Load16, i.rd()),
            Lw(i) => (MmioOpcode::Load32, i.rd()),
            Lbu(i) => (MmioOpcode::Load8U, i.rd()),
            Lhu(i) => (MmioOpcode::Load16U, i.rd()),
            Lwu(i) => (MmioOpcode::Load32U, i.rd()),
            Ld(i) => (MmioOpcode::Load64, i.rd()),
            Sb(s) => (MmioOpcode::Store8, s.rs2()),
            Sh(s) => (MmioOpcode::Store16, s.rs2()),
            Sw(s) => (MmioOpcode::Store32, s.rs2()),
            Sd(s) => (MmioOpcode::Store64, s.rs2()),
            _ => {
                return None;
            }
        };
        Some(Self {
            opcode,
            register: GprIndex::from_raw(reg_index)?,
            raw: instruction.raw(),
        })
    }

    /// Returns the operation as a `MmioOpcode`.
    pub fn opcode(&self) -> MmioOpcode {
        self.opcode
    }

    /// Returns the target register for the operation. Either 'rd' for load instructions, or 'rs2' for
    /// store instructions.
    pub fn register(&self) -> GprIndex {
        self.register
    }

    /// Returns the instruction bits reported to the hypervisor.
    pub fn raw(&self) -> u32 {
        self.raw
    }
}

/// Address translation fences that trap to M-mode while `mstatus.TVM` is set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TranslationFence {
    SfenceVma { rs1: GprIndex, rs2: GprIndex },
    SinvalVma { rs1: GprIndex, rs2: GprIndex },
    HfenceGvma { rs1: GprIndex, rs2: GprIndex },
    HfenceVvma { rs1: GprIndex, rs2: GprIndex },
}

const FENCE_MASK: u32 = 0xfe00_7fff;
const SFENCE_VMA_MATCH: u32 = 0x1200_0073;
const SINVAL_VMA_MATCH: u32 = 0x1600_0073;
const HFENCE_GVMA_MATCH: u32 = 0x6200_0073;
const HFENCE_VVMA_MATCH: u32 = 0x2200_0073;

impl TranslationFence {
    /// Matches `raw` against the fence encodings.
    pub fn from_raw(raw: u32) -> Option<Self> {
        let rs1 = GprIndex::from_raw((raw >> 15) & 0x1f)?;
        let rs2 = GprIndex::from_raw((raw >> 20) & 0x1f)?;
        match raw & FENCE_MASK {
            SFENCE_VMA_MATCH => Some(Self::SfenceVma { rs1, rs2 }),
            SINVAL_VMA_MATCH => Some(Self::SinvalVma { rs1, rs2 }),
            HFENCE_GVMA_MATCH => Some(Self::HfenceGvma { rs1, rs2 }),
            HFENCE_VVMA_MATCH => Some(Self::HfenceVvma { rs1, rs2 }),
            _ => None,
        }
    }
}
