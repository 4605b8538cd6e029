//! Register file for the reference backend.

use serde::{Deserialize, Serialize};
use tripwire_sal::backend::{RegisterId, RegisterInfo, RegisterKind, RegisterManager};

/// Register identifiers of [`RegisterFile::x86_64`].
pub mod x86_64 {
    use tripwire_sal::backend::RegisterId;

    pub const RIP: RegisterId = 0;
    pub const RSP: RegisterId = 1;
    pub const RBP: RegisterId = 2;
    pub const RAX: RegisterId = 3;
    pub const RBX: RegisterId = 4;
    pub const RCX: RegisterId = 5;
    pub const RDX: RegisterId = 6;
    pub const RFLAGS: RegisterId = 7;
    pub const CR3: RegisterId = 8;
}

/// Saved register values, in register order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterSnapshot {
    pub values: Vec<u64>,
}

/// A fixed set of registers backed by a value vector.  Register ids are
/// indices into that vector.
#[derive(Debug, Clone)]
pub struct RegisterFile {
    info: Vec<RegisterInfo>,
    values: Vec<u64>,
}

impl RegisterFile {
    /// Build a register file from `(name, kind, width)` triples; ids are
    /// assigned in order.
    pub fn new<'a>(layout: impl IntoIterator<Item = (&'a str, RegisterKind, u32)>) -> Self {
        let info: Vec<RegisterInfo> = layout
            .into_iter()
            .enumerate()
            .map(|(i, (name, kind, width_bits))| RegisterInfo {
                id: i as RegisterId,
                name: name.to_string(),
                kind,
                width_bits,
            })
            .collect();
        let values = vec![0; info.len()];
        Self { info, values }
    }

    /// A small x86-64 subset: instruction, stack and base pointers, four
    /// general purpose registers, flags and the page-table base.
    pub fn x86_64() -> Self {
        Self::new([
            ("rip", RegisterKind::InstructionPointer, 64),
            ("rsp", RegisterKind::StackPointer, 64),
            ("rbp", RegisterKind::BasePointer, 64),
            ("rax", RegisterKind::General, 64),
            ("rbx", RegisterKind::General, 64),
            ("rcx", RegisterKind::General, 64),
            ("rdx", RegisterKind::General, 64),
            ("rflags", RegisterKind::Status, 64),
            ("cr3", RegisterKind::AddressSpace, 64),
        ])
    }

    /// Zero every register.
    pub fn reset(&mut self) {
        self.values.fill(0);
    }

    pub fn snapshot(&self) -> RegisterSnapshot {
        RegisterSnapshot {
            values: self.values.clone(),
        }
    }

    /// Load a snapshot.  Returns `false` if it was taken from a register
    /// file of another shape.
    pub fn restore(&mut self, snapshot: &RegisterSnapshot) -> bool {
        if snapshot.values.len() != self.values.len() {
            return false;
        }
        self.values.copy_from_slice(&snapshot.values);
        true
    }

    fn mask(&self, id: RegisterId, value: u64) -> u64 {
        match self.info.get(id as usize).map(|r| r.width_bits) {
            Some(bits) if bits < 64 => value & ((1u64 << bits) - 1),
            _ => value,
        }
    }
}

impl RegisterManager for RegisterFile {
    fn registers(&self) -> &[RegisterInfo] {
        &self.info
    }

    fn get_data(&self, id: RegisterId) -> Option<u64> {
        self.values.get(id as usize).copied()
    }

    fn set_data(&mut self, id: RegisterId, value: u64) -> bool {
        let value = self.mask(id, value);
        match self.values.get_mut(id as usize) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}
