//! Symbols, the name interner, and relocations.
//!
//! Grounded on `Micro.h`'s `MicroSymbol`/`MicroSymbolKind` and `Encoder.h`'s
//! `getOrAddSymbol`/`addSymbolRelocation`.

use rustc_hash::FxHashMap;

use crate::micro::operand::NameRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolKind {
    Function,
    Extern,
    Custom,
    Constant,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: NameRef,
    pub kind: SymbolKind,
    pub value: u32,
    pub index: u32,
}

/// Interns identifier strings into `NameRef`s and tracks declared symbols,
/// mirroring `Encoder::getOrAddSymbol` plus the source's `symbols_` vector.
#[derive(Debug, Default)]
pub struct SymbolTable {
    names: Vec<String>,
    name_index: FxHashMap<String, NameRef>,
    symbols: Vec<Symbol>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&mut self, name: &str) -> NameRef {
        if let Some(&existing) = self.name_index.get(name) {
            return existing;
        }
        let id = NameRef(self.names.len() as u32);
        self.names.push(name.to_string());
        self.name_index.insert(name.to_string(), id);
        id
    }

    pub fn name(&self, reference: NameRef) -> &str {
        &self.names[reference.0 as usize]
    }

    /// Look up an existing symbol with this name and kind, or declare a new
    /// one. Returns the symbol's table index.
    pub fn get_or_add_symbol(&mut self, name: &str, kind: SymbolKind) -> u32 {
        let name_ref = self.intern(name);
        if let Some(existing) = self
            .symbols
            .iter()
            .find(|s| s.name == name_ref && s.kind == kind)
        {
            return existing.index;
        }
        let index = self.symbols.len() as u32;
        self.symbols.push(Symbol {
            name: name_ref,
            kind,
            value: 0,
            index,
        });
        index
    }

    pub fn symbol(&self, index: u32) -> &Symbol {
        &self.symbols[index as usize]
    }

    pub fn symbols(&self) -> &[Symbol] {
        &self.symbols
    }
}

/// The only relocation kind this core emits: a PC-relative 32-bit
/// displacement from the address of the instruction following the patched
/// field to a target symbol or absolute address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocKind {
    Rel32,
}

/// Where a `Rel32` relocation resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelocTarget {
    Symbol(u32),
    Absolute(u64),
}

#[derive(Debug, Clone, Copy)]
pub struct Relocation {
    pub code_offset: u32,
    pub target: RelocTarget,
    pub kind: RelocKind,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let mut table = SymbolTable::new();
        let a = table.intern("foo");
        let b = table.intern("foo");
        assert_eq!(a, b);
        assert_eq!(table.name(a), "foo");
    }

    #[test]
    fn get_or_add_symbol_reuses_existing_entries() {
        let mut table = SymbolTable::new();
        let i1 = table.get_or_add_symbol("bar", SymbolKind::Function);
        let i2 = table.get_or_add_symbol("bar", SymbolKind::Function);
        assert_eq!(i1, i2);
        let i3 = table.get_or_add_symbol("bar", SymbolKind::Extern);
        assert_ne!(i1, i3);
    }
}
