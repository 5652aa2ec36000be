// This Source Code Form is subject to the terms of the GNU General Public
// License, version 2 or (at your option) any later version.

//! Process-wide symbol table: every cross section, continuous predictor,
//! predefined parameter and spectrum symbol referenced by
//! `cross_section::CrossReference::comp` is registered here once and
//! shared by every analysis window. Grounded in the original engine's
//! `_wrkSymbol`/`_wrkSymbolType` (`analyse.h`).

use crate::numeric::matrix::Matrix;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolType {
    Cross,
    Continuous,
    Predefined,
    Spectrum,
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolType,
    pub cross_file_name: Option<String>,
    pub amf_file_name: Option<String>,
    /// The loaded high-resolution cross section, for `SymbolType::Cross`.
    pub xs: Option<Matrix>,
}

/// The symbol table an [`crate::analysis::AnalysisWindow`]'s
/// `CrossReference::comp` entries index into.
#[derive(Debug, Clone, Default)]
pub struct Workspace {
    symbols: Vec<Symbol>,
}

impl Workspace {
    pub fn new() -> Self {
        Self {
            symbols: Vec::new(),
        }
    }

    /// Register a symbol, returning its index (the value `comp` refers
    /// to). Re-registering the same name returns the existing index.
    pub fn register(&mut self, symbol: Symbol) -> usize {
        if let Some(idx) = self.symbols.iter().position(|s| s.name == symbol.name) {
            self.symbols[idx] = symbol;
            return idx;
        }
        self.symbols.push(symbol);
        self.symbols.len() - 1
    }

    pub fn get(&self, index: usize) -> Option<&Symbol> {
        self.symbols.get(index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<usize> {
        self.symbols.iter().position(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registering_same_name_twice_reuses_the_index() {
        let mut ws = Workspace::new();
        let i1 = ws.register(Symbol {
            name: "NO2".into(),
            kind: SymbolType::Cross,
            cross_file_name: Some("no2.xs".into()),
            amf_file_name: None,
            xs: None,
        });
        let i2 = ws.register(Symbol {
            name: "NO2".into(),
            kind: SymbolType::Cross,
            cross_file_name: Some("no2_v2.xs".into()),
            amf_file_name: None,
            xs: None,
        });
        assert_eq!(i1, i2);
        assert_eq!(ws.len(), 1);
        assert_eq!(
            ws.get(i1).unwrap().cross_file_name.as_deref(),
            Some("no2_v2.xs")
        );
    }

    #[test]
    fn find_by_name_locates_registered_symbol() {
        let mut ws = Workspace::new();
        ws.register(Symbol {
            name: "O3".into(),
            kind: SymbolType::Cross,
            cross_file_name: None,
            amf_file_name: None,
            xs: None,
        });
        assert_eq!(ws.find_by_name("O3"), Some(0));
        assert_eq!(ws.find_by_name("NOPE"), None);
    }
}
