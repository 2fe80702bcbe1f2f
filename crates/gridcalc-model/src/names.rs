use serde::{Deserialize, Serialize};

use crate::{CellValue, Range};

/// What a defined name refers to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum NameDefinition {
    /// A named range.
    Range(Range),
    /// A named constant.
    Constant(CellValue),
    /// The name exists but its definition was lost or deleted.
    ///
    /// Formulas referencing it evaluate to `#NAME?`.
    Missing,
}

/// A workbook-scoped defined name (named range or constant).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DefinedName {
    /// User-visible name.
    pub name: String,
    pub definition: NameDefinition,
}

/// Workbook name table.
///
/// `PtgName` tokens store a **1-based** index (`iname`) into this table, so
/// lookups here take the 1-based wire index. Deleting a name leaves a
/// `Missing` tombstone so later indices stay valid.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NameTable {
    names: Vec<DefinedName>,
}

impl NameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a name, returning its 1-based wire index.
    pub fn add(&mut self, name: impl Into<String>, definition: NameDefinition) -> u16 {
        self.names.push(DefinedName {
            name: name.into(),
            definition,
        });
        self.names.len() as u16
    }

    /// Look up by 1-based wire index.
    pub fn get(&self, iname: u16) -> Option<&DefinedName> {
        if iname == 0 {
            return None;
        }
        self.names.get(iname as usize - 1)
    }

    /// Look up the 1-based index of a name (case-insensitive, as in Excel).
    pub fn index_of(&self, name: &str) -> Option<u16> {
        self.names
            .iter()
            .position(|n| n.name.eq_ignore_ascii_case(name))
            .map(|i| (i + 1) as u16)
    }

    /// Redefine an existing name in place. Returns `false` when the index is
    /// out of range.
    pub fn redefine(&mut self, iname: u16, definition: NameDefinition) -> bool {
        if iname == 0 {
            return false;
        }
        match self.names.get_mut(iname as usize - 1) {
            Some(n) => {
                n.definition = definition;
                true
            }
            None => false,
        }
    }

    /// Tombstone a name. Idempotent.
    pub fn delete(&mut self, iname: u16) {
        self.redefine(iname, NameDefinition::Missing);
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
