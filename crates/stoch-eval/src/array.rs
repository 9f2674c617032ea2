//! Array symbols.
//!
//! An array has one dimension per iterator it was declared with; each
//! dimension ranges over the iterator's finite `{int}` set. Cells are stored
//! flat, in row-major order of the sorted iterator domains.

use std::cell::RefCell;

use stoch_types::{SetObject, Value};

use crate::converge::ConvergeCell;
use crate::expr::Expr;

/// One array cell.
#[derive(Debug, Default)]
pub(crate) struct CellSlot {
    pub def: Option<Expr>,
    pub memo: Option<Value>,
    pub converge: ConvergeCell,
}

/// An index outside the declared range of a dimension.
#[derive(Debug, Clone)]
pub(crate) struct BadIndex {
    pub dimension: usize,
    pub value: Value,
}

#[derive(Debug)]
pub(crate) struct ArrayData {
    /// Iterator names, for messages.
    pub iterator_names: Vec<String>,
    pub domains: Vec<SetObject>,
    pub converge: bool,
    pub cells: RefCell<Vec<CellSlot>>,
}

impl ArrayData {
    pub fn new(iterator_names: Vec<String>, domains: Vec<SetObject>, converge: bool) -> Self {
        let size = domains.iter().map(SetObject::len).product();
        let cells = (0..size).map(|_| CellSlot::default()).collect();
        Self {
            iterator_names,
            domains,
            converge,
            cells: RefCell::new(cells),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.domains.len()
    }

    /// Flat cell position of `indices`.
    pub fn flat_index(&self, indices: &[Value]) -> Result<usize, BadIndex> {
        let mut flat = 0;
        for (dimension, (domain, value)) in self.domains.iter().zip(indices).enumerate() {
            let Some(pos) = domain.index_of(value) else {
                return Err(BadIndex {
                    dimension,
                    value: value.clone(),
                });
            };
            flat = flat * domain.len() + pos;
        }
        Ok(flat)
    }

    pub fn clear_memos(&self) {
        for cell in self.cells.borrow_mut().iter_mut() {
            cell.memo = None;
        }
    }
}

/// `name[i][j]` for messages.
pub(crate) fn cell_label(name: &str, indices: &[Value]) -> String {
    let mut label = name.to_string();
    for i in indices {
        label.push_str(&format!("[{i}]"));
    }
    label
}
