//! Host-owned float arrays ("tables").
//!
//! The batch engine reads into and writes out of these. A table remembers
//! whether it should be saved with the containing document and whether its
//! on-screen representation is stale; the host polls [`Table::take_dirty`]
//! after a command completes.

use crate::soundfile::{SfError, SfResult};

/// A named float array owned by the host environment.
#[derive(Debug, Clone)]
pub struct Table {
    name: String,
    data: Vec<f32>,
    save_in_patch: bool,
    dirty: bool,
}

impl Table {
    pub fn new(name: impl Into<String>, len: usize) -> Table {
        Table {
            name: name.into(),
            data: vec![0.0; len],
            save_in_patch: false,
            dirty: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Grow or shrink to `len` frames. Resizing clears the save-in-patch
    /// attribute: a freshly loaded soundfile should not be serialized into
    /// the document.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0.0);
        self.save_in_patch = false;
    }

    pub fn save_in_patch(&self) -> bool {
        self.save_in_patch
    }

    pub fn set_save_in_patch(&mut self, save: bool) {
        self.save_in_patch = save;
    }

    /// Mark the table as needing a host redraw.
    pub fn redraw(&mut self) {
        self.dirty = true;
    }

    /// Consume the redraw marker.
    pub fn take_dirty(&mut self) -> bool {
        std::mem::take(&mut self.dirty)
    }
}

/// Ordered collection of tables, looked up by name.
#[derive(Debug, Default)]
pub struct TableSet {
    tables: Vec<Table>,
}

impl TableSet {
    pub fn new() -> TableSet {
        TableSet { tables: Vec::new() }
    }

    pub fn insert(&mut self, table: Table) {
        if let Some(existing) = self.tables.iter_mut().find(|t| t.name == table.name) {
            *existing = table;
        } else {
            self.tables.push(table);
        }
    }

    pub fn get(&self, name: &str) -> Option<&Table> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Table> {
        self.tables.iter_mut().find(|t| t.name == name)
    }

    pub fn index(&mut self, idx: usize) -> &mut Table {
        &mut self.tables[idx]
    }

    /// Map names to indices, rejecting unknown and duplicate names. The
    /// transfer loops address one table at a time through these indices.
    pub fn select(&self, names: &[String]) -> SfResult<Vec<usize>> {
        let mut indices = Vec::with_capacity(names.len());
        for name in names {
            let idx = self
                .tables
                .iter()
                .position(|t| t.name == *name)
                .ok_or_else(|| SfError::NoSuchTable(name.clone()))?;
            if indices.contains(&idx) {
                return Err(SfError::Usage(format!(
                    "table {} given more than once",
                    name
                )));
            }
            indices.push(idx);
        }
        Ok(indices)
    }
}
