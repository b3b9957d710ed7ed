//! Column-oriented table and its FIFO bridge onto the store interface.
//!
//! The bridge lets batch-oriented data participate in the streaming model:
//! the same table serves random access by row index and, through
//! [`TableFifo`], first-in-first-out consumption by a pipeline module.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::warn;

use crate::element::Element;
use crate::store::Store;

/// One table row: column name to cell value.
pub type TableRow<V> = HashMap<String, V>;

/// A growable column-oriented table. Columns keep insertion order; rows are
/// counted by a monotonically increasing write counter.
pub struct ExtendableTable<V> {
    columns: HashMap<String, Vec<V>>,
    names: Vec<String>,
    rows: usize,
}

impl<V: Clone> Default for ExtendableTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V: Clone> ExtendableTable<V> {
    pub fn new() -> Self {
        Self {
            columns: HashMap::new(),
            names: Vec::new(),
            rows: 0,
        }
    }

    /// Add an empty column. Adding an existing name again is a no-op.
    pub fn add_column(&mut self, name: &str) {
        if !self.columns.contains_key(name) {
            self.names.push(name.to_string());
            self.columns.insert(name.to_string(), Vec::new());
        }
    }

    /// Column names in insertion order.
    pub fn column_names(&self) -> &[String] {
        &self.names
    }

    /// Append one cell to a column. Unknown columns are logged and ignored.
    pub fn push(&mut self, column: &str, value: V) {
        match self.columns.get_mut(column) {
            Some(cells) => cells.push(value),
            None => warn!(column, "push to unknown column ignored"),
        }
    }

    /// Append a full row and advance the write counter. Keys without a
    /// matching column are logged and ignored.
    pub fn add_row(&mut self, row: TableRow<V>) {
        for (column, value) in row {
            self.push(&column, value);
        }
        self.rows += 1;
    }

    /// Copy of row `index`, or `None` past the write counter.
    pub fn row(&self, index: usize) -> Option<TableRow<V>> {
        if index >= self.rows {
            return None;
        }
        let mut row = TableRow::with_capacity(self.names.len());
        for name in &self.names {
            if let Some(value) = self.columns[name].get(index) {
                row.insert(name.clone(), value.clone());
            }
        }
        Some(row)
    }

    pub fn column(&self, name: &str) -> Option<&[V]> {
        self.columns.get(name).map(|c| c.as_slice())
    }

    /// Single cell access.
    pub fn value(&self, column: &str, row: usize) -> Option<&V> {
        if row >= self.rows {
            return None;
        }
        self.columns.get(column).and_then(|c| c.get(row))
    }

    pub fn row_count(&self) -> usize {
        self.rows
    }

    /// Wrap this table for shared access and hand back both halves: the
    /// shared table and a FIFO store view over it.
    pub fn into_shared(self) -> (Arc<Mutex<ExtendableTable<V>>>, TableFifo<V>) {
        let table = Arc::new(Mutex::new(self));
        let fifo = TableFifo::new(Arc::clone(&table));
        (table, fifo)
    }
}

/// FIFO store view over a shared [`ExtendableTable`].
///
/// `put` appends the payload as a new row (the terminal tag is dropped on
/// write); `get` yields rows in insertion order through a read cursor that
/// never exceeds the write counter. Once the cursor catches up, every
/// further `get` returns the same terminal-tagged copy of the final row
/// instead of advancing or erroring, so a consumer always observes a
/// sentinel no matter when it finishes draining.
pub struct TableFifo<V> {
    table: Arc<Mutex<ExtendableTable<V>>>,
    cursor: Mutex<usize>,
}

impl<V: Clone> TableFifo<V> {
    pub fn new(table: Arc<Mutex<ExtendableTable<V>>>) -> Self {
        Self {
            table,
            cursor: Mutex::new(0),
        }
    }
}

impl<V: Clone + Send> Store<TableRow<V>> for TableFifo<V> {
    fn put(&self, el: Element<TableRow<V>>) {
        let mut table = self.table.lock().expect("table lock poisoned");
        table.add_row(el.into_payload());
    }

    fn get(&self) -> Option<Element<TableRow<V>>> {
        let table = self.table.lock().expect("table lock poisoned");
        let mut cursor = self.cursor.lock().expect("cursor lock poisoned");
        if *cursor >= table.row_count() {
            // Exhausted: re-yield the final row as the terminal element.
            return table.row(table.row_count().checked_sub(1)?).map(Element::Last);
        }
        let row = table.row(*cursor);
        *cursor += 1;
        row.map(Element::Data)
    }

    fn is_empty(&self) -> bool {
        let table = self.table.lock().expect("table lock poisoned");
        let cursor = self.cursor.lock().expect("cursor lock poisoned");
        *cursor >= table.row_count()
    }

    fn size(&self) -> usize {
        let table = self.table.lock().expect("table lock poisoned");
        let cursor = self.cursor.lock().expect("cursor lock poisoned");
        table.row_count().saturating_sub(*cursor)
    }
}
