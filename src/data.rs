//! Runtime CSV data feed.
//!
//! Plans declare [`CsvDataSource`](crate::plan::CsvDataSource)s; at run start
//! they are loaded into a [`CsvBank`] shared by every virtual user. At the
//! top of each loop iteration a user draws one row per source through its
//! [`CsvFeed`]; the resulting `column → cell` bindings seed the iteration
//! variable scope.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing::{event, Level};

use crate::plan::{CsvDataSource, CsvSharingMode};
use crate::CRATE_NAME;

#[derive(Debug, Default)]
struct Cursor {
    next: usize,
    /// Latched once the no-recycle warning has been logged for this cursor.
    warned: bool,
}

#[derive(Debug)]
struct SourceRuntime {
    name: String,
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
    sharing_mode: CsvSharingMode,
    recycle: bool,
    /// Global cursor, only consulted in `AllThreads` mode.
    shared: Mutex<Cursor>,
}

impl SourceRuntime {
    // Advance a cursor and return the row index to serve. Exhausted
    // no-recycle sources keep serving the last row; the warning fires once
    // per cursor.
    fn draw(&self, cursor: &mut Cursor) -> Option<usize> {
        if self.rows.is_empty() {
            return None;
        }
        let len = self.rows.len();
        if cursor.next >= len {
            if self.recycle {
                cursor.next = 0;
            } else {
                if !cursor.warned {
                    cursor.warned = true;
                    event!(
                        name: "csv_exhausted",
                        target: CRATE_NAME,
                        Level::WARN,
                        source = %self.name,
                        rows = len,
                        "csv source exhausted; serving the last row from now on"
                    );
                }
                return Some(len - 1);
            }
        }
        let idx = cursor.next;
        cursor.next += 1;
        Some(idx)
    }
}

/// All CSV sources of a plan, loaded once per run and shared by every user.
#[derive(Debug, Default)]
pub struct CsvBank {
    sources: Vec<SourceRuntime>,
}

impl CsvBank {
    pub fn new(sources: &[CsvDataSource]) -> Arc<Self> {
        Arc::new(Self {
            sources: sources
                .iter()
                .map(|s| SourceRuntime {
                    name: s.name.clone(),
                    columns: s.columns.clone(),
                    rows: s.rows.clone(),
                    sharing_mode: s.sharing_mode,
                    recycle: s.recycle,
                    shared: Mutex::new(Cursor::default()),
                })
                .collect(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }
}

/// One virtual user's handle onto the bank. Holds the private cursors used
/// by `PerThread` sources.
#[derive(Debug)]
pub struct CsvFeed {
    bank: Arc<CsvBank>,
    local: Vec<Cursor>,
}

impl CsvFeed {
    pub fn new(bank: Arc<CsvBank>) -> Self {
        let local = bank.sources.iter().map(|_| Cursor::default()).collect();
        Self { bank, local }
    }

    /// Draw one row from every source and merge the bindings. Called once
    /// per loop iteration, before any request runs.
    pub fn next_bindings(&mut self) -> HashMap<String, String> {
        let mut bindings = HashMap::new();
        for (source, local) in self.bank.sources.iter().zip(self.local.iter_mut()) {
            let idx = match source.sharing_mode {
                CsvSharingMode::AllThreads => {
                    let mut cursor = source.shared.lock().expect("csv cursor poisoned");
                    source.draw(&mut cursor)
                }
                CsvSharingMode::PerThread => source.draw(local),
            };
            if let Some(idx) = idx {
                let row = &source.rows[idx];
                for (column, cell) in source.columns.iter().zip(row.iter()) {
                    bindings.insert(column.clone(), cell.clone());
                }
            }
        }
        bindings
    }
}
