//! Resumable, ordered reads over one partition.
//!
//! A cursor is only the last task id handed to the consumer. Resuming issues
//! a fresh range select starting one above it, so nothing about a reader
//! lives in the store.

use serde::{Deserialize, Serialize};

use crate::error::{InvalidFilter, SelectError};
use crate::filter::RangeFilter;
use crate::partition::{Partition, QueueRow, TaskId};
use crate::storage::QueueStore;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub partition: Partition,
    /// Last task id returned, `None` before the first page.
    pub read_level: Option<TaskId>,
}

impl Cursor {
    pub fn new(partition: Partition) -> Self {
        Self {
            partition,
            read_level: None,
        }
    }

    pub fn resume(partition: Partition, read_level: TaskId) -> Self {
        Self {
            partition,
            read_level: Some(read_level),
        }
    }

    /// Lowest task id the next page may contain, `None` once `TaskId::MAX`
    /// has been returned.
    pub fn next_min(&self) -> Option<TaskId> {
        match self.read_level {
            None => Some(TaskId::MIN),
            Some(level) => level.checked_add(1),
        }
    }

    fn advance(&mut self, rows: &[QueueRow]) {
        if let Some(last) = rows.last() {
            self.read_level = Some(last.task_id);
        }
    }
}

/// Lazy page-at-a-time scan in ascending task id order.
///
/// Each `next()` is one bounded select. Iteration ends after the first short
/// or empty page, or after an error.
pub struct Pager<'a> {
    store: &'a dyn QueueStore,
    cursor: Cursor,
    max_task_id: Option<TaskId>,
    page_size: usize,
    done: bool,
}

impl<'a> Pager<'a> {
    pub fn new(store: &'a dyn QueueStore, cursor: Cursor, page_size: usize) -> Self {
        Self {
            store,
            cursor,
            max_task_id: None,
            page_size,
            done: false,
        }
    }

    /// Stop at `max_task_id` (inclusive). Rows inserted above it while the
    /// scan runs are never returned.
    pub fn until(mut self, max_task_id: TaskId) -> Self {
        self.max_task_id = Some(max_task_id);
        self
    }

    /// Position after the last returned row. Persist it to resume later.
    pub fn cursor(&self) -> &Cursor {
        &self.cursor
    }

    pub fn into_cursor(self) -> Cursor {
        self.cursor
    }
}

impl Iterator for Pager<'_> {
    type Item = Result<Vec<QueueRow>, SelectError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let Some(min) = self.cursor.next_min() else {
            self.done = true;
            return None;
        };
        let max = self.max_task_id.unwrap_or(TaskId::MAX);
        if min > max {
            self.done = true;
            return None;
        }

        let filter = RangeFilter::range(self.cursor.partition.clone(), min, max)
            .with_page_size(self.page_size);
        match self.store.select_rows(&filter) {
            Ok(rows) if rows.is_empty() => {
                self.done = true;
                None
            }
            Ok(rows) => {
                if rows.len() < self.page_size {
                    self.done = true;
                }
                self.cursor.advance(&rows);
                Some(Ok(rows))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// One page for a pull-style reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub rows: Vec<QueueRow>,
    /// Read level to pass back for the following page. Unchanged when the
    /// page is empty.
    pub next_read_level: Option<TaskId>,
    pub has_more: bool,
}

/// Read up to `page_size` rows above `read_level` (exclusive) and at or
/// below `max_task_id` (inclusive).
pub fn read_page(
    store: &dyn QueueStore,
    partition: &Partition,
    read_level: Option<TaskId>,
    max_task_id: Option<TaskId>,
    page_size: usize,
) -> Result<Page, SelectError> {
    if page_size == 0 {
        return Err(InvalidFilter::ZeroLimit.into());
    }
    let cursor = Cursor {
        partition: partition.clone(),
        read_level,
    };
    let max = max_task_id.unwrap_or(TaskId::MAX);
    let mut rows = match cursor.next_min() {
        Some(min) if min <= max => {
            // One extra row tells us whether anything follows this page.
            let filter = RangeFilter::range(partition.clone(), min, max)
                .with_page_size(page_size.saturating_add(1));
            store.select_rows(&filter)?
        }
        _ => Vec::new(),
    };

    let has_more = rows.len() > page_size;
    rows.truncate(page_size);
    let next_read_level = rows.last().map(|r| r.task_id).or(read_level);
    Ok(Page {
        rows,
        next_read_level,
        has_more,
    })
}
