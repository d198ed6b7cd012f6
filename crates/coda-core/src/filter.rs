use crate::error::InvalidFilter;
use crate::partition::{Partition, TaskId};

/// Query descriptor shared by selects and deletes.
///
/// Set exactly one of: `task_id` (point), `min_task_id`/`max_task_id`
/// (inclusive range), or `task_id_less_than_equals` (threshold). Selects
/// truncate to `page_size`; deletes stop after `limit` rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeFilter {
    pub partition: Partition,
    pub min_task_id: Option<TaskId>,
    pub max_task_id: Option<TaskId>,
    pub task_id: Option<TaskId>,
    pub task_id_less_than_equals: Option<TaskId>,
    pub page_size: Option<usize>,
    pub limit: Option<usize>,
}

/// A validated filter, as backends consume it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Point(TaskId),
    /// Inclusive on both ends; lowest task ids first.
    Range {
        min: TaskId,
        max: TaskId,
        limit: Option<usize>,
    },
}

impl RangeFilter {
    /// Everything in the partition. Only valid for selects.
    pub fn all(partition: Partition) -> Self {
        Self {
            partition,
            min_task_id: None,
            max_task_id: None,
            task_id: None,
            task_id_less_than_equals: None,
            page_size: None,
            limit: None,
        }
    }

    pub fn point(partition: Partition, task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::all(partition)
        }
    }

    pub fn range(partition: Partition, min_task_id: TaskId, max_task_id: TaskId) -> Self {
        Self {
            min_task_id: Some(min_task_id),
            max_task_id: Some(max_task_id),
            ..Self::all(partition)
        }
    }

    /// Oldest rows at or below `threshold`, at most `limit` of them.
    pub fn up_to(partition: Partition, threshold: TaskId, limit: Option<usize>) -> Self {
        Self {
            task_id_less_than_equals: Some(threshold),
            limit,
            ..Self::all(partition)
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = Some(page_size);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Resolve for a select. An unbounded filter scans the whole partition.
    pub fn for_select(&self) -> Result<FilterKind, InvalidFilter> {
        self.resolve(self.page_size.or(self.limit), true)
    }

    /// Resolve for a delete. Unbounded deletes are refused.
    pub fn for_delete(&self) -> Result<FilterKind, InvalidFilter> {
        self.resolve(self.limit.or(self.page_size), false)
    }

    fn resolve(
        &self,
        limit: Option<usize>,
        allow_unbounded: bool,
    ) -> Result<FilterKind, InvalidFilter> {
        if limit == Some(0) {
            return Err(InvalidFilter::ZeroLimit);
        }
        let has_range = self.min_task_id.is_some() || self.max_task_id.is_some();

        if let Some(task_id) = self.task_id {
            if has_range || self.task_id_less_than_equals.is_some() {
                return Err(InvalidFilter::PointWithRange);
            }
            return Ok(FilterKind::Point(task_id));
        }

        if let Some(threshold) = self.task_id_less_than_equals {
            if has_range {
                return Err(InvalidFilter::ThresholdWithRange);
            }
            return Ok(FilterKind::Range {
                min: TaskId::MIN,
                max: threshold,
                limit,
            });
        }

        if !has_range && !allow_unbounded {
            return Err(InvalidFilter::Unbounded);
        }

        Ok(FilterKind::Range {
            min: self.min_task_id.unwrap_or(TaskId::MIN),
            max: self.max_task_id.unwrap_or(TaskId::MAX),
            limit,
        })
    }
}

impl FilterKind {
    pub fn contains(&self, task_id: TaskId) -> bool {
        match *self {
            FilterKind::Point(id) => id == task_id,
            FilterKind::Range { min, max, .. } => min <= task_id && task_id <= max,
        }
    }

    pub fn limit(&self) -> usize {
        match *self {
            FilterKind::Point(_) => 1,
            FilterKind::Range { limit, .. } => limit.unwrap_or(usize::MAX),
        }
    }
}
