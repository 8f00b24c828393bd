//! Database models.
//!
//! Row types and request/response types of the three stores.

pub mod job;
pub mod ledger;
pub mod search;
pub mod task_queue;

pub use job::{
    AttrValue, ColumnKind, CommandStatus, HeartBeatName, InsertedJob, JobAttributes, JobColumn,
    JobCommand, JobRecord, JobRow, JobStatusInfo,
};
pub use ledger::{JobStatusUpdate, NewStatusRecord, StatusRecord};
pub use search::{
    FilterOperator, Pagination, SearchFilter, SearchParams, SearchResult, SearchScalar,
    SortDirection, SortSpec,
};
pub use task_queue::{
    Criterion, TaskQueueCriteria, TaskQueueDefinition, TaskQueueInfo, TaskQueueOwner,
    TaskQueueRow,
};
