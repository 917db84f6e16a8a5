// Splitting the batch and deciding the fan-out width

pub mod chunker;
pub mod planner;

pub use chunker::{chunk_count, split, split_batch, HeaderPolicy};
pub use planner::{plan_key, FanoutPlanner, PlanRecord, TASK_COUNT_KEY};
