pub mod classify_pipeline;
pub mod labels;
pub mod models;
pub mod task;
