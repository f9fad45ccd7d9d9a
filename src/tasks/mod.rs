pub mod claims;
pub mod reminder_engine;
pub mod scheduler;
pub mod task_runner;
