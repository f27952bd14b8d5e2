pub mod job;
pub mod step;
pub mod task;
pub mod worker;

pub use job::Job;
pub use step::Step;
pub use task::Task;
pub use worker::Worker;
