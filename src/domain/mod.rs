pub mod job;
pub mod outcome;
