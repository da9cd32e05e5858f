pub mod push;
pub mod stats;
