pub mod push_worker;

pub use push_worker::PushWorker;
