use crate::services::dispatcher::EngineSnapshot;
use crate::services::reporter::PlatformStats;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct AppStats {
    pub queue_max: usize,
    pub queue_usage: usize,
    pub pusher_max: u64,
    pub pusher_count: usize,
    pub ios: PlatformCounts,
    pub android: PlatformCounts,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PlatformCounts {
    pub push_success: u64,
    pub push_error: u64,
}

impl From<PlatformStats> for PlatformCounts {
    fn from(s: PlatformStats) -> Self {
        Self { push_success: s.push_success, push_error: s.push_error }
    }
}

impl From<EngineSnapshot> for AppStats {
    fn from(s: EngineSnapshot) -> Self {
        Self {
            queue_max: s.queue_max,
            queue_usage: s.queue_usage,
            pusher_max: s.pusher_max,
            pusher_count: s.pusher_count,
            ios: s.ios.into(),
            android: s.android.into(),
        }
    }
}
