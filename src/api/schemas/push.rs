use crate::domain::job::{
    AndroidOptions, ApnsPushType, ExtendField, IosOptions, Platform, PlatformOptions, Priority, PushJob,
};
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub notifications: Vec<RequestNotification>,
}

/// One entry of a submission. Unused fields for the other platform are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RequestNotification {
    pub token: Vec<String>,
    /// 1 = iOS, 2 = Android.
    pub platform: u8,
    pub message: String,
    pub title: Option<String>,
    pub subtitle: Option<String>,
    pub badge: Option<u32>,
    pub sound: Option<String>,
    pub category: Option<String>,
    pub content_available: bool,
    pub mutable_content: bool,
    pub expiry: Option<i64>,
    pub push_type: Option<ApnsPushType>,
    pub collapse_key: Option<String>,
    pub delay_while_idle: bool,
    pub time_to_live: Option<u32>,
    pub priority: Option<Priority>,
    pub extend: Vec<ExtendField>,
    pub identifier: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    #[must_use]
    pub fn ok() -> Self {
        Self { message: "ok".to_string() }
    }
}

impl TryFrom<RequestNotification> for PushJob {
    type Error = String;

    fn try_from(n: RequestNotification) -> Result<Self, Self::Error> {
        let options = match Platform::try_from(n.platform)? {
            Platform::Android => PlatformOptions::Android(AndroidOptions {
                collapse_key: n.collapse_key,
                delay_while_idle: n.delay_while_idle,
                time_to_live: n.time_to_live,
                priority: n.priority.unwrap_or_default(),
            }),
            Platform::Ios => PlatformOptions::Ios(IosOptions {
                subtitle: n.subtitle,
                badge: n.badge,
                sound: n.sound,
                category: n.category,
                content_available: n.content_available,
                mutable_content: n.mutable_content,
                expiry: n.expiry,
                push_type: n.push_type.unwrap_or_default(),
                priority: n.priority.unwrap_or(Priority::High),
                collapse_id: n.collapse_key,
            }),
        };

        let mut job = Self::new(n.token, n.message, options);
        job.title = n.title;
        job.extend = n.extend;
        job.identifier = n.identifier;
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_android_entry_maps_options() {
        let raw = r#"{"token":["abc"],"platform":2,"message":"hi","time_to_live":60,"priority":"high","collapse_key":"k"}"#;
        let entry: RequestNotification = serde_json::from_str(raw).unwrap();
        let job = PushJob::try_from(entry).unwrap();

        assert_eq!(job.platform(), Platform::Android);
        let PlatformOptions::Android(opts) = job.options else { panic!("expected android options") };
        assert_eq!(opts.time_to_live, Some(60));
        assert_eq!(opts.priority, Priority::High);
        assert_eq!(opts.collapse_key.as_deref(), Some("k"));
    }

    #[test]
    fn test_ios_entry_defaults_to_high_priority_alert() {
        let raw = r#"{"token":["abc"],"platform":1,"message":"hi","badge":2,"extend":[{"key":"a","value":"b"}]}"#;
        let entry: RequestNotification = serde_json::from_str(raw).unwrap();
        let job = PushJob::try_from(entry).unwrap();

        let PlatformOptions::Ios(opts) = &job.options else { panic!("expected ios options") };
        assert_eq!(opts.priority, Priority::High);
        assert_eq!(opts.push_type, ApnsPushType::Alert);
        assert_eq!(opts.badge, Some(2));
        assert_eq!(job.extend.len(), 1);
    }

    #[test]
    fn test_unknown_platform_is_rejected() {
        let entry = RequestNotification { token: vec!["abc".into()], platform: 9, ..Default::default() };
        assert!(PushJob::try_from(entry).is_err());
    }
}
