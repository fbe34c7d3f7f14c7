//! AWS IoT Jobs MQTT topic names for a single thing.
//!
//! All job traffic for a thing lives under `$aws/things/<thing>/jobs/`.
//! [`ThingTopics`] builds the request topics the agent publishes to and
//! the subscription filters for the five reply channels it listens on,
//! and maps an inbound topic back to its [`Channel`].

use crate::error::CoreError;

/// Single-level MQTT wildcard, used in place of a job id to receive
/// update replies for every job.
pub const WILDCARD_JOB_ID: &str = "+";

/// Reserved job id addressing "the next pending execution".
const NEXT_JOB_ID: &str = "$next";

// ---------------------------------------------------------------------------
// Channel
// ---------------------------------------------------------------------------

/// Inbound reply channels the job processor subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    /// Server notice that the next pending execution may have changed.
    NotifyNext,
    /// The server handed out the next pending execution (or none).
    StartNextAccepted,
    /// The server refused a start-next request.
    StartNextRejected,
    /// A status update for some job was recorded.
    UpdateAccepted,
    /// A status update for some job was refused (e.g. stale version).
    UpdateRejected,
}

impl Channel {
    /// Every channel, in subscription order.
    pub const ALL: [Channel; 5] = [
        Channel::NotifyNext,
        Channel::StartNextAccepted,
        Channel::StartNextRejected,
        Channel::UpdateAccepted,
        Channel::UpdateRejected,
    ];

    /// Short name used in log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::NotifyNext => "notify-next",
            Channel::StartNextAccepted => "start-next/accepted",
            Channel::StartNextRejected => "start-next/rejected",
            Channel::UpdateAccepted => "update/accepted",
            Channel::UpdateRejected => "update/rejected",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ThingTopics
// ---------------------------------------------------------------------------

/// Topic builder bound to one thing name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThingTopics {
    thing_name: String,
    prefix: String,
}

impl ThingTopics {
    /// Create the topic set for `thing_name`.
    ///
    /// The name becomes a single topic level, so it must be non-empty and
    /// must not contain a level separator or wildcard.
    pub fn new(thing_name: impl Into<String>) -> Result<Self, CoreError> {
        let thing_name = thing_name.into();
        if !is_valid_level(&thing_name) {
            return Err(CoreError::InvalidThingName(thing_name));
        }
        let prefix = format!("$aws/things/{thing_name}/jobs/");
        Ok(Self { thing_name, prefix })
    }

    pub fn thing_name(&self) -> &str {
        &self.thing_name
    }

    /// Subscription filter for an inbound channel.
    ///
    /// The update channels use [`WILDCARD_JOB_ID`] so replies for any job
    /// are received.
    pub fn subscription(&self, channel: Channel) -> String {
        match channel {
            Channel::NotifyNext => format!("{}notify-next", self.prefix),
            Channel::StartNextAccepted => format!("{}/accepted", self.start_next()),
            Channel::StartNextRejected => format!("{}/rejected", self.start_next()),
            Channel::UpdateAccepted => {
                format!("{}{WILDCARD_JOB_ID}/update/accepted", self.prefix)
            }
            Channel::UpdateRejected => {
                format!("{}{WILDCARD_JOB_ID}/update/rejected", self.prefix)
            }
        }
    }

    /// All five subscription filters, in [`Channel::ALL`] order.
    pub fn subscriptions(&self) -> Vec<String> {
        Channel::ALL
            .iter()
            .map(|channel| self.subscription(*channel))
            .collect()
    }

    /// Request topic for claiming the next pending execution.
    pub fn start_next(&self) -> String {
        format!("{}{NEXT_JOB_ID}/start-next", self.prefix)
    }

    /// Request topic for updating the status of `job_id`.
    pub fn update(&self, job_id: &str) -> Result<String, CoreError> {
        if !is_valid_level(job_id) {
            return Err(CoreError::InvalidJobId(job_id.to_string()));
        }
        Ok(format!("{}{job_id}/update", self.prefix))
    }

    /// Map an inbound topic to the channel it belongs to.
    ///
    /// Returns `None` for topics outside this thing's job namespace or
    /// for request topics echoed back by the broker.
    pub fn classify(&self, topic: &str) -> Option<Channel> {
        let rest = topic.strip_prefix(&self.prefix)?;

        if rest == "notify-next" {
            return Some(Channel::NotifyNext);
        }

        let (job_id, reply) = rest.split_once('/')?;
        match (job_id, reply) {
            (NEXT_JOB_ID, "start-next/accepted") => Some(Channel::StartNextAccepted),
            (NEXT_JOB_ID, "start-next/rejected") => Some(Channel::StartNextRejected),
            (id, "update/accepted") if is_valid_level(id) => Some(Channel::UpdateAccepted),
            (id, "update/rejected") if is_valid_level(id) => Some(Channel::UpdateRejected),
            _ => None,
        }
    }

    /// Job id level of an update reply topic, e.g. `job-7` in
    /// `.../jobs/job-7/update/accepted`.
    pub fn update_job_id<'a>(&self, topic: &'a str) -> Option<&'a str> {
        match self.classify(topic)? {
            Channel::UpdateAccepted | Channel::UpdateRejected => {
                topic.strip_prefix(&self.prefix)?.split('/').next()
            }
            _ => None,
        }
    }
}

/// A value usable as exactly one topic level.
fn is_valid_level(value: &str) -> bool {
    !value.is_empty() && !value.contains(['/', '+', '#'])
}

// ---------------------------------------------------------------------------
// Filter matching
// ---------------------------------------------------------------------------

/// MQTT topic filter matching.
///
/// `+` matches exactly one level and a trailing `#` matches the parent
/// level and everything below it. Filters starting with a wildcard never
/// match topics whose first level begins with `$`.
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    if topic.starts_with('$') && (filter.starts_with('+') || filter.starts_with('#')) {
        return false;
    }

    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return filter_levels.next().is_none(),
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn topics() -> ThingTopics {
        ThingTopics::new("pi-01").unwrap()
    }

    #[test]
    fn subscription_filters() {
        let t = topics();
        assert_eq!(
            t.subscriptions(),
            vec![
                "$aws/things/pi-01/jobs/notify-next",
                "$aws/things/pi-01/jobs/$next/start-next/accepted",
                "$aws/things/pi-01/jobs/$next/start-next/rejected",
                "$aws/things/pi-01/jobs/+/update/accepted",
                "$aws/things/pi-01/jobs/+/update/rejected",
            ]
        );
    }

    #[test]
    fn request_topics() {
        let t = topics();
        assert_eq!(t.start_next(), "$aws/things/pi-01/jobs/$next/start-next");
        assert_eq!(
            t.update("job-42").unwrap(),
            "$aws/things/pi-01/jobs/job-42/update"
        );
    }

    #[test]
    fn rejects_invalid_names() {
        assert_matches!(ThingTopics::new(""), Err(CoreError::InvalidThingName(_)));
        assert_matches!(
            ThingTopics::new("a/b"),
            Err(CoreError::InvalidThingName(_))
        );
        assert_matches!(ThingTopics::new("a+"), Err(CoreError::InvalidThingName(_)));
        assert_matches!(topics().update("x/#"), Err(CoreError::InvalidJobId(_)));
    }

    #[test]
    fn classify_reply_topics() {
        let t = topics();
        assert_eq!(
            t.classify("$aws/things/pi-01/jobs/notify-next"),
            Some(Channel::NotifyNext)
        );
        assert_eq!(
            t.classify("$aws/things/pi-01/jobs/$next/start-next/accepted"),
            Some(Channel::StartNextAccepted)
        );
        assert_eq!(
            t.classify("$aws/things/pi-01/jobs/$next/start-next/rejected"),
            Some(Channel::StartNextRejected)
        );
        assert_eq!(
            t.classify("$aws/things/pi-01/jobs/job-7/update/accepted"),
            Some(Channel::UpdateAccepted)
        );
        assert_eq!(
            t.classify("$aws/things/pi-01/jobs/job-7/update/rejected"),
            Some(Channel::UpdateRejected)
        );
    }

    #[test]
    fn classify_ignores_foreign_and_request_topics() {
        let t = topics();
        assert_eq!(t.classify("$aws/things/other/jobs/notify-next"), None);
        assert_eq!(t.classify("$aws/things/pi-01/jobs/$next/start-next"), None);
        assert_eq!(t.classify("$aws/things/pi-01/jobs/job-7/update"), None);
        assert_eq!(t.classify("$aws/things/pi-01/jobs/notify"), None);
    }

    #[test]
    fn every_subscription_classifies_to_its_channel() {
        let t = topics();
        for channel in Channel::ALL {
            let topic = t.subscription(channel).replace('+', "job-1");
            assert_eq!(t.classify(&topic), Some(channel), "{topic}");
        }
    }

    #[test]
    fn update_job_id_from_reply_topic() {
        let t = topics();
        assert_eq!(
            t.update_job_id("$aws/things/pi-01/jobs/job-7/update/rejected"),
            Some("job-7")
        );
        assert_eq!(t.update_job_id("$aws/things/pi-01/jobs/notify-next"), None);
    }

    #[test]
    fn filter_matching() {
        assert!(topic_matches("a/+/c", "a/b/c"));
        assert!(!topic_matches("a/+/c", "a/b/d"));
        assert!(!topic_matches("a/+", "a/b/c"));
        assert!(topic_matches("a/#", "a"));
        assert!(topic_matches("a/#", "a/b/c"));
        assert!(topic_matches("a/b", "a/b"));
        assert!(!topic_matches("a/b", "a/b/c"));
        assert!(!topic_matches("#", "$aws/things/x"));
        assert!(topic_matches(
            "$aws/things/pi-01/jobs/+/update/accepted",
            "$aws/things/pi-01/jobs/job-9/update/accepted"
        ));
    }
}
