//! Progress record for one execution.
//!
//! A [`Ray`] carries everything an observer needs to follow an execution:
//! status, per-name progress bars, messages and timestamps. Fields are private
//! and every mutation goes through a method, so each logical mutation refreshes
//! `updated_at` and fires the change listener exactly once.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ids::Qid;

/// Name of the bar every record starts with.
pub const DEFAULT_BAR: &str = "default";

/// Listener invoked after each mutation of a [`Ray`].
///
/// The record only borrows the listener's behaviour; whoever installed it
/// keeps its own lifetime (capture a `Weak` if the owner may go away first).
pub type ChangeCallback = Arc<dyn Fn(&Ray) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RayStatus {
    #[default]
    Unknown,
    Queued,
    /// Reserved for remote/async flows; never reached purely in-process.
    Pending,
    Running,
    Completed,
    Canceled,
    Failed,
    Removed,
}

impl RayStatus {
    /// Statuses a finished record may carry.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Failed | Self::Removed
        )
    }

    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Queued => "QUEUED",
            Self::Pending => "PENDING",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Removed => "REMOVED",
        }
    }
}

impl fmt::Display for RayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One progress bar: completion percentage and estimated seconds remaining.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Bar {
    pub percent: f64,
    pub remaining: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageKind {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RayError {
    #[error("status {0} is not terminal; a finished record must be COMPLETED, CANCELED, FAILED or REMOVED")]
    NotTerminal(RayStatus),
}

/// Rate bookkeeping behind [`Ray::progress`]. Not serialized.
#[derive(Debug, Clone, Copy)]
struct BarTracker {
    done: f64,
    total: f64,
    started: Instant,
}

fn default_bars() -> BTreeMap<String, Bar> {
    BTreeMap::from([(DEFAULT_BAR.to_string(), Bar::default())])
}

#[derive(Serialize, Deserialize)]
pub struct Ray {
    qid: Qid,
    #[serde(default)]
    sid: Option<String>,
    #[serde(default)]
    uid: Option<String>,
    #[serde(default)]
    rid: Option<String>,
    #[serde(default)]
    status: RayStatus,
    #[serde(default)]
    finished: bool,
    #[serde(default = "default_bars")]
    bars: BTreeMap<String, Bar>,
    #[serde(default)]
    messages: Vec<Message>,
    #[serde(default = "Utc::now")]
    created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    updated_at: DateTime<Utc>,
    #[serde(skip)]
    trackers: HashMap<String, BarTracker>,
    #[serde(skip)]
    on_change: Option<ChangeCallback>,
}

impl Ray {
    #[must_use]
    pub fn new(qid: Qid) -> Self {
        let now = Utc::now();
        Self {
            qid,
            sid: None,
            uid: None,
            rid: None,
            status: RayStatus::Unknown,
            finished: false,
            bars: default_bars(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            trackers: HashMap::new(),
            on_change: None,
        }
    }

    #[must_use]
    pub fn qid(&self) -> &Qid {
        &self.qid
    }

    #[must_use]
    pub fn sid(&self) -> Option<&str> {
        self.sid.as_deref()
    }

    #[must_use]
    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    #[must_use]
    pub fn rid(&self) -> Option<&str> {
        self.rid.as_deref()
    }

    #[must_use]
    pub fn status(&self) -> RayStatus {
        self.status
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    #[must_use]
    pub fn bars(&self) -> &BTreeMap<String, Bar> {
        &self.bars
    }

    #[must_use]
    pub fn bar(&self, name: &str) -> Option<Bar> {
        self.bars.get(name).copied()
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Install the change listener. Installing is not itself a mutation.
    pub fn on_update(&mut self, callback: ChangeCallback) {
        self.on_change = Some(callback);
    }

    pub fn clear_listener(&mut self) {
        self.on_change = None;
    }

    /// Change the status. A non-terminal status reopens a finished record.
    pub fn set_status(&mut self, status: RayStatus) {
        self.status = status;
        self.finished &= status.is_terminal();
        self.touch();
    }

    /// Reset the record for a fresh run: QUEUED, unfinished, new correlation ids.
    pub fn requeue(&mut self, sid: Option<String>, uid: Option<String>, rid: Option<String>) {
        self.status = RayStatus::Queued;
        self.finished = false;
        self.sid = sid;
        self.uid = uid;
        self.rid = rid;
        self.touch();
    }

    /// Move to a terminal status and mark the record finished.
    ///
    /// The default bar is completed as part of the same mutation.
    pub fn finish(&mut self, status: RayStatus) -> Result<(), RayError> {
        if !status.is_terminal() {
            return Err(RayError::NotTerminal(status));
        }
        self.status = status;
        self.fill_bar(DEFAULT_BAR);
        self.finished = true;
        self.touch();
        Ok(())
    }

    /// Fill bar `name` to 100% with nothing remaining.
    pub fn complete(&mut self, name: &str) {
        self.fill_bar(name);
        self.touch();
    }

    /// Advance bar `name` by `step` out of `total`.
    ///
    /// Remaining time is extrapolated from the average rate since the first
    /// call for this bar.
    pub fn progress(&mut self, name: &str, step: f64, total: f64) {
        let tracker = self
            .trackers
            .entry(name.to_string())
            .or_insert_with(|| BarTracker {
                done: 0.0,
                total,
                started: Instant::now(),
            });
        tracker.total = total;
        tracker.done += step;

        let elapsed = tracker.started.elapsed().as_secs_f64();
        let rate = if elapsed > 0.0 {
            tracker.done / elapsed
        } else {
            0.0
        };
        let remaining = if rate > 0.0 && tracker.total > 0.0 {
            ((tracker.total - tracker.done) / rate).max(0.0)
        } else {
            0.0
        };
        let percent = if tracker.total > 0.0 {
            (tracker.done / tracker.total * 100.0).clamp(0.0, 100.0)
        } else {
            0.0
        };

        self.bars
            .insert(name.to_string(), Bar { percent, remaining });
        self.touch();
    }

    pub fn message(&mut self, kind: MessageKind, content: impl Into<String>) {
        self.messages.push(Message {
            kind,
            content: content.into(),
            created_at: Utc::now(),
        });
        self.touch();
    }

    pub fn clear_messages(&mut self) {
        if self.messages.is_empty() {
            return;
        }
        self.messages.clear();
        self.touch();
    }

    /// Fold `other` into this record.
    ///
    /// Every field except the identity fields (qid, sid, uid, rid) is
    /// replaced. Counts as a single mutation however many fields differ.
    /// A finished flag paired with a non-terminal status is not carried over.
    pub fn merge(&mut self, other: &Ray) {
        self.status = other.status;
        self.finished = other.finished && other.status.is_terminal();
        self.bars = other.bars.clone();
        self.messages = other.messages.clone();
        self.created_at = other.created_at;
        self.updated_at = other.updated_at;
        self.touch();
    }

    fn fill_bar(&mut self, name: &str) {
        self.bars.insert(
            name.to_string(),
            Bar {
                percent: 100.0,
                remaining: 0.0,
            },
        );
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
        if let Some(callback) = &self.on_change {
            callback(self);
        }
    }
}

/// Clones carry the data only; the listener and rate trackers stay behind so
/// that mutating a snapshot never notifies the original's observer.
impl Clone for Ray {
    fn clone(&self) -> Self {
        Self {
            qid: self.qid.clone(),
            sid: self.sid.clone(),
            uid: self.uid.clone(),
            rid: self.rid.clone(),
            status: self.status,
            finished: self.finished,
            bars: self.bars.clone(),
            messages: self.messages.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            trackers: HashMap::new(),
            on_change: None,
        }
    }
}

impl fmt::Debug for Ray {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ray")
            .field("qid", &self.qid)
            .field("sid", &self.sid)
            .field("uid", &self.uid)
            .field("rid", &self.rid)
            .field("status", &self.status)
            .field("finished", &self.finished)
            .field("bars", &self.bars)
            .field("messages", &self.messages.len())
            .field("created_at", &self.created_at)
            .field("updated_at", &self.updated_at)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn counting_ray(qid: &str) -> (Ray, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let mut ray = Ray::new(Qid::from(qid));
        let counter = count.clone();
        ray.on_update(Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        (ray, count)
    }

    #[test]
    fn new_ray_is_unknown_with_default_bar() {
        let ray = Ray::new(Qid::from("q"));
        assert_eq!(ray.status(), RayStatus::Unknown);
        assert!(!ray.is_finished());
        assert_eq!(ray.bar(DEFAULT_BAR), Some(Bar::default()));
    }

    #[test]
    fn merge_keeps_identity_and_notifies_once() {
        let (mut ray, count) = counting_ray("q1");
        ray.requeue(Some("s1".into()), Some("u1".into()), Some("r1".into()));
        count.store(0, Ordering::SeqCst);

        let mut other = Ray::new(Qid::from("other"));
        other.requeue(Some("s2".into()), Some("u2".into()), Some("r2".into()));
        other.message(MessageKind::Warning, "careful");
        other.progress("download", 50.0, 100.0);
        other.finish(RayStatus::Completed).unwrap();

        ray.merge(&other);

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(ray.qid().as_str(), "q1");
        assert_eq!(ray.sid(), Some("s1"));
        assert_eq!(ray.uid(), Some("u1"));
        assert_eq!(ray.rid(), Some("r1"));
        assert_eq!(ray.status(), RayStatus::Completed);
        assert!(ray.is_finished());
        assert_eq!(ray.messages().len(), 1);
        assert!(ray.bar("download").is_some());
    }

    #[test]
    fn non_terminal_status_reopens_a_finished_record() {
        let mut ray = Ray::new(Qid::from("q"));
        ray.finish(RayStatus::Completed).unwrap();
        ray.set_status(RayStatus::Failed);
        assert!(ray.is_finished());

        ray.set_status(RayStatus::Running);
        assert_eq!(ray.status(), RayStatus::Running);
        assert!(!ray.is_finished());
    }

    #[test]
    fn merge_drops_finished_flag_paired_with_live_status() {
        let mut ray = Ray::new(Qid::from("q"));
        let incoming: Ray = serde_json::from_value(serde_json::json!({
            "qid": "q",
            "status": "RUNNING",
            "finished": true,
        }))
        .unwrap();

        ray.merge(&incoming);
        assert_eq!(ray.status(), RayStatus::Running);
        assert!(!ray.is_finished());
    }

    #[test]
    fn each_mutation_fires_exactly_once() {
        let (mut ray, count) = counting_ray("q");
        ray.set_status(RayStatus::Running);
        ray.message(MessageKind::Info, "hello");
        ray.progress(DEFAULT_BAR, 10.0, 100.0);
        ray.complete("other");
        assert_eq!(count.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn clear_messages_on_empty_is_silent() {
        let (mut ray, count) = counting_ray("q");
        ray.clear_messages();
        assert_eq!(count.load(Ordering::SeqCst), 0);
        ray.message(MessageKind::Info, "x");
        ray.clear_messages();
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(ray.messages().is_empty());
    }

    #[test]
    fn finish_rejects_non_terminal_status() {
        let (mut ray, count) = counting_ray("q");
        assert_eq!(
            ray.finish(RayStatus::Running),
            Err(RayError::NotTerminal(RayStatus::Running))
        );
        assert!(!ray.is_finished());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        ray.finish(RayStatus::Failed).unwrap();
        assert!(ray.is_finished());
        assert_eq!(ray.bar(DEFAULT_BAR).map(|b| b.percent), Some(100.0));
    }

    #[test]
    fn mutation_refreshes_updated_at() {
        let mut ray = Ray::new(Qid::from("q"));
        let before = ray.updated_at();
        std::thread::sleep(std::time::Duration::from_millis(5));
        ray.set_status(RayStatus::Queued);
        assert!(ray.updated_at() > before);
    }

    #[test]
    fn progress_tracks_percent_of_total() {
        let mut ray = Ray::new(Qid::from("q"));
        ray.progress("io", 25.0, 200.0);
        ray.progress("io", 25.0, 200.0);
        let bar = ray.bar("io").unwrap();
        assert!((bar.percent - 25.0).abs() < f64::EPSILON);
        assert!(bar.remaining >= 0.0);
    }

    #[test]
    fn clone_drops_listener() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut ray = Ray::new(Qid::from("q"));
        let sink = seen.clone();
        ray.on_update(Arc::new(move |r| {
            sink.lock().unwrap().push(r.status());
        }));

        let mut copy = ray.clone();
        copy.set_status(RayStatus::Running);
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn serialized_layout_uses_upper_case_status_and_type() {
        let mut ray = Ray::new(Qid::from("q"));
        ray.message(MessageKind::Error, "boom");
        ray.set_status(RayStatus::Failed);
        let value = serde_json::to_value(&ray).unwrap();
        assert_eq!(value["qid"], "q");
        assert_eq!(value["status"], "FAILED");
        assert_eq!(value["messages"][0]["type"], "ERROR");
        assert_eq!(value["bars"]["default"]["percent"], 0.0);

        let back: Ray = serde_json::from_value(value).unwrap();
        assert_eq!(back.status(), RayStatus::Failed);
        assert_eq!(back.messages()[0].content, "boom");
    }

    #[test]
    fn deserializes_sparse_payload_with_defaults() {
        let ray: Ray = serde_json::from_value(serde_json::json!({"qid": "q9"})).unwrap();
        assert_eq!(ray.qid().as_str(), "q9");
        assert_eq!(ray.status(), RayStatus::Unknown);
        assert!(ray.bar(DEFAULT_BAR).is_some());
    }
}
