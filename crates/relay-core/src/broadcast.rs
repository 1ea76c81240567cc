//! Live fan-out to viewer sessions.
//!
//! Deliveries run concurrently, each bounded by the delivery timeout. A
//! session whose delivery fails or times out is pruned on the spot and the
//! remaining sessions get a `session_closed` notice naming it. Notices can
//! themselves fail, so pruning repeats until a round prunes nobody.

use parking_lot::Mutex;
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use relay_common::{PipelineName, SessionId};

use crate::metrics::ViewerMetrics;

/// Outbound half of a viewer session.
pub type SessionSender = mpsc::Sender<Arc<str>>;

/// Outcome of one broadcast or disconnect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Sessions that received the frame itself.
    pub delivered: usize,
    /// Sessions removed because a delivery failed, in pruning order.
    pub pruned: Vec<SessionId>,
}

/// Viewer sessions of one pipeline.
pub struct LiveBroadcaster {
    pipeline: PipelineName,
    sessions: Mutex<HashMap<SessionId, SessionSender>>,
    delivery_timeout: Duration,
    metrics: Option<ViewerMetrics>,
}

impl LiveBroadcaster {
    pub fn new(pipeline: PipelineName, delivery_timeout: Duration) -> Self {
        Self {
            pipeline,
            sessions: Mutex::new(HashMap::new()),
            delivery_timeout,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: ViewerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn pipeline(&self) -> &PipelineName {
        &self.pipeline
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn contains(&self, id: &SessionId) -> bool {
        self.sessions.lock().contains_key(id)
    }

    /// Add a session after its handshake.
    pub fn connect(&self, id: SessionId, sender: SessionSender) {
        let count = {
            let mut sessions = self.sessions.lock();
            sessions.insert(id.clone(), sender);
            sessions.len()
        };
        self.publish(count);
        info!(pipeline = %self.pipeline, session = %id, sessions = count, "Viewer connected");
    }

    /// Remove a session and tell the others it is gone.
    pub async fn disconnect(&self, id: &SessionId) -> BroadcastReport {
        let (removed, count) = {
            let mut sessions = self.sessions.lock();
            (sessions.remove(id).is_some(), sessions.len())
        };
        if !removed {
            return BroadcastReport::default();
        }
        self.publish(count);
        info!(pipeline = %self.pipeline, session = %id, "Viewer disconnected");

        let mut report = BroadcastReport::default();
        self.notify_closed(VecDeque::from([id.clone()]), &mut report)
            .await;
        report
    }

    /// Deliver one frame to every session.
    pub async fn broadcast(&self, frame: &str) -> BroadcastReport {
        let (delivered, failed) = self.deliver(Arc::from(frame)).await;
        let mut report = BroadcastReport {
            delivered,
            pruned: failed.clone(),
        };
        if !failed.is_empty() {
            self.notify_closed(failed.into(), &mut report).await;
        }
        report
    }

    async fn notify_closed(&self, mut closed: VecDeque<SessionId>, report: &mut BroadcastReport) {
        while let Some(id) = closed.pop_front() {
            let (_, failed) = self.deliver(session_closed_notice(&id)).await;
            report.pruned.extend(failed.iter().cloned());
            closed.extend(failed);
        }
    }

    /// One concurrent delivery round. Failed sessions are pruned before
    /// returning.
    async fn deliver(&self, frame: Arc<str>) -> (usize, Vec<SessionId>) {
        let targets: Vec<(SessionId, SessionSender)> = self
            .sessions
            .lock()
            .iter()
            .map(|(id, tx)| (id.clone(), tx.clone()))
            .collect();
        if targets.is_empty() {
            return (0, Vec::new());
        }

        let mut deliveries = JoinSet::new();
        for (id, tx) in targets {
            let frame = Arc::clone(&frame);
            let timeout = self.delivery_timeout;
            deliveries.spawn(async move {
                let ok = tx.send_timeout(frame, timeout).await.is_ok();
                (id, ok)
            });
        }

        let mut delivered = 0;
        let mut failed = Vec::new();
        while let Some(joined) = deliveries.join_next().await {
            match joined {
                Ok((_, true)) => delivered += 1,
                Ok((id, false)) => failed.push(id),
                Err(e) => warn!(pipeline = %self.pipeline, error = %e, "Delivery task failed"),
            }
        }

        if !failed.is_empty() {
            let count = {
                let mut sessions = self.sessions.lock();
                for id in &failed {
                    sessions.remove(id);
                }
                sessions.len()
            };
            self.publish(count);
            for id in &failed {
                warn!(pipeline = %self.pipeline, session = %id, "Pruned viewer session after failed delivery");
            }
            if let Some(metrics) = &self.metrics {
                metrics.pruned.inc_by(failed.len() as u64);
            }
        }
        debug!(pipeline = %self.pipeline, delivered, pruned = failed.len(), "Broadcast round");
        (delivered, failed)
    }

    fn publish(&self, count: usize) {
        if let Some(metrics) = &self.metrics {
            metrics.sessions.set(count as i64);
        }
    }
}

/// Notice sent to remaining viewers when a session goes away.
///
/// `session_id` is unique per connection; `client_id` is whatever the viewer
/// announced and may be shared or empty.
pub fn session_closed_notice(id: &SessionId) -> Arc<str> {
    let notice = json!({
        "event": "session_closed",
        "client_id": id.client_id(),
        "session_id": id.to_string(),
    });
    Arc::from(notice.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::StreamKind;

    fn broadcaster() -> LiveBroadcaster {
        LiveBroadcaster::new(
            PipelineName::for_kind(StreamKind::Telemetry),
            Duration::from_millis(200),
        )
    }

    fn session(b: &LiveBroadcaster, client: &str, buffer: usize) -> (SessionId, mpsc::Receiver<Arc<str>>) {
        let id = SessionId::new(client);
        let (tx, rx) = mpsc::channel(buffer);
        b.connect(id.clone(), tx);
        (id, rx)
    }

    #[tokio::test]
    async fn test_failed_session_is_pruned_and_others_notified() {
        let b = broadcaster();
        let (_, mut rx1) = session(&b, "one", 8);
        let (id2, rx2) = session(&b, "two", 8);
        let (_, mut rx3) = session(&b, "three", 8);
        drop(rx2);

        let report = b.broadcast("{\"n\":1}").await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![id2.clone()]);
        assert!(!b.contains(&id2));
        assert_eq!(b.session_count(), 2);

        for rx in [&mut rx1, &mut rx3] {
            assert_eq!(&*rx.recv().await.expect("frame"), "{\"n\":1}");
            let notice: serde_json::Value =
                serde_json::from_str(&rx.recv().await.expect("notice")).expect("json");
            assert_eq!(notice["event"], "session_closed");
            assert_eq!(notice["client_id"], "two");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_session_times_out() {
        let b = broadcaster();
        let (_, mut fast) = session(&b, "fast", 8);
        let (slow_id, _slow_rx) = session(&b, "slow", 1);

        let first = b.broadcast("a").await;
        assert_eq!(first.delivered, 2);

        let started = tokio::time::Instant::now();
        let second = b.broadcast("b").await;
        assert_eq!(second.delivered, 1);
        assert_eq!(second.pruned, vec![slow_id]);
        assert!(started.elapsed() >= Duration::from_millis(200));

        assert_eq!(&*fast.recv().await.expect("a"), "a");
        assert_eq!(&*fast.recv().await.expect("b"), "b");
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining() {
        let b = broadcaster();
        let (id1, _rx1) = session(&b, "leaving", 4);
        let (_, mut rx2) = session(&b, "staying", 4);

        let report = b.disconnect(&id1).await;
        assert!(report.pruned.is_empty());
        let notice = rx2.recv().await.expect("notice");
        assert!(notice.contains("\"client_id\":\"leaving\""));

        assert_eq!(b.disconnect(&id1).await, BroadcastReport::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_notice_prunes_again() {
        let b = broadcaster();
        let (gone, rx_gone) = session(&b, "gone", 4);
        let (stuck, _rx_stuck) = session(&b, "stuck", 1);
        let (_, mut rx_ok) = session(&b, "ok", 8);
        drop(rx_gone);

        // "stuck" takes the frame, then cannot take the notice.
        let report = b.broadcast("x").await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.pruned, vec![gone, stuck]);
        assert_eq!(b.session_count(), 1);

        assert_eq!(&*rx_ok.recv().await.expect("frame"), "x");
        assert!(rx_ok.recv().await.expect("notice").contains("\"client_id\":\"gone\""));
        assert!(rx_ok.recv().await.expect("notice").contains("\"client_id\":\"stuck\""));
    }

    #[tokio::test]
    async fn test_notices_tell_same_client_sessions_apart() {
        let b = broadcaster();
        let (first, _rx1) = session(&b, "kiosk", 4);
        let (second, _rx2) = session(&b, "kiosk", 4);
        let (_, mut watcher) = session(&b, "watcher", 4);
        assert_ne!(first, second);

        b.disconnect(&first).await;
        b.disconnect(&second).await;

        let mut seen = Vec::new();
        for _ in 0..2 {
            let notice: serde_json::Value =
                serde_json::from_str(&watcher.recv().await.expect("notice")).expect("json");
            assert_eq!(notice["client_id"], "kiosk");
            seen.push(notice["session_id"].as_str().expect("session_id").to_string());
        }
        assert_eq!(seen, vec![first.to_string(), second.to_string()]);
    }

    #[tokio::test]
    async fn test_metrics_track_sessions() {
        let metrics = crate::metrics::RelayMetrics::new().expect("metrics");
        let viewers = metrics.viewers(&PipelineName::for_kind(StreamKind::Kpm));
        let b = broadcaster().with_metrics(viewers.clone());
        let (_, rx) = session(&b, "gone", 1);
        let (_, _keep) = session(&b, "kept", 4);
        assert_eq!(viewers.sessions.get(), 2);
        drop(rx);
        b.broadcast("z").await;
        assert_eq!(viewers.sessions.get(), 1);
        assert_eq!(viewers.pruned.get(), 1);
    }
}
