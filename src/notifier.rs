use crate::alerts::Alert;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("telegram request failed: {0}")]
    Request(#[from] teloxide::RequestError),
    #[error("recipient {0} is unreachable")]
    Unreachable(i64),
}

/// Delivers one alert to one recipient.
pub trait AlertSink: Send + Sync + 'static {
    fn deliver(
        &self,
        recipient: i64,
        alert: &Alert,
    ) -> impl Future<Output = Result<(), DeliveryError>> + Send;
}

/// Chats that receive alerts. Cloning shares the same set.
#[derive(Debug, Clone, Default)]
pub struct RecipientSet {
    inner: Arc<RwLock<BTreeSet<i64>>>,
}

impl RecipientSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: i64) -> bool {
        let added = self.inner.write().await.insert(id);
        if added {
            info!(recipient = id, "alert recipient registered");
        }
        added
    }

    pub async fn unregister(&self, id: i64) -> bool {
        let removed = self.inner.write().await.remove(&id);
        if removed {
            info!(recipient = id, "alert recipient unregistered");
        }
        removed
    }

    pub async fn contains(&self, id: i64) -> bool {
        self.inner.read().await.contains(&id)
    }

    pub async fn snapshot(&self) -> Vec<i64> {
        self.inner.read().await.iter().copied().collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: usize,
    pub dropped: usize,
}

pub struct Notifier<S> {
    sink: S,
    recipients: RecipientSet,
}

impl<S: AlertSink> Notifier<S> {
    pub fn new(sink: S, recipients: RecipientSet) -> Self {
        Self { sink, recipients }
    }

    pub fn recipients(&self) -> &RecipientSet {
        &self.recipients
    }

    pub async fn register(&self, id: i64) -> bool {
        self.recipients.register(id).await
    }

    pub async fn unregister(&self, id: i64) -> bool {
        self.recipients.unregister(id).await
    }

    /// Sends every alert to every recipient registered when the call starts.
    /// Per-recipient failures are logged and counted, never propagated.
    pub async fn broadcast(&self, alerts: &[Alert]) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        if alerts.is_empty() {
            return report;
        }

        let recipients = self.recipients.snapshot().await;
        if recipients.is_empty() {
            warn!(alerts = alerts.len(), "no alert recipients registered, alerts dropped");
            report.dropped = alerts.len();
            return report;
        }

        for alert in alerts {
            for &recipient in &recipients {
                match self.sink.deliver(recipient, alert).await {
                    Ok(()) => {
                        report.delivered += 1;
                        info!(recipient, alert_id = alert.id, kind = %alert.kind, "alert delivered");
                    }
                    Err(err) => {
                        report.failed += 1;
                        warn!(recipient, alert_id = alert.id, error = %err, "alert delivery failed");
                    }
                }
            }
        }

        debug!(
            delivered = report.delivered,
            failed = report.failed,
            "broadcast finished"
        );
        report
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::alerts::{AlertKind, Severity};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Records deliveries and fails for the configured recipients.
    #[derive(Default)]
    pub(crate) struct RecordingSink {
        pub delivered: Mutex<Vec<(i64, u64)>>,
        pub failing: HashSet<i64>,
        pub on_deliver: Option<RecipientSet>,
    }

    impl RecordingSink {
        pub fn deliveries(&self) -> Vec<(i64, u64)> {
            self.delivered.lock().map(|v| v.clone()).unwrap_or_default()
        }
    }

    impl AlertSink for Arc<RecordingSink> {
        async fn deliver(&self, recipient: i64, alert: &Alert) -> Result<(), DeliveryError> {
            if let Some(set) = &self.on_deliver {
                set.register(99).await;
                set.unregister(2).await;
            }
            if self.failing.contains(&recipient) {
                return Err(DeliveryError::Unreachable(recipient));
            }
            self.delivered
                .lock()
                .expect("sink lock")
                .push((recipient, alert.id));
            Ok(())
        }
    }

    pub(crate) fn alert(id: u64) -> Alert {
        Alert {
            id,
            kind: AlertKind::Cpu,
            severity: Severity::Warning,
            value: 85.0,
            threshold: 80.0,
            title: "High CPU Usage".to_string(),
            message: "CPU usage is at 85.0%".to_string(),
            emitted_at: 0,
            acknowledged: false,
        }
    }

    async fn recipients(ids: &[i64]) -> RecipientSet {
        let set = RecipientSet::new();
        for id in ids {
            set.register(*id).await;
        }
        set
    }

    #[tokio::test]
    async fn empty_recipient_set_drops_without_error() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone(), RecipientSet::new());
        let report = notifier.broadcast(&[alert(1)]).await;
        assert_eq!(
            report,
            BroadcastReport {
                delivered: 0,
                failed: 0,
                dropped: 1
            }
        );
        assert!(sink.deliveries().is_empty());
    }

    #[tokio::test]
    async fn every_alert_reaches_every_recipient() {
        let sink = Arc::new(RecordingSink::default());
        let notifier = Notifier::new(sink.clone(), recipients(&[1, 2]).await);
        let report = notifier.broadcast(&[alert(1), alert(2)]).await;
        assert_eq!(report.delivered, 4);
        assert_eq!(sink.deliveries(), vec![(1, 1), (2, 1), (1, 2), (2, 2)]);
    }

    #[tokio::test]
    async fn one_failing_recipient_does_not_abort_broadcast() {
        let sink = Arc::new(RecordingSink {
            failing: HashSet::from([1]),
            ..RecordingSink::default()
        });
        let notifier = Notifier::new(sink.clone(), recipients(&[1, 2, 3]).await);
        let report = notifier.broadcast(&[alert(7)]).await;
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(sink.deliveries(), vec![(2, 7), (3, 7)]);
    }

    #[tokio::test]
    async fn set_changes_mid_broadcast_do_not_affect_snapshot() {
        let set = recipients(&[1, 2]).await;
        let sink = Arc::new(RecordingSink {
            on_deliver: Some(set.clone()),
            ..RecordingSink::default()
        });
        let notifier = Notifier::new(sink.clone(), set.clone());
        let report = notifier.broadcast(&[alert(1)]).await;

        assert_eq!(report.delivered, 2);
        assert_eq!(sink.deliveries(), vec![(1, 1), (2, 1)]);
        assert_eq!(set.snapshot().await, vec![1, 99]);
    }

    #[tokio::test]
    async fn register_and_unregister_report_membership_changes() {
        let notifier = Notifier::new(Arc::new(RecordingSink::default()), RecipientSet::new());
        assert!(notifier.register(5).await);
        assert!(!notifier.register(5).await);
        assert!(notifier.recipients().contains(5).await);
        assert!(notifier.unregister(5).await);
        assert!(!notifier.unregister(5).await);
    }
}
