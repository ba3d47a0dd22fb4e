use dashmap::DashMap;
use tokio::sync::broadcast;

use crate::model::StatusChange;

const CHANNEL_CAPACITY: usize = 256;

/// Low-latency status-change channel, one broadcast per patient.
///
/// Separate from the persistent notification inbox: only confirm and cancel
/// publish here, and the latest change per `{patientId}/{bookingId}` is kept.
pub struct StatusHub {
    channels: DashMap<String, broadcast::Sender<StatusChange>>,
    latest: DashMap<String, StatusChange>,
}

impl Default for StatusHub {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            latest: DashMap::new(),
        }
    }

    /// Subscribe to status changes for a patient. Creates the channel if needed.
    pub fn subscribe(&self, patient_id: &str) -> broadcast::Receiver<StatusChange> {
        let sender = self
            .channels
            .entry(patient_id.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Record and broadcast. Broadcast is a no-op if nobody is listening.
    pub fn publish(&self, change: StatusChange) {
        self.latest.insert(change.key(), change.clone());
        if let Some(sender) = self.channels.get(&change.patient_id) {
            let _ = sender.send(change);
        }
    }

    /// Last change published under `{patientId}/{bookingId}`.
    pub fn latest(&self, key: &str) -> Option<StatusChange> {
        self.latest.get(key).map(|c| c.clone())
    }

    /// Drop a patient's channel once nobody listens any more.
    pub fn prune(&self, patient_id: &str) {
        self.channels
            .remove_if(patient_id, |_, sender| sender.receiver_count() == 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::BookingStatus;
    use chrono::{NaiveDate, Utc};

    fn change(patient: &str, booking: &str, status: BookingStatus) -> StatusChange {
        StatusChange {
            patient_id: patient.into(),
            booking_id: booking.into(),
            status,
            timestamp: Utc::now(),
            professional_name: "Dr. Lima".into(),
            date: NaiveDate::from_ymd_opt(2025, 1, 6).unwrap(),
            start_time: "09:00".parse().unwrap(),
        }
    }

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = StatusHub::new();
        let mut rx = hub.subscribe("p1");

        let c = change("p1", "b1", BookingStatus::Confirmed);
        hub.publish(c.clone());

        assert_eq!(rx.recv().await.unwrap(), c);
        assert_eq!(hub.latest("p1/b1"), Some(c));
    }

    #[tokio::test]
    async fn other_patients_do_not_receive() {
        let hub = StatusHub::new();
        let mut rx = hub.subscribe("p2");
        hub.publish(change("p1", "b1", BookingStatus::Cancelled));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_still_records_latest() {
        let hub = StatusHub::new();
        hub.publish(change("p1", "b1", BookingStatus::Confirmed));
        hub.publish(change("p1", "b1", BookingStatus::Cancelled));
        assert_eq!(
            hub.latest("p1/b1").map(|c| c.status),
            Some(BookingStatus::Cancelled)
        );
        assert!(hub.latest("p1/b2").is_none());
    }

    #[test]
    fn prune_keeps_channels_with_listeners() {
        let hub = StatusHub::new();
        let rx = hub.subscribe("p1");
        hub.prune("p1");
        assert_eq!(hub.channels.len(), 1);
        drop(rx);
        hub.prune("p1");
        assert!(hub.channels.is_empty());
    }
}
