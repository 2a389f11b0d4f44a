use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast hub for LISTEN/NOTIFY. Channels are keyed by hall or exam id;
/// every committed event on that entity is fanned out to subscribers.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
        }
    }

    /// Subscribe to notifications for a hall or exam. Creates the channel if needed.
    pub fn subscribe(&self, channel_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(channel_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    /// Send a notification. No-op if nobody is listening.
    pub fn send(&self, channel_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&channel_id) {
            tracing::debug!(channel = %channel_id, payload = %json_payload(event), "notify");
            let _ = sender.send(event.clone());
        }
    }
}

/// Wire payload for a notification: the event as a one-line JSON object,
/// tagged with its variant name.
pub fn json_payload(event: &Event) -> String {
    serde_json::json!({
        "event": match event {
            Event::HallCreated { .. } => "hall_created",
            Event::BookingSubmitted { .. } => "booking_submitted",
            Event::BookingStatusChanged { .. } => "booking_status_changed",
            Event::ExamCreated { .. } => "exam_created",
            Event::ExamUpdated { .. } => "exam_updated",
            Event::SeatAllotted { .. } => "seat_allotted",
            Event::AllotmentUpdated { .. } => "allotment_updated",
        },
        "detail": detail(event),
    })
    .to_string()
}

fn detail(event: &Event) -> serde_json::Value {
    match event {
        Event::BookingSubmitted { id, span, .. } => serde_json::json!({
            "booking": id.to_string(),
            "start": span.start,
            "end": span.end,
        }),
        Event::BookingStatusChanged { id, status, .. } => serde_json::json!({
            "booking": id.to_string(),
            "status": status.as_str(),
        }),
        Event::SeatAllotted { id, seat, .. } | Event::AllotmentUpdated { id, seat, .. } => {
            serde_json::json!({
                "allotment": id.to_string(),
                "seat": seat,
            })
        }
        Event::HallCreated { id, .. }
        | Event::ExamCreated { id, .. }
        | Event::ExamUpdated { id, .. } => serde_json::json!({ "id": id.to_string() }),
    }
}
