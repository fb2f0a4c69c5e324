//! Canonical event kinds and their typed payloads.
//!
//! Inbound wire frames are normalized here so consumers never see wire
//! naming. Several historical wire names map onto each canonical kind.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::transport::Frame;
use crate::types::Error;

/// Tag of an [`Event`]; listeners are registered per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    ConnectionOpened,
    ConnectionClosed,
    ConnectionError,
    JobStatusUpdate,
    QueueStatsUpdate,
    JobNotification,
    SystemMessage,
    /// User-facing "reconnecting" indicator, emitted only past the notice
    /// threshold.
    Reconnecting,
    /// Terminal: reconnect attempts exhausted or credential rejected.
    ConnectionLost,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ConnectionOpened,
        EventKind::ConnectionClosed,
        EventKind::ConnectionError,
        EventKind::JobStatusUpdate,
        EventKind::QueueStatsUpdate,
        EventKind::JobNotification,
        EventKind::SystemMessage,
        EventKind::Reconnecting,
        EventKind::ConnectionLost,
    ];

    pub fn name(self) -> &'static str {
        match self {
            EventKind::ConnectionOpened => "connection-opened",
            EventKind::ConnectionClosed => "connection-closed",
            EventKind::ConnectionError => "connection-error",
            EventKind::JobStatusUpdate => "job-status-update",
            EventKind::QueueStatsUpdate => "queue-stats-update",
            EventKind::JobNotification => "job-notification",
            EventKind::SystemMessage => "system-message",
            EventKind::Reconnecting => "reconnecting",
            EventKind::ConnectionLost => "connection-lost",
        }
    }

    /// Look up a kind by its canonical name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }

    /// Map an inbound wire event name to the payload-carrying kind it feeds.
    /// Connection lifecycle kinds never arrive as wire messages.
    fn from_wire(name: &str) -> Option<Self> {
        match name {
            "job-status-update" | "jobStatusUpdate" | "segmentation-update"
            | "segmentationUpdate" => Some(EventKind::JobStatusUpdate),
            "queue-stats-update" | "queueStatsUpdate" | "queue-stats" | "queueStats" => {
                Some(EventKind::QueueStatsUpdate)
            }
            "job-notification" | "jobNotification" | "segmentation-completed"
            | "segmentationCompleted" => Some(EventKind::JobNotification),
            "system-message" | "systemMessage" => Some(EventKind::SystemMessage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Processing,
    #[serde(alias = "segmented")]
    Completed,
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusUpdate {
    #[serde(alias = "imageId")]
    pub job_id: String,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    #[serde(alias = "projectId")]
    pub scope_id: String,
    pub queued: u64,
    pub processing: u64,
    pub total: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobNotification {
    #[serde(alias = "imageId")]
    pub job_id: String,
    #[serde(alias = "projectId")]
    pub scope_id: String,
    #[serde(alias = "polygonCount")]
    pub result_count: u64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemMessage {
    pub severity: Severity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// A canonical event delivered to listeners.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "kebab-case")]
pub enum Event {
    ConnectionOpened,
    ConnectionClosed { reason: Option<String> },
    ConnectionError { message: String },
    JobStatusUpdate(JobStatusUpdate),
    QueueStatsUpdate(QueueStats),
    JobNotification(JobNotification),
    SystemMessage(SystemMessage),
    Reconnecting { attempt: u32 },
    ConnectionLost { attempts: u32 },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ConnectionOpened => EventKind::ConnectionOpened,
            Event::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            Event::ConnectionError { .. } => EventKind::ConnectionError,
            Event::JobStatusUpdate(_) => EventKind::JobStatusUpdate,
            Event::QueueStatsUpdate(_) => EventKind::QueueStatsUpdate,
            Event::JobNotification(_) => EventKind::JobNotification,
            Event::SystemMessage(_) => EventKind::SystemMessage,
            Event::Reconnecting { .. } => EventKind::Reconnecting,
            Event::ConnectionLost { .. } => EventKind::ConnectionLost,
        }
    }
}

/// Turn an inbound wire frame into a canonical event.
///
/// `Ok(None)` means the wire name is not one we deliver. A known name with a
/// payload that does not match its shape is an error.
pub fn normalize(frame: &Frame) -> Result<Option<Event>, Error> {
    let Some(kind) = EventKind::from_wire(&frame.event) else {
        return Ok(None);
    };
    let data = frame.data.clone();
    let event = match kind {
        EventKind::JobStatusUpdate => Event::JobStatusUpdate(serde_json::from_value(data)?),
        EventKind::QueueStatsUpdate => Event::QueueStatsUpdate(serde_json::from_value(data)?),
        EventKind::JobNotification => Event::JobNotification(serde_json::from_value(data)?),
        EventKind::SystemMessage => Event::SystemMessage(serde_json::from_value(data)?),
        _ => return Ok(None),
    };
    Ok(Some(event))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(EventKind::from_name("segmentationUpdate"), None);
    }

    #[test]
    fn job_status_from_legacy_wire_name() {
        let frame = Frame::new(
            "segmentationUpdate",
            json!({"imageId": "img-1", "status": "segmented", "progress": 100.0}),
        );
        let event = normalize(&frame).unwrap().unwrap();
        assert_eq!(
            event,
            Event::JobStatusUpdate(JobStatusUpdate {
                job_id: "img-1".into(),
                status: JobStatus::Completed,
                progress: Some(100.0),
                error: None,
            })
        );
    }

    #[test]
    fn unknown_status_is_tolerated() {
        let frame = Frame::new(
            "job-status-update",
            json!({"jobId": "j", "status": "no_segmentation"}),
        );
        match normalize(&frame).unwrap() {
            Some(Event::JobStatusUpdate(u)) => assert_eq!(u.status, JobStatus::Unknown),
            other => panic!("expected job status, got {other:?}"),
        }
    }

    #[test]
    fn missing_job_id_is_malformed() {
        let frame = Frame::new("job-status-update", json!({"status": "queued"}));
        assert!(normalize(&frame).is_err());
    }

    #[test]
    fn queue_stats_accepts_project_alias() {
        let frame = Frame::new(
            "queueStats",
            json!({"projectId": "p-9", "queued": 3, "processing": 1, "total": 4}),
        );
        match normalize(&frame).unwrap() {
            Some(Event::QueueStatsUpdate(s)) => {
                assert_eq!(s.scope_id, "p-9");
                assert_eq!(s.total, 4);
            }
            other => panic!("expected queue stats, got {other:?}"),
        }
    }

    #[test]
    fn notification_parses_timestamp() {
        let frame = Frame::new(
            "segmentationCompleted",
            json!({
                "imageId": "img-2",
                "projectId": "p-1",
                "polygonCount": 12,
                "timestamp": "2024-05-01T10:00:00Z"
            }),
        );
        match normalize(&frame).unwrap() {
            Some(Event::JobNotification(n)) => {
                assert_eq!(n.result_count, 12);
                assert_eq!(n.timestamp.to_rfc3339(), "2024-05-01T10:00:00+00:00");
            }
            other => panic!("expected notification, got {other:?}"),
        }
    }

    #[test]
    fn unknown_wire_name_is_ignored() {
        let frame = Frame::new("pong", json!({}));
        assert!(normalize(&frame).unwrap().is_none());
    }

    #[test]
    fn lifecycle_names_are_not_accepted_from_the_wire() {
        let frame = Frame::new("connection-lost", json!({"attempts": 1}));
        assert!(normalize(&frame).unwrap().is_none());
    }

    #[test]
    fn event_serializes_with_canonical_tag() {
        let event = Event::Reconnecting { attempt: 3 };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value, json!({"event": "reconnecting", "data": {"attempt": 3}}));
        assert_eq!(
            serde_json::to_value(Event::ConnectionOpened).unwrap(),
            json!({"event": "connection-opened"})
        );
    }
}
