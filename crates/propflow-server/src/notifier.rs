//! Notification consumer that writes delivered events to the log

use async_trait::async_trait;
use propflow_core::workflow::NotificationConsumer;
use propflow_core::Result;
use propflow_types::{DomainEvent, EventAction};

/// Stand-in for mail/chat delivery: one info line per event
#[derive(Debug, Default)]
pub struct LogNotifier;

impl LogNotifier {
    pub fn render(event: &DomainEvent) -> String {
        let what = match event.action {
            EventAction::Created => "created".to_string(),
            EventAction::Cancelled => "cancelled".to_string(),
            EventAction::StatusChanged | EventAction::StepActed if event.changed_status() => match event.old_status {
                Some(old) => format!("{} -> {}", old.label(), event.new_status.label()),
                None => event.new_status.label().to_string(),
            },
            EventAction::StatusChanged | EventAction::StepActed => {
                format!("step signed, still {}", event.new_status.label())
            }
        };

        format!("[{}] {} {} by {}: {}", event.timestamp.to_rfc3339(), event.kind, event.request_id, event.actor, what)
    }
}

#[async_trait]
impl NotificationConsumer for LogNotifier {
    async fn notify(&self, event: &DomainEvent) -> Result<()> {
        log::info!("{}", Self::render(event));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use propflow_types::{ActorId, EventId, RequestId, RequestKind, Status};

    fn event(action: EventAction, old_status: Option<Status>, new_status: Status) -> DomainEvent {
        DomainEvent {
            event_id: EventId::new(),
            request_id: RequestId::new(),
            kind: RequestKind::OffCampusLoan,
            action,
            old_status,
            new_status,
            actor: ActorId::new("registrar"),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn test_render_status_change_uses_labels() {
        let line = LogNotifier::render(&event(
            EventAction::StatusChanged,
            Some(Status::PendingReturn),
            Status::ReturnedLate,
        ));
        assert!(line.contains("Pending Return -> Returned (Late)"), "{}", line);
        assert!(line.contains("by registrar"));
    }

    #[test]
    fn test_render_step_without_status_change() {
        let line = LogNotifier::render(&event(
            EventAction::StepActed,
            Some(Status::PendingReview),
            Status::PendingReview,
        ));
        assert!(line.contains("step signed"), "{}", line);
    }

    #[tokio::test]
    async fn test_notify_never_fails() {
        let notifier = LogNotifier;
        assert!(notifier
            .notify(&event(EventAction::Created, None, Status::PendingReview))
            .await
            .is_ok());
    }
}
