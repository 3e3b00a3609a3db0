use agenda_protocol::model::{Task, UserRecord};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    TaskCreated,
    TaskEdited,
    TaskDeleted,
    ThankYou,
}

impl NotificationKind {
    /// Administrative notices go to the owner; thank-you notes go to the requester.
    pub fn to_owner(self) -> bool {
        !matches!(self, NotificationKind::ThankYou)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationKind,
    pub requester: UserRecord,
    pub task: Option<Task>,
}

impl Notification {
    pub fn new(kind: NotificationKind, requester: UserRecord, task: Option<Task>) -> Self {
        Self {
            kind,
            requester,
            task,
        }
    }

    pub fn subject(&self) -> String {
        match self.kind {
            NotificationKind::TaskCreated => format!("New meeting request from {}", self.requester.name),
            NotificationKind::TaskEdited => format!("{} changed a meeting request", self.requester.name),
            NotificationKind::TaskDeleted => format!("{} cancelled a meeting request", self.requester.name),
            NotificationKind::ThankYou => "Thanks for reaching out".to_string(),
        }
    }

    pub fn body(&self) -> String {
        let when = self
            .task
            .as_ref()
            .map(|t| format!("{} via {}", t.formatted_date_time(), t.method.label()))
            .unwrap_or_default();
        match self.kind {
            NotificationKind::ThankYou => format!(
                "Hi {},\n\nThanks for booking time. Your request for {when} has been received.",
                self.requester.name
            ),
            _ => {
                let detail = self.task.as_ref().map(|t| t.detail.as_str()).unwrap_or("");
                format!(
                    "Requester: {}\nCompany: {}\nEmail: {}\nPhone: {}\nRoles: {}\nWhen: {when}\nDetail: {detail}",
                    self.requester.name,
                    self.requester.company,
                    self.requester.email,
                    self.requester.phone,
                    self.requester.roles.join(", "),
                )
            }
        }
    }
}

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("no recipient address for {0:?}")]
    NoRecipient(NotificationKind),

    #[error("mail relay request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("mail relay rejected message: {0}")]
    Rejected(reqwest::StatusCode),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError>;
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    to: &'a str,
    subject: String,
    body: String,
}

/// Posts messages as JSON to an HTTP mail relay.
pub struct HttpMailer {
    client: reqwest::Client,
    endpoint: String,
    owner_address: String,
}

impl HttpMailer {
    pub fn new(endpoint: impl Into<String>, owner_address: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            owner_address: owner_address.into(),
        }
    }

    fn recipient<'a>(&'a self, notification: &'a Notification) -> Result<&'a str, NotifyError> {
        let address = if notification.kind.to_owner() {
            self.owner_address.as_str()
        } else {
            notification.requester.email.as_str()
        };
        if address.is_empty() {
            return Err(NotifyError::NoRecipient(notification.kind));
        }
        Ok(address)
    }
}

#[async_trait]
impl Notifier for HttpMailer {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        let message = RelayMessage {
            to: self.recipient(notification)?,
            subject: notification.subject(),
            body: notification.body(),
        };
        let resp = self.client.post(&self.endpoint).json(&message).send().await?;
        if !resp.status().is_success() {
            return Err(NotifyError::Rejected(resp.status()));
        }
        Ok(())
    }
}

/// Writes notifications to the log instead of delivering them.
#[derive(Default)]
pub struct LogMailer;

#[async_trait]
impl Notifier for LogMailer {
    async fn send(&self, notification: &Notification) -> Result<(), NotifyError> {
        tracing::info!(
            kind = ?notification.kind,
            requester = %notification.requester.name,
            subject = %notification.subject(),
            "notification (log only)"
        );
        Ok(())
    }
}

/// Bounded fire-and-forget delivery queue drained by one worker task.
#[derive(Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    pub fn start(
        notifier: Arc<dyn Notifier>,
        capacity: usize,
        tracker: &TaskTracker,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<Notification>(capacity.max(1));
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = rx.recv() => {
                        let Some(notification) = next else {
                            break;
                        };
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            result = notifier.send(&notification) => {
                                if let Err(e) = result {
                                    tracing::warn!(kind = ?notification.kind, error = %e, "notification failed");
                                }
                            }
                        }
                    }
                }
            }
            tracing::debug!("notification worker stopped");
        });
        Self { tx }
    }

    /// Never blocks. Returns false when the job was dropped.
    pub fn enqueue(&self, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(n)) => {
                tracing::warn!(kind = ?n.kind, "notification queue full, dropping");
                false
            }
            Err(TrySendError::Closed(n)) => {
                tracing::warn!(kind = ?n.kind, "notification worker gone, dropping");
                false
            }
        }
    }
}
