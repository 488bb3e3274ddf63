//! Outbound notifications.
//!
//! Booking and lifecycle code only decides *what* to tell whom and hands the
//! result to a [`NotificationQueue`]. Delivery happens on a separate task, so a
//! failed send never affects the transition that caused it.

use async_trait::async_trait;
use chrono::{DateTime, Datelike, Utc};
use sqlx::SqlitePool;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::lifecycle::{Action, Party};
use crate::schedule::TimeOfDay;

/// Everything a message about one appointment needs, joined in one query.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct BookingDetails {
    pub appointment_id: i64,
    pub start_time: DateTime<Utc>,
    pub service_title: Option<String>,
    pub master_chat_id: String,
    pub master_name: String,
    pub client_chat_id: String,
    pub client_name: String,
    pub client_username: Option<String>,
    pub client_comment: Option<String>,
}

pub(crate) const DETAILS_SELECT: &str =
    "SELECT a.id AS appointment_id, a.start_time, s.title AS service_title,
            m.telegram_id AS master_chat_id,
            COALESCE(NULLIF(p.display_name, ''), m.first_name) AS master_name,
            c.telegram_id AS client_chat_id, c.first_name AS client_name,
            c.username AS client_username, a.client_comment
     FROM appointments a
     JOIN users m ON m.id = a.master_id
     JOIN users c ON c.id = a.client_id
     LEFT JOIN master_profiles p ON p.user_id = a.master_id
     LEFT JOIN services s ON s.id = a.service_id";

pub async fn load_context(
    db: &SqlitePool,
    appointment_id: i64,
) -> Result<Option<BookingDetails>, sqlx::Error> {
    sqlx::query_as::<_, BookingDetails>(&format!("{DETAILS_SELECT} WHERE a.id = ?"))
        .bind(appointment_id)
        .fetch_optional(db)
        .await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// To the master, with confirm/reject buttons.
    NewBooking,
    BookingPending,
    BookingConfirmed,
    BookingRejected,
    BookingCancelled { by_master: bool },
    /// To the client, with confirm/dispute buttons.
    CompletionRequested,
    CompletionConfirmed,
    CompletionDisputed,
    Reminder { hours_before: i64 },
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub chat_id: String,
    pub kind: Kind,
    pub booking: BookingDetails,
}

/// Inline keyboard button carrying callback data for the bot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Button {
    pub text: &'static str,
    pub callback_data: String,
}

impl Notification {
    fn to_master(booking: &BookingDetails, kind: Kind) -> Self {
        Self {
            chat_id: booking.master_chat_id.clone(),
            kind,
            booking: booking.clone(),
        }
    }

    fn to_client(booking: &BookingDetails, kind: Kind) -> Self {
        Self {
            chat_id: booking.client_chat_id.clone(),
            kind,
            booking: booking.clone(),
        }
    }

    /// HTML message body.
    pub fn text(&self) -> String {
        let b = &self.booking;
        let service = escape_html(b.service_title.as_deref().unwrap_or("Услуга"));
        let when = format!(
            "📅 {}\n⏰ Время: {}",
            format_date_ru(b.start_time),
            TimeOfDay::from_datetime(b.start_time)
        );
        let master = escape_html(&b.master_name);
        let client = match &b.client_username {
            Some(username) => format!("{} (@{})", escape_html(&b.client_name), escape_html(username)),
            None => escape_html(&b.client_name),
        };

        match self.kind {
            Kind::NewBooking => {
                let mut text = format!(
                    "🔔 <b>Новая заявка на запись!</b>\n\n👤 Клиент: <b>{client}</b>\n💇‍♀️ Услуга: {service}\n{when}"
                );
                if let Some(comment) = b.client_comment.as_deref().filter(|c| !c.is_empty()) {
                    text.push_str(&format!("\n💬 {}", escape_html(comment)));
                }
                text.push_str("\n\nПодтвердите или отклоните запись:");
                text
            }
            Kind::BookingPending => format!(
                "⏳ <b>Заявка отправлена!</b>\n\n👩‍💼 Мастер: <b>{master}</b>\n💇‍♀️ Услуга: {service}\n{when}\n\nОжидайте подтверждения от мастера."
            ),
            Kind::BookingConfirmed => format!(
                "✅ <b>Запись подтверждена!</b>\n\n👩‍💼 Мастер: <b>{master}</b>\n💇‍♀️ Услуга: {service}\n{when}\n\nЖдём вас! Вы можете отменить запись в приложении."
            ),
            Kind::BookingRejected => format!(
                "😔 <b>Запись отклонена</b>\n\nМастер <b>{master}</b> не смог подтвердить вашу запись.\n\n💇‍♀️ Услуга: {service}\n{when}\n\nПопробуйте выбрать другое время."
            ),
            Kind::BookingCancelled { by_master: true } => format!(
                "❌ <b>Запись отменена</b>\n\nМастер <b>{master}</b> отменил вашу запись.\n\n💇‍♀️ Услуга: {service}\n{when}\n\nВы можете записаться на другое время."
            ),
            Kind::BookingCancelled { by_master: false } => format!(
                "❌ <b>Запись отменена клиентом</b>\n\nКлиент <b>{client}</b> отменил запись.\n\n💇‍♀️ Услуга: {service}\n{when}"
            ),
            Kind::CompletionRequested => format!(
                "🏁 <b>Услуга оказана?</b>\n\nМастер <b>{master}</b> отметил визит как завершённый.\n\n💇‍♀️ Услуга: {service}\n{when}\n\nПодтвердите, пожалуйста:"
            ),
            Kind::CompletionConfirmed => format!(
                "🎉 <b>Визит подтверждён</b>\n\nКлиент <b>{client}</b> подтвердил, что услуга оказана.\n\n💇‍♀️ Услуга: {service}\n{when}"
            ),
            Kind::CompletionDisputed => format!(
                "⚠️ <b>Клиент не подтвердил визит</b>\n\nКлиент <b>{client}</b> оспорил завершение записи. Запись снова подтверждена.\n\n💇‍♀️ Услуга: {service}\n{when}"
            ),
            Kind::Reminder { hours_before } => {
                let lead = if hours_before >= 24 {
                    "Завтра у вас запись".to_string()
                } else {
                    format!("Через {hours_before} ч. у вас запись")
                };
                format!(
                    "💕 <b>Напоминание!</b>\n\n{lead}:\n\n👩‍💼 Мастер: <b>{master}</b>\n💇‍♀️ Услуга: {service}\n{when}\n\nЖдём вас! ✨"
                )
            }
        }
    }

    pub fn buttons(&self) -> Vec<Button> {
        let id = self.booking.appointment_id;
        match self.kind {
            Kind::NewBooking => vec![
                Button {
                    text: "✅ Подтвердить",
                    callback_data: format!("confirm_{id}"),
                },
                Button {
                    text: "❌ Отклонить",
                    callback_data: format!("reject_{id}"),
                },
            ],
            Kind::CompletionRequested => vec![
                Button {
                    text: "✅ Да, всё хорошо",
                    callback_data: format!("done_{id}"),
                },
                Button {
                    text: "⚠️ Нет, не было",
                    callback_data: format!("dispute_{id}"),
                },
            ],
            _ => Vec::new(),
        }
    }
}

/// A freshly created booking: the master gets a request, the client a receipt.
pub fn for_new_booking(booking: &BookingDetails) -> Vec<Notification> {
    vec![
        Notification::to_master(booking, Kind::NewBooking),
        Notification::to_client(booking, Kind::BookingPending),
    ]
}

/// One message to the counterparty of whoever acted.
pub fn for_transition(action: Action, actor: Party, booking: &BookingDetails) -> Vec<Notification> {
    let notification = match (action, actor) {
        (Action::Confirm, _) => Notification::to_client(booking, Kind::BookingConfirmed),
        (Action::Reject, _) => Notification::to_client(booking, Kind::BookingRejected),
        (Action::Cancel, Party::Master) => {
            Notification::to_client(booking, Kind::BookingCancelled { by_master: true })
        }
        (Action::Cancel, Party::Client) => {
            Notification::to_master(booking, Kind::BookingCancelled { by_master: false })
        }
        (Action::MarkComplete, _) => Notification::to_client(booking, Kind::CompletionRequested),
        (Action::ConfirmComplete, _) => Notification::to_master(booking, Kind::CompletionConfirmed),
        (Action::DisputeComplete, _) => Notification::to_master(booking, Kind::CompletionDisputed),
    };
    vec![notification]
}

pub fn reminder(booking: &BookingDetails, hours_before: i64) -> Notification {
    Notification::to_client(booking, Kind::Reminder { hours_before })
}

// ── Delivery ──

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()>;
}

/// Bounded outbound queue. Cloning shares the same channel.
#[derive(Debug, Clone)]
pub struct NotificationQueue {
    tx: mpsc::Sender<Notification>,
}

impl NotificationQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. A full or closed queue drops the message.
    pub fn publish(&self, notification: Notification) {
        match self.tx.try_send(notification) {
            Ok(()) => {}
            Err(TrySendError::Full(n)) => {
                tracing::warn!(
                    appointment_id = n.booking.appointment_id,
                    kind = ?n.kind,
                    "notification queue full, dropping message"
                );
            }
            Err(TrySendError::Closed(n)) => {
                tracing::warn!(
                    appointment_id = n.booking.appointment_id,
                    kind = ?n.kind,
                    "notification queue closed, dropping message"
                );
            }
        }
    }

    pub fn publish_all(&self, notifications: impl IntoIterator<Item = Notification>) {
        for n in notifications {
            self.publish(n);
        }
    }
}

/// Drain the queue until every sender is gone.
pub async fn run_dispatcher(mut rx: mpsc::Receiver<Notification>, notifier: Arc<dyn Notifier>) {
    while let Some(notification) = rx.recv().await {
        if let Err(e) = notifier.deliver(&notification).await {
            tracing::warn!(
                appointment_id = notification.booking.appointment_id,
                chat_id = %notification.chat_id,
                kind = ?notification.kind,
                error = %e,
                "notification delivery failed"
            );
        }
    }
    tracing::info!("notification dispatcher stopped");
}

// ── Formatting helpers ──

pub fn escape_html(raw: &str) -> String {
    raw.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

/// "10 июня"
pub fn format_date_ru(at: DateTime<Utc>) -> String {
    const MONTHS: [&str; 12] = [
        "января", "февраля", "марта", "апреля", "мая", "июня",
        "июля", "августа", "сентября", "октября", "ноября", "декабря",
    ];
    let date = at.date_naive();
    format!("{} {}", date.day(), MONTHS[date.month0() as usize])
}
