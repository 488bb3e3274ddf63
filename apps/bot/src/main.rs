use anyhow::Context;
use async_trait::async_trait;
use std::sync::Arc;
use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, ParseMode, WebAppInfo},
    utils::command::BotCommands,
};
use tokio::time::{interval, Duration};

use masterbook_server::booking::MasterLocks;
use masterbook_server::config::Config;
use masterbook_server::error::AppError;
use masterbook_server::lifecycle::{self, Action};
use masterbook_server::notify::{self, Notification, NotificationQueue, Notifier};
use masterbook_server::{db, reminders, users};

/// Reminder sweep interval.
const REMINDER_SWEEP_SECS: u64 = 600;
const NOTIFICATION_QUEUE_CAPACITY: usize = 256;

#[derive(BotCommands, Clone)]
#[command(rename_rule = "lowercase")]
enum Command {
    #[command(description = "Открыть приложение")]
    Start(String),
    #[command(description = "Ссылка для клиентов (для мастера)")]
    MyLink,
    #[command(description = "Помощь")]
    Help,
}

#[derive(Clone)]
struct BotState {
    pool: sqlx::SqlitePool,
    webapp_url: String,
    bot_username: String,
    locks: MasterLocks,
    notifications: NotificationQueue,
}

/// Delivers notifications through the bot itself.
#[derive(Clone)]
struct BotNotifier {
    bot: Bot,
}

#[async_trait]
impl Notifier for BotNotifier {
    async fn deliver(&self, notification: &Notification) -> anyhow::Result<()> {
        let chat_id: i64 = notification
            .chat_id
            .parse()
            .with_context(|| format!("invalid chat id {:?}", notification.chat_id))?;

        let mut request = self
            .bot
            .send_message(ChatId(chat_id), notification.text())
            .parse_mode(ParseMode::Html);

        let buttons: Vec<InlineKeyboardButton> = notification
            .buttons()
            .into_iter()
            .map(|b| InlineKeyboardButton::callback(b.text, b.callback_data))
            .collect();
        if !buttons.is_empty() {
            request = request.reply_markup(InlineKeyboardMarkup::new(vec![buttons]));
        }

        request.await?;
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive("info".parse()?),
        )
        .init();

    let pool = db::connect(&config.database_url, config.database_max_connections).await?;
    db::run_migrations(&pool).await?;

    let bot = Bot::new(&config.bot_token);
    let me = bot.get_me().await?;
    let notifier = BotNotifier { bot: bot.clone() };

    tracing::info!(username = me.username(), "masterbook bot starting");

    let (notifications, outbox) = NotificationQueue::new(NOTIFICATION_QUEUE_CAPACITY);
    tokio::spawn(notify::run_dispatcher(outbox, Arc::new(notifier.clone())));

    // Spawn reminder task
    let reminder_pool = pool.clone();
    let clock_offset = config.clock_offset_hours;
    tokio::spawn(async move {
        send_reminders(reminder_pool, notifier, clock_offset).await;
    });

    let state = BotState {
        pool,
        webapp_url: config.webapp_url.trim_end_matches('/').to_string(),
        bot_username: me.username().to_string(),
        locks: MasterLocks::new(),
        notifications,
    };

    // Handle commands + callback queries (inline buttons)
    let cmd_handler = Update::filter_message()
        .filter_command::<Command>()
        .endpoint({
            let state = state.clone();
            move |bot: Bot, msg: Message, cmd: Command| {
                let state = state.clone();
                async move {
                    handle_command(bot, msg, cmd, &state).await?;
                    Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
                }
            }
        });

    let callback_handler = Update::filter_callback_query().endpoint({
        let state = state.clone();
        move |bot: Bot, q: CallbackQuery| {
            let state = state.clone();
            async move {
                handle_callback(bot, q, &state).await?;
                Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
            }
        }
    });

    let handler = dptree::entry()
        .branch(cmd_handler)
        .branch(callback_handler);

    Dispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;

    Ok(())
}

// ── Command handlers ──

async fn handle_command(
    bot: Bot,
    msg: Message,
    cmd: Command,
    state: &BotState,
) -> anyhow::Result<()> {
    match cmd {
        Command::Start(payload) => {
            let (url, label, text) = match booking_target(&payload) {
                Some(master_id) => (
                    format!("{}/booking/{}", state.webapp_url, master_id),
                    "📅 Выбрать время",
                    "Привет! 👋\n\nНажми кнопку ниже, чтобы выбрать услугу и удобное время у мастера.",
                ),
                None => (
                    state.webapp_url.clone(),
                    "✨ Открыть приложение",
                    "Привет! 👋\n\n\
                     Здесь можно записаться к мастеру или вести собственное расписание.\n\
                     Нажми кнопку ниже, чтобы начать.",
                ),
            };

            let keyboard = InlineKeyboardMarkup::new(vec![vec![InlineKeyboardButton::web_app(
                label,
                WebAppInfo {
                    url: url.parse().with_context(|| format!("invalid web app url {url:?}"))?,
                },
            )]]);

            bot.send_message(msg.chat.id, text)
                .reply_markup(keyboard)
                .await?;
        }

        Command::MyLink => {
            let tg_id = msg.from.as_ref().map(|u| u.id.0.to_string()).unwrap_or_default();
            let user = users::find_by_telegram_id(&state.pool, &tg_id).await?;

            let text = match user {
                Some(user) if user.is_master() => format!(
                    "🔗 <b>Ссылка для записи</b>\n\n\
                     Отправь её клиентам, чтобы они записывались к тебе:\n{}",
                    deep_link(&state.bot_username, user.id),
                ),
                _ => "Эта ссылка доступна только мастерам.\n\
                      Открой приложение через /start и стань мастером в профиле."
                    .to_string(),
            };

            bot.send_message(msg.chat.id, text)
                .parse_mode(ParseMode::Html)
                .await?;
        }

        Command::Help => {
            bot.send_message(
                msg.chat.id,
                "💡 <b>Команды</b>\n\n\
                 /start — открыть приложение\n\
                 /mylink — ссылка для клиентов (для мастера)\n\
                 /help — помощь\n\n\
                 Подтверждать и отклонять записи можно прямо из уведомлений.",
            )
            .parse_mode(ParseMode::Html)
            .await?;
        }
    }

    Ok(())
}

// ── Callback query handler (inline button clicks) ──

async fn handle_callback(bot: Bot, q: CallbackQuery, state: &BotState) -> anyhow::Result<()> {
    let Some((action, appointment_id)) = q.data.as_deref().and_then(parse_callback) else {
        bot.answer_callback_query(&q.id).text("Неизвестная команда").await?;
        return Ok(());
    };

    let tg_id = q.from.id.0.to_string();
    let Some(user) = users::find_by_telegram_id(&state.pool, &tg_id).await? else {
        bot.answer_callback_query(&q.id)
            .text("Сначала открой приложение через /start")
            .await?;
        return Ok(());
    };

    let reply = match lifecycle::apply(&state.pool, &state.locks, appointment_id, &user, action).await {
        Ok(transition) => {
            state.notifications.publish_all(transition.notifications);
            done_text(action).to_string()
        }
        Err(e @ (AppError::Database(_) | AppError::Internal(_))) => {
            tracing::error!(appointment_id, action = %action, error = %e, "callback transition failed");
            "Что-то пошло не так, попробуй позже".to_string()
        }
        Err(e) => e.to_string(),
    };

    bot.answer_callback_query(&q.id).text(reply.clone()).await?;

    if let Some(chat_id) = q.message.as_ref().map(|m| m.chat().id) {
        bot.send_message(chat_id, reply).await?;
    }

    Ok(())
}

/// `confirm_<id>` and friends, as rendered by the notification buttons.
fn parse_callback(data: &str) -> Option<(Action, i64)> {
    let (prefix, id) = data.split_once('_')?;
    let action = match prefix {
        "confirm" => Action::Confirm,
        "reject" => Action::Reject,
        "done" => Action::ConfirmComplete,
        "dispute" => Action::DisputeComplete,
        _ => return None,
    };
    Some((action, id.parse().ok()?))
}

fn done_text(action: Action) -> &'static str {
    match action {
        Action::Confirm => "✅ Запись подтверждена",
        Action::Reject => "❌ Запись отклонена",
        Action::ConfirmComplete => "✅ Спасибо! Визит завершён",
        Action::DisputeComplete => "⚠️ Мастер получит уведомление о споре",
        Action::Cancel => "❌ Запись отменена",
        Action::MarkComplete => "✅ Отмечено как выполненное",
    }
}

/// `/start book_<masterId>` payload.
fn booking_target(payload: &str) -> Option<i64> {
    payload.trim().strip_prefix("book_")?.parse().ok()
}

fn deep_link(bot_username: &str, master_id: i64) -> String {
    format!("https://t.me/{bot_username}?start=book_{master_id}")
}

// ── Reminders ──

async fn send_reminders(pool: sqlx::SqlitePool, notifier: BotNotifier, clock_offset_hours: i64) {
    // Initial delay: wait 10 seconds before first check
    tokio::time::sleep(Duration::from_secs(10)).await;

    let mut ticker = interval(Duration::from_secs(REMINDER_SWEEP_SECS));

    loop {
        ticker.tick().await;

        let now = reminders::wall_clock_now(clock_offset_hours);
        match reminders::sweep(&pool, now, &notifier).await {
            Ok(0) => {}
            Ok(sent) => tracing::info!(sent, "📬 reminders sent"),
            Err(e) => tracing::error!(error = %e, "reminder sweep failed"),
        }
    }
}
