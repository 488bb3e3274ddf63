use anyhow::Context;
use std::str::FromStr;

/// Process configuration read from the environment (and `.env`, if present).
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub database_max_connections: u32,
    pub bot_token: String,
    pub host: String,
    pub port: u16,
    pub webapp_url: String,
    pub default_gap_minutes: i64,
    pub clock_offset_hours: i64,
    pub alert_chat_id: Option<String>,
    pub auth_max_age_secs: i64,
}

fn var_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{name} has an invalid value: {raw:?}")),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let bot_token = std::env::var("BOT_TOKEN").context("BOT_TOKEN must be set")?;
        if bot_token.trim().is_empty() {
            anyhow::bail!("BOT_TOKEN must not be empty");
        }

        let default_gap_minutes = parsed_or("DEFAULT_GAP_MINUTES", crate::booking::DEFAULT_GAP_MINUTES)?;
        if !(0..=crate::users::MAX_GAP_MINUTES).contains(&default_gap_minutes) {
            anyhow::bail!(
                "DEFAULT_GAP_MINUTES must be between 0 and {}",
                crate::users::MAX_GAP_MINUTES
            );
        }

        Ok(Self {
            database_url: var_or("DATABASE_URL", "sqlite:masterbook.db?mode=rwc"),
            database_max_connections: parsed_or("DATABASE_MAX_CONNECTIONS", 5)?,
            bot_token,
            host: var_or("HOST", "0.0.0.0"),
            port: parsed_or("PORT", 3000)?,
            webapp_url: var_or("WEBAPP_URL", "https://example.com"),
            default_gap_minutes,
            clock_offset_hours: parsed_or("CLOCK_OFFSET_HOURS", 3)?,
            alert_chat_id: std::env::var("ALERT_CHAT_ID").ok().filter(|v| !v.trim().is_empty()),
            auth_max_age_secs: parsed_or("AUTH_MAX_AGE_SECS", 86_400)?,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_or_default_and_error() {
        assert_eq!(parsed_or("MASTERBOOK_TEST_UNSET", 7_i64).unwrap(), 7);

        std::env::set_var("MASTERBOOK_TEST_BAD_PORT", "eighty");
        let err = parsed_or::<u16>("MASTERBOOK_TEST_BAD_PORT", 3000).unwrap_err();
        assert!(err.to_string().contains("MASTERBOOK_TEST_BAD_PORT"));

        std::env::set_var("MASTERBOOK_TEST_GOOD_PORT", " 8080 ");
        assert_eq!(parsed_or::<u16>("MASTERBOOK_TEST_GOOD_PORT", 3000).unwrap(), 8080);
    }
}
