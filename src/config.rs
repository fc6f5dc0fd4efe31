use anyhow::Context;

const DEFAULT_MAX_CONNECTIONS: u32 = 5;

#[derive(Debug, Clone)]
pub struct DashboardConfig {
    pub database_url: String,
    pub max_connections: u32,
}

impl DashboardConfig {
    /// Reads settings from the process environment, after loading `.env` if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set to the production metrics Postgres instance")?;
        let max_connections =
            parse_max_connections(std::env::var("DASHBOARD_MAX_CONNECTIONS").ok().as_deref())?;

        Ok(Self {
            database_url,
            max_connections,
        })
    }
}

fn parse_max_connections(raw: Option<&str>) -> anyhow::Result<u32> {
    match raw {
        None => Ok(DEFAULT_MAX_CONNECTIONS),
        Some(value) => {
            let parsed: u32 = value
                .trim()
                .parse()
                .with_context(|| format!("DASHBOARD_MAX_CONNECTIONS must be a number, got '{value}'"))?;
            anyhow::ensure!(parsed > 0, "DASHBOARD_MAX_CONNECTIONS must be at least 1");
            Ok(parsed)
        }
    }
}
