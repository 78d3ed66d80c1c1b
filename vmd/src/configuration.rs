use std::path::Path;

use secrecy::{ExposeSecret, Secret};
use sqlx::postgres::{PgConnectOptions, PgSslMode};

#[derive(serde::Deserialize, Debug)]
pub struct ApplicationSettings {
    pub port: u16,
    pub host: String,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct NetworkSettings {
    pub bridge_name: String,
    pub subnet: String,
    pub host_ip: String,
    pub tap_prefix: String,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct VmmSettings {
    pub binary_path: String,
    pub vm_dir: String,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct TimeoutSettings {
    pub graceful_stop_ms: u64,
    pub sigterm_stop_ms: u64,
    pub api_ready_timeout_ms: u64,
}

#[derive(serde::Deserialize, Debug, Clone)]
pub struct WatchdogSettings {
    pub vm_watchdog_ms: u64,
    pub bootstrap_watchdog_ms: u64,
}

#[derive(serde::Deserialize, Debug)]
pub struct Settings {
    pub database: DatabaseSettings,
    pub application: ApplicationSettings,
    pub network: NetworkSettings,
    pub vmm: VmmSettings,
    pub timeouts: TimeoutSettings,
    pub watchdogs: WatchdogSettings,
}

#[derive(serde::Deserialize, Debug)]
pub struct DatabaseSettings {
    pub username: String,
    pub password: Secret<String>,
    pub port: u16,
    pub host: String,

    #[serde(rename = "database_name")]
    pub name: String,

    pub max_connections: u32,
}

impl DatabaseSettings {
    pub fn without_db(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.host)
            .username(&self.username)
            .password(self.password.expose_secret())
            .port(self.port)
            .ssl_mode(PgSslMode::Prefer)
    }

    pub fn connect_options(&self) -> PgConnectOptions {
        self.without_db().database(&self.name)
    }

    pub fn connection_string(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port,
            self.name
        )
    }

    pub fn connection_string_without_db(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}",
            self.username,
            self.password.expose_secret(),
            self.host,
            self.port
        )
    }
}

pub fn get_configuration() -> Result<Settings, config::ConfigError> {
    let base_path = Path::new(concat!(env!("CARGO_MANIFEST_DIR"), "/.."));
    let configuration_directory = base_path.join("configuration");
    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .expect("Failed to parse APP_ENVIRONMENT.");
    let environment_filename = format!("{}.yaml", environment.as_str());
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(config::File::from(
            configuration_directory.join(environment_filename),
        ))
        .set_override_option("database.host", std::env::var("DATABASE_HOST").ok())?
        .set_override_option("database.port", std::env::var("DATABASE_PORT").ok())?
        .set_override_option("database.username", std::env::var("DATABASE_USERNAME").ok())?
        .set_override_option("database.password", std::env::var("DATABASE_PASSWORD").ok())?
        .set_override_option(
            "database.database_name",
            std::env::var("DATABASE_NAME").ok(),
        )?
        .set_override_option(
            "vmm.binary_path",
            std::env::var("VMM_BINARY_PATH").ok().filter(|s| !s.is_empty()),
        )?
        .set_override_option(
            "network.bridge_name",
            std::env::var("VM_BRIDGE_NAME").ok().filter(|s| !s.is_empty()),
        )?
        .build()?;
    settings.try_deserialize::<Settings>()
}

pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}
