//! Configuration module for tenancy-service.

use crate::db::is_valid_session_variable;
use crate::tenant::TenantId;
use axum::http::HeaderName;
use dotenvy::dotenv;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct TenancyConfig {
    pub common: core_config::Config,
    pub environment: Environment,
    pub service_name: String,
    pub service_version: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub tenant: TenantConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Dev,
    Prod,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct TenantConfig {
    pub header_name: String,
    pub query_param: String,
    /// Tenant used when a dev request carries no identity. Unset unless
    /// `TENANT_DEV_FALLBACK_ID` is given; ignored in prod.
    pub dev_fallback_tenant_id: Option<i64>,
    pub cache_ttl_seconds: u64,
    pub session_variable: String,
}

impl TenantConfig {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_seconds)
    }
}

impl Default for TenantConfig {
    fn default() -> Self {
        Self {
            header_name: "x-company-id".to_string(),
            query_param: "company_id".to_string(),
            dev_fallback_tenant_id: None,
            cache_ttl_seconds: 300,
            session_variable: crate::db::DEFAULT_SESSION_VARIABLE.to_string(),
        }
    }
}

impl TenancyConfig {
    pub fn from_env() -> Result<Self, AppError> {
        dotenv().ok();
        let common = core_config::Config::load()?;

        let environment: Environment = env::var("ENVIRONMENT")
            .unwrap_or_else(|_| "dev".to_string())
            .parse()
            .map_err(|e: String| AppError::ConfigError(anyhow::anyhow!(e)))?;
        let is_prod = environment == Environment::Prod;
        let defaults = TenantConfig::default();

        let config = Self {
            common,
            environment,
            service_name: get_env("SERVICE_NAME", Some("tenancy-service"), false)?,
            service_version: get_env("SERVICE_VERSION", Some(env!("CARGO_PKG_VERSION")), false)?,
            log_level: get_env("LOG_LEVEL", Some("info"), false)?,
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: get_env("DATABASE_URL", None, is_prod)?,
                max_connections: parse_env("DATABASE_MAX_CONNECTIONS", 10)?,
                min_connections: parse_env("DATABASE_MIN_CONNECTIONS", 2)?,
            },
            tenant: TenantConfig {
                header_name: get_env("TENANT_HEADER", Some(&defaults.header_name), false)?,
                query_param: get_env("TENANT_QUERY_PARAM", Some(&defaults.query_param), false)?,
                dev_fallback_tenant_id: match env::var("TENANT_DEV_FALLBACK_ID") {
                    Ok(v) if v.trim().is_empty() || v.eq_ignore_ascii_case("none") => None,
                    Ok(v) => Some(v.trim().parse().map_err(|e: std::num::ParseIntError| {
                        AppError::ConfigError(anyhow::anyhow!(
                            "TENANT_DEV_FALLBACK_ID must be an integer: {}",
                            e
                        ))
                    })?),
                    Err(_) => defaults.dev_fallback_tenant_id,
                },
                cache_ttl_seconds: parse_env("TENANT_CACHE_TTL_SECONDS", defaults.cache_ttl_seconds)?,
                session_variable: get_env(
                    "TENANT_SESSION_VARIABLE",
                    Some(&defaults.session_variable),
                    false,
                )?,
            },
        };

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), AppError> {
        if self.database.max_connections == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MAX_CONNECTIONS must be greater than 0"
            )));
        }

        if self.database.min_connections > self.database.max_connections {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "DATABASE_MIN_CONNECTIONS cannot exceed DATABASE_MAX_CONNECTIONS"
            )));
        }

        if self.tenant.cache_ttl_seconds == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TENANT_CACHE_TTL_SECONDS must be positive"
            )));
        }

        if HeaderName::from_bytes(self.tenant.header_name.as_bytes()).is_err() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TENANT_HEADER '{}' is not a valid header name",
                self.tenant.header_name
            )));
        }

        if self.tenant.query_param.is_empty() {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TENANT_QUERY_PARAM must not be empty"
            )));
        }

        if !is_valid_session_variable(&self.tenant.session_variable) {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "TENANT_SESSION_VARIABLE '{}' must be a dotted identifier",
                self.tenant.session_variable
            )));
        }

        if let Some(id) = self.tenant.dev_fallback_tenant_id {
            if TenantId::new(id).is_none() {
                return Err(AppError::ConfigError(anyhow::anyhow!(
                    "TENANT_DEV_FALLBACK_ID must be positive"
                )));
            }
            if self.environment == Environment::Prod {
                tracing::warn!("TENANT_DEV_FALLBACK_ID is set but ignored in production");
            }
        }

        Ok(())
    }

    /// Fallback tenant the resolver may use. Always `None` outside dev.
    pub fn development_fallback(&self) -> Option<TenantId> {
        match self.environment {
            Environment::Dev => self.tenant.dev_fallback_tenant_id.and_then(TenantId::new),
            Environment::Prod => None,
        }
    }
}

fn get_env(key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError> {
    match env::var(key) {
        Ok(val) => Ok(val),
        Err(_) => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

fn parse_env<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| {
            AppError::ConfigError(anyhow::anyhow!("{} is invalid: {}", key, e))
        }),
        Err(_) => Ok(default),
    }
}

impl std::str::FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dev" => Ok(Environment::Dev),
            "prod" => Ok(Environment::Prod),
            _ => Err(format!("Invalid environment: {}", s)),
        }
    }
}
