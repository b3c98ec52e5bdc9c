//! API configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Deployment environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "production" | "prod" => Ok(Self::Production),
            other => Err(format!(
                "unknown environment '{other}' (expected development or production)"
            )),
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Development => "development",
            Self::Production => "production",
        })
    }
}

/// Configuration for the HTTP layer.
#[derive(Clone, Debug)]
pub struct ApiConfig {
    /// Controls the cookie `Secure` flag and CORS.
    pub environment: Environment,
    /// Deadline after which a request is answered with 504.
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn new(environment: Environment) -> Self {
        Self {
            environment,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn is_production(&self) -> bool {
        self.environment == Environment::Production
    }

    /// Session cookies carry `Secure` only in production.
    pub fn cookie_secure(&self) -> bool {
        self.is_production()
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::new(Environment::Development)
    }
}
