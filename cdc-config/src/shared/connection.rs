use serde::{Deserialize, Serialize};
use tokio_postgres::Config;
use tokio_postgres::config::SslMode;

use crate::SerializableSecretString;
use crate::shared::ValidationError;

/// Application name reported to the server, visible in `pg_stat_replication`.
pub const APPLICATION_NAME: &str = "tap_postgres";

/// Session settings sent with every connection.
///
/// wal2json renders dates and timestamps with the session's date style, the payload decoder
/// expects ISO.
pub const SESSION_OPTIONS: &str =
    "-c datestyle=ISO -c intervalstyle=postgres -c extra_float_digits=3 -c client_encoding=UTF8";

/// Where and how to reach the source database.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct PgConnectionConfig {
    pub host: String,
    pub port: u16,
    /// Database holding the replicated tables. Logical slots are bound to one database.
    pub name: String,
    pub username: String,
    /// Redacted in debug output.
    pub password: Option<SerializableSecretString>,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl PgConnectionConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, value) in [
            ("pg_connection.host", &self.host),
            ("pg_connection.name", &self.name),
            ("pg_connection.username", &self.username),
        ] {
            if value.is_empty() {
                return Err(ValidationError::InvalidFieldValue {
                    field: field.to_string(),
                    constraint: "must not be empty".to_string(),
                });
            }
        }

        self.tls.validate()
    }

    /// Builds tokio-postgres options for the configured database.
    ///
    /// Only the TLS mode is set here, certificates are loaded by the rustls connector.
    pub fn connect_options(&self) -> Config {
        let mut options = Config::new();
        options
            .host(&self.host)
            .port(self.port)
            .dbname(&self.name)
            .user(&self.username)
            .application_name(APPLICATION_NAME)
            .options(SESSION_OPTIONS)
            .ssl_mode(self.tls.ssl_mode());

        if let Some(password) = &self.password {
            options.password(password.expose_secret());
        }

        options
    }
}

/// Certificates trusted when connecting over TLS.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TlsConfig {
    /// PEM bundle, required when `enabled` is set.
    pub trusted_root_certs: String,
    pub enabled: bool,
}

impl TlsConfig {
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.enabled && self.trusted_root_certs.is_empty() {
            true => Err(ValidationError::MissingTrustedRootCerts),
            false => Ok(()),
        }
    }

    fn ssl_mode(&self) -> SslMode {
        match self.enabled {
            true => SslMode::Require,
            false => SslMode::Prefer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local(tls: TlsConfig) -> PgConnectionConfig {
        PgConnectionConfig {
            host: "localhost".to_string(),
            port: 5433,
            name: "app".to_string(),
            username: "replicator".to_string(),
            password: Some("secret".to_string().into()),
            tls,
        }
    }

    #[test]
    fn connect_options_target_the_configured_database() {
        let options = local(TlsConfig::default()).connect_options();

        assert_eq!(options.get_dbname(), Some("app"));
        assert_eq!(options.get_user(), Some("replicator"));
        assert_eq!(options.get_ports(), &[5433]);
        assert_eq!(options.get_application_name(), Some(APPLICATION_NAME));
        assert_eq!(options.get_options(), Some(SESSION_OPTIONS));
        assert_eq!(options.get_ssl_mode(), SslMode::Prefer);
        assert_eq!(options.get_password(), Some("secret".as_bytes()));
    }

    #[test]
    fn enabled_tls_requires_certificates() {
        let tls = TlsConfig {
            trusted_root_certs: String::new(),
            enabled: true,
        };
        assert!(matches!(
            local(tls).validate(),
            Err(ValidationError::MissingTrustedRootCerts)
        ));

        let tls = TlsConfig {
            trusted_root_certs: "-----BEGIN CERTIFICATE-----".to_string(),
            enabled: true,
        };
        let config = local(tls);
        assert!(config.validate().is_ok());
        assert_eq!(config.connect_options().get_ssl_mode(), SslMode::Require);
    }

    #[test]
    fn empty_username_is_rejected() {
        let config = PgConnectionConfig {
            username: String::new(),
            ..local(TlsConfig::default())
        };

        assert!(matches!(
            config.validate(),
            Err(ValidationError::InvalidFieldValue { field, .. }) if field == "pg_connection.username"
        ));
    }
}
