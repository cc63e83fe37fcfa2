use aggregator::config::Config as AggregatorConfig;
use serde::Deserialize;
use std::fs::File;

fn default_metrics_prefix() -> String {
    "sourcehub".into()
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
    #[serde(default = "default_metrics_prefix")]
    pub prefix: String,
}

#[derive(Deserialize, Debug, Default, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: Option<String>,
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: Option<String>,
}

#[derive(Deserialize, Debug, Default)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub aggregator: AggregatorConfig,
}

impl Config {
    pub fn from_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use aggregator::config::StateStoreType;
    use aggregator::types::SourceKind;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn full_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: https://key@sentry.example/1
                level: debug
            aggregator:
                listener:
                    host: 0.0.0.0
                    port: 8080
                refresh:
                    interval_secs: 600
                    batch_size: 3
                state_store:
                    type: filesystem
                    base_dir: /var/lib/sourcehub/
                sources:
                    - name: sponsored
                      kind: sheet
                      spreadsheetId: 1AbC
                      tab: Sponsored
                    - name: about
                      kind: document
                      url: https://docs.example/about
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(
            config.common.metrics,
            Some(MetricsConfig {
                statsd_host: "127.0.0.1".into(),
                statsd_port: 8125,
                prefix: "sourcehub".into(),
            })
        );
        assert_eq!(config.common.logging.level.as_deref(), Some("debug"));

        let aggregator = config.aggregator;
        assert!(aggregator.validate().is_ok());
        assert_eq!(aggregator.listener.port, 8080);
        assert_eq!(aggregator.refresh.batch_size, 3);
        assert_eq!(
            aggregator.state_store,
            StateStoreType::Filesystem {
                base_dir: "/var/lib/sourcehub/".into()
            }
        );
        let kinds: Vec<_> = aggregator
            .builtin_sources()
            .iter()
            .map(|s| s.kind())
            .collect();
        assert_eq!(kinds, vec![SourceKind::Sheet, SourceKind::Document]);
    }

    #[test]
    fn minimal_config() {
        let tmp = write_tmp_file("aggregator: {}\n");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.common.metrics.is_none());
        assert_eq!(config.common.logging, LoggingConfig::default());
        assert_eq!(config.aggregator.listener.port, 3000);
        assert!(config.aggregator.sources.is_empty());
    }

    #[test]
    fn missing_or_invalid_file() {
        assert!(matches!(
            Config::from_file(std::path::Path::new("/nonexistent/sourcehub.yaml")),
            Err(ConfigError::LoadError(_))
        ));

        let tmp = write_tmp_file("metrics: {}\n");
        assert!(matches!(
            Config::from_file(tmp.path()),
            Err(ConfigError::ParseError(_))
        ));
    }
}
