//! Command line and environment configuration

use std::time::Duration;

use clap::{ArgAction, Args, Parser};

use loadrun_common::telemetry::{LogFormat, TelemetryConfig};
use loadrun_controller::resources::DEFAULT_RUNNER_IMAGE;
use loadrun_controller::ControllerConfig;

/// loadrun - Kubernetes operator for distributed load-test runs
#[derive(Parser, Debug)]
#[command(name = "loadrun-operator", version, about, long_about = None)]
pub struct Cli {
    /// Print the TestRun CRD manifest and exit
    #[arg(long)]
    pub crd: bool,

    #[command(flatten)]
    pub controller: ControllerArgs,
}

/// Settings for the controller process
#[derive(Args, Debug, Clone)]
pub struct ControllerArgs {
    /// Only watch TestRuns in this namespace (all namespaces if unset)
    #[arg(long, env = "LOADRUN_NAMESPACE")]
    pub namespace: Option<String>,

    /// Number of TestRuns reconciled at the same time
    #[arg(
        long,
        env = "LOADRUN_MAX_CONCURRENT_RECONCILES",
        default_value_t = 1,
        value_parser = clap::value_parser!(u16).range(1..)
    )]
    pub max_concurrent_reconciles: u16,

    /// Timeout for each runner status call
    #[arg(long, env = "LOADRUN_PROBE_TIMEOUT_SECS", default_value_t = 5)]
    pub probe_timeout_secs: u64,

    /// Timeout for each cloud API call
    #[arg(long, env = "LOADRUN_CLOUD_TIMEOUT_SECS", default_value_t = 30)]
    pub cloud_timeout_secs: u64,

    /// Deadline for a single reconciliation
    #[arg(long, env = "LOADRUN_RECONCILE_TIMEOUT_SECS", default_value_t = 120)]
    pub reconcile_timeout_secs: u64,

    /// Runner image for TestRuns that do not set one
    #[arg(long, env = "LOADRUN_RUNNER_IMAGE", default_value = DEFAULT_RUNNER_IMAGE)]
    pub runner_image: String,

    /// Log output format: json or text
    #[arg(long, env = "LOADRUN_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Install or update the TestRun CRD on startup
    #[arg(long, env = "LOADRUN_INSTALL_CRD", default_value_t = true, action = ArgAction::Set)]
    pub install_crd: bool,
}

impl ControllerArgs {
    /// Tunables handed to the controller context
    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            cloud_timeout: Duration::from_secs(self.cloud_timeout_secs),
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_secs),
            runner_image: self.runner_image.clone(),
        }
    }

    /// Logging and tracing setup
    pub fn telemetry_config(&self) -> TelemetryConfig {
        TelemetryConfig {
            log_format: self.log_format,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_single_reconciler() {
        let cli = Cli::try_parse_from(["loadrun-operator"]).unwrap();
        assert!(!cli.crd);
        let args = cli.controller;
        assert_eq!(args.max_concurrent_reconciles, 1);
        assert!(args.namespace.is_none());
        assert!(args.install_crd);

        let config = args.controller_config();
        assert_eq!(config.probe_timeout, Duration::from_secs(5));
        assert_eq!(config.reconcile_timeout, Duration::from_secs(120));
        assert_eq!(config.runner_image, DEFAULT_RUNNER_IMAGE);
        assert_eq!(args.telemetry_config().log_format, LogFormat::Json);
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "loadrun-operator",
            "--namespace",
            "load",
            "--max-concurrent-reconciles",
            "4",
            "--probe-timeout-secs",
            "2",
            "--runner-image",
            "registry.local/k6:1.0",
            "--log-format",
            "text",
            "--install-crd",
            "false",
        ])
        .unwrap();
        let args = cli.controller;
        assert_eq!(args.namespace.as_deref(), Some("load"));
        assert_eq!(args.max_concurrent_reconciles, 4);
        assert!(!args.install_crd);
        assert_eq!(args.controller_config().probe_timeout, Duration::from_secs(2));
        assert_eq!(args.controller_config().runner_image, "registry.local/k6:1.0");
        assert_eq!(args.telemetry_config().log_format, LogFormat::Text);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let result = Cli::try_parse_from(["loadrun-operator", "--max-concurrent-reconciles", "0"]);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        let result = Cli::try_parse_from(["loadrun-operator", "--log-format", "xml"]);
        assert!(result.is_err());
    }

    #[test]
    fn crd_flag_parses() {
        let cli = Cli::try_parse_from(["loadrun-operator", "--crd"]).unwrap();
        assert!(cli.crd);
    }
}
