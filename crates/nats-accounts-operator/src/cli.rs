use clap::Parser;

/// NATS accounts operator: reconciles Operator, SigningKey, Account and
/// User resources into NATS credential secrets and account-server state.
#[derive(Debug, Parser)]
#[command(name = "nats-accounts-operator")]
pub struct Cli {
    /// Address the metrics endpoint binds to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub metrics_bind_address: String,

    /// Address the health probe endpoints bind to.
    #[arg(long, default_value = "0.0.0.0:8081")]
    pub health_probe_bind_address: String,

    /// Log filter when RUST_LOG is unset, e.g. "info" or
    /// "nats_accounts_operator=debug,info".
    #[arg(long, default_value = "info")]
    pub log_level: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply() {
        let cli = Cli::parse_from(["nats-accounts-operator"]);
        assert_eq!(cli.metrics_bind_address, "0.0.0.0:8080");
        assert_eq!(cli.health_probe_bind_address, "0.0.0.0:8081");
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::parse_from([
            "nats-accounts-operator",
            "--metrics-bind-address",
            "127.0.0.1:9090",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.metrics_bind_address, "127.0.0.1:9090");
        assert_eq!(cli.log_level, "debug");
    }
}
