use anyhow::Context;
use clap::{ArgAction, Parser};
use nexum::{
    banner::{print_banner, print_startup_log, BannerInfo},
    init_logging,
    logging::LogFormat,
    LoggingConfig, Options, Server,
};
use tracing::info;

/// Nexum: pub/sub message broker.
#[derive(Parser, Debug)]
#[command(
    name = "nexum-server",
    version,
    disable_version_flag = true,
    about = "Nexum publish/subscribe message broker"
)]
struct Cli {
    /// Client listen port.
    #[arg(short = 'p', long = "port")]
    port: Option<u16>,

    /// Client listen address.
    #[arg(short = 'a', long = "addr", alias = "net")]
    addr: Option<String>,

    /// Enable debug logging.
    #[arg(short = 'D', long = "debug")]
    debug: bool,

    /// Enable protocol trace logging.
    #[arg(short = 'V', long = "trace")]
    trace: bool,

    /// Timestamp log entries.
    #[arg(short = 'T', long = "logtime", num_args = 0..=1, default_missing_value = "true")]
    logtime: Option<bool>,

    /// Username required for client connections.
    #[arg(long = "user")]
    user: Option<String>,

    /// Password required for client connections.
    #[arg(long = "pass")]
    pass: Option<String>,

    /// Authorization token required for client connections.
    #[arg(long = "auth")]
    auth: Option<String>,

    /// Cluster listen port; 0 picks a free port.
    #[arg(long = "cluster_port", alias = "cluster-port")]
    cluster_port: Option<u16>,

    /// Routes to solicit, comma separated (nats-route://host:port).
    #[arg(long = "routes", value_delimiter = ',')]
    routes: Vec<String>,

    /// Log line format: compact, pretty or json.
    #[arg(long = "log-format", default_value = "compact")]
    log_format: LogFormat,

    /// Disable colored log output.
    #[arg(long = "no-color")]
    no_color: bool,

    /// Print version and exit.
    #[arg(short = 'v', long = "version", action = ArgAction::Version)]
    version: Option<bool>,
}

impl Cli {
    /// Флаги командной строки поверх `NEXUM_*`.
    fn apply(
        self,
        opts: &mut Options,
    ) {
        if let Some(port) = self.port {
            opts.port = port;
        }
        if let Some(addr) = self.addr {
            opts.host = addr;
        }
        opts.debug |= self.debug;
        opts.trace |= self.trace;
        if let Some(logtime) = self.logtime {
            opts.logtime = logtime;
        }
        if self.user.is_some() {
            opts.username = self.user;
        }
        if self.pass.is_some() {
            opts.password = self.pass;
        }
        if self.auth.is_some() {
            opts.authorization = self.auth;
        }
        if self.cluster_port.is_some() {
            opts.cluster_port = self.cluster_port;
        }
        if !self.routes.is_empty() {
            opts.routes = self.routes;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_format = cli.log_format;
    let ansi = !cli.no_color;

    let mut opts = Options::from_env().context("failed to read NEXUM_* environment")?;
    cli.apply(&mut opts);

    let logging = init_logging(LoggingConfig {
        format: log_format,
        ansi,
        ..LoggingConfig::from_options(&opts)
    })
    .map_err(|e| anyhow::anyhow!("failed to initialize logging: {e}"))?;

    let server = Server::new(opts).context("invalid server options")?;
    server.start().await.context("failed to start server")?;

    print_banner(&BannerInfo {
        server_id: server.id().to_string(),
        client_addr: server.client_addr(),
        cluster_addr: server.cluster_addr(),
        routes: server.opts().routes.len(),
        auth_required: server.opts().auth_required(),
    });
    print_startup_log();

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown signal received");

    server.shutdown();
    logging.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Тест проверяет, что `--net` принимается как синоним `--addr`.
    #[test]
    fn test_net_is_alias_for_addr() {
        let cli = Cli::try_parse_from(["nexum", "--net", "0.0.0.0", "-p", "4333"]).unwrap();
        let mut opts = Options::default();
        cli.apply(&mut opts);
        assert_eq!(opts.host, "0.0.0.0");
        assert_eq!(opts.port, 4333);
    }
}
