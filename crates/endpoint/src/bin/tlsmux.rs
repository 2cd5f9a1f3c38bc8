//! tlsmux endpoint binary

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use tlsmux_core::ValidateConfig;
use tlsmux_core::tracing::{InstrumentationConfig, init::init_default, init_tracing};
use tlsmux_endpoint::cert::generate_certificate;
use tlsmux_endpoint::{EndpointConfig, TracingSink, server};
use tracing::info;

/// Inline PEM certificate chain, read from the environment
const ENV_INLINE_CERT: &str = "TLSMUX_CERT";
/// Inline PEM private key, read from the environment
const ENV_INLINE_KEY: &str = "TLSMUX_KEY";

/// TLS-terminating tunnel endpoint
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short = 'c', long = "config")]
    config: Option<String>,

    /// Address to accept TLS connections on
    #[arg(long = "bind")]
    bind: Option<String>,

    /// Destination: host:port, or path/host:port,... with --tunnel
    #[arg(long = "dst")]
    dst: Option<String>,

    /// Serve the multiplexed tunnel instead of relaying raw bytes
    #[arg(long)]
    tunnel: bool,

    /// Tunnel path used when --dst names none
    #[arg(long = "service-name")]
    service_name: Option<String>,

    /// PEM certificate chain file
    #[arg(long)]
    cert: Option<String>,

    /// PEM private key file
    #[arg(long)]
    key: Option<String>,

    /// DNS name for a generated certificate
    #[arg(long = "server-name")]
    server_name: Option<String>,

    /// Per-direction idle timeout of the byte relay, in seconds
    #[arg(long = "idle-timeout")]
    idle_timeout: Option<u64>,

    /// Destination to client buffer size, in bytes
    #[arg(long = "outbound-buf")]
    outbound_buf: Option<usize>,

    /// Client to destination buffer size, in bytes
    #[arg(long = "inbound-buf")]
    inbound_buf: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level")]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a self-signed certificate and write it as <dns>.cert / <dns>.key
    GenCert {
        /// DNS name; a random one is chosen when omitted
        #[arg(long = "server-name", default_value = "")]
        server_name: String,

        /// Directory to write the files into
        #[arg(long = "out-dir", default_value = ".")]
        out_dir: PathBuf,
    },
}

impl Cli {
    /// Flags win over file and environment configuration
    fn apply(&self, config: &mut EndpointConfig) {
        if let Some(bind) = &self.bind {
            config.listen.bind_addr.clone_from(bind);
        }
        if let Some(dst) = &self.dst {
            config.listen.destination.clone_from(dst);
        }
        if self.tunnel {
            config.listen.tunnel = true;
        }
        if let Some(name) = &self.service_name {
            config.listen.service_name.clone_from(name);
        }
        if let Some(cert) = &self.cert {
            config.identity.cert_path.clone_from(cert);
        }
        if let Some(key) = &self.key {
            config.identity.key_path.clone_from(key);
        }
        if let Some(name) = &self.server_name {
            config.identity.server_name.clone_from(name);
        }
        if let Some(secs) = self.idle_timeout {
            config.relay.idle_timeout_secs = secs;
        }
        if let Some(size) = self.outbound_buf {
            config.relay.outbound_buffer = size;
        }
        if let Some(size) = self.inbound_buf {
            config.relay.inbound_buffer = size;
        }
        if let Some(level) = &self.log_level {
            config.server.log_level.clone_from(level);
        }
    }
}

/// Fold inline PEM material from the environment into the identity inputs
fn apply_inline_env(config: &mut EndpointConfig) {
    if let Ok(cert) = std::env::var(ENV_INLINE_CERT) {
        config.identity.inline_cert = cert;
    }
    if let Ok(key) = std::env::var(ENV_INLINE_KEY) {
        config.identity.inline_key = key;
    }
}

/// Paths of the `<dns>.cert` and `<dns>.key` files inside `out_dir`
///
/// The name must be a single plain path component so the files stay in `out_dir`.
fn output_paths(dns_name: &str, out_dir: &Path) -> Result<(PathBuf, PathBuf)> {
    let mut components = Path::new(dns_name).components();
    let plain = matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    );
    if !plain || dns_name.contains(['/', '\\']) {
        bail!("server name [{dns_name}] cannot be used as a file name");
    }
    Ok((
        out_dir.join(format!("{dns_name}.cert")),
        out_dir.join(format!("{dns_name}.key")),
    ))
}

fn gen_cert(server_name: &str, out_dir: &Path) -> Result<()> {
    let generated = generate_certificate(server_name, None)?;
    let (cert_path, key_path) = output_paths(&generated.dns_name, out_dir)?;

    std::fs::create_dir_all(out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;
    std::fs::write(&cert_path, &generated.cert_pem)
        .with_context(|| format!("failed to write {}", cert_path.display()))?;
    std::fs::write(&key_path, &generated.key_pem)
        .with_context(|| format!("failed to write {}", key_path.display()))?;

    info!("wrote {} and {}", cert_path.display(), key_path.display());
    println!("{}", generated.dns_name);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::GenCert {
        server_name,
        out_dir,
    }) = &cli.command
    {
        init_default()?;
        return gen_cert(server_name, out_dir);
    }

    let mut config = if let Some(config_path) = &cli.config {
        EndpointConfig::load_from_file(config_path)?
    } else {
        EndpointConfig::load()?
    };
    apply_inline_env(&mut config);
    cli.apply(&mut config);
    config.validate()?;

    let instrumentation_config = InstrumentationConfig {
        service_name: "tlsmux".to_string(),
        service_version: env!("CARGO_PKG_VERSION").to_string(),
        log_level: config.server.log_level.clone(),
        format: config.server.log_format,
    };
    init_tracing(&instrumentation_config)?;

    info!("Starting tlsmux endpoint");
    if let Some(config_path) = &cli.config {
        info!("Loaded configuration from: {}", config_path);
    }

    let sink = Arc::new(TracingSink);
    tokio::select! {
        result = server::run(&config, sink) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Shutting down...");
        }
    }

    Ok(())
}
