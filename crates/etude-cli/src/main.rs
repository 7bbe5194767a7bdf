mod logging;

use clap::Parser;
use etude_core::config::{DEFAULT_MAX_CONNECTIONS, DEFAULT_PORT};
use etude_core::docroot::DEFAULT_INDEX;
use etude_core::pool::{DEFAULT_MAX_QUEUE, DEFAULT_THREADS};
use etude_core::{ContentTypePolicy, EtudeError, EtudeResult, Server, ServerConfig, TriggerMode};
use logging::LogFormat;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "etude")]
#[command(about = "Event-driven static HTTP/1.1 server")]
#[command(version)]
struct Args {
    /// Port to listen on
    #[arg(short = 'p', long, env = "ETUDE_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Address to bind
    #[arg(long, env = "ETUDE_HOST", default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
    host: IpAddr,

    /// Trigger mode, listener then connections: 0 LT+LT, 1 LT+ET, 2 ET+LT, 3 ET+ET
    #[arg(
        short = 'm',
        long = "trig-mode",
        env = "ETUDE_TRIG_MODE",
        default_value_t = 0,
        value_parser = clap::value_parser!(u8).range(0..=3)
    )]
    trig_mode: u8,

    /// Worker threads
    #[arg(short = 't', long, env = "ETUDE_THREADS", default_value_t = DEFAULT_THREADS)]
    threads: usize,

    /// Requests allowed to wait for a worker
    #[arg(short = 'q', long, env = "ETUDE_MAX_QUEUE", default_value_t = DEFAULT_MAX_QUEUE)]
    max_queue: usize,

    /// Directory served as the document root
    #[arg(short = 'r', long, env = "ETUDE_ROOT", default_value = "./root")]
    root: PathBuf,

    /// File served for `/`
    #[arg(long, env = "ETUDE_INDEX", default_value = DEFAULT_INDEX)]
    index: String,

    #[arg(long, env = "ETUDE_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    max_connections: usize,

    /// Seconds before an idle connection is closed
    #[arg(long, env = "ETUDE_IDLE_TIMEOUT", default_value_t = 15)]
    idle_timeout: u64,

    /// Guess Content-Type from the file extension instead of always sending text/html
    #[arg(long, env = "ETUDE_GUESS_MIME")]
    guess_mime: bool,

    /// Pin worker threads to CPU cores
    #[arg(long, env = "ETUDE_PIN_WORKERS")]
    pin_workers: bool,

    #[arg(long, value_enum, env = "ETUDE_LOG_FORMAT", default_value_t = LogFormat::Plain)]
    log_format: LogFormat,

    /// Default log level when RUST_LOG is unset
    #[arg(long, env = "ETUDE_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn into_config(self) -> EtudeResult<ServerConfig> {
        let trigger = TriggerMode::from_code(self.trig_mode)
            .ok_or_else(|| EtudeError::config(format!("unknown trigger mode {}", self.trig_mode)))?;
        let content_type = if self.guess_mime {
            ContentTypePolicy::Guess
        } else {
            ContentTypePolicy::default()
        };

        let config = ServerConfig::new(SocketAddr::new(self.host, self.port), self.root)
            .index(self.index)
            .threads(self.threads)
            .max_queue_depth(self.max_queue)
            .trigger(trigger)
            .max_connections(self.max_connections)
            .idle_timeout(Duration::from_secs(self.idle_timeout))
            .content_type(content_type)
            .pin_workers(self.pin_workers);
        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    logging::init_logging(args.log_format, &args.log_level);

    match args.into_config().and_then(|config| Server::new(config).serve()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "etude failed");
            ExitCode::FAILURE
        }
    }
}
