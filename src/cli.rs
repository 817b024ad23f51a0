//! Command-line interface for rused

use crate::config::{Config, Proto};
use crate::dispatch::{Dispatcher, DEFAULT_UDP_TIMEOUT};
use crate::resolver::ForwardPolicy;
use crate::rules::RuleSet;
use crate::socket;
use crate::version::{platform, VERSION};
use clap::Parser;
use log::{error, info, LevelFilter};
use std::error::Error;
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;

/// Cli wraps argument parsing and the program run sequence.
pub struct Cli {
    app: App,
}

/// Transparent TCP/UDP proxy that rewrites payload bytes in flight
#[derive(Parser)]
#[clap(
    name = "rused",
    version = VERSION,
    about = "Transparent TCP/UDP proxy that rewrites payload bytes in flight"
)]
struct App {
    /// Protocol to listen on and forward with
    #[clap(value_enum, ignore_case = true)]
    proto: Proto,

    /// Local port to listen on
    lport: u16,

    /// Where connections are forwarded (0 = destination address of the
    /// incoming connection)
    rhost: String,

    /// Destination port (0 = destination port of the incoming connection)
    rport: u16,

    /// Replacement rules, s/pat1/pat2[/count]; eight-bit characters,
    /// including NUL and '/', are written as HTTP-like %XX hex escapes and
    /// a literal '%' as '%%'
    #[clap(required = true, num_args = 1..)]
    rules: Vec<String>,

    /// Idle deadline in seconds for datagram flows
    #[clap(long, default_value_t = DEFAULT_UDP_TIMEOUT.as_secs())]
    udp_timeout: u64,

    /// Show debug logs (use -dd for trace logs)
    #[clap(short = 'd', long, action = clap::ArgAction::Count)]
    debug: u8,
}

impl Cli {
    /// Parse arguments, printing usage and exiting with status 1 on misuse.
    pub fn new() -> Self {
        match App::try_parse() {
            Ok(app) => Cli { app },
            Err(err) => {
                let _ = err.print();
                let code = match err.kind() {
                    clap::error::ErrorKind::DisplayHelp
                    | clap::error::ErrorKind::DisplayVersion => 0,
                    _ => 1,
                };
                process::exit(code);
            }
        }
    }

    /// Executes the proxy, returning any irrecoverable error.
    pub fn execute(&self) -> Result<(), Box<dyn Error>> {
        self.init_logging(self.app.debug);
        info!("rused {} {}", VERSION, platform());

        let rules = RuleSet::parse(&self.app.rules)?;
        info!(
            "Loaded {} rule{}...",
            rules.len(),
            if rules.len() > 1 { "s" } else { "" }
        );

        let config = Config {
            proto: self.app.proto,
            local_port: self.app.lport,
            remote_host: self.app.rhost.clone(),
            remote_port: self.app.rport,
            rules,
            udp_timeout: Duration::from_secs(self.app.udp_timeout),
        };
        self.run(config)
    }

    /// Initialize logging with appropriate level
    fn init_logging(&self, debug_level: u8) {
        let level = match debug_level {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        };

        env_logger::Builder::new()
            .format_timestamp_millis()
            .filter_level(level)
            .init();
    }

    /// Resolve, bind and run the dispatcher until interrupted.
    #[tokio::main(flavor = "current_thread")]
    async fn run(&self, config: Config) -> Result<(), Box<dyn Error>> {
        let policy = ForwardPolicy::resolve(&config.remote_host, config.remote_port).await?;
        policy.announce(&config.remote_host, config.remote_port);

        let listener = socket::bind_listener(config.proto, policy.fixed_host(), config.local_port)?;
        info!("Listening on port {}/{}.", config.local_port, config.proto);

        // The interrupt watcher does nothing beyond raising the flag; the
        // dispatcher observes it right after its next readiness wait.
        let (cancel_tx, cancel_rx) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(err) = signal::ctrl_c().await {
                error!("Error waiting for Ctrl+C: {}", err);
            }
            info!("Shutting down...");
            let _ = cancel_tx.send(true);
        });

        let dispatcher = Dispatcher::new(
            listener,
            policy,
            config.rules,
            config.udp_timeout,
            cancel_rx,
        );
        dispatcher.run().await?;
        Ok(())
    }
}
