//! Runtime configuration carried from the command line to the dispatcher.

use clap::ValueEnum;
use std::fmt;
use std::time::Duration;

use crate::rules::RuleSet;

/// Transport protocol the proxy listens on and forwards with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Proto {
    Tcp,
    Udp,
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
        }
    }
}

/// Everything the dispatcher needs to run, assembled by the CLI.
pub struct Config {
    /// Transport protocol.
    pub proto: Proto,

    /// Local port to listen on.
    pub local_port: u16,

    /// Remote host, `"0"` meaning "use the original destination".
    pub remote_host: String,

    /// Remote port, 0 meaning "use the original destination port".
    pub remote_port: u16,

    /// Parsed substitution rules.
    pub rules: RuleSet,

    /// Idle deadline for datagram flows.
    pub udp_timeout: Duration,
}
