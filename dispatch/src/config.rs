use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(default = "127.0.0.1:3301")]
    pub address: SocketAddr,

    // Deadline for a class once checked out, extended on each result.
    #[envconfig(default = "300")]
    pub runner_timeout: EnvSecsDuration,

    // Inactivity deadline for the whole run.
    #[envconfig(default = "300")]
    pub server_timeout: EnvSecsDuration,

    // When set, runners must present a matching `revision` query parameter.
    pub revision: Option<String>,

    #[envconfig(default = "0.01")]
    pub shutdown_delay_for_connection_close: EnvSecsDuration,

    #[envconfig(default = "5")]
    pub shutdown_delay_for_outstanding_runners: EnvSecsDuration,

    #[envconfig(default = "false")]
    pub disable_requeueing: bool,

    // Shut down early after this many failed results. 0 means unlimited.
    #[envconfig(default = "0")]
    pub failure_limit: u32,

    // Binary only: path to the JSON manifest of discovered test classes.
    pub test_manifest: Option<String>,
}

/// Seconds, possibly fractional, parsed from the environment.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<f64>().map_err(|_| ParseEnvSecsDurationError)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(ParseEnvSecsDurationError);
        }

        Ok(EnvSecsDuration(Duration::from_secs_f64(secs)))
    }
}
