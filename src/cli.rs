//! Command line and environment surface.
//!
//! Flags override the config file, which overrides defaults. The restart
//! markers set by a predecessor, and the socket-activation variables set by a
//! service manager, arrive through the same flags' environment fallbacks.

use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

use clap::builder::BoolishValueParser;
use clap::Parser;

use crate::config::{read_config, validate_config, ConfigError, HandoffConfig, ValidationError};
use crate::lifecycle::spawner::{LISTENER_FD_ENV, LISTENER_ORDINAL, READY_PIPE_FD_ENV, RESTART_MARKER_ENV};
use crate::lifecycle::startup::{SocketActivation, StartupMode};

#[derive(Debug, Clone, Parser)]
#[command(name = "graceful-handoff")]
#[command(about = "HTTP service that hands its listener to a new process on SIGHUP", long_about = None)]
pub struct Cli {
    /// Optional TOML configuration file
    #[arg(long, env = "HANDOFF_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address to bind on a fresh start
    #[arg(long, env = "HANDOFF_BIND")]
    pub bind: Option<String>,

    /// This instance was spawned by a predecessor
    #[arg(long, env = RESTART_MARKER_ENV, value_parser = BoolishValueParser::new())]
    pub restart_marker: bool,

    /// Descriptor ordinal of the inherited listener
    #[arg(long, env = LISTENER_FD_ENV, default_value_t = LISTENER_ORDINAL)]
    pub inherited_listener_descriptor: RawFd,

    /// Descriptor ordinal of the inherited handshake write end
    #[arg(long, env = READY_PIPE_FD_ENV)]
    pub inherited_handshake_descriptor: Option<RawFd>,

    /// Process the service manager passed sockets to
    #[arg(long, env = "LISTEN_PID", hide = true)]
    pub listen_pid: Option<String>,

    /// Number of sockets passed by the service manager
    #[arg(long, env = "LISTEN_FDS", hide = true)]
    pub listen_fds: Option<String>,

    /// Every Nth unit of work is slow (0 disables)
    #[arg(long, env = "SLOW_EVERY_N")]
    pub slow_path_trigger_ratio: Option<u64>,

    /// Duration of a slow unit of work, in seconds
    #[arg(long, env = "SLOW_SECS")]
    pub work_duration: Option<u64>,

    /// Heartbeat cadence during slow work, in seconds
    #[arg(long, env = "HEARTBEAT_SECS")]
    pub heartbeat_interval: Option<u64>,

    /// Executable launched on upgrade (defaults to this executable)
    #[arg(long, env = "NEW_BINARY_PATH")]
    pub successor_binary: Option<PathBuf>,

    /// Readiness handshake timeout, in seconds
    #[arg(long, env = "HANDOFF_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: Option<u64>,

    /// Drain deadline, in seconds
    #[arg(long, env = "HANDOFF_DRAIN_DEADLINE")]
    pub drain_deadline: Option<u64>,
}

impl Cli {
    /// Layer flags over the config file (or defaults) and validate the result.
    pub fn resolve_config(&self) -> Result<HandoffConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => read_config(path)?,
            None => HandoffConfig::default(),
        };
        self.apply_overrides(&mut config);
        validate_config(&config).map_err(ConfigError::Validation)?;
        Ok(config)
    }

    fn apply_overrides(&self, config: &mut HandoffConfig) {
        if let Some(bind) = &self.bind {
            config.listener.bind_address = bind.clone();
        }
        if let Some(n) = self.slow_path_trigger_ratio {
            config.workload.slow_every_n = n;
        }
        if let Some(secs) = self.work_duration {
            config.workload.work_duration_secs = secs;
        }
        if let Some(secs) = self.heartbeat_interval {
            config.workload.heartbeat_interval_secs = secs;
        }
        if let Some(path) = &self.successor_binary {
            config.restart.successor_binary = Some(path.clone());
        }
        if let Some(secs) = self.handshake_timeout {
            config.restart.handshake_timeout_secs = secs;
        }
        if let Some(secs) = self.drain_deadline {
            config.drain.deadline_secs = secs;
        }
    }

    /// How this process should obtain its listener.
    pub fn startup_mode(&self, config: &HandoffConfig) -> Result<StartupMode, ConfigError> {
        let bind: SocketAddr = config.listener.bind_address.parse().map_err(|_| {
            ConfigError::Validation(vec![ValidationError::InvalidAddress {
                field: "listener.bind_address",
                value: config.listener.bind_address.clone(),
            }])
        })?;
        let activation = SocketActivation::from_vars(
            self.listen_pid.as_deref(),
            self.listen_fds.as_deref(),
            std::process::id(),
        );
        Ok(StartupMode::detect(
            self.restart_marker,
            activation,
            bind,
            self.inherited_listener_descriptor,
            self.inherited_handshake_descriptor,
        ))
    }
}
