//! Runtime settings resolved from the environment.
//!
//! Every tunable of the controller lives here with a production default, so
//! the binary runs with no configuration at all. `LAYERSMITH_*` variables
//! (typically from a `.env` file loaded by the binary) override individual
//! fields.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Controller settings shared (behind an `Arc`) by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Address the TCP listeners bind to.
    pub bind_addr: String,
    /// Control protocol port.
    pub control_port: u16,
    /// One-way status notification port.
    pub notify_port: u16,
    /// UDP port the service announcement is broadcast on.
    pub announce_port: u16,
    /// Magic prefix identifying our announcement datagrams.
    pub announce_magic: String,
    /// Delay between service announcements.
    pub announce_interval: Duration,
    /// Dotted subnet prefixes preferred when picking the announced address.
    pub preferred_subnets: Vec<String>,
    /// Hostname reported in greeting responses.
    pub hostname: String,

    /// Maximum concurrently served control connections.
    pub max_connections: usize,
    /// Maximum accepted request size in bytes.
    pub max_request_bytes: usize,
    /// How long a connection may sit idle while receiving a request.
    pub recv_timeout: Duration,
    /// How long a connection waits for the scheduler's response before
    /// closing without payload.
    pub response_timeout: Duration,

    /// File extension of render artifacts (without the dot).
    pub artifact_ext: String,
    /// Files below this size are treated as partially flushed and ignored.
    pub min_artifact_bytes: u64,
    /// Output-directory poll interval.
    pub watch_interval: Duration,
    /// Per-artifact verification subprocess timeout.
    pub verify_timeout: Duration,
    /// How long the watcher waits for stragglers before forcing assembly.
    pub assembly_timeout: Duration,

    /// History sweep interval.
    pub sweep_interval: Duration,
    /// Age after which history entries are dropped.
    pub job_expiry: Duration,

    /// Scene-preparation executable.
    pub scene_prep_cmd: PathBuf,
    /// Batch-render executable.
    pub render_cmd: PathBuf,
    /// Per-artifact content check executable.
    pub verify_cmd: PathBuf,
    /// Layer compositing executable.
    pub assemble_cmd: PathBuf,
    /// Render resolution when the scene's own settings are not used.
    pub res_x: u32,
    pub res_y: u32,
    /// Output image format handed to the render and assembly tools.
    pub output_format: String,

    /// Local staging directory for submitted scene files. `None` disables
    /// the file-transfer phase.
    pub staging_dir: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0".to_string(),
            control_port: 52121,
            notify_port: 9005,
            announce_port: 52121,
            announce_magic: "lsmth1".to_string(),
            announce_interval: Duration::from_secs(15),
            preferred_subnets: Vec::new(),
            hostname: "localhost".to_string(),
            max_connections: 32,
            max_request_bytes: 2048,
            recv_timeout: Duration::from_secs(3),
            response_timeout: Duration::from_secs(15),
            artifact_ext: "sgi".to_string(),
            min_artifact_bytes: 200,
            watch_interval: Duration::from_secs(15),
            verify_timeout: Duration::from_secs(360),
            assembly_timeout: Duration::from_secs(240),
            sweep_interval: Duration::from_secs(600),
            job_expiry: Duration::from_secs(24 * 60 * 60),
            scene_prep_cmd: PathBuf::from("layersmith-prep"),
            render_cmd: PathBuf::from("layersmith-render"),
            verify_cmd: PathBuf::from("layersmith-verify"),
            assemble_cmd: PathBuf::from("layersmith-assemble"),
            res_x: 3840,
            res_y: 2160,
            output_format: "sgi".to_string(),
            staging_dir: None,
        }
    }
}

impl Settings {
    /// Build settings from the process environment on top of the defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env_string("LAYERSMITH_BIND_ADDR", defaults.bind_addr),
            control_port: env_parse("LAYERSMITH_CONTROL_PORT", defaults.control_port),
            notify_port: env_parse("LAYERSMITH_NOTIFY_PORT", defaults.notify_port),
            announce_port: env_parse("LAYERSMITH_ANNOUNCE_PORT", defaults.announce_port),
            announce_magic: env_string("LAYERSMITH_ANNOUNCE_MAGIC", defaults.announce_magic),
            announce_interval: env_secs("LAYERSMITH_ANNOUNCE_INTERVAL_SECS", defaults.announce_interval),
            preferred_subnets: env_list("LAYERSMITH_PREFERRED_SUBNETS"),
            hostname: env::var("HOSTNAME").unwrap_or(defaults.hostname),
            max_connections: env_parse("LAYERSMITH_MAX_CONNECTIONS", defaults.max_connections),
            max_request_bytes: env_parse("LAYERSMITH_MAX_REQUEST_BYTES", defaults.max_request_bytes),
            recv_timeout: env_secs("LAYERSMITH_RECV_TIMEOUT_SECS", defaults.recv_timeout),
            response_timeout: env_secs("LAYERSMITH_RESPONSE_TIMEOUT_SECS", defaults.response_timeout),
            artifact_ext: env_string("LAYERSMITH_ARTIFACT_EXT", defaults.artifact_ext),
            min_artifact_bytes: env_parse("LAYERSMITH_MIN_ARTIFACT_BYTES", defaults.min_artifact_bytes),
            watch_interval: env_secs("LAYERSMITH_WATCH_INTERVAL_SECS", defaults.watch_interval),
            verify_timeout: env_secs("LAYERSMITH_VERIFY_TIMEOUT_SECS", defaults.verify_timeout),
            assembly_timeout: env_secs("LAYERSMITH_ASSEMBLY_TIMEOUT_SECS", defaults.assembly_timeout),
            sweep_interval: env_secs("LAYERSMITH_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            job_expiry: env_secs("LAYERSMITH_JOB_EXPIRY_SECS", defaults.job_expiry),
            scene_prep_cmd: env_path("LAYERSMITH_SCENE_PREP_CMD", defaults.scene_prep_cmd),
            render_cmd: env_path("LAYERSMITH_RENDER_CMD", defaults.render_cmd),
            verify_cmd: env_path("LAYERSMITH_VERIFY_CMD", defaults.verify_cmd),
            assemble_cmd: env_path("LAYERSMITH_ASSEMBLE_CMD", defaults.assemble_cmd),
            res_x: env_parse("LAYERSMITH_RES_X", defaults.res_x),
            res_y: env_parse("LAYERSMITH_RES_Y", defaults.res_y),
            output_format: env_string("LAYERSMITH_OUTPUT_FORMAT", defaults.output_format),
            staging_dir: env::var("LAYERSMITH_STAGING_DIR").ok().map(PathBuf::from),
        }
    }

    /// `host:port` address of the control listener.
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.control_port)
    }

    /// `host:port` address of the notification listener.
    pub fn notify_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.notify_port)
    }
}

fn env_string(key: &str, default: String) -> String {
    env::var(key).unwrap_or(default)
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .map_or(default, Duration::from_secs)
}

fn env_path(key: &str, default: PathBuf) -> PathBuf {
    env::var(key).map_or(default, PathBuf::from)
}

fn env_list(key: &str) -> Vec<String> {
    env::var(key)
        .map(|v| {
            v.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
