//! CLI for the covey sidecar
//!
use crate::settings;

#[derive(Clone, Debug, clap::Parser)]
#[command(name = settings::APP_NAME, version = settings::APP_VERSION)]
pub struct Cli {
    // Server listen address
    #[clap(
        long,
        default_value = "0.0.0.0",
        env("COVEY_LISTEN_ADDRESS"),
        help = "IP Address to listen on"
    )]
    pub listen_address: String,

    // HTTP API listen port
    #[clap(
        long,
        default_value = settings::DEFAULT_PORT_HTTP,
        env("COVEY_HTTP_LISTEN_PORT"),
        help = "Port to bind the Covey HTTP API server to"
    )]
    pub listen_port: u16,

    // Coordination backend
    #[clap(
        long,
        default_value = "redis://127.0.0.1/",
        env("COVEY_REDIS_URL"),
        help = "Redis URL shared by every peer of the group"
    )]
    pub redis_url: String,

    // Quota sharing group
    #[clap(
        long,
        env("COVEY_CHANNEL"),
        help = "Name of the group sharing this quota"
    )]
    pub channel: String,

    // Group quota: operations allowed per interval
    #[clap(
        long,
        default_value = "100",
        env("COVEY_RATE"),
        help = "Operations allowed per interval across the whole group"
    )]
    pub rate: u32,

    // Group quota: interval length
    #[clap(
        long,
        default_value = "1000",
        env("COVEY_INTERVAL_MS"),
        help = "Rate interval in milliseconds"
    )]
    pub interval_ms: u64,

    // Group quota: concurrency cap, unlimited when absent
    #[clap(
        long,
        env("COVEY_CONCURRENCY"),
        help = "Operations allowed in flight across the whole group"
    )]
    pub concurrency: Option<u32>,

    // Peer liveness
    #[clap(
        long,
        default_value = settings::DEFAULT_PEER_TTL,
        env("COVEY_PEER_TTL_MS"),
        help = "Milliseconds without a heartbeat before a peer is evicted"
    )]
    pub peer_ttl_ms: u64,

    #[clap(
        long,
        default_value = "10",
        env("COVEY_JOIN_TIMEOUT_SECS"),
        help = "Seconds to wait for the group to acknowledge this peer"
    )]
    pub join_timeout_secs: u64,

    #[clap(
        long,
        env("COVEY_LOG_JSON"),
        help = "Emit logs as JSON lines"
    )]
    pub log_json: bool,
}

impl Cli {
    pub fn into_settings(self) -> settings::Settings {
        settings::Settings {
            listen_address: self.listen_address,
            listen_port: self.listen_port,
            redis_url: self.redis_url,
            channel: self.channel,
            rate: self.rate,
            interval_ms: self.interval_ms,
            concurrency: self.concurrency,
            peer_ttl_ms: self.peer_ttl_ms,
            join_timeout_secs: self.join_timeout_secs,
            log_json: self.log_json,
        }
    }
}
