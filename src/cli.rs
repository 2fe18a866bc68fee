//! Command line interface for the `pinbridge` binary.
//!
//! Kept free of crate-internal imports so `build.rs` can include it to
//! render the man page.

use std::{net::SocketAddr, num::NonZeroU32};

use clap::{ArgAction, Parser, builder::BoolishValueParser};

/// Command line arguments for the `pinbridge` binary.
#[derive(Debug, Parser)]
#[command(
    name = "pinbridge",
    version,
    about = "Bridge virtual pins of a device session to an MQTT broker"
)]
pub struct Cli {
    /// Device protocol server.
    #[arg(short, long, default_value = "cloud.blynk.cc")]
    pub server: String,

    /// Device protocol server port.
    #[arg(short, long, default_value_t = 8442)]
    pub port: u16,

    /// Access token presented at login.
    #[arg(short, long)]
    pub token: String,

    /// Log every frame sent and received.
    #[arg(short = 'v', long)]
    pub dump: bool,

    /// MQTT broker host.
    #[arg(long, default_value = "test.mosquitto.org")]
    pub mqtt_server: String,

    /// MQTT broker port.
    #[arg(long, default_value_t = 1883)]
    pub mqtt_port: u16,

    /// Client identifier presented to the MQTT broker.
    #[arg(long, default_value = "blynk.cc")]
    pub mqtt_client_id: String,

    /// Base topic to subscribe to and publish under.
    #[arg(long, default_value = "/blynk")]
    pub topic: String,

    /// Socket send buffer size in bytes.
    #[arg(long, value_name = "BYTES")]
    pub sndbuf: Option<u32>,

    /// Socket receive buffer size in bytes.
    #[arg(long, value_name = "BYTES")]
    pub rcvbuf: Option<u32>,

    /// Enable `TCP_NODELAY` on the device connection (1 or 0).
    #[arg(
        long,
        action = ArgAction::Set,
        default_value = "1",
        value_parser = BoolishValueParser::new()
    )]
    pub nodelay: bool,

    /// Remote session to bind as a bridge link; repeat for more links.
    #[arg(long = "bridge", value_name = "ID")]
    pub bridges: Vec<String>,

    /// Legacy topic suffix mapped to a pin; replaces the default table.
    #[arg(long = "map", value_name = "SUFFIX=PIN", value_parser = parse_mapping)]
    pub mappings: Vec<(String, u16)>,

    /// Seconds between heartbeats.
    #[arg(long, default_value_t = 10)]
    pub heartbeat_secs: u64,

    /// Milliseconds to wait for a correlated response.
    #[arg(long, default_value_t = 3000)]
    pub response_timeout_ms: u64,

    /// Seconds to wait for the device connection to open.
    #[arg(long, default_value_t = 3)]
    pub connect_timeout_secs: u64,

    /// End the session after this many heartbeat periods without traffic.
    #[arg(long, value_name = "COUNT")]
    pub max_missed_heartbeats: Option<NonZeroU32>,

    /// Upper bound on frames written per second.
    #[arg(long, value_name = "FRAMES")]
    pub max_send_rate: Option<usize>,

    /// Serve Prometheus metrics on this address.
    #[arg(long, value_name = "ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

fn parse_mapping(raw: &str) -> Result<(String, u16), String> {
    let (suffix, pin) = raw
        .rsplit_once('=')
        .ok_or_else(|| format!("expected SUFFIX=PIN, got `{raw}`"))?;
    if suffix.is_empty() {
        return Err("topic suffix must not be empty".to_owned());
    }
    let pin = pin
        .parse()
        .map_err(|_| format!("`{pin}` is not a pin number"))?;
    Ok((suffix.to_owned(), pin))
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use rstest::rstest;

    use super::Cli;

    #[test]
    fn defaults_follow_public_server() {
        let cli = Cli::parse_from(["pinbridge", "-t", "secret"]);
        assert_eq!(cli.server, "cloud.blynk.cc");
        assert_eq!(cli.port, 8442);
        assert_eq!(cli.topic, "/blynk");
        assert!(cli.nodelay);
        assert!(!cli.dump);
        assert!(cli.bridges.is_empty());
        assert_eq!(cli.heartbeat_secs, 10);
    }

    #[test]
    fn parses_repeated_bridges_and_mappings() {
        let cli = Cli::parse_from([
            "pinbridge",
            "--token",
            "secret",
            "--bridge",
            "First",
            "--bridge",
            "Second",
            "--map",
            "sensors/lux=9",
            "--nodelay",
            "0",
            "-v",
        ]);
        assert_eq!(cli.bridges, ["First", "Second"]);
        assert_eq!(cli.mappings, [("sensors/lux".to_owned(), 9)]);
        assert!(!cli.nodelay);
        assert!(cli.dump);
    }

    #[rstest]
    #[case(&["--nodelay", "0"], false)]
    #[case(&["--nodelay=0"], false)]
    #[case(&["--nodelay", "1"], true)]
    #[case(&["--nodelay=false"], false)]
    #[case(&[], true)]
    fn nodelay_takes_a_value(#[case] flag: &[&str], #[case] expected: bool) {
        let args = ["pinbridge", "-t", "x"].into_iter().chain(flag.iter().copied());
        let cli = Cli::try_parse_from(args).expect("valid arguments");
        assert_eq!(cli.nodelay, expected);
    }

    #[test]
    fn rejects_malformed_mapping() {
        let result = Cli::try_parse_from(["pinbridge", "-t", "x", "--map", "sensors/lux"]);
        assert!(result.is_err());
    }

    #[test]
    fn token_is_required() {
        assert!(Cli::try_parse_from(["pinbridge"]).is_err());
    }
}
