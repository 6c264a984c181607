use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use relay_dial::{Cli, ConfigError, load_profile};
use relay_session::{Direction, NegotiationRole, Reliability};
use serde_json::json;

fn parse(args: &[&str]) -> Cli {
    let mut argv = vec![
        "relay-dial",
        "--endpoint",
        "wss://relay.example/signaling",
        "--channel",
        "room-1",
    ];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).expect("valid arguments")
}

fn write_profile(name: &str, contents: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("relay-dial-{}-{name}.toml", std::process::id()));
    fs::write(&path, contents).expect("write profile");
    path
}

#[test]
fn defaults_join_with_audio_and_video() {
    let cli = parse(&[]);
    let params = cli.session_params().expect("params");
    assert_eq!(params.timeout, Duration::from_secs(10));
    assert_eq!(params.negotiation, NegotiationRole::Answerer);
    assert_eq!(params.identity.channel_id, "room-1");
    assert!(params.configuration.audio());
    assert!(params.configuration.video());
    assert_eq!(params.configuration.role(), Direction::SendRecv);
}

#[test]
fn identity_flags_reach_the_session() {
    let cli = parse(&[
        "--client-id",
        "device-7",
        "--metadata",
        r#"{"access_token":"abc"}"#,
        "--timeout",
        "3",
        "--offerer",
    ]);
    let params = cli.session_params().expect("params");
    assert_eq!(params.identity.client_id.as_deref(), Some("device-7"));
    assert_eq!(params.identity.metadata, Some(json!({"access_token": "abc"})));
    assert_eq!(params.timeout, Duration::from_secs(3));
    assert_eq!(params.negotiation, NegotiationRole::Offerer);
}

#[test]
fn media_flags_build_the_configuration() {
    let cli = parse(&[
        "--role",
        "recvonly",
        "--no-audio",
        "--video-codec",
        "VP9",
        "--video-codec",
        "VP8",
        "--data-channel",
        "#chat",
    ]);
    let configuration = cli.media.configuration().expect("configuration");
    assert!(!configuration.audio());
    assert_eq!(configuration.role(), Direction::RecvOnly);
    assert_eq!(configuration.video_codecs(), ["VP9", "VP8"]);
    assert_eq!(configuration.data_channels()[0].label, "#chat");
}

#[test]
fn cluster_and_data_channel_signaling_flags() {
    let cli = parse(&[
        "--fallback-endpoint",
        "wss://relay-b.example/signaling",
        "--data-channel-signaling",
        "--ignore-disconnect-websocket",
    ]);
    let params = cli.session_params().expect("params");
    assert_eq!(
        params.identity.endpoints().collect::<Vec<_>>(),
        [
            "wss://relay.example/signaling",
            "wss://relay-b.example/signaling"
        ]
    );
    assert_eq!(params.configuration.data_channel_signaling(), Some(true));
    assert_eq!(params.configuration.ignore_disconnect_websocket(), Some(true));

    let base = ["relay-dial", "--endpoint", "wss://r", "--channel", "c"];
    let mut without_switch = base.to_vec();
    without_switch.push("--ignore-disconnect-websocket");
    assert!(Cli::try_parse_from(without_switch).is_err());
}

#[test]
fn invalid_media_flags_are_reported() {
    let cli = parse(&["--no-audio", "--no-video"]);
    assert!(matches!(
        cli.session_params(),
        Err(ConfigError::Invalid(_))
    ));
}

#[test]
fn malformed_metadata_and_zero_timeout_are_rejected_by_the_parser() {
    let base = ["relay-dial", "--endpoint", "wss://r", "--channel", "c"];
    let mut with_metadata = base.to_vec();
    with_metadata.extend(["--metadata", "{not json"]);
    assert!(Cli::try_parse_from(with_metadata).is_err());

    let mut with_timeout = base.to_vec();
    with_timeout.extend(["--timeout", "0"]);
    assert!(Cli::try_parse_from(with_timeout).is_err());
}

#[test]
fn profile_conflicts_with_media_flags() {
    let argv = [
        "relay-dial",
        "--endpoint",
        "wss://r",
        "--channel",
        "c",
        "--profile",
        "media.toml",
        "--no-video",
    ];
    assert!(Cli::try_parse_from(argv).is_err());
}

#[test]
fn toml_profile_loads_a_data_only_configuration() {
    let path = write_profile(
        "data-only",
        r##"
data_only = true
audio = false
video = false

[[data_channels]]
label = "#telemetry"
reliability = { mode = "max_retransmits", count = 0 }
"##,
    );
    let cli = parse(&["--profile", path.to_str().expect("utf8 path")]);
    let configuration = cli.media.configuration().expect("profile");
    fs::remove_file(&path).ok();

    assert!(configuration.data_only());
    assert_eq!(
        configuration.data_channels()[0].reliability,
        Reliability::MaxRetransmits { count: 0 }
    );
}

#[test]
fn profile_errors_name_the_file() {
    let missing = load_profile(&std::env::temp_dir().join("relay-dial-no-such-profile.toml"));
    assert!(matches!(missing, Err(ConfigError::Read { .. })));

    let path = write_profile("unknown-key", "bitrate_everything = 9000\n");
    let err = load_profile(&path).expect_err("unknown key");
    fs::remove_file(&path).ok();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("unknown-key"));
}
