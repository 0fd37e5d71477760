// Configuration loading, validation and parameter lookup.
//
// cargo test --test config -- --nocapture

use rtflow::{ChannelConfig, FlowConfig, FlowError, MissingDataPolicy, ParameterSet, SyncMode};
use std::io::Write;

const FULL: &str = r#"
pipeline = "station-feed"
log_filter = "rtflow=debug"

[parameters]
subbands = 8
name = "CS002"
observation.id = 4711
observation.start = 1.5

[[links]]
name = "beams"
[links.channel]
backend = "memory"
name = "beams"

[[links]]
name = "raw"
[links.channel]
backend = "shm"
segment = "rtflow_raw"
tx_band = 0

[[links]]
name = "uplink"
[links.channel]
backend = "socket"
address = "127.0.0.1:4000"
blocking = true

[ring]
mode = "wall_clock"
capacity = 65536
block_len = 4096
missing_data = "fatal"

[sink]
buffers = 3
max_wait_ms = 50
"#;

#[test]
fn test_load_full_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(FULL.as_bytes()).unwrap();

    let config = FlowConfig::load(file.path()).unwrap();
    println!("{config:#?}");
    assert_eq!(config.pipeline, "station-feed");
    assert_eq!(config.log_filter.as_deref(), Some("rtflow=debug"));
    assert_eq!(config.links.len(), 3);

    match &config.link("beams").unwrap().channel {
        ChannelConfig::Memory { capacity, blocking, .. } => {
            assert_eq!(*capacity, rtflow::config::DEFAULT_MEMORY_CAPACITY);
            assert!(!blocking);
        }
        other => panic!("unexpected channel {other:?}"),
    }
    match &config.link("raw").unwrap().channel {
        ChannelConfig::Shm {
            segment,
            tx_band,
            rx_band,
            segment_size,
            ..
        } => {
            assert_eq!(segment, "rtflow_raw");
            assert_eq!(*tx_band, Some(0));
            assert_eq!(*rx_band, None);
            assert_eq!(*segment_size, rtflow::config::DEFAULT_SEGMENT_SIZE);
        }
        other => panic!("unexpected channel {other:?}"),
    }
    assert!(config.link("uplink").unwrap().channel.is_blocking());
    assert!(config.link("missing").is_none());

    assert_eq!(config.ring.mode, SyncMode::WallClock);
    assert_eq!(config.ring.missing_data, MissingDataPolicy::Fatal);
    assert_eq!(config.ring.capacity / config.ring.block_len, 16);
    assert_eq!(config.sink.buffers, 3);
    assert_eq!(config.sink.max_wait().as_millis(), 50);
}

#[test]
fn test_empty_file_is_all_defaults() {
    let config = FlowConfig::from_toml_str("").unwrap();
    assert_eq!(config, FlowConfig::default());
    assert!(config.parameter_set().is_empty());
    assert_eq!(config.ring.mode, SyncMode::Bounded);
}

#[test]
fn test_invalid_files_are_config_errors() {
    let cases = [
        // Ring span not a whole number of blocks.
        "[ring]\ncapacity = 1000\nblock_len = 300\n",
        "[ring]\nblock_len = 0\n",
        "[ring]\nmode = \"wall_clock\"\nunits_per_second = 0.0\n",
        // Unknown backend.
        "[[links]]\nname = \"x\"\n[links.channel]\nbackend = \"carrier-pigeon\"\n",
        "pipeline = [",
    ];
    for text in cases {
        match FlowConfig::from_toml_str(text) {
            Err(FlowError::Config(message)) => println!("rejected: {message}"),
            other => panic!("expected config error for {text:?}, got {other:?}"),
        }
    }
    assert!(matches!(
        FlowConfig::load("/nonexistent/rtflow.toml"),
        Err(FlowError::Config(_))
    ));
}

#[test]
fn test_parameters_flatten_to_dotted_keys() {
    let params = FlowConfig::from_toml_str(FULL).unwrap().parameter_set();
    let keys: Vec<&str> = params.keys().collect();
    assert_eq!(keys, vec!["name", "observation.id", "observation.start", "subbands"]);

    assert_eq!(params.get::<u32>("subbands").unwrap(), 8);
    assert_eq!(params.get::<u64>("observation.id").unwrap(), 4711);
    assert_eq!(params.get::<f64>("observation.start").unwrap(), 1.5);
    assert_eq!(params.get::<String>("name").unwrap(), "CS002");
    assert_eq!(params.raw("name"), Some("CS002"));

    assert!(matches!(params.get::<u32>("absent"), Err(FlowError::Config(_))));
    assert!(matches!(params.get::<u32>("name"), Err(FlowError::Config(_))));
    assert_eq!(params.get_or("absent", 12u32), 12);
}

#[test]
fn test_parameter_set_insert() {
    let mut params = ParameterSet::new();
    params.insert("beams", 488);
    params.insert("antenna.set", "HBA_DUAL");
    assert_eq!(params.len(), 2);
    assert!(params.contains("antenna.set"));
    assert_eq!(params.get::<usize>("beams").unwrap(), 488);
}
