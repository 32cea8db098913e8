use env_logger::Builder;
use log::LevelFilter;

/// Targets whose verbosity follows `GRPC_VERBOSITY`.
const TRANSPORT_TARGETS: [&str; 2] = ["comms", "bridge"];

/// Composes the filters of every target, ignoring `RUST_LOG`.
fn builder(level: LevelFilter, transport: Option<LevelFilter>) -> Builder {
    let mut builder = Builder::new();
    builder.filter_level(level);

    if let Some(transport) = transport {
        for target in TRANSPORT_TARGETS {
            builder.filter_module(target, transport);
        }
    }

    builder
}

/// Installs the global logger.
///
/// # Arguments
/// * `level` - The verbosity of every target.
/// * `transport` - Overrides the verbosity of the channel targets.
///
/// `RUST_LOG` still takes precedence over both when set.
pub fn init(level: LevelFilter, transport: Option<LevelFilter>) {
    let mut builder = builder(level, transport);
    builder.parse_default_env();

    if builder.try_init().is_err() {
        log::warn!("a logger was already installed");
    }
}
