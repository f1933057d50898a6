use tracing_subscriber::EnvFilter;

const DEFAULT_FILTER: &str = "portledger=info,ledger_sqlite=info,socket_scan=info,port_inspect=info";
const VERBOSE_FILTER: &str = "portledger=debug,ledger_sqlite=debug,socket_scan=debug,port_inspect=debug";

/// Logs go to stderr so command output on stdout stays machine-readable.
/// `RUST_LOG` overrides the default filter.
pub fn init(verbose: bool) {
    let fallback = if verbose { VERBOSE_FILTER } else { DEFAULT_FILTER };
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| fallback.into()))
        .with_writer(std::io::stderr)
        .try_init();
}
