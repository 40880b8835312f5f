//! Websocket relay: one remote shell plus chunked file transfer per connection

pub mod download;
pub mod server;
pub mod session;
pub mod upload;

pub use download::{DownloadPump, DownloadSignal, DownloadState, PumpConfig};
pub use server::{router, run_relay_server};
pub use session::RelaySession;
pub use upload::{UploadRegistry, UploadSession};

/// Resolves a client-supplied remote path.
///
/// A leading `~` maps to `home` and bare names land under `base_dir`. This is a
/// convenience for the browser UI; it does not confine paths.
pub fn remote_path(input: &str, home: &str, base_dir: &str) -> String {
    let input = input.trim();

    let expanded = if input == "~" {
        home.to_string()
    } else if let Some(rest) = input.strip_prefix("~/") {
        format!("{}/{}", home.trim_end_matches('/'), rest)
    } else {
        input.to_string()
    };

    if expanded.starts_with('/') {
        expanded
    } else {
        format!("{}/{}", base_dir.trim_end_matches('/'), expanded)
    }
}
