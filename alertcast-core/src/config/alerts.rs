use std::path::PathBuf;
use std::time::Duration;

use url::Url;

/// Where the matcher reads active alert documents from.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum AlertSourceConfig {
    /// No store configured; scans always find nothing.
    #[default]
    Disabled,
    /// A JSON array of alert documents on disk, re-read on every scan.
    File { path: PathBuf },
    /// An HTTP endpoint returning a JSON array of alert documents.
    Http { url: Url, timeout: Duration },
}

