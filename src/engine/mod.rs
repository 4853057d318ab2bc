pub mod config;

use std::ffi::OsString;
use std::path::Path;

/// Command-line arguments for `sing-box run`.
#[must_use]
pub fn run_args(config_path: &Path, work_dir: &Path) -> Vec<OsString> {
    vec![
        OsString::from("run"),
        OsString::from("-c"),
        config_path.as_os_str().to_owned(),
        OsString::from("-D"),
        work_dir.as_os_str().to_owned(),
    ]
}

/// Whether an engine log line reports a fatal condition.
#[must_use]
pub fn is_fatal_line(line: &str) -> bool {
    line.contains("FATAL") || line.contains("panic")
}
