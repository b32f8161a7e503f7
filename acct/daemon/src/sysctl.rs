//! Conntrack sysctl lookups
//!
//! Reads `net.netfilter.*` values through `/proc/sys` to advise on settings
//! that affect accounting.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::warn;

use crate::error::Result;

const NETFILTER_DIR: &str = "/proc/sys/net/netfilter";

/// Read a `net.netfilter` sysctl, e.g. `nf_conntrack_acct`.
pub fn netfilter(name: &str) -> Result<String> {
    read(Path::new(NETFILTER_DIR), name)
}

fn read(dir: &Path, name: &str) -> Result<String> {
    let path: PathBuf = dir.join(name);
    Ok(fs::read_to_string(path)?.trim().to_string())
}

/// Whether the kernel is counting packets and bytes per connection.
///
/// `None` when the sysctl can't be read, e.g. the conntrack module is not
/// loaded yet.
pub fn acct_enabled() -> Option<bool> {
    netfilter("nf_conntrack_acct").ok().map(|v| v != "0")
}

/// Warn that destroy events of TCP flows are delayed by TIME_WAIT.
pub fn warn_destroy_timeouts() {
    match netfilter("nf_conntrack_tcp_timeout_time_wait") {
        Ok(timeout) => warn!(
            "Destroy events of TCP connections arrive after the conntrack TIME_WAIT \
             timeout (net.netfilter.nf_conntrack_tcp_timeout_time_wait = {}s). \
             Lower it for more timely destroy events.",
            timeout
        ),
        Err(e) => warn!(
            "Destroy events of TCP connections are delayed by the conntrack TIME_WAIT \
             timeout, which could not be read: {}",
            e
        ),
    }
}
