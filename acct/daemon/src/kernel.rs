//! Kernel release detection and program build selection
//!
//! The BPF program is compiled once per range of kernels whose conntrack
//! structures share a layout. At startup the running release is matched
//! against the table of builds and the newest compatible one is picked.

use std::{fmt, fs, path::Path, str::FromStr, sync::LazyLock};

use log::debug;
use regex::Regex;

use crate::error::{Error, Result};

const OSRELEASE_PATH: &str = "/proc/sys/kernel/osrelease";

static RELEASE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,3}\.\d{1,3}(?:\.\d{1,3})?).*$").expect("release pattern is valid")
});

/// A `major.minor.patch` kernel version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KernelVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl KernelVersion {
    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }
}

impl FromStr for KernelVersion {
    type Err = Error;

    /// Parses `x.y` or `x.y.z`. Use [`normalize_release`] first on raw
    /// release strings.
    fn from_str(s: &str) -> Result<Self> {
        let unsupported = |reason: &str| Error::KernelUnsupported {
            release: s.to_string(),
            reason: reason.to_string(),
        };

        let parts = s
            .split('.')
            .map(|p| p.parse::<u16>())
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|_| unsupported("not a numeric version"))?;

        match parts.as_slice() {
            [major, minor] => Ok(Self::new(*major, *minor, 0)),
            [major, minor, patch] => Ok(Self::new(*major, *minor, *patch)),
            _ => Err(unsupported("expected major.minor[.patch]")),
        }
    }
}

impl fmt::Display for KernelVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Kind of kernel hook a program attaches to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    Kprobe,
    Kretprobe,
}

impl ProbeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeKind::Kprobe => "kprobe",
            ProbeKind::Kretprobe => "kretprobe",
        }
    }
}

/// A k(ret)probe the program needs attached
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelProbe {
    pub kind: ProbeKind,
    /// Kernel function the probe attaches to
    pub symbol: &'static str,
}

impl KernelProbe {
    pub const fn kprobe(symbol: &'static str) -> Self {
        Self {
            kind: ProbeKind::Kprobe,
            symbol,
        }
    }

    pub const fn kretprobe(symbol: &'static str) -> Self {
        Self {
            kind: ProbeKind::Kretprobe,
            symbol,
        }
    }

    /// Name of the program inside the object file, e.g. `kprobe____nf_ct_refresh_acct`
    pub fn program_name(&self) -> String {
        format!("{}__{}", self.kind.as_str(), self.symbol)
    }
}

impl fmt::Display for KernelProbe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind.as_str(), self.symbol)
    }
}

/// Probes of the accounting program, in attach order
pub const ACCT_PROBES: &[KernelProbe] = &[
    KernelProbe::kprobe("__nf_ct_refresh_acct"),
    KernelProbe::kretprobe("__nf_ct_refresh_acct"),
    KernelProbe::kprobe("nf_conntrack_free"),
];

/// A program build and the kernel it targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kernel {
    /// Oldest kernel the build is compatible with
    pub version: KernelVersion,
    pub probes: &'static [KernelProbe],
}

impl Kernel {
    /// File name of this build's object
    pub fn object_name(&self) -> String {
        format!("acct_{}.o", self.version)
    }

    /// Read this build's object from `dir`.
    pub fn read_object(&self, dir: &Path) -> Result<Vec<u8>> {
        let path = dir.join(self.object_name());
        debug!("reading BPF object {}", path.display());
        fs::read(&path).map_err(|e| Error::LoadFailed {
            version: self.version.to_string(),
            source: format!("reading {}: {}", path.display(), e).into(),
        })
    }
}

/// Available program builds, oldest first
pub const KERNELS: &[Kernel] = &[
    Kernel {
        version: KernelVersion::new(4, 9, 0),
        probes: ACCT_PROBES,
    },
    Kernel {
        version: KernelVersion::new(4, 10, 0),
        probes: ACCT_PROBES,
    },
    Kernel {
        version: KernelVersion::new(4, 14, 0),
        probes: ACCT_PROBES,
    },
    Kernel {
        version: KernelVersion::new(4, 17, 0),
        probes: ACCT_PROBES,
    },
    Kernel {
        version: KernelVersion::new(5, 0, 0),
        probes: ACCT_PROBES,
    },
];

/// Extract the significant `x.y(.z)` portion of a kernel release string.
///
/// Some distributions ship releases that are not valid versions, e.g.
/// `4.20.3-200.fc29.x86_64`.
pub fn normalize_release(release: &str) -> Option<String> {
    RELEASE_RE
        .captures(release.trim())
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// Normalized release of the running kernel
pub fn running_release() -> Result<String> {
    let raw = fs::read_to_string(OSRELEASE_PATH)?;
    normalize_release(&raw).ok_or_else(|| Error::KernelUnsupported {
        release: raw.trim().to_string(),
        reason: "unable to parse kernel release".to_string(),
    })
}

/// Select the newest program build compatible with `release`.
pub fn select(release: &str) -> Result<Kernel> {
    let version: KernelVersion = release.parse()?;

    KERNELS
        .iter()
        .filter(|k| k.version <= version)
        .max_by_key(|k| k.version)
        .cloned()
        .ok_or_else(|| Error::KernelUnsupported {
            release: release.to_string(),
            reason: format!(
                "oldest supported kernel is {}",
                KERNELS.first().map(|k| k.version.to_string()).unwrap_or_default()
            ),
        })
}
