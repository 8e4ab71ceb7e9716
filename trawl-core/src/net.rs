//! Asset validation: domain syntax checks and the DNS/CIDR blacklist.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::info;

const RESOLVE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum NetError {
    #[error("reading {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse error on `{0}`")]
    InvalidCidr(String),
}

#[derive(Debug, Error)]
#[error("invalid domain: {0}")]
pub struct InvalidDomain(String);

/// Syntactic domain validation, label by label. An empty name passes (the
/// caller decides whether an empty asset is acceptable); anything longer
/// than 255 bytes, labels over 63 bytes, characters outside
/// `[A-Za-z0-9-]`, hyphens at label edges and digit-leading TLDs fail.
pub fn validate_domain(name: &str) -> Result<(), InvalidDomain> {
    if name.is_empty() {
        return Ok(());
    }
    if name.len() > 255 {
        return Err(InvalidDomain(format!(
            "name length is {}, can't exceed 255",
            name.len()
        )));
    }

    let bytes = name.as_bytes();
    let mut label_start = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        if b == b'.' {
            if i == label_start {
                return Err(InvalidDomain(format!("empty label at offset {i}")));
            }
            if i - label_start > 63 {
                return Err(InvalidDomain(format!(
                    "label `{}` exceeds 63 bytes",
                    &name[label_start..i]
                )));
            }
            if bytes[label_start] == b'-' {
                return Err(InvalidDomain(format!(
                    "label `{}` begins with a hyphen",
                    &name[label_start..i]
                )));
            }
            if bytes[i - 1] == b'-' {
                return Err(InvalidDomain(format!(
                    "label `{}` ends with a hyphen",
                    &name[label_start..i]
                )));
            }
            label_start = i + 1;
            continue;
        }
        if !(b.is_ascii_alphanumeric() || b == b'-') {
            return Err(InvalidDomain(format!(
                "invalid character at offset {i}"
            )));
        }
    }

    if label_start == bytes.len() {
        return Err(InvalidDomain(
            "missing top level domain, domain can't end with a period".to_string(),
        ));
    }
    let tld = &bytes[label_start..];
    if tld.len() > 63 {
        return Err(InvalidDomain(format!(
            "top level domain `{}` exceeds 63 bytes",
            &name[label_start..]
        )));
    }
    if tld[0] == b'-' || tld[tld.len() - 1] == b'-' {
        return Err(InvalidDomain(format!(
            "top level domain `{}` begins or ends with a hyphen",
            &name[label_start..]
        )));
    }
    if tld[0].is_ascii_digit() {
        return Err(InvalidDomain(format!(
            "top level domain `{}` begins with a digit",
            &name[label_start..]
        )));
    }

    Ok(())
}

/// An IPv4 network in CIDR notation.
#[derive(Debug, Clone, Copy)]
struct Cidr {
    network: u32,
    mask: u32,
}

impl Cidr {
    fn parse(raw: &str) -> Result<Self, NetError> {
        let (addr, prefix) = raw
            .split_once('/')
            .ok_or_else(|| NetError::InvalidCidr(raw.to_string()))?;
        let ip: Ipv4Addr = addr
            .parse()
            .map_err(|_| NetError::InvalidCidr(raw.to_string()))?;
        let prefix: u32 = prefix
            .parse()
            .map_err(|_| NetError::InvalidCidr(raw.to_string()))?;
        if prefix > 32 {
            return Err(NetError::InvalidCidr(raw.to_string()));
        }

        let mask = if prefix == 0 {
            0
        } else {
            u32::MAX << (32 - prefix)
        };
        Ok(Self {
            network: u32::from(ip) & mask,
            mask,
        })
    }

    fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask == self.network
    }
}

/// CIDR blocks that assets must never resolve to.
#[derive(Debug, Default)]
pub struct IpBlacklist {
    blocks: Vec<Cidr>,
}

impl IpBlacklist {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Loads a CIDR-per-line file. Blank lines and `#` comments are
    /// skipped; a malformed entry is fatal.
    pub fn load(path: &Path) -> Result<Self, NetError> {
        let raw = std::fs::read_to_string(path).map_err(|source| NetError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut blocks = Vec::new();
        for line in raw.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            blocks.push(Cidr::parse(line)?);
        }

        info!(networks = blocks.len(), "ip blacklist loaded");
        Ok(Self { blocks })
    }

    fn is_blocked(&self, ip: Ipv4Addr) -> bool {
        ip.is_loopback()
            || ip.is_link_local()
            || self.blocks.iter().any(|block| block.contains(ip))
    }

    /// Checks whether a hostname is safe to process. Resolution failure
    /// counts as valid: freshly discovered assets are often not
    /// resolvable from here, and the check only exists to keep loopback
    /// and internal ranges out of the executors.
    pub async fn is_valid_host(&self, host: &str) -> bool {
        if host.is_empty() {
            return true;
        }

        let lookup = tokio::net::lookup_host((host, 0u16));
        let addrs = match tokio::time::timeout(RESOLVE_TIMEOUT, lookup).await {
            Ok(Ok(addrs)) => addrs,
            _ => return true,
        };

        let first = addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(ip) => Some(ip),
                IpAddr::V6(_) => None,
            })
            .next();

        match first {
            Some(ip) => !self.is_blocked(ip),
            None => true,
        }
    }
}
