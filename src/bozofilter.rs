//! Sender filter for unwanted addresses.
//!
//! `bozofilter.txt` in the config directory lists one lowercase email
//! address per line; `#` starts a comment. Messages whose From address
//! matches are marked delivered without ever reaching the target, so
//! they cannot clog the retry ledger.

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;

use crate::error::Result;

pub fn bozofilter_path(config_dir: &Path) -> PathBuf {
    config_dir.join("bozofilter.txt")
}

#[derive(Debug, Default, Clone)]
pub struct Bozofilter {
    addresses: HashSet<String>,
}

impl Bozofilter {
    /// Load the filter file; a missing file yields an empty filter.
    pub fn load(config_dir: &Path) -> Self {
        let path = bozofilter_path(config_dir);
        let Ok(content) = fs::read_to_string(&path) else {
            return Self::default();
        };

        let mut addresses = HashSet::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = match line.split_once('#') {
                Some((addr, _)) => addr.trim(),
                None => line,
            };
            if !line.is_empty() {
                addresses.insert(line.to_lowercase());
            }
        }
        Self { addresses }
    }

    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(&address.to_lowercase())
    }

    /// Check a From header value against the filter.
    pub fn is_bozofied(&self, from_header: &str) -> bool {
        if self.addresses.is_empty() {
            return false;
        }
        match extract_email_address(from_header) {
            Some(addr) => self.addresses.contains(&addr),
            None => false,
        }
    }

    pub fn addresses(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(|s| s.as_str())
    }
}

/// Extract the bare address from a From header value, lowercased.
pub fn extract_email_address(from_header: &str) -> Option<String> {
    if from_header.is_empty() {
        return None;
    }
    let parsed = mailparse::addrparse(from_header).ok()?;
    for addr in parsed.iter() {
        match addr {
            mailparse::MailAddr::Single(info) => {
                return Some(info.addr.to_lowercase());
            }
            mailparse::MailAddr::Group(group) => {
                if let Some(info) = group.addrs.first() {
                    return Some(info.addr.to_lowercase());
                }
            }
        }
    }
    None
}

/// Create the filter file with explanatory comments if it is missing.
pub fn ensure_exists(config_dir: &Path) -> Result<PathBuf> {
    let path = bozofilter_path(config_dir);
    fs::create_dir_all(config_dir)?;
    if !path.exists() {
        fs::write(
            &path,
            "# Korgalore bozofilter - one email address per line\n\
             # Lines starting with # are comments\n\
             # Trailing comments after # are also supported\n\
             #\n\
             # Example:\n\
             # spammer@example.com # added on 2026-01-15, sends junk\n\
             \n",
        )?;
    }
    Ok(path)
}

/// Append addresses to the filter; returns how many were new.
pub fn add_addresses(
    config_dir: &Path,
    addresses: &[String],
    reason: Option<&str>,
) -> Result<usize> {
    let existing = Bozofilter::load(config_dir);
    let today = Utc::now().date_naive();

    let mut new_lines = Vec::new();
    for addr in addresses {
        let addr = addr.trim().to_lowercase();
        if addr.is_empty() {
            continue;
        }
        if existing.contains(&addr) {
            log::info!("address already in bozofilter: {}", addr);
            continue;
        }
        let comment = match reason {
            Some(reason) => format!("added on {}, {}", today, reason),
            None => format!("added on {}", today),
        };
        new_lines.push(format!("{} # {}\n", addr, comment));
    }

    if !new_lines.is_empty() {
        fs::create_dir_all(config_dir)?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(bozofilter_path(config_dir))?;
        for line in &new_lines {
            file.write_all(line.as_bytes())?;
        }
    }

    Ok(new_lines.len())
}
