use crate::config::ResolverConfig;
use crate::error::Error;
use anyhow::Result;
use log::{info, warn};
use regex::RegexSet;
use std::time::Duration;
use tokio::process::Command;

/// Platform URLs that cannot be opened directly and need an external tool
/// to produce a concrete media URI.
const INDIRECT_PATTERNS: &[&str] = &[
    r"^https?://(www\.)?youtube\.com/watch\?",
    r"^https?://(www\.)?youtube\.com/live/",
    r"^https?://(www\.)?youtube\.com/shorts/",
    r"^https?://youtu\.be/",
    r"^https?://(www\.)?twitch\.tv/",
];

/// Decides whether a camera's configured source string is directly openable
/// or needs resolution through an external CLI (yt-dlp by default).
pub struct SourceResolver {
    config: ResolverConfig,
    patterns: RegexSet,
}

impl SourceResolver {
    pub fn new(config: ResolverConfig) -> Result<Self> {
        let mut patterns: Vec<String> = INDIRECT_PATTERNS.iter().map(|p| p.to_string()).collect();
        patterns.extend(config.extra_patterns.iter().cloned());

        let patterns = RegexSet::new(&patterns)
            .map_err(|e| Error::Config(format!("Invalid resolver pattern: {}", e)))?;

        Ok(Self { config, patterns })
    }

    /// True when the source string matches a known indirect-platform pattern.
    pub fn is_indirect(&self, source: &str) -> bool {
        self.patterns.is_match(source)
    }

    /// Resolve a camera's raw source string to an openable media URI.
    ///
    /// Direct sources pass through unchanged. Indirect platform URLs invoke
    /// the resolver tool once with a bounded timeout; failures are
    /// `Error::SourceUnresolvable` and are not retried, since they are
    /// usually non-transient credential or availability issues.
    pub async fn resolve(&self, source: &str) -> Result<String> {
        if !self.is_indirect(source) {
            return Ok(source.to_string());
        }

        info!("Resolving indirect source URL: {}", source);

        let output = tokio::time::timeout(
            Duration::from_secs(self.config.timeout_secs),
            Command::new(&self.config.command)
                .args(&self.config.args)
                .arg(source)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| {
            Error::SourceUnresolvable(format!(
                "Resolver timed out after {}s for {}",
                self.config.timeout_secs, source
            ))
        })?
        .map_err(|e| {
            Error::SourceUnresolvable(format!(
                "Failed to run resolver '{}': {}",
                self.config.command, e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!("Resolver exited with {}: {}", output.status, stderr.trim());
            return Err(Error::SourceUnresolvable(format!(
                "Resolver failed for {}: {}",
                source,
                stderr.trim()
            ))
            .into());
        }

        let uri = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();

        if uri.is_empty() {
            return Err(
                Error::SourceUnresolvable(format!("Resolver produced no URI for {}", source))
                    .into(),
            );
        }

        info!("Resolved {} to direct media URI", source);
        Ok(uri)
    }
}


#[cfg(test)]
impl ResolverConfig {
    fn default_for_tests() -> Self {
        toml::from_str("").unwrap()
    }
}
