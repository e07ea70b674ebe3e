use anyhow::{Result, anyhow};
use url::Url;

const MAX_NAME_LENGTH: usize = 100;

/// Validate a target display name
pub fn validate_target_name(name: &str) -> Result<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(anyhow!("Name cannot be empty"));
    }
    if trimmed.chars().count() > MAX_NAME_LENGTH {
        return Err(anyhow!("Name too long (max {MAX_NAME_LENGTH} characters)"));
    }
    Ok(())
}

/// Validate an HTTP/HTTPS target URL and return it normalized
///
/// Private and loopback hosts are allowed: monitoring internal services is
/// the common case for a self-hosted monitor.
pub fn validate_target_url(target: &str) -> Result<Url> {
    let target = target.trim();
    if target.is_empty() {
        return Err(anyhow!("Target cannot be empty"));
    }

    let url = Url::parse(target).map_err(|e| {
        if target.contains("://") {
            anyhow!("Invalid URL: {e}")
        } else {
            anyhow!("URL must include scheme (http:// or https://)")
        }
    })?;

    match url.scheme() {
        "http" | "https" => {}
        other => return Err(anyhow!("Invalid scheme '{other}'. Must be http or https")),
    }

    if url.host_str().is_none_or(str::is_empty) {
        return Err(anyhow!("URL must have a valid host"));
    }

    if url.port() == Some(0) {
        return Err(anyhow!("Port 0 is not valid"));
    }

    Ok(url)
}
