//! Download-URL validation (SSRF shield) and source-host URL rewrites.
//!
//! A URL may only be fetched when its host is on the allow-list, is not a
//! cloud-metadata endpoint, and resolves (IPv4 only, to sidestep IPv6
//! loopback/link-local tricks and DNS rebinding) to strictly public addresses.

use std::net::{IpAddr, Ipv4Addr};

use reqwest::Url;

/// Known CDN and storage hosts, matched exactly or as a dotted suffix.
const ALLOWED_HOSTS: &[&str] = &[
    "r2.cloudflarestorage.com",
    "cloudflarestorage.com",
    "cloudflare.com",
    "amazonaws.com",
    "s3.amazonaws.com",
    "drive.google.com",
    "google.com",
    "googleapis.com",
    "dropbox.com",
    "dropboxusercontent.com",
];

/// Cloud metadata endpoints (hostnames and literal IPs) across providers.
const METADATA_HOSTS: &[&str] = &[
    "169.254.169.254",
    "metadata",
    "metadata.google.internal",
    "metadata.google.com",
    "instance-data.ec2.internal",
    "metadata.azure.com",
    "100.100.100.200",
];

const METADATA_IPS: [Ipv4Addr; 2] = [
    Ipv4Addr::new(169, 254, 169, 254),
    Ipv4Addr::new(100, 100, 100, 200),
];

pub(crate) struct SsrfGuard {
    allowed: Vec<String>,
}

impl SsrfGuard {
    /// Build the guard; `extra_hosts` adds deployment-specific hosts (the
    /// coordinator CDN domain) on top of the built-in allow-list.
    pub(crate) fn new(extra_hosts: impl IntoIterator<Item = String>) -> Self {
        let mut allowed: Vec<String> = ALLOWED_HOSTS.iter().map(|h| h.to_string()).collect();
        for host in extra_hosts {
            let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
            if !host.is_empty() && !allowed.contains(&host) {
                allowed.push(host);
            }
        }
        Self { allowed }
    }

    /// Full validation: scheme, metadata block, allow-list, IPv4 resolution.
    pub(crate) async fn validate(&self, raw: &str) -> bool {
        let Ok(url) = Url::parse(raw) else {
            return false;
        };
        if !matches!(url.scheme(), "http" | "https") {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        if host.is_empty() || host_is_metadata(&host) || !self.host_allowed(&host) {
            return false;
        }

        let addrs = resolve_ipv4(&host).await;
        if addrs.is_empty() {
            return false;
        }
        addrs.iter().all(|addr| !ipv4_blocked(*addr))
    }

    fn host_allowed(&self, host: &str) -> bool {
        self.allowed
            .iter()
            .any(|allowed| host == allowed || host.ends_with(&format!(".{allowed}")))
    }
}

fn host_is_metadata(host: &str) -> bool {
    METADATA_HOSTS
        .iter()
        .any(|meta| host == *meta || host.ends_with(&format!(".{meta}")))
}

/// Private, loopback, link-local, unroutable or metadata IPv4 addresses are
/// all off-limits for downloads.
fn ipv4_blocked(addr: Ipv4Addr) -> bool {
    addr.is_private()
        || addr.is_loopback()
        || addr.is_link_local()
        || addr.is_unspecified()
        || addr.is_broadcast()
        || METADATA_IPS.contains(&addr)
}

/// IPv4-only name resolution. An IPv6-only host yields an empty set and is
/// therefore rejected by the caller.
async fn resolve_ipv4(host: &str) -> Vec<Ipv4Addr> {
    match tokio::net::lookup_host((host, 443)).await {
        Ok(addrs) => addrs
            .filter_map(|addr| match addr.ip() {
                IpAddr::V4(v4) => Some(v4),
                IpAddr::V6(_) => None,
            })
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Rewrite share-page URLs into direct-download form. Google Drive file links
/// become `uc?export=download` URLs with a best-effort confirm token; Dropbox
/// links get `dl=1`. Anything else passes through untouched.
pub(crate) async fn transform_source_url(http: &reqwest::Client, raw: &str) -> String {
    let Ok(url) = Url::parse(raw) else {
        return raw.to_string();
    };
    let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
        return raw.to_string();
    };

    if host.contains("drive.google.com") {
        if let Some(file_id) = extract_drive_file_id(raw) {
            return drive_download_url(http, file_id, raw).await;
        }
    }
    if host.contains("dropbox.com") {
        return dropbox_transform(raw, url.query().unwrap_or_default());
    }
    raw.to_string()
}

async fn drive_download_url(http: &reqwest::Client, file_id: &str, original: &str) -> String {
    let base = format!("https://drive.google.com/uc?export=download&id={file_id}");
    let res = http
        .get(&base)
        .header(
            reqwest::header::USER_AGENT,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36",
        )
        .timeout(std::time::Duration::from_secs(30))
        .send()
        .await;
    let body = match res {
        Ok(res) if res.status().is_success() => res.text().await.unwrap_or_default(),
        Ok(res) => {
            tracing::warn!(status = %res.status(), "drive transform fetch rejected, using original URL");
            return original.to_string();
        }
        Err(err) => {
            tracing::warn!(error = %err, "drive transform fetch failed, using original URL");
            return original.to_string();
        }
    };
    let token = find_confirm_token(&body).unwrap_or("t");
    format!("{base}&confirm={token}")
}

fn dropbox_transform(raw: &str, query: &str) -> String {
    if query.contains("dl=0") {
        return raw.replace("dl=0", "dl=1");
    }
    if query.contains("dl=") {
        return raw.to_string();
    }
    let sep = if raw.contains('?') { '&' } else { '?' };
    format!("{raw}{sep}dl=1")
}

fn extract_drive_file_id(url: &str) -> Option<&str> {
    let start = url.find("/file/d/")? + "/file/d/".len();
    let rest = &url[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(rest.len());
    let id = &rest[..end];
    (!id.is_empty()).then_some(id)
}

fn find_confirm_token(body: &str) -> Option<&str> {
    let start = body.find("confirm=")? + "confirm=".len();
    let rest = &body[start..];
    let end = rest
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
        .unwrap_or(rest.len());
    let token = &rest[..end];
    (!token.is_empty()).then_some(token)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guard() -> SsrfGuard {
        SsrfGuard::new(["cdn.example.tr".to_string()])
    }

    #[test]
    fn allow_list_matches_exact_and_suffix() {
        let guard = guard();
        assert!(guard.host_allowed("drive.google.com"));
        assert!(guard.host_allowed("files.dropbox.com"));
        assert!(guard.host_allowed("cdn.example.tr"));
        assert!(!guard.host_allowed("evil-dropbox.com"));
        assert!(!guard.host_allowed("dropbox.com.evil.net"));
    }

    #[test]
    fn metadata_hosts_blocked() {
        assert!(host_is_metadata("metadata"));
        assert!(host_is_metadata("metadata.google.internal"));
        assert!(host_is_metadata("169.254.169.254"));
        assert!(host_is_metadata("100.100.100.200"));
        assert!(!host_is_metadata("metadata.example.com"));
    }

    #[test]
    fn blocked_address_ranges() {
        assert!(ipv4_blocked(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(ipv4_blocked(Ipv4Addr::new(192, 168, 1, 1)));
        assert!(ipv4_blocked(Ipv4Addr::new(172, 16, 0, 1)));
        assert!(ipv4_blocked(Ipv4Addr::new(127, 0, 0, 1)));
        assert!(ipv4_blocked(Ipv4Addr::new(169, 254, 169, 254)));
        assert!(ipv4_blocked(Ipv4Addr::new(100, 100, 100, 200)));
        assert!(!ipv4_blocked(Ipv4Addr::new(142, 250, 102, 100)));
    }

    #[tokio::test]
    async fn metadata_and_foreign_hosts_rejected_before_resolution() {
        let guard = guard();
        assert!(!guard.validate("http://169.254.169.254/latest/meta-data/").await);
        assert!(!guard.validate("https://metadata.google.internal/computeMetadata/").await);
        assert!(!guard.validate("https://attacker.example/file.mp4").await);
        assert!(!guard.validate("ftp://drive.google.com/file.mp4").await);
        assert!(!guard.validate("not a url").await);
    }

    #[test]
    fn dropbox_rewrites() {
        assert_eq!(
            dropbox_transform("https://www.dropbox.com/s/x/a.mp4?dl=0", "dl=0"),
            "https://www.dropbox.com/s/x/a.mp4?dl=1"
        );
        assert_eq!(
            dropbox_transform("https://www.dropbox.com/s/x/a.mp4?dl=1", "dl=1"),
            "https://www.dropbox.com/s/x/a.mp4?dl=1"
        );
        assert_eq!(
            dropbox_transform("https://www.dropbox.com/s/x/a.mp4", ""),
            "https://www.dropbox.com/s/x/a.mp4?dl=1"
        );
    }

    #[test]
    fn drive_file_id_extraction() {
        assert_eq!(
            extract_drive_file_id("https://drive.google.com/file/d/XYZ_9-a/view"),
            Some("XYZ_9-a")
        );
        assert_eq!(extract_drive_file_id("https://drive.google.com/open?id=X"), None);
        assert_eq!(extract_drive_file_id("https://drive.google.com/file/d/"), None);
    }

    #[test]
    fn confirm_token_extraction() {
        assert_eq!(find_confirm_token("…href=\"?confirm=AbC1-_x&amp;id=…\""), Some("AbC1-_x"));
        assert_eq!(find_confirm_token("no token here"), None);
    }
}
