//! IP geolocation lookup
//!
//! IPv4 goes to the qqwry mirror, IPv6 to ip-api.com.

use reqwest::Client;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;

use super::{ApiError, build_client, check_status};

pub const DEFAULT_V4_BASE_URL: &str = "https://api.i-meto.com/ip/v1/qqwry";
pub const DEFAULT_V6_BASE_URL: &str = "http://ip-api.com/json";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IpInfo {
    pub ip: String,
    pub country: String,
    pub region: String,
    pub city: String,
    pub isp: String,
    pub owner: String,
    pub range: Option<(String, String)>,
}

impl IpInfo {
    /// Multi-line summary for a chat reply
    pub fn summary(&self) -> String {
        let location = [&self.country, &self.region, &self.city]
            .into_iter()
            .filter(|s| !s.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" - ");
        let or_na = |s: &str| if s.is_empty() { "N/A".to_string() } else { s.to_string() };

        let mut out = format!(
            "IP: {}\nLocation: {}\nISP: {}\nOrganization: {}",
            self.ip,
            or_na(&location),
            or_na(&self.isp),
            or_na(&self.owner)
        );
        if let Some((from, to)) = &self.range {
            out.push_str(&format!("\nRange: {} - {}", from, to));
        }
        out
    }
}

#[derive(Debug, Deserialize)]
struct QqwryRange {
    from: String,
    to: String,
}

#[derive(Debug, Deserialize)]
struct QqwryResponse {
    ip: String,
    #[serde(default)]
    country_name: String,
    #[serde(default)]
    region_name: String,
    #[serde(default)]
    city_name: String,
    #[serde(default)]
    owner_domain: String,
    #[serde(default)]
    isp_domain: String,
    #[serde(default)]
    range: Option<QqwryRange>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpApiResponse {
    query: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    region_name: String,
    #[serde(default)]
    city: String,
    #[serde(default)]
    org: String,
    #[serde(default, rename = "as")]
    autonomous_system: String,
}

#[derive(Debug, Clone)]
pub struct IpLookup {
    client: Client,
    v4_base_url: String,
    v6_base_url: String,
}

impl IpLookup {
    pub fn new() -> Result<Self, ApiError> {
        Self::with_base_urls(DEFAULT_V4_BASE_URL, DEFAULT_V6_BASE_URL)
    }

    pub fn with_base_urls(v4: impl Into<String>, v6: impl Into<String>) -> Result<Self, ApiError> {
        Ok(Self {
            client: build_client(Duration::from_secs(10))?,
            v4_base_url: v4.into().trim_end_matches('/').to_string(),
            v6_base_url: v6.into().trim_end_matches('/').to_string(),
        })
    }

    /// Look up an address. The caller is expected to have validated it with
    /// [`IpAddr`] parsing; the address family selects the upstream.
    pub async fn lookup(&self, ip: IpAddr) -> Result<IpInfo, ApiError> {
        match ip {
            IpAddr::V4(v4) => {
                let url = format!("{}/{}", self.v4_base_url, v4);
                let data: QqwryResponse = check_status(self.client.get(&url).send().await?)?
                    .json()
                    .await?;
                Ok(IpInfo {
                    ip: data.ip,
                    country: data.country_name,
                    region: data.region_name,
                    city: data.city_name,
                    isp: data.isp_domain,
                    owner: data.owner_domain,
                    range: data.range.map(|r| (r.from, r.to)),
                })
            }
            IpAddr::V6(v6) => {
                let url = format!("{}/{}", self.v6_base_url, v6);
                let data: IpApiResponse = check_status(self.client.get(&url).send().await?)?
                    .json()
                    .await?;
                Ok(IpInfo {
                    ip: data.query,
                    country: data.country,
                    region: data.region_name,
                    city: data.city,
                    isp: data.autonomous_system,
                    owner: data.org,
                    range: None,
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_lookup_v4() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v4/1.1.1.1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ip": "1.1.1.1",
                "country_name": "Australia",
                "region_name": "",
                "city_name": "",
                "owner_domain": "cloudflare.com",
                "isp_domain": "APNIC",
                "range": {"from": "1.1.1.0", "to": "1.1.1.255"},
            })))
            .mount(&server)
            .await;

        let lookup =
            IpLookup::with_base_urls(format!("{}/v4", server.uri()), format!("{}/v6", server.uri()))
                .unwrap();
        let info = lookup.lookup("1.1.1.1".parse().unwrap()).await.unwrap();
        let summary = info.summary();
        assert!(summary.contains("Location: Australia\n"));
        assert!(summary.contains("Organization: cloudflare.com"));
        assert!(summary.ends_with("Range: 1.1.1.0 - 1.1.1.255"));
    }

    #[tokio::test]
    async fn test_lookup_v6() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/v6/2001:4860:4860::8888"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "success",
                "query": "2001:4860:4860::8888",
                "country": "United States",
                "regionName": "California",
                "city": "Mountain View",
                "org": "Google LLC",
                "as": "AS15169 Google LLC",
            })))
            .mount(&server)
            .await;

        let lookup =
            IpLookup::with_base_urls(format!("{}/v4", server.uri()), format!("{}/v6", server.uri()))
                .unwrap();
        let info = lookup
            .lookup("2001:4860:4860::8888".parse().unwrap())
            .await
            .unwrap();
        assert_eq!(info.city, "Mountain View");
        assert_eq!(info.isp, "AS15169 Google LLC");
        assert!(info.range.is_none());
    }

    #[test]
    fn test_summary_without_location() {
        let info = IpInfo {
            ip: "10.0.0.1".into(),
            ..Default::default()
        };
        assert_eq!(
            info.summary(),
            "IP: 10.0.0.1\nLocation: N/A\nISP: N/A\nOrganization: N/A"
        );
    }
}
