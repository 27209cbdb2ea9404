use crate::errors::ReportError;
use serde::Deserialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::time::Instant;
use url::Url;

/// Stable identifier issued by the store when a report is queued.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReportId(pub u64);

impl fmt::Display for ReportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tuple origin: scheme, host and port. `port` is `None` when it is the
/// scheme's default.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(try_from = "String")]
pub struct Origin {
    scheme: String,
    host: String,
    port: Option<u16>,
}

impl Origin {
    /// Returns `None` for URLs with an opaque origin (`data:`, `blob:` without
    /// an inner tuple origin, ...). `blob:` URLs take the origin of the URL
    /// they wrap.
    pub fn from_url(url: &Url) -> Option<Self> {
        match url.origin() {
            url::Origin::Opaque(_) => None,
            url::Origin::Tuple(scheme, host, port) => {
                let port = (default_port(&scheme) != Some(port)).then_some(port);
                Some(Origin {
                    scheme,
                    host: host.to_string(),
                    port,
                })
            }
        }
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The same origin with its host replaced, used to walk superdomains.
    pub fn with_host(&self, host: &str) -> Origin {
        Origin {
            scheme: self.scheme.clone(),
            host: host.to_owned(),
            port: self.port,
        }
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.port {
            Some(port) => write!(f, "{}://{}:{}", self.scheme, self.host, port),
            None => write!(f, "{}://{}", self.scheme, self.host),
        }
    }
}

impl FromStr for Origin {
    type Err = ReportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let url = Url::parse(s).map_err(|e| ReportError::InvalidUrl(format!("{s}: {e}")))?;
        Origin::from_url(&url).ok_or(ReportError::OpaqueOrigin(url))
    }
}

impl TryFrom<String> for Origin {
    type Error = ReportError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        "ftp" => Some(21),
        _ => None,
    }
}

/// Returns true if `subdomain` equals `superdomain` or is a subdomain of it.
pub fn is_subdomain_of(subdomain: &str, superdomain: &str) -> bool {
    if subdomain.eq_ignore_ascii_case(superdomain) {
        return true;
    }
    match subdomain.len().checked_sub(superdomain.len() + 1) {
        Some(dot) => {
            let bytes = subdomain.as_bytes();
            bytes[dot] == b'.' && bytes[dot + 1..].eq_ignore_ascii_case(superdomain.as_bytes())
        }
        None => false,
    }
}

/// Separates delivery state between browsing contexts. The empty key means
/// the report is not isolated.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
#[serde(transparent)]
pub struct IsolationKey(String);

impl IsolationKey {
    pub fn new<S: Into<String>>(key: S) -> Self {
        IsolationKey(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for IsolationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            write!(f, "<none>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Identifies a logical delivery configuration. The derived ordering sorts by
/// isolation key, then origin, then group name.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize)]
pub struct GroupKey {
    #[serde(default)]
    pub isolation_key: IsolationKey,
    pub origin: Origin,
    pub group: String,
}

impl GroupKey {
    pub fn new<G: Into<String>>(isolation_key: IsolationKey, origin: Origin, group: G) -> Self {
        GroupKey {
            isolation_key,
            origin,
            group: group.into(),
        }
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} ({})", self.origin, self.group, self.isolation_key)
    }
}

/// A report as handed to the store for queueing.
#[derive(Clone, Debug, Deserialize)]
pub struct NewReport {
    pub url: Url,
    #[serde(rename = "type")]
    pub report_type: String,
    #[serde(default = "default_group")]
    pub group: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default)]
    pub body: serde_json::Value,
    #[serde(default)]
    pub depth: u32,
    #[serde(default)]
    pub isolation_key: IsolationKey,
}

fn default_group() -> String {
    "default".into()
}

/// A queued report. The store owns the authoritative copy; everything else
/// works on snapshots identified by `id`.
#[derive(Clone, Debug)]
pub struct Report {
    pub id: ReportId,
    pub isolation_key: IsolationKey,
    pub origin: Origin,
    pub url: Url,
    pub report_type: String,
    pub group: String,
    pub user_agent: String,
    pub body: Arc<serde_json::Value>,
    pub queued: Instant,
    pub depth: u32,
    pub attempts: u32,
}

impl Report {
    pub fn from_new(id: ReportId, new: NewReport, queued: Instant) -> Result<Self, ReportError> {
        let origin = Origin::from_url(&new.url)
            .ok_or_else(|| ReportError::OpaqueOrigin(new.url.clone()))?;
        Ok(Report {
            id,
            isolation_key: new.isolation_key,
            origin,
            url: new.url,
            report_type: new.report_type,
            group: new.group,
            user_agent: new.user_agent,
            body: Arc::new(new.body),
            queued,
            depth: new.depth,
            attempts: 0,
        })
    }

    pub fn group_key(&self) -> GroupKey {
        GroupKey::new(self.isolation_key.clone(), self.origin.clone(), self.group.clone())
    }

    /// Orders reports the same way `GroupKey` orders, without cloning keys.
    pub fn cmp_group_key(&self, other: &Report) -> std::cmp::Ordering {
        (&self.isolation_key, &self.origin, &self.group).cmp(&(
            &other.isolation_key,
            &other.origin,
            &other.group,
        ))
    }

    pub fn same_group_key(&self, other: &Report) -> bool {
        self.cmp_group_key(other).is_eq()
    }
}

/// One configured delivery target within an endpoint group.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EndpointInfo {
    pub url: Url,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_priority() -> u32 {
    1
}

fn default_weight() -> u32 {
    1
}

/// Endpoint configuration for one group key.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct EndpointGroup {
    #[serde(flatten)]
    pub key: GroupKey,
    #[serde(default)]
    pub include_subdomains: bool,
    pub endpoints: Vec<EndpointInfo>,
}

/// An endpoint resolved for delivery. `group_key` is the key of the
/// configuration the endpoint came from, which may be a superdomain of the
/// reports' origin.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    pub group_key: GroupKey,
    pub url: Url,
    pub priority: u32,
    pub weight: u32,
}

impl Endpoint {
    pub fn new(group_key: GroupKey, info: &EndpointInfo) -> Self {
        Endpoint {
            group_key,
            url: info.url.clone(),
            priority: info.priority,
            weight: info.weight,
        }
    }
}
