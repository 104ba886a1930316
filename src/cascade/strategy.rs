use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Credential set handed to the extractor (a Netscape cookie jar)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    /// Name used in logs
    pub name: String,
    /// Cookie file passed to the extraction tool
    pub cookies_file: PathBuf,
}

/// Network egress override (proxy route)
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EgressRoute {
    /// Name used in logs
    pub name: String,
    /// Proxy URL, e.g. `socks5://10.0.0.2:1080`
    pub proxy_url: String,
}

/// One way of attempting an extraction
///
/// Strategies in a lower tier are always tried first. Within a tier the order
/// is shuffled per job so load spreads across credentials and routes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Strategy {
    /// Name used in logs and events
    pub name: String,

    /// Rank; lower tiers run first (default: 0)
    #[serde(default)]
    pub tier: u32,

    /// Credentials to present, if any
    #[serde(default)]
    pub credential: Option<Credential>,

    /// Egress route to use, if any
    #[serde(default)]
    pub egress: Option<EgressRoute>,

    /// Extra request headers (identifying header set)
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Strategy {
    /// No credentials, default route, no extra headers
    pub fn direct() -> Self {
        Self::named("direct")
    }

    /// Empty strategy with a name
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tier: 0,
            credential: None,
            egress: None,
            headers: BTreeMap::new(),
        }
    }

    /// Set the tier
    pub fn in_tier(mut self, tier: u32) -> Self {
        self.tier = tier;
        self
    }

    /// Present a cookie file
    pub fn with_credential(mut self, name: impl Into<String>, cookies_file: impl Into<PathBuf>) -> Self {
        self.credential = Some(Credential {
            name: name.into(),
            cookies_file: cookies_file.into(),
        });
        self
    }

    /// Route through a proxy
    pub fn with_egress(mut self, name: impl Into<String>, proxy_url: impl Into<String>) -> Self {
        self.egress = Some(EgressRoute {
            name: name.into(),
            proxy_url: proxy_url.into(),
        });
        self
    }

    /// Add a request header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Order strategies by tier, shuffling within each tier
pub fn order_strategies<R: Rng + ?Sized>(strategies: &[Strategy], rng: &mut R) -> Vec<Strategy> {
    let mut ordered = strategies.to_vec();
    ordered.sort_by_key(|s| s.tier);

    let mut start = 0;
    while start < ordered.len() {
        let tier = ordered[start].tier;
        let end = ordered[start..]
            .iter()
            .position(|s| s.tier != tier)
            .map_or(ordered.len(), |offset| start + offset);
        ordered[start..end].shuffle(rng);
        start = end;
    }
    ordered
}
