use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Json, Serialized, Toml},
    Figment,
};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::node::{ClientOptions, Credentials};
use crate::retry::RetryPolicy;
use crate::types::{Node, NodeId};

#[derive(Clone, Deserialize, Serialize)]
pub struct Config {
    /// Operator login shared by every node.
    pub email: String,
    pub hosts_file: PathBuf,
    pub bridges_file: PathBuf,
    pub incidents_file: PathBuf,
    /// Default for the execute flag of scheduled passes.
    pub execute: bool,
    pub suppress_notifications: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slack_webhook: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pagerduty_routing_key: Option<String>,
    pub session_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub accept_invalid_certs: bool,
    pub retry: RetryPolicy,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("email", &self.email)
            .field("hosts_file", &self.hosts_file)
            .field("bridges_file", &self.bridges_file)
            .field("incidents_file", &self.incidents_file)
            .field("execute", &self.execute)
            .field("suppress_notifications", &self.suppress_notifications)
            .field("slack_webhook", &self.slack_webhook.as_ref().map(|_| "<set>"))
            .field(
                "pagerduty_routing_key",
                &self.pagerduty_routing_key.as_ref().map(|_| "<set>"),
            )
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("request_timeout_secs", &self.request_timeout_secs)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .field("retry", &self.retry)
            .finish()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            email: String::new(),
            hosts_file: "cl_hosts.json".into(),
            bridges_file: "cl_bridges.json".into(),
            incidents_file: "open_incidents.json".into(),
            execute: false,
            suppress_notifications: false,
            slack_webhook: None,
            pagerduty_routing_key: None,
            session_ttl_secs: 15 * 60,
            request_timeout_secs: 30,
            accept_invalid_certs: false,
            retry: RetryPolicy::default(),
        }
    }
}

impl Config {
    /// Defaults, then `jobkeeper.toml`, `jobkeeper.json`, `JOBKEEPER_*`
    /// environment variables, then `extra` if given.
    pub fn load(extra: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file("jobkeeper.toml"))
            .merge(Json::file("jobkeeper.json"))
            .merge(Env::prefixed("JOBKEEPER_").split("__"));

        if let Some(path) = extra {
            figment = match path.extension().and_then(|e| e.to_str()) {
                Some("json") => figment.merge(Json::file(path)),
                _ => figment.merge(Toml::file(path)),
            };
        }

        let mut config: Config = figment
            .extract()
            .map_err(|e| anyhow::anyhow!("Failed to load configuration: {}", e))?;

        // Plain EMAIL is what existing deployments export.
        if config.email.is_empty() {
            if let Ok(email) = std::env::var("EMAIL") {
                config.email = email;
            }
        }

        Ok(config)
    }

    pub fn client_options(&self) -> ClientOptions {
        ClientOptions {
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            session_ttl: Duration::from_secs(self.session_ttl_secs),
            accept_invalid_certs: self.accept_invalid_certs,
            retry: self.retry.clone(),
        }
    }

    /// Credentials for `node`, looked up in the process environment.
    pub fn credentials(&self, node: &Node) -> Result<Credentials> {
        self.credentials_from(node, |key| std::env::var(key).ok())
    }

    /// Password for credential index `N` comes from `PASSWORD_N`, or from the
    /// file named by `PASSWORD_N_FILE`.
    pub fn credentials_from<F>(&self, node: &Node, lookup: F) -> Result<Credentials>
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.email.is_empty() {
            return Err(Error::Config("operator email is not configured".into()));
        }
        let key = format!("PASSWORD_{}", node.credential_index);
        let password = match lookup(&key) {
            Some(p) if !p.is_empty() => p,
            _ => match lookup(&format!("{key}_FILE")) {
                Some(file) => std::fs::read_to_string(&file)
                    .map_err(|e| Error::Authentication {
                        node: node.id.to_string(),
                        reason: format!("cannot read {key}_FILE: {e}"),
                    })?
                    .trim()
                    .to_string(),
                None => {
                    return Err(Error::Authentication {
                        node: node.id.to_string(),
                        reason: format!("missing {key}"),
                    })
                }
            },
        };
        Ok(Credentials::new(self.email.clone(), password))
    }
}

#[derive(Debug, Clone, Deserialize)]
struct HostEntry {
    url: String,
    password: serde_json::Value,
    #[serde(default)]
    bridge_group: Option<String>,
    #[serde(default)]
    bridge_groups: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct HostsFile {
    #[serde(default)]
    services: BTreeMap<String, BTreeMap<String, HostEntry>>,
}

/// Every configured node, in a stable service/network order.
#[derive(Debug, Clone, Default)]
pub struct NodeDirectory {
    nodes: Vec<Node>,
}

impl NodeDirectory {
    pub fn parse(json: &str) -> Result<Self> {
        let file: HostsFile = serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid node directory: {e}")))?;

        let mut nodes = Vec::new();
        for (service, networks) in file.services {
            for (network, entry) in networks {
                let credential_index = match entry.password {
                    serde_json::Value::String(s) => s,
                    other => other.to_string(),
                };
                let bridge_groups = match (entry.bridge_groups, entry.bridge_group) {
                    (Some(groups), _) => groups,
                    (None, Some(group)) => vec![group],
                    (None, None) => Vec::new(),
                };
                nodes.push(Node {
                    id: NodeId::new(&service, &network),
                    url: entry.url.trim_end_matches('/').to_string(),
                    credential_index,
                    bridge_groups,
                });
            }
        }
        if nodes.is_empty() {
            warn!("Node directory lists no nodes");
        }
        Ok(Self { nodes })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        let directory = Self::parse(&text)?;
        info!("Loaded {} nodes from {}", directory.nodes.len(), path.display());
        Ok(directory)
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Case-insensitive lookup by service and network name.
    pub fn find(&self, service: &str, network: &str) -> Result<&Node> {
        let id = NodeId::new(service, network);
        self.nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or_else(|| Error::Config(format!("node {id} not found in node directory")))
    }
}

/// Bridge definitions keyed by group, then bridge name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BridgeDirectory {
    #[serde(default)]
    bridges: BTreeMap<String, BTreeMap<String, String>>,
}

impl BridgeDirectory {
    pub fn parse(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| Error::Config(format!("invalid bridge directory: {e}")))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::parse(&text)
    }

    pub fn group(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.bridges.get(name)
    }

    pub fn insert(&mut self, group: &str, name: &str, url: &str) {
        self.bridges
            .entry(group.to_string())
            .or_default()
            .insert(name.to_string(), url.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const HOSTS: &str = r#"{
        "services": {
            "ocr": {
                "ethereum": {
                    "url": "https://eth.example:6688/",
                    "password": 1,
                    "bridge_groups": ["common", "eth"]
                },
                "arbitrum": {
                    "url": "https://arb.example:6688",
                    "password": "2",
                    "bridge_group": "common"
                }
            },
            "bootstrap": {
                "base": { "url": "https://base.example:6688", "password": 3 }
            }
        }
    }"#;

    fn node(index: &str) -> Node {
        Node {
            id: NodeId::new("ocr", "ethereum"),
            url: "https://eth.example".into(),
            credential_index: index.into(),
            bridge_groups: vec![],
        }
    }

    #[test]
    fn parses_node_directory() {
        let dir = NodeDirectory::parse(HOSTS).unwrap();
        assert_eq!(dir.nodes().len(), 3);

        let eth = dir.find("OCR", "Ethereum").unwrap();
        assert_eq!(eth.url, "https://eth.example:6688");
        assert_eq!(eth.credential_index, "1");
        assert_eq!(eth.bridge_groups, vec!["common".to_string(), "eth".to_string()]);

        let arb = dir.find("ocr", "arbitrum").unwrap();
        assert_eq!(arb.bridge_groups, vec!["common".to_string()]);

        let base = dir.find("bootstrap", "base").unwrap();
        assert!(base.bridge_groups.is_empty());

        assert!(matches!(dir.find("ocr", "polygon"), Err(Error::Config(_))));
    }

    #[test]
    fn parses_bridge_directory() {
        let dir = BridgeDirectory::parse(
            r#"{"bridges": {
                "common": {"coingecko": "http://cg:8080"},
                "eth": {"coingecko": "http://cg-eth:8080"}
            }}"#,
        )
        .unwrap();
        assert_eq!(dir.group("common").unwrap()["coingecko"], "http://cg:8080");
        assert_eq!(dir.group("eth").unwrap()["coingecko"], "http://cg-eth:8080");
        assert!(dir.group("missing").is_none());
    }

    #[test]
    fn password_from_env_or_file() {
        let config = Config {
            email: "ops@example.com".into(),
            ..Config::default()
        };

        let env: HashMap<&str, String> = HashMap::from([("PASSWORD_1", "hunter2".to_string())]);
        let creds = config
            .credentials_from(&node("1"), |k| env.get(k).cloned())
            .unwrap();
        assert_eq!(creds.password, "hunter2");

        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut file, b"from-file\n").unwrap();
        let path = file.path().to_string_lossy().to_string();
        let env: HashMap<&str, String> = HashMap::from([("PASSWORD_2_FILE", path)]);
        let creds = config
            .credentials_from(&node("2"), |k| env.get(k).cloned())
            .unwrap();
        assert_eq!(creds.password, "from-file");

        let missing = config.credentials_from(&node("9"), |_| None);
        assert!(matches!(missing, Err(Error::Authentication { .. })));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let config = Config {
            slack_webhook: Some("https://hooks.slack.com/services/T/B/secret".into()),
            ..Config::default()
        };
        let rendered = format!("{config:?}");
        assert!(!rendered.contains("secret"));
    }
}
