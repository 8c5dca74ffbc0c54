//! Local node introspection.
//!
//! The probe talks to the node the agent sits next to over a direct
//! connection, so replica-set routing never redirects a query to another
//! member. Results are never cached; the poll cadences make repeat cost
//! negligible.

use crate::error::MetadataResult;
use crate::store::extract_cluster_time;
use bson::{doc, Document, Timestamp};
use mongodb::options::ClientOptions;
use mongodb::Client;
use serde::Deserialize;

/// Role and replication view of the local node.
#[derive(Clone, Debug)]
pub struct NodeInfo {
    /// Address the node knows itself by.
    pub me: String,
    /// Replica-set name; empty on standalone nodes.
    pub set_name: String,
    pub hosts: Vec<String>,
    pub is_primary: bool,
    /// Whether this node is a member of the config-server replica set.
    pub config_svr: bool,
    /// Timestamp of the last write visible to majority reads.
    pub last_write_majority: Option<Timestamp>,
    /// Node-observed cluster time.
    pub cluster_time: Option<Timestamp>,
}

/// Authenticated identity of the probe's own connection.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthInfo {
    #[serde(rename = "authenticatedUsers", default)]
    pub users: Vec<AuthUser>,
    #[serde(rename = "authenticatedUserRoles", default)]
    pub user_roles: Vec<AuthRole>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthUser {
    pub user: String,
    pub db: String,
}

#[derive(Clone, Debug, Deserialize)]
pub struct AuthRole {
    pub role: String,
    pub db: String,
}

/// Probe over a direct connection to the local node.
#[derive(Clone)]
pub struct NodeProbe {
    client: Client,
}

impl NodeProbe {
    /// Connect directly to the node at `uri`.
    pub async fn connect(uri: &str) -> MetadataResult<Self> {
        let mut opts = ClientOptions::parse(uri).await?;
        opts.direct_connection = Some(true);
        opts.app_name = Some("drover".to_string());
        let client = Client::with_options(opts)?;
        Ok(Self { client })
    }

    /// The direct client, for dump and oplog access.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Role, membership and write visibility of the local node.
    pub async fn info(&self) -> MetadataResult<NodeInfo> {
        let res = self
            .client
            .database("admin")
            .run_command(doc! { "isMaster": 1 })
            .await?;
        Ok(parse_node_info(&res))
    }

    /// Server version string, from `buildInfo`.
    pub async fn mongo_version(&self) -> MetadataResult<String> {
        let res = self
            .client
            .database("admin")
            .run_command(doc! { "buildInfo": 1 })
            .await?;
        Ok(res.get_str("version").unwrap_or_default().to_string())
    }

    /// Identity of this connection, so a restore can keep its own
    /// credential out of the user splice and avoid locking itself out.
    pub async fn current_user(&self) -> MetadataResult<AuthInfo> {
        let res = self
            .client
            .database("admin")
            .run_command(doc! { "connectionStatus": 1 })
            .await?;
        let auth = match res.get_document("authInfo") {
            Ok(doc) => bson::from_document(doc.clone())?,
            Err(_) => AuthInfo::default(),
        };
        Ok(auth)
    }
}

fn parse_node_info(res: &Document) -> NodeInfo {
    NodeInfo {
        me: res.get_str("me").unwrap_or_default().to_string(),
        set_name: res.get_str("setName").unwrap_or_default().to_string(),
        hosts: res
            .get_array("hosts")
            .map(|hosts| {
                hosts
                    .iter()
                    .filter_map(|h| h.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default(),
        is_primary: res.get_bool("ismaster").unwrap_or(false),
        config_svr: res.get_i32("configsvr").unwrap_or(0) == 2,
        last_write_majority: res
            .get_document("lastWrite")
            .and_then(|lw| lw.get_document("majorityOpTime"))
            .and_then(|op| op.get_timestamp("ts"))
            .ok(),
        cluster_time: extract_cluster_time(res),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_replica_set_primary() {
        let res = doc! {
            "ismaster": true,
            "me": "node-1:27017",
            "setName": "rs0",
            "hosts": ["node-1:27017", "node-2:27017"],
            "lastWrite": {
                "majorityOpTime": { "ts": Timestamp { time: 42, increment: 7 }, "t": 3i64 },
            },
            "ok": 1.0,
        };

        let info = parse_node_info(&res);
        assert!(info.is_primary);
        assert!(!info.config_svr);
        assert_eq!(info.set_name, "rs0");
        assert_eq!(info.hosts.len(), 2);
        assert_eq!(info.last_write_majority.unwrap().time, 42);
    }

    #[test]
    fn parses_config_server_secondary() {
        let res = doc! {
            "ismaster": false,
            "secondary": true,
            "setName": "cfg",
            "configsvr": 2,
            "ok": 1.0,
        };

        let info = parse_node_info(&res);
        assert!(!info.is_primary);
        assert!(info.config_svr);
        assert!(info.last_write_majority.is_none());
    }
}
