//! The endpoint record and the API used to manipulate it.
//!
//! The record mirrors the cluster's `Endpoints` shape closely enough to be
//! written through the plain REST surface. Leader election itself is an
//! external concern; this module only reads and writes the record.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors talking to the endpoints API.
#[derive(Debug, Error)]
pub enum SteeringError {
    /// The record does not exist.
    #[error("endpoints record not found")]
    NotFound,

    /// A precondition (uid or resource version) did not hold.
    #[error("endpoints record changed concurrently")]
    Conflict,

    /// The API answered with an unexpected status.
    #[error("endpoints api reported HTTP status {status}: {message}")]
    Api { status: u16, message: String },

    /// Transport-level failure.
    #[error("endpoints api request: {0}")]
    Transport(#[from] reqwest::Error),

    /// The leadership term ended.
    #[error("leadership term ended")]
    Cancelled,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub resource_version: String,
    #[serde(default, skip_serializing_if = "std::collections::BTreeMap::is_empty")]
    pub labels: std::collections::BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointAddress {
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPort {
    pub port: u16,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointSubset {
    #[serde(default)]
    pub addresses: Vec<EndpointAddress>,
    #[serde(default)]
    pub ports: Vec<EndpointPort>,
}

/// A single-name address record steering client traffic.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointsRecord {
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub subsets: Vec<EndpointSubset>,
}

impl EndpointsRecord {
    /// An empty record with just the identifying metadata.
    pub fn named(namespace: &str, name: &str) -> Self {
        Self {
            metadata: ObjectMeta {
                name: name.to_owned(),
                namespace: namespace.to_owned(),
                ..Default::default()
            },
            subsets: Vec::new(),
        }
    }

    /// Whether the record's single subset points at `ip:port`.
    pub fn points_at(&self, ip: &str, port: u16) -> bool {
        self.subsets.len() == 1
            && self.subsets[0].addresses.iter().any(|a| a.ip == ip)
            && self.subsets[0].ports.iter().any(|p| p.port == port)
    }
}

/// Uid and resource version observed on the last successful write. Deletion
/// with these preconditions never removes a record that has since been taken
/// over by another replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Preconditions {
    pub uid: String,
    pub resource_version: String,
}

/// Access to the cluster's endpoint records. Reads must bypass any client
/// cache.
#[async_trait]
pub trait EndpointsApi: Send + Sync {
    /// Fetches the record, or `None` if it does not exist.
    async fn get(&self, namespace: &str, name: &str)
        -> Result<Option<EndpointsRecord>, SteeringError>;

    /// Creates or replaces the record, returning the server's view of it
    /// (uid and resource version populated).
    async fn update(&self, record: &EndpointsRecord) -> Result<EndpointsRecord, SteeringError>;

    /// Deletes the record iff the preconditions hold.
    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), SteeringError>;
}

/// Endpoints access through the cluster's plain REST surface.
pub struct HttpEndpointsApi {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl HttpEndpointsApi {
    /// `base_url` is the API server root, e.g. `https://10.0.0.1:443`.
    pub fn new(base_url: &str, token: &str) -> Result<Self, SteeringError> {
        let client = reqwest::Client::builder().use_rustls_tls().build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            token: token.to_owned(),
            client,
        })
    }

    fn record_url(&self, namespace: &str, name: &str) -> String {
        format!(
            "{}/api/v1/namespaces/{}/endpoints/{}",
            self.base_url, namespace, name
        )
    }

    async fn classify(response: reqwest::Response) -> SteeringError {
        let status = response.status().as_u16();
        match status {
            404 => SteeringError::NotFound,
            409 | 412 | 422 => SteeringError::Conflict,
            _ => SteeringError::Api {
                status,
                message: response.text().await.unwrap_or_default(),
            },
        }
    }
}

#[async_trait]
impl EndpointsApi for HttpEndpointsApi {
    async fn get(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<EndpointsRecord>, SteeringError> {
        let response = self
            .client
            .get(self.record_url(namespace, name))
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Ok(Some(response.json().await?))
    }

    async fn update(&self, record: &EndpointsRecord) -> Result<EndpointsRecord, SteeringError> {
        let url = self.record_url(&record.metadata.namespace, &record.metadata.name);

        // PUT replaces an existing record; a missing one is created instead.
        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.token)
            .json(record)
            .send()
            .await?;
        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        if response.status().as_u16() != 404 {
            return Err(Self::classify(response).await);
        }

        let collection_url = format!(
            "{}/api/v1/namespaces/{}/endpoints",
            self.base_url, record.metadata.namespace
        );
        let response = self
            .client
            .post(collection_url)
            .bearer_auth(&self.token)
            .json(record)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Ok(response.json().await?)
    }

    async fn delete(
        &self,
        namespace: &str,
        name: &str,
        preconditions: &Preconditions,
    ) -> Result<(), SteeringError> {
        let body = serde_json::json!({
            "preconditions": {
                "uid": preconditions.uid,
                "resourceVersion": preconditions.resource_version,
            }
        });
        let response = self
            .client
            .delete(self.record_url(namespace, name))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::classify(response).await);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serializes_in_cluster_shape() {
        let mut record = EndpointsRecord::named("shoot--a", "ratewatch");
        record
            .metadata
            .labels
            .insert("app".into(), "ratewatch".into());
        record.subsets = vec![EndpointSubset {
            addresses: vec![EndpointAddress {
                ip: "1.2.3.4".into(),
            }],
            ports: vec![EndpointPort {
                port: 777,
                protocol: "TCP".into(),
            }],
        }];

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["metadata"]["name"], "ratewatch");
        assert_eq!(json["metadata"]["namespace"], "shoot--a");
        assert_eq!(json["metadata"]["labels"]["app"], "ratewatch");
        assert_eq!(json["subsets"][0]["addresses"][0]["ip"], "1.2.3.4");
        assert_eq!(json["subsets"][0]["ports"][0]["port"], 777);
        assert_eq!(json["subsets"][0]["ports"][0]["protocol"], "TCP");
        // Unset server-side fields stay off the wire.
        assert!(json["metadata"].get("uid").is_none());
        assert!(json["metadata"].get("resourceVersion").is_none());
    }

    #[test]
    fn record_deserializes_with_server_fields() {
        let json = r#"{
            "metadata": {
                "name": "ratewatch",
                "namespace": "shoot--a",
                "uid": "u-1",
                "resourceVersion": "42"
            },
            "subsets": [
                {"addresses": [{"ip": "1.2.3.4"}], "ports": [{"port": 777, "protocol": "TCP"}]}
            ]
        }"#;
        let record: EndpointsRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.metadata.uid, "u-1");
        assert_eq!(record.metadata.resource_version, "42");
        assert!(record.points_at("1.2.3.4", 777));
        assert!(!record.points_at("1.2.3.4", 778));
        assert!(!record.points_at("1.1.1.1", 777));
    }

    #[test]
    fn points_at_requires_a_single_subset() {
        let mut record = EndpointsRecord::named("ns", "ratewatch");
        assert!(!record.points_at("1.2.3.4", 777));

        let subset = EndpointSubset {
            addresses: vec![EndpointAddress {
                ip: "1.2.3.4".into(),
            }],
            ports: vec![EndpointPort {
                port: 777,
                protocol: "TCP".into(),
            }],
        };
        record.subsets = vec![subset.clone(), subset];
        assert!(!record.points_at("1.2.3.4", 777));
    }
}
