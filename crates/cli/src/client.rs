//! API client for the prognostics agent query endpoints

use anyhow::{Context, Result};
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use url::Url;

/// API client for the prognostics agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid API URL")?;

        Ok(Self { client, base_url })
    }

    /// Make a GET request
    ///
    /// Each path segment is percent-encoded on its own, so ids may contain
    /// `/`, `?` or `#`. `query` pairs with a `None` value are omitted.
    pub async fn get<T: DeserializeOwned>(
        &self,
        segments: &[&str],
        query: &[(&str, Option<String>)],
    ) -> Result<T> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| anyhow::anyhow!("API URL cannot carry a path: {}", self.base_url))?
            .pop_if_empty()
            .extend(segments);
        {
            let mut pairs = url.query_pairs_mut();
            for (key, value) in query {
                if let Some(value) = value {
                    pairs.append_pair(key, value);
                }
            }
        }
        if url.query() == Some("") {
            url.set_query(None);
        }

        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorResponse>(&body)
                .map(|e| e.error)
                .unwrap_or(body);
            anyhow::bail!("API error ({}): {}", status, message);
        }

        response.json().await.context("Failed to parse response")
    }

    pub async fn asset_health(&self, asset: &str) -> Result<AssetHealth> {
        self.get(&["v1", "assets", asset, "health"], &[]).await
    }

    pub async fn alerts(&self, since: Option<i64>) -> Result<Vec<AlertTransition>> {
        self.get(&["v1", "alerts"], &[("since", since.map(|s| s.to_string()))])
            .await
    }

    pub async fn tasks(
        &self,
        asset: Option<String>,
        status: Option<String>,
    ) -> Result<Vec<MaintenanceTask>> {
        self.get(&["v1", "tasks"], &[("asset", asset), ("status", status)])
            .await
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentView {
    pub component: String,
    pub level: String,
    pub entered_at: i64,
    pub health: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_rul_hours: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssetHealth {
    pub asset_id: String,
    pub health: f64,
    pub as_of: i64,
    pub updated_at: i64,
    pub components: Vec<ComponentView>,
    pub open_tasks: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertTransition {
    pub asset_id: String,
    pub component: String,
    pub from: String,
    pub to: String,
    pub at: i64,
    pub trigger: String,
    pub value: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaintenanceTask {
    pub id: String,
    pub asset_id: String,
    pub component: String,
    pub due_by: i64,
    pub reason: String,
    pub severity: String,
    pub generated_at: i64,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub closed_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    #[tokio::test]
    async fn test_asset_health_request() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/assets/truck-1/health")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"asset_id":"truck-1","health":0.6,"as_of":120000,"updated_at":1,
                    "components":[{"component":"engine","level":"warning","entered_at":120000,
                    "health":0.4,"latest_rul_hours":480.0}],"open_tasks":1}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let health = client.asset_health("truck-1").await.unwrap();
        mock.assert_async().await;
        assert_eq!(health.asset_id, "truck-1");
        assert_eq!(health.components[0].level, "warning");
        assert_eq!(health.components[0].latest_rul_hours, Some(480.0));
    }

    #[tokio::test]
    async fn test_asset_id_is_one_encoded_segment() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/assets/depot%2F7%3Fbay%231%25/health")
            .with_status(200)
            .with_body(
                r#"{"asset_id":"depot/7?bay#1%","health":1.0,"as_of":60000,"updated_at":1,
                    "components":[],"open_tasks":0}"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let health = client.asset_health("depot/7?bay#1%").await.unwrap();
        mock.assert_async().await;
        assert_eq!(health.asset_id, "depot/7?bay#1%");
    }

    #[tokio::test]
    async fn test_base_path_is_kept() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/fleet/v1/alerts")
            .with_status(200)
            .with_body("[]")
            .expect(2)
            .create_async()
            .await;

        for base in [format!("{}/fleet", server.url()), format!("{}/fleet/", server.url())] {
            let client = ApiClient::new(&base).unwrap();
            assert!(client.alerts(None).await.unwrap().is_empty());
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_tasks_query_omits_unset_filters() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/tasks")
            .match_query(Matcher::UrlEncoded("status".into(), "open".into()))
            .with_status(200)
            .with_body("[]")
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let tasks = client.tasks(None, Some("open".into())).await.unwrap();
        mock.assert_async().await;
        assert!(tasks.is_empty());
    }

    #[tokio::test]
    async fn test_api_error_surfaces_message() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/v1/assets/ghost/health")
            .with_status(404)
            .with_body(r#"{"error":"no health for asset 'ghost'"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let err = client.asset_health("ghost").await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("404"));
        assert!(message.contains("no health for asset 'ghost'"));
    }

    #[tokio::test]
    async fn test_alerts_since_is_forwarded() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/v1/alerts")
            .match_query(Matcher::UrlEncoded("since".into(), "60000".into()))
            .with_status(200)
            .with_body(
                r#"[{"asset_id":"truck-1","component":"engine","from":"normal","to":"warning",
                     "at":60000,"trigger":"rul","value":480.0}]"#,
            )
            .create_async()
            .await;

        let client = ApiClient::new(&server.url()).unwrap();
        let alerts = client.alerts(Some(60_000)).await.unwrap();
        mock.assert_async().await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].to, "warning");
    }
}
