use crate::{config::ServerConfig, dataset::FinancialData, usage::TokenUsage};
use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Outbound chat payload: the dataset arrays at the top level plus the question.
#[derive(Debug, Serialize)]
pub struct ChatRequest<'a> {
    #[serde(flatten)]
    pub data: &'a FinancialData,
    pub question: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChatResponse {
    #[serde(default, rename = "response")]
    pub text: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub is_new_session: Option<bool>,
    #[serde(default, deserialize_with = "crate::usage::lenient_usage")]
    pub tokens: Option<TokenUsage>,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("could not connect to the chat service at {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("chat service returned {status}: {body}")]
    Remote { status: StatusCode, body: String },
    #[error("chat service returned an unreadable body: {0}")]
    Decode(#[source] serde_json::Error),
}

#[derive(Clone)]
pub struct ChatClient {
    client: Client,
    endpoint: String,
}

impl ChatClient {
    pub fn new(config: &ServerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent("finchat/0.1")
            .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            client,
            endpoint: config.endpoint_url.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn send(&self, request: &ChatRequest<'_>) -> Result<ChatResponse, ChatError> {
        let transport = |source| ChatError::Transport {
            url: self.endpoint.clone(),
            source,
        };

        tracing::debug!(
            endpoint = %self.endpoint,
            has_session = request.session_id.is_some(),
            "sending chat request"
        );
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(transport)?;

        let status = response.status();
        let body = response.text().await.map_err(transport)?;
        if status != StatusCode::OK {
            tracing::error!(status = %status, "chat service rejected request");
            return Err(ChatError::Remote { status, body });
        }

        serde_json::from_str(&body).map_err(ChatError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(url: String) -> ChatClient {
        ChatClient::new(&ServerConfig {
            endpoint_url: url,
            request_timeout_secs: 5,
        })
        .unwrap()
    }

    fn sample_data() -> FinancialData {
        FinancialData::parse(
            r#"{"kpi_data_g1": [{"Month_Year": "Jan 2024", "Income": 1200}], "kpi_data_g2": [{"EBITDA": 4}]}"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn posts_dataset_and_question_without_null_session() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat"))
            .and(header("content-type", "application/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "response": "Income is rising.",
                "session_id": "S1",
                "is_new_session": true,
                "tokens": {"prompt": 10, "completion": 5, "total": 15, "cached_tokens": 0}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(format!("{}/chat", server.uri()));
        let data = sample_data();
        let request = ChatRequest {
            data: &data,
            question: "What is the trend in income?",
            session_id: None,
        };
        let reply = client.send(&request).await.unwrap();
        assert_eq!(reply.text.as_deref(), Some("Income is rising."));
        assert_eq!(reply.session_id.as_deref(), Some("S1"));
        assert_eq!(reply.is_new_session, Some(true));
        assert_eq!(reply.tokens.and_then(|t| t.total), Some(15));

        let received = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&received[0].body).unwrap();
        assert_eq!(body["question"], "What is the trend in income?");
        assert_eq!(body["kpi_data_g1"][0]["Income"], 1200);
        assert_eq!(body["add_data_g1"], json!([]));
        assert!(body.get("session_id").is_none());
    }

    #[tokio::test]
    async fn non_success_status_is_a_remote_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = client_for(format!("{}/chat", server.uri()));
        let data = FinancialData::default();
        let request = ChatRequest {
            data: &data,
            question: "q",
            session_id: Some("S1".to_string()),
        };
        match client.send(&request).await {
            Err(ChatError::Remote { status, body }) => {
                assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
                assert_eq!(body, "overloaded");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let client = client_for(format!("{}/chat", server.uri()));
        let data = FinancialData::default();
        let request = ChatRequest {
            data: &data,
            question: "q",
            session_id: None,
        };
        assert!(matches!(
            client.send(&request).await,
            Err(ChatError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn missing_text_still_decodes() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"session_id": "S1"})))
            .mount(&server)
            .await;

        let client = client_for(format!("{}/chat", server.uri()));
        let data = FinancialData::default();
        let request = ChatRequest {
            data: &data,
            question: "q",
            session_id: None,
        };
        let reply = client.send(&request).await.unwrap();
        assert!(reply.text.is_none());
        assert!(reply.tokens.is_none());
    }

    #[tokio::test]
    async fn unreachable_service_is_a_transport_error() {
        let client = client_for("http://127.0.0.1:1/chat".to_string());
        let data = FinancialData::default();
        let request = ChatRequest {
            data: &data,
            question: "q",
            session_id: None,
        };
        assert!(matches!(
            client.send(&request).await,
            Err(ChatError::Transport { .. })
        ));
    }
}
