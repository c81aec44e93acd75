//! Thin REST client for the order and chat endpoints.

use chrono::{DateTime, Utc};
use khanasathi_proto::{ChatMessage, ChatThread, OrderStatus};
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ClientError;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: String,
    pub customer_id: String,
    pub restaurant_id: String,
    pub delivery_staff_id: Option<String>,
    pub status: OrderStatus,
    pub total_amount: i64,
    pub delivery_address: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewOrder {
    pub restaurant_id: String,
    pub total_amount: i64,
    pub delivery_address: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActiveChat {
    pub order_id: String,
    pub thread: ChatThread,
    pub last_message: ChatMessage,
    pub unread_count: u64,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct MarkReadBody {
    updated: usize,
}

#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl ApiClient {
    /// `base_url` without a trailing slash, e.g. `http://localhost:5000`.
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let response = request.bearer_auth(&self.token).send().await?;
        Ok(check(response).await?.json::<T>().await?)
    }

    pub async fn create_order(&self, order: &NewOrder) -> Result<Order, ClientError> {
        self.send(self.http.post(self.url("/api/orders")).json(order)).await
    }

    pub async fn list_orders(&self) -> Result<Vec<Order>, ClientError> {
        self.send(self.http.get(self.url("/api/orders"))).await
    }

    pub async fn get_order(&self, order_id: &str) -> Result<Order, ClientError> {
        self.send(self.http.get(self.url(&format!("/api/orders/{order_id}")))).await
    }

    pub async fn update_status(&self, order_id: &str, status: OrderStatus) -> Result<Order, ClientError> {
        self.send(
            self.http
                .put(self.url(&format!("/api/orders/{order_id}/status")))
                .json(&json!({ "status": status })),
        )
        .await
    }

    pub async fn assign_rider(&self, order_id: &str, delivery_staff_id: &str) -> Result<Order, ClientError> {
        self.send(
            self.http
                .put(self.url(&format!("/api/orders/{order_id}/assign")))
                .json(&json!({ "deliveryStaffId": delivery_staff_id })),
        )
        .await
    }

    pub async fn messages(
        &self,
        order_id: &str,
        thread: Option<ChatThread>,
    ) -> Result<Vec<ChatMessage>, ClientError> {
        let mut request = self.http.get(self.url(&format!("/api/chat/{order_id}/messages")));
        if let Some(thread) = thread {
            request = request.query(&[("thread", thread.as_str())]);
        }
        self.send(request).await
    }

    pub async fn send_message(
        &self,
        order_id: &str,
        content: &str,
        thread: Option<ChatThread>,
    ) -> Result<ChatMessage, ClientError> {
        self.send(
            self.http
                .post(self.url(&format!("/api/chat/{order_id}/messages")))
                .json(&json!({ "content": content, "thread": thread })),
        )
        .await
    }

    pub async fn mark_read(&self, order_id: &str, thread: Option<ChatThread>) -> Result<usize, ClientError> {
        let body: MarkReadBody = self
            .send(
                self.http
                    .put(self.url(&format!("/api/chat/{order_id}/read")))
                    .json(&json!({ "thread": thread })),
            )
            .await?;
        Ok(body.updated)
    }

    pub async fn active_chats(&self) -> Result<Vec<ActiveChat>, ClientError> {
        self.send(self.http.get(self.url("/api/chat/active"))).await
    }
}

/// Turn non-2xx responses into `ClientError::Status` with the server's message.
async fn check(response: Response) -> Result<Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let text = response.text().await.unwrap_or_default();
    let message = serde_json::from_str::<ErrorBody>(&text)
        .map(|body| body.message)
        .unwrap_or(text);
    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}
