pub mod consumer;
pub mod history;
pub mod normalize;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::{future, StreamExt};
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Message as WsMessage;

pub use consumer::{ConsumerOptions, ReconnectPolicy, StreamConsumer, ViewState};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("ошибка HTTP-запроса: {0}")]
    Http(#[from] reqwest::Error),
    #[error("сервер ответил статусом {status}")]
    Status { status: u16 },
    #[error("ошибка websocket: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("некорректные данные снимка: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("некорректный адрес сервера: {0}")]
    Url(String),
    #[error("соединение закрыто сервером")]
    Closed,
}

/// Raw text frames from the push channel. The stream ends when the server
/// closes the connection.
pub type MessageStream = BoxStream<'static, Result<String, ClientError>>;

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// One pull of the current snapshot as raw JSON.
    async fn fetch(&self) -> Result<String, ClientError>;

    async fn subscribe(&self) -> Result<MessageStream, ClientError>;
}

/// `reqwest` for pulls and stream-token issuance, `tokio-tungstenite` for the
/// push socket.
pub struct HttpTransport {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

#[derive(Deserialize)]
struct StreamTokenResponse {
    token: String,
}

impl HttpTransport {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self, ClientError> {
        let base_url = base_url.trim().trim_end_matches('/').to_string();
        if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
            return Err(ClientError::Url(base_url));
        }
        let http = reqwest::Client::builder()
            .user_agent(concat!("hwmond/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key,
        })
    }

    fn with_key(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    fn stream_url(&self, token: &str) -> String {
        let ws_base = match self.base_url.strip_prefix("https://") {
            Some(rest) => format!("wss://{rest}"),
            None => format!(
                "ws://{}",
                self.base_url.trim_start_matches("http://")
            ),
        };
        format!("{ws_base}/stream?token={token}")
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self) -> Result<String, ClientError> {
        let request = self.with_key(self.http.get(format!("{}/stats", self.base_url)));
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    async fn subscribe(&self) -> Result<MessageStream, ClientError> {
        let request =
            self.with_key(self.http.post(format!("{}/stream/token", self.base_url)));
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(ClientError::Status {
                status: response.status().as_u16(),
            });
        }
        let issued: StreamTokenResponse = serde_json::from_str(&response.text().await?)?;

        let (socket, _) = tokio_tungstenite::connect_async(self.stream_url(&issued.token)).await?;
        let messages = socket
            .take_while(|msg| future::ready(!matches!(msg, Ok(WsMessage::Close(_)))))
            .filter_map(|msg| {
                future::ready(match msg {
                    Ok(WsMessage::Text(text)) => Some(Ok(text)),
                    Ok(_) => None,
                    Err(err) => Some(Err(ClientError::from(err))),
                })
            });
        Ok(messages.boxed())
    }
}
