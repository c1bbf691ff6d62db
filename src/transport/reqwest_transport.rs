//! Production transport over reqwest, eventsource-stream and tokio-tungstenite.

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{SinkExt, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::RequestBuilder;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;
use url::Url;

use super::{
    EventStream, FilePart, HttpReply, SocketCommand, SocketConnection, SocketMessage, Transport,
    TransportError,
};

#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use a preconfigured client, e.g. one with proxies or custom timeouts.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

fn authorize(builder: RequestBuilder, token: Option<&str>) -> RequestBuilder {
    match token {
        Some(token) => builder.bearer_auth(token),
        None => builder,
    }
}

async fn send(builder: RequestBuilder) -> Result<HttpReply, TransportError> {
    let response = builder
        .send()
        .await
        .map_err(|e| TransportError::Connection(e.to_string()))?;
    let status = response.status().as_u16();
    let body = response
        .text()
        .await
        .map_err(|e| TransportError::Request(e.to_string()))?;
    Ok(HttpReply { status, body })
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn get(&self, url: &Url, token: Option<&str>) -> Result<HttpReply, TransportError> {
        send(authorize(self.client.get(url.clone()), token)).await
    }

    async fn post_json(
        &self,
        url: &Url,
        body: &Value,
        token: Option<&str>,
    ) -> Result<HttpReply, TransportError> {
        send(authorize(self.client.post(url.clone()).json(body), token)).await
    }

    async fn post_files(
        &self,
        url: &Url,
        files: Vec<FilePart>,
        token: Option<&str>,
    ) -> Result<HttpReply, TransportError> {
        let mut form = Form::new();
        for file in files {
            let mut part = Part::bytes(file.data.to_vec()).file_name(file.name);
            if let Some(mime) = file.mime {
                part = part
                    .mime_str(&mime)
                    .map_err(|e| TransportError::Request(e.to_string()))?;
            }
            form = form.part("files", part);
        }
        send(authorize(self.client.post(url.clone()).multipart(form), token)).await
    }

    async fn open_event_stream(
        &self,
        url: &Url,
        token: Option<&str>,
    ) -> Result<EventStream, TransportError> {
        let request = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, "text/event-stream");
        let response = authorize(request, token)
            .send()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        if !response.status().is_success() {
            return Err(TransportError::Connection(format!(
                "event stream returned status {}",
                response.status()
            )));
        }

        let events = response
            .bytes_stream()
            .eventsource()
            .map(|event| match event {
                Ok(event) => Ok(event.data),
                Err(e) => Err(TransportError::Stream(e.to_string())),
            })
            .boxed();
        Ok(events)
    }

    async fn open_socket(&self, url: &Url) -> Result<SocketConnection, TransportError> {
        let (socket, _) = tokio_tungstenite::connect_async(url.as_str())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        let (mut writer, reader) = socket.split();

        let (outgoing, mut commands) = mpsc::unbounded_channel::<SocketCommand>();
        tokio::spawn(async move {
            while let Some(command) = commands.recv().await {
                match command {
                    SocketCommand::Send(text) => {
                        if let Err(e) = writer.send(Message::text(text)).await {
                            debug!("Socket write failed: {}", e);
                            break;
                        }
                    }
                    SocketCommand::Close => {
                        let _ = writer.close().await;
                        break;
                    }
                }
            }
        });

        let incoming = reader
            .filter_map(|message| async move {
                match message {
                    Ok(Message::Text(text)) => Some(Ok(SocketMessage::Text(text.as_str().to_owned()))),
                    Ok(Message::Close(frame)) => {
                        let clean = frame.map_or(true, |frame| {
                            frame.code == tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode::Normal
                        });
                        Some(Ok(SocketMessage::Closed { clean }))
                    }
                    Ok(_) => None,
                    Err(e) => Some(Err(TransportError::Socket(e.to_string()))),
                }
            })
            .boxed();

        Ok(SocketConnection { outgoing, incoming })
    }
}
