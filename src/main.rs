//! Agent chat client
//!
//! Terminal client for a tool-using AI agent backend. Results arrive over
//! STOMP/WebSocket push or HTTP request/response; both feed one deduplicated
//! pipeline that drives the turn state machine.

mod cli;
mod config;
mod dedup;
mod history;
mod protocol;
mod runtime;
mod timeline;
mod transport;
mod turn;

use cli::{parse_input, render, Input, HELP};
use config::{ClientConfig, DeliveryMode};
use history::{HistoryStore, Preferences, SqliteStore};
use protocol::Destinations;
use runtime::{
    spawn_status_check, ChatClient, ClientEvent, Driver, DriverHandle, HttpOutbound,
    StompOutbound,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transport::{
    ConnectorHandle, HttpBackend, SseSubscriber, TransportConnector, WebSocketDialer,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout is the conversation
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "agent_chat=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ClientConfig::from_env();

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.db_path();
    tracing::info!(path = %db_path.display(), "Opening database");
    let store = Arc::new(SqliteStore::open(&db_path)?);
    let history = HistoryStore::new(store.clone(), config.history);

    let backend = Arc::new(HttpBackend::new(
        config.base_url.clone(),
        config.request_timeout,
    )?);
    let settings = config.client_settings()?;
    let cancel = CancellationToken::new();
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

    let (handle, connector) = match config.delivery {
        DeliveryMode::Push => {
            tracing::info!(url = %config.ws_url, "Using push delivery");
            let (connector, connector_handle) = TransportConnector::new(
                WebSocketDialer::new(config.ws_url.clone()),
                config.connector(),
                inbound_tx.clone(),
            );
            connector.spawn(cancel.child_token());
            connector_handle.connect();

            let outbound = StompOutbound::new(connector_handle.clone(), Destinations::default());
            let client = ChatClient::new(outbound, history, settings);
            let (driver, handle) = Driver::new(client, backend.clone(), config.poll, inbound_rx);
            tokio::spawn(
                driver
                    .with_status(connector_handle.subscribe_status())
                    .run(cancel.clone()),
            );
            (handle, Some(connector_handle))
        }
        DeliveryMode::Request => {
            tracing::info!(url = %config.base_url, "Using request delivery");
            let client = ChatClient::new(HttpOutbound::new(backend.clone()), history, settings);
            let (driver, handle) = Driver::new(client, backend.clone(), config.poll, inbound_rx);
            tokio::spawn(driver.run(cancel.clone()));
            (handle, None)
        }
    };

    if let Some(url) = &config.sse_url {
        tracing::info!(url = %url, "Subscribing to event stream");
        let subscriber = SseSubscriber::new(url.clone(), config.reconnect);
        tokio::spawn(subscriber.run(inbound_tx.clone(), cancel.child_token()));
    }
    drop(inbound_tx);

    spawn_status_check(
        backend.clone(),
        config.status_interval,
        handle.clone(),
        cancel.child_token(),
    );
    tokio::spawn(print_events(handle.subscribe()));

    println!("Agent chat. Type /help for commands.");
    let session = Session {
        handle,
        backend,
        connector,
        store,
    };
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match parse_input(&line) {
            Ok(Some(Input::Quit)) => break,
            Ok(Some(input)) => session.execute(input).await,
            Ok(None) => {}
            Err(usage) => println!("{usage}"),
        }
    }

    if let Some(connector) = &session.connector {
        connector.close();
    }
    cancel.cancel();
    Ok(())
}

/// Everything a command may need
struct Session {
    handle: DriverHandle,
    backend: Arc<HttpBackend>,
    connector: Option<ConnectorHandle>,
    store: Arc<SqliteStore>,
}

impl Session {
    async fn execute(&self, input: Input) {
        if let Err(e) = self.try_execute(input).await {
            println!("  ! {e}");
        }
    }

    async fn try_execute(&self, input: Input) -> Result<(), Box<dyn std::error::Error>> {
        match input {
            Input::Message(text) => self.handle.submit(text).await?,
            Input::Form(payload) => self.handle.submit_form(payload).await?,
            Input::CancelForm => self.handle.cancel_form().await?,
            Input::NewChat => {
                let session_id = self.handle.new_chat().await?;
                if let Err(e) = self.backend.clear_session(&session_id).await {
                    tracing::debug!(error = %e, "Backend session reset failed");
                }
                println!("  New session {session_id}");
            }
            Input::Upload(paths) => {
                let session_id = self.handle.session_id().await?;
                let reply = self.backend.upload_attachment(&session_id, &paths).await?;
                self.handle
                    .notice(format!("Uploaded {} file(s). {reply}", paths.len()))
                    .await?;
            }
            Input::History => {
                let records = self.handle.history().await?;
                if records.is_empty() {
                    println!("  No archived conversations");
                }
                for (i, record) in records.iter().enumerate() {
                    let preview: String = record.user.chars().take(60).collect();
                    println!("  {:>3}. {preview}", i + 1);
                }
            }
            Input::Delete(index) => match self.handle.delete_history(index).await? {
                Some(record) => println!("  Deleted \"{}\"", record.user),
                None => println!("  No archived conversation {}", index + 1),
            },
            Input::ClearHistory => {
                self.handle.clear_history().await?;
                println!("  History cleared");
            }
            Input::Export(path) => {
                let transcript = self.handle.export_transcript().await?;
                match path {
                    Some(path) => {
                        tokio::fs::write(&path, transcript).await?;
                        println!("  Transcript written to {}", path.display());
                    }
                    None => println!("{transcript}"),
                }
            }
            Input::Status => {
                let status = self.backend.request_status().await;
                self.handle.report_agent_status(status.clone()).await?;
                match status {
                    transport::AgentStatus::Online { detail } => println!("  Agent online: {detail}"),
                    transport::AgentStatus::Offline { reason } => {
                        println!("  Agent offline: {reason}");
                    }
                }
            }
            Input::Models => println!("{}", self.backend.available_models().await?),
            Input::Settings => {
                let prefs = Preferences::load(self.store.as_ref());
                println!("{}", serde_json::to_string_pretty(&prefs)?);
            }
            Input::Set { name, value } => {
                let mut prefs = Preferences::load(self.store.as_ref());
                if prefs.set(&name, &value) {
                    prefs.save(self.store.as_ref())?;
                    println!("  {name} = {value}");
                } else {
                    println!("  Cannot set {name} to {value}");
                }
            }
            Input::Retry => match &self.connector {
                Some(connector) => connector.retry_now(),
                None => println!("  No push channel in request mode"),
            },
            Input::Help => println!("{HELP}"),
            Input::Quit => {}
        }
        Ok(())
    }
}

async fn print_events(events: broadcast::Receiver<ClientEvent>) {
    let mut stream = BroadcastStream::new(events);
    while let Some(item) = stream.next().await {
        match item {
            Ok(event) => {
                if let Some(line) = render(&event) {
                    println!("{line}");
                }
            }
            Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Renderer fell behind");
            }
        }
    }
}
