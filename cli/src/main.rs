use std::time::Duration;

use clap::Parser;
use futures_util::{SinkExt, StreamExt};
use talk::route::{RouteError, history_path, ws_base_from_http, ws_path};
use talk::{Backoff, Bubble, ChatFeed, ChatMessage, ComposeError};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing_subscriber::EnvFilter;


const RESYNC_MARKER: &str = "-- history resynced --";

#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("invalid base URL: {0}")]
    InvalidBaseUrl(#[from] RouteError),
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("history request failed: HTTP {0}")]
    HistoryStatus(u16),
    #[error("history response unreadable: {0}")]
    History(#[from] talk::CodecError),
    #[error("websocket connect failed: {0}")]
    WsConnect(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("websocket error: {0}")]
    Ws(Box<tokio_tungstenite::tungstenite::Error>),
    #[error("gave up after {0} reconnect attempts")]
    GaveUp(u32),
}

#[derive(Parser, Debug)]
#[command(name = "roomchat-cli", about = "Terminal client for a room chat")]
struct Cli {
    #[arg(long, env = "ROOMCHAT_BASE_URL", default_value = "http://127.0.0.1:8000")]
    base_url: String,

    #[arg(long, env = "ROOMCHAT_ROOM_ID")]
    room_id: String,

    #[arg(long, env = "ROOMCHAT_USER_ID")]
    user_id: String,

    #[arg(long, env = "ROOMCHAT_USER_NAME")]
    user_name: String,

    /// Reconnect attempts before giving up.
    #[arg(long, env = "ROOMCHAT_MAX_RECONNECTS", default_value_t = 8)]
    max_reconnects: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Endpoints {
    room_id: String,
    ws_url: String,
    history_url: String,
}

impl Endpoints {
    fn new(base_url: &str, room_id: &str, user_id: &str, user_name: &str) -> Result<Self, CliError> {
        let ws_base = ws_base_from_http(base_url)?;
        let http_base = base_url.trim().trim_end_matches('/');
        Ok(Self {
            room_id: room_id.to_owned(),
            ws_url: format!("{ws_base}{}", ws_path(room_id, user_id, user_name)),
            history_url: format!("{http_base}{}", history_path(room_id)),
        })
    }
}

/// How a connected session ended without a transport error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    InputClosed,
    StreamClosed,
}

/// Feed plus how much of it has already been printed.
#[derive(Debug)]
struct TerminalView {
    feed: ChatFeed,
    rendered: usize,
}

impl TerminalView {
    fn new(user_name: impl Into<String>) -> Self {
        Self { feed: ChatFeed::new(user_name), rendered: 0 }
    }

    fn push_live(&mut self, message: ChatMessage) -> Vec<String> {
        if self.feed.push_live(message) {
            self.render_from(self.rendered)
        } else {
            Vec::new()
        }
    }

    fn apply_history(&mut self, ticket: u64, history: Vec<ChatMessage>) -> Vec<String> {
        match self.feed.apply_history(ticket, history) {
            Some(changed) => self.render_from(changed),
            None => Vec::new(),
        }
    }

    fn fail_history(&mut self, ticket: u64, reason: String) -> Vec<String> {
        match self.feed.fail_history(ticket, reason) {
            Some(changed) => self.render_from(changed),
            None => Vec::new(),
        }
    }

    /// Lines for every message from `changed` on. Rewinding below what was
    /// already printed emits the resync marker first.
    fn render_from(&mut self, changed: usize) -> Vec<String> {
        let messages = self.feed.messages();
        let start = changed.min(messages.len());
        let mut lines = Vec::with_capacity(messages.len() - start + 1);
        if start < self.rendered {
            lines.push(RESYNC_MARKER.to_owned());
        }
        lines.extend(
            messages[start..]
                .iter()
                .map(|message| render_line(&Bubble::new(message, self.feed.local_name()))),
        );
        self.rendered = messages.len();
        lines
    }
}

fn render_line(bubble: &Bubble) -> String {
    format!("[{}] {}", bubble.label, bubble.text)
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{line}");
    }
}

#[tokio::main]
async fn main() -> Result<(), CliError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let endpoints = Endpoints::new(&cli.base_url, &cli.room_id, &cli.user_id, &cli.user_name)?;

    let (line_tx, line_rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(read_stdin(line_tx));

    let backoff = Backoff::new(1000, 10_000, Some(cli.max_reconnects));
    run_chat(&endpoints, TerminalView::new(cli.user_name), backoff, line_rx).await
}

async fn read_stdin(tx: mpsc::UnboundedSender<String>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if tx.send(line).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(error) => {
                tracing::warn!("stdin read failed: {error}");
                break;
            }
        }
    }
}

/// A finished history fetch, tagged with the ticket it was issued under.
#[derive(Debug)]
struct HistoryDone {
    ticket: u64,
    result: Result<Vec<ChatMessage>, CliError>,
}

/// Runs history fetches as background tasks, independent of the socket.
struct HistoryFetcher {
    client: reqwest::Client,
    url: String,
    tx: mpsc::UnboundedSender<HistoryDone>,
    rx: mpsc::UnboundedReceiver<HistoryDone>,
}

impl HistoryFetcher {
    fn new(url: String) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { client: reqwest::Client::new(), url, tx, rx }
    }

    /// Start a fetch under a fresh ticket. Older fetches still in flight
    /// become stale.
    fn request(&self, view: &mut TerminalView) {
        let ticket = view.feed.begin_history();
        let client = self.client.clone();
        let url = self.url.clone();
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = fetch_history(&client, &url).await;
            let _ = tx.send(HistoryDone { ticket, result });
        });
    }

    async fn next(&mut self) -> Option<HistoryDone> {
        self.rx.recv().await
    }
}

fn handle_history(view: &mut TerminalView, done: HistoryDone) {
    match done.result {
        Ok(messages) => {
            tracing::debug!("history loaded: {} messages", messages.len());
            print_lines(view.apply_history(done.ticket, messages));
        }
        Err(error) => {
            tracing::warn!("history fetch failed: {error}");
            eprintln!("-- could not load earlier messages ({error}) --");
            print_lines(view.fail_history(done.ticket, error.to_string()));
        }
    }
}

fn refuse_offline(line: &str) {
    if !line.trim().is_empty() {
        eprintln!("-- not connected, message not sent --");
    }
}

async fn run_chat(
    endpoints: &Endpoints,
    mut view: TerminalView,
    mut backoff: Backoff,
    mut lines: mpsc::UnboundedReceiver<String>,
) -> Result<(), CliError> {
    let mut history = HistoryFetcher::new(endpoints.history_url.clone());
    history.request(&mut view);
    let mut connect_attempt: u32 = 0;

    loop {
        connect_attempt = connect_attempt.saturating_add(1);
        let refetch = talk::refetch_on_open(connect_attempt);
        match run_session(endpoints, &mut view, &mut backoff, &mut lines, &mut history, refetch).await {
            Ok(SessionEnd::InputClosed) => return Ok(()),
            Ok(SessionEnd::StreamClosed) => tracing::info!("chat stream closed"),
            Err(error) => tracing::warn!("chat stream error: {error}"),
        }

        let Some(delay) = backoff.next_delay() else {
            return Err(CliError::GaveUp(backoff.attempt()));
        };
        eprintln!("-- disconnected, retrying in {}ms (attempt {}) --", delay.as_millis(), backoff.attempt());
        if !wait_for_retry(delay, &mut view, &mut lines, &mut history).await {
            return Ok(());
        }
    }
}

/// Sleep out the retry delay, refusing any input typed meanwhile.
/// Returns `false` when stdin closed while waiting.
async fn wait_for_retry(
    delay: Duration,
    view: &mut TerminalView,
    lines: &mut mpsc::UnboundedReceiver<String>,
    history: &mut HistoryFetcher,
) -> bool {
    let sleep = tokio::time::sleep(delay);
    tokio::pin!(sleep);
    loop {
        tokio::select! {
            () = &mut sleep => return true,
            Some(done) = history.next() => handle_history(view, done),
            line = lines.recv() => match line {
                None => return false,
                Some(line) => refuse_offline(&line),
            },
        }
    }
}

async fn run_session(
    endpoints: &Endpoints,
    view: &mut TerminalView,
    backoff: &mut Backoff,
    lines: &mut mpsc::UnboundedReceiver<String>,
    history: &mut HistoryFetcher,
    refetch_history: bool,
) -> Result<SessionEnd, CliError> {
    let connect = connect_async(endpoints.ws_url.as_str());
    tokio::pin!(connect);
    let (stream, _) = loop {
        tokio::select! {
            result = &mut connect => break result.map_err(|error| CliError::WsConnect(Box::new(error)))?,
            Some(done) = history.next() => handle_history(view, done),
            line = lines.recv() => match line {
                None => return Ok(SessionEnd::InputClosed),
                Some(line) => refuse_offline(&line),
            },
        }
    };
    backoff.reset();
    eprintln!("-- connected to room {} --", endpoints.room_id);

    if refetch_history {
        history.request(view);
    }

    let (mut write, mut read) = stream.split();

    loop {
        tokio::select! {
            Some(done) = history.next() => handle_history(view, done),
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => match talk::decode_stream_frame(text.as_str()) {
                    Ok(frame) => print_lines(view.push_live(frame.into())),
                    Err(error) => tracing::warn!("dropping chat frame: {error}"),
                },
                Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::StreamClosed),
                Some(Ok(_)) => {}
                Some(Err(error)) => return Err(CliError::Ws(Box::new(error))),
            },
            line = lines.recv() => match line {
                None => {
                    let _ = write.close().await;
                    return Ok(SessionEnd::InputClosed);
                }
                Some(line) => match talk::prepare_outgoing(&line) {
                    Ok(payload) => write
                        .send(Message::Text(payload.into()))
                        .await
                        .map_err(|error| CliError::Ws(Box::new(error)))?,
                    Err(ComposeError::Empty) => {}
                    Err(error) => eprintln!("-- not sent: {error} --"),
                },
            },
        }
    }
}

async fn fetch_history(client: &reqwest::Client, url: &str) -> Result<Vec<ChatMessage>, CliError> {
    let response = client.get(url).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(CliError::HistoryStatus(status.as_u16()));
    }
    let body = response.text().await?;
    let history = talk::decode_history(&body)?;
    Ok(history.messages.into_iter().map(ChatMessage::from).collect())
}
