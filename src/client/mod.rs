//! Client-side terminal multiplexer: one socket per tab, a byte history per
//! tab, and at most one attached renderer per tab.

mod attach;
mod connectivity;
mod history;
mod template;

pub use attach::{LocalTerminal, drive_tab};
pub use connectivity::{ConnectivityLink, LinkState};
pub use history::HistoryBuffer;
pub use template::{TemplateInfo, start_command_for, welcome_banner};

use crate::config::ClientConfig;
use crate::control::ControlFrame;
use futures::{SinkExt, StreamExt};
use regex::bytes::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use tokio::sync::{mpsc, watch};
use tokio::time::{Duration, sleep};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

pub const MAIN_TAB_ID: &str = "main";

/// Cursor-position reports a renderer answers on its own; they must not be
/// typed into the shell.
static CURSOR_REPORT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[\d+;\d+R").expect("cursor report pattern is valid")
});

/// Where drawn output goes. Receives raw bytes; decoding is up to the renderer.
///
/// Both methods run with the multiplexer lock held and on the socket task of
/// the tab, so they must not block. Put sinks that can stall (a terminal, a
/// pipe) behind a [`ChannelRenderer`].
pub trait Renderer: Send {
    fn write(&mut self, bytes: &[u8]);

    /// Called before a full history replay.
    fn reset(&mut self) {}
}

/// Hands every chunk to a channel; whoever owns the receiver does the actual
/// drawing.
pub struct ChannelRenderer {
    tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl ChannelRenderer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl Renderer for ChannelRenderer {
    fn write(&mut self, bytes: &[u8]) {
        let _ = self.tx.send(bytes.to_vec());
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalTab {
    pub id: String,
    pub name: String,
    pub active: bool,
}

impl TerminalTab {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            active: false,
        }
    }

    pub fn is_main(&self) -> bool {
        self.id == MAIN_TAB_ID
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabLink {
    Connecting,
    Open,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ClientTarget {
    pub edge_url: String,
    pub user_id: String,
    pub container_id: Option<String>,
    pub template: TemplateInfo,
    pub history_max_bytes: usize,
    pub history_max_lines: usize,
    pub main_startup_delay: Duration,
    pub restart_delay: Duration,
}

impl ClientTarget {
    pub fn from_config(
        config: &ClientConfig,
        user_id: impl Into<String>,
        container_id: Option<String>,
    ) -> Self {
        Self {
            edge_url: config.edge_url.clone(),
            user_id: user_id.into(),
            container_id,
            template: TemplateInfo::new(
                config.template_id.clone(),
                config.template_name.clone(),
                config.public_port,
            ),
            history_max_bytes: config.history_max_bytes,
            history_max_lines: config.history_max_lines,
            main_startup_delay: Duration::from_millis(config.main_startup_delay_ms),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
        }
    }

    /// The container id, unless it is missing or a placeholder.
    fn container(&self) -> Option<&str> {
        self.container_id
            .as_deref()
            .filter(|id| !id.is_empty() && *id != "null" && *id != "undefined")
    }

    pub fn socket_url(&self, tab_id: &str, container_id: &str) -> String {
        format!(
            "{}?userId={}&termId={}&containerId={}",
            self.edge_url,
            urlencoding::encode(&self.user_id),
            urlencoding::encode(tab_id),
            urlencoding::encode(container_id)
        )
    }
}

enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close,
}

impl Outbound {
    fn payload(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => Outbound::Text(text.to_string()),
            Err(_) => Outbound::Binary(bytes.to_vec()),
        }
    }
}

struct TabSocket {
    generation: u64,
    outbound: mpsc::UnboundedSender<Outbound>,
    link: watch::Sender<TabLink>,
}

impl TabSocket {
    fn is_open(&self) -> bool {
        *self.link.borrow() == TabLink::Open
    }

    fn shutdown(&self) {
        let _ = self.outbound.send(Outbound::Close);
        self.link.send_replace(TabLink::Closed);
    }
}

struct TabView {
    history: HistoryBuffer,
    renderer: Option<Box<dyn Renderer>>,
    last_refresh: u64,
}

impl TabView {
    fn new(target: &ClientTarget) -> Self {
        Self {
            history: HistoryBuffer::new(target.history_max_bytes, target.history_max_lines),
            renderer: None,
            last_refresh: 0,
        }
    }

    fn replay(&mut self) {
        let snapshot = self.history.snapshot();
        if let Some(renderer) = self.renderer.as_mut() {
            renderer.reset();
            if !snapshot.is_empty() {
                renderer.write(&snapshot);
            }
        }
    }
}

#[derive(Default)]
struct MuxState {
    sockets: HashMap<String, TabSocket>,
    views: HashMap<String, TabView>,
    next_generation: u64,
}

impl MuxState {
    fn view(&mut self, tab_id: &str, target: &ClientTarget) -> &mut TabView {
        self.views
            .entry(tab_id.to_string())
            .or_insert_with(|| TabView::new(target))
    }
}

struct MuxInner {
    target: ClientTarget,
    state: Mutex<MuxState>,
    connectivity: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct TerminalMultiplexer {
    inner: Arc<MuxInner>,
}

impl TerminalMultiplexer {
    pub fn new(target: ClientTarget) -> Self {
        let (connectivity, _) = watch::channel(false);
        Self {
            inner: Arc::new(MuxInner {
                target,
                state: Mutex::new(MuxState::default()),
                connectivity,
            }),
        }
    }

    pub fn target(&self) -> &ClientTarget {
        &self.inner.target
    }

    fn lock(&self) -> MutexGuard<'_, MuxState> {
        self.inner.state.lock().expect("multiplexer mutex poisoned")
    }

    /// Open the socket for `tab_id`. Returns false without doing anything if
    /// one already exists (open or still handshaking) or no container is known.
    pub fn connect(&self, tab_id: &str, is_main: bool) -> bool {
        let target = &self.inner.target;
        let Some(container_id) = target.container() else {
            tracing::debug!(term_id = %tab_id, "No container yet; not connecting");
            return false;
        };
        if target.user_id.is_empty() {
            return false;
        }

        let (generation, outbound) = {
            let mut state = self.lock();
            if state.sockets.contains_key(tab_id) {
                return false;
            }
            state.next_generation += 1;
            let generation = state.next_generation;
            let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
            let (link, _) = watch::channel(TabLink::Connecting);
            state.sockets.insert(
                tab_id.to_string(),
                TabSocket {
                    generation,
                    outbound: outbound_tx,
                    link,
                },
            );
            state.view(tab_id, target);
            (generation, outbound_rx)
        };

        let url = target.socket_url(tab_id, container_id);
        let mux = self.clone();
        let tab_id = tab_id.to_string();
        tokio::spawn(async move {
            mux.run_tab(tab_id, is_main, generation, url, outbound)
                .await;
        });
        true
    }

    async fn run_tab(
        self,
        tab_id: String,
        is_main: bool,
        generation: u64,
        url: String,
        mut outbound: mpsc::UnboundedReceiver<Outbound>,
    ) {
        match connect_async(url.as_str()).await {
            Ok((socket, _)) => {
                if self.on_open(&tab_id, is_main, generation) {
                    let (mut sink, mut stream) = socket.split();
                    loop {
                        tokio::select! {
                            frame = outbound.recv() => {
                                let message = match frame {
                                    Some(Outbound::Text(text)) => Message::Text(text),
                                    Some(Outbound::Binary(data)) => Message::Binary(data),
                                    Some(Outbound::Close) | None => {
                                        let _ = sink.send(Message::Close(None)).await;
                                        break;
                                    }
                                };
                                if let Err(err) = sink.send(message).await {
                                    tracing::debug!(term_id = %tab_id, error = %err, "Terminal send failed");
                                    break;
                                }
                            }
                            message = stream.next() => match message {
                                Some(Ok(Message::Text(text))) => self.deliver_live(&tab_id, generation, text.as_bytes()),
                                Some(Ok(Message::Binary(data))) => self.deliver_live(&tab_id, generation, &data),
                                Some(Ok(Message::Close(frame))) => {
                                    tracing::info!(term_id = %tab_id, frame = ?frame, "Terminal socket closed by server");
                                    break;
                                }
                                Some(Ok(_)) => {}
                                Some(Err(err)) => {
                                    tracing::warn!(term_id = %tab_id, error = %err, "Terminal socket error");
                                    break;
                                }
                                None => break,
                            },
                        }
                    }
                }
            }
            Err(err) => {
                tracing::warn!(term_id = %tab_id, error = %err, "Terminal socket failed to connect");
            }
        }
        self.on_close(&tab_id, is_main, generation);
    }

    /// Returns false if the tab was dropped while the handshake was running.
    fn on_open(&self, tab_id: &str, is_main: bool, generation: u64) -> bool {
        {
            let state = self.lock();
            match state.sockets.get(tab_id) {
                Some(socket) if socket.generation == generation => {
                    if is_main {
                        self.inner.connectivity.send_replace(true);
                    }
                    socket.link.send_replace(TabLink::Open);
                }
                _ => return false,
            }
        }
        tracing::info!(term_id = %tab_id, is_main, "Terminal socket open");
        let banner = welcome_banner(&self.inner.target.template, is_main);
        self.deliver(tab_id, banner.as_bytes());
        if is_main {
            self.schedule_startup_command(tab_id);
        }
        true
    }

    fn on_close(&self, tab_id: &str, is_main: bool, generation: u64) {
        let superseded = {
            let mut state = self.lock();
            match state.sockets.get(tab_id).map(|socket| socket.generation) {
                Some(current) if current == generation => {
                    if let Some(socket) = state.sockets.remove(tab_id) {
                        socket.link.send_replace(TabLink::Closed);
                    }
                    false
                }
                Some(_) => true,
                None => false,
            }
        };
        if is_main && !superseded {
            self.inner.connectivity.send_replace(false);
        }
        tracing::info!(term_id = %tab_id, "Terminal socket closed");
    }

    fn deliver(&self, tab_id: &str, bytes: &[u8]) {
        let mut state = self.lock();
        self.append(&mut state, tab_id, bytes);
    }

    /// Like `deliver`, but drops bytes from a socket that was closed or
    /// replaced, so a removed tab's history is not brought back.
    fn deliver_live(&self, tab_id: &str, generation: u64, bytes: &[u8]) {
        let mut state = self.lock();
        let current = state
            .sockets
            .get(tab_id)
            .is_some_and(|socket| socket.generation == generation);
        if current {
            self.append(&mut state, tab_id, bytes);
        }
    }

    /// History first, renderer second; both under one lock so a concurrent
    /// replay never misses or repeats a chunk.
    fn append(&self, state: &mut MuxState, tab_id: &str, bytes: &[u8]) {
        let view = state.view(tab_id, &self.inner.target);
        let evicted = view.history.append(bytes);
        if evicted > 0 {
            tracing::debug!(
                term_id = %tab_id,
                evicted,
                dropped_total = view.history.dropped_bytes(),
                "History trimmed"
            );
        }
        if let Some(renderer) = view.renderer.as_mut() {
            renderer.write(bytes);
        }
    }

    fn schedule_startup_command(&self, tab_id: &str) {
        let Some(payload) = self.inner.target.template.startup_payload() else {
            return;
        };
        let mux = self.clone();
        let tab_id = tab_id.to_string();
        let delay = self.inner.target.main_startup_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            if mux.send_data(&tab_id, payload.as_bytes()) {
                tracing::info!(term_id = %tab_id, "Startup command sent");
            }
        });
    }

    /// Forward raw payload; dropped silently unless the socket is open.
    pub fn send_data(&self, tab_id: &str, bytes: &[u8]) -> bool {
        let state = self.lock();
        match state.sockets.get(tab_id) {
            Some(socket) if socket.is_open() => socket.outbound.send(Outbound::payload(bytes)).is_ok(),
            _ => false,
        }
    }

    /// Input typed into a renderer, minus any cursor-position reports.
    pub fn send_renderer_input(&self, tab_id: &str, input: &[u8]) -> bool {
        let filtered = CURSOR_REPORT.replace_all(input, &b""[..]);
        if filtered.is_empty() {
            return false;
        }
        self.send_data(tab_id, &filtered)
    }

    pub fn send_resize(&self, tab_id: &str, cols: u16, rows: u16) -> bool {
        let state = self.lock();
        match state.sockets.get(tab_id) {
            Some(socket) if socket.is_open() => socket
                .outbound
                .send(Outbound::Text(ControlFrame::resize(cols, rows).to_json()))
                .is_ok(),
            _ => false,
        }
    }

    /// Ctrl-C, then the template's start command after a pause.
    pub fn restart_server(&self, tab_id: &str) -> bool {
        let Some(command) = self.inner.target.template.start_command() else {
            return false;
        };
        if !self.send_data(tab_id, b"\x03") {
            return false;
        }
        let mux = self.clone();
        let tab_id = tab_id.to_string();
        let delay = self.inner.target.restart_delay;
        tokio::spawn(async move {
            sleep(delay).await;
            mux.send_data(&tab_id, format!("{command}\n").as_bytes());
        });
        true
    }

    /// Connect every desired tab that has no socket and close every socket
    /// whose tab is gone. Sockets of surviving tabs are left alone. A removed
    /// tab's history and renderer are dropped too.
    pub fn reconcile(&self, tabs: &[TerminalTab]) {
        let desired: HashSet<&str> = tabs.iter().map(|tab| tab.id.as_str()).collect();
        for tab in tabs {
            self.connect(&tab.id, tab.is_main());
        }
        let stale: Vec<(String, TabSocket)> = {
            let mut state = self.lock();
            let ids: Vec<String> = state
                .sockets
                .keys()
                .filter(|id| !desired.contains(id.as_str()))
                .cloned()
                .collect();
            state.views.retain(|id, _| desired.contains(id.as_str()));
            ids.into_iter()
                .filter_map(|id| state.sockets.remove(&id).map(|socket| (id, socket)))
                .collect()
        };
        for (tab_id, socket) in stale {
            tracing::info!(term_id = %tab_id, "Closing socket for removed tab");
            socket.shutdown();
        }
    }

    pub fn close(&self, tab_id: &str) -> bool {
        let socket = self.lock().sockets.remove(tab_id);
        match socket {
            Some(socket) => {
                socket.shutdown();
                true
            }
            None => false,
        }
    }

    pub fn close_all(&self) {
        let sockets: Vec<TabSocket> = self.lock().sockets.drain().map(|(_, s)| s).collect();
        for socket in sockets {
            socket.shutdown();
        }
        self.inner.connectivity.send_replace(false);
    }

    /// Attach `renderer` to a tab, seeding it with the full history first.
    /// Returns the renderer it replaced, if any.
    pub fn attach_renderer(
        &self,
        tab_id: &str,
        renderer: Box<dyn Renderer>,
    ) -> Option<Box<dyn Renderer>> {
        let mut state = self.lock();
        let view = state.view(tab_id, &self.inner.target);
        let previous = view.renderer.replace(renderer);
        view.replay();
        previous
    }

    pub fn detach_renderer(&self, tab_id: &str) -> Option<Box<dyn Renderer>> {
        let mut state = self.lock();
        state
            .views
            .get_mut(tab_id)
            .and_then(|view| view.renderer.take())
    }

    /// Re-seed the attached renderer when `signal` is newer than the last one
    /// seen for this tab. Returns whether a replay happened.
    pub fn refresh(&self, tab_id: &str, signal: u64) -> bool {
        let mut state = self.lock();
        let view = state.view(tab_id, &self.inner.target);
        if signal <= view.last_refresh {
            return false;
        }
        view.last_refresh = signal;
        if view.renderer.is_none() {
            return false;
        }
        view.replay();
        true
    }

    pub fn history(&self, tab_id: &str) -> Vec<u8> {
        let state = self.lock();
        state
            .views
            .get(tab_id)
            .map(|view| view.history.snapshot())
            .unwrap_or_default()
    }

    pub fn is_open(&self, tab_id: &str) -> bool {
        let state = self.lock();
        state.sockets.get(tab_id).is_some_and(TabSocket::is_open)
    }

    pub fn live_tabs(&self) -> Vec<String> {
        let state = self.lock();
        let mut ids: Vec<String> = state.sockets.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.inner.connectivity.subscribe()
    }

    pub fn subscribe_tab(&self, tab_id: &str) -> Option<watch::Receiver<TabLink>> {
        let state = self.lock();
        state.sockets.get(tab_id).map(|socket| socket.link.subscribe())
    }
}
