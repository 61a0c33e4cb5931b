use clap::Parser;
use crossterm::terminal::{disable_raw_mode, enable_raw_mode};
use std::io::{IsTerminal, Write};
use std::time::Duration;
use termrelay::client::{
    ChannelRenderer, ClientTarget, ConnectivityLink, LocalTerminal, MAIN_TAB_ID,
    TerminalMultiplexer, drive_tab,
};
use termrelay::config::{self, AttachArgs, Cli, Command, EdgeArgs, ServeArgs};
use termrelay::error::{ApiError, ErrorCode, RelayResult};
use termrelay::router::{EdgeState, edge_router};
use termrelay::server::{ServiceState, serve_until, service_router};
use termrelay::session::SessionManager;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Serve(args) => run_serve(args).await?,
        Command::Edge(args) => run_edge(args).await?,
        Command::Attach(args) => run_attach(args).await?,
    }
    Ok(())
}

async fn run_serve(args: ServeArgs) -> RelayResult<()> {
    let mut config = config::Config::load(args.config.as_deref())?;
    config.apply_serve_args(&args);
    init_logging(&config.logging);
    tracing::info!(version = termrelay::version::VERSION, "Starting session service");

    let manager = SessionManager::with_docker(config.session.clone());
    let state = ServiceState {
        manager: manager.clone(),
        public_ws_base: config.service.public_ws_base.clone(),
    };
    let result = serve_until(
        &config.service.listen,
        service_router(state),
        shutdown_signal(),
    )
    .await;
    manager.shutdown().await;
    tracing::info!("Session service stopped");
    result
}

async fn run_edge(args: EdgeArgs) -> RelayResult<()> {
    let mut config = config::Config::load(args.config.as_deref())?;
    config.apply_edge_args(&args);
    init_logging(&config.logging);
    tracing::info!(
        version = termrelay::version::VERSION,
        upstream = %config.edge.upstream,
        "Starting edge router"
    );

    let router = edge_router(EdgeState::new(config.edge.upstream.clone()));
    serve_until(&config.edge.listen, router, shutdown_signal()).await
}

async fn run_attach(args: AttachArgs) -> RelayResult<()> {
    let mut config = config::Config::load(args.config.as_deref())?;
    config.apply_attach_args(&args);
    init_logging(&config.logging);

    let term_id = args.term_id.clone();
    let target = ClientTarget::from_config(
        &config.client,
        args.user_id.clone(),
        args.container_id.clone(),
    );
    let mux = TerminalMultiplexer::new(target);
    let _status_link = config.client.status_url.clone().map(|url| {
        ConnectivityLink::spawn(url, Duration::from_millis(config.client.reconnect_delay_ms))
    });

    let (renderer, drawn) = ChannelRenderer::new();
    let stdout_writer = spawn_stdout_writer(drawn);
    mux.attach_renderer(&term_id, Box::new(renderer));
    if !mux.connect(&term_id, term_id == MAIN_TAB_ID) {
        return Err(ApiError::new(
            ErrorCode::NoTargetContainer,
            "A container id is required to attach",
        )
        .into());
    }

    let interactive = std::io::stdin().is_terminal();
    let _raw_mode = if interactive {
        Some(RawModeGuard::enable()?)
    } else {
        None
    };
    let local = LocalTerminal {
        input: spawn_stdin_reader(),
        resizes: spawn_resize_watcher()?,
        interactive,
    };
    let result = drive_tab(&mux, &term_id, local, window_size()).await;

    mux.close_all();
    // Let the writer flush whatever arrived last before the process exits.
    drop(mux.detach_renderer(&term_id));
    let _ = tokio::task::spawn_blocking(move || stdout_writer.join()).await;
    result
}

fn init_logging(logging: &config::LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::new(logging.level.clone());
    if logging.format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

async fn shutdown_signal() {
    let terminate = async {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = terminate => {}
    }
    tracing::info!("Shutdown requested");
}

/// Drawing happens on its own thread so a slow terminal never holds up the
/// socket tasks.
fn spawn_stdout_writer(
    mut drawn: mpsc::UnboundedReceiver<Vec<u8>>,
) -> std::thread::JoinHandle<()> {
    std::thread::spawn(move || {
        while let Some(bytes) = drawn.blocking_recv() {
            let mut stdout = std::io::stdout().lock();
            if stdout.write_all(&bytes).and_then(|_| stdout.flush()).is_err() {
                break;
            }
        }
    })
}

fn spawn_stdin_reader() -> mpsc::Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        use std::io::Read;
        let mut stdin = std::io::stdin().lock();
        let mut buffer = [0u8; 1024];
        loop {
            match stdin.read(&mut buffer) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if tx.blocking_send(buffer[..n].to_vec()).is_err() {
                        break;
                    }
                }
            }
        }
    });
    rx
}

fn spawn_resize_watcher() -> std::io::Result<mpsc::Receiver<(u16, u16)>> {
    let mut window_changes = signal(SignalKind::window_change())?;
    let (tx, rx) = mpsc::channel(8);
    tokio::spawn(async move {
        while window_changes.recv().await.is_some() {
            if let Some(size) = window_size()
                && tx.send(size).await.is_err()
            {
                break;
            }
        }
    });
    Ok(rx)
}

fn window_size() -> Option<(u16, u16)> {
    crossterm::terminal::size()
        .ok()
        .filter(|(cols, rows)| *cols > 0 && *rows > 0)
}

/// Raw mode for the lifetime of the guard.
struct RawModeGuard;

impl RawModeGuard {
    fn enable() -> std::io::Result<Self> {
        enable_raw_mode()?;
        Ok(Self)
    }
}

impl Drop for RawModeGuard {
    fn drop(&mut self) {
        if let Err(err) = disable_raw_mode() {
            tracing::warn!(error = %err, "Failed to restore terminal mode");
        }
    }
}
