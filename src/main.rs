use anyhow::{Context, Result};
use clap::Parser;
use crossterm::event::{self, Event, KeyEventKind};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

mod actions;
mod app;
mod config;
mod error;
mod logging;
mod session;
mod stream;
mod transport;
mod view;

use actions::Action;
use app::App;
use config::Config;
use logging::{LogConfig, LogLevel};
use session::{SessionClient, SessionManager};
use transport::ProcessTransport;
use view::TerminalView;

const TICK: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
#[command(name = "shelldeck", version, about = "Manage remote and local shell sessions")]
struct Cli {
    /// Config file (JSON); defaults to <config dir>/shelldeck/config.json
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log file; defaults to <data dir>/shelldeck/shelldeck.log
    #[arg(long)]
    log_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _log_guard = logging::init(&LogConfig {
        level: cli.log_level,
        file: cli.log_file.clone(),
    })
    .context("Failed to initialize logging")?;

    let config = Arc::new(
        Config::load(cli.config.as_deref()).context("Failed to load configuration")?,
    );
    info!(sessions = config.sessions.len(), "starting shelldeck");

    // Session core
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let transport = Arc::new(ProcessTransport::new(config.transport.clone(), event_tx));
    let view = Arc::new(TerminalView::new());
    let (client, manager) =
        SessionManager::spawn(config.clone(), transport, view.clone(), event_rx);

    // Create event channel
    let (tx, mut rx) = mpsc::unbounded_channel::<Action>();

    for spec in config.sessions.iter().cloned() {
        dispatch(&client, Action::OpenSession(spec), &tx);
    }

    // Initialize terminal
    let mut terminal = ratatui::init();

    // Spawn input handler
    let input_tx = tx.clone();
    tokio::task::spawn_blocking(move || {
        while !input_tx.is_closed() {
            if event::poll(Duration::from_millis(100)).unwrap_or(false) {
                if let Ok(Event::Key(key)) = event::read() {
                    if key.kind == KeyEventKind::Press {
                        let _ = input_tx.send(Action::KeyPress(key));
                    }
                }
            }
        }
    });

    // Forward session list changes
    let mut updates = client.subscribe();
    let sessions_tx = tx.clone();
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let sessions = updates.borrow_and_update().clone();
            if sessions_tx.send(Action::SessionsUpdated(sessions)).is_err() {
                break;
            }
        }
    });

    // Redraw ticker so streamed output shows up
    let tick_tx = tx.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(TICK);
        loop {
            tick.tick().await;
            if tick_tx.send(Action::Tick).is_err() {
                break;
            }
        }
    });

    let mut app = App::new(view);

    // Main event loop
    let result = loop {
        if let Err(e) = terminal.draw(|f| app.render(f)) {
            break Err(e.into());
        }

        for pending_action in app.take_pending_actions() {
            dispatch(&client, pending_action, &tx);
        }

        match rx.recv().await {
            Some(action) => match app.handle_action(action) {
                Ok(true) => break Ok(()),
                Ok(false) => {}
                Err(e) => break Err(e),
            },
            None => break Ok(()),
        }
    };

    // Restore terminal
    ratatui::restore();

    // Dropping the last client stops the manager, which closes every channel
    drop(client);
    if tokio::time::timeout(Duration::from_secs(2), manager)
        .await
        .is_err()
    {
        warn!("session manager did not stop in time");
    }
    info!("exiting");
    result
}

/// Hand an app action to the session manager; failures come back as errors
fn dispatch(client: &SessionClient, action: Action, tx: &mpsc::UnboundedSender<Action>) {
    let immediate = match action {
        Action::SendInput(id, data) => Some(client.send_input(id, data)),
        Action::ResizeSession(id, cols, rows) => Some(client.resize(id, cols, rows)),
        other => {
            let client = client.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = match other {
                    Action::OpenSession(spec) => client.open(spec).await.map(|_| ()),
                    Action::RetrySession(id) => client.retry(id).await,
                    Action::CancelReconnect(id) => client.cancel_reconnect(id).await,
                    Action::DisconnectSession(id) => client.disconnect(id).await,
                    Action::RemoveSession(id) => client.remove(id).await,
                    Action::RenameSession(id, label) => client.rename(id, label).await,
                    _ => Ok(()),
                };
                if let Err(e) = result {
                    warn!("command failed: {}", e);
                    let _ = tx.send(Action::Error(e.to_string()));
                }
            });
            None
        }
    };
    if let Some(Err(e)) = immediate {
        let _ = tx.send(Action::Error(e.to_string()));
    }
}
