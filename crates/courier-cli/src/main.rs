use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use dc_core::paths::{client_store_path, keys_dir};
use dc_core::{
    dispatch, spawn_client, tls, ClientConfig, ClientEvent, ClientHandle, ClientRuntime, DirKeyFileStore,
    Notifier, RefreshCoalescer,
};
use dc_proto::validate_username;
use dc_store::Store;

mod console;

use crate::console::{parse_line, Console, Input, HELP};

#[derive(Parser, Debug)]
#[command(author, version, about = "Darklock Courier terminal client", long_about = None)]
struct Cli {
    /// JSON config file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create an account and its key pair
    Register {
        #[arg(long)]
        username: String,
    },
    /// Log in and chat
    Chat {
        #[arg(long)]
        username: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.data_dir = Some(dir);
    }
    match cli.command {
        Commands::Register { username } => register_command(&config, &username).await,
        Commands::Chat { username } => chat_command(&config, &username).await,
    }
}

struct Local {
    store: Arc<Store>,
    keys: Arc<DirKeyFileStore>,
}

fn open_local(config: &ClientConfig, username: &str) -> Result<Local> {
    validate_username(username).map_err(|e| anyhow!("invalid username: {e}"))?;
    let data = config.data_dir()?;
    std::fs::create_dir_all(&data).with_context(|| format!("creating {}", data.display()))?;
    Ok(Local {
        store: Arc::new(Store::open(&client_store_path(&data, username))?),
        keys: Arc::new(DirKeyFileStore::new(keys_dir(&data))),
    })
}

async fn connect(config: &ClientConfig, local: &Local) -> Result<ClientRuntime> {
    let stream = tls::connect(config).await?;
    Ok(spawn_client(stream, Arc::clone(&local.store), local.keys.clone(), &config.timeouts))
}

async fn register_command(config: &ClientConfig, username: &str) -> Result<()> {
    let local = open_local(config, username)?;
    let password = prompt_password_twice("Choose a password: ")?;
    let mut rt = connect(config, &local).await?;
    rt.handle.register(username, &password).await?;

    let console = Console::new(Arc::clone(&local.store));
    let outcome = loop {
        let Some(event) = rt.events.recv().await else {
            bail!("connection closed before the server answered");
        };
        match event {
            ClientEvent::Registered { .. } => break Ok(()),
            ClientEvent::RegisterFailed { reason } => break Err(anyhow!("registration failed: {reason}")),
            ClientEvent::Disconnected { reason } => break Err(anyhow!("disconnected: {reason}")),
            other => dispatch(&other, &console),
        }
    };
    let _ = rt.handle.disconnect().await;
    outcome?;
    println!("registered {username}; run `courier-cli chat --username {username}` to log in");
    Ok(())
}

async fn chat_command(config: &ClientConfig, username: &str) -> Result<()> {
    let local = open_local(config, username)?;
    let password = prompt_password_once("Password: ")?;
    let ClientRuntime { handle, mut events, refresh, task } = connect(config, &local).await?;
    handle.login(username, &password).await?;
    drop(password);

    let console = Arc::new(Console::new(Arc::clone(&local.store)));
    loop {
        let Some(event) = events.recv().await else {
            bail!("connection closed before the server answered");
        };
        match &event {
            ClientEvent::LoggedIn { .. } => {
                dispatch(&event, console.as_ref());
                break;
            }
            ClientEvent::LoginFailed { reason } => bail!("login failed: {reason}"),
            ClientEvent::Disconnected { reason } => bail!("disconnected: {reason}"),
            _ => dispatch(&event, console.as_ref()),
        }
    }

    let event_task = {
        let console = Arc::clone(&console);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let done = matches!(event, ClientEvent::Disconnected { .. });
                dispatch(&event, console.as_ref());
                if done {
                    break;
                }
            }
        })
    };
    let refresh_task = tokio::spawn(redraw_loop(
        refresh,
        handle.clone(),
        Arc::clone(&console),
        username.to_string(),
    ));

    let result = input_loop(&handle, &console, username, event_task).await;
    let _ = handle.disconnect().await;
    refresh_task.abort();
    let _ = task.await;
    result
}

/// Redraw each conversation that changed, one batch at a time.
async fn redraw_loop(refresh: Arc<RefreshCoalescer>, handle: ClientHandle, console: Arc<Console>, me: String) {
    loop {
        for peer in refresh.next_batch().await {
            match handle.read_thread(&peer).await {
                Ok(entries) => {
                    console.notify_thread_changed(&peer);
                    console.print_thread(&me, &peer, &entries);
                }
                Err(e) => {
                    tracing::debug!(peer = %peer, error = %e, "redraw stopped");
                    return;
                }
            }
        }
    }
}

async fn input_loop(
    handle: &ClientHandle,
    console: &Console,
    me: &str,
    mut event_task: tokio::task::JoinHandle<()>,
) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut selected: Option<String> = None;
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut event_task => return Ok(()),
        };
        let Some(line) = line else {
            return Ok(());
        };
        match parse_line(&line) {
            Input::Empty => {}
            Input::Help => println!("{HELP}"),
            Input::Quit => return Ok(()),
            Input::Lookup(user) => handle.lookup_user(&user).await?,
            Input::Select(user) => {
                handle.select_peer(Some(&user)).await?;
                println!("-- talking to {user}");
                selected = Some(user);
            }
            Input::Thread(peer) => match peer.or_else(|| selected.clone()) {
                Some(peer) => match handle.read_thread(&peer).await {
                    Ok(entries) => console.print_thread(me, &peer, &entries),
                    Err(e) => eprintln!("! {e}"),
                },
                None => eprintln!("! pick a conversation with /to <user> first"),
            },
            Input::Contacts => console.notify_contacts_changed(),
            Input::Status => {
                let snap = handle.snapshot().await?;
                println!(
                    "* {} | {} blocks | {} failed | peer: {}",
                    snap.user.as_deref().unwrap_or("-"),
                    snap.blocks,
                    snap.failed_message_count,
                    snap.selected_peer.as_deref().unwrap_or("-"),
                );
            }
            Input::Say(text) => match &selected {
                Some(peer) => handle.send_message(peer, &text).await?,
                None => eprintln!("! pick a conversation with /to <user> first"),
            },
            Input::Unknown(text) => eprintln!("! unknown command {text}; {HELP}"),
        }
    }
}

fn prompt_password_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("COURIER_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    if pw.is_empty() {
        bail!("password must not be empty");
    }
    Ok(Zeroizing::new(pw))
}

fn prompt_password_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("COURIER_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = prompt_password_once(prompt)?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm password: ").map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if *first != *second {
        bail!("passwords do not match");
    }
    Ok(first)
}
