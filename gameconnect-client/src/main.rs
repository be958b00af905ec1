use std::{
    fs::{File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use clap::{Parser, Subcommand};
use gameconnect_client::{
    ChatEvents, ClientConfig, ConnectionManager, ConnectionStatus, ConversationHandlers,
    CredentialProvider, FileCredentialStore, Phase, UserRecord,
    config::load_config_from_path,
    credentials::{StoredCredentials, save_credentials_to_path},
    validate_token,
};
use gameconnect_core::{ChatId, ChatMessage, ChatNotification, ChatSummary, ReadReceipt, UserId};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::MakeWriter;

#[derive(Parser, Debug)]
#[command(name = "gameconnect-chat")]
struct ChatArgs {
    /// JSON client configuration; every field is optional.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    server_url: Option<String>,
    #[arg(long, default_value = "gameconnect-credentials.json")]
    credentials: PathBuf,
    /// Overrides the user id stored with the credentials.
    #[arg(long)]
    user_id: Option<UserId>,
    #[arg(long)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: ChatCommand,
}

#[derive(Subcommand, Debug)]
enum ChatCommand {
    /// Store a token and user identity for later commands.
    SaveSession {
        #[arg(long)]
        token: String,
        #[arg(long)]
        user_id: UserId,
        #[arg(long, default_value = "")]
        username: String,
        #[arg(long, default_value = "")]
        email: String,
    },
    /// Print the user's chats.
    Chats,
    /// Print the message history of one chat.
    History { chat_id: ChatId },
    Send { chat_id: ChatId, text: String },
    /// Stay connected and print activity until Ctrl+C.
    Watch {
        #[arg(long = "chat")]
        chats: Vec<ChatId>,
    },
}

#[derive(Clone)]
struct FileMakeWriter {
    file: Arc<Mutex<File>>,
}

struct FileWriterGuard {
    file: Arc<Mutex<File>>,
}

impl Write for FileWriterGuard {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        let mut locked = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        locked.flush()
    }
}

impl<'a> MakeWriter<'a> for FileMakeWriter {
    type Writer = FileWriterGuard;

    fn make_writer(&'a self) -> Self::Writer {
        FileWriterGuard {
            file: Arc::clone(&self.file),
        }
    }
}

fn init_logging(log_file: Option<&Path>) {
    let env_filter = tracing_subscriber::EnvFilter::from_default_env();

    let Some(log_path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_writer(io::stderr)
            .init();
        return;
    };

    let file = match OpenOptions::new().create(true).append(true).open(log_path) {
        Ok(file) => file,
        Err(err) => {
            eprintln!("failed to open log file {}: {err}", log_path.display());
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .with_writer(io::stderr)
                .init();
            return;
        }
    };

    let make_writer = FileMakeWriter {
        file: Arc::new(Mutex::new(file)),
    };

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(make_writer)
        .with_ansi(false)
        .init();
}

fn load_config(args: &ChatArgs) -> Result<ClientConfig, String> {
    let mut config = match &args.config {
        Some(path) => load_config_from_path(path)
            .map_err(|err| format!("config {}: {err}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(server_url) = &args.server_url {
        config.ws_url = server_url.clone();
    }
    Ok(config)
}

/// Prints global activity for `watch`.
struct ConsoleSink;

impl ChatEvents for ConsoleSink {
    fn on_chat_list(&self, chats: &[ChatSummary]) {
        println!("-- {} chats", chats.len());
    }

    fn on_chat_created(&self, chat: &ChatSummary) {
        println!("-- new chat {} {}", chat.chat_id, chat.name.as_deref().unwrap_or(""));
    }

    fn on_notification(&self, notification: &ChatNotification) {
        println!(
            "[chat {}] {}: {}",
            notification.chat_id, notification.sender_name, notification.preview
        );
    }

    fn on_status(&self, status: &ConnectionStatus) {
        match &status.last_error {
            Some(err) if status.phase != Phase::Connected => {
                println!("-- {} ({})", status.phase.label(), err.user_summary());
            }
            _ => println!("-- {}", status.phase.label()),
        }
    }
}

fn print_message(message: &ChatMessage) {
    println!(
        "[chat {}] {} {}: {}",
        message.chat_id,
        message.sent_at.as_deref().unwrap_or("-"),
        message.username,
        message.content
    );
}

fn save_session(path: &Path, token: String, user: UserRecord) -> Result<(), String> {
    if !validate_token(&token) {
        return Err("token is too short".to_owned());
    }
    let stored = StoredCredentials {
        token: Some(token),
        user: Some(user),
    };
    save_credentials_to_path(path, &stored)
        .map_err(|err| format!("credentials {}: {err}", path.display()))?;
    info!(path = %path.display(), "session saved");
    Ok(())
}

async fn run(args: ChatArgs) -> Result<(), String> {
    if let ChatCommand::SaveSession {
        token,
        user_id,
        username,
        email,
    } = args.command
    {
        return save_session(
            &args.credentials,
            token,
            UserRecord {
                id: user_id,
                username,
                email,
            },
        );
    }

    let config = load_config(&args)?;
    let store = FileCredentialStore::new(args.credentials.clone());
    let session = store.session().ok_or_else(|| {
        format!(
            "no session in {}; run save-session first",
            args.credentials.display()
        )
    })?;
    let user_id = args.user_id.unwrap_or(session.user.id);

    let manager = ConnectionManager::new(config);
    let events: Option<Arc<dyn ChatEvents>> = match args.command {
        ChatCommand::Watch { .. } => Some(Arc::new(ConsoleSink)),
        _ => None,
    };
    manager
        .connect(user_id, Arc::new(store), events)
        .await
        .map_err(|err| format!("connect failed: {err}"))?;

    let result = match args.command {
        ChatCommand::SaveSession { .. } => Ok(()),
        ChatCommand::Chats => match manager.request_conversation_list().await {
            Ok(chats) => {
                for chat in chats {
                    println!(
                        "{:>6}  {:<24} unread {}",
                        chat.chat_id,
                        chat.name.as_deref().unwrap_or("(private)"),
                        chat.unread_count.unwrap_or(0)
                    );
                }
                Ok(())
            }
            Err(err) => Err(format!("chat list: {err}")),
        },
        ChatCommand::History { chat_id } => {
            match manager.request_conversation_history(chat_id).await {
                Ok(messages) => {
                    messages.iter().for_each(print_message);
                    Ok(())
                }
                Err(err) => Err(format!("history: {err}")),
            }
        }
        ChatCommand::Send { chat_id, text } => {
            if manager.send_message(chat_id, text) {
                Ok(())
            } else {
                Err("message not sent: offline".to_owned())
            }
        }
        ChatCommand::Watch { chats } => {
            for chat_id in chats {
                manager.subscribe_to_conversation(
                    chat_id,
                    ConversationHandlers::new(print_message, |receipt: &ReadReceipt| {
                        println!(
                            "[chat {}] read by {} ({} messages)",
                            receipt.chat_id,
                            receipt.reader_name.as_deref().unwrap_or("?"),
                            receipt.message_ids.len()
                        );
                    }),
                );
            }
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!("ctrl-c handler failed: {err}");
            }
            Ok(())
        }
    };

    manager.disconnect().await;
    result
}

#[tokio::main]
async fn main() {
    let args = ChatArgs::parse();
    init_logging(args.log_file.as_deref());

    if let Err(err) = run(args).await {
        error!("{err}");
        eprintln!("{err}");
        std::process::exit(1);
    }
}
