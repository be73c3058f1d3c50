use clap::{Parser, Subcommand};
use lib::config::ChatOptions;
use lib::conversation::{Conversation, ConversationItem};
use lib::llm::OllamaBackend;
use lib::turn::{MetadataNotice, TurnCoordinator};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "parley")]
#[command(about = "Parley CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config, conversations directory).
    Init {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Chat interactively. Streams responses, extracts conversation metadata after each turn, and saves to the conversations directory.
    Chat {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Resume a saved conversation by file name (see `parley list`).
        #[arg(long, value_name = "FILE")]
        resume: Option<String>,

        /// Override the chat model for this session.
        #[arg(long, value_name = "MODEL")]
        model: Option<String>,
    },

    /// List saved conversations (most recently edited first).
    List {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// List models available on the Ollama backend.
    Models {
        /// Config file path (default: PARLEY_CONFIG_PATH or ~/.parley/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("parley {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            resume,
            model,
        }) => {
            if let Err(e) = run_chat(config, resume, model).await {
                log::error!("chat failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::List { config }) => {
            if let Err(e) = run_list(config).await {
                log::error!("list failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Models { config }) => {
            if let Err(e) = run_models(config).await {
                log::error!("models failed: {}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(lib::config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    resume: Option<String>,
    model: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (mut config, path) = lib::config::load_config(config_path)?;
    if let Some(m) = model {
        config.backends.chat_model = Some(m);
    }
    let options = ChatOptions::from_config(&config, &path);
    let base_url = config.backends.base_url.clone();
    let completion = OllamaBackend::new(base_url.clone(), lib::config::resolve_chat_model(&config));
    let extraction = OllamaBackend::new(base_url, lib::config::resolve_extraction_model(&config));

    let (notify_tx, mut notify_rx) = mpsc::unbounded_channel();
    let coordinator =
        TurnCoordinator::new(completion, extraction, options).with_notifications(notify_tx);

    let mut conversation = match resume {
        Some(filename) => coordinator.load_conversation(&filename).await?,
        None => Conversation::new(),
    };
    println!("{}", conversation.title);
    println!("/new starts a fresh conversation, /refresh re-derives its title, /exit quits");

    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/new") {
            coordinator.request_history_reset();
            conversation = Conversation::new();
            println!("{}", conversation.title);
            continue;
        }
        if input.eq_ignore_ascii_case("/refresh") {
            coordinator.refresh_metadata(&mut conversation).await;
            drain_notices(&mut notify_rx, &conversation);
            continue;
        }

        let mut on_fragment = |s: &str| {
            print!("{}", s);
            let _ = io::stdout().flush();
        };
        match coordinator
            .execute_turn(input, &mut conversation, Some(&mut on_fragment))
            .await
        {
            Ok(response) => {
                println!();
                // The coordinator records only the utterance; the display
                // layer owns the response item and saves it.
                conversation.push_item(ConversationItem::response(response));
                if let Err(e) = coordinator.save_conversation(&conversation).await {
                    log::warn!("saving response failed: {}", e);
                }
            }
            Err(e) => {
                eprintln!("turn error: {}", e);
            }
        }
    }

    Ok(())
}

fn drain_notices(
    rx: &mut mpsc::UnboundedReceiver<MetadataNotice>,
    conversation: &Conversation,
) {
    while let Ok(notice) = rx.try_recv() {
        match notice {
            MetadataNotice::Refreshed(_) => {
                println!("{}", conversation.title);
                if let Some(summary) = &conversation.summary {
                    println!("  {}", summary);
                }
            }
            MetadataNotice::Failed(e) => {
                eprintln!("metadata refresh failed: {}", e);
            }
        }
    }
}

async fn run_list(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, path) = lib::config::load_config(config_path)?;
    let base_path = lib::config::resolve_base_path(&config, &path);
    let conversations = lib::store::list_conversations(&base_path).await?;
    if conversations.is_empty() {
        println!("no saved conversations in {}", base_path.display());
        return Ok(());
    }
    for c in conversations {
        println!(
            "{}.json  {}  ({} items, edited {})",
            c.id,
            c.title,
            c.items.len(),
            c.date_last_edited.format("%Y-%m-%d %H:%M")
        );
    }
    Ok(())
}

async fn run_models(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let (config, _path) = lib::config::load_config(config_path)?;
    let backend = OllamaBackend::new(
        config.backends.base_url.clone(),
        lib::config::resolve_chat_model(&config),
    );
    for model in backend.list_models().await? {
        println!("{}", model.name);
    }
    Ok(())
}
