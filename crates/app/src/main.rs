use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};
use ragchat_core::{
    AppConfig, AppContext, ChatSession, ContextError, IngestError, RegistryError, RetrievalError,
    SessionError, StoreError,
};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const CONNECTION_HINT: &str =
    "check that PostgreSQL is reachable with the DB_* settings and that Ollama is running, then retry";

#[derive(Parser, Debug)]
#[command(name = "ragchat", version, about = "Chat with your documents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Command {
    /// Ingest every .txt and .md file under a folder.
    Ingest {
        /// Folder scanned recursively.
        #[arg(default_value = "./data")]
        datapath: PathBuf,
    },
    /// Add a single document to the knowledge base.
    Upload {
        file: PathBuf,
    },
    /// List the documents in the knowledge base.
    List,
    /// Remove a document and all of its chunks.
    Delete {
        id: String,
        /// Show the chunks that would be removed without removing them.
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    /// Ask one question and print the cited answer.
    Ask {
        question: String,
    },
    /// Interactive chat. Lines starting with `/` are commands.
    Chat,
}

#[derive(Debug, PartialEq, Eq)]
enum ReplCommand {
    Add(PathBuf),
    List,
    Delete(String),
    Quit,
    Help,
    Ask(String),
    Empty,
}

fn parse_repl_line(line: &str) -> ReplCommand {
    let line = line.trim();
    if line.is_empty() {
        return ReplCommand::Empty;
    }
    let Some(command) = line.strip_prefix('/') else {
        return ReplCommand::Ask(line.to_string());
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (command, ""),
    };
    match (name, argument) {
        ("add", path) if !path.is_empty() => ReplCommand::Add(PathBuf::from(path)),
        ("list", _) => ReplCommand::List,
        ("delete", id) if !id.is_empty() => ReplCommand::Delete(id.to_string()),
        ("quit" | "exit", _) => ReplCommand::Quit,
        _ => ReplCommand::Help,
    }
}

fn is_unreachable(error: &StoreError) -> bool {
    error.is_connection()
}

fn with_hint<E>(error: E, hinted: bool) -> anyhow::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    if hinted {
        anyhow::anyhow!("{error}; {CONNECTION_HINT}")
    } else {
        anyhow::Error::new(error)
    }
}

fn describe_ingest(error: IngestError) -> anyhow::Error {
    let hinted = match &error {
        IngestError::Store(store) => is_unreachable(store),
        IngestError::Embedding { .. } => true,
        _ => false,
    };
    with_hint(error, hinted)
}

fn describe_registry(error: RegistryError) -> anyhow::Error {
    let hinted = matches!(&error, RegistryError::Store(store) if is_unreachable(store));
    with_hint(error, hinted)
}

fn describe_retrieval(error: RetrievalError) -> anyhow::Error {
    let hinted = match &error {
        RetrievalError::Store(store) => is_unreachable(store),
        RetrievalError::Embedding(_)
        | RetrievalError::Generation(_)
        | RetrievalError::Timeout { .. } => true,
        _ => false,
    };
    with_hint(error, hinted)
}

fn describe_session(error: SessionError) -> anyhow::Error {
    match error {
        SessionError::Retrieval(inner) => describe_retrieval(inner),
        busy @ SessionError::Busy => anyhow::Error::new(busy),
    }
}

fn describe_context(error: ContextError) -> anyhow::Error {
    let hinted = matches!(&error, ContextError::Store(store) if is_unreachable(store));
    with_hint(error, hinted)
}

async fn ingest(context: &AppContext, datapath: &Path) -> anyhow::Result<()> {
    let report = context
        .ingest_directory(datapath)
        .await
        .map_err(describe_ingest)?;

    for skipped in &report.skipped {
        warn!(path = %skipped.path.display(), reason = %skipped.reason, "skipped file");
    }
    if report.documents == 0 && report.skipped.is_empty() {
        println!("no documents found in {}", datapath.display());
        return Ok(());
    }
    println!(
        "{} documents ingested ({} chunks, {} skipped) at {}",
        report.documents,
        report.chunks,
        report.skipped.len(),
        Utc::now().to_rfc3339()
    );
    Ok(())
}

async fn upload(context: &AppContext, file: &Path) -> anyhow::Result<()> {
    let name = file
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .with_context(|| format!("{} has no file name", file.display()))?;
    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("failed to read {}", file.display()))?;

    let chunks = context.upload(&name, &bytes).await.map_err(describe_ingest)?;
    println!("{name}: {chunks} chunks stored");
    Ok(())
}

async fn list(context: &AppContext) -> anyhow::Result<()> {
    let documents = context.list_documents().await.map_err(describe_registry)?;
    if documents.is_empty() {
        println!("no documents");
    }
    for document in documents {
        println!("{document}");
    }
    Ok(())
}

async fn delete(context: &AppContext, id: &str, dry_run: bool) -> anyhow::Result<()> {
    if dry_run {
        let chunk_ids = context.registry().chunk_ids(id).await.map_err(describe_registry)?;
        println!("{id}: {} chunks would be removed", chunk_ids.len());
        for chunk_id in chunk_ids {
            println!("  {chunk_id}");
        }
        return Ok(());
    }

    let removed = context.delete_document(id).await.map_err(describe_registry)?;
    println!("{id}: removed {removed} chunks");
    Ok(())
}

fn print_fragment(fragment: &str) {
    print!("{fragment}");
    // Best effort; a closed stdout surfaces on the next println.
    let _ = std::io::stdout().flush();
}

async fn ask(context: &AppContext, session: &mut ChatSession, question: &str) -> anyhow::Result<()> {
    session
        .ask(context.engine(), question, print_fragment)
        .await
        .map_err(describe_session)?;
    println!();
    Ok(())
}

async fn chat(context: &AppContext) -> anyhow::Result<()> {
    let mut session = context.new_session();
    info!(session_id = %session.id(), "chat session started");
    if let Some(greeting) = session.history().first() {
        println!("{}", greeting.content);
    }
    println!("Commands: /add <file>, /list, /delete <id>, /quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print_fragment("> ");
        let Some(line) = lines.next_line().await.context("failed to read stdin")? else {
            break;
        };

        let outcome = match parse_repl_line(&line) {
            ReplCommand::Empty => Ok(()),
            ReplCommand::Quit => break,
            ReplCommand::Help => {
                println!("Commands: /add <file>, /list, /delete <id>, /quit");
                Ok(())
            }
            ReplCommand::Add(path) => upload(context, &path).await,
            ReplCommand::List => list(context).await,
            ReplCommand::Delete(id) => delete(context, &id, false).await,
            ReplCommand::Ask(question) => ask(context, &mut session, &question).await,
        };

        // The conversation survives a failed turn.
        if let Err(error) = outcome {
            println!();
            eprintln!("error: {error:#}");
        }
    }
    Ok(())
}

async fn run(context: &AppContext, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Ingest { datapath } => ingest(context, &datapath).await,
        Command::Upload { file } => upload(context, &file).await,
        Command::List => list(context).await,
        Command::Delete { id, dry_run } => delete(context, &id, dry_run).await,
        Command::Ask { question } => {
            let mut session = ChatSession::new();
            ask(context, &mut session, &question).await
        }
        Command::Chat => chat(context).await,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_version = env!("CARGO_PKG_VERSION");

    // A missing .env file is fine; the variables may come from the shell.
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let config = AppConfig::from_env().context("invalid configuration")?;
    info!(
        version = app_version,
        started_at = %Utc::now().to_rfc3339(),
        store = ?config.store,
        "ragchat boot"
    );

    let context = AppContext::connect(config).await.map_err(describe_context)?;
    let outcome = run(&context, cli.command).await;
    if let Err(failure) = &outcome {
        error!(error = ?failure, "command failed");
    }
    context.shutdown().await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ingest_defaults_to_data_folder() {
        let cli = Cli::try_parse_from(["ragchat", "ingest"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Ingest {
                datapath: PathBuf::from("./data")
            }
        );
    }

    #[test]
    fn delete_accepts_dry_run() {
        let cli = Cli::try_parse_from(["ragchat", "delete", "notes.txt", "--dry-run"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Delete {
                id: "notes.txt".to_string(),
                dry_run: true
            }
        );
    }

    #[test]
    fn ask_requires_a_question() {
        assert!(Cli::try_parse_from(["ragchat", "ask"]).is_err());
        let cli = Cli::try_parse_from(["ragchat", "ask", "What is in notes?"]).unwrap();
        assert_eq!(
            cli.command,
            Command::Ask {
                question: "What is in notes?".to_string()
            }
        );
    }

    #[test]
    fn repl_lines_map_to_commands() {
        assert_eq!(parse_repl_line("  "), ReplCommand::Empty);
        assert_eq!(parse_repl_line("/quit"), ReplCommand::Quit);
        assert_eq!(parse_repl_line("/list"), ReplCommand::List);
        assert_eq!(
            parse_repl_line("/add docs/notes.txt"),
            ReplCommand::Add(PathBuf::from("docs/notes.txt"))
        );
        assert_eq!(
            parse_repl_line("/delete notes.txt"),
            ReplCommand::Delete("notes.txt".to_string())
        );
        assert_eq!(parse_repl_line("/delete"), ReplCommand::Help);
        assert_eq!(
            parse_repl_line("What is the capital of Bulgaria?"),
            ReplCommand::Ask("What is the capital of Bulgaria?".to_string())
        );
    }

    #[test]
    fn connection_failures_carry_a_retry_hint() {
        let error = describe_registry(RegistryError::Store(StoreError::Connection(
            "refused".to_string(),
        )));
        assert!(error.to_string().contains("retry"));

        let error = describe_registry(RegistryError::NotFound("ghost.txt".to_string()));
        assert!(!error.to_string().contains("retry"));
    }
}
