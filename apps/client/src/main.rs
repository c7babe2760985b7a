use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use coverletter_client::config::{Config, HistoryBacking};
use coverletter_client::models::{
    GenerationRequest, JobSource, Language, NewHistoryEntry, ResumeFile,
};
use coverletter_client::{
    GenerationClient, GenerationOrchestrator, HistoryStore, LocalHistoryStore, Outcome,
    RemoteHistoryStore,
};

const USAGE: &str = "\
usage:
  coverletter generate --resume <file.pdf|file.docx> (--url <job url> | --text <job text>) [--lang ru|en] [--buffered]
  coverletter history list
  coverletter history show <id>
  coverletter history remove <id>
  coverletter history clear
  coverletter health";

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Logs go to stderr; stdout carries only the letter.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!(
                "coverletter_client={level},coverletter={level}",
                level = &config.rust_log
            ))
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    info!("Cover letter client v{}", env!("CARGO_PKG_VERSION"));

    let client = GenerationClient::new(&config.api_url, config.session_token.clone())?;
    let history = build_history(&config, &client).await?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("generate") => generate(&args[1..], client, history).await,
        Some("history") => history_command(&args[1..], history.as_ref()).await,
        Some("health") => {
            client.health().await?;
            println!("ok");
            Ok(())
        }
        _ => bail!("{USAGE}"),
    }
}

async fn build_history(
    config: &Config,
    client: &GenerationClient,
) -> Result<Arc<dyn HistoryStore>> {
    Ok(match config.history {
        HistoryBacking::Local => Arc::new(LocalHistoryStore::open(&config.history_path).await),
        HistoryBacking::Remote => {
            let store = RemoteHistoryStore::new(client.clone());
            store.refresh().await?;
            Arc::new(store)
        }
    })
}

struct GenerateArgs {
    resume: String,
    source: JobSource,
    language: Language,
    buffered: bool,
}

fn parse_generate_args(args: &[String]) -> Result<GenerateArgs> {
    let mut resume = None;
    let mut source = None;
    let mut language = Language::default();
    let mut buffered = false;

    let mut iter = args.iter();
    while let Some(flag) = iter.next() {
        let mut value = || {
            iter.next()
                .cloned()
                .ok_or_else(|| anyhow!("{flag} needs a value"))
        };
        match flag.as_str() {
            "--resume" => resume = Some(value()?),
            "--url" | "--text" if source.is_some() => {
                bail!("give exactly one of --url or --text")
            }
            "--url" => source = Some(JobSource::Url(value()?)),
            "--text" => source = Some(JobSource::Text(value()?)),
            "--lang" => language = value()?.parse()?,
            "--buffered" => buffered = true,
            other => bail!("unknown argument '{other}'\n{USAGE}"),
        }
    }

    Ok(GenerateArgs {
        resume: resume.ok_or_else(|| anyhow!("--resume is required"))?,
        source: source.ok_or_else(|| anyhow!("one of --url or --text is required"))?,
        language,
        buffered,
    })
}

async fn generate(
    args: &[String],
    client: GenerationClient,
    history: Arc<dyn HistoryStore>,
) -> Result<()> {
    let args = parse_generate_args(args)?;

    let bytes = tokio::fs::read(&args.resume)
        .await
        .with_context(|| format!("could not read resume '{}'", args.resume))?;
    let filename = Path::new(&args.resume)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| args.resume.clone());
    let request = GenerationRequest::new(
        ResumeFile::new(filename, bytes),
        args.source,
        args.language,
    )?;

    if args.buffered {
        let result = client.generate(&request).await?;
        println!("{}", result.cover_letter);
        let entry = NewHistoryEntry::for_request(&request, result.cover_letter);
        if let Err(e) = history.add(entry).await {
            warn!("Could not record generation in history: {e}");
        }
        return Ok(());
    }

    let orchestrator = GenerationOrchestrator::new(Arc::new(client), history);
    let render = tokio::spawn(render_stream(orchestrator.subscribe()));

    let outcome = tokio::select! {
        outcome = orchestrator.submit(request) => outcome,
        _ = tokio::signal::ctrl_c() => {
            orchestrator.cancel();
            Outcome::Cancelled
        }
    };
    drop(orchestrator);
    render.await.ok();
    println!();

    match outcome {
        Outcome::Completed(_) | Outcome::Cancelled => Ok(()),
        Outcome::Failed(message) => Err(anyhow!(message)),
    }
}

/// Prints each newly streamed suffix of the letter as it arrives.
async fn render_stream(mut state: tokio::sync::watch::Receiver<coverletter_client::GenerationState>) {
    let mut printed = 0usize;
    let mut stdout = std::io::stdout();

    while state.changed().await.is_ok() {
        let text = state.borrow_and_update().text.clone();
        if text.len() < printed || !text.is_char_boundary(printed) {
            printed = 0;
        }
        if text.len() > printed {
            let _ = stdout.write_all(text[printed..].as_bytes());
            let _ = stdout.flush();
            printed = text.len();
        }
    }
}

async fn history_command(args: &[String], history: &dyn HistoryStore) -> Result<()> {
    match (args.first().map(String::as_str), args.get(1)) {
        (Some("list") | None, _) => {
            let snapshot = history.snapshot();
            if snapshot.is_empty() {
                println!("No history yet.");
            }
            for entry in snapshot.iter() {
                println!(
                    "{}  {}  {}{}\n    {}",
                    entry.id,
                    entry.created_at.format("%Y-%m-%d %H:%M"),
                    entry.source_label,
                    entry
                        .metadata
                        .resume_filename
                        .as_deref()
                        .map(|f| format!(" · {f}"))
                        .unwrap_or_default(),
                    entry.preview(100)
                );
            }
        }
        (Some("show"), Some(id)) => {
            let entry = history
                .get(id)
                .ok_or_else(|| anyhow!("no history entry with id '{id}'"))?;
            println!("{}", entry.content);
        }
        (Some("remove"), Some(id)) => {
            history.remove(id).await?;
            println!("Removed {id}");
        }
        (Some("clear"), _) => {
            history.clear().await?;
            println!("History cleared");
        }
        _ => bail!("{USAGE}"),
    }
    Ok(())
}
