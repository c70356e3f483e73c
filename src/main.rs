//! `lacuna`: find the knowledge gaps a student has to close to work with a
//! piece of course material.
//!
//! Progress events and the final result are written to stdout as JSON lines;
//! logs go to stderr.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::Parser;
use lacuna_core::bootstrap::{create_encoder_loader, create_provider, create_vector_store};
use lacuna_core::{
    AnalysisResult, Config, CourseMetadata, CourseType, CurrentLevel, GapAnalyzer, LearningGoal,
    ProgressEvent, Stage,
};
use lacuna_llm::{Embedder, LlmProvider};
use tokio_stream::StreamExt;

const DEFAULT_CONFIG: &str = "config/lacuna.toml";

#[derive(Parser, Debug)]
#[command(
    name = "lacuna",
    version,
    about = "Retrieval-augmented knowledge gap analysis for course material"
)]
struct Cli {
    /// Configuration file (TOML). Falls back to `LACUNA_CONFIG`, then
    /// `config/lacuna.toml`; a missing file means defaults.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Document to analyze: plain text, or PDF with the `pdf` feature.
    document: PathBuf,

    /// Document id used for index entries and gap ids. Defaults to the file stem.
    #[arg(long)]
    id: Option<String>,

    #[arg(long)]
    course_code: String,

    #[arg(long)]
    institution: String,

    #[arg(long)]
    course_name: Option<String>,

    /// prerequisite, core, elective or advanced.
    #[arg(long, default_value = "core")]
    course_type: CourseType,

    /// pass_exam, ace_assignment, understand or all.
    #[arg(long, default_value = "pass_exam")]
    goal: LearningGoal,

    /// beginner, intermediate or advanced.
    #[arg(long, default_value = "intermediate")]
    level: CurrentLevel,

    /// Print only the terminal event.
    #[arg(long)]
    quiet: bool,

    /// After a successful analysis, print a tutor explanation for every
    /// critical gap.
    #[arg(long)]
    explain: bool,
}

impl Cli {
    fn course(&self) -> CourseMetadata {
        CourseMetadata {
            name: self.course_name.clone(),
            course_type: self.course_type,
            learning_goal: self.goal,
            current_level: self.level,
            ..CourseMetadata::new(self.course_code.trim(), self.institution.trim())
        }
    }

    fn document_id(&self) -> String {
        self.id.clone().unwrap_or_else(|| {
            self.document
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("document")
                .to_owned()
        })
    }
}

fn resolve_config_path(arg: Option<&Path>) -> PathBuf {
    if let Some(path) = arg {
        return path.to_path_buf();
    }
    if let Ok(path) = std::env::var("LACUNA_CONFIG") {
        return PathBuf::from(path);
    }
    PathBuf::from(DEFAULT_CONFIG)
}

fn init_subscriber(default_level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn emit(event: &ProgressEvent, quiet: bool) -> anyhow::Result<()> {
    if quiet && !event.stage.is_terminal() {
        return Ok(());
    }
    let line = serde_json::to_string(event).context("failed to serialize progress event")?;
    println!("{line}");
    Ok(())
}

async fn explain_critical<P: LlmProvider>(
    analyzer: &GapAnalyzer<P>,
    payload: Option<serde_json::Value>,
) -> anyhow::Result<()> {
    let result: AnalysisResult = serde_json::from_value(payload.unwrap_or_default())
        .context("completed event carried no analysis result")?;
    let tutor = analyzer.tutor();
    for gap in result.gaps.iter().filter(|g| g.is_critical()) {
        let explanation = tutor
            .explain_gap(&result.document_id, gap)
            .await
            .with_context(|| format!("failed to explain {}", gap.id))?;
        let line = serde_json::json!({ "gapId": gap.id, "explanation": explanation });
        println!("{line}");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = resolve_config_path(cli.config.as_deref());
    let config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;
    init_subscriber(&config.log.level);

    let result = run(&cli, &config).await;
    if let Err(e) = &result {
        tracing::error!("{e:#}");
    }
    result
}

async fn run(cli: &Cli, config: &Config) -> anyhow::Result<()> {
    let document = lacuna_memory::load_document(&cli.document_id(), &cli.document)
        .await
        .with_context(|| format!("failed to load {}", cli.document.display()))?;

    let provider = create_provider(config)?;
    let loader = create_encoder_loader(config)?;
    let store = create_vector_store(config)?;
    let embedder = Embedder::global(|| loader);
    let analyzer = Arc::new(GapAnalyzer::new(config, embedder, store, provider));

    tracing::info!(
        document_id = %document.id,
        chars = document.char_len(),
        course = %cli.course().label(),
        "starting analysis"
    );
    let mut stream = analyzer.analyze_streaming(document, cli.course());
    loop {
        tokio::select! {
            event = stream.next() => {
                let Some(event) = event else {
                    bail!("progress stream ended without a terminal event");
                };
                emit(&event, cli.quiet)?;
                match event.stage {
                    Stage::Completed if cli.explain => {
                        return explain_critical(&*analyzer, event.payload).await;
                    }
                    Stage::Completed => return Ok(()),
                    Stage::Error => bail!("analysis failed: {}", event.message),
                    _ => {}
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::warn!("interrupted, cancelling analysis");
                drop(stream);
                bail!("interrupted");
            }
        }
    }
}
