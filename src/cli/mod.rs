use std::error::Error;
use std::io::{self, Write};
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use crate::api::models::{fetch_models, ModelRegistry};
use crate::api::StreamEvent;
use crate::core::chat_stream::StreamMessage;
use crate::core::config::{resolve_backend_session, Config};
use crate::core::conversations::HttpConversationStore;
use crate::core::message::ComparisonStatus;
use crate::core::orchestrator::{EngineSettings, Orchestrator};

#[derive(Parser)]
#[command(name = "tandem")]
#[command(about = "Send a prompt to one or more AI models and stream the replies side by side")]
#[command(long_about = "Tandem sends one prompt to a primary model and, optionally, to any \
number of comparison models in parallel. The primary reply streams to stdout as it arrives; \
comparison replies print once their streams settle.\n\n\
Environment Variables:\n\
  TANDEM_BASE_URL   Backend endpoint (falls back to base_url in the config file)\n\
  TANDEM_API_KEY    Bearer token for the backend (optional for local backends)")]
struct Args {
    /// The prompt to send
    prompt: String,

    /// Primary model, bare id or provider::model
    #[arg(short, long)]
    model: Option<String>,

    /// Comparison models, comma separated (provider::model)
    #[arg(short = 'C', long, value_delimiter = ',')]
    compare: Vec<String>,

    /// Override the configured system prompt
    #[arg(long)]
    system_prompt: Option<String>,
}

pub async fn run() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();
    let config = Config::load()?;
    let session = resolve_backend_session(&config)?;

    let client = reqwest::Client::new();
    let registry = match fetch_models(&client, &session.base_url, &session.api_key).await {
        Ok(models) => ModelRegistry::from_models(&models),
        Err(e) => {
            tracing::warn!(error = %e, "model listing unavailable, relying on qualified model ids");
            ModelRegistry::default()
        }
    };

    let model = args
        .model
        .or_else(|| config.default_model.clone())
        .ok_or("No model selected. Pass --model or set default_model in the config file.")?;
    let comparison_models = if args.compare.is_empty() {
        config.comparison_models.clone()
    } else {
        args.compare
    };

    let settings = EngineSettings {
        model,
        comparison_models,
        tools_enabled: config.tools_enabled,
        tools: config.tools.clone(),
        reasoning_effort: config.reasoning_effort.clone(),
        system_prompt: args.system_prompt.or_else(|| config.system_prompt.clone()),
    };

    let store = Arc::new(HttpConversationStore::new(
        client,
        session.base_url.clone(),
        session.api_key.clone(),
    ));
    let mut engine = Orchestrator::new(session.base_url, session.api_key, registry, settings, store);

    let commands = engine.send(&args.prompt, &[]).await?;
    for command in commands {
        engine.execute(command);
    }

    engine
        .drive(|key, message| {
            if key.target.is_primary() {
                if let StreamMessage::Event(StreamEvent::Text(chunk)) = message {
                    print!("{chunk}");
                    let _ = io::stdout().flush();
                }
            }
        })
        .await;
    println!();

    if let Some(message) = engine.messages().last() {
        for (model, result) in &message.comparison_results {
            println!();
            println!("--- {model} ---");
            match result.status {
                ComparisonStatus::Error => {
                    println!("{}", result.error.as_deref().unwrap_or("unknown error"))
                }
                _ => println!("{}", result.content.flatten_text()),
            }
        }
    }

    if let Some(error) = engine.last_turn_error() {
        return Err(error.to_string().into());
    }

    Ok(())
}
