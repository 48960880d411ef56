//! agentbridge REPL binary.
//!
//! Loads configuration from the environment, starts every configured tool
//! server, and drops into a line-oriented REPL that runs each line through
//! the agentic loop.

use agentbridge::cli::output::Output;
use agentbridge::cli::{Cli, Commands};
use agentbridge::config::Config;
use agentbridge::llm::LlmBridge;
use agentbridge::AgentCore;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse_args();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let output = if cli.no_color {
        Output::no_color()
    } else {
        Output::new()
    };

    tracing::info!("Starting agentbridge");

    let config = Config::from_env()?;
    let llm = build_llm_bridge(&config)?;
    let core = AgentCore::start(config, llm).await?;

    if let Some(Commands::Clear { user_key }) = cli.command {
        core.clear(&user_key).await?;
        output.success(&format!("cleared history for {user_key}"));
        core.shutdown().await;
        return Ok(());
    }

    output.banner();
    run_repl(&core, &output).await;
    core.shutdown().await;
    Ok(())
}

fn build_llm_bridge(config: &Config) -> Result<Arc<dyn LlmBridge>, Box<dyn std::error::Error>> {
    match config.llm_provider.as_str() {
        #[cfg(feature = "openai")]
        "openai" => Ok(Arc::new(agentbridge::llm::openai::OpenAiBridge::new(
            config.llm_api_key.clone(),
            config.llm_model_name.clone(),
        ))),
        #[cfg(feature = "anthropic")]
        "anthropic" => Ok(Arc::new(agentbridge::llm::anthropic::AnthropicBridge::new(
            config.llm_api_key.clone(),
            config.llm_model_name.clone(),
        ))),
        other => Err(format!(
            "unsupported or disabled LLM_PROVIDER '{other}' (enabled features: {})",
            enabled_providers()
        )
        .into()),
    }
}

fn enabled_providers() -> &'static str {
    #[cfg(all(feature = "openai", feature = "anthropic"))]
    {
        "openai, anthropic"
    }
    #[cfg(all(feature = "openai", not(feature = "anthropic")))]
    {
        "openai"
    }
    #[cfg(all(feature = "anthropic", not(feature = "openai")))]
    {
        "anthropic"
    }
    #[cfg(not(any(feature = "openai", feature = "anthropic")))]
    {
        "none"
    }
}

async fn run_repl(core: &AgentCore, output: &Output) {
    let user_key = std::env::var("USER").unwrap_or_else(|_| "local".to_string());
    let stdin = io::stdin();

    loop {
        print!("> ");
        if io::stdout().flush().is_err() {
            break;
        }

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                output.error(&format!("failed to read input: {e}"));
                break;
            }
        }

        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text == "exit" || text == "quit" {
            break;
        }

        match core.run(&user_key, text).await {
            Ok(outcome) => {
                if !outcome.tool_calls_made.is_empty() {
                    output.info(&format!("{} tool call(s) made", outcome.tool_calls_made.len()));
                }
                println!("{}", outcome.assistant_text);
            }
            Err(e) => output.error(&e.to_string()),
        }
    }
}
