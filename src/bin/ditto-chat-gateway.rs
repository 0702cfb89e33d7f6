use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncBufReadExt;

use ditto_chat_gateway::gateway::context::Prompt;
use ditto_chat_gateway::gateway::{
    Clock, Gateway, GatewayConfig, GatewayError, ManualClock, ModelTier,
    OpenAiCompatibleUpstream, SubmitResponse, SystemClock, Upstream, UpstreamError, UpstreamReply,
    init_tracing,
};

#[derive(Parser)]
#[command(name = "ditto-chat-gateway")]
#[command(version, about = "Rate-limited, circuit-broken gateway in front of a chat model API", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// TOML or JSON gateway config; defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON on stderr.
    #[arg(long, global = true)]
    json_logs: bool,

    /// OpenAI-compatible API base URL.
    #[arg(long, global = true, default_value = "https://api.openai.com/v1")]
    base_url: String,

    /// Environment variable holding the API key.
    #[arg(long, global = true, default_value = "OPENAI_API_KEY")]
    api_key_env: String,

    /// Answer every message locally instead of calling the model API.
    #[arg(long, global = true)]
    echo: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Submit one message and print the outcome as JSON.
    Submit {
        #[arg(long)]
        subject: String,
        #[arg(long)]
        text: String,
    },
    /// Read `{"subject", "text", "at_ms"?}` lines from stdin and print one
    /// outcome per line.
    Replay {
        /// Drive time from each line's `at_ms` instead of the wall clock.
        #[arg(long)]
        simulated_clock: bool,
    },
}

#[derive(Debug, Deserialize)]
struct ReplayLine {
    subject: String,
    text: String,
    #[serde(default)]
    at_ms: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Outcome {
    Ok {
        subject: String,
        ok: bool,
        response: SubmitResponse,
    },
    Err {
        subject: String,
        ok: bool,
        kind: &'static str,
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

impl Outcome {
    fn from_result(subject: &str, result: Result<SubmitResponse, GatewayError>) -> Self {
        match result {
            Ok(response) => Self::Ok {
                subject: subject.to_string(),
                ok: true,
                response,
            },
            Err(err) => Self::Err {
                subject: subject.to_string(),
                ok: false,
                kind: err.kind(),
                message: err.user_message(),
                retry_after_ms: err.retry_after().map(|d| d.as_millis() as u64),
            },
        }
    }
}

#[derive(Debug)]
struct EchoUpstream;

#[async_trait]
impl Upstream for EchoUpstream {
    async fn invoke(
        &self,
        tier: ModelTier,
        prompt: &Prompt,
    ) -> Result<UpstreamReply, UpstreamError> {
        Ok(UpstreamReply {
            text: format!("[{tier}] {}", prompt.message),
            input_tokens: 0,
            output_tokens: 0,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs)?;

    let config = match cli.config.as_ref() {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };

    let upstream: Arc<dyn Upstream> = if cli.echo {
        Arc::new(EchoUpstream)
    } else {
        let api_key = std::env::var(&cli.api_key_env).unwrap_or_default();
        if api_key.trim().is_empty() {
            tracing::warn!(env = %cli.api_key_env, "api key is not set");
        }
        Arc::new(OpenAiCompatibleUpstream::new(
            cli.base_url.clone(),
            api_key,
            config.tiers.clone(),
        ))
    };

    match cli.command {
        Command::Submit { subject, text } => {
            let gateway = Gateway::builder(config, upstream).connect().await?;
            let result = gateway.submit(&subject, &text).await;
            let failed = result.is_err();
            println!(
                "{}",
                serde_json::to_string(&Outcome::from_result(&subject, result))?
            );
            if failed {
                std::process::exit(1);
            }
        }
        Command::Replay { simulated_clock } => {
            let manual = Arc::new(ManualClock::new(0));
            let clock: Arc<dyn Clock> = if simulated_clock {
                manual.clone()
            } else {
                Arc::new(SystemClock)
            };
            let gateway = Gateway::builder(config, upstream)
                .clock(clock)
                .connect()
                .await?;

            let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
            while let Some(line) = lines.next_line().await? {
                if line.trim().is_empty() {
                    continue;
                }
                let entry: ReplayLine = match serde_json::from_str(&line) {
                    Ok(entry) => entry,
                    Err(err) => {
                        tracing::warn!(error = %err, "skipping malformed replay line");
                        continue;
                    }
                };
                if simulated_clock {
                    if let Some(at_ms) = entry.at_ms {
                        manual.set(at_ms);
                    }
                }
                let result = gateway.submit(&entry.subject, &entry.text).await;
                println!(
                    "{}",
                    serde_json::to_string(&Outcome::from_result(&entry.subject, result))?
                );
            }

            let summary = gateway.observability();
            tracing::info!(
                requests = summary.requests,
                completed = summary.completed,
                throttled = summary.throttled,
                "replay finished"
            );
        }
    }

    Ok(())
}
