//! Console client: submits one question and prints the thought chain live.
//!
//! Usage: `thought-chain-console [--config <file>] [--table <id>] <question>`
//!
//! `THOUGHT_CHAIN_BASE_URL` overrides the configured API root.

use std::collections::HashMap;

use anyhow::{Context, bail};
use thought_chain_core::{ChatRole, ClientConfig, Step, StepStatus, ThoughtChainView};
use thought_chain_session::ChatClient;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

struct Args {
    config: Option<String>,
    table: Option<String>,
    question: String,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut config = None;
    let mut table = None;
    let mut words = Vec::new();
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => config = Some(args.next().context("--config needs a path")?),
            "--table" => table = Some(args.next().context("--table needs an id")?),
            _ => words.push(arg),
        }
    }
    if words.is_empty() {
        bail!("usage: thought-chain-console [--config <file>] [--table <id>] <question>");
    }
    Ok(Args {
        config,
        table,
        question: words.join(" "),
    })
}

const fn badge(status: StepStatus) -> &'static str {
    match status {
        StepStatus::Wait => "…",
        StepStatus::Process => "▶",
        StepStatus::Finish => "✓",
        StepStatus::Error => "✗",
    }
}

fn print_step(step: &Step) {
    println!("{} [{}] {}", badge(step.display_status), step.id, step.title);
    for line in step.description.lines().filter(|l| !l.trim().is_empty()) {
        println!("    {line}");
    }
}

/// Prints steps whose rendering changed since the last call.
#[derive(Default)]
struct Printer {
    seen: HashMap<String, Step>,
    messages: usize,
}

impl Printer {
    fn render(&mut self, view: &ThoughtChainView) {
        for step in &view.steps {
            if self.seen.get(&step.id) != Some(step) {
                print_step(step);
                self.seen.insert(step.id.clone(), step.clone());
            }
        }
        for message in view.history.iter().skip(self.messages) {
            match message.role() {
                ChatRole::User => println!("> {}", message.text()),
                ChatRole::Assistant if message.is_error() => println!("! {}", message.text()),
                ChatRole::Assistant => {
                    println!("\n{}", message.text());
                    for file in message.files() {
                        println!("  file: {} ({})", file.name, file.path);
                    }
                }
            }
        }
        self.messages = view.history.len();
    }

    fn answered(view: &ThoughtChainView) -> bool {
        view.history
            .last()
            .is_some_and(|m| m.role() == ChatRole::Assistant)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = parse_args()?;
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path).with_context(|| format!("loading {path}"))?,
        None => ClientConfig::default(),
    };
    if let Ok(url) = std::env::var("THOUGHT_CHAIN_BASE_URL") {
        config.base_url = url;
    }

    let mut client = ChatClient::from_config(&config)?;
    let session = client.start_new_session().await?;
    tracing::info!(session_id = %session.id, "session ready");

    if let Some(table) = args.table {
        client.select_data_source(table).await;
    }
    client
        .wait_connected()
        .await
        .context("event stream did not open")?;
    client.submit(&args.question).await?;

    let mut printer = Printer::default();
    loop {
        let view = client.view();
        printer.render(&view);
        if Printer::answered(&view) {
            break;
        }
        if client.session_id().await.is_none() {
            bail!("session was invalidated by the server");
        }

        tokio::select! {
            open = client.pump() => {
                if !open {
                    bail!("event stream closed");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                println!("interrupted");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}
