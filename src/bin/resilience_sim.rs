//! resilience-sim: 模拟上游语言模型故障，观察熔断、排队与恢复的命令行工具
//!
//! Usage:
//!   resilience-sim run [--messages <n>] [--fail-for <n>] [--config <file>]
//!   resilience-sim config [--config <file>]
//!   resilience-sim version

use anyhow::{bail, Context};
use bot_resilience::{
    FnProcessor, InboundMessage, Priority, ResilienceConfig, ResilienceManager, ResponseNotice,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    match args[1].as_str() {
        "run" => cmd_run(&args[2..]).await,
        "config" => cmd_config(&args[2..]),
        "version" | "--version" | "-V" => {
            println!("resilience-sim {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        "help" | "--help" | "-h" => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {other}");
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}

fn print_usage() {
    println!(
        r#"resilience-sim: graceful degradation simulator

USAGE:
    resilience-sim <COMMAND> [OPTIONS]

COMMANDS:
    run                         Send messages through a flaky language model
        --messages <n>          Messages to send (default 20)
        --fail-for <n>          Model calls that fail before it recovers (default 8)
        --config <file>         YAML configuration
    config [--config <file>]    Print the effective configuration
    version                     Show version information
    help                        Show this help message

ENVIRONMENT:
    BOT_RESILIENCE_*            Configuration overrides
    RUST_LOG                    Log filter (default info)"#
    );
}

fn flag<'a>(args: &'a [String], name: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == name)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn numeric_flag(args: &[String], name: &str, default: usize) -> anyhow::Result<usize> {
    match flag(args, name) {
        None => Ok(default),
        Some(v) => v
            .parse()
            .with_context(|| format!("{name} expects a number, got {v:?}")),
    }
}

fn load_config(args: &[String]) -> anyhow::Result<ResilienceConfig> {
    match flag(args, "--config") {
        None => Ok(ResilienceConfig::from_env()),
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading configuration from {path}"))?;
            Ok(ResilienceConfig::from_yaml_str(&text)?)
        }
    }
}

fn cmd_config(args: &[String]) -> anyhow::Result<()> {
    let cfg = load_config(args)?.sanitized();
    print!("{}", serde_yaml::to_string(&cfg)?);
    Ok(())
}

async fn cmd_run(args: &[String]) -> anyhow::Result<()> {
    let messages = numeric_flag(args, "--messages", 20)?;
    let fail_for = numeric_flag(args, "--fail-for", 8)?;
    if messages == 0 {
        bail!("--messages must be at least 1");
    }

    // Short timings so a run finishes in a few seconds.
    let mut cfg = load_config(args)?;
    cfg.reset_timeout_ms = cfg.reset_timeout_ms.min(1_000);
    cfg.queue_process_interval_ms = cfg.queue_process_interval_ms.min(200);
    cfg.recovery_interval_ms = cfg.recovery_interval_ms.min(500);
    cfg.health_check_interval_ms = cfg.health_check_interval_ms.min(250);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let manager = ResilienceManager::builder()
        .config(cfg)
        .processor(Arc::new(FnProcessor(move |m: InboundMessage| {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                if n < fail_for {
                    Err(bot_resilience::Error::upstream(format!(
                        "simulated outage (call {})",
                        n + 1
                    )))
                } else {
                    Ok(format!("reply to {:?}", m.payload))
                }
            }
        })))
        .build()?;
    manager.initialize().await?;

    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<ResponseNotice>();
    let responder = Arc::new(tx);
    for i in 0..messages {
        let priority = Priority::ALL[i % Priority::ALL.len()];
        let outcome = manager
            .handle_message(
                &format!("user-{}", i % 4),
                "sim-server",
                &format!("message {i}"),
                responder.clone(),
                priority,
            )
            .await;
        tracing::info!(message = i, %priority, handled = outcome.handled, queued = outcome.queued, "sent");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    // Let the background loops work through the queue.
    tokio::time::sleep(Duration::from_secs(3)).await;
    println!("{}", manager.diagnostics().await.to_json()?);
    manager.shutdown().await;
    drop(responder);

    let mut notices = 0;
    while let Some(notice) = rx.recv().await {
        notices += 1;
        tracing::debug!(%notice, "notice");
    }
    eprintln!(
        "{} notices, {} model calls",
        notices,
        calls.load(Ordering::SeqCst)
    );
    Ok(())
}
