use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;

use crate::{
    cli::commands::{CompleteCommand, FindPortCommand, StatusCommand},
    config::Settings,
    port::find_open_port,
    protocol::{GenerationOptions, OptionValue},
    service::Playground,
    session::SessionEvent,
};

/// Build generation options from repeated `--opt` and `--flag` arguments.
pub fn collect_options(cmd: &CompleteCommand) -> Result<GenerationOptions> {
    let mut options = GenerationOptions::new();
    for raw in &cmd.options {
        let (key, value) = GenerationOptions::parse_assignment(raw)?;
        options.insert(key, value);
    }
    for flag in &cmd.flags {
        options.insert(flag.clone(), OptionValue::Flag(true));
    }
    Ok(options)
}

pub async fn handle_complete(settings: Settings, cmd: CompleteCommand) -> Result<()> {
    let options = collect_options(&cmd)?;
    let playground = Playground::new(settings).context("Invalid configuration")?;
    playground.start_in_background();

    let mut subscription = playground.subscribe();
    let identity = match subscription.recv().await {
        Some(SessionEvent::Identity(identity)) => identity,
        other => anyhow::bail!("expected identity event, got {:?}", other),
    };
    tracing::debug!(%identity, "subscribed");

    if let Err(e) = playground.start_generation(identity, cmd.prompt, options).await {
        playground.shutdown().await;
        return Err(e).context("Failed to start generation");
    }

    let mut stdout = tokio::io::stdout();
    let mut failure = None;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = &mut ctrl_c, if !interrupted => {
                tracing::info!("Interrupted, cancelling generation");
                interrupted = true;
                let _ = playground.cancel_generation(identity);
            }
            event = subscription.recv() => match event {
                Some(SessionEvent::Completion(text)) => {
                    stdout.write_all(text.as_bytes()).await?;
                    stdout.flush().await?;
                }
                Some(SessionEvent::Error(message)) => failure = Some(message),
                Some(SessionEvent::RequestComplete) | None => break,
                Some(SessionEvent::Identity(_)) => {}
            }
        }
    }
    stdout.write_all(b"\n").await?;
    stdout.flush().await?;

    drop(subscription);
    playground.shutdown().await;

    match failure {
        Some(message) => anyhow::bail!("Generation failed: {}", message),
        None => Ok(()),
    }
}

pub async fn handle_status(settings: Settings, cmd: StatusCommand) -> Result<()> {
    let playground = Playground::new(settings).context("Invalid configuration")?;

    let started = playground.start().await;
    println!("{}", serde_json::json!({ "status": playground.status() }));

    match started {
        Ok(address) => {
            tracing::info!(%address, "Backend is ready");
            if cmd.keep_running {
                tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
            }
            playground.shutdown().await;
            Ok(())
        }
        Err(e) => {
            playground.shutdown().await;
            Err(e).context("Backend failed to start")
        }
    }
}

pub async fn handle_find_port(cmd: FindPortCommand) -> Result<()> {
    let port = find_open_port(cmd.min, cmd.max)
        .await
        .context("Failed to find an open port")?;
    println!("{}", port);
    Ok(())
}
