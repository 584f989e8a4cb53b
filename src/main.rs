use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use modelgate::app::{AppConfig, AppState};
use modelgate::gateway::CallerContext;
use modelgate::models::{Capability, CallOptions, Message, ModelTag, StreamFragment};
use modelgate::platform::{AppPaths, CredentialResolver};

mod cli;

use cli::{CallerArgs, ChatArgs, Cli, Commands, ConfigAction};

fn init_logging(paths: &AppPaths, debug: bool) -> Result<WorkerGuard> {
    let level = if debug { "modelgate=debug" } else { "modelgate=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let file_appender = tracing_appender::rolling::daily(paths.logs_dir(), "modelgate.log");
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(fmt::layer().with_writer(file_writer).with_ansi(false))
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(guard)
}

fn caller_context(args: &CallerArgs, config: &AppConfig) -> CallerContext {
    let tier = args.tier.clone().unwrap_or_else(|| config.quotas.default_tier.clone());
    CallerContext::new(&args.caller, tier)
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling request");
            token.cancel();
        }
    });
    cancel
}

fn print_fragment(fragment: StreamFragment) {
    match fragment {
        StreamFragment::Reasoning(text) => {
            eprint!("{}", text);
            let _ = std::io::stderr().flush();
        }
        StreamFragment::Content(text) => {
            print!("{}", text);
            let _ = std::io::stdout().flush();
        }
    }
}

async fn run_chat(state: &AppState, args: ChatArgs) -> Result<()> {
    let gateway = state.gateway();
    let caller = caller_context(&args.caller, &state.get_config());

    let mut messages = Vec::new();
    if let Some(system) = args.system {
        messages.push(Message::system(system));
    }
    messages.push(Message::user(args.prompt.join(" ")));

    let options = CallOptions {
        provider: args.provider,
        model: args.model,
        temperature: args.temperature,
        max_tokens: args.max_tokens,
        reasoning: args.reasoning.is_some(),
        reasoning_budget_tokens: args.reasoning.filter(|budget| *budget > 0),
    };

    let response = if args.no_stream {
        let response = gateway.chat(&caller, messages, &options).await?;
        if let Some(reasoning) = &response.reasoning {
            eprintln!("{}", reasoning);
        }
        print!("{}", response.content);
        response
    } else {
        let cancel = cancel_on_ctrl_c();
        let mut on_fragment = print_fragment;
        gateway
            .chat_stream(&caller, messages, &options, &mut on_fragment, &cancel)
            .await?
    };
    println!();

    if let Some(usage) = &response.usage {
        info!(
            "{}/{}: {} input + {} output tokens",
            response.provider, response.model, usage.input_tokens, usage.output_tokens
        );
    }
    Ok(())
}

async fn run_again(
    state: &AppState,
    prompt: Vec<String>,
    topic: Option<String>,
    current: Option<String>,
    dry_run: bool,
    caller: CallerArgs,
) -> Result<()> {
    let gateway = state.gateway();
    let caller = caller_context(&caller, &state.get_config());
    let prompt = prompt.join(" ");
    let topic = topic.unwrap_or_else(|| prompt.clone());

    if dry_run {
        match gateway.predict_again(&topic, current.as_deref()) {
            Some(next) => println!("{}/{} (quality {}, rating {:.1})", next.service, next.model_id, next.quality, next.rating),
            None => println!("No eligible model for this topic"),
        }
        return Ok(());
    }

    let response = gateway
        .again(&caller, &topic, current.as_deref(), vec![Message::user(prompt)], &CallOptions::default())
        .await?;
    println!("[{}/{}]", response.provider, response.model);
    println!("{}", response.content);
    Ok(())
}

fn run_models(state: &AppState, tag: Option<String>, min_rating: Option<f64>) -> Result<()> {
    let gateway = state.gateway();

    if let Some(tag) = tag {
        let tag = ModelTag::parse(&tag).with_context(|| format!("Unknown tag '{}'", tag))?;
        println!("Models for {} (capability: {})", tag, tag.capability());
        for (rank, model) in gateway.selector().eligible(tag, min_rating).iter().enumerate() {
            println!(
                "  {:>2}. {:<32} {:<10} quality {:>3}  rating {:.1}",
                rank + 1,
                model.model_id,
                model.service,
                model.quality,
                model.rating
            );
        }
        return Ok(());
    }

    println!("Providers by capability:");
    for capability in Capability::ALL {
        let providers = gateway.registry().providers_for(capability);
        println!("  {:<18} {}", capability.as_str(), providers.join(", "));
    }

    println!("\nRanked models:");
    for model in gateway.selector().catalog().rankings().iter() {
        let tags: Vec<&str> = model.tags.iter().map(|t| t.as_str()).collect();
        println!("  {:<32} {:<10} [{}]", model.model_id, model.service, tags.join(", "));
    }
    Ok(())
}

async fn run_quota(state: &AppState, caller: CallerArgs, action: Option<String>) -> Result<()> {
    let gateway = state.gateway();
    let caller = caller_context(&caller, &state.get_config());

    let actions: Vec<Capability> = match action {
        Some(action) => vec![Capability::parse(&action).with_context(|| format!("Unknown action '{}'", action))?],
        None => Capability::ALL.to_vec(),
    };

    println!("Quota for {} (tier {}):", caller.id, caller.tier);
    for action in actions {
        let check = gateway.quotas().check(&caller.id, &caller.tier, action.as_str()).await?;
        match check.limit {
            None => println!("  {:<18} unlimited", action.as_str()),
            Some(limit) => println!(
                "  {:<18} {:>6}/{:<6} {:?}{}{}",
                action.as_str(),
                check.used,
                limit,
                check.quota_type,
                if check.allowed { "" } else { "  DENIED" },
                check
                    .resets_at
                    .map(|at| format!("  resets {}", at.format("%Y-%m-%d %H:%M UTC")))
                    .unwrap_or_default()
            ),
        }
    }

    let stats = gateway.quotas().usage_statistics(&caller.id, None).await?;
    println!(
        "\nUsage: {} requests, {} input / {} output tokens, cost ${}",
        stats.total_requests, stats.total_input_tokens, stats.total_output_tokens, stats.total_cost
    );
    let mut models: Vec<_> = stats.by_model.iter().collect();
    models.sort_by(|a, b| b.1.requests.cmp(&a.1.requests));
    for (model, usage) in models {
        println!("  {:<32} {:>6} requests  ${}", model, usage.requests, usage.cost);
    }
    Ok(())
}

async fn run_health(state: &AppState, json: bool) -> Result<()> {
    let report = state.gateway().health_report().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!("Overall: {}", if report.healthy { "healthy" } else { "degraded" });
    for provider in &report.providers {
        let status = match (provider.available, provider.healthy) {
            (false, _) => "not configured".to_string(),
            (true, true) => format!("healthy ({} ms)", provider.status.latency_ms.unwrap_or_default()),
            (true, false) => format!(
                "unhealthy: {}",
                provider.status.error.as_deref().unwrap_or("circuit open")
            ),
        };
        println!("  {:<10} {}", provider.name, status);
        for (capability, circuit) in &provider.circuits {
            println!("      {:<18} {}", capability.as_str(), circuit.as_str());
        }
    }
    Ok(())
}

async fn run_config(state: &AppState, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => {
            let rendered = toml::to_string_pretty(&state.get_config()).context("Failed to render configuration")?;
            println!("{}", rendered);
        }
        ConfigAction::Path => println!("{}", state.paths().config_file().display()),
        ConfigAction::SetKey { provider, key } => {
            state.set_api_key(&provider, &key).await?;
            println!("Stored API key for {}", provider);
        }
        ConfigAction::RemoveKey { provider } => {
            state.remove_api_key(&provider).await?;
            println!("Removed API key for {}", provider);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let paths = AppPaths::new()?;
    paths.ensure_dirs_exist()?;
    let _guard = init_logging(&paths, cli.debug)?;

    info!("Starting modelgate {}", env!("CARGO_PKG_VERSION"));

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(&paths).await?,
    };
    let state = AppState::new(config, paths, CredentialResolver::new())
        .await
        .context("Failed to initialize application state")?;

    match cli.command {
        Commands::Chat(args) => run_chat(&state, args).await?,
        Commands::Again {
            prompt,
            topic,
            current,
            dry_run,
            caller,
        } => run_again(&state, prompt, topic, current, dry_run, caller).await?,
        Commands::Models { tag, min_rating } => run_models(&state, tag, min_rating)?,
        Commands::Quota { caller, action } => run_quota(&state, caller, action).await?,
        Commands::Health { json } => run_health(&state, json).await?,
        Commands::Config { action } => run_config(&state, action).await?,
    }

    Ok(())
}
