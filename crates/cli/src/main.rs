use std::io::{BufRead, Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use huddle_api::{ApiConfig, CollectionApi, HttpCollection, NoSession, Session, StaticSession};
use huddle_core::resources::{builtin_resources, resource_for, ResourceSpec};
use huddle_core::{Entity, EntityId, FilterValue, Record};
use huddle_ops::{FormState, MutationCoordinator, MutationOutcome, Notifier, TransitionForm};
use huddle_store::{load_filter_options, spawn_controller, ControllerConfig, Display, ListHandle, ListView, Refresh};
use serde::Serialize;
use serde_json::Value;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "huddlectl", version, about = "Huddle admin console CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// API base URL (overrides HUDDLE_API_URL)
    #[arg(long = "api-url", global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the managed resources, their filters and transitions
    Resources,
    /// List one page of a resource
    Ls {
        /// Resource key, e.g. "classes" or "refunds"
        resource: String,
        /// Free-text search
        #[arg(long = "search", short = 's')]
        search: Option<String>,
        /// Filter as key=value; repeatable. "key=all" clears it
        #[arg(long = "filter", short = 'f', value_parser = parse_filter)]
        filters: Vec<(String, FilterValue)>,
        /// 1-based page; clamped to the last page
        #[arg(long = "page", default_value_t = 1)]
        page: u32,
        /// Rows per page (overrides HUDDLE_PAGE_SIZE)
        #[arg(long = "page-size")]
        page_size: Option<u32>,
    },
    /// Show the choices of a filter backed by another resource
    Options {
        /// Resource providing the choices, e.g. "classes"
        resource: String,
        /// Filter field the choices are for, e.g. "class_id"
        #[arg(long = "field")]
        field: String,
        #[arg(long = "limit", default_value_t = 100)]
        limit: u32,
    },
    /// Create an entity from a JSON object ("-" reads stdin)
    Create {
        resource: String,
        #[arg(long = "json")]
        json: String,
    },
    /// Update an entity with a JSON object of changed fields
    Update {
        resource: String,
        id: String,
        #[arg(long = "json")]
        json: String,
    },
    /// Delete an entity after confirmation
    Delete {
        resource: String,
        id: String,
        /// Skip the interactive confirmation
        #[arg(long = "yes", short = 'y', action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// Run a named status transition, e.g. approve or cancel
    Transition {
        resource: String,
        id: String,
        action: String,
        /// Reason or note; required by some transitions
        #[arg(long = "reason")]
        reason: Option<String>,
    },
}

fn init_tracing() {
    let env = std::env::var("HUDDLE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("HUDDLE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid HUDDLE_METRICS_ADDR; expected host:port");
        }
    }
}

fn parse_filter(raw: &str) -> Result<(String, FilterValue), String> {
    let (k, v) = raw.split_once('=').ok_or_else(|| format!("expected key=value, got '{}'", raw))?;
    let k = k.trim();
    if k.is_empty() {
        return Err("filter key is empty".to_string());
    }
    Ok((k.to_string(), FilterValue::parse_loose(v)))
}

fn parse_payload(raw: &str) -> Result<Value> {
    let text = if raw == "-" {
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf).context("reading payload from stdin")?;
        buf
    } else {
        raw.to_string()
    };
    let v: Value = serde_json::from_str(&text).context("payload is not valid JSON")?;
    if !v.is_object() {
        bail!("payload must be a JSON object");
    }
    Ok(v)
}

fn lookup(key: &str) -> Result<ResourceSpec> {
    resource_for(key).ok_or_else(|| anyhow!("unknown resource '{}'; see `huddlectl resources`", key))
}

fn settle_timeout() -> Duration {
    Duration::from_secs(std::env::var("HUDDLE_SETTLE_SECS").ok().and_then(|s| s.parse::<u64>().ok()).unwrap_or(10))
}

struct Ctx {
    config: ApiConfig,
    session: Arc<dyn Session>,
}

impl Ctx {
    fn from_cli(cli: &Cli) -> Self {
        let mut config = ApiConfig::from_env();
        if let Some(url) = &cli.api_url {
            config.base_url = url.clone();
        }
        let session: Arc<dyn Session> = match &config.token {
            Some(t) => Arc::new(StaticSession(t.clone())),
            None => Arc::new(NoSession),
        };
        Self { config, session }
    }

    fn api(&self, resource: &ResourceSpec) -> Result<Arc<dyn CollectionApi<Record>>> {
        let http: HttpCollection<Record> = HttpCollection::new(&self.config, resource.clone(), Arc::clone(&self.session))?;
        Ok(Arc::new(http))
    }
}

async fn settled(list: &ListHandle<Record>) -> Result<Arc<ListView<Record>>> {
    tokio::time::timeout(settle_timeout(), list.settled())
        .await
        .map_err(|_| anyhow!("timed out waiting for the list to load"))
}

#[derive(Serialize)]
struct PageOut<'a> {
    resource: &'a str,
    items: &'a [Record],
    total: u64,
    page: u32,
    page_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<&'a str>,
}

fn print_page(output: Output, resource: &ResourceSpec, v: &ListView<Record>) -> Result<()> {
    let display = v.display();
    if let Display::Failed { message, retryable } = &display {
        bail!("{}{}", message, if *retryable { " (retry with the same command)" } else { "" });
    }
    match output {
        Output::Json => {
            let out = PageOut {
                resource: &resource.key,
                items: &v.items,
                total: v.total,
                page: v.query.page,
                page_count: v.page_count,
                warning: v.stale_error(),
            };
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Output::Human => {
            match display {
                Display::Failed { .. } => {}
                Display::Empty => println!("No {} found.", resource.label.to_lowercase()),
                Display::Loading | Display::Rows => {
                    println!("{:<8} {:<40} {}", "ID", "NAME", "STATUS");
                    for r in &v.items {
                        let status = r.get_str("status").unwrap_or("-");
                        println!("{:<8} {:<40} {}", r.id(), r.describe(), status);
                    }
                }
            }
            println!("page {}/{} • total {}", v.query.page, v.page_count, v.total);
            if let Some(w) = v.stale_error() {
                eprintln!("warning: {}", w);
            }
        }
    }
    Ok(())
}

fn confirm_on_stdin(prompt: &str) -> Result<bool> {
    eprint!("{} [y/N] ", prompt);
    std::io::stderr().flush()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line)?;
    Ok(matches!(line.trim().to_ascii_lowercase().as_str(), "y" | "yes"))
}

#[derive(Serialize)]
struct OutcomeOut<'a> {
    ok: bool,
    outcome: &'a str,
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity: Option<&'a Record>,
}

fn report(output: Output, outcome: &MutationOutcome<Record>, notifier: &Notifier) -> Result<()> {
    let message = notifier.last().map(|t| t.text);
    let (ok, label, entity) = match outcome {
        MutationOutcome::Done(ack) => (true, "done", match ack {
            huddle_api::MutationAck::Entity(e) => Some(e),
            huddle_api::MutationAck::Message(_) => None,
        }),
        MutationOutcome::AlreadyGone => (true, "already_gone", None),
        MutationOutcome::Failed(_) => (false, "failed", None),
        MutationOutcome::Invalid(_) => (false, "invalid", None),
        MutationOutcome::Ignored => (false, "ignored", None),
    };
    let message = match outcome {
        MutationOutcome::Invalid(m) => Some(m.clone()),
        MutationOutcome::AlreadyGone => Some("Already removed.".to_string()),
        _ => message,
    };
    match output {
        Output::Json => println!("{}", serde_json::to_string_pretty(&OutcomeOut { ok, outcome: label, message: message.clone(), entity })?),
        Output::Human => {
            if ok {
                if let Some(m) = &message {
                    println!("{}", m);
                }
            }
        }
    }
    if !ok {
        bail!(message.unwrap_or_else(|| label.to_string()));
    }
    Ok(())
}

struct Page {
    list: ListHandle<Record>,
    ops: MutationCoordinator<Record>,
}

fn open_page(ctx: &Ctx, resource: &ResourceSpec) -> Result<Page> {
    let api = ctx.api(resource)?;
    let list = spawn_controller(Arc::clone(&api), resource.clone(), ControllerConfig::from_env());
    let refresh: Arc<dyn Refresh> = Arc::new(list.clone());
    let ops = MutationCoordinator::new(api, refresh, Notifier::default(), resource.clone());
    Ok(Page { list, ops })
}

impl Page {
    async fn close(self) {
        // Let the post-mutation refresh land so its outcome is logged.
        match tokio::time::timeout(settle_timeout(), self.list.settled()).await {
            Ok(v) => info!(total = v.total, "list refreshed"),
            Err(_) => warn!("list refresh did not settle"),
        }
        self.list.shutdown().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let ctx = Ctx::from_cli(&cli);

    match &cli.command {
        Commands::Resources => {
            let all = builtin_resources();
            match cli.output {
                Output::Json => println!("{}", serde_json::to_string_pretty(&all)?),
                Output::Human => {
                    for r in all {
                        let filters: Vec<&str> = r.filters.iter().map(|f| f.key.as_str()).collect();
                        let transitions: Vec<String> = r
                            .transitions
                            .iter()
                            .map(|t| if t.requires_reason { format!("{}*", t.name) } else { t.name.clone() })
                            .collect();
                        println!("{:<14} {:<24} filters: {} • actions: {}", r.key, r.path, filters.join(","), transitions.join(","));
                    }
                    println!("(* requires --reason)");
                }
            }
        }
        Commands::Ls { resource, search, filters, page, page_size } => {
            let spec = lookup(resource)?;
            info!(resource = %spec.key, page, "ls invoked");
            let mut config = ControllerConfig::from_env();
            if let Some(n) = page_size {
                config.page_size = (*n).max(1);
            }
            let list = spawn_controller(ctx.api(&spec)?, spec.clone(), config);
            if !filters.is_empty() || search.is_some() {
                list.set_many(filters.clone(), search.as_deref()).await;
            }
            let mut v = settled(&list).await?;
            if *page != v.query.page {
                list.set_page(*page).await;
                v = settled(&list).await?;
            }
            list.shutdown().await;
            print_page(cli.output, &spec, &v)?;
        }
        Commands::Options { resource, field, limit } => {
            let spec = lookup(resource)?;
            let api = ctx.api(&spec)?;
            let opts = load_filter_options(&*api, field, spec.pagination, *limit, |r: &Record| r.describe()).await;
            match cli.output {
                Output::Json => {
                    let rows: Vec<(String, &str)> = opts.options.iter().map(|o| (o.value.to_string(), o.label.as_str())).collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
                Output::Human => {
                    for o in &opts.options {
                        println!("{:<8} {}", o.value, o.label);
                    }
                }
            }
            if let Some(e) = &opts.error {
                eprintln!("warning: {} options unavailable ({})", field, e);
            }
        }
        Commands::Create { resource, json } => {
            let spec = lookup(resource)?;
            let payload = parse_payload(json)?;
            let page = open_page(&ctx, &spec)?;
            let mut form = FormState::open(payload);
            let outcome = page.ops.create(&mut form).await;
            for f in &form.field_errors {
                eprintln!("  {}: {}", f.field, f.message);
            }
            let res = report(cli.output, &outcome, page.ops.notifier());
            page.close().await;
            res?;
        }
        Commands::Update { resource, id, json } => {
            let spec = lookup(resource)?;
            let payload = parse_payload(json)?;
            let page = open_page(&ctx, &spec)?;
            let mut form = FormState::open(payload);
            let outcome = page.ops.update(&EntityId::new(id.as_str()), &mut form).await;
            for f in &form.field_errors {
                eprintln!("  {}: {}", f.field, f.message);
            }
            let res = report(cli.output, &outcome, page.ops.notifier());
            page.close().await;
            res?;
        }
        Commands::Delete { resource, id, yes } => {
            let spec = lookup(resource)?;
            let page = open_page(&ctx, &spec)?;
            // Prefer the loaded row so the prompt can name it.
            let target = match settled(&page.list).await {
                Ok(v) => v.items.iter().find(|r| r.id().as_str() == id.as_str()).cloned(),
                Err(_) => None,
            }
            .unwrap_or_else(|| Record(serde_json::json!({ "id": id })));
            let confirmation = page.ops.request_delete(&target);
            if !*yes && !confirm_on_stdin(&confirmation.prompt())? {
                confirmation.cancel();
                eprintln!("aborted");
                page.close().await;
                return Ok(());
            }
            let outcome = confirmation.confirm().await;
            let res = report(cli.output, &outcome, page.ops.notifier());
            page.close().await;
            res?;
        }
        Commands::Transition { resource, id, action, reason } => {
            let spec = lookup(resource)?;
            let page = open_page(&ctx, &spec)?;
            let mut input = TransitionForm::new(action.as_str());
            if let Some(r) = reason {
                input = input.with_reason(r.as_str());
            }
            let mut form = FormState::open(input);
            let outcome = page.ops.transition(&EntityId::new(id.as_str()), &mut form).await;
            let res = report(cli.output, &outcome, page.ops.notifier());
            page.close().await;
            res?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filter_args_parse_loosely() {
        assert_eq!(parse_filter("status=active").unwrap(), ("status".to_string(), FilterValue::Tag("active".into())));
        assert_eq!(parse_filter("status=all").unwrap().1, FilterValue::None);
        assert!(parse_filter("status").is_err());
        assert!(parse_filter("=x").is_err());
    }

    #[test]
    fn payload_must_be_an_object() {
        assert!(parse_payload(r#"{"name": "U8"}"#).is_ok());
        assert!(parse_payload("[1,2]").is_err());
        assert!(parse_payload("{oops").is_err());
    }

    #[test]
    fn cli_parses_repeated_filters() {
        let cli = Cli::try_parse_from(["huddlectl", "ls", "classes", "-f", "status=active", "-f", "area_id=3", "--page", "2"]).unwrap();
        match cli.command {
            Commands::Ls { filters, page, .. } => {
                assert_eq!(filters.len(), 2);
                assert_eq!(page, 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
