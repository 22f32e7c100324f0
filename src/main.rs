use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod broker;
mod cache;
mod cli;
mod config;
mod errors;
mod lifecycle;
mod models;
mod rpc;
mod store;

use broker::Broker;
use cache::RedisCache;
use lifecycle::LifetimePolicy;
use models::instance::{NewInstance, Secret};
use rpc::{ErpClient, RpcOperation};
use store::{InstanceStore, PgStore};

/// Shared application state passed to handlers.
pub struct AppState {
    pub broker: Broker,
    pub store: Arc<dyn InstanceStore>,
    pub rpc: ErpClient,
    pub config: config::Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "erplink=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cfg = config::load()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(cli::Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(cli::Commands::Instance { command }) => {
            let state = build_state(cfg).await?;
            handle_instance_command(command, &state).await
        }
        Some(cli::Commands::Call {
            action,
            model,
            token,
            domain,
            fields,
            values,
            id,
        }) => {
            let state = build_state(cfg).await?;
            handle_call_command(&state, action, model, token, domain, fields, values, id).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

async fn build_state(cfg: config::Config) -> anyhow::Result<Arc<AppState>> {
    let db = PgStore::connect(&cfg.database_url).await?;
    let cache = RedisCache::connect(&cfg.redis_url).await?;

    let store: Arc<dyn InstanceStore> = Arc::new(db);
    let broker = Broker::new(store.clone(), Arc::new(cache))
        .with_op_timeout(Duration::from_millis(cfg.op_timeout_ms));

    Ok(Arc::new(AppState {
        broker,
        store,
        rpc: ErpClient::new(),
        config: cfg,
    }))
}

async fn run_server(cfg: config::Config, port: u16) -> anyhow::Result<()> {
    tracing::info!("Connecting to database...");
    let db = PgStore::connect(&cfg.database_url).await?;

    tracing::info!("Running migrations...");
    db.migrate().await?;

    tracing::info!("Connecting to Redis...");
    let cache = RedisCache::connect(&cfg.redis_url).await?;

    let store: Arc<dyn InstanceStore> = Arc::new(db);
    let broker = Broker::new(store.clone(), Arc::new(cache))
        .with_op_timeout(Duration::from_millis(cfg.op_timeout_ms));

    let state = Arc::new(AppState {
        broker,
        store,
        rpc: ErpClient::new(),
        config: cfg,
    });

    let app = axum::Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(|| async { "ok" }))
        // Admin API — nested under /api/v1
        .nest("/api/v1", api::api_router(state.clone()))
        // Data plane: record operations against the resolved instance
        .route(
            "/records",
            get(api::records::get_records)
                .post(api::records::create_record)
                .put(api::records::update_record)
                .delete(api::records::delete_record),
        )
        .with_state(state.clone())
        .layer(
            tower::ServiceBuilder::new()
                .layer(axum::middleware::from_fn(request_id_middleware))
                .layer(tower_http::trace::TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::max(1024 * 1024)),
        );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("ERPlink gateway listening on {}", addr);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Middleware: injects a unique X-Request-Id into every response.
/// This allows clients to correlate errors with gateway logs.
async fn request_id_middleware(
    req: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let req_id = uuid::Uuid::new_v4().to_string();
    let mut resp = next.run(req).await;
    if let Ok(val) = axum::http::HeaderValue::from_str(&req_id) {
        resp.headers_mut().insert("x-request-id", val);
    }
    resp
}

async fn handle_instance_command(
    cmd: cli::InstanceCommands,
    state: &Arc<AppState>,
) -> anyhow::Result<()> {
    match cmd {
        cli::InstanceCommands::Register {
            name,
            endpoint,
            database,
            username,
            secret,
            policy,
        } => {
            let policy: LifetimePolicy = policy.parse().context("invalid --policy")?;
            let token = state
                .broker
                .register(
                    NewInstance {
                        name: name.clone(),
                        endpoint,
                        database,
                        username,
                        secret: Secret::new(secret),
                    },
                    policy,
                )
                .await?;
            println!(
                "Instance registered:\n  Name:   {}\n  Policy: {}\n  Use:    Authorization: Bearer {}",
                name, policy, token
            );
        }
        cli::InstanceCommands::List => {
            let records = state.store.list().await?;
            if records.is_empty() {
                println!("No instances registered.");
            } else {
                println!(
                    "{:<20} {:<30} {:<15} {:<10} {:<7} EXPIRES",
                    "NAME", "ENDPOINT", "DATABASE", "POLICY", "TOKEN"
                );
                for r in records {
                    println!(
                        "{:<20} {:<30} {:<15} {:<10} {:<7} {}",
                        r.name,
                        r.endpoint,
                        r.database,
                        r.policy.to_string(),
                        if r.token.is_some() { "yes" } else { "no" },
                        r.expires_at
                            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                            .unwrap_or_else(|| "-".into()),
                    );
                }
            }
        }
        cli::InstanceCommands::Renew { name, policy } => {
            let policy: LifetimePolicy = policy.parse().context("invalid --policy")?;
            let token = state.broker.renew(&name, policy).await?;
            println!(
                "Token renewed for '{}':\n  Policy: {}\n  Use:    Authorization: Bearer {}",
                name, policy, token
            );
        }
        cli::InstanceCommands::Revoke { token } => {
            let outcome = state.broker.revoke(&token).await?;
            if outcome.record_cleared {
                println!("Token revoked.");
            } else {
                println!("Token was not in the store; cached entry dropped.");
            }
            if !outcome.cache_invalidated && outcome.record_cleared {
                println!(
                    "Warning: cache entry could not be invalidated; it expires within {} s.",
                    broker::CREDENTIAL_TTL_SECS
                );
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn handle_call_command(
    state: &Arc<AppState>,
    action: cli::CallAction,
    model: String,
    token: String,
    domain: String,
    fields: String,
    values: String,
    id: Option<i64>,
) -> anyhow::Result<()> {
    let creds = state.broker.resolve(&token).await?;

    let op = match action {
        cli::CallAction::Search => RpcOperation::SearchRead {
            model,
            domain: serde_json::from_str(&domain).context("invalid --domain JSON")?,
            fields: serde_json::from_str(&fields).context("invalid --fields JSON")?,
        },
        cli::CallAction::Create => RpcOperation::Create {
            model,
            values: serde_json::from_str(&values).context("invalid --values JSON")?,
        },
        cli::CallAction::Update => RpcOperation::Update {
            model,
            id: id.context("an --id is required to update a record")?,
            values: serde_json::from_str(&values).context("invalid --values JSON")?,
        },
        cli::CallAction::Delete => RpcOperation::Delete {
            model,
            id: id.context("an --id is required to delete a record")?,
        },
    };

    let result = state.rpc.execute(&creds, op).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
