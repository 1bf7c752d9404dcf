// 服务入口：加载配置、初始化日志，挂载登录路由或执行一次性查询。
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, Next};
use axum::response::{IntoResponse, Response};
use axum::Json;
use clap::{Parser, Subcommand};
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use webapp_server::config::{load_config_with_writer, Config};
use webapp_server::envelope::error_envelope;
use webapp_server::shutdown::shutdown_signal;
use webapp_server::state::AppState;

/// webapp-server：登录与数据库查询服务。
#[derive(Debug, Parser)]
#[command(author, version, bin_name = "webapp-server")]
struct Cli {
    /// Config path (default config/webapp.yaml, or $WEBAPP_CONFIG_PATH).
    #[arg(long = "config", global = true)]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Start the HTTP server (default).
    Serve,
    /// Run one SQL statement and print the JSON envelope.
    Query {
        #[arg(value_name = "SQL")]
        sql: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config_path = cli
        .config_path
        .as_ref()
        .map(|path| path.to_string_lossy().into_owned());
    let config = load_config_with_writer(config_path.as_deref(), std::io::stderr);
    init_tracing(&config);
    let state = Arc::new(AppState::new(config.clone())?);

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(state, &config).await,
        Command::Query { sql } => {
            let envelope = state.executor.execute_query_json(&sql, &[], &[]);
            println!("{}", envelope.to_json_string());
            Ok(())
        }
    }
}

async fn serve(state: Arc<AppState>, config: &Config) -> anyhow::Result<()> {
    let app = webapp_server::build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard));

    let addr = bind_address(config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("服务已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }
    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 保留环境变量覆盖，便于容器化部署。
    let host = std::env::var("WEBAPP_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("WEBAPP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

async fn panic_guard(request: Request<Body>, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    match AssertUnwindSafe(next.run(request)).catch_unwind().await {
        Ok(response) => response,
        Err(panic) => {
            error!("panic while handling {method} {path}: {}", panic_message(panic.as_ref()));
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(error_envelope("Internal server error")),
            )
                .into_response()
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
