mod aggregator;
mod classify;
mod client;
mod config;
mod hardware;
mod http;
mod metrics;
mod push;
mod snapshot;

use aggregator::Aggregator;
use axum::serve;
use clap::{Parser, Subcommand};
use client::{HttpTransport, StreamConsumer, ViewState};
use config::{AuthConfig, ClientConfig, Config};
use hardware::local::LocalProvider;
use hardware::SensorProvider;
use http::{AuthState, HttpAppState};
use metrics::Metrics;
use push::Subscribers;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hwmond")]
#[command(version)]
struct Cli {
    #[arg(long, default_value = "./config.yaml")]
    config: String,
    #[arg(long)]
    print_default_config: bool,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve snapshots over HTTP and websocket (default).
    Serve,
    /// Follow a running server and log every view change.
    Watch {
        /// Overrides client.base_url.
        #[arg(long)]
        url: Option<String>,
        #[arg(long)]
        no_stream: bool,
        /// Overrides client.poll_interval_secs; 0 turns polling off.
        #[arg(long)]
        poll_secs: Option<u64>,
    },
}

#[tokio::main]
async fn main() {
    init_tracing();

    let cli = Cli::parse();
    if cli.print_default_config {
        println!("{}", Config::example_yaml());
        return;
    }

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve_snapshots(&cli.config).await,
        Command::Watch {
            url,
            no_stream,
            poll_secs,
        } => watch_server(&cli.config, url, no_stream, poll_secs).await,
    }
}

async fn serve_snapshots(config_path: &str) {
    let cfg = match Config::load_from_file(config_path) {
        Ok(cfg) => cfg,
        Err(err) => {
            error!(error = %err, "не удалось загрузить конфигурацию");
            std::process::exit(1);
        }
    };

    let api_token = cfg.auth.resolve_token();
    if api_token.is_none() {
        warn!(
            env = %cfg.auth.token_env,
            "токен доступа не задан: /stats, /metrics и /stream будут отвечать 500"
        );
    }

    info!(
        listen = %cfg.listen,
        interval_secs = cfg.interval_secs,
        "запуск hwmond"
    );

    let metrics = match Metrics::new() {
        Ok(m) => m,
        Err(err) => {
            error!(error = %err, "не удалось инициализировать метрики");
            std::process::exit(1);
        }
    };

    let provider = LocalProvider::open().map(|p| Box::new(p) as Box<dyn SensorProvider>);
    let aggregator = Aggregator::open(provider, cfg.top_processes, metrics.clone());
    let subscribers = Subscribers::new(cfg.push.queue_capacity, metrics.clone());
    let auth = Arc::new(AuthState::new(api_token, cfg.stream_token_ttl()));

    let origins = cfg.cors.resolve_origins();
    let cors = match http::build_cors_layer(&origins) {
        Ok(cors) => cors,
        Err(err) => {
            error!(error = %err, origins = ?origins, "некорректный список CORS origin");
            std::process::exit(1);
        }
    };
    info!(origins = ?origins, "CORS разрешён для origin");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let http_task = {
        let listen = cfg.listen.clone();
        let state = HttpAppState {
            aggregator: aggregator.clone(),
            subscribers: subscribers.clone(),
            metrics: metrics.clone(),
            auth,
        };
        let mut shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move {
            let app = http::build_router(state, cors);
            let addr: SocketAddr = match listen.parse() {
                Ok(addr) => addr,
                Err(err) => {
                    error!(error = %err, listen = %listen, "некорректный адрес listen");
                    return;
                }
            };

            let listener = match TcpListener::bind(addr).await {
                Ok(l) => l,
                Err(err) => {
                    error!(error = %err, "не удалось запустить HTTP-сервер");
                    return;
                }
            };

            let server = serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.changed().await;
            });

            if let Err(err) = server.await {
                error!(error = %err, "ошибка HTTP-сервера");
            }
        })
    };

    let broadcaster_task = tokio::spawn(push::run_broadcaster(
        aggregator.clone(),
        subscribers,
        Duration::from_secs(cfg.interval_secs),
        shutdown_rx,
    ));

    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "не удалось дождаться Ctrl+C");
    }
    info!("получен Ctrl+C, выполняется остановка");

    let _ = shutdown_tx.send(true);

    let _ = broadcaster_task.await;
    let _ = http_task.await;
    aggregator.close().await;
}

async fn watch_server(
    config_path: &str,
    url: Option<String>,
    no_stream: bool,
    poll_secs: Option<u64>,
) {
    let (mut client_cfg, api_token) = match Config::load_from_file(config_path) {
        Ok(cfg) => {
            let token = cfg.auth.resolve_token();
            (cfg.client, token)
        }
        Err(err) => {
            warn!(error = %err, "конфигурация не загружена, используются настройки клиента по умолчанию");
            (ClientConfig::default(), AuthConfig::default().resolve_token())
        }
    };
    if let Some(url) = url {
        client_cfg.base_url = url;
    }
    if no_stream {
        client_cfg.streaming = false;
    }
    if let Some(secs) = poll_secs {
        client_cfg.poll_interval_secs = secs;
    }
    if !client_cfg.streaming && client_cfg.poll_interval_secs == 0 {
        client_cfg.poll_interval_secs = 2;
    }

    let transport = match HttpTransport::new(&client_cfg.base_url, api_token) {
        Ok(t) => Arc::new(t),
        Err(err) => {
            error!(error = %err, "не удалось создать HTTP-клиент");
            std::process::exit(1);
        }
    };

    info!(base_url = %client_cfg.base_url, streaming = client_cfg.streaming, "подключение к hwmond");
    let consumer = StreamConsumer::new(transport, client_cfg.consumer_options());
    let mut views = consumer.subscribe_view();
    consumer.start().await;
    if let Err(err) = consumer.refresh().await {
        warn!(error = %err, "первичный запрос /stats не удался");
    }
    log_view(&consumer.view(), &consumer);

    loop {
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                if let Err(err) = result {
                    error!(error = %err, "не удалось дождаться Ctrl+C");
                }
                break;
            }
            changed = views.changed() => {
                if changed.is_err() {
                    break;
                }
                let view = views.borrow_and_update().clone();
                log_view(&view, &consumer);
            }
        }
    }

    consumer.shutdown().await;
    match consumer.latest() {
        Some(last) => info!(timestamp = %last.timestamp, "наблюдение остановлено"),
        None => info!("наблюдение остановлено, снимков не получено"),
    }
}

fn log_view(view: &ViewState, consumer: &StreamConsumer) {
    let link = consumer.link_state();
    match view {
        ViewState::Loading => info!(link = ?link, "ожидание данных"),
        ViewState::Live(s) => info!(
            history = consumer.history().len(),
            link = ?link,
            "CPU {:.1}% ({:.0}°C) | RAM {:.1}/{:.1} GB | Net {:.2}/{:.2} Mbps",
            s.cpu.usage,
            s.cpu.temp,
            s.ram.used_gb,
            s.ram.total_gb,
            s.network.download_mbps,
            s.network.upload_mbps
        ),
        ViewState::Degraded { snapshot, error } => warn!(
            error = %error,
            link = ?link,
            cpu = snapshot.cpu.usage,
            "данные устарели, показан последний снимок"
        ),
        ViewState::Failed { error } => {
            warn!(error = %error, link = ?link, "данные недоступны")
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
