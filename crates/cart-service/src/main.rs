//! 购物车服务入口
//!
//! 启动 REST 与 gRPC 接口，并按配置启动订单完成事件消费者。
//! 消费者发生致命错误时停止两个服务并以非零状态退出。

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::http::HeaderValue;
use cart_proto::cart::cart_service_server::CartServiceServer;
use cart_service::{
    consumer::build_kafka_consumer, grpc::CartGrpcService, repository::RedisCartRepository,
    routes, state::AppState, store::CartStore,
};
use cart_shared::{config::AppConfig, observability};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tonic::transport::Server;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

const SERVICE_NAME: &str = "cart-api";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let (mut config, load_error) = match AppConfig::load(SERVICE_NAME) {
        Ok(config) => (config, None),
        Err(e) => (AppConfig::default(), Some(e)),
    };
    if config.service_name.is_empty() {
        config.service_name = SERVICE_NAME.to_string();
    }

    let obs_config = config
        .observability
        .clone()
        .with_service_name(&config.service_name);
    let _guard = observability::init(&obs_config)?;

    if let Some(e) = load_error {
        warn!(error = %e, "配置加载失败，使用默认配置");
    }
    info!(
        environment = %config.environment,
        addr = %config.server_addr(),
        grpc_addr = %config.grpc_addr(),
        "Starting {}",
        config.service_name
    );

    let repo = RedisCartRepository::connect(&config.redis)
        .await
        .context("连接 Redis 失败")?;
    let store = CartStore::new(Arc::new(repo), config.redis.max_conflict_retries);
    let mut state = AppState::new(store.clone(), &config.service_name);
    let grpc_service = CartGrpcService::new(store.clone());

    // 关闭信号：true 表示停止两个服务与消费者
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    // 消费者致命错误通知
    let (fatal_tx, fatal_rx) = watch::channel(false);

    let consumer_task = if config.consumer.enabled {
        let consumer = build_kafka_consumer(&config, store)?;
        state = state.with_consumer_state(consumer.state());

        let consumer_shutdown = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            let result = consumer.run(consumer_shutdown).await;
            if let Err(e) = &result {
                error!(error = %e, "订单完成事件消费者异常退出");
                let _ = fatal_tx.send(true);
            }
            result
        }))
    } else {
        info!("订单完成事件消费者未启用");
        drop(fatal_tx);
        None
    };

    let app = routes::build_router(state, &config.server.base_path)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(config.is_production()));

    let listener = TcpListener::bind(config.server_addr()).await?;
    info!("Listening on {}", config.server_addr());

    let grpc_addr: SocketAddr = config
        .grpc_addr()
        .parse()
        .context("gRPC 监听地址无效")?;
    info!("gRPC server listening on {}", grpc_addr);

    // 任一信号到达后通知两个服务与消费者；消费者在当前消息处理完后退出
    tokio::spawn(async move {
        shutdown_signal(fatal_rx).await;
        let _ = shutdown_tx.send(true);
    });

    // 优雅关闭：停止接收新连接并等待已有请求处理完毕
    let http =
        axum::serve(listener, app).with_graceful_shutdown(wait_for_shutdown(shutdown_rx.clone()));
    let grpc = Server::builder()
        .add_service(CartServiceServer::new(grpc_service))
        .serve_with_shutdown(grpc_addr, wait_for_shutdown(shutdown_rx));

    tokio::try_join!(
        async { http.await.context("HTTP 服务异常退出") },
        async { grpc.await.context("gRPC 服务异常退出") },
    )?;

    if let Some(task) = consumer_task {
        task.await
            .context("消费者任务异常终止")?
            .context("订单完成事件消费者失败")?;
    }

    info!("Server shutdown complete");
    Ok(())
}

/// CORS 配置：通过 CART_CORS_ORIGINS 环境变量控制允许的来源
fn cors_layer(is_production: bool) -> CorsLayer {
    let allowed_origins = std::env::var("CART_CORS_ORIGINS").unwrap_or_else(|_| "*".to_string());

    if allowed_origins == "*" {
        if is_production {
            warn!("CART_CORS_ORIGINS=\"*\" 在生产环境中不安全，请设置为具体域名");
        }
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    info!("CORS allowed_origins: {}", allowed_origins);
    let origins: Vec<_> = allowed_origins
        .split(',')
        .filter_map(|s| s.trim().parse::<HeaderValue>().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// 监听关闭信号
///
/// SIGTERM、Ctrl+C 或消费者致命错误任一发生即返回。
/// 信号处理器注册失败只记录日志，对应分支不再触发。
async fn shutdown_signal(mut fatal: watch::Receiver<bool>) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "注册 Ctrl+C 处理器失败");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "注册 SIGTERM 处理器失败");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let consumer_failed = async {
        // 发送端已释放（消费者未启用）时永不触发
        let closed = fatal.wait_for(|failed| *failed).await.is_err();
        if closed {
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, initiating graceful shutdown..."),
        _ = terminate => info!("Received SIGTERM, initiating graceful shutdown..."),
        _ = consumer_failed => warn!("消费者已停止，关闭 HTTP 与 gRPC 服务"),
    }
}
