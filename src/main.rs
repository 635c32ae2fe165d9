use anyhow::Context;
use sea_orm_migration::MigratorTrait;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{error, info, warn};

use bookrush_api::auth;
use bookrush_api::config;
use bookrush_api::db;
use bookrush_api::events::{self, outbox, EventHandler, EventSender};
use bookrush_api::inventory::{InMemoryInventoryStore, InventoryStore, RedisInventoryStore};
use bookrush_api::message_queue::{InMemoryMessageQueue, MessageQueue, RedisMessageQueue};
use bookrush_api::queue::{PassSigner, QueueReleaseWorker};
use bookrush_api::rate_limiter::{
    default_policies, BucketConfig, RateLimitBackend, RateLimitLayer,
};
use bookrush_api::saga::workers::{
    ConfirmBookingHandler, RefundPaymentHandler, ReleaseBookingHandler, SagaStepWorker,
    SendNotificationHandler,
};
use bookrush_api::saga::{booking_saga, SagaOrchestrator, SeaOrmSagaStore};
use bookrush_api::services::ExpiryWorker;
use bookrush_api::workers::WorkerSet;
use bookrush_api::{handlers, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_config = config::load_config().context("configuration")?;
    config::init_tracing(&app_config.log_level, app_config.log_json);
    info!(environment = %app_config.environment, "bookrush-api starting");

    // Durable store.
    let db = db::establish_connection(&app_config)
        .await
        .context("durable store connection")?;
    let db = Arc::new(db);

    if app_config.auto_migrate {
        info!("running database migrations");
        migrations::Migrator::up(&*db, None)
            .await
            .context("migrations")?;
    }

    // Inventory store: Redis in production; an in-process store keeps
    // single-node development working when Redis is absent.
    let redis_client = Arc::new(
        redis::Client::open(app_config.redis_url.as_str()).context("redis url")?,
    );
    let inventory: Arc<dyn InventoryStore> =
        match RedisInventoryStore::connect(redis_client.clone()).await {
            Ok(store) => Arc::new(store),
            Err(e) => {
                warn!(error = %e, "redis unavailable; falling back to in-process inventory store");
                Arc::new(InMemoryInventoryStore::new())
            }
        };

    // Message bus.
    let queue: Arc<dyn MessageQueue> = if app_config.mq_backend == "redis" {
        Arc::new(
            RedisMessageQueue::new(
                redis_client.clone(),
                app_config.mq_namespace.clone(),
                Duration::from_secs(1),
            )
            .await
            .context("redis message queue")?,
        )
    } else {
        Arc::new(InMemoryMessageQueue::new())
    };

    let state = Arc::new(AppState::new(app_config.clone(), db.clone(), inventory.clone()));

    // Cold cache: publish durable availability for zones Redis lost.
    if let Err(e) = state
        .services
        .inventory_sync
        .seed_cold_cache(inventory.as_ref())
        .await
    {
        warn!(error = %e, "cold cache seeding failed; continuing");
    }

    // Domain event loop fed by the outbox publisher.
    let (event_tx, event_rx) = mpsc::channel(1024);
    let event_sender = EventSender::new(event_tx);
    let event_handlers: Vec<Arc<dyn EventHandler>> =
        vec![Arc::new(state.services.inventory_sync.clone())];

    let mut workers = WorkerSet::new();

    workers.spawn("event-loop", events::process_events(event_rx, event_handlers));

    workers.spawn(
        "outbox-publisher",
        outbox::run_publisher(
            db.clone(),
            event_sender,
            Some(queue.clone()),
            Duration::from_millis(app_config.outbox_poll_interval_ms),
            workers.stop_signal(),
        ),
    );

    let expiry = ExpiryWorker::new(db.clone(), inventory.clone());
    workers.spawn(
        "expiry",
        expiry.run(
            Duration::from_secs(app_config.expiry_scan_interval_secs),
            workers.stop_signal(),
        ),
    );

    workers.spawn(
        "inventory-sync",
        state.services.inventory_sync.clone().run(
            Duration::from_secs(app_config.inventory_sync_interval_secs),
            workers.stop_signal(),
        ),
    );

    let release_worker = QueueReleaseWorker::new(
        inventory.clone(),
        PassSigner::new(&app_config.queue_pass_secret),
        Duration::from_secs(app_config.queue_pass_ttl_secs),
    );
    workers.spawn(
        "queue-release",
        release_worker.run(
            Duration::from_secs(app_config.queue_release_interval_secs),
            workers.stop_signal(),
        ),
    );

    let saga_definition = booking_saga(
        Duration::from_secs(app_config.saga_step_timeout_secs),
        app_config.saga_max_retries,
    );
    let orchestrator = Arc::new(
        SagaOrchestrator::new(
            Arc::new(SeaOrmSagaStore::new(db.clone())),
            queue.clone(),
            saga_definition,
        )
        .with_run_timeout(Duration::from_secs(app_config.saga_run_timeout_secs)),
    );
    workers.spawn(
        "saga-orchestrator",
        orchestrator.run(Duration::from_millis(200), workers.stop_signal()),
    );

    let step_worker = Arc::new(
        SagaStepWorker::new(queue.clone(), "booking")
            .register(Arc::new(ConfirmBookingHandler::new(
                state.services.bookings.clone(),
            )))
            .register(Arc::new(SendNotificationHandler))
            .register(Arc::new(ReleaseBookingHandler::new(
                db.clone(),
                inventory.clone(),
            )))
            .register(Arc::new(RefundPaymentHandler)),
    );
    workers.spawn(
        "saga-steps",
        step_worker.run(Duration::from_millis(200), workers.stop_signal()),
    );

    // HTTP surface.
    let rate_backend = RateLimitBackend::Redis {
        client: redis_client.clone(),
        namespace: app_config.rate_limit.namespace.clone(),
    };
    let rate_layer = RateLimitLayer::new(
        BucketConfig {
            rate_per_sec: app_config.rate_limit.default_rate_per_sec,
            burst: app_config.rate_limit.default_burst,
        },
        rate_backend,
    )
    .with_policies(default_policies(BucketConfig {
        rate_per_sec: app_config.rate_limit.reserve_rate_per_sec,
        burst: app_config.rate_limit.reserve_burst,
    }));

    let middleware = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TimeoutLayer::new(Duration::from_secs(
            app_config.request_timeout_secs,
        )));

    // Auth context must resolve the caller before the rate limiter keys
    // off it; later layers run earlier in the stack.
    let app = handlers::router(state.clone())
        .layer(rate_layer)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::auth_context,
        ))
        .layer(middleware);

    let addr = SocketAddr::new(
        app_config.host.parse().context("host address")?,
        app_config.port,
    );
    info!(%addr, "listening");

    let listener = tokio::net::TcpListener::bind(addr).await.context("bind")?;
    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        error!(error = %e, "server error");
    }

    // Teardown order: the listener is already down; stop workers, then
    // close clients by dropping them.
    info!("shutting down workers");
    workers.shutdown(Duration::from_secs(10)).await;
    info!("bookrush-api stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
