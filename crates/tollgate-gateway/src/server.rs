//! Gateway server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use tollgate_core::clock::{Clock, SystemClock};
use tollgate_core::config::{Config, CounterBackend, GatewayConfig};
use tollgate_core::counters::{self, CounterStore, MemoryCounterStore};
use tollgate_core::plans::{self, PlanStore};
use tollgate_core::types::{EntityType, PlanKey, UsagePlan};
use tollgate_limiter::{LimiterConfig, RateLimiter, StatsSnapshot};

use crate::GatewayError;
use crate::admin::{AdminError, CreateUsagePlan, UsagePlanAdmin, UsagePlanPatch};
use crate::cache::{self, PlanCache};
use crate::middleware::{AdminThrottle, throttle_admin};
use crate::shim::AdmissionShim;

/// Gateway server state shared across handlers.
pub struct GatewayState {
    /// Plan administration.
    pub admin: UsagePlanAdmin,
    /// Rate limiter engine, for statistics.
    pub limiter: Arc<RateLimiter>,
    /// Admin call throttle.
    pub throttle: AdminThrottle,
}

/// Gateway server.
pub struct Gateway {
    config: GatewayConfig,
    state: Arc<GatewayState>,
    shim: Arc<AdmissionShim>,
    sweep: Option<(Arc<MemoryCounterStore>, Duration)>,
}

/// Builder for constructing a Gateway with its dependencies.
pub struct GatewayBuilder {
    config: GatewayConfig,
    plan_store: Option<Arc<dyn PlanStore>>,
    limiter: Option<Arc<RateLimiter>>,
    cache_ttl: Duration,
    cache_capacity: u64,
}

impl GatewayBuilder {
    /// Create a new builder with default config.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: GatewayConfig::default(),
            plan_store: None,
            limiter: None,
            cache_ttl: cache::DEFAULT_TTL,
            cache_capacity: cache::DEFAULT_CAPACITY,
        }
    }

    /// Set gateway configuration.
    #[must_use]
    pub fn with_config(mut self, config: GatewayConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the plan store.
    #[must_use]
    pub fn with_plan_store(mut self, store: Arc<dyn PlanStore>) -> Self {
        self.plan_store = Some(store);
        self
    }

    /// Set the rate limiter engine.
    #[must_use]
    pub fn with_limiter(mut self, limiter: Arc<RateLimiter>) -> Self {
        self.limiter = Some(limiter);
        self
    }

    /// Set plan cache TTL and capacity.
    #[must_use]
    pub const fn with_plan_cache(mut self, ttl: Duration, capacity: u64) -> Self {
        self.cache_ttl = ttl;
        self.cache_capacity = capacity;
        self
    }

    /// Build the gateway.
    ///
    /// # Errors
    ///
    /// Returns error if the plan store or limiter is not configured.
    pub fn build(self) -> Result<Gateway, GatewayError> {
        let store = self
            .plan_store
            .ok_or_else(|| GatewayError::Config("Plan store is required".to_string()))?;
        let limiter = self
            .limiter
            .ok_or_else(|| GatewayError::Config("Rate limiter is required".to_string()))?;

        let cache = Arc::new(PlanCache::with_settings(
            store,
            self.cache_ttl,
            self.cache_capacity,
        ));

        let state = GatewayState {
            admin: UsagePlanAdmin::with_clock(cache.clone(), limiter.clock().clone()),
            limiter: limiter.clone(),
            throttle: AdminThrottle::new(self.config.admin_requests_per_minute),
        };

        Ok(Gateway {
            config: self.config,
            state: Arc::new(state),
            shim: Arc::new(AdmissionShim::new(cache, limiter)),
            sweep: None,
        })
    }
}

impl Default for GatewayBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl Gateway {
    /// Create a gateway with stores opened from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if a store cannot be opened.
    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);

        let plan_store = plans::open_plan_store(config)
            .map_err(|e| GatewayError::Store(format!("Failed to open plan store: {e}")))?;

        let mut sweep = None;
        let counter_store: Arc<dyn CounterStore> = match config.counters.backend {
            CounterBackend::Memory => {
                let store = Arc::new(MemoryCounterStore::new(clock.clone()));
                let every = Duration::from_secs(config.limiter.window_secs.max(1));
                sweep = Some((store.clone(), every));
                store
            }
            CounterBackend::Redis => counters::open_counter_store(config, clock.clone())
                .map_err(|e| GatewayError::Store(format!("Failed to open counter store: {e}")))?,
        };

        tracing::info!(
            plans = plan_store.name(),
            counters = counter_store.name(),
            failure_mode = ?config.limiter.failure_mode,
            "Stores opened"
        );

        let limiter = Arc::new(RateLimiter::new(
            counter_store,
            clock,
            LimiterConfig::from_settings(&config.limiter),
        ));

        let mut gateway = GatewayBuilder::new()
            .with_config(config.gateway.clone())
            .with_plan_store(plan_store)
            .with_limiter(limiter)
            .with_plan_cache(
                Duration::from_secs(config.plans.cache_ttl_secs),
                config.plans.cache_capacity,
            )
            .build()?;
        gateway.sweep = sweep;
        Ok(gateway)
    }

    /// Integration hooks sharing this gateway's cache and limiter.
    #[must_use]
    pub fn shim(&self) -> Arc<AdmissionShim> {
        self.shim.clone()
    }

    /// Shared handler state.
    #[must_use]
    pub fn state(&self) -> Arc<GatewayState> {
        self.state.clone()
    }

    /// Build the HTTP router.
    #[must_use]
    pub fn router(&self) -> Router {
        router(self.state.clone(), self.config.cors)
    }

    /// Run the gateway server until interrupted.
    ///
    /// # Errors
    ///
    /// Returns error if the address is invalid or the listener fails.
    pub async fn run(&self) -> Result<(), GatewayError> {
        let addr: SocketAddr = self
            .config
            .bind_address()
            .parse()
            .map_err(|e| GatewayError::Config(format!("Invalid address: {e}")))?;

        let sweeper = self.sweep.clone().map(|(store, every)| {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                loop {
                    ticker.tick().await;
                    let purged = store.purge_expired();
                    if purged > 0 {
                        tracing::debug!(purged, "Expired counters purged");
                    }
                }
            })
        });

        tracing::info!("Gateway API listening on http://{}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();

        let served = axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| GatewayError::Server(e.to_string()));

        if let Some(sweeper) = sweeper {
            sweeper.abort();
        }
        tracing::info!("Gateway stopped");
        served
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

/// Build the router over shared state.
pub fn router(state: Arc<GatewayState>, cors: bool) -> Router {
    let admin = Router::new()
        .route("/usage-plans", post(create_plan).get(list_plans))
        .route(
            "/usage-plans/{entity_type}/{entity_id}",
            get(get_plan).patch(update_plan).delete(deactivate_plan),
        )
        .route("/admission/stats", get(stats_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), throttle_admin));

    let app = Router::new()
        .route("/health", get(health_handler))
        .merge(admin)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    if cors {
        app.layer(CorsLayer::permissive())
    } else {
        app
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn health_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

fn plan_key(entity_type: &str, entity_id: String) -> Result<PlanKey, AdminError> {
    let entity_type: EntityType = entity_type
        .parse()
        .map_err(|e: tollgate_core::ValidationError| AdminError::Invalid(e.to_string()))?;
    Ok(PlanKey::new(entity_id, entity_type))
}

fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, AdminError> {
    body.map(|Json(value)| value)
        .map_err(|e| AdminError::Invalid(e.body_text()))
}

async fn create_plan(
    State(state): State<Arc<GatewayState>>,
    body: Result<Json<CreateUsagePlan>, JsonRejection>,
) -> Result<impl IntoResponse, AdminError> {
    let plan = state.admin.create_usage_plan(json_body(body)?).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

async fn get_plan(
    State(state): State<Arc<GatewayState>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<UsagePlan>, AdminError> {
    let key = plan_key(&entity_type, entity_id)?;
    Ok(Json(state.admin.get_usage_plan(&key).await?))
}

async fn update_plan(
    State(state): State<Arc<GatewayState>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
    body: Result<Json<UsagePlanPatch>, JsonRejection>,
) -> Result<Json<UsagePlan>, AdminError> {
    let key = plan_key(&entity_type, entity_id)?;
    let patch = json_body(body)?;
    Ok(Json(state.admin.update_usage_plan(&key, patch).await?))
}

async fn deactivate_plan(
    State(state): State<Arc<GatewayState>>,
    Path((entity_type, entity_id)): Path<(String, String)>,
) -> Result<Json<UsagePlan>, AdminError> {
    let key = plan_key(&entity_type, entity_id)?;
    Ok(Json(state.admin.deactivate_usage_plan(&key).await?))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    tenant_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ListResponse {
    tenant_id: String,
    plans: Vec<UsagePlan>,
}

async fn list_plans(
    State(state): State<Arc<GatewayState>>,
    Query(query): Query<ListQuery>,
) -> Result<Json<ListResponse>, AdminError> {
    let tenant_id = query
        .tenant_id
        .ok_or_else(|| AdminError::Invalid("tenant_id query parameter is required".to_string()))?;
    let plans = state.admin.list_usage_plans(&tenant_id).await?;
    Ok(Json(ListResponse { tenant_id, plans }))
}

#[derive(Debug, Serialize)]
struct StatsResponse {
    #[serde(flatten)]
    stats: StatsSnapshot,
    cached_plans: u64,
}

async fn stats_handler(State(state): State<Arc<GatewayState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        stats: state.limiter.stats().snapshot(),
        cached_plans: state.admin.cache().entry_count(),
    })
}
