//! Shared application state for the daemon

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLog, AuditStore, InMemoryAuditStore, SqliteAuditStore};
use crate::auth::AuthService;
use crate::challenge::ChallengeStore;
use crate::config::{Config, StorageBackend};
use crate::control_db::ControlDb;
use crate::log_buffer::LogBuffer;
use crate::metrics::Metrics;
use crate::pipeline::stages::{
    AuditInterceptor, AuthzInterceptor, LoggingInterceptor, MetricsInterceptor,
    RateLimitInterceptor, RecoveryInterceptor, RequestIdInterceptor,
};
use crate::pipeline::{Interceptor, Pipeline};
use crate::rate_limit::RateLimiter;
use crate::rbac::{default_mutation_table, default_policy_table, RbacEnforcer};
use crate::rpc::{Registry, Services};
use crate::session::{InMemorySessionStore, SessionStore, SqliteSessionStore};
use crate::users::{InMemoryUserStore, SqliteUserStore, UserStore};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub registry: Arc<Registry>,
    pub pipeline: Pipeline,
    pub rate_limit: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    /// Notified when a shutdown is requested over RPC
    pub shutdown: Arc<Notify>,
    /// Cancels background maintenance
    pub background: CancellationToken,
    pub started_at: Instant,
}

impl AppState {
    /// Create new application state. Fails if the policy table does not
    /// cover every served method.
    pub fn new(config: Config, log_buffer: Arc<LogBuffer>) -> anyhow::Result<Self> {
        let (users, sessions, audit_store): (
            Arc<dyn UserStore>,
            Arc<dyn SessionStore>,
            Arc<dyn AuditStore>,
        ) = match config.storage {
            StorageBackend::Memory => {
                tracing::warn!("Using in-memory storage (state is lost on restart)");
                (
                    Arc::new(InMemoryUserStore::new()),
                    Arc::new(InMemorySessionStore::new()),
                    Arc::new(InMemoryAuditStore::new()),
                )
            }
            StorageBackend::Sqlite => {
                let control = Arc::new(ControlDb::new(&config.control_db)?);
                tracing::info!(path = %config.control_db.display(), "Opened control database");
                let audit = SqliteAuditStore::new(&config.audit_db)?;
                tracing::info!(path = %config.audit_db.display(), "Opened audit database");
                (
                    Arc::new(SqliteUserStore::new(control.clone())),
                    Arc::new(SqliteSessionStore::new(control)),
                    Arc::new(audit),
                )
            }
        };

        let auth = Arc::new(AuthService::new(
            Arc::new(ChallengeStore::new(config.auth.challenge_ttl())),
            users,
            sessions,
            config.auth.clone(),
            config.node_id.clone(),
        ));
        let audit = Arc::new(AuditLog::new(audit_store, config.node_id.clone()));
        let metrics = Arc::new(Metrics::default());
        let rate_limit = Arc::new(RateLimiter::new(&config.rate_limit));
        let shutdown = Arc::new(Notify::new());
        let started_at = Instant::now();
        let config = Arc::new(config);

        let services = Arc::new(Services {
            config: config.clone(),
            auth: auth.clone(),
            audit: audit.clone(),
            log_buffer,
            shutdown: shutdown.clone(),
            started_at,
        });
        let registry = Registry::new(services);

        let policy = Arc::new(default_policy_table());
        let mutations = Arc::new(default_mutation_table());
        policy
            .check_complete(registry.registered_methods(), &mutations)
            .map_err(|err| anyhow::anyhow!(err))?;

        let stages: Vec<Arc<dyn Interceptor>> = vec![
            Arc::new(MetricsInterceptor::new(metrics.clone(), policy.methods())),
            Arc::new(RecoveryInterceptor::new(metrics.clone())),
            Arc::new(RequestIdInterceptor),
            Arc::new(LoggingInterceptor),
            Arc::new(RateLimitInterceptor::new(
                rate_limit.clone(),
                auth.clone(),
                metrics.clone(),
            )),
            Arc::new(AuthzInterceptor::new(Arc::new(RbacEnforcer::new(
                policy,
                auth.clone(),
            )))),
            Arc::new(AuditInterceptor::new(audit, mutations, metrics.clone())),
        ];

        if auth.is_bootstrap_mode()? {
            tracing::warn!("No users registered; the first verified key becomes administrator");
        }

        Ok(Self {
            config,
            registry: Arc::new(registry),
            pipeline: Pipeline::new(stages),
            rate_limit,
            metrics,
            shutdown,
            background: CancellationToken::new(),
            started_at,
        })
    }

    pub fn services(&self) -> &Arc<Services> {
        self.registry.services()
    }

    pub fn uptime_secs(&self) -> i64 {
        self.started_at.elapsed().as_secs() as i64
    }

    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Periodic challenge/session sweep and rate-limiter eviction, until
    /// [`AppState::background`] is cancelled.
    pub fn spawn_maintenance(&self) -> tokio::task::JoinHandle<()> {
        let auth = self.services().auth.clone();
        let rate_limit = self.rate_limit.clone();
        let cancel = self.background.clone();
        let sweep_every = self.config.auth.sweep_interval();
        let evict_every = Duration::from_secs(self.config.rate_limit.idle_eviction_secs.max(1));

        tokio::spawn(async move {
            let mut sweep = tokio::time::interval(sweep_every);
            let mut evict = tokio::time::interval(evict_every);
            sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            evict.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::debug!("Background maintenance stopped");
                        break;
                    }
                    _ = sweep.tick() => match auth.sweep() {
                        Ok((challenges, sessions)) if challenges > 0 || sessions > 0 => {
                            tracing::debug!(challenges, sessions, "Swept expired auth state");
                        }
                        Ok(_) => {}
                        Err(err) => tracing::warn!(error = %err, "Auth sweep failed"),
                    },
                    _ = evict.tick() => {
                        let evicted = rate_limit.evict_idle();
                        if evicted > 0 {
                            tracing::debug!(evicted, "Evicted idle rate limit buckets");
                        }
                    }
                }
            }
        })
    }
}
