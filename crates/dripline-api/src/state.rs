//! Application state wiring all services together.
//!
//! AppState holds the concrete service instances used by the REST API and
//! the engine runner. Services are generic over repository/collaborator
//! traits, but AppState pins them to the concrete infra implementations.

use std::sync::Arc;
use std::time::Duration;

use dripline_core::collaborator::{
    EngagementSource, HttpCaller, MessagingCollaborator, SegmentCollaborator,
};
use dripline_core::engine::executor::{EngineConfig, FlowEngine};
use dripline_core::service::enrollment::EnrollmentService;
use dripline_core::service::flow::FlowService;
use dripline_infra::messaging::gateway::{HttpMessagingGateway, MessagingGatewayConfig};
use dripline_infra::messaging::http_caller::ReqwestHttpCaller;
use dripline_infra::messaging::segment::StoredSegmentEvaluator;
use dripline_infra::sqlite::engagement::SqliteEngagementSource;
use dripline_infra::sqlite::enrollment::SqliteEnrollmentRepository;
use dripline_infra::sqlite::flow::SqliteFlowRepository;
use dripline_infra::sqlite::pool::{DatabasePool, default_database_url};
use dripline_infra::sqlite::subject::SqliteSubjectRepository;

/// Concrete type aliases pinned to the infra implementations.
pub type ConcreteFlowService = FlowService<SqliteFlowRepository, SqliteEnrollmentRepository>;

pub type ConcreteEnrollmentService =
    EnrollmentService<SqliteFlowRepository, SqliteEnrollmentRepository, SqliteSubjectRepository>;

pub type ConcreteEngine =
    FlowEngine<SqliteFlowRepository, SqliteEnrollmentRepository, SqliteSubjectRepository>;

/// Settings resolved from CLI flags and environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: Option<String>,
    pub poll_interval: Duration,
    pub batch_limit: u32,
    pub messaging_url: String,
    pub messaging_token: String,
}

/// Shared application state holding all services.
#[derive(Clone)]
pub struct AppState {
    pub flow_service: Arc<ConcreteFlowService>,
    pub enrollment_service: Arc<ConcreteEnrollmentService>,
    pub engine: Arc<ConcreteEngine>,
    pub db_pool: DatabasePool,
}

impl AppState {
    /// Initialize the application state: connect to the database, wire the
    /// repositories and collaborators, and build the engine.
    pub async fn init(config: &AppConfig) -> anyhow::Result<Self> {
        let db_url = config
            .database_url
            .clone()
            .unwrap_or_else(default_database_url);
        let db_pool = DatabasePool::new(&db_url).await?;

        let flows = Arc::new(SqliteFlowRepository::new(db_pool.clone()));
        let enrollments = Arc::new(SqliteEnrollmentRepository::new(db_pool.clone()));
        let subjects = Arc::new(SqliteSubjectRepository::new(db_pool.clone()));

        let messaging: Arc<dyn MessagingCollaborator> =
            Arc::new(HttpMessagingGateway::new(MessagingGatewayConfig {
                base_url: config.messaging_url.clone(),
                api_token: config.messaging_token.clone(),
                timeout: Duration::from_secs(30),
            })
            .map_err(|e| anyhow::anyhow!("messaging gateway: {e}"))?);
        let segments: Arc<dyn SegmentCollaborator> =
            Arc::new(StoredSegmentEvaluator::new(subjects.clone()));
        let engagement: Arc<dyn EngagementSource> =
            Arc::new(SqliteEngagementSource::new(db_pool.clone()));
        let http: Arc<dyn HttpCaller> =
            Arc::new(ReqwestHttpCaller::new().map_err(|e| anyhow::anyhow!("http caller: {e}"))?);

        let engine_config = EngineConfig {
            poll_interval: config.poll_interval,
            batch_limit: config.batch_limit,
            ..EngineConfig::default()
        };

        let engine = Arc::new(FlowEngine::new(
            flows.clone(),
            enrollments.clone(),
            subjects.clone(),
            messaging,
            segments,
            engagement,
            http,
            engine_config,
        ));

        let flow_service = Arc::new(FlowService::new(
            flows.clone(),
            enrollments.clone(),
            config.poll_interval,
        ));
        let enrollment_service = Arc::new(EnrollmentService::new(flows, enrollments, subjects));

        Ok(Self {
            flow_service,
            enrollment_service,
            engine,
            db_pool,
        })
    }
}
