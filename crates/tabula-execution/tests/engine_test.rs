use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;
use tabula_application::ProfileStore;
use tabula_core::config::ExtractionSettings;
use tabula_core::{
    AggregateSubmission, ApiError, Credential, Filter, Metric, PollResponse, QuerySpec, Record,
    ResultSource, SessionCredential, TableApi, TableInfo, TableSchema, TokenIssuer,
};
use std::path::Path;
use tabula_execution::{ExtractionEngine, ExtractionEventLayer, assemble};
use tabula_infrastructure::{
    InMemoryCredentialStore, InMemorySnapshotRepository, TomlProfileRepository,
};
use tempfile::TempDir;
use tracing_subscriber::layer::SubscriberExt;

/// Backend whose aggregation endpoint rejects every grouping field.
struct RejectingApi {
    rows: Vec<Record>,
}

#[async_trait]
impl TableApi for RejectingApi {
    async fn fetch_page(
        &self,
        _credential: &Credential,
        _table: &str,
        _filters: &[Filter],
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Record>, ApiError> {
        Ok(self
            .rows
            .iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn count_rows(
        &self,
        _credential: &Credential,
        _table: &str,
        _filters: &[Filter],
    ) -> Result<u64, ApiError> {
        Ok(self.rows.len() as u64)
    }

    async fn submit_aggregate(
        &self,
        _credential: &Credential,
        query: &QuerySpec,
    ) -> Result<AggregateSubmission, ApiError> {
        Ok(AggregateSubmission::Rejected {
            message: "field cannot be aggregated".into(),
            field: query.dimensions.first().cloned(),
        })
    }

    async fn poll_aggregate(
        &self,
        _credential: &Credential,
        _handle: &str,
    ) -> Result<PollResponse, ApiError> {
        Ok(PollResponse::Processing)
    }

    async fn list_tables(&self, _credential: &Credential) -> Result<Vec<TableInfo>, ApiError> {
        Ok(vec![TableInfo {
            id: "16528".into(),
            name: Some("Financials".into()),
            alias: None,
        }])
    }

    async fn table_schema(
        &self,
        _credential: &Credential,
        table: &str,
    ) -> Result<TableSchema, ApiError> {
        Err(ApiError::Client {
            status: 404,
            message: format!("table {} not found", table),
        })
    }

    async fn distinct_values(
        &self,
        _credential: &Credential,
        _table: &str,
        _field: &str,
    ) -> Result<Vec<Value>, ApiError> {
        Ok(Vec::new())
    }
}

struct StaticIssuer;

#[async_trait]
impl TokenIssuer for StaticIssuer {
    async fn issue(
        &self,
        _environment: &str,
        _session: &SessionCredential,
    ) -> Result<Credential, ApiError> {
        Ok(Credential::from_tokens("access", Some("refresh".into()), "csrf"))
    }

    async fn refresh(
        &self,
        _environment: &str,
        _session: &SessionCredential,
        _refresh_token: &str,
    ) -> Result<Credential, ApiError> {
        Ok(Credential::from_tokens("access-2", Some("refresh-2".into()), "csrf"))
    }
}

fn rows() -> Vec<Record> {
    (0..1_100u64)
        .filter_map(|i| {
            json!({"DR_ACC_L2": format!("acc-{}", i % 7), "Entity": format!("e-{}", i % 3), "Amount": i})
                .as_object()
                .cloned()
        })
        .collect()
}

fn engine(base: &Path) -> ExtractionEngine {
    let profiles = Arc::new(ProfileStore::new(Arc::new(TomlProfileRepository::new(Some(
        base,
    )))));
    assemble(
        "app".to_string(),
        ExtractionSettings::default(),
        Arc::new(RejectingApi { rows: rows() }),
        Arc::new(StaticIssuer),
        Arc::new(InMemoryCredentialStore::with_session(
            "app",
            SessionCredential::new("sid", "csrf"),
        )),
        profiles,
        Arc::new(InMemorySnapshotRepository::new()),
    )
}

#[tokio::test]
async fn test_rejected_field_falls_back_and_is_persisted() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(temp_dir.path());

    let (layer, mut events) = ExtractionEventLayer::channel();
    let _guard = tracing::subscriber::set_default(tracing_subscriber::registry().with(layer));

    let query = QuerySpec::new("16528")
        .group_by("DR_ACC_L2")
        .metric(Metric::sum("Amount"));
    let result = engine.orchestrator.aggregate_query(&query).await.unwrap();

    assert_eq!(result.metadata.source, ResultSource::ClientSide);
    assert_eq!(result.rows.len(), 7);
    assert_eq!(result.totals(), vec![(0..1_100u64).sum::<u64>() as f64]);

    assert_eq!(engine.persist_observations().await.unwrap(), 1);
    let reloaded = ProfileStore::new(Arc::new(TomlProfileRepository::new(Some(temp_dir.path()))));
    let stored = reloaded.load("app").await.unwrap().unwrap();
    assert!(stored.failed_fields.contains("DR_ACC_L2"));

    let mut components = Vec::new();
    while let Ok(event) = events.try_recv() {
        components.push(event.component().to_string());
    }
    assert!(components.iter().any(|c| c == "aggregation"));
    assert!(components.iter().any(|c| c == "orchestrator"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_engines_sharing_a_profile_keep_each_others_flags() {
    let temp_dir = TempDir::new().unwrap();
    let first = engine(temp_dir.path());
    let second = engine(temp_dir.path());

    let by_account = QuerySpec::new("16528")
        .group_by("DR_ACC_L2")
        .metric(Metric::sum("Amount"));
    let by_entity = QuerySpec::new("16528")
        .group_by("Entity")
        .metric(Metric::sum("Amount"));
    first.orchestrator.aggregate_query(&by_account).await.unwrap();
    second.orchestrator.aggregate_query(&by_entity).await.unwrap();

    let (a, b) = tokio::join!(first.persist_observations(), second.persist_observations());
    assert_eq!(a.unwrap(), 1);
    assert_eq!(b.unwrap(), 1);

    let reloaded = ProfileStore::new(Arc::new(TomlProfileRepository::new(Some(temp_dir.path()))));
    let stored = reloaded.load("app").await.unwrap().unwrap();
    assert!(stored.failed_fields.contains("DR_ACC_L2"));
    assert!(stored.failed_fields.contains("Entity"));
}

#[tokio::test]
async fn test_engine_exposes_table_discovery() {
    let temp_dir = TempDir::new().unwrap();
    let engine = engine(temp_dir.path());

    let tables = engine.orchestrator.list_tables().await.unwrap();
    assert_eq!(tables.len(), 1);
    assert_eq!(tables[0].id, "16528");
    assert!(engine.catalog.schema("missing").await.is_err());
}
