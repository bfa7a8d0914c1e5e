//! Catalog tests: bootstrap from registries and the dev-broker spec
//! operations.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;

use broker_core::{BrokerConfig, ClusterConfig, Spec};
use broker_engine::*;
use broker_runner::{Cluster, MockRunner, MockSandbox};
use broker_state::{Dao, StateStore};

/// Registry that always fails to load.
struct Unreachable {
    fatal: bool,
}

#[async_trait]
impl Registry for Unreachable {
    fn name(&self) -> &str {
        "unreachable"
    }

    async fn load_specs(&self) -> Result<(Vec<Spec>, usize), RegistryError> {
        Err(RegistryError::MissingDirectory {
            name: "unreachable".into(),
            path: "/nowhere".into(),
        })
    }

    fn fail(&self, _err: &RegistryError) -> bool {
        self.fatal
    }
}

async fn broker(registries: Vec<Arc<dyn Registry>>, config: BrokerConfig) -> (Broker, Dao) {
    let dao = Dao::new(StateStore::open_in_memory().unwrap());
    let cluster = Cluster::new(
        Arc::new(MockRunner::new()),
        Arc::new(MockSandbox::new()),
        ClusterConfig::default(),
    );
    let engine = start_engine(dao.clone(), cluster.clone(), 20).await.unwrap();
    (
        Broker::new(dao.clone(), cluster, engine, registries, config),
        dao,
    )
}

fn write_spec(dir: &Path, file: &str, image: &str) {
    let spec = json!({
        "image": image,
        "description": format!("{image} service"),
        "plans": [{"name": "default"}, {"name": "prod"}]
    });
    std::fs::write(dir.join(file), spec.to_string()).unwrap();
}

fn local_registry(dir: &Path) -> Arc<dyn Registry> {
    Arc::new(DirectoryRegistry::new("local", dir))
}

fn dev_config() -> BrokerConfig {
    BrokerConfig {
        dev_broker: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn bootstrap_replaces_catalog() {
    let dir = tempfile::tempdir().unwrap();
    write_spec(dir.path(), "pg.json", "org/postgresql-apb");
    write_spec(dir.path(), "redis.json", "org/redis-apb");
    std::fs::write(dir.path().join("junk.json"), "[").unwrap();

    let (broker, dao) = broker(vec![local_registry(dir.path())], BrokerConfig::default()).await;

    let mut stale: Spec = serde_json::from_value(json!({"image": "org/old"})).unwrap();
    stale.assign_identity("old");
    dao.set_spec(&stale).unwrap();

    let response = broker.bootstrap().await.unwrap();
    assert_eq!(response.spec_count, 2);
    assert_eq!(response.image_count, 3);
    assert!(dao.get_spec(&stale.id).unwrap_err().is_not_found());

    let catalog = broker.catalog().await.unwrap();
    let mut names: Vec<&str> = catalog.services.iter().map(|s| s.name.as_str()).collect();
    names.sort();
    assert_eq!(names, vec!["local-org-postgresql-apb", "local-org-redis-apb"]);
    assert_eq!(catalog.services[0].plans.len(), 2);
}

#[tokio::test]
async fn bootstrap_tolerates_some_failing_registries() {
    let dir = tempfile::tempdir().unwrap();
    write_spec(dir.path(), "pg.json", "org/postgresql-apb");

    let (broker, _) = broker(
        vec![Arc::new(Unreachable { fatal: false }), local_registry(dir.path())],
        BrokerConfig::default(),
    )
    .await;
    assert_eq!(broker.bootstrap().await.unwrap().spec_count, 1);
}

#[tokio::test]
async fn bootstrap_fails_when_every_registry_fails() {
    let (broker, _) = broker(
        vec![Arc::new(Unreachable { fatal: false })],
        BrokerConfig::default(),
    )
    .await;
    assert!(matches!(
        broker.bootstrap().await.unwrap_err(),
        BrokerError::AllRegistriesFailed
    ));
}

#[tokio::test]
async fn fatal_registry_aborts_bootstrap() {
    let dir = tempfile::tempdir().unwrap();
    write_spec(dir.path(), "pg.json", "org/postgresql-apb");

    let (broker, _) = broker(
        vec![Arc::new(Unreachable { fatal: true }), local_registry(dir.path())],
        BrokerConfig::default(),
    )
    .await;
    assert!(matches!(
        broker.bootstrap().await.unwrap_err(),
        BrokerError::Registry(_)
    ));
}

#[tokio::test]
async fn bootstrap_with_no_registries_is_empty() {
    let (broker, _) = broker(Vec::new(), BrokerConfig::default()).await;
    let response = broker.bootstrap().await.unwrap();
    assert_eq!(response, BootstrapResponse::default());
}

#[tokio::test]
async fn dev_operations_add_and_remove_specs() {
    let (broker, dao) = broker(Vec::new(), dev_config()).await;
    let spec: Spec = serde_json::from_value(json!({
        "image": "org/mysql-apb",
        "description": "MySQL",
        "plans": [{"name": "default"}]
    }))
    .unwrap();

    let service = broker.add_spec(spec).await.unwrap();
    assert_eq!(service.name, format!("{PUSH_REGISTRY}-org-mysql-apb"));
    assert!(dao.get_spec(&service.id).is_ok());

    broker.remove_spec(&service.id).await.unwrap();
    assert!(matches!(
        broker.remove_spec(&service.id).await.unwrap_err(),
        BrokerError::NotFound(_)
    ));

    let invalid: Spec = serde_json::from_value(json!({"image": "org/empty"})).unwrap();
    assert!(matches!(
        broker.add_spec(invalid).await.unwrap_err(),
        BrokerError::InvalidSpec(_)
    ));
}

#[tokio::test]
async fn remove_specs_clears_catalog() {
    let dir = tempfile::tempdir().unwrap();
    write_spec(dir.path(), "pg.json", "org/postgresql-apb");
    let (broker, _) = broker(vec![local_registry(dir.path())], dev_config()).await;
    broker.bootstrap().await.unwrap();

    assert_eq!(broker.remove_specs().await.unwrap(), 1);
    assert!(broker.catalog().await.unwrap().services.is_empty());
}

#[tokio::test]
async fn dev_operations_require_dev_broker() {
    let (broker, _) = broker(Vec::new(), BrokerConfig::default()).await;
    assert!(matches!(
        broker.remove_specs().await.unwrap_err(),
        BrokerError::DevBrokerDisabled
    ));
}
