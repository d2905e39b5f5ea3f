//! End-to-end pipeline runs against the in-memory store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use migrator::config::Config;
use migrator::pipeline::{MigrationState, Orchestrator};
use migrator::repository::memory::InMemoryRepository;
use migrator::repository::{StatusDocument, StepRepository};
use migrator::status::StepExecutionStatus;
use migrator::steps::resolve::internal_tenant_index;

const DESTINATION: &str = "tenant_data_v2";

fn test_config(tenants: &[&str]) -> Config {
    let mut config = Config::default();
    config.migration.tenants = tenants.iter().map(ToString::to_string).collect();
    config.migration.slice_count = 2;
    config.migration.batch_size = 3;
    config.migration.retry_attempts = 2;
    config.migration.retry_min_delay_ms = 1;
    config.migration.retry_max_delay_ms = 2;
    config
}

/// Seed the global tenant plus one concrete index per tenant, wired up the
/// way the resolution step expects: aliases pointing at concrete indices.
async fn seed_cluster(repo: &InMemoryRepository, global_docs: usize, tenants: &[(&str, usize)]) {
    repo.seed_index("global_docs", global_docs).await;
    repo.seed_alias("global_tenant", "global_docs").await;
    for (tenant, docs) in tenants {
        let concrete = format!("idx_{tenant}");
        repo.seed_index(&concrete, *docs).await;
        repo.seed_alias(&internal_tenant_index(tenant), &concrete)
            .await;
    }
}

#[tokio::test]
async fn test_successful_run_consolidates_all_tenants() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_cluster(&repo, 5, &[("alpha", 3), ("beta", 2)]).await;
    let config = test_config(&["alpha", "beta"]);

    let orchestrator = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config);
    let report = orchestrator.run().await;

    assert_eq!(report.state, MigrationState::Completed);
    assert_eq!(report.status, StepExecutionStatus::Ok);
    assert!(report.failure.is_none());
    assert_eq!(report.executed.len(), 12);
    assert!(report.compensations.is_empty());

    // All documents landed in the destination, id-scoped per source.
    assert_eq!(repo.doc_count(DESTINATION).await, 10);
    assert!(!repo.is_blocked(DESTINATION).await);

    // Sources are gone, backups are kept.
    assert!(!repo.has_index("global_docs").await);
    assert!(!repo.has_index("idx_alpha").await);
    assert!(!repo.has_index("idx_beta").await);
    let backups = repo.list_indices("backup_*").await.unwrap();
    assert_eq!(backups.len(), 3);

    let doc = repo.status_document().await.unwrap();
    assert_eq!(doc.state, MigrationState::Completed);
    assert_eq!(doc.run_id, report.run_id);
}

#[tokio::test]
async fn test_backup_verification_failure_rolls_back() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_cluster(&repo, 4, &[("alpha", 2)]).await;
    // The source claims more documents than any copy can deliver, so the
    // backup verification comes up short.
    repo.override_count("idx_alpha", 1000).await;
    let config = test_config(&["alpha"]);

    let orchestrator = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config);
    let report = orchestrator.run().await;

    assert_eq!(report.state, MigrationState::RolledBack);
    assert_eq!(report.status, StepExecutionStatus::Rollback);
    assert_eq!(
        report.failure.as_ref().unwrap().status,
        StepExecutionStatus::MissingDocumentsInBackupError
    );

    // Reverse order: the backups go first, then the write blocks.
    let names: Vec<&str> = report
        .compensations
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(names, ["delete-backup", "unblock-writes"]);

    // The cluster is back to its pre-run shape.
    assert!(repo.has_index("global_docs").await);
    assert!(repo.has_index("idx_alpha").await);
    assert!(!repo.is_blocked("global_docs").await);
    assert!(!repo.is_blocked("idx_alpha").await);
    assert!(repo.list_indices("backup_*").await.unwrap().is_empty());
    assert!(!repo.has_index(DESTINATION).await);

    assert_eq!(
        repo.status_document().await.unwrap().state,
        MigrationState::RolledBack
    );
}

#[tokio::test]
async fn test_destination_verification_failure_deletes_destination() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_cluster(&repo, 4, &[("alpha", 2)]).await;
    // The destination reports fewer documents than were copied.
    repo.override_count(DESTINATION, 1).await;
    let config = test_config(&["alpha"]);

    let orchestrator = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config);
    let report = orchestrator.run().await;

    assert_eq!(report.state, MigrationState::RolledBack);
    assert_eq!(
        report.failure.as_ref().unwrap().status,
        StepExecutionStatus::MissingDocumentsInGlobalTenantIndexError
    );

    let names: Vec<&str> = report
        .compensations
        .iter()
        .map(|c| c.name.as_str())
        .collect();
    assert_eq!(
        names,
        ["delete-global-index", "delete-backup", "unblock-writes"]
    );

    // Sources were never deleted; the half-filled destination is gone.
    assert!(repo.has_index("idx_alpha").await);
    assert!(!repo.has_index(DESTINATION).await);
    assert!(!repo.is_blocked("idx_alpha").await);
}

#[tokio::test]
async fn test_early_refusal_runs_no_compensations() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_cluster(&repo, 4, &[("alpha", 2)]).await;
    // Leftovers from a previous run that already filled the destination.
    repo.seed_index(DESTINATION, 6).await;
    repo.seed_index("backup_global_docs_20240601103000", 4).await;
    let config = test_config(&["alpha"]);

    let orchestrator = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config);
    let report = orchestrator.run().await;

    assert_eq!(
        report.failure.as_ref().unwrap().status,
        StepExecutionStatus::BackupContainsMigratedDataError
    );
    // Resolution succeeded, then the precheck refused.
    assert_eq!(report.executed.len(), 2);
    assert_eq!(report.executed[1].name, "check-previous-backup");
    // Nothing executed had a compensation, so the rollback is trivially done.
    assert_eq!(report.state, MigrationState::RolledBack);
    assert!(report.compensations.is_empty());
    // Nothing was mutated.
    assert_eq!(repo.doc_count(DESTINATION).await, 6);
    assert!(!repo.is_blocked("idx_alpha").await);
}

#[tokio::test]
async fn test_concurrent_run_is_locked_out() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_cluster(&repo, 2, &[]).await;
    repo.force_status_document(StatusDocument::new(Uuid::new_v4(), MigrationState::Running))
        .await;
    let config = test_config(&[]);

    let orchestrator = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config);
    let report = orchestrator.run().await;

    assert_eq!(report.state, MigrationState::Failed);
    assert_eq!(
        report.status,
        StepExecutionStatus::MigrationAlreadyInProgressError
    );
    // No step ran and the cluster was not touched.
    assert_eq!(report.executed.len(), 1);
    assert_eq!(report.executed[0].name, "acquire-migration-lock");
    assert!(repo.has_index("global_docs").await);
    assert!(!repo.is_blocked("global_docs").await);
}

#[tokio::test]
async fn test_stale_lock_is_taken_over_and_run_completes() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_cluster(&repo, 2, &[]).await;
    let mut abandoned = StatusDocument::new(Uuid::new_v4(), MigrationState::Running);
    abandoned.last_updated_at = Utc::now() - Duration::seconds(7200);
    repo.force_status_document(abandoned).await;
    let config = test_config(&[]);

    let orchestrator = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config);
    let report = orchestrator.run().await;

    assert_eq!(report.state, MigrationState::Completed);
    let doc = repo.status_document().await.unwrap();
    assert_eq!(doc.run_id, report.run_id);
    assert_eq!(doc.state, MigrationState::Completed);
}

#[tokio::test]
async fn test_finished_run_allows_the_next_one() {
    let repo = Arc::new(InMemoryRepository::new());
    seed_cluster(&repo, 3, &[]).await;
    let config = test_config(&[]);

    let first = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config)
        .run()
        .await;
    assert_eq!(first.state, MigrationState::Completed);

    // The second run starts from the post-migration cluster: the destination
    // is populated, so it must refuse rather than double-migrate.
    let second = Orchestrator::new(Arc::clone(&repo) as Arc<dyn StepRepository>, &config)
        .run()
        .await;
    assert_ne!(
        second.status,
        StepExecutionStatus::MigrationAlreadyInProgressError,
        "a finished run must not hold the lock"
    );
    assert_eq!(
        second.failure.as_ref().unwrap().status,
        StepExecutionStatus::BackupContainsMigratedDataError
    );
}
