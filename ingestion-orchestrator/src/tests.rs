use std::{sync::Arc, time::Duration};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use common::{
    error::AppError,
    provider::{
        memory::{InMemoryIndexProvider, ProviderCall},
        IngestionJobStatus, ProviderError, Readiness,
    },
    storage::{
        paths::{pending_document_key, pending_tenant_prefix, tenant_docs_prefix, tenant_hash},
        store::{BlobAttributes, StorageManager},
        types::{
            dispatch_task::{DispatchTask, TaskState},
            document::{Document, DocumentChanges},
            sync_status::{SyncEvent, SyncStatus},
            tenant_index::TenantIndex,
        },
    },
    utils::config::StorageKind,
};
use object_store::{
    memory::InMemory,
    throttle::{ThrottleConfig, ThrottledStore},
};
use serde_json::json;

use crate::{
    documents::FIRST_UPLOAD_MESSAGE,
    orchestrator::{Operation, OperationRequest},
    testing::{fast_settings, TestHarness},
};

async fn harness() -> TestHarness {
    TestHarness::new().await.expect("test harness")
}

async fn doc(harness: &TestHarness, document_id: &str) -> Document {
    Document::get(document_id, &harness.db)
        .await
        .expect("load document")
        .expect("document exists")
}

/// Stores a document that is already syncing under `job_id`.
async fn syncing_document(harness: &TestHarness, tenant_id: &str, job_id: &str) -> String {
    let document_id = uuid::Uuid::new_v4().to_string();
    Document::new(
        document_id.clone(),
        tenant_id,
        "a.txt",
        "text/plain",
        3,
        format!("docs/{}/{document_id}/a.txt", tenant_hash(tenant_id)),
        SyncStatus::Uploaded,
        None,
    )
    .expect("entry state")
    .insert(&harness.db)
    .await
    .expect("insert");

    let changes = DocumentChanges {
        ingestion_job_id: Some(job_id.to_string()),
        ..Default::default()
    };
    Document::transition(&document_id, SyncEvent::StartSync, changes, &harness.db)
        .await
        .expect("transition")
        .expect("document was uploaded");
    document_id
}

#[tokio::test]
async fn first_upload_is_parked_then_indexed_after_background_creation() {
    let harness = harness().await;
    let documents = harness.orchestrator.documents();

    let receipt = documents
        .process_document("tenant-a", "report.pdf", Bytes::from_static(b"%PDF-1.7"))
        .await
        .expect("upload");
    assert_eq!(receipt.sync_status, SyncStatus::CreatingIndex);
    assert_eq!(receipt.message, FIRST_UPLOAD_MESSAGE);

    let parked = doc(&harness, &receipt.document_id).await;
    assert!(parked.storage_key.starts_with("pending/tenant-a/"));
    assert_eq!(parked.content_type, "application/pdf");

    let results = harness.run_dispatched().await;
    assert_eq!(results.len(), 1);
    assert!(results.iter().all(Result::is_ok));

    let status = documents
        .get_sync_status("tenant-a", &receipt.document_id)
        .await
        .expect("status");
    assert!(matches!(
        status.sync_status,
        SyncStatus::Processing | SyncStatus::Syncing | SyncStatus::Completed
    ));

    let listed = documents.list_documents("tenant-a").await.expect("list");
    assert_eq!(listed.len(), 1);
    assert!(listed[0]
        .storage_key
        .starts_with(&tenant_docs_prefix(&tenant_hash("tenant-a"))));

    let leftovers = harness
        .storage
        .list(Some(&pending_tenant_prefix("tenant-a")))
        .await
        .expect("list pending");
    assert!(leftovers.is_empty());
}

#[tokio::test]
async fn upload_with_existing_index_takes_the_fast_path() {
    let harness = harness().await;
    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-b")
        .await
        .expect("index");

    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-b", "notes.txt", Bytes::from_static(b"hello"))
        .await
        .expect("upload");

    assert_eq!(receipt.sync_status, SyncStatus::Processing);
    assert!(harness.dispatcher.take().await.is_empty());

    let stored = doc(&harness, &receipt.document_id).await;
    assert_eq!(stored.sync_status, SyncStatus::Syncing);
    assert_eq!(stored.index_id.as_deref(), Some(index.index_id.as_str()));
    assert!(stored.ingestion_job_id.is_some());
    assert!(harness
        .storage
        .exists(&stored.storage_key)
        .await
        .expect("head"));

    let record = TenantIndex::get("tenant-b", &harness.db)
        .await
        .expect("load")
        .expect("record");
    assert_eq!(record.document_count, 1);
}

#[tokio::test]
async fn stale_index_record_is_replaced_by_a_new_index() {
    let harness = harness().await;
    let provisioner = harness.orchestrator.provisioner();
    let first = provisioner.get_or_create("tenant-c").await.expect("first");

    assert!(harness.provider.remove_knowledge_base(&first.index_id).await);

    let second = provisioner.get_or_create("tenant-c").await.expect("second");
    assert_ne!(first.index_id, second.index_id);

    let records = TenantIndex::list_all(&harness.db).await.expect("list");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].index_id, second.index_id);
}

#[tokio::test]
async fn one_completed_job_completes_every_document_it_carries() {
    let harness = harness().await;
    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-d")
        .await
        .expect("index");
    let job_id = harness
        .orchestrator
        .services()
        .provider
        .start_ingestion_job(&index.index_id, &index.ingest_source_id, "batch")
        .await
        .expect("job");

    let first = syncing_document(&harness, "tenant-d", &job_id).await;
    let second = syncing_document(&harness, "tenant-d", &job_id).await;
    assert!(
        harness
            .provider
            .set_job_status(&job_id, IngestionJobStatus::Complete, Vec::new())
            .await
    );

    let report = harness
        .orchestrator
        .reconciler()
        .reconcile("tenant-d")
        .await
        .expect("reconcile");
    assert_eq!(report.updated_count, 2);
    assert_eq!(report.completed, 2);
    assert_eq!(doc(&harness, &first).await.sync_status, SyncStatus::Completed);
    assert_eq!(doc(&harness, &second).await.sync_status, SyncStatus::Completed);

    let again = harness
        .orchestrator
        .reconciler()
        .reconcile("tenant-d")
        .await
        .expect("reconcile again");
    assert_eq!(again.updated_count, 0);
}

#[tokio::test]
async fn failed_job_fails_documents_with_its_reasons() {
    let harness = harness().await;
    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-f")
        .await
        .expect("index");
    let job_id = harness
        .orchestrator
        .services()
        .provider
        .start_ingestion_job(&index.index_id, &index.ingest_source_id, "batch")
        .await
        .expect("job");
    let document_id = syncing_document(&harness, "tenant-f", &job_id).await;

    harness
        .provider
        .set_job_status(
            &job_id,
            IngestionJobStatus::Failed,
            vec!["unsupported format".into(), "empty file".into()],
        )
        .await;

    let report = harness
        .orchestrator
        .reconciler()
        .reconcile("tenant-f")
        .await
        .expect("reconcile");
    assert_eq!(report.failed, 1);

    let failed = doc(&harness, &document_id).await;
    assert_eq!(failed.sync_status, SyncStatus::Failed);
    assert_eq!(
        failed.error_message.as_deref(),
        Some("unsupported format; empty file")
    );

    // A late completion report cannot revive a failed document.
    harness
        .provider
        .set_job_status(&job_id, IngestionJobStatus::Complete, Vec::new())
        .await;
    let later = harness
        .orchestrator
        .reconciler()
        .reconcile("tenant-f")
        .await
        .expect("reconcile");
    assert_eq!(later.updated_count, 0);
    assert_eq!(doc(&harness, &document_id).await.sync_status, SyncStatus::Failed);
}

#[tokio::test]
async fn reconcile_all_visits_every_tenant_with_work_in_flight() {
    let harness = harness().await;
    let mut jobs = Vec::new();
    for tenant_id in ["tenant-x", "tenant-y"] {
        let index = harness
            .orchestrator
            .provisioner()
            .get_or_create(tenant_id)
            .await
            .expect("index");
        let job_id = harness
            .orchestrator
            .services()
            .provider
            .start_ingestion_job(&index.index_id, &index.ingest_source_id, "batch")
            .await
            .expect("job");
        syncing_document(&harness, tenant_id, &job_id).await;
        jobs.push(job_id);
    }
    for job_id in &jobs {
        harness
            .provider
            .set_job_status(job_id, IngestionJobStatus::Complete, Vec::new())
            .await;
    }

    let report = harness
        .orchestrator
        .reconciler()
        .reconcile_all()
        .await
        .expect("reconcile all");
    assert_eq!(report.completed, 2);
    assert!(Document::tenants_with_in_flight(&harness.db)
        .await
        .expect("tenants")
        .is_empty());
}

#[tokio::test]
async fn deleting_a_document_survives_a_blob_store_failure() {
    let throttled = ThrottledStore::new(
        InMemory::new(),
        ThrottleConfig {
            wait_delete_per_call: Duration::from_millis(500),
            ..ThrottleConfig::default()
        },
    );
    let storage = StorageManager::with_backend(Arc::new(throttled), StorageKind::Memory)
        .with_operation_timeout(Duration::from_millis(50));
    let harness = TestHarness::with_storage(storage).await.expect("harness");

    harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-e")
        .await
        .expect("index");
    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-e", "notes.txt", Bytes::from_static(b"bye"))
        .await
        .expect("upload");
    let jobs_before = harness.provider.jobs().await.len();

    let deleted = harness
        .orchestrator
        .documents()
        .delete_document("tenant-e", &receipt.document_id)
        .await
        .expect("delete");

    assert!(deleted.deleted);
    assert!(!deleted.blob_deleted);
    assert!(deleted.resync_job_id.is_some());
    assert_eq!(harness.provider.jobs().await.len(), jobs_before + 1);
    assert!(Document::get(&receipt.document_id, &harness.db)
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn foreign_tenant_cannot_delete_or_read_a_document() {
    let harness = harness().await;
    let receipt = harness
        .orchestrator
        .documents()
        .process_document("owner", "secret.txt", Bytes::from_static(b"s"))
        .await
        .expect("upload");

    let response = harness
        .orchestrator
        .handle(OperationRequest::new(
            "intruder",
            Operation::DeleteDocument {
                document_id: receipt.document_id.clone(),
            },
        ))
        .await;
    assert_eq!(response.status_code, 404);

    let response = harness
        .orchestrator
        .handle(OperationRequest::new(
            "intruder",
            Operation::GetSyncStatus {
                document_id: receipt.document_id.clone(),
            },
        ))
        .await;
    assert_eq!(response.status_code, 404);

    let kept = doc(&harness, &receipt.document_id).await;
    assert_eq!(kept.tenant_id, "owner");
    assert!(harness
        .storage
        .exists(&kept.storage_key)
        .await
        .expect("head blob"));
}

#[tokio::test]
async fn failed_parked_document_is_never_moved_into_the_tenant_prefix() {
    let harness = harness().await;
    let documents = harness.orchestrator.documents();
    let receipt = documents
        .process_document("tenant-p", "secret.txt", Bytes::from_static(b"secret"))
        .await
        .expect("upload");
    let waiting = documents
        .process_document("tenant-p", "kept.txt", Bytes::from_static(b"kept"))
        .await
        .expect("second upload");
    documents
        .fail_document(
            "tenant-p",
            &receipt.document_id,
            &AppError::Provider("index creation rejected".to_string()),
        )
        .await;

    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-p")
        .await
        .expect("index");
    let docs_prefix = tenant_docs_prefix(&index.tenant_hash);

    let failed = doc(&harness, &receipt.document_id).await;
    assert_eq!(failed.sync_status, SyncStatus::Failed);
    assert!(failed.storage_key.starts_with("pending/tenant-p/"));
    assert!(harness
        .storage
        .exists(&failed.storage_key)
        .await
        .expect("head parked blob"));

    let placed: Vec<String> = harness
        .storage
        .list(Some(&docs_prefix))
        .await
        .expect("list docs")
        .into_iter()
        .map(|object| object.location.to_string())
        .collect();
    assert_eq!(placed.len(), 1);
    assert!(placed[0].contains(&waiting.document_id));

    let report = harness
        .orchestrator
        .execute(OperationRequest::new("tenant-p", Operation::ProcessPending))
        .await
        .expect("process pending");
    assert_eq!(report["migrated"], json!([]));
    assert_eq!(report["left_pending"], json!([receipt.document_id.clone()]));

    documents
        .delete_document("tenant-p", &receipt.document_id)
        .await
        .expect("delete");
    assert!(harness
        .storage
        .list(Some(&pending_tenant_prefix("tenant-p")))
        .await
        .expect("list pending")
        .is_empty());
    let placed = harness
        .storage
        .list(Some(&docs_prefix))
        .await
        .expect("list docs");
    assert!(placed
        .iter()
        .all(|object| !object.location.to_string().contains(&receipt.document_id)));
}

#[tokio::test]
async fn pending_blob_without_a_record_is_left_alone() {
    let harness = harness().await;
    let key = pending_document_key("tenant-o", "doc-in-flight", "a.txt");
    harness
        .storage
        .put(&key, Bytes::from_static(b"a"), BlobAttributes::default())
        .await
        .expect("park blob");

    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-o")
        .await
        .expect("index");

    assert!(harness.storage.exists(&key).await.expect("head"));
    assert!(harness
        .storage
        .list(Some(&tenant_docs_prefix(&index.tenant_hash)))
        .await
        .expect("list docs")
        .is_empty());
    assert!(harness.provider.jobs().await.is_empty());
}

#[tokio::test]
async fn tenant_ids_with_key_encoded_characters_are_rejected() {
    let harness = harness().await;
    let response = harness
        .orchestrator
        .handle_value(json!({
            "operation": "upload_document",
            "tenant_id": "acme{eu}",
            "filename": "one.txt",
            "content": STANDARD.encode(b"1")
        }))
        .await;
    assert_eq!(response.status_code, 400);
    assert!(harness.storage.list(None).await.expect("list").is_empty());
}

#[tokio::test]
async fn punctuated_tenant_ids_still_migrate_in_one_batch() {
    let harness = harness().await;
    let documents = harness.orchestrator.documents();
    let tenant_id = "ops@acme.example";
    for name in ["one.txt", "two.txt"] {
        documents
            .process_document(tenant_id, name, Bytes::from_static(b"x"))
            .await
            .expect("upload");
    }

    harness
        .orchestrator
        .provisioner()
        .get_or_create(tenant_id)
        .await
        .expect("index");

    let listed = documents.list_documents(tenant_id).await.expect("list");
    assert_eq!(listed.len(), 2);
    assert!(listed
        .iter()
        .all(|document| document.sync_status == SyncStatus::Syncing));
    assert_eq!(harness.provider.jobs().await.len(), 1);
}

#[tokio::test]
async fn queue_outage_on_first_upload_returns_a_failed_receipt() {
    let harness = harness().await;
    harness.dispatcher.set_unavailable(true);

    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-q", "late.txt", Bytes::from_static(b"late"))
        .await
        .expect("upload is acknowledged");
    assert_eq!(receipt.sync_status, SyncStatus::Failed);
    assert!(receipt.message.contains("Failed to queue index creation"));

    let stored = doc(&harness, &receipt.document_id).await;
    assert_eq!(stored.sync_status, SyncStatus::Failed);
    assert_eq!(stored.error_message.as_deref(), Some(receipt.message.as_str()));
    assert!(harness.dispatcher.take().await.is_empty());
}

#[tokio::test]
async fn concurrent_get_or_create_keeps_a_single_record() {
    let harness = harness().await;
    let provisioner = harness.orchestrator.provisioner();

    let (left, right) = tokio::join!(
        provisioner.get_or_create("tenant-race"),
        provisioner.get_or_create("tenant-race")
    );
    let left = left.expect("left");
    let right = right.expect("right");

    assert_eq!(left.index_id, right.index_id);
    assert_eq!(TenantIndex::list_all(&harness.db).await.expect("list").len(), 1);
    assert_eq!(
        harness.provider.knowledge_base_ids().await,
        vec![left.index_id.clone()]
    );
}

#[tokio::test]
async fn get_or_create_is_idempotent() {
    let harness = harness().await;
    let provisioner = harness.orchestrator.provisioner();

    let first = provisioner.get_or_create("tenant-i").await.expect("first");
    let second = provisioner.get_or_create("tenant-i").await.expect("second");

    assert_eq!(first.index_id, second.index_id);
    assert_eq!(
        harness
            .provider
            .call_count(ProviderCall::CreateKnowledgeBase)
            .await,
        1
    );
}

#[tokio::test]
async fn provisioned_resources_follow_tenant_configuration() {
    let harness = harness().await;
    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-cfg")
        .await
        .expect("index");

    let vector_index = harness
        .provider
        .vector_index(&index.vector_bucket_name, &index.vector_index_name)
        .await
        .expect("vector index");
    assert_eq!(vector_index.dimension, 1024);
    assert_eq!(vector_index.data_type, "float32");

    let settings = &harness.orchestrator.services().settings;
    let kb = harness
        .provider
        .knowledge_base_spec(&index.index_id)
        .await
        .expect("knowledge base");
    assert_eq!(kb.embedding_model, settings.model_arn(&settings.embedding_model));
    assert!(kb.vector_index_arn.ends_with(&index.vector_index_name));

    let sources = harness.provider.data_sources(&index.index_id).await;
    assert_eq!(sources.len(), 1);
    assert_eq!(
        sources[0].inclusion_prefixes,
        vec![tenant_docs_prefix(&tenant_hash("tenant-cfg"))]
    );
    assert_eq!(sources[0].chunking.max_tokens, 500);
    assert_eq!(sources[0].chunking.overlap_percentage, 10);
}

#[tokio::test]
async fn pending_documents_share_one_ingestion_job() {
    let harness = harness().await;
    let documents = harness.orchestrator.documents();

    let first = documents
        .process_document("tenant-m", "one.txt", Bytes::from_static(b"1"))
        .await
        .expect("first");
    let second = documents
        .process_document("tenant-m", "two.txt", Bytes::from_static(b"2"))
        .await
        .expect("second");
    assert_eq!(harness.dispatcher.take().await.len(), 2);

    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-m")
        .await
        .expect("index");

    let first = doc(&harness, &first.document_id).await;
    let second = doc(&harness, &second.document_id).await;
    assert_eq!(first.sync_status, SyncStatus::Syncing);
    assert_eq!(second.sync_status, SyncStatus::Syncing);
    assert!(first.ingestion_job_id.is_some());
    assert_eq!(first.ingestion_job_id, second.ingestion_job_id);
    assert_eq!(harness.provider.jobs().await.len(), 1);

    let record = TenantIndex::get("tenant-m", &harness.db)
        .await
        .expect("load")
        .expect("record");
    assert_eq!(record.index_id, index.index_id);
    assert_eq!(record.document_count, 2);
}

#[tokio::test]
async fn redelivered_create_and_process_is_a_no_op() {
    let harness = harness().await;
    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-r", "r.txt", Bytes::from_static(b"r"))
        .await
        .expect("upload");
    let request = harness
        .dispatcher
        .take()
        .await
        .pop()
        .expect("dispatched request");

    harness
        .orchestrator
        .execute(request.clone())
        .await
        .expect("first delivery");
    let replay = harness
        .orchestrator
        .execute(request)
        .await
        .expect("second delivery");

    assert_eq!(replay["already_handled"], json!(true));
    assert_eq!(harness.provider.jobs().await.len(), 1);
    assert_eq!(
        doc(&harness, &receipt.document_id).await.sync_status,
        SyncStatus::Syncing
    );
}

#[tokio::test]
async fn failed_provisioning_cleans_up_created_resources() {
    let harness = harness().await;
    harness
        .provider
        .fail_next(
            ProviderCall::CreateDataSource,
            ProviderError::Rejected("bad prefix".into()),
        )
        .await;

    let err = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-x1")
        .await
        .expect_err("provisioning fails");
    assert!(matches!(err, AppError::Provider(_)));

    assert!(harness.provider.knowledge_base_ids().await.is_empty());
    assert_eq!(
        harness
            .provider
            .call_count(ProviderCall::DeleteVectorBucket)
            .await,
        1
    );
    assert!(TenantIndex::get("tenant-x1", &harness.db)
        .await
        .expect("load")
        .is_none());
}

#[tokio::test]
async fn index_that_never_becomes_ready_aborts_provisioning() {
    let harness =
        TestHarness::with_provider(InMemoryIndexProvider::with_readiness(Readiness::NotReady), fast_settings())
            .await
            .expect("harness");

    let err = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-slow")
        .await
        .expect_err("never ready");
    assert!(matches!(err, AppError::ProviderTransient(_)));
    assert_eq!(
        harness
            .provider
            .call_count(ProviderCall::VectorIndexReadiness)
            .await,
        3
    );
    assert_eq!(
        harness
            .provider
            .call_count(ProviderCall::CreateKnowledgeBase)
            .await,
        0
    );
}

#[tokio::test]
async fn missing_readiness_signal_falls_back_to_settle_delay() {
    let harness =
        TestHarness::with_provider(InMemoryIndexProvider::with_readiness(Readiness::NoSignal), fast_settings())
            .await
            .expect("harness");

    harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-quiet")
        .await
        .expect("provisioned");
    assert_eq!(
        harness
            .provider
            .call_count(ProviderCall::VectorIndexReadiness)
            .await,
        1
    );
}

#[tokio::test]
async fn trigger_failure_marks_fast_path_upload_failed() {
    let harness = harness().await;
    harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-t")
        .await
        .expect("index");
    harness
        .provider
        .fail_next(
            ProviderCall::StartIngestionJob,
            ProviderError::Rejected("quota".into()),
        )
        .await;

    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-t", "t.txt", Bytes::from_static(b"t"))
        .await
        .expect("upload still succeeds");

    assert_eq!(receipt.sync_status, SyncStatus::Failed);
    let stored = doc(&harness, &receipt.document_id).await;
    assert_eq!(stored.sync_status, SyncStatus::Failed);
    assert!(stored
        .error_message
        .as_deref()
        .is_some_and(|message| message.starts_with("Failed to start ingestion")));
}

#[tokio::test]
async fn stats_and_tenant_delete() {
    let harness = harness().await;
    let index = harness
        .orchestrator
        .provisioner()
        .get_or_create("tenant-s")
        .await
        .expect("index");
    harness
        .provider
        .set_vector_count(&index.vector_bucket_name, &index.vector_index_name, 42)
        .await;

    let stats = harness
        .orchestrator
        .execute(OperationRequest::new("tenant-s", Operation::Stats))
        .await
        .expect("stats");
    assert_eq!(stats["vector_count"], json!(42));
    assert_eq!(stats["knowledge_base_id"], json!(index.index_id));

    let deleted = harness
        .orchestrator
        .execute(OperationRequest::new("tenant-s", Operation::Delete))
        .await
        .expect("delete");
    assert_eq!(deleted["deleted"], json!(true));
    assert!(harness.provider.knowledge_base_ids().await.is_empty());
    assert!(!harness.provider.bucket_exists(&index.vector_bucket_name).await);

    let response = harness
        .orchestrator
        .handle(OperationRequest::new("tenant-s", Operation::Stats))
        .await;
    assert_eq!(response.status_code, 404);
}

#[tokio::test]
async fn entrypoint_validates_requests() {
    let harness = harness().await;

    let missing_tenant = harness
        .orchestrator
        .handle_value(json!({ "operation": "list_documents" }))
        .await;
    assert_eq!(missing_tenant.status_code, 400);

    let unknown = harness
        .orchestrator
        .handle_value(json!({ "operation": "explode", "tenant_id": "t" }))
        .await;
    assert_eq!(unknown.status_code, 400);

    let bad_content = harness
        .orchestrator
        .handle_value(json!({
            "operation": "upload_document",
            "tenant_id": "t",
            "filename": "a.txt",
            "content": "not base64!!"
        }))
        .await;
    assert_eq!(bad_content.status_code, 400);

    let listed = harness
        .orchestrator
        .handle_value(json!({ "operation": "list_all" }))
        .await;
    assert_eq!(listed.status_code, 200);
    assert_eq!(listed.body["count"], json!(0));
}

#[tokio::test]
async fn tenant_operations_without_an_index_are_not_found() {
    let harness = harness().await;

    for operation in [Operation::ProcessPending, Operation::Stats] {
        let response = harness
            .orchestrator
            .handle(OperationRequest::new("tenant-none", operation))
            .await;
        assert_eq!(response.status_code, 404);
    }
    assert!(harness.provider.jobs().await.is_empty());

    let deleted = harness
        .orchestrator
        .handle(OperationRequest::new("tenant-none", Operation::Delete))
        .await;
    assert_eq!(deleted.status_code, 200);
    assert_eq!(deleted.body["deleted"], json!(false));
}

#[tokio::test]
async fn upload_through_the_entrypoint_decodes_base64() {
    let harness = harness().await;
    let response = harness
        .orchestrator
        .handle_value(json!({
            "operation": "upload_document",
            "user_id": "tenant-u",
            "filename": "hello.txt",
            "content": STANDARD.encode(b"hello world")
        }))
        .await;

    assert_eq!(response.status_code, 200);
    assert_eq!(response.body["sync_status"], json!("creating_index"));

    let listed = harness
        .orchestrator
        .execute(OperationRequest::new("tenant-u", Operation::ListDocuments))
        .await
        .expect("list");
    assert_eq!(listed["count"], json!(1));
    assert_eq!(listed["documents"][0]["size"], json!(11));
}

#[tokio::test]
async fn queue_worker_completes_first_upload() {
    let harness = TestHarness::with_queue().await.expect("harness");
    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-q", "q.txt", Bytes::from_static(b"q"))
        .await
        .expect("upload");

    assert_eq!(harness.run_queue().await.expect("drain"), 1);
    assert_eq!(
        doc(&harness, &receipt.document_id).await.sync_status,
        SyncStatus::Syncing
    );
    assert!(DispatchTask::unfinished(&harness.db)
        .await
        .expect("unfinished")
        .is_empty());
}

#[tokio::test]
async fn queue_redelivers_after_transient_provider_failure() {
    let harness = TestHarness::with_queue().await.expect("harness");
    harness
        .provider
        .fail_next(
            ProviderCall::CreateKnowledgeBase,
            ProviderError::Unavailable("throttled".into()),
        )
        .await;

    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-retry", "r.txt", Bytes::from_static(b"r"))
        .await
        .expect("upload");

    assert_eq!(harness.run_queue().await.expect("drain"), 2);
    assert_eq!(
        doc(&harness, &receipt.document_id).await.sync_status,
        SyncStatus::Syncing
    );
    let tasks: Vec<DispatchTask> = harness.db.get_all_stored_items().await.expect("tasks");
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].state, TaskState::Succeeded);
    assert_eq!(tasks[0].attempts, 2);
}

#[tokio::test]
async fn permanent_failure_dead_letters_and_fails_the_document() {
    let harness = TestHarness::with_queue().await.expect("harness");
    let receipt = harness
        .orchestrator
        .documents()
        .process_document("tenant-lost", "gone.txt", Bytes::from_static(b"g"))
        .await
        .expect("upload");
    let parked = doc(&harness, &receipt.document_id).await;
    harness
        .storage
        .delete(&parked.storage_key)
        .await
        .expect("remove parked blob");

    assert_eq!(harness.run_queue().await.expect("drain"), 1);

    let failed = doc(&harness, &receipt.document_id).await;
    assert_eq!(failed.sync_status, SyncStatus::Failed);
    let tasks: Vec<DispatchTask> = harness.db.get_all_stored_items().await.expect("tasks");
    assert_eq!(tasks[0].state, TaskState::DeadLetter);
}
