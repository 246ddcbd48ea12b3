use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tempfile::TempDir;

use provisio_core::allocation::{
    AllocationEngine, AllocationStore, AvailabilityQuery, CreateRequest, OperationContext,
};
use provisio_core::approvals::UserDirectory;
use provisio_core::domain::approval::ApprovalStatus;
use provisio_core::domain::request::{
    ProvenanceFields, RequestSnapshot, RequestStatus, ResourceRequestId,
};
use provisio_core::domain::resource::{
    PhaseId, ProjectPhase, Resource, ResourceId, ResourceTemplate, TemplateId,
};
use provisio_core::domain::user::{Caller, DirectoryUser, Role, UserId};
use provisio_core::errors::{AllocationError, StoreError};
use provisio_core::flows::engine::RequestStateMachine;
use provisio_core::flows::states::{ActionCommand, CreationPlan, TransitionPlan};
use provisio_core::ledger::{Availability, AvailabilityReport};
use provisio_core::notify::{
    InMemoryNotifier, Notification, NotificationKind, Notifier, NotifyError,
};
use provisio_db::repositories::CatalogRepository;
use provisio_db::{
    connect_with_settings, migrations, DbPool, InMemoryAllocationStore, SqlAllocationStore,
    SqlCatalogRepository, SqlUserDirectory,
};

const PHASE: &str = "phase-1";

struct Harness<S, D> {
    engine: Arc<AllocationEngine<S, D, InMemoryNotifier>>,
    notifier: InMemoryNotifier,
    _dir: Option<TempDir>,
}

async fn seed(catalog: &impl CatalogRepository) {
    catalog
        .save_phase(ProjectPhase {
            id: PhaseId(PHASE.to_string()),
            project_name: "Atlas".to_string(),
            phase_name: "Build".to_string(),
        })
        .await
        .expect("seed phase");

    let resources = [
        ("res-pool", "Build VMs", "vm", 5, 0),
        ("res-db", "Managed Postgres", "database", 10, 1),
        ("res-cache", "Redis", "cache", 10, 0),
    ];
    for (id, name, resource_type, quantity, approval_levels) in resources {
        catalog
            .save_resource(Resource {
                id: ResourceId(id.to_string()),
                phase_id: PhaseId(PHASE.to_string()),
                name: name.to_string(),
                resource_type: resource_type.to_string(),
                quantity,
                consumed_quantity: 0,
                approval_levels,
            })
            .await
            .expect("seed resource");
    }

    let templates = [
        ("tpl-gpu", "GPU cluster", "gpu", 3, json!({ "nodes": 4 })),
        ("tpl-laptop", "Laptop", "laptop", 0, json!({ "os": "linux" })),
    ];
    for (id, name, resource_type, approval_levels, default_config) in templates {
        catalog
            .save_template(ResourceTemplate {
                id: TemplateId(id.to_string()),
                name: name.to_string(),
                resource_type: resource_type.to_string(),
                approval_levels,
                default_config,
            })
            .await
            .expect("seed template");
    }

    let users = [
        ("u-emp", Role::Employee),
        ("u-dh", Role::DepartmentHead),
        ("u-ith", Role::ItHead),
        ("u-ith-2", Role::ItHead),
        ("u-admin", Role::Admin),
    ];
    for (id, role) in users {
        catalog
            .save_user(DirectoryUser {
                id: UserId(id.to_string()),
                display_name: id.to_string(),
                email: Some(format!("{id}@example.test")),
                role,
            })
            .await
            .expect("seed user");
    }
}

async fn seeded_pool() -> (TempDir, DbPool) {
    let dir = TempDir::new().expect("temp dir");
    let url = format!("sqlite://{}", dir.path().join("provisio.db").display());
    let pool = connect_with_settings(&url, 8, 30).await.expect("connect");
    migrations::run_pending(&pool).await.expect("migrations");
    seed(&SqlCatalogRepository::new(pool.clone())).await;
    (dir, pool)
}

async fn sql_harness() -> Harness<SqlAllocationStore, SqlUserDirectory> {
    let (dir, pool) = seeded_pool().await;

    let notifier = InMemoryNotifier::default();
    let engine = AllocationEngine::new(
        SqlAllocationStore::new(pool.clone()),
        SqlUserDirectory::new(pool),
        notifier.clone(),
    );
    Harness { engine: Arc::new(engine), notifier, _dir: Some(dir) }
}

async fn memory_harness() -> Harness<InMemoryAllocationStore, InMemoryAllocationStore> {
    let store = InMemoryAllocationStore::new();
    seed(&store).await;

    let notifier = InMemoryNotifier::default();
    let engine = AllocationEngine::new(store.clone(), store, notifier.clone());
    Harness { engine: Arc::new(engine), notifier, _dir: None }
}

fn as_user(id: &str, role: Role) -> OperationContext {
    OperationContext::new(Caller::new(id, role))
}

fn employee() -> OperationContext {
    as_user("u-emp", Role::Employee)
}

fn request_for(provenance: ProvenanceFields, requested_qty: u32) -> CreateRequest {
    CreateRequest {
        phase_id: PhaseId(PHASE.to_string()),
        provenance,
        requested_qty,
        requested_config: serde_json::Value::Null,
        justification: Some("release testing".to_string()),
    }
}

fn on_resource(id: &str, requested_qty: u32) -> CreateRequest {
    request_for(
        ProvenanceFields { resource_id: Some(id.to_string()), ..ProvenanceFields::default() },
        requested_qty,
    )
}

fn on_template(id: &str, requested_qty: u32) -> CreateRequest {
    request_for(
        ProvenanceFields {
            resource_template_id: Some(id.to_string()),
            ..ProvenanceFields::default()
        },
        requested_qty,
    )
}

fn on_type(resource_type: &str, requested_qty: u32) -> CreateRequest {
    request_for(
        ProvenanceFields {
            resource_type: Some(resource_type.to_string()),
            ..ProvenanceFields::default()
        },
        requested_qty,
    )
}

async fn resource_availability<S, D>(harness: &Harness<S, D>, id: &str) -> Availability
where
    S: AllocationStore,
    D: UserDirectory,
{
    harness
        .engine
        .availability(&AvailabilityQuery::Resource { resource_id: ResourceId(id.to_string()) })
        .await
        .expect("availability")
        .availability()
        .expect("ledger availability")
}

fn assert_invariants(snapshot: &RequestSnapshot) {
    let request = &snapshot.request;
    assert!(request.current_level <= request.required_levels);
    if request.status == RequestStatus::Rejected {
        let rejecting = request.current_level + 1;
        assert!(snapshot.approvals.iter().all(|record| record.approval_level <= rejecting));
    }
    let mut levels: Vec<u8> = snapshot.approvals.iter().map(|record| record.approval_level).collect();
    levels.dedup();
    assert_eq!(levels.len(), snapshot.approvals.len(), "one record per level");
}

async fn scenario_a_resource_pool_is_exhausted<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let created =
        harness.engine.create_request(&employee(), on_resource("res-pool", 5)).await.expect("fits");
    assert_eq!(created.request.status, RequestStatus::Approved);
    assert_eq!(created.request.required_levels, 0);
    assert!(created.approvals.is_empty());
    assert_eq!(resource_availability(harness, "res-pool").await.consumed, 5);

    let error = harness
        .engine
        .create_request(&employee(), on_resource("res-pool", 1))
        .await
        .expect_err("pool is exhausted");
    assert_eq!(
        error,
        AllocationError::InsufficientCapacity { requested: 1, available: 0, total: 5, consumed: 5 }
    );

    let created_events = harness.notifier.of_kind(NotificationKind::Created);
    assert_eq!(created_events.len(), 1, "failures never notify");
    assert_eq!(created_events[0].recipients, vec![UserId("u-emp".to_string())]);
}

async fn scenario_b_three_level_chain_reaches_it<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let created =
        harness.engine.create_request(&employee(), on_template("tpl-gpu", 2)).await.expect("create");
    let id = created.request.id.clone();
    assert_eq!(created.request.status, RequestStatus::Pending);
    assert_eq!(created.request.required_levels, 3);
    assert_eq!(created.request.requested_config, json!({ "nodes": 4 }));
    let first = created.record_at(1).expect("level 1 record");
    assert_eq!(first.status, ApprovalStatus::Pending);
    assert_eq!(first.approver_id, Some(UserId("u-dh".to_string())));

    let after_dh = harness
        .engine
        .act(&as_user("u-dh", Role::DepartmentHead), &id, ActionCommand::approve())
        .await
        .expect("level 1");
    assert_eq!(after_dh.request.status, RequestStatus::InProgress);
    assert_eq!(after_dh.request.current_level, 1);
    let second = after_dh.record_at(2).expect("level 2 record");
    assert_eq!(second.status, ApprovalStatus::Pending);
    assert_eq!(second.approver_id, Some(UserId("u-ith".to_string())));

    let after_ith = harness
        .engine
        .act(&as_user("u-ith-2", Role::ItHead), &id, ActionCommand::approve().expecting_level(2))
        .await
        .expect("level 2");
    assert_eq!(after_ith.request.current_level, 2);
    assert_eq!(
        after_ith.record_at(2).and_then(|record| record.approver_id.clone()),
        Some(UserId("u-ith-2".to_string())),
        "any caller at the level may act, not only the pre-assigned approver",
    );

    let done = harness
        .engine
        .act(&as_user("u-admin", Role::Admin), &id, ActionCommand::approve())
        .await
        .expect("level 3");
    assert_eq!(done.request.status, RequestStatus::AssignedToIt);
    assert_eq!(done.request.current_level, 3);
    assert_eq!(done.approvals.len(), 3);
    assert!(done.approvals.iter().all(|record| record.status == ApprovalStatus::Approved));
    assert_invariants(&done);

    let advanced = harness.notifier.of_kind(NotificationKind::Advanced);
    assert_eq!(advanced.len(), 2);
    assert_eq!(
        advanced[0].recipients,
        vec![UserId("u-emp".to_string()), UserId("u-ith".to_string()), UserId("u-ith-2".to_string())]
    );
    let assigned = harness.notifier.of_kind(NotificationKind::AssignedToIt);
    assert_eq!(assigned.len(), 1);
    assert!(assigned[0].recipients.contains(&UserId("u-ith".to_string())));
    assert!(assigned[0].recipients.contains(&UserId("u-emp".to_string())));

    let closed = harness
        .engine
        .act(&as_user("u-admin", Role::Admin), &id, ActionCommand::approve())
        .await
        .expect_err("chain is complete");
    assert!(matches!(closed, AllocationError::CompletedWorkflow { current_level: 3, .. }));
}

async fn scenario_c_wrong_level_is_refused<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let created =
        harness.engine.create_request(&employee(), on_template("tpl-gpu", 1)).await.expect("create");
    let id = created.request.id.clone();
    harness
        .engine
        .act(&as_user("u-dh", Role::DepartmentHead), &id, ActionCommand::approve())
        .await
        .expect("level 1");

    let error = harness
        .engine
        .act(&as_user("u-dh", Role::DepartmentHead), &id, ActionCommand::approve())
        .await
        .expect_err("department head cannot act on level 2");
    assert_eq!(error, AllocationError::InsufficientLevel { caller_level: 1, required_level: 2 });

    let ahead = harness
        .engine
        .act(&as_user("u-admin", Role::Admin), &id, ActionCommand::approve())
        .await
        .expect_err("admin cannot skip ahead");
    assert_eq!(ahead, AllocationError::InsufficientLevel { caller_level: 3, required_level: 2 });

    let unchanged = harness.engine.get_request(&id).await.expect("lookup");
    assert_eq!(unchanged.request.current_level, 1);
    assert_eq!(unchanged.request.status, RequestStatus::InProgress);
}

async fn scenario_d_rejection_is_terminal<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let created =
        harness.engine.create_request(&employee(), on_template("tpl-gpu", 1)).await.expect("create");
    let id = created.request.id.clone();

    let rejected = harness
        .engine
        .act(&as_user("u-dh", Role::DepartmentHead), &id, ActionCommand::reject("budget"))
        .await
        .expect("reject");
    assert_eq!(rejected.request.status, RequestStatus::Rejected);
    assert_eq!(rejected.request.rejection_reason.as_deref(), Some("budget"));
    assert_eq!(rejected.request.current_level, 0);
    assert_eq!(rejected.approvals.len(), 1);
    assert_eq!(rejected.approvals[0].status, ApprovalStatus::Rejected);
    assert_eq!(rejected.approvals[0].comments.as_deref(), Some("budget"));
    assert_invariants(&rejected);

    let error = harness
        .engine
        .act(&as_user("u-ith", Role::ItHead), &id, ActionCommand::approve())
        .await
        .expect_err("rejected is terminal");
    assert!(matches!(
        error,
        AllocationError::CompletedWorkflow { status: RequestStatus::Rejected, .. }
    ));

    let notices = harness.notifier.of_kind(NotificationKind::Rejected);
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].recipients, vec![UserId("u-emp".to_string())]);
    assert_eq!(notices[0].payload.get("rejection_reason").map(String::as_str), Some("budget"));
}

async fn scenario_e_derived_type_capacity<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let pending =
        harness.engine.create_request(&employee(), on_type("database", 4)).await.expect("pending");
    assert_eq!(pending.request.status, RequestStatus::Pending);

    for quantity in [5, 3] {
        let created = harness
            .engine
            .create_request(&employee(), on_type("Database", quantity))
            .await
            .expect("prior request");
        assert_eq!(created.request.required_levels, 1);
        harness
            .engine
            .act(&as_user("u-dh", Role::DepartmentHead), &created.request.id, ActionCommand::approve())
            .await
            .expect("grant prior request");
    }

    let report = harness
        .engine
        .availability(&AvailabilityQuery::ResourceType {
            phase_id: PhaseId(PHASE.to_string()),
            resource_type: "DATABASE".to_string(),
        })
        .await
        .expect("derived availability");
    assert_eq!(report.availability(), Some(Availability { available: 2, total: 10, consumed: 8 }));

    let error = harness
        .engine
        .create_request(&employee(), on_type("database", 3))
        .await
        .expect_err("only two left");
    assert!(matches!(error, AllocationError::InsufficientCapacity { available: 2, .. }));

    harness.engine.create_request(&employee(), on_type(" database ", 2)).await.expect("fits");
    assert_eq!(resource_availability(harness, "res-db").await.consumed, 0, "row counter untouched");
}

async fn pending_type_requests_reserve_nothing<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let mut ids = Vec::new();
    for _ in 0..2 {
        let created = harness
            .engine
            .create_request(&employee(), on_type("database", 6))
            .await
            .expect("fits while nothing is granted");
        assert_eq!(created.request.status, RequestStatus::Pending);
        ids.push(created.request.id);
    }

    for id in &ids {
        let granted = harness
            .engine
            .act(&as_user("u-dh", Role::DepartmentHead), id, ActionCommand::approve())
            .await
            .expect("approval does not re-check the pool");
        assert_eq!(granted.request.status, RequestStatus::AssignedToIt);
    }

    let report = harness
        .engine
        .availability(&AvailabilityQuery::ResourceType {
            phase_id: PhaseId(PHASE.to_string()),
            resource_type: "database".to_string(),
        })
        .await
        .expect("derived availability");
    assert_eq!(report.availability(), Some(Availability { available: 0, total: 10, consumed: 12 }));

    let error = harness
        .engine
        .create_request(&employee(), on_type("database", 1))
        .await
        .expect_err("pool is spent");
    assert!(matches!(error, AllocationError::InsufficientCapacity { available: 0, .. }));
}

async fn templates_bypass_capacity_and_zero_depth_auto_approves<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let oversized = harness
        .engine
        .create_request(&employee(), on_template("tpl-gpu", 10_000))
        .await
        .expect("templates are approver-judged");
    assert_eq!(oversized.request.status, RequestStatus::Pending);

    let laptop = harness
        .engine
        .create_request(&employee(), on_template("tpl-laptop", 1))
        .await
        .expect("zero-depth template");
    assert_eq!(laptop.request.status, RequestStatus::Approved);
    assert!(laptop.approvals.is_empty());
    assert_eq!(laptop.request.requested_config, json!({ "os": "linux" }));

    let report = harness
        .engine
        .availability(&AvailabilityQuery::Template { template_id: TemplateId("tpl-gpu".into()) })
        .await
        .expect("template availability");
    assert_eq!(report, AvailabilityReport::Unbounded);
}

async fn malformed_requests_are_refused<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let ambiguous = request_for(
        ProvenanceFields {
            resource_id: Some("res-pool".to_string()),
            resource_type: Some("vm".to_string()),
            ..ProvenanceFields::default()
        },
        1,
    );
    let error = harness.engine.create_request(&employee(), ambiguous).await.expect_err("ambiguous");
    assert!(matches!(error, AllocationError::Validation { ref field, .. } if field == "provenance"));

    let error = harness
        .engine
        .create_request(&employee(), on_resource("res-pool", 0))
        .await
        .expect_err("zero quantity");
    assert!(matches!(error, AllocationError::Validation { ref field, .. } if field == "requested_qty"));

    let error = harness
        .engine
        .create_request(&employee(), on_type("mainframe", 1))
        .await
        .expect_err("no such type in phase");
    assert!(matches!(error, AllocationError::NotFound { entity: "resource_type", .. }));

    let mut elsewhere = on_resource("res-pool", 1);
    elsewhere.phase_id = PhaseId("phase-unknown".to_string());
    let error = harness.engine.create_request(&employee(), elsewhere).await.expect_err("phase");
    assert!(matches!(error, AllocationError::NotFound { entity: "project_phase", .. }));

    let error = harness
        .engine
        .get_request(&provisio_core::domain::request::ResourceRequestId("nope".to_string()))
        .await
        .expect_err("unknown request");
    assert!(matches!(error, AllocationError::NotFound { entity: "resource_request", .. }));

    assert!(harness.notifier.notifications().is_empty());
}

async fn stale_expected_level_is_refused_without_writes<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let created =
        harness.engine.create_request(&employee(), on_template("tpl-gpu", 1)).await.expect("create");
    let id = created.request.id.clone();
    harness
        .engine
        .act(&as_user("u-dh", Role::DepartmentHead), &id, ActionCommand::approve().expecting_level(1))
        .await
        .expect("level 1");

    let error = harness
        .engine
        .act(&as_user("u-ith", Role::ItHead), &id, ActionCommand::approve().expecting_level(1))
        .await
        .expect_err("caller saw level 1");
    assert!(matches!(error, AllocationError::StaleLevel { expected_level: 1, current_level: 1, .. }));

    let snapshot = harness.engine.get_request(&id).await.expect("lookup");
    assert_eq!(snapshot.request.current_level, 1);
    assert!(snapshot.record_at(2).is_some_and(|record| record.is_pending()));
}

async fn concurrent_creates_never_overdraw_the_ledger<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore + 'static,
    D: UserDirectory + 'static,
{
    let mut tasks = Vec::new();
    for _ in 0..12 {
        let engine = Arc::clone(&harness.engine);
        tasks.push(tokio::spawn(async move {
            engine.create_request(&employee(), on_resource("res-pool", 1)).await
        }));
    }

    let mut granted = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(snapshot) => {
                assert_eq!(snapshot.request.status, RequestStatus::Approved);
                granted += 1;
            }
            Err(AllocationError::InsufficientCapacity { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(granted, 5);
    let availability = resource_availability(harness, "res-pool").await;
    assert_eq!(availability, Availability { available: 0, total: 5, consumed: 5 });
}

async fn concurrent_type_creates_respect_derived_capacity<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore + 'static,
    D: UserDirectory + 'static,
{
    let mut tasks = Vec::new();
    for _ in 0..8 {
        let engine = Arc::clone(&harness.engine);
        tasks.push(tokio::spawn(async move {
            engine.create_request(&employee(), on_type("cache", 3)).await
        }));
    }

    let mut granted = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(_) => granted += 1,
            Err(AllocationError::InsufficientCapacity { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert_eq!(granted, 3);
    let report = harness
        .engine
        .availability(&AvailabilityQuery::ResourceType {
            phase_id: PhaseId(PHASE.to_string()),
            resource_type: "cache".to_string(),
        })
        .await
        .expect("availability");
    assert_eq!(report.availability().map(|availability| availability.consumed), Some(9));
}

async fn concurrent_approvals_have_a_single_winner<S, D>(harness: &Harness<S, D>)
where
    S: AllocationStore + 'static,
    D: UserDirectory + 'static,
{
    let created =
        harness.engine.create_request(&employee(), on_template("tpl-gpu", 1)).await.expect("create");
    let id = created.request.id.clone();

    let mut tasks = Vec::new();
    for _ in 0..2 {
        let engine = Arc::clone(&harness.engine);
        let id = id.clone();
        tasks.push(tokio::spawn(async move {
            engine
                .act(&as_user("u-dh", Role::DepartmentHead), &id, ActionCommand::approve())
                .await
        }));
    }

    let mut wins = 0;
    for task in tasks {
        match task.await.expect("task") {
            Ok(_) => wins += 1,
            Err(AllocationError::StaleLevel { .. } | AllocationError::InsufficientLevel { .. }) => {}
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }
    assert_eq!(wins, 1);

    let snapshot = harness.engine.get_request(&id).await.expect("lookup");
    assert_eq!(snapshot.request.current_level, 1);
    assert_eq!(snapshot.approvals.len(), 2);
    assert_eq!(
        snapshot.approvals.iter().filter(|record| record.status == ApprovalStatus::Approved).count(),
        1
    );
    assert_invariants(&snapshot);
    assert_eq!(harness.notifier.of_kind(NotificationKind::Advanced).len(), 1);
}

macro_rules! on_both_stores {
    ($($scenario:ident),* $(,)?) => {
        mod sql_store {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $scenario() {
                    let harness = super::sql_harness().await;
                    super::$scenario(&harness).await;
                }
            )*
        }

        mod memory_store {
            $(
                #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
                async fn $scenario() {
                    let harness = super::memory_harness().await;
                    super::$scenario(&harness).await;
                }
            )*
        }
    };
}

on_both_stores!(
    scenario_a_resource_pool_is_exhausted,
    scenario_b_three_level_chain_reaches_it,
    scenario_c_wrong_level_is_refused,
    scenario_d_rejection_is_terminal,
    scenario_e_derived_type_capacity,
    pending_type_requests_reserve_nothing,
    templates_bypass_capacity_and_zero_depth_auto_approves,
    malformed_requests_are_refused,
    stale_expected_level_is_refused_without_writes,
    concurrent_creates_never_overdraw_the_ledger,
    concurrent_type_creates_respect_derived_capacity,
    concurrent_approvals_have_a_single_winner,
);

/// Refuses every delivery, as an unreachable webhook would.
#[derive(Default)]
struct UnreachableNotifier {
    attempts: AtomicUsize,
}

impl Notifier for UnreachableNotifier {
    fn notify(&self, _notification: Notification) -> Result<(), NotifyError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(NotifyError::Unavailable("connection refused".to_string()))
    }
}

async fn delivery_failures_leave_outcomes_intact<S, D>(store: S, directory: D)
where
    S: AllocationStore,
    D: UserDirectory,
{
    let notifier = Arc::new(UnreachableNotifier::default());
    let engine = AllocationEngine::new(store, directory, Arc::clone(&notifier));

    let direct = engine
        .create_request(&employee(), on_resource("res-pool", 2))
        .await
        .expect("create survives a failed notification");
    assert_eq!(direct.request.status, RequestStatus::Approved);

    let created = engine
        .create_request(&employee(), on_type("database", 2))
        .await
        .expect("create survives a failed notification");
    assert_eq!(created.request.status, RequestStatus::Pending);

    let assigned = engine
        .act(&as_user("u-dh", Role::DepartmentHead), &created.request.id, ActionCommand::approve())
        .await
        .expect("act survives a failed notification");
    assert_eq!(assigned.request.status, RequestStatus::AssignedToIt);

    let stored = engine.get_request(&created.request.id).await.expect("lookup");
    assert_eq!(stored.request.status, RequestStatus::AssignedToIt);
    assert_eq!(stored.request.current_level, 1);
    assert_eq!(stored.approvals[0].status, ApprovalStatus::Approved);

    let pool = engine
        .availability(&AvailabilityQuery::Resource { resource_id: ResourceId("res-pool".to_string()) })
        .await
        .expect("availability")
        .availability()
        .expect("ledger availability");
    assert_eq!(pool.consumed, 2);
    assert_eq!(notifier.attempts.load(Ordering::SeqCst), 3);
}

mod failed_delivery {
    use provisio_db::{InMemoryAllocationStore, SqlAllocationStore, SqlUserDirectory};

    #[tokio::test]
    async fn sql_store_keeps_the_transition() {
        let (_dir, pool) = super::seeded_pool().await;
        super::delivery_failures_leave_outcomes_intact(
            SqlAllocationStore::new(pool.clone()),
            SqlUserDirectory::new(pool),
        )
        .await;
    }

    #[tokio::test]
    async fn memory_store_keeps_the_transition() {
        let store = InMemoryAllocationStore::new();
        super::seed(&store).await;
        super::delivery_failures_leave_outcomes_intact(store.clone(), store).await;
    }
}

/// Lands a competing transition right before the next `apply_transition`.
struct ContendedStore {
    inner: InMemoryAllocationStore,
    competitor: Mutex<Option<TransitionPlan>>,
}

impl ContendedStore {
    fn arm(&self, plan: TransitionPlan) {
        *self.competitor.lock().expect("competitor lock") = Some(plan);
    }
}

#[async_trait]
impl AllocationStore for ContendedStore {
    async fn find_phase(&self, id: &PhaseId) -> Result<Option<ProjectPhase>, StoreError> {
        self.inner.find_phase(id).await
    }

    async fn find_resource(&self, id: &ResourceId) -> Result<Option<Resource>, StoreError> {
        self.inner.find_resource(id).await
    }

    async fn find_template(&self, id: &TemplateId) -> Result<Option<ResourceTemplate>, StoreError> {
        self.inner.find_template(id).await
    }

    async fn find_resource_by_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
    ) -> Result<Option<Resource>, StoreError> {
        self.inner.find_resource_by_type(phase_id, resource_type).await
    }

    async fn granted_quantity_for_type(
        &self,
        phase_id: &PhaseId,
        resource_type: &str,
        excluding: Option<&ResourceRequestId>,
    ) -> Result<u64, StoreError> {
        self.inner.granted_quantity_for_type(phase_id, resource_type, excluding).await
    }

    async fn find_request(
        &self,
        id: &ResourceRequestId,
    ) -> Result<Option<RequestSnapshot>, StoreError> {
        self.inner.find_request(id).await
    }

    async fn insert_request(&self, plan: &CreationPlan) -> Result<RequestSnapshot, StoreError> {
        self.inner.insert_request(plan).await
    }

    async fn apply_transition(&self, plan: &TransitionPlan) -> Result<RequestSnapshot, StoreError> {
        let competitor = self.competitor.lock().expect("competitor lock").take();
        if let Some(competitor) = competitor {
            self.inner.apply_transition(&competitor).await.expect("competing transition");
        }
        self.inner.apply_transition(plan).await
    }
}

#[tokio::test]
async fn losing_to_a_rejection_reports_completed_workflow() {
    let store = InMemoryAllocationStore::new();
    seed(&store).await;
    let contended = ContendedStore { inner: store.clone(), competitor: Mutex::new(None) };
    let engine = AllocationEngine::new(contended, store, InMemoryNotifier::default());

    let created =
        engine.create_request(&employee(), on_template("tpl-gpu", 1)).await.expect("create");
    let id = created.request.id.clone();
    let rejection = RequestStateMachine::new()
        .plan_action(
            &created,
            &Caller::new("u-dh", Role::DepartmentHead),
            &ActionCommand::reject("duplicate ask"),
            Utc::now(),
        )
        .expect("competing rejection");
    engine.store().arm(rejection);

    let error = engine
        .act(&as_user("u-dh", Role::DepartmentHead), &id, ActionCommand::approve())
        .await
        .expect_err("the rejection won");
    assert!(matches!(
        error,
        AllocationError::CompletedWorkflow {
            status: RequestStatus::Rejected,
            current_level: 0,
            required_levels: 3,
            ..
        }
    ));

    let stored = engine.get_request(&id).await.expect("lookup");
    assert_eq!(stored.request.status, RequestStatus::Rejected);
    assert_eq!(stored.request.rejection_reason.as_deref(), Some("duplicate ask"));
    assert_eq!(stored.approvals.len(), 1);
}
