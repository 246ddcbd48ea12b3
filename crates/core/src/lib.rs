pub mod allocation;
pub mod approvals;
pub mod config;
pub mod domain;
pub mod errors;
pub mod flows;
pub mod ledger;
pub mod notify;

pub use allocation::{
    AllocationEngine, AllocationStore, AvailabilityQuery, CreateRequest, OperationContext,
};
pub use approvals::{AuthorityResolver, UserDirectory, MAX_APPROVAL_LEVEL};
pub use domain::approval::{ApprovalAction, ApprovalRecord, ApprovalRecordId, ApprovalStatus};
pub use domain::request::{
    Provenance, ProvenanceFields, RequestSnapshot, RequestStatus, ResourceRequest,
    ResourceRequestId,
};
pub use domain::resource::{PhaseId, ProjectPhase, Resource, ResourceId, ResourceTemplate, TemplateId};
pub use domain::user::{Caller, DirectoryUser, Role, UserId};
pub use errors::{AllocationError, ErrorClass, InterfaceError, StoreError};
pub use flows::{ActionCommand, RequestStateMachine};
pub use ledger::{Availability, AvailabilityReport};
pub use notify::{InMemoryNotifier, Notification, NotificationKind, Notifier, NotifyError, TracingNotifier};
