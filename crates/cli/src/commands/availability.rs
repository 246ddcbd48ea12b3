use provisio_core::allocation::{AllocationEngine, AvailabilityQuery};
use provisio_core::domain::resource::{PhaseId, ResourceId};
use provisio_core::errors::AllocationError;
use provisio_core::notify::TracingNotifier;
use provisio_db::{SqlAllocationStore, SqlUserDirectory};

use crate::commands::{load_config, open_pool, runtime, CommandResult, StepFailure};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AvailabilityTarget {
    Resource(String),
    ResourceType { phase_id: String, resource_type: String },
}

impl AvailabilityTarget {
    pub fn from_args(
        resource_id: Option<String>,
        phase_id: Option<String>,
        resource_type: Option<String>,
    ) -> Result<Self, String> {
        match (resource_id, phase_id, resource_type) {
            (Some(resource_id), None, None) => Ok(Self::Resource(resource_id)),
            (None, Some(phase_id), Some(resource_type)) => {
                Ok(Self::ResourceType { phase_id, resource_type })
            }
            _ => Err("pass either --resource-id, or both --phase-id and --resource-type"
                .to_string()),
        }
    }

    fn query(self) -> AvailabilityQuery {
        match self {
            Self::Resource(id) => AvailabilityQuery::Resource { resource_id: ResourceId(id) },
            Self::ResourceType { phase_id, resource_type } => {
                AvailabilityQuery::ResourceType { phase_id: PhaseId(phase_id), resource_type }
            }
        }
    }
}

pub fn run(target: AvailabilityTarget) -> CommandResult {
    let config = match load_config("availability") {
        Ok(config) => config,
        Err(failure) => return failure,
    };
    let runtime = match runtime("availability") {
        Ok(runtime) => runtime,
        Err(failure) => return failure,
    };

    let query = target.query();
    let result = runtime.block_on(async {
        let pool = open_pool(&config).await?;
        let engine = AllocationEngine::new(
            SqlAllocationStore::new(pool.clone()),
            SqlUserDirectory::new(pool.clone()),
            TracingNotifier,
        );
        let report = engine.availability(&query).await.map_err(lookup_failure);
        pool.close().await;
        report
    });

    match result {
        Ok(report) => {
            let message = match report.availability() {
                Some(availability) => format!(
                    "{} of {} unit(s) available ({} consumed)",
                    availability.available, availability.total, availability.consumed
                ),
                None => "capacity is not tracked; approvers judge each request".to_string(),
            };
            CommandResult::success_with_data(
                "availability",
                message,
                serde_json::to_value(&report).ok(),
            )
        }
        Err((error_class, message, exit_code)) => {
            CommandResult::failure("availability", error_class, message, exit_code)
        }
    }
}

fn lookup_failure(error: AllocationError) -> StepFailure {
    (error.class().as_str(), error.to_string(), 6u8)
}

#[cfg(test)]
mod tests {
    use super::AvailabilityTarget;

    #[test]
    fn target_requires_one_complete_selector() {
        assert_eq!(
            AvailabilityTarget::from_args(Some("res-1".into()), None, None),
            Ok(AvailabilityTarget::Resource("res-1".into()))
        );
        assert!(AvailabilityTarget::from_args(None, Some("phase-1".into()), None).is_err());
        assert!(AvailabilityTarget::from_args(
            Some("res-1".into()),
            Some("phase-1".into()),
            Some("vm".into())
        )
        .is_err());
    }
}
