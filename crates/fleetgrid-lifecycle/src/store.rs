//! Store access used by the lifecycle reconciler.

use chrono::{DateTime, Utc};
use fleetgrid_state::{Agent, LifecycleRecord, StateResult, StateStore};

/// The agent and lifecycle-record operations the reconciler performs.
pub trait LifecycleStore: Send + Sync {
    fn get_agent(&self, agent_id: &str) -> StateResult<Option<Agent>>;

    fn find_agent_by_instance_id(&self, instance_id: &str) -> StateResult<Option<Agent>>;

    fn update_agent_shutdown_flag(
        &self,
        agent_id: &str,
        request_shutdown: bool,
        now: DateTime<Utc>,
    ) -> StateResult<bool>;

    fn get_lifecycle_record(&self, agent_id: &str) -> StateResult<Option<LifecycleRecord>>;

    fn put_lifecycle_record(&self, record: &LifecycleRecord) -> StateResult<()>;

    fn list_lifecycle_records(&self) -> StateResult<Vec<LifecycleRecord>>;

    fn delete_lifecycle_record(&self, agent_id: &str) -> StateResult<bool>;
}

impl LifecycleStore for StateStore {
    fn get_agent(&self, agent_id: &str) -> StateResult<Option<Agent>> {
        StateStore::get_agent(self, agent_id)
    }

    fn find_agent_by_instance_id(&self, instance_id: &str) -> StateResult<Option<Agent>> {
        StateStore::find_agent_by_instance_id(self, instance_id)
    }

    fn update_agent_shutdown_flag(
        &self,
        agent_id: &str,
        request_shutdown: bool,
        now: DateTime<Utc>,
    ) -> StateResult<bool> {
        StateStore::update_agent_shutdown_flag(self, agent_id, request_shutdown, now)
    }

    fn get_lifecycle_record(&self, agent_id: &str) -> StateResult<Option<LifecycleRecord>> {
        StateStore::get_lifecycle_record(self, agent_id)
    }

    fn put_lifecycle_record(&self, record: &LifecycleRecord) -> StateResult<()> {
        StateStore::put_lifecycle_record(self, record)
    }

    fn list_lifecycle_records(&self) -> StateResult<Vec<LifecycleRecord>> {
        StateStore::list_lifecycle_records(self)
    }

    fn delete_lifecycle_record(&self, agent_id: &str) -> StateResult<bool> {
        StateStore::delete_lifecycle_record(self, agent_id)
    }
}
