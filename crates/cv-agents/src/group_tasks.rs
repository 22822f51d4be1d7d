use std::sync::Arc;

use cv_bridge::protocol::{Payload, TaskRequestPayload, TaskResponsePayload};
use cv_core::ledger::{LedgerDb, LedgerError};
use cv_core::types::{
    GroupTaskFilter, GroupTaskRecord, GroupTaskStatus, NewGroupTask, ResponseStatus,
    TaskDirection,
};
use cv_telemetry::tracing_setup::generate_trace_id;
use tracing::{info, warn};

use crate::membership::{MembershipError, MembershipManager};

#[derive(Debug, thiserror::Error)]
pub enum GroupTaskError {
    #[error(transparent)]
    Membership(#[from] MembershipError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Cooperative tasks this agent asks of, or answers for, the group.
#[derive(Clone)]
pub struct GroupTasks {
    membership: MembershipManager,
    ledger: Arc<LedgerDb>,
}

impl GroupTasks {
    pub fn new(membership: MembershipManager, ledger: Arc<LedgerDb>) -> Self {
        Self { membership, ledger }
    }

    /// Ask the group to carry out a task and return its id.
    ///
    /// The outgoing record is written before the request goes out, so a fast
    /// response always finds it. A failed publish marks the record failed.
    pub async fn submit_task(
        &self,
        task_id: Option<String>,
        description: &str,
        content: &str,
    ) -> Result<String, GroupTaskError> {
        if !self.membership.is_active() {
            return Err(MembershipError::NotActive.into());
        }
        let task_id = task_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_trace_id);
        let requester_id = self.membership.agent_id().to_string();

        self.ledger
            .insert_group_task(NewGroupTask {
                task_id: task_id.clone(),
                description: description.to_string(),
                content: content.to_string(),
                direction: TaskDirection::Outgoing,
                requester_id: requester_id.clone(),
            })
            .await?;

        let request = Payload::Request(TaskRequestPayload {
            task_id: task_id.clone(),
            description: description.to_string(),
            content: content.to_string(),
            requester_id: requester_id.clone(),
        });
        if let Err(e) = self.membership.publish(task_id.clone(), request).await {
            if let Err(le) = self
                .ledger
                .update_group_task_response(
                    &task_id,
                    TaskDirection::Outgoing,
                    &requester_id,
                    &e.to_string(),
                    GroupTaskStatus::Failed,
                )
                .await
            {
                warn!(task_id = %task_id, error = %le, "failed to mark unsent group task");
            }
            return Err(e.into());
        }

        info!(task_id = %task_id, "group task submitted");
        Ok(task_id)
    }

    /// Answer a request received from the group.
    pub async fn respond_task(
        &self,
        task_id: &str,
        content: &str,
        status: ResponseStatus,
    ) -> Result<(), GroupTaskError> {
        let responder_id = self.membership.agent_id().to_string();
        let response = Payload::Response(TaskResponsePayload {
            task_id: task_id.to_string(),
            responder_id: responder_id.clone(),
            content: content.to_string(),
            status,
        });
        self.membership.publish(task_id.to_string(), response).await?;

        if !self
            .ledger
            .update_group_task_response(
                task_id,
                TaskDirection::Incoming,
                &responder_id,
                content,
                status.into(),
            )
            .await?
        {
            warn!(task_id = %task_id, "responded to a group task with no local record");
        }
        info!(task_id = %task_id, status = %status, "group task answered");
        Ok(())
    }

    pub async fn get(&self, task_id: &str) -> Result<Option<GroupTaskRecord>, LedgerError> {
        self.ledger.get_group_task(task_id).await
    }

    pub async fn list(&self, filter: GroupTaskFilter) -> Result<Vec<GroupTaskRecord>, LedgerError> {
        self.ledger.list_group_tasks(filter).await
    }
}
