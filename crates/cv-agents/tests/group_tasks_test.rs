mod common;

use std::time::Duration;

use common::{ledger, manager};
use cv_agents::group_tasks::{GroupTaskError, GroupTasks};
use cv_agents::membership::MembershipError;
use cv_bridge::transport::InProcessBroker;
use cv_core::types::{GroupTaskFilter, GroupTaskStatus, TaskDirection};

const SLOW: Duration = Duration::from_secs(60);

#[tokio::test]
async fn test_submit_requires_membership() {
    let broker = InProcessBroker::new();
    let db = ledger().await;
    let tasks = GroupTasks::new(manager(&broker, "a1", db.clone(), SLOW), db.clone());

    let err = tasks.submit_task(None, "d", "c").await.unwrap_err();
    assert!(matches!(err, GroupTaskError::Membership(MembershipError::NotActive)));
    assert!(tasks.list(GroupTaskFilter::default()).await.unwrap().is_empty());

    let err = tasks
        .respond_task("T1", "c", cv_core::types::ResponseStatus::Completed)
        .await
        .unwrap_err();
    assert!(matches!(err, GroupTaskError::Membership(MembershipError::NotActive)));
}

#[tokio::test]
async fn test_submit_records_outgoing_task() {
    let broker = InProcessBroker::new();
    let db = ledger().await;
    let membership = manager(&broker, "a1", db.clone(), SLOW);
    membership.join().await.unwrap();
    let tasks = GroupTasks::new(membership, db.clone());

    let id = tasks.submit_task(None, "research", "find x").await.unwrap();
    assert_eq!(id.len(), 32);
    let rec = tasks.get(&id).await.unwrap().unwrap();
    assert_eq!(rec.direction, TaskDirection::Outgoing);
    assert_eq!(rec.requester_id, "a1");
    assert_eq!(rec.status, GroupTaskStatus::Pending);

    let outgoing = tasks
        .list(GroupTaskFilter {
            direction: Some(TaskDirection::Outgoing),
            ..GroupTaskFilter::default()
        })
        .await
        .unwrap();
    assert_eq!(outgoing.len(), 1);
    let incoming = tasks
        .list(GroupTaskFilter {
            direction: Some(TaskDirection::Incoming),
            ..GroupTaskFilter::default()
        })
        .await
        .unwrap();
    assert!(incoming.is_empty());
}

#[tokio::test]
async fn test_unsent_request_is_marked_failed() {
    let broker = InProcessBroker::new();
    let db = ledger().await;
    let membership = manager(&broker, "a1", db.clone(), SLOW);
    membership.join().await.unwrap();
    let tasks = GroupTasks::new(membership, db.clone());

    broker.set_offline(true);
    let err = tasks
        .submit_task(Some("T-off".into()), "d", "c")
        .await
        .unwrap_err();
    assert!(matches!(err, GroupTaskError::Membership(MembershipError::Transport(_))));

    let rec = tasks.get("T-off").await.unwrap().unwrap();
    assert_eq!(rec.status, GroupTaskStatus::Failed);
}
