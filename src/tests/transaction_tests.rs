use crate::core::errors::BudgetError;
use crate::core::models::event::{ChangeEvent, UpdateOp};
use crate::core::models::transaction::RecordId;
use crate::core::services::ServiceSettings;
use crate::tests::{
    bulk_item, create_test_service, create_test_service_with, expense, owner_with_budget, register_user,
    test_settings,
};

#[tokio::test]
async fn test_groceries_pushed_twice_is_stored_once() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let item = bulk_item(-1, expense(100.0, "Groceries", "2024-01-01"));

    let first = service.bulk_upsert(&owner, budget.id, vec![item.clone()]).await.unwrap();
    assert_eq!(first.created.len(), 1);
    assert!(first.duplicates.is_empty());

    let second = service.bulk_upsert(&owner, budget.id, vec![item]).await.unwrap();
    assert!(second.created.is_empty());
    assert_eq!(second.duplicates.len(), 1);
    assert_eq!(second.duplicates[0].id, first.created[0].id);

    let active = service.list_active(&owner, budget.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].fields.category, "Groceries");
}

#[tokio::test]
async fn test_mapping_resolves_every_client_id() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let items = vec![
        bulk_item(-1, expense(5.0, "Coffee", "2024-03-01")),
        bulk_item(-2, expense(7.5, "Lunch", "2024-03-01")),
    ];
    let outcome = service.bulk_upsert(&owner, budget.id, items).await.unwrap();

    assert_eq!(outcome.created.len(), 2);
    assert_eq!(outcome.mapping.len(), 2);
    assert_eq!(outcome.mapping[0].client_id, Some(RecordId::Int(-1)));
    assert_eq!(outcome.mapping[0].server_id, outcome.created[0].id);
    assert_eq!(outcome.mapping[1].server_id, outcome.created[1].id);
    assert_eq!(outcome.created[1].id, outcome.created[0].id + 1);
    assert!(outcome.created.iter().all(|t| t.created_by == Some(owner.id)));
}

#[tokio::test]
async fn test_repeats_inside_one_batch_collapse() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let fields = expense(20.0, "Taxi", "2024-04-04");
    let items = vec![bulk_item(-1, fields.clone()), bulk_item(-2, fields)];

    let outcome = service.bulk_upsert(&owner, budget.id, items).await.unwrap();
    assert_eq!(outcome.created.len(), 1);
    assert_eq!(outcome.duplicates.len(), 1);
    assert_eq!(outcome.mapping[0].server_id, outcome.mapping[1].server_id);
}

#[tokio::test]
async fn test_distinct_entries_on_same_day_are_kept() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let mut morning = expense(3.0, "Coffee", "2024-05-05");
    morning.created_at = Some(1_000);
    let mut evening = morning.clone();
    evening.created_at = Some(2_000);

    let outcome = service
        .bulk_upsert(&owner, budget.id, vec![bulk_item(-1, morning), bulk_item(-2, evening)])
        .await
        .unwrap();
    assert_eq!(outcome.created.len(), 2);
}

#[tokio::test]
async fn test_pushed_deletion_updates_existing_record() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let item = bulk_item(-1, expense(42.0, "Books", "2024-06-06"));
    let created = service.bulk_upsert(&owner, budget.id, vec![item.clone()]).await.unwrap();
    let server_id = created.created[0].id;

    let mut tombstone = item;
    tombstone.client_id = Some(RecordId::Int(server_id));
    tombstone.deleted_at = Some(1_717_000_000_000);
    let outcome = service.bulk_upsert(&owner, budget.id, vec![tombstone.clone()]).await.unwrap();
    assert_eq!(outcome.updated.len(), 1);
    assert_eq!(outcome.updated[0].deleted_at, Some(1_717_000_000_000));
    assert!(service.list_active(&owner, budget.id).await.unwrap().is_empty());

    // Already deleted: nothing left to propagate.
    let again = service.bulk_upsert(&owner, budget.id, vec![tombstone]).await.unwrap();
    assert_eq!(again.duplicates.len(), 1);
    assert!(again.updated.is_empty());
}

#[tokio::test]
async fn test_new_item_keeps_incoming_deletion() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let mut item = bulk_item(-1, expense(9.0, "Snacks", "2024-07-07"));
    item.deleted_at = Some(123);

    let outcome = service.bulk_upsert(&owner, budget.id, vec![item]).await.unwrap();
    assert_eq!(outcome.created[0].deleted_at, Some(123));
    assert!(service.list_active(&owner, budget.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_single_create_then_push_is_duplicate() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let fields = expense(15.0, "Cinema", "2024-08-08");
    let created = service.create_transaction(&owner, budget.id, fields.clone()).await.unwrap();

    let outcome = service
        .bulk_upsert(&owner, budget.id, vec![bulk_item(-1, fields)])
        .await
        .unwrap();
    assert_eq!(outcome.duplicates.len(), 1);
    assert_eq!(outcome.duplicates[0].id, created.id);
}

#[tokio::test]
async fn test_invalid_amount_is_rejected() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let result = service
        .bulk_upsert(&owner, budget.id, vec![bulk_item(-1, expense(-1.0, "Oops", "2024-01-01"))])
        .await;
    assert!(matches!(result, Err(BudgetError::InvalidInput(..))));

    let result = service
        .create_transaction(&owner, budget.id, expense(f64::NAN, "Oops", "2024-01-01"))
        .await;
    assert!(matches!(result, Err(BudgetError::InvalidInput(..))));
}

#[tokio::test]
async fn test_outsider_cannot_push_or_list() {
    let service = create_test_service();
    let (_, budget) = owner_with_budget(&service).await;
    let outsider = register_user(&service, "outsider@example.com").await;

    let push = service
        .bulk_upsert(&outsider, budget.id, vec![bulk_item(-1, expense(1.0, "X", "2024-01-01"))])
        .await;
    assert!(matches!(push, Err(BudgetError::NotBudgetMember(..))));
    let list = service.list_active(&outsider, budget.id).await;
    assert!(matches!(list, Err(BudgetError::NotBudgetMember(..))));
}

#[tokio::test]
async fn test_soft_delete_is_idempotent_and_hides_record() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let keep = service
        .create_transaction(&owner, budget.id, expense(1.0, "Keep", "2024-01-01"))
        .await
        .unwrap();
    let gone = service
        .create_transaction(&owner, budget.id, expense(2.0, "Drop", "2024-01-01"))
        .await
        .unwrap();

    let first = service.soft_delete(&owner, gone.id).await.unwrap();
    let second = service.soft_delete(&owner, gone.id).await.unwrap();
    assert_eq!(first.deleted_at, second.deleted_at);

    let active = service.list_active(&owner, budget.id).await.unwrap();
    assert_eq!(active.len(), 1);
    assert_eq!(active[0].id, keep.id);

    let missing = service.soft_delete(&owner, 999).await;
    assert!(matches!(missing, Err(BudgetError::TransactionNotFound(999))));
}

#[tokio::test]
async fn test_tombstone_feed_respects_cursor() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let created = service
        .create_transaction(&owner, budget.id, expense(4.0, "Gone", "2024-01-01"))
        .await
        .unwrap();
    let deleted = service.soft_delete(&owner, created.id).await.unwrap();

    let feed = service.list_tombstones(&owner, budget.id, None).await.unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].id, created.id);
    assert_eq!(feed[0].deleted_at, deleted.deleted_at);
    assert_eq!(feed[0].content_hash, created.content_hash);
    assert_eq!(feed[0].seq, 1);

    let after = service
        .list_tombstones(&owner, budget.id, Some(feed[0].seq))
        .await
        .unwrap();
    assert!(after.is_empty());

    // A repeated delete keeps its place in the feed.
    service.soft_delete(&owner, created.id).await.unwrap();
    let again = service.list_tombstones(&owner, budget.id, None).await.unwrap();
    assert_eq!(again, feed);
}

#[tokio::test]
async fn test_late_offline_deletion_lands_after_cursor() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let offline = bulk_item(-1, expense(3.0, "Offline", "2024-01-01"));
    let pushed = service.bulk_upsert(&owner, budget.id, vec![offline.clone()]).await.unwrap();
    let other = service
        .create_transaction(&owner, budget.id, expense(8.0, "Online", "2024-01-02"))
        .await
        .unwrap();
    service.soft_delete(&owner, other.id).await.unwrap();
    let cursor = service.list_tombstones(&owner, budget.id, None).await.unwrap()[0].seq;

    // Deleted long ago on a device, uploaded only now.
    let mut late = offline;
    late.deleted_at = Some(1_000);
    let outcome = service.bulk_upsert(&owner, budget.id, vec![late]).await.unwrap();
    assert_eq!(outcome.updated.len(), 1);

    let feed = service
        .list_tombstones(&owner, budget.id, Some(cursor))
        .await
        .unwrap();
    assert_eq!(feed.len(), 1);
    assert_eq!(feed[0].id, pushed.created[0].id);
    assert_eq!(feed[0].deleted_at, 1_000);
    assert!(feed[0].seq > cursor);
}

#[tokio::test]
async fn test_tombstones_older_than_horizon_are_omitted() {
    let service = create_test_service_with(ServiceSettings {
        tombstone_horizon: chrono::Duration::zero(),
        ..test_settings()
    });
    let (owner, budget) = owner_with_budget(&service).await;
    let mut gone = bulk_item(-1, expense(4.0, "Old", "2020-01-01"));
    gone.deleted_at = Some(1_000);
    service.bulk_upsert(&owner, budget.id, vec![gone]).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;

    let feed = service.list_tombstones(&owner, budget.id, None).await.unwrap();
    assert!(feed.is_empty());
}

#[tokio::test]
async fn test_mutations_notify_budget_subscribers() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let mut subscription = service.notifier().subscribe(budget.id).unwrap();
    assert_eq!(subscription.recv().await, Some(ChangeEvent::Hello));

    service
        .bulk_upsert(&owner, budget.id, vec![bulk_item(-1, expense(1.0, "A", "2024-01-01"))])
        .await
        .unwrap();
    match subscription.recv().await {
        Some(ChangeEvent::Update(payload)) => {
            assert_eq!(payload.op, UpdateOp::Bulk);
            assert_eq!(payload.count, Some(1));
            assert_eq!(payload.budget_id, budget.id);
        }
        other => panic!("expected update, got {:?}", other),
    }

    let created = service
        .create_transaction(&owner, budget.id, expense(2.0, "B", "2024-01-01"))
        .await
        .unwrap();
    match subscription.recv().await {
        Some(ChangeEvent::Update(payload)) => {
            assert_eq!(payload.op, UpdateOp::Create);
            assert_eq!(payload.id, Some(created.id));
        }
        other => panic!("expected update, got {:?}", other),
    }
}

#[tokio::test]
async fn test_repeated_delete_is_not_broadcast() {
    let service = create_test_service();
    let (owner, budget) = owner_with_budget(&service).await;
    let created = service
        .create_transaction(&owner, budget.id, expense(2.0, "B", "2024-01-01"))
        .await
        .unwrap();
    let mut subscription = service.notifier().subscribe(budget.id).unwrap();
    assert_eq!(subscription.recv().await, Some(ChangeEvent::Hello));

    service.soft_delete(&owner, created.id).await.unwrap();
    match subscription.recv().await {
        Some(ChangeEvent::Update(payload)) => assert_eq!(payload.op, UpdateOp::SoftDelete),
        other => panic!("expected update, got {:?}", other),
    }

    service.soft_delete(&owner, created.id).await.unwrap();
    let quiet = tokio::time::timeout(std::time::Duration::from_millis(50), subscription.recv()).await;
    assert!(quiet.is_err());
}
