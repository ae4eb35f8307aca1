use chrono::Utc;

use engine::{
    ACCOUNTS_TABLE, Account, Engine, EngineError, LedgerTransaction, LinkIssue, LinkedPairDraft,
    MemoryPersistence, OperationOutcome, Record, TRANSACTIONS_TABLE, TableStore, TransactionKind,
    reverse_balance,
};

fn ledger_store() -> TableStore {
    let mut store = TableStore::new();
    store.upsert(
        ACCOUNTS_TABLE,
        Record::from(&Account::new("A", "Checking", 1000, "EUR")),
    );
    store.upsert(
        ACCOUNTS_TABLE,
        Record::from(&Account::new("B", "Savings", 500, "EUR")),
    );
    store
}

fn engine() -> (Engine, MemoryPersistence) {
    let persistence = MemoryPersistence::new();
    let engine = Engine::builder()
        .store(ledger_store())
        .persistence(persistence.clone())
        .build()
        .unwrap();
    (engine, persistence)
}

fn transfer(amount: i64) -> LinkedPairDraft {
    LinkedPairDraft {
        kind: TransactionKind::Transfer,
        from_account_id: "A".to_string(),
        to_account_id: "B".to_string(),
        amount,
        occurred_at: Utc::now(),
        description: Some("rent share".to_string()),
    }
}

async fn balance(engine: &Engine, id: &str) -> i64 {
    engine
        .read(|store| Account::try_from(store.find(ACCOUNTS_TABLE, id).unwrap()).unwrap())
        .await
        .balance
}

async fn transaction(engine: &Engine, id: &str) -> Option<LedgerTransaction> {
    engine
        .read(|store| {
            store
                .find(TRANSACTIONS_TABLE, id)
                .map(|r| LedgerTransaction::try_from(r).unwrap())
        })
        .await
}

async fn transaction_ids(engine: &Engine) -> Vec<String> {
    let mut ids: Vec<String> = engine
        .table(TRANSACTIONS_TABLE)
        .await
        .into_iter()
        .map(|r| r.id)
        .collect();
    ids.sort();
    ids
}

#[tokio::test]
async fn transfer_creates_two_mutually_linked_legs() {
    let (engine, persistence) = engine();

    let (debit, credit) = engine.create_linked_pair(transfer(200)).await.unwrap();

    assert_eq!(balance(&engine, "A").await, 800);
    assert_eq!(balance(&engine, "B").await, 700);

    let debit_tx = transaction(&engine, &debit).await.unwrap();
    let credit_tx = transaction(&engine, &credit).await.unwrap();
    assert_eq!(debit_tx.account_id, "A");
    assert_eq!(debit_tx.amount, -200);
    assert_eq!(debit_tx.linked_transaction_id.as_deref(), Some(credit.as_str()));
    assert_eq!(credit_tx.account_id, "B");
    assert_eq!(credit_tx.amount, 200);
    assert_eq!(credit_tx.linked_transaction_id.as_deref(), Some(debit.as_str()));

    assert!(engine.check_link_integrity().await.is_empty());
    assert_eq!(engine.version(TRANSACTIONS_TABLE).await, 1);
    assert_eq!(engine.version(ACCOUNTS_TABLE).await, 1);
    assert_eq!(persistence.batches(), 1);
}

#[tokio::test]
async fn deleting_one_leg_deletes_both_and_restores_balances() {
    let (engine, _persistence) = engine();
    let (debit, _credit) = engine.create_linked_pair(transfer(200)).await.unwrap();

    let removed = engine
        .delete_transaction(&debit, reverse_balance)
        .await
        .unwrap();

    assert_eq!(removed.len(), 2);
    assert_eq!(removed[0].id, debit);
    assert!(transaction_ids(&engine).await.is_empty());
    assert_eq!(balance(&engine, "A").await, 1000);
    assert_eq!(balance(&engine, "B").await, 500);
}

#[tokio::test]
async fn failing_reversal_keeps_both_legs() {
    let (engine, persistence) = engine();
    let (debit, credit) = engine.create_linked_pair(transfer(200)).await.unwrap();
    let mut expected = vec![debit.clone(), credit.clone()];
    expected.sort();

    // From the debit side the failure hits the second step, from the credit
    // side the first one.
    for start in [&debit, &credit] {
        let err = engine
            .delete_transaction(start, |account: &mut Account, tx: &LedgerTransaction| {
                if account.id == "B" {
                    return Err(EngineError::InvalidAmount("frozen account".to_string()));
                }
                reverse_balance(account, tx)
            })
            .await
            .unwrap_err();

        assert_eq!(
            err,
            EngineError::Operation {
                operation: "delete_transaction".to_string(),
                source: Box::new(EngineError::InvalidAmount("frozen account".to_string())),
            }
        );
        assert_eq!(transaction_ids(&engine).await, expected);
        assert_eq!(balance(&engine, "A").await, 800);
        assert_eq!(balance(&engine, "B").await, 700);
        assert_eq!(
            engine.get_status().last_outcome,
            Some(OperationOutcome::RolledBack)
        );
    }
    assert_eq!(persistence.batches(), 1);
}

#[tokio::test]
async fn unlinked_transaction_is_deleted_alone() {
    let income = LedgerTransaction {
        id: "salary".to_string(),
        account_id: "A".to_string(),
        amount: 300,
        occurred_at: Utc::now(),
        description: None,
        kind: TransactionKind::Income,
        linked_transaction_id: None,
    };
    let mut store = ledger_store();
    store.upsert(TRANSACTIONS_TABLE, Record::from(&income));
    let engine = Engine::builder().store(store).build().unwrap();
    let (transfer_debit, _) = engine.create_linked_pair(transfer(50)).await.unwrap();

    let removed = engine
        .delete_transaction("salary", reverse_balance)
        .await
        .unwrap();

    assert_eq!(removed, vec![income]);
    assert_eq!(balance(&engine, "A").await, 1000 - 50 - 300);
    assert!(transaction(&engine, &transfer_debit).await.is_some());
}

#[tokio::test]
async fn dangling_link_is_reported_and_deleted_alone() {
    let orphan = LedgerTransaction {
        id: "orphan".to_string(),
        account_id: "B".to_string(),
        amount: 100,
        occurred_at: Utc::now(),
        description: None,
        kind: TransactionKind::Transfer,
        linked_transaction_id: Some("gone".to_string()),
    };
    let mut store = ledger_store();
    store.upsert(TRANSACTIONS_TABLE, Record::from(&orphan));
    let engine = Engine::builder().store(store).build().unwrap();

    assert_eq!(
        engine.check_link_integrity().await,
        vec![LinkIssue::Dangling {
            transaction_id: "orphan".to_string(),
            linked_transaction_id: "gone".to_string(),
        }]
    );

    let removed = engine
        .delete_transaction("orphan", reverse_balance)
        .await
        .unwrap();
    assert_eq!(removed.len(), 1);
    assert_eq!(balance(&engine, "B").await, 400);
    assert!(engine.check_link_integrity().await.is_empty());
}

#[tokio::test]
async fn integrity_check_finds_one_sided_links() {
    let leg = |id: &str, linked: Option<&str>| LedgerTransaction {
        id: id.to_string(),
        account_id: "A".to_string(),
        amount: -10,
        occurred_at: Utc::now(),
        description: None,
        kind: TransactionKind::InvestmentBuy,
        linked_transaction_id: linked.map(ToString::to_string),
    };
    let mut store = ledger_store();
    store.upsert(TRANSACTIONS_TABLE, Record::from(&leg("x", Some("y"))));
    store.upsert(TRANSACTIONS_TABLE, Record::from(&leg("y", None)));
    let engine = Engine::builder().store(store).build().unwrap();

    let issues = engine.check_link_integrity().await;

    assert!(issues.contains(&LinkIssue::NotMutual {
        transaction_id: "x".to_string(),
        linked_transaction_id: "y".to_string(),
        back_reference: None,
    }));
    assert!(issues.contains(&LinkIssue::Unpaired {
        transaction_id: "y".to_string(),
    }));
}

#[tokio::test]
async fn missing_transaction_is_not_found() {
    let (engine, _persistence) = engine();

    let err = engine
        .delete_transaction("nope", reverse_balance)
        .await
        .unwrap_err();

    assert!(matches!(err, EngineError::NotFound(_)));
    assert!(!engine.get_status().is_in_transaction);
}

#[tokio::test]
async fn account_in_use_is_not_deleted() {
    let (engine, _persistence) = engine();
    let (debit, _credit) = engine.create_linked_pair(transfer(200)).await.unwrap();

    let err = engine.delete_account("A").await.unwrap_err();
    assert_eq!(
        err,
        EngineError::Operation {
            operation: "delete_account".to_string(),
            source: Box::new(EngineError::AccountInUse("A".to_string())),
        }
    );
    assert_eq!(balance(&engine, "A").await, 800);
    assert_eq!(
        engine.get_status().last_outcome,
        Some(OperationOutcome::RolledBack)
    );

    engine
        .delete_transaction(&debit, reverse_balance)
        .await
        .unwrap();
    let removed = engine.delete_account("A").await.unwrap();
    assert_eq!(removed.id, "A");
    assert_eq!(engine.table(ACCOUNTS_TABLE).await.len(), 1);

    let err = engine.delete_account("A").await.unwrap_err();
    assert!(matches!(err.root_cause(), EngineError::NotFound(_)));
}

#[tokio::test]
async fn invalid_pairs_are_rejected_without_changes() {
    let (engine, persistence) = engine();

    let same_account = LinkedPairDraft {
        to_account_id: "A".to_string(),
        ..transfer(10)
    };
    assert!(matches!(
        engine.create_linked_pair(same_account).await,
        Err(EngineError::InvalidRecord(_))
    ));

    assert!(matches!(
        engine.create_linked_pair(transfer(0)).await,
        Err(EngineError::InvalidAmount(_))
    ));

    let income = LinkedPairDraft {
        kind: TransactionKind::Income,
        ..transfer(10)
    };
    assert!(matches!(
        engine.create_linked_pair(income).await,
        Err(EngineError::InvalidRecord(_))
    ));

    // The debit leg is written before the missing account is noticed.
    let unknown = LinkedPairDraft {
        to_account_id: "Z".to_string(),
        ..transfer(10)
    };
    let err = engine.create_linked_pair(unknown).await.unwrap_err();
    assert!(matches!(err.root_cause(), EngineError::NotFound(_)));

    assert!(transaction_ids(&engine).await.is_empty());
    assert_eq!(balance(&engine, "A").await, 1000);
    assert_eq!(persistence.batches(), 0);
}
