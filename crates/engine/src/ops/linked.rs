//! Linked ledger records.
//!
//! Transfers and investment trades are stored as two transactions pointing at
//! each other through `linked_transaction_id`: the debit leg on the source
//! account and the credit leg on the destination. Both legs are created,
//! reversed and deleted inside one guarded operation, so no caller can ever
//! observe exactly one of them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::{
    ACCOUNTS_TABLE, Account, EngineError, LedgerTransaction, Record, ResultEngine,
    TRANSACTIONS_TABLE, TableStore, TransactionKind,
};

use super::{Engine, Step, step};

/// Input of [`Engine::create_linked_pair`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LinkedPairDraft {
    pub kind: TransactionKind,
    pub from_account_id: String,
    pub to_account_id: String,
    /// Amount moved, in minor units. Must be > 0.
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
    pub description: Option<String>,
}

/// A transaction whose pairing is broken.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum LinkIssue {
    /// The partner does not exist.
    Dangling {
        transaction_id: String,
        linked_transaction_id: String,
    },
    /// The partner exists but does not point back.
    NotMutual {
        transaction_id: String,
        linked_transaction_id: String,
        back_reference: Option<String>,
    },
    /// A transfer or trade leg without a partner reference.
    Unpaired { transaction_id: String },
}

/// Default balance reversal: undoes the effect `tx` had on `account`.
///
/// Each leg only touches its own account, so the two legs of a pair can be
/// reversed in either order.
pub fn reverse_balance(account: &mut Account, tx: &LedgerTransaction) -> ResultEngine<()> {
    account.balance = account.balance.checked_sub(tx.amount).ok_or_else(|| {
        EngineError::InvalidAmount(format!("reversing {} overflows {}", tx.id, account.id))
    })?;
    Ok(())
}

fn load_account(store: &TableStore, account_id: &str) -> ResultEngine<(Record, Account)> {
    let record = store
        .find(ACCOUNTS_TABLE, account_id)
        .ok_or_else(|| EngineError::NotFound(format!("account {account_id}")))?;
    Ok((record.clone(), Account::try_from(record)?))
}

/// Writes back the balance only, keeping any other field of the row.
fn store_balance(store: &mut TableStore, mut record: Record, balance: i64) {
    record.set("balance", balance);
    store.upsert(ACCOUNTS_TABLE, record);
}

fn linked_id(record: &Record) -> Option<&str> {
    record.get("linked_transaction_id").and_then(|v| v.as_str())
}

/// Applies `reversal` to the owning account, then removes the transaction.
fn reverse_and_remove<R>(
    store: &mut TableStore,
    transaction_id: &str,
    reversal: &R,
) -> ResultEngine<LedgerTransaction>
where
    R: Fn(&mut Account, &LedgerTransaction) -> ResultEngine<()>,
{
    let tx = store
        .find(TRANSACTIONS_TABLE, transaction_id)
        .ok_or_else(|| EngineError::NotFound(format!("transaction {transaction_id}")))
        .and_then(LedgerTransaction::try_from)?;
    let (record, mut account) = load_account(store, &tx.account_id)?;

    reversal(&mut account, &tx)?;
    store_balance(store, record, account.balance);
    store.remove(TRANSACTIONS_TABLE, transaction_id);
    Ok(tx)
}

/// Inserts the debit and credit legs of `draft` and moves the balances.
fn insert_pair(store: &mut TableStore, draft: &LinkedPairDraft) -> ResultEngine<(String, String)> {
    let debit_id = Uuid::new_v4().to_string();
    let credit_id = Uuid::new_v4().to_string();
    let legs = [
        (&draft.from_account_id, &debit_id, &credit_id, -draft.amount),
        (&draft.to_account_id, &credit_id, &debit_id, draft.amount),
    ];

    for (account_id, id, partner_id, amount) in legs {
        let (record, account) = load_account(store, account_id)?;
        let balance = account.balance.checked_add(amount).ok_or_else(|| {
            EngineError::InvalidAmount(format!("balance of {account_id} overflows"))
        })?;
        let tx = LedgerTransaction {
            id: id.clone(),
            account_id: account_id.clone(),
            amount,
            occurred_at: draft.occurred_at,
            description: draft.description.clone(),
            kind: draft.kind,
            linked_transaction_id: Some(partner_id.clone()),
        };
        store.upsert(TRANSACTIONS_TABLE, Record::from(&tx));
        store_balance(store, record, balance);
    }
    Ok((debit_id, credit_id))
}

fn remove_unreferenced_account(store: &mut TableStore, account_id: &str) -> ResultEngine<Record> {
    let in_use = store
        .get_table(TRANSACTIONS_TABLE)
        .iter()
        .any(|tx| tx.get("account_id").and_then(|v| v.as_str()) == Some(account_id));
    if in_use {
        return Err(EngineError::AccountInUse(account_id.to_string()));
    }
    store
        .remove(ACCOUNTS_TABLE, account_id)
        .ok_or_else(|| EngineError::NotFound(format!("account {account_id}")))
}

impl Engine {
    /// Creates both legs of a transfer or trade and applies their balance
    /// effects. Returns the ids of the debit and credit legs.
    pub async fn create_linked_pair(&self, draft: LinkedPairDraft) -> ResultEngine<(String, String)> {
        if !draft.kind.is_paired() {
            return Err(EngineError::InvalidRecord(format!(
                "{} transactions are not paired",
                draft.kind.as_str()
            )));
        }
        if draft.amount <= 0 {
            return Err(EngineError::InvalidAmount(
                "amount must be > 0".to_string(),
            ));
        }
        if draft.from_account_id == draft.to_account_id {
            return Err(EngineError::InvalidRecord(
                "from_account_id and to_account_id must differ".to_string(),
            ));
        }

        let description = format!(
            "{} of {} from {} to {}",
            draft.kind.as_str(),
            draft.amount,
            draft.from_account_id,
            draft.to_account_id
        );
        self.execute_with_snapshot(
            "create_linked_pair",
            move |store| Box::pin(async move { insert_pair(store, &draft) }),
            &description,
        )
        .await
    }

    /// Deletes a transaction with its linked partner, if any, reversing the
    /// balance effect of each removed leg through `reversal`.
    ///
    /// Each leg is one step of an atomic operation: if `reversal` fails on
    /// either leg, both transactions and both balances are restored. A
    /// transaction whose partner is already gone is deleted alone.
    pub async fn delete_transaction<R>(
        &self,
        transaction_id: &str,
        reversal: R,
    ) -> ResultEngine<Vec<LedgerTransaction>>
    where
        R: Fn(&mut Account, &LedgerTransaction) -> ResultEngine<()> + Send + Sync + 'static,
    {
        let legs = self
            .read(|store| -> ResultEngine<Vec<String>> {
                let record = store
                    .find(TRANSACTIONS_TABLE, transaction_id)
                    .ok_or_else(|| EngineError::NotFound(format!("transaction {transaction_id}")))?;
                let mut legs = vec![record.id.clone()];
                if let Some(partner_id) = linked_id(record) {
                    if store.find(TRANSACTIONS_TABLE, partner_id).is_some() {
                        legs.push(partner_id.to_string());
                    } else {
                        tracing::warn!(
                            "transaction {transaction_id} links to missing {partner_id}, deleting it alone"
                        );
                    }
                }
                Ok(legs)
            })
            .await?;

        let reversal = Arc::new(reversal);
        let steps: Vec<Step<LedgerTransaction>> = legs
            .iter()
            .map(|leg_id| {
                let leg_id = leg_id.clone();
                let reversal = Arc::clone(&reversal);
                step(move |store| {
                    Box::pin(async move { reverse_and_remove(store, &leg_id, reversal.as_ref()) })
                })
            })
            .collect();

        self.perform_atomic_operation(
            "delete_transaction",
            steps,
            &format!("delete {}", legs.join(" + ")),
        )
        .await
    }

    /// Deletes an account nothing references anymore.
    ///
    /// The reference check runs inside the guarded operation, so a failing
    /// check goes through the same rollback path as any other failure.
    pub async fn delete_account(&self, account_id: &str) -> ResultEngine<Record> {
        let account_id = account_id.to_string();
        let description = format!("delete account {account_id}");
        self.execute_with_snapshot(
            "delete_account",
            move |store| Box::pin(async move { remove_unreferenced_account(store, &account_id) }),
            &description,
        )
        .await
    }

    /// Lists every transaction whose pairing is broken.
    pub async fn check_link_integrity(&self) -> Vec<LinkIssue> {
        self.read(|store| {
            let mut issues = Vec::new();
            for record in store.get_table(TRANSACTIONS_TABLE) {
                let transaction_id = record.id.clone();
                let Some(linked) = linked_id(record) else {
                    let paired = record
                        .get("kind")
                        .and_then(|v| v.as_str())
                        .and_then(|kind| TransactionKind::try_from(kind).ok())
                        .is_some_and(TransactionKind::is_paired);
                    if paired {
                        issues.push(LinkIssue::Unpaired { transaction_id });
                    }
                    continue;
                };
                match store.find(TRANSACTIONS_TABLE, linked) {
                    None => issues.push(LinkIssue::Dangling {
                        transaction_id,
                        linked_transaction_id: linked.to_string(),
                    }),
                    Some(partner) if linked_id(partner) != Some(record.id.as_str()) => {
                        issues.push(LinkIssue::NotMutual {
                            transaction_id,
                            linked_transaction_id: linked.to_string(),
                            back_reference: linked_id(partner).map(ToString::to_string),
                        });
                    }
                    Some(_) => {}
                }
            }
            issues
        })
        .await
    }
}
