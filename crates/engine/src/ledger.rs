//! Typed views over the ledger tables.
//!
//! The store itself is schema-agnostic; these types give the `accounts` and
//! `transactions` rows a shape so the linked-record rules can be written
//! against fields instead of string lookups.
//!
//! Amounts are signed integer **minor units** (e.g. cents for EUR): a
//! transaction's `amount` is the effect it had on its account's `balance`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{EngineError, Record, ResultEngine, Value};

pub const ACCOUNTS_TABLE: &str = "accounts";
pub const TRANSACTIONS_TABLE: &str = "transactions";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Income,
    Expense,
    Transfer,
    InvestmentBuy,
    InvestmentSell,
}

impl TransactionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Income => "income",
            Self::Expense => "expense",
            Self::Transfer => "transfer",
            Self::InvestmentBuy => "investment_buy",
            Self::InvestmentSell => "investment_sell",
        }
    }

    /// Kinds that only exist as a linked pair of transactions.
    pub fn is_paired(self) -> bool {
        matches!(
            self,
            Self::Transfer | Self::InvestmentBuy | Self::InvestmentSell
        )
    }
}

impl TryFrom<&str> for TransactionKind {
    type Error = EngineError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "income" => Ok(Self::Income),
            "expense" => Ok(Self::Expense),
            "transfer" => Ok(Self::Transfer),
            "investment_buy" => Ok(Self::InvestmentBuy),
            "investment_sell" => Ok(Self::InvestmentSell),
            other => Err(EngineError::InvalidRecord(format!(
                "invalid transaction kind: {other}"
            ))),
        }
    }
}

/// A bank account, card, cash pocket or investment account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Account {
    pub id: String,
    pub name: String,
    pub balance: i64,
    pub currency: String,
}

impl Account {
    pub fn new(id: &str, name: &str, balance: i64, currency: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            balance,
            currency: currency.to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LedgerTransaction {
    pub id: String,
    pub account_id: String,
    pub amount: i64,
    pub occurred_at: DateTime<Utc>,
    pub description: Option<String>,
    pub kind: TransactionKind,
    /// The other half of a transfer or trade.
    pub linked_transaction_id: Option<String>,
}

fn field<'r>(record: &'r Record, name: &str) -> ResultEngine<&'r Value> {
    record.get(name).ok_or_else(|| {
        EngineError::InvalidRecord(format!("record {} is missing \"{name}\"", record.id))
    })
}

fn text(record: &Record, name: &str) -> ResultEngine<String> {
    field(record, name)?
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| mistyped(record, name, "text"))
}

fn optional_text(record: &Record, name: &str) -> ResultEngine<Option<String>> {
    match record.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Text(s)) => Ok(Some(s.clone())),
        Some(_) => Err(mistyped(record, name, "text")),
    }
}

fn int(record: &Record, name: &str) -> ResultEngine<i64> {
    field(record, name)?
        .as_i64()
        .ok_or_else(|| mistyped(record, name, "an integer"))
}

fn mistyped(record: &Record, name: &str, expected: &str) -> EngineError {
    EngineError::InvalidRecord(format!(
        "field \"{name}\" of record {} is not {expected}",
        record.id
    ))
}

impl TryFrom<&Record> for Account {
    type Error = EngineError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        Ok(Self {
            id: record.id.clone(),
            name: text(record, "name")?,
            balance: int(record, "balance")?,
            currency: text(record, "currency")?,
        })
    }
}

impl From<&Account> for Record {
    fn from(account: &Account) -> Self {
        Record::new(account.id.clone())
            .with("name", account.name.as_str())
            .with("balance", account.balance)
            .with("currency", account.currency.as_str())
    }
}

impl TryFrom<&Record> for LedgerTransaction {
    type Error = EngineError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        let occurred_at = field(record, "occurred_at")?
            .as_date()
            .ok_or_else(|| mistyped(record, "occurred_at", "a date"))?;
        Ok(Self {
            id: record.id.clone(),
            account_id: text(record, "account_id")?,
            amount: int(record, "amount")?,
            occurred_at,
            description: optional_text(record, "description")?,
            kind: TransactionKind::try_from(text(record, "kind")?.as_str())?,
            linked_transaction_id: optional_text(record, "linked_transaction_id")?,
        })
    }
}

impl From<&LedgerTransaction> for Record {
    fn from(tx: &LedgerTransaction) -> Self {
        Record::new(tx.id.clone())
            .with("account_id", tx.account_id.as_str())
            .with("amount", tx.amount)
            .with("occurred_at", tx.occurred_at)
            .with("description", tx.description.clone())
            .with("kind", tx.kind.as_str())
            .with("linked_transaction_id", tx.linked_transaction_id.clone())
    }
}
