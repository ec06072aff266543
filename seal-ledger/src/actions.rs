//! Admin action log and idempotency
//!
//! Every commit is recorded as an admin action. A caller-supplied
//! idempotency key maps to the action id `commit:{key}`; a finished action
//! under that id is replayed instead of sealing again.

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::canonical::iso_millis;
use crate::error::{Error, Result};
use crate::store::{ActionOutcome, LedgerStore};
use crate::types::{
    check_page_limit, ActionError, ActionStatus, AdminAction, LedgerKind, Page, RequestMeta,
};

const MIN_KEY_LEN: usize = 8;
const MAX_KEY_LEN: usize = 200;

/// How a commit request enters the action log
#[derive(Debug, Clone, PartialEq)]
pub enum ActionStart {
    /// New or retried action; proceed with the commit
    Fresh {
        /// Action id
        action_id: String,
    },
    /// Already succeeded; serve the stored result
    Replay {
        /// Action id
        action_id: String,
        /// Stored result
        result: Value,
    },
}

/// Normalize an idempotency key: blank is absent, length bounded
pub fn normalize_key(key: Option<&str>) -> Result<Option<String>> {
    let Some(key) = key.map(str::trim).filter(|k| !k.is_empty()) else {
        return Ok(None);
    };
    if !(MIN_KEY_LEN..=MAX_KEY_LEN).contains(&key.len()) {
        return Err(Error::Validation(format!(
            "idempotencyKey must be {} to {} characters",
            MIN_KEY_LEN, MAX_KEY_LEN
        )));
    }
    Ok(Some(key.to_string()))
}

/// Action log of both ledgers
#[derive(Debug, Clone)]
pub struct ActionLog {
    store: Arc<dyn LedgerStore>,
}

impl ActionLog {
    /// Create an action log over the document store
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Record the start of a commit
    pub async fn begin(
        &self,
        kind: LedgerKind,
        idempotency_key: Option<&str>,
        meta: &RequestMeta,
    ) -> Result<ActionStart> {
        let key = normalize_key(idempotency_key)?;
        let now = Utc::now();
        let action_id = match &key {
            Some(k) => format!("commit:{}", k),
            None => Uuid::now_v7().to_string(),
        };
        let action = AdminAction {
            id: action_id.clone(),
            action: kind.action_name().to_string(),
            status: ActionStatus::InProgress,
            idempotency_key: key.clone(),
            meta: meta.clone(),
            result: None,
            error: None,
            created_at: now,
            updated_at: now,
        };

        if key.is_none() {
            self.store.insert_action(kind, &action).await?;
            return Ok(ActionStart::Fresh { action_id });
        }

        match self.store.begin_keyed_action(kind, &action).await? {
            None => Ok(ActionStart::Fresh { action_id }),
            Some(previous) => match (previous.status, previous.result) {
                (ActionStatus::Success, Some(result)) => Ok(ActionStart::Replay { action_id, result }),
                (ActionStatus::InProgress, _) => Err(Error::conflict_with(
                    kind.commit_in_progress_message(),
                    json!({
                        "idempotencyKey": previous.idempotency_key,
                        "actionId": previous.id,
                        "status": previous.status,
                        "updatedAt": iso_millis(&previous.updated_at),
                    }),
                )),
                _ => Ok(ActionStart::Fresh { action_id }),
            },
        }
    }

    /// Mark an action SUCCESS with its result
    pub async fn succeed(&self, kind: LedgerKind, action_id: &str, result: Value) -> Result<()> {
        self.store
            .finish_action(kind, action_id, ActionOutcome::Success(result), Utc::now())
            .await
    }

    /// Mark an action FAILED with the error that ended it
    pub async fn fail(&self, kind: LedgerKind, action_id: &str, error: &Error) -> Result<()> {
        self.store
            .finish_action(
                kind,
                action_id,
                ActionOutcome::Failed(ActionError::from(error)),
                Utc::now(),
            )
            .await
    }

    /// Page of actions, newest first
    pub async fn list(&self, kind: LedgerKind, limit: usize, offset: usize) -> Result<Page<AdminAction>> {
        check_page_limit(limit)?;
        let total = self.store.count_actions(kind).await?;
        let items = self.store.list_actions(kind, limit, offset).await?;
        Ok(Page { total, items })
    }
}
