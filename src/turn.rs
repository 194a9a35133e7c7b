use crate::{
    client::{ChatClient, ChatError},
    dataset::FinancialData,
    session::{Admission, ChatMessage, SessionInfo, SessionReconciler},
    storage::{Storage, TurnRecord},
    usage::{CostRates, QueryCost, UsageAccountant, UsageStats},
};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum TurnError {
    #[error(transparent)]
    Chat(#[from] ChatError),
    #[error("session store error: {0:#}")]
    Store(anyhow::Error),
}

impl From<anyhow::Error> for TurnError {
    fn from(err: anyhow::Error) -> Self {
        TurnError::Store(err)
    }
}

#[derive(Debug)]
pub enum TurnOutcome {
    Rejected(Admission),
    Completed(CompletedTurn),
}

#[derive(Debug, Clone)]
pub struct CompletedTurn {
    pub reply: String,
    pub session_id: Option<String>,
    pub new_session: bool,
    /// Present when the response carried a usage block.
    pub cost: Option<QueryCost>,
    /// The response had no text and a placeholder was shown instead.
    pub malformed: bool,
}

/// Everything a front-end needs to draw the current session.
#[derive(Debug, Clone, Default)]
pub struct SessionView {
    pub session_id: Option<String>,
    pub session_info: Option<SessionInfo>,
    pub messages: Vec<ChatMessage>,
    pub stats: UsageStats,
    pub recent: Vec<TurnRecord>,
}

/// Runs turns for one session key. Each turn loads the persisted namespace, applies the session
/// and usage state machines, and writes the namespace back.
pub struct TurnRunner {
    storage: Storage,
    client: ChatClient,
    data: Arc<FinancialData>,
    rates: CostRates,
    session_key: String,
    lock: Mutex<()>,
}

impl TurnRunner {
    pub fn new(
        storage: Storage,
        client: ChatClient,
        data: Arc<FinancialData>,
        rates: CostRates,
        session_key: impl Into<String>,
    ) -> Self {
        Self {
            storage,
            client,
            data,
            rates,
            session_key: session_key.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn data(&self) -> &FinancialData {
        &self.data
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }

    /// The user's input is persisted before the request goes out; the reply, the new identity and
    /// the cost are persisted only once a response arrives.
    pub async fn run_turn(&self, input: &str) -> Result<TurnOutcome, TurnError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.storage.load_snapshot(&self.session_key).await?;
        let mut session = SessionReconciler::restore(&snapshot);

        let admission = session.admit(input);
        if !admission.is_accepted() {
            return Ok(TurnOutcome::Rejected(admission));
        }
        session.persist(&mut snapshot)?;
        self.storage
            .save_snapshot(&self.session_key, &snapshot)
            .await?;

        let request = session.build_request(input, &self.data);
        let response = match self.client.send(&request).await {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(error = %err, session_key = %self.session_key, "turn abandoned");
                return Err(err.into());
            }
        };

        let mut usage = UsageAccountant::restore(self.rates, &snapshot);
        session.reconcile(&response);
        let cost = response.tokens.as_ref().map(|tokens| usage.record(tokens));

        session.persist(&mut snapshot)?;
        usage.persist(&mut snapshot)?;
        let record = cost.as_ref().map(|cost| TurnRecord {
            timestamp: Utc::now(),
            session_id: session.session_id().map(str::to_string),
            prompt_tokens: cost.prompt_tokens,
            completion_tokens: cost.completion_tokens,
            total_tokens: cost.total_tokens,
            cached_tokens: cost.cached_tokens,
            cache_hit_cost: cost.hit_cost,
            cache_miss_cost: cost.miss_cost,
            cost: cost.cost,
        });
        self.storage
            .save_turn(&self.session_key, &snapshot, record.as_ref())
            .await?;

        let reply = session
            .messages()
            .last()
            .map(|message| message.content.clone())
            .unwrap_or_default();

        Ok(TurnOutcome::Completed(CompletedTurn {
            reply,
            session_id: session.session_id().map(str::to_string),
            new_session: response.is_new_session.unwrap_or(false),
            cost,
            malformed: response.text.is_none(),
        }))
    }

    pub async fn reset_session(&self) -> Result<(), TurnError> {
        let _guard = self.lock.lock().await;
        let mut snapshot = self.storage.load_snapshot(&self.session_key).await?;
        let mut session = SessionReconciler::restore(&snapshot);
        session.reset();
        session.persist(&mut snapshot)?;
        self.storage
            .save_snapshot(&self.session_key, &snapshot)
            .await?;
        Ok(())
    }

    pub async fn view(&self, recent_limit: usize) -> Result<SessionView, TurnError> {
        let snapshot = self.storage.load_snapshot(&self.session_key).await?;
        let session = SessionReconciler::restore(&snapshot);
        let usage = UsageAccountant::restore(self.rates, &snapshot);
        let recent = self
            .storage
            .recent_turns(&self.session_key, recent_limit)
            .await?;

        Ok(SessionView {
            session_id: session.session_id().map(str::to_string),
            session_info: session.session_info().cloned(),
            messages: session.messages().to_vec(),
            stats: usage.stats().clone(),
            recent,
        })
    }
}
