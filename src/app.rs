use crate::{
    client::ChatClient,
    config::AppConfig,
    dataset::FinancialData,
    session::Admission,
    storage::Storage,
    tui,
    turn::{TurnOutcome, TurnRunner},
    usage::{CostRates, QueryCost, UsageStats},
};
use anyhow::Result;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMode {
    Interactive,
    Ask(String),
    Reset,
    Stats,
}

/// High-level application orchestrator.
pub struct App {
    config: Arc<AppConfig>,
}

impl App {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    pub async fn run(self, mode: RunMode) -> Result<()> {
        let storage = Storage::connect(&self.config.storage.database_path).await?;
        storage.ensure_schema().await?;

        let data = match FinancialData::load(&self.config.data.path) {
            Ok(data) => Arc::new(data),
            Err(err) => {
                tracing::error!(error = %format!("{err:#}"), "failed to load financial data");
                return Err(err);
            }
        };

        let client = ChatClient::new(&self.config.server)?;
        tracing::info!(
            endpoint = client.endpoint(),
            session_key = %self.config.storage.session_key,
            "chat client ready"
        );
        let runner = Arc::new(TurnRunner::new(
            storage,
            client,
            data,
            CostRates::from(&self.config.pricing),
            self.config.storage.session_key.clone(),
        ));

        match mode {
            RunMode::Interactive => {
                tracing::info!("Launching interactive TUI (requires an attached terminal)");
                tui::run(self.config.clone(), runner).await
            }
            RunMode::Ask(question) => ask_once(&runner, &question).await,
            RunMode::Reset => {
                runner.reset_session().await?;
                println!("Session {} reset.", runner.session_key());
                Ok(())
            }
            RunMode::Stats => {
                let view = runner.view(self.config.display.recent_queries).await?;
                println!("{}", format_stats(&view.stats, &self.config.pricing.currency));
                Ok(())
            }
        }
    }
}

async fn ask_once(runner: &TurnRunner, question: &str) -> Result<()> {
    match runner.run_turn(question).await? {
        TurnOutcome::Rejected(Admission::Duplicate) => {
            println!("Same question as the previous turn; nothing sent.");
        }
        TurnOutcome::Rejected(_) => {
            println!("Empty question; nothing sent.");
        }
        TurnOutcome::Completed(turn) => {
            println!("{}", turn.reply);
            if let Some(session_id) = &turn.session_id {
                let marker = if turn.new_session { " (new)" } else { "" };
                println!("\nsession: {session_id}{marker}");
            }
            if let Some(cost) = &turn.cost {
                println!("{}", format_query_cost(cost));
            }
        }
    }
    Ok(())
}

pub fn format_query_cost(cost: &QueryCost) -> String {
    let mut out = format!(
        "tokens: prompt {} | completion {} | total {} | cached {}\ncost: ${:.6} (cache hit ${:.6}, cache miss ${:.6})",
        cost.prompt_tokens,
        cost.completion_tokens,
        cost.total_tokens,
        cost.cached_tokens,
        cost.cost,
        cost.hit_cost,
        cost.miss_cost,
    );
    if let Some(savings) = cost.savings {
        out.push_str(&format!("\nsaved ${savings:.6} with cached tokens"));
        if let Some(rate) = cost.hit_rate {
            out.push_str(&format!(" ({rate:.1}% of this prompt)"));
        }
    }
    out
}

pub fn format_stats(stats: &UsageStats, currency: &str) -> String {
    format!(
        "queries: {}\ntokens: {} (prompt {}, completion {}, cached {})\ncache hit rate: {:.1}%\ncost ({currency}): total ${:.4}, cache hit ${:.4}, cache miss ${:.4}",
        stats.query_count,
        stats.total_tokens,
        stats.total_prompt_tokens,
        stats.total_completion_tokens,
        stats.cached_tokens,
        stats.cache_hit_rate,
        stats.total_cost,
        stats.cache_hit_cost,
        stats.cache_miss_cost,
    )
}
