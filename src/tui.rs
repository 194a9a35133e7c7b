use crate::{
    config::AppConfig,
    dataset::FinancialData,
    session::{Admission, Role},
    storage::TurnRecord,
    turn::{SessionView, TurnError, TurnOutcome, TurnRunner},
    usage::{QueryCost, UsageStats},
};
use anyhow::{Context, Result};
use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use ratatui::{
    Frame, Terminal,
    backend::CrosstermBackend,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, List, ListItem, Paragraph, Row, Table, Wrap},
};
use std::{
    io::{self, Stdout},
    sync::Arc,
    time::Duration,
};
use tokio::runtime::Handle;

const SCROLL_STEP: u16 = 5;

pub const SAMPLE_QUESTIONS: [&str; 8] = [
    "What is the trend in income over the past year?",
    "Which month had the highest income?",
    "What is the average gross profit?",
    "How has EBITDA changed over time?",
    "What was the net income in July 2024?",
    "Compare income between Q1 and Q2 2024",
    "What is the overall financial performance trend?",
    "Which metrics show the most volatility?",
];

pub async fn run(config: Arc<AppConfig>, runner: Arc<TurnRunner>) -> Result<()> {
    let refresh_hz = config.display.refresh_hz.max(1);
    let tick_rate = Duration::from_millis(1000 / refresh_hz);
    let runtime = Handle::current();

    tokio::task::spawn_blocking(move || run_blocking(runtime, config, runner, tick_rate)).await?
}

fn run_blocking(
    runtime: Handle,
    config: Arc<AppConfig>,
    runner: Arc<TurnRunner>,
    tick_rate: Duration,
) -> Result<()> {
    let mut terminal = setup_terminal()?;
    let mut chat = ChatViewState::new();
    let recent_limit = config.display.recent_queries;

    let loop_result: Result<()> = (|| -> Result<()> {
        let mut view = runtime
            .block_on(runner.view(recent_limit))
            .context("failed to load session state")?;

        loop {
            terminal.draw(|frame| draw_ui(frame, &config, runner.data(), &view, &chat))?;

            if !event::poll(tick_rate)? {
                continue;
            }
            let Event::Key(key) = event::read()? else {
                continue;
            };
            if key.kind != KeyEventKind::Press {
                continue;
            }
            let ctrl = key.modifiers.contains(KeyModifiers::CONTROL);

            match key.code {
                KeyCode::Esc => break Ok(()),
                KeyCode::Char('c') if ctrl => break Ok(()),
                KeyCode::Char('r') if ctrl => {
                    match runtime.block_on(runner.reset_session()) {
                        Ok(()) => {
                            chat.last_cost = None;
                            chat.set_status(StatusKind::Info, "Session reset. The next question starts a new session.");
                        }
                        Err(err) => {
                            tracing::error!(error = %err, "session reset failed");
                            chat.set_status(StatusKind::Error, format!("❌ {err}"));
                        }
                    }
                    view = runtime
                        .block_on(runner.view(recent_limit))
                        .context("failed to reload session state")?;
                }
                KeyCode::Enter => {
                    let question = chat.take_input();
                    chat.set_status(StatusKind::Info, "🤔 Analyzing your financial data...");
                    terminal.draw(|frame| draw_ui(frame, &config, runner.data(), &view, &chat))?;

                    let result = runtime.block_on(runner.run_turn(&question));
                    chat.apply_outcome(result);
                    view = runtime
                        .block_on(runner.view(recent_limit))
                        .context("failed to reload session state")?;
                }
                KeyCode::Backspace => chat.pop_char(),
                KeyCode::Up => chat.prev_sample(),
                KeyCode::Down => chat.next_sample(),
                KeyCode::PageUp => chat.scroll_back = chat.scroll_back.saturating_add(SCROLL_STEP),
                KeyCode::PageDown => chat.scroll_back = chat.scroll_back.saturating_sub(SCROLL_STEP),
                KeyCode::Char(ch) if !ctrl => chat.push_char(ch),
                _ => {}
            }
        }
    })();

    let restore_result = restore_terminal(terminal);

    match (loop_result, restore_result) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(loop_err), Ok(())) => Err(loop_err),
        (Ok(()), Err(restore_err)) => Err(restore_err),
        (Err(loop_err), Err(restore_err)) => Err(loop_err.context(restore_err.to_string())),
    }
}

fn setup_terminal() -> Result<Terminal<CrosstermBackend<Stdout>>> {
    enable_raw_mode()?;
    let mut stdout = io::stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;
    terminal.hide_cursor()?;
    Ok(terminal)
}

fn restore_terminal(mut terminal: Terminal<CrosstermBackend<Stdout>>) -> Result<()> {
    terminal.show_cursor()?;
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    Ok(())
}

fn draw_ui(
    frame: &mut Frame,
    config: &AppConfig,
    data: &FinancialData,
    view: &SessionView,
    chat: &ChatViewState,
) {
    let columns = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(68), Constraint::Percentage(32)])
        .split(frame.size());

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Min(5),
            Constraint::Length(3),
            Constraint::Length(1),
        ])
        .split(columns[0]);
    render_transcript(frame, left[0], view, chat);
    render_input(frame, left[1], chat);
    render_status(frame, left[2], chat);

    let right = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(6),
            Constraint::Length(8),
            Constraint::Length(9),
            Constraint::Min(5),
            Constraint::Length(10),
        ])
        .split(columns[1]);
    render_overview(frame, right[0], data);
    render_usage(frame, right[1], &view.stats, &config.pricing.currency);
    render_last_query(frame, right[2], chat.last_cost.as_ref());
    render_recent_queries(frame, right[3], &view.recent);
    render_samples(frame, right[4], chat.sample_cursor);
}

fn render_transcript(frame: &mut Frame, area: Rect, view: &SessionView, chat: &ChatViewState) {
    let mut title = match &view.session_id {
        Some(id) => format!("Financial Chat – session {}", truncate_text(id, 24)),
        None => "Financial Chat – no session yet".to_string(),
    };
    if let Some(info) = &view.session_info {
        title.push_str(&format!(" (started {})", info.started_at.format("%H:%M:%S")));
    }

    let mut lines: Vec<Line> = Vec::new();
    if view.messages.is_empty() {
        lines.push(Line::from(Span::styled(
            "Ask questions about your financial data. ↑/↓ picks a sample question.",
            Style::default().fg(Color::DarkGray),
        )));
    }
    for message in &view.messages {
        let (label, color) = match message.role {
            Role::User => ("You", Color::Cyan),
            Role::Assistant => ("Assistant", Color::Green),
        };
        lines.push(Line::from(Span::styled(
            format!("{label}:"),
            Style::default().fg(color).add_modifier(Modifier::BOLD),
        )));
        for text in message.content.lines() {
            lines.push(Line::from(text.to_string()));
        }
        lines.push(Line::from(""));
    }

    let inner_width = area.width.saturating_sub(2).max(1);
    let inner_height = area.height.saturating_sub(2);
    let content_height: usize = lines
        .iter()
        .map(|line| wrapped_height(line.width(), inner_width))
        .sum();
    let content_height = u16::try_from(content_height).unwrap_or(u16::MAX);
    let scroll = content_height
        .saturating_sub(inner_height)
        .saturating_sub(chat.scroll_back);

    let paragraph = Paragraph::new(lines)
        .block(Block::default().title(title).borders(Borders::ALL))
        .wrap(Wrap { trim: false })
        .scroll((scroll, 0));
    frame.render_widget(paragraph, area);
}

fn render_input(frame: &mut Frame, area: Rect, chat: &ChatViewState) {
    let input = Paragraph::new(format!("> {}", chat.input)).block(
        Block::default()
            .title("Question (Enter send, ↑/↓ samples, Ctrl+R reset, Esc quit)")
            .borders(Borders::ALL),
    );
    frame.render_widget(input, area);

    let typed = u16::try_from(chat.input.chars().count()).unwrap_or(u16::MAX);
    let max_x = area.x + area.width.saturating_sub(2);
    frame.set_cursor((area.x + 3).saturating_add(typed).min(max_x), area.y + 1);
}

fn render_status(frame: &mut Frame, area: Rect, chat: &ChatViewState) {
    let Some(status) = &chat.status else {
        return;
    };
    let style = match status.kind {
        StatusKind::Info => Style::default().fg(Color::Yellow),
        StatusKind::Error => Style::default().fg(Color::Red).add_modifier(Modifier::BOLD),
    };
    frame.render_widget(Paragraph::new(Span::styled(status.text.clone(), style)), area);
}

fn render_overview(frame: &mut Frame, area: Rect, data: &FinancialData) {
    let rows: Vec<Row> = data
        .overview()
        .iter()
        .map(|(label, count)| {
            Row::new(vec![
                Cell::from(*label).style(Style::default().add_modifier(Modifier::BOLD)),
                Cell::from(format!("{count} records")),
            ])
        })
        .collect();
    let table = Table::new(rows, [Constraint::Length(20), Constraint::Min(8)])
        .block(Block::default().title("Data Overview").borders(Borders::ALL));
    frame.render_widget(table, area);
}

fn render_usage(frame: &mut Frame, area: Rect, stats: &UsageStats, currency: &str) {
    let rows = vec![
        metric_row("Total Queries", stats.query_count.to_string()),
        metric_row("Total Tokens", format_tokens(stats.total_tokens)),
        metric_row("Cached Tokens", format_tokens(stats.cached_tokens)),
        metric_row("Cache Hit Rate", format!("{:.1}%", stats.cache_hit_rate)),
        metric_row("Total Cost", format_cost(stats.total_cost)),
        metric_row("Cache Miss Cost", format_cost(stats.cache_miss_cost)),
    ];
    let table = Table::new(rows, [Constraint::Length(16), Constraint::Min(8)]).block(
        Block::default()
            .title(format!("Token Usage & Cost ({currency})"))
            .borders(Borders::ALL),
    );
    frame.render_widget(table, area);
}

fn render_last_query(frame: &mut Frame, area: Rect, cost: Option<&QueryCost>) {
    let block = Block::default()
        .title("Last Query")
        .borders(Borders::ALL);
    let Some(cost) = cost else {
        frame.render_widget(Paragraph::new("No query yet").block(block), area);
        return;
    };

    let savings = match (cost.savings, cost.hit_rate) {
        (Some(savings), Some(rate)) => format!("{} ({rate:.1}% cached)", format_query_cost(savings)),
        (Some(savings), None) => format_query_cost(savings),
        (None, _) => "–".to_string(),
    };
    let rows = vec![
        metric_row("Prompt", format_tokens(cost.prompt_tokens)),
        metric_row("Completion", format_tokens(cost.completion_tokens)),
        metric_row("Cached", format_tokens(cost.cached_tokens)),
        metric_row("Cache Hit Cost", format_query_cost(cost.hit_cost)),
        metric_row("Cache Miss Cost", format_query_cost(cost.miss_cost)),
        metric_row("Query Cost", format_query_cost(cost.cost)),
        metric_row("Saved", savings),
    ];
    let table = Table::new(rows, [Constraint::Length(16), Constraint::Min(8)]).block(block);
    frame.render_widget(table, area);
}

fn render_recent_queries(frame: &mut Frame, area: Rect, recent: &[TurnRecord]) {
    let header = Row::new(vec!["Time", "Prompt", "Cached", "Cost"]).style(
        Style::default()
            .fg(Color::Yellow)
            .add_modifier(Modifier::BOLD),
    );

    let rows = if recent.is_empty() {
        vec![Row::new(vec!["–", "No queries yet", "–", "–"])]
    } else {
        recent
            .iter()
            .map(|turn| {
                Row::new(vec![
                    turn.timestamp.format("%H:%M:%S").to_string(),
                    format_tokens(turn.prompt_tokens),
                    format_tokens(turn.cached_tokens),
                    format_query_cost(turn.cost),
                ])
            })
            .collect()
    };

    let widths = [
        Constraint::Length(9),
        Constraint::Length(8),
        Constraint::Length(8),
        Constraint::Min(10),
    ];
    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().title("Recent Queries").borders(Borders::ALL))
        .column_spacing(1);
    frame.render_widget(table, area);
}

fn render_samples(frame: &mut Frame, area: Rect, selected: Option<usize>) {
    let items: Vec<ListItem> = SAMPLE_QUESTIONS
        .iter()
        .enumerate()
        .map(|(idx, question)| {
            let item = ListItem::new(format!("Q{}: {}", idx + 1, question));
            if selected == Some(idx) {
                item.style(
                    Style::default()
                        .fg(Color::White)
                        .bg(Color::Blue)
                        .add_modifier(Modifier::BOLD),
                )
            } else {
                item
            }
        })
        .collect();
    let list = List::new(items).block(
        Block::default()
            .title("Sample Questions")
            .borders(Borders::ALL),
    );
    frame.render_widget(list, area);
}

fn metric_row(label: &'static str, value: String) -> Row<'static> {
    Row::new(vec![
        Cell::from(label).style(
            Style::default()
                .fg(Color::Gray)
                .add_modifier(Modifier::BOLD),
        ),
        Cell::from(value),
    ])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusKind {
    Info,
    Error,
}

#[derive(Debug, Clone)]
struct StatusLine {
    kind: StatusKind,
    text: String,
}

struct ChatViewState {
    input: String,
    sample_cursor: Option<usize>,
    scroll_back: u16,
    status: Option<StatusLine>,
    last_cost: Option<QueryCost>,
}

impl ChatViewState {
    fn new() -> Self {
        Self {
            input: String::new(),
            sample_cursor: None,
            scroll_back: 0,
            status: None,
            last_cost: None,
        }
    }

    fn set_status(&mut self, kind: StatusKind, text: impl Into<String>) {
        self.status = Some(StatusLine {
            kind,
            text: text.into(),
        });
    }

    fn push_char(&mut self, ch: char) {
        self.input.push(ch);
        self.sample_cursor = None;
    }

    fn pop_char(&mut self) {
        self.input.pop();
        self.sample_cursor = None;
    }

    fn take_input(&mut self) -> String {
        self.sample_cursor = None;
        std::mem::take(&mut self.input)
    }

    fn next_sample(&mut self) {
        let idx = match self.sample_cursor {
            Some(idx) => (idx + 1) % SAMPLE_QUESTIONS.len(),
            None => 0,
        };
        self.select_sample(idx);
    }

    fn prev_sample(&mut self) {
        let idx = match self.sample_cursor {
            Some(0) | None => SAMPLE_QUESTIONS.len() - 1,
            Some(idx) => idx - 1,
        };
        self.select_sample(idx);
    }

    fn select_sample(&mut self, idx: usize) {
        self.sample_cursor = Some(idx);
        self.input = SAMPLE_QUESTIONS[idx].to_string();
    }

    fn apply_outcome(&mut self, result: Result<TurnOutcome, TurnError>) {
        match result {
            Ok(TurnOutcome::Completed(turn)) => {
                self.last_cost = turn.cost;
                self.scroll_back = 0;
                if turn.malformed {
                    self.set_status(
                        StatusKind::Error,
                        "The assistant returned no text for this question.",
                    );
                } else {
                    self.status = None;
                }
            }
            Ok(TurnOutcome::Rejected(Admission::Duplicate)) => {
                self.set_status(
                    StatusKind::Info,
                    "Same question as the previous turn; nothing sent.",
                );
            }
            Ok(TurnOutcome::Rejected(_)) => {
                self.set_status(StatusKind::Info, "Type a question first.");
            }
            Err(err) => {
                tracing::error!(error = %err, "turn failed");
                self.scroll_back = 0;
                self.set_status(StatusKind::Error, format!("❌ {err}"));
            }
        }
    }
}

fn wrapped_height(line_width: usize, inner_width: u16) -> usize {
    if line_width == 0 {
        1
    } else {
        line_width.div_ceil(usize::from(inner_width.max(1)))
    }
}

fn format_tokens(value: u64) -> String {
    if value >= 1_000_000 {
        format!("{:.1}M", value as f64 / 1_000_000.0)
    } else if value >= 1_000 {
        format!("{:.1}K", value as f64 / 1_000.0)
    } else {
        value.to_string()
    }
}

fn format_cost(cost: f64) -> String {
    format!("${:.4}", cost)
}

fn format_query_cost(cost: f64) -> String {
    format!("${:.6}", cost)
}

fn truncate_text(input: &str, max_chars: usize) -> String {
    if input.chars().count() <= max_chars {
        return input.to_string();
    }
    let mut truncated: String = input.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}
