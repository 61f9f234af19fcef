use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use td_schemas::{Side, Ticker};

#[derive(Debug, Clone, Copy)]
pub struct Account {
    pub portfolio_value: f64,
    pub equity: f64,
    pub last_equity: f64,
    pub cash: f64,
    pub buying_power: f64,
}

#[derive(Debug, Clone)]
pub struct Position {
    pub ticker: Ticker,
    pub qty: i64,
    pub avg_entry_price: f64,
    pub current_price: f64,
    pub market_value: f64,
    pub cost_basis: f64,
    pub unrealized_pl: f64,
    pub unrealized_plpc: f64,
    pub side: Side,
}

#[derive(Debug, Clone)]
pub struct CalendarDay {
    pub date: NaiveDate,
    pub open: DateTime<Utc>,
    pub close: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BrokerOrder {
    pub id: String,
    pub ticker: Ticker,
    pub side: Side,
    pub status: String,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct SubmitOrderRequest {
    pub ticker: Ticker,
    pub side: Side,
    pub order_type: String,
    pub qty: Option<i64>,
    pub notional: Option<f64>,
    pub time_in_force: String,
}

#[derive(Debug, Clone)]
pub struct SubmittedOrder {
    pub id: String,
}

#[derive(Debug, Clone)]
pub struct OhlcvBar {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
}

#[derive(Debug, Clone)]
pub struct NewsItem {
    pub headline: String,
    pub summary: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeframe {
    Daily,
    Hourly,
}

/// The broker collaborator contract (§6.1). Every operation is cancellable
/// at the `tokio` layer via the caller's own timeout; this trait does not
/// impose one itself.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn get_account(&self) -> Result<Account>;
    async fn get_positions(&self) -> Result<Vec<Position>>;
    async fn get_calendar(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<CalendarDay>>;
    async fn get_orders_since(&self, since: DateTime<Utc>) -> Result<Vec<BrokerOrder>>;
    async fn submit_order(&self, req: SubmitOrderRequest) -> Result<SubmittedOrder>;
    async fn get_bars(
        &self,
        ticker: &Ticker,
        timeframe: Timeframe,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<OhlcvBar>>;
    async fn get_news(
        &self,
        ticker: &Ticker,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NewsItem>>;
    fn is_paper(&self) -> bool;
}

/// A deterministic, dependency-free stand-in for a live broker, sufficient
/// to drive the Coordinator end-to-end in tests — the same role this
/// codebase's paper-broker crate plays for its own broker contract.
pub struct FixtureBroker {
    account: Account,
    positions: Mutex<Vec<Position>>,
    bars: HashMap<String, Vec<OhlcvBar>>,
    next_order_id: Mutex<u64>,
    paper: bool,
}

impl FixtureBroker {
    pub fn new(account: Account) -> Self {
        FixtureBroker {
            account,
            positions: Mutex::new(Vec::new()),
            bars: HashMap::new(),
            next_order_id: Mutex::new(1),
            paper: true,
        }
    }

    pub fn with_position(mut self, position: Position) -> Self {
        self.positions.get_mut().unwrap().push(position);
        self
    }

    pub fn with_bars(mut self, ticker: &str, bars: Vec<OhlcvBar>) -> Self {
        self.bars.insert(ticker.to_string(), bars);
        self
    }
}

#[async_trait]
impl BrokerAdapter for FixtureBroker {
    async fn get_account(&self) -> Result<Account> {
        Ok(self.account)
    }

    async fn get_positions(&self) -> Result<Vec<Position>> {
        Ok(self.positions.lock().unwrap().clone())
    }

    async fn get_calendar(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<CalendarDay>> {
        let mut out = Vec::new();
        let mut d = start;
        while d <= end {
            if let Some((open, close)) = td_calendar_bounds(d) {
                out.push(CalendarDay { date: d, open, close });
            }
            d = d.succ_opt().unwrap();
        }
        Ok(out)
    }

    async fn get_orders_since(&self, _since: DateTime<Utc>) -> Result<Vec<BrokerOrder>> {
        Ok(Vec::new())
    }

    async fn submit_order(&self, _req: SubmitOrderRequest) -> Result<SubmittedOrder> {
        let mut n = self.next_order_id.lock().unwrap();
        let id = format!("fixture-order-{n}");
        *n += 1;
        Ok(SubmittedOrder { id })
    }

    async fn get_bars(
        &self,
        ticker: &Ticker,
        _timeframe: Timeframe,
        _start: NaiveDate,
        _end: NaiveDate,
    ) -> Result<Vec<OhlcvBar>> {
        Ok(self.bars.get(ticker.as_str()).cloned().unwrap_or_default())
    }

    async fn get_news(
        &self,
        _ticker: &Ticker,
        _start: DateTime<Utc>,
        _end: DateTime<Utc>,
        _limit: usize,
    ) -> Result<Vec<NewsItem>> {
        Ok(Vec::new())
    }

    fn is_paper(&self) -> bool {
        self.paper
    }
}

/// Local helper kept free of the `td-calendar` dependency: the fixture only
/// needs a trivial weekday session window, not holiday fidelity.
fn td_calendar_bounds(date: NaiveDate) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
    use chrono::Weekday;
    if matches!(date.weekday(), Weekday::Sat | Weekday::Sun) {
        return None;
    }
    let open = date.and_hms_opt(14, 30, 0)?.and_utc();
    let close = date.and_hms_opt(21, 0, 0)?.and_utc();
    Some((open, close))
}
