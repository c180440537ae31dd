//! Result queries: named filters, sorts and views declared per scraper,
//! applied to the scraper's run records in a fixed order
//! (filter → sort → project → paginate).

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use crate::config::OrchestratorConfig;
use crate::error::AppError;
use crate::registry::ScraperRegistry;
use crate::run::{RunRecord, RunStatus};
use crate::store::RunStore;

type Predicate = Arc<dyn Fn(&RunRecord) -> bool + Send + Sync>;
type Comparator = Arc<dyn Fn(&RunRecord, &RunRecord) -> Ordering + Send + Sync>;
type Projection = Arc<dyn Fn(&RunRecord) -> Value + Send + Sync>;

/// A named predicate clients may apply to a scraper's records.
#[derive(Clone)]
pub struct Filter {
    name: String,
    predicate: Predicate,
}

impl Filter {
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&RunRecord) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            predicate: Arc::new(predicate),
        }
    }

    /// Keep records with the given status.
    pub fn status(name: impl Into<String>, status: RunStatus) -> Self {
        Self::new(name, move |record| record.status == status)
    }

    /// Keep records whose result satisfies `predicate`. Records without a
    /// result never match.
    pub fn result<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        Self::new(name, move |record| record.result.as_ref().is_some_and(&predicate))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn matches(&self, record: &RunRecord) -> bool {
        (self.predicate)(record)
    }
}

impl fmt::Debug for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filter").field("name", &self.name).finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// A named ordering of a scraper's records.
#[derive(Clone)]
pub struct Sort {
    name: String,
    /// `None` keeps store order.
    comparator: Option<Comparator>,
}

impl Sort {
    /// Name of the no-op sort every scraper carries.
    pub const NO_SORT: &'static str = "no_sort";

    pub fn new<F>(name: impl Into<String>, comparator: F) -> Self
    where
        F: Fn(&RunRecord, &RunRecord) -> Ordering + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            comparator: Some(Arc::new(comparator)),
        }
    }

    pub fn none() -> Self {
        Self {
            name: Self::NO_SORT.to_string(),
            comparator: None,
        }
    }

    pub fn newest_first() -> Self {
        Self::new("newest_first", |a, b| b.fifo_cmp(a))
    }

    pub fn oldest_first() -> Self {
        Self::new("oldest_first", |a, b| a.fifo_cmp(b))
    }

    /// Order by the value at `pointer` (RFC 6901) inside each record's result.
    ///
    /// Records lacking the value sort last in either direction.
    pub fn by_result_field(name: impl Into<String>, pointer: impl Into<String>, order: SortOrder) -> Self {
        let pointer = pointer.into();
        Self::new(name, move |a, b| {
            let left = a.result.as_ref().and_then(|r| r.pointer(&pointer));
            let right = b.result.as_ref().and_then(|r| r.pointer(&pointer));
            match (left, right) {
                (Some(l), Some(r)) => match order {
                    SortOrder::Ascending => compare_json(l, r),
                    SortOrder::Descending => compare_json(r, l),
                },
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stable in-place sort; records comparing equal keep store order.
    pub fn apply(&self, records: &mut [RunRecord]) {
        if let Some(cmp) = &self.comparator {
            records.sort_by(|a, b| cmp(a, b));
        }
    }
}

impl fmt::Debug for Sort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sort").field("name", &self.name).finish()
    }
}

/// A named projection shaping each record before it is returned.
#[derive(Clone)]
pub struct View {
    name: String,
    projection: Projection,
}

impl View {
    pub fn new<F>(name: impl Into<String>, projection: F) -> Self
    where
        F: Fn(&RunRecord) -> Value + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            projection: Arc::new(projection),
        }
    }

    /// Just the result value (`null` for runs without one).
    pub fn result_only(name: impl Into<String>) -> Self {
        Self::new(name, |record| record.result.clone().unwrap_or(Value::Null))
    }

    /// Run id, status and timestamps, without input or output.
    pub fn summary(name: impl Into<String>) -> Self {
        Self::new(name, |record| {
            serde_json::json!({
                "id": record.id,
                "status": record.status,
                "created_at": record.created_at,
                "started_at": record.started_at,
                "finished_at": record.finished_at,
            })
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn project(&self, record: &RunRecord) -> Value {
        (self.projection)(record)
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View").field("name", &self.name).finish()
    }
}

/// Offset/limit window. A missing limit means the configured default page size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PageRequest {
    pub offset: usize,
    pub limit: Option<usize>,
}

impl PageRequest {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self {
            offset,
            limit: Some(limit),
        }
    }

    /// 1-based page number; page 0 is treated as page 1.
    pub fn page(page: usize, page_size: usize) -> Self {
        Self::new(page.saturating_sub(1).saturating_mul(page_size), page_size)
    }
}

/// Named filter/sort/view plus a page window. Unset names fall back to no
/// filter, the scraper's default sort and the full record.
#[derive(Debug, Clone, Default)]
pub struct QuerySpec {
    pub filter: Option<String>,
    pub sort: Option<String>,
    pub view: Option<String>,
    pub page: PageRequest,
}

impl QuerySpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn filter(mut self, name: impl Into<String>) -> Self {
        self.filter = Some(name.into());
        self
    }

    pub fn sort(mut self, name: impl Into<String>) -> Self {
        self.sort = Some(name.into());
        self
    }

    pub fn view(mut self, name: impl Into<String>) -> Self {
        self.view = Some(name.into());
        self
    }

    pub fn page(mut self, page: PageRequest) -> Self {
        self.page = page;
        self
    }
}

/// One page of query output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultPage {
    pub items: Vec<Value>,
    /// Number of records that passed the filter.
    pub total: usize,
    pub offset: usize,
    pub limit: usize,
    pub has_more: bool,
}

impl ResultPage {
    /// Window for the following page, if there is one.
    pub fn next_page(&self) -> Option<PageRequest> {
        self.has_more
            .then(|| PageRequest::new(self.offset + self.items.len(), self.limit))
    }
}

/// Reads a scraper's records from the store and shapes them per a [`QuerySpec`].
#[derive(Clone)]
pub struct ResultQuery<S: RunStore> {
    registry: Arc<ScraperRegistry>,
    store: S,
    default_page_size: usize,
    max_page_size: usize,
}

impl<S: RunStore> ResultQuery<S> {
    pub fn new(registry: Arc<ScraperRegistry>, store: S, config: &OrchestratorConfig) -> Self {
        Self {
            registry,
            store,
            default_page_size: config.default_page_size,
            max_page_size: config.max_page_size,
        }
    }

    pub async fn query(&self, scraper_name: &str, spec: &QuerySpec) -> Result<ResultPage, AppError> {
        let definition = self.registry.lookup(scraper_name)?;
        let filter = spec
            .filter
            .as_deref()
            .map(|name| definition.filter(name))
            .transpose()?;
        let sort = definition.sort(spec.sort.as_deref())?;
        let view = spec
            .view
            .as_deref()
            .map(|name| definition.view(name))
            .transpose()?;

        let mut records = self.store.list_by_scraper(scraper_name).await?;
        if let Some(filter) = filter {
            records.retain(|record| filter.matches(record));
        }
        sort.apply(&mut records);

        let total = records.len();
        let limit = spec
            .page
            .limit
            .unwrap_or(self.default_page_size)
            .clamp(1, self.max_page_size.max(1));
        let offset = spec.page.offset.min(total);
        let end = offset.saturating_add(limit).min(total);

        // Projection is per record, so projecting only the window yields the
        // same page as projecting everything first.
        let items = records[offset..end]
            .iter()
            .map(|record| match view {
                Some(view) => Ok(view.project(record)),
                None => serde_json::to_value(record),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(ResultPage {
            items,
            total,
            offset,
            limit,
            has_more: end < total,
        })
    }
}

/// Total order over JSON values used by result-field sorts: numbers
/// numerically, strings lexically, otherwise by type rank.
fn compare_json(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x
            .as_f64()
            .zip(y.as_f64())
            .and_then(|(x, y)| x.partial_cmp(&y))
            .unwrap_or(Ordering::Equal),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}
