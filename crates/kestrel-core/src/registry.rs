use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::Serialize;
use serde_json::Value;

use crate::error::AppError;
use crate::query::{Filter, Sort, View};
use crate::routine::Routine;
use crate::schema::InputSchema;

pub const DEFAULT_MAX_CONCURRENT_RUNS: usize = 1;
pub const DEFAULT_MAX_QUEUED_RUNS: usize = 100;

/// Registration request for a scraper. Checked by [`ScraperRegistry::register`].
#[derive(Clone)]
pub struct NewScraper {
    pub name: String,
    pub routine: Option<Arc<dyn Routine>>,
    pub input_schema: InputSchema,
    pub filters: Vec<Filter>,
    pub sorts: Vec<Sort>,
    /// Sort applied when a query names none. Defaults to [`Sort::NO_SORT`].
    pub default_sort: Option<String>,
    pub views: Vec<View>,
    pub max_concurrent_runs: usize,
    pub max_queued_runs: usize,
}

impl NewScraper {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            routine: None,
            input_schema: InputSchema::default(),
            filters: Vec::new(),
            sorts: Vec::new(),
            default_sort: None,
            views: Vec::new(),
            max_concurrent_runs: DEFAULT_MAX_CONCURRENT_RUNS,
            max_queued_runs: DEFAULT_MAX_QUEUED_RUNS,
        }
    }

    pub fn routine<R: Routine + 'static>(mut self, routine: R) -> Self {
        self.routine = Some(Arc::new(routine));
        self
    }

    pub fn input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sorts.push(sort);
        self
    }

    pub fn default_sort(mut self, name: impl Into<String>) -> Self {
        self.default_sort = Some(name.into());
        self
    }

    pub fn view(mut self, view: View) -> Self {
        self.views.push(view);
        self
    }

    pub fn max_concurrent_runs(mut self, max: usize) -> Self {
        self.max_concurrent_runs = max;
        self
    }

    pub fn max_queued_runs(mut self, max: usize) -> Self {
        self.max_queued_runs = max;
        self
    }
}

impl fmt::Debug for NewScraper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewScraper")
            .field("name", &self.name)
            .field("has_routine", &self.routine.is_some())
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("max_queued_runs", &self.max_queued_runs)
            .finish_non_exhaustive()
    }
}

/// A validated, registered scraper. Immutable once registered.
pub struct ScraperDefinition {
    name: String,
    routine: Arc<dyn Routine>,
    input_schema: InputSchema,
    filters: Vec<Filter>,
    sorts: Vec<Sort>,
    default_sort: String,
    views: Vec<View>,
    max_concurrent_runs: usize,
    max_queued_runs: usize,
}

impl ScraperDefinition {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn routine(&self) -> &Arc<dyn Routine> {
        &self.routine
    }

    pub fn input_schema(&self) -> &InputSchema {
        &self.input_schema
    }

    pub fn max_concurrent_runs(&self) -> usize {
        self.max_concurrent_runs
    }

    pub fn max_queued_runs(&self) -> usize {
        self.max_queued_runs
    }

    pub fn default_sort(&self) -> &str {
        &self.default_sort
    }

    pub fn filter(&self, name: &str) -> Result<&Filter, AppError> {
        self.filters
            .iter()
            .find(|f| f.name() == name)
            .ok_or_else(|| AppError::UnknownFilter {
                scraper: self.name.clone(),
                filter: name.to_string(),
            })
    }

    /// Resolve a sort by name, or the default sort when `name` is `None`.
    pub fn sort(&self, name: Option<&str>) -> Result<&Sort, AppError> {
        let name = name.unwrap_or(&self.default_sort);
        self.sorts
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| AppError::UnknownSort {
                scraper: self.name.clone(),
                sort: name.to_string(),
            })
    }

    pub fn view(&self, name: &str) -> Result<&View, AppError> {
        self.views
            .iter()
            .find(|v| v.name() == name)
            .ok_or_else(|| AppError::UnknownView {
                scraper: self.name.clone(),
                view: name.to_string(),
            })
    }

    /// Serializable description of the scraper for listings.
    pub fn summary(&self) -> ScraperSummary {
        ScraperSummary {
            name: self.name.clone(),
            input_schema: self.input_schema.to_json_schema(),
            filters: self.filters.iter().map(|f| f.name().to_string()).collect(),
            sorts: self.sorts.iter().map(|s| s.name().to_string()).collect(),
            default_sort: self.default_sort.clone(),
            views: self.views.iter().map(|v| v.name().to_string()).collect(),
            max_concurrent_runs: self.max_concurrent_runs,
            max_queued_runs: self.max_queued_runs,
        }
    }
}

impl fmt::Debug for ScraperDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScraperDefinition")
            .field("name", &self.name)
            .field("default_sort", &self.default_sort)
            .field("max_concurrent_runs", &self.max_concurrent_runs)
            .field("max_queued_runs", &self.max_queued_runs)
            .finish_non_exhaustive()
    }
}

impl TryFrom<NewScraper> for ScraperDefinition {
    type Error = AppError;

    fn try_from(new: NewScraper) -> Result<Self, Self::Error> {
        let invalid = |msg: String| AppError::InvalidDefinition(format!("{}: {msg}", new.name));

        if new.name.trim().is_empty() {
            return Err(AppError::InvalidDefinition(
                "scraper name must not be empty".into(),
            ));
        }
        let Some(routine) = new.routine.clone() else {
            return Err(invalid("no routine".into()));
        };
        if new.max_concurrent_runs < 1 {
            return Err(invalid("max_concurrent_runs must be at least 1".into()));
        }
        new.input_schema.check().map_err(|e| invalid(e))?;

        let mut sorts = new.sorts;
        if !sorts.iter().any(|s| s.name() == Sort::NO_SORT) {
            sorts.insert(0, Sort::none());
        }

        ensure_unique("filter", new.filters.iter().map(Filter::name)).map_err(&invalid)?;
        ensure_unique("sort", sorts.iter().map(Sort::name)).map_err(&invalid)?;
        ensure_unique("view", new.views.iter().map(View::name)).map_err(&invalid)?;

        let default_sort = new
            .default_sort
            .unwrap_or_else(|| Sort::NO_SORT.to_string());
        if !sorts.iter().any(|s| s.name() == default_sort) {
            return Err(invalid(format!(
                "default sort '{default_sort}' is not declared"
            )));
        }

        Ok(Self {
            name: new.name,
            routine,
            input_schema: new.input_schema,
            filters: new.filters,
            sorts,
            default_sort,
            views: new.views,
            max_concurrent_runs: new.max_concurrent_runs,
            max_queued_runs: new.max_queued_runs,
        })
    }
}

fn ensure_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> Result<(), String> {
    let mut seen = HashSet::new();
    for name in names {
        if name.is_empty() {
            return Err(format!("{kind} name must not be empty"));
        }
        if !seen.insert(name) {
            return Err(format!("duplicate {kind} '{name}'"));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScraperSummary {
    pub name: String,
    pub input_schema: Value,
    pub filters: Vec<String>,
    pub sorts: Vec<String>,
    pub default_sort: String,
    pub views: Vec<String>,
    pub max_concurrent_runs: usize,
    pub max_queued_runs: usize,
}

#[derive(Default)]
struct RegistryInner {
    /// Registration order; an overwrite keeps the original position.
    order: Vec<String>,
    scrapers: HashMap<String, Arc<ScraperDefinition>>,
}

/// Name → definition map shared by admission, execution and queries.
///
/// Lookups hand out `Arc`s, so a definition replaced by an overwrite stays
/// alive for runs that already resolved it.
#[derive(Default)]
pub struct ScraperRegistry {
    inner: RwLock<RegistryInner>,
}

impl ScraperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_inner(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registry lock");
            poisoned.into_inner()
        })
    }

    fn write_inner(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned registry lock");
            poisoned.into_inner()
        })
    }

    /// Validate and store a scraper definition.
    ///
    /// Without `overwrite`, registering an existing name fails and leaves the
    /// original definition in place.
    pub fn register(
        &self,
        new: NewScraper,
        overwrite: bool,
    ) -> Result<Arc<ScraperDefinition>, AppError> {
        let definition = Arc::new(ScraperDefinition::try_from(new)?);
        let name = definition.name().to_string();

        let mut inner = self.write_inner();
        if inner.scrapers.contains_key(&name) {
            if !overwrite {
                return Err(AppError::DuplicateScraper(name));
            }
            tracing::info!(scraper = %name, "Replacing scraper definition");
        } else {
            inner.order.push(name.clone());
        }
        inner.scrapers.insert(name, Arc::clone(&definition));
        Ok(definition)
    }

    pub fn lookup(&self, name: &str) -> Result<Arc<ScraperDefinition>, AppError> {
        self.read_inner()
            .scrapers
            .get(name)
            .cloned()
            .ok_or_else(|| AppError::UnknownScraper(name.to_string()))
    }

    /// Registered names in registration order.
    pub fn list(&self) -> Vec<String> {
        self.read_inner().order.clone()
    }

    pub fn summaries(&self) -> Vec<ScraperSummary> {
        let inner = self.read_inner();
        inner
            .order
            .iter()
            .filter_map(|name| inner.scrapers.get(name))
            .map(|d| d.summary())
            .collect()
    }

    /// Validate and normalize a raw input against the named scraper's schema.
    pub fn validate_input(&self, name: &str, raw: &Value) -> Result<Value, AppError> {
        self.lookup(name)?.input_schema().validate(raw)
    }

    pub fn len(&self) -> usize {
        self.read_inner().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
