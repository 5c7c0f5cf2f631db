//! Generic repository over any [`Entity`]
//!
//! Every operation runs through the same pipeline:
//!
//! 1. render SQL with validated identifiers and `$n` parameters
//! 2. execute under the query timeout, racing the repository's
//!    [`CancellationToken`]
//! 3. retry transient failures with the configured policy (never inside a
//!    transaction)
//! 4. report duration, outcome and row count to the metrics collector
//!
//! Repositories are cheap to clone. A repository bound to a transaction is
//! only ever handed out by [`Repository::with_transaction`].

use std::future::Future;
use std::marker::PhantomData;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use sqlx::any::AnyRow;
use tokio_util::sync::CancellationToken;

use super::entity::{column, now_millis, Entity, TableSchema, ID_COLUMN};
use super::filter::{FilterCondition, Value};
use super::handle::{DbHandle, TxHandle};
use super::pagination::{Cursor, CursorDirection, CursorPage, Pagination};
use super::query::{validate_column, validate_schema, SqlBuilder};
use super::validation::{ValidationResult, Validator};
use crate::config::RepositoryConfig;
use crate::error::{DatabaseError, DbResult, ErrorKind, Severity};
use crate::ids::{is_valid_prefix, IdGenerator, TypeIdGenerator};
use crate::observability::{report, MetricsCollector, TracingMetrics};
use crate::retry::{RetryHandler, RetryPolicy};

/// Columns callers may never assign directly
const IMMUTABLE_COLUMNS: [&str; 3] = [ID_COLUMN, "created_at", "created_by"];

/// CRUD, pagination and transactions for one entity type
///
/// # Example
///
/// ```rust,ignore
/// let repo = Repository::<Widget>::new(manager.primary(), Widget::schema(), RepositoryConfig::default())?;
///
/// let mut widget = Widget::new("gear", 3);
/// repo.create(&mut widget).await?;
///
/// let page = repo.find_all_with_cursor(None, 20, CursorDirection::Next).await?;
/// if let Some(token) = page.next_cursor {
///     let more = repo.find_all_with_cursor(Some(&token), 20, CursorDirection::Next).await?;
/// }
/// ```
pub struct Repository<T: Entity> {
    handle: DbHandle,
    schema: Arc<TableSchema>,
    config: Arc<RepositoryConfig>,
    retry: RetryHandler,
    cancel: CancellationToken,
    validator: Option<Arc<dyn Validator<T>>>,
    metrics: Arc<dyn MetricsCollector>,
    ids: Arc<dyn IdGenerator>,
    actor: Option<String>,
    _entity: PhantomData<fn() -> T>,
}

impl<T: Entity> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            handle: self.handle.clone(),
            schema: Arc::clone(&self.schema),
            config: Arc::clone(&self.config),
            retry: self.retry.clone(),
            cancel: self.cancel.clone(),
            validator: self.validator.clone(),
            metrics: Arc::clone(&self.metrics),
            ids: Arc::clone(&self.ids),
            actor: self.actor.clone(),
            _entity: PhantomData,
        }
    }
}

impl<T: Entity> std::fmt::Debug for Repository<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("table", &self.schema.table)
            .field("transactional", &self.handle.is_transaction())
            .field("actor", &self.actor)
            .finish_non_exhaustive()
    }
}

impl<T: Entity> Repository<T> {
    /// Bind a repository to a pool (or pool handle)
    ///
    /// Fails with `Configuration` for an invalid config or id prefix and with
    /// `Security` for table or column names that are not plain identifiers.
    pub fn new(
        handle: impl Into<DbHandle>,
        schema: TableSchema,
        config: RepositoryConfig,
    ) -> DbResult<Self> {
        config.validate()?;
        validate_schema(&schema)?;
        if !is_valid_prefix(&schema.id_prefix) {
            return Err(DatabaseError::configuration(format!(
                "invalid id prefix '{}'",
                schema.id_prefix
            ))
            .with_table(schema.table.clone()));
        }

        Ok(Self {
            handle: handle.into(),
            retry: RetryHandler::new(RetryPolicy::from(&config.retry)),
            schema: Arc::new(schema),
            config: Arc::new(config),
            cancel: CancellationToken::new(),
            validator: None,
            metrics: Arc::new(TracingMetrics),
            ids: Arc::new(TypeIdGenerator),
            actor: None,
            _entity: PhantomData,
        })
    }

    /// Abort in-flight work when `token` is cancelled
    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    #[must_use]
    pub fn with_validator(mut self, validator: Arc<dyn Validator<T>>) -> Self {
        self.validator = Some(validator);
        self
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsCollector>) -> Self {
        self.metrics = metrics;
        self
    }

    #[must_use]
    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = ids;
        self
    }

    /// Record `actor` in the created_by/updated_by/deleted_by columns
    #[must_use]
    pub fn acting_as(&self, actor: impl Into<String>) -> Self {
        let mut repo = self.clone();
        repo.actor = Some(actor.into());
        repo
    }

    pub fn schema(&self) -> &TableSchema {
        &self.schema
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn handle(&self) -> &DbHandle {
        &self.handle
    }

    pub fn is_transactional(&self) -> bool {
        self.handle.is_transaction()
    }

    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert one entity
    ///
    /// Assigns an identifier when the entity has none and stamps the audit
    /// columns.
    pub async fn create(&self, entity: &mut T) -> DbResult<()> {
        const OP: &str = "create";
        self.check_valid(OP, entity).await?;
        self.prepare_insert(entity);

        let (sql, params) = self.render_insert(OP, std::slice::from_ref(&*entity))?;
        self.observe(
            OP,
            |rows: &u64| *rows,
            self.run(OP, || self.handle.execute(OP, &sql, &params)),
        )
        .await
        .map(|_| ())
    }

    /// Insert entities in chunks of `batch_size`, one transaction per chunk
    ///
    /// Chunks that committed before a failing chunk stay committed; later
    /// chunks are not attempted. Returns the number of inserted rows.
    pub async fn create_in_batches(&self, entities: &mut [T], batch_size: usize) -> DbResult<u64> {
        const OP: &str = "create_in_batches";
        if entities.is_empty() {
            return Err(self.invalid(OP, "no entities to insert"));
        }
        if batch_size == 0 {
            return Err(self.invalid(OP, "batch_size must be positive"));
        }

        let mut inserted = 0u64;
        for (index, chunk) in entities.chunks_mut(batch_size).enumerate() {
            for entity in chunk.iter_mut() {
                self.check_valid(OP, entity).await?;
                self.prepare_insert(entity);
            }
            let (sql, params) = self.render_insert(OP, chunk)?;

            let result = self
                .observe(
                    OP,
                    |rows: &u64| *rows,
                    self.run(OP, || self.insert_chunk(&sql, &params)),
                )
                .await;

            match result {
                Ok(rows) => inserted += rows,
                Err(error) => {
                    tracing::warn!(
                        table = %self.schema.table,
                        chunk = index,
                        committed_rows = inserted,
                        error = %error,
                        "batch insert stopped"
                    );
                    return Err(error);
                }
            }
        }
        Ok(inserted)
    }

    async fn insert_chunk(&self, sql: &str, params: &[Value]) -> DbResult<u64> {
        const OP: &str = "create_in_batches";
        let (tx, owned) = self.handle.begin().await?;
        let outcome = DbHandle::Transaction(tx.clone())
            .execute(OP, sql, params)
            .await;
        finish_tx(&tx, owned, outcome).await
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch by identifier; `NotFound` when absent
    pub async fn find_first_by_id(&self, id: &str) -> DbResult<T> {
        const OP: &str = "find_first_by_id";
        match self
            .fetch_first(OP, &[FilterCondition::eq(ID_COLUMN, id)])
            .await?
        {
            Some(entity) => Ok(entity),
            None => Err(DatabaseError::not_found(OP, self.schema.table.clone(), id)),
        }
    }

    /// First row (by identifier) matching every condition; `NotFound` when none
    pub async fn find_first_by_conditions(&self, conditions: &[FilterCondition]) -> DbResult<T> {
        const OP: &str = "find_first_by_conditions";
        match self.fetch_first(OP, conditions).await? {
            Some(entity) => Ok(entity),
            None => Err(DatabaseError::new(
                ErrorKind::NotFound,
                OP,
                "no row matches the conditions",
            )
            .with_table(self.schema.table.clone())),
        }
    }

    async fn fetch_first(&self, op: &'static str, conditions: &[FilterCondition]) -> DbResult<Option<T>> {
        let mut builder = self.select();
        builder.push_where(op, &self.schema, conditions, self.schema.soft_delete)?;
        builder.push(" ORDER BY id ASC LIMIT 1");
        let (sql, params) = builder.finish();

        let row = self
            .observe(
                op,
                |row: &Option<AnyRow>| u64::from(row.is_some()),
                self.run(op, || self.handle.fetch_optional(op, &sql, &params)),
            )
            .await?;
        row.as_ref().map(T::from_row).transpose()
    }

    /// One page by offset, ordered by identifier
    ///
    /// A negative offset is treated as 0; a non-positive limit becomes the
    /// default limit and a limit above `max_limit` is capped.
    pub async fn find_all_with_offset(&self, limit: i64, offset: i64) -> DbResult<Vec<T>> {
        const OP: &str = "find_all_with_offset";
        let page = Pagination::new(offset, limit).normalized(&self.config);

        let mut builder = self.select();
        builder.push_where(OP, &self.schema, &[], self.schema.soft_delete)?;
        builder.push(" ORDER BY id ASC LIMIT ");
        builder.push_param(Value::Integer(page.limit));
        builder.push(" OFFSET ");
        builder.push_param(Value::Integer(page.offset));
        let (sql, params) = builder.finish();

        self.fetch_entities(OP, &sql, &params).await
    }

    /// One page by cursor
    ///
    /// `Next` walks identifiers ascending from the cursor, `Prev` walks them
    /// descending. Without a cursor the walk starts at the respective end.
    /// A cursor naming an identifier that does not exist (or is soft
    /// deleted) yields an empty page. The returned `next_cursor` continues
    /// in the same direction and is `None` once no rows remain;
    /// `prev_cursor` walks back and is `None` on the first page. The direction
    /// stored in a token is ignored here; `direction` alone picks the walk.
    pub async fn find_all_with_cursor(
        &self,
        cursor: Option<&str>,
        limit: i64,
        direction: CursorDirection,
    ) -> DbResult<CursorPage<T>> {
        const OP: &str = "find_all_with_cursor";
        let limit = self.config.clamp_limit(limit);
        let cursor = cursor.map(Cursor::decode).transpose()?;

        if let Some(cursor) = &cursor {
            let anchor = [FilterCondition::eq(ID_COLUMN, cursor.id.as_str())];
            if !self.exists(OP, &anchor, self.schema.soft_delete).await? {
                return Ok(CursorPage::empty());
            }
        }

        self.keyset_page(OP, cursor.as_ref().map(|c| c.id.as_str()), limit, direction)
            .await
    }

    /// Rows past `after` in `direction`, without checking that `after` exists
    async fn keyset_page(
        &self,
        op: &'static str,
        after: Option<&str>,
        limit: i64,
        direction: CursorDirection,
    ) -> DbResult<CursorPage<T>> {
        let mut conditions = Vec::with_capacity(1);
        if let Some(after) = after {
            conditions.push(match direction {
                CursorDirection::Next => FilterCondition::gt(ID_COLUMN, after),
                CursorDirection::Prev => FilterCondition::lt(ID_COLUMN, after),
            });
        }

        let mut builder = self.select();
        builder.push_where(op, &self.schema, &conditions, self.schema.soft_delete)?;
        builder.push(" ORDER BY id ");
        builder.push(direction.order().as_sql());
        builder.push(" LIMIT ");
        // One extra row tells whether another page exists
        builder.push_param(Value::Integer(limit + 1));
        let (sql, params) = builder.finish();

        let mut items = self.fetch_entities(op, &sql, &params).await?;
        let has_more = items.len() as i64 > limit;
        items.truncate(limit as usize);

        let next_cursor = match items.last().and_then(|item| item.id()) {
            Some(last) if has_more => Some(Cursor::new(last, direction).encode()),
            _ => None,
        };
        let prev_cursor = match (after, items.first().and_then(|item| item.id())) {
            (Some(_), Some(first)) => Some(Cursor::new(first, direction.reversed()).encode()),
            _ => None,
        };

        Ok(CursorPage {
            items,
            next_cursor,
            prev_cursor,
        })
    }

    /// Walk pages of `batch_size` rows, handing each page to `per_batch`
    ///
    /// Stops after a page with no successor, once `limit` rows were handed
    /// out (`limit <= 0` means no cap), or when `per_batch` fails; its error
    /// is returned. Returns the number of rows processed.
    ///
    /// Deleting the last row of a batch does not end the walk; the next page
    /// still starts after that identifier.
    pub async fn find_all_in_batches_with_cursor<F, Fut>(
        &self,
        cursor: Option<&str>,
        limit: i64,
        direction: CursorDirection,
        batch_size: usize,
        mut per_batch: F,
    ) -> DbResult<u64>
    where
        F: FnMut(Vec<T>) -> Fut,
        Fut: Future<Output = DbResult<()>>,
    {
        const OP: &str = "find_all_in_batches_with_cursor";
        if batch_size == 0 {
            return Err(self.invalid(OP, "batch_size must be positive"));
        }
        let batch = i64::try_from(batch_size)
            .unwrap_or(i64::MAX)
            .min(self.config.max_limit);

        let mut processed: u64 = 0;
        // Only the caller's cursor is checked for existence. Later pages key
        // off the last row handed out, which a writer may since have removed.
        let mut last: Option<String> = None;
        loop {
            let page_limit = if limit > 0 {
                let remaining = limit.saturating_sub(processed as i64);
                if remaining <= 0 {
                    break;
                }
                batch.min(remaining)
            } else {
                batch
            };

            let page = match &last {
                None => {
                    self.find_all_with_cursor(cursor, page_limit, direction)
                        .await?
                }
                Some(after) => {
                    self.keyset_page(OP, Some(after.as_str()), page_limit, direction)
                        .await?
                }
            };
            if page.items.is_empty() {
                break;
            }

            let has_more = page.next_cursor.is_some();
            last = page.items.last().and_then(|item| item.id()).map(str::to_string);
            processed += page.items.len() as u64;
            per_batch(page.items).await?;

            if !has_more || last.is_none() {
                break;
            }
        }
        Ok(processed)
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Write every data column of an existing entity
    ///
    /// `InvalidArgument` without an identifier, `NotFound` when no row matched.
    pub async fn update(&self, entity: &mut T) -> DbResult<()> {
        const OP: &str = "update";
        let id = match entity.id() {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(self.invalid(OP, "entity has no id")),
        };
        self.check_valid(OP, entity).await?;
        entity
            .audit_mut()
            .mark_updated(now_millis(), self.actor.as_deref());

        let values = self.entity_values(OP, entity)?;
        let mut assignments: Vec<(&str, Value)> = self
            .schema
            .columns
            .iter()
            .map(String::as_str)
            .zip(values)
            .collect();
        let audit = entity.audit();
        assignments.push(("updated_at", Value::Timestamp(audit.updated_at)));
        assignments.push(("updated_by", audit.updated_by.clone().into()));

        let rows = self
            .execute_update(OP, &assignments, &[FilterCondition::eq(ID_COLUMN, id.as_str())])
            .await?;
        if rows == 0 {
            return Err(DatabaseError::not_found(OP, self.schema.table.clone(), id));
        }
        Ok(())
    }

    /// Assign columns of the row with `id`; `NotFound` when no row matched
    pub async fn update_by_id(&self, id: &str, assignments: &[(&str, Value)]) -> DbResult<()> {
        const OP: &str = "update_by_id";
        let assignments = self.stamp_assignments(OP, assignments)?;
        let rows = self
            .execute_update(OP, &assignments, &[FilterCondition::eq(ID_COLUMN, id)])
            .await?;
        if rows == 0 {
            return Err(DatabaseError::not_found(OP, self.schema.table.clone(), id));
        }
        Ok(())
    }

    /// Assign columns of every row matching the conditions
    ///
    /// No conditions means every row. Returns the number of updated rows.
    pub async fn update_by_conditions(
        &self,
        assignments: &[(&str, Value)],
        conditions: &[FilterCondition],
    ) -> DbResult<u64> {
        const OP: &str = "update_by_conditions";
        let assignments = self.stamp_assignments(OP, assignments)?;
        self.execute_update(OP, &assignments, conditions).await
    }

    fn stamp_assignments<'a>(
        &self,
        op: &str,
        assignments: &[(&'a str, Value)],
    ) -> DbResult<Vec<(&'a str, Value)>> {
        if assignments.is_empty() {
            return Err(self.invalid(op, "nothing to update"));
        }
        let mut stamped = Vec::with_capacity(assignments.len() + 2);
        for (name, value) in assignments {
            validate_column(op, &self.schema, name)?;
            if IMMUTABLE_COLUMNS.contains(name) {
                return Err(self
                    .invalid(op, format!("column '{}' cannot be updated", name))
                    .with_field(name.to_string()));
            }
            stamped.push((*name, value.clone()));
        }
        if !assignments.iter().any(|(name, _)| *name == "updated_at") {
            stamped.push(("updated_at", Value::Timestamp(now_millis())));
        }
        if let Some(actor) = &self.actor {
            if !assignments.iter().any(|(name, _)| *name == "updated_by") {
                stamped.push(("updated_by", Value::Text(actor.clone())));
            }
        }
        Ok(stamped)
    }

    async fn execute_update(
        &self,
        op: &'static str,
        assignments: &[(&str, Value)],
        conditions: &[FilterCondition],
    ) -> DbResult<u64> {
        let mut builder = SqlBuilder::new(format!("UPDATE {} SET ", self.schema.table));
        for (index, (name, value)) in assignments.iter().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            builder.push(name).push(" = ").push_param(value.clone());
        }
        builder.push_where(op, &self.schema, conditions, self.schema.soft_delete)?;
        let (sql, params) = builder.finish();

        self.observe(
            op,
            |rows: &u64| *rows,
            self.run(op, || self.handle.execute(op, &sql, &params)),
        )
        .await
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Remove the row with `id`; returns whether a row was removed
    pub async fn delete_by_id(&self, id: &str) -> DbResult<bool> {
        const OP: &str = "delete_by_id";
        let rows = self
            .execute_delete(OP, &[FilterCondition::eq(ID_COLUMN, id)])
            .await?;
        Ok(rows > 0)
    }

    /// Remove every row matching the conditions
    ///
    /// Refuses to run without conditions.
    pub async fn delete_by_conditions(&self, conditions: &[FilterCondition]) -> DbResult<u64> {
        const OP: &str = "delete_by_conditions";
        if conditions.is_empty() {
            return Err(self
                .invalid(OP, "refusing to delete without conditions")
                .with_user_message("A delete needs at least one condition"));
        }
        self.execute_delete(OP, conditions).await
    }

    async fn execute_delete(&self, op: &'static str, conditions: &[FilterCondition]) -> DbResult<u64> {
        let mut builder = SqlBuilder::new(format!("DELETE FROM {}", self.schema.table));
        builder.push_where(op, &self.schema, conditions, false)?;
        let (sql, params) = builder.finish();

        self.observe(
            op,
            |rows: &u64| *rows,
            self.run(op, || self.handle.execute(op, &sql, &params)),
        )
        .await
    }

    /// Mark the row with `id` deleted; returns whether a live row was marked
    pub async fn soft_delete_by_id(&self, id: &str) -> DbResult<bool> {
        const OP: &str = "soft_delete_by_id";
        self.require_soft_delete(OP)?;
        let now = now_millis();
        let assignments = [
            ("deleted_at", Value::Timestamp(now)),
            ("deleted_by", self.actor.clone().into()),
            ("updated_at", Value::Timestamp(now)),
        ];
        let rows = self
            .execute_update(OP, &assignments, &[FilterCondition::eq(ID_COLUMN, id)])
            .await?;
        Ok(rows > 0)
    }

    /// Clear the deletion mark of the row with `id`
    pub async fn restore_by_id(&self, id: &str) -> DbResult<bool> {
        const OP: &str = "restore_by_id";
        self.require_soft_delete(OP)?;

        let mut builder = SqlBuilder::new(format!(
            "UPDATE {} SET deleted_at = NULL, deleted_by = NULL, updated_at = ",
            self.schema.table
        ));
        builder.push_param(Value::Timestamp(now_millis()));
        builder.push_where(
            OP,
            &self.schema,
            &[
                FilterCondition::eq(ID_COLUMN, id),
                FilterCondition::is_not_null("deleted_at"),
            ],
            false,
        )?;
        let (sql, params) = builder.finish();

        let rows = self
            .observe(
                OP,
                |rows: &u64| *rows,
                self.run(OP, || self.handle.execute(OP, &sql, &params)),
            )
            .await?;
        Ok(rows > 0)
    }

    fn require_soft_delete(&self, op: &str) -> DbResult<()> {
        if self.schema.soft_delete {
            Ok(())
        } else {
            Err(self.invalid(op, "soft delete is not enabled for this table"))
        }
    }

    // ------------------------------------------------------------------
    // Upsert
    // ------------------------------------------------------------------

    /// Insert, or update the row that conflicts on `unique_field`
    ///
    /// The identifier of the stored row is written back to the entity.
    pub async fn upsert(&self, entity: &mut T, unique_field: &str) -> DbResult<()> {
        const OP: &str = "upsert";
        if unique_field.trim().is_empty() {
            return Err(self.invalid(OP, "unique field must not be empty"));
        }
        validate_column(OP, &self.schema, unique_field)?;
        self.check_valid(OP, entity).await?;
        self.prepare_insert(entity);

        let (sql, params) = self.render_insert(OP, std::slice::from_ref(&*entity))?;
        let updates: Vec<String> = self
            .schema
            .columns
            .iter()
            .map(String::as_str)
            .chain(["updated_at", "updated_by"])
            .filter(|c| *c != unique_field)
            .map(|c| format!("{c} = excluded.{c}"))
            .collect();
        let sql = format!(
            "{} ON CONFLICT ({}) DO UPDATE SET {} RETURNING id",
            sql,
            unique_field,
            updates.join(", ")
        );

        let row = self
            .observe(
                OP,
                |row: &Option<AnyRow>| u64::from(row.is_some()),
                self.run(OP, || self.handle.fetch_optional(OP, &sql, &params)),
            )
            .await?;
        if let Some(row) = row {
            let id: String = column(&row, ID_COLUMN)?;
            entity.set_id(id);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Count / exists
    // ------------------------------------------------------------------

    pub async fn count_all(&self) -> DbResult<i64> {
        self.count("count_all", &[]).await
    }

    pub async fn count_by_conditions(&self, conditions: &[FilterCondition]) -> DbResult<i64> {
        self.count("count_by_conditions", conditions).await
    }

    async fn count(&self, op: &'static str, conditions: &[FilterCondition]) -> DbResult<i64> {
        let mut builder = SqlBuilder::new(format!("SELECT COUNT(*) AS total FROM {}", self.schema.table));
        builder.push_where(op, &self.schema, conditions, self.schema.soft_delete)?;
        let (sql, params) = builder.finish();

        let row = self
            .observe(
                op,
                |_: &Option<AnyRow>| 1,
                self.run(op, || self.handle.fetch_optional(op, &sql, &params)),
            )
            .await?;
        match row {
            Some(row) => column(&row, "total"),
            None => Ok(0),
        }
    }

    pub async fn exists_by_id(&self, id: &str) -> DbResult<bool> {
        self.exists("exists_by_id", &[FilterCondition::eq(ID_COLUMN, id)], self.schema.soft_delete)
            .await
    }

    pub async fn exists_by_conditions(&self, conditions: &[FilterCondition]) -> DbResult<bool> {
        self.exists("exists_by_conditions", conditions, self.schema.soft_delete)
            .await
    }

    async fn exists(
        &self,
        op: &'static str,
        conditions: &[FilterCondition],
        exclude_deleted: bool,
    ) -> DbResult<bool> {
        let mut builder = SqlBuilder::new(format!("SELECT 1 AS present FROM {}", self.schema.table));
        builder.push_where(op, &self.schema, conditions, exclude_deleted)?;
        builder.push(" LIMIT 1");
        let (sql, params) = builder.finish();

        let row = self
            .observe(
                op,
                |row: &Option<AnyRow>| u64::from(row.is_some()),
                self.run(op, || self.handle.fetch_optional(op, &sql, &params)),
            )
            .await?;
        Ok(row.is_some())
    }

    // ------------------------------------------------------------------
    // Transactions & validation
    // ------------------------------------------------------------------

    /// Run `f` inside a transaction
    ///
    /// `f` receives a repository bound to the transaction. The transaction
    /// commits when `f` returns `Ok` and rolls back when it returns `Err`,
    /// panics, exceeds the transaction timeout or is cancelled. A panic is
    /// returned as an `Unknown` error. Called on a transactional repository,
    /// `f` joins the outer transaction and the outer scope decides.
    pub async fn with_transaction<R, F, Fut>(&self, f: F) -> DbResult<R>
    where
        F: FnOnce(Repository<T>) -> Fut,
        Fut: Future<Output = DbResult<R>>,
    {
        const OP: &str = "with_transaction";
        if self.cancel.is_cancelled() {
            return Err(DatabaseError::cancelled(OP));
        }

        let (tx, owned) = self.guarded(OP, self.handle.begin()).await?;
        let scoped = self.scoped(tx.clone());
        let timeout = self.config.transaction_timeout();

        let work = AssertUnwindSafe(async move { f(scoped).await }).catch_unwind();
        let outcome = tokio::select! {
            biased;

            () = self.cancel.cancelled() => Err(DatabaseError::cancelled(OP)),
            result = tokio::time::timeout(timeout, work) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => Err(DatabaseError::new(
                    ErrorKind::Unknown,
                    OP,
                    format!("transaction closure panicked: {}", panic_message(panic.as_ref())),
                )),
                Err(_) => Err(DatabaseError::timeout(
                    OP,
                    format!("transaction exceeded {:?}", timeout),
                )),
            },
        };

        if let Err(error) = &outcome {
            self.log_failure(OP, error);
        }
        finish_tx(&tx, owned, outcome).await
    }

    /// Run the configured validator; valid when none is configured
    pub async fn validate(&self, entity: &T) -> ValidationResult {
        match &self.validator {
            Some(validator) => validator.validate(entity).await,
            None => ValidationResult::ok(),
        }
    }

    fn scoped(&self, tx: TxHandle) -> Self {
        Self {
            handle: DbHandle::Transaction(tx),
            retry: RetryHandler::new(RetryPolicy::no_retry()),
            ..self.clone()
        }
    }

    // ------------------------------------------------------------------
    // Pipeline
    // ------------------------------------------------------------------

    async fn check_valid(&self, op: &str, entity: &T) -> DbResult<()> {
        if !self.config.enable_validation {
            return Ok(());
        }
        match self.validate(entity).await.into_error(op, &self.schema.table) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn prepare_insert(&self, entity: &mut T) {
        if entity.id().map_or(true, str::is_empty) {
            entity.set_id(self.ids.generate(&self.schema.id_prefix));
        }
        entity
            .audit_mut()
            .mark_created(now_millis(), self.actor.as_deref());
    }

    fn entity_values(&self, op: &str, entity: &T) -> DbResult<Vec<Value>> {
        let values = entity.to_values();
        if values.len() != self.schema.columns.len() {
            return Err(self.invalid(
                op,
                format!(
                    "entity produced {} values for {} columns",
                    values.len(),
                    self.schema.columns.len()
                ),
            ));
        }
        Ok(values)
    }

    fn render_insert(&self, op: &str, entities: &[T]) -> DbResult<(String, Vec<Value>)> {
        let mut builder = SqlBuilder::new(format!(
            "INSERT INTO {} ({}) VALUES ",
            self.schema.table,
            self.schema.select_list()
        ));

        for (index, entity) in entities.iter().enumerate() {
            if index > 0 {
                builder.push(", ");
            }
            let id = entity.id().unwrap_or_default().to_string();
            let row = std::iter::once(Value::Text(id))
                .chain(self.entity_values(op, entity)?)
                .chain(entity.audit().to_values());

            builder.push("(");
            for (position, value) in row.enumerate() {
                if position > 0 {
                    builder.push(", ");
                }
                builder.push_param(value);
            }
            builder.push(")");
        }
        Ok(builder.finish())
    }

    fn select(&self) -> SqlBuilder {
        SqlBuilder::new(format!(
            "SELECT {} FROM {}",
            self.schema.select_list(),
            self.schema.table
        ))
    }

    async fn fetch_entities(&self, op: &'static str, sql: &str, params: &[Value]) -> DbResult<Vec<T>> {
        let rows = self
            .observe(
                op,
                |rows: &Vec<AnyRow>| rows.len() as u64,
                self.run(op, || self.handle.fetch_all(op, sql, params)),
            )
            .await?;
        rows.iter().map(T::from_row).collect()
    }

    /// Apply the query timeout and the cancellation token to one attempt
    async fn guarded<R>(&self, op: &str, fut: impl Future<Output = DbResult<R>>) -> DbResult<R> {
        let timeout = self.config.query_timeout();
        tokio::select! {
            biased;

            () = self.cancel.cancelled() => Err(DatabaseError::cancelled(op)),
            result = tokio::time::timeout(timeout, fut) => match result {
                Ok(result) => result,
                Err(_) => Err(DatabaseError::timeout(op, format!("query exceeded {:?}", timeout))),
            },
        }
    }

    /// Guarded attempts under the retry policy
    async fn run<R, F, Fut>(&self, op: &'static str, mut f: F) -> DbResult<R>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = DbResult<R>>,
    {
        self.retry
            .retry_with_cancellation(&self.cancel, op, || self.guarded(op, f()))
            .await
    }

    /// Await `fut`, then report metrics and log a failure
    async fn observe<R>(
        &self,
        op: &'static str,
        rows: impl Fn(&R) -> u64,
        fut: impl Future<Output = DbResult<R>>,
    ) -> DbResult<R> {
        let started = Instant::now();
        let result = fut.await.map_err(|error| match error.table {
            Some(_) => error,
            None => error.with_table(self.schema.table.clone()),
        });
        self.record(op, started.elapsed(), &result, rows);
        result
    }

    fn record<R>(&self, op: &str, elapsed: Duration, result: &DbResult<R>, rows: impl Fn(&R) -> u64) {
        match result {
            Ok(value) => {
                if self.config.enable_metrics {
                    let rows = rows(value);
                    report("query", || {
                        self.metrics
                            .record_query_metrics(op, &self.schema.table, elapsed, true, rows)
                    });
                }
            }
            Err(error) => {
                self.log_failure(op, error);
                if self.config.enable_metrics {
                    report("query", || {
                        self.metrics
                            .record_query_metrics(op, &self.schema.table, elapsed, false, 0)
                    });
                    report("error", || self.metrics.record_error_metrics(op, error.kind));
                }
            }
        }
    }

    fn log_failure(&self, op: &str, error: &DatabaseError) {
        let table = self.schema.table.as_str();
        match error.severity() {
            Severity::Low => {
                tracing::debug!(operation = op, table, kind = %error.kind, error = %error, "repository operation failed")
            }
            Severity::Medium | Severity::High => {
                tracing::warn!(operation = op, table, kind = %error.kind, error = %error, "repository operation failed")
            }
            Severity::Critical => {
                tracing::error!(operation = op, table, kind = %error.kind, error = %error, "repository operation failed")
            }
        }
    }

    fn invalid(&self, op: &str, message: impl Into<String>) -> DatabaseError {
        DatabaseError::invalid_argument(op, message).with_table(self.schema.table.clone())
    }
}

/// Commit or roll back an owned transaction according to `outcome`
async fn finish_tx<R>(tx: &TxHandle, owned: bool, outcome: DbResult<R>) -> DbResult<R> {
    if !owned {
        return outcome;
    }
    match outcome {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(error) => {
            if let Err(rollback) = tx.rollback().await {
                tracing::warn!(error = %rollback, "rollback failed");
            }
            Err(error)
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
