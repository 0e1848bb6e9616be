//! Lazy, reusable query results.
//!
//! A [`ResultSet`] holds a query description and runs it each time a
//! terminal method is called. Builders consume and return the set, so a
//! set can be cloned, refined and reused:
//!
//! ```ignore
//! let adults = store.find::<Person>(Some(column_of::<Person>("age")?.ge(18)))?;
//! let count = adults.count(&mut store, None, false)?;
//! let oldest = adults.clone().order_by([column_of::<Person>("age")?.desc()])?.first(&mut store)?;
//! ```
//!
//! Rows are loaded through the store's identity map, so an object found
//! twice is the same [`Handle`].

use std::sync::Arc;

use tessera_core::{
    Alias, Column, Delete, Error, Expr, QueryResult, Result, Row, Select, SetExpr, SetOp,
    StoreErrorKind, SuffixOp, Update, Value, Variable,
};

use crate::info::{ClassInfo, Mapped};
use crate::object::Handle;
use crate::store::Store;

fn feature(message: impl Into<String>) -> Error {
    Error::store(StoreErrorKind::Feature, message)
}

// ============================================================================
// Find specs
// ============================================================================

/// One element of what a find returns.
#[derive(Debug, Clone)]
pub enum SpecItem {
    /// Whole objects of a mapped class.
    Class(Arc<ClassInfo>),
    /// A column or any other expression, returned as a value.
    Expr(Expr),
}

impl SpecItem {
    pub fn class<T: Mapped>() -> Result<Self> {
        Ok(SpecItem::Class(ClassInfo::of::<T>()?))
    }

    pub fn expr(expr: impl Into<Expr>) -> Self {
        SpecItem::Expr(expr.into())
    }

    fn is_compatible(&self, other: &SpecItem) -> bool {
        match (self, other) {
            (SpecItem::Class(a), SpecItem::Class(b)) => Arc::ptr_eq(a, b),
            (SpecItem::Expr(_), SpecItem::Expr(_)) => true,
            _ => false,
        }
    }
}

/// What a find selects: one item, or a tuple of items.
#[derive(Debug, Clone)]
pub struct FindSpec {
    items: Vec<SpecItem>,
    is_tuple: bool,
}

impl FindSpec {
    /// Objects of `T`.
    pub fn of<T: Mapped>() -> Result<Self> {
        Ok(Self::single(SpecItem::class::<T>()?))
    }

    pub fn single(item: SpecItem) -> Self {
        Self {
            items: vec![item],
            is_tuple: false,
        }
    }

    pub fn tuple(items: Vec<SpecItem>) -> Self {
        Self {
            items,
            is_tuple: true,
        }
    }

    pub fn items(&self) -> &[SpecItem] {
        &self.items
    }

    pub fn is_tuple(&self) -> bool {
        self.is_tuple
    }

    /// The class of a single-class find.
    pub fn default_cls_info(&self) -> Option<&Arc<ClassInfo>> {
        match (self.is_tuple, self.items.as_slice()) {
            (false, [SpecItem::Class(info)]) => Some(info),
            _ => None,
        }
    }

    fn default_order(&self) -> Vec<Expr> {
        self.default_cls_info()
            .map(|info| info.default_order().to_vec())
            .unwrap_or_default()
    }

    /// Selected columns and the tables they come from.
    fn columns_and_tables(&self) -> (Vec<Expr>, Vec<Expr>) {
        let mut columns = Vec::new();
        let mut tables = Vec::new();
        for item in &self.items {
            match item {
                SpecItem::Class(info) => {
                    columns.extend(info.columns().iter().cloned().map(Expr::Column));
                    tables.push(info.table().clone());
                }
                SpecItem::Expr(expr) => {
                    if let Some(table) = expr.as_column().and_then(Column::table) {
                        tables.push(table.clone());
                    }
                    columns.push(expr.clone());
                }
            }
        }
        (columns, tables)
    }

    fn is_compatible(&self, other: &FindSpec) -> bool {
        self.is_tuple == other.is_tuple
            && self.items.len() == other.items.len()
            && self
                .items
                .iter()
                .zip(&other.items)
                .all(|(a, b)| a.is_compatible(b))
    }

    fn load(&self, store: &mut Store, row: Row) -> Result<Found> {
        let mut values = row.into_values().into_iter();
        let mut found = Vec::with_capacity(self.items.len());
        for item in &self.items {
            match item {
                SpecItem::Class(info) => {
                    let row = Row::from_values(values.by_ref().take(info.columns().len()).collect());
                    found.push(Found::Object(store.load_object(info, row)?));
                }
                SpecItem::Expr(expr) => {
                    let value = values.next().unwrap_or(Value::Null);
                    found.push(Found::Value(typed_value(expr.as_column(), value)?));
                }
            }
        }
        if self.is_tuple {
            return Ok(Found::Tuple(found));
        }
        Ok(found.pop().unwrap_or(Found::Value(Value::Null)))
    }

    /// Conditions identifying `item` among the rows of this spec.
    fn columns_and_values(&self, store: &Store, item: &Found) -> Result<Option<(Vec<Expr>, Vec<Expr>)>> {
        let parts: Vec<&Found> = match (self.is_tuple, item) {
            (true, Found::Tuple(parts)) if parts.len() == self.items.len() => parts.iter().collect(),
            (false, item) => vec![item],
            _ => return Err(feature("Item does not match the shape of the find")),
        };
        let mut columns = Vec::new();
        let mut values = Vec::new();
        for (spec, part) in self.items.iter().zip(parts) {
            match (spec, part) {
                (SpecItem::Class(info), Found::Object(Some(handle))) => {
                    let obj = store.info(*handle)?;
                    if !Arc::ptr_eq(obj.cls_info(), info) {
                        return Err(feature(format!(
                            "Expected {}, found {}",
                            info.name(),
                            obj.cls_info().name()
                        )));
                    }
                    let Some(primary_vars) = obj.cached_primary_vars() else {
                        return Ok(None);
                    };
                    columns.extend(info.primary_key().iter().cloned().map(Expr::Column));
                    values.extend(primary_vars.iter().cloned().map(Expr::Param));
                }
                (SpecItem::Class(_), Found::Object(None)) => return Ok(None),
                (SpecItem::Expr(expr), Found::Value(value)) => {
                    columns.push(expr.clone());
                    values.push(Expr::param(value.clone()));
                }
                _ => return Err(feature("Item does not match the shape of the find")),
            }
        }
        Ok(Some((columns, values)))
    }
}

/// Convert a fetched value to the host form of its column.
fn typed_value(column: Option<&Column>, value: Value) -> Result<Value> {
    let Some(column) = column else {
        return Ok(value);
    };
    if value.is_null() {
        return Ok(value);
    }
    let mut variable = Variable::new(column.factory().kind().clone());
    variable.set(value, true)?;
    Ok(variable.get(false)?.unwrap_or(Value::Null))
}

fn is_truthy(value: &Value) -> bool {
    value
        .as_bool()
        .or_else(|| value.as_i64().map(|n| n != 0))
        .unwrap_or(false)
}

fn first_value(mut result: QueryResult) -> Value {
    result
        .get_one()
        .and_then(|row| row.into_values().into_iter().next())
        .unwrap_or(Value::Null)
}

/// One loaded result.
#[derive(Debug, Clone, PartialEq)]
pub enum Found {
    /// A mapped object. `None` for an all-NULL row of an outer join.
    Object(Option<Handle>),
    Value(Value),
    Tuple(Vec<Found>),
}

impl Found {
    pub fn handle(&self) -> Option<Handle> {
        match self {
            Found::Object(handle) => *handle,
            _ => None,
        }
    }

    pub fn value(&self) -> Option<&Value> {
        match self {
            Found::Value(value) => Some(value),
            _ => None,
        }
    }

    pub fn into_tuple(self) -> Vec<Found> {
        match self {
            Found::Tuple(parts) => parts,
            other => vec![other],
        }
    }
}

impl From<Handle> for Found {
    fn from(handle: Handle) -> Self {
        Found::Object(Some(handle))
    }
}

impl From<Value> for Found {
    fn from(value: Value) -> Self {
        Found::Value(value)
    }
}

/// Swap the selected columns of a query, keeping its shape.
pub fn replace_columns(expr: Expr, columns: Vec<Expr>) -> Result<Expr> {
    match expr {
        Expr::Select(mut select) => {
            select.columns = columns;
            // Ordering can't change which rows come back without a slice.
            if select.limit.is_none() && select.offset.is_none() {
                select.order_by.clear();
            }
            Ok(Expr::Select(select))
        }
        Expr::SetExpr(set) => {
            if !set.order_by.is_empty() && (set.limit.is_some() || set.offset.is_some()) {
                return Err(feature(
                    "Can't replace the columns of a set expression combining ORDER BY with LIMIT/OFFSET",
                ));
            }
            let exprs = set
                .exprs
                .into_iter()
                .map(|e| replace_columns(e, columns.clone()))
                .collect::<Result<Vec<_>>>()?;
            let mut replaced = SetExpr::new(set.op, exprs, set.all);
            replaced.limit = set.limit;
            replaced.offset = set.offset;
            Ok(Expr::SetExpr(Box::new(replaced)))
        }
        other => Err(feature(format!("Don't know how to replace columns for {other:?}"))),
    }
}

// ============================================================================
// ResultSet
// ============================================================================

/// A lazily evaluated find.
#[derive(Debug, Clone)]
pub struct ResultSet {
    find_spec: FindSpec,
    where_clause: Option<Expr>,
    tables: Option<Vec<Expr>>,
    set_expr: Option<SetExpr>,
    /// Empty means unordered.
    order_by: Vec<Expr>,
    offset: Option<u64>,
    limit: Option<u64>,
    distinct: bool,
    group_by: Vec<Expr>,
    having: Option<Expr>,
}

impl ResultSet {
    pub(crate) fn new(find_spec: FindSpec, where_clause: Option<Expr>, tables: Option<Vec<Expr>>) -> Self {
        Self {
            order_by: find_spec.default_order(),
            find_spec,
            where_clause,
            tables,
            set_expr: None,
            offset: None,
            limit: None,
            distinct: false,
            group_by: Vec::new(),
            having: None,
        }
    }

    pub fn find_spec(&self) -> &FindSpec {
        &self.find_spec
    }

    pub fn where_clause(&self) -> Option<&Expr> {
        self.where_clause.as_ref()
    }

    fn is_sliced(&self) -> bool {
        self.offset.is_some() || self.limit.is_some()
    }

    /// The statement this set runs, with ordering and slice overridden.
    fn query(&self, order_by: Vec<Expr>, offset: Option<u64>, limit: Option<u64>) -> Expr {
        if let Some(set) = &self.set_expr {
            let mut set = set.clone();
            set.order_by = order_by;
            set.offset = offset;
            set.limit = limit;
            return Expr::SetExpr(Box::new(set));
        }
        let (columns, default_tables) = self.find_spec.columns_and_tables();
        Expr::Select(Box::new(Select {
            columns,
            where_clause: self.where_clause.clone(),
            tables: self.tables.clone(),
            default_tables: Some(default_tables),
            order_by,
            group_by: self.group_by.clone(),
            having: self.having.clone(),
            limit,
            offset,
            distinct: self.distinct,
        }))
    }

    /// The statement as configured.
    pub fn statement(&self) -> Expr {
        self.query(self.order_by.clone(), self.offset, self.limit)
    }

    fn load_first(&self, store: &mut Store, statement: Expr) -> Result<Option<Found>> {
        let mut result = store.run(statement)?;
        match result.get_one() {
            Some(row) => Ok(Some(self.find_spec.load(store, row)?)),
            None => Ok(None),
        }
    }

    // ========================================================================
    // Reading
    // ========================================================================

    pub fn all(&self, store: &mut Store) -> Result<Vec<Found>> {
        let mut result = store.run(self.statement())?;
        let rows = result.get_all();
        tracing::trace!(rows = rows.len(), "Loading result rows");
        rows.into_iter()
            .map(|row| self.find_spec.load(store, row))
            .collect()
    }

    /// Every result as a tuple; single-item finds yield one-element tuples.
    pub fn all_tuples(&self, store: &mut Store) -> Result<Vec<Vec<Found>>> {
        Ok(self.all(store)?.into_iter().map(Found::into_tuple).collect())
    }

    /// Objects of a single-class find, skipping NULL rows.
    pub fn handles(&self, store: &mut Store) -> Result<Vec<Handle>> {
        Ok(self.all(store)?.iter().filter_map(Found::handle).collect())
    }

    /// Any one result, ignoring the ordering.
    pub fn any(&self, store: &mut Store) -> Result<Option<Found>> {
        self.load_first(store, self.query(Vec::new(), self.offset, Some(1)))
    }

    pub fn first(&self, store: &mut Store) -> Result<Option<Found>> {
        if self.order_by.is_empty() {
            return Err(Error::store(
                StoreErrorKind::Unordered,
                "Can't use first() on unordered result set",
            ));
        }
        self.load_first(store, self.query(self.order_by.clone(), self.offset, Some(1)))
    }

    pub fn last(&self, store: &mut Store) -> Result<Option<Found>> {
        if self.order_by.is_empty() {
            return Err(Error::store(
                StoreErrorKind::Unordered,
                "Can't use last() on unordered result set",
            ));
        }
        if self.limit.is_some() {
            return Err(feature("Can't use last() with a slice of defined stop index"));
        }
        let reversed = self
            .order_by
            .iter()
            .map(|expr| match expr {
                Expr::Suffix {
                    op: SuffixOp::Desc,
                    expr,
                } => (**expr).clone(),
                Expr::Suffix {
                    op: SuffixOp::Asc,
                    expr,
                } => (**expr).clone().desc(),
                other => other.clone().desc(),
            })
            .collect();
        self.load_first(store, self.query(reversed, None, Some(1)))
    }

    /// The only result, or `None`. More than one row is a `NotOne` error.
    pub fn one(&self, store: &mut Store) -> Result<Option<Found>> {
        let limit = self.limit.map_or(2, |limit| limit.min(2));
        let mut result = store.run(self.query(self.order_by.clone(), self.offset, Some(limit)))?;
        let first = result.get_one();
        if result.get_one().is_some() {
            return Err(Error::store(
                StoreErrorKind::NotOne,
                "one() used with more than one result available",
            ));
        }
        match first {
            Some(row) => Ok(Some(self.find_spec.load(store, row)?)),
            None => Ok(None),
        }
    }

    /// The result at `index`, or `None` past the end.
    pub fn nth(&self, store: &mut Store, index: u64) -> Result<Option<Found>> {
        if index == 0 {
            return self.load_first(store, self.query(self.order_by.clone(), self.offset, Some(1)));
        }
        let offset = self.offset.unwrap_or(0) + index;
        if self.limit.is_some_and(|limit| index >= limit) {
            return Ok(None);
        }
        self.load_first(store, self.query(self.order_by.clone(), Some(offset), Some(1)))
    }

    pub fn is_empty(&self, store: &mut Store) -> Result<bool> {
        let subquery = self.query(Vec::new(), self.offset, Some(1));
        let result = store.run(Select::new([Expr::exists(subquery)]).into())?;
        Ok(!is_truthy(&first_value(result)))
    }

    /// Whether `item` is among the results. Objects are matched by the
    /// identity they were last flushed or loaded with.
    pub fn contains(&self, store: &mut Store, item: &Found) -> Result<bool> {
        let Some((columns, values)) = self.find_spec.columns_and_values(store, item)? else {
            return Ok(false);
        };
        let select = if self.set_expr.is_none() && self.group_by.is_empty() {
            let (_, default_tables) = self.find_spec.columns_and_tables();
            let mut conditions: Vec<Expr> = columns
                .into_iter()
                .zip(values)
                .map(|(column, value)| column.eq(value))
                .collect();
            conditions.extend(self.where_clause.clone());
            let mut select = Select::new([Expr::raw("1")]).default_tables(default_tables);
            if let Some(tables) = &self.tables {
                select = select.tables(tables.clone());
            }
            if let Some(condition) = Expr::and_all(conditions) {
                select = select.filter(condition);
            }
            select
        } else {
            let aliases: Vec<Alias> = columns
                .into_iter()
                .enumerate()
                .map(|(index, column)| Alias::new(column, format!("_key{index}")))
                .collect();
            let subquery = replace_columns(
                self.statement(),
                aliases.iter().cloned().map(Expr::Alias).collect(),
            )?;
            let conditions = aliases
                .into_iter()
                .zip(values)
                .map(|(alias, value)| Expr::Alias(alias).eq(value));
            let mut select = Select::new([Expr::raw("1")]).tables([Alias::new(subquery, "_tmp")]);
            if let Some(condition) = Expr::and_all(conditions) {
                select = select.filter(condition);
            }
            select
        };
        let mut result = store.run(select.into())?;
        Ok(result.get_one().is_some())
    }

    /// Values of the given columns, one vector per row.
    pub fn values(&self, store: &mut Store, columns: &[Column]) -> Result<Vec<Vec<Value>>> {
        if columns.is_empty() {
            return Err(feature("values() takes at least one column as argument"));
        }
        if !self.group_by.is_empty() {
            return Err(feature("values() isn't supported after a GROUP BY clause"));
        }
        let statement = replace_columns(
            self.statement(),
            columns.iter().cloned().map(Expr::Column).collect(),
        )?;
        let mut result = store.run(statement)?;
        result
            .get_all()
            .into_iter()
            .map(|row| {
                columns
                    .iter()
                    .zip(row.into_values())
                    .map(|(column, value)| typed_value(Some(column), value))
                    .collect()
            })
            .collect()
    }

    // ========================================================================
    // Aggregates
    // ========================================================================

    fn aggregate(
        &self,
        store: &mut Store,
        expr: Option<Expr>,
        make: impl Fn(Option<Expr>) -> Expr,
    ) -> Result<Value> {
        let column = expr.as_ref().and_then(Expr::as_column).cloned();
        let result = store.run(self.aggregate_statement(expr, make)?.into())?;
        typed_value(column.as_ref(), first_value(result))
    }

    /// Number of rows, or of non-NULL (optionally distinct) values of `expr`.
    pub fn count(&self, store: &mut Store, expr: Option<Expr>, distinct: bool) -> Result<i64> {
        let value = self.aggregate(store, expr, |expr| Expr::Count {
            expr: expr.map(Box::new),
            distinct,
        })?;
        Ok(value.as_i64().unwrap_or(0))
    }

    pub fn max(&self, store: &mut Store, expr: impl Into<Expr>) -> Result<Value> {
        self.aggregate(store, Some(expr.into()), |e| e.unwrap_or(Expr::Null).max())
    }

    pub fn min(&self, store: &mut Store, expr: impl Into<Expr>) -> Result<Value> {
        self.aggregate(store, Some(expr.into()), |e| e.unwrap_or(Expr::Null).min())
    }

    pub fn sum(&self, store: &mut Store, expr: impl Into<Expr>) -> Result<Value> {
        self.aggregate(store, Some(expr.into()), |e| e.unwrap_or(Expr::Null).sum())
    }

    /// Average as a float. `None` when there are no rows.
    pub fn avg(&self, store: &mut Store, expr: impl Into<Expr>) -> Result<Option<f64>> {
        let expr = expr.into();
        let result = store.run(
            self.aggregate_statement(Some(expr), |e| e.unwrap_or(Expr::Null).avg())?
                .into(),
        )?;
        let value = first_value(result);
        if value.is_null() {
            return Ok(None);
        }
        Ok(value.to_f64_lossy().ok())
    }

    /// A single aggregate over the set. Sliced, distinct and combined sets
    /// are wrapped as a subquery.
    fn aggregate_statement(
        &self,
        expr: Option<Expr>,
        make: impl Fn(Option<Expr>) -> Expr,
    ) -> Result<Select> {
        if !self.group_by.is_empty() {
            return Err(feature("Single aggregates aren't supported after a GROUP BY clause"));
        }
        let (mut columns, default_tables) = self.find_spec.columns_and_tables();
        if self.set_expr.is_none() && !self.distinct && !self.is_sliced() {
            let mut select = Select::new([make(expr)]).default_tables(default_tables);
            if let Some(tables) = &self.tables {
                select = select.tables(tables.clone());
            }
            if let Some(condition) = &self.where_clause {
                select = select.filter(condition.clone());
            }
            return Ok(select);
        }
        let aggregate = match expr {
            None => make(None),
            Some(expr) => {
                let alias = Alias::new(expr, "_expr");
                columns.push(Expr::Alias(alias.clone()));
                make(Some(Expr::Alias(alias)))
            }
        };
        let subquery = replace_columns(self.statement(), columns)?;
        Ok(Select::new([aggregate]).tables([Alias::new(subquery, "_tmp")]))
    }

    // ========================================================================
    // Refining
    // ========================================================================

    /// Narrow the set with an extra condition.
    pub fn find(&self, condition: Option<Expr>) -> Result<ResultSet> {
        if self.set_expr.is_some() {
            return Err(feature("Can't query set expressions"));
        }
        if self.is_sliced() {
            return Err(feature("Can't query a sliced result set"));
        }
        if !self.group_by.is_empty() {
            return Err(feature("Can't query grouped result sets"));
        }
        let mut refined = self.clone();
        if let Some(condition) = condition {
            refined.where_clause = Some(match refined.where_clause.take() {
                Some(existing) => existing.and(condition),
                None => condition,
            });
        }
        Ok(refined)
    }

    /// Replace the ordering. An empty list makes the set unordered.
    pub fn order_by<I, T>(mut self, order: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        if self.is_sliced() {
            return Err(feature("Can't reorder a sliced result set"));
        }
        self.order_by = order.into_iter().map(Into::into).collect();
        Ok(self)
    }

    /// Set any of DISTINCT, OFFSET and LIMIT. `None` keeps the current
    /// setting.
    #[must_use]
    pub fn config(mut self, distinct: Option<bool>, offset: Option<u64>, limit: Option<u64>) -> Self {
        if let Some(distinct) = distinct {
            self.distinct = distinct;
        }
        if offset.is_some() {
            self.offset = offset;
        }
        if limit.is_some() {
            self.limit = limit;
        }
        self
    }

    /// Restrict to `start..stop`, relative to any slice already applied.
    #[must_use]
    pub fn slice(mut self, start: Option<u64>, stop: Option<u64>) -> Self {
        let mut offset = self.offset;
        let mut limit = self.limit;
        if let Some(start) = start {
            offset = Some(offset.unwrap_or(0) + start);
            limit = limit.map(|limit| limit.saturating_sub(start));
        }
        if let Some(stop) = stop {
            let new_limit = stop.saturating_sub(start.unwrap_or(0));
            if limit.is_none_or(|limit| limit > new_limit) {
                limit = Some(new_limit);
            }
        }
        self.offset = offset;
        self.limit = limit;
        self
    }

    pub fn group_by<I, T>(mut self, group: I) -> Result<Self>
    where
        I: IntoIterator<Item = T>,
        T: Into<Expr>,
    {
        if self.set_expr.is_some() {
            return Err(feature("Grouping isn't supported after set operations"));
        }
        self.group_by = group.into_iter().map(Into::into).collect();
        Ok(self)
    }

    pub fn having(mut self, condition: impl Into<Expr>) -> Result<Self> {
        if self.group_by.is_empty() {
            return Err(feature("having can only be called after group_by"));
        }
        self.having = Some(condition.into());
        Ok(self)
    }

    // ========================================================================
    // Bulk writes
    // ========================================================================

    fn bulk_target(&self, verb: &str) -> Result<Arc<ClassInfo>> {
        if self.set_expr.is_some() {
            return Err(feature(format!(
                "{verb} isn't supported after a union, difference, or intersection"
            )));
        }
        if !self.group_by.is_empty() {
            return Err(feature(format!("{verb} isn't supported with GROUP BY")));
        }
        self.find_spec
            .default_cls_info()
            .cloned()
            .ok_or_else(|| feature(format!("{verb} isn't supported with tuple or expression finds")))
    }

    /// Delete every matching row with one statement. Returns the row count
    /// reported by the driver.
    ///
    /// Live objects of the class are invalidated, so a deleted one fails
    /// revalidation instead of serving stale values.
    pub fn remove(&self, store: &mut Store) -> Result<u64> {
        if self.is_sliced() {
            return Err(feature("Can't remove a sliced result set"));
        }
        let cls_info = self.bulk_target("Removing")?;
        let mut delete = Delete::new().table(cls_info.table().clone());
        if let Some(condition) = &self.where_clause {
            delete = delete.filter(condition.clone());
        }
        let result = store.run(delete.into())?;
        for handle in store.alive_of(cls_info.type_id()) {
            store.invalidate(Some(handle))?;
        }
        let removed = result.rowcount().unwrap_or(0);
        tracing::debug!(class = cls_info.name(), removed, "Bulk remove");
        Ok(removed)
    }

    /// Update every matching row with one statement.
    ///
    /// The changed columns of live objects of the class are marked for
    /// reload. Live objects whose key columns changed are invalidated.
    pub fn set(&self, store: &mut Store, changes: Vec<(Column, Expr)>) -> Result<()> {
        let cls_info = self.bulk_target("Setting")?;
        if changes.is_empty() {
            return Ok(());
        }
        let mut indices = Vec::with_capacity(changes.len());
        for (column, _) in &changes {
            let index = cls_info.index_of_column(column).ok_or_else(|| {
                feature(format!("Unsupported set expression: {column:?} is not a column of {}", cls_info.name()))
            })?;
            indices.push(index);
        }
        let mut update = Update::new(changes).table(cls_info.table().clone());
        if let Some(condition) = &self.where_clause {
            update = update.filter(condition.clone());
        }
        store.execute(update)?;

        let key_changed = indices.iter().any(|&i| cls_info.is_primary_index(i));
        for handle in store.alive_of(cls_info.type_id()) {
            for &index in &indices {
                if !cls_info.is_primary_index(index) {
                    store.set_lazy_at(handle, index, tessera_core::LazyValue::AutoReload)?;
                }
            }
            if key_changed {
                store.invalidate(Some(handle))?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Set operations
    // ========================================================================

    fn set_operation(&self, op: SetOp, other: &ResultSet, all: bool) -> Result<ResultSet> {
        if !self.find_spec.is_compatible(&other.find_spec) {
            return Err(feature("Incompatible results for set operation"));
        }
        let operand = |set: &ResultSet| {
            let order = if set.is_sliced() { set.order_by.clone() } else { Vec::new() };
            set.query(order, set.offset, set.limit)
        };
        let expr = SetExpr::new(op, [operand(self), operand(other)], all);
        let mut combined = ResultSet::new(self.find_spec.clone(), None, None);
        combined.set_expr = Some(expr);
        Ok(combined)
    }

    pub fn union(&self, other: &ResultSet, all: bool) -> Result<ResultSet> {
        self.set_operation(SetOp::Union, other, all)
    }

    pub fn difference(&self, other: &ResultSet, all: bool) -> Result<ResultSet> {
        self.set_operation(SetOp::Except, other, all)
    }

    pub fn intersection(&self, other: &ResultSet, all: bool) -> Result<ResultSet> {
        self.set_operation(SetOp::Intersect, other, all)
    }
}
