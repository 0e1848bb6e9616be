//! Class mapping metadata.
//!
//! A mapped type describes itself once through [`Mapped::class_spec`]. The
//! spec is validated into a [`ClassInfo`] the first time the type is used
//! and memoized in a process-wide registry keyed by [`TypeId`].

use std::any::{TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use tessera_core::{
    Column, Error, Expr, MappingErrorKind, Result, Validator, Value, VariableFactory,
    VariableKind,
};

use crate::object::Handle;
use crate::store::Store;

/// A type whose instances the store can persist.
///
/// ```ignore
/// struct Person;
///
/// impl Mapped for Person {
///     fn class_spec() -> ClassSpec {
///         ClassSpec::new("person")
///             .column("id", ColumnSpec::int().primary())
///             .column("name", ColumnSpec::text())
///             .column("age", ColumnSpec::int())
///             .order_by(["-age"])
///     }
/// }
/// ```
pub trait Mapped: 'static {
    fn class_spec() -> ClassSpec;
}

// ============================================================================
// Specs
// ============================================================================

/// One mapped column as declared by the application.
#[derive(Debug, Clone)]
pub struct ColumnSpec {
    name: Option<String>,
    primary: u32,
    factory: VariableFactory,
}

impl ColumnSpec {
    pub fn new(kind: VariableKind) -> Self {
        Self::with_factory(VariableFactory::new(kind))
    }

    pub fn with_factory(factory: VariableFactory) -> Self {
        Self {
            name: None,
            primary: 0,
            factory,
        }
    }

    pub fn any() -> Self {
        Self::new(VariableKind::Any)
    }

    pub fn int() -> Self {
        Self::new(VariableKind::Int)
    }

    pub fn text() -> Self {
        Self::new(VariableKind::Unicode)
    }

    /// Database column name, when it differs from the attribute.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sole or first primary-key column.
    #[must_use]
    pub fn primary(self) -> Self {
        self.primary_at(1)
    }

    /// Position in a composite primary key, 1-based.
    #[must_use]
    pub fn primary_at(mut self, position: u32) -> Self {
        self.primary = position;
        self
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.factory = self.factory.not_null();
        self
    }

    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.factory = self.factory.default(value);
        self
    }

    #[must_use]
    pub fn default_factory(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.factory = self.factory.default_factory(f);
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.factory = self.factory.validator(validator);
        self
    }
}

/// Callback run by the store at a point in an object's life.
pub type ClassHook = Arc<dyn Fn(&mut Store, Handle) -> Result<()> + Send + Sync>;

/// Per-class lifecycle hooks.
#[derive(Clone, Default)]
pub struct ClassHooks {
    /// Before the object is flushed, once per flush.
    pub pre_flush: Option<ClassHook>,
    /// After each INSERT, UPDATE or DELETE of the object.
    pub flushed: Option<ClassHook>,
    /// After the object was built from a fetched row.
    pub loaded: Option<ClassHook>,
    /// After the object was invalidated.
    pub invalidated: Option<ClassHook>,
}

impl ClassHooks {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn on_pre_flush(
        mut self,
        hook: impl Fn(&mut Store, Handle) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.pre_flush = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_flushed(
        mut self,
        hook: impl Fn(&mut Store, Handle) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.flushed = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_loaded(
        mut self,
        hook: impl Fn(&mut Store, Handle) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.loaded = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn on_invalidated(
        mut self,
        hook: impl Fn(&mut Store, Handle) -> Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.invalidated = Some(Arc::new(hook));
        self
    }
}

impl fmt::Debug for ClassHooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassHooks")
            .field("pre_flush", &self.pre_flush.is_some())
            .field("flushed", &self.flushed.is_some())
            .field("loaded", &self.loaded.is_some())
            .field("invalidated", &self.invalidated.is_some())
            .finish()
    }
}

/// Everything needed to map a type onto a table.
#[derive(Debug, Clone, Default)]
pub struct ClassSpec {
    table: Option<String>,
    columns: Vec<(String, ColumnSpec)>,
    primary: Option<Vec<String>>,
    order: Vec<String>,
    hooks: ClassHooks,
}

impl ClassSpec {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: Some(table.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn column(mut self, attribute: impl Into<String>, spec: ColumnSpec) -> Self {
        self.columns.push((attribute.into(), spec));
        self
    }

    /// Name the primary-key attributes explicitly, overriding the column
    /// positions.
    #[must_use]
    pub fn primary_key<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.primary = Some(attributes.into_iter().map(Into::into).collect());
        self
    }

    /// Default ordering of finds. A leading `-` sorts descending.
    #[must_use]
    pub fn order_by<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.order = attributes.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn hooks(mut self, hooks: ClassHooks) -> Self {
        self.hooks = hooks;
        self
    }
}

// ============================================================================
// ClassInfo
// ============================================================================

fn class_info_error(message: String) -> Error {
    Error::mapping(MappingErrorKind::ClassInfo, message)
}

/// Validated mapping of one type.
///
/// Columns are sorted by attribute name; every per-object variable list
/// follows this order.
pub struct ClassInfo {
    type_id: TypeId,
    name: &'static str,
    table: Expr,
    attributes: Vec<String>,
    columns: Vec<Column>,
    index: HashMap<String, usize>,
    primary_key: Vec<Column>,
    primary_key_pos: Vec<usize>,
    default_order: Vec<Expr>,
    hooks: ClassHooks,
}

fn registry() -> &'static RwLock<HashMap<TypeId, Arc<ClassInfo>>> {
    static REGISTRY: OnceLock<RwLock<HashMap<TypeId, Arc<ClassInfo>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

impl ClassInfo {
    /// The memoized mapping of `T`, built on first use.
    pub fn of<T: Mapped>() -> Result<Arc<ClassInfo>> {
        let type_id = TypeId::of::<T>();
        if let Some(info) = registry()
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&type_id)
        {
            return Ok(Arc::clone(info));
        }
        let mut guard = registry().write().unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = guard.get(&type_id) {
            return Ok(Arc::clone(info));
        }
        let info = Arc::new(Self::from_spec(type_id, type_name::<T>(), T::class_spec())?);
        tracing::debug!(class = info.name, table = ?info.table, "registered class mapping");
        guard.insert(type_id, Arc::clone(&info));
        Ok(info)
    }

    /// Validate `spec` without registering it.
    pub fn from_spec(type_id: TypeId, name: &'static str, spec: ClassSpec) -> Result<Self> {
        let Some(table) = spec.table else {
            return Err(class_info_error(format!("{name} has no table")));
        };
        let table_expr = Expr::table(table);

        let mut declared = spec.columns;
        declared.sort_by(|a, b| a.0.cmp(&b.0));
        for pair in declared.windows(2) {
            if pair[0].0 == pair[1].0 {
                return Err(class_info_error(format!(
                    "{name} declares attribute {} twice",
                    pair[0].0
                )));
            }
        }
        let index: HashMap<String, usize> = declared
            .iter()
            .enumerate()
            .map(|(i, (attr, _))| (attr.clone(), i))
            .collect();

        // Primary key as (position in key, column index).
        let primary: Vec<usize> = match &spec.primary {
            Some(attributes) => attributes
                .iter()
                .map(|attr| {
                    index.get(attr).copied().ok_or_else(|| {
                        class_info_error(format!("{name} has no attribute {attr} for its primary key"))
                    })
                })
                .collect::<Result<_>>()?,
            None => {
                let mut positioned: Vec<(u32, usize)> = declared
                    .iter()
                    .enumerate()
                    .filter(|(_, (_, col))| col.primary != 0)
                    .map(|(i, (_, col))| (col.primary, i))
                    .collect();
                positioned.sort_unstable();
                for pair in positioned.windows(2) {
                    if pair[0].0 == pair[1].0 {
                        return Err(class_info_error(format!(
                            "{name}.{} and {name}.{} both have primary position {}",
                            declared[pair[0].1].0, declared[pair[1].1].0, pair[0].0
                        )));
                    }
                }
                positioned.into_iter().map(|(_, i)| i).collect()
            }
        };
        if primary.is_empty() {
            return Err(class_info_error(format!(
                "{name} has no primary key information"
            )));
        }

        let mut attributes = Vec::with_capacity(declared.len());
        let mut columns = Vec::with_capacity(declared.len());
        for (i, (attr, col)) in declared.into_iter().enumerate() {
            let column_name = col.name.unwrap_or_else(|| attr.clone());
            let position = primary
                .iter()
                .position(|&p| p == i)
                .map_or(0, |p| u32::try_from(p + 1).unwrap_or(u32::MAX));
            let factory = col.factory.named(column_name.as_str());
            columns.push(Column::build(
                column_name,
                Some(table_expr.clone()),
                position,
                factory,
            ));
            attributes.push(attr);
        }
        let primary_key = primary.iter().map(|&i| columns[i].clone()).collect();

        let default_order = spec
            .order
            .iter()
            .map(|entry| {
                let (attr, descending) = match entry.strip_prefix('-') {
                    Some(attr) => (attr, true),
                    None => (entry.as_str(), false),
                };
                let i = index.get(attr).copied().ok_or_else(|| {
                    class_info_error(format!("{name} has no attribute {attr} to order by"))
                })?;
                Ok(if descending {
                    columns[i].desc()
                } else {
                    Expr::Column(columns[i].clone())
                })
            })
            .collect::<Result<_>>()?;

        Ok(Self {
            type_id,
            name,
            table: table_expr,
            attributes,
            columns,
            index,
            primary_key,
            primary_key_pos: primary,
            default_order,
            hooks: spec.hooks,
        })
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Rust type name of the mapped class.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is<T: Mapped>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn table(&self) -> &Expr {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    /// Attribute names, parallel to [`columns`](ClassInfo::columns).
    pub fn attributes(&self) -> &[String] {
        &self.attributes
    }

    pub fn primary_key(&self) -> &[Column] {
        &self.primary_key
    }

    /// Index into [`columns`](ClassInfo::columns) of each primary-key column.
    pub fn primary_key_pos(&self) -> &[usize] {
        &self.primary_key_pos
    }

    pub fn is_primary_index(&self, index: usize) -> bool {
        self.primary_key_pos.contains(&index)
    }

    pub fn default_order(&self) -> &[Expr] {
        &self.default_order
    }

    pub fn hooks(&self) -> &ClassHooks {
        &self.hooks
    }

    pub fn index_of(&self, attribute: &str) -> Option<usize> {
        self.index.get(attribute).copied()
    }

    /// Index of a column given by attribute name.
    pub fn resolve(&self, attribute: &str) -> Result<usize> {
        self.index_of(attribute).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::PropertyPath,
                format!("{} has no attribute {attribute}", self.name),
            )
        })
    }

    /// The column mapped to `attribute`.
    pub fn column(&self, attribute: &str) -> Result<&Column> {
        self.resolve(attribute).map(|i| &self.columns[i])
    }

    /// Index of the column equal to `column`, if it belongs to this class.
    pub fn index_of_column(&self, column: &Column) -> Option<usize> {
        self.columns.iter().position(|c| c == column)
    }
}

impl PartialEq for ClassInfo {
    fn eq(&self, other: &Self) -> bool {
        self.type_id == other.type_id
    }
}

impl fmt::Debug for ClassInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassInfo")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("attributes", &self.attributes)
            .field("primary_key_pos", &self.primary_key_pos)
            .finish_non_exhaustive()
    }
}

/// Column of `T` mapped to `attribute`, for building expressions.
///
/// ```ignore
/// let adults = store.find::<Person>(Some(column_of::<Person>("age")?.ge(18)))?;
/// ```
pub fn column_of<T: Mapped>(attribute: &str) -> Result<Column> {
    ClassInfo::of::<T>()?.column(attribute).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Person;

    impl Mapped for Person {
        fn class_spec() -> ClassSpec {
            ClassSpec::new("person")
                .column("name", ColumnSpec::text())
                .column("id", ColumnSpec::int().primary())
                .column("age", ColumnSpec::int().name("years"))
                .order_by(["-age", "name"])
        }
    }

    fn spec_info(spec: ClassSpec) -> Result<ClassInfo> {
        ClassInfo::from_spec(TypeId::of::<()>(), "Spec", spec)
    }

    #[test]
    fn columns_are_sorted_by_attribute() {
        let info = ClassInfo::of::<Person>().unwrap();
        assert_eq!(info.attributes(), ["age", "id", "name"]);
        let names: Vec<&str> = info.columns().iter().map(Column::name).collect();
        assert_eq!(names, ["years", "id", "name"]);
        assert_eq!(info.primary_key_pos(), [1]);
        assert!(info.primary_key()[0].is_primary());
        assert!(!info.columns()[0].is_primary());
        assert_eq!(info.table(), &Expr::table("person"));
    }

    #[test]
    fn registry_returns_one_instance() {
        let a = ClassInfo::of::<Person>().unwrap();
        let b = ClassInfo::of::<Person>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(a.is::<Person>());
    }

    #[test]
    fn default_order_honors_prefix() {
        let info = ClassInfo::of::<Person>().unwrap();
        let age = info.column("age").unwrap();
        let name = info.column("name").unwrap();
        assert_eq!(
            info.default_order(),
            [age.desc(), Expr::Column(name.clone())]
        );
    }

    #[test]
    fn missing_table_is_rejected() {
        let err = spec_info(ClassSpec::default().column("id", ColumnSpec::int().primary()))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Mapping(ref e) if e.kind == MappingErrorKind::ClassInfo
        ));
    }

    #[test]
    fn primary_key_is_required() {
        let err = spec_info(ClassSpec::new("t").column("id", ColumnSpec::int())).unwrap_err();
        assert!(err.to_string().contains("no primary key"));
    }

    #[test]
    fn duplicate_primary_positions_are_rejected() {
        let err = spec_info(
            ClassSpec::new("t")
                .column("a", ColumnSpec::int().primary())
                .column("b", ColumnSpec::int().primary()),
        )
        .unwrap_err();
        assert!(err.to_string().contains("both have primary position 1"));
    }

    #[test]
    fn composite_key_follows_positions() {
        let info = spec_info(
            ClassSpec::new("t")
                .column("a", ColumnSpec::int().primary_at(2))
                .column("b", ColumnSpec::int().primary_at(1))
                .column("c", ColumnSpec::any()),
        )
        .unwrap();
        assert_eq!(info.primary_key_pos(), [1, 0]);
        assert_eq!(info.primary_key()[0].primary(), 1);
        assert_eq!(info.primary_key()[1].primary(), 2);
    }

    #[test]
    fn explicit_primary_list_overrides_positions() {
        let info = spec_info(
            ClassSpec::new("t")
                .column("a", ColumnSpec::int().primary())
                .column("b", ColumnSpec::int())
                .primary_key(["b"]),
        )
        .unwrap();
        assert_eq!(info.primary_key_pos(), [1]);

        let err = spec_info(
            ClassSpec::new("t")
                .column("a", ColumnSpec::int())
                .primary_key(["missing"]),
        )
        .unwrap_err();
        assert!(matches!(err, Error::Mapping(ref e) if e.kind == MappingErrorKind::ClassInfo));
    }

    #[test]
    fn unknown_attribute_is_a_property_path_error() {
        let info = ClassInfo::of::<Person>().unwrap();
        let err = info.column("salary").unwrap_err();
        assert!(matches!(err, Error::Mapping(ref e) if e.kind == MappingErrorKind::PropertyPath));
        assert_eq!(column_of::<Person>("id").unwrap().name(), "id");
    }

    #[test]
    fn order_on_unknown_attribute_is_rejected() {
        let err = spec_info(
            ClassSpec::new("t")
                .column("id", ColumnSpec::int().primary())
                .order_by(["-nope"]),
        )
        .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
