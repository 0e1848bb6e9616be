//! Typed value slots with change tracking.
//!
//! Every mapped column of a live object owns one [`Variable`]. A variable
//! holds either nothing (undefined), a concrete internal value, or a
//! [`LazyValue`] that the store resolves on demand. Mutations report a
//! [`VariableChange`] back to the caller, which is how the store learns that
//! an object became dirty.

use std::fmt;
use std::sync::Arc;

use crate::Result;
use crate::error::{Error, NoneError};
use crate::expr::Expr;
use crate::kind::VariableKind;
use crate::value::Value;

// ============================================================================
// Lazy values and fields
// ============================================================================

/// A deferred value that the store knows how to resolve.
#[derive(Debug, Clone)]
pub enum LazyValue {
    /// Fetch the column from the database on next access.
    AutoReload,
    /// The value will come from a referenced object that is not flushed yet.
    PendingReference,
    /// Write this SQL expression on the next flush.
    Expr(Arc<Expr>),
}

impl LazyValue {
    /// Wrap an expression to be evaluated by the database on flush.
    pub fn expr(expr: impl Into<Expr>) -> Self {
        LazyValue::Expr(Arc::new(expr.into()))
    }
}

impl PartialEq for LazyValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (LazyValue::AutoReload, LazyValue::AutoReload)
            | (LazyValue::PendingReference, LazyValue::PendingReference) => true,
            (LazyValue::Expr(a), LazyValue::Expr(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

/// The observable state of a variable.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Field {
    /// Never set, or deleted.
    #[default]
    Undefined,
    /// A concrete internal value. NULL is concrete.
    Concrete(Value),
    /// A value the store has to resolve before it can be read.
    Lazy(LazyValue),
}

impl Field {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Field::Undefined)
    }

    pub fn is_lazy(&self) -> bool {
        matches!(self, Field::Lazy(_))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Field::Concrete(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_lazy(&self) -> Option<&LazyValue> {
        match self {
            Field::Lazy(l) => Some(l),
            _ => None,
        }
    }
}

/// Reported by a variable whose state diverged.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableChange {
    pub old: Field,
    pub new: Field,
    /// True when the new value was loaded from the database. Such changes
    /// never dirty the owning object.
    pub from_db: bool,
}

/// A copyable snapshot of a variable's state.
#[derive(Debug, Clone)]
pub struct VariableState {
    lazy: Option<LazyValue>,
    value: Option<Value>,
    serialized: Option<String>,
}

impl PartialEq for VariableState {
    fn eq(&self, other: &Self) -> bool {
        if self.lazy != other.lazy {
            return false;
        }
        match (&self.serialized, &other.serialized) {
            (Some(a), Some(b)) => a == b,
            _ => self.value == other.value,
        }
    }
}

// ============================================================================
// Validators
// ============================================================================

/// Checks, and optionally replaces, a host value before it is stored.
///
/// Validators run only for values set by the application, never for values
/// loaded from the database.
pub trait Validator: Send + Sync {
    fn validate(&self, column: Option<&str>, value: Value) -> Result<Value>;
}

impl<F> Validator for F
where
    F: Fn(Option<&str>, Value) -> Result<Value> + Send + Sync,
{
    fn validate(&self, column: Option<&str>, value: Value) -> Result<Value> {
        self(column, value)
    }
}

/// An ordered chain of validators. Each one receives the output of the
/// previous one.
#[derive(Clone, Default)]
pub struct Validators {
    chain: Vec<Arc<dyn Validator>>,
}

impl Validators {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a validator to the chain.
    #[must_use]
    pub fn chain(mut self, validator: impl Validator + 'static) -> Self {
        self.chain.push(Arc::new(validator));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    /// Run the value through every validator in order.
    pub fn validate(&self, column: Option<&str>, value: Value) -> Result<Value> {
        self.chain
            .iter()
            .try_fold(value, |value, validator| validator.validate(column, value))
    }
}

impl fmt::Debug for Validators {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validators({})", self.chain.len())
    }
}

// ============================================================================
// Factory
// ============================================================================

#[derive(Clone)]
enum DefaultValue {
    Value(Value),
    Factory(Arc<dyn Fn() -> Value + Send + Sync>),
}

impl DefaultValue {
    fn produce(&self) -> Value {
        match self {
            DefaultValue::Value(v) => v.clone(),
            DefaultValue::Factory(f) => f(),
        }
    }
}

/// Describes how to build the variables of one column.
///
/// ```ignore
/// let age = VariableFactory::new(VariableKind::Int)
///     .not_null()
///     .default(0)
///     .validator(|_: Option<&str>, v: Value| Ok(v));
/// ```
#[derive(Clone)]
pub struct VariableFactory {
    kind: VariableKind,
    allow_none: bool,
    default: Option<DefaultValue>,
    validators: Validators,
    column: Option<Arc<str>>,
}

impl VariableFactory {
    pub fn new(kind: VariableKind) -> Self {
        Self {
            kind,
            allow_none: true,
            default: None,
            validators: Validators::new(),
            column: None,
        }
    }

    /// A factory for untyped variables.
    pub fn any() -> Self {
        Self::new(VariableKind::Any)
    }

    /// Reject NULL values.
    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.allow_none = false;
        self
    }

    /// Value assigned to every newly created variable.
    #[must_use]
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(DefaultValue::Value(value.into()));
        self
    }

    /// Produce a fresh default for every newly created variable.
    #[must_use]
    pub fn default_factory(mut self, f: impl Fn() -> Value + Send + Sync + 'static) -> Self {
        self.default = Some(DefaultValue::Factory(Arc::new(f)));
        self
    }

    #[must_use]
    pub fn validator(mut self, validator: impl Validator + 'static) -> Self {
        self.validators = self.validators.chain(validator);
        self
    }

    /// Name reported in nullability and type errors.
    #[must_use]
    pub fn named(mut self, column: impl Into<Arc<str>>) -> Self {
        self.column = Some(column.into());
        self
    }

    pub fn kind(&self) -> &VariableKind {
        &self.kind
    }

    pub fn allows_none(&self) -> bool {
        self.allow_none
    }

    pub fn column_name(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn has_default(&self) -> bool {
        self.default.is_some()
    }

    /// Build a variable, applying the column default if one is declared.
    pub fn create(&self) -> Result<Variable> {
        let mut variable = Variable {
            kind: self.kind.clone(),
            allow_none: self.allow_none,
            column: self.column.clone(),
            validators: self.validators.clone(),
            value: None,
            lazy: None,
            checkpoint: None,
        };
        if let Some(default) = &self.default {
            variable.set(default.produce(), false)?;
        }
        Ok(variable)
    }

    /// Build a variable holding a literal compared against this column.
    ///
    /// Literals are typed by the column's kind but skip its validators.
    pub fn param(&self, value: impl Into<Value>) -> Result<Variable> {
        let mut variable = Variable::new(self.kind.clone());
        variable.column = self.column.clone();
        variable.set(value.into(), false)?;
        Ok(variable)
    }
}

impl fmt::Debug for VariableFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VariableFactory")
            .field("kind", &self.kind)
            .field("allow_none", &self.allow_none)
            .field("has_default", &self.default.is_some())
            .field("validators", &self.validators)
            .field("column", &self.column)
            .finish()
    }
}

// ============================================================================
// Variable
// ============================================================================

/// One typed value slot.
#[derive(Debug, Clone)]
pub struct Variable {
    kind: VariableKind,
    allow_none: bool,
    column: Option<Arc<str>>,
    validators: Validators,
    value: Option<Value>,
    lazy: Option<LazyValue>,
    checkpoint: Option<VariableState>,
}

impl Variable {
    /// An undefined, nullable variable of the given kind.
    pub fn new(kind: VariableKind) -> Self {
        Self {
            kind,
            allow_none: true,
            column: None,
            validators: Validators::new(),
            value: None,
            lazy: None,
            checkpoint: None,
        }
    }

    /// An untyped variable holding `value` as is.
    pub fn any(value: impl Into<Value>) -> Self {
        let mut variable = Self::new(VariableKind::Any);
        variable.value = Some(value.into());
        variable
    }

    /// A variable of `kind` holding the host value `value`.
    pub fn with_value(kind: VariableKind, value: impl Into<Value>) -> Result<Self> {
        let mut variable = Self::new(kind);
        variable.set(value.into(), false)?;
        Ok(variable)
    }

    pub fn kind(&self) -> &VariableKind {
        &self.kind
    }

    pub fn column(&self) -> Option<&str> {
        self.column.as_deref()
    }

    pub fn allows_none(&self) -> bool {
        self.allow_none
    }

    /// Store a host value, or a database value when `from_db` is set.
    ///
    /// Returns the change to dispatch when the state diverged.
    pub fn set(&mut self, value: Value, from_db: bool) -> Result<Option<VariableChange>> {
        let column = self.column.as_deref();
        let value = if from_db || self.validators.is_empty() {
            value
        } else {
            self.validators.validate(column, value)?
        };
        let new_value = if value.is_null() {
            if !self.allow_none {
                return Err(Error::None(NoneError {
                    column: column.map(str::to_string),
                }));
            }
            Value::Null
        } else {
            self.kind.parse_set(value, from_db, column)?
        };

        let old = self.field();
        let was_lazy = self.lazy.take().is_some();
        let changed = was_lazy || self.value.as_ref() != Some(&new_value);
        self.value = Some(new_value);
        Ok(changed.then(|| VariableChange {
            old,
            new: self.field(),
            from_db,
        }))
    }

    /// Replace the state with a lazy value. Always reports a change.
    pub fn set_lazy(&mut self, lazy: LazyValue) -> VariableChange {
        let old = self.field();
        self.value = None;
        self.checkpoint = None;
        self.lazy = Some(lazy.clone());
        VariableChange {
            old,
            new: Field::Lazy(lazy),
            from_db: false,
        }
    }

    /// The host form (or wire form with `to_db`) of the concrete value.
    ///
    /// Returns `None` when the variable is undefined or lazy; resolving a
    /// lazy value is the store's job.
    pub fn get(&self, to_db: bool) -> Result<Option<Value>> {
        if self.lazy.is_some() {
            return Ok(None);
        }
        self.value
            .as_ref()
            .map(|v| self.kind.parse_get(v, to_db))
            .transpose()
    }

    /// The internal value, if concrete.
    pub fn value(&self) -> Option<&Value> {
        if self.lazy.is_some() {
            None
        } else {
            self.value.as_ref()
        }
    }

    /// Mutable access to the internal value, for in-place edits of
    /// mutable kinds. Edits are picked up by [`Variable::detect_mutation`].
    pub fn value_mut(&mut self) -> Option<&mut Value> {
        if self.lazy.is_some() {
            None
        } else {
            self.value.as_mut()
        }
    }

    pub fn lazy(&self) -> Option<&LazyValue> {
        self.lazy.as_ref()
    }

    pub fn field(&self) -> Field {
        match (&self.lazy, &self.value) {
            (Some(lazy), _) => Field::Lazy(lazy.clone()),
            (None, Some(value)) => Field::Concrete(value.clone()),
            (None, None) => Field::Undefined,
        }
    }

    /// Make the variable undefined. Reports a change only if it held a value.
    pub fn delete(&mut self) -> Option<VariableChange> {
        let old = self.value.take()?;
        Some(VariableChange {
            old: Field::Concrete(old),
            new: Field::Undefined,
            from_db: false,
        })
    }

    pub fn is_defined(&self) -> bool {
        self.value.is_some()
    }

    pub fn get_state(&self) -> VariableState {
        VariableState {
            lazy: self.lazy.clone(),
            serialized: self
                .value
                .as_ref()
                .and_then(|v| self.kind.serialize_state(v)),
            value: self.value.clone(),
        }
    }

    pub fn set_state(&mut self, state: VariableState) {
        self.lazy = state.lazy;
        self.value = state.value;
    }

    /// Remember the current state as the baseline for [`has_changed`].
    ///
    /// [`has_changed`]: Variable::has_changed
    pub fn checkpoint(&mut self) {
        self.checkpoint = Some(self.get_state());
    }

    pub fn has_changed(&self) -> bool {
        self.lazy.is_some() || self.checkpoint.as_ref() != Some(&self.get_state())
    }

    /// A detached variable with the same configuration and state.
    #[must_use]
    pub fn copy(&self) -> Self {
        let mut copy = self.clone();
        copy.checkpoint = None;
        copy
    }

    /// Report in-place edits of mutable content made since the last
    /// checkpoint.
    pub fn detect_mutation(&self) -> Option<VariableChange> {
        if !self.kind.is_mutable() || self.lazy.is_some() {
            return None;
        }
        let checkpoint = self.checkpoint.as_ref()?;
        let current = self.get_state();
        if *checkpoint == current {
            return None;
        }
        Some(VariableChange {
            old: checkpoint
                .value
                .clone()
                .map_or(Field::Undefined, Field::Concrete),
            new: self.field(),
            from_db: false,
        })
    }
}

impl PartialEq for Variable {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.lazy == other.lazy && self.value == other.value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ValidationError;

    fn int_var() -> Variable {
        VariableFactory::new(VariableKind::Int)
            .named("age")
            .create()
            .unwrap()
    }

    #[test]
    fn set_reports_change_only_on_divergence() {
        let mut var = int_var();
        let change = var.set(Value::Int(3), false).unwrap().unwrap();
        assert_eq!(change.old, Field::Undefined);
        assert_eq!(change.new, Field::Concrete(Value::BigInt(3)));
        assert!(!change.from_db);
        assert!(var.set(Value::BigInt(3), false).unwrap().is_none());
        assert!(var.set(Value::Int(4), true).unwrap().unwrap().from_db);
    }

    #[test]
    fn null_rejected_when_not_nullable() {
        let mut var = VariableFactory::new(VariableKind::Unicode)
            .not_null()
            .named("name")
            .create()
            .unwrap();
        let err = var.set(Value::Null, false).unwrap_err();
        assert_eq!(
            err.to_string(),
            "None isn't acceptable as a value for name"
        );
        assert!(!var.is_defined());
    }

    #[test]
    fn wrong_type_names_column() {
        let mut var = int_var();
        match var.set(Value::Text("x".to_string()), false) {
            Err(Error::Type(e)) => assert_eq!(e.column.as_deref(), Some("age")),
            other => panic!("expected type error, got {other:?}"),
        }
    }

    #[test]
    fn checkpoint_and_has_changed() {
        let mut var = int_var();
        assert!(var.has_changed());
        var.set(Value::Int(1), false).unwrap();
        var.checkpoint();
        assert!(!var.has_changed());
        var.set(Value::Int(2), false).unwrap();
        assert!(var.has_changed());
        var.set(Value::Int(1), false).unwrap();
        assert!(!var.has_changed());
    }

    #[test]
    fn lazy_value_clears_value_and_always_changes() {
        let mut var = int_var();
        var.set(Value::Int(1), false).unwrap();
        var.checkpoint();
        let change = var.set_lazy(LazyValue::AutoReload);
        assert_eq!(change.old, Field::Concrete(Value::BigInt(1)));
        assert_eq!(change.new, Field::Lazy(LazyValue::AutoReload));
        assert!(!var.is_defined());
        assert!(var.has_changed());
        assert_eq!(var.get(false).unwrap(), None);
        assert!(var.value().is_none());

        // Setting a concrete value after a lazy one is always a change.
        assert!(var.set(Value::Int(1), true).unwrap().is_some());
        assert!(var.lazy().is_none());
    }

    #[test]
    fn lazy_expr_equality_is_identity() {
        let expr = Arc::new(Expr::Raw("now()".to_string()));
        let a = LazyValue::Expr(Arc::clone(&expr));
        let b = LazyValue::Expr(expr);
        let c = LazyValue::expr(Expr::Raw("now()".to_string()));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn delete_reports_only_defined() {
        let mut var = int_var();
        assert!(var.delete().is_none());
        var.set(Value::Int(5), false).unwrap();
        let change = var.delete().unwrap();
        assert_eq!(change.new, Field::Undefined);
        assert!(!var.is_defined());
    }

    #[test]
    fn validators_chain_and_skip_db_values() {
        let factory = VariableFactory::new(VariableKind::Int)
            .named("age")
            .validator(|_: Option<&str>, v: Value| match v.as_i64() {
                Some(n) if n < 0 => Ok(Value::BigInt(0)),
                _ => Ok(v),
            })
            .validator(|column: Option<&str>, v: Value| {
                if v.as_i64() == Some(13) {
                    let mut errors = ValidationError::new();
                    errors.add_custom(column.unwrap_or_default(), "unlucky");
                    Err(errors.into())
                } else {
                    Ok(v)
                }
            });
        let mut var = factory.create().unwrap();
        var.set(Value::Int(-5), false).unwrap();
        assert_eq!(var.value(), Some(&Value::BigInt(0)));
        assert!(matches!(
            var.set(Value::Int(13), false),
            Err(Error::Validation(_))
        ));
        var.set(Value::Int(13), true).unwrap();
        assert_eq!(var.value(), Some(&Value::BigInt(13)));
    }

    #[test]
    fn defaults_are_applied_on_create() {
        let var = VariableFactory::new(VariableKind::Unicode)
            .default("anonymous")
            .create()
            .unwrap();
        assert_eq!(
            var.get(false).unwrap(),
            Some(Value::Text("anonymous".to_string()))
        );

        let var = VariableFactory::new(VariableKind::Int)
            .default_factory(|| Value::Int(7))
            .create()
            .unwrap();
        assert_eq!(var.value(), Some(&Value::BigInt(7)));
    }

    #[test]
    fn state_round_trip_and_copy() {
        let mut var = int_var();
        var.set(Value::Int(9), false).unwrap();
        let state = var.get_state();
        let mut other = int_var();
        other.set_state(state);
        assert_eq!(other, var);

        var.checkpoint();
        let copy = var.copy();
        assert_eq!(copy.value(), Some(&Value::BigInt(9)));
        assert!(copy.has_changed());
        assert!(!var.has_changed());
    }

    #[test]
    fn in_place_mutation_is_detected() {
        let mut var = Variable::with_value(VariableKind::Json, serde_json::json!({"a": 1})).unwrap();
        var.checkpoint();
        assert!(var.detect_mutation().is_none());
        if let Some(Value::Json(serde_json::Value::Object(map))) = var.value_mut() {
            map.insert("b".to_string(), serde_json::json!(2));
        }
        let change = var.detect_mutation().unwrap();
        assert!(matches!(change.new, Field::Concrete(Value::Json(_))));
        assert!(var.has_changed());
    }

    #[test]
    fn wire_form_goes_through_kind() {
        let var = Variable::with_value(VariableKind::Json, serde_json::json!([1, 2])).unwrap();
        assert_eq!(
            var.get(true).unwrap(),
            Some(Value::Text("[1,2]".to_string()))
        );
        let null = Variable::with_value(VariableKind::Json, Value::Null).unwrap();
        assert_eq!(null.get(true).unwrap(), Some(Value::Null));
    }
}
