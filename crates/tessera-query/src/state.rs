//! Mutable state threaded through one compilation.

use std::collections::HashSet;

use tessera_core::{Alias, Column, Expr, Variable};

/// Precedence of nodes that never need parentheses.
///
/// Precedences are scaled by ten so that the half steps used to force
/// parentheses on right operands stay integral.
pub const MAX_PRECEDENCE: u32 = 10_000;

/// Added to the current precedence to parenthesize an operand that would
/// otherwise bind equally.
pub const HALF_STEP: u32 = 5;

/// Where in a statement the node being compiled appears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Context {
    /// FROM clause or statement target
    Table,
    /// WHERE, HAVING, ORDER BY and function arguments
    Expr,
    /// SELECT column list
    Column,
    /// The table part of a qualified column
    ColumnPrefix,
    /// INSERT column lists and UPDATE SET targets
    ColumnName,
    /// Operands of a set operation
    Select,
}

/// Everything a compilation accumulates besides the SQL text.
///
/// Handlers that change a field restore it before returning. After an
/// error the state is unspecified and should be discarded.
#[derive(Debug, Clone)]
pub struct State {
    /// Precedence of the enclosing node
    pub precedence: u32,
    /// Parameters in placeholder order
    pub parameters: Vec<Variable>,
    /// Tables registered by compiled columns, for FROM resolution
    pub auto_tables: Vec<Expr>,
    /// Tables rendered inside joins, while auto tables are being built
    pub join_tables: Option<HashSet<String>>,
    pub context: Option<Context>,
    /// Column aliases from an enclosing set operation's ORDER BY
    pub aliases: Option<Vec<(Column, Alias)>>,
}

impl Default for State {
    fn default() -> Self {
        Self {
            precedence: 0,
            parameters: Vec::new(),
            auto_tables: Vec::new(),
            join_tables: None,
            context: None,
            aliases: None,
        }
    }
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch context, returning the previous one for [`State::restore_context`].
    pub fn enter(&mut self, context: Context) -> Option<Context> {
        self.context.replace(context)
    }

    pub fn restore_context(&mut self, previous: Option<Context>) {
        self.context = previous;
    }

    pub fn alias_for(&self, column: &Column) -> Option<&Alias> {
        self.aliases
            .as_ref()?
            .iter()
            .find(|(aliased, _)| aliased == column)
            .map(|(_, alias)| alias)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_and_restore() {
        let mut state = State::new();
        let previous = state.enter(Context::Column);
        assert_eq!(previous, None);
        let inner = state.enter(Context::Expr);
        assert_eq!(inner, Some(Context::Column));
        state.restore_context(inner);
        assert_eq!(state.context, Some(Context::Column));
        state.restore_context(previous);
        assert_eq!(state.context, None);
    }

    #[test]
    fn alias_lookup_by_column() {
        let name = Column::of("person", "name");
        let mut state = State::new();
        assert!(state.alias_for(&name).is_none());
        state.aliases = Some(vec![(name.clone(), Alias::new(name.clone(), "n"))]);
        assert_eq!(state.alias_for(&name).map(|a| a.name.as_str()), Some("n"));
        assert!(state.alias_for(&Column::of("person", "age")).is_none());
    }
}
