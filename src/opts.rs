//! Connection and transaction options.

/// Options for opening a connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Never wrap user commands in an implicit transaction.
    ///
    /// Default: `false`
    pub autocommit: bool,

    /// Keyword overrides merged into the connection string. The override
    /// wins over a value already present; `None` drops the key.
    ///
    /// Default: `[]`
    pub overrides: Vec<(String, Option<String>)>,
}

impl ConnectOptions {
    /// Options with `autocommit` enabled.
    pub fn autocommit() -> Self {
        Self {
            autocommit: true,
            ..Self::default()
        }
    }
}

/// Options for a transaction scope.
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Explicit savepoint name. When absent, an inner scope gets a
    /// generated `tx_savepoint_<n>` name and an outer scope creates no
    /// savepoint at all.
    ///
    /// Default: `None`
    pub savepoint_name: Option<String>,

    /// Roll the scope back on exit even when it completes successfully.
    ///
    /// Default: `false`
    pub force_rollback: bool,
}

impl TransactionOptions {
    /// Options with an explicit savepoint name.
    pub fn savepoint(name: impl Into<String>) -> Self {
        Self {
            savepoint_name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Options that always roll back on exit.
    pub fn force_rollback() -> Self {
        Self {
            force_rollback: true,
            ..Self::default()
        }
    }
}
