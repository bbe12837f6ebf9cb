//! Error types for entmap operations.

use std::fmt;

/// The primary error type for all entmap operations.
#[derive(Debug)]
pub enum Error {
    /// Mapping metadata is structurally invalid (fatal for the entity type)
    Mapping(MappingError),
    /// Operation is invalid for the current instance or context state
    State(StateError),
    /// A versioned row changed (or vanished) under us
    OptimisticLock(OptimisticLockError),
    /// New rows reference each other through non-nullable foreign keys
    CyclicDependency(CycleError),
    /// Failure reported by the row source, propagated unmodified
    RowSource(RowSourceError),
    /// Value conversion errors while hydrating objects
    Type(TypeError),
    /// Serialization/deserialization errors
    Serde(String),
}

/// Metadata that cannot be turned into a mapping graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingError {
    pub kind: MappingErrorKind,
    /// Entity the offending metadata belongs to
    pub entity: String,
    /// Attribute path, when the problem is attribute-scoped
    pub attribute: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingErrorKind {
    /// Target or parent entity name does not resolve
    UnresolvedTarget,
    /// Both join-column and join-table metadata are present
    AmbiguousJoin,
    /// `mapped_by` names a missing or unsuitable attribute
    InvalidMappedBy,
    /// No identifier attribute, or an unsupported identifier shape
    MissingIdentifier,
    /// More than one version attribute
    DuplicateVersion,
    /// Table or column name is not a valid SQL identifier
    InvalidIdentifier,
    /// Two mappings write the same column of a table
    DuplicateColumn,
    /// Join column does not line up with the target identifier
    InvalidJoinColumn,
    /// Link phase ran twice over the same association
    AlreadyLinked,
    /// Anything else structurally wrong
    Invalid,
}

/// An operation that is not valid for the instance's current state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    pub entity: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OptimisticLockError {
    pub entity: String,
    pub table: String,
    /// Identifier values of the stale row
    pub id: Vec<crate::Value>,
    /// Version the update expected to find, if the entity is versioned
    pub expected_version: Option<crate::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleError {
    /// Entities participating in the cycle, in discovery order
    pub entities: Vec<String>,
}

#[derive(Debug)]
pub struct RowSourceError {
    pub kind: RowSourceErrorKind,
    pub table: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowSourceErrorKind {
    /// Could not reach the store
    Connection,
    /// Unique / foreign key / not-null violation
    Constraint,
    /// Table or column unknown to the store
    NotFound,
    /// Other store failure
    Database,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

impl MappingError {
    pub fn new(
        kind: MappingErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            entity: entity.into(),
            attribute: None,
            message: message.into(),
        }
    }

    /// Attach the attribute path the error refers to.
    #[must_use]
    pub fn at(mut self, attribute: impl Into<String>) -> Self {
        self.attribute = Some(attribute.into());
        self
    }
}

impl StateError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            entity: None,
            message: message.into(),
        }
    }

    pub fn for_entity(entity: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            entity: Some(entity.into()),
            message: message.into(),
        }
    }
}

impl RowSourceError {
    pub fn new(kind: RowSourceErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            table: None,
            message: message.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn on_table(mut self, table: impl Into<String>) -> Self {
        self.table = Some(table.into());
        self
    }

    pub fn is_constraint_violation(&self) -> bool {
        self.kind == RowSourceErrorKind::Constraint
    }
}

impl Error {
    /// Shorthand for a `MappingError`.
    pub fn mapping(
        kind: MappingErrorKind,
        entity: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Error::Mapping(MappingError::new(kind, entity, message))
    }

    /// Shorthand for a `StateError` not tied to an entity.
    pub fn state(message: impl Into<String>) -> Self {
        Error::State(StateError::new(message))
    }

    /// Is this a version mismatch that the caller may retry after reloading?
    pub fn is_optimistic_lock(&self) -> bool {
        matches!(self, Error::OptimisticLock(_))
    }

    /// Can the caller keep using the context after this error?
    ///
    /// State errors are raised before anything is touched. Every other kind
    /// either means the metadata is broken or a flush stopped half-way, and
    /// the context must be discarded.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::State(_) | Error::OptimisticLock(_))
    }

    /// Mapping error kind, if this is a mapping error.
    pub fn mapping_kind(&self) -> Option<MappingErrorKind> {
        match self {
            Error::Mapping(m) => Some(m.kind),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Mapping(e) => write!(f, "Mapping error: {}", e),
            Error::State(e) => write!(f, "Illegal state: {}", e),
            Error::OptimisticLock(e) => write!(f, "Optimistic lock failure: {}", e),
            Error::CyclicDependency(e) => write!(f, "Cyclic dependency: {}", e),
            Error::RowSource(e) => write!(f, "Row source error: {}", e),
            Error::Type(e) => write!(f, "Type error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::RowSource(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for MappingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.attribute {
            Some(attr) => write!(f, "{}.{}: {}", self.entity, attr, self.message),
            None => write!(f, "{}: {}", self.entity, self.message),
        }
    }
}

impl fmt::Display for StateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity {
            Some(entity) => write!(f, "{} ({})", self.message, entity),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for OptimisticLockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "row {:?} of {} in table '{}' was modified or deleted concurrently",
            self.id, self.entity, self.table
        )?;
        if let Some(version) = &self.expected_version {
            write!(f, " (expected version {:?})", version)?;
        }
        Ok(())
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "non-nullable foreign keys form a cycle: {}",
            self.entities.join(" -> ")
        )
    }
}

impl fmt::Display for RowSourceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.table {
            Some(table) => write!(f, "{} (table '{}')", self.message, table),
            None => write!(f, "{}", self.message),
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl From<MappingError> for Error {
    fn from(err: MappingError) -> Self {
        Error::Mapping(err)
    }
}

impl From<StateError> for Error {
    fn from(err: StateError) -> Self {
        Error::State(err)
    }
}

impl From<OptimisticLockError> for Error {
    fn from(err: OptimisticLockError) -> Self {
        Error::OptimisticLock(err)
    }
}

impl From<CycleError> for Error {
    fn from(err: CycleError) -> Self {
        Error::CyclicDependency(err)
    }
}

impl From<RowSourceError> for Error {
    fn from(err: RowSourceError) -> Self {
        Error::RowSource(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for entmap operations.
pub type Result<T> = std::result::Result<T, Error>;
