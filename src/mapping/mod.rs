//! Row to entity mapping.

pub mod cursor;

use std::collections::{BTreeMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use tracing::trace;

use crate::coerce::Coercer;
use crate::core::{Error, Result, SqlType, Value};
use crate::driver::ResultSet;
use crate::entity::{Entity, EntityMetadata, EntityRegistry, FieldDef};

pub use cursor::EntityCursor;

/// Builds entities of type `T` from result rows.
///
/// Columns are matched to fields by lowercased name. Columns without a
/// field are ignored; fields without a column are an error unless
/// [`RowMapper::allow_missing_columns`] is set.
pub struct RowMapper<T> {
    metadata: Arc<EntityMetadata<T>>,
    coercer: Arc<Coercer>,
    allow_missing_columns: bool,
    auto_close: bool,
}

impl<T> Clone for RowMapper<T> {
    fn clone(&self) -> Self {
        Self {
            metadata: Arc::clone(&self.metadata),
            coercer: Arc::clone(&self.coercer),
            allow_missing_columns: self.allow_missing_columns,
            auto_close: self.auto_close,
        }
    }
}

impl<T: Entity> RowMapper<T> {
    /// A mapper using the global registry and the default coercer.
    pub fn new() -> Result<Self> {
        Self::with_registry(EntityRegistry::global(), Arc::new(Coercer::new()))
    }

    pub fn with_registry(registry: &EntityRegistry, coercer: Arc<Coercer>) -> Result<Self> {
        Ok(Self::from_metadata(registry.fields_for::<T>()?, coercer))
    }

    pub fn from_metadata(metadata: Arc<EntityMetadata<T>>, coercer: Arc<Coercer>) -> Self {
        Self {
            metadata,
            coercer,
            allow_missing_columns: false,
            auto_close: false,
        }
    }

    pub fn allow_missing_columns(mut self, allow: bool) -> Self {
        self.allow_missing_columns = allow;
        self
    }

    /// Close the result set and its statement after eager mapping.
    pub fn auto_close(mut self, auto_close: bool) -> Self {
        self.auto_close = auto_close;
        self
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata<T>> {
        &self.metadata
    }

    pub fn coercer(&self) -> &Arc<Coercer> {
        &self.coercer
    }

    /// Map the current row of `rs`.
    pub fn map_row(&self, rs: &dyn ResultSet) -> Result<T> {
        let entity_name = self.metadata.name();

        if !self.allow_missing_columns {
            let present: HashSet<String> = rs
                .columns()
                .iter()
                .map(|column| column.name.to_lowercase())
                .collect();
            if let Some(missing) = self.metadata.keys().find(|key| !present.contains(*key)) {
                return Err(Error::mapping(format!(
                    "{}: column '{}' is missing from the result",
                    entity_name, missing
                )));
            }
        }

        let mut entity = T::default();
        for (index, column) in rs.columns().iter().enumerate() {
            let Some(def) = self.metadata.get(&column.name) else {
                continue;
            };

            let value = if column.sql_type == SqlType::Array {
                rs.get_array(index)?.map_or(Value::Null, Value::Array)
            } else {
                rs.get(index)?
            };
            self.assign(&mut entity, def, value)?;
        }

        Ok(entity)
    }

    /// Build an entity from a `column -> value` record.
    pub fn map_record(&self, record: &BTreeMap<String, Value>) -> Result<T> {
        let entity_name = self.metadata.name();

        if !self.allow_missing_columns {
            let present: HashSet<String> = record.keys().map(|key| key.to_lowercase()).collect();
            if let Some(missing) = self.metadata.keys().find(|key| !present.contains(*key)) {
                return Err(Error::mapping(format!(
                    "{}: column '{}' is missing from the record",
                    entity_name, missing
                )));
            }
        }

        let mut entity = T::default();
        for (column, value) in record {
            if let Some(def) = self.metadata.get(column) {
                self.assign(&mut entity, def, value.clone())?;
            }
        }
        Ok(entity)
    }

    fn assign(&self, entity: &mut T, def: &FieldDef<T>, value: Value) -> Result<()> {
        assign_field(&self.coercer, self.metadata.name(), entity, def, value)
    }

    /// The first row, if any. `error_if_empty` turns an empty result into an
    /// error.
    pub fn first(&self, rs: &mut dyn ResultSet, error_if_empty: bool) -> Result<Option<T>> {
        self.first_with(rs, error_if_empty, false)
    }

    /// The only row, if any. More than one row is an error.
    pub fn unique(&self, rs: &mut dyn ResultSet, error_if_empty: bool) -> Result<Option<T>> {
        self.first_with(rs, error_if_empty, true)
    }

    /// Reads at most two rows.
    pub fn first_with(
        &self,
        rs: &mut dyn ResultSet,
        error_if_empty: bool,
        error_if_more_than_one: bool,
    ) -> Result<Option<T>> {
        let result = self.read_first(rs, error_if_empty, error_if_more_than_one);
        self.finish(rs, result)
    }

    fn read_first(
        &self,
        rs: &mut dyn ResultSet,
        error_if_empty: bool,
        error_if_more_than_one: bool,
    ) -> Result<Option<T>> {
        if !rs.next()? {
            if error_if_empty {
                return Err(Error::mapping(format!("{}: query returned no rows", self.metadata.name())));
            }
            return Ok(None);
        }

        let entity = self.map_row(rs)?;
        if error_if_more_than_one && rs.next()? {
            return Err(Error::mapping(format!(
                "{}: query returned more than one row",
                self.metadata.name()
            )));
        }
        Ok(Some(entity))
    }

    pub fn all(&self, rs: &mut dyn ResultSet) -> Result<Vec<T>> {
        self.up_to(rs, usize::MAX)
    }

    /// At most `limit` rows.
    pub fn up_to(&self, rs: &mut dyn ResultSet, limit: usize) -> Result<Vec<T>> {
        let result = self.collect_rows(rs, limit);
        self.finish(rs, result)
    }

    fn collect_rows(&self, rs: &mut dyn ResultSet, limit: usize) -> Result<Vec<T>> {
        let mut entities = Vec::new();
        while entities.len() < limit && rs.next()? {
            entities.push(self.map_row(rs)?);
        }
        trace!(entity = self.metadata.name(), rows = entities.len(), "Mapped rows");
        Ok(entities)
    }

    pub fn set(&self, rs: &mut dyn ResultSet) -> Result<HashSet<T>>
    where
        T: Hash + Eq,
    {
        Ok(self.all(rs)?.into_iter().collect())
    }

    /// A lazy cursor over the rows of `rs`. The cursor owns the result set
    /// and closes it (and its statement) once exhausted or dropped.
    pub fn iter(&self, rs: Box<dyn ResultSet>) -> EntityCursor<T> {
        EntityCursor::new(self.clone(), rs)
    }

    fn finish<R>(&self, rs: &mut dyn ResultSet, result: Result<R>) -> Result<R> {
        if !self.auto_close {
            return result;
        }
        let closed = close_with_statement(rs);
        let value = result?;
        closed?;
        Ok(value)
    }
}

/// Coerce `value` to the field's type and write it into `entity`.
pub(crate) fn assign_field<T>(
    coercer: &Coercer,
    entity_name: &str,
    entity: &mut T,
    def: &FieldDef<T>,
    value: Value,
) -> Result<()> {
    let context = || format!("Failed to set {}.{}", entity_name, def.key());
    let value = coercer
        .convert(value, def.value_type())
        .map_err(|err| Error::mapping_caused_by(context(), err))?;
    def.set(entity, value)
        .map_err(|err| Error::mapping_caused_by(context(), err))
}

/// Close `rs` and then the statement that produced it.
pub(crate) fn close_with_statement(rs: &mut dyn ResultSet) -> Result<()> {
    let statement = rs.statement();
    rs.close()?;
    if let Some(mut statement) = statement {
        statement.close()?;
    }
    Ok(())
}
