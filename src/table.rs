//! INSERT/UPDATE/DELETE generation for one table bound to one entity type.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, trace};

use crate::coerce::Coercer;
use crate::connection::Session;
use crate::core::{Error, Result, SqlType, SqlTypeMapping, Value, ValueType};
use crate::driver::{DatabaseMetadata, ResultSet, Statement};
use crate::entity::{Entity, EntityMetadata, EntityRegistry, FieldDef};
use crate::mapping::assign_field;

/// Real name and SQL type of a table column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub real_name: String,
    pub sql_type: SqlType,
}

/// Column metadata keyed by lowercased column name.
pub type ColumnInfos = BTreeMap<String, ColumnInfo>;

/// Per-binding state, reset whenever the session changes its connection.
#[derive(Default)]
struct Binding {
    generation: Option<u64>,
    columns: Option<Arc<ColumnInfos>>,
    update_sql: Option<Arc<str>>,
    delete_sql: Option<Arc<str>>,
}

pub struct Table<T> {
    full_name: String,
    schema: Option<String>,
    name: String,
    metadata: Arc<EntityMetadata<T>>,
    sql_types: Arc<SqlTypeMapping>,
    binding: Mutex<Binding>,
}

impl<T: Entity> Table<T> {
    /// Bind `table` (`"name"` or `"schema.name"`) to `T`'s metadata from
    /// the global registry.
    pub fn new(table: &str) -> Result<Self> {
        Self::with_registry(table, EntityRegistry::global())
    }

    pub fn with_registry(table: &str, registry: &EntityRegistry) -> Result<Self> {
        Ok(Self::from_metadata(table, registry.fields_for::<T>()?))
    }

    pub fn from_metadata(table: &str, metadata: Arc<EntityMetadata<T>>) -> Self {
        let (schema, name) = match table.split_once('.') {
            Some((schema, name)) if !schema.is_empty() => (Some(schema.to_string()), name.to_string()),
            Some((_, name)) => (None, name.to_string()),
            None => (None, table.to_string()),
        };

        Self {
            full_name: table.to_string(),
            schema,
            name,
            metadata,
            sql_types: Arc::new(SqlTypeMapping::new()),
            binding: Mutex::new(Binding::default()),
        }
    }

    pub fn with_sql_type_mapping(mut self, sql_types: Arc<SqlTypeMapping>) -> Self {
        self.sql_types = sql_types;
        self
    }

    pub fn full_name(&self) -> &str {
        &self.full_name
    }

    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &Arc<EntityMetadata<T>> {
        &self.metadata
    }

    /// `select * from <table> <clause>`
    pub fn build_basic_select(&self, clause: &str) -> String {
        let clause = clause.trim();
        if clause.is_empty() {
            format!("select * from {}", self.full_name)
        } else {
            format!("select * from {} {}", self.full_name, clause)
        }
    }

    /// Forget column metadata and generated SQL.
    pub fn reset_binding(&self) -> Result<()> {
        *self.binding.lock()? = Binding::default();
        Ok(())
    }

    // ========================================================================
    // Column metadata
    // ========================================================================

    fn binding(&self, session: &Session) -> Result<MutexGuard<'_, Binding>> {
        let mut binding = self.binding.lock()?;
        if binding.generation != Some(session.generation()) {
            if binding.generation.is_some() {
                debug!(table = self.full_name.as_str(), "Connection changed, resetting table binding");
            }
            *binding = Binding {
                generation: Some(session.generation()),
                ..Binding::default()
            };
        }
        Ok(binding)
    }

    /// Column metadata of the bound table, loaded once per binding.
    pub fn columns(&self, session: &Session) -> Result<Arc<ColumnInfos>> {
        let mut binding = self.binding(session)?;
        if let Some(columns) = &binding.columns {
            return Ok(Arc::clone(columns));
        }

        let metadata = session.metadata()?;
        let columns = Arc::new(self.load_columns(&*metadata)?);
        binding.columns = Some(Arc::clone(&columns));
        Ok(columns)
    }

    fn load_columns(&self, metadata: &dyn DatabaseMetadata) -> Result<ColumnInfos> {
        let types: Vec<String> = metadata
            .table_types()?
            .into_iter()
            .filter(|table_type| table_type.to_lowercase().contains("table"))
            .collect();

        for schema in self.schema_candidates() {
            let tables = metadata.tables(schema.as_deref(), &types)?;
            let Some(found) = tables.iter().find(|table| table.name.eq_ignore_ascii_case(&self.name)) else {
                continue;
            };

            let columns = metadata.columns(found.schema.as_deref().or(schema.as_deref()), &found.name)?;
            debug!(
                table = self.full_name.as_str(),
                real_name = found.name.as_str(),
                columns = columns.len(),
                "Loaded column metadata"
            );
            return Ok(columns
                .into_iter()
                .map(|column| {
                    let key = column.name.to_lowercase();
                    let info = ColumnInfo {
                        real_name: column.name,
                        sql_type: column.sql_type,
                    };
                    (key, info)
                })
                .collect());
        }

        Err(Error::TableNotFound(self.full_name.clone()))
    }

    /// The schema as given, then lowercased, then uppercased.
    fn schema_candidates(&self) -> Vec<Option<String>> {
        let Some(schema) = &self.schema else {
            return vec![None];
        };
        let mut candidates = Vec::with_capacity(3);
        for candidate in [schema.clone(), schema.to_lowercase(), schema.to_uppercase()] {
            if !candidates.contains(&Some(candidate.clone())) {
                candidates.push(Some(candidate));
            }
        }
        candidates
    }

    /// Fields that have a column in the table, in field order.
    fn bound_fields<'a>(
        &'a self,
        columns: &'a ColumnInfos,
    ) -> impl Iterator<Item = (&'a FieldDef<T>, &'a ColumnInfo)> + 'a {
        self.metadata
            .iter()
            .filter_map(move |def| columns.get(def.key()).map(|info| (def, info)))
    }

    /// The field's value coerced to the type implied by the column.
    fn column_value(&self, coercer: &Coercer, entity: &T, def: &FieldDef<T>, info: &ColumnInfo) -> Result<Value> {
        let target = self.sql_types.value_type(info.sql_type);
        coercer.convert(def.get(entity), target).map_err(|err| {
            Error::mapping_caused_by(
                format!(
                    "Failed to coerce {}.{} for field {}",
                    self.full_name,
                    info.real_name,
                    def.key()
                ),
                err,
            )
        })
    }

    // ========================================================================
    // Insert
    // ========================================================================

    /// Insert one entity.
    ///
    /// Defaultable fields holding NULL are left out of the statement and read
    /// back from the generated keys afterwards.
    pub fn insert(&self, session: &mut Session, entity: &mut T) -> Result<u64> {
        let columns = self.columns(session)?;
        let coercer = Arc::clone(session.coercer());

        let mut names = Vec::new();
        let mut params = Vec::new();
        let mut generated = Vec::new();
        for (def, info) in self.bound_fields(&columns) {
            let value = self.column_value(&coercer, entity, def, info)?;
            if def.is_defaultable() && value.is_null() {
                generated.push((def, info));
                continue;
            }
            names.push(info.real_name.as_str());
            params.push((value, info.sql_type));
        }

        let sql = if names.is_empty() {
            format!("insert into {} default values", self.full_name)
        } else {
            format!(
                "insert into {} ({}) values ({})",
                self.full_name,
                names.join(","),
                placeholders(names.len())
            )
        };
        let mut statement = session.prepare(&sql)?;
        for (index, (value, sql_type)) in params.iter().enumerate() {
            bind_value(&mut statement, index + 1, value, *sql_type)?;
        }
        let rows = statement.execute_update()?;

        if !generated.is_empty() {
            let mut keys = statement.generated_keys()?;
            let read = self.read_generated_keys(&coercer, &mut *keys, entity, &generated);
            keys.close()?;
            read?;
        }

        trace!(table = self.full_name.as_str(), rows, "Inserted entity");
        Ok(rows)
    }

    fn read_generated_keys(
        &self,
        coercer: &Coercer,
        keys: &mut dyn ResultSet,
        entity: &mut T,
        generated: &[(&FieldDef<T>, &ColumnInfo)],
    ) -> Result<()> {
        if !keys.next()? {
            return Ok(());
        }
        for (def, info) in generated {
            if let Some(index) = keys.column_index(&info.real_name) {
                let value = keys.get(index)?;
                assign_field(coercer, self.metadata.name(), entity, def, value)?;
            }
        }
        Ok(())
    }

    /// Insert many entities with one multi-row statement.
    ///
    /// The column list is the union of the columns each row would insert on
    /// its own; rows missing a defaultable value bind NULL for it. Generated
    /// keys are not read back.
    pub fn insert_all(&self, session: &mut Session, entities: &[T]) -> Result<u64> {
        if entities.is_empty() {
            return Ok(0);
        }

        let columns = self.columns(session)?;
        let coercer = Arc::clone(session.coercer());
        let fields: Vec<_> = self.bound_fields(&columns).collect();

        let mut rows = Vec::with_capacity(entities.len());
        for entity in entities {
            let values = fields
                .iter()
                .map(|(def, info)| self.column_value(&coercer, entity, def, info))
                .collect::<Result<Vec<_>>>()?;
            rows.push(values);
        }

        let included: Vec<usize> = fields
            .iter()
            .enumerate()
            .filter(|(i, (def, _))| !def.is_defaultable() || rows.iter().any(|row| !row[*i].is_null()))
            .map(|(i, _)| i)
            .collect();

        // Every column left to the database: one default row per entity
        if included.is_empty() {
            let sql = format!("insert into {} default values", self.full_name);
            let mut statement = session.prepare(&sql)?;
            let mut inserted = 0;
            for _ in &rows {
                inserted += statement.execute_update()?;
            }
            trace!(table = self.full_name.as_str(), rows = inserted, "Inserted default rows");
            return Ok(inserted);
        }

        let names: Vec<&str> = included.iter().map(|&i| fields[i].1.real_name.as_str()).collect();
        let tuple = format!("({})", placeholders(included.len()));
        let sql = format!(
            "insert into {} ({}) values {}",
            self.full_name,
            names.join(","),
            vec![tuple; rows.len()].join(",")
        );

        let mut statement = session.prepare(&sql)?;
        let mut index = 1;
        for row in &rows {
            for &i in &included {
                bind_value(&mut statement, index, &row[i], fields[i].1.sql_type)?;
                index += 1;
            }
        }
        let inserted = statement.execute_update()?;
        trace!(table = self.full_name.as_str(), rows = inserted, "Inserted entities");
        Ok(inserted)
    }

    // ========================================================================
    // Update / Delete
    // ========================================================================

    /// `update <table> set <non-key>=?,... where <key>=? and ...`
    pub fn update_sql(&self, session: &Session) -> Result<Arc<str>> {
        let columns = self.columns(session)?;
        let mut binding = self.binding(session)?;
        if let Some(sql) = &binding.update_sql {
            return Ok(Arc::clone(sql));
        }

        let mut sets = Vec::new();
        let mut keys = Vec::new();
        for (def, info) in self.bound_fields(&columns) {
            let assignment = format!("{}=?", info.real_name);
            if def.is_primary_key() {
                keys.push(assignment);
            } else {
                sets.push(assignment);
            }
        }
        self.require_primary_key(&keys, "update")?;
        if sets.is_empty() {
            return Err(Error::Configuration(format!(
                "{} has no columns to update in the table [{}]",
                self.metadata.name(),
                self.full_name
            )));
        }

        let sql: Arc<str> = Arc::from(format!(
            "update {} set {} where {}",
            self.full_name,
            sets.join(","),
            keys.join(" and ")
        ));
        binding.update_sql = Some(Arc::clone(&sql));
        Ok(sql)
    }

    /// `delete from <table> where <key>=? and ...`
    pub fn delete_sql(&self, session: &Session) -> Result<Arc<str>> {
        let columns = self.columns(session)?;
        let mut binding = self.binding(session)?;
        if let Some(sql) = &binding.delete_sql {
            return Ok(Arc::clone(sql));
        }

        let keys: Vec<String> = self
            .bound_fields(&columns)
            .filter(|(def, _)| def.is_primary_key())
            .map(|(_, info)| format!("{}=?", info.real_name))
            .collect();
        self.require_primary_key(&keys, "delete")?;

        let sql: Arc<str> = Arc::from(format!("delete from {} where {}", self.full_name, keys.join(" and ")));
        binding.delete_sql = Some(Arc::clone(&sql));
        Ok(sql)
    }

    fn require_primary_key(&self, keys: &[String], operation: &str) -> Result<()> {
        if keys.is_empty() {
            return Err(Error::Configuration(format!(
                "At least one field must be identified as a primary key in order to {} rows in the table [{}]",
                operation, self.full_name
            )));
        }
        Ok(())
    }

    pub fn update(&self, session: &mut Session, entity: &T) -> Result<u64> {
        let sql = self.update_sql(session)?;
        let columns = self.columns(session)?;
        let coercer = Arc::clone(session.coercer());

        let mut values = Vec::new();
        let mut keys = Vec::new();
        for (def, info) in self.bound_fields(&columns) {
            let value = (self.column_value(&coercer, entity, def, info)?, info.sql_type);
            if def.is_primary_key() {
                keys.push(value);
            } else {
                values.push(value);
            }
        }

        let mut statement = session.prepare(&sql)?;
        for (index, (value, sql_type)) in values.iter().chain(keys.iter()).enumerate() {
            bind_value(&mut statement, index + 1, value, *sql_type)?;
        }
        Ok(statement.execute_update()?)
    }

    /// Returns whether a row was deleted.
    pub fn delete(&self, session: &mut Session, entity: &T) -> Result<bool> {
        let sql = self.delete_sql(session)?;
        let columns = self.columns(session)?;
        let coercer = Arc::clone(session.coercer());

        let mut statement = session.prepare(&sql)?;
        let keys = self.bound_fields(&columns).filter(|(def, _)| def.is_primary_key());
        for (index, (def, info)) in keys.enumerate() {
            let value = self.column_value(&coercer, entity, def, info)?;
            bind_value(&mut statement, index + 1, &value, info.sql_type)?;
        }
        Ok(statement.execute_update()? > 0)
    }
}

fn placeholders(count: usize) -> String {
    vec!["?"; count].join(",")
}

/// NULL binds as a typed NULL and arrays through `bind_array`.
pub(crate) fn bind_value(statement: &mut dyn Statement, index: usize, value: &Value, sql_type: SqlType) -> Result<()> {
    match value {
        Value::Null => statement.bind_null(index, sql_type)?,
        Value::Array(elements) => statement.bind_array(index, element_type_name(elements), elements)?,
        _ => statement.bind(index, value, sql_type)?,
    }
    Ok(())
}

/// Database type name for an array, from its first element.
fn element_type_name(elements: &[Value]) -> &'static str {
    match elements.first().and_then(Value::value_type) {
        Some(ValueType::Uuid) => "uuid",
        Some(ValueType::Instant | ValueType::Timestamp) => "timestamptz",
        Some(ValueType::Short | ValueType::Int) => "int",
        Some(ValueType::Long) => "bigint",
        Some(ValueType::Double | ValueType::Float) => "float8",
        Some(ValueType::Decimal) => "numeric",
        Some(ValueType::Bool) => "boolean",
        _ => "varchar",
    }
}

impl<T> std::fmt::Debug for Table<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("full_name", &self.full_name)
            .field("entity", &self.metadata.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::OrmConfig;
    use crate::driver::memory::{MemoryColumn, MemoryDatabase};
    use crate::entity::EntityBuilder;

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Dept {
        id: Option<i64>,
        name: String,
        tags: Vec<String>,
    }

    impl Entity for Dept {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder
                .field("id", |d: &Dept| &d.id, |d: &mut Dept| &mut d.id)
                .primary_key()
                .defaultable();
            builder.field("name", |d: &Dept| &d.name, |d: &mut Dept| &mut d.name);
            builder.field("tags", |d: &Dept| &d.tags, |d: &mut Dept| &mut d.tags);
        }
    }

    #[derive(Debug, Default)]
    struct Keyless {
        name: String,
    }

    impl Entity for Keyless {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.field("name", |k: &Keyless| &k.name, |k: &mut Keyless| &mut k.name);
        }
    }

    fn setup() -> (MemoryDatabase, Session) {
        let db = MemoryDatabase::new();
        db.create_table(
            "HR.Dept",
            vec![
                MemoryColumn::new("ID", SqlType::BigInt).auto_increment(),
                MemoryColumn::new("Name", SqlType::Varchar),
                MemoryColumn::new("Tags", SqlType::Array),
                MemoryColumn::new("Extra", SqlType::Integer),
            ],
        )
        .unwrap();
        let session = Session::new("table-test", OrmConfig::default())
            .unwrap()
            .with_connection(db.connect());
        (db, session)
    }

    #[test]
    fn test_schema_candidates() {
        let table = Table::<Dept>::new("Hr.dept").unwrap();
        assert_eq!(
            table.schema_candidates(),
            vec![Some("Hr".to_string()), Some("hr".to_string()), Some("HR".to_string())]
        );
        assert_eq!(Table::<Dept>::new("dept").unwrap().schema_candidates(), vec![None]);
    }

    #[test]
    fn test_columns_found_with_uppercased_schema() {
        let (_db, session) = setup();
        let table = Table::<Dept>::new("hr.dept").unwrap();
        let columns = table.columns(&session).unwrap();
        assert_eq!(columns["name"].real_name, "Name");
        assert_eq!(columns["id"].sql_type, SqlType::BigInt);
    }

    #[test]
    fn test_unknown_table() {
        let (_db, session) = setup();
        let table = Table::<Dept>::new("hr.missing").unwrap();
        assert!(matches!(table.columns(&session), Err(Error::TableNotFound(name)) if name == "hr.missing"));
    }

    #[test]
    fn test_update_and_delete_sql() {
        let (_db, session) = setup();
        let table = Table::<Dept>::new("hr.dept").unwrap();
        assert_eq!(&*table.update_sql(&session).unwrap(), "update hr.dept set Name=?,Tags=? where ID=?");
        assert_eq!(&*table.delete_sql(&session).unwrap(), "delete from hr.dept where ID=?");

        let first = table.update_sql(&session).unwrap();
        let second = table.update_sql(&session).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_missing_primary_key() {
        let db = MemoryDatabase::new();
        db.create_table("keyless", vec![MemoryColumn::new("name", SqlType::Varchar)])
            .unwrap();
        let session = Session::new("t", OrmConfig::default())
            .unwrap()
            .with_connection(db.connect());

        let table = Table::<Keyless>::new("keyless").unwrap();
        let err = table.update_sql(&session).unwrap_err();
        assert!(matches!(err, Error::Configuration(msg) if msg.contains("[keyless]")));
        assert!(matches!(table.delete_sql(&session), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_insert_reads_generated_key() {
        let (db, mut session) = setup();
        let table = Table::<Dept>::new("hr.dept").unwrap();
        let mut dept = Dept {
            id: None,
            name: "Ops".into(),
            tags: vec!["core".into()],
        };

        assert_eq!(table.insert(&mut session, &mut dept).unwrap(), 1);
        assert_eq!(dept.id, Some(1));

        let rows = db.rows("hr.dept").unwrap();
        assert_eq!(rows[0][2], Value::Array(vec![Value::Text("core".into())]));
    }

    #[test]
    fn test_update_and_delete_round_trip() {
        let (db, mut session) = setup();
        let table = Table::<Dept>::new("hr.dept").unwrap();
        let mut dept = Dept {
            name: "Ops".into(),
            ..Dept::default()
        };
        table.insert(&mut session, &mut dept).unwrap();

        dept.name = "Sales".into();
        assert_eq!(table.update(&mut session, &dept).unwrap(), 1);
        assert_eq!(db.rows("hr.dept").unwrap()[0][1], Value::Text("Sales".into()));

        assert!(table.delete(&mut session, &dept).unwrap());
        assert!(!table.delete(&mut session, &dept).unwrap());
    }

    #[test]
    fn test_insert_all_populates_no_keys() {
        let (db, mut session) = setup();
        let table = Table::<Dept>::new("hr.dept").unwrap();
        let depts = vec![
            Dept {
                id: Some(10),
                name: "A".into(),
                tags: vec![],
            },
            Dept {
                id: None,
                name: "B".into(),
                tags: vec![],
            },
        ];

        assert_eq!(table.insert_all(&mut session, &depts).unwrap(), 2);
        let rows = db.rows("hr.dept").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0][0], Value::Long(10));
        assert_eq!(depts[1].id, None);
        assert_eq!(table.insert_all(&mut session, &[]).unwrap(), 0);
    }

    #[test]
    fn test_insert_with_only_generated_columns() {
        let (db, mut session) = setup();
        db.create_table("HR.Seq", vec![MemoryColumn::new("ID", SqlType::BigInt).auto_increment()])
            .unwrap();
        let table = Table::<Dept>::new("hr.seq").unwrap();

        let mut first = Dept::default();
        assert_eq!(table.insert(&mut session, &mut first).unwrap(), 1);
        assert_eq!(first.id, Some(1));

        assert_eq!(table.insert_all(&mut session, &[Dept::default(), Dept::default()]).unwrap(), 2);
        let rows = db.rows("hr.seq").unwrap();
        assert_eq!(rows, vec![vec![Value::Long(1)], vec![Value::Long(2)], vec![Value::Long(3)]]);
    }

    #[test]
    fn test_binding_resets_on_connection_change() {
        let (db, mut session) = setup();
        let table = Table::<Dept>::new("hr.dept").unwrap();
        let before = table.columns(&session).unwrap();

        session.set_connection(Box::new(db.connect()));
        let after = table.columns(&session).unwrap();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(*before, *after);
    }

    #[test]
    fn test_build_basic_select() {
        let table = Table::<Dept>::new("hr.dept").unwrap();
        assert_eq!(table.build_basic_select("  "), "select * from hr.dept");
        assert_eq!(table.build_basic_select("where id=?"), "select * from hr.dept where id=?");
    }

    #[test]
    fn test_array_element_type_names() {
        assert_eq!(element_type_name(&[Value::Int(1)]), "int");
        assert_eq!(element_type_name(&[Value::Uuid(uuid::Uuid::nil())]), "uuid");
        assert_eq!(element_type_name(&[]), "varchar");
    }
}
