//! Per-entity gateways over a shared session.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::{Arc, MutexGuard};

use crate::connection::{Session, SharedSession, StatementHandle};
use crate::core::{ColumnMeta, DbResult, Error, Result, SqlType, Value};
use crate::driver::{Connection, ResultSet, Statement};
use crate::entity::{Entity, EntityRegistry};
use crate::mapping::{EntityCursor, RowMapper};
use crate::table::{Table, bind_value};

/// Everything needed to read and write one entity type.
///
/// ```
/// use beanmap::{Entity, EntityBuilder, Home, OrmConfig, Session};
/// use beanmap::core::SqlType;
/// use beanmap::driver::memory::{MemoryColumn, MemoryDatabase};
///
/// #[derive(Debug, Default)]
/// struct Dept {
///     id: Option<i64>,
///     name: String,
/// }
///
/// impl Entity for Dept {
///     fn describe(builder: &mut EntityBuilder<Self>) {
///         builder
///             .field("id", |d: &Dept| &d.id, |d: &mut Dept| &mut d.id)
///             .primary_key()
///             .defaultable();
///         builder.field("name", |d: &Dept| &d.name, |d: &mut Dept| &mut d.name);
///     }
/// }
///
/// let db = MemoryDatabase::new();
/// db.create_table("dept", vec![
///     MemoryColumn::new("id", SqlType::BigInt).auto_increment(),
///     MemoryColumn::new("name", SqlType::Varchar),
/// ]).unwrap();
///
/// let session = Session::new("docs", OrmConfig::default())
///     .unwrap()
///     .with_connection(db.connect())
///     .into_shared();
/// let home = Home::<Dept>::new(session, "dept").unwrap();
///
/// let mut dept = Dept { id: None, name: "Ops".into() };
/// home.insert(&mut dept).unwrap();
/// assert_eq!(dept.id, Some(1));
///
/// let found = home.find_unique("where id=?", &[1i64.into()]).unwrap();
/// assert_eq!(found.unwrap().name, "Ops");
/// ```
pub struct Home<T> {
    session: SharedSession,
    table: Table<T>,
    mapper: RowMapper<T>,
}

impl<T: Entity> Home<T> {
    pub fn new(session: SharedSession, table: &str) -> Result<Self> {
        Self::with_registry(session, table, EntityRegistry::global())
    }

    pub fn with_registry(session: SharedSession, table: &str, registry: &EntityRegistry) -> Result<Self> {
        let metadata = registry.fields_for::<T>()?;
        let mapper = {
            let guard = session.lock()?;
            RowMapper::from_metadata(Arc::clone(&metadata), Arc::clone(guard.coercer()))
                .allow_missing_columns(guard.config().allow_missing_columns)
                .auto_close(true)
        };

        Ok(Self {
            table: Table::from_metadata(table, metadata),
            session,
            mapper,
        })
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    pub fn table(&self) -> &Table<T> {
        &self.table
    }

    pub fn mapper(&self) -> &RowMapper<T> {
        &self.mapper
    }

    pub fn schema_name(&self) -> Option<&str> {
        self.table.schema()
    }

    pub fn table_name(&self) -> &str {
        self.table.name()
    }

    /// `name` prefixed with this home's schema, if it has one.
    pub fn qualified_name(&self, name: &str) -> String {
        match self.table.schema() {
            Some(schema) => format!("{}.{}", schema, name),
            None => name.to_string(),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        Ok(self.session.lock()?)
    }

    pub fn insert(&self, entity: &mut T) -> Result<u64> {
        self.table.insert(&mut *self.lock()?, entity)
    }

    /// One multi-row INSERT. Generated keys are not read back.
    pub fn insert_all(&self, entities: &[T]) -> Result<u64> {
        self.table.insert_all(&mut *self.lock()?, entities)
    }

    pub fn update(&self, entity: &T) -> Result<u64> {
        self.table.update(&mut *self.lock()?, entity)
    }

    pub fn delete(&self, entity: &T) -> Result<bool> {
        self.table.delete(&mut *self.lock()?, entity)
    }

    pub fn build_basic_select(&self, clause: &str) -> String {
        self.table.build_basic_select(clause)
    }

    pub fn prepare(&self, sql: &str) -> Result<StatementHandle> {
        self.lock()?.prepare(sql)
    }

    pub fn prepare_call(&self, sql: &str) -> Result<StatementHandle> {
        self.lock()?.prepare_call(sql)
    }

    /// Run `sql` with positional `params` and map every row.
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<T>> {
        let mut statement = self.execute(sql, params)?;
        let mut rs = statement.execute_query()?;
        self.mapper.all(&mut *rs)
    }

    /// `select * from <table> <clause>`, every row.
    pub fn find(&self, clause: &str, params: &[Value]) -> Result<Vec<T>> {
        self.query(&self.build_basic_select(clause), params)
    }

    pub fn find_first(&self, clause: &str, params: &[Value]) -> Result<Option<T>> {
        let mut statement = self.execute(&self.build_basic_select(clause), params)?;
        let mut rs = statement.execute_query()?;
        self.mapper.first(&mut *rs, false)
    }

    /// At most one row; more is a [`Error::Mapping`].
    pub fn find_unique(&self, clause: &str, params: &[Value]) -> Result<Option<T>> {
        let mut statement = self.execute(&self.build_basic_select(clause), params)?;
        let mut rs = statement.execute_query()?;
        self.mapper.unique(&mut *rs, false)
    }

    /// Lazily map the rows of `select * from <table> <clause>`.
    ///
    /// The cursor keeps the statement alive until it is exhausted or dropped.
    pub fn iter(&self, clause: &str, params: &[Value]) -> Result<EntityCursor<T>> {
        let mut statement = self.execute(&self.build_basic_select(clause), params)?;
        let rs = statement.execute_query()?;
        Ok(self.mapper.iter(Box::new(StatementBoundResultSet { rs, statement })))
    }

    fn execute(&self, sql: &str, params: &[Value]) -> Result<StatementHandle> {
        let mut statement = self.prepare(sql)?;
        for (index, value) in params.iter().enumerate() {
            bind_value(&mut statement, index + 1, value, SqlType::for_value(value))?;
        }
        Ok(statement)
    }
}

impl<T> std::fmt::Debug for Home<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Home").field("table", &self.table).finish()
    }
}

/// A result set that owns the statement it came from.
struct StatementBoundResultSet {
    rs: Box<dyn ResultSet>,
    statement: StatementHandle,
}

impl ResultSet for StatementBoundResultSet {
    fn columns(&self) -> &[ColumnMeta] {
        self.rs.columns()
    }

    fn next(&mut self) -> DbResult<bool> {
        self.rs.next()
    }

    fn get(&self, index: usize) -> DbResult<Value> {
        self.rs.get(index)
    }

    fn get_array(&self, index: usize) -> DbResult<Option<Vec<Value>>> {
        self.rs.get_array(index)
    }

    fn column_index(&self, name: &str) -> Option<usize> {
        self.rs.column_index(name)
    }

    fn statement(&self) -> Option<Box<dyn Statement>> {
        self.rs.statement()
    }

    fn close(&mut self) -> DbResult<()> {
        self.rs.close()?;
        self.statement.close()
    }

    fn is_closed(&self) -> bool {
        self.rs.is_closed()
    }
}

/// Homes of several entity types sharing one session.
pub struct HomeGroup {
    session: SharedSession,
    homes: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HomeGroup {
    pub fn new(session: SharedSession) -> Self {
        Self {
            session,
            homes: HashMap::new(),
        }
    }

    pub fn session(&self) -> &SharedSession {
        &self.session
    }

    /// Create and register the home of `T` over this group's session.
    pub fn add<T: Entity>(&mut self, table: &str) -> Result<&Home<T>> {
        let home = Home::<T>::new(SharedSession::clone(&self.session), table)?;
        self.add_home(home)?;
        self.home::<T>()
            .ok_or_else(|| Error::Configuration(format!("home for {} was not registered", T::entity_name())))
    }

    /// Register `home`, replacing any home of the same entity type. The home
    /// must use this group's session.
    pub fn add_home<T: Entity>(&mut self, home: Home<T>) -> Result<()> {
        if !Arc::ptr_eq(home.session(), &self.session) {
            return Err(Error::Configuration(format!(
                "home for {} uses a different session than its group",
                T::entity_name()
            )));
        }
        self.homes.insert(TypeId::of::<T>(), Box::new(home));
        Ok(())
    }

    pub fn home<T: Entity>(&self) -> Option<&Home<T>> {
        self.homes
            .get(&TypeId::of::<T>())
            .and_then(|home| home.downcast_ref::<Home<T>>())
    }

    pub fn len(&self) -> usize {
        self.homes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.homes.is_empty()
    }

    /// Swap the connection of every home at once.
    pub fn set_connection(&self, connection: Box<dyn Connection>) -> Result<Option<Box<dyn Connection>>> {
        Ok(self.session.lock()?.set_connection(connection))
    }

    pub fn close(&self) -> Result<()> {
        self.session.lock()?.close()
    }
}

impl std::fmt::Debug for HomeGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HomeGroup").field("homes", &self.homes.len()).finish()
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
    }

    impl Entity for Dept {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder
                .field("id", |d: &Dept| &d.id, |d: &mut Dept| &mut d.id)
                .primary_key()
                .defaultable();
            builder.field("name", |d: &Dept| &d.name, |d: &mut Dept| &mut d.name);
        }
    }

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Employee {
        id: Option<i64>,
        dept_id: i64,
    }

    impl Entity for Employee {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder
                .field("id", |e: &Employee| &e.id, |e: &mut Employee| &mut e.id)
                .primary_key()
                .defaultable();
            builder.field("dept_id", |e: &Employee| &e.dept_id, |e: &mut Employee| &mut e.dept_id);
        }
    }

    fn setup(config: OrmConfig) -> (MemoryDatabase, SharedSession) {
        let db = MemoryDatabase::new();
        db.create_table(
            "app.dept",
            vec![
                MemoryColumn::new("id", SqlType::BigInt).auto_increment(),
                MemoryColumn::new("name", SqlType::Varchar),
            ],
        )
        .unwrap();
        db.create_table(
            "app.employee",
            vec![
                MemoryColumn::new("id", SqlType::BigInt).auto_increment(),
                MemoryColumn::new("dept_id", SqlType::BigInt),
            ],
        )
        .unwrap();
        let session = Session::new("home-test", config)
            .unwrap()
            .with_connection(db.connect())
            .into_shared();
        (db, session)
    }

    fn seed(home: &Home<Dept>, names: &[&str]) {
        for name in names {
            let mut dept = Dept {
                id: None,
                name: name.to_string(),
            };
            home.insert(&mut dept).unwrap();
        }
    }

    #[test]
    fn test_find_variants() {
        let (_db, session) = setup(OrmConfig::default());
        let home = Home::<Dept>::new(session, "app.dept").unwrap();
        seed(&home, &["Ops", "Sales", "Ops"]);

        assert_eq!(home.find("order by id", &[]).unwrap().len(), 3);
        let first = home.find_first("where name=? order by id", &["Ops".into()]).unwrap();
        assert_eq!(first.unwrap().id, Some(1));
        assert!(home.find_unique("where name=?", &["Ops".into()]).is_err());
        assert!(home.find_unique("where name=?", &["HR".into()]).unwrap().is_none());
    }

    #[test]
    fn test_iter_with_owned_statements() {
        let (db, session) = setup(OrmConfig::new().cache_enabled(false));
        let home = Home::<Dept>::new(session, "app.dept").unwrap();
        seed(&home, &["Ops", "Sales"]);

        let closed_before = db.stats().closed;
        let names: Vec<String> = home
            .iter("order by id", &[])
            .unwrap()
            .map(|dept| dept.unwrap().name)
            .collect();
        assert_eq!(names, vec!["Ops", "Sales"]);
        assert_eq!(db.stats().closed, closed_before + 1);
    }

    #[test]
    fn test_cached_statements_survive_auto_close() {
        let (db, session) = setup(OrmConfig::default());
        let home = Home::<Dept>::new(SharedSession::clone(&session), "app.dept").unwrap();
        seed(&home, &["Ops"]);

        home.find("", &[]).unwrap();
        home.find("", &[]).unwrap();
        assert_eq!(db.stats().closed, 0);

        let guard = session.lock().unwrap();
        let cache = guard.cache().unwrap();
        let conn = guard.connection().unwrap();
        assert_eq!(cache.access_count(conn, "select * from app.dept"), Some(2));
    }

    #[test]
    fn test_qualified_name() {
        let (_db, session) = setup(OrmConfig::default());
        let home = Home::<Dept>::new(session, "app.dept").unwrap();
        assert_eq!(home.qualified_name("employee"), "app.employee");
        assert_eq!(home.schema_name(), Some("app"));
        assert_eq!(home.table_name(), "dept");
    }

    #[test]
    fn test_group_shares_session() {
        let (db, session) = setup(OrmConfig::default());
        let mut group = HomeGroup::new(session);
        group.add::<Dept>("app.dept").unwrap();
        group.add::<Employee>("app.employee").unwrap();
        assert_eq!(group.len(), 2);

        let mut dept = Dept {
            id: None,
            name: "Ops".into(),
        };
        group.home::<Dept>().unwrap().insert(&mut dept).unwrap();
        let mut employee = Employee {
            id: None,
            dept_id: dept.id.unwrap(),
        };
        group.home::<Employee>().unwrap().insert(&mut employee).unwrap();
        assert_eq!(employee.id, Some(1));

        group.set_connection(Box::new(db.connect())).unwrap();
        let found = group.home::<Dept>().unwrap().find("", &[]).unwrap();
        assert_eq!(found, vec![dept]);
    }

    #[test]
    fn test_group_rejects_foreign_session() {
        let (_db, session) = setup(OrmConfig::default());
        let (_other_db, other) = setup(OrmConfig::default());
        let mut group = HomeGroup::new(session);
        let home = Home::<Dept>::new(other, "app.dept").unwrap();
        assert!(matches!(group.add_home(home), Err(Error::Configuration(_))));
    }
}
