use tracing::warn;

use super::{RowMapper, close_with_statement};
use crate::core::Result;
use crate::driver::ResultSet;
use crate::entity::Entity;

/// Single-pass iterator over the entities of a result set.
///
/// The result set and its statement are closed when the rows run out, when
/// reading fails, or when the cursor is dropped.
pub struct EntityCursor<T: Entity> {
    mapper: RowMapper<T>,
    rs: Option<Box<dyn ResultSet>>,
}

impl<T: Entity> EntityCursor<T> {
    pub(crate) fn new(mapper: RowMapper<T>, rs: Box<dyn ResultSet>) -> Self {
        Self { mapper, rs: Some(rs) }
    }

    pub fn is_closed(&self) -> bool {
        self.rs.is_none()
    }

    /// Close the result set and its statement. Closing twice is a no-op.
    pub fn close(&mut self) -> Result<()> {
        match self.rs.take() {
            Some(mut rs) => close_with_statement(&mut *rs),
            None => Ok(()),
        }
    }
}

impl<T: Entity> Iterator for EntityCursor<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Self::Item> {
        let rs = self.rs.as_mut()?;
        match rs.next() {
            Ok(true) => Some(self.mapper.map_row(&**rs)),
            Ok(false) => self.close().err().map(Err),
            Err(err) => {
                if let Err(close_err) = self.close() {
                    warn!(error = %close_err, "Failed to close result set after read error");
                }
                Some(Err(err.into()))
            }
        }
    }
}

impl<T: Entity> Drop for EntityCursor<T> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "Failed to close result set");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::coerce::Coercer;
    use crate::core::{SqlType, Value};
    use crate::driver::memory::{MemoryColumn, MemoryDatabase};
    use crate::driver::{Connection, PrepareOptions, Statement};
    use crate::entity::{EntityBuilder, EntityRegistry};

    #[derive(Debug, Default)]
    struct Item {
        id: i64,
    }

    impl Entity for Item {
        fn describe(builder: &mut EntityBuilder<Self>) {
            builder.field("id", |e: &Item| &e.id, |e: &mut Item| &mut e.id);
        }
    }

    fn seeded() -> (MemoryDatabase, Box<dyn Statement>) {
        let db = MemoryDatabase::new();
        db.create_table("items", vec![MemoryColumn::new("id", SqlType::BigInt).auto_increment()])
            .unwrap();
        let mut conn = db.connect();
        for _ in 0..3 {
            let mut insert = conn
                .prepare("insert into items(id) values(?)", PrepareOptions::default())
                .unwrap();
            insert.bind_null(1, SqlType::BigInt).unwrap();
            insert.execute_update().unwrap();
        }
        let select = conn
            .prepare("select * from items order by id", PrepareOptions::default())
            .unwrap();
        (db, select)
    }

    fn mapper() -> RowMapper<Item> {
        RowMapper::with_registry(&EntityRegistry::new(), Arc::new(Coercer::new())).unwrap()
    }

    #[test]
    fn test_cursor_is_lazy_and_closes_on_exhaustion() {
        let (_db, mut select) = seeded();
        let mut cursor = mapper().iter(select.execute_query().unwrap());

        assert_eq!(cursor.next().unwrap().unwrap().id, 1);
        assert!(!cursor.is_closed());
        let rest: Vec<i64> = cursor.by_ref().map(|item| item.unwrap().id).collect();
        assert_eq!(rest, vec![2, 3]);
        assert!(cursor.is_closed());
        assert!(select.is_closed());
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_close_is_idempotent_and_drop_closes() {
        let (_db, mut select) = seeded();
        let mut cursor = mapper().iter(select.execute_query().unwrap());
        cursor.close().unwrap();
        cursor.close().unwrap();
        assert!(select.is_closed());

        let (_db, mut select) = seeded();
        let cursor = mapper().iter(select.execute_query().unwrap());
        drop(cursor);
        assert!(select.is_closed());
    }
}
