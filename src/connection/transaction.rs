use std::sync::MutexGuard;

use tracing::warn;

use super::{Session, SharedSession};
use crate::core::Result;
use crate::driver::Savepoint;

/// Explicit transaction over a shared session.
///
/// Turns auto-commit off on begin. Rolls back when dropped without
/// [`commit`](Transaction::commit) or [`rollback`](Transaction::rollback);
/// either way auto-commit is restored afterwards.
///
/// ```
/// use beanmap::{OrmConfig, Session, Transaction};
/// use beanmap::driver::memory::MemoryDatabase;
///
/// let db = MemoryDatabase::new();
/// let session = Session::new("docs", OrmConfig::default())
///     .unwrap()
///     .with_connection(db.connect())
///     .into_shared();
///
/// let tx = Transaction::begin(&session).unwrap();
/// tx.commit().unwrap();
/// ```
pub struct Transaction {
    session: SharedSession,
    restore_auto_commit: bool,
    finished: bool,
}

impl Transaction {
    pub fn begin(session: &SharedSession) -> Result<Self> {
        let restore_auto_commit = {
            let mut guard = session.lock()?;
            let connection = guard.connection_mut()?;
            let previous = connection.auto_commit();
            connection.set_auto_commit(false)?;
            previous
        };

        Ok(Self {
            session: SharedSession::clone(session),
            restore_auto_commit,
            finished: false,
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        Ok(self.session.lock()?)
    }

    pub fn savepoint(&self, name: Option<&str>) -> Result<Savepoint> {
        Ok(self.lock()?.connection_mut()?.set_savepoint(name)?)
    }

    pub fn rollback_to(&self, savepoint: &Savepoint) -> Result<()> {
        Ok(self.lock()?.connection_mut()?.rollback_to_savepoint(savepoint)?)
    }

    pub fn release(&self, savepoint: &Savepoint) -> Result<()> {
        Ok(self.lock()?.connection_mut()?.release_savepoint(savepoint)?)
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        self.finish(|session| Ok(session.connection_mut()?.commit()?))
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.finish(|session| Ok(session.connection_mut()?.rollback()?))
    }

    fn finish(&self, end: impl FnOnce(&mut Session) -> Result<()>) -> Result<()> {
        let mut session = self.lock()?;
        let ended = end(&mut session);
        if self.restore_auto_commit {
            session.connection_mut()?.set_auto_commit(true)?;
        }
        ended
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Err(err) = self.finish(|session| Ok(session.connection_mut()?.rollback()?)) {
            warn!(error = %err, "Failed to roll back abandoned transaction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::config::OrmConfig;
    use crate::core::SqlType;
    use crate::driver::Statement;
    use crate::driver::memory::{MemoryColumn, MemoryDatabase};

    fn setup() -> (MemoryDatabase, SharedSession) {
        let db = MemoryDatabase::new();
        db.create_table(
            "dept",
            vec![
                MemoryColumn::new("id", SqlType::BigInt).auto_increment(),
                MemoryColumn::new("name", SqlType::Varchar),
            ],
        )
        .unwrap();
        let session = Session::new("tx", OrmConfig::default())
            .unwrap()
            .with_connection(db.connect())
            .into_shared();
        (db, session)
    }

    fn insert(session: &SharedSession, name: &str) {
        let mut guard = session.lock().unwrap();
        let mut stmt = guard.prepare("insert into dept(name) values(?)").unwrap();
        stmt.bind(1, &name.into(), SqlType::Varchar).unwrap();
        stmt.execute_update().unwrap();
    }

    #[test]
    fn test_commit_keeps_rows() {
        let (db, session) = setup();
        let tx = Transaction::begin(&session).unwrap();
        insert(&session, "Sales");
        tx.commit().unwrap();
        assert_eq!(db.row_count("dept").unwrap(), 1);
        assert!(session.lock().unwrap().connection().unwrap().auto_commit());
    }

    #[test]
    fn test_drop_rolls_back() {
        let (db, session) = setup();
        {
            let _tx = Transaction::begin(&session).unwrap();
            insert(&session, "Sales");
            assert_eq!(db.row_count("dept").unwrap(), 1);
        }
        assert_eq!(db.row_count("dept").unwrap(), 0);
    }

    #[test]
    fn test_savepoint_partial_rollback() {
        let (db, session) = setup();
        let tx = Transaction::begin(&session).unwrap();
        insert(&session, "Sales");
        let savepoint = tx.savepoint(Some("after_sales")).unwrap();
        insert(&session, "Ops");
        tx.rollback_to(&savepoint).unwrap();
        tx.commit().unwrap();
        assert_eq!(db.row_count("dept").unwrap(), 1);
    }
}
