//! The keyspace: logical databases of tagged values.
//!
//! Values and expiry deadlines live in two maps guarded by separate locks,
//! matching how commands touch them: most reads never look at expiries.
//! Expired keys are not actively removed; they are filtered out on read
//! and overwritten on the next write of the same key.

use marlin_common::{MarlinError, Result};
use marlin_stream::Stream;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

/// A value stored in the keyspace.
#[derive(Clone)]
pub enum Value {
    String(String),
    Stream(Arc<Stream>),
}

impl Value {
    /// The name reported by the TYPE command.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::String(_) => "string",
            Value::Stream(_) => "stream",
        }
    }
}

/// One logical database.
#[derive(Default)]
pub struct Database {
    values: RwLock<HashMap<String, Value>>,
    expiries: RwLock<HashMap<String, SystemTime>>,
}

impl Database {
    /// Returns the live value for `key`, treating an expired key as
    /// missing.
    pub fn get(&self, key: &str) -> Option<Value> {
        let value = self.values.read().get(key).cloned()?;
        if let Some(deadline) = self.expiries.read().get(key) {
            if *deadline <= SystemTime::now() {
                return None;
            }
        }
        Some(value)
    }

    /// Returns the string stored under `key`, or an error when the key
    /// holds a stream.
    pub fn get_string(&self, key: &str) -> Result<Option<String>> {
        match self.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s)),
            Some(Value::Stream(_)) => Err(MarlinError::WrongType),
        }
    }

    /// Stores a string under `key`, replacing any previous value and
    /// expiry.
    pub fn set_string(&self, key: &str, value: String, expires_at: Option<SystemTime>) {
        // Take both locks in a fixed order so a concurrent reader never
        // pairs the new value with a stale deadline.
        let mut values = self.values.write();
        let mut expiries = self.expiries.write();
        values.insert(key.to_string(), Value::String(value));
        match expires_at {
            Some(deadline) => {
                expiries.insert(key.to_string(), deadline);
            }
            None => {
                expiries.remove(key);
            }
        }
    }

    /// Returns the stream under `key`, or an error when the key holds
    /// something else. Streams do not expire.
    pub fn get_stream(&self, key: &str) -> Result<Option<Arc<Stream>>> {
        match self.values.read().get(key) {
            None => Ok(None),
            Some(Value::Stream(stream)) => Ok(Some(Arc::clone(stream))),
            Some(Value::String(_)) => Err(MarlinError::WrongType),
        }
    }

    /// Returns the stream under `key`, creating an empty one if the key is
    /// unused.
    ///
    /// The stream is created before the first append is validated, so a
    /// failed append can leave an empty stream behind. Lookups treat an
    /// empty stream like any other.
    pub fn get_or_create_stream(&self, key: &str) -> Result<Arc<Stream>> {
        let mut values = self.values.write();
        match values.get(key) {
            Some(Value::Stream(stream)) => Ok(Arc::clone(stream)),
            Some(Value::String(_)) => Err(MarlinError::WrongType),
            None => {
                let stream = Arc::new(Stream::new());
                values.insert(key.to_string(), Value::Stream(Arc::clone(&stream)));
                Ok(stream)
            }
        }
    }

    /// Returns every key, live or expired.
    pub fn keys(&self) -> Vec<String> {
        self.values.read().keys().cloned().collect()
    }

    /// Returns the TYPE reply for `key`: "none" for missing or expired
    /// keys.
    pub fn type_name(&self, key: &str) -> &'static str {
        match self.get(key) {
            None => "none",
            Some(value) => value.type_name(),
        }
    }
}

/// All logical databases of one server instance.
pub struct Keyspace {
    dbs: Vec<Database>,
}

impl Keyspace {
    pub fn new(databases: usize) -> Self {
        Self {
            dbs: (0..databases).map(|_| Database::default()).collect(),
        }
    }

    /// Returns the database at `index`.
    pub fn db(&self, index: usize) -> Result<&Database> {
        self.dbs
            .get(index)
            .ok_or(MarlinError::NoSuchDatabase(index))
    }

    pub fn database_count(&self) -> usize {
        self.dbs.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_set_get_string() {
        let db = Database::default();
        assert_eq!(db.get_string("foo").unwrap(), None);

        db.set_string("foo", "bar".to_string(), None);
        assert_eq!(db.get_string("foo").unwrap(), Some("bar".to_string()));
    }

    #[test]
    fn test_expired_key_reads_as_missing() {
        let db = Database::default();
        let past = SystemTime::now() - Duration::from_secs(1);
        db.set_string("gone", "x".to_string(), Some(past));

        assert_eq!(db.get_string("gone").unwrap(), None);
        assert_eq!(db.type_name("gone"), "none");

        // KEYS does not filter expired entries.
        assert_eq!(db.keys(), ["gone".to_string()]);
    }

    #[test]
    fn test_overwrite_clears_expiry() {
        let db = Database::default();
        let past = SystemTime::now() - Duration::from_secs(1);
        db.set_string("k", "old".to_string(), Some(past));
        db.set_string("k", "new".to_string(), None);

        assert_eq!(db.get_string("k").unwrap(), Some("new".to_string()));
    }

    #[test]
    fn test_future_expiry_still_live() {
        let db = Database::default();
        let future = SystemTime::now() + Duration::from_secs(60);
        db.set_string("k", "v".to_string(), Some(future));

        assert_eq!(db.get_string("k").unwrap(), Some("v".to_string()));
        assert_eq!(db.type_name("k"), "string");
    }

    #[test]
    fn test_stream_type_checks() {
        let db = Database::default();
        db.set_string("s", "v".to_string(), None);

        assert!(matches!(
            db.get_or_create_stream("s"),
            Err(MarlinError::WrongType)
        ));
        assert!(matches!(db.get_stream("s"), Err(MarlinError::WrongType)));

        let stream = db.get_or_create_stream("events").unwrap();
        assert!(stream.is_empty());
        assert!(matches!(
            db.get_string("events"),
            Err(MarlinError::WrongType)
        ));
        assert_eq!(db.type_name("events"), "stream");
    }

    #[test]
    fn test_get_or_create_stream_is_stable() {
        let db = Database::default();
        let first = db.get_or_create_stream("events").unwrap();
        let second = db.get_or_create_stream("events").unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_keyspace_database_bounds() {
        let keyspace = Keyspace::new(16);
        assert_eq!(keyspace.database_count(), 16);
        assert!(keyspace.db(0).is_ok());
        assert!(keyspace.db(15).is_ok());
        assert!(matches!(
            keyspace.db(16),
            Err(MarlinError::NoSuchDatabase(16))
        ));
    }
}
