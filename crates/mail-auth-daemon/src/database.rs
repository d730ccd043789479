use anyhow::Context;
use async_trait::async_trait;
use mail_auth_engine::{BackingStore, QueryParameters};
use serde_json::{Map, Value as JsonValue};
use sqlite::{Connection, ConnectionThreadSafe, State, Statement, Type};
use std::sync::Arc;
use tokio::task::spawn_blocking;

/// Placeholder sigils that sqlite recognizes for named parameters
const PARAMETER_PREFIXES: [char; 3] = [':', '@', '$'];

/// Lookup statements run against a local sqlite database
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<ConnectionThreadSafe>,
}

impl SqliteStore {
    pub fn open(path: &str, busy_timeout: usize) -> anyhow::Result<Self> {
        let mut db = Connection::open_thread_safe(path)
            .with_context(|| format!("failed to open lookup database {path}"))?;
        db.set_busy_timeout(busy_timeout)?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Carry out the blocking operation on the database object
    pub async fn perform<T: Send + 'static>(
        &self,
        mut func: impl FnMut(&ConnectionThreadSafe) -> anyhow::Result<T> + Send + 'static,
    ) -> anyhow::Result<T> {
        let db = self.db.clone();
        spawn_blocking(move || (func)(&db)).await?
    }

    /// Confirms that the database can answer a trivial statement
    pub async fn ping(&self) -> anyhow::Result<()> {
        self.perform(|db| {
            db.execute("SELECT 1").context("pinging lookup database")?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl BackingStore for SqliteStore {
    async fn first_row(
        &self,
        statement: &str,
        params: &QueryParameters,
    ) -> anyhow::Result<Option<JsonValue>> {
        let sql = statement.to_string();
        let params = params.clone();
        self.perform(move |db| first_row(db, &sql, &params)).await
    }
}

fn first_row(
    db: &ConnectionThreadSafe,
    sql: &str,
    params: &QueryParameters,
) -> anyhow::Result<Option<JsonValue>> {
    let mut stmt = db
        .prepare(sql)
        .with_context(|| format!("preparing query `{sql}'"))?;
    bind_params(&mut stmt, params).with_context(|| format!("binding parameters in query `{sql}'"))?;

    match stmt.next()? {
        State::Done => Ok(None),
        State::Row => {
            let mut obj = Map::new();
            for (index, name) in stmt.column_names().iter().enumerate() {
                let value = get_column(&stmt, index)
                    .with_context(|| format!("reading column {name} in query `{sql}'"))?;
                obj.insert(name.to_string(), value);
            }
            Ok(Some(JsonValue::Object(obj)))
        }
    }
}

/// Binds only the parameters that the statement actually mentions;
/// sqlite rejects binding a name it doesn't know about.
fn bind_params(stmt: &mut Statement, params: &QueryParameters) -> anyhow::Result<()> {
    for (name, value) in params.iter() {
        for prefix in PARAMETER_PREFIXES {
            let placeholder = format!("{prefix}{name}");
            if let Some(index) = stmt.parameter_index(&placeholder)? {
                stmt.bind((index, value))
                    .with_context(|| format!("binding parameter {placeholder}"))?;
            }
        }
    }
    Ok(())
}

fn get_column(stmt: &Statement, index: usize) -> anyhow::Result<JsonValue> {
    match stmt.column_type(index)? {
        Type::Binary | Type::String => {
            let s: String = stmt.read(index)?;
            Ok(s.into())
        }
        Type::Integer => {
            let i: i64 = stmt.read(index)?;
            Ok(i.into())
        }
        Type::Float => {
            let f: f64 = stmt.read(index)?;
            Ok(f.into())
        }
        Type::Null => Ok(JsonValue::Null),
    }
}
