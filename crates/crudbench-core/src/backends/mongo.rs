//! Document store backend over the native async MongoDB driver.
//!
//! Timing comes from the database profiler (`system.profile`). The driver
//! manages its own connection pool, sized from configuration.

use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::bson::{doc, Bson, Document};
use mongodb::options::{Acknowledgment, ClientOptions, IndexOptions, WriteConcern};
use mongodb::{Client, Collection, Database, IndexModel};

use crate::config::MongoBackendConfig;
use crate::error::{Error, Result};
use crate::record::{PersonRecord, Record, RecordShape, ValueRecord};
use crate::repository::{Backend, IndexCreator, Repository};
use crate::retry::RetryPolicy;
use crate::timing::{profile, OperationClass, Profiler, Timed};

use super::validate_identifier;

const CLIENT_INDEX: &str = "client_id_index";

const PROFILED_OPS: [&str; 6] = ["query", "getmore", "insert", "update", "remove", "command"];

/// MongoDB benchmark backend.
pub struct MongoBackend {
    name: String,
    client: Client,
    database: Database,
    collection: String,
    shape: RecordShape,
    retry: RetryPolicy,
}

impl MongoBackend {
    /// Connect and ping the server.
    pub async fn connect(
        config: &MongoBackendConfig,
        shape: RecordShape,
        retry: RetryPolicy,
    ) -> Result<Self> {
        validate_identifier(&config.collection)?;

        let mut options = ClientOptions::parse(&config.url).await?;
        options.max_pool_size = Some(config.pool_size.max(1) as u32);
        options.connect_timeout = Some(config.connect_timeout);
        options.server_selection_timeout = Some(config.connect_timeout);
        options.app_name = Some("crudbench".to_string());

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);
        database.run_command(doc! { "ping": 1 }).await?;

        tracing::info!(
            database = %config.database,
            pool_size = config.pool_size,
            "connected document backend"
        );

        Ok(Self {
            name: "MongoDB".to_string(),
            client,
            database,
            collection: config.collection.clone(),
            shape,
            retry,
        })
    }

}

#[async_trait]
impl Backend for MongoBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn base_target_name(&self) -> &str {
        &self.collection
    }

    async fn open_repository(&self, target: &str) -> Result<Box<dyn Repository>> {
        validate_identifier(target)?;
        Ok(Box::new(MongoRepository {
            database: self.database.clone(),
            collection: self.database.collection(target),
            name: target.to_string(),
            shape: self.shape,
            retry: self.retry,
        }))
    }

    async fn close(&self) {
        self.client.clone().shutdown().await;
        tracing::info!(backend = %self.name, "closed document backend");
    }
}

/// Repository bound to one collection.
pub struct MongoRepository {
    database: Database,
    collection: Collection<Document>,
    name: String,
    shape: RecordShape,
    retry: RetryPolicy,
}

impl MongoRepository {
    fn namespace(&self) -> String {
        format!("{}.{}", self.database.name(), self.name)
    }

    fn profile_collection(&self) -> Collection<Document> {
        self.database.collection("system.profile")
    }

    async fn read_profile(&self, class: OperationClass) -> Result<Option<Duration>> {
        let namespace = self.namespace();
        let profile = self.profile_collection();
        let latest = profile
            .find_one(class_filter(&namespace, class))
            .sort(doc! { "ts": -1 })
            .await?;
        let Some(latest) = latest else {
            return Ok(None);
        };

        let Some(lsid) = session_id(&latest) else {
            return Ok(Some(session_total(std::slice::from_ref(&latest))));
        };

        let entries: Vec<Document> = profile
            .find(session_filter(&namespace, lsid))
            .await?
            .try_collect()
            .await?;
        Ok(Some(session_total(&entries)))
    }

    /// Turn profiling off, discard its log and profile every operation.
    async fn restart_profiler(&self) -> Result<()> {
        self.database.run_command(doc! { "profile": 0 }).await?;
        self.profile_collection().drop().await?;
        self.database
            .run_command(doc! { "profile": 2, "slowms": 0 })
            .await?;
        Ok(())
    }

    async fn collection_exists(&self, name: &str) -> Result<bool> {
        let names = self
            .database
            .list_collection_names()
            .filter(doc! { "name": name })
            .await?;
        Ok(!names.is_empty())
    }
}

/// Filter matching profiler entries of one operation class in `namespace`.
///
/// Servers log CRUD either under their own `op` or as an `op: command` entry
/// carrying the command name. Updates may also appear as `updateMany`.
fn class_filter(namespace: &str, class: OperationClass) -> Document {
    let (op, command) = match class {
        OperationClass::Insert => ("insert", "insert"),
        OperationClass::Find => ("query", "find"),
        OperationClass::Update => ("update", "update"),
        OperationClass::Delete => ("remove", "delete"),
    };
    let mut command_form = doc! { "op": "command" };
    command_form.insert(format!("command.{}", command), doc! { "$exists": true });
    let mut alternatives = vec![doc! { "op": op }, command_form];
    if class == OperationClass::Update {
        alternatives.push(doc! { "command.updateMany": { "$exists": true } });
    }
    doc! { "ns": namespace, "$or": alternatives }
}

/// Logical session id of a profiler entry, if the command carried one.
fn session_id(entry: &Document) -> Option<Bson> {
    entry
        .get_document("command")
        .ok()
        .and_then(|command| command.get("lsid"))
        .cloned()
}

/// CRUD entries of one logical session in `namespace`.
fn session_filter(namespace: &str, lsid: Bson) -> Document {
    doc! {
        "command.lsid": lsid,
        "ns": namespace,
        "op": { "$in": PROFILED_OPS.to_vec() },
    }
}

/// Summed server time of profiler entries.
fn session_total(entries: &[Document]) -> Duration {
    Duration::from_millis(entries.iter().map(millis).sum())
}

fn millis(entry: &Document) -> u64 {
    match entry.get("millis") {
        Some(Bson::Int32(v)) => (*v).max(0) as u64,
        Some(Bson::Int64(v)) => (*v).max(0) as u64,
        Some(Bson::Double(v)) => v.max(0.0) as u64,
        _ => 0,
    }
}

fn to_document(record: &Record) -> Document {
    match record {
        Record::Full(p) => doc! {
            "first_name": p.first_name.as_str(),
            "last_name": p.last_name.as_str(),
            "email": p.email.as_str(),
            "address": p.address.as_str(),
            "age": p.age,
            "client_id": p.client_id,
        },
        Record::Minimal(v) => doc! {
            "value": v.value,
            "client_id": v.client_id,
        },
    }
}

fn get_int(document: &Document, key: &str) -> Result<i64> {
    match document.get(key) {
        Some(Bson::Int32(v)) => Ok(i64::from(*v)),
        Some(Bson::Int64(v)) => Ok(*v),
        Some(Bson::Double(v)) => Ok(*v as i64),
        other => Err(Error::Decode(format!(
            "field {} is not an integer: {:?}",
            key, other
        ))),
    }
}

fn get_string(document: &Document, key: &str) -> Result<String> {
    document
        .get_str(key)
        .map(str::to_string)
        .map_err(|e| Error::Decode(format!("field {}: {}", key, e)))
}

fn from_document(document: &Document, shape: RecordShape) -> Result<Record> {
    Ok(match shape {
        RecordShape::Big => Record::Full(PersonRecord {
            first_name: get_string(document, "first_name")?,
            last_name: get_string(document, "last_name")?,
            email: get_string(document, "email")?,
            address: get_string(document, "address")?,
            age: get_int(document, "age")?,
            client_id: get_int(document, "client_id")?,
        }),
        RecordShape::Small => Record::Minimal(ValueRecord {
            value: get_int(document, "value")?,
            client_id: get_int(document, "client_id")?,
        }),
    })
}

#[async_trait]
impl Profiler for MongoRepository {
    async fn reset_profiling(&self) -> bool {
        match self.restart_profiler().await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "could not reset profiler");
                false
            }
        }
    }

    async fn profiled_time(&self, class: OperationClass) -> Option<Duration> {
        match self.read_profile(class).await {
            Ok(elapsed) => elapsed,
            Err(e) => {
                tracing::warn!(class = %class, error = %e, "could not read profiler");
                None
            }
        }
    }
}

#[async_trait]
impl IndexCreator for MongoRepository {
    async fn create_foreign_key_index(&self) -> bool {
        let model = IndexModel::builder()
            .keys(doc! { "client_id": 1 })
            .options(IndexOptions::builder().name(CLIENT_INDEX.to_string()).build())
            .build();

        match self.collection.create_index(model).await {
            Ok(_) => {
                tracing::info!(collection = %self.name, "client id index ready");
                true
            }
            Err(e) => {
                tracing::error!(collection = %self.name, error = %e, "index creation failed");
                false
            }
        }
    }
}

#[async_trait]
impl Repository for MongoRepository {
    fn target_name(&self) -> &str {
        &self.name
    }

    fn record_shape(&self) -> RecordShape {
        self.shape
    }

    async fn ensure_schema(&self) -> Result<()> {
        if !self.collection_exists(&self.name).await? {
            self.database.create_collection(&self.name).await?;
            tracing::debug!(collection = %self.name, "created collection");
        }
        Ok(())
    }

    async fn create_bulk(&self, records: &[Record]) -> Timed<u64> {
        let documents: Vec<Document> = records.iter().map(to_document).collect();
        let (collection, documents) = (&self.collection, &documents);
        let concern = WriteConcern::builder().w(Acknowledgment::Nodes(1)).build();
        let concern = &concern;

        let result = profile(self, &self.retry, OperationClass::Insert, move || async move {
            let inserted = collection
                .insert_many(documents)
                .ordered(true)
                .write_concern(concern.clone())
                .await?;
            Ok(inserted.inserted_ids.len() as u64)
        })
        .await;
        Timed::settle(result, &self.name, OperationClass::Insert)
    }

    async fn fetch_all(&self, client_id: i64) -> Timed<Vec<Record>> {
        let (collection, shape) = (&self.collection, self.shape);

        let result = profile(self, &self.retry, OperationClass::Find, move || async move {
            let documents: Vec<Document> = collection
                .find(doc! { "client_id": client_id })
                .await?
                .try_collect()
                .await?;
            Ok(documents)
        })
        .await
        .and_then(|timed| {
            timed.try_map(|documents| {
                documents
                    .iter()
                    .map(|d| from_document(d, shape))
                    .collect::<Result<Vec<_>>>()
            })
        });
        Timed::settle(result, &self.name, OperationClass::Find)
    }

    async fn update_all(&self, client_id: i64, shape: RecordShape) -> Timed<u64> {
        let update = match shape {
            RecordShape::Small => doc! { "$inc": { "value": 1 } },
            RecordShape::Big => doc! { "$set": { "age": 30, "first_name": "test_name" } },
        };
        let (collection, update) = (&self.collection, &update);

        let result = profile(self, &self.retry, OperationClass::Update, move || async move {
            let updated = collection
                .update_many(doc! { "client_id": client_id }, update.clone())
                .await?;
            Ok(updated.modified_count)
        })
        .await;
        Timed::settle(result, &self.name, OperationClass::Update)
    }

    async fn delete_all(&self, client_id: i64) -> Timed<u64> {
        let collection = &self.collection;

        let result = profile(self, &self.retry, OperationClass::Delete, move || async move {
            let deleted = collection
                .delete_many(doc! { "client_id": client_id })
                .await?;
            Ok(deleted.deleted_count)
        })
        .await;
        Timed::settle(result, &self.name, OperationClass::Delete)
    }

    async fn clear(&self) -> bool {
        match self.collection.drop().await {
            Ok(()) => {
                tracing::debug!(collection = %self.name, "dropped collection");
                true
            }
            Err(e) => {
                tracing::error!(collection = %self.name, error = %e, "failed to drop collection");
                false
            }
        }
    }

    async fn drop_targets_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut dropped = Vec::new();
        for name in self.database.list_collection_names().await? {
            if !name.starts_with(prefix) {
                continue;
            }
            self.database.collection::<Document>(&name).drop().await?;
            tracing::info!(collection = %name, "dropped collection");
            dropped.push(name);
        }
        Ok(dropped)
    }

    async fn close(&self) {
        tracing::debug!(collection = %self.name, "released repository");
    }
}
