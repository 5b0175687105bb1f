//! Access to the management `globalSettings` document in MongoDB

use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::{doc, Document};
use mongodb::error::ErrorKind;
use mongodb::options::{ClientOptions, FindOneOptions};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

const DATABASE_NAME: &str = "management";
const GLOBAL_SETTINGS_COLLECTION: &str = "globalSettings";
const DATABASE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum DatabaseError {
    /// The database answered but holds no settings document yet
    #[error("no globalSettings document found")]
    NoDocument,

    #[error("failed to reach MongoDB: {0}")]
    Unreachable(String),

    #[error("{0}")]
    Other(String),
}

impl DatabaseError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DatabaseError::Unreachable(_))
    }
}

impl From<mongodb::error::Error> for DatabaseError {
    fn from(err: mongodb::error::Error) -> Self {
        match err.kind.as_ref() {
            ErrorKind::ServerSelection { .. } => DatabaseError::Unreachable(err.to_string()),
            _ => DatabaseError::Other(err.to_string()),
        }
    }
}

/// Drive management switches kept under `hidden` in the settings document
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HiddenSettings {
    #[serde(default)]
    pub auto_evict_missing_drive: bool,
    #[serde(default)]
    pub auto_format_drive: bool,
}

#[derive(Clone, Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct GlobalSettings {
    #[serde(default)]
    pub hidden: HiddenSettings,
}

#[async_trait]
pub trait SettingsDatabase: Send + Sync {
    /// Read the single globalSettings document
    async fn global_settings(&self, uri: &str) -> Result<GlobalSettings, DatabaseError>;

    /// `$set` the hidden drive settings on the globalSettings document
    async fn update_hidden_settings(
        &self,
        uri: &str,
        hidden: HiddenSettings,
    ) -> Result<(), DatabaseError>;
}

/// MongoDB backed settings store; a client is built per call
#[derive(Clone, Debug, Default)]
pub struct MongoSettingsDatabase;

impl MongoSettingsDatabase {
    async fn client(&self, uri: &str) -> Result<mongodb::Client, DatabaseError> {
        let mut options = ClientOptions::parse(uri).await?;
        options.server_selection_timeout = Some(DATABASE_TIMEOUT);
        options.connect_timeout = Some(DATABASE_TIMEOUT);
        Ok(mongodb::Client::with_options(options)?)
    }
}

#[async_trait]
impl SettingsDatabase for MongoSettingsDatabase {
    #[instrument(skip(self))]
    async fn global_settings(&self, uri: &str) -> Result<GlobalSettings, DatabaseError> {
        let client = self.client(uri).await?;
        let collection = client
            .database(DATABASE_NAME)
            .collection::<GlobalSettings>(GLOBAL_SETTINGS_COLLECTION);

        let options = FindOneOptions::builder()
            .projection(doc! { "hidden": 1 })
            .build();

        match collection.find_one(doc! {}, options).await {
            Ok(Some(settings)) => Ok(settings),
            Ok(None) => Err(DatabaseError::NoDocument),
            Err(e) => {
                debug!("globalSettings lookup failed: {}", e);
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    async fn update_hidden_settings(
        &self,
        uri: &str,
        hidden: HiddenSettings,
    ) -> Result<(), DatabaseError> {
        let client = self.client(uri).await?;
        let collection = client
            .database(DATABASE_NAME)
            .collection::<Document>(GLOBAL_SETTINGS_COLLECTION);

        let update = doc! {
            "$set": {
                "hidden.autoEvictMissingDrive": hidden.auto_evict_missing_drive,
                "hidden.autoFormatDrive": hidden.auto_format_drive,
            }
        };

        let result = collection.update_one(doc! {}, update, None).await?;
        if result.matched_count == 0 {
            return Err(DatabaseError::Other(
                "globalSettings update matched no document".to_string(),
            ));
        }
        Ok(())
    }
}
