use crate::config::{ServerConfig, TopicDefinition};
use crate::core::{Result, SowError};
use crate::storage::{JournalStorage, Table, TableOptions, TableStats};
use futures::future::{join_all, try_join_all};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Every open bookmark store table of the process, keyed by topic.
///
/// Built from configuration at startup and torn down with [`shutdown`]; there
/// is no global instance.
///
/// [`shutdown`]: TableRegistry::shutdown
#[derive(Debug, Default)]
pub struct TableRegistry {
    tables: RwLock<HashMap<String, Arc<Table>>>,
}

impl TableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens and recovers every configured topic on file storage. Fails if
    /// any single table fails to recover, after closing the ones that did.
    pub async fn open(config: &ServerConfig) -> Result<Self> {
        config.validate()?;
        let opening = config.topics.iter().map(|topic| async move {
            let storage = Arc::new(config.storage_for(topic)?);
            Table::open(topic.clone(), storage, config.table_options_for(topic)).await
        });
        let (tables, failures): (Vec<_>, Vec<_>) =
            join_all(opening).await.into_iter().partition(|opened| opened.is_ok());
        let tables: Vec<Arc<Table>> = tables.into_iter().filter_map(|t| t.ok()).collect();

        if let Some(Err(err)) = failures.into_iter().next() {
            for table in &tables {
                if let Err(close_err) = table.close().await {
                    warn!(topic = %table.topic(), error = %close_err, "closing table after failed open");
                }
            }
            return Err(err);
        }

        let registry = Self::new();
        {
            let mut map = registry.tables.write().await;
            for table in tables {
                map.insert(table.topic().to_string(), table);
            }
        }
        info!(server = %config.name, tables = config.topics.len(), "table registry ready");
        Ok(registry)
    }

    /// Opens one table over the given storage and registers it.
    pub async fn open_table(
        &self,
        definition: TopicDefinition,
        storage: Arc<dyn JournalStorage>,
        options: TableOptions,
    ) -> Result<Arc<Table>> {
        let mut tables = self.tables.write().await;
        if tables.contains_key(&definition.topic) {
            return Err(SowError::TableExists(definition.topic));
        }
        let table = Table::open(definition, storage, options).await?;
        tables.insert(table.topic().to_string(), Arc::clone(&table));
        Ok(table)
    }

    pub async fn table(&self, topic: &str) -> Result<Arc<Table>> {
        self.tables
            .read()
            .await
            .get(topic)
            .cloned()
            .ok_or_else(|| SowError::TableNotFound(topic.to_string()))
    }

    pub async fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.tables.read().await.keys().cloned().collect();
        topics.sort();
        topics
    }

    pub async fn len(&self) -> usize {
        self.tables.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tables.read().await.is_empty()
    }

    pub async fn stats(&self) -> Result<Vec<TableStats>> {
        let tables = self.tables.read().await;
        let mut stats = tables
            .values()
            .map(|table| table.stats())
            .collect::<Result<Vec<_>>>()?;
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        Ok(stats)
    }

    /// Closes every table concurrently and empties the registry.
    pub async fn shutdown(&self) -> Result<()> {
        let tables: Vec<Arc<Table>> = self.tables.write().await.drain().map(|(_, t)| t).collect();
        let count = tables.len();
        try_join_all(tables.iter().map(|table| table.close())).await?;
        info!(tables = count, "table registry shut down");
        Ok(())
    }
}
