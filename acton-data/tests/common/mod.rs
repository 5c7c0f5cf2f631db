//! Shared fixtures for integration tests

#![allow(dead_code)]

use acton_data::config::{DatabaseConfig, RepositoryConfig};
use acton_data::error::DbResult;
use acton_data::manager::ConnectionManager;
use acton_data::repository::{column, Audit, Entity, Repository, TableSchema, Value};
use sqlx::any::AnyRow;
use tempfile::TempDir;

pub const WIDGETS_DDL: &str = "CREATE TABLE widgets (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    quantity BIGINT NOT NULL,
    sku TEXT NOT NULL UNIQUE,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    deleted_at BIGINT,
    created_by TEXT,
    updated_by TEXT,
    deleted_by TEXT
)";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Widget {
    pub id: Option<String>,
    pub name: String,
    pub quantity: i64,
    pub sku: String,
    pub audit: Audit,
}

impl Widget {
    pub fn new(name: &str, quantity: i64, sku: &str) -> Self {
        Self {
            name: name.to_string(),
            quantity,
            sku: sku.to_string(),
            ..Default::default()
        }
    }
}

impl Entity for Widget {
    fn schema() -> TableSchema {
        TableSchema::new("widgets", "wdg", &["name", "quantity", "sku"])
    }

    fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    fn set_id(&mut self, id: String) {
        self.id = Some(id);
    }

    fn audit(&self) -> &Audit {
        &self.audit
    }

    fn audit_mut(&mut self) -> &mut Audit {
        &mut self.audit
    }

    fn to_values(&self) -> Vec<Value> {
        vec![
            self.name.as_str().into(),
            self.quantity.into(),
            self.sku.as_str().into(),
        ]
    }

    fn from_row(row: &AnyRow) -> DbResult<Self> {
        Ok(Self {
            id: Some(column(row, "id")?),
            name: column(row, "name")?,
            quantity: column(row, "quantity")?,
            sku: column(row, "sku")?,
            audit: Audit::from_row(row)?,
        })
    }
}

/// A file-backed SQLite database that lives as long as the fixture
pub struct TestDb {
    pub manager: ConnectionManager,
    pub url: String,
    _dir: TempDir,
}

impl TestDb {
    pub async fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let url = sqlite_url(&dir, "primary.db");
        let manager = ConnectionManager::new(quiet_config(&url)).await.unwrap();

        sqlx::query(WIDGETS_DDL)
            .execute(manager.primary().pool())
            .await
            .unwrap();

        Self {
            manager,
            url,
            _dir: dir,
        }
    }

    pub fn widgets(&self) -> Repository<Widget> {
        Repository::new(self.manager.primary(), Widget::schema(), fast_repository_config()).unwrap()
    }

    pub fn soft_widgets(&self) -> Repository<Widget> {
        Repository::new(
            self.manager.primary(),
            Widget::schema().with_soft_delete(true),
            fast_repository_config(),
        )
        .unwrap()
    }
}

pub fn sqlite_url(dir: &TempDir, file: &str) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join(file).display())
}

/// Defaults with the health loop off and a single connection attempt
pub fn quiet_config(url: &str) -> DatabaseConfig {
    let mut config = DatabaseConfig::from_url(url);
    config.health_check.enabled = false;
    config.retry.max_attempts = 1;
    config.pool.max_connections = 4;
    config
}

pub fn fast_repository_config() -> RepositoryConfig {
    let mut config = RepositoryConfig::default();
    config.retry.max_attempts = 2;
    config.retry.initial_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config
}

pub fn widgets(count: usize) -> Vec<Widget> {
    (0..count)
        .map(|i| Widget::new(&format!("widget-{i}"), i as i64, &format!("SKU-{i:03}")))
        .collect()
}
