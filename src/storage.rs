//! Product record storage
//!
//! The orchestrator and resolver only talk to the [`Storage`] trait;
//! [`SqliteStorage`] is the bundled implementation.

use std::path::Path;
use std::str::FromStr;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::package::{
    ActionRequest, DependencyTarget, InstallationStatus, Product, ProductDependency, ProductKey,
    ProductOnClient, ProductOnDepot, ProductProperty, ProductType, PropertyKind, Requirement,
    RequirementType,
};

/// Everything an install persists for one product version
#[derive(Debug, Clone)]
pub struct ProductRecords {
    pub product: Product,
    pub dependencies: Vec<ProductDependency>,
    pub properties: Vec<ProductProperty>,
    pub on_depot: ProductOnDepot,
}

/// Record store for products, their definitions and their states
pub trait Storage {
    fn get_product(&self, key: &ProductKey) -> Result<Option<Product>>;
    fn get_products(&self) -> Result<Vec<Product>>;
    fn create_product(&self, product: &Product) -> Result<()>;
    /// Returns whether a record was removed
    fn delete_product(&self, key: &ProductKey) -> Result<bool>;

    fn create_product_dependency(&self, dependency: &ProductDependency) -> Result<()>;
    fn get_product_dependencies(&self, key: &ProductKey) -> Result<Vec<ProductDependency>>;
    fn delete_product_dependencies(&self, key: &ProductKey) -> Result<usize>;

    fn create_product_property(&self, property: &ProductProperty) -> Result<()>;
    fn get_product_properties(&self, key: &ProductKey) -> Result<Vec<ProductProperty>>;
    fn delete_product_properties(&self, key: &ProductKey) -> Result<usize>;

    fn get_product_on_depot(&self, product_id: &str, depot_id: &str)
        -> Result<Option<ProductOnDepot>>;
    fn get_products_on_depot(&self, depot_id: &str) -> Result<Vec<ProductOnDepot>>;
    fn set_product_on_depot(&self, record: &ProductOnDepot) -> Result<()>;
    /// Returns whether a record was removed
    fn delete_product_on_depot(&self, product_id: &str, depot_id: &str) -> Result<bool>;

    fn get_product_on_client(&self, host_id: &str) -> Result<Vec<ProductOnClient>>;
    fn set_product_on_client(&self, record: &ProductOnClient) -> Result<()>;

    /// Persist all records of an installed product; nothing is kept on failure
    fn store_product_records(&self, records: &ProductRecords) -> Result<()>;
}

/// SQLite-backed storage
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Open or create the database
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        tracing::debug!("Opened database {}", path.display());

        let storage = Self { conn };
        storage.initialize()?;
        Ok(storage)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let storage = Self { conn };
        storage.initialize()?;
        Ok(storage)
    }

    fn initialize(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            -- Product definitions, one row per version
            CREATE TABLE IF NOT EXISTS products (
                product_id TEXT NOT NULL,
                product_version TEXT NOT NULL,
                package_version TEXT NOT NULL,
                product_type TEXT NOT NULL,
                name TEXT NOT NULL,
                priority INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (product_id, product_version, package_version)
            );

            CREATE TABLE IF NOT EXISTS product_dependencies (
                id INTEGER PRIMARY KEY,
                product_id TEXT NOT NULL,
                product_version TEXT NOT NULL,
                package_version TEXT NOT NULL,
                action TEXT NOT NULL,
                required_product_id TEXT,
                required_product_class_id TEXT,
                required_action TEXT,
                required_status TEXT,
                requirement_type TEXT
            );

            CREATE TABLE IF NOT EXISTS product_properties (
                product_id TEXT NOT NULL,
                product_version TEXT NOT NULL,
                package_version TEXT NOT NULL,
                name TEXT NOT NULL,
                description TEXT NOT NULL,
                kind TEXT NOT NULL,
                PRIMARY KEY (product_id, product_version, package_version, name)
            );

            CREATE TABLE IF NOT EXISTS products_on_depot (
                product_id TEXT NOT NULL,
                depot_id TEXT NOT NULL,
                product_version TEXT NOT NULL,
                package_version TEXT NOT NULL,
                product_type TEXT NOT NULL,
                install_date INTEGER NOT NULL,
                PRIMARY KEY (product_id, depot_id)
            );

            CREATE TABLE IF NOT EXISTS products_on_client (
                product_id TEXT NOT NULL,
                host_id TEXT NOT NULL,
                installation_status TEXT NOT NULL,
                action_request TEXT NOT NULL,
                product_version TEXT,
                package_version TEXT,
                seq INTEGER NOT NULL,
                PRIMARY KEY (product_id, host_id)
            );

            CREATE INDEX IF NOT EXISTS idx_deps_product
                ON product_dependencies(product_id, product_version, package_version);
            CREATE INDEX IF NOT EXISTS idx_poc_host ON products_on_client(host_id);
            "#,
        )?;

        Ok(())
    }
}

impl Storage for SqliteStorage {
    fn get_product(&self, key: &ProductKey) -> Result<Option<Product>> {
        let product = self
            .conn
            .query_row(
                "SELECT data FROM products
                 WHERE product_id = ?1 AND product_version = ?2 AND package_version = ?3",
                params![key.product_id, key.product_version, key.package_version],
                |row| json_column(row, 0),
            )
            .optional()?;
        Ok(product)
    }

    fn get_products(&self) -> Result<Vec<Product>> {
        let mut stmt = self.conn.prepare(
            "SELECT data FROM products ORDER BY product_id, product_version, package_version",
        )?;
        let rows = stmt.query_map([], |row| json_column(row, 0))?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn create_product(&self, product: &Product) -> Result<()> {
        let data = serde_json::to_string(product)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO products
                (product_id, product_version, package_version, product_type, name, priority, data)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                product.id,
                product.product_version,
                product.package_version,
                product.product_type.to_string(),
                product.name,
                product.priority,
                data,
            ],
        )?;
        Ok(())
    }

    fn delete_product(&self, key: &ProductKey) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM products
             WHERE product_id = ?1 AND product_version = ?2 AND package_version = ?3",
            params![key.product_id, key.product_version, key.package_version],
        )?;
        Ok(rows > 0)
    }

    fn create_product_dependency(&self, dependency: &ProductDependency) -> Result<()> {
        let (required_product, required_class) = match &dependency.target {
            DependencyTarget::Product(id) => (Some(id.as_str()), None),
            DependencyTarget::ProductClass(class) => (None, Some(class.as_str())),
        };
        let (required_action, required_status) = match dependency.requirement {
            Requirement::Action(action) => (Some(action.to_string()), None),
            Requirement::Status(status) => (None, Some(status.to_string())),
        };

        self.conn.execute(
            r#"
            INSERT INTO product_dependencies
                (product_id, product_version, package_version, action,
                 required_product_id, required_product_class_id,
                 required_action, required_status, requirement_type)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                dependency.product_id,
                dependency.product_version,
                dependency.package_version,
                dependency.action.to_string(),
                required_product,
                required_class,
                required_action,
                required_status,
                dependency.requirement_type.map(|t| t.to_string()),
            ],
        )?;
        Ok(())
    }

    fn get_product_dependencies(&self, key: &ProductKey) -> Result<Vec<ProductDependency>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT product_id, product_version, package_version, action,
                   required_product_id, required_product_class_id,
                   required_action, required_status, requirement_type
            FROM product_dependencies
            WHERE product_id = ?1 AND product_version = ?2 AND package_version = ?3
            ORDER BY id
            "#,
        )?;

        let rows = stmt.query_map(
            params![key.product_id, key.product_version, key.package_version],
            |row| {
                let target = match (
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ) {
                    (Some(id), _) => DependencyTarget::Product(id),
                    (None, Some(class)) => DependencyTarget::ProductClass(class),
                    (None, None) => return Err(conversion_error(4, "dependency without target")),
                };
                let requirement = match (
                    row.get::<_, Option<String>>(6)?,
                    row.get::<_, Option<String>>(7)?,
                ) {
                    (Some(action), _) => Requirement::Action(parse_column(6, &action)?),
                    (None, Some(status)) => Requirement::Status(parse_column(7, &status)?),
                    (None, None) => {
                        return Err(conversion_error(6, "dependency without requirement"))
                    }
                };
                let requirement_type = row
                    .get::<_, Option<String>>(8)?
                    .map(|t| parse_column::<RequirementType>(8, &t))
                    .transpose()?;

                Ok(ProductDependency {
                    product_id: row.get(0)?,
                    product_version: row.get(1)?,
                    package_version: row.get(2)?,
                    action: parse_column(3, &row.get::<_, String>(3)?)?,
                    target,
                    requirement,
                    requirement_type,
                })
            },
        )?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn delete_product_dependencies(&self, key: &ProductKey) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM product_dependencies
             WHERE product_id = ?1 AND product_version = ?2 AND package_version = ?3",
            params![key.product_id, key.product_version, key.package_version],
        )?;
        Ok(rows)
    }

    fn create_product_property(&self, property: &ProductProperty) -> Result<()> {
        let kind = serde_json::to_string(&property.kind)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO product_properties
                (product_id, product_version, package_version, name, description, kind)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                property.product_id,
                property.product_version,
                property.package_version,
                property.name,
                property.description,
                kind,
            ],
        )?;
        Ok(())
    }

    fn get_product_properties(&self, key: &ProductKey) -> Result<Vec<ProductProperty>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT product_id, product_version, package_version, name, description, kind
            FROM product_properties
            WHERE product_id = ?1 AND product_version = ?2 AND package_version = ?3
            ORDER BY name
            "#,
        )?;

        let rows = stmt.query_map(
            params![key.product_id, key.product_version, key.package_version],
            |row| {
                let kind: PropertyKind = json_column(row, 5)?;
                Ok(ProductProperty {
                    product_id: row.get(0)?,
                    product_version: row.get(1)?,
                    package_version: row.get(2)?,
                    name: row.get(3)?,
                    description: row.get(4)?,
                    kind,
                })
            },
        )?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn delete_product_properties(&self, key: &ProductKey) -> Result<usize> {
        let rows = self.conn.execute(
            "DELETE FROM product_properties
             WHERE product_id = ?1 AND product_version = ?2 AND package_version = ?3",
            params![key.product_id, key.product_version, key.package_version],
        )?;
        Ok(rows)
    }

    fn get_product_on_depot(
        &self,
        product_id: &str,
        depot_id: &str,
    ) -> Result<Option<ProductOnDepot>> {
        let record = self
            .conn
            .query_row(
                "SELECT product_id, depot_id, product_version, package_version, product_type,
                        install_date
                 FROM products_on_depot WHERE product_id = ?1 AND depot_id = ?2",
                params![product_id, depot_id],
                product_on_depot_row,
            )
            .optional()?;
        Ok(record)
    }

    fn get_products_on_depot(&self, depot_id: &str) -> Result<Vec<ProductOnDepot>> {
        let mut stmt = self.conn.prepare(
            "SELECT product_id, depot_id, product_version, package_version, product_type,
                    install_date
             FROM products_on_depot WHERE depot_id = ?1 ORDER BY product_id",
        )?;
        let rows = stmt.query_map(params![depot_id], product_on_depot_row)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn set_product_on_depot(&self, record: &ProductOnDepot) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT OR REPLACE INTO products_on_depot
                (product_id, depot_id, product_version, package_version, product_type, install_date)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.product_id,
                record.depot_id,
                record.product_version,
                record.package_version,
                record.product_type.to_string(),
                record.install_date,
            ],
        )?;
        Ok(())
    }

    fn delete_product_on_depot(&self, product_id: &str, depot_id: &str) -> Result<bool> {
        let rows = self.conn.execute(
            "DELETE FROM products_on_depot WHERE product_id = ?1 AND depot_id = ?2",
            params![product_id, depot_id],
        )?;
        Ok(rows > 0)
    }

    fn get_product_on_client(&self, host_id: &str) -> Result<Vec<ProductOnClient>> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT product_id, host_id, installation_status, action_request,
                   product_version, package_version
            FROM products_on_client WHERE host_id = ?1 ORDER BY seq
            "#,
        )?;

        let rows = stmt.query_map(params![host_id], |row| {
            Ok(ProductOnClient {
                product_id: row.get(0)?,
                host_id: row.get(1)?,
                installation_status: parse_column::<InstallationStatus>(2, &row.get::<_, String>(2)?)?,
                action_request: parse_column::<ActionRequest>(3, &row.get::<_, String>(3)?)?,
                product_version: row.get(4)?,
                package_version: row.get(5)?,
            })
        })?;

        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    fn set_product_on_client(&self, record: &ProductOnClient) -> Result<()> {
        // Keep the original position on update so snapshots stay ordered
        self.conn.execute(
            r#"
            INSERT INTO products_on_client
                (product_id, host_id, installation_status, action_request,
                 product_version, package_version, seq)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                    (SELECT COALESCE(MAX(seq), 0) + 1 FROM products_on_client))
            ON CONFLICT(product_id, host_id) DO UPDATE SET
                installation_status = excluded.installation_status,
                action_request = excluded.action_request,
                product_version = excluded.product_version,
                package_version = excluded.package_version
            "#,
            params![
                record.product_id,
                record.host_id,
                record.installation_status.to_string(),
                record.action_request.to_string(),
                record.product_version,
                record.package_version,
            ],
        )?;
        Ok(())
    }

    fn store_product_records(&self, records: &ProductRecords) -> Result<()> {
        // Statements on self.conn below join this transaction
        let tx = self.conn.unchecked_transaction()?;

        self.create_product(&records.product)?;
        for dependency in &records.dependencies {
            self.create_product_dependency(dependency)?;
        }
        for property in &records.properties {
            self.create_product_property(property)?;
        }
        self.set_product_on_depot(&records.on_depot)?;

        tx.commit()?;
        Ok(())
    }
}

fn product_on_depot_row(row: &Row<'_>) -> rusqlite::Result<ProductOnDepot> {
    Ok(ProductOnDepot {
        product_id: row.get(0)?,
        depot_id: row.get(1)?,
        product_version: row.get(2)?,
        package_version: row.get(3)?,
        product_type: parse_column::<ProductType>(4, &row.get::<_, String>(4)?)?,
        install_date: row.get(5)?,
    })
}

fn json_column<T: serde::de::DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let text: String = row.get(idx)?;
    serde_json::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_column<T: FromStr<Err = String>>(idx: usize, value: &str) -> rusqlite::Result<T> {
    value.parse().map_err(|e: String| conversion_error(idx, &e))
}

fn conversion_error(idx: usize, message: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.to_string().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn product() -> Product {
        let mut product = Product::new(ProductType::Localboot, "firefox", "115.0", "3");
        product.priority = 10;
        product.product_class_ids = vec!["browser".to_string()];
        product
    }

    #[test]
    fn test_storage_create() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        assert!(storage.get_products().unwrap().is_empty());
        assert!(storage.get_products_on_depot("depot1").unwrap().is_empty());
    }

    #[test]
    fn test_product_records() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let product = product();
        storage.create_product(&product).unwrap();

        let loaded = storage.get_product(&product.key()).unwrap().unwrap();
        assert_eq!(loaded, product);

        let dependency = ProductDependency {
            product_id: "firefox".to_string(),
            product_version: "115.0".to_string(),
            package_version: "3".to_string(),
            action: ActionRequest::Setup,
            target: DependencyTarget::ProductClass("runtime".to_string()),
            requirement: Requirement::Status(InstallationStatus::Installed),
            requirement_type: Some(RequirementType::Before),
        };
        storage.create_product_dependency(&dependency).unwrap();
        assert_eq!(
            storage.get_product_dependencies(&product.key()).unwrap(),
            vec![dependency]
        );

        let property = ProductProperty {
            product_id: "firefox".to_string(),
            product_version: "115.0".to_string(),
            package_version: "3".to_string(),
            name: "language".to_string(),
            description: String::new(),
            kind: PropertyKind::Bool { default: true },
        };
        storage.create_product_property(&property).unwrap();
        assert_eq!(
            storage.get_product_properties(&product.key()).unwrap(),
            vec![property]
        );

        assert_eq!(storage.delete_product_dependencies(&product.key()).unwrap(), 1);
        assert_eq!(storage.delete_product_properties(&product.key()).unwrap(), 1);
        assert!(storage.delete_product(&product.key()).unwrap());
        assert!(storage.get_product(&product.key()).unwrap().is_none());
    }

    #[test]
    fn test_product_on_depot() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let record = ProductOnDepot {
            product_id: "firefox".to_string(),
            depot_id: "depot1".to_string(),
            product_version: "115.0".to_string(),
            package_version: "3".to_string(),
            product_type: ProductType::Localboot,
            install_date: 1_700_000_000,
        };
        storage.set_product_on_depot(&record).unwrap();

        assert_eq!(
            storage.get_product_on_depot("firefox", "depot1").unwrap(),
            Some(record.clone())
        );
        assert!(storage.get_product_on_depot("firefox", "other").unwrap().is_none());

        assert!(storage.delete_product_on_depot("firefox", "depot1").unwrap());
        assert!(!storage.delete_product_on_depot("firefox", "depot1").unwrap());
    }

    fn records() -> ProductRecords {
        let product = product();
        ProductRecords {
            properties: vec![ProductProperty {
                product_id: "firefox".to_string(),
                product_version: "115.0".to_string(),
                package_version: "3".to_string(),
                name: "language".to_string(),
                description: String::new(),
                kind: PropertyKind::Bool { default: true },
            }],
            dependencies: vec![],
            on_depot: ProductOnDepot {
                product_id: "firefox".to_string(),
                depot_id: "depot1".to_string(),
                product_version: "115.0".to_string(),
                package_version: "3".to_string(),
                product_type: ProductType::Localboot,
                install_date: 1_700_000_000,
            },
            product,
        }
    }

    #[test]
    fn test_store_product_records() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        let records = records();
        storage.store_product_records(&records).unwrap();

        assert!(storage.get_product(&records.product.key()).unwrap().is_some());
        assert_eq!(
            storage.get_product_properties(&records.product.key()).unwrap(),
            records.properties
        );
        assert!(storage
            .get_product_on_depot("firefox", "depot1")
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_store_product_records_rolls_back() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        storage
            .conn
            .execute_batch("DROP TABLE product_properties")
            .unwrap();

        let records = records();
        assert!(storage.store_product_records(&records).is_err());

        assert!(storage.get_product(&records.product.key()).unwrap().is_none());
        assert!(storage
            .get_product_on_depot("firefox", "depot1")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_product_on_client_keeps_order() {
        let storage = SqliteStorage::open_in_memory().unwrap();
        for id in ["b", "a", "c"] {
            storage
                .set_product_on_client(&ProductOnClient::new(id, "host1"))
                .unwrap();
        }

        let mut update = ProductOnClient::new("b", "host1");
        update.action_request = ActionRequest::Setup;
        storage.set_product_on_client(&update).unwrap();

        let states = storage.get_product_on_client("host1").unwrap();
        let ids: Vec<&str> = states.iter().map(|s| s.product_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
        assert_eq!(states[0].action_request, ActionRequest::Setup);
    }
}
