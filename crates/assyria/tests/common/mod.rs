//! Shared mappings and fixtures for the SQLite integration tests.

#![allow(dead_code)]

use assyria::prelude::*;
use std::path::PathBuf;
use std::sync::Mutex;
use tempfile::TempDir;

#[derive(Debug, Clone)]
pub struct User {
    pub id: i64,
    pub name: String,
}

impl User {
    pub fn new(name: &str) -> EntityRef<Self> {
        EntityRef::new(Self {
            id: 0,
            name: name.to_string(),
        })
    }
}

impl Entity for User {
    const TABLE_NAME: &'static str = "users";
    const KEY_COLUMN: &'static str = "id";
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("name", "name", SqlType::Text),
        ];
        FIELDS
    }

    fn key(&self) -> Value {
        Value::BigInt(self.id)
    }

    fn set_key(&mut self, key: Value) -> Result<()> {
        self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
        Ok(())
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("name", Value::Text(self.name.clone()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Email {
    pub id: Uuid,
    pub address: String,
}

impl Email {
    pub fn new(address: &str) -> EntityRef<Self> {
        EntityRef::new(Self {
            id: Uuid::nil(),
            address: address.to_string(),
        })
    }
}

impl Entity for Email {
    const TABLE_NAME: &'static str = "emails";
    const KEY_COLUMN: &'static str = "id";
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::CombGuid;

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::Uuid).primary_key(true),
            FieldInfo::new("address", "address", SqlType::Text),
        ];
        FIELDS
    }

    fn key(&self) -> Value {
        Value::from(self.id)
    }

    fn set_key(&mut self, key: Value) -> Result<()> {
        self.id = Option::<Uuid>::from_value(&key)?.unwrap_or(Uuid::nil());
        Ok(())
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("address", Value::Text(self.address.clone()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            address: row.get_named("address")?,
        })
    }
}

/// Sequential-keyed note about a comb-keyed email; saving it saves the email.
#[derive(Debug, Clone)]
pub struct Note {
    pub id: i64,
    pub text: String,
    pub email: Related<Email>,
}

impl Note {
    pub fn about(email: &EntityRef<Email>, text: &str) -> EntityRef<Self> {
        EntityRef::new(Self {
            id: 0,
            text: text.to_string(),
            email: Related::to(email),
        })
    }
}

impl Entity for Note {
    const TABLE_NAME: &'static str = "notes";
    const KEY_COLUMN: &'static str = "id";
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;
    const ASSOCIATIONS: &'static [AssociationInfo] =
        &[AssociationInfo::many_to_one("email", "emails", "email_id")
            .cascade(Cascade::SAVE_UPDATE)];

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("text", "text", SqlType::Text),
            FieldInfo::new("email_id", "email_id", SqlType::Uuid)
                .nullable(true)
                .foreign_key("emails.id"),
        ];
        FIELDS
    }

    fn key(&self) -> Value {
        Value::BigInt(self.id)
    }

    fn set_key(&mut self, key: Value) -> Result<()> {
        self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
        Ok(())
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("text", Value::Text(self.text.clone())),
            ("email_id", self.email.fk()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            text: row.get_named("text")?,
            email: Related::from_fk(row.get_named::<Value>("email_id")?),
        })
    }

    fn associated(&self, association: &str) -> Vec<ErasedRef> {
        match association {
            "email" => self.email.erased().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Parent side: inverse collection of offices; saves and deletes cascade.
#[derive(Debug, Clone)]
pub struct Country {
    pub id: i64,
    pub name: String,
    pub offices: RelatedMany<Office>,
}

impl Country {
    pub fn new(name: &str) -> EntityRef<Self> {
        EntityRef::new(Self {
            id: 0,
            name: name.to_string(),
            offices: RelatedMany::new(),
        })
    }
}

impl Entity for Country {
    const TABLE_NAME: &'static str = "countries";
    const KEY_COLUMN: &'static str = "id";
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;
    const ASSOCIATIONS: &'static [AssociationInfo] = &[AssociationInfo::one_to_many(
        "offices",
        "offices",
        "country_id",
    )
    .inverse()
    .cascade(Cascade::ALL)];

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("name", "name", SqlType::Text),
        ];
        FIELDS
    }

    fn key(&self) -> Value {
        Value::BigInt(self.id)
    }

    fn set_key(&mut self, key: Value) -> Result<()> {
        self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
        Ok(())
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![("name", Value::Text(self.name.clone()))]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            offices: RelatedMany::new(),
        })
    }

    fn associated(&self, association: &str) -> Vec<ErasedRef> {
        match association {
            "offices" => self.offices.erased(),
            _ => Vec::new(),
        }
    }
}

/// Owning side: writes `country_id`.
#[derive(Debug, Clone)]
pub struct Office {
    pub id: i64,
    pub name: String,
    pub country: Related<Country>,
}

impl Office {
    pub fn new(name: &str) -> EntityRef<Self> {
        EntityRef::new(Self {
            id: 0,
            name: name.to_string(),
            country: Related::empty(),
        })
    }
}

impl Entity for Office {
    const TABLE_NAME: &'static str = "offices";
    const KEY_COLUMN: &'static str = "id";
    const KEY_STRATEGY: KeyStrategy = KeyStrategy::Sequential;
    const ASSOCIATIONS: &'static [AssociationInfo] =
        &[AssociationInfo::many_to_one("country", "countries", "country_id")];

    fn fields() -> &'static [FieldInfo] {
        static FIELDS: &[FieldInfo] = &[
            FieldInfo::new("id", "id", SqlType::BigInt).primary_key(true),
            FieldInfo::new("name", "name", SqlType::Text),
            FieldInfo::new("country_id", "country_id", SqlType::BigInt)
                .nullable(true)
                .foreign_key("countries.id"),
        ];
        FIELDS
    }

    fn key(&self) -> Value {
        Value::BigInt(self.id)
    }

    fn set_key(&mut self, key: Value) -> Result<()> {
        self.id = Option::<i64>::from_value(&key)?.unwrap_or(0);
        Ok(())
    }

    fn to_row(&self) -> Vec<(&'static str, Value)> {
        vec![
            ("name", Value::Text(self.name.clone())),
            ("country_id", self.country.fk()),
        ]
    }

    fn from_row(row: &Row) -> Result<Self> {
        Ok(Self {
            id: row.get_named("id")?,
            name: row.get_named("name")?,
            country: Related::from_fk(row.get_named::<Value>("country_id")?),
        })
    }

    fn associated(&self, association: &str) -> Vec<ErasedRef> {
        match association {
            "country" => self.country.erased().into_iter().collect(),
            _ => Vec::new(),
        }
    }
}

/// Attach `office` to `country` on both sides.
pub fn attach(country: &EntityRef<Country>, office: &EntityRef<Office>) {
    office.write().country = Related::to(country);
    country.write().offices.push(office.clone());
}

pub fn registry() -> Arc<MappingRegistry> {
    Arc::new(
        MappingRegistry::new()
            .with::<User>()
            .unwrap()
            .with::<Email>()
            .unwrap()
            .with::<Note>()
            .unwrap()
            .with::<Country>()
            .unwrap()
            .with::<Office>()
            .unwrap(),
    )
}

/// A fresh database file with every mapped table created.
pub struct TestDb {
    _dir: TempDir,
    pub path: PathBuf,
    pub factory: SessionFactory<SqliteStore>,
}

impl TestDb {
    pub fn new() -> Self {
        Self::with_session_config(SessionConfig::new())
    }

    pub fn with_session_config(config: SessionConfig) -> Self {
        init_tracing();
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("assyria.db");
        let factory =
            sqlite_session_factory(registry(), SqliteConfig::file(path.to_string_lossy()))
                .with_config(config);
        recreate_schema(&factory).unwrap();
        Self {
            _dir: dir,
            path,
            factory,
        }
    }

    pub fn session(&self) -> Session<SqliteStore> {
        self.factory.open_session().unwrap()
    }

    /// Rows in `table`, read through a bare connection.
    pub fn count(&self, table: &str) -> usize {
        let store = SqliteStore::open_file(&self.path).unwrap();
        store.select_all(table, None).unwrap().count()
    }

    pub fn row(&self, table: &str, key: impl Into<Value>) -> Option<Row> {
        let store = SqliteStore::open_file(&self.path).unwrap();
        store.select_by_key(table, "id", &key.into()).unwrap()
    }
}

fn init_tracing() {
    static INIT: Mutex<bool> = Mutex::new(false);
    let mut done = INIT.lock().unwrap();
    if !*done {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        *done = true;
    }
}
