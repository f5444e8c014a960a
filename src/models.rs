//! Canonical record shapes for every table the terminal persists.
//!
//! One struct per entity at the current schema version; older row shapes are
//! upgraded in place by the migrations in [`crate::db`].

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum length of a catalog identity code, local and remote.
pub const MAX_CODE_LEN: usize = 15;

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Every synced local table, with its remote counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    CatalogItems,
    Customers,
    Shifts,
    Sales,
    SaleLines,
    Returns,
}

impl Table {
    /// Push order: referenced rows go up before the rows that reference them.
    pub const ALL: [Table; 6] = [
        Table::CatalogItems,
        Table::Customers,
        Table::Shifts,
        Table::Sales,
        Table::SaleLines,
        Table::Returns,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Table::CatalogItems => "catalog_items",
            Table::Customers => "customers",
            Table::Shifts => "shifts",
            Table::Sales => "sales",
            Table::SaleLines => "sale_lines",
            Table::Returns => "returns",
        }
    }

    pub fn key_column(self) -> &'static str {
        match self {
            Table::CatalogItems => "code",
            Table::Customers => "id_number",
            Table::SaleLines => "line_id",
            Table::Shifts | Table::Sales | Table::Returns => "id",
        }
    }

    pub fn remote_name(self) -> &'static str {
        match self {
            Table::CatalogItems => "products",
            Table::Customers => "clients",
            Table::Shifts => "cash_shifts",
            Table::Sales => "sales",
            Table::SaleLines => "sale_details",
            Table::Returns => "returns",
        }
    }

    pub fn remote_key(self) -> &'static str {
        match self {
            Table::CatalogItems => "code",
            Table::Customers => "document",
            Table::SaleLines | Table::Shifts | Table::Sales | Table::Returns => "id",
        }
    }

    pub fn from_remote_name(name: &str) -> Option<Table> {
        Table::ALL.into_iter().find(|t| t.remote_name() == name)
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// Current time truncated to milliseconds, the precision timestamps are
/// persisted with. Keeps in-memory records equal to what a re-read returns.
pub fn now_millis() -> DateTime<Utc> {
    truncate_millis(Utc::now())
}

pub fn truncate_millis(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ts.timestamp_millis()).unwrap_or(ts)
}

/// Fixed-width RFC 3339 so stored timestamps compare lexicographically.
pub fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn parse_ts(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(truncate_millis(dt.with_timezone(&Utc)));
    }
    // Postgres `timestamptz` text without the `T` separator.
    DateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dt| truncate_millis(dt.with_timezone(&Utc)))
}

// ---------------------------------------------------------------------------
// Enumerations
// ---------------------------------------------------------------------------

macro_rules! sql_text_enum {
    ($ty:ty) => {
        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: ValidationError| FromSqlError::Other(Box::new(e)))
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

/// One of the five fixed per-size stock counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeBucket {
    Xs,
    S,
    M,
    L,
    Xl,
}

impl SizeBucket {
    pub const ALL: [SizeBucket; 5] = [
        SizeBucket::Xs,
        SizeBucket::S,
        SizeBucket::M,
        SizeBucket::L,
        SizeBucket::Xl,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SizeBucket::Xs => "xs",
            SizeBucket::S => "s",
            SizeBucket::M => "m",
            SizeBucket::L => "l",
            SizeBucket::Xl => "xl",
        }
    }
}

impl FromStr for SizeBucket {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "xs" => Ok(SizeBucket::Xs),
            "s" => Ok(SizeBucket::S),
            "m" => Ok(SizeBucket::M),
            "l" => Ok(SizeBucket::L),
            "xl" => Ok(SizeBucket::Xl),
            other => Err(ValidationError::UnknownValue {
                field: "size",
                value: other.to_string(),
            }),
        }
    }
}

sql_text_enum!(SizeBucket);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Men,
    Women,
    #[default]
    Unisex,
    Kids,
}

impl Gender {
    pub fn as_str(self) -> &'static str {
        match self {
            Gender::Men => "men",
            Gender::Women => "women",
            Gender::Unisex => "unisex",
            Gender::Kids => "kids",
        }
    }
}

impl FromStr for Gender {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "men" | "man" | "male" | "m" => Ok(Gender::Men),
            "women" | "woman" | "female" | "f" | "w" => Ok(Gender::Women),
            "unisex" | "u" | "" => Ok(Gender::Unisex),
            "kids" | "kid" | "children" | "k" => Ok(Gender::Kids),
            other => Err(ValidationError::UnknownValue {
                field: "gender",
                value: other.to_string(),
            }),
        }
    }
}

sql_text_enum!(Gender);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentMethod {
    Cash,
    Card,
    Transfer,
    Other,
}

impl PaymentMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Card => "card",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Other => "other",
        }
    }
}

impl FromStr for PaymentMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cash" => Ok(PaymentMethod::Cash),
            "card" | "credit" | "debit" => Ok(PaymentMethod::Card),
            "transfer" | "bank_transfer" => Ok(PaymentMethod::Transfer),
            "other" => Ok(PaymentMethod::Other),
            other => Err(ValidationError::UnknownValue {
                field: "payment_method",
                value: other.to_string(),
            }),
        }
    }
}

sql_text_enum!(PaymentMethod);

// ---------------------------------------------------------------------------
// Bookkeeping shared by every synced record
// ---------------------------------------------------------------------------

/// Dirty / tombstone / timestamp bookkeeping carried by every synced row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordState {
    /// Modified locally since the last confirmed push.
    pub dirty: bool,
    /// Tombstone; the row is removed physically once the delete is pushed.
    pub deleted: bool,
    /// The row reached the remote at least once.
    pub synced_once: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RecordState {
    pub fn new_local(now: DateTime<Utc>) -> Self {
        Self {
            dirty: true,
            deleted: false,
            synced_once: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn remote(created_at: DateTime<Utc>, updated_at: DateTime<Utc>) -> Self {
        Self {
            dirty: false,
            deleted: false,
            synced_once: true,
            created_at,
            updated_at,
        }
    }
}

impl Default for RecordState {
    fn default() -> Self {
        Self::new_local(now_millis())
    }
}

// ---------------------------------------------------------------------------
// Catalog
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SizeStock {
    pub xs: i64,
    pub s: i64,
    pub m: i64,
    pub l: i64,
    pub xl: i64,
}

impl SizeStock {
    pub fn get(&self, bucket: SizeBucket) -> i64 {
        match bucket {
            SizeBucket::Xs => self.xs,
            SizeBucket::S => self.s,
            SizeBucket::M => self.m,
            SizeBucket::L => self.l,
            SizeBucket::Xl => self.xl,
        }
    }

    pub fn set(&mut self, bucket: SizeBucket, value: i64) {
        match bucket {
            SizeBucket::Xs => self.xs = value,
            SizeBucket::S => self.s = value,
            SizeBucket::M => self.m = value,
            SizeBucket::L => self.l = value,
            SizeBucket::Xl => self.xl = value,
        }
    }

    pub fn total(&self) -> i64 {
        SizeBucket::ALL
            .iter()
            .fold(0_i64, |acc, b| acc.saturating_add(self.get(*b)))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogItem {
    pub code: String,
    pub title: String,
    /// Unit price in minor currency units.
    pub price: i64,
    pub stock: SizeStock,
    /// Always `stock.total()`; recomputed on every write.
    pub total: i64,
    pub gender: Gender,
    pub description: String,
    pub state: RecordState,
}

impl CatalogItem {
    pub fn new(code: impl Into<String>, title: impl Into<String>, price: i64) -> Self {
        Self {
            code: code.into(),
            title: title.into(),
            price,
            stock: SizeStock::default(),
            total: 0,
            gender: Gender::default(),
            description: String::new(),
            state: RecordState::default(),
        }
    }

    pub fn with_stock(mut self, bucket: SizeBucket, count: i64) -> Self {
        self.stock.set(bucket, count);
        self.total = self.stock.total();
        self
    }
}

// ---------------------------------------------------------------------------
// Sales
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sale {
    pub id: String,
    /// Minor currency units.
    pub total: i64,
    pub item_count: i64,
    pub payment_method: PaymentMethod,
    pub shift_id: Option<String>,
    pub customer_id: Option<String>,
    pub employee_id: Option<String>,
    pub state: RecordState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaleLine {
    /// `<sale id>:<line no>`, unique on every terminal.
    pub line_id: String,
    /// Time-seeded and strictly increasing on the terminal that sold it.
    pub seq: i64,
    pub sale_id: String,
    /// 1-based position within the sale.
    pub line_no: i64,
    pub product_code: String,
    pub size: SizeBucket,
    pub quantity: i64,
    pub unit_price: i64,
    pub state: RecordState,
}

// ---------------------------------------------------------------------------
// Returns
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Return {
    pub id: String,
    pub item_code: String,
    /// Bucket restocked by the return, when the size is known.
    pub size: Option<SizeBucket>,
    pub quantity: i64,
    pub reason: String,
    pub refund_amount: i64,
    pub purchase_date: DateTime<Utc>,
    pub shift_id: Option<String>,
    pub state: RecordState,
}

// ---------------------------------------------------------------------------
// Customers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Customer {
    /// External identity document number.
    pub id_number: String,
    pub customer_type: String,
    pub name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub address: Option<String>,
    pub state: RecordState,
}

impl Customer {
    /// Compare domain fields only, ignoring bookkeeping.
    pub fn same_content(&self, other: &Customer) -> bool {
        self.id_number == other.id_number
            && self.customer_type == other.customer_type
            && self.name == other.name
            && self.phone == other.phone
            && self.email == other.email
            && self.address == other.address
    }
}

// ---------------------------------------------------------------------------
// Shifts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shift {
    pub id: String,
    pub terminal_id: String,
    pub opened_by: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub initial_cash: i64,
    pub closed_at: Option<DateTime<Utc>>,
    pub counted_cash: Option<i64>,
    pub expected_cash: Option<i64>,
    pub variance: Option<i64>,
    pub active: bool,
    pub state: RecordState,
}
