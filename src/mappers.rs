//! Local record ↔ remote row translation.
//!
//! Every synced entity maps to a JSON row of its remote table. Both
//! directions cover every field: `from_remote` tolerates the loose typing the
//! remote hands back (numbers as strings, floats for integer money, missing
//! optional columns) and fills defaults, `to_remote` truncates identity codes
//! to the remote column limit.

use chrono::{DateTime, Utc};
use serde_json::{json, Map, Value};

use crate::error::RemoteError;
use crate::models::{
    format_ts, now_millis, parse_ts, CatalogItem, Customer, Gender, PaymentMethod, RecordState,
    Return, Sale, SaleLine, Shift, SizeBucket, SizeStock, MAX_CODE_LEN,
};
use crate::store::Record;

/// A record that has a remote row shape.
pub trait RemoteMapping: Record {
    fn to_remote(&self) -> Value;
    /// Build a clean local record from a remote row.
    fn from_remote(row: &Value) -> Result<Self, RemoteError>;
}

// ---------------------------------------------------------------------------
// Field helpers
// ---------------------------------------------------------------------------

fn object(row: &Value) -> Result<&Map<String, Value>, RemoteError> {
    row.as_object()
        .ok_or_else(|| RemoteError::Decode(format!("expected a row object, got {row}")))
}

fn present<'a>(row: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    row.get(key).filter(|v| !v.is_null())
}

fn opt_str(row: &Map<String, Value>, key: &str) -> Option<String> {
    match present(row, key)? {
        Value::String(s) => {
            let trimmed = s.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn req_str(row: &Map<String, Value>, key: &str) -> Result<String, RemoteError> {
    opt_str(row, key).ok_or_else(|| RemoteError::Decode(format!("missing field '{key}'")))
}

fn opt_i64(row: &Map<String, Value>, key: &str) -> Option<i64> {
    match present(row, key)? {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| s.parse::<f64>().ok().map(|f| f.round() as i64))
        }
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn int_or(row: &Map<String, Value>, key: &str, default: i64) -> i64 {
    opt_i64(row, key).unwrap_or(default)
}

fn req_i64(row: &Map<String, Value>, key: &str) -> Result<i64, RemoteError> {
    opt_i64(row, key).ok_or_else(|| RemoteError::Decode(format!("missing or non-numeric '{key}'")))
}

fn bool_or(row: &Map<String, Value>, key: &str, default: bool) -> bool {
    match present(row, key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64().map_or(default, |v| v != 0),
        Some(Value::String(s)) => matches!(s.trim().to_ascii_lowercase().as_str(), "true" | "t" | "1"),
        _ => default,
    }
}

fn opt_ts(row: &Map<String, Value>, key: &str) -> Option<DateTime<Utc>> {
    present(row, key).and_then(Value::as_str).and_then(parse_ts)
}

fn req_ts(row: &Map<String, Value>, key: &str) -> Result<DateTime<Utc>, RemoteError> {
    opt_ts(row, key).ok_or_else(|| RemoteError::Decode(format!("missing or invalid timestamp '{key}'")))
}

/// Remote rows are remote-confirmed: clean, synced, with the remote's own
/// timestamps. A row without `updated_at` falls back to `created_at`.
fn remote_state(row: &Map<String, Value>) -> RecordState {
    let created = opt_ts(row, "created_at");
    let updated = opt_ts(row, "updated_at").or(created).unwrap_or_else(now_millis);
    RecordState::remote(created.unwrap_or(updated), updated)
}

fn stamp(row: &mut Value, state: &RecordState) {
    if let Some(obj) = row.as_object_mut() {
        obj.insert("created_at".into(), json!(format_ts(&state.created_at)));
        obj.insert("updated_at".into(), json!(format_ts(&state.updated_at)));
    }
}

/// Identity codes are limited to 15 characters remotely.
pub fn truncate_code(code: &str) -> String {
    code.trim().chars().take(MAX_CODE_LEN).collect()
}

// ---------------------------------------------------------------------------
// Entity mappings
// ---------------------------------------------------------------------------

impl RemoteMapping for CatalogItem {
    fn to_remote(&self) -> Value {
        let mut row = json!({
            "code": truncate_code(&self.code),
            "name": self.title,
            "price": self.price,
            "xs": self.stock.xs,
            "s": self.stock.s,
            "m": self.stock.m,
            "l": self.stock.l,
            "xl": self.stock.xl,
            "total": self.stock.total(),
            "gender": self.gender.as_str(),
            "description": self.description,
        });
        stamp(&mut row, &self.state);
        row
    }

    fn from_remote(row: &Value) -> Result<Self, RemoteError> {
        let r = object(row)?;
        let bucket = |key: &str| int_or(r, key, 0).max(0);
        let stock = SizeStock {
            xs: bucket("xs"),
            s: bucket("s"),
            m: bucket("m"),
            l: bucket("l"),
            xl: bucket("xl"),
        };
        Ok(Self {
            code: truncate_code(&req_str(r, "code")?),
            title: opt_str(r, "name").unwrap_or_default(),
            price: int_or(r, "price", 0).max(0),
            total: stock.total(),
            stock,
            gender: opt_str(r, "gender")
                .and_then(|g| g.parse::<Gender>().ok())
                .unwrap_or_default(),
            description: opt_str(r, "description").unwrap_or_default(),
            state: remote_state(r),
        })
    }
}

impl RemoteMapping for Customer {
    fn to_remote(&self) -> Value {
        let mut row = json!({
            "document": self.id_number,
            "document_type": self.customer_type,
            "name": self.name,
            "phone": self.phone,
            "email": self.email,
            "address": self.address,
        });
        stamp(&mut row, &self.state);
        row
    }

    fn from_remote(row: &Value) -> Result<Self, RemoteError> {
        let r = object(row)?;
        Ok(Self {
            id_number: req_str(r, "document")?,
            customer_type: opt_str(r, "document_type").unwrap_or_else(|| "CC".to_string()),
            name: opt_str(r, "name").unwrap_or_default(),
            phone: opt_str(r, "phone"),
            email: opt_str(r, "email"),
            address: opt_str(r, "address"),
            state: remote_state(r),
        })
    }
}

impl RemoteMapping for Shift {
    fn to_remote(&self) -> Value {
        let mut row = json!({
            "id": self.id,
            "terminal_id": self.terminal_id,
            "opened_by": self.opened_by,
            "opened_at": format_ts(&self.opened_at),
            "initial_cash": self.initial_cash,
            "closed_at": self.closed_at.as_ref().map(format_ts),
            "counted_cash": self.counted_cash,
            "expected_cash": self.expected_cash,
            "variance": self.variance,
            "active": self.active,
        });
        stamp(&mut row, &self.state);
        row
    }

    fn from_remote(row: &Value) -> Result<Self, RemoteError> {
        let r = object(row)?;
        let state = remote_state(r);
        Ok(Self {
            id: req_str(r, "id")?,
            terminal_id: opt_str(r, "terminal_id").unwrap_or_default(),
            opened_by: opt_str(r, "opened_by"),
            opened_at: opt_ts(r, "opened_at").unwrap_or(state.created_at),
            initial_cash: int_or(r, "initial_cash", 0),
            closed_at: opt_ts(r, "closed_at"),
            counted_cash: opt_i64(r, "counted_cash"),
            expected_cash: opt_i64(r, "expected_cash"),
            variance: opt_i64(r, "variance"),
            active: bool_or(r, "active", false),
            state,
        })
    }
}

impl RemoteMapping for Sale {
    fn to_remote(&self) -> Value {
        let mut row = json!({
            "id": self.id,
            "total": self.total,
            "item_count": self.item_count,
            "payment_method": self.payment_method.as_str(),
            "shift_id": self.shift_id,
            "customer_id": self.customer_id,
            "employee_id": self.employee_id,
        });
        stamp(&mut row, &self.state);
        row
    }

    fn from_remote(row: &Value) -> Result<Self, RemoteError> {
        let r = object(row)?;
        Ok(Self {
            id: req_str(r, "id")?,
            total: req_i64(r, "total")?,
            item_count: int_or(r, "item_count", 0),
            payment_method: opt_str(r, "payment_method")
                .and_then(|p| p.parse::<PaymentMethod>().ok())
                .unwrap_or(PaymentMethod::Other),
            shift_id: opt_str(r, "shift_id"),
            customer_id: opt_str(r, "customer_id"),
            employee_id: opt_str(r, "employee_id"),
            state: remote_state(r),
        })
    }
}

impl RemoteMapping for SaleLine {
    fn to_remote(&self) -> Value {
        let mut row = json!({
            "id": self.line_id,
            "seq": self.seq,
            "sale_id": self.sale_id,
            "line_no": self.line_no,
            "product_code": truncate_code(&self.product_code),
            "size": self.size.as_str(),
            "quantity": self.quantity,
            "unit_price": self.unit_price,
        });
        stamp(&mut row, &self.state);
        row
    }

    fn from_remote(row: &Value) -> Result<Self, RemoteError> {
        let r = object(row)?;
        let size = req_str(r, "size")?;
        Ok(Self {
            line_id: req_str(r, "id")?,
            seq: int_or(r, "seq", 0),
            sale_id: req_str(r, "sale_id")?,
            line_no: req_i64(r, "line_no")?,
            product_code: truncate_code(&req_str(r, "product_code")?),
            size: size
                .parse::<SizeBucket>()
                .map_err(|e| RemoteError::Decode(e.to_string()))?,
            quantity: int_or(r, "quantity", 1),
            unit_price: int_or(r, "unit_price", 0),
            state: remote_state(r),
        })
    }
}

impl RemoteMapping for Return {
    fn to_remote(&self) -> Value {
        let mut row = json!({
            "id": self.id,
            "product_code": truncate_code(&self.item_code),
            "size": self.size.map(SizeBucket::as_str),
            "quantity": self.quantity,
            "reason": self.reason,
            "refund_amount": self.refund_amount,
            "purchase_date": format_ts(&self.purchase_date),
            "shift_id": self.shift_id,
        });
        stamp(&mut row, &self.state);
        row
    }

    fn from_remote(row: &Value) -> Result<Self, RemoteError> {
        let r = object(row)?;
        Ok(Self {
            id: req_str(r, "id")?,
            item_code: truncate_code(&req_str(r, "product_code")?),
            size: opt_str(r, "size").and_then(|s| s.parse::<SizeBucket>().ok()),
            quantity: int_or(r, "quantity", 1).max(1),
            reason: opt_str(r, "reason").unwrap_or_default(),
            refund_amount: int_or(r, "refund_amount", 0),
            purchase_date: req_ts(r, "purchase_date")?,
            shift_id: opt_str(r, "shift_id"),
            state: remote_state(r),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn clean_state() -> RecordState {
        let now = now_millis();
        RecordState::remote(now - Duration::days(1), now)
    }

    #[test]
    fn test_catalog_item_round_trip_keeps_identity_price_and_buckets() {
        let mut item = CatalogItem::new("T-001", "Basic tee", 25000)
            .with_stock(SizeBucket::Xs, 1)
            .with_stock(SizeBucket::M, 10)
            .with_stock(SizeBucket::Xl, 2);
        item.gender = Gender::Women;
        item.description = "Cotton".into();
        item.state = clean_state();

        let back = CatalogItem::from_remote(&item.to_remote()).unwrap();
        assert_eq!(back, item);
    }

    #[test]
    fn test_catalog_item_from_loose_remote_row() {
        let row = json!({
            "code": "  ABCDEFGHIJKLMNOPQR ",
            "name": "Scarf",
            "price": "12500.0",
            "m": "3",
            "l": -2,
            "xl": null,
            "gender": "something-new",
            "updated_at": "2026-03-01 10:15:30.123+00",
        });
        let item = CatalogItem::from_remote(&row).unwrap();
        assert_eq!(item.code, "ABCDEFGHIJKLMNO");
        assert_eq!(item.price, 12500);
        assert_eq!(item.stock.m, 3);
        assert_eq!(item.stock.l, 0);
        assert_eq!(item.total, 3);
        assert_eq!(item.gender, Gender::Unisex);
        assert!(!item.state.dirty);
        assert_eq!(item.state.created_at, item.state.updated_at);
    }

    #[test]
    fn test_missing_identity_is_a_decode_error() {
        assert!(matches!(
            CatalogItem::from_remote(&json!({"name": "No code"})),
            Err(RemoteError::Decode(_))
        ));
        assert!(matches!(
            Customer::from_remote(&json!([1, 2])),
            Err(RemoteError::Decode(_))
        ));
    }

    #[test]
    fn test_shift_and_return_round_trip() {
        let now = now_millis();
        let shift = Shift {
            id: "s-1".into(),
            terminal_id: "till-1".into(),
            opened_by: Some("op-7".into()),
            opened_at: now - Duration::hours(8),
            initial_cash: 200_000,
            closed_at: Some(now),
            counted_cash: Some(710_000),
            expected_cash: Some(700_000),
            variance: Some(10_000),
            active: false,
            state: clean_state(),
        };
        assert_eq!(Shift::from_remote(&shift.to_remote()).unwrap(), shift);

        let ret = Return {
            id: "r-1".into(),
            item_code: "T-001".into(),
            size: Some(SizeBucket::L),
            quantity: 2,
            reason: "Wrong size".into(),
            refund_amount: 50_000,
            purchase_date: now - Duration::days(2),
            shift_id: Some("s-1".into()),
            state: clean_state(),
        };
        assert_eq!(Return::from_remote(&ret.to_remote()).unwrap(), ret);
    }

    #[test]
    fn test_sale_and_line_round_trip() {
        let sale = Sale {
            id: "sale-1".into(),
            total: 50_000,
            item_count: 2,
            payment_method: PaymentMethod::Card,
            shift_id: Some("s-1".into()),
            customer_id: None,
            employee_id: Some("op-7".into()),
            state: clean_state(),
        };
        assert_eq!(Sale::from_remote(&sale.to_remote()).unwrap(), sale);

        let line = SaleLine {
            line_id: "sale-1:1".into(),
            seq: 177_000_000_000_001,
            sale_id: "sale-1".into(),
            line_no: 1,
            product_code: "T-001".into(),
            size: SizeBucket::M,
            quantity: 2,
            unit_price: 25_000,
            state: clean_state(),
        };
        assert_eq!(SaleLine::from_remote(&line.to_remote()).unwrap(), line);
    }
}
