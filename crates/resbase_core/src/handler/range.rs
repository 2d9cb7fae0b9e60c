//! Date range handler (composite, two nullable bound columns).

use super::domain::parse_range;
use super::{
    expect_row, require_stored, wrong_type, AttributeError, AttributeHandler, AttributeResult,
};
use crate::model::flags::Conditions;
use crate::model::ids::ValueId;
use crate::model::value::{date_from_millis, parse_date, AttributeValue, DateRange, RawValue};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

const TABLE: &str = "av_date_range";

#[derive(Debug, Default)]
pub struct DateRangeHandler;

impl DateRangeHandler {
    pub fn new() -> Self {
        Self
    }

    fn range(value: &AttributeValue) -> AttributeResult<&DateRange> {
        match value {
            AttributeValue::DateRange(range) => Ok(range),
            other => Err(wrong_type("date_range", other)),
        }
    }

    fn bounds(range: &DateRange) -> (Option<i64>, Option<i64>) {
        (
            range.start().map(|date| date.timestamp_millis()),
            range.end().map(|date| date.timestamp_millis()),
        )
    }
}

fn stored_bound(millis: Option<i64>) -> AttributeResult<Option<DateTime<Utc>>> {
    millis
        .map(|millis| {
            date_from_millis(millis).ok_or_else(|| {
                AttributeError::invalid(format!("stored range bound {millis} is out of range"))
            })
        })
        .transpose()
}

impl AttributeHandler for DateRangeHandler {
    fn type_name(&self) -> &'static str {
        "date_range"
    }

    fn value_table(&self) -> &'static str {
        TABLE
    }

    fn column_type(&self) -> &'static str {
        "INTEGER"
    }

    fn supports_external_string(&self) -> bool {
        false
    }

    fn is_composite(&self) -> bool {
        true
    }

    fn supported_conditions(&self) -> Conditions {
        Conditions::EQUALITY | Conditions::COMPARISON
    }

    fn create(&self, conn: &Connection, value: &AttributeValue) -> AttributeResult<ValueId> {
        let (start, end) = Self::bounds(Self::range(value)?);
        conn.execute(
            "INSERT INTO av_date_range (range_start, range_end) VALUES (?1, ?2);",
            params![start, end],
        )?;
        Ok(ValueId(conn.last_insert_rowid()))
    }

    fn retrieve(&self, conn: &Connection, id: ValueId) -> AttributeResult<AttributeValue> {
        require_stored(TABLE, id)?;
        let row: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT range_start, range_end FROM av_date_range WHERE value_id = ?1;",
                [id.get()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let (start, end) = row.ok_or(AttributeError::EntityNotFound {
            entity: TABLE,
            id: id.get(),
        })?;
        DateRange::new(stored_bound(start)?, stored_bound(end)?)
            .map(AttributeValue::DateRange)
            .map_err(AttributeError::invalid)
    }

    fn update(&self, conn: &Connection, id: ValueId, value: &AttributeValue) -> AttributeResult<()> {
        require_stored(TABLE, id)?;
        let (start, end) = Self::bounds(Self::range(value)?);
        let changed = conn.execute(
            "UPDATE av_date_range SET range_start = ?1, range_end = ?2 WHERE value_id = ?3;",
            params![start, end, id.get()],
        )?;
        expect_row(changed, TABLE, id)
    }

    fn delete(&self, conn: &Connection, id: ValueId) -> AttributeResult<()> {
        require_stored(TABLE, id)?;
        let changed = conn.execute("DELETE FROM av_date_range WHERE value_id = ?1;", [id.get()])?;
        expect_row(changed, TABLE, id)
    }

    fn to_attribute_value(
        &self,
        _conn: &Connection,
        raw: RawValue,
    ) -> AttributeResult<Option<AttributeValue>> {
        match raw {
            RawValue::Null => Ok(None),
            RawValue::Value(AttributeValue::DateRange(range)) => {
                Ok(Some(AttributeValue::DateRange(range)))
            }
            RawValue::Value(AttributeValue::Date(date)) => DateRange::new(Some(date), Some(date))
                .map(|range| Some(AttributeValue::DateRange(range)))
                .map_err(AttributeError::invalid),
            RawValue::Value(other) => Err(wrong_type("date_range", &other)),
            RawValue::Text(text) => DateRange::parse(&text)
                .map(|range| Some(AttributeValue::DateRange(range)))
                .map_err(AttributeError::invalid),
            other => Err(AttributeError::invalid(format!("{other:?} is not a date range"))),
        }
    }

    fn to_external_string(&self, value: &AttributeValue) -> AttributeResult<String> {
        Self::range(value).map(ToString::to_string)
    }

    /// Domain `start..end`: both bounds of the value must lie inside it; an
    /// open value bound fails against a closed domain bound.
    fn check_domain(
        &self,
        _conn: &Connection,
        domain: &str,
        value: Option<&AttributeValue>,
    ) -> AttributeResult<()> {
        let (low, high) = parse_range(domain, parse_date)?;
        let Some(value) = value else {
            return Ok(());
        };
        let range = Self::range(value)?;
        let starts_early = match (low, range.start()) {
            (Some(low), Some(start)) => start < low,
            (Some(_), None) => true,
            (None, _) => false,
        };
        let ends_late = match (high, range.end()) {
            (Some(high), Some(end)) => end > high,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if starts_early || ends_late {
            return Err(AttributeError::violation(format!(
                "range {range} is outside domain `{domain}`"
            )));
        }
        Ok(())
    }

    fn is_value_modified(&self, value: &AttributeValue) -> bool {
        matches!(value, AttributeValue::DateRange(range) if range.is_dirty())
    }
}

#[cfg(test)]
mod tests {
    use super::DateRangeHandler;
    use crate::handler::{AttributeError, AttributeHandler};
    use crate::model::value::{AttributeValue, DateRange, RawValue};
    use rusqlite::Connection;

    fn range(text: &str) -> AttributeValue {
        AttributeValue::DateRange(DateRange::parse(text).unwrap())
    }

    #[test]
    fn domain_requires_value_inside_bounds() {
        let conn = Connection::open_in_memory().unwrap();
        let handler = DateRangeHandler::new();
        let domain = "2024-01-01..2024-12-31";
        assert!(handler
            .check_domain(&conn, domain, Some(&range("2024-02-01/2024-03-01")))
            .is_ok());
        assert!(matches!(
            handler.check_domain(&conn, domain, Some(&range("2023-12-01/2024-03-01"))),
            Err(AttributeError::ConstraintViolation(_))
        ));
        assert!(handler
            .check_domain(&conn, domain, Some(&range("2024-02-01/")))
            .is_err());
        assert!(handler.check_domain(&conn, "soon", None).is_err());
    }

    #[test]
    fn converts_text_and_single_dates() {
        let conn = Connection::open_in_memory().unwrap();
        let handler = DateRangeHandler::new();
        let parsed = handler
            .to_attribute_value(&conn, RawValue::from("2024-01-01/2024-01-02"))
            .unwrap()
            .unwrap();
        assert_eq!(parsed, range("2024-01-01/2024-01-02"));
        assert!(handler
            .to_attribute_value(&conn, RawValue::Integer(3))
            .is_err());
    }
}
