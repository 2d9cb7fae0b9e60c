//! Single-column scalar handlers.
//!
//! Every scalar type shares one side-table layout (`value_id`, `value`) and one
//! handler implementation; the per-type behavior lives in a `ScalarCodec`.

use super::domain::{check_in_range, compile_pattern, parse_range, require_empty};
use super::preload::PreloadCache;
use super::{
    expect_row, require_stored, wrong_type, AttributeError, AttributeHandler, AttributeResult,
};
use crate::model::flags::Conditions;
use crate::model::ids::ValueId;
use crate::model::value::{
    date_from_millis, format_date, parse_date, truncate_to_millis, AttributeValue, Decimal,
    RawValue,
};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, OptionalExtension};
use std::marker::PhantomData;

/// Maximum length of fixed-length string values, in characters.
pub const MAX_STRING_CHARS: usize = 255;

/// Per-type encoding, parsing and domain rules of a scalar attribute type.
pub trait ScalarCodec: Send + Sync + 'static {
    const TYPE_NAME: &'static str;
    const VALUE_TABLE: &'static str;
    const COLUMN_TYPE: &'static str;
    /// Stored inline in class table columns.
    const INLINE: bool;
    const CONDITIONS: Conditions;

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue>;
    fn decode(value: SqlValue) -> AttributeResult<AttributeValue>;
    fn parse(text: &str) -> AttributeResult<AttributeValue>;
    fn format(value: &AttributeValue) -> AttributeResult<String>;
    /// Converts a non-null raw input.
    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue>;
    fn check_domain(domain: &str, value: Option<&AttributeValue>) -> AttributeResult<()>;
}

/// Generic handler over a scalar codec, with an optional preload cache.
pub struct ScalarHandler<C: ScalarCodec> {
    preload: PreloadCache,
    codec: PhantomData<fn() -> C>,
}

impl<C: ScalarCodec> ScalarHandler<C> {
    pub fn new() -> Self {
        Self {
            preload: PreloadCache::default(),
            codec: PhantomData,
        }
    }

    /// Whether `activate` has filled the preload cache.
    pub fn is_preloaded(&self) -> bool {
        self.preload.is_active()
    }
}

impl<C: ScalarCodec> Default for ScalarHandler<C> {
    fn default() -> Self {
        Self::new()
    }
}

pub type BooleanHandler = ScalarHandler<BooleanCodec>;
pub type IntegerHandler = ScalarHandler<IntegerCodec>;
pub type LongHandler = ScalarHandler<LongCodec>;
pub type DecimalHandler = ScalarHandler<DecimalCodec>;
pub type DateHandler = ScalarHandler<DateCodec>;
pub type StringHandler = ScalarHandler<StringCodec>;
pub type TextHandler = ScalarHandler<TextCodec>;

impl<C: ScalarCodec> AttributeHandler for ScalarHandler<C> {
    fn type_name(&self) -> &'static str {
        C::TYPE_NAME
    }

    fn value_table(&self) -> &'static str {
        C::VALUE_TABLE
    }

    fn column_type(&self) -> &'static str {
        C::COLUMN_TYPE
    }

    fn supports_external_string(&self) -> bool {
        C::INLINE
    }

    fn supported_conditions(&self) -> Conditions {
        C::CONDITIONS
    }

    fn create(&self, conn: &Connection, value: &AttributeValue) -> AttributeResult<ValueId> {
        let encoded = C::encode(value)?;
        conn.execute(
            &format!("INSERT INTO {} (value) VALUES (?1);", C::VALUE_TABLE),
            params![encoded],
        )?;
        let id = ValueId(conn.last_insert_rowid());
        self.preload.invalidate(id);
        Ok(id)
    }

    fn retrieve(&self, conn: &Connection, id: ValueId) -> AttributeResult<AttributeValue> {
        require_stored(C::VALUE_TABLE, id)?;
        if let Some(value) = self.preload.get(id) {
            return Ok(value);
        }
        let stored: Option<SqlValue> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE value_id = ?1;", C::VALUE_TABLE),
                [id.get()],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored.ok_or(AttributeError::EntityNotFound {
            entity: C::VALUE_TABLE,
            id: id.get(),
        })?;
        let value = C::decode(stored)?;
        // Only committed rows may enter the cache.
        if conn.is_autocommit() {
            self.preload.put(id, &value);
        }
        Ok(value)
    }

    fn update(&self, conn: &Connection, id: ValueId, value: &AttributeValue) -> AttributeResult<()> {
        require_stored(C::VALUE_TABLE, id)?;
        let encoded = C::encode(value)?;
        let changed = conn.execute(
            &format!("UPDATE {} SET value = ?1 WHERE value_id = ?2;", C::VALUE_TABLE),
            params![encoded, id.get()],
        )?;
        self.preload.invalidate(id);
        expect_row(changed, C::VALUE_TABLE, id)
    }

    fn delete(&self, conn: &Connection, id: ValueId) -> AttributeResult<()> {
        require_stored(C::VALUE_TABLE, id)?;
        let changed = conn.execute(
            &format!("DELETE FROM {} WHERE value_id = ?1;", C::VALUE_TABLE),
            [id.get()],
        )?;
        self.preload.invalidate(id);
        expect_row(changed, C::VALUE_TABLE, id)
    }

    fn to_attribute_value(
        &self,
        _conn: &Connection,
        raw: RawValue,
    ) -> AttributeResult<Option<AttributeValue>> {
        match raw {
            RawValue::Null => Ok(None),
            RawValue::Text(text) => C::parse(&text).map(Some),
            other => C::coerce(other).map(Some),
        }
    }

    fn to_external_string(&self, value: &AttributeValue) -> AttributeResult<String> {
        C::format(value)
    }

    fn to_column(&self, value: &AttributeValue) -> AttributeResult<SqlValue> {
        if !C::INLINE {
            return Err(AttributeError::unsupported(format!(
                "{} values cannot be stored inline",
                C::TYPE_NAME
            )));
        }
        C::encode(value)
    }

    fn from_column(&self, value: SqlValue) -> AttributeResult<AttributeValue> {
        C::decode(value)
    }

    fn check_domain(
        &self,
        _conn: &Connection,
        domain: &str,
        value: Option<&AttributeValue>,
    ) -> AttributeResult<()> {
        C::check_domain(domain, value)
    }

    fn activate(&self, conn: &Connection) -> AttributeResult<usize> {
        let mut stmt = conn.prepare(&format!(
            "SELECT value_id, value FROM {} ORDER BY value_id;",
            C::VALUE_TABLE
        ))?;
        let mut rows = stmt.query([])?;
        let mut loaded = Vec::new();
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let value: SqlValue = row.get(1)?;
            loaded.push((id, C::decode(value)?));
        }
        Ok(self.preload.fill(loaded))
    }
}

fn stored_integer(type_name: &str, value: SqlValue) -> AttributeResult<i64> {
    match value {
        SqlValue::Integer(number) => Ok(number),
        other => Err(AttributeError::invalid(format!(
            "stored {type_name} value has column type {:?}",
            other.data_type()
        ))),
    }
}

fn stored_text(type_name: &str, value: SqlValue) -> AttributeResult<String> {
    match value {
        SqlValue::Text(text) => Ok(text),
        other => Err(AttributeError::invalid(format!(
            "stored {type_name} value has column type {:?}",
            other.data_type()
        ))),
    }
}

fn parse_i64(text: &str) -> Result<i64, String> {
    text.trim()
        .parse::<i64>()
        .map_err(|err| format!("`{text}`: {err}"))
}

pub struct BooleanCodec;

impl ScalarCodec for BooleanCodec {
    const TYPE_NAME: &'static str = "boolean";
    const VALUE_TABLE: &'static str = "av_boolean";
    const COLUMN_TYPE: &'static str = "INTEGER";
    const INLINE: bool = true;
    const CONDITIONS: Conditions = Conditions::EQUALITY;

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue> {
        match value {
            AttributeValue::Boolean(flag) => Ok(SqlValue::Integer(i64::from(*flag))),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn decode(value: SqlValue) -> AttributeResult<AttributeValue> {
        match stored_integer(Self::TYPE_NAME, value)? {
            0 => Ok(AttributeValue::Boolean(false)),
            1 => Ok(AttributeValue::Boolean(true)),
            other => Err(AttributeError::invalid(format!(
                "stored boolean value {other} is not 0 or 1"
            ))),
        }
    }

    fn parse(text: &str) -> AttributeResult<AttributeValue> {
        match text.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(AttributeValue::Boolean(true)),
            "false" | "0" | "no" => Ok(AttributeValue::Boolean(false)),
            _ => Err(AttributeError::invalid(format!("`{text}` is not a boolean"))),
        }
    }

    fn format(value: &AttributeValue) -> AttributeResult<String> {
        match value {
            AttributeValue::Boolean(flag) => Ok(flag.to_string()),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue> {
        match raw {
            RawValue::Boolean(flag) => Ok(AttributeValue::Boolean(flag)),
            RawValue::Integer(0) => Ok(AttributeValue::Boolean(false)),
            RawValue::Integer(1) => Ok(AttributeValue::Boolean(true)),
            RawValue::Value(AttributeValue::Boolean(flag)) => Ok(AttributeValue::Boolean(flag)),
            RawValue::Value(other) => Err(wrong_type(Self::TYPE_NAME, &other)),
            other => Err(AttributeError::invalid(format!("{other:?} is not a boolean"))),
        }
    }

    fn check_domain(domain: &str, _value: Option<&AttributeValue>) -> AttributeResult<()> {
        require_empty(Self::TYPE_NAME, domain)
    }
}

pub struct IntegerCodec;

impl IntegerCodec {
    fn narrow(number: i64) -> AttributeResult<AttributeValue> {
        i32::try_from(number)
            .map(AttributeValue::Integer)
            .map_err(|_| AttributeError::invalid(format!("{number} does not fit a 32-bit integer")))
    }
}

impl ScalarCodec for IntegerCodec {
    const TYPE_NAME: &'static str = "integer";
    const VALUE_TABLE: &'static str = "av_integer";
    const COLUMN_TYPE: &'static str = "INTEGER";
    const INLINE: bool = true;
    const CONDITIONS: Conditions = Conditions::EQUALITY.union(Conditions::COMPARISON);

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue> {
        match value {
            AttributeValue::Integer(number) => Ok(SqlValue::Integer(i64::from(*number))),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn decode(value: SqlValue) -> AttributeResult<AttributeValue> {
        Self::narrow(stored_integer(Self::TYPE_NAME, value)?)
    }

    fn parse(text: &str) -> AttributeResult<AttributeValue> {
        Self::narrow(parse_i64(text).map_err(AttributeError::invalid)?)
    }

    fn format(value: &AttributeValue) -> AttributeResult<String> {
        match value {
            AttributeValue::Integer(number) => Ok(number.to_string()),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue> {
        match raw {
            RawValue::Integer(number) => Self::narrow(number),
            RawValue::Value(AttributeValue::Integer(number)) => Ok(AttributeValue::Integer(number)),
            RawValue::Value(AttributeValue::Long(number)) => Self::narrow(number),
            RawValue::Value(other) => Err(wrong_type(Self::TYPE_NAME, &other)),
            other => Err(AttributeError::invalid(format!("{other:?} is not an integer"))),
        }
    }

    fn check_domain(domain: &str, value: Option<&AttributeValue>) -> AttributeResult<()> {
        let bounds = parse_range(domain, parse_i64)?;
        match value {
            None => Ok(()),
            Some(AttributeValue::Integer(number)) => {
                check_in_range(domain, &bounds, &i64::from(*number), &number.to_string())
            }
            Some(other) => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }
}

pub struct LongCodec;

impl ScalarCodec for LongCodec {
    const TYPE_NAME: &'static str = "long";
    const VALUE_TABLE: &'static str = "av_long";
    const COLUMN_TYPE: &'static str = "INTEGER";
    const INLINE: bool = true;
    const CONDITIONS: Conditions = Conditions::EQUALITY.union(Conditions::COMPARISON);

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue> {
        match value {
            AttributeValue::Long(number) => Ok(SqlValue::Integer(*number)),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn decode(value: SqlValue) -> AttributeResult<AttributeValue> {
        stored_integer(Self::TYPE_NAME, value).map(AttributeValue::Long)
    }

    fn parse(text: &str) -> AttributeResult<AttributeValue> {
        parse_i64(text)
            .map(AttributeValue::Long)
            .map_err(AttributeError::invalid)
    }

    fn format(value: &AttributeValue) -> AttributeResult<String> {
        match value {
            AttributeValue::Long(number) => Ok(number.to_string()),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue> {
        match raw {
            RawValue::Integer(number) => Ok(AttributeValue::Long(number)),
            RawValue::Value(AttributeValue::Long(number)) => Ok(AttributeValue::Long(number)),
            RawValue::Value(AttributeValue::Integer(number)) => {
                Ok(AttributeValue::Long(i64::from(number)))
            }
            RawValue::Value(other) => Err(wrong_type(Self::TYPE_NAME, &other)),
            other => Err(AttributeError::invalid(format!("{other:?} is not a long"))),
        }
    }

    fn check_domain(domain: &str, value: Option<&AttributeValue>) -> AttributeResult<()> {
        let bounds = parse_range(domain, parse_i64)?;
        match value {
            None => Ok(()),
            Some(AttributeValue::Long(number)) => {
                check_in_range(domain, &bounds, number, &number.to_string())
            }
            Some(other) => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }
}

pub struct DecimalCodec;

impl ScalarCodec for DecimalCodec {
    const TYPE_NAME: &'static str = "decimal";
    const VALUE_TABLE: &'static str = "av_decimal";
    const COLUMN_TYPE: &'static str = "TEXT";
    const INLINE: bool = true;
    const CONDITIONS: Conditions = Conditions::EQUALITY.union(Conditions::COMPARISON);

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue> {
        match value {
            AttributeValue::Decimal(number) => Ok(SqlValue::Text(number.to_string())),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn decode(value: SqlValue) -> AttributeResult<AttributeValue> {
        let text = stored_text(Self::TYPE_NAME, value)?;
        Self::parse(&text)
    }

    fn parse(text: &str) -> AttributeResult<AttributeValue> {
        Decimal::parse(text)
            .map(AttributeValue::Decimal)
            .map_err(AttributeError::invalid)
    }

    fn format(value: &AttributeValue) -> AttributeResult<String> {
        match value {
            AttributeValue::Decimal(number) => Ok(number.to_string()),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue> {
        match raw {
            RawValue::Integer(number) => Ok(AttributeValue::Decimal(Decimal::from_i64(number))),
            RawValue::Value(AttributeValue::Decimal(number)) => Ok(AttributeValue::Decimal(number)),
            RawValue::Value(AttributeValue::Integer(number)) => {
                Ok(AttributeValue::Decimal(Decimal::from_i64(i64::from(number))))
            }
            RawValue::Value(AttributeValue::Long(number)) => {
                Ok(AttributeValue::Decimal(Decimal::from_i64(number)))
            }
            RawValue::Value(other) => Err(wrong_type(Self::TYPE_NAME, &other)),
            other => Err(AttributeError::invalid(format!("{other:?} is not a decimal"))),
        }
    }

    fn check_domain(domain: &str, value: Option<&AttributeValue>) -> AttributeResult<()> {
        let bounds = parse_range(domain, Decimal::parse)?;
        match value {
            None => Ok(()),
            Some(AttributeValue::Decimal(number)) => {
                check_in_range(domain, &bounds, number, &number.to_string())
            }
            Some(other) => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }
}

pub struct DateCodec;

impl ScalarCodec for DateCodec {
    const TYPE_NAME: &'static str = "date";
    const VALUE_TABLE: &'static str = "av_date";
    const COLUMN_TYPE: &'static str = "INTEGER";
    const INLINE: bool = true;
    const CONDITIONS: Conditions = Conditions::EQUALITY.union(Conditions::COMPARISON);

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue> {
        match value {
            AttributeValue::Date(date) => Ok(SqlValue::Integer(date.timestamp_millis())),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn decode(value: SqlValue) -> AttributeResult<AttributeValue> {
        let millis = stored_integer(Self::TYPE_NAME, value)?;
        date_from_millis(millis)
            .map(AttributeValue::Date)
            .ok_or_else(|| AttributeError::invalid(format!("stored date {millis} is out of range")))
    }

    fn parse(text: &str) -> AttributeResult<AttributeValue> {
        parse_date(text)
            .map(AttributeValue::Date)
            .map_err(AttributeError::invalid)
    }

    fn format(value: &AttributeValue) -> AttributeResult<String> {
        match value {
            AttributeValue::Date(date) => Ok(format_date(date)),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue> {
        match raw {
            RawValue::Integer(millis) => AttributeValue::date_from_millis(millis).ok_or_else(|| {
                AttributeError::invalid(format!("epoch milliseconds {millis} out of range"))
            }),
            RawValue::Value(AttributeValue::Date(date)) => {
                Ok(AttributeValue::Date(truncate_to_millis(date)))
            }
            RawValue::Value(other) => Err(wrong_type(Self::TYPE_NAME, &other)),
            other => Err(AttributeError::invalid(format!("{other:?} is not a date"))),
        }
    }

    fn check_domain(domain: &str, value: Option<&AttributeValue>) -> AttributeResult<()> {
        let bounds = parse_range(domain, parse_date)?;
        match value {
            None => Ok(()),
            Some(AttributeValue::Date(date)) => {
                check_in_range(domain, &bounds, date, &format_date(date))
            }
            Some(other) => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }
}

fn check_pattern(domain: &str, text: Option<&str>) -> AttributeResult<()> {
    let pattern = compile_pattern(domain)?;
    match text {
        Some(text) if !pattern.is_match(text) => Err(AttributeError::violation(format!(
            "value does not match domain `{domain}`"
        ))),
        _ => Ok(()),
    }
}

pub struct StringCodec;

impl StringCodec {
    /// Enforces the length limit and rejects control characters other than tab.
    fn escape(text: &str) -> AttributeResult<String> {
        let length = text.chars().count();
        if length > MAX_STRING_CHARS {
            return Err(AttributeError::invalid(format!(
                "string of {length} characters exceeds the {MAX_STRING_CHARS} character limit"
            )));
        }
        if let Some(bad) = text.chars().find(|c| c.is_control() && *c != '\t') {
            return Err(AttributeError::invalid(format!(
                "string contains control character U+{:04X}",
                u32::from(bad)
            )));
        }
        Ok(text.to_string())
    }
}

impl ScalarCodec for StringCodec {
    const TYPE_NAME: &'static str = "string";
    const VALUE_TABLE: &'static str = "av_string";
    const COLUMN_TYPE: &'static str = "TEXT";
    const INLINE: bool = true;
    const CONDITIONS: Conditions = Conditions::EQUALITY.union(Conditions::APPROXIMATION);

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue> {
        match value {
            AttributeValue::String(text) => Self::escape(text).map(SqlValue::Text),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn decode(value: SqlValue) -> AttributeResult<AttributeValue> {
        stored_text(Self::TYPE_NAME, value).map(AttributeValue::String)
    }

    fn parse(text: &str) -> AttributeResult<AttributeValue> {
        Self::escape(text).map(AttributeValue::String)
    }

    fn format(value: &AttributeValue) -> AttributeResult<String> {
        match value {
            AttributeValue::String(text) => Ok(text.clone()),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue> {
        match raw {
            RawValue::Value(AttributeValue::String(text) | AttributeValue::Text(text)) => {
                Self::parse(&text)
            }
            RawValue::Value(other) => Err(wrong_type(Self::TYPE_NAME, &other)),
            RawValue::Integer(number) => Ok(AttributeValue::String(number.to_string())),
            RawValue::Boolean(flag) => Ok(AttributeValue::String(flag.to_string())),
            RawValue::Text(text) => Self::parse(&text),
            RawValue::Null => Err(AttributeError::invalid("null is not a string")),
        }
    }

    fn check_domain(domain: &str, value: Option<&AttributeValue>) -> AttributeResult<()> {
        match value {
            None => check_pattern(domain, None),
            Some(AttributeValue::String(text)) => check_pattern(domain, Some(text)),
            Some(other) => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }
}

pub struct TextCodec;

impl ScalarCodec for TextCodec {
    const TYPE_NAME: &'static str = "text";
    const VALUE_TABLE: &'static str = "av_text";
    const COLUMN_TYPE: &'static str = "TEXT";
    const INLINE: bool = false;
    const CONDITIONS: Conditions = Conditions::APPROXIMATION;

    fn encode(value: &AttributeValue) -> AttributeResult<SqlValue> {
        match value {
            AttributeValue::Text(text) => Ok(SqlValue::Text(text.clone())),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn decode(value: SqlValue) -> AttributeResult<AttributeValue> {
        stored_text(Self::TYPE_NAME, value).map(AttributeValue::Text)
    }

    fn parse(text: &str) -> AttributeResult<AttributeValue> {
        Ok(AttributeValue::Text(text.to_string()))
    }

    fn format(value: &AttributeValue) -> AttributeResult<String> {
        match value {
            AttributeValue::Text(text) => Ok(text.clone()),
            other => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }

    fn coerce(raw: RawValue) -> AttributeResult<AttributeValue> {
        match raw {
            RawValue::Value(AttributeValue::Text(text) | AttributeValue::String(text)) => {
                Ok(AttributeValue::Text(text))
            }
            RawValue::Value(other) => Err(wrong_type(Self::TYPE_NAME, &other)),
            RawValue::Integer(number) => Ok(AttributeValue::Text(number.to_string())),
            RawValue::Boolean(flag) => Ok(AttributeValue::Text(flag.to_string())),
            RawValue::Text(text) => Ok(AttributeValue::Text(text)),
            RawValue::Null => Err(AttributeError::invalid("null is not a text")),
        }
    }

    fn check_domain(domain: &str, value: Option<&AttributeValue>) -> AttributeResult<()> {
        match value {
            None => check_pattern(domain, None),
            Some(AttributeValue::Text(text)) => check_pattern(domain, Some(text)),
            Some(other) => Err(wrong_type(Self::TYPE_NAME, other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{
        BooleanCodec, DecimalCodec, IntegerCodec, ScalarCodec, StringCodec, MAX_STRING_CHARS,
    };
    use crate::handler::AttributeError;
    use crate::model::value::{AttributeValue, RawValue};

    #[test]
    fn boolean_parses_common_spellings() {
        assert_eq!(
            BooleanCodec::parse("TRUE").unwrap(),
            AttributeValue::Boolean(true)
        );
        assert_eq!(BooleanCodec::parse("no").unwrap(), AttributeValue::Boolean(false));
        assert!(matches!(
            BooleanCodec::parse("nonsense"),
            Err(AttributeError::InvalidArgument(_))
        ));
        assert!(BooleanCodec::check_domain("", None).is_ok());
        assert!(BooleanCodec::check_domain("true", None).is_err());
    }

    #[test]
    fn integer_rejects_overflow() {
        assert!(IntegerCodec::coerce(RawValue::Integer(i64::from(i32::MAX) + 1)).is_err());
        assert_eq!(
            IntegerCodec::parse(" -12 ").unwrap(),
            AttributeValue::Integer(-12)
        );
    }

    #[test]
    fn integer_domain_bounds_values() {
        assert!(IntegerCodec::check_domain("1..10", Some(&AttributeValue::Integer(10))).is_ok());
        assert!(matches!(
            IntegerCodec::check_domain("1..10", Some(&AttributeValue::Integer(11))),
            Err(AttributeError::ConstraintViolation(_))
        ));
        assert!(matches!(
            IntegerCodec::check_domain("x..10", None),
            Err(AttributeError::InvalidArgument(_))
        ));
    }

    #[test]
    fn decimal_domain_compares_numerically() {
        let value = DecimalCodec::parse("9.5").unwrap();
        assert!(DecimalCodec::check_domain("0..10", Some(&value)).is_ok());
        assert!(DecimalCodec::check_domain("..9.25", Some(&value)).is_err());
    }

    #[test]
    fn string_enforces_limit_and_control_characters() {
        let long = "x".repeat(MAX_STRING_CHARS + 1);
        assert!(matches!(
            StringCodec::parse(&long),
            Err(AttributeError::InvalidArgument(_))
        ));
        assert!(StringCodec::parse(&"x".repeat(MAX_STRING_CHARS)).is_ok());
        assert!(StringCodec::parse("a\tb").is_ok());
        assert!(StringCodec::parse("a\nb").is_err());
    }

    #[test]
    fn string_domain_is_a_full_match_pattern() {
        let value = AttributeValue::String("ab12".to_string());
        assert!(StringCodec::check_domain("[a-z]+[0-9]+", Some(&value)).is_ok());
        assert!(StringCodec::check_domain("[a-z]+", Some(&value)).is_err());
    }
}
