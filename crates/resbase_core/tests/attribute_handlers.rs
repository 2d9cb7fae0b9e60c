use resbase_core::db::open_db_in_memory;
use resbase_core::handler::{AttributeHandlerRegistry, HandlerContext, MAX_STRING_CHARS};
use resbase_core::model::value::date_from_millis;
use resbase_core::{
    AttributeError, AttributeHandler, AttributeValue, DateRange, Decimal, ParameterBag, RawValue,
    ValueId,
};
use rusqlite::Connection;
use std::sync::Arc;

fn handler(type_name: &str) -> Arc<dyn AttributeHandler> {
    AttributeHandlerRegistry::builtin(HandlerContext::default())
        .instantiate(type_name)
        .unwrap()
}

fn stored_boolean(conn: &Connection, id: ValueId) -> i64 {
    conn.query_row(
        "SELECT value FROM av_boolean WHERE value_id = ?1;",
        [id.get()],
        |row| row.get(0),
    )
    .unwrap()
}

#[test]
fn boolean_true_is_stored_as_one() {
    let conn = open_db_in_memory().unwrap();
    let boolean = handler("boolean");

    let id = boolean.create(&conn, &AttributeValue::Boolean(true)).unwrap();

    assert!(id.is_stored());
    assert_eq!(stored_boolean(&conn, id), 1);
    assert_eq!(
        boolean.retrieve(&conn, id).unwrap(),
        AttributeValue::Boolean(true)
    );
}

#[test]
fn boolean_text_conversion_accepts_true_and_rejects_garbage() {
    let conn = open_db_in_memory().unwrap();
    let boolean = handler("boolean");

    assert_eq!(
        boolean.to_attribute_value(&conn, "true".into()).unwrap(),
        Some(AttributeValue::Boolean(true))
    );
    assert!(matches!(
        boolean.to_attribute_value(&conn, "nonsense".into()),
        Err(AttributeError::InvalidArgument(_))
    ));
    assert_eq!(boolean.to_attribute_value(&conn, RawValue::Null).unwrap(), None);
}

#[test]
fn values_round_trip_through_their_side_tables() {
    let conn = open_db_in_memory().unwrap();
    let date = date_from_millis(1_700_000_000_123).unwrap();
    let cases = vec![
        ("integer", AttributeValue::Integer(-42)),
        ("long", AttributeValue::Long(9_000_000_000)),
        ("decimal", AttributeValue::Decimal(Decimal::parse("12.50").unwrap())),
        ("date", AttributeValue::Date(date)),
        ("string", AttributeValue::String("hello".to_string())),
        ("text", AttributeValue::Text("line one\nline two".to_string())),
        (
            "date_range",
            AttributeValue::DateRange(DateRange::new(Some(date), None).unwrap()),
        ),
        (
            "parameters",
            AttributeValue::Parameters([("color", "red"), ("size", "xl")].into_iter().collect::<ParameterBag>()),
        ),
    ];

    for (type_name, value) in cases {
        let handler = handler(type_name);
        let id = handler.create(&conn, &value).unwrap();
        assert_eq!(handler.retrieve(&conn, id).unwrap(), value, "{type_name}");
    }
}

#[test]
fn update_replaces_the_stored_value() {
    let conn = open_db_in_memory().unwrap();
    let string = handler("string");

    let id = string
        .create(&conn, &AttributeValue::String("draft".to_string()))
        .unwrap();
    string
        .update(&conn, id, &AttributeValue::String("final".to_string()))
        .unwrap();

    assert_eq!(
        string.retrieve(&conn, id).unwrap(),
        AttributeValue::String("final".to_string())
    );
}

#[test]
fn fixed_length_string_over_the_limit_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let string = handler("string");

    let exact = "a".repeat(MAX_STRING_CHARS);
    assert!(string.to_attribute_value(&conn, exact.as_str().into()).is_ok());

    let too_long = "a".repeat(MAX_STRING_CHARS + 1);
    assert!(matches!(
        string.to_attribute_value(&conn, too_long.into()),
        Err(AttributeError::InvalidArgument(_))
    ));
    let count: i64 = conn
        .query_row("SELECT COUNT(*) FROM av_string;", [], |row| row.get(0))
        .unwrap();
    assert_eq!(count, 0);
}

#[test]
fn missing_value_ids_report_entity_not_found() {
    let conn = open_db_in_memory().unwrap();
    let integer = handler("integer");
    let missing = ValueId(4_242);

    assert!(matches!(
        integer.retrieve(&conn, missing),
        Err(AttributeError::EntityNotFound { .. })
    ));
    assert!(matches!(
        integer.update(&conn, missing, &AttributeValue::Integer(1)),
        Err(AttributeError::EntityNotFound { .. })
    ));
    assert!(matches!(
        integer.delete(&conn, missing),
        Err(AttributeError::EntityNotFound { .. })
    ));
}

#[test]
fn delete_removes_the_value_row() {
    let conn = open_db_in_memory().unwrap();
    let long = handler("long");

    let id = long.create(&conn, &AttributeValue::Long(7)).unwrap();
    long.delete(&conn, id).unwrap();

    assert!(long.retrieve(&conn, id).unwrap_err().is_not_found());
}

#[test]
fn activation_preloads_existing_rows() {
    let conn = open_db_in_memory().unwrap();
    let writer = handler("integer");
    let first = writer.create(&conn, &AttributeValue::Integer(1)).unwrap();
    writer.create(&conn, &AttributeValue::Integer(2)).unwrap();

    let reader = handler("integer");
    assert_eq!(reader.activate(&conn).unwrap(), 2);
    assert_eq!(
        reader.retrieve(&conn, first).unwrap(),
        AttributeValue::Integer(1)
    );

    let created = reader.create(&conn, &AttributeValue::Integer(3)).unwrap();
    assert_eq!(
        reader.retrieve(&conn, created).unwrap(),
        AttributeValue::Integer(3)
    );
}

#[test]
fn rolled_back_creates_do_not_survive_in_the_preload() {
    let conn = open_db_in_memory().unwrap();
    let integer = handler("integer");
    assert_eq!(integer.activate(&conn).unwrap(), 0);

    conn.execute_batch("BEGIN;").unwrap();
    let number = integer.create(&conn, &AttributeValue::Integer(41)).unwrap();
    assert_eq!(
        integer.retrieve(&conn, number).unwrap(),
        AttributeValue::Integer(41)
    );
    conn.execute_batch("ROLLBACK;").unwrap();

    assert!(integer.retrieve(&conn, number).unwrap_err().is_not_found());
}

#[test]
fn committed_reads_are_served_from_the_preload() {
    let conn = open_db_in_memory().unwrap();
    let integer = handler("integer");
    integer.activate(&conn).unwrap();
    let id = integer.create(&conn, &AttributeValue::Integer(8)).unwrap();
    assert_eq!(integer.retrieve(&conn, id).unwrap(), AttributeValue::Integer(8));

    conn.execute("DELETE FROM av_integer WHERE value_id = ?1;", [id.get()])
        .unwrap();

    assert_eq!(integer.retrieve(&conn, id).unwrap(), AttributeValue::Integer(8));
}

#[test]
fn domains_are_validated_before_values() {
    let conn = open_db_in_memory().unwrap();
    let integer = handler("integer");

    assert!(matches!(
        integer.check_domain(&conn, "1..5", Some(&AttributeValue::Integer(9))),
        Err(AttributeError::ConstraintViolation(_))
    ));
    assert!(matches!(
        integer.check_domain(&conn, "x..10", None),
        Err(AttributeError::InvalidArgument(_))
    ));
    assert!(integer
        .check_domain(&conn, "1..5", Some(&AttributeValue::Integer(5)))
        .is_ok());
}
