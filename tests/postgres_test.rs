//! Decode and cancel behaviour against a live Postgres.
//!
//! Every test returns early unless `DATABASE_URL` is set.

use analytics_dataplane::db::{PostgresBackend, PostgresConfig};
use analytics_dataplane::execution::{QueryExecutor, QUERY_CANCELED};
use analytics_dataplane::types::BaseType;
use analytics_dataplane::{FieldType, QueryConfig, Value};
use chrono::{NaiveDate, NaiveTime, TimeZone, Utc};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use std::time::{Duration, Instant};

async fn executor(max_connections: u32) -> Option<QueryExecutor> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        eprintln!("DATABASE_URL is not set, skipping");
        return None;
    };
    let config = PostgresConfig {
        url: Some(url),
        ..Default::default()
    };
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect_with(config.connect_options().unwrap())
        .await
        .unwrap();
    Some(QueryExecutor::new(
        Arc::new(PostgresBackend::new(pool)),
        &QueryConfig {
            max_concurrent_queries: 4,
        },
    ))
}

fn field_types(result: &analytics_dataplane::QueryResult) -> Vec<FieldType> {
    result.columns().iter().map(|c| c.field_type).collect()
}

#[tokio::test]
async fn test_mapped_scalar_types() {
    let Some(executor) = executor(2).await else {
        return;
    };
    let sql = r#"SELECT 'a'::text AS s, 7::int2 AS i2, 42::int4 AS i4, 9000000000::int8 AS i8,
        1.5::float4 AS f4, 0.25::float8 AS f8, 12.5::numeric AS n, true AS b,
        DATE '2023-11-14' AS d, TIME '22:13:20' AS t,
        TIMESTAMP '2023-11-14 22:13:20' AS ts, TIMESTAMPTZ '2023-11-14 22:13:20+00' AS tstz,
        '\x0102'::bytea AS bin, '{"k": "v"}'::jsonb AS m, '{"a":1}'::json AS j"#;

    let result = executor.execute_raw(sql).get_result().await;
    assert!(!result.is_failed(), "{:?}", result.error());
    assert_eq!(
        field_types(&result),
        vec![
            FieldType::STRING,
            FieldType::INTEGER,
            FieldType::INTEGER,
            FieldType::LONG,
            FieldType::DOUBLE,
            FieldType::DOUBLE,
            FieldType::DECIMAL,
            FieldType::BOOLEAN,
            FieldType::DATE,
            FieldType::TIME,
            FieldType::TIMESTAMP,
            FieldType::TIMESTAMP,
            FieldType::BINARY,
            FieldType::Map(BaseType::String),
            FieldType::STRING,
        ]
    );

    let ts = Utc.with_ymd_and_hms(2023, 11, 14, 22, 13, 20).unwrap();
    let row = &result.rows()[0];
    assert_eq!(row[0], Value::String("a".to_string()));
    assert_eq!(row[1], Value::Integer(7));
    assert_eq!(row[2], Value::Integer(42));
    assert_eq!(row[3], Value::Long(9_000_000_000));
    assert_eq!(row[4], Value::Double(1.5));
    assert_eq!(row[5], Value::Double(0.25));
    assert_eq!(row[6], Value::Decimal(12.5));
    assert_eq!(row[7], Value::Boolean(true));
    assert_eq!(row[8], Value::Date(NaiveDate::from_ymd_opt(2023, 11, 14).unwrap()));
    assert_eq!(row[9], Value::Time(NaiveTime::from_hms_opt(22, 13, 20).unwrap()));
    assert_eq!(row[10], Value::Timestamp(ts));
    assert_eq!(row[11], Value::Timestamp(ts));
    assert_eq!(row[12], Value::Binary(vec![1, 2]));
    assert!(matches!(&row[13], Value::Map(map) if map["k"] == Value::String("v".to_string())));
    assert_eq!(row[14], Value::String(r#"{"a":1}"#.to_string()));
}

#[tokio::test]
async fn test_nulls_decode_as_null() {
    let Some(executor) = executor(2).await else {
        return;
    };
    let result = executor
        .execute_raw("SELECT NULL::int4 AS i, NULL::text AS s, NULL::numeric[] AS xs")
        .get_result()
        .await;
    assert!(!result.is_failed(), "{:?}", result.error());
    assert_eq!(result.rows(), &[vec![Value::Null, Value::Null, Value::Null]]);
}

#[tokio::test]
async fn test_array_types() {
    let Some(executor) = executor(2).await else {
        return;
    };
    let result = executor
        .execute_raw(
            "SELECT ARRAY[1.5, 2.25]::numeric[] AS n, ARRAY[1, NULL]::int4[] AS i, ARRAY['a', 'b']::text[] AS s",
        )
        .get_result()
        .await;
    assert!(!result.is_failed(), "{:?}", result.error());
    assert_eq!(
        field_types(&result),
        vec![
            FieldType::Array(BaseType::Decimal),
            FieldType::Array(BaseType::Integer),
            FieldType::Array(BaseType::String),
        ]
    );
    assert_eq!(
        result.rows()[0],
        vec![
            Value::Array(vec![Value::Decimal(1.5), Value::Decimal(2.25)]),
            Value::Array(vec![Value::Integer(1), Value::Null]),
            Value::Array(vec![Value::String("a".to_string()), Value::String("b".to_string())]),
        ]
    );
}

#[tokio::test]
async fn test_unmapped_types_keep_their_text() {
    let Some(executor) = executor(2).await else {
        return;
    };
    let sql = "SELECT '1 day'::interval AS i, 'pg_class'::regclass::oid AS o, '10.0.0.1'::inet AS a, \
               42::int4 AS n, true AS b, DATE '2023-11-14' AS d, ARRAY[1.5]::numeric[] AS xs";

    let result = executor.execute_raw(sql).get_result().await;
    assert!(!result.is_failed(), "{:?}", result.error());
    assert_eq!(
        field_types(&result)[..4],
        [FieldType::STRING, FieldType::STRING, FieldType::STRING, FieldType::INTEGER]
    );
    assert_eq!(
        result.rows()[0],
        vec![
            Value::String("1 day".to_string()),
            Value::String("1259".to_string()),
            Value::String("10.0.0.1".to_string()),
            Value::Integer(42),
            Value::Boolean(true),
            Value::Date(NaiveDate::from_ymd_opt(2023, 11, 14).unwrap()),
            Value::Array(vec![Value::Decimal(1.5)]),
        ]
    );
}

#[tokio::test]
async fn test_syntax_error_carries_sql_state() {
    let Some(executor) = executor(2).await else {
        return;
    };
    let result = executor.execute_raw("SELECT * FORM t").get_result().await;
    let error = result.error().unwrap();
    assert_eq!(error.sql_state.as_deref(), Some("42601"));
    assert_eq!(error.error_line, Some(1));
}

#[tokio::test]
async fn test_kill_with_every_pooled_connection_busy() {
    let Some(executor) = executor(1).await else {
        return;
    };
    let started = Instant::now();
    let execution = executor.execute_raw("SELECT pg_sleep(3)");
    tokio::time::sleep(Duration::from_millis(300)).await;

    execution.kill().await;
    assert!(started.elapsed() < Duration::from_secs(2));

    let result = execution.get_result().await;
    assert_eq!(result.error().unwrap().sql_state.as_deref(), Some(QUERY_CANCELED));
    assert!(started.elapsed() < Duration::from_millis(2500));
}
