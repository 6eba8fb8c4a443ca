// Copyright (c) tidedb.io 2025
// This file is licensed under the MIT

//! End-to-end tests of the eager execution path against a scripted
//! transport.

use std::{sync::Arc, time::Duration};

use serde_json::json;
use tidedb_query::{
	Cancellation, ExecuteErrorKind, Params, Query, QueryConfig, QueryCore, QueryStatus, Statement, ident, positional,
	select, wildcard,
};
use tidedb_testing::{MockTransport, ScriptedResponse, plan_response, rows_response, stale_plan_response};

fn core(transport: &Arc<MockTransport>) -> QueryCore {
	QueryCore::new(transport.clone())
}

#[tokio::test]
async fn test_execute_aggregates_rows_errors_and_metadata() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(r#"{"requestID":"r1","results":[{"item":"value"}],"errors":[],"status":"success","metrics":{"resultCount":1}}"#);

	let result = core(&transport)
		.execute(&Query::simple(Statement::raw("SELECT * FROM `default`")), &QueryConfig::default())
		.await
		.unwrap();

	assert_eq!(result.rows(), &[json!({"item": "value"})]);
	assert!(result.errors().is_empty());
	assert!(result.final_success());
	assert_eq!(result.metadata().request_id.as_deref(), Some("r1"));
	assert_eq!(result.metadata().status, Some(QueryStatus::Success));
	assert!(result.metadata().metrics.is_some());
}

#[tokio::test]
async fn test_success_status_with_informational_error_entry() {
	// The server can report overall success while still listing an entry
	// in the error sequence. Both signals must stay visible.
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(
		r#"{"requestID":"r2","results":[],"errors":[{"msg":"Primary index already exists"}],"status":"success"}"#,
	);

	let result = core(&transport)
		.execute(&Query::simple(Statement::raw("CREATE PRIMARY INDEX ON `default`")), &QueryConfig::default())
		.await
		.unwrap();

	assert!(result.final_success());
	assert_eq!(result.errors().len(), 1);
	assert_eq!(result.errors()[0].msg(), Some("Primary index already exists"));
	assert!(result.rows().is_empty());
}

#[tokio::test]
async fn test_prepare_then_execute_matches_literal_execution() {
	let transport = Arc::new(MockTransport::new());
	let rows = [json!({"item": 123})];
	transport.enqueue_document(&plan_response("p1"));
	transport.enqueue_document(&rows_response(&rows));
	transport.enqueue_document(&rows_response(&rows));

	let core = core(&transport);
	let statement = select([wildcard()]).from("default").filter(ident("item").eq(positional(1))).unwrap().build().unwrap();

	let plan = core.prepare(&statement, &QueryConfig::default()).await.unwrap();
	assert!(plan.signature().is_some());
	assert!(plan.operator().is_some());
	assert_eq!(core.plan_cache().len(), 1);

	let prepared = core
		.execute(&Query::prepared(plan.clone(), Params::positional([123])), &QueryConfig::default())
		.await
		.unwrap();
	assert!(prepared.final_success());

	let literal = core
		.execute(
			&Query::simple(Statement::raw("SELECT * FROM default WHERE item = 123")),
			&QueryConfig::default(),
		)
		.await
		.unwrap();

	assert_eq!(prepared.rows(), literal.rows());

	let requests = transport.requests();
	assert_eq!(requests.len(), 3);
	assert_eq!(requests[0]["statement"], json!("PREPARE SELECT * FROM default WHERE (item = $1)"));
	assert_eq!(requests[1]["prepared"]["name"], json!("p1"));
	assert_eq!(requests[1]["args"], json!([123]));
}

#[tokio::test]
async fn test_statement_with_cached_plan_runs_prepared() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(&plan_response("p1"));
	transport.enqueue_document(&rows_response(&[json!({"item": 123})]));

	let core = core(&transport);
	let statement = select([wildcard()]).from("default").filter(ident("item").eq(positional(1))).unwrap().build().unwrap();
	core.prepare(&statement, &QueryConfig::default()).await.unwrap();

	let hits_before = core.plan_cache().hits();
	core.execute(&Query::parameterized(statement, Params::positional([123])), &QueryConfig::default()).await.unwrap();

	assert_eq!(core.plan_cache().hits(), hits_before + 1);
	let requests = transport.requests();
	assert!(requests[1].get("prepared").is_some());
	assert!(requests[1].get("statement").is_none());
}

#[tokio::test]
async fn test_topology_change_clears_cache_and_falls_back_to_adhoc() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(&plan_response("p1"));
	transport.enqueue_document(&rows_response(&[]));

	let core = core(&transport);
	let statement = select([wildcard()]).from("default").build().unwrap();
	core.prepare(&statement, &QueryConfig::default()).await.unwrap();
	assert_eq!(core.plan_cache().len(), 1);

	core.topology_changed();
	assert!(core.plan_cache().is_empty());

	core.execute(&Query::simple(statement), &QueryConfig::default()).await.unwrap();
	let requests = transport.requests();
	assert_eq!(requests[1]["statement"], json!("SELECT * FROM default"));
	assert!(requests[1].get("prepared").is_none());
}

#[tokio::test]
async fn test_stale_plan_triggers_exactly_one_reprepare() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(&stale_plan_response());
	transport.enqueue_document(&plan_response("p2"));
	transport.enqueue_document(&rows_response(&[json!({"item": 123})]));

	let core = core(&transport);
	let plan = tidedb_query::ExecutionPlan::new(
		"SELECT * FROM default WHERE item = $1",
		json!({"name": "p1", "signature": {"*": "*"}, "operator": {"#operator": "Sequence"}}),
	);
	core.plan_cache().store(plan.clone());

	let result = core
		.execute(&Query::prepared(plan, Params::positional([123])), &QueryConfig::default())
		.await
		.unwrap();

	assert!(result.final_success());
	assert_eq!(result.rows().len(), 1);

	let requests = transport.requests();
	assert_eq!(requests.len(), 3);
	assert_eq!(requests[0]["prepared"]["name"], json!("p1"));
	assert_eq!(requests[1]["statement"], json!("PREPARE SELECT * FROM default WHERE item = $1"));
	assert_eq!(requests[2]["prepared"]["name"], json!("p2"));

	// The fresh plan replaced the stale cache entry.
	let cached = core.plan_cache().lookup("SELECT * FROM default WHERE item = $1").unwrap();
	assert_eq!(cached.name(), Some("p2"));
}

#[tokio::test]
async fn test_second_stale_plan_surfaces_without_third_attempt() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(&stale_plan_response());
	transport.enqueue_document(&plan_response("p2"));
	transport.enqueue_document(&stale_plan_response());

	let core = core(&transport);
	let plan = tidedb_query::ExecutionPlan::new("SELECT * FROM default WHERE item = $1", json!({"name": "p1"}));

	let err = core
		.execute(&Query::prepared(plan, Params::positional([123])), &QueryConfig::default())
		.await
		.unwrap_err();

	assert_eq!(err.kind, ExecuteErrorKind::StalePlan);
	assert!(err.partial.errors()[0].is_stale_plan());
	assert_eq!(transport.request_count(), 3);
}

#[tokio::test]
async fn test_unbound_placeholder_fails_before_any_request() {
	let transport = Arc::new(MockTransport::new());
	let err = core(&transport)
		.execute(
			&Query::parameterized(Statement::raw("SELECT * FROM t WHERE a = $1"), Params::None),
			&QueryConfig::default(),
		)
		.await
		.unwrap_err();

	assert!(matches!(err.kind, ExecuteErrorKind::Encode(_)));
	assert_eq!(transport.request_count(), 0);
}

#[tokio::test]
async fn test_named_parameters_reach_the_wire() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(&rows_response(&[]));

	core(&transport)
		.execute(
			&Query::parameterized(
				Statement::raw("SELECT * FROM t WHERE item = $item"),
				Params::named([("item", json!(123))]),
			),
			&QueryConfig::default(),
		)
		.await
		.unwrap();

	assert_eq!(transport.requests()[0]["$item"], json!(123));
}

#[tokio::test]
async fn test_transport_failure_carries_partial_result() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue(
		ScriptedResponse::new()
			.chunk(&br#"{"requestID":"r9","results":[{"a":1}],"#[..])
			.error(tidedb_query::TransportError::Io("connection reset".to_string())),
	);

	let err = core(&transport)
		.execute(&Query::simple(Statement::raw("SELECT 1")), &QueryConfig::default())
		.await
		.unwrap_err();

	assert!(matches!(err.kind, ExecuteErrorKind::Transport(_)));
	assert_eq!(err.partial.rows(), &[json!({"a": 1})]);
	assert_eq!(err.partial.metadata().request_id.as_deref(), Some("r9"));
}

#[tokio::test]
async fn test_truncated_response_is_a_parse_failure() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue(ScriptedResponse::new().chunk(&br#"{"results":[{"a":1}"#[..]));

	let err = core(&transport)
		.execute(&Query::simple(Statement::raw("SELECT 1")), &QueryConfig::default())
		.await
		.unwrap_err();

	assert!(matches!(err.kind, ExecuteErrorKind::Parse(_)));
}

#[tokio::test(start_paused = true)]
async fn test_timeout_fails_with_partial_progress() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue(
		ScriptedResponse::new()
			.chunk(&br#"{"results":[{"a":1}],"#[..])
			.delay(Duration::from_secs(3600))
			.chunk(&br#""status":"success"}"#[..]),
	);

	let config = QueryConfig::default().with_timeout(Duration::from_millis(100));
	let err = core(&transport)
		.execute(&Query::simple(Statement::raw("SELECT 1")), &config)
		.await
		.unwrap_err();

	assert_eq!(err.kind, ExecuteErrorKind::Timeout);
	assert_eq!(err.partial.rows(), &[json!({"a": 1})]);
	assert_eq!(transport.open_streams(), 0);
}

#[tokio::test]
async fn test_pre_cancelled_execution_delivers_nothing() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue_document(&rows_response(&[json!({"a": 1})]));

	let cancellation = Cancellation::new();
	cancellation.cancel();
	let config = QueryConfig::default().with_cancellation(cancellation);

	let err = core(&transport)
		.execute(&Query::simple(Statement::raw("SELECT 1")), &config)
		.await
		.unwrap_err();

	assert_eq!(err.kind, ExecuteErrorKind::Cancelled);
	assert!(err.partial.rows().is_empty());
	assert_eq!(transport.open_streams(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_mid_stream_releases_resources() {
	let transport = Arc::new(MockTransport::new());
	transport.enqueue(
		ScriptedResponse::new()
			.chunk(&br#"{"results":[{"a":1}],"#[..])
			.delay(Duration::from_secs(3600))
			.chunk(&br#""status":"success"}"#[..]),
	);

	let cancellation = Cancellation::new();
	let config = QueryConfig::default().with_cancellation(cancellation.clone());
	let core = core(&transport);

	let canceller = tokio::spawn({
		let cancellation = cancellation.clone();
		async move {
			tokio::time::sleep(Duration::from_millis(50)).await;
			cancellation.cancel();
		}
	});

	let err = core.execute(&Query::simple(Statement::raw("SELECT 1")), &config).await.unwrap_err();
	canceller.await.unwrap();

	assert_eq!(err.kind, ExecuteErrorKind::Cancelled);
	assert_eq!(err.partial.rows(), &[json!({"a": 1})]);
	assert_eq!(transport.open_streams(), 0);
}

#[tokio::test]
async fn test_chunk_fragmentation_does_not_change_the_result() {
	let doc = rows_response(&[json!({"item": "value"}), json!({"item": 123})]);

	let whole = {
		let transport = Arc::new(MockTransport::new());
		transport.enqueue_document(&doc);
		core(&transport).execute(&Query::simple(Statement::raw("SELECT 1")), &QueryConfig::default()).await.unwrap()
	};

	for at in [1, doc.len() / 3, doc.len() / 2, doc.len() - 1] {
		let transport = Arc::new(MockTransport::new());
		transport.enqueue(ScriptedResponse::split_document(&doc, at));
		let split =
			core(&transport).execute(&Query::simple(Statement::raw("SELECT 1")), &QueryConfig::default()).await.unwrap();
		assert_eq!(split, whole, "split at byte {}", at);
	}
}
